//! Serving-engine boundary
//!
//! The lifecycle manager decides *when* a model becomes resident; a
//! [`ModelBackend`] does the actual loading. The shipped
//! [`ArtifactCheckBackend`] checks that an artifact is consumable (parses
//! `config.json`, requires a weight file) and tracks residency, which is all
//! a manager without an embedded engine needs.

use super::catalog::{MemoryTier, ModelDescriptor};
use super::metadata::CacheEntry;
use crate::error::{ManagerError, ManagerResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File extensions recognised as model weights
const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "bin", "gguf", "onnx"];

/// Loads and unloads models in the serving engine
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Make the model resident at `tier` using the cached artifact
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        artifact: &CacheEntry,
        tier: MemoryTier,
    ) -> ManagerResult<ArtifactMetadata>;

    async fn unload(&self, descriptor: &ModelDescriptor) -> ManagerResult<()>;
}

/// Model metadata extracted from an artifact's config.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ArtifactMetadata {
    /// Model architecture type (e.g., "llama", "mistral", "bert")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_size: Option<u32>,

    /// Maximum sequence length
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_position_embeddings: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_size: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_hidden_layers: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_attention_heads: Option<u32>,

    /// Weight files found in the artifact
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weight_files: Vec<String>,
}

/// Raw config.json structure (partial)
#[derive(Debug, Deserialize)]
struct RawConfig {
    model_type: Option<String>,
    hidden_size: Option<u32>,
    max_position_embeddings: Option<u32>,
    vocab_size: Option<u32>,
    num_hidden_layers: Option<u32>,
    num_attention_heads: Option<u32>,
    // GPT-2 style names
    d_model: Option<u32>,
    n_positions: Option<u32>,
    n_layer: Option<u32>,
    n_head: Option<u32>,
}

/// Parse model metadata from an artifact directory's config.json
///
/// Returns `None` if config.json is missing or is not valid JSON.
pub fn parse_model_config(artifact_dir: &Path) -> Option<ArtifactMetadata> {
    let content = std::fs::read_to_string(artifact_dir.join("config.json")).ok()?;
    let raw: RawConfig = serde_json::from_str(&content).ok()?;

    Some(ArtifactMetadata {
        model_type: raw.model_type,
        hidden_size: raw.hidden_size.or(raw.d_model),
        max_position_embeddings: raw.max_position_embeddings.or(raw.n_positions),
        vocab_size: raw.vocab_size,
        num_hidden_layers: raw.num_hidden_layers.or(raw.n_layer),
        num_attention_heads: raw.num_attention_heads.or(raw.n_head),
        weight_files: Vec::new(),
    })
}

/// Rough transformer parameter count from model metadata
pub fn estimate_parameters(metadata: &ArtifactMetadata) -> Option<u64> {
    let hidden = metadata.hidden_size? as u64;
    let layers = metadata.num_hidden_layers? as u64;
    let vocab = metadata.vocab_size? as u64;

    // Embedding plus 12 * hidden^2 per layer (attention and FFN)
    Some(vocab * hidden + layers * 12 * hidden * hidden)
}

fn is_weight_file(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| WEIGHT_EXTENSIONS.contains(&ext))
}

/// Backend that validates artifacts and tracks which models are resident
#[derive(Default)]
pub struct ArtifactCheckBackend {
    resident: DashMap<String, (MemoryTier, ArtifactMetadata)>,
}

impl ArtifactCheckBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_resident(&self, model_id: &str) -> bool {
        self.resident.contains_key(model_id)
    }

    pub fn resident_tier(&self, model_id: &str) -> Option<MemoryTier> {
        self.resident.get(model_id).map(|r| r.0)
    }
}

#[async_trait]
impl ModelBackend for ArtifactCheckBackend {
    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        artifact: &CacheEntry,
        tier: MemoryTier,
    ) -> ManagerResult<ArtifactMetadata> {
        let dir = artifact.path.clone();
        let parsed = tokio::task::spawn_blocking(move || parse_model_config(&dir))
            .await
            .map_err(|e| ManagerError::Internal(e.to_string()))?;

        let mut metadata = parsed.ok_or_else(|| ManagerError::Backend {
            model_id: descriptor.id.clone(),
            reason: "config.json is missing or not valid JSON".to_string(),
        })?;

        metadata.weight_files = artifact
            .files
            .iter()
            .map(|f| f.path.clone())
            .filter(|p| is_weight_file(p))
            .collect();
        if metadata.weight_files.is_empty() {
            return Err(ManagerError::Backend {
                model_id: descriptor.id.clone(),
                reason: format!(
                    "no weight file found (expected one of: {})",
                    WEIGHT_EXTENSIONS.join(", ")
                ),
            });
        }

        tracing::debug!(
            model_id = %descriptor.id,
            tier = %tier,
            model_type = ?metadata.model_type,
            parameters = ?estimate_parameters(&metadata),
            "Artifact accepted by backend"
        );

        self.resident
            .insert(descriptor.id.clone(), (tier, metadata.clone()));
        Ok(metadata)
    }

    async fn unload(&self, descriptor: &ModelDescriptor) -> ManagerResult<()> {
        self.resident.remove(&descriptor.id);
        Ok(())
    }
}
