//! Model catalog
//!
//! Static registry of every model the deployment knows about. Descriptors are
//! built once from configuration and never mutated afterwards; runtime state
//! (load state, error counts, timings) is owned by the lifecycle manager.

use crate::error::{ManagerError, ManagerResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Fidelity level a model can be loaded at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Base,
    #[default]
    Optimized,
    Minimum,
}

impl MemoryTier {
    /// Tiers ordered from highest to lowest fidelity
    pub const ALL: [MemoryTier; 3] = [MemoryTier::Base, MemoryTier::Optimized, MemoryTier::Minimum];

    /// This tier followed by every lower-fidelity tier
    pub fn and_lower(self) -> &'static [MemoryTier] {
        match self {
            MemoryTier::Base => &Self::ALL,
            MemoryTier::Optimized => &Self::ALL[1..],
            MemoryTier::Minimum => &Self::ALL[2..],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::Base => "base",
            MemoryTier::Optimized => "optimized",
            MemoryTier::Minimum => "minimum",
        }
    }
}

impl std::fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory footprint (GB) of each tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryTiers {
    pub base: f64,
    pub optimized: f64,
    pub minimum: f64,
}

impl MemoryTiers {
    pub fn gb(&self, tier: MemoryTier) -> f64 {
        match tier {
            MemoryTier::Base => self.base,
            MemoryTier::Optimized => self.optimized,
            MemoryTier::Minimum => self.minimum,
        }
    }
}

/// Serving targets advertised to the inference server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceTargets {
    pub target_latency_ms: u64,
    pub max_tokens_per_request: u32,
    pub max_concurrent_requests: u32,
}

impl Default for PerformanceTargets {
    fn default() -> Self {
        Self {
            target_latency_ms: 2000,
            max_tokens_per_request: 2048,
            max_concurrent_requests: 4,
        }
    }
}

/// A servable model known to the deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique catalog key
    pub id: String,
    /// Upstream artifact identifier (e.g. "Qwen/Qwen2.5-7B-Instruct")
    pub source_name: String,
    #[serde(default)]
    pub display_name: String,
    pub memory_tiers: MemoryTiers,
    #[serde(default)]
    pub content_affinities: BTreeSet<String>,
    /// Lower values are kept loaded longer and evicted last
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub performance_targets: PerformanceTargets,
}

impl ModelDescriptor {
    pub fn has_affinity(&self, tag: &str) -> bool {
        self.content_affinities.contains(tag)
    }

    pub fn display_name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }

    fn validate(&self) -> ManagerResult<()> {
        if self.id.is_empty() {
            return Err(ManagerError::Config("Model id cannot be empty".into()));
        }
        if self.id.contains('/') || self.id.contains('\\') {
            return Err(ManagerError::Config(format!(
                "Model id '{}' cannot contain path separators",
                self.id
            )));
        }
        if self.id.starts_with('.') {
            return Err(ManagerError::Config(format!(
                "Model id '{}' cannot start with '.'",
                self.id
            )));
        }
        if self.source_name.is_empty() {
            return Err(ManagerError::Config(format!(
                "Model '{}' has an empty source_name",
                self.id
            )));
        }

        let tiers = &self.memory_tiers;
        if MemoryTier::ALL
            .iter()
            .any(|t| !(tiers.gb(*t).is_finite() && tiers.gb(*t) > 0.0))
        {
            return Err(ManagerError::Config(format!(
                "Model '{}' memory tiers must be positive",
                self.id
            )));
        }
        if !(tiers.minimum <= tiers.optimized && tiers.optimized <= tiers.base) {
            return Err(ManagerError::Config(format!(
                "Model '{}' memory tiers must satisfy minimum <= optimized <= base",
                self.id
            )));
        }

        Ok(())
    }
}

/// Read-only registry of model descriptors
#[derive(Debug, Default)]
pub struct ModelCatalog {
    models: HashMap<String, Arc<ModelDescriptor>>,
    /// Ascending priority, ties broken by id
    by_priority: Vec<Arc<ModelDescriptor>>,
}

impl ModelCatalog {
    /// Build a catalog, rejecting duplicate or malformed descriptors
    pub fn new(descriptors: Vec<ModelDescriptor>) -> ManagerResult<Self> {
        let mut models = HashMap::with_capacity(descriptors.len());

        for descriptor in descriptors {
            descriptor.validate()?;
            if models.contains_key(&descriptor.id) {
                return Err(ManagerError::Config(format!(
                    "Duplicate model id: {}",
                    descriptor.id
                )));
            }
            models.insert(descriptor.id.clone(), Arc::new(descriptor));
        }

        let mut by_priority: Vec<_> = models.values().cloned().collect();
        by_priority.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        tracing::debug!(models = models.len(), "Model catalog built");

        Ok(Self {
            models,
            by_priority,
        })
    }

    pub fn get(&self, id: &str) -> ManagerResult<Arc<ModelDescriptor>> {
        self.models
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    /// Models suited to `tag`, most protected first
    pub fn list_by_content_affinity(&self, tag: &str) -> Vec<Arc<ModelDescriptor>> {
        self.by_priority
            .iter()
            .filter(|m| m.has_affinity(tag))
            .cloned()
            .collect()
    }

    /// All models, most protected (lowest priority number) first
    pub fn list_by_priority(&self) -> Vec<Arc<ModelDescriptor>> {
        self.by_priority.clone()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn descriptor(id: &str, priority: i32, tags: &[&str], tiers: (f64, f64, f64)) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        source_name: format!("org/{}", id),
        display_name: String::new(),
        memory_tiers: MemoryTiers {
            base: tiers.0,
            optimized: tiers.1,
            minimum: tiers.2,
        },
        content_affinities: tags.iter().map(|t| t.to_string()).collect(),
        priority,
        performance_targets: PerformanceTargets::default(),
    }
}
