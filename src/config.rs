//! Configuration structures and loading logic

use crate::error::ManagerResult;
use crate::lifecycle::LifecycleConfig;
use crate::models::{
    ArtifactSource, CacheLayout, DownloadConfig, HubSource, MemoryTier, MirrorSource,
    ModelCatalog, ModelDescriptor,
};
use crate::budget::gb_to_bytes;
use crate::models::cache::is_safe_relative_path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Prefix of every environment override
const ENV_PREFIX: &str = "MODEL_MANAGER_";

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    pub api_port: u16,
    pub cache_root: PathBuf,
    /// Memory available for loaded models; detected from nvidia-smi when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_memory_gb: Option<f64>,
    /// Fraction of total memory the manager may charge
    pub safety_threshold: f64,
    pub max_cache_gb: f64,
    pub cleanup_age_days: u32,
    pub cleanup_interval_secs: u64,
    pub max_concurrent_downloads: usize,
    pub preferred_tier: MemoryTier,
    pub max_consecutive_errors: u32,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub chunk_size_bytes: usize,
    pub progress_interval_ms: u64,
    /// A transfer that receives no bytes for this long is retried
    pub transfer_idle_timeout_secs: u64,
    /// Recompute artifact fingerprints on every cache hit
    pub verify_on_access: bool,
    /// Marker files every cached artifact must contain
    pub required_files: Vec<String>,
    pub upstream: UpstreamConfig,
    /// Models loaded at startup, in order
    pub preload: Vec<String>,
    pub models: Vec<ModelDescriptor>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            cache_root: default_cache_root(),
            total_memory_gb: None,
            safety_threshold: 0.85,
            max_cache_gb: 100.0,
            cleanup_age_days: 30,
            cleanup_interval_secs: 3600,
            max_concurrent_downloads: 2,
            preferred_tier: MemoryTier::Optimized,
            max_consecutive_errors: 3,
            max_retries: 3,
            retry_base_delay_ms: 500,
            chunk_size_bytes: 8 * 1024 * 1024,
            progress_interval_ms: 500,
            transfer_idle_timeout_secs: 60,
            verify_on_access: true,
            required_files: vec!["config.json".to_string()],
            upstream: UpstreamConfig::default(),
            preload: Vec::new(),
            models: Vec::new(),
        }
    }
}

/// Where artifacts are fetched from
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamConfig {
    /// Hugging Face Hub, or any server speaking its API
    Hub {
        #[serde(default = "default_hub_endpoint")]
        endpoint: String,
    },
    /// Local or network-mounted directory with one sub-directory per source name
    Mirror { path: PathBuf },
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig::Hub {
            endpoint: default_hub_endpoint(),
        }
    }
}

impl UpstreamConfig {
    /// Source for this upstream; `read_timeout` bounds each read of a response body
    pub fn build(&self, read_timeout: Duration) -> ManagerResult<Arc<dyn ArtifactSource>> {
        Ok(match self {
            UpstreamConfig::Hub { endpoint } => Arc::new(HubSource::new(endpoint, read_timeout)?),
            UpstreamConfig::Mirror { path } => Arc::new(MirrorSource::new(path)),
        })
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `MODEL_MANAGER_*` overrides from `lookup`
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(port) = var("API_PORT") {
            self.api_port = port.parse().context("Invalid MODEL_MANAGER_API_PORT value")?;
        }
        if let Some(root) = var("CACHE_ROOT") {
            self.cache_root = PathBuf::from(root);
        }
        if let Some(total) = var("TOTAL_MEMORY_GB") {
            self.total_memory_gb = Some(
                total
                    .parse()
                    .context("Invalid MODEL_MANAGER_TOTAL_MEMORY_GB value")?,
            );
        }
        if let Some(threshold) = var("SAFETY_THRESHOLD") {
            self.safety_threshold = threshold
                .parse()
                .context("Invalid MODEL_MANAGER_SAFETY_THRESHOLD value")?;
        }
        if let Some(max) = var("MAX_CACHE_GB") {
            self.max_cache_gb = max.parse().context("Invalid MODEL_MANAGER_MAX_CACHE_GB value")?;
        }
        if let Some(days) = var("CLEANUP_AGE_DAYS") {
            self.cleanup_age_days = days
                .parse()
                .context("Invalid MODEL_MANAGER_CLEANUP_AGE_DAYS value")?;
        }
        if let Some(downloads) = var("MAX_CONCURRENT_DOWNLOADS") {
            self.max_concurrent_downloads = downloads
                .parse()
                .context("Invalid MODEL_MANAGER_MAX_CONCURRENT_DOWNLOADS value")?;
        }
        if let Some(path) = var("MIRROR_PATH") {
            self.upstream = UpstreamConfig::Mirror {
                path: PathBuf::from(path),
            };
        }
        if let Some(endpoint) = var("HUB_ENDPOINT") {
            self.upstream = UpstreamConfig::Hub { endpoint };
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }

        if let Some(total) = self.total_memory_gb
            && !(total.is_finite() && total > 0.0)
        {
            anyhow::bail!("total_memory_gb must be positive (got {})", total);
        }
        if !(self.safety_threshold > 0.0 && self.safety_threshold <= 1.0) {
            anyhow::bail!(
                "safety_threshold must be in (0, 1] (got {})",
                self.safety_threshold
            );
        }
        if !(self.max_cache_gb.is_finite() && self.max_cache_gb > 0.0) {
            anyhow::bail!("max_cache_gb must be positive (got {})", self.max_cache_gb);
        }
        if self.max_concurrent_downloads == 0 {
            anyhow::bail!("max_concurrent_downloads must be at least 1");
        }
        if self.chunk_size_bytes == 0 {
            anyhow::bail!("chunk_size_bytes must be at least 1");
        }
        if self.max_consecutive_errors == 0 {
            anyhow::bail!("max_consecutive_errors must be at least 1");
        }
        if self.cleanup_interval_secs == 0 {
            anyhow::bail!("cleanup_interval_secs must be at least 1");
        }
        if self.transfer_idle_timeout_secs == 0 {
            anyhow::bail!("transfer_idle_timeout_secs must be at least 1");
        }

        if self.required_files.is_empty() {
            anyhow::bail!("required_files cannot be empty");
        }
        if let Some(bad) = self.required_files.iter().find(|f| !is_safe_relative_path(f)) {
            anyhow::bail!("required file '{}' must be a relative path", bad);
        }

        if let UpstreamConfig::Hub { endpoint } = &self.upstream
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            anyhow::bail!("Hub endpoint must be an http(s) URL (got '{}')", endpoint);
        }

        // Duplicate ids, empty names, bad tiers
        self.catalog()?;

        let known: HashSet<&str> = self.models.iter().map(|m| m.id.as_str()).collect();
        if let Some(unknown) = self.preload.iter().find(|id| !known.contains(id.as_str())) {
            anyhow::bail!("Preload model '{}' is not in the catalog", unknown);
        }

        Ok(())
    }

    pub fn catalog(&self) -> Result<ModelCatalog> {
        ModelCatalog::new(self.models.clone()).context("Invalid model catalog")
    }

    pub fn cache_layout(&self) -> CacheLayout {
        CacheLayout::new(self.cache_root.clone(), self.required_files.clone())
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            max_cache_bytes: gb_to_bytes(self.max_cache_gb),
            cleanup_age: chrono::Duration::days(i64::from(self.cleanup_age_days)),
            max_concurrent_downloads: self.max_concurrent_downloads,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            chunk_size_bytes: self.chunk_size_bytes,
            idle_timeout: Duration::from_secs(self.transfer_idle_timeout_secs),
        }
    }

    /// Lifecycle settings, detecting GPU memory when none is configured
    pub fn lifecycle_config(&self) -> Result<LifecycleConfig> {
        let total_memory_gb = match self.total_memory_gb {
            Some(total) => total,
            None => crate::gpu::get_or_init().total_memory_gb().context(
                "total_memory_gb is not set and no GPU memory could be detected via nvidia-smi",
            )?,
        };

        Ok(LifecycleConfig {
            total_memory_gb,
            safety_threshold: self.safety_threshold,
            preferred_tier: self.preferred_tier,
            max_consecutive_errors: self.max_consecutive_errors,
        })
    }
}

// Default functions
fn default_api_port() -> u16 {
    9100
}
fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("model-manager")
}
fn default_hub_endpoint() -> String {
    "https://huggingface.co".to_string()
}
