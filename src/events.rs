//! Broadcast notifications for subscribers of the manager

use crate::models::MemoryTier;
use serde::Serialize;

/// Lifecycle and cache events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ModelEvent {
    /// Model became resident at the given tier
    Loaded { model_id: String, tier: MemoryTier },
    Unloaded { model_id: String },
    /// Model was unloaded to make room for another one
    Evicted { model_id: String, for_model: String },
    LoadFailed { model_id: String, error: String },
    /// Artifact was verified and recorded in the cache
    Cached { model_id: String, size_bytes: u64 },
    CacheEvicted { model_id: String, size_bytes: u64 },
}

/// Transfer progress, emitted at bounded intervals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub model_id: String,
    /// File currently being transferred
    pub file: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub percent: f64,
    /// Estimated seconds remaining, once a rate is known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
}

impl DownloadProgress {
    pub fn new(
        model_id: &str,
        file: &str,
        bytes_transferred: u64,
        total_bytes: u64,
        rate_bytes_per_sec: f64,
    ) -> Self {
        let percent = if total_bytes == 0 {
            100.0
        } else {
            (bytes_transferred as f64 / total_bytes as f64 * 100.0).min(100.0)
        };
        let eta_secs = (rate_bytes_per_sec > 0.0)
            .then(|| total_bytes.saturating_sub(bytes_transferred) as f64 / rate_bytes_per_sec);

        Self {
            model_id: model_id.to_string(),
            file: file.to_string(),
            bytes_transferred,
            total_bytes,
            percent,
            eta_secs,
        }
    }
}
