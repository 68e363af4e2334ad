//! API request and response models

use crate::lifecycle::ModelStatus;
use crate::models::MemoryTier;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Optional body of `POST /models/{id}/load`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LoadRequest {
    /// Load at exactly this tier instead of falling back from the preferred one
    #[serde(default)]
    pub tier: Option<MemoryTier>,
}

/// Answer to `GET /select/{tag}`
#[derive(Debug, Serialize)]
pub struct SelectionResponse {
    pub tag: String,
    /// Loaded model to route the request to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<ModelStatus>,
    /// Model the caller should load when nothing is selected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_candidate: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub model_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EvictResponse {
    pub model_id: String,
    pub removed: bool,
    pub freed_gb: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub removed: Vec<String>,
}
