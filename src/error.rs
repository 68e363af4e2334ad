//! Error types shared by the catalog, cache, download and lifecycle layers

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the manager.
///
/// The type is `Clone` because one in-flight operation may have several
/// coalesced waiters, and every waiter receives the same result.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    #[error("Model '{model_id}' not found in catalog")]
    NotFound { model_id: String },

    #[error(
        "Insufficient memory to load '{model_id}' at tier {tier}: requires {required_gb:.2} GB, \
         {available_gb:.2} GB free and {evictable_gb:.2} GB evictable (limit {limit_gb:.2} GB)"
    )]
    InsufficientMemory {
        model_id: String,
        tier: String,
        required_gb: f64,
        available_gb: f64,
        evictable_gb: f64,
        limit_gb: f64,
    },

    #[error(
        "Cache quota exceeded for '{model_id}': requires {required_gb:.2} GB, \
         {available_gb:.2} GB free and {evictable_gb:.2} GB evictable (quota {max_gb:.2} GB)"
    )]
    QuotaExceeded {
        model_id: String,
        required_gb: f64,
        available_gb: f64,
        evictable_gb: f64,
        max_gb: f64,
    },

    #[error("Integrity check failed for '{model_id}': {reason}")]
    IntegrityError { model_id: String, reason: String },

    #[error("Transfer failed for '{model_id}' after {attempts} attempt(s): {reason}")]
    TransferError {
        model_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("An operation for '{model_id}' is already in progress")]
    AlreadyInProgress { model_id: String },

    #[error("Operation for '{model_id}' was cancelled")]
    Cancelled { model_id: String },

    #[error("Model '{model_id}' is in use ({leases} active lease(s))")]
    InUse { model_id: String, leases: usize },

    #[error("Model '{model_id}' is not loaded (state: {state})")]
    NotLoaded { model_id: String, state: String },

    #[error("Invalid state transition for '{model_id}': {from} -> {to}")]
    InvalidTransition {
        model_id: String,
        from: String,
        to: String,
    },

    #[error("Backend failed for '{model_id}': {reason}")]
    Backend { model_id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ManagerResult<T> = std::result::Result<T, ManagerError>;

impl ManagerError {
    pub fn not_found(model_id: &str) -> Self {
        Self::NotFound {
            model_id: model_id.to_string(),
        }
    }

    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{}: {}", context, err))
    }

    /// Short machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InsufficientMemory { .. } => "insufficient_memory",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::IntegrityError { .. } => "integrity_error",
            Self::TransferError { .. } => "transfer_error",
            Self::AlreadyInProgress { .. } => "already_in_progress",
            Self::Cancelled { .. } => "cancelled",
            Self::InUse { .. } => "in_use",
            Self::NotLoaded { .. } => "not_loaded",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Backend { .. } => "backend_error",
            Self::Storage(_) => "storage_error",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller may reasonably retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransferError { .. }
                | Self::AlreadyInProgress { .. }
                | Self::InUse { .. }
                | Self::Cancelled { .. }
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InsufficientMemory { .. } | Self::QuotaExceeded { .. } => {
                StatusCode::INSUFFICIENT_STORAGE
            }
            Self::IntegrityError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TransferError { .. } => StatusCode::BAD_GATEWAY,
            Self::AlreadyInProgress { .. } => StatusCode::ACCEPTED,
            Self::Cancelled { .. }
            | Self::InUse { .. }
            | Self::NotLoaded { .. }
            | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Backend { .. } | Self::Storage(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "Request failed");
        } else {
            tracing::debug!(error = %self, kind = self.kind(), "Request rejected");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            kind: self.kind(),
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
}
