//! API request handlers

use super::models::{
    CancelResponse, CleanupResponse, EvictResponse, HealthResponse, LoadRequest,
    SelectionResponse,
};
use super::routes::AppState;
use crate::error::ManagerError;
use crate::lifecycle::{ManagerSummary, ModelStatus};
use crate::models::{CacheUsage, DownloadOutcome};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

/// GET /health - Manager health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /models - Every model's state plus memory and cache usage
pub async fn summary(State(state): State<AppState>) -> Json<ManagerSummary> {
    Json(state.manager.summary().await)
}

/// GET /models/:id
pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelStatus>, ManagerError> {
    Ok(Json(state.manager.status(&id).await?))
}

/// POST /models/:id/load - Load a model, downloading and evicting as needed
///
/// A `tier` in the JSON body or the query string restricts the load to that
/// tier instead of falling back.
pub async fn load_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LoadRequest>,
    body: Option<Json<LoadRequest>>,
) -> Result<Json<ModelStatus>, ManagerError> {
    let tier = body.and_then(|Json(req)| req.tier).or(query.tier);
    state.manager.load_with_tier(&id, tier).await?;
    Ok(Json(state.manager.status(&id).await?))
}

/// POST /models/:id/unload
pub async fn unload_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelStatus>, ManagerError> {
    state.manager.unload(&id).await?;
    Ok(Json(state.manager.status(&id).await?))
}

/// POST /models/:id/reset - Clear the consecutive error count
pub async fn reset_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelStatus>, ManagerError> {
    Ok(Json(state.manager.reset_errors(&id).await?))
}

/// POST /models/:id/download - Fetch the artifact in the background
pub async fn start_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<DownloadOutcome>), ManagerError> {
    let outcome = state.manager.downloads().start_download(&id).await?;
    let status = match outcome {
        DownloadOutcome::Cached { .. } => StatusCode::OK,
        DownloadOutcome::Started { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

/// DELETE /models/:id/download - Cancel an in-flight download
pub async fn cancel_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ManagerError> {
    let cancelled = state.manager.downloads().cancel(&id)?;
    Ok(Json(CancelResponse {
        model_id: id,
        cancelled,
    }))
}

/// DELETE /models/:id/cache - Remove the cached artifact
pub async fn evict_cache(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EvictResponse>, ManagerError> {
    let removed = state.manager.downloads().evict_cached(&id).await?;
    Ok(Json(EvictResponse {
        model_id: id,
        removed: removed.is_some(),
        freed_gb: removed.map_or(0.0, |e| e.size_gb()),
    }))
}

/// GET /cache
pub async fn cache_usage(State(state): State<AppState>) -> Json<CacheUsage> {
    Json(state.manager.downloads().usage().await)
}

/// POST /cache/cleanup - Remove artifacts idle past the cleanup age
pub async fn cleanup_cache(
    State(state): State<AppState>,
) -> Result<Json<CleanupResponse>, ManagerError> {
    let removed = state.manager.downloads().cleanup_expired().await?;
    Ok(Json(CleanupResponse { removed }))
}

/// GET /select/:tag - Loaded model to route a content type to
///
/// 404 with a `preferred_candidate` when nothing suitable is loaded.
pub async fn select_model(
    State(state): State<AppState>,
    Path(tag): Path<String>,
) -> Result<(StatusCode, Json<SelectionResponse>), ManagerError> {
    if let Some(descriptor) = state.manager.select_for_content_type(&tag).await {
        let status = state.manager.status(&descriptor.id).await?;
        return Ok((
            StatusCode::OK,
            Json(SelectionResponse {
                tag,
                selected: Some(status),
                preferred_candidate: None,
            }),
        ));
    }

    let preferred_candidate = state
        .manager
        .preferred_candidate(&tag)
        .await
        .map(|d| d.id.clone());
    Ok((
        StatusCode::NOT_FOUND,
        Json(SelectionResponse {
            tag,
            selected: None,
            preferred_candidate,
        }),
    ))
}
