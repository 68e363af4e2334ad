//! API route definitions

use crate::lifecycle::LifecycleManager;
use axum::{
    Router,
    routing::{delete, get, post},
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: LifecycleManager,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Models
        .route("/models", get(handlers::summary))
        .route("/models/{id}", get(handlers::get_model))
        .route("/models/{id}/load", post(handlers::load_model))
        .route("/models/{id}/unload", post(handlers::unload_model))
        .route("/models/{id}/reset", post(handlers::reset_model))
        // Artifacts
        .route(
            "/models/{id}/download",
            post(handlers::start_download).delete(handlers::cancel_download),
        )
        .route("/models/{id}/cache", delete(handlers::evict_cache))
        .route("/cache", get(handlers::cache_usage))
        .route("/cache/cleanup", post(handlers::cleanup_cache))
        // Routing
        .route("/select/{tag}", get(handlers::select_model))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
