//! REST API tests, run in-process with axum-test

mod common;

use axum_test::TestServer;
use common::{Env, TestBackend, model};
use model_manager::{
    api::routes::{AppState, create_router},
    metrics,
};
use serde_json::{Value, json};
use std::sync::{Arc, OnceLock};

// Global metrics handle - only initialize once per test process
static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

/// Helper to create a test server over a mirror with three models and 10 GB
async fn create_test_server() -> (TestServer, Env, Arc<TestBackend>) {
    let env = Env::new(
        vec![
            model("coder", 1, &["code"], (12.0, 6.0, 3.0)),
            model("writer", 2, &["long-form"], (8.0, 4.0, 2.0)),
            model("ghost", 3, &["code"], (2.0, 2.0, 2.0)),
        ],
        512,
    );
    // Never published upstream
    std::fs::remove_dir_all(env.mirror.join("org/ghost")).unwrap();

    let backend = TestBackend::new();
    let manager = env.lifecycle(10.0, backend.clone()).await;

    let state = AppState {
        manager,
        prometheus_handle: get_metrics_handle(),
    };
    let server = TestServer::try_new(create_router(state)).expect("Failed to create test server");

    (server, env, backend)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _env, _) = create_test_server().await;

    let response = server.get("/health").await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_summary_lists_models_by_priority() {
    let (server, _env, _) = create_test_server().await;

    let response = server.get("/models").await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    let ids: Vec<&str> = body["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["coder", "writer", "ghost"]);
    assert_eq!(body["models"][0]["load_state"], "unloaded");
    assert_eq!(body["memory"]["limit_gb"], 10.0);
    assert_eq!(body["memory"]["loaded_gb"], 0.0);
    assert!(body["cache"]["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_model_is_404() {
    let (server, _env, _) = create_test_server().await;

    let response = server.get("/models/nope").await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert_eq!(body["kind"], "not_found");

    let response = server.post("/models/nope/load").await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_load_and_unload_model() {
    let (server, _env, backend) = create_test_server().await;

    let response = server.post("/models/coder/load").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["load_state"], "loaded");
    assert_eq!(body["tier"], "optimized");
    assert_eq!(body["memory_gb"], 6.0);
    assert_eq!(body["cached"], true);
    assert_eq!(backend.load_count("coder"), 1);

    let response = server.post("/models/coder/unload").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["load_state"], "unloaded");
    assert_eq!(body["memory_gb"], 0.0);
}

#[tokio::test]
async fn test_load_at_requested_tier() {
    let (server, _env, _) = create_test_server().await;

    let response = server
        .post("/models/writer/load")
        .json(&json!({ "tier": "minimum" }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["tier"], "minimum");
    assert_eq!(body["memory_gb"], 2.0);

    let response = server.post("/models/coder/load").await;
    assert_eq!(response.status_code(), 200);

    // 2 + 6 fits in 10, so nothing was evicted
    let body: Value = server.get("/models").await.json();
    assert_eq!(body["memory"]["loaded_gb"], 8.0);
    let body: Value = server.get("/models/writer").await.json();
    assert_eq!(body["load_state"], "loaded");
}

#[tokio::test]
async fn test_insufficient_memory_is_507() {
    let (server, _env, backend) = create_test_server().await;
    server.post("/models/writer/load").await;

    let response = server
        .post("/models/coder/load")
        .add_query_param("tier", "base")
        .await;

    assert_eq!(response.status_code(), 507);
    let body: Value = response.json();
    assert_eq!(body["kind"], "insufficient_memory");
    // Nothing is evicted for a load that cannot fit
    assert!(backend.unloaded().is_empty());
    let body: Value = server.get("/models/writer").await.json();
    assert_eq!(body["load_state"], "loaded");
}

#[tokio::test]
async fn test_missing_upstream_is_502() {
    let (server, _env, _) = create_test_server().await;

    let response = server.post("/models/ghost/load").await;
    assert_eq!(response.status_code(), 502);
    let body: Value = response.json();
    assert_eq!(body["kind"], "transfer_error");

    let response = server.get("/models/ghost").await;
    let body: Value = response.json();
    assert_eq!(body["load_state"], "unloaded");
    assert_eq!(body["cached"], false);
}

#[tokio::test]
async fn test_backend_failure_and_reset() {
    let (server, _env, backend) = create_test_server().await;
    backend.fail("writer", true);

    let response = server.post("/models/writer/load").await;
    assert_eq!(response.status_code(), 500);

    let body: Value = server.get("/models/writer").await.json();
    assert_eq!(body["load_state"], "error");
    assert_eq!(body["consecutive_error_count"], 1);

    let response = server.post("/models/writer/reset").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["consecutive_error_count"], 0);
    assert!(body.get("last_error").is_none());
}

#[tokio::test]
async fn test_select_by_content_type() {
    let (server, _env, _) = create_test_server().await;

    let response = server.get("/select/code").await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert_eq!(body["preferred_candidate"], "coder");
    assert!(body.get("selected").is_none());

    server.post("/models/coder/load").await;
    let response = server.get("/select/code").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["selected"]["id"], "coder");

    let response = server.get("/select/poetry").await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert!(body.get("preferred_candidate").is_none());
}

#[tokio::test]
async fn test_download_and_evict_cache() {
    let (server, env, _) = create_test_server().await;

    let response = server.post("/models/writer/download").await;
    assert_eq!(response.status_code(), 202);
    let body: Value = response.json();
    assert_eq!(body["status"], "started");

    // Loading joins or hits the background download
    server.post("/models/writer/load").await;
    server.post("/models/writer/unload").await;

    let response = server.post("/models/writer/download").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "cached");
    assert_eq!(body["entry"]["model_id"], "writer");

    let response = server.get("/cache").await;
    let body: Value = response.json();
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);

    let response = server.delete("/models/writer/cache").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["removed"], true);
    assert!(!env.layout().model_dir("writer").exists());

    let response = server.delete("/models/writer/download").await;
    let body: Value = response.json();
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn test_evicting_loaded_artifact_is_409() {
    let (server, _env, _) = create_test_server().await;

    server.post("/models/coder/load").await;
    let response = server.delete("/models/coder/cache").await;
    assert_eq!(response.status_code(), 409);
    let body: Value = response.json();
    assert_eq!(body["kind"], "in_use");
}

#[tokio::test]
async fn test_cleanup_endpoint() {
    let (server, _env, _) = create_test_server().await;

    server.post("/models/writer/load").await;
    let response = server.post("/cache/cleanup").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert!(body["removed"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (server, _env, _) = create_test_server().await;
    server.post("/models/writer/load").await;

    let response = server.get("/metrics").await;

    assert_eq!(response.status_code(), 200);
    assert!(response.text().contains("model_manager_loads_total"));
}
