//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a completed load and how long it took
pub fn record_model_loaded(model_id: &str, tier: &str, duration_ms: u64) {
    metrics::counter!("model_manager_loads_total",
        "model" => model_id.to_string(),
        "tier" => tier.to_string()
    )
    .increment(1);
    metrics::histogram!("model_manager_load_duration_ms",
        "model" => model_id.to_string()
    )
    .record(duration_ms as f64);
}

pub fn record_load_failure(model_id: &str, kind: &str) {
    metrics::counter!("model_manager_load_failures_total",
        "model" => model_id.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_model_unloaded(model_id: &str) {
    metrics::counter!("model_manager_unloads_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record a loaded model evicted to free memory
pub fn record_memory_eviction(model_id: &str) {
    metrics::counter!("model_manager_memory_evictions_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

pub fn record_cache_hit(model_id: &str) {
    metrics::counter!("model_manager_cache_hits_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

pub fn record_cache_miss(model_id: &str) {
    metrics::counter!("model_manager_cache_misses_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

pub fn record_download_completed(model_id: &str, bytes: u64) {
    metrics::counter!("model_manager_downloads_total",
        "model" => model_id.to_string()
    )
    .increment(1);
    metrics::counter!("model_manager_downloaded_bytes_total").increment(bytes);
}

pub fn record_download_failure(model_id: &str, kind: &str) {
    metrics::counter!("model_manager_download_failures_total",
        "model" => model_id.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_download_retry(model_id: &str) {
    metrics::counter!("model_manager_download_retries_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

pub fn record_integrity_failure(model_id: &str) {
    metrics::counter!("model_manager_integrity_failures_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Record an artifact removed from disk
pub fn record_cache_eviction(model_id: &str, reason: &str) {
    metrics::counter!("model_manager_cache_evictions_total",
        "model" => model_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn update_loaded_memory(loaded_gb: f64, loaded_models: usize) {
    metrics::gauge!("model_manager_loaded_memory_gb").set(loaded_gb);
    metrics::gauge!("model_manager_loaded_models").set(loaded_models as f64);
}

pub fn update_cache_usage(used_gb: f64, entries: usize) {
    metrics::gauge!("model_manager_cache_usage_gb").set(used_gb);
    metrics::gauge!("model_manager_cache_entries").set(entries as f64);
}
