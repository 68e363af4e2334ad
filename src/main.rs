//! Model Manager - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use model_manager::{
    DownloadManager, FileKvBackend, LifecycleManager, MetadataStore, api,
    config::ManagerConfig, metrics, models::ArtifactCheckBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "model-manager")]
#[command(about = "Memory-bounded model cache and lifecycle manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting Model Manager");

    let mut config = ManagerConfig::load(cli.config)?;
    if let Some(port) = cli.port {
        config.api_port = port;
    }
    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        cache_root = ?config.cache_root,
        models = config.models.len(),
        max_cache_gb = config.max_cache_gb,
        "Configuration loaded"
    );

    let prometheus_handle = metrics::setup_metrics()?;

    // Cache metadata and downloads
    let catalog = Arc::new(config.catalog()?);
    let layout = config.cache_layout();
    let backend = Arc::new(FileKvBackend::open(layout.metadata_dir()).await?);
    let store = Arc::new(
        MetadataStore::open(backend, layout, config.verify_on_access)
            .await
            .context("Failed to open cache metadata")?,
    );
    let download_config = config.download_config();
    let source = config.upstream.build(download_config.idle_timeout)?;
    tracing::info!(upstream = source.name(), "Artifact upstream configured");

    let (event_tx, _) = broadcast::channel(256);
    let downloads = DownloadManager::new(
        catalog.clone(),
        store,
        source,
        download_config,
        event_tx,
    );

    let manager = LifecycleManager::new(
        catalog,
        downloads.clone(),
        Arc::new(ArtifactCheckBackend::new()),
        config.lifecycle_config()?,
    );

    // Preload in order; failures are logged and do not stop startup
    for model_id in &config.preload {
        match manager.load(model_id).await {
            Ok(tier) => tracing::info!(model_id = %model_id, tier = %tier, "Preloaded model"),
            Err(e) => tracing::error!(model_id = %model_id, error = %e, "Failed to preload model"),
        }
    }

    // Periodic cache cleanup
    let stop = CancellationToken::new();
    let cleanup_handle = tokio::spawn({
        let downloads = downloads.clone();
        let stop = stop.clone();
        let period = Duration::from_secs(config.cleanup_interval_secs.max(1));
        async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = downloads.cleanup_expired().await {
                            tracing::error!(error = %e, "Cache cleanup failed");
                        }
                    }
                }
            }
        }
    });

    // Create API router
    let app = api::create_router(api::AppState {
        manager: manager.clone(),
        prometheus_handle,
    });

    let addr = format!("0.0.0.0:{}", config.api_port);
    tracing::info!(addr = %addr, "Starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    stop.cancel();
    manager.shutdown().await;
    cleanup_handle.await.ok();

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
