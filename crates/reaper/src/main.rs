//! GPU Reaper - stops idle GPU notebook pods
//!
//! This binary runs next to the cluster's GPU share scheduler, reads the
//! allocation report on a fixed interval, and stops notebook pods that have
//! been running longer than their termination window.

use anyhow::{Context, Result};
use reaper_lib::{
    exec::{Kubectl, ProcessRunner},
    health::HealthRegistry,
    observability::{ReaperMetrics, StructuredLogger},
    ConfigStore, ReconcileLoopBuilder,
};
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const REAPER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::ReaperConfig::load()?;

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file)
        .with_context(|| format!("failed to open log file {}", config.log_file))?;

    // JSON to stdout and to the log file, same filter for both
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .with(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(log_file))
                .with_ansi(false),
        )
        .init();

    info!(mode = %config.mode, document = %config.document_path, "Starting gpu-reaper");

    let health_registry = HealthRegistry::with_components().await;
    let metrics = ReaperMetrics::new();

    let store = ConfigStore::new(&config.document_path);
    let (document, _) = store.load();
    let excluded: Vec<&str> = document
        .excluded_namespaces
        .iter()
        .map(String::as_str)
        .collect();

    let logger = StructuredLogger::new(config.mode.to_string());
    logger.log_startup(REAPER_VERSION, config.interval_secs, &excluded);

    let listener = api::bind(config.api_port).await?;
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let mut api_handle = tokio::spawn(api::serve(listener, app_state));

    let reconcile = ReconcileLoopBuilder::new()
        .runner(Arc::new(ProcessRunner::new(config.command_timeout())))
        .store(store)
        .mode(config.mode)
        .kubectl(Kubectl::new(&config.kubectl))
        .interval(config.interval())
        .health(health_registry)
        .build()?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let reconcile_handle = tokio::spawn(reconcile.run(shutdown_rx));

    // The API server only returns on failure; treat that like a shutdown signal
    let api_failure = tokio::select! {
        () = shutdown_signal() => None,
        joined = &mut api_handle => Some(match joined {
            Ok(Ok(())) => anyhow::anyhow!("API server exited unexpectedly"),
            Ok(Err(e)) => e,
            Err(e) => anyhow::Error::new(e).context("API server task failed"),
        }),
    };
    let _ = shutdown_tx.send(());

    if let Err(e) = reconcile_handle.await {
        error!(error = %e, "Reconciliation loop task failed");
    }
    api_handle.abort();

    match api_failure {
        Some(e) => {
            error!(error = %format!("{e:#}"), "gpu-reaper stopping after API server failure");
            Err(e)
        }
        None => {
            info!("gpu-reaper stopped");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
