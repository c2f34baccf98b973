//! Tidepool - Ingestion Pipeline Entry Point
//!
//! Streams ticks from the configured feed, validates them and persists
//! them per instrument. Runs until SIGINT/SIGTERM or a fatal error.
//!
//! Wiring sequence:
//! 1. Load config (path from TIDEPOOL_CONFIG) + validate
//! 2. Init tracing (JSON structured logging)
//! 3. Load the feed token from the configured env var
//! 4. Create the OANDA transport (FeedTransport port)
//! 5. Open the JSONL record store (RecordStore port)
//! 6. Spawn Prometheus metrics server and health server (/live + /ready)
//! 7. Run the pipeline until a shutdown signal or fatal error
//! 8. Drain: stop intake, flush stages, report unflushed records
//! 9. Exit non-zero on fatal errors so the supervisor restarts us

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tidepool::adapters::feeds::OandaTransport;
use tidepool::adapters::metrics::{HealthServer, MetricsRegistry, ReadinessState};
use tidepool::adapters::storage::JsonlStore;
use tidepool::config;
use tidepool::usecases::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration ───────────────────────────────
    let config_path = config::loader::config_path();
    let config = config::loader::load_config(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level)),
        )
        .json()
        .init();

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        instruments = config.feed.instruments.len(),
        stream_url = %config.feed.stream_url,
        "Starting Tidepool ingestion pipeline"
    );

    // ── 3. Feed credentials ─────────────────────────────────
    let token = config::loader::feed_token(&config).context("Failed to load feed credentials")?;

    // ── 4. Feed transport ───────────────────────────────────
    let transport = Arc::new(
        OandaTransport::from_config(&config.feed, token).context("Failed to create feed transport")?,
    );

    // ── 5. Record store ─────────────────────────────────────
    let store = Arc::new(
        JsonlStore::open(&config.storage.data_dir)
            .await
            .context("Failed to open record store")?,
    );

    // ── 6. Metrics and health servers ───────────────────────
    let shutdown = CancellationToken::new();
    let servers = CancellationToken::new();
    let metrics = Arc::new(MetricsRegistry::new().context("Failed to create metrics registry")?);
    let readiness = Arc::new(ReadinessState::new());

    let metrics_handle = config.metrics.enabled.then(|| {
        let metrics = Arc::clone(&metrics);
        let address = config.metrics.bind_address.clone();
        let token = servers.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics.serve(address, token).await {
                error!(error = %e, "Metrics server failed");
            }
        })
    });
    let health_handle = {
        let server = HealthServer::new(Arc::clone(&readiness), config.metrics.health_port);
        let token = servers.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                error!(error = %e, "Health server failed");
            }
        })
    };

    // ── 7. Signals ──────────────────────────────────────────
    tokio::spawn(wait_for_signal(shutdown.clone()));

    // ── 8. Run until shutdown or fatal error, then drain ────
    let pipeline = Pipeline::new(config, transport, store, metrics, readiness);
    let result = pipeline.run(shutdown.clone()).await;

    servers.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), health_handle).await;
    if let Some(handle) = metrics_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    // ── 9. Exit status ──────────────────────────────────────
    match result {
        Ok(report) => {
            if report.unflushed > 0 {
                warn!(unflushed = report.unflushed, "Shutdown complete with unflushed records");
            } else {
                info!("Shutdown complete");
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Pipeline stopped on fatal error");
            Err(e).context("Pipeline failed")
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received, initiating graceful shutdown"),
                    _ = term.recv() => info!("SIGTERM received, initiating graceful shutdown"),
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                info!("SIGINT received, initiating graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("SIGINT received, initiating graceful shutdown");
    }
    shutdown.cancel();
}
