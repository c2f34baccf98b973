//! Tidepool Monitor - Stall Detection Entry Point
//!
//! Watches the record store from the outside: if an instrument's record
//! count stops growing for `stall_threshold` polls outside quiet hours,
//! the ingestion service is restarted through the configured supervisor.
//! Shares the pipeline's config file; only `[health]` and `[storage]`
//! matter here.

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tidepool::adapters::metrics::MetricsRegistry;
use tidepool::adapters::storage::JsonlStore;
use tidepool::adapters::supervisor;
use tidepool::config;
use tidepool::domain::health::HealthStore;
use tidepool::usecases::HealthMonitor;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config::loader::config_path();
    let config = config::loader::load_config(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level)),
        )
        .json()
        .init();

    let quiet_hours = config::loader::quiet_hours(&config).context("Invalid quiet hours")?;
    let instruments = config.monitored_instruments();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        instruments = instruments.len(),
        interval_secs = config.health.interval_secs,
        stall_threshold = config.health.stall_threshold,
        quiet_windows = quiet_hours.len(),
        supervisor = ?config.health.supervisor,
        "Starting Tidepool health monitor"
    );

    let store = Arc::new(
        JsonlStore::open(&config.storage.data_dir)
            .await
            .context("Failed to open record store")?,
    );
    let metrics = Arc::new(MetricsRegistry::new().context("Failed to create metrics registry")?);
    let shutdown = CancellationToken::new();

    let metrics_handle = config.metrics.enabled.then(|| {
        let metrics = Arc::clone(&metrics);
        let address = config.health.metrics_bind_address.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics.serve(address, token).await {
                error!(error = %e, "Metrics server failed");
            }
        })
    });

    let monitor = HealthMonitor::new(
        store,
        supervisor::from_config(&config.health),
        HealthStore::new(config.health.stall_threshold, quiet_hours),
        instruments,
        config.health.service_name.clone(),
        config.health.interval(),
    )
    .with_metrics(metrics);
    let monitor_handle = tokio::spawn(monitor.run(shutdown.clone()));

    wait_for_signal().await?;
    shutdown.cancel();

    let _ = monitor_handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    info!("Health monitor stopped");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on unix (what systemd sends on stop).
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("Failed to listen for SIGINT")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("Failed to listen for SIGINT")?;

    info!("Shutdown signal received, stopping health monitor");
    Ok(())
}
