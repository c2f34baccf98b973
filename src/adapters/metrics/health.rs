//! Health Check Server - Liveness and Readiness Checks
//!
//! Exposes /live and /ready endpoints via axum 0.7. Readiness requires
//! a connected feed and a reachable store, and turns off as soon as
//! the pipeline starts draining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Shared readiness flags, written by the pipeline, read by the health endpoints.
#[derive(Debug, Clone)]
pub struct ReadinessState {
    /// Whether the feed connector is connected.
    pub feed_connected: Arc<AtomicBool>,
    /// Whether the record store answered its last check.
    pub storage_ok: Arc<AtomicBool>,
    /// Whether shutdown has begun.
    pub draining: Arc<AtomicBool>,
}

impl ReadinessState {
    /// Starts not ready: nothing is connected yet.
    pub fn new() -> Self {
        Self {
            feed_connected: Arc::new(AtomicBool::new(false)),
            storage_ok: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_feed_connected(&self, connected: bool) {
        self.feed_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_storage_ok(&self, ok: bool) {
        self.storage_ok.store(ok, Ordering::Relaxed);
    }

    pub fn set_draining(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    /// Check if the pipeline is ready to ingest.
    pub fn is_ready(&self) -> bool {
        self.feed_connected.load(Ordering::Relaxed)
            && self.storage_ok.load(Ordering::Relaxed)
            && !self.draining.load(Ordering::Relaxed)
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

/// Axum-based health check HTTP server.
///
/// Serves liveness (/live) and readiness (/ready) endpoints for
/// orchestrator health checks.
pub struct HealthServer {
    /// Readiness flags shared with the pipeline.
    state: Arc<ReadinessState>,
    /// Bind port (default 8080 from config).
    port: u16,
}

impl HealthServer {
    /// Create a new health server.
    pub fn new(state: Arc<ReadinessState>, port: u16) -> Self {
        Self { state, port }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/live", get(Self::liveness))
            .route("/ready", get(Self::readiness))
            .with_state(Arc::clone(&self.state))
    }

    /// Start the health check server.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!(address = %addr, "Health server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        Ok(())
    }

    /// Liveness check: always returns 200 if the process is running.
    async fn liveness() -> impl IntoResponse {
        (StatusCode::OK, "OK")
    }

    /// Readiness check: returns 200 only if feed and storage are healthy.
    async fn readiness(State(state): State<Arc<ReadinessState>>) -> impl IntoResponse {
        if state.is_ready() {
            (StatusCode::OK, "READY")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }
}
