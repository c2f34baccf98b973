//! Prometheus Metrics Registry - Pipeline Observability
//!
//! Registers and exposes Prometheus metrics for Grafana dashboards.
//! Covers feed health, quarantine and drop counters, queue depths,
//! worker counts, write latency, overflow and stall detection.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Centralized Prometheus metrics for both binaries.
///
/// All metrics follow the naming convention `tidepool_*`. Per-instrument
/// series carry an `instrument` label.
pub struct MetricsRegistry {
    /// Prometheus registry.
    registry: Registry,

    // Feed
    /// Price frames accepted by the connector.
    pub ticks_received: IntCounterVec,
    /// Redelivered payloads suppressed by the connector.
    pub duplicates_suppressed: IntCounterVec,
    /// Frames the connector could not route.
    pub frames_rejected: IntCounterVec,
    /// Heartbeat frames received.
    pub heartbeats: IntCounter,
    /// Feed connection status (1 = connected, 0 = disconnected).
    pub feed_connected: Gauge,
    /// Successful reconnects.
    pub feed_reconnects: IntCounter,
    /// Gap markers emitted.
    pub feed_gaps: IntCounter,

    // Formatter
    /// Raw ticks dropped by validation.
    pub records_quarantined: IntCounterVec,

    // Queues and pools
    /// Items waiting per queue.
    pub queue_depth: IntGaugeVec,
    /// Items discarded by a full `drop` queue.
    pub queue_dropped: IntCounterVec,
    /// Live workers per stage.
    pub workers: IntGaugeVec,
    /// Autoscaler resize events.
    pub scale_events: IntCounterVec,

    // Writer
    /// Records persisted.
    pub records_written: IntCounterVec,
    /// Batch write latency (seconds).
    pub write_latency: Histogram,
    /// Failed write attempts.
    pub write_failures: IntCounterVec,
    /// Entries currently in the overflow buffer.
    pub overflow_entries: IntGauge,
    /// Batches spilled to the overflow buffer.
    pub overflow_spilled: IntCounter,
    /// Overflow entries replayed into storage.
    pub overflow_replayed: IntCounter,
    /// Storage outage alert (1 = active).
    pub storage_outage: Gauge,
    /// Records that could not be flushed at shutdown.
    pub unflushed_records: IntGauge,
    pub raw_frames_written: IntCounter,
    /// Raw frames lost, by reason (`queue_full`, `write_failed`).
    pub raw_frames_dropped: IntCounterVec,

    // Health monitor
    /// Last observed record count.
    pub health_record_count: IntGaugeVec,
    /// Records per second between the last two samples.
    pub health_record_rate: GaugeVec,
    /// Stall flag per instrument (1 = stalled).
    pub health_stalled: IntGaugeVec,
    /// Stall alerts raised.
    pub health_alerts: IntCounterVec,
    /// Restart requests by outcome.
    pub health_restarts: IntCounterVec,
    /// Count queries that failed.
    pub health_sample_errors: IntCounterVec,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let ticks_received = IntCounterVec::new(
            Opts::new("tidepool_ticks_received_total", "Price frames accepted"),
            &["instrument"],
        )?;
        let duplicates_suppressed = IntCounterVec::new(
            Opts::new(
                "tidepool_duplicates_suppressed_total",
                "Redelivered payloads suppressed",
            ),
            &["instrument"],
        )?;
        let frames_rejected = IntCounterVec::new(
            Opts::new("tidepool_frames_rejected_total", "Feed frames that could not be routed"),
            &["reason"],
        )?;
        let heartbeats = IntCounter::new("tidepool_heartbeats_total", "Heartbeat frames received")?;
        let feed_connected = Gauge::new(
            "tidepool_feed_connected",
            "Feed connection status (1=connected, 0=disconnected)",
        )?;
        let feed_reconnects =
            IntCounter::new("tidepool_feed_reconnects_total", "Successful feed reconnects")?;
        let feed_gaps = IntCounter::new("tidepool_feed_gaps_total", "Gap markers emitted")?;

        let records_quarantined = IntCounterVec::new(
            Opts::new(
                "tidepool_records_quarantined_total",
                "Raw ticks dropped by validation",
            ),
            &["reason"],
        )?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("tidepool_queue_depth", "Items waiting in a stage queue"),
            &["queue"],
        )?;
        let queue_dropped = IntCounterVec::new(
            Opts::new("tidepool_queue_dropped_total", "Items discarded by a full queue"),
            &["queue"],
        )?;
        let workers = IntGaugeVec::new(
            Opts::new("tidepool_workers", "Live workers per stage"),
            &["stage"],
        )?;
        let scale_events = IntCounterVec::new(
            Opts::new("tidepool_scale_events_total", "Autoscaler resize events"),
            &["stage", "reason"],
        )?;

        let records_written = IntCounterVec::new(
            Opts::new("tidepool_records_written_total", "Records persisted"),
            &["instrument"],
        )?;
        let write_latency = Histogram::with_opts(
            HistogramOpts::new(
                "tidepool_write_latency_seconds",
                "Batch write latency in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let write_failures = IntCounterVec::new(
            Opts::new("tidepool_write_failures_total", "Failed batch write attempts"),
            &["instrument"],
        )?;
        let overflow_entries = IntGauge::new(
            "tidepool_overflow_entries",
            "Batches currently held in the overflow buffer",
        )?;
        let overflow_spilled = IntCounter::new(
            "tidepool_overflow_spilled_total",
            "Batches spilled to the overflow buffer",
        )?;
        let overflow_replayed = IntCounter::new(
            "tidepool_overflow_replayed_total",
            "Overflow entries replayed into storage",
        )?;
        let storage_outage = Gauge::new(
            "tidepool_storage_outage",
            "Whether a storage outage alert is active (1=yes, 0=no)",
        )?;
        let unflushed_records = IntGauge::new(
            "tidepool_unflushed_records",
            "Records that could not be flushed at shutdown",
        )?;

        let raw_frames_written = IntCounter::new(
            "tidepool_raw_frames_written_total",
            "Feed frames appended to the raw journal",
        )?;
        let raw_frames_dropped = IntCounterVec::new(
            Opts::new(
                "tidepool_raw_frames_dropped_total",
                "Feed frames that never reached the raw journal",
            ),
            &["reason"],
        )?;

        let health_record_count = IntGaugeVec::new(
            Opts::new("tidepool_health_record_count", "Last observed record count"),
            &["instrument"],
        )?;
        let health_record_rate = GaugeVec::new(
            Opts::new(
                "tidepool_health_record_rate",
                "Records per second between the last two samples",
            ),
            &["instrument"],
        )?;
        let health_stalled = IntGaugeVec::new(
            Opts::new("tidepool_health_stalled", "Stall flag (1=stalled)"),
            &["instrument"],
        )?;
        let health_alerts = IntCounterVec::new(
            Opts::new("tidepool_health_alerts_total", "Stall alerts raised"),
            &["instrument"],
        )?;
        let health_restarts = IntCounterVec::new(
            Opts::new("tidepool_health_restarts_total", "Restart requests by outcome"),
            &["outcome"],
        )?;
        let health_sample_errors = IntCounterVec::new(
            Opts::new(
                "tidepool_health_sample_errors_total",
                "Record count queries that failed",
            ),
            &["instrument"],
        )?;

        // Register all metrics
        registry.register(Box::new(ticks_received.clone()))?;
        registry.register(Box::new(duplicates_suppressed.clone()))?;
        registry.register(Box::new(frames_rejected.clone()))?;
        registry.register(Box::new(heartbeats.clone()))?;
        registry.register(Box::new(feed_connected.clone()))?;
        registry.register(Box::new(feed_reconnects.clone()))?;
        registry.register(Box::new(feed_gaps.clone()))?;
        registry.register(Box::new(records_quarantined.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_dropped.clone()))?;
        registry.register(Box::new(workers.clone()))?;
        registry.register(Box::new(scale_events.clone()))?;
        registry.register(Box::new(records_written.clone()))?;
        registry.register(Box::new(write_latency.clone()))?;
        registry.register(Box::new(write_failures.clone()))?;
        registry.register(Box::new(overflow_entries.clone()))?;
        registry.register(Box::new(overflow_spilled.clone()))?;
        registry.register(Box::new(overflow_replayed.clone()))?;
        registry.register(Box::new(storage_outage.clone()))?;
        registry.register(Box::new(unflushed_records.clone()))?;
        registry.register(Box::new(raw_frames_written.clone()))?;
        registry.register(Box::new(raw_frames_dropped.clone()))?;
        registry.register(Box::new(health_record_count.clone()))?;
        registry.register(Box::new(health_record_rate.clone()))?;
        registry.register(Box::new(health_stalled.clone()))?;
        registry.register(Box::new(health_alerts.clone()))?;
        registry.register(Box::new(health_restarts.clone()))?;
        registry.register(Box::new(health_sample_errors.clone()))?;

        Ok(Self {
            registry,
            ticks_received,
            duplicates_suppressed,
            frames_rejected,
            heartbeats,
            feed_connected,
            feed_reconnects,
            feed_gaps,
            records_quarantined,
            queue_depth,
            queue_dropped,
            workers,
            scale_events,
            records_written,
            write_latency,
            write_failures,
            overflow_entries,
            overflow_spilled,
            overflow_replayed,
            storage_outage,
            unflushed_records,
            raw_frames_written,
            raw_frames_dropped,
            health_record_count,
            health_record_rate,
            health_stalled,
            health_alerts,
            health_restarts,
            health_sample_errors,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, shutdown))]
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let metrics_self = Arc::clone(&self);

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics_self);
                async move { metrics.encode() }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        Ok(())
    }
}
