//! Health Monitor - Stall Inference from Storage Growth
//!
//! Runs outside the ingestion pipeline. Every interval it asks storage
//! how many records each instrument has, feeds the counts to its
//! `HealthStore`, and asks the service supervisor for a restart when
//! instruments stall. Several instruments stalling in the same poll
//! produce one alert each and a single restart request.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::domain::health::{HealthSample, HealthStore, HealthTransition};
use crate::domain::tick::InstrumentId;
use crate::ports::storage::RecordStore;
use crate::ports::supervisor::ServiceSupervisor;

/// Outcome of one poll.
#[derive(Debug, Default)]
pub struct PollReport {
  pub transitions: Vec<(InstrumentId, HealthTransition)>,
  /// Instruments that stalled in this poll.
  pub alerts: Vec<InstrumentId>,
  /// Whether a restart was requested (and accepted).
  pub restarted: bool,
  /// Instruments whose count could not be read.
  pub failed: Vec<InstrumentId>,
}

pub struct HealthMonitor {
  store: Arc<dyn RecordStore>,
  supervisor: Arc<dyn ServiceSupervisor>,
  health: HealthStore,
  instruments: Vec<InstrumentId>,
  service_name: String,
  interval: Duration,
  metrics: Option<Arc<MetricsRegistry>>,
}

impl HealthMonitor {
  pub fn new(
    store: Arc<dyn RecordStore>,
    supervisor: Arc<dyn ServiceSupervisor>,
    health: HealthStore,
    instruments: Vec<InstrumentId>,
    service_name: impl Into<String>,
    interval: Duration,
  ) -> Self {
    Self {
      store,
      supervisor,
      health,
      instruments,
      service_name: service_name.into(),
      interval,
      metrics: None,
    }
  }

  pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
    self.metrics = Some(metrics);
    self
  }

  pub fn health(&self) -> &HealthStore {
    &self.health
  }

  /// Cancel one instrument's stall; others are untouched.
  pub fn clear(&mut self, instrument: &InstrumentId) -> bool {
    let cleared = self.health.clear(instrument);
    if cleared {
      info!(instrument = %instrument, "Stall cleared");
      if let Some(m) = &self.metrics {
        m.health_stalled.with_label_values(&[instrument.as_str()]).set(0);
      }
    }
    cleared
  }

  /// Configured instruments plus any collection storage knows about.
  async fn watched(&self) -> Vec<InstrumentId> {
    let mut all: BTreeSet<InstrumentId> = self.instruments.iter().cloned().collect();
    match self.store.instruments().await {
      Ok(found) => all.extend(found),
      Err(e) => warn!(error = %e, "Could not list collections, polling configured instruments only"),
    }
    all.into_iter().collect()
  }

  /// Sample every instrument once and act on stalls.
  #[instrument(skip(self), fields(service = %self.service_name))]
  pub async fn poll_once(&mut self, now: DateTime<Utc>) -> PollReport {
    let mut report = PollReport::default();

    for instrument in self.watched().await {
      let count = match self.store.count(&instrument).await {
        Ok(count) => count,
        Err(e) => {
          warn!(instrument = %instrument, error = %e, "Count query failed, sample skipped");
          if let Some(m) = &self.metrics {
            m.health_sample_errors
              .with_label_values(&[instrument.as_str()])
              .inc();
          }
          report.failed.push(instrument);
          continue;
        }
      };

      let transition = self.health.observe(&HealthSample {
        instrument: instrument.clone(),
        count,
        observed_at: now,
      });
      self.record(&instrument, count, transition);
      if transition.raises_alert() {
        report.alerts.push(instrument.clone());
      }
      report.transitions.push((instrument, transition));
    }

    if !report.alerts.is_empty() {
      report.restarted = self.request_restart(&report.alerts).await;
    }
    report
  }

  fn record(&self, instrument: &InstrumentId, count: u64, transition: HealthTransition) {
    let rate = self.health.get(instrument).map_or(0.0, |s| s.rate_per_sec);

    match transition {
      HealthTransition::Baseline => info!(instrument = %instrument, count, "Baseline count recorded"),
      HealthTransition::Progressing { delta } => {
        debug!(instrument = %instrument, count, delta, rate_per_sec = rate, "Records growing");
      }
      HealthTransition::Recovered { delta } => {
        info!(instrument = %instrument, count, delta, rate_per_sec = rate, "Instrument recovered from stall");
      }
      HealthTransition::Reset { from, to } => {
        warn!(instrument = %instrument, from, to, "Record count went down, baseline reset");
      }
      HealthTransition::Unchanged { streak } => {
        info!(instrument = %instrument, count, streak, "No new records");
      }
      HealthTransition::Quiet => debug!(instrument = %instrument, count, "No new records inside quiet hours"),
      HealthTransition::Stalled { streak } => {
        error!(instrument = %instrument, count, streak, "Stall detected");
      }
      HealthTransition::StillStalled { streak } => {
        warn!(instrument = %instrument, count, streak, "Instrument still stalled");
      }
    }

    if let Some(m) = &self.metrics {
      let label = [instrument.as_str()];
      m.health_record_count
        .with_label_values(&label)
        .set(i64::try_from(count).unwrap_or(i64::MAX));
      m.health_record_rate.with_label_values(&label).set(rate);
      let stalled = self.health.get(instrument).is_some_and(|s| s.stalled);
      m.health_stalled.with_label_values(&label).set(i64::from(stalled));
      if transition.raises_alert() {
        m.health_alerts.with_label_values(&label).inc();
      }
    }
  }

  async fn request_restart(&self, stalled: &[InstrumentId]) -> bool {
    let names: Vec<&str> = stalled.iter().map(InstrumentId::as_str).collect();
    match self.supervisor.status(&self.service_name).await {
      Ok(status) => info!(service = %self.service_name, status = %status, "Service status before restart"),
      Err(e) => warn!(service = %self.service_name, error = %e, "Service status unavailable"),
    }

    error!(service = %self.service_name, instruments = ?names, "Requesting service restart");
    let outcome = self.supervisor.restart(&self.service_name).await;
    let ok = outcome.is_ok();
    if let Err(e) = outcome {
      error!(service = %self.service_name, error = %e, "Restart request failed");
    }
    if let Some(m) = &self.metrics {
      m.health_restarts
        .with_label_values(&[if ok { "ok" } else { "error" }])
        .inc();
    }
    ok
  }

  /// Poll until shutdown, then tear down the health state.
  #[instrument(skip_all, fields(interval_secs = self.interval.as_secs()))]
  pub async fn run(mut self, shutdown: CancellationToken) {
    info!(
      instruments = self.instruments.len(),
      service = %self.service_name,
      "Health monitor started"
    );
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        () = shutdown.cancelled() => break,
        _ = ticker.tick() => {
          self.poll_once(Utc::now()).await;
        }
      }
    }
    self.health.reset();
    info!("Health monitor stopped");
  }
}
