//! Formatter Stage - Parallel Validation Workers
//!
//! Workers claim raw ticks from the tick queue, validate them with the
//! shared `Formatter` and push canonical records downstream. Rejected
//! ticks are quarantined: logged, counted by reason, and dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::domain::formatter::Formatter;
use crate::domain::scaling::StageSample;
use crate::domain::tick::{CanonicalRecord, RawTick};
use crate::error::ValidationError;
use crate::usecases::autoscaler::DepthSource;
use crate::usecases::queue::WorkQueue;
use crate::usecases::worker_pool::WorkerContext;

pub struct FormatterStage {
  formatter: Formatter,
  input: Arc<WorkQueue<RawTick>>,
  output: Arc<WorkQueue<CanonicalRecord>>,
  metrics: Arc<MetricsRegistry>,
  /// Ticks claimed by a worker whose record is not queued yet.
  in_hand: AtomicUsize,
}

impl FormatterStage {
  pub fn new(
    formatter: Formatter,
    input: Arc<WorkQueue<RawTick>>,
    output: Arc<WorkQueue<CanonicalRecord>>,
    metrics: Arc<MetricsRegistry>,
  ) -> Self {
    Self {
      formatter,
      input,
      output,
      metrics,
      in_hand: AtomicUsize::new(0),
    }
  }

  /// Ticks accepted by the stage but not yet handed downstream.
  pub fn unflushed(&self) -> usize {
    self.input.len() + self.in_hand.load(Ordering::Relaxed)
  }

  /// Validate one tick, counting it if quarantined.
  pub fn process(&self, tick: &RawTick) -> Option<CanonicalRecord> {
    match self.formatter.format(tick) {
      Ok(record) => Some(record),
      Err(e) => {
        self.quarantine(tick, &e);
        None
      }
    }
  }

  fn quarantine(&self, tick: &RawTick, error: &ValidationError) {
    debug!(
      instrument = %tick.instrument,
      sequence = tick.sequence,
      reason = error.reason(),
      error = %error,
      "Tick quarantined"
    );
    self.metrics
      .records_quarantined
      .with_label_values(&[error.reason()])
      .inc();
  }

  /// Worker loop. Exits when retired or when the tick queue is closed
  /// and empty.
  pub async fn run_worker(self: Arc<Self>, ctx: WorkerContext) {
    loop {
      let claimed = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => break,
        claimed = self.input.claim() => claimed,
      };
      let Some((tick, guard)) = claimed else {
        break;
      };
      self.in_hand.fetch_add(1, Ordering::Relaxed);

      if let Some(record) = self.process(&tick) {
        // The instrument stays claimed until the record is queued, so
        // records leave in the order ticks arrived.
        if self.output.push(record).await.is_err() {
          warn!(instrument = %tick.instrument, "Record queue closed, formatter worker stopping");
          break;
        }
      }
      self.in_hand.fetch_sub(1, Ordering::Relaxed);
      drop(guard);
    }
  }
}

impl DepthSource for FormatterStage {
  fn sample(&self) -> StageSample {
    StageSample {
      depth: self.input.len(),
      latency_ms: None,
    }
  }
}
