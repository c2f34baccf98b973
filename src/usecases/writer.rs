//! Persistence Writer - Batched, Ordered, Outage-Tolerant Storage Writes
//!
//! Three kinds of task cooperate here:
//! - the batcher groups canonical records into per-instrument batches,
//!   flushed by size or age, and queues them as write jobs
//! - writer workers claim jobs (one instrument at a time per worker) and
//!   write them with bounded retry, spilling to the overflow buffer once
//!   failures outlast `overflow_after`
//! - the replay scheduler queues replay jobs for instruments that have
//!   spilled batches, so recovery does not wait for new traffic
//!
//! Before a new batch for an instrument is written, that instrument's
//! overflow entries are replayed oldest first. If they cannot all be
//! replayed, the new batch is spilled behind them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::adapters::storage::OverflowBuffer;
use crate::config::WriterConfig;
use crate::domain::backoff::{Backoff, BackoffConfig};
use crate::domain::batch::BatchAccumulator;
use crate::domain::scaling::StageSample;
use crate::domain::tick::{CanonicalRecord, InstrumentId, WriteBatch};
use crate::error::{PipelineError, StorageError, WriteError};
use crate::ports::storage::RecordStore;
use crate::usecases::autoscaler::DepthSource;
use crate::usecases::queue::{Keyed, WorkQueue};
use crate::usecases::worker_pool::WorkerContext;

/// Weight of the newest sample in the write latency average.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Unit of work for a writer worker.
#[derive(Debug, Clone)]
pub enum WriteJob {
  Batch(WriteBatch),
  /// Drain an instrument's overflow entries into storage.
  Replay(InstrumentId),
}

impl Keyed for WriteJob {
  fn key(&self) -> &InstrumentId {
    match self {
      Self::Batch(batch) => &batch.instrument,
      Self::Replay(instrument) => instrument,
    }
  }
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
  pub batch_size: usize,
  pub flush_interval: Duration,
  pub overflow_after: Duration,
  pub replay_interval: Duration,
  pub retry: BackoffConfig,
}

impl WriterSettings {
  pub fn from_config(config: &WriterConfig) -> Self {
    Self {
      batch_size: config.batch_size,
      flush_interval: config.flush_interval(),
      overflow_after: config.overflow_after(),
      replay_interval: config.replay_interval(),
      retry: config.retry.to_backoff(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayOutcome {
  /// No entries left for the instrument.
  Drained,
  /// Storage refused an entry; remaining entries stay pending.
  Blocked,
}

pub struct PersistenceWriter {
  store: Arc<dyn RecordStore>,
  overflow: Arc<OverflowBuffer>,
  records: Arc<WorkQueue<CanonicalRecord>>,
  jobs: Arc<WorkQueue<WriteJob>>,
  settings: WriterSettings,
  metrics: Arc<MetricsRegistry>,
  fatal: mpsc::UnboundedSender<PipelineError>,
  outage: AtomicBool,
  fatal_reported: AtomicBool,
  /// Records held by the batcher in open batches.
  accumulated: AtomicUsize,
  /// Records in batch jobs not yet claimed.
  queued: AtomicUsize,
  /// Records in batches a worker is writing.
  in_flight: AtomicUsize,
  /// Records in batches that could not be queued.
  abandoned: AtomicUsize,
  /// Write latency average in ms, stored as f64 bits; NaN until measured.
  latency_ms: AtomicU64,
  replay_scheduled: Mutex<HashSet<InstrumentId>>,
}

impl PersistenceWriter {
  pub fn new(
    store: Arc<dyn RecordStore>,
    overflow: Arc<OverflowBuffer>,
    records: Arc<WorkQueue<CanonicalRecord>>,
    jobs: Arc<WorkQueue<WriteJob>>,
    settings: WriterSettings,
    metrics: Arc<MetricsRegistry>,
    fatal: mpsc::UnboundedSender<PipelineError>,
  ) -> Self {
    metrics.overflow_entries.set(gauge_value(overflow.len()));
    Self {
      store,
      overflow,
      records,
      jobs,
      settings,
      metrics,
      fatal,
      outage: AtomicBool::new(false),
      fatal_reported: AtomicBool::new(false),
      accumulated: AtomicUsize::new(0),
      queued: AtomicUsize::new(0),
      in_flight: AtomicUsize::new(0),
      abandoned: AtomicUsize::new(0),
      latency_ms: AtomicU64::new(f64::NAN.to_bits()),
      replay_scheduled: Mutex::new(HashSet::new()),
    }
  }

  pub fn overflow(&self) -> &Arc<OverflowBuffer> {
    &self.overflow
  }

  /// Whether a storage outage alert is active.
  pub fn outage_active(&self) -> bool {
    self.outage.load(Ordering::Relaxed)
  }

  /// Records waiting on writer workers: queued for batching, in queued
  /// batch jobs, or being written. Open batches are excluded; they wait
  /// on the flush policy, not on workers.
  pub fn backlog(&self) -> usize {
    self.records.len() + self.queued.load(Ordering::Relaxed) + self.in_flight.load(Ordering::Relaxed)
  }

  /// Records that would be lost if the process stopped now.
  pub fn unflushed(&self) -> usize {
    self.backlog() + self.accumulated.load(Ordering::Relaxed) + self.abandoned.load(Ordering::Relaxed)
  }

  /// Smoothed batch write latency.
  pub fn latency_ms(&self) -> Option<f64> {
    let value = f64::from_bits(self.latency_ms.load(Ordering::Relaxed));
    (!value.is_nan()).then_some(value)
  }

  // ── Batcher ─────────────────────────────────────────────

  /// Group records into batches until the record queue is closed and
  /// empty, then flush what is left and close the job queue.
  #[instrument(skip_all, name = "batcher")]
  pub async fn run_batcher(self: Arc<Self>) {
    let mut batches = BatchAccumulator::new(self.settings.batch_size, self.settings.flush_interval);
    let period = (self.settings.flush_interval / 4).max(Duration::from_millis(5));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        claimed = self.records.claim() => {
          let Some((record, guard)) = claimed else {
            break;
          };
          drop(guard);
          let full = batches.push(record, Instant::now());
          self.accumulated.store(batches.pending_records(), Ordering::Relaxed);
          if let Some(batch) = full {
            self.enqueue(batch).await;
          }
        }
        _ = ticker.tick() => {
          for batch in batches.take_expired(Instant::now()) {
            self.enqueue(batch).await;
          }
          self.accumulated.store(batches.pending_records(), Ordering::Relaxed);
        }
      }
    }

    let rest = batches.drain();
    debug!(batches = rest.len(), "Flushing open batches");
    for batch in rest {
      self.enqueue(batch).await;
    }
    self.accumulated.store(0, Ordering::Relaxed);
    self.jobs.close();
    info!("Batcher stopped");
  }

  async fn enqueue(&self, batch: WriteBatch) {
    let n = batch.len();
    self.queued.fetch_add(n, Ordering::Relaxed);
    let instrument = batch.instrument.clone();
    if self.jobs.push(WriteJob::Batch(batch)).await.is_err() {
      self.queued.fetch_sub(n, Ordering::Relaxed);
      self.abandoned.fetch_add(n, Ordering::Relaxed);
      error!(instrument = %instrument, records = n, "Batch queue closed, batch not written");
    }
  }

  // ── Writer workers ──────────────────────────────────────

  /// Worker loop. Exits when retired or when the job queue is closed
  /// and empty.
  pub async fn run_worker(self: Arc<Self>, ctx: WorkerContext) {
    loop {
      let claimed = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => break,
        claimed = self.jobs.claim() => claimed,
      };
      let Some((job, guard)) = claimed else {
        break;
      };

      match job {
        WriteJob::Batch(batch) => {
          let n = batch.len();
          self.queued.fetch_sub(n, Ordering::Relaxed);
          self.in_flight.fetch_add(n, Ordering::Relaxed);
          self.write(batch).await;
          self.in_flight.fetch_sub(n, Ordering::Relaxed);
        }
        WriteJob::Replay(instrument) => {
          self.replay_scheduled.lock().remove(&instrument);
          self.replay(&instrument).await;
        }
      }
      drop(guard);
    }
  }

  #[instrument(skip_all, fields(instrument = %batch.instrument, records = batch.len()))]
  async fn write(&self, batch: WriteBatch) {
    if self.overflow.pending(&batch.instrument) > 0
      && self.replay(&batch.instrument).await == ReplayOutcome::Blocked
    {
      debug!("Older batches still in overflow, spilling behind them");
      self.spill(batch).await;
      return;
    }

    let started = Instant::now();
    let mut backoff = Backoff::new(self.settings.retry);
    loop {
      match self.insert(&batch).await {
        Ok(()) => return,
        Err(e @ StorageError::SequenceRegression { .. }) => {
          error!(error = %e, "Storage rejected batch order, batch dropped");
          return;
        }
        Err(e) => {
          let elapsed = started.elapsed();
          if elapsed >= self.settings.overflow_after {
            warn!(
              error = %e,
              attempts = backoff.attempts() + 1,
              elapsed_ms = elapsed.as_millis() as u64,
              "Write failures persisted, spilling batch"
            );
            self.spill(batch).await;
            return;
          }
          let delay = backoff
            .next_delay()
            .unwrap_or(self.settings.retry.max_delay)
            .min(self.settings.overflow_after - elapsed);
          debug!(error = %e, delay_ms = delay.as_millis() as u64, "Write failed, retrying");
          tokio::time::sleep(delay).await;
        }
      }
    }
  }

  async fn insert(&self, batch: &WriteBatch) -> Result<(), StorageError> {
    let started = Instant::now();
    match self.store.insert_batch(batch).await {
      Ok(written) => {
        let elapsed = started.elapsed();
        self.metrics.write_latency.observe(elapsed.as_secs_f64());
        self.observe_latency(elapsed.as_secs_f64() * 1000.0);
        self.metrics
          .records_written
          .with_label_values(&[batch.instrument.as_str()])
          .inc_by(written as u64);
        self.clear_outage();
        Ok(())
      }
      Err(e) => {
        self.metrics
          .write_failures
          .with_label_values(&[batch.instrument.as_str()])
          .inc();
        Err(e)
      }
    }
  }

  /// Move a batch to the overflow buffer. If the buffer cannot take it,
  /// the batch is held here and offered to storage and the buffer in
  /// turn until one of them accepts it.
  async fn spill(&self, batch: WriteBatch) {
    loop {
      match self.overflow.spill(&batch).await {
        Ok(key) => {
          self.metrics.overflow_spilled.inc();
          self.publish_overflow();
          self.raise_outage();
          info!(entry = key.seq, pending = self.overflow.pending(&batch.instrument), "Batch spilled to overflow");
          return;
        }
        Err(e @ WriteError::OverflowExhausted { .. }) => self.report_fatal(e),
        Err(e) => error!(error = %e, "Overflow spill failed, holding batch"),
      }

      tokio::time::sleep(self.settings.retry.max_delay).await;
      if self.replay(&batch.instrument).await == ReplayOutcome::Drained && self.insert(&batch).await.is_ok() {
        return;
      }
    }
  }

  /// Write an instrument's overflow entries oldest first, removing each
  /// only after storage confirmed it.
  #[instrument(skip(self))]
  async fn replay(&self, instrument: &InstrumentId) -> ReplayOutcome {
    let mut replayed = 0_usize;
    let outcome = loop {
      let Some(key) = self.overflow.oldest(instrument) else {
        break ReplayOutcome::Drained;
      };
      let entry = match self.overflow.read(&key).await {
        Ok(entry) => entry,
        Err(e @ WriteError::CorruptOverflow { .. }) => {
          error!(error = %e, "Quarantining unreadable overflow entry");
          if let Err(e) = self.overflow.quarantine(&key).await {
            error!(error = %e, "Failed to quarantine overflow entry");
            break ReplayOutcome::Blocked;
          }
          self.publish_overflow();
          continue;
        }
        Err(e) => {
          warn!(error = %e, "Overflow entry unreadable, will retry");
          break ReplayOutcome::Blocked;
        }
      };

      if self.insert(&entry.batch).await.is_err() {
        break ReplayOutcome::Blocked;
      }
      if let Err(e) = self.overflow.remove(&key).await {
        // Written but still on disk: the next replay re-inserts it, and
        // storage skips the already persisted sequences.
        error!(error = %e, "Failed to remove replayed overflow entry");
        break ReplayOutcome::Blocked;
      }
      replayed += 1;
      self.metrics.overflow_replayed.inc();
      self.publish_overflow();
    };

    if replayed > 0 {
      info!(replayed, remaining = self.overflow.pending(instrument), "Replayed overflow entries");
    }
    outcome
  }

  // ── Replay scheduler ────────────────────────────────────

  /// Periodically queue a replay job for each instrument with pending
  /// overflow. At most one replay job per instrument is queued at once.
  #[instrument(skip_all, name = "replay_scheduler")]
  pub async fn run_replay_scheduler(self: Arc<Self>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(self.settings.replay_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        () = shutdown.cancelled() => break,
        _ = ticker.tick() => {}
      }

      for instrument in self.overflow.instruments_with_pending() {
        if !self.replay_scheduled.lock().insert(instrument.clone()) {
          continue;
        }
        let pushed = tokio::select! {
          () = shutdown.cancelled() => None,
          pushed = self.jobs.push(WriteJob::Replay(instrument.clone())) => Some(pushed),
        };
        if !matches!(pushed, Some(Ok(_))) {
          self.replay_scheduled.lock().remove(&instrument);
          return;
        }
        debug!(instrument = %instrument, "Replay scheduled");
      }
    }
  }

  // ── Alerts and gauges ───────────────────────────────────

  fn raise_outage(&self) {
    if !self.outage.swap(true, Ordering::Relaxed) {
      error!(
        overflow_entries = self.overflow.len(),
        capacity = self.overflow.capacity(),
        "Storage outage: batches are being spilled to overflow"
      );
      self.metrics.storage_outage.set(1.0);
    }
  }

  fn clear_outage(&self) {
    if self.outage.swap(false, Ordering::Relaxed) {
      info!(overflow_entries = self.overflow.len(), "Storage accepting writes again, outage cleared");
      self.metrics.storage_outage.set(0.0);
    }
  }

  fn report_fatal(&self, error: WriteError) {
    if !self.fatal_reported.swap(true, Ordering::Relaxed) {
      error!(error = %error, "Overflow capacity exhausted");
      if self.fatal.send(PipelineError::OverflowExhausted(error)).is_err() {
        warn!("Pipeline no longer listening for fatal errors");
      }
    }
  }

  fn observe_latency(&self, ms: f64) {
    let previous = f64::from_bits(self.latency_ms.load(Ordering::Relaxed));
    let next = if previous.is_nan() {
      ms
    } else {
      previous + LATENCY_EWMA_ALPHA * (ms - previous)
    };
    self.latency_ms.store(next.to_bits(), Ordering::Relaxed);
  }

  fn publish_overflow(&self) {
    self.metrics.overflow_entries.set(gauge_value(self.overflow.len()));
  }
}

impl DepthSource for PersistenceWriter {
  fn sample(&self) -> StageSample {
    StageSample {
      depth: self.backlog(),
      latency_ms: self.latency_ms(),
    }
  }
}

fn gauge_value(n: usize) -> i64 {
  i64::try_from(n).unwrap_or(i64::MAX)
}
