//! Pipeline Orchestrator - Wiring, Run Loop and Drain
//!
//! Builds the stages from configuration, connects them with bounded
//! queues, runs the ingest loop (connector → tick queue) until shutdown
//! or a fatal error, then drains stage by stage:
//!
//! 1. readiness off, background loops stopped
//! 2. tick queue closed, formatter workers finish what is queued
//! 3. record queue closed, batcher flushes open batches
//! 4. writer workers finish queued batches
//! 5. the raw journal writes the frames it still holds
//!
//! All of it shares one `drain_timeout`; whatever is still running at
//! the deadline is aborted and the records left behind are logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::adapters::metrics::{MetricsRegistry, ReadinessState};
use crate::adapters::storage::OverflowBuffer;
use crate::config::{AppConfig, QueuePolicy};
use crate::domain::formatter::Formatter;
use crate::domain::scaling::ScalingPolicy;
use crate::domain::tick::{InstrumentId, StreamEvent};
use crate::error::PipelineError;
use crate::ports::feed::FeedTransport;
use crate::ports::storage::RecordStore;
use crate::usecases::autoscaler::Autoscaler;
use crate::usecases::connector::{ConnectionState, ConnectorSettings, StreamConnector};
use crate::usecases::formatter_stage::FormatterStage;
use crate::usecases::queue::WorkQueue;
use crate::usecases::raw_journal::{RawJournal, RawJournalSettings, RawJournalWriter};
use crate::usecases::worker_pool::WorkerPool;
use crate::usecases::writer::{PersistenceWriter, WriteJob, WriterSettings};

const STORAGE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// What a finished run left behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
  /// Records accepted but neither persisted nor spilled.
  pub unflushed: usize,
  /// Workers still running at the drain deadline.
  pub aborted_workers: usize,
}

pub struct Pipeline {
  config: AppConfig,
  transport: Arc<dyn FeedTransport>,
  store: Arc<dyn RecordStore>,
  metrics: Arc<MetricsRegistry>,
  readiness: Arc<ReadinessState>,
}

impl Pipeline {
  pub fn new(
    config: AppConfig,
    transport: Arc<dyn FeedTransport>,
    store: Arc<dyn RecordStore>,
    metrics: Arc<MetricsRegistry>,
    readiness: Arc<ReadinessState>,
  ) -> Self {
    Self {
      config,
      transport,
      store,
      metrics,
      readiness,
    }
  }

  /// Highest sequence already handed out per instrument, from storage
  /// and from batches still waiting in overflow.
  async fn sequence_seeds(
    &self,
    instruments: &[InstrumentId],
    overflow: &OverflowBuffer,
  ) -> Result<HashMap<InstrumentId, u64>, PipelineError> {
    let mut seeds = HashMap::new();
    for instrument in instruments {
      let stored = self
        .store
        .last_sequence(instrument)
        .await
        .map_err(|e| PipelineError::Startup(format!("reading last sequence of {instrument}: {e}")))?;
      let spilled = match overflow.last_sequence(instrument).await {
        Ok(seq) => seq,
        Err(e) => {
          warn!(instrument = %instrument, error = %e, "Could not read newest overflow entry");
          None
        }
      };
      if let Some(last) = stored.max(spilled) {
        seeds.insert(instrument.clone(), last);
      }
    }
    Ok(seeds)
  }

  /// Run until `shutdown` is cancelled or a fatal error occurs, then
  /// drain. Fatal errors are returned after the drain.
  #[instrument(skip_all, fields(service = %self.config.service.name))]
  pub async fn run(self, shutdown: CancellationToken) -> Result<PipelineReport, PipelineError> {
    let cfg = &self.config;
    let instruments = cfg.instruments();

    let formatter = cfg
      .formatter
      .max_spread()
      .map(Formatter::new)
      .ok_or_else(|| PipelineError::Startup("max_spread_ratio is not a finite decimal".into()))?;
    let overflow = Arc::new(
      OverflowBuffer::open(&cfg.writer.overflow.dir, cfg.writer.overflow.max_entries)
        .await
        .map_err(|e| PipelineError::Startup(format!("opening overflow buffer: {e}")))?,
    );
    let seeds = self.sequence_seeds(&instruments, &overflow).await?;
    self.readiness.set_storage_ok(self.store.is_healthy().await);

    // ── Queues ──────────────────────────────────────────
    let ticks = Arc::new(
      WorkQueue::new("ticks", cfg.formatter.queue.capacity, cfg.formatter.queue.policy)
        .with_metrics(&self.metrics),
    );
    let records = Arc::new(
      WorkQueue::new("records", cfg.writer.queue.capacity, cfg.writer.queue.policy)
        .with_metrics(&self.metrics),
    );
    // Batches are never dropped.
    let jobs = Arc::new(
      WorkQueue::<WriteJob>::new("batches", cfg.writer.batch_queue_capacity, QueuePolicy::Block)
        .with_metrics(&self.metrics),
    );

    // ── Stages ──────────────────────────────────────────
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let formatter_stage = Arc::new(FormatterStage::new(
      formatter,
      Arc::clone(&ticks),
      Arc::clone(&records),
      Arc::clone(&self.metrics),
    ));
    let writer = Arc::new(PersistenceWriter::new(
      Arc::clone(&self.store),
      Arc::clone(&overflow),
      Arc::clone(&records),
      Arc::clone(&jobs),
      WriterSettings::from_config(&cfg.writer),
      Arc::clone(&self.metrics),
      fatal_tx,
    ));

    let formatter_pool = {
      let stage = Arc::clone(&formatter_stage);
      Arc::new(
        WorkerPool::new("formatter", cfg.formatter.workers.min, cfg.formatter.workers.max, move |ctx| {
          Arc::clone(&stage).run_worker(ctx)
        })
        .with_metrics(&self.metrics),
      )
    };
    let writer_pool = {
      let writer = Arc::clone(&writer);
      Arc::new(
        WorkerPool::new("writer", cfg.writer.workers.min, cfg.writer.workers.max, move |ctx| {
          Arc::clone(&writer).run_worker(ctx)
        })
        .with_metrics(&self.metrics),
      )
    };
    formatter_pool.start();
    writer_pool.start();

    let background = CancellationToken::new();
    let mut batcher = tokio::spawn(Arc::clone(&writer).run_batcher());
    let mut tasks: Vec<JoinHandle<()>> = vec![tokio::spawn(
      Arc::clone(&writer).run_replay_scheduler(background.clone()),
    )];

    if cfg.autoscaler.enabled {
      let mut autoscaler = Autoscaler::new(cfg.autoscaler.interval()).with_metrics(Arc::clone(&self.metrics));
      autoscaler.add_stage(
        Arc::clone(&formatter_pool),
        formatter_stage.clone(),
        ScalingPolicy::new(cfg.autoscaler.scaling(&cfg.autoscaler.formatter, cfg.formatter.workers)),
      );
      autoscaler.add_stage(
        Arc::clone(&writer_pool),
        writer.clone(),
        ScalingPolicy::new(cfg.autoscaler.scaling(&cfg.autoscaler.writer, cfg.writer.workers)),
      );
      tasks.push(tokio::spawn(autoscaler.run(background.clone())));
    }

    // ── Connector and readiness ─────────────────────────
    let mut connector = StreamConnector::new(
      Arc::clone(&self.transport),
      instruments.clone(),
      ConnectorSettings::from_config(&cfg.feed),
    )
    .with_metrics(Arc::clone(&self.metrics));
    connector.seed_sequences(seeds);

    // Ends on its own once the connector, the only sender, is dropped.
    let mut journal_task = None;
    let raw = &cfg.storage.raw_journal;
    if raw.enabled {
      let (journal, frames) = RawJournal::channel(raw.capacity);
      let writer = RawJournalWriter::new(
        Arc::clone(&self.store),
        RawJournalSettings::from_config(raw, &cfg.writer.retry),
        Arc::clone(&self.metrics),
      );
      journal_task = Some(tokio::spawn(writer.run(frames)));
      connector = connector.with_raw_journal(journal.with_metrics(Arc::clone(&self.metrics)));
    }

    tasks.push(tokio::spawn(watch_feed(
      connector.subscribe_state(),
      Arc::clone(&self.readiness),
      background.clone(),
    )));
    tasks.push(tokio::spawn(watch_storage(
      Arc::clone(&self.store),
      Arc::clone(&self.readiness),
      background.clone(),
    )));

    info!(
      instruments = instruments.len(),
      formatter_workers = formatter_pool.size(),
      writer_workers = writer_pool.size(),
      pending_overflow = overflow.len(),
      "Pipeline started"
    );

    // ── Ingest ──────────────────────────────────────────
    // Ticks taken from the connector that never reached the tick queue.
    let mut stranded = 0_usize;
    let outcome: Result<(), PipelineError> = loop {
      tokio::select! {
        biased;
        () = shutdown.cancelled() => break Ok(()),
        Some(fatal) = fatal_rx.recv() => break Err(fatal),
        event = connector.next_event() => match event {
          Ok(StreamEvent::Tick(tick)) => {
            let instrument = tick.instrument.clone();
            let sequence = tick.sequence;
            let pushed = tokio::select! {
              biased;
              () = shutdown.cancelled() => None,
              pushed = ticks.push(tick) => Some(pushed),
            };
            if !matches!(pushed, Some(Ok(_))) {
              warn!(instrument = %instrument, sequence, "Tick queue unavailable at shutdown, tick not queued");
              stranded += 1;
              break Ok(());
            }
          }
          Ok(StreamEvent::Gap(gap)) => {
            warn!(
              instruments = gap.instruments.len(),
              attempts = gap.attempts,
              reason = %gap.reason,
              "Feed gap"
            );
            if let Err(e) = self.store.record_gap(&gap).await {
              error!(error = %e, gap = ?gap, "Gap marker could not be stored");
            }
          }
          Err(e) => break Err(PipelineError::FatalDisconnect(e)),
        },
      }
    };

    // ── Drain ───────────────────────────────────────────
    match &outcome {
      Ok(()) => info!("Shutdown requested, draining pipeline"),
      Err(e) => error!(error = %e, "Fatal error, draining pipeline"),
    }
    self.readiness.set_draining();
    background.cancel();
    drop(connector);

    let deadline = Instant::now() + cfg.service.drain_timeout();
    ticks.close();
    let mut aborted = formatter_pool.drain(deadline.saturating_duration_since(Instant::now())).await;

    records.close();
    if tokio::time::timeout_at(deadline, &mut batcher).await.is_err() {
      warn!("Batcher did not finish before drain deadline");
      batcher.abort();
      jobs.close();
      aborted += 1;
    }
    aborted += writer_pool.drain(deadline.saturating_duration_since(Instant::now())).await;

    if let Some(mut task) = journal_task {
      if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
        warn!("Raw journal did not finish before drain deadline");
        task.abort();
        aborted += 1;
      }
    }

    for task in tasks {
      task.abort();
    }

    let report = PipelineReport {
      unflushed: stranded + formatter_stage.unflushed() + writer.unflushed(),
      aborted_workers: aborted,
    };
    self.metrics
      .unflushed_records
      .set(i64::try_from(report.unflushed).unwrap_or(i64::MAX));
    if report.unflushed > 0 {
      error!(
        unflushed = report.unflushed,
        aborted = report.aborted_workers,
        overflow_entries = overflow.len(),
        "Pipeline stopped with unflushed records"
      );
    } else {
      info!(overflow_entries = overflow.len(), "Pipeline drained cleanly");
    }

    outcome.map(|()| report)
  }
}

/// Mirror connector state into readiness.
async fn watch_feed(
  mut state: tokio::sync::watch::Receiver<ConnectionState>,
  readiness: Arc<ReadinessState>,
  shutdown: CancellationToken,
) {
  loop {
    readiness.set_feed_connected(*state.borrow_and_update() == ConnectionState::Connected);
    tokio::select! {
      () = shutdown.cancelled() => break,
      changed = state.changed() => {
        if changed.is_err() {
          break;
        }
      }
    }
  }
  readiness.set_feed_connected(false);
}

/// Poll storage reachability for readiness.
async fn watch_storage(store: Arc<dyn RecordStore>, readiness: Arc<ReadinessState>, shutdown: CancellationToken) {
  let mut ticker = tokio::time::interval(STORAGE_CHECK_INTERVAL);
  loop {
    tokio::select! {
      () = shutdown.cancelled() => break,
      _ = ticker.tick() => readiness.set_storage_ok(store.is_healthy().await),
    }
  }
}
