//! Raw Frame Journal - Every Feed Frame, As Received
//!
//! The connector hands each frame it keeps (prices, heartbeats and
//! undecodable text alike; suppressed duplicates excluded) to a
//! `RawJournal` handle. One background task groups the frames and
//! appends them to the store's raw journal.
//!
//! Canonical records never wait on the journal. When the channel is
//! full the frame is dropped and counted, and a batch storage keeps
//! refusing is dropped after its last attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::config::{BackoffSettings, RawJournalConfig};
use crate::domain::backoff::{Backoff, BackoffConfig};
use crate::domain::tick::RawFrame;
use crate::ports::storage::RecordStore;

/// Cloneable sender side of the journal.
#[derive(Clone)]
pub struct RawJournal {
  sender: mpsc::Sender<RawFrame>,
  saturated: Arc<AtomicBool>,
  metrics: Option<Arc<MetricsRegistry>>,
}

impl RawJournal {
  /// Create a handle and the receiver its writer drains.
  pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RawFrame>) {
    let (sender, rx) = mpsc::channel(capacity.max(1));
    let journal = Self {
      sender,
      saturated: Arc::new(AtomicBool::new(false)),
      metrics: None,
    };
    (journal, rx)
  }

  pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
    self.metrics = Some(metrics);
    self
  }

  /// Queue one frame, stamped with the current time. Never waits.
  pub fn record(&self, data: impl Into<String>) {
    let frame = RawFrame {
      received_at: Utc::now(),
      data: data.into(),
    };
    match self.sender.try_send(frame) {
      Ok(()) => {
        if self.saturated.swap(false, Ordering::Relaxed) {
          info!("Raw journal accepting frames again");
        }
      }
      Err(TrySendError::Full(_)) => {
        if !self.saturated.swap(true, Ordering::Relaxed) {
          warn!("Raw journal channel saturated, dropping frames");
        }
        if let Some(m) = &self.metrics {
          m.raw_frames_dropped.with_label_values(&["queue_full"]).inc();
        }
      }
      Err(TrySendError::Closed(_)) => debug!("Raw journal closed, frame not recorded"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct RawJournalSettings {
  pub batch_size: usize,
  pub flush_interval: Duration,
  /// Writes tried per batch before it is dropped.
  pub attempts: u32,
  /// Delays between attempts.
  pub retry: BackoffConfig,
}

impl RawJournalSettings {
  pub fn from_config(config: &RawJournalConfig, retry: &BackoffSettings) -> Self {
    let mut retry = retry.to_backoff();
    retry.max_attempts = 0;
    Self {
      batch_size: config.batch_size,
      flush_interval: config.flush_interval(),
      attempts: config.write_attempts.max(1),
      retry,
    }
  }
}

/// Background writer draining the journal channel into storage.
pub struct RawJournalWriter {
  store: Arc<dyn RecordStore>,
  settings: RawJournalSettings,
  metrics: Arc<MetricsRegistry>,
}

impl RawJournalWriter {
  pub fn new(store: Arc<dyn RecordStore>, settings: RawJournalSettings, metrics: Arc<MetricsRegistry>) -> Self {
    Self {
      store,
      settings,
      metrics,
    }
  }

  /// Write frames until every handle is dropped, then flush the rest.
  #[instrument(skip_all, name = "raw_journal")]
  pub async fn run(self, mut rx: mpsc::Receiver<RawFrame>) {
    let mut buffer = Vec::with_capacity(self.settings.batch_size);
    let mut timer = interval(self.settings.flush_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        biased;
        frame = rx.recv() => match frame {
          Some(frame) => {
            buffer.push(frame);
            if buffer.len() >= self.settings.batch_size {
              self.flush(&mut buffer).await;
            }
          }
          None => break,
        },
        _ = timer.tick() => {
          if !buffer.is_empty() {
            self.flush(&mut buffer).await;
          }
        }
      }
    }

    if !buffer.is_empty() {
      self.flush(&mut buffer).await;
    }
    debug!("Raw journal writer stopped");
  }

  async fn flush(&self, buffer: &mut Vec<RawFrame>) {
    let frames = std::mem::take(buffer);
    let mut backoff = Backoff::new(self.settings.retry);
    let mut attempt = 1;
    loop {
      match self.store.record_raw(&frames).await {
        Ok(()) => {
          self.metrics.raw_frames_written.inc_by(frames.len() as u64);
          return;
        }
        Err(e) if attempt < self.settings.attempts => {
          let delay = backoff.next_delay().unwrap_or(self.settings.retry.max_delay);
          debug!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Raw journal write failed, retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => {
          error!(error = %e, frames = frames.len(), "Raw journal write failed, frames dropped");
          self.metrics
            .raw_frames_dropped
            .with_label_values(&["write_failed"])
            .inc_by(frames.len() as u64);
          return;
        }
      }
    }
  }
}
