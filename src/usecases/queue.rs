//! Work Queue - Bounded Keyed FIFO Between Stages
//!
//! Items wait in one lane per instrument. A consumer claims the head of a
//! ready lane and holds that instrument until the returned [`KeyGuard`]
//! drops; other consumers skip claimed instruments. Any number of workers
//! can therefore pull from the same queue without reordering records of
//! one instrument.
//!
//! Capacity counts items across all lanes. A full queue either blocks the
//! producer or drops the item, per configuration; drops are counted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::trace;

use crate::adapters::metrics::MetricsRegistry;
use crate::config::QueuePolicy;
use crate::domain::tick::{CanonicalRecord, InstrumentId, RawTick};

/// Items routed by instrument.
pub trait Keyed {
  fn key(&self) -> &InstrumentId;
}

impl Keyed for RawTick {
  fn key(&self) -> &InstrumentId {
    &self.instrument
  }
}

impl Keyed for CanonicalRecord {
  fn key(&self) -> &InstrumentId {
    &self.instrument
  }
}

/// What happened to a pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
  Accepted,
  /// Queue was full under the `drop` policy.
  Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue is closed")]
pub struct QueueClosed;

struct Lanes<T> {
  lanes: HashMap<InstrumentId, VecDeque<T>>,
  /// Keys with a non-empty lane that nobody holds, in arrival order.
  ready: VecDeque<InstrumentId>,
  claimed: HashSet<InstrumentId>,
  len: usize,
  closed: bool,
}

impl<T: Keyed> Lanes<T> {
  fn new() -> Self {
    Self {
      lanes: HashMap::new(),
      ready: VecDeque::new(),
      claimed: HashSet::new(),
      len: 0,
      closed: false,
    }
  }

  fn enqueue(&mut self, item: T) {
    let key = item.key().clone();
    let lane = self.lanes.entry(key.clone()).or_default();
    let was_empty = lane.is_empty();
    lane.push_back(item);
    self.len += 1;
    if was_empty && !self.claimed.contains(&key) {
      self.ready.push_back(key);
    }
  }

  fn take_ready(&mut self) -> Option<(T, InstrumentId)> {
    while let Some(key) = self.ready.pop_front() {
      let Some(lane) = self.lanes.get_mut(&key) else {
        continue;
      };
      let Some(item) = lane.pop_front() else {
        self.lanes.remove(&key);
        continue;
      };
      if lane.is_empty() {
        self.lanes.remove(&key);
      }
      self.len -= 1;
      self.claimed.insert(key.clone());
      return Some((item, key));
    }
    None
  }

  /// Returns whether the key became ready again.
  fn release(&mut self, key: &InstrumentId) -> bool {
    self.claimed.remove(key);
    if self.lanes.get(key).is_some_and(|lane| !lane.is_empty()) {
      self.ready.push_back(key.clone());
      true
    } else {
      false
    }
  }
}

/// Bounded queue between two pipeline stages.
pub struct WorkQueue<T> {
  name: &'static str,
  capacity: usize,
  policy: QueuePolicy,
  state: Mutex<Lanes<T>>,
  not_empty: Notify,
  not_full: Notify,
  dropped: AtomicU64,
  depth_gauge: Option<IntGauge>,
  dropped_counter: Option<IntCounter>,
}

impl<T: Keyed> WorkQueue<T> {
  pub fn new(name: &'static str, capacity: usize, policy: QueuePolicy) -> Self {
    Self {
      name,
      capacity: capacity.max(1),
      policy,
      state: Mutex::new(Lanes::new()),
      not_empty: Notify::new(),
      not_full: Notify::new(),
      dropped: AtomicU64::new(0),
      depth_gauge: None,
      dropped_counter: None,
    }
  }

  /// Export depth and drop counts under this queue's name.
  pub fn with_metrics(mut self, metrics: &MetricsRegistry) -> Self {
    self.depth_gauge = Some(metrics.queue_depth.with_label_values(&[self.name]));
    self.dropped_counter = Some(metrics.queue_dropped.with_label_values(&[self.name]));
    self
  }

  pub const fn name(&self) -> &'static str {
    self.name
  }

  pub const fn capacity(&self) -> usize {
    self.capacity
  }

  /// Items waiting (claimed items are not counted).
  pub fn len(&self) -> usize {
    self.state.lock().len
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  /// Items discarded by the `drop` policy so far.
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// Enqueue an item, waiting for space under the `block` policy.
  pub async fn push(&self, item: T) -> Result<PushOutcome, QueueClosed> {
    loop {
      let notified = self.not_full.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      {
        let mut state = self.state.lock();
        if state.closed {
          return Err(QueueClosed);
        }
        if state.len < self.capacity {
          state.enqueue(item);
          let len = state.len;
          drop(state);
          self.publish_depth(len);
          self.not_empty.notify_waiters();
          return Ok(PushOutcome::Accepted);
        }
        if self.policy == QueuePolicy::Drop {
          drop(state);
          self.dropped.fetch_add(1, Ordering::Relaxed);
          if let Some(counter) = &self.dropped_counter {
            counter.inc();
          }
          trace!(queue = self.name, "Queue full, item dropped");
          return Ok(PushOutcome::Dropped);
        }
      }

      notified.await;
    }
  }

  /// Take the next item whose instrument nobody else holds.
  ///
  /// Returns `None` once the queue is closed and empty. Cancel-safe: an
  /// item is only removed when the call completes.
  pub async fn claim(self: &Arc<Self>) -> Option<(T, KeyGuard<T>)> {
    loop {
      let notified = self.not_empty.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      {
        let mut state = self.state.lock();
        if let Some((item, key)) = state.take_ready() {
          let len = state.len;
          drop(state);
          self.publish_depth(len);
          self.not_full.notify_waiters();
          let guard = KeyGuard {
            queue: Arc::clone(self),
            key,
          };
          return Some((item, guard));
        }
        if state.closed && state.len == 0 {
          return None;
        }
      }

      notified.await;
    }
  }

  /// Refuse new items and wake everyone. Queued items stay claimable.
  pub fn close(&self) {
    self.state.lock().closed = true;
    self.not_empty.notify_waiters();
    self.not_full.notify_waiters();
  }

  fn release(&self, key: &InstrumentId) {
    if self.state.lock().release(key) {
      self.not_empty.notify_waiters();
    } else if self.is_closed() {
      // Consumers waiting for the last claim to end may now exit.
      self.not_empty.notify_waiters();
    }
  }

  fn publish_depth(&self, len: usize) {
    if let Some(gauge) = &self.depth_gauge {
      gauge.set(i64::try_from(len).unwrap_or(i64::MAX));
    }
  }
}

/// Exclusive hold on one instrument's lane. Dropping it lets the next
/// item for that instrument be claimed.
pub struct KeyGuard<T: Keyed> {
  queue: Arc<WorkQueue<T>>,
  key: InstrumentId,
}

impl<T: Keyed> KeyGuard<T> {
  pub fn key(&self) -> &InstrumentId {
    &self.key
  }
}

impl<T: Keyed> fmt::Debug for KeyGuard<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("KeyGuard").field("key", &self.key).finish_non_exhaustive()
  }
}

impl<T: Keyed> Drop for KeyGuard<T> {
  fn drop(&mut self) {
    self.queue.release(&self.key);
  }
}
