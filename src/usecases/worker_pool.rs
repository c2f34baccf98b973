//! Worker Pool - Resizable Set of Stage Workers
//!
//! Each worker is a tokio task built by the stage's factory. Workers
//! removed by a resize get their token cancelled and finish the item they
//! hold before exiting. Workers that die on their own are pruned and
//! replaced up to the pool minimum.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::IntGauge;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

use crate::adapters::metrics::MetricsRegistry;

/// Handed to each worker when it is spawned.
#[derive(Debug, Clone)]
pub struct WorkerContext {
  pub id: usize,
  /// Cancelled when the pool retires this worker.
  pub cancel: CancellationToken,
}

type WorkerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Factory = Arc<dyn Fn(WorkerContext) -> WorkerFuture + Send + Sync>;

struct Worker {
  id: usize,
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
  active: Vec<Worker>,
  retiring: Vec<Worker>,
  next_id: usize,
  draining: bool,
}

/// Pool of workers for one stage, bounded to `[min, max]`.
pub struct WorkerPool {
  stage: &'static str,
  min: usize,
  max: usize,
  factory: Factory,
  workers: Mutex<Workers>,
  gauge: Option<IntGauge>,
}

impl WorkerPool {
  pub fn new<F, Fut>(stage: &'static str, min: usize, max: usize, factory: F) -> Self
  where
    F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let min = min.max(1);
    Self {
      stage,
      min,
      max: max.max(min),
      factory: Arc::new(move |ctx| Box::pin(factory(ctx)) as WorkerFuture),
      workers: Mutex::new(Workers::default()),
      gauge: None,
    }
  }

  pub fn with_metrics(mut self, metrics: &MetricsRegistry) -> Self {
    self.gauge = Some(metrics.workers.with_label_values(&[self.stage]));
    self
  }

  pub const fn stage(&self) -> &'static str {
    self.stage
  }

  pub const fn min(&self) -> usize {
    self.min
  }

  pub const fn max(&self) -> usize {
    self.max
  }

  /// Spawn the minimum number of workers.
  pub fn start(&self) -> usize {
    self.resize(self.min)
  }

  /// Active workers (retiring ones are not counted).
  pub fn size(&self) -> usize {
    self.workers.lock().active.len()
  }

  /// Grow or shrink toward `target`, clamped to `[min, max]`. Returns the
  /// new size. Has no effect once the pool is draining.
  pub fn resize(&self, target: usize) -> usize {
    let target = target.clamp(self.min, self.max);
    let mut workers = self.workers.lock();
    if workers.draining {
      return workers.active.len();
    }

    while workers.active.len() < target {
      let worker = self.spawn(&mut workers);
      workers.active.push(worker);
    }
    while workers.active.len() > target {
      if let Some(worker) = workers.active.pop() {
        worker.cancel.cancel();
        workers.retiring.push(worker);
      }
    }
    workers.retiring.retain(|w| !w.handle.is_finished());

    let size = workers.active.len();
    self.publish(size);
    size
  }

  /// Replace workers that exited unexpectedly. Returns how many were
  /// replaced.
  pub fn prune(&self) -> usize {
    let mut workers = self.workers.lock();
    let before = workers.active.len();
    workers.active.retain(|w| {
      let finished = w.handle.is_finished();
      if finished {
        warn!(stage = self.stage, worker = w.id, "Worker exited unexpectedly");
      }
      !finished
    });
    workers.retiring.retain(|w| !w.handle.is_finished());
    let lost = before - workers.active.len();
    if workers.draining {
      return 0;
    }

    let mut replaced = 0;
    while workers.active.len() < self.min {
      let worker = self.spawn(&mut workers);
      workers.active.push(worker);
      replaced += 1;
    }
    if lost > 0 || replaced > 0 {
      self.publish(workers.active.len());
    }
    replaced
  }

  /// Wait for every worker to exit on its own, aborting whatever is
  /// still running at the deadline. Returns the number aborted.
  ///
  /// Workers are expected to exit once their input queue is closed and
  /// empty; drain does not cancel them.
  pub async fn drain(&self, timeout: Duration) -> usize {
    let pending: Vec<Worker> = {
      let mut workers = self.workers.lock();
      workers.draining = true;
      let mut all = std::mem::take(&mut workers.active);
      all.append(&mut workers.retiring);
      all
    };

    let deadline = tokio::time::Instant::now() + timeout;
    let mut aborted = 0;
    for worker in pending {
      let mut handle = worker.handle;
      if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
        warn!(stage = self.stage, worker = worker.id, "Worker did not finish before drain deadline");
        handle.abort();
        aborted += 1;
      }
    }
    self.publish(0);
    aborted
  }

  fn spawn(&self, workers: &mut Workers) -> Worker {
    let id = workers.next_id;
    workers.next_id += 1;
    let cancel = CancellationToken::new();
    let context = WorkerContext {
      id,
      cancel: cancel.clone(),
    };
    let span = info_span!("worker", stage = self.stage, id);
    let handle = tokio::spawn((self.factory)(context).instrument(span));
    Worker { id, cancel, handle }
  }

  fn publish(&self, size: usize) {
    if let Some(gauge) = &self.gauge {
      gauge.set(i64::try_from(size).unwrap_or(i64::MAX));
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  fn idle_pool(min: usize, max: usize) -> WorkerPool {
    WorkerPool::new("test", min, max, |ctx: WorkerContext| async move {
      ctx.cancel.cancelled().await;
    })
  }

  #[tokio::test]
  async fn resize_stays_within_bounds() {
    let pool = idle_pool(2, 4);
    assert_eq!(pool.start(), 2);
    assert_eq!(pool.resize(10), 4);
    assert_eq!(pool.resize(0), 2);
    assert_eq!(pool.size(), 2);
  }

  #[tokio::test]
  async fn retired_workers_exit() {
    let exited = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&exited);
    let pool = WorkerPool::new("test", 1, 3, move |ctx: WorkerContext| {
      let counter = Arc::clone(&counter);
      async move {
        ctx.cancel.cancelled().await;
        counter.fetch_add(1, Ordering::SeqCst);
      }
    });
    pool.resize(3);
    pool.resize(1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(exited.load(Ordering::SeqCst), 2);
    assert_eq!(pool.size(), 1);
  }

  #[tokio::test]
  async fn dead_workers_are_replaced_up_to_min() {
    let spawned = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&spawned);
    let pool = WorkerPool::new("test", 2, 4, move |ctx: WorkerContext| {
      let n = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        // The first worker dies immediately.
        if n > 0 {
          ctx.cancel.cancelled().await;
        }
      }
    });
    pool.start();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(pool.prune(), 1);
    assert_eq!(pool.size(), 2);
    assert_eq!(spawned.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn drain_aborts_stuck_workers() {
    let pool = WorkerPool::new("test", 2, 2, |_ctx: WorkerContext| std::future::pending::<()>());
    pool.start();
    let aborted = pool.drain(Duration::from_millis(20)).await;
    assert_eq!(aborted, 2);
    assert_eq!(pool.size(), 0);
    // Draining pools refuse to grow.
    assert_eq!(pool.resize(2), 0);
  }

  #[tokio::test]
  async fn exports_worker_count() {
    let metrics = MetricsRegistry::new().unwrap();
    let pool = idle_pool(1, 3).with_metrics(&metrics);
    pool.resize(3);
    assert_eq!(metrics.workers.with_label_values(&["test"]).get(), 3);
  }
}
