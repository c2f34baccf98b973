//! Autoscaler - Worker Count Control Loop
//!
//! Every interval, each registered stage is sampled through its depth source,
//! the sample is fed to that stage's `ScalingPolicy`, and resize
//! decisions are applied to the stage's `WorkerPool`. The loop never
//! touches queues or records; it only changes pool sizes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::adapters::metrics::MetricsRegistry;
use crate::domain::scaling::{ScaleDecision, ScalingPolicy, StageSample};
use crate::usecases::worker_pool::WorkerPool;

/// Load signal a stage exports for scaling.
pub trait DepthSource: Send + Sync {
  fn sample(&self) -> StageSample;
}

struct ScaledStage {
  pool: Arc<WorkerPool>,
  source: Arc<dyn DepthSource>,
  policy: ScalingPolicy,
}

pub struct Autoscaler {
  interval: Duration,
  stages: Vec<ScaledStage>,
  metrics: Option<Arc<MetricsRegistry>>,
}

impl Autoscaler {
  pub fn new(interval: Duration) -> Self {
    Self {
      interval,
      stages: Vec::new(),
      metrics: None,
    }
  }

  pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
    self.metrics = Some(metrics);
    self
  }

  /// Put a stage under control.
  pub fn add_stage(&mut self, pool: Arc<WorkerPool>, source: Arc<dyn DepthSource>, policy: ScalingPolicy) {
    self.stages.push(ScaledStage {
      pool,
      source,
      policy,
    });
  }

  /// One control step: sample every stage and apply its decision.
  /// Returns the resizes that were applied.
  pub fn tick(&mut self, now: Instant) -> Vec<(&'static str, ScaleDecision)> {
    let mut applied = Vec::new();
    for stage in &mut self.stages {
      stage.pool.prune();
      let current = stage.pool.size();
      let sample = stage.source.sample();
      let decision = stage.policy.observe(sample, current, now);

      let ScaleDecision::Resize { from, to, reason } = decision else {
        continue;
      };
      let size = stage.pool.resize(to);
      if size == from {
        debug!(stage = stage.pool.stage(), workers = size, "Resize was a no-op");
        continue;
      }

      info!(
        stage = stage.pool.stage(),
        from,
        to = size,
        reason = %reason,
        depth = sample.depth,
        latency_ms = sample.latency_ms,
        "Scaled worker pool"
      );
      if let Some(m) = &self.metrics {
        m.scale_events
          .with_label_values(&[stage.pool.stage(), &reason.to_string()])
          .inc();
      }
      applied.push((
        stage.pool.stage(),
        ScaleDecision::Resize {
          from,
          to: size,
          reason,
        },
      ));
    }
    applied
  }

  /// Run until shutdown.
  #[instrument(skip_all, fields(interval_ms = self.interval.as_millis() as u64))]
  pub async fn run(mut self, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(stages = self.stages.len(), "Autoscaler started");
    loop {
      tokio::select! {
        () = shutdown.cancelled() => break,
        _ = ticker.tick() => {
          self.tick(Instant::now());
        }
      }
    }
    info!("Autoscaler stopped");
  }
}
