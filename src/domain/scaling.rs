//! Scaling Policy - Worker Count Decisions from Backlog Samples
//!
//! A deterministic state machine: the autoscaler feeds it one sample per
//! interval together with the current worker count and the sample time,
//! and gets back either `Hold` or a bounded `Resize`.
//!
//! Hysteresis comes from three places:
//! - distinct up/down depth thresholds
//! - a cooldown after every resize
//! - the rolling window is cleared on resize, so a scale-up always needs
//!   a fresh full window of evidence

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Bounds and thresholds for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingConfig {
  pub min_workers: usize,
  pub max_workers: usize,
  /// Samples in the rolling window.
  pub window: usize,
  /// Mean backlog at or above which the stage scales up.
  pub scale_up_depth: usize,
  /// Backlog at or below which the stage counts as idle.
  pub scale_down_depth: usize,
  /// Mean latency above which the stage scales up regardless of depth.
  pub scale_up_latency_ms: Option<f64>,
  /// Minimum time between resizes, and idle time before scaling down.
  pub cooldown: Duration,
  /// Workers added per scale-up.
  pub step: usize,
}

/// One observation of a stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSample {
  /// Items waiting in the stage's queue(s).
  pub depth: usize,
  /// Recent processing latency, if the stage measures one.
  pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleReason {
  Backlog,
  Latency,
  Idle,
  OutOfBounds,
}

impl fmt::Display for ScaleReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Backlog => write!(f, "backlog"),
      Self::Latency => write!(f, "latency"),
      Self::Idle => write!(f, "idle"),
      Self::OutOfBounds => write!(f, "out_of_bounds"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
  Hold,
  Resize {
    from: usize,
    to: usize,
    reason: ScaleReason,
  },
}

/// Per-stage scaling state.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
  config: ScalingConfig,
  samples: VecDeque<StageSample>,
  last_resize: Option<Instant>,
  idle_since: Option<Instant>,
}

impl ScalingPolicy {
  pub fn new(mut config: ScalingConfig) -> Self {
    config.min_workers = config.min_workers.max(1);
    config.max_workers = config.max_workers.max(config.min_workers);
    config.window = config.window.max(1);
    config.step = config.step.max(1);
    Self {
      samples: VecDeque::with_capacity(config.window),
      config,
      last_resize: None,
      idle_since: None,
    }
  }

  pub const fn config(&self) -> &ScalingConfig {
    &self.config
  }

  /// Record a sample and decide whether to resize.
  pub fn observe(&mut self, sample: StageSample, current: usize, now: Instant) -> ScaleDecision {
    let cfg = &self.config;

    if self.samples.len() == cfg.window {
      self.samples.pop_front();
    }
    self.samples.push_back(sample);

    if sample.depth <= cfg.scale_down_depth {
      self.idle_since.get_or_insert(now);
    } else {
      self.idle_since = None;
    }

    let bounded = current.clamp(cfg.min_workers, cfg.max_workers);
    if bounded != current {
      return self.resize(current, bounded, ScaleReason::OutOfBounds, now);
    }

    if let Some(at) = self.last_resize {
      if now.saturating_duration_since(at) < cfg.cooldown {
        return ScaleDecision::Hold;
      }
    }

    if current < cfg.max_workers && self.samples.len() == cfg.window {
      let reason = if self.backlog_growing() {
        Some(ScaleReason::Backlog)
      } else if self.latency_exceeded() {
        Some(ScaleReason::Latency)
      } else {
        None
      };
      if let Some(reason) = reason {
        let to = (current + cfg.step).min(cfg.max_workers);
        return self.resize(current, to, reason, now);
      }
    }

    if current > cfg.min_workers {
      if let Some(since) = self.idle_since {
        if now.saturating_duration_since(since) >= cfg.cooldown {
          return self.resize(current, current - 1, ScaleReason::Idle, now);
        }
      }
    }

    ScaleDecision::Hold
  }

  fn backlog_growing(&self) -> bool {
    let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
      return false;
    };
    let total: usize = self.samples.iter().map(|s| s.depth).sum();
    let mean = total / self.samples.len();
    mean >= self.config.scale_up_depth && last.depth >= first.depth
  }

  fn latency_exceeded(&self) -> bool {
    let Some(threshold) = self.config.scale_up_latency_ms else {
      return false;
    };
    let measured: Vec<f64> = self.samples.iter().filter_map(|s| s.latency_ms).collect();
    if measured.is_empty() {
      return false;
    }
    measured.iter().sum::<f64>() / measured.len() as f64 > threshold
  }

  fn resize(&mut self, from: usize, to: usize, reason: ScaleReason, now: Instant) -> ScaleDecision {
    self.last_resize = Some(now);
    self.samples.clear();
    if self.idle_since.is_some() {
      self.idle_since = Some(now);
    }
    ScaleDecision::Resize { from, to, reason }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config() -> ScalingConfig {
    ScalingConfig {
      min_workers: 2,
      max_workers: 6,
      window: 3,
      scale_up_depth: 100,
      scale_down_depth: 5,
      scale_up_latency_ms: Some(250.0),
      cooldown: Duration::from_secs(2),
      step: 1,
    }
  }

  fn depth(depth: usize) -> StageSample {
    StageSample {
      depth,
      latency_ms: None,
    }
  }

  #[test]
  fn scales_up_after_full_window_of_growth() {
    let mut policy = ScalingPolicy::new(config());
    let t0 = Instant::now();
    let step = Duration::from_millis(500);

    assert_eq!(policy.observe(depth(150), 2, t0), ScaleDecision::Hold);
    assert_eq!(policy.observe(depth(200), 2, t0 + step), ScaleDecision::Hold);
    assert_eq!(
      policy.observe(depth(250), 2, t0 + step * 2),
      ScaleDecision::Resize {
        from: 2,
        to: 3,
        reason: ScaleReason::Backlog
      }
    );
  }

  #[test]
  fn shrinking_backlog_does_not_scale_up() {
    let mut policy = ScalingPolicy::new(config());
    let t0 = Instant::now();
    policy.observe(depth(400), 2, t0);
    policy.observe(depth(300), 2, t0);
    assert_eq!(policy.observe(depth(200), 2, t0), ScaleDecision::Hold);
  }

  #[test]
  fn cooldown_blocks_consecutive_resizes() {
    let mut policy = ScalingPolicy::new(config());
    let t0 = Instant::now();
    for _ in 0..3 {
      policy.observe(depth(500), 2, t0);
    }
    // Window was cleared by the resize; refill it inside the cooldown.
    let t1 = t0 + Duration::from_millis(100);
    for _ in 0..3 {
      assert_eq!(policy.observe(depth(900), 3, t1), ScaleDecision::Hold);
    }
    let t2 = t0 + Duration::from_secs(3);
    assert!(matches!(
      policy.observe(depth(900), 3, t2),
      ScaleDecision::Resize { from: 3, to: 4, .. }
    ));
  }

  #[test]
  fn scales_down_after_idle_cooldown() {
    let mut policy = ScalingPolicy::new(config());
    let t0 = Instant::now();
    assert_eq!(policy.observe(depth(0), 4, t0), ScaleDecision::Hold);
    assert_eq!(
      policy.observe(depth(1), 4, t0 + Duration::from_secs(1)),
      ScaleDecision::Hold
    );
    assert_eq!(
      policy.observe(depth(0), 4, t0 + Duration::from_secs(2)),
      ScaleDecision::Resize {
        from: 4,
        to: 3,
        reason: ScaleReason::Idle
      }
    );
    // Next step down needs another full idle cooldown.
    assert_eq!(
      policy.observe(depth(0), 3, t0 + Duration::from_secs(3)),
      ScaleDecision::Hold
    );
  }

  #[test]
  fn never_scales_below_min() {
    let mut policy = ScalingPolicy::new(config());
    let t0 = Instant::now();
    for i in 0..20 {
      let decision = policy.observe(depth(0), 2, t0 + Duration::from_secs(i * 5));
      assert_eq!(decision, ScaleDecision::Hold);
    }
  }

  #[test]
  fn latency_triggers_scale_up() {
    let mut policy = ScalingPolicy::new(config());
    let t0 = Instant::now();
    let slow = StageSample {
      depth: 20,
      latency_ms: Some(400.0),
    };
    policy.observe(slow, 2, t0);
    policy.observe(slow, 2, t0);
    assert_eq!(
      policy.observe(slow, 2, t0),
      ScaleDecision::Resize {
        from: 2,
        to: 3,
        reason: ScaleReason::Latency
      }
    );
  }

  #[test]
  fn clamps_out_of_bounds_counts() {
    let mut policy = ScalingPolicy::new(config());
    let t0 = Instant::now();
    assert_eq!(
      policy.observe(depth(0), 9, t0),
      ScaleDecision::Resize {
        from: 9,
        to: 6,
        reason: ScaleReason::OutOfBounds
      }
    );
    assert_eq!(
      policy.observe(depth(0), 0, t0),
      ScaleDecision::Resize {
        from: 0,
        to: 2,
        reason: ScaleReason::OutOfBounds
      }
    );
  }
}
