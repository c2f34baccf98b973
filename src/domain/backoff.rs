//! Exponential backoff with jitter.
//!
//! Shared by the stream connector (reconnects) and the persistence
//! writer (write retries).

use std::time::Duration;

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter: f64,
    /// Retry budget; 0 means unlimited.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 0,
        }
    }
}

/// Stateful backoff sequence. Call `reset` after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_delay,
            config,
            attempts: 0,
        }
    }

    /// Next delay, or `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;

        let delay = self.jittered(self.current);

        let next = self.current.as_secs_f64() * self.config.multiplier;
        self.current = if next.is_finite() && next > 0.0 {
            Duration::from_secs_f64(next).min(self.config.max_delay)
        } else {
            self.config.max_delay
        };

        Some(delay.min(self.config.max_delay))
    }

    pub const fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }

    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.config.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let base_secs = base.as_secs_f64();
        let range = base_secs * self.config.jitter;
        let offset: f64 = rand::rng().random_range(-range..=range);
        Duration::from_secs_f64((base_secs + offset).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn grows_exponentially_up_to_cap() {
        let mut backoff = Backoff::new(config(0));
        let delays: Vec<_> = (0..6).filter_map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 800, 800, 800].map(Duration::from_millis)
        );
    }

    #[test]
    fn budget_is_enforced_and_reset_restores_it() {
        let mut backoff = Backoff::new(config(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_band() {
        let mut cfg = config(0);
        cfg.jitter = 0.2;
        for _ in 0..100 {
            let mut backoff = Backoff::new(cfg);
            let d = backoff.next_delay().unwrap();
            assert!(d >= Duration::from_millis(80) && d <= Duration::from_millis(120));
        }
    }
}
