//! Stall Detection State Machine
//!
//! `HealthStore` keeps one `HealthState` per instrument and turns count
//! samples into transitions. It has no clock and no I/O: the monitor
//! passes the sample time in, which keeps every transition testable.
//!
//! Per instrument:
//! - first sample sets the baseline
//! - growth resets the no-change counter and clears a stall
//! - no growth inside a quiet window resets the counter, never alerts
//! - no growth outside quiet windows increments the counter; reaching
//!   the threshold marks the instrument stalled and alerts exactly once

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::quiet_hours::QuietHours;
use crate::domain::tick::InstrumentId;

/// One count observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSample {
    pub instrument: InstrumentId,
    pub count: u64,
    pub observed_at: DateTime<Utc>,
}

/// Health bookkeeping for one instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthState {
    /// Count at the previous sample.
    pub last_count: Option<u64>,
    /// Time of the previous sample.
    pub last_sample_at: Option<DateTime<Utc>>,
    /// Last time the count was seen to change.
    pub last_change_at: Option<DateTime<Utc>>,
    /// Consecutive active samples without growth.
    pub unchanged_samples: u32,
    /// Whether the instrument is currently considered stalled.
    pub stalled: bool,
    /// Records per second between the last two samples.
    pub rate_per_sec: f64,
}

/// What a sample did to an instrument's state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthTransition {
    /// First sample for the instrument.
    Baseline,
    /// Count grew.
    Progressing { delta: u64 },
    /// Count grew after a stall; the stall is cleared.
    Recovered { delta: u64 },
    /// Count went down (collection truncated or replaced).
    Reset { from: u64, to: u64 },
    /// No growth, counter below threshold.
    Unchanged { streak: u32 },
    /// No growth inside a quiet window.
    Quiet,
    /// Threshold reached: raise exactly one alert.
    Stalled { streak: u32 },
    /// Still stalled; alert already raised.
    StillStalled { streak: u32 },
}

impl HealthTransition {
    /// Whether this transition must produce an alert.
    pub const fn raises_alert(&self) -> bool {
        matches!(self, Self::Stalled { .. })
    }
}

/// Per-instrument health states for one monitor lifecycle.
#[derive(Debug)]
pub struct HealthStore {
    stall_threshold: u32,
    quiet_hours: QuietHours,
    states: HashMap<InstrumentId, HealthState>,
}

impl HealthStore {
    pub fn new(stall_threshold: u32, quiet_hours: QuietHours) -> Self {
        Self {
            stall_threshold: stall_threshold.max(1),
            quiet_hours,
            states: HashMap::new(),
        }
    }

    /// Apply one sample.
    pub fn observe(&mut self, sample: &HealthSample) -> HealthTransition {
        let threshold = self.stall_threshold;
        let quiet = self.quiet_hours.contains(sample.observed_at);
        let state = self.states.entry(sample.instrument.clone()).or_default();

        let previous = state.last_count.replace(sample.count);
        let previous_at = state.last_sample_at.replace(sample.observed_at);

        let Some(previous) = previous else {
            state.last_change_at = Some(sample.observed_at);
            return HealthTransition::Baseline;
        };

        state.rate_per_sec = rate(previous, sample.count, previous_at, sample.observed_at);

        if sample.count < previous {
            state.unchanged_samples = 0;
            state.stalled = false;
            state.last_change_at = Some(sample.observed_at);
            return HealthTransition::Reset {
                from: previous,
                to: sample.count,
            };
        }

        let delta = sample.count - previous;
        if delta > 0 {
            state.unchanged_samples = 0;
            state.last_change_at = Some(sample.observed_at);
            if state.stalled {
                state.stalled = false;
                return HealthTransition::Recovered { delta };
            }
            return HealthTransition::Progressing { delta };
        }

        if quiet {
            state.unchanged_samples = 0;
            return HealthTransition::Quiet;
        }

        state.unchanged_samples = state.unchanged_samples.saturating_add(1);
        let streak = state.unchanged_samples;
        if streak < threshold {
            return HealthTransition::Unchanged { streak };
        }
        if state.stalled {
            return HealthTransition::StillStalled { streak };
        }
        state.stalled = true;
        HealthTransition::Stalled { streak }
    }

    pub fn get(&self, instrument: &InstrumentId) -> Option<&HealthState> {
        self.states.get(instrument)
    }

    /// Clear one instrument's stall and counter, leaving others alone.
    /// Returns whether the instrument was stalled.
    pub fn clear(&mut self, instrument: &InstrumentId) -> bool {
        self.states.get_mut(instrument).is_some_and(|state| {
            let was_stalled = state.stalled;
            state.stalled = false;
            state.unchanged_samples = 0;
            was_stalled
        })
    }

    /// Instruments currently stalled, sorted.
    pub fn stalled(&self) -> Vec<InstrumentId> {
        let mut stalled: Vec<_> = self
            .states
            .iter()
            .filter(|(_, s)| s.stalled)
            .map(|(id, _)| id.clone())
            .collect();
        stalled.sort();
        stalled
    }

    /// Copy of every state, for status reporting.
    pub fn snapshot(&self) -> Vec<(InstrumentId, HealthState)> {
        let mut all: Vec<_> = self
            .states
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drop all state (monitor teardown).
    pub fn reset(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

fn rate(
    previous: u64,
    current: u64,
    previous_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> f64 {
    let Some(previous_at) = previous_at else {
        return 0.0;
    };
    let elapsed = (now - previous_at).num_milliseconds();
    if elapsed <= 0 || current < previous {
        return 0.0;
    }
    (current - previous) as f64 * 1000.0 / elapsed as f64
}
