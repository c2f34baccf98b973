//! Property-Based Tests - Domain Layer Invariants
//!
//! Uses `proptest` to verify that the pure domain components keep their
//! invariants across random inputs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use tidepool::domain::backoff::{Backoff, BackoffConfig};
use tidepool::domain::batch::BatchAccumulator;
use tidepool::domain::formatter::Formatter;
use tidepool::domain::health::{HealthSample, HealthStore};
use tidepool::domain::quiet_hours::QuietHours;
use tidepool::domain::scaling::{ScaleDecision, ScalingConfig, ScalingPolicy, StageSample};
use tidepool::domain::tick::{CanonicalRecord, InstrumentId, RawTick, WriteBatch};

const INSTRUMENTS: [&str; 3] = ["EUR_USD", "USD_JPY", "XAU_USD"];

fn record(instrument: &str, sequence: u64) -> CanonicalRecord {
    CanonicalRecord {
        instrument: instrument.into(),
        sequence,
        time: Utc::now(),
        bid: dec!(1.2),
        ask: dec!(1.3),
        status: None,
        tradeable: true,
        received_at: Utc::now(),
    }
}

fn minute(n: i64) -> DateTime<Utc> {
    // Wednesday noon, far from any weekend window.
    Utc.with_ymd_and_hms(2024, 3, 6, 12, 0, 0).unwrap() + chrono::Duration::minutes(n)
}

// ── Scaling Policy Properties ───────────────────────────────

proptest! {
    /// Whatever the load pattern, a resize never leaves [min, max].
    #[test]
    fn scaling_stays_within_bounds(
        min in 1usize..4,
        extra in 0usize..6,
        step in 1usize..4,
        depths in prop::collection::vec(0usize..500, 1..80),
        latencies in prop::collection::vec(prop::option::of(0.0f64..1000.0), 80),
    ) {
        let max = min + extra;
        let mut policy = ScalingPolicy::new(ScalingConfig {
            min_workers: min,
            max_workers: max,
            window: 3,
            scale_up_depth: 100,
            scale_down_depth: 10,
            scale_up_latency_ms: Some(400.0),
            cooldown: Duration::from_millis(50),
            step,
        });
        let start = Instant::now();
        let mut current = min;
        for (i, depth) in depths.iter().enumerate() {
            let sample = StageSample { depth: *depth, latency_ms: latencies[i] };
            let now = start + Duration::from_millis(20 * i as u64);
            if let ScaleDecision::Resize { from, to, .. } = policy.observe(sample, current, now) {
                prop_assert_eq!(from, current);
                prop_assert!(to >= min && to <= max, "resized to {} outside [{}, {}]", to, min, max);
                prop_assert_ne!(from, to);
                current = to;
            }
        }
    }
}

// ── Health Store Properties ─────────────────────────────────

proptest! {
    /// A frozen count raises exactly one alert, however long it stays
    /// frozen, and exactly one more after the stall is cleared.
    #[test]
    fn frozen_count_alerts_once_until_cleared(
        threshold in 1u32..6,
        count in 0u64..1_000_000,
        polls in 1usize..40,
    ) {
        let id = InstrumentId::from("EUR_USD");
        let mut store = HealthStore::new(threshold, QuietHours::none());
        let observe = |store: &mut HealthStore, n: i64| {
            store
                .observe(&HealthSample { instrument: id.clone(), count, observed_at: minute(n) })
                .raises_alert()
        };

        let first_round = threshold as usize + polls;
        let alerts = (0..=first_round as i64).filter(|n| observe(&mut store, *n)).count();
        prop_assert_eq!(alerts, 1);

        prop_assert!(store.clear(&id));
        let base = first_round as i64 + 1;
        let alerts = (base..base + threshold as i64 + 3).filter(|n| observe(&mut store, *n)).count();
        prop_assert_eq!(alerts, 1);
    }

    /// Counts that grow at every poll never alert.
    #[test]
    fn growing_count_never_alerts(
        threshold in 1u32..6,
        deltas in prop::collection::vec(1u64..500, 1..60),
    ) {
        let id = InstrumentId::from("USD_JPY");
        let mut store = HealthStore::new(threshold, QuietHours::none());
        let mut count = 0;
        for (n, delta) in deltas.iter().enumerate() {
            count += delta;
            let transition = store.observe(&HealthSample {
                instrument: id.clone(),
                count,
                observed_at: minute(n as i64),
            });
            prop_assert!(!transition.raises_alert());
        }
        prop_assert!(store.stalled().is_empty());
    }
}

// ── Batch Accumulator Properties ────────────────────────────

proptest! {
    /// Flushed batches, concatenated per instrument, hold every record
    /// exactly once in arrival order.
    #[test]
    fn batching_preserves_per_instrument_order(
        max_records in 1usize..12,
        picks in prop::collection::vec(0usize..INSTRUMENTS.len(), 0..200),
        expire_every in 1usize..20,
    ) {
        let mut acc = BatchAccumulator::new(max_records, Duration::from_millis(10));
        let start = Instant::now();
        let mut next_seq: HashMap<&str, u64> = HashMap::new();
        let mut flushed: HashMap<InstrumentId, Vec<u64>> = HashMap::new();
        let mut collect = |batches: Vec<WriteBatch>| {
            for batch in batches {
                assert!(!batch.is_empty());
                assert!(batch.len() <= max_records);
                assert!(batch.records.iter().all(|r| r.instrument == batch.instrument));
                flushed
                    .entry(batch.instrument.clone())
                    .or_default()
                    .extend(batch.records.iter().map(|r| r.sequence));
            }
        };

        for (i, pick) in picks.iter().enumerate() {
            let instrument = INSTRUMENTS[*pick];
            let seq = next_seq.entry(instrument).or_insert(0);
            *seq += 1;
            let now = start + Duration::from_millis(i as u64);
            collect(acc.push(record(instrument, *seq), now).into_iter().collect());
            if i % expire_every == 0 {
                collect(acc.take_expired(now));
            }
        }
        collect(acc.drain());
        prop_assert_eq!(acc.pending_records(), 0);

        for (instrument, last) in next_seq {
            let expected: Vec<u64> = (1..=last).collect();
            prop_assert_eq!(&flushed[&InstrumentId::from(instrument)], &expected);
        }
    }
}

// ── Formatter Properties ────────────────────────────────────

fn raw_tick(time: Option<String>, bid: Option<String>, ask: Option<String>) -> RawTick {
    RawTick {
        instrument: "EUR_USD".into(),
        sequence: 7,
        time,
        bid,
        ask,
        status: None,
        tradeable: None,
        received_at: Utc::now(),
        payload: String::new(),
    }
}

proptest! {
    /// Arbitrary field text never panics, and anything accepted is a
    /// sane quote.
    #[test]
    fn formatter_never_panics(
        time in prop::option::of(".{0,40}"),
        bid in prop::option::of("[-+0-9.eE]{0,16}"),
        ask in prop::option::of(".{0,16}"),
    ) {
        let formatter = Formatter::new(dec!(0.05));
        if let Ok(record) = formatter.format(&raw_tick(time, bid, ask)) {
            prop_assert!(record.bid > Decimal::ZERO);
            prop_assert!(record.ask >= record.bid);
            prop_assert_eq!(record.sequence, 7);
        }
    }

    /// Well-formed quotes inside the spread limit are always accepted.
    #[test]
    fn valid_quotes_are_accepted(
        bid_pips in 5_000u32..20_000,
        spread_pips in 0u32..50,
        nanos in 0u32..1_000_000_000,
    ) {
        let bid = Decimal::new(i64::from(bid_pips), 4);
        let ask = Decimal::new(i64::from(bid_pips + spread_pips), 4);
        let time = format!("2024-03-06T12:00:00.{nanos:09}Z");
        let formatter = Formatter::new(dec!(0.05));
        let record = formatter
            .format(&raw_tick(Some(time), Some(bid.to_string()), Some(ask.to_string())))
            .unwrap();
        prop_assert_eq!(record.bid, bid);
        prop_assert_eq!(record.ask, ask);
        prop_assert_eq!(record.time.timestamp_subsec_nanos(), nanos);
    }
}

// ── Backoff Properties ──────────────────────────────────────

proptest! {
    /// Delays never exceed the cap and the budget is honoured.
    #[test]
    fn backoff_respects_cap_and_budget(
        initial_ms in 1u64..1_000,
        cap_factor in 1u64..50,
        multiplier in 1.0f64..4.0,
        jitter in 0.0f64..1.0,
        budget in 1u32..30,
    ) {
        let max_delay = Duration::from_millis(initial_ms * cap_factor);
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay,
            multiplier,
            jitter,
            max_attempts: budget,
        });
        let mut given = 0;
        while let Some(delay) = backoff.next_delay() {
            prop_assert!(delay <= max_delay);
            given += 1;
            prop_assert!(given <= budget);
        }
        prop_assert_eq!(given, budget);

        backoff.reset();
        prop_assert!(backoff.next_delay().is_some());
    }
}
