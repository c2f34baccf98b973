//! Hot-Path Benchmarks - Per-Tick Processing Cost
//!
//! Benchmarks the work done for every price update: decoding the feed
//! line, validating it into a canonical record and batching it.
//!
//! Run with: cargo bench --bench formatter_bench

use std::time::{Duration, Instant};

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rust_decimal_macros::dec;

use tidepool::adapters::feeds::oanda::{parse_frame, LineDecoder};
use tidepool::domain::batch::BatchAccumulator;
use tidepool::domain::formatter::Formatter;
use tidepool::domain::tick::RawTick;
use tidepool::ports::feed::FeedMessage;

const PRICE_LINE: &str = r#"{"type":"PRICE","time":"2024-03-05T10:00:00.123456789Z","bids":[{"price":"1.08512","liquidity":1000000}],"asks":[{"price":"1.08525","liquidity":1000000}],"closeoutBid":"1.08510","closeoutAsk":"1.08527","status":"tradeable","tradeable":true,"instrument":"EUR_USD"}"#;

fn raw_tick() -> RawTick {
    match parse_frame(PRICE_LINE, Utc::now()) {
        FeedMessage::Price(tick) => tick,
        other => panic!("benchmark frame did not decode: {other:?}"),
    }
}

/// Benchmark decoding one pricing line.
fn bench_parse_frame(c: &mut Criterion) {
    let now = Utc::now();

    c.bench_function("oanda_parse_price_frame", |b| {
        b.iter(|| parse_frame(black_box(PRICE_LINE), now));
    });
}

/// Benchmark splitting a chunked body holding 64 frames into lines.
fn bench_line_decoder(c: &mut Criterion) {
    let body = format!("{PRICE_LINE}\n").repeat(64).into_bytes();

    c.bench_function("line_decoder_64_frames", |b| {
        b.iter_batched(
            LineDecoder::new,
            |mut decoder| {
                let mut lines = 0;
                for chunk in body.chunks(1024) {
                    lines += decoder.push(black_box(chunk)).len();
                }
                lines
            },
            BatchSize::SmallInput,
        );
    });
}

/// Benchmark validating a well-formed tick.
fn bench_format_valid(c: &mut Criterion) {
    let formatter = Formatter::new(dec!(0.05));
    let tick = raw_tick();

    c.bench_function("formatter_valid_tick", |b| {
        b.iter(|| formatter.format(black_box(&tick)));
    });
}

/// Benchmark rejecting a tick with a missing price.
fn bench_format_quarantine(c: &mut Criterion) {
    let formatter = Formatter::new(dec!(0.05));
    let mut tick = raw_tick();
    tick.bid = None;

    c.bench_function("formatter_missing_bid", |b| {
        b.iter(|| formatter.format(black_box(&tick)));
    });
}

/// Benchmark batching 1000 records across four instruments.
fn bench_batch_accumulator(c: &mut Criterion) {
    let formatter = Formatter::new(dec!(0.05));
    let instruments = ["EUR_USD", "USD_JPY", "GBP_USD", "XAU_USD"];
    let records: Vec<_> = (0..1000u64)
        .map(|seq| {
            let mut tick = raw_tick();
            tick.instrument = instruments[(seq % 4) as usize].into();
            tick.sequence = seq;
            formatter.format(&tick).unwrap()
        })
        .collect();

    c.bench_function("batch_accumulator_1000_records", |b| {
        b.iter_batched(
            || records.clone(),
            |records| {
                let mut acc = BatchAccumulator::new(500, Duration::from_secs(1));
                let now = Instant::now();
                let mut flushed = 0;
                for record in records {
                    flushed += acc.push(record, now).map_or(0, |b| b.len());
                }
                flushed + acc.drain().iter().map(|b| b.len()).sum::<usize>()
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    bench_parse_frame,
    bench_line_decoder,
    bench_format_valid,
    bench_format_quarantine,
    bench_batch_accumulator,
);
criterion_main!(benches);
