//! Integration Tests - Stage Interaction Through Mocked Ports
//!
//! Drives usecases against mockall doubles of the storage, supervisor
//! and feed ports. Uses tokio::test for async tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{stream, StreamExt};
use mockall::mock;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tidepool::adapters::metrics::MetricsRegistry;
use tidepool::adapters::storage::OverflowBuffer;
use tidepool::config::QueuePolicy;
use tidepool::domain::backoff::BackoffConfig;
use tidepool::domain::health::{HealthStore, HealthTransition};
use tidepool::domain::quiet_hours::QuietHours;
use tidepool::domain::tick::{
    CanonicalRecord, GapMarker, InstrumentId, RawFrame, RawTick, StreamEvent, WriteBatch,
};
use tidepool::error::{ConnectivityError, StorageError, SupervisorError};
use tidepool::ports::feed::{FeedMessage, FeedSession};
use tidepool::ports::supervisor::ServiceStatus;
use tidepool::usecases::{
    ConnectorSettings, HealthMonitor, PersistenceWriter, StreamConnector, WorkQueue, WorkerContext,
    WriterSettings,
};

// ---- Mock Definitions ----

mock! {
    pub Store {}

    #[async_trait::async_trait]
    impl tidepool::ports::storage::RecordStore for Store {
        async fn insert_batch(&self, batch: &WriteBatch) -> Result<usize, StorageError>;
        async fn count(&self, instrument: &InstrumentId) -> Result<u64, StorageError>;
        async fn last_sequence(&self, instrument: &InstrumentId) -> Result<Option<u64>, StorageError>;
        async fn instruments(&self) -> Result<Vec<InstrumentId>, StorageError>;
        async fn record_gap(&self, gap: &GapMarker) -> Result<(), StorageError>;
        async fn record_raw(&self, frames: &[RawFrame]) -> Result<(), StorageError>;
        async fn is_healthy(&self) -> bool;
    }
}

mock! {
    pub Supervisor {}

    #[async_trait::async_trait]
    impl tidepool::ports::supervisor::ServiceSupervisor for Supervisor {
        async fn restart(&self, service: &str) -> Result<(), SupervisorError>;
        async fn status(&self, service: &str) -> Result<ServiceStatus, SupervisorError>;
    }
}

mock! {
    pub Feed {}

    #[async_trait::async_trait]
    impl tidepool::ports::feed::FeedTransport for Feed {
        async fn open(&self, instruments: &[InstrumentId]) -> Result<FeedSession, ConnectivityError>;
    }
}

// ---- Helpers ----

/// A Wednesday, well outside the FX weekend close.
fn wednesday(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 6, 9, minute, 0).unwrap()
}

/// A Saturday, inside the FX weekend close.
fn saturday(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 2, 9, minute, 0).unwrap()
}

fn fx_weekend() -> QuietHours {
    QuietHours::parse([("Fri 21:00", "Sun 21:00")]).unwrap()
}

/// Storage reporting a fixed count for one instrument.
fn frozen_store(count: u64) -> MockStore {
    let mut store = MockStore::new();
    store.expect_instruments().returning(|| Ok(vec![]));
    store.expect_count().returning(move |_| Ok(count));
    store
}

fn monitor(store: MockStore, supervisor: MockSupervisor, quiet_hours: QuietHours) -> HealthMonitor {
    HealthMonitor::new(
        Arc::new(store),
        Arc::new(supervisor),
        HealthStore::new(3, quiet_hours),
        vec!["EUR_USD".into()],
        "tidepool",
        Duration::from_secs(60),
    )
}

fn record(instrument: &str, sequence: u64) -> CanonicalRecord {
    CanonicalRecord {
        instrument: instrument.into(),
        sequence,
        time: Utc::now(),
        bid: dec!(1.0841),
        ask: dec!(1.0843),
        status: Some("tradeable".into()),
        tradeable: true,
        received_at: Utc::now(),
    }
}

fn price(payload: &str) -> Result<FeedMessage, ConnectivityError> {
    Ok(FeedMessage::Price(RawTick {
        instrument: "EUR_USD".into(),
        sequence: 0,
        time: Some("2024-03-06T09:00:00.123456789Z".into()),
        bid: Some("1.08410".into()),
        ask: Some("1.08430".into()),
        status: Some("tradeable".into()),
        tradeable: Some(true),
        received_at: Utc::now(),
        payload: payload.into(),
    }))
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ---- Health Monitor ----

#[tokio::test]
async fn test_stall_alerts_once_and_restarts_once() {
    let mut supervisor = MockSupervisor::new();
    supervisor
        .expect_status()
        .returning(|_| Ok(ServiceStatus::Active));
    supervisor
        .expect_restart()
        .times(1)
        .returning(|service| {
            assert_eq!(service, "tidepool");
            Ok(())
        });

    let mut monitor = monitor(frozen_store(1200), supervisor, QuietHours::none());

    let mut alerts = 0;
    let mut transitions = Vec::new();
    for minute in 0..8 {
        let report = monitor.poll_once(wednesday(minute)).await;
        alerts += report.alerts.len();
        transitions.extend(report.transitions.into_iter().map(|(_, t)| t));
    }

    assert_eq!(alerts, 1);
    assert_eq!(transitions[0], HealthTransition::Baseline);
    assert_eq!(transitions[3], HealthTransition::Stalled { streak: 3 });
    assert!(matches!(transitions[4], HealthTransition::StillStalled { .. }));
    assert_eq!(monitor.health().stalled(), vec![InstrumentId::from("EUR_USD")]);
}

#[tokio::test]
async fn test_quiet_hours_never_alert() {
    let mut supervisor = MockSupervisor::new();
    supervisor.expect_status().never();
    supervisor.expect_restart().never();

    let mut monitor = monitor(frozen_store(500), supervisor, fx_weekend());

    for minute in 0..10 {
        let report = monitor.poll_once(saturday(minute)).await;
        assert!(report.alerts.is_empty());
        assert!(!report.restarted);
    }
    let state = monitor.health().get(&"EUR_USD".into()).unwrap();
    assert!(!state.stalled);
    assert_eq!(state.unchanged_samples, 0);
}

#[tokio::test]
async fn test_growing_counts_never_alert() {
    let mut store = MockStore::new();
    let count = Arc::new(AtomicU64::new(100));
    store.expect_instruments().returning(|| Ok(vec![]));
    store
        .expect_count()
        .returning(move |_| Ok(count.fetch_add(7, Ordering::SeqCst)));

    let mut supervisor = MockSupervisor::new();
    supervisor.expect_restart().never();

    let mut monitor = monitor(store, supervisor, QuietHours::none());
    for minute in 0..6 {
        let report = monitor.poll_once(wednesday(minute)).await;
        assert!(report.alerts.is_empty());
    }
    let state = monitor.health().get(&"EUR_USD".into()).unwrap();
    assert_eq!(state.last_count, Some(135));
    assert!(state.rate_per_sec > 0.0);
}

#[tokio::test]
async fn test_failed_restart_is_counted() {
    let mut supervisor = MockSupervisor::new();
    supervisor
        .expect_status()
        .returning(|_| Ok(ServiceStatus::Failed));
    supervisor.expect_restart().times(1).returning(|service| {
        Err(SupervisorError::Failed {
            command: format!("systemctl restart {service}"),
            code: Some(1),
            stderr: "Unit not found".into(),
        })
    });

    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let mut monitor =
        monitor(frozen_store(42), supervisor, QuietHours::none()).with_metrics(Arc::clone(&metrics));

    let mut restarted = false;
    for minute in 0..4 {
        restarted |= monitor.poll_once(wednesday(minute)).await.restarted;
    }
    assert!(!restarted);
    assert_eq!(metrics.health_restarts.with_label_values(&["error"]).get(), 1);
    assert_eq!(metrics.health_alerts.with_label_values(&["EUR_USD"]).get(), 1);
    assert_eq!(metrics.health_stalled.with_label_values(&["EUR_USD"]).get(), 1);
}

#[tokio::test]
async fn test_discovered_collections_are_watched() {
    let mut store = MockStore::new();
    store
        .expect_instruments()
        .returning(|| Ok(vec!["EUR_USD".into(), "XAU_USD".into()]));
    store.expect_count().returning(|instrument| match instrument.as_str() {
        "XAU_USD" => Err(StorageError::Unavailable("collection locked".into())),
        _ => Ok(10),
    });

    let mut monitor = monitor(store, MockSupervisor::new(), QuietHours::none());
    let report = monitor.poll_once(wednesday(0)).await;

    assert_eq!(report.transitions.len(), 1);
    assert_eq!(report.failed, vec![InstrumentId::from("XAU_USD")]);
}

// ---- Stream Connector ----

#[tokio::test]
async fn test_connector_reconnects_through_feed_port() {
    let opened = Arc::new(AtomicU32::new(0));
    let mut feed = MockFeed::new();
    {
        let opened = Arc::clone(&opened);
        feed.expect_open().times(3).returning(move |instruments| {
            assert_eq!(instruments, [InstrumentId::from("EUR_USD")]);
            match opened.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(stream::iter(vec![price("a"), price("b")]).boxed()),
                1 => Err(ConnectivityError::Http {
                    status: 503,
                    body: "maintenance".into(),
                }),
                _ => Ok(stream::iter(vec![price("c")]).chain(stream::pending()).boxed()),
            }
        });
    }

    let settings = ConnectorSettings {
        heartbeat_timeout: Duration::from_secs(5),
        reconnect: BackoffConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 5,
        },
        dedup_window: 32,
    };
    let mut connector = StreamConnector::new(Arc::new(feed), vec!["EUR_USD".into()], settings);

    let mut events = Vec::new();
    for _ in 0..4 {
        events.push(connector.next_event().await.unwrap());
    }

    let sequences: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Tick(t) => Some(t.sequence),
            StreamEvent::Gap(_) => None,
        })
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    let StreamEvent::Gap(gap) = &events[2] else {
        panic!("expected gap after the session ended, got {:?}", events[2]);
    };
    assert_eq!(gap.attempts, 2);
    assert_eq!(opened.load(Ordering::SeqCst), 3);
}

// ---- Persistence Writer ----

#[tokio::test]
async fn test_writer_spills_during_outage_and_replays_in_order() {
    let down = Arc::new(AtomicBool::new(true));
    let persisted: Arc<Mutex<HashMap<InstrumentId, Vec<u64>>>> = Arc::default();

    let mut store = MockStore::new();
    {
        let down = Arc::clone(&down);
        let persisted = Arc::clone(&persisted);
        store.expect_insert_batch().returning(move |batch| {
            if down.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("connection refused".into()));
            }
            let mut persisted = persisted.lock();
            let seqs = persisted.entry(batch.instrument.clone()).or_default();
            let mut written = 0;
            for r in &batch.records {
                if seqs.last().is_none_or(|last| r.sequence > *last) {
                    seqs.push(r.sequence);
                    written += 1;
                }
            }
            Ok(written)
        });
    }

    let dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let overflow = Arc::new(OverflowBuffer::open(dir.path(), 100).await.unwrap());
    let records = Arc::new(WorkQueue::new("records", 100, QueuePolicy::Block));
    let jobs = Arc::new(WorkQueue::new("batches", 16, QueuePolicy::Block));
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let writer = Arc::new(PersistenceWriter::new(
        Arc::new(store),
        overflow,
        Arc::clone(&records),
        jobs,
        WriterSettings {
            batch_size: 4,
            flush_interval: Duration::from_millis(20),
            overflow_after: Duration::from_millis(15),
            replay_interval: Duration::from_millis(10),
            retry: BackoffConfig {
                initial_delay: Duration::from_millis(2),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
                jitter: 0.0,
                max_attempts: 0,
            },
        },
        Arc::clone(&metrics),
        fatal_tx,
    ));

    let shutdown = CancellationToken::new();
    let batcher = tokio::spawn(Arc::clone(&writer).run_batcher());
    tokio::spawn(Arc::clone(&writer).run_replay_scheduler(shutdown.clone()));
    let workers: Vec<_> = (0..3)
        .map(|id| {
            tokio::spawn(Arc::clone(&writer).run_worker(WorkerContext {
                id,
                cancel: shutdown.clone(),
            }))
        })
        .collect();

    for seq in 1..=10 {
        records.push(record("EUR_USD", seq)).await.unwrap();
        records.push(record("GBP_USD", seq)).await.unwrap();
    }

    wait_for(|| writer.backlog() == 0 && writer.overflow().len() >= 2).await;
    assert!(writer.outage_active());
    assert!(persisted.lock().is_empty());

    down.store(false, Ordering::SeqCst);
    wait_for(|| writer.overflow().is_empty()).await;
    wait_for(|| persisted.lock().values().map(Vec::len).sum::<usize>() == 20).await;

    let persisted = persisted.lock().clone();
    assert_eq!(persisted[&InstrumentId::from("EUR_USD")], (1..=10).collect::<Vec<_>>());
    assert_eq!(persisted[&InstrumentId::from("GBP_USD")], (1..=10).collect::<Vec<_>>());
    assert!(!writer.outage_active());
    assert_eq!(metrics.overflow_replayed.get(), metrics.overflow_spilled.get());
    assert!(fatal_rx.try_recv().is_err());

    records.close();
    batcher.await.unwrap();
    for worker in workers {
        worker.await.unwrap();
    }
    assert_eq!(writer.unflushed(), 0);
    shutdown.cancel();
}
