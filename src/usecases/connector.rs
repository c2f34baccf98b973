//! Stream Connector - Resilient Feed Subscription
//!
//! Wraps a `FeedTransport` and turns its sessions into one endless,
//! restartable sequence of `StreamEvent`s:
//! - reconnects with exponential backoff and jitter after any loss
//! - emits a `GapMarker` after a reconnect, before any new tick
//! - suppresses redelivered payloads per instrument
//! - assigns per-instrument sequence numbers
//!
//! State machine:
//! `Disconnected → Connecting → Connected → Reconnecting → Connected | Failed`

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::config::FeedConfig;
use crate::domain::backoff::{Backoff, BackoffConfig};
use crate::domain::tick::{GapMarker, InstrumentId, RawTick, StreamEvent};
use crate::error::ConnectivityError;
use crate::ports::feed::{FeedMessage, FeedSession, FeedTransport};
use crate::usecases::raw_journal::RawJournal;

/// Connector tuning.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
  /// Longest silence (no frame of any kind) tolerated on a session.
  pub heartbeat_timeout: Duration,
  pub reconnect: BackoffConfig,
  /// Recent payloads remembered per instrument; 0 disables suppression.
  pub dedup_window: usize,
}

impl ConnectorSettings {
  pub fn from_config(config: &FeedConfig) -> Self {
    Self {
      heartbeat_timeout: config.heartbeat_timeout(),
      reconnect: config.reconnect.to_backoff(),
      dedup_window: config.dedup_window,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
  /// Retry budget spent. Only `restart` leaves this state.
  Failed,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Disconnected => "disconnected",
      Self::Connecting => "connecting",
      Self::Connected => "connected",
      Self::Reconnecting => "reconnecting",
      Self::Failed => "failed",
    };
    f.write_str(s)
  }
}

/// Bounded memory of recent payload hashes.
struct DedupWindow {
  order: VecDeque<u64>,
  seen: HashSet<u64>,
  capacity: usize,
}

impl DedupWindow {
  fn new(capacity: usize) -> Self {
    Self {
      order: VecDeque::with_capacity(capacity),
      seen: HashSet::with_capacity(capacity),
      capacity,
    }
  }

  /// Returns false if the hash is already in the window.
  fn insert(&mut self, hash: u64) -> bool {
    if self.capacity == 0 {
      return true;
    }
    if !self.seen.insert(hash) {
      return false;
    }
    self.order.push_back(hash);
    if self.order.len() > self.capacity {
      if let Some(oldest) = self.order.pop_front() {
        self.seen.remove(&oldest);
      }
    }
    true
  }
}

fn payload_hash(payload: &str) -> u64 {
  let mut hasher = DefaultHasher::new();
  payload.hash(&mut hasher);
  hasher.finish()
}

/// A live connection that was lost and not yet recovered.
struct Outage {
  since: DateTime<Utc>,
  reason: String,
}

/// Feed subscription with reconnect, gap marking, dedup and sequencing.
pub struct StreamConnector {
  transport: Arc<dyn FeedTransport>,
  instruments: Vec<InstrumentId>,
  subscribed: HashSet<InstrumentId>,
  settings: ConnectorSettings,
  backoff: Backoff,
  session: Option<FeedSession>,
  state: watch::Sender<ConnectionState>,
  sequences: HashMap<InstrumentId, u64>,
  dedup: HashMap<InstrumentId, DedupWindow>,
  outage: Option<Outage>,
  pending_gap: Option<GapMarker>,
  /// Attempts since the last successful connect.
  attempts: u32,
  last_error: String,
  metrics: Option<Arc<MetricsRegistry>>,
  journal: Option<RawJournal>,
}

impl StreamConnector {
  pub fn new(
    transport: Arc<dyn FeedTransport>,
    instruments: Vec<InstrumentId>,
    settings: ConnectorSettings,
  ) -> Self {
    let (state, _) = watch::channel(ConnectionState::Disconnected);
    Self {
      transport,
      subscribed: instruments.iter().cloned().collect(),
      instruments,
      backoff: Backoff::new(settings.reconnect),
      settings,
      session: None,
      state,
      sequences: HashMap::new(),
      dedup: HashMap::new(),
      outage: None,
      pending_gap: None,
      attempts: 0,
      last_error: String::new(),
      metrics: None,
      journal: None,
    }
  }

  pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
    self.metrics = Some(metrics);
    self
  }

  /// Copy every kept frame, heartbeats included, to the raw journal.
  pub fn with_raw_journal(mut self, journal: RawJournal) -> Self {
    self.journal = Some(journal);
    self
  }

  /// Continue numbering after already persisted sequences. Seeds never
  /// move a counter backwards.
  pub fn seed_sequences(&mut self, seeds: impl IntoIterator<Item = (InstrumentId, u64)>) {
    for (instrument, last) in seeds {
      let counter = self.sequences.entry(instrument).or_insert(0);
      *counter = (*counter).max(last);
    }
  }

  /// Last sequence handed out for an instrument.
  pub fn last_sequence(&self, instrument: &InstrumentId) -> Option<u64> {
    self.sequences.get(instrument).copied()
  }

  pub fn state(&self) -> ConnectionState {
    *self.state.borrow()
  }

  /// Observe state changes, e.g. for readiness checks.
  pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
    self.state.subscribe()
  }

  pub fn instruments(&self) -> &[InstrumentId] {
    &self.instruments
  }

  /// Leave `Failed` so the next call to `next_event` reconnects.
  pub fn restart(&mut self) {
    if self.state() == ConnectionState::Failed {
      info!("Restarting failed feed connector");
      self.backoff.reset();
      self.attempts = 0;
      self.session = None;
      self.set_state(ConnectionState::Disconnected);
    }
  }

  /// Next tick or gap marker. Connects and reconnects as needed.
  ///
  /// # Errors
  /// Only `RetryBudgetExhausted`; every other failure is retried here.
  pub async fn next_event(&mut self) -> Result<StreamEvent, ConnectivityError> {
    loop {
      if self.state() == ConnectionState::Failed {
        return Err(self.exhausted());
      }
      if self.session.is_none() {
        self.connect().await?;
        continue;
      }
      if let Some(gap) = self.pending_gap.take() {
        return Ok(StreamEvent::Gap(gap));
      }

      let timeout = self.settings.heartbeat_timeout;
      let Some(session) = self.session.as_mut() else {
        continue;
      };
      let frame = match tokio::time::timeout(timeout, session.next()).await {
        Err(_) => Err(ConnectivityError::HeartbeatLost(timeout)),
        Ok(None) => Err(ConnectivityError::StreamEnded),
        Ok(Some(frame)) => frame,
      };

      match frame {
        Ok(FeedMessage::Price(tick)) => {
          if let Some(tick) = self.admit(tick) {
            return Ok(StreamEvent::Tick(tick));
          }
        }
        Ok(FeedMessage::Heartbeat { payload }) => {
          trace!("Feed heartbeat");
          self.journal(payload);
          if let Some(m) = &self.metrics {
            m.heartbeats.inc();
          }
        }
        Ok(FeedMessage::Unparseable { payload, reason }) => {
          let preview: String = payload.chars().take(200).collect();
          debug!(reason = %reason, payload = %preview, "Rejected feed frame");
          self.journal(payload);
          self.reject(&reason);
        }
        Err(e) => self.lose_connection(e),
      }
    }
  }

  /// Consume the connector as a stream. The stream ends after yielding
  /// the fatal error.
  pub fn into_stream(self) -> impl Stream<Item = Result<StreamEvent, ConnectivityError>> + Send {
    futures_util::stream::unfold(Some(self), |connector| async move {
      let mut connector = connector?;
      match connector.next_event().await {
        Ok(event) => Some((Ok(event), Some(connector))),
        Err(e) => Some((Err(e), None)),
      }
    })
  }

  #[instrument(skip(self), fields(instruments = self.instruments.len()))]
  async fn connect(&mut self) -> Result<(), ConnectivityError> {
    let mut immediate = self.state() == ConnectionState::Disconnected;
    loop {
      if immediate {
        self.set_state(ConnectionState::Connecting);
      } else {
        let Some(delay) = self.backoff.next_delay() else {
          self.set_state(ConnectionState::Failed);
          let err = self.exhausted();
          error!(attempts = self.attempts, error = %err, "Feed connector failed permanently");
          return Err(err);
        };
        self.set_state(ConnectionState::Reconnecting);
        debug!(delay_ms = delay.as_millis() as u64, attempt = self.attempts + 1, "Waiting before reconnect");
        tokio::time::sleep(delay).await;
      }
      immediate = false;
      self.attempts += 1;

      match self.transport.open(&self.instruments).await {
        Ok(session) => {
          self.on_connected(session);
          return Ok(());
        }
        Err(e) => {
          warn!(attempt = self.attempts, error = %e, "Feed connection attempt failed");
          self.last_error = e.to_string();
        }
      }
    }
  }

  fn on_connected(&mut self, session: FeedSession) {
    let attempts = self.attempts;
    self.session = Some(session);
    self.backoff.reset();
    self.attempts = 0;
    self.set_state(ConnectionState::Connected);

    match self.outage.take() {
      Some(outage) => {
        let gap = GapMarker {
          instruments: self.instruments.clone(),
          disconnected_at: outage.since,
          reconnected_at: Utc::now(),
          attempts,
          reason: outage.reason,
        };
        info!(
          attempts,
          down_ms = (gap.reconnected_at - gap.disconnected_at).num_milliseconds(),
          "Feed reconnected"
        );
        if let Some(m) = &self.metrics {
          m.feed_reconnects.inc();
          m.feed_gaps.inc();
        }
        self.pending_gap = Some(gap);
      }
      None => info!(attempts, "Feed connected"),
    }
  }

  fn lose_connection(&mut self, error: ConnectivityError) {
    warn!(error = %error, "Feed connection lost");
    self.session = None;
    self.last_error = error.to_string();
    if self.outage.is_none() {
      self.outage = Some(Outage {
        since: Utc::now(),
        reason: error.to_string(),
      });
    }
    self.set_state(ConnectionState::Reconnecting);
  }

  /// Route a price frame: drop unsubscribed and redelivered payloads,
  /// then stamp the next sequence for its instrument.
  fn admit(&mut self, mut tick: RawTick) -> Option<RawTick> {
    if !self.subscribed.contains(&tick.instrument) {
      debug!(instrument = %tick.instrument, "Price for unsubscribed instrument");
      self.journal(tick.payload);
      self.reject("unsubscribed");
      return None;
    }

    let capacity = self.settings.dedup_window;
    let window = self
      .dedup
      .entry(tick.instrument.clone())
      .or_insert_with(|| DedupWindow::new(capacity));
    if !window.insert(payload_hash(&tick.payload)) {
      trace!(instrument = %tick.instrument, "Duplicate payload suppressed");
      if let Some(m) = &self.metrics {
        m.duplicates_suppressed
          .with_label_values(&[tick.instrument.as_str()])
          .inc();
      }
      return None;
    }

    self.journal(tick.payload.clone());
    let counter = self.sequences.entry(tick.instrument.clone()).or_insert(0);
    *counter += 1;
    tick.sequence = *counter;

    if let Some(m) = &self.metrics {
      m.ticks_received
        .with_label_values(&[tick.instrument.as_str()])
        .inc();
    }
    Some(tick)
  }

  fn journal(&self, payload: String) {
    if let Some(journal) = &self.journal {
      journal.record(payload);
    }
  }

  fn reject(&self, reason: &str) {
    if let Some(m) = &self.metrics {
      m.frames_rejected.with_label_values(&[reason]).inc();
    }
  }

  fn set_state(&self, state: ConnectionState) {
    let previous = self.state.send_replace(state);
    if previous != state {
      debug!(from = %previous, to = %state, "Connector state changed");
      if let Some(m) = &self.metrics {
        m.feed_connected
          .set(if state == ConnectionState::Connected { 1.0 } else { 0.0 });
      }
    }
  }

  fn exhausted(&self) -> ConnectivityError {
    ConnectivityError::RetryBudgetExhausted {
      attempts: self.attempts,
      last: self.last_error.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use async_trait::async_trait;
  use futures_util::stream;
  use parking_lot::Mutex;

  use super::*;

  type Script = Result<Vec<Result<FeedMessage, ConnectivityError>>, ConnectivityError>;

  /// Hands out one scripted session per `open`; a session ends after its
  /// frames unless `hold` is set.
  struct ScriptedTransport {
    sessions: Mutex<VecDeque<Script>>,
    hold: bool,
  }

  impl ScriptedTransport {
    fn new(sessions: Vec<Script>, hold: bool) -> Arc<Self> {
      Arc::new(Self {
        sessions: Mutex::new(sessions.into()),
        hold,
      })
    }
  }

  #[async_trait]
  impl FeedTransport for ScriptedTransport {
    async fn open(&self, _instruments: &[InstrumentId]) -> Result<FeedSession, ConnectivityError> {
      let script = self
        .sessions
        .lock()
        .pop_front()
        .unwrap_or_else(|| Err(ConnectivityError::Connect("refused".into())));
      let frames = stream::iter(script?);
      if self.hold {
        Ok(frames.chain(stream::pending()).boxed())
      } else {
        Ok(frames.boxed())
      }
    }
  }

  fn price(instrument: &str, payload: &str) -> Result<FeedMessage, ConnectivityError> {
    Ok(FeedMessage::Price(RawTick {
      instrument: instrument.into(),
      sequence: 0,
      time: Some("2024-01-01T00:00:00Z".into()),
      bid: Some("1.1".into()),
      ask: Some("1.2".into()),
      status: None,
      tradeable: Some(true),
      received_at: Utc::now(),
      payload: payload.into(),
    }))
  }

  fn settings(max_attempts: u32) -> ConnectorSettings {
    ConnectorSettings {
      heartbeat_timeout: Duration::from_millis(50),
      reconnect: BackoffConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts,
      },
      dedup_window: 16,
    }
  }

  fn connector(transport: Arc<ScriptedTransport>, max_attempts: u32) -> StreamConnector {
    StreamConnector::new(transport, vec!["EUR_USD".into(), "USD_JPY".into()], settings(max_attempts))
  }

  fn tick_of(event: StreamEvent) -> RawTick {
    match event {
      StreamEvent::Tick(tick) => tick,
      StreamEvent::Gap(gap) => panic!("expected tick, got gap {gap:?}"),
    }
  }

  #[tokio::test]
  async fn sequences_dedup_and_rejects() {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let transport = ScriptedTransport::new(
      vec![Ok(vec![
        price("EUR_USD", "a"),
        price("EUR_USD", "a"),
        Ok(FeedMessage::Heartbeat { payload: "hb".into() }),
        price("GBP_USD", "x"),
        Ok(FeedMessage::Unparseable {
          payload: "{".into(),
          reason: "invalid_json".into(),
        }),
        price("EUR_USD", "b"),
        price("USD_JPY", "c"),
      ])],
      true,
    );
    let (journal, mut frames) = RawJournal::channel(16);
    let mut connector = connector(transport, 3)
      .with_metrics(Arc::clone(&metrics))
      .with_raw_journal(journal);
    connector.seed_sequences([(InstrumentId::from("EUR_USD"), 41)]);

    let first = tick_of(connector.next_event().await.unwrap());
    let second = tick_of(connector.next_event().await.unwrap());
    let third = tick_of(connector.next_event().await.unwrap());
    assert_eq!((first.payload.as_str(), first.sequence), ("a", 42));
    assert_eq!((second.payload.as_str(), second.sequence), ("b", 43));
    assert_eq!((third.instrument.as_str(), third.sequence), ("USD_JPY", 1));

    assert_eq!(connector.state(), ConnectionState::Connected);
    assert_eq!(metrics.duplicates_suppressed.with_label_values(&["EUR_USD"]).get(), 1);
    assert_eq!(metrics.frames_rejected.with_label_values(&["unsubscribed"]).get(), 1);
    assert_eq!(metrics.frames_rejected.with_label_values(&["invalid_json"]).get(), 1);
    assert_eq!(metrics.heartbeats.get(), 1);

    // Everything but the redelivered frame reaches the raw journal.
    let mut journaled = Vec::new();
    while let Ok(frame) = frames.try_recv() {
      journaled.push(frame.data);
    }
    assert_eq!(journaled, ["a", "hb", "x", "{", "b", "c"]);
  }

  #[tokio::test]
  async fn reconnect_emits_gap_before_new_ticks() {
    let transport = ScriptedTransport::new(
      vec![
        Ok(vec![price("EUR_USD", "a")]),
        Err(ConnectivityError::Connect("refused".into())),
        Ok(vec![price("EUR_USD", "b")]),
      ],
      false,
    );
    let mut connector = connector(transport, 5);

    let a = tick_of(connector.next_event().await.unwrap());
    assert_eq!(a.sequence, 1);

    let StreamEvent::Gap(gap) = connector.next_event().await.unwrap() else {
      panic!("expected gap marker");
    };
    assert_eq!(gap.attempts, 2);
    assert_eq!(gap.instruments.len(), 2);
    assert!(gap.reason.contains("ended"));
    assert!(gap.reconnected_at >= gap.disconnected_at);

    let b = tick_of(connector.next_event().await.unwrap());
    assert_eq!(b.sequence, 2);
  }

  #[tokio::test]
  async fn silence_counts_as_connection_loss() {
    let transport = ScriptedTransport::new(
      vec![Ok(vec![]), Ok(vec![price("USD_JPY", "z")])],
      true,
    );
    let mut connector = connector(transport, 5);

    let StreamEvent::Gap(gap) = connector.next_event().await.unwrap() else {
      panic!("expected gap marker");
    };
    assert!(gap.reason.contains("heartbeat"));
    assert_eq!(tick_of(connector.next_event().await.unwrap()).payload, "z");
  }

  #[tokio::test]
  async fn exhausted_budget_fails_until_restart() {
    let transport = ScriptedTransport::new(vec![], false);
    let mut connector = connector(Arc::clone(&transport), 2);
    let mut states = connector.subscribe_state();

    let err = connector.next_event().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, ConnectivityError::RetryBudgetExhausted { attempts: 3, .. }));
    assert_eq!(*states.borrow_and_update(), ConnectionState::Failed);

    // Stays failed.
    assert!(connector.next_event().await.unwrap_err().is_fatal());

    transport.sessions.lock().push_back(Ok(vec![price("EUR_USD", "a")]));
    connector.restart();
    assert_eq!(connector.state(), ConnectionState::Disconnected);
    assert_eq!(tick_of(connector.next_event().await.unwrap()).sequence, 1);
  }

  #[tokio::test]
  async fn stream_ends_after_fatal_error() {
    let transport = ScriptedTransport::new(vec![Ok(vec![price("EUR_USD", "a")])], false);
    let events: Vec<_> = connector(transport, 1).into_stream().collect().await;
    assert_eq!(events.len(), 2);
    assert!(events[0].is_ok());
    assert!(events[1].as_ref().is_err_and(ConnectivityError::is_fatal));
  }
}
