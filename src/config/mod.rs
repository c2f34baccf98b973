//! Configuration Module - TOML-based Pipeline Configuration
//!
//! Loads and validates configuration from `config.toml` (path taken
//! from `TIDEPOOL_CONFIG`). Both binaries read the same file: the
//! pipeline uses everything except `[health]`, the monitor uses
//! `[health]`, `[storage]` and the instrument list.
//!
//! Durations are integer milliseconds (or seconds where the name says
//! so) in the file, exposed as `Duration` through accessors.

pub mod loader;

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::backoff::BackoffConfig;
use crate::domain::scaling::ScalingConfig;
use crate::domain::tick::InstrumentId;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Service identity and lifecycle.
  #[serde(default)]
  pub service: ServiceConfig,
  /// Streaming feed connection.
  pub feed: FeedConfig,
  /// Formatter stage.
  #[serde(default)]
  pub formatter: FormatterConfig,
  /// Persistence writer stage.
  #[serde(default)]
  pub writer: WriterConfig,
  /// Worker autoscaling.
  #[serde(default)]
  pub autoscaler: AutoscalerConfig,
  /// Health monitor (used by `tidepool-monitor`).
  #[serde(default)]
  pub health: HealthConfig,
  /// Record storage.
  #[serde(default)]
  pub storage: StorageConfig,
  /// Metrics and health endpoints.
  #[serde(default)]
  pub metrics: MetricsConfig,
}

impl AppConfig {
  /// Instruments the feed subscribes to.
  pub fn instruments(&self) -> Vec<InstrumentId> {
    self.feed.instruments.iter().map(|i| InstrumentId::new(i.as_str())).collect()
  }

  /// Instruments the health monitor watches: `[health].instruments` if
  /// set, else the feed's list.
  pub fn monitored_instruments(&self) -> Vec<InstrumentId> {
    if self.health.instruments.is_empty() {
      self.instruments()
    } else {
      self.health.instruments.iter().map(|i| InstrumentId::new(i.as_str())).collect()
    }
  }
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Service name used in logs.
  #[serde(default = "default_service_name")]
  pub name: String,
  /// Log level (trace, debug, info, warn, error). `RUST_LOG` overrides.
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// Time allowed for in-flight batches to flush on shutdown.
  #[serde(default = "default_drain_timeout_ms")]
  pub drain_timeout_ms: u64,
}

impl ServiceConfig {
  pub fn drain_timeout(&self) -> Duration {
    Duration::from_millis(self.drain_timeout_ms)
  }
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      name: default_service_name(),
      log_level: default_log_level(),
      drain_timeout_ms: default_drain_timeout_ms(),
    }
  }
}

/// Streaming feed configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
  /// Pricing stream base URL.
  #[serde(default = "default_stream_url")]
  pub stream_url: String,
  /// Account the pricing stream is opened for.
  pub account_id: String,
  /// Environment variable holding the bearer token.
  #[serde(default = "default_token_env")]
  pub token_env: String,
  /// Instruments to subscribe to (e.g. `EUR_USD`).
  pub instruments: Vec<String>,
  /// Maximum silence (no price, no heartbeat) before reconnecting.
  #[serde(default = "default_heartbeat_timeout_ms")]
  pub heartbeat_timeout_ms: u64,
  /// Timeout for establishing the stream.
  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms: u64,
  /// Recent payloads remembered per instrument for duplicate suppression.
  #[serde(default = "default_dedup_window")]
  pub dedup_window: usize,
  /// Reconnect backoff and retry budget.
  #[serde(default = "default_reconnect")]
  pub reconnect: BackoffSettings,
}

impl FeedConfig {
  pub fn heartbeat_timeout(&self) -> Duration {
    Duration::from_millis(self.heartbeat_timeout_ms)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSettings {
  pub initial_delay_ms: u64,
  pub max_delay_ms: u64,
  #[serde(default = "default_multiplier")]
  pub multiplier: f64,
  /// Fraction of the delay randomized (0.0 - 1.0).
  #[serde(default = "default_jitter")]
  pub jitter: f64,
  /// Attempts before giving up; 0 means unlimited.
  #[serde(default)]
  pub max_attempts: u32,
}

impl BackoffSettings {
  pub fn to_backoff(&self) -> BackoffConfig {
    BackoffConfig {
      initial_delay: Duration::from_millis(self.initial_delay_ms),
      max_delay: Duration::from_millis(self.max_delay_ms),
      multiplier: self.multiplier,
      jitter: self.jitter,
      max_attempts: self.max_attempts,
    }
  }
}

/// Behavior when a queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
  /// Producer waits for space.
  Block,
  /// Item is discarded and counted.
  Drop,
}

/// Bounded queue between two stages.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  #[serde(default = "default_queue_capacity")]
  pub capacity: usize,
  #[serde(default = "default_queue_policy")]
  pub policy: QueuePolicy,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      capacity: default_queue_capacity(),
      policy: default_queue_policy(),
    }
  }
}

/// Worker pool bounds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WorkersConfig {
  pub min: usize,
  pub max: usize,
}

/// Formatter stage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FormatterConfig {
  /// Largest accepted `(ask - bid) / bid`.
  #[serde(default = "default_max_spread_ratio")]
  pub max_spread_ratio: f64,
  /// Queue between the connector and the formatter workers.
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default = "default_formatter_workers")]
  pub workers: WorkersConfig,
}

impl FormatterConfig {
  /// Spread limit as an exact decimal; `None` if not representable.
  pub fn max_spread(&self) -> Option<Decimal> {
    Decimal::try_from(self.max_spread_ratio).ok()
  }
}

impl Default for FormatterConfig {
  fn default() -> Self {
    Self {
      max_spread_ratio: default_max_spread_ratio(),
      queue: QueueConfig::default(),
      workers: default_formatter_workers(),
    }
  }
}

/// Overflow spill buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OverflowConfig {
  /// Directory holding spilled batches.
  #[serde(default = "default_overflow_dir")]
  pub dir: String,
  /// Maximum number of spilled batches kept.
  #[serde(default = "default_overflow_max_entries")]
  pub max_entries: usize,
}

impl Default for OverflowConfig {
  fn default() -> Self {
    Self {
      dir: default_overflow_dir(),
      max_entries: default_overflow_max_entries(),
    }
  }
}

/// Persistence writer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
  /// Records per batch before a size flush.
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,
  /// Maximum age of an open batch before a time flush.
  #[serde(default = "default_flush_interval_ms")]
  pub flush_interval_ms: u64,
  /// How long a batch keeps retrying before it is spilled.
  #[serde(default = "default_overflow_after_ms")]
  pub overflow_after_ms: u64,
  /// How often instruments with pending overflow are scheduled for replay.
  #[serde(default = "default_replay_interval_ms")]
  pub replay_interval_ms: u64,
  /// Retry backoff for failed writes.
  #[serde(default = "default_write_retry")]
  pub retry: BackoffSettings,
  /// Queue between the formatter workers and the batcher.
  #[serde(default)]
  pub queue: QueueConfig,
  /// Queue of flushed batches waiting for a writer.
  #[serde(default = "default_batch_queue_capacity")]
  pub batch_queue_capacity: usize,
  #[serde(default = "default_writer_workers")]
  pub workers: WorkersConfig,
  #[serde(default)]
  pub overflow: OverflowConfig,
}

impl WriterConfig {
  pub fn flush_interval(&self) -> Duration {
    Duration::from_millis(self.flush_interval_ms)
  }

  pub fn overflow_after(&self) -> Duration {
    Duration::from_millis(self.overflow_after_ms)
  }

  pub fn replay_interval(&self) -> Duration {
    Duration::from_millis(self.replay_interval_ms)
  }
}

impl Default for WriterConfig {
  fn default() -> Self {
    Self {
      batch_size: default_batch_size(),
      flush_interval_ms: default_flush_interval_ms(),
      overflow_after_ms: default_overflow_after_ms(),
      replay_interval_ms: default_replay_interval_ms(),
      retry: default_write_retry(),
      queue: QueueConfig::default(),
      batch_queue_capacity: default_batch_queue_capacity(),
      workers: default_writer_workers(),
      overflow: OverflowConfig::default(),
    }
  }
}

/// Scaling thresholds for one stage.
#[derive(Debug, Clone, Deserialize)]
pub struct StageThresholds {
  pub scale_up_depth: usize,
  pub scale_down_depth: usize,
  #[serde(default)]
  pub scale_up_latency_ms: Option<f64>,
  #[serde(default = "default_scale_step")]
  pub step: usize,
}

/// Autoscaler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoscalerConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Sampling interval.
  #[serde(default = "default_autoscale_interval_ms")]
  pub interval_ms: u64,
  /// Samples in the rolling window.
  #[serde(default = "default_autoscale_window")]
  pub window: usize,
  /// Minimum time between resizes, and idle time before scaling down.
  #[serde(default = "default_autoscale_cooldown_ms")]
  pub cooldown_ms: u64,
  #[serde(default = "default_formatter_thresholds")]
  pub formatter: StageThresholds,
  #[serde(default = "default_writer_thresholds")]
  pub writer: StageThresholds,
}

impl AutoscalerConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_millis(self.interval_ms)
  }

  /// Policy configuration for one stage.
  pub fn scaling(&self, thresholds: &StageThresholds, workers: WorkersConfig) -> ScalingConfig {
    ScalingConfig {
      min_workers: workers.min,
      max_workers: workers.max,
      window: self.window,
      scale_up_depth: thresholds.scale_up_depth,
      scale_down_depth: thresholds.scale_down_depth,
      scale_up_latency_ms: thresholds.scale_up_latency_ms,
      cooldown: Duration::from_millis(self.cooldown_ms),
      step: thresholds.step,
    }
  }
}

impl Default for AutoscalerConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      interval_ms: default_autoscale_interval_ms(),
      window: default_autoscale_window(),
      cooldown_ms: default_autoscale_cooldown_ms(),
      formatter: default_formatter_thresholds(),
      writer: default_writer_thresholds(),
    }
  }
}

/// Which supervisor receives restart requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorKind {
  /// `systemctl restart <service>`.
  Systemd,
  /// Log the request only.
  Log,
}

/// One quiet window, weekly (`"Fri 21:00"`) or daily (`"21:00"`), UTC.
#[derive(Debug, Clone, Deserialize)]
pub struct QuietWindowConfig {
  pub start: String,
  pub end: String,
}

/// Health monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
  /// Poll interval.
  #[serde(default = "default_health_interval_secs")]
  pub interval_secs: u64,
  /// Consecutive unchanged samples before an instrument is stalled.
  #[serde(default = "default_stall_threshold")]
  pub stall_threshold: u32,
  /// Unit restarted on a stall.
  #[serde(default = "default_service_name")]
  pub service_name: String,
  #[serde(default = "default_supervisor_kind")]
  pub supervisor: SupervisorKind,
  /// Timeout for a single supervisor command.
  #[serde(default = "default_supervisor_timeout_ms")]
  pub supervisor_timeout_ms: u64,
  /// Instruments to watch; empty means the feed's instruments.
  #[serde(default)]
  pub instruments: Vec<String>,
  /// Windows during which no growth is expected.
  #[serde(default)]
  pub quiet_hours: Vec<QuietWindowConfig>,
  /// Where the monitor serves its own metrics.
  #[serde(default = "default_monitor_metrics_addr")]
  pub metrics_bind_address: String,
}

impl HealthConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  pub fn supervisor_timeout(&self) -> Duration {
    Duration::from_millis(self.supervisor_timeout_ms)
  }
}

impl Default for HealthConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_health_interval_secs(),
      stall_threshold: default_stall_threshold(),
      service_name: default_service_name(),
      supervisor: default_supervisor_kind(),
      supervisor_timeout_ms: default_supervisor_timeout_ms(),
      instruments: Vec::new(),
      quiet_hours: Vec::new(),
      metrics_bind_address: default_monitor_metrics_addr(),
    }
  }
}

/// Record storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// Root directory for collections and the gap journal.
  #[serde(default = "default_data_dir")]
  pub data_dir: String,
  #[serde(default)]
  pub raw_journal: RawJournalConfig,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      data_dir: default_data_dir(),
      raw_journal: RawJournalConfig::default(),
    }
  }
}

/// Journal of every feed frame as received.
#[derive(Debug, Clone, Deserialize)]
pub struct RawJournalConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Frames buffered between the connector and the journal writer.
  /// Frames arriving while it is full are dropped and counted.
  #[serde(default = "default_queue_capacity")]
  pub capacity: usize,
  #[serde(default = "default_batch_size")]
  pub batch_size: usize,
  #[serde(default = "default_flush_interval_ms")]
  pub flush_interval_ms: u64,
  /// Attempts per journal batch before it is dropped.
  #[serde(default = "default_raw_write_attempts")]
  pub write_attempts: u32,
}

impl RawJournalConfig {
  pub fn flush_interval(&self) -> Duration {
    Duration::from_millis(self.flush_interval_ms)
  }
}

impl Default for RawJournalConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      capacity: default_queue_capacity(),
      batch_size: default_batch_size(),
      flush_interval_ms: default_flush_interval_ms(),
      write_attempts: default_raw_write_attempts(),
    }
  }
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Metrics server bind address.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
  /// Health check endpoint port.
  #[serde(default = "default_health_port")]
  pub health_port: u16,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
      health_port: default_health_port(),
    }
  }
}

// Default value functions for serde

fn default_service_name() -> String {
  "tidepool".to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_drain_timeout_ms() -> u64 {
  10_000
}

fn default_stream_url() -> String {
  "https://stream-fxpractice.oanda.com".to_string()
}

fn default_token_env() -> String {
  "TIDEPOOL_FEED_TOKEN".to_string()
}

fn default_heartbeat_timeout_ms() -> u64 {
  // OANDA sends a heartbeat every 5 s.
  15_000
}

fn default_connect_timeout_ms() -> u64 {
  10_000
}

fn default_dedup_window() -> usize {
  256
}

fn default_reconnect() -> BackoffSettings {
  BackoffSettings {
    initial_delay_ms: 500,
    max_delay_ms: 30_000,
    multiplier: default_multiplier(),
    jitter: default_jitter(),
    max_attempts: 20,
  }
}

fn default_multiplier() -> f64 {
  2.0
}

fn default_jitter() -> f64 {
  0.2
}

fn default_queue_capacity() -> usize {
  10_000
}

fn default_queue_policy() -> QueuePolicy {
  QueuePolicy::Block
}

fn default_max_spread_ratio() -> f64 {
  0.05
}

fn default_formatter_workers() -> WorkersConfig {
  WorkersConfig { min: 1, max: 4 }
}

fn default_overflow_dir() -> String {
  "data/overflow".to_string()
}

fn default_overflow_max_entries() -> usize {
  10_000
}

fn default_batch_size() -> usize {
  500
}

fn default_flush_interval_ms() -> u64 {
  1_000
}

fn default_overflow_after_ms() -> u64 {
  5_000
}

fn default_replay_interval_ms() -> u64 {
  2_000
}

fn default_write_retry() -> BackoffSettings {
  BackoffSettings {
    initial_delay_ms: 100,
    max_delay_ms: 2_000,
    multiplier: default_multiplier(),
    jitter: 0.1,
    max_attempts: 0,
  }
}

fn default_batch_queue_capacity() -> usize {
  256
}

fn default_writer_workers() -> WorkersConfig {
  WorkersConfig { min: 2, max: 8 }
}

fn default_scale_step() -> usize {
  1
}

fn default_true() -> bool {
  true
}

fn default_autoscale_interval_ms() -> u64 {
  1_000
}

fn default_autoscale_window() -> usize {
  5
}

fn default_autoscale_cooldown_ms() -> u64 {
  10_000
}

fn default_formatter_thresholds() -> StageThresholds {
  StageThresholds {
    scale_up_depth: 1_000,
    scale_down_depth: 10,
    scale_up_latency_ms: None,
    step: 1,
  }
}

fn default_writer_thresholds() -> StageThresholds {
  StageThresholds {
    scale_up_depth: 2_000,
    scale_down_depth: 50,
    scale_up_latency_ms: Some(500.0),
    step: 1,
  }
}

fn default_health_interval_secs() -> u64 {
  60
}

fn default_stall_threshold() -> u32 {
  3
}

fn default_supervisor_kind() -> SupervisorKind {
  SupervisorKind::Log
}

fn default_supervisor_timeout_ms() -> u64 {
  15_000
}

fn default_monitor_metrics_addr() -> String {
  "0.0.0.0:9091".to_string()
}

fn default_data_dir() -> String {
  "data".to_string()
}

fn default_raw_write_attempts() -> u32 {
  3
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}

fn default_health_port() -> u16 {
  8080
}
