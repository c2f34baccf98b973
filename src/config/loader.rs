//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters,
//! and providing clear error messages for misconfiguration.

use std::collections::HashSet;
use std::path::Path;

use tracing::info;

use super::{AppConfig, BackoffSettings, QueueConfig, StageThresholds, WorkersConfig};
use crate::domain::quiet_hours::QuietHours;
use crate::domain::tick::InstrumentId;
use crate::error::ConfigError;
use crate::ports::storage::RAW_COLLECTION;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "TIDEPOOL_CONFIG";

/// Config path from `TIDEPOOL_CONFIG`, or `config.toml`.
pub fn config_path() -> String {
  std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string())
}

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns a `ConfigError` if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
    path: path.to_path_buf(),
    source,
  })?;

  let config = parse_config(&content)?;

  info!(
    path = %path.display(),
    instruments = config.feed.instruments.len(),
    batch_size = config.writer.batch_size,
    stall_threshold = config.health.stall_threshold,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
  let config: AppConfig = toml::from_str(content)?;
  validate_config(&config)?;
  Ok(config)
}

/// Quiet windows from `[health].quiet_hours`.
pub fn quiet_hours(config: &AppConfig) -> Result<QuietHours, ConfigError> {
  QuietHours::parse(
    config
      .health
      .quiet_hours
      .iter()
      .map(|w| (w.start.as_str(), w.end.as_str())),
  )
  .map_err(ConfigError::Invalid)
}

/// Feed bearer token from the configured environment variable.
pub fn feed_token(config: &AppConfig) -> Result<String, ConfigError> {
  match std::env::var(&config.feed.token_env) {
    Ok(token) if !token.trim().is_empty() => Ok(token),
    _ => Err(ConfigError::MissingCredential(config.feed.token_env.clone())),
  }
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<(), ConfigError> {
  if condition {
    Ok(())
  } else {
    Err(ConfigError::Invalid(message()))
  }
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - A non-empty, duplicate-free instrument list of valid identifiers
/// - Positive sizes, capacities and intervals
/// - Worker bounds with `min <= max`
/// - Scaling hysteresis (`scale_down_depth < scale_up_depth`)
/// - Parseable quiet windows
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
  // Feed validation
  ensure(!config.feed.instruments.is_empty(), || {
    "At least one instrument must be configured".to_string()
  })?;
  let mut seen = HashSet::new();
  for raw in &config.feed.instruments {
    let id = InstrumentId::new(raw.as_str());
    ensure(id.is_valid(), || format!("Invalid instrument identifier {raw:?}"))?;
    ensure(raw.as_str() != RAW_COLLECTION, || {
      format!("Instrument name {RAW_COLLECTION:?} is reserved for the raw frame journal")
    })?;
    ensure(seen.insert(raw.as_str()), || format!("Instrument {raw} listed twice"))?;
  }
  for raw in &config.health.instruments {
    ensure(InstrumentId::new(raw.as_str()).is_valid(), || {
      format!("Invalid health instrument identifier {raw:?}")
    })?;
  }
  ensure(!config.feed.stream_url.is_empty(), || {
    "Feed stream_url must not be empty".to_string()
  })?;
  ensure(!config.feed.account_id.is_empty(), || {
    "Feed account_id must not be empty".to_string()
  })?;
  ensure(config.feed.heartbeat_timeout_ms > 0, || {
    "heartbeat_timeout_ms must be positive".to_string()
  })?;
  ensure(config.feed.dedup_window > 0, || {
    "dedup_window must be positive".to_string()
  })?;
  validate_backoff("feed.reconnect", &config.feed.reconnect)?;

  // Formatter validation
  ensure(
    config.formatter.max_spread_ratio > 0.0 && config.formatter.max_spread().is_some(),
    || {
      format!(
        "max_spread_ratio must be a positive finite number, got {}",
        config.formatter.max_spread_ratio
      )
    },
  )?;
  validate_queue("formatter.queue", &config.formatter.queue)?;
  validate_workers("formatter.workers", config.formatter.workers)?;

  // Writer validation
  let writer = &config.writer;
  ensure(writer.batch_size > 0, || "batch_size must be positive".to_string())?;
  ensure(writer.flush_interval_ms > 0, || {
    "flush_interval_ms must be positive".to_string()
  })?;
  ensure(writer.replay_interval_ms > 0, || {
    "replay_interval_ms must be positive".to_string()
  })?;
  ensure(writer.batch_queue_capacity > 0, || {
    "batch_queue_capacity must be positive".to_string()
  })?;
  ensure(writer.overflow.max_entries > 0, || {
    "overflow.max_entries must be positive".to_string()
  })?;
  ensure(!writer.overflow.dir.is_empty(), || {
    "overflow.dir must not be empty".to_string()
  })?;
  validate_backoff("writer.retry", &writer.retry)?;
  validate_queue("writer.queue", &writer.queue)?;
  validate_workers("writer.workers", writer.workers)?;

  // Autoscaler validation
  let scaler = &config.autoscaler;
  ensure(scaler.interval_ms > 0, || {
    "autoscaler.interval_ms must be positive".to_string()
  })?;
  ensure(scaler.window > 0, || "autoscaler.window must be positive".to_string())?;
  validate_thresholds("autoscaler.formatter", &scaler.formatter)?;
  validate_thresholds("autoscaler.writer", &scaler.writer)?;

  // Health validation
  ensure(config.health.interval_secs > 0, || {
    "health.interval_secs must be positive".to_string()
  })?;
  ensure(config.health.stall_threshold > 0, || {
    "health.stall_threshold must be positive".to_string()
  })?;
  ensure(!config.health.service_name.is_empty(), || {
    "health.service_name must not be empty".to_string()
  })?;
  quiet_hours(config)?;

  ensure(!config.storage.data_dir.is_empty(), || {
    "storage.data_dir must not be empty".to_string()
  })?;
  let raw = &config.storage.raw_journal;
  if raw.enabled {
    ensure(raw.capacity > 0, || "raw_journal.capacity must be positive".to_string())?;
    ensure(raw.batch_size > 0, || "raw_journal.batch_size must be positive".to_string())?;
    ensure(raw.flush_interval_ms > 0, || {
      "raw_journal.flush_interval_ms must be positive".to_string()
    })?;
    ensure(raw.write_attempts > 0, || {
      "raw_journal.write_attempts must be positive".to_string()
    })?;
  }

  Ok(())
}

fn validate_backoff(section: &str, backoff: &BackoffSettings) -> Result<(), ConfigError> {
  ensure(backoff.initial_delay_ms > 0, || {
    format!("{section}.initial_delay_ms must be positive")
  })?;
  ensure(backoff.max_delay_ms >= backoff.initial_delay_ms, || {
    format!("{section}.max_delay_ms must be >= initial_delay_ms")
  })?;
  ensure(backoff.multiplier >= 1.0, || {
    format!("{section}.multiplier must be >= 1.0, got {}", backoff.multiplier)
  })?;
  ensure((0.0..=1.0).contains(&backoff.jitter), || {
    format!("{section}.jitter must be in [0, 1], got {}", backoff.jitter)
  })
}

fn validate_queue(section: &str, queue: &QueueConfig) -> Result<(), ConfigError> {
  ensure(queue.capacity > 0, || format!("{section}.capacity must be positive"))
}

fn validate_workers(section: &str, workers: WorkersConfig) -> Result<(), ConfigError> {
  ensure(workers.min > 0, || format!("{section}.min must be at least 1"))?;
  ensure(workers.min <= workers.max, || {
    format!("{section}: min ({}) exceeds max ({})", workers.min, workers.max)
  })
}

fn validate_thresholds(section: &str, thresholds: &StageThresholds) -> Result<(), ConfigError> {
  ensure(thresholds.scale_down_depth < thresholds.scale_up_depth, || {
    format!(
      "{section}: scale_down_depth ({}) must be below scale_up_depth ({})",
      thresholds.scale_down_depth, thresholds.scale_up_depth
    )
  })?;
  ensure(thresholds.step > 0, || format!("{section}.step must be positive"))
}
