//! Error Taxonomy
//!
//! Every failure in the pipeline falls into one of these families.
//! Recoverable errors are absorbed by the stage that meets them;
//! only `PipelineError` crosses the operator boundary.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::domain::tick::InstrumentId;

/// Feed connectivity failures. Recoverable by reconnecting, except
/// `RetryBudgetExhausted`, which is terminal for the connector.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    /// The transport could not open a session.
    #[error("failed to open feed stream: {0}")]
    Connect(String),
    /// The feed answered with a non-success status.
    #[error("feed returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// Neither a heartbeat nor a price arrived within the timeout.
    #[error("no heartbeat or data within {0:?}")]
    HeartbeatLost(Duration),
    /// The body stream failed mid-session.
    #[error("feed stream read failed: {0}")]
    Read(String),
    /// The server closed the stream.
    #[error("feed stream ended")]
    StreamEnded,
    /// Reconnect attempts exceeded the configured budget.
    #[error("reconnect budget exhausted after {attempts} attempts: {last}")]
    RetryBudgetExhausted { attempts: u32, last: String },
}

impl ConnectivityError {
    /// Whether the connector may keep retrying after this error.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::RetryBudgetExhausted { .. })
    }
}

/// Why a raw tick was quarantined by the formatter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("field '{field}' out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error("crossed quote: bid {bid} > ask {ask}")]
    CrossedQuote { bid: String, ask: String },
    #[error("spread ratio {ratio} exceeds {max}")]
    SpreadTooWide { ratio: String, max: String },
    #[error("unparseable timestamp {0:?}")]
    InvalidTimestamp(String),
}

impl ValidationError {
    /// Short label used for the quarantine metric.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::InvalidNumber { .. } => "invalid_number",
            Self::OutOfRange { .. } => "out_of_range",
            Self::CrossedQuote { .. } => "crossed_quote",
            Self::SpreadTooWide { .. } => "spread_too_wide",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
        }
    }
}

/// Failures raised by a `RecordStore`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sequence regression in {instrument}: batch starts at {first}, collection at {last}")]
    SequenceRegression {
        instrument: InstrumentId,
        first: u64,
        last: u64,
    },
}

/// Failures of the persistence writer after local handling.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("overflow buffer I/O error on {path}: {source}")]
    Overflow {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt overflow entry {path}: {reason}")]
    CorruptOverflow { path: PathBuf, reason: String },
    #[error("overflow buffer full ({capacity} entries), cannot spill batch for {instrument}")]
    OverflowExhausted {
        instrument: InstrumentId,
        capacity: usize,
    },
}

/// Invalid or unreadable configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("environment variable {0} is not set")]
    MissingCredential(String),
}

/// Failures reported by a `ServiceSupervisor`.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// Conditions that cannot be resolved inside a stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("feed permanently disconnected: {0}")]
    FatalDisconnect(#[source] ConnectivityError),
    #[error("overflow capacity exhausted: {0}")]
    OverflowExhausted(#[source] WriteError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("startup failed: {0}")]
    Startup(String),
}
