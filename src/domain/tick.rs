//! Core market data types.
//!
//! Defines the values that flow through the pipeline: raw ticks from the
//! feed, canonical records written to storage, write batches, overflow
//! entries and gap markers.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ────────────────────────────────────────────
// Identifiers
// ────────────────────────────────────────────

/// Tradable instrument identifier (e.g. `EUR_USD`).
///
/// Doubles as the storage collection name, so it is restricted to
/// ASCII alphanumerics, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentId(String);

impl InstrumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable as a collection / directory name.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 64
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ────────────────────────────────────────────
// Feed-side types
// ────────────────────────────────────────────

/// One price update as received from the feed, not yet validated.
///
/// Price fields are kept as text: the formatter owns parsing and range
/// checks so that a malformed tick is quarantined in exactly one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTick {
    /// Instrument the update belongs to.
    pub instrument: InstrumentId,
    /// Per-instrument receive sequence assigned by the connector.
    pub sequence: u64,
    /// Source timestamp as sent by the feed.
    pub time: Option<String>,
    /// Closeout bid.
    pub bid: Option<String>,
    /// Closeout ask.
    pub ask: Option<String>,
    /// Feed-reported instrument status.
    pub status: Option<String>,
    /// Whether the instrument was tradeable at the time of the update.
    pub tradeable: Option<bool>,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
    /// The frame exactly as received.
    pub payload: String,
}

/// Record of a period during which the feed was not connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapMarker {
    /// Instruments whose tick stream may be incomplete.
    pub instruments: Vec<InstrumentId>,
    /// When the connection was lost.
    pub disconnected_at: DateTime<Utc>,
    /// When the connection was re-established.
    pub reconnected_at: DateTime<Utc>,
    /// Connection attempts it took to recover.
    pub attempts: u32,
    /// Why the connection was lost.
    pub reason: String,
}

/// A feed frame exactly as received, heartbeats included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub received_at: DateTime<Utc>,
    pub data: String,
}

/// Output of the stream connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Tick(RawTick),
    Gap(GapMarker),
}

// ────────────────────────────────────────────
// Storage-side types
// ────────────────────────────────────────────

/// Validated, UTC-normalized price record. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub instrument: InstrumentId,
    /// Strictly increasing per instrument.
    pub sequence: u64,
    pub time: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub tradeable: bool,
    pub received_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// Mid price of the quote.
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Ordered records for one instrument, written atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub instrument: InstrumentId,
    pub records: Vec<CanonicalRecord>,
    pub created_at: DateTime<Utc>,
}

impl WriteBatch {
    pub fn new(instrument: InstrumentId, records: Vec<CanonicalRecord>) -> Self {
        Self {
            instrument,
            records,
            created_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.records.first().map(|r| r.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.records.last().map(|r| r.sequence)
    }
}

/// A batch that could not be written and was spilled locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowEntry {
    pub id: Uuid,
    pub spilled_at: DateTime<Utc>,
    pub batch: WriteBatch,
}

impl OverflowEntry {
    pub fn new(batch: WriteBatch) -> Self {
        Self {
            id: Uuid::new_v4(),
            spilled_at: Utc::now(),
            batch,
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn record(sequence: u64) -> CanonicalRecord {
        CanonicalRecord {
            instrument: "EUR_USD".into(),
            sequence,
            time: Utc::now(),
            bid: dec!(1.1000),
            ask: dec!(1.1002),
            status: None,
            tradeable: true,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn instrument_id_validation() {
        assert!(InstrumentId::new("EUR_USD").is_valid());
        assert!(InstrumentId::new("XAU-USD").is_valid());
        assert!(!InstrumentId::new("").is_valid());
        assert!(!InstrumentId::new("../etc").is_valid());
        assert!(!InstrumentId::new("EUR USD").is_valid());
    }

    #[test]
    fn batch_sequence_bounds() {
        let batch = WriteBatch::new("EUR_USD".into(), vec![record(4), record(5), record(6)]);
        assert_eq!(batch.first_sequence(), Some(4));
        assert_eq!(batch.last_sequence(), Some(6));
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn record_mid_price() {
        assert_eq!(record(1).mid(), dec!(1.1001));
    }

    #[test]
    fn record_serializes_prices_as_strings() {
        let json = serde_json::to_string(&record(1)).unwrap();
        assert!(json.contains("\"bid\":\"1.1000\""));
        let back: CanonicalRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bid, dec!(1.1000));
    }
}
