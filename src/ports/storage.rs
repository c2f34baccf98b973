//! Storage Port - Durable Record Collections
//!
//! One collection per instrument. Inserts are batched and atomic per
//! batch; writers for different instruments may run concurrently.

use async_trait::async_trait;

use crate::domain::tick::{GapMarker, InstrumentId, RawFrame, WriteBatch};
use crate::error::StorageError;

/// Collection holding the raw frame journal. Never an instrument.
pub const RAW_COLLECTION: &str = "raw";

/// Durable record storage shared by the writer and the health monitor.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
  /// Append a batch to its instrument's collection, all or nothing.
  ///
  /// Records whose sequence is at or below the collection's last
  /// persisted sequence are skipped, so re-inserting a batch is
  /// harmless. Returns the number of records actually written.
  async fn insert_batch(&self, batch: &WriteBatch) -> Result<usize, StorageError>;

  /// Number of records persisted for an instrument (0 if none).
  async fn count(&self, instrument: &InstrumentId) -> Result<u64, StorageError>;

  /// Highest persisted sequence for an instrument, if any.
  async fn last_sequence(&self, instrument: &InstrumentId) -> Result<Option<u64>, StorageError>;

  /// Instruments that have a collection. The raw journal is not one.
  async fn instruments(&self) -> Result<Vec<InstrumentId>, StorageError>;

  /// Persist a feed gap marker.
  async fn record_gap(&self, gap: &GapMarker) -> Result<(), StorageError>;

  /// Append frames to the raw journal in order.
  async fn record_raw(&self, frames: &[RawFrame]) -> Result<(), StorageError>;

  /// Cheap reachability check for readiness.
  async fn is_healthy(&self) -> bool;
}
