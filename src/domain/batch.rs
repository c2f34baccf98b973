//! Per-instrument batch accumulation with size-or-age flushing.
//!
//! Time is passed in by the caller so the flush rules are testable
//! without sleeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::domain::tick::{CanonicalRecord, InstrumentId, WriteBatch};

struct OpenBatch {
    records: Vec<CanonicalRecord>,
    opened_at: Instant,
}

/// Groups records into `WriteBatch`es, one open batch per instrument.
pub struct BatchAccumulator {
    max_records: usize,
    max_age: Duration,
    open: HashMap<InstrumentId, OpenBatch>,
}

impl BatchAccumulator {
    pub fn new(max_records: usize, max_age: Duration) -> Self {
        Self {
            max_records: max_records.max(1),
            max_age,
            open: HashMap::new(),
        }
    }

    /// Add a record. Returns the batch if it reached the size limit.
    pub fn push(&mut self, record: CanonicalRecord, now: Instant) -> Option<WriteBatch> {
        let instrument = record.instrument.clone();
        let max_records = self.max_records;
        let batch = self.open.entry(instrument.clone()).or_insert_with(|| OpenBatch {
            records: Vec::with_capacity(max_records),
            opened_at: now,
        });
        batch.records.push(record);

        if batch.records.len() >= max_records {
            let batch = self.open.remove(&instrument)?;
            return Some(WriteBatch::new(instrument, batch.records));
        }
        None
    }

    /// Remove and return every batch older than the age limit.
    pub fn take_expired(&mut self, now: Instant) -> Vec<WriteBatch> {
        let expired: Vec<InstrumentId> = self
            .open
            .iter()
            .filter(|(_, b)| now.saturating_duration_since(b.opened_at) >= self.max_age)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                self.open
                    .remove(&id)
                    .map(|b| WriteBatch::new(id, b.records))
            })
            .collect()
    }

    /// Flush everything, regardless of size or age.
    pub fn drain(&mut self) -> Vec<WriteBatch> {
        self.open
            .drain()
            .map(|(id, b)| WriteBatch::new(id, b.records))
            .collect()
    }

    /// Records currently held in open batches.
    pub fn pending_records(&self) -> usize {
        self.open.values().map(|b| b.records.len()).sum()
    }
}
