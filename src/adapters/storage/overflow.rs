//! Overflow Buffer - Durable Local Spill for Unwritable Batches
//!
//! Each spilled batch is one file, `{dir}/{instrument}/{seq:016}.json`,
//! written to a `.tmp` sibling and renamed into place so an entry is
//! either fully present or absent. `seq` is a buffer-wide spill counter,
//! so file-name order is spill order. The in-memory index is rebuilt
//! from disk on open, which makes pending entries survive a restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

use crate::domain::tick::{InstrumentId, OverflowEntry, WriteBatch};
use crate::error::WriteError;

const ENTRY_EXT: &str = "json";
const TMP_EXT: &str = "tmp";
const CORRUPT_EXT: &str = "corrupt";

/// Locates one entry on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowKey {
    pub instrument: InstrumentId,
    pub seq: u64,
}

#[derive(Debug, Default)]
struct Index {
    pending: BTreeMap<InstrumentId, BTreeMap<u64, PathBuf>>,
    /// Entries on disk plus slots reserved by in-progress spills.
    reserved: usize,
    next_seq: u64,
}

/// Bounded, restart-safe spill buffer.
pub struct OverflowBuffer {
    dir: PathBuf,
    capacity: usize,
    index: parking_lot::Mutex<Index>,
}

impl OverflowBuffer {
    /// Open the buffer at `dir`, creating it if needed and indexing any
    /// entries left by a previous run.
    #[instrument]
    pub async fn open(dir: impl AsRef<Path> + std::fmt::Debug, capacity: usize) -> Result<Self, WriteError> {
        let dir = dir.as_ref().to_path_buf();
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| WriteError::Overflow { path, source }
        };
        fs::create_dir_all(&dir).await.map_err(io(&dir))?;

        let mut index = Index::default();
        let mut instruments = fs::read_dir(&dir).await.map_err(io(&dir))?;
        while let Some(entry) = instruments.next_entry().await.map_err(io(&dir))? {
            let sub = entry.path();
            let Some(name) = sub.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let instrument = InstrumentId::new(name);
            if !sub.is_dir() || !instrument.is_valid() {
                continue;
            }

            let mut files = fs::read_dir(&sub).await.map_err(io(&sub))?;
            while let Some(file) = files.next_entry().await.map_err(io(&sub))? {
                let path = file.path();
                let ext = path.extension().and_then(|e| e.to_str());
                if ext == Some(TMP_EXT) {
                    // Spill interrupted before rename; the batch was never
                    // acknowledged as spilled.
                    warn!(path = %path.display(), "Removing incomplete overflow entry");
                    fs::remove_file(&path).await.map_err(io(&path))?;
                    continue;
                }
                if ext != Some(ENTRY_EXT) {
                    continue;
                }
                let Some(seq) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                else {
                    continue;
                };
                index.next_seq = index.next_seq.max(seq + 1);
                index.reserved += 1;
                index
                    .pending
                    .entry(instrument.clone())
                    .or_default()
                    .insert(seq, path);
            }
        }

        if index.reserved > 0 {
            info!(
                entries = index.reserved,
                instruments = index.pending.len(),
                "Recovered pending overflow entries"
            );
        }

        Ok(Self {
            dir,
            capacity: capacity.max(1),
            index: parking_lot::Mutex::new(index),
        })
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently held (including spills in progress).
    pub fn len(&self) -> usize {
        self.index.lock().reserved
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending entries for one instrument.
    pub fn pending(&self, instrument: &InstrumentId) -> usize {
        self.index
            .lock()
            .pending
            .get(instrument)
            .map_or(0, BTreeMap::len)
    }

    pub fn instruments_with_pending(&self) -> Vec<InstrumentId> {
        self.index
            .lock()
            .pending
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Durably store a batch. Fails with `OverflowExhausted` when full.
    #[instrument(skip(self, batch), fields(instrument = %batch.instrument, records = batch.len()))]
    pub async fn spill(&self, batch: &WriteBatch) -> Result<OverflowKey, WriteError> {
        let seq = {
            let mut index = self.index.lock();
            if index.reserved >= self.capacity {
                return Err(WriteError::OverflowExhausted {
                    instrument: batch.instrument.clone(),
                    capacity: self.capacity,
                });
            }
            index.reserved += 1;
            let seq = index.next_seq;
            index.next_seq += 1;
            seq
        };

        match self.write_entry(batch, seq).await {
            Ok(path) => {
                self.index
                    .lock()
                    .pending
                    .entry(batch.instrument.clone())
                    .or_default()
                    .insert(seq, path);
                Ok(OverflowKey {
                    instrument: batch.instrument.clone(),
                    seq,
                })
            }
            Err(e) => {
                self.index.lock().reserved -= 1;
                Err(e)
            }
        }
    }

    async fn write_entry(&self, batch: &WriteBatch, seq: u64) -> Result<PathBuf, WriteError> {
        let sub = self.dir.join(batch.instrument.as_str());
        let path = sub.join(format!("{seq:016}.{ENTRY_EXT}"));
        let tmp = sub.join(format!("{seq:016}.{TMP_EXT}"));
        let io = |p: &Path| {
            let p = p.to_path_buf();
            move |source| WriteError::Overflow { path: p, source }
        };

        let entry = OverflowEntry::new(batch.clone());
        let json = serde_json::to_vec(&entry).map_err(|e| WriteError::CorruptOverflow {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        fs::create_dir_all(&sub).await.map_err(io(&sub))?;
        let mut file = fs::File::create(&tmp).await.map_err(io(&tmp))?;
        file.write_all(&json).await.map_err(io(&tmp))?;
        file.flush().await.map_err(io(&tmp))?;
        file.sync_all().await.map_err(io(&tmp))?;
        drop(file);
        fs::rename(&tmp, &path).await.map_err(io(&path))?;
        Ok(path)
    }

    /// Key of the oldest pending entry for an instrument.
    pub fn oldest(&self, instrument: &InstrumentId) -> Option<OverflowKey> {
        self.index
            .lock()
            .pending
            .get(instrument)
            .and_then(|entries| entries.keys().next().copied())
            .map(|seq| OverflowKey {
                instrument: instrument.clone(),
                seq,
            })
    }

    /// Key of the newest pending entry for an instrument.
    pub fn newest(&self, instrument: &InstrumentId) -> Option<OverflowKey> {
        self.index
            .lock()
            .pending
            .get(instrument)
            .and_then(|entries| entries.keys().next_back().copied())
            .map(|seq| OverflowKey {
                instrument: instrument.clone(),
                seq,
            })
    }

    /// Load an entry from disk.
    pub async fn read(&self, key: &OverflowKey) -> Result<OverflowEntry, WriteError> {
        let Some(path) = self.path_of(key) else {
            return Err(WriteError::CorruptOverflow {
                path: self.dir.clone(),
                reason: format!("no entry {} for {}", key.seq, key.instrument),
            });
        };
        let bytes = fs::read(&path).await.map_err(|source| WriteError::Overflow {
            path: path.clone(),
            source,
        })?;
        let entry: OverflowEntry =
            serde_json::from_slice(&bytes).map_err(|e| WriteError::CorruptOverflow {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if entry.batch.instrument != key.instrument {
            return Err(WriteError::CorruptOverflow {
                path,
                reason: format!("entry belongs to {}", entry.batch.instrument),
            });
        }
        Ok(entry)
    }

    /// Oldest pending entry for an instrument, without removing it.
    pub async fn peek(
        &self,
        instrument: &InstrumentId,
    ) -> Result<Option<(OverflowKey, OverflowEntry)>, WriteError> {
        let Some(key) = self.oldest(instrument) else {
            return Ok(None);
        };
        let entry = self.read(&key).await?;
        Ok(Some((key, entry)))
    }

    /// Highest record sequence held for an instrument, if any.
    pub async fn last_sequence(&self, instrument: &InstrumentId) -> Result<Option<u64>, WriteError> {
        let Some(key) = self.newest(instrument) else {
            return Ok(None);
        };
        Ok(self.read(&key).await?.batch.last_sequence())
    }

    /// Remove an entry after its batch was confirmed written.
    pub async fn remove(&self, key: &OverflowKey) -> Result<(), WriteError> {
        let Some(path) = self.path_of(key) else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(WriteError::Overflow { path, source }),
        }
        self.forget(key);
        Ok(())
    }

    /// Move an unreadable entry aside so replay can continue past it.
    pub async fn quarantine(&self, key: &OverflowKey) -> Result<PathBuf, WriteError> {
        let Some(path) = self.path_of(key) else {
            return Err(WriteError::CorruptOverflow {
                path: self.dir.clone(),
                reason: format!("no entry {} for {}", key.seq, key.instrument),
            });
        };
        let aside = path.with_extension(CORRUPT_EXT);
        fs::rename(&path, &aside)
            .await
            .map_err(|source| WriteError::Overflow {
                path: path.clone(),
                source,
            })?;
        self.forget(key);
        Ok(aside)
    }

    fn path_of(&self, key: &OverflowKey) -> Option<PathBuf> {
        self.index
            .lock()
            .pending
            .get(&key.instrument)
            .and_then(|entries| entries.get(&key.seq).cloned())
    }

    fn forget(&self, key: &OverflowKey) {
        let mut index = self.index.lock();
        let removed = index
            .pending
            .get_mut(&key.instrument)
            .and_then(|entries| entries.remove(&key.seq))
            .is_some();
        if removed {
            index.reserved = index.reserved.saturating_sub(1);
        }
        if index
            .pending
            .get(&key.instrument)
            .is_some_and(BTreeMap::is_empty)
        {
            index.pending.remove(&key.instrument);
        }
    }
}
