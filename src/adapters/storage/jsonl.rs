//! JSONL Record Store - Append-only Per-Instrument Collections
//!
//! Persists canonical records to `collections/{instrument}.jsonl`, one
//! JSON object per line, every feed frame to `collections/raw.jsonl`
//! and feed gaps to `gaps.jsonl`. A batch is
//! serialized into a single buffer and appended with one `write_all`
//! followed by `sync_data`, so after a crash a collection holds whole
//! batches plus at most one torn trailing line. The torn line is cut
//! off the next time a writer opens the collection.
//!
//! Counts are maintained incrementally from a byte offset, so a reader
//! in another process (the health monitor) sees new records without
//! rescanning the file.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::domain::tick::{CanonicalRecord, GapMarker, InstrumentId, RawFrame, WriteBatch};
use crate::error::StorageError;
use crate::ports::storage::{RecordStore, RAW_COLLECTION};

const COLLECTIONS_DIR: &str = "collections";
const GAPS_FILE: &str = "gaps.jsonl";

#[derive(Deserialize)]
struct SequenceOnly {
    sequence: u64,
}

/// Cached view of one collection file.
struct Collection {
    path: PathBuf,
    /// Bytes of complete lines already accounted for.
    offset: u64,
    count: u64,
    last_sequence: Option<u64>,
    /// Whether a torn tail has been checked for since open.
    repaired: bool,
}

impl Collection {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            count: 0,
            last_sequence: None,
            repaired: false,
        }
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Account for complete lines appended since the last refresh.
    /// Returns the file length.
    async fn refresh(&mut self) -> Result<u64, StorageError> {
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.offset = 0;
                self.count = 0;
                self.last_sequence = None;
                return Ok(0);
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let len = file.metadata().await.map_err(|e| self.io_error(e))?.len();
        if len < self.offset {
            // Replaced or truncated underneath us: recount from scratch.
            self.offset = 0;
            self.count = 0;
            self.last_sequence = None;
        }
        if len == self.offset {
            return Ok(len);
        }

        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| self.io_error(e))?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf).await.map_err(|e| self.io_error(e))?;

        let Some(end) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(len);
        };
        let complete = &buf[..=end];
        for line in complete.split(|&b| b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            self.count += 1;
        }
        if let Some(last) = complete
            .split(|&b| b == b'\n')
            .rev()
            .find(|l| !l.iter().all(u8::is_ascii_whitespace))
        {
            match serde_json::from_slice::<SequenceOnly>(last) {
                Ok(parsed) => self.last_sequence = Some(parsed.sequence),
                Err(e) => warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Last record line has no readable sequence"
                ),
            }
        }
        self.offset += (end + 1) as u64;
        Ok(len)
    }

    /// Cut a torn trailing line left by a crash mid-append.
    async fn repair(&mut self) -> Result<(), StorageError> {
        let len = self.refresh().await?;
        if len > self.offset {
            warn!(
                path = %self.path.display(),
                torn_bytes = len - self.offset,
                "Truncating partial trailing record"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&self.path)
                .await
                .map_err(|e| self.io_error(e))?;
            file.set_len(self.offset).await.map_err(|e| self.io_error(e))?;
            file.sync_all().await.map_err(|e| self.io_error(e))?;
        }
        self.repaired = true;
        Ok(())
    }
}

/// Append-only JSONL record store.
pub struct JsonlStore {
    root: PathBuf,
    collections_dir: PathBuf,
    collections: parking_lot::Mutex<HashMap<InstrumentId, Arc<Mutex<Collection>>>>,
    gaps: Mutex<()>,
    raw: Mutex<()>,
}

impl JsonlStore {
    /// Open (creating if needed) a store rooted at `data_dir`.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = data_dir.as_ref().to_path_buf();
        let collections_dir = root.join(COLLECTIONS_DIR);
        fs::create_dir_all(&collections_dir)
            .await
            .map_err(|source| StorageError::Io {
                path: collections_dir.clone(),
                source,
            })?;

        Ok(Self {
            root,
            collections_dir,
            collections: parking_lot::Mutex::new(HashMap::new()),
            gaps: Mutex::new(()),
            raw: Mutex::new(()),
        })
    }

    fn collection(&self, instrument: &InstrumentId) -> Result<Arc<Mutex<Collection>>, StorageError> {
        if !instrument.is_valid() || instrument.as_str() == RAW_COLLECTION {
            return Err(StorageError::Unavailable(format!(
                "invalid collection name {instrument:?}"
            )));
        }
        let mut collections = self.collections.lock();
        let entry = collections.entry(instrument.clone()).or_insert_with(|| {
            let path = self.collections_dir.join(format!("{instrument}.jsonl"));
            Arc::new(Mutex::new(Collection::new(path)))
        });
        Ok(Arc::clone(entry))
    }

    /// Read back every record of a collection, in file order.
    pub async fn read_records(
        &self,
        instrument: &InstrumentId,
    ) -> Result<Vec<CanonicalRecord>, StorageError> {
        let path = self.collections_dir.join(format!("{instrument}.jsonl"));
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<CanonicalRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    file = %path.display(),
                    error = %e,
                    "Skipping malformed record line"
                ),
            }
        }
        Ok(records)
    }

    /// Read back the raw frame journal, skipping a torn trailing line.
    pub async fn read_raw(&self) -> Result<Vec<RawFrame>, StorageError> {
        let path = self.raw_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    fn raw_path(&self) -> PathBuf {
        self.collections_dir.join(format!("{RAW_COLLECTION}.jsonl"))
    }

    /// Read back every gap marker.
    pub async fn read_gaps(&self) -> Result<Vec<GapMarker>, StorageError> {
        let path = self.root.join(GAPS_FILE);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[async_trait]
impl RecordStore for JsonlStore {
    #[instrument(skip(self, batch), fields(instrument = %batch.instrument, records = batch.len()))]
    async fn insert_batch(&self, batch: &WriteBatch) -> Result<usize, StorageError> {
        let collection = self.collection(&batch.instrument)?;
        let mut collection = collection.lock().await;
        if collection.repaired {
            collection.refresh().await?;
        } else {
            collection.repair().await?;
        }

        let mut high = collection.last_sequence;
        let mut buf = String::new();
        let mut written = 0usize;
        for record in &batch.records {
            if let Some(h) = high {
                if record.sequence <= h {
                    if collection.last_sequence.is_some_and(|last| record.sequence <= last) {
                        // Already persisted by an earlier attempt.
                        continue;
                    }
                    return Err(StorageError::SequenceRegression {
                        instrument: batch.instrument.clone(),
                        first: record.sequence,
                        last: h,
                    });
                }
            }
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
            high = Some(record.sequence);
            written += 1;
        }

        if written == 0 {
            debug!("Batch already persisted, nothing to append");
            return Ok(0);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&collection.path)
            .await
            .map_err(|e| collection.io_error(e))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| collection.io_error(e))?;
        file.flush().await.map_err(|e| collection.io_error(e))?;
        file.sync_data().await.map_err(|e| collection.io_error(e))?;

        collection.offset += buf.len() as u64;
        collection.count += written as u64;
        collection.last_sequence = high;
        Ok(written)
    }

    async fn count(&self, instrument: &InstrumentId) -> Result<u64, StorageError> {
        let collection = self.collection(instrument)?;
        let mut collection = collection.lock().await;
        collection.refresh().await?;
        Ok(collection.count)
    }

    async fn last_sequence(&self, instrument: &InstrumentId) -> Result<Option<u64>, StorageError> {
        let collection = self.collection(instrument)?;
        let mut collection = collection.lock().await;
        collection.refresh().await?;
        Ok(collection.last_sequence)
    }

    async fn instruments(&self) -> Result<Vec<InstrumentId>, StorageError> {
        let io = |source: std::io::Error| StorageError::Io {
            path: self.collections_dir.clone(),
            source,
        };
        let mut entries = fs::read_dir(&self.collections_dir).await.map_err(io)?;
        let mut instruments = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io)? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                if let Some(stem) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .filter(|s| *s != RAW_COLLECTION)
                {
                    let id = InstrumentId::new(stem);
                    if id.is_valid() {
                        instruments.push(id);
                    }
                }
            }
        }
        instruments.sort();
        Ok(instruments)
    }

    #[instrument(skip(self, gap), fields(instruments = gap.instruments.len()))]
    async fn record_gap(&self, gap: &GapMarker) -> Result<(), StorageError> {
        let path = self.root.join(GAPS_FILE);
        let mut json = serde_json::to_string(gap)?;
        json.push('\n');

        let _guard = self.gaps.lock().await;
        let io = |source: std::io::Error| StorageError::Io {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io)?;
        file.write_all(json.as_bytes()).await.map_err(io)?;
        file.flush().await.map_err(io)?;
        Ok(())
    }

    #[instrument(skip(self, frames), fields(frames = frames.len()))]
    async fn record_raw(&self, frames: &[RawFrame]) -> Result<(), StorageError> {
        if frames.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for frame in frames {
            buf.push_str(&serde_json::to_string(frame)?);
            buf.push('\n');
        }

        let path = self.raw_path();
        let _guard = self.raw.lock().await;
        let io = |source: std::io::Error| StorageError::Io {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io)?;
        file.write_all(buf.as_bytes()).await.map_err(io)?;
        file.flush().await.map_err(io)?;
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        fs::metadata(&self.collections_dir)
            .await
            .is_ok_and(|m| m.is_dir())
    }
}
