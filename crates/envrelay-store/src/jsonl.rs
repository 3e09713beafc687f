//! ---
//! relay_section: "03-persistence-logging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Persistence abstractions and storage bindings."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Append-only JSON-lines backend: one file per collection, one sequenced
//! [`StoredRecord`] per line.
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use envrelay_msg::{Layer, Message, StoredRecord};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::collection::{alert_layer, CentralStore, Collection};
use crate::Result;

/// Records kept in memory per collection when no tail size is given.
pub const DEFAULT_TAIL_CAPACITY: usize = 64;

struct CollectionLog {
    writer: BufWriter<File>,
    next_sequence: u64,
    /// Most recent records, oldest first.
    tail: VecDeque<StoredRecord>,
    tail_capacity: usize,
}

impl CollectionLog {
    fn open(path: &Path, collection: Collection, tail_capacity: usize) -> Result<Self> {
        let mut tail = VecDeque::with_capacity(tail_capacity);
        let next_sequence = if path.exists() {
            read_tail(path, collection, tail_capacity, &mut tail)?
        } else {
            0
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            next_sequence,
            tail,
            tail_capacity,
        })
    }

    fn append(&mut self, message: Message) -> Result<StoredRecord> {
        let record = StoredRecord {
            sequence: self.next_sequence + 1,
            stored_at: Utc::now(),
            message,
        };
        let line = serde_json::to_string(&record)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.next_sequence = record.sequence;
        push_bounded(&mut self.tail, record.clone(), self.tail_capacity);
        Ok(record)
    }

    fn last(&self, n: usize) -> Vec<StoredRecord> {
        self.tail.iter().rev().take(n).cloned().collect()
    }
}

#[derive(Default)]
struct JsonlInner {
    logs: HashMap<Collection, CollectionLog>,
    alert_counts: BTreeMap<Layer, u64>,
}

/// Durable store writing each collection to `<directory>/<collection>.jsonl`.
///
/// The last `tail_capacity` records of every collection stay in memory, so
/// `query_last` within that bound never touches the disk.
pub struct JsonlStore {
    directory: PathBuf,
    tail_capacity: usize,
    inner: Mutex<JsonlInner>,
}

impl JsonlStore {
    /// Open (or create) a store rooted at `directory`.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_tail(directory, DEFAULT_TAIL_CAPACITY)
    }

    /// Open a store keeping the last `tail_capacity` records per collection in memory.
    pub fn open_with_tail(directory: impl Into<PathBuf>, tail_capacity: usize) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        let alert_counts = count_alerts(&directory.join(Collection::Alerts.file_name()))?;
        info!(directory = %directory.display(), tail_capacity, "json-lines store opened");
        Ok(Self {
            directory,
            tail_capacity: tail_capacity.max(1),
            inner: Mutex::new(JsonlInner {
                logs: HashMap::new(),
                alert_counts,
            }),
        })
    }

    /// Root directory of the store.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, collection: Collection) -> PathBuf {
        self.directory.join(collection.file_name())
    }

    fn log_for<'a>(
        &self,
        logs: &'a mut HashMap<Collection, CollectionLog>,
        collection: Collection,
    ) -> Result<&'a mut CollectionLog> {
        Ok(match logs.entry(collection) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(CollectionLog::open(
                &self.path_for(collection),
                collection,
                self.tail_capacity,
            )?),
        })
    }
}

impl CentralStore for JsonlStore {
    fn insert(&self, collection: Collection, message: Message) -> Result<StoredRecord> {
        let layer = alert_layer(&message);
        let mut inner = self.inner.lock();
        let record = self.log_for(&mut inner.logs, collection)?.append(message)?;
        if let (Collection::Alerts, Some(layer)) = (collection, layer) {
            *inner.alert_counts.entry(layer).or_insert(0) += 1;
        }
        debug!(%collection, sequence = record.sequence, "record appended");
        Ok(record)
    }

    fn query_last(&self, collection: Collection, n: usize) -> Result<Vec<StoredRecord>> {
        let mut inner = self.inner.lock();
        if n == 0 || (!inner.logs.contains_key(&collection) && !self.path_for(collection).exists())
        {
            return Ok(Vec::new());
        }
        if n <= self.tail_capacity {
            return Ok(self.log_for(&mut inner.logs, collection)?.last(n));
        }
        // Deeper than the in-memory tail; the lock keeps appends from interleaving.
        let mut tail = VecDeque::with_capacity(n.min(1024));
        read_tail(&self.path_for(collection), collection, n, &mut tail)?;
        Ok(tail.into_iter().rev().collect())
    }

    fn drop_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.logs.clear();
        inner.alert_counts.clear();
        if self.directory.exists() {
            fs::remove_dir_all(&self.directory)?;
        }
        fs::create_dir_all(&self.directory)?;
        info!(directory = %self.directory.display(), "store dropped");
        Ok(())
    }

    fn aggregate_alert_counts_by_layer(&self) -> Result<BTreeMap<Layer, u64>> {
        Ok(self.inner.lock().alert_counts.clone())
    }
}

fn push_bounded(tail: &mut VecDeque<StoredRecord>, record: StoredRecord, capacity: usize) {
    if tail.len() == capacity {
        tail.pop_front();
    }
    tail.push_back(record);
}

/// Fill `tail` with the last `capacity` records of `path`; returns the last sequence.
fn read_tail(
    path: &Path,
    collection: Collection,
    capacity: usize,
    tail: &mut VecDeque<StoredRecord>,
) -> Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut last = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StoredRecord>(&line) {
            Ok(record) => {
                last = record.sequence;
                push_bounded(tail, record, capacity);
            }
            Err(err) => warn!(%collection, error = %err, "skipping unreadable record"),
        }
    }
    Ok(last)
}

fn count_alerts(path: &Path) -> Result<BTreeMap<Layer, u64>> {
    let mut counts = BTreeMap::new();
    if !path.exists() {
        return Ok(counts);
    }
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if let Ok(record) = serde_json::from_str::<StoredRecord>(&line) {
            if let Some(layer) = alert_layer(&record.message) {
                *counts.entry(layer).or_insert(0) += 1;
            }
        }
    }
    Ok(counts)
}
