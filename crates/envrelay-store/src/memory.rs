//! ---
//! relay_section: "03-persistence-logging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Persistence abstractions and storage bindings."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use envrelay_msg::{Layer, Message, StoredRecord};
use parking_lot::RwLock;

use crate::collection::{alert_layer, CentralStore, Collection};
use crate::Result;

#[derive(Debug, Default)]
struct MemoryInner {
    collections: HashMap<Collection, Vec<StoredRecord>>,
    sequences: HashMap<Collection, u64>,
}

/// Volatile store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection.
    pub fn len(&self, collection: Collection) -> usize {
        self.inner
            .read()
            .collections
            .get(&collection)
            .map_or(0, Vec::len)
    }
}

impl CentralStore for MemoryStore {
    fn insert(&self, collection: Collection, message: Message) -> Result<StoredRecord> {
        let mut inner = self.inner.write();
        let sequence = inner.sequences.entry(collection).or_insert(0);
        *sequence += 1;
        let record = StoredRecord {
            sequence: *sequence,
            stored_at: Utc::now(),
            message,
        };
        inner
            .collections
            .entry(collection)
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    fn query_last(&self, collection: Collection, n: usize) -> Result<Vec<StoredRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .collections
            .get(&collection)
            .map(|records| records.iter().rev().take(n).cloned().collect())
            .unwrap_or_default())
    }

    fn drop_all(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.collections.clear();
        inner.sequences.clear();
        Ok(())
    }

    fn aggregate_alert_counts_by_layer(&self) -> Result<BTreeMap<Layer, u64>> {
        let inner = self.inner.read();
        let mut counts = BTreeMap::new();
        for record in inner
            .collections
            .get(&Collection::Alerts)
            .into_iter()
            .flatten()
        {
            if let Some(layer) = alert_layer(&record.message) {
                *counts.entry(layer).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}
