//! Key index implementation
//!
//! HashMap-based index with RwLock for concurrency.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::log::{LogEntry, Location, Operation};

use super::IndexEntry;

/// Key → newest location map
pub struct KeyIndex {
    entries: RwLock<HashMap<Vec<u8>, IndexEntry>>,
}

impl KeyIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the entry for a key (read lock)
    pub fn lookup(&self, key: &[u8]) -> Option<IndexEntry> {
        self.entries.read().get(key).copied()
    }

    /// Insert or replace the entry for a key (write lock)
    ///
    /// An entry with a lower sequence number than the one already stored is
    /// ignored, so replaying an older entry can never roll a key back.
    /// Returns whether the index changed.
    pub fn upsert(&self, key: Vec<u8>, entry: IndexEntry) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(current) if current.sequence > entry.sequence => false,
            _ => {
                entries.insert(key, entry);
                true
            }
        }
    }

    /// Remove a key (write lock); returns the entry it had
    pub fn remove(&self, key: &[u8]) -> Option<IndexEntry> {
        self.entries.write().remove(key)
    }

    /// Apply one replayed log entry: Puts upsert, Deletes remove
    pub fn apply(&self, location: Location, entry: &LogEntry) {
        match &entry.operation {
            Operation::Put { key, value } => {
                self.upsert(
                    key.clone(),
                    IndexEntry {
                        sequence: entry.sequence,
                        location,
                        value_len: value.len(),
                    },
                );
            }
            Operation::Delete { key } => {
                let mut entries = self.entries.write();
                if matches!(entries.get(key.as_slice()), Some(e) if e.sequence < entry.sequence) {
                    entries.remove(key.as_slice());
                }
            }
        }
    }

    /// Replace the contents with a replay of `entries` (sequence order,
    /// last write wins)
    pub fn rebuild_from<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = Result<(Location, LogEntry)>>,
    {
        self.entries.write().clear();
        for item in entries {
            let (location, entry) = item?;
            self.apply(location, &entry);
        }
        Ok(())
    }

    /// Whether `key` currently resolves to exactly `location`
    pub fn points_to(&self, key: &[u8], location: &Location) -> bool {
        matches!(self.entries.read().get(key), Some(e) if e.location == *location)
    }

    /// Move `key` from `from` to `to` if it still points at `from`
    ///
    /// A key that was overwritten or deleted since `from` was read is left
    /// alone. Returns whether the key moved.
    pub fn relocate(&self, key: &[u8], from: &Location, to: Location) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if entry.location == *from => {
                entry.location = to;
                true
            }
            _ => false,
        }
    }

    /// Relocate a batch under a single write lock; returns how many moved
    pub fn relocate_all<I>(&self, moves: I) -> usize
    where
        I: IntoIterator<Item = (Vec<u8>, Location, Location)>,
    {
        let mut entries = self.entries.write();
        let mut moved = 0;
        for (key, from, to) in moves {
            if let Some(entry) = entries.get_mut(&key) {
                if entry.location == from {
                    entry.location = to;
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Bytes of log entries the index references, per segment id
    pub fn live_bytes_by_segment(&self) -> HashMap<u64, u64> {
        let entries = self.entries.read();
        let mut live = HashMap::new();
        for entry in entries.values() {
            *live.entry(entry.location.segment_id).or_insert(0) += entry.location.len as u64;
        }
        live
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for KeyIndex {
    fn default() -> Self {
        Self::new()
    }
}
