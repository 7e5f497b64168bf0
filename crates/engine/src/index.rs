use std::collections::HashMap;

use parking_lot::RwLock;

/// Where to find the latest record for a key within one segment file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    /// Byte offset of the record's length prefix.
    pub offset: u64,
    /// Creation time of the record, seconds since the Unix epoch.
    pub creation_time: i64,
}

/// In-memory `key → offset` map for a single segment.
///
/// Reads proceed concurrently; writes are serialized against each other and
/// against reads. The map is a pure function of the segment file's bytes:
/// rebuilding it from the file yields the same entries.
#[derive(Debug, Default)]
pub struct SegmentIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl SegmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<IndexEntry> {
        self.entries.read().get(key).copied()
    }

    /// Insert or overwrite the entry for `key`.
    pub fn set(&self, key: impl Into<String>, offset: u64, creation_time: i64) {
        self.entries.write().insert(
            key.into(),
            IndexEntry {
                offset,
                creation_time,
            },
        );
    }

    /// Remove the entry for `key`. Not driven by user writes; deletion is a
    /// tombstone record, and the tombstone keeps its index entry.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Snapshot of the current key set, in no particular order.
    pub fn all_keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
