//! Stream index
//!
//! Maps each stream (case-insensitively) to the offset of its newest durable
//! record and its live length. Rebuilt at startup, mutated only by the writer
//! thread, replaced wholesale by compaction and read by everyone.

use dashmap::DashMap;
use quill_common::{RecordState, StreamIndexEntry};
use std::collections::HashMap;

/// Index key for a stream id
#[must_use]
pub fn fold(stream_id: &str) -> String {
    stream_id.to_lowercase()
}

/// Concurrent stream id to [`StreamIndexEntry`] map
#[derive(Debug, Default)]
pub struct StreamIndex {
    entries: DashMap<String, StreamIndexEntry>,
}

impl StreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream_id: &str) -> Option<StreamIndexEntry> {
        self.get_folded(&fold(stream_id))
    }

    pub fn get_folded(&self, key: &str) -> Option<StreamIndexEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    pub fn insert_folded(&self, key: String, entry: StreamIndexEntry) {
        self.entries.insert(key, entry);
    }

    /// Apply a record found at `position` while scanning the data file.
    /// Returns the number of records it turned into garbage.
    pub fn apply(&self, stream_id: &str, state: RecordState, position: i64) -> u64 {
        let key = fold(stream_id);
        let prior = self.get_folded(&key);
        let (entry, garbage) = StreamIndexEntry::advance(prior, state, position);
        self.entries.insert(key, entry);
        garbage
    }

    /// Swap in a whole new set of entries
    pub fn replace(&self, entries: HashMap<String, StreamIndexEntry>) {
        self.entries.clear();
        for (key, entry) in entries {
            self.entries.insert(key, entry);
        }
    }

    /// Copy of every entry, ordered by key
    pub fn entries(&self) -> Vec<(String, StreamIndexEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Sum of live stream lengths
    pub fn live_records(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.value().is_live())
            .map(|e| u64::from(e.value().stream_length.unsigned_abs()))
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_common::DELETED;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let index = StreamIndex::new();
        index.apply("Users/1", RecordState::Event, 0);

        assert_eq!(index.get("users/1"), Some(StreamIndexEntry::at(0, 1)));
        assert_eq!(index.get("USERS/1"), Some(StreamIndexEntry::at(0, 1)));
        assert_eq!(index.get("users/2"), None);
    }

    #[test]
    fn test_apply_sequence() {
        let index = StreamIndex::new();
        assert_eq!(index.apply("a", RecordState::Event, 0), 0);
        assert_eq!(index.apply("a", RecordState::Snapshot, 40), 0);
        assert_eq!(index.apply("b", RecordState::Event, 80), 0);
        assert_eq!(index.get("a"), Some(StreamIndexEntry::at(40, 2)));
        assert_eq!(index.live_records(), 3);

        assert_eq!(index.apply("a", RecordState::Delete, 120), 3);
        assert_eq!(index.get("a").unwrap().last_position, DELETED);
        assert_eq!(index.live_records(), 1);

        index.apply("a", RecordState::Event, 160);
        assert_eq!(index.get("a"), Some(StreamIndexEntry::at(160, 1)));
    }

    #[test]
    fn test_replace() {
        let index = StreamIndex::new();
        index.apply("a", RecordState::Event, 0);
        index.apply("b", RecordState::Delete, 10);

        let mut fresh = HashMap::new();
        fresh.insert("a".to_string(), StreamIndexEntry::at(0, 1));
        index.replace(fresh);

        assert_eq!(index.len(), 1);
        assert_eq!(index.get("b"), None);
        assert_eq!(index.entries(), vec![("a".to_string(), StreamIndexEntry::at(0, 1))]);
    }
}
