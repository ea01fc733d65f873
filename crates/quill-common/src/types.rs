//! Core type definitions for Quill
//!
//! This module defines the record model shared by the storage engine and
//! its callers: record states, chain sentinels, stream index entries and
//! the record itself.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Opaque structured document stored as record metadata and payload
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Position sentinel: the stream has no earlier record
pub const NOT_EXISTS: i64 = -1;

/// Position sentinel: the stream is tombstoned
pub const DELETED: i64 = -2;

/// Returns true if `position` ends a chain walk.
#[must_use]
pub const fn is_chain_end(position: i64) -> bool {
    position == NOT_EXISTS || position == DELETED
}

/// Kind of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[repr(i32)]
pub enum RecordState {
    /// Regular domain event
    #[display("event")]
    Event = 0,
    /// Materialised state; readers may stop replaying here
    #[display("snapshot")]
    Snapshot = 1,
    /// Tombstone for the whole stream
    #[display("delete")]
    Delete = 2,
}

impl RecordState {
    /// Decode the on-disk tag
    #[must_use]
    pub const fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Event),
            1 => Some(Self::Snapshot),
            2 => Some(Self::Delete),
            _ => None,
        }
    }

    /// On-disk tag
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Latest durable position and live length of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamIndexEntry {
    /// Offset of the newest record, or a sentinel
    pub last_position: i64,
    /// Live records in the stream
    pub stream_length: i32,
}

impl StreamIndexEntry {
    /// Entry for a stream whose newest record sits at `position`
    #[must_use]
    pub const fn at(position: i64, stream_length: i32) -> Self {
        Self {
            last_position: position,
            stream_length,
        }
    }

    /// Entry for a tombstoned stream
    #[must_use]
    pub const fn deleted() -> Self {
        Self {
            last_position: DELETED,
            stream_length: 0,
        }
    }

    /// True if the entry points into a chain
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !is_chain_end(self.last_position)
    }

    /// Entry after appending a record of `state` at `position`.
    ///
    /// Returns the new entry and the number of records that became garbage
    /// (the tombstone itself plus the prior live length, for deletes).
    #[must_use]
    pub fn advance(prior: Option<Self>, state: RecordState, position: i64) -> (Self, u64) {
        let prior_len = prior
            .filter(Self::is_live)
            .map_or(0, |entry| entry.stream_length);
        match state {
            RecordState::Event | RecordState::Snapshot => {
                (Self::at(position, prior_len.saturating_add(1)), 0)
            }
            RecordState::Delete => (Self::deleted(), u64::from(prior_len.unsigned_abs()) + 1),
        }
    }

    /// `previous` link for the next record appended after this entry
    #[must_use]
    pub fn chain_head(entry: Option<Self>) -> i64 {
        match entry {
            Some(entry) if entry.is_live() => entry.last_position,
            _ => NOT_EXISTS,
        }
    }
}

/// One immutable record of a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stream identifier (case-insensitive identity)
    pub stream_id: String,
    /// Offset of the previous record of the stream, or a sentinel
    pub previous: i64,
    /// Live records in the stream as of this write
    pub stream_length: i32,
    /// Record kind
    pub state: RecordState,
    /// Caller metadata
    pub metadata: Document,
    /// Caller payload, empty for deletes
    pub payload: Document,
}

/// Lifecycle state of a storage engine
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum EngineState {
    #[display("opening")]
    Opening,
    #[display("open")]
    Open,
    /// Terminal after a failed durable flush
    #[display("corrupted: {_0}")]
    Corrupted(String),
    #[display("disposing")]
    Disposing,
    #[display("closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tags() {
        for state in [RecordState::Event, RecordState::Snapshot, RecordState::Delete] {
            assert_eq!(RecordState::from_i32(state.as_i32()), Some(state));
        }
        assert_eq!(RecordState::from_i32(3), None);
        assert_eq!(RecordState::from_i32(-1), None);
    }

    #[test]
    fn test_advance_event_counts_up() {
        let (first, garbage) = StreamIndexEntry::advance(None, RecordState::Event, 0);
        assert_eq!(first, StreamIndexEntry::at(0, 1));
        assert_eq!(garbage, 0);

        let (second, _) = StreamIndexEntry::advance(Some(first), RecordState::Snapshot, 120);
        assert_eq!(second, StreamIndexEntry::at(120, 2));
    }

    #[test]
    fn test_advance_delete_reports_garbage() {
        let live = StreamIndexEntry::at(300, 4);
        let (entry, garbage) = StreamIndexEntry::advance(Some(live), RecordState::Delete, 400);
        assert_eq!(entry, StreamIndexEntry::deleted());
        assert_eq!(garbage, 5);
    }

    #[test]
    fn test_write_after_delete_starts_new_chain() {
        let deleted = StreamIndexEntry::deleted();
        assert_eq!(StreamIndexEntry::chain_head(Some(deleted)), NOT_EXISTS);
        assert_eq!(StreamIndexEntry::chain_head(None), NOT_EXISTS);

        let (entry, _) = StreamIndexEntry::advance(Some(deleted), RecordState::Event, 50);
        assert_eq!(entry, StreamIndexEntry::at(50, 1));
    }

    #[test]
    fn test_chain_end() {
        assert!(is_chain_end(NOT_EXISTS));
        assert!(is_chain_end(DELETED));
        assert!(!is_chain_end(0));
    }
}
