//! Quill Storage Engine - Append-only event storage
//!
//! This crate implements the storage engine for Quill including:
//! - Versioned backing files with atomic publish and deferred deletion
//! - Length-prefixed record format with torn-write detection
//! - Single background writer with group commit
//! - Backward-linked per-stream chains and a concurrent stream index
//! - Usage-ranked two-tier record cache
//! - Online compaction and offset-snapshot accelerated recovery
//! - Typed event layer over an explicit type registry

pub mod backing;
pub mod cache;
pub mod codec;
mod compaction;
pub mod engine;
pub mod index;
pub mod offsets;
pub mod pending;
pub mod reader;
pub mod record;
mod writer;

// Re-exports
pub use backing::{AppendFile, BackingStore, FileAppend, FileRead, FileStore};
pub use cache::{CacheKey, CacheSnapshot, RecordCache};
pub use codec::{AnyEvent, EventType, Journal, TYPE_TAG_KEY, TypeRegistry};
pub use engine::{DATA_FILE, Engine};
pub use index::StreamIndex;
pub use offsets::OffsetSnapshot;
pub use pending::PendingWrite;
pub use reader::StreamReader;
