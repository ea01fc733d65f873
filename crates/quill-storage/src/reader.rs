//! Stream traversal
//!
//! A [`StreamReader`] walks one stream newest-first by following `previous`
//! links. Records come from the cache when possible and otherwise from a
//! read handle borrowed from the [`ReadPool`]. A handle belongs to the file
//! generation it was opened on; compaction bumps the generation, so handles
//! on retired files are never pooled again.

use crate::backing::{BackingStore, FileStore};
use crate::cache::CacheKey;
use crate::engine::Shared;
use crate::record::{self, DecodeError};
use parking_lot::Mutex;
use quill_common::{Error, NOT_EXISTS, Record, Result, is_chain_end};
use std::io::{Seek, SeekFrom};
use std::sync::Arc;

/// Idle read handles kept per engine
const MAX_POOLED_HANDLES: usize = 32;

/// Idle read handles tagged with their file generation
pub(crate) struct ReadPool<R> {
    handles: Mutex<Vec<(u64, R)>>,
}

impl<R> ReadPool<R> {
    pub(crate) fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Pop an idle handle opened on `generation`, dropping stale ones
    pub(crate) fn take(&self, generation: u64) -> Option<R> {
        let mut handles = self.handles.lock();
        while let Some((tag, handle)) = handles.pop() {
            if tag == generation {
                return Some(handle);
            }
        }
        None
    }

    /// Return a handle unless it belongs to an older generation than `current`
    pub(crate) fn give_back(&self, generation: u64, handle: R, current: impl FnOnce() -> u64) {
        let mut handles = self.handles.lock();
        if generation == current() && handles.len() < MAX_POOLED_HANDLES {
            handles.push((generation, handle));
        }
    }

    /// Close every idle handle
    pub(crate) fn clear(&self) {
        self.handles.lock().clear();
    }

    pub(crate) fn idle(&self) -> usize {
        self.handles.lock().len()
    }
}

/// Lazy newest-first iterator over one stream.
///
/// Single pass; a fresh call to `Engine::read` starts from the then-current
/// index entry. Keeps reading the file version it started on even if
/// compaction swaps in a new one meanwhile.
pub struct StreamReader<S: BackingStore = FileStore> {
    shared: Arc<Shared<S>>,
    handle: Option<S::Read>,
    generation: u64,
    next: i64,
}

impl<S: BackingStore> StreamReader<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>, handle: S::Read, generation: u64, head: i64) -> Self {
        Self {
            shared,
            handle: Some(handle),
            generation,
            next: head,
        }
    }

    fn load(&mut self, position: i64) -> Result<Arc<Record>> {
        let offset = u64::try_from(position)
            .map_err(|_| Error::corrupt(0, format!("negative record position {position}")))?;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| Error::internal("stream reader used after release"))?;

        handle.seek(SeekFrom::Start(offset))?;
        let (record, _) = record::decode(handle).map_err(|e| match e {
            DecodeError::Io(e) => Error::Io(e),
            DecodeError::EndOfFile => Error::corrupt(offset, "chain points past end of file"),
            DecodeError::Torn(reason) | DecodeError::Malformed(reason) => {
                Error::corrupt(offset, reason)
            }
        })?;

        let record = Arc::new(record);
        if self.generation == self.shared.generation() {
            self.shared
                .cache
                .set(CacheKey::new(self.generation, position), Arc::clone(&record));
        }
        Ok(record)
    }
}

impl<S: BackingStore> Iterator for StreamReader<S> {
    type Item = Result<Arc<Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        if is_chain_end(self.next) {
            return None;
        }
        let position = self.next;

        let record = match self.shared.cache.get(&CacheKey::new(self.generation, position)) {
            Some(record) => record,
            None => match self.load(position) {
                Ok(record) => record,
                Err(e) => {
                    self.next = NOT_EXISTS;
                    return Some(Err(e));
                }
            },
        };

        self.next = record.previous;
        Some(Ok(record))
    }
}

impl<S: BackingStore> Drop for StreamReader<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let shared = &self.shared;
            shared
                .pool
                .give_back(self.generation, handle, || shared.generation());
        }
    }
}
