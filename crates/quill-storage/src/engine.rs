//! Storage engine
//!
//! Ties the pieces together:
//! - startup recovery, optionally starting from an offset snapshot
//! - enqueue onto the background writer
//! - newest-first stream reads
//! - compaction requests
//! - orderly disposal

use crate::backing::{AppendFile, BackingStore, FileStore};
use crate::cache::{CacheSnapshot, RecordCache};
use crate::index::StreamIndex;
use crate::offsets::{self, OFFSETS_STAGED};
use crate::pending::PendingWrite;
use crate::reader::{ReadPool, StreamReader};
use crate::record::{self, DecodeError};
use crate::writer::{Command, WriteRequest, Writer};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use quill_common::{
    Document, EngineConfig, EngineState, Error, ErrorAggregator, RecordState, Result,
};
use std::io::{Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Logical name of the data file
pub const DATA_FILE: &str = "data.events";

/// Staging name used while compacting
pub const DATA_STAGED: &str = "data.events.compacting";

/// State shared between the engine handle, the writer thread and readers
pub(crate) struct Shared<S: BackingStore> {
    pub(crate) store: S,
    pub(crate) config: EngineConfig,
    pub(crate) index: StreamIndex,
    pub(crate) cache: RecordCache,
    pub(crate) pool: ReadPool<S::Read>,
    /// Shared by read handle acquisition, exclusive while compaction swaps files
    pub(crate) compaction: RwLock<()>,
    /// Data file generation; bumped by every compaction
    pub(crate) generation: AtomicU64,
    pub(crate) event_count: AtomicU64,
    pub(crate) delete_count: AtomicU64,
    state: RwLock<EngineState>,
}

impl<S: BackingStore> Shared<S> {
    fn new(store: S, config: EngineConfig) -> Self {
        Self {
            cache: RecordCache::new(config.cache.clone()),
            store,
            config,
            index: StreamIndex::new(),
            pool: ReadPool::new(),
            compaction: RwLock::new(()),
            generation: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
            delete_count: AtomicU64::new(0),
            state: RwLock::new(EngineState::Opening),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Fail unless the engine accepts operations
    pub(crate) fn check_open(&self) -> Result<()> {
        match &*self.state.read() {
            EngineState::Open => Ok(()),
            EngineState::Corrupted(reason) => Err(Error::EngineCorrupted(reason.clone())),
            EngineState::Disposing | EngineState::Closed => Err(Error::Closed),
            EngineState::Opening => Err(Error::internal("engine is still opening")),
        }
    }

    /// Move to the terminal corrupted state, keeping the first reason
    pub(crate) fn mark_corrupted(&self, reason: &str) {
        let mut state = self.state.write();
        if !matches!(*state, EngineState::Corrupted(_) | EngineState::Closed) {
            error!("Engine corrupted: {}", reason);
            *state = EngineState::Corrupted(reason.to_string());
        }
    }

    pub(crate) fn corruption(&self) -> Option<String> {
        match &*self.state.read() {
            EngineState::Corrupted(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Garbage exceeds a quarter of all records
    pub(crate) fn needs_compaction(&self) -> bool {
        let deletes = self.delete_count.load(Ordering::Relaxed);
        let events = self.event_count.load(Ordering::Relaxed);
        deletes > 0 && deletes > events / 4
    }
}

/// Append-only event storage engine.
///
/// Writes go through a single background writer and become visible to
/// readers once durable. Dropping the engine disposes it.
pub struct Engine<S: BackingStore = FileStore> {
    shared: Arc<Shared<S>>,
    tx: Sender<Command>,
    writer: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Engine<FileStore> {
    /// Open (or create) the engine in `config.data_dir`
    pub fn open(config: EngineConfig) -> Result<Self> {
        let store = FileStore::new(&config.data_dir)?;
        Self::open_with_store(config, store)
    }
}

impl<S: BackingStore> Engine<S> {
    /// Open the engine on top of an arbitrary backing store
    pub fn open_with_store(config: EngineConfig, store: S) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(store, config));

        shared.store.delete_if_exists(DATA_STAGED)?;
        shared.store.delete_if_exists(OFFSETS_STAGED)?;
        let mut file = shared.store.open_append(DATA_FILE)?;
        recover(&shared, &mut file)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = Writer::new(Arc::clone(&shared), file, rx);
        let handle = thread::Builder::new()
            .name("quill-writer".into())
            .spawn(move || writer.run())
            .map_err(|e| Error::internal(format!("failed to spawn writer thread: {e}")))?;

        *shared.state.write() = EngineState::Open;
        info!(
            "Opened engine ({} streams, {} records, {} garbage)",
            shared.index.len(),
            shared.event_count.load(Ordering::Relaxed),
            shared.delete_count.load(Ordering::Relaxed)
        );

        Ok(Self {
            shared,
            tx,
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Queue a write. The returned handle resolves once it is durable.
    ///
    /// Fails immediately if the engine is not open. The payload of a
    /// `Delete` is ignored.
    pub fn enqueue(
        &self,
        stream_id: impl Into<String>,
        state: RecordState,
        metadata: Document,
        payload: Document,
    ) -> Result<PendingWrite> {
        self.shared.check_open()?;
        let (done, pending) = PendingWrite::channel();
        self.tx
            .send(Command::Write(WriteRequest {
                stream_id: stream_id.into(),
                state,
                metadata,
                payload,
                done,
            }))
            .map_err(|_| Error::Closed)?;
        Ok(pending)
    }

    /// Newest-first reader over `stream_id`, or `None` if the stream has no
    /// live records
    pub fn read(&self, stream_id: &str) -> Result<Option<StreamReader<S>>> {
        self.shared.check_open()?;

        let _shared_section = self.shared.compaction.read();
        let Some(entry) = self.shared.index.get(stream_id) else {
            return Ok(None);
        };
        if !entry.is_live() {
            return Ok(None);
        }

        let generation = self.shared.generation();
        let handle = match self.shared.pool.take(generation) {
            Some(handle) => handle,
            None => self.shared.store.open_read(DATA_FILE)?,
        };
        Ok(Some(StreamReader::new(
            Arc::clone(&self.shared),
            handle,
            generation,
            entry.last_position,
        )))
    }

    /// Rewrite the data file without garbage. Blocks until done; do not call
    /// from inside an async runtime.
    pub fn compact(&self) -> Result<()> {
        self.shared.check_open()?;
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Command::Compact(reply))
            .map_err(|_| Error::Closed)?;
        done.blocking_recv().unwrap_or(Err(Error::Closed))
    }

    /// Records written since the data file was last compacted
    pub fn event_count(&self) -> u64 {
        self.shared.event_count.load(Ordering::Relaxed)
    }

    /// Records made unreachable by tombstones
    pub fn delete_count(&self) -> u64 {
        self.shared.delete_count.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.read().clone()
    }

    pub fn cache_stats(&self) -> CacheSnapshot {
        self.shared.cache.snapshot()
    }

    /// Physical name of the live data file version
    pub fn data_file(&self) -> Result<String> {
        self.shared.store.latest_physical_name(DATA_FILE)
    }

    /// Number of indexed streams, tombstoned ones included
    pub fn stream_count(&self) -> usize {
        self.shared.index.len()
    }

    /// Stop the writer after it has processed everything queued so far and
    /// release every resource. Idempotent; reports every teardown failure.
    pub fn dispose(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            if matches!(*state, EngineState::Disposing | EngineState::Closed) {
                return Ok(());
            }
            *state = EngineState::Disposing;
        }
        info!("Disposing engine");

        let mut errors = ErrorAggregator::new();
        if let Some(handle) = self.writer.lock().take() {
            // The writer may already have stopped after a failure
            let _ = self.tx.send(Command::Shutdown);
            match handle.join() {
                Ok(result) => errors.execute(|| result),
                Err(_) => errors.push(Error::internal("writer thread panicked")),
            }
        }
        self.shared.pool.clear();
        self.shared.cache.clear();

        *self.shared.state.write() = EngineState::Closed;
        errors.into_result()
    }
}

impl<S: BackingStore> Drop for Engine<S> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("Errors while closing engine: {}", e);
        }
    }
}

/// Rebuild the index from the data file, starting at the offset snapshot
/// when it matches. A torn trailing record is cut off if recovery is allowed.
fn recover<S: BackingStore>(shared: &Shared<S>, file: &mut S::Append) -> Result<()> {
    let data_version = shared.store.latest_physical_name(DATA_FILE)?;
    let file_len = file.position();

    let mut offset = 0u64;
    if let Some(snapshot) = offsets::load(&shared.store, &data_version, file_len) {
        offset = u64::try_from(snapshot.write_offset).unwrap_or_default();
        shared.index.replace(snapshot.entries.into_iter().collect());
        shared
            .event_count
            .store(shared.index.live_records(), Ordering::Relaxed);
    }
    let scan_start = offset;

    let mut reader = shared.store.open_read(DATA_FILE)?;
    reader.seek(SeekFrom::Start(offset))?;

    let mut parsed = 0u64;
    let mut garbage = 0u64;
    let torn = loop {
        let position = i64::try_from(offset)
            .map_err(|_| Error::corrupt(offset, "offset exceeds i64"))?;
        match record::decode(&mut reader) {
            Ok((record, size)) => {
                garbage += shared.index.apply(&record.stream_id, record.state, position);
                parsed += 1;
                offset += size as u64;
            }
            Err(DecodeError::EndOfFile) => break None,
            Err(DecodeError::Torn(reason)) => break Some(reason),
            Err(DecodeError::Malformed(reason)) => return Err(Error::corrupt(offset, reason)),
            Err(DecodeError::Io(e)) => return Err(e.into()),
        }
    };
    drop(reader);

    if let Some(reason) = torn {
        if !shared.config.allow_recovery {
            return Err(Error::TornRecord { offset, reason });
        }
        warn!(
            "Truncating torn record in {} at offset {} ({}); {} bytes dropped",
            data_version,
            offset,
            reason,
            file_len - offset
        );
        file.truncate(offset)?;
    }

    shared.event_count.fetch_add(parsed, Ordering::Relaxed);
    shared.delete_count.store(garbage, Ordering::Relaxed);
    info!(
        "Recovered {} from offset {}: {} records scanned, {} streams",
        data_version,
        scan_start,
        parsed,
        shared.index.len()
    );
    Ok(())
}
