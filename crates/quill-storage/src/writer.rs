//! Background writer
//!
//! One thread per engine owns the append handle and performs every index
//! mutation. Writes are appended as they arrive and made durable in groups:
//! - the batch is flushed as soon as the queue drains
//! - under sustained load it is flushed once `max_flush_wait` has passed
//!   since the previous flush, before more work is accepted
//!
//! A failed flush fails every write of the batch and leaves the engine
//! corrupted; the thread then rejects whatever is still queued and exits.

use crate::backing::{AppendFile, BackingStore};
use crate::cache::CacheKey;
use crate::compaction;
use crate::engine::{DATA_FILE, Shared};
use crate::index::fold;
use crate::offsets::{self, OffsetSnapshot};
use crate::record;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use quill_common::{
    Document, Error, Record, RecordState, Result, StreamIndexEntry,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Work sent to the writer thread
pub(crate) enum Command {
    Write(WriteRequest),
    Compact(oneshot::Sender<Result<()>>),
    Shutdown,
}

/// One enqueued write
pub(crate) struct WriteRequest {
    pub stream_id: String,
    pub state: RecordState,
    pub metadata: Document,
    pub payload: Document,
    pub done: oneshot::Sender<Result<()>>,
}

/// Appended but not yet durable write
struct Appended {
    key: String,
    entry: StreamIndexEntry,
    garbage: u64,
    done: oneshot::Sender<Result<()>>,
}

pub(crate) struct Writer<S: BackingStore> {
    pub(crate) shared: Arc<Shared<S>>,
    pub(crate) file: S::Append,
    rx: Receiver<Command>,
    /// Entries of the current batch, consulted before the index so writes
    /// to the same stream within one batch chain onto each other
    staged: HashMap<String, StreamIndexEntry>,
    batch: Vec<Appended>,
    buf: Vec<u8>,
    last_flush: Instant,
    writes_since_snapshot: u64,
    last_snapshot: Instant,
}

impl<S: BackingStore> Writer<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>, file: S::Append, rx: Receiver<Command>) -> Self {
        let now = Instant::now();
        Self {
            shared,
            file,
            rx,
            staged: HashMap::new(),
            batch: Vec::new(),
            buf: Vec::new(),
            last_flush: now,
            writes_since_snapshot: 0,
            last_snapshot: now,
        }
    }

    /// Thread body. Returns the error that stopped the writer, if any.
    pub(crate) fn run(mut self) -> Result<()> {
        info!("Writer thread started");
        let result = self.serve();
        match &result {
            Ok(()) => info!("Writer thread stopped"),
            Err(e) => {
                let reason = e.to_string();
                error!("Writer thread stopped: {}", reason);
                self.shared.mark_corrupted(&reason);
                self.fail_batch(&reason);
                self.reject_queued(&reason);
            }
        }
        result
    }

    fn serve(&mut self) -> Result<()> {
        let config = self.shared.config.clone();
        loop {
            if !self.batch.is_empty() && self.last_flush.elapsed() >= config.max_flush_wait {
                self.flush()?;
            }

            let command = match self.rx.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Disconnected) => Command::Shutdown,
                Err(TryRecvError::Empty) if !self.batch.is_empty() => {
                    self.flush()?;
                    continue;
                }
                Err(TryRecvError::Empty) if self.shared.needs_compaction() => {
                    match self.rx.recv_timeout(config.idle_time) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Disconnected) => Command::Shutdown,
                        Err(RecvTimeoutError::Timeout) => {
                            info!("Writer idle with garbage over threshold, compacting");
                            if let Err(e) = compaction::compact(self) {
                                if let Some(reason) = self.shared.corruption() {
                                    return Err(Error::EngineCorrupted(reason));
                                }
                                warn!("Idle compaction failed: {}", e);
                            }
                            continue;
                        }
                    }
                }
                Err(TryRecvError::Empty) => match self.rx.recv() {
                    Ok(command) => command,
                    Err(_) => Command::Shutdown,
                },
            };

            match command {
                Command::Write(request) => self.append(request)?,
                Command::Compact(reply) => {
                    let result = compaction::compact(self);
                    let corruption = self.shared.corruption();
                    let _ = reply.send(result);
                    if let Some(reason) = corruption {
                        return Err(Error::EngineCorrupted(reason));
                    }
                }
                Command::Shutdown => return self.close(),
            }
        }
    }

    fn append(&mut self, request: WriteRequest) -> Result<()> {
        let WriteRequest {
            stream_id,
            state,
            metadata,
            payload,
            done,
        } = request;

        let key = fold(&stream_id);
        let prior = self
            .staged
            .get(&key)
            .copied()
            .or_else(|| self.shared.index.get_folded(&key));
        let position = i64::try_from(self.file.position())
            .map_err(|_| Error::storage("data file offset exceeds i64"))?;
        let (entry, garbage) = StreamIndexEntry::advance(prior, state, position);

        let record = Record {
            stream_id,
            previous: StreamIndexEntry::chain_head(prior),
            stream_length: entry.stream_length,
            state,
            metadata,
            payload: match state {
                RecordState::Delete => Document::new(),
                _ => payload,
            },
        };

        self.buf.clear();
        if let Err(e) = record::encode_into(&record, &mut self.buf) {
            // Nothing was written; only this request fails
            let _ = done.send(Err(e));
            return Ok(());
        }
        if let Err(e) = self.file.append(&self.buf) {
            let reason = format!("append at offset {position} failed: {e}");
            let _ = done.send(Err(Error::FlushFailed(reason.clone())));
            return Err(Error::storage(reason));
        }

        self.shared
            .cache
            .set(CacheKey::new(self.shared.generation(), position), Arc::new(record));
        self.staged.insert(key.clone(), entry);
        self.batch.push(Appended {
            key,
            entry,
            garbage,
            done,
        });
        Ok(())
    }

    /// Make the batch durable, then publish it to the index and callers
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.shared.store.flush(&mut self.file) {
            let reason = e.to_string();
            error!(
                "Durable flush of {} writes failed: {}",
                self.batch.len(),
                reason
            );
            self.shared.mark_corrupted(&reason);
            self.fail_batch(&reason);
            return Err(Error::FlushFailed(reason));
        }
        self.last_flush = Instant::now();

        let count = self.batch.len() as u64;
        for appended in self.batch.drain(..) {
            self.shared.index.insert_folded(appended.key, appended.entry);
            self.shared.event_count.fetch_add(1, Ordering::Relaxed);
            self.shared
                .delete_count
                .fetch_add(appended.garbage, Ordering::Relaxed);
            let _ = appended.done.send(Ok(()));
        }
        self.staged.clear();
        self.writes_since_snapshot += count;
        debug!("Flushed {} writes up to offset {}", count, self.file.position());

        if self.snapshot_due() {
            if let Err(e) = self.write_offsets() {
                warn!("Failed to write offset snapshot: {}", e);
            }
        }
        Ok(())
    }

    fn snapshot_due(&self) -> bool {
        let config = &self.shared.config;
        self.writes_since_snapshot > config.writes_between_offset_snapshots
            || (self.writes_since_snapshot > 0
                && self.last_snapshot.elapsed() >= config.min_time_between_offset_snapshots)
    }

    /// Persist the index as of the current end of file. Only valid with an
    /// empty batch.
    pub(crate) fn write_offsets(&mut self) -> Result<()> {
        let snapshot = OffsetSnapshot {
            data_version: self.shared.store.latest_physical_name(DATA_FILE)?,
            write_offset: i64::try_from(self.file.position())
                .map_err(|_| Error::storage("data file offset exceeds i64"))?,
            entries: self.shared.index.entries(),
        };
        offsets::write(&self.shared.store, &snapshot)?;
        self.writes_since_snapshot = 0;
        self.last_snapshot = Instant::now();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.write_offsets()?;
        info!(
            "Writer closed at offset {} ({} streams)",
            self.file.position(),
            self.shared.index.len()
        );
        Ok(())
    }

    fn fail_batch(&mut self, reason: &str) {
        for appended in self.batch.drain(..) {
            let _ = appended.done.send(Err(Error::FlushFailed(reason.to_string())));
        }
        self.staged.clear();
    }

    /// Fail everything already queued; later sends see a closed channel
    fn reject_queued(&self, reason: &str) {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Write(request) => {
                    let _ = request
                        .done
                        .send(Err(Error::EngineCorrupted(reason.to_string())));
                }
                Command::Compact(reply) => {
                    let _ = reply.send(Err(Error::EngineCorrupted(reason.to_string())));
                }
                Command::Shutdown => {}
            }
        }
    }
}
