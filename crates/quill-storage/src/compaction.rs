//! Online compaction
//!
//! Runs on the writer thread, so it never overlaps with appends. The live
//! part of the data file is copied into a staged file which then replaces
//! the current version:
//! 1. Flush buffered writes and create the staged file
//! 2. Scan once to find the last tombstone of every stream
//! 3. Scan again, copying each record that belongs to a live stream and
//!    follows that stream's last tombstone, with `previous` remapped
//! 4. Flush the staged file
//! 5. Under the exclusive compaction lock, publish it, reopen the append
//!    handle, retire the old version and swap in the remapped index
//!
//! Readers that started earlier keep their handle on the old version, which
//! is deleted once they are dropped.

use crate::backing::{AppendFile, BackingStore};
use crate::engine::{DATA_FILE, DATA_STAGED};
use crate::index::fold;
use crate::record::{self, DecodeError};
use crate::writer::Writer;
use quill_common::{Error, NOT_EXISTS, Record, RecordState, Result, StreamIndexEntry};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{info, warn};

/// Copy the live records into a new data file version
pub(crate) fn compact<S: BackingStore>(writer: &mut Writer<S>) -> Result<()> {
    let started = Instant::now();
    writer.flush()?;

    let shared = Arc::clone(&writer.shared);
    let store = &shared.store;
    let old_len = writer.file.position();

    store.delete_if_exists(DATA_STAGED)?;
    let (remap, copied) = match copy_live(writer) {
        Ok(result) => result,
        Err(e) => {
            if let Err(cleanup) = store.delete_if_exists(DATA_STAGED) {
                warn!("Failed to remove staged compaction file: {}", cleanup);
            }
            return Err(e);
        }
    };

    let _exclusive = shared.compaction.write();
    shared.pool.clear();
    let old = store.latest_physical_name(DATA_FILE)?;
    let published = store.stage_and_publish(DATA_STAGED, DATA_FILE)?;

    // From here on the old file is no longer the latest version; failing to
    // switch over leaves the engine unusable.
    let file = store.open_append(DATA_FILE).map_err(|e| {
        let reason = format!("failed to reopen {published} after compaction: {e}");
        shared.mark_corrupted(&reason);
        Error::EngineCorrupted(reason)
    })?;
    drop(std::mem::replace(&mut writer.file, file));

    if let Err(e) = store.delete_on_close(&old) {
        warn!("Failed to retire {}: {}", old, e);
    }

    shared.generation.fetch_add(1, Ordering::AcqRel);
    shared.pool.clear();
    shared.cache.clear();
    shared.index.replace(remap);
    shared.event_count.store(copied, Ordering::Relaxed);
    shared.delete_count.store(0, Ordering::Relaxed);

    if let Err(e) = writer.write_offsets() {
        warn!("Failed to write offset snapshot after compaction: {}", e);
    }

    info!(
        "Compacted {} into {}: {} -> {} bytes, {} records kept in {:?}",
        old,
        published,
        old_len,
        writer.file.position(),
        copied,
        started.elapsed()
    );
    Ok(())
}

/// Write the live records to the staged file. Returns the new index and the
/// number of records copied.
fn copy_live<S: BackingStore>(
    writer: &Writer<S>,
) -> Result<(HashMap<String, StreamIndexEntry>, u64)> {
    let shared = &writer.shared;
    let store = &shared.store;

    let mut last_delete: HashMap<String, u64> = HashMap::new();
    scan(store.open_read(DATA_FILE)?, |offset, record| {
        if record.state == RecordState::Delete {
            last_delete.insert(fold(&record.stream_id), offset);
        }
        Ok(())
    })?;

    let mut staged = store.create_staged(DATA_STAGED)?;
    let mut remap: HashMap<String, StreamIndexEntry> = HashMap::new();
    let mut copied = 0u64;
    let mut buf = Vec::new();

    scan(store.open_read(DATA_FILE)?, |offset, mut record| {
        let key = fold(&record.stream_id);
        if !shared.index.get_folded(&key).is_some_and(|e| e.is_live()) {
            return Ok(());
        }
        if last_delete.get(&key).is_some_and(|deleted_at| *deleted_at >= offset) {
            return Ok(());
        }

        let prior = remap.get(&key).copied();
        let position = i64::try_from(staged.position())
            .map_err(|_| Error::storage("staged file offset exceeds i64"))?;
        record.previous = prior.map_or(NOT_EXISTS, |e| e.last_position);
        record.stream_length = prior.map_or(0, |e| e.stream_length) + 1;

        buf.clear();
        record::encode_into(&record, &mut buf)?;
        staged.append(&buf)?;
        remap.insert(key, StreamIndexEntry::at(position, record.stream_length));
        copied += 1;
        Ok(())
    })?;

    store.flush(&mut staged)?;
    Ok((remap, copied))
}

/// Decode every record of `reader` in order. The data file was fully
/// flushed, so anything but a clean end is corruption.
fn scan<R: Read>(
    mut reader: R,
    mut visit: impl FnMut(u64, Record) -> Result<()>,
) -> Result<()> {
    let mut offset = 0u64;
    loop {
        match record::decode(&mut reader) {
            Ok((record, size)) => {
                visit(offset, record)?;
                offset += size as u64;
            }
            Err(DecodeError::EndOfFile) => return Ok(()),
            Err(DecodeError::Io(e)) => return Err(e.into()),
            Err(DecodeError::Torn(reason) | DecodeError::Malformed(reason)) => {
                return Err(Error::corrupt(offset, reason));
            }
        }
    }
}
