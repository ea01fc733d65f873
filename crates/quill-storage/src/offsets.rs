//! Offset snapshots
//!
//! A copy of the stream index tagged with the data file version and the
//! offset it covers. Restart loads it and only scans records appended after
//! that offset.
//!
//! Layout (little-endian):
//! ```text
//! u32 len | data file version name | i64 write offset
//! then until EOF: u32 len | stream id | i64 last position | i32 stream length
//! ```

use crate::backing::{AppendFile, BackingStore};
use quill_common::{Error, Result, StreamIndexEntry};
use std::io::Read;
use tracing::{debug, info, warn};

/// Logical name of the offset snapshot file
pub const OFFSETS_FILE: &str = "data.offsets";

/// Staging name used while writing a snapshot
pub const OFFSETS_STAGED: &str = "data.offsets.new";

/// Index state as of one offset in one data file version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetSnapshot {
    /// Physical name of the data file version this snapshot describes
    pub data_version: String,
    /// Offset up to which the index below is complete
    pub write_offset: i64,
    /// Folded stream id and entry
    pub entries: Vec<(String, StreamIndexEntry)>,
}

impl OffsetSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        put_str(&mut buf, &self.data_version)?;
        buf.extend_from_slice(&self.write_offset.to_le_bytes());
        for (stream_id, entry) in &self.entries {
            put_str(&mut buf, stream_id)?;
            buf.extend_from_slice(&entry.last_position.to_le_bytes());
            buf.extend_from_slice(&entry.stream_length.to_le_bytes());
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = Parser { bytes, pos: 0 };
        let data_version = parser.string()?;
        let write_offset = i64::from_le_bytes(parser.array()?);

        let mut entries = Vec::new();
        while !parser.is_done() {
            let stream_id = parser.string()?;
            let last_position = i64::from_le_bytes(parser.array()?);
            let stream_length = i32::from_le_bytes(parser.array()?);
            entries.push((
                stream_id,
                StreamIndexEntry {
                    last_position,
                    stream_length,
                },
            ));
        }

        Ok(Self {
            data_version,
            write_offset,
            entries,
        })
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u32::try_from(s.len())
        .map_err(|_| Error::Serialization(format!("string of {} bytes is too large", s.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn slice(&mut self, len: usize) -> Result<&[u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        let Some(end) = end else {
            return Err(Error::storage(format!(
                "offset snapshot ends at {} inside a {} byte field",
                self.bytes.len(),
                len
            )));
        };
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(N)?);
        Ok(out)
    }

    fn string(&mut self) -> Result<String> {
        let len = u32::from_le_bytes(self.array()?) as usize;
        let bytes = self.slice(len)?.to_vec();
        String::from_utf8(bytes)
            .map_err(|_| Error::storage("offset snapshot holds a non UTF-8 string"))
    }
}

/// Write `snapshot` as the next version of the offsets file and retire the
/// previous version
pub fn write<S: BackingStore>(store: &S, snapshot: &OffsetSnapshot) -> Result<()> {
    let bytes = snapshot.encode()?;
    let previous = if store.exists(OFFSETS_FILE)? {
        Some(store.latest_physical_name(OFFSETS_FILE)?)
    } else {
        None
    };

    let mut staged = store.create_staged(OFFSETS_STAGED)?;
    staged.append(&bytes)?;
    store.flush(&mut staged)?;
    drop(staged);

    let published = store.stage_and_publish(OFFSETS_STAGED, OFFSETS_FILE)?;
    if let Some(previous) = previous {
        store.delete_on_close(&previous)?;
    }
    debug!(
        "Wrote offset snapshot {} ({} streams at offset {})",
        published,
        snapshot.entries.len(),
        snapshot.write_offset
    );
    Ok(())
}

/// Load the latest offset snapshot if it describes `data_version` and lies
/// within `file_len`. Anything unusable is discarded with a warning.
pub fn load<S: BackingStore>(store: &S, data_version: &str, file_len: u64) -> Option<OffsetSnapshot> {
    let snapshot = match read_latest(store) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => return None,
        Err(e) => {
            warn!("Discarding unreadable offset snapshot: {}", e);
            return None;
        }
    };

    if snapshot.data_version != data_version {
        warn!(
            "Discarding offset snapshot for {} (data file is {})",
            snapshot.data_version, data_version
        );
        return None;
    }
    let within_file = u64::try_from(snapshot.write_offset).is_ok_and(|offset| offset <= file_len);
    if !within_file {
        warn!(
            "Discarding offset snapshot at offset {} beyond data file length {}",
            snapshot.write_offset, file_len
        );
        return None;
    }

    info!(
        "Loaded offset snapshot for {} ({} streams, offset {})",
        data_version,
        snapshot.entries.len(),
        snapshot.write_offset
    );
    Some(snapshot)
}

fn read_latest<S: BackingStore>(store: &S) -> Result<Option<OffsetSnapshot>> {
    if !store.exists(OFFSETS_FILE)? {
        return Ok(None);
    }
    let mut bytes = Vec::new();
    store.open_read(OFFSETS_FILE)?.read_to_end(&mut bytes)?;
    OffsetSnapshot::decode(&bytes).map(Some)
}
