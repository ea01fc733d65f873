//! On-disk record codec
//!
//! Record format (little-endian, no padding):
//! ```text
//! +--------+-----------+----------+--------+-------+--------+----------+--------+---------+
//! | id len | stream id | previous | length | state | md len | metadata | pl len | payload |
//! | 4B     | var       | 8B       | 4B     | 4B    | 4B     | JSON     | 4B     | JSON    |
//! +--------+-----------+----------+--------+-------+--------+----------+--------+---------+
//! ```
//!
//! Decoding tells apart a clean end of file, a torn trailing record (the
//! file ends inside a record) and a format violation.

use quill_common::{Document, Record, RecordState};
use std::io::{self, Read};
use thiserror::Error;

/// Fixed-size part of a record: four length prefixes plus previous,
/// stream length and state
const FIXED_SIZE: usize = 4 + 8 + 4 + 4 + 4 + 4;

/// Why a record could not be decoded
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No bytes left at a record boundary
    #[error("end of file")]
    EndOfFile,
    /// The file ends inside a record
    #[error("torn record: {0}")]
    Torn(String),
    /// The bytes violate the record format
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

/// Serialize `record` onto the end of `buf`, returning the encoded size
pub fn encode_into(record: &Record, buf: &mut Vec<u8>) -> quill_common::Result<usize> {
    let metadata = encode_document(&record.metadata)?;
    let payload = encode_document(&record.payload)?;
    let id = record.stream_id.as_bytes();

    let start = buf.len();
    buf.reserve(FIXED_SIZE + id.len() + metadata.len() + payload.len());
    put_bytes(buf, id)?;
    buf.extend_from_slice(&record.previous.to_le_bytes());
    buf.extend_from_slice(&record.stream_length.to_le_bytes());
    buf.extend_from_slice(&record.state.as_i32().to_le_bytes());
    put_bytes(buf, &metadata)?;
    put_bytes(buf, &payload)?;
    Ok(buf.len() - start)
}

/// Serialize `record` into a fresh buffer
pub fn encode(record: &Record) -> quill_common::Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(record, &mut buf)?;
    Ok(buf)
}

fn encode_document(doc: &Document) -> quill_common::Result<Vec<u8>> {
    serde_json::to_vec(doc).map_err(|e| quill_common::Error::Serialization(e.to_string()))
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> quill_common::Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        quill_common::Error::Serialization(format!("field of {} bytes is too large", bytes.len()))
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Decode one record from `reader`, returning it with its encoded size
pub fn decode(reader: &mut impl Read) -> Result<(Record, usize), DecodeError> {
    let mut len_buf = [0u8; 4];
    match fill(reader, &mut len_buf)? {
        0 => return Err(DecodeError::EndOfFile),
        4 => {}
        n => return Err(DecodeError::Torn(format!("{n} of 4 bytes of stream id length"))),
    }
    let id_bytes = take(reader, u32::from_le_bytes(len_buf), "stream id")?;
    let stream_id = String::from_utf8(id_bytes)
        .map_err(|_| DecodeError::Malformed("stream id is not valid UTF-8".into()))?;

    let mut fixed = [0u8; 16];
    let n = fill(reader, &mut fixed)?;
    if n < fixed.len() {
        return Err(DecodeError::Torn(format!("{n} of 16 header bytes")));
    }
    let previous = i64::from_le_bytes(fixed[0..8].try_into().unwrap_or_default());
    let stream_length = i32::from_le_bytes(fixed[8..12].try_into().unwrap_or_default());
    let tag = i32::from_le_bytes(fixed[12..16].try_into().unwrap_or_default());
    let state = RecordState::from_i32(tag)
        .ok_or_else(|| DecodeError::Malformed(format!("unknown record state {tag}")))?;

    let (metadata, metadata_len) = read_document(reader, "metadata")?;
    let (payload, payload_len) = read_document(reader, "payload")?;

    let size = FIXED_SIZE + stream_id.len() + metadata_len + payload_len;
    Ok((
        Record {
            stream_id,
            previous,
            stream_length,
            state,
            metadata,
            payload,
        },
        size,
    ))
}

fn read_document(reader: &mut impl Read, field: &str) -> Result<(Document, usize), DecodeError> {
    let mut len_buf = [0u8; 4];
    let n = fill(reader, &mut len_buf)?;
    if n < 4 {
        return Err(DecodeError::Torn(format!("{n} of 4 bytes of {field} length")));
    }
    let bytes = take(reader, u32::from_le_bytes(len_buf), field)?;
    let doc = serde_json::from_slice(&bytes)
        .map_err(|e| DecodeError::Malformed(format!("{field} is not a document: {e}")))?;
    Ok((doc, bytes.len()))
}

/// Read exactly `len` bytes without trusting `len` for the allocation
fn take(reader: &mut impl Read, len: u32, field: &str) -> Result<Vec<u8>, DecodeError> {
    let mut bytes = Vec::new();
    reader.take(u64::from(len)).read_to_end(&mut bytes)?;
    if bytes.len() < len as usize {
        return Err(DecodeError::Torn(format!(
            "{} of {} bytes of {}",
            bytes.len(),
            len,
            field
        )));
    }
    Ok(bytes)
}

/// Read until `buf` is full or the reader is exhausted
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
