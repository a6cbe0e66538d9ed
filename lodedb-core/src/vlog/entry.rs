//! Value log record format
//!
//! Format:
//! - 4 bytes: CRC32 over everything that follows
//! - 4 bytes: key length
//! - 4 bytes: value length
//! - 1 byte: meta
//! - N bytes: key
//! - N bytes: value
//!
//! All integers are little-endian. The high meta bit marks the last record
//! of a write batch so replay can drop a batch cut short by a crash.

use crate::{Entry, LodeError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed header size
pub(crate) const HEADER_SIZE: usize = 13;

/// Set on the final record of a batch; never stored outside the log
pub(crate) const BIT_BATCH_END: u8 = 1 << 7;

/// Parsed fixed-size header
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordHeader {
    pub checksum: u32,
    pub key_len: u32,
    pub value_len: u32,
    pub meta: u8,
}

impl RecordHeader {
    pub fn parse(mut data: &[u8]) -> Self {
        debug_assert!(data.len() >= HEADER_SIZE);
        Self {
            checksum: data.get_u32_le(),
            key_len: data.get_u32_le(),
            value_len: data.get_u32_le(),
            meta: data.get_u8(),
        }
    }

    /// Size of the whole record
    pub fn record_len(&self) -> u64 {
        HEADER_SIZE as u64 + self.key_len as u64 + self.value_len as u64
    }
}

/// Append the encoding of `entry` to `buf` and return its length
pub(crate) fn encode(entry: &Entry, batch_end: bool, buf: &mut BytesMut) -> u32 {
    let start = buf.len();
    let meta = if batch_end {
        entry.meta | BIT_BATCH_END
    } else {
        entry.meta
    };

    buf.put_u32_le(0);
    buf.put_u32_le(entry.key.len() as u32);
    buf.put_u32_le(entry.value.len() as u32);
    buf.put_u8(meta);
    buf.put_slice(&entry.key);
    buf.put_slice(&entry.value);

    let checksum = crc32fast::hash(&buf[start + 4..]);
    buf[start..start + 4].copy_from_slice(&checksum.to_le_bytes());
    (buf.len() - start) as u32
}

/// Decode one complete record, verifying its checksum.
///
/// Returns the entry and whether it closes its batch.
pub(crate) fn decode(data: &[u8]) -> Result<(Entry, bool)> {
    if data.len() < HEADER_SIZE {
        return Err(LodeError::Corruption(format!(
            "value log record of {} bytes is shorter than its header",
            data.len()
        )));
    }
    let header = RecordHeader::parse(data);
    if header.record_len() != data.len() as u64 {
        return Err(LodeError::Corruption(format!(
            "value log record claims {} bytes but {} were read",
            header.record_len(),
            data.len()
        )));
    }
    let actual = crc32fast::hash(&data[4..]);
    if actual != header.checksum {
        return Err(LodeError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }

    let key_end = HEADER_SIZE + header.key_len as usize;
    let entry = Entry {
        key: Bytes::copy_from_slice(&data[HEADER_SIZE..key_end]),
        value: Bytes::copy_from_slice(&data[key_end..]),
        meta: header.meta & !BIT_BATCH_END,
    };
    Ok((entry, header.meta & BIT_BATCH_END != 0))
}
