//! Manifest record framing
//!
//! Each record is one changeset:
//! `[u32 len][u32 crc32(len)][u32 crc32(payload)][bincode payload]`,
//! little-endian. The length carries its own checksum, so a damaged length
//! is told apart from a record cut short by a crash.

use crate::{LodeError, Result};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Length, length checksum and payload checksum
pub(crate) const RECORD_HEADER_SIZE: usize = 12;
/// Largest changeset payload accepted
pub(crate) const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// A single change to the durable file set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestChange {
    /// Table `id` became live in `level`
    CreateTable { id: u64, level: usize },
    /// Table `id` is no longer live
    DeleteTable { id: u64 },
    /// Value log segment `fid` was reclaimed and must not be read again
    DeleteValueLog { fid: u64 },
    /// Lowest ids that may still be handed out
    Watermark { next_table_id: u64, next_vlog_fid: u64 },
}

/// Frame a changeset
pub(crate) fn encode(changes: &[ManifestChange]) -> Result<BytesMut> {
    let payload = bincode::serialize(changes)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(LodeError::Manifest(format!(
            "changeset of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
    buf.put_slice(&len);
    buf.put_u32_le(crc32fast::hash(&len));
    buf.put_u32_le(crc32fast::hash(&payload));
    buf.put_slice(&payload);
    Ok(buf)
}

/// Outcome of decoding the record at the front of a buffer
#[derive(Debug)]
pub(crate) enum Decoded {
    /// A valid changeset spanning `len` bytes
    Record { changes: Vec<ManifestChange>, len: usize },
    /// The buffer ends inside this record
    Truncated,
    /// The length field is damaged; nothing after it can be located
    BadHeader,
    /// The payload fails its checksum; the record spans `len` bytes
    BadChecksum { expected: u32, actual: u32, len: usize },
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

pub(crate) fn decode(data: &[u8]) -> Result<Decoded> {
    if data.len() < RECORD_HEADER_SIZE {
        return Ok(Decoded::Truncated);
    }
    let payload_len = read_u32(data, 0) as usize;
    if crc32fast::hash(&data[..4]) != read_u32(data, 4) || payload_len > MAX_PAYLOAD_SIZE {
        return Ok(Decoded::BadHeader);
    }
    let expected = read_u32(data, 8);
    let len = RECORD_HEADER_SIZE + payload_len;
    if data.len() < len {
        return Ok(Decoded::Truncated);
    }

    let payload = &data[RECORD_HEADER_SIZE..len];
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Ok(Decoded::BadChecksum {
            expected,
            actual,
            len,
        });
    }
    let changes: Vec<ManifestChange> = bincode::deserialize(payload).map_err(|e| {
        LodeError::Corruption(format!("undecodable manifest changeset: {}", e))
    })?;
    Ok(Decoded::Record { changes, len })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_framing() {
        let changes = vec![
            ManifestChange::CreateTable { id: 7, level: 0 },
            ManifestChange::DeleteTable { id: 3 },
        ];
        let buf = encode(&changes).unwrap();

        match decode(&buf).unwrap() {
            Decoded::Record { changes: got, len } => {
                assert_eq!(got, changes);
                assert_eq!(len, buf.len());
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            decode(&buf[..buf.len() - 1]).unwrap(),
            Decoded::Truncated
        ));

        let mut flipped = buf.to_vec();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert!(matches!(
            decode(&flipped).unwrap(),
            Decoded::BadChecksum { .. }
        ));
    }

    #[test]
    fn test_damaged_length_is_not_a_short_record() {
        let buf = encode(&[ManifestChange::CreateTable { id: 1, level: 0 }]).unwrap();

        // A length pointing past the end of the buffer must not read as torn
        let mut grown = buf.to_vec();
        grown[3] ^= 0x10;
        assert!(matches!(decode(&grown).unwrap(), Decoded::BadHeader));

        let mut shrunk = buf.to_vec();
        shrunk[0] ^= 0x01;
        assert!(matches!(decode(&shrunk).unwrap(), Decoded::BadHeader));

        // Only a short header stays ambiguous
        assert!(matches!(
            decode(&buf[..RECORD_HEADER_SIZE - 1]).unwrap(),
            Decoded::Truncated
        ));
    }
}
