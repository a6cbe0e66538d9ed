//! SSTable data block implementation

use crate::{LodeError, Result, ValueStruct};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes preceding the payload: flags, entry count, payload length
const BLOCK_HEADER_SIZE: usize = 9;
const CHECKSUM_SIZE: usize = 4;

const FLAG_LZ4: u8 = 1;

/// A decoded data block: sorted key → value-struct pairs
#[derive(Debug, Default)]
pub struct Block {
    entries: Vec<(Bytes, ValueStruct)>,
}

impl Block {
    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `idx`
    pub fn entry(&self, idx: usize) -> Option<&(Bytes, ValueStruct)> {
        self.entries.get(idx)
    }

    /// Index of the first entry with key >= `key`
    pub fn seek(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|(k, _)| k.as_ref() < key)
    }

    /// Exact lookup
    pub fn get(&self, key: &[u8]) -> Option<&ValueStruct> {
        self.entries
            .binary_search_by(|(k, _)| k.as_ref().cmp(key))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    /// Deserialize from bytes, validating the checksum
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BLOCK_HEADER_SIZE + CHECKSUM_SIZE {
            return Err(LodeError::InvalidFormat("Block too short".into()));
        }

        let checksum_pos = data.len() - CHECKSUM_SIZE;
        let expected_checksum = (&data[checksum_pos..]).get_u32_le();
        let actual_checksum = crc32fast::hash(&data[..checksum_pos]);
        if expected_checksum != actual_checksum {
            return Err(LodeError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        let mut cursor = &data[..checksum_pos];
        let flags = cursor.get_u8();
        let count = cursor.get_u32_le() as usize;
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.len() != payload_len {
            return Err(LodeError::Corruption(format!(
                "block payload length {} does not match {} stored bytes",
                payload_len,
                cursor.len()
            )));
        }

        let payload = if flags & FLAG_LZ4 != 0 {
            Bytes::from(
                lz4_flex::decompress_size_prepended(cursor)
                    .map_err(|e| LodeError::Compression(e.to_string()))?,
            )
        } else {
            Bytes::copy_from_slice(cursor)
        };

        let mut entries = Vec::with_capacity(count);
        let mut buf = payload.clone();
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(LodeError::Corruption("truncated block entry".into()));
            }
            let key_len = buf.get_u32_le() as usize;
            if buf.remaining() < key_len + 5 {
                return Err(LodeError::Corruption("truncated block key".into()));
            }
            let key = buf.split_to(key_len);
            let meta = buf.get_u8();
            let value_len = buf.get_u32_le() as usize;
            if buf.remaining() < value_len {
                return Err(LodeError::Corruption("truncated block value".into()));
            }
            let value = buf.split_to(value_len);
            entries.push((key, ValueStruct::new(meta, value)));
        }

        Ok(Self { entries })
    }
}

/// Block builder for writing data
pub struct BlockBuilder {
    buf: BytesMut,
    count: u32,
    first_key: Option<Bytes>,
    last_key: Option<Bytes>,
}

impl BlockBuilder {
    /// Create a new block builder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            count: 0,
            first_key: None,
            last_key: None,
        }
    }

    /// Add an entry; keys must arrive in ascending order
    pub fn add(&mut self, key: &[u8], value: &ValueStruct) {
        debug_assert!(self.last_key.as_deref().map_or(true, |last| last < key));
        self.buf.put_u32_le(key.len() as u32);
        self.buf.put_slice(key);
        self.buf.put_u8(value.meta);
        self.buf.put_u32_le(value.value.len() as u32);
        self.buf.put_slice(&value.value);
        self.count += 1;
        let key = Bytes::copy_from_slice(key);
        if self.first_key.is_none() {
            self.first_key = Some(key.clone());
        }
        self.last_key = Some(key);
    }

    /// Check if block has data
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Uncompressed payload size
    pub fn estimated_size(&self) -> usize {
        self.buf.len() + BLOCK_HEADER_SIZE + CHECKSUM_SIZE
    }

    /// Serialize the block and return it with its first and last keys
    pub fn finish(self, compress: bool) -> (Bytes, Bytes, Bytes) {
        let (flags, payload) = if compress {
            (FLAG_LZ4, lz4_flex::compress_prepend_size(&self.buf))
        } else {
            (0, self.buf.to_vec())
        };

        let mut out = BytesMut::with_capacity(BLOCK_HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
        out.put_u8(flags);
        out.put_u32_le(self.count);
        out.put_u32_le(payload.len() as u32);
        out.put_slice(&payload);
        let checksum = crc32fast::hash(&out);
        out.put_u32_le(checksum);

        (
            out.freeze(),
            self.first_key.unwrap_or_default(),
            self.last_key.unwrap_or_default(),
        )
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}
