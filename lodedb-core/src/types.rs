//! Core types for LodeDB

use crate::{LodeError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Entry is a tombstone
pub const BIT_DELETE: u8 = 1 << 0;
/// Entry value holds an encoded [`ValuePointer`] instead of the raw bytes
pub const BIT_VALUE_POINTER: u8 = 1 << 1;

/// Keys beginning with this prefix belong to the engine
pub const RESERVED_PREFIX: &[u8] = b"!lodedb!";

/// Reserved key holding the value log head pointer
pub const HEAD_KEY: &[u8] = b"!lodedb!head";

/// Check whether a key lies in the engine's reserved keyspace
pub fn is_reserved_key(key: &[u8]) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// A single mutation submitted to the write path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// User key
    pub key: Bytes,
    /// Raw value; empty for tombstones
    pub value: Bytes,
    /// Meta bits; writes accept only `BIT_DELETE`
    pub meta: u8,
}

impl Entry {
    /// Create a put entry
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            meta: 0,
        }
    }

    /// Create a tombstone for `key`
    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Bytes::new(),
            meta: BIT_DELETE,
        }
    }

    /// Whether this entry deletes its key
    pub fn is_delete(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len() + 1
    }
}

/// Stored form of a value inside memtables and sorted tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueStruct {
    pub meta: u8,
    /// Raw value, or the encoded pointer when `BIT_VALUE_POINTER` is set
    pub value: Bytes,
}

impl ValueStruct {
    pub fn new(meta: u8, value: Bytes) -> Self {
        Self { meta, value }
    }

    pub fn tombstone() -> Self {
        Self {
            meta: BIT_DELETE,
            value: Bytes::new(),
        }
    }

    pub fn pointer(ptr: &ValuePointer) -> Self {
        Self {
            meta: BIT_VALUE_POINTER,
            value: ptr.encode(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    pub fn is_pointer(&self) -> bool {
        self.meta & BIT_VALUE_POINTER != 0
    }

    /// Decode the value pointer, if this value lives in the value log
    pub fn value_pointer(&self) -> Result<Option<ValuePointer>> {
        if !self.is_pointer() || self.is_delete() {
            return Ok(None);
        }
        ValuePointer::decode(&self.value).map(Some)
    }

    /// Approximate memory footprint
    pub fn size(&self) -> usize {
        1 + self.value.len()
    }
}

/// Location of a record inside the value log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValuePointer {
    /// Segment file id
    pub fid: u64,
    /// Byte offset of the record within the segment
    pub offset: u64,
    /// Total record length, header and checksum included
    pub len: u32,
}

impl ValuePointer {
    /// Encoded size in bytes
    pub const SIZE: usize = 20;

    pub fn new(fid: u64, offset: u64, len: u32) -> Self {
        Self { fid, offset, len }
    }

    /// Whether this is the zero pointer (nothing written yet)
    pub fn is_zero(&self) -> bool {
        self.fid == 0 && self.offset == 0 && self.len == 0
    }

    /// Offset just past the record
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }

    /// Fixed-width big-endian encoding
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64(self.fid);
        buf.put_u64(self.offset);
        buf.put_u32(self.len);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(LodeError::InvalidFormat(format!(
                "value pointer must be {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }
        let mut cursor = data;
        Ok(Self {
            fid: cursor.get_u64(),
            offset: cursor.get_u64(),
            len: cursor.get_u32(),
        })
    }
}

impl fmt::Display for ValuePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.fid, self.offset, self.len)
    }
}

/// A key-value pair produced by iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvItem {
    pub key: Bytes,
    pub value: Bytes,
}

impl KvItem {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}
