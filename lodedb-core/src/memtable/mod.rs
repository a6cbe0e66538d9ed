//! MemTable implementation using a concurrent skip list
//!
//! The MemTable is an in-memory data structure that stores recent writes
//! in sorted order, allowing for fast writes and efficient range scans.
//!
//! Every batch is applied under a single sequence number. Readers carry the
//! sequence that was visible when they took their snapshot and ignore newer
//! versions, so a batch becomes visible all at once.

use crate::iterator::{Cursor, EMPTY_VALUE};
use crate::{Result, ValuePointer, ValueStruct};
use bytes::Bytes;
use crossbeam_skiplist::map::Entry as MapEntry;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Per-entry bookkeeping overhead used for size accounting
const ENTRY_OVERHEAD: usize = 16;

/// Key for MemTable entries (user key + batch sequence)
///
/// Ordered by key ascending, then sequence descending, so the newest
/// version of a key comes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemTableKey {
    pub key: Bytes,
    pub seq: u64,
}

impl MemTableKey {
    /// Create a new MemTable key
    pub fn new(key: Bytes, seq: u64) -> Self {
        Self { key, seq }
    }

    fn seek(key: &[u8], seq: u64) -> Self {
        Self {
            key: Bytes::copy_from_slice(key),
            seq,
        }
    }
}

impl Ord for MemTableKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for MemTableKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// MemTable for in-memory writes
pub struct MemTable {
    data: SkipMap<MemTableKey, ValueStruct>,
    /// Approximate size in bytes
    size_bytes: AtomicUsize,
    /// Last value log record applied; becomes the head pointer once flushed
    head: Mutex<ValuePointer>,
    /// Creation time, reported in flush logs
    created_at: Instant,
    /// Unique ID for this memtable
    id: u64,
}

impl MemTable {
    /// Create a new MemTable
    pub fn new(id: u64) -> Self {
        Self {
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            head: Mutex::new(ValuePointer::default()),
            created_at: Instant::now(),
            id,
        }
    }

    /// Get the MemTable ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size a batch would add to the table
    pub fn batch_size(entries: &[(Bytes, ValueStruct)]) -> usize {
        entries
            .iter()
            .map(|(k, v)| k.len() + v.size() + ENTRY_OVERHEAD)
            .sum()
    }

    /// Insert a batch under one sequence number.
    ///
    /// `head` is the last value log record backing the batch, if any.
    pub fn insert_batch(
        &self,
        entries: &[(Bytes, ValueStruct)],
        seq: u64,
        head: Option<ValuePointer>,
    ) {
        for (key, value) in entries {
            self.data
                .insert(MemTableKey::new(key.clone(), seq), value.clone());
        }
        self.size_bytes
            .fetch_add(Self::batch_size(entries), Ordering::Relaxed);
        if let Some(ptr) = head {
            let mut current = self.head.lock();
            if ptr > *current {
                *current = ptr;
            }
        }
    }

    /// Newest version of `key` visible at `read_seq`
    pub fn get(&self, key: &[u8], read_seq: u64) -> Option<ValueStruct> {
        let target = MemTableKey::seek(key, read_seq);
        let entry = self.data.lower_bound(Bound::Included(&target))?;
        if entry.key().key.as_ref() == key {
            Some(entry.value().clone())
        } else {
            None
        }
    }

    /// Check if adding `extra` bytes would take the table past `size_limit`
    pub fn would_exceed(&self, extra: usize, size_limit: usize) -> bool {
        let size = self.size();
        size > 0 && size + extra > size_limit
    }

    /// Check if the MemTable should be flushed
    pub fn should_flush(&self, size_limit: usize) -> bool {
        self.size() >= size_limit
    }

    /// Get the current size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Last value log record applied to this table
    pub fn head(&self) -> ValuePointer {
        *self.head.lock()
    }

    /// Get the age since creation
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Number of stored versions
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Cursor over the newest visible version of each key in a memtable
pub struct MemTableCursor {
    table: std::sync::Arc<MemTable>,
    read_seq: u64,
    reverse: bool,
    current: Option<(Bytes, ValueStruct)>,
}

impl MemTableCursor {
    /// Position a cursor at the first key (last key when `reverse`)
    pub fn new(table: std::sync::Arc<MemTable>, read_seq: u64, reverse: bool) -> Self {
        let mut cursor = Self {
            table,
            read_seq,
            reverse,
            current: None,
        };
        cursor.current = if reverse {
            let start = cursor.table.data.back();
            cursor.visible_backward(start)
        } else {
            let start = cursor.table.data.front();
            cursor.visible_forward(start)
        };
        cursor
    }

    fn visible_forward(
        &self,
        mut entry: Option<MapEntry<'_, MemTableKey, ValueStruct>>,
    ) -> Option<(Bytes, ValueStruct)> {
        while let Some(e) = entry {
            if e.key().seq <= self.read_seq {
                return Some((e.key().key.clone(), e.value().clone()));
            }
            entry = e.next();
        }
        None
    }

    /// `entry` is the oldest version of some key; walk back to the nearest
    /// key with a visible version.
    fn visible_backward<'a>(
        &'a self,
        mut entry: Option<MapEntry<'a, MemTableKey, ValueStruct>>,
    ) -> Option<(Bytes, ValueStruct)> {
        while let Some(e) = entry {
            let key = e.key().key.clone();
            let target = MemTableKey::new(key.clone(), self.read_seq);
            if let Some(found) = self.table.data.lower_bound(Bound::Included(&target)) {
                if found.key().key == key {
                    return Some((key, found.value().clone()));
                }
            }
            let before = MemTableKey::new(key, u64::MAX);
            entry = self.table.data.upper_bound(Bound::Excluded(&before));
        }
        None
    }
}

impl Cursor for MemTableCursor {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_ref()).unwrap_or(&[])
    }

    fn value(&self) -> &ValueStruct {
        self.current
            .as_ref()
            .map(|(_, v)| v)
            .unwrap_or(&EMPTY_VALUE)
    }

    fn advance(&mut self) -> Result<()> {
        let Some((key, _)) = self.current.take() else {
            return Ok(());
        };
        self.current = if self.reverse {
            let before = MemTableKey::new(key, u64::MAX);
            let start = self.table.data.upper_bound(Bound::Excluded(&before));
            self.visible_backward(start)
        } else {
            let after = MemTableKey::new(key, 0);
            let start = self.table.data.lower_bound(Bound::Excluded(&after));
            self.visible_forward(start)
        };
        Ok(())
    }
}
