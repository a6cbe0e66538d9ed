//! Version set: the one atomically swapped view of engine state
//!
//! A [`Version`] bundles the active memtable, the immutable memtables
//! waiting for flush and the table set of every level. Readers load one
//! version at the start of an operation and never look at global state
//! again; writers build a new version off to the side and install it with
//! a single swap.

use crate::iterator::{Cursor, LevelCursor, MergeCursor};
use crate::memtable::{MemTable, MemTableCursor};
use crate::sstable::Table;
use crate::{Result, ValueStruct};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tables of one level
#[derive(Clone, Default)]
pub(crate) struct Level {
    pub level: usize,
    /// L0: newest first. Deeper levels: sorted by key range, disjoint.
    pub tables: Vec<Arc<Table>>,
    pub total_size: u64,
}

impl Level {
    pub fn new(level: usize, tables: Vec<Arc<Table>>) -> Self {
        let total_size = tables.iter().map(|t| t.size()).sum();
        Self {
            level,
            tables,
            total_size,
        }
    }

    /// Table of a sorted level that may hold `key`
    fn find(&self, key: &[u8]) -> Option<&Arc<Table>> {
        let idx = self.tables.partition_point(|t| t.biggest() < key);
        self.tables.get(idx).filter(|t| t.covers(key))
    }

    fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        if self.level == 0 {
            for table in &self.tables {
                if let Some(value) = table.get(key)? {
                    return Ok(Some(value));
                }
            }
            Ok(None)
        } else {
            match self.find(key) {
                Some(table) => table.get(key),
                None => Ok(None),
            }
        }
    }

    /// Whether any table of this level has a range covering `key`
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.level == 0 {
            self.tables.iter().any(|t| t.covers(key))
        } else {
            self.find(key).is_some()
        }
    }
}

/// Immutable snapshot of engine state
#[derive(Clone)]
pub(crate) struct Version {
    pub memtable: Arc<MemTable>,
    /// Newest first
    pub immutables: Vec<Arc<MemTable>>,
    pub levels: Vec<Level>,
}

impl Version {
    pub fn new(memtable: Arc<MemTable>, levels: Vec<Level>) -> Self {
        Self {
            memtable,
            immutables: Vec::new(),
            levels,
        }
    }

    /// Newest stored form of `key` visible at `read_seq`
    pub fn get(&self, key: &[u8], read_seq: u64) -> Result<Option<ValueStruct>> {
        if let Some(value) = self.memtable.get(key, read_seq) {
            return Ok(Some(value));
        }
        for memtable in &self.immutables {
            if let Some(value) = memtable.get(key, read_seq) {
                return Ok(Some(value));
            }
        }
        for level in &self.levels {
            if let Some(value) = level.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Cursors over every source, newest first
    pub fn merged_cursor(&self, read_seq: u64, reverse: bool) -> Result<MergeCursor> {
        let mut sources: Vec<Box<dyn Cursor>> = Vec::new();
        sources.push(Box::new(MemTableCursor::new(
            self.memtable.clone(),
            read_seq,
            reverse,
        )));
        for memtable in &self.immutables {
            sources.push(Box::new(MemTableCursor::new(
                memtable.clone(),
                read_seq,
                reverse,
            )));
        }
        for level in &self.levels {
            if level.tables.is_empty() {
                continue;
            }
            if level.level == 0 {
                for table in &level.tables {
                    sources.push(Box::new(table.cursor(reverse)?));
                }
            } else {
                sources.push(Box::new(LevelCursor::new(level.tables.clone(), reverse)?));
            }
        }
        Ok(MergeCursor::new(sources, reverse))
    }

    /// Oldest immutable memtable, the next one to flush
    pub fn oldest_immutable(&self) -> Option<&Arc<MemTable>> {
        self.immutables.last()
    }

    /// Total table bytes across all levels
    pub fn table_bytes(&self) -> u64 {
        self.levels.iter().map(|l| l.total_size).sum()
    }

    /// Copy with `fresh` as the active memtable and the old one queued
    pub fn rotated(&self, fresh: Arc<MemTable>) -> Self {
        let mut next = self.clone();
        next.immutables.insert(0, self.memtable.clone());
        next.memtable = fresh;
        next
    }

    /// Copy with `table` added to L0 and memtable `flushed_id` dropped
    pub fn flushed(&self, flushed_id: u64, table: Arc<Table>) -> Self {
        let mut next = self.clone();
        next.immutables.retain(|m| m.id() != flushed_id);
        let l0 = &mut next.levels[0];
        l0.total_size += table.size();
        l0.tables.insert(0, table);
        next
    }

    /// Copy with the compaction inputs removed and `outputs` placed into
    /// `target` in key order
    pub fn compacted(&self, removed: &[u64], target: usize, outputs: Vec<Arc<Table>>) -> Self {
        let mut next = self.clone();
        for level in next.levels.iter_mut() {
            level.tables.retain(|t| !removed.contains(&t.id()));
        }
        let target_level = &mut next.levels[target];
        target_level.tables.extend(outputs);
        target_level
            .tables
            .sort_by(|a, b| a.smallest().cmp(b.smallest()));
        for level in next.levels.iter_mut() {
            level.total_size = level.tables.iter().map(|t| t.size()).sum();
        }
        next
    }
}

/// Holder of the current [`Version`]
pub(crate) struct VersionSet {
    current: ArcSwap<Version>,
    /// Serializes read-modify-install sequences
    install_lock: Mutex<()>,
    /// Highest batch sequence readers may see
    visible_seq: AtomicU64,
}

impl VersionSet {
    pub fn new(version: Version, visible_seq: u64) -> Self {
        Self {
            current: ArcSwap::from_pointee(version),
            install_lock: Mutex::new(()),
            visible_seq: AtomicU64::new(visible_seq),
        }
    }

    /// Current version
    pub fn current(&self) -> Arc<Version> {
        self.current.load_full()
    }

    /// Current version together with the sequence to read it at.
    ///
    /// The sequence is taken first: every batch at or below it is complete
    /// and already in a memtable or table this version can reach.
    pub fn snapshot(&self) -> (Arc<Version>, u64) {
        let seq = self.visible_seq.load(Ordering::Acquire);
        (self.current.load_full(), seq)
    }

    /// Make batches up to `seq` visible
    pub fn publish_seq(&self, seq: u64) {
        self.visible_seq.store(seq, Ordering::Release);
    }

    /// Lock out concurrent installers; hold the guard across a read of
    /// [`VersionSet::current`] and the following [`VersionSet::install`].
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.install_lock.lock()
    }

    /// Publish `version`; the caller must hold the guard from [`VersionSet::lock`]
    pub fn install(&self, _guard: &MutexGuard<'_, ()>, version: Version) -> Arc<Version> {
        let version = Arc::new(version);
        self.current.store(version.clone());
        version
    }

    /// Build and publish the next version from the current one
    pub fn update(&self, f: impl FnOnce(&Version) -> Version) -> Arc<Version> {
        let guard = self.lock();
        let next = f(&self.current());
        self.install(&guard, next)
    }
}
