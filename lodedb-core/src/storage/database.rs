//! Database - the engine handle tying the write path, levels and value log together

use super::lock::DirLock;
use super::workers::Workers;
use super::Options;
use crate::compaction::{LevelController, LevelSummary};
use crate::iterator::{DbIterator, IterSource, IteratorOptions, MergeCursor};
use crate::manifest::{Manifest, ManifestChange};
use crate::memtable::MemTable;
use crate::version::VersionSet;
use crate::vlog::{GcTarget, ValueLog};
use crate::{is_reserved_key, Entry, LodeError, Result, ValuePointer, ValueStruct, BIT_DELETE};
use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Attempts at re-reading a value whose segment was reclaimed mid-read
const MAX_READ_RETRIES: usize = 8;
/// Wake-up interval of a writer stalled on pending flushes
const STALL_POLL: Duration = Duration::from_millis(100);

/// Sequence and memtable counters, guarded by the writer lock
pub(super) struct WriteState {
    /// Sequence of the last applied batch
    pub seq: u64,
    pub next_memtable_id: u64,
}

/// Shared engine state, owned by the handle and the worker threads
pub(crate) struct DbInner {
    pub(super) options: Options,
    pub(super) versions: Arc<VersionSet>,
    pub(super) manifest: Arc<Manifest>,
    pub(super) vlog: Arc<ValueLog>,
    pub(super) levels: LevelController,
    /// One batch at a time
    pub(super) writer: Mutex<WriteState>,
    flush_lock: Mutex<()>,
    stall_lock: Mutex<()>,
    stall_cond: Condvar,
    /// Head pointer durable in flushed tables
    flushed_head: Mutex<ValuePointer>,
    pub(super) closing: Arc<AtomicBool>,
    closed: AtomicBool,
    flush_tx: Sender<()>,
    compact_tx: Sender<()>,
    read_only: bool,
    /// Directory lock of a writable instance, released at close
    lock: Mutex<Option<DirLock>>,
}

impl DbInner {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        options: Options,
        versions: Arc<VersionSet>,
        manifest: Arc<Manifest>,
        vlog: Arc<ValueLog>,
        levels: LevelController,
        state: WriteState,
        flushed_head: ValuePointer,
        closing: Arc<AtomicBool>,
        flush_tx: Sender<()>,
        compact_tx: Sender<()>,
        lock: Option<DirLock>,
    ) -> Self {
        Self {
            options,
            versions,
            manifest,
            vlog,
            levels,
            writer: Mutex::new(state),
            flush_lock: Mutex::new(()),
            stall_lock: Mutex::new(()),
            stall_cond: Condvar::new(),
            flushed_head: Mutex::new(flushed_head),
            closing,
            closed: AtomicBool::new(false),
            flush_tx,
            compact_tx,
            read_only: lock.is_none(),
            lock: Mutex::new(lock),
        }
    }

    /// Another instance owns the directory; nothing here may change it
    pub(super) fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LodeError::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.is_read_only() {
            return Err(LodeError::ReadOnly);
        }
        Ok(())
    }

    /// How `entry` is stored in the tree once written at `ptr`
    pub(super) fn stored_form(&self, entry: &Entry, ptr: &ValuePointer) -> ValueStruct {
        if entry.is_delete() {
            ValueStruct::tombstone()
        } else if entry.value.len() >= self.options.value_threshold {
            ValueStruct::pointer(ptr)
        } else {
            ValueStruct::new(entry.meta, entry.value.clone())
        }
    }

    /// Write a batch through the value log into the memtable; the caller
    /// holds the writer lock.
    fn apply_locked(&self, state: &mut WriteState, entries: Vec<Entry>) -> Result<Vec<ValuePointer>> {
        self.check_open()?;
        let extra = entries.iter().map(Entry::size).sum();
        self.make_room(state, extra)?;

        let ptrs = self.vlog.write(&entries)?;
        let batch: Vec<(Bytes, ValueStruct)> = entries
            .iter()
            .zip(&ptrs)
            .map(|(e, p)| (e.key.clone(), self.stored_form(e, p)))
            .collect();
        self.apply_to_memtable(state, &batch, ptrs.last().copied());
        Ok(ptrs)
    }

    /// Insert an already logged batch under a fresh sequence and publish it
    pub(super) fn apply_to_memtable(
        &self,
        state: &mut WriteState,
        batch: &[(Bytes, ValueStruct)],
        head: Option<ValuePointer>,
    ) {
        state.seq += 1;
        let version = self.versions.current();
        version.memtable.insert_batch(batch, state.seq, head);
        self.versions.publish_seq(state.seq);

        if version.memtable.should_flush(self.options.memtable_size)
            && version.immutables.len() < self.options.num_memtables
        {
            self.rotate_memtable(state);
        }
    }

    /// Rotate the memtable if `extra` bytes do not fit, stalling while too
    /// many immutable memtables wait for flush.
    fn make_room(&self, state: &mut WriteState, extra: usize) -> Result<()> {
        let memtable = self.versions.current().memtable.clone();
        let limit = self.options.memtable_size;
        if !memtable.would_exceed(extra, limit) && !memtable.should_flush(limit) {
            return Ok(());
        }

        let mut stalled_at = None;
        {
            let mut guard = self.stall_lock.lock();
            while self.versions.current().immutables.len() >= self.options.num_memtables {
                if self.closed.load(Ordering::Acquire) {
                    return Err(LodeError::Closed);
                }
                stalled_at.get_or_insert_with(Instant::now);
                let _ = self.flush_tx.try_send(());
                self.stall_cond.wait_for(&mut guard, STALL_POLL);
            }
        }
        if let Some(start) = stalled_at {
            debug!("Write stalled {:?} waiting for memtable flush", start.elapsed());
        }
        self.rotate_memtable(state);
        Ok(())
    }

    /// Swap in an empty memtable and queue the full one for flush
    pub(super) fn rotate_memtable(&self, state: &mut WriteState) {
        let id = state.next_memtable_id;
        state.next_memtable_id += 1;
        let version = self.versions.update(|v| v.rotated(Arc::new(MemTable::new(id))));
        if let Some(queued) = version.immutables.first() {
            verbose!(
                self.options,
                "Rotated memtable {} ({} entries, {} bytes), {} pending flush",
                queued.id(),
                queued.len(),
                queued.size(),
                version.immutables.len()
            );
        }
        let _ = self.flush_tx.try_send(());
    }

    /// Flush the oldest immutable memtable into L0.
    ///
    /// Returns false when nothing was pending.
    pub(super) fn flush_one(&self) -> Result<bool> {
        let _guard = self.flush_lock.lock();
        let Some(memtable) = self.versions.current().oldest_immutable().cloned() else {
            return Ok(false);
        };

        let start = Instant::now();
        match self.levels.build_level_zero_table(&memtable)? {
            Some(table) => {
                let table_id = table.id();
                self.levels.add_level_zero_table(table, memtable.id())?;
                verbose!(
                    self.options,
                    "Flushed memtable {} ({} entries, {:?} old) to table {} in {:?}",
                    memtable.id(),
                    memtable.len(),
                    memtable.age(),
                    table_id,
                    start.elapsed()
                );
            }
            None => self.levels.discard_memtable(memtable.id()),
        }

        let head = memtable.head();
        {
            let mut flushed = self.flushed_head.lock();
            if head > *flushed {
                *flushed = head;
            }
        }
        {
            let _stall = self.stall_lock.lock();
            self.stall_cond.notify_all();
        }

        self.vlog.complete_deletions(self)?;
        let _ = self.compact_tx.try_send(());
        Ok(true)
    }

    /// Flush every queued immutable memtable
    pub(super) fn flush_pending(&self) -> Result<usize> {
        let mut flushed = 0;
        while self.flush_one()? {
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Rotate a non-empty active memtable and flush everything queued
    fn flush_all(&self) -> Result<()> {
        {
            let mut state = self.writer.lock();
            if !self.versions.current().memtable.is_empty() {
                self.rotate_memtable(&mut state);
            }
        }
        self.flush_pending()?;
        Ok(())
    }

    /// Raw stored form of `key` in the latest committed state
    pub(crate) fn get_value_struct(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        let (version, seq) = self.versions.snapshot();
        version.get(key, seq)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        match self.get_value_struct(key)? {
            Some(value) => self.resolve(key, &value),
            None => Ok(None),
        }
    }

    /// Finish background work and make everything durable
    fn shutdown(&self, workers: Option<Workers>) -> Result<()> {
        // Wait out a batch that is already past the open check
        drop(self.writer.lock());
        self.closing.store(true, Ordering::Release);
        {
            let _stall = self.stall_lock.lock();
            self.stall_cond.notify_all();
        }
        if let Some(workers) = workers {
            workers.stop();
        }

        if self.is_read_only() {
            info!("Closed read-only database at {:?}", self.options.dir);
            return Ok(());
        }
        self.flush_all()?;
        self.vlog.sync()?;
        drop(self.lock.lock().take());
        info!("Closed database at {:?}", self.options.dir);
        Ok(())
    }
}

impl IterSource for DbInner {
    fn merged_cursor(&self, reverse: bool) -> Result<MergeCursor> {
        let (version, seq) = self.versions.snapshot();
        version.merged_cursor(seq, reverse)
    }

    fn resolve(&self, key: &[u8], value: &ValueStruct) -> Result<Option<Bytes>> {
        let mut value = value.clone();
        for _ in 0..MAX_READ_RETRIES {
            if value.is_delete() {
                return Ok(None);
            }
            let Some(ptr) = value.value_pointer()? else {
                return Ok(Some(value.value));
            };
            match self.vlog.read(&ptr) {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(LodeError::Retry(fid)) => {
                    debug!("Segment {} retired under a read, looking the key up again", fid);
                    match self.get_value_struct(key)? {
                        Some(fresh) => value = fresh,
                        None => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(LodeError::Internal(format!(
            "value of key {:?} kept moving after {} reads",
            String::from_utf8_lossy(key),
            MAX_READ_RETRIES
        )))
    }
}

impl GcTarget for DbInner {
    fn flushed_head(&self) -> ValuePointer {
        *self.flushed_head.lock()
    }

    fn current_value(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        self.get_value_struct(key)
    }

    fn rewrite(&self, entries: Vec<(Entry, ValuePointer)>) -> Result<Option<ValuePointer>> {
        let mut state = self.writer.lock();
        // Under the writer lock no batch can move a key between check and write
        let (version, seq) = self.versions.snapshot();
        let mut keep = Vec::with_capacity(entries.len());
        for (entry, old) in entries {
            let unchanged = match version.get(&entry.key, seq)? {
                Some(current) => current.value_pointer()? == Some(old),
                None => false,
            };
            if unchanged {
                keep.push(entry);
            }
        }
        if keep.is_empty() {
            return Ok(None);
        }
        let ptrs = self.apply_locked(&mut state, keep)?;
        Ok(ptrs.last().copied())
    }

    fn log_changes(&self, changes: &[ManifestChange]) -> Result<()> {
        self.manifest.append(changes)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub memtable_size: usize,
    pub immutable_memtables: usize,
    /// Table count per level, L0 first
    pub tables_per_level: Vec<usize>,
    pub total_entries: u64,
    pub total_size_bytes: u64,
    pub value_log_segments: usize,
    pub compactions: u64,
    /// Sequence of the last visible batch
    pub last_sequence: u64,
}

/// An open LodeDB instance
pub struct Database {
    inner: Arc<DbInner>,
    workers: Mutex<Option<Workers>>,
}

impl Database {
    /// Open the database in `options.dir`, recovering whatever a previous
    /// instance left behind.
    ///
    /// When another instance holds the directory this one opens read-only:
    /// it sees the state durable at open time, runs no background work and
    /// rejects every mutation with `ReadOnly`.
    pub fn open(options: Options) -> Result<Self> {
        options.validate()?;
        let start = Instant::now();
        let (flush_tx, flush_rx) = crossbeam_channel::bounded(1);
        let (compact_tx, compact_rx) = crossbeam_channel::bounded(1);

        let inner = Arc::new(DbInner::recover(options, flush_tx, compact_tx)?);
        let workers = if inner.is_read_only() {
            warn!(
                "{:?} is locked by another instance, opened read-only",
                inner.options.dir
            );
            None
        } else {
            Some(Workers::spawn(&inner, flush_rx, compact_rx)?)
        };

        let version = inner.versions.current();
        info!(
            "Opened database at {:?} in {:?}: {} tables, {} value log segments",
            inner.options.dir,
            start.elapsed(),
            version.levels.iter().map(|l| l.tables.len()).sum::<usize>(),
            inner.vlog.segment_ids().len()
        );
        Ok(Self {
            inner,
            workers: Mutex::new(workers),
        })
    }

    /// Flush outstanding state, stop background work and sync files.
    ///
    /// Later calls are no-ops; other operations fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let workers = self.workers.lock().take();
        self.inner.shutdown(workers)
    }

    /// Apply a batch atomically: readers see all of it or none of it
    pub fn write(&self, entries: Vec<Entry>) -> Result<()> {
        self.inner.check_writable()?;
        if entries.is_empty() {
            return Ok(());
        }
        for entry in &entries {
            validate_entry(entry)?;
        }
        let mut state = self.inner.writer.lock();
        self.inner.apply_locked(&mut state, entries)?;
        Ok(())
    }

    pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.write(vec![Entry::new(key, value)])
    }

    pub fn delete(&self, key: impl Into<Bytes>) -> Result<()> {
        self.write(vec![Entry::delete(key)])
    }

    /// Latest value of `key`, or `None` if absent or deleted
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.check_open()?;
        validate_key(key)?;
        self.inner.get(key)
    }

    /// Iterate over all keys in order
    pub fn iter(&self, options: IteratorOptions) -> Result<DbIterator> {
        self.inner.check_open()?;
        let source: Arc<dyn IterSource> = self.inner.clone();
        DbIterator::new(source, options)
    }

    /// Persist the active memtable and wait for every pending flush
    pub fn flush(&self) -> Result<()> {
        self.inner.check_writable()?;
        self.inner.flush_all()
    }

    /// Run one compaction step on `level`; false when there was nothing to do
    pub fn try_compact(&self, level: usize) -> Result<bool> {
        self.inner.check_writable()?;
        self.inner.levels.try_compact(level)
    }

    /// Run one value log GC round with the given reclaimable-fraction
    /// threshold. Returns whether a segment was rewritten.
    pub fn run_value_gc(&self, discard_ratio: f64) -> Result<bool> {
        self.inner.check_writable()?;
        self.inner
            .vlog
            .garbage_collect(self.inner.as_ref(), discard_ratio)
    }

    pub fn level_summaries(&self) -> Vec<LevelSummary> {
        self.inner.levels.level_summaries()
    }

    /// Ids of the value log segments on disk
    pub fn value_log_segments(&self) -> Vec<u64> {
        self.inner.vlog.segment_ids()
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Whether another instance owns the directory
    pub fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    pub fn stats(&self) -> DatabaseStats {
        let (version, seq) = self.inner.versions.snapshot();
        DatabaseStats {
            memtable_size: version.memtable.size(),
            immutable_memtables: version.immutables.len(),
            tables_per_level: version.levels.iter().map(|l| l.tables.len()).collect(),
            total_entries: version
                .levels
                .iter()
                .flat_map(|l| l.tables.iter())
                .map(|t| t.entry_count())
                .sum(),
            total_size_bytes: version.table_bytes(),
            value_log_segments: self.inner.vlog.segment_ids().len(),
            compactions: self.inner.levels.compaction_count(),
            last_sequence: seq,
        }
    }

    /// Stop without flushing, as if the process died
    #[cfg(test)]
    pub(crate) fn simulate_crash(self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.closing.store(true, Ordering::Release);
        if let Some(workers) = self.workers.lock().take() {
            workers.stop();
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close database at {:?}: {}", self.inner.options.dir, e);
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dir", &self.inner.options.dir)
            .finish()
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(LodeError::InvalidArgument("empty key".into()));
    }
    if is_reserved_key(key) {
        return Err(LodeError::InvalidArgument(format!(
            "key {:?} uses the reserved prefix",
            String::from_utf8_lossy(key)
        )));
    }
    Ok(())
}

fn validate_entry(entry: &Entry) -> Result<()> {
    validate_key(&entry.key)?;
    if entry.meta & !BIT_DELETE != 0 {
        return Err(LodeError::InvalidArgument(format!(
            "key {:?} carries meta bits {:#04x}; only the delete bit may be set",
            String::from_utf8_lossy(&entry.key),
            entry.meta
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_options(dir: &std::path::Path) -> Options {
        let mut opts = Options::new(dir);
        opts.memtable_size = 4 * 1024;
        opts.value_threshold = 16;
        opts.value_log_file_size = 16 * 1024;
        opts.value_gc_interval_ms = 0;
        opts
    }

    #[test]
    fn test_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(small_options(temp_dir.path())).unwrap();

        db.put("short", "v").unwrap();
        db.put("long", "a value well past the inline threshold").unwrap();
        assert_eq!(db.get(b"short").unwrap(), Some(Bytes::from("v")));
        assert_eq!(
            db.get(b"long").unwrap(),
            Some(Bytes::from("a value well past the inline threshold"))
        );

        db.delete("short").unwrap();
        assert_eq!(db.get(b"short").unwrap(), None);
        assert_eq!(db.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_reserved_and_empty_keys_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(small_options(temp_dir.path())).unwrap();

        assert!(matches!(
            db.put("!lodedb!head", "x"),
            Err(LodeError::InvalidArgument(_))
        ));
        assert!(matches!(db.put("", "x"), Err(LodeError::InvalidArgument(_))));
        // Nothing of a rejected batch lands
        let batch = vec![Entry::new("ok", "1"), Entry::new("!lodedb!x", "2")];
        assert!(db.write(batch).is_err());
        assert_eq!(db.get(b"ok").unwrap(), None);
    }

    #[test]
    fn test_caller_meta_bits_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(small_options(temp_dir.path())).unwrap();

        let mut pointer = Entry::new("a", "short");
        pointer.meta = crate::BIT_VALUE_POINTER;
        assert!(matches!(
            db.write(vec![pointer]),
            Err(LodeError::InvalidArgument(_))
        ));

        let mut high = Entry::new("b", "v");
        high.meta = 0x80;
        assert!(matches!(
            db.write(vec![Entry::new("c", "v"), high]),
            Err(LodeError::InvalidArgument(_))
        ));

        assert_eq!(db.get(b"a").unwrap(), None);
        assert_eq!(db.get(b"c").unwrap(), None);
        // The delete bit alone is the one a caller may set
        db.put("a", "short").unwrap();
        let mut tombstone = Entry::new("a", "");
        tombstone.meta = BIT_DELETE;
        db.write(vec![tombstone]).unwrap();
        assert_eq!(db.get(b"a").unwrap(), None);
        assert!(db.iter(IteratorOptions::default()).unwrap().next().is_none());
    }

    #[test]
    fn test_closed_database_rejects_operations() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(small_options(temp_dir.path())).unwrap();
        db.put("k", "v").unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(db.put("k", "v2"), Err(LodeError::Closed)));
        assert!(matches!(db.get(b"k"), Err(LodeError::Closed)));
    }

    #[test]
    fn test_crash_recovers_unflushed_writes() {
        let temp_dir = TempDir::new().unwrap();
        let mut opts = small_options(temp_dir.path());
        opts.do_not_compact = true;
        {
            let db = Database::open(opts.clone()).unwrap();
            for i in 0..200 {
                db.put(format!("key{:03}", i), format!("value-{:03}-padding-padding", i))
                    .unwrap();
            }
            db.flush().unwrap();
            // These only live in the value log and the memtable
            for i in 0..50 {
                db.put(format!("key{:03}", i), format!("rewritten-{:03}", i))
                    .unwrap();
            }
            db.delete("key199").unwrap();
            db.simulate_crash();
        }

        let db = Database::open(opts).unwrap();
        for i in 0..50 {
            assert_eq!(
                db.get(format!("key{:03}", i).as_bytes()).unwrap(),
                Some(Bytes::from(format!("rewritten-{:03}", i)))
            );
        }
        assert_eq!(
            db.get(b"key150").unwrap(),
            Some(Bytes::from("value-150-padding-padding"))
        );
        assert_eq!(db.get(b"key199").unwrap(), None);
    }

    #[test]
    fn test_flush_moves_memtable_to_level_zero() {
        let temp_dir = TempDir::new().unwrap();
        let mut opts = small_options(temp_dir.path());
        opts.do_not_compact = true;
        let db = Database::open(opts).unwrap();

        db.put("a", "1").unwrap();
        db.flush().unwrap();
        let stats = db.stats();
        assert_eq!(stats.immutable_memtables, 0);
        assert_eq!(stats.memtable_size, 0);
        assert_eq!(stats.tables_per_level[0], 1);
        assert_eq!(db.get(b"a").unwrap(), Some(Bytes::from("1")));

        // Nothing new to flush
        db.flush().unwrap();
        assert_eq!(db.stats().tables_per_level[0], 1);
    }
}
