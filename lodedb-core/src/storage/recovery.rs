//! Startup recovery
//!
//! Opening a directory runs these steps in order:
//! 1. take the directory lock, or fall back to a read-only open
//! 2. fold the manifest, match it against the table files on disk and
//!    delete orphan tables left by a crash between write and commit
//! 3. open the live tables into their levels
//! 4. read the head pointer from the newest flushed table
//! 5. replay value log batches written after the head into memtables
//!
//! A read-only open changes nothing on disk.

use super::database::{DbInner, WriteState};
use super::lock::DirLock;
use super::Options;
use crate::compaction::LevelController;
use crate::manifest::Manifest;
use crate::memtable::MemTable;
use crate::sstable::{parse_table_id, table_path, Table, TableOptions};
use crate::version::{Level, Version, VersionSet};
use crate::vlog::{ValueLog, VlogOptions};
use crate::{LodeError, Result, ValuePointer, ValueStruct, HEAD_KEY};
use bytes::Bytes;
use crossbeam_channel::Sender;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ids of every table file in `dir`
fn list_tables(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_table_id) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Read the head pointer stored in the tree
fn read_head(version: &Version) -> Result<ValuePointer> {
    match version.get(HEAD_KEY, u64::MAX)? {
        Some(value) => ValuePointer::decode(&value.value),
        None => Ok(ValuePointer::default()),
    }
}

/// Attempts at a consistent read-only view while the lock holder compacts
const READ_ONLY_ATTEMPTS: usize = 5;
const READ_ONLY_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Durable file set: the folded manifest and the live tables by level
struct FileSet {
    manifest: Manifest,
    levels: Vec<Level>,
    live_tables: usize,
    max_disk_id: Option<u64>,
}

/// Fold the manifest, match it against the disk and open the live tables.
///
/// A writable open deletes orphans. A read-only open leaves them to the
/// lock holder and, since that holder may commit a compaction between the
/// manifest read and the table opens, retries a few times.
fn load_file_set(options: &Options, read_only: bool) -> Result<FileSet> {
    let mut attempt = 1;
    loop {
        match try_load_file_set(options, read_only) {
            Err(e) if read_only && attempt < READ_ONLY_ATTEMPTS && is_racy(&e) => {
                debug!("Read-only open raced a file set change ({}), retrying", e);
                attempt += 1;
                std::thread::sleep(READ_ONLY_RETRY_DELAY);
            }
            other => return other,
        }
    }
}

fn is_racy(e: &LodeError) -> bool {
    match e {
        LodeError::Manifest(_) => true,
        LodeError::Io(io) => io.kind() == ErrorKind::NotFound,
        _ => false,
    }
}

fn try_load_file_set(options: &Options, read_only: bool) -> Result<FileSet> {
    let manifest = if read_only {
        Manifest::open_read_only(&options.dir)?
    } else {
        Manifest::open(&options.dir)?
    };

    let disk_tables = list_tables(&options.dir)?;
    let reconciled = manifest.reconcile(&disk_tables)?;
    if read_only {
        if !reconciled.orphans.is_empty() {
            debug!(
                "Ignoring {} tables the manifest does not list",
                reconciled.orphans.len()
            );
        }
    } else {
        for id in &reconciled.orphans {
            let path = table_path(&options.dir, *id);
            match fs::remove_file(&path) {
                Ok(()) => info!("Removed orphan table {}", id),
                Err(e) => warn!("Failed to remove orphan table {:?}: {}", path, e),
            }
        }
    }

    let table_options = TableOptions::from(options);
    let mut by_level: Vec<Vec<Arc<Table>>> = vec![Vec::new(); options.max_levels];
    for (&id, &level) in &reconciled.live {
        if level >= options.max_levels {
            return Err(LodeError::Config(format!(
                "table {} lives in level {} but max_levels is {}",
                id, level, options.max_levels
            )));
        }
        let table = Table::open(table_path(&options.dir, id), id, table_options.clone())?;
        by_level[level].push(Arc::new(table));
    }
    let levels = by_level
        .into_iter()
        .enumerate()
        .map(|(level, mut tables)| {
            if level == 0 {
                // Flush order, newest first
                tables.sort_by(|a, b| b.id().cmp(&a.id()));
            } else {
                tables.sort_by(|a, b| a.smallest().cmp(b.smallest()));
            }
            Level::new(level, tables)
        })
        .collect();

    Ok(FileSet {
        manifest,
        levels,
        live_tables: reconciled.live.len(),
        max_disk_id: disk_tables.iter().copied().max(),
    })
}

impl DbInner {
    pub(super) fn recover(
        options: Options,
        flush_tx: Sender<()>,
        compact_tx: Sender<()>,
    ) -> Result<Self> {
        fs::create_dir_all(&options.dir)?;
        let lock = DirLock::try_acquire(&options.dir)?;
        let read_only = lock.is_none();
        if let Some(lock) = &lock {
            debug!("Holding {:?}", lock.path());
        }

        let files = load_file_set(&options, read_only)?;
        let manifest = Arc::new(files.manifest);
        let state = manifest.state();
        let max_seen = files.max_disk_id.map_or(1, |id| id + 1);
        let next_table_id = state.next_table_id.max(max_seen);

        let mut vlog_options = VlogOptions::from(&options);
        vlog_options.read_only = read_only;
        let vlog = Arc::new(ValueLog::open(
            vlog_options,
            &state.deleted_vlogs,
            state.next_vlog_fid,
        )?);

        let version = Version::new(Arc::new(MemTable::new(1)), files.levels);
        let head = read_head(&version)?;
        let versions = Arc::new(VersionSet::new(version, 0));
        let closing = Arc::new(AtomicBool::new(false));
        let levels = LevelController::new(
            options.clone(),
            versions.clone(),
            manifest.clone(),
            vlog.clone(),
            next_table_id,
            closing.clone(),
        );

        debug!(
            "Recovered {} live tables, next table id {}, head {}",
            files.live_tables,
            next_table_id,
            head
        );

        let inner = DbInner::new(
            options,
            versions,
            manifest,
            vlog,
            levels,
            WriteState {
                seq: 0,
                next_memtable_id: 2,
            },
            head,
            closing,
            flush_tx,
            compact_tx,
            lock,
        );
        inner.replay(head)?;
        Ok(inner)
    }

    /// Re-apply value log batches written after `head`
    fn replay(&self, head: ValuePointer) -> Result<()> {
        let mut state = self.writer.lock();
        let limit = self.options.memtable_size;

        self.vlog.replay(head, |records| {
            let batch: Vec<(Bytes, ValueStruct)> = records
                .iter()
                .map(|(entry, ptr)| (entry.key.clone(), self.stored_form(entry, ptr)))
                .collect();

            let memtable = self.versions.current().memtable.clone();
            if memtable.would_exceed(MemTable::batch_size(&batch), limit) {
                self.rotate_memtable(&mut state);
            }
            let last = records.last().map(|(_, ptr)| *ptr);
            self.apply_to_memtable(&mut state, &batch, last);
            // A read-only instance keeps everything in memory
            if !self.is_read_only() && !self.versions.current().immutables.is_empty() {
                self.flush_pending()?;
            }
            Ok(())
        })?;

        let replayed = self.versions.current().memtable.len();
        if replayed > 0 {
            info!("Restored {} unflushed entries from the value log", replayed);
        }
        Ok(())
    }
}
