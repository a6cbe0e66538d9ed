//! Leveled compaction for the LSM tree
//!
//! The level controller owns the table set of every level. Level 0 is
//! compacted by table count, deeper levels by byte size against a capacity
//! that grows geometrically per level. Every step follows commit then
//! delete: outputs are fsynced, one manifest changeset records creates and
//! deletes together, the new version is installed, and only then are the
//! inputs marked obsolete. Their files go away once the last snapshot
//! holding them is dropped.

use crate::iterator::{Cursor, LevelCursor, MergeCursor};
use crate::manifest::{sync_dir, Manifest, ManifestChange};
use crate::memtable::{MemTable, MemTableCursor};
use crate::sstable::{table_path, Table, TableBuilder, TableOptions};
use crate::version::{Level, Version, VersionSet};
use crate::vlog::ValueLog;
use crate::{Options, Result, ValueStruct, HEAD_KEY};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One unit of compaction work
#[derive(Clone)]
pub struct CompactionTask {
    /// Level being compacted
    pub level: usize,
    /// Level receiving the output
    pub target: usize,
    /// Inputs from `level`, newest first
    pub top: Vec<Arc<Table>>,
    /// Overlapping inputs from `target`, in key order
    pub bottom: Vec<Arc<Table>>,
}

impl CompactionTask {
    fn input_ids(&self) -> Vec<u64> {
        self.top
            .iter()
            .chain(self.bottom.iter())
            .map(|t| t.id())
            .collect()
    }

    fn input_bytes(&self) -> u64 {
        self.top
            .iter()
            .chain(self.bottom.iter())
            .map(|t| t.size())
            .sum()
    }
}

/// Tables written so far by one merge
#[derive(Default)]
struct Outputs {
    tables: Vec<Arc<Table>>,
    builder: Option<TableBuilder>,
    /// Value log bytes of dropped pointer entries per segment; reported
    /// only once the merge commits
    discards: Arc<Mutex<HashMap<u64, u64>>>,
}

impl Outputs {
    fn finish_table(&mut self) -> Result<()> {
        if let Some(builder) = self.builder.take() {
            self.tables.push(Arc::new(builder.finish()?));
        }
        Ok(())
    }

    /// Remove everything written
    fn discard(self) {
        if let Some(builder) = self.builder {
            if let Err(e) = builder.abandon() {
                warn!("Failed to remove unfinished compaction output: {}", e);
            }
        }
        for table in &self.tables {
            table.mark_obsolete();
        }
    }
}

/// Output tables of a committed merge and the value log bytes it discarded
type MergeOutput = (Vec<Arc<Table>>, HashMap<u64, u64>);

/// Table ids and sizes of one level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSummary {
    pub level: usize,
    /// `(table id, size in bytes)`, in the level's search order
    pub tables: Vec<(u64, u64)>,
    pub total_size: u64,
}

/// Level controller: decides and executes compactions
pub struct LevelController {
    options: Options,
    table_options: TableOptions,
    versions: Arc<VersionSet>,
    manifest: Arc<Manifest>,
    vlog: Arc<ValueLog>,
    next_table_id: AtomicU64,
    /// One compaction at a time
    compact_lock: Mutex<()>,
    closing: Arc<AtomicBool>,
    compactions: AtomicU64,
}

impl LevelController {
    pub(crate) fn new(
        options: Options,
        versions: Arc<VersionSet>,
        manifest: Arc<Manifest>,
        vlog: Arc<ValueLog>,
        next_table_id: u64,
        closing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            table_options: TableOptions::from(&options),
            options,
            versions,
            manifest,
            vlog,
            next_table_id: AtomicU64::new(next_table_id.max(1)),
            compact_lock: Mutex::new(()),
            closing,
            compactions: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh table id
    pub fn new_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Lowest table id not yet handed out
    pub fn peek_next_table_id(&self) -> u64 {
        self.next_table_id.load(Ordering::SeqCst)
    }

    /// Number of compactions completed
    pub fn compaction_count(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    /// Write `memtable` out as a level-0 table, returning `None` when it
    /// holds nothing to persist.
    pub fn build_level_zero_table(&self, memtable: &Arc<MemTable>) -> Result<Option<Arc<Table>>> {
        let head = memtable.head();
        let mut cursor = MemTableCursor::new(memtable.clone(), u64::MAX, false);
        if !cursor.valid() && head.is_zero() {
            return Ok(None);
        }

        let id = self.new_table_id();
        let mut builder = TableBuilder::new(
            table_path(&self.options.dir, id),
            id,
            self.table_options.clone(),
        )?;
        let mut head_written = head.is_zero();
        while cursor.valid() {
            if !head_written && cursor.key() > HEAD_KEY {
                builder.add(HEAD_KEY, &ValueStruct::new(0, head.encode()))?;
                head_written = true;
            }
            builder.add(cursor.key(), cursor.value())?;
            cursor.advance()?;
        }
        if !head_written {
            builder.add(HEAD_KEY, &ValueStruct::new(0, head.encode()))?;
        }
        Ok(Some(Arc::new(builder.finish()?)))
    }

    /// Publish a flushed table in L0 and drop its memtable, in one swap.
    ///
    /// `CreateTable` is durable before the table becomes visible.
    pub fn add_level_zero_table(&self, table: Arc<Table>, memtable_id: u64) -> Result<()> {
        let logged = sync_dir(&self.options.dir).and_then(|()| {
            self.manifest.append(&[
                ManifestChange::CreateTable {
                    id: table.id(),
                    level: 0,
                },
                ManifestChange::Watermark {
                    next_table_id: self.peek_next_table_id(),
                    next_vlog_fid: self.vlog.next_fid(),
                },
            ])
        });
        if let Err(e) = logged {
            table.mark_obsolete();
            return Err(e);
        }
        debug!("Added table {} ({} bytes) to L0", table.id(), table.size());
        self.versions.update(|v| v.flushed(memtable_id, table));
        Ok(())
    }

    /// Drop a memtable that produced no table
    pub fn discard_memtable(&self, memtable_id: u64) {
        self.versions.update(|v| {
            let mut next = v.clone();
            next.immutables.retain(|m| m.id() != memtable_id);
            next
        });
    }

    /// Compaction pressure of `level`; 1.0 or more means over capacity
    fn score(&self, version: &Version, level: usize) -> f64 {
        if level + 1 >= version.levels.len() {
            return 0.0;
        }
        let lv = &version.levels[level];
        if level == 0 {
            lv.tables.len() as f64 / self.options.num_level_zero_tables as f64
        } else {
            lv.total_size as f64 / self.options.level_capacity(level) as f64
        }
    }

    /// Level most in need of compaction, if any is over capacity
    pub fn pick_compaction_level(&self) -> Option<usize> {
        let version = self.versions.current();
        (0..version.levels.len())
            .map(|level| (level, self.score(&version, level)))
            .filter(|(_, score)| *score >= 1.0)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(level, _)| level)
    }

    /// Run one compaction step for `level`.
    ///
    /// Returns false without doing anything when the level is within
    /// capacity, is the last level, or the engine is closing.
    pub fn try_compact(&self, level: usize) -> Result<bool> {
        let _guard = self.compact_lock.lock();
        if self.closing.load(Ordering::Acquire) {
            return Ok(false);
        }
        let version = self.versions.current();
        if level + 1 >= version.levels.len() || self.score(&version, level) < 1.0 {
            return Ok(false);
        }
        let Some(task) = self.select(&version, level) else {
            return Ok(false);
        };
        self.run(&version, task)
    }

    fn select(&self, version: &Version, level: usize) -> Option<CompactionTask> {
        let target = level + 1;
        let top = if level == 0 {
            version.levels[0].tables.clone()
        } else {
            vec![self.pick_victim(&version.levels[level], &version.levels[target])?]
        };
        if top.is_empty() {
            return None;
        }

        let lo = top.iter().map(|t| t.smallest()).min()?;
        let hi = top.iter().map(|t| t.biggest()).max()?;
        let bottom = version.levels[target]
            .tables
            .iter()
            .filter(|t| t.overlaps(lo, hi))
            .cloned()
            .collect();

        Some(CompactionTask {
            level,
            target,
            top,
            bottom,
        })
    }

    /// Table of `level` with the fewest overlapping bytes below it; ties go
    /// to the larger table
    fn pick_victim(&self, level: &Level, below: &Level) -> Option<Arc<Table>> {
        level
            .tables
            .iter()
            .map(|t| {
                let overlap: u64 = below
                    .tables
                    .iter()
                    .filter(|b| b.overlaps(t.smallest(), t.biggest()))
                    .map(|b| b.size())
                    .sum();
                (overlap, std::cmp::Reverse(t.size()), t)
            })
            .min_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)))
            .map(|(_, _, t)| t.clone())
    }

    fn run(&self, version: &Version, task: CompactionTask) -> Result<bool> {
        let start = Instant::now();
        verbose!(
            self.options,
            "Compacting L{} ({} tables) into L{} ({} tables), {} bytes",
            task.level,
            task.top.len(),
            task.target,
            task.bottom.len(),
            task.input_bytes()
        );

        let Some((outputs, discards)) = self.merge(version, &task)? else {
            info!("Compaction of L{} abandoned at shutdown", task.level);
            return Ok(false);
        };

        let removed = task.input_ids();
        let mut changes: Vec<ManifestChange> = outputs
            .iter()
            .map(|t| ManifestChange::CreateTable {
                id: t.id(),
                level: task.target,
            })
            .collect();
        changes.extend(removed.iter().map(|&id| ManifestChange::DeleteTable { id }));
        changes.push(ManifestChange::Watermark {
            next_table_id: self.peek_next_table_id(),
            next_vlog_fid: self.vlog.next_fid(),
        });
        // Outputs must be durable directory entries before the manifest names them
        if let Err(e) = sync_dir(&self.options.dir).and_then(|()| self.manifest.append(&changes)) {
            for table in &outputs {
                table.mark_obsolete();
            }
            return Err(e);
        }

        let output_bytes: u64 = outputs.iter().map(|t| t.size()).sum();
        let output_count = outputs.len();
        self.versions
            .update(|v| v.compacted(&removed, task.target, outputs));
        for (fid, bytes) in discards {
            self.vlog.record_discard(fid, bytes);
        }

        for table in task.top.iter().chain(task.bottom.iter()) {
            table.mark_obsolete();
        }
        self.compactions.fetch_add(1, Ordering::Relaxed);

        info!(
            "Compacted L{} -> L{}: {} tables ({} bytes) into {} tables ({} bytes) in {:?}",
            task.level,
            task.target,
            removed.len(),
            task.input_bytes(),
            output_count,
            output_bytes,
            start.elapsed()
        );
        Ok(true)
    }

    /// Merge the inputs into new tables for the target level.
    ///
    /// Returns `None` when shutdown interrupted the merge. Outputs of an
    /// interrupted or failed merge are removed.
    fn merge(&self, version: &Version, task: &CompactionTask) -> Result<Option<MergeOutput>> {
        let mut out = Outputs::default();
        match self.merge_into(version, task, &mut out) {
            Ok(true) => {
                let discards = std::mem::take(&mut *out.discards.lock());
                Ok(Some((out.tables, discards)))
            }
            Ok(false) => {
                out.discard();
                Ok(None)
            }
            Err(e) => {
                out.discard();
                Err(e)
            }
        }
    }

    fn merge_into(&self, version: &Version, task: &CompactionTask, out: &mut Outputs) -> Result<bool> {
        let mut sources: Vec<Box<dyn Cursor>> = Vec::with_capacity(task.top.len() + 1);
        for table in &task.top {
            sources.push(Box::new(table.cursor(false)?));
        }
        if !task.bottom.is_empty() {
            sources.push(Box::new(LevelCursor::new(task.bottom.clone(), false)?));
        }

        let discards = out.discards.clone();
        let mut merged = MergeCursor::new(sources, false).with_shadowed_hook(Box::new(
            move |_key, value| {
                if let Ok(Some(ptr)) = value.value_pointer() {
                    *discards.lock().entry(ptr.fid).or_insert(0) += ptr.len as u64;
                }
            },
        ));

        let deeper = &version.levels[task.target + 1..];
        let mut dropped_tombstones = 0usize;

        while merged.valid() {
            let key = merged.key();
            let value = merged.value();

            let droppable =
                value.is_delete() && !deeper.iter().any(|level| level.may_contain(key));
            if droppable {
                dropped_tombstones += 1;
            } else {
                if out.builder.is_none() {
                    if self.closing.load(Ordering::Acquire) {
                        return Ok(false);
                    }
                    let id = self.new_table_id();
                    out.builder = Some(TableBuilder::new(
                        table_path(&self.options.dir, id),
                        id,
                        self.table_options.clone(),
                    )?);
                }
                if let Some(b) = out.builder.as_mut() {
                    b.add(key, value)?;
                    if b.estimated_size() >= self.options.max_table_size {
                        out.finish_table()?;
                    }
                }
            }
            merged.advance()?;
        }
        out.finish_table()?;

        debug!(
            "Merged L{} into {} output tables, dropped {} tombstones",
            task.level,
            out.tables.len(),
            dropped_tombstones
        );
        Ok(true)
    }

    /// Per-level table ids and sizes
    pub fn level_summaries(&self) -> Vec<LevelSummary> {
        self.versions
            .current()
            .levels
            .iter()
            .map(|l| LevelSummary {
                level: l.level,
                tables: l.tables.iter().map(|t| (t.id(), t.size())).collect(),
                total_size: l.total_size,
            })
            .collect()
    }
}
