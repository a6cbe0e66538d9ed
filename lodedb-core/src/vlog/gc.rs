//! Value log garbage collection
//!
//! A segment moves through these states:
//! - building: live entries are being rewritten through the write path
//! - committed: `DeleteValueLog` is durable in the manifest
//! - retiring: gone from the segment map, readers still holding it finish
//! - removed: the last reference dropped and the file was unlinked
//!
//! A segment only leaves `building` once the flushed head has moved past
//! every rewritten record, so a crash before that point replays the
//! rewrites from the log and leaves the old segment in place.

use super::reader::Record;
use super::ValueLog;
use crate::manifest::ManifestChange;
use crate::{is_reserved_key, Entry, LodeError, Result, ValuePointer, ValueStruct};
use rand::seq::SliceRandom;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

/// Records examined when estimating how much of a segment is garbage
const SAMPLE_RECORDS: usize = 10_000;
/// Fraction of a segment's bytes examined when estimating
const SAMPLE_SIZE_RATIO: u64 = 10;
/// Live entries rewritten per write batch
const REWRITE_BATCH: usize = 256;

/// What GC needs from the engine
pub trait GcTarget {
    /// Head pointer durable in flushed tables
    fn flushed_head(&self) -> ValuePointer;

    /// Stored form of `key` in the latest version
    fn current_value(&self, key: &[u8]) -> Result<Option<ValueStruct>>;

    /// Write `entries` again through the write path, keeping only those
    /// whose key still points at the paired old location. Returns the
    /// pointer of the last record written, if any.
    fn rewrite(&self, entries: Vec<(Entry, ValuePointer)>) -> Result<Option<ValuePointer>>;

    /// Durably record changes in the manifest
    fn log_changes(&self, changes: &[ManifestChange]) -> Result<()>;

    /// Whether the engine is shutting down
    fn is_closing(&self) -> bool;
}

/// A rewritten segment waiting for the flushed head to pass `barrier`
#[derive(Debug, Clone, Copy)]
struct PendingDeletion {
    fid: u64,
    barrier: ValuePointer,
}

#[derive(Debug, Default)]
pub(crate) struct GcState {
    pending: Vec<PendingDeletion>,
}

impl ValueLog {
    /// Run one GC round.
    ///
    /// Picks a candidate segment older than the flushed head, estimates its
    /// garbage by sampling, and rewrites its live entries when the
    /// reclaimable fraction reaches `discard_ratio` (0 rewrites any
    /// candidate). Returns whether a segment was rewritten.
    pub fn garbage_collect(&self, target: &dyn GcTarget, discard_ratio: f64) -> Result<bool> {
        let mut state = self.gc.lock();
        self.retire_ready(&mut state, target)?;

        let head = target.flushed_head();
        let Some(fid) = self.pick_candidate(&state, head) else {
            debug!("No value log segment eligible for GC (head {})", head);
            return Ok(false);
        };

        if discard_ratio > 0.0 {
            let (live, total) = self.sample(fid, target)?;
            let reclaimable = if total == 0 {
                1.0
            } else {
                1.0 - live as f64 / total as f64
            };
            if reclaimable < discard_ratio {
                debug!(
                    "Skipping value log segment {}: {:.2} reclaimable < {:.2}",
                    fid, reclaimable, discard_ratio
                );
                return Ok(false);
            }
        }

        let Some(barrier) = self.rewrite_segment(fid, target)? else {
            return Ok(false);
        };
        self.discard.lock().remove(&fid);
        state.pending.push(PendingDeletion { fid, barrier });
        self.retire_ready(&mut state, target)?;
        Ok(true)
    }

    /// Finish deletions whose rewrites the flushed head has passed.
    ///
    /// Does nothing while a GC round is running; that round retires what
    /// is ready when it ends.
    pub fn complete_deletions(&self, target: &dyn GcTarget) -> Result<()> {
        match self.gc.try_lock() {
            Some(mut state) => self.retire_ready(&mut state, target),
            None => Ok(()),
        }
    }

    /// Segments rewritten but not yet reclaimed
    pub fn pending_deletions(&self) -> Vec<u64> {
        self.gc.lock().pending.iter().map(|p| p.fid).collect()
    }

    fn retire_ready(&self, state: &mut GcState, target: &dyn GcTarget) -> Result<()> {
        let head = target.flushed_head();
        let (ready, waiting): (Vec<_>, Vec<_>) = state
            .pending
            .iter()
            .copied()
            .partition(|p| (p.barrier.fid, p.barrier.offset) <= (head.fid, head.offset));
        if ready.is_empty() {
            return Ok(());
        }

        self.sync()?;
        let changes: Vec<ManifestChange> = ready
            .iter()
            .map(|p| ManifestChange::DeleteValueLog { fid: p.fid })
            .collect();
        target.log_changes(&changes)?;

        let mut files = self.files.write();
        for pending in &ready {
            if let Some(log) = files.remove(&pending.fid) {
                log.retired.store(true, Ordering::Release);
                info!("Retired value log segment {}", pending.fid);
            }
        }
        state.pending = waiting;
        Ok(())
    }

    fn pick_candidate(&self, state: &GcState, head: ValuePointer) -> Option<u64> {
        let active = self.active_fid();
        let candidates: Vec<u64> = self
            .files
            .read()
            .keys()
            .copied()
            .filter(|&fid| fid < head.fid && fid != active)
            .filter(|fid| !state.pending.iter().any(|p| p.fid == *fid))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let discard = self.discard.lock();
        let best = candidates
            .iter()
            .filter_map(|fid| discard.get(fid).map(|bytes| (*bytes, *fid)))
            .filter(|(bytes, _)| *bytes > 0)
            .max();
        match best {
            Some((_, fid)) => Some(fid),
            None => candidates.choose(&mut rand::thread_rng()).copied(),
        }
    }

    fn is_live(record: &Record, target: &dyn GcTarget) -> Result<bool> {
        if record.entry.is_delete() || is_reserved_key(&record.entry.key) {
            return Ok(false);
        }
        match target.current_value(&record.entry.key)? {
            Some(vs) => Ok(vs.value_pointer()? == Some(record.ptr)),
            None => Ok(false),
        }
    }

    /// Estimate (live bytes, total bytes) over a prefix of the segment
    fn sample(&self, fid: u64, target: &dyn GcTarget) -> Result<(u64, u64)> {
        let mut reader = self.segment_reader(fid)?;
        let size_window = (self.options.file_size / SAMPLE_SIZE_RATIO).max(1);
        let (mut live, mut total, mut count) = (0u64, 0u64, 0usize);

        while let Some(record) = reader.next_record()? {
            let len = record.ptr.len as u64;
            if Self::is_live(&record, target)? {
                live += len;
            }
            total += len;
            count += 1;
            if count >= SAMPLE_RECORDS || total >= size_window {
                break;
            }
        }
        debug!(
            "Sampled value log segment {}: {} of {} bytes live over {} records",
            fid, live, total, count
        );
        Ok((live, total))
    }

    /// Rewrite every live entry of `fid`; returns the deletion barrier, or
    /// `None` if the round was interrupted by shutdown.
    fn rewrite_segment(&self, fid: u64, target: &dyn GcTarget) -> Result<Option<ValuePointer>> {
        let mut reader = self.segment_reader(fid)?;
        let mut batch = Vec::with_capacity(REWRITE_BATCH);
        let mut barrier = ValuePointer::default();
        let (mut scanned, mut rewritten) = (0usize, 0usize);

        loop {
            let record = reader.next_record()?;
            let done = record.is_none();
            if let Some(record) = record {
                scanned += 1;
                if Self::is_live(&record, target)? {
                    batch.push((record.entry, record.ptr));
                }
            }

            if batch.len() >= REWRITE_BATCH || (done && !batch.is_empty()) {
                if target.is_closing() {
                    info!("GC of value log segment {} interrupted by shutdown", fid);
                    return Ok(None);
                }
                rewritten += batch.len();
                if let Some(last) = target.rewrite(std::mem::take(&mut batch))? {
                    barrier = last;
                }
            }
            if done {
                break;
            }
        }

        if reader.stop() != Some(super::reader::Stop::End) {
            return Err(LodeError::Corruption(format!(
                "value log segment {} is damaged at offset {}",
                fid,
                reader.offset()
            )));
        }

        info!(
            "Rewrote value log segment {}: {} live of {} records",
            fid, rewritten, scanned
        );
        Ok(Some(barrier))
    }
}
