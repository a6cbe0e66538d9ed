//! Value log implementation
//!
//! The value log is the engine's write-ahead log: every mutation is
//! appended here before it reaches a memtable. Values at or above the
//! inline threshold stay here for good and the LSM tree stores a pointer
//! to them, which keeps sorted tables small and compaction cheap.
//!
//! Segments are named `{fid:06}.vlog` and never reused. Old segments are
//! reclaimed by [`ValueLog::garbage_collect`].

mod entry;
mod gc;
mod reader;
mod writer;

pub use gc::GcTarget;

use crate::{Entry, LodeError, Options, Result, ValuePointer};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Value log file extension
pub const VLOG_EXT: &str = "vlog";

/// Value log configuration
#[derive(Debug, Clone)]
pub struct VlogOptions {
    /// Directory holding the segments
    pub dir: PathBuf,
    /// Segment size in bytes before rotation
    pub file_size: u64,
    /// fsync after every write
    pub sync_writes: bool,
    /// Open existing segments for reading only; nothing is created or removed
    pub read_only: bool,
}

impl From<&Options> for VlogOptions {
    fn from(opts: &Options) -> Self {
        Self {
            dir: opts.dir.clone(),
            file_size: opts.value_log_file_size,
            sync_writes: opts.sync_writes,
            read_only: false,
        }
    }
}

/// Path of segment `fid` inside `dir`
pub fn vlog_path(dir: &Path, fid: u64) -> PathBuf {
    dir.join(format!("{:06}.{}", fid, VLOG_EXT))
}

/// Parse a segment id out of a file name like `000003.vlog`
pub fn parse_vlog_fid(name: &str) -> Option<u64> {
    name.strip_suffix(".vlog")
        .filter(|stem| !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|stem| stem.parse().ok())
}

/// One open segment.
///
/// Shared by `Arc`; a retired segment is unlinked when the last reader
/// lets go of it.
pub(crate) struct LogFile {
    fid: u64,
    path: PathBuf,
    file: File,
    retired: AtomicBool,
}

impl LogFile {
    fn open(dir: &Path, fid: u64, read_only: bool) -> Result<Self> {
        let path = vlog_path(dir, fid);
        let file = if read_only {
            File::open(&path)?
        } else {
            OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?
        };
        Ok(Self {
            fid,
            path,
            file,
            retired: AtomicBool::new(false),
        })
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        if self.retired.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => info!("Removed value log segment {}", self.fid),
                Err(e) => warn!("Failed to remove value log segment {:?}: {}", self.path, e),
            }
        }
    }
}

/// Segment being appended to
struct ActiveSegment {
    log: Arc<LogFile>,
    offset: u64,
}

/// The segmented value log
pub struct ValueLog {
    options: VlogOptions,
    files: RwLock<BTreeMap<u64, Arc<LogFile>>>,
    writer: Mutex<ActiveSegment>,
    /// Bytes known to be garbage per segment, reported by compaction
    discard: Mutex<HashMap<u64, u64>>,
    gc: Mutex<gc::GcState>,
}

impl ValueLog {
    /// Open the value log.
    ///
    /// Segments listed in `deleted` were reclaimed before a crash could
    /// remove them and are deleted now. New segment ids start no lower
    /// than `next_fid`. A read-only log skips reclaimed segments instead.
    pub fn open(options: VlogOptions, deleted: &BTreeSet<u64>, next_fid: u64) -> Result<Self> {
        if !options.read_only {
            fs::create_dir_all(&options.dir)?;
        }

        let mut files = BTreeMap::new();
        for fid in Self::list_segments(&options.dir)? {
            if deleted.contains(&fid) {
                if options.read_only {
                    continue;
                }
                let path = vlog_path(&options.dir, fid);
                match fs::remove_file(&path) {
                    Ok(()) => info!("Removed reclaimed value log segment {}", fid),
                    Err(e) => warn!("Failed to remove reclaimed segment {:?}: {}", path, e),
                }
                continue;
            }
            files.insert(
                fid,
                Arc::new(LogFile::open(&options.dir, fid, options.read_only)?),
            );
        }

        let active = match files.values().next_back() {
            Some(log) => log.clone(),
            None if options.read_only => {
                return Err(LodeError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no value log segment in {:?}", options.dir),
                )));
            }
            None => {
                let fid = next_fid.max(1);
                let log = Arc::new(LogFile::open(&options.dir, fid, false)?);
                crate::manifest::sync_dir(&options.dir)?;
                files.insert(fid, log.clone());
                log
            }
        };
        let offset = active.len()?;

        debug!(
            "Opened value log with {} segments, appending to {} at {}",
            files.len(),
            active.fid(),
            offset
        );

        Ok(Self {
            options,
            files: RwLock::new(files),
            writer: Mutex::new(ActiveSegment {
                log: active,
                offset,
            }),
            discard: Mutex::new(HashMap::new()),
            gc: Mutex::new(gc::GcState::default()),
        })
    }

    fn list_segments(dir: &Path) -> Result<Vec<u64>> {
        let mut fids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(fid) = entry.file_name().to_str().and_then(parse_vlog_fid) {
                fids.push(fid);
            }
        }
        fids.sort_unstable();
        Ok(fids)
    }

    /// Ids of the segments currently readable
    pub fn segment_ids(&self) -> Vec<u64> {
        self.files.read().keys().copied().collect()
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Id of the segment being appended to
    pub fn active_fid(&self) -> u64 {
        self.writer.lock().log.fid()
    }

    /// Lowest id a new segment may take
    pub fn next_fid(&self) -> u64 {
        self.active_fid() + 1
    }

    fn segment(&self, fid: u64) -> Result<Arc<LogFile>> {
        self.files.read().get(&fid).cloned().ok_or(LodeError::Retry(fid))
    }

    /// Read the entry `ptr` points at.
    ///
    /// Fails with `Retry` when the segment has been reclaimed; the caller
    /// must look the key up again to get its new location.
    pub fn read_entry(&self, ptr: &ValuePointer) -> Result<Entry> {
        let log = self.segment(ptr.fid)?;
        let mut buf = vec![0u8; ptr.len as usize];
        log.read_at(&mut buf, ptr.offset)?;
        let (entry, _) = entry::decode(&buf).map_err(|e| match e {
            LodeError::ChecksumMismatch { expected, actual } => LodeError::Corruption(format!(
                "value log record {} checksum mismatch: expected {}, got {}",
                ptr, expected, actual
            )),
            other => other,
        })?;
        Ok(entry)
    }

    /// Read the value `ptr` points at
    pub fn read(&self, ptr: &ValuePointer) -> Result<Bytes> {
        Ok(self.read_entry(ptr)?.value)
    }

    /// Note `bytes` of garbage in segment `fid`
    pub fn record_discard(&self, fid: u64, bytes: u64) {
        *self.discard.lock().entry(fid).or_insert(0) += bytes;
    }

    /// Garbage bytes reported so far per segment
    pub fn discard_stats(&self) -> HashMap<u64, u64> {
        self.discard.lock().clone()
    }

    /// fsync the active segment
    pub fn sync(&self) -> Result<()> {
        self.writer.lock().log.file.sync_all()?;
        Ok(())
    }
}
