//! Manifest: durable log of the live file set
//!
//! The manifest is an append-only sequence of checksummed changesets. The
//! live state is the fold of every changeset; it is consulted at open to
//! rebuild level membership and to tell orphaned files from live ones.
//!
//! Every append is fsynced before it returns, so a table is never exposed
//! before its `CreateTable` is durable and never unlinked before its
//! `DeleteTable` is.

mod record;

pub use record::ManifestChange;

use crate::{LodeError, Result};
use parking_lot::Mutex;
use record::Decoded;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Manifest file name
pub const MANIFEST_FILENAME: &str = "MANIFEST";
const MANIFEST_REWRITE_FILENAME: &str = "MANIFEST.rewrite";

/// Rewrite once this many deletions accumulated...
const REWRITE_DELETION_THRESHOLD: usize = 1_000;
/// ...and they outnumber live tables by this factor
const REWRITE_DELETION_RATIO: usize = 10;

/// Folded manifest state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestState {
    /// Live table id → level
    pub tables: BTreeMap<u64, usize>,
    /// Value log segments that were reclaimed
    pub deleted_vlogs: BTreeSet<u64>,
    /// Lowest table id never handed out
    pub next_table_id: u64,
    /// Lowest value log segment id never handed out
    pub next_vlog_fid: u64,
    /// Table creations recorded since the last rewrite
    pub creations: usize,
    /// Table deletions recorded since the last rewrite
    pub deletions: usize,
}

impl ManifestState {
    fn apply(&mut self, change: &ManifestChange) -> Result<()> {
        match *change {
            ManifestChange::CreateTable { id, level } => {
                if self.tables.insert(id, level).is_some() {
                    return Err(LodeError::Manifest(format!("table {} created twice", id)));
                }
                self.next_table_id = self.next_table_id.max(id + 1);
                self.creations += 1;
            }
            ManifestChange::DeleteTable { id } => {
                if self.tables.remove(&id).is_none() {
                    return Err(LodeError::Manifest(format!(
                        "deleting table {} which is not live",
                        id
                    )));
                }
                self.deletions += 1;
            }
            ManifestChange::DeleteValueLog { fid } => {
                self.deleted_vlogs.insert(fid);
                self.next_vlog_fid = self.next_vlog_fid.max(fid + 1);
            }
            ManifestChange::Watermark {
                next_table_id,
                next_vlog_fid,
            } => {
                self.next_table_id = self.next_table_id.max(next_table_id);
                self.next_vlog_fid = self.next_vlog_fid.max(next_vlog_fid);
            }
        }
        Ok(())
    }

    /// Changes that recreate this state from scratch
    fn snapshot_changes(&self) -> Vec<ManifestChange> {
        let mut changes = Vec::with_capacity(self.tables.len() + self.deleted_vlogs.len() + 1);
        changes.push(ManifestChange::Watermark {
            next_table_id: self.next_table_id,
            next_vlog_fid: self.next_vlog_fid,
        });
        changes.extend(
            self.tables
                .iter()
                .map(|(&id, &level)| ManifestChange::CreateTable { id, level }),
        );
        changes.extend(
            self.deleted_vlogs
                .iter()
                .map(|&fid| ManifestChange::DeleteValueLog { fid }),
        );
        changes
    }

    /// Live table ids in `level`
    pub fn level_tables(&self, level: usize) -> Vec<u64> {
        self.tables
            .iter()
            .filter(|(_, &l)| l == level)
            .map(|(&id, _)| id)
            .collect()
    }
}

/// Live set and orphans found by [`Manifest::reconcile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Live table id → level
    pub live: BTreeMap<u64, usize>,
    /// Table files on disk that no live entry refers to
    pub orphans: Vec<u64>,
}

struct Inner {
    /// Append handle; `None` when opened read-only
    file: Option<File>,
    state: ManifestState,
    /// Bytes of the file covered by committed records
    len: u64,
}

/// The manifest log, serialized behind one appender lock
pub struct Manifest {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl Manifest {
    /// Open (or create) the manifest in `dir` and fold its records.
    ///
    /// A torn final record is truncated away. A damaged record anywhere
    /// before the tail is corruption and fails the open.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILENAME);
        let created = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if created {
            sync_dir(dir)?;
        }

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let (state, len) = Self::fold(&data)?;

        if (len as usize) < data.len() {
            file.set_len(len)?;
            file.sync_all()?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(Inner {
                file: Some(file),
                state,
                len,
            }),
        })
    }

    /// Fold the manifest without changing the file.
    ///
    /// Another instance may be appending, so an incomplete tail is skipped
    /// instead of truncated. Every append fails with `ReadOnly`.
    pub fn open_read_only(dir: &Path) -> Result<Self> {
        let data = match std::fs::read(dir.join(MANIFEST_FILENAME)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (state, len) = Self::fold(&data)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(Inner {
                file: None,
                state,
                len,
            }),
        })
    }

    /// Fold every complete record, returning the state and the length of
    /// the valid prefix
    fn fold(data: &[u8]) -> Result<(ManifestState, u64)> {
        let mut state = ManifestState::default();
        let mut offset = 0usize;
        let mut records = 0usize;
        while offset < data.len() {
            match record::decode(&data[offset..])? {
                Decoded::Record { changes, len } => {
                    for change in &changes {
                        state.apply(change)?;
                    }
                    offset += len;
                    records += 1;
                }
                Decoded::Truncated => {
                    warn!(
                        "Manifest has a torn record at offset {}, dropping {} bytes",
                        offset,
                        data.len() - offset
                    );
                    break;
                }
                Decoded::BadHeader => {
                    if data[offset..].iter().all(|&b| b == 0) {
                        warn!(
                            "Manifest has a zero-filled tail at offset {}, dropping {} bytes",
                            offset,
                            data.len() - offset
                        );
                        break;
                    }
                    return Err(LodeError::Corruption(format!(
                        "manifest record at offset {} has a damaged length",
                        offset
                    )));
                }
                Decoded::BadChecksum {
                    expected,
                    actual,
                    len,
                } => {
                    if offset + len < data.len() {
                        return Err(LodeError::Corruption(format!(
                            "manifest record at offset {} has checksum {} but expected {}",
                            offset, actual, expected
                        )));
                    }
                    warn!(
                        "Manifest final record at offset {} fails its checksum, dropping it",
                        offset
                    );
                    break;
                }
            }
        }

        debug!(
            "Folded manifest: {} records, {} live tables",
            records,
            state.tables.len()
        );
        Ok((state, offset as u64))
    }

    /// Path of the manifest file
    pub fn path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILENAME)
    }

    /// Durably append one changeset; applied all together or not at all.
    ///
    /// A failed append leaves neither the state nor the file changed.
    pub fn append(&self, changes: &[ManifestChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(file) = inner.file.as_mut() else {
            return Err(LodeError::ReadOnly);
        };

        let mut next = inner.state.clone();
        for change in changes {
            next.apply(change)?;
        }
        let buf = record::encode(changes)?;

        let on_disk = file.metadata()?.len();
        if on_disk != inner.len {
            warn!(
                "Manifest holds {} bytes past its last committed record, discarding them",
                on_disk.saturating_sub(inner.len)
            );
            file.set_len(inner.len)?;
        }
        if let Err(e) = file.write_all(&buf).and_then(|()| file.sync_all()) {
            if let Err(undo) = file.set_len(inner.len) {
                warn!("Failed to roll back a partial manifest append: {}", undo);
            }
            return Err(e.into());
        }
        inner.len += buf.len() as u64;
        inner.state = next;

        if inner.state.deletions > REWRITE_DELETION_THRESHOLD
            && inner.state.deletions > REWRITE_DELETION_RATIO * inner.state.tables.len()
        {
            self.rewrite_locked(inner)?;
        }
        Ok(())
    }

    /// Snapshot of the folded state
    pub fn state(&self) -> ManifestState {
        self.inner.lock().state.clone()
    }

    /// Match the live set against the table ids present on disk.
    ///
    /// A live table missing from disk is unrecoverable; disk tables outside
    /// the live set are orphans.
    pub fn reconcile(&self, disk_table_ids: &[u64]) -> Result<Reconciled> {
        let inner = self.inner.lock();
        let on_disk: BTreeSet<u64> = disk_table_ids.iter().copied().collect();

        for id in inner.state.tables.keys() {
            if !on_disk.contains(id) {
                return Err(LodeError::Manifest(format!(
                    "live table {} is missing from {:?}",
                    id, self.dir
                )));
            }
        }

        let orphans = on_disk
            .into_iter()
            .filter(|id| !inner.state.tables.contains_key(id))
            .collect();
        Ok(Reconciled {
            live: inner.state.tables.clone(),
            orphans,
        })
    }

    /// Replace the log with a single snapshot record
    pub fn rewrite(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.rewrite_locked(&mut inner)
    }

    fn rewrite_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.file.is_none() {
            return Err(LodeError::ReadOnly);
        }
        let tmp_path = self.dir.join(MANIFEST_REWRITE_FILENAME);
        let final_path = self.dir.join(MANIFEST_FILENAME);

        let mut state = inner.state.clone();
        state.creations = state.tables.len();
        state.deletions = 0;
        let buf = record::encode(&state.snapshot_changes())?;

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.dir)?;

        inner.file = Some(OpenOptions::new().read(true).append(true).open(&final_path)?);
        inner.len = buf.len() as u64;
        inner.state = state;

        info!(
            "Rewrote manifest with {} live tables",
            inner.state.tables.len()
        );
        Ok(())
    }
}

/// fsync a directory so renames and unlinks inside it are durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_fold_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let manifest = Manifest::open(temp_dir.path()).unwrap();
            manifest
                .append(&[
                    ManifestChange::CreateTable { id: 1, level: 0 },
                    ManifestChange::CreateTable { id: 2, level: 0 },
                ])
                .unwrap();
            manifest
                .append(&[
                    ManifestChange::CreateTable { id: 3, level: 1 },
                    ManifestChange::DeleteTable { id: 1 },
                    ManifestChange::DeleteTable { id: 2 },
                ])
                .unwrap();
            manifest
                .append(&[ManifestChange::DeleteValueLog { fid: 4 }])
                .unwrap();
        }

        let manifest = Manifest::open(temp_dir.path()).unwrap();
        let state = manifest.state();
        assert_eq!(state.tables.len(), 1);
        assert_eq!(state.tables.get(&3), Some(&1));
        assert_eq!(state.level_tables(1), vec![3]);
        assert_eq!(state.next_table_id, 4);
        assert_eq!(state.next_vlog_fid, 5);
        assert!(state.deleted_vlogs.contains(&4));
    }

    #[test]
    fn test_invalid_changeset_is_rejected_whole() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::open(temp_dir.path()).unwrap();
        manifest
            .append(&[ManifestChange::CreateTable { id: 1, level: 0 }])
            .unwrap();

        let err = manifest
            .append(&[
                ManifestChange::CreateTable { id: 2, level: 1 },
                ManifestChange::DeleteTable { id: 9 },
            ])
            .unwrap_err();
        assert!(matches!(err, LodeError::Manifest(_)));
        assert!(!manifest.state().tables.contains_key(&2));
    }

    #[test]
    fn test_reconcile_finds_orphans() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::open(temp_dir.path()).unwrap();
        manifest
            .append(&[
                ManifestChange::CreateTable { id: 1, level: 0 },
                ManifestChange::CreateTable { id: 5, level: 2 },
            ])
            .unwrap();

        let reconciled = manifest.reconcile(&[1, 5, 6, 7]).unwrap();
        assert_eq!(reconciled.live.len(), 2);
        assert_eq!(reconciled.orphans, vec![6, 7]);

        let err = manifest.reconcile(&[1, 6]).unwrap_err();
        assert!(matches!(err, LodeError::Manifest(_)));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MANIFEST_FILENAME);
        {
            let manifest = Manifest::open(temp_dir.path()).unwrap();
            manifest
                .append(&[ManifestChange::CreateTable { id: 1, level: 0 }])
                .unwrap();
        }
        let valid_len = std::fs::metadata(&path).unwrap().len();
        {
            // The first bytes of a record whose write never completed
            let torn = record::encode(&[ManifestChange::CreateTable { id: 9, level: 0 }]).unwrap();
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&torn[..torn.len() - 3]).unwrap();
        }

        let manifest = Manifest::open(temp_dir.path()).unwrap();
        assert_eq!(manifest.state().tables.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);

        manifest
            .append(&[ManifestChange::CreateTable { id: 2, level: 0 }])
            .unwrap();
        drop(manifest);
        assert_eq!(
            Manifest::open(temp_dir.path()).unwrap().state().tables.len(),
            2
        );
    }

    #[test]
    fn test_zero_filled_tail_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MANIFEST_FILENAME);
        {
            let manifest = Manifest::open(temp_dir.path()).unwrap();
            manifest
                .append(&[ManifestChange::CreateTable { id: 1, level: 0 }])
                .unwrap();
        }
        let valid_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0u8; 64]).unwrap();
        }

        let manifest = Manifest::open(temp_dir.path()).unwrap();
        assert_eq!(manifest.state().tables.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
    }

    #[test]
    fn test_damaged_length_before_tail_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MANIFEST_FILENAME);
        {
            let manifest = Manifest::open(temp_dir.path()).unwrap();
            for id in 1..=3 {
                manifest
                    .append(&[ManifestChange::CreateTable { id, level: 0 }])
                    .unwrap();
            }
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[3] ^= 0x10;
        std::fs::write(&path, &bytes).unwrap();

        let err = Manifest::open(temp_dir.path()).err().unwrap();
        assert!(err.is_corruption());
        // Nothing was cut away
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len as u64);

        // Garbage that is not a record prefix is not a torn tail either
        bytes[3] ^= 0x10;
        bytes.extend_from_slice(&[0xFF; 100]);
        std::fs::write(&path, &bytes).unwrap();
        assert!(Manifest::open(temp_dir.path()).err().unwrap().is_corruption());
    }

    #[test]
    fn test_leftover_bytes_of_failed_append_are_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MANIFEST_FILENAME);
        let manifest = Manifest::open(temp_dir.path()).unwrap();
        manifest
            .append(&[ManifestChange::CreateTable { id: 1, level: 0 }])
            .unwrap();

        // Half of a record an interrupted append left behind
        let partial = record::encode(&[ManifestChange::CreateTable { id: 7, level: 0 }]).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&partial[..partial.len() / 2]).unwrap();
        }

        manifest
            .append(&[ManifestChange::CreateTable { id: 2, level: 0 }])
            .unwrap();
        drop(manifest);

        let state = Manifest::open(temp_dir.path()).unwrap().state();
        assert_eq!(state.tables.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_read_only_leaves_file_alone() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MANIFEST_FILENAME);
        let writer = Manifest::open(temp_dir.path()).unwrap();
        writer
            .append(&[ManifestChange::CreateTable { id: 1, level: 0 }])
            .unwrap();
        let partial = record::encode(&[ManifestChange::CreateTable { id: 2, level: 0 }]).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&partial[..5]).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();

        let reader = Manifest::open_read_only(temp_dir.path()).unwrap();
        assert_eq!(reader.state().tables.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
        assert!(matches!(
            reader.append(&[ManifestChange::DeleteTable { id: 1 }]),
            Err(LodeError::ReadOnly)
        ));
        assert!(matches!(reader.rewrite(), Err(LodeError::ReadOnly)));
    }

    #[test]
    fn test_checksum_failure_before_tail_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(MANIFEST_FILENAME);
        {
            let manifest = Manifest::open(temp_dir.path()).unwrap();
            manifest
                .append(&[ManifestChange::CreateTable { id: 1, level: 0 }])
                .unwrap();
            manifest
                .append(&[ManifestChange::CreateTable { id: 2, level: 0 }])
                .unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[record::RECORD_HEADER_SIZE] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = Manifest::open(temp_dir.path()).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_rewrite_preserves_state() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = Manifest::open(temp_dir.path()).unwrap();
        for id in 1..=20 {
            manifest
                .append(&[ManifestChange::CreateTable { id, level: 0 }])
                .unwrap();
        }
        for id in 1..=18 {
            manifest
                .append(&[ManifestChange::DeleteTable { id }])
                .unwrap();
        }
        let before = manifest.state();
        let size_before = std::fs::metadata(manifest.path()).unwrap().len();

        manifest.rewrite().unwrap();
        assert!(std::fs::metadata(manifest.path()).unwrap().len() < size_before);
        manifest
            .append(&[ManifestChange::CreateTable { id: 21, level: 1 }])
            .unwrap();
        drop(manifest);

        let state = Manifest::open(temp_dir.path()).unwrap().state();
        assert_eq!(state.tables.len(), 3);
        assert_eq!(state.next_table_id, 22);
        assert_eq!(state.tables.get(&19), before.tables.get(&19));
    }
}
