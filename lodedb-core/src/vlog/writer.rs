//! Appending batches to the value log

use super::{entry, ActiveSegment, LogFile, ValueLog};
use crate::{Entry, LodeError, Result, ValuePointer};
use bytes::BytesMut;
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

impl ValueLog {
    /// Append one batch and return a pointer per entry.
    ///
    /// The batch is written with a single write call and never spans two
    /// segments; rotation happens between batches.
    pub fn write(&self, entries: &[Entry]) -> Result<Vec<ValuePointer>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        if self.options.read_only {
            return Err(LodeError::ReadOnly);
        }

        let mut buf = BytesMut::with_capacity(
            entries
                .iter()
                .map(|e| entry::HEADER_SIZE + e.key.len() + e.value.len())
                .sum(),
        );
        let mut lens = Vec::with_capacity(entries.len());
        for (i, e) in entries.iter().enumerate() {
            lens.push(entry::encode(e, i + 1 == entries.len(), &mut buf));
        }

        let mut writer = self.writer.lock();
        if writer.offset > 0 && writer.offset + buf.len() as u64 > self.options.file_size {
            self.rotate(&mut writer)?;
        }

        (&writer.log.file).write_all(&buf)?;
        if self.options.sync_writes {
            writer.log.file.sync_data()?;
        }

        let fid = writer.log.fid();
        let mut offset = writer.offset;
        let pointers = lens
            .into_iter()
            .map(|len| {
                let ptr = ValuePointer::new(fid, offset, len);
                offset += len as u64;
                ptr
            })
            .collect();
        writer.offset = offset;
        Ok(pointers)
    }

    fn rotate(&self, writer: &mut ActiveSegment) -> Result<()> {
        writer.log.file.sync_all()?;

        let fid = writer.log.fid() + 1;
        let log = Arc::new(LogFile::open(&self.options.dir, fid, false)?);
        crate::manifest::sync_dir(&self.options.dir)?;
        self.files.write().insert(fid, log.clone());

        debug!(
            "Rotated value log from segment {} ({} bytes) to {}",
            writer.log.fid(),
            writer.offset,
            fid
        );
        writer.log = log;
        writer.offset = 0;
        Ok(())
    }

    /// Cut the active segment back to `len` bytes, dropping a torn tail
    pub(crate) fn truncate_active(&self, len: u64) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.log.file.set_len(len)?;
        writer.log.file.sync_all()?;
        writer.offset = len;
        Ok(())
    }
}
