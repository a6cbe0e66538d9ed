//! Sequential reads of value log segments, used by replay and GC

use super::entry::{self, RecordHeader, HEADER_SIZE};
use super::{LogFile, ValueLog};
use crate::{Entry, LodeError, Result, ValuePointer};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One decoded record
pub(crate) struct Record {
    pub entry: Entry,
    pub ptr: ValuePointer,
    pub batch_end: bool,
}

/// Why a segment scan stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stop {
    /// Reached the end of the segment cleanly
    End,
    /// The segment ends inside a record
    Torn,
    /// A complete record failed its checksum
    BadChecksum,
}

/// Forward reader over the records of one segment
pub(crate) struct SegmentReader {
    fid: u64,
    reader: BufReader<std::fs::File>,
    offset: u64,
    len: u64,
    stop: Option<Stop>,
}

impl SegmentReader {
    pub fn new(log: &Arc<LogFile>, start: u64) -> Result<Self> {
        // A separate handle so concurrent scans do not share a file offset
        let mut file = std::fs::File::open(&log.path)?;
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            fid: log.fid(),
            reader: BufReader::new(file),
            offset: start,
            len: log.len()?,
            stop: None,
        })
    }

    /// Offset of the next record
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Why the scan ended; `None` while records remain
    pub fn stop(&self) -> Option<Stop> {
        self.stop
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Next record, or `None` once the scan stopped
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.stop.is_some() {
            return Ok(None);
        }
        if self.offset >= self.len {
            self.stop = Some(Stop::End);
            return Ok(None);
        }

        let mut header = [0u8; HEADER_SIZE];
        if !self.read_exact(&mut header)? {
            self.stop = Some(Stop::Torn);
            return Ok(None);
        }
        let parsed = RecordHeader::parse(&header);
        let record_len = parsed.record_len();
        if self.offset + record_len > self.len {
            self.stop = Some(Stop::Torn);
            return Ok(None);
        }

        let mut data = vec![0u8; record_len as usize];
        data[..HEADER_SIZE].copy_from_slice(&header);
        if !self.read_exact(&mut data[HEADER_SIZE..])? {
            self.stop = Some(Stop::Torn);
            return Ok(None);
        }

        match entry::decode(&data) {
            Ok((entry, batch_end)) => {
                let ptr = ValuePointer::new(self.fid, self.offset, record_len as u32);
                self.offset += record_len;
                Ok(Some(Record {
                    entry,
                    ptr,
                    batch_end,
                }))
            }
            Err(LodeError::ChecksumMismatch { .. }) => {
                self.stop = Some(Stop::BadChecksum);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl ValueLog {
    /// Feed every complete batch written after `head` to `apply`, in order.
    ///
    /// A torn or corrupt tail in the active segment is truncated back to
    /// the end of its last complete batch. The same damage in an older
    /// segment is corruption.
    pub fn replay<F>(&self, head: ValuePointer, mut apply: F) -> Result<()>
    where
        F: FnMut(Vec<(Entry, ValuePointer)>) -> Result<()>,
    {
        let segments: Vec<Arc<LogFile>> = self
            .files
            .read()
            .range(head.fid..)
            .map(|(_, log)| log.clone())
            .collect();
        let active_fid = self.active_fid();

        let mut batches = 0usize;
        let mut records = 0usize;
        for log in segments {
            let start = if log.fid() == head.fid { head.end() } else { 0 };
            let mut reader = SegmentReader::new(&log, start)?;
            let mut batch = Vec::new();
            let mut batch_start = start;

            while let Some(record) = reader.next_record()? {
                batch.push((record.entry, record.ptr));
                if record.batch_end {
                    records += batch.len();
                    batches += 1;
                    apply(std::mem::take(&mut batch))?;
                    batch_start = reader.offset();
                }
            }

            let damaged = reader.stop() != Some(Stop::End) || !batch.is_empty();
            if damaged && self.is_read_only() && log.fid() == active_fid {
                // The lock holder may still be writing this batch
                debug!(
                    "Stopping replay of segment {} at {}, its tail is incomplete",
                    log.fid(),
                    batch_start
                );
            } else if damaged {
                if log.fid() != active_fid {
                    return Err(LodeError::Corruption(format!(
                        "value log segment {} is damaged at offset {}",
                        log.fid(),
                        batch_start
                    )));
                }
                warn!(
                    "Value log segment {} has a torn tail ({:?}), truncating from {} to {}",
                    log.fid(),
                    reader.stop(),
                    log.len()?,
                    batch_start
                );
                self.truncate_active(batch_start)?;
            }
        }

        info!(
            "Replayed {} batches ({} records) from the value log after {}",
            batches, records, head
        );
        Ok(())
    }

    /// Read a whole segment, records in order
    pub(crate) fn segment_reader(&self, fid: u64) -> Result<SegmentReader> {
        let log = self.segment(fid)?;
        SegmentReader::new(&log, 0)
    }
}
