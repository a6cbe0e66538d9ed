//! SSTable reader for point lookups and block access

use super::builder::{IndexEntry, FOOTER_SIZE, HEADER_SIZE};
use super::{Block, BloomFilter, TableCursor, TableOptions, FORMAT_VERSION, MAGIC};
use crate::{LodeError, Result, ValueStruct};
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// An open, immutable sorted table
///
/// Shared through `Arc`; once [`Table::mark_obsolete`] has been called the
/// file is unlinked when the last reference goes away.
pub struct Table {
    id: u64,
    path: PathBuf,
    file: File,
    file_size: u64,
    entry_count: u64,
    index: Vec<IndexEntry>,
    bloom_filter: BloomFilter,
    cache: Mutex<BlockCache>,
    obsolete: AtomicBool,
}

/// Small FIFO cache of decoded blocks
struct BlockCache {
    blocks: HashMap<usize, Arc<Block>>,
    order: VecDeque<usize>,
    max_blocks: usize,
}

impl BlockCache {
    fn new(max_blocks: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            order: VecDeque::new(),
            max_blocks,
        }
    }

    fn get(&self, idx: usize) -> Option<Arc<Block>> {
        self.blocks.get(&idx).cloned()
    }

    fn insert(&mut self, idx: usize, block: Arc<Block>) {
        if self.max_blocks == 0 || self.blocks.contains_key(&idx) {
            return;
        }
        while self.blocks.len() >= self.max_blocks {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.blocks.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(idx);
        self.blocks.insert(idx, block);
    }
}

impl Table {
    /// Open an SSTable file
    pub fn open(path: PathBuf, id: u64, options: TableOptions) -> Result<Self> {
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(LodeError::Corruption(format!(
                "table {:?} is only {} bytes",
                path, file_size
            )));
        }

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header, 0)?;
        if &header[..4] != MAGIC {
            return Err(LodeError::InvalidFormat("Invalid SSTable header".into()));
        }
        let version = (&header[4..]).get_u32_le();
        if version != FORMAT_VERSION {
            return Err(LodeError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer, file_size - FOOTER_SIZE as u64)?;
        if &footer[FOOTER_SIZE - 4..] != MAGIC {
            return Err(LodeError::InvalidFormat("Invalid SSTable magic".into()));
        }
        let mut cursor = &footer[..];
        let index_offset = cursor.get_u64_le();
        let index_size = cursor.get_u64_le();
        let bloom_offset = cursor.get_u64_le();
        let bloom_size = cursor.get_u64_le();
        let entry_count = cursor.get_u64_le();
        let index_checksum = cursor.get_u32_le();

        let mut index_data = vec![0u8; index_size as usize];
        file.read_exact_at(&mut index_data, index_offset)?;
        let actual = crc32fast::hash(&index_data);
        if actual != index_checksum {
            return Err(LodeError::ChecksumMismatch {
                expected: index_checksum,
                actual,
            });
        }
        let index = parse_index(Bytes::from(index_data))?;

        let mut bloom_data = vec![0u8; bloom_size as usize];
        file.read_exact_at(&mut bloom_data, bloom_offset)?;
        let bloom_filter = parse_bloom(bloom_data)?;

        debug!(
            "Opened table {} ({} bytes, {} blocks, {} entries)",
            id,
            file_size,
            index.len(),
            entry_count
        );

        Ok(Self {
            id,
            path,
            file,
            file_size,
            entry_count,
            index,
            bloom_filter,
            cache: Mutex::new(BlockCache::new(options.block_cache_blocks)),
            obsolete: AtomicBool::new(false),
        })
    }

    /// Table id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Number of entries
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Number of data blocks
    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// Smallest key, empty for an empty table
    pub fn smallest(&self) -> &[u8] {
        self.index.first().map(|e| e.first_key.as_ref()).unwrap_or(&[])
    }

    /// Biggest key, empty for an empty table
    pub fn biggest(&self) -> &[u8] {
        self.index.last().map(|e| e.last_key.as_ref()).unwrap_or(&[])
    }

    /// Check if the table's key range may hold `key`
    pub fn covers(&self, key: &[u8]) -> bool {
        !self.index.is_empty() && key >= self.smallest() && key <= self.biggest()
    }

    /// Check if the table's key range intersects `[lo, hi]`
    pub fn overlaps(&self, lo: &[u8], hi: &[u8]) -> bool {
        !self.index.is_empty() && self.smallest() <= hi && self.biggest() >= lo
    }

    /// Point lookup
    pub fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        if !self.covers(key) || !self.bloom_filter.may_contain(key) {
            return Ok(None);
        }
        let idx = self.index.partition_point(|e| e.last_key.as_ref() < key);
        if idx >= self.index.len() || self.index[idx].first_key.as_ref() > key {
            return Ok(None);
        }
        let block = self.block(idx)?;
        Ok(block.get(key).cloned())
    }

    /// Index of the first block whose last key is >= `key`
    pub fn seek_block(&self, key: &[u8]) -> usize {
        self.index.partition_point(|e| e.last_key.as_ref() < key)
    }

    /// Load (or fetch from cache) block `idx`
    pub fn block(&self, idx: usize) -> Result<Arc<Block>> {
        if let Some(block) = self.cache.lock().get(idx) {
            return Ok(block);
        }

        let entry = self.index.get(idx).ok_or_else(|| {
            LodeError::Internal(format!("block {} out of range in table {}", idx, self.id))
        })?;
        let mut data = vec![0u8; entry.size as usize];
        self.file.read_exact_at(&mut data, entry.offset)?;
        let block = Arc::new(Block::decode(&data).map_err(|e| match e {
            LodeError::ChecksumMismatch { expected, actual } => LodeError::Corruption(format!(
                "table {} block {} checksum mismatch: expected {}, got {}",
                self.id, idx, expected, actual
            )),
            other => other,
        })?);

        self.cache.lock().insert(idx, block.clone());
        Ok(block)
    }

    /// Cursor positioned at the first (or, if `reverse`, last) entry
    pub fn cursor(self: &Arc<Self>, reverse: bool) -> Result<TableCursor> {
        TableCursor::new(self.clone(), reverse)
    }

    /// Unlink the file once the last reference is dropped
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!("Deleted obsolete table {}", self.id),
                Err(e) => warn!("Failed to delete obsolete table {:?}: {}", self.path, e),
            }
        }
    }
}

fn parse_index(mut data: Bytes) -> Result<Vec<IndexEntry>> {
    let truncated = || LodeError::Corruption("truncated table index".into());
    if data.remaining() < 4 {
        return Err(truncated());
    }
    let count = data.get_u32_le() as usize;
    let mut entries = Vec::with_capacity(count);

    for _ in 0..count {
        if data.remaining() < 4 {
            return Err(truncated());
        }
        let first_len = data.get_u32_le() as usize;
        if data.remaining() < first_len + 4 {
            return Err(truncated());
        }
        let first_key = data.split_to(first_len);
        let last_len = data.get_u32_le() as usize;
        if data.remaining() < last_len + 12 {
            return Err(truncated());
        }
        let last_key = data.split_to(last_len);
        let offset = data.get_u64_le();
        let size = data.get_u32_le();
        entries.push(IndexEntry {
            first_key,
            last_key,
            offset,
            size,
        });
    }

    Ok(entries)
}

fn parse_bloom(data: Vec<u8>) -> Result<BloomFilter> {
    if data.is_empty() {
        return Err(LodeError::InvalidFormat("Bloom filter data too short".into()));
    }
    let num_hashes = data[0] as usize;
    Ok(BloomFilter::from_bytes(data[1..].to_vec(), num_hashes))
}
