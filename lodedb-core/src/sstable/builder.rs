//! SSTable builder for writing sorted data to disk
//!
//! Layout:
//! - header: magic, format version
//! - data blocks
//! - index: one `(first key, last key, offset, size)` per block
//! - bloom filter
//! - footer: index/bloom locations, entry count, index checksum, magic

use super::block::BlockBuilder;
use super::{BloomFilter, Table, TableOptions, FORMAT_VERSION, MAGIC};
use crate::{Result, ValueStruct};
use bytes::{BufMut, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Footer size in bytes
pub(crate) const FOOTER_SIZE: usize = 48;
/// Header size in bytes
pub(crate) const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone)]
pub(crate) struct IndexEntry {
    pub first_key: Bytes,
    pub last_key: Bytes,
    pub offset: u64,
    pub size: u32,
}

/// SSTable builder
///
/// Blocks are streamed to disk as they fill; nothing is durable until
/// [`TableBuilder::finish`] fsyncs the file.
pub struct TableBuilder {
    options: TableOptions,
    path: PathBuf,
    id: u64,
    file: BufWriter<File>,
    offset: u64,

    block: BlockBuilder,
    index_entries: Vec<IndexEntry>,
    key_hashes: Vec<u32>,
    entry_count: u64,
}

impl TableBuilder {
    /// Create a new SSTable builder writing to `path`, which must not exist
    pub fn new(path: PathBuf, id: u64, options: TableOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut file = BufWriter::new(file);

        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        header.put_slice(MAGIC);
        header.put_u32_le(FORMAT_VERSION);
        file.write_all(&header)?;

        Ok(Self {
            options,
            path,
            id,
            file,
            offset: HEADER_SIZE as u64,
            block: BlockBuilder::new(),
            index_entries: Vec::new(),
            key_hashes: Vec::new(),
            entry_count: 0,
        })
    }

    /// Table id being built
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Add an entry; keys must arrive in strictly ascending order
    pub fn add(&mut self, key: &[u8], value: &ValueStruct) -> Result<()> {
        self.block.add(key, value);
        self.key_hashes.push(BloomFilter::hash(key));
        self.entry_count += 1;

        if self.block.estimated_size() >= self.options.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Bytes written so far plus the pending block
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.estimated_size() as u64
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let block = std::mem::take(&mut self.block);
        let (bytes, first_key, last_key) = block.finish(self.options.compression);
        self.file.write_all(&bytes)?;
        self.index_entries.push(IndexEntry {
            first_key,
            last_key,
            offset: self.offset,
            size: bytes.len() as u32,
        });
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Finish building, fsync, and open the table for reading
    pub fn finish(mut self) -> Result<Table> {
        self.flush_block()?;

        let index = encode_index(&self.index_entries);
        let index_offset = self.offset;
        self.file.write_all(&index)?;
        self.offset += index.len() as u64;

        let bloom = BloomFilter::build(&self.key_hashes, self.options.bloom_bits_per_key);
        let mut bloom_buf = BytesMut::new();
        bloom_buf.put_u8(bloom.num_hashes() as u8);
        bloom_buf.put_slice(bloom.as_bytes());
        let bloom_offset = self.offset;
        self.file.write_all(&bloom_buf)?;
        self.offset += bloom_buf.len() as u64;

        let mut footer = BytesMut::with_capacity(FOOTER_SIZE);
        footer.put_u64_le(index_offset);
        footer.put_u64_le(index.len() as u64);
        footer.put_u64_le(bloom_offset);
        footer.put_u64_le(bloom_buf.len() as u64);
        footer.put_u64_le(self.entry_count);
        footer.put_u32_le(crc32fast::hash(&index));
        footer.put_slice(MAGIC);
        self.file.write_all(&footer)?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        drop(self.file);

        Table::open(self.path, self.id, self.options)
    }

    /// Discard a partially built table
    pub fn abandon(self) -> Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

fn encode_index(entries: &[IndexEntry]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        buf.put_u32_le(entry.first_key.len() as u32);
        buf.put_slice(&entry.first_key);
        buf.put_u32_le(entry.last_key.len() as u32);
        buf.put_slice(&entry.last_key);
        buf.put_u64_le(entry.offset);
        buf.put_u32_le(entry.size);
    }
    buf.freeze()
}
