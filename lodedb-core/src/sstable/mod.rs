//! SSTable (Sorted String Table) implementation
//!
//! Immutable on-disk sorted runs of key → value-struct pairs with:
//! - Block-based format with optional LZ4 compression and per-block CRC32
//! - Sparse index of block key ranges
//! - Bloom filters for existence checks

mod block;
mod bloom;
mod builder;
mod iterator;
mod reader;

pub use block::{Block, BlockBuilder};
pub use bloom::BloomFilter;
pub use builder::TableBuilder;
pub use iterator::TableCursor;
pub use reader::Table;

use crate::Options;
use std::path::{Path, PathBuf};

/// SSTable file format version
pub const FORMAT_VERSION: u32 = 1;

/// Magic bytes at both ends of a table file
pub const MAGIC: &[u8; 4] = b"LODE";

/// Table file extension
pub const TABLE_EXT: &str = "sst";

/// SSTable configuration
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Block size in bytes
    pub block_size: usize,
    /// Enable compression
    pub compression: bool,
    /// Bloom filter bits per key
    pub bloom_bits_per_key: usize,
    /// Decoded blocks kept in the per-table cache
    pub block_cache_blocks: usize,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            block_size: crate::config::BLOCK_SIZE,
            compression: true,
            bloom_bits_per_key: crate::config::BLOOM_BITS_PER_KEY,
            block_cache_blocks: crate::config::BLOCK_CACHE_BLOCKS,
        }
    }
}

impl From<&Options> for TableOptions {
    fn from(opts: &Options) -> Self {
        Self {
            block_size: opts.block_size,
            compression: opts.compression,
            bloom_bits_per_key: opts.bloom_bits_per_key,
            block_cache_blocks: opts.block_cache_blocks,
        }
    }
}

/// Path of table `id` inside `dir`
pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.{}", id, TABLE_EXT))
}

/// Parse a table id out of a file name like `000042.sst`
pub fn parse_table_id(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")
        .filter(|stem| !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|stem| stem.parse().ok())
}
