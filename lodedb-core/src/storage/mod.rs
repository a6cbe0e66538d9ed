//! Storage engine - coordinates all storage components

mod database;
mod lock;
mod recovery;
mod workers;

pub use database::{Database, DatabaseStats};

use crate::{LodeError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine options
///
/// Deserializable so callers can load it from whatever configuration source
/// they like; every field falls back to its default when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Data directory
    pub dir: PathBuf,
    /// Maximum sorted table size in bytes; compaction splits output here
    pub max_table_size: u64,
    /// Memtable size limit in bytes before it is rotated and flushed
    pub memtable_size: usize,
    /// Target size of level one in bytes
    pub level_one_size: u64,
    /// Size multiplier between consecutive levels
    pub level_size_multiplier: u64,
    /// Number of levels, level 0 included
    pub max_levels: usize,
    /// L0 compaction trigger (number of tables)
    pub num_level_zero_tables: usize,
    /// Immutable memtables allowed to queue before writers stall
    pub num_memtables: usize,
    /// Values at least this long are stored in the value log; 0 sends every value there
    pub value_threshold: usize,
    /// Value log segment size in bytes before rotation
    pub value_log_file_size: u64,
    /// Reclaimable fraction of a segment required before GC rewrites it; 0 rewrites any candidate
    pub value_gc_ratio: f64,
    /// Interval of the background value log GC; 0 disables the worker
    pub value_gc_interval_ms: u64,
    /// fsync the value log before a write returns
    pub sync_writes: bool,
    /// Disable background compaction
    pub do_not_compact: bool,
    /// Log flush and compaction detail at info level
    pub verbose: bool,
    /// Sorted table block size in bytes
    pub block_size: usize,
    /// Bloom filter bits per key
    pub bloom_bits_per_key: usize,
    /// LZ4-compress table blocks
    pub compression: bool,
    /// Decoded blocks cached per table
    pub block_cache_blocks: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            max_table_size: crate::config::MAX_TABLE_SIZE,
            memtable_size: crate::config::MEMTABLE_SIZE_LIMIT,
            level_one_size: crate::config::LEVEL_ONE_SIZE,
            level_size_multiplier: crate::config::LEVEL_SIZE_RATIO,
            max_levels: crate::config::MAX_LEVELS,
            num_level_zero_tables: crate::config::L0_COMPACTION_TRIGGER,
            num_memtables: crate::config::NUM_MEMTABLES,
            value_threshold: crate::config::VALUE_THRESHOLD,
            value_log_file_size: crate::config::VALUE_LOG_FILE_SIZE,
            value_gc_ratio: crate::config::VALUE_GC_RATIO,
            value_gc_interval_ms: crate::config::VALUE_GC_INTERVAL_MS,
            sync_writes: false,
            do_not_compact: false,
            verbose: false,
            block_size: crate::config::BLOCK_SIZE,
            bloom_bits_per_key: crate::config::BLOOM_BITS_PER_KEY,
            compression: true,
            block_cache_blocks: crate::config::BLOCK_CACHE_BLOCKS,
        }
    }
}

impl Options {
    /// Options rooted at `dir` with every other field defaulted
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Reject option combinations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(LodeError::Config("dir must not be empty".into()));
        }
        if self.max_table_size == 0 {
            return Err(LodeError::Config("max_table_size must be positive".into()));
        }
        if self.memtable_size == 0 {
            return Err(LodeError::Config("memtable_size must be positive".into()));
        }
        if self.level_one_size == 0 {
            return Err(LodeError::Config("level_one_size must be positive".into()));
        }
        if self.level_size_multiplier < 2 {
            return Err(LodeError::Config(
                "level_size_multiplier must be at least 2".into(),
            ));
        }
        if self.max_levels < 2 {
            return Err(LodeError::Config("max_levels must be at least 2".into()));
        }
        if self.num_level_zero_tables == 0 {
            return Err(LodeError::Config(
                "num_level_zero_tables must be positive".into(),
            ));
        }
        if self.num_memtables == 0 {
            return Err(LodeError::Config("num_memtables must be positive".into()));
        }
        if self.value_log_file_size == 0 {
            return Err(LodeError::Config(
                "value_log_file_size must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.value_gc_ratio) {
            return Err(LodeError::Config(format!(
                "value_gc_ratio must be in [0, 1), got {}",
                self.value_gc_ratio
            )));
        }
        if self.block_size == 0 {
            return Err(LodeError::Config("block_size must be positive".into()));
        }
        Ok(())
    }

    /// Byte capacity of a level >= 1
    pub fn level_capacity(&self, level: usize) -> u64 {
        debug_assert!(level >= 1);
        let exp = (level - 1) as u32;
        self.level_one_size
            .saturating_mul(self.level_size_multiplier.saturating_pow(exp))
    }
}
