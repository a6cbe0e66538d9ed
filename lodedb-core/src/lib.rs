//! LodeDB Core - Embedded LSM Key-Value Storage Engine
//!
//! An ordered byte-string key-value store that keeps large values out of the
//! sorted tables:
//! - Point lookups and forward/reverse range iteration
//! - Crash durability through the value log, which doubles as the write-ahead log
//! - Leveled background compaction with crash-safe file lifecycle
//!
//! # Architecture
//!
//! - **Value Log**: Append-only segments holding every mutation; large values stay here
//! - **MemTable**: In-memory skip list receiving batched writes
//! - **SSTable**: Immutable sorted files on disk, organized in levels
//! - **Compaction**: Background merging of levels, dropping shadowed data
//! - **Manifest**: Durable record of the live table set
//!
//! ```no_run
//! use lodedb_core::{Database, Options};
//!
//! # fn main() -> lodedb_core::Result<()> {
//! let db = Database::open(Options::new("/tmp/lodedb"))?;
//! db.put("key1", "val1")?;
//! assert_eq!(db.get(b"key1")?.as_deref(), Some(&b"val1"[..]));
//! db.close()?;
//! # Ok(())
//! # }
//! ```

/// Log at info level when the options ask for verbosity, debug otherwise
macro_rules! verbose {
    ($opts:expr, $($arg:tt)*) => {
        if $opts.verbose {
            tracing::info!($($arg)*);
        } else {
            tracing::debug!($($arg)*);
        }
    };
}

pub mod compaction;
pub mod iterator;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod storage;
pub mod vlog;

mod error;
mod types;
mod version;

pub use error::{LodeError, Result};
pub use iterator::{DbIterator, IteratorOptions};
pub use storage::{Database, DatabaseStats, Options};
pub use types::*;

/// LodeDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Maximum MemTable size before flush (64MB)
    pub const MEMTABLE_SIZE_LIMIT: usize = 64 * 1024 * 1024;

    /// Maximum sorted table size (64MB)
    pub const MAX_TABLE_SIZE: u64 = 64 * 1024 * 1024;

    /// Level one target size (256MB)
    pub const LEVEL_ONE_SIZE: u64 = 256 * 1024 * 1024;

    /// SSTable block size (4KB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// Maximum SSTables in L0 before compaction
    pub const L0_COMPACTION_TRIGGER: usize = 5;

    /// Size ratio between levels
    pub const LEVEL_SIZE_RATIO: u64 = 10;

    /// Number of levels including L0
    pub const MAX_LEVELS: usize = 7;

    /// Immutable memtables queued before writes stall
    pub const NUM_MEMTABLES: usize = 5;

    /// Values this long or longer go to the value log
    pub const VALUE_THRESHOLD: usize = 32;

    /// Value log segment size (1GB)
    pub const VALUE_LOG_FILE_SIZE: u64 = 1024 * 1024 * 1024;

    /// Reclaimable fraction that makes a value log segment worth rewriting
    pub const VALUE_GC_RATIO: f64 = 0.5;

    /// Background value log GC interval (10 minutes)
    pub const VALUE_GC_INTERVAL_MS: u64 = 10 * 60 * 1000;

    /// Bloom filter bits per key (~1% false positives)
    pub const BLOOM_BITS_PER_KEY: usize = 10;

    /// Decoded blocks cached per table
    pub const BLOCK_CACHE_BLOCKS: usize = 64;
}
