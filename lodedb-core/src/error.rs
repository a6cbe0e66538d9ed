//! Error types for LodeDB

use thiserror::Error;

/// Result type alias for LodeDB operations
pub type Result<T> = std::result::Result<T, LodeError>;

/// LodeDB error types
#[derive(Error, Debug)]
pub enum LodeError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The manifest disagrees with the files in the directory
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Caller supplied an unusable key or batch
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation issued against a closed database
    #[error("Database is closed")]
    Closed,

    /// Another instance holds the directory lock; this one only reads
    #[error("Database is open read-only")]
    ReadOnly,

    /// A value log segment vanished under a reader; the read must be retried
    /// against a fresh snapshot.
    #[error("Value log segment {0} was retired, retry the read")]
    Retry(u64),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LodeError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, LodeError::Io(_) | LodeError::Retry(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            LodeError::Corruption(_) | LodeError::ChecksumMismatch { .. }
        )
    }
}

impl From<bincode::Error> for LodeError {
    fn from(e: bincode::Error) -> Self {
        LodeError::InvalidFormat(e.to_string())
    }
}
