//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Truncation was asked to grow the store.
    #[error("cannot truncate to {new_size} bytes, store holds {size}")]
    InvalidTruncate {
        /// The requested size.
        new_size: u64,
        /// The current storage size.
        size: u64,
    },

    /// The backend has been closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Returns true if the error was caused by an out-of-range request
    /// rather than by the medium.
    #[must_use]
    pub fn is_range_error(&self) -> bool {
        matches!(self, Self::ReadPastEnd { .. } | Self::InvalidTruncate { .. })
    }
}
