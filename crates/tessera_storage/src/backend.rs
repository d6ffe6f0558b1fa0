//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level, append-only byte store.
///
/// A backend holds the raw bytes of one segment (or one changelog). It does
/// not interpret them; the volume layer owns the packed-entry and changelog
/// formats.
///
/// # Invariants
///
/// - `append` returns the offset where data was written, equal to `size()`
///   just before the call
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - `flush` hands buffered bytes to the OS, `sync` waits for the medium
///
/// Methods take `&self`: a segment is appended to by one flush task while
/// request and replication threads read from it.
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is not fully
    /// written, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the store and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes appended bytes out of process buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&self) -> StorageResult<()>;

    /// Blocks until appended bytes and metadata are on durable media.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;

    /// Returns the current size in bytes, which is the next append offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Drops every byte at or after `new_size`.
    ///
    /// Only used by recovery to cut a torn tail.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::InvalidTruncate`] if `new_size` is
    /// greater than the current size.
    fn truncate(&self, new_size: u64) -> StorageResult<()>;
}
