//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// An in-memory byte store.
///
/// Used by volumes that have no data directory and by tests. Reads take a
/// shared lock, appends an exclusive one.
///
/// # Example
///
/// ```rust
/// use tessera_storage::{StorageBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// assert_eq!(backend.append(b"abc").unwrap(), 0);
/// assert_eq!(backend.append(b"de").unwrap(), 3);
/// assert_eq!(backend.size().unwrap(), 5);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding pre-existing bytes.
    ///
    /// Recovery tests use this to simulate torn writes.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of everything stored.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset as usize..end as usize].to_vec())
    }

    fn append(&self, new_data: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate { new_size, size });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn append_returns_previous_size() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
    }

    #[test]
    fn read_partial_range() {
        let backend = InMemoryBackend::with_data(b"hello world".to_vec());
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
        assert!(backend.read_at(11, 0).unwrap().is_empty());
    }

    #[test]
    fn read_extending_past_end_fails() {
        let backend = InMemoryBackend::with_data(b"hello".to_vec());
        assert!(matches!(
            backend.read_at(3, 10),
            Err(StorageError::ReadPastEnd { size: 5, .. })
        ));
        assert!(matches!(
            backend.read_at(10, 0),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn truncate_drops_tail_only() {
        let backend = InMemoryBackend::with_data(b"hello world".to_vec());
        backend.truncate(5).unwrap();
        assert_eq!(backend.data(), b"hello");

        let err = backend.truncate(100).unwrap_err();
        assert!(err.is_range_error());
    }

    #[test]
    fn concurrent_readers_see_stable_prefix() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.append(b"stable").unwrap();

        let writer = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                for _ in 0..100 {
                    backend.append(b"more").unwrap();
                }
            })
        };

        for _ in 0..100 {
            assert_eq!(backend.read_at(0, 6).unwrap(), b"stable");
        }
        writer.join().unwrap();
        assert_eq!(backend.size().unwrap(), 6 + 400);
    }

    proptest! {
        #[test]
        fn appended_chunks_read_back(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..64), 1..16)) {
            let backend = InMemoryBackend::new();
            let offsets: Vec<u64> = chunks.iter().map(|c| backend.append(c).unwrap()).collect();
            for (chunk, offset) in chunks.iter().zip(offsets) {
                prop_assert_eq!(&backend.read_at(offset, chunk.len()).unwrap(), chunk);
            }
        }
    }
}
