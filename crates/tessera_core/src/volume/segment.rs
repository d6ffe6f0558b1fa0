//! Append-only segments.

use crate::error::{CoreError, CoreResult};
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// Width of generated segment names.
const SEGMENT_NAME_WIDTH: usize = 19;

/// Name of the segment with numeric id `id`, zero padded to 19 digits.
#[must_use]
pub fn segment_name(id: u64) -> String {
    format!("{id:0width$}", width = SEGMENT_NAME_WIDTH)
}

/// Parses a generated segment name back to its id.
#[must_use]
pub fn parse_segment_id(name: &str) -> Option<u64> {
    if name.len() != SEGMENT_NAME_WIDTH {
        return None;
    }
    name.parse().ok()
}

/// Rejects names that cannot be used as a file name.
pub(crate) fn validate_segment_name(name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidSegmentName {
            segment: name.to_string(),
        })
    }
}

/// A bounded, append-only region of a volume.
///
/// The written size doubles as the write cursor. Bytes below the cursor are
/// never rewritten.
pub struct Segment {
    name: String,
    capacity: u64,
    cursor: AtomicU64,
    backend: Box<dyn StorageBackend>,
}

impl Segment {
    /// Creates an empty in-memory segment.
    #[must_use]
    pub fn in_memory(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            cursor: AtomicU64::new(0),
            backend: Box::new(InMemoryBackend::new()),
        }
    }

    /// Opens or creates a file-backed segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open_file(dir: &Path, name: impl Into<String>, capacity: u64) -> CoreResult<Self> {
        let name = name.into();
        let backend = FileBackend::open_with_create_dirs(&dir.join(&name))?;
        let cursor = backend.size()?;
        Ok(Self {
            name,
            capacity,
            cursor: AtomicU64::new(cursor),
            backend: Box::new(backend),
        })
    }

    /// Segment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Written size, which is also the next append position.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Returns true if `len` more bytes fit.
    #[must_use]
    pub fn fits(&self, len: u64) -> bool {
        self.cursor().saturating_add(len) <= self.capacity
    }

    /// Appends bytes at the cursor and returns their position.
    ///
    /// # Errors
    ///
    /// Returns `SegmentFull` if the bytes do not fit.
    pub fn append(&self, data: &[u8]) -> CoreResult<u64> {
        if !self.fits(data.len() as u64) {
            return Err(CoreError::SegmentFull {
                segment: self.name.clone(),
                capacity: self.capacity,
            });
        }
        let position = self.backend.append(data)?;
        self.cursor.store(position + data.len() as u64, Ordering::Release);
        Ok(position)
    }

    /// Reads exactly `length` bytes at `position`.
    ///
    /// # Errors
    ///
    /// Returns `RangeOutOfBounds` if the range is not fully written.
    pub fn read(&self, position: u64, length: u64) -> CoreResult<Bytes> {
        let size = self.cursor();
        if position.checked_add(length).map_or(true, |end| end > size) {
            return Err(CoreError::RangeOutOfBounds {
                segment: self.name.clone(),
                position,
                length,
                size,
            });
        }
        let len = usize::try_from(length)
            .map_err(|_| CoreError::invalid_operation("range length too large"))?;
        Ok(Bytes::from(self.backend.read_at(position, len)?))
    }

    /// Pushes buffered bytes to the OS.
    pub(crate) fn flush(&self) -> CoreResult<()> {
        Ok(self.backend.flush()?)
    }

    /// Waits until written bytes are on stable storage.
    pub(crate) fn sync(&self) -> CoreResult<()> {
        Ok(self.backend.sync()?)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn names_are_zero_padded() {
        assert_eq!(segment_name(7), "0000000000000000007");
        assert_eq!(parse_segment_id("0000000000000000007"), Some(7));
        assert_eq!(parse_segment_id("s1"), None);
    }

    #[test]
    fn name_validation() {
        assert!(validate_segment_name("s1").is_ok());
        assert!(validate_segment_name("0000000000000000000").is_ok());
        assert!(validate_segment_name("").is_err());
        assert!(validate_segment_name("../etc").is_err());
        assert!(validate_segment_name("a/b").is_err());
    }

    #[test]
    fn append_respects_capacity() {
        let segment = Segment::in_memory("s1", 4);
        assert_eq!(segment.append(b"abc").unwrap(), 0);
        assert!(matches!(
            segment.append(b"de"),
            Err(CoreError::SegmentFull { .. })
        ));
        assert_eq!(segment.append(b"d").unwrap(), 3);
        assert_eq!(segment.cursor(), 4);
    }

    #[test]
    fn read_rejects_unwritten_range() {
        let segment = Segment::in_memory("s1", 64);
        segment.append(b"hello").unwrap();
        assert_eq!(&segment.read(1, 3).unwrap()[..], b"ell");
        assert!(matches!(
            segment.read(3, 3),
            Err(CoreError::RangeOutOfBounds { size: 5, .. })
        ));
    }

    #[test]
    fn cursor_follows_file_appends() {
        let dir = tempdir().unwrap();
        let segment = Segment::open_file(dir.path(), "s1", 16).unwrap();
        assert_eq!(segment.cursor(), 0);
        assert_eq!(segment.append(b"abcd").unwrap(), 0);
        assert_eq!(segment.append(b"ef").unwrap(), 4);
        assert_eq!(segment.cursor(), 6);
        assert!(segment.fits(10));
        assert!(!segment.fits(11));
    }

    #[test]
    fn file_segment_keeps_cursor_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let segment = Segment::open_file(dir.path(), "s1", 1024).unwrap();
            segment.append(b"persisted").unwrap();
            segment.sync().unwrap();
        }
        let segment = Segment::open_file(dir.path(), "s1", 1024).unwrap();
        assert_eq!(segment.cursor(), 9);
        assert_eq!(&segment.read(0, 9).unwrap()[..], b"persisted");
    }
}
