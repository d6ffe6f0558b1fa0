//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// A byte store backed by a single OS file.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_data()` so the bytes survive power loss
///
/// The published size only grows after `write_all` returns, so a reader
/// never observes a partially written append.
///
/// # Example
///
/// ```no_run
/// use tessera_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("0000000000000000001")).unwrap();
/// backend.append(b"payload").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    size: AtomicU64,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size: AtomicU64::new(size),
        })
    }

    /// Opens or creates a file backend, creating parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = self.size.load(Ordering::Acquire);
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&self, data: &[u8]) -> StorageResult<u64> {
        let mut file = self.file.lock();
        let offset = self.size.load(Ordering::Acquire);
        if data.is_empty() {
            return Ok(offset);
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        self.size.store(offset + data.len() as u64, Ordering::Release);
        Ok(offset)
    }

    fn flush(&self) -> StorageResult<()> {
        self.file.lock().flush()?;
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.size.load(Ordering::Acquire))
    }

    fn truncate(&self, new_size: u64) -> StorageResult<()> {
        let file = self.file.lock();
        let size = self.size.load(Ordering::Acquire);
        if new_size > size {
            return Err(StorageError::InvalidTruncate { new_size, size });
        }

        file.set_len(new_size)?;
        file.sync_all()?;
        self.size.store(new_size, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn file_append_and_read() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(&dir.path().join("segment")).unwrap();

        assert_eq!(backend.append(b"A").unwrap(), 0);
        assert_eq!(backend.append(b"BB").unwrap(), 1);

        assert_eq!(backend.read_at(0, 1).unwrap(), b"A");
        assert_eq!(backend.read_at(1, 2).unwrap(), b"BB");
        assert!(matches!(
            backend.read_at(2, 2),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn file_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment");

        {
            let backend = FileBackend::open(&path).unwrap();
            backend.append(b"persistent data").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 15);
        assert_eq!(backend.read_at(0, 15).unwrap(), b"persistent data");

        // appends continue after the recovered tail
        assert_eq!(backend.append(b"!").unwrap(), 15);
    }

    #[test]
    fn file_empty_append_keeps_offset() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(&dir.path().join("segment")).unwrap();
        backend.append(b"x").unwrap();
        assert_eq!(backend.append(b"").unwrap(), 1);
        assert_eq!(backend.size().unwrap(), 1);
    }

    #[test]
    fn file_truncate_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changelog.log");
        let backend = FileBackend::open(&path).unwrap();
        backend.append(b"complete|torn").unwrap();

        backend.truncate(8).unwrap();
        assert_eq!(backend.size().unwrap(), 8);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
        assert!(backend.truncate(9).is_err());
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("volume").join("segments").join("0");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }
}
