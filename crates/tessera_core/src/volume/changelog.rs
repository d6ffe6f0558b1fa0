//! Append-only log of entry metadata.

use crate::error::{CoreError, CoreResult};
use crate::volume::entry::EntryMetadata;
use tessera_storage::StorageBackend;
use tracing::warn;

/// Durable record of which byte ranges hold committed entries.
pub struct Changelog {
    backend: Box<dyn StorageBackend>,
}

impl Changelog {
    /// Opens a changelog and replays it.
    ///
    /// An incomplete or damaged final frame is a torn write and is cut off.
    /// Damage followed by further valid data is corruption.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or is corrupted.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<(Self, Vec<EntryMetadata>)> {
        let size = backend.size()?;
        let len = usize::try_from(size)
            .map_err(|_| CoreError::changelog_corruption("changelog too large"))?;
        let data = backend.read_at(0, len)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            match EntryMetadata::decode_frame(&data[offset..]) {
                Ok(Some((entry, consumed))) => {
                    entries.push(entry);
                    offset += consumed;
                }
                Ok(None) => break,
                Err(CoreError::ChecksumMismatch { expected, actual }) => {
                    let frame_len = frame_len(&data[offset..]);
                    if offset + frame_len < data.len() {
                        return Err(CoreError::ChecksumMismatch { expected, actual });
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if offset < data.len() {
            warn!(valid = offset, size, "truncating torn changelog tail");
            backend.truncate(offset as u64)?;
        }

        Ok((Self { backend }, entries))
    }

    /// Appends entries without syncing.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the write fails.
    pub fn append(&self, entries: &[EntryMetadata]) -> CoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend_from_slice(&entry.encode_frame()?);
        }
        self.backend.append(&buf)?;
        Ok(())
    }

    /// Flushes, and syncs when `sync` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn persist(&self, sync: bool) -> CoreResult<()> {
        if sync {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(())
    }

    /// Size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }
}

fn frame_len(buf: &[u8]) -> usize {
    if buf.len() < 4 {
        return buf.len();
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    len + 8
}
