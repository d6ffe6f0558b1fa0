//! Changelog entry metadata and its on-disk framing.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! | len: u32 | payload: CBOR EntryMetadata | crc32: u32 |
//! ```
//!
//! The CRC covers the length and payload.

use crate::error::{CoreError, CoreResult};
use crate::metadata::{decode_cbor, encode_cbor};
use crate::types::Versionstamp;
use serde::{Deserialize, Serialize};
use tessera_protocol::ReplicatedEntry;

/// Frame header size.
pub(crate) const FRAME_HEADER_SIZE: usize = 4;

/// Frame trailer (CRC) size.
pub(crate) const FRAME_TRAILER_SIZE: usize = 4;

/// Location and version of one durable entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Commit versionstamp; unique and strictly increasing within a volume.
    pub versionstamp: Versionstamp,
    /// Segment holding the payload.
    pub segment: String,
    /// Byte position inside the segment.
    pub position: u64,
    /// Payload length.
    pub length: u32,
}

impl EntryMetadata {
    /// First byte past the payload.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.position + u64::from(self.length)
    }

    /// Encodes the entry as a checksummed frame.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn encode_frame(&self) -> CoreResult<Vec<u8>> {
        let payload = encode_cbor(self)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("changelog frame too large"))?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + FRAME_TRAILER_SIZE);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not hold a complete frame, otherwise
    /// the entry and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` or a codec error for a damaged frame.
    pub fn decode_frame(buf: &[u8]) -> CoreResult<Option<(Self, usize)>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let total = FRAME_HEADER_SIZE + len + FRAME_TRAILER_SIZE;
        if buf.len() < total {
            return Ok(None);
        }

        let body_end = FRAME_HEADER_SIZE + len;
        let stored = u32::from_le_bytes([
            buf[body_end],
            buf[body_end + 1],
            buf[body_end + 2],
            buf[body_end + 3],
        ]);
        let computed = compute_crc32(&buf[..body_end]);
        if stored != computed {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let entry = decode_cbor(&buf[FRAME_HEADER_SIZE..body_end])?;
        Ok(Some((entry, total)))
    }
}

impl From<&EntryMetadata> for ReplicatedEntry {
    fn from(entry: &EntryMetadata) -> Self {
        Self {
            versionstamp: entry.versionstamp.to_bytes(),
            segment: entry.segment.clone(),
            position: entry.position,
            length: entry.length,
        }
    }
}

impl From<ReplicatedEntry> for EntryMetadata {
    fn from(entry: ReplicatedEntry) -> Self {
        Self {
            versionstamp: Versionstamp::from_bytes(entry.versionstamp),
            segment: entry.segment,
            position: entry.position,
            length: entry.length,
        }
    }
}

/// Computes a CRC32 (IEEE) checksum.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> EntryMetadata {
        EntryMetadata {
            versionstamp: Versionstamp::new(42, 0, 1),
            segment: "0000000000000000000".into(),
            position: 128,
            length: 16,
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn frame_decodes_with_consumed_length() {
        let frame = entry().encode_frame().unwrap();
        let mut buf = frame.clone();
        buf.extend_from_slice(&[1, 2]);

        let (decoded, consumed) = EntryMetadata::decode_frame(&buf).unwrap().unwrap();
        assert_eq!(decoded, entry());
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded.end(), 144);
    }

    #[test]
    fn short_frame_is_incomplete() {
        let frame = entry().encode_frame().unwrap();
        assert!(EntryMetadata::decode_frame(&frame[..frame.len() - 1])
            .unwrap()
            .is_none());
        assert!(EntryMetadata::decode_frame(&frame[..2]).unwrap().is_none());
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let mut frame = entry().encode_frame().unwrap();
        frame[6] ^= 0x01;
        assert!(matches!(
            EntryMetadata::decode_frame(&frame),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn replicated_entry_conversion() {
        let wire = ReplicatedEntry::from(&entry());
        assert_eq!(EntryMetadata::from(wire), entry());
    }
}
