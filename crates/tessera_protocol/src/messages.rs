//! Segment insert and range-read messages.

use crate::codec::{from_cbor, parse_string, parse_u64, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::replication::{ReplicationAck, ReplicationBatch};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One durable record: a payload placed at a byte position in a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedEntry {
    /// Byte position inside the segment.
    pub position: u64,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl PackedEntry {
    /// Creates a packed entry.
    pub fn new(position: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            position,
            payload: payload.into(),
        }
    }

    /// Length of the payload in bytes.
    ///
    /// Entry lengths are bounded by the segment size, which fits in `u32`.
    #[must_use]
    pub fn length(&self) -> u32 {
        self.payload.len() as u32
    }

    /// First byte position after this entry.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.position + self.payload.len() as u64
    }
}

/// `SEGMENTINSERT <volume> <segment> <position> <data> [<position> <data> ...]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInsertRequest {
    /// Target volume name.
    pub volume: String,
    /// Target segment name.
    pub segment: String,
    /// Entries in ascending position order.
    pub entries: Vec<PackedEntry>,
}

impl SegmentInsertRequest {
    /// Command name.
    pub const COMMAND: &'static str = "SEGMENTINSERT";
    /// Minimum argument count: volume, segment and one entry.
    pub const MINIMUM_ARGUMENT_COUNT: usize = 4;

    /// Parses already-decoded command arguments.
    ///
    /// # Errors
    ///
    /// Fails if the argument count is below the minimum or odd, or if a
    /// position is not a non-negative decimal integer.
    pub fn from_args(args: &[Bytes]) -> ProtocolResult<Self> {
        if args.len() < Self::MINIMUM_ARGUMENT_COUNT || args.len() % 2 != 0 {
            return Err(ProtocolError::WrongArgumentCount {
                command: Self::COMMAND,
            });
        }

        let volume = parse_string("volume", &args[0])?;
        let segment = parse_string("segment", &args[1])?;
        let entries = args[2..]
            .chunks_exact(2)
            .map(|pair| {
                let position = parse_u64("position", &pair[0])?;
                Ok(PackedEntry::new(position, pair[1].clone()))
            })
            .collect::<ProtocolResult<Vec<_>>>()?;

        Ok(Self {
            volume,
            segment,
            entries,
        })
    }
}

/// A `(position, length)` pair naming a byte range of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRange {
    /// Byte position inside the segment.
    pub position: u64,
    /// Number of bytes.
    pub length: u32,
}

impl SegmentRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(position: u64, length: u32) -> Self {
        Self { position, length }
    }
}

/// `SEGMENTRANGE <volume> <segment> <position> <length> [<position> <length> ...]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRangeRequest {
    /// Source volume name.
    pub volume: String,
    /// Source segment name.
    pub segment: String,
    /// Requested ranges; the response keeps this order.
    pub ranges: Vec<SegmentRange>,
}

impl SegmentRangeRequest {
    /// Command name.
    pub const COMMAND: &'static str = "SEGMENTRANGE";
    /// Minimum argument count: volume, segment and one range.
    pub const MINIMUM_ARGUMENT_COUNT: usize = 4;

    /// Parses already-decoded command arguments.
    ///
    /// # Errors
    ///
    /// Fails on a bad argument count or non-numeric position/length.
    pub fn from_args(args: &[Bytes]) -> ProtocolResult<Self> {
        if args.len() < Self::MINIMUM_ARGUMENT_COUNT || args.len() % 2 != 0 {
            return Err(ProtocolError::WrongArgumentCount {
                command: Self::COMMAND,
            });
        }

        let volume = parse_string("volume", &args[0])?;
        let segment = parse_string("segment", &args[1])?;
        let ranges = args[2..]
            .chunks_exact(2)
            .map(|pair| {
                let position = parse_u64("position", &pair[0])?;
                let length = parse_u64("length", &pair[1])?;
                let length = u32::try_from(length)
                    .map_err(|_| ProtocolError::invalid("length", length.to_string()))?;
                Ok(SegmentRange::new(position, length))
            })
            .collect::<ProtocolResult<Vec<_>>>()?;

        Ok(Self {
            volume,
            segment,
            ranges,
        })
    }
}

/// Ordered payloads, one per requested range.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentRangeResponse {
    /// Raw payloads.
    pub payloads: Vec<Bytes>,
}

/// Every message a storage node sends or receives on its internal channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Positional insert.
    SegmentInsert(SegmentInsertRequest),
    /// Range read request.
    SegmentRange(SegmentRangeRequest),
    /// Range read response.
    SegmentRangeResponse(SegmentRangeResponse),
    /// Replication data.
    ReplicationBatch(ReplicationBatch),
    /// Replication acknowledgment.
    ReplicationAck(ReplicationAck),
}

impl Message {
    /// Returns the message type code.
    #[must_use]
    pub fn type_code(&self) -> u8 {
        match self {
            Message::SegmentInsert(_) => 1,
            Message::SegmentRange(_) => 2,
            Message::SegmentRangeResponse(_) => 3,
            Message::ReplicationBatch(_) => 4,
            Message::ReplicationAck(_) => 5,
        }
    }

    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] on malformed input.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&[u8]]) -> Vec<Bytes> {
        raw.iter().map(|a| Bytes::copy_from_slice(a)).collect()
    }

    #[test]
    fn parse_segment_insert() {
        let request = SegmentInsertRequest::from_args(&args(&[
            b"v1", b"s1", b"0", b"A", b"1", b"BB",
        ]))
        .unwrap();

        assert_eq!(request.volume, "v1");
        assert_eq!(request.segment, "s1");
        assert_eq!(
            request.entries,
            vec![PackedEntry::new(0, &b"A"[..]), PackedEntry::new(1, &b"BB"[..])]
        );
        assert_eq!(request.entries[1].length(), 2);
        assert_eq!(request.entries[1].end(), 3);
    }

    #[test]
    fn segment_insert_rejects_odd_argument_count() {
        let err = SegmentInsertRequest::from_args(&args(&[b"v1", b"s1", b"0", b"A", b"1"]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::WrongArgumentCount { .. }));

        let err = SegmentInsertRequest::from_args(&args(&[b"v1", b"s1"])).unwrap_err();
        assert!(matches!(err, ProtocolError::WrongArgumentCount { .. }));
    }

    #[test]
    fn segment_insert_rejects_negative_position() {
        let err =
            SegmentInsertRequest::from_args(&args(&[b"v1", b"s1", b"-1", b"A"])).unwrap_err();
        assert_eq!(err.to_string(), "invalid position: -1");
    }

    #[test]
    fn parse_segment_range() {
        let request =
            SegmentRangeRequest::from_args(&args(&[b"v1", b"s1", b"0", b"1", b"1", b"2"]))
                .unwrap();
        assert_eq!(
            request.ranges,
            vec![SegmentRange::new(0, 1), SegmentRange::new(1, 2)]
        );
    }

    #[test]
    fn segment_range_rejects_oversized_length() {
        let err = SegmentRangeRequest::from_args(&args(&[
            b"v1",
            b"s1",
            b"0",
            b"99999999999",
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidArgument { field: "length", .. }
        ));
    }

    #[test]
    fn message_survives_cbor() {
        let message = Message::SegmentRangeResponse(SegmentRangeResponse {
            payloads: vec![Bytes::from_static(b"A"), Bytes::from_static(b"BB")],
        });
        assert_eq!(message.type_code(), 3);

        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(matches!(
            Message::decode(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::Decode(_))
        ));
    }
}
