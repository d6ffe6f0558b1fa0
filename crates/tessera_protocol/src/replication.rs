//! Primary -> standby replication stream messages.

use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Length of an encoded versionstamp.
pub const VERSIONSTAMP_LEN: usize = 12;

/// Changelog metadata of one durable entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedEntry {
    /// Versionstamp assigned by the primary's volume.
    pub versionstamp: [u8; VERSIONSTAMP_LEN],
    /// Segment holding the entry.
    pub segment: String,
    /// Byte position inside the segment.
    pub position: u64,
    /// Payload length.
    pub length: u32,
}

/// A contiguous run of raw segment bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentChunk {
    /// Segment name.
    pub segment: String,
    /// Position of the first byte.
    pub position: u64,
    /// Raw bytes, exactly as stored on the primary.
    pub data: Bytes,
}

/// Newly durable data shipped from a primary to one standby.
///
/// `chunks` carry the bytes, `entries` the changelog records that
/// reference them. Entries are in strictly increasing versionstamp order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationBatch {
    /// Slot this batch belongs to.
    pub slot_id: [u8; VERSIONSTAMP_LEN],
    /// Shard kind name.
    pub shard_kind: String,
    /// Shard id.
    pub shard_id: u32,
    /// Volume the data was read from.
    pub volume: String,
    /// Raw segment data.
    pub chunks: Vec<SegmentChunk>,
    /// Changelog entries.
    pub entries: Vec<ReplicatedEntry>,
}

impl ReplicationBatch {
    /// Versionstamp of the newest entry, if any.
    #[must_use]
    pub fn last_versionstamp(&self) -> Option<[u8; VERSIONSTAMP_LEN]> {
        self.entries.last().map(|e| e.versionstamp)
    }

    /// Total number of data bytes carried.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    /// Returns true if the batch carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed input.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// A standby's confirmation that everything up to `versionstamp` is durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAck {
    /// Slot being acknowledged.
    pub slot_id: [u8; VERSIONSTAMP_LEN],
    /// Highest durable versionstamp on the standby.
    pub versionstamp: [u8; VERSIONSTAMP_LEN],
}

impl ReplicationAck {
    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed input.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(n: u8) -> [u8; VERSIONSTAMP_LEN] {
        let mut raw = [0u8; VERSIONSTAMP_LEN];
        raw[7] = n;
        raw
    }

    fn batch() -> ReplicationBatch {
        ReplicationBatch {
            slot_id: stamp(1),
            shard_kind: "REDIS".into(),
            shard_id: 3,
            volume: "redis-shard-3".into(),
            chunks: vec![SegmentChunk {
                segment: "0000000000000000000".into(),
                position: 0,
                data: Bytes::from_static(b"ABB"),
            }],
            entries: vec![
                ReplicatedEntry {
                    versionstamp: stamp(2),
                    segment: "0000000000000000000".into(),
                    position: 0,
                    length: 1,
                },
                ReplicatedEntry {
                    versionstamp: stamp(3),
                    segment: "0000000000000000000".into(),
                    position: 1,
                    length: 2,
                },
            ],
        }
    }

    #[test]
    fn batch_summary() {
        let batch = batch();
        assert_eq!(batch.last_versionstamp(), Some(stamp(3)));
        assert_eq!(batch.data_len(), 3);
        assert!(!batch.is_empty());
    }

    #[test]
    fn batch_and_ack_survive_cbor() {
        let batch = batch();
        assert_eq!(ReplicationBatch::decode(&batch.encode().unwrap()).unwrap(), batch);

        let ack = ReplicationAck {
            slot_id: stamp(1),
            versionstamp: stamp(3),
        };
        assert_eq!(ReplicationAck::decode(&ack.encode().unwrap()).unwrap(), ack);
    }
}
