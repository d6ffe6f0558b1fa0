//! Shard description returned to administrative tooling.

use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};

/// Replica topology and status of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShardDescription {
    /// Primary member id, empty if the shard has no primary.
    pub primary: String,
    /// Standby member ids.
    pub standbys: Vec<String>,
    /// Standbys that are replicated synchronously.
    pub sync_standbys: Vec<String>,
    /// Status name, e.g. `READWRITE`.
    pub status: String,
    /// Volumes holding this shard's data.
    pub linked_volumes: Vec<String>,
}

impl ShardDescription {
    /// Field/value pairs in display order.
    #[must_use]
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("primary", self.primary.clone()),
            ("standbys", self.standbys.join(",")),
            ("sync_standbys", self.sync_standbys.join(",")),
            ("status", self.status.clone()),
            ("linked_volumes", self.linked_volumes.join(",")),
        ]
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
