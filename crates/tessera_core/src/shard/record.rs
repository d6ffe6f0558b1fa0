//! Durable per-key record written to the volume.

use crate::error::CoreResult;
use crate::metadata::{decode_cbor, encode_cbor};
use crate::shard::value::StoredValue;
use serde::{Deserialize, Serialize};

/// The latest state of one key. `value: None` records a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Key.
    pub key: String,
    /// Value, or `None` if the key was removed.
    pub value: Option<StoredValue>,
}

impl KeyRecord {
    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error on malformed input.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        decode_cbor(bytes)
    }
}
