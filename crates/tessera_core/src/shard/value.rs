//! Values held by a shard.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value stored under a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    /// Plain byte string.
    String(Bytes),
    /// Field -> value map.
    Hash(BTreeMap<String, Bytes>),
}

impl StoredValue {
    /// Redis type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Hash(_) => "hash",
        }
    }
}
