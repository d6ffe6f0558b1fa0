//! Narrow interface to the external transactional key-value store.
//!
//! Routes and replication slots are persisted here as CBOR values. Every
//! commit yields a [`Versionstamp`] that is strictly greater than any
//! previous one, which makes commit stamps usable as slot identifiers.

use crate::error::{CoreError, CoreResult};
use crate::types::{wall_clock_micros, Versionstamp};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// One write inside a metadata transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Sets a key.
    Set {
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Clears a key.
    Clear {
        /// Key bytes.
        key: Vec<u8>,
    },
}

impl Mutation {
    /// Creates a set mutation with a CBOR-encoded value.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn set_cbor<T: Serialize>(key: Vec<u8>, value: &T) -> CoreResult<Self> {
        Ok(Self::Set {
            key,
            value: encode_cbor(value)?,
        })
    }
}

/// Transactional metadata store.
pub trait MetadataStore: Send + Sync {
    /// Reads a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>>;

    /// Lists all pairs whose key starts with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn scan_prefix(&self, prefix: &[u8]) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies mutations atomically and returns the commit versionstamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction could not be committed.
    fn commit(&self, mutations: Vec<Mutation>) -> CoreResult<Versionstamp>;
}

/// Builds a `/`-separated metadata key.
#[must_use]
pub fn metadata_key(parts: &[&str]) -> Vec<u8> {
    parts.join("/").into_bytes()
}

/// Encodes a metadata value as CBOR.
///
/// # Errors
///
/// Returns a codec error if serialization fails.
pub fn encode_cbor<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes a CBOR metadata value.
///
/// # Errors
///
/// Returns a codec error on malformed input.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

#[derive(Default)]
struct MemoryState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    last_version: u64,
}

/// In-process [`MetadataStore`].
///
/// Commit versions are seeded from wall-clock microseconds so stamps keep
/// increasing across process restarts.
#[derive(Default)]
pub struct MemoryMetadataStore {
    state: Mutex<MemoryState>,
}

impl MemoryMetadataStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.state.lock().data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> CoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.lock();
        Ok(state
            .data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, mutations: Vec<Mutation>) -> CoreResult<Versionstamp> {
        let mut state = self.state.lock();
        let version = wall_clock_micros().max(state.last_version + 1);
        state.last_version = version;
        for mutation in mutations {
            match mutation {
                Mutation::Set { key, value } => {
                    state.data.insert(key, value);
                }
                Mutation::Clear { key } => {
                    state.data.remove(&key);
                }
            }
        }
        Ok(Versionstamp::new(version, 0, 0))
    }
}
