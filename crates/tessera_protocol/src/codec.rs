//! CBOR helpers shared by every message type.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Parses a decimal argument.
pub(crate) fn parse_u64(field: &'static str, raw: &[u8]) -> ProtocolResult<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| ProtocolError::invalid(field, String::from_utf8_lossy(raw)))
}

pub(crate) fn parse_string(field: &'static str, raw: &[u8]) -> ProtocolResult<String> {
    let value = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::invalid(field, String::from_utf8_lossy(raw)))?;
    if value.is_empty() {
        return Err(ProtocolError::invalid(field, ""));
    }
    Ok(value.to_string())
}
