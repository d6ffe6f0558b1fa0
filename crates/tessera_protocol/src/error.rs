//! Protocol errors.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing or coding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Wrong number of command arguments.
    #[error("wrong number of arguments for '{command}'")]
    WrongArgumentCount {
        /// Command name.
        command: &'static str,
    },

    /// An argument could not be parsed.
    #[error("invalid {field}: {value}")]
    InvalidArgument {
        /// Which argument was invalid.
        field: &'static str,
        /// The offending raw value.
        value: String,
    },

    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ProtocolError {
    pub(crate) fn invalid(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            value: value.into(),
        }
    }
}
