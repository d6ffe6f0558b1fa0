//! Error types for replication.

use tessera_core::{CoreError, ErrorKind};
use tessera_protocol::ProtocolError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur while replicating a shard.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Storage, routing or shard error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Wire encoding error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the send can be retried.
        retryable: bool,
    },

    /// An acknowledgment would move a slot's watermark backward.
    #[error("acknowledgment {received} for slot {slot} is behind watermark {current}")]
    WatermarkRegression {
        /// Slot id.
        slot: String,
        /// Current watermark.
        current: String,
        /// Acknowledged versionstamp.
        received: String,
    },

    /// An acknowledgment names a different slot than the batch.
    #[error("acknowledgment for slot {received} does not match slot {expected}")]
    SlotMismatch {
        /// Slot the batch was sent for.
        expected: String,
        /// Slot named in the acknowledgment.
        received: String,
    },

    /// The slot does not exist.
    #[error("replication slot not found: {slot}")]
    SlotNotFound {
        /// Slot id.
        slot: String,
    },

    /// A batch references bytes it does not carry, or the wrong volume.
    #[error("malformed replication batch: {message}")]
    MalformedBatch {
        /// Error message.
        message: String,
    },

    /// A background task failed to complete.
    #[error("replication task failed: {0}")]
    Task(String),
}

impl ReplicationError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            retryable,
        }
    }

    /// Creates a malformed batch error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedBatch {
            message: message.into(),
        }
    }

    /// Returns true if sending the same batch again may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Core(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the local volume or shard is gone for good.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Core(e) if e.kind() == ErrorKind::Closed)
    }
}

impl From<ReplicationError> for CoreError {
    fn from(err: ReplicationError) -> Self {
        match err {
            ReplicationError::Core(e) => e,
            ReplicationError::Protocol(e) => CoreError::Protocol(e),
            other => CoreError::invalid_operation(other.to_string()),
        }
    }
}
