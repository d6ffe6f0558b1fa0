//! Error types for Tessera core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse classification of a [`CoreError`].
///
/// Callers use the kind to decide between retrying, re-resolving shard
/// ownership, or surfacing the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Not ready yet: retry later or route elsewhere.
    NotReady,
    /// The handle is closed for good: re-resolve shard ownership.
    Closed,
    /// Rejected input; nothing was changed.
    Validation,
    /// A peer violated the replication protocol.
    Protocol,
    /// Storage failure or corruption.
    Fatal,
}

/// Errors that can occur in Tessera core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tessera_storage::StorageError),

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] tessera_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// The volume has not been opened yet.
    #[error("volume not open: {volume}")]
    VolumeNotOpen {
        /// Volume name.
        volume: String,
    },

    /// The volume has been closed.
    #[error("volume closed: {volume}")]
    VolumeClosed {
        /// Volume name.
        volume: String,
    },

    /// Another process holds the volume directory.
    #[error("volume locked: another process has exclusive access to {path}")]
    VolumeLocked {
        /// Volume directory.
        path: String,
    },

    /// No volume is registered under the name.
    #[error("volume not found: {volume}")]
    VolumeNotFound {
        /// Volume name.
        volume: String,
    },

    /// The segment does not exist in the volume.
    #[error("segment not found: {segment} in volume {volume}")]
    SegmentNotFound {
        /// Volume name.
        volume: String,
        /// Segment name.
        segment: String,
    },

    /// A positional insert would rewrite or skip bytes.
    #[error("position conflict in segment {segment}: position {position}, cursor {cursor}")]
    PositionConflict {
        /// Segment name.
        segment: String,
        /// Requested position.
        position: u64,
        /// Current write cursor.
        cursor: u64,
    },

    /// A requested range lies outside the written part of a segment.
    #[error("range {position}+{length} out of bounds for segment {segment} of size {size}")]
    RangeOutOfBounds {
        /// Segment name.
        segment: String,
        /// Range start.
        position: u64,
        /// Range length.
        length: u64,
        /// Written size of the segment.
        size: u64,
    },

    /// The write would exceed the segment capacity.
    #[error("segment {segment} is full: capacity {capacity}")]
    SegmentFull {
        /// Segment name.
        segment: String,
        /// Segment capacity.
        capacity: u64,
    },

    /// Segment names must be usable as file names.
    #[error("invalid segment name: {segment}")]
    InvalidSegmentName {
        /// The rejected name.
        segment: String,
    },

    /// A single entry is larger than a segment.
    #[error("entry of {length} bytes exceeds segment size {segment_size}")]
    EntryTooLarge {
        /// Entry length.
        length: u64,
        /// Configured segment size.
        segment_size: u64,
    },

    /// The volume changelog is corrupted.
    #[error("changelog corruption: {message}")]
    ChangelogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Replicated changes arrived out of versionstamp order.
    #[error("versionstamp regression: {received} is not after {last}")]
    VersionstampRegression {
        /// Last applied versionstamp.
        last: String,
        /// Offending versionstamp.
        received: String,
    },

    /// The shard is not operable yet.
    #[error("shard {kind}/{id} is not operable")]
    ShardNotOperable {
        /// Shard kind.
        kind: String,
        /// Shard id.
        id: u32,
    },

    /// The shard does not accept writes in its current status.
    #[error("shard {kind}/{id} is {status}, writes are rejected")]
    ShardReadOnly {
        /// Shard kind.
        kind: String,
        /// Shard id.
        id: u32,
        /// Current status name.
        status: String,
    },

    /// The shard has been stopped.
    #[error("shard {kind}/{id} is stopped")]
    ShardStopped {
        /// Shard kind.
        kind: String,
        /// Shard id.
        id: u32,
    },

    /// No shard is hosted under the given kind and id.
    #[error("shard not found: {kind}/{id}")]
    ShardNotFound {
        /// Shard kind.
        kind: String,
        /// Shard id.
        id: u32,
    },

    /// Shard id could not be parsed or is out of range.
    #[error("invalid shard id: {value}")]
    InvalidShardId {
        /// The raw input.
        value: String,
    },

    /// Unknown shard kind name.
    #[error("invalid shard kind: {value}")]
    InvalidShardKind {
        /// The raw input.
        value: String,
    },

    /// Unknown shard status name.
    #[error("invalid shard status: {value}")]
    InvalidShardStatus {
        /// The raw input.
        value: String,
    },

    /// The routing state machine forbids this status change.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidStatusTransition {
        /// Current status name.
        from: String,
        /// Requested status name.
        to: String,
    },

    /// Malformed member id.
    #[error("invalid member id: {value}")]
    InvalidMemberId {
        /// The raw input.
        value: String,
    },

    /// No member matches the id or prefix.
    #[error("member not found: {id}")]
    MemberNotFound {
        /// Id or prefix searched.
        id: String,
    },

    /// More than one member matches the prefix.
    #[error("ambiguous member prefix {prefix}: {matches} members match")]
    AmbiguousMemberPrefix {
        /// Prefix searched.
        prefix: String,
        /// Number of matching members.
        matches: usize,
    },

    /// The shard already has a different primary.
    #[error("shard already has primary {current}")]
    PrimaryConflict {
        /// Current primary id.
        current: String,
    },

    /// The member is not a standby of the shard.
    #[error("member {member} is not a standby")]
    NotAStandby {
        /// Member id.
        member: String,
    },

    /// The standby has not caught up with the acknowledged position.
    #[error("member {member} has not caught up")]
    NotCaughtUp {
        /// Member id.
        member: String,
    },

    /// Operation against a key holding another value type.
    #[error("WRONGTYPE operation against a key holding the wrong kind of value")]
    WrongType,

    /// The key does not exist.
    #[error("no such key")]
    NoSuchKey,

    /// Operation not permitted.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The metadata store failed.
    #[error("metadata store error: {message}")]
    Metadata {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a changelog corruption error.
    pub fn changelog_corruption(message: impl Into<String>) -> Self {
        Self::ChangelogCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a metadata store error.
    pub fn metadata(message: impl Into<String>) -> Self {
        Self::Metadata {
            message: message.into(),
        }
    }

    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VolumeNotOpen { .. }
            | Self::ShardNotOperable { .. }
            | Self::ShardReadOnly { .. }
            | Self::NotCaughtUp { .. } => ErrorKind::NotReady,

            Self::VolumeClosed { .. } | Self::ShardStopped { .. } => ErrorKind::Closed,

            Self::Protocol(_)
            | Self::VolumeNotFound { .. }
            | Self::SegmentNotFound { .. }
            | Self::PositionConflict { .. }
            | Self::RangeOutOfBounds { .. }
            | Self::EntryTooLarge { .. }
            | Self::SegmentFull { .. }
            | Self::InvalidSegmentName { .. }
            | Self::ShardNotFound { .. }
            | Self::InvalidShardId { .. }
            | Self::InvalidShardKind { .. }
            | Self::InvalidShardStatus { .. }
            | Self::InvalidStatusTransition { .. }
            | Self::InvalidMemberId { .. }
            | Self::MemberNotFound { .. }
            | Self::AmbiguousMemberPrefix { .. }
            | Self::PrimaryConflict { .. }
            | Self::NotAStandby { .. }
            | Self::WrongType
            | Self::NoSuchKey
            | Self::InvalidOperation { .. } => ErrorKind::Validation,

            Self::VersionstampRegression { .. } => ErrorKind::Protocol,

            Self::Storage(e) if e.is_range_error() => ErrorKind::Validation,
            Self::Storage(tessera_storage::StorageError::Closed) => ErrorKind::Closed,

            Self::Storage(_)
            | Self::Io(_)
            | Self::Codec { .. }
            | Self::VolumeLocked { .. }
            | Self::ChangelogCorruption { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Metadata { .. } => ErrorKind::Fatal,
        }
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Storage(tessera_storage::StorageError::Io(_))
        ) || self.kind() == ErrorKind::NotReady
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_is_retryable() {
        let err = CoreError::ShardNotOperable {
            kind: "REDIS".into(),
            id: 1,
        };
        assert_eq!(err.kind(), ErrorKind::NotReady);
        assert!(err.is_retryable());
    }

    #[test]
    fn closed_and_validation_are_not_retryable() {
        let closed = CoreError::VolumeClosed {
            volume: "redis-shard-0".into(),
        };
        assert_eq!(closed.kind(), ErrorKind::Closed);
        assert!(!closed.is_retryable());

        let invalid = CoreError::InvalidShardStatus {
            value: "SIDEWAYS".into(),
        };
        assert_eq!(invalid.kind(), ErrorKind::Validation);
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn io_is_fatal_but_retryable() {
        let err = CoreError::from(io::Error::new(io::ErrorKind::Other, "disk"));
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.is_retryable());
    }

    #[test]
    fn storage_range_errors_are_validation() {
        let err = CoreError::from(tessera_storage::StorageError::ReadPastEnd {
            offset: 10,
            len: 4,
            size: 8,
        });
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
