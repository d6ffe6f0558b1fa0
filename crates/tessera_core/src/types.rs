//! Core type definitions for Tessera.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Family of shards a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShardKind {
    /// Redis-compatible key space.
    Redis,
    /// Bucket (document) key space.
    Bucket,
}

impl ShardKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 2] = [Self::Redis, Self::Bucket];

    /// Upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Redis => "REDIS",
            Self::Bucket => "BUCKET",
        }
    }
}

impl fmt::Display for ShardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardKind {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REDIS" => Ok(Self::Redis),
            "BUCKET" => Ok(Self::Bucket),
            _ => Err(CoreError::InvalidShardKind {
                value: s.to_string(),
            }),
        }
    }
}

/// Index of a shard within its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl ShardId {
    /// Creates a new shard ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parses a shard id argument and checks it against the configured count.
///
/// # Errors
///
/// Returns `InvalidShardId` for non-numeric input or ids outside
/// `0..shard_count(kind)`.
pub fn read_shard_id(kind: ShardKind, raw: &str, config: &Config) -> CoreResult<ShardId> {
    let invalid = || CoreError::InvalidShardId {
        value: raw.to_string(),
    };
    let id: u32 = raw.trim().parse().map_err(|_| invalid())?;
    if id >= config.shard_count(kind) {
        return Err(invalid());
    }
    Ok(ShardId(id))
}

/// Name of the volume linked to a shard, e.g. `redis-shard-3`.
#[must_use]
pub fn volume_name(kind: ShardKind, id: ShardId) -> String {
    format!("{}-shard-{}", kind.as_str().to_ascii_lowercase(), id.0)
}

/// Admission state of a shard.
///
/// ```text
/// INITIALIZING -> READWRITE <-> READONLY
///        \            |            |
///         +-------> STOPPED <------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ShardStatus {
    /// Accepts reads and writes.
    ReadWrite = 0,
    /// Accepts reads only.
    ReadOnly = 1,
    /// Not yet serving.
    Initializing = 2,
    /// Terminal.
    Stopped = 3,
}

impl ShardStatus {
    /// Upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadWrite => "READWRITE",
            Self::ReadOnly => "READONLY",
            Self::Initializing => "INITIALIZING",
            Self::Stopped => "STOPPED",
        }
    }

    /// Converts the status to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Converts a byte to a status.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::ReadWrite),
            1 => Some(Self::ReadOnly),
            2 => Some(Self::Initializing),
            3 => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Returns true if writes are admitted.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }

    /// Returns true if the state machine allows moving to `next`.
    ///
    /// Staying in the same state is always allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::ReadWrite, Self::ReadWrite)
                | (Self::ReadOnly, Self::ReadOnly)
                | (Self::Initializing, Self::Initializing)
                | (Self::Stopped, Self::Stopped)
                | (Self::Initializing, Self::ReadWrite)
                | (Self::ReadWrite, Self::ReadOnly)
                | (Self::ReadOnly, Self::ReadWrite)
                | (Self::Initializing | Self::ReadWrite | Self::ReadOnly, Self::Stopped)
        )
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "READWRITE" => Ok(Self::ReadWrite),
            "READONLY" => Ok(Self::ReadOnly),
            "INITIALIZING" => Ok(Self::Initializing),
            "STOPPED" => Ok(Self::Stopped),
            _ => Err(CoreError::InvalidShardStatus {
                value: s.to_string(),
            }),
        }
    }
}

/// A 12-byte totally ordered identifier.
///
/// Layout (big-endian, so byte order equals logical order):
/// commit version (8) + batch order (2) + user order (2).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Versionstamp([u8; 12]);

impl Versionstamp {
    /// Encoded length in bytes.
    pub const LEN: usize = 12;

    /// The smallest versionstamp.
    pub const ZERO: Self = Self([0; Self::LEN]);

    /// Builds a versionstamp from its parts.
    #[must_use]
    pub fn new(commit_version: u64, batch_order: u16, user_order: u16) -> Self {
        let mut raw = [0u8; Self::LEN];
        raw[..8].copy_from_slice(&commit_version.to_be_bytes());
        raw[8..10].copy_from_slice(&batch_order.to_be_bytes());
        raw[10..].copy_from_slice(&user_order.to_be_bytes());
        Self(raw)
    }

    /// Wraps raw bytes.
    #[must_use]
    pub const fn from_bytes(raw: [u8; Self::LEN]) -> Self {
        Self(raw)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; Self::LEN] {
        self.0
    }

    /// Commit version component.
    #[must_use]
    pub fn commit_version(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }

    /// Batch order component.
    #[must_use]
    pub fn batch_order(&self) -> u16 {
        u16::from_be_bytes([self.0[8], self.0[9]])
    }

    /// User order component.
    #[must_use]
    pub fn user_order(&self) -> u16 {
        u16::from_be_bytes([self.0[10], self.0[11]])
    }
}

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Versionstamp {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let invalid = || CoreError::invalid_operation(format!("invalid versionstamp: {s}"));
        if s.len() != Self::LEN * 2 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut raw = [0u8; Self::LEN];
        for (i, slot) in raw.iter_mut().enumerate() {
            *slot = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(raw))
    }
}

/// Microseconds since the Unix epoch, used to seed commit versions.
#[must_use]
pub fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Identifier of a cluster member: 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Length of a full member id.
    pub const LEN: usize = 32;

    /// Length of an abbreviated id accepted by administrative commands.
    pub const PREFIX_LEN: usize = 4;

    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Validates and wraps a full id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMemberId` unless the input is 32 lowercase hex characters.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let valid = raw.len() == Self::LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(CoreError::InvalidMemberId {
                value: raw.to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The abbreviated form shown by tooling.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..Self::PREFIX_LEN]
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MemberId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_status_parses_case_insensitively() {
        assert_eq!("readwrite".parse::<ShardStatus>().unwrap(), ShardStatus::ReadWrite);
        assert_eq!("ReadOnly".parse::<ShardStatus>().unwrap(), ShardStatus::ReadOnly);
        assert!(matches!(
            "SIDEWAYS".parse::<ShardStatus>(),
            Err(CoreError::InvalidShardStatus { .. })
        ));
    }

    #[test]
    fn status_byte_roundtrip() {
        for status in [
            ShardStatus::ReadWrite,
            ShardStatus::ReadOnly,
            ShardStatus::Initializing,
            ShardStatus::Stopped,
        ] {
            assert_eq!(ShardStatus::from_byte(status.as_byte()), Some(status));
        }
        assert_eq!(ShardStatus::from_byte(9), None);
    }

    #[test]
    fn status_transitions() {
        use ShardStatus::*;
        assert!(Initializing.can_transition_to(ReadWrite));
        assert!(ReadWrite.can_transition_to(ReadOnly));
        assert!(ReadOnly.can_transition_to(ReadWrite));
        assert!(ReadOnly.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(ReadWrite));
        assert!(!ReadWrite.can_transition_to(Initializing));
    }

    #[test]
    fn shard_id_bounds() {
        let config = Config::default().with_shard_count(ShardKind::Redis, 4);
        assert_eq!(read_shard_id(ShardKind::Redis, "3", &config).unwrap(), ShardId(3));
        assert!(read_shard_id(ShardKind::Redis, "4", &config).is_err());
        assert!(read_shard_id(ShardKind::Redis, "-1", &config).is_err());
        assert!(read_shard_id(ShardKind::Redis, "three", &config).is_err());
    }

    #[test]
    fn volume_names() {
        assert_eq!(volume_name(ShardKind::Redis, ShardId(3)), "redis-shard-3");
        assert_eq!(volume_name(ShardKind::Bucket, ShardId(0)), "bucket-shard-0");
    }

    #[test]
    fn versionstamp_orders_by_bytes() {
        let a = Versionstamp::new(1, 0, 9);
        let b = Versionstamp::new(1, 1, 0);
        let c = Versionstamp::new(2, 0, 0);
        assert!(a < b && b < c);
        assert_eq!(b.commit_version(), 1);
        assert_eq!(b.batch_order(), 1);
        assert_eq!(a.user_order(), 9);
    }

    #[test]
    fn versionstamp_hex() {
        let vs = Versionstamp::new(0x0102, 3, 4);
        let text = vs.to_string();
        assert_eq!(text, "000000000000010200030004");
        assert_eq!(text.parse::<Versionstamp>().unwrap(), vs);
        assert!("zz".parse::<Versionstamp>().is_err());
    }

    #[test]
    fn member_id_format() {
        let id = MemberId::generate();
        assert_eq!(id.as_str().len(), MemberId::LEN);
        assert_eq!(MemberId::parse(id.as_str()).unwrap(), id);
        assert!(MemberId::parse("ab12").is_err());
        assert!(MemberId::parse(&"G".repeat(32)).is_err());
    }
}
