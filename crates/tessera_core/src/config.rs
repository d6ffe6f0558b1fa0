//! Node configuration.

use crate::types::ShardKind;
use std::path::PathBuf;
use std::time::Duration;

/// Number of lock stripes per shard.
pub const DEFAULT_STRIPE_COUNT: usize = 271;

/// Default number of shards of each kind.
pub const DEFAULT_SHARD_COUNT: u32 = 7;

/// Configuration for a storage node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of Redis shards in the cluster.
    pub redis_shard_count: u32,

    /// Number of bucket shards in the cluster.
    pub bucket_shard_count: u32,

    /// Lock stripes per shard.
    pub stripe_count: usize,

    /// Capacity of a single segment in bytes.
    pub segment_size: u64,

    /// How often the background flush task drains the persistence queue.
    pub flush_interval: Duration,

    /// Maximum number of keys packed into one volume append.
    pub flush_batch_size: usize,

    /// Whether background flushes sync to stable storage.
    pub sync_on_flush: bool,

    /// Root directory for volumes. `None` keeps volumes in memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_shard_count: DEFAULT_SHARD_COUNT,
            bucket_shard_count: DEFAULT_SHARD_COUNT,
            stripe_count: DEFAULT_STRIPE_COUNT,
            segment_size: 64 * 1024 * 1024, // 64 MB
            flush_interval: Duration::from_millis(100),
            flush_batch_size: 1024,
            sync_on_flush: true,
            data_dir: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the configured shard count for a kind.
    #[must_use]
    pub const fn shard_count(&self, kind: ShardKind) -> u32 {
        match kind {
            ShardKind::Redis => self.redis_shard_count,
            ShardKind::Bucket => self.bucket_shard_count,
        }
    }

    /// Sets the shard count for a kind.
    #[must_use]
    pub fn with_shard_count(mut self, kind: ShardKind, count: u32) -> Self {
        match kind {
            ShardKind::Redis => self.redis_shard_count = count,
            ShardKind::Bucket => self.bucket_shard_count = count,
        }
        self
    }

    /// Sets the number of lock stripes.
    #[must_use]
    pub fn with_stripe_count(mut self, count: usize) -> Self {
        self.stripe_count = count;
        self
    }

    /// Sets the segment capacity.
    #[must_use]
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the background flush interval.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the flush batch size.
    #[must_use]
    pub fn with_flush_batch_size(mut self, size: usize) -> Self {
        self.flush_batch_size = size;
        self
    }

    /// Sets whether flushes sync to stable storage.
    #[must_use]
    pub fn with_sync_on_flush(mut self, value: bool) -> Self {
        self.sync_on_flush = value;
        self
    }

    /// Sets the volume root directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Directory of a volume under the data root, if any.
    #[must_use]
    pub fn volume_dir(&self, volume: &str) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|root| root.join(volume))
    }
}
