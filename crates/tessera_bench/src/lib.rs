//! Benchmark utilities.

use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use tessera_core::{Config, Shard, ShardId, ShardKind, ShardStatus, Volume, VolumeConfig};

/// Random payload of `size` bytes.
pub fn random_payload(size: usize) -> Bytes {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen::<u8>()).collect::<Vec<_>>().into()
}

/// `count` distinct keys.
pub fn keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("key:{i}")).collect()
}

/// In-memory volume, opened.
pub fn memory_volume(name: &str) -> Volume {
    Volume::open_with(VolumeConfig::new(name)).expect("in-memory volume opens")
}

/// Writable shard backed by an in-memory volume.
pub fn writable_shard(config: &Config) -> Shard {
    let volume = Arc::new(memory_volume("redis-shard-0"));
    let shard = Shard::new(ShardKind::Redis, ShardId(0), volume, config);
    shard.restore().expect("empty volume restores");
    shard
        .transition(ShardStatus::ReadWrite)
        .expect("fresh shard becomes writable");
    shard
}
