//! # Tessera Core
//!
//! Per-shard storage engine of a sharded, Redis-compatible database.
//!
//! This crate provides:
//! - [`StripedLockTable`] for bounded, deadlock-free key locking
//! - [`Shard`] with its persistence queue, key index and background flush
//! - [`Volume`] / [`Segment`] append-only durable storage
//! - [`RoutingService`] for shard routes, status and standby promotion
//! - [`RoutingEventHook`] to react to routing changes
//!
//! ## Write path
//!
//! A decoded command locks the stripes of its keys, mutates the shard and
//! marks the keys dirty. The shard's flush task later packs the latest value
//! of each dirty key into the volume and flushes it; only then do the new
//! entries become visible to replication.
//!
//! ## Errors
//!
//! Every fallible call returns [`CoreError`]; [`CoreError::kind`] tells
//! callers whether to retry, re-route, or give up.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod lock;
mod metadata;
mod routing;
mod shard;
mod types;
mod volume;

pub use config::{Config, DEFAULT_SHARD_COUNT, DEFAULT_STRIPE_COUNT};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use lock::{HeldStripes, LockMode, ReadGuard, StripeGuard, StripedLockTable, WriteGuard};
pub use metadata::{
    decode_cbor, encode_cbor, metadata_key, MemoryMetadataStore, MetadataStore, Mutation,
};
pub use routing::{
    CatchUpCheck, HookPhase, HookRegistry, Member, MemberRegistry, MemberStatus, Route,
    RoutingEvent, RoutingEventHook, RoutingService,
};
pub use shard::{
    spawn_flush_task, Command, FlushTask, Index, KeyAccess, KeyRecord, PersistenceQueue, Reply,
    Shard, ShardRegistry, StoredValue,
};
pub use types::{
    read_shard_id, volume_name, wall_clock_micros, MemberId, ShardId, ShardKind, ShardStatus,
    Versionstamp,
};
pub use volume::{
    compute_crc32, parse_segment_id, segment_name, Changelog, EntryMetadata, Segment,
    SegmentStats, Volume, VolumeConfig, VolumeService, VolumeState, VolumeStats, CHANGELOG_FILE,
    LOCK_FILE, SEGMENTS_DIR,
};
