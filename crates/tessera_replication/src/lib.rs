//! # Tessera Replication
//!
//! Streams durable volume data from a primary shard to its standbys.
//!
//! Each standby attachment gets a [`ReplicationSlot`], identified by the
//! versionstamp of the transaction that created it. A tokio task per slot
//! waits for the volume to publish new durable entries, reads their byte
//! ranges and ships them through a [`ReplicationTransport`]. The standby's
//! [`StandbyApplier`] writes the bytes at the same positions and answers
//! with its durable versionstamp, which becomes the slot's watermark.
//!
//! ## Routing integration
//!
//! [`StartReplicationHook`] and [`StopReplicationHook`] tie slots to
//! routing events. [`SlotCatchUpCheck`] gates standby promotion on the
//! acknowledged watermark.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod hook;
mod service;
mod slot;
mod standby;
mod transport;

pub use config::{ReplicationConfig, RetryConfig};
pub use error::{ReplicationError, ReplicationResult};
pub use hook::{SlotCatchUpCheck, StartReplicationHook, StopReplicationHook};
pub use service::{acknowledged_watermark, ReplicationService};
pub use slot::{ReplicationSlot, SlotRecord, SlotState, SlotStats};
pub use standby::StandbyApplier;
pub use transport::{LoopbackTransport, MockTransport, ReplicationTransport};
