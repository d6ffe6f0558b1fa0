//! # Tessera Protocol
//!
//! Wire types exchanged with a Tessera storage node.
//!
//! This crate provides:
//! - [`SegmentInsertRequest`] / [`SegmentRangeRequest`] for the binary
//!   insert and range-read protocols
//! - [`ReplicationBatch`] / [`ReplicationAck`] for the primary -> standby stream
//! - [`ShardDescription`] for administrative tooling
//! - CBOR encoding/decoding for all of the above
//!
//! This is a pure protocol crate with no I/O. Framing and dispatch live in
//! the session layer.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod describe;
mod error;
mod messages;
mod replication;

pub use describe::ShardDescription;
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    Message, PackedEntry, SegmentInsertRequest, SegmentRange, SegmentRangeRequest,
    SegmentRangeResponse,
};
pub use replication::{
    ReplicatedEntry, ReplicationAck, ReplicationBatch, SegmentChunk, VERSIONSTAMP_LEN,
};
