//! Replication slots: one stream from a primary shard to one standby.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tessera_core::{MemberId, ShardId, ShardKind, Versionstamp};
use tokio::sync::watch;

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SlotState {
    /// Streaming or ready to stream.
    Active = 0,
    /// Stopped; the watermark is frozen.
    Stopped = 1,
}

impl SlotState {
    fn from_byte(byte: u8) -> Self {
        if byte == Self::Active as u8 {
            Self::Active
        } else {
            Self::Stopped
        }
    }
}

/// Persisted form of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    /// Slot id.
    pub id: Versionstamp,
    /// Shard kind.
    pub kind: ShardKind,
    /// Shard id.
    pub shard_id: ShardId,
    /// Standby member.
    pub standby: MemberId,
    /// Last acknowledged versionstamp.
    pub watermark: Option<Versionstamp>,
    /// State when the record was written.
    pub state: SlotState,
}

/// Point-in-time view of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStats {
    /// Slot id.
    pub id: Versionstamp,
    /// Standby member.
    pub standby: MemberId,
    /// Last acknowledged versionstamp.
    pub watermark: Option<Versionstamp>,
    /// Current state.
    pub state: SlotState,
    /// Batches acknowledged.
    pub batches: u64,
    /// Data bytes acknowledged.
    pub bytes: u64,
    /// Acknowledgments rejected as regressions.
    pub rejected_acks: u64,
}

/// Tracks how far one standby has acknowledged a shard's volume.
///
/// The watermark never moves backward and never moves after [`stop`].
///
/// [`stop`]: ReplicationSlot::stop
pub struct ReplicationSlot {
    id: Versionstamp,
    kind: ShardKind,
    shard_id: ShardId,
    standby: MemberId,
    watermark: Mutex<Option<Versionstamp>>,
    state: AtomicU8,
    batches: AtomicU64,
    bytes: AtomicU64,
    rejected_acks: AtomicU64,
    stop_tx: watch::Sender<bool>,
}

impl ReplicationSlot {
    /// Creates an active slot.
    #[must_use]
    pub fn new(
        id: Versionstamp,
        kind: ShardKind,
        shard_id: ShardId,
        standby: MemberId,
        watermark: Option<Versionstamp>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            id,
            kind,
            shard_id,
            standby,
            watermark: Mutex::new(watermark),
            state: AtomicU8::new(SlotState::Active as u8),
            batches: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            rejected_acks: AtomicU64::new(0),
            stop_tx,
        }
    }

    /// Restores a slot from its persisted form.
    #[must_use]
    pub fn from_record(record: SlotRecord) -> Self {
        let slot = Self::new(
            record.id,
            record.kind,
            record.shard_id,
            record.standby,
            record.watermark,
        );
        if record.state == SlotState::Stopped {
            slot.stop();
        }
        slot
    }

    /// Persisted form of the slot.
    #[must_use]
    pub fn record(&self) -> SlotRecord {
        let watermark = self.watermark.lock();
        self.record_with(*watermark, self.state())
    }

    fn record_with(&self, watermark: Option<Versionstamp>, state: SlotState) -> SlotRecord {
        SlotRecord {
            id: self.id,
            kind: self.kind,
            shard_id: self.shard_id,
            standby: self.standby.clone(),
            watermark,
            state,
        }
    }

    /// Slot id.
    #[must_use]
    pub fn id(&self) -> Versionstamp {
        self.id
    }

    /// Shard kind.
    #[must_use]
    pub fn kind(&self) -> ShardKind {
        self.kind
    }

    /// Shard id.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Standby member.
    #[must_use]
    pub fn standby(&self) -> &MemberId {
        &self.standby
    }

    /// Last acknowledged versionstamp.
    #[must_use]
    pub fn watermark(&self) -> Option<Versionstamp> {
        *self.watermark.lock()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SlotState {
        SlotState::from_byte(self.state.load(Ordering::Acquire))
    }

    /// Returns true once the slot is stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() == SlotState::Stopped
    }

    /// Receiver that flips to `true` when the slot stops.
    #[must_use]
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Stops the slot. Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        // Serializes with watermark updates.
        let _watermark = self.watermark.lock();
        let previous = self.state.swap(SlotState::Stopped as u8, Ordering::AcqRel);
        self.stop_tx.send_replace(true);
        previous == SlotState::Active as u8
    }

    /// Applies an acknowledgment.
    ///
    /// Returns true if the watermark advanced. Acknowledgments that repeat
    /// the watermark, or arrive after stop, are ignored.
    ///
    /// # Errors
    ///
    /// Returns `WatermarkRegression` for an acknowledgment behind the
    /// watermark.
    pub fn acknowledge(&self, versionstamp: Versionstamp) -> ReplicationResult<bool> {
        self.acknowledge_with(versionstamp, |_| Ok(()))
    }

    /// Applies an acknowledgment, running `persist` with the updated record
    /// before the new watermark becomes visible.
    ///
    /// `persist` runs under the slot lock, so it never observes a stopped
    /// slot. If it fails the watermark is unchanged.
    ///
    /// # Errors
    ///
    /// Returns `WatermarkRegression` or the error from `persist`.
    pub fn acknowledge_with<F>(
        &self,
        versionstamp: Versionstamp,
        persist: F,
    ) -> ReplicationResult<bool>
    where
        F: FnOnce(&SlotRecord) -> ReplicationResult<()>,
    {
        let mut watermark = self.watermark.lock();
        if self.is_stopped() {
            return Ok(false);
        }
        if let Some(current) = *watermark {
            if versionstamp < current {
                self.rejected_acks.fetch_add(1, Ordering::Relaxed);
                return Err(ReplicationError::WatermarkRegression {
                    slot: self.id.to_string(),
                    current: current.to_string(),
                    received: versionstamp.to_string(),
                });
            }
            if versionstamp == current {
                return Ok(false);
            }
        }

        persist(&self.record_with(Some(versionstamp), SlotState::Active))?;
        *watermark = Some(versionstamp);
        Ok(true)
    }

    /// Counts one acknowledged batch of `bytes` data bytes.
    pub fn record_batch(&self, bytes: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> SlotStats {
        SlotStats {
            id: self.id,
            standby: self.standby.clone(),
            watermark: self.watermark(),
            state: self.state(),
            batches: self.batches.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            rejected_acks: self.rejected_acks.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ReplicationSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationSlot")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("shard_id", &self.shard_id)
            .field("standby", &self.standby)
            .field("watermark", &self.watermark())
            .field("state", &self.state())
            .finish()
    }
}
