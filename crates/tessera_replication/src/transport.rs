//! Transport layer abstraction for replication.

use crate::error::{ReplicationError, ReplicationResult};
use crate::standby::StandbyApplier;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::MemberId;
use tessera_protocol::{ReplicationAck, ReplicationBatch};

/// Delivers replication batches to standby members.
///
/// `send` blocks until the standby acknowledges or the attempt fails; the
/// replication service calls it from the blocking pool.
pub trait ReplicationTransport: Send + Sync {
    /// Sends one batch and waits for the acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns a transport error, marked retryable when the same batch may
    /// be sent again.
    fn send(
        &self,
        standby: &MemberId,
        batch: &ReplicationBatch,
    ) -> ReplicationResult<ReplicationAck>;
}

/// Delivers batches to in-process standby appliers.
///
/// Batches and acknowledgments go through their wire encoding.
#[derive(Default)]
pub struct LoopbackTransport {
    endpoints: RwLock<HashMap<MemberId, Arc<StandbyApplier>>>,
}

impl LoopbackTransport {
    /// Creates a transport with no endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes batches for `member` to `applier`.
    pub fn register(&self, member: MemberId, applier: Arc<StandbyApplier>) {
        self.endpoints.write().insert(member, applier);
    }

    /// Removes the endpoint for `member`.
    pub fn unregister(&self, member: &MemberId) -> bool {
        self.endpoints.write().remove(member).is_some()
    }
}

impl ReplicationTransport for LoopbackTransport {
    fn send(
        &self,
        standby: &MemberId,
        batch: &ReplicationBatch,
    ) -> ReplicationResult<ReplicationAck> {
        let applier = self
            .endpoints
            .read()
            .get(standby)
            .cloned()
            .ok_or_else(|| {
                ReplicationError::transport(format!("no endpoint for {standby}"), true)
            })?;

        let received = ReplicationBatch::decode(&batch.encode()?)?;
        let ack = applier.apply(&received)?;
        Ok(ReplicationAck::decode(&ack.encode()?)?)
    }
}

/// A mock transport for testing.
///
/// Acknowledges each batch with its last versionstamp unless a failure or
/// a fixed acknowledgment is queued.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<(MemberId, ReplicationBatch)>>,
    failures: Mutex<Vec<ReplicationError>>,
    fixed_ack: Mutex<Option<[u8; 12]>>,
}

impl MockTransport {
    /// Creates a mock that acknowledges everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next sends fail with `error`, in queue order.
    pub fn push_failure(&self, error: ReplicationError) {
        self.failures.lock().push(error);
    }

    /// Acknowledges every batch with `versionstamp` instead of its last one.
    pub fn set_fixed_ack(&self, versionstamp: Option<[u8; 12]>) {
        *self.fixed_ack.lock() = versionstamp;
    }

    /// Batches delivered so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(MemberId, ReplicationBatch)> {
        self.sent.lock().clone()
    }

    /// Number of batches delivered so far.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl ReplicationTransport for MockTransport {
    fn send(
        &self,
        standby: &MemberId,
        batch: &ReplicationBatch,
    ) -> ReplicationResult<ReplicationAck> {
        {
            let mut failures = self.failures.lock();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }

        let versionstamp = match *self.fixed_ack.lock() {
            Some(fixed) => fixed,
            None => batch
                .last_versionstamp()
                .ok_or_else(|| ReplicationError::malformed("empty batch"))?,
        };
        self.sent.lock().push((standby.clone(), batch.clone()));
        Ok(ReplicationAck {
            slot_id: batch.slot_id,
            versionstamp,
        })
    }
}
