//! Routing hooks that start and stop replication slots, and the check
//! that gates standby promotion.

use crate::service::{acknowledged_watermark, ReplicationService};
use std::sync::{Arc, Weak};
use tessera_core::{
    CatchUpCheck, CoreResult, MemberId, MetadataStore, RoutingEvent, RoutingEventHook,
    RoutingService, ShardId, ShardKind, ShardRegistry, ShardStatus,
};
use tracing::{debug, warn};

/// Starts slots on the member that is primary for a shard.
///
/// Reacts to `StandbyAttached` when the local member is primary, and to
/// `PrimaryOwnershipGained` for the local member by starting a slot for
/// every current standby.
pub struct StartReplicationHook {
    local: MemberId,
    routing: Weak<RoutingService>,
    replication: Arc<ReplicationService>,
}

impl StartReplicationHook {
    /// Creates the hook for `local`.
    ///
    /// `routing` is weak because the routing service owns its hooks.
    #[must_use]
    pub fn new(
        local: MemberId,
        routing: Weak<RoutingService>,
        replication: Arc<ReplicationService>,
    ) -> Self {
        Self {
            local,
            routing,
            replication,
        }
    }
}

impl RoutingEventHook for StartReplicationHook {
    fn name(&self) -> &str {
        "start-replication"
    }

    fn on_event(&self, event: &RoutingEvent) -> CoreResult<()> {
        let Some(routing) = self.routing.upgrade() else {
            return Ok(());
        };
        match event {
            RoutingEvent::StandbyAttached { kind, id, member } => {
                let route = routing.route(*kind, *id)?;
                if route.primary.as_ref() == Some(&self.local) {
                    self.replication.start_replication(*kind, *id, member)?;
                }
            }
            RoutingEvent::PrimaryOwnershipGained { kind, id, member } if *member == self.local => {
                let route = routing.route(*kind, *id)?;
                for standby in &route.standbys {
                    self.replication.start_replication(*kind, *id, standby)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Stops slots when a standby leaves, the local member stops being
/// primary, or the shard is stopped.
///
/// Registered in the replication phase, so slots of a stopping shard are
/// gone before its volume closes.
pub struct StopReplicationHook {
    local: MemberId,
    replication: Arc<ReplicationService>,
}

impl StopReplicationHook {
    /// Creates the hook for `local`.
    #[must_use]
    pub fn new(local: MemberId, replication: Arc<ReplicationService>) -> Self {
        Self { local, replication }
    }

    fn stop(&self, kind: ShardKind, id: ShardId, standby: Option<&MemberId>) -> CoreResult<usize> {
        Ok(self.replication.stop_shard(kind, id, standby)?)
    }
}

impl RoutingEventHook for StopReplicationHook {
    fn name(&self) -> &str {
        "stop-replication"
    }

    fn on_event(&self, event: &RoutingEvent) -> CoreResult<()> {
        match event {
            RoutingEvent::StandbyDetached { kind, id, member } if *member != self.local => {
                if self.stop(*kind, *id, Some(member))? == 0 {
                    warn!(
                        shard_kind = %kind,
                        shard_id = id.0,
                        standby = %member,
                        "no replication slot to stop"
                    );
                }
            }
            RoutingEvent::PrimaryOwnershipLost { kind, id, member } if *member == self.local => {
                let stopped = self.stop(*kind, *id, None)?;
                debug!(shard_kind = %kind, shard_id = id.0, stopped, "primary ownership lost");
            }
            RoutingEvent::StatusChanged {
                kind,
                id,
                status: ShardStatus::Stopped,
                ..
            } => {
                let stopped = self.stop(*kind, *id, None)?;
                debug!(shard_kind = %kind, shard_id = id.0, stopped, "shard stopped");
            }
            _ => {}
        }
        Ok(())
    }
}

/// Reports a standby caught up once its local volume is durable up to the
/// highest watermark any slot acknowledged for it.
pub struct SlotCatchUpCheck {
    store: Arc<dyn MetadataStore>,
    shards: Arc<ShardRegistry>,
}

impl SlotCatchUpCheck {
    /// Creates a check reading slot records from `store` and volumes from
    /// the standby's `shards`.
    #[must_use]
    pub fn new(store: Arc<dyn MetadataStore>, shards: Arc<ShardRegistry>) -> Self {
        Self { store, shards }
    }
}

impl CatchUpCheck for SlotCatchUpCheck {
    fn is_caught_up(&self, kind: ShardKind, id: ShardId, member: &MemberId) -> CoreResult<bool> {
        let required = acknowledged_watermark(self.store.as_ref(), kind, id, member)?;
        let durable = self.shards.find(kind, id)?.volume().last_durable();
        debug!(
            shard_kind = %kind,
            shard_id = id.0,
            member = %member,
            required = ?required,
            durable = ?durable,
            "catch-up check"
        );
        Ok(durable >= required)
    }
}
