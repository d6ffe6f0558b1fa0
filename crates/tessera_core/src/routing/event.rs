//! Routing events and the hooks that react to them.

use crate::error::CoreResult;
use crate::types::{MemberId, ShardId, ShardKind, ShardStatus};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// A change to a shard's route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    /// `member` is no longer the shard's primary.
    PrimaryOwnershipLost {
        /// Shard kind.
        kind: ShardKind,
        /// Shard id.
        id: ShardId,
        /// Former primary.
        member: MemberId,
    },
    /// `member` became the shard's primary.
    PrimaryOwnershipGained {
        /// Shard kind.
        kind: ShardKind,
        /// Shard id.
        id: ShardId,
        /// New primary.
        member: MemberId,
    },
    /// `member` was attached as a standby.
    StandbyAttached {
        /// Shard kind.
        kind: ShardKind,
        /// Shard id.
        id: ShardId,
        /// Standby member.
        member: MemberId,
    },
    /// `member` is no longer a standby.
    StandbyDetached {
        /// Shard kind.
        kind: ShardKind,
        /// Shard id.
        id: ShardId,
        /// Former standby.
        member: MemberId,
    },
    /// The shard status changed.
    StatusChanged {
        /// Shard kind.
        kind: ShardKind,
        /// Shard id.
        id: ShardId,
        /// Status before the change.
        previous: ShardStatus,
        /// Status after the change.
        status: ShardStatus,
    },
}

impl RoutingEvent {
    /// Shard the event is about.
    #[must_use]
    pub fn shard(&self) -> (ShardKind, ShardId) {
        match self {
            Self::PrimaryOwnershipLost { kind, id, .. }
            | Self::PrimaryOwnershipGained { kind, id, .. }
            | Self::StandbyAttached { kind, id, .. }
            | Self::StandbyDetached { kind, id, .. }
            | Self::StatusChanged { kind, id, .. } => (*kind, *id),
        }
    }

    /// Short event name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PrimaryOwnershipLost { .. } => "primary_ownership_lost",
            Self::PrimaryOwnershipGained { .. } => "primary_ownership_gained",
            Self::StandbyAttached { .. } => "standby_attached",
            Self::StandbyDetached { .. } => "standby_detached",
            Self::StatusChanged { .. } => "status_changed",
        }
    }
}

/// Reacts to routing events.
pub trait RoutingEventHook: Send + Sync {
    /// Hook name for logs.
    fn name(&self) -> &str;

    /// Handles one event.
    ///
    /// # Errors
    ///
    /// Errors are logged by the dispatcher and do not stop other hooks.
    fn on_event(&self, event: &RoutingEvent) -> CoreResult<()>;
}

/// Order in which hook groups see an event.
///
/// Replication hooks run before storage hooks, so slots of a stopping
/// shard are detached before its volume is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookPhase {
    /// Replication slot management.
    Replication,
    /// Local shards and volumes.
    Storage,
}

/// Ordered set of registered hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<(HookPhase, Arc<dyn RoutingEventHook>)>>,
}

impl HookRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook. Hooks of one phase run in registration order.
    pub fn register(&self, phase: HookPhase, hook: Arc<dyn RoutingEventHook>) {
        let mut hooks = self.hooks.write();
        hooks.push((phase, hook));
        hooks.sort_by_key(|(phase, _)| *phase);
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    /// Returns true if no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers events in order; every hook sees each event.
    pub fn dispatch(&self, events: &[RoutingEvent]) {
        let hooks = self.hooks.read().clone();
        for event in events {
            let (kind, id) = event.shard();
            debug!(event = event.name(), shard_kind = %kind, shard_id = id.0, "routing event");
            for (phase, hook) in &hooks {
                if let Err(e) = hook.on_event(event) {
                    warn!(
                        hook = hook.name(),
                        phase = ?phase,
                        event = event.name(),
                        shard_kind = %kind,
                        shard_id = id.0,
                        error = %e,
                        "routing hook failed"
                    );
                }
            }
        }
    }
}
