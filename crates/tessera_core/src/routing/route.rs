//! Shard routes and the routing state machine.
//!
//! A route names a shard's primary, its standbys, the standbys replicated
//! synchronously, and the shard status. Every change is committed to the
//! metadata store, bumps the routing epoch, and is then announced to the
//! registered hooks as [`RoutingEvent`]s.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::metadata::{decode_cbor, metadata_key, MetadataStore, Mutation};
use crate::routing::event::{HookPhase, HookRegistry, RoutingEvent, RoutingEventHook};
use crate::routing::member::MemberRegistry;
use crate::types::{volume_name, MemberId, ShardId, ShardKind, ShardStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_protocol::ShardDescription;
use tracing::info;

const ROUTES_PREFIX: &str = "routes";

/// Replica topology and status of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Current primary.
    pub primary: Option<MemberId>,
    /// Standby members.
    pub standbys: BTreeSet<MemberId>,
    /// Standbys replicated synchronously; a subset of `standbys`.
    pub sync_standbys: BTreeSet<MemberId>,
    /// Shard status.
    pub status: ShardStatus,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            primary: None,
            standbys: BTreeSet::new(),
            sync_standbys: BTreeSet::new(),
            status: ShardStatus::Initializing,
        }
    }
}

/// Decides whether a standby holds everything the old primary
/// acknowledged as replicated.
pub trait CatchUpCheck: Send + Sync {
    /// Returns true if `member` has caught up on the shard.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be inspected.
    fn is_caught_up(&self, kind: ShardKind, id: ShardId, member: &MemberId) -> CoreResult<bool>;
}

/// Owns all routes and applies routing commands.
pub struct RoutingService {
    config: Config,
    store: Arc<dyn MetadataStore>,
    members: Arc<MemberRegistry>,
    routes: Mutex<HashMap<(ShardKind, ShardId), Route>>,
    epoch: AtomicU64,
    hooks: HookRegistry,
}

fn route_key(kind: ShardKind, id: ShardId) -> Vec<u8> {
    metadata_key(&[ROUTES_PREFIX, kind.as_str(), &id.0.to_string()])
}

impl RoutingService {
    /// Creates the service and loads persisted routes.
    ///
    /// # Errors
    ///
    /// Returns an error if stored routes cannot be read or decoded.
    pub fn new(
        config: Config,
        store: Arc<dyn MetadataStore>,
        members: Arc<MemberRegistry>,
    ) -> CoreResult<Self> {
        let mut routes = HashMap::new();
        for kind in ShardKind::ALL {
            for id in 0..config.shard_count(kind) {
                if let Some(raw) = store.get(&route_key(kind, ShardId(id)))? {
                    routes.insert((kind, ShardId(id)), decode_cbor::<Route>(&raw)?);
                }
            }
        }
        Ok(Self {
            config,
            store,
            members,
            routes: Mutex::new(routes),
            epoch: AtomicU64::new(0),
            hooks: HookRegistry::new(),
        })
    }

    /// Registers a routing event hook.
    pub fn register_hook(&self, phase: HookPhase, hook: Arc<dyn RoutingEventHook>) {
        self.hooks.register(phase, hook);
    }

    /// Member registry.
    #[must_use]
    pub fn members(&self) -> &Arc<MemberRegistry> {
        &self.members
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of route changes applied since start.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn check_shard(&self, kind: ShardKind, id: ShardId) -> CoreResult<()> {
        if id.0 >= self.config.shard_count(kind) {
            return Err(CoreError::InvalidShardId {
                value: id.0.to_string(),
            });
        }
        Ok(())
    }

    fn check_member(&self, member: &MemberId) -> CoreResult<()> {
        if self.members.contains(member) {
            Ok(())
        } else {
            Err(CoreError::MemberNotFound {
                id: member.to_string(),
            })
        }
    }

    /// Current route of a shard.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShardId` for ids outside the configured range.
    pub fn route(&self, kind: ShardKind, id: ShardId) -> CoreResult<Route> {
        self.check_shard(kind, id)?;
        Ok(self
            .routes
            .lock()
            .get(&(kind, id))
            .cloned()
            .unwrap_or_default())
    }

    /// Applies `change` to a route, commits it and dispatches its events.
    ///
    /// `change` returns the events to publish; an empty list with an
    /// unchanged route commits nothing.
    fn update<F>(&self, kind: ShardKind, id: ShardId, change: F) -> CoreResult<Vec<RoutingEvent>>
    where
        F: FnOnce(&mut Route) -> CoreResult<Vec<RoutingEvent>>,
    {
        self.check_shard(kind, id)?;
        let events = {
            let mut routes = self.routes.lock();
            let current = routes.get(&(kind, id)).cloned().unwrap_or_default();
            let mut next = current.clone();
            let events = change(&mut next)?;
            if next == current {
                return Ok(events);
            }
            self.store
                .commit(vec![Mutation::set_cbor(route_key(kind, id), &next)?])?;
            routes.insert((kind, id), next);
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            info!(shard_kind = %kind, shard_id = id.0, epoch, "route updated");
            events
        };
        self.hooks.dispatch(&events);
        Ok(events)
    }

    /// Makes `member` the primary.
    ///
    /// A standby being made primary leaves the standby set.
    ///
    /// # Errors
    ///
    /// Returns `PrimaryConflict` if another member is primary, or
    /// `MemberNotFound` for unknown members.
    pub fn set_primary(
        &self,
        kind: ShardKind,
        id: ShardId,
        member: &MemberId,
    ) -> CoreResult<Vec<RoutingEvent>> {
        self.check_member(member)?;
        self.update(kind, id, |route| {
            match &route.primary {
                Some(current) if current == member => return Ok(Vec::new()),
                Some(current) => {
                    return Err(CoreError::PrimaryConflict {
                        current: current.to_string(),
                    })
                }
                None => {}
            }
            let mut events = Vec::new();
            if route.standbys.remove(member) {
                route.sync_standbys.remove(member);
                events.push(RoutingEvent::StandbyDetached {
                    kind,
                    id,
                    member: member.clone(),
                });
            }
            route.primary = Some(member.clone());
            events.push(RoutingEvent::PrimaryOwnershipGained {
                kind,
                id,
                member: member.clone(),
            });
            Ok(events)
        })
    }

    /// Clears the primary. A shard without primary is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShardId` or a metadata store error.
    pub fn clear_primary(&self, kind: ShardKind, id: ShardId) -> CoreResult<Vec<RoutingEvent>> {
        self.update(kind, id, |route| {
            Ok(route
                .primary
                .take()
                .map(|member| RoutingEvent::PrimaryOwnershipLost { kind, id, member })
                .into_iter()
                .collect())
        })
    }

    /// Attaches a standby. Attaching twice is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if `member` is unknown or is the primary.
    pub fn attach_standby(
        &self,
        kind: ShardKind,
        id: ShardId,
        member: &MemberId,
    ) -> CoreResult<Vec<RoutingEvent>> {
        self.check_member(member)?;
        self.update(kind, id, |route| {
            if route.primary.as_ref() == Some(member) {
                return Err(CoreError::invalid_operation(
                    "the primary cannot be its own standby",
                ));
            }
            if !route.standbys.insert(member.clone()) {
                return Ok(Vec::new());
            }
            Ok(vec![RoutingEvent::StandbyAttached {
                kind,
                id,
                member: member.clone(),
            }])
        })
    }

    /// Detaches a standby.
    ///
    /// # Errors
    ///
    /// Returns `NotAStandby` if `member` is not attached.
    pub fn detach_standby(
        &self,
        kind: ShardKind,
        id: ShardId,
        member: &MemberId,
    ) -> CoreResult<Vec<RoutingEvent>> {
        self.update(kind, id, |route| {
            if !route.standbys.remove(member) {
                return Err(CoreError::NotAStandby {
                    member: member.to_string(),
                });
            }
            route.sync_standbys.remove(member);
            Ok(vec![RoutingEvent::StandbyDetached {
                kind,
                id,
                member: member.clone(),
            }])
        })
    }

    /// Replaces the set of synchronously replicated standbys.
    ///
    /// # Errors
    ///
    /// Returns `NotAStandby` if any member is not attached.
    pub fn set_sync_standbys(
        &self,
        kind: ShardKind,
        id: ShardId,
        members: &[MemberId],
    ) -> CoreResult<()> {
        self.update(kind, id, |route| {
            if let Some(stray) = members.iter().find(|m| !route.standbys.contains(*m)) {
                return Err(CoreError::NotAStandby {
                    member: stray.to_string(),
                });
            }
            route.sync_standbys = members.iter().cloned().collect();
            Ok(Vec::new())
        })?;
        Ok(())
    }

    /// Sets the shard status.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStatusTransition` for moves the state machine forbids.
    pub fn set_status(
        &self,
        kind: ShardKind,
        id: ShardId,
        status: ShardStatus,
    ) -> CoreResult<Vec<RoutingEvent>> {
        self.update(kind, id, |route| Self::change_status(kind, id, route, status))
    }

    fn change_status(
        kind: ShardKind,
        id: ShardId,
        route: &mut Route,
        status: ShardStatus,
    ) -> CoreResult<Vec<RoutingEvent>> {
        let previous = route.status;
        if !previous.can_transition_to(status) {
            return Err(CoreError::InvalidStatusTransition {
                from: previous.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        if previous == status {
            return Ok(Vec::new());
        }
        route.status = status;
        Ok(vec![RoutingEvent::StatusChanged {
            kind,
            id,
            previous,
            status,
        }])
    }

    /// Removes a member from every route and from the member registry.
    ///
    /// Returns the events of all affected routes.
    ///
    /// # Errors
    ///
    /// Returns a metadata store error; routes already updated stay updated.
    pub fn remove_member(&self, member: &MemberId) -> CoreResult<Vec<RoutingEvent>> {
        let affected: Vec<(ShardKind, ShardId)> = {
            let routes = self.routes.lock();
            let mut affected: Vec<_> = routes
                .iter()
                .filter(|(_, r)| r.primary.as_ref() == Some(member) || r.standbys.contains(member))
                .map(|(shard, _)| *shard)
                .collect();
            affected.sort();
            affected
        };

        let mut events = Vec::new();
        for (kind, id) in affected {
            events.extend(self.update(kind, id, |route| {
                let mut events = Vec::new();
                if route.primary.as_ref() == Some(member) {
                    route.primary = None;
                    events.push(RoutingEvent::PrimaryOwnershipLost {
                        kind,
                        id,
                        member: member.clone(),
                    });
                }
                if route.standbys.remove(member) {
                    route.sync_standbys.remove(member);
                    events.push(RoutingEvent::StandbyDetached {
                        kind,
                        id,
                        member: member.clone(),
                    });
                }
                Ok(events)
            })?);
        }
        self.members.remove(member);
        info!(member = %member, routes = events.len(), "member removed");
        Ok(events)
    }

    /// Promotes a standby to primary.
    ///
    /// Requires that no primary is set and that `check` reports the standby
    /// caught up; only then the standby becomes primary and the status is
    /// set to `READWRITE`, in one route update.
    ///
    /// # Errors
    ///
    /// Returns `PrimaryConflict`, `NotAStandby`, `NotCaughtUp`, or
    /// `InvalidStatusTransition` for a stopped shard. Nothing changes on
    /// error.
    pub fn promote_standby(
        &self,
        kind: ShardKind,
        id: ShardId,
        member: &MemberId,
        check: &dyn CatchUpCheck,
    ) -> CoreResult<Vec<RoutingEvent>> {
        let route = self.route(kind, id)?;
        if let Some(current) = &route.primary {
            return Err(CoreError::PrimaryConflict {
                current: current.to_string(),
            });
        }
        if !route.standbys.contains(member) {
            return Err(CoreError::NotAStandby {
                member: member.to_string(),
            });
        }
        if !check.is_caught_up(kind, id, member)? {
            return Err(CoreError::NotCaughtUp {
                member: member.to_string(),
            });
        }

        self.update(kind, id, |route| {
            // Re-check under the routes lock.
            if let Some(current) = &route.primary {
                return Err(CoreError::PrimaryConflict {
                    current: current.to_string(),
                });
            }
            if !route.standbys.remove(member) {
                return Err(CoreError::NotAStandby {
                    member: member.to_string(),
                });
            }
            route.sync_standbys.remove(member);
            route.primary = Some(member.clone());

            let mut events = vec![
                RoutingEvent::StandbyDetached {
                    kind,
                    id,
                    member: member.clone(),
                },
                RoutingEvent::PrimaryOwnershipGained {
                    kind,
                    id,
                    member: member.clone(),
                },
            ];
            events.extend(Self::change_status(kind, id, route, ShardStatus::ReadWrite)?);
            info!(shard_kind = %kind, shard_id = id.0, member = %member, "standby promoted");
            Ok(events)
        })
    }

    /// Describes a shard for administrative tooling.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShardId` for ids outside the configured range.
    pub fn describe_shard(&self, kind: ShardKind, id: ShardId) -> CoreResult<ShardDescription> {
        let route = self.route(kind, id)?;
        Ok(ShardDescription {
            primary: route
                .primary
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            standbys: route.standbys.iter().map(ToString::to_string).collect(),
            sync_standbys: route.sync_standbys.iter().map(ToString::to_string).collect(),
            status: route.status.as_str().to_string(),
            linked_volumes: vec![volume_name(kind, id)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MemoryMetadataStore;
    use crate::routing::member::Member;
    use parking_lot::Mutex as PlMutex;

    struct Fixed(bool);

    impl CatchUpCheck for Fixed {
        fn is_caught_up(&self, _: ShardKind, _: ShardId, _: &MemberId) -> CoreResult<bool> {
            Ok(self.0)
        }
    }

    #[derive(Default)]
    struct Recorder(PlMutex<Vec<RoutingEvent>>);

    impl RoutingEventHook for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_event(&self, event: &RoutingEvent) -> CoreResult<()> {
            self.0.lock().push(event.clone());
            Ok(())
        }
    }

    const K: ShardKind = ShardKind::Redis;
    const S: ShardId = ShardId(1);

    fn setup() -> (RoutingService, Arc<MemoryMetadataStore>, MemberId, MemberId) {
        let store = Arc::new(MemoryMetadataStore::new());
        let members = Arc::new(MemberRegistry::new());
        let a = MemberId::generate();
        let b = MemberId::generate();
        members.add(Member::new(a.clone(), "a:1", "a:2")).unwrap();
        members.add(Member::new(b.clone(), "b:1", "b:2")).unwrap();
        let service = RoutingService::new(Config::default(), store.clone(), members).unwrap();
        (service, store, a, b)
    }

    #[test]
    fn describe_empty_shard() {
        let (service, _, _, _) = setup();
        let description = service.describe_shard(K, S).unwrap();
        assert_eq!(description.primary, "");
        assert!(description.standbys.is_empty());
        assert_eq!(description.status, "INITIALIZING");
        assert_eq!(description.linked_volumes, vec!["redis-shard-1"]);
        assert!(service.describe_shard(K, ShardId(99)).is_err());
    }

    #[test]
    fn second_primary_is_rejected() {
        let (service, _, a, b) = setup();
        service.set_primary(K, S, &a).unwrap();
        assert!(service.set_primary(K, S, &a).unwrap().is_empty());
        assert!(matches!(
            service.set_primary(K, S, &b),
            Err(CoreError::PrimaryConflict { .. })
        ));
        assert_eq!(service.route(K, S).unwrap().primary, Some(a));
    }

    #[test]
    fn sync_standbys_must_be_standbys() {
        let (service, _, a, b) = setup();
        service.attach_standby(K, S, &a).unwrap();
        assert!(matches!(
            service.set_sync_standbys(K, S, &[a.clone(), b.clone()]),
            Err(CoreError::NotAStandby { .. })
        ));
        service.set_sync_standbys(K, S, &[a.clone()]).unwrap();

        service.detach_standby(K, S, &a).unwrap();
        let route = service.route(K, S).unwrap();
        assert!(route.standbys.is_empty());
        assert!(route.sync_standbys.is_empty());
    }

    #[test]
    fn status_follows_state_machine() {
        let (service, _, _, _) = setup();
        assert!(service.set_status(K, S, ShardStatus::ReadOnly).is_err());
        service.set_status(K, S, ShardStatus::ReadWrite).unwrap();
        service.set_status(K, S, ShardStatus::ReadOnly).unwrap();
        assert!(service.set_status(K, S, ShardStatus::ReadOnly).unwrap().is_empty());
        service.set_status(K, S, ShardStatus::Stopped).unwrap();
        assert!(matches!(
            service.set_status(K, S, ShardStatus::ReadWrite),
            Err(CoreError::InvalidStatusTransition { .. })
        ));
    }

    #[test]
    fn routes_survive_restart() {
        let (service, store, a, _) = setup();
        service.set_primary(K, S, &a).unwrap();
        service.set_status(K, S, ShardStatus::ReadWrite).unwrap();
        let epoch = service.epoch();
        assert_eq!(epoch, 2);

        let reloaded =
            RoutingService::new(Config::default(), store, Arc::clone(service.members())).unwrap();
        assert_eq!(reloaded.route(K, S).unwrap(), service.route(K, S).unwrap());
    }

    #[test]
    fn promotion_requires_cleared_primary_and_catch_up() {
        let (service, _, a, b) = setup();
        service.set_primary(K, S, &a).unwrap();
        service.attach_standby(K, S, &b).unwrap();
        service.set_status(K, S, ShardStatus::ReadWrite).unwrap();
        service.set_status(K, S, ShardStatus::ReadOnly).unwrap();

        assert!(matches!(
            service.promote_standby(K, S, &b, &Fixed(true)),
            Err(CoreError::PrimaryConflict { .. })
        ));

        service.clear_primary(K, S).unwrap();
        assert!(matches!(
            service.promote_standby(K, S, &b, &Fixed(false)),
            Err(CoreError::NotCaughtUp { .. })
        ));
        assert_eq!(service.route(K, S).unwrap().status, ShardStatus::ReadOnly);

        let recorder = Arc::new(Recorder::default());
        service.register_hook(HookPhase::Storage, recorder.clone());
        service.promote_standby(K, S, &b, &Fixed(true)).unwrap();

        let route = service.route(K, S).unwrap();
        assert_eq!(route.primary, Some(b.clone()));
        assert!(route.standbys.is_empty());
        assert_eq!(route.status, ShardStatus::ReadWrite);
        assert!(matches!(
            recorder.0.lock().last(),
            Some(RoutingEvent::StatusChanged {
                status: ShardStatus::ReadWrite,
                ..
            })
        ));
    }

    #[test]
    fn removing_a_member_detaches_it_everywhere() {
        let (service, _, a, b) = setup();
        service.set_primary(K, S, &a).unwrap();
        service.attach_standby(K, ShardId(2), &a).unwrap();
        service.attach_standby(K, S, &b).unwrap();

        let events = service.remove_member(&a).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(service.route(K, S).unwrap().primary, None);
        assert!(service.route(K, ShardId(2)).unwrap().standbys.is_empty());
        assert!(!service.members().contains(&a));
        assert!(service.route(K, S).unwrap().standbys.contains(&b));
    }
}
