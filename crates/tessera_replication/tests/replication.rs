//! End-to-end replication between in-process members.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    Command, Config, CoreError, CoreResult, HookPhase, Member, MemberId, MemberRegistry,
    MemoryMetadataStore, MetadataStore, RoutingEvent, RoutingEventHook, RoutingService, Shard,
    ShardId, ShardKind, ShardRegistry, ShardStatus, StoredValue, VolumeService,
};
use tessera_replication::{
    LoopbackTransport, ReplicationConfig, ReplicationService, ReplicationSlot,
    ReplicationTransport, RetryConfig, SlotCatchUpCheck, StandbyApplier, StartReplicationHook,
    StopReplicationHook,
};
use tessera_protocol::PackedEntry;
use tokio::runtime::Handle;

const KIND: ShardKind = ShardKind::Redis;
const SHARD: ShardId = ShardId::new(0);

struct Cluster {
    store: Arc<MemoryMetadataStore>,
    routing: Arc<RoutingService>,
    primary_id: MemberId,
    standby_id: MemberId,
    primary: Arc<ShardRegistry>,
    standby: Arc<ShardRegistry>,
    replication: Arc<ReplicationService>,
}

impl Cluster {
    fn new() -> Self {
        let store = Arc::new(MemoryMetadataStore::new());
        let members = Arc::new(MemberRegistry::new());
        let primary_id = MemberId::generate();
        let standby_id = MemberId::generate();
        members
            .add(Member::new(primary_id.clone(), "10.0.0.1:6379", "10.0.1.1:7000"))
            .unwrap();
        members
            .add(Member::new(standby_id.clone(), "10.0.0.2:6379", "10.0.1.2:7000"))
            .unwrap();
        let routing = Arc::new(
            RoutingService::new(
                Config::default(),
                Arc::clone(&store) as Arc<dyn MetadataStore>,
                members,
            )
            .unwrap(),
        );

        let primary = Arc::new(ShardRegistry::new(
            Config::default(),
            Arc::new(VolumeService::new()),
        ));
        primary
            .open_shard(KIND, SHARD)
            .unwrap()
            .transition(ShardStatus::ReadWrite)
            .unwrap();
        let standby = Arc::new(ShardRegistry::new(
            Config::default(),
            Arc::new(VolumeService::new()),
        ));
        standby.open_shard(KIND, SHARD).unwrap();

        let transport = Arc::new(LoopbackTransport::new());
        transport.register(
            standby_id.clone(),
            Arc::new(StandbyApplier::new(Arc::clone(&standby))),
        );
        let config = ReplicationConfig::new()
            .with_batch_entry_limit(2)
            .with_idle_poll_interval(Duration::from_millis(10))
            .with_retry(RetryConfig::new(3).with_initial_delay(Duration::from_millis(1)));
        let replication = Arc::new(ReplicationService::new(
            config,
            Arc::clone(&primary),
            Arc::clone(&store) as Arc<dyn MetadataStore>,
            transport as Arc<dyn ReplicationTransport>,
            Handle::current(),
        ));

        Self {
            store,
            routing,
            primary_id,
            standby_id,
            primary,
            standby,
            replication,
        }
    }

    fn register_replication_hooks(&self) {
        self.routing.register_hook(
            HookPhase::Replication,
            Arc::new(StartReplicationHook::new(
                self.primary_id.clone(),
                Arc::downgrade(&self.routing),
                Arc::clone(&self.replication),
            )),
        );
        self.routing.register_hook(
            HookPhase::Replication,
            Arc::new(StopReplicationHook::new(
                self.primary_id.clone(),
                Arc::clone(&self.replication),
            )),
        );
    }

    fn primary_shard(&self) -> Arc<Shard> {
        self.primary.find(KIND, SHARD).unwrap()
    }

    fn standby_shard(&self) -> Arc<Shard> {
        self.standby.find(KIND, SHARD).unwrap()
    }

    fn attach(&self) -> Arc<ReplicationSlot> {
        self.routing.set_primary(KIND, SHARD, &self.primary_id).unwrap();
        self.routing
            .attach_standby(KIND, SHARD, &self.standby_id)
            .unwrap();
        let slots = self.replication.slots_for_shard(KIND, SHARD);
        assert_eq!(slots.len(), 1);
        Arc::clone(&slots[0])
    }

    async fn write_and_flush(&self, commands: Vec<Command>) {
        let shard = self.primary_shard();
        for command in commands {
            command.execute(&shard).unwrap();
        }
        shard.drain().unwrap();
    }
}

async fn caught_up(slot: &ReplicationSlot, shard: &Shard) {
    for _ in 0..1000 {
        let target = shard.volume().last_durable();
        if target.is_some() && slot.watermark() == target {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("standby never caught up");
}

fn value_of(shard: &Shard, key: &str) -> Option<StoredValue> {
    let guard = shard.read(&[key]);
    shard.get(&guard, key).unwrap()
}

fn set(key: &str, value: &'static [u8]) -> Command {
    Command::Set {
        key: key.into(),
        value: Bytes::from_static(value),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn primary_writes_reach_standby() {
    let cluster = Cluster::new();
    cluster.register_replication_hooks();
    let slot = cluster.attach();

    cluster
        .write_and_flush(vec![set("a", b"1"), set("b", b"2"), set("c", b"3")])
        .await;
    cluster
        .write_and_flush(vec![
            Command::Rename {
                from: "a".into(),
                to: "d".into(),
            },
            set("b", b"22"),
        ])
        .await;
    caught_up(&slot, &cluster.primary_shard()).await;

    let standby = cluster.standby_shard();
    assert_eq!(value_of(&standby, "a"), None);
    assert_eq!(
        value_of(&standby, "d"),
        Some(StoredValue::String(Bytes::from_static(b"1")))
    );
    assert_eq!(
        value_of(&standby, "b"),
        Some(StoredValue::String(Bytes::from_static(b"22")))
    );
    assert_eq!(standby.len(), 3);
    assert_eq!(
        standby.volume().last_durable(),
        cluster.primary_shard().volume().last_durable()
    );
    // Standby state is never queued for flushing.
    assert!(standby.queue().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raw_segment_inserts_replicate_alongside_appends() {
    let cluster = Cluster::new();
    cluster.register_replication_hooks();
    let slot = cluster.attach();

    cluster.write_and_flush(vec![set("a", b"1")]).await;
    let volume = cluster.primary_shard().volume().clone();
    let last = volume.entries().unwrap().last().cloned().unwrap();
    let cursor = last.position + u64::from(last.length);
    let written = volume
        .insert(
            &last.segment,
            &[PackedEntry::new(cursor, Bytes::from_static(b"\xffraw"))],
        )
        .unwrap();
    assert_eq!(written, vec![cursor]);
    volume.flush(true).unwrap();

    cluster
        .write_and_flush(vec![set("b", b"2"), set("c", b"3")])
        .await;
    caught_up(&slot, &cluster.primary_shard()).await;

    let standby = cluster.standby_shard();
    assert_eq!(
        standby.volume().last_durable(),
        cluster.primary_shard().volume().last_durable()
    );
    assert_eq!(
        standby.volume().entries().unwrap(),
        volume.entries().unwrap()
    );
    assert_eq!(
        standby.volume().read_range(&last.segment, cursor, 4).unwrap(),
        Bytes::from_static(b"\xffraw")
    );
    assert_eq!(standby.len(), 3);
    assert_eq!(
        value_of(&standby, "c"),
        Some(StoredValue::String(Bytes::from_static(b"3")))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detaching_standby_stops_its_slot() {
    let cluster = Cluster::new();
    cluster.register_replication_hooks();
    let slot = cluster.attach();
    cluster.write_and_flush(vec![set("k", b"v")]).await;
    caught_up(&slot, &cluster.primary_shard()).await;

    cluster
        .routing
        .detach_standby(KIND, SHARD, &cluster.standby_id)
        .unwrap();
    assert!(slot.is_stopped());
    assert!(cluster.replication.slots_for_shard(KIND, SHARD).is_empty());

    let frozen = slot.watermark();
    cluster.write_and_flush(vec![set("k", b"w")]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(slot.watermark(), frozen);

    // A routing event and an administrative stop may race.
    assert!(!cluster.replication.stop_replication(slot.id()).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn caught_up_standby_is_promoted() {
    let cluster = Cluster::new();
    cluster.register_replication_hooks();
    let slot = cluster.attach();
    cluster
        .write_and_flush(vec![set("x", b"1"), set("y", b"2")])
        .await;
    caught_up(&slot, &cluster.primary_shard()).await;

    let check = SlotCatchUpCheck::new(
        Arc::clone(&cluster.store) as Arc<dyn MetadataStore>,
        Arc::clone(&cluster.standby),
    );
    let err = cluster
        .routing
        .promote_standby(KIND, SHARD, &cluster.standby_id, &check)
        .unwrap_err();
    assert!(matches!(err, CoreError::PrimaryConflict { .. }));

    cluster.routing.clear_primary(KIND, SHARD).unwrap();
    assert!(slot.is_stopped());

    let events = cluster
        .routing
        .promote_standby(KIND, SHARD, &cluster.standby_id, &check)
        .unwrap();
    assert!(events.contains(&RoutingEvent::PrimaryOwnershipGained {
        kind: KIND,
        id: SHARD,
        member: cluster.standby_id.clone(),
    }));
    let route = cluster.routing.route(KIND, SHARD).unwrap();
    assert_eq!(route.primary.as_ref(), Some(&cluster.standby_id));
    assert_eq!(route.status, ShardStatus::ReadWrite);
    assert!(route.standbys.is_empty());

    // The promoted shard keeps writing after the replicated data.
    let promoted = cluster.standby_shard();
    promoted.transition(ShardStatus::ReadWrite).unwrap();
    set("z", b"3").execute(&promoted).unwrap();
    promoted.drain().unwrap();
    assert!(promoted.volume().last_durable() > slot.watermark());
    assert_eq!(promoted.len(), 3);
}

#[tokio::test]
async fn lagging_standby_is_not_promoted() {
    let cluster = Cluster::new();
    cluster
        .routing
        .set_primary(KIND, SHARD, &cluster.primary_id)
        .unwrap();
    cluster
        .routing
        .attach_standby(KIND, SHARD, &cluster.standby_id)
        .unwrap();

    // The old primary recorded an acknowledgment the standby volume lacks.
    let slot = cluster
        .replication
        .create_slot(KIND, SHARD, &cluster.standby_id)
        .unwrap();
    cluster.write_and_flush(vec![set("x", b"1")]).await;
    let acked = cluster.primary_shard().volume().last_durable().unwrap();
    cluster
        .replication
        .acknowledge(&tessera_protocol::ReplicationAck {
            slot_id: slot.id().to_bytes(),
            versionstamp: acked.to_bytes(),
        })
        .unwrap();
    cluster.routing.clear_primary(KIND, SHARD).unwrap();

    let check = SlotCatchUpCheck::new(
        Arc::clone(&cluster.store) as Arc<dyn MetadataStore>,
        Arc::clone(&cluster.standby),
    );
    let err = cluster
        .routing
        .promote_standby(KIND, SHARD, &cluster.standby_id, &check)
        .unwrap_err();
    assert!(matches!(err, CoreError::NotCaughtUp { .. }));

    let route = cluster.routing.route(KIND, SHARD).unwrap();
    assert_eq!(route.primary, None);
    assert!(route.standbys.contains(&cluster.standby_id));
    assert_eq!(route.status, ShardStatus::Initializing);
}

/// Records whether the slot was already stopped when storage hooks ran.
struct SlotObserver {
    slot: Arc<ReplicationSlot>,
    stopped_first: AtomicBool,
}

impl RoutingEventHook for SlotObserver {
    fn name(&self) -> &str {
        "slot-observer"
    }

    fn on_event(&self, event: &RoutingEvent) -> CoreResult<()> {
        if matches!(
            event,
            RoutingEvent::StatusChanged {
                status: ShardStatus::Stopped,
                ..
            }
        ) {
            self.stopped_first
                .store(self.slot.is_stopped(), Ordering::SeqCst);
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_shard_detaches_slots_before_volume_teardown() {
    let cluster = Cluster::new();
    cluster.register_replication_hooks();
    let slot = cluster.attach();
    cluster.write_and_flush(vec![set("k", b"v")]).await;
    caught_up(&slot, &cluster.primary_shard()).await;

    // Registered before the shard registry, still runs after replication.
    let observer = Arc::new(SlotObserver {
        slot: Arc::clone(&slot),
        stopped_first: AtomicBool::new(false),
    });
    cluster
        .routing
        .register_hook(HookPhase::Storage, Arc::clone(&observer) as Arc<dyn RoutingEventHook>);
    cluster.routing.register_hook(
        HookPhase::Storage,
        Arc::clone(&cluster.primary) as Arc<dyn RoutingEventHook>,
    );

    let volume = Arc::clone(cluster.primary_shard().volume());
    cluster
        .routing
        .set_status(KIND, SHARD, ShardStatus::Stopped)
        .unwrap();

    assert!(observer.stopped_first.load(Ordering::SeqCst));
    assert!(slot.is_stopped());
    assert!(matches!(
        cluster.primary.find(KIND, SHARD),
        Err(CoreError::ShardNotFound { .. })
    ));
    assert_eq!(volume.state(), tessera_core::VolumeState::Closed);
}
