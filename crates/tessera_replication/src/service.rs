//! Replication service: slot bookkeeping and one streaming task per slot.

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::slot::{ReplicationSlot, SlotRecord, SlotState};
use crate::transport::ReplicationTransport;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tessera_core::{
    decode_cbor, metadata_key, MemberId, MetadataStore, Mutation, ShardId, ShardKind,
    ShardRegistry, Versionstamp, Volume,
};
use tessera_protocol::{ReplicatedEntry, ReplicationAck, ReplicationBatch, SegmentChunk};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SLOTS: &str = "slots";
const SLOT_IDS: &str = "slot-ids";

fn slot_key(kind: ShardKind, id: ShardId, slot: Versionstamp) -> Vec<u8> {
    metadata_key(&[SLOTS, kind.as_str(), &id.to_string(), &slot.to_string()])
}

fn shard_prefix(kind: ShardKind, id: ShardId) -> Vec<u8> {
    metadata_key(&[SLOTS, kind.as_str(), &id.to_string(), ""])
}

fn persist_slot(store: &dyn MetadataStore, record: &SlotRecord) -> ReplicationResult<()> {
    store.commit(vec![Mutation::set_cbor(
        slot_key(record.kind, record.shard_id, record.id),
        record,
    )?])?;
    Ok(())
}

fn read_slot_records(
    store: &dyn MetadataStore,
    prefix: &[u8],
) -> ReplicationResult<Vec<SlotRecord>> {
    store
        .scan_prefix(prefix)?
        .into_iter()
        .map(|(_, value)| Ok(decode_cbor(&value)?))
        .collect()
}

/// Highest watermark any slot, live or stopped, recorded for `standby` on
/// a shard.
///
/// # Errors
///
/// Returns an error if the store cannot be read or holds a bad record.
pub fn acknowledged_watermark(
    store: &dyn MetadataStore,
    kind: ShardKind,
    id: ShardId,
    standby: &MemberId,
) -> ReplicationResult<Option<Versionstamp>> {
    Ok(read_slot_records(store, &shard_prefix(kind, id))?
        .into_iter()
        .filter(|r| &r.standby == standby)
        .filter_map(|r| r.watermark)
        .max())
}

async fn blocking<T, F>(f: F) -> ReplicationResult<T>
where
    F: FnOnce() -> ReplicationResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ReplicationError::Task(e.to_string()))?
}

/// Reads every durable entry past the slot's watermark, up to `limit`, and
/// packs contiguous runs of each segment into one chunk.
fn build_batch(
    slot: &ReplicationSlot,
    volume: &Volume,
    limit: usize,
) -> ReplicationResult<Option<ReplicationBatch>> {
    let entries = volume.changes_since(slot.watermark(), limit)?;
    if entries.is_empty() {
        return Ok(None);
    }

    let mut runs: Vec<(String, u64, u64)> = Vec::new();
    for entry in &entries {
        match runs.last_mut() {
            Some((segment, _, end)) if *segment == entry.segment && *end == entry.position => {
                *end = entry.end();
            }
            _ => runs.push((entry.segment.clone(), entry.position, entry.end())),
        }
    }
    let chunks = runs
        .into_iter()
        .map(|(segment, start, end)| {
            let data = volume.read_range(&segment, start, end - start)?;
            Ok(SegmentChunk {
                segment,
                position: start,
                data,
            })
        })
        .collect::<ReplicationResult<Vec<_>>>()?;

    Ok(Some(ReplicationBatch {
        slot_id: slot.id().to_bytes(),
        shard_kind: slot.kind().as_str().to_string(),
        shard_id: slot.shard_id().as_u32(),
        volume: volume.name().to_string(),
        chunks,
        entries: entries.iter().map(ReplicatedEntry::from).collect(),
    }))
}

/// Streams one slot until it stops or its volume closes.
struct SlotWorker {
    slot: Arc<ReplicationSlot>,
    volume: Arc<Volume>,
    transport: Arc<dyn ReplicationTransport>,
    store: Arc<dyn MetadataStore>,
    config: ReplicationConfig,
}

impl SlotWorker {
    async fn run(self) {
        let mut durable = self.volume.subscribe();
        let mut stop = self.slot.subscribe_stop();
        info!(
            slot = %self.slot.id(),
            shard_kind = %self.slot.kind(),
            shard_id = self.slot.shard_id().as_u32(),
            standby = %self.slot.standby(),
            "replication started"
        );

        loop {
            if self.slot.is_stopped() {
                break;
            }
            match self.ship_next().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        changed = durable.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = stop.changed() => {}
                        () = tokio::time::sleep(self.config.idle_poll_interval) => {}
                    }
                }
                Err(e) if e.is_closed() => {
                    warn!(slot = %self.slot.id(), error = %e, "replication source closed");
                    break;
                }
                Err(e) => {
                    warn!(slot = %self.slot.id(), error = %e, "replication batch failed");
                    tokio::select! {
                        _ = stop.changed() => {}
                        () = tokio::time::sleep(self.config.idle_poll_interval) => {}
                    }
                }
            }
        }
        debug!(slot = %self.slot.id(), "replication task exited");
    }

    /// Ships one batch. Returns true if the watermark advanced.
    async fn ship_next(&self) -> ReplicationResult<bool> {
        let slot = Arc::clone(&self.slot);
        let volume = Arc::clone(&self.volume);
        let limit = self.config.batch_entry_limit;
        let Some(batch) = blocking(move || build_batch(&slot, &volume, limit)).await? else {
            return Ok(false);
        };

        let batch = Arc::new(batch);
        let Some(ack) = self.send_with_retry(&batch).await? else {
            return Ok(false);
        };
        if ack.slot_id != batch.slot_id {
            return Err(ReplicationError::SlotMismatch {
                expected: self.slot.id().to_string(),
                received: Versionstamp::from_bytes(ack.slot_id).to_string(),
            });
        }

        let store = Arc::clone(&self.store);
        let advanced = self
            .slot
            .acknowledge_with(Versionstamp::from_bytes(ack.versionstamp), |record| {
                persist_slot(store.as_ref(), record)
            })?;
        if advanced {
            self.slot.record_batch(batch.data_len());
            debug!(
                slot = %self.slot.id(),
                entries = batch.entries.len(),
                bytes = batch.data_len(),
                watermark = %Versionstamp::from_bytes(ack.versionstamp),
                "batch acknowledged"
            );
        }
        Ok(advanced)
    }

    /// Sends a batch, backing off between retryable failures. Returns
    /// `None` if the slot stopped first.
    async fn send_with_retry(
        &self,
        batch: &Arc<ReplicationBatch>,
    ) -> ReplicationResult<Option<ReplicationAck>> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            if self.slot.is_stopped() {
                return Ok(None);
            }
            let transport = Arc::clone(&self.transport);
            let standby = self.slot.standby().clone();
            let outgoing = Arc::clone(batch);
            match blocking(move || transport.send(&standby, &outgoing)).await {
                Ok(ack) => return Ok(Some(ack)),
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    debug!(slot = %self.slot.id(), attempt, ?delay, error = %e, "retrying send");
                    let mut stop = self.slot.subscribe_stop();
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = stop.changed() => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Owns the replication slots of the shards a member is primary for.
pub struct ReplicationService {
    config: ReplicationConfig,
    shards: Arc<ShardRegistry>,
    store: Arc<dyn MetadataStore>,
    transport: Arc<dyn ReplicationTransport>,
    runtime: Handle,
    slots: RwLock<BTreeMap<Versionstamp, Arc<ReplicationSlot>>>,
    tasks: Mutex<HashMap<Versionstamp, JoinHandle<()>>>,
}

impl ReplicationService {
    /// Creates a service whose streaming tasks run on `runtime`.
    #[must_use]
    pub fn new(
        config: ReplicationConfig,
        shards: Arc<ShardRegistry>,
        store: Arc<dyn MetadataStore>,
        transport: Arc<dyn ReplicationTransport>,
        runtime: Handle,
    ) -> Self {
        Self {
            config,
            shards,
            store,
            transport,
            runtime,
            slots: RwLock::new(BTreeMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Replication configuration.
    #[must_use]
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Shards this service replicates from.
    #[must_use]
    pub fn shards(&self) -> &Arc<ShardRegistry> {
        &self.shards
    }

    /// Creates and persists a slot for `standby`, or returns its live slot.
    ///
    /// The slot id is the commit versionstamp of a metadata transaction, so
    /// ids order slots by creation time across restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata store rejects the commit.
    pub fn create_slot(
        &self,
        kind: ShardKind,
        id: ShardId,
        standby: &MemberId,
    ) -> ReplicationResult<Arc<ReplicationSlot>> {
        let mut slots = self.slots.write();
        if let Some(existing) = Self::live_slot(&slots, kind, id, standby) {
            return Ok(existing);
        }

        let slot_id = self.store.commit(vec![Mutation::Set {
            key: metadata_key(&[SLOT_IDS, kind.as_str(), &id.to_string()]),
            value: standby.as_str().as_bytes().to_vec(),
        }])?;
        let slot = Arc::new(ReplicationSlot::new(slot_id, kind, id, standby.clone(), None));
        persist_slot(self.store.as_ref(), &slot.record())?;
        slots.insert(slot_id, Arc::clone(&slot));

        info!(
            slot = %slot_id,
            shard_kind = %kind,
            shard_id = id.0,
            standby = %standby,
            "slot created"
        );
        Ok(slot)
    }

    fn live_slot(
        slots: &BTreeMap<Versionstamp, Arc<ReplicationSlot>>,
        kind: ShardKind,
        id: ShardId,
        standby: &MemberId,
    ) -> Option<Arc<ReplicationSlot>> {
        slots
            .values()
            .find(|s| {
                s.kind() == kind && s.shard_id() == id && s.standby() == standby && !s.is_stopped()
            })
            .cloned()
    }

    /// Starts streaming a hosted shard to `standby`.
    ///
    /// Reuses the live slot for the pair if there is one; a slot whose task
    /// is running is left alone.
    ///
    /// # Errors
    ///
    /// Returns `ShardNotFound` if the shard is not hosted here, or the
    /// [`ReplicationService::create_slot`] error.
    pub fn start_replication(
        &self,
        kind: ShardKind,
        id: ShardId,
        standby: &MemberId,
    ) -> ReplicationResult<Arc<ReplicationSlot>> {
        let shard = self.shards.find(kind, id)?;
        let slot = self.create_slot(kind, id, standby)?;
        self.spawn_worker(&slot, Arc::clone(shard.volume()));
        Ok(slot)
    }

    fn spawn_worker(&self, slot: &Arc<ReplicationSlot>, volume: Arc<Volume>) {
        let mut tasks = self.tasks.lock();
        if tasks.get(&slot.id()).is_some_and(|task| !task.is_finished()) {
            return;
        }
        let worker = SlotWorker {
            slot: Arc::clone(slot),
            volume,
            transport: Arc::clone(&self.transport),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        };
        tasks.insert(slot.id(), self.runtime.spawn(worker.run()));
    }

    /// Stops a slot and records its final watermark.
    ///
    /// Stopping an unknown or stopped slot is a no-op. An in-flight send
    /// may complete, but its acknowledgment is discarded. Returns true if
    /// a live slot was stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the final record cannot be persisted; the slot
    /// is stopped regardless.
    pub fn stop_replication(&self, slot_id: Versionstamp) -> ReplicationResult<bool> {
        let Some(slot) = self.slots.write().remove(&slot_id) else {
            debug!(slot = %slot_id, "stop for unknown slot ignored");
            return Ok(false);
        };
        let stopped = slot.stop();
        // The task exits on the stop signal.
        self.tasks.lock().remove(&slot_id);
        persist_slot(self.store.as_ref(), &slot.record())?;

        info!(
            slot = %slot_id,
            shard_kind = %slot.kind(),
            shard_id = slot.shard_id().as_u32(),
            standby = %slot.standby(),
            watermark = ?slot.watermark(),
            "replication stopped"
        );
        Ok(stopped)
    }

    /// Stops the shard's slots, optionally only those for `standby`.
    /// Returns how many were stopped.
    ///
    /// # Errors
    ///
    /// Returns the first [`ReplicationService::stop_replication`] error;
    /// the remaining slots are still stopped.
    pub fn stop_shard(
        &self,
        kind: ShardKind,
        id: ShardId,
        standby: Option<&MemberId>,
    ) -> ReplicationResult<usize> {
        let targets: Vec<Versionstamp> = self
            .slots_for_shard(kind, id)
            .into_iter()
            .filter(|s| standby.map_or(true, |m| s.standby() == m))
            .map(|s| s.id())
            .collect();

        let mut stopped = 0;
        let mut first_error = None;
        for slot_id in targets {
            match self.stop_replication(slot_id) {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(stopped), Err)
    }

    /// Looks up a live slot.
    ///
    /// # Errors
    ///
    /// Returns `SlotNotFound` for unknown or stopped slots.
    pub fn find_slot(&self, slot_id: Versionstamp) -> ReplicationResult<Arc<ReplicationSlot>> {
        self.slots
            .read()
            .get(&slot_id)
            .cloned()
            .ok_or_else(|| ReplicationError::SlotNotFound {
                slot: slot_id.to_string(),
            })
    }

    /// Live slots of a shard, oldest first.
    #[must_use]
    pub fn slots_for_shard(&self, kind: ShardKind, id: ShardId) -> Vec<Arc<ReplicationSlot>> {
        self.slots
            .read()
            .values()
            .filter(|s| s.kind() == kind && s.shard_id() == id)
            .cloned()
            .collect()
    }

    /// Every live slot, oldest first.
    #[must_use]
    pub fn slots(&self) -> Vec<Arc<ReplicationSlot>> {
        self.slots.read().values().cloned().collect()
    }

    /// Restores persisted live slots without starting them. Returns how
    /// many were loaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or holds a bad record.
    pub fn load_slots(&self) -> ReplicationResult<usize> {
        let records = read_slot_records(self.store.as_ref(), &metadata_key(&[SLOTS, ""]))?;
        let mut slots = self.slots.write();
        let mut loaded = 0;
        for record in records {
            if record.state == SlotState::Stopped || slots.contains_key(&record.id) {
                continue;
            }
            slots.insert(record.id, Arc::new(ReplicationSlot::from_record(record)));
            loaded += 1;
        }
        info!(loaded, "replication slots loaded");
        Ok(loaded)
    }

    /// Starts a task for every live slot whose shard is hosted here.
    /// Returns how many were started.
    pub fn resume_slots(&self) -> usize {
        let mut started = 0;
        for slot in self.slots() {
            match self.shards.find(slot.kind(), slot.shard_id()) {
                Ok(shard) => {
                    self.spawn_worker(&slot, Arc::clone(shard.volume()));
                    started += 1;
                }
                Err(e) => {
                    debug!(slot = %slot.id(), error = %e, "slot not resumed");
                }
            }
        }
        started
    }

    /// Applies an acknowledgment received out of band.
    ///
    /// Acknowledgments for unknown or stopped slots are ignored. Returns
    /// true if the watermark advanced.
    ///
    /// # Errors
    ///
    /// Returns `WatermarkRegression` for an acknowledgment behind the
    /// watermark, or a store error.
    pub fn acknowledge(&self, ack: &ReplicationAck) -> ReplicationResult<bool> {
        let slot_id = Versionstamp::from_bytes(ack.slot_id);
        let Some(slot) = self.slots.read().get(&slot_id).cloned() else {
            debug!(slot = %slot_id, "acknowledgment for unknown slot ignored");
            return Ok(false);
        };
        slot.acknowledge_with(Versionstamp::from_bytes(ack.versionstamp), |record| {
            persist_slot(self.store.as_ref(), record)
        })
        .inspect_err(|e| warn!(slot = %slot_id, error = %e, "acknowledgment rejected"))
    }

    /// Stops every streaming task, keeping slot records for the next start.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<ReplicationSlot>> =
            std::mem::take(&mut *self.slots.write()).into_values().collect();
        for slot in &slots {
            slot.stop();
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain().map(|(_, t)| t).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "replication task failed");
            }
        }
        info!(slots = slots.len(), "replication service shut down");
    }
}

impl std::fmt::Debug for ReplicationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationService")
            .field("slots", &self.slots.read().len())
            .finish()
    }
}
