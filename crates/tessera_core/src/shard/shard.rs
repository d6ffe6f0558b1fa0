//! A shard: one slice of the key space.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::lock::{HeldStripes, ReadGuard, StripedLockTable, WriteGuard};
use crate::shard::index::Index;
use crate::shard::queue::PersistenceQueue;
use crate::shard::record::KeyRecord;
use crate::shard::value::StoredValue;
use crate::types::{ShardId, ShardKind, ShardStatus};
use crate::volume::Volume;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory key space of one shard, backed by a volume.
///
/// `get`, `put` and `remove` take a guard from [`Shard::read`] or
/// [`Shard::write`] and refuse keys the guard does not cover. Mutations
/// update the index and mark the key dirty in the persistence queue; the
/// flush path later writes the key's latest value to the volume.
pub struct Shard {
    kind: ShardKind,
    id: ShardId,
    store: DashMap<String, StoredValue>,
    locks: StripedLockTable,
    queue: PersistenceQueue,
    index: Index,
    volume: Arc<Volume>,
    operable: AtomicBool,
    status: AtomicU8,
    pub(crate) flush_lock: Mutex<()>,
    pub(crate) flush_batch_size: usize,
    pub(crate) sync_on_flush: bool,
}

impl Shard {
    /// Creates a shard over an open volume.
    ///
    /// The shard starts `INITIALIZING` and not operable; call
    /// [`Shard::restore`] before serving.
    #[must_use]
    pub fn new(kind: ShardKind, id: ShardId, volume: Arc<Volume>, config: &Config) -> Self {
        Self {
            kind,
            id,
            store: DashMap::new(),
            locks: StripedLockTable::new(config.stripe_count),
            queue: PersistenceQueue::new(),
            index: Index::new(),
            volume,
            operable: AtomicBool::new(false),
            status: AtomicU8::new(ShardStatus::Initializing.as_byte()),
            flush_lock: Mutex::new(()),
            flush_batch_size: config.flush_batch_size.max(1),
            sync_on_flush: config.sync_on_flush,
        }
    }

    /// Shard kind.
    #[must_use]
    pub fn kind(&self) -> ShardKind {
        self.kind
    }

    /// Shard id.
    #[must_use]
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Backing volume.
    #[must_use]
    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    /// Lock table.
    #[must_use]
    pub fn locks(&self) -> &StripedLockTable {
        &self.locks
    }

    /// Persistence queue.
    #[must_use]
    pub fn queue(&self) -> &PersistenceQueue {
        &self.queue
    }

    /// Key index.
    #[must_use]
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns true if the shard holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ShardStatus {
        ShardStatus::from_byte(self.status.load(Ordering::Acquire)).unwrap_or(ShardStatus::Stopped)
    }

    /// Returns true if the shard serves requests.
    #[must_use]
    pub fn is_operable(&self) -> bool {
        self.operable.load(Ordering::Acquire)
    }

    /// Sets the operable flag.
    pub fn set_operable(&self, value: bool) {
        self.operable.store(value, Ordering::Release);
    }

    /// Locks the stripes of `keys` for reading.
    pub fn read<K: AsRef<[u8]>>(&self, keys: &[K]) -> ReadGuard<'_> {
        self.locks.read(keys)
    }

    /// Locks the stripes of `keys` for writing.
    pub fn write<K: AsRef<[u8]>>(&self, keys: &[K]) -> WriteGuard<'_> {
        self.locks.write(keys)
    }

    fn kind_name(&self) -> String {
        self.kind.as_str().to_string()
    }

    /// Fails unless the shard serves reads.
    ///
    /// # Errors
    ///
    /// Returns `ShardStopped` or `ShardNotOperable`.
    pub fn check_readable(&self) -> CoreResult<()> {
        if self.status() == ShardStatus::Stopped {
            return Err(CoreError::ShardStopped {
                kind: self.kind_name(),
                id: self.id.0,
            });
        }
        if !self.is_operable() {
            return Err(CoreError::ShardNotOperable {
                kind: self.kind_name(),
                id: self.id.0,
            });
        }
        Ok(())
    }

    /// Fails unless the shard accepts writes.
    ///
    /// # Errors
    ///
    /// Returns the [`Shard::check_readable`] errors or `ShardReadOnly`.
    pub fn check_writable(&self) -> CoreResult<()> {
        self.check_readable()?;
        let status = self.status();
        if !status.is_writable() {
            return Err(CoreError::ShardReadOnly {
                kind: self.kind_name(),
                id: self.id.0,
                status: status.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn check_covered(&self, guard: &impl HeldStripes, key: &str) -> CoreResult<()> {
        if guard.covers(&self.locks, key.as_bytes()) {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "key {key} is not covered by the held locks"
            )))
        }
    }

    /// Reads a key.
    ///
    /// # Errors
    ///
    /// Fails if the guard does not cover the key or the shard is not readable.
    pub fn get(&self, guard: &impl HeldStripes, key: &str) -> CoreResult<Option<StoredValue>> {
        self.check_covered(guard, key)?;
        self.check_readable()?;
        Ok(self.store.get(key).map(|v| v.value().clone()))
    }

    /// Reads a key without status checks, for the flush path.
    pub(crate) fn peek(&self, guard: &impl HeldStripes, key: &str) -> Option<StoredValue> {
        if !guard.covers(&self.locks, key.as_bytes()) {
            return None;
        }
        self.store.get(key).map(|v| v.value().clone())
    }

    /// Stores a value and returns the previous one.
    ///
    /// # Errors
    ///
    /// Fails if the guard does not cover the key or the shard is not
    /// writable; nothing is changed in that case.
    pub fn put(
        &self,
        guard: &WriteGuard<'_>,
        key: &str,
        value: StoredValue,
    ) -> CoreResult<Option<StoredValue>> {
        self.check_covered(guard, key)?;
        self.check_writable()?;
        let previous = self.store.insert(key.to_string(), value);
        self.index.insert(key);
        self.queue.enqueue(key);
        Ok(previous)
    }

    /// Removes a key and returns its value.
    ///
    /// # Errors
    ///
    /// Same as [`Shard::put`].
    pub fn remove(&self, guard: &WriteGuard<'_>, key: &str) -> CoreResult<Option<StoredValue>> {
        self.check_covered(guard, key)?;
        self.check_writable()?;
        let previous = self.store.remove(key).map(|(_, v)| v);
        if previous.is_some() {
            self.index.remove(key);
            self.queue.enqueue(key);
        }
        Ok(previous)
    }

    /// Removes every key. The guard must hold all stripes.
    ///
    /// # Errors
    ///
    /// Fails if the guard is partial or the shard is not writable.
    pub fn clear(&self, guard: &WriteGuard<'_>) -> CoreResult<usize> {
        if guard.stripes().len() != self.locks.stripe_count()
            || !std::ptr::eq(guard.table(), &self.locks)
        {
            return Err(CoreError::invalid_operation("clear requires every stripe"));
        }
        self.check_writable()?;
        let keys: Vec<String> = self.store.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.store.remove(key);
            self.queue.enqueue(key);
        }
        self.index.clear();
        Ok(keys.len())
    }

    /// Applies a record received from the primary.
    ///
    /// Standby state is never queued for flushing; the bytes are already in
    /// the volume.
    ///
    /// # Errors
    ///
    /// Returns `ShardStopped` once the shard is stopped.
    pub fn apply_replicated(&self, record: KeyRecord) -> CoreResult<()> {
        if self.status() == ShardStatus::Stopped {
            return Err(CoreError::ShardStopped {
                kind: self.kind_name(),
                id: self.id.0,
            });
        }
        let _guard = self.locks.write(&[record.key.as_str()]);
        self.apply_record(record);
        Ok(())
    }

    fn apply_record(&self, record: KeyRecord) {
        match record.value {
            Some(value) => {
                self.index.insert(&record.key);
                self.store.insert(record.key, value);
            }
            None => {
                self.store.remove(&record.key);
                self.index.remove(&record.key);
            }
        }
    }

    /// Rebuilds the key space from the volume and marks the shard operable.
    ///
    /// Entries written through the segment insert protocol carry raw bytes
    /// rather than key records and are skipped. Returns the number of live
    /// keys.
    ///
    /// # Errors
    ///
    /// Fails if the volume cannot be read.
    pub fn restore(&self) -> CoreResult<usize> {
        let _all = self.locks.write_all();
        self.store.clear();
        self.index.clear();

        let entries = self.volume.entries()?;
        let mut skipped = 0usize;
        for entry in &entries {
            let bytes = self.volume.read_range(
                &entry.segment,
                entry.position,
                u64::from(entry.length),
            )?;
            match KeyRecord::decode(&bytes) {
                Ok(record) => self.apply_record(record),
                Err(_) => skipped += 1,
            }
        }

        self.set_operable(true);
        info!(
            shard_kind = %self.kind,
            shard_id = self.id.0,
            entries = entries.len(),
            skipped,
            keys = self.store.len(),
            "shard restored"
        );
        Ok(self.store.len())
    }

    /// Moves the shard to a new status.
    ///
    /// Leaving `READWRITE` first waits for writers holding stripe locks,
    /// then blocks writes and drains the persistence queue to empty. `STOPPED`
    /// additionally clears the operable flag and closes the volume.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStatusTransition` for moves the state machine
    /// forbids, or the flush/close error. Writes stay blocked on failure.
    pub fn transition(&self, next: ShardStatus) -> CoreResult<()> {
        // Writers check the status under their stripe locks, so a write
        // holding stripes finishes under the status it started with.
        let barrier = self.locks.write_all();
        let current = self.status();
        if !current.can_transition_to(next) {
            return Err(CoreError::InvalidStatusTransition {
                from: current.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        if current == next {
            return Ok(());
        }
        self.status.store(next.as_byte(), Ordering::Release);
        drop(barrier);

        if next != ShardStatus::ReadWrite {
            let flushed = self.drain()?;
            debug!(shard_kind = %self.kind, shard_id = self.id.0, flushed, "queue drained");
        }
        if next == ShardStatus::Stopped {
            self.set_operable(false);
            self.volume.close()?;
        }

        info!(
            shard_kind = %self.kind,
            shard_id = self.id.0,
            from = %current,
            to = %next,
            "shard status changed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("status", &self.status())
            .field("keys", &self.store.len())
            .finish()
    }
}
