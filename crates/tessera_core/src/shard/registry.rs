//! Shards hosted by this node.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::routing::{RoutingEvent, RoutingEventHook};
use crate::shard::shard::Shard;
use crate::types::{volume_name, ShardId, ShardKind, ShardStatus};
use crate::volume::{Volume, VolumeConfig, VolumeService};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

/// Locates local shards and applies routing status changes to them.
///
/// Registered as a storage-phase routing hook.
pub struct ShardRegistry {
    config: Config,
    volumes: Arc<VolumeService>,
    shards: RwLock<BTreeMap<(ShardKind, ShardId), Arc<Shard>>>,
}

impl ShardRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: Config, volumes: Arc<VolumeService>) -> Self {
        Self {
            config,
            volumes,
            shards: RwLock::new(BTreeMap::new()),
        }
    }

    /// Volume registry shared with the segment protocols.
    #[must_use]
    pub fn volumes(&self) -> &Arc<VolumeService> {
        &self.volumes
    }

    /// Shard owning `key`.
    #[must_use]
    pub fn shard_id_for_key(&self, kind: ShardKind, key: &[u8]) -> ShardId {
        let count = u64::from(self.config.shard_count(kind).max(1));
        ShardId((xxh3_64(key) % count) as u32)
    }

    /// Opens a shard: opens its volume, restores its keys and registers both.
    ///
    /// The shard keeps `INITIALIZING` until a routing status reaches it.
    ///
    /// # Errors
    ///
    /// Fails for out-of-range ids, shards already hosted, or volume and
    /// restore errors.
    pub fn open_shard(&self, kind: ShardKind, id: ShardId) -> CoreResult<Arc<Shard>> {
        if id.0 >= self.config.shard_count(kind) {
            return Err(CoreError::InvalidShardId {
                value: id.0.to_string(),
            });
        }
        let mut shards = self.shards.write();
        if shards.contains_key(&(kind, id)) {
            return Err(CoreError::invalid_operation(format!(
                "shard already open: {kind}/{id}"
            )));
        }

        let name = volume_name(kind, id);
        let mut volume_config = VolumeConfig::new(&name)
            .segment_size(self.config.segment_size)
            .sync_on_flush(self.config.sync_on_flush);
        if let Some(dir) = self.config.volume_dir(&name) {
            volume_config = volume_config.root(dir);
        }
        let volume = Arc::new(Volume::open_with(volume_config)?);
        self.volumes.register(Arc::clone(&volume))?;

        let shard = Arc::new(Shard::new(kind, id, volume, &self.config));
        if let Err(e) = shard.restore() {
            self.volumes.remove(&name);
            return Err(e);
        }
        shards.insert((kind, id), Arc::clone(&shard));
        info!(shard_kind = %kind, shard_id = id.0, "shard opened");
        Ok(shard)
    }

    /// Looks a shard up.
    ///
    /// # Errors
    ///
    /// Returns `ShardNotFound` if the shard is not hosted here.
    pub fn find(&self, kind: ShardKind, id: ShardId) -> CoreResult<Arc<Shard>> {
        self.shards
            .read()
            .get(&(kind, id))
            .cloned()
            .ok_or_else(|| CoreError::ShardNotFound {
                kind: kind.as_str().to_string(),
                id: id.0,
            })
    }

    /// Shard owning `key`.
    ///
    /// # Errors
    ///
    /// Returns `ShardNotFound` if that shard is not hosted here.
    pub fn find_by_key(&self, kind: ShardKind, key: &[u8]) -> CoreResult<Arc<Shard>> {
        self.find(kind, self.shard_id_for_key(kind, key))
    }

    /// Hosted shards in `(kind, id)` order.
    #[must_use]
    pub fn hosted(&self) -> Vec<(ShardKind, ShardId)> {
        self.shards.read().keys().copied().collect()
    }

    /// Applies a status to a hosted shard. A stopped shard is unregistered.
    ///
    /// # Errors
    ///
    /// Returns the shard transition error.
    pub fn apply_status(
        &self,
        kind: ShardKind,
        id: ShardId,
        status: ShardStatus,
    ) -> CoreResult<()> {
        let shard = self.find(kind, id)?;
        shard.transition(status)?;
        if status == ShardStatus::Stopped {
            self.shards.write().remove(&(kind, id));
            self.volumes.remove(&volume_name(kind, id));
        }
        Ok(())
    }

    /// Stops every hosted shard, flushing their queues.
    ///
    /// # Errors
    ///
    /// Returns the first error; remaining shards are still stopped.
    pub fn shutdown(&self) -> CoreResult<()> {
        let mut first_error = None;
        for (kind, id) in self.hosted() {
            if let Err(e) = self.apply_status(kind, id, ShardStatus::Stopped) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl RoutingEventHook for ShardRegistry {
    fn name(&self) -> &str {
        "shard-registry"
    }

    fn on_event(&self, event: &RoutingEvent) -> CoreResult<()> {
        if let RoutingEvent::StatusChanged { kind, id, status, .. } = event {
            if self.shards.read().contains_key(&(*kind, *id)) {
                self.apply_status(*kind, *id, *status)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry() -> ShardRegistry {
        ShardRegistry::new(Config::default(), Arc::new(VolumeService::new()))
    }

    #[test]
    fn open_find_and_key_placement() {
        let registry = registry();
        registry.open_shard(ShardKind::Redis, ShardId(2)).unwrap();
        assert!(registry.find(ShardKind::Redis, ShardId(2)).is_ok());
        assert!(matches!(
            registry.find(ShardKind::Bucket, ShardId(2)),
            Err(CoreError::ShardNotFound { .. })
        ));
        assert!(registry.open_shard(ShardKind::Redis, ShardId(2)).is_err());
        assert!(registry.open_shard(ShardKind::Redis, ShardId(7)).is_err());
        assert_eq!(registry.volumes().names(), vec!["redis-shard-2"]);

        let id = registry.shard_id_for_key(ShardKind::Redis, b"user:1");
        assert!(id.0 < 7);
        assert_eq!(id, registry.shard_id_for_key(ShardKind::Redis, b"user:1"));
    }

    #[test]
    fn status_events_reach_hosted_shards() {
        let registry = registry();
        let shard = registry.open_shard(ShardKind::Redis, ShardId(0)).unwrap();

        let event = |previous, status| RoutingEvent::StatusChanged {
            kind: ShardKind::Redis,
            id: ShardId(0),
            previous,
            status,
        };
        registry
            .on_event(&event(ShardStatus::Initializing, ShardStatus::ReadWrite))
            .unwrap();
        assert_eq!(shard.status(), ShardStatus::ReadWrite);

        // Shards hosted elsewhere are ignored.
        registry
            .on_event(&RoutingEvent::StatusChanged {
                kind: ShardKind::Redis,
                id: ShardId(5),
                previous: ShardStatus::Initializing,
                status: ShardStatus::ReadWrite,
            })
            .unwrap();

        registry
            .on_event(&event(ShardStatus::ReadWrite, ShardStatus::Stopped))
            .unwrap();
        assert!(registry.hosted().is_empty());
        assert!(registry.volumes().names().is_empty());
    }

    #[test]
    fn reopened_file_shard_restores_keys() {
        let dir = tempdir().unwrap();
        let config = Config::default().with_data_dir(dir.path());
        {
            let registry = ShardRegistry::new(config.clone(), Arc::new(VolumeService::new()));
            let shard = registry.open_shard(ShardKind::Redis, ShardId(1)).unwrap();
            shard.transition(ShardStatus::ReadWrite).unwrap();
            let guard = shard.write(&["k"]);
            shard
                .put(
                    &guard,
                    "k",
                    crate::shard::StoredValue::String(bytes::Bytes::from_static(b"v")),
                )
                .unwrap();
            drop(guard);
            registry.shutdown().unwrap();
        }

        let registry = ShardRegistry::new(config, Arc::new(VolumeService::new()));
        let shard = registry.open_shard(ShardKind::Redis, ShardId(1)).unwrap();
        assert_eq!(shard.len(), 1);
        assert!(shard.index().contains("k"));
    }
}
