//! Moving dirty keys from the persistence queue into the volume.

use crate::error::CoreResult;
use crate::shard::record::KeyRecord;
use crate::shard::shard::Shard;
use crate::types::ShardStatus;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

impl Shard {
    /// Writes one batch of dirty keys to the volume.
    ///
    /// Each key is written with the value it holds now, or as a tombstone if
    /// it was removed. On failure the batch goes back to the queue. Returns
    /// the number of keys written.
    ///
    /// # Errors
    ///
    /// Returns the encoding or volume error.
    pub fn flush_pending(&self) -> CoreResult<usize> {
        let _serial = self.flush_lock.lock();
        let keys = self.queue().take_batch(self.flush_batch_size);
        if keys.is_empty() {
            return Ok(0);
        }

        match self.write_batch(&keys) {
            Ok(()) => {
                self.queue().commit(&keys);
                Ok(keys.len())
            }
            Err(e) => {
                warn!(
                    shard_kind = %self.kind(),
                    shard_id = self.id().0,
                    keys = keys.len(),
                    error = %e,
                    "flush failed, keys re-queued"
                );
                self.queue().rollback(keys);
                Err(e)
            }
        }
    }

    fn write_batch(&self, keys: &[String]) -> CoreResult<()> {
        let payloads = {
            let guard = self.read(keys);
            keys.iter()
                .map(|key| {
                    let record = KeyRecord {
                        key: key.clone(),
                        value: self.peek(&guard, key),
                    };
                    record.encode().map(Bytes::from)
                })
                .collect::<CoreResult<Vec<_>>>()?
        };
        self.volume().append(&payloads)?;
        self.volume().flush(self.sync_on_flush)?;
        Ok(())
    }

    /// Flushes until the queue is empty. Returns the number of keys written.
    ///
    /// # Errors
    ///
    /// Returns the first flush error; unwritten keys stay queued.
    pub fn drain(&self) -> CoreResult<usize> {
        let mut total = 0;
        while !self.queue().is_empty() {
            total += self.flush_pending()?;
        }
        Ok(total)
    }
}

/// Handle to a shard's background flush task.
pub struct FlushTask {
    notify: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl FlushTask {
    /// Requests a flush without waiting for the interval.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Stops the task after its current flush.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Spawns the background flush task of a shard.
///
/// The task flushes every `interval` and whenever triggered, on the
/// blocking pool. It exits on shutdown or once the shard is stopped.
pub fn spawn_flush_task(shard: Arc<Shard>, interval: Duration) -> FlushTask {
    let notify = Arc::new(Notify::new());
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task_notify = Arc::clone(&notify);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = task_notify.notified() => {}
                _ = shutdown_rx.changed() => break,
            }
            if shard.status() == ShardStatus::Stopped {
                break;
            }
            if shard.queue().is_empty() {
                continue;
            }

            let worker = Arc::clone(&shard);
            match tokio::task::spawn_blocking(move || worker.drain()).await {
                Ok(Ok(n)) => debug!(
                    shard_kind = %shard.kind(),
                    shard_id = shard.id().0,
                    keys = n,
                    "background flush"
                ),
                // Already logged and re-queued; retry on the next tick.
                Ok(Err(_)) => {}
                Err(e) => warn!(error = %e, "flush worker panicked"),
            }
        }
        debug!(shard_kind = %shard.kind(), shard_id = shard.id().0, "flush task stopped");
    });

    FlushTask {
        notify,
        shutdown,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::shard::value::StoredValue;
    use crate::types::{ShardId, ShardKind};
    use crate::volume::{Volume, VolumeConfig};

    fn shard(batch: usize) -> Arc<Shard> {
        let volume = Arc::new(Volume::open_with(VolumeConfig::new("redis-shard-0")).unwrap());
        let config = Config::default().with_flush_batch_size(batch);
        let shard = Shard::new(ShardKind::Redis, ShardId(0), volume, &config);
        shard.restore().unwrap();
        shard.transition(ShardStatus::ReadWrite).unwrap();
        Arc::new(shard)
    }

    fn set(shard: &Shard, key: &str, value: &str) {
        let guard = shard.write(&[key]);
        shard
            .put(&guard, key, StoredValue::String(Bytes::from(value.to_string())))
            .unwrap();
    }

    fn decoded(shard: &Shard) -> Vec<KeyRecord> {
        shard
            .volume()
            .entries()
            .unwrap()
            .iter()
            .map(|e| {
                let bytes = shard
                    .volume()
                    .read_range(&e.segment, e.position, u64::from(e.length))
                    .unwrap();
                KeyRecord::decode(&bytes).unwrap()
            })
            .collect()
    }

    #[test]
    fn hot_key_is_written_once_with_latest_value() {
        let shard = shard(16);
        set(&shard, "hot", "1");
        set(&shard, "hot", "2");
        set(&shard, "hot", "3");

        assert_eq!(shard.flush_pending().unwrap(), 1);
        let records = decoded(&shard);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].value,
            Some(StoredValue::String(Bytes::from_static(b"3")))
        );
    }

    #[test]
    fn removal_is_written_as_tombstone() {
        let shard = shard(16);
        set(&shard, "k", "v");
        shard.flush_pending().unwrap();
        {
            let guard = shard.write(&["k"]);
            shard.remove(&guard, "k").unwrap();
        }
        shard.flush_pending().unwrap();
        assert_eq!(decoded(&shard)[1].value, None);
    }

    #[test]
    fn drain_respects_batch_size() {
        let shard = shard(2);
        for key in ["a", "b", "c", "d", "e"] {
            set(&shard, key, "x");
        }
        assert_eq!(shard.flush_pending().unwrap(), 2);
        assert_eq!(shard.queue().len(), 3);
        assert_eq!(shard.drain().unwrap(), 3);
        assert_eq!(shard.volume().entries().unwrap().len(), 5);
    }

    #[test]
    fn failed_flush_keeps_keys_queued() {
        let shard = shard(16);
        set(&shard, "k", "v");
        shard.volume().close().unwrap();

        assert!(shard.flush_pending().is_err());
        assert_eq!(shard.queue().pending_keys(), vec!["k"]);
    }

    #[tokio::test]
    async fn background_task_flushes_on_trigger() {
        let shard = shard(16);
        let mut durable = shard.volume().subscribe();
        let task = spawn_flush_task(Arc::clone(&shard), Duration::from_secs(3600));
        set(&shard, "k", "v");
        task.trigger();

        tokio::time::timeout(Duration::from_secs(5), durable.changed())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !shard.queue().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(decoded(&shard).len(), 1);
        task.shutdown().await;
    }
}
