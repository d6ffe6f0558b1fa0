//! Standby side of a replication stream.

use crate::error::{ReplicationError, ReplicationResult};
use bytes::Bytes;
use std::sync::Arc;
use tessera_core::{EntryMetadata, KeyRecord, ShardId, ShardKind, ShardRegistry, Versionstamp};
use tessera_protocol::{PackedEntry, ReplicationAck, ReplicationBatch};
use tracing::debug;

/// Applies batches received from a primary to locally hosted standby shards.
pub struct StandbyApplier {
    shards: Arc<ShardRegistry>,
}

impl StandbyApplier {
    /// Creates an applier over a member's shard registry.
    #[must_use]
    pub fn new(shards: Arc<ShardRegistry>) -> Self {
        Self { shards }
    }

    /// Shard registry the applier writes into.
    #[must_use]
    pub fn shards(&self) -> &Arc<ShardRegistry> {
        &self.shards
    }

    /// Applies one batch and acknowledges the standby's durable position.
    ///
    /// Bytes are written at the primary's positions, so a batch replayed
    /// after a lost acknowledgment is accepted without rewriting anything.
    /// Entries the standby already registered are not registered again.
    /// Key records newer than the previous durable point are applied to the
    /// shard only after the volume flush returns.
    ///
    /// # Errors
    ///
    /// Returns `MalformedBatch` if an entry's bytes are not in the batch or
    /// the batch targets another volume, and any volume or shard error.
    pub fn apply(&self, batch: &ReplicationBatch) -> ReplicationResult<ReplicationAck> {
        let kind: ShardKind = batch.shard_kind.parse()?;
        let shard = self.shards.find(kind, ShardId::new(batch.shard_id))?;
        let volume = shard.volume();
        if volume.name() != batch.volume {
            return Err(ReplicationError::malformed(format!(
                "batch for volume {} delivered to {}",
                batch.volume,
                volume.name()
            )));
        }

        // Entries registered by an earlier attempt whose flush failed are
        // still pending: they are not registered twice, but are applied to
        // the shard once durable.
        let durable_before = volume.last_durable();
        let registered = volume.last_versionstamp();
        for (segment, packed) in group_by_segment(batch)? {
            volume.write_replicated(&segment, &packed)?;
        }
        let entries: Vec<EntryMetadata> =
            batch.entries.iter().cloned().map(EntryMetadata::from).collect();
        let fresh: Vec<EntryMetadata> = entries
            .iter()
            .filter(|e| registered.map_or(true, |r| e.versionstamp > r))
            .cloned()
            .collect();

        volume.apply_changes(&fresh)?;
        let durable = volume.flush(true)?;

        let mut applied = 0usize;
        for entry in entries
            .iter()
            .filter(|e| durable_before.map_or(true, |d| e.versionstamp > d))
        {
            let bytes =
                volume.read_range(&entry.segment, entry.position, u64::from(entry.length))?;
            // Raw segment inserts carry no key record.
            if let Ok(record) = KeyRecord::decode(&bytes) {
                shard.apply_replicated(record)?;
                applied += 1;
            }
        }

        debug!(
            volume = %volume.name(),
            entries = batch.entries.len(),
            registered = fresh.len(),
            applied,
            "standby applied batch"
        );
        Ok(ReplicationAck {
            slot_id: batch.slot_id,
            versionstamp: durable.unwrap_or(Versionstamp::ZERO).to_bytes(),
        })
    }
}

/// Cuts each entry's payload out of its chunk, keeping segment runs in
/// batch order.
fn group_by_segment(
    batch: &ReplicationBatch,
) -> ReplicationResult<Vec<(String, Vec<PackedEntry>)>> {
    let mut groups: Vec<(String, Vec<PackedEntry>)> = Vec::new();
    for entry in &batch.entries {
        let uncovered = || {
            ReplicationError::malformed(format!(
                "no chunk covers {}@{}+{}",
                entry.segment, entry.position, entry.length
            ))
        };
        let end = entry
            .position
            .checked_add(u64::from(entry.length))
            .ok_or_else(uncovered)?;
        let chunk = batch
            .chunks
            .iter()
            .find(|c| {
                c.segment == entry.segment
                    && c.position <= entry.position
                    && c.position
                        .checked_add(c.data.len() as u64)
                        .is_some_and(|chunk_end| end <= chunk_end)
            })
            .ok_or_else(uncovered)?;

        let offset =
            usize::try_from(entry.position - chunk.position).map_err(|_| uncovered())?;
        let payload: Bytes = chunk.data.slice(offset..offset + entry.length as usize);
        let packed = PackedEntry::new(entry.position, payload);
        match groups.last_mut() {
            Some((segment, run)) if *segment == entry.segment => run.push(packed),
            _ => groups.push((entry.segment.clone(), vec![packed])),
        }
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{Config, VolumeService};
    use tessera_protocol::{ReplicatedEntry, SegmentChunk};

    fn batch(entries: Vec<ReplicatedEntry>, chunks: Vec<SegmentChunk>) -> ReplicationBatch {
        ReplicationBatch {
            slot_id: Versionstamp::new(1, 0, 0).to_bytes(),
            shard_kind: "REDIS".into(),
            shard_id: 0,
            volume: "redis-shard-0".into(),
            chunks,
            entries,
        }
    }

    fn record(key: &str, value: &'static [u8]) -> Vec<u8> {
        KeyRecord {
            key: key.into(),
            value: Some(tessera_core::StoredValue::String(Bytes::from_static(value))),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn grouping_rejects_uncovered_entries() {
        let b = batch(
            vec![ReplicatedEntry {
                versionstamp: Versionstamp::new(2, 0, 0).to_bytes(),
                segment: "s1".into(),
                position: 4,
                length: 4,
            }],
            vec![SegmentChunk {
                segment: "s1".into(),
                position: 0,
                data: Bytes::from_static(b"abcdef"),
            }],
        );
        assert!(matches!(
            group_by_segment(&b),
            Err(ReplicationError::MalformedBatch { .. })
        ));
    }

    #[test]
    fn replayed_batch_is_acknowledged_without_reapplying() {
        let shards = Arc::new(ShardRegistry::new(
            Config::default(),
            Arc::new(VolumeService::new()),
        ));
        shards.open_shard(ShardKind::Redis, ShardId::new(0)).unwrap();
        let applier = StandbyApplier::new(Arc::clone(&shards));

        let first = record("a", b"1");
        let second = record("b", b"2");
        let mut data = first.clone();
        data.extend_from_slice(&second);
        let stamp = Versionstamp::new(7, 0, 1);
        let segment = tessera_core::segment_name(0);
        let b = batch(
            vec![
                ReplicatedEntry {
                    versionstamp: Versionstamp::new(7, 0, 0).to_bytes(),
                    segment: segment.clone(),
                    position: 0,
                    length: first.len() as u32,
                },
                ReplicatedEntry {
                    versionstamp: stamp.to_bytes(),
                    segment: segment.clone(),
                    position: first.len() as u64,
                    length: second.len() as u32,
                },
            ],
            vec![SegmentChunk {
                segment: segment.clone(),
                position: 0,
                data: Bytes::from(data),
            }],
        );

        let ack = applier.apply(&b).unwrap();
        assert_eq!(Versionstamp::from_bytes(ack.versionstamp), stamp);
        let ack = applier.apply(&b).unwrap();
        assert_eq!(Versionstamp::from_bytes(ack.versionstamp), stamp);

        let shard = shards.find(ShardKind::Redis, ShardId::new(0)).unwrap();
        assert_eq!(shard.len(), 2);
        assert_eq!(shard.volume().entries().unwrap().len(), 2);
    }

    #[test]
    fn overflowing_entry_range_is_malformed() {
        let b = batch(
            vec![ReplicatedEntry {
                versionstamp: Versionstamp::new(2, 0, 0).to_bytes(),
                segment: "s1".into(),
                position: u64::MAX - 1,
                length: 4,
            }],
            vec![SegmentChunk {
                segment: "s1".into(),
                position: u64::MAX - 2,
                data: Bytes::from_static(b"abcdef"),
            }],
        );
        assert!(matches!(
            group_by_segment(&b),
            Err(ReplicationError::MalformedBatch { .. })
        ));
    }

    #[test]
    fn retry_after_unflushed_registration_applies_every_record() {
        let shards = Arc::new(ShardRegistry::new(
            Config::default(),
            Arc::new(VolumeService::new()),
        ));
        shards.open_shard(ShardKind::Redis, ShardId::new(0)).unwrap();
        let applier = StandbyApplier::new(Arc::clone(&shards));

        let first = record("a", b"1");
        let second = record("b", b"2");
        let segment = tessera_core::segment_name(0);
        let entries = vec![
            ReplicatedEntry {
                versionstamp: Versionstamp::new(9, 0, 0).to_bytes(),
                segment: segment.clone(),
                position: 0,
                length: first.len() as u32,
            },
            ReplicatedEntry {
                versionstamp: Versionstamp::new(9, 0, 1).to_bytes(),
                segment: segment.clone(),
                position: first.len() as u64,
                length: second.len() as u32,
            },
        ];

        // An earlier attempt registered the first entry, then its flush failed.
        let shard = shards.find(ShardKind::Redis, ShardId::new(0)).unwrap();
        shard
            .volume()
            .write_replicated(
                &segment,
                &[PackedEntry::new(0, Bytes::from(first.clone()))],
            )
            .unwrap();
        shard
            .volume()
            .apply_changes(&[EntryMetadata::from(entries[0].clone())])
            .unwrap();
        assert_eq!(shard.volume().last_durable(), None);

        let mut data = first.clone();
        data.extend_from_slice(&second);
        let b = batch(
            entries,
            vec![SegmentChunk {
                segment,
                position: 0,
                data: Bytes::from(data),
            }],
        );
        let ack = applier.apply(&b).unwrap();
        assert_eq!(
            Versionstamp::from_bytes(ack.versionstamp),
            Versionstamp::new(9, 0, 1)
        );
        assert_eq!(shard.len(), 2);
        assert_eq!(shard.volume().entries().unwrap().len(), 2);
    }

    #[test]
    fn batch_for_other_volume_is_rejected() {
        let shards = Arc::new(ShardRegistry::new(
            Config::default(),
            Arc::new(VolumeService::new()),
        ));
        shards.open_shard(ShardKind::Redis, ShardId::new(0)).unwrap();
        let applier = StandbyApplier::new(shards);

        let mut b = batch(Vec::new(), Vec::new());
        b.volume = "redis-shard-9".into();
        assert!(matches!(
            applier.apply(&b),
            Err(ReplicationError::MalformedBatch { .. })
        ));
    }
}
