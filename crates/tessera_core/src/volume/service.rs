//! Registry of open volumes and the binary segment protocols.

use crate::error::{CoreError, CoreResult};
use crate::volume::volume::Volume;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_protocol::{SegmentInsertRequest, SegmentRangeRequest, SegmentRangeResponse};
use tracing::debug;

/// Locates volumes by name and serves segment insert / range requests.
#[derive(Default)]
pub struct VolumeService {
    volumes: RwLock<HashMap<String, Arc<Volume>>>,
}

impl VolumeService {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a volume under its name.
    ///
    /// # Errors
    ///
    /// Returns an error if a volume with the same name is registered.
    pub fn register(&self, volume: Arc<Volume>) -> CoreResult<()> {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(volume.name()) {
            return Err(CoreError::invalid_operation(format!(
                "volume already registered: {}",
                volume.name()
            )));
        }
        volumes.insert(volume.name().to_string(), volume);
        Ok(())
    }

    /// Looks a volume up.
    ///
    /// # Errors
    ///
    /// Returns `VolumeNotFound` if nothing is registered under `name`.
    pub fn find(&self, name: &str) -> CoreResult<Arc<Volume>> {
        self.volumes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::VolumeNotFound {
                volume: name.to_string(),
            })
    }

    /// Unregisters a volume and returns it.
    pub fn remove(&self, name: &str) -> Option<Arc<Volume>> {
        self.volumes.write().remove(name)
    }

    /// Registered volume names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.volumes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Handles `SEGMENTINSERT`: writes the entries then flushes with force.
    ///
    /// # Errors
    ///
    /// Returns the lookup, insert or flush error.
    pub fn handle_segment_insert(&self, request: &SegmentInsertRequest) -> CoreResult<Vec<u64>> {
        let volume = self.find(&request.volume)?;
        let positions = volume.insert(&request.segment, &request.entries)?;
        volume.flush(true)?;
        debug!(
            volume = %request.volume,
            segment = %request.segment,
            entries = positions.len(),
            "segment insert"
        );
        Ok(positions)
    }

    /// Handles `SEGMENTRANGE`: one payload per requested range, in order.
    ///
    /// # Errors
    ///
    /// Returns the lookup or read error.
    pub fn handle_segment_range(
        &self,
        request: &SegmentRangeRequest,
    ) -> CoreResult<SegmentRangeResponse> {
        let volume = self.find(&request.volume)?;
        let payloads = volume.read_ranges(&request.segment, &request.ranges)?;
        Ok(SegmentRangeResponse { payloads })
    }
}
