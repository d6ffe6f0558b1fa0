//! Per-shard durable log.
//!
//! On disk a volume is a directory:
//!
//! ```text
//! <root>/
//! ├─ LOCK            # Advisory lock for single-writer
//! ├─ changelog.log   # Framed EntryMetadata records
//! └─ segments/
//!    ├─ 0000000000000000000
//!    └─ 0000000000000000001
//! ```
//!
//! Writes become visible in two steps. `append`, `insert` and
//! `apply_changes` put bytes into segments and register changelog entries
//! as pending; `flush` makes them durable, writes the changelog and only
//! then publishes the new durable versionstamp to subscribers. Replication
//! therefore never ships bytes the primary could still lose.

use crate::error::{CoreError, CoreResult};
use crate::types::{wall_clock_micros, Versionstamp};
use crate::volume::changelog::Changelog;
use crate::volume::entry::EntryMetadata;
use crate::volume::segment::{parse_segment_id, segment_name, validate_segment_name, Segment};
use bytes::Bytes;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use tessera_protocol::{PackedEntry, SegmentRange};
use tessera_storage::{FileBackend, InMemoryBackend, StorageBackend};
use tokio::sync::watch;
use tracing::{debug, info};

/// Lock file guarding a volume directory against a second process.
pub const LOCK_FILE: &str = "LOCK";
/// Changelog file inside a volume directory.
pub const CHANGELOG_FILE: &str = "changelog.log";
/// Directory holding one file per segment.
pub const SEGMENTS_DIR: &str = "segments";

/// Configuration of one volume.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Volume name, e.g. `redis-shard-0`.
    pub name: String,
    /// Directory holding the volume. `None` keeps it in memory.
    pub root: Option<PathBuf>,
    /// Capacity of each segment in bytes.
    pub segment_size: u64,
    /// Sync to stable storage on every flush, forced or not.
    pub sync_on_flush: bool,
}

impl VolumeConfig {
    /// Creates an in-memory configuration with default sizes.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: None,
            segment_size: 64 * 1024 * 1024, // 64 MB
            sync_on_flush: true,
        }
    }

    /// Sets the volume directory.
    #[must_use]
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Sets the segment capacity.
    #[must_use]
    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets whether every flush syncs.
    #[must_use]
    pub fn sync_on_flush(mut self, value: bool) -> Self {
        self.sync_on_flush = value;
        self
    }
}

/// Lifecycle state of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VolumeState {
    /// Constructed, not yet opened.
    Created = 0,
    /// Serving reads and writes.
    Open = 1,
    /// Shut down.
    Closed = 2,
}

impl VolumeState {
    fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::Created,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Size information for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentStats {
    /// Segment name.
    pub name: String,
    /// Written bytes.
    pub size: u64,
    /// Capacity in bytes.
    pub capacity: u64,
}

/// Snapshot of volume statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStats {
    /// Volume name.
    pub name: String,
    /// Segments in name order.
    pub segments: Vec<SegmentStats>,
    /// Durable entries.
    pub entry_count: usize,
    /// Entries waiting for a flush.
    pub pending_count: usize,
    /// Newest durable versionstamp.
    pub last_durable: Option<Versionstamp>,
}

#[derive(Default)]
struct VolumeInner {
    segments: BTreeMap<String, Segment>,
    /// Segment the append path writes to.
    active: Option<String>,
    next_segment_id: u64,
    changelog: Option<Changelog>,
    durable: Vec<EntryMetadata>,
    pending: Vec<EntryMetadata>,
    last_commit_version: u64,
    dirty: BTreeSet<String>,
}

impl VolumeInner {
    fn last_versionstamp(&self) -> Option<Versionstamp> {
        self.pending
            .last()
            .or_else(|| self.durable.last())
            .map(|e| e.versionstamp)
    }
}

/// Durable, segmented, append-only log of one shard.
pub struct Volume {
    config: VolumeConfig,
    state: AtomicU8,
    inner: RwLock<VolumeInner>,
    durable_tx: watch::Sender<Versionstamp>,
    lock_file: Mutex<Option<File>>,
}

impl Volume {
    /// Creates a volume in the `Created` state.
    #[must_use]
    pub fn new(config: VolumeConfig) -> Self {
        let (durable_tx, _) = watch::channel(Versionstamp::ZERO);
        Self {
            config,
            state: AtomicU8::new(VolumeState::Created as u8),
            inner: RwLock::new(VolumeInner::default()),
            durable_tx,
            lock_file: Mutex::new(None),
        }
    }

    /// Creates and opens a volume.
    ///
    /// # Errors
    ///
    /// See [`Volume::open`].
    pub fn open_with(config: VolumeConfig) -> CoreResult<Self> {
        let volume = Self::new(config);
        volume.open()?;
        Ok(volume)
    }

    /// Opens the volume, recovering segments and changelog from disk.
    ///
    /// Opening an open volume is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `VolumeClosed` after shutdown, `VolumeLocked` if another
    /// process holds the directory, or an error if recovery fails.
    pub fn open(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        match self.state() {
            VolumeState::Open => return Ok(()),
            VolumeState::Closed => return Err(self.closed()),
            VolumeState::Created => {}
        }

        let changelog_backend: Box<dyn StorageBackend> = match &self.config.root {
            Some(root) => {
                fs::create_dir_all(root.join(SEGMENTS_DIR))?;
                *self.lock_file.lock() = Some(self.lock_root(root)?);
                for entry in fs::read_dir(root.join(SEGMENTS_DIR))? {
                    let entry = entry?;
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    if validate_segment_name(&name).is_err() {
                        continue;
                    }
                    let segment = Segment::open_file(
                        &root.join(SEGMENTS_DIR),
                        &name,
                        self.config.segment_size,
                    )?;
                    inner.segments.insert(name, segment);
                }
                Box::new(FileBackend::open(&root.join(CHANGELOG_FILE))?)
            }
            None => Box::new(InMemoryBackend::new()),
        };

        let (changelog, mut entries) = Changelog::open(changelog_backend)?;
        // A flush retried after a failed sync may have written frames twice.
        let mut last: Option<Versionstamp> = None;
        entries.retain(|e| {
            let keep = last.map_or(true, |l| e.versionstamp > l);
            if keep {
                last = Some(e.versionstamp);
            }
            keep
        });
        inner.last_commit_version = entries
            .last()
            .map_or(0, |e| e.versionstamp.commit_version());
        inner.durable = entries;
        inner.changelog = Some(changelog);

        let generated: Vec<u64> = inner
            .segments
            .keys()
            .filter_map(|name| parse_segment_id(name))
            .collect();
        inner.next_segment_id = generated.iter().max().map_or(0, |id| id + 1);
        inner.active = generated.iter().max().map(|id| segment_name(*id));

        if let Some(last) = inner.durable.last() {
            self.durable_tx.send_replace(last.versionstamp);
        }
        self.state.store(VolumeState::Open as u8, Ordering::Release);

        info!(
            volume = %self.config.name,
            segments = inner.segments.len(),
            entries = inner.durable.len(),
            "volume opened"
        );
        Ok(())
    }

    fn lock_root(&self, root: &std::path::Path) -> CoreResult<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if file.try_lock_exclusive().is_err() {
            return Err(CoreError::VolumeLocked {
                path: root.display().to_string(),
            });
        }
        Ok(file)
    }

    /// Volume name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Volume configuration.
    #[must_use]
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> VolumeState {
        VolumeState::from_byte(self.state.load(Ordering::Acquire))
    }

    fn closed(&self) -> CoreError {
        CoreError::VolumeClosed {
            volume: self.config.name.clone(),
        }
    }

    fn ensure_open(&self) -> CoreResult<()> {
        match self.state() {
            VolumeState::Open => Ok(()),
            VolumeState::Created => Err(CoreError::VolumeNotOpen {
                volume: self.config.name.clone(),
            }),
            VolumeState::Closed => Err(self.closed()),
        }
    }

    fn create_segment(&self, name: &str) -> CoreResult<Segment> {
        match &self.config.root {
            Some(root) => {
                Segment::open_file(&root.join(SEGMENTS_DIR), name, self.config.segment_size)
            }
            None => Ok(Segment::in_memory(name, self.config.segment_size)),
        }
    }

    fn next_commit_version(inner: &mut VolumeInner) -> u64 {
        let version = wall_clock_micros().max(inner.last_commit_version + 1);
        inner.last_commit_version = version;
        version
    }

    /// Appends payloads at the active segment's cursor.
    ///
    /// Rolls over to a new segment when a payload does not fit. All entries
    /// share one commit version and stay pending until the next `flush`.
    ///
    /// # Errors
    ///
    /// Returns `VolumeNotOpen`/`VolumeClosed` outside the open state,
    /// `EntryTooLarge` if a payload exceeds the segment size, or a storage
    /// error.
    pub fn append(&self, payloads: &[Bytes]) -> CoreResult<Vec<EntryMetadata>> {
        let mut inner = self.inner.write();
        self.ensure_open()?;
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        for payload in payloads {
            let length = payload.len() as u64;
            if length > self.config.segment_size || u32::try_from(length).is_err() {
                return Err(CoreError::EntryTooLarge {
                    length,
                    segment_size: self.config.segment_size,
                });
            }
        }

        let commit_version = Self::next_commit_version(&mut inner);
        let mut appended = Vec::with_capacity(payloads.len());
        for (i, payload) in payloads.iter().enumerate() {
            let length = payload.len() as u64;
            let fits = inner
                .active
                .as_ref()
                .and_then(|name| inner.segments.get(name))
                .is_some_and(|segment| segment.fits(length));
            if !fits {
                self.roll_over(&mut inner)?;
            }

            let Some(active) = inner.active.clone() else {
                return Err(CoreError::invalid_operation("volume has no active segment"));
            };
            let segment = inner
                .segments
                .get(&active)
                .ok_or_else(|| CoreError::invalid_operation("active segment missing"))?;
            let position = segment.append(payload)?;
            let entry = EntryMetadata {
                versionstamp: Versionstamp::new(commit_version, (i >> 16) as u16, i as u16),
                segment: active.clone(),
                position,
                length: payload.len() as u32,
            };
            inner.dirty.insert(active);
            inner.pending.push(entry.clone());
            appended.push(entry);
        }
        Ok(appended)
    }

    fn roll_over(&self, inner: &mut VolumeInner) -> CoreResult<()> {
        let mut id = inner.next_segment_id;
        while inner.segments.contains_key(&segment_name(id)) {
            id += 1;
        }
        let name = segment_name(id);
        let segment = self.create_segment(&name)?;
        inner.segments.insert(name.clone(), segment);
        inner.next_segment_id = id + 1;
        info!(volume = %self.config.name, segment = %name, "new active segment");
        inner.active = Some(name);
        Ok(())
    }

    /// Writes pre-packed entries at explicit positions of a segment.
    ///
    /// An entry at the segment cursor is appended and registered as a
    /// pending changelog entry, so it becomes durable on the next `flush`
    /// and is streamed to standbys like appended data. An entry that
    /// exactly repeats bytes already written is accepted without writing.
    /// Anything else would rewrite or leave a gap and is refused. Unknown
    /// segments are created. Returns the position of every entry.
    ///
    /// # Errors
    ///
    /// Returns `PositionConflict`, `SegmentFull`, `EntryTooLarge`,
    /// `InvalidSegmentName`, the not-open/closed errors, or a storage
    /// error. Entries before the failing one stay written and registered.
    pub fn insert(&self, segment_name: &str, entries: &[PackedEntry]) -> CoreResult<Vec<u64>> {
        let mut inner = self.inner.write();
        self.ensure_open()?;
        let mut written = Vec::new();
        let result = self.write_packed(&mut inner, segment_name, entries, &mut written);

        if !written.is_empty() {
            let commit_version = Self::next_commit_version(&mut inner);
            for (i, entry) in written.into_iter().enumerate() {
                inner.pending.push(EntryMetadata {
                    versionstamp: Versionstamp::new(commit_version, (i >> 16) as u16, i as u16),
                    segment: segment_name.to_string(),
                    position: entry.position,
                    length: entry.payload.len() as u32,
                });
            }
        }
        result
    }

    /// Writes replicated bytes at the primary's positions without
    /// registering changelog entries.
    ///
    /// Same placement rules as [`Volume::insert`]. The entries describing
    /// the bytes arrive separately through [`Volume::apply_changes`].
    ///
    /// # Errors
    ///
    /// Same as [`Volume::insert`].
    pub fn write_replicated(
        &self,
        segment_name: &str,
        entries: &[PackedEntry],
    ) -> CoreResult<Vec<u64>> {
        let mut inner = self.inner.write();
        self.ensure_open()?;
        self.write_packed(&mut inner, segment_name, entries, &mut Vec::new())
    }

    /// Places entries in a segment, collecting the ones actually appended.
    fn write_packed<'a>(
        &self,
        inner: &mut VolumeInner,
        segment_name: &str,
        entries: &'a [PackedEntry],
        written: &mut Vec<&'a PackedEntry>,
    ) -> CoreResult<Vec<u64>> {
        validate_segment_name(segment_name)?;
        for entry in entries {
            let length = entry.payload.len() as u64;
            if length > self.config.segment_size || u32::try_from(length).is_err() {
                return Err(CoreError::EntryTooLarge {
                    length,
                    segment_size: self.config.segment_size,
                });
            }
        }

        if !inner.segments.contains_key(segment_name) {
            let segment = self.create_segment(segment_name)?;
            inner.segments.insert(segment_name.to_string(), segment);
            debug!(volume = %self.config.name, segment = %segment_name, "segment created");
        }
        let segment = inner
            .segments
            .get(segment_name)
            .ok_or_else(|| CoreError::invalid_operation("segment missing after create"))?;

        let mut positions = Vec::with_capacity(entries.len());
        for entry in entries {
            let cursor = segment.cursor();
            if entry.position == cursor {
                segment.append(&entry.payload)?;
                inner.dirty.insert(segment_name.to_string());
                if !entry.payload.is_empty() {
                    written.push(entry);
                }
            } else if entry.end() <= cursor
                && segment.read(entry.position, entry.payload.len() as u64)? == entry.payload
            {
                // Replayed write of bytes already present.
            } else {
                return Err(CoreError::PositionConflict {
                    segment: segment_name.to_string(),
                    position: entry.position,
                    cursor,
                });
            }
            positions.push(entry.position);
        }
        Ok(positions)
    }

    /// Registers replicated entries whose bytes are already in place.
    ///
    /// # Errors
    ///
    /// Returns `VersionstampRegression` unless every versionstamp is newer
    /// than all known entries, and `SegmentNotFound`/`RangeOutOfBounds` if an
    /// entry points at bytes that are not written.
    pub fn apply_changes(&self, entries: &[EntryMetadata]) -> CoreResult<()> {
        let mut inner = self.inner.write();
        self.ensure_open()?;

        let mut last = inner.last_versionstamp();
        for entry in entries {
            if let Some(prev) = last {
                if entry.versionstamp <= prev {
                    return Err(CoreError::VersionstampRegression {
                        last: prev.to_string(),
                        received: entry.versionstamp.to_string(),
                    });
                }
            }
            let segment = inner.segments.get(&entry.segment).ok_or_else(|| {
                CoreError::SegmentNotFound {
                    volume: self.config.name.clone(),
                    segment: entry.segment.clone(),
                }
            })?;
            if entry.end() > segment.cursor() {
                return Err(CoreError::RangeOutOfBounds {
                    segment: entry.segment.clone(),
                    position: entry.position,
                    length: u64::from(entry.length),
                    size: segment.cursor(),
                });
            }
            last = Some(entry.versionstamp);
        }

        for entry in entries {
            inner.last_commit_version = inner
                .last_commit_version
                .max(entry.versionstamp.commit_version());
            inner.pending.push(entry.clone());
        }
        Ok(())
    }

    /// Makes previously written bytes and pending entries durable.
    ///
    /// With `force` (or `sync_on_flush`) this waits for stable storage,
    /// otherwise it returns once data reached the OS. Pending entries are
    /// then published to subscribers. Returns the newest durable
    /// versionstamp.
    ///
    /// # Errors
    ///
    /// Returns the not-open/closed errors or a storage error. Pending
    /// entries stay pending on failure.
    pub fn flush(&self, force: bool) -> CoreResult<Option<Versionstamp>> {
        let mut inner = self.inner.write();
        self.ensure_open()?;
        self.flush_locked(&mut inner, force)
    }

    fn flush_locked(
        &self,
        inner: &mut VolumeInner,
        force: bool,
    ) -> CoreResult<Option<Versionstamp>> {
        let sync = force || self.config.sync_on_flush;
        for name in &inner.dirty {
            if let Some(segment) = inner.segments.get(name) {
                if sync {
                    segment.sync()?;
                } else {
                    segment.flush()?;
                }
            }
        }
        inner.dirty.clear();

        if !inner.pending.is_empty() {
            let changelog = inner
                .changelog
                .as_ref()
                .ok_or_else(|| CoreError::invalid_operation("changelog not loaded"))?;
            changelog.append(&inner.pending)?;
            changelog.persist(sync)?;

            let pending = std::mem::take(&mut inner.pending);
            let count = pending.len();
            inner.durable.extend(pending);
            if let Some(last) = inner.durable.last() {
                self.durable_tx.send_replace(last.versionstamp);
                debug!(
                    volume = %self.config.name,
                    entries = count,
                    last = %last.versionstamp,
                    "flushed"
                );
            }
        }
        Ok(inner.durable.last().map(|e| e.versionstamp))
    }

    /// Reads exactly one byte range of a segment.
    ///
    /// # Errors
    ///
    /// Returns the not-open/closed errors, `SegmentNotFound`, or
    /// `RangeOutOfBounds`.
    pub fn read_range(&self, segment: &str, position: u64, length: u64) -> CoreResult<Bytes> {
        let inner = self.inner.read();
        self.ensure_open()?;
        self.segment(&inner, segment)?.read(position, length)
    }

    /// Reads several ranges of one segment, in request order.
    ///
    /// # Errors
    ///
    /// See [`Volume::read_range`].
    pub fn read_ranges(&self, segment: &str, ranges: &[SegmentRange]) -> CoreResult<Vec<Bytes>> {
        let inner = self.inner.read();
        self.ensure_open()?;
        let segment = self.segment(&inner, segment)?;
        ranges
            .iter()
            .map(|r| segment.read(r.position, u64::from(r.length)))
            .collect()
    }

    fn segment<'a>(&self, inner: &'a VolumeInner, name: &str) -> CoreResult<&'a Segment> {
        inner.segments.get(name).ok_or_else(|| CoreError::SegmentNotFound {
            volume: self.config.name.clone(),
            segment: name.to_string(),
        })
    }

    /// Durable entries newer than `after`, oldest first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns the not-open/closed errors.
    pub fn changes_since(
        &self,
        after: Option<Versionstamp>,
        limit: usize,
    ) -> CoreResult<Vec<EntryMetadata>> {
        let inner = self.inner.read();
        self.ensure_open()?;
        let start = match after {
            Some(after) => inner.durable.partition_point(|e| e.versionstamp <= after),
            None => 0,
        };
        Ok(inner.durable[start..].iter().take(limit).cloned().collect())
    }

    /// Every durable entry, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the not-open/closed errors.
    pub fn entries(&self) -> CoreResult<Vec<EntryMetadata>> {
        self.changes_since(None, usize::MAX)
    }

    /// Newest durable versionstamp.
    #[must_use]
    pub fn last_durable(&self) -> Option<Versionstamp> {
        self.inner.read().durable.last().map(|e| e.versionstamp)
    }

    /// Newest registered versionstamp, pending entries included.
    #[must_use]
    pub fn last_versionstamp(&self) -> Option<Versionstamp> {
        self.inner.read().last_versionstamp()
    }

    /// Subscribes to durable versionstamp updates.
    ///
    /// The value is [`Versionstamp::ZERO`] until the first entry is durable.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Versionstamp> {
        self.durable_tx.subscribe()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> VolumeStats {
        let inner = self.inner.read();
        VolumeStats {
            name: self.config.name.clone(),
            segments: inner
                .segments
                .values()
                .map(|s| SegmentStats {
                    name: s.name().to_string(),
                    size: s.cursor(),
                    capacity: s.capacity(),
                })
                .collect(),
            entry_count: inner.durable.len(),
            pending_count: inner.pending.len(),
            last_durable: inner.durable.last().map(|e| e.versionstamp),
        }
    }

    /// Flushes outstanding data and shuts the volume down.
    ///
    /// Closing a closed volume is a no-op. A volume that was never opened
    /// goes straight to `Closed`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the final flush fails; the volume is
    /// closed regardless.
    pub fn close(&self) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let previous = self.state();
        self.state.store(VolumeState::Closed as u8, Ordering::Release);
        if previous != VolumeState::Open {
            return Ok(());
        }

        let result = self.flush_locked(&mut inner, true);
        inner.changelog = None;
        inner.segments.clear();
        inner.active = None;
        if let Some(file) = self.lock_file.lock().take() {
            let _ = FileExt::unlock(&file);
        }
        info!(volume = %self.config.name, "volume closed");
        result.map(|_| ())
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}
