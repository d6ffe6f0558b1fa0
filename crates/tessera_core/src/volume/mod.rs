//! Segmented append-only volumes.

mod changelog;
mod entry;
mod segment;
mod service;
#[allow(clippy::module_inception)]
mod volume;

pub use changelog::Changelog;
pub use entry::{compute_crc32, EntryMetadata};
pub use segment::{parse_segment_id, segment_name, Segment};
pub use service::VolumeService;
pub use volume::{
    SegmentStats, Volume, VolumeConfig, VolumeState, VolumeStats, CHANGELOG_FILE, LOCK_FILE,
    SEGMENTS_DIR,
};
