//! CLI command implementations.

pub mod dump_entries;
pub mod inspect;
pub mod read_range;
pub mod verify;

use std::path::Path;
use tessera_core::{Volume, VolumeConfig, CHANGELOG_FILE};

/// Opens the volume stored at `path`, named after the directory.
pub fn open_volume(path: &Path) -> Result<Volume, Box<dyn std::error::Error>> {
    if !path.join(CHANGELOG_FILE).exists() {
        return Err(format!("No volume found at {}", path.display()).into());
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("volume")
        .to_string();
    Ok(Volume::open_with(VolumeConfig::new(name).root(path))?)
}
