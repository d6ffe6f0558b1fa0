//! Inspect command implementation.

use super::open_volume;
use serde::Serialize;
use std::path::Path;

/// Volume inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Volume directory.
    pub path: String,
    /// Volume name.
    pub name: String,
    /// Segments in name order.
    pub segments: Vec<SegmentInfo>,
    /// Sum of segment sizes in bytes.
    pub total_size: u64,
    /// Number of durable changelog entries.
    pub entry_count: usize,
    /// Newest durable versionstamp, hex-encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_versionstamp: Option<String>,
}

/// One segment.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// Segment name.
    pub name: String,
    /// Bytes written.
    pub size: u64,
    /// Capacity in bytes.
    pub capacity: u64,
}

/// Collects inspection data for the volume at `path`.
pub fn inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let volume = open_volume(path)?;
    let stats = volume.stats();
    volume.close()?;

    let segments: Vec<SegmentInfo> = stats
        .segments
        .into_iter()
        .map(|s| SegmentInfo {
            name: s.name,
            size: s.size,
            capacity: s.capacity,
        })
        .collect();
    Ok(InspectResult {
        path: path.display().to_string(),
        name: stats.name,
        total_size: segments.iter().map(|s| s.size).sum(),
        segments,
        entry_count: stats.entry_count,
        last_versionstamp: stats.last_durable.map(|v| v.to_string()),
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Volume: {} ({})", result.name, result.path);
    println!("Entries: {}", result.entry_count);
    println!(
        "Last versionstamp: {}",
        result.last_versionstamp.as_deref().unwrap_or("-")
    );
    println!("Total size: {} bytes", result.total_size);
    println!();
    println!("Segments ({}):", result.segments.len());
    for segment in &result.segments {
        let used = if segment.capacity == 0 {
            0.0
        } else {
            segment.size as f64 * 100.0 / segment.capacity as f64
        };
        println!(
            "  {}  {:>12} / {:>12} bytes  ({used:.1}%)",
            segment.name, segment.size, segment.capacity
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tessera_core::{Volume, VolumeConfig};

    #[test]
    fn inspect_reports_segments_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("redis-shard-0");
        let volume = Volume::open_with(VolumeConfig::new("redis-shard-0").root(&root)).unwrap();
        volume
            .append(&[Bytes::from_static(b"abc"), Bytes::from_static(b"de")])
            .unwrap();
        let last = volume.flush(true).unwrap();
        volume.close().unwrap();

        let result = inspect(&root).unwrap();
        assert_eq!(result.name, "redis-shard-0");
        assert_eq!(result.entry_count, 2);
        assert_eq!(result.total_size, 5);
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.last_versionstamp, last.map(|v| v.to_string()));
    }

    #[test]
    fn missing_volume_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect(dir.path()).is_err());
    }
}
