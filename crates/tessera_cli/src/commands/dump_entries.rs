//! Dump entries command implementation.

use super::open_volume;
use serde::Serialize;
use std::path::Path;
use tessera_core::KeyRecord;

/// One changelog entry for output.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Versionstamp, hex-encoded.
    pub versionstamp: String,
    /// Segment name.
    pub segment: String,
    /// Byte position.
    pub position: u64,
    /// Payload length.
    pub length: u32,
    /// Key of the record, if the payload decodes as one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// True if the record is a deletion.
    pub tombstone: bool,
}

/// Reads up to `limit` entries of the volume at `path`.
pub fn read_entries(
    path: &Path,
    limit: Option<usize>,
) -> Result<Vec<EntryInfo>, Box<dyn std::error::Error>> {
    let volume = open_volume(path)?;
    let entries = volume.changes_since(None, limit.unwrap_or(usize::MAX))?;

    let mut infos = Vec::with_capacity(entries.len());
    for entry in entries {
        let record = volume
            .read_range(&entry.segment, entry.position, u64::from(entry.length))
            .ok()
            .and_then(|bytes| KeyRecord::decode(&bytes).ok());
        infos.push(EntryInfo {
            versionstamp: entry.versionstamp.to_string(),
            segment: entry.segment,
            position: entry.position,
            length: entry.length,
            tombstone: record.as_ref().is_some_and(|r| r.value.is_none()),
            key: record.map(|r| r.key),
        });
    }
    volume.close()?;
    Ok(infos)
}

/// Runs the dump-entries command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = read_entries(path, limit)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(&entries);
        }
    }
    Ok(())
}

fn print_text_output(entries: &[EntryInfo]) {
    println!(
        "{:<24}  {:<19}  {:>12}  {:>8}  KEY",
        "VERSIONSTAMP", "SEGMENT", "POSITION", "LENGTH"
    );
    for entry in entries {
        let key = match (&entry.key, entry.tombstone) {
            (Some(key), true) => format!("{key} (deleted)"),
            (Some(key), false) => key.clone(),
            (None, _) => "?".to_string(),
        };
        println!(
            "{:<24}  {:<19}  {:>12}  {:>8}  {key}",
            entry.versionstamp, entry.segment, entry.position, entry.length
        );
    }
    println!("\nTotal: {} entries", entries.len());
}
