//! Verify command implementation.
//!
//! Reads the changelog and segment files directly, without taking the
//! volume lock, and checks every entry against the bytes on disk.

use std::collections::HashMap;
use std::path::Path;
use tessera_core::{EntryMetadata, KeyRecord, CHANGELOG_FILE, SEGMENTS_DIR};
use tessera_storage::{FileBackend, StorageBackend};
use tracing::debug;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyReport {
    /// Changelog frames decoded.
    pub entries_checked: usize,
    /// Frames repeating the previous entry, written by a retried flush.
    pub duplicate_entries: usize,
    /// Bytes after the last complete frame.
    pub trailing_bytes: u64,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyReport {
    /// Returns true if no problem was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks the volume at `path` and returns the report.
pub fn verify(path: &Path) -> Result<VerifyReport, Box<dyn std::error::Error>> {
    let changelog_path = path.join(CHANGELOG_FILE);
    if !changelog_path.exists() {
        return Err(format!("No volume found at {}", path.display()).into());
    }
    let changelog = FileBackend::open(&changelog_path)?;
    let size = changelog.size()?;
    let buf = changelog.read_at(0, usize::try_from(size)?)?;

    let mut report = VerifyReport::default();
    let mut segments: HashMap<String, Option<FileBackend>> = HashMap::new();
    let mut last: Option<EntryMetadata> = None;
    let mut offset = 0usize;

    loop {
        let (entry, consumed) = match EntryMetadata::decode_frame(&buf[offset..]) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                report
                    .errors
                    .push(format!("Damaged changelog frame at offset {offset}: {e}"));
                break;
            }
        };
        offset += consumed;
        report.entries_checked += 1;

        if let Some(previous) = &last {
            if *previous == entry {
                report.duplicate_entries += 1;
                continue;
            }
            if entry.versionstamp <= previous.versionstamp {
                report.errors.push(format!(
                    "Versionstamp {} does not follow {}",
                    entry.versionstamp, previous.versionstamp
                ));
            }
        }

        let backend = segments.entry(entry.segment.clone()).or_insert_with(|| {
            let file = path.join(SEGMENTS_DIR).join(&entry.segment);
            if file.exists() {
                FileBackend::open(&file).ok()
            } else {
                None
            }
        });
        check_entry(&entry, backend.as_ref(), &mut report);
        last = Some(entry);
    }

    report.trailing_bytes = size - offset as u64;
    debug!(
        entries = report.entries_checked,
        errors = report.errors.len(),
        "verification finished"
    );
    Ok(report)
}

fn check_entry(entry: &EntryMetadata, segment: Option<&FileBackend>, report: &mut VerifyReport) {
    let Some(segment) = segment else {
        report.errors.push(format!(
            "Entry {} references missing segment {}",
            entry.versionstamp, entry.segment
        ));
        return;
    };
    let size = match segment.size() {
        Ok(size) => size,
        Err(e) => {
            report
                .errors
                .push(format!("Cannot stat segment {}: {e}", entry.segment));
            return;
        }
    };
    if entry.end() > size {
        report.errors.push(format!(
            "Entry {} range {}+{} exceeds segment {} of {size} bytes",
            entry.versionstamp, entry.position, entry.length, entry.segment
        ));
        return;
    }
    let decoded = segment
        .read_at(entry.position, entry.length as usize)
        .map_err(|e| e.to_string())
        .and_then(|bytes| KeyRecord::decode(&bytes).map_err(|e| e.to_string()));
    if let Err(e) = decoded {
        report.errors.push(format!(
            "Entry {} does not hold a key record: {e}",
            entry.versionstamp
        ));
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<VerifyReport, Box<dyn std::error::Error>> {
    println!("Verifying volume at {}", path.display());
    let report = verify(path)?;
    print_report(&report);
    Ok(report)
}

fn print_report(report: &VerifyReport) {
    println!("Entries checked: {}", report.entries_checked);
    if report.duplicate_entries > 0 {
        println!("Duplicate frames: {}", report.duplicate_entries);
    }
    if report.trailing_bytes > 0 {
        println!("Incomplete tail: {} bytes", report.trailing_bytes);
    }
    for error in &report.errors {
        println!("  error: {error}");
    }
    println!();
    if report.is_clean() {
        println!("Volume verification passed");
    } else {
        println!("Volume verification failed ({} errors)", report.errors.len());
    }
}
