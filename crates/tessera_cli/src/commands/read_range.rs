//! Read range command implementation.

use super::open_volume;
use std::fmt::Write;
use std::path::Path;

/// Bytes per output line.
const LINE_WIDTH: usize = 16;

/// Reads `length` bytes at `position` of `segment`.
pub fn read(
    path: &Path,
    segment: &str,
    position: u64,
    length: u64,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let volume = open_volume(path)?;
    let bytes = volume.read_range(segment, position, length)?;
    volume.close()?;
    Ok(bytes.to_vec())
}

/// Formats bytes as offset-prefixed hex lines with an ASCII column.
pub fn hex_dump(base: u64, bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, line) in bytes.chunks(LINE_WIDTH).enumerate() {
        let offset = base + (i * LINE_WIDTH) as u64;
        let _ = write!(out, "{offset:012x}  ");
        for b in line {
            let _ = write!(out, "{b:02x} ");
        }
        for _ in line.len()..LINE_WIDTH {
            out.push_str("   ");
        }
        out.push(' ');
        out.extend(line.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

/// Runs the read-range command.
pub fn run(
    path: &Path,
    segment: &str,
    position: u64,
    length: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = read(path, segment, position, length)?;
    print!("{}", hex_dump(position, &bytes));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tessera_core::{segment_name, Volume, VolumeConfig};

    #[test]
    fn hex_dump_pads_short_lines() {
        let dump = hex_dump(16, b"AB");
        assert_eq!(
            dump,
            format!("000000000010  41 42 {} AB\n", "   ".repeat(LINE_WIDTH - 2))
        );
    }

    #[test]
    fn reads_exact_range() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("v1");
        let volume = Volume::open_with(VolumeConfig::new("v1").root(&root)).unwrap();
        volume
            .append(&[Bytes::from_static(b"A"), Bytes::from_static(b"BB")])
            .unwrap();
        volume.flush(true).unwrap();
        volume.close().unwrap();

        let segment = segment_name(0);
        assert_eq!(read(&root, &segment, 0, 1).unwrap(), b"A");
        assert_eq!(read(&root, &segment, 1, 2).unwrap(), b"BB");
        assert!(read(&root, &segment, 2, 5).is_err());
    }
}
