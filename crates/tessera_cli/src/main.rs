//! Tessera CLI
//!
//! Offline tools for a single volume directory.
//!
//! # Commands
//!
//! - `inspect` - Display segments, sizes and changelog statistics
//! - `dump-entries` - List changelog entries
//! - `read-range` - Print one byte range of a segment as hex
//! - `verify` - Check that every entry resolves to a decodable key record

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tessera volume tools.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the volume directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display segments, sizes and changelog statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List changelog entries, oldest first
    DumpEntries {
        /// Maximum number of entries to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print one byte range of a segment as hex
    ReadRange {
        /// Segment name
        segment: String,

        /// Byte position inside the segment
        position: u64,

        /// Number of bytes
        length: u64,
    },

    /// Check every changelog entry against the segments
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Volume path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpEntries { limit, format } => {
            let path = cli.path.ok_or("Volume path required for dump-entries")?;
            commands::dump_entries::run(&path, limit, &format)?;
        }
        Commands::ReadRange {
            segment,
            position,
            length,
        } => {
            let path = cli.path.ok_or("Volume path required for read-range")?;
            commands::read_range::run(&path, &segment, position, length)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Volume path required for verify")?;
            let report = commands::verify::run(&path)?;
            if !report.is_clean() {
                std::process::exit(1);
            }
        }
        Commands::Version => {
            println!("Tessera CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
