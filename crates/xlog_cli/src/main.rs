//! xlog CLI
//!
//! Command-line tools for xlog data directories.
//!
//! # Commands
//!
//! - `init` - Create a new data directory
//! - `controldata` - Display the control file
//! - `dump-wal` - Dump log records for debugging
//! - `verify` - Check that the log is readable from the last checkpoint
//! - `timelines` - List timeline history files
//! - `checkpoint` - Run startup recovery, then a shutdown checkpoint

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use xlog_core::Lsn;

/// xlog command-line tools.
#[derive(Parser)]
#[command(name = "xlogctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
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
    /// Create a new data directory
    Init {
        /// WAL page size in bytes
        #[arg(long, default_value = "8192")]
        page_size: u32,

        /// Segment file size in bytes
        #[arg(long, default_value = "16777216")]
        segment_size: u32,

        /// Enable archiving of completed segments
        #[arg(long)]
        archive: bool,
    },

    /// Display the control file
    Controldata {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump log records for debugging
    DumpWal {
        /// Start at this position (default: redo pointer of the last checkpoint)
        #[arg(short, long)]
        start: Option<Lsn>,

        /// Timeline to follow (default: timeline of the last checkpoint)
        #[arg(short, long)]
        timeline: Option<u32>,

        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check that the log is readable from the last checkpoint
    Verify,

    /// List timeline history files
    Timelines {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run startup recovery, then a shutdown checkpoint
    Checkpoint,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Init {
            page_size,
            segment_size,
            archive,
        } => {
            let path = cli.path.ok_or("Data directory path required for init")?;
            commands::init::run(&path, page_size, segment_size, archive)?;
        }
        Commands::Controldata { format } => {
            let path = cli.path.ok_or("Data directory path required for controldata")?;
            commands::controldata::run(&path, &format)?;
        }
        Commands::DumpWal {
            start,
            timeline,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Data directory path required for dump-wal")?;
            commands::dump_wal::run(&path, start, timeline, limit, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Data directory path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Timelines { format } => {
            let path = cli.path.ok_or("Data directory path required for timelines")?;
            commands::timelines::run(&path, &format)?;
        }
        Commands::Checkpoint => {
            let path = cli.path.ok_or("Data directory path required for checkpoint")?;
            commands::checkpoint::run(&path)?;
        }
        Commands::Version => {
            println!("xlogctl v{}", env!("CARGO_PKG_VERSION"));
            println!("xlog core v{}", xlog_core::VERSION);
        }
    }

    Ok(())
}
