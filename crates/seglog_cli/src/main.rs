//! SegLog CLI
//!
//! Command-line tools for SegLog journal files.
//!
//! # Commands
//!
//! - `format` - Create an empty journal device file
//! - `inspect` - Display the device layout and journal segments
//! - `verify` - Check every segment and replay the journal
//! - `dump` - Print replayed deltas for debugging
//! - `append` - Append records to the journal

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use commands::OutputFormat;
use seglog_core::DeltaKind;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// SegLog command-line journal tools.
#[derive(Parser)]
#[command(name = "seglog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the journal device file
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
    /// Create an empty journal device file
    Format {
        /// Segment size in bytes
        #[arg(long, default_value_t = 1 << 20)]
        segment_size: u32,

        /// Block size in bytes
        #[arg(long, default_value_t = 4096)]
        block_size: u32,

        /// Number of segments
        #[arg(long, default_value_t = 16)]
        segments: u32,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },

    /// Display the device layout and journal segments
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Check every segment and replay the journal
    Verify,

    /// Print replayed deltas
    Dump {
        /// Maximum number of deltas to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Append records, each carrying one delta
    Append {
        /// Delta kind
        #[arg(short, long, value_enum, default_value_t = KindArg::Update)]
        kind: KindArg,

        /// Target of the first delta; later records count up from it
        #[arg(short, long, default_value_t = 0)]
        target: u64,

        /// Delta payload
        #[arg(short, long, default_value = "")]
        data: String,

        /// Number of records
        #[arg(short, long, default_value_t = 1)]
        count: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show version information
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Update,
    Alloc,
    Retire,
    Root,
}

impl From<KindArg> for DeltaKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Update => Self::Update,
            KindArg::Alloc => Self::Alloc,
            KindArg::Retire => Self::Retire,
            KindArg::Root => Self::Root,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Format {
            segment_size,
            block_size,
            segments,
            force,
        } => {
            let path = cli.path.ok_or("Journal path required for format")?;
            commands::format::run(&path, segment_size, block_size, segments, force)?;
        }
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Journal path required for inspect")?;
            runtime.block_on(commands::inspect::run(&path, format))?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Journal path required for verify")?;
            runtime.block_on(commands::verify::run(&path))?;
        }
        Commands::Dump { limit, format } => {
            let path = cli.path.ok_or("Journal path required for dump")?;
            runtime.block_on(commands::dump::run(&path, limit, format))?;
        }
        Commands::Append {
            kind,
            target,
            data,
            count,
            format,
        } => {
            let path = cli.path.ok_or("Journal path required for append")?;
            runtime.block_on(commands::append::run(
                &path,
                kind.into(),
                target,
                &data,
                count,
                format,
            ))?;
        }
        Commands::Version => {
            println!("SegLog CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
