//! CLI command implementations.

pub mod append;
pub mod dump;
pub mod format;
pub mod inspect;
pub mod verify;

use clap::ValueEnum;
use seglog_core::{FreeListProvider, Journal, JournalConfig, WritePipeline};
use seglog_storage::{FileSegmentManager, SegmentManager};
use std::path::Path;
use std::sync::Arc;

/// Result type shared by all commands.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// How command output is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable text.
    Text,
    /// Pretty printed JSON.
    Json,
}

/// Mounts the journal device at `path`.
pub fn mount(path: &Path) -> CliResult<Arc<FileSegmentManager>> {
    if !path.exists() {
        return Err(format!("no journal found at {}", path.display()).into());
    }
    Ok(Arc::new(FileSegmentManager::mount(path)?))
}

/// Builds a journal over `device` that has not been replayed or opened.
pub fn journal(device: Arc<FileSegmentManager>) -> CliResult<Journal> {
    let num_segments = device.num_segments();
    let journal = Journal::new(device, JournalConfig::default())?;
    journal.set_segment_provider(Arc::new(FreeListProvider::new(num_segments)));
    journal.set_write_pipeline(Arc::new(WritePipeline::new()));
    Ok(journal)
}
