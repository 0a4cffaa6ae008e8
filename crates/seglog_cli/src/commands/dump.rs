//! Dump command implementation.

use super::{journal, mount, CliResult, OutputFormat};
use seglog_core::DeltaKind;
use serde::Serialize;
use std::path::Path;

/// One replayed delta.
#[derive(Debug, Serialize)]
pub struct DumpEntry {
    /// Journal position of the record.
    pub position: String,
    /// Address of the record's data.
    pub base: String,
    /// Delta kind.
    pub kind: String,
    /// Delta target.
    pub target: u64,
    /// Payload length in bytes.
    pub payload_len: usize,
}

pub(crate) fn kind_name(kind: DeltaKind) -> &'static str {
    match kind {
        DeltaKind::Update => "update",
        DeltaKind::Alloc => "alloc",
        DeltaKind::Retire => "retire",
        DeltaKind::Root => "root",
    }
}

/// Replays the journal and returns up to `limit` deltas in log order.
pub async fn collect(path: &Path, limit: Option<usize>) -> CliResult<Vec<DumpEntry>> {
    let journal = journal(mount(path)?)?;
    let headers = journal.find_segment_headers().await?;

    let mut entries = Vec::new();
    journal
        .replay(headers, |position, base, delta| {
            if limit.is_none_or(|limit| entries.len() < limit) {
                entries.push(DumpEntry {
                    position: position.to_string(),
                    base: base.to_string(),
                    kind: kind_name(delta.kind).to_string(),
                    target: delta.target,
                    payload_len: delta.payload.len(),
                });
            }
            Ok(())
        })
        .await?;
    Ok(entries)
}

/// Runs the dump command.
pub async fn run(path: &Path, limit: Option<usize>, format: OutputFormat) -> CliResult<()> {
    let entries = collect(path, limit).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Text => {
            for entry in &entries {
                println!(
                    "{:<28} {:<7} target {:<10} {} bytes  data {}",
                    entry.position, entry.kind, entry.target, entry.payload_len, entry.base
                );
            }
            println!("{} deltas", entries.len());
        }
    }
    Ok(())
}
