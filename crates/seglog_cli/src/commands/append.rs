//! Append command implementation.

use super::{journal, mount, CliResult, OutputFormat};
use seglog_core::{Delta, DeltaKind, OrderingHandle, Record};
use serde::Serialize;
use std::path::Path;

/// Where an appended record landed.
#[derive(Debug, Serialize)]
pub struct AppendEntry {
    /// Journal position of the record.
    pub position: String,
    /// Address of the record's data.
    pub addr: String,
}

/// Appends `count` records after whatever the journal already holds.
///
/// Record `i` carries one delta for `target + i` with `payload`. Every call
/// replays the journal first and then writes into a fresh segment.
pub async fn append(
    path: &Path,
    kind: DeltaKind,
    target: u64,
    payload: &[u8],
    count: usize,
) -> CliResult<Vec<AppendEntry>> {
    let journal = journal(mount(path)?)?;
    let headers = journal.find_segment_headers().await?;
    journal.replay(headers, |_, _, _| Ok(())).await?;
    journal.open_for_write().await?;

    let mut entries = Vec::with_capacity(count);
    for i in 0..count as u64 {
        let record = Record::new().with_delta(Delta::new(kind, target + i, payload.to_vec()));
        let mut handle = OrderingHandle::new();
        let written = journal.submit_record(record, &mut handle).await?;
        entries.push(AppendEntry {
            position: written.position.to_string(),
            addr: written.addr.to_string(),
        });
    }
    journal.close().await?;
    Ok(entries)
}

/// Runs the append command.
pub async fn run(
    path: &Path,
    kind: DeltaKind,
    target: u64,
    payload: &str,
    count: usize,
    format: OutputFormat,
) -> CliResult<()> {
    let entries = append(path, kind, target, payload.as_bytes(), count).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Text => {
            for entry in &entries {
                println!("appended at {} (data {})", entry.position, entry.addr);
            }
        }
    }
    Ok(())
}
