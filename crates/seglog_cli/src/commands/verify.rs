//! Verify command implementation.

use super::{journal, mount, CliResult};
use seglog_core::format::segment_header_length;
use seglog_core::{decode_metadata, ExtentReader, ScanStop};
use seglog_storage::{Paddr, SegmentManager};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

/// Scan result for one journal segment.
#[derive(Debug)]
pub struct SegmentCheck {
    /// Physical segment id.
    pub id: u32,
    /// Journal sequence number.
    pub sequence: u64,
    /// Valid record groups found.
    pub groups: usize,
    /// Offset just past the last valid group.
    pub end: u32,
    /// Why the scan stopped.
    pub stop: ScanStop,
}

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Per-segment scan results, oldest first.
    pub segments: Vec<SegmentCheck>,
    /// Records replayed.
    pub records: usize,
    /// Deltas replayed.
    pub deltas: usize,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Returns `true` if no problems were found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Scans every journal segment and replays the journal.
pub async fn collect(path: &Path) -> CliResult<VerifyResult> {
    let device = mount(path)?;
    let header_len = segment_header_length(device.block_size());
    let reader = ExtentReader::new(Arc::clone(&device) as Arc<dyn SegmentManager>);
    let mut result = VerifyResult::default();

    let mut headers = reader.scan_segment_headers().await?;
    headers.sort_by_key(|(_, header)| header.segment_seq);
    for (id, header) in &headers {
        let start = Paddr::new(*id, header_len);
        let mut undecodable = None;
        let outcome = reader
            .scan_valid_records(start, header.segment_nonce, |group| {
                for layout in group.records() {
                    if decode_metadata(&layout.metadata).is_none() {
                        undecodable = Some(layout.position);
                        return Ok(ControlFlow::Break(()));
                    }
                }
                Ok(ControlFlow::Continue(()))
            })
            .await?;
        if let Some(position) = undecodable {
            result
                .errors
                .push(format!("undecodable record metadata at {position}"));
        }
        result.segments.push(SegmentCheck {
            id: id.as_u32(),
            sequence: header.segment_seq.as_u64(),
            groups: outcome.groups,
            end: outcome.end.offset,
            stop: outcome.stop,
        });
    }

    let journal = journal(device)?;
    match journal.replay(headers, |_, _, _| Ok(())).await {
        Ok(summary) => {
            result.records = summary.records;
            result.deltas = summary.deltas;
        }
        Err(e) => result.errors.push(format!("replay failed: {e}")),
    }
    Ok(result)
}

/// Runs the verify command.
pub async fn run(path: &Path) -> CliResult<()> {
    println!("Verifying journal at {}", path.display());
    let result = collect(path).await?;

    for segment in &result.segments {
        println!(
            "  seg:{:<4} seq {:<8} {} groups, ends at {:#x} ({:?})",
            segment.id, segment.sequence, segment.groups, segment.end, segment.stop
        );
    }
    println!("{} records, {} deltas", result.records, result.deltas);
    for error in &result.errors {
        println!("  error: {error}");
    }

    if result.is_ok() {
        println!("Journal verification passed");
        Ok(())
    } else {
        println!("Journal verification failed");
        Err("verification failed".into())
    }
}
