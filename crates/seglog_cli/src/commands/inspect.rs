//! Inspect command implementation.

use super::{mount, CliResult, OutputFormat};
use seglog_core::ExtentReader;
use seglog_storage::SegmentManager;
use serde::Serialize;
use std::path::Path;

/// Device layout and journal segments.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Device file path.
    pub path: String,
    /// Segment size in bytes.
    pub segment_size: u32,
    /// Block size in bytes.
    pub block_size: u32,
    /// Number of segments on the device.
    pub num_segments: u32,
    /// Segments carrying a journal header, oldest first.
    pub segments: Vec<SegmentInfo>,
}

/// One journal segment.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// Physical segment id.
    pub id: u32,
    /// Journal sequence number.
    pub sequence: u64,
    /// Segment nonce.
    pub nonce: String,
    /// Journal tail recorded when the segment was opened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_tail: Option<String>,
}

/// Reads the device layout and every segment header.
pub async fn collect(path: &Path) -> CliResult<InspectResult> {
    let device = mount(path)?;
    let geometry = device.geometry();
    let reader = ExtentReader::new(device);

    let mut headers = reader.scan_segment_headers().await?;
    headers.sort_by_key(|(_, header)| header.segment_seq);
    let segments = headers
        .into_iter()
        .map(|(id, header)| SegmentInfo {
            id: id.as_u32(),
            sequence: header.segment_seq.as_u64(),
            nonce: header.segment_nonce.to_string(),
            journal_tail: header.journal_tail.map(|tail| tail.to_string()),
        })
        .collect();

    Ok(InspectResult {
        path: path.display().to_string(),
        segment_size: geometry.segment_size,
        block_size: geometry.block_size,
        num_segments: geometry.num_segments,
        segments,
    })
}

/// Runs the inspect command.
pub async fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let result = collect(path).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Journal: {}", result.path);
    println!(
        "Geometry: {} segments x {} bytes, {} byte blocks",
        result.num_segments, result.segment_size, result.block_size
    );
    println!(
        "Journal segments: {} of {}",
        result.segments.len(),
        result.num_segments
    );
    for segment in &result.segments {
        let tail = segment.journal_tail.as_deref().unwrap_or("-");
        println!(
            "  seg:{:<4} seq {:<8} nonce {}  tail {}",
            segment.id, segment.sequence, segment.nonce, tail
        );
    }
}
