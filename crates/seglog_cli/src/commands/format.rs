//! Format command implementation.

use super::CliResult;
use seglog_storage::{FileSegmentManager, SegmentGeometry};
use std::path::Path;

/// Creates an empty journal device file.
///
/// Refuses to replace an existing file unless `force` is set.
pub fn create(
    path: &Path,
    segment_size: u32,
    block_size: u32,
    num_segments: u32,
    force: bool,
) -> CliResult<FileSegmentManager> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to replace it)",
            path.display()
        )
        .into());
    }
    let geometry = SegmentGeometry::new(segment_size, block_size, num_segments);
    Ok(FileSegmentManager::create(path, geometry)?)
}

/// Runs the format command.
pub fn run(
    path: &Path,
    segment_size: u32,
    block_size: u32,
    num_segments: u32,
    force: bool,
) -> CliResult<()> {
    create(path, segment_size, block_size, num_segments, force)?;
    println!(
        "Formatted {} with {num_segments} segments of {segment_size} bytes ({block_size} byte blocks)",
        path.display()
    );
    Ok(())
}
