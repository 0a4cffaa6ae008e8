//! Error types for segment device operations.

use crate::device::{Paddr, SegmentId};
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during segment device operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a segment.
    #[error("read beyond end of segment: {addr}, len {len}, segment size {size}")]
    ReadPastEnd {
        /// The requested read address.
        addr: Paddr,
        /// The requested read length.
        len: usize,
        /// The segment size.
        size: u32,
    },

    /// The segment id does not name a segment on this device.
    #[error("invalid segment {0}")]
    InvalidSegment(SegmentId),

    /// A write offset or length is not a multiple of the block size.
    #[error("misaligned write at offset {offset} (len {len}), block size {block_size}")]
    Misaligned {
        /// The requested offset.
        offset: u32,
        /// The requested length.
        len: usize,
        /// The device block size.
        block_size: u32,
    },

    /// A write would extend past the segment's write capacity.
    #[error("write out of bounds on {segment}: offset {offset}, len {len}, capacity {capacity}")]
    WriteOutOfBounds {
        /// The target segment.
        segment: SegmentId,
        /// The requested offset.
        offset: u32,
        /// The requested length.
        len: usize,
        /// The segment write capacity.
        capacity: u32,
    },

    /// The segment is not open for writes.
    #[error("segment {0} is not open")]
    SegmentNotOpen(SegmentId),

    /// The segment is already open or closed and must be released first.
    #[error("segment {0} is in use")]
    SegmentInUse(SegmentId),

    /// The device geometry is invalid.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The device image is corrupted.
    #[error("device corrupted: {0}")]
    Corrupted(String),

    /// A failure injected by a test hook.
    #[error("injected failure: {0}")]
    Injected(String),
}
