//! Segment device trait definitions and addressing types.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Identifier of a physical segment on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub u32);

impl SegmentId {
    /// Creates a new segment id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg:{}", self.0)
    }
}

/// Physical address: a byte offset within a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Paddr {
    /// Segment holding the address.
    pub segment: SegmentId,
    /// Byte offset from the start of the segment.
    pub offset: u32,
}

impl Paddr {
    /// Creates a new physical address.
    #[must_use]
    pub const fn new(segment: SegmentId, offset: u32) -> Self {
        Self { segment, offset }
    }

    /// Returns the address `delta` bytes further into the same segment.
    #[must_use]
    pub const fn add_offset(self, delta: u32) -> Self {
        Self {
            segment: self.segment,
            offset: self.offset + delta,
        }
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{:#x}", self.segment, self.offset)
    }
}

/// Fixed geometry of a segment device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentGeometry {
    /// Size of every segment in bytes.
    pub segment_size: u32,
    /// Write alignment in bytes.
    pub block_size: u32,
    /// Number of segments on the device.
    pub num_segments: u32,
}

impl SegmentGeometry {
    /// Creates a geometry description.
    #[must_use]
    pub const fn new(segment_size: u32, block_size: u32, num_segments: u32) -> Self {
        Self {
            segment_size,
            block_size,
            num_segments,
        }
    }

    /// Checks that the geometry can back a journal.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidGeometry`] if the block size is not a
    /// power of two, the segment size is not a multiple of at least two
    /// blocks, or the device has no segments.
    pub fn validate(&self) -> StorageResult<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(StorageError::InvalidGeometry(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.segment_size % self.block_size != 0 {
            return Err(StorageError::InvalidGeometry(format!(
                "segment size {} is not a multiple of block size {}",
                self.segment_size, self.block_size
            )));
        }
        if self.segment_size / self.block_size < 2 {
            return Err(StorageError::InvalidGeometry(format!(
                "segment size {} holds fewer than two blocks",
                self.segment_size
            )));
        }
        if self.num_segments == 0 {
            return Err(StorageError::InvalidGeometry(
                "device has no segments".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns whether `value` is a multiple of the block size.
    #[must_use]
    pub const fn is_aligned(&self, value: u64) -> bool {
        value % self.block_size as u64 == 0
    }

    /// Checks that `len` bytes at `addr` lie inside a segment of this device.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment id is invalid or the range extends
    /// past the end of the segment.
    pub fn check_read(&self, addr: Paddr, len: usize) -> StorageResult<()> {
        if addr.segment.as_u32() >= self.num_segments {
            return Err(StorageError::InvalidSegment(addr.segment));
        }
        let end = u64::from(addr.offset) + len as u64;
        if end > u64::from(self.segment_size) {
            return Err(StorageError::ReadPastEnd {
                addr,
                len,
                size: self.segment_size,
            });
        }
        Ok(())
    }

    /// Checks that a write of `len` bytes at `offset` is block aligned and
    /// fits inside a segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment id is invalid, the write is
    /// misaligned, or it extends past the segment capacity.
    pub fn check_write(&self, segment: SegmentId, offset: u32, len: usize) -> StorageResult<()> {
        if segment.as_u32() >= self.num_segments {
            return Err(StorageError::InvalidSegment(segment));
        }
        if !self.is_aligned(u64::from(offset)) || !self.is_aligned(len as u64) {
            return Err(StorageError::Misaligned {
                offset,
                len,
                block_size: self.block_size,
            });
        }
        if u64::from(offset) + len as u64 > u64::from(self.segment_size) {
            return Err(StorageError::WriteOutOfBounds {
                segment,
                offset,
                len,
                capacity: self.segment_size,
            });
        }
        Ok(())
    }
}

/// Lifecycle of a segment slot on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Empty,
    Open,
    Closed,
}

/// An open, append-only segment.
///
/// Writes must be block aligned and stay within the write capacity. Several
/// writes may be in flight at once; they may complete in any order.
#[async_trait]
pub trait Segment: Send + Sync {
    /// Returns the id of this segment.
    fn id(&self) -> SegmentId;

    /// Returns the highest byte offset written so far.
    fn write_ptr(&self) -> u32;

    /// Returns the number of bytes that may be written to this segment.
    fn write_capacity(&self) -> u32;

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is closed, the write is misaligned or
    /// out of bounds, or the device fails.
    async fn write(&self, offset: u32, data: Bytes) -> StorageResult<()>;

    /// Closes the segment; further writes fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the device fails to seal the segment.
    async fn close(&self) -> StorageResult<()>;
}

/// Shared handle to an open segment.
pub type SegmentRef = Arc<dyn Segment>;

/// A block device split into fixed-size segments.
///
/// Devices are **opaque byte stores**. They do not interpret journal
/// headers or records; the journal owns all format interpretation.
///
/// # Invariants
///
/// - `open` hands out a segment at most once until it is released
/// - `read` returns exactly the bytes previously written at that address
/// - Devices must be `Send + Sync` for use from spawned write tasks
#[async_trait]
pub trait SegmentManager: Send + Sync {
    /// Opens an empty segment for writing.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid or the segment is in use.
    async fn open(&self, id: SegmentId) -> StorageResult<SegmentRef>;

    /// Returns a closed segment to the empty state.
    ///
    /// The bytes are left in place; stale contents are detected by the
    /// journal through segment nonces.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is invalid.
    async fn release(&self, id: SegmentId) -> StorageResult<()>;

    /// Reads `len` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read extends past the segment or the device
    /// fails.
    async fn read(&self, addr: Paddr, len: usize) -> StorageResult<Bytes>;

    /// Returns the device geometry.
    fn geometry(&self) -> SegmentGeometry;

    /// Returns the size of each segment in bytes.
    fn segment_size(&self) -> u32 {
        self.geometry().segment_size
    }

    /// Returns the write alignment in bytes.
    fn block_size(&self) -> u32 {
        self.geometry().block_size
    }

    /// Returns the number of segments.
    fn num_segments(&self) -> u32 {
        self.geometry().num_segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paddr_ordering_within_segment() {
        let a = Paddr::new(SegmentId::new(3), 512);
        let b = a.add_offset(256);
        assert!(a < b);
        assert_eq!(b.offset, 768);
        assert_eq!(b.segment, SegmentId::new(3));
    }

    #[test]
    fn paddr_display() {
        let addr = Paddr::new(SegmentId::new(2), 0x200);
        assert_eq!(format!("{addr}"), "seg:2+0x200");
    }

    #[test]
    fn geometry_accepts_valid_layout() {
        assert!(SegmentGeometry::new(4096, 512, 4).validate().is_ok());
    }

    #[test]
    fn geometry_rejects_bad_block_size() {
        let result = SegmentGeometry::new(4096, 500, 4).validate();
        assert!(matches!(result, Err(StorageError::InvalidGeometry(_))));
    }

    #[test]
    fn geometry_rejects_single_block_segments() {
        let result = SegmentGeometry::new(512, 512, 4).validate();
        assert!(matches!(result, Err(StorageError::InvalidGeometry(_))));
    }

    #[test]
    fn geometry_checks_write_ranges() {
        let geometry = SegmentGeometry::new(4096, 512, 4);
        let seg = SegmentId::new(1);
        assert!(geometry.check_write(seg, 512, 1024).is_ok());
        assert!(matches!(
            geometry.check_write(seg, 256, 512),
            Err(StorageError::Misaligned { .. })
        ));
        assert!(matches!(
            geometry.check_write(seg, 3584, 1024),
            Err(StorageError::WriteOutOfBounds { .. })
        ));
        assert!(matches!(
            geometry.check_write(SegmentId::new(4), 0, 512),
            Err(StorageError::InvalidSegment(_))
        ));
    }

    #[test]
    fn geometry_checks_read_ranges() {
        let geometry = SegmentGeometry::new(4096, 512, 4);
        assert!(geometry.check_read(Paddr::new(SegmentId::new(0), 4000), 96).is_ok());
        assert!(matches!(
            geometry.check_read(Paddr::new(SegmentId::new(0), 4000), 97),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn geometry_rejects_unaligned_segment_size() {
        let result = SegmentGeometry::new(4000, 512, 4).validate();
        assert!(result.is_err());
    }

    proptest::proptest! {
        #[test]
        fn check_write_accepts_exactly_aligned_ranges_inside_segment(
            offset in 0u32..5000,
            len in 0usize..5000,
        ) {
            let geometry = SegmentGeometry::new(4096, 512, 4);
            let expected = offset % 512 == 0
                && len % 512 == 0
                && u64::from(offset) + len as u64 <= 4096;
            proptest::prop_assert_eq!(
                geometry.check_write(SegmentId::new(0), offset, len).is_ok(),
                expected
            );
        }
    }
}
