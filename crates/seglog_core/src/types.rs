//! Core type definitions for the journal.

use seglog_storage::Paddr;
use std::fmt;

/// Sequence number of a journal segment.
///
/// Every segment rolled into the journal gets the next sequence number, so
/// sequence order is journal order even when physical segments are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentSeq(pub u64);

impl SegmentSeq {
    /// Creates a new segment sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SegmentSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sseq:{}", self.0)
    }
}

/// Random value stamped into a segment header and every record group
/// written to that segment.
///
/// Record groups whose nonce differs from their segment's header are left
/// over from an earlier use of the physical segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentNonce(pub u32);

impl SegmentNonce {
    /// Creates a nonce from a raw value.
    #[must_use]
    pub const fn new(nonce: u32) -> Self {
        Self(nonce)
    }

    /// Draws a fresh random nonce.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Returns the raw nonce value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SegmentNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A position in the journal.
///
/// Positions order first by segment sequence and then by address, so they
/// increase across rolls even when a lower-numbered physical segment is
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JournalSeq {
    /// Sequence of the segment holding the position.
    pub segment_seq: SegmentSeq,
    /// Physical address within that segment.
    pub offset: Paddr,
}

impl JournalSeq {
    /// Creates a journal position.
    #[must_use]
    pub const fn new(segment_seq: SegmentSeq, offset: Paddr) -> Self {
        Self {
            segment_seq,
            offset,
        }
    }

    /// Returns the position `delta` bytes further into the same segment.
    #[must_use]
    pub const fn add_offset(self, delta: u32) -> Self {
        Self {
            segment_seq: self.segment_seq,
            offset: self.offset.add_offset(delta),
        }
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment_seq, self.offset)
    }
}
