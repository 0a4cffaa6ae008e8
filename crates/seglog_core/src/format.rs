//! On-disk formats for segment headers and record groups.
//!
//! All integers are little endian. Every structure is padded with zeroes to
//! the device block size.
//!
//! ## Segment Header
//!
//! Written at offset 0 of every journal segment.
//!
//! ```text
//! | magic "SGJH" (4) | segment_seq (8) | segment_id (4) |
//! | journal_tail (16) | nonce (4) | crc32 (4) |
//! ```
//!
//! ## Record Group
//!
//! One physical write carrying one or more records.
//!
//! ```text
//! | magic "SGJR" (4) | record_count (4) | mdlength (4) | dlength (4) |
//! | committed_to (16) | nonce (4) | body_crc (4) |
//! | (mdlength (4), dlength (4)) * record_count | header_crc (4) |
//! | padding | metadata of every record | data of every record | padding |
//! ```
//!
//! A journal position (`journal_tail`, `committed_to`) is encoded as
//! `segment_seq (8) | segment_id (4) | offset (4)`; all-ones means none.

use crate::record::{Record, RecordSize};
use crate::types::{JournalSeq, SegmentNonce, SegmentSeq};
use bytes::{BufMut, Bytes, BytesMut};
use seglog_storage::{Paddr, SegmentId};

/// Magic bytes identifying a segment header.
pub const SEGMENT_HEADER_MAGIC: [u8; 4] = *b"SGJH";

/// Magic bytes identifying a record group header.
pub const RECORD_GROUP_MAGIC: [u8; 4] = *b"SGJR";

/// Unpadded length of a segment header.
pub const SEGMENT_HEADER_LEN: usize = 40;

/// Fixed part of a record group header, before the per-record sizes.
const GROUP_FIXED_LEN: usize = 40;

const JOURNAL_SEQ_LEN: usize = 16;

/// Rounds `value` up to a multiple of `block`.
#[must_use]
pub const fn align_up(value: u64, block: u64) -> u64 {
    value.div_ceil(block) * block
}

/// Returns the block-aligned length of a segment header.
#[must_use]
pub const fn segment_header_length(block_size: u32) -> u32 {
    align_up(SEGMENT_HEADER_LEN as u64, block_size as u64) as u32
}

/// Returns the unpadded length of a record group header for `count` records.
#[must_use]
pub const fn group_header_raw_length(count: usize) -> usize {
    GROUP_FIXED_LEN + 8 * count + 4
}

/// Returns the block-aligned length of a record group header.
#[must_use]
pub const fn group_header_length(count: usize, block_size: u32) -> u64 {
    align_up(group_header_raw_length(count) as u64, block_size as u64)
}

/// Returns the total length of the write carrying `sizes`.
///
/// This is the aligned header plus the aligned body.
#[must_use]
pub fn encoded_write_length(sizes: &[RecordSize], block_size: u32) -> u64 {
    let body: u64 = sizes.iter().map(RecordSize::total).sum();
    group_header_length(sizes.len(), block_size) + align_up(body, u64::from(block_size))
}

fn put_journal_seq(buf: &mut BytesMut, seq: Option<JournalSeq>) {
    match seq {
        Some(seq) => {
            buf.put_u64_le(seq.segment_seq.as_u64());
            buf.put_u32_le(seq.offset.segment.as_u32());
            buf.put_u32_le(seq.offset.offset);
        }
        None => buf.put_bytes(0xFF, JOURNAL_SEQ_LEN),
    }
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn read_u64(raw: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_journal_seq(raw: &[u8], at: usize) -> Option<JournalSeq> {
    let encoded = &raw[at..at + JOURNAL_SEQ_LEN];
    if encoded.iter().all(|b| *b == 0xFF) {
        return None;
    }
    Some(JournalSeq::new(
        SegmentSeq::new(read_u64(raw, at)),
        Paddr::new(
            SegmentId::new(read_u32(raw, at + 8)),
            read_u32(raw, at + 12),
        ),
    ))
}

/// Header written at the start of every journal segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Journal sequence of the segment.
    pub segment_seq: SegmentSeq,
    /// Physical segment the header was written to.
    pub physical_segment_id: SegmentId,
    /// Oldest journal position still needed for replay when the segment
    /// was rolled in.
    pub journal_tail: Option<JournalSeq>,
    /// Nonce every record group in the segment must carry.
    pub segment_nonce: SegmentNonce,
}

impl SegmentHeader {
    /// Encodes the header padded to `block_size`.
    #[must_use]
    pub fn encode(&self, block_size: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(segment_header_length(block_size) as usize);
        buf.put_slice(&SEGMENT_HEADER_MAGIC);
        buf.put_u64_le(self.segment_seq.as_u64());
        buf.put_u32_le(self.physical_segment_id.as_u32());
        put_journal_seq(&mut buf, self.journal_tail);
        buf.put_u32_le(self.segment_nonce.as_u32());
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf.resize(segment_header_length(block_size) as usize, 0);
        buf.freeze()
    }

    /// Decodes a header.
    ///
    /// Returns `None` if the bytes do not hold a valid header; a segment
    /// without one has never been part of the journal.
    #[must_use]
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < SEGMENT_HEADER_LEN || raw[0..4] != SEGMENT_HEADER_MAGIC {
            return None;
        }
        let crc_at = SEGMENT_HEADER_LEN - 4;
        if crc32fast::hash(&raw[..crc_at]) != read_u32(raw, crc_at) {
            return None;
        }
        Some(Self {
            segment_seq: SegmentSeq::new(read_u64(raw, 4)),
            physical_segment_id: SegmentId::new(read_u32(raw, 12)),
            journal_tail: read_journal_seq(raw, 16),
            segment_nonce: SegmentNonce::new(read_u32(raw, 32)),
        })
    }
}

/// Header of a record group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordGroupHeader {
    /// Sizes of the records in the group, in order.
    pub record_sizes: Vec<RecordSize>,
    /// Commit watermark at the time the group was encoded.
    pub committed_to: Option<JournalSeq>,
    /// Nonce of the segment the group was written to.
    pub segment_nonce: SegmentNonce,
    /// CRC of the unpadded metadata and data regions.
    pub body_crc: u32,
}

impl RecordGroupHeader {
    /// Total metadata length of the group.
    #[must_use]
    pub fn mdlength(&self) -> u64 {
        self.record_sizes.iter().map(|s| s.mdlength).sum()
    }

    /// Total data length of the group.
    #[must_use]
    pub fn dlength(&self) -> u64 {
        self.record_sizes.iter().map(|s| s.dlength).sum()
    }

    /// Aligned header length.
    #[must_use]
    pub fn header_length(&self, block_size: u32) -> u64 {
        group_header_length(self.record_sizes.len(), block_size)
    }

    /// Aligned body length.
    #[must_use]
    pub fn body_length(&self, block_size: u32) -> u64 {
        align_up(self.mdlength() + self.dlength(), u64::from(block_size))
    }

    fn encode_into(&self, buf: &mut BytesMut, block_size: u32) {
        let start = buf.len();
        buf.put_slice(&RECORD_GROUP_MAGIC);
        buf.put_u32_le(self.record_sizes.len() as u32);
        buf.put_u32_le(self.mdlength() as u32);
        buf.put_u32_le(self.dlength() as u32);
        put_journal_seq(buf, self.committed_to);
        buf.put_u32_le(self.segment_nonce.as_u32());
        buf.put_u32_le(self.body_crc);
        for size in &self.record_sizes {
            buf.put_u32_le(size.mdlength as u32);
            buf.put_u32_le(size.dlength as u32);
        }
        let crc = crc32fast::hash(&buf[start..]);
        buf.put_u32_le(crc);
        buf.resize(start + self.header_length(block_size) as usize, 0);
    }

    /// Returns the record count stored in a raw header, if the magic matches.
    ///
    /// Used to learn how many bytes the full header occupies.
    #[must_use]
    pub fn peek_record_count(raw: &[u8]) -> Option<usize> {
        if raw.len() < GROUP_FIXED_LEN || raw[0..4] != RECORD_GROUP_MAGIC {
            return None;
        }
        Some(read_u32(raw, 4) as usize)
    }

    /// Decodes a header.
    ///
    /// Returns `None` on a bad magic, a truncated header, inconsistent
    /// lengths or a checksum mismatch.
    #[must_use]
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let count = Self::peek_record_count(raw)?;
        let raw_len = GROUP_FIXED_LEN.checked_add(count.checked_mul(8)?)?.checked_add(4)?;
        if raw.len() < raw_len {
            return None;
        }
        let crc_at = raw_len - 4;
        if crc32fast::hash(&raw[..crc_at]) != read_u32(raw, crc_at) {
            return None;
        }

        let record_sizes: Vec<RecordSize> = (0..count)
            .map(|i| {
                let at = GROUP_FIXED_LEN + 8 * i;
                RecordSize::new(
                    u64::from(read_u32(raw, at)),
                    u64::from(read_u32(raw, at + 4)),
                )
            })
            .collect();

        let header = Self {
            record_sizes,
            committed_to: read_journal_seq(raw, 16),
            segment_nonce: SegmentNonce::new(read_u32(raw, 32)),
            body_crc: read_u32(raw, 36),
        };
        if header.mdlength() != u64::from(read_u32(raw, 8))
            || header.dlength() != u64::from(read_u32(raw, 12))
        {
            return None;
        }
        Some(header)
    }
}

/// Encodes `records` as one record group.
///
/// The result is block aligned: the header padded to a block boundary, then
/// all metadata followed by all data, padded to a block boundary.
#[must_use]
pub fn encode_record_group(
    records: &[Record],
    committed_to: Option<JournalSeq>,
    segment_nonce: SegmentNonce,
    block_size: u32,
) -> Bytes {
    let record_sizes: Vec<RecordSize> = records.iter().map(Record::size).collect();
    let total = encoded_write_length(&record_sizes, block_size) as usize;

    let mut body = BytesMut::new();
    for record in records {
        record.encode_metadata(&mut body);
    }
    for record in records {
        record.encode_data(&mut body);
    }

    let header = RecordGroupHeader {
        record_sizes,
        committed_to,
        segment_nonce,
        body_crc: crc32fast::hash(&body),
    };

    let mut buf = BytesMut::with_capacity(total);
    header.encode_into(&mut buf, block_size);
    buf.put_slice(&body);
    buf.resize(total, 0);
    buf.freeze()
}
