//! Journal records and their metadata encoding.
//!
//! A record is a list of deltas plus a list of data extents. Its metadata
//! (the deltas and the extent lengths) and its data are laid out in separate
//! regions of a record group, so the metadata of a whole group can be read
//! without touching the data.
//!
//! ## Metadata Format
//!
//! ```text
//! | delta_count (4) | extent_count (4) | extent_len (4) * N |
//! | kind (1) | target (8) | len (4) | payload (len) |  * delta_count
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Kind of change a delta describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeltaKind {
    /// Modify an existing extent in place.
    Update = 1,
    /// Allocate a new extent.
    Alloc = 2,
    /// Retire an extent.
    Retire = 3,
    /// Replace the root block.
    Root = 4,
}

impl DeltaKind {
    /// Converts a byte to a delta kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Update),
            2 => Some(Self::Alloc),
            3 => Some(Self::Retire),
            4 => Some(Self::Root),
            _ => None,
        }
    }

    /// Converts the delta kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A single logged change.
///
/// The journal does not interpret deltas; it stores them and hands them back
/// during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// What the delta does.
    pub kind: DeltaKind,
    /// Logical address the delta applies to.
    pub target: u64,
    /// Opaque delta body.
    pub payload: Bytes,
}

/// Fixed bytes per delta: kind (1) + target (8) + payload length (4).
const DELTA_FIXED_LEN: u64 = 13;

/// Fixed bytes per metadata block: delta count (4) + extent count (4).
const METADATA_FIXED_LEN: u64 = 8;

impl Delta {
    /// Creates a delta.
    pub fn new(kind: DeltaKind, target: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            target,
            payload: payload.into(),
        }
    }

    fn encoded_len(&self) -> u64 {
        DELTA_FIXED_LEN + self.payload.len() as u64
    }
}

/// A record submitted to the journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Deltas carried in the record metadata.
    pub deltas: Vec<Delta>,
    /// Data extents, stored back to back in the record data region.
    pub extents: Vec<Bytes>,
}

/// Precomputed lengths of a record's two regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordSize {
    /// Encoded metadata length in bytes.
    pub mdlength: u64,
    /// Data length in bytes.
    pub dlength: u64,
}

impl RecordSize {
    /// Creates a record size descriptor.
    #[must_use]
    pub const fn new(mdlength: u64, dlength: u64) -> Self {
        Self { mdlength, dlength }
    }

    /// Returns metadata plus data length.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.mdlength + self.dlength
    }
}

impl Record {
    /// Creates an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a delta.
    #[must_use]
    pub fn with_delta(mut self, delta: Delta) -> Self {
        self.deltas.push(delta);
        self
    }

    /// Adds a data extent.
    #[must_use]
    pub fn with_extent(mut self, data: impl Into<Bytes>) -> Self {
        self.extents.push(data.into());
        self
    }

    /// Computes the metadata and data lengths of this record.
    #[must_use]
    pub fn size(&self) -> RecordSize {
        let mdlength = METADATA_FIXED_LEN
            + 4 * self.extents.len() as u64
            + self.deltas.iter().map(Delta::encoded_len).sum::<u64>();
        let dlength = self.extents.iter().map(|e| e.len() as u64).sum();
        RecordSize { mdlength, dlength }
    }

    /// Appends the encoded metadata to `buf`.
    pub fn encode_metadata(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.deltas.len() as u32);
        buf.put_u32_le(self.extents.len() as u32);
        for extent in &self.extents {
            buf.put_u32_le(extent.len() as u32);
        }
        for delta in &self.deltas {
            buf.put_u8(delta.kind.as_byte());
            buf.put_u64_le(delta.target);
            buf.put_u32_le(delta.payload.len() as u32);
            buf.put_slice(&delta.payload);
        }
    }

    /// Appends the record data to `buf`.
    pub fn encode_data(&self, buf: &mut BytesMut) {
        for extent in &self.extents {
            buf.put_slice(extent);
        }
    }
}

/// Metadata decoded from a persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Deltas in the order they were submitted.
    pub deltas: Vec<Delta>,
    /// Length of each data extent.
    pub extent_lengths: Vec<u32>,
}

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.raw.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
    }
}

/// Decodes record metadata.
///
/// Returns `None` if the bytes are truncated, carry an unknown delta kind,
/// or have trailing bytes.
#[must_use]
pub fn decode_metadata(raw: &[u8]) -> Option<RecordMetadata> {
    let mut cursor = Cursor { raw, pos: 0 };
    let delta_count = cursor.u32()? as usize;
    let extent_count = cursor.u32()? as usize;

    // Every extent length takes 4 bytes and every delta at least 13.
    let min_len = (extent_count as u64) * 4 + (delta_count as u64) * DELTA_FIXED_LEN;
    if min_len > raw.len() as u64 {
        return None;
    }

    let mut extent_lengths = Vec::with_capacity(extent_count);
    for _ in 0..extent_count {
        extent_lengths.push(cursor.u32()?);
    }

    let mut deltas = Vec::with_capacity(delta_count);
    for _ in 0..delta_count {
        let kind = DeltaKind::from_byte(cursor.u8()?)?;
        let target = cursor.u64()?;
        let len = cursor.u32()? as usize;
        let payload = Bytes::copy_from_slice(cursor.take(len)?);
        deltas.push(Delta {
            kind,
            target,
            payload,
        });
    }

    if cursor.pos != raw.len() {
        return None;
    }
    Some(RecordMetadata {
        deltas,
        extent_lengths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Record {
        Record::new()
            .with_delta(Delta::new(DeltaKind::Update, 0x1000, vec![1, 2, 3]))
            .with_delta(Delta::new(DeltaKind::Alloc, 0x2000, Vec::new()))
            .with_extent(vec![0xAA; 100])
            .with_extent(vec![0xBB; 28])
    }

    #[test]
    fn delta_kind_from_byte() {
        for kind in [
            DeltaKind::Update,
            DeltaKind::Alloc,
            DeltaKind::Retire,
            DeltaKind::Root,
        ] {
            assert_eq!(DeltaKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(DeltaKind::from_byte(0), None);
        assert_eq!(DeltaKind::from_byte(200), None);
    }

    #[test]
    fn size_matches_encoding() {
        let record = sample();
        let size = record.size();

        let mut md = BytesMut::new();
        record.encode_metadata(&mut md);
        let mut data = BytesMut::new();
        record.encode_data(&mut data);

        assert_eq!(size.mdlength, md.len() as u64);
        assert_eq!(size.dlength, 128);
        assert_eq!(data.len(), 128);
        // 8 fixed + 2 extent lengths + (13 + 3) + 13
        assert_eq!(size.mdlength, 8 + 8 + 16 + 13);
    }

    #[test]
    fn decode_recovers_deltas() {
        let record = sample();
        let mut md = BytesMut::new();
        record.encode_metadata(&mut md);

        let decoded = decode_metadata(&md).unwrap();
        assert_eq!(decoded.deltas, record.deltas);
        assert_eq!(decoded.extent_lengths, vec![100, 28]);
    }

    #[test]
    fn empty_record_metadata() {
        let record = Record::new();
        assert_eq!(record.size(), RecordSize::new(8, 0));
        let mut md = BytesMut::new();
        record.encode_metadata(&mut md);
        let decoded = decode_metadata(&md).unwrap();
        assert!(decoded.deltas.is_empty());
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let mut md = BytesMut::new();
        Record::new()
            .with_delta(Delta::new(DeltaKind::Root, 1, vec![9]))
            .encode_metadata(&mut md);
        md[8] = 0x7F;
        assert!(decode_metadata(&md).is_none());
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut md = BytesMut::new();
        sample().encode_metadata(&mut md);
        md.put_u8(0);
        assert!(decode_metadata(&md).is_none());
    }

    #[test]
    fn decode_rejects_huge_counts() {
        let mut md = BytesMut::new();
        md.put_u32_le(u32::MAX);
        md.put_u32_le(u32::MAX);
        assert!(decode_metadata(&md).is_none());
    }

    proptest! {
        #[test]
        fn truncated_metadata_never_decodes(cut in 0usize..45) {
            let mut md = BytesMut::new();
            sample().encode_metadata(&mut md);
            prop_assume!(cut < md.len());
            prop_assert!(decode_metadata(&md[..cut]).is_none());
        }

        #[test]
        fn arbitrary_bytes_never_panic(raw in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = decode_metadata(&raw);
        }
    }
}
