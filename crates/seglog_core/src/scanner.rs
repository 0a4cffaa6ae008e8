//! Sequential segment reader used by replay and inspection.

use crate::error::JournalResult;
use crate::format::{group_header_length, RecordGroupHeader, SegmentHeader, SEGMENT_HEADER_LEN};
use crate::types::SegmentNonce;
use bytes::Bytes;
use seglog_storage::{Paddr, SegmentId, SegmentManager};
use std::ops::ControlFlow;
use std::sync::Arc;

/// A record group read back from a segment.
#[derive(Debug, Clone)]
pub struct RecordGroup {
    /// Address of the group header.
    pub start: Paddr,
    /// Decoded header.
    pub header: RecordGroupHeader,
    /// Aligned header length.
    pub header_len: u32,
    /// Metadata followed by data, without padding.
    body: Bytes,
}

/// Where one record of a group lives.
#[derive(Debug, Clone)]
pub struct RecordLayout {
    /// Address of the record's first metadata byte.
    pub position: Paddr,
    /// Address of the record's first data byte.
    pub base: Paddr,
    /// Encoded record metadata.
    pub metadata: Bytes,
    /// Record data.
    pub data: Bytes,
}

impl RecordGroup {
    /// Returns the number of records in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.header.record_sizes.len()
    }

    /// Returns `true` if the group carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.record_sizes.is_empty()
    }

    /// Computes the address, metadata and data of every record.
    ///
    /// Record `i` sits at `start + H + sum(md_j + d_j for j < i)` and its data
    /// at `start + H + M + sum(d_j for j < i)`, where `H` is the aligned
    /// header length and `M` the total metadata length.
    #[must_use]
    pub fn records(&self) -> Vec<RecordLayout> {
        let body_start = self.start.add_offset(self.header_len);
        let mdlength = self.header.mdlength() as usize;

        let mut layouts = Vec::with_capacity(self.len());
        let mut preceding = 0usize;
        let mut md_at = 0usize;
        let mut data_at = mdlength;
        for size in &self.header.record_sizes {
            let md = size.mdlength as usize;
            let d = size.dlength as usize;
            layouts.push(RecordLayout {
                position: body_start.add_offset(preceding as u32),
                base: body_start.add_offset(data_at as u32),
                metadata: self.body.slice(md_at..md_at + md),
                data: self.body.slice(data_at..data_at + d),
            });
            preceding += md + d;
            md_at += md;
            data_at += d;
        }
        layouts
    }
}

/// Why a segment scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    /// Not enough room left in the segment for another group.
    EndOfSegment,
    /// No valid group header at the scan position.
    InvalidHeader,
    /// The group belongs to an earlier use of the segment.
    NonceMismatch,
    /// The group body does not match its checksum.
    BodyChecksum,
    /// The group claims to extend past the segment.
    Overflow,
    /// The visitor asked to stop.
    Visitor,
}

/// Result of scanning one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Number of groups handed to the visitor and accepted.
    pub groups: usize,
    /// Address just past the last accepted group.
    pub end: Paddr,
    /// Why the scan stopped.
    pub stop: ScanStop,
}

/// Reads segment headers and record groups from a device.
pub struct ExtentReader {
    device: Arc<dyn SegmentManager>,
}

impl ExtentReader {
    /// Creates a reader over `device`.
    pub fn new(device: Arc<dyn SegmentManager>) -> Self {
        Self { device }
    }

    /// Returns the underlying device.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn SegmentManager> {
        &self.device
    }

    /// Reads the header at the start of segment `id`.
    ///
    /// Returns `None` if the segment holds no valid header.
    ///
    /// # Errors
    ///
    /// Returns an error if the device read fails.
    pub async fn read_segment_header(&self, id: SegmentId) -> JournalResult<Option<SegmentHeader>> {
        let raw = self
            .device
            .read(Paddr::new(id, 0), SEGMENT_HEADER_LEN)
            .await?;
        Ok(SegmentHeader::decode(&raw))
    }

    /// Reads the header of every segment on the device.
    ///
    /// Segments without a valid header are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a device read fails.
    pub async fn scan_segment_headers(&self) -> JournalResult<Vec<(SegmentId, SegmentHeader)>> {
        let mut headers = Vec::new();
        for raw_id in 0..self.device.num_segments() {
            let id = SegmentId::new(raw_id);
            if let Some(header) = self.read_segment_header(id).await? {
                headers.push((id, header));
            }
        }
        tracing::debug!(found = headers.len(), "scanned segment headers");
        Ok(headers)
    }

    /// Walks the record groups of a segment starting at `start`.
    ///
    /// Each group whose header, nonce and body checksum are valid is handed
    /// to `visitor`. The scan stops quietly at the first group that fails
    /// validation, since that marks the end of what was written.
    ///
    /// # Errors
    ///
    /// Returns an error if a device read fails or the visitor fails.
    pub async fn scan_valid_records<F>(
        &self,
        start: Paddr,
        nonce: SegmentNonce,
        mut visitor: F,
    ) -> JournalResult<ScanOutcome>
    where
        F: FnMut(&RecordGroup) -> JournalResult<ControlFlow<()>>,
    {
        let geometry = self.device.geometry();
        let block = geometry.block_size;
        let segment_size = u64::from(geometry.segment_size);
        let segment = start.segment;

        let mut offset = u64::from(start.offset);
        let mut groups = 0;
        let stop = loop {
            if offset + u64::from(block) > segment_size {
                break ScanStop::EndOfSegment;
            }
            let at = Paddr::new(segment, offset as u32);
            let first = self.device.read(at, block as usize).await?;
            let Some(count) = RecordGroupHeader::peek_record_count(&first) else {
                break ScanStop::InvalidHeader;
            };

            let header_len = group_header_length(count, block);
            if offset + header_len > segment_size {
                break ScanStop::Overflow;
            }
            let raw_header = if header_len > u64::from(block) {
                self.device.read(at, header_len as usize).await?
            } else {
                first
            };
            let Some(header) = RecordGroupHeader::decode(&raw_header) else {
                break ScanStop::InvalidHeader;
            };
            if header.segment_nonce != nonce {
                break ScanStop::NonceMismatch;
            }

            let body_len = header.body_length(block);
            if offset + header_len + body_len > segment_size {
                break ScanStop::Overflow;
            }
            let used = (header.mdlength() + header.dlength()) as usize;
            let body = self
                .device
                .read(at.add_offset(header_len as u32), body_len as usize)
                .await?;
            if crc32fast::hash(&body[..used]) != header.body_crc {
                break ScanStop::BodyChecksum;
            }

            let group = RecordGroup {
                start: at,
                header,
                header_len: header_len as u32,
                body: body.slice(..used),
            };
            if visitor(&group)?.is_break() {
                break ScanStop::Visitor;
            }
            groups += 1;
            offset += header_len + body_len;
        };

        let outcome = ScanOutcome {
            groups,
            end: Paddr::new(segment, offset as u32),
            stop,
        };
        tracing::debug!(segment = %segment, groups, stop = ?stop, "segment scan finished");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::encode_record_group;
    use crate::record::{Delta, DeltaKind, Record};
    use crate::types::SegmentSeq;
    use seglog_storage::{InMemorySegmentManager, SegmentGeometry};

    const NONCE: SegmentNonce = SegmentNonce::new(77);

    fn record(fill: u8) -> Record {
        Record::new()
            .with_delta(Delta::new(DeltaKind::Update, u64::from(fill), vec![fill; 8]))
            .with_extent(vec![fill; 100])
    }

    async fn device_with_groups(groups: &[Vec<Record>]) -> Arc<InMemorySegmentManager> {
        let device = Arc::new(InMemorySegmentManager::new(SegmentGeometry::new(8192, 512, 2)).unwrap());
        let segment = device.open(SegmentId::new(0)).await.unwrap();
        let header = SegmentHeader {
            segment_seq: SegmentSeq::new(1),
            physical_segment_id: SegmentId::new(0),
            journal_tail: None,
            segment_nonce: NONCE,
        };
        segment.write(0, header.encode(512)).await.unwrap();

        let mut offset = 512;
        for records in groups {
            let raw = encode_record_group(records, None, NONCE, 512);
            let len = raw.len() as u32;
            segment.write(offset, raw).await.unwrap();
            offset += len;
        }
        device
    }

    #[tokio::test]
    async fn reads_segment_headers() {
        let device = device_with_groups(&[]).await;
        let reader = ExtentReader::new(device);

        let headers = reader.scan_segment_headers().await.unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, SegmentId::new(0));
        assert_eq!(headers[0].1.segment_nonce, NONCE);
        assert!(reader.read_segment_header(SegmentId::new(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn visits_every_group() {
        let device = device_with_groups(&[vec![record(1)], vec![record(2), record(3)]]).await;
        let reader = ExtentReader::new(device);

        let mut seen = Vec::new();
        let outcome = reader
            .scan_valid_records(Paddr::new(SegmentId::new(0), 512), NONCE, |group| {
                seen.push(group.len());
                Ok(ControlFlow::Continue(()))
            })
            .await
            .unwrap();

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(outcome.groups, 2);
        assert_eq!(outcome.stop, ScanStop::InvalidHeader);
        assert_eq!(outcome.end, Paddr::new(SegmentId::new(0), 512 + 1024 + 1024));
    }

    #[tokio::test]
    async fn record_layout_positions() {
        let device = device_with_groups(&[vec![record(1), record(2)]]).await;
        let reader = ExtentReader::new(device);
        let size = record(1).size();

        let mut layouts = Vec::new();
        reader
            .scan_valid_records(Paddr::new(SegmentId::new(0), 512), NONCE, |group| {
                layouts = group.records();
                Ok(ControlFlow::Continue(()))
            })
            .await
            .unwrap();

        let body = 1024;
        assert_eq!(layouts[0].position.offset, body);
        assert_eq!(layouts[1].position.offset, body + size.total() as u32);
        assert_eq!(layouts[0].base.offset, body + 2 * size.mdlength as u32);
        assert_eq!(layouts[1].base.offset, body + 2 * size.mdlength as u32 + 100);
        assert_eq!(&layouts[1].data[..], &[2u8; 100][..]);
    }

    #[tokio::test]
    async fn stops_at_wrong_nonce() {
        let device = device_with_groups(&[vec![record(1)]]).await;
        let reader = ExtentReader::new(device);

        let outcome = reader
            .scan_valid_records(
                Paddr::new(SegmentId::new(0), 512),
                SegmentNonce::new(1),
                |_| Ok(ControlFlow::Continue(())),
            )
            .await
            .unwrap();
        assert_eq!(outcome.groups, 0);
        assert_eq!(outcome.stop, ScanStop::NonceMismatch);
    }

    #[tokio::test]
    async fn stops_at_corrupted_body() {
        let device = device_with_groups(&[vec![record(1)], vec![record(2)]]).await;
        // Flip a byte inside the second group's body.
        device
            .corrupt_range(Paddr::new(SegmentId::new(0), 1536 + 512 + 20), 1)
            .unwrap();
        let reader = ExtentReader::new(device);

        let outcome = reader
            .scan_valid_records(Paddr::new(SegmentId::new(0), 512), NONCE, |_| {
                Ok(ControlFlow::Continue(()))
            })
            .await
            .unwrap();
        assert_eq!(outcome.groups, 1);
        assert_eq!(outcome.stop, ScanStop::BodyChecksum);
    }

    #[tokio::test]
    async fn visitor_can_stop_scan() {
        let device = device_with_groups(&[vec![record(1)], vec![record(2)]]).await;
        let reader = ExtentReader::new(device);

        let outcome = reader
            .scan_valid_records(Paddr::new(SegmentId::new(0), 512), NONCE, |_| {
                Ok(ControlFlow::Break(()))
            })
            .await
            .unwrap();
        assert_eq!(outcome.groups, 0);
        assert_eq!(outcome.stop, ScanStop::Visitor);
        assert_eq!(outcome.end.offset, 512);
    }

    #[tokio::test]
    async fn read_failure_is_an_error() {
        let device = device_with_groups(&[vec![record(1)]]).await;
        device.fail_reads(true);
        let reader = ExtentReader::new(device);

        let result = reader
            .scan_valid_records(Paddr::new(SegmentId::new(0), 512), NONCE, |_| {
                Ok(ControlFlow::Continue(()))
            })
            .await;
        assert!(result.is_err());
    }
}
