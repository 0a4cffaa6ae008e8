//! Record batching.
//!
//! A [`RecordBatch`] collects records that will share one physical write.
//! Every contributor subscribes to the batch's completion when it is added
//! and learns its own position from the position of the whole write.

use crate::error::{JournalError, JournalResult};
use crate::format::{align_up, encode_record_group, group_header_length};
use crate::journal::WriteResult;
use crate::record::{Record, RecordSize};
use crate::types::{JournalSeq, SegmentNonce};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Where a flushed batch landed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchWritten {
    /// Position of the record group header.
    pub(crate) start: JournalSeq,
    /// Aligned header length.
    pub(crate) header_len: u32,
    /// Total metadata length of the group.
    pub(crate) metadata_len: u32,
}

impl BatchWritten {
    /// Addresses of the record whose metadata starts `preceding` bytes into
    /// the body and whose data starts `preceding_data` bytes into the data
    /// region.
    pub(crate) fn resolve(&self, preceding: u64, preceding_data: u64) -> WriteResult {
        let body = self.header_len + preceding as u32;
        let base = self.header_len + self.metadata_len + preceding_data as u32;
        WriteResult {
            addr: self.start.offset.add_offset(base),
            position: self.start.add_offset(body),
        }
    }
}

pub(crate) type BatchOutcome = Result<BatchWritten, Arc<JournalError>>;

/// Lifecycle of a batch slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchState {
    /// No records.
    Empty,
    /// Collecting records.
    Pending,
    /// Encoded and being written; must not change.
    Submitting,
}

/// A record waiting for the write of its batch.
#[derive(Debug)]
pub(crate) struct PendingRecord {
    rx: broadcast::Receiver<BatchOutcome>,
    /// Metadata and data bytes of the records before this one.
    preceding: u64,
    /// Data bytes of the records before this one.
    preceding_data: u64,
}

impl PendingRecord {
    /// Waits for the batch write and resolves this record's addresses.
    pub(crate) async fn wait(mut self) -> JournalResult<WriteResult> {
        match self.rx.recv().await {
            Ok(Ok(written)) => Ok(written.resolve(self.preceding, self.preceding_data)),
            Ok(Err(e)) => Err(JournalError::BatchFailed(e)),
            Err(_) => Err(JournalError::WriteAbandoned),
        }
    }
}

/// Records merged into one write.
#[derive(Debug)]
pub(crate) struct RecordBatch {
    state: BatchState,
    capacity: usize,
    flush_size: u64,
    records: Vec<Record>,
    sizes: Vec<RecordSize>,
    /// Unpadded metadata plus data length of all records.
    body_length: u64,
    tx: Option<broadcast::Sender<BatchOutcome>>,
    /// Header and metadata lengths of the encoded group.
    encoded: Option<(u32, u32)>,
}

impl RecordBatch {
    pub(crate) fn new(capacity: usize, flush_size: u64) -> Self {
        Self {
            state: BatchState::Empty,
            capacity,
            flush_size,
            records: Vec::with_capacity(capacity),
            sizes: Vec::with_capacity(capacity),
            body_length: 0,
            tx: None,
            encoded: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> BatchState {
        self.state
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state == BatchState::Empty
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state == BatchState::Pending
    }

    pub(crate) fn num_records(&self) -> usize {
        self.records.len()
    }

    fn write_length_with(&self, count: usize, body: u64, block_size: u32) -> u64 {
        group_header_length(count, block_size) + align_up(body, u64::from(block_size))
    }

    /// Current encoded write length.
    pub(crate) fn encoded_length(&self, block_size: u32) -> u64 {
        if self.sizes.is_empty() {
            return 0;
        }
        self.write_length_with(self.sizes.len(), self.body_length, block_size)
    }

    /// Returns the write length if a record of `size` were added, or zero if
    /// the batch cannot take it.
    ///
    /// A batch refuses records while submitting, once it holds `capacity`
    /// records, or when a non-empty batch would grow past the flush size.
    pub(crate) fn can_batch(&self, size: RecordSize, block_size: u32) -> u64 {
        if self.state == BatchState::Submitting || self.records.len() >= self.capacity {
            return 0;
        }
        let length =
            self.write_length_with(self.sizes.len() + 1, self.body_length + size.total(), block_size);
        if !self.records.is_empty() && length > self.flush_size {
            return 0;
        }
        length
    }

    /// Returns `true` once the batch takes no more records: it is at
    /// capacity or its write has reached the flush size.
    pub(crate) fn is_full(&self, block_size: u32) -> bool {
        self.records.len() >= self.capacity
            || (!self.records.is_empty() && self.encoded_length(block_size) >= self.flush_size)
    }

    /// Appends a record and subscribes to the batch completion.
    pub(crate) fn add_pending(
        &mut self,
        record: Record,
        size: RecordSize,
    ) -> JournalResult<PendingRecord> {
        if self.state == BatchState::Submitting {
            return Err(JournalError::invalid_transition(
                "cannot add records to a submitting batch",
            ));
        }
        let tx = self
            .tx
            .get_or_insert_with(|| broadcast::channel(1).0);
        let pending = PendingRecord {
            rx: tx.subscribe(),
            preceding: self.body_length,
            preceding_data: self.sizes.iter().map(|s| s.dlength).sum(),
        };

        self.records.push(record);
        self.sizes.push(size);
        self.body_length += size.total();
        self.state = BatchState::Pending;
        Ok(pending)
    }

    /// Encodes the pending records into one block-aligned buffer.
    pub(crate) fn encode_records(
        &mut self,
        block_size: u32,
        committed_to: Option<JournalSeq>,
        nonce: SegmentNonce,
    ) -> JournalResult<Bytes> {
        if self.state != BatchState::Pending {
            return Err(JournalError::invalid_transition(format!(
                "cannot encode a batch in state {:?}",
                self.state
            )));
        }
        let header_len = group_header_length(self.records.len(), block_size) as u32;
        let metadata_len = self.sizes.iter().map(|s| s.mdlength).sum::<u64>() as u32;
        let records = std::mem::take(&mut self.records);
        let encoded = encode_record_group(&records, committed_to, nonce, block_size);

        self.encoded = Some((header_len, metadata_len));
        self.state = BatchState::Submitting;
        Ok(encoded)
    }

    /// Delivers the write outcome to every contributor and empties the
    /// batch.
    ///
    /// Returns the number of records that shared the write.
    pub(crate) fn set_result(
        &mut self,
        result: Result<JournalSeq, Arc<JournalError>>,
    ) -> JournalResult<usize> {
        if self.state != BatchState::Submitting {
            return Err(JournalError::invalid_transition(format!(
                "cannot complete a batch in state {:?}",
                self.state
            )));
        }
        let (header_len, metadata_len) = self.encoded.take().unwrap_or_default();
        let outcome = result.map(|start| BatchWritten {
            start,
            header_len,
            metadata_len,
        });
        let count = self.sizes.len();
        if let Some(tx) = self.tx.take() {
            // Contributors that gave up waiting are not an error.
            let _ = tx.send(outcome);
        }

        self.records.clear();
        self.sizes.clear();
        self.body_length = 0;
        self.state = BatchState::Empty;
        Ok(count)
    }

    /// Fails every pending record with `error` and empties the batch.
    ///
    /// Valid in any state.
    pub(crate) fn fail(&mut self, error: Arc<JournalError>) -> usize {
        let count = self.sizes.len();
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
        self.records.clear();
        self.sizes.clear();
        self.body_length = 0;
        self.encoded = None;
        self.state = BatchState::Empty;
        count
    }

    /// Encodes a single record on its own, bypassing the batch.
    ///
    /// Only valid while the batch is empty.
    pub(crate) fn submit_pending_fast(
        &self,
        record: &Record,
        block_size: u32,
        committed_to: Option<JournalSeq>,
        nonce: SegmentNonce,
    ) -> JournalResult<Bytes> {
        if self.state != BatchState::Empty {
            return Err(JournalError::invalid_transition(
                "fast path requires an empty batch",
            ));
        }
        Ok(encode_record_group(
            std::slice::from_ref(record),
            committed_to,
            nonce,
            block_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RecordGroupHeader;
    use crate::types::SegmentSeq;
    use seglog_storage::{Paddr, SegmentId};

    const BLOCK: u32 = 512;

    /// A record whose metadata plus data is exactly 256 bytes.
    fn record_256() -> Record {
        let record = Record::new().with_extent(vec![7u8; 244]);
        assert_eq!(record.size().total(), 256);
        record
    }

    fn start() -> JournalSeq {
        JournalSeq::new(SegmentSeq::new(1), Paddr::new(SegmentId::new(0), 1536))
    }

    #[test]
    fn can_batch_reports_write_length() {
        let batch = RecordBatch::new(4, 2048);
        assert_eq!(batch.can_batch(record_256().size(), BLOCK), 1024);
    }

    #[test]
    fn can_batch_honours_capacity() {
        let mut batch = RecordBatch::new(2, 1 << 20);
        for _ in 0..2 {
            let r = record_256();
            let size = r.size();
            batch.add_pending(r, size).unwrap();
        }
        assert_eq!(batch.can_batch(record_256().size(), BLOCK), 0);
    }

    #[test]
    fn can_batch_honours_flush_size() {
        let mut batch = RecordBatch::new(16, 1024);
        let r = record_256();
        let size = r.size();
        batch.add_pending(r, size).unwrap();
        // Two records still fit in 512 + 512.
        assert_eq!(batch.can_batch(size, BLOCK), 1024);

        let big = RecordSize::new(8, 1000);
        assert_eq!(batch.can_batch(big, BLOCK), 0);
    }

    #[test]
    fn full_at_capacity_or_flush_size() {
        let mut batch = RecordBatch::new(2, 1 << 20);
        assert!(!batch.is_full(BLOCK));
        let r = record_256();
        let size = r.size();
        batch.add_pending(r, size).unwrap();
        assert!(!batch.is_full(BLOCK));
        batch.add_pending(record_256(), size).unwrap();
        assert!(batch.is_full(BLOCK));

        // 512 byte header plus one padded body block.
        let mut batch = RecordBatch::new(16, 1024);
        batch.add_pending(record_256(), size).unwrap();
        assert!(batch.is_full(BLOCK));
    }

    #[test]
    fn empty_batch_accepts_large_record() {
        let batch = RecordBatch::new(4, 512);
        let big = RecordSize::new(8, 4000);
        assert_eq!(batch.can_batch(big, BLOCK), 512 + 4096);
    }

    #[test]
    fn state_transitions() {
        let mut batch = RecordBatch::new(4, 2048);
        assert_eq!(batch.state(), BatchState::Empty);

        let r = record_256();
        let size = r.size();
        let _pending = batch.add_pending(r, size).unwrap();
        assert_eq!(batch.state(), BatchState::Pending);
        assert_eq!(batch.encoded_length(BLOCK), 1024);

        batch.encode_records(BLOCK, None, SegmentNonce::new(1)).unwrap();
        assert_eq!(batch.state(), BatchState::Submitting);
        assert_eq!(batch.can_batch(size, BLOCK), 0);
        assert!(batch.add_pending(record_256(), size).is_err());
        assert!(batch.encode_records(BLOCK, None, SegmentNonce::new(1)).is_err());

        assert_eq!(batch.set_result(Ok(start())).unwrap(), 1);
        assert!(batch.is_empty());
        assert_eq!(batch.num_records(), 0);
    }

    #[test]
    fn encode_requires_pending() {
        let mut batch = RecordBatch::new(4, 2048);
        assert!(batch.encode_records(BLOCK, None, SegmentNonce::new(1)).is_err());
        assert!(batch.set_result(Ok(start())).is_err());
    }

    #[test]
    fn encoded_buffer_holds_all_records() {
        let mut batch = RecordBatch::new(4, 2048);
        for _ in 0..4 {
            let r = record_256();
            let size = r.size();
            batch.add_pending(r, size).unwrap();
        }
        let raw = batch.encode_records(BLOCK, None, SegmentNonce::new(9)).unwrap();
        assert_eq!(raw.len(), 1536);
        let header = RecordGroupHeader::decode(&raw).unwrap();
        assert_eq!(header.record_sizes.len(), 4);
        assert_eq!(header.segment_nonce, SegmentNonce::new(9));
    }

    #[tokio::test]
    async fn result_fans_out_positions() {
        let mut batch = RecordBatch::new(4, 2048);
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let r = record_256();
            let size = r.size();
            waiters.push(batch.add_pending(r, size).unwrap());
        }
        batch.encode_records(BLOCK, None, SegmentNonce::new(1)).unwrap();
        batch.set_result(Ok(start())).unwrap();

        let mut positions = Vec::new();
        let mut addrs = Vec::new();
        for waiter in waiters {
            let result = waiter.wait().await.unwrap();
            positions.push(result.position.offset.offset);
            addrs.push(result.addr.offset);
        }
        assert_eq!(positions, vec![2048, 2304, 2560, 2816]);
        // Metadata is 12 bytes per record, then the data regions follow.
        assert_eq!(addrs, vec![2048 + 48, 2048 + 48 + 244, 2048 + 48 + 488, 2048 + 48 + 732]);
    }

    #[tokio::test]
    async fn failure_reaches_every_record() {
        let mut batch = RecordBatch::new(4, 2048);
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let r = record_256();
            let size = r.size();
            waiters.push(batch.add_pending(r, size).unwrap());
        }
        batch.encode_records(BLOCK, None, SegmentNonce::new(1)).unwrap();
        let err = Arc::new(JournalError::NotOpen);
        batch.set_result(Err(err)).unwrap();

        for waiter in waiters {
            assert!(matches!(
                waiter.wait().await,
                Err(JournalError::BatchFailed(_))
            ));
        }
    }

    #[tokio::test]
    async fn pending_batch_can_fail() {
        let mut batch = RecordBatch::new(4, 2048);
        let r = record_256();
        let size = r.size();
        let waiter = batch.add_pending(r, size).unwrap();

        assert_eq!(batch.fail(Arc::new(JournalError::NotOpen)), 1);
        assert!(batch.is_empty());
        assert!(matches!(waiter.wait().await, Err(JournalError::BatchFailed(_))));
    }

    #[tokio::test]
    async fn dropped_batch_abandons_waiters() {
        let mut batch = RecordBatch::new(4, 2048);
        let r = record_256();
        let size = r.size();
        let waiter = batch.add_pending(r, size).unwrap();
        drop(batch);
        assert!(matches!(waiter.wait().await, Err(JournalError::WriteAbandoned)));
    }

    #[test]
    fn fast_path_requires_empty_batch() {
        let mut batch = RecordBatch::new(4, 2048);
        let raw = batch
            .submit_pending_fast(&record_256(), BLOCK, None, SegmentNonce::new(3))
            .unwrap();
        assert_eq!(raw.len(), 1024);

        let r = record_256();
        let size = r.size();
        batch.add_pending(r, size).unwrap();
        assert!(batch
            .submit_pending_fast(&record_256(), BLOCK, None, SegmentNonce::new(3))
            .is_err());
    }
}
