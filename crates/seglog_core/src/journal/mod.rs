//! The journal facade.
//!
//! [`Journal`] ties together segment tracking, write admission and the
//! ordered write pipeline, and replays what a previous instance wrote.

mod batch;
mod replay;
mod segment_tracker;
mod submitter;

pub use replay::ReplaySummary;
pub use submitter::{SubmitterState, SubmitterStats};

use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::format::SegmentHeader;
use crate::pipeline::{OrderingHandle, WritePipeline};
use crate::provider::SegmentProvider;
use crate::record::Record;
use crate::scanner::ExtentReader;
use crate::types::{JournalSeq, SegmentSeq};
use parking_lot::RwLock;
use segment_tracker::SegmentTracker;
use seglog_storage::{Paddr, SegmentId, SegmentManager};
use std::sync::Arc;
use submitter::Submitter;

/// Where a committed record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Address of the record's data.
    pub addr: Paddr,
    /// Journal position of the record's first byte.
    pub position: JournalSeq,
}

/// A segment-based write-ahead journal.
///
/// Records are appended to the open segment of a [`SegmentManager`].
/// Concurrent submissions may share a physical write, and writes may
/// complete in any order, but results become visible to callers in the
/// order the records were submitted.
///
/// A journal needs a [`SegmentProvider`] and a [`WritePipeline`] before it
/// can be used. It is either opened for writing directly, or first replayed
/// and then opened, in which case it continues after the last replayed
/// segment.
///
/// Dropping a journal does not close its open segment.
pub struct Journal {
    reader: ExtentReader,
    tracker: Arc<SegmentTracker>,
    submitter: Submitter,
    pipeline: RwLock<Option<Arc<WritePipeline>>>,
}

impl Journal {
    /// Creates a journal on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidConfig`] if `config` is invalid.
    pub fn new(device: Arc<dyn SegmentManager>, config: JournalConfig) -> JournalResult<Self> {
        config.validate()?;
        let tracker = Arc::new(SegmentTracker::new(Arc::clone(&device)));
        let submitter = Submitter::new(Arc::clone(&tracker), &config);
        Ok(Self {
            reader: ExtentReader::new(device),
            tracker,
            submitter,
            pipeline: RwLock::new(None),
        })
    }

    /// Sets the provider segments are allocated from.
    pub fn set_segment_provider(&self, provider: Arc<dyn SegmentProvider>) {
        self.tracker.set_segment_provider(provider);
    }

    /// Sets the pipeline submissions move through.
    pub fn set_write_pipeline(&self, pipeline: Arc<WritePipeline>) {
        *self.pipeline.write() = Some(pipeline);
    }

    fn pipeline(&self) -> JournalResult<Arc<WritePipeline>> {
        self.pipeline
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(JournalError::PipelineNotSet)
    }

    /// Rolls into a fresh segment and starts accepting records.
    ///
    /// Returns the position the first record will be written at.
    ///
    /// # Errors
    ///
    /// Fails if no provider is set, the journal is already open, or the
    /// segment header cannot be written.
    pub async fn open_for_write(&self) -> JournalResult<JournalSeq> {
        let start = self.submitter.open().await?;
        tracing::info!(position = %start, "journal open for write");
        Ok(start)
    }

    /// Waits for in-flight writes and closes the open segment.
    ///
    /// Submissions after close fail with [`JournalError::NotOpen`].
    ///
    /// # Errors
    ///
    /// Returns an error if closing the segment fails.
    pub async fn close(&self) -> JournalResult<()> {
        self.submitter.close().await?;
        tracing::info!(committed_to = ?self.tracker.committed_to(), "journal closed");
        Ok(())
    }

    /// Writes `record` and waits until it is durable.
    ///
    /// `handle` orders this submission against others: admission happens in
    /// the order handles enter the `prepare` stage, and results are returned
    /// in the same order. On return the handle sits in the `finalize`
    /// stage; drop it or call [`OrderingHandle::exit`] to let the next
    /// record finish.
    ///
    /// # Errors
    ///
    /// - [`JournalError::RecordTooLarge`] if the record cannot fit in a
    ///   segment; nothing is written
    /// - [`JournalError::PipelineNotSet`] if no pipeline is set
    /// - [`JournalError::NotOpen`] if the journal is not open
    /// - Any I/O error from the write, or a roll it required
    pub async fn submit_record(
        &self,
        record: Record,
        handle: &mut OrderingHandle,
    ) -> JournalResult<WriteResult> {
        let pipeline = self.pipeline()?;

        handle.enter_exclusive(&pipeline.prepare).await;
        let ticket = self.submitter.submit(record).await;

        handle.enter_concurrent(&pipeline.device_submission).await;
        let written = match ticket {
            Ok(ticket) => ticket.wait().await,
            Err(e) => Err(e),
        };

        handle.enter_exclusive(&pipeline.finalize).await;
        let written = written?;
        self.tracker.mark_committed(written.position)?;
        tracing::trace!(position = %written.position, addr = %written.addr, "record committed");
        Ok(written)
    }

    /// Reads the segment header of every segment on the device.
    ///
    /// # Errors
    ///
    /// Returns an error if a device read fails.
    pub async fn find_segment_headers(&self) -> JournalResult<Vec<(SegmentId, SegmentHeader)>> {
        self.reader.scan_segment_headers().await
    }

    /// Returns the sequence number of the open segment.
    #[must_use]
    pub fn current_segment_sequence(&self) -> Option<SegmentSeq> {
        self.tracker.current_segment_seq()
    }

    /// Returns the commit watermark.
    #[must_use]
    pub fn committed_to(&self) -> Option<JournalSeq> {
        self.tracker.committed_to()
    }

    /// Returns the device block size.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.tracker.block_size()
    }

    /// Returns the longest write a segment can take.
    #[must_use]
    pub fn max_write_length(&self) -> u64 {
        self.tracker.max_write_length()
    }

    /// Returns a snapshot of the submitter.
    #[must_use]
    pub fn submitter_stats(&self) -> SubmitterStats {
        self.submitter.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FreeListProvider;
    use crate::record::{Delta, DeltaKind};
    use seglog_storage::{InMemorySegmentManager, SegmentGeometry};

    fn journal() -> Journal {
        let device = Arc::new(InMemorySegmentManager::new(SegmentGeometry::new(4096, 512, 4)).unwrap());
        Journal::new(device, JournalConfig::default()).unwrap()
    }

    fn record() -> Record {
        Record::new().with_delta(Delta::new(DeltaKind::Update, 1, vec![1, 2, 3]))
    }

    #[test]
    fn invalid_config_is_rejected() {
        let device = Arc::new(InMemorySegmentManager::new(SegmentGeometry::new(4096, 512, 4)).unwrap());
        let config = JournalConfig::new().io_depth_limit(0);
        assert!(matches!(
            Journal::new(device, config),
            Err(JournalError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn open_requires_provider() {
        let journal = journal();
        assert!(matches!(
            journal.open_for_write().await,
            Err(JournalError::ProviderNotSet)
        ));
    }

    #[tokio::test]
    async fn submit_requires_pipeline() {
        let journal = journal();
        journal.set_segment_provider(Arc::new(FreeListProvider::new(4)));
        journal.open_for_write().await.unwrap();

        let mut handle = OrderingHandle::new();
        assert!(matches!(
            journal.submit_record(record(), &mut handle).await,
            Err(JournalError::PipelineNotSet)
        ));
    }

    #[tokio::test]
    async fn submit_advances_watermark() {
        let journal = journal();
        journal.set_segment_provider(Arc::new(FreeListProvider::new(4)));
        journal.set_write_pipeline(Arc::new(WritePipeline::new()));
        let start = journal.open_for_write().await.unwrap();
        assert_eq!(journal.current_segment_sequence(), Some(start.segment_seq));
        assert_eq!(journal.committed_to(), None);

        let mut handle = OrderingHandle::new();
        let written = journal.submit_record(record(), &mut handle).await.unwrap();
        handle.exit();

        assert_eq!(written.position, start.add_offset(512));
        assert_eq!(journal.committed_to(), Some(written.position));
        assert_eq!(journal.submitter_stats().records_submitted, 1);
    }

    #[tokio::test]
    async fn accessors() {
        let journal = journal();
        assert_eq!(journal.block_size(), 512);
        assert_eq!(journal.max_write_length(), 3584);
        assert_eq!(journal.current_segment_sequence(), None);
        assert_eq!(journal.submitter_stats().state, SubmitterState::Idle);
        assert_eq!(journal.submitter_stats().free_batches, 5);
    }
}
