//! Active segment bookkeeping.

use crate::error::{JournalError, JournalResult};
use crate::format::{segment_header_length, SegmentHeader};
use crate::provider::SegmentProvider;
use crate::types::{JournalSeq, SegmentNonce, SegmentSeq};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use seglog_storage::{Paddr, SegmentManager, SegmentRef};
use std::future::Future;
use std::sync::Arc;

/// Owns the open journal segment.
///
/// Tracks the write offset within it, rolls to a new segment when asked,
/// and keeps the commit watermark.
///
/// # Invariants
///
/// - `written_to` never exceeds the segment's write capacity
/// - The commit watermark never moves backwards
/// - Offsets are reserved synchronously, so reservation order is the order
///   `write` is called in, whatever order the device completes writes in
pub(crate) struct SegmentTracker {
    device: Arc<dyn SegmentManager>,
    provider: RwLock<Option<Arc<dyn SegmentProvider>>>,
    state: Mutex<TrackerState>,
}

struct ActiveSegment {
    segment: SegmentRef,
    seq: SegmentSeq,
    nonce: SegmentNonce,
}

struct TrackerState {
    next_segment_seq: SegmentSeq,
    current: Option<ActiveSegment>,
    written_to: u32,
    committed_to: Option<JournalSeq>,
}

impl SegmentTracker {
    pub(crate) fn new(device: Arc<dyn SegmentManager>) -> Self {
        Self {
            device,
            provider: RwLock::new(None),
            state: Mutex::new(TrackerState {
                next_segment_seq: SegmentSeq::new(0),
                current: None,
                written_to: 0,
                committed_to: None,
            }),
        }
    }

    pub(crate) fn set_segment_provider(&self, provider: Arc<dyn SegmentProvider>) {
        *self.provider.write() = Some(provider);
    }

    pub(crate) fn provider(&self) -> JournalResult<Arc<dyn SegmentProvider>> {
        self.provider
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(JournalError::ProviderNotSet)
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.device.block_size()
    }

    /// Aligned length of a segment header.
    pub(crate) fn header_length(&self) -> u32 {
        segment_header_length(self.block_size())
    }

    /// Longest write a single segment can take after its header.
    pub(crate) fn max_write_length(&self) -> u64 {
        u64::from(self.device.segment_size() - self.header_length())
    }

    pub(crate) fn nonce(&self) -> Option<SegmentNonce> {
        self.state.lock().current.as_ref().map(|c| c.nonce)
    }

    pub(crate) fn committed_to(&self) -> Option<JournalSeq> {
        self.state.lock().committed_to
    }

    pub(crate) fn current_segment_seq(&self) -> Option<SegmentSeq> {
        self.state.lock().current.as_ref().map(|c| c.seq)
    }

    /// Makes the next roll use the sequence after `seq`.
    pub(crate) fn set_segment_seq(&self, seq: SegmentSeq) {
        self.state.lock().next_segment_seq = seq.next();
    }

    /// Primes the watermark from replay.
    pub(crate) fn set_committed_to(&self, committed_to: Option<JournalSeq>) {
        self.state.lock().committed_to = committed_to;
    }

    /// Returns `true` if `length` more bytes do not fit in the open segment.
    ///
    /// Also `true` when no segment is open.
    pub(crate) fn needs_roll(&self, length: u64) -> bool {
        let state = self.state.lock();
        match &state.current {
            Some(active) => {
                u64::from(state.written_to) + length > u64::from(active.segment.write_capacity())
            }
            None => true,
        }
    }

    /// Rolls into the first segment and returns the first writable position.
    pub(crate) async fn open(&self) -> JournalResult<JournalSeq> {
        self.roll().await?;
        let state = self.state.lock();
        let active = state.current.as_ref().ok_or(JournalError::NotOpen)?;
        Ok(JournalSeq::new(
            active.seq,
            Paddr::new(active.segment.id(), state.written_to),
        ))
    }

    /// Closes the open segment, if any, and starts a new one.
    ///
    /// The new segment gets the next sequence number and a fresh nonce, and
    /// its header is written before any record.
    pub(crate) async fn roll(&self) -> JournalResult<()> {
        let provider = self.provider()?;

        let old = self.state.lock().current.take();
        if let Some(old) = &old {
            old.segment.close().await?;
        }

        let id = provider.get_segment()?;
        let segment = self.device.open(id).await?;
        let (seq, nonce) = {
            let mut state = self.state.lock();
            let seq = state.next_segment_seq;
            state.next_segment_seq = seq.next();
            (seq, SegmentNonce::random())
        };

        let tail = provider.journal_tail_target();
        let header = SegmentHeader {
            segment_seq: seq,
            physical_segment_id: id,
            journal_tail: tail,
            segment_nonce: nonce,
        };
        let encoded = header.encode(self.block_size());
        let header_len = encoded.len() as u32;
        segment.write(0, encoded).await?;

        {
            let mut state = self.state.lock();
            state.current = Some(ActiveSegment {
                segment,
                seq,
                nonce,
            });
            state.written_to = header_len;
        }

        if let Some(tail) = tail {
            provider.update_journal_tail_committed(tail);
        }
        if let Some(old) = old {
            provider.close_segment(old.segment.id());
        }
        provider.set_journal_segment(id, seq);

        tracing::info!(segment = %id, seq = %seq, nonce = %nonce, "rolled journal segment");
        Ok(())
    }

    /// Reserves space for `buffer` and returns its position together with
    /// the future that performs the write.
    ///
    /// The reservation happens before this returns; the write itself is
    /// only issued when the future is polled.
    pub(crate) fn write(
        &self,
        buffer: Bytes,
    ) -> JournalResult<(
        JournalSeq,
        impl Future<Output = JournalResult<()>> + Send + 'static,
    )> {
        let length = buffer.len() as u64;
        let mut state = self.state.lock();
        let written_to = state.written_to;
        let active = state.current.as_ref().ok_or(JournalError::NotOpen)?;

        let capacity = active.segment.write_capacity();
        if u64::from(written_to) + length > u64::from(capacity) {
            return Err(JournalError::SegmentOverflow {
                offset: written_to,
                length,
                capacity,
            });
        }
        if length % u64::from(self.block_size()) != 0 {
            return Err(JournalError::invalid_operation(format!(
                "write of {length} bytes is not block aligned"
            )));
        }

        let segment = Arc::clone(&active.segment);
        let position = JournalSeq::new(active.seq, Paddr::new(segment.id(), written_to));
        state.written_to = written_to + length as u32;
        drop(state);

        tracing::trace!(position = %position, length, "reserved journal write");
        let write = async move {
            segment
                .write(written_to, buffer)
                .await
                .map_err(JournalError::from)
        };
        Ok((position, write))
    }

    /// Advances the commit watermark to `seq`.
    ///
    /// # Errors
    ///
    /// Fails if `seq` is below the current watermark or lies in a segment
    /// newer than the active one.
    pub(crate) fn mark_committed(&self, seq: JournalSeq) -> JournalResult<()> {
        let mut state = self.state.lock();
        if let Some(active) = &state.current {
            if seq.segment_seq > active.seq {
                return Err(JournalError::CommitAhead {
                    requested: seq,
                    active: active.seq,
                });
            }
        }
        if let Some(previous) = state.committed_to {
            if seq < previous {
                return Err(JournalError::CommitRegression {
                    previous,
                    requested: seq,
                });
            }
        }
        state.committed_to = Some(seq);
        Ok(())
    }

    /// Closes the open segment, if any.
    pub(crate) async fn close(&self) -> JournalResult<()> {
        let current = self.state.lock().current.take();
        if let Some(active) = current {
            active.segment.close().await?;
            if let Ok(provider) = self.provider() {
                provider.close_segment(active.segment.id());
            }
            tracing::info!(segment = %active.segment.id(), seq = %active.seq, "closed journal segment");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FreeListProvider, SegmentUsage};
    use seglog_storage::{InMemorySegmentManager, SegmentGeometry, SegmentId};

    fn setup() -> (Arc<InMemorySegmentManager>, Arc<FreeListProvider>, SegmentTracker) {
        let device = Arc::new(InMemorySegmentManager::new(SegmentGeometry::new(4096, 512, 4)).unwrap());
        let provider = Arc::new(FreeListProvider::new(4));
        let tracker = SegmentTracker::new(Arc::clone(&device) as Arc<dyn SegmentManager>);
        tracker.set_segment_provider(Arc::clone(&provider) as Arc<dyn SegmentProvider>);
        (device, provider, tracker)
    }

    #[test]
    fn accessors_follow_geometry() {
        let (_, _, tracker) = setup();
        assert_eq!(tracker.block_size(), 512);
        assert_eq!(tracker.header_length(), 512);
        assert_eq!(tracker.max_write_length(), 3584);
        assert!(tracker.needs_roll(0));
        assert_eq!(tracker.nonce(), None);
    }

    #[tokio::test]
    async fn roll_requires_provider() {
        let device = Arc::new(InMemorySegmentManager::new(SegmentGeometry::new(4096, 512, 2)).unwrap());
        let tracker = SegmentTracker::new(device);
        assert!(matches!(tracker.roll().await, Err(JournalError::ProviderNotSet)));
    }

    #[tokio::test]
    async fn open_writes_header() {
        let (device, provider, tracker) = setup();
        let start = tracker.open().await.unwrap();

        assert_eq!(start.segment_seq, SegmentSeq::new(0));
        assert_eq!(start.offset, Paddr::new(SegmentId::new(0), 512));

        let raw = device.segment_bytes(SegmentId::new(0)).unwrap();
        let header = SegmentHeader::decode(&raw).unwrap();
        assert_eq!(header.segment_seq, SegmentSeq::new(0));
        assert_eq!(Some(header.segment_nonce), tracker.nonce());
        assert_eq!(header.journal_tail, None);
        assert_eq!(
            provider.usage(SegmentId::new(0)),
            Some(SegmentUsage::Open(SegmentSeq::new(0)))
        );
    }

    #[tokio::test]
    async fn write_reserves_in_call_order() {
        let (_, _, tracker) = setup();
        tracker.open().await.unwrap();

        let (first, first_write) = tracker.write(Bytes::from(vec![0; 1024])).unwrap();
        let (second, second_write) = tracker.write(Bytes::from(vec![0; 512])).unwrap();
        assert_eq!(first.offset.offset, 512);
        assert_eq!(second.offset.offset, 1536);

        // Completion order does not matter.
        second_write.await.unwrap();
        first_write.await.unwrap();
    }

    #[tokio::test]
    async fn needs_roll_is_exact() {
        let (_, _, tracker) = setup();
        tracker.open().await.unwrap();
        assert!(!tracker.needs_roll(3584));
        assert!(tracker.needs_roll(3585));

        let (_, write) = tracker.write(Bytes::from(vec![0; 3584])).unwrap();
        write.await.unwrap();
        assert!(!tracker.needs_roll(0));
        assert!(tracker.needs_roll(1));
    }

    #[tokio::test]
    async fn write_past_capacity_fails() {
        let (_, _, tracker) = setup();
        tracker.open().await.unwrap();
        let result = tracker.write(Bytes::from(vec![0; 4096]));
        assert!(matches!(result, Err(JournalError::SegmentOverflow { .. })));
    }

    #[tokio::test]
    async fn roll_advances_sequence_and_records_tail() {
        let (device, provider, tracker) = setup();
        tracker.open().await.unwrap();
        tracker.roll().await.unwrap();

        assert_eq!(tracker.current_segment_seq(), Some(SegmentSeq::new(1)));
        assert_eq!(
            provider.usage(SegmentId::new(0)),
            Some(SegmentUsage::Closed(SegmentSeq::new(0)))
        );

        let raw = device.segment_bytes(SegmentId::new(1)).unwrap();
        let header = SegmentHeader::decode(&raw).unwrap();
        assert_eq!(header.segment_seq, SegmentSeq::new(1));
        let tail = header.journal_tail.unwrap();
        assert_eq!(tail.segment_seq, SegmentSeq::new(0));
        assert_eq!(provider.tail_committed(), Some(tail));
        assert_eq!(Some(header.segment_nonce), tracker.nonce());
    }

    #[tokio::test]
    async fn roll_fails_without_free_segments() {
        let device = Arc::new(InMemorySegmentManager::new(SegmentGeometry::new(4096, 512, 1)).unwrap());
        let tracker = SegmentTracker::new(device);
        tracker.set_segment_provider(Arc::new(FreeListProvider::new(1)));
        tracker.open().await.unwrap();

        assert!(matches!(tracker.roll().await, Err(JournalError::NoFreeSegments)));
        assert!(tracker.write(Bytes::from(vec![0; 512])).is_err());
    }

    #[tokio::test]
    async fn set_segment_seq_primes_next_roll() {
        let (_, _, tracker) = setup();
        tracker.set_segment_seq(SegmentSeq::new(41));
        let start = tracker.open().await.unwrap();
        assert_eq!(start.segment_seq, SegmentSeq::new(42));
    }

    #[tokio::test]
    async fn mark_committed_is_monotonic() {
        let (_, _, tracker) = setup();
        let start = tracker.open().await.unwrap();

        tracker.mark_committed(start.add_offset(512)).unwrap();
        tracker.mark_committed(start.add_offset(512)).unwrap();
        assert!(matches!(
            tracker.mark_committed(start),
            Err(JournalError::CommitRegression { .. })
        ));

        let ahead = JournalSeq::new(SegmentSeq::new(5), start.offset);
        assert!(matches!(
            tracker.mark_committed(ahead),
            Err(JournalError::CommitAhead { .. })
        ));
        assert_eq!(tracker.committed_to(), Some(start.add_offset(512)));
    }

    #[tokio::test]
    async fn close_releases_active_segment() {
        let (_, provider, tracker) = setup();
        tracker.open().await.unwrap();
        tracker.close().await.unwrap();

        assert_eq!(tracker.current_segment_seq(), None);
        assert_eq!(
            provider.usage(SegmentId::new(0)),
            Some(SegmentUsage::Closed(SegmentSeq::new(0)))
        );
        assert!(matches!(
            tracker.write(Bytes::from(vec![0; 512])),
            Err(JournalError::NotOpen)
        ));
    }
}
