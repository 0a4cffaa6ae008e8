//! Segment allocation for the journal.

use crate::error::{JournalError, JournalResult};
use crate::types::{JournalSeq, SegmentSeq};
use parking_lot::Mutex;
use seglog_storage::{Paddr, SegmentId};
use std::collections::{BTreeMap, VecDeque};

/// Supplies segments to the journal and tracks which ones it uses.
///
/// The journal asks for a new segment on every roll and reports segments
/// it has finished with. Deciding when a closed segment can be reused is
/// up to the provider.
pub trait SegmentProvider: Send + Sync {
    /// Hands out an empty segment for the journal to roll into.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::NoFreeSegments`] if none is available.
    fn get_segment(&self) -> JournalResult<SegmentId>;

    /// Reports that the journal stopped writing to `id`.
    fn close_segment(&self, id: SegmentId);

    /// Reports that `id` is now the active journal segment with sequence `seq`.
    fn set_journal_segment(&self, id: SegmentId, seq: SegmentSeq);

    /// Returns the oldest journal position replay must start from.
    fn journal_tail_target(&self) -> Option<JournalSeq>;

    /// Records that `tail` has been persisted in a segment header.
    fn update_journal_tail_committed(&self, tail: JournalSeq);

    /// Marks a segment found during replay as a closed journal segment.
    fn init_mark_segment_closed(&self, id: SegmentId, seq: SegmentSeq);
}

/// Usage of a physical segment as seen by [`FreeListProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentUsage {
    /// Available for the journal.
    Free,
    /// The active journal segment.
    Open(SegmentSeq),
    /// A journal segment that is no longer written.
    Closed(SegmentSeq),
}

/// A provider handing out segments from a free list.
///
/// Segments are handed out in id order and never reclaimed: once the free
/// list is empty every further roll fails with
/// [`JournalError::NoFreeSegments`].
#[derive(Debug)]
pub struct FreeListProvider {
    inner: Mutex<FreeListInner>,
}

#[derive(Debug)]
struct FreeListInner {
    free: VecDeque<SegmentId>,
    usage: Vec<SegmentUsage>,
    /// Journal segments by sequence.
    journal: BTreeMap<SegmentSeq, SegmentId>,
    tail_committed: Option<JournalSeq>,
}

impl FreeListProvider {
    /// Creates a provider over segments `0..num_segments`, all free.
    #[must_use]
    pub fn new(num_segments: u32) -> Self {
        Self {
            inner: Mutex::new(FreeListInner {
                free: (0..num_segments).map(SegmentId::new).collect(),
                usage: vec![SegmentUsage::Free; num_segments as usize],
                journal: BTreeMap::new(),
                tail_committed: None,
            }),
        }
    }

    /// Returns how a segment is used, or `None` for an unknown id.
    #[must_use]
    pub fn usage(&self, id: SegmentId) -> Option<SegmentUsage> {
        self.inner.lock().usage.get(id.as_u32() as usize).copied()
    }

    /// Returns the number of free segments.
    #[must_use]
    pub fn free_segments(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Returns the last tail reported committed.
    #[must_use]
    pub fn tail_committed(&self) -> Option<JournalSeq> {
        self.inner.lock().tail_committed
    }
}

impl FreeListInner {
    fn set_usage(&mut self, id: SegmentId, usage: SegmentUsage) {
        if let Some(slot) = self.usage.get_mut(id.as_u32() as usize) {
            *slot = usage;
        }
    }

    fn register(&mut self, id: SegmentId, seq: SegmentSeq, usage: SegmentUsage) {
        self.free.retain(|free| *free != id);
        self.set_usage(id, usage);
        self.journal.insert(seq, id);
    }
}

impl SegmentProvider for FreeListProvider {
    fn get_segment(&self) -> JournalResult<SegmentId> {
        let mut inner = self.inner.lock();
        let id = inner.free.pop_front().ok_or(JournalError::NoFreeSegments)?;
        tracing::debug!(segment = %id, remaining = inner.free.len(), "allocated segment");
        Ok(id)
    }

    fn close_segment(&self, id: SegmentId) {
        let mut inner = self.inner.lock();
        if let Some(SegmentUsage::Open(seq)) = inner.usage.get(id.as_u32() as usize).copied() {
            inner.set_usage(id, SegmentUsage::Closed(seq));
        }
    }

    fn set_journal_segment(&self, id: SegmentId, seq: SegmentSeq) {
        self.inner.lock().register(id, seq, SegmentUsage::Open(seq));
    }

    fn journal_tail_target(&self) -> Option<JournalSeq> {
        let inner = self.inner.lock();
        if inner.tail_committed.is_some() {
            return inner.tail_committed;
        }
        // Nothing reclaimed yet: everything since the first segment counts.
        inner
            .journal
            .iter()
            .next()
            .map(|(seq, id)| JournalSeq::new(*seq, Paddr::new(*id, 0)))
    }

    fn update_journal_tail_committed(&self, tail: JournalSeq) {
        let mut inner = self.inner.lock();
        if inner.tail_committed.is_none_or(|current| current < tail) {
            inner.tail_committed = Some(tail);
        }
    }

    fn init_mark_segment_closed(&self, id: SegmentId, seq: SegmentSeq) {
        self.inner.lock().register(id, seq, SegmentUsage::Closed(seq));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_segments_in_order() {
        let provider = FreeListProvider::new(3);
        assert_eq!(provider.get_segment().unwrap(), SegmentId::new(0));
        assert_eq!(provider.get_segment().unwrap(), SegmentId::new(1));
        assert_eq!(provider.free_segments(), 1);
    }

    #[test]
    fn exhausted_free_list() {
        let provider = FreeListProvider::new(1);
        provider.get_segment().unwrap();
        assert!(matches!(
            provider.get_segment(),
            Err(JournalError::NoFreeSegments)
        ));
    }

    #[test]
    fn segment_usage_transitions() {
        let provider = FreeListProvider::new(2);
        let id = provider.get_segment().unwrap();
        provider.set_journal_segment(id, SegmentSeq::new(4));
        assert_eq!(provider.usage(id), Some(SegmentUsage::Open(SegmentSeq::new(4))));

        provider.close_segment(id);
        assert_eq!(provider.usage(id), Some(SegmentUsage::Closed(SegmentSeq::new(4))));
        assert_eq!(provider.usage(SegmentId::new(9)), None);
    }

    #[test]
    fn replayed_segments_leave_free_list() {
        let provider = FreeListProvider::new(4);
        provider.init_mark_segment_closed(SegmentId::new(0), SegmentSeq::new(1));
        provider.init_mark_segment_closed(SegmentId::new(2), SegmentSeq::new(2));

        assert_eq!(provider.free_segments(), 2);
        assert_eq!(provider.get_segment().unwrap(), SegmentId::new(1));
        assert_eq!(provider.get_segment().unwrap(), SegmentId::new(3));
    }

    #[test]
    fn tail_target_defaults_to_first_segment() {
        let provider = FreeListProvider::new(4);
        assert_eq!(provider.journal_tail_target(), None);

        provider.set_journal_segment(SegmentId::new(2), SegmentSeq::new(5));
        provider.set_journal_segment(SegmentId::new(3), SegmentSeq::new(6));
        let target = provider.journal_tail_target().unwrap();
        assert_eq!(target.segment_seq, SegmentSeq::new(5));
        assert_eq!(target.offset.segment, SegmentId::new(2));
    }

    #[test]
    fn tail_committed_never_regresses() {
        let provider = FreeListProvider::new(4);
        let later = JournalSeq::new(SegmentSeq::new(3), Paddr::new(SegmentId::new(1), 0));
        let earlier = JournalSeq::new(SegmentSeq::new(2), Paddr::new(SegmentId::new(0), 0));

        provider.update_journal_tail_committed(later);
        provider.update_journal_tail_committed(earlier);
        assert_eq!(provider.tail_committed(), Some(later));
        assert_eq!(provider.journal_tail_target(), Some(later));
    }
}
