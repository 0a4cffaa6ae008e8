//! Write admission.
//!
//! The submitter decides, for every incoming record, whether it is written
//! on its own, merged into the current batch, or has to wait. It bounds
//! the number of writes in flight and triggers segment rolls.
//!
//! The state depends only on the number of writes in flight:
//!
//! - `Idle`: nothing in flight. A record that finds the batch empty is
//!   written on its own.
//! - `Pending`: writes in flight, below the limit. Records join the current
//!   batch, which is written once it is full or a write completes.
//! - `Full`: the limit is reached. Submissions wait until a write completes.
//!   Each completion out of `Full` releases one waiting submission, which
//!   then joins the current batch.

use super::batch::{BatchWritten, PendingRecord, RecordBatch};
use super::segment_tracker::SegmentTracker;
use super::WriteResult;
use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::format::{encoded_write_length, group_header_length};
use crate::record::{Record, RecordSize};
use crate::types::JournalSeq;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// Admission state of the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitterState {
    /// No writes in flight.
    Idle,
    /// Writes in flight, below the I/O depth limit.
    Pending,
    /// At the I/O depth limit.
    Full,
}

/// Point-in-time view of the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitterStats {
    /// Current admission state.
    pub state: SubmitterState,
    /// Writes issued but not completed.
    pub outstanding_io: usize,
    /// Records in the current batch.
    pub pending_records: usize,
    /// Batch slots not in use.
    pub free_batches: usize,
    /// Submissions waiting for a write to complete.
    pub waiting_submitters: usize,
    /// Records accepted since creation.
    pub records_submitted: u64,
    /// Batches written since creation.
    pub batches_flushed: u64,
    /// Records written on their own since creation.
    pub fast_path_writes: u64,
}

/// Completion of an admitted record.
#[derive(Debug)]
pub(crate) enum WriteTicket {
    /// Written on its own.
    Fast {
        written: BatchWritten,
        rx: oneshot::Receiver<JournalResult<()>>,
    },
    /// Sharing a batch write.
    Batched(PendingRecord),
}

impl WriteTicket {
    /// Waits for the physical write of the record.
    pub(crate) async fn wait(self) -> JournalResult<WriteResult> {
        match self {
            Self::Fast { written, rx } => match rx.await {
                Ok(Ok(())) => Ok(written.resolve(0, 0)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(JournalError::WriteAbandoned),
            },
            Self::Batched(pending) => pending.wait().await,
        }
    }
}

/// What a submission does next.
enum Admit {
    Done(WriteTicket),
    /// Retry immediately.
    Retry(Record),
    /// Retry once the submitter state changes.
    Wait(Record),
    /// Retry once a write completes out of `Full`.
    WaitRoom(Record),
    /// Roll the segment, then retry.
    Roll(Record),
}

pub(crate) struct Submitter {
    inner: Arc<SubmitterInner>,
}

struct SubmitterInner {
    tracker: Arc<SegmentTracker>,
    io_depth_limit: usize,
    core: Mutex<SubmitterCore>,
    /// Signalled on every write completion, roll end and flush.
    changed: Notify,
    /// Releases one submission waiting at the depth limit.
    room: Notify,
}

struct SubmitterCore {
    outstanding: usize,
    batches: Vec<RecordBatch>,
    free: VecDeque<usize>,
    current: usize,
    rolling: bool,
    open: bool,
    /// Submissions parked on `room`.
    room_waiters: usize,
    records_submitted: u64,
    batches_flushed: u64,
    fast_path_writes: u64,
}

impl SubmitterCore {
    fn state(&self, limit: usize) -> SubmitterState {
        if self.outstanding == 0 {
            SubmitterState::Idle
        } else if self.outstanding < limit {
            SubmitterState::Pending
        } else {
            SubmitterState::Full
        }
    }

    fn current_batch(&mut self) -> &mut RecordBatch {
        &mut self.batches[self.current]
    }
}

/// Clears the rolling flag when the roll ends, whether it succeeded or not.
struct RollGuard<'a> {
    inner: &'a Arc<SubmitterInner>,
}

impl Drop for RollGuard<'_> {
    fn drop(&mut self) {
        let mut core = self.inner.core.lock();
        core.rolling = false;
        self.inner.flush_locked(&mut core);
        drop(core);
        self.inner.changed.notify_waiters();
    }
}

impl Submitter {
    pub(crate) fn new(tracker: Arc<SegmentTracker>, config: &JournalConfig) -> Self {
        // One slot more than the depth limit: a batch can always collect
        // records while the limit's worth of batches is in flight.
        let slots = config.io_depth_limit + 1;
        let batches = (0..slots)
            .map(|_| RecordBatch::new(config.batch_capacity, config.batch_flush_size))
            .collect();
        Self {
            inner: Arc::new(SubmitterInner {
                tracker,
                io_depth_limit: config.io_depth_limit,
                core: Mutex::new(SubmitterCore {
                    outstanding: 0,
                    batches,
                    free: (1..slots).collect(),
                    current: 0,
                    rolling: false,
                    open: false,
                    room_waiters: 0,
                    records_submitted: 0,
                    batches_flushed: 0,
                    fast_path_writes: 0,
                }),
                changed: Notify::new(),
                room: Notify::new(),
            }),
        }
    }

    /// Opens the first segment and starts accepting records.
    pub(crate) async fn open(&self) -> JournalResult<JournalSeq> {
        if self.inner.core.lock().open {
            return Err(JournalError::invalid_operation("journal is already open"));
        }
        let start = self.inner.tracker.open().await?;
        self.inner.core.lock().open = true;
        Ok(start)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner.core.lock().open
    }

    /// Admits a record.
    ///
    /// Returns once the record has a place in the journal. The returned
    /// ticket resolves when the record is on the device.
    ///
    /// # Errors
    ///
    /// - [`JournalError::RecordTooLarge`] if the record can never fit in a
    ///   segment; nothing is written
    /// - [`JournalError::NotOpen`] before open or after close
    /// - Any error from rolling to a new segment
    pub(crate) async fn submit(&self, record: Record) -> JournalResult<WriteTicket> {
        let size = record.size();
        let length = encoded_write_length(&[size], self.inner.tracker.block_size());
        let max = self.inner.tracker.max_write_length();
        if length > max {
            return Err(JournalError::RecordTooLarge { length, max });
        }

        let mut record = record;
        let mut released = false;
        loop {
            let notified = self.inner.changed.notified();
            let admit = {
                let mut core = self.inner.core.lock();
                if released {
                    core.room_waiters -= 1;
                }
                let admit = self.inner.admit(&mut core, record, size, released);
                if released && !matches!(admit, Ok(Admit::WaitRoom(_))) {
                    self.inner.pass_room(&core);
                }
                admit?
            };
            released = false;
            record = match admit {
                Admit::Done(ticket) => return Ok(ticket),
                Admit::Retry(record) => record,
                Admit::Wait(record) => {
                    notified.await;
                    record
                }
                Admit::WaitRoom(record) => {
                    self.inner.room.notified().await;
                    released = true;
                    record
                }
                Admit::Roll(record) => {
                    self.inner.roll().await?;
                    record
                }
            };
        }
    }

    /// Stops accepting records, waits for in-flight writes and closes the
    /// open segment.
    pub(crate) async fn close(&self) -> JournalResult<()> {
        {
            let mut core = self.inner.core.lock();
            core.open = false;
            self.inner.flush_locked(&mut core);
        }
        self.inner.changed.notify_waiters();
        self.inner
            .wait_until(|core| {
                core.outstanding == 0
                    && !core.rolling
                    && !core.batches[core.current].is_pending()
            })
            .await;
        self.inner.tracker.close().await
    }

    pub(crate) fn stats(&self) -> SubmitterStats {
        let mut core = self.inner.core.lock();
        SubmitterStats {
            state: core.state(self.inner.io_depth_limit),
            outstanding_io: core.outstanding,
            pending_records: core.current_batch().num_records(),
            free_batches: core.free.len(),
            waiting_submitters: core.room_waiters,
            records_submitted: core.records_submitted,
            batches_flushed: core.batches_flushed,
            fast_path_writes: core.fast_path_writes,
        }
    }
}

impl SubmitterInner {
    /// Decides what to do with a record. Runs under the core lock.
    ///
    /// `released` is set when the submission was woken by a write completing
    /// out of `Full`; such a submission may join the batch even at the limit.
    fn admit(
        self: &Arc<Self>,
        core: &mut SubmitterCore,
        record: Record,
        size: RecordSize,
        released: bool,
    ) -> JournalResult<Admit> {
        if !core.open {
            return Err(JournalError::NotOpen);
        }
        if core.rolling {
            return Ok(Admit::Wait(record));
        }

        let block_size = self.tracker.block_size();
        let max = self.tracker.max_write_length();
        let batched = core.current_batch().can_batch(size, block_size);
        let state = core.state(self.io_depth_limit);

        if state == SubmitterState::Full {
            if released
                && batched != 0
                && batched <= max
                && !self.tracker.needs_roll(batched)
            {
                return Ok(Admit::Done(self.add_to_batch(core, record, size, state)?));
            }
            core.room_waiters += 1;
            return Ok(Admit::WaitRoom(record));
        }

        // An empty batch takes any record that fits a segment, so only a
        // batch holding records can refuse one.
        if batched == 0 || batched > max {
            return Ok(self.flush_then_retry(core, record));
        }
        if self.tracker.needs_roll(batched) {
            if core.current_batch().is_pending() {
                return Ok(self.flush_then_retry(core, record));
            }
            core.rolling = true;
            return Ok(Admit::Roll(record));
        }

        if state == SubmitterState::Idle && core.current_batch().is_empty() {
            let ticket = self.submit_fast(core, &record, size)?;
            core.records_submitted += 1;
            return Ok(Admit::Done(ticket));
        }
        Ok(Admit::Done(self.add_to_batch(core, record, size, state)?))
    }

    /// Adds a record to the current batch and writes the batch once it is
    /// full. With nothing in flight there is no completion to flush it
    /// later, so it is written right away.
    fn add_to_batch(
        self: &Arc<Self>,
        core: &mut SubmitterCore,
        record: Record,
        size: RecordSize,
        state: SubmitterState,
    ) -> JournalResult<WriteTicket> {
        let pending = core.current_batch().add_pending(record, size)?;
        core.records_submitted += 1;
        tracing::trace!(records = core.current_batch().num_records(), "batched record");
        let block_size = self.tracker.block_size();
        if state == SubmitterState::Idle || core.current_batch().is_full(block_size) {
            self.flush_locked(core);
        }
        Ok(WriteTicket::Batched(pending))
    }

    /// Writes out the current batch so the record can be retried against a
    /// fresh one.
    fn flush_then_retry(self: &Arc<Self>, core: &mut SubmitterCore, record: Record) -> Admit {
        if self.flush_locked(core) || !core.current_batch().is_pending() {
            Admit::Retry(record)
        } else {
            Admit::Wait(record)
        }
    }

    /// Hands the release on to the next waiting submission while there is
    /// room below the limit, or once the submitter is closed.
    fn pass_room(&self, core: &SubmitterCore) {
        if core.room_waiters > 0
            && (!core.open || core.state(self.io_depth_limit) != SubmitterState::Full)
        {
            self.room.notify_one();
        }
    }

    /// Writes a single record bypassing the batch.
    fn submit_fast(
        self: &Arc<Self>,
        core: &mut SubmitterCore,
        record: &Record,
        size: RecordSize,
    ) -> JournalResult<WriteTicket> {
        let block_size = self.tracker.block_size();
        let nonce = self.tracker.nonce().ok_or(JournalError::NotOpen)?;
        let encoded = core.current_batch().submit_pending_fast(
            record,
            block_size,
            self.tracker.committed_to(),
            nonce,
        )?;
        let (start, write) = self.tracker.write(encoded)?;

        core.outstanding += 1;
        core.fast_path_writes += 1;
        tracing::debug!(position = %start, "fast path write");
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = write.await;
            if let Err(e) = &result {
                tracing::warn!(position = %start, error = %e, "journal write failed");
            }
            inner.complete_io(&mut inner.core.lock());
            let _ = tx.send(result);
        });

        Ok(WriteTicket::Fast {
            written: BatchWritten {
                start,
                header_len: group_header_length(1, block_size) as u32,
                metadata_len: size.mdlength as u32,
            },
            rx,
        })
    }

    /// Writes the current batch if it has records and a write can be issued.
    ///
    /// Returns `true` if a write was issued.
    fn flush_locked(self: &Arc<Self>, core: &mut SubmitterCore) -> bool {
        if core.rolling
            || core.outstanding >= self.io_depth_limit
            || !core.batches[core.current].is_pending()
        {
            return false;
        }
        let Some(next) = core.free.pop_front() else {
            return false;
        };
        let slot = std::mem::replace(&mut core.current, next);

        let issued = self.tracker.nonce().ok_or(JournalError::NotOpen).and_then(|nonce| {
            let encoded = core.batches[slot].encode_records(
                self.tracker.block_size(),
                self.tracker.committed_to(),
                nonce,
            )?;
            self.tracker.write(encoded)
        });
        let (start, write) = match issued {
            Ok(issued) => issued,
            Err(e) => {
                tracing::warn!(error = %e, "failed to issue batch write");
                core.batches[slot].fail(Arc::new(e));
                core.free.push_back(slot);
                return false;
            }
        };

        core.outstanding += 1;
        core.batches_flushed += 1;
        tracing::debug!(
            position = %start,
            records = core.batches[slot].num_records(),
            outstanding = core.outstanding,
            "flushed batch"
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = write.await.map(|()| start).map_err(|e| {
                tracing::warn!(position = %start, error = %e, "journal batch write failed");
                Arc::new(e)
            });
            let mut core = inner.core.lock();
            if let Err(e) = core.batches[slot].set_result(result) {
                tracing::error!(error = %e, "batch completed in unexpected state");
            }
            core.free.push_back(slot);
            inner.complete_io(&mut core);
        });
        true
    }

    /// Accounts for a finished write. Leaving `Full` releases one waiting
    /// submission; a batch holding records is written right away.
    fn complete_io(self: &Arc<Self>, core: &mut SubmitterCore) {
        let was_full = core.state(self.io_depth_limit) == SubmitterState::Full;
        core.outstanding -= 1;
        if was_full && core.room_waiters > 0 {
            self.room.notify_one();
        }
        self.flush_locked(core);
        self.changed.notify_waiters();
    }

    /// Drains in-flight writes and rolls to a new segment.
    ///
    /// The caller has set the rolling flag.
    async fn roll(self: &Arc<Self>) -> JournalResult<()> {
        let _guard = RollGuard { inner: self };
        self.wait_until(|core| core.outstanding == 0).await;
        self.tracker.roll().await
    }

    async fn wait_until(&self, done: impl Fn(&SubmitterCore) -> bool) {
        loop {
            let notified = self.changed.notified();
            let finished = done(&self.core.lock());
            if finished {
                return;
            }
            notified.await;
        }
    }
}
