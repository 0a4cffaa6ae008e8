//! Ordered write pipeline.
//!
//! Callers move an [`OrderingHandle`] through the stages of a
//! [`WritePipeline`]. Stages keep handles in the order they first entered
//! the pipeline, which is what makes commit results visible in submission
//! order even though the physical writes behind them may finish in any
//! order.
//!
//! - An [`OrderedExclusiveStage`] admits one handle at a time, first come
//!   first served.
//! - An [`OrderedConcurrentStage`] admits any number of handles at once,
//!   but a handle can only move on to the next stage after every handle
//!   that entered before it has moved on.
//!
//! A handle acquires the next stage before it releases the current one.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, OwnedMutexGuard};

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_stage_id() -> u64 {
    NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A stage that holds at most one handle.
#[derive(Debug)]
pub struct OrderedExclusiveStage {
    id: u64,
    name: &'static str,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl OrderedExclusiveStage {
    /// Creates a stage.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: next_stage_id(),
            name,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A stage that holds any number of handles and releases them in entry
/// order.
#[derive(Debug)]
pub struct OrderedConcurrentStage {
    id: u64,
    name: &'static str,
    /// Exit signal of the most recent entrant.
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl OrderedConcurrentStage {
    /// Creates a stage.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            id: next_stage_id(),
            name,
            tail: Mutex::new(None),
        }
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug)]
enum StageGuard {
    Exclusive {
        stage: u64,
        _guard: OwnedMutexGuard<()>,
    },
    Concurrent {
        stage: u64,
        /// Resolves once the previous entrant has left the stage.
        predecessor: Option<oneshot::Receiver<()>>,
        /// Dropped when this handle leaves the stage.
        _exit: oneshot::Sender<()>,
    },
}

impl StageGuard {
    fn stage(&self) -> u64 {
        match self {
            Self::Exclusive { stage, .. } | Self::Concurrent { stage, .. } => *stage,
        }
    }
}

/// Per-record ordering token.
///
/// A fresh handle is in no stage. Dropping a handle leaves its current
/// stage.
#[derive(Debug, Default)]
pub struct OrderingHandle {
    current: Option<StageGuard>,
}

impl OrderingHandle {
    /// Creates a handle that is in no stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn in_stage(&self, id: u64) -> bool {
        self.current.as_ref().is_some_and(|g| g.stage() == id)
    }

    /// Waits until every handle that entered the current concurrent stage
    /// before this one has left it.
    async fn wait_for_predecessor(&mut self) {
        if let Some(StageGuard::Concurrent { predecessor, .. }) = &mut self.current {
            if let Some(rx) = predecessor.take() {
                // A dropped sender means the predecessor is gone too.
                let _ = rx.await;
            }
        }
    }

    /// Moves into an exclusive stage. No-op if already there.
    pub async fn enter_exclusive(&mut self, stage: &OrderedExclusiveStage) {
        if self.in_stage(stage.id) {
            return;
        }
        self.wait_for_predecessor().await;
        let guard = Arc::clone(&stage.lock).lock_owned().await;
        self.current = Some(StageGuard::Exclusive {
            stage: stage.id,
            _guard: guard,
        });
    }

    /// Moves into a concurrent stage. No-op if already there.
    ///
    /// Entering never waits when the handle currently holds an exclusive
    /// stage or no stage.
    pub async fn enter_concurrent(&mut self, stage: &OrderedConcurrentStage) {
        if self.in_stage(stage.id) {
            return;
        }
        self.wait_for_predecessor().await;
        let (tx, rx) = oneshot::channel();
        let predecessor = stage.tail.lock().replace(rx);
        self.current = Some(StageGuard::Concurrent {
            stage: stage.id,
            predecessor,
            _exit: tx,
        });
    }

    /// Leaves the current stage.
    pub fn exit(&mut self) {
        self.current = None;
    }
}

/// The stages every journal write moves through.
#[derive(Debug)]
pub struct WritePipeline {
    /// Admission: sizing, batching, rolling and offset reservation.
    pub prepare: OrderedExclusiveStage,
    /// Waiting for the physical write.
    pub device_submission: OrderedConcurrentStage,
    /// Commit: the watermark advances and the result becomes visible.
    pub finalize: OrderedExclusiveStage,
}

impl WritePipeline {
    /// Creates a pipeline with fresh stages.
    #[must_use]
    pub fn new() -> Self {
        Self {
            prepare: OrderedExclusiveStage::new("prepare"),
            device_submission: OrderedConcurrentStage::new("device_submission"),
            finalize: OrderedExclusiveStage::new("finalize"),
        }
    }
}

impl Default for WritePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn enter_is_idempotent() {
        let pipeline = WritePipeline::new();
        let mut handle = OrderingHandle::new();
        handle.enter_exclusive(&pipeline.prepare).await;
        // Re-entering must not deadlock on our own guard.
        handle.enter_exclusive(&pipeline.prepare).await;
        handle.enter_concurrent(&pipeline.device_submission).await;
        handle.enter_concurrent(&pipeline.device_submission).await;
    }

    #[tokio::test]
    async fn exclusive_stage_admits_one_handle() {
        let pipeline = Arc::new(WritePipeline::new());
        let mut first = OrderingHandle::new();
        first.enter_exclusive(&pipeline.prepare).await;

        let task = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                let mut second = OrderingHandle::new();
                second.enter_exclusive(&pipeline.prepare).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        first.exit();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_stage_releases_in_entry_order() {
        let pipeline = Arc::new(WritePipeline::new());
        let order = Arc::new(AsyncMutex::new(Vec::new()));

        let mut a = OrderingHandle::new();
        let mut b = OrderingHandle::new();
        a.enter_exclusive(&pipeline.prepare).await;
        a.enter_concurrent(&pipeline.device_submission).await;
        b.enter_exclusive(&pipeline.prepare).await;
        b.enter_concurrent(&pipeline.device_submission).await;

        // B tries to finalize first but has to wait for A.
        let b_task = {
            let pipeline = Arc::clone(&pipeline);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                b.enter_exclusive(&pipeline.finalize).await;
                order.lock().await.push('b');
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(order.lock().await.is_empty());

        a.enter_exclusive(&pipeline.finalize).await;
        order.lock().await.push('a');
        a.exit();

        b_task.await.unwrap();
        assert_eq!(*order.lock().await, vec!['a', 'b']);
    }

    #[tokio::test]
    async fn dropped_handle_unblocks_successor() {
        let pipeline = WritePipeline::new();
        let mut a = OrderingHandle::new();
        a.enter_concurrent(&pipeline.device_submission).await;
        let mut b = OrderingHandle::new();
        b.enter_concurrent(&pipeline.device_submission).await;

        drop(a);
        b.enter_exclusive(&pipeline.finalize).await;
    }

    #[test]
    fn stage_names() {
        let pipeline = WritePipeline::default();
        assert_eq!(pipeline.prepare.name(), "prepare");
        assert_eq!(pipeline.device_submission.name(), "device_submission");
        assert_eq!(pipeline.finalize.name(), "finalize");
    }
}
