//! # SegLog Core
//!
//! Segment-based write-ahead journal.
//!
//! This crate provides:
//! - An ordered, crash-recoverable stream of records on fixed-size segments
//! - Batching of concurrent submissions into shared writes, with a bound on
//!   writes in flight
//! - Commit results in submission order through an ordered write pipeline
//! - Replay of everything a previous instance wrote
//!
//! ## Writing and replaying
//!
//! ```rust
//! use seglog_core::{
//!     Delta, DeltaKind, FreeListProvider, Journal, JournalConfig, OrderingHandle, Record,
//!     WritePipeline,
//! };
//! use seglog_storage::{InMemorySegmentManager, SegmentGeometry};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = Arc::new(InMemorySegmentManager::new(SegmentGeometry::new(4096, 512, 4))?);
//!
//! let journal = Journal::new(device.clone(), JournalConfig::default())?;
//! journal.set_segment_provider(Arc::new(FreeListProvider::new(4)));
//! journal.set_write_pipeline(Arc::new(WritePipeline::new()));
//! journal.open_for_write().await?;
//!
//! let record = Record::new().with_delta(Delta::new(DeltaKind::Update, 7, vec![1, 2, 3]));
//! let mut handle = OrderingHandle::new();
//! let written = journal.submit_record(record, &mut handle).await?;
//! drop(handle);
//! journal.close().await?;
//!
//! // A new instance on the same device sees the record again.
//! let recovered = Journal::new(device, JournalConfig::default())?;
//! recovered.set_segment_provider(Arc::new(FreeListProvider::new(4)));
//! let headers = recovered.find_segment_headers().await?;
//! let mut targets = Vec::new();
//! let summary = recovered
//!     .replay(headers, |_, _, delta| {
//!         targets.push(delta.target);
//!         Ok(())
//!     })
//!     .await?;
//! assert_eq!(targets, vec![7]);
//! assert_eq!(summary.last_position, Some(written.position));
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
pub mod format;
mod journal;
mod pipeline;
mod provider;
mod record;
mod scanner;
mod types;

pub use config::JournalConfig;
pub use error::{JournalError, JournalResult};
pub use format::{RecordGroupHeader, SegmentHeader};
pub use journal::{Journal, ReplaySummary, SubmitterState, SubmitterStats, WriteResult};
pub use pipeline::{OrderedConcurrentStage, OrderedExclusiveStage, OrderingHandle, WritePipeline};
pub use provider::{FreeListProvider, SegmentProvider, SegmentUsage};
pub use record::{decode_metadata, Delta, DeltaKind, Record, RecordMetadata, RecordSize};
pub use scanner::{ExtentReader, RecordGroup, RecordLayout, ScanOutcome, ScanStop};
pub use types::{JournalSeq, SegmentNonce, SegmentSeq};
