//! # SegLog Storage
//!
//! Segment device abstraction and implementations for SegLog.
//!
//! This crate provides the lowest-level storage abstraction for the SegLog
//! journal. A device is a fixed number of equally sized segments; each
//! segment is opened empty, written at block-aligned offsets, closed, and
//! eventually released for reuse. Devices are **opaque byte stores** - they
//! do not interpret the data they store.
//!
//! ## Design Principles
//!
//! - Devices only open, write, read, close and release segments
//! - No knowledge of journal headers, record groups or nonces
//! - Must be `Send + Sync` so writes can run on spawned tasks
//! - The journal owns all format interpretation
//!
//! ## Available Devices
//!
//! - [`InMemorySegmentManager`] - For testing, with I/O control hooks
//! - [`FileSegmentManager`] - For persistent storage in a single file
//!
//! ## Example
//!
//! ```rust
//! use seglog_storage::{InMemorySegmentManager, SegmentGeometry, SegmentManager};
//!
//! let device = InMemorySegmentManager::new(SegmentGeometry::new(4096, 512, 8)).unwrap();
//! assert_eq!(device.segment_size(), 4096);
//! assert_eq!(device.num_segments(), 8);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod device;
mod error;
mod file;
mod memory;

pub use device::{Paddr, Segment, SegmentGeometry, SegmentId, SegmentManager, SegmentRef};
pub use error::{StorageError, StorageResult};
pub use file::FileSegmentManager;
pub use memory::InMemorySegmentManager;
