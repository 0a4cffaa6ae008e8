//! Error types for the journal.

use crate::types::{JournalSeq, SegmentSeq};
use seglog_storage::StorageError;
use std::sync::Arc;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur in journal operations.
///
/// Callers that only care about the coarse outcome can use
/// [`is_range`](Self::is_range) and [`is_io`](Self::is_io): a range error
/// means the record was rejected before any I/O was issued, everything else
/// is fatal to the operation that reported it and is never retried.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Segment device error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A record is larger than the longest write a segment can take.
    #[error("record too large: write of {length} bytes exceeds maximum of {max}")]
    RecordTooLarge {
        /// Encoded write length of the record on its own.
        length: u64,
        /// Maximum single write length.
        max: u64,
    },

    /// Persisted journal metadata is inconsistent.
    #[error("malformed journal: {message}")]
    Malformed {
        /// Description of the inconsistency.
        message: String,
    },

    /// The journal is not open for writes.
    #[error("journal is not open")]
    NotOpen,

    /// No segment provider was injected before rolling.
    #[error("segment provider not set")]
    ProviderNotSet,

    /// No write pipeline was injected before submitting.
    #[error("write pipeline not set")]
    PipelineNotSet,

    /// The segment provider has no free segment left.
    #[error("no free segments")]
    NoFreeSegments,

    /// A reserved write would extend past the active segment.
    #[error("segment overflow: write of {length} bytes at offset {offset} exceeds capacity {capacity}")]
    SegmentOverflow {
        /// Offset of the attempted reservation.
        offset: u32,
        /// Length of the attempted write.
        length: u64,
        /// Write capacity of the segment.
        capacity: u32,
    },

    /// The commit watermark would move backwards.
    #[error("commit watermark regression: {requested} is below {previous}")]
    CommitRegression {
        /// The current watermark.
        previous: JournalSeq,
        /// The rejected position.
        requested: JournalSeq,
    },

    /// A commit position lies in a segment newer than the active one.
    #[error("commit position {requested} is ahead of active segment {active}")]
    CommitAhead {
        /// The rejected position.
        requested: JournalSeq,
        /// Sequence of the active segment.
        active: SegmentSeq,
    },

    /// An internal state machine was driven through an illegal transition.
    #[error("invalid transition: {message}")]
    InvalidTransition {
        /// Description of the transition.
        message: String,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The shared write that carried this record failed.
    #[error("batch write failed: {0}")]
    BatchFailed(Arc<JournalError>),

    /// A write completed without reporting a result.
    #[error("write abandoned before completion")]
    WriteAbandoned,

    /// The replay delta handler failed.
    #[error("replay handler failed: {message}")]
    Handler {
        /// Description of the failure.
        message: String,
    },
}

impl JournalError {
    /// Creates a malformed journal error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Creates an invalid transition error.
    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a replay handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Returns `true` if the record was rejected before any I/O.
    #[must_use]
    pub fn is_range(&self) -> bool {
        matches!(self, Self::RecordTooLarge { .. })
    }

    /// Returns `true` for every failure that is not a range error.
    #[must_use]
    pub fn is_io(&self) -> bool {
        !self.is_range()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_errors_are_not_io() {
        let err = JournalError::RecordTooLarge {
            length: 8192,
            max: 3584,
        };
        assert!(err.is_range());
        assert!(!err.is_io());
    }

    #[test]
    fn batch_failures_are_io() {
        let inner = Arc::new(JournalError::Storage(StorageError::Injected(
            "boom".to_string(),
        )));
        let err = JournalError::BatchFailed(inner);
        assert!(err.is_io());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn helper_constructors() {
        assert!(matches!(
            JournalError::malformed("dup"),
            JournalError::Malformed { .. }
        ));
        assert!(matches!(
            JournalError::handler("bad delta"),
            JournalError::Handler { .. }
        ));
    }
}
