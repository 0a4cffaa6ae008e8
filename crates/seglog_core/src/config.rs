//! Journal configuration.

use crate::error::{JournalError, JournalResult};

/// Configuration for the journal's write path.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Maximum number of physical writes in flight at once.
    pub io_depth_limit: usize,

    /// Maximum number of records merged into one write.
    pub batch_capacity: usize,

    /// Encoded length beyond which a batch accepts no more records.
    pub batch_flush_size: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            io_depth_limit: 5,
            batch_capacity: 16,
            batch_flush_size: 1024 * 1024, // 1 MiB
        }
    }
}

impl JournalConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the outstanding write limit.
    #[must_use]
    pub const fn io_depth_limit(mut self, limit: usize) -> Self {
        self.io_depth_limit = limit;
        self
    }

    /// Sets the maximum number of records per batch.
    #[must_use]
    pub const fn batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity;
        self
    }

    /// Sets the batch flush threshold in bytes.
    #[must_use]
    pub const fn batch_flush_size(mut self, size: u64) -> Self {
        self.batch_flush_size = size;
        self
    }

    /// Checks that every limit is usable.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidConfig`] if any limit is zero.
    pub fn validate(&self) -> JournalResult<()> {
        if self.io_depth_limit == 0 {
            return Err(JournalError::invalid_config("io_depth_limit must be at least 1"));
        }
        if self.batch_capacity == 0 {
            return Err(JournalError::invalid_config("batch_capacity must be at least 1"));
        }
        if self.batch_flush_size == 0 {
            return Err(JournalError::invalid_config("batch_flush_size must be non-zero"));
        }
        Ok(())
    }
}
