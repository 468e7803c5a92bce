use thiserror::Error;

/// Custom error type for merge-engine operations.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        series: Option<String>,
        timestamp: Option<i64>,
    },

    #[error("Merge journal corrupt: {0}")]
    CorruptJournal(String),

    #[error("Memory budget exhausted: needed {needed} bytes of {budget}")]
    BudgetExhausted { needed: u64, budget: u64 },

    #[error("Merge cancelled")]
    Cancelled,

    #[error("Inconsistent merge state: {0}")]
    InconsistentState(String),

    #[error("Series not found: {0}")]
    SeriesNotFound(String),

    #[error("Invalid segment file name: {0}")]
    InvalidFileName(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MergeError {
    /// Whether a failed merge attempt may be retried on the next compaction cycle.
    ///
    /// Inconsistent on-disk state and journal corruption require operator
    /// intervention; everything else either retries or is handled at a finer
    /// granularity (corrupt input chunks are skipped, not propagated).
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            MergeError::InconsistentState(_) | MergeError::CorruptJournal(_)
        )
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for MergeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        MergeError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
