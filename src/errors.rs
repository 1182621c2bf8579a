use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error raised by any storage operation, carrying the driver message.
#[derive(Error, Debug)]
#[error("storage error: {message}")]
pub struct StorageError {
    message: String,
}

impl StorageError {
    /// Wrap a driver-level message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The underlying driver message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        Self::new(error.to_string())
    }
}

/// All error conditions surfaced by the queue.
#[derive(Error, Debug)]
pub enum Error {
    /// A database operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A dispatch-time validation failed (bad priority, bad preload path).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The callable could not be classified or resolved.
    #[error("invalid callable: {0}")]
    InvalidCallable(String),

    /// The job row could not be persisted.
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    /// The worker could not acquire its on-disk lock.
    #[error("worker lock contention: {0}")]
    LockContention(String),

    /// A closure payload failed its integrity check. Never retried.
    #[error("closure payload failed integrity verification")]
    TamperedClosure,

    /// The configured preload file does not exist at execution time.
    #[error("preload file missing: {}", .0.display())]
    PreloadMissing(PathBuf),

    /// The attempt exceeded the job's wall-clock budget.
    #[error("job exceeded its {0}s timeout")]
    JobTimeout(i64),

    /// The user's callable returned an error or panicked.
    #[error("job error: {0}")]
    User(#[source] anyhow::Error),
}

impl Error {
    /// Whether this failure must never be retried, regardless of budget.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::TamperedClosure)
    }
}
