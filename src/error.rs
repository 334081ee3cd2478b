//! Error kinds surfaced by the cache dictionary.
//!
//! The set is closed: every fallible public operation returns one of these
//! variants. Variants carry owned data (messages, durations, timestamps) so
//! an error captured by an update worker can be stored on the update unit
//! and rethrown to the waiting caller.

use std::time::{Duration, SystemTime};

/// Errors produced by the cache dictionary, its storages and its update queue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Bad configuration, raised at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Operation is not supported by this dictionary layout or source.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// A column or attribute did not have the expected type or shape.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// `try_push` exhausted the configured push timeout.
    #[error("update queue is full, push timed out after {timeout:?}")]
    QueueFull {
        /// The push timeout that elapsed.
        timeout: Duration,
    },
    /// `wait_for_finish` exhausted the configured query wait timeout.
    #[error("update wait timed out after {timeout:?}")]
    UpdateTimeout {
        /// The wait timeout that elapsed.
        timeout: Duration,
    },
    /// The source stream failed during an update.
    #[error("update failed: {message}")]
    UpdateFailed {
        /// Message of the original source error.
        message: String,
    },
    /// An update was declined because the error backoff has not elapsed yet.
    #[error("update postponed, next attempt scheduled at {retry_at:?}")]
    Backoff {
        /// The instant at which the next update attempt is allowed.
        retry_at: SystemTime,
    },
    /// The update queue was stopped before the unit completed.
    #[error("update queue was stopped")]
    Cancelled,
    /// I/O failure in a file-backed storage.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CacheError {
    fn from(error: std::io::Error) -> Self {
        CacheError::Io(error.to_string())
    }
}
