//! Error types for the state store.
//!
//! Errors are categorized so callers can tell lock contention (retryable
//! with backoff) from consistency failures (never retried with the same
//! token) and plain storage faults.

use crate::backend::Expect;
use crate::lock::LockInfo;
use thiserror::Error;

/// Categories of state store errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Lock contention or loss
    Lock,
    /// A conditional write was rejected
    Consistency,
    /// Backend or encoding failure
    Storage,
}

impl ErrorCategory {
    /// Whether this category is worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Lock)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Lock => "Lock unavailable",
            Self::Consistency => "State changed underneath this run",
            Self::Storage => "State storage failure",
        }
    }
}

/// Errors that can occur while reading or writing stack state.
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The record's version did not match the caller's expectation
    #[error("optimistic lock conflict on '{key}': expected {expected}, found {}", describe_version(.actual))]
    OptimisticLockConflict {
        key: String,
        expected: Expect,
        actual: Option<u64>,
    },

    /// The write carried a fencing token that is no longer current
    #[error("stale fencing token {token} for '{lock_key}' (current: {})", describe_token(.current))]
    StaleFence {
        lock_key: String,
        token: u64,
        current: Option<u64>,
    },

    /// Another holder owns an unexpired lock
    #[error("lock held by {holder}")]
    LockHeld { holder: LockInfo },

    /// The caller's lock was released or reclaimed by someone else
    #[error("lock with token {token} lost: {reason}")]
    LockLost { token: u64, reason: String },

    /// The record was written by an engine this version cannot read
    #[error("unsupported record format {format} in '{key}'")]
    UnsupportedFormat { key: String, format: u64 },

    /// The record exists but does not decode to the expected shape
    #[error("corrupt record '{key}': {message}")]
    CorruptRecord { key: String, message: String },
}

fn describe_version(version: &Option<u64>) -> String {
    version.map_or_else(|| "no record".to_string(), |v| format!("version {v}"))
}

fn describe_token(token: &Option<u64>) -> String {
    token.map_or_else(|| "unlocked".to_string(), |t| t.to_string())
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::LockHeld { .. } | Error::LockLost { .. } => ErrorCategory::Lock,
            Error::OptimisticLockConflict { .. } | Error::StaleFence { .. } => {
                ErrorCategory::Consistency
            }
            _ => ErrorCategory::Storage,
        }
    }

    /// Whether this error is worth retrying with backoff.
    ///
    /// Only contention qualifies; a lost lock or a rejected write must
    /// surface to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockHeld { .. })
    }

    /// Whether this error means the caller no longer owns its lock epoch.
    pub fn is_lock_loss(&self) -> bool {
        matches!(self, Error::LockLost { .. } | Error::StaleFence { .. })
    }
}

/// Result type for state store operations
pub type Result<T> = std::result::Result<T, Error>;
