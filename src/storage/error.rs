//! Storage error types
//!
//! Defines all errors that can occur in the storage layer and the
//! transactional operations built on top of it.

use thiserror::Error;

/// Errors that can occur in the aggregate store
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite reported a failure other than a constraint violation
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    /// A write referenced a missing report or system profile, or broke a key.
    ///
    /// This signals an ordering bug in the caller and must not be retried blindly.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored data could not be interpreted
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// The observation generator failed for a day
    #[error("Observation generation failed for day {day_index}: {reason}")]
    Generator { day_index: u32, reason: String },

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),

    /// A blocking storage task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StorageError::Constraint(msg.unwrap_or_else(|| e.to_string()))
            }
            other => StorageError::Sqlite(other),
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Task(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
