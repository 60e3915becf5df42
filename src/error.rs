//! Error types for the Xyston library.
//!
//! This module provides comprehensive error handling for all Xyston
//! operations. All errors are represented by the [`XystonError`] enum, which
//! provides detailed information about what went wrong.
//!
//! # Examples
//!
//! ```
//! use xyston::error::{Result, XystonError};
//!
//! fn example_operation() -> Result<()> {
//!     // Return an error
//!     Err(XystonError::invalid_argument("Invalid input"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Xyston operations.
///
/// This enum represents all possible errors that can occur in the Xyston
/// library. It uses the `thiserror` crate for automatic `Error` trait
/// implementation and provides convenient constructor methods for creating
/// specific error types.
#[derive(Error, Debug)]
pub enum XystonError {
    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The write lock is already held by another writer.
    #[error("Failed to obtain lock: {0}")]
    LockObtainFailed(String),

    /// An expected file (e.g. the index meta on append) is missing.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Syncing a named file to durable storage failed.
    #[error("Failed to sync file '{file}': {source}")]
    SyncFailed {
        /// The file that could not be synced.
        file: String,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Index-related errors
    #[error("Index error: {0}")]
    Index(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid argument passed to an operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with XystonError.
pub type Result<T> = std::result::Result<T, XystonError>;

impl XystonError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        XystonError::Index(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        XystonError::Storage(msg.into())
    }

    /// Create a new lock-obtain-failed error.
    pub fn lock_obtain_failed<S: Into<String>>(name: S) -> Self {
        XystonError::LockObtainFailed(name.into())
    }

    /// Create a new file-not-found error.
    pub fn file_not_found<S: Into<String>>(name: S) -> Self {
        XystonError::FileNotFound(name.into())
    }

    /// Create a new illegal-state error.
    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        XystonError::IllegalState(msg.into())
    }

    /// Create a new sync-failed error for a named file.
    pub fn sync_failed<S: Into<String>>(file: S, source: io::Error) -> Self {
        XystonError::SyncFailed {
            file: file.into(),
            source,
        }
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        XystonError::InvalidArgument(msg.into())
    }

    /// Create a new serialization error.
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        XystonError::SerializationError(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        XystonError::Other(msg.into())
    }
}
