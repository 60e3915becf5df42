//! Storage abstraction layer for Xyston.
//!
//! This module provides a pluggable storage system with a unified interface
//! over different backends (file system, memory). An index directory is a
//! flat namespace of named byte streams plus named advisory locks; everything
//! above this layer addresses files by name only.
//!
//! # Storage Types
//!
//! ## FileStorage
//! - Disk-based persistent storage
//! - Per-file fsync for durability barriers
//! - Lock files created with `O_EXCL` semantics
//!
//! ## MemoryStorage
//! - In-memory storage for testing and temporary data
//! - Fast but non-persistent
//! - Supports sync fault injection for exercising rollback paths

use std::io::{Read, Seek, Write};

use crate::error::{Result, XystonError};

pub mod file;
pub mod memory;
pub mod structured;

/// A trait for storage backends that can store and retrieve data.
///
/// This provides a pluggable interface for different storage implementations
/// like file system or memory.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing content.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Ensure a file's content is durable.
    ///
    /// After `sync(name)` returns `Ok`, the file's bytes survive a crash.
    fn sync(&self, name: &str) -> Result<()>;

    /// Atomically rename a file.
    ///
    /// Used for atomic publication: write to a temporary name, then rename
    /// to the final name so readers never observe partial data.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Create a named advisory lock handle. The lock is not acquired until
    /// [`StorageLock::try_lock`] succeeds.
    fn make_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Clone this input stream with an independent position.
    fn clone_input(&self) -> Result<Box<dyn StorageInput>>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Get the current position in the output stream.
    fn position(&mut self) -> Result<u64>;

    /// Flush buffered bytes to the backend (not necessarily durable;
    /// durability comes from [`Storage::sync`]).
    fn flush_output(&mut self) -> Result<()>;

    /// Flush and close the output stream.
    fn close(&mut self) -> Result<()>;
}

// Allow trait objects to be used where generic writers are expected.
impl StorageOutput for Box<dyn StorageOutput> {
    fn position(&mut self) -> Result<u64> {
        self.as_mut().position()
    }

    fn flush_output(&mut self) -> Result<()> {
        self.as_mut().flush_output()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        self.as_ref().clone_input()
    }
}

/// A named advisory lock on a storage resource.
///
/// At most one holder per name; the holder releases either explicitly via
/// [`StorageLock::unlock`] or by dropping the handle.
pub trait StorageLock: Send + std::fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Try to acquire the lock. Returns `false` if it is already held.
    fn try_lock(&mut self) -> Result<bool>;

    /// Release the lock if held.
    fn unlock(&mut self) -> Result<()>;

    /// Check whether this handle currently holds the lock.
    fn is_locked(&self) -> bool;
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// Permission denied.
    PermissionDenied(String),

    /// I/O error.
    IoError(String),

    /// Lock acquisition failed.
    LockFailed(String),

    /// Invalid operation.
    InvalidOperation(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::PermissionDenied(name) => write!(f, "Permission denied: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::LockFailed(name) => write!(f, "Failed to acquire lock: {name}"),
            StorageError::InvalidOperation(msg) => write!(f, "Invalid operation: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for XystonError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileNotFound(name) => XystonError::file_not_found(name),
            StorageError::LockFailed(name) => XystonError::lock_obtain_failed(name),
            other => XystonError::storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FileNotFound("test.txt".to_string());
        assert_eq!(err.to_string(), "File not found: test.txt");

        let err = StorageError::LockFailed("write.lock".to_string());
        assert_eq!(err.to_string(), "Failed to acquire lock: write.lock");

        let err = StorageError::InvalidOperation("cannot write".to_string());
        assert_eq!(err.to_string(), "Invalid operation: cannot write");
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: XystonError = StorageError::FileNotFound("segments_1".to_string()).into();
        match err {
            XystonError::FileNotFound(name) => assert_eq!(name, "segments_1"),
            other => panic!("unexpected variant: {other}"),
        }

        let err: XystonError = StorageError::LockFailed("write.lock".to_string()).into();
        assert!(matches!(err, XystonError::LockObtainFailed(_)));
    }
}
