//! In-memory storage implementation for testing and caching.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;

use crate::error::{Result, XystonError};
use crate::storage::{Storage, StorageError, StorageInput, StorageLock, StorageOutput};

/// Shared file table of a [`MemoryStorage`].
type FileMap = Arc<Mutex<AHashMap<String, Arc<[u8]>>>>;

/// An in-memory storage implementation.
///
/// This is useful for testing and for creating temporary indexes in memory.
/// Cloning shares the underlying file table.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    /// The files stored in memory.
    files: FileMap,
    /// Names of currently held locks.
    locks: Arc<Mutex<AHashSet<String>>>,
    /// File names whose sync is forced to fail (fault injection for tests).
    failing_syncs: Arc<Mutex<AHashSet<String>>>,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new() -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(AHashMap::new())),
            locks: Arc::new(Mutex::new(AHashSet::new())),
            failing_syncs: Arc::new(Mutex::new(AHashSet::new())),
        }
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        let files = self.files.lock();
        files.values().map(|data| data.len() as u64).sum()
    }

    /// Force `sync(name)` to fail until [`MemoryStorage::clear_sync_failures`]
    /// is called. Used by tests to exercise rollback paths.
    pub fn fail_sync_on<S: Into<String>>(&self, name: S) {
        self.failing_syncs.lock().insert(name.into());
    }

    /// Remove all injected sync failures.
    pub fn clear_sync_failures(&self) {
        self.failing_syncs.lock().clear();
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.files.lock().keys().cloned().collect())
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        files
            .get(name)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()).into())
    }

    fn sync(&self, name: &str) -> Result<()> {
        if self.failing_syncs.lock().contains(name) {
            return Err(XystonError::sync_failed(
                name,
                std::io::Error::other("injected sync failure"),
            ));
        }

        if !self.file_exists(name) {
            return Err(StorageError::FileNotFound(name.to_string()).into());
        }

        Ok(())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            locks: Arc::clone(&self.locks),
            held: false,
        }))
    }
}

/// A reader over an in-memory file snapshot.
#[derive(Debug)]
struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        MemoryInput {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pos = self.cursor.position() as usize;
        let data = self.cursor.get_ref();
        let remaining = &data[pos.min(data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.cursor.set_position((pos + n) as u64);
        Ok(n)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.cursor.get_ref().len() as i64;
        let current = self.cursor.position() as i64;
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => len + delta,
            SeekFrom::Current(delta) => current + delta,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.cursor.set_position(target as u64);
        Ok(target as u64)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(MemoryInput::new(Arc::clone(
            self.cursor.get_ref(),
        ))))
    }
}

/// A writer that publishes its buffer into the shared file table on flush.
#[derive(Debug)]
struct MemoryOutput {
    name: String,
    files: FileMap,
    buffer: Cursor<Vec<u8>>,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap) -> Self {
        MemoryOutput {
            name,
            files,
            buffer: Cursor::new(Vec::new()),
        }
    }

    fn publish(&mut self) {
        let data: Arc<[u8]> = Arc::from(self.buffer.get_ref().as_slice());
        self.files.lock().insert(self.name.clone(), data);
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.publish();
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.buffer.seek(pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn position(&mut self) -> Result<u64> {
        Ok(self.buffer.position())
    }

    fn flush_output(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        self.publish();
    }
}

/// A named lock backed by the shared lock set.
#[derive(Debug)]
struct MemoryLock {
    name: String,
    locks: Arc<Mutex<AHashSet<String>>>,
    held: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_lock(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        let mut locks = self.locks.lock();
        if locks.contains(&self.name) {
            return Ok(false);
        }
        locks.insert(self.name.clone());
        self.held = true;
        Ok(true)
    }

    fn unlock(&mut self) -> Result<()> {
        if self.held {
            self.locks.lock().remove(&self.name);
            self.held = false;
        }
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.held
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}
