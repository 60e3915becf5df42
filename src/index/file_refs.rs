//! Reference-counted file lifecycle.
//!
//! Every directory filename observed by a live reader, a writer context or a
//! committed meta is reference-counted here. A file is eligible for deletion
//! iff its refcount is zero and the latest committed index meta does not name
//! it. Readers and writer contexts hold [`FileRef`] handles; dropping the
//! last handle makes the file collectable.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::storage::{Storage, StorageInput, StorageLock, StorageOutput};

/// Shared refcount table for the files of one directory.
#[derive(Debug, Default)]
pub struct FileRefs {
    counts: Mutex<AHashMap<String, u64>>,
}

impl FileRefs {
    /// Create an empty table.
    pub fn new() -> Arc<FileRefs> {
        Arc::new(FileRefs::default())
    }

    /// Acquire a counted handle on `name`.
    pub fn reference(self: &Arc<Self>, name: &str) -> FileRef {
        {
            let mut counts = self.counts.lock();
            *counts.entry(name.to_string()).or_insert(0) += 1;
        }
        FileRef {
            name: Arc::from(name),
            refs: Arc::clone(self),
        }
    }

    /// True when at least one handle on `name` is alive.
    pub fn is_referenced(&self, name: &str) -> bool {
        self.counts.lock().get(name).copied().unwrap_or(0) > 0
    }

    /// Current refcount of `name` (0 when untracked).
    pub fn count(&self, name: &str) -> u64 {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }

    fn release(&self, name: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(name) {
            *count -= 1;
            if *count == 0 {
                counts.remove(name);
            }
        }
    }
}

/// A counted handle on a directory filename. Cloning increments the count,
/// dropping decrements it.
#[derive(Debug)]
pub struct FileRef {
    name: Arc<str>,
    refs: Arc<FileRefs>,
}

impl FileRef {
    /// The referenced filename.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Clone for FileRef {
    fn clone(&self) -> Self {
        self.refs.reference(&self.name)
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        self.refs.release(&self.name);
    }
}

/// A [`Storage`] view that interposes a file reference on every file it
/// creates or opens.
///
/// The view holds one handle per observed name; [`RefTrackingStorage::refs`]
/// snapshots them (e.g. into a pending segment or a committed-state bundle)
/// and [`RefTrackingStorage::clear_refs`] drops them all.
#[derive(Debug)]
pub struct RefTrackingStorage {
    base: Arc<dyn Storage>,
    table: Arc<FileRefs>,
    held: Mutex<AHashMap<String, FileRef>>,
}

impl RefTrackingStorage {
    /// Create a tracking view over `base` using the shared table.
    pub fn new(base: Arc<dyn Storage>, table: Arc<FileRefs>) -> Self {
        RefTrackingStorage {
            base,
            table,
            held: Mutex::new(AHashMap::new()),
        }
    }

    /// The shared refcount table.
    pub fn table(&self) -> &Arc<FileRefs> {
        &self.table
    }

    /// The wrapped storage.
    pub fn base(&self) -> &Arc<dyn Storage> {
        &self.base
    }

    /// Track `name` through this view, whether or not the file exists yet.
    pub fn track(&self, name: &str) {
        let mut held = self.held.lock();
        if !held.contains_key(name) {
            held.insert(name.to_string(), self.table.reference(name));
        }
    }

    /// Snapshot every handle held by this view.
    pub fn refs(&self) -> Vec<FileRef> {
        self.held.lock().values().cloned().collect()
    }

    /// Drop every handle held by this view.
    pub fn clear_refs(&self) {
        self.held.lock().clear();
    }
}

impl Storage for RefTrackingStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let input = self.base.open_input(name)?;
        self.track(name);
        Ok(input)
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let output = self.base.create_output(name)?;
        self.track(name);
        Ok(output)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.base.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.base.delete_file(name)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.base.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.base.file_size(name)
    }

    fn sync(&self, name: &str) -> Result<()> {
        self.base.sync(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.base.rename_file(old_name, new_name)?;
        self.track(new_name);
        Ok(())
    }

    fn make_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.base.make_lock(name)
    }
}

/// Delete every file whose refcount is zero and that `keep` does not name.
///
/// Returns the number of files removed. Used on writer startup to collect
/// orphans left by a crash between the two commit phases.
pub fn remove_unreferenced(
    storage: &dyn Storage,
    table: &FileRefs,
    keep: &AHashSet<String>,
) -> Result<usize> {
    let mut removed = 0;
    for name in storage.list_files()? {
        if keep.contains(&name) || table.is_referenced(&name) {
            continue;
        }
        storage.delete_file(&name)?;
        debug!(file = %name, "removed unreferenced file");
        removed += 1;
    }
    Ok(removed)
}
