//! Per-segment reader cache.
//!
//! The cache is keyed by segment name and guarded by the writer's commit
//! lock; lookups open a reader on miss and transparently reopen when the
//! requested meta carries a newer mask version.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::error::{Result, XystonError};
use crate::index::file_refs::FileRefs;
use crate::index::meta::SegmentMeta;
use crate::index::segment_reader::SegmentReader;
use crate::storage::Storage;

/// Cache of open segment readers, keyed by segment name.
#[derive(Debug)]
pub struct CachedReaders {
    storage: Arc<dyn Storage>,
    table: Arc<FileRefs>,
    readers: AHashMap<String, SegmentReader>,
}

impl CachedReaders {
    /// Create an empty cache over `storage`.
    pub fn new(storage: Arc<dyn Storage>, table: Arc<FileRefs>) -> Self {
        CachedReaders {
            storage,
            table,
            readers: AHashMap::new(),
        }
    }

    /// Get an open reader for `meta`, opening or reopening as needed.
    pub fn get(&mut self, meta: &SegmentMeta) -> Result<SegmentReader> {
        match self.readers.get(&meta.name) {
            Some(cached) => {
                let reader = cached
                    .reopen(&self.storage, &self.table, meta)
                    .map_err(|e| {
                        XystonError::index(format!(
                            "failed to reopen segment '{}': {e}",
                            meta.name
                        ))
                    })?;
                self.readers.insert(meta.name.clone(), reader.clone());
                Ok(reader)
            }
            None => {
                let reader =
                    SegmentReader::open(&self.storage, &self.table, meta).map_err(|e| {
                        XystonError::index(format!("failed to open segment '{}': {e}", meta.name))
                    })?;
                self.readers.insert(meta.name.clone(), reader.clone());
                Ok(reader)
            }
        }
    }

    /// Drop the reader for one segment.
    pub fn remove(&mut self, name: &str) {
        self.readers.remove(name);
    }

    /// Drop every reader whose segment is not in `names`.
    pub fn retain(&mut self, names: &AHashSet<String>) {
        self.readers.retain(|name, _| names.contains(name));
    }

    /// Drop all readers.
    pub fn clear(&mut self) {
        self.readers.clear();
    }

    /// Number of cached readers.
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    /// True when no readers are cached.
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::default_codec;
    use crate::doc::IndexedField;
    use crate::index::file_refs::RefTrackingStorage;
    use crate::index::segment_reader::SubReader;
    use crate::index::segment_writer::{SegmentWriter, UpdateContext};
    use crate::storage::memory::MemoryStorage;

    fn flushed(name: &str, base: &Arc<dyn Storage>, table: &Arc<FileRefs>) -> SegmentMeta {
        let dir = Arc::new(RefTrackingStorage::new(Arc::clone(base), Arc::clone(table)));
        let mut writer = SegmentWriter::new(dir, default_codec());
        writer.reset(SegmentMeta::new(name, "base"));
        writer.begin(UpdateContext::insert(0));
        writer.index(&IndexedField::text("title", "alpha"));
        writer.commit();
        writer.flush().unwrap().1
    }

    #[test]
    fn test_open_on_miss_and_cache_hit() {
        let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let table = FileRefs::new();
        let meta = flushed("_1", &base, &table);

        let mut cache = CachedReaders::new(Arc::clone(&base), Arc::clone(&table));
        let first = cache.get(&meta).unwrap();
        assert_eq!(cache.len(), 1);
        let second = cache.get(&meta).unwrap();
        assert_eq!(first.version(), second.version());
    }

    #[test]
    fn test_get_missing_segment_fails() {
        let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let table = FileRefs::new();
        let mut cache = CachedReaders::new(base, table);

        let meta = SegmentMeta::new("_9", "base");
        let err = cache.get(&meta).unwrap_err();
        assert!(matches!(err, XystonError::Index(_)));
    }

    #[test]
    fn test_retain_evicts_stale() {
        let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let table = FileRefs::new();
        let meta_a = flushed("_1", &base, &table);
        let meta_b = flushed("_2", &base, &table);

        let mut cache = CachedReaders::new(Arc::clone(&base), Arc::clone(&table));
        cache.get(&meta_a).unwrap();
        cache.get(&meta_b).unwrap();

        let mut keep = AHashSet::new();
        keep.insert("_2".to_string());
        cache.retain(&keep);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&meta_b).unwrap().live_docs_count(), 1);
    }
}
