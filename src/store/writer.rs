//! Multi-writer ingest into the transaction store.
//!
//! Each writer owns its reserved DocIds and its modification queue; nothing
//! becomes visible to readers before [`StoreWriter::commit`]. Commit
//! evaluates the queued deletes against a live snapshot with
//! generation-limited visibility, then publishes the surviving documents in
//! one atomic visibility flip.

use std::sync::Arc;

use ahash::AHashMap;
use roaring::RoaringBitmap;
use tracing::warn;

use crate::doc::IndexedField;
use crate::error::Result;
use crate::filter::{Filter, IntoFilter};
use crate::index::segment_reader::FieldInfo;
use crate::store::reader::SnapshotView;
use crate::store::{ColumnInfo, DocumentEntry, TransactionStore};
use crate::types::{DocId, FIRST_DOC};
use crate::util::varint::{encode_u64, zigzag_encode};

/// A queued delete or update of one store writer.
struct StoreModification {
    /// `None` marks a request whose replacement insert failed.
    filter: Option<Arc<dyn Filter>>,

    /// Writer DocIds below this value are visible to the filter.
    generation: DocId,

    /// True for updates.
    is_update: bool,

    /// Replacement DocIds, published only when the filter matched.
    documents: RoaringBitmap,
}

#[derive(Debug, Clone, Copy)]
struct Chain {
    first: u64,
    last: u64,
}

/// Per-document build state.
struct CurrentDoc {
    doc: DocId,
    buf: Vec<u8>,
    valid: bool,
    term_chains: AHashMap<(String, Vec<u8>), Chain>,
    term_metas: AHashMap<String, Arc<FieldInfo>>,
    column_chains: AHashMap<ColumnKey, Chain>,
    column_metas: AHashMap<ColumnKey, Arc<ColumnInfo>>,
    field_positions: AHashMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ColumnKey {
    Named(String),
    Unnamed(u32),
}

impl CurrentDoc {
    fn new(doc: DocId) -> Self {
        CurrentDoc {
            doc,
            // offset 0 must never address a block: `next_ptr == 0` ends a
            // linked list
            buf: vec![0u8],
            valid: true,
            term_chains: AHashMap::new(),
            term_metas: AHashMap::new(),
            column_chains: AHashMap::new(),
            column_metas: AHashMap::new(),
            field_positions: AHashMap::new(),
        }
    }

    fn patch_next_ptr(&mut self, at: u64, value: u64) {
        let at = at as usize;
        self.buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }
}

/// A document handle passed to store insert/update closures.
pub struct StoreDocument<'a> {
    writer: &'a mut StoreWriter,
}

impl<'a> StoreDocument<'a> {
    /// Whether every operation so far succeeded.
    pub fn valid(&self) -> bool {
        self.writer
            .current
            .as_ref()
            .map(|c| c.valid)
            .unwrap_or(false)
    }

    /// Index a tokenized field.
    pub fn index(&mut self, field: &IndexedField) -> bool {
        self.writer.index_field(field)
    }

    /// Store a value into a named column.
    pub fn store(&mut self, column: &str, value: &[u8]) -> bool {
        self.writer.store_named(column, value)
    }

    /// Store a value into an unnamed column by id.
    pub fn store_unnamed(&mut self, column: u32, value: &[u8]) -> bool {
        self.writer.store_unnamed(column, value)
    }
}

/// One ingest session against a [`TransactionStore`].
pub struct StoreWriter {
    store: Arc<TransactionStore>,

    /// DocIds reserved by this writer.
    used_doc_ids: RoaringBitmap,
    /// Reserved DocIds that will become visible at commit.
    valid_doc_ids: RoaringBitmap,

    modifications: Vec<StoreModification>,

    /// Next allocation floor; keeps this writer's DocIds monotonic.
    next_doc_id: DocId,

    current: Option<CurrentDoc>,
}

impl std::fmt::Debug for StoreWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWriter")
            .field("reserved", &self.used_doc_ids.len())
            .field("pending_modifications", &self.modifications.len())
            .finish()
    }
}

impl StoreWriter {
    /// Create a writer over `store`.
    pub fn new(store: Arc<TransactionStore>) -> Self {
        StoreWriter {
            store,
            used_doc_ids: RoaringBitmap::new(),
            valid_doc_ids: RoaringBitmap::new(),
            modifications: Vec::new(),
            next_doc_id: FIRST_DOC,
            current: None,
        }
    }

    /// Number of documents this writer has staged for commit.
    pub fn staged_docs(&self) -> u64 {
        self.valid_doc_ids.len()
    }

    /// Insert one document; visible after [`StoreWriter::commit`].
    pub fn insert<F: FnOnce(&mut StoreDocument)>(&mut self, f: F) -> bool {
        if !self.begin_document() {
            return false;
        }
        {
            let mut doc = StoreDocument { writer: self };
            f(&mut doc);
        }
        self.end_document(None)
    }

    /// Replace the documents matching `filter` with one new document.
    ///
    /// The replacement is inserted optimistically; commit publishes it only
    /// if the filter matched.
    pub fn update<T: IntoFilter, F: FnOnce(&mut StoreDocument)>(
        &mut self,
        filter: T,
        f: F,
    ) -> bool {
        let update_id = self.modifications.len();
        self.modifications.push(StoreModification {
            filter: Some(filter.into_filter()),
            generation: self.next_doc_id,
            is_update: true,
            documents: RoaringBitmap::new(),
        });

        if !self.begin_document() {
            self.modifications[update_id].filter = None;
            return false;
        }
        {
            let mut doc = StoreDocument { writer: self };
            f(&mut doc);
        }
        let ok = self.end_document(Some(update_id));
        if !ok {
            self.modifications[update_id].filter = None;
        }
        ok
    }

    /// Enqueue a delete; evaluated at commit against everything visible
    /// plus this writer's earlier documents.
    pub fn remove<T: IntoFilter>(&mut self, filter: T) {
        self.modifications.push(StoreModification {
            filter: Some(filter.into_filter()),
            generation: self.next_doc_id,
            is_update: false,
            documents: RoaringBitmap::new(),
        });
    }

    fn begin_document(&mut self) -> bool {
        let doc = {
            let mut inner = self.store.inner.write();
            inner.allocate_doc_id(self.next_doc_id)
        };

        let Some(doc) = doc else {
            warn!("store document id space exhausted");
            self.current = None;
            return false;
        };

        self.used_doc_ids.insert(doc);
        self.next_doc_id = doc + 1;
        self.current = Some(CurrentDoc::new(doc));
        true
    }

    /// Finish the current document: publish its entries into the store
    /// maps and stage it for commit. An invalid document is retired.
    fn end_document(&mut self, update_id: Option<usize>) -> bool {
        let Some(current) = self.current.take() else {
            return false;
        };
        let doc = current.doc;

        if !current.valid {
            let mut inner = self.store.inner.write();
            inner.retire_doc_id(doc);
            return false;
        }

        let buf: Arc<[u8]> = Arc::from(current.buf.as_slice());
        {
            let mut inner = self.store.inner.write();

            for ((field, term), chain) in &current.term_chains {
                let meta = Arc::clone(&current.term_metas[field]);
                let entry = inner
                    .fields
                    .entry(field.clone())
                    .or_insert_with(|| crate::store::FieldEntry {
                        meta,
                        terms: AHashMap::new(),
                    });
                entry.terms.entry(term.clone()).or_default().push(DocumentEntry {
                    doc,
                    buf: Arc::clone(&buf),
                    offset: chain.first,
                });
            }

            for (key, chain) in &current.column_chains {
                let meta = Arc::clone(&current.column_metas[key]);
                let entry = DocumentEntry {
                    doc,
                    buf: Arc::clone(&buf),
                    offset: chain.first,
                };
                match key {
                    ColumnKey::Named(name) => {
                        inner
                            .columns_named
                            .entry(name.clone())
                            .or_insert_with(|| crate::store::ColumnEntry {
                                meta,
                                entries: Vec::new(),
                            })
                            .entries
                            .push(entry);
                    }
                    ColumnKey::Unnamed(id) => {
                        inner
                            .columns_unnamed
                            .entry(*id)
                            .or_insert_with(|| crate::store::ColumnEntry {
                                meta,
                                entries: Vec::new(),
                            })
                            .entries
                            .push(entry);
                    }
                }
            }
        }

        match update_id {
            Some(update_id) => {
                // replacement inserts surface only when their filter matches
                self.modifications[update_id].documents.insert(doc);
            }
            None => {
                self.valid_doc_ids.insert(doc);
            }
        }
        true
    }

    fn index_field(&mut self, field: &IndexedField) -> bool {
        let Some(meta) = self.store.ensure_field(&field.name, field.features) else {
            warn!(field = %field.name, "field features are not a subset of the indexed features");
            if let Some(current) = self.current.as_mut() {
                current.valid = false;
            }
            return false;
        };

        let Some(current) = self.current.as_mut() else {
            return false;
        };
        if !current.valid {
            return false;
        }

        let has_positions = meta.features.positions;
        let has_offsets = meta.features.offsets;
        let has_payloads = meta.features.payloads;
        current
            .term_metas
            .entry(field.name.clone())
            .or_insert_with(|| Arc::clone(&meta));

        for token in &field.tokens {
            if let Some(&last) = current.field_positions.get(&field.name) {
                if token.position < last {
                    warn!(
                        field = %field.name,
                        position = token.position,
                        last_position = last,
                        "non-monotonic token position"
                    );
                    current.valid = false;
                    return false;
                }
            }
            current
                .field_positions
                .insert(field.name.clone(), token.position);

            if let Some((start, end)) = token.offset {
                if end < start {
                    warn!(field = %field.name, start, end, "offset ends before it starts");
                    current.valid = false;
                    return false;
                }
            }

            let block_start = current.buf.len() as u64;
            current.buf.extend_from_slice(&0u64.to_le_bytes());
            if has_positions {
                current
                    .buf
                    .extend_from_slice(&encode_u64(zigzag_encode(token.position as i64)));
            }
            if has_offsets {
                let (start, end) = token.offset.unwrap_or((0, 0));
                current
                    .buf
                    .extend_from_slice(&encode_u64(zigzag_encode(start as i64)));
                current
                    .buf
                    .extend_from_slice(&encode_u64(zigzag_encode(end as i64)));
            }
            match token.payload.as_ref().filter(|_| has_payloads) {
                Some(payload) => {
                    current.buf.push(1);
                    current
                        .buf
                        .extend_from_slice(&encode_u64(payload.len() as u64));
                    current.buf.extend_from_slice(payload);
                }
                None => current.buf.push(0),
            }

            let key = (field.name.clone(), token.term.clone());
            match current.term_chains.get(&key).copied() {
                Some(chain) => {
                    current.patch_next_ptr(chain.last, block_start);
                    current.term_chains.insert(
                        key,
                        Chain {
                            first: chain.first,
                            last: block_start,
                        },
                    );
                }
                None => {
                    current.term_chains.insert(
                        key,
                        Chain {
                            first: block_start,
                            last: block_start,
                        },
                    );
                }
            }
        }

        true
    }

    fn store_named(&mut self, column: &str, value: &[u8]) -> bool {
        let meta = self.store.ensure_column(column);
        self.store_value(ColumnKey::Named(column.to_string()), meta, value)
    }

    fn store_unnamed(&mut self, column: u32, value: &[u8]) -> bool {
        let meta = {
            let inner = self.store.inner.read();
            match inner.columns_unnamed.get(&column) {
                Some(entry) => Arc::clone(&entry.meta),
                None => {
                    warn!(column, "unknown unnamed column");
                    if let Some(current) = self.current.as_mut() {
                        current.valid = false;
                    }
                    return false;
                }
            }
        };
        self.store_value(ColumnKey::Unnamed(column), meta, value)
    }

    fn store_value(&mut self, key: ColumnKey, meta: Arc<ColumnInfo>, value: &[u8]) -> bool {
        let Some(current) = self.current.as_mut() else {
            return false;
        };
        if !current.valid {
            return false;
        }

        current.buf.extend_from_slice(value);
        let block_start = current.buf.len() as u64;
        current.buf.extend_from_slice(&0u64.to_le_bytes());
        current
            .buf
            .extend_from_slice(&encode_u64(value.len() as u64));

        current.column_metas.entry(key.clone()).or_insert(meta);
        match current.column_chains.get(&key).copied() {
            Some(chain) => {
                current.patch_next_ptr(chain.last, block_start);
                current.column_chains.insert(
                    key,
                    Chain {
                        first: chain.first,
                        last: block_start,
                    },
                );
            }
            None => {
                current.column_chains.insert(
                    key,
                    Chain {
                        first: block_start,
                        last: block_start,
                    },
                );
            }
        }

        true
    }

    /// Commit this writer's staged documents and modifications.
    ///
    /// Runs under the store's commit/flush mutex: modification filters are
    /// evaluated in submission order against a snapshot whose visibility
    /// grows writer-document by generation, then the visibility flip and
    /// the DocId bookkeeping happen atomically.
    pub fn commit(&mut self) -> Result<bool> {
        let store = Arc::clone(&self.store);
        let _serialize = store.commit_flush_mutex.lock();

        let mut invalid = RoaringBitmap::new();

        if !self.modifications.is_empty() {
            // snapshot everything a filter could observe: committed docs
            // plus every document this writer reserved
            let scope = {
                let inner = store.inner.read();
                &inner.visible_docs | &self.used_doc_ids
            };
            let snapshot = store.snapshot(&scope);

            let mut documents = store.inner.read().visible_docs.clone();

            for index in 0..self.modifications.len() {
                let Some(filter) = self.modifications[index].filter.clone() else {
                    continue;
                };
                let generation = self.modifications[index].generation;

                // this writer's documents older than the request
                let mut processed = self.valid_doc_ids.clone();
                processed.remove_range(generation..);
                documents |= processed;

                let view = SnapshotView::new(&snapshot, &documents);
                let prepared = filter.prepare(&view)?;
                let mut matches = prepared.execute(&view)?;

                let mut seen = false;
                while matches.next() {
                    seen = true;
                    invalid.insert(matches.value());
                }

                documents -= &invalid;
                self.valid_doc_ids -= &invalid;

                if seen && self.modifications[index].is_update {
                    let replacements = self.modifications[index].documents.clone();
                    documents |= &replacements;
                    self.valid_doc_ids |= replacements;
                }
            }
        }

        let mut inner = store.inner.write();
        inner.generation += 1;
        inner.visible_docs |= &self.valid_doc_ids;
        inner.visible_docs -= &invalid;

        // deleted documents disappear for good
        for doc in invalid.iter() {
            inner.retire_doc_id(doc);
        }
        // reserved ids that never became visible (failed docs, unmatched
        // update placeholders) are retired as well
        let unpublished = &self.used_doc_ids - &self.valid_doc_ids;
        for doc in unpublished.iter() {
            if !inner.visible_docs.contains(doc) {
                inner.retire_doc_id(doc);
            }
        }
        drop(inner);

        self.reset_session();
        Ok(true)
    }

    fn reset_session(&mut self) {
        self.modifications.clear();
        self.used_doc_ids.clear();
        self.valid_doc_ids.clear();
        self.next_doc_id = FIRST_DOC;
        self.current = None;
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        // release reserved DocIds that never became visible
        let mut inner = self.store.inner.write();
        let abandoned = self.used_doc_ids.clone();
        for doc in abandoned.iter() {
            if !inner.visible_docs.contains(doc) {
                inner.retire_doc_id(doc);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TermFilter;

    fn store() -> Arc<TransactionStore> {
        Arc::new(TransactionStore::new())
    }

    fn insert_titles(writer: &mut StoreWriter, titles: &[&str]) {
        for title in titles {
            let ok = writer.insert(|doc| {
                doc.index(&IndexedField::text("title", title));
                doc.store("title", title.as_bytes());
            });
            assert!(ok);
        }
    }

    #[test]
    fn test_visibility_at_commit() {
        let store = store();
        let mut writer = StoreWriter::new(Arc::clone(&store));

        insert_titles(&mut writer, &["alpha", "beta"]);
        assert_eq!(store.visible_docs_count(), 0);
        assert_eq!(writer.staged_docs(), 2);

        writer.commit().unwrap();
        assert_eq!(store.visible_docs_count(), 2);
        assert_eq!(writer.staged_docs(), 0);
    }

    #[test]
    fn test_uncommitted_docs_released_on_drop() {
        let store = store();
        {
            let mut writer = StoreWriter::new(Arc::clone(&store));
            insert_titles(&mut writer, &["alpha"]);
        }
        assert_eq!(store.visible_docs_count(), 0);
        assert!(store.inner.read().retired_doc_ids.contains(FIRST_DOC));
    }

    #[test]
    fn test_remove_before_insert_does_not_match() {
        let store = store();
        let mut writer = StoreWriter::new(Arc::clone(&store));

        writer.remove(TermFilter::new("title", "alpha"));
        insert_titles(&mut writer, &["alpha"]);
        writer.commit().unwrap();

        // the delete was submitted before the insert, so it never saw it
        assert_eq!(store.visible_docs_count(), 1);
    }

    #[test]
    fn test_insert_then_remove_matches() {
        let store = store();
        let mut writer = StoreWriter::new(Arc::clone(&store));

        insert_titles(&mut writer, &["alpha"]);
        writer.remove(TermFilter::new("title", "alpha"));
        writer.commit().unwrap();

        assert_eq!(store.visible_docs_count(), 0);
    }

    #[test]
    fn test_update_matching_replaces() {
        let store = store();
        let mut writer = StoreWriter::new(Arc::clone(&store));
        insert_titles(&mut writer, &["alpha"]);
        writer.commit().unwrap();

        let mut writer = StoreWriter::new(Arc::clone(&store));
        let ok = writer.update(TermFilter::new("title", "alpha"), |doc| {
            doc.index(&IndexedField::text("title", "alpha2"));
        });
        assert!(ok);
        writer.commit().unwrap();

        assert_eq!(store.visible_docs_count(), 1);
        let reader = store.reader();
        use crate::index::segment_reader::SubReader;
        assert!(reader.term_docs("title", b"alpha").unwrap_or_default().is_empty());
        assert_eq!(reader.term_docs("title", b"alpha2").map(|d| d.len()), Some(1));
    }

    #[test]
    fn test_update_without_match_discards_replacement() {
        let store = store();
        let mut writer = StoreWriter::new(Arc::clone(&store));

        let ok = writer.update(TermFilter::new("title", "missing"), |doc| {
            doc.index(&IndexedField::text("title", "ghost"));
        });
        assert!(ok);
        writer.commit().unwrap();

        assert_eq!(store.visible_docs_count(), 0);
    }

    #[test]
    fn test_invalid_document_is_discarded() {
        let store = store();
        let mut writer = StoreWriter::new(Arc::clone(&store));

        let ok = writer.insert(|doc| {
            doc.index(&IndexedField::new(
                "body",
                crate::types::FieldFeatures::TEXT,
                vec![
                    crate::doc::Token::new("b", 9),
                    crate::doc::Token::new("a", 3),
                ],
            ));
        });
        assert!(!ok);
        writer.commit().unwrap();
        assert_eq!(store.visible_docs_count(), 0);
    }

    #[test]
    fn test_multi_writer_ids_disjoint() {
        let store = store();
        let mut first = StoreWriter::new(Arc::clone(&store));
        let mut second = StoreWriter::new(Arc::clone(&store));

        assert!(first.insert(|doc| {
            doc.index(&IndexedField::text("title", "one"));
        }));
        assert!(second.insert(|doc| {
            doc.index(&IndexedField::text("title", "two"));
        }));

        let first_ids = first.used_doc_ids.clone();
        let second_ids = second.used_doc_ids.clone();
        assert!(first_ids.is_disjoint(&second_ids));

        first.commit().unwrap();
        second.commit().unwrap();
        assert_eq!(store.visible_docs_count(), 2);
    }
}
