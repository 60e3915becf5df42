//! Readers over the transaction store.
//!
//! A [`StoreReader`] is a materialized snapshot of the store's visible
//! documents; it keeps serving its snapshot no matter what commits later.
//! [`SnapshotView`] is the borrowed equivalent used during writer commits,
//! where the visible set evolves between filter evaluations.

use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::codec::PostingDoc;
use crate::index::segment_reader::{FieldInfo, IndexReader, SubReader, TermPostings};
use crate::store::{
    decode_column_values, decode_postings, snapshot_locked, StoreSnapshot, TransactionStore,
};
use crate::types::DocId;

/// A borrowed view over a snapshot with an explicit visibility set.
pub(crate) struct SnapshotView<'a> {
    snapshot: &'a StoreSnapshot,
    documents: &'a RoaringBitmap,
}

impl<'a> SnapshotView<'a> {
    pub(crate) fn new(snapshot: &'a StoreSnapshot, documents: &'a RoaringBitmap) -> Self {
        SnapshotView {
            snapshot,
            documents,
        }
    }
}

impl SubReader for SnapshotView<'_> {
    fn docs_count(&self) -> u64 {
        self.documents.max().unwrap_or(0) as u64
    }

    fn live_docs_count(&self) -> u64 {
        self.documents.len()
    }

    fn live_docs(&self) -> RoaringBitmap {
        self.documents.clone()
    }

    fn fields(&self) -> Vec<FieldInfo> {
        self.snapshot
            .fields
            .values()
            .map(|(meta, _)| FieldInfo {
                name: meta.name.clone(),
                features: meta.features,
            })
            .collect()
    }

    fn terms(&self, field: &str) -> Vec<TermPostings> {
        let Some((meta, terms)) = self.snapshot.fields.get(field) else {
            return Vec::new();
        };

        terms
            .iter()
            .filter_map(|(term, entries)| {
                let docs: Vec<PostingDoc> = entries
                    .iter()
                    .filter(|entry| self.documents.contains(entry.doc))
                    .map(|entry| PostingDoc {
                        doc: entry.doc,
                        positions: decode_postings(entry, &meta.features),
                    })
                    .collect();
                if docs.is_empty() {
                    None
                } else {
                    Some(TermPostings {
                        term: term.clone(),
                        docs,
                    })
                }
            })
            .collect()
    }

    fn term_docs(&self, field: &str, term: &[u8]) -> Option<Vec<DocId>> {
        let (_, terms) = self.snapshot.fields.get(field)?;
        let entries = terms.get(term)?;
        Some(
            entries
                .iter()
                .map(|entry| entry.doc)
                .filter(|doc| self.documents.contains(*doc))
                .collect(),
        )
    }

    fn columns(&self) -> Vec<String> {
        self.snapshot.columns_named.keys().cloned().collect()
    }

    fn column_entries(&self, column: &str) -> Vec<(DocId, Vec<Vec<u8>>)> {
        let Some((_, entries)) = self.snapshot.columns_named.get(column) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|entry| self.documents.contains(entry.doc))
            .map(|entry| (entry.doc, decode_column_values(entry)))
            .collect()
    }

    fn stored_value(&self, doc: DocId, column: &str) -> Option<Vec<u8>> {
        if !self.documents.contains(doc) {
            return None;
        }
        let (_, entries) = self.snapshot.columns_named.get(column)?;
        let position = entries.binary_search_by_key(&doc, |entry| entry.doc).ok()?;
        decode_column_values(&entries[position]).into_iter().next()
    }
}

struct StoreReaderInner {
    store: Arc<TransactionStore>,
    snapshot: StoreSnapshot,
    documents: RoaringBitmap,
    generation: u64,
}

/// A cheaply cloneable snapshot reader over the store's visible documents.
#[derive(Clone)]
pub struct StoreReader {
    inner: Arc<StoreReaderInner>,
}

impl std::fmt::Debug for StoreReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreReader")
            .field("generation", &self.inner.generation)
            .field("live_docs", &self.inner.documents.len())
            .finish()
    }
}

impl StoreReader {
    /// Snapshot the currently visible documents of `store`.
    pub(crate) fn open(store: &Arc<TransactionStore>) -> StoreReader {
        let (snapshot, documents, generation) = {
            let inner = store.inner.read();
            let documents = inner.visible_docs.clone();
            let snapshot = snapshot_locked(&inner, &documents);
            (snapshot, documents, inner.generation)
        };

        StoreReader {
            inner: Arc::new(StoreReaderInner {
                store: Arc::clone(store),
                snapshot,
                documents,
                generation,
            }),
        }
    }

    /// The store generation this snapshot was taken at.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// The visible DocId set of this snapshot.
    pub fn documents(&self) -> &RoaringBitmap {
        &self.inner.documents
    }

    /// Return a reader over the current store state, reusing this snapshot
    /// when nothing changed.
    pub fn reopen(&self) -> StoreReader {
        if self.inner.store.generation() == self.inner.generation {
            return self.clone();
        }
        StoreReader::open(&self.inner.store)
    }

    /// Values of an unnamed column for the snapshot's documents.
    pub fn unnamed_column_entries(&self, column: u32) -> Vec<(DocId, Vec<Vec<u8>>)> {
        let Some(entries) = self.inner.snapshot.columns_unnamed.get(&column) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|entry| self.inner.documents.contains(entry.doc))
            .map(|entry| (entry.doc, decode_column_values(entry)))
            .collect()
    }

    fn view(&self) -> SnapshotView<'_> {
        SnapshotView::new(&self.inner.snapshot, &self.inner.documents)
    }
}

impl SubReader for StoreReader {
    fn docs_count(&self) -> u64 {
        self.view().docs_count()
    }

    fn live_docs_count(&self) -> u64 {
        self.view().live_docs_count()
    }

    fn live_docs(&self) -> RoaringBitmap {
        self.inner.documents.clone()
    }

    fn fields(&self) -> Vec<FieldInfo> {
        self.view().fields()
    }

    fn terms(&self, field: &str) -> Vec<TermPostings> {
        self.view().terms(field)
    }

    fn term_docs(&self, field: &str, term: &[u8]) -> Option<Vec<DocId>> {
        self.view().term_docs(field, term)
    }

    fn columns(&self) -> Vec<String> {
        self.view().columns()
    }

    fn column_entries(&self, column: &str) -> Vec<(DocId, Vec<Vec<u8>>)> {
        self.view().column_entries(column)
    }

    fn stored_value(&self, doc: DocId, column: &str) -> Option<Vec<u8>> {
        self.view().stored_value(doc, column)
    }
}

impl IndexReader for StoreReader {
    fn sub_readers(&self) -> Vec<Arc<dyn SubReader>> {
        vec![Arc::new(self.clone()) as Arc<dyn SubReader>]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{IndexedField, Token};
    use crate::store::StoreWriter;
    use crate::types::FieldFeatures;

    fn populated_store() -> Arc<TransactionStore> {
        let store = Arc::new(TransactionStore::new());
        let mut writer = StoreWriter::new(Arc::clone(&store));
        for title in ["alpha", "beta", "gamma"] {
            assert!(writer.insert(|doc| {
                doc.index(&IndexedField::text("title", title));
                doc.store("title", title.as_bytes());
            }));
        }
        writer.commit().unwrap();
        store
    }

    #[test]
    fn test_reader_surfaces_postings_and_columns() {
        let store = populated_store();
        let reader = store.reader();

        assert_eq!(SubReader::live_docs_count(&reader), 3);
        assert_eq!(reader.term_docs("title", b"beta"), Some(vec![2]));

        let terms = reader.terms("title");
        assert_eq!(terms.len(), 3);
        let beta = terms.iter().find(|t| t.term == b"beta".to_vec()).unwrap();
        assert_eq!(beta.docs[0].positions.len(), 1);
        assert_eq!(beta.docs[0].positions[0].position, 0);
        assert_eq!(beta.docs[0].positions[0].offset, Some((0, 4)));

        assert_eq!(reader.stored_value(2, "title"), Some(b"beta".to_vec()));
        assert_eq!(reader.columns(), vec!["title".to_string()]);
    }

    #[test]
    fn test_snapshot_isolation() {
        let store = populated_store();
        let reader = store.reader();

        let mut writer = StoreWriter::new(Arc::clone(&store));
        assert!(writer.insert(|doc| {
            doc.index(&IndexedField::text("title", "delta"));
        }));
        writer.commit().unwrap();

        // the snapshot still sees three documents
        assert_eq!(SubReader::live_docs_count(&reader), 3);
        assert!(reader.term_docs("title", b"delta").is_none());

        let reopened = reader.reopen();
        assert_eq!(SubReader::live_docs_count(&reopened), 4);
    }

    #[test]
    fn test_reopen_unchanged_is_shared() {
        let store = populated_store();
        let reader = store.reader();
        let again = reader.reopen();
        assert!(Arc::ptr_eq(&reader.inner, &again.inner));
    }

    #[test]
    fn test_term_frequency_via_linked_list() {
        let store = Arc::new(TransactionStore::new());
        let mut writer = StoreWriter::new(Arc::clone(&store));
        assert!(writer.insert(|doc| {
            doc.index(&IndexedField::text("body", "spam ham spam"));
        }));
        writer.commit().unwrap();

        let reader = store.reader();
        let terms = reader.terms("body");
        let spam = terms.iter().find(|t| t.term == b"spam".to_vec()).unwrap();
        // two occurrences decoded in insertion order
        assert_eq!(spam.docs[0].positions.len(), 2);
        assert_eq!(spam.docs[0].positions[0].position, 0);
        assert_eq!(spam.docs[0].positions[1].position, 2);
    }

    #[test]
    fn test_payload_roundtrip() {
        let store = Arc::new(TransactionStore::new());
        let mut writer = StoreWriter::new(Arc::clone(&store));

        let features = FieldFeatures {
            frequency: true,
            positions: true,
            offsets: false,
            payloads: true,
        };
        assert!(writer.insert(|doc| {
            doc.index(&IndexedField::new(
                "tagged",
                features,
                vec![Token::new("x", 0).with_payload(b"p0".to_vec())],
            ));
        }));
        writer.commit().unwrap();

        let reader = store.reader();
        let terms = reader.terms("tagged");
        assert_eq!(
            terms[0].docs[0].positions[0].payload,
            Some(b"p0".to_vec())
        );
    }

    #[test]
    fn test_multi_value_column() {
        let store = Arc::new(TransactionStore::new());
        let mut writer = StoreWriter::new(Arc::clone(&store));
        assert!(writer.insert(|doc| {
            doc.index(&IndexedField::text("title", "x"));
            doc.store("tags", b"red");
            doc.store("tags", b"blue");
        }));
        writer.commit().unwrap();

        let reader = store.reader();
        let entries = reader.column_entries("tags");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, vec![b"red".to_vec(), b"blue".to_vec()]);
    }

    #[test]
    fn test_unnamed_column() {
        let store = Arc::new(TransactionStore::new());
        let column = store.create_unnamed_column();

        let mut writer = StoreWriter::new(Arc::clone(&store));
        assert!(writer.insert(|doc| {
            doc.index(&IndexedField::text("title", "x"));
            doc.store_unnamed(column, b"aux");
        }));
        writer.commit().unwrap();

        let reader = store.reader();
        let entries = reader.unnamed_column_entries(column);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, vec![b"aux".to_vec()]);
    }
}
