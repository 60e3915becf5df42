//! Immutable segment readers.
//!
//! A [`SegmentReader`] loads one flushed segment fully into memory through
//! the codec readers, applies the version-stamped document mask and pins
//! every observed file so the directory cleaner never removes a file a live
//! reader depends on. The [`SubReader`] trait is the read surface consumed
//! by filters, the merge writer and `import`.

use std::sync::Arc;

use ahash::AHashMap;
use roaring::RoaringBitmap;

use crate::codec::{self, ColumnData, FieldPostings, PostingDoc};
use crate::error::{Result, XystonError};
use crate::index::file_refs::{FileRef, FileRefs};
use crate::index::meta::{IndexMeta, SegmentMeta};
use crate::storage::Storage;
use crate::types::{DocId, FieldFeatures, FIRST_DOC};

/// Descriptor of one indexed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,
    /// Features the field's postings carry.
    pub features: FieldFeatures,
}

/// One term with its (live) postings.
#[derive(Debug, Clone)]
pub struct TermPostings {
    /// Term bytes.
    pub term: Vec<u8>,
    /// Live documents containing the term, in doc order.
    pub docs: Vec<PostingDoc>,
}

/// Read surface over one segment-shaped unit of documents.
///
/// Implementations are fully materialized in memory; accessor methods hand
/// out owned snapshots filtered to live documents.
pub trait SubReader: Send + Sync {
    /// Total documents, including masked ones.
    fn docs_count(&self) -> u64;

    /// Documents not hidden by the mask.
    fn live_docs_count(&self) -> u64;

    /// Snapshot of the live DocId set.
    fn live_docs(&self) -> RoaringBitmap;

    /// All indexed fields.
    fn fields(&self) -> Vec<FieldInfo>;

    /// All terms of a field with their live postings, in term order.
    fn terms(&self, field: &str) -> Vec<TermPostings>;

    /// Live documents containing `term` in `field`, in doc order.
    fn term_docs(&self, field: &str, term: &[u8]) -> Option<Vec<DocId>>;

    /// All stored column names.
    fn columns(&self) -> Vec<String>;

    /// Live entries of a column, in doc order.
    fn column_entries(&self, column: &str) -> Vec<(DocId, Vec<Vec<u8>>)>;

    /// First stored value of `column` for a live document.
    fn stored_value(&self, doc: DocId, column: &str) -> Option<Vec<u8>>;
}

/// Composite read surface over a set of sub-readers.
pub trait IndexReader: Send + Sync {
    /// The segment-shaped units of this reader.
    fn sub_readers(&self) -> Vec<Arc<dyn SubReader>>;

    /// Total live documents across sub-readers.
    fn live_docs_count(&self) -> u64 {
        self.sub_readers().iter().map(|r| r.live_docs_count()).sum()
    }

    /// Total documents across sub-readers.
    fn docs_count(&self) -> u64 {
        self.sub_readers().iter().map(|r| r.docs_count()).sum()
    }
}

struct SegmentReaderInner {
    meta: SegmentMeta,
    fields: Vec<FieldPostings>,
    field_index: AHashMap<String, usize>,
    columns: Vec<ColumnData>,
    column_index: AHashMap<String, usize>,
    docs_mask: RoaringBitmap,
    live_docs: RoaringBitmap,
    // pins every file this reader observed
    _refs: Vec<FileRef>,
}

/// A cheaply cloneable reader over one immutable segment.
#[derive(Clone)]
pub struct SegmentReader {
    inner: Arc<SegmentReaderInner>,
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("segment", &self.inner.meta.name)
            .field("version", &self.inner.meta.version)
            .field("docs_count", &self.inner.meta.docs_count)
            .field("live_docs_count", &self.live_docs_count())
            .finish()
    }
}

impl SegmentReader {
    /// Open a segment, pinning its files in the shared refcount table.
    pub fn open(
        storage: &Arc<dyn Storage>,
        table: &Arc<FileRefs>,
        meta: &SegmentMeta,
    ) -> Result<SegmentReader> {
        let codec = codec::codec_for(&meta.codec).ok_or_else(|| {
            XystonError::index(format!("unknown codec '{}' in segment '{}'", meta.codec, meta.name))
        })?;

        // pin before touching any file
        let mut refs: Vec<FileRef> = meta.files.iter().map(|f| table.reference(f)).collect();
        refs.push(table.reference(&codec::segment_meta_file_name(&meta.name)));

        let fields = codec.postings_reader().read(storage.as_ref(), &meta.name)?;
        let columns = codec
            .columnstore_reader()
            .read(storage.as_ref(), &meta.name)?;
        let docs_mask = codec
            .document_mask_reader()
            .read(storage.as_ref(), meta)?
            .unwrap_or_default();

        let mut live_docs = RoaringBitmap::new();
        if meta.docs_count > 0 {
            live_docs.insert_range(FIRST_DOC..FIRST_DOC + meta.docs_count as u32);
        }
        live_docs -= &docs_mask;

        let field_index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        let column_index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();

        Ok(SegmentReader {
            inner: Arc::new(SegmentReaderInner {
                meta: meta.clone(),
                fields,
                field_index,
                columns,
                column_index,
                docs_mask,
                live_docs,
                _refs: refs,
            }),
        })
    }

    /// Return a reader for the given meta, reusing this one when the
    /// version is unchanged.
    pub fn reopen(
        &self,
        storage: &Arc<dyn Storage>,
        table: &Arc<FileRefs>,
        meta: &SegmentMeta,
    ) -> Result<SegmentReader> {
        if self.inner.meta.name == meta.name && self.inner.meta.version == meta.version {
            return Ok(self.clone());
        }
        SegmentReader::open(storage, table, meta)
    }

    /// The segment meta this reader was opened with.
    pub fn meta(&self) -> &SegmentMeta {
        &self.inner.meta
    }

    /// The mask version this reader observes.
    pub fn version(&self) -> u64 {
        self.inner.meta.version
    }

    /// The document mask this reader observes.
    pub fn docs_mask(&self) -> &RoaringBitmap {
        &self.inner.docs_mask
    }
}

impl SubReader for SegmentReader {
    fn docs_count(&self) -> u64 {
        self.inner.meta.docs_count
    }

    fn live_docs_count(&self) -> u64 {
        self.inner.live_docs.len()
    }

    fn live_docs(&self) -> RoaringBitmap {
        self.inner.live_docs.clone()
    }

    fn fields(&self) -> Vec<FieldInfo> {
        self.inner
            .fields
            .iter()
            .map(|f| FieldInfo {
                name: f.name.clone(),
                features: f.features,
            })
            .collect()
    }

    fn terms(&self, field: &str) -> Vec<TermPostings> {
        let Some(&index) = self.inner.field_index.get(field) else {
            return Vec::new();
        };

        self.inner.fields[index]
            .terms
            .iter()
            .filter_map(|(term, docs)| {
                let live: Vec<PostingDoc> = docs
                    .iter()
                    .filter(|d| self.inner.live_docs.contains(d.doc))
                    .cloned()
                    .collect();
                if live.is_empty() {
                    None
                } else {
                    Some(TermPostings {
                        term: term.clone(),
                        docs: live,
                    })
                }
            })
            .collect()
    }

    fn term_docs(&self, field: &str, term: &[u8]) -> Option<Vec<DocId>> {
        let &index = self.inner.field_index.get(field)?;
        let docs = self.inner.fields[index].terms.get(term)?;
        Some(
            docs.iter()
                .map(|d| d.doc)
                .filter(|d| self.inner.live_docs.contains(*d))
                .collect(),
        )
    }

    fn columns(&self) -> Vec<String> {
        self.inner.columns.iter().map(|c| c.name.clone()).collect()
    }

    fn column_entries(&self, column: &str) -> Vec<(DocId, Vec<Vec<u8>>)> {
        let Some(&index) = self.inner.column_index.get(column) else {
            return Vec::new();
        };
        self.inner.columns[index]
            .entries
            .iter()
            .filter(|(doc, _)| self.inner.live_docs.contains(*doc))
            .cloned()
            .collect()
    }

    fn stored_value(&self, doc: DocId, column: &str) -> Option<Vec<u8>> {
        if !self.inner.live_docs.contains(doc) {
            return None;
        }
        let &index = self.inner.column_index.get(column)?;
        let entries = &self.inner.columns[index].entries;
        let position = entries.binary_search_by_key(&doc, |(d, _)| *d).ok()?;
        entries[position].1.first().cloned()
    }
}

/// Read-side composite over the latest committed index meta.
#[derive(Debug)]
pub struct DirectoryReader {
    meta: IndexMeta,
    segments: Vec<SegmentReader>,
}

impl DirectoryReader {
    /// Open readers over every live segment of `meta`.
    pub fn open(
        storage: &Arc<dyn Storage>,
        table: &Arc<FileRefs>,
        meta: &IndexMeta,
    ) -> Result<DirectoryReader> {
        let mut segments = Vec::with_capacity(meta.segments.len());
        for segment in &meta.segments {
            segments.push(SegmentReader::open(storage, table, &segment.meta)?);
        }
        Ok(DirectoryReader {
            meta: meta.clone(),
            segments,
        })
    }

    /// Open the latest committed meta found in `storage`.
    pub fn open_latest(
        storage: &Arc<dyn Storage>,
        table: &Arc<FileRefs>,
        codec: &Arc<dyn codec::Codec>,
    ) -> Result<DirectoryReader> {
        let reader = codec.index_meta_reader();
        let filename = reader
            .last_segments_file(storage.as_ref())?
            .ok_or_else(|| XystonError::file_not_found("segments_*"))?;
        let meta = reader.read(storage.as_ref(), &filename)?;
        DirectoryReader::open(storage, table, &meta)
    }

    /// The meta this reader observes.
    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    /// Per-segment readers.
    pub fn segments(&self) -> &[SegmentReader] {
        &self.segments
    }

    /// Look up the live documents matching an exact term across segments,
    /// returned as `(segment, doc)` pairs.
    pub fn term_matches(&self, field: &str, term: &[u8]) -> Vec<(&SegmentReader, DocId)> {
        let mut matches = Vec::new();
        for segment in &self.segments {
            if let Some(docs) = segment.term_docs(field, term) {
                matches.extend(docs.into_iter().map(|doc| (segment, doc)));
            }
        }
        matches
    }
}

impl IndexReader for DirectoryReader {
    fn sub_readers(&self) -> Vec<Arc<dyn SubReader>> {
        self.segments
            .iter()
            .map(|s| Arc::new(s.clone()) as Arc<dyn SubReader>)
            .collect()
    }
}
