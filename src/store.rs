//! Transactional in-memory index.
//!
//! The transaction store mirrors the on-disk data model (fields, terms,
//! postings, columns and a document bitmap) entirely in RAM, providing
//! linearizable multi-writer ingest with visibility at commit. It is
//! periodically drained into an [`crate::index::writer::IndexWriter`] as one
//! imported segment.
//!
//! Postings and column values live in per-document byte buffers holding
//! explicit linked lists:
//!
//! - a posting occurrence is `next_ptr:u64`, a zig-zag position (when the
//!   field records positions), zig-zag start/end offsets (when it records
//!   offsets), a payload flag byte and an optional length-prefixed payload;
//! - a column value is the value bytes followed by `next_ptr:u64` and the
//!   value length as a varint.
//!
//! `next_ptr` is an absolute buffer offset; `0` terminates the list, which
//! is why every buffer starts with one reserved byte.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;

use crate::codec::PostingPosition;
use crate::error::Result;
use crate::index::segment_reader::FieldInfo;
use crate::index::writer::IndexWriter;
use crate::types::{ColumnId, DocId, FieldFeatures, EOF_DOC};
use crate::util::varint::{decode_u64, zigzag_decode};

pub mod reader;
pub mod writer;

pub use reader::StoreReader;
pub use writer::{StoreDocument, StoreWriter};

/// Descriptor of one stored column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name; `None` for unnamed (id-only) columns.
    pub name: Option<String>,
    /// Store-assigned column id.
    pub id: ColumnId,
}

/// One published `(document, buffer, offset)` triple. `offset` points at
/// the first linked-list block for the document in `buf`.
#[derive(Debug, Clone)]
pub struct DocumentEntry {
    /// The document.
    pub doc: DocId,
    /// The frozen per-document buffer.
    pub buf: Arc<[u8]>,
    /// Offset of the first block.
    pub offset: u64,
}

#[derive(Debug)]
pub(crate) struct FieldEntry {
    pub meta: Arc<FieldInfo>,
    pub terms: AHashMap<Vec<u8>, Vec<DocumentEntry>>,
}

#[derive(Debug)]
pub(crate) struct ColumnEntry {
    pub meta: Arc<ColumnInfo>,
    pub entries: Vec<DocumentEntry>,
}

/// Everything behind the store's read/write lock.
#[derive(Debug, Default)]
pub(crate) struct StoreInner {
    pub fields: AHashMap<String, FieldEntry>,
    pub columns_named: AHashMap<String, ColumnEntry>,
    pub columns_unnamed: AHashMap<ColumnId, ColumnEntry>,

    /// Allocated DocIds (not yet reusable).
    pub used_doc_ids: RoaringBitmap,
    /// Allocated DocIds that may still become visible.
    pub valid_doc_ids: RoaringBitmap,
    /// DocIds visible to readers.
    pub visible_docs: RoaringBitmap,
    /// DocIds awaiting entry garbage collection before reuse.
    pub retired_doc_ids: RoaringBitmap,

    /// Released DocIds eligible for reallocation, ordered.
    pub free_doc_ids: BTreeSet<DocId>,
    /// Highest DocId ever allocated.
    pub doc_high_water: DocId,

    pub used_column_ids: RoaringBitmap,

    /// Bumped on every visibility change.
    pub generation: u64,
}

impl StoreInner {
    /// Allocate the lowest unused DocId not below `min`.
    ///
    /// Per-writer monotonicity (`min` = the writer's last id + 1) is what
    /// makes generation-limited delete visibility sound.
    pub fn allocate_doc_id(&mut self, min: DocId) -> Option<DocId> {
        let candidate = self
            .free_doc_ids
            .range(min..)
            .next()
            .copied()
            .filter(|id| *id < EOF_DOC);

        let doc = match candidate {
            Some(id) => {
                self.free_doc_ids.remove(&id);
                id
            }
            None => {
                let next = self.doc_high_water.max(min.saturating_sub(1)) + 1;
                if next >= EOF_DOC {
                    return None;
                }
                next
            }
        };

        self.doc_high_water = self.doc_high_water.max(doc);
        self.used_doc_ids.insert(doc);
        self.valid_doc_ids.insert(doc);
        Some(doc)
    }

    /// Retire a DocId: invisible immediately, reusable after the next
    /// flush has garbage-collected its entries.
    pub fn retire_doc_id(&mut self, doc: DocId) {
        self.valid_doc_ids.remove(doc);
        self.visible_docs.remove(doc);
        self.retired_doc_ids.insert(doc);
    }

    fn allocate_column_id(&mut self) -> ColumnId {
        let mut id = 0;
        while self.used_column_ids.contains(id) {
            id += 1;
        }
        self.used_column_ids.insert(id);
        id
    }
}

/// A materialized, ordered snapshot of the store's maps, filtered to one
/// document set.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub(crate) fields: BTreeMap<String, (Arc<FieldInfo>, BTreeMap<Vec<u8>, Vec<DocumentEntry>>)>,
    pub(crate) columns_named: BTreeMap<String, (Arc<ColumnInfo>, Vec<DocumentEntry>)>,
    pub(crate) columns_unnamed: BTreeMap<ColumnId, Vec<DocumentEntry>>,
}

/// The transactional in-memory index.
pub struct TransactionStore {
    pub(crate) inner: RwLock<StoreInner>,
    /// Serializes writer commits with [`TransactionStore::flush`].
    pub(crate) commit_flush_mutex: Mutex<()>,
}

impl std::fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("TransactionStore")
            .field("generation", &inner.generation)
            .field("visible_docs", &inner.visible_docs.len())
            .field("fields", &inner.fields.len())
            .finish()
    }
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        TransactionStore {
            inner: RwLock::new(StoreInner::default()),
            commit_flush_mutex: Mutex::new(()),
        }
    }

    /// Current store generation.
    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    /// Number of documents visible to readers.
    pub fn visible_docs_count(&self) -> u64 {
        self.inner.read().visible_docs.len()
    }

    /// Resolve (or create) a field, enforcing feature compatibility.
    ///
    /// Returns `None` when the requested features are not a subset of the
    /// features the field was first indexed with.
    pub(crate) fn ensure_field(
        &self,
        name: &str,
        features: FieldFeatures,
    ) -> Option<Arc<FieldInfo>> {
        let mut inner = self.inner.write();
        match inner.fields.get(name) {
            Some(entry) => {
                if features.is_subset_of(&entry.meta.features) {
                    Some(Arc::clone(&entry.meta))
                } else {
                    None
                }
            }
            None => {
                let meta = Arc::new(FieldInfo {
                    name: name.to_string(),
                    features,
                });
                inner.fields.insert(
                    name.to_string(),
                    FieldEntry {
                        meta: Arc::clone(&meta),
                        terms: AHashMap::new(),
                    },
                );
                Some(meta)
            }
        }
    }

    /// Resolve (or create) a named column.
    pub(crate) fn ensure_column(&self, name: &str) -> Arc<ColumnInfo> {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.columns_named.get(name) {
            return Arc::clone(&entry.meta);
        }
        let id = inner.allocate_column_id();
        let meta = Arc::new(ColumnInfo {
            name: Some(name.to_string()),
            id,
        });
        inner.columns_named.insert(
            name.to_string(),
            ColumnEntry {
                meta: Arc::clone(&meta),
                entries: Vec::new(),
            },
        );
        meta
    }

    /// Create a fresh unnamed column and return its id.
    pub fn create_unnamed_column(&self) -> ColumnId {
        let mut inner = self.inner.write();
        let id = inner.allocate_column_id();
        inner.columns_unnamed.insert(
            id,
            ColumnEntry {
                meta: Arc::new(ColumnInfo { name: None, id }),
                entries: Vec::new(),
            },
        );
        id
    }

    /// Materialize the store's maps filtered to `documents`.
    pub(crate) fn snapshot(&self, documents: &RoaringBitmap) -> StoreSnapshot {
        let inner = self.inner.read();
        snapshot_locked(&inner, documents)
    }

    /// Open a reader over the currently visible documents.
    pub fn reader(self: &Arc<Self>) -> StoreReader {
        StoreReader::open(self)
    }

    /// Drain every visible document into `writer` as one imported segment,
    /// then retract the flushed DocIds and garbage-collect empty entries.
    pub fn flush(self: &Arc<Self>, writer: &IndexWriter) -> Result<bool> {
        let _serialize = self.commit_flush_mutex.lock();

        let reader = self.reader();
        if !writer.import(&reader)? {
            return Ok(false);
        }

        let flushed = reader.documents().clone();
        let mut inner = self.inner.write();
        inner.generation += 1;
        inner.used_doc_ids -= &flushed;
        inner.valid_doc_ids -= &flushed;
        inner.visible_docs -= &flushed;

        // sweep entries of flushed and retired documents
        let keep = inner.used_doc_ids.clone() - inner.retired_doc_ids.clone();

        inner.fields.retain(|_, field| {
            field
                .terms
                .retain(|_, entries| {
                    entries.retain(|entry| keep.contains(entry.doc));
                    !entries.is_empty()
                });
            !field.terms.is_empty()
        });

        let mut released_columns = Vec::new();
        inner.columns_named.retain(|_, column| {
            column.entries.retain(|entry| keep.contains(entry.doc));
            if column.entries.is_empty() {
                released_columns.push(column.meta.id);
                false
            } else {
                true
            }
        });
        inner.columns_unnamed.retain(|_, column| {
            column.entries.retain(|entry| keep.contains(entry.doc));
            if column.entries.is_empty() {
                released_columns.push(column.meta.id);
                false
            } else {
                true
            }
        });
        for id in released_columns {
            inner.used_column_ids.remove(id);
        }

        // retired ids have no entries left; make them reusable
        let retired = std::mem::take(&mut inner.retired_doc_ids);
        for doc in retired {
            inner.used_doc_ids.remove(doc);
            inner.free_doc_ids.insert(doc);
        }
        for doc in flushed {
            inner.free_doc_ids.insert(doc);
        }

        Ok(true)
    }
}

pub(crate) fn snapshot_locked(inner: &StoreInner, documents: &RoaringBitmap) -> StoreSnapshot {
    let mut snapshot = StoreSnapshot::default();

    for (name, field) in &inner.fields {
        let mut terms = BTreeMap::new();
        for (term, entries) in &field.terms {
            let mut live: Vec<DocumentEntry> = entries
                .iter()
                .filter(|entry| documents.contains(entry.doc))
                .cloned()
                .collect();
            if live.is_empty() {
                continue;
            }
            live.sort_by_key(|entry| entry.doc);
            terms.insert(term.clone(), live);
        }
        if !terms.is_empty() {
            snapshot
                .fields
                .insert(name.clone(), (Arc::clone(&field.meta), terms));
        }
    }

    for (name, column) in &inner.columns_named {
        let mut live: Vec<DocumentEntry> = column
            .entries
            .iter()
            .filter(|entry| documents.contains(entry.doc))
            .cloned()
            .collect();
        if live.is_empty() {
            continue;
        }
        live.sort_by_key(|entry| entry.doc);
        snapshot
            .columns_named
            .insert(name.clone(), (Arc::clone(&column.meta), live));
    }

    for (id, column) in &inner.columns_unnamed {
        let mut live: Vec<DocumentEntry> = column
            .entries
            .iter()
            .filter(|entry| documents.contains(entry.doc))
            .cloned()
            .collect();
        if live.is_empty() {
            continue;
        }
        live.sort_by_key(|entry| entry.doc);
        snapshot.columns_unnamed.insert(*id, live);
    }

    snapshot
}

// ---------------------------------------------------------------------------
// buffer decoding
// ---------------------------------------------------------------------------

fn read_u64_at(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Decode the linked posting list of one `(term, document)` entry.
pub(crate) fn decode_postings(entry: &DocumentEntry, features: &FieldFeatures) -> Vec<PostingPosition> {
    let buf: &[u8] = &entry.buf;
    let mut occurrences = Vec::new();
    let mut offset = entry.offset as usize;

    loop {
        let Some(next) = read_u64_at(buf, offset) else {
            break;
        };
        let mut cursor = offset + 8;

        let mut occurrence = PostingPosition::default();
        if features.positions {
            let Ok((raw, read)) = decode_u64(&buf[cursor..]) else {
                break;
            };
            cursor += read;
            occurrence.position = zigzag_decode(raw) as u32;
        }
        if features.offsets {
            let Ok((start, read)) = decode_u64(&buf[cursor..]) else {
                break;
            };
            cursor += read;
            let Ok((end, read)) = decode_u64(&buf[cursor..]) else {
                break;
            };
            cursor += read;
            occurrence.offset = Some((zigzag_decode(start) as u32, zigzag_decode(end) as u32));
        }

        let Some(&flag) = buf.get(cursor) else { break };
        cursor += 1;
        if flag != 0 {
            let Ok((len, read)) = decode_u64(&buf[cursor..]) else {
                break;
            };
            cursor += read;
            let Some(payload) = buf.get(cursor..cursor + len as usize) else {
                break;
            };
            occurrence.payload = Some(payload.to_vec());
        }

        occurrences.push(occurrence);

        if next == 0 {
            break;
        }
        offset = next as usize;
    }

    occurrences
}

/// Decode the linked value list of one `(column, document)` entry.
pub(crate) fn decode_column_values(entry: &DocumentEntry) -> Vec<Vec<u8>> {
    let buf: &[u8] = &entry.buf;
    let mut values = Vec::new();
    let mut offset = entry.offset as usize;

    loop {
        let Some(next) = read_u64_at(buf, offset) else {
            break;
        };
        let Ok((len, _)) = decode_u64(&buf[offset + 8..]) else {
            break;
        };
        let len = len as usize;
        if offset < len {
            break;
        }
        let Some(value) = buf.get(offset - len..offset) else {
            break;
        };
        values.push(value.to_vec());

        if next == 0 {
            break;
        }
        offset = next as usize;
    }

    values
}
