//! In-RAM accumulator for one in-progress segment.
//!
//! A segment writer buffers per-document field, term and column state until
//! the owning flush context is sealed, then flushes everything through the
//! codec writers producing a [`SegmentMeta`]. Every buffered document records
//! the generation at which it was written and, for replacement inserts, the
//! index of the modification request it replaces.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use roaring::RoaringBitmap;
use tracing::warn;

use crate::codec::{Codec, ColumnData, FieldPostings, PostingDoc, PostingPosition};
use crate::doc::IndexedField;
use crate::error::{Result, XystonError};
use crate::index::file_refs::RefTrackingStorage;
use crate::index::meta::SegmentMeta;
use crate::types::{DocId, FieldFeatures, Generation, EOF_DOC, FIRST_DOC};

/// Per-document bookkeeping: the generation the document was written at and,
/// for replacement inserts, the modification request it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateContext {
    /// Generation at the moment the document was begun.
    pub generation: Generation,

    /// Index of the originating modification request for replacement
    /// inserts; `None` for plain inserts.
    pub update_id: Option<usize>,
}

impl UpdateContext {
    /// Context for a plain insert.
    pub fn insert(generation: Generation) -> Self {
        UpdateContext {
            generation,
            update_id: None,
        }
    }

    /// Context for a replacement insert tied to a modification request.
    pub fn update(generation: Generation, update_id: usize) -> Self {
        UpdateContext {
            generation,
            update_id: Some(update_id),
        }
    }
}

#[derive(Debug, Default)]
struct FieldBuffer {
    features: FieldFeatures,
    terms: BTreeMap<Vec<u8>, Vec<PostingDoc>>,
}

/// Per-field validation state of the current document.
#[derive(Debug, Default, Clone, Copy)]
struct DocFieldState {
    last_position: Option<u32>,
}

/// Accumulates one in-progress segment in RAM.
pub struct SegmentWriter {
    dir: Arc<RefTrackingStorage>,
    codec: Arc<dyn Codec>,

    /// Target meta; assigned lazily on first use via [`SegmentWriter::reset`].
    meta: Option<SegmentMeta>,

    fields: AHashMap<String, FieldBuffer>,
    columns: AHashMap<String, Vec<(DocId, Vec<Vec<u8>>)>>,

    /// One entry per allocated DocId, in allocation order.
    doc_contexts: Vec<UpdateContext>,

    /// Buffered documents hidden from any future reader (rolled back or
    /// removed before flush).
    docs_mask: RoaringBitmap,

    current_doc: DocId,
    doc_field_state: AHashMap<String, DocFieldState>,
    valid: bool,
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("segment", &self.meta.as_ref().map(|m| m.name.as_str()))
            .field("docs_cached", &self.doc_contexts.len())
            .field("valid", &self.valid)
            .finish()
    }
}

impl SegmentWriter {
    /// Create an uninitialized writer over a ref-tracking directory view.
    pub fn new(dir: Arc<RefTrackingStorage>, codec: Arc<dyn Codec>) -> Self {
        SegmentWriter {
            dir,
            codec,
            meta: None,
            fields: AHashMap::new(),
            columns: AHashMap::new(),
            doc_contexts: Vec::new(),
            docs_mask: RoaringBitmap::new(),
            current_doc: 0,
            doc_field_state: AHashMap::new(),
            valid: false,
        }
    }

    /// True once a target segment has been assigned.
    pub fn initialized(&self) -> bool {
        self.meta.is_some()
    }

    /// Assign a fresh target segment and clear all buffers.
    pub fn reset(&mut self, meta: SegmentMeta) {
        self.clear();
        self.meta = Some(meta);
    }

    /// Drop the target segment and all buffered state.
    pub fn clear(&mut self) {
        self.meta = None;
        self.fields.clear();
        self.columns.clear();
        self.doc_contexts.clear();
        self.docs_mask.clear();
        self.current_doc = 0;
        self.doc_field_state.clear();
        self.valid = false;
    }

    /// The target segment name, once assigned.
    pub fn name(&self) -> Option<&str> {
        self.meta.as_ref().map(|m| m.name.as_str())
    }

    /// Whether the current (last) document is still valid.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Number of buffered documents.
    pub fn docs_cached(&self) -> u64 {
        self.doc_contexts.len() as u64
    }

    /// Per-document update contexts in allocation order. Index `i` belongs
    /// to DocId `FIRST_DOC + i`.
    pub fn doc_contexts(&self) -> &[UpdateContext] {
        &self.doc_contexts
    }

    /// The buffered document mask.
    pub fn docs_mask(&self) -> &RoaringBitmap {
        &self.docs_mask
    }

    /// Begin a new document, recording its update context.
    ///
    /// DocIds are allocated strictly monotonically starting at
    /// [`FIRST_DOC`]; on id exhaustion the document is invalid.
    pub fn begin(&mut self, ctx: UpdateContext) {
        let next = FIRST_DOC as u64 + self.doc_contexts.len() as u64;
        if next >= EOF_DOC as u64 {
            warn!("segment document id space exhausted");
            self.current_doc = 0;
            self.valid = false;
            return;
        }

        self.doc_contexts.push(ctx);
        self.current_doc = next as DocId;
        self.doc_field_state.clear();
        self.valid = true;
    }

    /// Feed one field's tokens into the current document.
    ///
    /// Returns `false` (and invalidates the document) on position
    /// regression, on `offset.end < offset.start` or on a feature mismatch
    /// with an existing field.
    pub fn index(&mut self, field: &IndexedField) -> bool {
        if !self.valid {
            return false;
        }

        let features = self
            .fields
            .entry(field.name.clone())
            .or_insert_with(|| FieldBuffer {
                features: field.features,
                ..Default::default()
            })
            .features;

        if !field.features.is_subset_of(&features) {
            warn!(field = %field.name, "field features are not a subset of the indexed features");
            self.valid = false;
            return false;
        }

        let doc = self.current_doc;

        for token in &field.tokens {
            let last_position = self
                .doc_field_state
                .get(&field.name)
                .and_then(|state| state.last_position);
            if let Some(last) = last_position {
                if token.position < last {
                    warn!(
                        field = %field.name,
                        position = token.position,
                        last_position = last,
                        "non-monotonic token position"
                    );
                    self.valid = false;
                    return false;
                }
            }
            self.doc_field_state.insert(
                field.name.clone(),
                DocFieldState {
                    last_position: Some(token.position),
                },
            );

            if let Some((start, end)) = token.offset {
                if end < start {
                    warn!(field = %field.name, start, end, "offset ends before it starts");
                    self.valid = false;
                    return false;
                }
            }

            let occurrence = PostingPosition {
                position: token.position,
                offset: if features.offsets { token.offset } else { None },
                payload: if features.payloads {
                    token.payload.clone()
                } else {
                    None
                },
            };

            let buffer = self
                .fields
                .get_mut(&field.name)
                .expect("field buffer created above");
            let docs = buffer.terms.entry(token.term.clone()).or_default();
            match docs.last_mut() {
                Some(last) if last.doc == doc => last.positions.push(occurrence),
                _ => docs.push(PostingDoc {
                    doc,
                    positions: vec![occurrence],
                }),
            }
        }

        true
    }

    /// Store one value into a named column of the current document.
    pub fn store(&mut self, column: &str, value: &[u8]) -> bool {
        if !self.valid {
            return false;
        }

        let doc = self.current_doc;
        let entries = self.columns.entry(column.to_string()).or_default();

        match entries.last_mut() {
            Some((last_doc, values)) if *last_doc == doc => values.push(value.to_vec()),
            _ => entries.push((doc, vec![value.to_vec()])),
        }

        true
    }

    /// Index a field and store its serialized value under the same name.
    pub fn index_and_store(&mut self, field: &IndexedField, value: &[u8]) -> bool {
        self.index(field) && self.store(&field.name, value)
    }

    /// Finalize the current document. An invalid document is rolled back.
    pub fn commit(&mut self) {
        if !self.valid {
            self.rollback();
        }
    }

    /// Invalidate the current document; it stays allocated but masked, so it
    /// will never be visible.
    pub fn rollback(&mut self) {
        if self.current_doc != 0 {
            self.docs_mask.insert(self.current_doc);
        }
    }

    /// Mark a buffered document as deleted. Returns `true` iff this call
    /// transitioned the mask bit from 0 to 1.
    pub fn remove(&mut self, doc: DocId) -> bool {
        if doc < FIRST_DOC || doc as u64 >= FIRST_DOC as u64 + self.doc_contexts.len() as u64 {
            return false;
        }
        self.docs_mask.insert(doc)
    }

    /// Flush all buffered state through the codec writers.
    ///
    /// Returns the segment's primary filename and its meta. The document
    /// mask is *not* persisted here; the committing thread applies the
    /// modification queue first and writes the final mask afterwards.
    pub fn flush(&mut self) -> Result<(String, SegmentMeta)> {
        let mut meta = self
            .meta
            .clone()
            .ok_or_else(|| XystonError::illegal_state("segment writer has no target segment"))?;

        meta.docs_count = self.doc_contexts.len() as u64;
        meta.live_docs_count = meta.docs_count - self.docs_mask.len();
        meta.column_count = self.columns.len() as u32;

        // postings shards
        let mut fields: Vec<FieldPostings> = self
            .fields
            .iter()
            .map(|(name, buffer)| FieldPostings {
                name: name.clone(),
                features: buffer.features,
                terms: buffer.terms.clone(),
            })
            .collect();
        fields.sort_by(|a, b| a.name.cmp(&b.name));

        let postings_files =
            self.codec
                .postings_writer()
                .write(self.dir.as_ref(), &meta.name, &fields)?;
        meta.files.extend(postings_files);

        // columnstore
        let mut columns: Vec<ColumnData> = self
            .columns
            .iter()
            .map(|(name, entries)| ColumnData {
                name: name.clone(),
                entries: entries.clone(),
            })
            .collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name));

        if let Some(column_file) =
            self.codec
                .columnstore_writer()
                .write(self.dir.as_ref(), &meta.name, &columns)?
        {
            meta.files.insert(column_file);
        }

        let filename = self
            .codec
            .segment_meta_writer()
            .write(self.dir.as_ref(), &meta)?;

        self.meta = Some(meta.clone());
        Ok((filename, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::default_codec;
    use crate::doc::{IndexedField, Token};
    use crate::index::file_refs::FileRefs;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::Storage;

    fn writer() -> (SegmentWriter, Arc<RefTrackingStorage>) {
        let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let dir = Arc::new(RefTrackingStorage::new(base, FileRefs::new()));
        let mut writer = SegmentWriter::new(Arc::clone(&dir), default_codec());
        writer.reset(SegmentMeta::new("_1", "base"));
        (writer, dir)
    }

    #[test]
    fn test_doc_ids_are_monotonic() {
        let (mut writer, _dir) = writer();

        writer.begin(UpdateContext::insert(0));
        assert!(writer.valid());
        writer.commit();
        writer.begin(UpdateContext::insert(1));
        writer.commit();

        assert_eq!(writer.docs_cached(), 2);
        assert_eq!(writer.doc_contexts()[0].generation, 0);
        assert_eq!(writer.doc_contexts()[1].generation, 1);
    }

    #[test]
    fn test_invalid_position_rolls_back() {
        let (mut writer, _dir) = writer();

        writer.begin(UpdateContext::insert(0));
        let field = IndexedField::new(
            "body",
            FieldFeatures::TEXT,
            vec![Token::new("b", 5), Token::new("a", 2)],
        );
        assert!(!writer.index(&field));
        assert!(!writer.valid());

        writer.commit(); // behaves as rollback
        assert!(writer.docs_mask().contains(FIRST_DOC));
    }

    #[test]
    fn test_invalid_offset_rolls_back() {
        let (mut writer, _dir) = writer();

        writer.begin(UpdateContext::insert(0));
        let field = IndexedField::new(
            "body",
            FieldFeatures::TEXT,
            vec![Token::new("a", 0).with_offset(10, 4)],
        );
        assert!(!writer.index(&field));
        assert!(!writer.valid());
    }

    #[test]
    fn test_feature_mismatch_invalidates() {
        let (mut writer, _dir) = writer();

        writer.begin(UpdateContext::insert(0));
        assert!(writer.index(&IndexedField::keyword("id", "1")));
        writer.commit();

        writer.begin(UpdateContext::insert(1));
        // same field now with positions: not a subset of docs-only
        let rich = IndexedField::new("id", FieldFeatures::TEXT, vec![Token::new("2", 0)]);
        assert!(!writer.index(&rich));
        assert!(!writer.valid());
    }

    #[test]
    fn test_remove_reports_transition() {
        let (mut writer, _dir) = writer();

        writer.begin(UpdateContext::insert(0));
        writer.commit();

        assert!(writer.remove(FIRST_DOC));
        assert!(!writer.remove(FIRST_DOC)); // already masked
        assert!(!writer.remove(99)); // never allocated
    }

    #[test]
    fn test_flush_writes_segment() {
        let (mut writer, dir) = writer();

        writer.begin(UpdateContext::insert(0));
        writer.index(&IndexedField::text("title", "alpha beta"));
        writer.store("title", b"alpha beta");
        writer.commit();

        let (filename, meta) = writer.flush().unwrap();
        assert_eq!(filename, "_1.sm");
        assert_eq!(meta.docs_count, 1);
        assert_eq!(meta.live_docs_count, 1);
        assert!(meta.files.contains("_1.doc"));
        assert!(meta.files.contains("_1.col"));
        assert!(dir.file_exists("_1.sm"));
        assert!(dir.table().is_referenced("_1.doc"));
    }

    #[test]
    fn test_multi_value_column() {
        let (mut writer, _dir) = writer();

        writer.begin(UpdateContext::insert(0));
        writer.store("tags", b"red");
        writer.store("tags", b"blue");
        writer.commit();

        let (_, meta) = writer.flush().unwrap();
        assert_eq!(meta.column_count, 1);
    }
}
