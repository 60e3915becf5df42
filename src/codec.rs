//! Segment codec contract.
//!
//! A codec is the pluggable reader/writer pair for a segment's files:
//! postings, columnstore, document mask, segment meta and index meta. The
//! index core depends only on the traits in this module; the shipped
//! implementation lives in [`base`].
//!
//! # Persistent layout
//!
//! - `<N>.sm`: segment meta
//! - `<N>.<V>.dm`: document mask, stamped with the segment version
//! - `<N>.doc` / `<N>.pos` / `<N>.pay`: postings shards
//! - `<N>.col`: columnstore
//! - `segments_<G>`: index meta for generation `G`
//! - `pending_segments_<G>`: phase-one index meta, renamed on commit
//! - `write.lock`: writer exclusion file

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use ahash::AHashMap;
use parking_lot::RwLock;
use roaring::RoaringBitmap;

use crate::error::Result;
use crate::index::meta::{IndexMeta, SegmentMeta};
use crate::storage::Storage;
use crate::types::{DocId, FieldFeatures};

pub mod base;

/// A single indexed occurrence of a term in a document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostingPosition {
    /// Position within the field.
    pub position: u32,
    /// Character offsets, when the field records them.
    pub offset: Option<(u32, u32)>,
    /// Opaque payload, when the field records them.
    pub payload: Option<Vec<u8>>,
}

/// All occurrences of one term in one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingDoc {
    /// The document.
    pub doc: DocId,
    /// Occurrences in position order. Docs-only fields carry a single
    /// entry with position 0.
    pub positions: Vec<PostingPosition>,
}

/// The postings of one field: sorted terms, each with a sorted doc list.
#[derive(Debug, Clone, Default)]
pub struct FieldPostings {
    /// Field name.
    pub name: String,
    /// Features the postings carry.
    pub features: FieldFeatures,
    /// term bytes -> documents, sorted by term then by doc id.
    pub terms: BTreeMap<Vec<u8>, Vec<PostingDoc>>,
}

/// The stored values of one column: sorted doc entries, each possibly
/// multi-valued.
#[derive(Debug, Clone, Default)]
pub struct ColumnData {
    /// Column name.
    pub name: String,
    /// doc id -> values, sorted by doc id.
    pub entries: Vec<(DocId, Vec<Vec<u8>>)>,
}

/// A pluggable reader/writer pair for a segment's files.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Codec identifier recorded in segment metas.
    fn name(&self) -> &str;

    /// Reader for index meta files.
    fn index_meta_reader(&self) -> Box<dyn IndexMetaReader>;

    /// Stateful two-phase writer for index meta files.
    fn index_meta_writer(&self) -> Box<dyn IndexMetaWriter>;

    /// Reader for segment meta files.
    fn segment_meta_reader(&self) -> Box<dyn SegmentMetaReader>;

    /// Writer for segment meta files.
    fn segment_meta_writer(&self) -> Box<dyn SegmentMetaWriter>;

    /// Reader for document mask files.
    fn document_mask_reader(&self) -> Box<dyn DocumentMaskReader>;

    /// Writer for document mask files.
    fn document_mask_writer(&self) -> Box<dyn DocumentMaskWriter>;

    /// Writer for the postings shards.
    fn postings_writer(&self) -> Box<dyn PostingsWriter>;

    /// Reader for the postings shards.
    fn postings_reader(&self) -> Box<dyn PostingsReader>;

    /// Writer for the columnstore.
    fn columnstore_writer(&self) -> Box<dyn ColumnstoreWriter>;

    /// Reader for the columnstore.
    fn columnstore_reader(&self) -> Box<dyn ColumnstoreReader>;
}

/// Reads index meta files.
pub trait IndexMetaReader: Send {
    /// Locate the most recent committed meta file, if any.
    fn last_segments_file(&self, storage: &dyn Storage) -> Result<Option<String>>;

    /// Read an index meta from the named file.
    fn read(&self, storage: &dyn Storage, filename: &str) -> Result<IndexMeta>;
}

/// Two-phase writer for index meta files.
///
/// `prepare` writes the candidate meta to a tentative file (phase one);
/// `commit` atomically publishes it (phase two); `rollback` discards the
/// tentative file. At most one prepared meta may be outstanding.
pub trait IndexMetaWriter: Send {
    /// The committed filename the given meta publishes to.
    fn filename(&self, meta: &IndexMeta) -> String;

    /// Phase one: assign the meta its next generation and write it to a
    /// tentative file through `storage`.
    fn prepare(&mut self, storage: Arc<dyn Storage>, meta: &mut IndexMeta) -> Result<()>;

    /// Phase two: atomically publish the prepared meta.
    fn commit(&mut self) -> Result<()>;

    /// Discard the prepared meta, if any. Never fails.
    fn rollback(&mut self);
}

/// Reads segment meta files.
pub trait SegmentMetaReader: Send {
    /// Read a segment meta from the named file.
    fn read(&self, storage: &dyn Storage, filename: &str) -> Result<SegmentMeta>;
}

/// Writes segment meta files.
pub trait SegmentMetaWriter: Send {
    /// The filename the given meta is written to.
    fn filename(&self, meta: &SegmentMeta) -> String;

    /// Write the segment meta, returning the segment's primary filename.
    fn write(&self, storage: &dyn Storage, meta: &SegmentMeta) -> Result<String>;
}

/// Reads document mask files.
pub trait DocumentMaskReader: Send {
    /// Read the mask for `(meta.name, meta.version)`. Returns `None` when no
    /// mask file exists for that version.
    fn read(&self, storage: &dyn Storage, meta: &SegmentMeta) -> Result<Option<RoaringBitmap>>;
}

/// Stateful writer for document mask files.
pub trait DocumentMaskWriter: Send {
    /// The mask filename for `(meta.name, meta.version)`.
    fn filename(&self, meta: &SegmentMeta) -> String;

    /// Open the mask file for the given segment meta.
    fn prepare(&mut self, storage: &dyn Storage, meta: &SegmentMeta) -> Result<()>;

    /// Announce the number of masked documents.
    fn begin(&mut self, count: u32) -> Result<()>;

    /// Write one masked document. Must be called in ascending doc order.
    fn write(&mut self, doc: DocId) -> Result<()>;

    /// Finish and close the mask file.
    fn end(&mut self) -> Result<()>;
}

/// Writes the postings shards of a segment.
pub trait PostingsWriter: Send {
    /// Write all fields, returning the names of the files produced.
    fn write(
        &self,
        storage: &dyn Storage,
        segment: &str,
        fields: &[FieldPostings],
    ) -> Result<Vec<String>>;
}

/// Reads the postings shards of a segment.
pub trait PostingsReader: Send {
    /// Read all fields of a segment.
    fn read(&self, storage: &dyn Storage, segment: &str) -> Result<Vec<FieldPostings>>;
}

/// Writes the columnstore of a segment.
pub trait ColumnstoreWriter: Send {
    /// Write all columns, returning the name of the file produced, or
    /// `None` when there is nothing to store.
    fn write(
        &self,
        storage: &dyn Storage,
        segment: &str,
        columns: &[ColumnData],
    ) -> Result<Option<String>>;
}

/// Reads the columnstore of a segment.
pub trait ColumnstoreReader: Send {
    /// Read all columns of a segment. A segment without a columnstore file
    /// yields an empty list.
    fn read(&self, storage: &dyn Storage, segment: &str) -> Result<Vec<ColumnData>>;
}

// ---------------------------------------------------------------------------
// file name helpers
// ---------------------------------------------------------------------------

/// Name of the writer exclusion lock file.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Committed index meta filename for a generation.
pub fn segments_file_name(generation: u64) -> String {
    format!("segments_{generation}")
}

/// Tentative (phase-one) index meta filename for a generation.
pub fn pending_segments_file_name(generation: u64) -> String {
    format!("pending_segments_{generation}")
}

/// Parse the generation out of a committed meta filename.
pub fn parse_segments_generation(name: &str) -> Option<u64> {
    name.strip_prefix("segments_")?.parse().ok()
}

/// Segment meta filename.
pub fn segment_meta_file_name(segment: &str) -> String {
    format!("{segment}.sm")
}

/// Version-stamped document mask filename.
pub fn document_mask_file_name(segment: &str, version: u64) -> String {
    format!("{segment}.{version}.dm")
}

/// Postings doc-list shard filename.
pub fn postings_doc_file_name(segment: &str) -> String {
    format!("{segment}.doc")
}

/// Postings positions shard filename.
pub fn postings_pos_file_name(segment: &str) -> String {
    format!("{segment}.pos")
}

/// Postings payload shard filename.
pub fn postings_pay_file_name(segment: &str) -> String {
    format!("{segment}.pay")
}

/// Columnstore filename.
pub fn columnstore_file_name(segment: &str) -> String {
    format!("{segment}.col")
}

// ---------------------------------------------------------------------------
// codec registry
// ---------------------------------------------------------------------------

fn registry() -> &'static RwLock<AHashMap<String, Arc<dyn Codec>>> {
    static REGISTRY: OnceLock<RwLock<AHashMap<String, Arc<dyn Codec>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: AHashMap<String, Arc<dyn Codec>> = AHashMap::new();
        let base: Arc<dyn Codec> = Arc::new(base::BaseCodec::new());
        map.insert(base.name().to_string(), base);
        RwLock::new(map)
    })
}

/// Register a codec under its name. Registration is process-wide; the
/// registry is effectively read-only after startup.
pub fn register_codec(codec: Arc<dyn Codec>) {
    registry().write().insert(codec.name().to_string(), codec);
}

/// Look up a codec by name.
pub fn codec_for(name: &str) -> Option<Arc<dyn Codec>> {
    registry().read().get(name).cloned()
}

/// The default codec.
pub fn default_codec() -> Arc<dyn Codec> {
    codec_for(base::BASE_CODEC_NAME).expect("default codec is always registered")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(segments_file_name(3), "segments_3");
        assert_eq!(pending_segments_file_name(3), "pending_segments_3");
        assert_eq!(parse_segments_generation("segments_17"), Some(17));
        assert_eq!(parse_segments_generation("pending_segments_17"), None);
        assert_eq!(parse_segments_generation("segments_x"), None);

        assert_eq!(segment_meta_file_name("_1"), "_1.sm");
        assert_eq!(document_mask_file_name("_1", 2), "_1.2.dm");
        assert_eq!(postings_doc_file_name("_1"), "_1.doc");
        assert_eq!(columnstore_file_name("_1"), "_1.col");
    }

    #[test]
    fn test_registry_has_default() {
        let codec = default_codec();
        assert_eq!(codec.name(), base::BASE_CODEC_NAME);
        assert!(codec_for("no-such-codec").is_none());
    }
}
