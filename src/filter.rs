//! Filter contract: prepared iterators over documents in a reader.
//!
//! Deletes and updates are expressed as filters. A filter is prepared
//! against a reader, then executed to obtain a [`DocIterator`] over the
//! matching documents. The index core accepts filters by value, by box or
//! by shared handle through [`IntoFilter`].

use std::sync::Arc;

use crate::error::Result;
use crate::index::segment_reader::SubReader;
use crate::types::DocId;

/// A document predicate over a reader.
pub trait Filter: Send + Sync + std::fmt::Debug {
    /// Compile the filter against a reader.
    fn prepare(&self, reader: &dyn SubReader) -> Result<Box<dyn PreparedFilter>>;
}

/// A filter compiled against a reader.
pub trait PreparedFilter: Send {
    /// Execute against a reader, yielding matching documents.
    fn execute(&self, reader: &dyn SubReader) -> Result<Box<dyn DocIterator>>;
}

/// Iterator over matching DocIds in ascending order.
pub trait DocIterator: Send {
    /// Advance to the next match. Returns `false` at the end.
    fn next(&mut self) -> bool;

    /// The current DocId. Only valid after `next()` returned `true`.
    fn value(&self) -> DocId;
}

/// A doc iterator over a pre-computed list.
pub struct VecDocIterator {
    docs: Vec<DocId>,
    cursor: usize,
    current: DocId,
}

impl VecDocIterator {
    /// Create an iterator over `docs` (must be sorted ascending).
    pub fn new(docs: Vec<DocId>) -> Self {
        VecDocIterator {
            docs,
            cursor: 0,
            current: 0,
        }
    }
}

impl DocIterator for VecDocIterator {
    fn next(&mut self) -> bool {
        if self.cursor >= self.docs.len() {
            return false;
        }
        self.current = self.docs[self.cursor];
        self.cursor += 1;
        true
    }

    fn value(&self) -> DocId {
        self.current
    }
}

/// Conversion of the various filter ownership shapes into the shared handle
/// the core stores.
pub trait IntoFilter {
    /// Convert into a shared filter handle.
    fn into_filter(self) -> Arc<dyn Filter>;
}

impl<F: Filter + 'static> IntoFilter for F {
    fn into_filter(self) -> Arc<dyn Filter> {
        Arc::new(self)
    }
}

impl IntoFilter for Arc<dyn Filter> {
    fn into_filter(self) -> Arc<dyn Filter> {
        self
    }
}

impl IntoFilter for Box<dyn Filter> {
    fn into_filter(self) -> Arc<dyn Filter> {
        Arc::from(self)
    }
}

/// Matches live documents containing an exact term in a field.
#[derive(Debug, Clone)]
pub struct TermFilter {
    field: String,
    term: Vec<u8>,
}

impl TermFilter {
    /// Create a filter for `field == term`.
    pub fn new<S: Into<String>, T: Into<Vec<u8>>>(field: S, term: T) -> Self {
        TermFilter {
            field: field.into(),
            term: term.into(),
        }
    }
}

impl Filter for TermFilter {
    fn prepare(&self, _reader: &dyn SubReader) -> Result<Box<dyn PreparedFilter>> {
        Ok(Box::new(PreparedTermFilter {
            field: self.field.clone(),
            term: self.term.clone(),
        }))
    }
}

struct PreparedTermFilter {
    field: String,
    term: Vec<u8>,
}

impl PreparedFilter for PreparedTermFilter {
    fn execute(&self, reader: &dyn SubReader) -> Result<Box<dyn DocIterator>> {
        let docs = reader.term_docs(&self.field, &self.term).unwrap_or_default();
        Ok(Box::new(VecDocIterator::new(docs)))
    }
}

/// Matches every live document.
#[derive(Debug, Clone, Default)]
pub struct MatchAllFilter;

impl Filter for MatchAllFilter {
    fn prepare(&self, _reader: &dyn SubReader) -> Result<Box<dyn PreparedFilter>> {
        Ok(Box::new(PreparedMatchAll))
    }
}

struct PreparedMatchAll;

impl PreparedFilter for PreparedMatchAll {
    fn execute(&self, reader: &dyn SubReader) -> Result<Box<dyn DocIterator>> {
        Ok(Box::new(VecDocIterator::new(
            reader.live_docs().iter().collect(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::default_codec;
    use crate::doc::IndexedField;
    use crate::index::file_refs::{FileRefs, RefTrackingStorage};
    use crate::index::meta::SegmentMeta;
    use crate::index::segment_reader::SegmentReader;
    use crate::index::segment_writer::{SegmentWriter, UpdateContext};
    use crate::storage::memory::MemoryStorage;
    use crate::storage::Storage;

    fn reader() -> SegmentReader {
        let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let table = FileRefs::new();
        let dir = Arc::new(RefTrackingStorage::new(
            Arc::clone(&base),
            Arc::clone(&table),
        ));
        let mut writer = SegmentWriter::new(dir, default_codec());
        writer.reset(SegmentMeta::new("_1", "base"));
        for (i, title) in ["alpha", "beta", "alpha"].iter().enumerate() {
            writer.begin(UpdateContext::insert(i as u64));
            writer.index(&IndexedField::text("title", title));
            writer.commit();
        }
        let (_, meta) = writer.flush().unwrap();
        SegmentReader::open(&base, &table, &meta).unwrap()
    }

    fn collect(filter: &dyn Filter, reader: &dyn SubReader) -> Vec<DocId> {
        let prepared = filter.prepare(reader).unwrap();
        let mut iter = prepared.execute(reader).unwrap();
        let mut docs = Vec::new();
        while iter.next() {
            docs.push(iter.value());
        }
        docs
    }

    #[test]
    fn test_term_filter_matches() {
        let reader = reader();
        assert_eq!(collect(&TermFilter::new("title", "alpha"), &reader), vec![1, 3]);
        assert_eq!(collect(&TermFilter::new("title", "beta"), &reader), vec![2]);
        assert!(collect(&TermFilter::new("title", "nope"), &reader).is_empty());
        assert!(collect(&TermFilter::new("other", "alpha"), &reader).is_empty());
    }

    #[test]
    fn test_match_all() {
        let reader = reader();
        assert_eq!(collect(&MatchAllFilter, &reader), vec![1, 2, 3]);
    }

    #[test]
    fn test_into_filter_shapes() {
        let by_value: Arc<dyn Filter> = TermFilter::new("f", "t").into_filter();
        let by_box: Arc<dyn Filter> =
            (Box::new(TermFilter::new("f", "t")) as Box<dyn Filter>).into_filter();
        let by_arc: Arc<dyn Filter> = Arc::clone(&by_value).into_filter();
        assert!(Arc::ptr_eq(&by_value, &by_arc));
        drop(by_box);
    }
}
