//! Core identifier types and limits shared across the index and the store.

use serde::{Deserialize, Serialize};

/// Identifier of a document within a segment.
///
/// Value `0` is invalid; [`EOF_DOC`] is a sentinel that is never assigned.
/// Valid DocIds are dense within a segment and allocated monotonically
/// starting at [`FIRST_DOC`].
pub type DocId = u32;

/// The invalid DocId. Never assigned to a document.
pub const INVALID_DOC: DocId = 0;

/// The end-of-stream DocId sentinel. Never assigned to a document.
pub const EOF_DOC: DocId = DocId::MAX;

/// The first valid DocId in a segment.
pub const FIRST_DOC: DocId = 1;

/// Returns true if `doc` identifies an actual document.
#[inline]
pub fn doc_id_valid(doc: DocId) -> bool {
    doc != INVALID_DOC && doc != EOF_DOC
}

/// Monotonic counter totally ordering ingest operations and modification
/// requests inside one transaction.
pub type Generation = u64;

/// Identifier of an unnamed column in the transaction store.
pub type ColumnId = u32;

/// The invalid column id.
pub const INVALID_COLUMN: ColumnId = ColumnId::MAX;

/// The set of features a field's postings carry.
///
/// Readers may request a subset of the features a field was indexed with;
/// indexing a field with features that are not a subset of an existing
/// field's features is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldFeatures {
    /// Term frequency per document.
    pub frequency: bool,
    /// Term positions within a document.
    pub positions: bool,
    /// Start/end character offsets per position.
    pub offsets: bool,
    /// Opaque per-position payloads.
    pub payloads: bool,
}

impl FieldFeatures {
    /// Features for plain boolean (docs-only) fields.
    pub const DOCS: FieldFeatures = FieldFeatures {
        frequency: false,
        positions: false,
        offsets: false,
        payloads: false,
    };

    /// Full text features: frequency, positions and offsets.
    pub const TEXT: FieldFeatures = FieldFeatures {
        frequency: true,
        positions: true,
        offsets: true,
        payloads: false,
    };

    /// Returns true if every feature enabled in `self` is also enabled in
    /// `other`.
    pub fn is_subset_of(&self, other: &FieldFeatures) -> bool {
        (!self.frequency || other.frequency)
            && (!self.positions || other.positions)
            && (!self.offsets || other.offsets)
            && (!self.payloads || other.payloads)
    }

    /// Union of two feature sets.
    pub fn union(&self, other: &FieldFeatures) -> FieldFeatures {
        FieldFeatures {
            frequency: self.frequency || other.frequency,
            positions: self.positions || other.positions,
            offsets: self.offsets || other.offsets,
            payloads: self.payloads || other.payloads,
        }
    }
}
