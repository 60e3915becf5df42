//! Segment and index metadata.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Metadata of one immutable segment.
///
/// `docs_count` is monotonic; `live_docs_count <= docs_count`. `version`
/// increments every time a new document mask is written for the segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Globally unique segment name.
    pub name: String,

    /// Name of the codec the segment was written with.
    pub codec: String,

    /// Mask version; bumped on every new document mask.
    pub version: u64,

    /// Total number of documents ever written to the segment.
    pub docs_count: u64,

    /// Number of documents not hidden by the document mask.
    pub live_docs_count: u64,

    /// Number of stored columns in the segment.
    pub column_count: u32,

    /// Every file belonging to the segment (payload shards, columnstore,
    /// current document mask). The segment meta file itself is tracked as
    /// the owning [`IndexSegment::filename`].
    pub files: BTreeSet<String>,
}

impl SegmentMeta {
    /// Create an empty meta for a named segment.
    pub fn new<S: Into<String>, C: Into<String>>(name: S, codec: C) -> Self {
        SegmentMeta {
            name: name.into(),
            codec: codec.into(),
            version: 0,
            docs_count: 0,
            live_docs_count: 0,
            column_count: 0,
            files: BTreeSet::new(),
        }
    }

    /// True when no live documents remain.
    pub fn is_empty(&self) -> bool {
        self.live_docs_count == 0
    }
}

/// One segment entry of an index meta: the segment's primary (meta) file
/// plus the parsed meta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSegment {
    /// The segment meta filename.
    pub filename: String,

    /// The segment meta.
    pub meta: SegmentMeta,
}

/// The durable description of an index: an ordered list of segments plus
/// the generation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Generation of this meta. `0` means "never prepared".
    pub generation: u64,

    /// Last successfully committed generation. `0` means "no commit yet".
    pub last_generation: u64,

    /// Segment name counter; provides globally unique segment names.
    pub counter: u64,

    /// Live segments in commit order.
    pub segments: Vec<IndexSegment>,
}

impl IndexMeta {
    /// Create an empty meta.
    pub fn new() -> Self {
        IndexMeta::default()
    }

    /// The generation the next prepared meta will carry.
    pub fn next_generation(&self) -> u64 {
        self.generation + 1
    }

    /// Allocate the next unique segment name.
    pub fn increment(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Copy generation state (but not segments) from another meta.
    pub fn update_generation(&mut self, other: &IndexMeta) {
        self.generation = other.generation;
        self.last_generation = other.last_generation;
    }

    /// True when the index has no live segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Sum of live docs across segments.
    pub fn live_docs_count(&self) -> u64 {
        self.segments.iter().map(|s| s.meta.live_docs_count).sum()
    }

    /// Every file referenced by this meta: all segment files plus each
    /// segment's primary file.
    pub fn referenced_files(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().flat_map(|segment| {
            std::iter::once(segment.filename.as_str())
                .chain(segment.meta.files.iter().map(|f| f.as_str()))
        })
    }
}

/// Build the canonical segment name for a counter value.
pub fn segment_name(counter: u64) -> String {
    format!("_{counter}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_meta_new() {
        let meta = SegmentMeta::new("_1", "base");
        assert_eq!(meta.name, "_1");
        assert_eq!(meta.version, 0);
        assert!(meta.is_empty());
    }

    #[test]
    fn test_index_meta_counters() {
        let mut meta = IndexMeta::new();
        assert_eq!(meta.next_generation(), 1);
        assert_eq!(meta.increment(), 1);
        assert_eq!(meta.increment(), 2);
        assert_eq!(segment_name(meta.counter), "_2");

        let mut other = IndexMeta::new();
        other.generation = 5;
        other.last_generation = 5;
        meta.update_generation(&other);
        assert_eq!(meta.generation, 5);
        assert_eq!(meta.last_generation, 5);
        // counter untouched
        assert_eq!(meta.counter, 2);
    }

    #[test]
    fn test_referenced_files() {
        let mut seg = SegmentMeta::new("_1", "base");
        seg.files.insert("_1.doc".to_string());
        seg.files.insert("_1.col".to_string());
        let meta = IndexMeta {
            segments: vec![IndexSegment {
                filename: "_1.sm".to_string(),
                meta: seg,
            }],
            ..Default::default()
        };

        let files: Vec<&str> = meta.referenced_files().collect();
        assert!(files.contains(&"_1.sm"));
        assert!(files.contains(&"_1.doc"));
        assert!(files.contains(&"_1.col"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut meta = IndexMeta::new();
        meta.generation = 2;
        meta.counter = 4;
        let json = serde_json::to_string(&meta).unwrap();
        let parsed: IndexMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
    }
}
