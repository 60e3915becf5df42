//! Consolidation policies.
//!
//! A policy inspects the committed index meta and selects the segments worth
//! merging. Policies never mutate anything; the writer validates and
//! registers the candidates it returns.

use crate::index::meta::IndexMeta;
use crate::storage::Storage;

/// Trait for selecting consolidation candidates.
pub trait ConsolidationPolicy: Send + Sync + std::fmt::Debug {
    /// Select candidate segment names from the committed meta.
    fn candidates(&self, storage: &dyn Storage, meta: &IndexMeta) -> Vec<String>;
}

/// Merge every live segment into one.
#[derive(Debug, Clone, Default)]
pub struct MergeAllPolicy;

impl ConsolidationPolicy for MergeAllPolicy {
    fn candidates(&self, _storage: &dyn Storage, meta: &IndexMeta) -> Vec<String> {
        meta.segments.iter().map(|s| s.meta.name.clone()).collect()
    }
}

/// Merge small segments together, smallest first.
#[derive(Debug, Clone)]
pub struct TieredMergePolicy {
    /// Minimum number of candidates required to propose a merge.
    pub min_merge_segments: usize,

    /// Maximum number of segments merged at once.
    pub max_merge_segments: usize,

    /// Maximum total documents for a merged segment.
    pub max_docs: u64,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy {
            min_merge_segments: 2,
            max_merge_segments: 10,
            max_docs: 1_000_000,
        }
    }
}

impl ConsolidationPolicy for TieredMergePolicy {
    fn candidates(&self, _storage: &dyn Storage, meta: &IndexMeta) -> Vec<String> {
        let mut segments: Vec<_> = meta
            .segments
            .iter()
            .map(|s| (s.meta.name.clone(), s.meta.docs_count))
            .collect();
        segments.sort_by_key(|(_, docs)| *docs);

        let mut candidates = Vec::new();
        let mut total_docs = 0u64;
        for (name, docs) in segments {
            if candidates.len() >= self.max_merge_segments || total_docs + docs > self.max_docs {
                break;
            }
            total_docs += docs;
            candidates.push(name);
        }

        if candidates.len() < self.min_merge_segments {
            return Vec::new();
        }
        candidates
    }
}

/// Merge segments whose live ratio dropped below a threshold.
#[derive(Debug, Clone)]
pub struct FillMergePolicy {
    /// Live-documents ratio below which a segment is selected, in `(0, 1]`.
    pub threshold: f64,
}

impl Default for FillMergePolicy {
    fn default() -> Self {
        FillMergePolicy { threshold: 0.85 }
    }
}

impl ConsolidationPolicy for FillMergePolicy {
    fn candidates(&self, _storage: &dyn Storage, meta: &IndexMeta) -> Vec<String> {
        meta.segments
            .iter()
            .filter(|s| {
                s.meta.docs_count > 0
                    && (s.meta.live_docs_count as f64) / (s.meta.docs_count as f64)
                        < self.threshold
            })
            .map(|s| s.meta.name.clone())
            .collect()
    }
}

/// Never merge anything.
#[derive(Debug, Clone, Default)]
pub struct NoMergePolicy;

impl ConsolidationPolicy for NoMergePolicy {
    fn candidates(&self, _storage: &dyn Storage, _meta: &IndexMeta) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::meta::{IndexSegment, SegmentMeta};
    use crate::storage::memory::MemoryStorage;

    fn meta_with(segments: &[(&str, u64, u64)]) -> IndexMeta {
        IndexMeta {
            segments: segments
                .iter()
                .map(|(name, docs, live)| {
                    let mut meta = SegmentMeta::new(*name, "base");
                    meta.docs_count = *docs;
                    meta.live_docs_count = *live;
                    IndexSegment {
                        filename: format!("{name}.sm"),
                        meta,
                    }
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_all() {
        let storage = MemoryStorage::new();
        let meta = meta_with(&[("_1", 10, 10), ("_2", 5, 5)]);
        let candidates = MergeAllPolicy.candidates(&storage, &meta);
        assert_eq!(candidates, vec!["_1".to_string(), "_2".to_string()]);
    }

    #[test]
    fn test_tiered_prefers_small_segments() {
        let storage = MemoryStorage::new();
        let meta = meta_with(&[("_1", 1000, 1000), ("_2", 5, 5), ("_3", 7, 7)]);
        let policy = TieredMergePolicy {
            min_merge_segments: 2,
            max_merge_segments: 2,
            max_docs: 100,
        };
        let candidates = policy.candidates(&storage, &meta);
        assert_eq!(candidates, vec!["_2".to_string(), "_3".to_string()]);
    }

    #[test]
    fn test_tiered_requires_minimum() {
        let storage = MemoryStorage::new();
        let meta = meta_with(&[("_1", 5, 5)]);
        let policy = TieredMergePolicy::default();
        assert!(policy.candidates(&storage, &meta).is_empty());
    }

    #[test]
    fn test_fill_selects_deleted_heavy() {
        let storage = MemoryStorage::new();
        let meta = meta_with(&[("_1", 10, 9), ("_2", 10, 3)]);
        let policy = FillMergePolicy { threshold: 0.5 };
        assert_eq!(policy.candidates(&storage, &meta), vec!["_2".to_string()]);
    }

    #[test]
    fn test_no_merge() {
        let storage = MemoryStorage::new();
        let meta = meta_with(&[("_1", 10, 10)]);
        assert!(NoMergePolicy.candidates(&storage, &meta).is_empty());
    }
}
