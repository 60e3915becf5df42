//! Merge writer: emits one new segment from a set of sub-readers.
//!
//! Used by consolidation and by `import`. The writer snapshots each
//! candidate's live-doc set when the candidate is added; the per-candidate
//! doc map survives the flush so commit-time reconciliation can remap
//! deletes that landed on a candidate after the merge started.

use std::collections::BTreeMap;
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::codec::{Codec, ColumnData, FieldPostings, PostingDoc};
use crate::error::Result;
use crate::index::file_refs::RefTrackingStorage;
use crate::index::meta::SegmentMeta;
use crate::index::segment_reader::SubReader;
use crate::types::{DocId, FieldFeatures, FIRST_DOC, INVALID_DOC};

/// One merge input with its merge-time live snapshot and doc map.
pub struct MergeCandidate {
    reader: Arc<dyn SubReader>,
    live_at_merge: RoaringBitmap,
    /// old DocId -> merged DocId; `INVALID_DOC` for docs not carried over.
    doc_map: Vec<DocId>,
}

impl MergeCandidate {
    /// The candidate reader.
    pub fn reader(&self) -> &Arc<dyn SubReader> {
        &self.reader
    }

    /// Live docs of the candidate at the moment it was added.
    pub fn live_at_merge(&self) -> &RoaringBitmap {
        &self.live_at_merge
    }

    /// Map an old DocId to its merged DocId.
    pub fn map_doc(&self, old: DocId) -> DocId {
        self.doc_map
            .get(old as usize)
            .copied()
            .unwrap_or(INVALID_DOC)
    }
}

/// Builds one merged segment out of several sub-readers.
pub struct MergeWriter {
    dir: Arc<RefTrackingStorage>,
    codec: Arc<dyn Codec>,
    segment: String,
    candidates: Vec<MergeCandidate>,
}

impl std::fmt::Debug for MergeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeWriter")
            .field("segment", &self.segment)
            .field("candidates", &self.candidates.len())
            .finish()
    }
}

impl MergeWriter {
    /// Create a merge writer targeting a new segment name.
    pub fn new<S: Into<String>>(
        dir: Arc<RefTrackingStorage>,
        codec: Arc<dyn Codec>,
        segment: S,
    ) -> Self {
        MergeWriter {
            dir,
            codec,
            segment: segment.into(),
            candidates: Vec::new(),
        }
    }

    /// The target segment name.
    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// Number of candidates added so far.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// True when no candidates were added.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidate accessor; index order matches [`MergeWriter::add`] order.
    pub fn candidate(&self, index: usize) -> &MergeCandidate {
        &self.candidates[index]
    }

    /// Add one candidate, snapshotting its current live-doc set.
    pub fn add(&mut self, reader: Arc<dyn SubReader>) {
        let live_at_merge = reader.live_docs();
        self.candidates.push(MergeCandidate {
            reader,
            live_at_merge,
            doc_map: Vec::new(),
        });
    }

    /// Merge all candidates into the target segment.
    ///
    /// Returns `None` when the candidates carry no live documents (nothing
    /// was written). Merged DocIds are assigned densely in candidate order;
    /// the per-candidate doc maps are retained for later reconciliation.
    pub fn flush(&mut self) -> Result<Option<(String, SegmentMeta)>> {
        // assign merged doc ids in candidate order
        let mut next = FIRST_DOC;
        for candidate in &mut self.candidates {
            let capacity = FIRST_DOC as usize + candidate.reader.docs_count() as usize;
            candidate.doc_map = vec![INVALID_DOC; capacity];
            for old in candidate.live_at_merge.iter() {
                candidate.doc_map[old as usize] = next;
                next += 1;
            }
        }

        if next == FIRST_DOC {
            return Ok(None);
        }

        // merge postings; candidate order keeps doc lists sorted
        let mut merged_fields: BTreeMap<String, (FieldFeatures, BTreeMap<Vec<u8>, Vec<PostingDoc>>)> =
            BTreeMap::new();
        for candidate in &self.candidates {
            for info in candidate.reader.fields() {
                let entry = merged_fields
                    .entry(info.name.clone())
                    .or_insert_with(|| (info.features, BTreeMap::new()));
                entry.0 = entry.0.union(&info.features);

                for term in candidate.reader.terms(&info.name) {
                    let docs = entry.1.entry(term.term).or_default();
                    for posting in term.docs {
                        let mapped = candidate.map_doc(posting.doc);
                        if mapped != INVALID_DOC {
                            docs.push(PostingDoc {
                                doc: mapped,
                                positions: posting.positions,
                            });
                        }
                    }
                }
            }
        }

        // merge columns
        let mut merged_columns: BTreeMap<String, Vec<(DocId, Vec<Vec<u8>>)>> = BTreeMap::new();
        for candidate in &self.candidates {
            for name in candidate.reader.columns() {
                let entries = merged_columns.entry(name.clone()).or_default();
                for (doc, values) in candidate.reader.column_entries(&name) {
                    let mapped = candidate.map_doc(doc);
                    if mapped != INVALID_DOC {
                        entries.push((mapped, values));
                    }
                }
            }
        }

        let mut meta = SegmentMeta::new(&self.segment, self.codec.name());
        meta.docs_count = (next - FIRST_DOC) as u64;
        meta.live_docs_count = meta.docs_count;
        meta.column_count = merged_columns.len() as u32;

        let fields: Vec<FieldPostings> = merged_fields
            .into_iter()
            .map(|(name, (features, terms))| FieldPostings {
                name,
                features,
                terms,
            })
            .collect();
        let postings_files = self
            .codec
            .postings_writer()
            .write(self.dir.as_ref(), &self.segment, &fields)?;
        meta.files.extend(postings_files);

        let columns: Vec<ColumnData> = merged_columns
            .into_iter()
            .map(|(name, entries)| ColumnData { name, entries })
            .collect();
        if let Some(column_file) =
            self.codec
                .columnstore_writer()
                .write(self.dir.as_ref(), &self.segment, &columns)?
        {
            meta.files.insert(column_file);
        }

        let filename = self
            .codec
            .segment_meta_writer()
            .write(self.dir.as_ref(), &meta)?;

        Ok(Some((filename, meta)))
    }
}
