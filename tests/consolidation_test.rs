//! Consolidation scenarios: policy-driven merges, interleaved deletes,
//! idempotence and the deferred variant.

use std::sync::Arc;

use xyston::codec::default_codec;
use xyston::doc::IndexedField;
use xyston::filter::TermFilter;
use xyston::index::policy::{FillMergePolicy, MergeAllPolicy, NoMergePolicy, TieredMergePolicy};
use xyston::index::segment_reader::{IndexReader, SubReader};
use xyston::index::writer::{IndexWriter, OpenMode};
use xyston::storage::memory::MemoryStorage;
use xyston::storage::Storage;

fn open_writer(memory: &MemoryStorage) -> IndexWriter {
    let storage: Arc<dyn Storage> = Arc::new(memory.clone());
    IndexWriter::open(storage, default_codec(), OpenMode::CreateOrAppend).unwrap()
}

/// One committed segment per title.
fn build_segments(writer: &IndexWriter, titles: &[&str]) {
    for title in titles {
        assert!(writer.insert(|doc| {
            doc.index(&IndexedField::text("title", title));
            doc.store("title", title.as_bytes());
        }));
        writer.commit().unwrap();
    }
}

fn all_titles(writer: &IndexWriter) -> Vec<String> {
    let reader = writer.reader().unwrap();
    let mut titles = Vec::new();
    for segment in reader.segments() {
        for doc in segment.live_docs() {
            if let Some(value) = segment.stored_value(doc, "title") {
                titles.push(String::from_utf8(value).unwrap());
            }
        }
    }
    titles.sort();
    titles
}

#[test]
fn merge_all_collapses_segments() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);
    build_segments(&writer, &["alpha", "beta", "gamma"]);

    let reader = writer.reader().unwrap();
    assert_eq!(reader.segments().len(), 3);

    assert!(writer.consolidate(&MergeAllPolicy).unwrap());
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.segments().len(), 1);
    assert_eq!(reader.live_docs_count(), 3);
    assert_eq!(all_titles(&writer), vec!["alpha", "beta", "gamma"]);
}

#[test]
fn consolidation_is_idempotent() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);
    build_segments(&writer, &["alpha", "beta"]);

    for _ in 0..3 {
        writer.consolidate(&MergeAllPolicy).unwrap();
        writer.commit().unwrap();
    }

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 2);
    assert_eq!(all_titles(&writer), vec!["alpha", "beta"]);
}

#[test]
fn single_clean_candidate_is_a_no_op() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);
    build_segments(&writer, &["alpha"]);

    // one candidate without deletes: accepted, nothing staged
    assert!(writer.consolidate(&MergeAllPolicy).unwrap());
    assert!(!writer.begin().unwrap());
}

#[test]
fn single_candidate_with_deletes_is_rewritten() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    for title in ["alpha", "beta"] {
        assert!(writer.insert(|doc| {
            doc.index(&IndexedField::text("title", title));
            doc.store("title", title.as_bytes());
        }));
    }
    writer.commit().unwrap();
    writer.remove(TermFilter::new("title", "beta"));
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.segments()[0].docs_mask().len(), 1);

    assert!(writer.consolidate(&MergeAllPolicy).unwrap());
    writer.commit().unwrap();

    // the rewritten segment has no mask left
    let reader = writer.reader().unwrap();
    assert_eq!(reader.segments().len(), 1);
    assert_eq!(reader.segments()[0].docs_count(), 1);
    assert_eq!(reader.segments()[0].docs_mask().len(), 0);
    assert_eq!(all_titles(&writer), vec!["alpha"]);
}

#[test]
fn delete_during_registered_consolidation_lands_in_merged_mask() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    // three committed segments with two documents each
    for titles in [["alpha", "a2"], ["beta", "b2"], ["gamma", "g2"]] {
        for title in titles {
            assert!(writer.insert(|doc| {
                doc.index(&IndexedField::text("title", title));
                doc.store("title", title.as_bytes());
            }));
        }
        writer.commit().unwrap();
    }

    // open a transaction so the consolidation registers mid-flight
    assert!(writer.insert(|doc| {
        doc.index(&IndexedField::text("title", "delta"));
        doc.store("title", b"delta");
    }));
    assert!(writer.begin().unwrap());

    // candidates are the three committed segments
    assert!(writer.consolidate(&MergeAllPolicy).unwrap());

    // a delete arriving while the merge is staged
    writer.remove(TermFilter::new("title", "beta"));

    // finish the open transaction (publishes delta), then commit the
    // staged consolidation together with the delete
    writer.commit().unwrap();
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 6);
    assert!(reader.term_matches("title", b"beta").is_empty());
    assert_eq!(
        all_titles(&writer),
        vec!["a2", "alpha", "b2", "delta", "g2", "gamma"]
    );

    // the merged segment carries the remapped delete in its mask
    let merged = reader
        .segments()
        .iter()
        .find(|s| s.docs_count() == 6)
        .expect("merged segment present");
    assert_eq!(merged.docs_mask().len(), 1);
}

#[test]
fn overlapping_consolidations_reject_second() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);
    build_segments(&writer, &["alpha", "beta"]);

    assert!(writer.consolidate(&MergeAllPolicy).unwrap());
    // same candidates are already claimed in the active context
    assert!(!writer.consolidate(&MergeAllPolicy).unwrap());

    writer.commit().unwrap();
    assert_eq!(all_titles(&writer), vec!["alpha", "beta"]);
}

#[test]
fn fill_policy_targets_delete_heavy_segments() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    // one segment with two docs, one of them deleted
    for title in ["alpha", "beta"] {
        assert!(writer.insert(|doc| {
            doc.index(&IndexedField::text("title", title));
            doc.store("title", title.as_bytes());
        }));
    }
    writer.commit().unwrap();
    writer.remove(TermFilter::new("title", "beta"));
    writer.commit().unwrap();

    // and one clean segment
    build_segments(&writer, &["gamma"]);

    let policy = FillMergePolicy { threshold: 0.75 };
    assert!(writer.consolidate(&policy).unwrap());
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 2);
    // the delete-heavy segment was rewritten; the clean one survived
    assert!(reader.segments().iter().any(|s| s.docs_count() == 1));
    assert_eq!(all_titles(&writer), vec!["alpha", "gamma"]);
}

#[test]
fn no_merge_policy_changes_nothing() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);
    build_segments(&writer, &["alpha", "beta"]);

    assert!(writer.consolidate(&NoMergePolicy).unwrap());
    assert!(!writer.begin().unwrap());

    let reader = writer.reader().unwrap();
    assert_eq!(reader.segments().len(), 2);
}

#[test]
fn deferred_consolidation_runs_inside_commit() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);
    build_segments(&writer, &["alpha", "beta"]);

    writer.consolidate_deferred(Arc::new(MergeAllPolicy));
    // the deferred merge also covers documents of the same commit
    assert!(writer.insert(|doc| {
        doc.index(&IndexedField::text("title", "gamma"));
        doc.store("title", b"gamma");
    }));
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.segments().len(), 1);
    assert_eq!(reader.live_docs_count(), 3);
    assert_eq!(all_titles(&writer), vec!["alpha", "beta", "gamma"]);
}

#[test]
fn deferred_consolidation_sees_commit_deletes() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    // two committed segments with two documents each
    for titles in [["alpha", "beta"], ["gamma", "delta"]] {
        for title in titles {
            assert!(writer.insert(|doc| {
                doc.index(&IndexedField::text("title", title));
                doc.store("title", title.as_bytes());
            }));
        }
        writer.commit().unwrap();
    }

    writer.remove(TermFilter::new("title", "beta"));
    writer.consolidate_deferred(Arc::new(MergeAllPolicy));
    writer.commit().unwrap();

    // the merge ran after the delete, so the deleted document never made
    // it into the merged segment
    let reader = writer.reader().unwrap();
    assert_eq!(reader.segments().len(), 1);
    assert_eq!(reader.live_docs_count(), 3);
    assert_eq!(reader.segments()[0].docs_count(), 3);
    assert_eq!(reader.segments()[0].docs_mask().len(), 0);
    assert_eq!(all_titles(&writer), vec!["alpha", "delta", "gamma"]);
}

#[test]
fn tiered_policy_merges_small_segments() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);
    build_segments(&writer, &["a", "b", "c", "d"]);

    let policy = TieredMergePolicy {
        min_merge_segments: 2,
        max_merge_segments: 3,
        max_docs: 100,
    };
    assert!(writer.consolidate(&policy).unwrap());
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    // three merged into one, the fourth untouched
    assert_eq!(reader.segments().len(), 2);
    assert_eq!(reader.live_docs_count(), 4);
}

#[test]
fn consolidation_result_dropped_when_all_docs_deleted() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);
    build_segments(&writer, &["alpha", "beta"]);

    assert!(writer.consolidate(&MergeAllPolicy).unwrap());
    // delete everything before the consolidation commits
    writer.remove(TermFilter::new("title", "alpha"));
    writer.remove(TermFilter::new("title", "beta"));
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 0);
    assert!(reader.segments().is_empty());
}
