//! End-to-end scenarios for the index writer: ingest, deletes, updates,
//! rollback on sync failure and crash recovery.

use std::sync::Arc;

use xyston::codec::default_codec;
use xyston::doc::IndexedField;
use xyston::error::XystonError;
use xyston::filter::TermFilter;
use xyston::index::segment_reader::{IndexReader, SubReader};
use xyston::index::writer::{IndexWriter, OpenMode, OpenOptions};
use xyston::storage::memory::MemoryStorage;
use xyston::storage::Storage;

fn open_writer(memory: &MemoryStorage) -> IndexWriter {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let storage: Arc<dyn Storage> = Arc::new(memory.clone());
    IndexWriter::open(storage, default_codec(), OpenMode::CreateOrAppend).unwrap()
}

fn insert_title(writer: &IndexWriter, title: &str) -> bool {
    writer.insert(|doc| {
        doc.index(&IndexedField::text("title", title));
        doc.store("title", title.as_bytes());
    })
}

#[test]
fn round_trip() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    for title in ["alpha", "beta", "gamma"] {
        assert!(insert_title(&writer, title));
    }
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.docs_count(), 3);
    assert_eq!(reader.live_docs_count(), 3);

    let matches = reader.term_matches("title", b"beta");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].1, 2);
    assert_eq!(
        matches[0].0.stored_value(2, "title"),
        Some(b"beta".to_vec())
    );
}

#[test]
fn delete_only() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    for title in ["alpha", "beta", "gamma"] {
        assert!(insert_title(&writer, title));
    }
    writer.commit().unwrap();

    writer.remove(TermFilter::new("title", "beta"));
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.docs_count(), 3);
    assert_eq!(reader.live_docs_count(), 2);

    let segment = &reader.segments()[0];
    assert_eq!(segment.docs_mask().len(), 1);
    assert!(segment.docs_mask().contains(2));
    assert!(reader.term_matches("title", b"beta").is_empty());
}

#[test]
fn update_replaces_matching_document() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    for title in ["alpha", "beta", "gamma"] {
        assert!(insert_title(&writer, title));
    }
    writer.commit().unwrap();

    let accepted = writer.update(TermFilter::new("title", "alpha"), |doc| {
        doc.index(&IndexedField::text("title", "alpha2"));
        doc.store("title", b"alpha2");
    });
    assert!(accepted);
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 3);
    assert!(reader.term_matches("title", b"alpha").is_empty());
    assert_eq!(reader.term_matches("title", b"alpha2").len(), 1);
    assert_eq!(reader.term_matches("title", b"beta").len(), 1);
}

#[test]
fn update_without_match_discards_replacement() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    assert!(insert_title(&writer, "alpha"));
    writer.commit().unwrap();

    let accepted = writer.update(TermFilter::new("title", "missing"), |doc| {
        doc.index(&IndexedField::text("title", "ghost"));
    });
    assert!(accepted);
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 1);
    assert!(reader.term_matches("title", b"ghost").is_empty());
}

#[test]
fn remove_before_insert_spares_the_insert() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    writer.remove(TermFilter::new("title", "alpha"));
    assert!(insert_title(&writer, "alpha"));
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 1);
}

#[test]
fn insert_before_remove_is_deleted() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    assert!(insert_title(&writer, "alpha"));
    writer.remove(TermFilter::new("title", "alpha"));
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 0);
}

#[test]
fn sync_failure_rolls_back_and_retry_commits() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    assert!(insert_title(&writer, "alpha"));

    // first flushed segment is "_1"; fail its doc-list shard
    memory.fail_sync_on("_1.doc");
    let err = writer.begin().unwrap_err();
    match &err {
        XystonError::SyncFailed { file, .. } => assert_eq!(file, "_1.doc"),
        other => panic!("expected SyncFailed, got {other}"),
    }

    // nothing was published
    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 0);

    // a retried commit without further inserts publishes the document
    memory.clear_sync_failures();
    writer.commit().unwrap();
    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 1);
    assert_eq!(reader.term_matches("title", b"alpha").len(), 1);
}

#[test]
fn sync_failure_retry_commits_on_existing_index() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    assert!(insert_title(&writer, "alpha"));
    writer.commit().unwrap();

    // the second flushed segment is "_2"; fail its doc-list shard
    assert!(insert_title(&writer, "beta"));
    memory.fail_sync_on("_2.doc");
    let err = writer.begin().unwrap_err();
    match &err {
        XystonError::SyncFailed { file, .. } => assert_eq!(file, "_2.doc"),
        other => panic!("expected SyncFailed, got {other}"),
    }

    // only the first commit is visible
    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 1);

    // a retried commit without further inserts still publishes the
    // flushed-but-uncommitted segment
    memory.clear_sync_failures();
    writer.commit().unwrap();
    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 2);
    assert_eq!(reader.term_matches("title", b"alpha").len(), 1);
    assert_eq!(reader.term_matches("title", b"beta").len(), 1);
}

#[test]
fn clear_discards_buffered_docs_without_committed_segments() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    assert!(insert_title(&writer, "alpha"));
    writer.commit().unwrap();
    writer.clear().unwrap();

    // zero committed segments, but a buffered document and a queued delete
    assert!(insert_title(&writer, "beta"));
    writer.remove(TermFilter::new("title", "beta"));
    writer.clear().unwrap();
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 0);
    assert!(reader.meta().segments.is_empty());

    // an idle clear on the now-empty index stays a no-op
    let generation = writer.committed_state().meta.generation;
    writer.clear().unwrap();
    assert_eq!(writer.committed_state().meta.generation, generation);
}

#[test]
fn crash_between_prepare_and_commit_recovers() {
    let memory = MemoryStorage::new();
    {
        let writer = open_writer(&memory);
        assert!(insert_title(&writer, "alpha"));
        writer.commit().unwrap();

        assert!(insert_title(&writer, "beta"));
        assert!(writer.begin().unwrap());
        // "crash": the writer goes away without finishing phase two
    }

    let pending: Vec<String> = memory
        .clone()
        .list_files()
        .unwrap()
        .into_iter()
        .filter(|f| f.starts_with("pending_segments_"))
        .collect();
    assert!(!pending.is_empty());

    // restart in append mode: the last committed meta wins, orphans are
    // collected
    let storage: Arc<dyn Storage> = Arc::new(memory.clone());
    let writer = IndexWriter::open(storage, default_codec(), OpenMode::Append).unwrap();

    let files = memory.list_files().unwrap();
    assert!(files.iter().all(|f| !f.starts_with("pending_segments_")));

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 1);
    assert_eq!(reader.term_matches("title", b"alpha").len(), 1);
    assert!(reader.term_matches("title", b"beta").is_empty());

    // every file the committed meta names still exists
    for segment in &reader.meta().segments {
        assert!(memory.file_exists(&segment.filename));
        for file in &segment.meta.files {
            assert!(memory.file_exists(file), "missing {file}");
        }
    }
}

#[test]
fn rollback_restores_previous_meta() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    assert!(insert_title(&writer, "alpha"));
    writer.commit().unwrap();
    let before = writer.committed_state().meta.clone();

    assert!(insert_title(&writer, "beta"));
    assert!(writer.begin().unwrap());
    writer.rollback().unwrap();

    let after = writer.committed_state().meta.clone();
    assert_eq!(before.generation, after.generation);
    assert_eq!(before.segments.len(), after.segments.len());

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 1);
}

#[test]
fn clear_then_commit_reports_zero_docs() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    for title in ["alpha", "beta"] {
        assert!(insert_title(&writer, title));
    }
    writer.commit().unwrap();

    writer.clear().unwrap();
    writer.commit().unwrap();

    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 0);
}

#[test]
fn reader_snapshot_survives_later_commits() {
    let memory = MemoryStorage::new();
    let writer = open_writer(&memory);

    assert!(insert_title(&writer, "alpha"));
    writer.commit().unwrap();
    let snapshot = writer.reader().unwrap();

    writer.remove(TermFilter::new("title", "alpha"));
    writer.commit().unwrap();

    // the old snapshot keeps answering from its pinned files
    assert_eq!(snapshot.live_docs_count(), 1);
    assert_eq!(snapshot.term_matches("title", b"alpha").len(), 1);
    for segment in &snapshot.meta().segments {
        assert!(writer.file_refs().is_referenced(&segment.filename));
    }

    // the fresh view reflects the delete
    let current = writer.reader().unwrap();
    assert_eq!(current.live_docs_count(), 0);
}

#[test]
fn import_absorbs_external_reader() {
    let source_memory = MemoryStorage::new();
    let source = open_writer(&source_memory);
    for title in ["alpha", "beta"] {
        assert!(insert_title(&source, title));
    }
    source.commit().unwrap();
    let source_reader = source.reader().unwrap();

    let target_memory = MemoryStorage::new();
    let target = open_writer(&target_memory);
    assert!(insert_title(&target, "gamma"));

    assert!(target.import(&source_reader).unwrap());
    target.commit().unwrap();

    let reader = target.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 3);
    assert_eq!(reader.term_matches("title", b"alpha").len(), 1);
    assert_eq!(reader.term_matches("title", b"gamma").len(), 1);
}

#[test]
fn imported_segment_respects_later_deletes() {
    let source_memory = MemoryStorage::new();
    let source = open_writer(&source_memory);
    for title in ["alpha", "beta"] {
        assert!(insert_title(&source, title));
    }
    source.commit().unwrap();
    let source_reader = source.reader().unwrap();

    let target_memory = MemoryStorage::new();
    let target = open_writer(&target_memory);
    assert!(target.import(&source_reader).unwrap());

    // enqueued after the import registration, so it applies to it
    target.remove(TermFilter::new("title", "alpha"));
    target.commit().unwrap();

    let reader = target.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 1);
    assert!(reader.term_matches("title", b"alpha").is_empty());
    assert_eq!(reader.term_matches("title", b"beta").len(), 1);
}

#[test]
fn open_modes_and_locking() {
    let memory = MemoryStorage::new();
    let storage: Arc<dyn Storage> = Arc::new(memory.clone());

    // append on an empty directory fails
    let err = IndexWriter::open(
        Arc::clone(&storage),
        default_codec(),
        OpenMode::Append,
    )
    .unwrap_err();
    assert!(matches!(err, XystonError::FileNotFound(_)));

    let first = IndexWriter::open(
        Arc::clone(&storage),
        default_codec(),
        OpenMode::CreateOrAppend,
    )
    .unwrap();

    // second writer is locked out
    let err = IndexWriter::open(
        Arc::clone(&storage),
        default_codec(),
        OpenMode::CreateOrAppend,
    )
    .unwrap_err();
    assert!(matches!(err, XystonError::LockObtainFailed(_)));

    // explicit no-lock bypass works
    let bypass = IndexWriter::open(
        Arc::clone(&storage),
        default_codec(),
        OpenOptions::new(OpenMode::CreateOrAppend).no_lock(),
    );
    assert!(bypass.is_ok());

    first.close();
    let reopened = IndexWriter::open(storage, default_codec(), OpenMode::Append);
    assert!(reopened.is_ok());
}

#[test]
fn create_mode_discards_existing_documents() {
    let memory = MemoryStorage::new();
    {
        let writer = open_writer(&memory);
        assert!(insert_title(&writer, "alpha"));
        writer.commit().unwrap();
    }

    let storage: Arc<dyn Storage> = Arc::new(memory.clone());
    let writer = IndexWriter::open(storage, default_codec(), OpenMode::Create).unwrap();
    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 0);

    // a commit of the fresh index supersedes the old generation
    assert!(insert_title(&writer, "beta"));
    writer.commit().unwrap();
    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 1);
    assert_eq!(reader.term_matches("title", b"beta").len(), 1);
}

#[test]
fn file_storage_round_trip() {
    use xyston::storage::file::FileStorage;

    let dir = tempfile::TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()).unwrap());
    let writer = IndexWriter::open(
        Arc::clone(&storage),
        default_codec(),
        OpenMode::CreateOrAppend,
    )
    .unwrap();

    for title in ["alpha", "beta"] {
        assert!(writer.insert(|doc| {
            doc.index(&IndexedField::text("title", title));
            doc.store("title", title.as_bytes());
        }));
    }
    writer.commit().unwrap();
    writer.close();

    // a fresh writer over the same directory sees the committed docs
    let writer = IndexWriter::open(storage, default_codec(), OpenMode::Append).unwrap();
    let reader = writer.reader().unwrap();
    assert_eq!(reader.live_docs_count(), 2);
    assert_eq!(reader.term_matches("title", b"beta").len(), 1);
}
