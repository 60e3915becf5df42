//! The exclusive index writer.
//!
//! One writer owns a directory at a time (enforced by `write.lock`) and
//! manages the full segment lifecycle: ingest into pooled segment writers,
//! flush into immutable segments, deletion and update queues, background
//! consolidation, import of external readers, and the two-phase commit that
//! publishes a new index meta generation.
//!
//! # Transaction protocol
//!
//! `commit()` is `begin()` followed by `finish()`. `begin()` runs
//! `flush_all` (three contractual stages), writes the tentative index meta
//! (phase one) and fsyncs every changed file; `finish()` publishes the meta
//! (phase two) and captures the committed-state bundle. `rollback()` drops
//! the tentative meta and restores the committed segment list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use tracing::{debug, warn};

use crate::codec::{self, Codec};
use crate::doc::IndexedField;
use crate::error::{Result, XystonError};
use crate::filter::IntoFilter;
use crate::index::file_refs::{remove_unreferenced, FileRef, FileRefs, RefTrackingStorage};
use crate::index::flush::{
    ConsolidationCtx, FlushContext, FlushContextLease, FlushContextRing, ModificationRequest,
    PendingSegment,
};
use crate::index::merge::MergeWriter;
use crate::index::meta::{segment_name, IndexMeta, IndexSegment, SegmentMeta};
use crate::index::policy::ConsolidationPolicy;
use crate::index::readers::CachedReaders;
use crate::index::segment_reader::{DirectoryReader, IndexReader, SegmentReader, SubReader};
use crate::index::segment_writer::SegmentWriter;
use crate::storage::{Storage, StorageLock};
use crate::types::{Generation, FIRST_DOC, INVALID_DOC};

/// How to open an index directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create a new index; existing contents are discarded.
    Create,
    /// Open an existing index; fail when none exists.
    Append,
    /// Open an existing index or create a new one.
    CreateOrAppend,
}

/// Options for [`IndexWriter::open`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    mode: OpenMode,
    no_lock: bool,
    pool_size: usize,
    ring_size: usize,
}

impl OpenOptions {
    /// Options for the given mode with default pool sizing.
    pub fn new(mode: OpenMode) -> Self {
        OpenOptions {
            mode,
            no_lock: false,
            pool_size: 8,
            ring_size: 2,
        }
    }

    /// Skip the write-lock acquisition. The caller takes responsibility
    /// for writer exclusion.
    pub fn no_lock(mut self) -> Self {
        self.no_lock = true;
        self
    }

    /// Number of pooled segment writers per flush context.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Number of flush contexts in the ring (minimum 2).
    pub fn ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size.max(2);
        self
    }
}

impl From<OpenMode> for OpenOptions {
    fn from(mode: OpenMode) -> Self {
        OpenOptions::new(mode)
    }
}

/// The last successfully committed state: the meta plus handles on every
/// file it references.
pub struct CommittedState {
    /// The committed meta.
    pub meta: Arc<IndexMeta>,
    refs: Vec<FileRef>,
}

impl CommittedState {
    /// Handles on every file the committed meta references.
    pub fn file_refs(&self) -> &[FileRef] {
        &self.refs
    }
}

struct PendingState {
    lease: FlushContextLease,
    meta: IndexMeta,
    // keeps pending-segment files alive until the commit resolves
    _refs: Vec<FileRef>,
}

struct PendingContext {
    lease: FlushContextLease,
    meta: IndexMeta,
    to_sync: Vec<String>,
    refs: Vec<FileRef>,
}

struct CommitState {
    /// Latest/active index meta (committed segments plus the effects of an
    /// in-flight transaction).
    meta: IndexMeta,
    cached_readers: CachedReaders,
    pending: Option<PendingState>,
    meta_writer: Box<dyn codec::IndexMetaWriter>,
}

/// A document handle passed to insert/update closures.
pub struct Document<'a> {
    writer: &'a mut SegmentWriter,
}

impl<'a> Document<'a> {
    /// Whether every operation so far succeeded.
    pub fn valid(&self) -> bool {
        self.writer.valid()
    }

    /// Index a tokenized field.
    pub fn index(&mut self, field: &IndexedField) -> bool {
        self.writer.index(field)
    }

    /// Store a value into a named column.
    pub fn store(&mut self, column: &str, value: &[u8]) -> bool {
        self.writer.store(column, value)
    }

    /// Index a field and store its raw value under the same name.
    pub fn index_and_store(&mut self, field: &IndexedField, value: &[u8]) -> bool {
        self.writer.index_and_store(field, value)
    }
}

/// Unregisters consolidation candidates when the attempt leaves scope.
struct ConsolidationGuard<'a> {
    registered: &'a Mutex<AHashSet<String>>,
    names: Vec<String>,
}

impl Drop for ConsolidationGuard<'_> {
    fn drop(&mut self) {
        let mut registered = self.registered.lock();
        for name in &self.names {
            registered.remove(name);
        }
    }
}

/// The exclusive writer over one index directory.
pub struct IndexWriter {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn Codec>,
    refs: Arc<FileRefs>,
    ring: FlushContextRing,

    /// Segment name counter; `meta.counter` mirrors it at commit.
    seg_counter: AtomicU64,

    /// Names of segments currently involved in a consolidation.
    consolidating: Mutex<AHashSet<String>>,

    /// Last committed state; readable without the commit lock.
    committed: Mutex<Arc<CommittedState>>,

    /// Everything the commit lock guards.
    commit: Mutex<CommitState>,

    write_lock: Mutex<Option<Box<dyn StorageLock>>>,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriter")
            .field("codec", &self.codec.name())
            .field("segment_counter", &self.seg_counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl IndexWriter {
    /// Open a writer over `storage`.
    ///
    /// Fails with [`XystonError::LockObtainFailed`] when another writer
    /// holds the lock, and with [`XystonError::FileNotFound`] on
    /// [`OpenMode::Append`] against an empty directory.
    pub fn open<O: Into<OpenOptions>>(
        storage: Arc<dyn Storage>,
        codec: Arc<dyn Codec>,
        options: O,
    ) -> Result<IndexWriter> {
        let options = options.into();

        let mut write_lock = None;
        if !options.no_lock {
            let mut lock = storage.make_lock(codec::WRITE_LOCK_NAME)?;
            if !lock.try_lock()? {
                return Err(XystonError::lock_obtain_failed(codec::WRITE_LOCK_NAME));
            }
            write_lock = Some(lock);
        }

        let refs = FileRefs::new();
        let meta_reader = codec.index_meta_reader();
        let segments_file = meta_reader.last_segments_file(storage.as_ref())?;

        let mut meta = IndexMeta::new();
        let mut committed_refs: Vec<FileRef> = Vec::new();

        let create = options.mode == OpenMode::Create
            || (options.mode == OpenMode::CreateOrAppend && segments_file.is_none());

        if create {
            // carry the old generation forward so the fresh index meta
            // supersedes anything a concurrent reader still observes
            if let Some(filename) = &segments_file {
                match meta_reader.read(storage.as_ref(), filename) {
                    Ok(old) => {
                        meta.generation = old.generation;
                        meta.counter = old.counter;
                    }
                    Err(_) => meta = IndexMeta::new(),
                }
            }
        } else {
            let Some(filename) = &segments_file else {
                return Err(XystonError::file_not_found("no index meta in directory"));
            };
            meta = meta_reader.read(storage.as_ref(), filename)?;
            // the loaded meta is the committed one; its serialized
            // last_generation predates its own commit
            meta.last_generation = meta.generation;
            for file in meta.referenced_files() {
                committed_refs.push(refs.reference(file));
            }
            committed_refs.push(refs.reference(filename));
        }

        if write_lock.is_some() {
            committed_refs.push(refs.reference(codec::WRITE_LOCK_NAME));
        }

        let committed = Arc::new(CommittedState {
            meta: Arc::new(meta.clone()),
            refs: committed_refs,
        });

        let ring = FlushContextRing::new(
            &storage,
            &refs,
            &codec,
            options.ring_size,
            options.pool_size,
        );

        let writer = IndexWriter {
            seg_counter: AtomicU64::new(meta.counter),
            consolidating: Mutex::new(AHashSet::new()),
            committed: Mutex::new(Arc::clone(&committed)),
            commit: Mutex::new(CommitState {
                cached_readers: CachedReaders::new(Arc::clone(&storage), Arc::clone(&refs)),
                meta,
                pending: None,
                meta_writer: codec.index_meta_writer(),
            }),
            write_lock: Mutex::new(write_lock),
            storage,
            codec,
            refs,
            ring,
        };

        // collect orphans left behind by a crash between the commit phases
        let mut keep: AHashSet<String> = committed
            .meta
            .referenced_files()
            .map(str::to_string)
            .collect();
        if let Some(filename) = &segments_file {
            keep.insert(filename.clone());
        }
        keep.insert(codec::WRITE_LOCK_NAME.to_string());
        remove_unreferenced(writer.storage.as_ref(), &writer.refs, &keep)?;

        Ok(writer)
    }

    /// The codec new segments are written with.
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// The shared file refcount table.
    pub fn file_refs(&self) -> &Arc<FileRefs> {
        &self.refs
    }

    /// Overall number of buffered documents across the active context's
    /// writer pool.
    pub fn buffered_docs(&self) -> u64 {
        let lease = self.ring.get_shared();
        lease.ctx().buffered_docs()
    }

    /// Open a reader over the last committed state.
    pub fn reader(&self) -> Result<DirectoryReader> {
        let committed = Arc::clone(&*self.committed.lock());
        DirectoryReader::open(&self.storage, &self.refs, &committed.meta)
    }

    /// The last committed state.
    pub fn committed_state(&self) -> Arc<CommittedState> {
        Arc::clone(&*self.committed.lock())
    }

    // -----------------------------------------------------------------
    // ingest
    // -----------------------------------------------------------------

    fn init_writer(&self, ctx: &FlushContext) -> SegmentWriter {
        let mut writer = ctx.checkout_writer();
        if !writer.initialized() {
            let counter = self.seg_counter.fetch_add(1, Ordering::SeqCst) + 1;
            writer.reset(SegmentMeta::new(segment_name(counter), self.codec.name()));
        }
        writer
    }

    /// Insert one document. The closure may index and store fields;
    /// changes become visible at the next commit.
    ///
    /// Returns the document's validity; an invalid document is discarded.
    pub fn insert<F: FnOnce(&mut Document)>(&self, f: F) -> bool {
        let lease = self.ring.get_shared();
        let ctx = lease.ctx();
        let mut writer = self.init_writer(ctx);

        writer.begin(ctx.insert_context());
        {
            let mut doc = Document {
                writer: &mut writer,
            };
            f(&mut doc);
        }
        writer.commit();

        let valid = writer.valid();
        ctx.checkin_writer(writer);
        valid
    }

    /// Replace the documents matching `filter` with one new document.
    ///
    /// The new document is inserted optimistically; it becomes visible only
    /// if the filter matched at least one existing document at commit time.
    pub fn update<T: IntoFilter, F: FnOnce(&mut Document)>(&self, filter: T, f: F) -> bool {
        let lease = self.ring.get_shared();
        let ctx = lease.ctx();
        let mut writer = self.init_writer(ctx);

        let update_ctx = ctx.register_update(filter.into_filter());
        writer.begin(update_ctx);
        {
            let mut doc = Document {
                writer: &mut writer,
            };
            f(&mut doc);
        }
        writer.commit();

        let valid = writer.valid();
        if !valid {
            if let Some(update_id) = update_ctx.update_id {
                ctx.invalidate_update(update_id);
            }
        }
        ctx.checkin_writer(writer);
        valid
    }

    /// Enqueue a delete; no immediate effect. The filter observes all
    /// committed documents plus the documents of this context with an
    /// older generation.
    pub fn remove<T: IntoFilter>(&self, filter: T) {
        let lease = self.ring.get_shared();
        lease.ctx().register_remove(filter.into_filter());
    }

    // -----------------------------------------------------------------
    // import & consolidation
    // -----------------------------------------------------------------

    /// Absorb an external reader as one new pending segment.
    ///
    /// Returns `false` when the merge produced nothing.
    pub fn import(&self, reader: &dyn IndexReader) -> Result<bool> {
        if reader.live_docs_count() == 0 {
            return Ok(true);
        }

        let dir = Arc::new(RefTrackingStorage::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.refs),
        ));
        let counter = self.seg_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut merger = MergeWriter::new(dir.clone(), Arc::clone(&self.codec), segment_name(counter));
        for sub in reader.sub_readers() {
            merger.add(sub);
        }

        let Some((filename, meta)) = merger.flush()? else {
            return Ok(false);
        };

        let lease = self.ring.get_shared();
        let ctx = lease.ctx();
        let generation = ctx.generation();
        ctx.state.lock().pending_segments.push(PendingSegment {
            segment: IndexSegment { filename, meta },
            generation,
            refs: dir.refs(),
            consolidation: None,
        });

        Ok(true)
    }

    /// Register a merge of the committed segments selected by `policy`.
    ///
    /// Runs without the commit lock up to the registration point and may
    /// proceed concurrently with ingest. Returns `true` when the merge was
    /// accepted (the commit may still drop it when every merged document
    /// has been deleted since).
    pub fn consolidate(&self, policy: &dyn ConsolidationPolicy) -> Result<bool> {
        self.consolidate_with_codec(policy, Arc::clone(&self.codec))
    }

    /// [`IndexWriter::consolidate`] with an explicit codec for the merged
    /// segment.
    pub fn consolidate_with_codec(
        &self,
        policy: &dyn ConsolidationPolicy,
        codec: Arc<dyn Codec>,
    ) -> Result<bool> {
        // pin the committed state so the cleaner cannot touch candidate files
        let committed = self.committed_state();
        let committed_meta = Arc::clone(&committed.meta);

        let candidates = policy.candidates(self.storage.as_ref(), &committed_meta);
        if candidates.is_empty() {
            return Ok(true);
        }
        if candidates.len() == 1 {
            let Some(segment) = committed_meta
                .segments
                .iter()
                .find(|s| s.meta.name == candidates[0])
            else {
                return Ok(false);
            };
            if segment.meta.live_docs_count == segment.meta.docs_count {
                // no deletes, nothing to consolidate
                return Ok(true);
            }
        }

        // validate candidates against the committed snapshot
        let mut candidate_segments = Vec::with_capacity(candidates.len());
        for name in &candidates {
            match committed_meta.segments.iter().find(|s| s.meta.name == *name) {
                Some(segment) => candidate_segments.push(segment.clone()),
                None => {
                    warn!(
                        generation = committed_meta.generation,
                        candidate = %name,
                        "consolidation candidate not in committed meta"
                    );
                    return Ok(false);
                }
            }
        }

        // register the candidates; overlapping consolidations lose
        {
            let mut registered = self.consolidating.lock();
            if candidates.iter().any(|name| registered.contains(name)) {
                return Ok(false);
            }
            registered.extend(candidates.iter().cloned());
        }
        let _guard = ConsolidationGuard {
            registered: &self.consolidating,
            names: candidates.clone(),
        };

        // merge without holding any writer lock
        let dir = Arc::new(RefTrackingStorage::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.refs),
        ));
        let counter = self.seg_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut merger = MergeWriter::new(dir.clone(), codec, segment_name(counter));

        {
            let mut commit = self.commit.lock();
            for segment in &candidate_segments {
                merger.add(Arc::new(commit.cached_readers.get(&segment.meta)?));
            }
        }

        let Some((filename, mut meta)) = merger.flush()? else {
            return Ok(false);
        };

        // register the result
        let mut commit = self.commit.lock();
        let current_committed = self.committed_state();

        if commit.pending.is_some() {
            // a transaction is in flight; stage the merge for the next one,
            // carrying the merge context so commit-time reconciliation can
            // remap deletes through the doc maps
            let lease = self.ring.get_shared();
            let ctx = lease.ctx();
            let generation = ctx.generation();
            ctx.state.lock().pending_segments.push(PendingSegment {
                segment: IndexSegment { filename, meta },
                generation,
                refs: dir.refs(),
                consolidation: Some(ConsolidationCtx {
                    candidates,
                    merger,
                    committed_meta,
                }),
            });
            return Ok(true);
        }

        if !Arc::ptr_eq(&committed_meta, &current_committed.meta) {
            // a commit landed while merging; remap deletes that reached the
            // candidates since the merge snapshot
            let mut docs_mask = RoaringBitmap::new();
            for (index, name) in candidates.iter().enumerate() {
                let Some(current) = current_committed
                    .meta
                    .segments
                    .iter()
                    .find(|s| s.meta.name == *name)
                else {
                    warn!(
                        segment = %meta.name,
                        candidate = %name,
                        "consolidation candidate vanished from committed meta"
                    );
                    return Ok(false);
                };

                let snapshot = committed_meta
                    .segments
                    .iter()
                    .find(|s| s.meta.name == *name)
                    .expect("candidate validated against the snapshot");

                if current.meta.version != snapshot.meta.version {
                    let reader = commit.cached_readers.get(&current.meta)?;
                    let candidate = merger.candidate(index);
                    let removed = candidate.live_at_merge() - reader.live_docs();
                    for old in removed {
                        let mapped = candidate.map_doc(old);
                        if mapped != INVALID_DOC {
                            docs_mask.insert(mapped);
                        }
                    }
                }
            }

            if !docs_mask.is_empty() {
                meta.live_docs_count -= docs_mask.len();
                write_document_mask(self.codec.as_ref(), dir.as_ref(), &mut meta, &docs_mask, false)?;
                self.codec
                    .segment_meta_writer()
                    .write(dir.as_ref(), &meta)?;
            }
        }

        // no transaction in flight: publish into the active context and
        // hide the candidates from the next commit
        let lease = self.ring.get_shared();
        let ctx = lease.ctx();
        let mut state = ctx.state.lock();
        if candidates.iter().any(|name| state.segment_mask.contains(name)) {
            // another consolidation already claimed a candidate in this
            // context
            return Ok(false);
        }
        state.segment_mask.extend(candidates.iter().cloned());
        state.pending_segments.push(PendingSegment {
            segment: IndexSegment { filename, meta },
            generation: 0,
            refs: dir.refs(),
            consolidation: None,
        });

        Ok(true)
    }

    /// Defer a consolidation policy to the next commit.
    ///
    /// The policy is evaluated inside `flush_all`, after deletes have been
    /// applied, against every segment of the commit (sealed, pending and
    /// freshly flushed); matching segments are merged synchronously under
    /// the commit lock.
    pub fn consolidate_deferred(&self, policy: Arc<dyn ConsolidationPolicy>) {
        let lease = self.ring.get_shared();
        lease.ctx().state.lock().deferred_policies.push(policy);
    }

    // -----------------------------------------------------------------
    // transaction protocol
    // -----------------------------------------------------------------

    /// Start the two-phase transaction. Returns `false` when a transaction
    /// is already in flight or there is nothing to commit.
    pub fn begin(&self) -> Result<bool> {
        let mut commit = self.commit.lock();
        self.start(&mut commit)
    }

    /// Make all buffered changes visible to readers.
    pub fn commit(&self) -> Result<()> {
        let mut commit = self.commit.lock();
        self.start(&mut commit)?;
        self.finish(&mut commit)
    }

    /// Roll back the two-phase transaction, restoring the committed
    /// segment list.
    pub fn rollback(&self) -> Result<()> {
        let mut commit = self.commit.lock();

        if commit.pending.take().is_none() {
            return Ok(());
        }
        commit.meta_writer.rollback();

        let committed = self.committed_state();
        commit.meta.generation = committed.meta.generation;
        commit.meta.last_generation = committed.meta.last_generation;
        commit.meta.segments = committed.meta.segments.clone();
        Ok(())
    }

    /// Atomically replace the index with an empty one.
    pub fn clear(&self) -> Result<()> {
        let mut commit = self.commit.lock();

        if commit.pending.is_none() && commit.meta.is_empty() && commit.meta.last_generation != 0 {
            // "already empty" requires a clean active context too: buffered
            // documents, queued modifications and pending segments would all
            // survive an early return
            let idle = {
                let lease = self.ring.get_shared();
                let ctx = lease.ctx();
                let state = ctx.state.lock();
                state.modifications.is_empty()
                    && state.pending_segments.is_empty()
                    && state.segment_mask.is_empty()
                    && state.deferred_policies.is_empty()
                    && ctx.buffered_docs() == 0
            };
            if idle {
                return Ok(());
            }
        }

        let lease = self.ring.get_exclusive();
        commit.cached_readers.clear();

        let mut pending_meta = IndexMeta::new();
        pending_meta.update_generation(&commit.meta);
        pending_meta.counter = self.seg_counter.load(Ordering::SeqCst);

        let dir: Arc<dyn Storage> = Arc::clone(&lease.ctx().dir) as Arc<dyn Storage>;
        commit.meta_writer.prepare(dir, &mut pending_meta)?;

        commit.meta.update_generation(&pending_meta);
        commit.pending = Some(PendingState {
            lease,
            meta: pending_meta,
            _refs: Vec::new(),
        });
        self.finish(&mut commit)?;
        commit.meta.segments.clear();
        Ok(())
    }

    /// Close the writer, releasing the write lock.
    pub fn close(&self) {
        {
            let mut commit = self.commit.lock();
            commit.cached_readers.clear();
        }
        if let Some(mut lock) = self.write_lock.lock().take() {
            let _ = lock.unlock();
        }
    }

    fn start(&self, commit: &mut CommitState) -> Result<bool> {
        if commit.pending.is_some() {
            // begin has already been called without a matching finish
            return Ok(false);
        }

        let Some(mut pending_ctx) = self.flush_all(commit)? else {
            // nothing to commit, no transaction started
            return Ok(false);
        };

        // phase one: tentative index meta
        let dir: Arc<dyn Storage> = Arc::clone(&pending_ctx.lease.ctx().dir) as Arc<dyn Storage>;
        commit.meta_writer.prepare(dir, &mut pending_ctx.meta)?;

        // the generation is burned whether or not the sync succeeds
        commit.meta.update_generation(&pending_ctx.meta);

        for file in &pending_ctx.to_sync {
            if let Err(e) = pending_ctx.lease.ctx().dir.sync(file) {
                // clear the tentative meta; the next commit will write a
                // fresh one and sync again
                commit.meta_writer.rollback();
                let error = match e {
                    XystonError::SyncFailed { .. } => e,
                    other => XystonError::sync_failed(
                        file.clone(),
                        std::io::Error::other(other.to_string()),
                    ),
                };
                return Err(error);
            }
        }

        commit.pending = Some(PendingState {
            lease: pending_ctx.lease,
            meta: pending_ctx.meta,
            _refs: pending_ctx.refs,
        });
        Ok(true)
    }

    fn finish(&self, commit: &mut CommitState) -> Result<()> {
        let Some(pending) = commit.pending.take() else {
            return Ok(());
        };

        // capture the committed-state bundle before publishing
        let mut refs: Vec<FileRef> = Vec::new();
        if self.write_lock.lock().is_some() {
            refs.push(self.refs.reference(codec::WRITE_LOCK_NAME));
        }
        refs.push(self.refs.reference(&commit.meta_writer.filename(&pending.meta)));
        for file in pending.meta.referenced_files() {
            refs.push(self.refs.reference(file));
        }

        // phase two
        if let Err(e) = commit.meta_writer.commit() {
            commit.pending = Some(pending);
            return Err(e);
        }

        // infallible tail
        commit.meta.last_generation = pending.meta.generation;
        let mut committed_meta = pending.meta;
        committed_meta.last_generation = committed_meta.generation;
        let committed = Arc::new(CommittedState {
            meta: Arc::new(committed_meta),
            refs,
        });
        *self.committed.lock() = committed;
        // dropping the lease resets the sealed flush context
        drop(pending.lease);
        Ok(())
    }

    // -----------------------------------------------------------------
    // flush_all
    // -----------------------------------------------------------------

    fn flush_all(&self, commit: &mut CommitState) -> Result<Option<PendingContext>> {
        // a commit is forced whenever the active meta diverges from the
        // durably committed one: a fresh index, a generation burned by an
        // interrupted transaction (e.g. a sync failure after phase one), or
        // a segment list that never reached a committed meta
        let committed = self.committed_state();
        let mut modified = commit.meta.last_generation == 0
            || commit.meta.generation != commit.meta.last_generation
            || commit.meta.segments != committed.meta.segments;
        let mut segments: Vec<IndexSegment> = Vec::new();
        let mut to_sync: AHashSet<String> = AHashSet::new();
        let mut carried_refs: Vec<FileRef> = Vec::new();

        let lease = self.ring.get_exclusive();
        let ctx = Arc::clone(lease.ctx());
        let mut state = ctx.state.lock();

        // Stage 1: apply deletes to sealed segments
        let sealed = commit.meta.segments.clone();
        for segment in sealed {
            if state.segment_mask.contains(&segment.meta.name) {
                continue;
            }

            segments.push(segment);
            let segment = segments.last_mut().expect("just pushed");

            let reader = commit.cached_readers.get(&segment.meta)?;
            let mut docs_mask = reader.docs_mask().clone();

            let changed = apply_modifications_to_mask(
                &mut state.modifications,
                &reader,
                &mut docs_mask,
                &mut segment.meta,
                0,
            )?;

            if changed {
                if docs_mask.len() == segment.meta.docs_count {
                    // every document is masked; drop the segment
                    segments.pop();
                    modified = true;
                    continue;
                }

                let mask_file = write_document_mask(
                    self.codec.as_ref(),
                    ctx.dir.as_ref(),
                    &mut segment.meta,
                    &docs_mask,
                    true,
                )?;
                to_sync.insert(mask_file);
                segment.filename = self
                    .codec
                    .segment_meta_writer()
                    .write(ctx.dir.as_ref(), &segment.meta)?;
                modified = true;
            }
        }

        // Stage 2: finalize pending segments (imports, consolidations)
        let pending_segments: Vec<PendingSegment> = state.pending_segments.drain(..).collect();
        for mut pending in pending_segments {
            let mut docs_mask = RoaringBitmap::new();

            if let Some(consolidation) = &pending.consolidation {
                // candidates must still be present in this commit's view
                let mut current = Vec::with_capacity(consolidation.candidates.len());
                for name in &consolidation.candidates {
                    current.push(segments.iter().find(|s| s.meta.name == *name).cloned());
                }
                if current.iter().any(Option::is_none) {
                    warn!(
                        segment = %pending.segment.meta.name,
                        "dropping consolidation: candidate missing from commit"
                    );
                    continue;
                }

                // remap deletes that reached a candidate after the merge
                // snapshot through the merge doc map
                for (index, (name, current)) in consolidation
                    .candidates
                    .iter()
                    .zip(current.iter())
                    .enumerate()
                {
                    let current = current.as_ref().expect("validated above");
                    let snapshot_version = consolidation
                        .committed_meta
                        .segments
                        .iter()
                        .find(|s| s.meta.name == *name)
                        .map(|s| s.meta.version);

                    if snapshot_version != Some(current.meta.version) {
                        let reader = commit.cached_readers.get(&current.meta)?;
                        let candidate = consolidation.merger.candidate(index);
                        let removed = candidate.live_at_merge() - reader.live_docs();
                        for old in removed {
                            let mapped = candidate.map_doc(old);
                            if mapped != INVALID_DOC {
                                docs_mask.insert(mapped);
                            }
                        }
                    }
                }

                // the merged segment replaces its candidates
                state
                    .segment_mask
                    .extend(consolidation.candidates.iter().cloned());

                if !docs_mask.is_empty() {
                    pending.segment.meta.live_docs_count -= docs_mask.len();
                    write_document_mask(
                        self.codec.as_ref(),
                        ctx.dir.as_ref(),
                        &mut pending.segment.meta,
                        &docs_mask,
                        false,
                    )?;
                }
                pending.segment.filename = self
                    .codec
                    .segment_meta_writer()
                    .write(ctx.dir.as_ref(), &pending.segment.meta)?;
            }

            segments.push(pending.segment);
            let segment = segments.last_mut().expect("just pushed");

            // apply the delete queue restricted to requests at or past the
            // segment's registration generation; the mask keeps anything
            // the doc-map reconciliation produced
            let reader = commit.cached_readers.get(&segment.meta)?;
            let changed = apply_modifications_to_mask(
                &mut state.modifications,
                &reader,
                &mut docs_mask,
                &mut segment.meta,
                pending.generation,
            )?;

            if segment.meta.live_docs_count == 0 {
                segments.pop();
                modified = true;
                continue;
            }

            if changed {
                write_document_mask(
                    self.codec.as_ref(),
                    ctx.dir.as_ref(),
                    &mut segment.meta,
                    &docs_mask,
                    true,
                )?;
                segment.filename = self
                    .codec
                    .segment_meta_writer()
                    .write(ctx.dir.as_ref(), &segment.meta)?;
            }

            to_sync.extend(segment.meta.files.iter().cloned());
            carried_refs.extend(pending.refs);
        }

        // Stage 3: finalize the in-progress segment writers
        {
            let mut writers = ctx.pooled_writers();
            for writer in writers.iter_mut() {
                if !writer.initialized() || writer.docs_cached() == 0 {
                    continue;
                }

                let (filename, mut meta) = writer.flush()?;
                let reader = commit.cached_readers.get(&meta)?;
                apply_modifications_to_writer(&mut state.modifications, &reader, writer, &mut meta)?;
                mask_unused_update_placeholders(&state.modifications, writer, &mut meta);

                let docs_mask = writer.docs_mask().clone();
                if docs_mask.len() == meta.docs_count {
                    // nothing visible was ever committed in this segment
                    state.segment_mask.insert(meta.name.clone());
                    segments.push(IndexSegment { filename, meta });
                    continue;
                }

                let mut segment = IndexSegment { filename, meta };
                if !docs_mask.is_empty() {
                    write_document_mask(
                        self.codec.as_ref(),
                        ctx.dir.as_ref(),
                        &mut segment.meta,
                        &docs_mask,
                        true,
                    )?;
                    segment.filename = self
                        .codec
                        .segment_meta_writer()
                        .write(ctx.dir.as_ref(), &segment.meta)?;
                }

                to_sync.extend(segment.meta.files.iter().cloned());
                segments.push(segment);
            }
        }

        // Stage 4: deferred consolidation policies, over the commit's full
        // segment list with all deletes applied
        let deferred: Vec<Arc<dyn ConsolidationPolicy>> =
            state.deferred_policies.drain(..).collect();
        for policy in deferred {
            let view = IndexMeta {
                generation: commit.meta.generation,
                last_generation: commit.meta.last_generation,
                counter: self.seg_counter.load(Ordering::SeqCst),
                segments: segments
                    .iter()
                    .filter(|s| !state.segment_mask.contains(&s.meta.name))
                    .cloned()
                    .collect(),
            };

            let mut candidates = policy.candidates(self.storage.as_ref(), &view);
            candidates.retain(|name| !state.segment_mask.contains(name));
            if candidates.is_empty() {
                continue;
            }
            if candidates.len() == 1 {
                let no_deletes = view
                    .segments
                    .iter()
                    .find(|s| s.meta.name == candidates[0])
                    .map(|s| s.meta.live_docs_count == s.meta.docs_count)
                    .unwrap_or(true);
                if no_deletes {
                    continue;
                }
            }

            let counter = self.seg_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let mut merger = MergeWriter::new(
                Arc::clone(&ctx.dir),
                Arc::clone(&self.codec),
                segment_name(counter),
            );
            for name in &candidates {
                let segment = view
                    .segments
                    .iter()
                    .find(|s| s.meta.name == *name)
                    .expect("candidate selected from the view");
                merger.add(Arc::new(commit.cached_readers.get(&segment.meta)?));
            }

            state.segment_mask.extend(candidates.iter().cloned());
            modified = true;

            if let Some((filename, meta)) = merger.flush()? {
                debug!(segment = %meta.name, candidates = candidates.len(), "deferred consolidation merged");
                to_sync.extend(meta.files.iter().cloned());
                segments.push(IndexSegment { filename, meta });
            }
        }

        // retain only non-masked segments in the pending meta
        let mut pending_meta = IndexMeta {
            generation: commit.meta.generation,
            last_generation: commit.meta.last_generation,
            counter: self.seg_counter.load(Ordering::SeqCst),
            segments: Vec::new(),
        };
        let mut live_names: AHashSet<String> = AHashSet::new();
        for segment in segments {
            if state.segment_mask.contains(&segment.meta.name) {
                commit.cached_readers.remove(&segment.meta.name);
            } else {
                live_names.insert(segment.meta.name.clone());
                pending_meta.segments.push(segment);
            }
        }
        commit.cached_readers.retain(&live_names);

        // files requiring a durability barrier, plus each owning meta file
        let mut sync_list = Vec::new();
        for segment in &pending_meta.segments {
            let mut sync_segment = false;
            for file in &segment.meta.files {
                if to_sync.remove(file) {
                    sync_list.push(file.clone());
                    sync_segment = true;
                }
            }
            if sync_segment {
                sync_list.push(segment.filename.clone());
            }
        }
        modified |= !sync_list.is_empty();

        if !modified {
            // no change; the lease release resets the sealed context
            return Ok(None);
        }

        commit.meta.segments = pending_meta.segments.clone();
        drop(state);

        Ok(Some(PendingContext {
            lease,
            meta: pending_meta,
            to_sync: sync_list,
            refs: carried_refs,
        }))
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// flush helpers
// ---------------------------------------------------------------------------

/// Evaluate every modification request against `reader`, inserting matches
/// into `docs_mask`. Requests older than `min_generation` are skipped.
/// Returns whether any new document was masked.
fn apply_modifications_to_mask(
    requests: &mut [ModificationRequest],
    reader: &SegmentReader,
    docs_mask: &mut RoaringBitmap,
    meta: &mut SegmentMeta,
    min_generation: Generation,
) -> Result<bool> {
    let mut modified = false;

    for request in requests.iter_mut() {
        let Some(filter) = request.filter.clone() else {
            continue;
        };
        if request.generation < min_generation {
            continue;
        }

        let prepared = filter.prepare(reader)?;
        let mut matches = prepared.execute(reader)?;
        while matches.next() {
            let doc = matches.value();
            if docs_mask.insert(doc) {
                meta.live_docs_count -= 1;
                request.seen = true;
                modified = true;
            }
        }
    }

    Ok(modified)
}

/// Evaluate every modification request against a freshly flushed writer
/// segment, honoring per-document generations and placeholder protection.
fn apply_modifications_to_writer(
    requests: &mut Vec<ModificationRequest>,
    reader: &SegmentReader,
    writer: &mut SegmentWriter,
    meta: &mut SegmentMeta,
) -> Result<bool> {
    let mut modified = false;

    for index in 0..requests.len() {
        let Some(filter) = requests[index].filter.clone() else {
            continue;
        };
        let generation = requests[index].generation;
        let is_update = requests[index].is_update;

        let prepared = filter.prepare(reader)?;
        let mut matches = prepared.execute(reader)?;
        while matches.next() {
            let doc = matches.value();
            let slot = (doc - FIRST_DOC) as usize;
            let Some(doc_ctx) = writer.doc_contexts().get(slot).copied() else {
                continue;
            };

            // a document indexed after the request is not a match
            if generation < doc_ctx.generation {
                continue;
            }

            // replacement inserts whose originating update has not matched
            // anything stay untouched; their fate is decided by the
            // unused-placeholder pass
            if is_update {
                if let Some(update_id) = doc_ctx.update_id {
                    if !requests[update_id].seen {
                        continue;
                    }
                }
            }

            if writer.remove(doc) {
                meta.live_docs_count -= 1;
                requests[index].seen = true;
                modified = true;
            }
        }
    }

    Ok(modified)
}

/// Mask replacement inserts whose originating modification request never
/// matched a document.
fn mask_unused_update_placeholders(
    requests: &[ModificationRequest],
    writer: &mut SegmentWriter,
    meta: &mut SegmentMeta,
) -> bool {
    let mut modified = false;
    let contexts: Vec<_> = writer.doc_contexts().to_vec();

    for (slot, doc_ctx) in contexts.iter().enumerate() {
        let Some(update_id) = doc_ctx.update_id else {
            continue;
        };
        if requests.get(update_id).map(|r| r.seen).unwrap_or(true) {
            continue;
        }
        let doc = FIRST_DOC + slot as u32;
        if writer.remove(doc) {
            meta.live_docs_count -= 1;
            modified = true;
        }
    }

    modified
}

/// Persist a document mask for `meta`, optionally bumping the segment
/// version (a new mask supersedes the previous one).
fn write_document_mask(
    codec: &dyn Codec,
    dir: &dyn Storage,
    meta: &mut SegmentMeta,
    docs_mask: &RoaringBitmap,
    increment_version: bool,
) -> Result<String> {
    let mut writer = codec.document_mask_writer();

    if increment_version {
        let previous = writer.filename(meta);
        meta.files.remove(&previous);
        meta.version += 1;
    }

    let filename = writer.filename(meta);
    meta.files.insert(filename.clone());

    writer.prepare(dir, meta)?;
    writer.begin(docs_mask.len() as u32)?;
    for doc in docs_mask {
        writer.write(doc)?;
    }
    writer.end()?;

    Ok(filename)
}
