//! Flush contexts: reusable accumulators for one unit of uncommitted work.
//!
//! A flush context collects everything between two commits: a ref-tracking
//! directory view, a pool of segment writers, the modification queue, the
//! pending (imported or consolidated) segments and the mask of segment names
//! to hide. The writer keeps a fixed ring of contexts (size >= 2): ingest
//! pins the active one in shared mode; a committing thread seals it by
//! swapping the active index to the next ring position and taking the
//! context's write lock, which drains all shared pinners first.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};

use crate::codec::Codec;
use crate::filter::Filter;
use crate::index::file_refs::{FileRef, FileRefs, RefTrackingStorage};
use crate::index::merge::MergeWriter;
use crate::index::meta::{IndexMeta, IndexSegment};
use crate::index::segment_writer::{SegmentWriter, UpdateContext};
use crate::storage::Storage;
use crate::types::Generation;

/// A queued delete or update.
#[derive(Debug)]
pub struct ModificationRequest {
    /// The match filter; `None` marks a request invalidated by a failed
    /// replacement insert.
    pub filter: Option<Arc<dyn Filter>>,

    /// Generation the request was submitted at.
    pub generation: Generation,

    /// True for updates (replacement inserts follow), false for removes.
    pub is_update: bool,

    /// Set once at least one document matched the filter.
    pub seen: bool,
}

/// Reconciliation context of a consolidation that must be remapped at
/// commit time.
pub struct ConsolidationCtx {
    /// Candidate segment names, in merge order.
    pub candidates: Vec<String>,

    /// The merge writer, retaining per-candidate live snapshots and doc
    /// maps.
    pub merger: MergeWriter,

    /// The committed meta the candidates were selected from.
    pub committed_meta: Arc<IndexMeta>,
}

/// A complete segment awaiting inclusion in the next commit.
pub struct PendingSegment {
    /// The segment (meta plus primary filename).
    pub segment: IndexSegment,

    /// Modification requests with `generation >= this` still apply to the
    /// segment during commit.
    pub generation: Generation,

    /// File handles keeping the segment's files alive until commit.
    pub refs: Vec<FileRef>,

    /// Present when candidate masks must be reconciled through the merge
    /// doc maps.
    pub consolidation: Option<ConsolidationCtx>,
}

/// Mutable queue state of one flush context.
#[derive(Default)]
pub struct FlushState {
    /// Deletes and updates in submission order.
    pub modifications: Vec<ModificationRequest>,

    /// Imported and consolidated segments for the next commit.
    pub pending_segments: Vec<PendingSegment>,

    /// Segment names to drop from the index at the next commit.
    pub segment_mask: AHashSet<String>,

    /// Consolidation policies to evaluate during the next commit.
    pub deferred_policies: Vec<Arc<dyn crate::index::policy::ConsolidationPolicy>>,
}

struct WriterPool {
    idle: Mutex<Vec<SegmentWriter>>,
    available: Condvar,
    created: AtomicUsize,
    capacity: usize,
}

/// One reusable accumulator in the flush ring.
pub struct FlushContext {
    /// Totally orders ingest and modification requests in this context.
    generation: AtomicU64,

    /// Ref-tracking directory view used by everything in this context.
    pub dir: Arc<RefTrackingStorage>,

    /// Shared pin (read) for ingest, exclusive (write) for sealing.
    flush_mutex: Arc<RwLock<()>>,

    /// Queue state.
    pub state: Mutex<FlushState>,

    writers: WriterPool,
    codec: Arc<dyn Codec>,

    /// Ring position of the successor context.
    next: usize,
}

impl std::fmt::Debug for FlushContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushContext")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("next", &self.next)
            .finish()
    }
}

impl FlushContext {
    fn new(
        storage: Arc<dyn Storage>,
        table: Arc<FileRefs>,
        codec: Arc<dyn Codec>,
        pool_size: usize,
        next: usize,
    ) -> Self {
        FlushContext {
            generation: AtomicU64::new(0),
            dir: Arc::new(RefTrackingStorage::new(storage, table)),
            flush_mutex: Arc::new(RwLock::new(())),
            state: Mutex::new(FlushState::default()),
            writers: WriterPool {
                idle: Mutex::new(Vec::new()),
                available: Condvar::new(),
                created: AtomicUsize::new(0),
                capacity: pool_size,
            },
            codec,
            next,
        }
    }

    /// Current generation counter value.
    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::SeqCst)
    }

    /// Update context for a plain insert: the current generation.
    pub fn insert_context(&self) -> UpdateContext {
        UpdateContext::insert(self.generation.load(Ordering::SeqCst))
    }

    /// Register a remove. The filter observes everything committed plus
    /// every document of this context with a strictly older generation.
    pub fn register_remove(&self, filter: Arc<dyn Filter>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.lock().modifications.push(ModificationRequest {
            filter: Some(filter),
            generation,
            is_update: false,
            seen: false,
        });
    }

    /// Register an update and return the context its replacement documents
    /// carry. The filter observes generations up to (excluding) the
    /// replacement documents.
    pub fn register_update(&self, filter: Arc<dyn Filter>) -> UpdateContext {
        let previous = self.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let update_id = state.modifications.len();
        state.modifications.push(ModificationRequest {
            filter: Some(filter),
            generation: previous,
            is_update: true,
            seen: false,
        });
        UpdateContext::update(previous + 1, update_id)
    }

    /// Invalidate the filter of a modification request (its replacement
    /// insert failed).
    pub fn invalidate_update(&self, update_id: usize) {
        if let Some(request) = self.state.lock().modifications.get_mut(update_id) {
            request.filter = None;
        }
    }

    /// Check out an idle segment writer, blocking when the pool is
    /// exhausted.
    pub fn checkout_writer(&self) -> SegmentWriter {
        let mut idle = self.writers.idle.lock();
        loop {
            if let Some(writer) = idle.pop() {
                return writer;
            }
            if self.writers.created.load(Ordering::SeqCst) < self.writers.capacity {
                self.writers.created.fetch_add(1, Ordering::SeqCst);
                return SegmentWriter::new(Arc::clone(&self.dir), Arc::clone(&self.codec));
            }
            self.writers.available.wait(&mut idle);
        }
    }

    /// Return a writer to the pool.
    pub fn checkin_writer(&self, writer: SegmentWriter) {
        self.writers.idle.lock().push(writer);
        self.writers.available.notify_one();
    }

    /// Run `f` over every idle writer. With the context sealed this visits
    /// every writer of the context.
    pub fn visit_writers<F: FnMut(&mut SegmentWriter)>(&self, mut f: F) {
        let mut idle = self.writers.idle.lock();
        for writer in idle.iter_mut() {
            f(writer);
        }
    }

    /// Sum of buffered documents across idle writers.
    pub fn buffered_docs(&self) -> u64 {
        let idle = self.writers.idle.lock();
        idle.iter().map(|w| w.docs_cached()).sum()
    }

    /// Direct access to the pooled writers. Only meaningful while the
    /// context is sealed (no writer can be checked out concurrently).
    pub fn pooled_writers(&self) -> parking_lot::MutexGuard<'_, Vec<SegmentWriter>> {
        self.writers.idle.lock()
    }

    /// Reset the context for reuse: clear refs, queues and every writer.
    fn reset(&self) {
        self.generation.store(0, Ordering::SeqCst);
        self.dir.clear_refs();
        {
            let mut state = self.state.lock();
            state.modifications.clear();
            state.pending_segments.clear();
            state.segment_mask.clear();
            state.deferred_policies.clear();
        }
        self.visit_writers(|writer| writer.clear());
    }
}

enum LeaseGuard {
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// A pin on a flush context.
///
/// Shared leases allow concurrent ingest; an exclusive lease seals the
/// context for flushing. Dropping an exclusive lease resets the context,
/// making it available as the next ring position.
pub struct FlushContextLease {
    ctx: Arc<FlushContext>,
    guard: Option<LeaseGuard>,
}

impl FlushContextLease {
    /// The pinned context.
    pub fn ctx(&self) -> &Arc<FlushContext> {
        &self.ctx
    }

    /// True when this lease seals the context.
    pub fn is_exclusive(&self) -> bool {
        matches!(self.guard, Some(LeaseGuard::Exclusive(_)))
    }
}

impl Drop for FlushContextLease {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            match guard {
                LeaseGuard::Exclusive(guard) => {
                    self.ctx.reset();
                    drop(guard);
                }
                LeaseGuard::Shared(guard) => drop(guard),
            }
        }
    }
}

/// The fixed ring of flush contexts plus the active index.
pub struct FlushContextRing {
    contexts: Vec<Arc<FlushContext>>,
    active: AtomicUsize,
}

impl FlushContextRing {
    /// Build a ring of `size >= 2` contexts over the same storage and
    /// refcount table.
    pub fn new(
        storage: &Arc<dyn Storage>,
        table: &Arc<FileRefs>,
        codec: &Arc<dyn Codec>,
        size: usize,
        pool_size: usize,
    ) -> Self {
        let size = size.max(2);
        let contexts = (0..size)
            .map(|i| {
                Arc::new(FlushContext::new(
                    Arc::clone(storage),
                    Arc::clone(table),
                    Arc::clone(codec),
                    pool_size,
                    (i + 1) % size,
                ))
            })
            .collect();
        FlushContextRing {
            contexts,
            active: AtomicUsize::new(0),
        }
    }

    /// Pin the active context in shared mode.
    pub fn get_shared(&self) -> FlushContextLease {
        loop {
            let index = self.active.load(Ordering::SeqCst);
            let ctx = Arc::clone(&self.contexts[index]);

            match ctx.flush_mutex.try_read_arc() {
                Some(guard) => {
                    // the active index may have moved while acquiring
                    if self.active.load(Ordering::SeqCst) == index {
                        return FlushContextLease {
                            ctx,
                            guard: Some(LeaseGuard::Shared(guard)),
                        };
                    }
                }
                None => std::thread::yield_now(),
            }
        }
    }

    /// Seal the active context: take its write lock (draining shared
    /// pinners) and swap the active index to its successor.
    pub fn get_exclusive(&self) -> FlushContextLease {
        loop {
            let index = self.active.load(Ordering::SeqCst);
            let ctx = Arc::clone(&self.contexts[index]);
            let guard = ctx.flush_mutex.write_arc();

            if self
                .active
                .compare_exchange(index, ctx.next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return FlushContextLease {
                    ctx,
                    guard: Some(LeaseGuard::Exclusive(guard)),
                };
            }
        }
    }
}

impl std::fmt::Debug for FlushContextRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushContextRing")
            .field("size", &self.contexts.len())
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::default_codec;
    use crate::filter::{IntoFilter, TermFilter};
    use crate::storage::memory::MemoryStorage;

    fn ring() -> FlushContextRing {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let table = FileRefs::new();
        FlushContextRing::new(&storage, &table, &default_codec(), 2, 4)
    }

    #[test]
    fn test_generation_ordering() {
        let ring = ring();
        let lease = ring.get_shared();
        let ctx = lease.ctx();

        // insert before a remove keeps an older generation
        let d1 = ctx.insert_context();
        ctx.register_remove(TermFilter::new("f", "t").into_filter());
        let d2 = ctx.insert_context();

        let state = ctx.state.lock();
        let remove_generation = state.modifications[0].generation;
        assert!(d1.generation <= remove_generation);
        assert!(d2.generation > remove_generation);
    }

    #[test]
    fn test_update_generations() {
        let ring = ring();
        let lease = ring.get_shared();
        let ctx = lease.ctx();

        let d1 = ctx.insert_context();
        let upd = ctx.register_update(TermFilter::new("f", "t").into_filter());

        let state = ctx.state.lock();
        let filter_generation = state.modifications[0].generation;
        // the filter observes the earlier insert
        assert!(filter_generation >= d1.generation);
        // replacement docs are newer than the filter
        assert!(upd.generation > filter_generation);
        assert_eq!(upd.update_id, Some(0));
    }

    #[test]
    fn test_exclusive_swaps_active() {
        let ring = ring();

        let shared = ring.get_shared();
        let first = Arc::as_ptr(shared.ctx());
        drop(shared);

        let exclusive = ring.get_exclusive();
        assert!(exclusive.is_exclusive());
        assert_eq!(Arc::as_ptr(exclusive.ctx()), first);

        // new shared pins land on the successor
        let shared = ring.get_shared();
        assert_ne!(Arc::as_ptr(shared.ctx()), first);
    }

    #[test]
    fn test_exclusive_release_resets() {
        let ring = ring();

        {
            let shared = ring.get_shared();
            let ctx = shared.ctx();
            ctx.register_remove(TermFilter::new("f", "t").into_filter());
            assert_eq!(ctx.state.lock().modifications.len(), 1);
        }

        {
            let exclusive = ring.get_exclusive();
            assert_eq!(exclusive.ctx().state.lock().modifications.len(), 1);
        }

        // after release the sealed context is clean again
        let exclusive = ring.get_exclusive(); // swaps back to the first ctx
        drop(exclusive);
        let lease = ring.get_shared();
        assert_eq!(lease.ctx().state.lock().modifications.len(), 0);
        assert_eq!(lease.ctx().generation(), 0);
    }

    #[test]
    fn test_writer_pool_checkout_checkin() {
        let ring = ring();
        let lease = ring.get_shared();
        let ctx = lease.ctx();

        let writer = ctx.checkout_writer();
        assert!(!writer.initialized());
        ctx.checkin_writer(writer);
        assert_eq!(ctx.buffered_docs(), 0);
    }

    #[test]
    fn test_shared_pins_are_concurrent() {
        let ring = ring();
        let first = ring.get_shared();
        let second = ring.get_shared();
        assert_eq!(Arc::as_ptr(first.ctx()), Arc::as_ptr(second.ctx()));
    }
}
