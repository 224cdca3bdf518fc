//! The collector facade and collection-cycle state machine.
//!
//! One [`Collector`] is owned by one execution thread context; the type is
//! neither `Send` nor `Sync`. All public entry points route through a
//! `RefCell` so that a host callback (before-collect, finalizer, memory
//! event, heap walk) re-entering the collector is reported as a named usage
//! error instead of corrupting state.
//!
//! A collection cycle walks `Idle -> ResetMarks -> ScanRoots ->
//! (InlineMark | ConcurrentMark) -> Sweep -> (ConcurrentSweep drain) ->
//! Idle`. Reset and root scanning always run with the mutator stopped
//! (they execute on the mutator's own thread inside the collect call);
//! concurrent mark and sweep run on the background worker with handoff only
//! through jobs and notices.

use std::cell::{Cell, RefCell, RefMut};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use page_source::{PageSource, SystemPageSource};

use crate::attrs::ObjectAttributes;
use crate::barrier::{WriteBarrierTable, CARD_SIZE};
use crate::config::CollectorConfig;
use crate::error::{CollectorError, Result};
use crate::heap::{AddressClassifier, BlockEntry, HeapManager};
use crate::mark::{self, MarkStats, MarkWorkList};
use crate::metrics::{CollectionKind, GcMetrics, MemoryEventCallback, MemoryUsage, MetricsRecorder, PhaseTimer};
use crate::slab::SweepMode;
use crate::sweep::{BackgroundWorker, Job, Notice, SlabEnvelope, SweepCoordinator, WorkEnvelope};

/// Which collection the host asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    /// Stop-the-world mark and sweep of the whole heap.
    Exhaustive,
    /// Reduced-pause collection: densely live slabs are folded back for
    /// allocation without sweeping.
    Partial,
    /// Mark and sweep on the background worker; the mutator keeps running
    /// under the write barrier and the cycle completes at a later safe
    /// point. Falls back to exhaustive when no worker is configured.
    Concurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CyclePhase {
    Idle,
    ResetMarks,
    ScanRoots,
    InlineMark,
    ConcurrentMark,
    Sweep,
    ConcurrentSweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Idle,
    Collecting,
    BeforeCollect,
    Walking,
}

struct BeforeCollectEntry {
    target: usize,
    callback: Box<dyn FnMut(*mut u8)>,
}

struct CycleState {
    mode: CollectMode,
    start: Instant,
    timer: PhaseTimer,
    mark_stats: MarkStats,
    before_used: usize,
    reclaimed_objects: usize,
    cards_rescanned: usize,
}

struct CollectorInner {
    heap: HeapManager,
    barrier: Arc<WriteBarrierTable>,
    coordinator: SweepCoordinator,
    worker: Option<BackgroundWorker>,
    pinned: std::collections::HashMap<usize, u32>,
    regions: Vec<(usize, usize)>,
    before_collect: Vec<BeforeCollectEntry>,
    deferred_free: Vec<usize>,
    metrics: MetricsRecorder,
    phase: CyclePhase,
    /// Black allocation: set while a mark phase can run concurrently with
    /// the mutator, so new objects are born marked.
    mark_active: bool,
    cycle: Option<CycleState>,
    disabled: bool,
    entry: Rc<Cell<EntryKind>>,
}

/// A tracing, segregated-size-class garbage collector instance.
pub struct Collector {
    inner: RefCell<CollectorInner>,
    entry: Rc<Cell<EntryKind>>,
    barrier: Arc<WriteBarrierTable>,
}

struct EntryGuard<'a> {
    cell: &'a Cell<EntryKind>,
    prev: EntryKind,
}

impl<'a> EntryGuard<'a> {
    fn enter(cell: &'a Cell<EntryKind>, kind: EntryKind) -> Self {
        let prev = cell.replace(kind);
        Self { cell, prev }
    }
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.cell.set(self.prev);
    }
}

impl Collector {
    /// Create a collector with the default configuration, backed by the
    /// system page source.
    ///
    /// # Errors
    ///
    /// Fails if the background worker thread cannot be spawned.
    pub fn new() -> Result<Self> {
        Self::with_config(CollectorConfig::default())
    }

    /// Create a collector with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails if the background worker thread cannot be spawned.
    pub fn with_config(config: CollectorConfig) -> Result<Self> {
        Self::with_page_source(config, Arc::new(SystemPageSource))
    }

    /// Create a collector drawing pages from a caller-supplied source.
    ///
    /// # Errors
    ///
    /// Fails if the background worker thread cannot be spawned.
    pub fn with_page_source(
        config: CollectorConfig,
        page_source: Arc<dyn PageSource>,
    ) -> Result<Self> {
        let barrier = Arc::new(WriteBarrierTable::new());
        let worker = if config.background {
            Some(
                BackgroundWorker::spawn()
                    .map_err(|_| CollectorError::OutOfMemory { pages: 0 })?,
            )
        } else {
            None
        };
        let entry = Rc::new(Cell::new(EntryKind::Idle));
        let heap = HeapManager::new(config, page_source, Arc::clone(&barrier));
        Ok(Self {
            inner: RefCell::new(CollectorInner {
                heap,
                barrier: Arc::clone(&barrier),
                coordinator: SweepCoordinator::new(),
                worker,
                pinned: std::collections::HashMap::new(),
                regions: Vec::new(),
                before_collect: Vec::new(),
                deferred_free: Vec::new(),
                metrics: MetricsRecorder::default(),
                phase: CyclePhase::Idle,
                mark_active: false,
                cycle: None,
                disabled: false,
                entry: Rc::clone(&entry),
            }),
            entry,
            barrier,
        })
    }

    fn try_inner(&self) -> Result<RefMut<'_, CollectorInner>> {
        self.inner.try_borrow_mut().map_err(|_| match self.entry.get() {
            EntryKind::Walking => CollectorError::HeapWalkInProgress,
            EntryKind::BeforeCollect => CollectorError::ReentrantAllocation,
            EntryKind::Collecting | EntryKind::Idle => CollectorError::CollectionInProgress,
        })
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate `size` bytes with the given attributes.
    ///
    /// Never returns a partially valid object: on failure the heap is
    /// unchanged. Exhaustion forces one synchronous exhaustive collection
    /// and a retry before surfacing `OutOfMemory`.
    ///
    /// # Errors
    ///
    /// `InvalidAttributes`, `SizeOverflow`, `OutOfMemory`, `Disabled`, or a
    /// re-entrancy error when called from a restricted callback context.
    pub fn alloc(&self, size: usize, attrs: ObjectAttributes) -> Result<NonNull<u8>> {
        let attrs = ObjectAttributes::for_alloc(attrs.bits())?;
        let mut inner = self.try_inner()?;
        let _guard = EntryGuard::enter(&self.entry, EntryKind::Collecting);
        inner.alloc(size, attrs)
    }

    /// Explicitly release a large object (the only size class supporting
    /// direct free). `ptr` must be the exact payload start returned by
    /// [`Self::alloc`]. A registered finalizer runs now.
    ///
    /// # Errors
    ///
    /// `UnknownObject` if `ptr` is not a live large allocation.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        let mut inner = self.try_inner()?;
        let _guard = EntryGuard::enter(&self.entry, EntryKind::Collecting);
        if inner.phase == CyclePhase::ConcurrentMark {
            // The background marker may be walking this header; release it
            // once the cycle drains.
            inner.deferred_free.push(ptr.as_ptr() as usize);
            return Ok(());
        }
        inner.heap.free_large(ptr).map(|_| ())
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Pin an object as a root. Pins are reference counted.
    ///
    /// # Errors
    ///
    /// `UnknownObject` if `ptr` is not the start of a live allocation.
    pub fn pin_root(&self, ptr: NonNull<u8>) -> Result<()> {
        let mut inner = self.try_inner()?;
        let addr = ptr.as_ptr() as usize;
        if inner.heap.resolve_live_object(addr).is_none() {
            return Err(CollectorError::UnknownObject { addr });
        }
        *inner.pinned.entry(addr).or_insert(0) += 1;
        Ok(())
    }

    /// Drop one pin reference.
    ///
    /// # Errors
    ///
    /// `NotPinned` if the address has no outstanding pin.
    pub fn unpin_root(&self, ptr: NonNull<u8>) -> Result<()> {
        let mut inner = self.try_inner()?;
        let addr = ptr.as_ptr() as usize;
        match inner.pinned.get_mut(&addr) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                inner.pinned.remove(&addr);
                Ok(())
            }
            None => Err(CollectorError::NotPinned { addr }),
        }
    }

    /// Register an address range the collector scans conservatively for
    /// roots (the embedding's stack or globals).
    pub fn register_root_region(&self, start: *const u8, len: usize) -> Result<()> {
        let mut inner = self.try_inner()?;
        inner.regions.push((start as usize, len));
        Ok(())
    }

    /// Remove a previously registered root region.
    ///
    /// # Errors
    ///
    /// `UnknownObject` if no matching region is registered.
    pub fn unregister_root_region(&self, start: *const u8, len: usize) -> Result<()> {
        let mut inner = self.try_inner()?;
        let key = (start as usize, len);
        let before = inner.regions.len();
        inner.regions.retain(|r| *r != key);
        if inner.regions.len() == before {
            return Err(CollectorError::UnknownObject { addr: key.0 });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Finalization and callbacks
    // ------------------------------------------------------------------

    /// Register a finalizer for an object allocated with
    /// [`ObjectAttributes::FINALIZE`]. It runs exactly once, after the
    /// object becomes unreachable, and never while it is still reachable.
    ///
    /// # Errors
    ///
    /// `UnknownObject` or `NotFinalizable`.
    pub fn register_finalizer(
        &self,
        ptr: NonNull<u8>,
        finalizer: impl FnOnce(*mut u8) + 'static,
    ) -> Result<()> {
        let mut inner = self.try_inner()?;
        inner
            .heap
            .set_finalizer(ptr.as_ptr() as usize, Box::new(finalizer))
    }

    /// Register a callback invoked at every collection entry while the
    /// object is alive. The callback runs with collection internals in a
    /// restricted state: allocating from inside it is rejected.
    ///
    /// # Errors
    ///
    /// `UnknownObject` if `ptr` is not a live allocation.
    pub fn register_before_collect_callback(
        &self,
        ptr: NonNull<u8>,
        callback: impl FnMut(*mut u8) + 'static,
    ) -> Result<()> {
        let mut inner = self.try_inner()?;
        let addr = ptr.as_ptr() as usize;
        if inner.heap.resolve_live_object(addr).is_none() {
            return Err(CollectorError::UnknownObject { addr });
        }
        inner.before_collect.push(BeforeCollectEntry {
            target: addr,
            callback: Box::new(callback),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Run a collection now. Exhaustive and partial modes complete before
    /// returning; concurrent mode starts the cycle and returns, completing
    /// at a later safe point ([`Self::safepoint`] or the allocation slow
    /// path).
    ///
    /// # Errors
    ///
    /// `Disabled`, or a re-entrancy error from a restricted context.
    pub fn collect_now(&self, mode: CollectMode) -> Result<()> {
        let mut inner = self.try_inner()?;
        if inner.disabled {
            return Err(CollectorError::Disabled);
        }
        let _guard = EntryGuard::enter(&self.entry, EntryKind::Collecting);
        inner.collect(mode, false)
    }

    /// Debug variant: collect without scanning registered root regions.
    /// Only pinned and implicit roots keep objects alive, which makes
    /// reclamation deterministic in tests.
    ///
    /// # Errors
    ///
    /// As [`Self::collect_now`].
    pub fn collect_skip_root_regions(&self, mode: CollectMode) -> Result<()> {
        let mut inner = self.try_inner()?;
        if inner.disabled {
            return Err(CollectorError::Disabled);
        }
        let _guard = EntryGuard::enter(&self.entry, EntryKind::Collecting);
        inner.collect(mode, true)
    }

    /// A safe point: drain background notices and advance any in-flight
    /// concurrent cycle. Cheap when nothing is pending.
    pub fn safepoint(&self) {
        if let Ok(mut inner) = self.try_inner() {
            let _guard = EntryGuard::enter(&self.entry, EntryKind::Collecting);
            inner.advance();
        }
    }

    /// Block until any in-flight cycle reaches Idle.
    ///
    /// # Errors
    ///
    /// Re-entrancy errors from restricted contexts.
    pub fn wait_for_collection(&self) -> Result<()> {
        let mut inner = self.try_inner()?;
        let _guard = EntryGuard::enter(&self.entry, EntryKind::Collecting);
        inner.wait_for_idle();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// True if `ptr` is the start of a live allocation.
    pub fn is_live_object(&self, ptr: NonNull<u8>) -> bool {
        self.inner
            .try_borrow()
            .map(|inner| inner.heap.resolve_live_object(ptr.as_ptr() as usize).is_some())
            .unwrap_or(false)
    }

    /// Walk every live object. Requires exclusive access: any collector
    /// call from inside the callback fails with `HeapWalkInProgress`, and
    /// the walk itself is rejected while a cycle is in flight.
    ///
    /// # Errors
    ///
    /// `CollectionInProgress` if a cycle is active.
    pub fn enumerate_heap(
        &self,
        mut callback: impl FnMut(NonNull<u8>, usize, ObjectAttributes),
    ) -> Result<()> {
        let inner = self.try_inner()?;
        if inner.phase != CyclePhase::Idle {
            return Err(CollectorError::CollectionInProgress);
        }
        let _guard = EntryGuard::enter(&self.entry, EntryKind::Walking);
        inner.heap.enumerate(&mut callback);
        Ok(())
    }

    /// Current reserved/used byte counts.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.inner
            .try_borrow()
            .map(|inner| inner.heap.usage())
            .unwrap_or_default()
    }

    /// Set the hard ceiling on reserved bytes. Exceeding it behaves like
    /// page reservation failure (collect once, retry, then `OutOfMemory`).
    ///
    /// # Errors
    ///
    /// Re-entrancy errors from restricted contexts.
    pub fn set_memory_limit(&self, bytes: usize) -> Result<()> {
        let mut inner = self.try_inner()?;
        inner.heap.set_memory_limit(bytes);
        Ok(())
    }

    /// Install the host accounting callback for allocate/free/failure
    /// events.
    ///
    /// # Errors
    ///
    /// Re-entrancy errors from restricted contexts.
    pub fn set_event_callback(&self, callback: Option<MemoryEventCallback>) -> Result<()> {
        let mut inner = self.try_inner()?;
        inner.heap.set_event_callback(callback);
        Ok(())
    }

    /// Metrics from the most recent completed collection.
    pub fn last_metrics(&self) -> Option<GcMetrics> {
        self.inner.try_borrow().ok().and_then(|i| i.metrics.last())
    }

    /// Exact free bytes on the large-object pool's span list. Every freed
    /// record adds exactly the bytes it consumed; every reallocation from
    /// the list subtracts exactly what it carves.
    pub fn large_free_bytes(&self) -> usize {
        self.inner
            .try_borrow()
            .map(|i| i.heap.large_free_bytes())
            .unwrap_or(0)
    }

    /// The write-barrier table. Compiled code locates this table and
    /// performs the indexed dirty store described by
    /// [`crate::barrier::CARD_SHIFT`]; the handle stays valid for the
    /// collector's lifetime.
    pub fn write_barrier_table(&self) -> Arc<WriteBarrierTable> {
        Arc::clone(&self.barrier)
    }

    /// Record a pointer store into a barrier-tracked object's field.
    #[inline]
    pub fn write_barrier(&self, field_addr: usize) {
        self.barrier.record_write(field_addr);
    }

    /// Refuse all further allocation and collection requests. Outstanding
    /// concurrent work still drains at safe points and teardown; used when
    /// the embedding is shutting down.
    pub fn disable(&self) {
        if let Ok(mut inner) = self.try_inner() {
            inner.disabled = true;
        }
    }

    /// Adopt a foreign committed page range as a slab of `object_size`
    /// objects with the given attributes.
    ///
    /// # Errors
    ///
    /// `SizeOverflow` if `object_size` routes to the large-object pool.
    pub fn integrate_external_block(
        &self,
        reservation: page_source::PageReservation,
        object_size: usize,
        attrs: ObjectAttributes,
    ) -> Result<()> {
        let attrs = ObjectAttributes::for_alloc(attrs.bits())?;
        let mut inner = self.try_inner()?;
        inner
            .heap
            .integrate_external_block(reservation, object_size, attrs)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.disabled = true;
        // Outstanding concurrent work must drain to a consistent state
        // before teardown.
        inner.wait_for_idle();
        inner.heap.dispose_all_for_teardown();
        // Dropping the worker sends shutdown and joins.
        inner.worker = None;
    }
}

// ============================================================================
// Cycle implementation
// ============================================================================

impl CollectorInner {
    fn alloc(&mut self, size: usize, attrs: ObjectAttributes) -> Result<NonNull<u8>> {
        if self.disabled {
            return Err(CollectorError::Disabled);
        }

        // Collection decisions happen before the object exists: a cycle
        // entered after the return could reclaim an allocation the host has
        // not rooted yet.
        self.maybe_auto_collect();

        let mark_new = self.mark_active;
        match self.heap.alloc(size, attrs, mark_new) {
            Ok(ptr) => Ok(ptr),
            Err(CollectorError::OutOfMemory { .. }) => self.alloc_after_collect(size, attrs),
            Err(e) => Err(e),
        }
    }

    /// Resource-exhaustion recovery: finish any in-flight cycle, force one
    /// exhaustive collection, retry once.
    fn alloc_after_collect(&mut self, size: usize, attrs: ObjectAttributes) -> Result<NonNull<u8>> {
        self.wait_for_idle();
        self.collect(CollectMode::Exhaustive, false)?;
        let mark_new = self.mark_active;
        self.heap.alloc(size, attrs, mark_new)
    }

    /// The allocation slow path doubles as a safe point and drives the
    /// automatic collection heuristic.
    fn maybe_auto_collect(&mut self) {
        self.advance();
        let threshold = self.heap.config().auto_collect_bytes;
        if threshold == 0 || self.phase != CyclePhase::Idle {
            return;
        }
        if self.heap.bytes_since_collect() >= threshold {
            let mode = if self.worker.is_some() {
                CollectMode::Concurrent
            } else {
                CollectMode::Exhaustive
            };
            let _ = self.collect(mode, false);
        }
    }

    fn collect(&mut self, mode: CollectMode, skip_regions: bool) -> Result<()> {
        if self.phase != CyclePhase::Idle {
            self.wait_for_idle();
        }

        #[cfg(feature = "tracing")]
        let _collection_span = crate::tracing::collection_span(
            match mode {
                CollectMode::Exhaustive => "exhaustive",
                CollectMode::Partial => "partial",
                CollectMode::Concurrent => "concurrent",
            },
            crate::tracing::next_gc_id(),
        )
        .entered();

        self.run_before_collect_callbacks();

        let mode = if mode == CollectMode::Concurrent && self.worker.is_none() {
            CollectMode::Exhaustive
        } else {
            mode
        };

        let mut cycle = CycleState {
            mode,
            start: Instant::now(),
            timer: PhaseTimer::new(),
            mark_stats: MarkStats::default(),
            before_used: self.heap.usage().used_bytes,
            reclaimed_objects: 0,
            cards_rescanned: 0,
        };

        // ResetMarks: always stop-the-world.
        self.phase = CyclePhase::ResetMarks;
        cycle.timer.start();
        self.heap.detach_caches();
        self.heap.reset_marks();
        cycle.timer.end_reset();

        // ScanRoots: always stop-the-world.
        self.phase = CyclePhase::ScanRoots;
        cycle.timer.start();
        let budget = self.heap.config().mark_chunk_budget;
        let mut list = MarkWorkList::new(budget);
        let mut stats = MarkStats::default();
        self.scan_roots(&mut list, &mut stats, skip_regions);

        match mode {
            CollectMode::Exhaustive | CollectMode::Partial => {
                self.phase = CyclePhase::InlineMark;
                mark::drain(self.heap.classifier(), &mut list, &mut stats);
                Self::oom_rescan_loop(&self.heap, &mut list, &mut stats);
                cycle.mark_stats = stats;
                cycle.timer.end_mark();
                self.cycle = Some(cycle);
                self.sweep_phase(mode);
                self.finish_cycle();
            }
            CollectMode::Concurrent => {
                self.phase = CyclePhase::ConcurrentMark;
                self.mark_active = true;
                cycle.mark_stats = stats;
                self.cycle = Some(cycle);
                let snapshot = self.heap.snapshot();
                let workers = self.heap.config().mark_parallelism;
                if let Some(worker) = self.worker.as_ref() {
                    worker.submit(Job::Mark {
                        snapshot,
                        list: WorkEnvelope(list),
                        workers,
                    });
                }
            }
        }
        Ok(())
    }

    fn run_before_collect_callbacks(&mut self) {
        if self.before_collect.is_empty() {
            return;
        }
        let _guard = EntryGuard::enter(&self.entry, EntryKind::BeforeCollect);
        for entry in &mut self.before_collect {
            (entry.callback)(entry.target as *mut u8);
        }
    }

    fn scan_roots(&mut self, list: &mut MarkWorkList, stats: &mut MarkStats, skip_regions: bool) {
        let classifier = self.heap.classifier();
        // Pinned and implicit roots are exact object starts; anything else
        // is a tracking bug and fails fast.
        for &addr in self.pinned.keys() {
            mark::mark_precise(classifier, list, addr, stats);
        }
        for addr in self.heap.collect_implicit_roots() {
            mark::mark_precise(self.heap.classifier(), list, addr, stats);
        }
        if !skip_regions {
            for &(start, len) in &self.regions {
                mark::scan_range(self.heap.classifier(), list, start, len, stats);
            }
        }
    }

    /// Scratch-bounded rescan: slabs and large objects flagged by work-list
    /// overflow are revisited, scanning their already-marked objects, until
    /// no flags remain. Terminates because the marked set grows
    /// monotonically.
    fn oom_rescan_loop(heap: &HeapManager, list: &mut MarkWorkList, stats: &mut MarkStats) {
        loop {
            let flagged = heap.take_oom_rescan_slabs();
            let flagged_large = heap.take_oom_rescan_large();
            if flagged.is_empty() && flagged_large.is_empty() && list.is_empty() {
                break;
            }
            for slab_ptr in flagged {
                // SAFETY: flagged slabs are owned by the heap for the whole
                // cycle.
                let slab = unsafe { slab_ptr.as_ref() };
                slab.for_each_marked_object(&mut |ptr, size| {
                    mark::scan_range(
                        heap.classifier(),
                        list,
                        ptr.as_ptr() as usize,
                        size,
                        stats,
                    );
                });
                mark::drain(heap.classifier(), list, stats);
            }
            for header_ptr in flagged_large {
                // SAFETY: as above.
                let header = unsafe { header_ptr.as_ref() };
                let payload = header_ptr.as_ptr() as usize + crate::large::HEADER_SIZE;
                mark::scan_range(heap.classifier(), list, payload, header.payload_size(), stats);
                mark::drain(heap.classifier(), list, stats);
            }
            mark::drain(heap.classifier(), list, stats);
        }
    }

    /// Foreground sweep for exhaustive/partial modes, or sweep initiation
    /// for concurrent mode.
    fn sweep_phase(&mut self, mode: CollectMode) {
        #[cfg(feature = "tracing")]
        let _phase_span = crate::tracing::phase_span("sweep").entered();
        self.phase = CyclePhase::Sweep;
        // The mutator ran (and re-bound caches) since ResetMarks when the
        // mark phase was concurrent.
        self.heap.detach_caches();
        let cycle = self.cycle.as_mut().unwrap_or_else(|| {
            crate::error::fatal::invariant_violation("sweep phase without cycle state")
        });
        cycle.timer.start();

        let (sweep_mode, partial) = match mode {
            CollectMode::Partial => (
                SweepMode::Partial {
                    min_live_percent: self.heap.config().partial_min_live_percent,
                },
                true,
            ),
            CollectMode::Concurrent if self.heap.config().concurrent_sweep => {
                (SweepMode::Concurrent, false)
            }
            CollectMode::Exhaustive | CollectMode::Concurrent => (SweepMode::Eager, false),
        };

        self.coordinator.begin_sweep(partial);
        let stats = self.heap.sweep(sweep_mode, &mut self.coordinator);
        cycle.reclaimed_objects += stats.reclaimed_objects;
        cycle.reclaimed_objects += self.heap.flush_pending_disposes();
        cycle.timer.end_sweep();

        if stats.deferred_slabs > 0 {
            if let Some(worker) = self.worker.as_ref() {
                self.coordinator.dispatch(worker);
            }
            self.phase = CyclePhase::ConcurrentSweep;
        }
    }

    /// Drain pending notices; advance the cycle when they complete it.
    fn advance(&mut self) {
        loop {
            let Some(notice) = self.worker.as_ref().and_then(BackgroundWorker::try_notice)
            else {
                break;
            };
            self.handle_notice(notice);
        }
        self.try_finish();
    }

    /// Block until Idle, consuming notices as they arrive.
    fn wait_for_idle(&mut self) {
        loop {
            self.try_finish();
            if self.phase == CyclePhase::Idle {
                return;
            }
            let Some(notice) = self.worker.as_ref().and_then(BackgroundWorker::wait_notice)
            else {
                crate::error::fatal::invariant_violation(
                    "background worker died with a cycle in flight",
                );
            };
            self.handle_notice(notice);
        }
    }

    fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::MarkDone { stats } => self.on_mark_done(stats),
            Notice::Swept { pool, slabs } => {
                self.coordinator.note_job_done();
                let batch = slabs
                    .into_iter()
                    .map(|(SlabEnvelope(slab), state, reclaimed)| (slab, state, reclaimed))
                    .collect();
                let reclaimed = self.heap.merge_swept(pool, batch);
                if let Some(cycle) = self.cycle.as_mut() {
                    cycle.reclaimed_objects += reclaimed;
                }
            }
        }
    }

    /// The background mark finished: do the short stop-the-world tail —
    /// rescan dirty cards and overflow flags — then start the sweep.
    fn on_mark_done(&mut self, stats: MarkStats) {
        debug_assert_eq!(self.phase, CyclePhase::ConcurrentMark);
        let budget = self.heap.config().mark_chunk_budget;
        let mut list = MarkWorkList::new(budget);
        let mut stats = stats;
        let mut cards = 0usize;

        loop {
            let dirty = self.barrier.drain_dirty_cards();
            if dirty.is_empty() && list.is_empty() {
                break;
            }
            for card in dirty {
                cards += 1;
                Self::rescan_card(&self.heap, &mut list, card, &mut stats);
            }
            mark::drain(self.heap.classifier(), &mut list, &mut stats);
            Self::oom_rescan_loop(&self.heap, &mut list, &mut stats);
        }
        Self::oom_rescan_loop(&self.heap, &mut list, &mut stats);

        // New objects stay black-allocated until the sweep finishes; the
        // sweep only reclaims unmarked slots, so this is what keeps
        // mutator allocations made during the drain alive.
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.mark_stats.absorb(stats);
            cycle.cards_rescanned += cards;
            cycle.timer.end_mark();
        }
        self.sweep_phase(CollectMode::Concurrent);
        self.try_finish();
    }

    /// Rescan every marked object intersecting a dirty card.
    fn rescan_card(heap: &HeapManager, list: &mut MarkWorkList, card: usize, stats: &mut MarkStats) {
        let card_end = card + CARD_SIZE;
        match heap.classifier().classify(card) {
            Some(BlockEntry::Small(slab_ptr)) => {
                // SAFETY: indexed slabs live for the cycle.
                let slab = unsafe { slab_ptr.as_ref() };
                slab.for_each_marked_object(&mut |ptr, size| {
                    let start = ptr.as_ptr() as usize;
                    if start < card_end && start + size > card {
                        mark::scan_range(heap.classifier(), list, start, size, stats);
                    }
                });
            }
            Some(BlockEntry::Large(slab_ptr)) => {
                // SAFETY: as above.
                let slab = unsafe { slab_ptr.as_ref() };
                slab.for_each_marked(&mut |start, size| {
                    if start < card_end && start + size > card {
                        mark::scan_range(heap.classifier(), list, start, size, stats);
                    }
                });
            }
            None => {}
        }
    }

    /// Complete the cycle once every deferred batch has merged.
    fn try_finish(&mut self) {
        if self.phase == CyclePhase::ConcurrentSweep {
            // Deferred empty slabs merge at this safe point.
            for (pool, slabs) in self.coordinator.take_empty_batches() {
                let batch = slabs
                    .into_iter()
                    .map(|SlabEnvelope(slab)| (slab, crate::slab::SweepState::Empty, 0))
                    .collect();
                self.heap.merge_swept(pool, batch);
            }
            if self.coordinator.is_quiescent() {
                self.phase = CyclePhase::Sweep;
            }
        }
        if self.phase == CyclePhase::Sweep {
            self.finish_cycle();
        }
    }

    fn finish_cycle(&mut self) {
        // Any empties queued by a synchronous concurrent-mode sweep that
        // never went to the background still need merging.
        for (pool, slabs) in self.coordinator.take_empty_batches() {
            let batch = slabs
                .into_iter()
                .map(|SlabEnvelope(slab)| (slab, crate::slab::SweepState::Empty, 0))
                .collect();
            self.heap.merge_swept(pool, batch);
        }
        self.coordinator.end_sweep();
        self.mark_active = false;

        for addr in std::mem::take(&mut self.deferred_free) {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                let _ = self.heap.free_large(ptr);
            }
        }

        // Callbacks whose target died this cycle are dropped with it.
        let heap = &self.heap;
        self.before_collect
            .retain(|e| heap.resolve_live_object(e.target).is_some());

        if let Some(cycle) = self.cycle.take() {
            let usage = self.heap.usage();
            self.metrics.record(GcMetrics {
                duration: cycle.start.elapsed(),
                reset_duration: cycle.timer.reset,
                mark_duration: cycle.timer.mark,
                sweep_duration: cycle.timer.sweep,
                bytes_reclaimed: cycle.before_used.saturating_sub(usage.used_bytes),
                bytes_surviving: usage.used_bytes,
                objects_reclaimed: cycle.reclaimed_objects,
                objects_marked: cycle.mark_stats.visited,
                cards_rescanned: cycle.cards_rescanned,
                kind: match cycle.mode {
                    CollectMode::Exhaustive => CollectionKind::Exhaustive,
                    CollectMode::Partial => CollectionKind::Partial,
                    CollectMode::Concurrent => CollectionKind::Concurrent,
                },
                total_collections: 0,
            });
        }

        self.heap.reset_alloc_window();
        self.phase = CyclePhase::Idle;
    }
}
