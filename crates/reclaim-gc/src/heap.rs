//! Whole-heap ownership and routing.
//!
//! The [`HeapManager`] owns the pool matrix (size bucket x attribute class),
//! the large-object pool, and the block index that maps every reserved page
//! back to its owning slab. Every live object is reachable through exactly
//! one of these structures.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use page_source::{PageReservation, PageSource};

use crate::attrs::{AttributeClass, ObjectAttributes};
use crate::barrier::WriteBarrierTable;
use crate::config::{CollectorConfig, SizeBucket};
use crate::error::{CollectorError, Result};
use crate::large::{LargeObjectPool, LargeObjectSlab};
use crate::metrics::{MemoryEvent, MemoryEventCallback, MemoryUsage};
use crate::pool::{PoolSweepStats, SizeClassPool};
use crate::slab::{Finalizer, Slab, SweepMode};
use crate::sweep::SweepCoordinator;

// ============================================================================
// Block index
// ============================================================================

/// What a reserved page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockEntry {
    Small(NonNull<Slab>),
    Large(NonNull<LargeObjectSlab>),
}

/// Page address to owning-block map plus cheap heap bounds.
///
/// Bounds grow monotonically; a released page leaves them stale, which only
/// costs a map miss on the conservative filter path.
pub(crate) struct BlockIndex {
    pages: HashMap<usize, BlockEntry>,
    min_addr: usize,
    max_addr: usize,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            min_addr: usize::MAX,
            max_addr: 0,
        }
    }

    pub fn insert_range(&mut self, base: usize, page_count: usize, entry: BlockEntry) {
        let page_size = page_source::page_size();
        for i in 0..page_count {
            self.pages.insert(base + i * page_size, entry);
        }
        self.min_addr = self.min_addr.min(base);
        self.max_addr = self.max_addr.max(base + page_count * page_size);
    }

    pub fn remove_range(&mut self, base: usize, page_count: usize) {
        let page_size = page_source::page_size();
        for i in 0..page_count {
            self.pages.remove(&(base + i * page_size));
        }
    }

    pub fn lookup(&self, addr: usize) -> Option<BlockEntry> {
        let page_size = page_source::page_size();
        self.pages.get(&(addr & !(page_size - 1))).copied()
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            pages: self.pages.clone(),
            min_addr: self.min_addr,
            max_addr: self.max_addr,
        }
    }
}

/// Read-only copy of the block index handed to the background marker.
///
/// Slabs referenced here stay alive for the duration of the mark because
/// the foreground thread defers all slab release until the cycle completes.
pub(crate) struct IndexSnapshot {
    pages: HashMap<usize, BlockEntry>,
    min_addr: usize,
    max_addr: usize,
}

// SAFETY: the snapshot is immutable and the referenced slabs outlive the
// marking job by the cycle's release-deferral discipline; mark bits and
// attribute bytes, the only state the marker touches, are atomics.
unsafe impl Send for IndexSnapshot {}
unsafe impl Sync for IndexSnapshot {}

/// Address classification shared by the inline and background markers.
pub(crate) trait AddressClassifier {
    fn classify(&self, addr: usize) -> Option<BlockEntry>;
    fn in_heap_range(&self, addr: usize) -> bool;
}

impl AddressClassifier for BlockIndex {
    fn classify(&self, addr: usize) -> Option<BlockEntry> {
        self.lookup(addr)
    }

    fn in_heap_range(&self, addr: usize) -> bool {
        addr >= self.min_addr && addr < self.max_addr
    }
}

impl AddressClassifier for IndexSnapshot {
    fn classify(&self, addr: usize) -> Option<BlockEntry> {
        let page_size = page_source::page_size();
        self.pages.get(&(addr & !(page_size - 1))).copied()
    }

    fn in_heap_range(&self, addr: usize) -> bool {
        addr >= self.min_addr && addr < self.max_addr
    }
}

// ============================================================================
// Usage accounting
// ============================================================================

/// Reserved/used byte counters plus the allocation window that drives the
/// automatic collection heuristic.
#[derive(Debug)]
pub(crate) struct UsageCounters {
    reserved_bytes: usize,
    used_bytes: usize,
    bytes_since_collect: usize,
    memory_limit: usize,
}

impl UsageCounters {
    pub const fn new(memory_limit: usize) -> Self {
        Self {
            reserved_bytes: 0,
            used_bytes: 0,
            bytes_since_collect: 0,
            memory_limit,
        }
    }

    pub fn within_limit(&self, extra: usize) -> bool {
        self.reserved_bytes
            .checked_add(extra)
            .is_some_and(|total| total <= self.memory_limit)
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.memory_limit = limit;
    }

    pub fn on_reserved(&mut self, bytes: usize) {
        self.reserved_bytes += bytes;
    }

    pub fn on_released(&mut self, bytes: usize) {
        self.reserved_bytes = self.reserved_bytes.saturating_sub(bytes);
    }

    pub fn on_alloc(&mut self, bytes: usize) {
        self.used_bytes += bytes;
        self.bytes_since_collect = self.bytes_since_collect.saturating_add(bytes);
    }

    pub fn on_reclaim(&mut self, bytes: usize) {
        self.used_bytes = self.used_bytes.saturating_sub(bytes);
    }

    pub const fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            reserved_bytes: self.reserved_bytes,
            used_bytes: self.used_bytes,
        }
    }

    pub const fn bytes_since_collect(&self) -> usize {
        self.bytes_since_collect
    }

    pub fn reset_alloc_window(&mut self) {
        self.bytes_since_collect = 0;
    }
}

// ============================================================================
// Heap context
// ============================================================================

/// Split-borrow bundle threaded through pool and large-object operations so
/// they can reserve pages, maintain the block index and barrier table, and
/// report accounting events without owning any of it.
pub(crate) struct HeapCtx<'a> {
    pub page_source: &'a dyn PageSource,
    pub index: &'a mut BlockIndex,
    pub barrier: &'a WriteBarrierTable,
    pub usage: &'a mut UsageCounters,
    pub events: &'a mut Option<MemoryEventCallback>,
}

impl HeapCtx<'_> {
    /// Reserve committed pages, honoring the memory limit and firing the
    /// host accounting events.
    pub fn reserve_pages(&mut self, pages: usize) -> Result<PageReservation> {
        let bytes = pages
            .checked_mul(page_source::page_size())
            .ok_or(CollectorError::SizeOverflow { size: pages })?;
        if !self.usage.within_limit(bytes) {
            self.notify(MemoryEvent::Failure { bytes });
            return Err(CollectorError::OutOfMemory { pages });
        }
        match self.page_source.reserve(pages) {
            Ok(reservation) => {
                self.usage.on_reserved(bytes);
                self.notify(MemoryEvent::Allocate { bytes });
                Ok(reservation)
            }
            Err(_) => {
                self.notify(MemoryEvent::Failure { bytes });
                Err(CollectorError::OutOfMemory { pages })
            }
        }
    }

    pub fn notify_free(&mut self, bytes: usize) {
        self.notify(MemoryEvent::Free { bytes });
    }

    fn notify(&mut self, event: MemoryEvent) {
        if let Some(cb) = self.events.as_mut() {
            cb(event);
        }
    }
}

// ============================================================================
// Pool identifiers
// ============================================================================

/// Stable identifier of one size-class pool, used for coordinator routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PoolId(u32);

const POOL_MEDIUM_BIT: u32 = 1 << 15;

impl PoolId {
    pub fn small(class: AttributeClass, bucket: usize) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self(((class.index() as u32) << 16) | bucket as u32)
    }

    pub fn medium(class: AttributeClass, bucket: usize) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self(((class.index() as u32) << 16) | POOL_MEDIUM_BIT | bucket as u32)
    }

    pub fn class(self) -> AttributeClass {
        AttributeClass::ALL[(self.0 >> 16) as usize]
    }

    pub fn is_medium(self) -> bool {
        self.0 & POOL_MEDIUM_BIT != 0
    }

    pub fn bucket(self) -> usize {
        (self.0 & (POOL_MEDIUM_BIT - 1)) as usize
    }
}

// ============================================================================
// HeapManager
// ============================================================================

/// Aggregate sweep counters across all pools.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HeapSweepStats {
    pub reclaimed_objects: usize,
    pub deferred_slabs: usize,
}

pub(crate) struct HeapManager {
    config: CollectorConfig,
    page_source: Arc<dyn PageSource>,
    /// `[class][bucket]`, flattened; entries created on first demand.
    small_pools: Vec<Option<Box<SizeClassPool>>>,
    medium_pools: Vec<Option<Box<SizeClassPool>>>,
    large: LargeObjectPool,
    index: BlockIndex,
    barrier: Arc<WriteBarrierTable>,
    usage: UsageCounters,
    events: Option<MemoryEventCallback>,
}

impl HeapManager {
    pub fn new(
        config: CollectorConfig,
        page_source: Arc<dyn PageSource>,
        barrier: Arc<WriteBarrierTable>,
    ) -> Self {
        let small_slots = AttributeClass::COUNT * config.small_bucket_count();
        let medium_slots = AttributeClass::COUNT * config.medium_bucket_count();
        let memory_limit = config.memory_limit;
        Self {
            config,
            page_source,
            small_pools: (0..small_slots).map(|_| None).collect(),
            medium_pools: (0..medium_slots).map(|_| None).collect(),
            large: LargeObjectPool::new(),
            index: BlockIndex::new(),
            barrier,
            usage: UsageCounters::new(memory_limit),
            events: None,
        }
    }

    pub const fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx_parts<'a>(
        page_source: &'a Arc<dyn PageSource>,
        index: &'a mut BlockIndex,
        barrier: &'a WriteBarrierTable,
        usage: &'a mut UsageCounters,
        events: &'a mut Option<MemoryEventCallback>,
    ) -> HeapCtx<'a> {
        HeapCtx {
            page_source: page_source.as_ref(),
            index,
            barrier,
            usage,
            events,
        }
    }

    /// Route an allocation request. `mark_new` is set while a mark phase is
    /// active so new objects are allocated black.
    pub fn alloc(
        &mut self,
        size: usize,
        attrs: ObjectAttributes,
        mark_new: bool,
    ) -> Result<NonNull<u8>> {
        let class = AttributeClass::from_attrs(attrs);
        let mut ctx = Self::ctx_parts(
            &self.page_source,
            &mut self.index,
            &self.barrier,
            &mut self.usage,
            &mut self.events,
        );
        match self.config.bucket_for_size(size) {
            SizeBucket::Small(bucket) => {
                let pool = Self::pool_entry(
                    &mut self.small_pools,
                    &self.config,
                    class,
                    bucket,
                    false,
                );
                pool.alloc(attrs, mark_new, &mut ctx)
            }
            SizeBucket::Medium(bucket) => {
                let pool = Self::pool_entry(
                    &mut self.medium_pools,
                    &self.config,
                    class,
                    bucket,
                    true,
                );
                pool.alloc(attrs, mark_new, &mut ctx)
            }
            SizeBucket::Large => self.large.alloc(size, attrs, mark_new, &mut ctx),
        }
    }

    fn pool_entry<'a>(
        pools: &'a mut [Option<Box<SizeClassPool>>],
        config: &CollectorConfig,
        class: AttributeClass,
        bucket: usize,
        medium: bool,
    ) -> &'a mut SizeClassPool {
        let buckets = if medium {
            config.medium_bucket_count()
        } else {
            config.small_bucket_count()
        };
        let slot = class.index() * buckets + bucket;
        pools[slot].get_or_insert_with(|| {
            let (object_size, id, pages) = if medium {
                (
                    config.medium_bucket_size(bucket),
                    PoolId::medium(class, bucket),
                    config.medium_slab_pages,
                )
            } else {
                (
                    config.small_bucket_size(bucket),
                    PoolId::small(class, bucket),
                    config.small_slab_pages,
                )
            };
            Box::new(SizeClassPool::new(
                object_size,
                class,
                id,
                pages,
                config.empty_slab_reserve,
            ))
        })
    }

    /// Explicit release; only large objects support direct free.
    pub fn free_large(&mut self, ptr: NonNull<u8>) -> Result<usize> {
        let mut ctx = Self::ctx_parts(
            &self.page_source,
            &mut self.index,
            &self.barrier,
            &mut self.usage,
            &mut self.events,
        );
        self.large.free(ptr, &mut ctx)
    }

    /// Install a finalizer on a live object allocated with `FINALIZE`.
    pub fn set_finalizer(&mut self, addr: usize, finalizer: Finalizer) -> Result<()> {
        match self.index.lookup(addr) {
            Some(BlockEntry::Small(mut slab_ptr)) => {
                // SAFETY: the index only references live slabs; the mutator
                // thread has exclusive access outside collection phases.
                let slab = unsafe { slab_ptr.as_mut() };
                let (start, index) = slab
                    .find_object(addr)
                    .ok_or(CollectorError::UnknownObject { addr })?;
                if start.as_ptr() as usize != addr || !slab.slot_is_allocated(index) {
                    return Err(CollectorError::UnknownObject { addr });
                }
                if slab.set_finalizer(index, finalizer) {
                    Ok(())
                } else {
                    Err(CollectorError::NotFinalizable { addr })
                }
            }
            Some(BlockEntry::Large(slab_ptr)) => {
                // SAFETY: as above.
                let slab = unsafe { slab_ptr.as_ref() };
                let header = slab
                    .find_header(addr)
                    .ok_or(CollectorError::UnknownObject { addr })?;
                self.large.set_finalizer(addr, header, finalizer)
            }
            None => Err(CollectorError::UnknownObject { addr }),
        }
    }

    /// Exact-start liveness query.
    pub fn resolve_live_object(&self, addr: usize) -> Option<(NonNull<u8>, usize, ObjectAttributes)> {
        match self.index.lookup(addr)? {
            BlockEntry::Small(slab_ptr) => {
                // SAFETY: index references live slabs.
                let slab = unsafe { slab_ptr.as_ref() };
                let (start, index) = slab.find_object(addr)?;
                (start.as_ptr() as usize == addr && slab.slot_is_allocated(index)).then(|| {
                    (start, slab.object_size(), slab.slot_attributes(index))
                })
            }
            BlockEntry::Large(slab_ptr) => {
                // SAFETY: index references live slabs.
                let slab = unsafe { slab_ptr.as_ref() };
                let header = slab.find_header(addr)?;
                (addr == std::ptr::from_ref(header) as usize + crate::large::HEADER_SIZE).then(
                    || {
                        // SAFETY: payload address derived from a live header.
                        (
                            unsafe { NonNull::new_unchecked(addr as *mut u8) },
                            header.payload_size(),
                            header.object_attrs(),
                        )
                    },
                )
            }
        }
    }

    pub fn classifier(&self) -> &BlockIndex {
        &self.index
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        self.index.snapshot()
    }

    // ------------------------------------------------------------------
    // Whole-heap phases
    // ------------------------------------------------------------------

    /// Unbind every allocator cache. Required before reset/sweep phases.
    pub fn detach_caches(&mut self) {
        for pool in self
            .small_pools
            .iter_mut()
            .chain(self.medium_pools.iter_mut())
            .flatten()
        {
            pool.detach_cache();
        }
    }

    /// Clear every mark bit and rescan flag. Idempotent: a second call with
    /// no intervening marking leaves the free/allocatable structure as-is.
    pub fn reset_marks(&mut self) {
        for pool in self
            .small_pools
            .iter_mut()
            .chain(self.medium_pools.iter_mut())
            .flatten()
        {
            pool.reset_marks();
        }
        self.large.reset_marks();
    }

    /// Sweep every pool, routing deferred slabs through the coordinator,
    /// then the large-object pool.
    pub fn sweep(
        &mut self,
        mode: SweepMode,
        coordinator: &mut SweepCoordinator,
    ) -> HeapSweepStats {
        let mut stats = HeapSweepStats::default();
        let mut ctx = Self::ctx_parts(
            &self.page_source,
            &mut self.index,
            &self.barrier,
            &mut self.usage,
            &mut self.events,
        );
        for pool in self
            .small_pools
            .iter_mut()
            .chain(self.medium_pools.iter_mut())
            .flatten()
        {
            let PoolSweepStats {
                reclaimed_slots,
                deferred_slabs,
            } = pool.sweep_all(mode, coordinator, &mut ctx);
            stats.reclaimed_objects += reclaimed_slots;
            stats.deferred_slabs += deferred_slabs;
        }
        stats.reclaimed_objects += self.large.sweep_all(&mut ctx);
        stats
    }

    /// Run finalizers deferred by the last sweep.
    pub fn flush_pending_disposes(&mut self) -> usize {
        let mut ctx = Self::ctx_parts(
            &self.page_source,
            &mut self.index,
            &self.barrier,
            &mut self.usage,
            &mut self.events,
        );
        let mut disposed = 0;
        for pool in self
            .small_pools
            .iter_mut()
            .chain(self.medium_pools.iter_mut())
            .flatten()
        {
            disposed += pool.flush_pending_disposes(&mut ctx);
        }
        disposed += self.large.flush_pending_disposes(&mut ctx);
        disposed
    }

    /// Merge background-swept slabs for one pool.
    pub fn merge_swept(
        &mut self,
        id: PoolId,
        slabs: Vec<(Box<Slab>, crate::slab::SweepState, u32)>,
    ) -> usize {
        let buckets = if id.is_medium() {
            self.config.medium_bucket_count()
        } else {
            self.config.small_bucket_count()
        };
        let slot = id.class().index() * buckets + id.bucket();
        let pools = if id.is_medium() {
            &mut self.medium_pools
        } else {
            &mut self.small_pools
        };
        let Some(pool) = pools[slot].as_mut() else {
            crate::error::fatal::invariant_violation("merge notice for a pool that never existed");
        };
        let mut ctx = HeapCtx {
            page_source: self.page_source.as_ref(),
            index: &mut self.index,
            barrier: &self.barrier,
            usage: &mut self.usage,
            events: &mut self.events,
        };
        pool.merge_swept(slabs, &mut ctx)
    }

    /// Adopt a foreign page range as a slab of the matching pool.
    pub fn integrate_external_block(
        &mut self,
        reservation: PageReservation,
        object_size: usize,
        attrs: ObjectAttributes,
    ) -> Result<()> {
        let class = AttributeClass::from_attrs(attrs);
        let bucket = match self.config.bucket_for_size(object_size) {
            SizeBucket::Small(b) => (b, false),
            SizeBucket::Medium(b) => (b, true),
            SizeBucket::Large => {
                return Err(CollectorError::SizeOverflow { size: object_size })
            }
        };
        let pools = if bucket.1 {
            &mut self.medium_pools
        } else {
            &mut self.small_pools
        };
        let pool = Self::pool_entry(pools, &self.config, class, bucket.0, bucket.1);
        let slab = Slab::new(reservation, pool.object_size(), class);
        self.usage.on_reserved(slab.reserved_bytes());
        let mut ctx = HeapCtx {
            page_source: self.page_source.as_ref(),
            index: &mut self.index,
            barrier: &self.barrier,
            usage: &mut self.usage,
            events: &mut self.events,
        };
        pool.integrate_slab(slab, &mut ctx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Enumeration and root discovery
    // ------------------------------------------------------------------

    /// Visit every live object. Caller guarantees exclusive access.
    pub fn enumerate(&self, callback: &mut dyn FnMut(NonNull<u8>, usize, ObjectAttributes)) {
        for pool in self
            .small_pools
            .iter()
            .chain(self.medium_pools.iter())
            .flatten()
        {
            pool.for_each_slab(&mut |slab| slab.enumerate_live(callback));
        }
        self.large.enumerate(callback);
    }

    /// Addresses of objects allocated `IMPLICIT_ROOT`.
    pub fn collect_implicit_roots(&self) -> Vec<usize> {
        let mut roots = Vec::new();
        self.enumerate(&mut |ptr, _, attrs| {
            if attrs.is_implicit_root() {
                roots.push(ptr.as_ptr() as usize);
            }
        });
        roots
    }

    /// Slabs flagged by mark work-list overflow.
    pub fn take_oom_rescan_slabs(&self) -> Vec<NonNull<Slab>> {
        let mut flagged = Vec::new();
        for pool in self
            .small_pools
            .iter()
            .chain(self.medium_pools.iter())
            .flatten()
        {
            pool.for_each_slab(&mut |slab| {
                if slab.take_needs_oom_rescan() {
                    flagged.push(NonNull::from(slab));
                }
            });
        }
        flagged
    }

    /// Large-object headers flagged by mark work-list overflow.
    pub fn take_oom_rescan_large(&self) -> Vec<NonNull<crate::large::LargeObjectHeader>> {
        self.large.take_oom_rescan_headers()
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    pub const fn usage(&self) -> MemoryUsage {
        self.usage.usage()
    }

    pub fn set_memory_limit(&mut self, limit: usize) {
        self.usage.set_limit(limit);
    }

    pub fn set_event_callback(&mut self, callback: Option<MemoryEventCallback>) {
        self.events = callback;
    }

    pub const fn bytes_since_collect(&self) -> usize {
        self.usage.bytes_since_collect()
    }

    pub fn reset_alloc_window(&mut self) {
        self.usage.reset_alloc_window();
    }

    /// Exact free bytes on the large-object span list.
    pub fn large_free_bytes(&self) -> usize {
        self.large.free_bytes()
    }

    /// Run every remaining finalizer; teardown path.
    pub fn dispose_all_for_teardown(&mut self) {
        for pool in self
            .small_pools
            .iter_mut()
            .chain(self.medium_pools.iter_mut())
            .flatten()
        {
            pool.dispose_all_for_teardown();
        }
        self.large.dispose_all_for_teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::{AddressClassifier, BlockEntry, BlockIndex, HeapManager};
    use crate::attrs::ObjectAttributes;
    use crate::barrier::WriteBarrierTable;
    use crate::config::CollectorConfig;
    use crate::slab::SweepMode;
    use crate::sweep::SweepCoordinator;
    use page_source::SystemPageSource;
    use std::sync::Arc;

    fn heap() -> HeapManager {
        let config = CollectorConfig {
            background: false,
            auto_collect_bytes: 0,
            ..CollectorConfig::default()
        };
        HeapManager::new(
            config,
            Arc::new(SystemPageSource),
            Arc::new(WriteBarrierTable::new()),
        )
    }

    #[test]
    fn test_block_index_range_lifecycle() {
        let mut index = BlockIndex::new();
        let page_size = page_source::page_size();
        let reservation = page_source::ReserveOptions::new(2).reserve().unwrap();
        let base = reservation.ptr() as usize;
        let slab = crate::slab::Slab::new(reservation, 64, crate::attrs::AttributeClass::Normal);
        let entry = BlockEntry::Small(std::ptr::NonNull::from(&*slab));

        index.insert_range(base, 2, entry);
        assert!(index.lookup(base).is_some());
        assert!(index.lookup(base + page_size + 100).is_some());
        assert!(index.lookup(base + 2 * page_size).is_none());
        assert!(index.in_heap_range(base + 17));

        index.remove_range(base, 2);
        assert!(index.lookup(base).is_none());
    }

    #[test]
    fn test_routing_by_size_and_class() {
        let mut h = heap();
        let small = h.alloc(40, ObjectAttributes::NONE, false).unwrap();
        let medium = h.alloc(1500, ObjectAttributes::NONE, false).unwrap();
        let large = h.alloc(20_000, ObjectAttributes::NONE, false).unwrap();

        let (_, small_size, _) = h.resolve_live_object(small.as_ptr() as usize).unwrap();
        let (_, medium_size, _) = h.resolve_live_object(medium.as_ptr() as usize).unwrap();
        let (_, large_size, _) = h.resolve_live_object(large.as_ptr() as usize).unwrap();
        assert_eq!(small_size, 48);
        assert_eq!(medium_size, 1536);
        assert_eq!(large_size, 20_000);

        assert!(matches!(
            h.classifier().classify(small.as_ptr() as usize),
            Some(BlockEntry::Small(_))
        ));
        assert!(matches!(
            h.classifier().classify(large.as_ptr() as usize),
            Some(BlockEntry::Large(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_interior_and_free() {
        let mut h = heap();
        let p = h.alloc(64, ObjectAttributes::NONE, false).unwrap();
        // Detach so the slab's bump boundary reflects true consumption.
        h.detach_caches();
        let addr = p.as_ptr() as usize;
        assert!(h.resolve_live_object(addr).is_some());
        assert!(h.resolve_live_object(addr + 8).is_none());
        assert!(h.resolve_live_object(addr + 64).is_none(), "virgin neighbor");
    }

    #[test]
    fn test_snapshot_classifies_like_live_index() {
        let mut h = heap();
        let p = h.alloc(64, ObjectAttributes::NONE, false).unwrap();
        let addr = p.as_ptr() as usize;
        let snapshot = h.snapshot();
        assert!(snapshot.in_heap_range(addr));
        assert!(matches!(
            snapshot.classify(addr),
            Some(BlockEntry::Small(_))
        ));
        assert!(snapshot.classify(addr + page_source::page_size() * 64).is_none());
    }

    #[test]
    fn test_reset_marks_is_idempotent() {
        let mut h = heap();
        let p = h.alloc(64, ObjectAttributes::NONE, false).unwrap();
        let usage = h.usage();

        h.detach_caches();
        h.reset_marks();
        let first = h.usage();
        h.reset_marks();
        assert_eq!(h.usage(), first);
        assert_eq!(usage, first, "reset never touches the free structure");
        assert!(h.resolve_live_object(p.as_ptr() as usize).is_some());
    }

    #[test]
    fn test_whole_heap_sweep_without_marks_empties_everything() {
        let mut h = heap();
        for _ in 0..100 {
            h.alloc(64, ObjectAttributes::NONE, false).unwrap();
        }
        h.alloc(20_000, ObjectAttributes::NONE, false).unwrap();

        h.detach_caches();
        h.reset_marks();
        let mut coordinator = SweepCoordinator::new();
        coordinator.begin_sweep(false);
        let stats = h.sweep(SweepMode::Eager, &mut coordinator);
        coordinator.end_sweep();

        assert_eq!(stats.reclaimed_objects, 101);
        assert_eq!(h.usage().used_bytes, 0);
    }
}
