//! Per-(size class, attribute class) slab pools.
//!
//! A pool owns every slab of one size/attribute pair, distributed over five
//! lists: allocatable, full, empty (the low-water reserve), pending-dispose
//! and — during concurrent collection — pending-sweep, which lives in the
//! sweep coordinator until the foreground thread merges it back at a safe
//! point. A slab is on exactly one list at a time. Only the foreground
//! thread mutates pool lists; the background sweeper works on slabs that
//! have been handed off wholesale.

use std::ptr::NonNull;

use crate::attrs::{AttributeClass, ObjectAttributes};
use crate::cache::AllocatorCache;
use crate::error::{heap_verify, Result};
use crate::heap::{BlockEntry, HeapCtx, PoolId};
use crate::slab::{Slab, SlabList, SweepMode, SweepState};
use crate::sweep::SweepCoordinator;

/// Outcome counters from sweeping one pool.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PoolSweepStats {
    pub reclaimed_slots: usize,
    pub deferred_slabs: usize,
}

pub(crate) struct SizeClassPool {
    object_size: usize,
    kind: AttributeClass,
    id: PoolId,
    slab_pages: usize,
    empty_reserve: usize,
    allocatable: SlabList,
    full: SlabList,
    empty: SlabList,
    pending_dispose: SlabList,
    cache: AllocatorCache,
    /// Remainder bytes lost to slot rounding, per slab carve.
    unusable_bytes: usize,
}

impl SizeClassPool {
    pub fn new(
        object_size: usize,
        kind: AttributeClass,
        id: PoolId,
        slab_pages: usize,
        empty_reserve: usize,
    ) -> Self {
        Self {
            object_size,
            kind,
            id,
            slab_pages,
            empty_reserve,
            allocatable: SlabList::new(),
            full: SlabList::new(),
            empty: SlabList::new(),
            pending_dispose: SlabList::new(),
            cache: AllocatorCache::new(),
            unusable_bytes: 0,
        }
    }

    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    /// Allocate one object. Tries the cache, then the pool lists, then a
    /// new slab from the page source.
    pub fn alloc(
        &mut self,
        attrs: ObjectAttributes,
        mark_new: bool,
        ctx: &mut HeapCtx<'_>,
    ) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.cache.try_alloc(attrs, mark_new) {
            ctx.usage.on_alloc(self.object_size);
            return Ok(ptr);
        }

        self.cache.detach();

        // First fit over the allocatable list; exhausted slabs migrate to
        // the full list as the scan passes them.
        let mut passed = SlabList::new();
        let mut bound = false;
        while let Some(slab) = self.allocatable.pop() {
            if slab.has_free_space() {
                self.adopt_and_bind(slab);
                bound = true;
                break;
            }
            passed.push(slab);
        }
        while let Some(slab) = passed.pop() {
            self.full.push(slab);
        }

        if !bound {
            if let Some(slab) = self.empty.pop() {
                self.adopt_and_bind(slab);
                bound = true;
            }
        }

        if !bound {
            let reservation = ctx.reserve_pages(self.slab_pages)?;
            let slab = Slab::new(reservation, self.object_size, self.kind);
            self.unusable_bytes += slab.unusable_bytes();
            let base = slab.base_addr();
            let pages = slab.page_count();
            let ptr = self.allocatable.push(slab);
            self.cache.bind(ptr);
            ctx.index.insert_range(base, pages, BlockEntry::Small(ptr));
            if self.kind.barrier_tracked() {
                ctx.barrier.on_region_reserved(base, pages);
            }
        }

        let ptr = self.cache.try_alloc(attrs, mark_new);
        let ptr = ptr.unwrap_or_else(|| {
            crate::error::fatal::invariant_violation("freshly bound slab yielded no slot")
        });
        ctx.usage.on_alloc(self.object_size);
        Ok(ptr)
    }

    /// Push a slab onto the allocatable list and bind the cache to it.
    fn adopt_and_bind(&mut self, slab: Box<Slab>) {
        let ptr = self.allocatable.push(slab);
        self.cache.bind(ptr);
    }

    /// Unbind the allocator cache, writing its state back. Required before
    /// any whole-heap phase touches the pool's slabs.
    pub fn detach_cache(&mut self) {
        self.cache.detach();
    }

    /// Sweep every slab on the allocatable and full lists and re-route
    /// them by sweep state.
    pub fn sweep_all(
        &mut self,
        mode: SweepMode,
        coordinator: &mut SweepCoordinator,
        ctx: &mut HeapCtx<'_>,
    ) -> PoolSweepStats {
        heap_verify!(
            !self.cache.is_bound(),
            "sweep entered with an allocator cache still bound"
        );
        let mut stats = PoolSweepStats::default();
        let mut work = self.allocatable.take();
        let mut full = self.full.take();
        while let Some(slab) = full.pop() {
            work.push(slab);
        }

        while let Some(mut slab) = work.pop() {
            let before = slab.allocated_count();
            let state = slab.sweep(mode);
            match state {
                SweepState::PendingSweep => {
                    stats.deferred_slabs += 1;
                    coordinator.queue_pending_sweep_block(self.id, slab);
                }
                SweepState::PendingDispose => {
                    stats.reclaimed_slots += (before - slab.allocated_count()) as usize;
                    self.pending_dispose.push(slab);
                }
                SweepState::Empty => {
                    stats.reclaimed_slots += before as usize;
                    if matches!(mode, SweepMode::Concurrent) {
                        coordinator.queue_empty_block(self.id, slab);
                    } else {
                        self.retire_empty(slab, ctx);
                    }
                }
                SweepState::Swept => {
                    stats.reclaimed_slots += (before - slab.allocated_count()) as usize;
                    self.allocatable.push(slab);
                }
                SweepState::Full => {
                    self.full.push(slab);
                }
            }
        }
        ctx.usage
            .on_reclaim(stats.reclaimed_slots * self.object_size);
        stats
    }

    /// Fold background-swept slabs back into the live lists. Foreground
    /// only, at a safe point.
    pub fn merge_swept(
        &mut self,
        slabs: Vec<(Box<Slab>, SweepState, u32)>,
        ctx: &mut HeapCtx<'_>,
    ) -> usize {
        let mut reclaimed = 0usize;
        for (slab, state, reclaimed_slots) in slabs {
            reclaimed += reclaimed_slots as usize;
            match state {
                SweepState::Empty => self.retire_empty(slab, ctx),
                SweepState::Full => {
                    self.full.push(slab);
                }
                SweepState::Swept => {
                    self.allocatable.push(slab);
                }
                SweepState::PendingDispose | SweepState::PendingSweep => {
                    crate::error::fatal::invariant_violation(
                        "background sweep produced a synchronous-only state",
                    );
                }
            }
        }
        ctx.usage.on_reclaim(reclaimed * self.object_size);
        reclaimed
    }

    /// Run finalizers deferred by the last sweep, then free the slots.
    pub fn flush_pending_disposes(&mut self, ctx: &mut HeapCtx<'_>) -> usize {
        let mut disposed = 0;
        let mut list = self.pending_dispose.take();
        while let Some(mut slab) = list.pop() {
            let n = slab.dispose_pending();
            disposed += n;
            ctx.usage.on_reclaim(n * self.object_size);
            self.route_by_fullness(slab, ctx);
        }
        disposed
    }

    fn route_by_fullness(&mut self, slab: Box<Slab>, ctx: &mut HeapCtx<'_>) {
        if slab.allocated_count() == 0 {
            self.retire_empty(slab, ctx);
        } else if slab.has_free_space() {
            self.allocatable.push(slab);
        } else {
            self.full.push(slab);
        }
    }

    /// Keep up to the low-water reserve of empty slabs; release the rest
    /// back to the page source.
    pub(crate) fn retire_empty(&mut self, slab: Box<Slab>, ctx: &mut HeapCtx<'_>) {
        if self.empty.len() < self.empty_reserve {
            self.empty.push(slab);
            return;
        }
        let bytes = slab.reserved_bytes();
        ctx.index.remove_range(slab.base_addr(), slab.page_count());
        if self.kind.barrier_tracked() {
            ctx.barrier
                .on_region_released(slab.base_addr(), slab.page_count());
        }
        ctx.usage.on_released(bytes);
        ctx.notify_free(bytes);
        drop(slab);
    }

    /// Adopt a slab built from an external page range.
    pub fn integrate_slab(&mut self, slab: Box<Slab>, ctx: &mut HeapCtx<'_>) {
        heap_verify!(
            slab.object_size() == self.object_size && slab.kind() == self.kind,
            "integrated block geometry does not match its pool"
        );
        self.unusable_bytes += slab.unusable_bytes();
        let ptr = self.allocatable.push(slab);
        // SAFETY: just pushed; the list owns it.
        let (base, pages) = unsafe { (ptr.as_ref().base_addr(), ptr.as_ref().page_count()) };
        ctx.index.insert_range(base, pages, BlockEntry::Small(ptr));
        if self.kind.barrier_tracked() {
            ctx.barrier.on_region_reserved(base, pages);
        }
    }

    /// Visit every slab the pool currently owns.
    pub fn for_each_slab(&self, f: &mut dyn FnMut(&Slab)) {
        for list in [
            &self.allocatable,
            &self.full,
            &self.empty,
            &self.pending_dispose,
        ] {
            for slab in list.iter() {
                f(slab);
            }
        }
    }

    /// Clear mark bits and rescan flags on every slab. Idempotent: calling
    /// it twice with no intervening marking changes nothing.
    pub fn reset_marks(&mut self) {
        self.for_each_slab(&mut |slab| {
            slab.clear_marks();
            let _ = slab.take_needs_oom_rescan();
        });
    }

    /// Free slots currently available without growing.
    #[allow(dead_code)]
    pub fn free_slot_count(&self) -> usize {
        let mut n = 0;
        self.for_each_slab(&mut |slab| n += slab.free_slot_count() as usize);
        n
    }

    /// Slabs owned across all lists.
    #[allow(dead_code)]
    pub fn slab_count(&self) -> usize {
        self.allocatable.len() + self.full.len() + self.empty.len() + self.pending_dispose.len()
    }

    /// Bytes lost to slot rounding so far.
    #[allow(dead_code)]
    pub const fn unusable_bytes(&self) -> usize {
        self.unusable_bytes
    }

    /// Run remaining finalizers at collector teardown.
    pub fn dispose_all_for_teardown(&mut self) {
        if !self.kind.has_finalizers() {
            return;
        }
        for list in [
            &mut self.allocatable,
            &mut self.full,
            &mut self.pending_dispose,
        ] {
            let mut drained = list.take();
            let mut restore = SlabList::new();
            while let Some(mut slab) = drained.pop() {
                slab.dispose_all_for_teardown();
                restore.push(slab);
            }
            while let Some(slab) = restore.pop() {
                list.push(slab);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SizeClassPool;
    use crate::attrs::{AttributeClass, ObjectAttributes};
    use crate::barrier::WriteBarrierTable;
    use crate::heap::{BlockEntry, BlockIndex, HeapCtx, PoolId, UsageCounters};
    use crate::slab::SweepMode;
    use crate::sweep::SweepCoordinator;
    use page_source::SystemPageSource;

    struct Fixture {
        src: SystemPageSource,
        index: BlockIndex,
        barrier: WriteBarrierTable,
        usage: UsageCounters,
        events: Option<crate::metrics::MemoryEventCallback>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                src: SystemPageSource,
                index: BlockIndex::new(),
                barrier: WriteBarrierTable::new(),
                usage: UsageCounters::new(usize::MAX),
                events: None,
            }
        }

        fn ctx(&mut self) -> HeapCtx<'_> {
            HeapCtx {
                page_source: &self.src,
                index: &mut self.index,
                barrier: &self.barrier,
                usage: &mut self.usage,
                events: &mut self.events,
            }
        }
    }

    fn pool(object_size: usize, kind: AttributeClass, reserve: usize) -> SizeClassPool {
        SizeClassPool::new(object_size, kind, PoolId::small(kind, 3), 1, reserve)
    }

    #[test]
    fn test_alloc_grows_one_slab_at_a_time() {
        let mut fx = Fixture::new();
        let mut p = pool(64, AttributeClass::Normal, 2);
        let per_slab = page_source::page_size() / 64;

        for _ in 0..per_slab {
            p.alloc(ObjectAttributes::NONE, false, &mut fx.ctx()).unwrap();
        }
        assert_eq!(p.slab_count(), 1);
        p.alloc(ObjectAttributes::NONE, false, &mut fx.ctx()).unwrap();
        assert_eq!(p.slab_count(), 2);
    }

    #[test]
    fn test_alloc_registers_pages_in_index() {
        let mut fx = Fixture::new();
        let mut p = pool(64, AttributeClass::Normal, 2);
        let ptr = p.alloc(ObjectAttributes::NONE, false, &mut fx.ctx()).unwrap();
        let entry = fx.index.lookup(ptr.as_ptr() as usize);
        assert!(matches!(entry, Some(BlockEntry::Small(_))));
    }

    #[test]
    fn test_sweep_all_reclaims_and_routes() {
        let mut fx = Fixture::new();
        let mut p = pool(64, AttributeClass::Normal, 2);
        let per_slab = page_source::page_size() / 64;

        let ptrs: Vec<_> = (0..per_slab)
            .map(|_| p.alloc(ObjectAttributes::NONE, false, &mut fx.ctx()).unwrap())
            .collect();

        // Mark half through the owning slab.
        let Some(BlockEntry::Small(slab_ptr)) = fx.index.lookup(ptrs[0].as_ptr() as usize)
        else {
            panic!("slab not indexed");
        };
        let slab = unsafe { slab_ptr.as_ref() };
        for ptr in ptrs.iter().take(per_slab / 2) {
            let (_, idx) = slab.find_object(ptr.as_ptr() as usize).unwrap();
            slab.mark_slot(idx);
        }

        p.detach_cache();
        let mut coordinator = SweepCoordinator::new();
        coordinator.begin_sweep(false);
        let stats = p.sweep_all(SweepMode::Eager, &mut coordinator, &mut fx.ctx());
        coordinator.end_sweep();

        assert_eq!(stats.reclaimed_slots, per_slab / 2);
        assert_eq!(stats.deferred_slabs, 0);
        assert_eq!(p.free_slot_count(), per_slab / 2);
    }

    #[test]
    fn test_empty_reserve_bounds_retained_slabs() {
        let mut fx = Fixture::new();
        let mut p = pool(64, AttributeClass::Normal, 1);
        let per_slab = page_source::page_size() / 64;

        // Fill two slabs with garbage.
        for _ in 0..per_slab * 2 {
            p.alloc(ObjectAttributes::NONE, false, &mut fx.ctx()).unwrap();
        }
        let reserved_full = fx.usage.usage().reserved_bytes;
        assert_eq!(reserved_full, 2 * page_source::page_size());

        p.detach_cache();
        let mut coordinator = SweepCoordinator::new();
        coordinator.begin_sweep(false);
        p.sweep_all(SweepMode::Eager, &mut coordinator, &mut fx.ctx());
        coordinator.end_sweep();

        // One empty slab kept in reserve, the other released.
        assert_eq!(p.slab_count(), 1);
        assert_eq!(fx.usage.usage().reserved_bytes, page_source::page_size());
    }

    #[test]
    fn test_pending_dispose_defers_then_flushes() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut fx = Fixture::new();
        let mut p = pool(64, AttributeClass::Finalizable, 2);
        let ptr = p
            .alloc(ObjectAttributes::FINALIZE, false, &mut fx.ctx())
            .unwrap();

        let ran = Rc::new(Cell::new(0u32));
        let ran2 = Rc::clone(&ran);
        let Some(BlockEntry::Small(mut slab_ptr)) = fx.index.lookup(ptr.as_ptr() as usize)
        else {
            panic!("slab not indexed");
        };
        let idx = unsafe { slab_ptr.as_ref() }
            .find_object(ptr.as_ptr() as usize)
            .unwrap()
            .1;
        assert!(unsafe { slab_ptr.as_mut() }
            .set_finalizer(idx, Box::new(move |_| ran2.set(ran2.get() + 1))));

        p.detach_cache();
        let mut coordinator = SweepCoordinator::new();
        coordinator.begin_sweep(false);
        p.sweep_all(SweepMode::Eager, &mut coordinator, &mut fx.ctx());
        coordinator.end_sweep();
        assert_eq!(ran.get(), 0, "dispose is deferred past the sweep");

        let disposed = p.flush_pending_disposes(&mut fx.ctx());
        assert_eq!(disposed, 1);
        assert_eq!(ran.get(), 1);
        assert_eq!(p.free_slot_count(), page_source::page_size() / 64);
    }
}
