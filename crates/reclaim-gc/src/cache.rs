//! Mutator-side allocation fast path.
//!
//! An [`AllocatorCache`] is bound to at most one slab at a time and owns that
//! slab's bump range and free list outright while bound (taken with
//! [`Slab::begin_cache`], written back on detach). The fast path is a bump
//! compare-and-advance; the fallback pops the lent free list. No locking:
//! the cache belongs to the single mutator thread that owns the collector.

use std::ptr::NonNull;

use crate::attrs::ObjectAttributes;
use crate::slab::{CacheState, Slab, FREE_LIST_END};

pub(crate) struct AllocatorCache {
    slab: Option<NonNull<Slab>>,
    state: CacheState,
}

impl AllocatorCache {
    pub const fn new() -> Self {
        Self {
            slab: None,
            state: CacheState {
                bump_next: 0,
                bump_limit: 0,
                free_head: FREE_LIST_END,
                free_count: 0,
            },
        }
    }

    pub const fn is_bound(&self) -> bool {
        self.slab.is_some()
    }

    /// Bind to a slab, taking its allocatable state. The previous binding
    /// must have been detached.
    pub fn bind(&mut self, mut slab: NonNull<Slab>) {
        debug_assert!(self.slab.is_none());
        // SAFETY: the pool hands us exclusive access to a slab it owns; the
        // mutator thread is the only writer while bound.
        let state = unsafe { slab.as_mut().begin_cache() };
        self.state = state;
        self.slab = Some(slab);
    }

    /// Write unconsumed state back and unbind. Returns the slab so the pool
    /// can re-route it (it may have filled up).
    pub fn detach(&mut self) -> Option<NonNull<Slab>> {
        let mut slab = self.slab.take()?;
        // SAFETY: see `bind`.
        unsafe { slab.as_mut().end_cache(self.state) };
        self.state.free_head = FREE_LIST_END;
        self.state.free_count = 0;
        self.state.bump_next = 0;
        self.state.bump_limit = 0;
        Some(slab)
    }

    /// Try to allocate one slot of the bound slab.
    ///
    /// Returns `None` when unbound or exhausted; the caller falls through
    /// to the pool slow path.
    #[inline]
    pub fn try_alloc(
        &mut self,
        attrs: ObjectAttributes,
        mark_new: bool,
    ) -> Option<NonNull<u8>> {
        let mut slab = self.slab?;

        let index = if self.state.bump_next < self.state.bump_limit {
            let index = self.state.bump_next;
            self.state.bump_next += 1;
            index
        } else if self.state.free_head != FREE_LIST_END {
            let index = self.state.free_head;
            // SAFETY: the free list was lent to this cache by `begin_cache`;
            // a free slot's first word is the next-free link.
            unsafe {
                let slot = slab.as_ref().slot_ptr(index);
                self.state.free_head = slot.cast::<u32>().as_ptr().read();
            }
            self.state.free_count -= 1;
            index
        } else {
            return None;
        };

        // SAFETY: exclusive slab access while bound.
        let slab_mut = unsafe { slab.as_mut() };
        slab_mut.note_alloc(index, attrs, mark_new);
        Some(slab_mut.slot_ptr(index))
    }
}

#[cfg(test)]
mod tests {
    use super::AllocatorCache;
    use crate::attrs::{AttributeClass, ObjectAttributes};
    use crate::slab::Slab;
    use page_source::ReserveOptions;

    #[test]
    fn test_bind_alloc_detach_round_trip() {
        let reservation = ReserveOptions::new(1).reserve().expect("reserve");
        let mut slab = Slab::new(reservation, 64, AttributeClass::Normal);
        let count = slab.object_count();
        let slab_ptr = std::ptr::NonNull::from(slab.as_mut());

        let mut cache = AllocatorCache::new();
        assert!(!cache.is_bound());
        assert!(cache.try_alloc(ObjectAttributes::NONE, false).is_none());

        cache.bind(slab_ptr);
        assert!(cache.is_bound());

        let mut ptrs = Vec::new();
        while let Some(p) = cache.try_alloc(ObjectAttributes::NONE, false) {
            ptrs.push(p);
        }
        assert_eq!(ptrs.len(), count as usize);

        let returned = cache.detach().expect("was bound");
        assert_eq!(returned, slab_ptr);
        assert!(!slab.has_free_space(), "write-back reflects consumption");
        assert_eq!(slab.allocated_count(), count);
    }

    #[test]
    fn test_partial_consumption_writes_back() {
        let reservation = ReserveOptions::new(1).reserve().expect("reserve");
        let mut slab = Slab::new(reservation, 64, AttributeClass::Normal);
        let count = slab.object_count();
        let slab_ptr = std::ptr::NonNull::from(slab.as_mut());

        let mut cache = AllocatorCache::new();
        cache.bind(slab_ptr);
        for _ in 0..10 {
            cache.try_alloc(ObjectAttributes::LEAF, false).unwrap();
        }
        cache.detach();

        assert_eq!(slab.allocated_count(), 10);
        assert_eq!(slab.free_slot_count(), count - 10);
        // Attribute tags were written through the slab.
        assert!(slab.slot_attributes(0).is_leaf());
    }

    #[test]
    fn test_cache_prefers_bump_then_free_list() {
        let reservation = ReserveOptions::new(1).reserve().expect("reserve");
        let mut slab = Slab::new(reservation, 128, AttributeClass::Normal);
        // Exhaust the bump region, free everything, rebind: allocation now
        // proceeds from the free list.
        let slab_ptr = std::ptr::NonNull::from(slab.as_mut());
        let mut cache = AllocatorCache::new();
        cache.bind(slab_ptr);
        while cache.try_alloc(ObjectAttributes::NONE, false).is_some() {}
        cache.detach();
        slab.sweep(crate::slab::SweepMode::Eager);

        cache.bind(slab_ptr);
        let p = cache.try_alloc(ObjectAttributes::NONE, false);
        assert!(p.is_some(), "free-list fallback serves the slot");
        cache.detach();
        assert_eq!(slab.allocated_count(), 1);
    }
}
