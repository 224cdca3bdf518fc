//! Page-backed fixed-slot memory blocks.
//!
//! A [`Slab`] owns one page-aligned reservation carved into equal-size slots.
//! Slot metadata lives in the `Slab` struct, not in the pages, so slot index
//! zero starts at the reservation base and any interior address resolves with
//! one division. The free list is threaded through the slot memory itself:
//! the first four bytes of a free slot hold the index of the next free slot.
//!
//! One slab services one (size class, attribute class) pair. The attribute
//! class is fixed at construction and selects the capability behavior
//! (finalizer slots, barrier registration, leaf scanning) that the original
//! design expressed as a family of specialized block types.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use page_source::PageReservation;

use crate::attrs::{AttributeClass, ObjectAttributes};
use crate::bits::{AtomicBitVector, BitVector};
use crate::error::heap_verify;

/// Sentinel terminating the slot free list.
pub(crate) const FREE_LIST_END: u32 = u32::MAX;

/// Finalizer callback. Receives the object start address; runs exactly once,
/// after the object is found unreachable and before its slot is reused.
pub type Finalizer = Box<dyn FnOnce(*mut u8)>;

/// Outcome of sweeping one slab; the pool uses it to pick the slab's next
/// list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    /// Every slot is free; the slab can be released or held in reserve.
    Empty,
    /// Partially allocated, nothing left to sweep or finalize.
    Swept,
    /// Every slot is live.
    Full,
    /// Dead finalizable objects are waiting on the dispose list.
    PendingDispose,
    /// Reclamation was deferred to the background sweeper.
    PendingSweep,
}

/// How a sweep pass treats slabs with reclaimable slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Reclaim in place, synchronously.
    Eager,
    /// Defer non-finalizable slabs with dead objects to the background
    /// sweeper; finalizable slabs still sweep synchronously.
    Concurrent,
    /// Skip slabs whose live percentage meets the threshold, folding them
    /// back for allocation unswept. Trades fragmentation for pause time.
    Partial {
        /// Minimum live percentage for a slab to be skipped.
        min_live_percent: u8,
    },
}

/// State lent to an [`AllocatorCache`](crate::cache::AllocatorCache) while it
/// is bound to a slab.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheState {
    /// Next virgin slot index.
    pub bump_next: u32,
    /// One past the last virgin slot.
    pub bump_limit: u32,
    /// Head of the lent free list.
    pub free_head: u32,
    /// Number of slots on the lent free list.
    pub free_count: u32,
}

/// A page-aligned block of equal-size object slots.
pub struct Slab {
    base: NonNull<u8>,
    object_size: usize,
    object_count: u32,
    kind: AttributeClass,
    /// First slot that has never been carved out. Slots at or beyond it are
    /// free by definition and absent from `free_bits`.
    bump_index: u32,
    free_head: u32,
    free_count: u32,
    free_bits: BitVector,
    mark_bits: AtomicBitVector,
    attributes: Box<[AtomicU8]>,
    finalizers: Option<Box<[Cell<Option<Finalizer>>]>>,
    /// Slot indices tagged `PENDING_DISPOSE` by the last sweep.
    pending_dispose: Vec<u32>,
    /// Set when the mark work list could not grow while scanning an object
    /// in this slab; cleared by the scratch-bounded rescan pass.
    needs_oom_rescan: AtomicBool,
    next: Option<NonNull<Slab>>,
    reservation: PageReservation,
}

impl Slab {
    /// Carve a reservation into a slab of `object_size` slots.
    ///
    /// Any remainder bytes past the last whole slot are unusable; the caller
    /// records them. The reservation must be committed.
    pub(crate) fn new(
        reservation: PageReservation,
        object_size: usize,
        kind: AttributeClass,
    ) -> Box<Self> {
        heap_verify!(
            object_size >= std::mem::size_of::<u32>(),
            "slab object size cannot hold a free-list link"
        );
        let object_count = reservation.len() / object_size;
        heap_verify!(object_count > 0, "slab reservation smaller than one slot");
        heap_verify!(
            u32::try_from(object_count).is_ok(),
            "slab slot count exceeds index width"
        );
        #[allow(clippy::cast_possible_truncation)]
        let object_count = object_count as u32;

        let base = NonNull::new(reservation.ptr()).unwrap_or_else(|| {
            crate::error::fatal::invariant_violation("page reservation yielded null")
        });

        let finalizers = kind.has_finalizers().then(|| {
            (0..object_count)
                .map(|_| Cell::new(None))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });

        Box::new(Self {
            base,
            object_size,
            object_count,
            kind,
            bump_index: 0,
            free_head: FREE_LIST_END,
            free_count: 0,
            free_bits: BitVector::new(object_count as usize),
            mark_bits: AtomicBitVector::new(object_count as usize),
            attributes: (0..object_count).map(|_| AtomicU8::new(0)).collect(),
            finalizers,
            pending_dispose: Vec::new(),
            needs_oom_rescan: AtomicBool::new(false),
            next: None,
            reservation,
        })
    }

    // ------------------------------------------------------------------
    // Geometry
    // ------------------------------------------------------------------

    /// Base address (page-aligned).
    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the last slot byte.
    #[must_use]
    pub fn end_addr(&self) -> usize {
        self.base_addr() + self.object_size * self.object_count as usize
    }

    /// Slot size in bytes.
    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    /// Number of slots.
    #[must_use]
    pub const fn object_count(&self) -> u32 {
        self.object_count
    }

    /// The slab's attribute class.
    #[must_use]
    pub const fn kind(&self) -> AttributeClass {
        self.kind
    }

    /// Pages backing the slab.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.reservation.page_count()
    }

    /// Total reserved bytes.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.reservation.len()
    }

    /// Remainder bytes past the last whole slot.
    #[must_use]
    pub fn unusable_bytes(&self) -> usize {
        self.reservation.len() - self.object_size * self.object_count as usize
    }

    fn slot_addr(&self, index: u32) -> usize {
        self.base_addr() + index as usize * self.object_size
    }

    pub(crate) fn slot_ptr(&self, index: u32) -> NonNull<u8> {
        // SAFETY: index < object_count keeps the address inside the
        // reservation, which is non-null and contiguous.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index as usize * self.object_size)) }
    }

    /// Resolve an address (interior or exact) to its slot, independent of
    /// whether the slot is currently free.
    #[must_use]
    pub fn find_object(&self, addr: usize) -> Option<(NonNull<u8>, u32)> {
        if addr < self.base_addr() || addr >= self.end_addr() {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let index = ((addr - self.base_addr()) / self.object_size) as u32;
        Some((self.slot_ptr(index), index))
    }

    /// Resolve an address that must be an exact slot start. Anything else is
    /// a pointer-tracking bug somewhere upstream and aborts.
    #[must_use]
    pub fn require_slot(&self, addr: usize) -> u32 {
        heap_verify!(
            addr >= self.base_addr() && addr < self.end_addr(),
            "address outside the slab it was indexed to"
        );
        let offset = addr - self.base_addr();
        heap_verify!(
            offset % self.object_size == 0,
            "mark address does not fall on a slot boundary"
        );
        #[allow(clippy::cast_possible_truncation)]
        let index = (offset / self.object_size) as u32;
        index
    }

    // ------------------------------------------------------------------
    // Allocation state
    // ------------------------------------------------------------------

    /// Slot is carved out and not on the free list.
    #[must_use]
    pub fn slot_is_allocated(&self, index: u32) -> bool {
        index < self.bump_index && !self.free_bits.test(index as usize)
    }

    /// Stored attribute byte for a slot.
    #[must_use]
    pub fn slot_attributes(&self, index: u32) -> ObjectAttributes {
        ObjectAttributes::from_bits_truncate(self.attributes[index as usize].load(Ordering::Relaxed))
    }

    /// Any slot available without sweeping?
    #[must_use]
    pub const fn has_free_space(&self) -> bool {
        self.free_count > 0 || self.bump_index < self.object_count
    }

    /// Free slots (free list plus virgin suffix).
    #[must_use]
    pub const fn free_slot_count(&self) -> u32 {
        self.free_count + (self.object_count - self.bump_index)
    }

    /// Allocated (live from the allocator's point of view) slots.
    #[must_use]
    pub const fn allocated_count(&self) -> u32 {
        self.bump_index - self.free_count
    }

    /// Record an allocation into `index`: tag the attribute byte and, when a
    /// mark phase is active, allocate black so the new object survives the
    /// in-flight cycle.
    pub(crate) fn note_alloc(&mut self, index: u32, attrs: ObjectAttributes, mark_new: bool) {
        if self.free_bits.test(index as usize) {
            self.free_bits.clear(index as usize);
        }
        self.attributes[index as usize].store(attrs.bits(), Ordering::Relaxed);
        if mark_new {
            self.mark_bits.test_and_set(index as usize);
        }
    }

    /// Allocate one slot directly, bypassing the cache protocol.
    #[allow(dead_code)]
    pub(crate) fn alloc_one(
        &mut self,
        attrs: ObjectAttributes,
        mark_new: bool,
    ) -> Option<NonNull<u8>> {
        let index = if self.free_head != FREE_LIST_END {
            let index = self.free_head;
            // SAFETY: a free slot's first word holds the next free index;
            // it was written by `push_free_slot` on this thread or the
            // sweeping owner before handoff.
            self.free_head = unsafe { self.slot_ptr(index).cast::<u32>().as_ptr().read() };
            self.free_count -= 1;
            index
        } else if self.bump_index < self.object_count {
            let index = self.bump_index;
            self.bump_index += 1;
            index
        } else {
            return None;
        };
        self.note_alloc(index, attrs, mark_new);
        Some(self.slot_ptr(index))
    }

    /// Return a slot to the free list.
    fn push_free_slot(&mut self, index: u32) {
        debug_assert!(!self.free_bits.test(index as usize));
        // SAFETY: the slot is dead; its first word becomes the link.
        unsafe {
            self.slot_ptr(index).cast::<u32>().as_ptr().write(self.free_head);
        }
        self.free_head = index;
        self.free_count += 1;
        self.free_bits.set(index as usize);
        self.attributes[index as usize].store(0, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Cache protocol
    // ------------------------------------------------------------------

    /// Lend the slab's bump range and free list to an allocator cache.
    /// Until [`Self::end_cache`], the slab reports no free space so the
    /// pool never double-lends.
    pub(crate) fn begin_cache(&mut self) -> CacheState {
        let state = CacheState {
            bump_next: self.bump_index,
            bump_limit: self.object_count,
            free_head: self.free_head,
            free_count: self.free_count,
        };
        self.bump_index = self.object_count;
        self.free_head = FREE_LIST_END;
        self.free_count = 0;
        state
    }

    /// Write back the unconsumed part of a lent cache state.
    pub(crate) fn end_cache(&mut self, state: CacheState) {
        self.bump_index = state.bump_next;
        self.free_head = state.free_head;
        self.free_count = state.free_count;
    }

    // ------------------------------------------------------------------
    // Marking
    // ------------------------------------------------------------------

    /// Set a slot's mark bit; true if newly marked.
    pub fn mark_slot(&self, index: u32) -> bool {
        self.mark_bits.test_and_set(index as usize)
    }

    /// Test a slot's mark bit.
    #[must_use]
    pub fn is_marked(&self, index: u32) -> bool {
        self.mark_bits.test(index as usize)
    }

    /// Clear all mark bits. Idempotent.
    pub fn clear_marks(&self) {
        self.mark_bits.clear_all();
    }

    /// Flag the slab for the scratch-bounded rescan pass.
    pub fn set_needs_oom_rescan(&self) {
        self.needs_oom_rescan.store(true, Ordering::Release);
    }

    /// Consume the rescan flag.
    pub fn take_needs_oom_rescan(&self) -> bool {
        self.needs_oom_rescan.swap(false, Ordering::AcqRel)
    }

    // ------------------------------------------------------------------
    // Sweep
    // ------------------------------------------------------------------

    /// True if any carved slot is unmarked and not already free.
    #[must_use]
    pub fn has_unmarked_allocated(&self) -> bool {
        (0..self.bump_index)
            .any(|i| !self.free_bits.test(i as usize) && !self.mark_bits.test(i as usize))
    }

    /// Marked slots among carved, non-free ones.
    #[must_use]
    pub fn live_count(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let live = (0..self.bump_index)
            .filter(|&i| !self.free_bits.test(i as usize) && self.mark_bits.test(i as usize))
            .count() as u32;
        live
    }

    /// Sweep the slab against the marks left by the preceding mark phase.
    ///
    /// Liveness is computed strictly from the (mark, free) pair plus the
    /// bump boundary; the two vectors are never overlaid. On return the
    /// mark bits are clear (except `Concurrent` deferral, which leaves the
    /// slab untouched for the background sweeper) and
    /// `free_bits[i] == !live[i]` over the carved region.
    pub fn sweep(&mut self, mode: SweepMode) -> SweepState {
        match mode {
            SweepMode::Concurrent if self.kind.sweeps_in_background() => {
                if self.has_unmarked_allocated() {
                    return SweepState::PendingSweep;
                }
                // Nothing dead: just drop the marks and report fullness.
                self.clear_marks();
                return self.fullness();
            }
            SweepMode::Partial { min_live_percent } if !self.kind.has_finalizers() => {
                let live = u64::from(self.live_count());
                let total = u64::from(self.object_count);
                if live * 100 >= u64::from(min_live_percent) * total {
                    self.clear_marks();
                    return self.fullness();
                }
            }
            _ => {}
        }
        self.sweep_eager()
    }

    fn sweep_eager(&mut self) -> SweepState {
        let mut live = 0u32;
        for index in 0..self.bump_index {
            if self.free_bits.test(index as usize) {
                continue;
            }
            if self.mark_bits.test(index as usize) {
                live += 1;
                continue;
            }
            let attrs = self.slot_attributes(index);
            if attrs.is_finalizable() && self.has_finalizer(index) {
                if !attrs.is_pending_dispose() {
                    self.attributes[index as usize].fetch_or(
                        ObjectAttributes::PENDING_DISPOSE.bits(),
                        Ordering::Relaxed,
                    );
                    self.pending_dispose.push(index);
                }
                continue;
            }
            self.push_free_slot(index);
        }
        self.clear_marks();

        if !self.pending_dispose.is_empty() {
            SweepState::PendingDispose
        } else if live == 0 {
            debug_assert_eq!(self.free_slot_count(), self.object_count);
            SweepState::Empty
        } else {
            self.fullness()
        }
    }

    fn fullness(&self) -> SweepState {
        if self.free_slot_count() == 0 {
            SweepState::Full
        } else if self.allocated_count() == 0 {
            SweepState::Empty
        } else {
            SweepState::Swept
        }
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    fn has_finalizer(&self, index: u32) -> bool {
        self.finalizers.as_ref().is_some_and(|f| {
            let cell = &f[index as usize];
            // Cell<Option<Box<..>>> has no peek; take and put back.
            let v = cell.take();
            let present = v.is_some();
            cell.set(v);
            present
        })
    }

    /// Install a finalizer for an allocated slot. The slab must be of a
    /// finalizable class and the slot tagged `FINALIZE`.
    pub(crate) fn set_finalizer(&mut self, index: u32, finalizer: Finalizer) -> bool {
        if !self.kind.has_finalizers() || !self.slot_is_allocated(index) {
            return false;
        }
        if !self.slot_attributes(index).is_finalizable() {
            return false;
        }
        if let Some(f) = self.finalizers.as_mut() {
            f[index as usize].set(Some(finalizer));
            true
        } else {
            false
        }
    }

    /// Run finalizers for slots the last sweep tagged, then free them.
    /// Returns the number of slots disposed. A panicking finalizer is
    /// caught at this boundary.
    pub fn dispose_pending(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending_dispose);
        let disposed = pending.len();
        for index in pending {
            let finalizer = self
                .finalizers
                .as_mut()
                .and_then(|f| f[index as usize].take());
            if let Some(f) = finalizer {
                let obj = self.slot_ptr(index).as_ptr();
                let _ = catch_unwind(AssertUnwindSafe(move || f(obj)));
            }
            self.push_free_slot(index);
        }
        disposed
    }

    /// Run the finalizers of every still-live finalizable slot. Teardown
    /// path: each registered finalizer runs exactly once even if the heap
    /// is dropped with the object still reachable.
    pub(crate) fn dispose_all_for_teardown(&mut self) {
        if self.finalizers.is_none() {
            return;
        }
        for index in 0..self.bump_index {
            if self.free_bits.test(index as usize) {
                continue;
            }
            let finalizer = self
                .finalizers
                .as_mut()
                .and_then(|f| f[index as usize].take());
            if let Some(f) = finalizer {
                let obj = self.slot_ptr(index).as_ptr();
                let _ = catch_unwind(AssertUnwindSafe(move || f(obj)));
            }
        }
    }

    // ------------------------------------------------------------------
    // Enumeration
    // ------------------------------------------------------------------

    /// Invoke `callback` for every allocated slot.
    pub fn enumerate_live(
        &self,
        callback: &mut dyn FnMut(NonNull<u8>, usize, ObjectAttributes),
    ) {
        for index in 0..self.bump_index {
            if !self.free_bits.test(index as usize) {
                callback(self.slot_ptr(index), self.object_size, self.slot_attributes(index));
            }
        }
    }

    /// Invoke `callback` for every marked, allocated slot. Used by the
    /// OOM-rescan and dirty-card rescan passes, which re-scan the contents
    /// of already-marked objects.
    pub fn for_each_marked_object(&self, callback: &mut dyn FnMut(NonNull<u8>, usize)) {
        for index in 0..self.bump_index {
            if !self.free_bits.test(index as usize) && self.mark_bits.test(index as usize) {
                callback(self.slot_ptr(index), self.object_size);
            }
        }
    }

    // ------------------------------------------------------------------
    // Intrusive list link
    // ------------------------------------------------------------------

    pub(crate) fn next_link(&self) -> Option<NonNull<Self>> {
        self.next
    }

    pub(crate) fn set_next_link(&mut self, next: Option<NonNull<Self>>) {
        self.next = next;
    }
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab")
            .field("base", &format_args!("{:#x}", self.base_addr()))
            .field("object_size", &self.object_size)
            .field("object_count", &self.object_count)
            .field("kind", &self.kind)
            .field("bump_index", &self.bump_index)
            .field("free_count", &self.free_count)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SlabList - intrusive singly-linked list
// ============================================================================

/// Singly-linked list of slabs threaded through their `next` links.
///
/// A slab is on exactly one list at a time; the list owns its slabs (they
/// are boxed into it and boxed back out on pop).
#[derive(Default)]
pub(crate) struct SlabList {
    head: Option<NonNull<Slab>>,
    len: usize,
}

impl SlabList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Push a slab, returning its stable address (boxed slabs never move).
    pub fn push(&mut self, mut slab: Box<Slab>) -> NonNull<Slab> {
        slab.set_next_link(self.head);
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(slab)) };
        self.head = Some(ptr);
        self.len += 1;
        ptr
    }

    pub fn pop(&mut self) -> Option<Box<Slab>> {
        let head = self.head?;
        // SAFETY: every node was produced by Box::into_raw in `push` and is
        // owned exclusively by this list.
        let mut slab = unsafe { Box::from_raw(head.as_ptr()) };
        self.head = slab.next_link();
        slab.set_next_link(None);
        self.len -= 1;
        Some(slab)
    }

    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    pub fn iter(&self) -> SlabIter<'_> {
        SlabIter {
            next: self.head,
            _list: std::marker::PhantomData,
        }
    }
}

impl Drop for SlabList {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

pub(crate) struct SlabIter<'a> {
    next: Option<NonNull<Slab>>,
    _list: std::marker::PhantomData<&'a SlabList>,
}

impl<'a> Iterator for SlabIter<'a> {
    type Item = &'a Slab;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        // SAFETY: nodes are alive for the lifetime of the borrowed list and
        // links are only mutated through &mut SlabList.
        let slab = unsafe { &*node.as_ptr() };
        self.next = slab.next_link();
        Some(slab)
    }
}

#[cfg(test)]
mod tests {
    use super::{Slab, SlabList, SweepMode, SweepState};
    use crate::attrs::{AttributeClass, ObjectAttributes};
    use page_source::ReserveOptions;

    fn make_slab(object_size: usize, kind: AttributeClass) -> Box<Slab> {
        let reservation = ReserveOptions::new(1).reserve().expect("reserve failed");
        Slab::new(reservation, object_size, kind)
    }

    #[test]
    fn test_geometry() {
        let slab = make_slab(64, AttributeClass::Normal);
        assert_eq!(slab.object_size(), 64);
        assert_eq!(slab.object_count() as usize, page_source::page_size() / 64);
        assert_eq!(slab.unusable_bytes(), 0);
        assert_eq!(slab.base_addr() % page_source::page_size(), 0);
    }

    #[test]
    fn test_alloc_until_full() {
        let mut slab = make_slab(128, AttributeClass::Normal);
        let count = slab.object_count();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..count {
            let ptr = slab.alloc_one(ObjectAttributes::NONE, false).expect("slot");
            assert!(seen.insert(ptr.as_ptr() as usize));
        }
        assert!(slab.alloc_one(ObjectAttributes::NONE, false).is_none());
        assert!(!slab.has_free_space());
    }

    #[test]
    fn test_interior_pointer_resolution() {
        let mut slab = make_slab(64, AttributeClass::Normal);
        let ptr = slab.alloc_one(ObjectAttributes::NONE, false).unwrap();
        let addr = ptr.as_ptr() as usize;

        let (start, index) = slab.find_object(addr + 17).expect("interior resolves");
        assert_eq!(start, ptr);
        assert_eq!(index, 0);

        // Free slots resolve too; conservative marking depends on it.
        let (_, idx2) = slab.find_object(addr + 64 + 63).expect("resolves");
        assert_eq!(idx2, 1);

        assert!(slab.find_object(slab.end_addr()).is_none());
        assert!(slab.find_object(slab.base_addr().wrapping_sub(1)).is_none());
    }

    #[test]
    fn test_sweep_reclaims_unmarked() {
        let mut slab = make_slab(64, AttributeClass::Normal);
        let count = slab.object_count();
        for _ in 0..count {
            slab.alloc_one(ObjectAttributes::NONE, false).unwrap();
        }
        // Mark the even slots only.
        for i in (0..count).step_by(2) {
            assert!(slab.mark_slot(i));
        }
        let state = slab.sweep(SweepMode::Eager);
        assert_eq!(state, SweepState::Swept);

        // Free/mark disjointness: free bits are exactly the complement of
        // the live set, and marks are gone.
        for i in 0..count {
            assert_eq!(slab.slot_is_allocated(i), i % 2 == 0);
            assert!(!slab.is_marked(i));
        }
        assert_eq!(slab.free_slot_count(), count / 2);
    }

    #[test]
    fn test_sweep_states() {
        let mut slab = make_slab(256, AttributeClass::Normal);
        let count = slab.object_count();

        // Nothing allocated: empty.
        assert_eq!(slab.sweep(SweepMode::Eager), SweepState::Empty);

        for _ in 0..count {
            slab.alloc_one(ObjectAttributes::NONE, false).unwrap();
        }
        for i in 0..count {
            slab.mark_slot(i);
        }
        assert_eq!(slab.sweep(SweepMode::Eager), SweepState::Full);

        // Unmarked second time round: everything dies.
        assert_eq!(slab.sweep(SweepMode::Eager), SweepState::Empty);
        assert_eq!(slab.free_slot_count(), count);
    }

    #[test]
    fn test_slot_reuse_after_sweep() {
        let mut slab = make_slab(64, AttributeClass::Normal);
        let first = slab.alloc_one(ObjectAttributes::NONE, false).unwrap();
        slab.sweep(SweepMode::Eager);
        let again = slab.alloc_one(ObjectAttributes::NONE, false).unwrap();
        assert_eq!(first, again, "freed slot is reused");
    }

    #[test]
    fn test_concurrent_mode_defers() {
        let mut slab = make_slab(64, AttributeClass::Normal);
        slab.alloc_one(ObjectAttributes::NONE, false).unwrap();
        // Dead object present: deferral.
        assert_eq!(slab.sweep(SweepMode::Concurrent), SweepState::PendingSweep);
        // The deferred slab is untouched.
        assert!(slab.slot_is_allocated(0));
    }

    #[test]
    fn test_partial_mode_folds_back_dense_slabs() {
        let mut slab = make_slab(64, AttributeClass::Normal);
        let count = slab.object_count();
        for _ in 0..count {
            slab.alloc_one(ObjectAttributes::NONE, false).unwrap();
        }
        // 75% live.
        for i in 0..count * 3 / 4 {
            slab.mark_slot(i);
        }
        let state = slab.sweep(SweepMode::Partial {
            min_live_percent: 50,
        });
        assert_eq!(state, SweepState::Full);
        // Dead slots were not reclaimed; fragmentation accepted.
        assert_eq!(slab.free_slot_count(), 0);

        // Below the threshold the eager path runs.
        for i in 0..count / 4 {
            slab.mark_slot(i);
        }
        let state = slab.sweep(SweepMode::Partial {
            min_live_percent: 50,
        });
        assert_eq!(state, SweepState::Swept);
        assert_eq!(slab.free_slot_count(), count - count / 4);
    }

    #[test]
    fn test_finalizable_sweep_defers_dispose() {
        use std::rc::Rc;
        use std::cell::Cell;

        let mut slab = make_slab(64, AttributeClass::Finalizable);
        let ptr = slab
            .alloc_one(ObjectAttributes::FINALIZE, false)
            .unwrap();
        let ran = Rc::new(Cell::new(0u32));
        let ran2 = Rc::clone(&ran);
        assert!(slab.set_finalizer(0, Box::new(move |_| ran2.set(ran2.get() + 1))));

        // Unmarked: sweep defers rather than reclaims.
        assert_eq!(slab.sweep(SweepMode::Eager), SweepState::PendingDispose);
        assert_eq!(ran.get(), 0);
        assert!(slab
            .slot_attributes(0)
            .is_pending_dispose());

        // A second sweep must not queue it twice.
        assert_eq!(slab.sweep(SweepMode::Eager), SweepState::PendingDispose);

        assert_eq!(slab.dispose_pending(), 1);
        assert_eq!(ran.get(), 1, "finalizer ran exactly once");

        // Slot is free again and reusable.
        let again = slab.alloc_one(ObjectAttributes::FINALIZE, false).unwrap();
        assert_eq!(ptr, again);
    }

    #[test]
    fn test_finalizer_panic_is_contained() {
        let mut slab = make_slab(64, AttributeClass::Finalizable);
        slab.alloc_one(ObjectAttributes::FINALIZE, false).unwrap();
        assert!(slab.set_finalizer(0, Box::new(|_| panic!("bad finalizer"))));
        slab.sweep(SweepMode::Eager);
        assert_eq!(slab.dispose_pending(), 1);
        assert!(!slab.slot_is_allocated(0));
    }

    #[test]
    fn test_cache_lend_and_writeback() {
        let mut slab = make_slab(64, AttributeClass::Normal);
        let state = slab.begin_cache();
        assert!(!slab.has_free_space(), "lent slab reports no space");
        slab.end_cache(state);
        assert!(slab.has_free_space());
        assert_eq!(slab.free_slot_count(), slab.object_count());
    }

    #[test]
    fn test_slab_list() {
        let mut list = SlabList::new();
        assert!(list.is_empty());
        list.push(make_slab(64, AttributeClass::Normal));
        list.push(make_slab(128, AttributeClass::Normal));
        assert_eq!(list.len(), 2);

        let sizes: Vec<usize> = list.iter().map(Slab::object_size).collect();
        assert_eq!(sizes, vec![128, 64]);

        let top = list.pop().unwrap();
        assert_eq!(top.object_size(), 128);
        assert_eq!(list.len(), 1);
        let taken = list.take();
        assert!(list.is_empty());
        assert_eq!(taken.len(), 1);
    }
}
