//! Allocations above the size-class ceiling.
//!
//! Large objects are not bitmap-managed. Each allocation is an inline
//! `(header, payload)` record inside a [`LargeObjectSlab`]; the slab keeps a
//! header table in allocation order (entries null out on free, compacted
//! lazily) and the pool tracks free space as an address-sorted span list
//! with split on allocation and neighbor coalescing on free.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use page_source::PageReservation;

use crate::attrs::ObjectAttributes;
use crate::error::{heap_verify, CollectorError, Result};
use crate::heap::{BlockEntry, HeapCtx};
use crate::slab::Finalizer;

/// Alignment of large payloads and headers.
const LARGE_ALIGN: usize = 16;

/// Spans smaller than this are absorbed into the preceding object rather
/// than tracked.
const MIN_SPAN: usize = HEADER_SIZE + LARGE_ALIGN;

/// Header bytes preceding every large payload.
pub(crate) const HEADER_SIZE: usize =
    (std::mem::size_of::<LargeObjectHeader>() + LARGE_ALIGN - 1) & !(LARGE_ALIGN - 1);

/// Inline header before each large payload. Plain data only: headers are
/// written and invalidated with raw pointer stores.
#[repr(C)]
pub(crate) struct LargeObjectHeader {
    /// Index into the owning slab's header table.
    object_index: u32,
    /// Mark flag; large objects have no mark bitmap.
    marked: AtomicU8,
    /// Set when the marker ran out of scratch memory while scanning this
    /// object; it is revisited by the bounded rescan pass.
    oom_rescan: AtomicU8,
    attrs: AtomicU8,
    /// Requested payload bytes.
    payload_size: usize,
    /// Total bytes this record consumes (header + payload + absorbed
    /// slack); freeing restores exactly this many bytes.
    span_len: usize,
}

impl LargeObjectHeader {
    fn payload_addr(&self) -> usize {
        std::ptr::from_ref(self) as usize + HEADER_SIZE
    }

    fn attrs(&self) -> ObjectAttributes {
        ObjectAttributes::from_bits_truncate(self.attrs.load(Ordering::Relaxed))
    }

    /// Set the mark flag; true if newly marked.
    pub(crate) fn mark(&self) -> bool {
        self.marked.swap(1, Ordering::AcqRel) == 0
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Acquire) != 0
    }

    pub(crate) fn clear_mark(&self) {
        self.marked.store(0, Ordering::Release);
    }

    pub(crate) fn set_oom_rescan(&self) {
        self.oom_rescan.store(1, Ordering::Release);
    }

    pub(crate) fn take_oom_rescan(&self) -> bool {
        self.oom_rescan.swap(0, Ordering::AcqRel) != 0
    }

    pub(crate) fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub(crate) fn object_attrs(&self) -> ObjectAttributes {
        self.attrs()
    }
}

/// A page range holding a chain of large-object records.
pub(crate) struct LargeObjectSlab {
    base: usize,
    len: usize,
    headers: Vec<Option<NonNull<LargeObjectHeader>>>,
    live_count: usize,
    reservation: PageReservation,
}

impl LargeObjectSlab {
    fn new(reservation: PageReservation) -> Box<Self> {
        Box::new(Self {
            base: reservation.ptr() as usize,
            len: reservation.len(),
            headers: Vec::new(),
            live_count: 0,
            reservation,
        })
    }

    pub(crate) fn base_addr(&self) -> usize {
        self.base
    }

    pub(crate) fn page_count(&self) -> usize {
        self.reservation.page_count()
    }

    pub(crate) fn reserved_bytes(&self) -> usize {
        self.len
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len
    }

    /// Resolve an address (payload start or interior) to the live header
    /// whose payload contains it. Linear over the header table; large slabs
    /// hold few objects.
    pub(crate) fn find_header(&self, addr: usize) -> Option<&LargeObjectHeader> {
        if !self.contains(addr) {
            return None;
        }
        self.headers.iter().flatten().find_map(|h| {
            // SAFETY: live headers point into this slab's reservation.
            let header = unsafe { h.as_ref() };
            let payload = header.payload_addr();
            (addr >= payload && addr < payload + header.payload_size).then_some(header)
        })
    }

    /// Invoke `callback` for every live payload.
    pub(crate) fn enumerate_live(
        &self,
        callback: &mut dyn FnMut(NonNull<u8>, usize, ObjectAttributes),
    ) {
        for h in self.headers.iter().flatten() {
            // SAFETY: live headers point into this slab's reservation.
            let header = unsafe { h.as_ref() };
            let payload = header.payload_addr() as *mut u8;
            // SAFETY: payload addresses are interior to the reservation.
            callback(
                unsafe { NonNull::new_unchecked(payload) },
                header.payload_size,
                header.attrs(),
            );
        }
    }

    /// Invoke `f` with `(payload_addr, size)` for every marked record.
    /// Used by the dirty-card rescan.
    pub(crate) fn for_each_marked(&self, f: &mut dyn FnMut(usize, usize)) {
        for h in self.headers.iter().flatten() {
            // SAFETY: live headers point into this slab's reservation.
            let header = unsafe { h.as_ref() };
            if header.is_marked() {
                f(header.payload_addr(), header.payload_size);
            }
        }
    }

    fn is_unused(&self) -> bool {
        self.live_count == 0
    }

    /// Drop freed entries once they dominate the table, rewriting the
    /// surviving headers' indices.
    fn maybe_compact(&mut self) {
        if self.headers.len() >= 32 && self.live_count * 2 < self.headers.len() {
            self.headers.retain(Option::is_some);
            for (i, h) in self.headers.iter().enumerate() {
                if let Some(h) = h {
                    // SAFETY: live header owned by this slab.
                    #[allow(clippy::cast_possible_truncation)]
                    unsafe {
                        (*h.as_ptr()).object_index = i as u32;
                    }
                }
            }
        }
    }
}

/// A contiguous run of free bytes inside one large slab.
#[derive(Debug, Clone, Copy)]
struct FreeSpan {
    addr: usize,
    len: usize,
    slab: NonNull<LargeObjectSlab>,
}

/// Pool of all large-object slabs plus the shared free-span list.
pub(crate) struct LargeObjectPool {
    slabs: Vec<Box<LargeObjectSlab>>,
    /// Sorted by address; spans never cross slab boundaries.
    free_spans: Vec<FreeSpan>,
    free_bytes: usize,
    /// Dead finalizable records awaiting dispose.
    pending_dispose: Vec<NonNull<LargeObjectHeader>>,
    finalizers: HashMap<usize, Finalizer>,
}

impl LargeObjectPool {
    pub fn new() -> Self {
        Self {
            slabs: Vec::new(),
            free_spans: Vec::new(),
            free_bytes: 0,
            pending_dispose: Vec::new(),
            finalizers: HashMap::new(),
        }
    }

    /// Exact free bytes currently tracked on the span list.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Allocate `size` payload bytes.
    pub fn alloc(
        &mut self,
        size: usize,
        attrs: ObjectAttributes,
        mark_new: bool,
        ctx: &mut HeapCtx<'_>,
    ) -> Result<NonNull<u8>> {
        let payload = size
            .checked_add(LARGE_ALIGN - 1)
            .map(|s| s & !(LARGE_ALIGN - 1))
            .ok_or(CollectorError::SizeOverflow { size })?;
        let total = payload
            .checked_add(HEADER_SIZE)
            .ok_or(CollectorError::SizeOverflow { size })?;

        // First fit over the span list.
        if let Some(pos) = self.free_spans.iter().position(|s| s.len >= total) {
            let span = self.free_spans.remove(pos);
            self.free_bytes -= span.len;
            let span_len = if span.len - total >= MIN_SPAN {
                self.insert_span(FreeSpan {
                    addr: span.addr + total,
                    len: span.len - total,
                    slab: span.slab,
                });
                total
            } else {
                span.len
            };
            let ptr = self.write_record(span.slab, span.addr, span_len, size, attrs, mark_new);
            ctx.usage.on_alloc(span_len);
            return Ok(ptr);
        }

        // New slab sized to the next page multiple.
        let page_size = page_source::page_size();
        let pages = total
            .checked_add(page_size - 1)
            .ok_or(CollectorError::SizeOverflow { size })?
            / page_size;
        let reservation = ctx.reserve_pages(pages)?;
        let mut slab = LargeObjectSlab::new(reservation);
        let slab_ptr = NonNull::from(slab.as_mut());
        ctx.index
            .insert_range(slab.base, slab.page_count(), BlockEntry::Large(slab_ptr));
        ctx.barrier.on_region_reserved(slab.base, slab.page_count());

        let tail = slab.len - total;
        let span_len = if tail >= MIN_SPAN {
            self.insert_span(FreeSpan {
                addr: slab.base + total,
                len: tail,
                slab: slab_ptr,
            });
            total
        } else {
            slab.len
        };
        let base = slab.base;
        self.slabs.push(slab);
        let ptr = self.write_record(slab_ptr, base, span_len, size, attrs, mark_new);
        ctx.usage.on_alloc(span_len);
        Ok(ptr)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_record(
        &mut self,
        mut slab: NonNull<LargeObjectSlab>,
        addr: usize,
        span_len: usize,
        payload_size: usize,
        attrs: ObjectAttributes,
        mark_new: bool,
    ) -> NonNull<u8> {
        // SAFETY: the span belongs to this slab and is unused; the pool is
        // single-writer for slab tables.
        let slab = unsafe { slab.as_mut() };
        debug_assert!(addr >= slab.base && addr + span_len <= slab.base + slab.len);
        let header_ptr = addr as *mut LargeObjectHeader;
        let object_index = slab.headers.len() as u32;
        // SAFETY: addr is LARGE_ALIGN-aligned (all spans are) and committed.
        unsafe {
            header_ptr.write(LargeObjectHeader {
                object_index,
                marked: AtomicU8::new(u8::from(mark_new)),
                oom_rescan: AtomicU8::new(0),
                attrs: AtomicU8::new(attrs.bits()),
                payload_size,
                span_len,
            });
        }
        // SAFETY: header_ptr came from a non-null span address.
        let header = unsafe { NonNull::new_unchecked(header_ptr) };
        slab.headers.push(Some(header));
        slab.live_count += 1;
        // SAFETY: payload starts inside the span.
        unsafe { NonNull::new_unchecked((addr + HEADER_SIZE) as *mut u8) }
    }

    /// Explicitly release a large object. `ptr` must be the exact payload
    /// start. A registered finalizer runs now (exactly once).
    pub fn free(&mut self, ptr: NonNull<u8>, ctx: &mut HeapCtx<'_>) -> Result<usize> {
        let addr = ptr.as_ptr() as usize;
        let Some(BlockEntry::Large(slab_ptr)) = ctx.index.lookup(addr) else {
            return Err(CollectorError::UnknownObject { addr });
        };
        // SAFETY: the index only holds live slabs; single mutator thread.
        let slab = unsafe { &mut *slab_ptr.as_ptr() };
        let header = slab
            .find_header(addr)
            .filter(|h| h.payload_addr() == addr)
            .map(NonNull::from)
            .ok_or(CollectorError::UnknownObject { addr })?;

        if let Some(f) = self.finalizers.remove(&addr) {
            let _ = catch_unwind(AssertUnwindSafe(move || f(ptr.as_ptr())));
        }
        let released = self.reclaim_record(slab_ptr, header);
        ctx.usage.on_reclaim(released);
        Ok(released)
    }

    /// Install a finalizer on a live finalizable payload.
    pub fn set_finalizer(
        &mut self,
        addr: usize,
        header: &LargeObjectHeader,
        finalizer: Finalizer,
    ) -> Result<()> {
        if !header.attrs().is_finalizable() {
            return Err(CollectorError::NotFinalizable { addr });
        }
        self.finalizers.insert(addr, finalizer);
        Ok(())
    }

    /// Invalidate a record and merge its span back into the free list.
    /// Returns the bytes released.
    fn reclaim_record(
        &mut self,
        slab_ptr: NonNull<LargeObjectSlab>,
        header: NonNull<LargeObjectHeader>,
    ) -> usize {
        // SAFETY: callers hand us a live header of this slab; exclusive
        // access during sweep/free.
        let slab = unsafe { &mut *slab_ptr.as_ptr() };
        let (index, addr, span_len) = {
            let h = unsafe { header.as_ref() };
            (
                h.object_index as usize,
                std::ptr::from_ref(h) as usize,
                h.span_len,
            )
        };
        heap_verify!(
            slab.headers.get(index).is_some_and(|e| *e == Some(header)),
            "large object header table out of sync"
        );
        slab.headers[index] = None;
        slab.live_count -= 1;
        slab.maybe_compact();
        self.insert_span(FreeSpan {
            addr,
            len: span_len,
            slab: slab_ptr,
        });
        self.free_bytes += span_len;
        span_len
    }

    /// Insert a span, coalescing with address-adjacent neighbors in the
    /// same slab.
    fn insert_span(&mut self, span: FreeSpan) {
        let pos = self
            .free_spans
            .partition_point(|s| s.addr < span.addr);
        let mut span = span;

        // Coalesce with the following span.
        if pos < self.free_spans.len() {
            let next = self.free_spans[pos];
            if span.addr + span.len == next.addr && span.slab == next.slab {
                span.len += next.len;
                self.free_spans.remove(pos);
            }
        }
        // Coalesce with the preceding span.
        if pos > 0 {
            let prev = self.free_spans[pos - 1];
            if prev.addr + prev.len == span.addr && prev.slab == span.slab {
                self.free_spans[pos - 1].len += span.len;
                return;
            }
        }
        self.free_spans.insert(pos, span);
    }

    /// Clear marks and rescan flags on every live record. Idempotent.
    pub fn reset_marks(&self) {
        for slab in &self.slabs {
            for h in slab.headers.iter().flatten() {
                // SAFETY: live header of an owned slab.
                let header = unsafe { h.as_ref() };
                header.clear_mark();
                header.oom_rescan.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Reclaim every unmarked record; dead finalizable records chain onto
    /// the pending-dispose list instead. Returns objects reclaimed.
    pub fn sweep_all(&mut self, ctx: &mut HeapCtx<'_>) -> usize {
        let mut reclaimed = 0;
        let slab_ptrs: Vec<NonNull<LargeObjectSlab>> = self
            .slabs
            .iter_mut()
            .map(|s| NonNull::from(s.as_mut()))
            .collect();

        for slab_ptr in slab_ptrs {
            // SAFETY: pool owns its slabs; single-writer during sweep.
            let headers: Vec<NonNull<LargeObjectHeader>> = unsafe {
                slab_ptr
                    .as_ref()
                    .headers
                    .iter()
                    .flatten()
                    .copied()
                    .collect()
            };
            for header in headers {
                // SAFETY: header live at collection time; nothing else
                // mutates it during sweep.
                let h = unsafe { header.as_ref() };
                if h.is_marked() {
                    h.clear_mark();
                    continue;
                }
                let addr = h.payload_addr();
                if h.attrs().is_finalizable() && self.finalizers.contains_key(&addr) {
                    if !h.attrs().is_pending_dispose() {
                        h.attrs.fetch_or(
                            ObjectAttributes::PENDING_DISPOSE.bits(),
                            Ordering::Relaxed,
                        );
                        self.pending_dispose.push(header);
                    }
                    continue;
                }
                let released = self.reclaim_record(slab_ptr, header);
                ctx.usage.on_reclaim(released);
                reclaimed += 1;
            }
        }

        self.release_unused_slabs(ctx);
        reclaimed
    }

    /// Run finalizers queued by the last sweep and reclaim their records.
    pub fn flush_pending_disposes(&mut self, ctx: &mut HeapCtx<'_>) -> usize {
        let pending = std::mem::take(&mut self.pending_dispose);
        let disposed = pending.len();
        for header in pending {
            // SAFETY: pending headers stay live until this point; dispose
            // is the only consumer.
            let addr = unsafe { header.as_ref() }.payload_addr();
            if let Some(f) = self.finalizers.remove(&addr) {
                let obj = addr as *mut u8;
                let _ = catch_unwind(AssertUnwindSafe(move || f(obj)));
            }
            let slab_ptr = self.owning_slab(addr);
            let released = self.reclaim_record(slab_ptr, header);
            ctx.usage.on_reclaim(released);
        }
        if disposed > 0 {
            self.release_unused_slabs(ctx);
        }
        disposed
    }

    fn owning_slab(&mut self, addr: usize) -> NonNull<LargeObjectSlab> {
        for slab in &mut self.slabs {
            if slab.contains(addr) {
                return NonNull::from(slab.as_mut());
            }
        }
        crate::error::fatal::invariant_violation("large object address lost its slab");
    }

    fn release_unused_slabs(&mut self, ctx: &mut HeapCtx<'_>) {
        let mut i = 0;
        while i < self.slabs.len() {
            if self.slabs[i].is_unused() {
                let slab = self.slabs.remove(i);
                let base = slab.base;
                let len = slab.len;
                let mut removed = 0;
                self.free_spans.retain(|s| {
                    let inside = s.addr >= base && s.addr < base + len;
                    if inside {
                        removed += s.len;
                    }
                    !inside
                });
                self.free_bytes -= removed;
                ctx.index.remove_range(base, slab.page_count());
                ctx.barrier.on_region_released(base, slab.page_count());
                ctx.usage.on_released(len);
                ctx.notify_free(len);
            } else {
                i += 1;
            }
        }
    }

    /// Resolve a conservative candidate to `(payload, size, header)`.
    pub fn enumerate(&self, callback: &mut dyn FnMut(NonNull<u8>, usize, ObjectAttributes)) {
        for slab in &self.slabs {
            slab.enumerate_live(callback);
        }
    }

    /// Headers flagged for the bounded OOM rescan pass.
    pub fn take_oom_rescan_headers(&self) -> Vec<NonNull<LargeObjectHeader>> {
        let mut out = Vec::new();
        for slab in &self.slabs {
            for h in slab.headers.iter().flatten() {
                // SAFETY: live header of an owned slab.
                if unsafe { h.as_ref() }.take_oom_rescan() {
                    out.push(*h);
                }
            }
        }
        out
    }

    /// Run remaining finalizers at collector teardown.
    pub fn dispose_all_for_teardown(&mut self) {
        let finalizers = std::mem::take(&mut self.finalizers);
        for (addr, f) in finalizers {
            let obj = addr as *mut u8;
            let _ = catch_unwind(AssertUnwindSafe(move || f(obj)));
        }
    }
}
