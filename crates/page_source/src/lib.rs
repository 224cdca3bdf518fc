//! Page-granular virtual memory for the collector.
//!
//! The collector consumes the OS through exactly four verbs: reserve a
//! page-aligned region, commit pages inside it, decommit pages inside it,
//! and release the whole region. [`PageReservation`] is the RAII handle for
//! one such region; [`PageSource`] is the narrow trait the collector holds so
//! tests can substitute a failing source for exhaustion paths.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, it equals the page size.
/// Reservation hint addresses should be aligned to this granularity.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A page-aligned reserved region of virtual memory.
///
/// The region is released back to the OS when this handle is dropped.
pub struct PageReservation {
    inner: os::ReservationInner,
}

impl PageReservation {
    /// Returns a pointer to the start of the region (page-aligned).
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the region in bytes (a page multiple).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the region has zero length. Reservations are never
    /// constructed empty, so this is always false; provided for API symmetry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Number of pages in the region.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.inner.len() / page_size()
    }

    /// Commit a page-aligned subrange, making it readable and writable.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not page-aligned, exceeds the
    /// reservation, or the OS refuses the commit (out of commit charge).
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        self.inner.commit(offset, len)
    }

    /// Decommit a page-aligned subrange, returning its backing store to the
    /// OS. The address range stays reserved; the contents are lost.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not page-aligned or exceeds the
    /// reservation.
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        self.inner.decommit(offset, len)
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let ps = page_size();
        if offset % ps != 0 || len % ps != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range must be page-aligned",
            ));
        }
        let end = offset
            .checked_add(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "range overflows"))?;
        if end > self.inner.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range exceeds reservation",
            ));
        }
        Ok(())
    }
}

// SAFETY: the reservation owns its region exclusively; the raw pointer it
// yields carries no aliasing on its own.
unsafe impl Send for PageReservation {}
unsafe impl Sync for PageReservation {}

/// Configuration for reserving a region.
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    pages: usize,
    hint_addr: usize,
    commit: bool,
}

impl ReserveOptions {
    /// Creates options for a reservation of `pages` pages.
    #[must_use]
    pub const fn new(pages: usize) -> Self {
        Self {
            pages,
            hint_addr: 0,
            commit: true,
        }
    }

    /// Sets a hint address for the reservation.
    ///
    /// The OS is not required to honor the hint. For the best chance of
    /// success the address should be aligned to `allocation_granularity()`
    /// and the range `[hint, hint + pages * page_size())` should be free.
    #[must_use]
    pub const fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Sets whether the whole region is committed up front (the default).
    /// Reserve-only regions must be committed with
    /// [`PageReservation::commit`] before use.
    #[must_use]
    pub const fn commit_on_reserve(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    /// Reserve the region.
    ///
    /// # Errors
    ///
    /// Returns an error if `pages` is zero, the byte length overflows, or
    /// the OS cannot satisfy the reservation.
    pub fn reserve(&self) -> io::Result<PageReservation> {
        let len = self
            .pages
            .checked_mul(page_size())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "page count overflows"))?;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "page count must be greater than 0",
            ));
        }
        let inner = os::ReservationInner::reserve(self.hint_addr, len, self.commit)?;
        Ok(PageReservation { inner })
    }
}

/// The narrow interface the collector holds onto.
///
/// One implementor talks to the OS; test implementors inject failure.
pub trait PageSource: Send + Sync {
    /// Reserve `pages` committed pages.
    ///
    /// # Errors
    ///
    /// Returns an error when the source cannot provide the pages; the
    /// caller treats this as resource exhaustion, not a fault.
    fn reserve(&self, pages: usize) -> io::Result<PageReservation>;
}

/// The production page source: asks the OS directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPageSource;

impl PageSource for SystemPageSource {
    fn reserve(&self, pages: usize) -> io::Result<PageReservation> {
        ReserveOptions::new(pages).reserve()
    }
}

/// A page source that starts failing after a set number of reservations.
///
/// Used by collector tests to exercise the out-of-memory recovery paths
/// without actually exhausting the machine.
#[cfg(feature = "test-util")]
pub struct FailingPageSource {
    remaining: std::sync::atomic::AtomicUsize,
}

#[cfg(feature = "test-util")]
impl FailingPageSource {
    /// Allow `successes` reservations, then fail every subsequent request.
    #[must_use]
    pub const fn new(successes: usize) -> Self {
        Self {
            remaining: std::sync::atomic::AtomicUsize::new(successes),
        }
    }

    /// Grant `n` additional reservations.
    pub fn refill(&self, n: usize) {
        self.remaining
            .fetch_add(n, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(feature = "test-util")]
impl PageSource for FailingPageSource {
    fn reserve(&self, pages: usize) -> io::Result<PageReservation> {
        let granted = self
            .remaining
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok();
        if granted {
            ReserveOptions::new(pages).reserve()
        } else {
            Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "page source exhausted",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_reserve_committed() {
        let res = ReserveOptions::new(2).reserve().expect("failed to reserve");
        assert_eq!(res.len(), 2 * page_size());
        assert_eq!(res.page_count(), 2);

        let ptr = res.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_reserve_then_commit() {
        let res = ReserveOptions::new(4)
            .commit_on_reserve(false)
            .reserve()
            .expect("failed to reserve");

        res.commit(0, page_size()).expect("commit failed");
        res.commit(page_size(), 2 * page_size()).expect("commit failed");

        unsafe {
            let p = res.ptr().add(page_size());
            ptr::write_volatile(p, 7);
            assert_eq!(ptr::read_volatile(p), 7);
        }
    }

    #[test]
    fn test_decommit_keeps_reservation() {
        let res = ReserveOptions::new(1).reserve().expect("failed to reserve");
        unsafe {
            ptr::write_volatile(res.ptr(), 1);
        }
        res.decommit(0, page_size()).expect("decommit failed");
        res.commit(0, page_size()).expect("recommit failed");
        unsafe {
            // Decommitted then recommitted pages read back as zero.
            assert_eq!(ptr::read_volatile(res.ptr()), 0);
        }
    }

    #[test]
    fn test_range_validation() {
        let res = ReserveOptions::new(1).reserve().expect("failed to reserve");
        assert!(res.commit(1, 16).is_err());
        assert!(res.commit(0, 2 * page_size()).is_err());
        assert!(res.decommit(page_size(), page_size()).is_err());
    }

    #[test]
    fn test_zero_pages_rejected() {
        assert!(ReserveOptions::new(0).reserve().is_err());
    }

    #[cfg(feature = "test-util")]
    #[test]
    fn test_failing_source() {
        let src = FailingPageSource::new(1);
        assert!(src.reserve(1).is_ok());
        assert!(src.reserve(1).is_err());
        src.refill(1);
        assert!(src.reserve(1).is_ok());
    }
}
