use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct ReservationInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl ReservationInner {
    /// Reserve `len` bytes; committed up front when `commit` is set,
    /// otherwise mapped `PROT_NONE` until committed page by page.
    pub fn reserve(hint_addr: usize, len: usize, commit: bool) -> io::Result<ReservationInner> {
        let addr = if hint_addr == 0 {
            ptr::null_mut()
        } else {
            hint_addr as *mut libc::c_void
        };

        let prot = if commit {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        };
        let no_reserve = if commit { 0 } else { MAP_NORESERVE };
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | no_reserve;

        let ptr = unsafe { libc::mmap(addr, len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(ReservationInner { ptr, len })
    }

    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let rc = unsafe {
            libc::mprotect(
                self.ptr.cast::<u8>().add(offset).cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let start = unsafe { self.ptr.cast::<u8>().add(offset) };
        // MADV_DONTNEED drops the backing store; PROT_NONE keeps stray
        // accesses from silently recommitting it.
        unsafe {
            if libc::madvise(start.cast(), len, libc::MADV_DONTNEED) != 0 {
                return Err(Error::last_os_error());
            }
            if libc::mprotect(start.cast(), len, libc::PROT_NONE) != 0 {
                return Err(Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
