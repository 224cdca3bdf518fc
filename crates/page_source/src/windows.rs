use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` addresses must be aligned to this value
/// (typically 64KB), which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct ReservationInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl ReservationInner {
    pub fn reserve(hint_addr: usize, len: usize, commit: bool) -> io::Result<ReservationInner> {
        let addr = if hint_addr == 0 {
            ptr::null()
        } else {
            hint_addr as *const std::ffi::c_void
        };

        let (alloc_type, protect) = if commit {
            (MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
        } else {
            (MEM_RESERVE, PAGE_NOACCESS)
        };

        let mut ptr = unsafe { VirtualAlloc(addr, len, alloc_type, protect) };

        // If strict allocation at hint_addr failed, let the OS decide.
        if ptr.is_null() && !addr.is_null() {
            ptr = unsafe { VirtualAlloc(ptr::null(), len, alloc_type, protect) };
        }

        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(ReservationInner { ptr, len })
    }

    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let start = unsafe { self.ptr.cast::<u8>().add(offset) };
        let ptr = unsafe { VirtualAlloc(start.cast(), len, MEM_COMMIT, PAGE_READWRITE) };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let start = unsafe { self.ptr.cast::<u8>().add(offset) };
        let ok = unsafe { VirtualFree(start.cast(), len, MEM_DECOMMIT) };
        if ok == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
