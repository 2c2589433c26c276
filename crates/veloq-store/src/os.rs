//! Page-level hints for mapped regions.
//!
//! All calls here are advisory: the segment keeps working when the kernel
//! refuses (`RLIMIT_MEMLOCK`, unsupported platform), so callers log failures
//! and move on.

use std::io;

/// Pin the region into physical memory.
#[cfg(unix)]
pub fn lock_memory(ptr: *const u8, len: usize) -> io::Result<()> {
    // The kernel validates the range; a stale pointer surfaces as EINVAL/ENOMEM.
    let ret = unsafe { libc::mlock(ptr as *const libc::c_void, len) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Release a previous `lock_memory` pin.
#[cfg(unix)]
pub fn unlock_memory(ptr: *const u8, len: usize) -> io::Result<()> {
    let ret = unsafe { libc::munlock(ptr as *const libc::c_void, len) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Tell the kernel the region will be accessed soon, prompting read-ahead.
#[cfg(unix)]
pub fn advise_willneed(ptr: *const u8, len: usize) -> io::Result<()> {
    let ret = unsafe { libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_WILLNEED) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn lock_memory(_ptr: *const u8, _len: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub fn unlock_memory(_ptr: *const u8, _len: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub fn advise_willneed(_ptr: *const u8, _len: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn advise_on_heap_page() {
        // madvise wants page alignment; ask for an aligned block.
        let layout = std::alloc::Layout::from_size_align(4096, 4096).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let result = advise_willneed(ptr, 4096);
        unsafe { std::alloc::dealloc(ptr, layout) };
        assert!(result.is_ok());
    }
}
