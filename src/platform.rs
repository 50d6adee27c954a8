//! OS interface: virtual memory for slab regions, CPU topology, residency.
//!
//! Everything the slab needs from the OS besides rseq itself: page-aligned
//! anonymous memory for regions (`page_alloc`/`page_dealloc`), returning a
//! retired region's pages (`page_decommit`), the CPU count for
//! provisioning, and the `mincore` probe behind `MetadataMemoryUsage`.

#[cfg(unix)]
mod unix;

/// Allocate `size` bytes of zero-initialized, page-aligned virtual memory.
/// Returns null on failure.
///
/// # Safety
/// Caller must eventually call `page_dealloc` with the returned pointer and
/// the same `size`.
#[inline]
pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    #[cfg(unix)]
    {
        unsafe { unix::page_alloc(size) }
    }
    #[cfg(not(unix))]
    {
        let _ = size;
        core::ptr::null_mut()
    }
}

/// Free virtual memory previously allocated by `page_alloc`.
///
/// # Safety
/// `ptr` must have been returned by `page_alloc`, and `size` must match
/// the original allocation size.
#[inline]
pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    #[cfg(unix)]
    unsafe {
        unix::page_dealloc(ptr, size)
    };
    #[cfg(not(unix))]
    {
        let _ = (ptr, size);
    }
}

/// Return physical pages to the OS while keeping the virtual range mapped.
/// Reads after this see zeroes; the range stays safely addressable, which
/// is what a retired slab region needs.
///
/// # Safety
/// `ptr` and `size` must refer to a range within a live `page_alloc`
/// allocation.
#[inline]
pub unsafe fn page_decommit(ptr: *mut u8, size: usize) {
    #[cfg(unix)]
    unsafe {
        unix::page_decommit(ptr, size)
    };
    #[cfg(not(unix))]
    {
        let _ = (ptr, size);
    }
}

/// Number of configured CPUs, for provisioning the slab region.
#[inline]
pub fn num_cpus() -> usize {
    #[cfg(unix)]
    {
        unix::num_cpus()
    }
    #[cfg(not(unix))]
    {
        1
    }
}

/// OS-resident bytes within `[ptr, ptr + len)`, probed page by page.
/// Returns 0 if the probe is unsupported or fails.
///
/// # Safety
/// The range must be part of a live mapping.
#[inline]
pub unsafe fn resident_size(ptr: *mut u8, len: usize) -> usize {
    #[cfg(unix)]
    {
        unsafe { unix::resident_size(ptr, len) }
    }
    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
        0
    }
}
