//! Unix implementation: mmap/munmap/madvise/mincore/sysconf via raw externs.

use core::ffi::c_void;

use crate::PAGE_ALIGN;

const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
const MAP_ANONYMOUS: i32 = 0x20;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;
const MADV_DONTNEED: i32 = 4;

/// `_SC_NPROCESSORS_CONF` on Linux x86_64.
const SC_NPROCESSORS_CONF: i32 = 83;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;

    fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;

    fn mincore(addr: *mut c_void, length: usize, vec: *mut u8) -> i32;

    fn sysconf(name: i32) -> isize;
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let ptr = unsafe {
        mmap(
            core::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        core::ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}

pub unsafe fn page_decommit(ptr: *mut u8, size: usize) {
    unsafe { madvise(ptr as *mut c_void, size, MADV_DONTNEED) };
}

pub fn num_cpus() -> usize {
    let n = unsafe { sysconf(SC_NPROCESSORS_CONF) };
    if n <= 0 { 1 } else { n as usize }
}

/// Chunked mincore walk with a fixed stack buffer, so the probe needs no
/// allocation (it may run under an allocator).
pub unsafe fn resident_size(ptr: *mut u8, len: usize) -> usize {
    const CHUNK_PAGES: usize = 256;
    let mut vec = [0u8; CHUNK_PAGES];
    let mut resident = 0usize;
    let mut off = 0usize;
    while off < len {
        let chunk = (len - off).min(CHUNK_PAGES * PAGE_ALIGN);
        let pages = chunk.div_ceil(PAGE_ALIGN);
        let ret = unsafe { mincore(ptr.add(off) as *mut c_void, chunk, vec.as_mut_ptr()) };
        if ret != 0 {
            return 0;
        }
        resident += vec[..pages].iter().filter(|&&v| v & 1 != 0).count() * PAGE_ALIGN;
        off += chunk;
    }
    resident
}
