#![allow(dead_code)] // each test binary uses a subset of these helpers

//! Shared fixtures for the integration tests.
//!
//! Every rseq-dependent test calls [`rseq_ready`] first and skips (with a
//! note) when the kernel lacks rseq or rseq fences, so the suite passes on
//! any machine. Tests that need CPU stability pin themselves with
//! `sched_setaffinity`.

use core::ptr::NonNull;

use percpu_slab::{PerCpuSlab, RseqLocal, platform};

std::thread_local! {
    pub static RSEQ: RseqLocal = RseqLocal::new();
}

/// A slab over a fresh page-aligned region covering every configured CPU.
/// Region and metadata are leaked; each test builds its own fixture.
pub struct Fixture {
    pub slab: &'static PerCpuSlab,
    pub region: *mut u8,
    pub num_cpus: usize,
}

impl Fixture {
    pub fn new(num_classes: usize, shift: u8, capacity: fn(usize) -> usize) -> Self {
        let num_cpus = platform::num_cpus();
        let region = unsafe { platform::page_alloc(num_cpus << shift) };
        assert!(!region.is_null(), "mmap failed");
        let slab: &'static mut PerCpuSlab = Box::leak(Box::new(PerCpuSlab::new()));
        unsafe {
            slab.init(num_classes, num_cpus, meta_alloc, region, capacity, shift);
        }
        Self { slab, region, num_cpus }
    }
}

pub fn meta_alloc(size: usize, align: usize) -> *mut u8 {
    unsafe { std::alloc::alloc_zeroed(std::alloc::Layout::from_size_align(size, align).unwrap()) }
}

/// True when the fast paths can actually run here.
pub fn rseq_ready() -> bool {
    percpu_slab::is_fast() && RSEQ.with(|t| t.rseq_ptr().is_some())
}

/// Pin the calling thread to one CPU. Returns false if the CPU is offline
/// or the affinity call is refused.
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu: usize) -> bool {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(_cpu: usize) -> bool {
    false
}

pub fn nn(val: usize) -> NonNull<u8> {
    NonNull::new(val as *mut u8).expect("test values are nonzero")
}

/// Push with cache-priming retries. `Ok(())` on success, `Err(full)` where
/// `full` distinguishes a genuine overflow from an unusable cache. A miss
/// with a warm cache is only an overflow if the header really is full —
/// otherwise it was an aborted sequence and the push is retried.
pub fn push_retry(slab: &PerCpuSlab, t: &RseqLocal, class: usize, val: usize) -> Result<(), bool> {
    for _ in 0..1000 {
        if slab.push(t, class, nn(val)) {
            return Ok(());
        }
        match slab.cache_cpu_slab(t) {
            (Some(_), true) => continue, // cache was cold; retry
            (Some(cpu), false) => {
                if slab.length(cpu, class) >= slab.capacity(cpu, class) {
                    return Err(true);
                }
            }
            (None, _) => return Err(false),
        }
    }
    Err(false)
}

/// Pop with cache-priming retries; `None` means genuinely empty (confirmed
/// by header inspection, so an aborted sequence is retried instead).
pub fn pop_retry(slab: &PerCpuSlab, t: &RseqLocal, class: usize) -> Option<usize> {
    for _ in 0..1000 {
        if let Some(p) = slab.pop(t, class) {
            return Some(p.as_ptr() as usize);
        }
        match slab.cache_cpu_slab(t) {
            (Some(_), true) => {}
            (Some(cpu), false) => {
                if slab.length(cpu, class) == 0 {
                    return None;
                }
            }
            (None, _) => return None,
        }
    }
    None
}

/// Grow the current CPU's class, retrying across migrations.
pub fn grow_retry(
    slab: &PerCpuSlab,
    t: &RseqLocal,
    class: usize,
    len: usize,
    max: impl Fn(u8) -> usize,
) -> usize {
    for _ in 0..1000 {
        let (Some(cpu), _) = slab.cache_cpu_slab(t) else {
            return 0;
        };
        let n = slab.grow(t, cpu, class, len, &max);
        if n > 0 {
            return n;
        }
        // 0 is also the answer when the class is already at max capacity.
        if slab.capacity(cpu, class) >= max(slab.shift()) {
            return 0;
        }
    }
    0
}
