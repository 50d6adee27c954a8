//! Example: the slab as the fast tier of an allocator cache.
//!
//! The classic per-CPU allocator shape:
//!
//! ```text
//!   alloc()                          free(ptr)
//!     |                                |
//!     v                                v
//!  [per-CPU slab: pop]           [per-CPU slab: push]
//!     |                                |
//!     | empty?                         | full?
//!     v                                v
//!  [grow / refill from central]   [grow, or drain batch to central]
//! ```
//!
//! The slab never owns memory or policy: the central freelist here stands in
//! for a transfer cache, and all flow between tiers goes through the
//! miss-then-prime protocol (`push`/`pop` fail, `cache_cpu_slab` says
//! whether the miss was a cold cache or a real overflow/underflow).
//!
//! Run with:
//!   cargo run --features nightly --example percpu_cache
//!
//! (Linux x86_64; kernel >= 5.10 for rseq fences.)

use std::ptr::NonNull;
use std::sync::Mutex;

use percpu_slab::defaults::{CAPACITIES, DEFAULT_SHIFT, NUM_CLASSES};
use percpu_slab::{PerCpuSlab, RseqLocal, platform};

/// Object size per class for the demo; class 0 is reserved.
fn class_size(class: usize) -> usize {
    64 << (class % 4)
}

fn class_cap(class: usize) -> usize {
    usize::from(CAPACITIES[class])
}

/// How many objects move between the slab and central at once.
const BATCH: usize = 16;

std::thread_local! {
    static RSEQ: RseqLocal = RseqLocal::new();
}

// ── Central freelist (the slow path) ────────────────────────────────────────

/// Mutex-protected freelists, one per class. In a real allocator this is
/// the transfer cache in front of spans and the page heap.
struct Central {
    lists: Vec<Mutex<Vec<*mut u8>>>,
}

unsafe impl Sync for Central {}

impl Central {
    fn new() -> Self {
        Self {
            lists: (0..NUM_CLASSES).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Grab up to `count` blocks, allocating fresh ones if the list runs dry.
    fn take(&self, class: usize, out: &mut Vec<*mut u8>, count: usize) {
        let mut list = self.lists[class].lock().unwrap();
        for _ in 0..count.min(list.len()) {
            out.push(list.pop().unwrap());
        }
        let layout = std::alloc::Layout::from_size_align(class_size(class), 8).unwrap();
        while out.len() < count {
            let ptr = unsafe { std::alloc::alloc(layout) };
            assert!(!ptr.is_null(), "allocation failed");
            out.push(ptr);
        }
    }

    fn give(&self, class: usize, ptrs: &[*mut u8]) {
        self.lists[class].lock().unwrap().extend_from_slice(ptrs);
    }
}

// ── The per-CPU cache allocator ─────────────────────────────────────────────

struct Allocator {
    slab: PerCpuSlab,
    central: Central,
}

impl Allocator {
    /// Allocate one block of `class`. Fast path: slab pop.
    fn alloc(&self, class: usize) -> *mut u8 {
        RSEQ.with(|t| loop {
            if let Some(p) = self.slab.pop(t, class) {
                return p.as_ptr();
            }
            match self.slab.cache_cpu_slab(t) {
                (Some(cpu), true) => {
                    // Cache was cold; the retry may hit now.
                    let _ = cpu;
                }
                (Some(cpu), false) => {
                    // Genuinely empty: make room and refill from central.
                    self.slab.grow(t, cpu, class, BATCH, |_| class_cap(class));
                    let mut batch = Vec::with_capacity(BATCH);
                    self.central.take(class, &mut batch, BATCH);
                    let moved = self.slab.push_batch(t, class, &batch);
                    // Whatever didn't fit goes straight to the caller/central.
                    if moved < batch.len() {
                        let ret = batch[0];
                        self.central.give(class, &batch[1..batch.len() - moved]);
                        return ret;
                    }
                }
                (None, _) => {
                    // Fallback mode: serve from central directly.
                    let mut one = Vec::with_capacity(1);
                    self.central.take(class, &mut one, 1);
                    return one[0];
                }
            }
        })
    }

    /// Free one block back to `class`. Fast path: slab push.
    fn free(&self, class: usize, ptr: *mut u8) {
        let item = NonNull::new(ptr).expect("freeing a null pointer");
        RSEQ.with(|t| loop {
            if self.slab.push(t, class, item) {
                return;
            }
            match self.slab.cache_cpu_slab(t) {
                (Some(cpu), true) => {
                    let _ = cpu;
                }
                (Some(cpu), false) => {
                    // Full: try to widen, else spill a batch to central.
                    if self.slab.grow(t, cpu, class, BATCH, |_| class_cap(class)) > 0 {
                        continue;
                    }
                    let mut batch = [std::ptr::null_mut::<u8>(); BATCH];
                    let n = self.slab.pop_batch(t, class, &mut batch);
                    if n > 0 {
                        self.central.give(class, &batch[..n]);
                    } else {
                        self.central.give(class, &[ptr]);
                        return;
                    }
                }
                (None, _) => {
                    self.central.give(class, &[ptr]);
                    return;
                }
            }
        })
    }
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    println!("per-CPU slab cache demo");
    println!("=======================\n");

    match RSEQ.with(|t| t.cpu_id()) {
        Some(cpu) => println!("rseq active, cpu_id = {cpu}"),
        None => println!("rseq unavailable — running in permanent-miss fallback mode"),
    }
    if !percpu_slab::is_fast() {
        println!("(no rseq fence support; the slab will never cache)");
    }

    let num_cpus = platform::num_cpus();
    let region = unsafe { platform::page_alloc(num_cpus << DEFAULT_SHIFT) };
    assert!(!region.is_null(), "mmap failed");

    let mut slab = PerCpuSlab::new();
    unsafe {
        slab.init(
            NUM_CLASSES,
            num_cpus,
            |size, align| {
                std::alloc::alloc_zeroed(std::alloc::Layout::from_size_align(size, align).unwrap())
            },
            region,
            |class| usize::from(CAPACITIES[class]),
            DEFAULT_SHIFT,
        );
    }
    for cpu in 0..num_cpus {
        slab.init_cpu(cpu, |class| usize::from(CAPACITIES[class]));
    }
    println!("slab: {num_cpus} CPUs x {} KiB, {NUM_CLASSES} classes\n", (1 << DEFAULT_SHIFT) >> 10);

    let allocator = Allocator { slab, central: Central::new() };
    let allocator = &allocator;

    // A few threads doing alloc/free churn.
    std::thread::scope(|s| {
        for tid in 0..4 {
            s.spawn(move || {
                let mut live: Vec<(usize, *mut u8)> = Vec::new();
                for i in 0..50_000usize {
                    let class = 1 + (tid + i) % (NUM_CLASSES - 1);
                    live.push((class, allocator.alloc(class)));
                    if live.len() > 64 {
                        for _ in 0..32 {
                            let (class, ptr) = live.swap_remove((i * 7) % live.len());
                            allocator.free(class, ptr);
                        }
                    }
                }
                for (class, ptr) in live {
                    allocator.free(class, ptr);
                }
            });
        }
    });
    println!("churn done");

    // Drain every CPU back to central and show what was cached.
    let mut cached = 0usize;
    for cpu in 0..num_cpus {
        allocator.slab.drain(cpu, |_, class, batch, cap| {
            cached += batch.len();
            allocator.central.give(class, batch);
            let _ = cap;
        });
    }
    println!("drained {cached} cached objects back to central");

    let usage = allocator.slab.metadata_memory_usage();
    println!(
        "metadata: {} KiB virtual, {} KiB resident",
        usage.virtual_size >> 10,
        usage.resident_size >> 10
    );
}
