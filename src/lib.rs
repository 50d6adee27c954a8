#![no_std]

//! percpu-slab: bounded per-CPU LIFO pointer caches over Linux restartable
//! sequences.
//!
//! The core of a per-CPU allocator cache: one slab of opaque pointers per
//! (cpu, size class), with push/pop fast paths that run as interruptible
//! critical sections — no locks and no atomic read-modify-writes, restarted
//! by the kernel if the thread migrates mid-sequence. Maintenance
//! (capacity transfer between CPUs, draining, resizing the whole region)
//! synchronizes with the fast paths through a stop/fence protocol instead
//! of blocking them.
//!
//! The slab owns no memory and no policy: the region, the metadata arrays,
//! per-class capacities, and the destinations of drained pointers are all
//! injected as callbacks, so the crate can sit underneath an allocator's
//! central freelist the way a thread cache would.
//!
//! # Usage
//!
//! ```ignore
//! static SLAB: PerCpuSlab = ...; // init once with a mmap'd region
//!
//! std::thread_local! {
//!     static RSEQ: rseq::RseqLocal = rseq::RseqLocal::new();
//! }
//!
//! RSEQ.with(|t| {
//!     if !SLAB.push(t, class, ptr) {
//!         match SLAB.cache_cpu_slab(t) {
//!             (Some(cpu), true) => { /* retry — the cache was cold */ }
//!             (Some(cpu), false) => { /* genuinely full: grow or spill */ }
//!             (None, _) => { /* fall back to the central freelist */ }
//!         }
//!     }
//! });
//! ```
//!
//! Requires Linux x86_64; on kernels without rseq or rseq fences the slab
//! degrades to a permanent-miss cache (every push fails, every pop returns
//! `None`) and callers route around it.

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod defaults;
mod header;
mod macros;
pub mod platform;
pub mod slab;
#[cfg(feature = "stats")]
pub mod stats;

// Re-export the slab and the per-thread handle at crate root.
pub use rseq::{CACHED_BIT, RseqLocal, is_fast};
pub use slab::{MAX_SHIFT, MIN_SHIFT, MetadataUsage, PAGE_ALIGN, PerCpuSlab};
