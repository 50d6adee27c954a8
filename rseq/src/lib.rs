//! `rseq` — Linux restartable sequences for Rust.
//!
//! Zero-dependency, `no_std` wrapper around the Linux rseq(2) syscall,
//! providing the three primitives a per-CPU data structure needs:
//!
//! - the current CPU id, with per-thread state in [`RseqLocal`],
//! - restartable critical sections over a slab region ([`ops`]), gated on a
//!   per-thread cached slab word so the first fast-path instruction is a
//!   single bit test,
//! - cross-CPU fences that wait for every in-flight critical section to
//!   finish or abort ([`fence_cpu`], [`fence_all_cpus`]).
//!
//! # Features
//!
//! - `nightly` — enables `#[thread_local]` for the self-managed rseq area
//!   and weak-symbol glibc detection. Without this feature, only the raw
//!   ABI types, constants, syscall wrappers, and fences are functional;
//!   every critical section reports a miss.
//!
//! # Architecture support
//!
//! Currently x86_64 Linux only.

#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local, linkage))]

pub mod abi;
pub mod fence;
pub mod ops;
pub mod syscall;
pub mod thread;

// Re-export key types at crate root.
pub use abi::{RSEQ_SIG, Rseq, RseqCs};
pub use fence::{fence_all_cpus, fence_available, fence_cpu};
pub use thread::{CACHED_BIT, RseqLocal, current_cpu, current_rseq, rseq_available};

/// Whether the per-CPU fast paths may be used at all: rseq has not been
/// rejected by the kernel *and* rseq fences are supported. When this is
/// false, callers must treat their per-CPU structures as permanently
/// missing caches — which also makes the no-op fences sound.
pub fn is_fast() -> bool {
    rseq_available() && fence_available()
}
