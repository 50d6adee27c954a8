//! Cross-CPU fences over `membarrier(2)`.
//!
//! [`fence_cpu`] and [`fence_all_cpus`] return only after every targeted CPU
//! has left any rseq critical section it was executing: the kernel interrupts
//! those CPUs and redirects in-flight sequences to their abort handlers. A
//! store made before the fence is therefore visible to every critical section
//! that starts after it on a fenced CPU.
//!
//! `MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ` needs kernel >= 5.10 and a
//! one-time registration, both handled lazily here. When the command is
//! unsupported the fences become no-ops and [`fence_available`] reports
//! false; callers must then keep fast paths disabled (see `is_fast` at the
//! crate root), which makes the no-op sound — there are no critical sections
//! to wait for.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::syscall::{
    MEMBARRIER_CMD_FLAG_CPU, MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ,
    MEMBARRIER_CMD_QUERY, MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ, raw_membarrier,
};

const STATE_UNKNOWN: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_UNAVAILABLE: u8 = 2;

/// Lazily-probed fence support. Registration is idempotent, so a racing
/// double-probe is harmless.
static FENCE_STATE: AtomicU8 = AtomicU8::new(STATE_UNKNOWN);

#[cold]
fn probe() -> bool {
    let supported = unsafe { raw_membarrier(MEMBARRIER_CMD_QUERY, 0, 0) };
    let wanted = (MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ
        | MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ) as i64;
    let ok = supported >= 0
        && (supported & wanted) == wanted
        && unsafe { raw_membarrier(MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ, 0, 0) } == 0;
    FENCE_STATE.store(
        if ok { STATE_READY } else { STATE_UNAVAILABLE },
        Ordering::Relaxed,
    );
    ok
}

#[inline]
fn ready() -> bool {
    match FENCE_STATE.load(Ordering::Relaxed) {
        STATE_READY => true,
        STATE_UNAVAILABLE => false,
        _ => probe(),
    }
}

/// Whether rseq fences are supported by the running kernel.
#[inline]
pub fn fence_available() -> bool {
    ready()
}

/// Wait until `cpu` is not executing any rseq critical section.
///
/// Kernels without per-CPU targeting (< 5.10 never register, but be
/// defensive about EINVAL on the flag) fall back to fencing all CPUs.
pub fn fence_cpu(cpu: u32) {
    if !ready() {
        return;
    }
    let ret = unsafe {
        raw_membarrier(
            MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ,
            MEMBARRIER_CMD_FLAG_CPU,
            cpu as i32,
        )
    };
    if ret != 0 {
        unsafe { raw_membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ, 0, 0) };
    }
}

/// Wait until no CPU is executing an rseq critical section of this process.
pub fn fence_all_cpus() {
    if !ready() {
        return;
    }
    unsafe { raw_membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ, 0, 0) };
}
