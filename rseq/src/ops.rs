//! Slab critical sections: per-CPU LIFO operations via rseq (x86_64).
//!
//! Each primitive is a restartable sequence: the kernel monitors the
//! thread's instruction pointer and redirects to the abort handler if a
//! preemption, signal, or CPU migration occurs within the critical section.
//! The fast path executes with zero atomic instructions — all
//! synchronisation is handled by the kernel's preemption detection.
//!
//! # The cached-slab gate
//!
//! Every section begins with the same guard, reading [`RseqLocal`]:
//!
//! 1. load the cached slab word; bail unless [`CACHED_BIT`] is set,
//! 2. compare the cached CPU id against the live `rseq.cpu_id`; bail on
//!    mismatch.
//!
//! Step 2 is what makes a stale cache harmless on mainline kernels: a word
//! cached on one CPU can never direct a commit at another CPU's region,
//! because the id comparison happens *inside* the section and a migration
//! mid-section restarts it. A bail reports a miss, indistinguishable from
//! overflow/underflow; the caller re-primes via the slow path.
//!
//! The header layout the sections address is fixed: 64-bit headers at
//! `base + size_class * 8` holding little-endian u16 fields
//! `{current, end_copy, begin, end}`, with the object cells at
//! `base + offset * 8`.
//!
//! # Abort handler contract
//!
//! Every abort label must be preceded by the 4-byte `RSEQ_SIG` signature
//! (`0x53053053`). On x86_64 this encodes as `ud1 %edi, %eax`, a
//! guaranteed-illegal instruction that provides control-flow integrity.

use core::arch::asm;

use crate::abi::Rseq;
use crate::thread::{LOCAL_CPU_OFFSET, LOCAL_SLABS_OFFSET, RseqLocal};

/// Byte offset of `rseq_cs` within `struct Rseq`.
const RSEQ_CS_OFFSET: u32 = 8;

/// Byte offset of `cpu_id` within `struct Rseq`.
const CPU_ID_OFFSET: u32 = 4;

// ── slab_push ────────────────────────────────────────────────────────────────

/// Push `item` onto the current CPU's slab for the class at byte offset
/// `class_off` (`size_class * 8`).
///
/// Returns `false` on miss: uncached/stale slab word, full (or locked)
/// header, or rseq abort. The caller cannot distinguish these; it re-primes
/// the cache and retries or escalates.
///
/// # Safety
///
/// - `rseq` must be this thread's registered rseq area.
/// - `local` must be this thread's [`RseqLocal`]; if its slab word is armed
///   it must point at a live slab region whose headers cover `class_off`.
/// - `item` must be non-null.
#[inline(never)]
pub unsafe fn slab_push(
    rseq: *mut Rseq,
    local: &RseqLocal,
    class_off: usize,
    item: *mut u8,
) -> bool {
    let success: u64;

    unsafe {
        asm!(
            // rseq_cs descriptor in a relocatable data section.
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",                     // version
            ".long 0",                     // flags
            ".quad 3f",                    // start_ip
            ".quad (4f - 3f)",             // post_commit_offset
            ".quad 6f",                    // abort_ip
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            // Gate: cached slab word armed, and cached cpu still live.
            "mov {base}, qword ptr [{local} + {slabs_off}]",
            "btr {base}, 63",
            "jnc 7f",
            "mov {cur:e}, dword ptr [{local} + {cpu_off}]",
            "cmp {cur:e}, dword ptr [{rseq} + {cpu_id_off}]",
            "jne 7f",

            // Full check: current >= end (covers a locked header, end = 0).
            "movzx {cur:e}, word ptr [{base} + {off}]",
            "movzx {end_:e}, word ptr [{base} + {off} + 6]",
            "cmp {cur:e}, {end_:e}",
            "jae 7f",

            // Install the item, then COMMIT with a 16-bit store of current.
            "mov qword ptr [{base} + {cur} * 8], {item}",
            "inc {cur:e}",
            "mov word ptr [{base} + {off}], {cur:x}",
            "4:",

            // ── post-commit cleanup ──────────────────────────────
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ:e}, 1",
            "jmp 5f",

            // ── miss: uncached, migrated, or full ────────────────
            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",
            "jmp 5f",

            // ── abort handler ────────────────────────────────────
            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            local = in(reg) core::ptr::from_ref(local),
            off = in(reg) class_off,
            item = in(reg) item,
            base = out(reg) _,
            cur = out(reg) _,
            end_ = out(reg) _,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFFSET,
            cpu_id_off = const CPU_ID_OFFSET,
            slabs_off = const LOCAL_SLABS_OFFSET,
            cpu_off = const LOCAL_CPU_OFFSET,
            options(nostack),
        );
    }

    success != 0
}

// ── slab_pop ─────────────────────────────────────────────────────────────────

/// Pop the top pointer from the current CPU's slab for the class at byte
/// offset `class_off`.
///
/// Returns `Some((item, prefetch_target))` on success, where
/// `prefetch_target` is the cell below the popped one (always a readable
/// pointer thanks to the begin mark). Returns `None` on miss: uncached or
/// stale word, empty (or locked) header, or rseq abort.
///
/// # Safety
///
/// Same requirements as [`slab_push`].
#[inline(never)]
pub unsafe fn slab_pop(
    rseq: *mut Rseq,
    local: &RseqLocal,
    class_off: usize,
) -> Option<(*mut u8, *mut u8)> {
    let result: u64;
    let prefetch: u64;
    let success: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            "mov {base}, qword ptr [{local} + {slabs_off}]",
            "btr {base}, 63",
            "jnc 7f",
            "mov {beg:e}, dword ptr [{local} + {cpu_off}]",
            "cmp {beg:e}, dword ptr [{rseq} + {cpu_id_off}]",
            "jne 7f",

            // Empty check: current <= begin (covers a locked header,
            // begin = 0xffff).
            "movzx {cur:e}, word ptr [{base} + {off}]",
            "movzx {beg:e}, word ptr [{base} + {off} + 4]",
            "cmp {cur:e}, {beg:e}",
            "jbe 7f",

            // Read the result and the speculative prefetch target below it,
            // then COMMIT current - 1.
            "mov {res}, qword ptr [{base} + {cur} * 8 - 8]",
            "mov {pre}, qword ptr [{base} + {cur} * 8 - 16]",
            "dec {cur:e}",
            "mov word ptr [{base} + {off}], {cur:x}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ:e}, 1",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            local = in(reg) core::ptr::from_ref(local),
            off = in(reg) class_off,
            base = out(reg) _,
            cur = out(reg) _,
            beg = out(reg) _,
            res = out(reg) result,
            pre = out(reg) prefetch,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFFSET,
            cpu_id_off = const CPU_ID_OFFSET,
            slabs_off = const LOCAL_SLABS_OFFSET,
            cpu_off = const LOCAL_CPU_OFFSET,
            options(nostack),
        );
    }

    if success != 0 {
        Some((result as *mut u8, prefetch as *mut u8))
    } else {
        None
    }
}

// ── slab_push_batch ──────────────────────────────────────────────────────────

/// Push up to `len` pointers from `batch` onto the current CPU's slab,
/// taking them from the *back* of the buffer so that unmoved items stay at
/// the front. A single 16-bit store of `current` commits the whole
/// transfer.
///
/// Returns the number of pointers moved; 0 on miss or abort, in which case
/// the slab and buffer are untouched.
///
/// # Safety
///
/// Same requirements as [`slab_push`], plus `batch` must point to `len`
/// readable pointers and `len > 0`.
#[inline(never)]
pub unsafe fn slab_push_batch(
    rseq: *mut Rseq,
    local: &RseqLocal,
    class_off: usize,
    batch: *const *mut u8,
    len: usize,
) -> usize {
    let moved: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            "mov {base}, qword ptr [{local} + {slabs_off}]",
            "btr {base}, 63",
            "jnc 7f",
            "mov {cur:e}, dword ptr [{local} + {cpu_off}]",
            "cmp {cur:e}, dword ptr [{rseq} + {cpu_id_off}]",
            "jne 7f",

            // room = end - current; full/locked headers have no room.
            "movzx {cur:e}, word ptr [{base} + {off}]",
            "movzx {n:e}, word ptr [{base} + {off} + 6]",
            "sub {n:e}, {cur:e}",
            "jbe 7f",

            // n = min(room, len); copy from batch[len - n ..].
            "cmp {n}, {len}",
            "cmova {n}, {len}",
            "sub {len}, {n}",
            "lea {batch}, [{batch} + {len} * 8]",
            "lea {len}, [{base} + {cur} * 8]",
            "xor {i:e}, {i:e}",
            "8:",
            "mov {tmp2}, qword ptr [{batch} + {i} * 8]",
            "mov qword ptr [{len} + {i} * 8], {tmp2}",
            "inc {i}",
            "cmp {i}, {n}",
            "jb 8b",

            // COMMIT: current += n.
            "add {cur:e}, {n:e}",
            "mov word ptr [{base} + {off}], {cur:x}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {n:e}, {n:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {n:e}, {n:e}",

            "5:",

            rseq = in(reg) rseq,
            local = in(reg) core::ptr::from_ref(local),
            off = in(reg) class_off,
            batch = inout(reg) batch => _,
            len = inout(reg) len => _,
            base = out(reg) _,
            cur = out(reg) _,
            n = out(reg) moved,
            i = out(reg) _,
            tmp = out(reg) _,
            tmp2 = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFFSET,
            cpu_id_off = const CPU_ID_OFFSET,
            slabs_off = const LOCAL_SLABS_OFFSET,
            cpu_off = const LOCAL_CPU_OFFSET,
            options(nostack),
        );
    }

    moved as usize
}

// ── slab_pop_batch ───────────────────────────────────────────────────────────

/// Pop up to `len` pointers from the current CPU's slab into `batch[0..n)`,
/// top of the stack first. A single 16-bit store of `current` commits the
/// whole transfer.
///
/// Returns the number of pointers written. Slots beyond the returned
/// prefix are unspecified: an aborted sequence may have copied into them
/// before the restart, and nothing past `n` is meaningful.
///
/// # Safety
///
/// Same requirements as [`slab_push`], plus `batch` must point to `len`
/// writable slots and `len > 0`.
#[inline(never)]
pub unsafe fn slab_pop_batch(
    rseq: *mut Rseq,
    local: &RseqLocal,
    class_off: usize,
    batch: *mut *mut u8,
    len: usize,
) -> usize {
    let moved: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            "mov {base}, qword ptr [{local} + {slabs_off}]",
            "btr {base}, 63",
            "jnc 7f",
            "mov {src:e}, dword ptr [{local} + {cpu_off}]",
            "cmp {src:e}, dword ptr [{rseq} + {cpu_id_off}]",
            "jne 7f",

            // avail = current - begin; empty/locked headers have none.
            "movzx {cur:e}, word ptr [{base} + {off}]",
            "movzx {src:e}, word ptr [{base} + {off} + 4]",
            "mov {n:e}, {cur:e}",
            "sub {n:e}, {src:e}",
            "jbe 7f",

            // n = min(avail, len); walk the stack downwards.
            "cmp {n}, {len}",
            "cmova {n}, {len}",
            "lea {src}, [{base} + {cur} * 8]",
            "xor {cnt:e}, {cnt:e}",
            "8:",
            "sub {src}, 8",
            "mov {tmp2}, qword ptr [{src}]",
            "mov qword ptr [{batch} + {cnt} * 8], {tmp2}",
            "inc {cnt}",
            "cmp {cnt}, {n}",
            "jb 8b",

            // COMMIT: current -= n.
            "sub {cur:e}, {n:e}",
            "mov word ptr [{base} + {off}], {cur:x}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {n:e}, {n:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {n:e}, {n:e}",

            "5:",

            rseq = in(reg) rseq,
            local = in(reg) core::ptr::from_ref(local),
            off = in(reg) class_off,
            batch = in(reg) batch,
            len = in(reg) len,
            base = out(reg) _,
            cur = out(reg) _,
            n = out(reg) moved,
            src = out(reg) _,
            cnt = out(reg) _,
            tmp = out(reg) _,
            tmp2 = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFFSET,
            cpu_id_off = const CPU_ID_OFFSET,
            slabs_off = const LOCAL_SLABS_OFFSET,
            cpu_off = const LOCAL_CPU_OFFSET,
            options(nostack),
        );
    }

    moved as usize
}

// ── cache_current_cpu ────────────────────────────────────────────────────────

/// Prime the cached slab word: read the live CPU id, compute
/// `slabs + (cpu << shift)`, and commit both the cached CPU and the tagged
/// base into `local`. The CPU id is read *inside* the section, so a commit
/// guarantees the word names the CPU the thread was on at that instant.
///
/// The caller must zero the cached word first; the CPU field is written
/// before the word so an abort between the two stores leaves the cache
/// disarmed rather than mismatched.
///
/// Returns the CPU the word was cached for, or `None` on abort (retry).
///
/// # Safety
///
/// - `rseq`/`local` as for [`slab_push`].
/// - `slabs`/`shift` must describe a live slab region covering the CPU the
///   thread may be running on.
#[inline(never)]
pub unsafe fn cache_current_cpu(
    rseq: *mut Rseq,
    local: &RseqLocal,
    slabs: *mut u8,
    shift: u32,
) -> Option<u32> {
    let cpu: u64;
    let success: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            "mov {cpu:e}, dword ptr [{rseq} + {cpu_id_off}]",
            "mov {base:e}, {cpu:e}",
            "shl {base}, cl",
            "add {base}, {slabs}",
            "bts {base}, 63",
            "mov dword ptr [{local} + {cpu_off}], {cpu:e}",
            // COMMIT: arm the cached slab word.
            "mov qword ptr [{local} + {slabs_off}], {base}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ:e}, 1",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            local = in(reg) core::ptr::from_ref(local),
            slabs = in(reg) slabs,
            in("rcx") shift as u64,
            cpu = out(reg) cpu,
            base = out(reg) _,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFFSET,
            cpu_id_off = const CPU_ID_OFFSET,
            slabs_off = const LOCAL_SLABS_OFFSET,
            cpu_off = const LOCAL_CPU_OFFSET,
            options(nostack),
        );
    }

    if success != 0 { Some(cpu as u32) } else { None }
}

// ── store_header_current_cpu ─────────────────────────────────────────────────

/// Compare-and-store a full 64-bit header on the slab the thread's cache is
/// armed for: iff the cache gate passes and the header still equals `old`,
/// store `new`.
///
/// The compare is load-bearing: a maintenance lock or a fast-path commit
/// that lands between the caller's header load and this section changes the
/// header value, so a blind store here could resurrect it. Failure is
/// reported as `false`, indistinguishable from a migration.
///
/// # Safety
///
/// Same requirements as [`slab_push`]; `class_off` must address an
/// initialized header.
#[inline(never)]
pub unsafe fn store_header_current_cpu(
    rseq: *mut Rseq,
    local: &RseqLocal,
    class_off: usize,
    old: u64,
    new: u64,
) -> bool {
    let success: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            "mov {base}, qword ptr [{local} + {slabs_off}]",
            "btr {base}, 63",
            "jnc 7f",
            "mov {t:e}, dword ptr [{local} + {cpu_off}]",
            "cmp {t:e}, dword ptr [{rseq} + {cpu_id_off}]",
            "jne 7f",

            "mov {t}, qword ptr [{base} + {off}]",
            "cmp {t}, {old}",
            "jne 7f",

            // COMMIT: full 64-bit header store.
            "mov qword ptr [{base} + {off}], {new}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ:e}, 1",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            local = in(reg) core::ptr::from_ref(local),
            off = in(reg) class_off,
            old = in(reg) old,
            new = in(reg) new,
            base = out(reg) _,
            t = out(reg) _,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFFSET,
            cpu_id_off = const CPU_ID_OFFSET,
            slabs_off = const LOCAL_SLABS_OFFSET,
            cpu_off = const LOCAL_CPU_OFFSET,
            options(nostack),
        );
    }

    success != 0
}
