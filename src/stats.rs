//! Slab operation counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and
//! never used for synchronization; the slab's stop/fence protocol provides
//! the ordering guarantees for correctness.
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    /// Fast-path pushes that committed.
    pub pushes: AtomicU64,
    /// Push misses: uncached word, stale cache, full class, or abort.
    pub push_misses: AtomicU64,
    /// Fast-path pops that committed.
    pub pops: AtomicU64,
    /// Pop misses, same causes as push misses.
    pub pop_misses: AtomicU64,
    /// Pointers moved by `push_batch`.
    pub batch_items_pushed: AtomicU64,
    /// Pointers moved by `pop_batch`.
    pub batch_items_popped: AtomicU64,
    /// Successful same-CPU capacity grows.
    pub grows: AtomicU64,
    /// Capacity grows applied to a stopped CPU.
    pub grows_other: AtomicU64,
    /// Capacity shrinks applied to a stopped CPU.
    pub shrinks_other: AtomicU64,
    /// Completed `drain` calls.
    pub drains: AtomicU64,
    /// Pointers handed to drain handlers (drain and resize).
    pub drained_items: AtomicU64,
    /// Completed `resize_slabs` calls.
    pub resizes: AtomicU64,
    /// Successful cache primings (slow path commits).
    pub cache_primes: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            pushes: AtomicU64::new(0),
            push_misses: AtomicU64::new(0),
            pops: AtomicU64::new(0),
            pop_misses: AtomicU64::new(0),
            batch_items_pushed: AtomicU64::new(0),
            batch_items_popped: AtomicU64::new(0),
            grows: AtomicU64::new(0),
            grows_other: AtomicU64::new(0),
            shrinks_other: AtomicU64::new(0),
            drains: AtomicU64::new(0),
            drained_items: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
            cache_primes: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// Point-in-time copy of every counter.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub pushes: u64,
    pub push_misses: u64,
    pub pops: u64,
    pub pop_misses: u64,
    pub batch_items_pushed: u64,
    pub batch_items_popped: u64,
    pub grows: u64,
    pub grows_other: u64,
    pub shrinks_other: u64,
    pub drains: u64,
    pub drained_items: u64,
    pub resizes: u64,
    pub cache_primes: u64,
}

/// Read all counters (individually relaxed).
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        pushes: s.pushes.load(Ordering::Relaxed),
        push_misses: s.push_misses.load(Ordering::Relaxed),
        pops: s.pops.load(Ordering::Relaxed),
        pop_misses: s.pop_misses.load(Ordering::Relaxed),
        batch_items_pushed: s.batch_items_pushed.load(Ordering::Relaxed),
        batch_items_popped: s.batch_items_popped.load(Ordering::Relaxed),
        grows: s.grows.load(Ordering::Relaxed),
        grows_other: s.grows_other.load(Ordering::Relaxed),
        shrinks_other: s.shrinks_other.load(Ordering::Relaxed),
        drains: s.drains.load(Ordering::Relaxed),
        drained_items: s.drained_items.load(Ordering::Relaxed),
        resizes: s.resizes.load(Ordering::Relaxed),
        cache_primes: s.cache_primes.load(Ordering::Relaxed),
    }
}
