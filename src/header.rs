//! Packed per-(cpu, size class) slab header.
//!
//! One 64-bit word per class at the front of each CPU region, four
//! little-endian u16 offsets counted in 8-byte cells from the region start:
//!
//! ```text
//! bits  0..16  current   — first free cell above the occupied range
//! bits 16..32  end_copy  — shadow of end; survives a Lock, so Drain can
//!                          recover the capacity the lock clobbered
//! bits 32..48  begin     — first cell of the class's window
//! bits 48..64  end       — one past the last cell
//! ```
//!
//! Occupied slots are `[begin, current)`, free capacity `[current, end)`.
//! The fast paths read the whole word but commit only a 16-bit store of
//! `current`; maintenance code owns the `(begin, end)` half. Locking a
//! header is a single 32-bit store of that half (`begin = 0xffff`,
//! `end = 0`), which makes any concurrent push see "full" and any pop see
//! "empty" without touching `current`.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// `begin` value of a locked header.
pub(crate) const LOCKED_BEGIN: u16 = 0xffff;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Header {
    pub current: u16,
    pub end_copy: u16,
    pub begin: u16,
    pub end: u16,
}

impl Header {
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self {
            current: raw as u16,
            end_copy: (raw >> 16) as u16,
            begin: (raw >> 32) as u16,
            end: (raw >> 48) as u16,
        }
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        u64::from(self.current)
            | u64::from(self.end_copy) << 16
            | u64::from(self.begin) << 32
            | u64::from(self.end) << 48
    }

    /// `end == 0` also covers madvised-away slabs after a resize: an
    /// all-zero header reads as locked, so stale threads bounce off it.
    #[inline]
    pub fn is_locked(self) -> bool {
        self.end == 0
    }

    /// Once initialized, `begin`/`end` are never simultaneously zero (the
    /// window sits above the header array), so an all-zero half means the
    /// CPU was never touched.
    #[inline]
    pub fn is_initialized(self) -> bool {
        self.begin != 0 || self.end != 0
    }
}

#[inline]
pub(crate) fn load_header(hdrp: &AtomicU64) -> Header {
    Header::from_raw(hdrp.load(Ordering::Relaxed))
}

#[inline]
pub(crate) fn store_header(hdrp: &AtomicU64, hdr: Header) {
    hdrp.store(hdr.to_raw(), Ordering::Relaxed)
}

/// Lock a header in place with a 32-bit store onto its `(begin, end)` half.
///
/// `current` and `end_copy` are left intact — Drain reads them afterwards
/// to recover the occupied range and the capacity. Mixed-size atomic access
/// to the same word is the whole point here and is why the header is not
/// simply a `Header`-typed atomic.
pub(crate) fn lock_header(hdrp: &AtomicU64) {
    let half = unsafe {
        &*((hdrp as *const AtomicU64 as *const u8).add(4) as *const AtomicU32)
    };
    half.store(u32::from(LOCKED_BEGIN), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let hdr = Header {
            current: 0x1234,
            end_copy: 0x5678,
            begin: 0x9abc,
            end: 0xdef0,
        };
        assert_eq!(Header::from_raw(hdr.to_raw()), hdr);
    }

    #[test]
    fn lock_preserves_current_half() {
        let cell = AtomicU64::new(
            Header {
                current: 7,
                end_copy: 9,
                begin: 5,
                end: 9,
            }
            .to_raw(),
        );
        lock_header(&cell);
        let hdr = load_header(&cell);
        assert!(hdr.is_locked());
        assert!(hdr.is_initialized());
        assert_eq!(hdr.current, 7);
        assert_eq!(hdr.end_copy, 9);
        assert_eq!(hdr.begin, LOCKED_BEGIN);
        assert_eq!(hdr.end, 0);
    }

    #[test]
    fn zero_header_is_locked_and_uninitialized() {
        let hdr = Header::from_raw(0);
        assert!(hdr.is_locked());
        assert!(!hdr.is_initialized());
    }

    #[test]
    fn locked_bounds_reject_both_directions() {
        // A locked header must read as simultaneously full and empty.
        let cell = AtomicU64::new(
            Header {
                current: 12,
                end_copy: 20,
                begin: 10,
                end: 20,
            }
            .to_raw(),
        );
        lock_header(&cell);
        let hdr = load_header(&cell);
        assert!(hdr.current >= hdr.end, "push must see overflow");
        assert!(hdr.current <= hdr.begin, "pop must see underflow");
    }
}
