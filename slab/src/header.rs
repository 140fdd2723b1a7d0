//! Packed per-(cpu, size-class) slab header.
//!
//! Each sub-slab is described by one 64-bit word holding four 16-bit slot
//! offsets. The field grouping is load-bearing: `begin` and `end` share one
//! 32-bit half so the lock protocol can overwrite exactly that half while
//! `current` and `end_copy` stay intact, and the fast paths commit by
//! storing only the 16-bit `current` field.
//!
//! ```text
//! bits  0..16   current    one past the last occupied slot
//! bits 16..32   end_copy   mirror of end, preserved by drain
//! bits 32..48   begin      first slot of this class's arena
//! bits 48..64   end        one past the last reserved slot
//! ```
//!
//! The partial 16- and 32-bit stores below intentionally alias the 64-bit
//! atomic cell. This is the same mixed-size-atomics technique the packed
//! layout exists for; it relies on the byte order of the packed word, so
//! big-endian targets are rejected at compile time.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

#[cfg(target_endian = "big")]
compile_error!("the packed slab header relies on little-endian field order");

/// Value written to the begin/end half by [`lock`]: `begin = 0xFFFF`,
/// `end = 0`. Push then sees `current >= end` and pop sees
/// `current <= begin`, so both fail without touching slot memory.
const LOCK_BITS: u32 = 0xFFFF;

/// Sentinel `begin` value marking a locked header.
pub const LOCKED_BEGIN: u16 = 0xFFFF;

/// One sub-slab's unpacked header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Index one past the last occupied slot.
    pub current: u16,
    /// Mirror of `end`. Updated by grow/shrink, preserved by drain's lock.
    pub end_copy: u16,
    /// Index of the first slot reserved for this size class.
    pub begin: u16,
    /// Index one past the last slot reserved for this size class.
    pub end: u16,
}

impl Header {
    /// Pack into the 64-bit wire form.
    #[inline]
    pub fn pack(self) -> u64 {
        (self.current as u64)
            | (self.end_copy as u64) << 16
            | (self.begin as u64) << 32
            | (self.end as u64) << 48
    }

    /// Unpack from the 64-bit wire form.
    #[inline]
    pub fn unpack(raw: u64) -> Self {
        Self {
            current: raw as u16,
            end_copy: (raw >> 16) as u16,
            begin: (raw >> 32) as u16,
            end: (raw >> 48) as u16,
        }
    }

    /// Whether the header is locked by drain/shrink-other.
    #[inline]
    pub fn is_locked(&self) -> bool {
        if self.begin == LOCKED_BEGIN {
            debug_assert_eq!(self.end, 0, "locked header must have end == 0");
        }
        self.begin == LOCKED_BEGIN
    }

    /// Number of cached items, `current - begin`.
    #[inline]
    pub fn length(&self) -> u16 {
        self.current - self.begin
    }

    /// Reserved capacity, `end - begin`.
    #[inline]
    pub fn capacity(&self) -> u16 {
        self.end - self.begin
    }
}

/// Relaxed 64-bit load of a header cell.
#[inline]
pub fn load(cell: &AtomicU64) -> Header {
    Header::unpack(cell.load(Ordering::Relaxed))
}

/// Relaxed 64-bit store of a header cell.
#[inline]
pub fn store(cell: &AtomicU64, hdr: Header) {
    cell.store(hdr.pack(), Ordering::Relaxed);
}

/// Lock a header: one relaxed 32-bit store of `(begin = 0xFFFF, end = 0)`
/// to the begin/end half. `current` and `end_copy` are left intact.
#[inline]
pub fn lock(cell: &AtomicU64) {
    // Second 32-bit word of the cell = begin | end << 16 on little-endian.
    let half = unsafe { &*(cell as *const AtomicU64 as *const u8).add(4).cast::<AtomicU32>() };
    half.store(LOCK_BITS, Ordering::Relaxed);
}

/// Commit a fast-path mutation: a relaxed 16-bit store of `current` alone.
#[inline]
pub fn store_current(cell: &AtomicU64, current: u16) {
    let field = unsafe { &*(cell as *const AtomicU64 as *const AtomicU16) };
    field.store(current, Ordering::Relaxed);
}

/// Store the current/end_copy half with one relaxed 32-bit write, leaving
/// the (possibly locked) begin/end half untouched. Used by drain and
/// shrink-other while the header is locked.
#[inline]
pub fn store_open_half(cell: &AtomicU64, current: u16, end_copy: u16) {
    let half = unsafe { &*(cell as *const AtomicU64 as *const AtomicU32) };
    half.store((current as u32) | (end_copy as u32) << 16, Ordering::Relaxed);
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let hdr = Header {
            current: 0x1234,
            end_copy: 0x5678,
            begin: 0x9ABC,
            end: 0xDEF0,
        };
        assert_eq!(Header::unpack(hdr.pack()), hdr);
    }

    #[test]
    fn test_zero_header() {
        let hdr = Header::unpack(0);
        assert_eq!(
            hdr,
            Header {
                current: 0,
                end_copy: 0,
                begin: 0,
                end: 0
            }
        );
        assert!(!hdr.is_locked());
    }

    #[test]
    fn test_lock_preserves_open_half() {
        let cell = AtomicU64::new(
            Header {
                current: 7,
                end_copy: 9,
                begin: 5,
                end: 9,
            }
            .pack(),
        );
        lock(&cell);
        let hdr = load(&cell);
        assert!(hdr.is_locked());
        assert_eq!(hdr.begin, LOCKED_BEGIN);
        assert_eq!(hdr.end, 0);
        assert_eq!(hdr.current, 7);
        assert_eq!(hdr.end_copy, 9);
    }

    #[test]
    fn test_locked_header_fails_both_paths() {
        let cell = AtomicU64::new(
            Header {
                current: 7,
                end_copy: 9,
                begin: 5,
                end: 9,
            }
            .pack(),
        );
        lock(&cell);
        let hdr = load(&cell);
        // Push sees current >= end; pop sees current <= begin.
        assert!(hdr.current >= hdr.end);
        assert!(hdr.current <= hdr.begin);
    }

    #[test]
    fn test_store_current_touches_only_current() {
        let cell = AtomicU64::new(
            Header {
                current: 10,
                end_copy: 20,
                begin: 8,
                end: 20,
            }
            .pack(),
        );
        store_current(&cell, 11);
        let hdr = load(&cell);
        assert_eq!(hdr.current, 11);
        assert_eq!(hdr.end_copy, 20);
        assert_eq!(hdr.begin, 8);
        assert_eq!(hdr.end, 20);
    }

    #[test]
    fn test_store_open_half_preserves_lock() {
        let cell = AtomicU64::new(
            Header {
                current: 15,
                end_copy: 30,
                begin: 8,
                end: 30,
            }
            .pack(),
        );
        lock(&cell);
        store_open_half(&cell, 8, 30);
        let hdr = load(&cell);
        assert!(hdr.is_locked());
        assert_eq!(hdr.current, 8);
        assert_eq!(hdr.end_copy, 30);
    }

    #[test]
    fn test_length_capacity() {
        let hdr = Header {
            current: 12,
            end_copy: 18,
            begin: 8,
            end: 18,
        };
        assert_eq!(hdr.length(), 4);
        assert_eq!(hdr.capacity(), 10);
    }
}
