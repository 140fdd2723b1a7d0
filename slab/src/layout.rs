//! Per-CPU region layout.
//!
//! Each per-CPU region starts with `CLASSES` header words followed by the
//! pointer slot arena. Every class with nonzero capacity is preceded by one
//! sentinel slot holding a self-pointer, so pop's speculative prefetch of
//! "the slot below current" always dereferences a valid address even when
//! the last real item is popped. All offsets are slot indices (byte offsets
//! divided by the word size) and must fit the header's 16-bit fields.

use crate::config::Shift;
use crate::error::{SlabError, SlabResult};
use crate::header::LOCKED_BEGIN;

/// Slot width. Offsets being 16-bit indices of these words is what lets a
/// whole sub-slab descriptor pack into 64 bits.
pub(crate) const WORD: usize = std::mem::size_of::<*mut u8>();

/// The slot-array placement for one CPU's region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CpuLayout<const CLASSES: usize> {
    /// First slot of each class's arena (past its sentinel, if any).
    pub begin: [u16; CLASSES],
    /// Maximum capacity of each class under this layout.
    pub capacity: [u16; CLASSES],
    /// Bytes of the region the layout occupies, headers included.
    pub bytes_used: usize,
}

/// Compute slot placements for one CPU under `capacity(size_class)`.
///
/// Fails if a capacity does not fit 16 bits or the walk runs past the end
/// of the region (the capacity function is inconsistent with the shift).
pub(crate) fn compute<const CLASSES: usize>(
    capacity: impl Fn(usize) -> usize,
    shift: Shift,
) -> SlabResult<CpuLayout<CLASSES>> {
    let region_slots = shift.bytes_per_cpu() / WORD;
    let mut begin = [0u16; CLASSES];
    let mut caps = [0u16; CLASSES];

    // Headers occupy the first CLASSES words.
    let mut slot = CLASSES;
    for size_class in 0..CLASSES {
        let cap = capacity(size_class);
        if cap > u16::MAX as usize {
            return Err(SlabError::CapacityTooLarge {
                size_class,
                capacity: cap,
            });
        }
        if cap > 0 {
            // Sentinel slot for pop's prefetch.
            slot += 1;
        }
        if slot >= LOCKED_BEGIN as usize {
            // A begin of 0xFFFF would be indistinguishable from a locked
            // header.
            return Err(SlabError::PerCpuMemoryExceeded {
                needed: (slot + cap) * WORD,
                available: shift.bytes_per_cpu(),
            });
        }
        begin[size_class] = slot as u16;
        caps[size_class] = cap as u16;
        slot += cap;
        // The end offset must itself fit the header's 16-bit field.
        if slot > region_slots || slot > u16::MAX as usize {
            return Err(SlabError::PerCpuMemoryExceeded {
                needed: slot * WORD,
                available: shift.bytes_per_cpu(),
            });
        }
    }

    Ok(CpuLayout {
        begin,
        capacity: caps,
        bytes_used: slot * WORD,
    })
}
