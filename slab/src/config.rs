//! Configuration types and tuning constants.

use crate::error::{SlabError, SlabResult};

/// `log2` of the per-CPU region size in bytes.
///
/// The region holds the per-class headers followed by the pointer slot
/// arena. Header offsets are 16-bit slot indices (bytes divided by 8), so
/// the shift is capped where the index space runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Shift(u8);

impl Shift {
    /// Smallest supported shift (4 KB per CPU, one page).
    pub const MIN: Shift = Shift(12);

    /// Largest supported shift. Slot offsets are 16-bit indices into the
    /// per-CPU region, so `1 << shift` may not exceed `65536 * 8` bytes.
    pub const MAX: Shift = Shift(19);

    /// Create a shift, validating the supported range.
    pub fn new(shift: u8) -> SlabResult<Self> {
        if shift < Self::MIN.0 || shift > Self::MAX.0 {
            return Err(SlabError::InvalidShift(shift));
        }
        Ok(Shift(shift))
    }

    /// Rebuild a shift that was validated earlier (e.g. unpacked from the
    /// packed slabs word).
    #[inline]
    pub(crate) const fn from_raw(shift: u8) -> Self {
        Shift(shift)
    }

    /// Raw shift value.
    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Per-CPU region size in bytes.
    #[inline]
    pub const fn bytes_per_cpu(self) -> usize {
        1 << self.0
    }

    /// Total backing-region size for `num_cpus` CPUs.
    #[inline]
    pub const fn total_bytes(self, num_cpus: usize) -> usize {
        num_cpus << self.0
    }
}

/// The shift the batched fast paths are tuned for. Slabs running at a
/// different shift fall back to per-item push/pop in the batch operations.
pub const FIXED_SHIFT: Shift = Shift(18);

/// The slabs pointer and the shift share one word: the low byte holds the
/// shift, so the pointer must be aligned past it. Page alignment of the
/// backing region (enforced at init) always satisfies this.
pub const SLABS_PTR_ALIGN: usize = 256;

/// Physical-page alignment requested from the backing allocator. A small
/// page (not a huge page) so the lazily-faulted arena does not drag
/// neighboring allocations into residency.
pub const PAGE_ALIGN: usize = 4096;

/// Selects what "current CPU" means for slab attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VirtualCpuMode {
    /// Use the kernel's physical CPU id for the calling thread.
    #[default]
    Physical,
    /// Use flat virtual CPU ids: compact per-thread slots handed out by a
    /// process-wide registry. Threads keep their slot until exit, so a
    /// "virtual CPU" never observes kernel migration.
    Flat,
}
