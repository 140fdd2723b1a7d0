//! Error types for slab construction and reconfiguration.

use std::fmt;

/// Errors that can occur while building or resizing a slab.
///
/// Fast-path conditions (overflow, underflow, migration, locked headers)
/// are not errors; they are reported through handler callbacks and return
/// values. Violated invariants at run time panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// The per-class capacities do not fit in one per-CPU region.
    /// The capacity function is inconsistent with the chosen shift.
    PerCpuMemoryExceeded {
        /// Bytes the layout needs per CPU.
        needed: usize,
        /// Bytes available per CPU (`1 << shift`).
        available: usize,
    },

    /// A size class requested a capacity that does not fit in the 16-bit
    /// slot offsets the header uses.
    CapacityTooLarge {
        /// The offending size class.
        size_class: usize,
        /// The requested capacity.
        capacity: usize,
    },

    /// The shift is outside the supported range.
    InvalidShift(u8),

    /// The backing-memory allocator returned null.
    AllocationFailed,
}

impl fmt::Display for SlabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerCpuMemoryExceeded { needed, available } => {
                write!(
                    f,
                    "per-CPU memory exceeded, have {available} need {needed}"
                )
            }
            Self::CapacityTooLarge {
                size_class,
                capacity,
            } => {
                write!(
                    f,
                    "capacity {capacity} for size class {size_class} does not fit in 16 bits"
                )
            }
            Self::InvalidShift(shift) => write!(f, "unsupported slab shift {shift}"),
            Self::AllocationFailed => write!(f, "backing allocation failed"),
        }
    }
}

impl std::error::Error for SlabError {}

/// Result type for slab construction and reconfiguration.
pub type SlabResult<T> = Result<T, SlabError>;
