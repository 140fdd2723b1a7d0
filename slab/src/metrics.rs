//! Slab statistics and memory reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Virtual and resident footprint of the backing region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataUsage {
    /// Bytes of address space the region spans (`num_cpus << shift`).
    pub virtual_size: usize,
    /// Bytes currently backed by physical memory.
    pub resident_size: usize,
}

/// Counters for the slow-path operations.
///
/// Fast paths are deliberately not counted; a counter per push/pop would
/// put shared-cacheline traffic on the hottest code in the allocator.
#[derive(Debug, Default)]
pub struct SlabMetrics {
    pub(crate) cpu_inits: AtomicU64,
    pub(crate) drains: AtomicU64,
    pub(crate) other_shrinks: AtomicU64,
    pub(crate) resizes: AtomicU64,
}

impl SlabMetrics {
    /// Number of CPUs brought online via `init_cpu`.
    pub fn cpu_inits(&self) -> u64 {
        self.cpu_inits.load(Ordering::Relaxed)
    }

    /// Number of completed drains.
    pub fn drains(&self) -> u64 {
        self.drains.load(Ordering::Relaxed)
    }

    /// Number of completed cross-CPU shrinks.
    pub fn other_shrinks(&self) -> u64 {
        self.other_shrinks.load(Ordering::Relaxed)
    }

    /// Number of completed slab resizes.
    pub fn resizes(&self) -> u64 {
        self.resizes.load(Ordering::Relaxed)
    }

    pub(crate) fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
