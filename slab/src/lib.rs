//! Per-CPU slab cache of free objects.
//!
//! This crate provides the hot data structure at the heart of a per-CPU
//! caching allocator: a fixed-footprint, LIFO stash of object pointers
//! partitioned by logical CPU and by size class. Every thread-local
//! allocation and deallocation hits it first; correctness hinges on the
//! fast paths being atomic with respect to thread preemption and migration
//! between CPUs.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     PerCpuSlab<CLASSES>                      |
//! |                                                              |
//! |  slabs_and_shift: (region ptr | shift) in one atomic word    |
//! |                                                              |
//! |  backing region, num_cpus << shift bytes                     |
//! |  +--------------------------+--------------------------+    |
//! |  | CPU 0 region (1<<shift)  | CPU 1 region (1<<shift)  | .. |
//! |  | +----------------------+ |                          |    |
//! |  | | CLASSES headers      | |   headers: 64-bit packed |    |
//! |  | | {cur,endcp,begin,end}| |   {current, end_copy,    |    |
//! |  | +----------------------+ |    begin, end} offsets   |    |
//! |  | | pointer slot arena   | |                          |    |
//! |  | | [sentinel][class 0 ] | |   one sentinel slot per  |    |
//! |  | | [sentinel][class 1 ] | |   nonempty class for     |    |
//! |  | | ...                  | |   pop's prefetch         |    |
//! |  | +----------------------+ |                          |    |
//! |  +--------------------------+--------------------------+    |
//! +--------------------------------------------------------------+
//! ```
//!
//! Push, pop, and the batched variants run inside a single-CPU atomic
//! section (see [`cpu`]): they commit only while attributed to one CPU, or
//! abort with no effect. Grow and shrink adjust capacity with an on-CPU
//! header CAS. Drain, shrink-other, and resize quiesce a CPU by writing
//! the lock pattern into its headers and fencing, then work serially.
//!
//! Size-class selection, central free lists, and the surrounding allocator
//! are out of scope; they appear as the overflow/underflow/drain/shrink
//! handlers the slab calls at its boundary.
//!
//! # Example
//!
//! ```ignore
//! use percpu_slab::{arena, PerCpuSlab, Shift, VirtualCpuMode};
//!
//! let region = arena::SlabsAllocation::allocate(total)?;
//! let slab = PerCpuSlab::<8>::init(
//!     |size, _align| arena::SlabsAllocation::allocate(size).unwrap().into_raw().0,
//!     |size_class| 2048,
//!     Shift::new(18)?,
//!     VirtualCpuMode::Physical,
//! )?;
//!
//! let cpu = slab.current_cpu();
//! slab.init_cpu(cpu, |size_class| 2048);
//! slab.grow(cpu, size_class, 64, |_shift| 2048);
//! slab.push(size_class, ptr, |cpu, size_class, item| { /* overflow */ -1 });
//! let item = slab.pop(size_class, |cpu, size_class| std::ptr::null_mut());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
mod config;
pub mod cpu;
mod error;
mod header;
mod layout;
mod metrics;
mod slab;
mod sync;

pub use config::{Shift, VirtualCpuMode, FIXED_SHIFT, PAGE_ALIGN, SLABS_PTR_ALIGN};
pub use error::{SlabError, SlabResult};
pub use metrics::{MetadataUsage, SlabMetrics};
pub use slab::PerCpuSlab;

/// Overflow handler that declines the item: push reports failure.
pub fn noop_overflow(_cpu: i32, _size_class: usize, _item: *mut u8) -> i32 {
    -1
}

/// Underflow handler that supplies nothing: pop reports null.
pub fn noop_underflow(_cpu: i32, _size_class: usize) -> *mut u8 {
    std::ptr::null_mut()
}
