//! Atomic types switched between std and loom.
//!
//! The per-CPU lock stripes and fences in [`crate::cpu`] are the part of
//! this crate whose interleavings are worth model-checking, so everything
//! they are built from resolves to loom's shims when the `loom` feature is
//! on and to the std atomics otherwise. Only what the stripe protocol
//! needs is re-exported.
//!
//! The header word is NOT routed through here: its mixed-size 16/32-bit
//! stores cannot be expressed against loom's whole-word atomics, so
//! `header.rs` (and the slab code built on it) uses std types directly.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{fence, AtomicU32, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{fence, AtomicU32, Ordering};

/// Busy-wait hint for the stripe acquire loop.
///
/// The std build emits a plain CPU relax; the loom build must instead
/// yield, because a spinning thread that never yields starves the model
/// checker of the schedule where the stripe holder runs and releases.
#[inline]
pub fn spin_loop() {
    #[cfg(not(feature = "loom"))]
    std::hint::spin_loop();

    #[cfg(feature = "loom")]
    loom::thread::yield_now();
}
