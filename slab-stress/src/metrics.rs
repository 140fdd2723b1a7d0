//! Stress harness metrics.

use metriken::{metric, AtomicHistogram, Counter};

#[metric(name = "push_count", description = "Successful single pushes")]
pub static PUSH: Counter = Counter::new();

#[metric(name = "push_overflow", description = "Pushes rejected by overflow")]
pub static PUSH_OVERFLOW: Counter = Counter::new();

#[metric(name = "pop_count", description = "Successful single pops")]
pub static POP: Counter = Counter::new();

#[metric(name = "pop_underflow", description = "Pops rejected by underflow")]
pub static POP_UNDERFLOW: Counter = Counter::new();

#[metric(name = "push_batch_items", description = "Items moved by push_batch")]
pub static PUSH_BATCH_ITEMS: Counter = Counter::new();

#[metric(name = "pop_batch_items", description = "Items moved by pop_batch")]
pub static POP_BATCH_ITEMS: Counter = Counter::new();

#[metric(name = "grow_slots", description = "Capacity granted by grow")]
pub static GROW_SLOTS: Counter = Counter::new();

#[metric(name = "shrink_slots", description = "Capacity released by shrink")]
pub static SHRINK_SLOTS: Counter = Counter::new();

#[metric(name = "drain_count", description = "Completed drains")]
pub static DRAIN: Counter = Counter::new();

#[metric(name = "shrink_other_count", description = "Completed cross-CPU shrinks")]
pub static SHRINK_OTHER: Counter = Counter::new();

#[metric(name = "resize_count", description = "Completed slab resizes")]
pub static RESIZE: Counter = Counter::new();

#[metric(
    name = "push_latency",
    description = "Single push latency histogram (nanoseconds)"
)]
pub static PUSH_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

#[metric(
    name = "pop_latency",
    description = "Single pop latency histogram (nanoseconds)"
)]
pub static POP_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

/// Total fast-path operations, for the throughput report.
pub fn completed() -> u64 {
    PUSH.value()
        + PUSH_OVERFLOW.value()
        + POP.value()
        + POP_UNDERFLOW.value()
        + PUSH_BATCH_ITEMS.value()
        + POP_BATCH_ITEMS.value()
}
