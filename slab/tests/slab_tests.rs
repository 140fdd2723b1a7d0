//! End-to-end tests for the per-CPU slab cache.
//!
//! These exercise the public API the way the surrounding allocator would:
//! lazy CPU initialization through the overflow path, capacity managed by
//! grow/shrink, and maintenance through drain/shrink-other/resize.

#![cfg(not(feature = "loom"))]

use std::cell::RefCell;
use std::sync::Arc;

use percpu_slab::{
    arena, noop_overflow, noop_underflow, PerCpuSlab, Shift, VirtualCpuMode,
};

const CLASSES: usize = 4;
const CAPACITY: usize = 10;

/// Tracks backing regions so old slabs stay mapped until the test ends
/// (resize hands them back instead of freeing them).
struct TestArena {
    regions: RefCell<Vec<(usize, usize)>>,
}

impl TestArena {
    fn new() -> Self {
        Self {
            regions: RefCell::new(Vec::new()),
        }
    }

    fn alloc(&self, size: usize, _align: usize) -> *mut u8 {
        let allocation = arena::SlabsAllocation::allocate(size).expect("mmap failed");
        let (ptr, size) = allocation.into_raw();
        self.regions.borrow_mut().push((ptr as usize, size));
        ptr
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        for &(ptr, size) in self.regions.borrow().iter() {
            unsafe { arena::free(ptr as *mut u8, size) };
        }
    }
}

fn capacity_of(_size_class: usize) -> usize {
    CAPACITY
}

fn new_slab(arena: &TestArena, shift: u8) -> PerCpuSlab<CLASSES> {
    PerCpuSlab::<CLASSES>::init(
        |size, align| arena.alloc(size, align),
        capacity_of,
        Shift::new(shift).unwrap(),
        VirtualCpuMode::Flat,
    )
    .expect("init failed")
}

/// Distinct, stable item pointers backed by leaked boxes.
fn make_items(n: usize) -> Vec<*mut u8> {
    (0..n)
        .map(|i| Box::into_raw(Box::new(i as u64)) as *mut u8)
        .collect()
}

fn free_items(items: &[*mut u8]) {
    for &item in items {
        drop(unsafe { Box::from_raw(item as *mut u64) });
    }
}

// =============================================================================
// Unit cycle
// =============================================================================

#[test]
fn test_unit_cycle() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    let size_class = 2;

    assert_eq!(slab.length(cpu, size_class), 0);
    assert_eq!(slab.capacity(cpu, size_class), 0);

    slab.init_cpu(cpu, capacity_of);

    // Still no capacity: pop underflows.
    assert!(slab.pop(size_class, noop_underflow).is_null());

    assert_eq!(slab.grow(cpu, size_class, 5, |_| CAPACITY), 5);
    assert_eq!(slab.capacity(cpu, size_class), 5);

    let items = make_items(5);
    for &item in &items {
        assert!(slab.push(size_class, item, noop_overflow));
    }
    assert_eq!(slab.length(cpu, size_class), 5);

    // LIFO: p5, p4, p3, p2, p1.
    for &expected in items.iter().rev() {
        assert_eq!(slab.pop(size_class, noop_underflow), expected);
    }
    assert_eq!(slab.length(cpu, size_class), 0);

    free_items(&items);
}

#[test]
fn test_push_pop_roundtrip() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    slab.grow(cpu, 0, CAPACITY, |_| CAPACITY);

    let items = make_items(1);
    assert!(slab.push(0, items[0], noop_overflow));
    assert_eq!(slab.pop(0, noop_underflow), items[0]);
    free_items(&items);
}

// =============================================================================
// Handlers
// =============================================================================

#[test]
fn test_overflow_handler_decides_result() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    // Capacity 0: every push overflows.

    let items = make_items(1);
    let mut seen = None;
    assert!(!slab.push(0, items[0], |handler_cpu, size_class, item| {
        seen = Some((handler_cpu, size_class, item));
        -1
    }));
    assert_eq!(seen, Some((cpu, 0, items[0])));

    // A non-negative handler return converts the overflow into success.
    assert!(slab.push(0, items[0], |_, _, _| 0));
    free_items(&items);
}

#[test]
fn test_underflow_handler_result_is_returned() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);

    let fallback = 0xDEAD_0000usize as *mut u8;
    let got = slab.pop(3, |handler_cpu, size_class| {
        assert_eq!(handler_cpu, cpu);
        assert_eq!(size_class, 3);
        fallback
    });
    assert_eq!(got, fallback);
    // The failed pop did not disturb the header.
    assert_eq!(slab.length(cpu, 3), 0);
}

// =============================================================================
// Batch operations
// =============================================================================

#[test]
fn test_push_batch_partial() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    assert_eq!(slab.grow(cpu, 0, 5, |_| CAPACITY), 5);

    let early = make_items(2);
    for &item in &early {
        assert!(slab.push(0, item, noop_overflow));
    }

    // Three slots remain; the batch loses its last three items, and the
    // unmoved head keeps its order.
    let batch_items = make_items(5);
    let mut batch = batch_items.clone();
    assert_eq!(slab.push_batch(0, &mut batch), 3);
    assert_eq!(&batch[..2], &batch_items[..2]);

    // Popping returns the batch tail first (most recently stored), then
    // the earlier pushes in LIFO order.
    let mut out = [std::ptr::null_mut(); 5];
    assert_eq!(slab.pop_batch(0, &mut out), 5);
    assert_eq!(out[0], batch_items[4]);
    assert_eq!(out[1], batch_items[3]);
    assert_eq!(out[2], batch_items[2]);
    assert_eq!(out[3], early[1]);
    assert_eq!(out[4], early[0]);

    free_items(&early);
    free_items(&batch_items);
}

#[test]
fn test_batch_on_empty_and_full() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);

    let mut out = [std::ptr::null_mut(); 4];
    assert_eq!(slab.pop_batch(0, &mut out), 0);

    // No capacity: nothing moves, batch untouched.
    let items = make_items(4);
    let mut batch = items.clone();
    assert_eq!(slab.push_batch(0, &mut batch), 0);
    assert_eq!(batch, items);

    slab.grow(cpu, 0, CAPACITY, |_| CAPACITY);
    assert_eq!(slab.push_batch(0, &mut batch), 4);
    assert_eq!(slab.length(cpu, 0), 4);
    free_items(&items);
}

#[test]
fn test_batch_fallback_off_tuned_shift() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 16);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    slab.grow(cpu, 1, CAPACITY, |_| CAPACITY);

    let items = make_items(6);
    let mut batch = items.clone();
    assert_eq!(slab.push_batch(1, &mut batch), 6);
    assert_eq!(slab.length(cpu, 1), 6);

    let mut out = [std::ptr::null_mut(); 6];
    assert_eq!(slab.pop_batch(1, &mut out), 6);
    assert_eq!(slab.length(cpu, 1), 0);

    // Same multiset either way.
    let mut got = out.to_vec();
    let mut want = items.clone();
    got.sort();
    want.sort();
    assert_eq!(got, want);
    free_items(&items);
}

// =============================================================================
// Grow / shrink
// =============================================================================

#[test]
fn test_grow_respects_max_capacity() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);

    assert_eq!(slab.grow(cpu, 0, 100, |_| CAPACITY), CAPACITY);
    assert_eq!(slab.capacity(cpu, 0), CAPACITY);
    // Already at the bound.
    assert_eq!(slab.grow(cpu, 0, 1, |_| CAPACITY), 0);
}

#[test]
fn test_grow_then_shrink_is_noop_on_capacity() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);

    let before = slab.capacity(cpu, 1);
    assert_eq!(slab.grow(cpu, 1, 7, |_| CAPACITY), 7);
    assert_eq!(slab.shrink(cpu, 1, 7), 7);
    assert_eq!(slab.capacity(cpu, 1), before);
}

#[test]
fn test_shrink_refuses_live_items() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    slab.grow(cpu, 0, 4, |_| CAPACITY);

    let items = make_items(3);
    for &item in &items {
        assert!(slab.push(0, item, noop_overflow));
    }
    // Only one slot is unused.
    assert_eq!(slab.shrink(cpu, 0, 4), 1);
    assert_eq!(slab.capacity(cpu, 0), 3);
    assert_eq!(slab.length(cpu, 0), 3);
    free_items(&items);
}

#[test]
fn test_grow_uninitialized_cpu_returns_zero() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    // Headers are still zero: begin == 0 reads as "not live".
    assert_eq!(slab.grow(cpu, 0, 5, |_| CAPACITY), 0);
    assert_eq!(slab.shrink(cpu, 0, 5), 0);
}

// =============================================================================
// Drain
// =============================================================================

#[test]
fn test_drain_collects_everything_in_class_order() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    slab.grow(cpu, 0, 4, |_| CAPACITY);
    slab.grow(cpu, 1, 4, |_| CAPACITY);

    let class0 = make_items(3);
    let class1 = make_items(2);
    for &item in &class0 {
        assert!(slab.push(0, item, noop_overflow));
    }
    for &item in &class1 {
        assert!(slab.push(1, item, noop_overflow));
    }

    let mut calls = Vec::new();
    slab.drain(cpu, |drain_cpu, size_class, batch, cap| {
        assert_eq!(drain_cpu, cpu);
        calls.push((size_class, batch.to_vec(), cap));
    });

    assert_eq!(calls.len(), CLASSES);
    for (i, (size_class, batch, cap)) in calls.iter().enumerate() {
        assert_eq!(*size_class, i);
        match i {
            0 => {
                assert_eq!(batch, &class0);
                assert_eq!(*cap, 4);
            }
            1 => {
                assert_eq!(batch, &class1);
                assert_eq!(*cap, 4);
            }
            _ => {
                assert!(batch.is_empty());
                assert_eq!(*cap, 0);
            }
        }
    }

    for size_class in 0..CLASSES {
        assert_eq!(slab.length(cpu, size_class), 0);
        assert_eq!(slab.capacity(cpu, size_class), 0);
    }
    assert_eq!(slab.metrics().drains(), 1);

    // The sub-slab is still usable: grow and push again.
    assert_eq!(slab.grow(cpu, 0, 2, |_| CAPACITY), 2);
    assert!(slab.push(0, class0[0], noop_overflow));
    assert_eq!(slab.pop(0, noop_underflow), class0[0]);

    free_items(&class0);
    free_items(&class1);
}

#[test]
fn test_drain_uninitialized_cpu() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let other = ((slab.current_cpu() as usize + 1) % slab.num_cpus()) as i32;

    let mut calls = 0;
    slab.drain(other, |_, _, batch, cap| {
        assert!(batch.is_empty());
        assert_eq!(cap, 0);
        calls += 1;
    });
    assert_eq!(calls, CLASSES);
}

// =============================================================================
// ShrinkOtherCache
// =============================================================================

#[test]
fn test_shrink_other_cache_with_eviction() {
    let arena = TestArena::new();
    let slab = Arc::new(new_slab(&arena, 18));
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    assert_eq!(slab.grow(cpu, 0, 4, |_| CAPACITY), 4);

    let items = make_items(2);
    for &item in &items {
        assert!(slab.push(0, item, noop_overflow));
    }
    assert_eq!(slab.length(cpu, 0), 2);

    // Run the shrink from a different thread (hence a different CPU slot).
    let evicted = {
        let slab = Arc::clone(&slab);
        let expected_top = items[1] as usize;
        std::thread::spawn(move || {
            let mut evicted = Vec::new();
            let shrunk = slab.shrink_other_cache(cpu, 0, 3, |size_class, batch| {
                assert_eq!(size_class, 0);
                evicted.extend(batch.iter().map(|&p| p as usize));
            });
            assert_eq!(shrunk, 3);
            assert_eq!(evicted, vec![expected_top]);
            evicted
        })
        .join()
        .unwrap()
    };

    assert_eq!(evicted.len(), 1);
    assert_eq!(slab.length(cpu, 0), 1);
    assert_eq!(slab.capacity(cpu, 0), 1);
    assert_eq!(slab.pop(0, noop_underflow), items[0]);
    assert_eq!(slab.metrics().other_shrinks(), 1);
    free_items(&items);
}

#[test]
fn test_shrink_other_cache_unused_only() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    slab.grow(cpu, 2, 6, |_| CAPACITY);

    // Plenty of unused capacity: no eviction callback at all.
    let shrunk = slab.shrink_other_cache(cpu, 2, 4, |_, _| {
        panic!("nothing should be evicted");
    });
    assert_eq!(shrunk, 4);
    assert_eq!(slab.capacity(cpu, 2), 2);
}

// =============================================================================
// Resize
// =============================================================================

#[test]
fn test_resize_surrenders_items_once() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 14);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    slab.grow(cpu, 0, 6, |_| CAPACITY);

    let items = make_items(6);
    for &item in &items {
        assert!(slab.push(0, item, noop_overflow));
    }

    let mut drained: Vec<usize> = Vec::new();
    let (old_ptr, old_size) = unsafe {
        slab.resize_slabs(
            Shift::new(16).unwrap(),
            |size, align| arena.alloc(size, align),
            capacity_of,
            |resize_cpu| resize_cpu == cpu,
            |_, _, batch, _| drained.extend(batch.iter().map(|&p| p as usize)),
        )
    }
    .expect("resize failed");

    assert_eq!(slab.shift(), 16);
    assert_eq!(old_size, slab.num_cpus() << 14);

    // Every pushed item came back exactly once.
    let mut want: Vec<usize> = items.iter().map(|&p| p as usize).collect();
    drained.sort_unstable();
    want.sort_unstable();
    assert_eq!(drained, want);

    // Discard the old region; stale capacity CAS attempts see begin == 0.
    unsafe { arena::discard(old_ptr, old_size) };

    // The populated CPU was re-laid-out on the new region with zero
    // capacity, ready to grow again.
    assert_eq!(slab.length(cpu, 0), 0);
    assert_eq!(slab.capacity(cpu, 0), 0);
    assert_eq!(slab.grow(cpu, 0, 3, |_| CAPACITY), 3);
    assert!(slab.push(0, items[0], noop_overflow));
    assert_eq!(slab.pop(0, noop_underflow), items[0]);
    assert_eq!(slab.metrics().resizes(), 1);

    free_items(&items);
}

// =============================================================================
// Introspection
// =============================================================================

#[test]
fn test_metadata_memory_usage() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let usage = slab.metadata_memory_usage();
    assert_eq!(usage.virtual_size, slab.num_cpus() << 18);
    assert!(usage.resident_size <= usage.virtual_size);

    // Touch one CPU's region and residency must cover at least a page.
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    let usage = slab.metadata_memory_usage();
    assert!(usage.resident_size >= 4096);
}

#[test]
fn test_length_capacity_track_operations() {
    let arena = TestArena::new();
    let slab = new_slab(&arena, 18);
    let cpu = slab.current_cpu();
    slab.init_cpu(cpu, capacity_of);
    slab.grow(cpu, 0, 8, |_| CAPACITY);

    let items = make_items(8);
    for (i, &item) in items.iter().enumerate() {
        assert!(slab.push(0, item, noop_overflow));
        assert_eq!(slab.length(cpu, 0), i + 1);
    }
    // Full: the next push overflows and leaves memory untouched.
    let extra = make_items(1);
    assert!(!slab.push(0, extra[0], noop_overflow));
    assert_eq!(slab.length(cpu, 0), 8);

    for i in (0..8).rev() {
        slab.pop(0, noop_underflow);
        assert_eq!(slab.length(cpu, 0), i);
    }
    free_items(&items);
    free_items(&extra);
}
