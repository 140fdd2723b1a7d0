//! The per-CPU slab cache.
//!
//! One contiguous backing region is split into equal per-CPU regions of
//! `1 << shift` bytes. Each region starts with `CLASSES` packed headers
//! followed by the pointer slot arena; each (cpu, size class) pair owns a
//! LIFO stash of object pointers described entirely by its header.
//!
//! Fast paths (push/pop and the batched variants) run inside a single-CPU
//! atomic section and touch only their own CPU's sub-slab. Capacity moves
//! through on-CPU header CAS (grow/shrink). Cross-CPU maintenance (drain,
//! shrink-other, resize) quiesces a CPU by overwriting the begin/end half
//! of every header with the lock pattern and fencing that CPU, then works
//! serially on the stopped sub-slabs.
//!
//! The header word of each sub-slab is the sole synchronization point:
//! - push/pop commit with a 16-bit store of `current`,
//! - grow/shrink move `end`/`end_copy` with a 64-bit on-CPU CAS,
//! - the lock overwrites `begin`/`end` with a 32-bit store,
//! - drain/shrink-other reset `current` with a 32-bit store while locked.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::warn;

use crate::config::{Shift, VirtualCpuMode, FIXED_SHIFT, PAGE_ALIGN, SLABS_PTR_ALIGN};
use crate::cpu::{self, LockTable};
use crate::error::{SlabError, SlabResult};
use crate::header::{self, Header};
use crate::layout::{self, CpuLayout};
use crate::metrics::{MetadataUsage, SlabMetrics};
use crate::{arena, noop_overflow, noop_underflow};

/// Low byte of the packed slabs word holds the shift; the pointer above it
/// must be aligned past the mask (page alignment more than covers it).
const SHIFT_MASK: usize = 0xFF;

/// A fixed-footprint, per-CPU, per-size-class LIFO cache of object
/// pointers.
///
/// `CLASSES` is the number of size classes per CPU. The slab stores plain
/// `*mut u8` values; it owns them only while they are cached. Push
/// transfers ownership in, pop transfers it out, and the drain/shrink
/// handlers take ownership of whole batches.
///
/// All methods may be called concurrently from any thread except where a
/// method documents otherwise.
pub struct PerCpuSlab<const CLASSES: usize> {
    /// Packed `(region pointer | shift)` word. Both change together on
    /// resize so fast paths derive the region and the shift from one load.
    slabs_and_shift: AtomicUsize,
    mode: VirtualCpuMode,
    num_cpus: usize,
    locks: LockTable,
    metrics: SlabMetrics,
}

impl<const CLASSES: usize> PerCpuSlab<CLASSES> {
    /// Create a slab over a freshly allocated backing region.
    ///
    /// `alloc(bytes, align)` supplies the region and must return zeroed,
    /// lazily-faulted memory (anonymous mmap qualifies); headers stay
    /// all-zero until [`init_cpu`](Self::init_cpu) brings a CPU online.
    /// `capacity(size_class)` is the per-class reservation; it must fit in
    /// 16 bits and is validated against the shift here. Initial capacity of
    /// every sub-slab is zero until grown.
    pub fn init(
        mut alloc: impl FnMut(usize, usize) -> *mut u8,
        capacity: impl Fn(usize) -> usize,
        shift: Shift,
        mode: VirtualCpuMode,
    ) -> SlabResult<Self> {
        let num_cpus = cpu::num_cpus();
        let layout = layout::compute::<CLASSES>(&capacity, shift)?;

        let size = shift.total_bytes(num_cpus);
        let slabs = alloc(size, PAGE_ALIGN);
        if slabs.is_null() {
            return Err(SlabError::AllocationFailed);
        }
        assert_eq!(
            slabs as usize & SHIFT_MASK,
            0,
            "backing region must be at least {SLABS_PTR_ALIGN}-byte aligned"
        );

        let bytes_used = layout.bytes_used * num_cpus;
        if bytes_used * 10 < 9 * size {
            warn!("slab layout uses {bytes_used} of {size} reserved bytes");
        }

        Ok(Self {
            slabs_and_shift: AtomicUsize::new(slabs as usize | shift.get() as usize),
            mode,
            num_cpus,
            locks: LockTable::new(num_cpus),
            metrics: SlabMetrics::default(),
        })
    }

    /// Number of logical CPUs this slab partitions by.
    #[inline]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Current shift of the slabs. Intended for the thread coordinating
    /// [`resize_slabs`](Self::resize_slabs).
    #[inline]
    pub fn shift(&self) -> u8 {
        self.slabs_and_shift(Ordering::Relaxed).1.get()
    }

    /// The CPU id operations by this thread are attributed to right now.
    #[inline]
    pub fn current_cpu(&self) -> i32 {
        cpu::current_cpu(self.mode)
    }

    /// Slow-path operation counters.
    #[inline]
    pub fn metrics(&self) -> &SlabMetrics {
        &self.metrics
    }

    /// Number of cached items in `(cpu, size_class)`; 0 while quiesced.
    pub fn length(&self, cpu: i32, size_class: usize) -> usize {
        self.assert_cpu(cpu);
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let hdr = header::load(unsafe { Self::header_cell(slabs, shift, cpu, size_class) });
        if hdr.is_locked() {
            0
        } else {
            hdr.length() as usize
        }
    }

    /// Reserved capacity of `(cpu, size_class)`; 0 while quiesced.
    pub fn capacity(&self, cpu: i32, size_class: usize) -> usize {
        self.assert_cpu(cpu);
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let hdr = header::load(unsafe { Self::header_cell(slabs, shift, cpu, size_class) });
        if hdr.is_locked() {
            0
        } else {
            hdr.capacity() as usize
        }
    }

    /// Virtual and resident size of the backing region.
    pub fn metadata_memory_usage(&self) -> MetadataUsage {
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let virtual_size = shift.total_bytes(self.num_cpus);
        let resident_size = arena::resident_bytes(slabs, virtual_size).unwrap_or(0);
        MetadataUsage {
            virtual_size,
            resident_size,
        }
    }

    /// Add `item` to the current CPU's `size_class` stash.
    ///
    /// Returns true on success. On overflow (full or quiesced sub-slab, or
    /// a CPU that was never initialized) `overflow(cpu, size_class, item)`
    /// runs outside the atomic section and its sign becomes the result: a
    /// negative return yields false. The handler owns `item` if it keeps
    /// it; push itself does not retry.
    pub fn push(
        &self,
        size_class: usize,
        item: *mut u8,
        overflow: impl FnOnce(i32, usize, *mut u8) -> i32,
    ) -> bool {
        assert!(!item.is_null(), "pushed item must be non-null");
        debug_assert!(size_class < CLASSES);
        let mut cpu = cpu::current_cpu(self.mode);
        loop {
            let section = self.locks.acquire(cpu as usize);
            let now = cpu::current_cpu(self.mode);
            if now != cpu {
                // Migrated between the id read and the stripe acquire;
                // abort with no effect and restart on the new CPU.
                drop(section);
                cpu = now;
                continue;
            }

            let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
            let cell = unsafe { Self::header_cell(slabs, shift, cpu, size_class) };
            let hdr = header::load(cell);
            if hdr.current >= hdr.end {
                drop(section);
                return overflow(cpu, size_class, item) >= 0;
            }
            unsafe {
                let region = Self::cpu_region(slabs, shift, cpu);
                *Self::slot_ptr(region, hdr.current) = item;
            }
            header::store_current(cell, hdr.current + 1);
            return true;
        }
    }

    /// Remove the most recently pushed item from the current CPU's
    /// `size_class` stash.
    ///
    /// On underflow (empty or quiesced sub-slab) `underflow(cpu,
    /// size_class)` runs outside the atomic section and its result is
    /// returned verbatim.
    pub fn pop(
        &self,
        size_class: usize,
        underflow: impl FnOnce(i32, usize) -> *mut u8,
    ) -> *mut u8 {
        debug_assert!(size_class < CLASSES);
        let mut cpu = cpu::current_cpu(self.mode);
        loop {
            let section = self.locks.acquire(cpu as usize);
            let now = cpu::current_cpu(self.mode);
            if now != cpu {
                drop(section);
                cpu = now;
                continue;
            }

            let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
            let cell = unsafe { Self::header_cell(slabs, shift, cpu, size_class) };
            let hdr = header::load(cell);
            if hdr.current <= hdr.begin {
                drop(section);
                return underflow(cpu, size_class);
            }
            let result = unsafe {
                let region = Self::cpu_region(slabs, shift, cpu);
                // Warm the item a subsequent pop would return. The slot
                // below the last item is the class's sentinel self-pointer,
                // so the prefetched address is always readable.
                let below = *Self::slot_ptr(region, hdr.current - 2);
                prefetch_read(below);
                *Self::slot_ptr(region, hdr.current - 1)
            };
            header::store_current(cell, hdr.current - 1);
            return result;
        }
    }

    /// Move up to `batch.len()` items into the current CPU's stash,
    /// consuming from the tail of `batch`. Returns the number moved;
    /// unmoved items remain at the head in their original order.
    pub fn push_batch(&self, size_class: usize, batch: &mut [*mut u8]) -> usize {
        assert!(!batch.is_empty());
        debug_assert!(size_class < CLASSES);
        let (_, shift) = self.slabs_and_shift(Ordering::Relaxed);
        if shift != FIXED_SHIFT {
            // Off the tuned shift: emulate with single pushes.
            let len = batch.len();
            let mut moved = 0;
            while moved < len && self.push(size_class, batch[len - 1 - moved], noop_overflow) {
                moved += 1;
            }
            return moved;
        }

        let mut cpu = cpu::current_cpu(self.mode);
        loop {
            let section = self.locks.acquire(cpu as usize);
            let now = cpu::current_cpu(self.mode);
            if now != cpu {
                drop(section);
                cpu = now;
                continue;
            }

            let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
            let cell = unsafe { Self::header_cell(slabs, shift, cpu, size_class) };
            let hdr = header::load(cell);
            let room = hdr.end.saturating_sub(hdr.current) as usize;
            let moved = room.min(batch.len());
            if moved == 0 {
                return 0;
            }
            unsafe {
                let region = Self::cpu_region(slabs, shift, cpu);
                let tail = batch.len() - moved;
                for i in 0..moved {
                    *Self::slot_ptr(region, hdr.current + i as u16) = batch[tail + i];
                }
            }
            header::store_current(cell, hdr.current + moved as u16);
            return moved;
        }
    }

    /// Pop up to `batch.len()` items from the current CPU's stash into
    /// `batch[0..n]`, most recent first. Returns `n`.
    pub fn pop_batch(&self, size_class: usize, batch: &mut [*mut u8]) -> usize {
        assert!(!batch.is_empty());
        debug_assert!(size_class < CLASSES);
        let (_, shift) = self.slabs_and_shift(Ordering::Relaxed);
        if shift != FIXED_SHIFT {
            let mut moved = 0;
            while moved < batch.len() {
                let item = self.pop(size_class, noop_underflow);
                if item.is_null() {
                    break;
                }
                batch[moved] = item;
                moved += 1;
            }
            return moved;
        }

        let mut cpu = cpu::current_cpu(self.mode);
        loop {
            let section = self.locks.acquire(cpu as usize);
            let now = cpu::current_cpu(self.mode);
            if now != cpu {
                drop(section);
                cpu = now;
                continue;
            }

            let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
            let cell = unsafe { Self::header_cell(slabs, shift, cpu, size_class) };
            let hdr = header::load(cell);
            let available = hdr.current.saturating_sub(hdr.begin) as usize;
            let moved = available.min(batch.len());
            if moved == 0 {
                return 0;
            }
            unsafe {
                let region = Self::cpu_region(slabs, shift, cpu);
                for (i, slot) in batch.iter_mut().enumerate().take(moved) {
                    *slot = *Self::slot_ptr(region, hdr.current - 1 - i as u16);
                }
            }
            header::store_current(cell, hdr.current - moved as u16);
            return moved;
        }
    }

    /// If running on `cpu`, raise `(cpu, size_class)`'s capacity by up to
    /// `len`, bounded by `max_capacity(shift)`, and return the increment.
    ///
    /// Returns 0 when the header is quiesced, capacity is already at the
    /// bound, the region was retired by a resize, or the thread migrated
    /// off `cpu` mid-CAS. Migration makes the 0 spurious; callers must
    /// tolerate it. `max_capacity` receives the shift observed for the CAS
    /// attempt so the bound stays consistent across a concurrent resize.
    pub fn grow(
        &self,
        cpu: i32,
        size_class: usize,
        len: usize,
        max_capacity: impl Fn(u8) -> usize,
    ) -> usize {
        self.assert_cpu(cpu);
        debug_assert!(size_class < CLASSES);
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let max_cap = max_capacity(shift.get());
        debug_assert!(max_cap <= u16::MAX as usize);
        let cell = unsafe { Self::header_cell(slabs, shift, cpu, size_class) };
        loop {
            let old = header::load(cell);
            // begin == 0 means this region was discarded after a resize:
            // its pages read back zero, and a CAS must not resurrect it.
            if old.is_locked() || old.capacity() as usize >= max_cap || old.begin == 0 {
                return 0;
            }
            let n = len.min(max_cap - old.capacity() as usize) as u16;
            let mut new = old;
            new.end += n;
            new.end_copy += n;
            match self
                .locks
                .cas_on_cpu(self.mode, cpu, cell, old.pack(), new.pack())
            {
                ret if ret == cpu => return n as usize,
                ret if ret >= 0 => return 0,
                _ => {} // lost to a concurrent header update; reload and retry
            }
        }
    }

    /// If running on `cpu`, release up to `len` unused slots of capacity
    /// and return the decrement. Never cuts below `current`; evicting live
    /// items is [`shrink_other_cache`](Self::shrink_other_cache)'s job.
    ///
    /// Returns 0 under the same conditions as [`grow`](Self::grow).
    pub fn shrink(&self, cpu: i32, size_class: usize, len: usize) -> usize {
        self.assert_cpu(cpu);
        debug_assert!(size_class < CLASSES);
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let cell = unsafe { Self::header_cell(slabs, shift, cpu, size_class) };
        loop {
            let old = header::load(cell);
            if old.is_locked() || old.current == old.end || old.begin == 0 {
                return 0;
            }
            let n = len.min((old.end - old.current) as usize) as u16;
            let mut new = old;
            new.end -= n;
            new.end_copy -= n;
            match self
                .locks
                .cas_on_cpu(self.mode, cpu, cell, old.pack(), new.pack())
            {
                ret if ret == cpu => return n as usize,
                ret if ret >= 0 => return 0,
                _ => {}
            }
        }
    }

    /// Bring one CPU's sub-slabs online, laying out the slot arena and
    /// writing valid headers. Safe against concurrent fast paths on the
    /// same CPU. Capacity starts at zero; grow makes room.
    pub fn init_cpu(&self, cpu: i32, capacity: impl Fn(usize) -> usize) {
        self.assert_cpu(cpu);
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        self.init_cpu_impl(slabs, shift, cpu, capacity);
        SlabMetrics::record(&self.metrics.cpu_inits);
    }

    /// Remove all items of all classes from `cpu`'s sub-slabs and reset
    /// every capacity to zero. For each size class, in order, the handler
    /// receives `(cpu, size_class, items, capacity)` and takes ownership of
    /// both the items and the freed capacity.
    ///
    /// Safe against concurrent push/pop/grow/shrink, including on `cpu`
    /// itself. Two drains of the same CPU must not run concurrently.
    pub fn drain(&self, cpu: i32, mut drain_handler: impl FnMut(i32, usize, &mut [*mut u8], usize)) {
        self.assert_cpu(cpu);
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);

        // Phase 1: snapshot begin offsets. They are only rewritten under
        // the lock protocol, so plain loads are stable here.
        let mut begins = [0u16; CLASSES];
        for (size_class, begin) in begins.iter_mut().enumerate() {
            let hdr = header::load(unsafe { Self::header_cell(slabs, shift, cpu, size_class) });
            assert!(!hdr.is_locked(), "concurrent drain of cpu {cpu}");
            *begin = hdr.begin;
        }

        // Phase 2: stop concurrent mutations.
        self.stop_concurrent_mutations(slabs, shift, cpu);

        // Phase 3: hand contents and capacity to the handler.
        unsafe { Self::drain_cpu(slabs, shift, cpu, &begins, &mut drain_handler) };

        // Phase 4: reset only `current`. Pop reads `begin` and `current`
        // non-atomically: if both moved in one store, a pop still carrying
        // the old `current` could observe the new `begin` and decrement
        // below it. Locked begin/end keep push/pop failing; after the
        // fence no fast path still holds the old `current`.
        for (size_class, &begin) in begins.iter().enumerate() {
            let cell = unsafe { Self::header_cell(slabs, shift, cpu, size_class) };
            let hdr = header::load(cell);
            header::store_open_half(cell, begin, hdr.end_copy);
        }
        self.locks.fence_cpu(cpu as usize);

        // Phase 5: reopen with zero capacity.
        for (size_class, &begin) in begins.iter().enumerate() {
            let cell = unsafe { Self::header_cell(slabs, shift, cpu, size_class) };
            header::store(
                cell,
                Header {
                    current: begin,
                    end_copy: begin,
                    begin,
                    end: begin,
                },
            );
        }
        SlabMetrics::record(&self.metrics.drains);
    }

    /// Reduce `(cpu, size_class)`'s capacity by up to `len` from any CPU,
    /// evicting live items when unused capacity alone cannot cover it.
    /// Evicted items (top of stack first in memory order) go to
    /// `shrink_handler(size_class, items)`. Returns the decrement applied.
    ///
    /// Must not run concurrently with [`drain`](Self::drain) or another
    /// shrink of the same sub-slab.
    pub fn shrink_other_cache(
        &self,
        cpu: i32,
        size_class: usize,
        len: usize,
        mut shrink_handler: impl FnMut(usize, &mut [*mut u8]),
    ) -> usize {
        self.assert_cpu(cpu);
        debug_assert!(size_class < CLASSES);
        assert!(len > 0);
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let cell = unsafe { Self::header_cell(slabs, shift, cpu, size_class) };

        // Phase 1: collect begin before the lock overwrites it.
        let mut hdr = header::load(cell);
        assert!(!hdr.is_locked(), "concurrent quiesce of cpu {cpu}");
        let begin = hdr.begin;

        // Phase 2: stop mutations of this one header. A grow/shrink CAS
        // can overwrite the lock; retry until it sticks.
        loop {
            header::lock(cell);
            self.locks.fence_cpu(cpu as usize);
            hdr = header::load(cell);
            if hdr.is_locked() {
                break;
            }
        }

        // Phase 3: pop items if unused capacity cannot cover the shrink.
        // Same split-write rationale as drain: move `current` down while
        // begin/end stay locked, fence, and only then rewrite the rest.
        let unused = (hdr.end_copy - hdr.current) as usize;
        if unused < len {
            let actual_pop = (len - unused).min((hdr.current - begin) as usize);
            unsafe {
                let region = Self::cpu_region(slabs, shift, cpu);
                let top = Self::slot_ptr(region, hdr.current - actual_pop as u16);
                let batch = std::slice::from_raw_parts_mut(top, actual_pop);
                shrink_handler(size_class, batch);
            }
            hdr.current -= actual_pop as u16;
            header::store_open_half(cell, hdr.current, hdr.end_copy);
            self.locks.fence_cpu(cpu as usize);
        }

        // Phase 4: restore begin and give back the shrunk capacity.
        let to_shrink = len.min((hdr.end_copy - hdr.current) as usize);
        let new_end = hdr.end_copy - to_shrink as u16;
        header::store(
            cell,
            Header {
                current: hdr.current,
                end_copy: new_end,
                begin,
                end: new_end,
            },
        );
        SlabMetrics::record(&self.metrics.other_shrinks);
        to_shrink
    }

    /// Replace the backing region with one at `new_shift`, migrating every
    /// populated CPU's contents through `drain_handler`. Returns the old
    /// region as `(ptr, bytes)`; the caller should discard it (e.g.
    /// [`arena::discard`]) so stale CAS attempts observe zeroed headers.
    ///
    /// Concurrent push/pop/grow/shrink are safe throughout.
    ///
    /// # Safety
    ///
    /// No concurrent `init_cpu`, `drain`, `shrink_other_cache`, or other
    /// `resize_slabs` may be in flight; the caller serializes them. The old
    /// region must stay mapped until no thread can still address it.
    pub unsafe fn resize_slabs(
        &self,
        new_shift: Shift,
        mut alloc: impl FnMut(usize, usize) -> *mut u8,
        capacity: impl Fn(usize) -> usize,
        populated: impl Fn(i32) -> bool,
        mut drain_handler: impl FnMut(i32, usize, &mut [*mut u8], usize),
    ) -> SlabResult<(*mut u8, usize)> {
        let (old_slabs, old_shift) = self.slabs_and_shift(Ordering::Relaxed);
        assert_ne!(new_shift, old_shift, "resize must change the shift");
        layout::compute::<CLASSES>(&capacity, new_shift)?;

        let size = new_shift.total_bytes(self.num_cpus);
        let new_slabs = alloc(size, PAGE_ALIGN);
        if new_slabs.is_null() {
            return Err(SlabError::AllocationFailed);
        }
        assert_eq!(new_slabs as usize & SHIFT_MASK, 0);

        // Phase 1: lay out every populated CPU on the new region while it
        // is still private to this thread.
        for cpu in 0..self.num_cpus as i32 {
            if populated(cpu) {
                self.init_cpu_impl(new_slabs, new_shift, cpu, &capacity);
            }
        }

        // Phase 2: snapshot begins and quiesce the old region. After this
        // no fast path or capacity CAS can commit there.
        let mut begins = vec![[0u16; CLASSES]; self.num_cpus];
        for cpu in 0..self.num_cpus as i32 {
            if !populated(cpu) {
                continue;
            }
            for (size_class, begin) in begins[cpu as usize].iter_mut().enumerate() {
                let hdr =
                    header::load(unsafe { Self::header_cell(old_slabs, old_shift, cpu, size_class) });
                assert!(!hdr.is_locked(), "resize raced another quiesce on cpu {cpu}");
                *begin = hdr.begin;
            }
            self.stop_concurrent_mutations(old_slabs, old_shift, cpu);
        }

        // Phase 3: publish the new region and shift together. Fast paths
        // that already loaded the old pair find only locked headers there
        // and escape through their handlers.
        self.slabs_and_shift
            .store(new_slabs as usize | new_shift.get() as usize, Ordering::Relaxed);

        // Phase 4: hand the old contents back for re-injection.
        for cpu in 0..self.num_cpus as i32 {
            if populated(cpu) {
                unsafe {
                    Self::drain_cpu(old_slabs, old_shift, cpu, &begins[cpu as usize], &mut drain_handler)
                };
            }
        }

        SlabMetrics::record(&self.metrics.resizes);
        Ok((old_slabs, old_shift.total_bytes(self.num_cpus)))
    }

    /// Free the backing region through `free(ptr, bytes, align)` and leave
    /// the slab pointing at nothing.
    ///
    /// # Safety
    ///
    /// No operation may run on the slab during or after this call.
    pub unsafe fn destroy(&self, free: impl FnOnce(*mut u8, usize, usize)) {
        // Let any straggling atomic section finish before the region goes.
        self.locks.fence_all();
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        free(slabs, shift.total_bytes(self.num_cpus), PAGE_ALIGN);
        self.slabs_and_shift
            .store(shift.get() as usize, Ordering::Relaxed);
    }

    fn slabs_and_shift(&self, order: Ordering) -> (*mut u8, Shift) {
        let raw = self.slabs_and_shift.load(order);
        (
            (raw & !SHIFT_MASK) as *mut u8,
            Shift::from_raw((raw & SHIFT_MASK) as u8),
        )
    }

    fn assert_cpu(&self, cpu: i32) {
        assert!(
            cpu >= 0 && (cpu as usize) < self.num_cpus,
            "cpu {cpu} out of range (0..{})",
            self.num_cpus
        );
    }

    #[inline]
    unsafe fn cpu_region(slabs: *mut u8, shift: Shift, cpu: i32) -> *mut u8 {
        unsafe { slabs.add((cpu as usize) << shift.get()) }
    }

    #[inline]
    unsafe fn header_cell<'a>(
        slabs: *mut u8,
        shift: Shift,
        cpu: i32,
        size_class: usize,
    ) -> &'a AtomicU64 {
        unsafe {
            &*Self::cpu_region(slabs, shift, cpu)
                .cast::<AtomicU64>()
                .add(size_class)
        }
    }

    #[inline]
    unsafe fn slot_ptr(region: *mut u8, index: u16) -> *mut *mut u8 {
        unsafe { region.cast::<*mut u8>().add(index as usize) }
    }

    /// Lock every header of `cpu` and fence until the locks stick. A
    /// grow/shrink CAS can overwrite a freshly written lock once, but its
    /// next attempt sees the locked header and gives up, so the loop
    /// terminates.
    fn stop_concurrent_mutations(&self, slabs: *mut u8, shift: Shift, cpu: i32) {
        loop {
            for size_class in 0..CLASSES {
                header::lock(unsafe { Self::header_cell(slabs, shift, cpu, size_class) });
            }
            self.locks.fence_cpu(cpu as usize);
            let mut done = true;
            for size_class in 0..CLASSES {
                let hdr =
                    header::load(unsafe { Self::header_cell(slabs, shift, cpu, size_class) });
                if !hdr.is_locked() {
                    done = false;
                    break;
                }
            }
            if done {
                return;
            }
        }
    }

    /// Hand every class's items and capacity to the handler. Headers must
    /// be locked (current/end_copy stay meaningful under the lock).
    unsafe fn drain_cpu(
        slabs: *mut u8,
        shift: Shift,
        cpu: i32,
        begins: &[u16; CLASSES],
        drain_handler: &mut impl FnMut(i32, usize, &mut [*mut u8], usize),
    ) {
        for size_class in 0..CLASSES {
            let hdr = header::load(unsafe { Self::header_cell(slabs, shift, cpu, size_class) });
            let size = (hdr.current - begins[size_class]) as usize;
            let cap = (hdr.end_copy - begins[size_class]) as usize;
            unsafe {
                let region = Self::cpu_region(slabs, shift, cpu);
                let first = Self::slot_ptr(region, begins[size_class]);
                let batch = std::slice::from_raw_parts_mut(first, size);
                drain_handler(cpu, size_class, batch, cap);
            }
        }
    }

    /// Shared by [`init_cpu`](Self::init_cpu) and phase 1 of
    /// [`resize_slabs`](Self::resize_slabs).
    fn init_cpu_impl(
        &self,
        slabs: *mut u8,
        shift: Shift,
        cpu: i32,
        capacity: impl Fn(usize) -> usize,
    ) {
        // Phase 1: nobody else may be quiescing this CPU.
        for size_class in 0..CLASSES {
            let hdr = header::load(unsafe { Self::header_cell(slabs, shift, cpu, size_class) });
            assert!(!hdr.is_locked(), "init_cpu raced another quiesce on cpu {cpu}");
        }

        // Phase 2: stop concurrent mutations. Locked headers admit no
        // value of current with begin < current.
        self.stop_concurrent_mutations(slabs, shift, cpu);

        // Phase 3: compute slot placements and install each nonempty
        // class's sentinel (the slot before begin points at itself, so
        // pop's prefetch of "one below the last item" stays in bounds).
        let cpu_layout: CpuLayout<CLASSES> = layout::compute::<CLASSES>(&capacity, shift)
            .expect("capacity function inconsistent with slab shift");
        let region = unsafe { Self::cpu_region(slabs, shift, cpu) };
        for size_class in 0..CLASSES {
            if cpu_layout.capacity[size_class] > 0 {
                unsafe {
                    let sentinel = Self::slot_ptr(region, cpu_layout.begin[size_class] - 1);
                    *sentinel = sentinel as *mut u8;
                }
            }
        }

        // Phase 4: move current onto the new begin while the headers stay
        // locked, then fence so no fast path still carries an old current.
        for size_class in 0..CLASSES {
            let cell = unsafe { Self::header_cell(slabs, shift, cpu, size_class) };
            let mut hdr = header::load(cell);
            hdr.current = cpu_layout.begin[size_class];
            header::store(cell, hdr);
        }
        self.locks.fence_cpu(cpu as usize);

        // Phase 5: open the headers. Capacity is zero until grown.
        for size_class in 0..CLASSES {
            let begin = cpu_layout.begin[size_class];
            header::store(
                unsafe { Self::header_cell(slabs, shift, cpu, size_class) },
                Header {
                    current: begin,
                    end_copy: begin,
                    begin,
                    end: begin,
                },
            );
        }
    }
}

/// Best-effort read prefetch; never faults.
#[inline(always)]
fn prefetch_read(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(ptr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = ptr;
    }
}
