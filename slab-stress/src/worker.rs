//! Worker thread for the slab stress harness.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use percpu_slab::{noop_overflow, noop_underflow, PerCpuSlab};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::config::Config;
use crate::metrics;

/// Size classes per CPU in the harness slab.
pub const CLASSES: usize = 8;

/// Test phase, controlled by the main thread and read by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Run the workload but don't record metrics.
    Warmup = 0,
    /// Main measurement phase.
    Running = 1,
    /// Workers should exit.
    Stop = 2,
}

impl Phase {
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Warmup,
            1 => Phase::Running,
            _ => Phase::Stop,
        }
    }
}

/// Shared state between the main thread and workers.
pub struct SharedState {
    phase: AtomicU8,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Warmup as u8),
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Everything the workers and the resize loop share.
pub struct Harness {
    pub slab: PerCpuSlab<CLASSES>,
    /// Items surrendered by drain/shrink/resize handlers.
    pub side_pool: Mutex<Vec<usize>>,
    /// Readers: per-CPU maintenance. Writer: resize.
    pub maintenance: RwLock<()>,
    /// Serializes quiescing operations per CPU.
    pub cpu_locks: Vec<Mutex<()>>,
    /// CPUs that have been laid out. Never unset; resize re-lays them.
    pub initialized: Vec<AtomicBool>,
    pub state: SharedState,
    /// Per-class capacity bound, also the grow limit.
    pub max_capacity: usize,
}

impl Harness {
    /// Lay out the current CPU (once) and grant some capacity. Called on
    /// the push overflow path.
    fn make_room(&self, size_class: usize) {
        let cpu = self.slab.current_cpu();
        let max_capacity = self.max_capacity;
        let _maintenance = self.maintenance.read().unwrap();
        let _cpu_lock = self.cpu_locks[cpu as usize].lock().unwrap();
        if !self.initialized[cpu as usize].load(Ordering::Acquire) {
            self.slab.init_cpu(cpu, |_| max_capacity);
            self.initialized[cpu as usize].store(true, Ordering::Release);
        }
        self.slab.grow(cpu, size_class, 8, |_| max_capacity);
    }
}

/// Run a single worker thread. Returns the worker's final stash for the
/// conservation check.
pub fn run_worker(id: usize, config: &Config, harness: &Harness, mut stash: Vec<usize>) -> Vec<usize> {
    let num_cpus = harness.slab.num_cpus();
    let max_capacity = harness.max_capacity;
    let batch_max = config.workload.batch_max;

    // Cumulative op thresholds out of 100; the remainder is shrink-other.
    let push_threshold = config.workload.push;
    let pop_threshold = push_threshold + config.workload.pop;
    let batch_threshold = pop_threshold + config.workload.batch;
    let capacity_threshold = batch_threshold + config.workload.capacity_ops;
    let drain_threshold = capacity_threshold + config.workload.drain;

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42 + id as u64);
    let mut batch_buf: Vec<*mut u8> = vec![std::ptr::null_mut(); batch_max];

    loop {
        let phase = harness.state.phase();
        if phase == Phase::Stop {
            break;
        }
        let recording = phase == Phase::Running;

        let size_class = rng.gen_range(0..CLASSES);
        let roll: u32 = rng.gen_range(0..100);

        if roll < push_threshold {
            if let Some(item) = stash.pop() {
                let start = Instant::now();
                let pushed = harness
                    .slab
                    .push(size_class, item as *mut u8, noop_overflow);
                if recording {
                    let _ = metrics::PUSH_LATENCY.increment(start.elapsed().as_nanos() as u64);
                }
                if pushed {
                    if recording {
                        metrics::PUSH.increment();
                    }
                } else {
                    if recording {
                        metrics::PUSH_OVERFLOW.increment();
                    }
                    harness.make_room(size_class);
                    stash.push(item);
                }
            }
        } else if roll < pop_threshold {
            let start = Instant::now();
            let item = harness.slab.pop(size_class, noop_underflow);
            if recording {
                let _ = metrics::POP_LATENCY.increment(start.elapsed().as_nanos() as u64);
            }
            if item.is_null() {
                if recording {
                    metrics::POP_UNDERFLOW.increment();
                }
            } else {
                stash.push(item as usize);
                if recording {
                    metrics::POP.increment();
                }
            }
        } else if roll < batch_threshold {
            if rng.gen_bool(0.5) {
                let want = rng.gen_range(1..=batch_max).min(stash.len());
                if want > 0 {
                    let tail = stash.len() - want;
                    for (slot, &item) in batch_buf.iter_mut().zip(&stash[tail..]) {
                        *slot = item as *mut u8;
                    }
                    let moved = harness.slab.push_batch(size_class, &mut batch_buf[..want]);
                    stash.truncate(tail);
                    stash.extend(batch_buf[..want - moved].iter().map(|&p| p as usize));
                    if recording {
                        metrics::PUSH_BATCH_ITEMS.add(moved as u64);
                    }
                }
            } else {
                let want = rng.gen_range(1..=batch_max);
                let moved = harness.slab.pop_batch(size_class, &mut batch_buf[..want]);
                stash.extend(batch_buf[..moved].iter().map(|&p| p as usize));
                if recording {
                    metrics::POP_BATCH_ITEMS.add(moved as u64);
                }
            }
        } else if roll < capacity_threshold {
            let cpu = harness.slab.current_cpu();
            if rng.gen_bool(0.5) {
                let granted =
                    harness
                        .slab
                        .grow(cpu, size_class, rng.gen_range(1..=8), |_| max_capacity);
                if recording {
                    metrics::GROW_SLOTS.add(granted as u64);
                }
            } else {
                let released = harness.slab.shrink(cpu, size_class, rng.gen_range(1..=8));
                if recording {
                    metrics::SHRINK_SLOTS.add(released as u64);
                }
            }
        } else if roll < drain_threshold {
            let cpu = rng.gen_range(0..num_cpus);
            let _maintenance = harness.maintenance.read().unwrap();
            let _cpu_lock = harness.cpu_locks[cpu].lock().unwrap();
            let mut collected = Vec::new();
            harness.slab.drain(cpu as i32, |_, _, batch, _| {
                collected.extend(batch.iter().map(|&p| p as usize));
            });
            drop(_cpu_lock);
            harness.side_pool.lock().unwrap().extend(collected);
            if recording {
                metrics::DRAIN.increment();
            }
        } else {
            let cpu = rng.gen_range(0..num_cpus);
            let _maintenance = harness.maintenance.read().unwrap();
            let _cpu_lock = harness.cpu_locks[cpu].lock().unwrap();
            let mut evicted = Vec::new();
            harness.slab.shrink_other_cache(
                cpu as i32,
                size_class,
                rng.gen_range(1..=8),
                |_, batch| {
                    evicted.extend(batch.iter().map(|&p| p as usize));
                },
            );
            drop(_cpu_lock);
            harness.side_pool.lock().unwrap().extend(evicted);
            if recording {
                metrics::SHRINK_OTHER.increment();
            }
        }

        // Keep items circulating: top up a starving stash from the pool.
        if stash.len() < batch_max {
            let mut pool = harness.side_pool.lock().unwrap();
            let take = pool.len().min(batch_max * 2);
            let at = pool.len() - take;
            stash.extend(pool.drain(at..));
        }
    }

    stash
}
