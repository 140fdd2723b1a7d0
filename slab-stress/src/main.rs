//! In-process stress harness for the per-CPU slab. Exercises push/pop,
//! the batched variants, capacity traffic, and online maintenance
//! (drain/shrink-other/resize) directly, without an allocator around it.
//!
//! Items are leaked boxes circulating between per-thread stashes, the
//! slab, and a side pool fed by the maintenance handlers. On exit the
//! harness verifies the multiset survived intact.

mod config;
mod metrics;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::info;
use percpu_slab::{arena, PerCpuSlab, Shift, VirtualCpuMode};

use crate::config::Config;
use crate::worker::{Harness, Phase, SharedState, CLASSES};

#[derive(Parser)]
#[command(name = "slab-stress")]
#[command(about = "In-process stress harness for the per-CPU slab")]
struct Args {
    /// Path to configuration file
    config: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Backing regions live here until the run is over; a retired region must
/// stay mapped while stale capacity CAS attempts can still address it.
struct RegionLog {
    regions: Mutex<Vec<(usize, usize)>>,
}

impl RegionLog {
    fn alloc(&self, size: usize) -> *mut u8 {
        let (ptr, size) = arena::SlabsAllocation::allocate(size)
            .expect("mmap failed")
            .into_raw();
        self.regions.lock().unwrap().push((ptr as usize, size));
        ptr
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let regions = RegionLog {
        regions: Mutex::new(Vec::new()),
    };
    let mode = if config.slab.virtual_cpu {
        VirtualCpuMode::Flat
    } else {
        VirtualCpuMode::Physical
    };
    let per_class = config.slab.capacity;

    let slab = PerCpuSlab::<CLASSES>::init(
        |size, _align| regions.alloc(size),
        |_| per_class,
        Shift::new(config.slab.shift)?,
        mode,
    )?;
    let num_cpus = slab.num_cpus();

    println!(
        "slab-stress: {} classes x {} cpus, shift {}, capacity {}, {} items, {} threads",
        CLASSES, num_cpus, config.slab.shift, per_class, config.workload.items, config.general.threads
    );

    let universe: Vec<usize> = (0..config.workload.items)
        .map(|i| Box::into_raw(Box::new(i as u64)) as usize)
        .collect();

    let harness = Arc::new(Harness {
        slab,
        side_pool: Mutex::new(Vec::new()),
        maintenance: RwLock::new(()),
        cpu_locks: (0..num_cpus).map(|_| Mutex::new(())).collect(),
        initialized: (0..num_cpus).map(|_| AtomicBool::new(false)).collect(),
        state: SharedState::new(),
        max_capacity: per_class,
    });

    let cpu_ids = match config.general.cpu_list {
        Some(ref raw) => Some(config::parse_cpu_list(raw).map_err(|e| format!("invalid cpu_list: {e}"))?),
        None => None,
    };

    // Spawn workers with an even split of the item universe.
    let num_threads = config.general.threads;
    let chunk = config.workload.items / num_threads;
    let config = Arc::new(config);
    let mut handles = Vec::with_capacity(num_threads);
    for id in 0..num_threads {
        let harness = Arc::clone(&harness);
        let config = Arc::clone(&config);
        let cpu_ids = cpu_ids.clone();
        let stash = universe[id * chunk..(id + 1) * chunk].to_vec();
        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                if let Some(ref ids) = cpu_ids {
                    if !ids.is_empty() {
                        let _ = pin_to_cpu(ids[id % ids.len()]);
                    }
                }
                worker::run_worker(id, &config, &harness, stash)
            })?;
        handles.push(handle);
    }
    harness
        .side_pool
        .lock()
        .unwrap()
        .extend_from_slice(&universe[num_threads * chunk..]);

    // Warmup, then measure.
    thread::sleep(config.general.warmup);
    harness.state.set_phase(Phase::Running);
    info!("warmup complete, measuring");

    let start = Instant::now();
    let mut last_report = start;
    let mut last_completed = 0u64;
    let mut last_resize = start;
    let mut next_shift = config.resize.min_shift;
    while start.elapsed() < config.general.duration {
        thread::sleep(Duration::from_millis(100));

        if config.resize.enabled && last_resize.elapsed() >= config.resize.interval {
            if next_shift == harness.slab.shift() {
                next_shift = bump_shift(next_shift, &config);
            }
            let mut migrated = Vec::new();
            let maintenance = harness.maintenance.write().unwrap();
            let (old_ptr, old_size) = unsafe {
                harness.slab.resize_slabs(
                    Shift::new(next_shift)?,
                    |size, _align| regions.alloc(size),
                    |_| per_class,
                    |cpu| harness.initialized[cpu as usize].load(AtomicOrdering::Acquire),
                    |_, _, batch, _| migrated.extend(batch.iter().map(|&p| p as usize)),
                )
            }?;
            unsafe { arena::discard(old_ptr, old_size) };
            drop(maintenance);
            harness.side_pool.lock().unwrap().extend(migrated);
            metrics::RESIZE.increment();
            next_shift = bump_shift(next_shift, &config);
            last_resize = Instant::now();
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let completed = metrics::completed();
            let rate = (completed - last_completed) as f64 / last_report.elapsed().as_secs_f64();
            println!(
                "rate: {:.0} ops/s, shift: {}, resizes: {}",
                rate,
                harness.slab.shift(),
                metrics::RESIZE.value()
            );
            last_completed = completed;
            last_report = Instant::now();
        }
    }

    harness.state.set_phase(Phase::Stop);
    let mut recovered: Vec<usize> = Vec::new();
    for handle in handles {
        recovered.extend(handle.join().expect("worker panicked"));
    }

    // Sweep whatever is still cached.
    for cpu in 0..num_cpus as i32 {
        harness.slab.drain(cpu, |_, _, batch, _| {
            recovered.extend(batch.iter().map(|&p| p as usize));
        });
    }
    recovered.extend(harness.side_pool.lock().unwrap().drain(..));

    report_final(&harness.slab);

    let mut want = universe.clone();
    recovered.sort_unstable();
    want.sort_unstable();
    let conserved = recovered == want;
    println!(
        "conservation: {} ({} of {} items recovered)",
        if conserved { "ok" } else { "FAILED" },
        recovered.len(),
        want.len()
    );

    for &item in &universe {
        drop(unsafe { Box::from_raw(item as *mut u64) });
    }
    for &(ptr, size) in regions.regions.lock().unwrap().iter() {
        unsafe { arena::free(ptr as *mut u8, size) };
    }

    if conserved {
        Ok(())
    } else {
        Err("item conservation check failed".into())
    }
}

fn bump_shift(shift: u8, config: &Config) -> u8 {
    if shift >= config.resize.max_shift {
        config.resize.min_shift
    } else {
        shift + 1
    }
}

fn report_final(slab: &PerCpuSlab<CLASSES>) {
    println!(
        "push: {} ok, {} overflow; pop: {} ok, {} underflow",
        metrics::PUSH.value(),
        metrics::PUSH_OVERFLOW.value(),
        metrics::POP.value(),
        metrics::POP_UNDERFLOW.value()
    );
    println!(
        "batch items: {} pushed, {} popped; capacity slots: {} grown, {} shrunk",
        metrics::PUSH_BATCH_ITEMS.value(),
        metrics::POP_BATCH_ITEMS.value(),
        metrics::GROW_SLOTS.value(),
        metrics::SHRINK_SLOTS.value()
    );
    println!(
        "maintenance: {} drains, {} cross-cpu shrinks, {} resizes (slab: {} drains, {} shrinks, {} resizes)",
        metrics::DRAIN.value(),
        metrics::SHRINK_OTHER.value(),
        metrics::RESIZE.value(),
        slab.metrics().drains(),
        slab.metrics().other_shrinks(),
        slab.metrics().resizes()
    );

    for (name, histogram) in [
        ("push_latency_ns", &metrics::PUSH_LATENCY),
        ("pop_latency_ns", &metrics::POP_LATENCY),
    ] {
        if let Some(snapshot) = histogram.load() {
            let mut line = format!("{name}:");
            for (label, percentile) in
                [("p50", 50.0), ("p90", 90.0), ("p99", 99.0), ("p999", 99.9)]
            {
                if let Ok(Some(bucket)) = snapshot.percentile(percentile) {
                    line.push_str(&format!(" {label}={}", bucket.end()));
                }
            }
            println!("{line}");
        }
    }

    let usage = slab.metadata_memory_usage();
    println!(
        "slab memory: {} bytes virtual, {} bytes resident",
        usage.virtual_size, usage.resident_size
    );
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu_id: usize) -> Result<(), std::io::Error> {
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(cpu_id, &mut cpuset);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu_id: usize) -> Result<(), std::io::Error> {
    Ok(())
}
