//! Configuration for the slab stress harness.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration.
#[derive(Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub slab: SlabConfig,
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub resize: ResizeConfig,
}

/// General harness settings.
#[derive(Deserialize)]
pub struct GeneralConfig {
    /// How long to run the measurement phase.
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    /// How long to warm up before recording metrics.
    #[serde(deserialize_with = "deserialize_duration")]
    pub warmup: Duration,
    /// Number of worker threads.
    pub threads: usize,
    /// Optional list of CPU cores to pin workers to (e.g., "0-3,6-8").
    pub cpu_list: Option<String>,
}

/// Slab geometry.
#[derive(Deserialize)]
pub struct SlabConfig {
    /// Initial log2 of the per-CPU region size.
    pub shift: u8,
    /// Per-class capacity bound.
    pub capacity: usize,
    /// Use flat virtual CPU ids instead of physical ids.
    #[serde(default)]
    pub virtual_cpu: bool,
}

/// Workload mix. The op weights must sum to at most 100; the remainder
/// goes to cross-CPU shrink.
#[derive(Deserialize)]
pub struct WorkloadConfig {
    /// Number of distinct items circulating through the slab.
    pub items: usize,
    /// Largest batch for the batched operations.
    pub batch_max: usize,
    /// Weight of single push.
    pub push: u32,
    /// Weight of single pop.
    pub pop: u32,
    /// Weight of the batched variants (split evenly push/pop).
    pub batch: u32,
    /// Weight of grow/shrink capacity traffic.
    pub capacity_ops: u32,
    /// Weight of full-CPU drain.
    pub drain: u32,
}

/// Periodic online resize.
#[derive(Deserialize)]
pub struct ResizeConfig {
    pub enabled: bool,
    #[serde(
        default = "default_resize_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,
    pub min_shift: u8,
    pub max_shift: u8,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_resize_interval(),
            min_shift: 14,
            max_shift: 18,
        }
    }
}

fn default_resize_interval() -> Duration {
    Duration::from_millis(500)
}

impl Config {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path).map_err(|e| format!("read {path:?}: {e}"))?;
        let config: Config = toml::from_str(&raw).map_err(|e| format!("parse {path:?}: {e}"))?;

        if config.general.threads == 0 {
            return Err("general.threads must be positive".into());
        }
        if config.workload.items == 0 {
            return Err("workload.items must be positive".into());
        }
        if config.workload.batch_max == 0 {
            return Err("workload.batch_max must be positive".into());
        }
        let weights = config.workload.push
            + config.workload.pop
            + config.workload.batch
            + config.workload.capacity_ops
            + config.workload.drain;
        if weights > 100 {
            return Err("workload op weights must sum to at most 100".into());
        }
        if config.resize.enabled && config.resize.min_shift >= config.resize.max_shift {
            return Err("resize.min_shift must be below resize.max_shift".into());
        }
        Ok(config)
    }
}

/// Parse durations like "500ms", "5s", or "2m".
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Parse a CPU list like "0-3,6,8-10" into explicit ids.
pub fn parse_cpu_list(raw: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().map_err(|_| format!("bad cpu {part:?}"))?;
                let hi: usize = hi.trim().parse().map_err(|_| format!("bad cpu {part:?}"))?;
                if lo > hi {
                    return Err(format!("bad cpu range {part:?}"));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| format!("bad cpu {part:?}"))?),
        }
    }
    Ok(cpus)
}
