//! Worker-pool sizing (§5) — how many concurrent message/file workers to
//! run, derived from CPU count, system load, and free-memory ratio.
//!
//! Ported from the original implementation's `get_optimal_thread_count`:
//! a load factor and a memory factor each scale an "effective CPU count",
//! which then multiplies three fixed per-CPU baselines. The platform-
//! specific Darwin multiplier from the original is dropped — the host OS
//! isn't a spec input here, so every platform gets the same formula.

use sysinfo::System;

/// Baselines from the original formula: workers/transfers per effective CPU.
const MSG_WORKERS_PER_CPU: f64 = 3.0;
const FILE_WORKERS_PER_CPU: f64 = 1.5;
const TRANSFERS_PER_CPU: f64 = 2.0;

const MIN_MSG_WORKERS: usize = 5;
const MIN_FILE_WORKERS: usize = 3;
const MIN_TRANSFERS: usize = 4;

const MAX_MSG_WORKERS: usize = 40;
const MAX_FILE_WORKERS: usize = 20;
const MAX_TRANSFERS: usize = 25;

/// Resource snapshot feeding the sizing formula, probed once at startup.
#[derive(Debug, Clone, Copy)]
pub struct SystemResources {
    pub cpu_count: usize,
    pub load_average_one_min: f64,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
}

impl SystemResources {
    /// Probe the host via `sysinfo`. `load_average_one_min` falls back to
    /// `0.0` on platforms where the load average isn't available, which
    /// the formula below treats as "no contention" (load factor of 1.0).
    pub fn probe() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut system = System::new();
        system.refresh_memory();
        let load = System::load_average();

        Self {
            cpu_count,
            load_average_one_min: load.one,
            memory_total_bytes: system.total_memory(),
            memory_available_bytes: system.available_memory(),
        }
    }
}

/// Sizes for the three bounded worker pools described in §5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolSizes {
    pub message_workers: usize,
    pub file_workers: usize,
    pub max_concurrent_transfers: usize,
}

/// Apply the sizing formula to a resource snapshot.
pub fn compute_pool_sizes(resources: SystemResources) -> WorkerPoolSizes {
    let cpu_count = resources.cpu_count.max(1) as f64;

    let load_factor = (1.0 - (resources.load_average_one_min / cpu_count / 2.0)).clamp(0.5, 1.0);

    let memory_factor = if resources.memory_total_bytes > 0 {
        let percent_available =
            resources.memory_available_bytes as f64 / resources.memory_total_bytes as f64;
        (percent_available * 2.0).clamp(0.5, 1.5)
    } else {
        1.0
    };

    let effective_cpu = cpu_count * load_factor * memory_factor;

    let message_workers = ((effective_cpu * MSG_WORKERS_PER_CPU) as usize)
        .max(MIN_MSG_WORKERS)
        .min(MAX_MSG_WORKERS);
    let file_workers = ((effective_cpu * FILE_WORKERS_PER_CPU) as usize)
        .max(MIN_FILE_WORKERS)
        .min(MAX_FILE_WORKERS);
    let max_concurrent_transfers = ((effective_cpu * TRANSFERS_PER_CPU) as usize)
        .max(MIN_TRANSFERS)
        .min(MAX_TRANSFERS);

    WorkerPoolSizes {
        message_workers,
        file_workers,
        max_concurrent_transfers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_single_cpu_hits_the_floor() {
        let resources = SystemResources {
            cpu_count: 1,
            load_average_one_min: 0.0,
            memory_total_bytes: 16_000_000_000,
            memory_available_bytes: 8_000_000_000,
        };
        let sizes = compute_pool_sizes(resources);
        assert_eq!(sizes.message_workers, MIN_MSG_WORKERS);
        assert_eq!(sizes.file_workers, MIN_FILE_WORKERS);
        assert_eq!(sizes.max_concurrent_transfers, MIN_TRANSFERS);
    }

    #[test]
    fn heavily_loaded_many_cpu_host_still_hits_the_ceiling() {
        let resources = SystemResources {
            cpu_count: 64,
            load_average_one_min: 0.0,
            memory_total_bytes: 256_000_000_000,
            memory_available_bytes: 256_000_000_000,
        };
        let sizes = compute_pool_sizes(resources);
        assert_eq!(sizes.message_workers, MAX_MSG_WORKERS);
        assert_eq!(sizes.file_workers, MAX_FILE_WORKERS);
        assert_eq!(sizes.max_concurrent_transfers, MAX_TRANSFERS);
    }

    #[test]
    fn zero_total_memory_falls_back_to_neutral_factor() {
        let resources = SystemResources {
            cpu_count: 4,
            load_average_one_min: 0.0,
            memory_total_bytes: 0,
            memory_available_bytes: 0,
        };
        let sizes = compute_pool_sizes(resources);
        assert!(sizes.message_workers >= MIN_MSG_WORKERS);
    }
}
