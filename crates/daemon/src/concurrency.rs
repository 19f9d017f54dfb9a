//! Worker concurrency planning and cooperative stop signalling.
//!
//! Derives the number of claim-loop workers from configuration and CPU count, and provides
//! the shared stop flag checked by the watcher, the workers and the assembly loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;

/// Worker plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Number of independent claim loops to start
    pub workers: u32,
}

impl WorkerPlan {
    /// Derive a worker plan from configuration
    ///
    /// An explicit non-zero `watch.max_workers` is used unchanged; `0` derives
    /// `clamp(cores / 4, 1, 4)` from the detected core count.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Same as [`WorkerPlan::derive`] with an explicit core count
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let workers = if cfg.watch.max_workers > 0 {
            cfg.watch.max_workers
        } else {
            derive_workers(total_cores)
        };
        Self {
            total_cores,
            workers,
        }
    }
}

/// Derive worker count from core count: a quarter of the cores, between 1 and 4
fn derive_workers(cores: u32) -> u32 {
    (cores / 4).clamp(1, 4)
}

/// Shared cooperative stop signal.
///
/// Cloning shares the underlying flag; once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request every holder of this flag to stop after its current unit of work
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
