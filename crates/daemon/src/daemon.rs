//! Watch service orchestration.
//!
//! Startup runs crash recovery and writes the runtime marker, then starts the claim-loop
//! workers, the shot assembly loop, the optional status server and the source watcher.
//! Raising the stop flag shuts everything down in that order's reverse: watcher first,
//! then workers (joined against a deadline) and the assembly loop, then the marker.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::assemble::{run_assembly_pass, Assembler};
use crate::color::{ColorError, ColorPipeline};
use crate::concurrency::{StopFlag, WorkerPlan};
use crate::config::Config;
use crate::decode::Decoder;
use crate::processor::{run_worker_loop, JobProcessor};
use crate::runtime::{record_shutdown, record_startup, runtime_state_path};
use crate::shot::ShotNamer;
use crate::startup::{run_startup_checks, StartupError};
use crate::status_server::run_status_server;
use crate::store::{JobStore, StoreError};
use crate::watcher::{enqueue_ready, SourceWatcher};

/// Interval between shot assembly passes
pub const ASSEMBLY_INTERVAL: Duration = Duration::from_secs(2);

/// How long the assembly loop is given to finish after stop
pub const ASSEMBLY_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("color pipeline error: {0}")]
    Color(#[from] ColorError),

    #[error("invalid shot regex: {0}")]
    ShotRegex(#[from] regex::Error),

    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
}

/// What happened during one service run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSummary {
    pub inflight_reset: usize,
    pub workers_started: usize,
    /// Workers still busy when the join deadline passed
    pub workers_abandoned: usize,
}

/// Watch service with its collaborators
pub struct Daemon {
    config: Arc<Config>,
    plan: WorkerPlan,
    processor: JobProcessor,
    assembler: Arc<dyn Assembler>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("plan", &self.plan)
            .field("processor", &self.processor)
            .finish()
    }
}

impl Daemon {
    /// Run startup checks and build the service.
    pub fn new(
        config: Config,
        decoder: Arc<dyn Decoder>,
        assembler: Arc<dyn Assembler>,
    ) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config, decoder, assembler)
    }

    /// Build the service without startup checks
    ///
    /// Useful for testing when external tools (ffmpeg) are not available.
    pub fn new_without_checks(
        config: Config,
        decoder: Arc<dyn Decoder>,
        assembler: Arc<dyn Assembler>,
    ) -> Result<Self, DaemonError> {
        let plan = WorkerPlan::derive(&config);
        let config = Arc::new(config);
        let color = Arc::new(ColorPipeline::new(&config.pipeline)?);
        let processor = JobProcessor::with_pipeline(config.clone(), decoder, color);
        Ok(Self {
            config,
            plan,
            processor,
            assembler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plan(&self) -> &WorkerPlan {
        &self.plan
    }

    fn spawn_workers(&self, stop: &StopFlag) -> Result<Vec<JoinHandle<()>>, DaemonError> {
        let mut handles = Vec::new();
        for idx in 0..self.plan.workers.max(1) {
            let worker_id = format!("worker-{}", idx + 1);
            let db_path = self.config.watch.db_path.clone();
            let processor = self.processor.clone();
            let stop = stop.clone();
            let name = worker_id.clone();
            let handle = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || match JobStore::open(&db_path) {
                    Ok(store) => run_worker_loop(&store, &processor, &worker_id, &stop),
                    Err(e) => error!("worker {} could not open store: {}", worker_id, e),
                })
                .map_err(|e| DaemonError::Spawn(name, e))?;
            handles.push(handle);
        }
        Ok(handles)
    }

    fn spawn_assembly_loop(&self, stop: &StopFlag) -> Result<Option<JoinHandle<()>>, DaemonError> {
        if !self.config.output.write_prores_on_shot_complete {
            return Ok(None);
        }
        let config = self.config.clone();
        let assembler = self.assembler.clone();
        let stop = stop.clone();
        let handle = thread::Builder::new()
            .name("assembly".to_string())
            .spawn(move || {
                let store = match JobStore::open(&config.watch.db_path) {
                    Ok(store) => store,
                    Err(e) => {
                        error!("assembly loop could not open store: {}", e);
                        return;
                    }
                };
                info!("shot assembly loop enabled");
                while !stop.is_stopped() {
                    if let Err(e) = run_assembly_pass(&store, assembler.as_ref(), &config) {
                        error!("assembly pass failed: {}", e);
                    }
                    sleep_unless_stopped(&stop, ASSEMBLY_INTERVAL);
                }
            })
            .map_err(|e| DaemonError::Spawn("assembly".to_string(), e))?;
        Ok(Some(handle))
    }

    /// Run the watch service until `stop` is raised.
    pub async fn run(&self, stop: StopFlag) -> Result<ServiceSummary, DaemonError> {
        let watch = &self.config.watch;
        let namer = ShotNamer::from_config(watch)?;
        let store = JobStore::open(&watch.db_path)?;

        let inflight_reset = store.reset_inflight_to_detected()?;
        if inflight_reset > 0 {
            warn!("reset {} inflight jobs to detected after startup", inflight_reset);
        }
        let marker = runtime_state_path(&watch.working_dir);
        if let Err(e) = record_startup(&marker, inflight_reset, &watch.db_path) {
            warn!("failed to write runtime marker {}: {}", marker.display(), e);
        }

        let workers = self.spawn_workers(&stop)?;
        let assembly = self.spawn_assembly_loop(&stop)?;
        let status = self.spawn_status_server(&stop)?;
        info!("watcher started with {} workers", workers.len());

        let mut watcher = SourceWatcher::new(watch);
        watcher
            .run(&stop, |path| enqueue_ready(&store, &namer, path))
            .await;

        // Watcher has returned; make sure every other loop sees the stop too
        stop.stop();
        let workers_started = workers.len();
        let deadline = Duration::try_from_secs_f64(watch.worker_join_timeout_seconds.max(0.0))
            .unwrap_or(Duration::MAX);
        let workers_abandoned = join_with_deadline(workers, deadline).await;
        if workers_abandoned > 0 {
            warn!(
                "{} workers still busy after {:?}; abandoning them",
                workers_abandoned, deadline
            );
        }
        if let Some(handle) = assembly {
            join_with_deadline(vec![handle], ASSEMBLY_JOIN_TIMEOUT).await;
        }
        if let Some(task) = status {
            let _ = task.await;
        }

        if let Err(e) = record_shutdown(&marker) {
            warn!("failed to write runtime marker {}: {}", marker.display(), e);
        }
        store.close()?;
        info!("watch service stopped");

        Ok(ServiceSummary {
            inflight_reset,
            workers_started,
            workers_abandoned,
        })
    }

    fn spawn_status_server(
        &self,
        stop: &StopFlag,
    ) -> Result<Option<tokio::task::JoinHandle<()>>, DaemonError> {
        if !self.config.status.enabled {
            return Ok(None);
        }
        let store = Arc::new(Mutex::new(JobStore::open(&self.config.watch.db_path)?));
        let bind = self.config.status.bind.clone();
        let stop = stop.clone();
        Ok(Some(tokio::spawn(async move {
            if let Err(e) = run_status_server(&bind, store, stop).await {
                error!("status server error: {}", e);
            }
        })))
    }
}

/// Sleep for `total`, waking early once `stop` is raised
pub fn sleep_unless_stopped(stop: &StopFlag, total: Duration) {
    let step = Duration::from_millis(100);
    let started = Instant::now();
    while !stop.is_stopped() {
        let elapsed = started.elapsed();
        if elapsed >= total {
            break;
        }
        thread::sleep(step.min(total - elapsed));
    }
}

/// Join threads until `timeout` passes; returns how many were still running.
///
/// Threads cannot be killed, so stragglers are detached and left to finish their current job.
/// A timeout too large to represent waits for every thread.
pub async fn join_with_deadline(handles: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
    let deadline = Instant::now().checked_add(timeout);
    let mut pending = handles;
    loop {
        let (finished, running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|h| h.is_finished());
        for handle in finished {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        pending = running;
        let expired = deadline.map_or(false, |d| Instant::now() >= d);
        if pending.is_empty() || expired {
            return pending.len();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Paths a finished service leaves behind, for diagnostics
pub fn runtime_marker_for(config: &Config) -> PathBuf {
    runtime_state_path(&config.watch.working_dir)
}
