//! Long-running control operations.
//!
//! A watch service or a batch DPX conversion started through the [`OperationRegistry`] runs on
//! its own thread. Its runtime record (status, stop flag and progress events) lives in a
//! concurrent map keyed by operation id and is only reachable through registry methods.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::assemble::{convert_dpx_sequences_with_progress, Assembler};
use crate::concurrency::StopFlag;
use crate::config::Config;
use crate::daemon::{Daemon, DaemonError};
use crate::decode::Decoder;
use crate::jobs::utc_now;

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("unknown operation {0}")]
    NotFound(Uuid),

    #[error("failed to start watch: {0}")]
    Daemon(#[from] DaemonError),

    #[error("failed to spawn operation thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Watch,
    Convert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl OperationStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

/// One progress message; `seq` starts at 1 and increases per operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEvent {
    pub seq: u64,
    pub at: String,
    pub message: String,
}

/// Read-only view of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub id: Uuid,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub last_event_seq: u64,
}

#[derive(Debug)]
struct OperationRecord {
    kind: OperationKind,
    status: OperationStatus,
    started_at: String,
    finished_at: Option<String>,
    error: Option<String>,
    stop: StopFlag,
    events: Vec<OperationEvent>,
}

impl OperationRecord {
    fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            status: OperationStatus::Running,
            started_at: utc_now(),
            finished_at: None,
            error: None,
            stop: StopFlag::new(),
            events: Vec::new(),
        }
    }

    fn push(&mut self, message: impl Into<String>) {
        let seq = self.events.len() as u64 + 1;
        self.events.push(OperationEvent {
            seq,
            at: utc_now(),
            message: message.into(),
        });
    }
}

type OperationMap = Arc<DashMap<Uuid, OperationRecord>>;

fn push_event(ops: &OperationMap, id: Uuid, message: impl Into<String>) {
    if let Some(mut record) = ops.get_mut(&id) {
        record.push(message);
    }
}

fn finish(ops: &OperationMap, id: Uuid, status: OperationStatus, error: Option<String>) {
    if let Some(mut record) = ops.get_mut(&id) {
        record.status = status;
        record.finished_at = Some(utc_now());
        record.push(match &error {
            Some(e) => format!("{:?}: {}", status, e),
            None => format!("{:?}", status),
        });
        record.error = error;
    }
}

/// Registry of running and finished operations
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    ops: OperationMap,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, kind: OperationKind) -> (Uuid, StopFlag) {
        let id = Uuid::new_v4();
        let record = OperationRecord::new(kind);
        let stop = record.stop.clone();
        self.ops.insert(id, record);
        (id, stop)
    }

    /// Start the watch service in the background.
    ///
    /// Startup checks run before this returns, so configuration problems surface here rather
    /// than as a failed operation.
    pub fn start_watch(
        &self,
        config: Config,
        decoder: Arc<dyn Decoder>,
        assembler: Arc<dyn Assembler>,
    ) -> Result<Uuid, OperationError> {
        let daemon = Daemon::new(config, decoder, assembler)?;
        let (id, stop) = self.register(OperationKind::Watch);
        let ops = self.ops.clone();

        let spawned = thread::Builder::new()
            .name(format!("op-watch-{}", id.simple()))
            .spawn(move || {
                push_event(&ops, id, format!("watch started with {} workers", daemon.plan().workers));
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        finish(&ops, id, OperationStatus::Failed, Some(e.to_string()));
                        return;
                    }
                };
                match runtime.block_on(daemon.run(stop.clone())) {
                    Ok(summary) => {
                        if summary.inflight_reset > 0 {
                            push_event(
                                &ops,
                                id,
                                format!("reset {} inflight jobs at startup", summary.inflight_reset),
                            );
                        }
                        if summary.workers_abandoned > 0 {
                            push_event(
                                &ops,
                                id,
                                format!("{} workers abandoned at shutdown", summary.workers_abandoned),
                            );
                        }
                        let status = if stop.is_stopped() {
                            OperationStatus::Cancelled
                        } else {
                            OperationStatus::Completed
                        };
                        finish(&ops, id, status, None);
                    }
                    Err(e) => {
                        error!("watch operation {} failed: {}", id, e);
                        finish(&ops, id, OperationStatus::Failed, Some(e.to_string()));
                    }
                }
            });
        if let Err(e) = spawned {
            self.ops.remove(&id);
            return Err(e.into());
        }
        info!("started watch operation {}", id);
        Ok(id)
    }

    /// Convert DPX sequences under `input_root` in the background.
    pub fn start_convert(
        &self,
        assembler: Arc<dyn Assembler>,
        input_root: PathBuf,
        output_root: Option<PathBuf>,
        framerate: u32,
        overwrite: bool,
    ) -> Result<Uuid, OperationError> {
        let (id, stop) = self.register(OperationKind::Convert);
        let ops = self.ops.clone();

        let spawned = thread::Builder::new()
            .name(format!("op-convert-{}", id.simple()))
            .spawn(move || {
                push_event(&ops, id, format!("converting sequences under {}", input_root.display()));
                let result = convert_dpx_sequences_with_progress(
                    assembler.as_ref(),
                    &input_root,
                    output_root.as_deref(),
                    framerate,
                    overwrite,
                    &stop,
                    |seq, out| {
                        push_event(
                            &ops,
                            id,
                            format!(
                                "{} ({} frames) -> {}",
                                seq.sequence_name,
                                seq.frame_count,
                                out.display()
                            ),
                        )
                    },
                );
                match result {
                    Ok(outputs) => {
                        push_event(&ops, id, format!("{} movies written", outputs.len()));
                        let status = if stop.is_stopped() {
                            OperationStatus::Cancelled
                        } else {
                            OperationStatus::Completed
                        };
                        finish(&ops, id, status, None);
                    }
                    Err(e) => finish(&ops, id, OperationStatus::Failed, Some(e.to_string())),
                }
            });
        if let Err(e) = spawned {
            self.ops.remove(&id);
            return Err(e.into());
        }
        info!("started convert operation {}", id);
        Ok(id)
    }

    /// Request cooperative cancellation. Cancelling a finished operation is a no-op.
    pub fn cancel(&self, id: Uuid) -> Result<(), OperationError> {
        let mut record = self.ops.get_mut(&id).ok_or(OperationError::NotFound(id))?;
        if !record.status.is_finished() && !record.stop.is_stopped() {
            record.stop.stop();
            record.push("cancel requested");
        }
        Ok(())
    }

    pub fn snapshot(&self, id: Uuid) -> Result<OperationSnapshot, OperationError> {
        let record = self.ops.get(&id).ok_or(OperationError::NotFound(id))?;
        Ok(OperationSnapshot {
            id,
            kind: record.kind,
            status: record.status,
            started_at: record.started_at.clone(),
            finished_at: record.finished_at.clone(),
            error: record.error.clone(),
            cancel_requested: record.stop.is_stopped(),
            last_event_seq: record.events.len() as u64,
        })
    }

    /// Events with a sequence number greater than `after_seq`
    pub fn events_since(
        &self,
        id: Uuid,
        after_seq: u64,
    ) -> Result<Vec<OperationEvent>, OperationError> {
        let record = self.ops.get(&id).ok_or(OperationError::NotFound(id))?;
        Ok(record
            .events
            .iter()
            .filter(|e| e.seq > after_seq)
            .cloned()
            .collect())
    }

    /// Ids of every known operation
    pub fn ids(&self) -> Vec<Uuid> {
        self.ops.iter().map(|entry| *entry.key()).collect()
    }

    /// Poll until the operation finishes or `timeout` passes; returns the last snapshot.
    pub fn wait(&self, id: Uuid, timeout: Duration) -> Result<OperationSnapshot, OperationError> {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.snapshot(id)?;
            if snapshot.status.is_finished() || Instant::now() >= deadline {
                return Ok(snapshot);
            }
            thread::sleep(Duration::from_millis(25));
        }
    }
}
