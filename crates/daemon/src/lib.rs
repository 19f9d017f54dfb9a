//! stopmo-xcode
//!
//! Watches a capture tree for stop-motion RAW frames, queues them in a crash-safe SQLite job
//! store and converts each one to a 10-bit LogC3 / ARRI Wide Gamut DPX with sidecars, QC
//! outputs and optional ProRes delivery per shot.

pub mod assemble;
pub mod color;
pub mod concurrency;
pub mod daemon;
pub mod decode;
pub mod dpx;
pub mod exposure;
pub mod frame;
pub mod fsutil;
pub mod jobs;
pub mod operations;
pub mod processor;
pub mod qc;
pub mod runtime;
pub mod scan;
pub mod shot;
pub mod sidecar;
pub mod stability;
pub mod startup;
pub mod status_server;
pub mod store;
pub mod watcher;

pub use stopmo_xcode_config as config;
pub use stopmo_xcode_config::Config;
pub use assemble::{
    convert_dpx_sequences, discover_dpx_sequences, Assembler, AssemblyError, FfmpegAssembler,
};
pub use color::{ColorError, ColorPipeline};
pub use concurrency::{StopFlag, WorkerPlan};
pub use daemon::{Daemon, DaemonError, ServiceSummary};
pub use decode::{DecodeError, Decoder, DecoderRegistry, RawMetadata};
pub use jobs::{Job, JobState};
pub use operations::{OperationError, OperationRegistry, OperationSnapshot, OperationStatus};
pub use processor::{run_worker_loop, transcode_one, JobOutcome, JobProcessor, ProcessError};
pub use startup::{run_startup_checks, StartupError};
pub use status_server::{create_status_router, run_status_server, status_snapshot, ServerError, StatusSnapshot};
pub use store::{JobStore, StoreError};
