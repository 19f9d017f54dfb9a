//! Per-job processing: decode, color transform, DPX write, sidecars, QC.
//!
//! A [`JobProcessor`] drives one leased job from `decoding` to `done` or `failed`. Every
//! failure is caught, classified and recorded on the job; nothing is retried automatically.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::color::{ColorError, ColorPipeline};
use crate::concurrency::StopFlag;
use crate::config::Config;
use crate::decode::{DecodeError, DecodedFrame, Decoder, RawMetadata};
use crate::dpx::{write_dpx10, DpxError, DEFAULT_CREATOR};
use crate::exposure::{effective_exposure_offset, FrameExposure};
use crate::frame::screen_frame;
use crate::fsutil::sha256_file;
use crate::jobs::{utc_now, Job, JobState, ShotSettings};
use crate::qc::{debug_tiff_path, write_debug_tiff, write_truth_pack, QcError};
use crate::shot::ShotNamer;
use crate::sidecar::{
    write_frame_record, write_shot_manifest, FrameMetadata, FrameRecord, ShotManifest, SidecarError,
};
use crate::store::{JobStore, StoreError};

/// As-shot white balance may drift this far from the lock before a warning
pub const WB_DRIFT_TOLERANCE: f32 = 0.15;

/// Fraction of clipped pixels that triggers a warning
pub const CLIP_WARN_FRACTION: f64 = 0.01;

/// Idle sleep between empty lease attempts
pub const IDLE_SLEEP: Duration = Duration::from_millis(250);

/// Worker id used by the single-file debug path
pub const TRANSCODE_ONE_WORKER: &str = "transcode-one";

/// Failures while processing a single job.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("color transform failed: {0}")]
    Color(#[from] ColorError),

    #[error("{0}")]
    Dpx(#[from] DpxError),

    #[error("{0}")]
    Sidecar(#[from] SidecarError),

    #[error("{0}")]
    Qc(#[from] QcError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to hash source: {0}")]
    Io(#[from] std::io::Error),

    #[error("job {job_id} was not in state {expected}")]
    StateConflict { job_id: i64, expected: JobState },

    #[error("invalid shot regex: {0}")]
    ShotRegex(#[from] regex::Error),

    #[error("{0}")]
    Transcode(String),
}

impl ProcessError {
    /// Text recorded as the job's `last_error`.
    pub fn failure_message(&self) -> String {
        match self {
            ProcessError::Decode(DecodeError::MissingDependency(msg)) => {
                format!("missing dependency for decode: {}", msg)
            }
            ProcessError::Decode(e) => e.to_string(),
            other => format!("job failed: {}", other),
        }
    }
}

/// How a processed job ended
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done(PathBuf),
    Failed(String),
}

/// Largest per-channel difference between two white balances
pub fn wb_delta(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

impl From<&RawMetadata> for FrameExposure {
    fn from(meta: &RawMetadata) -> Self {
        Self {
            iso: meta.iso,
            shutter_s: meta.shutter_s,
            aperture_f: meta.aperture_f,
        }
    }
}

fn source_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame".to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs jobs against a decoder and a color pipeline.
#[derive(Clone)]
pub struct JobProcessor {
    config: Arc<Config>,
    decoder: Arc<dyn Decoder>,
    color: Arc<ColorPipeline>,
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("output_dir", &self.config.watch.output_dir)
            .field("pipeline_hash", &self.color.version_hash())
            .finish()
    }
}

impl JobProcessor {
    /// Build a processor, constructing the color pipeline (and match LUT) from `config`.
    pub fn new(config: Arc<Config>, decoder: Arc<dyn Decoder>) -> Result<Self, ColorError> {
        let color = Arc::new(ColorPipeline::new(&config.pipeline)?);
        Ok(Self::with_pipeline(config, decoder, color))
    }

    pub fn with_pipeline(
        config: Arc<Config>,
        decoder: Arc<dyn Decoder>,
        color: Arc<ColorPipeline>,
    ) -> Self {
        Self {
            config,
            decoder,
            color,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process a leased job to a terminal state.
    ///
    /// Processing failures are recorded with `mark_failed` and returned as
    /// [`JobOutcome::Failed`]; only a store failure while recording them is an `Err`.
    pub fn process_job(&self, store: &JobStore, job: &Job) -> Result<JobOutcome, StoreError> {
        info!(job_id = job.id, source = %job.source_path.display(), "processing job");
        match self.run(store, job) {
            Ok(dpx_path) => {
                info!(job_id = job.id, output = %dpx_path.display(), "job done");
                Ok(JobOutcome::Done(dpx_path))
            }
            Err(e) => {
                let message = e.failure_message();
                match &e {
                    ProcessError::Decode(_) => {
                        error!(job_id = job.id, "decode failed: {}", message)
                    }
                    _ => error!(job_id = job.id, "pipeline failed: {}", message),
                }
                store.mark_failed(job.id, &message)?;
                Ok(JobOutcome::Failed(message))
            }
        }
    }

    /// [`JobProcessor::process_job`] with panics caught at the job boundary.
    ///
    /// A panicking decoder or pipeline stage fails only the job it was working on.
    pub fn process_job_guarded(
        &self,
        store: &JobStore,
        job: &Job,
    ) -> Result<JobOutcome, StoreError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.process_job(store, job))) {
            Ok(result) => result,
            Err(payload) => {
                let message = format!("job failed: panic: {}", panic_message(payload.as_ref()));
                error!(job_id = job.id, "{}", message);
                store.mark_failed(job.id, &message)?;
                Ok(JobOutcome::Failed(message))
            }
        }
    }

    fn run(&self, store: &JobStore, job: &Job) -> Result<PathBuf, ProcessError> {
        let pipeline = &self.config.pipeline;
        let source = job.source_path.as_path();

        let mut settings = store.get_shot_settings(&job.shot_name)?;
        let wb_override = if pipeline.lock_wb_from_first_frame {
            settings.as_ref().map(|s| s.wb_multipliers)
        } else {
            None
        };

        let decoded = self.decoder.decode(source, wb_override)?;
        let meta = &decoded.metadata;

        let exposure = effective_exposure_offset(
            pipeline,
            &FrameExposure::from(meta),
            settings.as_ref().map(|s| s.exposure_offset_stops),
        );
        if !exposure.missing_terms.is_empty() {
            warn!(
                "auto exposure metadata missing/invalid for {} ({}); those terms are skipped",
                source.display(),
                exposure.missing_terms.join(", ")
            );
        }

        if pipeline.lock_wb_from_first_frame && settings.is_none() {
            store.set_shot_settings(
                &job.shot_name,
                meta.wb_multipliers,
                exposure.offset_stops,
                source,
            )?;
            settings = store.get_shot_settings(&job.shot_name)?;
        }

        self.screen(job, settings.as_ref(), &decoded);

        if !store.transition(job.id, JobState::Decoding, JobState::Xform, None)? {
            return Err(ProcessError::StateConflict {
                job_id: job.id,
                expected: JobState::Decoding,
            });
        }

        let logc = self
            .color
            .transform(&decoded.linear_camera_rgb, exposure.offset_stops)?;

        if !store.transition(job.id, JobState::Xform, JobState::DpxWrite, None)? {
            return Err(ProcessError::StateConflict {
                job_id: job.id,
                expected: JobState::Xform,
            });
        }

        let output = &self.config.output;
        let shot_dir = self.config.watch.output_dir.join(&job.shot_name);
        let stem = source_stem(source);
        let dpx_path = shot_dir.join("dpx").join(format!("{}.dpx", stem));
        write_dpx10(&dpx_path, &logc, DEFAULT_CREATOR)?;

        if output.write_debug_tiff {
            write_debug_tiff(&debug_tiff_path(&shot_dir, &stem), &decoded.linear_camera_rgb)?;
        }

        let source_sha = sha256_file(source)?;

        let manifest = ShotManifest::new(
            &job.shot_name,
            pipeline.target_ei,
            settings.as_ref().map(|s| s.wb_multipliers),
            exposure.offset_stops,
            self.color.version_hash(),
            &utc_now(),
        );
        write_shot_manifest(&shot_dir, &manifest)?;

        if output.emit_per_frame_json {
            let record = FrameRecord {
                shot_name: job.shot_name.clone(),
                frame_number: job.frame_number,
                source_filename: source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                source_sha256: source_sha.clone(),
                dpx_filename: format!("{}.dpx", stem),
                metadata: FrameMetadata::from(meta),
            };
            write_frame_record(&shot_dir, &stem, &record)?;
        }

        if output.emit_truth_frame_pack && job.frame_number == output.truth_frame_index {
            let pack = write_truth_pack(&shot_dir, &stem, &dpx_path, &logc)?;
            info!(shot = %job.shot_name, preview = %pack.preview.display(), "truth frame pack written");
        }

        store.mark_done(job.id, &dpx_path, Some(&source_sha))?;
        store.mark_shot_frame_done(&job.shot_name)?;
        Ok(dpx_path)
    }

    /// Advisory checks; these only log.
    fn screen(&self, job: &Job, settings: Option<&ShotSettings>, decoded: &DecodedFrame) {
        let name = job
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let (Some(locked), Some(as_shot)) = (settings, decoded.metadata.as_shot_wb_multipliers) {
            let drift = wb_delta(&locked.wb_multipliers, &as_shot);
            if drift > WB_DRIFT_TOLERANCE {
                warn!(
                    "as-shot WB drift detected shot={} frame={} delta={:.4} (lock remains active)",
                    job.shot_name, name, drift
                );
            }
        }

        let screen = screen_frame(&decoded.linear_camera_rgb);
        if screen.non_finite > 0 {
            warn!("{} non-finite samples in decoded frame {}", screen.non_finite, name);
        }
        if screen.clipped_fraction > CLIP_WARN_FRACTION {
            warn!(
                "highlight clipping in {}: {:.2}% of pixels at or above 1.0",
                name,
                screen.clipped_fraction * 100.0
            );
        }
    }
}

/// Lease and process jobs until `stop` is raised.
///
/// Sleeps [`IDLE_SLEEP`] when the queue is empty. A store error while leasing is logged and
/// retried after the same sleep.
pub fn run_worker_loop(store: &JobStore, processor: &JobProcessor, worker_id: &str, stop: &StopFlag) {
    info!("worker {} started", worker_id);
    while !stop.is_stopped() {
        match store.lease_next_job(worker_id) {
            Ok(Some(job)) => {
                if let Err(e) = processor.process_job_guarded(store, &job) {
                    error!("worker {} could not record job {}: {}", worker_id, job.id, e);
                }
            }
            Ok(None) => thread::sleep(IDLE_SLEEP),
            Err(e) => {
                error!("worker {} lease failed: {}", worker_id, e);
                thread::sleep(IDLE_SLEEP);
            }
        }
    }
    info!("worker {} stopped", worker_id);
}

/// Process one file synchronously, outside the watch service.
///
/// The file is force-reset to `detected`, leased as `transcode-one` and processed. Returns
/// the DPX path, or an error carrying the job's final state and error text.
///
/// # Arguments
/// * `config` - service configuration; its queue database records the job
/// * `decoder` - RAW decoder
/// * `input` - source RAW file
/// * `output_dir` - overrides `watch.output_dir` for this call
pub fn transcode_one(
    config: &Config,
    decoder: Arc<dyn Decoder>,
    input: &Path,
    output_dir: Option<&Path>,
) -> Result<PathBuf, ProcessError> {
    let mut config = config.clone();
    if let Some(dir) = output_dir {
        config.watch.output_dir = dir.to_path_buf();
    }
    let namer = ShotNamer::from_config(&config.watch)?;
    let (shot_name, frame_number) = namer.infer(input);

    let store = JobStore::open(&config.watch.db_path)?;
    let processor = JobProcessor::new(Arc::new(config), decoder)?;

    store.force_detected(input, &shot_name, frame_number)?;
    let job = store
        .lease_job_for_source(input, TRANSCODE_ONE_WORKER)?
        .ok_or_else(|| ProcessError::Transcode("unable to lease transcode-one job".to_string()))?;

    processor.process_job(&store, &job)?;

    let row = store.get_job(job.id)?.ok_or_else(|| {
        ProcessError::Transcode("transcode-one finished with no resulting job row".to_string())
    })?;
    if row.state != JobState::Done {
        return Err(ProcessError::Transcode(format!(
            "transcode-one failed with state={} error={}",
            row.state,
            row.last_error.unwrap_or_default()
        )));
    }
    store.get_output_path(row.id)?.ok_or_else(|| {
        ProcessError::Transcode("transcode-one completed but output path is missing".to_string())
    })
}
