//! Delivery movie assembly.
//!
//! An [`Assembler`] turns a shot's DPX sequence into a LogC3/AWG ProRes 4444 movie and,
//! when a show LUT is configured, a Rec709 review copy. The shot assembly pass drives it
//! for every shot that has gone quiet.

pub mod batch;
pub mod ffmpeg;

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info};

use crate::config::Config;
use crate::store::JobStore;

pub use batch::{
    convert_dpx_sequences, convert_dpx_sequences_with_progress, discover_dpx_sequences,
    DpxSequence,
};
pub use ffmpeg::FfmpegAssembler;

/// Errors from assembling delivery movies.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("ffmpeg not found ({0}); cannot assemble ProRes")]
    FfmpegMissing(String),

    #[error("ffmpeg {stage} assembly failed: {stderr}")]
    Failed { stage: &'static str, stderr: String },

    #[error(
        "sequence name collision for flat output: {name} from {first} and {second}; \
         rename one sequence prefix or use a separate output directory"
    )]
    SequenceCollision {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("assembly io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces delivery movies from frame sequences.
pub trait Assembler: Send + Sync {
    /// Assemble frames matching `dpx_glob` into a ProRes 4444 movie at `framerate`.
    fn assemble_logc_prores(
        &self,
        dpx_glob: &str,
        out_mov: &Path,
        framerate: u32,
    ) -> Result<(), AssemblyError>;

    /// Render a viewing copy of `in_mov` through a 3D LUT.
    fn assemble_review(
        &self,
        in_mov: &Path,
        out_mov: &Path,
        show_lut: &Path,
    ) -> Result<(), AssemblyError>;
}

pub const HANDOFF_README: &str = "STOPMO-XCODE HANDOFF
====================

Primary plates are ARRI LogC3 EI800 + ARRI Wide Gamut (AWG).
Do not bake a viewing LUT into plate delivery.

Viewing in editorial/review:
1) Interpret image data as LogC3/AWG.
2) Apply show LUT (LogC3/AWG -> Rec709) only for display.

Wire-removal return should stay in LogC3/AWG for final conform.
";

/// Write the editorial handoff notes.
pub fn write_handoff_readme(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, HANDOFF_README)
}

/// Movies produced for one shot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShotDelivery {
    pub logc_mov: PathBuf,
    pub review_mov: Option<PathBuf>,
}

/// `<output_dir>/<shot>/<shot>_logc3_awg_prores4444.mov`
pub fn logc_mov_path(shot_dir: &Path, shot_name: &str) -> PathBuf {
    shot_dir.join(format!("{}_logc3_awg_prores4444.mov", shot_name))
}

/// `<output_dir>/<shot>/<shot>_review_rec709.mov`
pub fn review_mov_path(shot_dir: &Path, shot_name: &str) -> PathBuf {
    shot_dir.join(format!("{}_review_rec709.mov", shot_name))
}

/// Assemble one shot's delivery movies and handoff files.
pub fn assemble_shot(
    assembler: &dyn Assembler,
    config: &Config,
    shot_name: &str,
) -> Result<ShotDelivery, AssemblyError> {
    let shot_dir = config.watch.output_dir.join(shot_name);
    let dpx_glob = shot_dir.join("dpx").join("*.dpx");
    let logc_mov = logc_mov_path(&shot_dir, shot_name);
    assembler.assemble_logc_prores(
        &dpx_glob.to_string_lossy(),
        &logc_mov,
        config.output.framerate,
    )?;

    let review_mov = match config.output.show_lut_rec709_path.as_deref() {
        Some(lut) if lut.exists() => {
            let review = review_mov_path(&shot_dir, shot_name);
            assembler.assemble_review(&logc_mov, &review, lut)?;
            fs::copy(lut, shot_dir.join("show_lut_rec709.cube"))?;
            Some(review)
        }
        _ => None,
    };

    write_handoff_readme(&shot_dir.join("README.txt"))?;
    Ok(ShotDelivery {
        logc_mov,
        review_mov,
    })
}

/// One pass of the assembly loop.
///
/// Every shot that has been quiet for `watch.shot_complete_seconds` is assembled and marked
/// done; failures revert the shot to `pending` so a later pass retries it. Returns the number
/// of shots assembled.
pub fn run_assembly_pass(
    store: &JobStore,
    assembler: &dyn Assembler,
    config: &Config,
) -> Result<usize, crate::store::StoreError> {
    let ready = store.shots_ready_for_assembly(config.watch.shot_complete_seconds)?;
    let mut assembled = 0;
    for shot in ready {
        match assemble_shot(assembler, config, &shot) {
            Ok(delivery) => {
                store.mark_shot_assembly_done(
                    &shot,
                    &delivery.logc_mov,
                    delivery.review_mov.as_deref(),
                )?;
                info!("assembled shot {} -> {}", shot, delivery.logc_mov.display());
                assembled += 1;
            }
            Err(e) => {
                store.mark_shot_assembly_failed(&shot)?;
                error!("shot assembly failed for {}: {}", shot, e);
            }
        }
    }
    Ok(assembled)
}
