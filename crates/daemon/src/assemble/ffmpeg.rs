//! ffmpeg-backed assembler.
//!
//! ProRes 4444 (`prores_ks` profile 4, `yuva444p10le`) from a globbed DPX sequence, and a
//! ProRes 422 HQ review copy rendered through a `lut3d` filter.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::{Assembler, AssemblyError};

/// Runs the `ffmpeg` binary found on `PATH`, or an explicit program.
#[derive(Debug, Clone)]
pub struct FfmpegAssembler {
    program: PathBuf,
}

impl Default for FfmpegAssembler {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
        }
    }
}

impl FfmpegAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Build the LogC3 ProRes 4444 command
///
/// # Arguments
/// * `program` - ffmpeg executable
/// * `dpx_glob` - shell-style glob of the DPX frames
/// * `framerate` - output frame rate
/// * `out_mov` - destination movie, overwritten if present
pub fn build_prores_command(program: &Path, dpx_glob: &str, framerate: u32, out_mov: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-y");
    cmd.arg("-pattern_type").arg("glob");
    cmd.arg("-framerate").arg(framerate.to_string());
    cmd.arg("-i").arg(dpx_glob);
    cmd.arg("-c:v").arg("prores_ks");
    cmd.arg("-profile:v").arg("4");
    cmd.arg("-pix_fmt").arg("yuva444p10le");
    cmd.arg(out_mov);
    cmd
}

/// Build the Rec709 review command
pub fn build_review_command(program: &Path, in_mov: &Path, show_lut: &Path, out_mov: &Path) -> Command {
    let mut filter = OsString::from("lut3d=");
    filter.push(show_lut.as_os_str());

    let mut cmd = Command::new(program);
    cmd.arg("-y");
    cmd.arg("-i").arg(in_mov);
    cmd.arg("-vf").arg(filter);
    cmd.arg("-c:v").arg("prores_ks");
    cmd.arg("-profile:v").arg("3");
    cmd.arg(out_mov);
    cmd
}

fn run(mut cmd: Command, stage: &'static str) -> Result<(), AssemblyError> {
    let output = cmd.output().map_err(|e| match e.kind() {
        ErrorKind::NotFound => {
            AssemblyError::FfmpegMissing(cmd.get_program().to_string_lossy().into_owned())
        }
        _ => AssemblyError::Io(e),
    })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(AssemblyError::Failed {
            stage,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn ensure_parent(path: &Path) -> Result<(), AssemblyError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

impl Assembler for FfmpegAssembler {
    fn assemble_logc_prores(
        &self,
        dpx_glob: &str,
        out_mov: &Path,
        framerate: u32,
    ) -> Result<(), AssemblyError> {
        ensure_parent(out_mov)?;
        run(
            build_prores_command(&self.program, dpx_glob, framerate, out_mov),
            "prores",
        )
    }

    fn assemble_review(
        &self,
        in_mov: &Path,
        out_mov: &Path,
        show_lut: &Path,
    ) -> Result<(), AssemblyError> {
        ensure_parent(out_mov)?;
        run(
            build_review_command(&self.program, in_mov, show_lut, out_mov),
            "review",
        )
    }
}
