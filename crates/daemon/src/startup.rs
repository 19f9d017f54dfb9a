//! Startup checks run before the watch service begins.
//!
//! - Required directories must exist or be creatable (fatal)
//! - The shot regex must compile (fatal)
//! - When shot assembly is enabled, `ffmpeg -version` should run (warning only)

use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ensure_dirs, Config, ConfigError};
use crate::shot::ShotNamer;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to prepare directories: {0}")]
    Dirs(ConfigError),

    #[error("invalid shot regex: {0}")]
    ShotRegex(#[from] regex::Error),

    #[error("ffmpeg unavailable: {0}")]
    Ffmpeg(String),
}

/// Run `<program> -version` and return the first line of its banner
pub fn check_ffmpeg(program: &Path) -> Result<String, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::Ffmpeg(format!(
                "failed to run {} -version; is ffmpeg installed and in PATH? ({})",
                program.display(),
                e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::Ffmpeg(format!(
            "{} -version exited with {}",
            program.display(),
            output.status
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text.lines().next().unwrap_or("").to_string())
}

/// Run all startup checks
///
/// Checks are run in the following order:
/// 1. Directory creation
/// 2. Shot regex compilation
/// 3. `ffmpeg -version`, only when assembly on shot completion is enabled
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    ensure_dirs(cfg).map_err(StartupError::Dirs)?;
    ShotNamer::from_config(&cfg.watch)?;

    if cfg.output.write_prores_on_shot_complete {
        match check_ffmpeg(Path::new("ffmpeg")) {
            Ok(banner) => info!("ffmpeg available: {}", banner),
            Err(e) => warn!("{}; shot assembly will fail until it is installed", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_ffmpeg_program_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = check_ffmpeg(&dir.path().join("no-ffmpeg")).unwrap_err();
        assert!(matches!(err, StartupError::Ffmpeg(_)));
    }

    #[test]
    fn test_startup_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::under_root(dir.path());
        run_startup_checks(&cfg).unwrap();
        assert!(cfg.watch.source_dir.is_dir());
        assert!(cfg.watch.working_dir.is_dir());
        assert!(cfg.watch.output_dir.is_dir());
    }

    #[test]
    fn test_startup_rejects_bad_regex() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::under_root(dir.path());
        cfg.watch.shot_regex = Some("(unclosed".to_string());
        assert!(matches!(
            run_startup_checks(&cfg),
            Err(StartupError::ShotRegex(_))
        ));
    }

    #[test]
    fn test_missing_ffmpeg_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::under_root(dir.path());
        cfg.output.write_prores_on_shot_complete = true;
        // Passes whether or not ffmpeg is installed
        assert!(run_startup_checks(&cfg).is_ok());
    }
}
