//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file or creating directories
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Parsed values are out of range or inconsistent
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Ingest tree, queue database and worker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Directory scanned for incoming camera files
    pub source_dir: PathBuf,
    /// Scratch directory (runtime marker lives here)
    pub working_dir: PathBuf,
    /// Root of the per-shot output tree
    pub output_dir: PathBuf,
    /// SQLite queue database
    pub db_path: PathBuf,
    /// Extensions (with leading dot) picked up by the watcher
    #[serde(default = "default_include_extensions")]
    pub include_extensions: Vec<String>,
    /// Seconds a file must stay unchanged before it is enqueued
    #[serde(default = "default_stable_seconds")]
    pub stable_seconds: f64,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: f64,
    #[serde(default = "default_scan_interval_seconds")]
    pub scan_interval_seconds: f64,
    /// Number of workers (0 = derive from CPU count)
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// Quiet period after the last finished frame before a shot is assembled
    #[serde(default = "default_shot_complete_seconds")]
    pub shot_complete_seconds: f64,
    /// Optional regex; capture group 1 (or the whole match) names the shot
    #[serde(default)]
    pub shot_regex: Option<String>,
    /// Parent folder names that never name a shot
    #[serde(default = "default_generic_parent_dirs")]
    pub generic_parent_dirs: Vec<String>,
    #[serde(default = "default_shot_name")]
    pub default_shot_name: String,
    /// How long shutdown waits for workers to finish their current job
    #[serde(default = "default_worker_join_timeout_seconds")]
    pub worker_join_timeout_seconds: f64,
}

fn default_include_extensions() -> Vec<String> {
    vec![".cr2".to_string(), ".cr3".to_string(), ".raw".to_string()]
}

fn default_stable_seconds() -> f64 {
    3.0
}

fn default_poll_interval_seconds() -> f64 {
    1.0
}

fn default_scan_interval_seconds() -> f64 {
    5.0
}

fn default_max_workers() -> u32 {
    2
}

fn default_shot_complete_seconds() -> f64 {
    30.0
}

fn default_generic_parent_dirs() -> Vec<String> {
    [
        "incoming", "ingest", "capture", "captures", "source", "sources", "raw", "dcim",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_shot_name() -> String {
    "default_shot".to_string()
}

fn default_worker_join_timeout_seconds() -> f64 {
    5.0
}

impl WatchConfig {
    /// Watch settings with every path placed under `root`
    pub fn under_root(root: &Path) -> Self {
        Self {
            source_dir: root.join("incoming"),
            working_dir: root.join("work"),
            output_dir: root.join("out"),
            db_path: root.join("work").join("queue.sqlite3"),
            include_extensions: default_include_extensions(),
            stable_seconds: default_stable_seconds(),
            poll_interval_seconds: default_poll_interval_seconds(),
            scan_interval_seconds: default_scan_interval_seconds(),
            max_workers: default_max_workers(),
            shot_complete_seconds: default_shot_complete_seconds(),
            shot_regex: None,
            generic_parent_dirs: default_generic_parent_dirs(),
            default_shot_name: default_shot_name(),
            worker_join_timeout_seconds: default_worker_join_timeout_seconds(),
        }
    }
}

/// Color pipeline parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Camera RGB -> ACES2065-1 (AP0), row-major
    #[serde(default = "default_camera_matrix")]
    pub camera_to_reference_matrix: [[f64; 3]; 3],
    #[serde(default)]
    pub exposure_offset_stops: f64,
    #[serde(default)]
    pub auto_exposure_from_iso: bool,
    #[serde(default)]
    pub auto_exposure_from_shutter: bool,
    #[serde(default)]
    pub target_shutter_s: Option<f64>,
    #[serde(default)]
    pub auto_exposure_from_aperture: bool,
    #[serde(default)]
    pub target_aperture_f: Option<f64>,
    #[serde(default = "default_contrast")]
    pub contrast: f64,
    /// Linear scene value that stays fixed under contrast
    #[serde(default = "default_contrast_pivot_linear")]
    pub contrast_pivot_linear: f64,
    #[serde(default = "default_true")]
    pub lock_wb_from_first_frame: bool,
    #[serde(default = "default_target_ei")]
    pub target_ei: u32,
    #[serde(default)]
    pub apply_match_lut: bool,
    #[serde(default)]
    pub match_lut_path: Option<PathBuf>,
}

fn default_camera_matrix() -> [[f64; 3]; 3] {
    [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
}

fn default_contrast() -> f64 {
    1.0
}

fn default_contrast_pivot_linear() -> f64 {
    0.18
}

fn default_true() -> bool {
    true
}

fn default_target_ei() -> u32 {
    800
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera_to_reference_matrix: default_camera_matrix(),
            exposure_offset_stops: 0.0,
            auto_exposure_from_iso: false,
            auto_exposure_from_shutter: false,
            target_shutter_s: None,
            auto_exposure_from_aperture: false,
            target_aperture_f: None,
            contrast: default_contrast(),
            contrast_pivot_linear: default_contrast_pivot_linear(),
            lock_wb_from_first_frame: true,
            target_ei: default_target_ei(),
            apply_match_lut: false,
            match_lut_path: None,
        }
    }
}

impl PipelineConfig {
    /// True when any metadata-driven exposure mode is on
    pub fn any_auto_exposure(&self) -> bool {
        self.auto_exposure_from_iso
            || self.auto_exposure_from_shutter
            || self.auto_exposure_from_aperture
    }
}

/// Sidecar, QC and delivery outputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub emit_per_frame_json: bool,
    #[serde(default = "default_true")]
    pub emit_truth_frame_pack: bool,
    #[serde(default = "default_truth_frame_index")]
    pub truth_frame_index: u32,
    #[serde(default)]
    pub write_debug_tiff: bool,
    #[serde(default)]
    pub write_prores_on_shot_complete: bool,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// LogC3/AWG -> Rec709 cube for review copies
    #[serde(default)]
    pub show_lut_rec709_path: Option<PathBuf>,
}

fn default_truth_frame_index() -> u32 {
    1
}

fn default_framerate() -> u32 {
    24
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            emit_per_frame_json: true,
            emit_truth_frame_pack: true,
            truth_frame_index: default_truth_frame_index(),
            write_debug_tiff: false,
            write_prores_on_shot_complete: false,
            framerate: default_framerate(),
            show_lut_rec709_path: None,
        }
    }
}

/// Log filter and optional log file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Read-only status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

fn default_status_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_status_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub watch: WatchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Default configuration with every path under `root`
    pub fn under_root(root: &Path) -> Self {
        Self {
            watch: WatchConfig::under_root(root),
            pipeline: PipelineConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
            status: StatusConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    ///
    /// Relative paths inside the file are resolved against the file's directory.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config = Self::parse_toml(&content)?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.resolve_paths(&base);
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.watch.include_extensions = config
            .watch
            .include_extensions
            .iter()
            .map(|ext| normalize_extension(ext))
            .collect();
        Ok(config)
    }

    /// Make every configured path absolute relative to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.watch.source_dir);
        resolve(&mut self.watch.working_dir);
        resolve(&mut self.watch.output_dir);
        resolve(&mut self.watch.db_path);
        if let Some(p) = self.pipeline.match_lut_path.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.output.show_lut_rec709_path.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.logging.file.as_mut() {
            resolve(p);
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - STOPMO_MAX_WORKERS -> watch.max_workers
    /// - STOPMO_STABLE_SECONDS -> watch.stable_seconds
    /// - STOPMO_LOG_LEVEL -> logging.level
    /// - STOPMO_TARGET_EI -> pipeline.target_ei
    /// - STOPMO_WRITE_PRORES -> output.write_prores_on_shot_complete
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("STOPMO_MAX_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.watch.max_workers = workers;
            }
        }

        if let Ok(val) = env::var("STOPMO_STABLE_SECONDS") {
            if let Ok(secs) = val.parse::<f64>() {
                self.watch.stable_seconds = secs;
            }
        }

        if let Ok(val) = env::var("STOPMO_LOG_LEVEL") {
            if !val.trim().is_empty() {
                self.logging.level = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("STOPMO_TARGET_EI") {
            if let Ok(ei) = val.parse::<u32>() {
                self.pipeline.target_ei = ei;
            }
        }

        if let Ok(val) = env::var("STOPMO_WRITE_PRORES") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.output.write_prores_on_shot_complete = true,
                "false" | "0" | "no" => self.output.write_prores_on_shot_complete = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.watch;
        check_seconds("watch.stable_seconds", w.stable_seconds, true)?;
        check_seconds("watch.poll_interval_seconds", w.poll_interval_seconds, false)?;
        check_seconds("watch.scan_interval_seconds", w.scan_interval_seconds, false)?;
        check_seconds("watch.shot_complete_seconds", w.shot_complete_seconds, true)?;
        check_seconds(
            "watch.worker_join_timeout_seconds",
            w.worker_join_timeout_seconds,
            true,
        )?;
        if w.include_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "watch.include_extensions must not be empty".into(),
            ));
        }

        let p = &self.pipeline;
        if p.camera_to_reference_matrix
            .iter()
            .flatten()
            .any(|v| !v.is_finite())
        {
            return Err(ConfigError::Invalid(
                "pipeline.camera_to_reference_matrix must be finite".into(),
            ));
        }
        if !(p.contrast > 0.0) || !p.contrast.is_finite() {
            return Err(ConfigError::Invalid("pipeline.contrast must be > 0".into()));
        }
        if !(p.contrast_pivot_linear > 0.0) {
            return Err(ConfigError::Invalid(
                "pipeline.contrast_pivot_linear must be > 0".into(),
            ));
        }
        if p.apply_match_lut && p.match_lut_path.is_none() {
            return Err(ConfigError::Invalid(
                "pipeline.apply_match_lut=true requires pipeline.match_lut_path".into(),
            ));
        }

        if self.output.framerate == 0 {
            return Err(ConfigError::Invalid("output.framerate must be > 0".into()));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

/// Lowercase an extension and make sure it carries a leading dot
/// A duration in seconds must be finite and non-negative (or positive when `allow_zero` is false)
fn check_seconds(name: &str, value: f64, allow_zero: bool) -> Result<(), ConfigError> {
    let in_range = if allow_zero { value >= 0.0 } else { value > 0.0 };
    if !value.is_finite() || !in_range {
        let bound = if allow_zero { ">= 0" } else { "> 0" };
        return Err(ConfigError::Invalid(format!(
            "{} must be finite and {}, got {}",
            name, bound, value
        )));
    }
    Ok(())
}

pub fn normalize_extension(ext: &str) -> String {
    let lower = ext.trim().to_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{}", lower)
    }
}

/// Create the directories the service writes into
pub fn ensure_dirs(config: &Config) -> Result<(), ConfigError> {
    fs::create_dir_all(&config.watch.source_dir)?;
    fs::create_dir_all(&config.watch.working_dir)?;
    fs::create_dir_all(&config.watch.output_dir)?;
    if let Some(parent) = config.watch.db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Some(parent) = config.logging.file.as_ref().and_then(|f| f.parent()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
