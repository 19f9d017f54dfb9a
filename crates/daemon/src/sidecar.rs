//! Per-shot and per-frame JSON sidecars.
//!
//! `manifest.json` sits at the shot root and describes how every DPX in the shot was made.
//! Optional per-frame records live under `frame_json/`. Both are written as pretty JSON with
//! sorted keys and a trailing newline.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::RawMetadata;
use crate::fsutil::write_atomic;

pub const OUTPUT_ENCODING: &str = "ARRI LogC3";
pub const OUTPUT_GAMUT: &str = "ARRI Wide Gamut";

/// Largest denominator used when rendering shutter speeds
pub const SHUTTER_MAX_DENOMINATOR: u128 = 1_000_000;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("failed to write sidecar {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize sidecar: {0}")]
    Json(#[from] serde_json::Error),
}

/// Shot-level processing description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotManifest {
    pub shot_name: String,
    pub target_ei: u32,
    pub output_encoding: String,
    pub output_gamut: String,
    pub locked_wb_multipliers: [f32; 4],
    pub exposure_offset_stops: f64,
    pub pipeline_hash: String,
    pub tool_version: String,
    pub created_at_utc: String,
}

impl ShotManifest {
    /// Manifest for a shot with the fixed LogC3 / AWG output description
    pub fn new(
        shot_name: &str,
        target_ei: u32,
        locked_wb_multipliers: Option<[f32; 4]>,
        exposure_offset_stops: f64,
        pipeline_hash: &str,
        created_at_utc: &str,
    ) -> Self {
        Self {
            shot_name: shot_name.to_string(),
            target_ei,
            output_encoding: OUTPUT_ENCODING.to_string(),
            output_gamut: OUTPUT_GAMUT.to_string(),
            locked_wb_multipliers: locked_wb_multipliers.unwrap_or([1.0; 4]),
            exposure_offset_stops,
            pipeline_hash: pipeline_hash.to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at_utc: created_at_utc.to_string(),
        }
    }
}

/// Capture metadata as it appears in a frame record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub source_path: String,
    pub wb_multipliers: [f32; 4],
    pub as_shot_wb_multipliers: Option<[f32; 4]>,
    pub black_level_per_channel: Option<[u16; 4]>,
    pub white_level: Option<u16>,
    pub cfa_pattern: Option<String>,
    pub iso: Option<f64>,
    /// Shutter speed as an `n/d` fraction
    pub shutter_s: Option<String>,
    pub aperture_f: Option<f64>,
}

impl From<&RawMetadata> for FrameMetadata {
    fn from(meta: &RawMetadata) -> Self {
        Self {
            source_path: meta.source_path.to_string_lossy().into_owned(),
            wb_multipliers: meta.wb_multipliers,
            as_shot_wb_multipliers: meta.as_shot_wb_multipliers,
            black_level_per_channel: meta.black_level_per_channel,
            white_level: meta.white_level,
            cfa_pattern: meta.cfa_pattern.clone(),
            iso: meta.iso,
            shutter_s: meta.shutter_s.and_then(shutter_fraction),
            aperture_f: meta.aperture_f,
        }
    }
}

/// Per-frame provenance record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub shot_name: String,
    pub frame_number: u32,
    pub source_filename: String,
    pub source_sha256: String,
    pub dpx_filename: String,
    pub metadata: FrameMetadata,
}

/// Split a finite positive double into an exact `numerator / 2^k` pair.
fn exact_ratio(value: f64) -> Option<(u128, u128)> {
    let bits = value.to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    if biased == 0 || biased == 0x7ff {
        return None;
    }
    let mantissa = (bits & ((1u64 << 52) - 1)) | (1u64 << 52);
    let exp = biased - 1075;
    if exp >= 0 {
        if exp > 64 {
            return None;
        }
        return Some(((mantissa as u128) << exp, 1));
    }
    let shift = (-exp) as u32;
    if shift > 126 {
        return None;
    }
    let tz = mantissa.trailing_zeros().min(shift);
    Some(((mantissa >> tz) as u128, 1u128 << (shift - tz)))
}

/// Closest fraction to `value` whose denominator does not exceed `max_den`.
///
/// Walks the continued fraction expansion of the exact binary value and picks the nearer of
/// the last convergent and the best semiconvergent.
pub fn limit_denominator(value: f64, max_den: u128) -> Option<(u128, u128)> {
    if !value.is_finite() || value <= 0.0 || max_den == 0 {
        return None;
    }
    let (num, den) = exact_ratio(value)?;
    if den <= max_den {
        return Some((num, den));
    }

    let (mut p0, mut q0, mut p1, mut q1) = (0u128, 1u128, 1u128, 0u128);
    let (mut n, mut d) = (num, den);
    loop {
        let a = n / d;
        let q2 = match a.checked_mul(q1).and_then(|x| x.checked_add(q0)) {
            Some(q2) if q2 <= max_den => q2,
            _ => break,
        };
        let p2 = p0 + a * p1;
        p0 = p1;
        q0 = q1;
        p1 = p2;
        q1 = q2;
        let rem = n - a * d;
        n = d;
        d = rem;
        if d == 0 {
            break;
        }
    }
    if d == 0 {
        return Some((p1, q1));
    }

    let k = (max_den - q0) / q1;
    let (bp, bq) = (p0 + k * p1, q0 + k * q1);
    let err_conv = (p1 as f64 / q1 as f64 - value).abs();
    let err_semi = (bp as f64 / bq as f64 - value).abs();
    if err_conv <= err_semi {
        Some((p1, q1))
    } else {
        Some((bp, bq))
    }
}

/// Shutter seconds as `n/d`, or `None` for non-positive values.
///
/// For example: `0.016666…` -> `1/60`, `2.0` -> `2/1`
pub fn shutter_fraction(seconds: f64) -> Option<String> {
    let (n, d) = limit_denominator(seconds, SHUTTER_MAX_DENOMINATOR)?;
    Some(format!("{}/{}", n, d))
}

/// Pretty JSON with sorted keys and a trailing newline
pub fn to_sorted_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    // serde_json::Value maps are BTreeMaps, so keys come out sorted
    let value = serde_json::to_value(value)?;
    let mut text = serde_json::to_string_pretty(&value)?;
    text.push('\n');
    Ok(text)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SidecarError> {
    let text = to_sorted_json(value)?;
    write_atomic(path, text.as_bytes()).map_err(|source| SidecarError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// `<shot_dir>/manifest.json`
pub fn manifest_path(shot_dir: &Path) -> PathBuf {
    shot_dir.join("manifest.json")
}

/// `<shot_dir>/frame_json/<stem>.json`
pub fn frame_record_path(shot_dir: &Path, stem: &str) -> PathBuf {
    shot_dir.join("frame_json").join(format!("{}.json", stem))
}

/// Write (or rewrite) the shot manifest.
pub fn write_shot_manifest(shot_dir: &Path, manifest: &ShotManifest) -> Result<PathBuf, SidecarError> {
    let path = manifest_path(shot_dir);
    write_json(&path, manifest)?;
    Ok(path)
}

/// Write one frame record.
pub fn write_frame_record(
    shot_dir: &Path,
    stem: &str,
    record: &FrameRecord,
) -> Result<PathBuf, SidecarError> {
    let path = frame_record_path(shot_dir, stem);
    write_json(&path, record)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shutter_fraction_common_speeds() {
        assert_eq!(shutter_fraction(1.0 / 60.0).as_deref(), Some("1/60"));
        assert_eq!(shutter_fraction(1.0 / 8000.0).as_deref(), Some("1/8000"));
        assert_eq!(shutter_fraction(0.5).as_deref(), Some("1/2"));
        assert_eq!(shutter_fraction(2.0).as_deref(), Some("2/1"));
        assert_eq!(shutter_fraction(0.3).as_deref(), Some("3/10"));
        assert_eq!(shutter_fraction(0.0), None);
        assert_eq!(shutter_fraction(-1.0 / 60.0), None);
        assert_eq!(shutter_fraction(f64::NAN), None);
    }

    #[test]
    fn test_limit_denominator_caps_denominator() {
        let (n, d) = limit_denominator(std::f64::consts::PI, 1000).unwrap();
        assert_eq!((n, d), (355, 113));
        let (_, d) = limit_denominator(1e-7, 1_000_000).unwrap();
        assert!(d <= 1_000_000);
    }

    #[test]
    fn test_manifest_json_is_sorted_with_newline() {
        let dir = TempDir::new().unwrap();
        let manifest = ShotManifest::new("SHOT_A", 800, None, 0.5, "abcd", "2026-01-01T00:00:00.000000Z");
        let path = write_shot_manifest(dir.path(), &manifest).unwrap();
        assert_eq!(path, dir.path().join("manifest.json"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("}\n"));
        let created = text.find("\"created_at_utc\"").unwrap();
        let shot = text.find("\"shot_name\"").unwrap();
        let version = text.find("\"tool_version\"").unwrap();
        assert!(created < shot && shot < version);

        let back: ShotManifest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.locked_wb_multipliers, [1.0; 4]);
        assert_eq!(back.output_encoding, "ARRI LogC3");
        assert_eq!(back.output_gamut, "ARRI Wide Gamut");
    }

    #[test]
    fn test_frame_record_renders_shutter_fraction() {
        let dir = TempDir::new().unwrap();
        let mut meta = RawMetadata::bare(Path::new("/in/SHOT_A/SHOT_A_0001.cr3"));
        meta.shutter_s = Some(1.0 / 125.0);
        meta.iso = Some(400.0);
        let record = FrameRecord {
            shot_name: "SHOT_A".to_string(),
            frame_number: 1,
            source_filename: "SHOT_A_0001.cr3".to_string(),
            source_sha256: "00".repeat(32),
            dpx_filename: "SHOT_A_0001.dpx".to_string(),
            metadata: FrameMetadata::from(&meta),
        };
        let path = write_frame_record(dir.path(), "SHOT_A_0001", &record).unwrap();
        assert_eq!(path, dir.path().join("frame_json").join("SHOT_A_0001.json"));

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["metadata"]["shutter_s"], "1/125");
        assert_eq!(value["metadata"]["source_path"], "/in/SHOT_A/SHOT_A_0001.cr3");
        assert_eq!(value["frame_number"], 1);
    }
}
