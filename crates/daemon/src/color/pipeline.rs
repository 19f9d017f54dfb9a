//! Deterministic camera-linear -> LogC3/AWG transform.
//!
//! Per pixel: camera matrix to AP0, AP0 -> AWG, exposure gain, optional match LUT,
//! LogC3 encode, optional contrast around a log-space pivot.

use rayon::prelude::*;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::lut::CubeLut;
use super::primaries::{aces_to_awg, from_rows, to_rows};
use super::{logc3, ColorError};
use crate::config::PipelineConfig;
use crate::frame::FloatImage;

/// Stateless color transform built once from pipeline configuration.
#[derive(Debug, Clone)]
pub struct ColorPipeline {
    cfg: PipelineConfig,
    /// AP0->AWG composed with camera->AP0, row-major
    camera_to_awg: [[f32; 3]; 3],
    contrast: f32,
    pivot_logc: f32,
    lut: Option<CubeLut>,
    version_hash: String,
}

impl ColorPipeline {
    /// Build the pipeline, loading the match LUT when enabled.
    pub fn new(cfg: &PipelineConfig) -> Result<Self, ColorError> {
        let lut = match (&cfg.match_lut_path, cfg.apply_match_lut) {
            (Some(path), true) => Some(CubeLut::load(path)?),
            _ => None,
        };
        Self::with_lut(cfg, lut)
    }

    /// Build with an already-loaded LUT (or none), ignoring `match_lut_path`.
    pub fn with_lut(cfg: &PipelineConfig, lut: Option<CubeLut>) -> Result<Self, ColorError> {
        let combined = aces_to_awg()? * from_rows(cfg.camera_to_reference_matrix);
        let rows = to_rows(&combined);
        let mut camera_to_awg = [[0.0f32; 3]; 3];
        for (dst, src) in camera_to_awg.iter_mut().zip(rows.iter()) {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = *s as f32;
            }
        }

        Ok(Self {
            cfg: cfg.clone(),
            camera_to_awg,
            contrast: cfg.contrast as f32,
            pivot_logc: logc3::encode(cfg.contrast_pivot_linear as f32),
            lut,
            version_hash: compute_version_hash(cfg),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Pivot value in LogC3 units
    pub fn pivot_logc(&self) -> f32 {
        self.pivot_logc
    }

    /// Scale the deviation from the pivot by the contrast factor, clamped to [0, 1].
    ///
    /// Identity when contrast is exactly 1.
    #[inline]
    pub fn apply_contrast(&self, logc: f32) -> f32 {
        if self.contrast == 1.0 {
            return logc;
        }
        (self.pivot_logc + (logc - self.pivot_logc) * self.contrast).clamp(0.0, 1.0)
    }

    #[inline]
    fn transform_pixel(&self, rgb: [f32; 3], gain: f32) -> [f32; 3] {
        let m = &self.camera_to_awg;
        let mut awg = [0.0f32; 3];
        for (out, row) in awg.iter_mut().zip(m.iter()) {
            *out = (row[0] * rgb[0] + row[1] * rgb[1] + row[2] * rgb[2]) * gain;
        }
        if let Some(lut) = &self.lut {
            awg = lut.apply_pixel(awg);
        }
        awg.map(|v| self.apply_contrast(logc3::encode(v)))
    }

    /// Transform linear camera RGB to LogC3/AWG.
    ///
    /// # Arguments
    /// * `image` - 3-channel linear camera RGB
    /// * `exposure_offset_stops` - gain applied in AWG linear as `2^stops`
    pub fn transform(
        &self,
        image: &FloatImage,
        exposure_offset_stops: f64,
    ) -> Result<FloatImage, ColorError> {
        if image.channels != 3 {
            return Err(ColorError::Channels(image.channels));
        }
        let gain = 2f64.powf(exposure_offset_stops) as f32;
        let mut out = image.data.clone();
        out.par_chunks_mut(3).for_each(|px| {
            let rgb = self.transform_pixel([px[0], px[1], px[2]], gain);
            px.copy_from_slice(&rgb);
        });
        Ok(FloatImage {
            width: image.width,
            height: image.height,
            channels: 3,
            data: out,
        })
    }

    /// Short digest of every parameter that affects the transform
    pub fn version_hash(&self) -> &str {
        &self.version_hash
    }
}

fn compute_version_hash(cfg: &PipelineConfig) -> String {
    // serde_json objects keep keys sorted, so the digest is order independent
    let payload = json!({
        "camera_to_reference_matrix": cfg.camera_to_reference_matrix,
        "exposure_offset_stops": cfg.exposure_offset_stops,
        "auto_exposure_from_iso": cfg.auto_exposure_from_iso,
        "auto_exposure_from_shutter": cfg.auto_exposure_from_shutter,
        "target_shutter_s": cfg.target_shutter_s,
        "auto_exposure_from_aperture": cfg.auto_exposure_from_aperture,
        "target_aperture_f": cfg.target_aperture_f,
        "contrast": cfg.contrast,
        "contrast_pivot_linear": cfg.contrast_pivot_linear,
        "target_ei": cfg.target_ei,
        "apply_match_lut": cfg.apply_match_lut,
        "match_lut_path": cfg.match_lut_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
    });
    let digest = Sha256::digest(payload.to_string().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}
