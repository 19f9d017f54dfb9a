//! Effective exposure offset for a frame.
//!
//! Without auto modes the shot's locked offset (else the configured base) is used. With any
//! auto mode on, the base offset is always the starting point and each enabled mode adds its
//! own term when the frame carries valid metadata for it.

use crate::config::PipelineConfig;

/// Exposure metadata of one frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameExposure {
    pub iso: Option<f64>,
    pub shutter_s: Option<f64>,
    pub aperture_f: Option<f64>,
}

/// Result of the exposure policy
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureDecision {
    pub offset_stops: f64,
    /// Enabled auto modes that contributed nothing (`iso`, `shutter_s`, `aperture_f`)
    pub missing_terms: Vec<&'static str>,
}

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}

/// `log2(target_ei / iso)`
pub fn iso_term(target_ei: u32, iso: Option<f64>) -> Option<f64> {
    let iso = positive(iso)?;
    (target_ei > 0).then(|| (target_ei as f64 / iso).log2())
}

/// `log2(target_shutter / shutter)`
pub fn shutter_term(target_s: Option<f64>, shutter_s: Option<f64>) -> Option<f64> {
    Some((positive(target_s)? / positive(shutter_s)?).log2())
}

/// `2 * log2(aperture / target_aperture)`
pub fn aperture_term(target_f: Option<f64>, aperture_f: Option<f64>) -> Option<f64> {
    Some(2.0 * (positive(aperture_f)? / positive(target_f)?).log2())
}

/// Decide the exposure offset for a frame.
///
/// # Arguments
/// * `cfg` - pipeline configuration (base offset, auto modes, targets)
/// * `frame` - the frame's capture metadata
/// * `locked_offset` - the shot's locked offset, if settings exist
pub fn effective_exposure_offset(
    cfg: &PipelineConfig,
    frame: &FrameExposure,
    locked_offset: Option<f64>,
) -> ExposureDecision {
    if !cfg.any_auto_exposure() {
        return ExposureDecision {
            offset_stops: locked_offset.unwrap_or(cfg.exposure_offset_stops),
            missing_terms: Vec::new(),
        };
    }

    let mut offset = cfg.exposure_offset_stops;
    let mut missing_terms = Vec::new();
    let terms = [
        (
            cfg.auto_exposure_from_iso,
            "iso",
            iso_term(cfg.target_ei, frame.iso),
        ),
        (
            cfg.auto_exposure_from_shutter,
            "shutter_s",
            shutter_term(cfg.target_shutter_s, frame.shutter_s),
        ),
        (
            cfg.auto_exposure_from_aperture,
            "aperture_f",
            aperture_term(cfg.target_aperture_f, frame.aperture_f),
        ),
    ];
    for (enabled, name, term) in terms {
        if !enabled {
            continue;
        }
        match term {
            Some(stops) => offset += stops,
            None => missing_terms.push(name),
        }
    }

    ExposureDecision {
        offset_stops: offset,
        missing_terms,
    }
}
