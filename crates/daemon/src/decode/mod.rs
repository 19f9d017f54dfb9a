//! RAW decode seam.
//!
//! Workers talk to a [`Decoder`]; the [`DecoderRegistry`] routes each file to the backend
//! for its container family by extension.

pub mod rawloader_backend;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::FloatImage;
use crate::scan::dotted_extension;

pub use rawloader_backend::RawloaderDecoder;

/// Typed decode failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("{0}")]
    UnsupportedFormat(String),

    #[error("{0}")]
    MissingDependency(String),

    #[error("{0}")]
    Decode(String),
}

/// Capture metadata that travels with a decoded frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMetadata {
    pub source_path: PathBuf,
    /// White balance actually applied (R, G, B, G2)
    pub wb_multipliers: [f32; 4],
    pub as_shot_wb_multipliers: Option<[f32; 4]>,
    pub black_level_per_channel: Option<[u16; 4]>,
    pub white_level: Option<u16>,
    pub cfa_pattern: Option<String>,
    pub iso: Option<f64>,
    pub shutter_s: Option<f64>,
    pub aperture_f: Option<f64>,
}

impl RawMetadata {
    /// Metadata with neutral white balance and nothing else known
    pub fn bare(source_path: &Path) -> Self {
        Self {
            source_path: source_path.to_path_buf(),
            wb_multipliers: [1.0; 4],
            as_shot_wb_multipliers: None,
            black_level_per_channel: None,
            white_level: None,
            cfa_pattern: None,
            iso: None,
            shutter_s: None,
            aperture_f: None,
        }
    }
}

/// Linear camera RGB plus metadata, owned by the worker for one job.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub linear_camera_rgb: FloatImage,
    pub metadata: RawMetadata,
}

/// Decodes one RAW file to linear camera RGB.
///
/// `wb_override` replaces the as-shot white balance when present.
pub trait Decoder: Send + Sync {
    fn decode(&self, path: &Path, wb_override: Option<[f32; 4]>) -> Result<DecodedFrame, DecodeError>;
}

/// Container families with a dedicated backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatFamily {
    /// Canon CR2/CR3
    Canon,
    /// Dragonframe `.raw` captures
    Dragonframe,
}

impl FormatFamily {
    pub fn for_path(path: &Path) -> Option<Self> {
        match dotted_extension(path)?.as_str() {
            ".cr2" | ".cr3" => Some(FormatFamily::Canon),
            ".raw" => Some(FormatFamily::Dragonframe),
            _ => None,
        }
    }
}

/// Fallback wrapper for Dragonframe `.raw` files.
///
/// Tries the wrapped decoder and reports any failure as an unsupported format.
#[derive(Debug, Clone, Default)]
pub struct DragonframeDecoder<D> {
    inner: D,
}

impl<D: Decoder> DragonframeDecoder<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

impl<D: Decoder> Decoder for DragonframeDecoder<D> {
    fn decode(&self, path: &Path, wb_override: Option<[f32; 4]>) -> Result<DecodedFrame, DecodeError> {
        self.inner.decode(path, wb_override).map_err(|e| {
            DecodeError::UnsupportedFormat(format!(
                "Dragonframe .RAW decode is not supported for this file: {} ({})",
                path.display(),
                e
            ))
        })
    }
}

/// Routes files to a backend by extension.
#[derive(Debug, Clone, Default)]
pub struct DecoderRegistry {
    canon: RawloaderDecoder,
    dragonframe: DragonframeDecoder<RawloaderDecoder>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for DecoderRegistry {
    fn decode(&self, path: &Path, wb_override: Option<[f32; 4]>) -> Result<DecodedFrame, DecodeError> {
        match FormatFamily::for_path(path) {
            Some(FormatFamily::Canon) => self.canon.decode(path, wb_override),
            Some(FormatFamily::Dragonframe) => self.dragonframe.decode(path, wb_override),
            None => Err(DecodeError::UnsupportedFormat(format!(
                "unsupported extension {} for {}",
                dotted_extension(path).unwrap_or_default(),
                path.display()
            ))),
        }
    }
}
