//! Color science: camera-linear RGB to ARRI LogC3 / ARRI Wide Gamut.

pub mod logc3;
pub mod lut;
pub mod pipeline;
pub mod primaries;

use std::path::PathBuf;
use thiserror::Error;

pub use lut::CubeLut;
pub use pipeline::ColorPipeline;

/// Errors from `.cube` loading.
#[derive(Debug, Error)]
pub enum LutError {
    #[error("failed to read LUT {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("missing LUT_3D_SIZE")]
    MissingSize,

    #[error("invalid LUT size: expected {expected} rows, got {found}")]
    RowCount { expected: usize, found: usize },

    #[error("LUT syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
}

/// Errors from building or running the color pipeline.
#[derive(Debug, Error)]
pub enum ColorError {
    #[error("singular {0} matrix")]
    SingularMatrix(&'static str),

    #[error("match LUT: {0}")]
    Lut(#[from] LutError),

    #[error("color pipeline expects 3-channel input, got {0}")]
    Channels(usize),
}
