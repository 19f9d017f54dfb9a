//! Quality-control outputs: the truth-frame pack and the linear debug TIFF.
//!
//! Neither output is ever overwritten once present.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{ImageBuffer, ImageFormat, Rgb, RgbImage};
use thiserror::Error;

use crate::color::logc3;
use crate::frame::FloatImage;
use crate::fsutil::{copy_if_absent, persist, temp_sibling};

#[derive(Debug, Error)]
pub enum QcError {
    #[error("QC io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode QC image: {0}")]
    Image(#[from] image::ImageError),

    #[error("QC image needs 3 channels, got {0}")]
    Channels(usize),

    #[error("QC image dimensions {0}x{1} are out of range")]
    Dimensions(usize, usize),
}

/// Files making up one truth-frame pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruthPack {
    pub dpx: PathBuf,
    pub preview: PathBuf,
}

impl TruthPack {
    pub fn paths(shot_dir: &Path, stem: &str) -> Self {
        let dir = shot_dir.join("truth_frame");
        Self {
            dpx: dir.join(format!("{}_truth_logc_awg.dpx", stem)),
            preview: dir.join(format!("{}_preview_rec709ish.png", stem)),
        }
    }
}

/// `<shot_dir>/debug_linear/<stem>.tiff`
pub fn debug_tiff_path(shot_dir: &Path, stem: &str) -> PathBuf {
    shot_dir.join("debug_linear").join(format!("{}.tiff", stem))
}

fn dims(image: &FloatImage) -> Result<(u32, u32), QcError> {
    if image.channels != 3 {
        return Err(QcError::Channels(image.channels));
    }
    match (u32::try_from(image.width), u32::try_from(image.height)) {
        (Ok(w), Ok(h)) => Ok((w, h)),
        _ => Err(QcError::Dimensions(image.width, image.height)),
    }
}

/// LogC3 -> linear, clip to [0,1], gamma 1/2.2, 8 bit
pub fn preview_value(logc: f32) -> u8 {
    let linear = logc3::decode(logc);
    let clipped = if linear.is_nan() { 0.0 } else { linear.clamp(0.0, 1.0) };
    (clipped.powf(1.0 / 2.2) * 255.0).round_ties_even() as u8
}

/// Tone-mapped 8-bit preview of a LogC3 image
pub fn preview_image(logc: &FloatImage) -> Result<RgbImage, QcError> {
    let (w, h) = dims(logc)?;
    let bytes = logc.data.iter().map(|&v| preview_value(v)).collect();
    RgbImage::from_raw(w, h, bytes).ok_or(QcError::Dimensions(logc.width, logc.height))
}

fn save_atomic<P, C>(
    image: &ImageBuffer<P, C>,
    path: &Path,
    format: ImageFormat,
) -> Result<(), QcError>
where
    P: image::Pixel + image::PixelWithColorType,
    [P::Subpixel]: image::EncodableLayout,
    C: std::ops::Deref<Target = [P::Subpixel]>,
{
    let mut tmp = temp_sibling(path)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        image.write_to(&mut writer, format)?;
        writer.flush()?;
    }
    persist(tmp, path)?;
    Ok(())
}

/// Emit the truth-frame pack for a frame.
///
/// # Arguments
/// * `shot_dir` - shot output root
/// * `stem` - source file stem
/// * `dpx_path` - the DPX just written for this frame
/// * `logc` - the LogC3/AWG image that went into the DPX
pub fn write_truth_pack(
    shot_dir: &Path,
    stem: &str,
    dpx_path: &Path,
    logc: &FloatImage,
) -> Result<TruthPack, QcError> {
    let pack = TruthPack::paths(shot_dir, stem);
    copy_if_absent(dpx_path, &pack.dpx)?;
    if !pack.preview.exists() {
        let preview = preview_image(logc)?;
        save_atomic(&preview, &pack.preview, ImageFormat::Png)?;
    }
    Ok(pack)
}

/// Write linear camera RGB as a 16-bit TIFF, clipped to [0,1].
pub fn write_debug_tiff(path: &Path, linear: &FloatImage) -> Result<(), QcError> {
    let (w, h) = dims(linear)?;
    let samples: Vec<u16> = linear
        .data
        .iter()
        .map(|&v| {
            let v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
            (v * 65535.0).round() as u16
        })
        .collect();
    let buffer: ImageBuffer<Rgb<u16>, Vec<u16>> = ImageBuffer::from_raw(w, h, samples)
        .ok_or(QcError::Dimensions(linear.width, linear.height))?;
    save_atomic(&buffer, path, ImageFormat::Tiff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_preview_value_endpoints() {
        assert_eq!(preview_value(logc3::encode(0.0)), 0);
        assert_eq!(preview_value(logc3::encode(1.0)), 255);
        assert_eq!(preview_value(logc3::encode(4.0)), 255);
        assert_eq!(preview_value(f32::NAN), 0);
        let mid = preview_value(logc3::encode(0.18));
        assert!((115..=120).contains(&mid), "mid grey preview {}", mid);
    }

    #[test]
    fn test_truth_pack_writes_once() {
        let dir = TempDir::new().unwrap();
        let dpx = dir.path().join("A_0001.dpx");
        fs::write(&dpx, b"first dpx").unwrap();
        let logc = FloatImage::solid_rgb(4, 2, [logc3::encode(0.18); 3]);

        let pack = write_truth_pack(dir.path(), "A_0001", &dpx, &logc).unwrap();
        assert_eq!(pack.dpx, dir.path().join("truth_frame/A_0001_truth_logc_awg.dpx"));
        assert_eq!(fs::read(&pack.dpx).unwrap(), b"first dpx");
        let png = image::open(&pack.preview).unwrap().to_rgb8();
        assert_eq!(png.dimensions(), (4, 2));

        fs::write(&dpx, b"second dpx").unwrap();
        write_truth_pack(dir.path(), "A_0001", &dpx, &logc).unwrap();
        assert_eq!(fs::read(&pack.dpx).unwrap(), b"first dpx");
    }

    #[test]
    fn test_debug_tiff_is_16_bit() {
        let dir = TempDir::new().unwrap();
        let path = debug_tiff_path(dir.path(), "A_0001");
        let linear = FloatImage::solid_rgb(3, 3, [0.0, 0.5, 2.0]);
        write_debug_tiff(&path, &linear).unwrap();

        let decoded = image::open(&path).unwrap().to_rgb16();
        let px = decoded.get_pixel(1, 1);
        assert_eq!(px.0[0], 0);
        assert_eq!(px.0[1], 32768);
        assert_eq!(px.0[2], 65535);
    }

    #[test]
    fn test_rejects_non_rgb() {
        let gray = FloatImage::from_vec(2, 2, 1, vec![0.0; 4]).unwrap();
        assert!(matches!(preview_image(&gray), Err(QcError::Channels(1))));
    }
}
