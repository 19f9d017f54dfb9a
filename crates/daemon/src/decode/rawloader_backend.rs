//! rawloader-backed decoder.
//!
//! No demosaic: each 2x2 Bayer cell is binned into one linear RGB pixel (half resolution),
//! after black/white normalization, with white balance applied per channel. ISO, shutter and
//! aperture come from the file's EXIF block when it has one.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rayon::prelude::*;

use super::{DecodeError, DecodedFrame, Decoder, RawMetadata};
use crate::frame::FloatImage;

/// Sensor samples as stored by the camera
#[derive(Debug, Clone, Copy)]
pub enum Samples<'a> {
    Integer(&'a [u16]),
    Float(&'a [f32]),
}

impl Samples<'_> {
    #[inline]
    fn get(&self, idx: usize) -> f32 {
        match self {
            Samples::Integer(v) => v[idx] as f32,
            Samples::Float(v) => v[idx],
        }
    }

    fn len(&self) -> usize {
        match self {
            Samples::Integer(v) => v.len(),
            Samples::Float(v) => v.len(),
        }
    }
}

/// Single-channel Bayer mosaic with its normalization levels.
#[derive(Debug, Clone)]
pub struct BayerPlane<'a> {
    pub width: usize,
    pub height: usize,
    pub samples: Samples<'a>,
    /// Per CFA color (R, G, B, G2)
    pub black: [f32; 4],
    pub white: [f32; 4],
    /// CFA color index at (row % 2, col % 2) relative to the crop origin
    pub pattern: [[usize; 2]; 2],
    /// Active area as (top, right, bottom, left) margins
    pub crop: [usize; 4],
}

/// Normalize white balance so green is 1; a missing second green copies the first
pub fn normalize_wb(wb: [f32; 4]) -> [f32; 4] {
    let valid = |v: f32| v.is_finite() && v > 0.0;
    if !valid(wb[0]) || !valid(wb[1]) || !valid(wb[2]) {
        return [1.0; 4];
    }
    let g = wb[1];
    let g2 = if valid(wb[3]) { wb[3] } else { wb[1] };
    [wb[0] / g, 1.0, wb[2] / g, g2 / g]
}

/// Bin every 2x2 cell of the mosaic into one linear RGB pixel.
///
/// Greens are averaged; the second green uses its own gain. Normalized samples are clipped
/// to [0, 1] before white balance.
pub fn bin_bayer(plane: &BayerPlane<'_>, wb: [f32; 4]) -> Result<FloatImage, DecodeError> {
    let [top, right, bottom, left] = plane.crop;
    if plane.samples.len() < plane.width * plane.height {
        return Err(DecodeError::Decode(format!(
            "sensor buffer holds {} samples, expected {}",
            plane.samples.len(),
            plane.width * plane.height
        )));
    }
    let active_w = plane.width.saturating_sub(left + right);
    let active_h = plane.height.saturating_sub(top + bottom);
    let out_w = active_w / 2;
    let out_h = active_h / 2;
    if out_w == 0 || out_h == 0 {
        return Err(DecodeError::Decode(format!(
            "active sensor area too small: {}x{}",
            active_w, active_h
        )));
    }

    let gains = [wb[0], wb[1], wb[2], wb[3]];
    let mut data = vec![0.0f32; out_w * out_h * 3];
    data.par_chunks_mut(out_w * 3)
        .enumerate()
        .for_each(|(oy, row)| {
            for ox in 0..out_w {
                let mut sum = [0.0f32; 3];
                let mut count = [0u32; 3];
                for dy in 0..2 {
                    for dx in 0..2 {
                        let y = top + oy * 2 + dy;
                        let x = left + ox * 2 + dx;
                        let color = plane.pattern[dy][dx].min(3);
                        let raw = plane.samples.get(y * plane.width + x);
                        let range = (plane.white[color] - plane.black[color]).max(1.0);
                        let v = ((raw - plane.black[color]) / range).clamp(0.0, 1.0) * gains[color];
                        let channel = if color == 3 { 1 } else { color };
                        sum[channel] += v;
                        count[channel] += 1;
                    }
                }
                for c in 0..3 {
                    row[ox * 3 + c] = if count[c] > 0 { sum[c] / count[c] as f32 } else { 0.0 };
                }
            }
        });

    Ok(FloatImage {
        width: out_w,
        height: out_h,
        channels: 3,
        data,
    })
}

/// Capture settings read from EXIF
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExifExposure {
    pub iso: Option<f64>,
    pub shutter_s: Option<f64>,
    pub aperture_f: Option<f64>,
}

/// Read ISO, exposure time and f-number; files without an EXIF block yield all `None`.
pub fn read_exif_exposure(path: &Path) -> ExifExposure {
    let Ok(file) = File::open(path) else {
        return ExifExposure::default();
    };
    let mut reader = BufReader::new(file);
    let Ok(exif_data) = exif::Reader::new().read_from_container(&mut reader) else {
        return ExifExposure::default();
    };

    let get_rational = |tag: exif::Tag| -> Option<f64> {
        exif_data
            .get_field(tag, exif::In::PRIMARY)
            .and_then(|f| match f.value {
                exif::Value::Rational(ref v) if !v.is_empty() => Some(v[0].to_f64()),
                _ => None,
            })
            .filter(|v| v.is_finite() && *v > 0.0)
    };
    let get_u32 = |tag: exif::Tag| -> Option<f64> {
        exif_data
            .get_field(tag, exif::In::PRIMARY)
            .and_then(|f| match f.value {
                exif::Value::Short(ref v) if !v.is_empty() => Some(v[0] as f64),
                exif::Value::Long(ref v) if !v.is_empty() => Some(v[0] as f64),
                _ => None,
            })
            .filter(|v| *v > 0.0)
    };

    ExifExposure {
        iso: get_u32(exif::Tag::PhotographicSensitivity),
        shutter_s: get_rational(exif::Tag::ExposureTime),
        aperture_f: get_rational(exif::Tag::FNumber),
    }
}

/// Decoder for any container rawloader understands (CR2, CR3 and many more).
#[derive(Debug, Clone, Default)]
pub struct RawloaderDecoder;

impl RawloaderDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for RawloaderDecoder {
    fn decode(&self, path: &Path, wb_override: Option<[f32; 4]>) -> Result<DecodedFrame, DecodeError> {
        if !path.exists() {
            return Err(DecodeError::Decode(format!(
                "decode failed for {}: file not found",
                path.display()
            )));
        }
        let raw = rawloader::decode_file(path).map_err(|e| {
            DecodeError::Decode(format!("decode failed for {}: {:?}", path.display(), e))
        })?;

        let as_shot = normalize_wb(raw.wb_coeffs);
        let wb = wb_override.map(normalize_wb).unwrap_or(as_shot);

        let samples = match &raw.data {
            rawloader::RawImageData::Integer(v) => Samples::Integer(v),
            rawloader::RawImageData::Float(v) => Samples::Float(v),
        };

        let linear = if raw.cpp == 3 {
            // Already RGB (linear DNG and friends): normalize and apply gains directly
            let black = raw.blacklevels[0] as f32;
            let range = (raw.whitelevels[0] as f32 - black).max(1.0);
            let count = raw.width * raw.height * 3;
            if samples.len() < count {
                return Err(DecodeError::Decode(format!(
                    "decode failed for {}: short RGB buffer",
                    path.display()
                )));
            }
            let data = (0..count)
                .map(|i| ((samples.get(i) - black) / range).clamp(0.0, 1.0) * wb[i % 3])
                .collect();
            FloatImage {
                width: raw.width,
                height: raw.height,
                channels: 3,
                data,
            }
        } else {
            let [top, _, _, left] = raw.crops;
            let mut pattern = [[0usize; 2]; 2];
            for (dy, row) in pattern.iter_mut().enumerate() {
                for (dx, cell) in row.iter_mut().enumerate() {
                    *cell = raw.cfa.color_at(top + dy, left + dx);
                }
            }
            let plane = BayerPlane {
                width: raw.width,
                height: raw.height,
                samples,
                black: raw.blacklevels.map(|v| v as f32),
                white: raw.whitelevels.map(|v| v as f32),
                pattern,
                crop: raw.crops,
            };
            bin_bayer(&plane, wb).map_err(|e| {
                DecodeError::Decode(format!("decode failed for {}: {}", path.display(), e))
            })?
        };

        let exposure = read_exif_exposure(path);
        let metadata = RawMetadata {
            source_path: path.to_path_buf(),
            wb_multipliers: wb,
            as_shot_wb_multipliers: Some(as_shot),
            black_level_per_channel: Some(raw.blacklevels),
            white_level: Some(raw.whitelevels[0]),
            cfa_pattern: Some(raw.cfa.name.clone()),
            iso: exposure.iso,
            shutter_s: exposure.shutter_s,
            aperture_f: exposure.aperture_f,
        };

        Ok(DecodedFrame {
            linear_camera_rgb: linear,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// RGGB mosaic where every cell holds the same four values
    fn rggb_plane(samples: &[u16], width: usize, height: usize) -> BayerPlane<'_> {
        BayerPlane {
            width,
            height,
            samples: Samples::Integer(samples),
            black: [100.0; 4],
            white: [1100.0; 4],
            pattern: [[0, 1], [3, 2]],
            crop: [0, 0, 0, 0],
        }
    }

    fn tile(r: u16, g: u16, g2: u16, b: u16, width: usize, height: usize) -> Vec<u16> {
        let mut data = vec![0u16; width * height];
        for y in 0..height {
            for x in 0..width {
                data[y * width + x] = match (y % 2, x % 2) {
                    (0, 0) => r,
                    (0, 1) => g,
                    (1, 0) => g2,
                    _ => b,
                };
            }
        }
        data
    }

    #[test]
    fn test_bin_bayer_normalizes_and_averages_greens() {
        let data = tile(600, 300, 500, 1100, 4, 4);
        let img = bin_bayer(&rggb_plane(&data, 4, 4), [1.0; 4]).unwrap();
        assert_eq!((img.width, img.height, img.channels), (2, 2, 3));
        for px in img.data.chunks_exact(3) {
            assert!((px[0] - 0.5).abs() < 1e-6);
            assert!((px[1] - 0.3).abs() < 1e-6);
            assert!((px[2] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_bin_bayer_applies_white_balance_and_clips_before_gain() {
        // Below black clips to 0, above white clips to 1 before the gain
        let data = tile(50, 600, 600, 5000, 2, 2);
        let img = bin_bayer(&rggb_plane(&data, 2, 2), [2.0, 1.0, 1.5, 1.0]).unwrap();
        assert_eq!(img.data, vec![0.0, 0.5, 1.5]);
    }

    #[test]
    fn test_bin_bayer_respects_crop_and_rejects_tiny_area() {
        let data = tile(600, 600, 600, 600, 6, 6);
        let mut plane = rggb_plane(&data, 6, 6);
        plane.crop = [2, 0, 0, 2];
        let img = bin_bayer(&plane, [1.0; 4]).unwrap();
        assert_eq!((img.width, img.height), (2, 2));

        plane.crop = [5, 0, 0, 0];
        assert!(bin_bayer(&plane, [1.0; 4]).is_err());
    }

    #[test]
    fn test_bin_bayer_rejects_short_buffer() {
        let data = vec![0u16; 3];
        assert!(bin_bayer(&rggb_plane(&data, 2, 2), [1.0; 4]).is_err());
    }

    #[test]
    fn test_normalize_wb() {
        assert_eq!(normalize_wb([2.0, 1.0, 1.5, 1.0]), [2.0, 1.0, 1.5, 1.0]);
        assert_eq!(normalize_wb([4.0, 2.0, 3.0, f32::NAN]), [2.0, 1.0, 1.5, 1.0]);
        assert_eq!(normalize_wb([0.0, 0.0, 0.0, 0.0]), [1.0; 4]);
    }

    #[test]
    fn test_exif_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.cr2");
        std::fs::write(&path, b"no exif here").unwrap();
        assert_eq!(read_exif_exposure(&path), ExifExposure::default());
        assert_eq!(
            read_exif_exposure(&dir.path().join("missing.cr2")),
            ExifExposure::default()
        );
    }

    #[test]
    fn test_missing_file_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let err = RawloaderDecoder::new()
            .decode(&dir.path().join("gone.cr3"), None)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Decode(_)));
    }
}
