//! 10-bit RGB DPX writer (SMPTE 268M, packing method A).
//!
//! Fixed 2048-byte big-endian header followed by one 32-bit word per pixel:
//! `(R10 << 22) | (G10 << 12) | (B10 << 2)`, row-major.

use std::path::Path;

use chrono::Utc;
use thiserror::Error;

use crate::frame::FloatImage;
use crate::fsutil::write_atomic;

pub const HEADER_SIZE: usize = 2048;
const GENERIC_HEADER_SIZE: u32 = 1664;
const INDUSTRY_HEADER_SIZE: u32 = 384;

pub const DEFAULT_CREATOR: &str = "stopmo-xcode";
pub const DEFAULT_PROJECT: &str = "stopmo-xcode";
pub const DEFAULT_DESCRIPTION: &str = "ARRI LogC3 EI800 + AWG";

/// Errors from DPX serialization.
#[derive(Debug, Error)]
pub enum DpxError {
    #[error("expected 3-channel RGB image, got {0} channels")]
    Channels(usize),

    #[error("image buffer holds {found} samples, expected {expected}")]
    BufferSize { expected: usize, found: usize },

    #[error("image too large for DPX: {width}x{height}")]
    TooLarge { width: usize, height: usize },

    #[error("not a DPX file: {0}")]
    Invalid(String),

    #[error("failed to write DPX: {0}")]
    Io(#[from] std::io::Error),
}

/// Free-text header fields
#[derive(Debug, Clone)]
pub struct DpxText {
    pub filename: String,
    pub creator: String,
    pub project: String,
    pub description: String,
    /// `YYYY:MM:DD:hh:mm:ss+zzzz`
    pub timestamp: String,
}

impl DpxText {
    /// Default creator/project/description stamped with the current UTC time
    pub fn for_file(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            creator: DEFAULT_CREATOR.to_string(),
            project: DEFAULT_PROJECT.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            timestamp: Utc::now().format("%Y:%m:%d:%H:%M:%S%z").to_string(),
        }
    }
}

/// Header fields read back from a DPX file
#[derive(Debug, Clone, PartialEq)]
pub struct DpxHeader {
    pub data_offset: u32,
    pub file_size: u32,
    pub width: u32,
    pub height: u32,
    pub descriptor: u8,
    pub transfer: u8,
    pub bit_depth: u8,
    pub packing: u16,
    pub filename: String,
    pub description: String,
}

fn put_u8(buf: &mut [u8], offset: usize, v: u8) {
    buf[offset] = v;
}

fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
}

fn put_f32(buf: &mut [u8], offset: usize, v: f32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
}

/// ASCII field, truncated to leave room for a NUL terminator, zero padded
fn put_str(buf: &mut [u8], offset: usize, len: usize, s: &str) {
    let ascii: Vec<u8> = s.bytes().filter(|b| b.is_ascii()).take(len - 1).collect();
    let field = &mut buf[offset..offset + len];
    field.fill(0);
    field[..ascii.len()].copy_from_slice(&ascii);
}

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn get_str(buf: &[u8], offset: usize, len: usize) -> String {
    let field = &buf[offset..offset + len];
    let end = field.iter().position(|b| *b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn build_header(width: u32, height: u32, file_size: u32, text: &DpxText) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    let data_offset = HEADER_SIZE as u32;

    // File information
    h[0..4].copy_from_slice(b"SDPX");
    put_u32(&mut h, 4, data_offset);
    put_str(&mut h, 8, 8, "V2.0");
    put_u32(&mut h, 16, file_size);
    put_u32(&mut h, 20, 0); // ditto key
    put_u32(&mut h, 24, GENERIC_HEADER_SIZE);
    put_u32(&mut h, 28, INDUSTRY_HEADER_SIZE);
    put_u32(&mut h, 32, 0); // user data size
    put_str(&mut h, 36, 100, &text.filename);
    put_str(&mut h, 136, 24, &text.timestamp);
    put_str(&mut h, 160, 100, &text.creator);
    put_str(&mut h, 260, 200, &text.project);
    put_str(&mut h, 460, 200, ""); // copyright
    put_u32(&mut h, 660, 0xFFFF_FFFF); // no encryption

    // Image information
    put_u16(&mut h, 768, 0); // orientation
    put_u16(&mut h, 770, 1); // element count
    put_u32(&mut h, 772, width);
    put_u32(&mut h, 776, height);

    // Image element 0
    put_u32(&mut h, 780, 0); // unsigned
    put_u32(&mut h, 784, 0);
    put_f32(&mut h, 788, 0.0);
    put_u32(&mut h, 792, 1023);
    put_f32(&mut h, 796, 1.0);
    put_u8(&mut h, 800, 50); // RGB
    put_u8(&mut h, 801, 2); // logarithmic
    put_u8(&mut h, 802, 1);
    put_u8(&mut h, 803, 10);
    put_u16(&mut h, 804, 1); // method A
    put_u16(&mut h, 806, 0); // no run-length encoding
    put_u32(&mut h, 808, data_offset);
    put_u32(&mut h, 812, 0); // end-of-line padding
    put_u32(&mut h, 816, 0); // end-of-image padding
    put_str(&mut h, 820, 32, &text.description);

    // Television information
    put_u32(&mut h, 1628, 0); // time code
    put_u32(&mut h, 1632, 0); // user bits
    h
}

/// Quantize one sample to a 10-bit code value.
///
/// NaN and -inf map to 0, +inf to 1023; finite values are clamped to [0, 1].
#[inline]
pub fn quantize10(v: f32) -> u32 {
    let v = if v.is_nan() {
        0.0
    } else if v.is_infinite() {
        if v > 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        v.clamp(0.0, 1.0)
    };
    (v * 1023.0).round_ties_even() as u32
}

/// Pack one RGB pixel into a method-A word
#[inline]
pub fn pack_word(rgb: &[f32]) -> u32 {
    (quantize10(rgb[0]) << 22) | (quantize10(rgb[1]) << 12) | (quantize10(rgb[2]) << 2)
}

/// 10-bit code values of a packed word
pub fn unpack_word(word: u32) -> [u16; 3] {
    [
        ((word >> 22) & 0x3FF) as u16,
        ((word >> 12) & 0x3FF) as u16,
        ((word >> 2) & 0x3FF) as u16,
    ]
}

/// Serialize an RGB image to a complete DPX file in memory.
pub fn encode_dpx10(image: &FloatImage, text: &DpxText) -> Result<Vec<u8>, DpxError> {
    if image.channels != 3 {
        return Err(DpxError::Channels(image.channels));
    }
    let expected = image.width * image.height * 3;
    if image.data.len() != expected {
        return Err(DpxError::BufferSize {
            expected,
            found: image.data.len(),
        });
    }

    let too_large = || DpxError::TooLarge {
        width: image.width,
        height: image.height,
    };
    let width = u32::try_from(image.width).map_err(|_| too_large())?;
    let height = u32::try_from(image.height).map_err(|_| too_large())?;
    let total = HEADER_SIZE + image.pixel_count() * 4;
    let file_size = u32::try_from(total).map_err(|_| too_large())?;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&build_header(width, height, file_size, text));
    for px in image.data.chunks_exact(3) {
        out.extend_from_slice(&pack_word(px).to_be_bytes());
    }
    Ok(out)
}

/// Write a LogC3/AWG RGB image as a 10-bit DPX.
///
/// Parent directories are created; the file appears atomically. Returns bytes written.
pub fn write_dpx10(path: &Path, image: &FloatImage, creator: &str) -> Result<u64, DpxError> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut text = DpxText::for_file(&filename);
    text.creator = creator.to_string();
    let bytes = encode_dpx10(image, &text)?;
    write_atomic(path, &bytes)?;
    Ok(bytes.len() as u64)
}

/// Parse the header fields this writer sets
pub fn read_header(bytes: &[u8]) -> Result<DpxHeader, DpxError> {
    if bytes.len() < HEADER_SIZE {
        return Err(DpxError::Invalid(format!("{} byte header", bytes.len())));
    }
    if &bytes[0..4] != b"SDPX" {
        return Err(DpxError::Invalid("bad magic".to_string()));
    }
    Ok(DpxHeader {
        data_offset: get_u32(bytes, 4),
        file_size: get_u32(bytes, 16),
        width: get_u32(bytes, 772),
        height: get_u32(bytes, 776),
        descriptor: bytes[800],
        transfer: bytes[801],
        bit_depth: bytes[803],
        packing: get_u16(bytes, 804),
        filename: get_str(bytes, 36, 100),
        description: get_str(bytes, 820, 32),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_solid_3x2_header_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("A_0001.dpx");
        let image = FloatImage::solid_rgb(3, 2, [0.25, 0.5, 0.75]);

        let written = write_dpx10(&path, &image, DEFAULT_CREATOR).unwrap();
        let bytes = fs::read(&path).unwrap();

        assert_eq!(&bytes[0..4], b"SDPX");
        assert_eq!(written as usize, bytes.len());
        assert_eq!(bytes.len(), HEADER_SIZE + 6 * 4);

        let header = read_header(&bytes).unwrap();
        assert_eq!(header.width, 3);
        assert_eq!(header.height, 2);
        assert_eq!(header.file_size as usize, bytes.len());
        assert_eq!(header.data_offset as usize, HEADER_SIZE);
        assert_eq!(header.descriptor, 50);
        assert_eq!(header.transfer, 2);
        assert_eq!(header.bit_depth, 10);
        assert_eq!(header.packing, 1);
        assert_eq!(header.filename, "A_0001.dpx");
        assert_eq!(header.description, DEFAULT_DESCRIPTION);
        assert_eq!(get_u32(&bytes, 24), 1664);
        assert_eq!(get_u32(&bytes, 28), 384);
        assert_eq!(get_u32(&bytes, 660), 0xFFFF_FFFF);
        assert_eq!(get_u32(&bytes, 792), 1023);
        assert_eq!(f32::from_be_bytes(bytes[796..800].try_into().unwrap()), 1.0);
        assert_eq!(get_str(&bytes, 8, 8), "V2.0");
        assert_eq!(get_str(&bytes, 160, 100), DEFAULT_CREATOR);

        let word = get_u32(&bytes, HEADER_SIZE);
        assert_eq!(unpack_word(word), [256, 512, 767]);
        assert_eq!(word & 0b11, 0);
    }

    #[test]
    fn test_non_finite_and_out_of_range_values() {
        assert_eq!(quantize10(f32::NAN), 0);
        assert_eq!(quantize10(f32::INFINITY), 1023);
        assert_eq!(quantize10(f32::NEG_INFINITY), 0);
        assert_eq!(quantize10(-0.5), 0);
        assert_eq!(quantize10(7.0), 1023);
        assert_eq!(quantize10(1.0), 1023);
        assert_eq!(quantize10(0.0), 0);
    }

    #[test]
    fn test_rejects_non_rgb_image() {
        let image = FloatImage::from_vec(1, 1, 4, vec![0.0; 4]).unwrap();
        assert!(matches!(
            encode_dpx10(&image, &DpxText::for_file("x.dpx")),
            Err(DpxError::Channels(4))
        ));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.dpx");
        assert!(write_dpx10(&path, &image, DEFAULT_CREATOR).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_rejects_short_buffer() {
        let image = FloatImage {
            width: 2,
            height: 2,
            channels: 3,
            data: vec![0.0; 9],
        };
        assert!(matches!(
            encode_dpx10(&image, &DpxText::for_file("x.dpx")),
            Err(DpxError::BufferSize { expected: 12, found: 9 })
        ));
    }

    #[test]
    fn test_long_text_fields_are_truncated_with_terminator() {
        let mut text = DpxText::for_file(&"f".repeat(300));
        text.description = "d".repeat(64);
        let bytes = encode_dpx10(&FloatImage::solid_rgb(1, 1, [0.0; 3]), &text).unwrap();
        assert_eq!(get_str(&bytes, 36, 100).len(), 99);
        assert_eq!(get_str(&bytes, 820, 32).len(), 31);
        assert_eq!(bytes[135], 0);
    }

    #[test]
    fn test_timestamp_format() {
        let text = DpxText::for_file("x.dpx");
        // 2024:03:01:09:59:59+0000
        assert_eq!(text.timestamp.len(), 24);
        assert!(text.timestamp.ends_with("+0000"));
        assert_eq!(text.timestamp.matches(':').count(), 5);
    }

    #[test]
    fn test_read_header_rejects_garbage() {
        assert!(read_header(b"SDPX").is_err());
        assert!(read_header(&[0u8; HEADER_SIZE]).is_err());
    }

    // Packed words keep each channel's code value and zero padding bits
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_pack_word_channels(r in 0.0f32..=1.0, g in 0.0f32..=1.0, b in 0.0f32..=1.0) {
            let word = pack_word(&[r, g, b]);
            prop_assert_eq!(word & 0b11, 0);
            let codes = unpack_word(word);
            prop_assert_eq!(codes[0] as u32, quantize10(r));
            prop_assert_eq!(codes[1] as u32, quantize10(g));
            prop_assert_eq!(codes[2] as u32, quantize10(b));
        }
    }
}
