//! Interleaved floating-point image buffer shared by decode, color and writers.

/// Row-major interleaved `f32` image.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatImage {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: Vec<f32>,
}

impl FloatImage {
    /// Wrap an existing buffer; `None` if its length does not match the dimensions.
    pub fn from_vec(width: usize, height: usize, channels: usize, data: Vec<f32>) -> Option<Self> {
        (data.len() == width * height * channels).then_some(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// RGB image with every pixel set to `rgb`
    pub fn solid_rgb(width: usize, height: usize, rgb: [f32; 3]) -> Self {
        let mut data = Vec::with_capacity(width * height * 3);
        for _ in 0..width * height {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            channels: 3,
            data,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    pub fn pixel(&self, x: usize, y: usize) -> &[f32] {
        let start = (y * self.width + x) * self.channels;
        &self.data[start..start + self.channels]
    }
}

/// Advisory screening results for a decoded buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameScreen {
    pub non_finite: usize,
    /// Fraction of pixels with any channel at or above 1.0
    pub clipped_fraction: f64,
}

/// Count non-finite samples and the fraction of clipped pixels.
pub fn screen_frame(image: &FloatImage) -> FrameScreen {
    let non_finite = image.data.iter().filter(|v| !v.is_finite()).count();
    let pixels = image.pixel_count();
    let clipped = image
        .data
        .chunks_exact(image.channels.max(1))
        .filter(|px| px.iter().any(|v| *v >= 1.0))
        .count();
    FrameScreen {
        non_finite,
        clipped_fraction: if pixels == 0 {
            0.0
        } else {
            clipped as f64 / pixels as f64
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(FloatImage::from_vec(2, 2, 3, vec![0.0; 12]).is_some());
        assert!(FloatImage::from_vec(2, 2, 3, vec![0.0; 11]).is_none());
    }

    #[test]
    fn test_pixel_access() {
        let mut img = FloatImage::solid_rgb(3, 2, [0.1, 0.2, 0.3]);
        img.data[(1 * 3 + 2) * 3] = 0.9;
        assert_eq!(img.pixel(2, 1), &[0.9, 0.2, 0.3]);
        assert_eq!(img.pixel(0, 0), &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_screen_frame_counts() {
        let mut img = FloatImage::solid_rgb(10, 10, [0.5, 0.5, 0.5]);
        img.data[0] = f32::NAN;
        img.data[4] = f32::INFINITY; // pixel 1 green
        img.data[30] = 1.0; // pixel 10 red
        let screen = screen_frame(&img);
        assert_eq!(screen.non_finite, 2);
        // the +inf pixel and the 1.0 pixel
        assert!((screen.clipped_fraction - 0.02).abs() < 1e-12);
    }
}
