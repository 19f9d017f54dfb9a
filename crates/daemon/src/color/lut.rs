//! `.cube` 3D lookup tables with trilinear interpolation.

use std::fs;
use std::path::Path;

use super::LutError;

/// Cubic lattice of RGB outputs, red index fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct CubeLut {
    pub size: usize,
    pub domain_min: [f32; 3],
    pub domain_max: [f32; 3],
    table: Vec<[f32; 3]>,
}

fn parse_triplet(parts: &[&str], line_no: usize) -> Result<[f32; 3], LutError> {
    if parts.len() < 3 {
        return Err(LutError::Syntax {
            line: line_no,
            message: "expected three values".to_string(),
        });
    }
    let mut out = [0.0f32; 3];
    for (slot, text) in out.iter_mut().zip(parts) {
        *slot = text.parse::<f32>().map_err(|e| LutError::Syntax {
            line: line_no,
            message: format!("{}: {}", text, e),
        })?;
    }
    Ok(out)
}

/// `size³`, `None` on overflow
fn lattice_len(size: usize) -> Option<usize> {
    size.checked_mul(size)?.checked_mul(size)
}

impl CubeLut {
    /// Build from rows in file order; `None` if the row count is not `size³`.
    pub fn from_rows(
        size: usize,
        domain_min: [f32; 3],
        domain_max: [f32; 3],
        rows: Vec<[f32; 3]>,
    ) -> Option<Self> {
        (size >= 2 && lattice_len(size) == Some(rows.len())).then_some(Self {
            size,
            domain_min,
            domain_max,
            table: rows,
        })
    }

    /// Parse `.cube` text.
    ///
    /// `TITLE` lines, comments and blank lines are skipped; `DOMAIN_MIN`/`DOMAIN_MAX` default
    /// to 0 and 1.
    pub fn parse(text: &str) -> Result<Self, LutError> {
        let mut size: Option<usize> = None;
        let mut domain_min = [0.0f32; 3];
        let mut domain_max = [1.0f32; 3];
        let mut rows = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts[0].to_uppercase().as_str() {
                "TITLE" => continue,
                "LUT_3D_SIZE" => {
                    let n = parts
                        .get(1)
                        .and_then(|v| v.parse::<usize>().ok())
                        .filter(|&n| lattice_len(n).is_some())
                        .ok_or(LutError::Syntax {
                            line: line_no,
                            message: "invalid LUT_3D_SIZE".to_string(),
                        })?;
                    size = Some(n);
                }
                "DOMAIN_MIN" => domain_min = parse_triplet(&parts[1..], line_no)?,
                "DOMAIN_MAX" => domain_max = parse_triplet(&parts[1..], line_no)?,
                _ if parts.len() >= 3 => rows.push(parse_triplet(&parts, line_no)?),
                _ => {}
            }
        }

        let size = size.ok_or(LutError::MissingSize)?;
        let expected = lattice_len(size).ok_or(LutError::MissingSize)?;
        let found = rows.len();
        Self::from_rows(size, domain_min, domain_max, rows)
            .ok_or(LutError::RowCount { expected, found })
    }

    pub fn load(path: &Path) -> Result<Self, LutError> {
        let text = fs::read_to_string(path).map_err(|source| LutError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Identity lattice of the given size over [0, 1]
    pub fn identity(size: usize) -> Self {
        let step = 1.0 / (size.max(2) - 1) as f32;
        let mut table = Vec::with_capacity(size * size * size);
        for b in 0..size {
            for g in 0..size {
                for r in 0..size {
                    table.push([r as f32 * step, g as f32 * step, b as f32 * step]);
                }
            }
        }
        Self {
            size,
            domain_min: [0.0; 3],
            domain_max: [1.0; 3],
            table,
        }
    }

    #[inline]
    fn at(&self, r: usize, g: usize, b: usize) -> [f32; 3] {
        self.table[r + self.size * (g + self.size * b)]
    }

    /// Trilinear lookup of one RGB triple
    pub fn apply_pixel(&self, rgb: [f32; 3]) -> [f32; 3] {
        let n = self.size;
        let mut i0 = [0usize; 3];
        let mut i1 = [0usize; 3];
        let mut f = [0.0f32; 3];
        for c in 0..3 {
            let span = (self.domain_max[c] - self.domain_min[c]).max(1e-6);
            let mut t = (rgb[c] - self.domain_min[c]) / span;
            // NaN lands on the low corner
            t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
            t *= (n - 1) as f32;
            let lo = (t.floor() as usize).min(n - 1);
            i0[c] = lo;
            i1[c] = (lo + 1).min(n - 1);
            f[c] = t - lo as f32;
        }

        let lerp = |a: [f32; 3], b: [f32; 3], t: f32| -> [f32; 3] {
            [
                a[0] * (1.0 - t) + b[0] * t,
                a[1] * (1.0 - t) + b[1] * t,
                a[2] * (1.0 - t) + b[2] * t,
            ]
        };

        let c00 = lerp(self.at(i0[0], i0[1], i0[2]), self.at(i1[0], i0[1], i0[2]), f[0]);
        let c10 = lerp(self.at(i0[0], i1[1], i0[2]), self.at(i1[0], i1[1], i0[2]), f[0]);
        let c01 = lerp(self.at(i0[0], i0[1], i1[2]), self.at(i1[0], i0[1], i1[2]), f[0]);
        let c11 = lerp(self.at(i0[0], i1[1], i1[2]), self.at(i1[0], i1[1], i1[2]), f[0]);

        let c0 = lerp(c00, c10, f[1]);
        let c1 = lerp(c01, c11, f[1]);
        lerp(c0, c1, f[2])
    }

    /// Apply to an interleaved RGB buffer in place
    pub fn apply_slice(&self, rgb: &mut [f32]) {
        for px in rgb.chunks_exact_mut(3) {
            let out = self.apply_pixel([px[0], px[1], px[2]]);
            px.copy_from_slice(&out);
        }
    }
}
