//! Gamut matrices: ACES AP0 and ARRI Wide Gamut, Bradford chromatic adaptation.

use cgmath::{Matrix3, SquareMatrix, Vector3};

use super::ColorError;

/// Chromaticity coordinates of a gamut's primaries and white point
#[derive(Debug, Clone, Copy)]
pub struct Gamut {
    pub red: (f64, f64),
    pub green: (f64, f64),
    pub blue: (f64, f64),
    pub white: (f64, f64),
}

pub const AP0: Gamut = Gamut {
    red: (0.7347, 0.2653),
    green: (0.0, 1.0),
    blue: (0.0001, -0.0770),
    white: (0.32168, 0.33767),
};

/// ARRI Wide Gamut (D65 white)
pub const AWG: Gamut = Gamut {
    red: (0.6840, 0.3130),
    green: (0.2210, 0.8480),
    blue: (0.0861, -0.1020),
    white: (0.3127, 0.3290),
};

/// Row-major Bradford cone response matrix
const BRADFORD: [[f64; 3]; 3] = [
    [0.8951, 0.2664, -0.1614],
    [-0.7502, 1.7135, 0.0367],
    [0.0389, -0.0685, 1.0296],
];

/// Build a cgmath matrix from row-major data (cgmath stores columns)
pub fn from_rows(r: [[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::from_cols(
        Vector3::new(r[0][0], r[1][0], r[2][0]),
        Vector3::new(r[0][1], r[1][1], r[2][1]),
        Vector3::new(r[0][2], r[1][2], r[2][2]),
    )
}

/// Row-major copy of a cgmath matrix
pub fn to_rows(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [
        [m.x.x, m.y.x, m.z.x],
        [m.x.y, m.y.y, m.z.y],
        [m.x.z, m.y.z, m.z.z],
    ]
}

fn xy_to_xyz((x, y): (f64, f64)) -> Vector3<f64> {
    Vector3::new(x / y, 1.0, (1.0 - x - y) / y)
}

fn invert(m: Matrix3<f64>, what: &'static str) -> Result<Matrix3<f64>, ColorError> {
    m.invert().ok_or(ColorError::SingularMatrix(what))
}

/// Linear RGB -> CIE XYZ for a gamut, normalized so white has Y = 1
pub fn rgb_to_xyz(gamut: &Gamut) -> Result<Matrix3<f64>, ColorError> {
    let m = Matrix3::from_cols(
        xy_to_xyz(gamut.red),
        xy_to_xyz(gamut.green),
        xy_to_xyz(gamut.blue),
    );
    let scale = invert(m, "primaries")? * xy_to_xyz(gamut.white);
    Ok(m * Matrix3::from_diagonal(scale))
}

/// Bradford adaptation of XYZ from one white point to another
pub fn bradford(src_white: (f64, f64), dst_white: (f64, f64)) -> Result<Matrix3<f64>, ColorError> {
    let m = from_rows(BRADFORD);
    let src = m * xy_to_xyz(src_white);
    let dst = m * xy_to_xyz(dst_white);
    let gain = Matrix3::from_diagonal(Vector3::new(dst.x / src.x, dst.y / src.y, dst.z / src.z));
    Ok(invert(m, "bradford")? * gain * m)
}

/// AP0 linear -> AWG linear: `XYZ_to_AWG * Bradford(AP0 white -> AWG white) * AP0_to_XYZ`
pub fn aces_to_awg() -> Result<Matrix3<f64>, ColorError> {
    let ap0_to_xyz = rgb_to_xyz(&AP0)?;
    let xyz_to_awg = invert(rgb_to_xyz(&AWG)?, "awg")?;
    let adapt = bradford(AP0.white, AWG.white)?;
    Ok(xyz_to_awg * adapt * ap0_to_xyz)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_row_major_round_trip() {
        let rows = [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 10.0]];
        let m = from_rows(rows);
        assert_eq!(to_rows(&m), rows);
        // row 0 dotted with (1, 0, 0) is the first column entry of row 0
        let v = m * Vector3::new(1.0, 0.0, 0.0);
        assert_eq!((v.x, v.y, v.z), (1.0, 4.0, 7.0));
    }

    #[test]
    fn test_rgb_to_xyz_maps_unit_rgb_to_white() {
        for gamut in [AP0, AWG] {
            let white = rgb_to_xyz(&gamut).unwrap() * Vector3::new(1.0, 1.0, 1.0);
            let expected = xy_to_xyz(gamut.white);
            assert!(close(white.x, expected.x, 1e-12));
            assert!(close(white.y, 1.0, 1e-12));
            assert!(close(white.z, expected.z, 1e-12));
        }
    }

    #[test]
    fn test_bradford_maps_source_white_to_destination_white() {
        let adapted = bradford(AP0.white, AWG.white).unwrap() * xy_to_xyz(AP0.white);
        let expected = xy_to_xyz(AWG.white);
        assert!(close(adapted.x, expected.x, 1e-12));
        assert!(close(adapted.y, expected.y, 1e-12));
        assert!(close(adapted.z, expected.z, 1e-12));
    }

    #[test]
    fn test_aces_to_awg_preserves_neutral() {
        let rows = to_rows(&aces_to_awg().unwrap());
        for row in rows {
            assert!(close(row.iter().sum::<f64>(), 1.0, 1e-9), "row {:?}", row);
        }
        // AP0 red lies outside AWG, so red is amplified
        assert!(rows[0][0] > 1.0);
    }

    #[test]
    fn test_identity_bradford_for_same_white() {
        let m = bradford(AWG.white, AWG.white).unwrap();
        let rows = to_rows(&m);
        for (i, row) in rows.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(close(*v, expected, 1e-12));
            }
        }
    }
}
