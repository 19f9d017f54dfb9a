//! ARRI LogC3 (EI800) transfer function.
//!
//! Piecewise: linear below `CUT`, logarithmic above. Negative input is clipped to 0.

const CUT: f64 = 0.010591;
const A: f64 = 5.555556;
const B: f64 = 0.052272;
const C: f64 = 0.247190;
const D: f64 = 0.385537;
const E: f64 = 5.367655;
const F: f64 = 0.092809;

/// Encoded value at the cut point, where the two segments meet
const CUT_Y: f64 = E * CUT + F;

/// Linear scene value -> LogC3 signal
#[inline]
pub fn encode(x: f32) -> f32 {
    let x = (x as f64).max(0.0);
    let y = if x > CUT {
        C * (A * x + B).log10() + D
    } else {
        E * x + F
    };
    y as f32
}

/// LogC3 signal -> linear scene value, clipped at 0
#[inline]
pub fn decode(y: f32) -> f32 {
    let y = y as f64;
    let x = if y > CUT_Y {
        (10f64.powf((y - D) / C) - B) / A
    } else {
        (y - F) / E
    };
    x.max(0.0) as f32
}
