//! Special functions needed by the peak shapes.

pub use libm::{erf, erfc};

/// Ratio between the full width at half maximum and sigma of a Gaussian.
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// Standard normal cumulative distribution.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erf_matches_reference_values() {
        assert_eq!(erf(0.0), 0.0);
        assert!((erf(0.5) - 0.520_499_877_813_046_5).abs() < 1e-15);
        assert!((erf(1.0) - 0.842_700_792_949_714_9).abs() < 1e-15);
        assert!((erf(-2.0) + 0.995_322_265_018_952_7).abs() < 1e-15);
        assert_eq!(erf(f64::INFINITY), 1.0);
    }

    #[test]
    fn erfc_keeps_relative_accuracy_in_the_far_tail() {
        // erfc(5) = 1.5374597944280349e-12; 1 - erf(5) loses most digits here.
        let value = erfc(5.0);
        assert!((value / 1.537_459_794_428_034_9e-12 - 1.0).abs() < 1e-12);
        assert!((erfc(-1.0) - 1.842_700_792_949_714_9).abs() < 1e-15);
    }

    #[test]
    fn normal_cdf_is_symmetric() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-15);
        assert!((normal_cdf(1.3) + normal_cdf(-1.3) - 1.0).abs() < 1e-15);
        assert!((normal_cdf(1.0) - 0.841_344_746_068_542_9).abs() < 1e-15);
    }
}
