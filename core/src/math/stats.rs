use ndarray::{ArrayView1, ArrayView2};

use crate::math::matrix::MatrixHelper;

/// Floor on the expected count used by the Poisson deviance.
pub const MODEL_FLOOR: f64 = 1e-9;

pub struct StatsHelper;

impl StatsHelper {
    /// Bin variance with the configured floor applied, so empty bins never
    /// produce singular weights.
    pub fn floored_variance(variance: f64, floor: f64) -> f64 {
        if variance.is_finite() {
            variance.max(floor)
        } else {
            floor
        }
    }

    /// Weighted mean and the variance of that mean.
    pub fn weighted_mean(values: &[f64], variances: &[f64], floor: f64) -> Option<(f64, f64)> {
        if values.is_empty() || values.len() != variances.len() {
            return None;
        }
        let mut sum_w = 0.0;
        let mut sum_wy = 0.0;
        for (&value, &variance) in values.iter().zip(variances) {
            let weight = 1.0 / Self::floored_variance(variance, floor);
            sum_w += weight;
            sum_wy += weight * value;
        }
        Some((sum_wy / sum_w, 1.0 / sum_w))
    }

    /// Contribution of one bin to the Poisson deviance.
    pub fn poisson_deviance_term(observed: f64, expected: f64) -> f64 {
        let expected = expected.max(MODEL_FLOOR);
        if observed > 0.0 {
            2.0 * (expected - observed + observed * (observed / expected).ln())
        } else {
            2.0 * expected
        }
    }

    /// First-order (delta method) uncertainty of a derived quantity.
    pub fn propagate(gradient: ArrayView1<f64>, covariance: ArrayView2<f64>) -> f64 {
        MatrixHelper::quadratic_form(gradient, covariance).max(0.0).sqrt()
    }

    /// Combined one-sigma uncertainty of the difference of two independent values.
    pub fn combined_sigma(first: f64, second: f64) -> f64 {
        (first * first + second * second).sqrt()
    }
}
