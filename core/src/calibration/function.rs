use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::math::matrix::MatrixHelper;
use crate::prelude::{CoreResult, FitError};
use crate::spectrum::markers::Interval;

const BISECTION_STEPS: usize = 200;
const BRACKET_EXPANSIONS: usize = 60;

/// Channel to energy mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Calibration {
    /// `E(ch) = c0 + c1 ch + c2 ch^2 + ...`
    Polynomial { coefficients: Vec<f64> },
    /// Piecewise-linear interpolation through `(channel, energy)` points,
    /// extrapolated linearly from the end segments.
    Table { points: Vec<(f64, f64)> },
}

/// Orientation of a monotonic calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increasing,
    Decreasing,
}

impl Default for Calibration {
    fn default() -> Self {
        Self::identity()
    }
}

impl Calibration {
    pub fn identity() -> Self {
        Self::Polynomial {
            coefficients: vec![0.0, 1.0],
        }
    }

    pub fn linear(offset: f64, slope: f64) -> Self {
        Self::Polynomial {
            coefficients: vec![offset, slope],
        }
    }

    pub fn polynomial(coefficients: Vec<f64>) -> CoreResult<Self> {
        if coefficients.is_empty() || coefficients.iter().any(|c| !c.is_finite()) {
            return Err(FitError::InvalidCalibration(
                "polynomial needs finite coefficients".into(),
            ));
        }
        Ok(Self::Polynomial { coefficients })
    }

    pub fn table(mut points: Vec<(f64, f64)>) -> CoreResult<Self> {
        if points.len() < 2 {
            return Err(FitError::InvalidCalibration(
                "table needs at least two points".into(),
            ));
        }
        if points.iter().any(|(c, e)| !c.is_finite() || !e.is_finite()) {
            return Err(FitError::InvalidCalibration(
                "table points must be finite".into(),
            ));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if points.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(FitError::InvalidCalibration(
                "table has duplicate channels".into(),
            ));
        }
        Ok(Self::Table { points })
    }

    /// Least-squares polynomial through `(channel, energy)` pairs, e.g. fitted
    /// peak positions with their known line energies.
    pub fn from_pairs(pairs: &[(f64, f64)], degree: usize) -> CoreResult<Self> {
        let n_coeff = degree + 1;
        if pairs.len() < n_coeff {
            return Err(FitError::InsufficientData(format!(
                "{} calibration points cannot determine a degree {} polynomial",
                pairs.len(),
                degree
            )));
        }

        let mut normal = Array2::<f64>::zeros((n_coeff, n_coeff));
        let mut rhs = Array1::<f64>::zeros(n_coeff);
        for &(channel, energy) in pairs {
            let powers: Vec<f64> = (0..n_coeff).map(|k| channel.powi(k as i32)).collect();
            for i in 0..n_coeff {
                rhs[i] += powers[i] * energy;
                for j in 0..n_coeff {
                    normal[[i, j]] += powers[i] * powers[j];
                }
            }
        }

        let coefficients = MatrixHelper::solve_spd(normal.view(), rhs.view()).ok_or_else(|| {
            FitError::InvalidCalibration("calibration points are degenerate".into())
        })?;
        Self::polynomial(coefficients.to_vec())
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Polynomial { coefficients } if coefficients.as_slice() == [0.0, 1.0])
    }

    pub fn energy(&self, channel: f64) -> f64 {
        match self {
            Self::Polynomial { coefficients } => coefficients
                .iter()
                .rev()
                .fold(0.0, |acc, &c| acc * channel + c),
            Self::Table { points } => {
                let (a, b) = Self::segment(points, channel);
                a.1 + (channel - a.0) * (b.1 - a.1) / (b.0 - a.0)
            }
        }
    }

    /// `dE/dch` at `channel`.
    pub fn slope(&self, channel: f64) -> f64 {
        match self {
            Self::Polynomial { coefficients } => coefficients
                .iter()
                .enumerate()
                .skip(1)
                .rev()
                .fold(0.0, |acc, (k, &c)| acc * channel + k as f64 * c),
            Self::Table { points } => {
                let (a, b) = Self::segment(points, channel);
                (b.1 - a.1) / (b.0 - a.0)
            }
        }
    }

    /// Inverse mapping. `hint` brackets the expected channel range; it is
    /// widened when the energy lies outside it.
    pub fn channel(&self, energy: f64, hint: Interval) -> CoreResult<f64> {
        if !energy.is_finite() {
            return Err(FitError::InvalidCalibration(format!(
                "energy {} is not finite",
                energy
            )));
        }
        if let Self::Polynomial { coefficients } = self {
            if coefficients.len() == 2 && coefficients[1] != 0.0 {
                return Ok((energy - coefficients[0]) / coefficients[1]);
            }
        }

        let target = |ch: f64| self.energy(ch) - energy;
        let (mut lo, mut hi) = (hint.lower, hint.upper.max(hint.lower + 1.0));
        let (mut f_lo, mut f_hi) = (target(lo), target(hi));
        let mut expansions = 0;
        while f_lo.signum() == f_hi.signum() && f_lo != 0.0 && f_hi != 0.0 {
            if expansions == BRACKET_EXPANSIONS {
                return Err(FitError::InvalidCalibration(format!(
                    "energy {} is outside the calibrated range",
                    energy
                )));
            }
            let width = hi - lo;
            lo -= width;
            hi += width;
            f_lo = target(lo);
            f_hi = target(hi);
            expansions += 1;
        }
        if f_lo == 0.0 {
            return Ok(lo);
        }
        if f_hi == 0.0 {
            return Ok(hi);
        }

        for _ in 0..BISECTION_STEPS {
            let mid = 0.5 * (lo + hi);
            let f_mid = target(mid);
            if f_mid == 0.0 || (hi - lo) <= 1e-12 * (1.0 + mid.abs()) {
                return Ok(mid);
            }
            if f_mid.signum() == f_lo.signum() {
                lo = mid;
                f_lo = f_mid;
            } else {
                hi = mid;
            }
        }
        Ok(0.5 * (lo + hi))
    }

    /// Checks that the energies at the given channel positions (and between
    /// them) are finite and strictly monotonic.
    pub fn check_monotonic(&self, channels: &[f64]) -> CoreResult<Direction> {
        let mut samples: Vec<f64> = Vec::with_capacity(channels.len() * 2);
        for (index, &channel) in channels.iter().enumerate() {
            if let Some(&previous) = index.checked_sub(1).and_then(|i| channels.get(i)) {
                if channel == previous {
                    continue;
                }
                samples.push(self.energy(0.5 * (previous + channel)));
            }
            samples.push(self.energy(channel));
        }

        if samples.iter().any(|e| !e.is_finite()) {
            return Err(FitError::InvalidCalibration(
                "calibration is undefined over the spectrum".into(),
            ));
        }
        if samples.len() < 2 {
            return Ok(Direction::Increasing);
        }

        let increasing = samples.windows(2).all(|w| w[1] > w[0]);
        let decreasing = samples.windows(2).all(|w| w[1] < w[0]);
        match (increasing, decreasing) {
            (true, _) => Ok(Direction::Increasing),
            (_, true) => Ok(Direction::Decreasing),
            _ => Err(FitError::InvalidCalibration(
                "calibration is not monotonic over the spectrum".into(),
            )),
        }
    }

    fn segment(points: &[(f64, f64)], channel: f64) -> ((f64, f64), (f64, f64)) {
        let upper = points
            .partition_point(|p| p.0 <= channel)
            .clamp(1, points.len() - 1);
        (points[upper - 1], points[upper])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polynomial_energy_and_slope() {
        let cal = Calibration::polynomial(vec![1.0, 2.0, 0.5]).unwrap();
        assert_eq!(cal.energy(2.0), 1.0 + 4.0 + 2.0);
        assert_eq!(cal.slope(2.0), 2.0 + 2.0);
        assert!(Calibration::identity().is_identity());
        assert!(!cal.is_identity());
    }

    #[test]
    fn table_interpolates_and_extrapolates() {
        let cal = Calibration::table(vec![(10.0, 100.0), (0.0, 0.0), (20.0, 300.0)]).unwrap();
        assert_eq!(cal.energy(5.0), 50.0);
        assert_eq!(cal.energy(15.0), 200.0);
        assert_eq!(cal.energy(25.0), 400.0);
        assert_eq!(cal.energy(-1.0), -10.0);
        assert_eq!(cal.slope(12.0), 20.0);
    }

    #[test]
    fn channel_inverts_nonlinear_calibration() {
        let cal = Calibration::polynomial(vec![3.0, 0.7, 1e-4]).unwrap();
        let hint = Interval::new(0.0, 100.0);
        for channel in [0.0, 12.5, 99.0, 250.0] {
            let energy = cal.energy(channel);
            let back = cal.channel(energy, hint).unwrap();
            assert!((back - channel).abs() < 1e-6, "{} != {}", back, channel);
        }
    }

    #[test]
    fn non_monotonic_calibration_is_rejected() {
        let cal = Calibration::polynomial(vec![0.0, -10.0, 0.1]).unwrap();
        let channels: Vec<f64> = (0..101).map(|c| c as f64).collect();
        assert!(matches!(
            cal.check_monotonic(&channels),
            Err(FitError::InvalidCalibration(_))
        ));
        let flipped = Calibration::linear(100.0, -1.0);
        assert_eq!(flipped.check_monotonic(&channels).unwrap(), Direction::Decreasing);
    }

    #[test]
    fn from_pairs_recovers_line() {
        let pairs: Vec<(f64, f64)> = (0..5).map(|i| (i as f64 * 100.0, 20.0 + 0.5 * i as f64 * 100.0)).collect();
        let cal = Calibration::from_pairs(&pairs, 1).unwrap();
        assert!((cal.energy(1000.0) - 520.0).abs() < 1e-6);
        assert!(matches!(
            Calibration::from_pairs(&pairs[..1], 1),
            Err(FitError::InsufficientData(_))
        ));
    }
}
