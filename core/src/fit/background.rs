use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::math::matrix::MatrixHelper;
use crate::math::stats::StatsHelper;
use crate::prelude::{CoreResult, FitError};
use crate::spectrum::histogram::{RegionData, Spectrum};
use crate::spectrum::markers::Interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackgroundKind {
    Constant,
    Polynomial { degree: usize },
    /// Natural cubic spline through the mean density of every region.
    Interpolated,
}

/// Common surface of the background families. Densities are counts per unit
/// channel.
pub trait BackgroundModel {
    fn kind(&self) -> BackgroundKind;
    fn evaluate(&self, x: f64) -> f64;
    fn coefficients(&self) -> &[f64];
    fn covariance(&self) -> &Array2<f64>;
    /// One-sigma uncertainty of `evaluate(x)`.
    fn uncertainty_at(&self, x: f64) -> f64;
}

/// `c0 + c1 x + c2 x^2 + ...` in channel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialBackground {
    kind: BackgroundKind,
    coefficients: Vec<f64>,
    covariance: Array2<f64>,
}

impl PolynomialBackground {
    pub fn new(kind: BackgroundKind, coefficients: Vec<f64>, covariance: Array2<f64>) -> CoreResult<Self> {
        let n = coefficients.len();
        if n == 0 || covariance.dim() != (n, n) {
            return Err(FitError::InsufficientData(format!(
                "background with {} coefficients needs a {}x{} covariance",
                n, n, n
            )));
        }
        Ok(Self {
            kind,
            coefficients,
            covariance,
        })
    }

    /// Converts a polynomial in `x - center` and its covariance into the
    /// plain channel basis.
    pub fn from_centered(
        kind: BackgroundKind,
        centered: &[f64],
        covariance: &Array2<f64>,
        center: f64,
    ) -> CoreResult<Self> {
        let n = centered.len();
        // transform[k][j]: contribution of centred coefficient j to raw power k.
        let mut transform = Array2::<f64>::zeros((n, n));
        for j in 0..n {
            let mut binomial = 1.0;
            for k in 0..=j {
                transform[[k, j]] = binomial * (-center).powi((j - k) as i32);
                binomial = binomial * (j - k) as f64 / (k + 1) as f64;
            }
        }
        let raw = transform.dot(&Array1::from(centered.to_vec()));
        let raw_covariance = transform.dot(covariance).dot(&transform.t());
        Self::new(kind, raw.to_vec(), raw_covariance)
    }

    fn powers(&self, x: f64) -> Array1<f64> {
        let mut power = 1.0;
        Array1::from_iter(self.coefficients.iter().map(|_| {
            let value = power;
            power *= x;
            value
        }))
    }
}

impl BackgroundModel for PolynomialBackground {
    fn kind(&self) -> BackgroundKind {
        self.kind
    }

    fn evaluate(&self, x: f64) -> f64 {
        self.coefficients.iter().rev().fold(0.0, |acc, &c| acc * x + c)
    }

    fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    fn uncertainty_at(&self, x: f64) -> f64 {
        StatsHelper::propagate(self.powers(x).view(), self.covariance.view())
    }
}

/// Natural cubic spline through `(knot, value)` pairs, extrapolated linearly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineBackground {
    knots: Vec<f64>,
    values: Vec<f64>,
    covariance: Array2<f64>,
}

impl SplineBackground {
    pub fn new(knots: Vec<f64>, values: Vec<f64>, covariance: Array2<f64>) -> CoreResult<Self> {
        let n = knots.len();
        if n < 2 || values.len() != n || covariance.dim() != (n, n) {
            return Err(FitError::InsufficientData(
                "interpolated background needs at least two regions".into(),
            ));
        }
        if knots.windows(2).any(|w| w[1] <= w[0]) {
            return Err(FitError::InvalidRegion(
                "spline knots must increase strictly".into(),
            ));
        }
        Ok(Self {
            knots,
            values,
            covariance,
        })
    }

    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    /// Weight of every knot value in the spline at `x`. The spline is linear
    /// in its values, so this is the spline through unit vectors.
    fn basis(&self, x: f64) -> Vec<f64> {
        let n = self.knots.len();
        (0..n)
            .map(|k| {
                let mut unit = vec![0.0; n];
                unit[k] = 1.0;
                spline_value(&self.knots, &unit, x)
            })
            .collect()
    }
}

impl BackgroundModel for SplineBackground {
    fn kind(&self) -> BackgroundKind {
        BackgroundKind::Interpolated
    }

    fn evaluate(&self, x: f64) -> f64 {
        spline_value(&self.knots, &self.values, x)
    }

    fn coefficients(&self) -> &[f64] {
        &self.values
    }

    fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    fn uncertainty_at(&self, x: f64) -> f64 {
        let basis = Array1::from(self.basis(x));
        StatsHelper::propagate(basis.view(), self.covariance.view())
    }
}

/// Second derivatives of the natural cubic spline (Thomas algorithm).
fn spline_curvature(knots: &[f64], values: &[f64]) -> Vec<f64> {
    let n = knots.len();
    let mut curvature = vec![0.0; n];
    if n < 3 {
        return curvature;
    }

    let mut diag = vec![0.0; n];
    let mut rhs = vec![0.0; n];
    let mut upper = vec![0.0; n];
    for i in 1..n - 1 {
        let h_left = knots[i] - knots[i - 1];
        let h_right = knots[i + 1] - knots[i];
        let lower = h_left;
        diag[i] = 2.0 * (h_left + h_right);
        upper[i] = h_right;
        rhs[i] = 6.0
            * ((values[i + 1] - values[i]) / h_right - (values[i] - values[i - 1]) / h_left);
        if i > 1 {
            let factor = lower / diag[i - 1];
            diag[i] -= factor * upper[i - 1];
            rhs[i] -= factor * rhs[i - 1];
        }
    }
    for i in (1..n - 1).rev() {
        curvature[i] = (rhs[i] - upper[i] * curvature[i + 1]) / diag[i];
    }
    curvature
}

fn spline_value(knots: &[f64], values: &[f64], x: f64) -> f64 {
    let n = knots.len();
    let curvature = spline_curvature(knots, values);
    let segment_slope = |i: usize, at_right: bool| {
        let h = knots[i + 1] - knots[i];
        let secant = (values[i + 1] - values[i]) / h;
        if at_right {
            secant + h * (2.0 * curvature[i + 1] + curvature[i]) / 6.0
        } else {
            secant - h * (2.0 * curvature[i] + curvature[i + 1]) / 6.0
        }
    };

    if x <= knots[0] {
        return values[0] + (x - knots[0]) * segment_slope(0, false);
    }
    if x >= knots[n - 1] {
        return values[n - 1] + (x - knots[n - 1]) * segment_slope(n - 2, true);
    }

    let i = knots.partition_point(|&k| k <= x).clamp(1, n - 1) - 1;
    let h = knots[i + 1] - knots[i];
    let a = (knots[i + 1] - x) / h;
    let b = (x - knots[i]) / h;
    a * values[i]
        + b * values[i + 1]
        + ((a * a * a - a) * curvature[i] + (b * b * b - b) * curvature[i + 1]) * h * h / 6.0
}

/// Fitted background, dispatched over the families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Background {
    Polynomial(PolynomialBackground),
    Interpolated(SplineBackground),
}

impl Background {
    /// Fits `kind` to the bins of `spectrum` inside the background `regions`.
    /// Each bin contributes its density `count / width` with weight
    /// `width^2 / max(variance, floor)`.
    pub fn fit(
        spectrum: &Spectrum,
        regions: &[Interval],
        kind: BackgroundKind,
        variance_floor: f64,
    ) -> CoreResult<Self> {
        if regions.is_empty() {
            return Err(FitError::InsufficientData(
                "no background regions given".into(),
            ));
        }
        let mut slices = Vec::with_capacity(regions.len());
        for region in regions {
            let data = spectrum.region(*region);
            if data.is_empty() {
                return Err(FitError::InsufficientData(format!(
                    "background region [{}, {}] contains no bins",
                    region.lower, region.upper
                )));
            }
            slices.push(data);
        }

        match kind {
            BackgroundKind::Constant => fit_polynomial(&slices, 0, kind, variance_floor),
            BackgroundKind::Polynomial { degree } => {
                fit_polynomial(&slices, degree, kind, variance_floor)
            }
            BackgroundKind::Interpolated => fit_spline(regions, &slices, variance_floor),
        }
    }

    /// Rebuilds a fitted background from its stored parts.
    pub fn from_parts(
        kind: BackgroundKind,
        coefficients: Vec<f64>,
        covariance: Array2<f64>,
        knots: Vec<f64>,
    ) -> CoreResult<Self> {
        match kind {
            BackgroundKind::Interpolated => Ok(Self::Interpolated(SplineBackground::new(
                knots,
                coefficients,
                covariance,
            )?)),
            _ => Ok(Self::Polynomial(PolynomialBackground::new(
                kind,
                coefficients,
                covariance,
            )?)),
        }
    }

    fn model(&self) -> &dyn BackgroundModel {
        match self {
            Self::Polynomial(model) => model,
            Self::Interpolated(model) => model,
        }
    }
}

impl BackgroundModel for Background {
    fn kind(&self) -> BackgroundKind {
        self.model().kind()
    }

    fn evaluate(&self, x: f64) -> f64 {
        self.model().evaluate(x)
    }

    fn coefficients(&self) -> &[f64] {
        self.model().coefficients()
    }

    fn covariance(&self) -> &Array2<f64> {
        self.model().covariance()
    }

    fn uncertainty_at(&self, x: f64) -> f64 {
        self.model().uncertainty_at(x)
    }
}

fn fit_polynomial(
    slices: &[RegionData],
    degree: usize,
    kind: BackgroundKind,
    variance_floor: f64,
) -> CoreResult<Background> {
    let n_coeff = degree + 1;
    if let Some(short) = slices.iter().find(|data| data.len() < n_coeff) {
        return Err(FitError::InsufficientData(format!(
            "background region [{}, {}] holds {} bins, fewer than {} coefficients",
            short.low[0],
            short.high[short.len() - 1],
            short.len(),
            n_coeff
        )));
    }

    // Fit in x - center for conditioning, then convert back.
    let (sum_x, count) = slices.iter().fold((0.0, 0.0), |(s, c), data| {
        ((0..data.len()).map(|i| data.center(i)).sum::<f64>() + s, c + data.len() as f64)
    });
    let center = sum_x / count;

    let mut normal = Array2::<f64>::zeros((n_coeff, n_coeff));
    let mut rhs = Array1::<f64>::zeros(n_coeff);
    for data in slices {
        for i in 0..data.len() {
            let width = data.width(i);
            let weight =
                width * width / StatsHelper::floored_variance(data.variances[i], variance_floor);
            let x = data.center(i) - center;
            let powers: Vec<f64> = (0..n_coeff).map(|k| x.powi(k as i32)).collect();
            for r in 0..n_coeff {
                rhs[r] += weight * powers[r] * data.density(i);
                for c in 0..n_coeff {
                    normal[[r, c]] += weight * powers[r] * powers[c];
                }
            }
        }
    }

    let covariance = MatrixHelper::invert_spd(normal.view()).ok_or_else(|| {
        FitError::InsufficientData(format!(
            "background regions do not constrain a degree {} polynomial",
            degree
        ))
    })?;
    let centered = covariance.dot(&rhs);
    Ok(Background::Polynomial(PolynomialBackground::from_centered(
        kind,
        &centered.to_vec(),
        &covariance,
        center,
    )?))
}

fn fit_spline(
    regions: &[Interval],
    slices: &[RegionData],
    variance_floor: f64,
) -> CoreResult<Background> {
    if regions.len() < 2 {
        return Err(FitError::InsufficientData(
            "interpolated background needs at least two regions".into(),
        ));
    }

    let mut knots = Vec::with_capacity(regions.len());
    let mut values = Vec::with_capacity(regions.len());
    let mut covariance = Array2::<f64>::zeros((regions.len(), regions.len()));
    for (k, (region, data)) in regions.iter().zip(slices).enumerate() {
        let densities: Vec<f64> = (0..data.len()).map(|i| data.density(i)).collect();
        let variances: Vec<f64> = (0..data.len())
            .map(|i| {
                let width = data.width(i);
                StatsHelper::floored_variance(data.variances[i], variance_floor) / (width * width)
            })
            .collect();
        let (mean, variance) = StatsHelper::weighted_mean(&densities, &variances, f64::MIN_POSITIVE)
            .ok_or_else(|| {
                FitError::InsufficientData(format!(
                    "background region [{}, {}] contains no bins",
                    region.lower, region.upper
                ))
            })?;
        knots.push(region.midpoint());
        values.push(mean);
        covariance[[k, k]] = variance;
    }

    Ok(Background::Interpolated(SplineBackground::new(
        knots, values, covariance,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_spectrum() -> Spectrum {
        Spectrum::from_counts("bg", (0..200).map(|i| 40.0 + 0.1 * i as f64).collect()).unwrap()
    }

    #[test]
    fn polynomial_recovers_exact_line() {
        let spectrum = linear_spectrum();
        let regions = [Interval::new(10.0, 40.0), Interval::new(150.0, 190.0)];
        let background =
            Background::fit(&spectrum, &regions, BackgroundKind::Polynomial { degree: 1 }, 1.0)
                .unwrap();
        assert!((background.coefficients()[0] - 40.0).abs() < 1e-8);
        assert!((background.coefficients()[1] - 0.1).abs() < 1e-10);
        assert!((background.evaluate(100.0) - 50.0).abs() < 1e-8);
        assert!(background.uncertainty_at(100.0) > 0.0);
    }

    #[test]
    fn constant_is_weighted_mean() {
        let spectrum = Spectrum::from_counts("flat", vec![9.0, 16.0, 25.0, 36.0]).unwrap();
        let regions = [Interval::new(0.0, 3.0)];
        let background = Background::fit(&spectrum, &regions, BackgroundKind::Constant, 1.0).unwrap();
        // Weights 1/c turn the weighted mean into the harmonic mean.
        let expected = 4.0 / (1.0 / 9.0 + 1.0 / 16.0 + 1.0 / 25.0 + 1.0 / 36.0);
        assert!((background.evaluate(1.5) - expected).abs() < 1e-9);
        assert!((background.covariance()[[0, 0]] - expected / 4.0).abs() < 1e-9);
    }

    #[test]
    fn spline_passes_through_region_means() {
        let spectrum = linear_spectrum();
        let regions = [
            Interval::new(10.0, 20.0),
            Interval::new(90.0, 110.0),
            Interval::new(170.0, 180.0),
        ];
        let background =
            Background::fit(&spectrum, &regions, BackgroundKind::Interpolated, 1.0).unwrap();
        // A linear spectrum has a straight natural spline.
        for x in [0.0, 15.0, 60.0, 140.0, 199.0] {
            let expected = 40.0 + 0.1 * x;
            assert!((background.evaluate(x) - expected).abs() < 0.05, "x {}", x);
        }
        let at_knot = background.uncertainty_at(100.0);
        let between = background.uncertainty_at(55.0);
        assert!(at_knot > 0.0 && between > 0.0);
    }

    #[test]
    fn reports_missing_data() {
        let spectrum = linear_spectrum();
        assert!(matches!(
            Background::fit(&spectrum, &[Interval::new(500.0, 600.0)], BackgroundKind::Constant, 1.0),
            Err(FitError::InsufficientData(_))
        ));
        assert!(matches!(
            Background::fit(&spectrum, &[Interval::new(10.0, 20.0)], BackgroundKind::Interpolated, 1.0),
            Err(FitError::InsufficientData(_))
        ));
        assert!(matches!(
            Background::fit(
                &spectrum,
                &[Interval::new(10.0, 11.0)],
                BackgroundKind::Polynomial { degree: 3 },
                1.0
            ),
            Err(FitError::InsufficientData(_))
        ));
    }

    #[test]
    fn every_region_must_hold_enough_bins() {
        let spectrum = linear_spectrum();
        // Forty bins in total, but the second region holds a single bin.
        let regions = [Interval::new(10.0, 50.0), Interval::new(150.0, 150.5)];
        match Background::fit(&spectrum, &regions, BackgroundKind::Polynomial { degree: 1 }, 1.0) {
            Err(FitError::InsufficientData(message)) => {
                assert!(message.contains("holds 1 bins"), "{}", message)
            }
            other => panic!("expected insufficient data, got {:?}", other),
        }
        assert!(Background::fit(&spectrum, &regions, BackgroundKind::Constant, 1.0).is_ok());
    }

    #[test]
    fn centered_conversion_matches_direct_evaluation() {
        let centered = [2.0, -0.5, 0.25];
        let covariance = Array2::<f64>::eye(3);
        let raw = PolynomialBackground::from_centered(
            BackgroundKind::Polynomial { degree: 2 },
            &centered,
            &covariance,
            7.0,
        )
        .unwrap();
        for x in [-3.0, 0.0, 7.0, 12.5] {
            let dx: f64 = x - 7.0;
            let expected = 2.0 - 0.5 * dx + 0.25 * dx * dx;
            assert!((raw.evaluate(x) - expected).abs() < 1e-10);
        }
        let expected_sigma = (1.0 + 2.0_f64.powi(2) + 4.0_f64.powi(2)).sqrt();
        assert!((raw.uncertainty_at(9.0) - expected_sigma).abs() < 1e-10);
    }

    #[test]
    fn rebuilds_from_parts() {
        let spectrum = linear_spectrum();
        let regions = [Interval::new(10.0, 20.0), Interval::new(90.0, 110.0)];
        let fitted = Background::fit(&spectrum, &regions, BackgroundKind::Interpolated, 1.0).unwrap();
        let knots = match &fitted {
            Background::Interpolated(spline) => spline.knots().to_vec(),
            Background::Polynomial(_) => Vec::new(),
        };
        let rebuilt = Background::from_parts(
            fitted.kind(),
            fitted.coefficients().to_vec(),
            fitted.covariance().clone(),
            knots,
        )
        .unwrap();
        assert_eq!(rebuilt, fitted);
    }
}
