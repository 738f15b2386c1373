use ndarray::s;

use crate::fit::background::{Background, BackgroundKind, BackgroundModel, PolynomialBackground};
use crate::fit::composite::CompositeModel;
use crate::fit::peak::{PeakShape, SeedContext, ShapeParam, MAX_SHAPE_PARAMS};
use crate::fit::result::{BackgroundSource, FitResult, PeakResult, PeakValues};
use crate::math::optimizer::{LeastSquaresModel, LevenbergMarquardt, OptimizerSettings, Solution};
use crate::math::special::FWHM_PER_SIGMA;
use crate::math::stats::StatsHelper;
use crate::prelude::{CoreResult, FitConfig, FitError, Uncertain};
use crate::spectrum::histogram::{RegionData, Spectrum};
use crate::spectrum::markers::MarkerSet;
use crate::telemetry::log::LogManager;

/// Bins averaged at each end of the region for the joint background seed.
const EDGE_BINS: usize = 3;

/// Fits all peaks of one region jointly on top of a background.
pub struct Fitter {
    config: FitConfig,
    logger: LogManager,
}

impl Fitter {
    pub fn new(config: FitConfig) -> Self {
        Self {
            config,
            logger: LogManager::for_component("fit"),
        }
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn fit(&self, spectrum: &Spectrum, markers: &MarkerSet) -> CoreResult<FitResult> {
        let region = markers.fit_region()?;
        let domain = spectrum.domain();
        if region.lower < domain.lower || region.upper > domain.upper {
            return Err(FitError::InvalidRegion(format!(
                "fit region [{}, {}] exceeds spectrum [{}, {}]",
                region.lower, region.upper, domain.lower, domain.upper
            )));
        }
        let positions = markers.sorted_peaks();
        if positions.is_empty() {
            return Err(FitError::InvalidRegion("no peak markers set".into()));
        }
        if let Some(outside) = positions.iter().find(|&&p| !region.contains(p)) {
            return Err(FitError::InvalidRegion(format!(
                "peak marker {} lies outside the fit region [{}, {}]",
                outside, region.lower, region.upper
            )));
        }
        let background_regions = markers.background_regions()?;

        let data = spectrum.region(region);
        if data.is_empty() {
            return Err(FitError::InvalidRegion(format!(
                "fit region [{}, {}] contains no bins",
                region.lower, region.upper
            )));
        }
        if data.is_all_zero() {
            return Err(FitError::InsufficientData(format!(
                "fit region [{}, {}] holds no counts",
                region.lower, region.upper
            )));
        }

        let external = if background_regions.is_empty() {
            None
        } else {
            Some(Background::fit(
                spectrum,
                &background_regions,
                self.config.background,
                self.config.variance_floor,
            )?)
        };

        let center = region.midpoint();
        let degree = self.config.joint_background_degree;
        let (baseline, joint) = match &external {
            Some(background) => (
                (0..data.len())
                    .map(|i| background.evaluate(data.center(i)))
                    .collect::<Vec<_>>(),
                None,
            ),
            None => {
                let (level, slope) = edge_estimate(&data, center);
                let baseline = (0..data.len())
                    .map(|i| level + slope * (data.center(i) - center))
                    .collect();
                let start = if degree == 0 {
                    vec![level]
                } else {
                    vec![level, slope]
                };
                (baseline, Some((degree, center, start)))
            }
        };

        let shapes: Vec<Box<dyn PeakShape>> =
            positions.iter().map(|_| self.config.peak.build()).collect();
        let seeds: Vec<Vec<f64>> = positions
            .iter()
            .zip(&shapes)
            .map(|(&marker, shape)| {
                shape.seed(&SeedContext {
                    marker,
                    region,
                    data: &data,
                    baseline: &baseline,
                })
            })
            .collect();
        self.logger.detail(&format!("seeds {:?}", seeds));

        let model = CompositeModel::new(shapes, &seeds, &self.config.params, joint, external.as_ref());
        if data.len() <= model.parameter_count() {
            return Err(FitError::InsufficientData(format!(
                "{} bins cannot constrain {} free parameters",
                data.len(),
                model.parameter_count()
            )));
        }

        let (model, solution) = self.solve(model, &data)?;

        let mut warnings = Vec::new();
        if !solution.positive_definite {
            warnings.push("covariance matrix is not positive definite".to_string());
        }
        let covariance = if solution.covariance.iter().all(|v| v.is_finite()) {
            solution.covariance.clone()
        } else {
            warnings.push("covariance matrix is singular; uncertainties are unavailable".to_string());
            solution.covariance.mapv(|v| if v.is_finite() { v } else { 0.0 })
        };
        let solution = Solution {
            covariance,
            ..solution
        };

        let mut peaks: Vec<PeakResult> = (0..model.shapes().len())
            .map(|peak| self.peak_result(&model, peak, &solution, spectrum))
            .collect();
        peaks.sort_by(|a, b| a.position().value.total_cmp(&b.position().value));

        let (background, background_source) = match &external {
            Some(background) => (
                background.clone(),
                BackgroundSource::Regions {
                    regions: background_regions,
                },
            ),
            None => (joint_background(&model, &solution)?, BackgroundSource::Joint),
        };

        let result = FitResult {
            index: None,
            spectrum: spectrum.name().to_string(),
            region,
            markers: markers.clone(),
            config: self.config.clone(),
            calibration: spectrum.calibration().clone(),
            background,
            background_source,
            peaks,
            chi_square: solution.objective,
            degrees_of_freedom: data.len() - model.parameter_count(),
            iterations: solution.iterations,
            low_confidence: !warnings.is_empty(),
            warnings,
        };

        for warning in result.warnings() {
            self.logger.warn(&format!("{}: {}", spectrum.name(), warning));
        }
        self.logger.record(&format!(
            "{}: {} peak(s) in [{:.2}, {:.2}] after {} iterations, chi2/ndf {:.3}",
            spectrum.name(),
            result.peaks().len(),
            region.lower,
            region.upper,
            result.iterations(),
            result.reduced_chi_square()
        ));
        Ok(result)
    }

    fn peak_result(
        &self,
        model: &CompositeModel<'_>,
        peak: usize,
        solution: &Solution,
        spectrum: &Spectrum,
    ) -> PeakResult {
        let shape = &model.shapes()[peak];
        let n = shape.parameter_count();
        let local = model.peak_params(peak, &solution.params);
        let params = &local[..n];

        let propagate = |local_gradient: &[f64]| {
            let gradient = model.lift_gradient(peak, local_gradient);
            StatsHelper::propagate(gradient.view(), solution.covariance.view())
        };
        let error_of = |k: usize| {
            let mut unit = [0.0; MAX_SHAPE_PARAMS];
            unit[k] = 1.0;
            propagate(&unit[..n])
        };

        let position = Uncertain::new(params[0], error_of(0));
        let volume = Uncertain::new(params[1], error_of(1));
        let sigma = Uncertain::new(params[2], error_of(2));
        let width = Uncertain::new(FWHM_PER_SIGMA * sigma.value, FWHM_PER_SIGMA * sigma.error);

        let norm = shape.norm(params);
        let mut amplitude_gradient = [0.0; MAX_SHAPE_PARAMS];
        shape.norm_gradient(params, &mut amplitude_gradient[..n]);
        for g in amplitude_gradient[..n].iter_mut() {
            *g *= volume.value;
        }
        amplitude_gradient[1] = norm;
        let amplitude = Uncertain::new(volume.value * norm, propagate(&amplitude_gradient[..n]));

        let calibration = spectrum.calibration();
        let calibrated_position = Uncertain::new(
            calibration.energy(position.value),
            calibration.slope(position.value).abs() * position.error,
        );
        let (low, high) = (position.value - 0.5 * width.value, position.value + 0.5 * width.value);
        let (slope_low, slope_high) = (calibration.slope(low), calibration.slope(high));
        let mut width_gradient = [0.0; MAX_SHAPE_PARAMS];
        width_gradient[0] = slope_high - slope_low;
        width_gradient[2] = 0.5 * FWHM_PER_SIGMA * (slope_high + slope_low);
        let calibrated_width = Uncertain::new(
            (calibration.energy(high) - calibration.energy(low)).abs(),
            propagate(&width_gradient[..n]),
        );

        let optional = |param: ShapeParam| {
            shape
                .index_of(param)
                .map(|k| Uncertain::new(params[k], error_of(k)))
        };

        PeakResult {
            kind: shape.kind(),
            params: params.to_vec(),
            uncalibrated: PeakValues {
                position,
                volume,
                width,
            },
            calibrated: PeakValues {
                position: calibrated_position,
                volume,
                width: calibrated_width,
            },
            sigma,
            amplitude,
            tail_left: optional(ShapeParam::TailLeft),
            tail_right: optional(ShapeParam::TailRight),
            step_height: optional(ShapeParam::StepHeight),
            step_width: optional(ShapeParam::StepWidth),
        }
    }

    /// Minimises `model`. Shape parameters that end up saturated (a tail run
    /// out to its bound) are held at their bound and the fit is repeated
    /// without them, so they report no uncertainty instead of a singular one.
    fn solve<'a>(
        &self,
        model: CompositeModel<'a>,
        data: &RegionData,
    ) -> CoreResult<(CompositeModel<'a>, Solution)> {
        let solver = LevenbergMarquardt::new(OptimizerSettings::from(&self.config));
        let observations = data.observations();
        let (last, first) = match solver.minimize(&model, &observations, model.initial().to_vec()) {
            Ok(solution) => (solution.params.clone(), Ok(solution)),
            Err(FitError::DidNotConverge { iterations, last }) => (
                last.params.clone(),
                Err(FitError::DidNotConverge { iterations, last }),
            ),
            Err(other) => return Err(other),
        };

        let saturated = model.saturated_slots(&last);
        if saturated.is_empty() {
            return first.map(|solution| (model, solution));
        }
        self.logger.detail(&format!(
            "holding {} saturated parameter(s) at their bound and refitting",
            saturated.len()
        ));
        let pinned = model.pin(&saturated, &last);
        let mut solution = solver.minimize(&pinned, &observations, pinned.initial().to_vec())?;
        if let Ok(first) = &first {
            solution.iterations += first.iterations;
        }
        Ok((pinned, solution))
    }
}

/// Mean density at both ends of the region as level and slope around
/// `center`.
fn edge_estimate(data: &RegionData, center: f64) -> (f64, f64) {
    let n = data.len();
    let take = EDGE_BINS.min(n);
    let mean = |range: std::ops::Range<usize>| {
        let count = range.len().max(1) as f64;
        let (x, y) = range.fold((0.0, 0.0), |(x, y), i| (x + data.center(i), y + data.density(i)));
        (x / count, y / count)
    };
    let (x_left, y_left) = mean(0..take);
    let (x_right, y_right) = mean(n - take..n);
    if x_right > x_left {
        let slope = (y_right - y_left) / (x_right - x_left);
        (y_left + slope * (center - x_left), slope)
    } else {
        (0.5 * (y_left + y_right), 0.0)
    }
}

fn joint_background(model: &CompositeModel<'_>, solution: &Solution) -> CoreResult<Background> {
    let Some((coefficients, center, first)) = model.joint_coefficients(&solution.params) else {
        return Err(FitError::InsufficientData(
            "fit has no background term".into(),
        ));
    };
    let last = first + coefficients.len();
    let covariance = solution.covariance.slice(s![first..last, first..last]).to_owned();
    let degree = coefficients.len() - 1;
    Ok(Background::Polynomial(PolynomialBackground::from_centered(
        BackgroundKind::Polynomial { degree },
        coefficients,
        &covariance,
        center,
    )?))
}
