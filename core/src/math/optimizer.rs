//! Levenberg-Marquardt minimisation of binned least-squares and Poisson
//! likelihood objectives.

use ndarray::{Array1, Array2};

use crate::math::matrix::MatrixHelper;
use crate::math::stats::{StatsHelper, MODEL_FLOOR};
use crate::prelude::{BinIntegration, CoreResult, FitConfig, FitError, FitIterate, FitStatistic};
use crate::telemetry::log::LogManager;

const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e16;
const DIAG_FLOOR: f64 = 1e-12;
/// Largest predicted objective decrease, relative to the objective, at which
/// a point no step improves on still counts as a minimum.
const STATIONARY_GAIN: f64 = 1e-6;

/// A model with analytic derivatives that can be fitted to binned data.
///
/// `evaluate` returns a density per unit of `x`; the optimizer integrates it
/// over every bin.
pub trait LeastSquaresModel {
    fn parameter_count(&self) -> usize;
    fn evaluate(&self, x: f64, params: &[f64]) -> f64;
    /// Partial derivatives of `evaluate` with respect to every parameter.
    fn gradient(&self, x: f64, params: &[f64], out: &mut [f64]);
    /// Project parameters back into their physical domain after a step.
    fn constrain(&self, _params: &mut [f64]) {}
}

/// Binned observations over a fit region.
#[derive(Debug, Clone, Copy)]
pub struct Observations<'a> {
    pub low: &'a [f64],
    pub high: &'a [f64],
    pub counts: &'a [f64],
    pub variances: &'a [f64],
}

impl<'a> Observations<'a> {
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub statistic: FitStatistic,
    pub variance_floor: f64,
    pub integration: BinIntegration,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub initial_lambda: f64,
}

impl From<&FitConfig> for OptimizerSettings {
    fn from(config: &FitConfig) -> Self {
        Self {
            statistic: config.statistic,
            variance_floor: config.variance_floor,
            integration: config.integration,
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
            initial_lambda: config.initial_lambda,
        }
    }
}

/// Converged optimizer state.
#[derive(Debug, Clone)]
pub struct Solution {
    pub params: Vec<f64>,
    pub covariance: Array2<f64>,
    /// Chi-square or Poisson deviance at the optimum.
    pub objective: f64,
    pub iterations: usize,
    /// False when the curvature matrix had to be inverted without Cholesky.
    pub positive_definite: bool,
}

pub struct LevenbergMarquardt {
    settings: OptimizerSettings,
    logger: LogManager,
}

impl LevenbergMarquardt {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self {
            settings,
            logger: LogManager::for_component("optimizer"),
        }
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn minimize<M: LeastSquaresModel + ?Sized>(
        &self,
        model: &M,
        data: &Observations<'_>,
        initial: Vec<f64>,
    ) -> CoreResult<Solution> {
        let n_params = model.parameter_count();
        if initial.len() != n_params {
            return Err(FitError::InsufficientData(format!(
                "expected {} start values, got {}",
                n_params,
                initial.len()
            )));
        }
        if data.len() <= n_params {
            return Err(FitError::InsufficientData(format!(
                "{} bins cannot constrain {} free parameters",
                data.len(),
                n_params
            )));
        }

        let mut params = initial;
        model.constrain(&mut params);
        let (mut expected, mut jacobian) = self.predict(model, &params, data);
        let mut objective = self.objective(data, &expected);
        if !objective.is_finite() {
            return Err(FitError::DidNotConverge {
                iterations: 0,
                last: Box::new(FitIterate { params, objective }),
            });
        }

        let mut lambda = self.settings.initial_lambda.max(LAMBDA_MIN);
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.settings.max_iterations {
            iterations += 1;
            let (alpha, beta) = self.normal_equations(data, &expected, &jacobian);

            let mut accepted = None;
            while lambda <= LAMBDA_MAX {
                let mut damped = alpha.clone();
                for i in 0..n_params {
                    damped[[i, i]] += lambda * alpha[[i, i]].max(DIAG_FLOOR);
                }
                let Some(step) = MatrixHelper::solve_spd(damped.view(), beta.view()) else {
                    lambda *= 10.0;
                    continue;
                };

                let mut trial: Vec<f64> = params.iter().zip(step.iter()).map(|(p, d)| p + d).collect();
                model.constrain(&mut trial);
                let (trial_expected, trial_jacobian) = self.predict(model, &trial, data);
                let trial_objective = self.objective(data, &trial_expected);

                if trial_objective.is_finite() && trial_objective <= objective {
                    lambda = (lambda / 10.0).max(LAMBDA_MIN);
                    accepted = Some((trial, trial_expected, trial_jacobian, trial_objective));
                    break;
                }
                lambda *= 10.0;
            }

            match accepted {
                Some((trial, trial_expected, trial_jacobian, trial_objective)) => {
                    let tolerance = self.settings.tolerance;
                    let settled = params
                        .iter()
                        .zip(&trial)
                        .all(|(old, new)| (new - old).abs() <= tolerance * old.abs().max(1.0));
                    params = trial;
                    expected = trial_expected;
                    jacobian = trial_jacobian;
                    objective = trial_objective;
                    if settled {
                        converged = true;
                        break;
                    }
                }
                // No step decreases the objective even at maximal damping.
                None => {
                    converged = self.stationary(model, &params, &alpha, &beta, objective);
                    if !converged {
                        self.logger.warn(&format!(
                            "no step decreases the objective at maximal damping after {} iterations",
                            iterations
                        ));
                    }
                    break;
                }
            }
        }

        if !converged {
            return Err(FitError::DidNotConverge {
                iterations,
                last: Box::new(FitIterate { params, objective }),
            });
        }

        let (alpha, _) = self.normal_equations(data, &expected, &jacobian);
        let (covariance, positive_definite) = match MatrixHelper::invert_spd(alpha.view()) {
            Some(inverse) => (inverse, true),
            None => match MatrixHelper::invert_pivoted(alpha.view()) {
                Some(inverse) => (inverse, false),
                None => (Array2::from_elem((n_params, n_params), f64::NAN), false),
            },
        };

        Ok(Solution {
            params,
            covariance,
            objective,
            iterations,
            positive_definite,
        })
    }

    /// Whether the Gauss-Newton decrease still predicted at `params` is
    /// negligible. Parameters the model's constraints hold at a bound are
    /// left out.
    fn stationary<M: LeastSquaresModel + ?Sized>(
        &self,
        model: &M,
        params: &[f64],
        alpha: &Array2<f64>,
        beta: &Array1<f64>,
        objective: f64,
    ) -> bool {
        let mut gain = 0.0;
        for (i, &b) in beta.iter().enumerate() {
            let mut nudged = params.to_vec();
            nudged[i] += b.signum() * 1e-6 * params[i].abs().max(1.0);
            model.constrain(&mut nudged);
            if nudged[i] == params[i] {
                continue;
            }
            gain += b * b / alpha[[i, i]].max(DIAG_FLOOR);
        }
        gain <= STATIONARY_GAIN * objective.max(1.0)
    }

    /// Expected bin contents and their Jacobian for the given parameters.
    fn predict<M: LeastSquaresModel + ?Sized>(
        &self,
        model: &M,
        params: &[f64],
        data: &Observations<'_>,
    ) -> (Vec<f64>, Array2<f64>) {
        let n_params = params.len();
        let nodes = integration_nodes(self.settings.integration);
        let mut expected = vec![0.0; data.len()];
        let mut jacobian = Array2::<f64>::zeros((data.len(), n_params));
        let mut gradient = vec![0.0; n_params];

        for (bin, value) in expected.iter_mut().enumerate() {
            let low = data.low[bin];
            let width = data.high[bin] - low;
            for &(offset, weight) in nodes {
                let x = low + offset * width;
                *value += weight * width * model.evaluate(x, params);
                model.gradient(x, params, &mut gradient);
                for (k, g) in gradient.iter().enumerate() {
                    jacobian[[bin, k]] += weight * width * g;
                }
            }
        }

        (expected, jacobian)
    }

    fn weight(&self, variance: f64, expected: f64) -> f64 {
        match self.settings.statistic {
            FitStatistic::LeastSquares => {
                1.0 / StatsHelper::floored_variance(variance, self.settings.variance_floor)
            }
            FitStatistic::PoissonLikelihood => 1.0 / expected.max(MODEL_FLOOR),
        }
    }

    fn objective(&self, data: &Observations<'_>, expected: &[f64]) -> f64 {
        match self.settings.statistic {
            FitStatistic::LeastSquares => data
                .counts
                .iter()
                .zip(data.variances)
                .zip(expected)
                .map(|((&y, &variance), &mu)| {
                    let residual = y - mu;
                    residual * residual
                        / StatsHelper::floored_variance(variance, self.settings.variance_floor)
                })
                .sum(),
            FitStatistic::PoissonLikelihood => data
                .counts
                .iter()
                .zip(expected)
                .map(|(&y, &mu)| StatsHelper::poisson_deviance_term(y, mu))
                .sum(),
        }
    }

    /// Curvature matrix `JᵀWJ` and right-hand side `JᵀW(y - μ)`.
    fn normal_equations(
        &self,
        data: &Observations<'_>,
        expected: &[f64],
        jacobian: &Array2<f64>,
    ) -> (Array2<f64>, Array1<f64>) {
        let n_params = jacobian.ncols();
        let mut alpha = Array2::<f64>::zeros((n_params, n_params));
        let mut beta = Array1::<f64>::zeros(n_params);

        for bin in 0..data.len() {
            let weight = self.weight(data.variances[bin], expected[bin]);
            let residual = data.counts[bin] - expected[bin];
            let row = jacobian.row(bin);
            for i in 0..n_params {
                let wi = weight * row[i];
                beta[i] += wi * residual;
                for j in 0..=i {
                    alpha[[i, j]] += wi * row[j];
                }
            }
        }
        for i in 0..n_params {
            for j in 0..i {
                alpha[[j, i]] = alpha[[i, j]];
            }
        }

        (alpha, beta)
    }
}

/// Relative sample positions inside a bin and their quadrature weights.
fn integration_nodes(integration: BinIntegration) -> &'static [(f64, f64)] {
    match integration {
        BinIntegration::Midpoint => &[(0.5, 1.0)],
        BinIntegration::Simpson => &[(0.0, 1.0 / 6.0), (0.5, 4.0 / 6.0), (1.0, 1.0 / 6.0)],
    }
}
