use serde::{Deserialize, Serialize};

use crate::fit::background::BackgroundKind;
use crate::fit::peak::{ParamPolicy, PeakKind};

/// Shared configuration for every fit executed by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub peak: PeakKind,
    pub params: ParamPolicy,
    /// Model used when background markers are present.
    pub background: BackgroundKind,
    /// Polynomial degree fitted together with the peaks when no background
    /// markers are set.
    pub joint_background_degree: usize,
    pub statistic: FitStatistic,
    /// Lower bound applied to bin variances before they become weights.
    pub variance_floor: f64,
    pub integration: BinIntegration,
    pub max_iterations: usize,
    /// Relative parameter change below which the optimizer stops.
    pub tolerance: f64,
    pub initial_lambda: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            peak: PeakKind::Gaussian,
            params: ParamPolicy::default(),
            background: BackgroundKind::Polynomial { degree: 1 },
            joint_background_degree: 1,
            statistic: FitStatistic::LeastSquares,
            variance_floor: 1.0,
            integration: BinIntegration::Simpson,
            max_iterations: 500,
            tolerance: 1e-7,
            initial_lambda: 1e-3,
        }
    }
}

/// Figure of merit minimised by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatistic {
    /// Weighted least squares with weights `1 / max(variance, floor)`.
    LeastSquares,
    /// Poisson deviance, weights `1 / model` refreshed every iteration.
    PoissonLikelihood,
}

/// How the model density is turned into an expected bin content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinIntegration {
    Midpoint,
    Simpson,
}

/// A value together with its one-sigma uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Uncertain {
    pub value: f64,
    pub error: f64,
}

impl Uncertain {
    pub fn new(value: f64, error: f64) -> Self {
        Self { value, error }
    }

    pub fn exact(value: f64) -> Self {
        Self { value, error: 0.0 }
    }

    pub fn relative_error(&self) -> f64 {
        if self.value == 0.0 {
            f64::INFINITY
        } else {
            (self.error / self.value).abs()
        }
    }
}

impl std::fmt::Display for Uncertain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4} +- {:.4}", self.value, self.error)
    }
}

/// Last optimizer state, kept for diagnostics when a fit fails.
#[derive(Debug, Clone, PartialEq)]
pub struct FitIterate {
    pub params: Vec<f64>,
    pub objective: f64,
}

/// Common error type for fitting, calibration and persistence.
#[derive(thiserror::Error, Debug)]
pub enum FitError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("fit did not converge after {iterations} iterations (objective {:.4})", .last.objective)]
    DidNotConverge {
        iterations: usize,
        last: Box<FitIterate>,
    },
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    #[error("invalid spectrum: {0}")]
    InvalidSpectrum(String),
    #[error("no pending fit to store")]
    NoPendingFit,
    #[error("unknown spectrum id {0}")]
    UnknownSpectrum(usize),
    #[error("persistence failure: {0}")]
    Persistence(#[from] serde_json::Error),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoreResult<T> = Result<T, FitError>;
