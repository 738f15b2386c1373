use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::fit::background::{Background, BackgroundModel};
use crate::fit::peak::PeakKind;
use crate::prelude::{FitConfig, Uncertain};
use crate::spectrum::markers::{Interval, MarkerSet};

/// Position, volume and width of a peak in one unit system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakValues {
    pub position: Uncertain,
    pub volume: Uncertain,
    /// Full width at half maximum of the Gaussian core.
    pub width: Uncertain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakResult {
    pub(crate) kind: PeakKind,
    /// Shape parameters in the order the shape declares them.
    pub(crate) params: Vec<f64>,
    pub(crate) uncalibrated: PeakValues,
    pub(crate) calibrated: PeakValues,
    pub(crate) sigma: Uncertain,
    pub(crate) amplitude: Uncertain,
    pub(crate) tail_left: Option<Uncertain>,
    pub(crate) tail_right: Option<Uncertain>,
    #[serde(default)]
    pub(crate) step_height: Option<Uncertain>,
    #[serde(default)]
    pub(crate) step_width: Option<Uncertain>,
}

impl PeakResult {
    pub fn kind(&self) -> PeakKind {
        self.kind
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    /// Values in channel units.
    pub fn uncalibrated(&self) -> &PeakValues {
        &self.uncalibrated
    }

    /// Values in energy units of the calibration the fit was made with.
    pub fn calibrated(&self) -> &PeakValues {
        &self.calibrated
    }

    pub fn position(&self) -> Uncertain {
        self.uncalibrated.position
    }

    pub fn volume(&self) -> Uncertain {
        self.uncalibrated.volume
    }

    pub fn width(&self) -> Uncertain {
        self.uncalibrated.width
    }

    pub fn sigma(&self) -> Uncertain {
        self.sigma
    }

    /// Height of the peak above background.
    pub fn amplitude(&self) -> Uncertain {
        self.amplitude
    }

    pub fn tail_left(&self) -> Option<Uncertain> {
        self.tail_left
    }

    pub fn tail_right(&self) -> Option<Uncertain> {
        self.tail_right
    }

    pub fn step_height(&self) -> Option<Uncertain> {
        self.step_height
    }

    pub fn step_width(&self) -> Option<Uncertain> {
        self.step_width
    }

    /// Counts per channel contributed by this peak at `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        self.kind.build().evaluate(x, &self.params)
    }
}

/// Where the background of a fit came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum BackgroundSource {
    /// Fitted to background regions and held fixed during the peak fit.
    Regions { regions: Vec<Interval> },
    /// Fitted together with the peaks.
    Joint,
}

/// Immutable record of one converged fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub(crate) index: Option<usize>,
    pub(crate) spectrum: String,
    pub(crate) region: Interval,
    pub(crate) markers: MarkerSet,
    pub(crate) config: FitConfig,
    pub(crate) calibration: Calibration,
    pub(crate) background: Background,
    pub(crate) background_source: BackgroundSource,
    pub(crate) peaks: Vec<PeakResult>,
    pub(crate) chi_square: f64,
    pub(crate) degrees_of_freedom: usize,
    pub(crate) iterations: usize,
    pub(crate) low_confidence: bool,
    pub(crate) warnings: Vec<String>,
}

impl FitResult {
    /// The same fit under the index it is stored with.
    pub fn into_stored(self, index: usize) -> Self {
        Self {
            index: Some(index),
            ..self
        }
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn spectrum_name(&self) -> &str {
        &self.spectrum
    }

    pub fn region(&self) -> Interval {
        self.region
    }

    pub fn markers(&self) -> &MarkerSet {
        &self.markers
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Calibration in effect when the fit was made.
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn background(&self) -> &Background {
        &self.background
    }

    pub fn background_source(&self) -> &BackgroundSource {
        &self.background_source
    }

    /// Peaks in ascending position order.
    pub fn peaks(&self) -> &[PeakResult] {
        &self.peaks
    }

    /// Chi-square, or Poisson deviance for likelihood fits.
    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    pub fn degrees_of_freedom(&self) -> usize {
        self.degrees_of_freedom
    }

    pub fn reduced_chi_square(&self) -> f64 {
        if self.degrees_of_freedom == 0 {
            f64::NAN
        } else {
            self.chi_square / self.degrees_of_freedom as f64
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn low_confidence(&self) -> bool {
        self.low_confidence
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Total model density (background plus all peaks) at `x`.
    pub fn evaluate(&self, x: f64) -> f64 {
        self.background.evaluate(x) + self.peaks.iter().map(|p| p.evaluate(x)).sum::<f64>()
    }

    /// One line per peak, as printed after `fit execute`.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "{} fit {} [{:.2}, {:.2}] chi2/ndf {:.3}/{}{}",
            self.spectrum,
            self.index.map_or_else(|| "pending".to_string(), |i| i.to_string()),
            self.region.lower,
            self.region.upper,
            self.chi_square,
            self.degrees_of_freedom,
            if self.low_confidence { " (low confidence)" } else { "" }
        )];
        for (n, peak) in self.peaks.iter().enumerate() {
            lines.push(format!(
                "  peak {}: pos {} vol {} width {} | E {} fwhm {}",
                n,
                peak.uncalibrated.position,
                peak.uncalibrated.volume,
                peak.uncalibrated.width,
                peak.calibrated.position,
                peak.calibrated.width
            ));
        }
        lines.join("\n")
    }
}
