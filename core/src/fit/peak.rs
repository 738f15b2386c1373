use serde::{Deserialize, Serialize};

use crate::fit::gaussian::Gaussian;
use crate::fit::theuerkauf::Theuerkauf;
use crate::math::special::FWHM_PER_SIGMA;
use crate::spectrum::histogram::RegionData;
use crate::spectrum::markers::Interval;

/// Largest number of parameters any shape declares.
pub const MAX_SHAPE_PARAMS: usize = 7;

pub(crate) const MIN_SIGMA: f64 = 1e-3;
pub(crate) const MIN_TAIL: f64 = 1e-2;
const EDGE_BINS: usize = 3;

/// Physical meaning of one shape parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeParam {
    Position,
    Volume,
    Sigma,
    TailLeft,
    TailRight,
    StepHeight,
    StepWidth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeakKind {
    Gaussian,
    /// Gaussian core with optional exponential tails and background step.
    Theuerkauf {
        left_tail: bool,
        right_tail: bool,
        #[serde(default)]
        step: bool,
    },
}

impl PeakKind {
    pub fn build(&self) -> Box<dyn PeakShape> {
        match *self {
            PeakKind::Gaussian => Box::new(Gaussian),
            PeakKind::Theuerkauf {
                left_tail,
                right_tail,
                step,
            } => Box::new(Theuerkauf::new(left_tail, right_tail, step)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeakKind::Gaussian => "gaussian",
            PeakKind::Theuerkauf { .. } => "theuerkauf",
        }
    }
}

/// How one shape parameter takes part in a fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamMode {
    Free,
    /// One value shared by every peak of the fit.
    Equal,
    /// Fixed at the seed value.
    Hold,
    Fixed(f64),
}

/// Per-parameter modes applied to every peak of a fit. Volume is always free.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamPolicy {
    pub position: ParamMode,
    pub width: ParamMode,
    pub tail_left: ParamMode,
    pub tail_right: ParamMode,
    pub step_height: ParamMode,
    /// Held by default: with a small step the width is barely constrained.
    pub step_width: ParamMode,
}

impl Default for ParamPolicy {
    fn default() -> Self {
        Self {
            position: ParamMode::Free,
            width: ParamMode::Equal,
            tail_left: ParamMode::Free,
            tail_right: ParamMode::Free,
            step_height: ParamMode::Free,
            step_width: ParamMode::Hold,
        }
    }
}

impl ParamPolicy {
    pub fn mode(&self, param: ShapeParam) -> ParamMode {
        match param {
            ShapeParam::Position => self.position,
            ShapeParam::Volume => ParamMode::Free,
            ShapeParam::Sigma => match self.width {
                // Width is configured as FWHM; shapes work in sigma.
                ParamMode::Fixed(fwhm) => ParamMode::Fixed(fwhm / FWHM_PER_SIGMA),
                other => other,
            },
            ShapeParam::TailLeft => self.tail_left,
            ShapeParam::TailRight => self.tail_right,
            ShapeParam::StepHeight => self.step_height,
            ShapeParam::StepWidth => self.step_width,
        }
    }
}

/// Everything a shape needs to derive start values from a peak marker.
pub struct SeedContext<'a> {
    pub marker: f64,
    pub region: Interval,
    pub data: &'a RegionData,
    /// Background density estimate at every bin centre of `data`.
    pub baseline: &'a [f64],
}

/// Position, height above background and sigma estimated from the data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreSeed {
    pub position: f64,
    pub amplitude: f64,
    pub sigma: f64,
}

impl<'a> SeedContext<'a> {
    fn excess(&self, index: usize) -> f64 {
        self.data.density(index) - self.baseline.get(index).copied().unwrap_or(0.0)
    }

    /// Mean excess over the baseline in the outermost bins on each side.
    pub fn edge_excess(&self) -> (f64, f64) {
        let n = self.data.len();
        let take = EDGE_BINS.min(n);
        if take == 0 {
            return (0.0, 0.0);
        }
        let mean = |range: std::ops::Range<usize>| range.map(|i| self.excess(i)).sum::<f64>() / take as f64;
        (mean(0..take), mean(n - take..n))
    }

    /// Local maximum next to the marker, then a walk to half maximum on both
    /// sides. Falls back to a fraction of the region when neither side drops
    /// below half maximum.
    pub fn core_seed(&self) -> CoreSeed {
        let fallback_sigma = self.region.width() / 4.0 / FWHM_PER_SIGMA;
        let n = self.data.len();
        if n == 0 {
            return CoreSeed {
                position: self.marker,
                amplitude: 1.0,
                sigma: fallback_sigma.max(MIN_SIGMA),
            };
        }

        let nearest = (0..n)
            .min_by(|&a, &b| {
                (self.data.center(a) - self.marker)
                    .abs()
                    .total_cmp(&(self.data.center(b) - self.marker).abs())
            })
            .unwrap_or(0);
        let best = (nearest.saturating_sub(2)..(nearest + 3).min(n))
            .max_by(|&a, &b| self.excess(a).total_cmp(&self.excess(b)))
            .unwrap_or(nearest);

        let amplitude = self.excess(best).max(1e-6);
        let half = 0.5 * amplitude;
        let crossing = |inner: usize, outer: usize| {
            let (e_in, e_out) = (self.excess(inner), self.excess(outer));
            let (c_in, c_out) = (self.data.center(inner), self.data.center(outer));
            if e_in == e_out {
                c_out
            } else {
                c_in + (e_in - half) / (e_in - e_out) * (c_out - c_in)
            }
        };

        let left = (0..best)
            .rev()
            .find(|&i| self.excess(i) <= half)
            .map(|i| crossing(i + 1, i));
        let right = (best + 1..n)
            .find(|&i| self.excess(i) <= half)
            .map(|i| crossing(i - 1, i));
        let peak_center = self.data.center(best);
        let fwhm = match (left, right) {
            (Some(l), Some(r)) => r - l,
            (Some(l), None) => 2.0 * (peak_center - l),
            (None, Some(r)) => 2.0 * (r - peak_center),
            (None, None) => self.region.width() / 4.0,
        };

        let min_sigma = (0.25 * self.data.width(best)).max(MIN_SIGMA);
        let max_sigma = (0.5 * self.region.width()).max(min_sigma);
        CoreSeed {
            position: self.marker,
            amplitude,
            sigma: (fwhm / FWHM_PER_SIGMA).clamp(min_sigma, max_sigma),
        }
    }
}

/// A normalised peak shape `vol * norm * f(x - pos)`.
///
/// Parameter slices passed to every method follow the order of
/// [`PeakShape::parameters`], which always starts with position, volume and
/// sigma.
pub trait PeakShape: std::fmt::Debug {
    fn kind(&self) -> PeakKind;
    fn parameters(&self) -> &[ShapeParam];

    /// Counts per unit channel at `x`.
    fn evaluate(&self, x: f64, params: &[f64]) -> f64;
    fn derivatives(&self, x: f64, params: &[f64], out: &mut [f64]);

    /// Height of a unit-volume peak.
    fn norm(&self, params: &[f64]) -> f64;
    fn norm_gradient(&self, params: &[f64], out: &mut [f64]);

    fn seed(&self, context: &SeedContext<'_>) -> Vec<f64>;

    fn constrain(&self, params: &mut [f64]) {
        params[1] = params[1].max(0.0);
        params[2] = params[2].max(MIN_SIGMA);
    }

    /// Indices of parameters sitting at a bound where they no longer change
    /// the shape. The fitter holds them and fits again.
    fn saturated(&self, _params: &[f64]) -> Vec<usize> {
        Vec::new()
    }

    fn index_of(&self, param: ShapeParam) -> Option<usize> {
        self.parameters().iter().position(|&p| p == param)
    }

    fn parameter_count(&self) -> usize {
        self.parameters().len()
    }
}
