use std::f64::consts::{FRAC_PI_2, PI, SQRT_2};

use crate::fit::peak::{PeakKind, PeakShape, SeedContext, ShapeParam, MIN_SIGMA, MIN_TAIL};
use crate::math::special::erf;

/// Tail lengths are kept within these multiples of sigma. Past the upper bound
/// the tail carries a negligible share of the area.
pub(crate) const TAIL_MIN_SIGMAS: f64 = 0.5;
pub(crate) const TAIL_MAX_SIGMAS: f64 = 5.0;
/// Fraction of the upper tail bound at which a tail counts as absent.
const SATURATION: f64 = 0.95;
const MIN_STEP_WIDTH: f64 = 1e-2;
const STEP_WIDTH_SEED: f64 = 1.0;

/// Gaussian core joined to exponential tails at `pos - tl` and `pos + tr`,
/// optionally on top of a smoothed background step.
///
/// With `dx = x - pos` the exponent is
///
/// ```text
/// dx < -tl :  tl / sigma^2 * (dx + tl / 2)
/// dx >  tr : -tr / sigma^2 * (dx - tr / 2)
/// otherwise: -dx^2 / (2 sigma^2)
/// ```
///
/// which is continuous with a continuous first derivative at both joins. The
/// step adds `sh * (pi/2 + atan(sw * dx / (sqrt(2) sigma)))` to the unit
/// shape. It is scaled by `vol * norm` like the peak but does not count
/// towards the volume.
///
/// Parameters are ordered position, volume, sigma, then the left tail, the
/// right tail, step height and step width as far as they are enabled.
#[derive(Debug, Clone)]
pub struct Theuerkauf {
    left: Option<usize>,
    right: Option<usize>,
    /// Index of the step height; the step width follows it.
    step: Option<usize>,
    parameters: Vec<ShapeParam>,
}

/// Area of the unit-height shape and its partial derivatives.
#[derive(Debug, Clone, Copy)]
struct Integral {
    value: f64,
    d_sigma: f64,
    d_left: f64,
    d_right: f64,
}

/// Exponent of the peak part and its derivatives.
#[derive(Debug, Clone, Copy)]
struct Exponent {
    y: f64,
    d_dx: f64,
    d_sigma: f64,
    d_left: f64,
    d_right: f64,
}

/// `pi/2 + atan(u)` with `u = sw dx / (sqrt(2) sigma)` and its derivative in `u`.
#[derive(Debug, Clone, Copy)]
struct Step {
    height: f64,
    width: f64,
    u: f64,
    value: f64,
    slope: f64,
}

impl Theuerkauf {
    pub fn new(left_tail: bool, right_tail: bool, step: bool) -> Self {
        let mut parameters = vec![ShapeParam::Position, ShapeParam::Volume, ShapeParam::Sigma];
        let mut push = |enabled: bool, params: &[ShapeParam]| {
            enabled.then(|| {
                parameters.extend_from_slice(params);
                parameters.len() - params.len()
            })
        };
        let left = push(left_tail, &[ShapeParam::TailLeft]);
        let right = push(right_tail, &[ShapeParam::TailRight]);
        let step = push(step, &[ShapeParam::StepHeight, ShapeParam::StepWidth]);
        Self {
            left,
            right,
            step,
            parameters,
        }
    }

    fn tails(&self, params: &[f64]) -> (Option<f64>, Option<f64>) {
        (self.left.map(|i| params[i]), self.right.map(|i| params[i]))
    }

    fn integral(&self, params: &[f64]) -> Integral {
        let sigma = params[2];
        let (left, right) = self.tails(params);
        let mut integral = Integral {
            value: 0.0,
            d_sigma: 0.0,
            d_left: 0.0,
            d_right: 0.0,
        };

        for (tail, d_tail) in [(left, &mut integral.d_left), (right, &mut integral.d_right)] {
            match tail {
                Some(t) => {
                    let a = t / (SQRT_2 * sigma);
                    let e = (-a * a).exp();
                    let core = FRAC_PI_2.sqrt() * sigma * erf(a);
                    let tail_area = sigma * sigma / t * e;
                    integral.value += core + tail_area;
                    integral.d_sigma += FRAC_PI_2.sqrt() * erf(a) - t / sigma * e
                        + e * (2.0 * sigma / t + t / sigma);
                    *d_tail = -e * sigma * sigma / (t * t);
                }
                None => {
                    integral.value += FRAC_PI_2.sqrt() * sigma;
                    integral.d_sigma += FRAC_PI_2.sqrt();
                }
            }
        }
        integral
    }

    fn exponent(&self, dx: f64, params: &[f64]) -> Exponent {
        let sigma = params[2];
        let s2 = sigma * sigma;
        match self.tails(params) {
            (Some(tl), _) if dx < -tl => {
                let y = tl / s2 * (dx + 0.5 * tl);
                Exponent {
                    y,
                    d_dx: tl / s2,
                    d_sigma: -2.0 * y / sigma,
                    d_left: (dx + tl) / s2,
                    d_right: 0.0,
                }
            }
            (_, Some(tr)) if dx > tr => {
                let y = -tr / s2 * (dx - 0.5 * tr);
                Exponent {
                    y,
                    d_dx: -tr / s2,
                    d_sigma: -2.0 * y / sigma,
                    d_left: 0.0,
                    d_right: (tr - dx) / s2,
                }
            }
            _ => Exponent {
                y: -dx * dx / (2.0 * s2),
                d_dx: -dx / s2,
                d_sigma: dx * dx / (s2 * sigma),
                d_left: 0.0,
                d_right: 0.0,
            },
        }
    }

    fn step(&self, dx: f64, params: &[f64]) -> Option<Step> {
        self.step.map(|i| {
            let (height, width) = (params[i], params[i + 1]);
            let u = width * dx / (SQRT_2 * params[2]);
            Step {
                height,
                width,
                u,
                value: FRAC_PI_2 + u.atan(),
                slope: 1.0 / (1.0 + u * u),
            }
        })
    }
}

impl PeakShape for Theuerkauf {
    fn kind(&self) -> PeakKind {
        PeakKind::Theuerkauf {
            left_tail: self.left.is_some(),
            right_tail: self.right.is_some(),
            step: self.step.is_some(),
        }
    }

    fn parameters(&self) -> &[ShapeParam] {
        &self.parameters
    }

    fn evaluate(&self, x: f64, params: &[f64]) -> f64 {
        let dx = x - params[0];
        let peak = self.exponent(dx, params).y.exp();
        let step = self.step(dx, params).map_or(0.0, |s| s.height * s.value);
        params[1] * self.norm(params) * (peak + step)
    }

    fn derivatives(&self, x: f64, params: &[f64], out: &mut [f64]) {
        let (vol, sigma) = (params[1], params[2]);
        let dx = x - params[0];
        let integral = self.integral(params);
        let norm = 1.0 / integral.value;
        let exponent = self.exponent(dx, params);
        let peak = exponent.y.exp();
        let step = self.step(dx, params);
        let total = peak + step.map_or(0.0, |s| s.height * s.value);
        let scale = vol * norm;
        let value = scale * total;

        // Partial derivatives of the step term in position and sigma.
        let (step_d_pos, step_d_sigma) = step.map_or((0.0, 0.0), |s| {
            let d_u = s.height * s.slope;
            (-d_u * s.width / (SQRT_2 * sigma), -d_u * s.u / sigma)
        });

        out[0] = scale * (-peak * exponent.d_dx + step_d_pos);
        out[1] = norm * total;
        out[2] = scale * (peak * exponent.d_sigma + step_d_sigma)
            - value * integral.d_sigma / integral.value;
        if let Some(i) = self.left {
            out[i] = scale * peak * exponent.d_left - value * integral.d_left / integral.value;
        }
        if let Some(i) = self.right {
            out[i] = scale * peak * exponent.d_right - value * integral.d_right / integral.value;
        }
        if let (Some(i), Some(s)) = (self.step, step) {
            out[i] = scale * s.value;
            out[i + 1] = scale * s.height * s.slope * dx / (SQRT_2 * sigma);
        }
    }

    fn norm(&self, params: &[f64]) -> f64 {
        1.0 / self.integral(params).value
    }

    fn norm_gradient(&self, params: &[f64], out: &mut [f64]) {
        let integral = self.integral(params);
        let scale = -1.0 / (integral.value * integral.value);
        out.iter_mut().for_each(|g| *g = 0.0);
        out[2] = scale * integral.d_sigma;
        if let Some(i) = self.left {
            out[i] = scale * integral.d_left;
        }
        if let Some(i) = self.right {
            out[i] = scale * integral.d_right;
        }
    }

    fn seed(&self, context: &SeedContext<'_>) -> Vec<f64> {
        let core = context.core_seed();
        let mut params = vec![core.position, 1.0, core.sigma];
        if self.left.is_some() {
            params.push(2.0 * core.sigma);
        }
        if self.right.is_some() {
            params.push(2.0 * core.sigma);
        }
        if self.step.is_some() {
            let (left, right) = context.edge_excess();
            params.push((right - left) / (PI * core.amplitude));
            params.push(STEP_WIDTH_SEED);
        }
        params[1] = core.amplitude / self.norm(&params);
        params
    }

    fn constrain(&self, params: &mut [f64]) {
        params[1] = params[1].max(0.0);
        params[2] = params[2].max(MIN_SIGMA);
        let low = (TAIL_MIN_SIGMAS * params[2]).max(MIN_TAIL);
        let high = (TAIL_MAX_SIGMAS * params[2]).max(low);
        for i in [self.left, self.right].into_iter().flatten() {
            params[i] = params[i].clamp(low, high);
        }
        if let Some(i) = self.step {
            params[i + 1] = params[i + 1].max(MIN_STEP_WIDTH);
        }
    }

    /// Tails pushed against their upper bound describe no tail at all.
    fn saturated(&self, params: &[f64]) -> Vec<usize> {
        let limit = SATURATION * TAIL_MAX_SIGMAS * params[2];
        [self.left, self.right]
            .into_iter()
            .flatten()
            .filter(|&i| params[i] >= limit)
            .collect()
    }
}
