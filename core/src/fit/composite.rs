use ndarray::Array1;

use crate::fit::background::{Background, BackgroundModel};
use crate::fit::peak::{ParamMode, ParamPolicy, PeakShape, ShapeParam, MAX_SHAPE_PARAMS};
use crate::math::optimizer::LeastSquaresModel;

/// Where a shape parameter lives during the fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Free(usize),
    Fixed(f64),
}

/// Background part of the composite model.
#[derive(Debug, Clone)]
pub enum BackgroundTerm<'a> {
    /// Fitted beforehand and held fixed.
    External(&'a Background),
    /// Polynomial in `x - center` whose coefficients follow the peak parameters
    /// in the free vector.
    Joint {
        first: usize,
        degree: usize,
        center: f64,
    },
}

/// Sum of peaks plus background with the free parameters of all peaks packed
/// into one vector.
#[derive(Debug)]
pub struct CompositeModel<'a> {
    shapes: Vec<Box<dyn PeakShape>>,
    slots: Vec<Vec<Slot>>,
    background: BackgroundTerm<'a>,
    free: usize,
    /// Start values of the free vector.
    initial: Vec<f64>,
}

impl<'a> CompositeModel<'a> {
    /// Lays out the free vector from per-peak seeds. Equal parameters share
    /// one slot seeded with the mean over peaks; held parameters keep their
    /// seed.
    pub fn new(
        shapes: Vec<Box<dyn PeakShape>>,
        seeds: &[Vec<f64>],
        policy: &ParamPolicy,
        joint: Option<(usize, f64, Vec<f64>)>,
        external: Option<&'a Background>,
    ) -> Self {
        let mut initial = Vec::new();
        let mut shared: Vec<(ShapeParam, usize)> = Vec::new();
        let mut slots = Vec::with_capacity(shapes.len());

        for (peak, shape) in shapes.iter().enumerate() {
            let mut peak_slots = Vec::with_capacity(shape.parameter_count());
            for (k, &param) in shape.parameters().iter().enumerate() {
                let slot = match policy.mode(param) {
                    ParamMode::Free => {
                        initial.push(seeds[peak][k]);
                        Slot::Free(initial.len() - 1)
                    }
                    ParamMode::Equal => match shared.iter().find(|(p, _)| *p == param) {
                        Some(&(_, index)) => Slot::Free(index),
                        None => {
                            let mean = seeds
                                .iter()
                                .zip(&shapes)
                                .filter_map(|(seed, s)| s.index_of(param).map(|i| seed[i]))
                                .sum::<f64>()
                                / seeds.len().max(1) as f64;
                            initial.push(mean);
                            shared.push((param, initial.len() - 1));
                            Slot::Free(initial.len() - 1)
                        }
                    },
                    ParamMode::Hold => Slot::Fixed(seeds[peak][k]),
                    ParamMode::Fixed(value) => Slot::Fixed(value),
                };
                peak_slots.push(slot);
            }
            slots.push(peak_slots);
        }

        let background = match (joint, external) {
            (_, Some(fixed)) => BackgroundTerm::External(fixed),
            (Some((degree, center, start)), None) => {
                let first = initial.len();
                initial.extend(start.into_iter().chain(std::iter::repeat(0.0)).take(degree + 1));
                BackgroundTerm::Joint {
                    first,
                    degree,
                    center,
                }
            }
            (None, None) => BackgroundTerm::Joint {
                first: initial.len(),
                degree: 0,
                center: 0.0,
            },
        };
        let free = initial.len();

        Self {
            shapes,
            slots,
            background,
            free,
            initial,
        }
    }

    pub fn initial(&self) -> &[f64] {
        &self.initial
    }

    pub fn shapes(&self) -> &[Box<dyn PeakShape>] {
        &self.shapes
    }

    pub fn slots(&self, peak: usize) -> &[Slot] {
        &self.slots[peak]
    }

    pub fn background_term(&self) -> &BackgroundTerm<'a> {
        &self.background
    }

    /// Shape parameters of one peak resolved against the free vector.
    pub fn peak_params(&self, peak: usize, free: &[f64]) -> [f64; MAX_SHAPE_PARAMS] {
        let mut params = [0.0; MAX_SHAPE_PARAMS];
        for (value, slot) in params.iter_mut().zip(&self.slots[peak]) {
            *value = match *slot {
                Slot::Free(index) => free[index],
                Slot::Fixed(fixed) => fixed,
            };
        }
        params
    }

    /// Maps a gradient over one peak's shape parameters onto the free vector.
    pub fn lift_gradient(&self, peak: usize, local: &[f64]) -> Array1<f64> {
        let mut gradient = Array1::<f64>::zeros(self.free);
        for (g, slot) in local.iter().zip(&self.slots[peak]) {
            if let Slot::Free(index) = *slot {
                gradient[index] += g;
            }
        }
        gradient
    }

    /// Free-vector indices of shape parameters the shapes report as saturated.
    pub fn saturated_slots(&self, free: &[f64]) -> Vec<usize> {
        let mut indices = Vec::new();
        for (peak, shape) in self.shapes.iter().enumerate() {
            let local = self.peak_params(peak, free);
            for k in shape.saturated(&local[..shape.parameter_count()]) {
                if let Slot::Free(index) = self.slots[peak][k] {
                    if !indices.contains(&index) {
                        indices.push(index);
                    }
                }
            }
        }
        indices
    }

    /// The same model with the `pinned` free slots fixed at their values in
    /// `free`. The remaining free values become the start point.
    pub fn pin(&self, pinned: &[usize], free: &[f64]) -> CompositeModel<'a> {
        let mut initial = Vec::with_capacity(self.free);
        let remap: Vec<Option<usize>> = free
            .iter()
            .enumerate()
            .map(|(index, &value)| {
                (!pinned.contains(&index)).then(|| {
                    initial.push(value);
                    initial.len() - 1
                })
            })
            .collect();

        let slots = self
            .slots
            .iter()
            .map(|peak| {
                peak.iter()
                    .map(|slot| match *slot {
                        Slot::Free(index) => remap[index].map_or(Slot::Fixed(free[index]), Slot::Free),
                        fixed => fixed,
                    })
                    .collect()
            })
            .collect();
        let background = match self.background {
            BackgroundTerm::Joint {
                first,
                degree,
                center,
            } => BackgroundTerm::Joint {
                first: remap.get(first).copied().flatten().unwrap_or(initial.len()),
                degree,
                center,
            },
            BackgroundTerm::External(background) => BackgroundTerm::External(background),
        };

        Self {
            shapes: self.shapes.iter().map(|shape| shape.kind().build()).collect(),
            slots,
            background,
            free: initial.len(),
            initial,
        }
    }

    /// Coefficients of the jointly fitted background in `x - center`.
    pub fn joint_coefficients<'f>(&self, free: &'f [f64]) -> Option<(&'f [f64], f64, usize)> {
        match self.background {
            BackgroundTerm::Joint {
                first,
                degree,
                center,
            } if self.free > first => Some((&free[first..first + degree + 1], center, first)),
            _ => None,
        }
    }

    pub fn background_at(&self, x: f64, free: &[f64]) -> f64 {
        match &self.background {
            BackgroundTerm::External(background) => background.evaluate(x),
            BackgroundTerm::Joint {
                first,
                degree,
                center,
            } => {
                if self.free <= *first {
                    return 0.0;
                }
                let dx = x - center;
                free[*first..=*first + *degree]
                    .iter()
                    .rev()
                    .fold(0.0, |acc, &c| acc * dx + c)
            }
        }
    }
}

impl<'a> LeastSquaresModel for CompositeModel<'a> {
    fn parameter_count(&self) -> usize {
        self.free
    }

    fn evaluate(&self, x: f64, params: &[f64]) -> f64 {
        let peaks: f64 = self
            .shapes
            .iter()
            .enumerate()
            .map(|(peak, shape)| {
                let local = self.peak_params(peak, params);
                shape.evaluate(x, &local[..shape.parameter_count()])
            })
            .sum();
        peaks + self.background_at(x, params)
    }

    fn gradient(&self, x: f64, params: &[f64], out: &mut [f64]) {
        out.iter_mut().for_each(|g| *g = 0.0);
        let mut local_gradient = [0.0; MAX_SHAPE_PARAMS];
        for (peak, shape) in self.shapes.iter().enumerate() {
            let n = shape.parameter_count();
            let local = self.peak_params(peak, params);
            shape.derivatives(x, &local[..n], &mut local_gradient[..n]);
            for (g, slot) in local_gradient[..n].iter().zip(&self.slots[peak]) {
                if let Slot::Free(index) = *slot {
                    out[index] += g;
                }
            }
        }

        if let BackgroundTerm::Joint {
            first,
            degree,
            center,
        } = self.background
        {
            if self.free > first {
                let dx = x - center;
                let mut power = 1.0;
                for g in &mut out[first..=first + degree] {
                    *g = power;
                    power *= dx;
                }
            }
        }
    }

    fn constrain(&self, params: &mut [f64]) {
        for (peak, shape) in self.shapes.iter().enumerate() {
            let n = shape.parameter_count();
            let mut local = self.peak_params(peak, params);
            shape.constrain(&mut local[..n]);
            for (value, slot) in local[..n].iter().zip(&self.slots[peak]) {
                if let Slot::Free(index) = *slot {
                    params[index] = *value;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::peak::PeakKind;

    fn two_gaussians(policy: &ParamPolicy) -> CompositeModel<'static> {
        let shapes = vec![PeakKind::Gaussian.build(), PeakKind::Gaussian.build()];
        let seeds = vec![vec![10.0, 100.0, 2.0], vec![20.0, 50.0, 3.0]];
        CompositeModel::new(shapes, &seeds, policy, Some((1, 15.0, vec![5.0, 0.1])), None)
    }

    #[test]
    fn equal_width_shares_one_slot() {
        let model = two_gaussians(&ParamPolicy::default());
        // pos, vol, sigma, pos, vol + two background coefficients
        assert_eq!(model.parameter_count(), 7);
        assert_eq!(model.slots(0)[2], model.slots(1)[2]);
        assert_eq!(model.initial()[2], 2.5);
        assert_eq!(&model.initial()[5..], &[5.0, 0.1]);
    }

    #[test]
    fn held_and_fixed_parameters_leave_the_free_vector() {
        let policy = ParamPolicy {
            position: ParamMode::Hold,
            width: ParamMode::Fixed(FWHM),
            ..ParamPolicy::default()
        };
        let model = two_gaussians(&policy);
        assert_eq!(model.parameter_count(), 4);
        let params = model.peak_params(1, model.initial());
        assert_eq!(params[0], 20.0);
        assert!((params[2] - 2.0).abs() < 1e-12);
    }

    const FWHM: f64 = 2.0 * crate::math::special::FWHM_PER_SIGMA;

    #[test]
    fn pinned_slots_become_fixed_and_the_model_is_unchanged() {
        let model = two_gaussians(&ParamPolicy::default());
        let free = model.initial().to_vec();
        let pinned = model.pin(&[2], &free);
        // The shared sigma leaves; the background moves down one slot.
        assert_eq!(pinned.parameter_count(), 6);
        assert_eq!(pinned.slots(0)[2], Slot::Fixed(2.5));
        assert_eq!(pinned.slots(1)[2], Slot::Fixed(2.5));
        assert_eq!(pinned.slots(1)[0], Slot::Free(2));
        assert!(matches!(pinned.background_term(), BackgroundTerm::Joint { first: 4, .. }));
        for x in [8.0, 14.5, 21.0] {
            let a = model.evaluate(x, &free);
            let b = pinned.evaluate(x, pinned.initial());
            assert!((a - b).abs() < 1e-12 * a.abs().max(1.0));
        }
    }

    #[test]
    fn saturated_tails_are_reported_per_free_slot() {
        let kind = PeakKind::Theuerkauf {
            left_tail: true,
            right_tail: true,
            step: false,
        };
        let shapes = vec![kind.build()];
        let seeds = vec![vec![10.0, 100.0, 2.0, 1.0, 10.0]];
        let model = CompositeModel::new(shapes, &seeds, &ParamPolicy::default(), Some((0, 10.0, vec![3.0])), None);
        assert_eq!(model.saturated_slots(model.initial()), vec![4]);

        let pinned = model.pin(&[4], model.initial());
        assert!(pinned.saturated_slots(pinned.initial()).is_empty());
        assert_eq!(pinned.parameter_count(), 5);
        assert_eq!(pinned.peak_params(0, pinned.initial())[4], 10.0);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let model = two_gaussians(&ParamPolicy::default());
        let params = model.initial().to_vec();
        let mut analytic = vec![0.0; params.len()];
        for x in [8.0, 14.5, 21.0] {
            model.gradient(x, &params, &mut analytic);
            for k in 0..params.len() {
                let h = 1e-6 * params[k].abs().max(1.0);
                let mut up = params.clone();
                let mut down = params.clone();
                up[k] += h;
                down[k] -= h;
                let numeric = (model.evaluate(x, &up) - model.evaluate(x, &down)) / (2.0 * h);
                assert!((numeric - analytic[k]).abs() < 1e-5 * numeric.abs().max(1.0));
            }
        }
    }
}
