use std::f64::consts::PI;

use crate::fit::peak::{PeakKind, PeakShape, SeedContext, ShapeParam};

const PARAMETERS: [ShapeParam; 3] = [ShapeParam::Position, ShapeParam::Volume, ShapeParam::Sigma];

/// `vol / (sqrt(2 pi) sigma) * exp(-(x - pos)^2 / (2 sigma^2))`
#[derive(Debug, Clone, Copy, Default)]
pub struct Gaussian;

impl PeakShape for Gaussian {
    fn kind(&self) -> PeakKind {
        PeakKind::Gaussian
    }

    fn parameters(&self) -> &[ShapeParam] {
        &PARAMETERS
    }

    fn evaluate(&self, x: f64, params: &[f64]) -> f64 {
        let (pos, vol, sigma) = (params[0], params[1], params[2]);
        let z = (x - pos) / sigma;
        vol * self.norm(params) * (-0.5 * z * z).exp()
    }

    fn derivatives(&self, x: f64, params: &[f64], out: &mut [f64]) {
        let (pos, vol, sigma) = (params[0], params[1], params[2]);
        let dx = x - pos;
        let z = dx / sigma;
        let shape = self.norm(params) * (-0.5 * z * z).exp();
        let value = vol * shape;
        out[0] = value * dx / (sigma * sigma);
        out[1] = shape;
        out[2] = value * (z * z - 1.0) / sigma;
    }

    fn norm(&self, params: &[f64]) -> f64 {
        1.0 / ((2.0 * PI).sqrt() * params[2])
    }

    fn norm_gradient(&self, params: &[f64], out: &mut [f64]) {
        out[0] = 0.0;
        out[1] = 0.0;
        out[2] = -self.norm(params) / params[2];
    }

    fn seed(&self, context: &SeedContext<'_>) -> Vec<f64> {
        let core = context.core_seed();
        let volume = core.amplitude * (2.0 * PI).sqrt() * core.sigma;
        vec![core.position, volume, core.sigma]
    }
}
