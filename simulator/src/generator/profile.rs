use anyhow::Context;
use gammacore::calibration::Calibration;
use gammacore::math::special::normal_cdf;
use gammacore::spectrum::Spectrum;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

/// What one step of the artificial spectrum contains besides its peak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Peak only.
    Clean,
    /// Peak on a constant background.
    Background,
    /// Peak on a constant background with Poisson fluctuations.
    Noisy,
}

pub const STEPS: [StepKind; 3] = [StepKind::Clean, StepKind::Background, StepKind::Noisy];

/// Configuration for the artificial test spectrum: one Gaussian peak per
/// step, each step `nbins_per_step` channels wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub name: String,
    pub nbins_per_step: usize,
    /// Peak sigma as a fraction of the step width.
    pub peak_width: f64,
    pub peak_volume: f64,
    /// Background counts per channel.
    pub background: f64,
    pub seed: u64,
    /// Background regions as fractions of the step width.
    pub bg_regions: Vec<(f64, f64)>,
    /// Polynomial calibration coefficients attached to the spectrum.
    pub calibration: Vec<f64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            name: "artificial".into(),
            nbins_per_step: 500,
            peak_width: 0.01,
            peak_volume: 100_000.0,
            background: 100.0,
            seed: 0,
            bg_regions: vec![(0.1, 0.3), (0.7, 0.9)],
            calibration: vec![0.0, 1.0],
        }
    }
}

impl GeneratorConfig {
    fn step_width(&self) -> f64 {
        self.nbins_per_step.max(1) as f64
    }

    pub fn peak_channel(&self, step: usize) -> f64 {
        (step as f64 + 0.5) * self.step_width()
    }

    pub fn peak_sigma(&self) -> f64 {
        self.peak_width * self.step_width()
    }

    pub fn background_markers(&self, step: usize) -> Vec<f64> {
        self.bg_regions
            .iter()
            .flat_map(|&(a, b)| [a, b])
            .map(|fraction| (step as f64 + fraction) * self.step_width())
            .collect()
    }

    /// Fit region of `step`, three peak widths to each side of the peak.
    pub fn region_markers(&self, step: usize) -> (f64, f64) {
        let half = 3.0 * self.peak_sigma();
        let center = self.peak_channel(step);
        (center - half, center + half)
    }
}

pub fn build_spectrum(config: &GeneratorConfig) -> anyhow::Result<Spectrum> {
    let step_bins = config.nbins_per_step.max(1);
    let total = step_bins
        .checked_mul(STEPS.len())
        .context("overflow computing spectrum size")?;
    let sigma = config.peak_sigma();
    anyhow::ensure!(sigma > 0.0, "peak width must be positive, got {}", config.peak_width);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut counts = Vec::with_capacity(total);
    for (step, kind) in STEPS.iter().enumerate() {
        let center = config.peak_channel(step);
        for offset in 0..step_bins {
            let channel = (step * step_bins + offset) as f64;
            let peak = config.peak_volume
                * (normal_cdf((channel + 0.5 - center) / sigma)
                    - normal_cdf((channel - 0.5 - center) / sigma));
            let expected = match kind {
                StepKind::Clean => peak,
                StepKind::Background | StepKind::Noisy => peak + config.background,
            };
            let count = match kind {
                StepKind::Noisy if expected > 0.0 => Poisson::new(expected)
                    .with_context(|| format!("poisson mean {} at channel {}", expected, channel))?
                    .sample(&mut rng),
                _ => expected,
            };
            counts.push(count);
        }
    }

    let calibration = Calibration::polynomial(config.calibration.clone())
        .context("building generator calibration")?;
    let spectrum = Spectrum::from_counts(config.name.clone(), counts)
        .context("building artificial spectrum")?
        .with_calibration(calibration);
    Ok(spectrum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_three_steps() {
        let config = GeneratorConfig {
            nbins_per_step: 200,
            ..Default::default()
        };
        let spectrum = build_spectrum(&config).unwrap();
        assert_eq!(spectrum.len(), 600);

        let clean: f64 = spectrum.counts()[..200].iter().sum();
        assert!((clean - config.peak_volume).abs() < 1e-6 * config.peak_volume);
        let with_background: f64 = spectrum.counts()[200..400].iter().sum();
        let expected = config.peak_volume + 200.0 * config.background;
        assert!((with_background - expected).abs() < 1e-6 * expected);
        assert!(spectrum.counts()[400..].iter().all(|c| c.fract() == 0.0));
    }

    #[test]
    fn markers_follow_the_step() {
        let config = GeneratorConfig::default();
        assert_eq!(config.peak_channel(2), 1250.0);
        assert_eq!(config.background_markers(2), vec![1050.0, 1150.0, 1350.0, 1450.0]);
        assert_eq!(config.region_markers(2), (1235.0, 1265.0));
    }

    #[test]
    fn seed_makes_noise_reproducible() {
        let config = GeneratorConfig::default();
        let a = build_spectrum(&config).unwrap();
        let b = build_spectrum(&config).unwrap();
        assert_eq!(a, b);
        let other = build_spectrum(&GeneratorConfig {
            seed: 1,
            ..config
        })
        .unwrap();
        assert_ne!(a.counts(), other.counts());
    }
}
