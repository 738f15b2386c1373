//! Core of the gamma spectrum analysis workflow: spectra and calibrations,
//! energy rebinning, joint peak fitting with propagated uncertainties, and the
//! persisted fit list.
//!
//! Everything is synchronous. A [`session::FitSession`] carries the state an
//! interactive front end would otherwise keep globally.

pub mod calibration;
pub mod fit;
pub mod math;
pub mod persist;
pub mod prelude;
pub mod session;
pub mod spectrum;
pub mod telemetry;

pub use prelude::{CoreResult, FitConfig, FitError, Uncertain};

#[cfg(test)]
pub(crate) mod testing {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};

    use crate::math::special::normal_cdf;
    use crate::spectrum::Spectrum;

    #[derive(Debug, Clone, Copy)]
    pub struct SyntheticPeak {
        pub position: f64,
        pub volume: f64,
        pub sigma: f64,
    }

    /// Unit bins centred on `0..n_bins` holding a flat background plus
    /// Gaussian peaks. With a seed every bin is drawn from a Poisson
    /// distribution around its expectation.
    pub fn synthetic_spectrum(
        name: &str,
        n_bins: usize,
        background: f64,
        peaks: &[SyntheticPeak],
        seed: Option<u64>,
    ) -> Spectrum {
        let expected: Vec<f64> = (0..n_bins)
            .map(|i| {
                let (low, high) = (i as f64 - 0.5, i as f64 + 0.5);
                background
                    + peaks
                        .iter()
                        .map(|p| {
                            p.volume
                                * (normal_cdf((high - p.position) / p.sigma)
                                    - normal_cdf((low - p.position) / p.sigma))
                        })
                        .sum::<f64>()
            })
            .collect();
        from_expected(name, expected, seed)
    }

    /// Like [`synthetic_spectrum`] for an arbitrary density, integrated with
    /// the midpoint rule on a fine grid.
    pub fn spectrum_from_density(
        name: &str,
        n_bins: usize,
        density: impl Fn(f64) -> f64,
        seed: Option<u64>,
    ) -> Spectrum {
        let steps = 32;
        let expected = (0..n_bins)
            .map(|i| {
                let low = i as f64 - 0.5;
                (0..steps)
                    .map(|k| density(low + (k as f64 + 0.5) / steps as f64) / steps as f64)
                    .sum()
            })
            .collect();
        from_expected(name, expected, seed)
    }

    fn from_expected(name: &str, expected: Vec<f64>, seed: Option<u64>) -> Spectrum {
        let counts = match seed {
            None => expected,
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed);
                expected
                    .into_iter()
                    .map(|mu| match Poisson::new(mu) {
                        Ok(poisson) => poisson.sample(&mut rng),
                        Err(_) => 0.0,
                    })
                    .collect()
            }
        };
        Spectrum::from_counts(name, counts).unwrap()
    }
}
