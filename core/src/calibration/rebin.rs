use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Binomial, Distribution};
use serde::{Deserialize, Serialize};

use crate::calibration::function::Calibration;
use crate::prelude::{CoreResult, FitError};
use crate::spectrum::histogram::{Bin, Spectrum};
use crate::telemetry::log::LogManager;

/// Upper bound on the number of output bins a single calbin may create.
const MAX_OUTPUT_BINS: usize = 1 << 24;

/// How counts of one input bin are split across output bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RebinMode {
    /// Deterministic split proportional to the energy overlap. Variances are
    /// propagated as `sum(f^2 var)`.
    Fractional,
    /// Whole counts are assigned to output bins by sequential binomial draws;
    /// the fractional rest is split by overlap. Variances follow the counts.
    Sampled { seed: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalbinOptions {
    /// Output bin width in energy units.
    pub binsize: f64,
    pub mode: RebinMode,
}

impl Default for CalbinOptions {
    fn default() -> Self {
        Self {
            binsize: 1.0,
            mode: RebinMode::Fractional,
        }
    }
}

impl CalbinOptions {
    pub fn with_binsize(binsize: f64) -> Self {
        Self {
            binsize,
            ..Default::default()
        }
    }
}

/// Resamples a calibrated spectrum onto bins of uniform width in energy.
pub struct Rebinner {
    options: CalbinOptions,
    logger: LogManager,
}

impl Rebinner {
    pub fn new(options: CalbinOptions) -> Self {
        Self {
            options,
            logger: LogManager::for_component("calbin"),
        }
    }

    pub fn options(&self) -> &CalbinOptions {
        &self.options
    }

    /// Returns the rebinned spectrum. The new spectrum has unit channels and the
    /// linear calibration `E(ch) = start + binsize (ch + 0.5)`, where `start`
    /// is the lowest bin-edge energy of the input.
    pub fn rebin(&self, spectrum: &Spectrum) -> CoreResult<Spectrum> {
        let binsize = self.options.binsize;
        if !binsize.is_finite() || binsize <= 0.0 {
            return Err(FitError::InvalidCalibration(format!(
                "binsize {} must be positive",
                binsize
            )));
        }

        let calibration = spectrum.calibration();
        let channels: Vec<f64> = spectrum.bins().flat_map(|b| [b.low, b.high]).collect();
        calibration.check_monotonic(&channels)?;

        let intervals: Vec<(f64, f64)> = spectrum
            .bins()
            .map(|b| {
                let (a, c) = (calibration.energy(b.low), calibration.energy(b.high));
                (a.min(c), a.max(c))
            })
            .collect();
        let start = intervals
            .iter()
            .map(|i| i.0)
            .fold(f64::INFINITY, f64::min);
        let stop = intervals
            .iter()
            .map(|i| i.1)
            .fold(f64::NEG_INFINITY, f64::max);

        let span = (stop - start) / binsize;
        if span > MAX_OUTPUT_BINS as f64 {
            return Err(FitError::InvalidCalibration(format!(
                "binsize {} would create more than {} bins",
                binsize, MAX_OUTPUT_BINS
            )));
        }
        let n_out = ((span - 1e-9).ceil() as usize).max(1);

        let mut counts = vec![0.0; n_out];
        let mut variances = vec![0.0; n_out];
        let mut covariance_sums = vec![0.0; n_out];
        let mut rng = match self.options.mode {
            RebinMode::Sampled { seed } => Some(StdRng::seed_from_u64(seed)),
            RebinMode::Fractional => None,
        };

        for (index, (bin, &(low, high))) in spectrum.bins().zip(&intervals).enumerate() {
            if bin.count == 0.0 && bin.variance == 0.0 {
                continue;
            }
            let row_sum = spectrum.covariance_sum(index);
            let shares = overlap_shares(low, high, start, binsize, n_out);
            match rng.as_mut() {
                None => {
                    for &(k, fraction) in &shares {
                        counts[k] += fraction * bin.count;
                        variances[k] += fraction * fraction * bin.variance;
                        covariance_sums[k] += fraction * row_sum;
                    }
                }
                Some(rng) => {
                    // Whole counts are drawn, the fractional rest is split by overlap.
                    let whole = bin.count.floor();
                    let rest = bin.count - whole;
                    let mut remaining = whole as u64;
                    let mut remaining_share = 1.0;
                    for (position, &(k, fraction)) in shares.iter().enumerate() {
                        let drawn = if remaining == 0 {
                            0
                        } else if position + 1 == shares.len() {
                            remaining
                        } else {
                            let p = (fraction / remaining_share).clamp(0.0, 1.0);
                            Binomial::new(remaining, p)
                                .map(|d| d.sample(rng))
                                .unwrap_or(0)
                        };
                        remaining -= drawn;
                        remaining_share -= fraction;

                        let assigned = drawn as f64 + fraction * rest;
                        counts[k] += assigned;
                        // Variance follows the counts it belongs to.
                        let (variance, row) = if bin.count > 0.0 {
                            (bin.variance * assigned / bin.count, row_sum * assigned / bin.count)
                        } else {
                            (fraction * bin.variance, fraction * row_sum)
                        };
                        variances[k] += variance;
                        covariance_sums[k] += row;
                    }
                }
            }
        }

        let bins = counts
            .iter()
            .zip(&variances)
            .enumerate()
            .map(|(k, (&count, &variance))| Bin {
                count,
                variance,
                low: k as f64 - 0.5,
                high: k as f64 + 0.5,
            })
            .collect();
        let rebinned = Spectrum::from_bins(spectrum.name(), bins)?
            .with_covariance_sums(covariance_sums)?
            .with_calibration(Calibration::linear(start + 0.5 * binsize, binsize));

        self.logger.record(&format!(
            "{}: {} bins -> {} bins (binsize {}), total {:.3} -> {:.3}",
            spectrum.name(),
            spectrum.len(),
            rebinned.len(),
            binsize,
            spectrum.total(),
            rebinned.total()
        ));
        Ok(rebinned)
    }
}

/// Output bins overlapped by the energy interval `[low, high]` with the
/// fraction of the interval falling into each. Fractions sum to exactly one.
fn overlap_shares(low: f64, high: f64, start: f64, binsize: f64, n_out: usize) -> Vec<(usize, f64)> {
    let index_of = |e: f64| (((e - start) / binsize).floor().max(0.0) as usize).min(n_out - 1);
    let first = index_of(low);
    let last = index_of(high);
    let width = high - low;

    if first == last || width <= 0.0 {
        return vec![(first, 1.0)];
    }

    let mut shares: Vec<(usize, f64)> = (first..=last)
        .filter_map(|k| {
            let edge_low = start + k as f64 * binsize;
            let edge_high = edge_low + binsize;
            let overlap = high.min(edge_high) - low.max(edge_low);
            (overlap > 0.0).then_some((k, overlap / width))
        })
        .collect();

    if shares.is_empty() {
        return vec![(first, 1.0)];
    }
    let assigned: f64 = shares[..shares.len() - 1].iter().map(|s| s.1).sum();
    if let Some(tail) = shares.last_mut() {
        tail.1 = 1.0 - assigned;
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Spectrum {
        Spectrum::from_counts("ramp", (0..n).map(|i| (i % 17) as f64 * 3.0 + 1.0).collect()).unwrap()
    }

    #[test]
    fn conserves_total_counts_for_various_binsizes() {
        let spectrum = ramp(301).with_calibration(Calibration::polynomial(vec![5.0, 0.73, 2e-4]).unwrap());
        for binsize in [1.0, 2.0, 3.7] {
            let rebinned = Rebinner::new(CalbinOptions::with_binsize(binsize))
                .rebin(&spectrum)
                .unwrap();
            assert!(
                (rebinned.total() - spectrum.total()).abs() < 1e-9 * spectrum.total(),
                "binsize {}",
                binsize
            );
            assert!(rebinned.total_variance() <= spectrum.total_variance() + 1e-9);
        }
    }

    #[test]
    fn identity_binsize_one_is_a_no_op() {
        let spectrum = ramp(50);
        let rebinned = Rebinner::new(CalbinOptions::default()).rebin(&spectrum).unwrap();
        assert_eq!(rebinned.len(), 50);
        for (a, b) in rebinned.counts().iter().zip(spectrum.counts()) {
            assert!((a - b).abs() < 1e-12);
        }
        assert!((rebinned.calibration().energy(7.0) - 7.0).abs() < 1e-12);
    }

    #[test]
    fn binsize_two_merges_pairs_and_sums_variances() {
        let spectrum = Spectrum::from_counts("pairs", vec![1.0, 3.0, 5.0, 7.0]).unwrap();
        let rebinned = Rebinner::new(CalbinOptions::with_binsize(2.0)).rebin(&spectrum).unwrap();
        assert_eq!(rebinned.counts(), &[4.0, 12.0]);
        assert_eq!(rebinned.variances(), &[4.0, 12.0]);
        assert!((rebinned.calibration().energy(1.0) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn split_bins_propagate_squared_fractions() {
        let spectrum = Spectrum::from_counts("split", vec![8.0, 8.0]).unwrap()
            .with_calibration(Calibration::linear(0.0, 1.5));
        // Energy edges -0.75, 0.75, 2.25; output bins of width 1 start at -0.75.
        let rebinned = Rebinner::new(CalbinOptions::default()).rebin(&spectrum).unwrap();
        assert_eq!(rebinned.len(), 3);
        let expected_counts = [8.0 / 1.5, 8.0 * 0.5 / 1.5 + 8.0 * 0.5 / 1.5, 8.0 / 1.5];
        for (got, want) in rebinned.counts().iter().zip(expected_counts) {
            assert!((got - want).abs() < 1e-12);
        }
        let f = 1.0 / 1.5;
        let f_half = 0.5 / 1.5;
        assert!((rebinned.variances()[0] - f * f * 8.0).abs() < 1e-12);
        assert!((rebinned.variances()[1] - 2.0 * f_half * f_half * 8.0).abs() < 1e-12);

        // Shared input bins correlate neighbours; the covariance row sums
        // carry the full input variance.
        assert!((rebinned.covariance_sum(0) - f * 8.0).abs() < 1e-12);
        assert!((rebinned.covariance_sum(1) - 2.0 * f_half * 8.0).abs() < 1e-12);
        let total: f64 = (0..rebinned.len()).map(|k| rebinned.covariance_sum(k)).sum();
        assert!((total - spectrum.total_variance()).abs() < 1e-12);
        assert!(rebinned.covariance_sum(1) > rebinned.variances()[1]);
    }

    #[test]
    fn covariance_sums_chain_through_repeated_rebins() {
        let spectrum = ramp(90).with_calibration(Calibration::linear(0.37, 0.7));
        let once = Rebinner::new(CalbinOptions::default()).rebin(&spectrum).unwrap();
        let twice = Rebinner::new(CalbinOptions::with_binsize(1.3)).rebin(&once).unwrap();
        let sums = |s: &Spectrum| (0..s.len()).map(|k| s.covariance_sum(k)).sum::<f64>();
        assert!((sums(&once) - spectrum.total_variance()).abs() < 1e-9);
        assert!((sums(&twice) - spectrum.total_variance()).abs() < 1e-9);
        assert!((twice.total() - spectrum.total()).abs() < 1e-9);
    }

    #[test]
    fn sampled_mode_conserves_fractional_counts_and_variances() {
        let spectrum = Spectrum::from_counts("fractional", vec![0.4; 30]).unwrap();
        let options = CalbinOptions {
            binsize: 2.0,
            mode: RebinMode::Sampled { seed: 3 },
        };
        let rebinned = Rebinner::new(options).rebin(&spectrum).unwrap();
        assert_eq!(rebinned.len(), 15);
        assert!((rebinned.total() - 12.0).abs() < 1e-9, "total {}", rebinned.total());
        assert!((rebinned.total_variance() - 12.0).abs() < 1e-9);
        for count in rebinned.counts() {
            assert!((count - 0.8).abs() < 1e-12);
        }

        let mixed = Spectrum::from_bins(
            "mixed",
            vec![
                Bin { count: 7.5, variance: 9.0, low: -0.5, high: 0.5 },
                Bin { count: 2.25, variance: 4.0, low: 0.5, high: 1.5 },
            ],
        )
        .unwrap()
        .with_calibration(Calibration::linear(0.0, 1.3));
        let options = CalbinOptions {
            binsize: 1.0,
            mode: RebinMode::Sampled { seed: 11 },
        };
        let rebinned = Rebinner::new(options).rebin(&mixed).unwrap();
        assert!((rebinned.total() - 9.75).abs() < 1e-9);
        assert!((rebinned.total_variance() - 13.0).abs() < 1e-9);
    }

    #[test]
    fn sampled_mode_keeps_integer_counts() {
        let spectrum = ramp(120).with_calibration(Calibration::linear(0.3, 0.77));
        let options = CalbinOptions {
            binsize: 1.0,
            mode: RebinMode::Sampled { seed: 7 },
        };
        let rebinned = Rebinner::new(options).rebin(&spectrum).unwrap();
        assert_eq!(rebinned.total(), spectrum.total());
        assert!(rebinned.counts().iter().all(|c| c.fract() == 0.0));
        assert_eq!(rebinned.counts(), rebinned.variances());
    }

    #[test]
    fn rejects_non_monotonic_calibration_and_bad_binsize() {
        let spectrum = ramp(100).with_calibration(Calibration::polynomial(vec![0.0, -10.0, 0.1]).unwrap());
        assert!(matches!(
            Rebinner::new(CalbinOptions::default()).rebin(&spectrum),
            Err(FitError::InvalidCalibration(_))
        ));
        assert!(matches!(
            Rebinner::new(CalbinOptions::with_binsize(0.0)).rebin(&ramp(10)),
            Err(FitError::InvalidCalibration(_))
        ));
    }
}
