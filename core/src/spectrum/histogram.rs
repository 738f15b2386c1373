use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::math::optimizer::Observations;
use crate::prelude::{CoreResult, FitError};
use crate::spectrum::markers::Interval;

/// One histogram bin in channel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    pub count: f64,
    pub variance: f64,
    pub low: f64,
    pub high: f64,
}

impl Bin {
    pub fn center(&self) -> f64 {
        0.5 * (self.low + self.high)
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

/// Counts versus channel, with per-bin variances and the calibration that maps
/// channels to energy.
///
/// A freshly loaded spectrum carries Poisson variances (`variance == count`).
/// After rebinning the variances are propagated explicitly and no longer equal
/// the counts, and neighbouring bins that shared an input bin are correlated.
/// The row sums of the bin covariance matrix are kept for fit weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    name: String,
    counts: Vec<f64>,
    variances: Vec<f64>,
    lows: Vec<f64>,
    highs: Vec<f64>,
    calibration: Calibration,
    /// Empty while the bins are uncorrelated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    covariance_sums: Vec<f64>,
}

impl Spectrum {
    /// Unit-width bins centred on integer channels `0..n`.
    pub fn from_counts(name: impl Into<String>, counts: Vec<f64>) -> CoreResult<Self> {
        let bins = counts
            .iter()
            .enumerate()
            .map(|(channel, &count)| Bin {
                count,
                variance: count,
                low: channel as f64 - 0.5,
                high: channel as f64 + 0.5,
            })
            .collect();
        Self::from_bins(name, bins)
    }

    pub fn from_bins(name: impl Into<String>, bins: Vec<Bin>) -> CoreResult<Self> {
        if bins.is_empty() {
            return Err(FitError::InvalidSpectrum("spectrum has no bins".into()));
        }

        let mut previous_high = f64::NEG_INFINITY;
        for (index, bin) in bins.iter().enumerate() {
            if !bin.count.is_finite() || bin.count < 0.0 {
                return Err(FitError::InvalidSpectrum(format!(
                    "bin {} has invalid count {}",
                    index, bin.count
                )));
            }
            if !bin.variance.is_finite() || bin.variance < 0.0 {
                return Err(FitError::InvalidSpectrum(format!(
                    "bin {} has invalid variance {}",
                    index, bin.variance
                )));
            }
            if !bin.low.is_finite() || !bin.high.is_finite() || bin.low > bin.high {
                return Err(FitError::InvalidSpectrum(format!(
                    "bin {} has invalid edges [{}, {}]",
                    index, bin.low, bin.high
                )));
            }
            if bin.low < previous_high {
                return Err(FitError::InvalidSpectrum(format!(
                    "bin edges decrease at bin {}",
                    index
                )));
            }
            previous_high = bin.high;
        }

        Ok(Self {
            name: name.into(),
            counts: bins.iter().map(|b| b.count).collect(),
            variances: bins.iter().map(|b| b.variance).collect(),
            lows: bins.iter().map(|b| b.low).collect(),
            highs: bins.iter().map(|b| b.high).collect(),
            calibration: Calibration::default(),
            covariance_sums: Vec::new(),
        })
    }

    /// Attaches the row sums of the bin covariance matrix, one per bin.
    pub fn with_covariance_sums(mut self, sums: Vec<f64>) -> CoreResult<Self> {
        if sums.len() != self.len() {
            return Err(FitError::InvalidSpectrum(format!(
                "{} covariance sums for {} bins",
                sums.len(),
                self.len()
            )));
        }
        if let Some(index) = sums.iter().position(|v| !v.is_finite() || *v < 0.0) {
            return Err(FitError::InvalidSpectrum(format!(
                "bin {} has invalid covariance sum {}",
                index, sums[index]
            )));
        }
        self.covariance_sums = sums;
        Ok(self)
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn variances(&self) -> &[f64] {
        &self.variances
    }

    /// Sum of row `index` of the bin covariance matrix; the plain variance
    /// for uncorrelated bins.
    pub fn covariance_sum(&self, index: usize) -> f64 {
        self.covariance_sums
            .get(index)
            .copied()
            .unwrap_or(self.variances[index])
    }

    pub fn bin(&self, index: usize) -> Option<Bin> {
        (index < self.len()).then(|| Bin {
            count: self.counts[index],
            variance: self.variances[index],
            low: self.lows[index],
            high: self.highs[index],
        })
    }

    pub fn bins(&self) -> impl Iterator<Item = Bin> + '_ {
        (0..self.len()).filter_map(move |index| self.bin(index))
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Replace the calibration. Fit results already taken keep their own
    /// snapshot.
    pub fn set_calibration(&mut self, calibration: Calibration) {
        self.calibration = calibration;
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    pub fn total_variance(&self) -> f64 {
        self.variances.iter().sum()
    }

    /// Channel range covered by the bins.
    pub fn domain(&self) -> Interval {
        Interval {
            lower: self.lows[0],
            upper: self.highs[self.len() - 1],
        }
    }

    /// Index of the bin containing `channel`.
    pub fn bin_index(&self, channel: f64) -> Option<usize> {
        let index = self.highs.partition_point(|&high| high <= channel);
        (index < self.len() && self.lows[index] <= channel).then_some(index)
    }

    /// Working copy of the bins whose centres lie inside `interval`.
    pub fn region(&self, interval: Interval) -> RegionData {
        let mut region = RegionData::default();
        for (index, bin) in self.bins().enumerate().filter(|(_, b)| interval.contains(b.center())) {
            region.low.push(bin.low);
            region.high.push(bin.high);
            region.counts.push(bin.count);
            region.variances.push(self.covariance_sum(index));
        }
        region
    }
}

/// Owned slice of a spectrum handed to the fitter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionData {
    pub low: Vec<f64>,
    pub high: Vec<f64>,
    pub counts: Vec<f64>,
    /// Per-bin variance used for weights: the covariance row sum, which
    /// folds correlations with neighbouring bins into the diagonal.
    pub variances: Vec<f64>,
}

impl RegionData {
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn center(&self, index: usize) -> f64 {
        0.5 * (self.low[index] + self.high[index])
    }

    pub fn width(&self, index: usize) -> f64 {
        self.high[index] - self.low[index]
    }

    /// Count per unit channel in bin `index`.
    pub fn density(&self, index: usize) -> f64 {
        let width = self.width(index);
        if width > 0.0 {
            self.counts[index] / width
        } else {
            0.0
        }
    }

    pub fn is_all_zero(&self) -> bool {
        self.counts.iter().all(|&c| c == 0.0)
    }

    pub fn observations(&self) -> Observations<'_> {
        Observations {
            low: &self.low,
            high: &self.high,
            counts: &self.counts,
            variances: &self.variances,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_counts_builds_unit_bins_with_poisson_variance() {
        let spectrum = Spectrum::from_counts("s", vec![1.0, 4.0, 9.0]).unwrap();
        let bin = spectrum.bin(1).unwrap();
        assert_eq!(bin.low, 0.5);
        assert_eq!(bin.high, 1.5);
        assert_eq!(bin.variance, 4.0);
        assert_eq!(spectrum.total(), 14.0);
        assert_eq!(spectrum.domain(), Interval { lower: -0.5, upper: 2.5 });
    }

    #[test]
    fn rejects_negative_counts_and_decreasing_edges() {
        assert!(matches!(
            Spectrum::from_counts("s", vec![1.0, -1.0]),
            Err(FitError::InvalidSpectrum(_))
        ));
        let bins = vec![
            Bin { count: 1.0, variance: 1.0, low: 0.0, high: 2.0 },
            Bin { count: 1.0, variance: 1.0, low: 1.0, high: 3.0 },
        ];
        assert!(matches!(
            Spectrum::from_bins("s", bins),
            Err(FitError::InvalidSpectrum(_))
        ));
        assert!(Spectrum::from_counts("s", Vec::new()).is_err());
    }

    #[test]
    fn bin_index_follows_edges() {
        let spectrum = Spectrum::from_counts("s", vec![0.0; 10]).unwrap();
        assert_eq!(spectrum.bin_index(3.2), Some(3));
        assert_eq!(spectrum.bin_index(-0.5), Some(0));
        assert_eq!(spectrum.bin_index(9.6), None);
    }

    #[test]
    fn region_weights_use_covariance_sums() {
        let spectrum = Spectrum::from_counts("s", vec![4.0; 4])
            .unwrap()
            .with_covariance_sums(vec![4.0, 6.0, 6.0, 4.0])
            .unwrap();
        assert_eq!(spectrum.variances(), &[4.0; 4]);
        let region = spectrum.region(Interval::new(0.5, 3.5));
        assert_eq!(region.variances, vec![6.0, 6.0, 4.0]);
        assert!(Spectrum::from_counts("s", vec![1.0; 3])
            .unwrap()
            .with_covariance_sums(vec![1.0])
            .is_err());
        assert_eq!(Spectrum::from_counts("s", vec![2.0]).unwrap().covariance_sum(0), 2.0);
    }

    #[test]
    fn region_selects_bins_by_centre() {
        let spectrum = Spectrum::from_counts("s", (0..10).map(f64::from).collect()).unwrap();
        let region = spectrum.region(Interval::new(2.2, 5.0));
        assert_eq!(region.counts, vec![3.0, 4.0, 5.0]);
        assert!(!region.is_all_zero());
        assert_eq!(region.observations().len(), 3);
    }
}
