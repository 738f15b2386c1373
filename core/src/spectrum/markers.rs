use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::prelude::{CoreResult, FitError};

/// Closed channel interval with `lower <= upper`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    /// Builds an interval from two marker positions in either order.
    pub fn new(a: f64, b: f64) -> Self {
        Self {
            lower: a.min(b),
            upper: a.max(b),
        }
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn midpoint(&self) -> f64 {
        0.5 * (self.lower + self.upper)
    }

    pub fn contains(&self, x: f64) -> bool {
        x >= self.lower && x <= self.upper
    }

    /// True when the interiors intersect.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.lower < other.upper && other.lower < self.upper
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Background,
    Region,
    Peak,
}

/// Operator markers for one fit, in channel space.
///
/// Background markers are consumed in pairs. The region holds a single pair;
/// setting a third region marker starts a new pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerSet {
    background: Vec<f64>,
    region: Vec<f64>,
    peaks: Vec<f64>,
}

impl MarkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, kind: MarkerKind, position: f64) -> CoreResult<()> {
        if !position.is_finite() {
            return Err(FitError::InvalidRegion(format!(
                "marker position {} is not finite",
                position
            )));
        }
        match kind {
            MarkerKind::Background => self.background.push(position),
            MarkerKind::Region => {
                if self.region.len() == 2 {
                    self.region.clear();
                }
                self.region.push(position);
            }
            MarkerKind::Peak => self.peaks.push(position),
        }
        Ok(())
    }

    pub fn clear(&mut self, kind: MarkerKind) {
        match kind {
            MarkerKind::Background => self.background.clear(),
            MarkerKind::Region => self.region.clear(),
            MarkerKind::Peak => self.peaks.clear(),
        }
    }

    pub fn clear_all(&mut self) {
        *self = Self::default();
    }

    pub fn positions(&self, kind: MarkerKind) -> &[f64] {
        match kind {
            MarkerKind::Background => &self.background,
            MarkerKind::Region => &self.region,
            MarkerKind::Peak => &self.peaks,
        }
    }

    pub fn has_background(&self) -> bool {
        !self.background.is_empty()
    }

    /// Background intervals, sorted and checked to be disjoint.
    pub fn background_regions(&self) -> CoreResult<Vec<Interval>> {
        if self.background.len() % 2 != 0 {
            return Err(FitError::InvalidRegion(
                "background markers must come in pairs".into(),
            ));
        }

        let mut regions: Vec<Interval> = self
            .background
            .chunks(2)
            .map(|pair| Interval::new(pair[0], pair[1]))
            .collect();
        if regions.iter().any(|r| r.width() <= 0.0) {
            return Err(FitError::InvalidRegion("empty background region".into()));
        }
        regions.sort_by(|a, b| a.lower.total_cmp(&b.lower));

        for pair in regions.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(FitError::InvalidRegion(format!(
                    "background regions [{}, {}] and [{}, {}] overlap",
                    pair[0].lower, pair[0].upper, pair[1].lower, pair[1].upper
                )));
            }
        }
        Ok(regions)
    }

    pub fn fit_region(&self) -> CoreResult<Interval> {
        match self.region.as_slice() {
            [a, b] if a != b => Ok(Interval::new(*a, *b)),
            [_, _] => Err(FitError::InvalidRegion("fit region is empty".into())),
            _ => Err(FitError::InvalidRegion(
                "fit region needs exactly two markers".into(),
            )),
        }
    }

    /// Peak positions in ascending order.
    pub fn sorted_peaks(&self) -> Vec<f64> {
        let mut peaks = self.peaks.clone();
        peaks.sort_by(f64::total_cmp);
        peaks
    }

    /// Moves every marker through energy from one calibration's channel space
    /// into another's. `domain` brackets the target channel range.
    pub fn remap(
        &self,
        from: &Calibration,
        to: &Calibration,
        domain: Interval,
    ) -> CoreResult<MarkerSet> {
        let convert = |positions: &[f64]| -> CoreResult<Vec<f64>> {
            positions
                .iter()
                .map(|&p| to.channel(from.energy(p), domain))
                .collect()
        };
        Ok(MarkerSet {
            background: convert(&self.background)?,
            region: convert(&self.region)?,
            peaks: convert(&self.peaks)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers(background: &[f64], region: &[f64], peaks: &[f64]) -> MarkerSet {
        let mut set = MarkerSet::new();
        for &p in background {
            set.set(MarkerKind::Background, p).unwrap();
        }
        for &p in region {
            set.set(MarkerKind::Region, p).unwrap();
        }
        for &p in peaks {
            set.set(MarkerKind::Peak, p).unwrap();
        }
        set
    }

    #[test]
    fn background_pairs_are_sorted() {
        let set = markers(&[90.0, 80.0, 20.0, 10.0], &[], &[]);
        let regions = set.background_regions().unwrap();
        assert_eq!(regions, vec![Interval::new(10.0, 20.0), Interval::new(80.0, 90.0)]);
    }

    #[test]
    fn overlapping_or_unpaired_background_is_rejected() {
        let overlapping = markers(&[10.0, 30.0, 20.0, 40.0], &[], &[]);
        assert!(matches!(
            overlapping.background_regions(),
            Err(FitError::InvalidRegion(_))
        ));
        let unpaired = markers(&[10.0, 30.0, 50.0], &[], &[]);
        assert!(unpaired.background_regions().is_err());
    }

    #[test]
    fn third_region_marker_starts_new_pair() {
        let set = markers(&[], &[10.0, 20.0, 50.0, 40.0], &[]);
        assert_eq!(set.fit_region().unwrap(), Interval::new(40.0, 50.0));
        let incomplete = markers(&[], &[10.0], &[]);
        assert!(incomplete.fit_region().is_err());
        let empty = markers(&[], &[10.0, 10.0], &[]);
        assert!(empty.fit_region().is_err());
    }

    #[test]
    fn rejects_non_finite_positions() {
        let mut set = MarkerSet::new();
        assert!(set.set(MarkerKind::Peak, f64::NAN).is_err());
        assert!(set.positions(MarkerKind::Peak).is_empty());
    }

    #[test]
    fn remap_follows_energy() {
        let set = markers(&[10.0, 20.0], &[100.0, 140.0], &[121.0]);
        let from = Calibration::identity();
        let to = Calibration::linear(0.5, 2.0);
        let mapped = set
            .remap(&from, &to, Interval::new(-0.5, 500.0))
            .unwrap();
        assert!((mapped.sorted_peaks()[0] - 60.25).abs() < 1e-9);
        assert!((mapped.fit_region().unwrap().lower - 49.75).abs() < 1e-9);
    }
}
