use std::fmt;

use gammacore::fit::{FitResult, PeakValues};
use gammacore::Uncertain;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Position,
    Volume,
    Width,
}

impl Quantity {
    const ALL: [Quantity; 3] = [Quantity::Position, Quantity::Volume, Quantity::Width];

    /// Width uncertainties follow the bin size and are not compared.
    fn error_compared(self) -> bool {
        !matches!(self, Quantity::Width)
    }

    fn pick(self, values: &PeakValues) -> Uncertain {
        match self {
            Quantity::Position => values.position,
            Quantity::Volume => values.volume,
            Quantity::Width => values.width,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantity::Position => "position",
            Quantity::Volume => "volume",
            Quantity::Width => "width",
        };
        f.pad(name)
    }
}

/// Comparison of one calibrated quantity before and after a rebin.
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub binsize: f64,
    pub peak: usize,
    pub quantity: Quantity,
    pub before: Uncertain,
    pub after: Uncertain,
    /// `|after - before|` in combined standard errors.
    pub deviation: f64,
    /// `|after.error / before.error - 1|`
    pub error_change: f64,
    pub value_ok: bool,
    pub error_ok: bool,
}

impl Check {
    pub fn passed(&self) -> bool {
        self.value_ok && self.error_ok
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "b={} peak {} {:<8} {} -> {} ({:.2} sigma, error {:+.1}%) {}",
            self.binsize,
            self.peak,
            self.quantity,
            self.before,
            self.after,
            self.deviation,
            100.0 * self.error_change,
            if self.passed() { "ok" } else { "FAIL" }
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    pub checks: Vec<Check>,
}

impl ConsistencyReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(Check::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed())
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            writeln!(f, "{}", check)?;
        }
        write!(
            f,
            "{} of {} checks passed",
            self.checks.iter().filter(|c| c.passed()).count(),
            self.checks.len()
        )
    }
}

/// Compares the calibrated peak values of `after` against `before`. Peaks are
/// paired by position order; a peak count mismatch is a failed check on
/// every unmatched peak.
pub fn compare(
    before: &FitResult,
    after: &FitResult,
    binsize: f64,
    n_sigma: f64,
    tolerance: f64,
) -> Vec<Check> {
    let mut checks = Vec::new();
    let count = before.peaks().len().max(after.peaks().len());
    for peak in 0..count {
        let (a, b) = match (before.peaks().get(peak), after.peaks().get(peak)) {
            (Some(a), Some(b)) => (a.calibrated(), b.calibrated()),
            _ => {
                checks.push(Check {
                    binsize,
                    peak,
                    quantity: Quantity::Position,
                    before: Uncertain::exact(f64::NAN),
                    after: Uncertain::exact(f64::NAN),
                    deviation: f64::INFINITY,
                    error_change: f64::INFINITY,
                    value_ok: false,
                    error_ok: false,
                });
                continue;
            }
        };
        for quantity in Quantity::ALL {
            let (x, y) = (quantity.pick(a), quantity.pick(b));
            checks.push(check_pair(binsize, peak, quantity, x, y, n_sigma, tolerance));
        }
    }
    checks
}

fn check_pair(
    binsize: f64,
    peak: usize,
    quantity: Quantity,
    before: Uncertain,
    after: Uncertain,
    n_sigma: f64,
    tolerance: f64,
) -> Check {
    let combined = before.error.hypot(after.error);
    let difference = (after.value - before.value).abs();
    let deviation = if combined > 0.0 {
        difference / combined
    } else if difference == 0.0 {
        0.0
    } else {
        f64::INFINITY
    };
    // Held parameters carry no error on either side.
    let error_change = if before.error > 0.0 {
        (after.error / before.error - 1.0).abs()
    } else if after.error == 0.0 {
        0.0
    } else {
        f64::INFINITY
    };
    Check {
        binsize,
        peak,
        quantity,
        before,
        after,
        deviation,
        error_change,
        value_ok: deviation <= n_sigma,
        error_ok: !quantity.error_compared() || error_change <= tolerance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_within_combined_error_passes() {
        let check = check_pair(
            2.0,
            0,
            Quantity::Position,
            Uncertain::new(100.0, 0.3),
            Uncertain::new(100.5, 0.4),
            3.0,
            0.2,
        );
        assert!((check.deviation - 1.0).abs() < 1e-12);
        assert!(check.value_ok);
        assert!(!check.error_ok);
        assert!(!check.passed());
    }

    #[test]
    fn exact_values_compare_without_errors() {
        let check = check_pair(
            1.0,
            0,
            Quantity::Width,
            Uncertain::exact(4.0),
            Uncertain::exact(4.0),
            3.0,
            0.2,
        );
        assert!(check.passed());
        let moved = check_pair(
            1.0,
            0,
            Quantity::Width,
            Uncertain::exact(4.0),
            Uncertain::exact(4.5),
            3.0,
            0.2,
        );
        assert!(!moved.value_ok);
        let wider = check_pair(
            2.0,
            0,
            Quantity::Width,
            Uncertain::new(4.0, 0.1),
            Uncertain::new(4.1, 0.2),
            3.0,
            0.2,
        );
        assert!(wider.passed());
    }

    #[test]
    fn report_counts_failures() {
        let ok = check_pair(1.0, 0, Quantity::Volume, Uncertain::new(10.0, 1.0), Uncertain::new(10.5, 1.1), 3.0, 0.2);
        let bad = check_pair(1.0, 0, Quantity::Position, Uncertain::new(10.0, 0.1), Uncertain::new(12.0, 0.1), 3.0, 0.2);
        let report = ConsistencyReport {
            checks: vec![ok, bad],
        };
        assert!(!report.passed());
        assert_eq!(report.failures().count(), 1);
        assert!(report.to_string().ends_with("1 of 2 checks passed"));
    }
}
