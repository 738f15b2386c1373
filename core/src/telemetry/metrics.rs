use std::sync::Mutex;

/// Running counters for one session.
pub struct MetricsRecorder {
    inner: Mutex<Metrics>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    pub fits: usize,
    pub failures: usize,
    pub iterations: usize,
    pub rebins: usize,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Metrics::default()),
        }
    }

    pub fn record_fit(&self, iterations: usize) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.fits += 1;
            metrics.iterations += iterations;
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.failures += 1;
        }
    }

    pub fn record_rebin(&self) {
        if let Ok(mut metrics) = self.inner.lock() {
            metrics.rebins += 1;
        }
    }

    pub fn snapshot(&self) -> Metrics {
        self.inner
            .lock()
            .map(|metrics| *metrics)
            .unwrap_or_default()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
