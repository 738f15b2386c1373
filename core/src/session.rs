//! Explicit session context: loaded spectra, the active markers, the pending
//! fit and the stored fits of every spectrum.

use std::collections::BTreeMap;

use crate::calibration::{CalbinOptions, Calibration, Rebinner};
use crate::fit::fitter::Fitter;
use crate::fit::result::FitResult;
use crate::persist::{FitList, RestoreMode};
use crate::prelude::{CoreResult, FitConfig, FitError};
use crate::spectrum::histogram::Spectrum;
use crate::spectrum::markers::{MarkerKind, MarkerSet};
use crate::telemetry::log::LogManager;
use crate::telemetry::metrics::{Metrics, MetricsRecorder};

/// A loaded spectrum with its stored fits.
#[derive(Debug, Clone)]
pub struct SpectrumEntry {
    spectrum: Spectrum,
    fits: Vec<FitResult>,
    next_index: usize,
}

impl SpectrumEntry {
    pub fn spectrum(&self) -> &Spectrum {
        &self.spectrum
    }

    pub fn fits(&self) -> &[FitResult] {
        &self.fits
    }
}

/// State shared by consecutive commands. Every operation that fails leaves the
/// session as it was.
pub struct FitSession {
    spectra: BTreeMap<usize, SpectrumEntry>,
    next_id: usize,
    active: Option<usize>,
    markers: MarkerSet,
    pending: Option<FitResult>,
    config: FitConfig,
    metrics: MetricsRecorder,
    logger: LogManager,
}

impl FitSession {
    pub fn new(config: FitConfig) -> Self {
        Self {
            spectra: BTreeMap::new(),
            next_id: 0,
            active: None,
            markers: MarkerSet::new(),
            pending: None,
            config,
            metrics: MetricsRecorder::new(),
            logger: LogManager::for_component("session"),
        }
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: FitConfig) {
        self.config = config;
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot()
    }

    /// Adds a spectrum and makes it active. Returns its id.
    pub fn add_spectrum(&mut self, spectrum: Spectrum) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.logger.record(&format!(
            "loaded spectrum {} as id {} ({} bins, {:.0} counts)",
            spectrum.name(),
            id,
            spectrum.len(),
            spectrum.total()
        ));
        self.spectra.insert(
            id,
            SpectrumEntry {
                spectrum,
                fits: Vec::new(),
                next_index: 0,
            },
        );
        self.activate_unchecked(id);
        id
    }

    pub fn activate(&mut self, id: usize) -> CoreResult<()> {
        self.entry(id)?;
        self.activate_unchecked(id);
        Ok(())
    }

    fn activate_unchecked(&mut self, id: usize) {
        if self.active != Some(id) {
            self.markers.clear_all();
            self.pending = None;
        }
        self.active = Some(id);
    }

    pub fn active_id(&self) -> Option<usize> {
        self.active
    }

    pub fn spectrum_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.spectra.keys().copied()
    }

    pub fn entry(&self, id: usize) -> CoreResult<&SpectrumEntry> {
        self.spectra.get(&id).ok_or(FitError::UnknownSpectrum(id))
    }

    pub fn spectrum(&self, id: usize) -> CoreResult<&Spectrum> {
        self.entry(id).map(SpectrumEntry::spectrum)
    }

    pub fn fits(&self, id: usize) -> CoreResult<&[FitResult]> {
        self.entry(id).map(SpectrumEntry::fits)
    }

    /// Replaces the calibration of a spectrum. Active markers stay in channel
    /// space.
    pub fn set_calibration(&mut self, id: usize, calibration: Calibration) -> CoreResult<()> {
        let channels: Vec<f64> = {
            let spectrum = self.spectrum(id)?;
            spectrum.bins().flat_map(|b| [b.low, b.high]).collect()
        };
        calibration.check_monotonic(&channels)?;
        if let Some(entry) = self.spectra.get_mut(&id) {
            entry.spectrum.set_calibration(calibration);
        }
        if self.active == Some(id) {
            self.pending = None;
        }
        Ok(())
    }

    pub fn markers(&self) -> &MarkerSet {
        &self.markers
    }

    /// `fit marker <kind> set <channel>`
    pub fn set_marker(&mut self, kind: MarkerKind, channel: f64) -> CoreResult<()> {
        self.markers.set(kind, channel)
    }

    /// `fit marker <kind> clear`
    pub fn clear_marker(&mut self, kind: MarkerKind) {
        self.markers.clear(kind);
    }

    pub fn clear_markers(&mut self) {
        self.markers.clear_all();
    }

    pub fn pending_fit(&self) -> Option<&FitResult> {
        self.pending.as_ref()
    }

    /// `fit execute`: fits the active markers on the active spectrum. The
    /// result replaces any pending fit.
    pub fn execute_fit(&mut self) -> CoreResult<&FitResult> {
        let id = self
            .active
            .ok_or_else(|| FitError::InvalidSpectrum("no active spectrum".into()))?;
        let spectrum = &self.entry(id)?.spectrum;
        let result = Fitter::new(self.config.clone()).fit(spectrum, &self.markers);
        match result {
            Ok(fit) => {
                self.metrics.record_fit(fit.iterations());
                self.logger.record(&fit.summary());
                Ok(self.pending.insert(fit))
            }
            Err(err) => {
                self.metrics.record_failure();
                self.logger.warn(&format!("fit failed: {}", err));
                Err(err)
            }
        }
    }

    /// `fit store`: appends the pending fit to the active spectrum under the
    /// next fit index and clears the markers.
    pub fn store_fit(&mut self) -> CoreResult<usize> {
        let id = self.active.ok_or(FitError::NoPendingFit)?;
        if self.pending.is_none() {
            return Err(FitError::NoPendingFit);
        }
        let entry = self
            .spectra
            .get_mut(&id)
            .ok_or(FitError::UnknownSpectrum(id))?;
        let fit = self.pending.take().ok_or(FitError::NoPendingFit)?;
        let index = entry.next_index;
        entry.next_index += 1;
        entry.fits.push(fit.into_stored(index));
        self.markers.clear_all();
        self.logger.record(&format!("stored fit {} on spectrum {}", index, id));
        Ok(index)
    }

    /// `spectrum calbin <id> [-b <binsize>]`: rebins the spectrum in place.
    /// Active markers move through energy onto the new channels and the
    /// pending fit is dropped. Stored fits keep their calibration snapshot.
    pub fn calbin(&mut self, id: usize, options: &CalbinOptions) -> CoreResult<()> {
        let entry = self.entry(id)?;
        let rebinned = Rebinner::new(options.clone()).rebin(&entry.spectrum)?;
        let markers = if self.active == Some(id) {
            self.markers.remap(
                entry.spectrum.calibration(),
                rebinned.calibration(),
                rebinned.domain(),
            )?
        } else {
            self.markers.clone()
        };

        if let Some(entry) = self.spectra.get_mut(&id) {
            entry.spectrum = rebinned;
        }
        if self.active == Some(id) {
            self.markers = markers;
            self.pending = None;
        }
        self.metrics.record_rebin();
        Ok(())
    }

    pub fn export_fits(&self, id: usize) -> CoreResult<FitList> {
        let entry = self.entry(id)?;
        Ok(FitList::new(entry.spectrum.name(), entry.fits.clone()))
    }

    /// Restores a fit list onto spectrum `id`. Restored fits are appended to
    /// the fits already stored, under fresh indices in list order. Returns the
    /// number of fits restored.
    pub fn import_fits(&mut self, id: usize, list: &FitList, mode: RestoreMode) -> CoreResult<usize> {
        let entry = self.entry(id)?;
        let fits = list.restore(mode, &entry.spectrum)?;
        if mode == RestoreMode::Refit {
            for fit in &fits {
                self.metrics.record_fit(fit.iterations());
            }
        }
        let count = fits.len();
        if let Some(entry) = self.spectra.get_mut(&id) {
            for fit in fits {
                let index = entry.next_index;
                entry.next_index += 1;
                entry.fits.push(fit.into_stored(index));
            }
        }
        self.logger.record(&format!("restored {} fit(s) on spectrum {}", count, id));
        Ok(count)
    }
}
