use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::fit::fitter::Fitter;
use crate::fit::result::FitResult;
use crate::prelude::{CoreResult, FitError};
use crate::spectrum::histogram::Spectrum;
use crate::telemetry::log::LogManager;

/// Version written into every document; newer documents are refused.
pub const FORMAT_VERSION: u32 = 1;

/// How stored fits come back to life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Use the stored values unchanged.
    AsStored,
    /// Execute every fit again from its markers and settings.
    Refit,
}

/// The stored fits of one spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitList {
    version: u32,
    spectrum: String,
    fits: Vec<FitResult>,
}

impl FitList {
    pub fn new(spectrum: impl Into<String>, fits: Vec<FitResult>) -> Self {
        Self {
            version: FORMAT_VERSION,
            spectrum: spectrum.into(),
            fits,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn spectrum_name(&self) -> &str {
        &self.spectrum
    }

    pub fn fits(&self) -> &[FitResult] {
        &self.fits
    }

    pub fn len(&self) -> usize {
        self.fits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fits.is_empty()
    }

    pub fn write<W: Write>(&self, writer: W) -> CoreResult<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn read<R: Read>(reader: R) -> CoreResult<Self> {
        let list: Self = serde_json::from_reader(reader)?;
        if list.version > FORMAT_VERSION {
            return Err(FitError::Persistence(serde_json::Error::custom(format!(
                "fit list version {} is newer than supported version {}",
                list.version, FORMAT_VERSION
            ))));
        }
        Ok(list)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        self.write(&mut writer)?;
        writer.flush()?;
        LogManager::for_component("persist").record(&format!(
            "wrote {} fit(s) of {} to {}",
            self.fits.len(),
            self.spectrum,
            path.as_ref().display()
        ));
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        Self::read(reader)
    }

    /// Brings the stored fits back against `spectrum`. Refitting moves the
    /// stored markers through energy when the spectrum has been recalibrated
    /// or rebinned since the fit was made. Stored indices are kept.
    pub fn restore(&self, mode: RestoreMode, spectrum: &Spectrum) -> CoreResult<Vec<FitResult>> {
        match mode {
            RestoreMode::AsStored => Ok(self.fits.clone()),
            RestoreMode::Refit => self
                .fits
                .iter()
                .map(|fit| {
                    let markers = if fit.calibration() == spectrum.calibration() {
                        fit.markers().clone()
                    } else {
                        fit.markers().remap(
                            fit.calibration(),
                            spectrum.calibration(),
                            spectrum.domain(),
                        )?
                    };
                    let refit = Fitter::new(fit.config().clone()).fit(spectrum, &markers)?;
                    Ok(match fit.index() {
                        Some(index) => refit.into_stored(index),
                        None => refit,
                    })
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalbinOptions, Rebinner};
    use crate::prelude::FitConfig;
    use crate::spectrum::markers::{MarkerKind, MarkerSet};
    use crate::testing::{synthetic_spectrum, SyntheticPeak};

    fn spectrum() -> Spectrum {
        synthetic_spectrum(
            "persisted",
            600,
            30.0,
            &[
                SyntheticPeak {
                    position: 150.0,
                    volume: 4000.0,
                    sigma: 2.0,
                },
                SyntheticPeak {
                    position: 400.0,
                    volume: 8000.0,
                    sigma: 3.0,
                },
            ],
            Some(42),
        )
    }

    fn fit_at(spectrum: &Spectrum, peak: f64, index: usize) -> FitResult {
        let mut markers = MarkerSet::new();
        for p in [peak - 60.0, peak - 40.0, peak + 40.0, peak + 60.0] {
            markers.set(MarkerKind::Background, p).unwrap();
        }
        markers.set(MarkerKind::Region, peak - 25.0).unwrap();
        markers.set(MarkerKind::Region, peak + 25.0).unwrap();
        markers.set(MarkerKind::Peak, peak).unwrap();
        Fitter::new(FitConfig::default())
            .fit(spectrum, &markers)
            .unwrap()
            .into_stored(index)
    }

    fn fit_list(spectrum: &Spectrum) -> FitList {
        FitList::new(
            spectrum.name(),
            vec![fit_at(spectrum, 150.0, 0), fit_at(spectrum, 400.0, 1)],
        )
    }

    #[test]
    fn write_then_read_is_identical() {
        let spectrum = spectrum();
        let list = fit_list(&spectrum);
        let mut buffer = Vec::new();
        list.write(&mut buffer).unwrap();
        let restored = FitList::read(buffer.as_slice()).unwrap();
        assert_eq!(restored, list);
        assert_eq!(
            restored.restore(RestoreMode::AsStored, &spectrum).unwrap(),
            list.fits().to_vec()
        );
    }

    #[test]
    fn save_and_load_through_a_file() {
        let spectrum = spectrum();
        let list = fit_list(&spectrum);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fits.json");
        list.save(&path).unwrap();
        let loaded = FitList::load(&path).unwrap();
        assert_eq!(loaded.version(), FORMAT_VERSION);
        assert_eq!(loaded.spectrum_name(), "persisted");
        assert_eq!(loaded, list);
    }

    #[test]
    fn refit_reproduces_stored_values() {
        let spectrum = spectrum();
        let list = fit_list(&spectrum);
        let refitted = list.restore(RestoreMode::Refit, &spectrum).unwrap();
        for (stored, again) in list.fits().iter().zip(&refitted) {
            assert_eq!(stored.index(), again.index());
            let (a, b) = (&stored.peaks()[0], &again.peaks()[0]);
            assert!((a.position().value - b.position().value).abs() < 1e-4 * a.position().error.max(1e-3));
            assert!((a.volume().value - b.volume().value).abs() < 1e-4 * a.volume().error);
        }
    }

    #[test]
    fn refit_after_calbin_follows_energy() {
        let spectrum = spectrum();
        let list = fit_list(&spectrum);
        let rebinned = Rebinner::new(CalbinOptions::with_binsize(2.0))
            .rebin(&spectrum)
            .unwrap();
        let refitted = list.restore(RestoreMode::Refit, &rebinned).unwrap();
        for (stored, again) in list.fits().iter().zip(&refitted) {
            let (a, b) = (stored.peaks()[0].calibrated(), again.peaks()[0].calibrated());
            let limit = 3.0 * (a.position.error.powi(2) + b.position.error.powi(2)).sqrt();
            assert!((a.position.value - b.position.value).abs() < limit);
            assert_eq!(again.calibration(), rebinned.calibration());
        }
    }

    #[test]
    fn newer_documents_are_refused() {
        let spectrum = spectrum();
        let mut list = fit_list(&spectrum);
        list.version = FORMAT_VERSION + 1;
        let mut buffer = Vec::new();
        list.write(&mut buffer).unwrap();
        assert!(matches!(
            FitList::read(buffer.as_slice()),
            Err(FitError::Persistence(_))
        ));
        assert!(matches!(
            FitList::read("{ not json".as_bytes()),
            Err(FitError::Persistence(_))
        ));
    }
}
