use crate::generator::profile::build_spectrum;
use crate::generator::template::{calbin_script, initial_fit_script};
use crate::workflow::config::WorkflowConfig;
use crate::workflow::consistency::{compare, ConsistencyReport};
use crate::workflow::script::{parse_script, Command};
use anyhow::Context;
use gammacore::calibration::{CalbinOptions, Calibration};
use gammacore::fit::FitResult;
use gammacore::persist::{FitList, RestoreMode};
use gammacore::session::FitSession;
use gammacore::spectrum::Spectrum;
use std::fs;

/// Fits collected by the calbin consistency check.
pub struct CalbinOutcome {
    pub initial: FitResult,
    pub rebinned: Vec<(f64, FitResult)>,
    pub report: ConsistencyReport,
}

/// Applies batch commands to a [`FitSession`].
pub struct Runner {
    config: WorkflowConfig,
    session: FitSession,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        let session = FitSession::new(config.fit.clone());
        Self { config, session }
    }

    pub fn session(&self) -> &FitSession {
        &self.session
    }

    pub fn run_text(&mut self, text: &str) -> anyhow::Result<Vec<String>> {
        let commands = parse_script(text)?;
        self.run(&commands)
    }

    /// Runs `commands` in order and stops at the first failure.
    pub fn run(&mut self, commands: &[Command]) -> anyhow::Result<Vec<String>> {
        let mut output = Vec::new();
        for (n, command) in commands.iter().enumerate() {
            let message = self
                .apply(command)
                .with_context(|| format!("command {} ({:?})", n + 1, command))?;
            if let Some(message) = message {
                log::info!("{}", message);
                output.push(message);
            }
        }
        Ok(output)
    }

    pub fn apply(&mut self, command: &Command) -> anyhow::Result<Option<String>> {
        match command {
            Command::SpectrumGet(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("reading spectrum {}", path.display()))?;
                let raw: Spectrum = serde_json::from_str(&contents)
                    .with_context(|| format!("parsing spectrum {}", path.display()))?;
                let spectrum = Spectrum::from_bins(raw.name(), raw.bins().collect())
                    .with_context(|| format!("validating spectrum {}", path.display()))?
                    .with_calibration(raw.calibration().clone());
                let id = self.session.add_spectrum(spectrum);
                Ok(Some(format!("spectrum {} loaded as id {}", raw.name(), id)))
            }
            Command::SpectrumActivate(id) => {
                self.session.activate(*id)?;
                Ok(None)
            }
            Command::SpectrumCalbin { id, binsize } => {
                let options = CalbinOptions {
                    binsize: binsize.unwrap_or(1.0),
                    mode: self.config.rebin_mode,
                };
                self.session.calbin(*id, &options)?;
                let len = self.session.spectrum(*id)?.len();
                Ok(Some(format!(
                    "spectrum {} rebinned to {} bins of {}",
                    id, len, options.binsize
                )))
            }
            Command::CalibrationSet(coefficients) => {
                let id = self.active_id()?;
                let calibration = Calibration::polynomial(coefficients.clone())?;
                self.session.set_calibration(id, calibration)?;
                Ok(None)
            }
            Command::MarkerSet { kind, channel } => {
                self.session.set_marker(*kind, *channel)?;
                Ok(None)
            }
            Command::MarkerClear(kind) => {
                self.session.clear_marker(*kind);
                Ok(None)
            }
            Command::FitExecute => {
                let fit = self.session.execute_fit()?;
                Ok(Some(fit.summary()))
            }
            Command::FitStore => {
                let index = self.session.store_fit()?;
                Ok(Some(format!("stored fit {}", index)))
            }
            Command::FitClear => {
                self.session.clear_markers();
                Ok(None)
            }
            Command::FitlistWrite(path) => {
                let id = self.active_id()?;
                let list = self.session.export_fits(id)?;
                list.save(path)
                    .with_context(|| format!("writing fit list {}", path.display()))?;
                Ok(Some(format!("wrote {} fit(s) to {}", list.len(), path.display())))
            }
            Command::FitlistRead { path, refit } => {
                let id = self.active_id()?;
                let list = FitList::load(path)
                    .with_context(|| format!("reading fit list {}", path.display()))?;
                let mode = if *refit {
                    RestoreMode::Refit
                } else {
                    RestoreMode::AsStored
                };
                let count = self.session.import_fits(id, &list, mode)?;
                Ok(Some(format!("restored {} fit(s) from {}", count, path.display())))
            }
        }
    }

    fn active_id(&self) -> anyhow::Result<usize> {
        self.session.active_id().context("no active spectrum")
    }

    /// Fits the configured peak of the artificial spectrum, round-trips the
    /// fit through the fit list with a refit (appended after the stored fit
    /// and used as reference), then rebins a fresh copy of the
    /// spectrum with every configured bin size and fits again. Calibrated
    /// values must agree with the first fit.
    pub fn calbin_check(&mut self) -> anyhow::Result<CalbinOutcome> {
        let generator = self.config.generator.clone();
        let step = self.config.fit_step;
        let spectrum = build_spectrum(&generator).context("building artificial spectrum")?;

        let id = self.session.add_spectrum(spectrum.clone());
        self.run_text(&initial_fit_script(&generator, step))
            .context("initial fit")?;

        let mut document = Vec::new();
        self.session.export_fits(id)?.write(&mut document)?;
        let list = FitList::read(document.as_slice())?;
        self.session
            .import_fits(id, &list, RestoreMode::Refit)
            .context("refitting stored fits")?;
        let initial = self.last_fit(id)?;

        let mut report = ConsistencyReport::default();
        let mut rebinned = Vec::new();
        let binsizes = self.config.calbin_binsizes.clone();
        for binsize in binsizes {
            let id = self.session.add_spectrum(spectrum.clone());
            self.run_text(&calbin_script(&generator, step, id, binsize))
                .with_context(|| format!("fit after calbin with binsize {}", binsize))?;
            let fit = self.last_fit(id)?;
            report.checks.extend(compare(
                &initial,
                &fit,
                binsize,
                self.config.n_sigma,
                self.config.uncertainty_tolerance,
            ));
            rebinned.push((binsize, fit));
        }

        Ok(CalbinOutcome {
            initial,
            rebinned,
            report,
        })
    }

    fn last_fit(&self, id: usize) -> anyhow::Result<FitResult> {
        self.session
            .fits(id)?
            .last()
            .cloned()
            .with_context(|| format!("spectrum {} has no stored fit", id))
    }
}
