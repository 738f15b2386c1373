use crate::generator::profile::GeneratorConfig;
use anyhow::Context;
use gammacore::calibration::RebinMode;
use gammacore::FitConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub generator: GeneratorConfig,
    pub fit: FitConfig,
    /// Step of the artificial spectrum whose peak is fitted.
    pub fit_step: usize,
    /// Bin sizes applied one after another by the calbin check.
    pub calbin_binsizes: Vec<f64>,
    pub rebin_mode: RebinMode,
    /// Allowed deviation of calibrated values, in combined standard errors.
    pub n_sigma: f64,
    /// Allowed relative change of the uncertainties.
    pub uncertainty_tolerance: f64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            generator: GeneratorConfig::default(),
            fit: FitConfig::default(),
            fit_step: 2,
            calbin_binsizes: vec![1.0, 2.0],
            rebin_mode: RebinMode::Fractional,
            n_sigma: 3.0,
            uncertainty_tolerance: 0.2,
        }
    }
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_args(seed: u64, binsizes: Vec<f64>) -> Self {
        let mut config = Self::default();
        config.generator.seed = seed;
        if !binsizes.is_empty() {
            config.calbin_binsizes = binsizes;
        }
        config
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.fit_step < crate::generator::profile::STEPS.len(),
            "fit_step {} is outside the artificial spectrum",
            self.fit_step
        );
        anyhow::ensure!(
            self.calbin_binsizes.iter().all(|b| b.is_finite() && *b > 0.0),
            "calbin bin sizes must be positive: {:?}",
            self.calbin_binsizes
        );
        anyhow::ensure!(self.n_sigma > 0.0, "n_sigma must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gammacore::prelude::FitStatistic;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_from_args_overrides_seed_and_binsizes() {
        let cfg = WorkflowConfig::from_args(7, vec![0.5, 3.0]);
        assert_eq!(cfg.generator.seed, 7);
        assert_eq!(cfg.calbin_binsizes, vec![0.5, 3.0]);
        assert_eq!(WorkflowConfig::from_args(0, vec![]).calbin_binsizes, vec![1.0, 2.0]);
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"generator:\n  nbins_per_step: 300\n  seed: 11\nfit:\n  statistic: poisson_likelihood\ncalbin_binsizes: [2.0]\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.generator.nbins_per_step, 300);
        assert_eq!(cfg.generator.seed, 11);
        assert_eq!(cfg.generator.background, 100.0);
        assert_eq!(cfg.fit.statistic, FitStatistic::PoissonLikelihood);
        assert_eq!(cfg.calbin_binsizes, vec![2.0]);
        assert_eq!(cfg.n_sigma, 3.0);
    }

    #[test]
    fn config_load_rejects_bad_binsize() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(b"calbin_binsizes: [1.0, -2.0]\n").unwrap();
        let path = temp.into_temp_path();
        assert!(WorkflowConfig::load(&path).is_err());
    }
}
