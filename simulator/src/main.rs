use anyhow::Context;
use clap::Parser;
use generator::profile::build_spectrum;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use workflow::config::WorkflowConfig;
use workflow::runner::Runner;

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Batch driver for gamma spectrum fits and calbin checks")]
struct Args {
    /// Fit the artificial spectrum, rebin it and check the fits agree
    #[arg(long, default_value_t = false)]
    offline: bool,
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    /// Run a batch script of fit commands
    #[arg(long)]
    script: Option<PathBuf>,
    /// Seed of the artificial spectrum noise
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Calbin bin size, may be repeated
    #[arg(long = "binsize")]
    binsizes: Vec<f64>,
    /// Write the artificial spectrum as JSON
    #[arg(long)]
    emit_spectrum: Option<PathBuf>,
    /// Write the stored fits of the active spectrum
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let workflow_config = if let Some(path) = args.workflow {
        WorkflowConfig::load(path)?
    } else {
        WorkflowConfig::from_args(args.seed, args.binsizes)
    };

    if let Some(path) = &args.emit_spectrum {
        let spectrum = build_spectrum(&workflow_config.generator)?;
        let file = File::create(path)
            .with_context(|| format!("creating spectrum file {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), &spectrum)
            .with_context(|| format!("writing spectrum {}", path.display()))?;
        println!("Artificial spectrum -> {} ({} bins)", path.display(), spectrum.len());
    }

    let mut runner = Runner::new(workflow_config);

    if let Some(path) = &args.script {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading script {}", path.display()))?;
        for line in runner
            .run_text(&text)
            .with_context(|| format!("running script {}", path.display()))?
        {
            println!("{}", line);
        }
    }

    if args.offline {
        let outcome = runner.calbin_check()?;
        println!("Initial fit:\n{}", outcome.initial.summary());
        for (binsize, fit) in &outcome.rebinned {
            println!("After calbin -b {}:\n{}", binsize, fit.summary());
        }
        println!("{}", outcome.report);
        let metrics = runner.session().metrics();
        println!(
            "fits={} failures={} iterations={} rebins={}",
            metrics.fits, metrics.failures, metrics.iterations, metrics.rebins
        );
        anyhow::ensure!(
            outcome.report.passed(),
            "calbin consistency check failed ({} checks)",
            outcome.report.failures().count()
        );
    }

    if let Some(path) = &args.output {
        let id = runner
            .session()
            .active_id()
            .context("no active spectrum to export fits from")?;
        runner.session().export_fits(id)?.save(path)?;
    }

    Ok(())
}
