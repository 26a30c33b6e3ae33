//! Command-line orchestrator. Owns input resolution and stage sequencing;
//! all statistics live in the library. The orchestrator presents a minimal
//! interface: an outcome mapping table, one visits/baseline table pair per
//! cohort and an output directory. Tuning knobs that do not change the
//! numeric contract stay internal.

use clap::Parser;
use delaymap::config::{AnalysisConfig, ScopeFilter};
use delaymap::data;
use delaymap::fit::FitSettings;
use delaymap::pipeline::{self, CohortInput};
use delaymap::registry::OutcomeRegistry;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "delaymap",
    about = "Correlate modeled symptom severity at disease-time zero with diagnostic delay",
    long_about = "Fits per-outcome longitudinal mixed models on a shared disease-time axis, \
                  predicts each patient's severity at time zero, correlates the predictions \
                  with an independently derived diagnostic-delay measure, and pools the \
                  per-cohort estimates into cross-cohort summary effects."
)]
struct Cli {
    /// Outcome mapping table (TSV: outcome, kind, invert, min_value, category, label)
    #[arg(long, value_name = "FILE")]
    registry: PathBuf,

    /// Cohort input as NAME=VISITS.tsv:BASELINE.tsv; repeat per cohort
    #[arg(long = "cohort", value_name = "NAME=VISITS:BASELINE", required = true)]
    cohorts: Vec<String>,

    /// Directory the output tables and forest artifacts are written to
    #[arg(long, value_name = "DIR")]
    out_dir: PathBuf,

    /// Minimum qualifying observations per (outcome, cohort) pair
    #[arg(long, default_value = "30")]
    min_observations: usize,

    /// Reference point on the disease-time axis
    #[arg(long, default_value = "0.0")]
    reference_time: f64,

    /// Suffix appended to every output file name
    #[arg(long, default_value = "")]
    suffix: String,

    /// Skip the leave-future-out validation stage
    #[arg(long)]
    no_validation: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let registry = OutcomeRegistry::load(&cli.registry)?;
    log::info!(
        "loaded {} outcome specs from '{}'",
        registry.len(),
        cli.registry.display()
    );

    let mut cohorts = Vec::new();
    for spec in &cli.cohorts {
        cohorts.push(load_cohort(spec)?);
    }

    fs::create_dir_all(&cli.out_dir)?;
    let config = AnalysisConfig {
        min_observations: cli.min_observations,
        reference_time: cli.reference_time,
        output_suffix: cli.suffix.clone(),
        scope: ScopeFilter::all(),
    };

    let output = pipeline::run(
        &registry,
        &cohorts,
        &config,
        &FitSettings::default(),
        !cli.no_validation,
        Some(&cli.out_dir),
    )?;

    println!(
        "processed {} cohorts; {} pooled summaries; {} outcomes skipped",
        output.cohorts.len(),
        output.meta.len(),
        output.skipped.len()
    );
    for skip in &output.skipped {
        println!(
            "  skipped [{}] {} / {}: {}",
            skip.stage, skip.cohort, skip.outcome, skip.reason
        );
    }
    Ok(())
}

fn load_cohort(spec: &str) -> Result<CohortInput, Box<dyn Error>> {
    let (name, paths) = spec
        .split_once('=')
        .ok_or_else(|| format!("cohort spec '{spec}' is not NAME=VISITS:BASELINE"))?;
    let (visits_path, baseline_path) = paths
        .split_once(':')
        .ok_or_else(|| format!("cohort spec '{spec}' is missing the ':BASELINE' part"))?;
    let visits = data::load_visit_table(Path::new(visits_path), name)?;
    let baseline = data::load_baseline_table(Path::new(baseline_path), name)?;
    log::info!(
        "cohort '{name}': {} visit rows, {} baseline patients",
        visits.patient_ids.len(),
        baseline.records.len()
    );
    Ok(CohortInput {
        name: name.to_string(),
        visits,
        baseline,
    })
}
