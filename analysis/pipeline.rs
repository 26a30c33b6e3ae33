//! # Pipeline Orchestration
//!
//! Drives the per-cohort stages in order: leave-future-out validation,
//! delay correlation with the per-cohort Benjamini-Hochberg pass, and the
//! cross-cohort meta-analysis. Failure isolation follows one rule: every
//! outcome-scoped failure is caught at the smallest scope, recorded in the
//! skip log and the loop continues — except the validator's
//! insufficient-patient condition, which aborts the cohort iteration.
//!
//! Output tables are written once, fully, after all outcomes of a cohort
//! are processed; a skipped outcome never leaves a partial row behind.

use crate::config::AnalysisConfig;
use crate::correlate::{self, CorrelateError, CorrelationResult};
use crate::data::{self, BaselineTable, DataError, VisitTable};
use crate::fit::FitSettings;
use crate::meta::{self, ForestPlotData, MetaResult};
use crate::registry::{OutcomeRegistry, OutcomeSpec};
use crate::validate::{self, ValidateError, ValidationRow};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Why an (outcome, cohort) pair produced no result.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The outcome is registered but absent from this cohort's table.
    MissingOutcome,
    InsufficientData { found: usize, required: usize },
    FitFailure(String),
    DegenerateCorrelation,
    TooFewPairs,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingOutcome => write!(f, "outcome absent from the cohort table"),
            SkipReason::InsufficientData { found, required } => {
                write!(f, "{found} qualifying observations, need {required}")
            }
            SkipReason::FitFailure(reason) => write!(f, "fit failed: {reason}"),
            SkipReason::DegenerateCorrelation => {
                write!(f, "all predictions identical; correlation undefined")
            }
            SkipReason::TooFewPairs => write!(f, "too few prediction/delay pairs"),
        }
    }
}

/// Which stage skipped the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validation,
    Correlation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Validation => write!(f, "validation"),
            Stage::Correlation => write!(f, "correlation"),
        }
    }
}

/// One skip-log line.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedOutcome {
    pub cohort: String,
    pub outcome: String,
    pub stage: Stage,
    pub reason: SkipReason,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Data(#[from] DataError),
    /// The validator's hard stop, propagated out of the cohort loop.
    #[error("validation of cohort '{cohort}', outcome '{outcome}': {source}")]
    ValidationAborted {
        cohort: String,
        outcome: String,
        source: ValidateError,
    },
    #[error("failed to write '{path}': {message}")]
    WriteFailed { path: PathBuf, message: String },
}

/// A cohort's input tables.
#[derive(Debug, Clone)]
pub struct CohortInput {
    pub name: String,
    pub visits: VisitTable,
    pub baseline: BaselineTable,
}

/// Everything produced for one cohort.
#[derive(Debug, Clone)]
pub struct CohortReport {
    pub cohort: String,
    pub validation: Vec<ValidationRow>,
    pub correlations: Vec<CorrelationResult>,
}

/// The full pipeline result.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub cohorts: Vec<CohortReport>,
    pub meta: Vec<MetaResult>,
    pub forest: Vec<ForestPlotData>,
    pub skipped: Vec<SkippedOutcome>,
}

/// Runs the whole pipeline over the given cohorts. When `out_dir` is set,
/// the per-cohort and final tables are written there as tab-separated
/// files, each once and in full. `with_validation` switches the
/// leave-future-out stage on or off.
pub fn run(
    registry: &OutcomeRegistry,
    cohorts: &[CohortInput],
    config: &AnalysisConfig,
    settings: &FitSettings,
    with_validation: bool,
    out_dir: Option<&Path>,
) -> Result<PipelineOutput, PipelineError> {
    let mut skipped = Vec::new();
    let mut reports = Vec::new();
    let mut all_correlations = Vec::new();

    for cohort in cohorts {
        // The scope filter defines this run's patient set; both tables are
        // restricted before any stage sees them.
        let baseline = restrict_baseline(&cohort.baseline, config);
        let patients: HashSet<String> = baseline
            .records
            .iter()
            .map(|r| r.patient_id.clone())
            .collect();
        let visits = cohort.visits.restrict_to(&patients);
        log::info!(
            "cohort '{}' (scope '{}'): {} visits across {} patients, {} registered outcomes",
            cohort.name,
            config.scope.label(),
            visits.patient_ids.len(),
            patients.len(),
            registry.len()
        );

        let validation = if with_validation {
            run_validation_stage(registry, &visits, &cohort.name, config, settings, &mut skipped)?
        } else {
            Vec::new()
        };

        let mut correlations =
            run_correlation_stage(registry, &visits, &baseline, &cohort.name, config, settings, &mut skipped);
        correlate::adjust_cohort(&mut correlations);

        if let Some(dir) = out_dir {
            if with_validation {
                write_validation_table(dir, &cohort.name, config, &validation)?;
            }
            write_correlation_table(dir, &cohort.name, config, &correlations)?;
        }

        all_correlations.extend(correlations.iter().cloned());
        reports.push(CohortReport {
            cohort: cohort.name.clone(),
            validation,
            correlations,
        });
    }

    let (meta_results, forest) = meta::pool(&all_correlations, registry);
    if let Some(dir) = out_dir {
        write_meta_table(dir, config, &meta_results)?;
        for data in &forest {
            write_forest_artifact(dir, config, data)?;
        }
    }

    for skip in &skipped {
        log::warn!(
            "skipped {} of outcome '{}' in cohort '{}': {}",
            skip.stage,
            skip.outcome,
            skip.cohort,
            skip.reason
        );
    }

    Ok(PipelineOutput {
        cohorts: reports,
        meta: meta_results,
        forest,
        skipped,
    })
}

fn restrict_baseline(baseline: &BaselineTable, config: &AnalysisConfig) -> BaselineTable {
    BaselineTable {
        cohort: baseline.cohort.clone(),
        records: baseline
            .records
            .iter()
            .filter(|r| config.scope.keeps(r))
            .cloned()
            .collect(),
    }
}

fn run_validation_stage(
    registry: &OutcomeRegistry,
    visits: &VisitTable,
    cohort: &str,
    config: &AnalysisConfig,
    settings: &FitSettings,
    skipped: &mut Vec<SkippedOutcome>,
) -> Result<Vec<ValidationRow>, PipelineError> {
    let mut rows = Vec::new();
    for spec in registry.iter() {
        if !visits.has_outcome(&spec.id) {
            skipped.push(SkippedOutcome {
                cohort: cohort.to_string(),
                outcome: spec.id.clone(),
                stage: Stage::Validation,
                reason: SkipReason::MissingOutcome,
            });
            continue;
        }
        let records = data::qualify(visits.records_for(&spec.id));
        match validate::validate_outcome(spec, &records, config, settings) {
            Ok(row) => rows.push(row),
            // The one condition that aborts the whole cohort iteration.
            Err(err @ ValidateError::TooFewEligiblePatients { .. }) => {
                return Err(PipelineError::ValidationAborted {
                    cohort: cohort.to_string(),
                    outcome: spec.id.clone(),
                    source: err,
                });
            }
            Err(ValidateError::InsufficientData { found, required }) => {
                skipped.push(SkippedOutcome {
                    cohort: cohort.to_string(),
                    outcome: spec.id.clone(),
                    stage: Stage::Validation,
                    reason: SkipReason::InsufficientData { found, required },
                });
            }
            Err(ValidateError::Fit(err)) => {
                skipped.push(SkippedOutcome {
                    cohort: cohort.to_string(),
                    outcome: spec.id.clone(),
                    stage: Stage::Validation,
                    reason: SkipReason::FitFailure(err.to_string()),
                });
            }
        }
    }
    Ok(rows)
}

fn run_correlation_stage(
    registry: &OutcomeRegistry,
    visits: &VisitTable,
    baseline: &BaselineTable,
    cohort: &str,
    config: &AnalysisConfig,
    settings: &FitSettings,
    skipped: &mut Vec<SkippedOutcome>,
) -> Vec<CorrelationResult> {
    let mut present: Vec<&OutcomeSpec> = Vec::new();
    for spec in registry.iter() {
        if visits.has_outcome(&spec.id) {
            present.push(spec);
        } else {
            skipped.push(SkippedOutcome {
                cohort: cohort.to_string(),
                outcome: spec.id.clone(),
                stage: Stage::Correlation,
                reason: SkipReason::MissingOutcome,
            });
        }
    }

    let delays = baseline.delays();
    // The per-outcome units are independent; results are re-sorted by
    // outcome identifier before the BH pass, so the parallel schedule
    // never changes the output.
    let mut computed: Vec<(String, Result<CorrelationResult, CorrelateError>)> = present
        .par_iter()
        .map(|&spec| {
            let records = data::qualify(visits.records_for(&spec.id));
            let outcome = spec.id.clone();
            (
                outcome,
                correlate::correlate_outcome(spec, &records, &delays, config, settings),
            )
        })
        .collect();
    computed.sort_by(|a, b| a.0.cmp(&b.0));

    let mut results = Vec::new();
    for (outcome, result) in computed {
        match result {
            Ok(result) => results.push(result),
            Err(err) => {
                let reason = match err {
                    CorrelateError::InsufficientData { found, required } => {
                        SkipReason::InsufficientData { found, required }
                    }
                    CorrelateError::Fit(fit_error) => SkipReason::FitFailure(fit_error.to_string()),
                    CorrelateError::DegenerateCorrelation => SkipReason::DegenerateCorrelation,
                    CorrelateError::TooFewPairs => SkipReason::TooFewPairs,
                };
                skipped.push(SkippedOutcome {
                    cohort: cohort.to_string(),
                    outcome,
                    stage: Stage::Correlation,
                    reason,
                });
            }
        }
    }
    results
}

fn table_writer(path: &Path) -> Result<csv::Writer<std::fs::File>, PipelineError> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|e| PipelineError::WriteFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn finish_table(mut writer: csv::Writer<std::fs::File>, path: &Path) -> Result<(), PipelineError> {
    writer.flush().map_err(|e| PipelineError::WriteFailed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn write_row<const N: usize>(
    writer: &mut csv::Writer<std::fs::File>,
    path: &Path,
    row: [String; N],
) -> Result<(), PipelineError> {
    writer
        .write_record(row.iter())
        .map_err(|e| PipelineError::WriteFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn write_validation_table(
    dir: &Path,
    cohort: &str,
    config: &AnalysisConfig,
    rows: &[ValidationRow],
) -> Result<(), PipelineError> {
    let path = dir.join(format!("validation_{cohort}{}.tsv", config.output_suffix));
    let mut writer = table_writer(&path)?;
    write_row(
        &mut writer,
        &path,
        [
            "outcome".to_string(),
            "n".to_string(),
            "sse".to_string(),
            "null_sse".to_string(),
            "sst".to_string(),
            "r2".to_string(),
            "null_r2".to_string(),
            "improvement".to_string(),
        ],
    )?;
    for row in rows {
        write_row(
            &mut writer,
            &path,
            [
                row.outcome.clone(),
                row.n.to_string(),
                row.sse.to_string(),
                row.null_sse.to_string(),
                row.sst.to_string(),
                row.r2.to_string(),
                row.null_r2.to_string(),
                row.improvement.to_string(),
            ],
        )?;
    }
    finish_table(writer, &path)
}

fn write_correlation_table(
    dir: &Path,
    cohort: &str,
    config: &AnalysisConfig,
    results: &[CorrelationResult],
) -> Result<(), PipelineError> {
    let path = dir.join(format!("correlation_{cohort}{}.tsv", config.output_suffix));
    let mut writer = table_writer(&path)?;
    write_row(
        &mut writer,
        &path,
        [
            "outcome".to_string(),
            "kind".to_string(),
            "coef".to_string(),
            "p_value".to_string(),
            "ci_low".to_string(),
            "ci_high".to_string(),
            "n".to_string(),
            "p_adjusted".to_string(),
            "coef_sem".to_string(),
        ],
    )?;
    for result in results {
        write_row(
            &mut writer,
            &path,
            [
                result.outcome.clone(),
                result.kind.to_string(),
                result.coefficient.to_string(),
                result.p_value.to_string(),
                result.ci_low.to_string(),
                result.ci_high.to_string(),
                result.n.to_string(),
                result.p_adjusted.to_string(),
                result.sem.to_string(),
            ],
        )?;
    }
    finish_table(writer, &path)
}

fn write_meta_table(
    dir: &Path,
    config: &AnalysisConfig,
    results: &[MetaResult],
) -> Result<(), PipelineError> {
    let path = dir.join(format!("meta_analysis{}.tsv", config.output_suffix));
    let mut writer = table_writer(&path)?;
    write_row(
        &mut writer,
        &path,
        [
            "category".to_string(),
            "group".to_string(),
            "mean".to_string(),
            "ci_low".to_string(),
            "ci_high".to_string(),
            "p_value".to_string(),
            "p_adjusted".to_string(),
            "ci_low_adjusted".to_string(),
            "ci_high_adjusted".to_string(),
            "label".to_string(),
        ],
    )?;
    for result in results {
        write_row(
            &mut writer,
            &path,
            [
                result.category.clone(),
                result.group.clone(),
                result.mean.to_string(),
                result.ci_low.to_string(),
                result.ci_high.to_string(),
                result.p_value.to_string(),
                result.p_adjusted.to_string(),
                result.ci_low_adjusted.to_string(),
                result.ci_high_adjusted.to_string(),
                result.label.clone(),
            ],
        )?;
    }
    finish_table(writer, &path)
}

fn write_forest_artifact(
    dir: &Path,
    config: &AnalysisConfig,
    data: &ForestPlotData,
) -> Result<(), PipelineError> {
    let safe_category: String = data
        .title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let path = dir.join(format!("forest_{safe_category}{}.toml", config.output_suffix));
    let serialized = toml::to_string_pretty(data).map_err(|e| PipelineError::WriteFailed {
        path: path.clone(),
        message: e.to_string(),
    })?;
    std::fs::write(&path, serialized).map_err(|e| PipelineError::WriteFailed {
        path: path.clone(),
        message: e.to_string(),
    })
}
