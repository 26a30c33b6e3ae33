//! # Delay Correlation
//!
//! Produces the outcome-level effect estimate consumed by the
//! meta-analysis: the model is fitted on ALL available records of an
//! (outcome, cohort) pair, evaluated at the reference disease time for
//! every patient, and the predicted severities are correlated with each
//! patient's diagnostic-delay measure.
//!
//! The correlation method is a pure function of the regression kind:
//! Pearson for linear outcomes, point-biserial (Pearson against the 0/1
//! prediction) for binary outcomes, Kendall rank correlation for ordinal
//! outcomes. After every outcome of one cohort is collected the cohort's
//! p-values get a Benjamini-Hochberg pass and each coefficient's standard
//! error is derived from its confidence-interval width.

use crate::config::AnalysisConfig;
use crate::data::LongitudinalRecord;
use crate::fit::{self, FitError, FitSettings};
use crate::predict;
use crate::registry::{OutcomeSpec, RegressionKind};
use crate::stats::{self, Z_95};
use ndarray::Array1;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorrelateError {
    #[error("fewer than {required} qualifying observations ({found})")]
    InsufficientData { found: usize, required: usize },
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error("all predictions are identical; the correlation is undefined")]
    DegenerateCorrelation,
    #[error("fewer than three patients have both a prediction and a delay measure")]
    TooFewPairs,
}

/// One per-(outcome, cohort) correlation estimate. `p_adjusted` and `sem`
/// are filled by [`adjust_cohort`] once the cohort is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationResult {
    pub outcome: String,
    pub cohort: String,
    pub kind: RegressionKind,
    pub coefficient: f64,
    pub p_value: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub n: usize,
    pub p_adjusted: f64,
    pub sem: f64,
}

/// Fits, predicts at the reference time and correlates one outcome of one
/// cohort against the diagnostic-delay measure.
pub fn correlate_outcome(
    spec: &OutcomeSpec,
    records: &[LongitudinalRecord],
    delays: &BTreeMap<String, f64>,
    config: &AnalysisConfig,
    settings: &FitSettings,
) -> Result<CorrelationResult, CorrelateError> {
    if records.len() < config.min_observations {
        return Err(CorrelateError::InsufficientData {
            found: records.len(),
            required: config.min_observations,
        });
    }

    let model = fit::fit(spec.kind, records, settings)?;
    let predictions = predict::predict_all_patients(&model, spec, config.reference_time);

    // Join predictions with each patient's delay measure.
    let mut predicted = Vec::new();
    let mut delay = Vec::new();
    for prediction in &predictions {
        if let Some(&value) = delays.get(&prediction.patient_id) {
            predicted.push(prediction.value);
            delay.push(value);
        }
    }

    let mut distinct = predicted.clone();
    distinct.sort_by(|a, b| a.total_cmp(b));
    distinct.dedup();
    if distinct.len() < 2 {
        return Err(CorrelateError::DegenerateCorrelation);
    }

    let delay = Array1::from_vec(delay);
    let predicted = Array1::from_vec(predicted);
    let correlation = match spec.kind {
        RegressionKind::Linear | RegressionKind::Binary => {
            stats::pearson(delay.view(), predicted.view())
        }
        RegressionKind::Ordinal => stats::kendall(delay.view(), predicted.view()),
    }
    .ok_or(CorrelateError::TooFewPairs)?;

    Ok(CorrelationResult {
        outcome: spec.id.clone(),
        cohort: records
            .first()
            .map(|r| r.cohort.clone())
            .unwrap_or_default(),
        kind: spec.kind,
        coefficient: correlation.coefficient,
        p_value: correlation.p_value,
        ci_low: correlation.ci_low,
        ci_high: correlation.ci_high,
        n: correlation.n,
        p_adjusted: correlation.p_value,
        sem: f64::NAN,
    })
}

/// The per-cohort closing pass: sorts by outcome identifier (results may
/// arrive from parallel workers in any order), applies Benjamini-Hochberg
/// across the cohort's p-values and derives each coefficient's standard
/// error as half the confidence-interval width divided by the 95% normal
/// multiplier.
pub fn adjust_cohort(results: &mut Vec<CorrelationResult>) {
    results.sort_by(|a, b| a.outcome.cmp(&b.outcome));
    let p_values: Vec<f64> = results.iter().map(|r| r.p_value).collect();
    let adjusted = stats::bh_adjust(&p_values);
    for (result, p_adjusted) in results.iter_mut().zip(adjusted) {
        result.p_adjusted = p_adjusted;
        result.sem = (result.ci_high - result.ci_low) / 2.0 / Z_95;
    }
}
