//! # Leave-Future-Out Validation
//!
//! Sanity-checks each fitted model family by predicting backwards in
//! disease time. For every patient the series is split into a training part
//! (observations at least one year after that patient's own first
//! observation, with at least two such later observations required) and a
//! test part (the patient's single first observation). The model is fitted
//! on the training part only and evaluated at the held-out first
//! observation's disease time, against a null baseline that simply carries
//! the earliest training value backwards.
//!
//! Fewer than three eligible patients after partitioning is a hard error
//! that the caller is expected to propagate; every other per-outcome
//! failure is caught by the caller, logged and skipped.

use crate::config::AnalysisConfig;
use crate::data::LongitudinalRecord;
use crate::fit::{self, FitError, FitSettings};
use crate::predict;
use crate::registry::OutcomeSpec;
use thiserror::Error;

/// How far after a patient's first observation the training window starts.
const TRAINING_GAP_YEARS: f64 = 1.0;

/// The minimum eligible-patient count below which validation is a hard
/// stop for the enclosing cohort loop.
const MIN_ELIGIBLE_PATIENTS: usize = 3;

#[derive(Error, Debug)]
pub enum ValidateError {
    /// The hard stop: unlike every other outcome-scoped condition this one
    /// propagates and aborts the cohort iteration.
    #[error("only {found} patients remain after the leave-future-out partition (need at least 3)")]
    TooFewEligiblePatients { found: usize },
    #[error("fewer than {required} qualifying training observations ({found})")]
    InsufficientData { found: usize, required: usize },
    #[error(transparent)]
    Fit(#[from] FitError),
}

/// Per-outcome validation scores, one row of the validation table.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRow {
    pub outcome: String,
    /// Eligible patients after partitioning.
    pub n: usize,
    pub sse: f64,
    pub null_sse: f64,
    pub sst: f64,
    pub r2: f64,
    pub null_r2: f64,
    /// 1 - model SSE / null SSE.
    pub improvement: f64,
}

struct Partition {
    training: Vec<LongitudinalRecord>,
    /// One held-out first observation per eligible patient.
    test: Vec<LongitudinalRecord>,
    /// Earliest training value per eligible patient, the null prediction.
    null_predictions: Vec<f64>,
}

/// Splits each patient's series into training and test parts. Patients
/// without two observations beyond the one-year gap are dropped entirely.
fn partition(records: &[LongitudinalRecord]) -> Partition {
    use std::collections::BTreeMap;

    let mut by_patient: BTreeMap<&str, Vec<&LongitudinalRecord>> = BTreeMap::new();
    for record in records {
        by_patient
            .entry(record.patient_id.as_str())
            .or_default()
            .push(record);
    }

    let mut training = Vec::new();
    let mut test = Vec::new();
    let mut null_predictions = Vec::new();
    for (_, mut series) in by_patient {
        series.sort_by(|a, b| a.disease_time.total_cmp(&b.disease_time));
        let first = series[0];
        let later: Vec<&&LongitudinalRecord> = series
            .iter()
            .filter(|r| r.disease_time >= first.disease_time + TRAINING_GAP_YEARS)
            .collect();
        if later.len() < 2 {
            continue;
        }
        let earliest_training = later
            .iter()
            .map(|r| (r.disease_time, r.value))
            .fold((f64::INFINITY, f64::NAN), |best, candidate| {
                if candidate.0 < best.0 { candidate } else { best }
            });
        training.extend(later.iter().map(|r| (**r).clone()));
        test.push(first.clone());
        null_predictions.push(earliest_training.1);
    }

    Partition {
        training,
        test,
        null_predictions,
    }
}

/// Runs the leave-future-out check for one outcome of one cohort.
pub fn validate_outcome(
    spec: &OutcomeSpec,
    records: &[LongitudinalRecord],
    config: &AnalysisConfig,
    settings: &FitSettings,
) -> Result<ValidationRow, ValidateError> {
    let partition = partition(records);
    if partition.test.len() < MIN_ELIGIBLE_PATIENTS {
        return Err(ValidateError::TooFewEligiblePatients {
            found: partition.test.len(),
        });
    }
    if partition.training.len() < config.min_observations {
        return Err(ValidateError::InsufficientData {
            found: partition.training.len(),
            required: config.min_observations,
        });
    }

    let model = fit::fit(spec.kind, &partition.training, settings)?;
    let targets: Vec<(String, f64)> = partition
        .test
        .iter()
        .map(|r| (r.patient_id.clone(), r.disease_time))
        .collect();
    let predictions = predict::predict_at(&model, spec, &targets);

    let truths: Vec<f64> = partition.test.iter().map(|r| r.value).collect();
    let mean_truth = truths.iter().sum::<f64>() / truths.len() as f64;

    let mut sse = 0.0;
    let mut null_sse = 0.0;
    let mut sst = 0.0;
    for ((prediction, truth), null_prediction) in predictions
        .iter()
        .zip(truths.iter())
        .zip(partition.null_predictions.iter())
    {
        sse += (prediction.value - truth) * (prediction.value - truth);
        null_sse += (null_prediction - truth) * (null_prediction - truth);
        sst += (truth - mean_truth) * (truth - mean_truth);
    }

    let r2 = if sst > 0.0 { 1.0 - sse / sst } else { f64::NAN };
    let null_r2 = if sst > 0.0 {
        1.0 - null_sse / sst
    } else {
        f64::NAN
    };
    let improvement = if null_sse > 0.0 {
        1.0 - sse / null_sse
    } else {
        f64::NAN
    };

    Ok(ValidationRow {
        outcome: spec.id.clone(),
        n: partition.test.len(),
        sse,
        null_sse,
        sst,
        r2,
        null_r2,
        improvement,
    })
}
