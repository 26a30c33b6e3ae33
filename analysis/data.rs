//! # Cohort Table Loading and Validation
//!
//! Exclusive entry point for the per-cohort input tables: the longitudinal
//! visit table (one row per visit, one numeric column per outcome) and the
//! baseline table (one row per patient with the diagnostic-delay measure).
//! Files are tab-separated with a header row.
//!
//! - Strict schema on the identifying columns: `patient_id` and
//!   `disease_time` (visits), `patient_id` and `diagnostic_delay`
//!   (baseline) must be present, complete and finite.
//! - Outcome columns are nullable by design; a missing cell only removes
//!   that (patient, visit, outcome) observation, never the row. The fitting
//!   invariant "no missing values in the fields used" is enforced at
//!   extraction time in [`VisitTable::records_for`].
//! - Failures are assumed to be user-input errors and carry actionable
//!   messages.

use polars::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// One observation of one outcome for one patient at one disease time.
#[derive(Debug, Clone, PartialEq)]
pub struct LongitudinalRecord {
    pub patient_id: String,
    /// Position on the shared, cross-cohort disease-time axis. Computed
    /// upstream by the trajectory-alignment model; opaque here.
    pub disease_time: f64,
    pub value: f64,
    pub cohort: String,
}

/// Per-patient baseline row: the diagnostic-delay measure plus any
/// demographic columns, which only the scope filter ever reads.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineRecord {
    pub patient_id: String,
    pub diagnostic_delay: f64,
    pub cohort: String,
    pub covariates: BTreeMap<String, f64>,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("the required column '{0}' was not found in the input file")]
    ColumnNotFound(String),
    #[error("missing or null values were found in the required column '{0}'")]
    MissingValuesFound(String),
    #[error("non-finite values (NaN or Infinity) were found in the required column '{0}'")]
    NonFiniteValuesFound(String),
    #[error(
        "the column '{column_name}' could not be converted to the expected type \
         '{expected_type}' (found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("patient '{0}' appears more than once in the baseline table")]
    DuplicateBaselinePatient(String),
    #[error("the visit table contains no outcome columns")]
    NoOutcomeColumns,
}

/// A cohort's longitudinal visit table in column form. Outcome cells are
/// optional; identifying columns are complete.
#[derive(Debug, Clone)]
pub struct VisitTable {
    pub cohort: String,
    pub patient_ids: Vec<String>,
    pub disease_times: Vec<f64>,
    /// Outcome column name -> per-visit values, aligned with `patient_ids`.
    pub outcomes: BTreeMap<String, Vec<Option<f64>>>,
}

impl VisitTable {
    pub fn has_outcome(&self, outcome: &str) -> bool {
        self.outcomes.contains_key(outcome)
    }

    /// Extracts the complete observations of one outcome. Visits with a
    /// missing cell are dropped here, so every downstream consumer only
    /// ever sees records with no missing values in the fields used.
    pub fn records_for(&self, outcome: &str) -> Vec<LongitudinalRecord> {
        let Some(column) = self.outcomes.get(outcome) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        for (row, value) in column.iter().enumerate() {
            if let Some(value) = value {
                records.push(LongitudinalRecord {
                    patient_id: self.patient_ids[row].clone(),
                    disease_time: self.disease_times[row],
                    value: *value,
                    cohort: self.cohort.clone(),
                });
            }
        }
        records
    }

    /// The table restricted to a patient subset (scope filtering).
    pub fn restrict_to(&self, patients: &HashSet<String>) -> VisitTable {
        let keep: Vec<usize> = (0..self.patient_ids.len())
            .filter(|&row| patients.contains(&self.patient_ids[row]))
            .collect();
        let outcomes = self
            .outcomes
            .iter()
            .map(|(name, column)| {
                let kept: Vec<Option<f64>> = keep.iter().map(|&row| column[row]).collect();
                (name.clone(), kept)
            })
            .collect();
        VisitTable {
            cohort: self.cohort.clone(),
            patient_ids: keep.iter().map(|&row| self.patient_ids[row].clone()).collect(),
            disease_times: keep.iter().map(|&row| self.disease_times[row]).collect(),
            outcomes,
        }
    }
}

/// A cohort's baseline table, one record per patient.
#[derive(Debug, Clone)]
pub struct BaselineTable {
    pub cohort: String,
    pub records: Vec<BaselineRecord>,
}

impl BaselineTable {
    /// Patient -> diagnostic delay, in patient order.
    pub fn delays(&self) -> BTreeMap<String, f64> {
        self.records
            .iter()
            .map(|r| (r.patient_id.clone(), r.diagnostic_delay))
            .collect()
    }

    pub fn restrict_to(&self, patients: &HashSet<String>) -> BaselineTable {
        BaselineTable {
            cohort: self.cohort.clone(),
            records: self
                .records
                .iter()
                .filter(|r| patients.contains(&r.patient_id))
                .cloned()
                .collect(),
        }
    }
}

/// Keeps only the records of patients with at least two distinct
/// disease-time observations. The fitter's input contract.
pub fn qualify(records: Vec<LongitudinalRecord>) -> Vec<LongitudinalRecord> {
    let mut times: HashMap<&str, HashSet<u64>> = HashMap::new();
    for record in &records {
        times
            .entry(record.patient_id.as_str())
            .or_default()
            .insert(record.disease_time.to_bits());
    }
    let eligible: HashSet<String> = times
        .into_iter()
        .filter(|(_, distinct)| distinct.len() >= 2)
        .map(|(patient, _)| patient.to_string())
        .collect();
    records
        .into_iter()
        .filter(|r| eligible.contains(&r.patient_id))
        .collect()
}

/// Loads a cohort's longitudinal visit table. Every numeric column other
/// than `patient_id` and `disease_time` is treated as an outcome column.
pub fn load_visit_table(path: &Path, cohort: &str) -> Result<VisitTable, DataError> {
    let df = read_tsv(path)?;
    let patient_ids = extract_text_column(&df, "patient_id")?;
    let disease_times = extract_required_numeric(&df, "disease_time")?;

    let mut outcomes = BTreeMap::new();
    for name in df.get_column_names() {
        let name = name.to_string();
        if name == "patient_id" || name == "disease_time" {
            continue;
        }
        match extract_optional_numeric(&df, &name) {
            Ok(column) => {
                outcomes.insert(name, column);
            }
            // Non-numeric annotation columns are not outcomes; leave them.
            Err(DataError::ColumnWrongType { .. }) => continue,
            Err(other) => return Err(other),
        }
    }
    if outcomes.is_empty() {
        return Err(DataError::NoOutcomeColumns);
    }

    Ok(VisitTable {
        cohort: cohort.to_string(),
        patient_ids,
        disease_times,
        outcomes,
    })
}

/// Loads a cohort's baseline table. Numeric columns beyond the two required
/// ones are kept as covariates for the scope filter.
pub fn load_baseline_table(path: &Path, cohort: &str) -> Result<BaselineTable, DataError> {
    let df = read_tsv(path)?;
    let patient_ids = extract_text_column(&df, "patient_id")?;
    let delays = extract_required_numeric(&df, "diagnostic_delay")?;

    let mut covariate_columns: Vec<(String, Vec<Option<f64>>)> = Vec::new();
    for name in df.get_column_names() {
        let name = name.to_string();
        if name == "patient_id" || name == "diagnostic_delay" {
            continue;
        }
        match extract_optional_numeric(&df, &name) {
            Ok(column) => covariate_columns.push((name, column)),
            Err(DataError::ColumnWrongType { .. }) => continue,
            Err(other) => return Err(other),
        }
    }

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(patient_ids.len());
    for row in 0..patient_ids.len() {
        if !seen.insert(patient_ids[row].clone()) {
            return Err(DataError::DuplicateBaselinePatient(patient_ids[row].clone()));
        }
        let mut covariates = BTreeMap::new();
        for (name, column) in &covariate_columns {
            if let Some(value) = column[row] {
                covariates.insert(name.clone(), value);
            }
        }
        records.push(BaselineRecord {
            patient_id: patient_ids[row].clone(),
            diagnostic_delay: delays[row],
            cohort: cohort.to_string(),
            covariates,
        });
    }

    Ok(BaselineTable {
        cohort: cohort.to_string(),
        records,
    })
}

fn read_tsv(path: &Path) -> Result<DataFrame, DataError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    Ok(df)
}

fn extract_text_column(df: &DataFrame, name: &str) -> Result<Vec<String>, DataError> {
    let column = df
        .column(name)
        .map_err(|_| DataError::ColumnNotFound(name.to_string()))?;
    if column.null_count() > 0 {
        return Err(DataError::MissingValuesFound(name.to_string()));
    }
    let casted = column.cast(&DataType::String)?;
    let chunked = casted.str()?.clone();
    Ok(chunked
        .iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect())
}

fn extract_required_numeric(df: &DataFrame, name: &str) -> Result<Vec<f64>, DataError> {
    let column = df
        .column(name)
        .map_err(|_| DataError::ColumnNotFound(name.to_string()))?;
    if column.null_count() > 0 {
        return Err(DataError::MissingValuesFound(name.to_string()));
    }
    let casted = column
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        })?;
    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        });
    }
    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(name.to_string()));
    }
    Ok(values)
}

fn extract_optional_numeric(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, DataError> {
    let column = df
        .column(name)
        .map_err(|_| DataError::ColumnNotFound(name.to_string()))?;
    let casted = column
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        })?;
    if casted.null_count() > column.null_count() {
        // Some cells failed the numeric cast: this is not an outcome column.
        return Err(DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        });
    }
    let chunked = casted.f64()?.clone();
    let mut values = Vec::with_capacity(chunked.len());
    for value in chunked.iter() {
        match value {
            Some(v) if !v.is_finite() => {
                return Err(DataError::NonFiniteValuesFound(name.to_string()));
            }
            other => values.push(other),
        }
    }
    Ok(values)
}
