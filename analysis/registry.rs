//! # Outcome Registry
//!
//! The registry is the data contract for every downstream stage: one
//! immutable [`OutcomeSpec`] per outcome identifier, loaded once from the
//! outcome mapping table. It decides which regression family fits an
//! outcome, how predictions are clipped (`invert` + `min_value`), and which
//! symptom category a correlation estimate is pooled under.
//!
//! The registry owns the category/label lookup; callers borrow specs rather
//! than copying labels around.

use polars::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// The regression family used for an outcome. Every fit/predict/correlate
/// operation dispatches on this tag exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RegressionKind {
    /// Continuous outcome, linear mixed model.
    Linear,
    /// 0/1 outcome, mixed logistic regression.
    Binary,
    /// Ordered categorical outcome, mixed cumulative-link model.
    Ordinal,
}

impl RegressionKind {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "linear" => Some(RegressionKind::Linear),
            "binary" => Some(RegressionKind::Binary),
            "ordinal" => Some(RegressionKind::Ordinal),
            _ => None,
        }
    }
}

impl fmt::Display for RegressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegressionKind::Linear => "linear",
            RegressionKind::Binary => "binary",
            RegressionKind::Ordinal => "ordinal",
        };
        f.write_str(name)
    }
}

/// Everything the pipeline needs to know about one clinical symptom score.
#[derive(Debug, Clone)]
pub struct OutcomeSpec {
    /// Column name of the outcome in the longitudinal visit tables.
    pub id: String,
    pub kind: RegressionKind,
    /// True when a LOW raw value means HIGH impairment. Controls the
    /// clipping direction of linear predictions and the polarity
    /// normalization before meta-analytic pooling.
    pub invert: bool,
    /// Theoretical scale bound. A floor when `invert` is false, a ceiling
    /// when it is true.
    pub min_value: f64,
    /// Symptom category the outcome is pooled under.
    pub category: String,
    /// Human-readable label for reports.
    pub label: String,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("the required column '{0}' was not found in the outcome mapping table")]
    ColumnNotFound(String),
    #[error("row {row}: '{value}' is not a regression kind (expected linear, binary or ordinal)")]
    BadKind { row: usize, value: String },
    #[error("row {row}: missing value in column '{column}'")]
    MissingValue { row: usize, column: String },
    #[error("duplicate outcome identifier '{0}' in the outcome mapping table")]
    DuplicateOutcome(String),
    #[error("the outcome mapping table contains no outcomes")]
    Empty,
}

/// All outcome specs of a run, keyed by outcome identifier. Iteration order
/// is the identifier order, so every per-cohort loop is deterministic.
#[derive(Debug, Clone)]
pub struct OutcomeRegistry {
    specs: BTreeMap<String, OutcomeSpec>,
}

impl OutcomeRegistry {
    /// Builds a registry from specs already in memory, enforcing the
    /// one-spec-per-outcome contract.
    pub fn from_specs(specs: Vec<OutcomeSpec>) -> Result<Self, RegistryError> {
        if specs.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut map = BTreeMap::new();
        for spec in specs {
            let id = spec.id.clone();
            if map.insert(id.clone(), spec).is_some() {
                return Err(RegistryError::DuplicateOutcome(id));
            }
        }
        Ok(Self { specs: map })
    }

    /// Loads the outcome mapping table (tab-separated, columns `outcome`,
    /// `kind`, `invert`, `min_value`, `category`, `label`).
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        for required in ["outcome", "kind", "invert", "min_value", "category", "label"] {
            if !df.get_column_names().iter().any(|c| c == &required) {
                return Err(RegistryError::ColumnNotFound(required.to_string()));
            }
        }

        let n = df.height();
        let text_column = |name: &str| -> Result<Vec<String>, RegistryError> {
            let casted = df.column(name)?.cast(&DataType::String)?;
            let chunked = casted.str()?.clone();
            let mut values = Vec::with_capacity(n);
            for (row, value) in chunked.iter().enumerate() {
                match value {
                    Some(text) if !text.trim().is_empty() => values.push(text.to_string()),
                    _ => {
                        return Err(RegistryError::MissingValue {
                            row,
                            column: name.to_string(),
                        });
                    }
                }
            }
            Ok(values)
        };
        let numeric_column = |name: &str| -> Result<Vec<f64>, RegistryError> {
            let casted = df.column(name)?.cast(&DataType::Float64)?;
            let chunked = casted.f64()?.clone();
            let mut values = Vec::with_capacity(n);
            for (row, value) in chunked.iter().enumerate() {
                match value {
                    Some(v) => values.push(v),
                    None => {
                        return Err(RegistryError::MissingValue {
                            row,
                            column: name.to_string(),
                        });
                    }
                }
            }
            Ok(values)
        };

        let outcomes = text_column("outcome")?;
        let kinds = text_column("kind")?;
        let inverts = numeric_column("invert")?;
        let min_values = numeric_column("min_value")?;
        let categories = text_column("category")?;
        let labels = text_column("label")?;

        let mut specs = Vec::with_capacity(n);
        for row in 0..n {
            let kind = RegressionKind::parse(&kinds[row]).ok_or_else(|| RegistryError::BadKind {
                row,
                value: kinds[row].clone(),
            })?;
            specs.push(OutcomeSpec {
                id: outcomes[row].clone(),
                kind,
                invert: inverts[row] != 0.0,
                min_value: min_values[row],
                category: categories[row].clone(),
                label: labels[row].clone(),
            });
        }
        Self::from_specs(specs)
    }

    pub fn get(&self, outcome: &str) -> Option<&OutcomeSpec> {
        self.specs.get(outcome)
    }

    /// Specs in outcome-identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &OutcomeSpec> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
