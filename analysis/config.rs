//! Run configuration threaded explicitly through every pipeline stage.
//!
//! The original analysis swapped a module-level filter predicate and a
//! filename suffix between runs; here both live in one [`AnalysisConfig`]
//! value that each stage receives as a parameter. No stage reads shared
//! mutable state.

use crate::data::BaselineRecord;
use std::fmt;
use std::sync::Arc;

/// Named predicate over baseline records, restricting a run to a patient
/// subgroup (for example "all", "early-onset"). The label doubles as the
/// provenance note in logs.
#[derive(Clone)]
pub struct ScopeFilter {
    label: String,
    predicate: Arc<dyn Fn(&BaselineRecord) -> bool + Send + Sync>,
}

impl ScopeFilter {
    pub fn new(
        label: impl Into<String>,
        predicate: impl Fn(&BaselineRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Keeps every patient.
    pub fn all() -> Self {
        Self::new("all", |_| true)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn keeps(&self, record: &BaselineRecord) -> bool {
        (self.predicate)(record)
    }
}

impl fmt::Debug for ScopeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeFilter")
            .field("label", &self.label)
            .finish()
    }
}

impl Default for ScopeFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Configuration shared by the validation, correlation and meta stages.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Minimum number of qualifying observations an (outcome, cohort) pair
    /// needs before any model is fitted.
    pub min_observations: usize,
    /// The canonical reference point on the disease-time axis.
    pub reference_time: f64,
    /// Appended to every output table name, so subgroup runs never
    /// overwrite each other.
    pub output_suffix: String,
    /// Which patients participate in this run.
    pub scope: ScopeFilter,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_observations: 30,
            reference_time: 0.0,
            output_suffix: String::new(),
            scope: ScopeFilter::all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn baseline(delay: f64) -> BaselineRecord {
        BaselineRecord {
            patient_id: "p1".to_string(),
            diagnostic_delay: delay,
            cohort: "c1".to_string(),
            covariates: BTreeMap::new(),
        }
    }

    #[test]
    fn default_scope_keeps_everyone() {
        let config = AnalysisConfig::default();
        assert_eq!(config.min_observations, 30);
        assert_eq!(config.reference_time, 0.0);
        assert!(config.scope.keeps(&baseline(3.0)));
    }

    #[test]
    fn custom_scope_filters_records() {
        let scope = ScopeFilter::new("late", |r: &BaselineRecord| r.diagnostic_delay > 2.0);
        assert_eq!(scope.label(), "late");
        assert!(scope.keeps(&baseline(3.0)));
        assert!(!scope.keeps(&baseline(1.0)));
    }
}
