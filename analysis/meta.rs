//! # Cross-Cohort Meta-Analysis
//!
//! Pools the per-(outcome, cohort) correlation estimates into summary
//! effects per symptom category. Before pooling, polarity is normalized:
//! estimates of inverted outcomes (low raw value = high impairment) are
//! negated, and their confidence bounds swapped and negated, so that a
//! positive pooled value uniformly means "higher predicted severity at
//! time zero is associated with later diagnosis".
//!
//! Each estimate enters the pool as an observed mean with an effective
//! spread (the derived SEM scaled by the square root of its sample size)
//! and its sample size; pooling is DerSimonian-Laird random effects. One
//! "overall" summary is produced per category plus one summary per cohort
//! subgroup. Benjamini-Hochberg correction is then reapplied independently
//! within the overall group and within each cohort subgroup, and the
//! adjusted confidence bounds are recomputed from the adjusted p-value via
//! the inverse normal.
//!
//! The numeric forest-plot data (per-study entries plus the pooled
//! summary) is produced here; rendering belongs to an external
//! visualization collaborator.

use crate::correlate::CorrelationResult;
use crate::registry::OutcomeRegistry;
use crate::stats::{self, Z_95};
use itertools::Itertools;
use serde::Serialize;
use std::collections::BTreeMap;

/// The pooling group every cohort subgroup is compared against.
pub const OVERALL_GROUP: &str = "overall";

/// One pooled summary effect for a (category, pooling group) cell of the
/// final table.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaResult {
    pub category: String,
    /// `"overall"` or a cohort name.
    pub group: String,
    pub mean: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub p_value: f64,
    pub p_adjusted: f64,
    pub ci_low_adjusted: f64,
    pub ci_high_adjusted: f64,
    /// Display label of the pooling group.
    pub label: String,
    /// Between-study heterogeneity of the pool.
    pub tau_squared: f64,
    /// Number of pooled per-(outcome, cohort) estimates.
    pub k: usize,
}

/// Forest-plot data for one symptom category, handed to the external
/// renderer as a serialized artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ForestPlotData {
    pub title: String,
    pub x_label: String,
    /// Null-effect reference line.
    pub reference_value: f64,
    pub entries: Vec<ForestPlotEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ForestPlotSummary>,
}

/// A single per-(outcome, cohort) study line of a forest plot.
#[derive(Debug, Clone, Serialize)]
pub struct ForestPlotEntry {
    pub label: String,
    pub cohort: String,
    pub estimate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Normalized random-effects weight in the overall pool.
    pub weight: f64,
}

/// The pooled summary row of a forest plot.
#[derive(Debug, Clone, Serialize)]
pub struct ForestPlotSummary {
    pub label: String,
    pub estimate: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub tau_squared: f64,
}

/// A polarity-normalized estimate ready for pooling.
#[derive(Debug, Clone)]
struct Observation {
    mean: f64,
    /// Effective spread: SEM scaled by sqrt(n).
    sd: f64,
    n: usize,
    ci_low: f64,
    ci_high: f64,
    cohort: String,
    outcome_label: String,
}

#[derive(Debug, Clone)]
struct Pooled {
    mean: f64,
    ci_low: f64,
    ci_high: f64,
    p_value: f64,
    tau_squared: f64,
    weights: Vec<f64>,
}

/// DerSimonian-Laird random-effects pooling of (mean, sd, n) observations.
fn dersimonian_laird(observations: &[Observation]) -> Option<Pooled> {
    if observations.is_empty() {
        return None;
    }
    let standard_errors: Vec<f64> = observations
        .iter()
        .map(|o| (o.sd / (o.n as f64).sqrt()).max(1e-12))
        .collect();

    let fixed_weights: Vec<f64> = standard_errors.iter().map(|se| 1.0 / (se * se)).collect();
    let weight_sum: f64 = fixed_weights.iter().sum();
    let fixed_mean: f64 = observations
        .iter()
        .zip(fixed_weights.iter())
        .map(|(o, w)| w * o.mean)
        .sum::<f64>()
        / weight_sum;

    let k = observations.len();
    let tau_squared = if k < 2 {
        0.0
    } else {
        let q: f64 = observations
            .iter()
            .zip(fixed_weights.iter())
            .map(|(o, w)| w * (o.mean - fixed_mean) * (o.mean - fixed_mean))
            .sum();
        let weight_square_sum: f64 = fixed_weights.iter().map(|w| w * w).sum();
        let denominator = weight_sum - weight_square_sum / weight_sum;
        if denominator > 0.0 {
            ((q - (k as f64 - 1.0)) / denominator).max(0.0)
        } else {
            0.0
        }
    };

    let random_weights: Vec<f64> = standard_errors
        .iter()
        .map(|se| 1.0 / (se * se + tau_squared))
        .collect();
    let random_weight_sum: f64 = random_weights.iter().sum();
    let mean: f64 = observations
        .iter()
        .zip(random_weights.iter())
        .map(|(o, w)| w * o.mean)
        .sum::<f64>()
        / random_weight_sum;
    let standard_error = (1.0 / random_weight_sum).sqrt();
    let p_value = stats::two_sided_p(mean / standard_error);

    Some(Pooled {
        mean,
        ci_low: mean - Z_95 * standard_error,
        ci_high: mean + Z_95 * standard_error,
        p_value,
        tau_squared,
        weights: random_weights
            .iter()
            .map(|w| w / random_weight_sum)
            .collect(),
    })
}

/// Negates inverted outcomes so every coefficient points the same way.
fn normalize(result: &CorrelationResult, invert: bool, outcome_label: &str) -> Observation {
    let (mean, ci_low, ci_high) = if invert {
        (-result.coefficient, -result.ci_high, -result.ci_low)
    } else {
        (result.coefficient, result.ci_low, result.ci_high)
    };
    Observation {
        mean,
        sd: result.sem * (result.n as f64).sqrt(),
        n: result.n,
        ci_low,
        ci_high,
        cohort: result.cohort.clone(),
        outcome_label: outcome_label.to_string(),
    }
}

/// Confidence bounds consistent with the adjusted p-value: the interval
/// half-width is recomputed through the inverse normal. An adjusted
/// p-value at (or numerically indistinguishable from) one yields an
/// unbounded interval.
fn adjusted_interval(mean: f64, p_adjusted: f64) -> (f64, f64) {
    let z = stats::normal_quantile(1.0 - (p_adjusted / 2.0).min(0.5 - 1e-16));
    if z <= 1e-12 {
        return (f64::NEG_INFINITY, f64::INFINITY);
    }
    let half_width = Z_95 * mean.abs() / z;
    (mean - half_width, mean + half_width)
}

/// Pools every correlation estimate into per-category summaries and builds
/// the per-category forest-plot data. Outcomes missing from the registry
/// are ignored.
pub fn pool(
    results: &[CorrelationResult],
    registry: &OutcomeRegistry,
) -> (Vec<MetaResult>, Vec<ForestPlotData>) {
    // Category -> polarity-normalized observations, in deterministic order.
    let mut by_category: BTreeMap<String, Vec<Observation>> = BTreeMap::new();
    for result in results {
        let Some(spec) = registry.get(&result.outcome) else {
            log::warn!(
                "correlation result for unregistered outcome '{}' is left out of pooling",
                result.outcome
            );
            continue;
        };
        by_category
            .entry(spec.category.clone())
            .or_default()
            .push(normalize(result, spec.invert, &spec.label));
    }

    let mut meta_results = Vec::new();
    let mut forest = Vec::new();
    for (category, observations) in &by_category {
        let Some(pooled) = dersimonian_laird(observations) else {
            continue;
        };

        meta_results.push(MetaResult {
            category: category.clone(),
            group: OVERALL_GROUP.to_string(),
            mean: pooled.mean,
            ci_low: pooled.ci_low,
            ci_high: pooled.ci_high,
            p_value: pooled.p_value,
            p_adjusted: pooled.p_value,
            ci_low_adjusted: f64::NAN,
            ci_high_adjusted: f64::NAN,
            label: "All cohorts".to_string(),
            tau_squared: pooled.tau_squared,
            k: observations.len(),
        });

        let cohorts: Vec<String> = observations
            .iter()
            .map(|o| o.cohort.clone())
            .unique()
            .sorted()
            .collect();
        for cohort in &cohorts {
            let subgroup: Vec<Observation> = observations
                .iter()
                .filter(|o| &o.cohort == cohort)
                .cloned()
                .collect();
            let Some(sub_pooled) = dersimonian_laird(&subgroup) else {
                continue;
            };
            meta_results.push(MetaResult {
                category: category.clone(),
                group: cohort.clone(),
                mean: sub_pooled.mean,
                ci_low: sub_pooled.ci_low,
                ci_high: sub_pooled.ci_high,
                p_value: sub_pooled.p_value,
                p_adjusted: sub_pooled.p_value,
                ci_low_adjusted: f64::NAN,
                ci_high_adjusted: f64::NAN,
                label: cohort.clone(),
                tau_squared: sub_pooled.tau_squared,
                k: subgroup.len(),
            });
        }

        forest.push(ForestPlotData {
            title: category.clone(),
            x_label: "Correlation with diagnostic delay".to_string(),
            reference_value: 0.0,
            entries: observations
                .iter()
                .zip(pooled.weights.iter())
                .map(|(o, &weight)| ForestPlotEntry {
                    label: o.outcome_label.clone(),
                    cohort: o.cohort.clone(),
                    estimate: o.mean,
                    ci_lower: o.ci_low,
                    ci_upper: o.ci_high,
                    weight,
                })
                .collect(),
            summary: Some(ForestPlotSummary {
                label: "All cohorts".to_string(),
                estimate: pooled.mean,
                ci_lower: pooled.ci_low,
                ci_upper: pooled.ci_high,
                tau_squared: pooled.tau_squared,
            }),
        });
    }

    // Multiple-testing correction runs independently within the overall
    // group and within each cohort subgroup, never pooled together.
    let groups: Vec<String> = meta_results
        .iter()
        .map(|r| r.group.clone())
        .unique()
        .collect();
    for group in groups {
        let indices: Vec<usize> = meta_results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.group == group)
            .map(|(i, _)| i)
            .collect();
        let p_values: Vec<f64> = indices.iter().map(|&i| meta_results[i].p_value).collect();
        let adjusted = stats::bh_adjust(&p_values);
        for (&index, p_adjusted) in indices.iter().zip(adjusted) {
            let result = &mut meta_results[index];
            result.p_adjusted = p_adjusted;
            let (low, high) = adjusted_interval(result.mean, p_adjusted);
            result.ci_low_adjusted = low;
            result.ci_high_adjusted = high;
        }
    }

    (meta_results, forest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OutcomeSpec, RegressionKind};
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn registry() -> OutcomeRegistry {
        let spec = |id: &str, category: &str, invert: bool| OutcomeSpec {
            id: id.to_string(),
            kind: RegressionKind::Linear,
            invert,
            min_value: 0.0,
            category: category.to_string(),
            label: id.to_uppercase(),
        };
        OutcomeRegistry::from_specs(vec![
            spec("gait", "motor", false),
            spec("grip", "motor", true),
            spec("mood", "psychiatric", false),
        ])
        .unwrap()
    }

    fn result(outcome: &str, cohort: &str, coefficient: f64, sem: f64, n: usize) -> CorrelationResult {
        CorrelationResult {
            outcome: outcome.to_string(),
            cohort: cohort.to_string(),
            kind: RegressionKind::Linear,
            coefficient,
            p_value: 0.05,
            ci_low: coefficient - Z_95 * sem,
            ci_high: coefficient + Z_95 * sem,
            n,
            p_adjusted: 0.05,
            sem,
        }
    }

    #[test]
    fn single_study_pool_returns_the_study_estimate() {
        let results = vec![result("gait", "berlin", 0.42, 0.1, 50)];
        let (meta, forest) = pool(&results, &registry());

        // One overall row and one cohort row for the single category.
        assert_eq!(meta.len(), 2);
        let overall = meta.iter().find(|r| r.group == OVERALL_GROUP).unwrap();
        assert_relative_eq!(overall.mean, 0.42, max_relative = 1e-6);
        let berlin = meta.iter().find(|r| r.group == "berlin").unwrap();
        assert_relative_eq!(berlin.mean, 0.42, max_relative = 1e-6);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].entries.len(), 1);
        assert_abs_diff_eq!(forest[0].entries[0].weight, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn polarity_negation_flips_the_pooled_mean_only() {
        let results = vec![
            result("gait", "berlin", 0.4, 0.1, 50),
            result("gait", "oslo", 0.2, 0.15, 40),
        ];
        let mut negated = results.clone();
        for r in &mut negated {
            r.coefficient = -r.coefficient;
            let (low, high) = (r.ci_low, r.ci_high);
            r.ci_low = -high;
            r.ci_high = -low;
        }

        let (meta_a, _) = pool(&results, &registry());
        let (meta_b, _) = pool(&negated, &registry());
        let overall_a = meta_a.iter().find(|r| r.group == OVERALL_GROUP).unwrap();
        let overall_b = meta_b.iter().find(|r| r.group == OVERALL_GROUP).unwrap();

        assert_abs_diff_eq!(overall_a.mean, -overall_b.mean, epsilon = 1e-12);
        assert_abs_diff_eq!(
            overall_a.ci_high - overall_a.ci_low,
            overall_b.ci_high - overall_b.ci_low,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(overall_a.p_value, overall_b.p_value, epsilon = 1e-12);
    }

    #[test]
    fn inverted_outcomes_are_negated_before_pooling() {
        // grip has invert = true; its raw coefficient points the other way.
        let results = vec![result("grip", "berlin", -0.3, 0.1, 50)];
        let (meta, _) = pool(&results, &registry());
        let overall = meta.iter().find(|r| r.group == OVERALL_GROUP).unwrap();
        assert!(overall.mean > 0.0, "inverted estimate should flip sign");
        assert_relative_eq!(overall.mean, 0.3, max_relative = 1e-9);
    }

    #[test]
    fn pooling_respects_category_boundaries_and_groups() {
        let results = vec![
            result("gait", "berlin", 0.4, 0.1, 50),
            result("gait", "oslo", 0.3, 0.1, 50),
            result("mood", "berlin", 0.1, 0.1, 50),
        ];
        let (meta, forest) = pool(&results, &registry());

        // motor: overall + berlin + oslo; psychiatric: overall + berlin.
        assert_eq!(meta.len(), 5);
        assert_eq!(forest.len(), 2);

        let motor_overall = meta
            .iter()
            .find(|r| r.category == "motor" && r.group == OVERALL_GROUP)
            .unwrap();
        assert_eq!(motor_overall.k, 2);
        assert!(motor_overall.mean > 0.3 && motor_overall.mean < 0.4);

        // Adjusted values are filled for every row and dominate the raw p.
        for row in &meta {
            assert!(row.p_adjusted >= row.p_value);
            assert!(row.ci_low_adjusted <= row.mean && row.mean <= row.ci_high_adjusted);
        }
    }

    #[test]
    fn heterogeneous_studies_inflate_tau_squared() {
        let results = vec![
            result("gait", "berlin", 0.8, 0.02, 200),
            result("gait", "oslo", -0.6, 0.02, 200),
        ];
        let (meta, _) = pool(&results, &registry());
        let overall = meta.iter().find(|r| r.group == OVERALL_GROUP).unwrap();
        assert!(overall.tau_squared > 0.1, "tau2 {}", overall.tau_squared);
    }
}
