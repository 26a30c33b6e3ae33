//! Evaluates a fitted model at chosen disease times, most importantly at
//! the canonical reference time zero. Predicted values are clipped to the
//! outcome's theoretical scale bound in the direction implied by `invert`:
//! when a low raw value means high impairment the bound is a ceiling,
//! otherwise it is a floor.

use crate::fit::{FittedModel, ModelParams, PatientEffects};
use crate::registry::OutcomeSpec;

/// One predicted value for one patient at one evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub patient_id: String,
    pub outcome: String,
    pub time: f64,
    pub value: f64,
}

/// Predicts at the given (patient, time) pairs. Patients unknown to the
/// model fall back to a fixed-effect-only prediction; their random effects
/// are treated as zero.
pub fn predict_at(
    model: &FittedModel,
    spec: &OutcomeSpec,
    targets: &[(String, f64)],
) -> Vec<Prediction> {
    targets
        .iter()
        .map(|(patient_id, time)| {
            let effects = model
                .effects
                .get(patient_id)
                .copied()
                .unwrap_or_default();
            Prediction {
                patient_id: patient_id.clone(),
                outcome: spec.id.clone(),
                time: *time,
                value: evaluate(model, spec, effects, *time),
            }
        })
        .collect()
}

/// Predicts at one evaluation time for every patient known to the model,
/// in patient-identifier order.
pub fn predict_all_patients(model: &FittedModel, spec: &OutcomeSpec, time: f64) -> Vec<Prediction> {
    let targets: Vec<(String, f64)> = model
        .patients()
        .map(|patient| (patient.to_string(), time))
        .collect();
    predict_at(model, spec, &targets)
}

fn evaluate(model: &FittedModel, spec: &OutcomeSpec, effects: PatientEffects, time: f64) -> f64 {
    match &model.params {
        ModelParams::Linear { intercept, slope } => {
            let value = intercept + slope * time + effects.intercept + effects.slope * time;
            clip_to_bound(value, spec)
        }
        ModelParams::Binary { intercept, slope } => {
            let eta = intercept + slope * time + effects.intercept + effects.slope * time;
            let probability = 1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp());
            if probability >= 0.5 { 1.0 } else { 0.0 }
        }
        ModelParams::Ordinal {
            slope,
            cut_points,
            levels,
        } => {
            // The cumulative-link model has no fixed intercept; the latent
            // score is the slope contribution plus the patient's random
            // effects.
            let latent = slope * time + effects.intercept + effects.slope * time;
            let passed = cut_points.iter().take_while(|&&cut| latent > cut).count();
            levels[passed.min(levels.len() - 1)]
        }
    }
}

fn clip_to_bound(value: f64, spec: &OutcomeSpec) -> f64 {
    if spec.invert {
        // The bound is the ceiling of "least impaired".
        value.min(spec.min_value)
    } else {
        // The bound is the floor of "no symptom".
        value.max(spec.min_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::{RandomStructure, VarianceComponents};
    use crate::registry::RegressionKind;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use std::collections::BTreeMap;

    fn spec(kind: RegressionKind, invert: bool, min_value: f64) -> OutcomeSpec {
        OutcomeSpec {
            id: "score".to_string(),
            kind,
            invert,
            min_value,
            category: "motor".to_string(),
            label: "Score".to_string(),
        }
    }

    fn model(params: ModelParams, effects: BTreeMap<String, PatientEffects>) -> FittedModel {
        FittedModel {
            params,
            structure: RandomStructure::InterceptSlope,
            fell_back: false,
            effects,
            variance: VarianceComponents {
                residual: 1.0,
                intercept: 1.0,
                slope: 0.1,
            },
        }
    }

    fn one_patient(intercept: f64, slope: f64) -> BTreeMap<String, PatientEffects> {
        let mut effects = BTreeMap::new();
        effects.insert("p1".to_string(), PatientEffects { intercept, slope });
        effects
    }

    #[test]
    fn linear_prediction_combines_fixed_and_random_effects() {
        let model = model(
            ModelParams::Linear {
                intercept: 5.0,
                slope: 2.0,
            },
            one_patient(1.0, -0.5),
        );
        let spec = spec(RegressionKind::Linear, false, 0.0);
        let predictions = predict_at(&model, &spec, &[("p1".to_string(), 2.0)]);
        // 5 + 2*2 + 1 - 0.5*2 = 9
        assert_eq!(predictions[0].value, 9.0);
    }

    #[test]
    fn unknown_patients_use_fixed_effects_only() {
        let model = model(
            ModelParams::Linear {
                intercept: 5.0,
                slope: 2.0,
            },
            one_patient(100.0, 100.0),
        );
        let spec = spec(RegressionKind::Linear, false, 0.0);
        let predictions = predict_at(&model, &spec, &[("stranger".to_string(), 1.0)]);
        assert_eq!(predictions[0].value, 7.0);
    }

    #[test]
    fn clipping_respects_invert_for_generated_inputs() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let intercept = rng.gen_range(-50.0..50.0);
            let slope = rng.gen_range(-10.0..10.0);
            let u0 = rng.gen_range(-20.0..20.0);
            let time = rng.gen_range(-5.0..5.0);
            let bound = rng.gen_range(-10.0..10.0);

            let model = model(
                ModelParams::Linear { intercept, slope },
                one_patient(u0, 0.0),
            );
            let floor_spec = spec(RegressionKind::Linear, false, bound);
            let ceiling_spec = spec(RegressionKind::Linear, true, bound);

            let floored = predict_at(&model, &floor_spec, &[("p1".to_string(), time)]);
            assert!(floored[0].value >= bound);
            let capped = predict_at(&model, &ceiling_spec, &[("p1".to_string(), time)]);
            assert!(capped[0].value <= bound);
        }
    }

    #[test]
    fn binary_prediction_rounds_the_probability() {
        let model = model(
            ModelParams::Binary {
                intercept: 0.0,
                slope: 1.0,
            },
            one_patient(0.0, 0.0),
        );
        let spec = spec(RegressionKind::Binary, false, 0.0);
        let low = predict_at(&model, &spec, &[("p1".to_string(), -3.0)]);
        assert_eq!(low[0].value, 0.0);
        let high = predict_at(&model, &spec, &[("p1".to_string(), 3.0)]);
        assert_eq!(high[0].value, 1.0);
    }

    #[test]
    fn ordinal_prediction_walks_the_cut_points() {
        let model = model(
            ModelParams::Ordinal {
                slope: 1.0,
                cut_points: vec![-0.5, 0.5],
                levels: vec![0.0, 2.0, 4.0],
            },
            one_patient(0.0, 0.0),
        );
        let spec = spec(RegressionKind::Ordinal, false, 0.0);
        let targets: Vec<(String, f64)> = [-2.0, 0.0, 2.0]
            .iter()
            .map(|&t| ("p1".to_string(), t))
            .collect();
        let predictions = predict_at(&model, &spec, &targets);
        // Latent scores -2, 0, 2 against cut points (-0.5, 0.5).
        assert_eq!(predictions[0].value, 0.0);
        assert_eq!(predictions[1].value, 2.0);
        assert_eq!(predictions[2].value, 4.0);
    }

    #[test]
    fn ordinal_score_below_every_cut_point_takes_the_lowest_level() {
        let model = model(
            ModelParams::Ordinal {
                slope: 0.0,
                cut_points: vec![1.0, 2.0],
                levels: vec![1.0, 3.0, 5.0],
            },
            one_patient(-10.0, 0.0),
        );
        let spec = spec(RegressionKind::Ordinal, false, 0.0);
        let predictions = predict_at(&model, &spec, &[("p1".to_string(), 0.0)]);
        assert_eq!(predictions[0].value, 1.0);
    }

    #[test]
    fn predict_all_patients_is_ordered_and_complete() {
        let mut effects = BTreeMap::new();
        effects.insert("b".to_string(), PatientEffects::default());
        effects.insert("a".to_string(), PatientEffects::default());
        let model = model(
            ModelParams::Linear {
                intercept: 1.0,
                slope: 0.0,
            },
            effects,
        );
        let spec = spec(RegressionKind::Linear, false, 0.0);
        let predictions = predict_all_patients(&model, &spec, 0.0);
        let patients: Vec<&str> = predictions.iter().map(|p| p.patient_id.as_str()).collect();
        assert_eq!(patients, vec!["a", "b"]);
    }
}
