//! End-to-end checks over the public API: tables written as TSV files,
//! loaded through the data boundary, and driven through the full
//! validation / correlation / meta-analysis pipeline.

use delaymap::config::AnalysisConfig;
use delaymap::data::{self, LongitudinalRecord};
use delaymap::fit::{self, FitSettings, ModelParams};
use delaymap::pipeline::{self, CohortInput, SkipReason};
use delaymap::predict;
use delaymap::registry::{OutcomeRegistry, OutcomeSpec, RegressionKind};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use std::fmt::Write as _;
use std::fs;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Writes one cohort's visit and baseline tables. Patients couple their
/// severity at disease-time zero to the diagnostic-delay measure, for all
/// three outcome kinds.
fn write_cohort_tables(
    dir: &std::path::Path,
    cohort: &str,
    patients: usize,
    seed: u64,
) -> (std::path::PathBuf, std::path::PathBuf) {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.2).unwrap();

    let mut visits = String::from("patient_id\tdisease_time\tseverity\tability\tfalls\tstage\n");
    let mut baseline = String::from("patient_id\tdiagnostic_delay\tage\n");
    for patient in 0..patients {
        let id = format!("{cohort}-p{patient:03}");
        let delay = rng.gen_range(0.5..6.0);
        let age = rng.gen_range(35.0..80.0);
        writeln!(baseline, "{id}\t{delay:.4}\t{age:.1}").unwrap();

        for visit in 0..4 {
            let t = -1.5 + visit as f64 * 1.2 + rng.gen_range(-0.05..0.05);
            // Continuous severity grows with delay and disease time.
            let severity = 2.0 * delay + 1.5 * t + noise.sample(&mut rng);
            // Ability is the inverted mirror: low raw value = high impairment.
            let ability = 30.0 - severity;
            // Falls: a binary event whose odds track delay and time.
            let fall_p = sigmoid(1.5 * (delay - 3.25) + 0.5 * t);
            let falls = if rng.gen_range(0.0..1.0) < fall_p { 1 } else { 0 };
            // Stage: three ordered categories from a latent score.
            let uniform: f64 = rng.gen_range(1e-9..1.0 - 1e-9);
            let latent = 1.2 * (delay - 3.25) + 0.8 * t + (uniform / (1.0 - uniform)).ln();
            let stage = [-1.0, 1.0].iter().filter(|&&cut| latent > cut).count();
            writeln!(
                visits,
                "{id}\t{t:.4}\t{severity:.4}\t{ability:.4}\t{falls}\t{stage}"
            )
            .unwrap();
        }
    }

    let visits_path = dir.join(format!("visits_{cohort}.tsv"));
    let baseline_path = dir.join(format!("baseline_{cohort}.tsv"));
    fs::write(&visits_path, visits).unwrap();
    fs::write(&baseline_path, baseline).unwrap();
    (visits_path, baseline_path)
}

fn write_registry(dir: &std::path::Path) -> std::path::PathBuf {
    let content = "outcome\tkind\tinvert\tmin_value\tcategory\tlabel\n\
                   severity\tlinear\t0\t0.0\tmotor\tSeverity score\n\
                   ability\tlinear\t1\t30.0\tmotor\tAbility score\n\
                   falls\tbinary\t0\t0.0\tmotor\tFalls\n\
                   stage\tordinal\t0\t0.0\tstaging\tDisease stage\n\
                   phantom\tlinear\t0\t0.0\tmotor\tNever collected\n";
    let path = dir.join("outcomes.tsv");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn full_pipeline_over_two_cohorts() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = write_registry(dir.path());
    let registry = OutcomeRegistry::load(&registry_path).unwrap();
    assert_eq!(registry.len(), 5);

    let mut cohorts = Vec::new();
    for (index, name) in ["berlin", "oslo"].iter().enumerate() {
        let (visits_path, baseline_path) =
            write_cohort_tables(dir.path(), name, 40, 100 + index as u64);
        let visits = data::load_visit_table(&visits_path, name).unwrap();
        let baseline = data::load_baseline_table(&baseline_path, name).unwrap();
        cohorts.push(CohortInput {
            name: name.to_string(),
            visits,
            baseline,
        });
    }

    let out_dir = dir.path().join("results");
    fs::create_dir_all(&out_dir).unwrap();
    let output = pipeline::run(
        &registry,
        &cohorts,
        &AnalysisConfig::default(),
        &FitSettings::default(),
        true,
        Some(&out_dir),
    )
    .unwrap();

    // The registered-but-never-collected outcome lands in the skip log for
    // both cohorts and both stages without disturbing anything else.
    let phantom_skips: Vec<_> = output
        .skipped
        .iter()
        .filter(|s| s.outcome == "phantom")
        .collect();
    assert_eq!(phantom_skips.len(), 4);
    assert!(
        phantom_skips
            .iter()
            .all(|s| s.reason == SkipReason::MissingOutcome)
    );

    for report in &output.cohorts {
        let severity = report
            .correlations
            .iter()
            .find(|r| r.outcome == "severity")
            .expect("severity must correlate");
        assert!(
            severity.coefficient > 0.7,
            "severity correlation {} in {}",
            severity.coefficient,
            report.cohort
        );
        assert!(severity.p_adjusted >= severity.p_value);
        assert!(severity.sem.is_finite() && severity.sem > 0.0);

        let ability = report
            .correlations
            .iter()
            .find(|r| r.outcome == "ability")
            .expect("ability must correlate");
        assert!(
            ability.coefficient < -0.7,
            "inverted outcome correlates negatively before normalization"
        );

        let falls = report
            .correlations
            .iter()
            .find(|r| r.outcome == "falls")
            .expect("falls must correlate");
        assert!(falls.coefficient > 0.0);
        assert_eq!(falls.kind, RegressionKind::Binary);

        let stage = report
            .correlations
            .iter()
            .find(|r| r.outcome == "stage")
            .expect("stage must correlate");
        assert!(stage.coefficient > 0.0);
        assert_eq!(stage.kind, RegressionKind::Ordinal);

        // The validation stage produced rows for the collected outcomes.
        assert!(!report.validation.is_empty());
        let severity_row = report
            .validation
            .iter()
            .find(|row| row.outcome == "severity")
            .expect("severity must validate");
        assert!(severity_row.improvement > 0.0);
    }

    // Meta-analysis: polarity normalization makes both motor linear
    // outcomes contribute positively; the pooled motor effect is positive.
    let motor_overall = output
        .meta
        .iter()
        .find(|r| r.category == "motor" && r.group == "overall")
        .expect("motor overall row");
    assert!(motor_overall.mean > 0.0);
    assert!(motor_overall.k >= 4, "k = {}", motor_overall.k);
    assert!(motor_overall.p_adjusted >= motor_overall.p_value);

    // Per-cohort subgroups exist for both cohorts and categories.
    for group in ["berlin", "oslo"] {
        assert!(
            output
                .meta
                .iter()
                .any(|r| r.group == group && r.category == "motor")
        );
    }

    // Output artifacts: per-cohort tables, final table, forest data.
    assert!(out_dir.join("validation_berlin.tsv").exists());
    assert!(out_dir.join("correlation_berlin.tsv").exists());
    assert!(out_dir.join("validation_oslo.tsv").exists());
    assert!(out_dir.join("correlation_oslo.tsv").exists());
    assert!(out_dir.join("meta_analysis.tsv").exists());
    assert!(out_dir.join("forest_motor.toml").exists());
    assert!(out_dir.join("forest_staging.toml").exists());

    let forest_text = fs::read_to_string(out_dir.join("forest_motor.toml")).unwrap();
    assert!(forest_text.contains("Severity score"));
    assert!(forest_text.contains("[summary]"));

    let correlation_text = fs::read_to_string(out_dir.join("correlation_berlin.tsv")).unwrap();
    let lines: Vec<&str> = correlation_text.lines().collect();
    assert_eq!(lines[0], "outcome\tkind\tcoef\tp_value\tci_low\tci_high\tn\tp_adjusted\tcoef_sem");
    // Four collected outcomes, no partial row for the phantom.
    assert_eq!(lines.len(), 5);
}

#[test]
fn linear_fit_predicts_the_known_value_at_time_zero() {
    // value = 2 * time + 5 + noise(sd 0.1), >= 30 qualifying rows.
    let mut rng = StdRng::seed_from_u64(4711);
    let noise = Normal::new(0.0, 0.1).unwrap();
    let mut records = Vec::new();
    for patient in 0..15 {
        for visit in 0..2 {
            let t = -2.0 + visit as f64 * 1.5 + rng.gen_range(-0.3..0.3);
            records.push(LongitudinalRecord {
                patient_id: format!("p{patient:02}"),
                disease_time: t,
                value: 2.0 * t + 5.0 + noise.sample(&mut rng),
                cohort: "synthetic".to_string(),
            });
        }
    }
    assert_eq!(records.len(), 30);

    let spec = OutcomeSpec {
        id: "score".to_string(),
        kind: RegressionKind::Linear,
        invert: false,
        min_value: -100.0,
        category: "motor".to_string(),
        label: "Score".to_string(),
    };
    let model = fit::fit(RegressionKind::Linear, &records, &FitSettings::default()).unwrap();
    let predictions = predict::predict_all_patients(&model, &spec, 0.0);
    assert_eq!(predictions.len(), 15);
    for prediction in predictions {
        assert!(
            (prediction.value - 5.0).abs() < 0.5,
            "prediction {} for {} strayed from 5.0",
            prediction.value,
            prediction.patient_id
        );
    }
}

#[test]
fn ordinal_predictions_follow_the_known_cut_points() {
    // Three ordered categories generated from latent = time + logistic
    // noise with true cut points at -0.5 and 0.5.
    let mut rng = StdRng::seed_from_u64(99);
    let true_cuts = [-0.5, 0.5];
    let mut records = Vec::new();
    for patient in 0..40 {
        for visit in 0..4 {
            let t = -1.5 + visit as f64 + rng.gen_range(-0.2..0.2);
            let uniform: f64 = rng.gen_range(1e-9..1.0 - 1e-9);
            let latent = t + (uniform / (1.0 - uniform)).ln();
            let category = true_cuts.iter().filter(|&&cut| latent > cut).count();
            records.push(LongitudinalRecord {
                patient_id: format!("p{patient:03}"),
                disease_time: t,
                value: category as f64,
                cohort: "synthetic".to_string(),
            });
        }
    }

    let spec = OutcomeSpec {
        id: "stage".to_string(),
        kind: RegressionKind::Ordinal,
        invert: false,
        min_value: 0.0,
        category: "staging".to_string(),
        label: "Stage".to_string(),
    };
    let model = fit::fit(RegressionKind::Ordinal, &records, &FitSettings::default()).unwrap();
    let ModelParams::Ordinal { cut_points, .. } = &model.params else {
        panic!("expected an ordinal fit");
    };
    assert!(cut_points[0] < cut_points[1]);

    // A patient unknown to the model gets fixed-effect-only predictions:
    // the latent score at held-out evaluation times lands in the category
    // the true cut points dictate.
    let targets: Vec<(String, f64)> = [-3.0, 0.0, 3.0]
        .iter()
        .map(|&t| ("held-out".to_string(), t))
        .collect();
    let predictions = predict::predict_at(&model, &spec, &targets);
    assert_eq!(predictions[0].value, 0.0);
    assert_eq!(predictions[1].value, 1.0);
    assert_eq!(predictions[2].value, 2.0);
}
