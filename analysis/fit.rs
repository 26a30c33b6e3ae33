//! # Longitudinal Model Fitting
//!
//! Fits one mixed-effects regression per (outcome, cohort) pair, dispatching
//! on the outcome's [`RegressionKind`]:
//!
//! - **Linear**: outcome on disease time with per-patient random intercept
//!   and slope. Estimated by iterating generalized least squares over
//!   per-patient covariance blocks `V_i = sigma^2 I + Z_i G Z_i'` with damped
//!   moment updates of the variance components.
//! - **Binary**: mixed logistic regression, estimated by alternating
//!   per-patient Newton steps for the random-effect conditional modes with a
//!   BFGS pass over the fixed effects.
//! - **Ordinal**: mixed cumulative-logit (proportional odds) model with
//!   ordered cut-points and no fixed intercept, using the same alternating
//!   scheme; cut-points are optimized as (first, log-gaps) so they stay
//!   ordered without constraints.
//!
//! The fallback ladder is explicit: a failed intercept+slope fit retries
//! with a random intercept only (linear and ordinal); a linear fit whose
//! random-intercept estimates are degenerate (every patient sharing the
//! identical intercept) also retries with the simpler structure. Binary
//! fits never fall back. A failure after the ladder is returned to the
//! caller, never swallowed.
//!
//! Input contract: records are already filtered to patients with at least
//! two distinct disease-time observations and carry no missing values.

use crate::data::LongitudinalRecord;
use crate::registry::RegressionKind;
use nalgebra::{DMatrix, DVector};
use ndarray::Array1;
use std::collections::BTreeMap;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

#[derive(Error, Debug)]
pub enum FitError {
    #[error("no patient with at least two distinct disease-time observations")]
    NoQualifyingPatients,
    #[error("binary outcome contains values other than 0 and 1")]
    NonBinaryValues,
    #[error("outcome has a single observed level; no model can be fitted")]
    ConstantOutcome,
    #[error("a linear system solve failed; the block covariance may be singular")]
    LinearSystemSolveFailed,
    #[error("model did not converge within {max_iterations} iterations (last change {last_change:.3e})")]
    DidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },
    #[error("fixed-effect optimization failed: {0}")]
    OptimizationFailed(String),
}

/// Random-effect structure actually used by a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomStructure {
    InterceptSlope,
    InterceptOnly,
}

impl RandomStructure {
    fn dim(self) -> usize {
        match self {
            RandomStructure::InterceptSlope => 2,
            RandomStructure::InterceptOnly => 1,
        }
    }
}

/// Per-patient deviations from the population fixed effects. `slope` is
/// zero under an intercept-only structure.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PatientEffects {
    pub intercept: f64,
    pub slope: f64,
}

/// Estimated variance components. `slope` is zero under an intercept-only
/// structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VarianceComponents {
    pub residual: f64,
    pub intercept: f64,
    pub slope: f64,
}

/// Fixed-effect parameters of the fitted family.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelParams {
    Linear {
        intercept: f64,
        slope: f64,
    },
    Binary {
        intercept: f64,
        slope: f64,
    },
    /// The cumulative-link model has no fixed intercept; the ordered
    /// cut-points absorb it. `levels` are the sorted distinct raw values
    /// the categories map back to.
    Ordinal {
        slope: f64,
        cut_points: Vec<f64>,
        levels: Vec<f64>,
    },
}

/// A fitted model for one (outcome, cohort) pair, owned transiently by the
/// pipeline.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub params: ModelParams,
    pub structure: RandomStructure,
    /// True when the fit retreated to the simpler random-effect structure,
    /// either after a fit failure or after a degenerate random-intercept
    /// distribution.
    pub fell_back: bool,
    pub effects: BTreeMap<String, PatientEffects>,
    pub variance: VarianceComponents,
}

impl FittedModel {
    pub fn kind(&self) -> RegressionKind {
        match self.params {
            ModelParams::Linear { .. } => RegressionKind::Linear,
            ModelParams::Binary { .. } => RegressionKind::Binary,
            ModelParams::Ordinal { .. } => RegressionKind::Ordinal,
        }
    }

    /// Patients known to the model, in identifier order.
    pub fn patients(&self) -> impl Iterator<Item = &str> {
        self.effects.keys().map(|k| k.as_str())
    }
}

/// Tuning knobs for the iterative fits. The defaults are deliberately
/// conservative; they are not exposed on the CLI.
#[derive(Debug, Clone)]
pub struct FitSettings {
    pub max_iterations: usize,
    pub inner_iterations: usize,
    pub tolerance: f64,
    pub variance_floor: f64,
    pub ridge: f64,
    pub damping: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            inner_iterations: 25,
            tolerance: 1e-6,
            variance_floor: 1e-8,
            ridge: 1e-8,
            damping: 0.5,
        }
    }
}

/// Fits the regression family selected by `kind` to one outcome's records.
pub fn fit(
    kind: RegressionKind,
    records: &[LongitudinalRecord],
    settings: &FitSettings,
) -> Result<FittedModel, FitError> {
    let series = split_by_patient(records);
    if series.is_empty() {
        return Err(FitError::NoQualifyingPatients);
    }
    match kind {
        RegressionKind::Linear => fit_linear(&series, settings),
        RegressionKind::Binary => fit_binary(&series, settings),
        RegressionKind::Ordinal => fit_ordinal(&series, settings),
    }
}

/// One patient's observations, time-ordered.
struct PatientSeries {
    id: String,
    times: Vec<f64>,
    values: Vec<f64>,
}

fn split_by_patient(records: &[LongitudinalRecord]) -> Vec<PatientSeries> {
    let mut grouped: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();
    for record in records {
        grouped
            .entry(record.patient_id.as_str())
            .or_default()
            .push((record.disease_time, record.value));
    }
    grouped
        .into_iter()
        .map(|(id, mut observations)| {
            observations.sort_by(|a, b| a.0.total_cmp(&b.0));
            PatientSeries {
                id: id.to_string(),
                times: observations.iter().map(|o| o.0).collect(),
                values: observations.iter().map(|o| o.1).collect(),
            }
        })
        .collect()
}

fn sigmoid(x: f64) -> f64 {
    let clamped = x.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-clamped).exp())
}

/// ln(1 + e^x) without overflow.
fn log1pexp(x: f64) -> f64 {
    if x > 30.0 { x } else { x.exp().ln_1p() }
}

/// Logistic density at `x`.
fn logistic_pdf(x: f64) -> f64 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

fn damped_variance_update(tau: &mut [f64], mean_squares: &[f64], settings: &FitSettings) {
    for (component, &target) in tau.iter_mut().zip(mean_squares.iter()) {
        let updated = settings.damping * target + (1.0 - settings.damping) * *component;
        *component = updated.max(settings.variance_floor);
    }
}

fn effects_map(
    series: &[PatientSeries],
    modes: &[Vec<f64>],
    structure: RandomStructure,
) -> BTreeMap<String, PatientEffects> {
    series
        .iter()
        .zip(modes.iter())
        .map(|(patient, u)| {
            let effects = PatientEffects {
                intercept: u[0],
                slope: if structure == RandomStructure::InterceptSlope {
                    u[1]
                } else {
                    0.0
                },
            };
            (patient.id.clone(), effects)
        })
        .collect()
}

fn components(tau: &[f64], residual: f64, structure: RandomStructure) -> VarianceComponents {
    VarianceComponents {
        residual,
        intercept: tau[0],
        slope: if structure == RandomStructure::InterceptSlope {
            tau[1]
        } else {
            0.0
        },
    }
}

// ---------------------------------------------------------------------------
// Linear mixed model
// ---------------------------------------------------------------------------

struct LinearFit {
    intercept: f64,
    slope: f64,
    modes: Vec<Vec<f64>>,
    tau: Vec<f64>,
    residual: f64,
}

fn fit_linear(series: &[PatientSeries], settings: &FitSettings) -> Result<FittedModel, FitError> {
    let first = fit_linear_with(series, RandomStructure::InterceptSlope, settings);
    let (fit, structure, fell_back) = match first {
        Ok(fit) if !degenerate_intercepts(series, &fit.modes) => {
            (fit, RandomStructure::InterceptSlope, false)
        }
        Ok(_) => {
            log::warn!(
                "random-intercept estimates are degenerate; refitting with a random intercept only"
            );
            let simple = fit_linear_with(series, RandomStructure::InterceptOnly, settings)?;
            (simple, RandomStructure::InterceptOnly, true)
        }
        Err(err) => {
            log::warn!("intercept+slope fit failed ({err}); retrying with a random intercept only");
            let simple = fit_linear_with(series, RandomStructure::InterceptOnly, settings)?;
            (simple, RandomStructure::InterceptOnly, true)
        }
    };
    Ok(FittedModel {
        params: ModelParams::Linear {
            intercept: fit.intercept,
            slope: fit.slope,
        },
        structure,
        fell_back,
        effects: effects_map(series, &fit.modes, structure),
        variance: components(&fit.tau, fit.residual, structure),
    })
}

/// The singular-fit signal: every patient ended up with the identical
/// random intercept.
fn degenerate_intercepts(series: &[PatientSeries], modes: &[Vec<f64>]) -> bool {
    if series.len() < 2 {
        return false;
    }
    let mut lowest = f64::INFINITY;
    let mut highest = f64::NEG_INFINITY;
    for u in modes {
        lowest = lowest.min(u[0]);
        highest = highest.max(u[0]);
    }
    (highest - lowest).abs() < 1e-10
}

fn fit_linear_with(
    series: &[PatientSeries],
    structure: RandomStructure,
    settings: &FitSettings,
) -> Result<LinearFit, FitError> {
    let q = structure.dim();
    let blocks: Vec<(DMatrix<f64>, DVector<f64>, DMatrix<f64>)> = series
        .iter()
        .map(|patient| {
            let n = patient.times.len();
            let x = DMatrix::from_fn(n, 2, |row, col| {
                if col == 0 { 1.0 } else { patient.times[row] }
            });
            let y = DVector::from_column_slice(&patient.values);
            let z = DMatrix::from_fn(n, q, |row, col| {
                if col == 0 { 1.0 } else { patient.times[row] }
            });
            (x, y, z)
        })
        .collect();

    let mut sigma2 = pooled_residual_variance(series, settings)?.max(settings.variance_floor);
    let mut tau = vec![(0.1 * sigma2).max(settings.variance_floor); q];

    let mut previous_loglik = f64::NEG_INFINITY;
    let mut last_change = f64::INFINITY;

    for _ in 0..settings.max_iterations {
        // GLS pass: accumulate the fixed-effect normal equations over
        // per-patient covariance blocks.
        let mut gram = DMatrix::<f64>::zeros(2, 2);
        let mut rhs = DVector::<f64>::zeros(2);
        let mut cholesky_factors = Vec::with_capacity(blocks.len());
        for (x, y, z) in &blocks {
            let n = y.len();
            let mut v = z * DMatrix::from_diagonal(&DVector::from_column_slice(&tau)) * z.transpose();
            for d in 0..n {
                v[(d, d)] += sigma2 + settings.ridge;
            }
            let factor = match v.clone().cholesky() {
                Some(factor) => factor,
                None => {
                    let mut ridged = v;
                    for d in 0..n {
                        ridged[(d, d)] += 0.01;
                    }
                    ridged
                        .cholesky()
                        .ok_or(FitError::LinearSystemSolveFailed)?
                }
            };
            let v_inv_x = factor.solve(x);
            let v_inv_y = factor.solve(y);
            gram += x.transpose() * &v_inv_x;
            rhs += x.transpose() * &v_inv_y;
            cholesky_factors.push(factor);
        }
        let gram_factor = match gram.clone().cholesky() {
            Some(factor) => factor,
            None => {
                let mut ridged = gram.clone();
                ridged[(0, 0)] += settings.ridge;
                ridged[(1, 1)] += settings.ridge;
                ridged
                    .cholesky()
                    .ok_or(FitError::LinearSystemSolveFailed)?
            }
        };
        let beta = gram_factor.solve(&rhs);

        // BLUPs, profile log-likelihood and moment targets.
        let mut loglik = 0.0;
        let mut conditional_sse = 0.0;
        let mut total_observations = 0usize;
        let mut mode_square_sums = vec![0.0; q];
        let mut modes = Vec::with_capacity(blocks.len());
        for ((x, y, z), factor) in blocks.iter().zip(cholesky_factors.iter()) {
            let residual = y - x * &beta;
            let v_inv_r = factor.solve(&residual);
            let g = DMatrix::from_diagonal(&DVector::from_column_slice(&tau));
            let u = &g * z.transpose() * &v_inv_r;

            let log_det = 2.0 * factor.l().diagonal().map(|d| d.ln()).sum();
            loglik += -0.5 * (log_det + residual.dot(&v_inv_r));

            let conditional = &residual - z * &u;
            conditional_sse += conditional.dot(&conditional);
            total_observations += y.len();
            for component in 0..q {
                mode_square_sums[component] += u[component] * u[component];
            }
            modes.push(u.iter().copied().collect::<Vec<f64>>());
        }
        // REML adjustment for the estimated fixed effects.
        loglik += -0.5 * 2.0 * gram_factor.l().diagonal().map(|d| d.ln()).sum();

        if !loglik.is_finite() {
            return Err(FitError::LinearSystemSolveFailed);
        }
        last_change = (loglik - previous_loglik).abs();
        if last_change < settings.tolerance {
            return Ok(LinearFit {
                intercept: beta[0],
                slope: beta[1],
                modes,
                tau,
                residual: sigma2,
            });
        }
        previous_loglik = loglik;

        let patients = series.len() as f64;
        let mean_squares: Vec<f64> = mode_square_sums.iter().map(|s| s / patients).collect();
        damped_variance_update(&mut tau, &mean_squares, settings);
        let sigma_target = conditional_sse / total_observations as f64;
        let mut sigma_slot = [sigma2];
        damped_variance_update(&mut sigma_slot, &[sigma_target], settings);
        sigma2 = sigma_slot[0];
    }

    Err(FitError::DidNotConverge {
        max_iterations: settings.max_iterations,
        last_change,
    })
}

/// Residual variance of a pooled ordinary least squares fit of value on
/// time; the starting point for the variance iteration.
fn pooled_residual_variance(
    series: &[PatientSeries],
    settings: &FitSettings,
) -> Result<f64, FitError> {
    let mut count = 0.0;
    let mut sum_t = 0.0;
    let mut sum_tt = 0.0;
    let mut sum_y = 0.0;
    let mut sum_ty = 0.0;
    for patient in series {
        for (&t, &y) in patient.times.iter().zip(patient.values.iter()) {
            count += 1.0;
            sum_t += t;
            sum_tt += t * t;
            sum_y += y;
            sum_ty += t * y;
        }
    }
    let mut determinant = count * sum_tt - sum_t * sum_t;
    if determinant.abs() < 1e-12 {
        sum_tt += settings.ridge.max(1e-6);
        determinant = count * sum_tt - sum_t * sum_t;
        if determinant.abs() < 1e-12 {
            return Err(FitError::LinearSystemSolveFailed);
        }
    }
    let slope = (count * sum_ty - sum_t * sum_y) / determinant;
    let intercept = (sum_y - slope * sum_t) / count;

    let mut rss = 0.0;
    for patient in series {
        for (&t, &y) in patient.times.iter().zip(patient.values.iter()) {
            let fitted = intercept + slope * t;
            rss += (y - fitted) * (y - fitted);
        }
    }
    let df = (count - 2.0).max(1.0);
    Ok(rss / df)
}

// ---------------------------------------------------------------------------
// Mixed logistic regression
// ---------------------------------------------------------------------------

fn fit_binary(series: &[PatientSeries], settings: &FitSettings) -> Result<FittedModel, FitError> {
    for patient in series {
        if patient.values.iter().any(|&v| v != 0.0 && v != 1.0) {
            return Err(FitError::NonBinaryValues);
        }
    }
    let structure = RandomStructure::InterceptSlope;
    let q = structure.dim();

    let total: f64 = series.iter().map(|p| p.values.len() as f64).sum();
    let positives: f64 = series.iter().map(|p| p.values.iter().sum::<f64>()).sum();
    let rate = (positives / total).clamp(1e-6, 1.0 - 1e-6);
    let mut beta = Array1::from_vec(vec![(rate / (1.0 - rate)).ln(), 0.0]);

    let mut tau = vec![1.0, 0.1];
    let mut modes: Vec<Vec<f64>> = series.iter().map(|_| vec![0.0; q]).collect();

    let mut previous = f64::NEG_INFINITY;
    let mut last_change = f64::INFINITY;
    for _ in 0..settings.max_iterations {
        // Conditional modes of the random effects at the current fixed
        // effects, one damped Newton per patient.
        for (patient, u) in series.iter().zip(modes.iter_mut()) {
            newton_modes(patient, u, &tau, settings, |t| beta[0] + beta[1] * t, |eta, y| {
                let p = sigmoid(eta);
                (y * eta - log1pexp(eta), y - p, p * (1.0 - p))
            })?;
        }

        // Fixed effects with the modes held fixed.
        let observations: Vec<(f64, f64, f64)> = series
            .iter()
            .zip(modes.iter())
            .flat_map(|(patient, u)| {
                let offset_intercept = u[0];
                let offset_slope = u[1];
                patient
                    .times
                    .iter()
                    .zip(patient.values.iter())
                    .map(move |(&t, &y)| (t, y, offset_intercept + offset_slope * t))
            })
            .collect();
        let cost_and_grad = |b: &Array1<f64>| -> (f64, Array1<f64>) {
            let mut nll = 0.0;
            let mut g0 = 0.0;
            let mut g1 = 0.0;
            for &(t, y, offset) in &observations {
                let eta = b[0] + b[1] * t + offset;
                nll -= y * eta - log1pexp(eta);
                let p = sigmoid(eta);
                g0 -= y - p;
                g1 -= (y - p) * t;
            }
            if !nll.is_finite() {
                return (1e10, Array1::zeros(2));
            }
            (nll, Array1::from_vec(vec![g0, g1]))
        };
        // Skip the optimizer when the fixed effects are already stationary;
        // a line search has nothing to do there and only reports failure.
        let (_, gradient) = cost_and_grad(&beta);
        if gradient.dot(&gradient).sqrt() > 1e-6 {
            let BfgsSolution { final_point, .. } = Bfgs::new(beta.clone(), &cost_and_grad)
                .with_tolerance(1e-8)
                .with_max_iterations(50)
                .run()
                .map_err(|e| FitError::OptimizationFailed(format!("{e:?}")))?;
            beta = final_point;
        }

        // Penalized log-likelihood for convergence.
        let mut penalized = 0.0;
        for (patient, u) in series.iter().zip(modes.iter()) {
            for (&t, &y) in patient.times.iter().zip(patient.values.iter()) {
                let eta = beta[0] + beta[1] * t + u[0] + u[1] * t;
                penalized += y * eta - log1pexp(eta);
            }
            for component in 0..q {
                penalized -= 0.5 * u[component] * u[component] / tau[component];
            }
        }
        if !penalized.is_finite() {
            return Err(FitError::OptimizationFailed(
                "penalized likelihood became non-finite".to_string(),
            ));
        }
        last_change = (penalized - previous).abs();
        if last_change < settings.tolerance {
            return Ok(FittedModel {
                params: ModelParams::Binary {
                    intercept: beta[0],
                    slope: beta[1],
                },
                structure,
                fell_back: false,
                effects: effects_map(series, &modes, structure),
                variance: components(&tau, 1.0, structure),
            });
        }
        previous = penalized;

        let patients = series.len() as f64;
        let mean_squares: Vec<f64> = (0..q)
            .map(|component| {
                modes.iter().map(|u| u[component] * u[component]).sum::<f64>() / patients
            })
            .collect();
        damped_variance_update(&mut tau, &mean_squares, settings);
    }

    Err(FitError::DidNotConverge {
        max_iterations: settings.max_iterations,
        last_change,
    })
}

/// Damped Newton search for one patient's random-effect conditional mode.
///
/// `link` maps a time to the fixed-effect contribution; `terms` maps
/// (eta, y) to (log-likelihood, first derivative in eta, curvature in eta).
fn newton_modes(
    patient: &PatientSeries,
    u: &mut Vec<f64>,
    tau: &[f64],
    settings: &FitSettings,
    link: impl Fn(f64) -> f64,
    terms: impl Fn(f64, f64) -> (f64, f64, f64),
) -> Result<(), FitError> {
    let q = tau.len();
    let penalized = |u: &[f64]| -> f64 {
        let mut value = 0.0;
        for (&t, &y) in patient.times.iter().zip(patient.values.iter()) {
            let random = u[0] + if q == 2 { u[1] * t } else { 0.0 };
            let (loglik, _, _) = terms(link(t) + random, y);
            value += loglik;
        }
        for component in 0..q {
            value -= 0.5 * u[component] * u[component] / tau[component];
        }
        value
    };

    for _ in 0..settings.inner_iterations {
        let mut gradient = vec![0.0; q];
        let mut hessian = DMatrix::<f64>::zeros(q, q);
        for (&t, &y) in patient.times.iter().zip(patient.values.iter()) {
            let random = u[0] + if q == 2 { u[1] * t } else { 0.0 };
            let (_, first, curvature) = terms(link(t) + random, y);
            let weight = curvature.max(1e-10);
            let design = if q == 2 { vec![1.0, t] } else { vec![1.0] };
            for row in 0..q {
                gradient[row] += first * design[row];
                for col in 0..q {
                    hessian[(row, col)] += weight * design[row] * design[col];
                }
            }
        }
        for component in 0..q {
            gradient[component] -= u[component] / tau[component];
            hessian[(component, component)] += 1.0 / tau[component];
        }

        let step = hessian
            .clone()
            .cholesky()
            .map(|factor| factor.solve(&DVector::from_column_slice(&gradient)))
            .ok_or(FitError::LinearSystemSolveFailed)?;
        if step.norm() < 1e-9 {
            break;
        }

        // Step-halving keeps the penalized objective from decreasing.
        let current = penalized(u);
        if !current.is_finite() {
            return Err(FitError::OptimizationFailed(
                "non-finite patient likelihood".to_string(),
            ));
        }
        let mut accepted = false;
        for &scale in &[1.0, 0.5, 0.25, 0.125] {
            let candidate: Vec<f64> = (0..q).map(|i| u[i] + scale * step[i]).collect();
            if penalized(&candidate) >= current {
                *u = candidate;
                accepted = true;
                break;
            }
        }
        if !accepted {
            break;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Mixed cumulative-link (proportional odds) model
// ---------------------------------------------------------------------------

fn fit_ordinal(series: &[PatientSeries], settings: &FitSettings) -> Result<FittedModel, FitError> {
    let mut levels: Vec<f64> = series
        .iter()
        .flat_map(|p| p.values.iter().copied())
        .collect();
    levels.sort_by(|a, b| a.total_cmp(b));
    levels.dedup();
    if levels.len() < 2 {
        return Err(FitError::ConstantOutcome);
    }

    match fit_ordinal_with(series, &levels, RandomStructure::InterceptSlope, settings) {
        Ok(fit) => Ok(fit),
        Err(err) => {
            log::warn!(
                "ordinal intercept+slope fit failed ({err}); retrying with a random intercept only"
            );
            let mut simple =
                fit_ordinal_with(series, &levels, RandomStructure::InterceptOnly, settings)?;
            simple.fell_back = true;
            Ok(simple)
        }
    }
}

/// Categories of one patient's series, as indices into `levels`.
fn category_indices(patient: &PatientSeries, levels: &[f64]) -> Vec<usize> {
    patient
        .values
        .iter()
        .map(|value| {
            levels
                .iter()
                .position(|level| level == value)
                .unwrap_or(0)
        })
        .collect()
}

/// Cut-points from the unconstrained (first, log-gap) parameterization.
fn cut_points_from(theta: &Array1<f64>, boundaries: usize) -> Vec<f64> {
    let mut cut_points = Vec::with_capacity(boundaries);
    let mut current = theta[0];
    cut_points.push(current);
    for gap in 1..boundaries {
        current += theta[gap].exp();
        cut_points.push(current);
    }
    cut_points
}

/// Log-likelihood terms of one cumulative-logit observation: probability,
/// derivative in the latent score, and the two cut-point densities.
fn ordinal_terms(cut_points: &[f64], category: usize, score: f64) -> (f64, f64, f64, f64) {
    let boundaries = cut_points.len();
    let upper_cdf = if category < boundaries {
        sigmoid(cut_points[category] - score)
    } else {
        1.0
    };
    let lower_cdf = if category > 0 {
        sigmoid(cut_points[category - 1] - score)
    } else {
        0.0
    };
    let probability = (upper_cdf - lower_cdf).max(1e-12);
    let upper_pdf = if category < boundaries {
        logistic_pdf(cut_points[category] - score)
    } else {
        0.0
    };
    let lower_pdf = if category > 0 {
        logistic_pdf(cut_points[category - 1] - score)
    } else {
        0.0
    };
    let score_derivative = -(upper_pdf - lower_pdf) / probability;
    (probability, score_derivative, upper_pdf, lower_pdf)
}

/// Curvature of one observation's log-likelihood in the latent score.
fn ordinal_curvature(cut_points: &[f64], category: usize, score: f64) -> f64 {
    let boundaries = cut_points.len();
    let (probability, _, upper_pdf, lower_pdf) = ordinal_terms(cut_points, category, score);
    let pdf_slope = |x: f64| logistic_pdf(x) * (1.0 - 2.0 * sigmoid(x));
    let upper_slope = if category < boundaries {
        -pdf_slope(cut_points[category] - score)
    } else {
        0.0
    };
    let lower_slope = if category > 0 {
        -pdf_slope(cut_points[category - 1] - score)
    } else {
        0.0
    };
    let density_change = upper_slope - lower_slope;
    // d2/ds2 log P = -(A'P + A^2)/P^2 with A = f_up - f_lo, A' = dA/ds.
    let a = upper_pdf - lower_pdf;
    -((density_change * probability + a * a) / (probability * probability))
}

fn fit_ordinal_with(
    series: &[PatientSeries],
    levels: &[f64],
    structure: RandomStructure,
    settings: &FitSettings,
) -> Result<FittedModel, FitError> {
    let q = structure.dim();
    let boundaries = levels.len() - 1;
    let categories: Vec<Vec<usize>> = series
        .iter()
        .map(|patient| category_indices(patient, levels))
        .collect();

    // Cut-point starting values from the empirical cumulative proportions.
    let total: usize = series.iter().map(|p| p.values.len()).sum();
    let mut counts = vec![0usize; levels.len()];
    for patient_categories in &categories {
        for &category in patient_categories {
            counts[category] += 1;
        }
    }
    let mut theta = Array1::zeros(boundaries + 1);
    let mut cumulative = 0usize;
    let mut previous_cut = f64::NEG_INFINITY;
    for boundary in 0..boundaries {
        cumulative += counts[boundary];
        let proportion = (cumulative as f64 / total as f64).clamp(1e-3, 1.0 - 1e-3);
        let mut cut = (proportion / (1.0 - proportion)).ln();
        if cut <= previous_cut {
            cut = previous_cut + 1e-3;
        }
        if boundary == 0 {
            theta[0] = cut;
        } else {
            theta[boundary] = (cut - previous_cut).ln();
        }
        previous_cut = cut;
    }
    // theta[boundaries] is the fixed time slope, starting at zero.

    let mut tau = if q == 2 { vec![1.0, 0.1] } else { vec![1.0] };
    let mut modes: Vec<Vec<f64>> = series.iter().map(|_| vec![0.0; q]).collect();

    let mut previous = f64::NEG_INFINITY;
    let mut last_change = f64::INFINITY;
    for _ in 0..settings.max_iterations {
        let cut_points = cut_points_from(&theta, boundaries);
        let slope = theta[boundaries];

        // Conditional modes per patient. The latent score plays the role of
        // eta; curvature comes from the cumulative-logit likelihood.
        for ((patient, patient_categories), u) in
            series.iter().zip(categories.iter()).zip(modes.iter_mut())
        {
            newton_ordinal_modes(
                patient,
                patient_categories,
                u,
                &cut_points,
                slope,
                &tau,
                settings,
            )?;
        }

        // Fixed parameters (cut-point parameterization + slope) via BFGS
        // with the modes held fixed.
        let flat: Vec<(f64, usize, f64)> = series
            .iter()
            .zip(categories.iter())
            .zip(modes.iter())
            .flat_map(|((patient, patient_categories), u)| {
                let intercept = u[0];
                let random_slope = if q == 2 { u[1] } else { 0.0 };
                patient
                    .times
                    .iter()
                    .zip(patient_categories.iter())
                    .map(move |(&t, &category)| (t, category, intercept + random_slope * t))
            })
            .collect();
        let cost_and_grad = |params: &Array1<f64>| -> (f64, Array1<f64>) {
            let cut_points = cut_points_from(params, boundaries);
            let slope = params[boundaries];
            let mut nll = 0.0;
            let mut cut_gradient = vec![0.0; boundaries];
            let mut slope_gradient = 0.0;
            for &(t, category, offset) in &flat {
                let score = slope * t + offset;
                let (probability, score_derivative, upper_pdf, lower_pdf) =
                    ordinal_terms(&cut_points, category, score);
                nll -= probability.ln();
                slope_gradient -= score_derivative * t;
                if category < boundaries {
                    cut_gradient[category] -= upper_pdf / probability;
                }
                if category > 0 {
                    cut_gradient[category - 1] += lower_pdf / probability;
                }
            }
            if !nll.is_finite() {
                return (1e10, Array1::zeros(boundaries + 1));
            }
            // Chain rule through the (first, log-gap) parameterization.
            let mut gradient = Array1::zeros(boundaries + 1);
            gradient[0] = cut_gradient.iter().sum();
            for gap in 1..boundaries {
                let tail: f64 = cut_gradient[gap..].iter().sum();
                gradient[gap] = params[gap].exp() * tail;
            }
            gradient[boundaries] = slope_gradient;
            (nll, gradient)
        };
        // As in the binary fit, do not hand an already-stationary point to
        // the line search.
        let (_, gradient) = cost_and_grad(&theta);
        if gradient.dot(&gradient).sqrt() > 1e-6 {
            let BfgsSolution { final_point, .. } = Bfgs::new(theta.clone(), &cost_and_grad)
                .with_tolerance(1e-8)
                .with_max_iterations(50)
                .run()
                .map_err(|e| FitError::OptimizationFailed(format!("{e:?}")))?;
            theta = final_point;
        }

        // Penalized log-likelihood for convergence.
        let cut_points = cut_points_from(&theta, boundaries);
        let slope = theta[boundaries];
        let mut penalized = 0.0;
        for ((patient, patient_categories), u) in
            series.iter().zip(categories.iter()).zip(modes.iter())
        {
            for (&t, &category) in patient.times.iter().zip(patient_categories.iter()) {
                let random = u[0] + if q == 2 { u[1] * t } else { 0.0 };
                let (probability, _, _, _) = ordinal_terms(&cut_points, category, slope * t + random);
                penalized += probability.ln();
            }
            for component in 0..q {
                penalized -= 0.5 * u[component] * u[component] / tau[component];
            }
        }
        if !penalized.is_finite() {
            return Err(FitError::OptimizationFailed(
                "penalized likelihood became non-finite".to_string(),
            ));
        }
        last_change = (penalized - previous).abs();
        if last_change < settings.tolerance {
            return Ok(FittedModel {
                params: ModelParams::Ordinal {
                    slope,
                    cut_points,
                    levels: levels.to_vec(),
                },
                structure,
                fell_back: false,
                effects: effects_map(series, &modes, structure),
                variance: components(&tau, 1.0, structure),
            });
        }
        previous = penalized;

        let patients = series.len() as f64;
        let mean_squares: Vec<f64> = (0..q)
            .map(|component| {
                modes.iter().map(|u| u[component] * u[component]).sum::<f64>() / patients
            })
            .collect();
        damped_variance_update(&mut tau, &mean_squares, settings);
    }

    Err(FitError::DidNotConverge {
        max_iterations: settings.max_iterations,
        last_change,
    })
}

fn newton_ordinal_modes(
    patient: &PatientSeries,
    categories: &[usize],
    u: &mut Vec<f64>,
    cut_points: &[f64],
    slope: f64,
    tau: &[f64],
    settings: &FitSettings,
) -> Result<(), FitError> {
    let q = tau.len();
    let penalized = |u: &[f64]| -> f64 {
        let mut value = 0.0;
        for (&t, &category) in patient.times.iter().zip(categories.iter()) {
            let random = u[0] + if q == 2 { u[1] * t } else { 0.0 };
            let (probability, _, _, _) = ordinal_terms(cut_points, category, slope * t + random);
            value += probability.ln();
        }
        for component in 0..q {
            value -= 0.5 * u[component] * u[component] / tau[component];
        }
        value
    };

    for _ in 0..settings.inner_iterations {
        let mut gradient = vec![0.0; q];
        let mut hessian = DMatrix::<f64>::zeros(q, q);
        for (&t, &category) in patient.times.iter().zip(categories.iter()) {
            let random = u[0] + if q == 2 { u[1] * t } else { 0.0 };
            let score = slope * t + random;
            let (_, score_derivative, _, _) = ordinal_terms(cut_points, category, score);
            let weight = (-ordinal_curvature(cut_points, category, score)).max(1e-10);
            let design = if q == 2 { vec![1.0, t] } else { vec![1.0] };
            for row in 0..q {
                gradient[row] += score_derivative * design[row];
                for col in 0..q {
                    hessian[(row, col)] += weight * design[row] * design[col];
                }
            }
        }
        for component in 0..q {
            gradient[component] -= u[component] / tau[component];
            hessian[(component, component)] += 1.0 / tau[component];
        }

        let step = hessian
            .clone()
            .cholesky()
            .map(|factor| factor.solve(&DVector::from_column_slice(&gradient)))
            .ok_or(FitError::LinearSystemSolveFailed)?;
        if step.norm() < 1e-9 {
            break;
        }

        let current = penalized(u);
        if !current.is_finite() {
            return Err(FitError::OptimizationFailed(
                "non-finite patient likelihood".to_string(),
            ));
        }
        let mut accepted = false;
        for &scale in &[1.0, 0.5, 0.25, 0.125] {
            let candidate: Vec<f64> = (0..q).map(|i| u[i] + scale * step[i]).collect();
            if penalized(&candidate) >= current {
                *u = candidate;
                accepted = true;
                break;
            }
        }
        if !accepted {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng, rngs::StdRng};
    use rand_distr::{Distribution, Normal};

    fn record(patient: &str, time: f64, value: f64) -> LongitudinalRecord {
        LongitudinalRecord {
            patient_id: patient.to_string(),
            disease_time: time,
            value,
            cohort: "test".to_string(),
        }
    }

    fn linear_records(
        patients: usize,
        noise_sd: f64,
        intercept_sd: f64,
        seed: u64,
    ) -> Vec<LongitudinalRecord> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, noise_sd).unwrap();
        let offsets = Normal::new(0.0, intercept_sd).unwrap();
        let mut records = Vec::new();
        for patient in 0..patients {
            let offset = if intercept_sd > 0.0 {
                offsets.sample(&mut rng)
            } else {
                0.0
            };
            for visit in 0..3 {
                let t = -2.0 + visit as f64 * 1.5 + rng.gen_range(-0.2..0.2);
                let e = if noise_sd > 0.0 { noise.sample(&mut rng) } else { 0.0 };
                records.push(record(&format!("p{patient:03}"), t, 2.0 * t + 5.0 + offset + e));
            }
        }
        records
    }

    #[test]
    fn linear_fit_recovers_slope_and_intercept() {
        let records = linear_records(20, 0.1, 1.0, 42);
        let model = fit(RegressionKind::Linear, &records, &FitSettings::default()).unwrap();
        let ModelParams::Linear { intercept, slope } = model.params else {
            panic!("expected a linear fit");
        };
        assert_abs_diff_eq!(intercept, 5.0, epsilon = 0.5);
        assert_abs_diff_eq!(slope, 2.0, epsilon = 0.3);
        assert_eq!(model.structure, RandomStructure::InterceptSlope);
        assert!(!model.fell_back);
        assert_eq!(model.effects.len(), 20);
    }

    #[test]
    fn linear_fit_falls_back_on_degenerate_intercepts() {
        // Every patient lies exactly on the same line, so the random
        // intercepts collapse to a single shared value.
        let records = linear_records(15, 0.0, 0.0, 7);
        let model = fit(RegressionKind::Linear, &records, &FitSettings::default()).unwrap();
        assert!(model.fell_back);
        assert_eq!(model.structure, RandomStructure::InterceptOnly);
        let ModelParams::Linear { intercept, slope } = model.params else {
            panic!("expected a linear fit");
        };
        assert_abs_diff_eq!(intercept, 5.0, epsilon = 0.1);
        assert_abs_diff_eq!(slope, 2.0, epsilon = 0.1);
        for effects in model.effects.values() {
            assert_abs_diff_eq!(effects.slope, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn binary_fit_recovers_the_direction_of_risk() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut records = Vec::new();
        for patient in 0..40 {
            for visit in 0..3 {
                let t = -2.0 + visit as f64 * 2.0 + rng.gen_range(-0.3..0.3);
                let p = 1.0 / (1.0 + (-(1.5 * t + 0.5)).exp());
                let y = if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 };
                records.push(record(&format!("p{patient:03}"), t, y));
            }
        }
        let model = fit(RegressionKind::Binary, &records, &FitSettings::default()).unwrap();
        let ModelParams::Binary { slope, .. } = model.params else {
            panic!("expected a binary fit");
        };
        assert!(slope > 0.5, "slope {slope} should be clearly positive");
        assert!(!model.fell_back);
    }

    #[test]
    fn binary_fit_rejects_non_binary_values() {
        let records = vec![
            record("p1", 0.0, 0.0),
            record("p1", 1.0, 2.0),
            record("p2", 0.0, 1.0),
            record("p2", 1.0, 0.0),
        ];
        let err = fit(RegressionKind::Binary, &records, &FitSettings::default()).unwrap_err();
        assert!(matches!(err, FitError::NonBinaryValues));
    }

    #[test]
    fn ordinal_fit_recovers_cut_points() {
        let mut rng = StdRng::seed_from_u64(23);
        let true_cuts = [-0.5, 0.5];
        let mut records = Vec::new();
        for patient in 0..40 {
            for visit in 0..4 {
                let t = -1.5 + visit as f64 + rng.gen_range(-0.2..0.2);
                let score = 1.0 * t;
                let uniform: f64 = rng.gen_range(1e-9..1.0 - 1e-9);
                let noise = (uniform / (1.0 - uniform)).ln();
                let latent = score + noise;
                let category = true_cuts.iter().filter(|&&c| latent > c).count();
                records.push(record(&format!("p{patient:03}"), t, category as f64));
            }
        }
        let model = fit(RegressionKind::Ordinal, &records, &FitSettings::default()).unwrap();
        let ModelParams::Ordinal {
            slope,
            cut_points,
            levels,
        } = &model.params
        else {
            panic!("expected an ordinal fit");
        };
        assert_eq!(levels, &vec![0.0, 1.0, 2.0]);
        assert_eq!(cut_points.len(), 2);
        assert!(cut_points[0] < cut_points[1], "cut points must stay ordered");
        assert_abs_diff_eq!(*slope, 1.0, epsilon = 0.5);
        assert_abs_diff_eq!(cut_points[0], -0.5, epsilon = 0.5);
        assert_abs_diff_eq!(cut_points[1], 0.5, epsilon = 0.5);
    }

    #[test]
    fn ordinal_fit_rejects_constant_outcomes() {
        let records = vec![
            record("p1", 0.0, 1.0),
            record("p1", 1.0, 1.0),
            record("p2", 0.0, 1.0),
            record("p2", 1.0, 1.0),
        ];
        let err = fit(RegressionKind::Ordinal, &records, &FitSettings::default()).unwrap_err();
        assert!(matches!(err, FitError::ConstantOutcome));
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = fit(RegressionKind::Linear, &[], &FitSettings::default()).unwrap_err();
        assert!(matches!(err, FitError::NoQualifyingPatients));
    }
}
