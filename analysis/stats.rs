//! Shared statistical primitives: correlation estimators with two-sided
//! p-values and confidence intervals, and the Benjamini–Hochberg step-up
//! adjustment. The correlation method is always chosen by the caller from
//! the outcome's regression kind, never from the data.

use ndarray::ArrayView1;
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use std::cmp::Ordering;

/// A correlation estimate with its two-sided p-value and 95% CI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    pub coefficient: f64,
    pub p_value: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub n: usize,
}

fn standard_normal() -> Normal {
    Normal::new(0.0, 1.0).expect("standard normal parameters are valid")
}

pub fn normal_cdf(x: f64) -> f64 {
    standard_normal().cdf(x)
}

pub fn normal_quantile(p: f64) -> f64 {
    standard_normal().inverse_cdf(p.clamp(f64::MIN_POSITIVE, 1.0 - 1e-16))
}

/// Two-sided tail probability of a standard normal score.
pub fn two_sided_p(z: f64) -> f64 {
    (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0)
}

/// The 97.5% normal quantile used for every 95% interval in the pipeline.
pub const Z_95: f64 = 1.959963984540054;

/// Pearson product-moment correlation. With a dichotomous `x` this is the
/// point-biserial coefficient. Returns `None` when either side is constant
/// or fewer than three pairs are available.
pub fn pearson(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Option<Correlation> {
    let n = x.len();
    if n != y.len() || n < 3 {
        return None;
    }
    let nf = n as f64;
    let mean_x = x.sum() / nf;
    let mean_y = y.sum() / nf;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    let mut sxy = 0.0;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    let r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);

    let p_value = if (1.0 - r * r) < 1e-15 {
        0.0
    } else {
        let t = r * ((nf - 2.0) / (1.0 - r * r)).sqrt();
        let dist = StudentsT::new(0.0, 1.0, nf - 2.0)
            .expect("Student-t degrees of freedom are positive for n >= 3");
        (2.0 * (1.0 - dist.cdf(t.abs()))).clamp(0.0, 1.0)
    };

    // Fisher z-transform interval; undefined below four pairs.
    let (ci_low, ci_high) = if n >= 4 {
        let bounded = r.clamp(-1.0 + 1e-12, 1.0 - 1e-12);
        let z = bounded.atanh();
        let half_width = Z_95 / (nf - 3.0).sqrt();
        ((z - half_width).tanh(), (z + half_width).tanh())
    } else {
        (-1.0, 1.0)
    };

    Some(Correlation {
        coefficient: r,
        p_value,
        ci_low,
        ci_high,
        n,
    })
}

/// Kendall rank correlation (tau-b, tie-corrected), with a tie-corrected
/// normal-approximation p-value and a normal-approximation confidence
/// interval. Returns `None` when either side is fully tied or fewer than
/// three pairs are available.
pub fn kendall(x: ArrayView1<f64>, y: ArrayView1<f64>) -> Option<Correlation> {
    let n = x.len();
    if n != y.len() || n < 3 {
        return None;
    }
    let nf = n as f64;

    let mut concordant = 0i64;
    let mut discordant = 0i64;
    for i in 0..n {
        for j in (i + 1)..n {
            let dx = x[i] - x[j];
            let dy = y[i] - y[j];
            let product = dx * dy;
            if product > 0.0 {
                concordant += 1;
            } else if product < 0.0 {
                discordant += 1;
            }
        }
    }
    let s = (concordant - discordant) as f64;

    let tie_sizes = |values: ArrayView1<f64>| -> Vec<f64> {
        let mut sorted: Vec<f64> = values.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let mut sizes = Vec::new();
        let mut run = 1usize;
        for i in 1..sorted.len() {
            if sorted[i] == sorted[i - 1] {
                run += 1;
            } else {
                if run > 1 {
                    sizes.push(run as f64);
                }
                run = 1;
            }
        }
        if run > 1 {
            sizes.push(run as f64);
        }
        sizes
    };
    let ties_x = tie_sizes(x);
    let ties_y = tie_sizes(y);

    let n0 = nf * (nf - 1.0) / 2.0;
    let n1: f64 = ties_x.iter().map(|t| t * (t - 1.0) / 2.0).sum();
    let n2: f64 = ties_y.iter().map(|t| t * (t - 1.0) / 2.0).sum();
    let denominator = ((n0 - n1) * (n0 - n2)).sqrt();
    if denominator <= 0.0 {
        return None;
    }
    let tau = (s / denominator).clamp(-1.0, 1.0);

    // Tie-corrected variance of S (Kendall 1970).
    let v0 = nf * (nf - 1.0) * (2.0 * nf + 5.0);
    let vt: f64 = ties_x.iter().map(|t| t * (t - 1.0) * (2.0 * t + 5.0)).sum();
    let vu: f64 = ties_y.iter().map(|t| t * (t - 1.0) * (2.0 * t + 5.0)).sum();
    let sum_t2: f64 = ties_x.iter().map(|t| t * (t - 1.0)).sum();
    let sum_u2: f64 = ties_y.iter().map(|t| t * (t - 1.0)).sum();
    let sum_t3: f64 = ties_x.iter().map(|t| t * (t - 1.0) * (t - 2.0)).sum();
    let sum_u3: f64 = ties_y.iter().map(|t| t * (t - 1.0) * (t - 2.0)).sum();
    let v1 = sum_t2 * sum_u2 / (2.0 * nf * (nf - 1.0));
    let v2 = if n > 2 {
        sum_t3 * sum_u3 / (9.0 * nf * (nf - 1.0) * (nf - 2.0))
    } else {
        0.0
    };
    let variance = (v0 - vt - vu) / 18.0 + v1 + v2;
    let p_value = if variance > 0.0 {
        two_sided_p(s / variance.sqrt())
    } else {
        1.0
    };

    let se = (2.0 * (2.0 * nf + 5.0) / (9.0 * nf * (nf - 1.0))).sqrt();
    let ci_low = (tau - Z_95 * se).max(-1.0);
    let ci_high = (tau + Z_95 * se).min(1.0);

    Some(Correlation {
        coefficient: tau,
        p_value,
        ci_low,
        ci_high,
        n,
    })
}

/// Benjamini–Hochberg step-up adjustment. The result is aligned with the
/// input order; adjusted values are clamped to 1 and kept monotone over the
/// sorted raw p-values.
pub fn bh_adjust(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len();
    if m == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| {
        p_values[a]
            .partial_cmp(&p_values[b])
            .unwrap_or(Ordering::Equal)
    });

    let mut adjusted = vec![0.0; m];
    let mut running = 1.0f64;
    for rank in (0..m).rev() {
        let index = order[rank];
        let candidate = (p_values[index] * m as f64 / (rank + 1) as f64).min(1.0);
        running = running.min(candidate);
        adjusted[index] = running;
    }
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn z95_matches_the_normal_quantile() {
        assert_abs_diff_eq!(normal_quantile(0.975), Z_95, epsilon = 1e-9);
    }

    #[test]
    fn pearson_detects_perfect_correlation() {
        let x = Array1::from_iter((1..=10).map(|v| v as f64));
        let y = x.mapv(|v| 2.0 * v + 1.0);
        let result = pearson(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(result.coefficient, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.p_value, 0.0, epsilon = 1e-12);
        assert_eq!(result.n, 10);
    }

    #[test]
    fn pearson_matches_reference_values() {
        let x = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let y = Array1::from_vec(vec![2.0, 1.0, 4.0, 3.0, 6.0]);
        let result = pearson(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(result.coefficient, 0.8220, epsilon = 1e-3);
        assert_abs_diff_eq!(result.p_value, 0.0877, epsilon = 5e-3);
        assert!(result.ci_low < result.coefficient && result.coefficient < result.ci_high);
    }

    #[test]
    fn pearson_rejects_constant_input() {
        let x = Array1::from_vec(vec![1.0; 5]);
        let y = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(pearson(x.view(), y.view()).is_none());
    }

    #[test]
    fn kendall_matches_reference_values() {
        let x = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let y = Array1::from_vec(vec![1.0, 2.0, 3.0, 5.0, 4.0]);
        let result = kendall(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(result.coefficient, 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(result.p_value, 0.0500, epsilon = 2e-3);
    }

    #[test]
    fn kendall_handles_ties() {
        let x = Array1::from_vec(vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let y = Array1::from_vec(vec![1.0, 2.0, 2.0, 3.0, 3.0, 4.0]);
        let result = kendall(x.view(), y.view()).unwrap();
        assert!(result.coefficient > 0.5);
        assert!(result.p_value < 0.10);
        assert!(result.ci_low <= result.coefficient && result.coefficient <= result.ci_high);
    }

    #[test]
    fn kendall_rejects_fully_tied_input() {
        let x = Array1::from_vec(vec![2.0; 6]);
        let y = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(kendall(x.view(), y.view()).is_none());
    }

    #[test]
    fn bh_matches_hand_computed_values() {
        let adjusted = bh_adjust(&[0.01, 0.04, 0.03, 0.002]);
        assert_abs_diff_eq!(adjusted[0], 0.02, epsilon = 1e-12);
        assert_abs_diff_eq!(adjusted[1], 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(adjusted[2], 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(adjusted[3], 0.008, epsilon = 1e-12);
    }

    #[test]
    fn bh_is_monotone_and_dominates_raw_values() {
        let mut rng = StdRng::seed_from_u64(7);
        let raw: Vec<f64> = (0..40).map(|_| rng.gen_range(0.0..1.0)).collect();
        let adjusted = bh_adjust(&raw);

        for (p, q) in raw.iter().zip(adjusted.iter()) {
            assert!(q >= p, "adjusted {q} fell below raw {p}");
            assert!(*q <= 1.0);
        }

        let mut order: Vec<usize> = (0..raw.len()).collect();
        order.sort_by(|&a, &b| raw[a].partial_cmp(&raw[b]).unwrap());
        for pair in order.windows(2) {
            assert!(adjusted[pair[0]] <= adjusted[pair[1]] + 1e-15);
        }
    }

    #[test]
    fn bh_handles_empty_and_single_inputs() {
        assert!(bh_adjust(&[]).is_empty());
        assert_eq!(bh_adjust(&[0.2]), vec![0.2]);
    }
}
