//! Per-regime conditional-variance models.
//!
//! Each regime's return subsequence gets a GARCH(1,1) fit by
//! variance-targeted grid-search maximum likelihood. When the subsequence is
//! too sparse or the fit degenerates, the model degrades to the RiskMetrics
//! EWMA recursion (lambda 0.94). The degradation is a designed branch of
//! `VolFit`, not a caught exception, and is transparent downstream: inference
//! always yields an innovation sequence of the input length.
//!
//! References:
//! - Bollerslev (1986), GARCH(1,1).
//! - J.P. Morgan/Reuters, *RiskMetrics Technical Document* (1996).

use serde::{Deserialize, Serialize};

use crate::math::{MIN_STD, ewma_volatility, sample_variance};

/// EWMA decay used by the degradation path.
pub const EWMA_LAMBDA: f64 = 0.94;

/// Observations below which the GARCH fit is not attempted.
const GARCH_MIN_OBSERVATIONS: usize = 30;

/// Fitted conditional-variance process for one regime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VolFit {
    Garch { omega: f64, alpha: f64, beta: f64 },
    /// EWMA fallback applied directly to the data.
    Ewma { lambda: f64 },
}

/// Conditional-std path and standardized residuals for one subsequence.
#[derive(Debug, Clone, PartialEq)]
pub struct VolInference {
    pub conditional_std: Vec<f64>,
    pub innovations: Vec<f64>,
}

/// Per-regime volatility model plus the innovations of its training data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolModel {
    pub fit: VolFit,
    /// Standardized residuals of the regime's training subsequence.
    pub innovations: Vec<f64>,
    /// Long-run (unconditional) standard deviation of the fit.
    pub long_run_std: f64,
}

impl VolModel {
    /// Fits a conditional-variance model to one regime's returns.
    ///
    /// Never fails: degraded inputs yield the EWMA fallback.
    pub fn fit(returns: &[f64]) -> Self {
        let fit = if returns.len() >= GARCH_MIN_OBSERVATIONS {
            fit_garch_grid(returns).unwrap_or(VolFit::Ewma {
                lambda: EWMA_LAMBDA,
            })
        } else {
            VolFit::Ewma {
                lambda: EWMA_LAMBDA,
            }
        };

        let inference = infer_with(fit, returns);
        let long_run_std = long_run_std(fit, returns);

        Self {
            fit,
            innovations: inference.innovations,
            long_run_std,
        }
    }

    /// Conditional-std path and standardized residuals for `returns`.
    ///
    /// Output vectors always match the input length; non-finite residuals are
    /// zeroed.
    pub fn infer(&self, returns: &[f64]) -> VolInference {
        infer_with(self.fit, returns)
    }
}

fn long_run_std(fit: VolFit, returns: &[f64]) -> f64 {
    let sample = if returns.len() >= 2 {
        sample_variance(returns).max(MIN_STD * MIN_STD)
    } else {
        MIN_STD * MIN_STD
    };
    match fit {
        VolFit::Garch { omega, alpha, beta } => {
            let persistence = alpha + beta;
            if persistence < 1.0 {
                (omega / (1.0 - persistence)).max(MIN_STD * MIN_STD).sqrt()
            } else {
                sample.sqrt()
            }
        }
        VolFit::Ewma { .. } => sample.sqrt(),
    }
}

fn infer_with(fit: VolFit, returns: &[f64]) -> VolInference {
    if returns.len() < 2 {
        let conditional_std = vec![1.0; returns.len()];
        let innovations = returns.iter().map(|&r| zero_non_finite(r)).collect();
        return VolInference {
            conditional_std,
            innovations,
        };
    }

    let conditional_std = match fit {
        VolFit::Garch { omega, alpha, beta } => {
            let mut h = sample_variance(returns).max(MIN_STD * MIN_STD);
            let mut out = Vec::with_capacity(returns.len());
            out.push(h.sqrt());
            for &r in &returns[..returns.len() - 1] {
                h = omega + alpha * r * r + beta * h;
                out.push(h.max(MIN_STD * MIN_STD).sqrt());
            }
            out
        }
        VolFit::Ewma { lambda } => ewma_volatility(returns, lambda),
    };

    let innovations = returns
        .iter()
        .zip(conditional_std.iter())
        .map(|(&r, &s)| zero_non_finite(r / s.max(MIN_STD)))
        .collect();

    VolInference {
        conditional_std,
        innovations,
    }
}

#[inline]
fn zero_non_finite(x: f64) -> f64 {
    if x.is_finite() { x } else { 0.0 }
}

/// Variance-targeted GARCH(1,1) grid-search MLE.
///
/// `omega` is pinned to `var * (1 - alpha - beta)` so only `(alpha, beta)`
/// are searched. Returns `None` when no candidate produces a finite
/// likelihood improvement over the degenerate constant-variance fit.
fn fit_garch_grid(returns: &[f64]) -> Option<VolFit> {
    let var = sample_variance(returns).max(MIN_STD * MIN_STD);

    let mut best: Option<(f64, VolFit)> = None;
    for alpha_step in 0..15 {
        let alpha = 0.01 + alpha_step as f64 * 0.02;
        for beta_step in 0..25 {
            let beta = 0.50 + beta_step as f64 * 0.02;
            if alpha + beta >= 0.999 {
                continue;
            }
            let omega = var * (1.0 - alpha - beta);
            let ll = garch_log_likelihood(returns, omega, alpha, beta, var);
            if ll.is_finite() && best.as_ref().is_none_or(|(b, _)| ll > *b) {
                best = Some((ll, VolFit::Garch { omega, alpha, beta }));
            }
        }
    }

    let (best_ll, fit) = best?;
    // Require the recursion to beat a constant-variance Gaussian fit.
    let flat_ll = garch_log_likelihood(returns, var, 0.0, 0.0, var);
    if best_ll > flat_ll { Some(fit) } else { None }
}

fn garch_log_likelihood(returns: &[f64], omega: f64, alpha: f64, beta: f64, h0: f64) -> f64 {
    let mut h = h0;
    let mut ll = 0.0;
    let mut prev_r2 = returns[0] * returns[0];

    for (t, &r) in returns.iter().enumerate() {
        if t > 0 {
            h = omega + alpha * prev_r2 + beta * h;
            prev_r2 = r * r;
        }
        let hv = h.max(MIN_STD * MIN_STD);
        ll += -0.5 * (hv.ln() + r * r / hv);
    }
    ll
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, StandardNormal};

    use super::*;

    fn garch_sample(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let (omega, alpha, beta) = (2.0e-6, 0.08, 0.90);
        let mut h = omega / (1.0 - alpha - beta);
        let mut out = Vec::with_capacity(n);
        let mut prev = 0.0_f64;
        for _ in 0..n {
            h = omega + alpha * prev * prev + beta * h;
            let z: f64 = StandardNormal.sample(&mut rng);
            prev = h.sqrt() * z;
            out.push(prev);
        }
        out
    }

    #[test]
    fn garch_fit_detects_persistence() {
        let r = garch_sample(3000, 11);
        let model = VolModel::fit(&r);
        match model.fit {
            VolFit::Garch { alpha, beta, .. } => {
                assert!(alpha + beta > 0.7, "persistence too low: {}", alpha + beta);
            }
            VolFit::Ewma { .. } => panic!("expected a GARCH fit on clustered data"),
        }
    }

    #[test]
    fn sparse_regime_degrades_to_ewma() {
        let r = vec![0.01, -0.02, 0.005, 0.0, -0.01];
        let model = VolModel::fit(&r);
        assert!(matches!(model.fit, VolFit::Ewma { lambda } if lambda == EWMA_LAMBDA));
        assert_eq!(model.innovations.len(), r.len());
    }

    #[test]
    fn inference_preserves_input_length_and_finiteness() {
        let r = garch_sample(500, 13);
        let model = VolModel::fit(&r);
        let inf = model.infer(&r);
        assert_eq!(inf.conditional_std.len(), r.len());
        assert_eq!(inf.innovations.len(), r.len());
        assert!(inf.innovations.iter().all(|x| x.is_finite()));
        assert!(inf.conditional_std.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn degenerate_inputs_yield_zeroed_innovations() {
        let model = VolModel::fit(&[0.0; 40]);
        let inf = model.infer(&[0.0; 40]);
        assert!(inf.innovations.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn single_observation_is_handled() {
        let model = VolModel::fit(&[0.02]);
        let inf = model.infer(&[0.02]);
        assert_eq!(inf.innovations.len(), 1);
        assert!(inf.innovations[0].is_finite());
    }
}
