//! Volatility-regime classification.
//!
//! A smoothed volatility feature (rolling standard deviation of returns) is
//! fitted with a univariate Gaussian mixture for each candidate regime count
//! in `[2, 5]`; the count minimizing BIC wins. Components are reordered by
//! ascending mean so regime 1 is always the lowest-volatility state, which
//! keeps regime indices comparable across refits. Each step is assigned the
//! regime with the highest responsibility, and the transition matrix is the
//! row-normalized empirical one-step frequency table with identity rows for
//! regimes never observed transitioning.
//!
//! References:
//! - Hamilton (1989) for regime-switching interpretation.
//! - Dempster, Laird, and Rubin (1977) for EM.

use serde::{Deserialize, Serialize};

use crate::math::{MIN_STD, rolling_std_dev, sample_mean, sample_variance};

const MIN_REGIMES: usize = 2;
const MAX_REGIMES: usize = 5;
const EM_MAX_ITERATIONS: usize = 200;
const EM_TOLERANCE: f64 = 1.0e-8;

/// One fitted mixture component over the volatility feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixtureComponent {
    pub weight: f64,
    pub mean: f64,
    pub variance: f64,
}

/// Fitted regime model for one asset.
///
/// Immutable after fitting. Regime indices are 1-based and contiguous, with
/// regime 1 the lowest-volatility component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeModel {
    /// Mixture components ordered by ascending mean.
    pub components: Vec<MixtureComponent>,
    /// Per-step regime labels, same length as the source series.
    pub labels: Vec<usize>,
    /// Row-stochastic transition matrix; unobserved rows are identity rows.
    pub transition: Vec<Vec<f64>>,
    /// Stationary distribution of `transition` (power iteration).
    pub stationary: Vec<f64>,
}

impl RegimeModel {
    pub fn n_regimes(&self) -> usize {
        self.components.len()
    }

    /// Indices of observations labeled with `regime` (1-based).
    pub fn regime_indices(&self, regime: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &r)| r == regime)
            .map(|(i, _)| i)
            .collect()
    }

    /// Contiguous run lengths per regime, 1-based outer index offset by 1.
    pub fn regime_durations(&self) -> Vec<Vec<f64>> {
        let mut durations = vec![Vec::new(); self.n_regimes()];
        let mut run_start = 0usize;
        for t in 1..=self.labels.len() {
            if t == self.labels.len() || self.labels[t] != self.labels[run_start] {
                let regime = self.labels[run_start];
                durations[regime - 1].push((t - run_start) as f64);
                run_start = t;
            }
        }
        durations
    }
}

/// Classifies a single asset's return series into volatility regimes.
///
/// `feature_window` is the rolling-std window for the volatility feature.
/// Fitting failure for every candidate count is not fatal: the classifier
/// falls back to a two-regime median split with a stronger variance floor.
///
/// # Errors
/// Returns an error only when the series is too short to produce a feature.
pub fn classify_regimes(returns: &[f64], feature_window: usize) -> Result<RegimeModel, String> {
    if returns.len() < feature_window.max(2) + 2 {
        return Err(format!(
            "need more than {} observations for a {feature_window}-step volatility feature",
            feature_window.max(2) + 1
        ));
    }

    let feature = volatility_feature(returns, feature_window.max(2));

    let mut best: Option<(f64, Vec<MixtureComponent>)> = None;
    for k in MIN_REGIMES..=MAX_REGIMES {
        if let Some(fit) = fit_mixture(&feature, k, MIN_STD * MIN_STD) {
            let n_params = (3 * k - 1) as f64;
            let bic = n_params * (feature.len() as f64).ln() - 2.0 * fit.log_likelihood;
            if best.as_ref().is_none_or(|(b, _)| bic < *b) {
                best = Some((bic, fit.components));
            }
        }
    }

    let components = match best {
        Some((_, components)) => components,
        // All candidate fits failed: fall back to a regularized median split.
        None => fallback_components(&feature),
    };

    let labels = assign_labels(&feature, &components);
    let transition = transition_matrix(&labels, components.len());
    let stationary = stationary_distribution(&transition);

    Ok(RegimeModel {
        components,
        labels,
        transition,
        stationary,
    })
}

/// Rolling volatility feature, left-padded so it aligns with the returns.
fn volatility_feature(returns: &[f64], window: usize) -> Vec<f64> {
    let rolled = rolling_std_dev(returns, window);
    let mut feature = vec![rolled[0]; window - 1];
    feature.extend_from_slice(&rolled);
    feature
}

struct MixtureFit {
    components: Vec<MixtureComponent>,
    log_likelihood: f64,
}

fn normal_density(x: f64, mean: f64, variance: f64) -> f64 {
    let v = variance.max(MIN_STD * MIN_STD);
    (-0.5 * (x - mean) * (x - mean) / v).exp() / (2.0 * std::f64::consts::PI * v).sqrt()
}

/// Univariate Gaussian-mixture EM with quantile-spread initialization.
///
/// Returns `None` when the fit degenerates (empty component, non-finite
/// likelihood) so the caller can try another count or fall back.
fn fit_mixture(feature: &[f64], k: usize, variance_floor: f64) -> Option<MixtureFit> {
    let n = feature.len();
    if n < 2 * k {
        return None;
    }

    let mut sorted = feature.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let overall_var = sample_variance(feature).max(variance_floor);
    let mut components: Vec<MixtureComponent> = (0..k)
        .map(|c| MixtureComponent {
            weight: 1.0 / k as f64,
            // Spread initial means across the feature's quantiles.
            mean: sorted[((2 * c + 1) * n) / (2 * k)],
            variance: overall_var,
        })
        .collect();

    let mut responsibilities = vec![vec![0.0; k]; n];
    let mut log_likelihood = f64::NEG_INFINITY;

    for _ in 0..EM_MAX_ITERATIONS {
        // E-step.
        let mut ll = 0.0;
        for (t, &x) in feature.iter().enumerate() {
            let mut total = 0.0;
            for (c, comp) in components.iter().enumerate() {
                let p = comp.weight * normal_density(x, comp.mean, comp.variance);
                responsibilities[t][c] = p;
                total += p;
            }
            if total <= 0.0 || !total.is_finite() {
                return None;
            }
            for r in &mut responsibilities[t] {
                *r /= total;
            }
            ll += total.ln();
        }

        // M-step.
        for c in 0..k {
            let weight_sum: f64 = responsibilities.iter().map(|r| r[c]).sum();
            if weight_sum <= MIN_STD {
                return None;
            }
            let mean = feature
                .iter()
                .zip(responsibilities.iter())
                .map(|(&x, r)| r[c] * x)
                .sum::<f64>()
                / weight_sum;
            let variance = feature
                .iter()
                .zip(responsibilities.iter())
                .map(|(&x, r)| r[c] * (x - mean) * (x - mean))
                .sum::<f64>()
                / weight_sum;

            components[c] = MixtureComponent {
                weight: weight_sum / n as f64,
                mean,
                variance: variance.max(variance_floor),
            };
        }

        if ll.is_finite() && (ll - log_likelihood).abs() < EM_TOLERANCE {
            log_likelihood = ll;
            break;
        }
        log_likelihood = ll;
    }

    if !log_likelihood.is_finite() {
        return None;
    }

    components.sort_by(|a, b| a.mean.total_cmp(&b.mean));
    Some(MixtureFit {
        components,
        log_likelihood,
    })
}

/// Two-component median split used when every EM candidate fails.
fn fallback_components(feature: &[f64]) -> Vec<MixtureComponent> {
    let mut sorted = feature.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = sorted[sorted.len() / 2];

    let (low, high): (Vec<f64>, Vec<f64>) = feature.iter().partition(|&&x| x <= median);
    let floor = sample_variance(feature).max(MIN_STD) * 1.0e-3;

    let stats = |xs: &[f64]| -> (f64, f64) {
        if xs.len() < 2 {
            (median, floor)
        } else {
            (sample_mean(xs), sample_variance(xs).max(floor))
        }
    };
    let (low_mean, low_var) = stats(&low);
    let (high_mean, high_var) = stats(&high);

    vec![
        MixtureComponent {
            weight: low.len().max(1) as f64 / feature.len() as f64,
            mean: low_mean.min(high_mean),
            variance: low_var,
        },
        MixtureComponent {
            weight: high.len().max(1) as f64 / feature.len() as f64,
            mean: high_mean.max(low_mean),
            variance: high_var,
        },
    ]
}

/// Assigns each step the 1-based index of its highest-responsibility component.
fn assign_labels(feature: &[f64], components: &[MixtureComponent]) -> Vec<usize> {
    feature
        .iter()
        .map(|&x| {
            components
                .iter()
                .enumerate()
                .map(|(c, comp)| (c, comp.weight * normal_density(x, comp.mean, comp.variance)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(c, _)| c + 1)
                .unwrap_or(1)
        })
        .collect()
}

/// Row-normalized empirical one-step transition frequencies.
///
/// A regime with no observed outgoing transitions gets an exact identity row.
pub fn transition_matrix(labels: &[usize], n_regimes: usize) -> Vec<Vec<f64>> {
    let mut counts = vec![vec![0.0; n_regimes]; n_regimes];
    for w in labels.windows(2) {
        counts[w[0] - 1][w[1] - 1] += 1.0;
    }

    let mut matrix = vec![vec![0.0; n_regimes]; n_regimes];
    for (r, row) in counts.iter().enumerate() {
        let total: f64 = row.iter().sum();
        if total > 0.0 {
            for (c, &count) in row.iter().enumerate() {
                matrix[r][c] = count / total;
            }
        } else {
            matrix[r][r] = 1.0;
        }
    }
    matrix
}

/// Stationary distribution by power iteration, falling back to uniform.
pub fn stationary_distribution(transition: &[Vec<f64>]) -> Vec<f64> {
    let n = transition.len();
    let mut pi = vec![1.0 / n as f64; n];
    for _ in 0..200 {
        let mut next = vec![0.0; n];
        for (r, row) in transition.iter().enumerate() {
            for (c, &p) in row.iter().enumerate() {
                next[c] += pi[r] * p;
            }
        }
        let total: f64 = next.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return vec![1.0 / n as f64; n];
        }
        for x in &mut next {
            *x /= total;
        }
        let delta: f64 = pi
            .iter()
            .zip(next.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        pi = next;
        if delta < 1.0e-12 {
            break;
        }
    }
    pi
}
