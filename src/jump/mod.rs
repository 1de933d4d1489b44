//! Per-regime jump detection and jump-size characterization.
//!
//! An observation is a jump when its absolute value exceeds either
//! `threshold * regime_std` or the configured percentile of absolute returns,
//! per `JumpDetectionMethod`. The model records the empirical jump frequency,
//! the raw jump-sized observations, and a normal `(mean, std)` fit of those
//! observations for generative use when empirical resampling is disabled.

use serde::{Deserialize, Serialize};

use crate::core::JumpDetectionMethod;
use crate::math::{empirical_quantile, sample_mean, sample_std_dev};

/// Scale assigned to the degenerate fit of an empty jump set.
const DEGENERATE_SCALE: f64 = 1.0e-8;

/// Fitted jump behavior for one regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JumpModel {
    /// Jump count divided by regime length (0 for an empty regime).
    pub frequency: f64,
    /// Raw jump-sized observations, in occurrence order.
    pub sizes: Vec<f64>,
    /// Location of the parametric jump-size fit.
    pub mean: f64,
    /// Scale of the parametric jump-size fit.
    pub std_dev: f64,
}

impl JumpModel {
    /// Detects jumps in one regime's return subsequence.
    ///
    /// An empty jump set yields frequency 0 and a degenerate
    /// `(0, 1e-8)` parametric fit rather than failing.
    pub fn fit(returns: &[f64], method: JumpDetectionMethod, threshold: f64) -> Self {
        if returns.is_empty() {
            return Self::degenerate();
        }

        let cutoff = match method {
            JumpDetectionMethod::StdMultiplier => {
                let std = if returns.len() >= 2 {
                    sample_std_dev(returns)
                } else {
                    0.0
                };
                threshold * std
            }
            JumpDetectionMethod::Percentile => {
                let abs: Vec<f64> = returns.iter().map(|r| r.abs()).collect();
                empirical_quantile(&abs, threshold / 100.0)
            }
        };

        let sizes: Vec<f64> = returns
            .iter()
            .copied()
            .filter(|r| r.abs() > cutoff)
            .collect();

        if sizes.is_empty() {
            return Self::degenerate();
        }

        let mean = sample_mean(&sizes);
        let std_dev = if sizes.len() >= 2 {
            sample_std_dev(&sizes).max(DEGENERATE_SCALE)
        } else {
            DEGENERATE_SCALE
        };

        Self {
            frequency: sizes.len() as f64 / returns.len() as f64,
            sizes,
            mean,
            std_dev,
        }
    }

    fn degenerate() -> Self {
        Self {
            frequency: 0.0,
            sizes: Vec::new(),
            mean: 0.0,
            std_dev: DEGENERATE_SCALE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threshold_flags_nearly_everything() {
        let returns = vec![0.01, -0.02, 0.03, -0.01, 0.02, -0.03, 0.015, -0.025];
        let model = JumpModel::fit(&returns, JumpDetectionMethod::StdMultiplier, 0.0);
        assert!(model.frequency > 0.99);
        assert_eq!(model.sizes.len(), returns.len());
    }

    #[test]
    fn large_threshold_yields_degenerate_fit() {
        let returns = vec![0.01, -0.01, 0.012, -0.008];
        let model = JumpModel::fit(&returns, JumpDetectionMethod::StdMultiplier, 50.0);
        assert_eq!(model.frequency, 0.0);
        assert!(model.sizes.is_empty());
        assert_eq!(model.mean, 0.0);
        assert!(model.std_dev > 0.0);
    }

    #[test]
    fn std_multiplier_detects_outliers() {
        let mut returns = vec![0.001; 99];
        returns.push(0.5);
        let model = JumpModel::fit(&returns, JumpDetectionMethod::StdMultiplier, 3.0);
        assert_eq!(model.sizes, vec![0.5]);
        assert!((model.frequency - 0.01).abs() < 1.0e-12);
    }

    #[test]
    fn percentile_detection_matches_tail_share() {
        let returns: Vec<f64> = (1..=100).map(|i| i as f64 / 100.0).collect();
        let model = JumpModel::fit(&returns, JumpDetectionMethod::Percentile, 90.0);
        // Strictly above the 90th percentile of |r|.
        assert!(model.sizes.len() <= 10 && !model.sizes.is_empty());
    }

    #[test]
    fn empty_regime_is_degenerate() {
        let model = JumpModel::fit(&[], JumpDetectionMethod::StdMultiplier, 3.0);
        assert_eq!(model.frequency, 0.0);
        assert!(model.std_dev > 0.0);
    }
}
