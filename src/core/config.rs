use serde::{Deserialize, Serialize};

use crate::core::types::{
    AnchorMode, InnovationDistribution, JumpDetectionMethod, JumpSizeSource, RegimeModulation,
};

/// Immutable per-trial pipeline configuration.
///
/// One value is constructed per calibration trial and passed by reference
/// down the call chain; nothing in the pipeline mutates shared configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Time steps per resampled block in the block bootstrap.
    pub block_size: usize,
    /// Weight in `[0, 1]` of the block-bootstrapped return blended into each
    /// synthesized step; 0 disables the bootstrap entirely.
    pub block_blend_weight: f64,
    /// Jump threshold: std-multiplier or percentile, per `jump_detection_method`.
    pub jump_threshold: f64,
    pub jump_detection_method: JumpDetectionMethod,
    pub jump_size_source: JumpSizeSource,
    /// Marginal distribution for copula-driven innovations.
    pub innovation_distribution: InnovationDistribution,
    pub regime_modulation: RegimeModulation,
    /// Rolling window (steps) for the regime classifier's volatility feature.
    pub regime_feature_window: usize,
    /// Minimum observations a regime needs for full per-regime fitting;
    /// sparser regimes degrade to identity/default fallbacks.
    pub regime_sufficiency_floor: usize,
    /// Monte Carlo draws per synthesis run.
    pub n_paths: usize,
    /// Base seed for all random streams.
    pub random_seed: u64,
    /// Optional external anchor level the cumulative path is rescaled to.
    pub anchor: Option<f64>,
    pub anchor_mode: AnchorMode,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            block_size: 24,
            block_blend_weight: 0.0,
            jump_threshold: 3.0,
            jump_detection_method: JumpDetectionMethod::StdMultiplier,
            jump_size_source: JumpSizeSource::Empirical,
            innovation_distribution: InnovationDistribution::Gaussian,
            regime_modulation: RegimeModulation::default(),
            regime_feature_window: 24,
            regime_sufficiency_floor: 50,
            n_paths: 100,
            random_seed: 42,
            anchor: None,
            anchor_mode: AnchorMode::Multiplicative,
        }
    }
}

impl SimulationConfig {
    /// Validates option ranges.
    ///
    /// # Errors
    /// Returns a message describing the first offending option.
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size == 0 {
            return Err("block_size must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.block_blend_weight) {
            return Err("block_blend_weight must be in [0, 1]".to_string());
        }
        if !self.jump_threshold.is_finite() || self.jump_threshold < 0.0 {
            return Err("jump_threshold must be finite and >= 0".to_string());
        }
        if matches!(self.jump_detection_method, JumpDetectionMethod::Percentile)
            && !(0.0 < self.jump_threshold && self.jump_threshold < 100.0)
        {
            return Err("percentile jump_threshold must be in (0, 100)".to_string());
        }
        if let InnovationDistribution::StudentT { degrees_of_freedom } =
            self.innovation_distribution
        {
            if degrees_of_freedom < 1 {
                return Err("innovation degrees_of_freedom must be >= 1".to_string());
            }
        }
        let m = &self.regime_modulation;
        if !m.amplification_factor.is_finite() || m.amplification_factor <= 0.0 {
            return Err("amplification_factor must be finite and > 0".to_string());
        }
        if !m.max_vol_ratio.is_finite() || m.max_vol_ratio < 1.0 {
            return Err("max_vol_ratio must be finite and >= 1".to_string());
        }
        if self.regime_feature_window < 2 {
            return Err("regime_feature_window must be >= 2".to_string());
        }
        if self.n_paths == 0 {
            return Err("n_paths must be >= 1".to_string());
        }
        if let Some(anchor) = self.anchor {
            if !anchor.is_finite() {
                return Err("anchor must be finite".to_string());
            }
        }
        Ok(())
    }
}
