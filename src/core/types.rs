use serde::{Deserialize, Serialize};

/// One asset's cleaned, time-aligned return series.
///
/// Produced by the external data-preparation collaborator; immutable input to
/// the pipeline. All series in a panel share one implicit time axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnSeries {
    /// Asset identifier (for example `"hubPrices"`).
    pub asset: String,
    /// Ordered per-step returns.
    pub returns: Vec<f64>,
}

impl ReturnSeries {
    pub fn new(asset: impl Into<String>, returns: Vec<f64>) -> Self {
        Self {
            asset: asset.into(),
            returns,
        }
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }
}

/// Jump detection rule applied per regime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum JumpDetectionMethod {
    /// An observation is a jump when `|r| > threshold * regime_std`.
    StdMultiplier,
    /// An observation is a jump when `|r|` exceeds the `threshold` percentile
    /// (in `(0, 100)`) of absolute returns within the regime.
    Percentile,
}

/// Source of injected jump sizes during synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpSizeSource {
    /// Resample historical jump sizes with replacement.
    Empirical,
    /// Draw from the fitted normal `(mean, std_dev)`.
    Parametric,
}

/// Marginal distribution applied to copula uniforms during synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InnovationDistribution {
    Gaussian,
    /// Standardized Student-t with integer degrees of freedom >= 3, so the
    /// marginal has unit variance and vol scaling is not double-counted.
    StudentT { degrees_of_freedom: u32 },
}

/// How a synthesized path is rescaled to an external target level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum AnchorMode {
    /// Multiply the whole path so its final value equals the target.
    Multiplicative,
    /// Shift the whole path so its final value equals the target.
    Additive,
}

/// Regime volatility amplification with a runaway-variance guard.
///
/// The amplification factor is applied first; the effective per-step
/// volatility is then clamped to `max_vol_ratio` times the unamplified
/// baseline sigma for that step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeModulation {
    pub amplification_factor: f64,
    pub max_vol_ratio: f64,
}

impl Default for RegimeModulation {
    fn default() -> Self {
        Self {
            amplification_factor: 1.0,
            max_vol_ratio: 3.0,
        }
    }
}
