//! End-to-end fitting of the synthesis pipeline for one asset group.
//!
//! `FittedPipeline::fit` runs the full model chain on a return panel:
//! regime classification on a group driver series, then per-regime per-asset
//! conditional-variance, jump, and block-sampler fits, then per-regime
//! cross-asset copula fits over standardized innovations. Regimes with fewer
//! observations than the configured sufficiency floor keep the pipeline alive
//! by degrading to default models (full-history jump fit, independent
//! dependence, full-history block sampler) instead of failing.

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::bootstrap::BlockSampler;
use crate::core::{InnovationDistribution, ReturnSeries, SimError, SimulationConfig};
use crate::dependence::{CopulaFamily, DependencyModel};
use crate::jump::JumpModel;
use crate::math::{correlation_from_rows, normal_inv_cdf};
use crate::regime::{RegimeModel, classify_regimes};
use crate::synth::{PathSynthesizer, SimulationPath};
use crate::vol::VolModel;

use super::score::{CopulaRecord, DiagnosticsReport, ErrorScore, ScoreWeights};

/// Fully fitted model chain for one asset group, ready to synthesize.
#[derive(Debug)]
pub struct FittedPipeline {
    panel: Vec<ReturnSeries>,
    regime: RegimeModel,
    dependence: Vec<DependencyModel>,
    synthesizer: PathSynthesizer,
}

impl FittedPipeline {
    /// Fits the full pipeline on a return panel.
    ///
    /// Assets share one regime model, fitted on the cross-sectional mean
    /// return (the asset itself when the panel has one asset). Series of
    /// unequal length are truncated to the common minimum before fitting.
    ///
    /// # Errors
    /// Returns `SimError::InvalidInput` for an invalid configuration and
    /// `SimError::DataInsufficiency` when the panel is empty or too short for
    /// the regime feature window.
    pub fn fit(panel: &[ReturnSeries], config: &SimulationConfig) -> Result<Self, SimError> {
        config.validate().map_err(SimError::InvalidInput)?;
        if panel.is_empty() {
            return Err(SimError::DataInsufficiency(
                "pipeline requires at least one asset".to_string(),
            ));
        }
        let min_len = panel.iter().map(ReturnSeries::len).min().unwrap_or(0);
        if min_len == 0 {
            return Err(SimError::DataInsufficiency(
                "every asset needs a non-empty return history".to_string(),
            ));
        }

        let panel: Vec<ReturnSeries> = panel
            .iter()
            .map(|s| ReturnSeries::new(s.asset.clone(), s.returns[..min_len].to_vec()))
            .collect();

        let driver = driver_series(&panel);
        let regime = classify_regimes(&driver, config.regime_feature_window)
            .map_err(SimError::DataInsufficiency)?;

        let family = match config.innovation_distribution {
            InnovationDistribution::Gaussian => CopulaFamily::Gaussian,
            InnovationDistribution::StudentT { .. } => CopulaFamily::StudentT,
        };

        let n_regimes = regime.n_regimes();
        let mut vol = Vec::with_capacity(n_regimes);
        let mut jumps = Vec::with_capacity(n_regimes);
        let mut blocks = Vec::with_capacity(n_regimes);
        let mut dependence = Vec::with_capacity(n_regimes);

        for r in 1..=n_regimes {
            let idx = regime.regime_indices(r);
            let sufficient = idx.len() >= config.regime_sufficiency_floor;

            let mut vol_row = Vec::with_capacity(panel.len());
            let mut jump_row = Vec::with_capacity(panel.len());
            let mut block_row = Vec::with_capacity(panel.len());
            let mut innovations = Vec::with_capacity(panel.len());

            for series in &panel {
                let sub: Vec<f64> = idx.iter().map(|&i| series.returns[i]).collect();

                let model = VolModel::fit(&sub);
                innovations.push(model.innovations.clone());
                vol_row.push(model);

                // A sparse regime borrows its jump behavior from the full
                // history rather than a handful of observations.
                let jump_source: &[f64] = if sufficient { &sub } else { &series.returns };
                jump_row.push(JumpModel::fit(
                    jump_source,
                    config.jump_detection_method,
                    config.jump_threshold,
                ));

                let sampler = BlockSampler::conditioned(
                    &series.returns,
                    &regime.labels,
                    r,
                    config.block_size,
                )
                .or_else(|_| BlockSampler::new(&series.returns, config.block_size))
                .map_err(SimError::SimulationFailure)?;
                block_row.push(sampler);
            }

            dependence.push(if sufficient && panel.len() >= 2 {
                DependencyModel::fit(&innovations, family)
            } else {
                DependencyModel::None
            });
            vol.push(vol_row);
            jumps.push(jump_row);
            blocks.push(block_row);
        }

        let synthesizer =
            PathSynthesizer::new(regime.clone(), vol, jumps, &dependence, blocks, config)?;

        Ok(Self {
            panel,
            regime,
            dependence,
            synthesizer,
        })
    }

    /// Generates `config.n_paths` paths of length `horizon` in parallel.
    ///
    /// # Errors
    /// Propagates synthesis failures as `SimError::SimulationFailure`.
    pub fn synthesize(
        &self,
        horizon: usize,
        config: &SimulationConfig,
    ) -> Result<Vec<SimulationPath>, SimError> {
        self.synthesizer.synthesize(horizon, config)
    }

    /// Sequential twin of [`synthesize`](Self::synthesize).
    ///
    /// # Errors
    /// Propagates synthesis failures as `SimError::SimulationFailure`.
    pub fn synthesize_sequential(
        &self,
        horizon: usize,
        config: &SimulationConfig,
    ) -> Result<Vec<SimulationPath>, SimError> {
        self.synthesizer.synthesize_sequential(horizon, config)
    }

    pub fn regime_model(&self) -> &RegimeModel {
        &self.regime
    }

    /// Regime label sequence shared by every asset in the group.
    pub fn regime_labels(&self) -> &[usize] {
        &self.regime.labels
    }

    /// Per-regime fitted dependency models.
    pub fn dependence(&self) -> &[DependencyModel] {
        &self.dependence
    }

    pub fn asset_names(&self) -> Vec<&str> {
        self.panel.iter().map(|s| s.asset.as_str()).collect()
    }

    /// Historical length the pipeline was fitted on.
    pub fn fitted_len(&self) -> usize {
        self.panel.first().map_or(0, ReturnSeries::len)
    }

    /// Scores simulated paths against the fitted history with unit weights.
    pub fn score(&self, paths: &[SimulationPath], config: &SimulationConfig) -> ErrorScore {
        self.score_with(paths, config, &ScoreWeights::default())
    }

    /// Scores simulated paths with explicit per-fact weights.
    pub fn score_with(
        &self,
        paths: &[SimulationPath],
        config: &SimulationConfig,
        weights: &ScoreWeights,
    ) -> ErrorScore {
        ErrorScore::evaluate(&self.panel, paths, &self.regime, config, weights)
    }

    /// Full diagnostics artifact for one synthesis run, including bounded
    /// draws from each regime's fitted copula.
    pub fn diagnostics(
        &self,
        paths: &[SimulationPath],
        config: &SimulationConfig,
    ) -> DiagnosticsReport {
        let mut report = DiagnosticsReport::build(
            &self.panel,
            paths,
            &self.regime,
            config,
            &ScoreWeights::default(),
        );
        report.copula = self.copula_records(config);
        report
    }

    /// Draws bounded diagnostic samples from each fitted copula and records
    /// the correlation they reproduce. The draw size is capped by the
    /// regime's observation count (at most 1000); regimes without a fit, or
    /// with fewer than 2 observations, are skipped.
    fn copula_records(&self, config: &SimulationConfig) -> Vec<CopulaRecord> {
        let mut rng = StdRng::seed_from_u64(config.random_seed);
        let mut records = Vec::new();
        for (r, model) in self.dependence.iter().enumerate() {
            if matches!(model, DependencyModel::None) {
                continue;
            }
            let rows = self.regime.regime_indices(r + 1).len();
            let Ok(Some(draws)) = model.diagnostic_sample(self.panel.len(), rows, &mut rng)
            else {
                continue;
            };
            let scores: Vec<Vec<f64>> = draws
                .iter()
                .map(|row| row.iter().map(|&u| normal_inv_cdf(u)).collect())
                .collect();
            let Ok(sampled_correlation) = correlation_from_rows(&scores) else {
                continue;
            };
            records.push(CopulaRecord {
                regime: r + 1,
                sample_count: draws.len(),
                sampled_correlation,
            });
        }
        records
    }
}

/// Cross-sectional mean return used as the group's regime driver.
fn driver_series(panel: &[ReturnSeries]) -> Vec<f64> {
    if panel.len() == 1 {
        return panel[0].returns.clone();
    }
    let len = panel[0].len();
    (0..len)
        .map(|t| panel.iter().map(|s| s.returns[t]).sum::<f64>() / panel.len() as f64)
        .collect()
}
