//! Per-regime cross-asset dependency models (copulas over innovations).
//!
//! Innovation sequences arrive with different lengths per asset because
//! assets have different historical coverage. Fitting truncates every
//! sequence to the common minimum, drops rows containing non-finite values,
//! and refuses to fit (tag `None`) below 2 clean rows. Downstream synthesis
//! treats `None` as independent standard-normal sampling.
//!
//! The Student-t degrees of freedom estimated by the fitting routine is a
//! float; it is converted to a positive integer (`round`, floored at 1)
//! before being stored, and re-clamped defensively at sample time, because
//! the sampling routine requires integer degrees of freedom. This is the most
//! consequential correctness rule in the engine.
//!
//! References:
//! - Glasserman (2004) for correlated Monte Carlo simulation.
//! - Demarta and McNeil (2005) for the t copula.

use rand::Rng;
use rand_distr::{ChiSquared, Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::function::gamma::ln_gamma;

use crate::math::{
    cholesky_lower_psd, correlate_normals, correlation_from_rows, normal_cdf, normal_inv_cdf,
    repair_correlation_matrix,
};

/// Copula family requested by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopulaFamily {
    Gaussian,
    StudentT,
}

/// Fitted dependency structure for one regime.
///
/// A tagged variant rather than a record with optional fields: the family is
/// always explicit, and `None` marks a regime whose innovation panel could
/// not support a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DependencyModel {
    Gaussian {
        correlation: Vec<Vec<f64>>,
    },
    StudentT {
        correlation: Vec<Vec<f64>>,
        /// Always a positive integer, regardless of the float estimate the
        /// fitting routine produced.
        degrees_of_freedom: u32,
    },
    None,
}

/// Maximum rows drawn for fitted-copula diagnostics.
const MAX_DIAGNOSTIC_SAMPLES: usize = 1000;

/// Converts a float degrees-of-freedom estimate to the integer the sampler
/// requires: round to nearest, floor at 1.
#[inline]
pub fn clamp_degrees_of_freedom(nu: f64) -> u32 {
    if nu.is_finite() {
        nu.max(1.0).round() as u32
    } else {
        1
    }
}

/// Bounded sample count for diagnostics drawn from a fitted copula:
/// at most 1000, and below 2 the draw is skipped entirely.
#[inline]
pub fn diagnostic_sample_count(rows: usize) -> Option<usize> {
    let n = rows.min(MAX_DIAGNOSTIC_SAMPLES);
    if n >= 2 { Some(n) } else { None }
}

impl DependencyModel {
    /// Fits the configured copula family over per-asset innovation sequences
    /// for one regime.
    ///
    /// Sequences may have different lengths; every sequence is truncated to
    /// the first `min_length` observations. A zero minimum, or fewer than 2
    /// rows surviving the non-finite cleaning, yields `DependencyModel::None`
    /// rather than an error.
    pub fn fit(innovations: &[Vec<f64>], family: CopulaFamily) -> Self {
        if innovations.is_empty() {
            return Self::None;
        }
        let min_len = innovations.iter().map(Vec::len).min().unwrap_or(0);
        if min_len == 0 {
            return Self::None;
        }

        let n_assets = innovations.len();
        let rows: Vec<Vec<f64>> = (0..min_len)
            .map(|t| innovations.iter().map(|series| series[t]).collect())
            .filter(|row: &Vec<f64>| row.iter().all(|x| x.is_finite()))
            .collect();
        if rows.len() < 2 {
            return Self::None;
        }

        // Copula correlation is estimated on normal scores of the ranks so
        // heavy-tailed marginals do not distort it.
        let scores = normal_scores(&rows, n_assets);
        let correlation = match correlation_from_rows(&scores) {
            Ok(corr) => repair_correlation_matrix(&corr).0,
            Err(_) => return Self::None,
        };

        match family {
            CopulaFamily::Gaussian => Self::Gaussian { correlation },
            CopulaFamily::StudentT => {
                let nu_estimate = estimate_t_degrees_of_freedom(&scores, &correlation);
                Self::StudentT {
                    correlation,
                    degrees_of_freedom: clamp_degrees_of_freedom(nu_estimate),
                }
            }
        }
    }

    /// Prepares a reusable sampler (Cholesky factor, cached marginals).
    ///
    /// # Errors
    /// Returns an error when the stored correlation cannot be factorized
    /// even after PSD repair.
    pub fn sampler(&self) -> Result<CopulaSampler, String> {
        match self {
            Self::None => Ok(CopulaSampler {
                chol: Vec::new(),
                kind: SamplerKind::Independent,
            }),
            Self::Gaussian { correlation } => Ok(CopulaSampler {
                chol: factorize(correlation)?,
                kind: SamplerKind::Gaussian,
            }),
            Self::StudentT {
                correlation,
                degrees_of_freedom,
            } => {
                // Defensive re-clamp: models may have been loaded from a
                // stale source with a zero df.
                let df = (*degrees_of_freedom).max(1);
                let t_dist = StudentsT::new(0.0, 1.0, f64::from(df))
                    .map_err(|e| format!("invalid student-t degrees of freedom {df}: {e}"))?;
                Ok(CopulaSampler {
                    chol: factorize(correlation)?,
                    kind: SamplerKind::StudentT { df, t_dist },
                })
            }
        }
    }

    /// Draws `n_samples` correlated uniform vectors from the fitted copula.
    ///
    /// `None` models yield independent uniforms, matching the i.i.d.
    /// standard-normal treatment downstream synthesis applies.
    ///
    /// # Errors
    /// Propagates sampler construction failures.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n_assets: usize,
        n_samples: usize,
        rng: &mut R,
    ) -> Result<Vec<Vec<f64>>, String> {
        let sampler = self.sampler()?;
        let mut out = Vec::with_capacity(n_samples);
        let mut draw = vec![0.0; n_assets];
        for _ in 0..n_samples {
            sampler.draw_uniforms(rng, &mut draw);
            out.push(draw.clone());
        }
        Ok(out)
    }

    /// Bounded diagnostic draw from the fitted copula.
    ///
    /// `rows` is the observation count backing the fit; the draw size is
    /// capped at 1000 and the draw is skipped entirely (`Ok(None)`) below 2
    /// rows, mirroring [`diagnostic_sample_count`].
    ///
    /// # Errors
    /// Propagates sampler construction failures.
    pub fn diagnostic_sample<R: Rng + ?Sized>(
        &self,
        n_assets: usize,
        rows: usize,
        rng: &mut R,
    ) -> Result<Option<Vec<Vec<f64>>>, String> {
        match diagnostic_sample_count(rows) {
            Some(n) => self.sample(n_assets, n, rng).map(Some),
            None => Ok(None),
        }
    }
}

fn factorize(correlation: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, String> {
    let (repaired, _) = repair_correlation_matrix(correlation);
    cholesky_lower_psd(&repaired, 1.0e-10)
        .ok_or_else(|| "correlation matrix could not be factorized".to_string())
}

#[derive(Debug)]
enum SamplerKind {
    Independent,
    Gaussian,
    StudentT { df: u32, t_dist: StudentsT },
}

/// Reusable correlated-uniform sampler for one fitted dependency model.
#[derive(Debug)]
pub struct CopulaSampler {
    chol: Vec<Vec<f64>>,
    kind: SamplerKind,
}

impl CopulaSampler {
    /// Fills `out` with one correlated uniform vector.
    pub fn draw_uniforms<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f64]) {
        match &self.kind {
            SamplerKind::Independent => {
                for u in out.iter_mut() {
                    *u = clamp_open01(rng.random());
                }
            }
            SamplerKind::Gaussian => {
                let z = self.correlated_normals(rng, out.len());
                for (u, &zi) in out.iter_mut().zip(z.iter()) {
                    *u = clamp_open01(normal_cdf(zi));
                }
            }
            SamplerKind::StudentT { df, t_dist } => {
                let z = self.correlated_normals(rng, out.len());
                // Integer df is guaranteed by construction; ChiSquared only
                // needs it to be a positive float.
                let chi = ChiSquared::new(f64::from((*df).max(1)))
                    .expect("positive chi-squared degrees of freedom");
                let w: f64 = chi.sample(rng) / f64::from((*df).max(1));
                let scale = 1.0 / w.max(1.0e-12).sqrt();
                for (u, &zi) in out.iter_mut().zip(z.iter()) {
                    *u = clamp_open01(t_dist.cdf(zi * scale));
                }
            }
        }
    }

    fn correlated_normals<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<f64> {
        let mut indep = vec![0.0; n];
        for z in &mut indep {
            *z = StandardNormal.sample(rng);
        }
        if self.chol.len() == n {
            let mut out = vec![0.0; n];
            correlate_normals(&self.chol, &indep, &mut out);
            out
        } else {
            indep
        }
    }
}

#[inline]
fn clamp_open01(u: f64) -> f64 {
    u.clamp(1.0e-15, 1.0 - 1.0e-15)
}

/// Rank-based normal scores per asset column.
fn normal_scores(rows: &[Vec<f64>], n_assets: usize) -> Vec<Vec<f64>> {
    let n = rows.len();
    let mut scores = vec![vec![0.0; n_assets]; n];
    for a in 0..n_assets {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&i, &j| rows[i][a].total_cmp(&rows[j][a]));
        for (rank, &row_idx) in order.iter().enumerate() {
            let u = (rank as f64 + 0.5) / n as f64;
            scores[row_idx][a] = normal_inv_cdf(u);
        }
    }
    scores
}

/// Profile-likelihood grid estimate of the t-copula degrees of freedom.
///
/// Evaluates the multivariate-t log-likelihood of the normal scores on a
/// half-step grid over `[2, 30]` and returns the (generally non-integer)
/// maximizer. Falls back to 10 when no candidate is finite.
fn estimate_t_degrees_of_freedom(scores: &[Vec<f64>], correlation: &[Vec<f64>]) -> f64 {
    let Some(chol) = cholesky_lower_psd(correlation, 1.0e-10) else {
        return 10.0;
    };
    let d = correlation.len() as f64;
    let log_det: f64 = chol.iter().enumerate().map(|(i, row)| 2.0 * row[i].ln()).sum();

    let mut best = (f64::NEG_INFINITY, 10.0);
    let mut step = 0;
    while step <= 56 {
        let nu = 2.0 + step as f64 * 0.5;
        let mut ll = 0.0;
        for row in scores {
            let q = mahalanobis_sq(&chol, row);
            ll += ln_gamma((nu + d) * 0.5) - ln_gamma(nu * 0.5)
                - 0.5 * d * (nu * std::f64::consts::PI).ln()
                - 0.5 * log_det
                - 0.5 * (nu + d) * (1.0 + q / nu).ln();
        }
        if ll.is_finite() && ll > best.0 {
            best = (ll, nu);
        }
        step += 1;
    }
    best.1
}

/// Quadratic form `x^T R^{-1} x` via forward substitution on the Cholesky factor.
fn mahalanobis_sq(chol: &[Vec<f64>], x: &[f64]) -> f64 {
    let n = x.len();
    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = x[i];
        for k in 0..i {
            sum -= chol[i][k] * y[k];
        }
        y[i] = sum / chol[i][i].max(1.0e-12);
    }
    y.iter().map(|v| v * v).sum()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn correlated_panel(n: usize, rho: f64, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut a = Vec::with_capacity(n);
        let mut b = Vec::with_capacity(n);
        for _ in 0..n {
            let z1: f64 = StandardNormal.sample(&mut rng);
            let z2: f64 = StandardNormal.sample(&mut rng);
            a.push(z1);
            b.push(rho * z1 + (1.0 - rho * rho).sqrt() * z2);
        }
        vec![a, b]
    }

    #[test]
    fn unequal_lengths_truncate_to_common_minimum() {
        let mut panel = correlated_panel(1100, 0.6, 5);
        panel[0].truncate(1000);
        panel.push(panel[0][..900].to_vec());

        // Mirror of the fit's internal assembly: 900 rows, 3 columns.
        let min_len = panel.iter().map(Vec::len).min().unwrap();
        assert_eq!(min_len, 900);

        let model = DependencyModel::fit(&panel, CopulaFamily::Gaussian);
        match model {
            DependencyModel::Gaussian { correlation } => {
                assert_eq!(correlation.len(), 3);
            }
            other => panic!("expected a Gaussian fit, got {other:?}"),
        }
    }

    #[test]
    fn empty_and_tiny_panels_yield_none() {
        assert_eq!(
            DependencyModel::fit(&[], CopulaFamily::Gaussian),
            DependencyModel::None
        );
        assert_eq!(
            DependencyModel::fit(&[vec![], vec![1.0, 2.0]], CopulaFamily::Gaussian),
            DependencyModel::None
        );
        assert_eq!(
            DependencyModel::fit(&[vec![0.5], vec![0.2]], CopulaFamily::StudentT),
            DependencyModel::None
        );
    }

    #[test]
    fn non_finite_rows_are_dropped_before_fitting() {
        let mut panel = correlated_panel(200, 0.5, 7);
        panel[0][10] = f64::NAN;
        panel[1][20] = f64::INFINITY;
        let model = DependencyModel::fit(&panel, CopulaFamily::Gaussian);
        assert!(matches!(model, DependencyModel::Gaussian { .. }));
    }

    #[test]
    fn student_t_df_is_always_a_positive_integer() {
        for &nu in &[2.5_f64, 3.7, 1.1, 0.8, 10.9, 2.0, 3.0, f64::NAN] {
            let df = clamp_degrees_of_freedom(nu);
            assert!(df >= 1, "nu = {nu} produced df = {df}");
        }

        let panel = correlated_panel(600, 0.4, 9);
        let model = DependencyModel::fit(&panel, CopulaFamily::StudentT);
        match model {
            DependencyModel::StudentT {
                degrees_of_freedom, ..
            } => assert!(degrees_of_freedom >= 1),
            other => panic!("expected a StudentT fit, got {other:?}"),
        }
    }

    #[test]
    fn stale_zero_df_is_reclamped_at_sample_time() {
        let model = DependencyModel::StudentT {
            correlation: vec![vec![1.0, 0.3], vec![0.3, 1.0]],
            degrees_of_freedom: 0,
        };
        let mut rng = StdRng::seed_from_u64(21);
        let draws = model.sample(2, 16, &mut rng).unwrap();
        assert_eq!(draws.len(), 16);
        assert!(draws.iter().flatten().all(|u| (0.0..1.0).contains(u)));
    }

    #[test]
    fn gaussian_samples_preserve_positive_dependence() {
        let panel = correlated_panel(2000, 0.8, 11);
        let model = DependencyModel::fit(&panel, CopulaFamily::Gaussian);
        let mut rng = StdRng::seed_from_u64(13);
        let draws = model.sample(2, 4000, &mut rng).unwrap();

        let z: Vec<Vec<f64>> = draws
            .iter()
            .map(|row| row.iter().map(|&u| normal_inv_cdf(u)).collect())
            .collect();
        let corr = correlation_from_rows(&z).unwrap();
        assert!(corr[0][1] > 0.6, "sampled correlation {}", corr[0][1]);
    }

    #[test]
    fn none_model_samples_independent_uniforms() {
        let mut rng = StdRng::seed_from_u64(17);
        let draws = DependencyModel::None.sample(3, 8, &mut rng).unwrap();
        assert_eq!(draws.len(), 8);
        assert!(draws.iter().all(|row| row.len() == 3));
    }

    #[test]
    fn diagnostic_sample_count_is_bounded() {
        assert_eq!(diagnostic_sample_count(0), None);
        assert_eq!(diagnostic_sample_count(1), None);
        assert_eq!(diagnostic_sample_count(50), Some(50));
        assert_eq!(diagnostic_sample_count(5000), Some(1000));
    }

    #[test]
    fn diagnostic_draw_is_capped_and_skipped_below_two_rows() {
        let panel = correlated_panel(300, 0.5, 19);
        let model = DependencyModel::fit(&panel, CopulaFamily::Gaussian);
        let mut rng = StdRng::seed_from_u64(23);

        let capped = model.diagnostic_sample(2, 5000, &mut rng).unwrap().unwrap();
        assert_eq!(capped.len(), 1000);
        assert!(capped.iter().all(|row| row.len() == 2));

        let small = model.diagnostic_sample(2, 7, &mut rng).unwrap().unwrap();
        assert_eq!(small.len(), 7);

        assert!(model.diagnostic_sample(2, 1, &mut rng).unwrap().is_none());
    }
}
