//! Shared statistics and linear-algebra helpers for the synthesis pipeline.
//!
//! This module includes:
//! - sample moments and excess kurtosis,
//! - rolling volatility and EWMA volatility (RiskMetrics recursion),
//! - autocorrelation,
//! - empirical quantiles and the two-sample Kolmogorov-Smirnov statistic,
//! - normal pdf/cdf and inverse cdf,
//! - correlation estimation with eigenvalue-clipping PSD repair, Cholesky
//!   factorization, and correlated-normal transforms.
//!
//! References:
//! - J.P. Morgan/Reuters, *RiskMetrics Technical Document* (1996), EWMA.
//! - Abramowitz and Stegun 7.1.26 for the normal cdf approximation.
//! - Acklam (2003) rational approximation of the normal inverse cdf.
//! - Higham (2002) for nearest-correlation PSD repair.

use nalgebra::{DMatrix, SymmetricEigen};

pub const MIN_STD: f64 = 1.0e-12;

/// Arithmetic mean.
///
/// # Panics
/// Panics on an empty slice.
pub fn sample_mean(values: &[f64]) -> f64 {
    assert!(!values.is_empty(), "values must not be empty");
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased sample variance (denominator `n - 1`).
///
/// # Panics
/// Panics with fewer than 2 observations.
pub fn sample_variance(values: &[f64]) -> f64 {
    assert!(values.len() >= 2, "at least 2 observations are required");
    let mean = sample_mean(values);
    let mut sum = 0.0;
    for &x in values {
        let d = x - mean;
        sum += d * d;
    }
    sum / (values.len() as f64 - 1.0)
}

pub fn sample_std_dev(values: &[f64]) -> f64 {
    sample_variance(values).max(0.0).sqrt()
}

/// Excess kurtosis `m4 / m2^2 - 3`, or 0 for a degenerate series.
pub fn excess_kurtosis(values: &[f64]) -> f64 {
    if values.len() < 4 {
        return 0.0;
    }
    let mean = sample_mean(values);
    let n = values.len() as f64;
    let mut m2 = 0.0;
    let mut m4 = 0.0;
    for &x in values {
        let d = x - mean;
        let d2 = d * d;
        m2 += d2;
        m4 += d2 * d2;
    }
    m2 /= n;
    m4 /= n;
    if m2 <= MIN_STD * MIN_STD {
        0.0
    } else {
        m4 / (m2 * m2) - 3.0
    }
}

/// Rolling sample standard deviation over fixed-size windows.
///
/// Returns `series.len() - window + 1` values.
///
/// # Panics
/// Panics if `window < 2` or `window > series.len()`.
pub fn rolling_std_dev(series: &[f64], window: usize) -> Vec<f64> {
    assert!(window >= 2, "window must be >= 2 for standard deviation");
    assert!(window <= series.len(), "window must be <= series length");
    series.windows(window).map(sample_std_dev).collect()
}

/// RiskMetrics-style EWMA volatility series.
///
/// Recursion: `sigma_t^2 = lambda * sigma_{t-1}^2 + (1 - lambda) * r_t^2`,
/// seeded with the sample variance. Output length equals input length.
///
/// # Panics
/// Panics if `returns` has fewer than 2 values or `lambda` is outside `[0, 1)`.
pub fn ewma_volatility(returns: &[f64], lambda: f64) -> Vec<f64> {
    assert!(returns.len() >= 2, "returns must have at least 2 values");
    assert!(
        lambda.is_finite() && (0.0..1.0).contains(&lambda),
        "lambda must be finite and in [0,1)"
    );

    let mut v = sample_variance(returns).max(MIN_STD * MIN_STD);
    let mut out = Vec::with_capacity(returns.len());
    for &r in returns {
        v = lambda * v + (1.0 - lambda) * r * r;
        out.push(v.max(0.0).sqrt());
    }
    out
}

/// Autocorrelation function up to `max_lag`; lag 0 is 1.
///
/// Degenerate (constant) series yield zeros beyond lag 0. Lags at or beyond
/// the series length are zero.
pub fn autocorrelation(series: &[f64], max_lag: usize) -> Vec<f64> {
    let mut acf = vec![0.0; max_lag + 1];
    acf[0] = 1.0;
    if series.len() < 2 {
        return acf;
    }

    let n = series.len();
    let mean = sample_mean(series);
    let mut denom = 0.0;
    for &x in series {
        let d = x - mean;
        denom += d * d;
    }
    if denom <= MIN_STD * MIN_STD {
        return acf;
    }

    for (lag, slot) in acf.iter_mut().enumerate().take(max_lag + 1).skip(1) {
        if lag >= n {
            break;
        }
        let mut num = 0.0;
        for t in lag..n {
            num += (series[t] - mean) * (series[t - lag] - mean);
        }
        *slot = num / denom;
    }
    acf
}

/// Empirical quantile by linear interpolation, `p` in `[0, 1]`.
///
/// # Panics
/// Panics on an empty slice.
pub fn empirical_quantile(values: &[f64], p: f64) -> f64 {
    assert!(!values.is_empty(), "values must not be empty");
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let p = p.clamp(0.0, 1.0);
    let pos = p * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let w = pos - lo as f64;
        sorted[lo] * (1.0 - w) + sorted[hi] * w
    }
}

/// Two-sample Kolmogorov-Smirnov statistic `sup |F_a - F_b|`.
///
/// Returns 1.0 when either sample is empty, treating a missing distribution
/// as maximally distant.
pub fn ks_statistic(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 1.0;
    }

    let mut sa = a.to_vec();
    let mut sb = b.to_vec();
    sa.sort_by(|x, y| x.total_cmp(y));
    sb.sort_by(|x, y| x.total_cmp(y));

    let (mut i, mut j) = (0usize, 0usize);
    let mut d: f64 = 0.0;
    while i < sa.len() && j < sb.len() {
        let x = sa[i].min(sb[j]);
        while i < sa.len() && sa[i] <= x {
            i += 1;
        }
        while j < sb.len() && sb[j] <= x {
            j += 1;
        }
        let fa = i as f64 / sa.len() as f64;
        let fb = j as f64 / sb.len() as f64;
        d = d.max((fa - fb).abs());
    }
    d
}

pub fn normal_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

pub fn normal_cdf(x: f64) -> f64 {
    // Abramowitz & Stegun 7.1.26
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.231_641_9 * z);
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782
                + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let approx = 1.0 - normal_pdf(z) * poly;
    if x >= 0.0 { approx } else { 1.0 - approx }
}

/// Inverse standard-normal cdf (Acklam's rational approximation).
///
/// Input is clamped away from {0, 1}; accuracy is ~1e-9 over the open
/// interval, sufficient for Monte Carlo marginals.
pub fn normal_inv_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_690e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.024_25;

    let p = p.clamp(1.0e-15, 1.0 - 1.0e-15);

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Sample correlation matrix from row-observations (`data[row][column]`).
///
/// Degenerate columns correlate at 0 with everything else.
///
/// # Errors
/// Returns an error when rows are empty or ragged.
pub fn correlation_from_rows(data: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, String> {
    if data.is_empty() || data[0].is_empty() {
        return Err("correlation requires a non-empty observation matrix".to_string());
    }
    let n_cols = data[0].len();
    if data.iter().any(|row| row.len() != n_cols) {
        return Err("correlation requires rectangular observation rows".to_string());
    }
    let n_rows = data.len();
    if n_rows < 2 {
        return Err("correlation requires at least 2 observation rows".to_string());
    }

    let mut means = vec![0.0; n_cols];
    for row in data {
        for (j, &x) in row.iter().enumerate() {
            means[j] += x;
        }
    }
    for m in &mut means {
        *m /= n_rows as f64;
    }

    let mut cov = vec![vec![0.0; n_cols]; n_cols];
    for row in data {
        for i in 0..n_cols {
            let di = row[i] - means[i];
            for j in i..n_cols {
                cov[i][j] += di * (row[j] - means[j]);
            }
        }
    }

    let mut corr = vec![vec![0.0; n_cols]; n_cols];
    for i in 0..n_cols {
        corr[i][i] = 1.0;
        for j in (i + 1)..n_cols {
            let denom = (cov[i][i] * cov[j][j]).max(MIN_STD * MIN_STD).sqrt();
            let rho = (cov[i][j] / denom).clamp(-1.0, 1.0);
            corr[i][j] = rho;
            corr[j][i] = rho;
        }
    }
    Ok(corr)
}

/// Repairs a correlation matrix to positive semi-definiteness by eigenvalue
/// clipping and unit-diagonal renormalization.
///
/// Returns `(repaired, was_repaired)`.
pub fn repair_correlation_matrix(corr: &[Vec<f64>]) -> (Vec<Vec<f64>>, bool) {
    let n = corr.len();
    let mut data = Vec::with_capacity(n * n);
    for row in corr {
        data.extend_from_slice(row);
    }
    let m = DMatrix::from_row_slice(n, n, &data);

    let eig = SymmetricEigen::new(m.clone());
    let min_ev = eig.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if min_ev > 1.0e-10 {
        return (corr.to_vec(), false);
    }

    let clipped = DMatrix::from_diagonal(&eig.eigenvalues.map(|ev| ev.max(1.0e-8)));
    let repaired = &eig.eigenvectors * clipped * eig.eigenvectors.transpose();

    // Renormalize to a unit diagonal.
    let mut out = vec![vec![0.0; n]; n];
    for i in 0..n {
        out[i][i] = 1.0;
        for j in (i + 1)..n {
            let denom = (repaired[(i, i)] * repaired[(j, j)]).max(MIN_STD).sqrt();
            let rho = (repaired[(i, j)] / denom).clamp(-1.0, 1.0);
            out[i][j] = rho;
            out[j][i] = rho;
        }
    }
    (out, true)
}

/// Lower-triangular Cholesky factor with diagonal jitter for PSD matrices.
///
/// Returns `None` when the matrix cannot be factorized even after jitter.
pub fn cholesky_lower_psd(matrix: &[Vec<f64>], jitter: f64) -> Option<Vec<Vec<f64>>> {
    let n = matrix.len();
    if n == 0 || matrix.iter().any(|row| row.len() != n) {
        return None;
    }

    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }
            if i == j {
                let d = sum + jitter;
                if d <= 0.0 || !d.is_finite() {
                    return None;
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }
    Some(l)
}

/// Applies a lower Cholesky factor to independent normals: `out = L * z`.
pub fn correlate_normals(chol: &[Vec<f64>], indep: &[f64], out: &mut [f64]) {
    for (i, slot) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (k, &z) in indep.iter().enumerate().take(i + 1) {
            acc += chol[i][k] * z;
        }
        *slot = acc;
    }
}

/// Frobenius-norm distance between two equally shaped matrices.
pub fn frobenius_distance(a: &[Vec<f64>], b: &[Vec<f64>]) -> f64 {
    let mut sum = 0.0;
    for (ra, rb) in a.iter().zip(b.iter()) {
        for (&x, &y) in ra.iter().zip(rb.iter()) {
            let d = x - y;
            sum += d * d;
        }
    }
    sum.sqrt()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, StandardNormal};

    use super::*;

    #[test]
    fn ewma_matches_manual_recursion() {
        let r = vec![0.01, -0.02, 0.015, -0.005, 0.03];
        let lambda = 0.94;
        let ew = ewma_volatility(&r, lambda);

        let mut v = sample_variance(&r);
        for i in 0..r.len() {
            v = lambda * v + (1.0 - lambda) * r[i] * r[i];
            assert_relative_eq!(ew[i], v.sqrt(), epsilon = 1.0e-14);
        }
    }

    #[test]
    fn acf_of_persistent_series_is_positive_at_lag_one() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut x = vec![0.0; 4000];
        for t in 1..x.len() {
            let eps: f64 = StandardNormal.sample(&mut rng);
            x[t] = 0.7 * x[t - 1] + eps;
        }
        let acf = autocorrelation(&x, 5);
        assert_relative_eq!(acf[0], 1.0, epsilon = 1.0e-12);
        assert!((acf[1] - 0.7).abs() < 0.05);
    }

    #[test]
    fn acf_of_degenerate_series_is_zero_beyond_lag_zero() {
        let acf = autocorrelation(&[1.0; 50], 4);
        assert_eq!(acf[0], 1.0);
        assert!(acf[1..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn normal_inverse_cdf_roundtrips() {
        for &p in &[0.001, 0.025, 0.2, 0.5, 0.8, 0.975, 0.999] {
            let z = normal_inv_cdf(p);
            assert!((normal_cdf(z) - p).abs() < 1.0e-6, "p = {p}");
        }
        assert_relative_eq!(normal_inv_cdf(0.5), 0.0, epsilon = 1.0e-9);
    }

    #[test]
    fn ks_statistic_separates_shifted_samples() {
        let a: Vec<f64> = (0..500).map(|i| i as f64 / 500.0).collect();
        let b: Vec<f64> = a.iter().map(|x| x + 0.5).collect();
        let same = ks_statistic(&a, &a);
        let shifted = ks_statistic(&a, &b);
        assert!(same < 1.0e-12);
        assert!(shifted > 0.45);
        assert_eq!(ks_statistic(&a, &[]), 1.0);
    }

    #[test]
    fn correlation_repair_yields_factorizable_matrix() {
        let bad = vec![
            vec![1.0, 0.95, 0.95],
            vec![0.95, 1.0, -0.95],
            vec![0.95, -0.95, 1.0],
        ];
        let (fixed, was_repaired) = repair_correlation_matrix(&bad);
        assert!(was_repaired);
        assert!(cholesky_lower_psd(&fixed, 1.0e-10).is_some());
        for i in 0..3 {
            assert_relative_eq!(fixed[i][i], 1.0, epsilon = 1.0e-12);
        }
    }

    #[test]
    fn correlated_normals_follow_cholesky_factor() {
        let corr = vec![vec![1.0, 0.8], vec![0.8, 1.0]];
        let chol = cholesky_lower_psd(&corr, 0.0).unwrap();
        let indep = [1.0, -1.0];
        let mut out = [0.0; 2];
        correlate_normals(&chol, &indep, &mut out);
        assert_relative_eq!(out[0], 1.0, epsilon = 1.0e-12);
        assert_relative_eq!(out[1], 0.8 - 0.6, epsilon = 1.0e-12);
    }

    #[test]
    fn empirical_quantile_interpolates() {
        let v = vec![4.0, 1.0, 3.0, 2.0];
        assert_relative_eq!(empirical_quantile(&v, 0.0), 1.0);
        assert_relative_eq!(empirical_quantile(&v, 1.0), 4.0);
        assert_relative_eq!(empirical_quantile(&v, 0.5), 2.5);
    }
}
