//! Derivative-free outer parameter search.
//!
//! The calibrator searches a bounded box over the synthesis parameters
//! (block size, innovation degrees of freedom, jump threshold, regime
//! amplification) for the configuration minimizing the stylized-fact error
//! score. A differential-evolution stage explores globally and a Nelder-Mead
//! stage refines the incumbent; both respect the box by clamping and stop on
//! a shared evaluation budget. Every evaluation is recorded as a trial, and
//! any failure inside an evaluation is converted to a sentinel-scored `Fail`
//! trial, so the search itself never observes an error.
//!
//! References:
//! - Storn and Price (1997), Differential Evolution.
//! - Nelder and Mead (1965), simplex direct search.

use std::io::Write;
use std::path::Path;

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::{InnovationDistribution, ReturnSeries, SimError, SimulationConfig};

use super::pipeline::FittedPipeline;
use super::score::{ErrorScore, SENTINEL_PENALTY, ScoreComponents, ScoreWeights};

/// Box constraints `lower <= x <= upper` enforced by clamping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxConstraints {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl BoxConstraints {
    /// # Errors
    /// Returns a message for empty, mismatched, or inverted bounds.
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self, String> {
        if lower.is_empty() || lower.len() != upper.len() {
            return Err("constraints require same non-zero lower/upper dimensions".to_string());
        }
        for i in 0..lower.len() {
            if !lower[i].is_finite() || !upper[i].is_finite() || lower[i] > upper[i] {
                return Err(format!(
                    "invalid bound at index {i}: [{}, {}]",
                    lower[i], upper[i]
                ));
            }
        }
        Ok(Self { lower, upper })
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.lower.len()
    }

    pub fn clamp(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .enumerate()
            .map(|(i, v)| v.clamp(self.lower[i], self.upper[i]))
            .collect()
    }
}

/// One point of the searched parameter box, in pipeline units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub block_size: usize,
    pub degrees_of_freedom: u32,
    pub jump_threshold: f64,
    pub amplification_factor: f64,
}

impl CalibrationParams {
    /// Decodes an optimizer vector `[block, df, threshold, amplification]`,
    /// rounding the integer coordinates.
    pub fn from_vector(x: &[f64]) -> Self {
        Self {
            block_size: x[0].round().max(1.0) as usize,
            degrees_of_freedom: x[1].round().max(1.0) as u32,
            jump_threshold: x[2].max(0.0),
            amplification_factor: x[3].max(1.0e-6),
        }
    }

    /// Overlays these parameters on a base configuration.
    ///
    /// The innovation marginal becomes Student-t with the searched degrees of
    /// freedom; every option the search does not own is taken from the base.
    pub fn apply(&self, base: &SimulationConfig) -> SimulationConfig {
        let mut config = base.clone();
        config.block_size = self.block_size;
        config.jump_threshold = self.jump_threshold;
        config.innovation_distribution = InnovationDistribution::StudentT {
            degrees_of_freedom: self.degrees_of_freedom,
        };
        config.regime_modulation.amplification_factor = self.amplification_factor;
        config
    }
}

/// Outcome tag of one evaluated trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Ok,
    Fail,
}

/// One recorded evaluation of the objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTrial {
    pub params: CalibrationParams,
    pub score: f64,
    /// Absent for failed trials.
    pub components: Option<ScoreComponents>,
    pub status: TrialStatus,
}

/// Search-box bounds per parameter, `(lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchBounds {
    pub block_size: (f64, f64),
    pub degrees_of_freedom: (f64, f64),
    pub jump_threshold: (f64, f64),
    pub amplification_factor: (f64, f64),
}

impl Default for SearchBounds {
    fn default() -> Self {
        Self {
            block_size: (2.0, 200.0),
            degrees_of_freedom: (3.0, 30.0),
            jump_threshold: (1.0, 8.0),
            amplification_factor: (0.5, 5.0),
        }
    }
}

impl SearchBounds {
    fn constraints(&self) -> Result<BoxConstraints, String> {
        BoxConstraints::new(
            vec![
                self.block_size.0,
                self.degrees_of_freedom.0,
                self.jump_threshold.0,
                self.amplification_factor.0,
            ],
            vec![
                self.block_size.1,
                self.degrees_of_freedom.1,
                self.jump_threshold.1,
                self.amplification_factor.1,
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratorOptions {
    pub bounds: SearchBounds,
    /// Synthesis horizon per trial; the fitted history length when `None`.
    pub horizon: Option<usize>,
    /// Shared evaluation budget across both search stages.
    pub max_evaluations: usize,
    pub population_size: usize,
    pub max_generations: usize,
    pub mutation_factor: f64,
    pub crossover_probability: f64,
    /// Nelder-Mead refinement iterations after the evolution stage.
    pub refine_iterations: usize,
    pub seed: u64,
    pub weights: ScoreWeights,
}

impl Default for CalibratorOptions {
    fn default() -> Self {
        Self {
            bounds: SearchBounds::default(),
            horizon: None,
            max_evaluations: 200,
            population_size: 16,
            max_generations: 10,
            mutation_factor: 0.8,
            crossover_probability: 0.9,
            refine_iterations: 40,
            seed: 7,
            weights: ScoreWeights::default(),
        }
    }
}

/// Result of one full calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutcome {
    pub best: CalibrationTrial,
    /// Every evaluation, in order.
    pub trials: Vec<CalibrationTrial>,
    pub evaluations: usize,
}

/// Closed-loop stylized-fact calibrator for one asset panel.
#[derive(Debug)]
pub struct Calibrator {
    panel: Vec<ReturnSeries>,
    base_config: SimulationConfig,
    options: CalibratorOptions,
}

impl Calibrator {
    /// # Errors
    /// Returns `SimError::DataInsufficiency` for an empty panel,
    /// `SimError::InvalidInput` for an invalid base configuration or bounds.
    pub fn new(
        panel: Vec<ReturnSeries>,
        base_config: SimulationConfig,
        options: CalibratorOptions,
    ) -> Result<Self, SimError> {
        if panel.is_empty() {
            return Err(SimError::DataInsufficiency(
                "calibration requires at least one asset".to_string(),
            ));
        }
        base_config.validate().map_err(SimError::InvalidInput)?;
        options
            .bounds
            .constraints()
            .map_err(SimError::InvalidInput)?;
        if options.max_evaluations == 0 || options.population_size < 4 {
            return Err(SimError::InvalidInput(
                "calibration needs max_evaluations >= 1 and population_size >= 4".to_string(),
            ));
        }
        Ok(Self {
            panel,
            base_config,
            options,
        })
    }

    /// Runs the evolution stage followed by simplex refinement.
    ///
    /// Always returns the best observed trial and the full trial log, even
    /// when every trial failed (the best is then a sentinel-scored `Fail`).
    ///
    /// # Errors
    /// Returns `SimError::InvalidInput` only for malformed bounds; evaluation
    /// failures are absorbed into `Fail` trials.
    pub fn run(&self) -> Result<CalibrationOutcome, SimError> {
        let constraints = self
            .options
            .bounds
            .constraints()
            .map_err(SimError::InvalidInput)?;

        let trials = std::cell::RefCell::new(Vec::new());
        let budget = self.options.max_evaluations;

        let mut objective = |x: &[f64]| {
            let trial = self.evaluate(x);
            let score = trial.score;
            trials.borrow_mut().push(trial);
            score
        };
        let (seed_point, seed_value) = differential_evolution(
            &constraints,
            self.options.population_size,
            self.options.max_generations,
            self.options.mutation_factor,
            self.options.crossover_probability,
            self.options.seed,
            budget,
            &mut objective,
        );
        let remaining = budget.saturating_sub(trials.borrow().len());
        // The incumbent's value is handed over, so the refinement stage never
        // re-evaluates it or records a duplicate trial.
        nelder_mead(
            &seed_point,
            seed_value,
            &constraints,
            self.options.refine_iterations,
            remaining,
            &mut objective,
        );
        drop(objective);
        let trials = trials.into_inner();

        let best = trials
            .iter()
            .min_by(|a, b| a.score.total_cmp(&b.score))
            .cloned()
            .unwrap_or(CalibrationTrial {
                params: CalibrationParams::from_vector(&constraints.clamp(&[0.0; 4])),
                score: SENTINEL_PENALTY,
                components: None,
                status: TrialStatus::Fail,
            });

        Ok(CalibrationOutcome {
            evaluations: trials.len(),
            best,
            trials,
        })
    }

    /// Evaluates one parameter vector, absorbing every failure.
    fn evaluate(&self, x: &[f64]) -> CalibrationTrial {
        let params = CalibrationParams::from_vector(x);
        let config = params.apply(&self.base_config);

        match self.try_score(&config) {
            Ok(score) if !score.is_sentinel() => CalibrationTrial {
                params,
                score: score.total,
                components: Some(score.components),
                status: TrialStatus::Ok,
            },
            _ => CalibrationTrial {
                params,
                score: SENTINEL_PENALTY,
                components: None,
                status: TrialStatus::Fail,
            },
        }
    }

    fn try_score(&self, config: &SimulationConfig) -> Result<ErrorScore, SimError> {
        let pipeline = FittedPipeline::fit(&self.panel, config)?;
        let horizon = self.options.horizon.unwrap_or_else(|| pipeline.fitted_len());
        let paths = pipeline.synthesize(horizon, config)?;
        Ok(pipeline.score_with(&paths, config, &self.options.weights))
    }
}

/// DE/rand/1/bin over the box, stopping on generations or budget.
/// Returns the best point and its objective value.
#[allow(clippy::too_many_arguments)]
fn differential_evolution<F>(
    bounds: &BoxConstraints,
    population_size: usize,
    max_generations: usize,
    mutation_factor: f64,
    crossover_probability: f64,
    seed: u64,
    budget: usize,
    objective_fn: &mut F,
) -> (Vec<f64>, f64)
where
    F: FnMut(&[f64]) -> f64,
{
    let dim = bounds.dimension();
    let pop_size = population_size.max(dim + 2);
    let mut rng = StdRng::seed_from_u64(seed);

    let mut population = Vec::with_capacity(pop_size);
    let mut values = Vec::with_capacity(pop_size);
    let mut evals = 0usize;

    for _ in 0..pop_size {
        let mut x = vec![0.0; dim];
        for (d, xd) in x.iter_mut().enumerate() {
            let u: f64 = rng.random();
            *xd = bounds.lower[d] + u * (bounds.upper[d] - bounds.lower[d]);
        }
        if evals >= budget {
            population.push(x);
            values.push(f64::INFINITY);
            continue;
        }
        let v = objective_fn(&x);
        evals += 1;
        population.push(x);
        values.push(v);
    }

    let mut best_idx = argmin(&values);

    'outer: for _ in 0..max_generations {
        for i in 0..pop_size {
            if evals >= budget {
                break 'outer;
            }
            let mut idxs: Vec<usize> = (0..pop_size).filter(|&k| k != i).collect();
            idxs.shuffle(&mut rng);
            let (a, b, c) = (idxs[0], idxs[1], idxs[2]);

            let mut mutant = vec![0.0; dim];
            for (d, md) in mutant.iter_mut().enumerate() {
                *md =
                    population[a][d] + mutation_factor * (population[b][d] - population[c][d]);
            }
            let mutant = bounds.clamp(&mutant);

            let j_rand = rng.random_range(0..dim);
            let mut trial = population[i].clone();
            for d in 0..dim {
                let p: f64 = rng.random();
                if p <= crossover_probability || d == j_rand {
                    trial[d] = mutant[d];
                }
            }
            let trial = bounds.clamp(&trial);

            let trial_value = objective_fn(&trial);
            evals += 1;
            if trial_value.is_finite() && trial_value < values[i] {
                population[i] = trial;
                values[i] = trial_value;
                if trial_value < values[best_idx] {
                    best_idx = i;
                }
            }
        }
    }

    (population[best_idx].clone(), values[best_idx])
}

/// Bounded Nelder-Mead refinement from `initial`, whose objective value
/// `initial_value` is already known and is not re-evaluated. Stops on
/// iterations or budget and returns the best simplex vertex.
fn nelder_mead<F>(
    initial: &[f64],
    initial_value: f64,
    bounds: &BoxConstraints,
    max_iterations: usize,
    budget: usize,
    objective_fn: &mut F,
) -> Vec<f64>
where
    F: FnMut(&[f64]) -> f64,
{
    const REFLECTION: f64 = 1.0;
    const EXPANSION: f64 = 2.0;
    const CONTRACTION: f64 = 0.5;
    const SHRINK: f64 = 0.5;
    const INITIAL_STEP: f64 = 0.08;

    let dim = bounds.dimension();
    let mut evals = 0usize;
    let mut eval = |x: &[f64], evals: &mut usize| -> f64 {
        if *evals >= budget {
            return f64::INFINITY;
        }
        *evals += 1;
        objective_fn(x)
    };

    let x0 = bounds.clamp(initial);
    let mut simplex = vec![x0.clone()];
    let mut values = vec![initial_value];

    for d in 0..dim {
        let mut x = x0.clone();
        let step = (bounds.upper[d] - bounds.lower[d]).abs() * INITIAL_STEP;
        x[d] = (x[d] + step).min(bounds.upper[d]);
        if (x[d] - x0[d]).abs() < 1e-14 {
            x[d] = (x[d] - step).max(bounds.lower[d]);
        }
        let x = bounds.clamp(&x);
        values.push(eval(&x, &mut evals));
        simplex.push(x);
    }

    for _ in 0..max_iterations {
        if evals >= budget {
            break;
        }

        let mut order: Vec<usize> = (0..simplex.len()).collect();
        order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));
        simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        values = order.iter().map(|&i| values[i]).collect();

        let centroid: Vec<f64> = (0..dim)
            .map(|d| simplex.iter().take(dim).map(|x| x[d]).sum::<f64>() / dim as f64)
            .collect();

        let xr: Vec<f64> = (0..dim)
            .map(|d| centroid[d] + REFLECTION * (centroid[d] - simplex[dim][d]))
            .collect();
        let xr = bounds.clamp(&xr);
        let fr = eval(&xr, &mut evals);

        if fr < values[0] {
            let xe: Vec<f64> = (0..dim)
                .map(|d| centroid[d] + EXPANSION * (xr[d] - centroid[d]))
                .collect();
            let xe = bounds.clamp(&xe);
            let fe = eval(&xe, &mut evals);
            if fe < fr {
                simplex[dim] = xe;
                values[dim] = fe;
            } else {
                simplex[dim] = xr;
                values[dim] = fr;
            }
            continue;
        }

        if fr < values[dim - 1] {
            simplex[dim] = xr;
            values[dim] = fr;
            continue;
        }

        let xc: Vec<f64> = (0..dim)
            .map(|d| centroid[d] + CONTRACTION * (simplex[dim][d] - centroid[d]))
            .collect();
        let xc = bounds.clamp(&xc);
        let fc = eval(&xc, &mut evals);
        if fc < values[dim] {
            simplex[dim] = xc;
            values[dim] = fc;
            continue;
        }

        for i in 1..=dim {
            for d in 0..dim {
                simplex[i][d] = simplex[0][d] + SHRINK * (simplex[i][d] - simplex[0][d]);
            }
            simplex[i] = bounds.clamp(&simplex[i]);
            values[i] = eval(&simplex[i], &mut evals);
        }
    }

    let best = argmin(&values);
    simplex[best].clone()
}

fn argmin(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Writes trials as JSON lines, one object per evaluation.
///
/// # Errors
/// Returns a message on serialization or I/O failure.
pub fn write_trial_log<W: Write>(trials: &[CalibrationTrial], writer: &mut W) -> Result<(), String> {
    for trial in trials {
        let line = serde_json::to_string(trial).map_err(|e| format!("trial log: {e}"))?;
        writeln!(writer, "{line}").map_err(|e| format!("trial log: {e}"))?;
    }
    Ok(())
}

/// Appends trials to a JSON-lines log file, creating it when absent.
///
/// # Errors
/// Returns a message on serialization or I/O failure.
pub fn append_trial_log(path: &Path, trials: &[CalibrationTrial]) -> Result<(), String> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("trial log {}: {e}", path.display()))?;
    write_trial_log(trials, &mut file)
}

/// Reads back a JSON-lines trial log written by [`append_trial_log`].
///
/// # Errors
/// Returns `SimError::MissingArtifact` when the log file is absent or
/// unreadable and `SimError::InvalidInput` when a line fails to parse.
pub fn read_trial_log(path: &Path) -> Result<Vec<CalibrationTrial>, SimError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SimError::MissingArtifact(format!("trial log {}: {e}", path.display()))
    })?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| SimError::InvalidInput(format!("trial log line: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_round_trip_from_vector() {
        let p = CalibrationParams::from_vector(&[155.4, 8.6, 4.765, 1.0]);
        assert_eq!(p.block_size, 155);
        assert_eq!(p.degrees_of_freedom, 9);
        assert!((p.jump_threshold - 4.765).abs() < 1.0e-12);

        let p = CalibrationParams::from_vector(&[0.2, -3.0, -1.0, 0.0]);
        assert_eq!(p.block_size, 1);
        assert_eq!(p.degrees_of_freedom, 1);
        assert_eq!(p.jump_threshold, 0.0);
        assert!(p.amplification_factor > 0.0);
    }

    #[test]
    fn apply_overlays_searched_options_only() {
        let base = SimulationConfig {
            random_seed: 99,
            n_paths: 7,
            ..SimulationConfig::default()
        };
        let p = CalibrationParams::from_vector(&[30.0, 6.0, 2.5, 1.5]);
        let config = p.apply(&base);
        assert_eq!(config.block_size, 30);
        assert_eq!(
            config.innovation_distribution,
            InnovationDistribution::StudentT {
                degrees_of_freedom: 6
            }
        );
        assert_eq!(config.random_seed, 99);
        assert_eq!(config.n_paths, 7);
    }

    #[test]
    fn differential_evolution_minimizes_a_quadratic() {
        let bounds = BoxConstraints::new(vec![-1.0; 2], vec![1.0; 2]).unwrap();
        let mut f = |x: &[f64]| (x[0] - 0.2).powi(2) + (x[1] + 0.3).powi(2);
        let (best, value) = differential_evolution(&bounds, 24, 60, 0.8, 0.9, 7, 10_000, &mut f);
        assert!((best[0] - 0.2).abs() < 5.0e-2);
        assert!((best[1] + 0.3).abs() < 5.0e-2);
        assert!((value - f(&best)).abs() < 1.0e-12);
    }

    #[test]
    fn nelder_mead_refines_within_bounds() {
        let bounds = BoxConstraints::new(vec![-1.0; 2], vec![1.0; 2]).unwrap();
        let mut f = |x: &[f64]| (x[0] - 0.25).powi(2) + (x[1] + 0.4).powi(2);
        let init = [0.9, 0.9];
        let init_value = f(&init);
        let best = nelder_mead(&init, init_value, &bounds, 200, 10_000, &mut f);
        assert!((best[0] - 0.25).abs() < 1.0e-3);
        assert!((best[1] + 0.4).abs() < 1.0e-3);
    }

    #[test]
    fn search_respects_the_evaluation_budget() {
        let bounds = BoxConstraints::new(vec![0.0; 2], vec![1.0; 2]).unwrap();
        let mut count = 0usize;
        differential_evolution(&bounds, 8, 100, 0.8, 0.9, 1, 20, &mut |x: &[f64]| {
            count += 1;
            x[0] + x[1]
        });
        assert!(count <= 20);

        count = 0;
        nelder_mead(&[0.5, 0.5], 1.0, &bounds, 100, 9, &mut |x: &[f64]| {
            count += 1;
            x[0] + x[1]
        });
        assert!(count <= 9);
    }

    #[test]
    fn refinement_does_not_reevaluate_the_incumbent() {
        let bounds = BoxConstraints::new(vec![-1.0; 2], vec![1.0; 2]).unwrap();
        let mut calls = 0usize;
        let (best, value) =
            differential_evolution(&bounds, 4, 1, 0.8, 0.9, 3, 1_000, &mut |x: &[f64]| {
                calls += 1;
                x[0] * x[0] + x[1] * x[1]
            });
        let after_de = calls;
        // Zero iterations: only the two perturbed simplex vertices are
        // evaluated, never the handed-over incumbent.
        nelder_mead(&best, value, &bounds, 0, 1_000, &mut |x: &[f64]| {
            calls += 1;
            x[0] * x[0] + x[1] * x[1]
        });
        assert_eq!(calls, after_de + 2);
    }

    #[test]
    fn trial_log_emits_one_json_line_per_trial() {
        let trials = vec![
            CalibrationTrial {
                params: CalibrationParams::from_vector(&[24.0, 5.0, 3.0, 1.0]),
                score: 0.5,
                components: None,
                status: TrialStatus::Ok,
            },
            CalibrationTrial {
                params: CalibrationParams::from_vector(&[10.0, 4.0, 2.0, 1.2]),
                score: SENTINEL_PENALTY,
                components: None,
                status: TrialStatus::Fail,
            },
        ];
        let mut buf = Vec::new();
        write_trial_log(&trials, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: CalibrationTrial = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back.status, TrialStatus::Fail);
    }

    #[test]
    fn empty_panel_is_rejected() {
        let err = Calibrator::new(
            Vec::new(),
            SimulationConfig::default(),
            CalibratorOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SimError::DataInsufficiency(_)));
    }
}
