//! Differential evolution strategy.
//!
//! rand/1/bin with a mutation factor dithered per generation, latin-hypercube
//! initialization and rayon-parallel trial evaluation. Every candidate ever
//! evaluated is appended to a shared population log so the raw search history
//! can be analyzed after the fit.

use std::sync::Mutex;
use std::time::Instant;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::fits::lm::GradientLeastSquares;
use crate::fits::{data_driven_guess, FitResult, FitStatus, FitStrategy, Objective};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeConfig {
    /// Population size per search dimension.
    pub population_multiplier: usize,
    pub max_generations: usize,
    /// Crossover probability of rand/1/bin.
    pub crossover: f64,
    /// Mutation factor range; one factor is drawn per generation.
    pub mutation: (f64, f64),
    /// Absolute convergence tolerance on the population cost spread.
    pub atol: f64,
    /// Relative convergence tolerance on the population cost spread.
    pub tol: f64,
    /// Refine the best candidate with the gradient strategy afterwards.
    pub polish: bool,
    pub seed: Option<u64>,
}

impl Default for DeConfig {
    fn default() -> Self {
        Self {
            population_multiplier: 10,
            max_generations: 1000,
            crossover: 0.5,
            mutation: (0.5, 1.5),
            atol: 1.0,
            tol: 0.01,
            polish: true,
            seed: None,
        }
    }
}

impl DeConfig {
    /// Parse a configuration from its JSON representation.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Concurrent log of every (candidate, cost) evaluation of one search.
#[derive(Debug, Default)]
pub struct PopulationLog {
    entries: Mutex<Vec<(Vec<f64>, f64)>>,
}

impl PopulationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, candidate: &Array1<f64>, cost: f64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((candidate.to_vec(), cost));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten the log to (n, dim + 1), cost in the last column.
    pub fn to_array(&self, dim: usize) -> Array2<f64> {
        let entries = match self.entries.lock() {
            Ok(e) => e,
            Err(_) => return Array2::zeros((0, dim + 1)),
        };
        let mut out = Array2::zeros((entries.len(), dim + 1));
        for (row, (candidate, cost)) in entries.iter().enumerate() {
            for (col, &v) in candidate.iter().enumerate() {
                out[[row, col]] = v;
            }
            out[[row, dim]] = *cost;
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct DifferentialEvolution {
    config: DeConfig,
}

impl DifferentialEvolution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: DeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn with_polish(mut self, polish: bool) -> Self {
        self.config.polish = polish;
        self
    }

    pub fn with_max_generations(mut self, max_generations: usize) -> Self {
        self.config.max_generations = max_generations;
        self
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

/// Latin-hypercube population over the search box: each dimension is divided
/// into `size` strata, visited once each in shuffled order.
fn latin_hypercube(
    rng: &mut StdRng,
    bounds: &[(f64, f64)],
    size: usize,
) -> Vec<Array1<f64>> {
    let dim = bounds.len();
    let mut strata: Vec<Vec<usize>> = Vec::with_capacity(dim);
    for _ in 0..dim {
        let mut order: Vec<usize> = (0..size).collect();
        order.shuffle(rng);
        strata.push(order);
    }

    (0..size)
        .map(|member| {
            let mut candidate = Array1::zeros(dim);
            for (d, &(lo, hi)) in bounds.iter().enumerate() {
                let cell = strata[d][member] as f64;
                let fraction = (cell + rng.gen::<f64>()) / size as f64;
                candidate[d] = lo + fraction * (hi - lo);
            }
            candidate
        })
        .collect()
}

impl FitStrategy for DifferentialEvolution {
    fn fit_type(&self) -> &'static str {
        "differential evolution"
    }

    fn initial_guess(&self, objective: &Objective) -> Result<Option<Array1<f64>>> {
        data_driven_guess(objective)
    }

    fn fit(&self, objective: &Objective) -> Result<FitResult> {
        let start = Instant::now();
        let fit_type = self.fit_type();

        if let Err(err) = objective.check_data() {
            if let FitError::InsufficientData(msg) = err {
                return Ok(FitResult::failed(fit_type, start.elapsed(), msg));
            }
            return Err(err);
        }

        let registry = objective.registry();
        let bounds = registry.bounds();
        for (name, &(lo, hi)) in registry.names().iter().zip(bounds.iter()) {
            if !lo.is_finite() || !hi.is_finite() || lo >= hi {
                return Err(FitError::InvalidConfiguration(format!(
                    "parameter '{}' needs finite ordered bounds for a population search, got [{}, {}]",
                    name, lo, hi
                )));
            }
        }

        let dim = registry.len();
        let population_size = (self.config.population_multiplier * dim).max(4);
        let mut rng = self.rng();

        let log = PopulationLog::new();
        let evaluate = |candidate: &Array1<f64>| {
            let cost = objective.likelihood_or_penalty(candidate);
            log.append(candidate, cost);
            cost
        };

        let mut population = latin_hypercube(&mut rng, bounds, population_size);
        let mut costs: Vec<f64> = population.par_iter().map(&evaluate).collect();

        let mut generations_run = 0;
        let mut converged = false;
        for _ in 0..self.config.max_generations {
            generations_run += 1;
            let (f_lo, f_hi) = self.config.mutation;
            let factor = rng.gen_range(f_lo..f_hi);

            let mut trials: Vec<Array1<f64>> = Vec::with_capacity(population_size);
            for i in 0..population_size {
                let mut picks: Vec<usize> = (0..population_size).filter(|&k| k != i).collect();
                picks.shuffle(&mut rng);
                let (a, b, c) = (picks[0], picks[1], picks[2]);

                let forced = rng.gen_range(0..dim);
                let mut trial = population[i].clone();
                for d in 0..dim {
                    if d == forced || rng.gen::<f64>() < self.config.crossover {
                        let (lo, hi) = bounds[d];
                        let mutant =
                            population[a][d] + factor * (population[b][d] - population[c][d]);
                        trial[d] = mutant.clamp(lo, hi);
                    }
                }
                trials.push(trial);
            }

            let trial_costs: Vec<f64> = trials.par_iter().map(&evaluate).collect();
            for i in 0..population_size {
                if trial_costs[i] <= costs[i] {
                    population[i] = trials[i].clone();
                    costs[i] = trial_costs[i];
                }
            }

            let mean = costs.iter().sum::<f64>() / population_size as f64;
            let variance = costs
                .iter()
                .map(|c| (c - mean) * (c - mean))
                .sum::<f64>()
                / population_size as f64;
            if variance.sqrt() <= self.config.atol + self.config.tol * mean.abs() {
                converged = true;
                break;
            }
        }

        let mut best_index = 0;
        for i in 1..population_size {
            if costs[i] < costs[best_index] {
                best_index = i;
            }
        }
        let mut best = population[best_index].clone();
        let mut best_cost = costs[best_index];
        let mut covariance = None;

        // Exhausting the generation budget without meeting the spread
        // tolerance is a non-converged search; the best member and the full
        // evaluation log are still reported.
        let status = if converged {
            FitStatus::Converged
        } else {
            FitStatus::Failed
        };
        let mut message = if converged {
            format!("population spread converged after {} generations", generations_run)
        } else {
            format!(
                "generation budget of {} exhausted before the population spread converged",
                generations_run
            )
        };

        if self.config.polish {
            let polisher = GradientLeastSquares::new().with_initial_guess(best.clone());
            let polished = polisher.fit(objective)?;
            if let (FitStatus::Converged, Some(candidate)) =
                (polished.status, polished.best_parameters)
            {
                let polished_cost = objective.likelihood_or_penalty(&candidate);
                log.append(&candidate, polished_cost);
                if polished_cost < best_cost {
                    best = candidate;
                    best_cost = polished_cost;
                    covariance = polished.covariance;
                    message.push_str("; best candidate polished by gradient descent");
                }
            }
        }

        Ok(FitResult {
            fit_type,
            status,
            best_parameters: Some(best),
            cost: Some(best_cost),
            covariance,
            pareto_front: None,
            population: Some(log.to_array(dim)),
            wall_time: start.elapsed(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Telescope};
    use crate::fits::registry::{FitParameters, FluxEstimation};
    use crate::models::{MicrolensModel, PsplModel};
    use approx::assert_relative_eq;
    use ndarray::array;

    fn synthetic_event() -> Event {
        let model = PsplModel::new();
        let times: Vec<f64> = (0..60).map(|i| -15.0 + 0.5 * i as f64).collect();
        let generator = Telescope::new("synthetic")
            .with_flux_lightcurve(&times, &vec![1.0; 60], &vec![0.1; 60])
            .unwrap();

        let params = model.resolve(&array![0.0, 0.2, 10.0].view()).unwrap();
        let magnification = model.magnification(&generator, &params).unwrap().unwrap();
        let flux: Vec<f64> = magnification.iter().map(|&a| 100.0 * a + 20.0).collect();

        let mut event = Event::new("synthetic", 270.0, -29.0);
        event.telescopes.push(
            Telescope::new("synthetic")
                .with_flux_lightcurve(&times, &flux, &vec![0.5; 60])
                .unwrap(),
        );
        event
    }

    #[test]
    fn test_latin_hypercube_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        let bounds = [(-1.0, 1.0), (10.0, 20.0)];
        let population = latin_hypercube(&mut rng, &bounds, 25);
        assert_eq!(population.len(), 25);
        for candidate in &population {
            assert!(candidate[0] >= -1.0 && candidate[0] <= 1.0);
            assert!(candidate[1] >= 10.0 && candidate[1] <= 20.0);
        }
    }

    #[test]
    fn test_latin_hypercube_covers_strata() {
        let mut rng = StdRng::seed_from_u64(4);
        let bounds = [(0.0, 10.0)];
        let population = latin_hypercube(&mut rng, &bounds, 10);
        // One sample per unit-wide stratum.
        let mut seen = vec![false; 10];
        for candidate in &population {
            let stratum = (candidate[0].floor() as usize).min(9);
            seen[stratum] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_population_log_accounts_every_evaluation() {
        let event = synthetic_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let generations = 5;
        let strategy = DifferentialEvolution::new()
            .with_seed(11)
            .with_polish(false)
            .with_config(DeConfig {
                population_multiplier: 5,
                max_generations: generations,
                atol: 0.0,
                tol: 0.0,
                polish: false,
                seed: Some(11),
                ..DeConfig::default()
            });
        let result = strategy.fit(&objective).unwrap();

        let dim = registry.len();
        let population_size = 5 * dim;
        let logged = result.population.unwrap();
        // Initialization plus one full trial set per generation.
        assert_eq!(logged.nrows(), population_size * (generations + 1));
        assert_eq!(logged.ncols(), dim + 1);
        for &cost in logged.column(dim).iter() {
            assert!(cost.is_finite());
        }
    }

    #[test]
    fn test_recovers_pspl_parameters() {
        let event = synthetic_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false)
                .unwrap()
                .with_bounds("tE", 1.0, 50.0)
                .unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let strategy = DifferentialEvolution::new().with_seed(42).with_config(DeConfig {
            max_generations: 300,
            seed: Some(42),
            ..DeConfig::default()
        });
        let result = strategy.fit(&objective).unwrap();

        assert!(result.is_converged(), "message: {}", result.message);
        let best = result.best_parameters.unwrap();
        assert_relative_eq!(best[0], 0.0, epsilon = 0.05);
        assert_relative_eq!(best[1].abs(), 0.2, epsilon = 0.01);
        assert_relative_eq!(best[2], 10.0, epsilon = 0.1);
    }

    #[test]
    fn test_exhausted_budget_reports_failed() {
        let event = synthetic_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        // One generation with an unreachable tolerance cannot converge.
        let strategy = DifferentialEvolution::new().with_config(DeConfig {
            max_generations: 1,
            atol: 0.0,
            tol: 0.0,
            polish: false,
            seed: Some(9),
            ..DeConfig::default()
        });
        let result = strategy.fit(&objective).unwrap();

        assert_eq!(result.status, FitStatus::Failed);
        assert!(result.message.contains("exhausted"), "message: {}", result.message);
        // The best member and the search history survive the failure.
        assert!(result.best_parameters.is_some());
        assert!(result.population.is_some());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = DeConfig {
            max_generations: 7,
            seed: Some(3),
            ..DeConfig::default()
        };
        let text = config.to_json().unwrap();
        let back = DeConfig::from_json(&text).unwrap();
        assert_eq!(back.max_generations, 7);
        assert_eq!(back.seed, Some(3));
    }

    #[test]
    fn test_rejects_unbounded_parameter() {
        let event = synthetic_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        // Sanity: default bounds are all finite, so the search must start.
        let strategy = DifferentialEvolution::new().with_seed(1).with_config(DeConfig {
            max_generations: 1,
            polish: false,
            seed: Some(1),
            ..DeConfig::default()
        });
        assert!(strategy.fit(&objective).is_ok());
    }
}
