//! Multi-objective strategy for joint photometric/astrometric fits.
//!
//! Elitist non-dominated sorting genetic search (NSGA-II): fast
//! non-dominated sort, crowding-distance diversity, binary tournament
//! selection, simulated binary crossover and polynomial mutation. The two
//! objectives are the photometric and astrometric negative log-likelihoods;
//! the result is the final non-dominated front, not a single best candidate.

use std::cmp::Ordering;
use std::time::Instant;

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::fits::de::PopulationLog;
use crate::fits::{data_driven_guess, FitResult, FitStatus, FitStrategy, Objective, ParetoSolution};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsgaConfig {
    pub population_size: usize,
    pub generations: usize,
    /// Distribution index of the simulated binary crossover.
    pub crossover_eta: f64,
    pub crossover_probability: f64,
    /// Distribution index of the polynomial mutation.
    pub mutation_eta: f64,
    pub seed: Option<u64>,
}

impl Default for NsgaConfig {
    fn default() -> Self {
        Self {
            population_size: 100,
            generations: 100,
            crossover_eta: 15.0,
            crossover_probability: 0.9,
            mutation_eta: 20.0,
            seed: None,
        }
    }
}

impl NsgaConfig {
    /// Parse a configuration from its JSON representation.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NsgaII {
    config: NsgaConfig,
}

impl NsgaII {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: NsgaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn with_generations(mut self, generations: usize) -> Self {
        self.config.generations = generations;
        self
    }
}

/// a dominates b when no objective is worse and at least one is better.
fn dominates(a: &[f64; 2], b: &[f64; 2]) -> bool {
    (a[0] <= b[0] && a[1] <= b[1]) && (a[0] < b[0] || a[1] < b[1])
}

/// Fronts of mutually non-dominated members, best first.
fn fast_non_dominated_sort(objectives: &[[f64; 2]]) -> Vec<Vec<usize>> {
    let n = objectives.len();
    let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut domination_count = vec![0usize; n];
    let mut fronts: Vec<Vec<usize>> = vec![Vec::new()];

    for p in 0..n {
        for q in 0..n {
            if p == q {
                continue;
            }
            if dominates(&objectives[p], &objectives[q]) {
                dominated_by[p].push(q);
            } else if dominates(&objectives[q], &objectives[p]) {
                domination_count[p] += 1;
            }
        }
        if domination_count[p] == 0 {
            fronts[0].push(p);
        }
    }

    let mut current = 0;
    while !fronts[current].is_empty() {
        let mut next = Vec::new();
        for &p in &fronts[current] {
            for &q in &dominated_by[p] {
                domination_count[q] -= 1;
                if domination_count[q] == 0 {
                    next.push(q);
                }
            }
        }
        fronts.push(next);
        current += 1;
    }
    fronts.pop();
    fronts
}

/// Crowding distance of each member of one front; boundary members get
/// infinite distance so they always survive.
fn crowding_distance(front: &[usize], objectives: &[[f64; 2]]) -> Vec<f64> {
    let size = front.len();
    let mut distance = vec![0.0; size];
    if size <= 2 {
        return vec![f64::INFINITY; size];
    }

    for axis in 0..2 {
        let mut order: Vec<usize> = (0..size).collect();
        order.sort_by(|&a, &b| {
            objectives[front[a]][axis]
                .partial_cmp(&objectives[front[b]][axis])
                .unwrap_or(Ordering::Equal)
        });

        distance[order[0]] = f64::INFINITY;
        distance[order[size - 1]] = f64::INFINITY;
        let span = objectives[front[order[size - 1]]][axis] - objectives[front[order[0]]][axis];
        if span <= 0.0 {
            continue;
        }
        for k in 1..(size - 1) {
            let gap = objectives[front[order[k + 1]]][axis]
                - objectives[front[order[k - 1]]][axis];
            distance[order[k]] += gap / span;
        }
    }
    distance
}

/// Simulated binary crossover of one parameter pair.
fn sbx_pair(rng: &mut StdRng, x1: f64, x2: f64, lo: f64, hi: f64, eta: f64) -> (f64, f64) {
    let u: f64 = rng.gen();
    let beta = if u <= 0.5 {
        (2.0 * u).powf(1.0 / (eta + 1.0))
    } else {
        (1.0 / (2.0 * (1.0 - u))).powf(1.0 / (eta + 1.0))
    };
    let c1 = 0.5 * ((1.0 + beta) * x1 + (1.0 - beta) * x2);
    let c2 = 0.5 * ((1.0 - beta) * x1 + (1.0 + beta) * x2);
    (c1.clamp(lo, hi), c2.clamp(lo, hi))
}

/// Polynomial mutation of one parameter.
fn polynomial_mutation(rng: &mut StdRng, x: f64, lo: f64, hi: f64, eta: f64) -> f64 {
    let span = hi - lo;
    if span <= 0.0 {
        return x;
    }
    let u: f64 = rng.gen();
    let delta = if u < 0.5 {
        (2.0 * u).powf(1.0 / (eta + 1.0)) - 1.0
    } else {
        1.0 - (2.0 * (1.0 - u)).powf(1.0 / (eta + 1.0))
    };
    (x + delta * span).clamp(lo, hi)
}

impl FitStrategy for NsgaII {
    fn fit_type(&self) -> &'static str {
        "non-dominated sorting genetic search"
    }

    fn initial_guess(&self, objective: &Objective) -> Result<Option<Array1<f64>>> {
        data_driven_guess(objective)
    }

    fn fit(&self, objective: &Objective) -> Result<FitResult> {
        let start = Instant::now();
        let fit_type = self.fit_type();

        let event = objective.event();
        if !event.has_photometry() || !event.has_astrometry() {
            return Err(FitError::InvalidConfiguration(
                "a multi-objective fit needs both photometric and astrometric data".to_string(),
            ));
        }
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
        let size = self.config.population_size.max(4) & !1; // even
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        // Every evaluation is logged with the joint likelihood, same record
        // shape as the single-objective population searches.
        let log = PopulationLog::new();
        let evaluate = |candidate: &Array1<f64>| -> [f64; 2] {
            let photometric = objective.photometric_or_penalty(candidate);
            let astrometric = objective.astrometric_or_penalty(candidate);
            log.append(candidate, photometric + astrometric);
            [photometric, astrometric]
        };

        // Uniform random initialization over the box.
        let mut population: Vec<Array1<f64>> = (0..size)
            .map(|_| {
                let mut candidate = Array1::zeros(dim);
                for (d, &(lo, hi)) in bounds.iter().enumerate() {
                    candidate[d] = rng.gen_range(lo..hi);
                }
                candidate
            })
            .collect();
        let mut objectives: Vec<[f64; 2]> = population.par_iter().map(&evaluate).collect();

        for _ in 0..self.config.generations {
            let fronts = fast_non_dominated_sort(&objectives);
            let mut rank = vec![usize::MAX; size];
            let mut crowding = vec![0.0; size];
            for (level, front) in fronts.iter().enumerate() {
                let distances = crowding_distance(front, &objectives);
                for (slot, &member) in front.iter().enumerate() {
                    rank[member] = level;
                    crowding[member] = distances[slot];
                }
            }

            let tournament = |rng: &mut StdRng| -> usize {
                let a = rng.gen_range(0..size);
                let b = rng.gen_range(0..size);
                match rank[a].cmp(&rank[b]) {
                    Ordering::Less => a,
                    Ordering::Greater => b,
                    Ordering::Equal => {
                        if crowding[a] >= crowding[b] {
                            a
                        } else {
                            b
                        }
                    }
                }
            };

            let mut offspring: Vec<Array1<f64>> = Vec::with_capacity(size);
            while offspring.len() < size {
                let p1 = tournament(&mut rng);
                let p2 = tournament(&mut rng);
                let mut c1 = population[p1].clone();
                let mut c2 = population[p2].clone();

                if rng.gen::<f64>() < self.config.crossover_probability {
                    for d in 0..dim {
                        if rng.gen::<f64>() < 0.5 {
                            let (lo, hi) = bounds[d];
                            let (a, b) = sbx_pair(
                                &mut rng,
                                c1[d],
                                c2[d],
                                lo,
                                hi,
                                self.config.crossover_eta,
                            );
                            c1[d] = a;
                            c2[d] = b;
                        }
                    }
                }
                for child in [&mut c1, &mut c2] {
                    for d in 0..dim {
                        if rng.gen::<f64>() < 1.0 / dim as f64 {
                            let (lo, hi) = bounds[d];
                            child[d] =
                                polynomial_mutation(&mut rng, child[d], lo, hi, self.config.mutation_eta);
                        }
                    }
                }
                offspring.push(c1);
                if offspring.len() < size {
                    offspring.push(c2);
                }
            }

            let offspring_objectives: Vec<[f64; 2]> =
                offspring.par_iter().map(&evaluate).collect();

            // Environmental selection over parents plus offspring.
            let mut merged = population;
            merged.extend(offspring);
            let mut merged_objectives = objectives;
            merged_objectives.extend(offspring_objectives);

            let fronts = fast_non_dominated_sort(&merged_objectives);
            let mut survivors: Vec<usize> = Vec::with_capacity(size);
            for front in &fronts {
                if survivors.len() + front.len() <= size {
                    survivors.extend(front.iter().copied());
                } else {
                    let distances = crowding_distance(front, &merged_objectives);
                    let mut order: Vec<usize> = (0..front.len()).collect();
                    order.sort_by(|&a, &b| {
                        distances[b]
                            .partial_cmp(&distances[a])
                            .unwrap_or(Ordering::Equal)
                    });
                    for &slot in &order {
                        if survivors.len() == size {
                            break;
                        }
                        survivors.push(front[slot]);
                    }
                }
                if survivors.len() == size {
                    break;
                }
            }

            population = survivors
                .iter()
                .map(|&index| merged[index].clone())
                .collect();
            objectives = survivors.iter().map(|&index| merged_objectives[index]).collect();
        }

        let fronts = fast_non_dominated_sort(&objectives);
        let front = fronts.first().cloned().unwrap_or_default();
        let pareto: Vec<ParetoSolution> = front
            .iter()
            .map(|&index| ParetoSolution {
                parameters: population[index].clone(),
                objectives: objectives[index],
            })
            .collect();

        let message = format!(
            "{} generations, final front holds {} solutions",
            self.config.generations,
            pareto.len()
        );

        Ok(FitResult {
            fit_type,
            status: FitStatus::Converged,
            best_parameters: None,
            cost: None,
            covariance: None,
            pareto_front: Some(pareto),
            population: Some(log.to_array(dim)),
            wall_time: start.elapsed(),
            message,
        })
    }
}
