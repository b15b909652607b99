//! Fit strategies and their shared result contract.
//!
//! Every strategy consumes an [`Objective`] and produces a [`FitResult`];
//! callers can swap strategies without touching the rest of the pipeline.

use std::fmt;
use std::time::Duration;

use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{FitError, Result};

pub mod de;
pub mod lm;
pub mod nsga;
pub mod objective;
pub mod registry;

pub use de::{DeConfig, DifferentialEvolution, PopulationLog};
pub use lm::{GradientLeastSquares, LmConfig, Loss};
pub use nsga::{NsgaConfig, NsgaII};
pub use objective::{Objective, PENALTY_COST};
pub use registry::{FitParameters, FluxEstimation};

/// Terminal state of a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    Converged,
    Failed,
}

/// One non-dominated solution of a multi-objective search.
#[derive(Debug, Clone)]
pub struct ParetoSolution {
    pub parameters: Array1<f64>,
    /// (photometric, astrometric) negative log-likelihoods.
    pub objectives: [f64; 2],
}

/// Uniform result record produced by every strategy.
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Human-readable strategy name.
    pub fit_type: &'static str,
    pub status: FitStatus,
    /// Best candidate vector in registry order; `None` for multi-objective
    /// searches and for fits that failed before producing a candidate. A
    /// population search that exhausts its budget still reports its best
    /// member here alongside the `Failed` status.
    pub best_parameters: Option<Array1<f64>>,
    /// Objective value at the best candidate.
    pub cost: Option<f64>,
    /// Parameter covariance estimate, when the strategy provides one.
    pub covariance: Option<Array2<f64>>,
    /// Non-dominated front of a multi-objective search.
    pub pareto_front: Option<Vec<ParetoSolution>>,
    /// Every candidate a population search evaluated, (n, dim + 1) with the
    /// objective value in the last column.
    pub population: Option<Array2<f64>>,
    pub wall_time: Duration,
    pub message: String,
}

impl FitResult {
    pub fn failed(fit_type: &'static str, wall_time: Duration, message: String) -> Self {
        Self {
            fit_type,
            status: FitStatus::Failed,
            best_parameters: None,
            cost: None,
            covariance: None,
            pareto_front: None,
            population: None,
            wall_time,
            message,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.status == FitStatus::Converged
    }

    /// Draw `n` samples from the Gaussian approximation of the posterior,
    /// N(best_parameters, covariance). Requires a converged fit with a
    /// usable (positive-definite) covariance.
    pub fn sample_posterior<R: Rng + ?Sized>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        let mean = self
            .best_parameters
            .as_ref()
            .ok_or(FitError::SingularCovariance)?;
        let covariance = self
            .covariance
            .as_ref()
            .ok_or(FitError::SingularCovariance)?;
        let chol = cholesky(covariance).ok_or(FitError::SingularCovariance)?;

        let dim = mean.len();
        let mut samples = Array2::zeros((n, dim));
        for s in 0..n {
            let z: Vec<f64> = (0..dim).map(|_| StandardNormal.sample(rng)).collect();
            for i in 0..dim {
                let mut value = mean[i];
                for j in 0..=i {
                    value += chol[[i, j]] * z[j];
                }
                samples[[s, i]] = value;
            }
        }
        Ok(samples)
    }
}

impl fmt::Display for FitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Fit: {}", self.fit_type)?;
        writeln!(
            f,
            "Status: {}",
            match self.status {
                FitStatus::Converged => "converged",
                FitStatus::Failed => "failed",
            }
        )?;
        if let Some(cost) = self.cost {
            writeln!(f, "Cost: {:.6e}", cost)?;
        }
        if let Some(best) = &self.best_parameters {
            writeln!(f, "Best parameters:")?;
            for (i, v) in best.iter().enumerate() {
                writeln!(f, "  [{}] {:.8e}", i, v)?;
            }
        }
        if let Some(front) = &self.pareto_front {
            writeln!(f, "Pareto front: {} solutions", front.len())?;
        }
        writeln!(f, "Wall time: {:.3} s", self.wall_time.as_secs_f64())?;
        write!(f, "Message: {}", self.message)
    }
}

/// Strategy interface: an initial guess and a bounded minimization over the
/// registry layout of the objective.
pub trait FitStrategy {
    fn fit_type(&self) -> &'static str;

    /// Data-driven starting point, `None` when no sensible guess exists.
    fn initial_guess(&self, objective: &Objective) -> Result<Option<Array1<f64>>>;

    fn fit(&self, objective: &Objective) -> Result<FitResult>;
}

/// Default starting point shared by the strategies: t0 at the brightest
/// observation, u0 = 0.1, tE from the observed span, everything else at the
/// middle of its range, fluxes from the closed-form solve at that guess.
pub(crate) fn data_driven_guess(objective: &Objective) -> Result<Option<Array1<f64>>> {
    let event = objective.event();
    let registry = objective.registry();

    let mut peak_time = None;
    let mut peak_flux = f64::NEG_INFINITY;
    for telescope in &event.telescopes {
        if let Some(phot) = &telescope.photometry {
            for i in 0..phot.time.len() {
                if phot.flux[i] > peak_flux {
                    peak_flux = phot.flux[i];
                    peak_time = Some(phot.time[i]);
                }
            }
        }
    }
    let peak_time = match peak_time {
        Some(t) => t,
        None => return Ok(None),
    };

    let te_guess = event
        .time_span()
        .map(|(lo, hi)| ((hi - lo) / 10.0).clamp(1.0, 100.0))
        .unwrap_or(20.0);

    let mut guess = Array1::zeros(registry.len());
    for (index, name) in registry.names().iter().enumerate() {
        let (lo, hi) = registry.bounds()[index];
        guess[index] = match name.as_str() {
            "t0" => peak_time,
            "u0" => 0.1,
            "tE" => te_guess,
            _ => 0.5 * (lo + hi),
        };
    }

    // Seed free fluxes from the closed-form solve at the physical guess.
    if registry.flux_estimation() == FluxEstimation::FreeParameters {
        let params = objective
            .model()
            .resolve(&registry.physical_slice(&guess)?)?;
        for telescope in &event.telescopes {
            if telescope.photometry.is_none() {
                continue;
            }
            let fs_index = registry.index_of(&format!("fsource_{}", telescope.name));
            let fb_index = registry.index_of(&format!("fblend_{}", telescope.name));
            if let (Some(fs_index), Some(fb_index)) = (fs_index, fb_index) {
                if let Some(magnification) =
                    objective.model().magnification(telescope, &params)?
                {
                    if let Ok(fluxes) =
                        objective.telescope_fluxes(&guess, telescope, &magnification)
                    {
                        let (_, fs_hi) = registry.bounds()[fs_index];
                        let (fb_lo, fb_hi) = registry.bounds()[fb_index];
                        guess[fs_index] = fluxes.f_source.clamp(0.0, fs_hi);
                        guess[fb_index] = fluxes.f_blend.clamp(fb_lo, fb_hi);
                    }
                }
            }
        }
    }

    Ok(Some(guess))
}

/// Lower-triangular Cholesky factor of a symmetric matrix, `None` when the
/// matrix is not positive definite.
pub(crate) fn cholesky(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return None;
    }
    let mut l: Array2<f64> = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_cholesky_identity() {
        let eye: Array2<f64> = Array2::eye(3);
        let l = cholesky(&eye).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(l[[i, j]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let m = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(cholesky(&m).is_none());
    }

    #[test]
    fn test_sample_posterior_statistics() {
        let result = FitResult {
            fit_type: "test",
            status: FitStatus::Converged,
            best_parameters: Some(array![10.0, -3.0]),
            cost: Some(1.0),
            covariance: Some(array![[0.04, 0.0], [0.0, 0.01]]),
            pareto_front: None,
            population: None,
            wall_time: Duration::from_secs(0),
            message: String::new(),
        };

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let samples = result.sample_posterior(20000, &mut rng).unwrap();
        assert_eq!(samples.shape(), &[20000, 2]);

        let mean0 = samples.column(0).mean().unwrap_or(0.0);
        let mean1 = samples.column(1).mean().unwrap_or(0.0);
        assert_relative_eq!(mean0, 10.0, epsilon = 0.01);
        assert_relative_eq!(mean1, -3.0, epsilon = 0.01);

        let var0 = samples
            .column(0)
            .iter()
            .map(|v| (v - mean0) * (v - mean0))
            .sum::<f64>()
            / 20000.0;
        assert_relative_eq!(var0, 0.04, epsilon = 0.005);
    }

    #[test]
    fn test_sample_posterior_requires_covariance() {
        let result = FitResult::failed("test", Duration::from_secs(0), "no".to_string());
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert!(matches!(
            result.sample_posterior(10, &mut rng),
            Err(FitError::SingularCovariance)
        ));
    }

    #[test]
    fn test_display_mentions_status() {
        let result = FitResult::failed("DE", Duration::from_millis(1500), "budget".to_string());
        let text = format!("{}", result);
        assert!(text.contains("failed"));
        assert!(text.contains("DE"));
        assert!(text.contains("budget"));
    }
}
