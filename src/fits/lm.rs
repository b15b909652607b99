//! Gradient-based least-squares strategy.
//!
//! Damped Gauss-Newton over the weighted residual vector. Steps are taken in
//! a scaled space where each parameter is divided by half its admissible
//! range, so tolerances behave uniformly across parameters with very
//! different magnitudes. On convergence a covariance estimate is produced
//! from the Jacobian at the solution; a singular curvature matrix degrades
//! to a zero matrix and is recorded in the result message.

use std::time::Instant;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::fits::registry::FluxEstimation;
use crate::fits::{data_driven_guess, FitResult, FitStatus, FitStrategy, Objective};
use crate::utils::finite_difference;

/// Shape of the least-squares loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Loss {
    /// Plain sum of squared residuals.
    #[default]
    Quadratic,
    /// Smooth-l1 robust loss; behaves quadratically for small residuals and
    /// linearly for outliers.
    SoftL1,
}

impl Loss {
    /// Transform one weighted residual so that summing the squares of the
    /// transformed values yields the robust cost.
    fn transform(self, r: f64) -> f64 {
        match self {
            Loss::Quadratic => r,
            Loss::SoftL1 => {
                let rho = 2.0 * ((1.0 + r * r).sqrt() - 1.0);
                rho.sqrt().copysign(r)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmConfig {
    /// Residual-evaluation budget, Jacobian evaluations included.
    pub max_evaluations: usize,
    /// Relative cost-reduction tolerance.
    pub ftol: f64,
    /// Relative step-size tolerance in scaled space.
    pub xtol: f64,
    /// Gradient infinity-norm tolerance.
    pub gtol: f64,
    pub initial_lambda: f64,
    pub lambda_increase: f64,
    pub lambda_decrease: f64,
    pub max_lambda: f64,
    pub loss: Loss,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_evaluations: 50_000,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
            initial_lambda: 1e-3,
            lambda_increase: 10.0,
            lambda_decrease: 0.1,
            max_lambda: 1e12,
            loss: Loss::default(),
        }
    }
}

impl LmConfig {
    /// Parse a configuration from its JSON representation.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GradientLeastSquares {
    config: LmConfig,
    guess: Option<Array1<f64>>,
}

impl GradientLeastSquares {
    pub fn new() -> Self {
        Self {
            config: LmConfig::default(),
            guess: None,
        }
    }

    pub fn with_config(mut self, config: LmConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from an explicit candidate instead of the data-driven guess.
    pub fn with_initial_guess(mut self, guess: Array1<f64>) -> Self {
        self.guess = Some(guess);
        self
    }

    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.config.max_evaluations = max_evaluations;
        self
    }

    pub fn with_loss(mut self, loss: Loss) -> Self {
        self.config.loss = loss;
        self
    }

    /// Jacobian of the weighted residuals at `x`, analytic when the model
    /// and flux mode allow it, central differences otherwise. Difference
    /// steps follow the registry bound widths, not the parameter magnitudes.
    fn jacobian(
        &self,
        objective: &Objective,
        x: &Array1<f64>,
        scale: &Array1<f64>,
        evaluations: &mut usize,
    ) -> Result<Array2<f64>> {
        if self.config.loss == Loss::Quadratic {
            if let Some(jac) = self.analytic_jacobian(objective, x)? {
                return Ok(jac);
            }
        }
        let n = x.len();
        let loss = self.config.loss;
        let f = |candidate: &Array1<f64>| {
            objective
                .residuals(candidate)
                .map(|r| r.mapv(|v| loss.transform(v)))
        };
        *evaluations += 2 * n;
        finite_difference::jacobian_scaled(&f, x, scale)
    }

    /// Closed-form residual Jacobian. Available only when the model carries
    /// an analytic magnification Jacobian, fluxes are free parameters and no
    /// error rescaling or astrometry is active, so every residual column has
    /// a closed form.
    fn analytic_jacobian(
        &self,
        objective: &Objective,
        x: &Array1<f64>,
    ) -> Result<Option<Array2<f64>>> {
        let registry = objective.registry();
        let model = objective.model();
        if !model.has_analytic_jacobian()
            || registry.flux_estimation() != FluxEstimation::FreeParameters
            || registry.rescale_photometry()
            || objective.event().has_astrometry()
        {
            return Ok(None);
        }

        let parameters = model.resolve(&registry.physical_slice(x)?)?;
        let m = objective.n_residuals();
        let n = x.len();
        let mut jac = Array2::zeros((m, n));
        let mut row = 0;

        for telescope in &objective.event().telescopes {
            let phot = match &telescope.photometry {
                Some(p) => p,
                None => continue,
            };
            let model_jac = match model.magnification_jacobian(telescope, &parameters)? {
                Some(j) => j,
                None => return Ok(None),
            };
            let magnification = match model.magnification(telescope, &parameters)? {
                Some(a) => a,
                None => return Ok(None),
            };
            let fluxes = objective.telescope_fluxes(x, telescope, &magnification)?;
            let fs_index = registry
                .index_of(&format!("fsource_{}", telescope.name))
                .ok_or_else(|| {
                    FitError::Evaluation(format!(
                        "no flux parameters for telescope '{}'",
                        telescope.name
                    ))
                })?;
            let fb_index = registry
                .index_of(&format!("fblend_{}", telescope.name))
                .ok_or_else(|| {
                    FitError::Evaluation(format!(
                        "no flux parameters for telescope '{}'",
                        telescope.name
                    ))
                })?;

            for i in 0..phot.time.len() {
                let sigma = phot.err_flux[i];
                // r = (f_obs - fs·A - fb)/σ.
                for p in 0..3 {
                    jac[[row, p]] = -fluxes.f_source * model_jac[[i, p]] / sigma;
                }
                jac[[row, fs_index]] = -magnification[i] / sigma;
                jac[[row, fb_index]] = -1.0 / sigma;
                row += 1;
            }
        }
        Ok(Some(jac))
    }
}

impl FitStrategy for GradientLeastSquares {
    fn fit_type(&self) -> &'static str {
        "gradient least squares"
    }

    fn initial_guess(&self, objective: &Objective) -> Result<Option<Array1<f64>>> {
        match &self.guess {
            Some(guess) => Ok(Some(guess.clone())),
            None => data_driven_guess(objective),
        }
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

        let mut x = match self.initial_guess(objective)? {
            Some(guess) => guess,
            None => {
                return Ok(FitResult::failed(
                    fit_type,
                    start.elapsed(),
                    "no initial guess could be derived from the data".to_string(),
                ))
            }
        };
        let registry = objective.registry();
        if x.len() != registry.len() {
            return Err(FitError::DimensionMismatch(format!(
                "initial guess has {} entries, registry declares {}",
                x.len(),
                registry.len()
            )));
        }

        let scale: Array1<f64> = registry
            .bounds()
            .iter()
            .map(|&(lo, hi)| {
                let half = 0.5 * (hi - lo);
                if half.is_finite() && half > 0.0 {
                    half
                } else {
                    1.0
                }
            })
            .collect();

        let loss = self.config.loss;
        let mut residuals = match objective.residuals(&x) {
            Ok(r) => r.mapv(|v| loss.transform(v)),
            Err(FitError::DegenerateModel(msg)) | Err(FitError::Evaluation(msg)) => {
                return Ok(FitResult::failed(fit_type, start.elapsed(), msg))
            }
            Err(err) => return Err(err),
        };
        let mut cost: f64 = residuals.iter().map(|v| v * v).sum();
        let mut evaluations = 1usize;
        let mut lambda = self.config.initial_lambda;

        let mut status = FitStatus::Failed;
        let mut message;
        let mut improved = false;

        'outer: loop {
            let jac_x = match self.jacobian(objective, &x, &scale, &mut evaluations) {
                Ok(j) => j,
                Err(FitError::DegenerateModel(msg)) | Err(FitError::Evaluation(msg)) => {
                    message = format!("Jacobian evaluation failed: {}", msg);
                    break;
                }
                Err(err) => return Err(err),
            };
            // Scaled-space Jacobian: column i picks up scale_i.
            let m = jac_x.nrows();
            let n = jac_x.ncols();
            let mut jac = jac_x.clone();
            for p in 0..n {
                for i in 0..m {
                    jac[[i, p]] *= scale[p];
                }
            }

            let gradient = jac.t().dot(&residuals);
            let g_norm = gradient.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            if g_norm < self.config.gtol {
                status = FitStatus::Converged;
                message = "gradient norm below tolerance".to_string();
                break;
            }

            let jtj = jac.t().dot(&jac);

            loop {
                if evaluations >= self.config.max_evaluations {
                    message = format!("evaluation budget of {} exhausted", evaluations);
                    break 'outer;
                }

                // Marquardt curvature scaling: shallow directions receive
                // proportionally small damping, so they keep moving while
                // steep directions stay stable.
                let mut damped = jtj.clone();
                for d in 0..n {
                    damped[[d, d]] += lambda * jtj[[d, d]].max(1e-12);
                }
                let step = match solve_linear(&damped, &gradient.mapv(|v| -v)) {
                    Some(s) => s,
                    None => {
                        lambda *= self.config.lambda_increase;
                        if lambda > self.config.max_lambda {
                            message = "damped system stayed singular".to_string();
                            break 'outer;
                        }
                        continue;
                    }
                };

                let mut x_new = x.clone();
                for p in 0..n {
                    let (lo, hi) = registry.bounds()[p];
                    x_new[p] = (x[p] + step[p] * scale[p]).clamp(lo, hi);
                }

                evaluations += 1;
                let trial = objective.residuals(&x_new);
                let (residuals_new, cost_new) = match trial {
                    Ok(r) => {
                        let r = r.mapv(|v| loss.transform(v));
                        let c: f64 = r.iter().map(|v| v * v).sum();
                        (r, c)
                    }
                    Err(FitError::DegenerateModel(_)) | Err(FitError::Evaluation(_)) => {
                        lambda *= self.config.lambda_increase;
                        if lambda > self.config.max_lambda {
                            message = "no evaluable downhill step found".to_string();
                            break 'outer;
                        }
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                if cost_new.is_finite() && cost_new < cost {
                    let reduction = cost - cost_new;
                    // Predicted reduction of the quadratic model for the
                    // clamped step actually taken.
                    let mut taken = Array1::zeros(n);
                    for p in 0..n {
                        taken[p] = (x_new[p] - x[p]) / scale[p];
                    }
                    let predicted =
                        -(2.0 * gradient.dot(&taken) + taken.dot(&jtj.dot(&taken)));
                    let step_norm = taken.iter().map(|v| v * v).sum::<f64>().sqrt();
                    let u_norm = x
                        .iter()
                        .zip(scale.iter())
                        .map(|(v, s)| (v / s) * (v / s))
                        .sum::<f64>()
                        .sqrt();

                    x = x_new;
                    residuals = residuals_new;
                    cost = cost_new;
                    improved = true;
                    lambda = (lambda * self.config.lambda_decrease).max(1e-12);

                    // A damped step can be small while the quadratic model
                    // still promises progress; both reductions must be
                    // negligible before the cost is considered settled.
                    let threshold = self.config.ftol * cost.max(f64::MIN_POSITIVE);
                    if reduction <= threshold && predicted <= threshold {
                        status = FitStatus::Converged;
                        message = "cost reduction below tolerance".to_string();
                        break 'outer;
                    }
                    if step_norm <= self.config.xtol * (self.config.xtol + u_norm) {
                        status = FitStatus::Converged;
                        message = "step size below tolerance".to_string();
                        break 'outer;
                    }
                    break;
                }

                lambda *= self.config.lambda_increase;
                if lambda > self.config.max_lambda {
                    if improved {
                        status = FitStatus::Converged;
                        message =
                            "no further downhill step; accepting current minimum".to_string();
                    } else {
                        message = "no downhill step found from the initial guess".to_string();
                    }
                    break 'outer;
                }
            }
        }

        if status == FitStatus::Failed {
            return Ok(FitResult::failed(fit_type, start.elapsed(), message));
        }

        // Covariance in the original parameter space.
        let covariance = match self.jacobian(objective, &x, &scale, &mut evaluations) {
            Ok(jac_x) => {
                let m = jac_x.nrows();
                let n = jac_x.ncols();
                if m > n {
                    let jtj = jac_x.t().dot(&jac_x);
                    match invert_matrix(&jtj) {
                        Some(inverse) => inverse * (cost / (m - n) as f64),
                        None => {
                            message.push_str("; curvature matrix singular, covariance zeroed");
                            Array2::zeros((n, n))
                        }
                    }
                } else {
                    message.push_str("; fewer residuals than parameters, covariance zeroed");
                    Array2::zeros((n, n))
                }
            }
            Err(FitError::DegenerateModel(_)) | Err(FitError::Evaluation(_)) => {
                let n = x.len();
                message.push_str("; Jacobian failed at the solution, covariance zeroed");
                Array2::zeros((n, n))
            }
            Err(err) => return Err(err),
        };

        Ok(FitResult {
            fit_type,
            status,
            best_parameters: Some(x),
            cost: Some(cost),
            covariance: Some(covariance),
            pareto_front: None,
            population: None,
            wall_time: start.elapsed(),
            message,
        })
    }
}

/// Solve A·x = b by Gaussian elimination with partial pivoting. `None` when
/// a pivot vanishes.
pub(crate) fn solve_linear(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.len() != n {
        return None;
    }
    let mut work = a.clone();
    let mut rhs = b.clone();

    for col in 0..n {
        let mut pivot = col;
        for row in (col + 1)..n {
            if work[[row, col]].abs() > work[[pivot, col]].abs() {
                pivot = row;
            }
        }
        if work[[pivot, col]].abs() < 1e-300 || !work[[pivot, col]].is_finite() {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                work.swap([col, k], [pivot, k]);
            }
            rhs.swap(col, pivot);
        }
        for row in (col + 1)..n {
            let factor = work[[row, col]] / work[[col, col]];
            for k in col..n {
                work[[row, k]] -= factor * work[[col, k]];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let mut sum = rhs[row];
        for k in (row + 1)..n {
            sum -= work[[row, k]] * x[k];
        }
        x[row] = sum / work[[row, row]];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Invert a square matrix by Gauss-Jordan elimination, `None` when singular.
pub(crate) fn invert_matrix(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return None;
    }
    let mut work = a.clone();
    let mut inverse: Array2<f64> = Array2::eye(n);

    for col in 0..n {
        let mut pivot = col;
        for row in (col + 1)..n {
            if work[[row, col]].abs() > work[[pivot, col]].abs() {
                pivot = row;
            }
        }
        if work[[pivot, col]].abs() < 1e-300 || !work[[pivot, col]].is_finite() {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                work.swap([col, k], [pivot, k]);
                inverse.swap([col, k], [pivot, k]);
            }
        }
        let diag = work[[col, col]];
        for k in 0..n {
            work[[col, k]] /= diag;
            inverse[[col, k]] /= diag;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = work[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for k in 0..n {
                work[[row, k]] -= factor * work[[col, k]];
                inverse[[row, k]] -= factor * inverse[[col, k]];
            }
        }
    }
    inverse.iter().all(|v| v.is_finite()).then_some(inverse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Telescope};
    use crate::fits::registry::{FitParameters, FluxEstimation};
    use crate::models::{MicrolensModel, ParallaxConfig, PsplModel};
    use crate::parallax::ParallaxMode;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn synthetic_event() -> Event {
        let model = PsplModel::new();
        let times: Vec<f64> = (0..80).map(|i| -20.0 + 0.5 * i as f64).collect();
        let generator = Telescope::new("synthetic")
            .with_flux_lightcurve(&times, &vec![1.0; 80], &vec![0.1; 80])
            .unwrap();

        let params = model.resolve(&array![0.0, 0.2, 15.0].view()).unwrap();
        let magnification = model.magnification(&generator, &params).unwrap().unwrap();
        let flux: Vec<f64> = magnification.iter().map(|&a| 120.0 * a + 30.0).collect();

        let mut event = Event::new("synthetic", 270.0, -29.0);
        event.telescopes.push(
            Telescope::new("synthetic")
                .with_flux_lightcurve(&times, &flux, &vec![0.5; 80])
                .unwrap(),
        );
        event
    }

    #[test]
    fn test_solve_linear_known_system() {
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let b = array![5.0, 10.0];
        let x = solve_linear(&a, &b).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_linear_singular() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let b = array![1.0, 2.0];
        assert!(solve_linear(&a, &b).is_none());
    }

    #[test]
    fn test_invert_matrix_roundtrip() {
        let a = array![[4.0, 1.0], [2.0, 3.0]];
        let inv = invert_matrix(&a).unwrap();
        let product = a.dot(&inv);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(product[[i, j]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_recovers_pspl_parameters_from_near_guess() {
        let event = synthetic_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let strategy =
            GradientLeastSquares::new().with_initial_guess(array![1.0, 0.25, 13.0]);
        let result = strategy.fit(&objective).unwrap();

        assert!(result.is_converged(), "message: {}", result.message);
        let best = result.best_parameters.unwrap();
        assert_relative_eq!(best[0], 0.0, epsilon = 1e-4);
        assert_relative_eq!(best[1], 0.2, epsilon = 1e-4);
        assert_relative_eq!(best[2], 15.0, epsilon = 1e-3);
        assert!(result.cost.unwrap() < 1e-6);
    }

    #[test]
    fn test_covariance_is_square_and_symmetric() {
        let event = synthetic_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let strategy =
            GradientLeastSquares::new().with_initial_guess(array![1.0, 0.25, 13.0]);
        let result = strategy.fit(&objective).unwrap();
        let covariance = result.covariance.unwrap();
        assert_eq!(covariance.shape(), &[3, 3]);
        for i in 0..3 {
            assert!(covariance[[i, i]] >= 0.0);
            for j in 0..3 {
                assert_relative_eq!(
                    covariance[[i, j]],
                    covariance[[j, i]],
                    epsilon = 1e-8,
                    max_relative = 1e-6
                );
            }
        }
    }

    #[test]
    fn test_default_guess_converges() {
        let event = synthetic_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let result = GradientLeastSquares::new().fit(&objective).unwrap();
        assert!(result.is_converged(), "message: {}", result.message);
        assert!(result.cost.unwrap().is_finite());
    }

    #[test]
    fn test_free_flux_mode_uses_analytic_jacobian() {
        let event = synthetic_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::FreeParameters, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let strategy = GradientLeastSquares::new()
            .with_initial_guess(array![1.0, 0.25, 13.0, 100.0, 40.0]);
        let jac = strategy
            .analytic_jacobian(&objective, &array![1.0, 0.25, 13.0, 100.0, 40.0])
            .unwrap()
            .unwrap();
        assert_eq!(jac.shape(), &[80, 5]);

        let result = strategy.fit(&objective).unwrap();
        assert!(result.is_converged(), "message: {}", result.message);
        let best = result.best_parameters.unwrap();
        assert_relative_eq!(best[1], 0.2, epsilon = 1e-3);
        assert_relative_eq!(best[3], 120.0, max_relative = 1e-3);
        assert_relative_eq!(best[4], 30.0, max_relative = 1e-2);
    }

    #[test]
    fn test_soft_l1_matches_quadratic_for_small_residuals() {
        for &r in &[1e-4, -2e-3, 5e-5] {
            assert_relative_eq!(Loss::SoftL1.transform(r), r, max_relative = 1e-5);
        }
        // Outliers are compressed toward linear growth.
        assert!(Loss::SoftL1.transform(100.0) < 100.0);
        assert!(Loss::SoftL1.transform(-100.0) > -100.0);
    }

    #[test]
    fn test_soft_l1_fit_recovers_parameters() {
        let event = synthetic_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let strategy = GradientLeastSquares::new()
            .with_loss(Loss::SoftL1)
            .with_initial_guess(array![1.0, 0.25, 13.0]);
        let result = strategy.fit(&objective).unwrap();

        assert!(result.is_converged(), "message: {}", result.message);
        let best = result.best_parameters.unwrap();
        assert_relative_eq!(best[0], 0.0, epsilon = 1e-3);
        assert_relative_eq!(best[1], 0.2, epsilon = 1e-3);
        assert_relative_eq!(best[2], 15.0, epsilon = 1e-2);
    }

    #[test]
    fn test_invert_matrix_singular() {
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(invert_matrix(&a).is_none());
    }

    #[test]
    fn test_flat_curve_degrades_covariance_to_zero() {
        // A flat light curve far from the event makes the source and blend
        // flux columns identical, so the curvature matrix is singular.
        let times: Vec<f64> = (0..21).map(|i| i as f64).collect();
        let mut event = Event::new("flat", 0.0, 0.0);
        event.telescopes.push(
            Telescope::new("flat")
                .with_flux_lightcurve(&times, &vec![100.0; 21], &vec![1.0; 21])
                .unwrap(),
        );
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::FreeParameters, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        // The guess already reproduces the data exactly (A = 1 everywhere).
        let strategy = GradientLeastSquares::new()
            .with_initial_guess(array![1e6, 0.5, 1.0, 0.0, 100.0]);
        let result = strategy.fit(&objective).unwrap();

        assert!(result.is_converged());
        let covariance = result.covariance.unwrap();
        for v in covariance.iter() {
            assert_eq!(*v, 0.0);
        }
        assert!(result.message.contains("covariance"));
    }

    #[test]
    fn test_uncombined_parallax_yields_failed_result() {
        // A parallax model whose telescope never went through
        // parallax::combine cannot evaluate; the strategy must report that
        // as a failed result, not bubble an error out of fit().
        let event = synthetic_event();
        let model = PsplModel::new().with_parallax(ParallaxConfig {
            mode: ParallaxMode::Annual,
            t0_par: 0.0,
        });
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let strategy = GradientLeastSquares::new()
            .with_initial_guess(array![0.0, 0.2, 15.0, 0.1, 0.1]);
        let result = strategy.fit(&objective).unwrap();
        assert_eq!(result.status, FitStatus::Failed);
        assert!(result.message.contains("deltas"), "message: {}", result.message);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = LmConfig {
            max_evaluations: 123,
            loss: Loss::SoftL1,
            ..LmConfig::default()
        };
        let text = config.to_json().unwrap();
        let back = LmConfig::from_json(&text).unwrap();
        assert_eq!(back.max_evaluations, 123);
        assert_eq!(back.loss, Loss::SoftL1);
        assert!(matches!(
            LmConfig::from_json("not json"),
            Err(FitError::JsonError(_))
        ));
    }

    #[test]
    fn test_insufficient_data_yields_failed_result() {
        let mut event = Event::new("tiny", 0.0, 0.0);
        event.telescopes.push(
            Telescope::new("tiny")
                .with_flux_lightcurve(&[0.0, 1.0, 2.0], &[1.0, 2.0, 1.0], &[0.1, 0.1, 0.1])
                .unwrap(),
        );
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::FreeParameters, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        // 3 points for 5 free parameters.
        let result = GradientLeastSquares::new().fit(&objective).unwrap();
        assert_eq!(result.status, FitStatus::Failed);
        assert!(result.best_parameters.is_none());
    }
}
