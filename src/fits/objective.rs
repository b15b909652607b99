//! Fit objective: candidate vector in, residuals or likelihood out.
//!
//! The objective borrows the model, the event and the parameter registry for
//! the duration of one fit and is the only thing the strategies talk to. All
//! strategies minimizing over bounded vectors see the same evaluation
//! semantics; population searches additionally get the penalty mapping so a
//! degenerate candidate never poisons a generation with NaN.

use ndarray::Array1;

use crate::error::{FitError, Result};
use crate::event::{Event, Telescope};
use crate::fits::registry::{FitParameters, FluxEstimation};
use crate::models::{MicrolensModel, ModelParameters};

/// Finite cost assigned to candidates whose evaluation fails or is
/// non-finite. Large enough to lose every selection, small enough to keep
/// population statistics finite.
pub const PENALTY_COST: f64 = 1e10;

const LN_2PI: f64 = 1.837877066409345;

/// Source and blend flux of one telescope under one candidate.
#[derive(Debug, Clone, Copy)]
pub struct TelescopeFluxes {
    pub f_source: f64,
    pub f_blend: f64,
}

pub struct Objective<'a> {
    model: &'a dyn MicrolensModel,
    event: &'a Event,
    registry: &'a FitParameters,
}

impl<'a> Objective<'a> {
    pub fn new(
        model: &'a dyn MicrolensModel,
        event: &'a Event,
        registry: &'a FitParameters,
    ) -> Result<Self> {
        if event.telescopes.len() != registry.n_telescopes() {
            return Err(FitError::InvalidConfiguration(format!(
                "registry was built for {} telescopes, event has {}",
                registry.n_telescopes(),
                event.telescopes.len()
            )));
        }
        Ok(Self {
            model,
            event,
            registry,
        })
    }

    pub fn model(&self) -> &dyn MicrolensModel {
        self.model
    }

    pub fn event(&self) -> &Event {
        self.event
    }

    pub fn registry(&self) -> &FitParameters {
        self.registry
    }

    /// Verify that the event can support a fit at all. Called once by every
    /// strategy before optimization starts.
    pub fn check_data(&self) -> Result<()> {
        if !self.event.has_photometry() && !self.event.has_astrometry() {
            return Err(FitError::InsufficientData(
                "event carries no photometric or astrometric data".to_string(),
            ));
        }
        for telescope in &self.event.telescopes {
            if telescope.photometry.is_some() && telescope.n_data() < 2 {
                return Err(FitError::InsufficientData(format!(
                    "telescope '{}' has {} photometric points, need at least 2 \
                     to resolve source and blend flux",
                    telescope.name,
                    telescope.n_data()
                )));
            }
        }
        let n_free = self.registry.len();
        let n_points = self.event.n_data()
            + self
                .event
                .telescopes
                .iter()
                .map(|t| 2 * t.n_astrometry())
                .sum::<usize>();
        if n_points <= n_free {
            return Err(FitError::InsufficientData(format!(
                "{} data points for {} free parameters",
                n_points, n_free
            )));
        }
        Ok(())
    }

    /// Total number of residual entries (photometric points plus two per
    /// astrometric epoch).
    pub fn n_residuals(&self) -> usize {
        let phot: usize = self.event.telescopes.iter().map(|t| t.n_data()).sum();
        let astro: usize = self
            .event
            .telescopes
            .iter()
            .map(|t| 2 * t.n_astrometry())
            .sum();
        phot + astro
    }

    /// Source/blend flux of one telescope under a candidate: read off the
    /// vector in free-flux mode, otherwise solved in closed form against the
    /// observed flux.
    pub fn telescope_fluxes(
        &self,
        candidate: &Array1<f64>,
        telescope: &Telescope,
        magnification: &Array1<f64>,
    ) -> Result<TelescopeFluxes> {
        if self.registry.flux_estimation() == FluxEstimation::FreeParameters {
            if let Some((f_source, f_blend)) = self.registry.fluxes(candidate, &telescope.name) {
                return Ok(TelescopeFluxes { f_source, f_blend });
            }
        }
        let phot = telescope.photometry.as_ref().ok_or_else(|| {
            FitError::Evaluation(format!("telescope '{}' has no photometry", telescope.name))
        })?;
        solve_fluxes(&phot.flux, &phot.err_flux, magnification, &telescope.name)
    }

    fn resolved(&self, candidate: &Array1<f64>) -> Result<ModelParameters> {
        let physical = self.registry.physical_slice(candidate)?;
        self.model.resolve(&physical)
    }

    /// Weighted residual vector over all telescopes and data kinds, in the
    /// fixed order (telescope 0 photometry, telescope 0 astrometry ra then
    /// dec, telescope 1 photometry, ...).
    pub fn residuals(&self, candidate: &Array1<f64>) -> Result<Array1<f64>> {
        let parameters = self.resolved(candidate)?;
        let mut out = Vec::with_capacity(self.n_residuals());

        for telescope in &self.event.telescopes {
            if let Some(phot) = &telescope.photometry {
                let magnification = self
                    .model
                    .magnification(telescope, &parameters)?
                    .ok_or_else(|| {
                        FitError::Evaluation(format!(
                            "no magnification for telescope '{}'",
                            telescope.name
                        ))
                    })?;
                let fluxes = self.telescope_fluxes(candidate, telescope, &magnification)?;
                let scale = self.registry.rescaling_factor(candidate, &telescope.name);
                for i in 0..phot.time.len() {
                    let predicted = fluxes.f_source * magnification[i] + fluxes.f_blend;
                    out.push((phot.flux[i] - predicted) / (phot.err_flux[i] * scale));
                }
            }
            if let Some(astro) = &telescope.astrometry {
                if let Some(positions) = self.model.astrometric_shift(telescope, &parameters)? {
                    for i in 0..astro.time.len() {
                        out.push((astro.ra[i] - positions[[0, i]]) / astro.err_ra[i]);
                    }
                    for i in 0..astro.time.len() {
                        out.push((astro.dec[i] - positions[[1, i]]) / astro.err_dec[i]);
                    }
                }
            }
        }

        if out.is_empty() {
            return Err(FitError::InsufficientData(
                "candidate produced no residuals".to_string(),
            ));
        }
        Ok(Array1::from_vec(out))
    }

    /// Photometric negative log-likelihood,
    /// 0.5 Σ (r² + ln(2π σ²)) over all photometric points.
    pub fn photometric_likelihood(&self, candidate: &Array1<f64>) -> Result<f64> {
        let parameters = self.resolved(candidate)?;
        let mut total = 0.0;

        for telescope in &self.event.telescopes {
            let phot = match &telescope.photometry {
                Some(p) => p,
                None => continue,
            };
            let magnification = self
                .model
                .magnification(telescope, &parameters)?
                .ok_or_else(|| {
                    FitError::Evaluation(format!(
                        "no magnification for telescope '{}'",
                        telescope.name
                    ))
                })?;
            let fluxes = self.telescope_fluxes(candidate, telescope, &magnification)?;
            let scale = self.registry.rescaling_factor(candidate, &telescope.name);
            for i in 0..phot.time.len() {
                let sigma = phot.err_flux[i] * scale;
                let r = (phot.flux[i] - fluxes.f_source * magnification[i] - fluxes.f_blend)
                    / sigma;
                total += 0.5 * (r * r + LN_2PI + (sigma * sigma).ln());
            }
        }
        Ok(total)
    }

    /// Astrometric negative log-likelihood over both sky axes.
    pub fn astrometric_likelihood(&self, candidate: &Array1<f64>) -> Result<f64> {
        let parameters = self.resolved(candidate)?;
        let mut total = 0.0;

        for telescope in &self.event.telescopes {
            let astro = match &telescope.astrometry {
                Some(a) => a,
                None => continue,
            };
            let positions = match self.model.astrometric_shift(telescope, &parameters)? {
                Some(p) => p,
                None => continue,
            };
            for i in 0..astro.time.len() {
                let r_ra = (astro.ra[i] - positions[[0, i]]) / astro.err_ra[i];
                let r_dec = (astro.dec[i] - positions[[1, i]]) / astro.err_dec[i];
                total += 0.5 * (r_ra * r_ra + LN_2PI + (astro.err_ra[i].powi(2)).ln());
                total += 0.5 * (r_dec * r_dec + LN_2PI + (astro.err_dec[i].powi(2)).ln());
            }
        }
        Ok(total)
    }

    /// Joint negative log-likelihood.
    pub fn likelihood(&self, candidate: &Array1<f64>) -> Result<f64> {
        Ok(self.photometric_likelihood(candidate)? + self.astrometric_likelihood(candidate)?)
    }

    /// Likelihood with degenerate or unevaluable candidates mapped to
    /// [`PENALTY_COST`], so a population search never sees NaN.
    pub fn likelihood_or_penalty(&self, candidate: &Array1<f64>) -> f64 {
        match self.likelihood(candidate) {
            Ok(value) if value.is_finite() => value,
            _ => PENALTY_COST,
        }
    }

    /// Photometric likelihood with the penalty mapping, for multi-objective
    /// searches.
    pub fn photometric_or_penalty(&self, candidate: &Array1<f64>) -> f64 {
        match self.photometric_likelihood(candidate) {
            Ok(value) if value.is_finite() => value,
            _ => PENALTY_COST,
        }
    }

    /// Astrometric likelihood with the penalty mapping.
    pub fn astrometric_or_penalty(&self, candidate: &Array1<f64>) -> f64 {
        match self.astrometric_likelihood(candidate) {
            Ok(value) if value.is_finite() => value,
            _ => PENALTY_COST,
        }
    }

    /// Sum of squared weighted residuals; the quantity the gradient strategy
    /// minimizes.
    pub fn chi_square(&self, candidate: &Array1<f64>) -> Result<f64> {
        let r = self.residuals(candidate)?;
        Ok(r.iter().map(|v| v * v).sum())
    }
}

/// Closed-form weighted least-squares solve for (f_source, f_blend) given a
/// magnification curve: minimizes Σ w (f_obs - fs·A - fb)².
fn solve_fluxes(
    flux: &Array1<f64>,
    err_flux: &Array1<f64>,
    magnification: &Array1<f64>,
    telescope_name: &str,
) -> Result<TelescopeFluxes> {
    let n = flux.len();
    if n < 2 {
        return Err(FitError::InsufficientData(format!(
            "telescope '{}' has {} points, need at least 2 for the flux solve",
            telescope_name, n
        )));
    }

    let mut s_aa = 0.0;
    let mut s_a = 0.0;
    let mut s_1 = 0.0;
    let mut s_af = 0.0;
    let mut s_f = 0.0;
    for i in 0..n {
        let w = 1.0 / (err_flux[i] * err_flux[i]);
        let a = magnification[i];
        s_aa += w * a * a;
        s_a += w * a;
        s_1 += w;
        s_af += w * a * flux[i];
        s_f += w * flux[i];
    }

    let det = s_aa * s_1 - s_a * s_a;
    if !det.is_finite() || det.abs() < 1e-300 {
        return Err(FitError::Evaluation(format!(
            "singular flux system for telescope '{}'",
            telescope_name
        )));
    }

    Ok(TelescopeFluxes {
        f_source: (s_af * s_1 - s_f * s_a) / det,
        f_blend: (s_aa * s_f - s_a * s_af) / det,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Telescope;
    use crate::models::PsplModel;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn synthetic_event(f_source: f64, f_blend: f64) -> Event {
        let model = PsplModel::new();
        let times: Vec<f64> = (0..40).map(|i| -20.0 + i as f64).collect();
        let mut telescope = Telescope::new("synthetic")
            .with_flux_lightcurve(&times, &vec![1.0; 40], &vec![0.1; 40])
            .unwrap();

        let params = model.resolve(&array![0.0, 0.2, 15.0].view()).unwrap();
        let magnification = model.magnification(&telescope, &params).unwrap().unwrap();
        let flux: Vec<f64> = magnification
            .iter()
            .map(|&a| f_source * a + f_blend)
            .collect();
        telescope = Telescope::new("synthetic")
            .with_flux_lightcurve(&times, &flux, &vec![0.1; 40])
            .unwrap();

        let mut event = Event::new("synthetic", 270.0, -29.0);
        event.telescopes.push(telescope);
        event
    }

    #[test]
    fn test_closed_form_fluxes_recover_truth() {
        let event = synthetic_event(120.0, 30.0);
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let truth = array![0.0, 0.2, 15.0];
        let params = model.resolve(&registry.physical_slice(&truth).unwrap()).unwrap();
        let magnification = model
            .magnification(&event.telescopes[0], &params)
            .unwrap()
            .unwrap();
        let fluxes = objective
            .telescope_fluxes(&truth, &event.telescopes[0], &magnification)
            .unwrap();
        assert_relative_eq!(fluxes.f_source, 120.0, max_relative = 1e-9);
        assert_relative_eq!(fluxes.f_blend, 30.0, max_relative = 1e-8);
    }

    #[test]
    fn test_residuals_vanish_at_truth() {
        let event = synthetic_event(120.0, 30.0);
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let r = objective.residuals(&array![0.0, 0.2, 15.0]).unwrap();
        assert_eq!(r.len(), 40);
        for &v in r.iter() {
            assert_relative_eq!(v, 0.0, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_likelihood_prefers_truth() {
        let event = synthetic_event(120.0, 30.0);
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let at_truth = objective.likelihood(&array![0.0, 0.2, 15.0]).unwrap();
        let off_truth = objective.likelihood(&array![3.0, 0.6, 9.0]).unwrap();
        assert!(at_truth < off_truth);
    }

    #[test]
    fn test_penalty_is_finite_for_bad_candidate() {
        let event = synthetic_event(120.0, 30.0);
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        // tE = 0 degenerates the trajectory; the penalty stays finite.
        let cost = objective.likelihood_or_penalty(&array![0.0, 0.2, 0.0]);
        assert!(cost.is_finite());
    }

    #[test]
    fn test_check_data_rejects_starved_telescope() {
        let mut event = synthetic_event(120.0, 30.0);
        event.telescopes.push(
            Telescope::new("lonely")
                .with_flux_lightcurve(&[5.0], &[1.0], &[0.1])
                .unwrap(),
        );
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();
        assert!(matches!(
            objective.check_data(),
            Err(FitError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_empty_event_fails_at_registry_build() {
        let event = Event::new("empty", 0.0, 0.0);
        let model = PsplModel::new();
        assert!(matches!(
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false),
            Err(FitError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_free_flux_mode_reads_candidate() {
        let event = synthetic_event(120.0, 30.0);
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::FreeParameters, false).unwrap();
        let objective = Objective::new(&model, &event, &registry).unwrap();

        let mut candidate = Array1::zeros(registry.len());
        candidate[0] = 0.0;
        candidate[1] = 0.2;
        candidate[2] = 15.0;
        candidate[registry.index_of("fsource_synthetic").unwrap()] = 120.0;
        candidate[registry.index_of("fblend_synthetic").unwrap()] = 30.0;

        let r = objective.residuals(&candidate).unwrap();
        for &v in r.iter() {
            assert_relative_eq!(v, 0.0, epsilon = 1e-7);
        }
    }
}
