//! Fit parameter registry.
//!
//! Ordered mapping from parameter name to (optimizer-vector index,
//! admissible range), derived once from a model and an event: physical
//! parameters first in declaration order, then per-telescope flux nuisance
//! parameters when fluxes are searched as free parameters, then per-telescope
//! error-rescaling exponents. Index assignment is stable for the lifetime of
//! one fit.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::event::Event;
use crate::models::MicrolensModel;

/// How per-telescope source/blend fluxes are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FluxEstimation {
    /// Closed-form weighted linear solve against the observed flux.
    ClosedForm,
    /// Fluxes appended to the optimizer vector as free parameters.
    FreeParameters,
}

#[derive(Debug, Clone)]
pub struct FitParameters {
    names: Vec<String>,
    bounds: Vec<(f64, f64)>,
    n_physical: usize,
    flux_estimation: FluxEstimation,
    rescale_photometry: bool,
    n_telescopes: usize,
}

impl FitParameters {
    /// Build the registry for one fit campaign.
    pub fn build(
        model: &dyn MicrolensModel,
        event: &Event,
        flux_estimation: FluxEstimation,
        rescale_photometry: bool,
    ) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        let mut bounds: Vec<(f64, f64)> = Vec::new();

        let span = event.time_span();
        let max_flux = event
            .telescopes
            .iter()
            .filter_map(|t| t.photometry.as_ref())
            .flat_map(|p| p.flux.iter().copied())
            .fold(f64::NAN, f64::max);

        for name in model.parameter_names() {
            names.push(name.to_string());
            bounds.push(default_bounds(name, event, span)?);
        }
        let n_physical = names.len();

        if flux_estimation == FluxEstimation::FreeParameters {
            for telescope in &event.telescopes {
                if telescope.photometry.is_none() {
                    continue;
                }
                let flux_cap = if max_flux.is_finite() && max_flux > 0.0 {
                    2.0 * max_flux
                } else {
                    1e8
                };
                names.push(format!("fsource_{}", telescope.name));
                bounds.push((0.0, flux_cap));
                names.push(format!("fblend_{}", telescope.name));
                bounds.push((-flux_cap, flux_cap));
            }
        }

        if rescale_photometry {
            for telescope in &event.telescopes {
                if telescope.photometry.is_none() {
                    continue;
                }
                names.push(format!("logk_photometry_{}", telescope.name));
                bounds.push((-5.0, 5.0));
            }
        }

        Ok(Self {
            names,
            bounds,
            n_physical,
            flux_estimation,
            rescale_photometry,
            n_telescopes: event.telescopes.len(),
        })
    }

    /// Override the admissible range of one parameter.
    pub fn with_bounds(mut self, name: &str, min: f64, max: f64) -> Result<Self> {
        if min >= max {
            return Err(FitError::InvalidConfiguration(format!(
                "bounds for '{}' are inverted: [{}, {}]",
                name, min, max
            )));
        }
        let index = self.index_of(name).ok_or_else(|| {
            FitError::InvalidConfiguration(format!("unknown parameter '{}'", name))
        })?;
        self.bounds[index] = (min, max);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn bounds(&self) -> &[(f64, f64)] {
        &self.bounds
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn n_physical(&self) -> usize {
        self.n_physical
    }

    pub fn flux_estimation(&self) -> FluxEstimation {
        self.flux_estimation
    }

    pub fn rescale_photometry(&self) -> bool {
        self.rescale_photometry
    }

    /// Physical-parameter slice of a candidate vector.
    pub fn physical_slice<'a>(&self, candidate: &'a Array1<f64>) -> Result<ArrayView1<'a, f64>> {
        if candidate.len() != self.len() {
            return Err(FitError::DimensionMismatch(format!(
                "candidate has {} entries, registry declares {}",
                candidate.len(),
                self.len()
            )));
        }
        Ok(candidate.slice(ndarray::s![..self.n_physical]))
    }

    /// (fsource, fblend) of a telescope from a candidate vector, free-flux
    /// mode only.
    pub fn fluxes(&self, candidate: &Array1<f64>, telescope_name: &str) -> Option<(f64, f64)> {
        let fs = self.index_of(&format!("fsource_{}", telescope_name))?;
        let fb = self.index_of(&format!("fblend_{}", telescope_name))?;
        Some((candidate[fs], candidate[fb]))
    }

    /// Error-rescaling factor 10^k of a telescope, 1.0 when not fitted.
    pub fn rescaling_factor(&self, candidate: &Array1<f64>, telescope_name: &str) -> f64 {
        match self.index_of(&format!("logk_photometry_{}", telescope_name)) {
            Some(index) => 10.0_f64.powf(candidate[index]),
            None => 1.0,
        }
    }

    /// Number of telescopes in the event the registry was built from.
    pub fn n_telescopes(&self) -> usize {
        self.n_telescopes
    }
}

fn default_bounds(name: &str, event: &Event, span: Option<(f64, f64)>) -> Result<(f64, f64)> {
    let bounds = match name {
        "t0" => match span {
            Some((lo, hi)) => (lo, hi),
            None => {
                return Err(FitError::InsufficientData(
                    "no photometric data to bound t0".to_string(),
                ))
            }
        },
        "u0" => (-1.0, 1.0),
        "tE" => (0.1, 500.0),
        "rho" => (1e-5, 0.05),
        "separation" => (0.1, 10.0),
        "mass_ratio" => (1e-6, 1.0),
        "alpha" => (-std::f64::consts::PI, std::f64::consts::PI),
        "piEN" | "piEE" => (-2.0, 2.0),
        "theta_E" => (1e-3, 10.0),
        "position_source_N" => astrometric_range(event, false),
        "position_source_E" => astrometric_range(event, true),
        "mu_source_N" | "mu_source_E" => (-20.0, 20.0),
        other => {
            return Err(FitError::InvalidConfiguration(format!(
                "no default bounds for parameter '{}'",
                other
            )))
        }
    };
    Ok(bounds)
}

fn astrometric_range(event: &Event, ra_axis: bool) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for telescope in &event.telescopes {
        if let Some(astro) = &telescope.astrometry {
            let column = if ra_axis { &astro.ra } else { &astro.dec };
            for &v in column.iter() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
    }
    if lo.is_finite() && hi.is_finite() {
        let margin = (hi - lo).max(1.0);
        (lo - margin, hi + margin)
    } else {
        (-1e4, 1e4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Telescope;
    use crate::models::PsplModel;
    use std::collections::HashSet;

    fn simple_event() -> Event {
        let mut event = Event::new("reg", 270.0, -29.0);
        event.telescopes.push(
            Telescope::new("OGLE")
                .with_flux_lightcurve(&[0.0, 10.0, 20.0], &[5.0, 9.0, 5.5], &[0.2, 0.2, 0.2])
                .unwrap(),
        );
        event.telescopes.push(
            Telescope::new("MOA")
                .with_flux_lightcurve(&[1.0, 11.0], &[4.0, 8.0], &[0.3, 0.3])
                .unwrap(),
        );
        event
    }

    #[test]
    fn test_index_assignment_is_bijection() {
        let event = simple_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::FreeParameters, false).unwrap();

        // 3 physical + 2 fluxes per telescope.
        assert_eq!(registry.len(), 7);

        let indices: HashSet<usize> = registry
            .names()
            .iter()
            .map(|n| registry.index_of(n).unwrap())
            .collect();
        assert_eq!(indices.len(), registry.len());
        assert_eq!(*indices.iter().max().unwrap(), registry.len() - 1);
    }

    #[test]
    fn test_index_assignment_is_stable() {
        let event = simple_event();
        let model = PsplModel::new();
        let a = FitParameters::build(&model, &event, FluxEstimation::FreeParameters, true).unwrap();
        let b = FitParameters::build(&model, &event, FluxEstimation::FreeParameters, true).unwrap();
        assert_eq!(a.names(), b.names());
        for name in a.names() {
            assert_eq!(a.index_of(name), b.index_of(name));
        }
    }

    #[test]
    fn test_physical_parameters_come_first() {
        let event = simple_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.n_physical(), 3);
        assert_eq!(registry.index_of("t0"), Some(0));
        assert_eq!(registry.index_of("u0"), Some(1));
        assert_eq!(registry.index_of("tE"), Some(2));
    }

    #[test]
    fn test_t0_bounds_follow_time_span() {
        let event = simple_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        assert_eq!(registry.bounds()[0], (0.0, 20.0));
    }

    #[test]
    fn test_bounds_override_rejects_inversion() {
        let event = simple_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        assert!(registry.clone().with_bounds("u0", 0.5, -0.5).is_err());
        let widened = registry.with_bounds("u0", -2.0, 2.0).unwrap();
        assert_eq!(widened.bounds()[1], (-2.0, 2.0));
    }

    #[test]
    fn test_rescaling_factor_defaults_to_unity() {
        let event = simple_event();
        let model = PsplModel::new();
        let registry =
            FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false).unwrap();
        let candidate = Array1::zeros(registry.len());
        assert_eq!(registry.rescaling_factor(&candidate, "OGLE"), 1.0);
    }
}
