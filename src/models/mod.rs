//! Physical model evaluation layer.
//!
//! A model maps a structured parameter view to per-telescope magnification
//! and astrometric predictions. Variants differ in parameter count and
//! magnification algorithm; callers depend only on the [`MicrolensModel`]
//! trait, never on the concrete variant.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::event::Telescope;
use crate::parallax::{parallax_curvature, ParallaxMode};

mod binary;
mod pspl;

pub use binary::UsblModel;
pub use pspl::PsplModel;

/// Supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
    /// Point-source point-lens.
    Pspl,
    /// Uniform-source binary-lens.
    Usbl,
}

impl ModelFamily {
    /// Parse a model family identifier; unknown names fail fast.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "PSPL" | "pspl" => Ok(ModelFamily::Pspl),
            "USBL" | "usbl" => Ok(ModelFamily::Usbl),
            other => Err(FitError::InvalidConfiguration(format!(
                "unknown model family '{}'",
                other
            ))),
        }
    }
}

/// Parallax configuration carried by a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParallaxConfig {
    pub mode: ParallaxMode,
    /// Reference epoch t0_par for the annual term.
    pub t0_par: f64,
}

/// Fully-resolved structured view over the physical slice of a candidate
/// vector. Fields absent from a model family stay `None`.
#[derive(Debug, Clone, Default)]
pub struct ModelParameters {
    pub t0: f64,
    pub u0: f64,
    pub te: f64,
    pub rho: Option<f64>,
    pub separation: Option<f64>,
    pub mass_ratio: Option<f64>,
    pub alpha: Option<f64>,
    pub pi_en: Option<f64>,
    pub pi_ee: Option<f64>,
    pub theta_e: Option<f64>,
    pub position_source_n: Option<f64>,
    pub position_source_e: Option<f64>,
    pub mu_source_n: Option<f64>,
    pub mu_source_e: Option<f64>,
}

/// Which data series of a telescope a trajectory refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Photometry,
    Astrometry,
}

/// Capability-set interface implemented by every model variant.
pub trait MicrolensModel: Send + Sync {
    fn family(&self) -> ModelFamily;

    /// Ordered physical-parameter names for this model family. The order
    /// fixes the optimizer-vector layout of the physical slice.
    fn parameter_names(&self) -> Vec<&'static str>;

    /// Whether a closed-form magnification Jacobian exists.
    fn has_analytic_jacobian(&self) -> bool {
        false
    }

    fn parallax(&self) -> Option<ParallaxConfig> {
        None
    }

    /// Per-point magnification for a telescope's photometric series, `None`
    /// when the telescope carries no photometric data.
    fn magnification(
        &self,
        telescope: &Telescope,
        parameters: &ModelParameters,
    ) -> Result<Option<Array1<f64>>>;

    /// Predicted astrometric positions, (2, n) rows = (ra, dec); `None`
    /// when the telescope carries no astrometric data or the model does not
    /// support astrometry.
    fn astrometric_shift(
        &self,
        _telescope: &Telescope,
        _parameters: &ModelParameters,
    ) -> Result<Option<Array2<f64>>> {
        Ok(None)
    }

    /// Analytic magnification derivatives, (n, 3) columns = d/d(t0, u0, tE).
    /// `None` when no closed form exists.
    fn magnification_jacobian(
        &self,
        _telescope: &Telescope,
        _parameters: &ModelParameters,
    ) -> Result<Option<Array2<f64>>> {
        Ok(None)
    }

    /// Bind the physical slice of a candidate vector to named parameters.
    fn resolve(&self, physical: &ArrayView1<f64>) -> Result<ModelParameters> {
        let names = self.parameter_names();
        if physical.len() != names.len() {
            return Err(FitError::DimensionMismatch(format!(
                "model declares {} physical parameters, candidate slice has {}",
                names.len(),
                physical.len()
            )));
        }

        let mut params = ModelParameters::default();
        for (name, &value) in names.iter().zip(physical.iter()) {
            match *name {
                "t0" => params.t0 = value,
                "u0" => params.u0 = value,
                "tE" => params.te = value,
                "rho" => params.rho = Some(value),
                "separation" => params.separation = Some(value),
                "mass_ratio" => params.mass_ratio = Some(value),
                "alpha" => params.alpha = Some(value),
                "piEN" => params.pi_en = Some(value),
                "piEE" => params.pi_ee = Some(value),
                "theta_E" => params.theta_e = Some(value),
                "position_source_N" => params.position_source_n = Some(value),
                "position_source_E" => params.position_source_e = Some(value),
                "mu_source_N" => params.mu_source_n = Some(value),
                "mu_source_E" => params.mu_source_e = Some(value),
                other => {
                    return Err(FitError::InvalidConfiguration(format!(
                        "model declares unknown parameter '{}'",
                        other
                    )))
                }
            }
        }
        Ok(params)
    }
}

/// Rectilinear source trajectory (τ, β) with the parallax curvature applied
/// when the model carries parallax parameters.
///
/// Returns `None` when the telescope has no data of the requested kind.
pub(crate) fn source_trajectory(
    telescope: &Telescope,
    parameters: &ModelParameters,
    kind: DataKind,
) -> Result<Option<(Array1<f64>, Array1<f64>)>> {
    let time = match kind {
        DataKind::Photometry => telescope.photometry.as_ref().map(|p| &p.time),
        DataKind::Astrometry => telescope.astrometry.as_ref().map(|a| &a.time),
    };
    let time = match time {
        Some(t) => t,
        None => return Ok(None),
    };

    let mut tau: Array1<f64> = time.mapv(|t| (t - parameters.t0) / parameters.te);
    let mut beta: Array1<f64> = Array1::from_elem(time.len(), parameters.u0);

    if let (Some(pi_en), Some(pi_ee)) = (parameters.pi_en, parameters.pi_ee) {
        let deltas = match kind {
            DataKind::Photometry => telescope.deltas_photometry.as_ref(),
            DataKind::Astrometry => telescope.deltas_astrometry.as_ref(),
        };
        let deltas = deltas.ok_or_else(|| {
            FitError::Evaluation(format!(
                "parallax parameters active but no positional deltas cached for '{}'; \
                 run parallax::combine first",
                telescope.name
            ))
        })?;
        let (delta_tau, delta_beta) = parallax_curvature(pi_en, pi_ee, deltas);
        tau = tau + delta_tau;
        beta = beta + delta_beta;
    }

    Ok(Some((tau, beta)))
}
