//! Point-source point-lens (PSPL) model.
//!
//! The standard Paczynski light curve: A(u) = (u² + 2) / (u·√(u² + 4)) with
//! u the lens-source separation in Einstein radii. A closed-form Jacobian in
//! (t0, u0, tE) is available when no parallax is active.

use ndarray::{Array1, Array2};

use crate::error::Result;
use crate::event::Telescope;
use crate::models::{
    source_trajectory, DataKind, MicrolensModel, ModelFamily, ModelParameters, ParallaxConfig,
};

/// Paczynski magnification for a squared separation u².
fn magnification_from_u2(u2: f64) -> f64 {
    let u = u2.sqrt();
    (u2 + 2.0) / (u * (u2 + 4.0).sqrt())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PsplModel {
    parallax: Option<ParallaxConfig>,
    astrometry: bool,
}

impl PsplModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable parallax; the source trajectory picks up the cached deltas.
    pub fn with_parallax(mut self, config: ParallaxConfig) -> Self {
        self.parallax = Some(config);
        self
    }

    /// Enable astrometric predictions: adds the Einstein radius, the source
    /// reference position and its proper motion to the parameter set.
    pub fn with_astrometry(mut self) -> Self {
        self.astrometry = true;
        self
    }

    fn impact_parameter_squared(
        &self,
        telescope: &Telescope,
        parameters: &ModelParameters,
        kind: DataKind,
    ) -> Result<Option<(Array1<f64>, Array1<f64>, Array1<f64>)>> {
        let (tau, beta) = match source_trajectory(telescope, parameters, kind)? {
            Some(t) => t,
            None => return Ok(None),
        };
        let u2 = &tau * &tau + &beta * &beta;
        Ok(Some((tau, beta, u2)))
    }
}

impl MicrolensModel for PsplModel {
    fn family(&self) -> ModelFamily {
        ModelFamily::Pspl
    }

    fn parameter_names(&self) -> Vec<&'static str> {
        let mut names = vec!["t0", "u0", "tE"];
        if self.astrometry {
            names.extend([
                "theta_E",
                "position_source_N",
                "position_source_E",
                "mu_source_N",
                "mu_source_E",
            ]);
        }
        if self.parallax.is_some() {
            names.extend(["piEN", "piEE"]);
        }
        names
    }

    fn has_analytic_jacobian(&self) -> bool {
        // The closed form covers (t0, u0, tE) only; parallax and astrometry
        // fall back to numerical differencing.
        self.parallax.is_none() && !self.astrometry
    }

    fn parallax(&self) -> Option<ParallaxConfig> {
        self.parallax
    }

    fn magnification(
        &self,
        telescope: &Telescope,
        parameters: &ModelParameters,
    ) -> Result<Option<Array1<f64>>> {
        let u2 = match self.impact_parameter_squared(telescope, parameters, DataKind::Photometry)? {
            Some((_, _, u2)) => u2,
            None => return Ok(None),
        };
        Ok(Some(u2.mapv(magnification_from_u2)))
    }

    fn magnification_jacobian(
        &self,
        telescope: &Telescope,
        parameters: &ModelParameters,
    ) -> Result<Option<Array2<f64>>> {
        if !self.has_analytic_jacobian() {
            return Ok(None);
        }
        let (tau, _beta, u2) =
            match self.impact_parameter_squared(telescope, parameters, DataKind::Photometry)? {
                Some(t) => t,
                None => return Ok(None),
            };

        let n = tau.len();
        let mut jac = Array2::zeros((n, 3));
        for i in 0..n {
            let u = u2[i].sqrt();
            // dA/dU for A = (U² + 2)/(U·√(U² + 4)).
            let da_du = -8.0 / (u2[i] * (u2[i] + 4.0).powf(1.5));
            let du_dt0 = -tau[i] / (parameters.te * u);
            let du_du0 = parameters.u0 / u;
            let du_dte = -tau[i] * tau[i] / (parameters.te * u);

            jac[[i, 0]] = da_du * du_dt0;
            jac[[i, 1]] = da_du * du_du0;
            jac[[i, 2]] = da_du * du_dte;
        }
        Ok(Some(jac))
    }

    fn astrometric_shift(
        &self,
        telescope: &Telescope,
        parameters: &ModelParameters,
    ) -> Result<Option<Array2<f64>>> {
        if !self.astrometry {
            return Ok(None);
        }
        let theta_e = match parameters.theta_e {
            Some(v) => v,
            None => return Ok(None),
        };
        let (tau, beta, u2) =
            match self.impact_parameter_squared(telescope, parameters, DataKind::Astrometry)? {
                Some(t) => t,
                None => return Ok(None),
            };

        let ref_n = parameters.position_source_n.unwrap_or(0.0);
        let ref_e = parameters.position_source_e.unwrap_or(0.0);
        let mu_n = parameters.mu_source_n.unwrap_or(0.0);
        let mu_e = parameters.mu_source_e.unwrap_or(0.0);
        let t_ref = self
            .parallax
            .map(|p| p.t0_par)
            .unwrap_or(parameters.t0);

        // Trajectory frame to (North, East): the trajectory x axis points
        // along the parallax vector when one is fitted.
        let angle = match (parameters.pi_en, parameters.pi_ee) {
            (Some(pi_en), Some(pi_ee)) => pi_ee.atan2(pi_en),
            _ => 0.0,
        };
        let (sin_a, cos_a) = angle.sin_cos();

        let time = match &telescope.astrometry {
            Some(series) => &series.time,
            None => return Ok(None),
        };
        let n = time.len();
        let mut out = Array2::zeros((2, n));
        for i in 0..n {
            // Unblended centroid shift of a point lens.
            let shift_x = tau[i] * theta_e / (u2[i] + 2.0);
            let shift_y = beta[i] * theta_e / (u2[i] + 2.0);
            let delta_n = shift_x * cos_a - shift_y * sin_a;
            let delta_e = shift_x * sin_a + shift_y * cos_a;

            let years = (time[i] - t_ref) / 365.25;
            out[[0, i]] = ref_e + mu_e * years + delta_e;
            out[[1, i]] = ref_n + mu_n * years + delta_n;
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn telescope_at(times: &[f64]) -> Telescope {
        let flux = vec![1.0; times.len()];
        let err = vec![0.1; times.len()];
        Telescope::new("test")
            .with_flux_lightcurve(times, &flux, &err)
            .unwrap()
    }

    #[test]
    fn test_closed_form_magnification_at_peak() {
        let model = PsplModel::new();
        let telescope = telescope_at(&[0.0]);
        let params = model.resolve(&array![0.0, 0.1, 1.0].view()).unwrap();

        let magnification = model.magnification(&telescope, &params).unwrap().unwrap();
        let u0: f64 = 0.1;
        let expected = (u0 * u0 + 2.0) / (u0 * (u0 * u0 + 4.0).sqrt());
        assert_relative_eq!(magnification[0], expected, max_relative = 1e-9);
    }

    #[test]
    fn test_high_magnification_limit() {
        // A(u) -> 1/u as u -> 0.
        let model = PsplModel::new();
        let telescope = telescope_at(&[0.0]);
        let params = model.resolve(&array![0.0, 1e-4, 1.0].view()).unwrap();
        let magnification = model.magnification(&telescope, &params).unwrap().unwrap();
        assert_relative_eq!(magnification[0], 1e4, max_relative = 1e-6);
    }

    #[test]
    fn test_baseline_far_from_peak() {
        let model = PsplModel::new();
        let telescope = telescope_at(&[1000.0]);
        let params = model.resolve(&array![0.0, 0.1, 1.0].view()).unwrap();
        let magnification = model.magnification(&telescope, &params).unwrap().unwrap();
        assert_relative_eq!(magnification[0], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_no_photometry_returns_none() {
        let model = PsplModel::new();
        let telescope = Telescope::new("empty");
        let params = model.resolve(&array![0.0, 0.1, 1.0].view()).unwrap();
        assert!(model.magnification(&telescope, &params).unwrap().is_none());
    }

    #[test]
    fn test_analytic_jacobian_matches_finite_difference() {
        let model = PsplModel::new();
        let telescope = telescope_at(&[-5.0, -1.0, 0.5, 3.0, 10.0]);
        let theta = array![0.0, 0.3, 8.0];
        let params = model.resolve(&theta.view()).unwrap();

        let jac = model
            .magnification_jacobian(&telescope, &params)
            .unwrap()
            .unwrap();

        let h = 1e-6;
        for p in 0..3 {
            let mut theta_hi = theta.clone();
            let mut theta_lo = theta.clone();
            theta_hi[p] += h;
            theta_lo[p] -= h;
            let hi = model
                .magnification(&telescope, &model.resolve(&theta_hi.view()).unwrap())
                .unwrap()
                .unwrap();
            let lo = model
                .magnification(&telescope, &model.resolve(&theta_lo.view()).unwrap())
                .unwrap()
                .unwrap();
            for i in 0..hi.len() {
                let numeric = (hi[i] - lo[i]) / (2.0 * h);
                assert_relative_eq!(jac[[i, p]], numeric, epsilon = 1e-5, max_relative = 1e-4);
            }
        }
    }

    #[test]
    fn test_astrometric_shift_shape_and_center() {
        let model = PsplModel::new().with_astrometry();
        let telescope = Telescope::new("gaia")
            .with_astrometry(
                &[0.0, 50.0],
                &[1.0, 1.0],
                &[2.0, 2.0],
                &[0.1, 0.1],
                &[0.1, 0.1],
            )
            .unwrap();

        // theta_E = 1, reference position (N, E) = (2, 1), no proper motion.
        let theta = array![0.0, 0.2, 30.0, 1.0, 2.0, 1.0, 0.0, 0.0];
        let params = model.resolve(&theta.view()).unwrap();
        let positions = model
            .astrometric_shift(&telescope, &params)
            .unwrap()
            .unwrap();
        assert_eq!(positions.shape(), &[2, 2]);

        // At t = t0 the trajectory is (0, u0): shift is purely in y.
        let u2 = 0.2_f64 * 0.2;
        let expected_shift = 0.2 / (u2 + 2.0);
        assert_relative_eq!(positions[[0, 0]], 1.0 + expected_shift, epsilon = 1e-12);
        assert_relative_eq!(positions[[1, 0]], 2.0, epsilon = 1e-12);
    }
}
