//! Central-difference Jacobian of a vector-valued function.

use ndarray::{Array1, Array2};

use crate::error::{FitError, Result};

/// Relative step for the central difference; cube root of machine epsilon.
const STEP_SCALE: f64 = 6.055454452393343e-6;

/// Jacobian of `f` at `params`, (m, n) with m the residual length.
///
/// Central differencing with a per-component relative step. An evaluation
/// failure at a perturbed point propagates to the caller, which treats the
/// step as rejected.
pub fn jacobian<F>(f: &F, params: &Array1<f64>) -> Result<Array2<f64>>
where
    F: Fn(&Array1<f64>) -> Result<Array1<f64>>,
{
    let scales = params.mapv(|v| 1.0 + v.abs());
    jacobian_scaled(f, params, &scales)
}

/// Central-difference Jacobian with an explicit characteristic scale per
/// component. The step along component p is proportional to `scales[p]`
/// instead of the parameter magnitude, which matters for parameters whose
/// absolute value dwarfs their physically meaningful range (a time of
/// maximum in Julian days, for instance).
pub fn jacobian_scaled<F>(
    f: &F,
    params: &Array1<f64>,
    scales: &Array1<f64>,
) -> Result<Array2<f64>>
where
    F: Fn(&Array1<f64>) -> Result<Array1<f64>>,
{
    let n = params.len();
    if n == 0 {
        return Err(FitError::DimensionMismatch(
            "cannot differentiate over zero parameters".to_string(),
        ));
    }
    if scales.len() != n {
        return Err(FitError::DimensionMismatch(
            "one step scale per parameter is required".to_string(),
        ));
    }

    let mut jac: Option<Array2<f64>> = None;
    for p in 0..n {
        let s = scales[p];
        let h = if s.is_finite() && s > 0.0 {
            STEP_SCALE * s
        } else {
            STEP_SCALE
        };
        let mut hi = params.clone();
        let mut lo = params.clone();
        hi[p] += h;
        lo[p] -= h;

        let r_hi = f(&hi)?;
        let r_lo = f(&lo)?;
        if r_hi.len() != r_lo.len() {
            return Err(FitError::DimensionMismatch(
                "residual length changed during differencing".to_string(),
            ));
        }

        let m = r_hi.len();
        let jac = jac.get_or_insert_with(|| Array2::zeros((m, n)));
        if jac.nrows() != m {
            return Err(FitError::DimensionMismatch(
                "residual length changed during differencing".to_string(),
            ));
        }
        for i in 0..m {
            jac[[i, p]] = (r_hi[i] - r_lo[i]) / (2.0 * h);
        }
    }

    jac.ok_or_else(|| FitError::DimensionMismatch("empty Jacobian".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_jacobian_of_quadratic() {
        // r(x) = [x0², x0·x1, x1³]
        let f = |x: &Array1<f64>| -> Result<Array1<f64>> {
            Ok(array![x[0] * x[0], x[0] * x[1], x[1] * x[1] * x[1]])
        };
        let x = array![2.0, -1.5];
        let jac = jacobian(&f, &x).unwrap();

        assert_eq!(jac.shape(), &[3, 2]);
        assert_relative_eq!(jac[[0, 0]], 4.0, epsilon = 1e-6);
        assert_relative_eq!(jac[[0, 1]], 0.0, epsilon = 1e-6);
        assert_relative_eq!(jac[[1, 0]], -1.5, epsilon = 1e-6);
        assert_relative_eq!(jac[[1, 1]], 2.0, epsilon = 1e-6);
        assert_relative_eq!(jac[[2, 1]], 3.0 * 1.5 * 1.5, epsilon = 1e-5);
    }

    #[test]
    fn test_scaled_steps_resolve_narrow_features() {
        // r(x) = sin(x - 2457050): a relative step at x ~ 2.5e6 spans many
        // periods, a unit-scale step does not.
        let f = |x: &Array1<f64>| -> Result<Array1<f64>> {
            Ok(array![(x[0] - 2457050.0).sin()])
        };
        let x = array![2457050.5];
        let jac = jacobian_scaled(&f, &x, &array![1.0]).unwrap();
        assert_relative_eq!(jac[[0, 0]], 0.5_f64.cos(), epsilon = 1e-6);
    }

    #[test]
    fn test_jacobian_propagates_failure() {
        let f = |_: &Array1<f64>| -> Result<Array1<f64>> {
            Err(FitError::Evaluation("boom".to_string()))
        };
        let x = array![1.0];
        assert!(jacobian(&f, &x).is_err());
    }
}
