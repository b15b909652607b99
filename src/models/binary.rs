//! Uniform-source binary-lens (USBL) model.
//!
//! Image positions come from the complex lens equation of two point masses,
//! reduced to a fifth-degree polynomial and solved with the Aberth-Ehrlich
//! simultaneous iteration. Finite source size is handled with the
//! hexadecapole approximation (Gould 2008), including limb darkening.
//!
//! A physical source position always produces 3 or 5 images; any other
//! image count means the caustic topology could not be resolved for the
//! current (separation, mass ratio) and is reported as `DegenerateModel`.

use ndarray::Array1;
use num_complex::Complex64;

use crate::error::{FitError, Result};
use crate::event::Telescope;
use crate::models::{
    source_trajectory, DataKind, MicrolensModel, ModelFamily, ModelParameters, ParallaxConfig,
};

const ABERTH_MAX_ITERATIONS: usize = 60;
const ABERTH_EPSILON: f64 = 1e-13;
const NEWTON_MAX_ITERATIONS: usize = 20;
const IMAGE_TOLERANCE: f64 = 1e-4;

/// Multiply two polynomials given as ascending coefficient slices.
fn poly_mul(a: &[Complex64], b: &[Complex64]) -> Vec<Complex64> {
    let mut out = vec![Complex64::new(0.0, 0.0); a.len() + b.len() - 1];
    for (i, &ca) in a.iter().enumerate() {
        for (j, &cb) in b.iter().enumerate() {
            out[i + j] += ca * cb;
        }
    }
    out
}

fn poly_add(a: &[Complex64], b: &[Complex64]) -> Vec<Complex64> {
    let mut out = vec![Complex64::new(0.0, 0.0); a.len().max(b.len())];
    for (i, &c) in a.iter().enumerate() {
        out[i] += c;
    }
    for (i, &c) in b.iter().enumerate() {
        out[i] += c;
    }
    out
}

fn poly_scale(a: &[Complex64], s: Complex64) -> Vec<Complex64> {
    a.iter().map(|&c| c * s).collect()
}

fn poly_eval(coeffs: &[Complex64], z: Complex64) -> Complex64 {
    let mut acc = Complex64::new(0.0, 0.0);
    for &c in coeffs.iter().rev() {
        acc = acc * z + c;
    }
    acc
}

fn poly_derivative(coeffs: &[Complex64]) -> Vec<Complex64> {
    coeffs
        .iter()
        .enumerate()
        .skip(1)
        .map(|(k, &c)| c * k as f64)
        .collect()
}

/// Coefficients of the image polynomial for source `zeta`, lens positions
/// `z1`, `z2` and masses `m1`, `m2`. Built by polynomial arithmetic from
///
///   (ζ − z)·N1(z)·N2(z) + P(z)·(m1·N2(z) + m2·N1(z)) = 0
///
/// with P = (z − z1)(z − z2) and Ni = (ζ̄ − z̄i)·P + m1(z − z2) + m2(z − z1).
fn image_polynomial(
    zeta: Complex64,
    z1: Complex64,
    z2: Complex64,
    m1: f64,
    m2: f64,
) -> Vec<Complex64> {
    let one = Complex64::new(1.0, 0.0);
    let p = [z1 * z2, -(z1 + z2), one];
    let m = [-(m1 * z2 + m2 * z1), Complex64::new(m1 + m2, 0.0)];

    let d1 = zeta.conj() - z1.conj();
    let d2 = zeta.conj() - z2.conj();

    let n1 = poly_add(&poly_scale(&p, d1), &m);
    let n2 = poly_add(&poly_scale(&p, d2), &m);

    let zeta_minus_z = [zeta, -one];
    let lhs = poly_mul(&zeta_minus_z, &poly_mul(&n1, &n2));
    let rhs = poly_mul(
        &p,
        &poly_add(
            &poly_scale(&n2, Complex64::new(m1, 0.0)),
            &poly_scale(&n1, Complex64::new(m2, 0.0)),
        ),
    );
    poly_add(&lhs, &rhs)
}

/// Simultaneous Aberth-Ehrlich root iteration for a complex-coefficient
/// polynomial given in ascending order.
fn aberth_roots(coeffs: &[Complex64]) -> Vec<Complex64> {
    // Trim a vanishing leading coefficient so the effective degree is right.
    let mut degree = coeffs.len() - 1;
    let scale = coeffs.iter().map(|c| c.norm()).fold(0.0, f64::max);
    while degree > 0 && coeffs[degree].norm() < 1e-14 * scale {
        degree -= 1;
    }
    if degree == 0 {
        return Vec::new();
    }
    let coeffs = &coeffs[..=degree];
    let leading = coeffs[degree];

    // Initial guesses on a circle enclosing all roots.
    let radius = 1.0
        + coeffs[..degree]
            .iter()
            .map(|c| (*c / leading).norm())
            .fold(0.0, f64::max);
    let mut roots: Vec<Complex64> = (0..degree)
        .map(|k| {
            let angle = 2.0 * std::f64::consts::PI * k as f64 / degree as f64 + 0.4;
            Complex64::from_polar(radius, angle)
        })
        .collect();

    let derivative = poly_derivative(coeffs);
    for _ in 0..ABERTH_MAX_ITERATIONS {
        let mut converged = true;
        for k in 0..degree {
            let z = roots[k];
            let p = poly_eval(coeffs, z);
            let dp = poly_eval(&derivative, z);
            if dp.norm() == 0.0 {
                // Nudge off a critical point.
                roots[k] += Complex64::new(1e-8, 1e-8);
                converged = false;
                continue;
            }
            let newton = p / dp;
            let repulsion: Complex64 = (0..degree)
                .filter(|&j| j != k)
                .map(|j| (z - roots[j]).finv())
                .sum();
            let denom = Complex64::new(1.0, 0.0) - newton * repulsion;
            let offset = if denom.norm() > 1e-14 {
                newton / denom
            } else {
                newton
            };
            roots[k] = z - offset;
            if offset.norm() > ABERTH_EPSILON * (1.0 + z.norm()) {
                converged = false;
            }
        }
        if converged {
            break;
        }
    }

    // Newton polish: the simultaneous iteration can stall on clustered
    // roots, which a few local steps resolve to machine precision.
    for root in &mut roots {
        let mut z = *root;
        for _ in 0..NEWTON_MAX_ITERATIONS {
            let p = poly_eval(coeffs, z);
            let dp = poly_eval(&derivative, z);
            if dp.norm() == 0.0 {
                break;
            }
            let step = p / dp;
            z -= step;
            if step.norm() <= 1e-15 * (1.0 + z.norm()) {
                break;
            }
        }
        *root = z;
    }
    roots
}

/// Point-source binary-lens magnification for a single source position.
///
/// `zeta` is the source in the center-of-mass frame with the lens axis along
/// the real direction.
fn point_source_magnification(
    zeta: Complex64,
    separation: f64,
    mass_ratio: f64,
) -> Result<f64> {
    let m1 = 1.0 / (1.0 + mass_ratio);
    let m2 = mass_ratio / (1.0 + mass_ratio);
    let z1 = Complex64::new(-separation * m2, 0.0);
    let z2 = Complex64::new(separation * m1, 0.0);

    let coeffs = image_polynomial(zeta, z1, z2, m1, m2);
    let roots = aberth_roots(&coeffs);

    // True images satisfy the lens equation; spurious quintic roots do not.
    // The residual is scaled by the local sensitivity of the lens mapping,
    // otherwise the faint images next to a low-mass companion get rejected
    // for the amplified round-off of a perfectly converged root.
    let mut candidates: Vec<(f64, f64)> = Vec::with_capacity(roots.len());
    for &z in &roots {
        let d1 = z.conj() - z1.conj();
        let d2 = z.conj() - z2.conj();
        if d1.norm() == 0.0 || d2.norm() == 0.0 {
            continue;
        }
        let mapped = z - m1 / d1 - m2 / d2;
        let shear = m1 / d1.powi(2) + m2 / d2.powi(2);
        let residual =
            (mapped - zeta).norm() / ((1.0 + zeta.norm()) * (1.0 + shear.norm()));
        let det = 1.0 - shear.norm_sqr();
        candidates.push((residual, det));
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

    // A binary lens always makes at least 3 images; the 4th and 5th appear
    // as a pair when the source crosses inside a caustic.
    let loose = IMAGE_TOLERANCE.sqrt();
    if candidates.len() < 3 || candidates[2].0 > loose {
        let n_images = candidates.iter().filter(|c| c.0 <= loose).count();
        return Err(FitError::DegenerateModel(format!(
            "{} images found for s={}, q={} (expected 3 or 5)",
            n_images, separation, mass_ratio
        )));
    }
    let n_images = if candidates.len() >= 5
        && candidates[3].0 <= IMAGE_TOLERANCE
        && candidates[4].0 <= IMAGE_TOLERANCE
    {
        5
    } else {
        3
    };

    let mut magnification = 0.0;
    for &(_, det) in &candidates[..n_images] {
        if det.abs() < 1e-12 {
            // Image sits on the critical curve.
            return Err(FitError::DegenerateModel(format!(
                "image on critical curve for s={}, q={}",
                separation, mass_ratio
            )));
        }
        magnification += det.abs().recip();
    }
    Ok(magnification)
}

/// Hexadecapole finite-source correction (Gould 2008): combines the central
/// point-source value with ring averages at radii rho/2 and rho.
fn finite_source_magnification(
    zeta: Complex64,
    rho: f64,
    gamma: f64,
    separation: f64,
    mass_ratio: f64,
) -> Result<f64> {
    let a_center = point_source_magnification(zeta, separation, mass_ratio)?;
    if rho <= 0.0 {
        return Ok(a_center);
    }

    let ring_average = |radius: f64, rotate: f64| -> Result<f64> {
        let mut sum = 0.0;
        for k in 0..4 {
            let angle = std::f64::consts::FRAC_PI_2 * k as f64 + rotate;
            let offset = Complex64::from_polar(radius, angle);
            sum += point_source_magnification(zeta + offset, separation, mass_ratio)?;
        }
        Ok(sum / 4.0)
    };

    let a_plus = ring_average(rho, 0.0)?;
    let a_plus_half = ring_average(rho / 2.0, 0.0)?;
    let a_cross = ring_average(rho, std::f64::consts::FRAC_PI_4)?;

    let a_rho2 = (16.0 * a_plus_half - a_plus) / 3.0 - 5.0 * a_center;
    let a_rho4 = (a_plus + a_cross) / 2.0 - a_center - a_rho2;

    Ok(a_center + a_rho2 * (1.0 - gamma / 5.0) / 2.0 + a_rho4 * (1.0 - 11.0 * gamma / 35.0) / 3.0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UsblModel {
    parallax: Option<ParallaxConfig>,
}

impl UsblModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallax(mut self, config: ParallaxConfig) -> Self {
        self.parallax = Some(config);
        self
    }
}

impl MicrolensModel for UsblModel {
    fn family(&self) -> ModelFamily {
        ModelFamily::Usbl
    }

    fn parameter_names(&self) -> Vec<&'static str> {
        let mut names = vec!["t0", "u0", "tE", "rho", "separation", "mass_ratio", "alpha"];
        if self.parallax.is_some() {
            names.extend(["piEN", "piEE"]);
        }
        names
    }

    fn parallax(&self) -> Option<ParallaxConfig> {
        self.parallax
    }

    fn magnification(
        &self,
        telescope: &Telescope,
        parameters: &ModelParameters,
    ) -> Result<Option<Array1<f64>>> {
        let (tau, beta) =
            match source_trajectory(telescope, parameters, DataKind::Photometry)? {
                Some(t) => t,
                None => return Ok(None),
            };

        let rho = parameters.rho.unwrap_or(0.0);
        let separation = parameters.separation.ok_or_else(|| {
            FitError::InvalidConfiguration("USBL model without separation".to_string())
        })?;
        let mass_ratio = parameters.mass_ratio.ok_or_else(|| {
            FitError::InvalidConfiguration("USBL model without mass_ratio".to_string())
        })?;
        let alpha = parameters.alpha.unwrap_or(0.0);
        let (sin_a, cos_a) = alpha.sin_cos();

        let n = tau.len();
        let mut magnification = Array1::zeros(n);
        for i in 0..n {
            // Rotate the trajectory onto the binary axis.
            let x = tau[i] * cos_a - beta[i] * sin_a;
            let y = tau[i] * sin_a + beta[i] * cos_a;
            let zeta = Complex64::new(x, y);
            magnification[i] = finite_source_magnification(
                zeta,
                rho,
                telescope.gamma,
                separation,
                mass_ratio,
            )?;
        }
        Ok(Some(magnification))
    }
}
