//! Parallax corrector.
//!
//! Computes the time-dependent positional deltas consumed by the physical
//! models when microlensing parallax parameters (piEN, piEE) are active.
//! Three additive terms are supported: annual (Earth's orbital motion
//! relative to a reference epoch `t0_par`), terrestrial (site offset from the
//! Earth's center through sidereal time), and satellite (interpolated 3-D
//! spacecraft ephemeris, built once and cached on the telescope).
//!
//! The corrector only sets the per-telescope (North, East) deltas; the dot
//! product with the parallax vector is evaluated inside the physical model.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::event::{Location, Telescope};

/// Astronomical unit in meters.
pub const AU: f64 = 1.495_978_707e11;

/// Earth equatorial radius in meters.
pub const EARTH_RADIUS: f64 = 6.378_137e6;

/// Which parallax terms are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParallaxMode {
    /// No parallax correction.
    None,
    /// Earth's orbital motion only.
    Annual,
    /// Site offset from the Earth's center only.
    Terrestrial,
    /// Annual plus terrestrial (or satellite, for a space telescope).
    Full,
}

impl ParallaxMode {
    fn annual(self) -> bool {
        matches!(self, ParallaxMode::Annual | ParallaxMode::Full)
    }

    fn observer_offset(self) -> bool {
        matches!(self, ParallaxMode::Terrestrial | ParallaxMode::Full)
    }
}

/// Opaque position-lookup service: observer-frame 3-D position in AU at a
/// given time (JD). May be backed by a remote provider; failures surface as
/// `OutOfRangeEphemeris`.
pub trait Ephemeris {
    fn position(&self, time: f64) -> Result<[f64; 3]>;
}

/// A cached (time, x, y, z) table with linear interpolation.
///
/// Used both for spacecraft ephemerides and for tabulated Earth positions.
/// Lookups outside the cached span fail rather than extrapolate.
#[derive(Debug, Clone)]
pub struct InterpolatedEphemeris {
    times: Array1<f64>,
    positions: Array2<f64>,
}

impl InterpolatedEphemeris {
    /// Build from a strictly increasing time column and an (n, 3) position
    /// table.
    pub fn new(times: Array1<f64>, positions: Array2<f64>) -> Result<Self> {
        if times.len() < 2 {
            return Err(FitError::InvalidConfiguration(
                "ephemeris table needs at least 2 epochs".to_string(),
            ));
        }
        if positions.nrows() != times.len() || positions.ncols() != 3 {
            return Err(FitError::DimensionMismatch(format!(
                "ephemeris table shape ({}, {}) does not match {} epochs",
                positions.nrows(),
                positions.ncols(),
                times.len()
            )));
        }
        for i in 1..times.len() {
            if times[i] <= times[i - 1] {
                return Err(FitError::InvalidConfiguration(
                    "ephemeris epochs must be strictly increasing".to_string(),
                ));
            }
        }
        Ok(Self { times, positions })
    }

    /// Time span covered by the table.
    pub fn span(&self) -> (f64, f64) {
        (self.times[0], self.times[self.times.len() - 1])
    }
}

impl Ephemeris for InterpolatedEphemeris {
    fn position(&self, time: f64) -> Result<[f64; 3]> {
        let (start, end) = self.span();
        if time < start || time > end {
            return Err(FitError::OutOfRangeEphemeris {
                requested: time,
                start,
                end,
            });
        }

        // Binary search for the bracketing interval.
        let mut lo = 0;
        let mut hi = self.times.len() - 1;
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            if self.times[mid] <= time {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        let t0 = self.times[lo];
        let t1 = self.times[hi];
        let w = (time - t0) / (t1 - t0);
        let mut out = [0.0; 3];
        for k in 0..3 {
            out[k] = (1.0 - w) * self.positions[[lo, k]] + w * self.positions[[hi, k]];
        }
        Ok(out)
    }
}

/// Low-precision analytic Earth ephemeris (equatorial heliocentric, AU).
///
/// Good to a few 1e-4 AU, enough for unit tests and quick looks; production
/// fits should supply a tabulated provider instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproximateEarth;

impl Ephemeris for ApproximateEarth {
    fn position(&self, time: f64) -> Result<[f64; 3]> {
        let n = time - 2_451_545.0;
        let g = (357.529 + 0.985_600_28 * n).to_radians();
        let lon = (280.459 + 0.985_647_36 * n + 1.915 * g.sin() + 0.020 * (2.0 * g).sin())
            .to_radians();
        let r = 1.000_14 - 0.016_71 * g.cos() - 0.000_14 * (2.0 * g).cos();
        let eps = (23.439 - 3.6e-7 * n).to_radians();

        // Geocentric Sun, negated to get the heliocentric Earth.
        let sun = [
            r * lon.cos(),
            r * lon.sin() * eps.cos(),
            r * lon.sin() * eps.sin(),
        ];
        Ok([-sun[0], -sun[1], -sun[2]])
    }
}

/// Greenwich mean sidereal time in radians for a JD epoch.
pub fn sidereal_time(jd: f64) -> f64 {
    let theta = 280.460_618_37 + 360.985_647_366_29 * (jd - 2_451_545.0);
    theta.to_radians().rem_euclid(2.0 * std::f64::consts::PI)
}

fn spherical_to_cartesian(r: f64, lat: f64, lon: f64) -> [f64; 3] {
    [
        r * lat.cos() * lon.cos(),
        r * lat.cos() * lon.sin(),
        r * lat.sin(),
    ]
}

/// Annual parallax offsets: ΔS(t) = S(t) − (t − t0par)·S′(t0par) − S(t0par)
/// where S is the Sun position seen from the Earth (Gould 2004 convention).
/// Returns an (n, 3) array in AU.
pub fn annual_parallax(
    times: &Array1<f64>,
    t0_par: f64,
    ephemeris: &dyn Ephemeris,
) -> Result<Array2<f64>> {
    let earth_ref = ephemeris.position(t0_par)?;

    // Sun speed at the reference epoch from central differencing of the
    // position-only provider.
    let h = 0.25;
    let before = ephemeris.position(t0_par - h)?;
    let after = ephemeris.position(t0_par + h)?;

    let sun_ref: Vec<f64> = earth_ref.iter().map(|&x| -x).collect();
    let sun_speed_ref: Vec<f64> = (0..3)
        .map(|k| -(after[k] - before[k]) / (2.0 * h))
        .collect();

    let mut out = Array2::zeros((times.len(), 3));
    for (i, &t) in times.iter().enumerate() {
        let earth = ephemeris.position(t)?;
        for k in 0..3 {
            let sun = -earth[k];
            out[[i, k]] = sun - (t - t0_par) * sun_speed_ref[k] - sun_ref[k];
        }
    }
    Ok(out)
}

/// Site offset from the Earth's center, (n, 3) in AU (Hardy & Walker 1995).
pub fn terrestrial_offsets(
    times: &Array1<f64>,
    latitude: f64,
    longitude: f64,
    altitude: f64,
    right_ascension: f64,
) -> Array2<f64> {
    let radius = (EARTH_RADIUS + altitude) / AU;
    let lat = latitude.to_radians();
    let lon = longitude.to_radians();
    let ra = right_ascension.to_radians();

    let mut out = Array2::zeros((times.len(), 3));
    for (i, &t) in times.iter().enumerate() {
        let telescope_longitude = -lon - ra + sidereal_time(t);
        let xyz = spherical_to_cartesian(radius, lat, telescope_longitude);
        for k in 0..3 {
            out[[i, k]] = xyz[k];
        }
    }
    out
}

/// Observer offsets for one telescope: terrestrial site offset on the
/// ground, interpolated spacecraft position in space.
fn observer_positions(
    telescope: &Telescope,
    times: &Array1<f64>,
    right_ascension: f64,
) -> Result<Array2<f64>> {
    match &telescope.location {
        Location::Ground {
            latitude,
            longitude,
            altitude,
        } => Ok(terrestrial_offsets(
            times,
            *latitude,
            *longitude,
            *altitude,
            right_ascension,
        )),
        Location::Space { ephemeris } => {
            let mut out = Array2::zeros((times.len(), 3));
            for (i, &t) in times.iter().enumerate() {
                let pos = ephemeris.position(t)?;
                for k in 0..3 {
                    out[[i, k]] = pos[k];
                }
            }
            Ok(out)
        }
    }
}

fn project_north_east(
    positions: &Array2<f64>,
    north: &[f64; 3],
    east: &[f64; 3],
) -> Array2<f64> {
    let n = positions.nrows();
    let mut out = Array2::zeros((2, n));
    for i in 0..n {
        let mut dn = 0.0;
        let mut de = 0.0;
        for k in 0..3 {
            dn += positions[[i, k]] * north[k];
            de += positions[[i, k]] * east[k];
        }
        out[[0, i]] = dn;
        out[[1, i]] = de;
    }
    out
}

/// Compute and cache a telescope's (North, East) positional deltas for every
/// data kind it carries.
///
/// A space telescope always receives the spacecraft term when any parallax
/// is active; a ground telescope receives the terrestrial term only for the
/// `Terrestrial` and `Full` modes. Terms are additive, so superposition
/// holds exactly.
pub fn combine(
    telescope: &mut Telescope,
    mode: ParallaxMode,
    t0_par: f64,
    north: &[f64; 3],
    east: &[f64; 3],
    right_ascension: f64,
    ephemeris: &dyn Ephemeris,
) -> Result<()> {
    if mode == ParallaxMode::None {
        return Ok(());
    }

    let phot_times = telescope.photometry.as_ref().map(|p| p.time.clone());
    let astro_times = telescope.astrometry.as_ref().map(|a| a.time.clone());

    let mut results = Vec::new();
    for times in [phot_times.as_ref(), astro_times.as_ref()] {
        let times = match times {
            Some(t) => t,
            None => {
                results.push(None);
                continue;
            }
        };

        let mut positions = Array2::zeros((times.len(), 3));

        if mode.annual() {
            positions = positions + annual_parallax(times, t0_par, ephemeris)?;
        }

        let is_space = matches!(telescope.location, Location::Space { .. });
        if mode.observer_offset() || is_space {
            let observer = observer_positions(telescope, times, right_ascension)?;
            positions = positions - observer;
        }

        results.push(Some(project_north_east(&positions, north, east)));
    }

    if let Some(Some(deltas)) = results.first().cloned() {
        telescope.deltas_photometry = Some(deltas);
    }
    if let Some(Some(deltas)) = results.get(1).cloned() {
        telescope.deltas_astrometry = Some(deltas);
    }
    Ok(())
}

/// Shift of the source trajectory induced by parallax: δτ = piE · Δ and
/// δβ = piE × Δ, with Δ the (North, East) deltas.
pub fn parallax_curvature(
    pi_en: f64,
    pi_ee: f64,
    deltas: &Array2<f64>,
) -> (Array1<f64>, Array1<f64>) {
    let n = deltas.ncols();
    let mut delta_tau = Array1::zeros(n);
    let mut delta_beta = Array1::zeros(n);
    for i in 0..n {
        let dn = deltas[[0, i]];
        let de = deltas[[1, i]];
        delta_tau[i] = pi_en * dn + pi_ee * de;
        delta_beta[i] = pi_en * de - pi_ee * dn;
    }
    (delta_tau, delta_beta)
}
