//! Event and telescope data containers.
//!
//! These types are the boundary with the data-ingestion collaborator: a
//! [`Telescope`] owns cleaned photometric and/or astrometric time series plus
//! static metadata, and an [`Event`] groups the telescopes observing one sky
//! position. During a fit everything here is read-only except the parallax
//! offset caches filled in by [`crate::parallax::combine`].

use ndarray::{Array1, Array2};

use crate::error::{FitError, Result};
use crate::parallax::InterpolatedEphemeris;

/// Magnitude zero point used for magnitude/flux conversion.
pub const MAG_ZERO_POINT: f64 = 27.4;

/// Convert a magnitude to a flux using the crate zero point.
pub fn magnitude_to_flux(mag: f64) -> f64 {
    10.0_f64.powf((MAG_ZERO_POINT - mag) / 2.5)
}

/// Convert a flux back to a magnitude.
pub fn flux_to_magnitude(flux: f64) -> f64 {
    MAG_ZERO_POINT - 2.5 * flux.log10()
}

/// Where a telescope sits: on the ground or in space.
///
/// Ground coordinates feed the terrestrial parallax correction; a space
/// telescope carries an interpolated spacecraft ephemeris, built once and
/// cached here.
#[derive(Debug, Clone)]
pub enum Location {
    Ground {
        /// Geographic latitude in degrees.
        latitude: f64,
        /// Geographic longitude in degrees, East positive.
        longitude: f64,
        /// Altitude above sea level in meters.
        altitude: f64,
    },
    Space {
        /// Cached 3-D spacecraft ephemeris in AU, geocentric.
        ephemeris: InterpolatedEphemeris,
    },
}

/// Photometric time series in flux space.
#[derive(Debug, Clone)]
pub struct PhotometricSeries {
    pub time: Array1<f64>,
    pub flux: Array1<f64>,
    pub err_flux: Array1<f64>,
}

/// Astrometric time series: source positions on the sky with uncertainties.
#[derive(Debug, Clone)]
pub struct AstrometricSeries {
    pub time: Array1<f64>,
    pub ra: Array1<f64>,
    pub dec: Array1<f64>,
    pub err_ra: Array1<f64>,
    pub err_dec: Array1<f64>,
}

/// One instrument's contribution to an event.
#[derive(Debug, Clone)]
pub struct Telescope {
    pub name: String,

    /// Linear limb-darkening coefficient of the camera band.
    pub gamma: f64,

    pub location: Location,

    pub photometry: Option<PhotometricSeries>,
    pub astrometry: Option<AstrometricSeries>,

    /// Parallax positional deltas, (2, n) rows = (North, East), one cache per
    /// data kind. Set by the parallax corrector, never by the fit itself.
    pub deltas_photometry: Option<Array2<f64>>,
    pub deltas_astrometry: Option<Array2<f64>>,
}

impl Telescope {
    /// Create a ground telescope with no data attached.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            gamma: 0.0,
            location: Location::Ground {
                latitude: 0.0,
                longitude: 0.0,
                altitude: 0.0,
            },
            photometry: None,
            astrometry: None,
            deltas_photometry: None,
            deltas_astrometry: None,
        }
    }

    /// Attach a photometric light curve already in flux units.
    ///
    /// Rows with non-finite entries or non-positive uncertainties are
    /// dropped. Whether enough points remain is decided by the objective
    /// builder, which reports `InsufficientData` before optimization starts.
    pub fn with_flux_lightcurve(
        mut self,
        time: &[f64],
        flux: &[f64],
        err_flux: &[f64],
    ) -> Result<Self> {
        if time.len() != flux.len() || time.len() != err_flux.len() {
            return Err(FitError::DimensionMismatch(format!(
                "light curve columns differ in length: {} / {} / {}",
                time.len(),
                flux.len(),
                err_flux.len()
            )));
        }

        let mut t = Vec::new();
        let mut f = Vec::new();
        let mut e = Vec::new();
        for i in 0..time.len() {
            let row_ok = time[i].is_finite()
                && flux[i].is_finite()
                && err_flux[i].is_finite()
                && err_flux[i] > 0.0;
            if row_ok {
                t.push(time[i]);
                f.push(flux[i]);
                e.push(err_flux[i]);
            }
        }

        self.photometry = Some(PhotometricSeries {
            time: Array1::from_vec(t),
            flux: Array1::from_vec(f),
            err_flux: Array1::from_vec(e),
        });
        Ok(self)
    }

    /// Attach a photometric light curve in magnitudes; converted to flux.
    pub fn with_magnitude_lightcurve(
        self,
        time: &[f64],
        mag: &[f64],
        err_mag: &[f64],
    ) -> Result<Self> {
        if mag.len() != err_mag.len() {
            return Err(FitError::DimensionMismatch(format!(
                "magnitude columns differ in length: {} / {}",
                mag.len(),
                err_mag.len()
            )));
        }
        let flux: Vec<f64> = mag.iter().map(|&m| magnitude_to_flux(m)).collect();
        let err_flux: Vec<f64> = mag
            .iter()
            .zip(err_mag.iter())
            .map(|(&m, &em)| em * magnitude_to_flux(m) * std::f64::consts::LN_10 / 2.5)
            .collect();
        self.with_flux_lightcurve(time, &flux, &err_flux)
    }

    /// Attach an astrometric series (positions in the same angular unit as
    /// their uncertainties).
    pub fn with_astrometry(
        mut self,
        time: &[f64],
        ra: &[f64],
        dec: &[f64],
        err_ra: &[f64],
        err_dec: &[f64],
    ) -> Result<Self> {
        let n = time.len();
        if ra.len() != n || dec.len() != n || err_ra.len() != n || err_dec.len() != n {
            return Err(FitError::DimensionMismatch(
                "astrometry columns differ in length".to_string(),
            ));
        }

        let mut keep = (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new());
        for i in 0..n {
            let row_ok = time[i].is_finite()
                && ra[i].is_finite()
                && dec[i].is_finite()
                && err_ra[i] > 0.0
                && err_dec[i] > 0.0;
            if row_ok {
                keep.0.push(time[i]);
                keep.1.push(ra[i]);
                keep.2.push(dec[i]);
                keep.3.push(err_ra[i]);
                keep.4.push(err_dec[i]);
            }
        }

        self.astrometry = Some(AstrometricSeries {
            time: Array1::from_vec(keep.0),
            ra: Array1::from_vec(keep.1),
            dec: Array1::from_vec(keep.2),
            err_ra: Array1::from_vec(keep.3),
            err_dec: Array1::from_vec(keep.4),
        });
        Ok(self)
    }

    /// Set the geographic site of a ground telescope.
    pub fn with_site(mut self, latitude: f64, longitude: f64, altitude: f64) -> Self {
        self.location = Location::Ground {
            latitude,
            longitude,
            altitude,
        };
        self
    }

    /// Mark this telescope as space-based with its cached ephemeris.
    pub fn with_spacecraft(mut self, ephemeris: InterpolatedEphemeris) -> Self {
        self.location = Location::Space { ephemeris };
        self
    }

    /// Set the limb-darkening coefficient.
    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    /// Number of usable photometric points.
    pub fn n_data(&self) -> usize {
        self.photometry.as_ref().map_or(0, |p| p.time.len())
    }

    /// Number of usable astrometric epochs.
    pub fn n_astrometry(&self) -> usize {
        self.astrometry.as_ref().map_or(0, |a| a.time.len())
    }
}

/// A named collection of telescopes sharing one sky position.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    /// Right ascension in degrees.
    pub ra: f64,
    /// Declination in degrees.
    pub dec: f64,
    pub telescopes: Vec<Telescope>,
}

impl Event {
    pub fn new(name: &str, ra: f64, dec: f64) -> Self {
        Self {
            name: name.to_string(),
            ra,
            dec,
            telescopes: Vec::new(),
        }
    }

    /// North and East sky-plane unit vectors for this event's position,
    /// in equatorial cartesian coordinates.
    pub fn north_east_vectors(&self) -> ([f64; 3], [f64; 3]) {
        let ra = self.ra.to_radians();
        let dec = self.dec.to_radians();

        let north = [
            -dec.sin() * ra.cos(),
            -dec.sin() * ra.sin(),
            dec.cos(),
        ];
        let east = [-ra.sin(), ra.cos(), 0.0];
        (north, east)
    }

    /// Total number of photometric points over all telescopes.
    pub fn n_data(&self) -> usize {
        self.telescopes.iter().map(|t| t.n_data()).sum()
    }

    /// True if any telescope carries photometric data.
    pub fn has_photometry(&self) -> bool {
        self.telescopes.iter().any(|t| t.photometry.is_some())
    }

    /// True if any telescope carries astrometric data.
    pub fn has_astrometry(&self) -> bool {
        self.telescopes.iter().any(|t| t.astrometry.is_some())
    }

    /// (min, max) observed time over all photometric series, if any.
    pub fn time_span(&self) -> Option<(f64, f64)> {
        let mut span: Option<(f64, f64)> = None;
        for telescope in &self.telescopes {
            if let Some(phot) = &telescope.photometry {
                for &t in phot.time.iter() {
                    span = Some(match span {
                        None => (t, t),
                        Some((lo, hi)) => (lo.min(t), hi.max(t)),
                    });
                }
            }
        }
        span
    }
}
