//! # microlens-fit
//!
//! Model-fitting engine for gravitational microlensing events.
//!
//! The crate turns photometric (and optionally astrometric) time series from
//! one or more telescopes into best-fit microlensing parameters. The
//! pipeline is built from four layers:
//!
//! - **Data**: [`event::Event`] and [`event::Telescope`] hold cleaned time
//!   series plus site/spacecraft metadata.
//! - **Models**: [`models::MicrolensModel`] implementations map a parameter
//!   vector to per-telescope magnification and astrometric predictions.
//!   Point-source point-lens ([`models::PsplModel`]) and uniform-source
//!   binary-lens ([`models::UsblModel`]) families are provided, both with
//!   optional annual/terrestrial/space parallax.
//! - **Objective**: [`fits::Objective`] binds a model, an event and a
//!   [`fits::FitParameters`] registry into residual and likelihood
//!   evaluations shared by every strategy.
//! - **Strategies**: gradient least squares ([`fits::GradientLeastSquares`]),
//!   differential evolution ([`fits::DifferentialEvolution`]) and a
//!   multi-objective genetic search ([`fits::NsgaII`]), all producing a
//!   uniform [`fits::FitResult`].
//!
//! ## Example
//!
//! ```no_run
//! use microlens_fit::event::{Event, Telescope};
//! use microlens_fit::fits::{
//!     FitParameters, FitStrategy, FluxEstimation, GradientLeastSquares, Objective,
//! };
//! use microlens_fit::models::PsplModel;
//!
//! # fn main() -> microlens_fit::error::Result<()> {
//! let mut event = Event::new("OB150001", 269.39, -29.22);
//! event.telescopes.push(
//!     Telescope::new("OGLE").with_magnitude_lightcurve(
//!         &[2457000.1, 2457001.1, 2457002.1],
//!         &[18.1, 17.6, 18.0],
//!         &[0.01, 0.01, 0.01],
//!     )?,
//! );
//!
//! let model = PsplModel::new();
//! let registry = FitParameters::build(&model, &event, FluxEstimation::ClosedForm, false)?;
//! let objective = Objective::new(&model, &event, &registry)?;
//! let result = GradientLeastSquares::new().fit(&objective)?;
//! println!("{}", result);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod fits;
pub mod models;
pub mod parallax;
pub mod utils;

pub use error::{FitError, Result};
pub use event::{Event, Telescope};
pub use fits::{
    DifferentialEvolution, FitParameters, FitResult, FitStatus, FitStrategy, FluxEstimation,
    GradientLeastSquares, NsgaII, Objective,
};
pub use models::{MicrolensModel, ModelFamily, PsplModel, UsblModel};
pub use parallax::{Ephemeris, InterpolatedEphemeris, ParallaxMode};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
