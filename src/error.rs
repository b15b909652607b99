use thiserror::Error;

/// Error types for the microlens-fit library.
#[derive(Error, Debug)]
pub enum FitError {
    /// Too few usable data points to resolve the flux nuisance parameters.
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// The binary-lens caustic topology could not be resolved for the
    /// current (separation, mass ratio) pair.
    #[error("Degenerate model: {0}")]
    DegenerateModel(String),

    /// An ephemeris lookup was requested outside the cached time span.
    #[error("Ephemeris out of range: requested t={requested}, span [{start}, {end}]")]
    OutOfRangeEphemeris {
        requested: f64,
        start: f64,
        end: f64,
    },

    /// The Gauss-Newton curvature matrix is singular; no covariance estimate
    /// is available.
    #[error("Singular covariance matrix")]
    SingularCovariance,

    /// Configuration error detected before any evaluation starts.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Mismatch between a candidate vector and the registry layout.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Error during objective or model evaluation.
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Generic error for cases that don't fit the other categories.
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for microlens-fit operations.
pub type Result<T> = std::result::Result<T, FitError>;

impl From<String> for FitError {
    fn from(s: String) -> Self {
        FitError::Other(s)
    }
}

impl From<&str> for FitError {
    fn from(s: &str) -> Self {
        FitError::Other(s.to_string())
    }
}
