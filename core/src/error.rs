//! Error types for the particle filter

use thiserror::Error;

/// Precondition violations reported by the filter.
///
/// Adverse but legitimate outcomes (no landmark within range, particle starvation) are not errors;
/// they show up as zero weights.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("particle filter has not been initialized")]
    NotInitialized,

    #[error("particle filter is already initialized")]
    AlreadyInitialized,

    #[error("number of particles must be positive")]
    ZeroParticles,

    #[error("landmark map must contain at least one landmark")]
    EmptyMap,

    #[error("standard deviation `{name}` must be finite and non-negative, got {value}")]
    InvalidStdDev { name: &'static str, value: f64 },

    #[error("measurement standard deviation `{name}` must be finite and positive, got {value}")]
    InvalidMeasurementStdDev { name: &'static str, value: f64 },

    #[error("sensor range must be a non-negative number, got {0}")]
    InvalidSensorRange(f64),

    #[error("expected {expected} weights, got {actual}")]
    WeightCountMismatch { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// Check that a standard deviation is usable for a Gaussian draw or density.
pub(crate) fn check_std_dev(name: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(FilterError::InvalidStdDev { name, value })
    }
}

/// Measurement noise must be strictly positive for the Gaussian density to exist.
pub(crate) fn check_measurement_std_dev(name: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(FilterError::InvalidMeasurementStdDev { name, value })
    }
}
