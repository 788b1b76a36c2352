use thiserror::Error;

use crate::reading::Sensor;

/// Raised when the samples cannot be turned into a real ellipsoid.
///
/// Never fatal: the controller keeps whatever parameters it already had.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum DegenerateFit {
    #[error("need at least {needed} samples to fit an ellipsoid, got {got}")]
    NotEnoughSamples { got: usize, needed: usize },
    #[error("sample buffer contains non-finite values")]
    NonFiniteSample,
    #[error("normal equations are ill-conditioned (rcond = {rcond:e})")]
    IllConditioned { rcond: f64 },
    #[error("quadric shape matrix is singular, no ellipsoid center")]
    SingularShape,
    #[error("fitted quadric is not an ellipsoid (eigenvalue {0:e})")]
    NonPositiveEigenvalue(f64),
}

/// A raw reading that orientation estimation cannot use.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReading {
    #[error("{0} reading has non-finite components")]
    NonFinite(Sensor),
    #[error("{0} reading is all zeros")]
    AllZero(Sensor),
}

/// Persisted-parameter load or save failure.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("calibration storage unavailable: {0}")]
    Io(#[from] std::io::Error),
    #[error("calibration record is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    DegenerateFit(#[from] DegenerateFit),
    #[error(transparent)]
    InvalidReading(#[from] InvalidReading),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, Error>;
