pub mod calibration;
pub mod constants;
pub mod controller;
pub mod ellipsoid;
pub mod error;
pub mod orientation;
pub mod reading;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;

pub use calibration::{CalibrationParameters, ImuCalibration};
pub use controller::{
    CalibrationController, CalibrationMode, ControllerConfig, FitReport, FitRequest, FitResult,
    RefitMode, SampleUpdate,
};
pub use ellipsoid::fit_ellipsoid;
pub use error::{DegenerateFit, Error, InvalidReading, Result, StorageError};
pub use orientation::{OrientationEstimate, estimate_orientation};
pub use reading::{RawSample, Sensor};
pub use storage::{CalibrationRecord, MemoryStore, ParameterStore};
