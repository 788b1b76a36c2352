//! Turns raw accel/mag/gyro events into calibrated outputs and handles the
//! start/store commands against a single [`CalibrationController`].

use imucal_core::constants::diagnostics_constants::{
    ACCEL_OFFSETS_KEY, ACCEL_TRANSFORM_KEY, DIAGNOSTIC_NAME, MAG_OFFSETS_KEY, MAG_TRANSFORM_KEY,
};
use imucal_core::reading::validate_reading;
use imucal_core::{
    CalibrationController, CalibrationMode, FitReport, FitRequest, FitResult, ImuCalibration,
    InvalidReading, OrientationEstimate, ParameterStore, RawSample, SampleUpdate, Sensor,
    estimate_orientation,
};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AccelAxes, ImuCalConfig, OrientationConfig};

/// A vector tagged with the timestamp of the sample it came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StampedVector {
    pub timestamp_seconds: f64,
    pub vector: Vector3<f64>,
}

/// Orientation plus the body-frame rates that travel with it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusedImu {
    pub timestamp_seconds: f64,
    pub orientation: OrientationEstimate,
    /// Copied from the input unchanged.
    pub angular_velocity: Vector3<f64>,
    /// Calibrated accelerometer in the body frame, m/s².
    pub linear_acceleration: Vector3<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

/// Informational snapshot of the parameters in use, published while collecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDiagnostics {
    pub timestamp_seconds: f64,
    pub level: DiagnosticLevel,
    pub name: String,
    pub values: Vec<(String, String)>,
}

impl CalibrationDiagnostics {
    pub fn from_calibration(timestamp_seconds: f64, calibration: &ImuCalibration) -> Self {
        Self {
            timestamp_seconds,
            level: DiagnosticLevel::Ok,
            name: DIAGNOSTIC_NAME.to_string(),
            values: vec![
                (ACCEL_OFFSETS_KEY.to_string(), calibration.accel.offset_string()),
                (ACCEL_TRANSFORM_KEY.to_string(), calibration.accel.transform_string()),
                (MAG_OFFSETS_KEY.to_string(), calibration.mag.offset_string()),
                (MAG_TRANSFORM_KEY.to_string(), calibration.mag.transform_string()),
            ],
        }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Calibrated vectors and orientation for one input event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedOutput {
    pub accel: StampedVector,
    pub mag: StampedVector,
    pub imu: FusedImu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    StartCalibration,
    StoreCalibration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command: Command,
    pub success: bool,
    pub message: String,
}

/// Result of pushing one sample through the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub update: SampleUpdate,
    /// `None` when the calibrated vectors are unusable for orientation.
    pub output: Option<CalibratedOutput>,
    /// Present for every accepted sample while collecting.
    pub diagnostics: Option<CalibrationDiagnostics>,
}

pub struct SampleProcessor {
    controller: CalibrationController,
    store: Box<dyn ParameterStore + Send>,
    orientation: OrientationConfig,
}

impl SampleProcessor {
    /// Builds a processor whose initial parameters come from `store`.
    pub fn new(config: &ImuCalConfig, store: Box<dyn ParameterStore + Send>) -> Self {
        let controller = CalibrationController::from_store(config.controller_config(), &*store);
        Self {
            controller,
            store,
            orientation: config.orientation.clone(),
        }
    }

    pub fn controller(&self) -> &CalibrationController {
        &self.controller
    }

    pub fn mode(&self) -> CalibrationMode {
        self.controller.mode()
    }

    pub fn calibration(&self) -> &ImuCalibration {
        self.controller.calibration()
    }

    /// Processes one synchronized event.
    ///
    /// Raw readings that fail validation are rejected before they reach the
    /// sample buffers. A valid sample is buffered (while collecting) and then
    /// calibrated with whatever parameters are current after that step.
    pub fn process(&mut self, sample: &RawSample) -> Result<Processed, InvalidReading> {
        if let Err(e) = sample.validate() {
            warn!(t = sample.timestamp_seconds, "Skipping IMU sample: {e}");
            return Err(e);
        }

        let update = self.controller.on_sample(sample.accel, sample.mag);
        let output = match self.calibrate(sample) {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(t = sample.timestamp_seconds, "Not publishing calibrated sample: {e}");
                None
            }
        };
        let diagnostics = self.controller.is_collecting().then(|| {
            CalibrationDiagnostics::from_calibration(
                sample.timestamp_seconds,
                self.controller.calibration(),
            )
        });

        Ok(Processed {
            update,
            output,
            diagnostics,
        })
    }

    fn calibrate(&self, sample: &RawSample) -> Result<CalibratedOutput, InvalidReading> {
        let (accel, mag) = self.controller.apply(&sample.accel, &sample.mag);
        validate_reading(Sensor::Accelerometer, &accel)?;
        validate_reading(Sensor::Magnetometer, &mag)?;

        let linear_acceleration = body_acceleration(&accel, &self.orientation);
        let t = sample.timestamp_seconds;

        Ok(CalibratedOutput {
            accel: StampedVector {
                timestamp_seconds: t,
                vector: accel,
            },
            mag: StampedVector {
                timestamp_seconds: t,
                vector: mag,
            },
            imu: FusedImu {
                timestamp_seconds: t,
                orientation: estimate_orientation(&linear_acceleration, &mag),
                angular_velocity: sample.angular_velocity,
                linear_acceleration,
            },
        })
    }

    pub fn handle_command(&mut self, command: Command) -> CommandAck {
        match command {
            Command::StartCalibration => {
                self.controller.start();
                CommandAck {
                    command,
                    success: true,
                    message: "Calibration started".to_string(),
                }
            }
            Command::StoreCalibration => match self.controller.store(self.store.as_mut()) {
                Ok(()) => CommandAck {
                    command,
                    success: true,
                    message: "Calibration stored".to_string(),
                },
                Err(e) => CommandAck {
                    command,
                    success: false,
                    message: format!("Failed to store calibration: {e}"),
                },
            },
        }
    }

    /// Forces a full-buffer refit, see [`CalibrationController::refit`].
    pub fn refit(&mut self) -> Option<FitReport> {
        self.controller.refit()
    }

    pub fn take_fit_request(&mut self) -> Option<FitRequest> {
        self.controller.take_fit_request()
    }

    pub fn install_fit(&mut self, result: FitResult) -> Option<FitReport> {
        let report = self.controller.install_fit(result);
        if let Some(report) = &report
            && report.all_succeeded()
        {
            info!(session = self.controller.session(), "Background fit installed");
        }
        report
    }
}

/// Maps the calibrated accelerometer into the body frame and scales it to m/s².
pub fn body_acceleration(accel: &Vector3<f64>, orientation: &OrientationConfig) -> Vector3<f64> {
    let axes = match orientation.accel_axes {
        AccelAxes::Sensor => *accel,
        AccelAxes::SwapXy => Vector3::new(accel.y, -accel.x, accel.z),
    };
    axes * orientation.gravity
}
