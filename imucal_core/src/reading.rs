use core::fmt;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::InvalidReading;

/// The two calibrated sensors. Each one owns an independent set of parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sensor {
    Accelerometer,
    Magnetometer,
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sensor::Accelerometer => f.write_str("accelerometer"),
            Sensor::Magnetometer => f.write_str("magnetometer"),
        }
    }
}

/// One synchronized input event: raw accelerometer and magnetometer vectors
/// plus the gyro rate, which is passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub timestamp_seconds: f64,
    pub accel: Vector3<f64>,
    pub mag: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
}

impl RawSample {
    pub fn new(
        timestamp_seconds: f64,
        accel: Vector3<f64>,
        mag: Vector3<f64>,
        angular_velocity: Vector3<f64>,
    ) -> Self {
        Self {
            timestamp_seconds,
            accel,
            mag,
            angular_velocity,
        }
    }

    /// Checks both sensors that orientation estimation depends on.
    pub fn validate(&self) -> Result<(), InvalidReading> {
        validate_reading(Sensor::Accelerometer, &self.accel)?;
        validate_reading(Sensor::Magnetometer, &self.mag)
    }
}

/// Rejects vectors with NaN/inf components or with every component zero.
pub fn validate_reading(sensor: Sensor, reading: &Vector3<f64>) -> Result<(), InvalidReading> {
    if !reading.iter().all(|v| v.is_finite()) {
        return Err(InvalidReading::NonFinite(sensor));
    }
    if reading.iter().all(|v| *v == 0.0) {
        return Err(InvalidReading::AllZero(sensor));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_readings() {
        let sample = RawSample::new(
            0.0,
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.2, -0.1, 0.4),
            Vector3::zeros(),
        );
        assert_eq!(sample.validate(), Ok(()));
    }

    #[test]
    fn rejects_non_finite_components() {
        let reading = Vector3::new(0.0, f64::NAN, 1.0);
        assert_eq!(
            validate_reading(Sensor::Accelerometer, &reading),
            Err(InvalidReading::NonFinite(Sensor::Accelerometer))
        );

        let reading = Vector3::new(f64::INFINITY, 0.0, 1.0);
        assert_eq!(
            validate_reading(Sensor::Magnetometer, &reading),
            Err(InvalidReading::NonFinite(Sensor::Magnetometer))
        );
    }

    #[test]
    fn rejects_all_zero_magnetometer() {
        let sample = RawSample::new(
            1.0,
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::zeros(),
            Vector3::zeros(),
        );
        assert_eq!(
            sample.validate(),
            Err(InvalidReading::AllZero(Sensor::Magnetometer))
        );
    }

    #[test]
    fn zero_gyro_is_not_checked() {
        // Angular velocity is passthrough only.
        let sample = RawSample::new(
            1.0,
            Vector3::new(0.1, 0.0, 1.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(f64::NAN, 0.0, 0.0),
        );
        assert!(sample.validate().is_ok());
    }
}
