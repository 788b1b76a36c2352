use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Affine correction for one triaxial sensor: `calibrated = transform * (raw - offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    /// Ellipsoid center (bias to subtract).
    pub offset: Vector3<f64>,
    /// Maps the centered ellipsoid onto the unit sphere.
    pub transform: Matrix3<f64>,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self::identity()
    }
}

impl CalibrationParameters {
    pub fn new(offset: Vector3<f64>, transform: Matrix3<f64>) -> Self {
        Self { offset, transform }
    }

    /// Returns the uncalibrated parameters (zero offset, identity transform).
    ///
    /// This is the only place the default is built; process start, a missing
    /// record and `start()` all go through it.
    pub fn identity() -> Self {
        Self {
            offset: Vector3::zeros(),
            transform: Matrix3::identity(),
        }
    }

    /// Applies the calibration to a raw reading.
    pub fn apply(&self, raw: &Vector3<f64>) -> Vector3<f64> {
        self.transform * (raw - self.offset)
    }

    /// Parameters are usable when every entry is finite and the transform is invertible.
    pub fn is_usable(&self) -> bool {
        self.offset.iter().all(|v| v.is_finite())
            && self.transform.iter().all(|v| v.is_finite())
            && self.transform.determinant() != 0.0
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Exports the parameters as flat arrays.
    ///
    /// # Returns
    ///
    /// - `[f64; 3]`: the offsets `[x, y, z]`.
    /// - `[f64; 9]`: the transform in row-major order `[m11, m12, m13, m21, ...]`.
    pub fn to_arrays(&self) -> ([f64; 3], [f64; 9]) {
        let offsets = [self.offset.x, self.offset.y, self.offset.z];

        let mut matrix = [0.0; 9];
        for row in 0..3 {
            for col in 0..3 {
                matrix[row * 3 + col] = self.transform[(row, col)];
            }
        }

        (offsets, matrix)
    }

    /// Offsets as a 3×1 column, e.g. `[[0.1], [-2], [0.5]]`.
    pub fn offset_string(&self) -> String {
        format!(
            "[[{}], [{}], [{}]]",
            self.offset.x, self.offset.y, self.offset.z
        )
    }

    /// Transform rows, e.g. `[[1, 0, 0], [0, 1, 0], [0, 0, 1]]`.
    pub fn transform_string(&self) -> String {
        let rows: Vec<String> = (0..3)
            .map(|row| {
                format!(
                    "[{}, {}, {}]",
                    self.transform[(row, 0)],
                    self.transform[(row, 1)],
                    self.transform[(row, 2)]
                )
            })
            .collect();
        format!("[{}]", rows.join(", "))
    }
}

/// The accelerometer and magnetometer parameter sets. They are held by value
/// and never alias each other.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuCalibration {
    pub accel: CalibrationParameters,
    pub mag: CalibrationParameters,
}

impl ImuCalibration {
    pub fn new(accel: CalibrationParameters, mag: CalibrationParameters) -> Self {
        Self { accel, mag }
    }

    pub fn is_identity(&self) -> bool {
        self.accel.is_identity() && self.mag.is_identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identity_is_a_no_op() {
        let params = CalibrationParameters::identity();
        for v in [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.5, -2.25, 3.0),
            Vector3::new(-1e6, 1e-9, 42.0),
        ] {
            assert_eq!(params.apply(&v), v);
        }
        assert!(params.is_identity());
        assert!(params.is_usable());
    }

    #[test]
    fn apply_subtracts_offset_then_transforms() {
        let params = CalibrationParameters::new(
            Vector3::new(1.0, 2.0, 3.0),
            Matrix3::new(2.0, 0.0, 0.0, 0.0, 0.5, 0.0, 0.0, 0.0, 1.0),
        );
        let out = params.apply(&Vector3::new(2.0, 4.0, 3.0));
        assert_relative_eq!(out, Vector3::new(2.0, 1.0, 0.0));
    }

    #[test]
    fn singular_transform_is_not_usable() {
        let params = CalibrationParameters::new(Vector3::zeros(), Matrix3::zeros());
        assert!(!params.is_usable());

        let params = CalibrationParameters::new(
            Vector3::new(f64::NAN, 0.0, 0.0),
            Matrix3::identity(),
        );
        assert!(!params.is_usable());
    }

    #[test]
    fn to_arrays_is_row_major() {
        let params = CalibrationParameters::new(
            Vector3::new(1.0, 2.0, 3.0),
            Matrix3::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0),
        );
        let (offsets, matrix) = params.to_arrays();
        assert_eq!(offsets, [1.0, 2.0, 3.0]);
        assert_eq!(matrix, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn default_strings_match_uncalibrated_layout() {
        let params = CalibrationParameters::default();
        assert_eq!(params.offset_string(), "[[0], [0], [0]]");
        assert_eq!(
            params.transform_string(),
            "[[1, 0, 0], [0, 1, 0], [0, 0, 1]]"
        );
    }

    #[test]
    fn default_imu_calibration_is_identity() {
        let cal = ImuCalibration::default();
        assert!(cal.is_identity());
        assert_eq!(cal.accel, CalibrationParameters::identity());
        assert_eq!(cal.mag, CalibrationParameters::identity());
    }
}
