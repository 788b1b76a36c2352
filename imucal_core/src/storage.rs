use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationParameters, ImuCalibration};
use crate::error::StorageError;

/// Load/save collaborator for the persisted calibration.
///
/// `load` returns `Ok(None)` when nothing has been stored yet.
pub trait ParameterStore {
    fn load(&self) -> Result<Option<ImuCalibration>, StorageError>;

    fn save(&mut self, calibration: &ImuCalibration) -> Result<(), StorageError>;
}

/// On-disk layout of a stored calibration. Offsets are 3×1 column matrices and
/// transforms are row-major 3×3 matrices.
///
/// Fields are declared in sorted order so serializers that follow
/// declaration order emit sorted keys.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub acc_offsets: [[f64; 1]; 3],
    pub acc_transform: [[f64; 3]; 3],
    pub mag_offsets: [[f64; 1]; 3],
    pub mag_transform: [[f64; 3]; 3],
}

impl CalibrationRecord {
    pub fn to_calibration(&self) -> Result<ImuCalibration, StorageError> {
        let accel = parameters_from_record(&self.acc_offsets, &self.acc_transform)
            .ok_or_else(|| StorageError::Malformed("accelerometer transform is singular".into()))?;
        let mag = parameters_from_record(&self.mag_offsets, &self.mag_transform)
            .ok_or_else(|| StorageError::Malformed("magnetometer transform is singular".into()))?;
        Ok(ImuCalibration::new(accel, mag))
    }
}

impl From<&ImuCalibration> for CalibrationRecord {
    fn from(calibration: &ImuCalibration) -> Self {
        let (acc_offsets, acc_transform) = parameters_to_record(&calibration.accel);
        let (mag_offsets, mag_transform) = parameters_to_record(&calibration.mag);
        Self {
            acc_offsets,
            acc_transform,
            mag_offsets,
            mag_transform,
        }
    }
}

fn parameters_to_record(params: &CalibrationParameters) -> ([[f64; 1]; 3], [[f64; 3]; 3]) {
    let offsets = [[params.offset.x], [params.offset.y], [params.offset.z]];
    let mut transform = [[0.0; 3]; 3];
    for (row, out) in transform.iter_mut().enumerate() {
        for (col, value) in out.iter_mut().enumerate() {
            *value = params.transform[(row, col)];
        }
    }
    (offsets, transform)
}

fn parameters_from_record(
    offsets: &[[f64; 1]; 3],
    transform: &[[f64; 3]; 3],
) -> Option<CalibrationParameters> {
    let offset = Vector3::new(offsets[0][0], offsets[1][0], offsets[2][0]);
    let transform = Matrix3::from_fn(|row, col| transform[row][col]);
    let params = CalibrationParameters::new(offset, transform);
    params.is_usable().then_some(params)
}

/// Keeps the record in memory. Every save goes through [`CalibrationRecord`]
/// so it behaves like a file-backed store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Option<CalibrationRecord>,
    fail_saves: bool,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: CalibrationRecord) -> Self {
        Self {
            record: Some(record),
            ..Self::default()
        }
    }

    /// Makes every subsequent `save` fail, as a full disk would.
    pub fn fail_saves(&mut self, fail: bool) {
        self.fail_saves = fail;
    }

    pub fn record(&self) -> Option<&CalibrationRecord> {
        self.record.as_ref()
    }

    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl ParameterStore for MemoryStore {
    fn load(&self) -> Result<Option<ImuCalibration>, StorageError> {
        self.record.as_ref().map(|r| r.to_calibration()).transpose()
    }

    fn save(&mut self, calibration: &ImuCalibration) -> Result<(), StorageError> {
        if self.fail_saves {
            return Err(StorageError::Io(std::io::Error::other("store rejected write")));
        }
        self.record = Some(CalibrationRecord::from(calibration));
        self.saves += 1;
        Ok(())
    }
}
