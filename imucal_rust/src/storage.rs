use std::fs;
use std::path::{Path, PathBuf};

use imucal_core::{CalibrationRecord, ImuCalibration, ParameterStore, StorageError};
use tracing::debug;

/// Suffix of the per-rover record file.
pub const RECORD_FILE_SUFFIX: &str = "_calibration_alt.json";

/// Stores the calibration as pretty-printed JSON at
/// `<directory>/<rover>_calibration_alt.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(directory: impl AsRef<Path>, rover: &str) -> Self {
        Self {
            path: directory
                .as_ref()
                .join(format!("{rover}{RECORD_FILE_SUFFIX}")),
        }
    }

    /// Uses an explicit file path instead of the per-rover naming.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the record without validating the transforms.
    pub fn load_record(&self) -> Result<Option<CalibrationRecord>, StorageError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StorageError::Malformed(e.to_string()))
    }
}

impl ParameterStore for JsonFileStore {
    fn load(&self) -> Result<Option<ImuCalibration>, StorageError> {
        self.load_record()?
            .map(|record| record.to_calibration())
            .transpose()
    }

    fn save(&mut self, calibration: &ImuCalibration) -> Result<(), StorageError> {
        let record = CalibrationRecord::from(calibration);
        let mut json = serde_json::to_string_pretty(&record)
            .map_err(|e| StorageError::Malformed(e.to_string()))?;
        json.push('\n');

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), "Wrote IMU calibration record");
        Ok(())
    }
}
