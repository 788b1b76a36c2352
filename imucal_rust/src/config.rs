//! TOML configuration for the calibration node.

use std::path::{Path, PathBuf};
use std::time::Duration;

use imucal_core::constants::orientation_constants::DEFAULT_GRAVITY_METERS_PER_S2;
use imucal_core::{ControllerConfig, RefitMode};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ImuCalConfig {
    /// Rover identity; names the stored calibration record.
    #[serde(default)]
    pub rover: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub orientation: OrientationConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory holding `<rover>_calibration_alt.json` (default: /home/robot)
    #[serde(default = "default_storage_directory")]
    pub directory: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CalibrationConfig {
    /// Refit on every N-th sample once enough samples are buffered (default: 1)
    #[serde(default = "default_refit_interval")]
    pub refit_interval: usize,

    /// `inline` fits on the sample path, `background` hands fits to a worker thread
    #[serde(default)]
    pub refit_mode: RefitMode,
}

/// How the calibrated accelerometer is mapped into the body frame before
/// estimating roll and pitch.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccelAxes {
    /// Use the calibrated vector as-is.
    Sensor,
    /// `(x, y, z) -> (y, -x, z)`
    #[default]
    SwapXy,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct OrientationConfig {
    /// Scale applied to the calibrated (unit) accelerometer (default: 9.81)
    #[serde(default = "default_gravity")]
    pub gravity: f64,

    #[serde(default)]
    pub accel_axes: AccelAxes,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// How long the service loop waits for an event before re-checking its run flag (default: 20)
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// How long a command waits for its acknowledgement (default: 1000)
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_storage_directory(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            refit_interval: default_refit_interval(),
            refit_mode: RefitMode::default(),
        }
    }
}

impl Default for OrientationConfig {
    fn default() -> Self {
        Self {
            gravity: default_gravity(),
            accel_axes: AccelAxes::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_timeout_ms: default_queue_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

fn default_storage_directory() -> PathBuf {
    PathBuf::from("/home/robot")
}
fn default_refit_interval() -> usize {
    1
}
fn default_gravity() -> f64 {
    DEFAULT_GRAVITY_METERS_PER_S2
}
fn default_queue_timeout_ms() -> u64 {
    20
}
fn default_command_timeout_ms() -> u64 {
    1000
}

impl ImuCalConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ImuCalConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values serde cannot. An empty `rover` is allowed here since
    /// the command line may still supply one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.calibration.refit_interval == 0 {
            return Err(ConfigError::Invalid(
                "calibration.refit_interval must be at least 1".into(),
            ));
        }
        if !(self.orientation.gravity.is_finite() && self.orientation.gravity > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "orientation.gravity must be positive, got {}",
                self.orientation.gravity
            )));
        }
        if self.rover.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "rover name {:?} cannot contain path separators",
                self.rover
            )));
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            refit_interval: self.calibration.refit_interval,
            refit_mode: self.calibration.refit_mode,
        }
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.service.queue_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.service.command_timeout_ms)
    }
}
