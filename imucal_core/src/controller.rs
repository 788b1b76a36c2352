use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationParameters, ImuCalibration};
use crate::constants::fit_constants::MIN_FIT_SAMPLES;
use crate::ellipsoid::fit_ellipsoid;
use crate::error::{DegenerateFit, StorageError};
use crate::reading::Sensor;
use crate::storage::ParameterStore;

/// Whether samples are currently being collected for calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CalibrationMode {
    #[default]
    Idle,
    Collecting,
}

/// Where refits run once enough samples have been collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefitMode {
    /// Fit synchronously inside `on_sample`.
    #[default]
    Inline,
    /// Queue a [`FitRequest`] for an external worker and install the result later.
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Refit on every N-th sample once the buffer is large enough. 1 refits on every sample.
    pub refit_interval: usize,
    pub refit_mode: RefitMode,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            refit_interval: 1,
            refit_mode: RefitMode::Inline,
        }
    }
}

/// Per-sensor outcome of a fit. `Ok` means the parameters were replaced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    pub accel: Result<(), DegenerateFit>,
    pub mag: Result<(), DegenerateFit>,
}

impl FitReport {
    pub fn all_succeeded(&self) -> bool {
        self.accel.is_ok() && self.mag.is_ok()
    }
}

/// What `on_sample` did with a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleUpdate {
    /// Not collecting; the sample was not buffered.
    Ignored,
    /// Buffered, no fit this time.
    Buffered,
    /// Buffered and refitted inline.
    Refitted(FitReport),
    /// Buffered and a snapshot was queued for a deferred fit.
    FitQueued,
}

/// Snapshot of both sample buffers for a fit that runs off the sample path.
#[derive(Debug, Clone, PartialEq)]
pub struct FitRequest {
    pub session: u64,
    pub accel: Vec<Vector3<f64>>,
    pub mag: Vec<Vector3<f64>>,
}

impl FitRequest {
    /// Runs both fits. Cost grows with the number of buffered samples.
    pub fn run(self) -> FitResult {
        FitResult {
            session: self.session,
            sample_count: self.accel.len(),
            accel: fit_ellipsoid(&self.accel),
            mag: fit_ellipsoid(&self.mag),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub session: u64,
    pub sample_count: usize,
    pub accel: Result<CalibrationParameters, DegenerateFit>,
    pub mag: Result<CalibrationParameters, DegenerateFit>,
}

/// Owns the sample buffers and the current parameters for both sensors and
/// drives the Idle/Collecting state machine.
///
/// ```text
/// Idle       --start()--> Collecting
/// Collecting --start()--> Collecting (buffers and parameters reset)
/// Collecting --store()--> Idle
/// Idle       --store()--> Idle       (persists current parameters)
/// ```
///
/// Not synchronized; the owner must serialize `on_sample`, `start` and `store`.
#[derive(Debug)]
pub struct CalibrationController {
    config: ControllerConfig,
    mode: CalibrationMode,
    accel_samples: Vec<Vector3<f64>>,
    mag_samples: Vec<Vector3<f64>>,
    calibration: ImuCalibration,
    /// Bumped by every `start()` so late deferred fits can be recognised.
    session: u64,
    pending_fit: Option<FitRequest>,
}

impl Default for CalibrationController {
    fn default() -> Self {
        Self::new(ControllerConfig::default(), None)
    }
}

impl CalibrationController {
    /// Creates an Idle controller holding `initial`, or the uncalibrated defaults.
    pub fn new(config: ControllerConfig, initial: Option<ImuCalibration>) -> Self {
        Self {
            config: ControllerConfig {
                refit_interval: config.refit_interval.max(1),
                ..config
            },
            mode: CalibrationMode::Idle,
            accel_samples: Vec::new(),
            mag_samples: Vec::new(),
            calibration: initial.unwrap_or_default(),
            session: 0,
            pending_fit: None,
        }
    }

    /// Creates a controller from whatever `store` holds. A missing or unreadable
    /// record is not an error here; the controller starts uncalibrated.
    pub fn from_store(config: ControllerConfig, store: &dyn ParameterStore) -> Self {
        let initial = match store.load() {
            Ok(Some(calibration)) => {
                info!("Loaded stored IMU calibration.");
                Some(calibration)
            }
            Ok(None) => {
                info!("No IMU calibration file found.");
                None
            }
            Err(StorageError::Malformed(reason)) => {
                info!("Invalid IMU calibration file ({reason}). Starting from scratch.");
                None
            }
            Err(e) => {
                info!("Could not read IMU calibration ({e}). Starting from scratch.");
                None
            }
        };
        Self::new(config, initial)
    }

    pub fn mode(&self) -> CalibrationMode {
        self.mode
    }

    pub fn is_collecting(&self) -> bool {
        self.mode == CalibrationMode::Collecting
    }

    pub fn calibration(&self) -> &ImuCalibration {
        &self.calibration
    }

    pub fn parameters(&self, sensor: Sensor) -> &CalibrationParameters {
        match sensor {
            Sensor::Accelerometer => &self.calibration.accel,
            Sensor::Magnetometer => &self.calibration.mag,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.accel_samples.len()
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Applies the current parameters to a raw accel/mag pair.
    pub fn apply(&self, accel: &Vector3<f64>, mag: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
        (
            self.calibration.accel.apply(accel),
            self.calibration.mag.apply(mag),
        )
    }

    /// Begins a new calibration session. Destructive: drops both buffers and
    /// any fitted parameters, from either state.
    pub fn start(&mut self) {
        self.accel_samples = Vec::new();
        self.mag_samples = Vec::new();
        self.calibration = ImuCalibration::default();
        self.session += 1;
        self.pending_fit = None;
        self.mode = CalibrationMode::Collecting;
        info!(session = self.session, "IMU calibration started");
    }

    /// Buffers a raw sample pair while collecting and refits when due.
    pub fn on_sample(&mut self, accel: Vector3<f64>, mag: Vector3<f64>) -> SampleUpdate {
        if self.mode != CalibrationMode::Collecting {
            return SampleUpdate::Ignored;
        }

        self.accel_samples.push(accel);
        self.mag_samples.push(mag);

        if !self.refit_due() {
            return SampleUpdate::Buffered;
        }

        match self.config.refit_mode {
            RefitMode::Inline => SampleUpdate::Refitted(self.fit_now()),
            RefitMode::Background => {
                // A newer snapshot supersedes one nobody has picked up yet.
                self.pending_fit = Some(self.snapshot());
                SampleUpdate::FitQueued
            }
        }
    }

    /// Fits the whole buffer immediately, ignoring `refit_interval`.
    ///
    /// Returns `None` when not collecting or when the buffer is still too small.
    pub fn refit(&mut self) -> Option<FitReport> {
        if self.mode != CalibrationMode::Collecting || self.sample_count() < MIN_FIT_SAMPLES {
            return None;
        }
        Some(self.fit_now())
    }

    /// Hands out the queued deferred fit, if any.
    pub fn take_fit_request(&mut self) -> Option<FitRequest> {
        self.pending_fit.take()
    }

    /// Installs the outcome of a deferred fit.
    ///
    /// Results from an earlier session, or arriving after `store()`, are
    /// dropped and `None` is returned.
    pub fn install_fit(&mut self, result: FitResult) -> Option<FitReport> {
        if self.mode != CalibrationMode::Collecting || result.session != self.session {
            debug!(
                result_session = result.session,
                session = self.session,
                "Dropping stale calibration fit"
            );
            return None;
        }

        let report = FitReport {
            accel: install(Sensor::Accelerometer, &mut self.calibration.accel, result.accel),
            mag: install(Sensor::Magnetometer, &mut self.calibration.mag, result.mag),
        };
        debug!(samples = result.sample_count, "Installed deferred calibration fit");
        Some(report)
    }

    /// Stops collecting and persists the current parameters for both sensors.
    ///
    /// The transition to Idle happens even when saving fails; the in-memory
    /// parameters stay in use either way.
    pub fn store(&mut self, store: &mut dyn ParameterStore) -> Result<(), StorageError> {
        self.mode = CalibrationMode::Idle;
        self.pending_fit = None;

        match store.save(&self.calibration) {
            Ok(()) => {
                info!(
                    samples = self.sample_count(),
                    "Stored IMU calibration"
                );
                Ok(())
            }
            Err(e) => {
                warn!("Failed to store IMU calibration: {e}");
                Err(e)
            }
        }
    }

    fn refit_due(&self) -> bool {
        let count = self.sample_count();
        count >= MIN_FIT_SAMPLES && (count - MIN_FIT_SAMPLES) % self.config.refit_interval == 0
    }

    fn snapshot(&self) -> FitRequest {
        FitRequest {
            session: self.session,
            accel: self.accel_samples.clone(),
            mag: self.mag_samples.clone(),
        }
    }

    fn fit_now(&mut self) -> FitReport {
        let report = FitReport {
            accel: install(
                Sensor::Accelerometer,
                &mut self.calibration.accel,
                fit_ellipsoid(&self.accel_samples),
            ),
            mag: install(
                Sensor::Magnetometer,
                &mut self.calibration.mag,
                fit_ellipsoid(&self.mag_samples),
            ),
        };
        if report.all_succeeded() {
            debug!(samples = self.sample_count(), "Refitted IMU calibration");
        }
        report
    }
}

/// Replaces `target` on success; on failure reports and leaves it untouched.
fn install(
    sensor: Sensor,
    target: &mut CalibrationParameters,
    fit: Result<CalibrationParameters, DegenerateFit>,
) -> Result<(), DegenerateFit> {
    match fit {
        Ok(params) => {
            *target = params;
            Ok(())
        }
        Err(e) => {
            warn!("{sensor} calibration fit failed: {e}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::test_utils::{affine_ellipsoid, fibonacci_sphere, rotation};
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    struct Session {
        accel: Vec<Vector3<f64>>,
        mag: Vec<Vector3<f64>>,
        accel_offset: Vector3<f64>,
        mag_offset: Vector3<f64>,
    }

    fn session(n: usize) -> Session {
        let unit = fibonacci_sphere(n);
        let accel_offset = Vector3::new(0.02, -0.05, 0.03);
        let mag_offset = Vector3::new(-30.0, 12.0, 45.0);
        Session {
            accel: affine_ellipsoid(
                &unit,
                &Matrix3::from_diagonal(&Vector3::new(1.02, 0.97, 1.05)),
                &accel_offset,
            ),
            mag: affine_ellipsoid(
                &unit,
                &(rotation(0.2, 0.1, -0.3)
                    * Matrix3::from_diagonal(&Vector3::new(48.0, 52.0, 44.0))),
                &mag_offset,
            ),
            accel_offset,
            mag_offset,
        }
    }

    fn feed(
        controller: &mut CalibrationController,
        data: &Session,
        count: usize,
    ) -> Vec<SampleUpdate> {
        data.accel
            .iter()
            .zip(&data.mag)
            .take(count)
            .map(|(a, m)| controller.on_sample(*a, *m))
            .collect()
    }

    fn planar(n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|i| {
                let t = i as f64 * core::f64::consts::TAU / n as f64;
                Vector3::new(t.cos(), t.sin(), 0.25)
            })
            .collect()
    }

    #[test]
    fn starts_idle_with_defaults() {
        let controller = CalibrationController::default();
        assert_eq!(controller.mode(), CalibrationMode::Idle);
        assert!(controller.calibration().is_identity());
        assert_eq!(controller.sample_count(), 0);
    }

    #[test]
    fn idle_controller_ignores_samples() {
        let mut controller = CalibrationController::default();
        let update = controller.on_sample(Vector3::new(0.0, 0.0, 1.0), Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(update, SampleUpdate::Ignored);
        assert_eq!(controller.sample_count(), 0);
    }

    #[test]
    fn ten_samples_never_trigger_a_fit() {
        let data = session(40);
        let mut controller = CalibrationController::default();
        controller.start();

        let updates = feed(&mut controller, &data, 10);
        assert!(updates.iter().all(|u| *u == SampleUpdate::Buffered));
        assert_eq!(controller.sample_count(), 10);
        assert!(controller.calibration().is_identity());
        assert_eq!(controller.refit(), None);
    }

    #[test]
    fn eleventh_sample_fits_both_sensors() {
        let data = session(40);
        let mut controller = CalibrationController::default();
        controller.start();

        let updates = feed(&mut controller, &data, 11);
        match updates[10] {
            SampleUpdate::Refitted(report) => assert!(report.all_succeeded()),
            other => panic!("expected a refit, got {other:?}"),
        }
        assert_relative_eq!(
            controller.parameters(Sensor::Accelerometer).offset,
            data.accel_offset,
            epsilon = 1e-6
        );
        assert_relative_eq!(
            controller.parameters(Sensor::Magnetometer).offset,
            data.mag_offset,
            epsilon = 1e-6
        );

        // Output immediately uses the new fit.
        let (accel, mag) = controller.apply(&data.accel[3], &data.mag[3]);
        assert_relative_eq!(accel.norm(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(mag.norm(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn degenerate_samples_keep_previous_parameters() {
        let data = session(40);
        let mut controller = CalibrationController::default();
        controller.start();
        feed(&mut controller, &data, 11);
        let fitted_accel = *controller.parameters(Sensor::Accelerometer);

        // Start a session whose accelerometer samples all lie in one plane.
        controller.start();
        let flat = planar(30);
        let mut last = SampleUpdate::Ignored;
        for (a, m) in flat.iter().zip(&data.mag) {
            last = controller.on_sample(*a, *m);
        }

        match last {
            SampleUpdate::Refitted(report) => {
                assert!(matches!(report.accel, Err(DegenerateFit::IllConditioned { .. })));
                assert!(report.mag.is_ok());
            }
            other => panic!("expected a refit, got {other:?}"),
        }
        assert!(controller.parameters(Sensor::Accelerometer).is_identity());
        assert_ne!(*controller.parameters(Sensor::Accelerometer), fitted_accel);
        assert!(!controller.parameters(Sensor::Magnetometer).is_identity());
    }

    #[test]
    fn start_resets_a_fitted_session() {
        let data = session(40);
        let mut controller = CalibrationController::default();
        controller.start();
        feed(&mut controller, &data, 25);
        assert!(!controller.calibration().is_identity());

        controller.start();
        assert_eq!(controller.mode(), CalibrationMode::Collecting);
        assert_eq!(controller.sample_count(), 0);
        assert!(controller.calibration().is_identity());
    }

    #[test]
    fn start_from_idle_with_loaded_parameters_resets_them() {
        let loaded = ImuCalibration::new(
            CalibrationParameters::new(Vector3::new(1.0, 2.0, 3.0), Matrix3::identity() * 2.0),
            CalibrationParameters::new(Vector3::new(-1.0, 0.0, 1.0), Matrix3::identity() * 0.5),
        );
        let mut controller = CalibrationController::new(ControllerConfig::default(), Some(loaded));
        assert_eq!(*controller.calibration(), loaded);

        controller.start();
        assert!(controller.calibration().is_identity());
        assert_eq!(controller.sample_count(), 0);
    }

    #[test]
    fn store_persists_and_returns_to_idle() {
        let data = session(40);
        let mut controller = CalibrationController::default();
        let mut store = MemoryStore::new();
        controller.start();
        feed(&mut controller, &data, 30);
        let fitted = *controller.calibration();

        controller.store(&mut store).unwrap();
        assert_eq!(controller.mode(), CalibrationMode::Idle);
        assert_eq!(store.load().unwrap(), Some(fitted));

        // Further samples are not buffered and parameters stay in use.
        assert_eq!(
            controller.on_sample(data.accel[0], data.mag[0]),
            SampleUpdate::Ignored
        );
        assert_eq!(*controller.calibration(), fitted);

        let reloaded = CalibrationController::from_store(ControllerConfig::default(), &store);
        assert_eq!(*reloaded.calibration(), fitted);
    }

    #[test]
    fn store_before_any_fit_persists_defaults() {
        let mut controller = CalibrationController::default();
        let mut store = MemoryStore::new();
        controller.start();
        controller.store(&mut store).unwrap();
        assert!(store.load().unwrap().unwrap().is_identity());
    }

    #[test]
    fn store_while_idle_is_legal() {
        let mut controller = CalibrationController::default();
        let mut store = MemoryStore::new();
        controller.store(&mut store).unwrap();
        controller.store(&mut store).unwrap();
        assert_eq!(controller.mode(), CalibrationMode::Idle);
        assert_eq!(store.save_count(), 2);
    }

    #[test]
    fn failed_store_still_goes_idle() {
        let data = session(40);
        let mut controller = CalibrationController::default();
        let mut store = MemoryStore::new();
        store.fail_saves(true);
        controller.start();
        feed(&mut controller, &data, 15);
        let fitted = *controller.calibration();

        assert!(controller.store(&mut store).is_err());
        assert_eq!(controller.mode(), CalibrationMode::Idle);
        assert_eq!(*controller.calibration(), fitted);
    }

    #[test]
    fn malformed_store_falls_back_to_defaults() {
        let mut record = crate::storage::CalibrationRecord::from(&ImuCalibration::default());
        record.acc_transform = [[0.0; 3]; 3];
        let store = MemoryStore::with_record(record);

        let controller = CalibrationController::from_store(ControllerConfig::default(), &store);
        assert!(controller.calibration().is_identity());
        assert_eq!(controller.mode(), CalibrationMode::Idle);
    }

    #[test]
    fn refit_interval_spaces_out_fits() {
        let data = session(40);
        let config = ControllerConfig {
            refit_interval: 5,
            ..ControllerConfig::default()
        };
        let mut controller = CalibrationController::new(config, None);
        controller.start();

        let updates = feed(&mut controller, &data, 21);
        let refits: Vec<usize> = updates
            .iter()
            .enumerate()
            .filter(|(_, u)| matches!(u, SampleUpdate::Refitted(_)))
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(refits, vec![11, 16, 21]);

        // An explicit request fits regardless of the interval.
        assert!(controller.refit().unwrap().all_succeeded());
    }

    #[test]
    fn deferred_fit_is_installed_for_current_session() {
        let data = session(40);
        let config = ControllerConfig {
            refit_mode: RefitMode::Background,
            ..ControllerConfig::default()
        };
        let mut controller = CalibrationController::new(config, None);
        controller.start();

        let updates = feed(&mut controller, &data, 12);
        assert_eq!(updates[10], SampleUpdate::FitQueued);
        assert_eq!(updates[11], SampleUpdate::FitQueued);
        assert!(controller.calibration().is_identity());

        // Only the newest snapshot is pending.
        let request = controller.take_fit_request().unwrap();
        assert_eq!(request.accel.len(), 12);
        assert!(controller.take_fit_request().is_none());

        let report = controller.install_fit(request.run()).unwrap();
        assert!(report.all_succeeded());
        assert_relative_eq!(
            controller.parameters(Sensor::Magnetometer).offset,
            data.mag_offset,
            epsilon = 1e-6
        );
    }

    #[test]
    fn deferred_fit_from_previous_session_is_dropped() {
        let data = session(40);
        let config = ControllerConfig {
            refit_mode: RefitMode::Background,
            ..ControllerConfig::default()
        };
        let mut controller = CalibrationController::new(config, None);
        controller.start();
        feed(&mut controller, &data, 11);
        let request = controller.take_fit_request().unwrap();

        controller.start();
        assert_eq!(controller.install_fit(request.run()), None);
        assert!(controller.calibration().is_identity());
    }

    #[test]
    fn deferred_fit_after_store_is_dropped() {
        let data = session(40);
        let config = ControllerConfig {
            refit_mode: RefitMode::Background,
            ..ControllerConfig::default()
        };
        let mut controller = CalibrationController::new(config, None);
        let mut store = MemoryStore::new();
        controller.start();
        feed(&mut controller, &data, 11);
        let request = controller.take_fit_request().unwrap();

        controller.store(&mut store).unwrap();
        assert_eq!(controller.install_fit(request.run()), None);
        assert!(controller.calibration().is_identity());
    }
}
