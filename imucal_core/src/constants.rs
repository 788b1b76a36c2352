pub mod fit_constants {
    /// Number of unknowns in the general quadric `[x², y², z², 2xy, 2xz, 2yz, 2x, 2y, 2z]`.
    pub const QUADRIC_TERMS: usize = 9;
    /// A fit is only attempted once the buffer holds more than 10 samples.
    pub const MIN_FIT_SAMPLES: usize = 11;
    /// Normal equations whose reciprocal condition number falls below this are
    /// treated as singular. Samples are rescaled to unit RMS norm before the
    /// check so the threshold does not depend on sensor units.
    pub const MIN_RECIPROCAL_CONDITION: f64 = 1e-10;
}

pub mod orientation_constants {
    /// Gravity used to turn calibrated (unit sphere) accelerometer readings into m/s².
    pub const DEFAULT_GRAVITY_METERS_PER_S2: f64 = 9.81;
}

pub mod diagnostics_constants {
    pub const DIAGNOSTIC_NAME: &str = "IMU Calibration Info";
    pub const ACCEL_OFFSETS_KEY: &str = "Accel Offsets";
    pub const ACCEL_TRANSFORM_KEY: &str = "Accel Transform";
    pub const MAG_OFFSETS_KEY: &str = "Mag Offsets";
    pub const MAG_TRANSFORM_KEY: &str = "Mag Transform";
}
