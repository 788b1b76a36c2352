//! Tilt-compensated compass.
//!
//! Roll and pitch come from the gravity direction in the accelerometer
//! reading; yaw is the magnetometer heading after de-rotating by roll and
//! pitch.
//!
//! # Quaternion convention
//!
//! The quaternion is `Rz(yaw) · Ry(pitch) · Rx(roll)`: rotate by `roll` about
//! the fixed X axis, then `pitch` about the fixed Y axis, then `yaw` about the
//! fixed Z axis (the same rotation as intrinsic Z-Y'-X'', the usual aerospace
//! yaw/pitch/roll sequence). This is what
//! `UnitQuaternion::from_euler_angles(roll, pitch, yaw)` builds. Swapping the
//! composition order changes the numbers for any non-trivial attitude.

use core::f64::consts::PI;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Attitude derived from a single accel/mag pair. Recomputed on every sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientationEstimate {
    /// Radians, in `[-π/2, π/2]`.
    pub roll: f64,
    /// Radians, in `[-π/2, π/2]`.
    pub pitch: f64,
    /// Radians, in `[0, 2π]`.
    pub yaw: f64,
    pub quaternion: UnitQuaternion<f64>,
}

/// Estimates roll, pitch and tilt-compensated yaw.
///
/// Pure and total. `atan2(0, 0)` is defined as zero, so level or degenerate
/// accelerometer readings still produce finite angles. An all-zero
/// magnetometer makes yaw meaningless; callers reject such readings before
/// getting here (see [`crate::reading::validate_reading`]).
pub fn estimate_orientation(accel: &Vector3<f64>, mag: &Vector3<f64>) -> OrientationEstimate {
    let roll = accel.y.atan2((accel.x * accel.x + accel.z * accel.z).sqrt());
    let pitch = -accel.x.atan2((accel.y * accel.y + accel.z * accel.z).sqrt());

    let (sin_roll, cos_roll) = roll.sin_cos();
    let (sin_pitch, cos_pitch) = pitch.sin_cos();

    let heading_y = -mag.y * cos_roll + mag.z * sin_roll;
    let heading_x =
        mag.x * cos_pitch + mag.y * sin_pitch * sin_roll + mag.z * sin_pitch * cos_roll;
    let yaw = PI + heading_y.atan2(heading_x);

    OrientationEstimate {
        roll,
        pitch,
        yaw,
        quaternion: UnitQuaternion::from_euler_angles(roll, pitch, yaw),
    }
}
