use nalgebra::{Matrix3, Rotation3, Vector3};

/// Roughly uniform points on the unit sphere.
pub fn fibonacci_sphere(n: usize) -> Vec<Vector3<f64>> {
    let golden_angle = core::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    (0..n)
        .map(|i| {
            let z = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let theta = golden_angle * i as f64;
            Vector3::new(r * theta.cos(), r * theta.sin(), z)
        })
        .collect()
}

pub fn rotation(roll: f64, pitch: f64, yaw: f64) -> Matrix3<f64> {
    Rotation3::from_euler_angles(roll, pitch, yaw).into_inner()
}

/// Maps unit-sphere points through `linear · p + offset`.
pub fn affine_ellipsoid(
    unit: &[Vector3<f64>],
    linear: &Matrix3<f64>,
    offset: &Vector3<f64>,
) -> Vec<Vector3<f64>> {
    unit.iter().map(|p| linear * p + offset).collect()
}
