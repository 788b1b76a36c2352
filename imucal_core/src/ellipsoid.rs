use nalgebra::{Matrix3, Matrix4, SMatrix, SVector, Vector3};

use crate::calibration::CalibrationParameters;
use crate::constants::fit_constants::{MIN_RECIPROCAL_CONDITION, QUADRIC_TERMS};
use crate::error::DegenerateFit;

type NormalMatrix = SMatrix<f64, QUADRIC_TERMS, QUADRIC_TERMS>;
type QuadricVector = SVector<f64, QUADRIC_TERMS>;

/// Fits an ellipsoid to `samples` and returns the parameters that map it onto
/// the unit sphere centered at the origin.
///
/// Least-squares fit of the general quadric
/// `ax² + by² + cz² + 2dxy + 2exz + 2fyz + 2gx + 2hy + 2iz = 1`,
/// solved in closed form through the normal equations `(D·Dᵗ)·v = D·1`.
/// The center comes from the linear terms, the principal axes from the
/// eigendecomposition of the centered shape matrix.
///
/// Samples are rescaled to unit RMS norm before solving and the result is
/// scaled back. The least-squares solution is invariant under uniform scaling
/// so this only affects conditioning, not the fitted ellipsoid.
pub fn fit_ellipsoid(samples: &[Vector3<f64>]) -> Result<CalibrationParameters, DegenerateFit> {
    let n = samples.len();
    if n < QUADRIC_TERMS {
        return Err(DegenerateFit::NotEnoughSamples {
            got: n,
            needed: QUADRIC_TERMS,
        });
    }
    if !samples.iter().all(|p| p.iter().all(|v| v.is_finite())) {
        return Err(DegenerateFit::NonFiniteSample);
    }

    let scale = (samples.iter().map(|p| p.norm_squared()).sum::<f64>() / n as f64).sqrt();
    if scale <= 0.0 || !scale.is_finite() {
        return Err(DegenerateFit::IllConditioned { rcond: 0.0 });
    }

    // Accumulate D·Dᵗ and D·1 one design column at a time.
    let mut normal = NormalMatrix::zeros();
    let mut rhs = QuadricVector::zeros();
    for p in samples {
        let column = design_column(&(p / scale));
        normal += column * column.transpose();
        rhs += column;
    }

    let v = solve_normal_equations(normal, &rhs)?;
    let unit = ellipsoid_from_quadric(&v)?;

    // Undo the rescaling: T'·(p/s - c') = (T'/s)·(p - s·c').
    Ok(CalibrationParameters::new(
        unit.offset * scale,
        unit.transform / scale,
    ))
}

/// `[x², y², z², 2xy, 2xz, 2yz, 2x, 2y, 2z]`
fn design_column(p: &Vector3<f64>) -> QuadricVector {
    let (x, y, z) = (p.x, p.y, p.z);
    QuadricVector::from([
        x * x,
        y * y,
        z * z,
        2.0 * x * y,
        2.0 * x * z,
        2.0 * y * z,
        2.0 * x,
        2.0 * y,
        2.0 * z,
    ])
}

fn solve_normal_equations(
    normal: NormalMatrix,
    rhs: &QuadricVector,
) -> Result<QuadricVector, DegenerateFit> {
    let svd = normal.svd(true, true);
    let max_sv = svd.singular_values.max();
    let min_sv = svd.singular_values.min();
    if !(max_sv > 0.0) {
        return Err(DegenerateFit::IllConditioned { rcond: 0.0 });
    }

    let rcond = min_sv / max_sv;
    if !(rcond > MIN_RECIPROCAL_CONDITION) {
        return Err(DegenerateFit::IllConditioned { rcond });
    }

    svd.solve(rhs, 0.0)
        .map_err(|_| DegenerateFit::IllConditioned { rcond })
}

fn ellipsoid_from_quadric(v: &QuadricVector) -> Result<CalibrationParameters, DegenerateFit> {
    #[rustfmt::skip]
    let a = Matrix4::new(
        v[0], v[3], v[4], v[6],
        v[3], v[1], v[5], v[7],
        v[4], v[5], v[2], v[8],
        v[6], v[7], v[8], -1.0,
    );

    // Center: -A[0:3, 0:3]·c = [g, h, i]ᵗ
    let shape: Matrix3<f64> = a.fixed_view::<3, 3>(0, 0).into_owned();
    let linear = Vector3::new(v[6], v[7], v[8]);
    let center = (-shape)
        .lu()
        .solve(&linear)
        .filter(|c| c.iter().all(|x| x.is_finite()))
        .ok_or(DegenerateFit::SingularShape)?;

    // Translate the quadric to the center: R = T·A·Tᵗ with the center in T's last row.
    let mut translation = Matrix4::identity();
    translation
        .fixed_view_mut::<1, 3>(3, 0)
        .copy_from(&center.transpose());
    let centered = translation * a * translation.transpose();

    let constant = -centered[(3, 3)];
    if !(constant.abs() > 0.0) {
        return Err(DegenerateFit::SingularShape);
    }
    let normalized: Matrix3<f64> = centered.fixed_view::<3, 3>(0, 0).into_owned() / constant;

    // Eigenvalues are 1 / radius² along each principal axis.
    let eigen = normalized.symmetric_eigen();
    let mut inverse_radii = Matrix3::zeros();
    for idx in 0..3 {
        let eigenvalue = eigen.eigenvalues[idx];
        if !(eigenvalue > 0.0) || !eigenvalue.is_finite() {
            return Err(DegenerateFit::NonPositiveEigenvalue(eigenvalue));
        }
        let radius = (1.0 / eigenvalue).sqrt();
        inverse_radii[(idx, idx)] = 1.0 / radius;
    }

    let transform = eigen.eigenvectors * inverse_radii * eigen.eigenvectors.transpose();

    Ok(CalibrationParameters::new(center, transform))
}
