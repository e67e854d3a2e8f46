//! Linear triangulation from two calibrated views.

use nalgebra::{Matrix3x4, Matrix4, Vector3};

use super::SE3;

/// Build a 3x4 projection matrix `[R | t]` from a world-to-camera transform.
pub fn projection_matrix(pose_cw: &SE3) -> Matrix3x4<f64> {
    let r = pose_cw.rotation.to_rotation_matrix();
    let mut p = Matrix3x4::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(r.matrix());
    p.fixed_view_mut::<3, 1>(0, 3).copy_from(&pose_cw.translation);
    p
}

/// Triangulate a 3D point from two normalized-plane observations.
///
/// `xn_a` and `xn_b` are observations on the z = 1 plane of their respective
/// cameras; `p_a` and `p_b` are the cameras' 3x4 projection matrices in a
/// common frame. Solves the DLT system `A X = 0` through the SVD of the
/// stacked 4x4 constraint matrix and returns the dehomogenized point, or
/// `None` when the solution is at infinity.
pub fn triangulate_linear(
    xn_a: &Vector3<f64>,
    xn_b: &Vector3<f64>,
    p_a: &Matrix3x4<f64>,
    p_b: &Matrix3x4<f64>,
) -> Option<Vector3<f64>> {
    let mut a = Matrix4::<f64>::zeros();

    for j in 0..4 {
        a[(0, j)] = xn_a.x * p_a[(2, j)] - p_a[(0, j)];
        a[(1, j)] = xn_a.y * p_a[(2, j)] - p_a[(1, j)];
        a[(2, j)] = xn_b.x * p_b[(2, j)] - p_b[(0, j)];
        a[(3, j)] = xn_b.y * p_b[(2, j)] - p_b[(1, j)];
    }

    // The solution is the right singular vector of the smallest singular value.
    let svd = a.svd(true, true);
    let v = svd.v_t?.transpose();
    let x_h = v.column(3);

    if x_h[3].abs() < 1e-10 {
        return None;
    }

    Some(Vector3::new(
        x_h[0] / x_h[3],
        x_h[1] / x_h[3],
        x_h[2] / x_h[3],
    ))
}
