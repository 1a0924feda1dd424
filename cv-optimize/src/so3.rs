//! Rotation vector (axis scaled by angle) helpers.

use nalgebra::{Matrix3, Point3, Rotation3, Vector3};

const SMALL_ANGLE: f64 = 1e-8;

/// The minimal three parameter representation of a rotation.
pub fn rotation_vector(rotation: &Rotation3<f64>) -> Vector3<f64> {
    rotation.scaled_axis()
}

/// The rotation represented by a rotation vector.
pub fn rotation_from_vector(omega: &Vector3<f64>) -> Rotation3<f64> {
    Rotation3::new(*omega)
}

/// The right Jacobian of SO(3).
///
/// For a small `delta`, `exp(omega + delta) ~= exp(omega) * exp(right_jacobian(omega) * delta)`.
pub fn right_jacobian(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let hat = omega.cross_matrix();
    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * hat + hat * hat / 6.0;
    }
    let theta2 = theta * theta;
    Matrix3::identity() - (1.0 - theta.cos()) / theta2 * hat
        + (theta - theta.sin()) / (theta2 * theta) * hat * hat
}

/// The derivative of `exp(omega) * point` with respect to `omega`.
pub fn rotated_point_jacobian(
    rotation: &Rotation3<f64>,
    omega: &Vector3<f64>,
    point: &Point3<f64>,
) -> Matrix3<f64> {
    -(rotation.matrix() * point.coords.cross_matrix() * right_jacobian(omega))
}
