use float_ord::FloatOrd;
use nalgebra::{Matrix3x4, Matrix4, Point2, Point3, RowVector4};

/// Triangulates a point observed by two cameras with known projection matrices.
///
/// Projection matrices map homogeneous world points to homogeneous pixels (`K * [R | t]`).
pub trait Triangulator {
    /// Triangulates the world point seen at pixel `a` in the camera with projection `pa` and at
    /// pixel `b` in the camera with projection `pb`.
    ///
    /// Degenerate configurations produce non-finite coordinates rather than an error, so callers
    /// must filter the output.
    fn triangulate(
        &self,
        a: Point2<f64>,
        b: Point2<f64>,
        pa: &Matrix3x4<f64>,
        pb: &Matrix3x4<f64>,
    ) -> Point3<f64>;
}

/// Linear (DLT) two-view triangulation.
///
/// Each observation contributes the two rows `u * P3 - P1` and `v * P3 - P2` of a homogeneous
/// system. Rows are normalized to unit length before the system is solved, which keeps pixel
/// scale from dominating the conditioning. The homogeneous solution is the right singular vector
/// of the smallest singular value, which is then divided by `w`.
///
/// ```
/// use cv_geom::{pose_matrix, CameraIntrinsics, LinearTriangulator, Triangulator};
/// use nalgebra::{Point3, Rotation3, Vector3};
///
/// let intrinsics = CameraIntrinsics::from_image_size(640, 480);
/// let k = intrinsics.matrix();
/// let pa = k * pose_matrix(&Rotation3::identity(), &Vector3::zeros());
/// let rotation = Rotation3::new(Vector3::new(0.0, 0.1, 0.0));
/// let translation = Vector3::new(-1.0, 0.0, 0.0);
/// let pb = k * pose_matrix(&rotation, &translation);
///
/// let point = Point3::new(0.3, 0.1, 5.0);
/// let a = intrinsics.project(&point);
/// let b = intrinsics.project(&(rotation * point + translation));
/// let triangulated = LinearTriangulator::new().triangulate(a, b, &pa, &pb);
/// assert!((triangulated - point).norm() < 1e-6);
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, PartialOrd)]
pub struct LinearTriangulator;

impl LinearTriangulator {
    pub fn new() -> Self {
        Self
    }
}

fn normalized(row: RowVector4<f64>) -> RowVector4<f64> {
    let norm = row.norm();
    if norm > 0.0 {
        row / norm
    } else {
        row
    }
}

impl Triangulator for LinearTriangulator {
    fn triangulate(
        &self,
        a: Point2<f64>,
        b: Point2<f64>,
        pa: &Matrix3x4<f64>,
        pb: &Matrix3x4<f64>,
    ) -> Point3<f64> {
        let rows = [
            normalized(a.x * pa.row(2) - pa.row(0)),
            normalized(a.y * pa.row(2) - pa.row(1)),
            normalized(b.x * pb.row(2) - pb.row(0)),
            normalized(b.y * pb.row(2) - pb.row(1)),
        ];
        let system = Matrix4::from_rows(&rows);

        let nan = Point3::new(f64::NAN, f64::NAN, f64::NAN);
        let svd = system.svd(false, true);
        let v_t = match svd.v_t {
            Some(v_t) => v_t,
            None => return nan,
        };

        // The point lies in the null space, which is spanned by the smallest singular vector.
        svd.singular_values
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))
            .map(|(ix, _)| v_t.row(ix).transpose())
            .map(|h| Point3::new(h.x / h.w, h.y / h.w, h.z / h.w))
            .unwrap_or(nan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pose_matrix, CameraIntrinsics};
    use nalgebra::{Rotation3, Vector3};

    #[test]
    fn zero_baseline_stays_on_observed_ray() {
        // With no baseline every depth along the ray fits, so the solution is arbitrary.
        // It must still be either non-finite or consistent with the observed ray.
        let intrinsics = CameraIntrinsics::from_image_size(640, 480);
        let k = intrinsics.matrix();
        let pa = k * pose_matrix(&Rotation3::identity(), &Vector3::zeros());
        let pb = k * pose_matrix(&Rotation3::identity(), &Vector3::zeros());
        let pixel = Point2::new(100.0, 50.0);
        let point = LinearTriangulator::new().triangulate(pixel, pixel, &pa, &pb);
        if point.coords.iter().all(|n| n.is_finite()) && point.z.abs() > 1e-9 {
            let reprojected = intrinsics.project(&point);
            assert!((reprojected - pixel).norm() < 1e-3);
        }
    }

    #[test]
    fn triangulates_behind_camera_points_as_is() {
        let intrinsics = CameraIntrinsics::from_image_size(640, 480);
        let k = intrinsics.matrix();
        let pa = k * pose_matrix(&Rotation3::identity(), &Vector3::zeros());
        let translation = Vector3::new(-1.0, 0.0, 0.0);
        let pb = k * pose_matrix(&Rotation3::identity(), &translation);
        let point = Point3::new(0.5, 0.2, -4.0);
        let a = intrinsics.project(&point);
        let b = intrinsics.project(&(point + translation));
        let triangulated = LinearTriangulator::new().triangulate(a, b, &pa, &pb);
        assert!((triangulated - point).norm() < 1e-6);
    }
}
