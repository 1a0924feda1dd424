use crate::so3::{rotated_point_jacobian, rotation_from_vector, rotation_vector};
use cv_geom::CameraIntrinsics;
use itertools::Itertools;
use nalgebra::{DVector, Matrix2x3, Point2, Point3, Rotation3, Vector3};

/// Scalars per camera: a rotation vector followed by a translation.
pub const CAMERA_PARAMETERS: usize = 6;
/// Scalars per point: its world coordinate.
pub const POINT_PARAMETERS: usize = 3;

/// A pixel observation of point `point` in camera `camera`.
///
/// Both indices are dense, zero-based positions into the cameras and points of a
/// [`BundleAdjustmentProblem`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ReprojectionObservation {
    pub camera: usize,
    pub point: usize,
    pub pixel: Point2<f64>,
}

/// The projection of a world point and its derivatives.
pub(crate) struct Projection {
    pub pixel: Point2<f64>,
    pub d_rotation: Matrix2x3<f64>,
    pub d_translation: Matrix2x3<f64>,
    pub d_point: Matrix2x3<f64>,
}

/// Projects `point` through the camera `(omega, translation)` and differentiates the pixel with
/// respect to the rotation vector, the translation and the point.
pub(crate) fn project(
    intrinsics: &CameraIntrinsics,
    omega: &Vector3<f64>,
    translation: &Vector3<f64>,
    point: &Point3<f64>,
) -> Projection {
    let rotation = rotation_from_vector(omega);
    let camera_point = rotation * point + translation;
    let (x, y, z) = (camera_point.x, camera_point.y, camera_point.z);
    let (fx, fy, s) = (intrinsics.focals.x, intrinsics.focals.y, intrinsics.skew);
    let z2 = z * z;
    #[rustfmt::skip]
    let d_camera_point = Matrix2x3::new(
        fx / z, s / z,  -(fx * x + s * y) / z2,
        0.0,    fy / z, -fy * y / z2,
    );
    Projection {
        pixel: intrinsics.project(&camera_point),
        d_rotation: d_camera_point * rotated_point_jacobian(&rotation, omega, point),
        d_translation: d_camera_point,
        d_point: d_camera_point * rotation.matrix(),
    }
}

/// Joint refinement of camera poses and world points by minimizing reprojection error.
///
/// The parameter vector holds every camera (6 scalars each) followed by every point
/// (3 scalars each). The residual of an observation is the observed pixel minus the projected
/// pixel, so there are two residuals per observation.
///
/// Solve it with [`SchurLevenbergMarquardt`](crate::SchurLevenbergMarquardt).
#[derive(Clone, Debug)]
pub struct BundleAdjustmentProblem {
    pub(crate) intrinsics: CameraIntrinsics,
    num_cameras: usize,
    num_points: usize,
    pub(crate) observations: Vec<ReprojectionObservation>,
    pub(crate) params: DVector<f64>,
    fixed: Vec<bool>,
}

impl BundleAdjustmentProblem {
    /// Creates the problem from world-to-camera poses, points and observations.
    ///
    /// # Panics
    ///
    /// Panics if an observation refers to a camera or point that was not passed in.
    pub fn new(
        intrinsics: CameraIntrinsics,
        cameras: &[(Rotation3<f64>, Vector3<f64>)],
        points: &[Point3<f64>],
        observations: Vec<ReprojectionObservation>,
    ) -> Self {
        assert!(
            observations
                .iter()
                .all(|o| o.camera < cameras.len() && o.point < points.len()),
            "bundle adjustment observation refers to a missing camera or point"
        );
        let camera_params = cameras.iter().flat_map(|(rotation, translation)| {
            rotation_vector(rotation)
                .iter()
                .chain(translation.iter())
                .copied()
                .collect_vec()
        });
        let point_params = points.iter().flat_map(|p| p.coords.iter().copied());
        let params = DVector::from_iterator(
            CAMERA_PARAMETERS * cameras.len() + POINT_PARAMETERS * points.len(),
            camera_params.chain(point_params),
        );
        Self {
            intrinsics,
            num_cameras: cameras.len(),
            num_points: points.len(),
            observations,
            params,
            fixed: vec![false; cameras.len()],
        }
    }

    /// Holds camera `ix` at its current pose while the rest of the problem is optimized.
    ///
    /// # Panics
    ///
    /// Panics if `ix` is not a camera of the problem.
    #[must_use]
    pub fn fix_camera(mut self, ix: usize) -> Self {
        self.fixed[ix] = true;
        self
    }

    pub fn is_fixed(&self, ix: usize) -> bool {
        self.fixed[ix]
    }

    /// Cameras first, then points. See [`CAMERA_PARAMETERS`] and [`POINT_PARAMETERS`].
    pub fn params(&self) -> &DVector<f64> {
        &self.params
    }

    pub fn num_cameras(&self) -> usize {
        self.num_cameras
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn observations(&self) -> &[ReprojectionObservation] {
        &self.observations
    }

    pub(crate) fn camera_vectors(&self, ix: usize) -> (Vector3<f64>, Vector3<f64>) {
        let offset = CAMERA_PARAMETERS * ix;
        (
            self.params.fixed_rows::<3>(offset).into_owned(),
            self.params.fixed_rows::<3>(offset + 3).into_owned(),
        )
    }

    pub(crate) fn point_offset(&self, ix: usize) -> usize {
        CAMERA_PARAMETERS * self.num_cameras + POINT_PARAMETERS * ix
    }

    /// The current world-to-camera pose of camera `ix`.
    pub fn camera(&self, ix: usize) -> (Rotation3<f64>, Vector3<f64>) {
        let (omega, translation) = self.camera_vectors(ix);
        (rotation_from_vector(&omega), translation)
    }

    /// The current coordinate of point `ix`.
    pub fn point(&self, ix: usize) -> Point3<f64> {
        self.params
            .fixed_rows::<3>(self.point_offset(ix))
            .into_owned()
            .into()
    }

    pub fn residual_vector(&self) -> DVector<f64> {
        let mut residuals = DVector::zeros(2 * self.observations.len());
        for (row, observation) in self.observations.iter().enumerate() {
            let (omega, translation) = self.camera_vectors(observation.camera);
            let rotation = rotation_from_vector(&omega);
            let point = self.point(observation.point);
            let projected = self.intrinsics.project(&(rotation * point + translation));
            let residual = observation.pixel - projected;
            residuals[2 * row] = residual.x;
            residuals[2 * row + 1] = residual.y;
        }
        residuals
    }

    /// Root-mean-square of the current residual vector.
    pub fn rms_error(&self) -> f64 {
        crate::rms(&self.residual_vector())
    }

    /// Half the squared norm of the residual vector.
    pub fn cost(&self) -> f64 {
        0.5 * self.residual_vector().norm_squared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn problem() -> BundleAdjustmentProblem {
        let intrinsics = CameraIntrinsics::from_image_size(640, 480).skew(0.3);
        let cameras = [
            (Rotation3::identity(), Vector3::zeros()),
            (
                Rotation3::new(Vector3::new(0.05, -0.2, 0.01)),
                Vector3::new(-1.0, 0.1, 0.2),
            ),
        ];
        let points = [
            Point3::new(0.2, 0.1, 5.0),
            Point3::new(-0.4, 0.3, 6.0),
            Point3::new(0.7, -0.5, 4.5),
        ];
        let mut observations = vec![];
        for (camera, (rotation, translation)) in cameras.iter().enumerate() {
            for (point, p) in points.iter().enumerate() {
                let pixel = intrinsics.project(&(rotation * p + translation));
                observations.push(ReprojectionObservation {
                    camera,
                    point,
                    // Offset the observation so the residuals are not all zero.
                    pixel: pixel + nalgebra::Vector2::new(0.5, -0.25),
                });
            }
        }
        BundleAdjustmentProblem::new(intrinsics, &cameras, &points, observations)
    }

    #[test]
    fn residuals_are_observed_minus_projected() {
        let problem = problem();
        let residuals = problem.residual_vector();
        assert_eq!(residuals.len(), 12);
        for pair in residuals.as_slice().chunks(2) {
            assert_relative_eq!(pair[0], 0.5, epsilon = 1e-9);
            assert_relative_eq!(pair[1], -0.25, epsilon = 1e-9);
        }
    }

    #[test]
    fn parameters_round_trip_through_the_layout() {
        let problem = problem();
        let (rotation, translation) = problem.camera(1);
        assert_relative_eq!(
            rotation,
            Rotation3::new(Vector3::new(0.05, -0.2, 0.01)),
            epsilon = 1e-12
        );
        assert_relative_eq!(translation, Vector3::new(-1.0, 0.1, 0.2));
        assert_relative_eq!(problem.point(2), Point3::new(0.7, -0.5, 4.5));
    }

    #[test]
    fn projection_derivatives_match_central_differences() {
        let mut problem = problem();
        let params = problem.params.clone();
        let h = 1e-6;
        for (row, observation) in problem.observations.clone().iter().enumerate() {
            let (omega, translation) = problem.camera_vectors(observation.camera);
            let point = problem.point(observation.point);
            let projection = project(&problem.intrinsics, &omega, &translation, &point);
            let camera_col = CAMERA_PARAMETERS * observation.camera;
            let point_col = problem.point_offset(observation.point);
            let analytic = [
                (camera_col, projection.d_rotation),
                (camera_col + 3, projection.d_translation),
                (point_col, projection.d_point),
            ];
            for (offset, block) in analytic {
                for c in 0..3 {
                    problem.params = params.clone();
                    problem.params[offset + c] += h;
                    let plus = problem.residual_vector();
                    problem.params = params.clone();
                    problem.params[offset + c] -= h;
                    let minus = problem.residual_vector();
                    for r in 0..2 {
                        // Residuals are observed minus projected.
                        let numeric = -(plus[2 * row + r] - minus[2 * row + r]) / (2.0 * h);
                        assert_relative_eq!(
                            block[(r, c)],
                            numeric,
                            epsilon = 1e-4,
                            max_relative = 1e-5
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn projection_matches_intrinsics() {
        let problem = problem();
        let (omega, translation) = problem.camera_vectors(1);
        let point = problem.point(2);
        let (rotation, _) = problem.camera(1);
        let projection = project(&problem.intrinsics, &omega, &translation, &point);
        assert_relative_eq!(
            projection.pixel,
            problem.intrinsics.project(&(rotation * point + translation)),
            epsilon = 1e-9
        );
    }
}
