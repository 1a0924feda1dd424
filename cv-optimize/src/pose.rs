use crate::{
    reprojection::project,
    so3::{rotation_from_vector, rotation_vector},
};
use cv_geom::CameraIntrinsics;
use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{
    dimension::{Dynamic, U1},
    DMatrix, DVector, Point2, Point3, Rotation3, VecStorage, Vector3, Vector6,
};

/// Refines a single world-to-camera pose against fixed world points.
#[derive(Clone, Debug)]
pub struct PoseRefinementProblem {
    intrinsics: CameraIntrinsics,
    correspondences: Vec<(Point3<f64>, Point2<f64>)>,
    pose: Vector6<f64>,
}

impl PoseRefinementProblem {
    pub fn new(
        intrinsics: CameraIntrinsics,
        rotation: Rotation3<f64>,
        translation: Vector3<f64>,
        correspondences: Vec<(Point3<f64>, Point2<f64>)>,
    ) -> Self {
        let omega = rotation_vector(&rotation);
        Self {
            intrinsics,
            correspondences,
            pose: Vector6::new(
                omega.x,
                omega.y,
                omega.z,
                translation.x,
                translation.y,
                translation.z,
            ),
        }
    }

    fn vectors(&self) -> (Vector3<f64>, Vector3<f64>) {
        (
            self.pose.fixed_rows::<3>(0).into_owned(),
            self.pose.fixed_rows::<3>(3).into_owned(),
        )
    }

    pub fn pose(&self) -> (Rotation3<f64>, Vector3<f64>) {
        let (omega, translation) = self.vectors();
        (rotation_from_vector(&omega), translation)
    }

    pub fn rms_error(&self) -> f64 {
        crate::rms(&self.residual_vector())
    }

    fn residual_vector(&self) -> DVector<f64> {
        let (rotation, translation) = self.pose();
        DVector::from_iterator(
            2 * self.correspondences.len(),
            self.correspondences.iter().flat_map(|(world, pixel)| {
                let residual = *pixel - self.intrinsics.project(&(rotation * world + translation));
                [residual.x, residual.y]
            }),
        )
    }
}

impl LeastSquaresProblem<f64, Dynamic, Dynamic> for PoseRefinementProblem {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, Dynamic>;
    type ParameterStorage = VecStorage<f64, Dynamic, U1>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.pose.copy_from(&params.fixed_rows::<6>(0));
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_column_slice(self.pose.as_slice())
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residual_vector())
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let (omega, translation) = self.vectors();
        let mut jacobian = DMatrix::zeros(2 * self.correspondences.len(), 6);
        for (row, (world, _)) in self.correspondences.iter().enumerate() {
            let projection = project(&self.intrinsics, &omega, &translation, world);
            jacobian
                .fixed_slice_mut::<2, 3>(2 * row, 0)
                .copy_from(&-projection.d_rotation);
            jacobian
                .fixed_slice_mut::<2, 3>(2 * row, 3)
                .copy_from(&-projection.d_translation);
        }
        Some(jacobian)
    }
}
