use crate::SfmSettings;
use cv_geom::{AbsolutePose, CameraIntrinsics, PoseError, RansacPnp};
use cv_optimize::{PoseRefinementProblem, CAMERA_PARAMETERS};
use log::*;
use nalgebra::{Point2, Point3};
use rand::Rng;

/// Estimates a world-to-camera pose from 3d-2d correspondences while rejecting outliers.
pub trait AbsolutePoseSolver {
    fn solve_pose(
        &mut self,
        world: &[Point3<f64>],
        image: &[Point2<f64>],
        intrinsics: &CameraIntrinsics,
    ) -> Result<AbsolutePose, PoseError>;
}

impl<R> AbsolutePoseSolver for RansacPnp<R>
where
    R: Rng,
{
    fn solve_pose(
        &mut self,
        world: &[Point3<f64>],
        image: &[Point2<f64>],
        intrinsics: &CameraIntrinsics,
    ) -> Result<AbsolutePose, PoseError> {
        self.estimate(world, image, intrinsics)
    }
}

/// Sample consensus PnP followed by Levenberg-Marquardt refinement of the pose on its inliers.
#[derive(Debug, Clone)]
pub struct RefinedPnp<R> {
    ransac: RansacPnp<R>,
    patience: usize,
}

impl<R> RefinedPnp<R>
where
    R: Rng,
{
    pub fn new(ransac: RansacPnp<R>) -> Self {
        Self {
            ransac,
            patience: 10,
        }
    }

    /// Configures the sample consensus from the pose settings.
    pub fn from_settings(settings: &SfmSettings, rng: R) -> Self {
        Self::new(
            RansacPnp::new(settings.pnp_reprojection_threshold, rng)
                .confidence(settings.pnp_confidence)
                .max_iterations(settings.pnp_max_iterations),
        )
    }

    /// Bounds refinement to `patience * 7` residual evaluations. Zero skips refinement.
    #[must_use]
    pub fn patience(self, patience: usize) -> Self {
        Self { patience, ..self }
    }
}

impl<R> AbsolutePoseSolver for RefinedPnp<R>
where
    R: Rng,
{
    fn solve_pose(
        &mut self,
        world: &[Point3<f64>],
        image: &[Point2<f64>],
        intrinsics: &CameraIntrinsics,
    ) -> Result<AbsolutePose, PoseError> {
        let pose = self.ransac.estimate(world, image, intrinsics)?;
        let budget = self.patience * (CAMERA_PARAMETERS + 1);
        let solver = match cv_optimize::solver(1e-8, budget, CAMERA_PARAMETERS) {
            Some(solver) => solver,
            None => return Ok(pose),
        };

        let correspondences = pose
            .inliers
            .iter()
            .map(|&ix| (world[ix], image[ix]))
            .collect();
        let problem =
            PoseRefinementProblem::new(*intrinsics, pose.rotation, pose.translation, correspondences);
        let initial = problem.rms_error();
        let (problem, report) = solver.minimize(problem);
        let refined = problem.rms_error();
        debug!(
            "refined pose from {} to {} rms pixels on {} inliers ({:?})",
            initial,
            refined,
            pose.inliers.len(),
            report.termination
        );
        if refined.is_nan() || refined > initial {
            return Ok(pose);
        }

        let (rotation, translation) = problem.pose();
        let inliers = self
            .ransac
            .inliers(&rotation, &translation, intrinsics, world, image);
        if inliers.len() < pose.inliers.len() {
            return Ok(pose);
        }
        Ok(AbsolutePose {
            rotation,
            translation,
            inliers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Vector3};
    use rand::{rngs::SmallRng, SeedableRng};

    type Scene = (
        CameraIntrinsics,
        Rotation3<f64>,
        Vector3<f64>,
        Vec<Point3<f64>>,
        Vec<Point2<f64>>,
    );

    fn planar_scene() -> Scene {
        let intrinsics = CameraIntrinsics::from_image_size(1024, 768);
        let rotation = Rotation3::from_euler_angles(-0.15, 0.1, 0.02);
        let translation = Vector3::new(0.2, -0.1, 5.0);
        let world: Vec<Point3<f64>> = (0..64)
            .map(|i| Point3::new((i % 8) as f64 * 0.3 - 1.0, (i / 8) as f64 * 0.3 - 1.0, 0.0))
            .collect();
        let image = world
            .iter()
            .map(|p| intrinsics.project(&(rotation * p + translation)))
            .collect();
        (intrinsics, rotation, translation, world, image)
    }

    #[test]
    fn refined_pnp_registers_planar_scene() {
        let (intrinsics, rotation, translation, world, image) = planar_scene();
        let mut solver =
            RefinedPnp::from_settings(&SfmSettings::default(), SmallRng::seed_from_u64(0));
        let pose = solver.solve_pose(&world, &image, &intrinsics).unwrap();
        assert_eq!(pose.inliers.len(), 64);
        assert_relative_eq!(pose.rotation, rotation, epsilon = 1e-6);
        assert_relative_eq!(pose.translation, translation, epsilon = 1e-6);
    }

    #[test]
    fn zero_patience_skips_refinement() {
        let (intrinsics, _, _, world, image) = planar_scene();
        let mut refined =
            RefinedPnp::from_settings(&SfmSettings::default(), SmallRng::seed_from_u64(7))
                .patience(0);
        let mut plain = RansacPnp::new(3.0, SmallRng::seed_from_u64(7))
            .confidence(0.999)
            .max_iterations(200);
        assert_eq!(
            refined.solve_pose(&world, &image, &intrinsics),
            plain.solve_pose(&world, &image, &intrinsics)
        );
    }
}
