//! Perspective-n-point: recovering a world-to-camera pose from world points and their pixels.

use crate::CameraIntrinsics;
use arrsac::Arrsac;
use cv_core::nalgebra as cvn;
use cv_core::sample_consensus::{Consensus, Estimator, Model};
use cv_core::{FeatureWorldMatch, WorldPoint, WorldToCamera};
use lambda_twist::LambdaTwist;
use log::*;
use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};
use rand::{seq::SliceRandom, Rng};
use thiserror::Error;

/// The number of correspondences the minimal P3P solver consumes per hypothesis.
pub const P3P_SAMPLES: usize = 3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PoseError {
    #[error("need at least {needed} point correspondences, found {found}")]
    TooFewPoints { needed: usize, found: usize },
    #[error("sample consensus failed to find a pose with enough inliers")]
    NoConsensus,
}

/// A world-to-camera pose together with the indices of the correspondences that support it.
#[derive(Debug, Clone, PartialEq)]
pub struct AbsolutePose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    /// Indices into the input correspondences, ascending.
    pub inliers: Vec<usize>,
}

/// The pixel distance between an observation and the projection of its world point.
///
/// Points that are not in front of the camera have an infinite error.
pub fn reprojection_error(
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    intrinsics: &CameraIntrinsics,
    world: &Point3<f64>,
    pixel: &Point2<f64>,
) -> f64 {
    let camera_point = rotation * world + translation;
    if camera_point.z <= 0.0 {
        return f64::INFINITY;
    }
    (intrinsics.project(&camera_point) - pixel).norm()
}

/// A world point and the pixel it was observed at, along with the calibrated image point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelWorldMatch {
    pub world: Point3<f64>,
    pub pixel: Point2<f64>,
    pub normalized: Point2<f64>,
}

impl PixelWorldMatch {
    pub fn new(world: Point3<f64>, pixel: Point2<f64>, intrinsics: &CameraIntrinsics) -> Self {
        Self {
            world,
            pixel,
            normalized: intrinsics.calibrate(pixel),
        }
    }

    fn bearing_match(&self) -> FeatureWorldMatch<cvn::Unit<cvn::Vector3<f64>>> {
        let bearing = cvn::Unit::new_normalize(cvn::Vector3::new(
            self.normalized.x,
            self.normalized.y,
            1.0,
        ));
        let world = cvn::Vector4::new(self.world.x, self.world.y, self.world.z, 1.0);
        FeatureWorldMatch(bearing, WorldPoint(world))
    }
}

/// A pose hypothesis scored by pixel reprojection error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelPose {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    intrinsics: CameraIntrinsics,
}

impl PixelPose {
    fn from_world_to_camera(pose: &WorldToCamera, intrinsics: CameraIntrinsics) -> Option<Self> {
        let rotation = pose.0.rotation.matrix();
        let translation = &pose.0.translation.vector;
        let rotation = Matrix3::from_fn(|r, c| rotation[(r, c)]);
        let translation = Vector3::new(translation.x, translation.y, translation.z);
        if !rotation.iter().chain(translation.iter()).all(|n| n.is_finite()) {
            return None;
        }
        Some(Self {
            rotation: Rotation3::from_matrix_unchecked(rotation),
            translation,
            intrinsics,
        })
    }
}

impl Model<PixelWorldMatch> for PixelPose {
    fn residual(&self, data: &PixelWorldMatch) -> f64 {
        reprojection_error(
            &self.rotation,
            &self.translation,
            &self.intrinsics,
            &data.world,
            &data.pixel,
        )
    }
}

/// Lambda Twist P3P lifted from bearings to pixels so consensus thresholds are in pixels.
///
/// Unlike a linear solver this handles points that all lie on one plane.
#[derive(Debug, Clone, Copy)]
pub struct P3p {
    pub intrinsics: CameraIntrinsics,
}

impl Estimator<PixelWorldMatch> for P3p {
    type Model = PixelPose;
    type ModelIter = Vec<PixelPose>;
    const MIN_SAMPLES: usize = P3P_SAMPLES;

    fn estimate<I>(&self, data: I) -> Self::ModelIter
    where
        I: Iterator<Item = PixelWorldMatch> + Clone,
    {
        let samples = data.take(P3P_SAMPLES).map(|m| m.bearing_match());
        LambdaTwist::new()
            .estimate(samples)
            .iter()
            .filter_map(|pose| PixelPose::from_world_to_camera(pose, self.intrinsics))
            .collect()
    }
}

/// P3P inside ARRSAC.
///
/// The confidence sets the likelihood ratio at which ARRSAC rejects a hypothesis early, and the
/// iteration budget bounds the number of hypotheses generated while bootstrapping.
#[derive(Debug, Clone)]
pub struct RansacPnp<R> {
    threshold: f64,
    confidence: f64,
    max_iterations: usize,
    rng: R,
}

impl<R> RansacPnp<R>
where
    R: Rng,
{
    /// Creates a solver which counts a correspondence as an inlier when it reprojects within
    /// `threshold` pixels.
    ///
    /// The confidence defaults to `0.999` and the iteration budget to `200`.
    pub fn new(threshold: f64, rng: R) -> Self {
        Self {
            threshold,
            confidence: 0.999,
            max_iterations: 200,
            rng,
        }
    }

    #[must_use]
    pub fn confidence(self, confidence: f64) -> Self {
        Self { confidence, ..self }
    }

    #[must_use]
    pub fn max_iterations(self, max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..self
        }
    }

    /// Indices of the correspondences that reproject within the threshold.
    pub fn inliers(
        &self,
        rotation: &Rotation3<f64>,
        translation: &Vector3<f64>,
        intrinsics: &CameraIntrinsics,
        world: &[Point3<f64>],
        image: &[Point2<f64>],
    ) -> Vec<usize> {
        world
            .iter()
            .zip(image)
            .enumerate()
            .filter(|(_, (w, i))| {
                reprojection_error(rotation, translation, intrinsics, w, i) < self.threshold
            })
            .map(|(ix, _)| ix)
            .collect()
    }

    fn likelihood_ratio(&self) -> f32 {
        let ratio = 1.0 / (1.0 - self.confidence);
        if ratio.is_finite() && ratio > 1.0 {
            ratio as f32
        } else {
            1e3
        }
    }

    /// Estimates the world-to-camera pose from `world` points and the `image` pixels they
    /// were observed at.
    pub fn estimate(
        &mut self,
        world: &[Point3<f64>],
        image: &[Point2<f64>],
        intrinsics: &CameraIntrinsics,
    ) -> Result<AbsolutePose, PoseError> {
        let n = world.len().min(image.len());
        // One extra correspondence is needed to pick among the P3P solutions.
        let needed = P3P_SAMPLES + 1;
        if n < needed {
            return Err(PoseError::TooFewPoints { needed, found: n });
        }
        let world = &world[..n];
        let image = &image[..n];

        // ARRSAC evaluates data in order, so shuffle to avoid biasing towards the first tracks.
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut self.rng);
        let matches: Vec<PixelWorldMatch> = order
            .iter()
            .map(|&ix| PixelWorldMatch::new(world[ix], image[ix], intrinsics))
            .collect();

        let likelihood_ratio = self.likelihood_ratio();
        let mut arrsac = Arrsac::new(self.threshold, &mut self.rng)
            .initialization_hypotheses(self.max_iterations.max(1))
            .likelihood_ratio_threshold(likelihood_ratio);
        let estimator = P3p {
            intrinsics: *intrinsics,
        };
        let (model, consensus) = arrsac
            .model_inliers(&estimator, matches.iter().copied())
            .ok_or(PoseError::NoConsensus)?;
        trace!(
            "arrsac found {} of {} correspondences in consensus",
            consensus.len(),
            n
        );

        let inliers = self.inliers(&model.rotation, &model.translation, intrinsics, world, image);
        if inliers.len() < needed {
            return Err(PoseError::NoConsensus);
        }
        debug!(
            "arrsac pnp finished with {} inliers out of {}",
            inliers.len(),
            n
        );
        Ok(AbsolutePose {
            rotation: model.rotation,
            translation: model.translation,
            inliers,
        })
    }
}
