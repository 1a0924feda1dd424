use crate::{FeatureMatch, ImageFeatures};
use cv_geom::{pose_matrix, CameraIntrinsics, Triangulator};
use log::*;
use nalgebra::{Point3, Rotation3, Vector3};

/// The seed of a reconstruction: the pose of camera B relative to camera A and the points
/// triangulated from their matches, in camera A's frame.
#[derive(Clone, Debug, PartialEq)]
pub struct TwoViewReconstruction {
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
    /// Each surviving match with its triangulated point.
    pub points: Vec<(FeatureMatch, Point3<f64>)>,
}

/// Triangulates the matches between two images given the relative pose `(rotation, translation)`
/// of B with respect to A.
///
/// Points that are not finite, lie farther than `max_point_norm` from camera A, or are not in
/// front of both cameras are dropped.
#[allow(clippy::too_many_arguments)]
pub fn triangulate_pair(
    a: &ImageFeatures,
    b: &ImageFeatures,
    matches: &[FeatureMatch],
    rotation: Rotation3<f64>,
    translation: Vector3<f64>,
    intrinsics: &CameraIntrinsics,
    triangulator: &impl Triangulator,
    max_point_norm: f64,
) -> TwoViewReconstruction {
    let k = intrinsics.matrix();
    let pa = k * pose_matrix(&Rotation3::identity(), &Vector3::zeros());
    let pb = k * pose_matrix(&rotation, &translation);

    let points: Vec<(FeatureMatch, Point3<f64>)> = matches
        .iter()
        .filter_map(|&m| Some((m, *a.keypoints.get(m.a)?, *b.keypoints.get(m.b)?)))
        .map(|(m, ka, kb)| (m, triangulator.triangulate(ka, kb, &pa, &pb)))
        .filter(|(_, p)| p.coords.iter().all(|n| n.is_finite()))
        .filter(|(_, p)| p.coords.norm() < max_point_norm)
        .filter(|(_, p)| p.z > 0.0 && (rotation * p + translation).z > 0.0)
        .collect();
    debug!(
        "triangulated {} of {} two-view matches",
        points.len(),
        matches.len()
    );

    TwoViewReconstruction {
        rotation,
        translation,
        points,
    }
}
