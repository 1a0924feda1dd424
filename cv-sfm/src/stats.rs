use crate::{CameraId, ImageFeatures, MapError, Reconstruction};
use average::{Estimate, Mean};
use cv_geom::CameraIntrinsics;
use nalgebra::{Point3, Vector3};
use std::collections::BTreeMap;

/// Summary statistics of a point cloud, computed per axis.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PointCloudStats {
    pub count: usize,
    pub mean: Vector3<f64>,
    /// Population standard deviation.
    pub std_dev: Vector3<f64>,
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl PointCloudStats {
    /// Returns `None` for an empty cloud.
    pub fn new(points: &[Point3<f64>]) -> Option<Self> {
        let first = points.first()?.coords;
        let count = points.len();
        let mean = points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / count as f64;
        let variance = points
            .iter()
            .map(|p| (p.coords - mean).component_mul(&(p.coords - mean)))
            .sum::<Vector3<f64>>()
            / count as f64;
        let (min, max) = points.iter().fold((first, first), |(min, max), p| {
            (min.inf(&p.coords), max.sup(&p.coords))
        });
        Some(Self {
            count,
            mean,
            std_dev: variance.map(f64::sqrt),
            min,
            max,
        })
    }

    pub fn range(&self) -> Vector3<f64> {
        self.max - self.min
    }
}

/// The mean pixel distance between each observation and the projection of its track.
///
/// Returns `0.0` for a reconstruction without observations.
pub fn mean_reprojection_error(
    reconstruction: &Reconstruction,
    features: &BTreeMap<CameraId, ImageFeatures>,
    intrinsics: &CameraIntrinsics,
) -> Result<f64, MapError> {
    let mut mean = Mean::new();
    for track in reconstruction.tracks() {
        for (&camera_id, &keypoint) in &track.observations {
            let camera = reconstruction
                .camera(camera_id)
                .ok_or(MapError::UnknownCamera(camera_id))?;
            let observed = features
                .get(&camera_id)
                .ok_or(MapError::MissingFeatures(camera_id))?
                .keypoint(camera_id, keypoint)?;
            mean.add((camera.project(intrinsics, &track.coord) - observed).norm());
        }
    }
    Ok(if mean.is_empty() { 0.0 } else { mean.mean() })
}
