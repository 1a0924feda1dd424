#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The settings for incremental reconstruction and bundle adjustment.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SfmSettings {
    /// The minimum number of 3d-2d correspondences, and of pose inliers, to register a view
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_min_pnp_points"))]
    pub min_pnp_points: usize,
    /// The reprojection error in pixels under which a correspondence is a pose inlier
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_pnp_reprojection_threshold")
    )]
    pub pnp_reprojection_threshold: f64,
    /// The probability with which sample consensus should draw an outlier-free sample
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_pnp_confidence"))]
    pub pnp_confidence: f64,
    /// The maximum number of sample consensus iterations for pose estimation
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_pnp_max_iterations")
    )]
    pub pnp_max_iterations: usize,
    /// The seed of the random number generator used by sample consensus
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_pnp_seed"))]
    pub pnp_seed: u64,
    /// The minimum number of matches between two views before new points are triangulated
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_min_triangulation_matches")
    )]
    pub min_triangulation_matches: usize,
    /// Triangulated points farther than this from the world origin are discarded
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_max_point_norm"))]
    pub max_point_norm: f64,
    /// The ratio for Lowe's ratio test when matching descriptors
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_match_ratio"))]
    pub match_ratio: f32,
    /// The maximum number of residual evaluations in bundle adjustment
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_ba_max_evaluations")
    )]
    pub ba_max_evaluations: usize,
    /// The convergence tolerance of bundle adjustment
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_ba_tolerance"))]
    pub ba_tolerance: f64,
    /// The looser convergence tolerance of quick bundle adjustment
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_ba_quick_tolerance")
    )]
    pub ba_quick_tolerance: f64,
    /// The seed used when bundle adjustment downsamples observations
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_ba_seed"))]
    pub ba_seed: u64,
}

impl Default for SfmSettings {
    fn default() -> Self {
        Self {
            min_pnp_points: default_min_pnp_points(),
            pnp_reprojection_threshold: default_pnp_reprojection_threshold(),
            pnp_confidence: default_pnp_confidence(),
            pnp_max_iterations: default_pnp_max_iterations(),
            pnp_seed: default_pnp_seed(),
            min_triangulation_matches: default_min_triangulation_matches(),
            max_point_norm: default_max_point_norm(),
            match_ratio: default_match_ratio(),
            ba_max_evaluations: default_ba_max_evaluations(),
            ba_tolerance: default_ba_tolerance(),
            ba_quick_tolerance: default_ba_quick_tolerance(),
            ba_seed: default_ba_seed(),
        }
    }
}

fn default_min_pnp_points() -> usize {
    40
}

fn default_pnp_reprojection_threshold() -> f64 {
    3.0
}

fn default_pnp_confidence() -> f64 {
    0.999
}

fn default_pnp_max_iterations() -> usize {
    200
}

fn default_pnp_seed() -> u64 {
    0
}

fn default_min_triangulation_matches() -> usize {
    50
}

fn default_max_point_norm() -> f64 {
    1000.0
}

fn default_match_ratio() -> f32 {
    0.75
}

fn default_ba_max_evaluations() -> usize {
    50
}

fn default_ba_tolerance() -> f64 {
    1e-4
}

fn default_ba_quick_tolerance() -> f64 {
    1e-2
}

fn default_ba_seed() -> u64 {
    0
}
