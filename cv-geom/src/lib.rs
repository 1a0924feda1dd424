//! This crate contains computational geometry algorithms for incremental structure from motion.
//!
//! ## Projection
//!
//! [`CameraIntrinsics`] maps points in the camera frame to pixels and back to normalized image
//! coordinates. Camera poses are always world-to-camera: `x_cam = R * x_world + t`.
//!
//! ## Triangulation
//!
//! In this problem we know the projection matrices of two cameras and the pixel at which the same
//! feature was observed in each of them. We want to find the point of intersection of both rays.
//!
//! - `p` the point we are trying to triangulate
//! - `a` the keypoint on camera A
//! - `b` the keypoint on camera B
//! - `O` the optical center of a camera
//! - `@` the virtual image plane
//!
//! ```text
//!                        @
//!                        @
//!               p--------b--------O
//!              /         @
//!             /          @
//!            /           @
//!           /            @
//!   @@@@@@@a@@@@@
//!         /
//!        /
//!       /
//!      O
//! ```
//!
//! ## Perspective-n-point
//!
//! Given world points and the pixels they project to in a camera of unknown pose, [`pnp`]
//! recovers the world-to-camera pose with the Lambda Twist P3P solver inside ARRSAC. Hypotheses are
//! scored by pixel reprojection error, so the inlier threshold is in pixels.

pub mod intrinsics;
pub mod pnp;
pub mod triangulation;

pub use intrinsics::*;
pub use pnp::{AbsolutePose, P3p, PixelPose, PixelWorldMatch, PoseError, RansacPnp};
pub use triangulation::{LinearTriangulator, Triangulator};

use nalgebra::{Matrix3x4, Rotation3, Vector3};

/// Builds the `[R | t]` matrix of a world-to-camera pose.
pub fn pose_matrix(rotation: &Rotation3<f64>, translation: &Vector3<f64>) -> Matrix3x4<f64> {
    let rot = rotation.matrix();
    Matrix3x4::from_columns(&[
        rot.column(0),
        rot.column(1),
        rot.column(2),
        translation.column(0),
    ])
}
