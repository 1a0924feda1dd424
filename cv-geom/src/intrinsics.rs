use nalgebra::{Matrix3, Point2, Point3, Vector2};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// This contains intrinsic camera parameters as per
/// [this Wikipedia page](https://en.wikipedia.org/wiki/Camera_resectioning#Intrinsic_parameters).
///
/// The same intrinsics are shared by every image of a reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    pub focals: Vector2<f64>,
    pub principal_point: Point2<f64>,
    pub skew: f64,
}

impl CameraIntrinsics {
    /// Creates camera intrinsics that would create an identity intrinsic matrix.
    pub fn identity() -> Self {
        Self {
            focals: Vector2::new(1.0, 1.0),
            skew: 0.0,
            principal_point: Point2::new(0.0, 0.0),
        }
    }

    /// Guesses the calibration of an image with unknown intrinsics.
    ///
    /// The focal length is the larger image dimension and the principal point is the image center.
    ///
    /// ```
    /// use cv_geom::CameraIntrinsics;
    /// let intrinsics = CameraIntrinsics::from_image_size(640, 480);
    /// assert_eq!(intrinsics.focals.x, 640.0);
    /// assert_eq!(intrinsics.principal_point.y, 240.0);
    /// ```
    pub fn from_image_size(width: u32, height: u32) -> Self {
        let focal = f64::from(width.max(height));
        Self::identity()
            .focal(focal)
            .principal_point(Point2::new(f64::from(width) / 2.0, f64::from(height) / 2.0))
    }

    #[must_use]
    pub fn focals(self, focals: Vector2<f64>) -> Self {
        Self { focals, ..self }
    }

    #[must_use]
    pub fn focal(self, focal: f64) -> Self {
        Self {
            focals: Vector2::new(focal, focal),
            ..self
        }
    }

    #[must_use]
    pub fn principal_point(self, principal_point: Point2<f64>) -> Self {
        Self {
            principal_point,
            ..self
        }
    }

    #[must_use]
    pub fn skew(self, skew: f64) -> Self {
        Self { skew, ..self }
    }

    #[rustfmt::skip]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focals.x,  self.skew,      self.principal_point.x,
            0.0,            self.focals.y,  self.principal_point.y,
            0.0,            0.0,            1.0,
        )
    }

    /// Projects a point in the camera frame to pixel coordinates.
    ///
    /// Points on the `z = 0` plane project to non-finite pixels.
    pub fn project(&self, point: &Point3<f64>) -> Point2<f64> {
        let x = point.x / point.z;
        let y = point.y / point.z;
        self.uncalibrate(Point2::new(x, y))
    }

    /// Takes in a point from an image in pixel coordinates and
    /// converts it to normalized image coordinates.
    ///
    /// ```
    /// use cv_geom::CameraIntrinsics;
    /// use nalgebra::{Point2, Vector2};
    /// let intrinsics = CameraIntrinsics {
    ///     focals: Vector2::new(800.0, 900.0),
    ///     principal_point: Point2::new(500.0, 600.0),
    ///     skew: 1.7,
    /// };
    /// let kp = Point2::new(471.0, 322.0);
    /// let nkp = intrinsics.calibrate(kp);
    /// let distance = (kp.to_homogeneous() - intrinsics.matrix() * nkp.to_homogeneous()).norm();
    /// assert!(distance < 1e-9);
    /// ```
    pub fn calibrate(&self, pixel: Point2<f64>) -> Point2<f64> {
        let centered = pixel - self.principal_point;
        let y = centered.y / self.focals.y;
        let x = (centered.x - self.skew * y) / self.focals.x;
        Point2::new(x, y)
    }

    /// Converts normalized image coordinates back into pixel coordinates.
    pub fn uncalibrate(&self, normalized: Point2<f64>) -> Point2<f64> {
        let y = normalized.y * self.focals.y;
        let x = normalized.x * self.focals.x + self.skew * normalized.y;
        Point2::new(x, y) + self.principal_point.coords
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn project_matches_matrix_product() {
        let intrinsics = CameraIntrinsics::from_image_size(1280, 720).skew(0.5);
        let point = Point3::new(0.3, -0.2, 4.0);
        let homogeneous = intrinsics.matrix() * point.coords;
        let expected = Point2::new(
            homogeneous.x / homogeneous.z,
            homogeneous.y / homogeneous.z,
        );
        assert_relative_eq!(intrinsics.project(&point), expected, epsilon = 1e-9);
    }

    #[test]
    fn calibrate_inverts_uncalibrate() {
        let intrinsics = CameraIntrinsics::from_image_size(640, 480).skew(1.2);
        let pixel = Point2::new(12.5, 401.0);
        let back = intrinsics.uncalibrate(intrinsics.calibrate(pixel));
        assert_relative_eq!(back, pixel, epsilon = 1e-9);
    }
}
