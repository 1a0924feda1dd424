use cv_sfm::{
    two_view::{triangulate_pair, TwoViewReconstruction},
    CameraIntrinsics, FeatureMatcher, ImageFeatures, LinearTriangulator,
};
use image::{Rgb, RgbImage};
use nalgebra::{Point2, Point3, Rotation3, Vector3};
use rand::{seq::SliceRandom, Rng};

const DESCRIPTOR_LEN: usize = 32;

/// What to generate.
#[derive(Copy, Clone, Debug)]
pub struct SceneOptions {
    pub num_points: usize,
    pub num_cameras: usize,
    pub width: u32,
    pub height: u32,
    /// Keypoints are moved by up to this many pixels in each direction.
    pub pixel_noise: f64,
    /// The fraction of keypoints that are moved to a random position in the image.
    pub outlier_fraction: f64,
}

/// A cloud of points on the surface of a wavy sheet, photographed by cameras on an arc.
pub struct SyntheticScene {
    pub intrinsics: CameraIntrinsics,
    pub points: Vec<Point3<f64>>,
    /// World-to-camera poses. The first camera has the identity pose.
    pub poses: Vec<(Rotation3<f64>, Vector3<f64>)>,
    pub features: Vec<ImageFeatures>,
}

impl SyntheticScene {
    pub fn generate(options: &SceneOptions, rng: &mut impl Rng) -> Self {
        let intrinsics = CameraIntrinsics::from_image_size(options.width, options.height);
        let points = (0..options.num_points)
            .map(|_| {
                let x: f64 = rng.gen_range(-2.0..2.0);
                let y: f64 = rng.gen_range(-1.5..1.5);
                Point3::new(x, y, 8.0 + 0.5 * (2.0 * x).sin() * y.cos())
            })
            .collect::<Vec<_>>();
        let descriptors = (0..options.num_points)
            .map(|_| (0..DESCRIPTOR_LEN).map(|_| rng.gen()).collect())
            .collect::<Vec<Vec<f32>>>();

        // Orbit the center of the sheet.
        let target = Vector3::new(0.0, 0.0, 8.0);
        let poses = (0..options.num_cameras)
            .map(|ix| {
                let angle = 0.08 * ix as f64;
                let center = target - Rotation3::from_axis_angle(&Vector3::y_axis(), -angle) * target;
                let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), angle);
                (rotation, -(rotation * center))
            })
            .collect::<Vec<_>>();

        let features = poses
            .iter()
            .map(|&(rotation, translation)| {
                let mut order = (0..options.num_points).collect::<Vec<_>>();
                order.shuffle(rng);
                let mut image = RgbImage::new(options.width, options.height);
                let keypoints = order
                    .iter()
                    .map(|&ix| {
                        let point = points[ix];
                        let mut keypoint = intrinsics.project(&(rotation * point + translation));
                        if rng.gen_bool(options.outlier_fraction) {
                            keypoint = Point2::new(
                                rng.gen_range(0.0..f64::from(options.width)),
                                rng.gen_range(0.0..f64::from(options.height)),
                            );
                        } else if options.pixel_noise > 0.0 {
                            keypoint.x += rng.gen_range(-options.pixel_noise..options.pixel_noise);
                            keypoint.y += rng.gen_range(-options.pixel_noise..options.pixel_noise);
                        }
                        let (x, y) = (keypoint.x.round(), keypoint.y.round());
                        if x >= 0.0
                            && y >= 0.0
                            && x < f64::from(options.width)
                            && y < f64::from(options.height)
                        {
                            image.put_pixel(x as u32, y as u32, Rgb(height_color(&point)));
                        }
                        keypoint
                    })
                    .collect();
                ImageFeatures::new(
                    keypoints,
                    order.iter().map(|&ix| descriptors[ix].clone()).collect(),
                    image,
                )
            })
            .collect();

        Self {
            intrinsics,
            points,
            poses,
            features,
        }
    }

    /// Triangulates the matches of the first two images from their true relative pose.
    pub fn seed(&self, matcher: &impl FeatureMatcher, max_point_norm: f64) -> TwoViewReconstruction {
        let matches = matcher.match_features(&self.features[0], &self.features[1]);
        let (rotation, translation) = self.poses[1];
        triangulate_pair(
            &self.features[0],
            &self.features[1],
            &matches,
            rotation,
            translation,
            &self.intrinsics,
            &LinearTriangulator::new(),
            max_point_norm,
        )
    }
}

fn height_color(point: &Point3<f64>) -> [u8; 3] {
    let t = ((point.y + 1.5) / 3.0).max(0.0).min(1.0);
    [(255.0 * t) as u8, 96, (255.0 * (1.0 - t)) as u8]
}
