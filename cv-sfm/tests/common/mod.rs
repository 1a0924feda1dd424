#![allow(dead_code)]

use cv_sfm::{
    two_view::{triangulate_pair, TwoViewReconstruction},
    AbsolutePoseSolver, CameraId, CameraIntrinsics, FeatureMatch, FeatureMatcher, ImageFeatures,
    IncrementalMapper, LinearTriangulator, RatioTestMatcher, RefinedPnp, SfmSettings, Triangulator,
};
use image::{Rgb, RgbImage};
use nalgebra::{Point2, Point3, Rotation3, Vector3};
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
const DESCRIPTOR_LEN: usize = 16;

pub type Mapper = IncrementalMapper<RatioTestMatcher, RefinedPnp<SmallRng>, LinearTriangulator>;

/// Points in a box in front of a row of cameras that all look at the center of the box.
pub struct Scene {
    pub intrinsics: CameraIntrinsics,
    pub points: Vec<Point3<f64>>,
    pub colors: Vec<[u8; 3]>,
    /// World-to-camera poses.
    pub poses: Vec<(Rotation3<f64>, Vector3<f64>)>,
    /// For each camera, the point each keypoint observes.
    pub point_of: Vec<Vec<usize>>,
    pub features: Vec<ImageFeatures>,
}

impl Scene {
    pub fn new(num_points: usize, num_cameras: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let intrinsics = CameraIntrinsics::identity()
            .focal(500.0)
            .principal_point(Point2::new(f64::from(WIDTH) / 2.0, f64::from(HEIGHT) / 2.0));
        let points = (0..num_points)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(5.0..8.0),
                )
            })
            .collect::<Vec<_>>();
        let colors = (0..num_points)
            .map(|_| [rng.gen(), rng.gen(), rng.gen()])
            .collect::<Vec<[u8; 3]>>();
        let descriptors = (0..num_points)
            .map(|_| {
                (0..DESCRIPTOR_LEN)
                    .map(|_| rng.gen_range(0.0..1.0))
                    .collect()
            })
            .collect::<Vec<Vec<f32>>>();

        // Camera 0 sits at the origin with the identity pose.
        let poses = (0..num_cameras)
            .map(|ix| {
                let center = Vector3::new(ix as f64 * 0.4, 0.05 * ix as f64, 0.0);
                let angle = center.x.atan2(6.5);
                let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), angle);
                (rotation, -(rotation * center))
            })
            .collect::<Vec<_>>();

        let mut point_of = vec![];
        let mut features = vec![];
        for &(rotation, translation) in &poses {
            let mut order = (0..num_points).collect::<Vec<_>>();
            order.shuffle(&mut rng);
            let mut image = RgbImage::new(WIDTH, HEIGHT);
            let mut keypoints = vec![];
            for &point in &order {
                let keypoint = intrinsics.project(&(rotation * points[point] + translation));
                let (x, y) = (keypoint.x.round(), keypoint.y.round());
                if x >= 0.0 && y >= 0.0 && x < f64::from(WIDTH) && y < f64::from(HEIGHT) {
                    image.put_pixel(x as u32, y as u32, Rgb(colors[point]));
                }
                keypoints.push(keypoint);
            }
            features.push(ImageFeatures::new(
                keypoints,
                order.iter().map(|&point| descriptors[point].clone()).collect(),
                image,
            ));
            point_of.push(order);
        }

        Self {
            intrinsics,
            points,
            colors,
            poses,
            point_of,
            features,
        }
    }

    /// The keypoint of `camera` that observes `point`.
    pub fn keypoint_of(&self, camera: usize, point: usize) -> usize {
        self.point_of[camera]
            .iter()
            .position(|&p| p == point)
            .unwrap()
    }

    /// A mapper that knows the features of every camera of the scene.
    pub fn mapper(&self, settings: SfmSettings) -> Mapper {
        self.mapper_with(
            settings,
            RatioTestMatcher::new(settings.match_ratio),
            RefinedPnp::from_settings(&settings, SmallRng::seed_from_u64(settings.pnp_seed)),
            LinearTriangulator::new(),
        )
    }

    /// Like [`Scene::mapper`], with custom capabilities.
    pub fn mapper_with<M, P, T>(
        &self,
        settings: SfmSettings,
        matcher: M,
        pose_solver: P,
        triangulator: T,
    ) -> IncrementalMapper<M, P, T>
    where
        M: FeatureMatcher,
        P: AbsolutePoseSolver,
        T: Triangulator,
    {
        let mut mapper =
            IncrementalMapper::new(self.intrinsics, settings, matcher, pose_solver, triangulator);
        for (ix, features) in self.features.iter().enumerate() {
            mapper.add_image(CameraId(ix), features.clone());
        }
        mapper
    }

    /// Triangulates the matches between cameras 0 and 1 that observe the first `num_points`
    /// points using the true relative pose.
    pub fn seed(&self, num_points: usize) -> TwoViewReconstruction {
        self.seed_pair(0, 1, num_points)
    }

    /// Triangulates the matches between cameras `a` and `b` that observe the first
    /// `num_points` points using the true pose of `b` relative to `a`.
    pub fn seed_pair(&self, a: usize, b: usize, num_points: usize) -> TwoViewReconstruction {
        let matches = RatioTestMatcher::default()
            .match_features(&self.features[a], &self.features[b])
            .into_iter()
            .filter(|m| self.point_of[a][m.a] < num_points)
            .collect::<Vec<FeatureMatch>>();
        let (rotation, translation) = self.relative_pose(a, b);
        triangulate_pair(
            &self.features[a],
            &self.features[b],
            &matches,
            rotation,
            translation,
            &self.intrinsics,
            &LinearTriangulator::new(),
            1000.0,
        )
    }

    /// The pose of camera `b` in the frame of camera `a`.
    pub fn relative_pose(&self, a: usize, b: usize) -> (Rotation3<f64>, Vector3<f64>) {
        let (rotation_a, translation_a) = self.poses[a];
        let (rotation_b, translation_b) = self.poses[b];
        let rotation = rotation_b * rotation_a.inverse();
        (rotation, translation_b - rotation * translation_a)
    }
}
