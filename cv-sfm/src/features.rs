use crate::{CameraId, MapError};
use float_ord::FloatOrd;
use hgg::HggLite as Hgg;
use image::RgbImage;
use nalgebra::Point2;
use space::{Knn, KnnInsert, Metric};

/// The detected features of one image along with its pixels for color sampling.
#[derive(Clone, Debug)]
pub struct ImageFeatures {
    /// Keypoint positions in pixels.
    pub keypoints: Vec<Point2<f64>>,
    /// One descriptor per keypoint.
    pub descriptors: Vec<Vec<f32>>,
    pub image: RgbImage,
}

impl ImageFeatures {
    pub fn new(keypoints: Vec<Point2<f64>>, descriptors: Vec<Vec<f32>>, image: RgbImage) -> Self {
        Self {
            keypoints,
            descriptors,
            image,
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// The pixel position of keypoint `ix` of the image of `camera`.
    pub fn keypoint(&self, camera: CameraId, ix: usize) -> Result<Point2<f64>, MapError> {
        self.keypoints
            .get(ix)
            .copied()
            .ok_or(MapError::KeypointOutOfRange {
                camera,
                keypoint: ix,
                count: self.keypoints.len(),
            })
    }

    /// The color of the pixel nearest to `position`, clamped to the image bounds.
    pub fn sample_color(&self, position: Point2<f64>) -> [u8; 3] {
        let (width, height) = self.image.dimensions();
        if width == 0 || height == 0 {
            return [0; 3];
        }
        let clamp = |n: f64, len: u32| n.round().max(0.0).min(f64::from(len - 1)) as u32;
        self.image
            .get_pixel(clamp(position.x, width), clamp(position.y, height))
            .0
    }
}

/// The rounded average of two colors. Swapping the arguments gives the same color.
pub fn average_color(a: [u8; 3], b: [u8; 3]) -> [u8; 3] {
    let mut color = [0; 3];
    for ((c, &a), &b) in color.iter_mut().zip(&a).zip(&b) {
        *c = ((u16::from(a) + u16::from(b) + 1) / 2) as u8;
    }
    color
}

/// A correspondence between keypoint `a` of one image and keypoint `b` of another.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureMatch {
    pub a: usize,
    pub b: usize,
}

/// Finds keypoint correspondences between two images.
pub trait FeatureMatcher {
    fn match_features(&self, a: &ImageFeatures, b: &ImageFeatures) -> Vec<FeatureMatch>;
}

impl<M> FeatureMatcher for &M
where
    M: FeatureMatcher + ?Sized,
{
    fn match_features(&self, a: &ImageFeatures, b: &ImageFeatures) -> Vec<FeatureMatch> {
        (**self).match_features(a, b)
    }
}

/// Brute force nearest neighbor matching filtered by Lowe's ratio test.
///
/// A keypoint of `a` is matched to its nearest neighbor in `b` when that neighbor is closer than
/// `ratio` times the distance to the second nearest neighbor.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RatioTestMatcher {
    pub ratio: f32,
}

impl RatioTestMatcher {
    pub fn new(ratio: f32) -> Self {
        Self { ratio }
    }
}

impl Default for RatioTestMatcher {
    fn default() -> Self {
        Self::new(0.75)
    }
}

fn distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>()
        .sqrt()
}

impl FeatureMatcher for RatioTestMatcher {
    fn match_features(&self, a: &ImageFeatures, b: &ImageFeatures) -> Vec<FeatureMatch> {
        if b.descriptors.len() < 2 {
            return vec![];
        }
        a.descriptors
            .iter()
            .enumerate()
            .filter_map(|(ia, da)| {
                let mut best = (usize::MAX, FloatOrd(f32::INFINITY));
                let mut second = FloatOrd(f32::INFINITY);
                for (ib, db) in b.descriptors.iter().enumerate() {
                    let d = FloatOrd(distance(da, db));
                    if d < best.1 {
                        second = best.1;
                        best = (ib, d);
                    } else if d < second {
                        second = d;
                    }
                }
                (best.1 .0 < self.ratio * second.0).then(|| FeatureMatch { a: ia, b: best.0 })
            })
            .collect()
    }
}

/// Euclidean descriptor distance, as the bit pattern of the non-negative `f32` distance.
#[derive(Copy, Clone, Debug, Default)]
pub struct DescriptorDistance;

impl Metric<Vec<f32>> for DescriptorDistance {
    type Unit = u32;

    fn distance(&self, a: &Vec<f32>, b: &Vec<f32>) -> u32 {
        distance(a, b).to_bits()
    }
}

/// Approximate nearest neighbor matching filtered by Lowe's ratio test.
///
/// The descriptors of `b` are inserted into an HGG graph and each descriptor of `a` searches it
/// for its two nearest neighbors. Use this over [`RatioTestMatcher`] for images with thousands
/// of keypoints.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct HggMatcher {
    pub ratio: f32,
    /// Neighbors to search for when inserting a descriptor.
    pub insert_knn: usize,
}

impl HggMatcher {
    pub fn new(ratio: f32) -> Self {
        Self {
            ratio,
            insert_knn: 32,
        }
    }

    pub fn insert_knn(self, insert_knn: usize) -> Self {
        Self { insert_knn, ..self }
    }
}

impl Default for HggMatcher {
    fn default() -> Self {
        Self::new(0.75)
    }
}

impl FeatureMatcher for HggMatcher {
    fn match_features(&self, a: &ImageFeatures, b: &ImageFeatures) -> Vec<FeatureMatch> {
        if b.descriptors.len() < 2 {
            return vec![];
        }
        let mut index = Hgg::new(DescriptorDistance).insert_knn(self.insert_knn);
        for (ib, db) in b.descriptors.iter().enumerate() {
            index.insert(db.clone(), ib);
        }
        a.descriptors
            .iter()
            .enumerate()
            .filter_map(|(ia, da)| {
                let knn = index.knn(da, 2);
                let (best, second) = (knn.get(0)?, knn.get(1)?);
                if f32::from_bits(best.distance) < self.ratio * f32::from_bits(second.distance) {
                    let ib = *index.get_value(best.index)?;
                    Some(FeatureMatch { a: ia, b: ib })
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn features(descriptors: Vec<Vec<f32>>) -> ImageFeatures {
        let keypoints = vec![Point2::origin(); descriptors.len()];
        ImageFeatures::new(keypoints, descriptors, RgbImage::new(4, 4))
    }

    #[test]
    fn ratio_test_rejects_ambiguous_matches() {
        let a = features(vec![vec![0.0, 0.0], vec![5.0, 5.0]]);
        let b = features(vec![vec![0.1, 0.0], vec![5.0, 4.0], vec![5.0, 6.0]]);
        let matches = RatioTestMatcher::default().match_features(&a, &b);
        // The second descriptor is equally close to two candidates.
        assert_eq!(matches, vec![FeatureMatch { a: 0, b: 0 }]);
    }

    #[test]
    fn too_few_candidates_match_nothing() {
        let a = features(vec![vec![0.0]]);
        let b = features(vec![vec![0.0]]);
        assert!(RatioTestMatcher::default().match_features(&a, &b).is_empty());
    }

    #[test]
    fn colors_are_sampled_at_the_clamped_nearest_pixel() {
        let mut image = RgbImage::new(4, 3);
        image.put_pixel(3, 0, Rgb([10, 20, 30]));
        image.put_pixel(1, 2, Rgb([1, 2, 3]));
        let features = ImageFeatures::new(vec![], vec![], image);
        assert_eq!(features.sample_color(Point2::new(9.0, -4.0)), [10, 20, 30]);
        assert_eq!(features.sample_color(Point2::new(0.6, 1.7)), [1, 2, 3]);
    }

    #[test]
    fn average_color_is_symmetric() {
        assert_eq!(average_color([0, 255, 7], [255, 0, 8]), [128, 128, 8]);
        assert_eq!(average_color([255, 0, 8], [0, 255, 7]), [128, 128, 8]);
    }

    #[test]
    fn hgg_matcher_agrees_with_brute_force() {
        let mut rng = SmallRng::seed_from_u64(0);
        let a = (0..200)
            .map(|_| (0..16).map(|_| rng.gen_range(0.0..1.0)).collect::<Vec<f32>>())
            .collect::<Vec<_>>();
        // `b` holds a slightly perturbed copy of every descriptor of `a` in reverse order.
        let b = a
            .iter()
            .rev()
            .map(|d| d.iter().map(|n| n + rng.gen_range(-0.01..0.01)).collect())
            .collect::<Vec<Vec<f32>>>();
        let (a, b) = (features(a), features(b));

        let brute_force = RatioTestMatcher::default().match_features(&a, &b);
        assert_eq!(brute_force.len(), 200);
        assert!(brute_force.iter().all(|m| m.a + m.b == 199));
        assert_eq!(HggMatcher::default().match_features(&a, &b), brute_force);
    }

    #[test]
    fn hgg_matcher_needs_two_candidates() {
        let a = features(vec![vec![0.0]]);
        let b = features(vec![vec![0.0]]);
        assert!(HggMatcher::default().match_features(&a, &b).is_empty());
    }
}
