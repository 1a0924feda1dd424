//! Incremental structure from motion.
//!
//! A reconstruction is seeded from two views with a known relative pose
//! ([`IncrementalMapper::initialize_from_pair`]), grown one image at a time by solving the pose of
//! each new image against the existing tracks ([`IncrementalMapper::register_new_view`]), and
//! periodically refined by bundle adjustment ([`IncrementalMapper::bundle_adjust`]).

mod bundle_adjust;
mod error;
mod export;
mod features;
mod pose;
mod reconstruction;
mod settings;
pub mod stats;
pub mod two_view;

pub use bundle_adjust::*;
pub use error::*;
pub use export::*;
pub use features::*;
pub use pose::*;
pub use reconstruction::*;
pub use settings::*;

pub use cv_geom::{
    AbsolutePose, CameraIntrinsics, LinearTriangulator, PoseError, RansacPnp, Triangulator,
};

use itertools::Itertools;
use log::*;
use maplit::btreemap;
use nalgebra::{Point2, Point3};
use std::collections::{BTreeMap, HashSet};
use two_view::TwoViewReconstruction;

/// A map point seen from a new image.
#[derive(Copy, Clone, Debug)]
struct MapCorrespondence {
    track: TrackId,
    /// The keypoint of the new image.
    keypoint: usize,
    world: Point3<f64>,
    pixel: Point2<f64>,
}

/// A track to create once the new camera is added.
#[derive(Copy, Clone, Debug)]
struct PendingTrack {
    reference: CameraId,
    matched: FeatureMatch,
    coord: Point3<f64>,
    color: [u8; 3],
}

/// The result of a successful [`IncrementalMapper::register_new_view`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub camera: CameraId,
    /// The number of 3d-2d correspondences the pose was solved from.
    pub correspondences: usize,
    /// The number of those correspondences consistent with the solved pose.
    pub inliers: usize,
    /// Existing tracks that gained an observation in the new camera.
    pub extended_tracks: usize,
    /// Tracks triangulated between the new camera and earlier cameras.
    pub new_tracks: usize,
}

/// Grows a [`Reconstruction`] one image at a time.
pub struct IncrementalMapper<M, P, T> {
    /// The settings for the mapping process.
    pub settings: SfmSettings,
    intrinsics: CameraIntrinsics,
    reconstruction: Reconstruction,
    /// The features of every image known to the mapper, whether registered or not.
    images: BTreeMap<CameraId, ImageFeatures>,
    matcher: M,
    pose_solver: P,
    triangulator: T,
}

impl<M, P, T> IncrementalMapper<M, P, T>
where
    M: FeatureMatcher,
    P: AbsolutePoseSolver,
    T: Triangulator,
{
    pub fn new(
        intrinsics: CameraIntrinsics,
        settings: SfmSettings,
        matcher: M,
        pose_solver: P,
        triangulator: T,
    ) -> Self {
        Self {
            settings,
            intrinsics,
            reconstruction: Reconstruction::new(),
            images: BTreeMap::new(),
            matcher,
            pose_solver,
            triangulator,
        }
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn reconstruction(&self) -> &Reconstruction {
        &self.reconstruction
    }

    pub fn into_reconstruction(self) -> Reconstruction {
        self.reconstruction
    }

    pub fn images(&self) -> &BTreeMap<CameraId, ImageFeatures> {
        &self.images
    }

    pub fn image(&self, id: CameraId) -> Option<&ImageFeatures> {
        self.images.get(&id)
    }

    /// Caches the features of an image so it can be initialized from or registered.
    ///
    /// Replacing the features of a registered camera invalidates its observations.
    pub fn add_image(&mut self, id: CameraId, features: ImageFeatures) {
        if self.reconstruction.contains_camera(id) {
            warn!("replacing the features of registered camera {:?}", id);
        }
        self.images.insert(id, features);
    }

    fn features(&self, id: CameraId) -> Result<&ImageFeatures, MapError> {
        self.images.get(&id).ok_or(MapError::MissingFeatures(id))
    }

    /// Seeds the reconstruction from two views.
    ///
    /// Camera `a` is placed at the identity pose, which defines the world frame, and camera `b`
    /// at the relative pose in `seed`. Every match in `seed` becomes a track observed by both
    /// cameras whose color is the average of the two source pixels. A match reusing a keypoint
    /// of an earlier match is skipped. Returns the number of tracks created.
    pub fn initialize_from_pair(
        &mut self,
        a: CameraId,
        b: CameraId,
        seed: &TwoViewReconstruction,
    ) -> Result<usize, Error> {
        if a == b || self.reconstruction.contains_camera(a) {
            return Err(MapError::DuplicateCamera(a).into());
        }
        if self.reconstruction.contains_camera(b) {
            return Err(MapError::DuplicateCamera(b).into());
        }
        let features_a = self.features(a)?;
        let features_b = self.features(b)?;

        // Resolve everything before the first mutation.
        let mut used_a = HashSet::new();
        let mut used_b = HashSet::new();
        let mut tracks = vec![];
        for &(m, coord) in &seed.points {
            let pixel_a = features_a.keypoint(a, m.a)?;
            let pixel_b = features_b.keypoint(b, m.b)?;
            if !used_a.insert(m.a) || !used_b.insert(m.b) {
                warn!(
                    "skipping seed match {:?} because one of its keypoints is already used",
                    m
                );
                continue;
            }
            let color = average_color(
                features_a.sample_color(pixel_a),
                features_b.sample_color(pixel_b),
            );
            tracks.push((coord, color, btreemap! { a => m.a, b => m.b }));
        }

        self.reconstruction
            .add_camera(a, nalgebra::Rotation3::identity(), nalgebra::Vector3::zeros())?;
        self.reconstruction
            .add_camera(b, seed.rotation, seed.translation)?;
        let created = tracks.len();
        for (coord, color, observations) in tracks {
            self.reconstruction.create_track(coord, color, observations)?;
        }
        info!(
            "initialized reconstruction from cameras {:?} and {:?} with {} tracks",
            a, b, created
        );
        Ok(created)
    }

    /// Finds every existing track that the new image observes by matching it against every
    /// registered camera.
    fn collect_correspondences(&self, id: CameraId) -> Result<Vec<MapCorrespondence>, Error> {
        let new_features = self.features(id)?;
        let mut correspondences = vec![];
        for reference in self.reconstruction.camera_ids() {
            let reference_features = self.features(reference)?;
            let matches = self
                .matcher
                .match_features(reference_features, new_features);
            let before = correspondences.len();
            for m in matches {
                let track = match self.reconstruction.track_for(reference, m.a) {
                    Some(track) => track,
                    None => continue,
                };
                let world = self
                    .reconstruction
                    .track(track)
                    .ok_or(MapError::UnknownTrack(track))?
                    .coord;
                correspondences.push(MapCorrespondence {
                    track,
                    keypoint: m.b,
                    world,
                    pixel: new_features.keypoint(id, m.b)?,
                });
            }
            trace!(
                "camera {:?} contributed {} map correspondences to {:?}",
                reference,
                correspondences.len() - before,
                id
            );
        }
        Ok(correspondences)
    }

    /// Registers an image by solving its pose against the existing tracks, then triangulates new
    /// tracks between it and the earlier cameras.
    ///
    /// Registration failures are returned as [`Error::Registration`] and leave the
    /// reconstruction unchanged.
    pub fn register_new_view(&mut self, id: CameraId) -> Result<Registration, Error> {
        if self.reconstruction.contains_camera(id) {
            return Err(RegistrationError::AlreadyRegistered(id).into());
        }
        if !self.images.contains_key(&id) {
            return Err(RegistrationError::UnknownImage(id).into());
        }

        let correspondences = self.collect_correspondences(id)?;
        let needed = self.settings.min_pnp_points;
        if correspondences.len() < needed {
            info!(
                "only found {} correspondences with the map for {:?}, need {}; registration aborted",
                correspondences.len(),
                id,
                needed
            );
            return Err(RegistrationError::InsufficientCorrespondences {
                found: correspondences.len(),
                needed,
            }
            .into());
        }

        let world = correspondences.iter().map(|c| c.world).collect_vec();
        let image = correspondences.iter().map(|c| c.pixel).collect_vec();
        let pose = self
            .pose_solver
            .solve_pose(&world, &image, &self.intrinsics)
            .map_err(RegistrationError::from)?;
        if pose.inliers.len() < needed {
            info!(
                "only found {} pose inliers for {:?}, need {}; registration aborted",
                pose.inliers.len(),
                id,
                needed
            );
            return Err(RegistrationError::InsufficientInliers {
                found: pose.inliers.len(),
                needed,
            }
            .into());
        }

        // A keypoint observes one track and a track is observed once per camera, so the first
        // inlier wins whenever the matches against different cameras disagree.
        let mut used_keypoints = HashSet::new();
        let mut used_tracks = HashSet::new();
        let mut extensions = vec![];
        for &ix in &pose.inliers {
            let c = correspondences.get(ix).copied().ok_or(
                RegistrationError::InlierOutOfRange {
                    index: ix,
                    count: correspondences.len(),
                },
            )?;
            if used_keypoints.contains(&c.keypoint) || used_tracks.contains(&c.track) {
                continue;
            }
            used_keypoints.insert(c.keypoint);
            used_tracks.insert(c.track);
            extensions.push(c);
        }
        if extensions.len() < pose.inliers.len() {
            debug!(
                "dropped {} conflicting inliers while registering {:?}",
                pose.inliers.len() - extensions.len(),
                id
            );
        }

        let camera = Camera {
            id,
            rotation: pose.rotation,
            translation: pose.translation,
        };
        let pending = self.triangulate_new_points(&camera, &used_keypoints)?;

        // Everything the matcher and the pose solver returned has been checked by now.
        self.reconstruction
            .add_camera(id, camera.rotation, camera.translation)?;
        for c in &extensions {
            self.reconstruction.add_observation(c.track, id, c.keypoint)?;
        }
        let new_tracks = self.create_tracks(id, pending)?;

        let registration = Registration {
            camera: id,
            correspondences: correspondences.len(),
            inliers: pose.inliers.len(),
            extended_tracks: extensions.len(),
            new_tracks,
        };
        info!(
            "registered {:?} with {} inliers of {} correspondences, extended {} tracks and created {}",
            id,
            registration.inliers,
            registration.correspondences,
            registration.extended_tracks,
            registration.new_tracks
        );
        Ok(registration)
    }

    /// Triangulates matches between a new camera and each registered camera with a lower id,
    /// skipping keypoints that are already part of a track or listed in `tracked` (keypoints of
    /// the new image that are about to extend a track).
    ///
    /// Nothing is mutated, so a bad keypoint index from the matcher fails before the camera is
    /// added.
    fn triangulate_new_points(
        &self,
        camera: &Camera,
        tracked: &HashSet<usize>,
    ) -> Result<Vec<PendingTrack>, Error> {
        let id = camera.id;
        let new_features = self.features(id)?;
        let new_projection = camera.projection_matrix(&self.intrinsics);

        let mut pending = vec![];
        for reference_camera in self.reconstruction.cameras().filter(|c| c.id < id) {
            let reference = reference_camera.id;
            let reference_features = self.features(reference)?;
            let matches = self
                .matcher
                .match_features(reference_features, new_features);
            if matches.len() < self.settings.min_triangulation_matches {
                debug!(
                    "only {} matches between {:?} and {:?}, need {} to triangulate",
                    matches.len(),
                    reference,
                    id,
                    self.settings.min_triangulation_matches
                );
                continue;
            }

            let reference_projection = reference_camera.projection_matrix(&self.intrinsics);
            let before = pending.len();
            for m in matches {
                if self.reconstruction.track_for(reference, m.a).is_some() || tracked.contains(&m.b)
                {
                    continue;
                }
                let pixel_reference = reference_features.keypoint(reference, m.a)?;
                let pixel_new = new_features.keypoint(id, m.b)?;
                let coord = self.triangulator.triangulate(
                    pixel_reference,
                    pixel_new,
                    &reference_projection,
                    &new_projection,
                );
                if !coord.coords.iter().all(|n| n.is_finite())
                    || coord.coords.norm() >= self.settings.max_point_norm
                    || camera.transform(&coord).z <= 0.0
                {
                    continue;
                }
                let color = average_color(
                    reference_features.sample_color(pixel_reference),
                    new_features.sample_color(pixel_new),
                );
                pending.push(PendingTrack {
                    reference,
                    matched: m,
                    coord,
                    color,
                });
            }
            debug!(
                "triangulated {} candidate tracks between {:?} and {:?}",
                pending.len() - before,
                reference,
                id
            );
        }
        Ok(pending)
    }

    /// Creates the pending tracks of camera `id`. Returns the number of tracks created.
    fn create_tracks(&mut self, id: CameraId, pending: Vec<PendingTrack>) -> Result<usize, Error> {
        let mut created = 0;
        for track in pending {
            // Matches against one or several earlier cameras may share a keypoint.
            if self
                .reconstruction
                .track_for(track.reference, track.matched.a)
                .is_some()
                || self.reconstruction.track_for(id, track.matched.b).is_some()
            {
                continue;
            }
            self.reconstruction.create_track(
                track.coord,
                track.color,
                btreemap! { track.reference => track.matched.a, id => track.matched.b },
            )?;
            created += 1;
        }
        Ok(created)
    }

    /// Track coordinates and colors in ascending track id order.
    pub fn export_points(&self) -> (Vec<Point3<f64>>, Vec<[u8; 3]>) {
        self.reconstruction.export_points()
    }

    pub fn build_observation_table(&self) -> Result<ObservationTable, Error> {
        Ok(self.reconstruction.build_observation_table(&self.images)?)
    }

    /// Bundle adjusts the reconstruction in place.
    pub fn bundle_adjust(
        &mut self,
        options: &BundleAdjustOptions,
    ) -> Result<BundleAdjustReport, Error> {
        Ok(bundle_adjust(
            &mut self.reconstruction,
            &self.images,
            &self.intrinsics,
            options,
        )?)
    }

    /// The mean reprojection error of every observation, in pixels.
    pub fn mean_reprojection_error(&self) -> Result<f64, Error> {
        Ok(stats::mean_reprojection_error(
            &self.reconstruction,
            &self.images,
            &self.intrinsics,
        )?)
    }
}
