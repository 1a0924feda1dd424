use crate::{ImageFeatures, MapError};
use cv_geom::{pose_matrix, CameraIntrinsics};
use nalgebra::{Matrix3x4, Point2, Point3, Rotation3, Vector3};
use std::collections::{BTreeMap, HashMap};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Identifies an image, and the camera it becomes once registered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraId(pub usize);

/// Identifies a track. Ids are allocated in increasing order and never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct TrackId(pub usize);

/// A registered camera with its world-to-camera pose.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Camera {
    pub id: CameraId,
    pub rotation: Rotation3<f64>,
    pub translation: Vector3<f64>,
}

impl Camera {
    /// Transforms a world point into this camera's frame.
    pub fn transform(&self, point: &Point3<f64>) -> Point3<f64> {
        self.rotation * point + self.translation
    }

    /// The matrix mapping homogeneous world points to homogeneous pixels.
    pub fn projection_matrix(&self, intrinsics: &CameraIntrinsics) -> Matrix3x4<f64> {
        intrinsics.matrix() * pose_matrix(&self.rotation, &self.translation)
    }

    /// The camera center in world coordinates.
    pub fn optical_center(&self) -> Point3<f64> {
        Point3::from(-(self.rotation.inverse() * self.translation))
    }

    pub fn project(&self, intrinsics: &CameraIntrinsics, point: &Point3<f64>) -> Point2<f64> {
        intrinsics.project(&self.transform(point))
    }
}

/// A 3d point in space that has been observed by two or more cameras.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Track {
    pub id: TrackId,
    pub coord: Point3<f64>,
    pub color: [u8; 3],
    /// Maps each observing camera to the index of the observing keypoint in its image.
    pub observations: BTreeMap<CameraId, usize>,
}

/// One observation of a track, with indices into [`ObservationTable::camera_ids`] and
/// [`ObservationTable::track_ids`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Observation {
    pub camera: usize,
    pub track: usize,
    pub pixel: Point2<f64>,
}

/// The observations of a reconstruction flattened for bundle adjustment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservationTable {
    /// Registered cameras in ascending order. Position is the dense camera index.
    pub camera_ids: Vec<CameraId>,
    /// Tracks in ascending order. Position is the dense track index.
    pub track_ids: Vec<TrackId>,
    /// One row per observation, ordered by track and then by camera.
    pub rows: Vec<Observation>,
}

/// The cameras and tracks that exist in the same world space, and the keypoint to track lookup.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Reconstruction {
    cameras: BTreeMap<CameraId, Camera>,
    /// Indexed by `TrackId`, so the next id is the length.
    tracks: Vec<Track>,
    lookup: HashMap<(CameraId, usize), TrackId>,
}

impl Reconstruction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn num_observations(&self) -> usize {
        self.tracks.iter().map(|t| t.observations.len()).sum()
    }

    pub fn camera(&self, id: CameraId) -> Option<&Camera> {
        self.cameras.get(&id)
    }

    pub fn contains_camera(&self, id: CameraId) -> bool {
        self.cameras.contains_key(&id)
    }

    /// Registered cameras in ascending id order.
    pub fn cameras(&self) -> impl Iterator<Item = &Camera> + Clone + '_ {
        self.cameras.values()
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.cameras.keys().copied()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(id.0)
    }

    /// Tracks in ascending id order.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> + Clone + '_ {
        self.tracks.iter()
    }

    /// The track observed by a keypoint, if any.
    pub fn track_for(&self, camera: CameraId, keypoint: usize) -> Option<TrackId> {
        self.lookup.get(&(camera, keypoint)).copied()
    }

    /// The id the next created track will receive.
    pub fn next_track_id(&self) -> TrackId {
        TrackId(self.tracks.len())
    }

    /// Registers a camera.
    pub fn add_camera(
        &mut self,
        id: CameraId,
        rotation: Rotation3<f64>,
        translation: Vector3<f64>,
    ) -> Result<(), MapError> {
        if self.cameras.contains_key(&id) {
            return Err(MapError::DuplicateCamera(id));
        }
        self.cameras.insert(
            id,
            Camera {
                id,
                rotation,
                translation,
            },
        );
        Ok(())
    }

    /// Replaces the pose of a registered camera.
    pub fn set_camera_pose(
        &mut self,
        id: CameraId,
        rotation: Rotation3<f64>,
        translation: Vector3<f64>,
    ) -> Result<(), MapError> {
        let camera = self
            .cameras
            .get_mut(&id)
            .ok_or(MapError::UnknownCamera(id))?;
        camera.rotation = rotation;
        camera.translation = translation;
        Ok(())
    }

    pub fn set_track_coord(&mut self, id: TrackId, coord: Point3<f64>) -> Result<(), MapError> {
        let track = self
            .tracks
            .get_mut(id.0)
            .ok_or(MapError::UnknownTrack(id))?;
        track.coord = coord;
        Ok(())
    }

    /// Checks that `(camera, keypoint)` can be attached to a track without breaking the lookup.
    fn check_free(
        &self,
        camera: CameraId,
        keypoint: usize,
        requested: Option<TrackId>,
    ) -> Result<(), MapError> {
        if !self.cameras.contains_key(&camera) {
            return Err(MapError::UnknownCamera(camera));
        }
        match self.lookup.get(&(camera, keypoint)) {
            Some(&existing) if Some(existing) != requested => Err(MapError::ObservationConflict {
                camera,
                keypoint,
                existing,
                requested,
            }),
            _ => Ok(()),
        }
    }

    /// Creates a track from at least two observations and returns its id.
    ///
    /// Nothing is modified if any observation is invalid.
    pub fn create_track(
        &mut self,
        coord: Point3<f64>,
        color: [u8; 3],
        observations: BTreeMap<CameraId, usize>,
    ) -> Result<TrackId, MapError> {
        if observations.len() < 2 {
            return Err(MapError::TooFewObservations(observations.len()));
        }
        for (&camera, &keypoint) in &observations {
            self.check_free(camera, keypoint, None)?;
        }

        let id = self.next_track_id();
        for (&camera, &keypoint) in &observations {
            self.lookup.insert((camera, keypoint), id);
        }
        self.tracks.push(Track {
            id,
            coord,
            color,
            observations,
        });
        Ok(id)
    }

    /// Adds an observation of an existing track.
    ///
    /// Re-adding an observation the track already has is a no-op. A camera may only observe a
    /// track through one keypoint.
    pub fn add_observation(
        &mut self,
        track: TrackId,
        camera: CameraId,
        keypoint: usize,
    ) -> Result<(), MapError> {
        self.check_free(camera, keypoint, Some(track))?;
        let entry = self
            .tracks
            .get_mut(track.0)
            .ok_or(MapError::UnknownTrack(track))?;
        match entry.observations.get(&camera) {
            Some(&existing) if existing == keypoint => return Ok(()),
            Some(&existing) => {
                return Err(MapError::CameraAlreadyObserves {
                    track,
                    camera,
                    keypoint: existing,
                })
            }
            None => {}
        }
        entry.observations.insert(camera, keypoint);
        self.lookup.insert((camera, keypoint), track);
        Ok(())
    }

    /// Flattens every observation into a table with dense camera and track indices.
    ///
    /// The result only depends on the state of the reconstruction, so repeated calls without
    /// mutation in between are identical.
    pub fn build_observation_table(
        &self,
        features: &BTreeMap<CameraId, ImageFeatures>,
    ) -> Result<ObservationTable, MapError> {
        let camera_ids: Vec<CameraId> = self.cameras.keys().copied().collect();
        let camera_index: HashMap<CameraId, usize> = camera_ids
            .iter()
            .enumerate()
            .map(|(ix, &id)| (id, ix))
            .collect();
        let track_ids: Vec<TrackId> = self.tracks.iter().map(|t| t.id).collect();

        let mut rows = Vec::with_capacity(self.num_observations());
        for (track_ix, track) in self.tracks.iter().enumerate() {
            for (&camera, &keypoint) in &track.observations {
                let &camera_ix = camera_index
                    .get(&camera)
                    .ok_or(MapError::UnknownCamera(camera))?;
                let pixel = features
                    .get(&camera)
                    .ok_or(MapError::MissingFeatures(camera))?
                    .keypoint(camera, keypoint)?;
                rows.push(Observation {
                    camera: camera_ix,
                    track: track_ix,
                    pixel,
                });
            }
        }

        Ok(ObservationTable {
            camera_ids,
            track_ids,
            rows,
        })
    }

    /// Track coordinates and colors in ascending track id order.
    pub fn export_points(&self) -> (Vec<Point3<f64>>, Vec<[u8; 3]>) {
        self.tracks.iter().map(|t| (t.coord, t.color)).unzip()
    }
}
