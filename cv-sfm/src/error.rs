use crate::{CameraId, TrackId};
use cv_geom::PoseError;
use thiserror::Error;

/// Reasons a view could not be registered. The map is unchanged and the caller may move on to
/// the next image.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("no features were added for image {0:?}")]
    UnknownImage(CameraId),
    #[error("image {0:?} is already registered")]
    AlreadyRegistered(CameraId),
    #[error("only found {found} correspondences with the map, need {needed}")]
    InsufficientCorrespondences { found: usize, needed: usize },
    #[error("pose solver failed: {0}")]
    PoseSolver(#[from] PoseError),
    #[error("only found {found} pose inliers, need {needed}")]
    InsufficientInliers { found: usize, needed: usize },
    #[error("pose solver reported inlier {index} out of {count} correspondences")]
    InlierOutOfRange { index: usize, count: usize },
}

/// Violations of the map's invariants. These indicate a bug in the caller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MapError {
    #[error("camera {0:?} is already registered")]
    DuplicateCamera(CameraId),
    #[error("camera {0:?} is not registered")]
    UnknownCamera(CameraId),
    #[error("track {0:?} does not exist")]
    UnknownTrack(TrackId),
    #[error("a track needs at least 2 observations, got {0}")]
    TooFewObservations(usize),
    #[error("keypoint {keypoint} of camera {camera:?} belongs to {existing:?}, cannot assign it to {requested:?}")]
    ObservationConflict {
        camera: CameraId,
        keypoint: usize,
        existing: TrackId,
        requested: Option<TrackId>,
    },
    #[error("track {track:?} is already observed by camera {camera:?} through keypoint {keypoint}")]
    CameraAlreadyObserves {
        track: TrackId,
        camera: CameraId,
        keypoint: usize,
    },
    #[error("camera {camera:?} only has {count} keypoints, keypoint {keypoint} does not exist")]
    KeypointOutOfRange {
        camera: CameraId,
        keypoint: usize,
        count: usize,
    },
    #[error("no features are cached for camera {0:?}")]
    MissingFeatures(CameraId),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),
    #[error("reconstruction invariant violated: {0}")]
    Map(#[from] MapError),
}

impl Error {
    /// Registration failures leave the map untouched, so the caller can skip the image.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Registration(_))
    }
}
