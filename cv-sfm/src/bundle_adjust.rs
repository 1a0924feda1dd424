use crate::{
    CameraId, ImageFeatures, MapError, Observation, ObservationTable, Reconstruction, SfmSettings,
};
use cv_geom::CameraIntrinsics;
use cv_optimize::{BundleAdjustmentProblem, ReprojectionObservation, SchurLevenbergMarquardt};
use itertools::Itertools;
use log::*;
use rand::{seq::index, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::{BTreeMap, HashMap};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// How many observation rows to keep when bundle adjusting a subset of the reconstruction.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub enum Downsample {
    /// Keep this fraction of the rows, but at least one.
    Fraction(f64),
    /// Keep at most this many rows, but at least one.
    Count(usize),
}

impl Downsample {
    /// Values below `1.0` are fractions and everything else is a count.
    pub fn from_value(value: f64) -> Self {
        if value < 1.0 {
            Self::Fraction(value)
        } else {
            Self::Count(value as usize)
        }
    }

    /// The number of rows to keep out of `rows`.
    pub fn keep(self, rows: usize) -> usize {
        let keep = match self {
            Self::Fraction(fraction) => (rows as f64 * fraction.max(0.0)) as usize,
            Self::Count(count) => count,
        };
        keep.max(1).min(rows)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BundleAdjustOptions {
    pub max_evaluations: usize,
    pub tolerance: f64,
    pub quick_tolerance: f64,
    /// Use `quick_tolerance` instead of `tolerance`.
    pub quick: bool,
    pub downsample: Option<Downsample>,
    /// Seeds the row sampling of `downsample`.
    pub seed: u64,
}

impl BundleAdjustOptions {
    pub fn from_settings(settings: &SfmSettings) -> Self {
        Self {
            max_evaluations: settings.ba_max_evaluations,
            tolerance: settings.ba_tolerance,
            quick_tolerance: settings.ba_quick_tolerance,
            quick: false,
            downsample: None,
            seed: settings.ba_seed,
        }
    }

    #[must_use]
    pub fn quick(self, quick: bool) -> Self {
        Self { quick, ..self }
    }

    #[must_use]
    pub fn downsample(self, downsample: Option<Downsample>) -> Self {
        Self { downsample, ..self }
    }

    #[must_use]
    pub fn max_evaluations(self, max_evaluations: usize) -> Self {
        Self {
            max_evaluations,
            ..self
        }
    }

    pub fn effective_tolerance(&self) -> f64 {
        if self.quick {
            self.quick_tolerance
        } else {
            self.tolerance
        }
    }
}

impl Default for BundleAdjustOptions {
    fn default() -> Self {
        Self::from_settings(&SfmSettings::default())
    }
}

/// The outcome of a bundle adjustment.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BundleAdjustReport {
    /// Root-mean-square reprojection error in pixels before optimization.
    pub initial_rmse: f64,
    /// Root-mean-square reprojection error in pixels after optimization.
    pub final_rmse: f64,
    pub evaluations: usize,
    /// The number of observation rows that were optimized.
    pub observations: usize,
    /// Whether the solver reported convergence.
    pub success: bool,
}

/// Keeps a reproducible random subset of the rows and drops every track no kept row refers to.
///
/// Kept rows stay in their original order and track indices are renumbered contiguously in the
/// original track order.
pub fn downsample_observations(
    table: &ObservationTable,
    downsample: Downsample,
    seed: u64,
) -> ObservationTable {
    let keep = downsample.keep(table.rows.len());
    if table.rows.is_empty() || keep == table.rows.len() {
        return table.clone();
    }
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let kept = index::sample(&mut rng, table.rows.len(), keep)
        .into_iter()
        .sorted()
        .map(|ix| table.rows[ix])
        .collect_vec();

    let surviving = kept.iter().map(|row| row.track).unique().sorted().collect_vec();
    let renumber: HashMap<usize, usize> = surviving
        .iter()
        .enumerate()
        .map(|(new, &old)| (old, new))
        .collect();

    ObservationTable {
        camera_ids: table.camera_ids.clone(),
        track_ids: surviving.iter().map(|&old| table.track_ids[old]).collect(),
        rows: kept
            .into_iter()
            .map(|row| Observation {
                track: renumber[&row.track],
                ..row
            })
            .collect(),
    }
}

/// Jointly refines every camera pose and the coordinates of the optimized tracks to minimize
/// reprojection error, writing the results back into `reconstruction`.
///
/// Tracks dropped by downsampling are left untouched.
pub fn bundle_adjust(
    reconstruction: &mut Reconstruction,
    features: &BTreeMap<CameraId, ImageFeatures>,
    intrinsics: &CameraIntrinsics,
    options: &BundleAdjustOptions,
) -> Result<BundleAdjustReport, MapError> {
    let table = reconstruction.build_observation_table(features)?;
    if table.rows.is_empty() {
        warn!("tried to bundle adjust a reconstruction with no observations; ignoring");
        return Ok(BundleAdjustReport::default());
    }
    let table = match options.downsample {
        Some(downsample) => {
            let sampled = downsample_observations(&table, downsample, options.seed);
            info!(
                "downsampled bundle adjustment from {} to {} observations and from {} to {} tracks",
                table.rows.len(),
                sampled.rows.len(),
                table.track_ids.len(),
                sampled.track_ids.len()
            );
            sampled
        }
        None => table,
    };

    let cameras = table
        .camera_ids
        .iter()
        .map(|&id| {
            reconstruction
                .camera(id)
                .map(|c| (c.rotation, c.translation))
                .ok_or(MapError::UnknownCamera(id))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let points = table
        .track_ids
        .iter()
        .map(|&id| {
            reconstruction
                .track(id)
                .map(|t| t.coord)
                .ok_or(MapError::UnknownTrack(id))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let observations = table
        .rows
        .iter()
        .map(|row| ReprojectionObservation {
            camera: row.camera,
            point: row.track,
            pixel: row.pixel,
        })
        .collect();

    let problem = BundleAdjustmentProblem::new(*intrinsics, &cameras, &points, observations);
    let initial_rmse = problem.rms_error();
    debug!(
        "bundle adjusting {} cameras and {} tracks over {} observations with {} parameters",
        cameras.len(),
        points.len(),
        table.rows.len(),
        problem.params().len()
    );
    let (problem, report) = SchurLevenbergMarquardt::new()
        .with_tolerance(options.effective_tolerance())
        .with_max_evaluations(options.max_evaluations)
        .minimize(problem);
    let final_rmse = problem.rms_error();
    let success = report.termination.was_successful();
    if !success {
        warn!(
            "bundle adjustment did not converge: {:?}",
            report.termination
        );
    }

    for (ix, &id) in table.camera_ids.iter().enumerate() {
        let (rotation, translation) = problem.camera(ix);
        reconstruction.set_camera_pose(id, rotation, translation)?;
    }
    for (ix, &id) in table.track_ids.iter().enumerate() {
        reconstruction.set_track_coord(id, problem.point(ix))?;
    }

    info!(
        "bundle adjustment reduced rms reprojection error from {} to {} pixels in {} evaluations",
        initial_rmse, final_rmse, report.evaluations
    );
    Ok(BundleAdjustReport {
        initial_rmse,
        final_rmse,
        evaluations: report.evaluations,
        observations: table.rows.len(),
        success,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrackId;
    use nalgebra::Point2;

    fn table() -> ObservationTable {
        let mut rows = vec![];
        for track in 0..10 {
            for camera in 0..3 {
                rows.push(Observation {
                    camera,
                    track,
                    pixel: Point2::new(track as f64, camera as f64),
                });
            }
        }
        ObservationTable {
            camera_ids: (0..3).map(CameraId).collect(),
            track_ids: (0..10).map(|n| TrackId(n * 2)).collect(),
            rows,
        }
    }

    #[test]
    fn keep_counts() {
        assert_eq!(Downsample::Fraction(0.5).keep(30), 15);
        assert_eq!(Downsample::Fraction(0.001).keep(30), 1);
        assert_eq!(Downsample::Count(100).keep(30), 30);
        assert_eq!(Downsample::Count(0).keep(30), 1);
        assert_eq!(Downsample::from_value(0.25), Downsample::Fraction(0.25));
        assert_eq!(Downsample::from_value(12.0), Downsample::Count(12));
    }

    #[test]
    fn downsampling_renumbers_tracks_compactly() {
        let table = table();
        let sampled = downsample_observations(&table, Downsample::Count(7), 3);
        assert_eq!(sampled.rows.len(), 7);
        assert_eq!(sampled.camera_ids, table.camera_ids);

        let used = sampled.rows.iter().map(|r| r.track).unique().sorted().collect_vec();
        assert_eq!(used, (0..sampled.track_ids.len()).collect_vec());
        // Pixels identify the original track, which must match the renumbered id.
        for row in &sampled.rows {
            assert_eq!(sampled.track_ids[row.track], TrackId(row.pixel.x as usize * 2));
        }
    }

    #[test]
    fn downsampling_is_reproducible() {
        let table = table();
        let a = downsample_observations(&table, Downsample::Fraction(0.5), 11);
        let b = downsample_observations(&table, Downsample::Fraction(0.5), 11);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_reconstruction_is_a_no_op() {
        let mut reconstruction = Reconstruction::new();
        let report = bundle_adjust(
            &mut reconstruction,
            &BTreeMap::new(),
            &CameraIntrinsics::identity(),
            &BundleAdjustOptions::default(),
        )
        .unwrap();
        assert_eq!(report, BundleAdjustReport::default());
    }
}
