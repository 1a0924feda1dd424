mod synthetic;

use cv_sfm::{
    export_reconstruction, stats::PointCloudStats, BundleAdjustOptions, CameraId, Downsample,
    HggMatcher, IncrementalMapper, LinearTriangulator, RefinedPnp, SfmSettings,
};
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::{fs::File, io::BufWriter, path::PathBuf};
use structopt::StructOpt;
use synthetic::{SceneOptions, SyntheticScene};

#[derive(StructOpt, Clone)]
#[structopt(
    name = "sfm-sandbox",
    about = "Runs incremental structure from motion on a synthetic scene"
)]
struct Opt {
    /// The file where settings are specified.
    ///
    /// This is in the format of `cv_sfm::SfmSettings`.
    #[structopt(short, long, default_value = "sfm-settings.json")]
    settings: PathBuf,
    /// The file where the final reconstruction is saved with bincode.
    #[structopt(short, long)]
    data: Option<PathBuf>,
    /// Output PLY file to deposit point cloud
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// Draw each camera into the PLY file as a pyramid of this size.
    #[structopt(long)]
    camera_size: Option<f64>,
    /// Fill the sides of the camera pyramids.
    #[structopt(long)]
    camera_faces: bool,
    /// The number of points in the scene
    #[structopt(long, default_value = "2000")]
    points: usize,
    /// The number of images of the scene
    #[structopt(long, default_value = "12")]
    cameras: usize,
    #[structopt(long, default_value = "1024")]
    width: u32,
    #[structopt(long, default_value = "768")]
    height: u32,
    /// Uniform keypoint noise in pixels
    #[structopt(long, default_value = "0.5")]
    pixel_noise: f64,
    /// The fraction of keypoints replaced by random positions
    #[structopt(long, default_value = "0.05")]
    outlier_fraction: f64,
    /// Run a quick bundle adjustment after this many registered images.
    #[structopt(long, default_value = "3")]
    ba_interval: usize,
    /// Optimize only a sample of the observations during intermediate bundle adjustments.
    ///
    /// Values below one are a fraction of the observations, anything else is a count. Zero
    /// optimizes every observation.
    #[structopt(long, default_value = "5000")]
    ba_downsample: f64,
    /// Seeds scene generation.
    #[structopt(long, default_value = "0")]
    seed: u64,
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let settings = File::open(&opt.settings)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    let settings: SfmSettings = settings.unwrap_or_default();

    if opt.cameras < 2 {
        error!("need at least two cameras to reconstruct a scene");
        std::process::exit(1);
    }
    let scene = SyntheticScene::generate(
        &SceneOptions {
            num_points: opt.points,
            num_cameras: opt.cameras,
            width: opt.width,
            height: opt.height,
            pixel_noise: opt.pixel_noise.max(0.0),
            outlier_fraction: opt.outlier_fraction.max(0.0).min(1.0),
        },
        &mut Xoshiro256PlusPlus::seed_from_u64(opt.seed),
    );
    info!(
        "generated {} points seen by {} cameras",
        scene.points.len(),
        scene.poses.len()
    );

    let matcher = HggMatcher::new(settings.match_ratio);
    let mut mapper = IncrementalMapper::new(
        scene.intrinsics,
        settings,
        matcher,
        RefinedPnp::from_settings(
            &settings,
            Xoshiro256PlusPlus::seed_from_u64(settings.pnp_seed),
        ),
        LinearTriangulator::new(),
    );
    for (ix, features) in scene.features.iter().enumerate() {
        mapper.add_image(CameraId(ix), features.clone());
    }

    let seed = scene.seed(&matcher, settings.max_point_norm);
    if let Err(e) = mapper.initialize_from_pair(CameraId(0), CameraId(1), &seed) {
        error!("failed to initialize the reconstruction: {}", e);
        std::process::exit(1);
    }

    let intermediate = BundleAdjustOptions::from_settings(&settings)
        .quick(true)
        .downsample(if opt.ba_downsample > 0.0 {
            Some(Downsample::from_value(opt.ba_downsample))
        } else {
            None
        });
    let mut registered = 0;
    for ix in 2..opt.cameras {
        match mapper.register_new_view(CameraId(ix)) {
            Ok(_) => registered += 1,
            Err(e) if e.is_recoverable() => {
                warn!("skipping image {}: {}", ix, e);
                continue;
            }
            Err(e) => {
                error!("reconstruction is corrupt: {}", e);
                std::process::exit(1);
            }
        }
        if opt.ba_interval != 0 && registered % opt.ba_interval == 0 {
            if let Err(e) = mapper.bundle_adjust(&intermediate) {
                error!("intermediate bundle adjustment failed: {}", e);
            }
        }
    }

    match mapper.bundle_adjust(&BundleAdjustOptions::from_settings(&settings)) {
        Ok(report) => info!(
            "final bundle adjustment ended at {} pixels rms over {} observations",
            report.final_rmse, report.observations
        ),
        Err(e) => error!("final bundle adjustment failed: {}", e),
    }
    match mapper.mean_reprojection_error() {
        Ok(error) => info!("mean reprojection error is {} pixels", error),
        Err(e) => error!("unable to compute the reprojection error: {}", e),
    }

    let reconstruction = mapper.reconstruction();
    info!(
        "reconstruction has {} cameras, {} tracks and {} observations",
        reconstruction.num_cameras(),
        reconstruction.num_tracks(),
        reconstruction.num_observations()
    );
    for camera in reconstruction.cameras() {
        let (rotation, translation) = scene.poses[camera.id.0];
        let truth = -(rotation.inverse() * translation);
        debug!(
            "camera {} is {} units from its true position",
            camera.id.0,
            (camera.optical_center().coords - truth).norm()
        );
    }
    if let Some(stats) = PointCloudStats::new(&mapper.export_points().0) {
        info!(
            "point cloud mean {:?}, std dev {:?}, range {:?}",
            stats.mean.as_slice(),
            stats.std_dev.as_slice(),
            stats.range().as_slice()
        );
    }

    if let Some(path) = &opt.data {
        info!("saving the reconstruction data");
        match File::create(path) {
            Ok(file) => {
                if let Err(e) = bincode::serialize_into(BufWriter::new(file), reconstruction) {
                    error!("unable to save reconstruction data: {}", e);
                }
            }
            Err(e) => error!("unable to create {}: {}", path.display(), e),
        }
    }

    if let Some(path) = &opt.output {
        info!("exporting the reconstruction");
        let result = File::create(path).and_then(|file| {
            export_reconstruction(
                BufWriter::new(file),
                reconstruction,
                opt.camera_size,
                opt.camera_faces,
            )
        });
        if let Err(e) = result {
            error!("unable to export the reconstruction to {}: {}", path.display(), e);
        }
    }
}
