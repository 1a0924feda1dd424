use approx::assert_relative_eq;
use cv_geom::CameraIntrinsics;
use cv_optimize::{
    BundleAdjustmentProblem, PoseRefinementProblem, ReprojectionObservation,
    SchurLevenbergMarquardt, Termination,
};
use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{Point3, Rotation3, Vector3};
use rand::{rngs::SmallRng, Rng, SeedableRng};

const POINTS: usize = 20;

fn cameras() -> Vec<(Rotation3<f64>, Vector3<f64>)> {
    vec![
        (Rotation3::identity(), Vector3::zeros()),
        (
            Rotation3::new(Vector3::new(0.0, 0.1, 0.0)),
            Vector3::new(-0.5, 0.0, 0.0),
        ),
        (
            Rotation3::new(Vector3::new(0.02, -0.1, 0.0)),
            Vector3::new(0.5, 0.05, 0.0),
        ),
    ]
}

fn points(rng: &mut SmallRng) -> Vec<Point3<f64>> {
    (0..POINTS)
        .map(|_| {
            Point3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(4.0..6.0),
            )
        })
        .collect()
}

fn jitter(rng: &mut SmallRng, scale: f64) -> Vector3<f64> {
    Vector3::new(
        rng.gen_range(-scale..scale),
        rng.gen_range(-scale..scale),
        rng.gen_range(-scale..scale),
    )
}

fn observations(
    intrinsics: &CameraIntrinsics,
    cameras: &[(Rotation3<f64>, Vector3<f64>)],
    points: &[Point3<f64>],
) -> Vec<ReprojectionObservation> {
    let mut observations = vec![];
    for (point, p) in points.iter().enumerate() {
        for (camera, (rotation, translation)) in cameras.iter().enumerate() {
            observations.push(ReprojectionObservation {
                camera,
                point,
                pixel: intrinsics.project(&(rotation * p + translation)),
            });
        }
    }
    observations
}

#[test]
fn exact_observations_converge_to_zero_error() {
    let mut rng = SmallRng::seed_from_u64(0);
    let intrinsics = CameraIntrinsics::from_image_size(640, 480);
    let cameras = cameras();
    let truth = points(&mut rng);
    let observations = observations(&intrinsics, &cameras, &truth);

    let perturbed: Vec<Point3<f64>> = truth.iter().map(|p| p + jitter(&mut rng, 0.02)).collect();
    let problem = BundleAdjustmentProblem::new(intrinsics, &cameras, &perturbed, observations);
    let initial = problem.rms_error();

    let (problem, report) = SchurLevenbergMarquardt::new()
        .with_tolerance(1e-10)
        .with_max_evaluations(1000)
        .minimize(problem);
    let last = problem.rms_error();

    assert!(initial > 0.1);
    assert!(report.termination.was_successful(), "{:?}", report);
    assert!(last < 1e-6, "final rms error {}", last);
}

#[test]
fn ground_truth_is_a_fixed_point() {
    let mut rng = SmallRng::seed_from_u64(1);
    let intrinsics = CameraIntrinsics::from_image_size(640, 480);
    let cameras = cameras();
    let truth = points(&mut rng);
    let observations = observations(&intrinsics, &cameras, &truth);

    let problem = BundleAdjustmentProblem::new(intrinsics, &cameras, &truth, observations);
    let before = problem.params().clone();
    let (problem, report) = SchurLevenbergMarquardt::new()
        .with_tolerance(1e-4)
        .with_max_evaluations(50)
        .minimize(problem);

    assert!(report.evaluations <= 50);
    assert_relative_eq!(problem.rms_error(), 0.0, epsilon = 1e-9);
    assert_relative_eq!(*problem.params(), before, epsilon = 1e-9);
}

#[test]
fn perturbed_cameras_and_points_recover_ground_truth() {
    let mut rng = SmallRng::seed_from_u64(3);
    let intrinsics = CameraIntrinsics::from_image_size(640, 480);
    let cameras = cameras();
    let truth = points(&mut rng);
    let observations = observations(&intrinsics, &cameras, &truth);

    // Holding two cameras fixes both the frame and the scale, so the optimum is unique.
    let (rotation, translation) = cameras[2];
    let mut start = cameras.clone();
    start[2] = (
        Rotation3::new(Vector3::new(0.01, -0.015, 0.02)) * rotation,
        translation + jitter(&mut rng, 0.05),
    );
    let perturbed: Vec<Point3<f64>> = truth.iter().map(|p| p + jitter(&mut rng, 0.05)).collect();
    let problem = BundleAdjustmentProblem::new(intrinsics, &start, &perturbed, observations)
        .fix_camera(0)
        .fix_camera(1);
    assert!(problem.rms_error() > 1.0);

    let (problem, report) = SchurLevenbergMarquardt::new()
        .with_tolerance(1e-12)
        .with_max_evaluations(200)
        .minimize(problem);
    assert!(report.termination.was_successful(), "{:?}", report);

    for (ix, (rotation, translation)) in cameras.iter().enumerate() {
        let (r, t) = problem.camera(ix);
        assert_relative_eq!(r, *rotation, epsilon = 1e-6);
        assert_relative_eq!(t, *translation, epsilon = 1e-6);
    }
    for (ix, p) in truth.iter().enumerate() {
        assert_relative_eq!(problem.point(ix), *p, epsilon = 1e-6);
    }
}

#[test]
fn bundle_adjustment_stops_at_the_evaluation_budget() {
    let mut rng = SmallRng::seed_from_u64(4);
    let intrinsics = CameraIntrinsics::from_image_size(640, 480);
    let cameras = cameras();
    let truth = points(&mut rng);
    let observations = observations(&intrinsics, &cameras, &truth);
    let far: Vec<Point3<f64>> = truth.iter().map(|p| p + jitter(&mut rng, 1.0)).collect();

    for max_evaluations in [1, 2, 5, 9] {
        let problem =
            BundleAdjustmentProblem::new(intrinsics, &cameras, &far, observations.clone());
        let (_, report) = SchurLevenbergMarquardt::new()
            .with_tolerance(1e-15)
            .with_max_evaluations(max_evaluations)
            .minimize(problem);
        assert_eq!(report.termination, Termination::LostPatience);
        assert!(report.evaluations <= max_evaluations);
    }
}

#[test]
fn pose_refinement_recovers_pose() {
    let mut rng = SmallRng::seed_from_u64(2);
    let intrinsics = CameraIntrinsics::from_image_size(640, 480);
    let (rotation, translation) = cameras()[2];
    let correspondences = points(&mut rng)
        .into_iter()
        .map(|p| (p, intrinsics.project(&(rotation * p + translation))))
        .collect();

    let start_rotation = Rotation3::new(Vector3::new(0.03, -0.08, 0.01));
    let start_translation = translation + Vector3::new(0.05, -0.03, 0.04);
    let problem = PoseRefinementProblem::new(
        intrinsics,
        start_rotation,
        start_translation,
        correspondences,
    );
    let (problem, _) = cv_optimize::solver(1e-10, 500, 6).unwrap().minimize(problem);

    let (r, t) = problem.pose();
    assert_relative_eq!(r, rotation, epsilon = 1e-6);
    assert_relative_eq!(t, translation, epsilon = 1e-6);
}

#[test]
fn pose_refinement_stops_at_the_evaluation_budget() {
    let mut rng = SmallRng::seed_from_u64(5);
    let intrinsics = CameraIntrinsics::from_image_size(640, 480);
    let (rotation, translation) = cameras()[1];
    let correspondences: Vec<_> = points(&mut rng)
        .into_iter()
        .map(|p| (p, intrinsics.project(&(rotation * p + translation))))
        .collect();

    for max_evaluations in [7, 10, 14, 20] {
        let problem = PoseRefinementProblem::new(
            intrinsics,
            Rotation3::new(Vector3::new(0.4, -0.3, 0.2)),
            translation + Vector3::new(0.8, -0.6, 0.5),
            correspondences.clone(),
        );
        let (_, report) = cv_optimize::solver(1e-15, max_evaluations, problem.params().len())
            .unwrap()
            .minimize(problem);
        assert!(
            report.number_of_evaluations <= max_evaluations,
            "{} evaluations with a budget of {}",
            report.number_of_evaluations,
            max_evaluations
        );
    }
}
