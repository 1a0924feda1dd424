use crate::{
    reprojection::project, BundleAdjustmentProblem, CAMERA_PARAMETERS, POINT_PARAMETERS,
};
use nalgebra::{
    DMatrix, DVector, Matrix2x6, Matrix3, Matrix6, Matrix6x3, SMatrix, Vector3, Vector6,
};

const INITIAL_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-10;
const MAX_DAMPING: f64 = 1e10;
const DAMPING_UP: f64 = 10.0;
const DAMPING_DOWN: f64 = 0.1;

/// Why [`SchurLevenbergMarquardt::minimize`] stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Every residual is zero.
    ResidualsZero,
    /// The step or the relative decrease of the cost fell below the tolerance.
    Converged,
    /// No damping produced a decrease of the cost.
    NoImprovementPossible,
    /// The residual evaluation budget ran out.
    LostPatience,
    /// The residuals at the starting parameters are not finite.
    NonFinite,
    /// The reduced camera system could not be solved at any damping.
    Singular,
}

impl Termination {
    pub fn was_successful(self) -> bool {
        matches!(
            self,
            Self::ResidualsZero | Self::Converged | Self::NoImprovementPossible
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SchurReport {
    pub termination: Termination,
    /// Residual evaluations, including the one at the starting parameters.
    pub evaluations: usize,
    /// Linearizations of the problem.
    pub iterations: usize,
}

/// Levenberg-Marquardt for [`BundleAdjustmentProblem`] which never forms the full Jacobian.
///
/// Each iteration accumulates the block normal equations observation by observation, eliminates
/// the points with the Schur complement and solves the dense reduced camera system. The cost of
/// an iteration is linear in the number of observations and cubic only in the number of cameras.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SchurLevenbergMarquardt {
    tolerance: f64,
    max_evaluations: usize,
}

impl Default for SchurLevenbergMarquardt {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_evaluations: 100,
        }
    }
}

impl SchurLevenbergMarquardt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops once a step is this small relative to the parameters or the cost decreases by less
    /// than this fraction.
    #[must_use]
    pub fn with_tolerance(self, tolerance: f64) -> Self {
        Self { tolerance, ..self }
    }

    /// The residuals are evaluated at most this many times.
    #[must_use]
    pub fn with_max_evaluations(self, max_evaluations: usize) -> Self {
        Self {
            max_evaluations,
            ..self
        }
    }

    pub fn minimize(
        &self,
        mut problem: BundleAdjustmentProblem,
    ) -> (BundleAdjustmentProblem, SchurReport) {
        let mut report = SchurReport {
            termination: Termination::LostPatience,
            evaluations: 0,
            iterations: 0,
        };
        report.termination = self.run(&mut problem, &mut report);
        (problem, report)
    }

    fn run(&self, problem: &mut BundleAdjustmentProblem, report: &mut SchurReport) -> Termination {
        if self.max_evaluations == 0 {
            return Termination::LostPatience;
        }
        let by_point = observations_by_point(problem);
        let mut cost = problem.cost();
        report.evaluations += 1;
        if !cost.is_finite() {
            return Termination::NonFinite;
        }
        let mut damping = INITIAL_DAMPING;

        loop {
            if cost <= f64::MIN_POSITIVE {
                return Termination::ResidualsZero;
            }
            let equations = NormalEquations::new(problem);
            report.iterations += 1;

            loop {
                let step = match equations.solve(problem, &by_point, damping) {
                    Some(step) => step,
                    None => {
                        damping *= DAMPING_UP;
                        if damping > MAX_DAMPING {
                            return Termination::Singular;
                        }
                        continue;
                    }
                };
                if step.norm() <= self.tolerance * (problem.params.norm() + self.tolerance) {
                    return Termination::Converged;
                }
                if report.evaluations >= self.max_evaluations {
                    return Termination::LostPatience;
                }

                let previous = problem.params.clone();
                problem.params += &step;
                let trial = problem.cost();
                report.evaluations += 1;

                if trial.is_finite() && trial < cost {
                    let decrease = (cost - trial) / cost;
                    cost = trial;
                    damping = (damping * DAMPING_DOWN).max(MIN_DAMPING);
                    if decrease <= self.tolerance {
                        return Termination::Converged;
                    }
                    break;
                }

                problem.params = previous;
                damping *= DAMPING_UP;
                if damping > MAX_DAMPING {
                    return Termination::NoImprovementPossible;
                }
            }
        }
    }
}

fn observations_by_point(problem: &BundleAdjustmentProblem) -> Vec<Vec<usize>> {
    let mut by_point = vec![vec![]; problem.num_points()];
    for (row, observation) in problem.observations.iter().enumerate() {
        by_point[observation.point].push(row);
    }
    by_point
}

/// Adds `damping` times the diagonal to the diagonal, flooring tiny diagonal entries.
fn damped<const D: usize>(m: &SMatrix<f64, D, D>, damping: f64) -> SMatrix<f64, D, D> {
    let mut damped = *m;
    for i in 0..D {
        damped[(i, i)] += damping * m[(i, i)].max(1e-6);
    }
    damped
}

/// The Gauss-Newton normal equations in block form.
///
/// `cameras` and `points` are the diagonal blocks, `coupling` holds the camera-point block of
/// every observation (`None` when its camera is fixed) and the gradients are `J^T r` negated.
struct NormalEquations {
    cameras: Vec<Matrix6<f64>>,
    points: Vec<Matrix3<f64>>,
    coupling: Vec<Option<Matrix6x3<f64>>>,
    camera_gradient: Vec<Vector6<f64>>,
    point_gradient: Vec<Vector3<f64>>,
}

impl NormalEquations {
    fn new(problem: &BundleAdjustmentProblem) -> Self {
        let mut equations = Self {
            cameras: vec![Matrix6::zeros(); problem.num_cameras()],
            points: vec![Matrix3::zeros(); problem.num_points()],
            coupling: Vec::with_capacity(problem.observations.len()),
            camera_gradient: vec![Vector6::zeros(); problem.num_cameras()],
            point_gradient: vec![Vector3::zeros(); problem.num_points()],
        };
        for observation in &problem.observations {
            let (omega, translation) = problem.camera_vectors(observation.camera);
            let point = problem.point(observation.point);
            let projection = project(&problem.intrinsics, &omega, &translation, &point);
            // The Jacobian of the residual is the negated projection derivative, so both signs
            // cancel in `J^T J` and `-J^T r`.
            let residual = observation.pixel - projection.pixel;
            let d_point = projection.d_point;
            equations.points[observation.point] += d_point.transpose() * d_point;
            equations.point_gradient[observation.point] += d_point.transpose() * residual;

            if problem.is_fixed(observation.camera) {
                equations.coupling.push(None);
                continue;
            }
            let mut d_camera = Matrix2x6::zeros();
            d_camera
                .fixed_slice_mut::<2, 3>(0, 0)
                .copy_from(&projection.d_rotation);
            d_camera
                .fixed_slice_mut::<2, 3>(0, 3)
                .copy_from(&projection.d_translation);
            equations.cameras[observation.camera] += d_camera.transpose() * d_camera;
            equations.camera_gradient[observation.camera] += d_camera.transpose() * residual;
            equations
                .coupling
                .push(Some(d_camera.transpose() * d_point));
        }
        equations
    }

    /// Solves the damped system, returning the full parameter step.
    fn solve(
        &self,
        problem: &BundleAdjustmentProblem,
        by_point: &[Vec<usize>],
        damping: f64,
    ) -> Option<DVector<f64>> {
        let num_cameras = problem.num_cameras();
        let point_inverses = self
            .points
            .iter()
            .map(|v| damped(v, damping).try_inverse())
            .collect::<Option<Vec<Matrix3<f64>>>>()?;

        let size = CAMERA_PARAMETERS * num_cameras;
        let mut reduced = DMatrix::zeros(size, size);
        let mut rhs = DVector::zeros(size);
        for (c, (block, gradient)) in self.cameras.iter().zip(&self.camera_gradient).enumerate() {
            let offset = CAMERA_PARAMETERS * c;
            reduced
                .fixed_slice_mut::<6, 6>(offset, offset)
                .copy_from(&damped(block, damping));
            rhs.fixed_rows_mut::<6>(offset).copy_from(gradient);
        }

        for (point, rows) in by_point.iter().enumerate() {
            let point_inverse = point_inverses[point];
            for &a in rows {
                let w_a = match self.coupling[a] {
                    Some(w) => w * point_inverse,
                    None => continue,
                };
                let offset_a = CAMERA_PARAMETERS * problem.observations[a].camera;
                let mut rhs_block = rhs.fixed_rows_mut::<6>(offset_a);
                rhs_block -= w_a * self.point_gradient[point];
                for &b in rows {
                    if let Some(w_b) = self.coupling[b] {
                        let offset_b = CAMERA_PARAMETERS * problem.observations[b].camera;
                        let mut block = reduced.fixed_slice_mut::<6, 6>(offset_a, offset_b);
                        block -= w_a * w_b.transpose();
                    }
                }
            }
        }

        // Fixed cameras have no coupling, so only their diagonal block needs pinning.
        for c in (0..num_cameras).filter(|&c| problem.is_fixed(c)) {
            let offset = CAMERA_PARAMETERS * c;
            reduced
                .fixed_slice_mut::<6, 6>(offset, offset)
                .copy_from(&Matrix6::identity());
            rhs.fixed_rows_mut::<6>(offset).fill(0.0);
        }

        let camera_step = match reduced.clone().cholesky() {
            Some(cholesky) => cholesky.solve(&rhs),
            None => reduced.lu().solve(&rhs)?,
        };

        let mut step = DVector::zeros(problem.params.len());
        step.rows_mut(0, size).copy_from(&camera_step);
        for (point, rows) in by_point.iter().enumerate() {
            let mut gradient = self.point_gradient[point];
            for &row in rows {
                if let Some(w) = self.coupling[row] {
                    let offset = CAMERA_PARAMETERS * problem.observations[row].camera;
                    gradient -= w.transpose() * camera_step.fixed_rows::<6>(offset);
                }
            }
            step.fixed_rows_mut::<POINT_PARAMETERS>(problem.point_offset(point))
                .copy_from(&(point_inverses[point] * gradient));
        }
        if step.iter().all(|n| n.is_finite()) {
            Some(step)
        } else {
            None
        }
    }
}
