//! Nonlinear least-squares problems for structure from motion.
//!
//! Single pose refinement implements
//! [`LeastSquaresProblem`](levenberg_marquardt::LeastSquaresProblem) and is solved with
//! [`LevenbergMarquardt`]. Bundle adjustment has too many parameters for a dense Jacobian and is
//! solved with [`SchurLevenbergMarquardt`] instead.

mod pose;
mod reprojection;
mod schur;
pub mod so3;

pub use pose::*;
pub use reprojection::*;
pub use schur::*;

use average::Mean;
use levenberg_marquardt::LevenbergMarquardt;
use nalgebra::DVector;

/// Root-mean-square of a residual vector, `0.0` when it is empty.
pub fn rms(residuals: &DVector<f64>) -> f64 {
    if residuals.is_empty() {
        return 0.0;
    }
    let mean: Mean = residuals.iter().map(|r| r * r).collect();
    mean.mean().sqrt()
}

/// Creates a solver whose tolerances are `tolerance` and which evaluates the residuals at most
/// `max_evaluations` times.
///
/// The solver bounds evaluations by `patience * (num_params + 1)`, so a budget smaller than
/// `num_params + 1` cannot be honored and gives `None`.
pub fn solver(
    tolerance: f64,
    max_evaluations: usize,
    num_params: usize,
) -> Option<LevenbergMarquardt<f64>> {
    let patience = max_evaluations / (num_params + 1);
    if patience == 0 {
        return None;
    }
    Some(
        LevenbergMarquardt::new()
            .with_ftol(tolerance)
            .with_xtol(tolerance)
            .with_patience(patience),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_refuses_budgets_below_one_step_per_parameter() {
        assert!(solver(1e-8, 6, 6).is_none());
        assert!(solver(1e-8, 7, 6).is_some());
        assert!(solver(1e-8, 50, 60).is_none());
    }

    #[test]
    fn rms_of_nothing_is_zero() {
        assert_eq!(rms(&DVector::zeros(0)), 0.0);
        assert_eq!(rms(&DVector::from_vec(vec![3.0, -3.0])), 3.0);
    }
}
