//! Backend trait definitions for linear solvers.
//!
//! The builder hands a solver the distributed system `A·x = b` after
//! constraints and boundary conditions have been imposed. Local element
//! computations stay in nalgebra (small, dense matrices).

use crate::comm::Communicator;
use crate::distributed::{DistributedMatrix, DistributedVector};
use crate::dof::DofSet;
use crate::error::Result;
use crate::model::Model;

/// Solver convergence and diagnostic info.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveInfo {
    /// Number of iterations (1 for direct solvers)
    pub iterations: usize,
    /// Final residual norm (if available)
    pub residual_norm: Option<f64>,
    /// Human-readable solver name (e.g., "nalgebra-LU", "jacobi-CG")
    pub solver_name: String,
}

/// Trait for a linear solver backend.
///
/// Every partition calls `solve` collectively; `x` holds the initial guess
/// on entry and the owned part of the solution on return.
pub trait LinearSolver: Send + Sync {
    /// Human-readable name of this backend.
    fn name(&self) -> &str;

    fn solve(
        &self,
        a: &DistributedMatrix,
        x: &mut DistributedVector,
        b: &DistributedVector,
        comm: &dyn Communicator,
    ) -> Result<SolveInfo>;

    /// Whether the solver wants model data (e.g. near-null spaces) before
    /// each solve.
    fn additional_physical_data_is_needed(&self) -> bool {
        false
    }

    fn provide_additional_data(
        &self,
        _a: &DistributedMatrix,
        _x: &DistributedVector,
        _b: &DistributedVector,
        _dofs: &DofSet,
        _model: &Model,
    ) -> Result<()> {
        Ok(())
    }
}
