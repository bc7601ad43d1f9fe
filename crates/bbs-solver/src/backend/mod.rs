//! Linear solver abstraction layer.
//!
//! The builder is backend-agnostic: it hands the imposed system to a
//! [`LinearSolver`] trait object chosen at runtime.
//!
//! # Backends
//!
//! - **Direct** (default): gathers the system and uses nalgebra's dense LU.
//! - **ConjugateGradient**: distributed Jacobi-preconditioned CG; only
//!   ghost imports and reductions cross partitions.

pub mod cg;
pub mod native;
pub mod traits;

pub use cg::ConjugateGradient;
pub use native::DirectSolver;
pub use traits::*;

use crate::settings::{LinearSolverSettings, SolverType};

/// Returns the backend selected by `settings`.
pub fn create_solver(settings: &LinearSolverSettings) -> Box<dyn LinearSolver> {
    match settings.solver_type {
        SolverType::Direct => Box::new(DirectSolver),
        SolverType::ConjugateGradient => Box::new(ConjugateGradient::from_settings(settings)),
    }
}

/// Returns the default solver backend.
pub fn default_backend() -> Box<dyn LinearSolver> {
    Box::new(DirectSolver)
}
