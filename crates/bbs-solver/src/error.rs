//! Error types for bbs-solver

use crate::dof::DofKey;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuilderError>;

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("No degrees of freedom found in the model")]
    NoDegreesOfFreedom,

    #[error("The equation system has zero free degrees of freedom")]
    EmptySystem,

    #[error("Resizing is not allowed this way: system is {found}x{found}, expected {expected}x{expected}")]
    InvalidResize { expected: usize, found: usize },

    #[error("Dof count is not correct: expected at least {expected} active dofs, found {found}")]
    DofCountMismatch { expected: usize, found: usize },

    #[error("Method {0} is not implemented in the block builder and solver")]
    NotImplemented(&'static str),

    #[error("{0} called before the system was set up")]
    NotInitialized(&'static str),

    #[error("Unknown degree of freedom: {0}")]
    UnknownDof(DofKey),

    #[error("Scheme failure on entity {entity}: {message}")]
    Scheme { entity: u64, message: String },

    #[error("Sparsity graph is frozen; no more insertions are allowed")]
    GraphFrozen,

    #[error("Entry ({row}, {col}) is not part of the sparsity pattern")]
    EntryOutsideGraph { row: usize, col: usize },

    #[error("Global index {index} is out of range (size {size})")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("Sparse structure error: {0}")]
    Sparse(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Linear solver error: {0}")]
    Solver(String),

    #[error("Collective communication error: {0}")]
    Collective(String),

    #[error("Aborted because {failed} partition(s) failed")]
    RemoteFailure { failed: usize },
}
