//! Distributed block builder and solver for partitioned finite element
//! systems.
//!
//! Each partition holds a share of the entities. The builder collects
//! their DOFs, numbers the free ones contiguously per partition, assembles
//! one globally consistent sparse system, eliminates master-slave
//! constraints, imposes Dirichlet conditions in place and hands the result
//! to a [`LinearSolver`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use bbs_solver::{
//!     BlockBuilderAndSolver, BuilderSettings, DirectSolver, Model, ResidualBasedStaticScheme,
//!     SerialCommunicator,
//! };
//!
//! # fn run(model: &Model) -> bbs_solver::Result<()> {
//! let scheme = ResidualBasedStaticScheme;
//! let mut builder = BlockBuilderAndSolver::new(
//!     BuilderSettings::default(),
//!     Box::new(DirectSolver),
//!     Arc::new(SerialCommunicator),
//! )?;
//! let mut system = builder.set_up(&scheme, model)?;
//! builder.solve_linear_step(&scheme, model, &mut system)?;
//! # Ok(())
//! # }
//! ```

pub mod assembly;
pub mod backend;
pub mod builder;
pub mod comm;
pub mod constraints;
pub mod dirichlet;
pub mod distributed;
pub mod dof;
pub mod elements;
pub mod error;
pub mod graph;
pub mod model;
pub mod numbering;
pub mod scheme;
pub mod settings;

pub use assembly::{Assembler, AssemblyTargets};
pub use backend::{
    ConjugateGradient, DirectSolver, LinearSolver, SolveInfo, create_solver, default_backend,
};
pub use builder::{BlockBuilderAndSolver, LinearSystem};
pub use comm::{Communicator, CommunicatorExt, Rank, SerialCommunicator, ThreadCommunicator};
pub use constraints::{ConstraintSystem, MasterSlaveConstraint};
pub use dirichlet::{DiagonalScaling, DirichletReport};
pub use distributed::{DistributedMatrix, DistributedVector, RowMap};
pub use dof::{
    DISPLACEMENT_X, DISPLACEMENT_Y, DISPLACEMENT_Z, Dof, DofKey, DofSet, EquationId, NodeId,
    TEMPERATURE, Variable,
};
pub use elements::{Bar1D, GroundSpring, PointLoad};
pub use error::{BuilderError, Result};
pub use graph::SparsityGraph;
pub use model::{DofOwnership, Entity, EntityId, LocalSystem, Model, NodeOwnership, UniformOwnership};
pub use numbering::{EquationNumbering, assign_equation_ids};
pub use scheme::{ResidualBasedStaticScheme, Scheme};
pub use settings::{BuilderSettings, LinearSolverSettings, SolverParameters, SolverType};
