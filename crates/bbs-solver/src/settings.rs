//! Builder and linear solver configuration.
//!
//! Both structs are read from JSON parameter objects. Missing keys take
//! their default; unknown keys are rejected so that typos do not silently
//! fall back to defaults.

use crate::dirichlet::DiagonalScaling;
use crate::error::{BuilderError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NAME: &str = "block_builder_and_solver";

/// Configuration of [`crate::builder::BlockBuilderAndSolver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderSettings {
    pub name: String,
    /// Per-row pre-allocation hint of the sparsity graph
    pub guess_row_size: usize,
    /// Value written on repaired and constrained diagonals
    pub diagonal_values_for_dirichlet_dofs: DiagonalScaling,
    /// Suppress the zero-diagonal and zero-RHS warnings
    pub silent_warnings: bool,
    /// 0 quiet, 1 timings, 2 sizes, 3 full system dumps
    pub echo_level: u8,
    /// Recover reactions after every `build_and_solve`
    pub calculate_reactions: bool,
    /// Rebuild DOF set and matrix structure on every solve
    pub reshape_matrix: bool,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            guess_row_size: 45,
            diagonal_values_for_dirichlet_dofs: DiagonalScaling::UseMaxDiagonal,
            silent_warnings: false,
            echo_level: 0,
            calculate_reactions: false,
            reshape_matrix: false,
        }
    }
}

impl BuilderSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let settings: Self = serde_json::from_value(value)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name != DEFAULT_NAME {
            return Err(BuilderError::Configuration(format!(
                "name must be \"{DEFAULT_NAME}\", got \"{}\"",
                self.name
            )));
        }
        if self.guess_row_size == 0 {
            return Err(BuilderError::Configuration(
                "guess_row_size must be at least 1".to_string(),
            ));
        }
        if self.echo_level > 3 {
            return Err(BuilderError::Configuration(format!(
                "echo_level must be between 0 and 3, got {}",
                self.echo_level
            )));
        }
        Ok(())
    }
}

/// Linear solver families shipped with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverType {
    /// Gathered dense LU
    #[default]
    Direct,
    /// Distributed Jacobi-preconditioned conjugate gradient
    ConjugateGradient,
}

/// Configuration of the linear solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinearSolverSettings {
    pub solver_type: SolverType,
    /// Relative residual tolerance for iterative solvers
    pub tolerance: f64,
    /// Maximum iterations for iterative solvers
    pub max_iteration: usize,
}

impl Default for LinearSolverSettings {
    fn default() -> Self {
        Self {
            solver_type: SolverType::Direct,
            tolerance: 1e-10,
            max_iteration: 1000,
        }
    }
}

impl LinearSolverSettings {
    /// Conjugate gradient with the given tolerance.
    pub fn conjugate_gradient(tolerance: f64) -> Self {
        Self {
            solver_type: SolverType::ConjugateGradient,
            tolerance,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(BuilderError::Configuration(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iteration == 0 {
            return Err(BuilderError::Configuration(
                "max_iteration must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level parameters file: both sections are optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverParameters {
    pub builder_and_solver_settings: BuilderSettings,
    pub linear_solver_settings: LinearSolverSettings,
}

impl SolverParameters {
    pub fn from_json(json: &str) -> Result<Self> {
        let parameters: Self = serde_json::from_str(json)?;
        parameters.builder_and_solver_settings.validate()?;
        parameters.linear_solver_settings.validate()?;
        Ok(parameters)
    }
}
