//! Block builder and solver.
//!
//! Drives one partition through the solution of a linear(ized) step:
//!
//! 1. `set_up_dof_set` / `set_up_system` once per topology change
//! 2. `resize_and_initialize_vectors` builds the sparsity structure
//! 3. `build` assembles `A` and `b`
//! 4. `apply_constraints` eliminates master-slave relations
//! 5. `apply_dirichlet_conditions` imposes fixity without resizing
//! 6. the linear solver computes `dx`
//!
//! Every public operation is collective: all partitions of the group call
//! it in the same order.

use crate::assembly::{AssemblyTargets, Assembler, count_active};
use crate::backend::{LinearSolver, SolveInfo};
use crate::comm::{Communicator, CommunicatorExt};
use crate::constraints::{ConstraintSystem, check_single_level};
use crate::dirichlet::{self, DirichletReport};
use crate::distributed::{DistributedMatrix, DistributedVector, RowMap};
use crate::dof::{DofKey, DofSet, EquationId};
use crate::error::{BuilderError, Result};
use crate::graph::SparsityGraph;
use crate::model::Model;
use crate::numbering::{EquationNumbering, assign_equation_ids};
use crate::scheme::Scheme;
use crate::settings::BuilderSettings;
use nalgebra_sparse::pattern::SparsityPattern;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// The distributed system of one step: `A·dx = b`.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub a: DistributedMatrix,
    pub dx: DistributedVector,
    pub b: DistributedVector,
}

impl LinearSystem {
    pub fn size(&self) -> usize {
        self.a.global_rows()
    }
}

pub struct BlockBuilderAndSolver {
    settings: BuilderSettings,
    comm: Arc<dyn Communicator>,
    solver: Box<dyn LinearSolver>,
    assembler: Assembler,
    dofs: DofSet,
    dof_set_is_initialized: bool,
    numbering: Option<EquationNumbering>,
    structure: Option<(RowMap, SparsityPattern)>,
    /// Equation ids the stored structure was built for.
    structure_layout: Vec<(DofKey, Option<EquationId>)>,
    constraints: ConstraintSystem,
    constraints_applied: bool,
    lhs_transformed: bool,
    reactions: Option<DistributedVector>,
    prescribed_diagonal: f64,
    scale_factor: f64,
    last_dirichlet: Option<DirichletReport>,
}

impl BlockBuilderAndSolver {
    pub fn new(
        settings: BuilderSettings,
        solver: Box<dyn LinearSolver>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            comm,
            solver,
            assembler: Assembler::new(),
            dofs: DofSet::new(),
            dof_set_is_initialized: false,
            numbering: None,
            structure: None,
            structure_layout: Vec::new(),
            constraints: ConstraintSystem::new(),
            constraints_applied: false,
            lhs_transformed: false,
            reactions: None,
            prescribed_diagonal: 1.0,
            scale_factor: 1.0,
            last_dirichlet: None,
        })
    }

    pub fn from_json(json: &str, solver: Box<dyn LinearSolver>, comm: Arc<dyn Communicator>) -> Result<Self> {
        Self::new(BuilderSettings::from_json(json)?, solver, comm)
    }

    pub fn with_assembler(mut self, assembler: Assembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn settings(&self) -> &BuilderSettings {
        &self.settings
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    pub fn linear_solver(&self) -> &dyn LinearSolver {
        self.solver.as_ref()
    }

    pub fn dofs(&self) -> &DofSet {
        &self.dofs
    }

    /// Mutable access, e.g. to fix DOFs between iterations.
    pub fn dofs_mut(&mut self) -> &mut DofSet {
        &mut self.dofs
    }

    pub fn numbering(&self) -> Result<&EquationNumbering> {
        self.numbering
            .as_ref()
            .ok_or(BuilderError::NotInitialized("set_up_system"))
    }

    /// Global number of free equations.
    pub fn equation_system_size(&self) -> usize {
        self.numbering.as_ref().map_or(0, EquationNumbering::system_size)
    }

    pub fn constraints(&self) -> &ConstraintSystem {
        &self.constraints
    }

    /// RHS entries of the fixed DOFs from the last build, indexed by
    /// `equation_id - N`.
    pub fn reactions_vector(&self) -> Option<&DistributedVector> {
        self.reactions.as_ref()
    }

    /// Diagonal value of the last Dirichlet imposition or constraint
    /// elimination.
    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn last_dirichlet_report(&self) -> Option<&DirichletReport> {
        self.last_dirichlet.as_ref()
    }

    /// Value used by the `defined_externally` diagonal policy.
    pub fn set_prescribed_diagonal(&mut self, value: f64) {
        self.prescribed_diagonal = value;
    }

    fn echo(&self, level: u8) -> bool {
        self.settings.echo_level >= level
    }

    /// Collect the DOFs of every active entity and constraint. Values of
    /// DOFs that already existed are kept.
    pub fn set_up_dof_set(&mut self, model: &Model) -> Result<()> {
        let comm = Arc::clone(&self.comm);
        let comm = comm.as_ref();
        let timer = Instant::now();

        // A slave may be declared on one partition and reused on another, so
        // the check runs over every partition's constraints.
        let constraints = comm.all_gather(model.constraints().to_vec())?.concat();
        check_single_level(&constraints)?;

        let mut dofs = DofSet::collect(model);
        let owned = dofs.owned(comm.rank()).count();
        let total = comm.sum_all(owned)?;
        if total == 0 {
            return Err(BuilderError::NoDegreesOfFreedom);
        }
        if self.dof_set_is_initialized {
            dofs.inherit_values(&self.dofs);
        }

        self.dofs = dofs;
        self.dof_set_is_initialized = true;
        self.numbering = None;

        if self.echo(2) {
            info!(
                target: "bbs_solver",
                rank = comm.rank(),
                local_dofs = self.dofs.len(),
                owned_dofs = owned,
                global_dofs = total,
                "dof set set up"
            );
        }
        if self.echo(1) {
            info!(target: "bbs_solver", elapsed = ?timer.elapsed(), "setting up the dofs");
        }
        Ok(())
    }

    /// Assign equation ids and allocate the reaction vector.
    pub fn set_up_system(&mut self) -> Result<()> {
        if !self.dof_set_is_initialized {
            return Err(BuilderError::NotInitialized("set_up_system"));
        }
        let comm = Arc::clone(&self.comm);
        let numbering = assign_equation_ids(&mut self.dofs, comm.as_ref())?;
        self.reactions = Some(DistributedVector::new(numbering.fixed_map().clone()));

        if self.echo(2) {
            info!(
                target: "bbs_solver",
                rank = comm.rank(),
                system_size = numbering.system_size(),
                fixed_dofs = numbering.fixed_size(),
                local_range = ?numbering.local_range(),
                "equation ids assigned"
            );
        }
        self.numbering = Some(numbering);
        Ok(())
    }

    /// Create the system on first use (or when reshaping), otherwise check
    /// that the existing one still fits the numbering. A reused system whose
    /// equations were renumbered on any partition gets a fresh matrix
    /// structure; the constraint structure is rebuilt every time.
    pub fn resize_and_initialize_vectors(
        &mut self,
        scheme: &dyn Scheme,
        model: &Model,
        system: Option<LinearSystem>,
    ) -> Result<LinearSystem> {
        let numbering = self.numbering()?.clone();
        let size = numbering.system_size();
        let map = numbering.free_map();

        match system {
            Some(mut system) if !self.settings.reshape_matrix && self.structure.is_some() => {
                if system.a.global_rows() != size {
                    return Err(BuilderError::InvalidResize {
                        expected: size,
                        found: system.a.global_rows(),
                    });
                }
                let comm = Arc::clone(&self.comm);
                let renumbered = self.structure_layout != self.equation_layout();
                if comm.sum_all(usize::from(renumbered))? > 0 {
                    let (row_map, pattern) = self.construct_matrix_structure(scheme, model, &numbering)?;
                    system.a = DistributedMatrix::from_pattern(row_map.clone(), pattern.clone())?;
                    self.structure = Some((row_map, pattern));
                    self.structure_layout = self.equation_layout();
                    self.lhs_transformed = false;
                    if self.echo(2) {
                        info!(target: "bbs_solver", rank = comm.rank(), "equations renumbered; matrix structure rebuilt");
                    }
                }
                self.constraints
                    .construct_structure(model, &self.dofs, &numbering, comm.as_ref())?;

                if system.dx.map() != map {
                    system.dx = DistributedVector::new(map.clone());
                }
                if system.b.map() != map {
                    system.b = DistributedVector::new(map.clone());
                }
                Ok(system)
            }
            _ => {
                let timer = Instant::now();
                let (row_map, pattern) = self.construct_matrix_structure(scheme, model, &numbering)?;
                let comm = Arc::clone(&self.comm);
                self.constraints
                    .construct_structure(model, &self.dofs, &numbering, comm.as_ref())?;

                let a = DistributedMatrix::from_pattern(row_map.clone(), pattern.clone())?;
                self.structure = Some((row_map, pattern));
                self.structure_layout = self.equation_layout();
                self.lhs_transformed = false;

                if self.echo(1) {
                    info!(target: "bbs_solver", elapsed = ?timer.elapsed(), "matrix structure constructed");
                }
                Ok(LinearSystem {
                    a,
                    dx: DistributedVector::new(map.clone()),
                    b: DistributedVector::new(map.clone()),
                })
            }
        }
    }

    fn equation_layout(&self) -> Vec<(DofKey, Option<EquationId>)> {
        self.dofs.iter().map(|dof| (dof.key(), dof.equation_id())).collect()
    }

    /// Convenience for the first step: dof set, numbering and system.
    pub fn set_up(&mut self, scheme: &dyn Scheme, model: &Model) -> Result<LinearSystem> {
        self.set_up_dof_set(model)?;
        self.set_up_system()?;
        self.resize_and_initialize_vectors(scheme, model, None)
    }

    fn construct_matrix_structure(
        &self,
        scheme: &dyn Scheme,
        model: &Model,
        numbering: &EquationNumbering,
    ) -> Result<(RowMap, SparsityPattern)> {
        let comm = self.comm.as_ref();
        let dofs = &self.dofs;

        // Inactive entities may reference DOFs nobody collected; they only
        // couple the ids that exist.
        let lists = model
            .elements()
            .par_iter()
            .chain(model.conditions().par_iter())
            .map(|entity| {
                if entity.is_active() {
                    scheme.equation_id_list(entity.as_ref(), dofs)
                } else {
                    Ok(entity
                        .dof_list()
                        .iter()
                        .filter_map(|key| dofs.equation_id(key).ok())
                        .collect())
                }
            })
            .collect::<Result<Vec<Vec<EquationId>>>>();
        let constraint_lists = model
            .constraints()
            .iter()
            .map(|constraint| {
                constraint
                    .equation_ids(dofs)
                    .map(|(slaves, masters)| slaves.into_iter().chain(masters).collect())
            })
            .collect::<Result<Vec<Vec<EquationId>>>>();
        let (lists, constraint_lists) = comm.agree(lists.and_then(|l| constraint_lists.map(|c| (l, c))))?;

        let mut graph = SparsityGraph::new(
            numbering.free_map().clone(),
            numbering.system_size(),
            self.settings.guess_row_size,
        );
        let inserted = lists
            .iter()
            .chain(&constraint_lists)
            .try_for_each(|ids| graph.insert_block(ids));
        comm.agree(inserted)?;
        graph.global_assemble(comm)?;

        if self.echo(2) {
            info!(
                target: "bbs_solver",
                rank = comm.rank(),
                local_nnz = graph.local_nnz(),
                max_row_size = graph.max_row_size(comm)?,
                "sparsity graph assembled"
            );
        }
        graph.into_pattern()
    }

    fn restore_matrix(&mut self, a: &mut DistributedMatrix) -> Result<()> {
        if self.lhs_transformed {
            let (row_map, pattern) = self
                .structure
                .as_ref()
                .ok_or(BuilderError::NotInitialized("resize_and_initialize_vectors"))?;
            *a = DistributedMatrix::from_pattern(row_map.clone(), pattern.clone())?;
            self.lhs_transformed = false;
        }
        Ok(())
    }

    fn system_size_checked(&self) -> Result<usize> {
        Ok(self.numbering()?.system_size())
    }

    /// Assemble `A` and `b` (and the reaction vector).
    pub fn build(&mut self, scheme: &dyn Scheme, model: &Model, system: &mut LinearSystem) -> Result<()> {
        let size = self.system_size_checked()?;
        self.restore_matrix(&mut system.a)?;
        let timer = Instant::now();
        let comm = Arc::clone(&self.comm);

        let assembled = self.assembler.assemble(
            scheme,
            model,
            &self.dofs,
            size,
            AssemblyTargets {
                lhs: Some(&mut system.a),
                rhs: Some(&mut system.b),
                reactions: self.reactions.as_mut(),
            },
            comm.as_ref(),
        )?;

        if self.echo(1) {
            info!(target: "bbs_solver", entities = assembled, elapsed = ?timer.elapsed(), "build time");
        }
        Ok(())
    }

    /// Assemble `A` only.
    pub fn build_lhs(&mut self, scheme: &dyn Scheme, model: &Model, a: &mut DistributedMatrix) -> Result<()> {
        let size = self.system_size_checked()?;
        self.restore_matrix(a)?;
        let timer = Instant::now();
        let comm = Arc::clone(&self.comm);

        self.assembler.assemble(
            scheme,
            model,
            &self.dofs,
            size,
            AssemblyTargets {
                lhs: Some(a),
                ..AssemblyTargets::default()
            },
            comm.as_ref(),
        )?;

        if self.echo(1) {
            info!(target: "bbs_solver", elapsed = ?timer.elapsed(), "build time LHS");
        }
        Ok(())
    }

    /// Assemble `b` (and the reaction vector) only.
    pub fn build_rhs(&mut self, scheme: &dyn Scheme, model: &Model, b: &mut DistributedVector) -> Result<()> {
        let size = self.system_size_checked()?;
        let comm = Arc::clone(&self.comm);
        self.assembler.assemble(
            scheme,
            model,
            &self.dofs,
            size,
            AssemblyTargets {
                rhs: Some(b),
                reactions: self.reactions.as_mut(),
                ..AssemblyTargets::default()
            },
            comm.as_ref(),
        )?;
        Ok(())
    }

    pub fn build_lhs_complete_on_free_rows(
        &mut self,
        _scheme: &dyn Scheme,
        _model: &Model,
        _a: &mut DistributedMatrix,
    ) -> Result<()> {
        Err(BuilderError::NotImplemented("build_lhs_complete_on_free_rows"))
    }

    fn active_constraint_count(&self, model: &Model) -> Result<usize> {
        let local = model.constraints().iter().filter(|c| c.is_active()).count();
        self.comm.sum_all(local)
    }

    /// Replace `A` by `Tᵗ·A·T` and `b` by the transformed RHS. Skipped
    /// when no partition has an active constraint.
    pub fn apply_constraints(&mut self, model: &Model, system: &mut LinearSystem) -> Result<()> {
        self.constraints_applied = false;
        if self.active_constraint_count(model)? == 0 {
            return Ok(());
        }
        let timer = Instant::now();
        let comm = Arc::clone(&self.comm);
        let comm = comm.as_ref();
        let numbering = self.numbering()?.clone();

        if !self.constraints.is_initialized() {
            self.constraints
                .construct_structure(model, &self.dofs, &numbering, comm)?;
        }
        self.constraints.build(model, &self.dofs, &numbering, comm)?;

        let scale = dirichlet::scale_factor(
            self.settings.diagonal_values_for_dirichlet_dofs,
            &system.a,
            self.prescribed_diagonal,
            comm,
        )?;
        system.a = self.constraints.apply(&system.a, &mut system.b, scale, comm)?;
        self.scale_factor = scale;
        self.lhs_transformed = true;
        self.constraints_applied = true;

        if self.echo(1) {
            info!(target: "bbs_solver", elapsed = ?timer.elapsed(), "constraints build time");
        }
        Ok(())
    }

    /// RHS-only variant of [`Self::apply_constraints`] for an unchanged
    /// matrix.
    pub fn apply_rhs_constraints(&mut self, model: &Model, b: &mut DistributedVector) -> Result<()> {
        self.constraints_applied = false;
        if self.active_constraint_count(model)? == 0 {
            return Ok(());
        }
        let comm = Arc::clone(&self.comm);
        let comm = comm.as_ref();
        let numbering = self.numbering()?.clone();

        if !self.constraints.is_initialized() {
            self.constraints
                .construct_structure(model, &self.dofs, &numbering, comm)?;
        }
        self.constraints.build(model, &self.dofs, &numbering, comm)?;
        self.constraints.apply_rhs(b, comm)?;
        self.constraints_applied = true;
        Ok(())
    }

    /// Impose fixity in place; see [`crate::dirichlet`].
    pub fn apply_dirichlet_conditions(&mut self, system: &mut LinearSystem) -> Result<()> {
        let comm = Arc::clone(&self.comm);
        let comm = comm.as_ref();
        let numbering = self.numbering()?.clone();

        let scale = dirichlet::scale_factor(
            self.settings.diagonal_values_for_dirichlet_dofs,
            &system.a,
            self.prescribed_diagonal,
            comm,
        )?;
        let report = dirichlet::apply_dirichlet_conditions(
            &mut system.a,
            &mut system.b,
            &self.dofs,
            &numbering,
            scale,
            self.settings.silent_warnings,
            comm,
        )?;
        if self.echo(2) {
            debug!(
                target: "bbs_solver",
                rank = comm.rank(),
                fixed_rows = report.fixed_rows,
                repaired_rows = report.repaired_rows.len(),
                scale,
                "dirichlet conditions applied"
            );
        }
        self.scale_factor = scale;
        self.last_dirichlet = Some(report);
        Ok(())
    }

    fn system_solve_with_physics(&mut self, model: &Model, system: &mut LinearSystem) -> Result<SolveInfo> {
        let comm = Arc::clone(&self.comm);
        let comm = comm.as_ref();
        let timer = Instant::now();

        let norm_b = system.b.norm(comm)?;
        let info = if norm_b != 0.0 {
            if self.solver.additional_physical_data_is_needed() {
                self.solver
                    .provide_additional_data(&system.a, &system.dx, &system.b, &self.dofs, model)?;
            }
            system.dx.set_zero();
            self.solver.solve(&system.a, &mut system.dx, &system.b, comm)?
        } else {
            system.dx.set_zero();
            if !self.settings.silent_warnings {
                warn!(target: "bbs_solver", "ATTENTION! setting the RHS to zero!");
            }
            SolveInfo {
                iterations: 0,
                residual_norm: Some(0.0),
                solver_name: self.solver.name().to_string(),
            }
        };

        if self.constraints_applied {
            system.dx = self.constraints.back_substitute(&system.dx, comm)?;
        }

        if self.echo(1) {
            info!(target: "bbs_solver", elapsed = ?timer.elapsed(), "system solve time");
        }
        if self.echo(2) {
            info!(
                target: "bbs_solver",
                solver = %info.solver_name,
                iterations = info.iterations,
                residual_norm = ?info.residual_norm,
                "linear solver"
            );
        }
        Ok(info)
    }

    fn dump(&self, stage: &str, system: &LinearSystem) {
        if self.settings.echo_level == 3 {
            trace!(
                target: "bbs_solver",
                rank = self.comm.rank(),
                matrix = ?system.a.local_triplets(),
                unknowns = ?system.dx.local().as_slice(),
                rhs = ?system.b.local().as_slice(),
                "{stage}"
            );
        }
    }

    fn build_and_solve_inner(
        &mut self,
        scheme: &dyn Scheme,
        model: &Model,
        system: &mut LinearSystem,
    ) -> Result<SolveInfo> {
        self.build(scheme, model, system)?;
        self.apply_constraints(model, system)?;
        self.apply_dirichlet_conditions(system)?;
        self.dump("before the solution of the system", system);

        let info = self.system_solve_with_physics(model, system)?;
        self.dump("after the solution of the system", system);
        Ok(info)
    }

    /// Build, eliminate constraints, impose fixity and solve. Reactions are
    /// recovered afterwards when `calculate_reactions` is set.
    pub fn build_and_solve(
        &mut self,
        scheme: &dyn Scheme,
        model: &Model,
        system: &mut LinearSystem,
    ) -> Result<SolveInfo> {
        let info = self.build_and_solve_inner(scheme, model, system)?;
        if self.settings.calculate_reactions {
            self.calculate_reactions(scheme, model, system)?;
        }
        Ok(info)
    }

    /// Solve again with a fresh RHS and the matrix of the previous
    /// `build_and_solve`.
    pub fn build_rhs_and_solve(
        &mut self,
        scheme: &dyn Scheme,
        model: &Model,
        system: &mut LinearSystem,
    ) -> Result<SolveInfo> {
        let timer = Instant::now();
        self.build_rhs(scheme, model, &mut system.b)?;
        if self.echo(1) {
            info!(target: "bbs_solver", elapsed = ?timer.elapsed(), "build time RHS");
        }
        self.apply_rhs_constraints(model, &mut system.b)?;

        let rank = self.comm.rank();
        let size = self.system_size_checked()?;
        for dof in self.dofs.owned(rank).filter(|dof| dof.is_fixed()) {
            if let Some(id) = dof.equation_id().filter(|&id| id < size) {
                system.b.set(id, 0.0)?;
            }
        }

        self.system_solve_with_physics(model, system)
    }

    /// Rebuild the RHS at the current DOF values and store
    /// `reaction = -residual` on every DOF.
    pub fn calculate_reactions(
        &mut self,
        scheme: &dyn Scheme,
        model: &Model,
        system: &mut LinearSystem,
    ) -> Result<()> {
        let comm = Arc::clone(&self.comm);
        let comm = comm.as_ref();
        let numbering = self.numbering()?.clone();
        let size = numbering.system_size();
        let expected = size + numbering.fixed_size();

        system.b.set_zero();
        self.build_rhs(scheme, model, &mut system.b)?;

        let rank = comm.rank();
        let found = self
            .dofs
            .owned(rank)
            .filter(|dof| dof.equation_id().is_some_and(|id| id < expected))
            .count();
        let found = comm.sum_all(found)?;
        if found < expected {
            return Err(BuilderError::DofCountMismatch { expected, found });
        }

        let reactions = self
            .reactions
            .as_ref()
            .ok_or(BuilderError::NotInitialized("calculate_reactions"))?;
        let b = &system.b;
        let outcome = self.dofs.iter_mut().filter(|dof| dof.owner() == rank).try_for_each(|dof| -> Result<()> {
            let Some(id) = dof.equation_id() else {
                return Ok(());
            };
            let residual = if id < size {
                b.get(id)
            } else {
                reactions.get(id - size)
            };
            let residual = residual.ok_or(BuilderError::IndexOutOfRange { index: id, size: expected })?;
            dof.set_reaction(-residual);
            Ok(())
        });
        comm.agree(outcome)?;
        self.dofs.synchronize_reactions(comm)
    }

    /// Add a solved increment to the DOF values.
    pub fn update(&mut self, dx: &DistributedVector) -> Result<()> {
        let comm = Arc::clone(&self.comm);
        self.dofs.apply_increment(dx, comm.as_ref())
    }

    /// One linear step on top of the builder: build and solve, update the
    /// DOF values, then recover reactions at the new state when
    /// `calculate_reactions` is set. With `reshape_matrix` the DOF set and
    /// the structure are rebuilt first.
    pub fn solve_linear_step(
        &mut self,
        scheme: &dyn Scheme,
        model: &Model,
        system: &mut LinearSystem,
    ) -> Result<SolveInfo> {
        if self.settings.reshape_matrix {
            self.set_up_dof_set(model)?;
            self.set_up_system()?;
            *system = self.resize_and_initialize_vectors(scheme, model, None)?;
        }
        let info = self.build_and_solve_inner(scheme, model, system)?;
        self.update(&system.dx)?;
        if self.settings.calculate_reactions {
            self.calculate_reactions(scheme, model, system)?;
        }
        Ok(info)
    }

    /// Validate configuration, the constraint layout and, once the DOF set
    /// exists, that every active entity references registered DOFs.
    pub fn check(&self, model: &Model) -> Result<()> {
        let comm = self.comm.as_ref();
        let constraints = comm.all_gather(model.constraints().to_vec())?.concat();
        let local = self
            .settings
            .validate()
            .and_then(|_| check_single_level(&constraints))
            .and_then(|_| {
                if !self.dof_set_is_initialized {
                    return Ok(());
                }
                model
                    .elements()
                    .iter()
                    .chain(model.conditions())
                    .filter(|entity| entity.is_active())
                    .flat_map(|entity| entity.dof_list())
                    .find(|key| !self.dofs.contains(key))
                    .map_or(Ok(()), |key| Err(BuilderError::UnknownDof(key)))
            });
        comm.agree(local)?;
        if self.echo(2) {
            let active = count_active(model, comm)?;
            info!(target: "bbs_solver", active_entities = active, "check passed");
        }
        Ok(())
    }

    /// Drop every piece of state derived from the model.
    pub fn clear(&mut self) {
        self.dofs = DofSet::new();
        self.dof_set_is_initialized = false;
        self.numbering = None;
        self.structure = None;
        self.structure_layout.clear();
        self.constraints.clear();
        self.constraints_applied = false;
        self.lhs_transformed = false;
        self.reactions = None;
        self.scale_factor = 1.0;
        self.last_dirichlet = None;
        if self.echo(1) {
            info!(target: "bbs_solver", "clear function");
        }
    }
}
