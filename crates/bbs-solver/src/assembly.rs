//! Global system assembly.
//!
//! ## Assembly Process
//!
//! 1. Zero the targets (matrix, RHS, reaction vector)
//! 2. Loop over the active elements, then the active conditions, in blocks:
//!    - Compute the local contributions of a block in parallel
//!    - Scatter them sequentially, in entity order
//! 3. Agree on the outcome across partitions
//! 4. Finalize: ship contributions to rows owned by other partitions
//!
//! Rows with an id `>= N` belong to fixed DOFs. They never enter the matrix;
//! their RHS entries go to the reaction vector instead.

use crate::comm::{Communicator, CommunicatorExt};
use crate::distributed::{DistributedMatrix, DistributedVector};
use crate::dof::{DofSet, EquationId};
use crate::error::{BuilderError, Result};
use crate::model::{Entity, Model};
use crate::scheme::Scheme;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use std::sync::Arc;

/// Entities computed in parallel before each sequential scatter.
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Global containers an assembly pass writes into. Absent targets are
/// neither computed nor touched.
#[derive(Default)]
pub struct AssemblyTargets<'a> {
    pub lhs: Option<&'a mut DistributedMatrix>,
    pub rhs: Option<&'a mut DistributedVector>,
    pub reactions: Option<&'a mut DistributedVector>,
}

struct Contribution {
    ids: Vec<EquationId>,
    lhs: Option<DMatrix<f64>>,
    rhs: Option<DVector<f64>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Assembler {
    block_size: usize,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    /// Collective: assemble every active entity of `model` into `targets`.
    /// Returns the number of entities assembled on this partition.
    pub fn assemble(
        &self,
        scheme: &dyn Scheme,
        model: &Model,
        dofs: &DofSet,
        system_size: usize,
        targets: AssemblyTargets<'_>,
        comm: &dyn Communicator,
    ) -> Result<usize> {
        let AssemblyTargets {
            mut lhs,
            mut rhs,
            mut reactions,
        } = targets;

        if let Some(a) = lhs.as_mut() {
            a.set_zero();
        }
        if let Some(b) = rhs.as_mut() {
            b.set_zero();
        }
        if let Some(r) = reactions.as_mut() {
            r.set_zero();
        }

        let want_lhs = lhs.is_some();
        let want_rhs = rhs.is_some() || reactions.is_some();

        let entities: Vec<&Arc<dyn Entity>> = model
            .elements()
            .iter()
            .chain(model.conditions())
            .filter(|entity| entity.is_active())
            .collect();

        let mut outcome = Ok(());
        for block in entities.chunks(self.block_size) {
            let computed = block
                .par_iter()
                .map(|entity| compute(scheme, entity.as_ref(), dofs, want_lhs, want_rhs))
                .collect::<Result<Vec<Contribution>>>();

            outcome = computed.and_then(|contributions| {
                contributions.iter().try_for_each(|contribution| {
                    scatter(
                        contribution,
                        system_size,
                        lhs.as_deref_mut(),
                        rhs.as_deref_mut(),
                        reactions.as_deref_mut(),
                    )
                })
            });
            if outcome.is_err() {
                break;
            }
        }
        comm.agree(outcome)?;

        if let Some(a) = lhs {
            a.finalize(comm)?;
        }
        if let Some(b) = rhs {
            b.finalize(comm)?;
        }
        if let Some(r) = reactions {
            r.finalize(comm)?;
        }
        Ok(entities.len())
    }
}

fn compute(
    scheme: &dyn Scheme,
    entity: &dyn Entity,
    dofs: &DofSet,
    want_lhs: bool,
    want_rhs: bool,
) -> Result<Contribution> {
    let ids = scheme.equation_id_list(entity, dofs)?;
    let (lhs, rhs) = match (want_lhs, want_rhs) {
        (true, true) => {
            let local = scheme.calculate_system_contributions(entity, dofs)?;
            (Some(local.lhs), Some(local.rhs))
        }
        (true, false) => (Some(scheme.calculate_lhs_contribution(entity, dofs)?), None),
        (false, true) => (None, Some(scheme.calculate_rhs_contribution(entity, dofs)?)),
        (false, false) => (None, None),
    };

    let size = ids.len();
    let lhs_ok = lhs.as_ref().is_none_or(|m| m.shape() == (size, size));
    let rhs_ok = rhs.as_ref().is_none_or(|v| v.len() == size);
    if !(lhs_ok && rhs_ok) {
        return Err(BuilderError::Scheme {
            entity: entity.id(),
            message: format!("local contribution does not match its {size} equation ids"),
        });
    }
    Ok(Contribution { ids, lhs, rhs })
}

fn scatter(
    contribution: &Contribution,
    system_size: usize,
    mut lhs: Option<&mut DistributedMatrix>,
    mut rhs: Option<&mut DistributedVector>,
    mut reactions: Option<&mut DistributedVector>,
) -> Result<()> {
    let ids = &contribution.ids;
    for (i, &row) in ids.iter().enumerate() {
        if row < system_size {
            if let (Some(a), Some(local)) = (lhs.as_mut(), contribution.lhs.as_ref()) {
                for (j, &col) in ids.iter().enumerate() {
                    if col < system_size {
                        a.assemble_add(row, col, local[(i, j)])?;
                    }
                }
            }
            if let (Some(b), Some(local)) = (rhs.as_mut(), contribution.rhs.as_ref()) {
                b.assemble_add(row, local[i])?;
            }
        } else if let (Some(r), Some(local)) = (reactions.as_mut(), contribution.rhs.as_ref()) {
            r.assemble_add(row - system_size, local[i])?;
        }
    }
    Ok(())
}

/// Number of active entities over all partitions.
pub fn count_active(model: &Model, comm: &dyn Communicator) -> Result<usize> {
    let local = model
        .elements()
        .iter()
        .chain(model.conditions())
        .filter(|entity| entity.is_active())
        .count();
    comm.sum_all(local)
}
