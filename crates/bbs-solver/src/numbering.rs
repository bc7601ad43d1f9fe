//! Equation numbering.
//!
//! Each partition numbers the free DOFs it owns with a contiguous block of
//! ids starting at the exclusive prefix sum of the owned free counts of the
//! lower ranks. Fixed DOFs are numbered the same way in a second range that
//! starts at `N`, the global free count. Ghost DOFs then take their id (and
//! fixity) from their owner.

use crate::comm::{Communicator, CommunicatorExt};
use crate::distributed::RowMap;
use crate::dof::{DofKey, DofSet, EquationId};
use crate::error::{BuilderError, Result};

/// Result of a numbering pass: row maps of the free and the fixed range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquationNumbering {
    free: RowMap,
    fixed: RowMap,
}

impl EquationNumbering {
    /// Global number of free equations (`N`).
    pub fn system_size(&self) -> usize {
        self.free.global_size()
    }

    /// Global number of fixed DOFs (`F`).
    pub fn fixed_size(&self) -> usize {
        self.fixed.global_size()
    }

    /// Row ownership of `[0, N)`.
    pub fn free_map(&self) -> &RowMap {
        &self.free
    }

    /// Row ownership of the fixed range, shifted to start at zero.
    pub fn fixed_map(&self) -> &RowMap {
        &self.fixed
    }

    /// Owned free range of the calling partition.
    pub fn local_range(&self) -> std::ops::Range<EquationId> {
        self.free.owned_range()
    }
}

/// Collective: assign equation ids to every DOF of `dofs`.
pub fn assign_equation_ids(dofs: &mut DofSet, comm: &dyn Communicator) -> Result<EquationNumbering> {
    let rank = comm.rank();
    let size = comm.size();

    let misplaced = dofs.iter().find(|dof| dof.owner() >= size).map(|dof| {
        BuilderError::Collective(format!(
            "{} is owned by rank {} but the group has {size} ranks",
            dof.key(),
            dof.owner()
        ))
    });
    comm.agree(misplaced.map_or(Ok(()), Err))?;

    let owned_free = dofs.owned(rank).filter(|dof| !dof.is_fixed()).count();
    let owned_fixed = dofs.owned(rank).filter(|dof| dof.is_fixed()).count();

    let free = RowMap::from_local_size(owned_free, comm)?;
    let fixed = RowMap::from_local_size(owned_fixed, comm)?;
    let system_size = free.global_size();
    if system_size == 0 {
        return Err(BuilderError::EmptySystem);
    }

    let mut next_free = free.first();
    let mut next_fixed = system_size + fixed.first();
    for dof in dofs.iter_mut() {
        if dof.owner() != rank {
            dof.set_equation_id(None);
        } else if dof.is_fixed() {
            dof.set_equation_id(Some(next_fixed));
            next_fixed += 1;
        } else {
            dof.set_equation_id(Some(next_free));
            next_free += 1;
        }
    }

    let mut requests: Vec<Vec<DofKey>> = vec![Vec::new(); size];
    for dof in dofs.iter().filter(|dof| dof.owner() != rank) {
        requests[dof.owner()].push(dof.key());
    }

    let replies = comm.request_response(requests.clone(), |key| {
        dofs.get(key)
            .filter(|dof| dof.owner() == rank)
            .and_then(|dof| dof.equation_id().map(|id| (id, dof.is_fixed())))
            .ok_or_else(|| {
                BuilderError::Collective(format!(
                    "rank {rank} was asked for the equation id of {key}, which it does not hold"
                ))
            })
    })?;

    for (keys, answers) in requests.iter().zip(replies) {
        for (key, (id, is_fixed)) in keys.iter().zip(answers) {
            let dof = dofs.get_mut(key)?;
            dof.set_fixed(is_fixed);
            dof.set_equation_id(Some(id));
        }
    }

    Ok(EquationNumbering { free, fixed })
}
