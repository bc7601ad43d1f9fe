//! Time/solution schemes.
//!
//! A scheme turns an entity's local system into the contribution that is
//! scattered into the global system. It is shared between the rayon workers
//! of the assembler, hence `Sync`.

use crate::dof::{DofSet, EquationId};
use crate::error::{BuilderError, Result};
use crate::model::{Entity, LocalSystem};
use nalgebra::{DMatrix, DVector};

pub trait Scheme: Sync {
    /// Global equation ids of the entity's DOFs, in local-system order.
    fn equation_id_list(&self, entity: &dyn Entity, dofs: &DofSet) -> Result<Vec<EquationId>> {
        entity
            .dof_list()
            .iter()
            .map(|key| dofs.equation_id(key))
            .collect()
    }

    /// Local LHS and RHS contribution.
    fn calculate_system_contributions(&self, entity: &dyn Entity, dofs: &DofSet) -> Result<LocalSystem>;

    fn calculate_lhs_contribution(&self, entity: &dyn Entity, dofs: &DofSet) -> Result<DMatrix<f64>> {
        Ok(self.calculate_system_contributions(entity, dofs)?.lhs)
    }

    fn calculate_rhs_contribution(&self, entity: &dyn Entity, dofs: &DofSet) -> Result<DVector<f64>> {
        Ok(self.calculate_system_contributions(entity, dofs)?.rhs)
    }
}

/// Static scheme for an incremental solve: the LHS is the tangent and the
/// RHS is the residual `f - K·u` at the current DOF values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResidualBasedStaticScheme;

impl ResidualBasedStaticScheme {
    pub fn new() -> Self {
        Self
    }
}

impl Scheme for ResidualBasedStaticScheme {
    fn calculate_system_contributions(&self, entity: &dyn Entity, dofs: &DofSet) -> Result<LocalSystem> {
        let values = dofs.values(&entity.dof_list())?;
        let local = entity
            .calculate_local_system(&values)
            .map_err(|message| BuilderError::Scheme {
                entity: entity.id(),
                message,
            })?;

        let size = values.len();
        if local.lhs.shape() != (size, size) || local.rhs.len() != size {
            return Err(BuilderError::Scheme {
                entity: entity.id(),
                message: format!(
                    "local system is {}x{} with a vector of {}, expected {size} DOFs",
                    local.lhs.nrows(),
                    local.lhs.ncols(),
                    local.rhs.len()
                ),
            });
        }

        let residual = &local.rhs - &local.lhs * &values;
        Ok(LocalSystem::new(local.lhs, residual))
    }
}
