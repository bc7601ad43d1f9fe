//! Spring connecting one DOF to the ground.

use crate::dof::{DofKey, NodeId, Variable};
use crate::model::{Entity, EntityId, LocalSystem};
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone)]
pub struct GroundSpring {
    id: EntityId,
    dof: DofKey,
    stiffness: f64,
}

impl GroundSpring {
    pub fn new(id: EntityId, node: NodeId, variable: Variable, stiffness: f64) -> Self {
        Self {
            id,
            dof: DofKey::new(node, variable),
            stiffness,
        }
    }

    pub fn stiffness(&self) -> f64 {
        self.stiffness
    }
}

impl Entity for GroundSpring {
    fn id(&self) -> EntityId {
        self.id
    }

    fn dof_list(&self) -> Vec<DofKey> {
        vec![self.dof]
    }

    fn calculate_local_system(&self, _values: &DVector<f64>) -> Result<LocalSystem, String> {
        if !self.stiffness.is_finite() {
            return Err(format!("Spring {} has a non-finite stiffness", self.id));
        }
        Ok(LocalSystem::new(
            DMatrix::from_element(1, 1, self.stiffness),
            DVector::zeros(1),
        ))
    }
}
