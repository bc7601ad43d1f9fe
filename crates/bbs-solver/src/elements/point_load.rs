//! Concentrated nodal load.

use crate::dof::{DofKey, NodeId, Variable};
use crate::model::{Entity, EntityId, LocalSystem};
use nalgebra::{DMatrix, DVector};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct PointLoad {
    id: EntityId,
    dof: DofKey,
    magnitude: f64,
    active: AtomicBool,
}

impl PointLoad {
    pub fn new(id: EntityId, node: NodeId, variable: Variable, magnitude: f64) -> Self {
        Self {
            id,
            dof: DofKey::new(node, variable),
            magnitude,
            active: AtomicBool::new(true),
        }
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

impl Entity for PointLoad {
    fn id(&self) -> EntityId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn dof_list(&self) -> Vec<DofKey> {
        vec![self.dof]
    }

    fn calculate_local_system(&self, _values: &DVector<f64>) -> Result<LocalSystem, String> {
        Ok(LocalSystem::new(
            DMatrix::zeros(1, 1),
            DVector::from_element(1, self.magnitude),
        ))
    }
}
