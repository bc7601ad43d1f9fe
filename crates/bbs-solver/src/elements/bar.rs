//! 2-node axial bar along one coordinate direction.
//!
//! The bar resists only axial forces and carries one DOF per node.
//!
//! ```text
//! k = (A*E/L) * [ 1  -1]
//!               [-1   1]
//! ```

use crate::dof::{DISPLACEMENT_X, DofKey, NodeId, Variable};
use crate::model::{Entity, EntityId, LocalSystem};
use nalgebra::{DMatrix, DVector};
use std::sync::atomic::{AtomicBool, Ordering};

/// 2-node bar element
#[derive(Debug)]
pub struct Bar1D {
    id: EntityId,
    /// Node connectivity [node1_id, node2_id]
    nodes: [NodeId; 2],
    /// Nodal coordinates along the bar axis
    coordinates: [f64; 2],
    youngs_modulus: f64,
    area: f64,
    variable: Variable,
    active: AtomicBool,
}

impl Bar1D {
    pub fn new(id: EntityId, nodes: [NodeId; 2], coordinates: [f64; 2], youngs_modulus: f64, area: f64) -> Self {
        Self {
            id,
            nodes,
            coordinates,
            youngs_modulus,
            area,
            variable: DISPLACEMENT_X,
            active: AtomicBool::new(true),
        }
    }

    /// Solve for another nodal variable, e.g. a temperature with
    /// conductivity in place of `youngs_modulus`.
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variable = variable;
        self
    }

    pub fn nodes(&self) -> [NodeId; 2] {
        self.nodes
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Compute element length
    pub fn length(&self) -> Result<f64, String> {
        let length = (self.coordinates[1] - self.coordinates[0]).abs();
        if length < 1e-10 {
            return Err(format!(
                "Bar element {} has zero or near-zero length: {}",
                self.id, length
            ));
        }
        Ok(length)
    }

    /// Axial stiffness EA/L
    pub fn axial_stiffness(&self) -> Result<f64, String> {
        if self.youngs_modulus <= 0.0 || self.area <= 0.0 {
            return Err(format!(
                "Bar element {} needs a positive modulus and area (E = {}, A = {})",
                self.id, self.youngs_modulus, self.area
            ));
        }
        Ok(self.area * self.youngs_modulus / self.length()?)
    }

    pub fn stiffness_matrix(&self) -> Result<DMatrix<f64>, String> {
        let k = self.axial_stiffness()?;
        Ok(DMatrix::from_row_slice(2, 2, &[k, -k, -k, k]))
    }
}

impl Entity for Bar1D {
    fn id(&self) -> EntityId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn dof_list(&self) -> Vec<DofKey> {
        self.nodes
            .iter()
            .map(|&node| DofKey::new(node, self.variable))
            .collect()
    }

    fn calculate_local_system(&self, values: &DVector<f64>) -> Result<LocalSystem, String> {
        if values.len() != 2 {
            return Err(format!(
                "Bar element {} requires 2 nodal values, got {}",
                self.id,
                values.len()
            ));
        }
        Ok(LocalSystem::new(self.stiffness_matrix()?, DVector::zeros(2)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_axial_stiffness() {
        let bar = Bar1D::new(1, [1, 2], [0.0, 2.0], 210000.0, 0.01);
        let k = bar.stiffness_matrix().unwrap();
        let expected = 0.01 * 210000.0 / 2.0;
        assert!((k[(0, 0)] - expected).abs() < 1e-9);
        assert!((k[(0, 1)] + expected).abs() < 1e-9);
        assert!((k[(1, 0)] - k[(0, 1)]).abs() < 1e-12);
    }

    #[test]
    fn rejects_zero_length() {
        let bar = Bar1D::new(3, [1, 2], [1.5, 1.5], 1.0, 1.0);
        let err = bar.length().unwrap_err();
        assert!(err.contains("zero or near-zero length"));
    }

    #[test]
    fn rejects_missing_section() {
        let bar = Bar1D::new(3, [1, 2], [0.0, 1.0], 1.0, 0.0);
        assert!(bar.axial_stiffness().is_err());
    }

    #[test]
    fn reversed_coordinates_give_same_stiffness() {
        let forward = Bar1D::new(1, [1, 2], [0.0, 3.0], 2.0, 1.5);
        let backward = Bar1D::new(2, [1, 2], [3.0, 0.0], 2.0, 1.5);
        assert_eq!(forward.stiffness_matrix().unwrap(), backward.stiffness_matrix().unwrap());
    }

    #[test]
    fn deactivation_is_visible_through_entity() {
        let bar = Bar1D::new(1, [4, 5], [0.0, 1.0], 1.0, 1.0);
        assert!(bar.is_active());
        bar.set_active(false);
        assert!(!bar.is_active());
        assert_eq!(
            bar.dof_list(),
            vec![DofKey::new(4, DISPLACEMENT_X), DofKey::new(5, DISPLACEMENT_X)]
        );
    }
}
