//! Master-slave constraint elimination.
//!
//! Every constraint states `u_s = R·u_m + c` for a group of slave DOFs. The
//! constraints of the whole model are collected into a transformation
//! matrix `T` (N x N, identity except on active slave rows, where the
//! diagonal is zero and the master columns hold `R`) and a constant vector.
//! The system is solved in the reduced unknown `x̃` with
//!
//! ```text
//! A' = Tᵗ·A·T        b' = Tᵗ·(b - A·c_inc)        dx = T·dx̃ + c_inc
//! ```
//!
//! where `c_inc = R·u_m + c - u_s` is the amount by which the current DOF
//! values violate the constraints. Constraints must be single-level: a
//! slave is never a master, and no DOF is the slave of two constraints.

use crate::comm::{Communicator, CommunicatorExt};
use crate::distributed::{DistributedMatrix, DistributedVector};
use crate::dof::{DofKey, DofSet, EquationId};
use crate::error::{BuilderError, Result};
use crate::graph::SparsityGraph;
use crate::model::{EntityId, Model};
use crate::numbering::EquationNumbering;
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Linear relation `u_slaves = relation · u_masters + constant`.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterSlaveConstraint {
    id: EntityId,
    slaves: Vec<DofKey>,
    masters: Vec<DofKey>,
    relation: DMatrix<f64>,
    constant: DVector<f64>,
    active: bool,
}

impl MasterSlaveConstraint {
    pub fn new(
        id: EntityId,
        slaves: Vec<DofKey>,
        masters: Vec<DofKey>,
        relation: DMatrix<f64>,
        constant: DVector<f64>,
    ) -> Result<Self> {
        if relation.shape() != (slaves.len(), masters.len()) || constant.len() != slaves.len() {
            return Err(BuilderError::Configuration(format!(
                "constraint {id}: relation is {}x{} and constant has {} entries for {} slaves and {} masters",
                relation.nrows(),
                relation.ncols(),
                constant.len(),
                slaves.len(),
                masters.len()
            )));
        }
        Ok(Self {
            id,
            slaves,
            masters,
            relation,
            constant,
            active: true,
        })
    }

    /// `slave = coefficient · master + constant`
    pub fn linear(id: EntityId, slave: DofKey, master: DofKey, coefficient: f64, constant: f64) -> Self {
        Self {
            id,
            slaves: vec![slave],
            masters: vec![master],
            relation: DMatrix::from_element(1, 1, coefficient),
            constant: DVector::from_element(1, constant),
            active: true,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn slaves(&self) -> &[DofKey] {
        &self.slaves
    }

    pub fn masters(&self) -> &[DofKey] {
        &self.masters
    }

    pub fn relation(&self) -> &DMatrix<f64> {
        &self.relation
    }

    pub fn constant(&self) -> &DVector<f64> {
        &self.constant
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Slaves first, then masters.
    pub fn dof_list(&self) -> Vec<DofKey> {
        self.slaves.iter().chain(&self.masters).copied().collect()
    }

    /// Equation ids of slaves and masters.
    pub fn equation_ids(&self, dofs: &DofSet) -> Result<(Vec<EquationId>, Vec<EquationId>)> {
        let slaves = self
            .slaves
            .iter()
            .map(|key| dofs.equation_id(key))
            .collect::<Result<Vec<_>>>()?;
        let masters = self
            .masters
            .iter()
            .map(|key| dofs.equation_id(key))
            .collect::<Result<Vec<_>>>()?;
        Ok((slaves, masters))
    }
}

/// Global transformation built from every constraint of the model.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSystem {
    transformation: Option<DistributedMatrix>,
    constant: Option<DistributedVector>,
    correction: Option<DistributedVector>,
    slave_ids: Vec<EquationId>,
    active_slaves: BTreeSet<EquationId>,
    active_count: usize,
}

impl ConstraintSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collective: allocate `T` with a structure that holds every constraint,
    /// active or not, plus the full diagonal.
    pub fn construct_structure(
        &mut self,
        model: &Model,
        dofs: &DofSet,
        numbering: &EquationNumbering,
        comm: &dyn Communicator,
    ) -> Result<()> {
        let size = numbering.system_size();
        let mut graph = SparsityGraph::new(numbering.free_map().clone(), size, 4);
        let mut slaves = Vec::new();

        let inserted = model.constraints().iter().try_for_each(|constraint| -> Result<()> {
            let (slave_ids, master_ids) = constraint.equation_ids(dofs)?;
            let masters: Vec<EquationId> = master_ids.into_iter().filter(|&id| id < size).collect();
            for slave in slave_ids.into_iter().filter(|&id| id < size) {
                graph.insert_row(slave, &masters)?;
                slaves.push(slave);
            }
            Ok(())
        });
        comm.agree(inserted)?;
        graph.global_assemble(comm)?;

        // Slave rows of constraints held elsewhere still have to be known
        // to their owner.
        let map = numbering.free_map();
        let mut sends: Vec<Vec<EquationId>> = vec![Vec::new(); comm.size()];
        for &slave in &slaves {
            if let Some(owner) = map.owner_of(slave) {
                sends[owner].push(slave);
            }
        }
        let owned: BTreeSet<EquationId> = comm.all_to_all(sends)?.into_iter().flatten().collect();

        let (row_map, pattern) = graph.into_pattern()?;
        self.transformation = Some(DistributedMatrix::from_pattern(row_map, pattern)?);
        self.constant = Some(DistributedVector::new(map.clone()));
        self.correction = Some(DistributedVector::new(map.clone()));
        self.slave_ids = owned.into_iter().collect();
        self.active_slaves.clear();
        self.active_count = 0;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.transformation.is_some()
    }

    /// Collective: fill `T`, `c` and the drift correction from the active
    /// constraints and the current DOF values.
    pub fn build(&mut self, model: &Model, dofs: &DofSet, numbering: &EquationNumbering, comm: &dyn Communicator) -> Result<()> {
        let (Some(t), Some(c), Some(correction)) = (
            self.transformation.as_mut(),
            self.constant.as_mut(),
            self.correction.as_mut(),
        ) else {
            return Err(BuilderError::NotInitialized("build of master-slave constraints"));
        };
        let size = numbering.system_size();
        t.set_zero();
        c.set_zero();
        correction.set_zero();

        let mut marker = DistributedVector::new(numbering.free_map().clone());
        let active: Vec<&MasterSlaveConstraint> =
            model.constraints().iter().filter(|constraint| constraint.is_active()).collect();

        let filled = active.iter().try_for_each(|constraint| -> Result<()> {
            let (slave_ids, master_ids) = constraint.equation_ids(dofs)?;
            let master_values = dofs.values(constraint.masters())?;
            let slave_values = dofs.values(constraint.slaves())?;
            let drift = constraint.relation() * &master_values + constraint.constant() - slave_values;

            for (i, &slave) in slave_ids.iter().enumerate() {
                if slave >= size {
                    continue;
                }
                for (j, &master) in master_ids.iter().enumerate() {
                    if master < size {
                        t.assemble_add(slave, master, constraint.relation()[(i, j)])?;
                    }
                }
                c.assemble_add(slave, constraint.constant()[i])?;
                correction.assemble_add(slave, drift[i])?;
                marker.assemble_add(slave, 1.0)?;
            }
            Ok(())
        });
        comm.agree(filled)?;

        t.finalize(comm)?;
        c.finalize(comm)?;
        correction.finalize(comm)?;
        marker.finalize(comm)?;

        self.active_slaves.clear();
        for row in t.row_map().owned_range() {
            let is_active_slave = marker.get(row).is_some_and(|m| m > 0.0);
            if is_active_slave {
                self.active_slaves.insert(row);
            }
            t.set(row, row, if is_active_slave { 0.0 } else { 1.0 })?;
        }
        self.active_count = comm.sum_all(active.len())?;
        Ok(())
    }

    /// Global number of active constraints seen by the last `build`.
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn transformation(&self) -> Option<&DistributedMatrix> {
        self.transformation.as_ref()
    }

    pub fn constant_vector(&self) -> Option<&DistributedVector> {
        self.constant.as_ref()
    }

    pub fn correction(&self) -> Option<&DistributedVector> {
        self.correction.as_ref()
    }

    /// Owned slave rows of every constraint, active or not.
    pub fn slave_ids(&self) -> &[EquationId] {
        &self.slave_ids
    }

    /// Owned slave rows whose constraint is currently inactive.
    pub fn inactive_slaves(&self) -> Vec<EquationId> {
        self.slave_ids
            .iter()
            .copied()
            .filter(|id| !self.active_slaves.contains(id))
            .collect()
    }

    fn parts(&self) -> Result<(&DistributedMatrix, &DistributedVector)> {
        match (self.transformation.as_ref(), self.correction.as_ref()) {
            (Some(t), Some(correction)) => Ok((t, correction)),
            _ => Err(BuilderError::NotInitialized("master-slave transformation")),
        }
    }

    fn has_drift(&self, comm: &dyn Communicator) -> Result<bool> {
        let (_, correction) = self.parts()?;
        Ok(correction.max_abs(comm)? > 0.0)
    }

    /// Collective: return `Tᵗ·A·T` and replace `b` by `Tᵗ·(b - A·c_inc)`.
    /// Active slave rows get `scale` on the diagonal and a zero RHS.
    pub fn apply(
        &self,
        a: &DistributedMatrix,
        b: &mut DistributedVector,
        scale: f64,
        comm: &dyn Communicator,
    ) -> Result<DistributedMatrix> {
        let (t, correction) = self.parts()?;

        if self.has_drift(comm)? {
            let shift = a.multiply(correction, comm)?;
            *b.local_mut() -= shift.local();
        }
        self.transform_rhs(b, comm)?;

        // A·T, one owned row at a time.
        let referenced = a.column_ids();
        let t_rows = t.import_rows(&referenced, comm)?;
        let mut a_t: Vec<HashMap<usize, f64>> = Vec::with_capacity(a.row_map().local_size());
        for row in a.local().row_iter() {
            let mut product: HashMap<usize, f64> = HashMap::new();
            for (k, a_ik) in row.col_indices().iter().zip(row.values()) {
                if let Some(t_row) = t_rows.get(k) {
                    for &(q, t_kq) in t_row {
                        *product.entry(q).or_insert(0.0) += a_ik * t_kq;
                    }
                }
            }
            a_t.push(product);
        }

        // Tᵗ·(A·T): row i of A·T is spread over the rows p with T[i,p] != 0.
        let mut triplets = Vec::new();
        for (local, t_row) in t.local().row_iter().enumerate() {
            let mut columns: Vec<(&usize, &f64)> = a_t[local].iter().collect();
            columns.sort_unstable_by_key(|(q, _)| **q);
            for (p, t_ip) in t_row.col_indices().iter().zip(t_row.values()) {
                if *t_ip == 0.0 {
                    continue;
                }
                for &(q, value) in &columns {
                    triplets.push((*p, *q, t_ip * value));
                }
            }
        }

        let mut transformed =
            DistributedMatrix::from_triplets(a.row_map().clone(), a.ncols(), triplets, comm)?;
        for &slave in &self.active_slaves {
            transformed.set(slave, slave, scale)?;
            b.set(slave, 0.0)?;
        }
        Ok(transformed)
    }

    /// Collective: `b ← Tᵗ·b` with zero RHS on active slave rows.
    pub fn apply_rhs(&self, b: &mut DistributedVector, comm: &dyn Communicator) -> Result<()> {
        self.transform_rhs(b, comm)?;
        for &slave in &self.active_slaves {
            b.set(slave, 0.0)?;
        }
        Ok(())
    }

    fn transform_rhs(&self, b: &mut DistributedVector, comm: &dyn Communicator) -> Result<()> {
        let (t, _) = self.parts()?;
        *b = t.transpose_multiply(b, b.map(), comm)?;
        Ok(())
    }

    /// Collective: recover the full increment `dx = T·dx̃ + c_inc`.
    pub fn back_substitute(&self, reduced: &DistributedVector, comm: &dyn Communicator) -> Result<DistributedVector> {
        let (t, correction) = self.parts()?;
        let mut dx = t.multiply(reduced, comm)?;
        *dx.local_mut() += correction.local();
        Ok(dx)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Check the single-level precondition: no slave is constrained twice and
/// no slave drives another constraint. Pass the constraints of every
/// partition, not just the local ones.
pub fn check_single_level(constraints: &[MasterSlaveConstraint]) -> Result<()> {
    let mut slaves: HashSet<DofKey> = HashSet::new();
    for constraint in constraints {
        for slave in constraint.slaves() {
            if !slaves.insert(*slave) {
                return Err(BuilderError::Configuration(format!(
                    "{slave} is the slave of more than one constraint"
                )));
            }
        }
    }
    for constraint in constraints {
        if let Some(master) = constraint.masters().iter().find(|m| slaves.contains(m)) {
            return Err(BuilderError::Configuration(format!(
                "constraint {} uses slave {master} as a master",
                constraint.id()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialCommunicator;
    use crate::distributed::RowMap;
    use crate::dof::DISPLACEMENT_X;
    use crate::elements::GroundSpring;
    use crate::numbering::assign_equation_ids;
    use std::sync::Arc;

    fn key(node: u64) -> DofKey {
        DofKey::new(node, DISPLACEMENT_X)
    }

    fn spring_model() -> Model {
        let mut model = Model::serial();
        model
            .add_element(Arc::new(GroundSpring::new(1, 1, DISPLACEMENT_X, 3.0)))
            .add_element(Arc::new(GroundSpring::new(2, 2, DISPLACEMENT_X, 5.0)))
            .add_constraint(MasterSlaveConstraint::linear(10, key(2), key(1), 2.0, 0.0));
        model
    }

    fn built(model: &Model) -> (DofSet, EquationNumbering, ConstraintSystem) {
        let comm = SerialCommunicator;
        let mut dofs = DofSet::collect(model);
        let numbering = assign_equation_ids(&mut dofs, &comm).unwrap();
        let mut constraints = ConstraintSystem::new();
        constraints.construct_structure(model, &dofs, &numbering, &comm).unwrap();
        constraints.build(model, &dofs, &numbering, &comm).unwrap();
        (dofs, numbering, constraints)
    }

    #[test]
    fn rejects_mismatched_relation() {
        let result = MasterSlaveConstraint::new(
            1,
            vec![key(1)],
            vec![key(2), key(3)],
            DMatrix::zeros(1, 1),
            DVector::zeros(1),
        );
        assert!(matches!(result, Err(BuilderError::Configuration(_))));
    }

    #[test]
    fn transformation_has_one_non_identity_row() {
        let comm = SerialCommunicator;
        let (_, _, constraints) = built(&spring_model());
        let t = constraints.transformation().unwrap().to_dense(&comm).unwrap();
        assert_eq!(t, DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 2.0, 0.0]));
        assert_eq!(constraints.slave_ids(), &[1]);
        assert!(constraints.inactive_slaves().is_empty());
        assert_eq!(constraints.active_count(), 1);
    }

    #[test]
    fn inactive_constraint_keeps_identity() {
        let comm = SerialCommunicator;
        let mut model = spring_model();
        model.constraints_mut()[0].set_active(false);
        let (_, _, constraints) = built(&model);
        let t = constraints.transformation().unwrap().to_dense(&comm).unwrap();
        assert_eq!(t, DMatrix::identity(2, 2));
        assert_eq!(constraints.inactive_slaves(), vec![1]);
        assert_eq!(constraints.active_count(), 0);
    }

    #[test]
    fn rhs_transformation_is_idempotent() {
        let comm = SerialCommunicator;
        let (_, numbering, constraints) = built(&spring_model());
        let mut b = DistributedVector::from_local(
            numbering.free_map().clone(),
            DVector::from_vec(vec![1.0, 4.0]),
        )
        .unwrap();
        constraints.apply_rhs(&mut b, &comm).unwrap();
        let once = b.local().clone();
        constraints.apply_rhs(&mut b, &comm).unwrap();
        assert_eq!(once.as_slice(), &[9.0, 0.0]);
        assert_eq!(b.local(), &once);
    }

    #[test]
    fn drift_is_corrected_by_back_substitution() {
        let comm = SerialCommunicator;
        let model = spring_model();
        let mut dofs = DofSet::collect(&model);
        dofs.set_value(&key(1), 1.0).unwrap();
        let numbering = assign_equation_ids(&mut dofs, &comm).unwrap();
        let mut constraints = ConstraintSystem::new();
        constraints.construct_structure(&model, &dofs, &numbering, &comm).unwrap();
        constraints.build(&model, &dofs, &numbering, &comm).unwrap();

        let reduced = DistributedVector::new(RowMap::serial(2));
        let dx = constraints.back_substitute(&reduced, &comm).unwrap();
        // u_s should become 2·u_m = 2 while it is 0.
        assert_eq!(dx.local().as_slice(), &[0.0, 2.0]);
    }

    #[test]
    fn single_level_check_rejects_chains() {
        let chained = vec![
            MasterSlaveConstraint::linear(1, key(2), key(1), 1.0, 0.0),
            MasterSlaveConstraint::linear(2, key(3), key(2), 1.0, 0.0),
        ];
        assert!(check_single_level(&chained).is_err());

        let doubled = vec![
            MasterSlaveConstraint::linear(1, key(2), key(1), 1.0, 0.0),
            MasterSlaveConstraint::linear(2, key(2), key(3), 1.0, 0.0),
        ];
        assert!(check_single_level(&doubled).is_err());
    }
}
