//! Degree-of-freedom registry.
//!
//! A DOF is a value record keyed by `(node, variable)`. The registry is the
//! deduplicated, ordered list of every DOF touched by the active entities of
//! a partition, including ghost DOFs owned by other partitions. Its
//! iteration order (ascending [`DofKey`]) is the order in which equation ids
//! are handed out.

use crate::comm::{Communicator, CommunicatorExt, Rank};
use crate::distributed::DistributedVector;
use crate::error::{BuilderError, Result};
use crate::model::Model;
use nalgebra::DVector;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Node identifier.
pub type NodeId = u64;

/// Global equation index. Free DOFs live in `[0, N)`, fixed DOFs in
/// `[N, N + F)`.
pub type EquationId = usize;

/// Physical variable component a DOF solves for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(&'static str);

impl Variable {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

pub const DISPLACEMENT_X: Variable = Variable::new("DISPLACEMENT_X");
pub const DISPLACEMENT_Y: Variable = Variable::new("DISPLACEMENT_Y");
pub const DISPLACEMENT_Z: Variable = Variable::new("DISPLACEMENT_Z");
pub const TEMPERATURE: Variable = Variable::new("TEMPERATURE");

/// Identity of a DOF: the node it lives on and the variable it solves for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DofKey {
    pub node: NodeId,
    pub variable: Variable,
}

impl DofKey {
    pub fn new(node: NodeId, variable: Variable) -> Self {
        Self { node, variable }
    }
}

impl fmt::Display for DofKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} {}", self.node, self.variable)
    }
}

/// A degree of freedom and its solution bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Dof {
    key: DofKey,
    owner: Rank,
    fixed: bool,
    equation_id: Option<EquationId>,
    value: f64,
    reaction: f64,
}

impl Dof {
    pub fn new(key: DofKey, owner: Rank) -> Self {
        Self {
            key,
            owner,
            fixed: false,
            equation_id: None,
            value: 0.0,
            reaction: 0.0,
        }
    }

    pub fn key(&self) -> DofKey {
        self.key
    }

    pub fn owner(&self) -> Rank {
        self.owner
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn equation_id(&self) -> Option<EquationId> {
        self.equation_id
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Reaction recovered by the last `calculate_reactions`.
    pub fn reaction(&self) -> f64 {
        self.reaction
    }

    pub(crate) fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    pub(crate) fn set_equation_id(&mut self, id: Option<EquationId>) {
        self.equation_id = id;
    }

    pub(crate) fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    pub(crate) fn set_reaction(&mut self, reaction: f64) {
        self.reaction = reaction;
    }
}

/// Deduplicated, ordered DOF list of one partition.
#[derive(Debug, Clone, Default)]
pub struct DofSet {
    dofs: Vec<Dof>,
    index: HashMap<DofKey, usize>,
}

impl DofSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from arbitrary records; the first record of each key wins.
    pub fn from_dofs(dofs: impl IntoIterator<Item = Dof>) -> Self {
        let mut dofs: Vec<Dof> = dofs.into_iter().collect();
        dofs.sort_by_key(|dof| dof.key);
        dofs.dedup_by_key(|dof| dof.key);
        let index = dofs
            .iter()
            .enumerate()
            .map(|(position, dof)| (dof.key, position))
            .collect();
        Self { dofs, index }
    }

    /// Ask every active element and condition, and every constraint, for its
    /// DOFs and merge them. Ownership, fixity and initial values come from
    /// the model.
    pub fn collect(model: &Model) -> Self {
        let entity_keys: Vec<Vec<DofKey>> = model
            .elements()
            .par_iter()
            .chain(model.conditions().par_iter())
            .filter(|entity| entity.is_active())
            .map(|entity| entity.dof_list())
            .collect();

        let mut keys: BTreeSet<DofKey> = entity_keys.into_iter().flatten().collect();
        for constraint in model.constraints() {
            keys.extend(constraint.dof_list());
        }

        Self::from_dofs(keys.into_iter().map(|key| {
            let mut dof = Dof::new(key, model.owner(&key));
            dof.fixed = model.is_fixed(&key);
            dof.value = model.initial_value(&key);
            dof
        }))
    }

    pub fn len(&self) -> usize {
        self.dofs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dofs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dof> {
        self.dofs.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Dof> {
        self.dofs.iter_mut()
    }

    /// DOFs owned by `rank`, in registry order.
    pub fn owned(&self, rank: Rank) -> impl Iterator<Item = &Dof> {
        self.dofs.iter().filter(move |dof| dof.owner == rank)
    }

    pub fn contains(&self, key: &DofKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &DofKey) -> Option<&Dof> {
        self.index.get(key).map(|&position| &self.dofs[position])
    }

    pub(crate) fn get_mut(&mut self, key: &DofKey) -> Result<&mut Dof> {
        match self.index.get(key) {
            Some(&position) => Ok(&mut self.dofs[position]),
            None => Err(BuilderError::UnknownDof(*key)),
        }
    }

    pub fn equation_id(&self, key: &DofKey) -> Result<EquationId> {
        self.get(key)
            .and_then(Dof::equation_id)
            .ok_or(BuilderError::UnknownDof(*key))
    }

    pub fn value(&self, key: &DofKey) -> Result<f64> {
        self.get(key)
            .map(Dof::value)
            .ok_or(BuilderError::UnknownDof(*key))
    }

    /// Current values of `keys`, in the given order.
    pub fn values(&self, keys: &[DofKey]) -> Result<DVector<f64>> {
        let values = keys
            .iter()
            .map(|key| self.value(key))
            .collect::<Result<Vec<f64>>>()?;
        Ok(DVector::from_vec(values))
    }

    pub fn reaction(&self, key: &DofKey) -> Result<f64> {
        self.get(key)
            .map(Dof::reaction)
            .ok_or(BuilderError::UnknownDof(*key))
    }

    pub fn set_value(&mut self, key: &DofKey, value: f64) -> Result<()> {
        self.get_mut(key)?.value = value;
        Ok(())
    }

    /// Fix a DOF without renumbering. A DOF that already has a free-range
    /// equation id keeps it and becomes a Dirichlet row.
    pub fn fix(&mut self, key: &DofKey) -> Result<()> {
        self.get_mut(key)?.fixed = true;
        Ok(())
    }

    /// Release a DOF. Only meaningful for DOFs numbered as free; a DOF
    /// numbered in the fixed range needs a new `set_up_system`.
    pub fn free(&mut self, key: &DofKey) -> Result<()> {
        self.get_mut(key)?.fixed = false;
        Ok(())
    }

    /// Copy values of DOFs that survived a topology change.
    pub(crate) fn inherit_values(&mut self, previous: &DofSet) {
        for dof in &mut self.dofs {
            if let Some(old) = previous.get(&dof.key) {
                dof.value = old.value;
            }
        }
    }

    /// Add the solved increment to every owned free DOF, then refresh the
    /// ghost copies from their owners.
    pub fn apply_increment(&mut self, dx: &DistributedVector, comm: &dyn Communicator) -> Result<()> {
        let rank = comm.rank();
        let map = dx.map();
        let outcome = self
            .dofs
            .iter_mut()
            .filter(|dof| dof.owner == rank)
            .try_for_each(|dof| -> Result<()> {
                if let Some(id) = dof.equation_id.filter(|&id| id < map.global_size()) {
                    let increment = dx
                        .get(id)
                        .ok_or(BuilderError::IndexOutOfRange {
                            index: id,
                            size: map.global_size(),
                        })?;
                    dof.value += increment;
                }
                Ok(())
            });
        comm.agree(outcome)?;
        self.synchronize_values(comm)
    }

    /// Overwrite ghost values with the values held by their owners.
    pub fn synchronize_values(&mut self, comm: &dyn Communicator) -> Result<()> {
        self.synchronize(comm, |dof| dof.value, |dof, value| dof.value = value)
    }

    /// Overwrite ghost reactions with the reactions held by their owners.
    pub fn synchronize_reactions(&mut self, comm: &dyn Communicator) -> Result<()> {
        self.synchronize(comm, |dof| dof.reaction, |dof, reaction| dof.reaction = reaction)
    }

    fn synchronize(
        &mut self,
        comm: &dyn Communicator,
        read: fn(&Dof) -> f64,
        write: fn(&mut Dof, f64),
    ) -> Result<()> {
        let rank = comm.rank();
        let mut requests: Vec<Vec<DofKey>> = vec![Vec::new(); comm.size()];
        for dof in self.dofs.iter().filter(|dof| dof.owner != rank) {
            requests[dof.owner].push(dof.key);
        }

        let replies = comm.request_response(requests.clone(), |key| {
            self.get(key)
                .map(read)
                .ok_or(BuilderError::UnknownDof(*key))
        })?;

        for (keys, values) in requests.iter().zip(replies) {
            for (key, value) in keys.iter().zip(values) {
                write(self.get_mut(key)?, value);
            }
        }
        Ok(())
    }
}
