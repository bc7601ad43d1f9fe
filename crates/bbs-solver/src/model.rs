//! Entities, ownership and the per-partition model.
//!
//! Elements and conditions are both [`Entity`] trait objects; the builder
//! never needs to know which concrete formulation it is talking to. DOFs
//! are referenced by value ([`DofKey`]) so entities never point back into
//! the DOF registry.

use crate::comm::Rank;
use crate::constraints::MasterSlaveConstraint;
use crate::dof::{DofKey, NodeId};
use nalgebra::{DMatrix, DVector};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Entity identifier (element, condition or constraint id).
pub type EntityId = u64;

/// Local matrix and vector computed for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSystem {
    pub lhs: DMatrix<f64>,
    pub rhs: DVector<f64>,
}

impl LocalSystem {
    pub fn new(lhs: DMatrix<f64>, rhs: DVector<f64>) -> Self {
        Self { lhs, rhs }
    }

    pub fn zeros(size: usize) -> Self {
        Self {
            lhs: DMatrix::zeros(size, size),
            rhs: DVector::zeros(size),
        }
    }
}

/// Anything that contributes to the global system.
pub trait Entity: Send + Sync {
    fn id(&self) -> EntityId;

    /// Inactive entities are skipped during assembly and DOF collection.
    fn is_active(&self) -> bool {
        true
    }

    /// Ordered DOF list; the order defines the rows of the local system.
    fn dof_list(&self) -> Vec<DofKey>;

    /// Tangent matrix and load vector for the current DOF values, given in
    /// `dof_list` order.
    fn calculate_local_system(&self, values: &DVector<f64>) -> Result<LocalSystem, String>;
}

/// Partition oracle: which rank owns a DOF. Ghost copies are refreshed by
/// pulling from the owner, so the oracle never needs to list them.
pub trait DofOwnership: Send + Sync {
    fn owner(&self, key: &DofKey) -> Rank;
}

/// Every DOF belongs to the same rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformOwnership(pub Rank);

impl DofOwnership for UniformOwnership {
    fn owner(&self, _key: &DofKey) -> Rank {
        self.0
    }
}

/// Node-wise ownership table. Nodes that are not listed belong to
/// `default_rank`.
#[derive(Debug, Clone, Default)]
pub struct NodeOwnership {
    owners: HashMap<NodeId, Rank>,
    default_rank: Rank,
}

impl NodeOwnership {
    pub fn new(default_rank: Rank) -> Self {
        Self {
            default_rank,
            ..Self::default()
        }
    }

    pub fn assign(&mut self, node: NodeId, rank: Rank) -> &mut Self {
        self.owners.insert(node, rank);
        self
    }
}

impl DofOwnership for NodeOwnership {
    fn owner(&self, key: &DofKey) -> Rank {
        self.owners
            .get(&key.node)
            .copied()
            .unwrap_or(self.default_rank)
    }
}

/// The entities held by one partition, plus fixity and initial values of
/// the DOFs they reference.
#[derive(Clone)]
pub struct Model {
    elements: Vec<Arc<dyn Entity>>,
    conditions: Vec<Arc<dyn Entity>>,
    constraints: Vec<MasterSlaveConstraint>,
    fixed: HashSet<DofKey>,
    initial_values: HashMap<DofKey, f64>,
    ownership: Arc<dyn DofOwnership>,
}

impl Model {
    pub fn new(ownership: impl DofOwnership + 'static) -> Self {
        Self {
            elements: Vec::new(),
            conditions: Vec::new(),
            constraints: Vec::new(),
            fixed: HashSet::new(),
            initial_values: HashMap::new(),
            ownership: Arc::new(ownership),
        }
    }

    /// Model whose DOFs all live on rank 0.
    pub fn serial() -> Self {
        Self::new(UniformOwnership(0))
    }

    pub fn add_element(&mut self, element: Arc<dyn Entity>) -> &mut Self {
        self.elements.push(element);
        self
    }

    pub fn add_condition(&mut self, condition: Arc<dyn Entity>) -> &mut Self {
        self.conditions.push(condition);
        self
    }

    pub fn add_constraint(&mut self, constraint: MasterSlaveConstraint) -> &mut Self {
        self.constraints.push(constraint);
        self
    }

    /// Mark a DOF as Dirichlet-constrained with the given value.
    pub fn fix(&mut self, key: DofKey, value: f64) -> &mut Self {
        self.fixed.insert(key);
        self.initial_values.insert(key, value);
        self
    }

    pub fn set_initial_value(&mut self, key: DofKey, value: f64) -> &mut Self {
        self.initial_values.insert(key, value);
        self
    }

    pub fn elements(&self) -> &[Arc<dyn Entity>] {
        &self.elements
    }

    pub fn conditions(&self) -> &[Arc<dyn Entity>] {
        &self.conditions
    }

    pub fn constraints(&self) -> &[MasterSlaveConstraint] {
        &self.constraints
    }

    pub fn constraints_mut(&mut self) -> &mut [MasterSlaveConstraint] {
        &mut self.constraints
    }

    pub fn owner(&self, key: &DofKey) -> Rank {
        self.ownership.owner(key)
    }

    pub fn ownership(&self) -> &dyn DofOwnership {
        self.ownership.as_ref()
    }

    pub fn is_fixed(&self, key: &DofKey) -> bool {
        self.fixed.contains(key)
    }

    pub fn initial_value(&self, key: &DofKey) -> f64 {
        self.initial_values.get(key).copied().unwrap_or(0.0)
    }
}
