//! Partitioned runs on the threaded process group.
//!
//! Every test runs the same bar chain on one partition and on several, and
//! checks that the partitioned result is the single-partition result.

use approx::assert_relative_eq;
use bbs_solver::{
    Bar1D, BlockBuilderAndSolver, BuilderError, BuilderSettings, CommunicatorExt,
    ConjugateGradient, DISPLACEMENT_X, DirectSolver, DofKey, Entity, LinearSolver, Model,
    NodeOwnership, PointLoad, ResidualBasedStaticScheme, ThreadCommunicator,
};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

const E: f64 = 100.0;
const AREA: f64 = 1.0;
const FORCE: f64 = 10.0;

fn key(node: u64) -> DofKey {
    DofKey::new(node, DISPLACEMENT_X)
}

/// Partition owning node `node` of a chain of `elements` bars split over
/// `partitions` contiguous blocks.
fn node_owner(node: u64, elements: u64, partitions: usize) -> usize {
    let element = node.min(elements) - 1;
    (element as usize * partitions) / elements as usize
}

/// The share of a fixed-free bar chain held by `rank`: each bar goes to the
/// owner of its first node, the tip load to the owner of the last node.
fn bar_chain(rank: usize, partitions: usize, elements: u64) -> Model {
    let mut ownership = NodeOwnership::new(0);
    for node in 1..=elements + 1 {
        ownership.assign(node, node_owner(node, elements, partitions));
    }
    let mut model = Model::new(ownership);
    for e in 1..=elements {
        if node_owner(e, elements, partitions) == rank {
            let x = (e - 1) as f64;
            model.add_element(Arc::new(Bar1D::new(e, [e, e + 1], [x, x + 1.0], E, AREA)));
        }
    }
    let tip = elements + 1;
    if node_owner(tip, elements, partitions) == rank {
        model.add_condition(Arc::new(PointLoad::new(1000, tip, DISPLACEMENT_X, FORCE)));
    }
    if node_owner(1, elements, partitions) == rank {
        model.fix(key(1), 0.0);
    }
    model
}

struct Run {
    matrix: DMatrix<f64>,
    rhs: DVector<f64>,
    owned_values: Vec<(u64, f64)>,
    owned_reactions: Vec<(u64, f64)>,
}

fn solve_chain<S>(partitions: usize, elements: u64, solver: S) -> Vec<Run>
where
    S: Fn() -> Box<dyn LinearSolver> + Sync,
{
    ThreadCommunicator::run(partitions, |comm| {
        let scheme = ResidualBasedStaticScheme;
        let model = bar_chain(comm.rank(), partitions, elements);
        let settings = BuilderSettings {
            calculate_reactions: true,
            ..Default::default()
        };
        let mut builder = BlockBuilderAndSolver::new(settings, solver(), Arc::clone(&comm)).unwrap();
        let mut system = builder.set_up(&scheme, &model).unwrap();

        builder.build(&scheme, &model, &mut system).unwrap();
        let matrix = system.a.to_dense(comm.as_ref()).unwrap();
        let rhs = system.b.gather(comm.as_ref()).unwrap();

        builder.solve_linear_step(&scheme, &model, &mut system).unwrap();
        let rank = comm.rank();
        Run {
            matrix,
            rhs,
            owned_values: builder
                .dofs()
                .owned(rank)
                .map(|dof| (dof.key().node, dof.value()))
                .collect(),
            owned_reactions: builder
                .dofs()
                .owned(rank)
                .map(|dof| (dof.key().node, dof.reaction()))
                .collect(),
        }
    })
}

fn merged(runs: &[Run], pick: fn(&Run) -> &Vec<(u64, f64)>) -> Vec<(u64, f64)> {
    let mut all: Vec<(u64, f64)> = runs.iter().flat_map(|run| pick(run).iter().copied()).collect();
    all.sort_by_key(|(node, _)| *node);
    all
}

#[test]
fn shared_row_is_bit_identical_to_one_partition() {
    // Node 2 is shared: rank 0 holds bar 1, rank 1 holds bar 2.
    let serial = solve_chain(1, 2, || Box::new(DirectSolver));
    let split = solve_chain(2, 2, || Box::new(DirectSolver));

    for run in &split {
        assert_eq!(run.matrix, serial[0].matrix);
        assert_eq!(run.rhs, serial[0].rhs);
    }
    assert_eq!(split[0].matrix[(0, 0)], 2.0 * E * AREA);
    assert_eq!(merged(&split, |r| &r.owned_values), merged(&serial, |r| &r.owned_values));
}

#[test]
fn partitioned_solve_matches_serial_solve() {
    let elements = 9;
    let serial = solve_chain(1, elements, || Box::new(DirectSolver));
    let serial_values = merged(&serial, |r| &r.owned_values);

    for partitions in [2, 3] {
        for iterative in [false, true] {
            let runs = solve_chain(partitions, elements, || -> Box<dyn LinearSolver> {
                if iterative {
                    Box::new(ConjugateGradient::new(1e-12, 200))
                } else {
                    Box::new(DirectSolver)
                }
            });
            let values = merged(&runs, |r| &r.owned_values);
            assert_eq!(values.len(), serial_values.len());
            for ((node, value), (serial_node, serial_value)) in values.iter().zip(&serial_values) {
                assert_eq!(node, serial_node);
                assert_relative_eq!(*value, *serial_value, epsilon = 1e-9);
                // u(x) = F·x / (E·A)
                let x = (*node - 1) as f64;
                assert_relative_eq!(*value, FORCE * x / (E * AREA), epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn reactions_follow_the_sign_convention_on_every_partition() {
    let runs = solve_chain(3, 6, || Box::new(DirectSolver));
    let reactions = merged(&runs, |r| &r.owned_reactions);

    let (support, reaction) = reactions[0];
    assert_eq!(support, 1);
    assert_relative_eq!(reaction, -FORCE, epsilon = 1e-9);
    for (_, reaction) in &reactions[1..] {
        assert_relative_eq!(*reaction, 0.0, epsilon = 1e-9);
    }
}

#[test]
fn equation_ids_partition_the_free_range() {
    let partitions = 3;
    let elements = 7;
    let results = ThreadCommunicator::run(partitions, |comm| {
        let scheme = ResidualBasedStaticScheme;
        let model = bar_chain(comm.rank(), partitions, elements);
        let mut builder =
            BlockBuilderAndSolver::new(BuilderSettings::default(), Box::new(DirectSolver), Arc::clone(&comm))
                .unwrap();
        builder.set_up(&scheme, &model).unwrap();

        let numbering = builder.numbering().unwrap().clone();
        let range = numbering.local_range();
        let owned_free: Vec<usize> = builder
            .dofs()
            .owned(comm.rank())
            .filter(|dof| !dof.is_fixed())
            .filter_map(|dof| dof.equation_id())
            .collect();
        let in_local_range = owned_free.iter().all(|id| range.contains(id));

        // Ghosts agree with their owners.
        let ghost_ids: Vec<(u64, usize)> = builder
            .dofs()
            .iter()
            .filter(|dof| dof.owner() != comm.rank())
            .filter_map(|dof| dof.equation_id().map(|id| (dof.key().node, id)))
            .collect();
        let owned_ids: Vec<(u64, usize)> = builder
            .dofs()
            .owned(comm.rank())
            .filter_map(|dof| dof.equation_id().map(|id| (dof.key().node, id)))
            .collect();
        let all_owned: Vec<(u64, usize)> = comm.all_gather(owned_ids).unwrap().concat();
        let ghosts_agree = ghost_ids.iter().all(|ghost| all_owned.contains(ghost));
        (owned_free, in_local_range && ghosts_agree, numbering.system_size(), numbering.fixed_size())
    });

    assert!(results.iter().all(|(_, consistent, _, _)| *consistent));
    let size = results[0].2;
    assert_eq!(size, elements as usize);
    assert_eq!(results[0].3, 1);
    let mut ids: Vec<usize> = results.iter().flat_map(|(ids, _, _, _)| ids.clone()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..size).collect::<Vec<_>>());
}

#[test]
fn sparsity_graph_covers_every_assembled_entry() {
    let partitions = 2;
    let elements = 5;
    ThreadCommunicator::run(partitions, |comm| {
        let scheme = ResidualBasedStaticScheme;
        let rank = comm.rank();
        let mut model = bar_chain(rank, partitions, elements);
        // An inactive bar still reserves its coupling.
        let spare = Arc::new(Bar1D::new(50, [2, 4], [1.0, 3.0], E, AREA));
        spare.set_active(false);
        if rank == 0 {
            model.add_element(spare.clone());
        }
        let mut builder =
            BlockBuilderAndSolver::new(BuilderSettings::default(), Box::new(DirectSolver), Arc::clone(&comm))
                .unwrap();
        let mut system = builder.set_up(&scheme, &model).unwrap();
        builder.build(&scheme, &model, &mut system).unwrap();

        let size = builder.equation_system_size();
        let mut couplings = Vec::new();
        for entity in model.elements().iter().chain(model.conditions()) {
            let ids: Vec<usize> = entity
                .dof_list()
                .iter()
                .filter_map(|key| builder.dofs().equation_id(key).ok())
                .filter(|&id| id < size)
                .collect();
            for &row in &ids {
                for &col in &ids {
                    couplings.push((row, col));
                }
            }
        }
        let couplings: Vec<(usize, usize)> = comm.all_gather(couplings).unwrap().concat();
        for (row, col) in couplings {
            if system.a.row_map().owns(row) {
                assert!(system.a.get(row, col).is_some(), "({row}, {col}) missing from the graph");
            }
        }
        for row in system.a.row_map().owned_range() {
            assert!(system.a.get(row, row).is_some());
        }

        // Nodes 2 and 4 are coupled only through the inactive bar; the
        // entry exists and holds zero.
        if rank == 0 {
            let row = builder.dofs().equation_id(&key(2)).unwrap();
            let col = builder.dofs().equation_id(&key(4)).unwrap();
            assert_eq!(system.a.get(row, col), Some(0.0));
        }
    });
}

#[test]
fn scheme_failure_aborts_every_partition() {
    struct Exploding;

    impl Entity for Exploding {
        fn id(&self) -> u64 {
            666
        }

        fn dof_list(&self) -> Vec<DofKey> {
            vec![key(3)]
        }

        fn calculate_local_system(
            &self,
            _values: &DVector<f64>,
        ) -> Result<bbs_solver::LocalSystem, String> {
            Err("constitutive update failed".to_string())
        }
    }

    let results = ThreadCommunicator::run(2, |comm| {
        let scheme = ResidualBasedStaticScheme;
        let rank = comm.rank();
        let mut model = bar_chain(rank, 2, 4);
        if rank == 1 {
            model.add_condition(Arc::new(Exploding));
        }
        let mut builder =
            BlockBuilderAndSolver::new(BuilderSettings::default(), Box::new(DirectSolver), Arc::clone(&comm))
                .unwrap();
        let mut system = builder.set_up(&scheme, &model).unwrap();
        builder.build_and_solve(&scheme, &model, &mut system).err()
    });

    assert!(matches!(results[0], Some(BuilderError::RemoteFailure { failed: 1 })));
    assert!(matches!(results[1], Some(BuilderError::Scheme { entity: 666, .. })));
}
