//! Dirichlet boundary conditions imposed in place.
//!
//! The system keeps its size. For a fixed row every off-diagonal entry and
//! the RHS are zeroed; for a free row the columns of fixed DOFs are zeroed.
//! Fixity of columns owned by other partitions is imported from their owner.

use crate::comm::Communicator;
use crate::distributed::{DistributedMatrix, DistributedVector};
use crate::dof::DofSet;
use crate::error::Result;
use crate::numbering::EquationNumbering;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

/// Policy for the value written on the diagonal of repaired rows and of
/// constrained slave rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagonalScaling {
    /// Always 1.
    NoScaling,
    /// Largest diagonal magnitude of the matrix.
    #[default]
    UseMaxDiagonal,
    /// Euclidean norm of the diagonal divided by the system size.
    UseDiagonalNorm,
    /// Value supplied by the caller.
    #[serde(alias = "defined_in_process_info")]
    DefinedExternally,
}

/// Collective: the diagonal value selected by `policy` for the matrix `a`.
/// Data-driven policies that evaluate to zero fall back to 1.
pub fn scale_factor(
    policy: DiagonalScaling,
    a: &DistributedMatrix,
    prescribed: f64,
    comm: &dyn Communicator,
) -> Result<f64> {
    let value = match policy {
        DiagonalScaling::NoScaling => 1.0,
        DiagonalScaling::UseMaxDiagonal => a.max_abs_diagonal(comm)?,
        DiagonalScaling::UseDiagonalNorm => {
            let size = a.global_rows().max(1) as f64;
            a.diagonal_norm(comm)? / size
        }
        DiagonalScaling::DefinedExternally => return Ok(prescribed),
    };
    Ok(if value == 0.0 { 1.0 } else { value })
}

/// What happened during one imposition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirichletReport {
    /// Owned rows treated as fixed.
    pub fixed_rows: usize,
    /// Owned rows whose zero diagonal was replaced by the scale factor.
    pub repaired_rows: Vec<usize>,
    pub scale_factor: f64,
}

/// Collective: impose the fixity recorded in `dofs` on `a` and `b`.
pub fn apply_dirichlet_conditions(
    a: &mut DistributedMatrix,
    b: &mut DistributedVector,
    dofs: &DofSet,
    numbering: &EquationNumbering,
    scale: f64,
    silent_warnings: bool,
    comm: &dyn Communicator,
) -> Result<DirichletReport> {
    let rank = comm.rank();
    let size = numbering.system_size();

    // DOFs fixed after numbering keep a free-range id; those are the rows
    // the matrix still holds.
    let mut fixed_flags = DistributedVector::new(numbering.free_map().clone());
    for dof in dofs.owned(rank).filter(|dof| dof.is_fixed()) {
        if let Some(id) = dof.equation_id().filter(|&id| id < size) {
            fixed_flags.set(id, 1.0)?;
        }
    }

    let columns = a.column_ids();
    let column_flags = fixed_flags.import(&columns, comm)?;
    let fixed_columns: HashSet<usize> = columns
        .into_iter()
        .zip(column_flags)
        .filter(|(_, flag)| *flag != 0.0)
        .map(|(col, _)| col)
        .collect();

    let first = a.row_map().first();
    let mut report = DirichletReport {
        scale_factor: scale,
        ..DirichletReport::default()
    };

    for (local, mut row) in a.local_mut().row_iter_mut().enumerate() {
        let global = first + local;
        let (cols, values) = row.cols_and_values_mut();
        if fixed_flags.local()[local] != 0.0 {
            report.fixed_rows += 1;
            b.local_mut()[local] = 0.0;
            for (col, value) in cols.iter().zip(values.iter_mut()) {
                if *col != global {
                    *value = 0.0;
                }
            }
        } else {
            for (col, value) in cols.iter().zip(values.iter_mut()) {
                if fixed_columns.contains(col) {
                    *value = 0.0;
                }
            }
        }
    }

    for (local, mut row) in a.local_mut().row_iter_mut().enumerate() {
        let global = first + local;
        let (cols, values) = row.cols_and_values_mut();
        let Some(position) = cols.iter().position(|&col| col == global) else {
            continue;
        };
        if values[position] != 0.0 {
            continue;
        }
        values[position] = scale;
        if values.iter().enumerate().all(|(j, v)| j == position || *v == 0.0) {
            b.local_mut()[local] = 0.0;
        }
        report.repaired_rows.push(global);
    }

    if !silent_warnings && !report.repaired_rows.is_empty() {
        warn!(
            target: "bbs_solver",
            rank,
            rows = ?report.repaired_rows,
            scale,
            "zero diagonal found; diagonal set to the scale factor"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SerialCommunicator, ThreadCommunicator};
    use crate::distributed::RowMap;
    use crate::dof::{DISPLACEMENT_X, Dof, DofKey};
    use crate::numbering::assign_equation_ids;
    use nalgebra::{DMatrix, DVector};

    fn dense_to_distributed(map: &RowMap, dense: &DMatrix<f64>, comm: &dyn Communicator) -> DistributedMatrix {
        let triplets = map
            .owned_range()
            .flat_map(|row| {
                (0..dense.ncols())
                    .filter(move |&col| dense[(row, col)] != 0.0)
                    .map(move |col| (row, col, dense[(row, col)]))
            })
            .collect();
        DistributedMatrix::from_triplets(map.clone(), dense.ncols(), triplets, comm).unwrap()
    }

    #[test]
    fn policies_pick_expected_values() {
        let comm = SerialCommunicator;
        let dense = DMatrix::from_row_slice(2, 2, &[3.0, 1.0, 1.0, -4.0]);
        let a = dense_to_distributed(&RowMap::serial(2), &dense, &comm);

        assert_eq!(scale_factor(DiagonalScaling::NoScaling, &a, 0.0, &comm).unwrap(), 1.0);
        assert_eq!(scale_factor(DiagonalScaling::UseMaxDiagonal, &a, 0.0, &comm).unwrap(), 4.0);
        assert_eq!(scale_factor(DiagonalScaling::UseDiagonalNorm, &a, 0.0, &comm).unwrap(), 2.5);
        assert_eq!(scale_factor(DiagonalScaling::DefinedExternally, &a, 7.5, &comm).unwrap(), 7.5);
    }

    #[test]
    fn zero_matrix_falls_back_to_unit_scale() {
        let comm = SerialCommunicator;
        let a = DistributedMatrix::from_triplets(RowMap::serial(2), 2, Vec::new(), &comm).unwrap();
        assert_eq!(scale_factor(DiagonalScaling::UseMaxDiagonal, &a, 0.0, &comm).unwrap(), 1.0);
    }

    #[test]
    fn policy_names_parse_from_json() {
        let parsed: DiagonalScaling = serde_json::from_str("\"use_diagonal_norm\"").unwrap();
        assert_eq!(parsed, DiagonalScaling::UseDiagonalNorm);
        let legacy: DiagonalScaling = serde_json::from_str("\"defined_in_process_info\"").unwrap();
        assert_eq!(legacy, DiagonalScaling::DefinedExternally);
        assert!(serde_json::from_str::<DiagonalScaling>("\"largest\"").is_err());
    }

    #[test]
    fn empty_row_is_repaired_with_zero_rhs() {
        let comm = SerialCommunicator;
        let mut dofs = DofSet::from_dofs([
            Dof::new(DofKey::new(1, DISPLACEMENT_X), 0),
            Dof::new(DofKey::new(2, DISPLACEMENT_X), 0),
        ]);
        let numbering = assign_equation_ids(&mut dofs, &comm).unwrap();
        let dense = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 0.0]);
        let mut a = dense_to_distributed(numbering.free_map(), &dense, &comm);
        let mut b = DistributedVector::from_local(
            numbering.free_map().clone(),
            DVector::from_vec(vec![1.0, 3.0]),
        )
        .unwrap();

        let report = apply_dirichlet_conditions(&mut a, &mut b, &dofs, &numbering, 2.0, true, &comm).unwrap();
        assert_eq!(report.repaired_rows, vec![1]);
        assert_eq!(a.get(1, 1), Some(2.0));
        assert_eq!(b.local().as_slice(), &[1.0, 0.0]);
    }

    #[test]
    fn fixed_column_owned_elsewhere_is_zeroed() {
        // Rank 0 owns ids 0 and 1, rank 1 owns id 2; id 1 is fixed after numbering.
        let results = ThreadCommunicator::run(2, |comm| {
            let comm = comm.as_ref();
            let key = |node| DofKey::new(node, DISPLACEMENT_X);
            let mut dofs = if comm.rank() == 0 {
                DofSet::from_dofs([Dof::new(key(1), 0), Dof::new(key(2), 0), Dof::new(key(3), 1)])
            } else {
                DofSet::from_dofs([Dof::new(key(2), 0), Dof::new(key(3), 1)])
            };
            let numbering = assign_equation_ids(&mut dofs, comm).unwrap();
            dofs.fix(&key(2)).unwrap();

            let dense = DMatrix::from_row_slice(3, 3, &[2.0, -1.0, 0.0, -1.0, 2.0, -1.0, 0.0, -1.0, 1.0]);
            let mut a = dense_to_distributed(numbering.free_map(), &dense, comm);
            let mut b = DistributedVector::new(numbering.free_map().clone());
            b.local_mut().fill(1.0);

            apply_dirichlet_conditions(&mut a, &mut b, &dofs, &numbering, 1.0, false, comm).unwrap();
            (a.to_dense(comm).unwrap(), b.gather(comm).unwrap())
        });

        let (a, b) = &results[0];
        assert_eq!(a, &DMatrix::from_row_slice(3, 3, &[2.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 1.0]));
        assert_eq!(b.as_slice(), &[1.0, 0.0, 1.0]);
    }
}
