//! Direct backend using nalgebra.
//!
//! The distributed system is gathered on every partition, reconstructed as a
//! dense matrix and factorized with LU. Every partition then keeps the rows
//! it owns. Suitable for small-to-medium problems (up to ~10,000 DOFs).

use super::traits::*;
use crate::comm::Communicator;
use crate::distributed::{DistributedMatrix, DistributedVector};
use crate::error::{BuilderError, Result};
use nalgebra::DMatrix;

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectSolver;

impl LinearSolver for DirectSolver {
    fn name(&self) -> &str {
        "nalgebra-LU"
    }

    fn solve(
        &self,
        a: &DistributedMatrix,
        x: &mut DistributedVector,
        b: &DistributedVector,
        comm: &dyn Communicator,
    ) -> Result<SolveInfo> {
        let n = a.global_rows();

        // Reconstruct dense matrix from the gathered triplets
        let mut k = DMatrix::zeros(n, n);
        for (r, c, value) in a.gather_triplets(comm)? {
            k[(r, c)] += value;
        }
        let force = b.gather(comm)?;

        // LU decomposition and solve
        let u = k
            .lu()
            .solve(&force)
            .ok_or_else(|| BuilderError::Solver("Singular matrix in LU decomposition".into()))?;

        let first = x.map().first();
        for (local, value) in x.local_mut().iter_mut().enumerate() {
            *value = u[first + local];
        }

        Ok(SolveInfo {
            iterations: 1,
            residual_norm: None,
            solver_name: self.name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SerialCommunicator, ThreadCommunicator};
    use crate::distributed::RowMap;
    use nalgebra::DVector;

    #[test]
    fn direct_solve_trivial() {
        // Solve: [2 0; 0 3] * [x; y] = [4; 9]
        let comm = SerialCommunicator;
        let map = RowMap::serial(2);
        let a = DistributedMatrix::from_triplets(map.clone(), 2, vec![(0, 0, 2.0), (1, 1, 3.0)], &comm).unwrap();
        let b = DistributedVector::from_local(map.clone(), DVector::from_vec(vec![4.0, 9.0])).unwrap();
        let mut x = DistributedVector::new(map);

        let info = DirectSolver.solve(&a, &mut x, &b, &comm).unwrap();
        assert!((x.local()[0] - 2.0).abs() < 1e-12);
        assert!((x.local()[1] - 3.0).abs() < 1e-12);
        assert_eq!(info.solver_name, "nalgebra-LU");
    }

    #[test]
    fn direct_solve_split_3x3() {
        // K = [4 -1 0; -1 4 -1; 0 -1 4], F = [1; 2; 1], rows split 1 + 2
        let results = ThreadCommunicator::run(2, |comm| {
            let comm = comm.as_ref();
            let map = RowMap::from_local_size(1 + comm.rank(), comm).unwrap();
            let k = DMatrix::from_row_slice(3, 3, &[4.0, -1.0, 0.0, -1.0, 4.0, -1.0, 0.0, -1.0, 4.0]);
            let triplets = map
                .owned_range()
                .flat_map(|r| (0..3).map(move |c| (r, c)))
                .filter(|&(r, c)| k[(r, c)] != 0.0)
                .map(|(r, c)| (r, c, k[(r, c)]))
                .collect();
            let a = DistributedMatrix::from_triplets(map.clone(), 3, triplets, comm).unwrap();
            let f = [1.0, 2.0, 1.0];
            let b = DistributedVector::from_local(
                map.clone(),
                DVector::from_iterator(map.local_size(), map.owned_range().map(|r| f[r])),
            )
            .unwrap();
            let mut x = DistributedVector::new(map);
            DirectSolver.solve(&a, &mut x, &b, comm).unwrap();
            let u = x.gather(comm).unwrap();
            &k * u
        });

        for f_check in results {
            for (i, expected) in [1.0, 2.0, 1.0].iter().enumerate() {
                assert!(
                    (f_check[i] - expected).abs() < 1e-10,
                    "Residual too large at DOF {}",
                    i
                );
            }
        }
    }

    #[test]
    fn singular_matrix_is_reported() {
        let comm = SerialCommunicator;
        let map = RowMap::serial(2);
        let a = DistributedMatrix::from_triplets(map.clone(), 2, vec![(0, 0, 1.0)], &comm).unwrap();
        let b = DistributedVector::new(map.clone());
        let mut x = DistributedVector::new(map);
        assert!(matches!(
            DirectSolver.solve(&a, &mut x, &b, &comm),
            Err(BuilderError::Solver(_))
        ));
    }
}
