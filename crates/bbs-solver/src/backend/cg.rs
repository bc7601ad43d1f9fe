//! Distributed Jacobi-preconditioned conjugate gradient.
//!
//! Only matrix-vector products and reductions cross partition boundaries,
//! so every iteration costs one ghost import and three global sums.

use super::traits::*;
use crate::comm::Communicator;
use crate::distributed::{DistributedMatrix, DistributedVector};
use crate::error::{BuilderError, Result};
use crate::settings::LinearSolverSettings;
use nalgebra::DVector;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct ConjugateGradient {
    tolerance: f64,
    max_iterations: usize,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self::new(1e-10, 1000)
    }
}

impl ConjugateGradient {
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
        }
    }

    pub fn from_settings(settings: &LinearSolverSettings) -> Self {
        Self::new(settings.tolerance, settings.max_iteration)
    }
}

impl LinearSolver for ConjugateGradient {
    fn name(&self) -> &str {
        "jacobi-CG"
    }

    fn solve(
        &self,
        a: &DistributedMatrix,
        x: &mut DistributedVector,
        b: &DistributedVector,
        comm: &dyn Communicator,
    ) -> Result<SolveInfo> {
        let inverse_diagonal: DVector<f64> = a
            .diagonal()
            .map(|d| if d == 0.0 { 1.0 } else { 1.0 / d });
        let precondition = |r: &DistributedVector| -> Result<DistributedVector> {
            DistributedVector::from_local(r.map().clone(), r.local().component_mul(&inverse_diagonal))
        };

        let b_norm = b.norm(comm)?;
        let target = self.tolerance * if b_norm > 0.0 { b_norm } else { 1.0 };

        let mut r = b.clone();
        *r.local_mut() -= a.multiply(x, comm)?.local();
        let mut residual_norm = r.norm(comm)?;
        if residual_norm <= target {
            return Ok(self.info(0, residual_norm));
        }

        let mut z = precondition(&r)?;
        let mut p = z.clone();
        let mut rz = r.dot(&z, comm)?;

        for iteration in 1..=self.max_iterations {
            let q = a.multiply(&p, comm)?;
            let pq = p.dot(&q, comm)?;
            if pq == 0.0 {
                return Err(BuilderError::Solver(format!(
                    "conjugate gradient broke down at iteration {iteration}"
                )));
            }
            let alpha = rz / pq;
            x.local_mut().axpy(alpha, p.local(), 1.0);
            r.local_mut().axpy(-alpha, q.local(), 1.0);

            residual_norm = r.norm(comm)?;
            if residual_norm <= target {
                debug!(target: "bbs_solver", iteration, residual_norm, "conjugate gradient converged");
                return Ok(self.info(iteration, residual_norm));
            }

            z = precondition(&r)?;
            let rz_next = r.dot(&z, comm)?;
            let beta = rz_next / rz;
            rz = rz_next;
            let mut next = z.local().clone();
            next.axpy(beta, p.local(), 1.0);
            *p.local_mut() = next;
        }

        Err(BuilderError::Solver(format!(
            "conjugate gradient did not converge in {} iterations (residual {residual_norm:e})",
            self.max_iterations
        )))
    }
}

impl ConjugateGradient {
    fn info(&self, iterations: usize, residual_norm: f64) -> SolveInfo {
        SolveInfo {
            iterations,
            residual_norm: Some(residual_norm),
            solver_name: self.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SerialCommunicator, ThreadCommunicator};
    use crate::distributed::RowMap;
    use approx::assert_relative_eq;

    fn laplacian(map: &RowMap, comm: &dyn Communicator) -> DistributedMatrix {
        let n = map.global_size();
        let triplets = map
            .owned_range()
            .flat_map(|row| {
                let mut entries = vec![(row, row, 2.0)];
                if row > 0 {
                    entries.push((row, row - 1, -1.0));
                }
                if row + 1 < n {
                    entries.push((row, row + 1, -1.0));
                }
                entries
            })
            .collect();
        DistributedMatrix::from_triplets(map.clone(), n, triplets, comm).unwrap()
    }

    #[test]
    fn converges_on_serial_laplacian() {
        let comm = SerialCommunicator;
        let map = RowMap::serial(5);
        let a = laplacian(&map, &comm);
        let b = DistributedVector::from_local(map.clone(), DVector::from_element(5, 1.0)).unwrap();
        let mut x = DistributedVector::new(map);

        let info = ConjugateGradient::default().solve(&a, &mut x, &b, &comm).unwrap();
        assert!(info.iterations <= 10);
        // u_i = i (n + 1 - i) / 2 for the 1-D Laplacian with unit load
        for (i, value) in x.local().iter().enumerate() {
            let node = (i + 1) as f64;
            assert_relative_eq!(*value, node * (6.0 - node) / 2.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn partitioned_solve_matches_serial() {
        let serial = {
            let comm = SerialCommunicator;
            let map = RowMap::serial(6);
            let a = laplacian(&map, &comm);
            let b = DistributedVector::from_local(map.clone(), DVector::from_element(6, 1.0)).unwrap();
            let mut x = DistributedVector::new(map);
            ConjugateGradient::default().solve(&a, &mut x, &b, &comm).unwrap();
            x.local().clone()
        };

        let results = ThreadCommunicator::run(3, |comm| {
            let comm = comm.as_ref();
            let map = RowMap::from_local_size(2, comm).unwrap();
            let a = laplacian(&map, comm);
            let b = DistributedVector::from_local(map.clone(), DVector::from_element(2, 1.0)).unwrap();
            let mut x = DistributedVector::new(map);
            ConjugateGradient::default().solve(&a, &mut x, &b, comm).unwrap();
            x.gather(comm).unwrap()
        });

        for gathered in results {
            for (lhs, rhs) in gathered.iter().zip(serial.iter()) {
                assert_relative_eq!(*lhs, *rhs, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn iteration_limit_is_an_error() {
        let comm = SerialCommunicator;
        let map = RowMap::serial(6);
        let a = laplacian(&map, &comm);
        let b = DistributedVector::from_local(map.clone(), DVector::from_element(6, 1.0)).unwrap();
        let mut x = DistributedVector::new(map);
        let result = ConjugateGradient::new(1e-14, 1).solve(&a, &mut x, &b, &comm);
        assert!(matches!(result, Err(BuilderError::Solver(_))));
    }
}
