//! Sparsity graph of the global matrix.
//!
//! The graph is a per-row set of global column ids for the rows this
//! partition owns. Rows owned elsewhere are buffered and merged into their
//! owner during [`SparsityGraph::global_assemble`], after which the graph is
//! frozen and only good for turning into a CSR pattern.

use crate::comm::{Communicator, CommunicatorExt};
use crate::distributed::RowMap;
use crate::error::{BuilderError, Result};
use nalgebra_sparse::pattern::SparsityPattern;

#[derive(Debug, Clone)]
pub struct SparsityGraph {
    row_map: RowMap,
    ncols: usize,
    rows: Vec<Vec<usize>>,
    pending: Vec<(usize, Vec<usize>)>,
    frozen: bool,
}

impl SparsityGraph {
    /// Empty graph over the owned rows of `row_map`; every row reserves
    /// `guess_row_size` columns.
    pub fn new(row_map: RowMap, ncols: usize, guess_row_size: usize) -> Self {
        let rows = (0..row_map.local_size())
            .map(|_| Vec::with_capacity(guess_row_size))
            .collect();
        Self {
            row_map,
            ncols,
            rows,
            pending: Vec::new(),
            frozen: false,
        }
    }

    pub fn row_map(&self) -> &RowMap {
        &self.row_map
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Couple every id of an equation-id list with every other one. Ids
    /// outside `[0, ncols)` (fixed DOFs) are left out.
    pub fn insert_block(&mut self, ids: &[usize]) -> Result<()> {
        let kept: Vec<usize> = ids.iter().copied().filter(|&id| id < self.ncols).collect();
        for &row in &kept {
            self.insert_row(row, &kept)?;
        }
        Ok(())
    }

    /// Add `cols` to the column set of `row`.
    pub fn insert_row(&mut self, row: usize, cols: &[usize]) -> Result<()> {
        if self.frozen {
            return Err(BuilderError::GraphFrozen);
        }
        if let Some(&col) = cols.iter().find(|&&col| col >= self.ncols) {
            return Err(BuilderError::IndexOutOfRange {
                index: col,
                size: self.ncols,
            });
        }
        match self.row_map.local_index(row) {
            Some(local) => self.rows[local].extend_from_slice(cols),
            None if row < self.row_map.global_size() => self.pending.push((row, cols.to_vec())),
            None => {
                return Err(BuilderError::IndexOutOfRange {
                    index: row,
                    size: self.row_map.global_size(),
                });
            }
        }
        Ok(())
    }

    /// Collective: merge buffered rows into their owners, add the diagonal
    /// of every owned row, sort, deduplicate and freeze.
    pub fn global_assemble(&mut self, comm: &dyn Communicator) -> Result<()> {
        let ready = if self.frozen {
            Err(BuilderError::GraphFrozen)
        } else {
            Ok(())
        };
        comm.agree(ready)?;

        let mut sends: Vec<Vec<(usize, Vec<usize>)>> = vec![Vec::new(); comm.size()];
        for (row, cols) in std::mem::take(&mut self.pending) {
            if let Some(owner) = self.row_map.owner_of(row) {
                sends[owner].push((row, cols));
            }
        }
        let incoming = comm.all_to_all(sends)?;

        for (row, cols) in incoming.into_iter().flatten() {
            if let Some(local) = self.row_map.local_index(row) {
                self.rows[local].extend(cols);
            }
        }

        let first = self.row_map.first();
        for (local, cols) in self.rows.iter_mut().enumerate() {
            let row = first + local;
            if row < self.ncols {
                cols.push(row);
            }
            cols.sort_unstable();
            cols.dedup();
        }
        self.frozen = true;
        Ok(())
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.row(row).is_some_and(|cols| {
            if self.frozen {
                cols.binary_search(&col).is_ok()
            } else {
                cols.contains(&col)
            }
        })
    }

    pub fn row(&self, row: usize) -> Option<&[usize]> {
        self.row_map
            .local_index(row)
            .map(|local| self.rows[local].as_slice())
    }

    pub fn local_nnz(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Largest row of the whole graph; used for diagnostics.
    pub fn max_row_size(&self, comm: &dyn Communicator) -> Result<usize> {
        let local = self.rows.iter().map(Vec::len).max().unwrap_or(0);
        Ok(comm.all_gather(local)?.into_iter().max().unwrap_or(0))
    }

    /// Consume a frozen graph and return the CSR pattern of the owned rows.
    pub fn into_pattern(self) -> Result<(RowMap, SparsityPattern)> {
        if !self.frozen {
            return Err(BuilderError::NotInitialized("into_pattern"));
        }
        let mut offsets = Vec::with_capacity(self.rows.len() + 1);
        offsets.push(0);
        let mut indices = Vec::with_capacity(self.local_nnz());
        for cols in &self.rows {
            indices.extend_from_slice(cols);
            offsets.push(indices.len());
        }
        let pattern =
            SparsityPattern::try_from_offsets_and_indices(self.rows.len(), self.ncols, offsets, indices)
                .map_err(|e| BuilderError::Sparse(e.to_string()))?;
        Ok((self.row_map, pattern))
    }
}
