//! Row-distributed sparse matrix and vector.
//!
//! Every partition stores the contiguous block of global rows it owns
//! ([`RowMap`]). Columns always carry global ids, so a matrix block is a
//! `local_rows x ncols` CSR matrix. Contributions to rows owned elsewhere are
//! buffered and shipped to their owner by `finalize`, which is collective.

use crate::comm::{Communicator, CommunicatorExt, Rank};
use crate::error::{BuilderError, Result};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::{CooMatrix, CsrMatrix, SparseEntry, SparseEntryMut};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

/// Contiguous ownership of `[0, global_size)` over the ranks of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMap {
    rank: Rank,
    offsets: Vec<usize>,
}

impl RowMap {
    /// Collective: every rank contributes the number of rows it owns.
    pub fn from_local_size(local_size: usize, comm: &dyn Communicator) -> Result<Self> {
        let sizes = comm.all_gather(local_size)?;
        Ok(Self::from_sizes(comm.rank(), &sizes))
    }

    pub fn from_sizes(rank: Rank, sizes: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        offsets.push(0);
        for size in sizes {
            offsets.push(offsets[offsets.len() - 1] + size);
        }
        Self { rank, offsets }
    }

    /// Single-partition map.
    pub fn serial(size: usize) -> Self {
        Self::from_sizes(0, &[size])
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn global_size(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    pub fn local_size(&self) -> usize {
        self.last() - self.first()
    }

    /// First owned global row.
    pub fn first(&self) -> usize {
        self.offsets[self.rank]
    }

    /// One past the last owned global row.
    pub fn last(&self) -> usize {
        self.offsets[self.rank + 1]
    }

    pub fn owned_range(&self) -> Range<usize> {
        self.first()..self.last()
    }

    pub fn range_of(&self, rank: Rank) -> Range<usize> {
        self.offsets[rank]..self.offsets[rank + 1]
    }

    pub fn owns(&self, global: usize) -> bool {
        self.owned_range().contains(&global)
    }

    pub fn owner_of(&self, global: usize) -> Option<Rank> {
        if global >= self.global_size() {
            return None;
        }
        Some(self.offsets.partition_point(|&offset| offset <= global) - 1)
    }

    pub fn local_index(&self, global: usize) -> Option<usize> {
        self.owns(global).then(|| global - self.first())
    }

    pub fn global_index(&self, local: usize) -> usize {
        self.first() + local
    }

    /// Fetch one value per global index from the rank that owns it. The
    /// owner answers with `lookup`; results come back in `indices` order.
    pub fn import<T, F>(&self, indices: &[usize], comm: &dyn Communicator, lookup: F) -> Result<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(usize) -> Result<T>,
    {
        let routed = indices
            .iter()
            .map(|&index| {
                self.owner_of(index).ok_or(BuilderError::IndexOutOfRange {
                    index,
                    size: self.global_size(),
                })
            })
            .collect::<Result<Vec<Rank>>>();
        let owners = comm.agree(routed)?;

        let mut requests: Vec<Vec<usize>> = vec![Vec::new(); self.num_ranks()];
        let mut positions: Vec<Vec<usize>> = vec![Vec::new(); self.num_ranks()];
        for (position, (&index, &owner)) in indices.iter().zip(&owners).enumerate() {
            requests[owner].push(index);
            positions[owner].push(position);
        }

        let replies = comm.request_response(requests, |&index| lookup(index))?;

        let mut slots: Vec<Option<T>> = vec![None; indices.len()];
        for (answers, places) in replies.into_iter().zip(positions) {
            for (answer, place) in answers.into_iter().zip(places) {
                slots[place] = Some(answer);
            }
        }
        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| BuilderError::Collective("import reply missing".into())))
            .collect()
    }
}

/// Route `(owner, item)` pairs to their owners and return what arrived, in
/// source-rank order.
fn exchange<T>(outgoing: Vec<(Rank, T)>, comm: &dyn Communicator) -> Result<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let mut sends: Vec<Vec<T>> = vec![Vec::new(); comm.size()];
    for (owner, item) in outgoing {
        sends[owner].push(item);
    }
    Ok(comm.all_to_all(sends)?.into_iter().flatten().collect())
}

/// Vector distributed by rows.
#[derive(Debug, Clone)]
pub struct DistributedVector {
    map: RowMap,
    values: DVector<f64>,
    pending: Vec<(usize, f64)>,
}

impl DistributedVector {
    pub fn new(map: RowMap) -> Self {
        let values = DVector::zeros(map.local_size());
        Self {
            map,
            values,
            pending: Vec::new(),
        }
    }

    pub fn from_local(map: RowMap, values: DVector<f64>) -> Result<Self> {
        if values.len() != map.local_size() {
            return Err(BuilderError::InvalidResize {
                expected: map.local_size(),
                found: values.len(),
            });
        }
        Ok(Self {
            map,
            values,
            pending: Vec::new(),
        })
    }

    pub fn map(&self) -> &RowMap {
        &self.map
    }

    pub fn global_size(&self) -> usize {
        self.map.global_size()
    }

    /// Owned entries.
    pub fn local(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn local_mut(&mut self) -> &mut DVector<f64> {
        &mut self.values
    }

    pub fn get(&self, global: usize) -> Option<f64> {
        self.map.local_index(global).map(|local| self.values[local])
    }

    pub fn set(&mut self, global: usize, value: f64) -> Result<()> {
        let local = self.owned_index(global)?;
        self.values[local] = value;
        Ok(())
    }

    fn owned_index(&self, global: usize) -> Result<usize> {
        self.map.local_index(global).ok_or(BuilderError::IndexOutOfRange {
            index: global,
            size: self.map.global_size(),
        })
    }

    /// Add to an entry, buffering it when another rank owns the row.
    pub fn assemble_add(&mut self, global: usize, value: f64) -> Result<()> {
        if let Some(local) = self.map.local_index(global) {
            self.values[local] += value;
        } else if global < self.map.global_size() {
            self.pending.push((global, value));
        } else {
            return Err(BuilderError::IndexOutOfRange {
                index: global,
                size: self.map.global_size(),
            });
        }
        Ok(())
    }

    /// Collective: ship buffered contributions to their owners and add them.
    pub fn finalize(&mut self, comm: &dyn Communicator) -> Result<()> {
        let outgoing = std::mem::take(&mut self.pending)
            .into_iter()
            .filter_map(|(global, value)| self.map.owner_of(global).map(|owner| (owner, (global, value))))
            .collect();
        for (global, value) in exchange(outgoing, comm)? {
            let local = self.owned_index(global)?;
            self.values[local] += value;
        }
        Ok(())
    }

    /// Zero owned entries and drop buffered contributions.
    pub fn set_zero(&mut self) {
        self.values.fill(0.0);
        self.pending.clear();
    }

    pub fn dot(&self, other: &DistributedVector, comm: &dyn Communicator) -> Result<f64> {
        comm.sum_all_f64(self.values.dot(&other.values))
    }

    pub fn norm(&self, comm: &dyn Communicator) -> Result<f64> {
        Ok(self.dot(self, comm)?.sqrt())
    }

    pub fn max_abs(&self, comm: &dyn Communicator) -> Result<f64> {
        comm.max_all_f64(self.values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())))
    }

    /// Values for arbitrary global indices, fetched from their owners.
    pub fn import(&self, indices: &[usize], comm: &dyn Communicator) -> Result<Vec<f64>> {
        self.map
            .import(indices, comm, |global| self.owned_index(global).map(|local| self.values[local]))
    }

    /// Every rank receives the whole vector.
    pub fn gather(&self, comm: &dyn Communicator) -> Result<DVector<f64>> {
        let blocks = comm.all_gather(self.values.as_slice().to_vec())?;
        Ok(DVector::from_vec(blocks.concat()))
    }
}

/// Square-or-rectangular matrix distributed by rows with global column ids.
#[derive(Debug, Clone)]
pub struct DistributedMatrix {
    row_map: RowMap,
    ncols: usize,
    local: CsrMatrix<f64>,
    pending: Vec<(usize, usize, f64)>,
}

impl DistributedMatrix {
    /// Zero-valued matrix over a frozen sparsity pattern.
    pub fn from_pattern(row_map: RowMap, pattern: SparsityPattern) -> Result<Self> {
        let ncols = pattern.minor_dim();
        let values = vec![0.0; pattern.nnz()];
        let local = CsrMatrix::try_from_pattern_and_values(pattern, values)
            .map_err(|e| BuilderError::Sparse(e.to_string()))?;
        Ok(Self {
            row_map,
            ncols,
            local,
            pending: Vec::new(),
        })
    }

    /// Collective: build a matrix from `(row, col, value)` triplets held by
    /// any rank. Triplets are routed to the row owner, duplicates are summed
    /// and the diagonal of every owned row is always part of the structure.
    pub fn from_triplets(
        row_map: RowMap,
        ncols: usize,
        triplets: Vec<(usize, usize, f64)>,
        comm: &dyn Communicator,
    ) -> Result<Self> {
        let routed = triplets
            .into_iter()
            .map(|(row, col, value)| {
                if col >= ncols {
                    return Err(BuilderError::IndexOutOfRange { index: col, size: ncols });
                }
                row_map
                    .owner_of(row)
                    .map(|owner| (owner, (row, col, value)))
                    .ok_or(BuilderError::IndexOutOfRange {
                        index: row,
                        size: row_map.global_size(),
                    })
            })
            .collect::<Result<Vec<_>>>();
        let outgoing = comm.agree(routed)?;
        let incoming = exchange(outgoing, comm)?;

        let first = row_map.first();
        let mut coo = CooMatrix::new(row_map.local_size(), ncols);
        for row in row_map.owned_range().filter(|&row| row < ncols) {
            coo.push(row - first, row, 0.0);
        }
        for (row, col, value) in incoming {
            coo.push(row - first, col, value);
        }

        Ok(Self {
            row_map,
            ncols,
            local: CsrMatrix::from(&coo),
            pending: Vec::new(),
        })
    }

    pub fn row_map(&self) -> &RowMap {
        &self.row_map
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn global_rows(&self) -> usize {
        self.row_map.global_size()
    }

    /// Owned block (`local_rows x ncols`).
    pub fn local(&self) -> &CsrMatrix<f64> {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut CsrMatrix<f64> {
        &mut self.local
    }

    pub fn pattern(&self) -> &SparsityPattern {
        self.local.pattern()
    }

    pub fn local_nnz(&self) -> usize {
        self.local.nnz()
    }

    /// Stored value at an owned position; `None` outside the pattern.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let local = self.row_map.local_index(row)?;
        match self.local.get_entry(local, col)? {
            SparseEntry::NonZero(value) => Some(*value),
            SparseEntry::Zero => None,
        }
    }

    fn entry_mut(&mut self, row: usize, col: usize) -> Result<&mut f64> {
        let local = self.row_map.local_index(row).ok_or(BuilderError::IndexOutOfRange {
            index: row,
            size: self.row_map.global_size(),
        })?;
        match self.local.get_entry_mut(local, col) {
            Some(SparseEntryMut::NonZero(value)) => Ok(value),
            _ => Err(BuilderError::EntryOutsideGraph { row, col }),
        }
    }

    /// Overwrite an owned, structurally present entry.
    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        *self.entry_mut(row, col)? = value;
        Ok(())
    }

    /// Add to an entry, buffering it when another rank owns the row.
    pub fn assemble_add(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        if self.row_map.owns(row) {
            *self.entry_mut(row, col)? += value;
        } else if row < self.row_map.global_size() && col < self.ncols {
            self.pending.push((row, col, value));
        } else {
            return Err(BuilderError::EntryOutsideGraph { row, col });
        }
        Ok(())
    }

    /// Collective: ship buffered contributions to their owners and add them.
    pub fn finalize(&mut self, comm: &dyn Communicator) -> Result<()> {
        let outgoing = std::mem::take(&mut self.pending)
            .into_iter()
            .filter_map(|(row, col, value)| {
                self.row_map.owner_of(row).map(|owner| (owner, (row, col, value)))
            })
            .collect();
        let incoming = exchange(outgoing, comm)?;
        let merged = incoming
            .into_iter()
            .try_for_each(|(row, col, value)| self.entry_mut(row, col).map(|entry| *entry += value));
        comm.agree(merged)
    }

    /// Zero every stored value and drop buffered contributions.
    pub fn set_zero(&mut self) {
        self.local.values_mut().fill(0.0);
        self.pending.clear();
    }

    /// Owned part of the diagonal.
    pub fn diagonal(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.row_map.local_size(),
            self.row_map
                .owned_range()
                .map(|row| self.get(row, row).unwrap_or(0.0)),
        )
    }

    pub fn max_abs_diagonal(&self, comm: &dyn Communicator) -> Result<f64> {
        let local = self.diagonal().iter().fold(0.0_f64, |acc, d| acc.max(d.abs()));
        comm.max_all_f64(local)
    }

    /// Euclidean norm of the global diagonal.
    pub fn diagonal_norm(&self, comm: &dyn Communicator) -> Result<f64> {
        let local = self.diagonal().norm_squared();
        Ok(comm.sum_all_f64(local)?.sqrt())
    }

    /// Distinct global columns referenced by the owned block.
    pub fn column_ids(&self) -> Vec<usize> {
        self.local
            .col_indices()
            .iter()
            .copied()
            .collect::<BTreeSet<usize>>()
            .into_iter()
            .collect()
    }

    /// Collective `y = A·x`; remote entries of `x` are imported.
    pub fn multiply(&self, x: &DistributedVector, comm: &dyn Communicator) -> Result<DistributedVector> {
        let columns = self.column_ids();
        let imported = x.import(&columns, comm)?;
        let lookup: HashMap<usize, f64> = columns.into_iter().zip(imported).collect();

        let mut y = DistributedVector::new(self.row_map.clone());
        for (local_row, row) in self.local.row_iter().enumerate() {
            y.values[local_row] = row
                .col_indices()
                .iter()
                .zip(row.values())
                .map(|(col, value)| value * lookup.get(col).copied().unwrap_or(0.0))
                .sum();
        }
        Ok(y)
    }

    /// Collective `y = Aᵗ·x`; requires `x` to follow the row map of `A`.
    pub fn transpose_multiply(
        &self,
        x: &DistributedVector,
        column_map: &RowMap,
        comm: &dyn Communicator,
    ) -> Result<DistributedVector> {
        let mut y = DistributedVector::new(column_map.clone());
        let scattered = self
            .local
            .row_iter()
            .zip(x.local().iter())
            .try_for_each(|(row, &xi)| {
                row.col_indices()
                    .iter()
                    .zip(row.values())
                    .try_for_each(|(&col, &value)| y.assemble_add(col, value * xi))
            });
        comm.agree(scattered)?;
        y.finalize(comm)?;
        Ok(y)
    }

    /// Sparse rows `(col, value)` for arbitrary global rows, fetched from
    /// their owners.
    pub fn import_rows(
        &self,
        rows: &[usize],
        comm: &dyn Communicator,
    ) -> Result<HashMap<usize, Vec<(usize, f64)>>> {
        let fetched = self.row_map.import(rows, comm, |global| {
            let local = self.row_map.local_index(global).ok_or(BuilderError::IndexOutOfRange {
                index: global,
                size: self.row_map.global_size(),
            })?;
            let row = self
                .local
                .get_row(local)
                .ok_or(BuilderError::IndexOutOfRange { index: global, size: self.row_map.global_size() })?;
            Ok(row
                .col_indices()
                .iter()
                .copied()
                .zip(row.values().iter().copied())
                .collect::<Vec<(usize, f64)>>())
        })?;
        Ok(rows.iter().copied().zip(fetched).collect())
    }

    /// Owned entries as global triplets.
    pub fn local_triplets(&self) -> Vec<(usize, usize, f64)> {
        let first = self.row_map.first();
        self.local
            .triplet_iter()
            .map(|(row, col, value)| (row + first, col, *value))
            .collect()
    }

    /// Every rank receives every stored entry.
    pub fn gather_triplets(&self, comm: &dyn Communicator) -> Result<Vec<(usize, usize, f64)>> {
        Ok(comm.all_gather(self.local_triplets())?.concat())
    }

    /// Collective dense copy of the whole matrix, on every rank.
    pub fn to_dense(&self, comm: &dyn Communicator) -> Result<DMatrix<f64>> {
        let mut dense = DMatrix::zeros(self.row_map.global_size(), self.ncols);
        for (row, col, value) in self.gather_triplets(comm)? {
            dense[(row, col)] += value;
        }
        Ok(dense)
    }
}
