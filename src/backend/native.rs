//! Reference backend built on `nalgebra-sparse`.
//!
//! Matrices are staged as triplets and frozen into CSR on finalize; writes to
//! rows owned by other ranks travel to their owners over the communicator at
//! that point. The solver is a dense LU factorization and is only available
//! in a single-rank group; multi-rank deployments are expected to bind
//! [`LinearBackend`](crate::backend::LinearBackend) to an external solver
//! library instead.

use eyre::{bail, eyre};
use itertools::izip;
use log::debug;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use olivine_comm::{Communicator, MessageTag, SendHandle};

use crate::backend::{DistributedMatrix, DistributedVector, LinearBackend, Preallocation};
use crate::numbering::EquationOwnership;
use crate::Real;

const MATRIX_INDEX_TAG: MessageTag = MessageTag(10);
const MATRIX_VALUE_TAG: MessageTag = MessageTag(11);
const VECTOR_EQUATION_TAG: MessageTag = MessageTag(12);
const VECTOR_VALUE_TAG: MessageTag = MessageTag(13);
const VECTOR_MODE_TAG: MessageTag = MessageTag(14);

const MODE_ADD: u8 = 0;
const MODE_INSERT: u8 = 1;

/// Backend over in-process storage, parameterized by the group it runs in.
#[derive(Debug, Clone)]
pub struct NativeBackend<C> {
    comm: C,
}

impl<C> NativeBackend<C> {
    pub fn new(comm: C) -> Self {
        Self { comm }
    }
}

/// A triplet-staged sparse matrix frozen into CSR on finalize.
pub struct NativeMatrix<T, C> {
    comm: C,
    row_ownership: EquationOwnership,
    global_cols: usize,
    // (local row, global col, value) for rows this rank owns
    owned: Vec<(usize, usize, T)>,
    // interleaved (row, col) pairs and values, per destination rank
    staged: Vec<(Vec<u64>, Vec<T>)>,
    csr: Option<CsrMatrix<T>>,
}

impl<T: Real, C> NativeMatrix<T, C> {
    /// The frozen locally owned row block, `local_rows` by `global_cols`.
    /// Available once the matrix is finalized.
    pub fn owned_block(&self) -> Option<&CsrMatrix<T>> {
        self.csr.as_ref()
    }
}

impl<T, C> DistributedMatrix<T> for NativeMatrix<T, C>
where
    T: Real + Send + 'static,
    C: Communicator,
{
    fn global_rows(&self) -> usize {
        self.row_ownership.num_equations()
    }

    fn global_cols(&self) -> usize {
        self.global_cols
    }

    fn local_rows(&self) -> usize {
        self.row_ownership.num_owned()
    }

    fn add(&mut self, row: usize, col: usize, value: T) -> eyre::Result<()> {
        if self.csr.is_some() {
            bail!("cannot write to a finalized matrix");
        }
        if row >= self.global_rows() || col >= self.global_cols {
            bail!(
                "entry ({}, {}) outside a {} by {} matrix",
                row,
                col,
                self.global_rows(),
                self.global_cols
            );
        }
        match self.row_ownership.local_offset(row) {
            Some(local_row) => self.owned.push((local_row, col, value)),
            None => {
                let owner = self.row_ownership.owning_rank(row);
                let (indices, values) = &mut self.staged[owner];
                indices.push(row as u64);
                indices.push(col as u64);
                values.push(value);
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> eyre::Result<()> {
        if self.csr.is_some() {
            bail!("matrix finalized twice");
        }

        if self.comm.size() > 1 {
            let staged = std::mem::take(&mut self.staged);
            let send_counts: Vec<usize> = staged.iter().map(|(_, values)| values.len()).collect();
            let recv_counts = self.comm.all_to_all_counts(&send_counts)?;

            let mut sends = Vec::new();
            for (peer, (indices, values)) in staged.into_iter().enumerate() {
                if values.is_empty() {
                    continue;
                }
                sends.push(self.comm.isend(indices, peer, MATRIX_INDEX_TAG)?);
                sends.push(self.comm.isend(values, peer, MATRIX_VALUE_TAG)?);
            }

            for (peer, &count) in recv_counts.iter().enumerate() {
                if peer == self.comm.rank() || count == 0 {
                    continue;
                }
                let indices: Vec<u64> = self.comm.recv(peer, MATRIX_INDEX_TAG, 2 * count)?;
                let values: Vec<T> = self.comm.recv(peer, MATRIX_VALUE_TAG, count)?;
                for (pair, value) in indices.chunks_exact(2).zip(values) {
                    let (row, col) = (pair[0] as usize, pair[1] as usize);
                    let local_row = self.row_ownership.local_offset(row).ok_or_else(|| {
                        eyre!("rank {} routed row {} to the wrong owner", peer, row)
                    })?;
                    self.owned.push((local_row, col, value));
                }
            }

            for send in sends {
                send.wait()?;
            }
        }

        let mut coo = CooMatrix::new(self.local_rows(), self.global_cols);
        for &(row, col, value) in &self.owned {
            coo.push(row, col, value);
        }
        debug!(
            "freezing {} by {} row block from {} staged entries",
            self.local_rows(),
            self.global_cols,
            self.owned.len()
        );
        self.owned = Vec::new();
        self.csr = Some(CsrMatrix::from(&coo));
        Ok(())
    }
}

/// A row-partitioned vector with immediately applied local writes and staged
/// off-rank writes.
pub struct NativeVector<T, C> {
    comm: C,
    ownership: EquationOwnership,
    values: Vec<T>,
    // per destination rank: equations, values, add/insert modes
    staged: Vec<(Vec<u64>, Vec<T>, Vec<u8>)>,
}

impl<T: Real, C> NativeVector<T, C> {
    fn stage(&mut self, equation: usize, value: T, mode: u8) {
        let owner = self.ownership.owning_rank(equation);
        let (equations, values, modes) = &mut self.staged[owner];
        equations.push(equation as u64);
        values.push(value);
        modes.push(mode);
    }

    fn check_bounds(&self, equation: usize) -> eyre::Result<()> {
        if equation >= self.ownership.num_equations() {
            bail!(
                "equation {} outside a vector of {} entries",
                equation,
                self.ownership.num_equations()
            );
        }
        Ok(())
    }

    pub fn owned_values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }
}

impl<T, C> DistributedVector<T> for NativeVector<T, C>
where
    T: Real + Send + 'static,
    C: Communicator,
{
    fn global_size(&self) -> usize {
        self.ownership.num_equations()
    }

    fn local_size(&self) -> usize {
        self.values.len()
    }

    fn add(&mut self, equation: usize, value: T) -> eyre::Result<()> {
        self.check_bounds(equation)?;
        match self.ownership.local_offset(equation) {
            Some(offset) => self.values[offset] += value,
            None => self.stage(equation, value, MODE_ADD),
        }
        Ok(())
    }

    fn insert(&mut self, equation: usize, value: T) -> eyre::Result<()> {
        self.check_bounds(equation)?;
        match self.ownership.local_offset(equation) {
            Some(offset) => self.values[offset] = value,
            None => self.stage(equation, value, MODE_INSERT),
        }
        Ok(())
    }

    fn zero(&mut self) {
        self.values.fill(T::zero());
        for (equations, values, modes) in &mut self.staged {
            equations.clear();
            values.clear();
            modes.clear();
        }
    }

    fn finalize(&mut self) -> eyre::Result<()> {
        if self.comm.size() == 1 {
            return Ok(());
        }

        let staged = std::mem::take(&mut self.staged);
        self.staged = vec![Default::default(); self.comm.size()];
        let send_counts: Vec<usize> = staged.iter().map(|(eqs, _, _)| eqs.len()).collect();
        let recv_counts = self.comm.all_to_all_counts(&send_counts)?;

        let mut sends = Vec::new();
        for (peer, (equations, values, modes)) in staged.into_iter().enumerate() {
            if equations.is_empty() {
                continue;
            }
            sends.push(self.comm.isend(equations, peer, VECTOR_EQUATION_TAG)?);
            sends.push(self.comm.isend(values, peer, VECTOR_VALUE_TAG)?);
            sends.push(self.comm.isend(modes, peer, VECTOR_MODE_TAG)?);
        }

        for (peer, &count) in recv_counts.iter().enumerate() {
            if peer == self.comm.rank() || count == 0 {
                continue;
            }
            let equations: Vec<u64> = self.comm.recv(peer, VECTOR_EQUATION_TAG, count)?;
            let values: Vec<T> = self.comm.recv(peer, VECTOR_VALUE_TAG, count)?;
            let modes: Vec<u8> = self.comm.recv(peer, VECTOR_MODE_TAG, count)?;
            for (equation, value, mode) in izip!(equations, values, modes) {
                let offset = self
                    .ownership
                    .local_offset(equation as usize)
                    .ok_or_else(|| {
                        eyre!("rank {} routed equation {} to the wrong owner", peer, equation)
                    })?;
                match mode {
                    MODE_ADD => self.values[offset] += value,
                    MODE_INSERT => self.values[offset] = value,
                    other => bail!("unknown vector write mode {}", other),
                }
            }
        }

        for send in sends {
            send.wait()?;
        }
        Ok(())
    }

    fn owned_values(&self) -> &[T] {
        &self.values
    }
}

impl<T, C> LinearBackend<T> for NativeBackend<C>
where
    T: Real + Send + 'static,
    C: Communicator + Clone,
{
    type Matrix = NativeMatrix<T, C>;
    type Vector = NativeVector<T, C>;

    fn create_matrix(
        &self,
        rows: &EquationOwnership,
        cols: &EquationOwnership,
        preallocation: Preallocation<'_>,
    ) -> eyre::Result<Self::Matrix> {
        let capacity = match preallocation {
            Preallocation::PerRow(pattern) => pattern.local_total(),
            Preallocation::Uniform(per_row) => per_row * rows.num_owned(),
        };
        Ok(NativeMatrix {
            comm: self.comm.clone(),
            row_ownership: rows.clone(),
            global_cols: cols.num_equations(),
            owned: Vec::with_capacity(capacity),
            staged: vec![Default::default(); self.comm.size()],
            csr: None,
        })
    }

    fn create_vector(&self, rows: &EquationOwnership) -> eyre::Result<Self::Vector> {
        Ok(NativeVector {
            comm: self.comm.clone(),
            ownership: rows.clone(),
            values: vec![T::zero(); rows.num_owned()],
            staged: vec![Default::default(); self.comm.size()],
        })
    }

    fn solve(
        &self,
        matrix: &Self::Matrix,
        rhs: &Self::Vector,
        solution: &mut Self::Vector,
    ) -> eyre::Result<()> {
        if self.comm.size() != 1 {
            bail!("the bundled backend only solves within a single-rank group");
        }
        let csr = matrix
            .csr
            .as_ref()
            .ok_or_else(|| eyre!("the system matrix was not finalized before the solve"))?;
        if csr.nrows() != csr.ncols() {
            bail!("cannot solve a {} by {} system", csr.nrows(), csr.ncols());
        }
        if rhs.local_size() != csr.nrows() || solution.local_size() != csr.ncols() {
            bail!(
                "vector sizes {} and {} do not match a {} by {} matrix",
                rhs.local_size(),
                solution.local_size(),
                csr.nrows(),
                csr.ncols()
            );
        }

        let mut dense = DMatrix::zeros(csr.nrows(), csr.ncols());
        for (i, j, value) in csr.triplet_iter() {
            dense[(i, j)] += *value;
        }
        let b = DVector::from_column_slice(rhs.owned_values());
        let x = dense
            .lu()
            .solve(&b)
            .ok_or_else(|| eyre!("the system matrix is singular"))?;
        solution.owned_values_mut().copy_from_slice(x.as_slice());
        Ok(())
    }
}
