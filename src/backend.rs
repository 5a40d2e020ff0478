//! The linear algebra backend seam.
//!
//! Assembly scatters element contributions into distributed matrices and
//! vectors and asks for linear solves, but never owns the storage formats or
//! the solver. Those live behind [`LinearBackend`], so the same assembly core
//! runs against the bundled [`native`] backend or a binding to an external
//! solver library.

use crate::numbering::EquationOwnership;
use crate::sparsity::NonzeroPattern;
use crate::Real;

pub mod native;

/// Row preallocation hint for matrix creation.
#[derive(Debug, Clone, Copy)]
pub enum Preallocation<'a> {
    /// Per-owned-row counts from the sparsity estimator.
    PerRow(&'a NonzeroPattern),
    /// A flat nonzeros-per-row bound, used when no estimate is available.
    Uniform(usize),
}

/// A row-partitioned vector.
///
/// Entries are addressed by global equation index. Writes to equations owned
/// by other ranks are legal and are routed to the owner on
/// [`DistributedVector::finalize`], which is therefore a collective call.
pub trait DistributedVector<T: Real> {
    fn global_size(&self) -> usize;

    fn local_size(&self) -> usize;

    /// Accumulates `value` onto the entry of `equation`.
    fn add(&mut self, equation: usize, value: T) -> eyre::Result<()>;

    /// Overwrites the entry of `equation` with `value`.
    fn insert(&mut self, equation: usize, value: T) -> eyre::Result<()>;

    /// Zeroes every entry and discards writes not yet flushed.
    fn zero(&mut self);

    /// Flushes off-rank writes to their owners. Collective.
    fn finalize(&mut self) -> eyre::Result<()>;

    /// The locally owned entries, ordered by global equation.
    fn owned_values(&self) -> &[T];
}

/// A row-partitioned sparse matrix under construction.
///
/// Entries are addressed by global (row, column). Like vectors, off-rank rows
/// may be written locally; [`DistributedMatrix::finalize`] routes them to
/// their owners and freezes the matrix for solving.
pub trait DistributedMatrix<T: Real> {
    fn global_rows(&self) -> usize;

    fn global_cols(&self) -> usize;

    fn local_rows(&self) -> usize;

    /// Accumulates `value` onto the entry at global (`row`, `col`).
    fn add(&mut self, row: usize, col: usize, value: T) -> eyre::Result<()>;

    /// Flushes off-rank writes and freezes the matrix. Collective.
    fn finalize(&mut self) -> eyre::Result<()>;
}

/// Factory and solver for one family of distributed matrices and vectors.
pub trait LinearBackend<T: Real> {
    type Matrix: DistributedMatrix<T>;
    type Vector: DistributedVector<T>;

    /// Creates an empty matrix with the given row and column partitions.
    fn create_matrix(
        &self,
        rows: &EquationOwnership,
        cols: &EquationOwnership,
        preallocation: Preallocation<'_>,
    ) -> eyre::Result<Self::Matrix>;

    /// Creates a zero vector with the given row partition.
    fn create_vector(&self, rows: &EquationOwnership) -> eyre::Result<Self::Vector>;

    /// Solves `matrix * solution = rhs` for the owned entries of `solution`.
    ///
    /// The matrix and right-hand side must be finalized.
    fn solve(
        &self,
        matrix: &Self::Matrix,
        rhs: &Self::Vector,
        solution: &mut Self::Vector,
    ) -> eyre::Result<()>;
}
