//! Per-node local coordinate frames.
//!
//! Some boundary conditions (free-slip along a curved or inclined surface,
//! for instance) are only axis-aligned in a node-local frame. A
//! [`NodeRotation`] supplies the change of basis for each flagged node, and
//! the element assembler conjugates element matrices with it before scatter:
//! rotated rows are pre-multiplied by the transposed frame, rotated columns
//! post-multiplied by the frame. Element vectors get the row treatment only.

use eyre::ensure;
use nalgebra::{DMatrix, DMatrixViewMut, DVectorViewMut, Matrix3, Vector3};

use crate::Real;

/// Upper bound on the node count of a rotated element.
pub const MAX_ELEMENT_NODES: usize = 27;

/// Provider of node-local coordinate frames for one field.
///
/// The frame of a node is a `dim` by `dim` matrix whose columns are the local
/// basis vectors expressed in the global frame. Nodes without a local frame
/// report `is_rotated == false` and are left untouched.
pub trait NodeRotation<T: Real> {
    /// The spatial dimension, which must equal the DOF count of every node
    /// of the rotated field.
    fn dim(&self) -> usize;

    fn is_rotated(&self, node: usize) -> bool;

    /// Writes the frame of `node` into the `dim` by `dim` view `output`.
    /// Only called for nodes with `is_rotated(node) == true`.
    fn populate_node_rotation(&self, output: DMatrixViewMut<'_, T>, node: usize);
}

/// A [`NodeRotation`] backed by an explicit per-node table.
#[derive(Debug, Clone)]
pub struct NodeRotationTable<T> {
    dim: usize,
    frames: Vec<Option<DMatrix<T>>>,
}

impl<T: Real> NodeRotationTable<T> {
    pub fn new(dim: usize, num_nodes: usize) -> Self {
        Self {
            dim,
            frames: vec![None; num_nodes],
        }
    }

    /// Assigns an explicit frame to `node`.
    pub fn set(&mut self, node: usize, frame: DMatrix<T>) {
        assert_eq!(
            (frame.nrows(), frame.ncols()),
            (self.dim, self.dim),
            "frame shape must match the rotation dimension"
        );
        self.frames[node] = Some(frame);
    }

    /// Assigns a surface-aligned frame to a node of a 3D field: the basis is
    /// `e1`, `e2` and their cross product.
    pub fn set_surface_frame(&mut self, node: usize, e1: Vector3<T>, e2: Vector3<T>) {
        assert_eq!(self.dim, 3, "surface frames require a 3D rotation");
        let frame = Matrix3::from_columns(&[e1, e2, e1.cross(&e2)]);
        self.frames[node] = Some(DMatrix::from_column_slice(3, 3, frame.as_slice()));
    }
}

impl<T: Real> NodeRotation<T> for NodeRotationTable<T> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn is_rotated(&self, node: usize) -> bool {
        self.frames.get(node).map_or(false, Option::is_some)
    }

    fn populate_node_rotation(&self, mut output: DMatrixViewMut<'_, T>, node: usize) {
        output.copy_from(self.frames[node].as_ref().unwrap());
    }
}

/// Reusable buffers for frame application, grown to high-water size.
#[derive(Debug, Clone)]
pub(crate) struct RotationWorkspace<T: Real> {
    frame: DMatrix<T>,
    stripe: DMatrix<T>,
}

impl<T: Real> Default for RotationWorkspace<T> {
    fn default() -> Self {
        Self {
            frame: DMatrix::zeros(0, 0),
            stripe: DMatrix::zeros(0, 0),
        }
    }
}

impl<T: Real> RotationWorkspace<T> {
    /// Grows the frame and stripe buffers to cover the requested extents and
    /// hands out disjoint borrows of both.
    fn reserve(
        &mut self,
        d: usize,
        stripe_rows: usize,
        stripe_cols: usize,
    ) -> (&mut DMatrix<T>, &mut DMatrix<T>) {
        if self.frame.nrows() < d {
            self.frame = DMatrix::zeros(d, d);
        }
        if self.stripe.nrows() < stripe_rows || self.stripe.ncols() < stripe_cols {
            self.stripe = DMatrix::zeros(
                stripe_rows.max(self.stripe.nrows()),
                stripe_cols.max(self.stripe.ncols()),
            );
        }
        (&mut self.frame, &mut self.stripe)
    }

    fn check_extent(&self, what: &str, nodes: usize, dofs: usize, d: usize) -> eyre::Result<()> {
        ensure!(
            nodes <= MAX_ELEMENT_NODES,
            "cannot rotate an element with {} nodes (at most {} supported)",
            nodes,
            MAX_ELEMENT_NODES
        );
        ensure!(
            dofs == nodes * d,
            "{} extent {} of a rotated element is not {} DOFs on each of {} nodes",
            what,
            dofs,
            d,
            nodes
        );
        Ok(())
    }

    /// Pre-multiplies the row stripes of rotated nodes by the transposed
    /// frame: `A <- diag(..., R_i^T, ...) A`.
    pub fn rotate_matrix_rows(
        &mut self,
        mut block: DMatrixViewMut<'_, T>,
        nodes: &[usize],
        rotation: &dyn NodeRotation<T>,
    ) -> eyre::Result<()> {
        let d = rotation.dim();
        self.check_extent("row", nodes.len(), block.nrows(), d)?;
        let ncols = block.ncols();
        let (frame, stripe) = self.reserve(d, d, ncols);
        for (i, &node) in nodes.iter().enumerate() {
            if !rotation.is_rotated(node) {
                continue;
            }
            rotation.populate_node_rotation(frame.view_range_mut(0..d, 0..d), node);
            stripe
                .view_range_mut(0..d, 0..ncols)
                .copy_from(&block.view_range(i * d..(i + 1) * d, 0..ncols));
            block.view_range_mut(i * d..(i + 1) * d, 0..ncols).gemm_tr(
                T::one(),
                &frame.view_range(0..d, 0..d),
                &stripe.view_range(0..d, 0..ncols),
                T::zero(),
            );
        }
        Ok(())
    }

    /// Post-multiplies the column stripes of rotated nodes by the frame:
    /// `A <- A diag(..., R_j, ...)`.
    pub fn rotate_matrix_cols(
        &mut self,
        mut block: DMatrixViewMut<'_, T>,
        nodes: &[usize],
        rotation: &dyn NodeRotation<T>,
    ) -> eyre::Result<()> {
        let d = rotation.dim();
        self.check_extent("column", nodes.len(), block.ncols(), d)?;
        let nrows = block.nrows();
        let (frame, stripe) = self.reserve(d, nrows, d);
        for (j, &node) in nodes.iter().enumerate() {
            if !rotation.is_rotated(node) {
                continue;
            }
            rotation.populate_node_rotation(frame.view_range_mut(0..d, 0..d), node);
            stripe
                .view_range_mut(0..nrows, 0..d)
                .copy_from(&block.view_range(0..nrows, j * d..(j + 1) * d));
            block.view_range_mut(0..nrows, j * d..(j + 1) * d).gemm(
                T::one(),
                &stripe.view_range(0..nrows, 0..d),
                &frame.view_range(0..d, 0..d),
                T::zero(),
            );
        }
        Ok(())
    }

    /// Pre-multiplies the segments of rotated nodes by the transposed frame:
    /// `b <- diag(..., R_i^T, ...) b`.
    pub fn rotate_vector(
        &mut self,
        mut block: DVectorViewMut<'_, T>,
        nodes: &[usize],
        rotation: &dyn NodeRotation<T>,
    ) -> eyre::Result<()> {
        let d = rotation.dim();
        self.check_extent("row", nodes.len(), block.nrows(), d)?;
        let (frame, stripe) = self.reserve(d, d, 1);
        for (i, &node) in nodes.iter().enumerate() {
            if !rotation.is_rotated(node) {
                continue;
            }
            rotation.populate_node_rotation(frame.view_range_mut(0..d, 0..d), node);
            stripe
                .view_range_mut(0..d, 0..1)
                .copy_from(&block.view_range(i * d..(i + 1) * d, 0..1));
            block.view_range_mut(i * d..(i + 1) * d, 0..1).gemm_tr(
                T::one(),
                &frame.view_range(0..d, 0..d),
                &stripe.view_range(0..d, 0..1),
                T::zero(),
            );
        }
        Ok(())
    }
}
