//! Scatter of element contributions into distributed storage.
//!
//! [`ElementAssembler`] evaluates the term chain of one element into a dense
//! block, applies node-local frames and Dirichlet boundary conditions, and
//! scatters the surviving entries through the element's location matrix. It
//! is deliberately ignorant of meshes and physics; everything it needs
//! arrives through the collaborator traits bundled in [`FieldSlice`].

use std::cell::RefCell;

use eyre::{bail, ensure, WrapErr};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::assembly::local::{ElementMatrixTerm, ElementVectorTerm};
use crate::assembly::rotation::{NodeRotation, RotationWorkspace};
use crate::backend::{DistributedMatrix, DistributedVector};
use crate::connectivity::{DofLayout, Topology};
use crate::numbering::EquationSpace;
use crate::Real;

/// How Dirichlet-constrained DOFs participate in the global system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BcPolicy {
    /// Constrained DOFs carry no equation; their columns are folded into the
    /// right-hand side and their rows never reach the matrix.
    Eliminate,
    /// Constrained DOFs keep their equations. Their rows and columns are
    /// zeroed during scatter and later replaced by a unit diagonal, with the
    /// prescribed value placed in the right-hand side.
    Retain,
}

impl Default for BcPolicy {
    fn default() -> Self {
        BcPolicy::Eliminate
    }
}

/// The collaborators describing one field: mesh incidence, per-node DOF
/// storage and the global equation numbering.
pub struct FieldSlice<'a, T: Real> {
    pub topology: &'a dyn Topology,
    pub layout: &'a dyn DofLayout<T>,
    pub space: &'a EquationSpace,
}

impl<'a, T: Real> Clone for FieldSlice<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T: Real> Copy for FieldSlice<'a, T> {}

#[derive(Debug, Clone)]
struct AssemblerWorkspace<T: Real> {
    row_nodes: Vec<usize>,
    col_nodes: Vec<usize>,
    // flat DOF index -> (node, DOF within node), in incidence order
    row_dofs: Vec<(usize, usize)>,
    col_dofs: Vec<(usize, usize)>,
    // element blocks, grown to high-water size
    matrix_block: DMatrix<T>,
    vector_block: DVector<T>,
    rhs_correction: Vec<T>,
    trans_correction: Vec<T>,
    rotation: RotationWorkspace<T>,
}

impl<T: Real> Default for AssemblerWorkspace<T> {
    fn default() -> Self {
        Self {
            row_nodes: Vec::new(),
            col_nodes: Vec::new(),
            row_dofs: Vec::new(),
            col_dofs: Vec::new(),
            matrix_block: DMatrix::zeros(0, 0),
            vector_block: DVector::zeros(0),
            rhs_correction: Vec::new(),
            trans_correction: Vec::new(),
            rotation: RotationWorkspace::default(),
        }
    }
}

/// Populates `nodes` and the flat DOF -> (node, DOF) map of one element side,
/// returning the element's DOF count.
fn populate_element_side<T: Real>(
    field: &FieldSlice<'_, T>,
    element: usize,
    nodes: &mut Vec<usize>,
    dofs: &mut Vec<(usize, usize)>,
) -> usize {
    nodes.resize(field.topology.element_node_count(element), 0);
    field.topology.populate_element_nodes(nodes, element);
    dofs.clear();
    for &node in nodes.iter() {
        for dof in 0..field.layout.dof_count(node) {
            dofs.push((node, dof));
        }
    }
    dofs.len()
}

/// Element-wise assembler for one rank's share of a global system.
///
/// The workspace buffers live behind a [`RefCell`] so that assembly over an
/// element range requires only `&self`.
#[derive(Debug, Default)]
pub struct ElementAssembler<T: Real> {
    bc_policy: BcPolicy,
    check_finite: bool,
    workspace: RefCell<AssemblerWorkspace<T>>,
}

impl<T: Real> ElementAssembler<T> {
    pub fn new(bc_policy: BcPolicy, check_finite: bool) -> Self {
        Self {
            bc_policy,
            check_finite,
            workspace: RefCell::new(AssemblerWorkspace::default()),
        }
    }

    pub fn bc_policy(&self) -> BcPolicy {
        self.bc_policy
    }

    /// Assembles the matrix contribution of one element, along with the
    /// boundary-condition corrections to the attached right-hand sides.
    ///
    /// `rhs` receives the correction that moves known column values to the
    /// right-hand side; `trans_rhs` receives the analogous correction built
    /// from the transposed block, for the system whose matrix is the
    /// transpose of this one.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble_matrix_element<M, V>(
        &self,
        element: usize,
        terms: &[Box<dyn ElementMatrixTerm<T> + '_>],
        row: &FieldSlice<'_, T>,
        col: &FieldSlice<'_, T>,
        row_location: &[Option<usize>],
        col_location: &[Option<usize>],
        rotation: Option<&dyn NodeRotation<T>>,
        matrix: &mut M,
        mut rhs: Option<&mut V>,
        mut trans_rhs: Option<&mut V>,
    ) -> eyre::Result<()>
    where
        M: DistributedMatrix<T>,
        V: DistributedVector<T>,
    {
        let ws = &mut *self.workspace.borrow_mut();
        let n_rows = populate_element_side(row, element, &mut ws.row_nodes, &mut ws.row_dofs);
        let n_cols = populate_element_side(col, element, &mut ws.col_nodes, &mut ws.col_dofs);
        if n_rows == 0 || n_cols == 0 {
            bail!("element {} has no DOFs on its row or column side", element);
        }
        ensure!(
            row_location.len() == n_rows && col_location.len() == n_cols,
            "location matrix extents ({}, {}) disagree with the {} by {} element block",
            row_location.len(),
            col_location.len(),
            n_rows,
            n_cols
        );

        if ws.matrix_block.nrows() < n_rows || ws.matrix_block.ncols() < n_cols {
            ws.matrix_block = DMatrix::zeros(
                n_rows.max(ws.matrix_block.nrows()),
                n_cols.max(ws.matrix_block.ncols()),
            );
        }
        let mut block = ws.matrix_block.view_range_mut(0..n_rows, 0..n_cols);
        block.fill(T::zero());
        for (index, term) in terms.iter().enumerate() {
            term.assemble_element_matrix_into(element, block.as_view_mut())
                .wrap_err_with(|| format!("matrix term {} failed on element {}", index, element))?;
        }

        if let Some(rotation) = rotation {
            ws.rotation
                .rotate_matrix_rows(block.as_view_mut(), &ws.row_nodes, rotation)?;
            ws.rotation
                .rotate_matrix_cols(block.as_view_mut(), &ws.col_nodes, rotation)?;
        }

        if self.check_finite {
            for value in block.iter() {
                if !value.is_finite() {
                    bail!("element {} produced a non-finite matrix entry", element);
                }
            }
        }

        // Known column values move to the right-hand side before any zeroing
        // touches the block.
        if rhs.is_some() {
            ws.rhs_correction.clear();
            ws.rhs_correction.resize(n_rows, T::zero());
            for (c, &(node, dof)) in ws.col_dofs.iter().enumerate() {
                if !col.layout.is_boundary_condition(node, dof) {
                    continue;
                }
                let prescribed = col.layout.value(node, dof);
                for r in 0..n_rows {
                    ws.rhs_correction[r] -= prescribed * block[(r, c)];
                }
            }
        }
        if trans_rhs.is_some() {
            ws.trans_correction.clear();
            ws.trans_correction.resize(n_cols, T::zero());
            for (r, &(node, dof)) in ws.row_dofs.iter().enumerate() {
                if !row.layout.is_boundary_condition(node, dof) {
                    continue;
                }
                let prescribed = row.layout.value(node, dof);
                for c in 0..n_cols {
                    ws.trans_correction[c] -= prescribed * block[(r, c)];
                }
            }
        }

        // Under the retained policy, constrained slots keep their equations;
        // their rows and columns are scattered as zeros and the unit diagonal
        // is installed in a separate global pass. Their right-hand-side
        // entries must hold exactly the prescribed value, so the correction
        // of a constrained slot is discarded as well.
        if self.bc_policy == BcPolicy::Retain {
            for (r, &(node, dof)) in ws.row_dofs.iter().enumerate() {
                if row.layout.is_boundary_condition(node, dof) {
                    block.view_range_mut(r..r + 1, 0..n_cols).fill(T::zero());
                    if let Some(correction) = ws.rhs_correction.get_mut(r) {
                        *correction = T::zero();
                    }
                }
            }
            for (c, &(node, dof)) in ws.col_dofs.iter().enumerate() {
                if col.layout.is_boundary_condition(node, dof) {
                    block.view_range_mut(0..n_rows, c..c + 1).fill(T::zero());
                    if let Some(correction) = ws.trans_correction.get_mut(c) {
                        *correction = T::zero();
                    }
                }
            }
        }

        for (r, row_eq) in row_location.iter().enumerate() {
            let row_eq = match row_eq {
                Some(eq) => *eq,
                None => continue,
            };
            for (c, col_eq) in col_location.iter().enumerate() {
                if let Some(col_eq) = col_eq {
                    matrix.add(row_eq, *col_eq, block[(r, c)])?;
                }
            }
        }
        if let Some(rhs) = rhs.as_deref_mut() {
            for (r, row_eq) in row_location.iter().enumerate() {
                if let Some(eq) = row_eq {
                    rhs.add(*eq, ws.rhs_correction[r])?;
                }
            }
        }
        if let Some(trans_rhs) = trans_rhs.as_deref_mut() {
            for (c, col_eq) in col_location.iter().enumerate() {
                if let Some(eq) = col_eq {
                    trans_rhs.add(*eq, ws.trans_correction[c])?;
                }
            }
        }
        Ok(())
    }

    /// Assembles the vector contribution of one element.
    pub fn assemble_vector_element<V>(
        &self,
        element: usize,
        terms: &[Box<dyn ElementVectorTerm<T> + '_>],
        field: &FieldSlice<'_, T>,
        location: &[Option<usize>],
        rotation: Option<&dyn NodeRotation<T>>,
        vector: &mut V,
    ) -> eyre::Result<()>
    where
        V: DistributedVector<T>,
    {
        let ws = &mut *self.workspace.borrow_mut();
        let n_dofs = populate_element_side(field, element, &mut ws.row_nodes, &mut ws.row_dofs);
        if n_dofs == 0 {
            bail!("element {} has no DOFs", element);
        }
        ensure!(
            location.len() == n_dofs,
            "location matrix extent {} disagrees with the {}-DOF element block",
            location.len(),
            n_dofs
        );

        if ws.vector_block.nrows() < n_dofs {
            ws.vector_block = DVector::zeros(n_dofs);
        }
        let mut block = ws.vector_block.view_range_mut(0..n_dofs, 0..1);
        block.fill(T::zero());
        for (index, term) in terms.iter().enumerate() {
            term.assemble_element_vector_into(element, block.column_mut(0))
                .wrap_err_with(|| format!("vector term {} failed on element {}", index, element))?;
        }

        if let Some(rotation) = rotation {
            ws.rotation
                .rotate_vector(block.column_mut(0), &ws.row_nodes, rotation)?;
        }

        if self.check_finite {
            for value in block.iter() {
                if !value.is_finite() {
                    bail!("element {} produced a non-finite vector entry", element);
                }
            }
        }

        // A retained constrained slot must end up holding exactly its
        // prescribed value, which a separate global pass installs; its
        // element contributions are discarded.
        if self.bc_policy == BcPolicy::Retain {
            for (i, &(node, dof)) in ws.row_dofs.iter().enumerate() {
                if field.layout.is_boundary_condition(node, dof) {
                    block[(i, 0)] = T::zero();
                }
            }
        }

        for (i, slot) in location.iter().enumerate() {
            if let Some(eq) = slot {
                vector.add(*eq, block[(i, 0)])?;
            }
        }
        Ok(())
    }
}
