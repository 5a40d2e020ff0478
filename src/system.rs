//! Orchestration of a block-structured linear system.
//!
//! A [`LinearSystem`] owns the global matrices and vectors of one linear
//! problem, each tagged with the fields whose equations span its rows and
//! columns. [`LinearSystem::assemble_all`] rebuilds every block from its
//! attached element terms: matrices are recreated from a fresh sparsity
//! estimate, boundary-condition corrections flow into the attached
//! right-hand sides, and everything is finalized ready for a solve.

use eyre::{bail, ensure, eyre};
use log::{debug, info};
use olivine_comm::Communicator;
use serde::{Deserialize, Serialize};

use crate::assembly::global::{BcPolicy, ElementAssembler, FieldSlice};
use crate::assembly::local::{ElementMatrixTerm, ElementVectorTerm};
use crate::assembly::rotation::NodeRotation;
use crate::backend::{DistributedMatrix, DistributedVector, LinearBackend, Preallocation};
use crate::numbering::LocationMatrixCache;
use crate::sparsity::estimate_nonzeros;
use crate::Real;

/// Knobs shared by every block of a [`LinearSystem`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyOptions {
    pub bc_policy: BcPolicy,
    /// Fail assembly on the first non-finite element entry.
    pub check_finite: bool,
    /// Log assembly progress every this many percent of the element count.
    pub progress_percentage: usize,
    /// Skip the sparsity estimator and preallocate this many nonzeros per
    /// row instead.
    pub uniform_nonzeros: Option<usize>,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            bc_policy: BcPolicy::default(),
            check_finite: false,
            progress_percentage: 10,
            uniform_nonzeros: None,
        }
    }
}

/// Handle to a field registered with a [`LinearSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldId(usize);

/// Handle to a matrix block of a [`LinearSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixId(usize);

/// Handle to a vector block of a [`LinearSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorId(usize);

struct FieldData<'a, T: Real> {
    name: String,
    slice: FieldSlice<'a, T>,
    locations: LocationMatrixCache,
}

struct MatrixBlock<'a, T: Real, B: LinearBackend<T>> {
    name: String,
    row_field: FieldId,
    col_field: FieldId,
    terms: Vec<Box<dyn ElementMatrixTerm<T> + 'a>>,
    rhs: Option<VectorId>,
    trans_rhs: Option<VectorId>,
    rotation: Option<&'a dyn NodeRotation<T>>,
    hooks: Vec<Box<dyn FnMut(&mut B::Matrix) -> eyre::Result<()> + 'a>>,
    handle: Option<B::Matrix>,
}

struct VectorBlock<'a, T: Real, B: LinearBackend<T>> {
    name: String,
    field: FieldId,
    terms: Vec<Box<dyn ElementVectorTerm<T> + 'a>>,
    rotation: Option<&'a dyn NodeRotation<T>>,
    handle: Option<B::Vector>,
}

/// A block-structured linear system under assembly.
pub struct LinearSystem<'a, T: Real, B: LinearBackend<T>> {
    backend: B,
    options: AssemblyOptions,
    assembler: ElementAssembler<T>,
    fields: Vec<FieldData<'a, T>>,
    matrices: Vec<MatrixBlock<'a, T, B>>,
    vectors: Vec<VectorBlock<'a, T, B>>,
}

impl<'a, T: Real, B: LinearBackend<T>> LinearSystem<'a, T, B> {
    pub fn new(backend: B, options: AssemblyOptions) -> Self {
        let assembler = ElementAssembler::new(options.bc_policy, options.check_finite);
        Self {
            backend,
            options,
            assembler,
            fields: Vec::new(),
            matrices: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn options(&self) -> &AssemblyOptions {
        &self.options
    }

    pub fn add_field(&mut self, name: impl Into<String>, slice: FieldSlice<'a, T>) -> FieldId {
        self.fields.push(FieldData {
            name: name.into(),
            slice,
            locations: LocationMatrixCache::new(),
        });
        FieldId(self.fields.len() - 1)
    }

    pub fn add_matrix(
        &mut self,
        name: impl Into<String>,
        row_field: FieldId,
        col_field: FieldId,
    ) -> MatrixId {
        self.matrices.push(MatrixBlock {
            name: name.into(),
            row_field,
            col_field,
            terms: Vec::new(),
            rhs: None,
            trans_rhs: None,
            rotation: None,
            hooks: Vec::new(),
            handle: None,
        });
        MatrixId(self.matrices.len() - 1)
    }

    pub fn add_matrix_term(&mut self, matrix: MatrixId, term: Box<dyn ElementMatrixTerm<T> + 'a>) {
        self.matrices[matrix.0].terms.push(term);
    }

    /// Attaches the vector receiving this matrix's boundary-condition
    /// corrections.
    pub fn set_rhs(&mut self, matrix: MatrixId, vector: VectorId) {
        self.matrices[matrix.0].rhs = Some(vector);
    }

    /// Attaches the vector receiving the corrections of this matrix's
    /// transpose. Used for blocks shared between a system and its adjoint,
    /// such as the gradient and divergence pair of a saddle-point problem.
    pub fn set_transposed_rhs(&mut self, matrix: MatrixId, vector: VectorId) {
        self.matrices[matrix.0].trans_rhs = Some(vector);
    }

    /// Attaches node-local frames conjugating this matrix's element blocks.
    /// The matrix must couple the rotated field on both sides.
    pub fn set_rotation(&mut self, matrix: MatrixId, rotation: &'a dyn NodeRotation<T>) {
        self.matrices[matrix.0].rotation = Some(rotation);
    }

    /// Registers a hook run on the freshly finalized matrix after every
    /// assembly, in registration order.
    pub fn add_post_assembly_hook(
        &mut self,
        matrix: MatrixId,
        hook: Box<dyn FnMut(&mut B::Matrix) -> eyre::Result<()> + 'a>,
    ) {
        self.matrices[matrix.0].hooks.push(hook);
    }

    pub fn add_vector(&mut self, name: impl Into<String>, field: FieldId) -> VectorId {
        self.vectors.push(VectorBlock {
            name: name.into(),
            field,
            terms: Vec::new(),
            rotation: None,
            handle: None,
        });
        VectorId(self.vectors.len() - 1)
    }

    /// Attaches node-local frames to a vector's element contributions. A
    /// vector serving as the right-hand side of a rotated matrix must carry
    /// the same frames.
    pub fn set_vector_rotation(&mut self, vector: VectorId, rotation: &'a dyn NodeRotation<T>) {
        self.vectors[vector.0].rotation = Some(rotation);
    }

    pub fn add_vector_term(&mut self, vector: VectorId, term: Box<dyn ElementVectorTerm<T> + 'a>) {
        self.vectors[vector.0].terms.push(term);
    }

    /// The assembled matrix of `matrix`, if [`LinearSystem::assemble_all`]
    /// has run.
    pub fn matrix(&self, matrix: MatrixId) -> Option<&B::Matrix> {
        self.matrices[matrix.0].handle.as_ref()
    }

    pub fn vector(&self, vector: VectorId) -> Option<&B::Vector> {
        self.vectors[vector.0].handle.as_ref()
    }

    pub fn vector_mut(&mut self, vector: VectorId) -> Option<&mut B::Vector> {
        self.vectors[vector.0].handle.as_mut()
    }

    /// A zero vector over the equations of `field`, for holding a solution.
    pub fn create_solution_vector(&self, field: FieldId) -> eyre::Result<B::Vector> {
        self.backend
            .create_vector(self.fields[field.0].slice.space.ownership())
    }

    /// Drops every cached location matrix. Must be called whenever the
    /// equation numbering of any field is rebuilt.
    pub fn invalidate_numbering(&mut self) {
        for field in &mut self.fields {
            field.locations.invalidate();
        }
    }

    /// Zeroes every assembled vector in place.
    pub fn zero_vectors(&mut self) {
        for vector in &mut self.vectors {
            if let Some(handle) = vector.handle.as_mut() {
                handle.zero();
            }
        }
    }

    /// Seeds `vector` with the current nodal values of its field, prescribed
    /// boundary values included. Collective.
    pub fn load_node_values_onto_vector(&mut self, vector: VectorId) -> eyre::Result<()> {
        let block = &mut self.vectors[vector.0];
        let field = &self.fields[block.field.0];
        if block.handle.is_none() {
            block.handle = Some(self.backend.create_vector(field.slice.space.ownership())?);
        }
        let handle = block
            .handle
            .as_mut()
            .ok_or_else(|| eyre!("vector {} lost its storage", block.name))?;
        for node in 0..field.slice.space.num_nodes() {
            for dof in 0..field.slice.space.dof_count(node) {
                if let Some(eq) = field.slice.space.equation(node, dof) {
                    handle.insert(eq, field.slice.layout.value(node, dof))?;
                }
            }
        }
        handle.finalize()
    }

    /// Rebuilds and finalizes every block of the system. Collective; every
    /// rank of the group must call this with its blocks registered in the
    /// same order.
    pub fn assemble_all<C: Communicator>(&mut self, comm: &C) -> eyre::Result<()> {
        let Self {
            backend,
            options,
            assembler,
            fields,
            matrices,
            vectors,
        } = self;

        for field in fields.iter_mut() {
            field
                .locations
                .build_all(field.slice.topology, field.slice.space);
        }
        let fields = &*fields;

        // Vectors first: matrix assembly streams boundary corrections into
        // them, so they must exist and start from zero.
        for vector in vectors.iter_mut() {
            let ownership = fields[vector.field.0].slice.space.ownership();
            match vector.handle.as_mut() {
                Some(handle) => handle.zero(),
                None => vector.handle = Some(backend.create_vector(ownership)?),
            }
        }

        for block in matrices.iter_mut() {
            let row = &fields[block.row_field.0];
            let col = &fields[block.col_field.0];
            ensure!(
                row.slice.topology.num_elements() == col.slice.topology.num_elements(),
                "row and column topologies of {} disagree on the element count",
                block.name
            );
            check_local_share(&block.name, "row", row)?;
            check_local_share(&block.name, "column", col)?;

            let preallocation_pattern;
            let preallocation = match options.uniform_nonzeros {
                Some(per_row) => Preallocation::Uniform(per_row),
                None => {
                    preallocation_pattern = estimate_nonzeros(
                        row.slice.topology,
                        row.slice.space,
                        col.slice.topology,
                        col.slice.space,
                        comm,
                    )?;
                    Preallocation::PerRow(&preallocation_pattern)
                }
            };
            // Recreated from scratch on every assembly so the nonzero
            // structure tracks the current numbering.
            let matrix = block.handle.insert(backend.create_matrix(
                row.slice.space.ownership(),
                col.slice.space.ownership(),
                preallocation,
            )?);

            let (mut rhs, mut trans_rhs) = attached_pair(
                vectors,
                block.rhs.map(|id| id.0),
                block.trans_rhs.map(|id| id.0),
                &block.name,
            )?;

            let total = row.slice.topology.num_elements();
            let interval = progress_interval(total, options.progress_percentage);
            for element in 0..total {
                assembler.assemble_matrix_element(
                    element,
                    &block.terms,
                    &row.slice,
                    &col.slice,
                    row.locations.built_row(element),
                    col.locations.built_row(element),
                    block.rotation,
                    matrix,
                    rhs.as_deref_mut(),
                    trans_rhs.as_deref_mut(),
                )?;
                if (element + 1) % interval == 0 {
                    debug!("assembled {} of {} elements into {}", element + 1, total, block.name);
                }
            }

            // Retained constrained equations get their unit diagonal exactly
            // once, on the rows this rank owns.
            if options.bc_policy == BcPolicy::Retain && block.row_field == block.col_field {
                let space = row.slice.space;
                for node in 0..space.num_nodes() {
                    for dof in 0..space.dof_count(node) {
                        if !row.slice.layout.is_boundary_condition(node, dof) {
                            continue;
                        }
                        if let Some(eq) = space.equation(node, dof) {
                            if space.ownership().is_owned(eq) {
                                matrix.add(eq, eq, T::one())?;
                            }
                        }
                    }
                }
            }

            matrix.finalize()?;
            info!("assembled matrix {}", block.name);
            for hook in block.hooks.iter_mut() {
                hook(matrix)?;
            }
        }

        for block in vectors.iter_mut() {
            let field = &fields[block.field.0];
            let handle = block
                .handle
                .as_mut()
                .ok_or_else(|| eyre!("vector {} lost its storage during assembly", block.name))?;

            if block.terms.is_empty() {
                debug!("no terms attached to {}, skipping its element loop", block.name);
            } else {
                let total = field.slice.topology.num_elements();
                let interval = progress_interval(total, options.progress_percentage);
                for element in 0..total {
                    assembler.assemble_vector_element(
                        element,
                        &block.terms,
                        &field.slice,
                        field.locations.built_row(element),
                        block.rotation,
                        handle,
                    )?;
                    if (element + 1) % interval == 0 {
                        debug!(
                            "assembled {} of {} elements into {}",
                            element + 1,
                            total,
                            block.name
                        );
                    }
                }
            }

            // Retained constrained equations read their prescribed value
            // straight from the right-hand side.
            if options.bc_policy == BcPolicy::Retain {
                let space = field.slice.space;
                for node in 0..space.num_nodes() {
                    for dof in 0..space.dof_count(node) {
                        if !field.slice.layout.is_boundary_condition(node, dof) {
                            continue;
                        }
                        if let Some(eq) = space.equation(node, dof) {
                            if space.ownership().is_owned(eq) {
                                handle.add(eq, field.slice.layout.value(node, dof))?;
                            }
                        }
                    }
                }
            }

            handle.finalize()?;
            info!("assembled vector {}", block.name);
        }

        Ok(())
    }

    /// Solves `matrix * solution = rhs` through the backend. Both blocks
    /// must have been assembled.
    pub fn solve(
        &mut self,
        matrix: MatrixId,
        rhs: VectorId,
        solution: &mut B::Vector,
    ) -> eyre::Result<()> {
        let matrix_block = &self.matrices[matrix.0];
        let matrix_handle = matrix_block
            .handle
            .as_ref()
            .ok_or_else(|| eyre!("matrix {} has not been assembled", matrix_block.name))?;
        let rhs_block = &self.vectors[rhs.0];
        let rhs_handle = rhs_block
            .handle
            .as_ref()
            .ok_or_else(|| eyre!("vector {} has not been assembled", rhs_block.name))?;
        self.backend.solve(matrix_handle, rhs_handle, solution)
    }
}

fn check_local_share<T: Real>(
    matrix: &str,
    side: &str,
    field: &FieldData<'_, T>,
) -> eyre::Result<()> {
    let ownership = field.slice.space.ownership();
    if ownership.num_equations() > 0 && ownership.num_owned() == 0 {
        bail!(
            "rank {} owns no {} equations of {} (field {}); rebalance the partition",
            ownership.rank(),
            side,
            matrix,
            field.name
        );
    }
    Ok(())
}

fn progress_interval(total: usize, percentage: usize) -> usize {
    let interval = total * percentage / 100;
    if interval == 0 {
        // Too few elements for percentage steps; log once at the end.
        total.max(1)
    } else {
        interval
    }
}

/// Mutable borrows of the right-hand-side pair attached to one matrix.
fn attached_pair<'v, 'a, T: Real, B: LinearBackend<T>>(
    vectors: &'v mut [VectorBlock<'a, T, B>],
    rhs: Option<usize>,
    trans_rhs: Option<usize>,
    matrix: &str,
) -> eyre::Result<(Option<&'v mut B::Vector>, Option<&'v mut B::Vector>)> {
    fn handle_of<'v, 'a, T: Real, B: LinearBackend<T>>(
        block: &'v mut VectorBlock<'a, T, B>,
    ) -> eyre::Result<&'v mut B::Vector> {
        block
            .handle
            .as_mut()
            .ok_or_else(|| eyre!("vector {} lost its storage during assembly", block.name))
    }

    match (rhs, trans_rhs) {
        (Some(a), Some(b)) => {
            ensure!(
                a != b,
                "{} attaches the same vector as right-hand side and transposed right-hand side",
                matrix
            );
            let (low, high) = (a.min(b), a.max(b));
            let (head, tail) = vectors.split_at_mut(high);
            let low_handle = handle_of(&mut head[low])?;
            let high_handle = handle_of(&mut tail[0])?;
            if a < b {
                Ok((Some(low_handle), Some(high_handle)))
            } else {
                Ok((Some(high_handle), Some(low_handle)))
            }
        }
        (Some(a), None) => Ok((Some(handle_of(&mut vectors[a])?), None)),
        (None, Some(b)) => Ok((None, Some(handle_of(&mut vectors[b])?))),
        (None, None) => Ok((None, None)),
    }
}
