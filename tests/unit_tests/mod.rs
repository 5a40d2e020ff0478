use eyre::Result;
use nalgebra::{DMatrixViewMut, DVectorViewMut};
use olivine::assembly::{BcPolicy, ElementMatrixTerm, ElementVectorTerm};
use olivine::comm::LocalComm;
use olivine::connectivity::{DofLayout, IncidenceList, NodalField};
use olivine::numbering::{EquationOwnership, EquationSpace};

mod assembly;
mod gather;
mod sparsity;

/// A 1D chain of `num_elements` two-node elements.
pub fn chain_topology(num_elements: usize) -> IncidenceList {
    IncidenceList::new(
        num_elements + 1,
        (0..num_elements).map(|e| vec![e, e + 1]).collect(),
    )
}

/// Numbers the DOFs of `layout` sequentially and splits the equations as
/// evenly as possible across `num_ranks`, viewed from `rank`. Constrained
/// DOFs are skipped under the eliminating policy.
pub fn number_equations(
    layout: &NodalField<f64>,
    policy: BcPolicy,
    rank: usize,
    num_ranks: usize,
) -> EquationSpace {
    let mut equations = Vec::new();
    let mut next = 0;
    for node in 0..layout.num_nodes() {
        let mut dofs = Vec::new();
        for dof in 0..layout.dof_count(node) {
            if policy == BcPolicy::Eliminate && layout.is_boundary_condition(node, dof) {
                dofs.push(None);
            } else {
                dofs.push(Some(next));
                next += 1;
            }
        }
        equations.push(dofs);
    }
    let base = next / num_ranks;
    let remainder = next % num_ranks;
    let counts: Vec<usize> = (0..num_ranks)
        .map(|r| base + usize::from(r < remainder))
        .collect();
    EquationSpace::new(equations, EquationOwnership::from_owned_counts(rank, &counts))
}

/// Runs `f` once per rank of an in-process group, each on its own thread.
pub fn run_on_group<F>(size: usize, f: F)
where
    F: Fn(LocalComm) + Sync,
{
    let comms = LocalComm::group(size);
    std::thread::scope(|scope| {
        for comm in comms {
            let f = &f;
            scope.spawn(move || f(comm));
        }
    });
}

/// The element stiffness of a unit-length linear segment, `[[1, -1], [-1, 1]]`.
pub struct SegmentStiffness;

impl ElementMatrixTerm<f64> for SegmentStiffness {
    fn assemble_element_matrix_into(
        &self,
        _element: usize,
        mut output: DMatrixViewMut<'_, f64>,
    ) -> Result<()> {
        output[(0, 0)] += 1.0;
        output[(0, 1)] -= 1.0;
        output[(1, 0)] -= 1.0;
        output[(1, 1)] += 1.0;
        Ok(())
    }
}

/// Adds a point load to the last DOF of one designated element.
pub struct EndLoad {
    pub element: usize,
    pub magnitude: f64,
}

impl ElementVectorTerm<f64> for EndLoad {
    fn assemble_element_vector_into(
        &self,
        element: usize,
        mut output: DVectorViewMut<'_, f64>,
    ) -> Result<()> {
        if element == self.element {
            let last = output.nrows() - 1;
            output[last] += self.magnitude;
        }
        Ok(())
    }
}
