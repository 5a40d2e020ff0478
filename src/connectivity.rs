//! Collaborator seams for mesh topology and per-node degree-of-freedom storage.
//!
//! The assembly core never builds meshes or decides how many unknowns live on
//! a node; it consumes both through the [`Topology`] and [`DofLayout`] traits.
//! [`IncidenceList`] and [`NodalField`] are concrete implementations used for
//! single-process embeddings and by the test suite.

use crate::Real;

/// Element-node incidence of the locally stored part of a mesh.
///
/// Element and node indices are local to the calling rank. The incidence of an
/// element is an ordered list; its order determines the layout of element-local
/// DOF slots and must therefore be stable for the lifetime of the topology.
pub trait Topology {
    fn num_elements(&self) -> usize;

    fn num_nodes(&self) -> usize;

    fn element_node_count(&self, element: usize) -> usize;

    /// Populates `output` with the ordered node incidence of `element`.
    ///
    /// `output` must have length `element_node_count(element)`.
    fn populate_element_nodes(&self, output: &mut [usize], element: usize);

    /// Replaces the contents of `output` with the indices of all elements
    /// touching `node`.
    fn populate_node_elements(&self, output: &mut Vec<usize>, node: usize);
}

/// Per-node degree-of-freedom storage with boundary-condition flags.
///
/// For a constrained (Dirichlet) DOF, `value` returns the prescribed boundary
/// value; for an unconstrained DOF it returns the current solution value.
pub trait DofLayout<T: Real> {
    fn num_nodes(&self) -> usize;

    fn dof_count(&self, node: usize) -> usize;

    fn is_boundary_condition(&self, node: usize, dof: usize) -> bool;

    fn value(&self, node: usize, dof: usize) -> T;

    fn set_value(&mut self, node: usize, dof: usize, value: T);
}

/// A [`Topology`] stored as explicit element-node lists.
///
/// The node-element inverse is built once at construction.
#[derive(Debug, Clone)]
pub struct IncidenceList {
    element_nodes: Vec<Vec<usize>>,
    node_elements: Vec<Vec<usize>>,
}

impl IncidenceList {
    /// Builds the incidence list from per-element node lists. `num_nodes` may
    /// exceed the largest referenced node index (isolated nodes are allowed).
    pub fn new(num_nodes: usize, element_nodes: Vec<Vec<usize>>) -> Self {
        let mut node_elements = vec![Vec::new(); num_nodes];
        for (element, nodes) in element_nodes.iter().enumerate() {
            for &node in nodes {
                assert!(node < num_nodes, "element {} references node {} out of bounds", element, node);
                // A node may appear multiple times in one element's incidence
                if node_elements[node].last() != Some(&element) {
                    node_elements[node].push(element);
                }
            }
        }
        Self {
            element_nodes,
            node_elements,
        }
    }

    pub fn element_nodes(&self, element: usize) -> &[usize] {
        &self.element_nodes[element]
    }
}

impl Topology for IncidenceList {
    fn num_elements(&self) -> usize {
        self.element_nodes.len()
    }

    fn num_nodes(&self) -> usize {
        self.node_elements.len()
    }

    fn element_node_count(&self, element: usize) -> usize {
        self.element_nodes[element].len()
    }

    fn populate_element_nodes(&self, output: &mut [usize], element: usize) {
        output.copy_from_slice(&self.element_nodes[element]);
    }

    fn populate_node_elements(&self, output: &mut Vec<usize>, node: usize) {
        output.clear();
        output.extend_from_slice(&self.node_elements[node]);
    }
}

/// Flat per-node DOF storage implementing [`DofLayout`].
#[derive(Debug, Clone)]
pub struct NodalField<T> {
    // offsets[n]..offsets[n + 1] index the flat storage of node n
    offsets: Vec<usize>,
    values: Vec<T>,
    bc: Vec<bool>,
}

impl<T: Real> NodalField<T> {
    /// Creates a field with `dofs_per_node` unconstrained DOFs on every node,
    /// all values zero.
    pub fn uniform(num_nodes: usize, dofs_per_node: usize) -> Self {
        let offsets = (0..=num_nodes).map(|n| n * dofs_per_node).collect();
        Self {
            offsets,
            values: vec![T::zero(); num_nodes * dofs_per_node],
            bc: vec![false; num_nodes * dofs_per_node],
        }
    }

    /// Creates a field with a per-node DOF count, all values zero.
    pub fn with_dof_counts(dof_counts: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(dof_counts.len() + 1);
        let mut total = 0;
        offsets.push(0);
        for count in dof_counts {
            total += count;
            offsets.push(total);
        }
        Self {
            offsets,
            values: vec![T::zero(); total],
            bc: vec![false; total],
        }
    }

    fn index(&self, node: usize, dof: usize) -> usize {
        let start = self.offsets[node];
        debug_assert!(dof < self.offsets[node + 1] - start);
        start + dof
    }

    /// Marks (node, dof) as a Dirichlet boundary condition with the given
    /// prescribed value.
    pub fn set_boundary_condition(&mut self, node: usize, dof: usize, value: T) {
        let idx = self.index(node, dof);
        self.bc[idx] = true;
        self.values[idx] = value;
    }
}

impl<T: Real> DofLayout<T> for NodalField<T> {
    fn num_nodes(&self) -> usize {
        self.offsets.len() - 1
    }

    fn dof_count(&self, node: usize) -> usize {
        self.offsets[node + 1] - self.offsets[node]
    }

    fn is_boundary_condition(&self, node: usize, dof: usize) -> bool {
        self.bc[self.index(node, dof)]
    }

    fn value(&self, node: usize, dof: usize) -> T {
        self.values[self.index(node, dof)]
    }

    fn set_value(&mut self, node: usize, dof: usize, value: T) {
        let idx = self.index(node, dof);
        self.values[idx] = value;
    }
}
