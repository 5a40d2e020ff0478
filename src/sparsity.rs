//! Estimation of the global matrix sparsity pattern.
//!
//! Before a distributed matrix can be allocated, each rank needs an upper
//! bound on the nonzeros of every row it owns, split into the diagonal block
//! (columns owned by the same rank) and the off-diagonal block (columns owned
//! elsewhere). The estimate is conservative: overcounting merely wastes
//! preallocation, while undercounting is a correctness bug.

use log::info;
use olivine_comm::{CommError, Communicator};
use rustc_hash::FxHashSet;

use crate::connectivity::Topology;
use crate::numbering::EquationSpace;

/// Per-owned-row nonzero counts, indexed by local row offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonzeroPattern {
    pub diagonal: Vec<usize>,
    pub off_diagonal: Vec<usize>,
}

impl NonzeroPattern {
    pub fn num_rows(&self) -> usize {
        self.diagonal.len()
    }

    /// Total estimated nonzeros over all locally owned rows.
    pub fn local_total(&self) -> usize {
        self.diagonal.iter().sum::<usize>() + self.off_diagonal.iter().sum::<usize>()
    }
}

/// Estimates the nonzero counts of every locally owned row equation.
///
/// For each owned row equation, every column equation reachable through an
/// element shared with the owning node is counted once. Rows whose DOFs are
/// all constrained contribute no equations and are skipped. The row and column
/// topologies must have one-to-one element overlap.
///
/// The estimate bounds the assembled counts only when the local topology
/// lists every element incident on an owned row, including ghost elements
/// held by neighbouring partitions. A partition storing interior elements
/// only undercounts the rows along the cut, and the backend must then treat
/// the per-row counts as a hint rather than a hard capacity.
///
/// The net count is sum-reduced across the group and reported at info level,
/// so this is a collective call.
pub fn estimate_nonzeros<C: Communicator>(
    row_topology: &dyn Topology,
    row_space: &EquationSpace,
    col_topology: &dyn Topology,
    col_space: &EquationSpace,
    comm: &C,
) -> Result<NonzeroPattern, CommError> {
    let num_owned = row_space.ownership().num_owned();
    let mut diagonal = vec![0; num_owned];
    let mut off_diagonal = vec![0; num_owned];
    let mut net_nonzeros = 0usize;

    let mut seen_cols = FxHashSet::default();
    let mut node_elements = Vec::new();
    let mut col_nodes = Vec::new();

    for node in 0..row_space.num_nodes() {
        for dof in 0..row_space.dof_count(node) {
            let row_eq = match row_space.equation(node, dof) {
                Some(eq) => eq,
                None => continue,
            };
            let local_row = match row_space.ownership().local_offset(row_eq) {
                Some(offset) => offset,
                None => continue,
            };

            row_topology.populate_node_elements(&mut node_elements, node);
            seen_cols.clear();

            for &element in &node_elements {
                col_nodes.resize(col_topology.element_node_count(element), 0);
                col_topology.populate_element_nodes(&mut col_nodes, element);

                for &col_node in &col_nodes {
                    for col_dof in 0..col_space.dof_count(col_node) {
                        let col_eq = match col_space.equation(col_node, col_dof) {
                            Some(eq) => eq,
                            None => continue,
                        };
                        if seen_cols.insert(col_eq) {
                            if col_space.ownership().is_owned(col_eq) {
                                diagonal[local_row] += 1;
                            } else {
                                off_diagonal[local_row] += 1;
                            }
                            net_nonzeros += 1;
                        }
                    }
                }
            }
        }
    }

    let net_global = comm.all_reduce_sum(net_nonzeros as f64)?;
    info!("estimated {} nonzero entries across the group", net_global as u64);

    Ok(NonzeroPattern { diagonal, off_diagonal })
}
