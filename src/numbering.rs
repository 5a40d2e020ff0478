//! Partitioned global equation numbering.
//!
//! Every unconstrained DOF of a field maps to exactly one global equation, and
//! every global equation is owned by exactly one rank. Constrained (Dirichlet)
//! DOFs map to no equation when boundary conditions are eliminated from the
//! system, and to an ordinary equation when they are retained.

use crate::connectivity::Topology;

/// The contiguous partition of the global equation index space across ranks.
///
/// Each rank owns the half-open range `[first_owned[rank], first_owned[rank + 1])`
/// (the last rank's range ends at the total equation count). Empty ranges are
/// permitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquationOwnership {
    rank: usize,
    first_owned: Vec<usize>,
    num_equations: usize,
}

impl EquationOwnership {
    /// Constructs the partition from the lowest owned equation of every rank.
    ///
    /// `first_owned` must start at zero and be non-decreasing, and every entry
    /// must be bounded by `num_equations`.
    pub fn new(rank: usize, first_owned: Vec<usize>, num_equations: usize) -> Self {
        assert!(rank < first_owned.len(), "rank {} outside partition of {} ranks", rank, first_owned.len());
        assert_eq!(first_owned.first(), Some(&0), "the first rank must own from equation 0");
        assert!(
            first_owned.windows(2).all(|w| w[0] <= w[1]) && *first_owned.last().unwrap() <= num_equations,
            "per-rank lowest owned equations must be non-decreasing and bounded by the equation count"
        );
        Self {
            rank,
            first_owned,
            num_equations,
        }
    }

    /// Constructs the partition from the number of equations owned by each rank.
    pub fn from_owned_counts(rank: usize, owned_counts: &[usize]) -> Self {
        let mut first_owned = Vec::with_capacity(owned_counts.len());
        let mut total = 0;
        for count in owned_counts {
            first_owned.push(total);
            total += count;
        }
        Self::new(rank, first_owned, total)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.first_owned.len()
    }

    pub fn num_equations(&self) -> usize {
        self.num_equations
    }

    /// The half-open range of equations owned by `rank`.
    pub fn owned_range_of(&self, rank: usize) -> std::ops::Range<usize> {
        let start = self.first_owned[rank];
        let end = self
            .first_owned
            .get(rank + 1)
            .copied()
            .unwrap_or(self.num_equations);
        start..end
    }

    /// The half-open range of equations owned by this rank.
    pub fn owned_range(&self) -> std::ops::Range<usize> {
        self.owned_range_of(self.rank)
    }

    pub fn num_owned(&self) -> usize {
        self.owned_range().len()
    }

    /// The rank owning `equation`.
    pub fn owning_rank(&self, equation: usize) -> usize {
        debug_assert!(equation < self.num_equations);
        // The last rank whose range starts at or before the equation; ranks
        // with empty ranges at the same boundary start strictly later in the
        // partition-point order, so this rank's range contains the equation.
        self.first_owned.partition_point(|&first| first <= equation) - 1
    }

    /// The 0-based local storage offset of `equation` if this rank owns it.
    pub fn local_offset(&self, equation: usize) -> Option<usize> {
        let range = self.owned_range();
        range.contains(&equation).then(|| equation - range.start)
    }

    pub fn is_owned(&self, equation: usize) -> bool {
        self.local_offset(equation).is_some()
    }
}

/// The node + DOF → global equation mapping of one field, together with the
/// equation ownership partition.
///
/// A `None` slot is the "constrained" sentinel: the DOF carries a Dirichlet
/// value and no equation.
#[derive(Debug, Clone)]
pub struct EquationSpace {
    equations: Vec<Vec<Option<usize>>>,
    ownership: EquationOwnership,
}

impl EquationSpace {
    pub fn new(equations: Vec<Vec<Option<usize>>>, ownership: EquationOwnership) -> Self {
        debug_assert!(equations
            .iter()
            .flatten()
            .flatten()
            .all(|&eq| eq < ownership.num_equations()));
        Self { equations, ownership }
    }

    pub fn num_nodes(&self) -> usize {
        self.equations.len()
    }

    pub fn dof_count(&self, node: usize) -> usize {
        self.equations[node].len()
    }

    /// The global equation of (node, dof), or `None` if the DOF is constrained.
    pub fn equation(&self, node: usize, dof: usize) -> Option<usize> {
        self.equations[node][dof]
    }

    pub fn ownership(&self) -> &EquationOwnership {
        &self.ownership
    }

    pub fn num_equations(&self) -> usize {
        self.ownership.num_equations()
    }
}

/// Lazily built per-element location matrices.
///
/// The location matrix of an element is the flat list of equation slots for
/// its local DOFs, in incidence order. Rows are built on first use and cached
/// until [`LocationMatrixCache::invalidate`] is called (required whenever the
/// equation numbering is rebuilt).
#[derive(Debug, Clone, Default)]
pub struct LocationMatrixCache {
    rows: Vec<Option<Vec<Option<usize>>>>,
    node_scratch: Vec<usize>,
}

impl LocationMatrixCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures the location matrix of every element is built.
    pub fn build_all(&mut self, topology: &dyn Topology, space: &EquationSpace) {
        for element in 0..topology.num_elements() {
            self.row(topology, space, element);
        }
    }

    /// The location matrix of `element`, building it on first use.
    pub fn row(&mut self, topology: &dyn Topology, space: &EquationSpace, element: usize) -> &[Option<usize>] {
        if self.rows.len() < topology.num_elements() {
            self.rows.resize(topology.num_elements(), None);
        }
        if self.rows[element].is_none() {
            let node_count = topology.element_node_count(element);
            self.node_scratch.resize(node_count, 0);
            topology.populate_element_nodes(&mut self.node_scratch, element);
            let mut row = Vec::new();
            for &node in &self.node_scratch {
                for dof in 0..space.dof_count(node) {
                    row.push(space.equation(node, dof));
                }
            }
            self.rows[element] = Some(row);
        }
        self.rows[element].as_deref().unwrap()
    }

    /// A previously built row. Panics if [`LocationMatrixCache::build_all`]
    /// has not run since the last invalidation.
    pub fn built_row(&self, element: usize) -> &[Option<usize>] {
        self.rows[element]
            .as_deref()
            .expect("location matrix row not built")
    }

    /// Drops all cached rows. Must be called when the equation numbering of
    /// the associated field changes.
    pub fn invalidate(&mut self) {
        self.rows.clear();
    }
}
