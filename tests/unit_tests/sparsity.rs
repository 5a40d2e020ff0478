use nalgebra::DMatrixViewMut;
use olivine::assembly::{BcPolicy, ElementAssembler, ElementMatrixTerm, FieldSlice};
use olivine::backend::native::{NativeBackend, NativeVector};
use olivine::backend::{DistributedMatrix, LinearBackend, Preallocation};
use olivine::comm::{Communicator, SingleProcess};
use olivine::connectivity::{IncidenceList, NodalField, Topology};
use olivine::numbering::LocationMatrixCache;
use olivine::sparsity::estimate_nonzeros;
use proptest::collection::vec;
use proptest::prelude::*;

use super::{chain_topology, number_equations, run_on_group};

#[test]
fn chain_pattern_counts_neighbours() {
    let topology = chain_topology(4);
    let field = NodalField::<f64>::uniform(5, 1);
    let space = number_equations(&field, BcPolicy::Eliminate, 0, 1);

    let pattern =
        estimate_nonzeros(&topology, &space, &topology, &space, &SingleProcess).unwrap();
    assert_eq!(pattern.num_rows(), 5);
    assert_eq!(pattern.diagonal, vec![2, 3, 3, 3, 2]);
    assert_eq!(pattern.off_diagonal, vec![0; 5]);
    assert_eq!(pattern.local_total(), 13);
}

#[test]
fn eliminated_constraints_shrink_the_pattern() {
    let topology = chain_topology(4);
    let mut field = NodalField::<f64>::uniform(5, 1);
    field.set_boundary_condition(0, 0, 1.0);
    let space = number_equations(&field, BcPolicy::Eliminate, 0, 1);

    let pattern =
        estimate_nonzeros(&topology, &space, &topology, &space, &SingleProcess).unwrap();
    // Rows for nodes 1..4; node 1 lost its constrained neighbour column.
    assert_eq!(pattern.diagonal, vec![2, 3, 3, 2]);
    assert_eq!(pattern.off_diagonal, vec![0; 4]);
}

#[test]
fn split_ownership_separates_diagonal_and_off_diagonal() {
    run_on_group(2, |comm| {
        let topology = chain_topology(4);
        let field = NodalField::<f64>::uniform(5, 1);
        let space = number_equations(&field, BcPolicy::Eliminate, comm.rank(), 2);

        let pattern = estimate_nonzeros(&topology, &space, &topology, &space, &comm).unwrap();
        if comm.rank() == 0 {
            // Owns equations 0..3; node 2 couples to equation 3 across the cut.
            assert_eq!(pattern.diagonal, vec![2, 3, 2]);
            assert_eq!(pattern.off_diagonal, vec![0, 0, 1]);
        } else {
            // Owns equations 3..5; node 3 couples back to equation 2.
            assert_eq!(pattern.diagonal, vec![2, 2]);
            assert_eq!(pattern.off_diagonal, vec![1, 0]);
        }
    });
}

proptest! {
    /// Whatever the incidence, the estimate must bound the true row counts
    /// of an assembled all-ones operator.
    #[test]
    fn estimated_counts_bound_assembled_rows(elements in vec(vec(0usize..6, 2..4), 1..8)) {
        let topology = IncidenceList::new(6, elements);
        let field = NodalField::<f64>::uniform(6, 1);
        let space = number_equations(&field, BcPolicy::Eliminate, 0, 1);
        let pattern =
            estimate_nonzeros(&topology, &space, &topology, &space, &SingleProcess).unwrap();

        let slice = FieldSlice {
            topology: &topology,
            layout: &field,
            space: &space,
        };
        let backend = NativeBackend::new(SingleProcess);
        let mut matrix = backend
            .create_matrix(space.ownership(), space.ownership(), Preallocation::PerRow(&pattern))
            .unwrap();
        let mut cache = LocationMatrixCache::new();
        cache.build_all(&topology, &space);
        let assembler = ElementAssembler::new(BcPolicy::Eliminate, false);
        let ones = |_element: usize, mut output: DMatrixViewMut<'_, f64>| -> eyre::Result<()> {
            output.add_scalar_mut(1.0);
            Ok(())
        };
        let terms: Vec<Box<dyn ElementMatrixTerm<f64>>> = vec![Box::new(ones)];
        for element in 0..topology.num_elements() {
            assembler
                .assemble_matrix_element(
                    element,
                    &terms,
                    &slice,
                    &slice,
                    cache.built_row(element),
                    cache.built_row(element),
                    None,
                    &mut matrix,
                    Option::<&mut NativeVector<f64, SingleProcess>>::None,
                    None,
                )
                .unwrap();
        }
        matrix.finalize().unwrap();

        let csr = matrix.owned_block().unwrap();
        let offsets = csr.row_offsets();
        for row in 0..csr.nrows() {
            let assembled = offsets[row + 1] - offsets[row];
            prop_assert!(assembled <= pattern.diagonal[row] + pattern.off_diagonal[row]);
        }
    }
}

#[test]
fn multiple_dofs_per_node_multiply_the_counts() {
    let topology = chain_topology(2);
    let field = NodalField::<f64>::uniform(3, 2);
    let space = number_equations(&field, BcPolicy::Eliminate, 0, 1);

    let pattern =
        estimate_nonzeros(&topology, &space, &topology, &space, &SingleProcess).unwrap();
    assert_eq!(pattern.diagonal, vec![4, 4, 6, 6, 4, 4]);
}
