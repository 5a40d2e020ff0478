use eyre::Result;
use matrixcompare::assert_matrix_eq;
use nalgebra::{DMatrix, DMatrixViewMut, Vector3};
use olivine::assembly::{
    BcPolicy, ElementAssembler, ElementMatrixTerm, FieldSlice, NodeRotation, NodeRotationTable,
};
use olivine::backend::native::{NativeBackend, NativeMatrix, NativeVector};
use olivine::backend::{DistributedMatrix, DistributedVector, LinearBackend, Preallocation};
use olivine::comm::SingleProcess;
use olivine::connectivity::{IncidenceList, NodalField};
use olivine::numbering::LocationMatrixCache;

use super::{chain_topology, number_equations, SegmentStiffness};

fn dense_of(matrix: &NativeMatrix<f64, SingleProcess>) -> DMatrix<f64> {
    let csr = matrix.owned_block().expect("matrix must be finalized");
    let mut dense = DMatrix::zeros(csr.nrows(), csr.ncols());
    for (i, j, value) in csr.triplet_iter() {
        dense[(i, j)] += value;
    }
    dense
}

struct Fixture {
    topology: IncidenceList,
    field: NodalField<f64>,
}

impl Fixture {
    fn chain(num_elements: usize, dofs_per_node: usize) -> Self {
        Self {
            topology: chain_topology(num_elements),
            field: NodalField::uniform(num_elements + 1, dofs_per_node),
        }
    }
}

#[test]
fn unconstrained_chain_assembles_tridiagonal_stiffness() {
    let fixture = Fixture::chain(2, 1);
    let space = number_equations(&fixture.field, BcPolicy::Eliminate, 0, 1);
    let slice = FieldSlice {
        topology: &fixture.topology,
        layout: &fixture.field,
        space: &space,
    };

    let backend = NativeBackend::new(SingleProcess);
    let mut matrix: NativeMatrix<f64, _> = backend
        .create_matrix(space.ownership(), space.ownership(), Preallocation::Uniform(3))
        .unwrap();
    let mut cache = LocationMatrixCache::new();
    cache.build_all(&fixture.topology, &space);

    let assembler = ElementAssembler::new(BcPolicy::Eliminate, true);
    let terms: Vec<Box<dyn ElementMatrixTerm<f64>>> = vec![Box::new(SegmentStiffness)];
    for element in 0..2 {
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

    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(3, 3, &[
         1.0, -1.0,  0.0,
        -1.0,  2.0, -1.0,
         0.0, -1.0,  1.0,
    ]);
    assert_matrix_eq!(dense_of(&matrix), expected, comp = abs, tol = 1e-14);
}

#[test]
fn eliminated_constraint_folds_into_the_rhs() {
    let mut fixture = Fixture::chain(2, 1);
    fixture.field.set_boundary_condition(0, 0, 5.0);
    let space = number_equations(&fixture.field, BcPolicy::Eliminate, 0, 1);
    let slice = FieldSlice {
        topology: &fixture.topology,
        layout: &fixture.field,
        space: &space,
    };

    let backend = NativeBackend::new(SingleProcess);
    let mut matrix: NativeMatrix<f64, _> = backend
        .create_matrix(space.ownership(), space.ownership(), Preallocation::Uniform(3))
        .unwrap();
    let mut rhs = backend.create_vector(space.ownership()).unwrap();
    let mut cache = LocationMatrixCache::new();
    cache.build_all(&fixture.topology, &space);

    let assembler = ElementAssembler::new(BcPolicy::Eliminate, true);
    let terms: Vec<Box<dyn ElementMatrixTerm<f64>>> = vec![Box::new(SegmentStiffness)];
    for element in 0..2 {
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
                Some(&mut rhs),
                None,
            )
            .unwrap();
    }
    matrix.finalize().unwrap();
    rhs.finalize().unwrap();

    // The constrained node carries no equation; its column moves over as
    // -A[., bc] * 5 = +5 on the neighbouring equation.
    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(2, 2, &[
         2.0, -1.0,
        -1.0,  1.0,
    ]);
    assert_matrix_eq!(dense_of(&matrix), expected, comp = abs, tol = 1e-14);
    assert_eq!(rhs.owned_values(), &[5.0, 0.0]);
}

#[test]
fn transposed_corrections_use_the_row_constraints() {
    // Rectangular block: rows from a 2-DOF field, columns from a 1-DOF field
    // on the same chain, with a constrained row DOF.
    let topology = chain_topology(1);
    let mut row_field = NodalField::<f64>::uniform(2, 2);
    row_field.set_boundary_condition(0, 0, 2.0);
    let col_field = NodalField::<f64>::uniform(2, 1);
    let row_space = number_equations(&row_field, BcPolicy::Eliminate, 0, 1);
    let col_space = number_equations(&col_field, BcPolicy::Eliminate, 0, 1);
    let row = FieldSlice {
        topology: &topology,
        layout: &row_field,
        space: &row_space,
    };
    let col = FieldSlice {
        topology: &topology,
        layout: &col_field,
        space: &col_space,
    };

    let backend = NativeBackend::new(SingleProcess);
    let mut matrix: NativeMatrix<f64, _> = backend
        .create_matrix(row_space.ownership(), col_space.ownership(), Preallocation::Uniform(2))
        .unwrap();
    let mut trans_rhs = backend.create_vector(col_space.ownership()).unwrap();
    let mut row_cache = LocationMatrixCache::new();
    row_cache.build_all(&topology, &row_space);
    let mut col_cache = LocationMatrixCache::new();
    col_cache.build_all(&topology, &col_space);

    struct Ones;
    impl ElementMatrixTerm<f64> for Ones {
        fn assemble_element_matrix_into(
            &self,
            _element: usize,
            mut output: DMatrixViewMut<'_, f64>,
        ) -> Result<()> {
            output.add_scalar_mut(1.0);
            Ok(())
        }
    }

    let assembler = ElementAssembler::new(BcPolicy::Eliminate, false);
    let terms: Vec<Box<dyn ElementMatrixTerm<f64>>> = vec![Box::new(Ones)];
    assembler
        .assemble_matrix_element(
            0,
            &terms,
            &row,
            &col,
            row_cache.built_row(0),
            col_cache.built_row(0),
            None,
            &mut matrix,
            Option::<&mut NativeVector<f64, SingleProcess>>::None,
            Some(&mut trans_rhs),
        )
        .unwrap();
    matrix.finalize().unwrap();
    trans_rhs.finalize().unwrap();

    // The constrained row DOF contributes -2 * 1 to every column equation.
    assert_eq!(trans_rhs.owned_values(), &[-2.0, -2.0]);
}

#[test]
fn rotation_conjugates_the_element_block() {
    // One element, two nodes with two DOFs each. The first node carries a
    // quarter-turn frame; a diagonal element block must come out conjugated
    // on that node's rows and columns.
    let topology = chain_topology(1);
    let field = NodalField::<f64>::uniform(2, 2);
    let space = number_equations(&field, BcPolicy::Eliminate, 0, 1);
    let slice = FieldSlice {
        topology: &topology,
        layout: &field,
        space: &space,
    };

    let mut rotation = NodeRotationTable::new(2, 2);
    #[rustfmt::skip]
    rotation.set(0, DMatrix::from_row_slice(2, 2, &[
        0.0, -1.0,
        1.0,  0.0,
    ]));

    struct DiagonalBlock;
    impl ElementMatrixTerm<f64> for DiagonalBlock {
        fn assemble_element_matrix_into(
            &self,
            _element: usize,
            mut output: DMatrixViewMut<'_, f64>,
        ) -> Result<()> {
            for i in 0..4 {
                output[(i, i)] += (i + 1) as f64;
            }
            Ok(())
        }
    }

    let backend = NativeBackend::new(SingleProcess);
    let mut matrix: NativeMatrix<f64, _> = backend
        .create_matrix(space.ownership(), space.ownership(), Preallocation::Uniform(4))
        .unwrap();
    let mut cache = LocationMatrixCache::new();
    cache.build_all(&topology, &space);

    let assembler = ElementAssembler::new(BcPolicy::Eliminate, true);
    let terms: Vec<Box<dyn ElementMatrixTerm<f64>>> = vec![Box::new(DiagonalBlock)];
    assembler
        .assemble_matrix_element(
            0,
            &terms,
            &slice,
            &slice,
            cache.built_row(0),
            cache.built_row(0),
            Some(&rotation),
            &mut matrix,
            Option::<&mut NativeVector<f64, SingleProcess>>::None,
            None,
        )
        .unwrap();
    matrix.finalize().unwrap();

    // R^T diag(1, 2) R swaps the rotated node's diagonal; the other node is
    // untouched.
    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(4, 4, &[
        2.0, 0.0, 0.0, 0.0,
        0.0, 1.0, 0.0, 0.0,
        0.0, 0.0, 3.0, 0.0,
        0.0, 0.0, 0.0, 4.0,
    ]);
    assert_matrix_eq!(dense_of(&matrix), expected, comp = abs, tol = 1e-14);
}

#[test]
fn surface_frames_complete_the_basis_with_a_cross_product() {
    let mut rotation = NodeRotationTable::new(3, 2);
    rotation.set_surface_frame(0, Vector3::new(0.0, 1.0, 0.0), Vector3::new(0.0, 0.0, 1.0));
    assert!(rotation.is_rotated(0));
    assert!(!rotation.is_rotated(1));

    let mut frame = DMatrix::zeros(3, 3);
    rotation.populate_node_rotation(frame.as_view_mut(), 0);
    // Columns are e1, e2 and e1 x e2 = x.
    #[rustfmt::skip]
    let expected = DMatrix::from_row_slice(3, 3, &[
        0.0, 0.0, 1.0,
        1.0, 0.0, 0.0,
        0.0, 1.0, 0.0,
    ]);
    assert_matrix_eq!(frame, expected, comp = abs, tol = 1e-14);
}

#[test]
fn degenerate_elements_fail_assembly() {
    let topology = IncidenceList::new(2, vec![vec![0, 1]]);
    let field = NodalField::<f64>::with_dof_counts(&[0, 0]);
    let space = number_equations(&field, BcPolicy::Eliminate, 0, 1);
    let slice = FieldSlice {
        topology: &topology,
        layout: &field,
        space: &space,
    };

    let backend = NativeBackend::new(SingleProcess);
    let mut matrix: NativeMatrix<f64, _> = backend
        .create_matrix(space.ownership(), space.ownership(), Preallocation::Uniform(1))
        .unwrap();
    let assembler = ElementAssembler::new(BcPolicy::Eliminate, false);
    let terms: Vec<Box<dyn ElementMatrixTerm<f64>>> = vec![Box::new(SegmentStiffness)];
    let location: Vec<Option<usize>> = Vec::new();
    let result = assembler.assemble_matrix_element(
        0,
        &terms,
        &slice,
        &slice,
        &location,
        &location,
        None,
        &mut matrix,
        Option::<&mut NativeVector<f64, SingleProcess>>::None,
        None,
    );
    assert!(result.is_err());
}

#[test]
fn non_finite_entries_fail_the_finite_check() {
    let fixture = Fixture::chain(1, 1);
    let space = number_equations(&fixture.field, BcPolicy::Eliminate, 0, 1);
    let slice = FieldSlice {
        topology: &fixture.topology,
        layout: &fixture.field,
        space: &space,
    };

    struct Nan;
    impl ElementMatrixTerm<f64> for Nan {
        fn assemble_element_matrix_into(
            &self,
            _element: usize,
            mut output: DMatrixViewMut<'_, f64>,
        ) -> Result<()> {
            output[(0, 0)] += f64::NAN;
            Ok(())
        }
    }

    let backend = NativeBackend::new(SingleProcess);
    let mut matrix: NativeMatrix<f64, _> = backend
        .create_matrix(space.ownership(), space.ownership(), Preallocation::Uniform(2))
        .unwrap();
    let mut cache = LocationMatrixCache::new();
    cache.build_all(&fixture.topology, &space);

    let assembler = ElementAssembler::new(BcPolicy::Eliminate, true);
    let terms: Vec<Box<dyn ElementMatrixTerm<f64>>> = vec![Box::new(Nan)];
    let result = assembler.assemble_matrix_element(
        0,
        &terms,
        &slice,
        &slice,
        cache.built_row(0),
        cache.built_row(0),
        None,
        &mut matrix,
        Option::<&mut NativeVector<f64, SingleProcess>>::None,
        None,
    );
    let message = format!("{:#}", result.unwrap_err());
    assert!(message.contains("non-finite"));
}
