//! Element-local term traits.
//!
//! A term is the smallest unit of physics: it produces the dense element
//! matrix or element vector of one integral for one element. Several terms
//! may be attached to the same global matrix or vector, in which case their
//! element contributions are summed.

use nalgebra::{DMatrixViewMut, DVectorViewMut};

use crate::Real;

/// A term contributing to a global matrix.
pub trait ElementMatrixTerm<T: Real> {
    /// Accumulates the element matrix of `element` onto `output`.
    ///
    /// `output` is `n_row_dofs` by `n_col_dofs` for the element, laid out in
    /// incidence order (all DOFs of the first node, then the second, and so
    /// on). The view holds contributions of previously evaluated terms, so
    /// implementations must add onto it rather than overwrite it.
    fn assemble_element_matrix_into(
        &self,
        element: usize,
        output: DMatrixViewMut<'_, T>,
    ) -> eyre::Result<()>;
}

/// A term contributing to a global vector.
pub trait ElementVectorTerm<T: Real> {
    /// Accumulates the element vector of `element` onto `output`.
    ///
    /// The layout and add-onto contract match
    /// [`ElementMatrixTerm::assemble_element_matrix_into`].
    fn assemble_element_vector_into(
        &self,
        element: usize,
        output: DVectorViewMut<'_, T>,
    ) -> eyre::Result<()>;
}

impl<T: Real, F> ElementMatrixTerm<T> for F
where
    F: Fn(usize, DMatrixViewMut<'_, T>) -> eyre::Result<()>,
{
    fn assemble_element_matrix_into(
        &self,
        element: usize,
        output: DMatrixViewMut<'_, T>,
    ) -> eyre::Result<()> {
        self(element, output)
    }
}

impl<T: Real, F> ElementVectorTerm<T> for F
where
    F: Fn(usize, DVectorViewMut<'_, T>) -> eyre::Result<()>,
{
    fn assemble_element_vector_into(
        &self,
        element: usize,
        output: DVectorViewMut<'_, T>,
    ) -> eyre::Result<()> {
        self(element, output)
    }
}
