//! Assembly of element-local term contributions into global systems.
//!
//! [`local`] defines the element term traits that produce dense element
//! matrices and vectors, [`rotation`] applies per-node local coordinate
//! frames to them, and [`global`] scatters them into distributed storage
//! while enforcing Dirichlet boundary conditions.

pub mod global;
pub mod local;
pub mod rotation;

pub use global::{BcPolicy, ElementAssembler, FieldSlice};
pub use local::{ElementMatrixTerm, ElementVectorTerm};
pub use rotation::{NodeRotation, NodeRotationTable, MAX_ELEMENT_NODES};
