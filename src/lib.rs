//! Distributed finite element system assembly and nonlinear solve
//! orchestration.
//!
//! This crate is the linear-system core of a parallel PDE engine: given a
//! mesh topology, a per-node degree-of-freedom layout and a partitioned
//! global equation numbering (all consumed through traits), it
//!
//! - estimates the sparsity pattern of the global system matrix
//!   ([`sparsity`]),
//! - accumulates element-local term contributions into distributed matrices
//!   and right-hand-side vectors, applying Dirichlet boundary conditions and
//!   optional local-frame rotations ([`assembly`], [`system`]),
//! - gathers remotely-owned solution values back onto local nodes after a
//!   solve ([`gather`]), and
//! - drives damped fixed-point or Newton-type nonlinear iterations to
//!   convergence ([`nonlinear`]).
//!
//! The linear solve itself is an opaque service behind
//! [`backend::LinearBackend`]; a reference implementation backed by
//! `nalgebra-sparse` lives in [`backend::native`]. Inter-rank communication
//! goes through the [`comm::Communicator`] trait, so the same code runs on a
//! single process, on in-process rank groups (used by the test suite) or on
//! a real message-passing runtime.

use nalgebra::RealField;

pub mod assembly;
pub mod backend;
pub mod connectivity;
pub mod gather;
pub mod nonlinear;
pub mod numbering;
pub mod sparsity;
pub mod system;

pub mod comm {
    pub use olivine_comm::*;
}

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

/// Scalar type used by this crate's numerical routines.
pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}
