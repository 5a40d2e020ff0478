//! Nonlinear iteration over repeated linear solves.
//!
//! The driver treats the linearized problem as a black box: each cycle
//! reassembles the system about the current state, solves it, and compares
//! the new iterate against the previous one. Convergence is declared when
//! the relative change of the solution drops below tolerance on every rank,
//! subject to registered convergence checks, which may veto and force
//! further cycles.

use std::error::Error;
use std::fmt;

use log::{info, warn};
use nalgebra::DVector;
use numeric_literals::replace_float_literals;
use olivine_comm::{CommError, Communicator};
use serde::{Deserialize, Serialize};

use crate::Real;

/// Parameters of the nonlinear iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonlinearSettings<T: Real> {
    /// Relative solution change below which the iteration has converged.
    pub tolerance: T,
    /// Hard bound on the cycle count, the seed solve included.
    pub max_iterations: usize,
    /// Cycles to run before convergence may be declared.
    pub min_iterations: usize,
    /// Whether failure to converge is an error rather than a reported state.
    pub kill_non_convergent: bool,
    /// Relaxation factor blending each new iterate with the previous one;
    /// 1.0 adopts the new iterate unchanged.
    pub damping: T,
}

impl<T: Real> Default for NonlinearSettings<T> {
    #[replace_float_literals(nalgebra::convert(literal))]
    fn default() -> Self {
        Self {
            tolerance: 0.01,
            max_iterations: 500,
            min_iterations: 1,
            kill_non_convergent: true,
            damping: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonlinearState {
    Converged,
    NotConverged,
}

/// Outcome of a nonlinear solve.
#[derive(Debug, Clone)]
pub struct NonlinearReport<T> {
    pub state: NonlinearState,
    /// Cycles run, the seed solve excluded.
    pub iterations: usize,
    pub final_residual: T,
    /// Relative solution change of every cycle, in order.
    pub residual_history: Vec<T>,
}

#[derive(Debug)]
pub enum NonlinearError {
    /// The iteration hit its cycle bound with the residual above tolerance.
    NonConvergence { iterations: usize, residual: f64 },
    /// A linearized solve or state update failed.
    Cycle(eyre::Report),
    Comm(CommError),
}

impl fmt::Display for NonlinearError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NonlinearError::NonConvergence {
                iterations,
                residual,
            } => write!(
                f,
                "nonlinear iteration failed to converge after {} cycles (residual {:.3e})",
                iterations, residual
            ),
            NonlinearError::Cycle(report) => write!(f, "nonlinear cycle failed: {:#}", report),
            NonlinearError::Comm(error) => write!(f, "communication failed: {}", error),
        }
    }
}

impl Error for NonlinearError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NonlinearError::Comm(error) => Some(error),
            _ => None,
        }
    }
}

impl From<eyre::Report> for NonlinearError {
    fn from(report: eyre::Report) -> Self {
        NonlinearError::Cycle(report)
    }
}

impl From<CommError> for NonlinearError {
    fn from(error: CommError) -> Self {
        NonlinearError::Comm(error)
    }
}

/// One linearization cycle of the problem being iterated.
pub trait NonlinearIterable<T: Real> {
    /// Assembles the system about the current state, solves it, and returns
    /// the owned slice of the new iterate.
    fn solve_linearized(&mut self) -> eyre::Result<DVector<T>>;

    /// Adopts `solution` as the current state for the next linearization,
    /// typically by scattering it back onto nodal storage.
    fn update_state(&mut self, solution: &DVector<T>) -> eyre::Result<()>;
}

/// A veto on declared convergence. Checks run only once the residual is
/// below tolerance; returning `true` forces another cycle.
pub trait ConvergenceCheck<T: Real> {
    fn requires_further_iteration(&mut self, iteration: usize, residual: T) -> eyre::Result<bool>;
}

/// Driver for damped fixed-point iteration of a [`NonlinearIterable`].
pub struct NonlinearSolver<T: Real> {
    settings: NonlinearSettings<T>,
    convergence_checks: Vec<Box<dyn ConvergenceCheck<T>>>,
}

impl<T: Real> NonlinearSolver<T> {
    pub fn new(settings: NonlinearSettings<T>) -> Self {
        Self {
            settings,
            convergence_checks: Vec::new(),
        }
    }

    pub fn settings(&self) -> &NonlinearSettings<T> {
        &self.settings
    }

    pub fn add_convergence_check(&mut self, check: Box<dyn ConvergenceCheck<T>>) {
        self.convergence_checks.push(check);
    }

    /// Runs the iteration to convergence or to the cycle bound. Collective:
    /// the residual and the convergence decision are agreed across the
    /// group every cycle.
    pub fn solve<P, C>(
        &mut self,
        problem: &mut P,
        comm: &C,
    ) -> Result<NonlinearReport<T>, NonlinearError>
    where
        P: NonlinearIterable<T>,
        C: Communicator,
    {
        let Self {
            settings,
            convergence_checks,
        } = self;
        let one = T::one();

        let mut current = problem.solve_linearized()?;
        problem.update_state(&current)?;

        let mut residual_history = Vec::new();
        let mut final_residual = T::zero();
        let mut iterations = 0;

        for iteration in 1..settings.max_iterations {
            let previous = std::mem::replace(&mut current, problem.solve_linearized()?);
            if settings.damping != one {
                // current <- damping * current + (1 - damping) * previous
                current.axpy(one - settings.damping, &previous, settings.damping);
            }
            problem.update_state(&current)?;

            let residual = relative_change(&previous, &current, comm)?;
            residual_history.push(residual);
            final_residual = residual;
            iterations = iteration;
            info!(
                "nonlinear cycle {}: relative solution change {:?}",
                iteration, residual
            );

            let mut converged =
                residual < settings.tolerance && iteration >= settings.min_iterations;
            if converged {
                for check in convergence_checks.iter_mut() {
                    if check.requires_further_iteration(iteration, residual)? {
                        converged = false;
                        break;
                    }
                }
            }
            if comm.all_reduce_or(converged)? {
                info!("nonlinear iteration converged after {} cycles", iteration);
                return Ok(NonlinearReport {
                    state: NonlinearState::Converged,
                    iterations,
                    final_residual,
                    residual_history,
                });
            }
        }

        let residual = nalgebra::try_convert::<T, f64>(final_residual).unwrap_or(f64::NAN);
        warn!(
            "nonlinear iteration hit the bound of {} cycles with residual {:.3e}",
            settings.max_iterations, residual
        );
        if settings.kill_non_convergent {
            Err(NonlinearError::NonConvergence {
                iterations,
                residual,
            })
        } else {
            Ok(NonlinearReport {
                state: NonlinearState::NotConverged,
                iterations,
                final_residual,
                residual_history,
            })
        }
    }
}

/// The group-wide relative L2 change from `previous` to `current`.
///
/// Each rank contributes its owned slice; the norms are completed with a
/// global sum. For a zero solution the absolute change is returned instead.
fn relative_change<T: Real, C: Communicator>(
    previous: &DVector<T>,
    current: &DVector<T>,
    comm: &C,
) -> Result<T, NonlinearError> {
    let mut change_sq = 0.0f64;
    let mut norm_sq = 0.0f64;
    for (p, c) in previous.iter().zip(current.iter()) {
        let p = nalgebra::try_convert::<T, f64>(*p).unwrap_or(f64::NAN);
        let c = nalgebra::try_convert::<T, f64>(*c).unwrap_or(f64::NAN);
        change_sq += (p - c) * (p - c);
        norm_sq += c * c;
    }
    let change = comm.all_reduce_sum(change_sq)?.sqrt();
    let norm = comm.all_reduce_sum(norm_sq)?.sqrt();
    let residual = if norm > 0.0 { change / norm } else { change };
    Ok(nalgebra::convert(residual))
}
