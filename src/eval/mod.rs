//! Evaluation and derivative propagation.
//!
//! A compiled [`Function`](crate::function::Function) is evaluated by a single
//! topological pass. Forward-mode sweeps carry tangents alongside values;
//! adjoint-mode sweeps evaluate first, then walk the program in reverse
//! accumulating adjoints.
//!
//! The per-operation rules live in one table (`rules`) and are generic over
//! the value domain, so the numeric sweeps here and the symbolic sweeps used
//! to build derivative Functions share a single implementation.

pub(crate) mod algebra;
pub mod cpu;
pub mod impl_generic;
pub(crate) mod rules;
pub mod traits;

pub use impl_generic::{adjoint_sweep_impl, evaluate_impl, forward_sweep_impl};
pub use traits::{EvaluationAlgorithms, SweepResult};
