//! Numeric evaluation trait and result types.

use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::error::DiffResult;
use crate::function::Function;

/// Result of a numeric derivative sweep.
#[derive(Debug, Clone)]
pub struct SweepResult<R: Runtime> {
    /// Output values, one per Function output.
    pub outputs: Vec<Tensor<R>>,

    /// Output tangents (forward sweep) or input adjoints (adjoint sweep).
    pub derivatives: Vec<Tensor<R>>,
}

/// Numeric evaluation and derivative sweeps over compiled Functions.
///
/// Each call owns its working buffers, so one Function may be evaluated from
/// several threads at once.
pub trait EvaluationAlgorithms<R: Runtime> {
    /// Evaluate all outputs of `f`.
    fn evaluate(&self, f: &Function, inputs: &[Tensor<R>]) -> DiffResult<Vec<Tensor<R>>>;

    /// Propagate one tangent direction from inputs to outputs.
    ///
    /// `tangents[i]` is the tangent of input `i`; `None` means zero.
    fn forward_sweep(
        &self,
        f: &Function,
        inputs: &[Tensor<R>],
        tangents: &[Option<Tensor<R>>],
    ) -> DiffResult<SweepResult<R>>;

    /// Propagate one set of output seeds back to the inputs.
    ///
    /// `seeds[j]` seeds output `j`; `None` means zero.
    fn adjoint_sweep(
        &self,
        f: &Function,
        inputs: &[Tensor<R>],
        seeds: &[Option<Tensor<R>>],
    ) -> DiffResult<SweepResult<R>>;
}
