//! Numeric evaluation of right-hand side Functions inside the stepper loop.

use std::cell::Cell;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::client::DiffClient;
use crate::error::{DiffError, DiffResult};
use crate::eval::impl_generic::{NumericAlgebra, sweep};
use crate::function::Function;

/// Evaluates a Function whose first input is time and first output is the
/// derivative, counting evaluations.
pub(crate) struct RhsEvaluator<'a, R: Runtime, C> {
    alg: NumericAlgebra<'a, R, C>,
    client: &'a C,
    function: &'a Function,
    evaluations: Cell<usize>,
}

impl<'a, R, C> RhsEvaluator<'a, R, C>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    pub(crate) fn new(client: &'a C, function: &'a Function) -> Self {
        Self {
            alg: NumericAlgebra::new(client),
            client,
            function,
            evaluations: Cell::new(0),
        }
    }

    /// Evaluate at time `t` with the remaining inputs `rest`.
    pub(crate) fn eval(&self, t: f64, rest: &[&Tensor<R>]) -> DiffResult<Tensor<R>> {
        let mut inputs = Vec::with_capacity(rest.len() + 1);
        inputs.push(Tensor::<R>::from_slice(&[t], &[1, 1], self.client.device()));
        inputs.extend(rest.iter().map(|&v| v.clone()));
        self.evaluations.set(self.evaluations.get() + 1);

        let mut outputs = sweep::evaluate(&self.alg, self.function.program(), &inputs)?;
        if outputs.is_empty() {
            return Err(DiffError::DimensionError {
                context: format!("{} has no outputs", self.function.name()),
            });
        }
        Ok(outputs.swap_remove(0))
    }

    pub(crate) fn evaluations(&self) -> usize {
        self.evaluations.get()
    }
}
