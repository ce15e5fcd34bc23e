//! Runtime-generic evaluation of compiled Functions.

mod numeric;
pub(crate) mod sweep;

pub(crate) use numeric::NumericAlgebra;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::client::DiffClient;
use crate::error::{DiffError, DiffResult};
use crate::eval::traits::SweepResult;
use crate::expr::Shape;
use crate::function::Function;

/// Check numeric arguments against the declared shapes.
pub(crate) fn check_shapes<R: Runtime>(
    context: &str,
    expected: &[Shape],
    values: &[Tensor<R>],
) -> DiffResult<()> {
    if expected.len() != values.len() {
        return Err(DiffError::InvalidArgument {
            context: format!(
                "{}: expected {} values, got {}",
                context,
                expected.len(),
                values.len()
            ),
        });
    }
    for (i, (shape, value)) in expected.iter().zip(values).enumerate() {
        let got = Shape::from_dims(value.shape());
        if got != *shape {
            return Err(DiffError::InvalidArgument {
                context: format!("{}: value {} has shape {}, expected {}", context, i, got, shape),
            });
        }
    }
    Ok(())
}

fn check_optional<R: Runtime>(
    context: &str,
    expected: &[Shape],
    values: &[Option<Tensor<R>>],
) -> DiffResult<()> {
    if expected.len() != values.len() {
        return Err(DiffError::InvalidArgument {
            context: format!(
                "{}: expected {} values, got {}",
                context,
                expected.len(),
                values.len()
            ),
        });
    }
    for (i, (shape, value)) in expected.iter().zip(values).enumerate() {
        if let Some(value) = value {
            let got = Shape::from_dims(value.shape());
            if got != *shape {
                return Err(DiffError::InvalidArgument {
                    context: format!(
                        "{}: value {} has shape {}, expected {}",
                        context, i, got, shape
                    ),
                });
            }
        }
    }
    Ok(())
}

fn materialize<R, C>(
    client: &C,
    shapes: &[Shape],
    values: Vec<Option<Tensor<R>>>,
) -> Vec<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    values
        .into_iter()
        .zip(shapes)
        .map(|(v, shape)| {
            v.unwrap_or_else(|| Tensor::<R>::zeros(&shape.dims(), DType::F64, client.device()))
        })
        .collect()
}

/// Evaluate `f` at numeric inputs.
pub fn evaluate_impl<R, C>(client: &C, f: &Function, inputs: &[Tensor<R>]) -> DiffResult<Vec<Tensor<R>>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    check_shapes(f.name(), &f.input_shapes(), inputs)?;
    sweep::evaluate(&NumericAlgebra::new(client), f.program(), inputs)
}

/// One forward-mode pass: outputs and their directional derivatives.
///
/// `None` tangents are zero. Output tangents are always materialized.
pub fn forward_sweep_impl<R, C>(
    client: &C,
    f: &Function,
    inputs: &[Tensor<R>],
    tangents: &[Option<Tensor<R>>],
) -> DiffResult<SweepResult<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    check_shapes(f.name(), &f.input_shapes(), inputs)?;
    check_optional(f.name(), &f.input_shapes(), tangents)?;
    let alg = NumericAlgebra::new(client);
    let (outputs, mut dots) = sweep::forward(&alg, f.program(), inputs, &[tangents.to_vec()])?;
    let dots = dots.pop().unwrap_or_default();
    Ok(SweepResult {
        outputs,
        derivatives: materialize(client, &f.output_shapes(), dots),
    })
}

/// One adjoint-mode pass: outputs and the input adjoints for the given output seeds.
///
/// `None` seeds are zero. Input adjoints are always materialized.
pub fn adjoint_sweep_impl<R, C>(
    client: &C,
    f: &Function,
    inputs: &[Tensor<R>],
    seeds: &[Option<Tensor<R>>],
) -> DiffResult<SweepResult<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    check_shapes(f.name(), &f.input_shapes(), inputs)?;
    check_optional(f.name(), &f.output_shapes(), seeds)?;
    let alg = NumericAlgebra::new(client);
    let (outputs, mut bars) = sweep::reverse(&alg, f.program(), inputs, &[seeds.to_vec()])?;
    let bars = bars.pop().unwrap_or_default();
    Ok(SweepResult {
        outputs,
        derivatives: materialize(client, &f.input_shapes(), bars),
    })
}
