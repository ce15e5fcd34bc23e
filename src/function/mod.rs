//! Function objects: expression graphs bound to ordered input/output ports.
//!
//! A [`Function`] is compiled once at construction into a flat program and is
//! immutable afterwards. It can be evaluated numerically, called from another
//! graph (inlined or as an opaque call node), and differentiated into new
//! Functions.
//!
//! # Example
//!
//! ```ignore
//! use diffsim::expr::Graph;
//! use diffsim::function::Function;
//!
//! let g = Graph::new();
//! let x = g.scalar_symbol("x");
//! let y = g.mul(g.sin(x)?, x)?;
//! let f = Function::new("f", &g, &[x], &[y])?;
//!
//! // Inline f into another graph
//! let h = Graph::new();
//! let z = h.scalar_symbol("z");
//! let fz = f.call(&h, &[z])?;
//! ```

mod callee;
mod program;

pub use callee::Callee;
pub(crate) use callee::next_callee_id;
pub(crate) use program::Program;

use std::fmt;
use std::sync::Arc;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::client::DiffClient;
use crate::differentiate::{JacobianMode, jacobian_of};
use crate::error::{DiffError, DiffResult};
use crate::eval::algebra::SymbolicAlgebra;
use crate::eval::impl_generic::{
    adjoint_sweep_impl, evaluate_impl, forward_sweep_impl, sweep,
};
use crate::eval::traits::SweepResult;
use crate::expr::{Expr, Graph, Shape};

struct FunctionInner {
    id: u64,
    name: String,
    graph: Graph,
    inputs: Vec<Expr>,
    outputs: Vec<Expr>,
    input_shapes: Vec<Shape>,
    output_shapes: Vec<Shape>,
    program: Program,
}

/// A compiled mapping from ordered input Symbols to ordered output expressions.
///
/// Cloning is cheap; clones share the compiled program and the graph.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

impl Function {
    /// Bind `outputs` of `graph` to the input Symbols `inputs`.
    ///
    /// Inputs must be distinct Symbols of `graph`. Every Symbol reachable from
    /// the outputs must be one of the inputs.
    pub fn new(name: &str, graph: &Graph, inputs: &[Expr], outputs: &[Expr]) -> DiffResult<Self> {
        let mut input_ids = Vec::with_capacity(inputs.len());
        let mut input_shapes = Vec::with_capacity(inputs.len());
        for (i, &e) in inputs.iter().enumerate() {
            let (id, shape) = graph.resolve(e, name)?;
            if !graph.is_symbol(e) {
                return Err(DiffError::InvalidArgument {
                    context: format!("{}: input {} is not a symbol", name, i),
                });
            }
            if input_ids.contains(&id) {
                return Err(DiffError::InvalidArgument {
                    context: format!("{}: input {} is declared twice", name, i),
                });
            }
            input_ids.push(id);
            input_shapes.push(shape);
        }

        let mut output_ids = Vec::with_capacity(outputs.len());
        let mut output_shapes = Vec::with_capacity(outputs.len());
        for &e in outputs {
            let (id, shape) = graph.resolve(e, name)?;
            output_ids.push(id);
            output_shapes.push(shape);
        }

        let program = {
            let arena = graph.read();
            Program::compile(&arena, &input_ids, &output_ids).map_err(|e| match e {
                DiffError::InvalidArgument { context } => DiffError::InvalidArgument {
                    context: format!("{}: {}", name, context),
                },
                other => other,
            })?
        };

        log::debug!(
            "compiled function '{}': {} inputs, {} outputs, {} instructions",
            name,
            inputs.len(),
            outputs.len(),
            program.len()
        );

        Ok(Self {
            inner: Arc::new(FunctionInner {
                id: next_callee_id(),
                name: name.to_string(),
                graph: graph.clone(),
                inputs: inputs.to_vec(),
                outputs: outputs.to_vec(),
                input_shapes,
                output_shapes,
                program,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The graph the Function was built on.
    pub fn graph(&self) -> &Graph {
        &self.inner.graph
    }

    pub fn inputs(&self) -> &[Expr] {
        &self.inner.inputs
    }

    pub fn outputs(&self) -> &[Expr] {
        &self.inner.outputs
    }

    pub fn input_shapes(&self) -> &[Shape] {
        &self.inner.input_shapes
    }

    pub fn output_shapes(&self) -> &[Shape] {
        &self.inner.output_shapes
    }

    pub fn n_inputs(&self) -> usize {
        self.inner.inputs.len()
    }

    pub fn n_outputs(&self) -> usize {
        self.inner.outputs.len()
    }

    pub(crate) fn program(&self) -> &Program {
        &self.inner.program
    }

    pub(crate) fn input_shape(&self, index: usize) -> DiffResult<Shape> {
        self.inner.input_shapes.get(index).copied().ok_or_else(|| DiffError::InvalidArgument {
            context: format!(
                "{}: input index {} out of range ({} inputs)",
                self.name(),
                index,
                self.n_inputs()
            ),
        })
    }

    pub(crate) fn output_shape(&self, index: usize) -> DiffResult<Shape> {
        self.inner.output_shapes.get(index).copied().ok_or_else(|| DiffError::InvalidArgument {
            context: format!(
                "{}: output index {} out of range ({} outputs)",
                self.name(),
                index,
                self.n_outputs()
            ),
        })
    }

    // ========================================================================
    // Numeric evaluation
    // ========================================================================

    /// Evaluate at numeric inputs.
    pub fn eval<R, C>(&self, client: &C, inputs: &[Tensor<R>]) -> DiffResult<Vec<Tensor<R>>>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
    {
        evaluate_impl(client, self, inputs)
    }

    /// Outputs and output tangents for one input direction.
    pub fn forward<R, C>(
        &self,
        client: &C,
        inputs: &[Tensor<R>],
        tangents: &[Option<Tensor<R>>],
    ) -> DiffResult<SweepResult<R>>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
    {
        forward_sweep_impl(client, self, inputs, tangents)
    }

    /// Outputs and input adjoints for one set of output seeds.
    pub fn reverse<R, C>(
        &self,
        client: &C,
        inputs: &[Tensor<R>],
        seeds: &[Option<Tensor<R>>],
    ) -> DiffResult<SweepResult<R>>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
    {
        adjoint_sweep_impl(client, self, inputs, seeds)
    }

    // ========================================================================
    // Symbolic composition
    // ========================================================================

    fn check_args(&self, target: &Graph, args: &[Expr]) -> DiffResult<()> {
        if args.len() != self.n_inputs() {
            return Err(DiffError::InvalidArgument {
                context: format!(
                    "{} expects {} arguments, got {}",
                    self.name(),
                    self.n_inputs(),
                    args.len()
                ),
            });
        }
        for (i, (&arg, expected)) in args.iter().zip(self.input_shapes()).enumerate() {
            let got = target.shape(arg)?;
            if got != *expected {
                return Err(DiffError::shape_mismatch(
                    &format!("{} argument {}", self.name(), i),
                    expected,
                    got,
                ));
            }
        }
        Ok(())
    }

    /// Substitute `args` for the inputs and rebuild the outputs in `target`.
    pub fn call(&self, target: &Graph, args: &[Expr]) -> DiffResult<Vec<Expr>> {
        self.check_args(target, args)?;
        sweep::evaluate(&SymbolicAlgebra::new(target), self.program(), args)
    }

    /// Insert an opaque call node for this Function in `target`.
    pub fn call_as_node(&self, target: &Graph, args: &[Expr]) -> DiffResult<Vec<Expr>> {
        target.call(Callee::Function(self.clone()), args)
    }

    /// Outputs and forward derivatives, built in `target`.
    ///
    /// `tangents[d][i]` is the tangent of argument `i` in direction `d`
    /// (`None` is zero). Returns the outputs and `[d][j]`, the tangent of output
    /// `j` in direction `d`; `None` when it is structurally zero.
    pub fn call_forward(
        &self,
        target: &Graph,
        args: &[Expr],
        tangents: &[Vec<Option<Expr>>],
    ) -> DiffResult<(Vec<Expr>, Vec<Vec<Option<Expr>>>)> {
        self.check_args(target, args)?;
        sweep::forward(&SymbolicAlgebra::new(target), self.program(), args, tangents)
    }

    /// Outputs and adjoint derivatives, built in `target`.
    ///
    /// `seeds[d][j]` seeds output `j` in direction `d`. Returns the outputs and
    /// `[d][i]`, the adjoint of argument `i`; `None` when it is structurally zero.
    pub fn call_reverse(
        &self,
        target: &Graph,
        args: &[Expr],
        seeds: &[Vec<Option<Expr>>],
    ) -> DiffResult<(Vec<Expr>, Vec<Vec<Option<Expr>>>)> {
        self.check_args(target, args)?;
        sweep::reverse(&SymbolicAlgebra::new(target), self.program(), args, seeds)
    }

    /// Jacobian of output `output` with respect to input `input`, as a Function
    /// of the same inputs. The sweep direction is chosen automatically.
    pub fn jacobian(&self, input: usize, output: usize) -> DiffResult<Function> {
        jacobian_of(self, input, output, JacobianMode::Auto)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("inputs", &self.inner.input_shapes)
            .field("outputs", &self.inner.output_shapes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::OpKind;
    use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

    fn setup() -> (CpuDevice, CpuClient) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (device, client)
    }

    fn scalar(value: f64, device: &CpuDevice) -> Tensor<CpuRuntime> {
        Tensor::<CpuRuntime>::from_slice(&[value], &[1, 1], device)
    }

    #[test]
    fn test_inputs_must_be_symbols() {
        let g = Graph::new();
        let x = g.scalar_symbol("x");
        let s = g.sin(x).unwrap();
        let err = Function::new("f", &g, &[s], &[s]).unwrap_err();
        assert!(matches!(err, DiffError::InvalidArgument { .. }));

        let err = Function::new("f", &g, &[x, x], &[s]).unwrap_err();
        assert!(matches!(err, DiffError::InvalidArgument { .. }));
    }

    #[test]
    fn test_free_symbol_rejected() {
        let g = Graph::new();
        let x = g.scalar_symbol("x");
        let y = g.scalar_symbol("y");
        let out = g.add(x, y).unwrap();
        let err = Function::new("f", &g, &[x], &[out]).unwrap_err();
        match err {
            DiffError::InvalidArgument { context } => assert!(context.contains("'y'")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_inline_call_reuses_nodes_in_own_graph() {
        let g = Graph::new();
        let x = g.scalar_symbol("x");
        let out = g.mul(g.sin(x).unwrap(), x).unwrap();
        let f = Function::new("f", &g, &[x], &[out]).unwrap();

        let before = g.len();
        let again = f.call(&g, &[x]).unwrap();
        assert_eq!(again[0], out);
        assert_eq!(g.len(), before);
    }

    #[test]
    fn test_call_checks_argument_shapes() {
        let g = Graph::new();
        let x = g.column_symbol("x", 2);
        let f = Function::new("f", &g, &[x], &[x]).unwrap();

        let h = Graph::new();
        let z = h.column_symbol("z", 3);
        let err = f.call(&h, &[z]).unwrap_err();
        assert!(matches!(err, DiffError::ShapeMismatch { .. }));
        let err = f.call_as_node(&h, &[z]).unwrap_err();
        assert!(matches!(err, DiffError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_call_node_evaluates_and_differentiates() {
        let (device, client) = setup();

        let g = Graph::new();
        let x = g.scalar_symbol("x");
        let inner = g.mul(x, x).unwrap();
        let f = Function::new("square", &g, &[x], &[inner]).unwrap();

        let h = Graph::new();
        let z = h.scalar_symbol("z");
        let called = f.call_as_node(&h, &[z]).unwrap();
        assert!(matches!(h.node(called[0]).unwrap().op, OpKind::CallOutput(0)));
        let out = h.sin(called[0]).unwrap();
        let outer = Function::new("outer", &h, &[z], &[out]).unwrap();

        let zv = 0.8f64;
        let r = outer
            .forward(&client, &[scalar(zv, &device)], &[Some(scalar(1.0, &device))])
            .unwrap();
        assert!((r.outputs[0].to_vec::<f64>()[0] - (zv * zv).sin()).abs() < 1e-15);
        let expected = (zv * zv).cos() * 2.0 * zv;
        assert!((r.derivatives[0].to_vec::<f64>()[0] - expected).abs() < 1e-14);

        let r = outer
            .reverse(&client, &[scalar(zv, &device)], &[Some(scalar(1.0, &device))])
            .unwrap();
        assert!((r.derivatives[0].to_vec::<f64>()[0] - expected).abs() < 1e-14);
    }

    #[test]
    fn test_symbolic_forward_and_reverse_match() {
        let (device, client) = setup();
        let g = Graph::new();
        let x = g.scalar_symbol("x");
        let y = g.scalar_symbol("y");
        let out = g.mul(g.exp(x).unwrap(), g.cos(y).unwrap()).unwrap();
        let f = Function::new("f", &g, &[x, y], &[out]).unwrap();

        let h = Graph::new();
        let a = h.scalar_symbol("a");
        let b = h.scalar_symbol("b");
        let one = h.scalar(1.0);
        let (_, dots) = f
            .call_forward(&h, &[a, b], &[vec![Some(one), None], vec![None, Some(one)]])
            .unwrap();
        let (_, bars) = f.call_reverse(&h, &[a, b], &[vec![Some(one)]]).unwrap();

        let outputs = [
            dots[0][0].unwrap(),
            dots[1][0].unwrap(),
            bars[0][0].unwrap(),
            bars[0][1].unwrap(),
        ];
        let derived = Function::new("derived", &h, &[a, b], &outputs).unwrap();
        let values = derived
            .eval(&client, &[scalar(0.3, &device), scalar(1.1, &device)])
            .unwrap();
        let v: Vec<f64> = values.iter().map(|t| t.to_vec::<f64>()[0]).collect();
        assert!((v[0] - v[2]).abs() < 1e-15);
        assert!((v[1] - v[3]).abs() < 1e-15);
        assert!((v[0] - 0.3f64.exp() * 1.1f64.cos()).abs() < 1e-15);
        assert!((v[1] + 0.3f64.exp() * 1.1f64.sin()).abs() < 1e-15);
    }
}
