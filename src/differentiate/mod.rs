//! Differentiation driver: Jacobians, gradients and Hessians as Functions.
//!
//! Every derivative is built symbolically and returned as a new
//! [`Function`] of the same inputs, so it can be evaluated, called from
//! other graphs and differentiated again. A Jacobian takes one symbolic
//! sweep carrying all directions at once: forward mode seeds one direction
//! per input component, adjoint mode one per output component.
//!
//! Calls to integrators inside a Function are differentiated by the
//! integrator's own forward and adjoint sensitivity systems.
//!
//! # Example
//!
//! ```ignore
//! use diffsim::differentiate::{JacobianMode, jacobian_of};
//!
//! let jac = jacobian_of(&f, 0, 0, JacobianMode::Auto)?;
//! let values = jac.eval(&client, &inputs)?;
//! ```

use crate::error::{DiffError, DiffResult};
use crate::expr::{Expr, Graph, Shape};
use crate::function::Function;

/// Sweep direction used to build a Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JacobianMode {
    /// Forward when the input has fewer components than the output, else adjoint.
    #[default]
    Auto,
    /// One tangent direction per input component.
    Forward,
    /// One adjoint seed per output component.
    Adjoint,
}

impl JacobianMode {
    fn resolve(self, n_in: usize, n_out: usize) -> JacobianMode {
        match self {
            JacobianMode::Auto if n_in < n_out => JacobianMode::Forward,
            JacobianMode::Auto => JacobianMode::Adjoint,
            mode => mode,
        }
    }
}

/// How a Hessian-vector product nests the two sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HvpMode {
    /// Forward sweep through the gradient.
    #[default]
    ForwardOverAdjoint,
    /// Adjoint sweep through `gradient · v`.
    AdjointOverAdjoint,
}

fn check_ports(f: &Function, input: usize, output: usize) -> DiffResult<(Shape, Shape)> {
    let shape_in = f.input_shapes().get(input).copied().ok_or_else(|| {
        DiffError::InvalidArgument {
            context: format!("{}: input {} out of range", f.name(), input),
        }
    })?;
    let shape_out = f.output_shapes().get(output).copied().ok_or_else(|| {
        DiffError::InvalidArgument {
            context: format!("{}: output {} out of range", f.name(), output),
        }
    })?;
    Ok((shape_in, shape_out))
}

/// Fresh Symbols in `g` mirroring the inputs of `f`.
fn mirror_inputs(f: &Function, g: &Graph) -> Vec<Expr> {
    f.inputs()
        .iter()
        .zip(f.input_shapes())
        .enumerate()
        .map(|(i, (&e, &shape))| {
            let name = f
                .graph()
                .symbol_name(e)
                .unwrap_or_else(|| format!("i{}", i));
            g.symbol(&name, shape)
        })
        .collect()
}

/// Name for a direction paired with input `input`, distinct from every input name of `f`.
fn direction_name(f: &Function, input: usize) -> String {
    let taken: Vec<String> = f
        .inputs()
        .iter()
        .filter_map(|&e| f.graph().symbol_name(e))
        .collect();
    let base = match f.inputs().get(input).and_then(|&e| f.graph().symbol_name(e)) {
        Some(name) => format!("v_{}", name),
        None => format!("v_i{}", input),
    };
    let mut name = base.clone();
    let mut k = 1;
    while taken.contains(&name) {
        name = format!("{}_{}", base, k);
        k += 1;
    }
    name
}

/// Jacobian of output `output` with respect to input `input`.
///
/// The result is a Function of the inputs of `f` whose single output has
/// shape `(numel(output), numel(input))`, entries in row-major order.
pub fn jacobian_of(
    f: &Function,
    input: usize,
    output: usize,
    mode: JacobianMode,
) -> DiffResult<Function> {
    let (shape_in, shape_out) = check_ports(f, input, output)?;
    let (n_in, n_out) = (shape_in.numel(), shape_out.numel());
    let mode = mode.resolve(n_in, n_out);

    let g = Graph::new();
    let args = mirror_inputs(f, &g);
    let jac = if n_in == 0 || n_out == 0 {
        g.zeros(Shape::new(n_out, n_in))
    } else if mode == JacobianMode::Forward {
        let tangents = (0..n_in)
            .map(|d| {
                let mut dirs = vec![None; args.len()];
                dirs[input] = Some(g.unit(shape_in, d)?);
                Ok(dirs)
            })
            .collect::<DiffResult<Vec<_>>>()?;
        let (_, dots) = f.call_forward(&g, &args, &tangents)?;
        let columns = dots
            .into_iter()
            .map(|mut dot| match dot.swap_remove(output) {
                Some(col) => g.reshape(col, Shape::column(n_out)),
                None => Ok(g.zeros(Shape::column(n_out))),
            })
            .collect::<DiffResult<Vec<_>>>()?;
        g.horzcat(&columns)?
    } else {
        let seeds = (0..n_out)
            .map(|r| {
                let mut dirs = vec![None; f.n_outputs()];
                dirs[output] = Some(g.unit(shape_out, r)?);
                Ok(dirs)
            })
            .collect::<DiffResult<Vec<_>>>()?;
        let (_, bars) = f.call_reverse(&g, &args, &seeds)?;
        let rows = bars
            .into_iter()
            .map(|mut bar| match bar.swap_remove(input) {
                Some(row) => g.reshape(row, Shape::new(1, n_in)),
                None => Ok(g.zeros(Shape::new(1, n_in))),
            })
            .collect::<DiffResult<Vec<_>>>()?;
        g.vertcat(&rows)?
    };

    log::debug!(
        "{}: jacobian of output {} wrt input {} ({}x{}, {:?})",
        f.name(),
        output,
        input,
        n_out,
        n_in,
        mode
    );
    Function::new(
        &format!("jac_{}_o{}_i{}", f.name(), output, input),
        &g,
        &args,
        &[jac],
    )
}

/// Gradient of the scalar output `output` with respect to input `input`.
///
/// The gradient has the shape of the input.
pub fn gradient_of(f: &Function, input: usize, output: usize) -> DiffResult<Function> {
    let (shape_in, shape_out) = check_ports(f, input, output)?;
    if !shape_out.is_scalar() {
        return Err(DiffError::shape_mismatch(
            &format!("gradient of {}", f.name()),
            Shape::scalar(),
            shape_out,
        ));
    }
    let g = Graph::new();
    let args = mirror_inputs(f, &g);
    let mut seed = vec![None; f.n_outputs()];
    seed[output] = Some(g.scalar(1.0));
    let (_, mut bars) = f.call_reverse(&g, &args, &[seed])?;
    let grad = bars
        .pop()
        .and_then(|mut bar| bar.swap_remove(input))
        .unwrap_or_else(|| g.zeros(shape_in));
    Function::new(
        &format!("grad_{}_o{}_i{}", f.name(), output, input),
        &g,
        &args,
        &[grad],
    )
}

/// Hessian of the scalar output `output` with respect to input `input`.
///
/// The outer derivative is a Jacobian of the gradient taken in `mode`.
pub fn hessian_of(
    f: &Function,
    input: usize,
    output: usize,
    mode: JacobianMode,
) -> DiffResult<Function> {
    let grad = gradient_of(f, input, output)?;
    jacobian_of(&grad, input, 0, mode)
}

/// Hessian-vector product of the scalar output `output` with respect to input `input`.
///
/// The result is a Function of the inputs of `f` followed by a direction `v`
/// shaped like the input; its output `H v` is shaped like the input too.
pub fn hessian_vector_product(
    f: &Function,
    input: usize,
    output: usize,
    mode: HvpMode,
) -> DiffResult<Function> {
    let (shape_in, _) = check_ports(f, input, output)?;
    let grad = gradient_of(f, input, output)?;
    let name = format!("hvp_{}_o{}_i{}", f.name(), output, input);
    let direction = direction_name(f, input);

    match mode {
        HvpMode::ForwardOverAdjoint => {
            let g = Graph::new();
            let mut args = mirror_inputs(f, &g);
            let v = g.symbol(&direction, shape_in);
            let mut tangent = vec![None; args.len()];
            tangent[input] = Some(v);
            let (_, mut dots) = grad.call_forward(&g, &args, &[tangent])?;
            let hv = dots
                .pop()
                .and_then(|mut dot| dot.swap_remove(0))
                .unwrap_or_else(|| g.zeros(shape_in));
            args.push(v);
            Function::new(&name, &g, &args, &[hv])
        }
        HvpMode::AdjointOverAdjoint => {
            let g = Graph::new();
            let mut args = mirror_inputs(f, &g);
            let v = g.symbol(&direction, shape_in);
            let gradient = grad.call(&g, &args)?;
            let directional = g.dot(gradient[0], v)?;
            args.push(v);
            let phi = Function::new(&format!("{}_gv", name), &g, &args, &[directional])?;
            let hv = gradient_of(&phi, input, 0)?;
            Function::new(&name, hv.graph(), hv.inputs(), hv.outputs())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
    use numr::tensor::Tensor;
    use rstest::rstest;

    fn setup() -> (CpuDevice, CpuClient) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (device, client)
    }

    fn col(device: &CpuDevice, values: &[f64]) -> Tensor<CpuRuntime> {
        Tensor::<CpuRuntime>::from_slice(values, &[values.len(), 1], device)
    }

    /// f(x) = [x0 x1; sin(x0) + x2²; exp(x1)] for x in R³.
    fn vector_function() -> Function {
        let g = Graph::new();
        let x = g.column_symbol("x", 3);
        let x0 = g.element(x, 0).unwrap();
        let x1 = g.element(x, 1).unwrap();
        let x2 = g.element(x, 2).unwrap();
        let a = g.mul(x0, x1).unwrap();
        let s = g.sin(x0).unwrap();
        let sq = g.powi(x2, 2).unwrap();
        let b = g.add(s, sq).unwrap();
        let c = g.exp(x1).unwrap();
        let y = g.vertcat(&[a, b, c]).unwrap();
        Function::new("f", &g, &[x], &[y]).unwrap()
    }

    /// f(x) = x0² x1 + x1³.
    fn scalar_function() -> Function {
        let g = Graph::new();
        let x = g.column_symbol("x", 2);
        let x0 = g.element(x, 0).unwrap();
        let x1 = g.element(x, 1).unwrap();
        let a = g.powi(x0, 2).unwrap();
        let a = g.mul(a, x1).unwrap();
        let b = g.powi(x1, 3).unwrap();
        let y = g.add(a, b).unwrap();
        Function::new("f", &g, &[x], &[y]).unwrap()
    }

    #[rstest]
    #[case(JacobianMode::Forward)]
    #[case(JacobianMode::Adjoint)]
    #[case(JacobianMode::Auto)]
    fn test_jacobian_modes_agree(#[case] mode: JacobianMode) {
        let (device, client) = setup();
        let jac = jacobian_of(&vector_function(), 0, 0, mode).unwrap();
        assert_eq!(jac.output_shapes()[0], Shape::new(3, 3));

        let (x0, x1, x2) = (0.3, -1.2, 0.7);
        let out = jac.eval(&client, &[col(&device, &[x0, x1, x2])]).unwrap();
        let j: Vec<f64> = out[0].to_vec();
        let expected = [
            x1,
            x0,
            0.0,
            f64::cos(x0),
            0.0,
            2.0 * x2,
            0.0,
            f64::exp(x1),
            0.0,
        ];
        for (a, b) in j.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-12, "{:?}: {:?}", mode, j);
        }
    }

    #[test]
    fn test_auto_mode_selection() {
        assert_eq!(JacobianMode::Auto.resolve(2, 5), JacobianMode::Forward);
        assert_eq!(JacobianMode::Auto.resolve(5, 2), JacobianMode::Adjoint);
        assert_eq!(JacobianMode::Auto.resolve(3, 3), JacobianMode::Adjoint);
        assert_eq!(JacobianMode::Forward.resolve(5, 2), JacobianMode::Forward);
    }

    #[test]
    fn test_port_index_checked() {
        let err = jacobian_of(&vector_function(), 1, 0, JacobianMode::Auto).unwrap_err();
        assert!(matches!(err, DiffError::InvalidArgument { .. }));
        let err = gradient_of(&vector_function(), 0, 0).unwrap_err();
        assert!(matches!(err, DiffError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_gradient_and_hessian() {
        let (device, client) = setup();
        let f = scalar_function();
        let x = col(&device, &[1.5, -0.5]);

        let grad = gradient_of(&f, 0, 0).unwrap();
        let gv: Vec<f64> = grad.eval(&client, &[x.clone()]).unwrap()[0].to_vec();
        assert!((gv[0] - 2.0 * 1.5 * -0.5).abs() < 1e-12);
        assert!((gv[1] - (1.5 * 1.5 + 3.0 * 0.25)).abs() < 1e-12);

        for mode in [JacobianMode::Forward, JacobianMode::Adjoint] {
            let hess = hessian_of(&f, 0, 0, mode).unwrap();
            let h: Vec<f64> = hess.eval(&client, &[x.clone()]).unwrap()[0].to_vec();
            let expected = [2.0 * -0.5, 2.0 * 1.5, 2.0 * 1.5, 6.0 * -0.5];
            for (a, b) in h.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-12, "{:?}: {:?}", mode, h);
            }
        }
    }

    #[rstest]
    #[case(HvpMode::ForwardOverAdjoint)]
    #[case(HvpMode::AdjointOverAdjoint)]
    fn test_hessian_vector_product(#[case] mode: HvpMode) {
        let (device, client) = setup();
        let hvp = hessian_vector_product(&scalar_function(), 0, 0, mode).unwrap();
        assert_eq!(hvp.n_inputs(), 2);

        let out = hvp
            .eval(&client, &[col(&device, &[1.5, -0.5]), col(&device, &[1.0, 2.0])])
            .unwrap();
        let hv: Vec<f64> = out[0].to_vec();
        // H = [[-1, 3], [3, -3]]
        assert!((hv[0] - 5.0).abs() < 1e-12, "{:?}", hv);
        assert!((hv[1] + 3.0).abs() < 1e-12, "{:?}", hv);
    }

    #[rstest]
    #[case(HvpMode::ForwardOverAdjoint)]
    #[case(HvpMode::AdjointOverAdjoint)]
    fn test_hvp_direction_name_is_unique(#[case] mode: HvpMode) {
        // f(x, v_x) = x² v_x already uses the default direction name.
        let (device, client) = setup();
        let g = Graph::new();
        let x = g.column_symbol("x", 1);
        let w = g.column_symbol("v_x", 1);
        let sq = g.powi(x, 2).unwrap();
        let y = g.mul(sq, w).unwrap();
        let f = Function::new("f", &g, &[x, w], &[y]).unwrap();

        let hvp = hessian_vector_product(&f, 0, 0, mode).unwrap();
        let names: Vec<String> = hvp
            .inputs()
            .iter()
            .map(|&e| hvp.graph().symbol_name(e).unwrap())
            .collect();
        assert_eq!(names, vec!["x", "v_x", "v_x_1"]);

        let inputs = [col(&device, &[3.0]), col(&device, &[4.0]), col(&device, &[0.5])];
        let hv: Vec<f64> = hvp.eval(&client, &inputs).unwrap()[0].to_vec();
        assert!((hv[0] - 4.0).abs() < 1e-12, "{:?}", hv);
    }
}
