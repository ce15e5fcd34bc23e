//! CPU implementation of EvaluationAlgorithms.

use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

use crate::error::DiffResult;
use crate::eval::impl_generic::{adjoint_sweep_impl, evaluate_impl, forward_sweep_impl};
use crate::eval::traits::{EvaluationAlgorithms, SweepResult};
use crate::function::Function;

impl EvaluationAlgorithms<CpuRuntime> for CpuClient {
    fn evaluate(
        &self,
        f: &Function,
        inputs: &[Tensor<CpuRuntime>],
    ) -> DiffResult<Vec<Tensor<CpuRuntime>>> {
        evaluate_impl(self, f, inputs)
    }

    fn forward_sweep(
        &self,
        f: &Function,
        inputs: &[Tensor<CpuRuntime>],
        tangents: &[Option<Tensor<CpuRuntime>>],
    ) -> DiffResult<SweepResult<CpuRuntime>> {
        forward_sweep_impl(self, f, inputs, tangents)
    }

    fn adjoint_sweep(
        &self,
        f: &Function,
        inputs: &[Tensor<CpuRuntime>],
        seeds: &[Option<Tensor<CpuRuntime>>],
    ) -> DiffResult<SweepResult<CpuRuntime>> {
        adjoint_sweep_impl(self, f, inputs, seeds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiffError;
    use crate::expr::{Graph, Shape};
    use numr::runtime::cpu::CpuDevice;

    fn setup() -> (CpuDevice, CpuClient) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (device, client)
    }

    fn column(values: &[f64], device: &CpuDevice) -> Tensor<CpuRuntime> {
        Tensor::<CpuRuntime>::from_slice(values, &[values.len(), 1], device)
    }

    fn scalar(value: f64, device: &CpuDevice) -> Tensor<CpuRuntime> {
        Tensor::<CpuRuntime>::from_slice(&[value], &[1, 1], device)
    }

    #[test]
    fn test_evaluate_elementary_functions() {
        let (device, client) = setup();
        let g = Graph::new();
        let x = g.scalar_symbol("x");
        let y = g.scalar_symbol("y");
        // sin(x) * exp(y) + sqrt(x) / y
        let a = g.mul(g.sin(x).unwrap(), g.exp(y).unwrap()).unwrap();
        let b = g.div(g.sqrt(x).unwrap(), y).unwrap();
        let out = g.add(a, b).unwrap();
        let f = Function::new("f", &g, &[x, y], &[out]).unwrap();

        let (xv, yv) = (0.7f64, 1.3f64);
        let result = client
            .evaluate(&f, &[scalar(xv, &device), scalar(yv, &device)])
            .unwrap();
        let got = result[0].to_vec::<f64>()[0];
        let expected = xv.sin() * yv.exp() + xv.sqrt() / yv;
        assert!((got - expected).abs() < 1e-14, "got {}, expected {}", got, expected);
    }

    #[test]
    fn test_forward_and_adjoint_sweeps_agree() {
        let (device, client) = setup();
        let g = Graph::new();
        let x = g.column_symbol("x", 3);
        let m = g
            .constant(Shape::new(2, 3), &[1.0, 2.0, -1.0, 0.5, 0.0, 3.0])
            .unwrap();
        // m * (x .* x) + sum(x) * [1; 1]
        let sq = g.mul(x, x).unwrap();
        let lin = g.matmul(m, sq).unwrap();
        let total = g.sum_all(x).unwrap();
        let out = g.add(lin, total).unwrap();
        let f = Function::new("f", &g, &[x], &[out]).unwrap();

        let xv = column(&[0.3, -1.2, 2.0], &device);
        let v = column(&[1.0, 0.5, -2.0], &device);
        let w = column(&[0.25, -1.5], &device);

        let fwd = client
            .forward_sweep(&f, &[xv.clone()], &[Some(v.clone())])
            .unwrap();
        let adj = client.adjoint_sweep(&f, &[xv], &[Some(w.clone())]).unwrap();

        // w' (J v) == (J' w)' v
        let jv: Vec<f64> = fwd.derivatives[0].to_vec();
        let jtw: Vec<f64> = adj.derivatives[0].to_vec();
        let wv: Vec<f64> = w.to_vec();
        let vv: Vec<f64> = v.to_vec();
        let lhs: f64 = jv.iter().zip(&wv).map(|(a, b)| a * b).sum();
        let rhs: f64 = jtw.iter().zip(&vv).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-12, "{} vs {}", lhs, rhs);
    }

    #[test]
    fn test_shared_node_adjoint_matches_duplicated_graph() {
        let (device, client) = setup();

        // Shared: s = sin(x) * x, out = s * s + s
        let shared = Graph::new();
        let x = shared.scalar_symbol("x");
        let s = shared.mul(shared.sin(x).unwrap(), x).unwrap();
        let out = shared.add(shared.mul(s, s).unwrap(), s).unwrap();
        let f_shared = Function::new("shared", &shared, &[x], &[out]).unwrap();

        // Duplicated: the same expression with three separate copies of s
        let dup = Graph::new();
        let x2 = dup.scalar_symbol("x");
        let copy = |g: &Graph| {
            let c = g.scalar(1.0);
            let xs = g.mul(x2, c).unwrap();
            g.mul(g.sin(xs).unwrap(), xs).unwrap()
        };
        let s1 = copy(&dup);
        let two = dup.scalar(2.0);
        let x_scaled = dup.div(dup.mul(x2, two).unwrap(), two).unwrap();
        let s2 = dup.mul(dup.sin(x_scaled).unwrap(), x_scaled).unwrap();
        let s3 = dup.mul(dup.sin(x2).unwrap(), x2).unwrap();
        let out2 = dup.add(dup.mul(s1, s2).unwrap(), s3).unwrap();
        let f_dup = Function::new("dup", &dup, &[x2], &[out2]).unwrap();

        let xv = scalar(0.9, &device);
        let seed = Some(scalar(1.0, &device));
        let a = client
            .adjoint_sweep(&f_shared, &[xv.clone()], &[seed.clone()])
            .unwrap();
        let b = client.adjoint_sweep(&f_dup, &[xv], &[seed]).unwrap();
        let ga = a.derivatives[0].to_vec::<f64>()[0];
        let gb = b.derivatives[0].to_vec::<f64>()[0];

        let xv = 0.9f64;
        let sv = xv.sin() * xv;
        let ds = xv.cos() * xv + xv.sin();
        let expected = 2.0 * sv * ds + ds;
        assert!((ga - expected).abs() < 1e-13);
        assert!((gb - expected).abs() < 1e-13);
    }

    #[test]
    fn test_abs_derivative_convention_at_zero() {
        let (device, client) = setup();
        let g = Graph::new();
        let x = g.scalar_symbol("x");
        let out = g.abs(x).unwrap();
        let f = Function::new("abs", &g, &[x], &[out]).unwrap();

        let one = Some(scalar(1.0, &device));
        for (xv, slope) in [(0.0, 1.0), (-2.0, -1.0), (3.0, 1.0)] {
            let r = client
                .forward_sweep(&f, &[scalar(xv, &device)], &[one.clone()])
                .unwrap();
            assert_eq!(r.derivatives[0].to_vec::<f64>()[0], slope);
        }
    }

    #[test]
    fn test_if_else_differentiates_selected_branch() {
        let (device, client) = setup();
        let g = Graph::new();
        let x = g.scalar_symbol("x");
        let zero = g.scalar(0.0);
        let cond = g.lt(x, zero).unwrap();
        let neg_branch = g.mul(x, x).unwrap();
        let pos_branch = g.mul(g.scalar(3.0), x).unwrap();
        let out = g.if_else(cond, neg_branch, pos_branch).unwrap();
        let f = Function::new("piecewise", &g, &[x], &[out]).unwrap();

        let seed = Some(scalar(1.0, &device));
        let left = client
            .adjoint_sweep(&f, &[scalar(-2.0, &device)], &[seed.clone()])
            .unwrap();
        let right = client
            .adjoint_sweep(&f, &[scalar(2.0, &device)], &[seed])
            .unwrap();
        assert_eq!(left.outputs[0].to_vec::<f64>()[0], 4.0);
        assert_eq!(left.derivatives[0].to_vec::<f64>()[0], -4.0);
        assert_eq!(right.outputs[0].to_vec::<f64>()[0], 6.0);
        assert_eq!(right.derivatives[0].to_vec::<f64>()[0], 3.0);
    }

    #[test]
    fn test_structural_ops_round_trip() {
        let (device, client) = setup();
        let g = Graph::new();
        let x = g.column_symbol("x", 4);
        let m = g.reshape(x, Shape::new(2, 2)).unwrap();
        let mt = g.transpose(m).unwrap();
        let block = g.slice(mt, 0, 1, Shape::new(2, 1)).unwrap();
        let padded = g.embed(block, 1, 0, Shape::new(3, 2)).unwrap();
        let stacked = g.vertcat(&[padded, g.ones(Shape::new(1, 2))]).unwrap();
        let f = Function::new("structural", &g, &[x], &[stacked]).unwrap();

        let xv = column(&[1.0, 2.0, 3.0, 4.0], &device);
        let out = client.evaluate(&f, &[xv]).unwrap();
        assert_eq!(out[0].shape(), &[4, 2]);
        // m = [[1,2],[3,4]], mt = [[1,3],[2,4]], block = [3;4]
        assert_eq!(
            out[0].to_vec::<f64>(),
            vec![0.0, 0.0, 3.0, 0.0, 4.0, 0.0, 1.0, 1.0]
        );
    }

    #[test]
    fn test_powi_with_negative_base() {
        let (device, client) = setup();
        let g = Graph::new();
        let x = g.scalar_symbol("x");
        let cube = g.powi(x, 3).unwrap();
        let inv = g.powi(x, -2).unwrap();
        let f = Function::new("powers", &g, &[x], &[cube, inv]).unwrap();

        let r = client
            .forward_sweep(&f, &[scalar(-2.0, &device)], &[Some(scalar(1.0, &device))])
            .unwrap();
        assert_eq!(r.outputs[0].to_vec::<f64>()[0], -8.0);
        assert_eq!(r.outputs[1].to_vec::<f64>()[0], 0.25);
        assert_eq!(r.derivatives[0].to_vec::<f64>()[0], 12.0);
        assert!((r.derivatives[1].to_vec::<f64>()[0] - 0.25).abs() < 1e-15);
    }

    #[test]
    fn test_assertion_failure_is_reported() {
        let (device, client) = setup();
        let g = Graph::new();
        let x = g.scalar_symbol("x");
        let positive = g.gt(x, g.scalar(0.0)).unwrap();
        let checked = g.assert_that(x, positive, "x must be positive").unwrap();
        let out = g.log(checked).unwrap();
        let f = Function::new("checked_log", &g, &[x], &[out]).unwrap();

        assert!(client.evaluate(&f, &[scalar(2.0, &device)]).is_ok());
        let err = client.evaluate(&f, &[scalar(-1.0, &device)]).unwrap_err();
        match err {
            DiffError::AssertionFailed { message } => assert_eq!(message, "x must be positive"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_wrong_input_shape_rejected() {
        let (device, client) = setup();
        let g = Graph::new();
        let x = g.column_symbol("x", 2);
        let f = Function::new("id", &g, &[x], &[x]).unwrap();
        let err = client.evaluate(&f, &[column(&[1.0, 2.0, 3.0], &device)]);
        assert!(matches!(err, Err(DiffError::InvalidArgument { .. })));
    }
}
