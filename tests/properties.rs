//! Cross-checks that hold for any system: mode agreement, checkpoint
//! transparency, composition and shared subexpressions.

mod common;

use std::sync::Arc;

use common::{assert_close, col, eval, flow, setup, tight};
use diffsim::{Function, Graph, JacobianMode, OdeSystem, SensitivityAlgorithms, jacobian_of};
use rstest::rstest;

/// q' = [p + q0², q0, p + q0²] with the repeated entry built once or twice.
fn repeated_rhs(shared: bool) -> Function {
    let g = Graph::new();
    let t = g.scalar_symbol("t");
    let q = g.column_symbol("q", 3);
    let p = g.column_symbol("p", 1);
    let q0 = g.element(q, 0).unwrap();
    let a = g.element(p, 0).unwrap();
    let sq = g.mul(q0, q0).unwrap();
    let first = g.add(a, sq).unwrap();
    let last = if shared {
        first
    } else {
        let sq2 = g.powi(q0, 2).unwrap();
        g.add(sq2, a).unwrap()
    };
    let dq = g.vertcat(&[first, q0, last]).unwrap();
    Function::new("repeat", &g, &[t, q, p], &[dq]).unwrap()
}

#[rstest]
#[case(true)]
#[case(false)]
fn test_repeated_subexpression_in_rhs(#[case] shared: bool) {
    let (device, client) = setup();
    let system = OdeSystem::new("repeat", &repeated_rhs(shared), tight(0.5)).unwrap();
    let f = flow(&system);
    let inputs = [col(&device, &[1.0, 0.1, 1.0]), col(&device, &[0.2])];

    let xf = eval(&client, &f, &inputs);
    assert_close(&[xf[0]], &[xf[2]], 1e-12, "repeated entries");

    let fwd = eval(&client, &jacobian_of(&f, 0, 0, JacobianMode::Forward).unwrap(), &inputs);
    let adj = eval(&client, &jacobian_of(&f, 0, 0, JacobianMode::Adjoint).unwrap(), &inputs);
    assert_close(&adj, &fwd, 1e-8, "dx(tf)/dx0");
    // Rows 0 and 2 of the Jacobian coincide.
    assert_close(&fwd[0..3], &fwd[6..9], 1e-10, "rows");
}

fn oscillator(stride: usize) -> Arc<OdeSystem> {
    let g = Graph::new();
    let t = g.scalar_symbol("t");
    let x = g.column_symbol("x", 2);
    let p = g.column_symbol("p", 1);
    let x1 = g.element(x, 0).unwrap();
    let x2 = g.element(x, 1).unwrap();
    let k = g.element(p, 0).unwrap();
    let kx = g.mul(k, x1).unwrap();
    let acc = g.neg(kx).unwrap();
    let dx = g.vertcat(&[x2, acc]).unwrap();
    let rhs = Function::new("oscillator", &g, &[t, x, p], &[dx]).unwrap();
    let options = tight(3.0).with_checkpoint_stride(stride);
    OdeSystem::new("oscillator", &rhs, options).unwrap()
}

#[test]
fn test_adjoint_independent_of_checkpoint_stride() {
    let (device, client) = setup();
    let x0 = col(&device, &[1.0, 0.5]);
    let p = col(&device, &[1.7]);
    let lambda = col(&device, &[0.3, -1.2]);

    let dense = client
        .adjoint_sensitivity(&oscillator(1), &x0, &p, &lambda)
        .unwrap();
    for stride in [3, 17, 100_000] {
        let sparse = client
            .adjoint_sensitivity(&oscillator(stride), &x0, &p, &lambda)
            .unwrap();
        let context = format!("stride {}", stride);
        assert_close(
            &sparse.adjoint_state_vec(),
            &dense.adjoint_state_vec(),
            1e-10,
            &context,
        );
        assert_close(
            &sparse.adjoint_parameters_vec(),
            &dense.adjoint_parameters_vec(),
            1e-10,
            &context,
        );
        assert!(sparse.statistics.checkpoints <= dense.statistics.checkpoints);
    }
}

#[test]
fn test_forward_and_adjoint_sensitivities_are_dual() {
    // <λ, J v> computed both ways.
    let (device, client) = setup();
    let system = oscillator(5);
    let x0 = col(&device, &[1.0, 0.5]);
    let p = col(&device, &[1.7]);
    let v = [0.4, -0.9];
    let w = [1.1];
    let lambda = [0.3, -1.2];

    let fwd = client
        .forward_sensitivity(&system, &x0, &p, Some(&col(&device, &v)), Some(&col(&device, &w)))
        .unwrap();
    let adj = client
        .adjoint_sensitivity(&system, &x0, &p, &col(&device, &lambda))
        .unwrap();

    let tangent = fwd.tangent_vec();
    let lhs: f64 = lambda.iter().zip(&tangent).map(|(a, b)| a * b).sum();
    let ax = adj.adjoint_state_vec();
    let ap = adj.adjoint_parameters_vec();
    let rhs: f64 = v.iter().zip(&ax).map(|(a, b)| a * b).sum::<f64>() + w[0] * ap[0];
    assert_close(&[lhs], &[rhs], 1e-9, "duality");
}

#[rstest]
#[case(JacobianMode::Forward)]
#[case(JacobianMode::Adjoint)]
fn test_composed_functions(#[case] mode: JacobianMode) {
    // h(x0, p) = sin(xf) xf with xf = x0 exp(-p tf)
    let (device, client) = setup();
    let tf = 1.5;

    let g = Graph::new();
    let t = g.scalar_symbol("t");
    let x = g.column_symbol("x", 1);
    let p = g.column_symbol("p", 1);
    let px = g.mul(p, x).unwrap();
    let dx = g.neg(px).unwrap();
    let rhs = Function::new("decay", &g, &[t, x, p], &[dx]).unwrap();
    let system = OdeSystem::new("decay", &rhs, tight(tf)).unwrap();
    let decay = flow(&system);

    let g = Graph::new();
    let y = g.column_symbol("y", 1);
    let s = g.sin(y).unwrap();
    let out = g.mul(s, y).unwrap();
    let outer = Function::new("outer", &g, &[y], &[out]).unwrap();

    let g = Graph::new();
    let x0 = g.column_symbol("x0", 1);
    let p = g.column_symbol("p", 1);
    let xf = decay.call_as_node(&g, &[x0, p]).unwrap();
    let h = outer.call_as_node(&g, &xf).unwrap();
    let composed = Function::new("composed", &g, &[x0, p], &h).unwrap();

    let (x0v, pv) = (2.0, 0.6);
    let xfv = x0v * (-pv * tf).exp();
    let outer_slope = xfv.cos() * xfv + xfv.sin();
    let inputs = [col(&device, &[x0v]), col(&device, &[pv])];

    let value = eval(&client, &composed, &inputs);
    assert_close(&value, &[xfv.sin() * xfv], 1e-9, "h");

    let dp = eval(&client, &jacobian_of(&composed, 1, 0, mode).unwrap(), &inputs);
    assert_close(&dp, &[outer_slope * (-tf * xfv)], 1e-8, "dh/dp");

    let dx0 = eval(&client, &jacobian_of(&composed, 0, 0, mode).unwrap(), &inputs);
    assert_close(&dx0, &[outer_slope * (-pv * tf).exp()], 1e-8, "dh/dx0");
}

#[rstest]
#[case(JacobianMode::Forward)]
#[case(JacobianMode::Adjoint)]
fn test_deeply_shared_nodes(#[case] mode: JacobianMode) {
    // b_{k+1} = b_k + b_k, 40 times, then z = sin(b) b + sin(b)
    let (device, client) = setup();
    let g = Graph::new();
    let x = g.column_symbol("x", 1);
    let mut b = x;
    for _ in 0..40 {
        b = g.add(b, b).unwrap();
    }
    let scale = 2f64.powi(40);
    let s = g.sin(b).unwrap();
    let sb = g.mul(s, b).unwrap();
    let z = g.add(sb, s).unwrap();
    let f = Function::new("shared", &g, &[x], &[z]).unwrap();

    let xv = 0.3 / scale;
    let bv = xv * scale;
    let inputs = [col(&device, &[xv])];
    let value = eval(&client, &f, &inputs);
    assert_close(&value, &[bv.sin() * bv + bv.sin()], 1e-12, "z");

    let dz = eval(&client, &jacobian_of(&f, 0, 0, mode).unwrap(), &inputs);
    let expected = (bv.cos() * bv + bv.sin() + bv.cos()) * scale;
    let got = dz[0] / scale;
    assert_close(&[got], &[expected / scale], 1e-12, "dz/dx");
}
