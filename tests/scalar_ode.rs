//! q' = q / p · t² on [0, 2.3]: q(tf) = q0 · exp(tf³ / (3p)).

mod common;

use std::sync::Arc;

use common::{assert_close, col, eval, flow, setup, tight};
use diffsim::{
    Function, Graph, HvpMode, Integrator, IntegratorInput, JacobianMode, OdeSystem,
    hessian_of, hessian_vector_product, jacobian_of,
};
use numr::runtime::cpu::CpuRuntime;
use rstest::rstest;

const TF: f64 = 2.3;
const Q0: f64 = 7.1;
const P: f64 = 2.0;

fn rhs() -> Function {
    let g = Graph::new();
    let t = g.scalar_symbol("t");
    let q = g.column_symbol("q", 1);
    let p = g.column_symbol("p", 1);
    let t2 = g.powi(t, 2).unwrap();
    let ratio = g.div(q, p).unwrap();
    let dq = g.mul(ratio, t2).unwrap();
    Function::new("rhs", &g, &[t, q, p], &[dq]).unwrap()
}

fn system() -> Arc<OdeSystem> {
    OdeSystem::new("scalar", &rhs(), tight(TF)).unwrap()
}

fn growth() -> f64 {
    (TF.powi(3) / (3.0 * P)).exp()
}

#[test]
fn test_terminal_state() {
    let (device, client) = setup();
    let q = eval(&client, &flow(&system()), &[col(&device, &[Q0]), col(&device, &[P])]);
    assert_close(&q, &[Q0 * growth()], 1e-9, "q(tf)");
}

#[rstest]
#[case(JacobianMode::Forward)]
#[case(JacobianMode::Adjoint)]
fn test_first_derivatives(#[case] mode: JacobianMode) {
    let (device, client) = setup();
    let f = flow(&system());
    let inputs = [col(&device, &[Q0]), col(&device, &[P])];

    let dq0 = eval(&client, &jacobian_of(&f, 0, 0, mode).unwrap(), &inputs);
    assert_close(&dq0, &[growth()], 1e-9, "dq/dq0");

    let dp = eval(&client, &jacobian_of(&f, 1, 0, mode).unwrap(), &inputs);
    let expected = -Q0 * TF.powi(3) * growth() / (3.0 * P * P);
    assert_close(&dp, &[expected], 1e-8, "dq/dp");
}

fn second_derivative() -> f64 {
    let e = growth();
    Q0 * TF.powi(6) * e / (9.0 * P.powi(4)) + 2.0 * Q0 * TF.powi(3) * e / (3.0 * P.powi(3))
}

#[rstest]
#[case(JacobianMode::Forward)]
#[case(JacobianMode::Adjoint)]
fn test_hessian_with_respect_to_parameter(#[case] mode: JacobianMode) {
    let (device, client) = setup();
    let hess = hessian_of(&flow(&system()), 1, 0, mode).unwrap();
    let h = eval(&client, &hess, &[col(&device, &[Q0]), col(&device, &[P])]);
    assert_close(&h, &[second_derivative()], 1e-7, "d2q/dp2");
}

#[rstest]
#[case(HvpMode::ForwardOverAdjoint)]
#[case(HvpMode::AdjointOverAdjoint)]
fn test_hessian_vector_product(#[case] mode: HvpMode) {
    let (device, client) = setup();
    let hvp = hessian_vector_product(&flow(&system()), 1, 0, mode).unwrap();
    let h = eval(
        &client,
        &hvp,
        &[col(&device, &[Q0]), col(&device, &[P]), col(&device, &[0.5])],
    );
    assert_close(&h, &[0.5 * second_derivative()], 1e-7, "H v");
}

#[test]
fn test_jacobian_of_integrator_jacobian() {
    // Hessian via a Jacobian Function of the integrator, differentiated again.
    let (device, client) = setup();
    let mut integrator = Integrator::<CpuRuntime>::new("scalar");
    integrator.configure(&rhs(), tight(TF)).unwrap();
    integrator.initialize().unwrap();

    let jac = integrator
        .jacobian(IntegratorInput::Parameters, JacobianMode::Adjoint)
        .unwrap();
    let hess = jacobian_of(&jac, 1, 0, JacobianMode::Forward).unwrap();
    let h = eval(&client, &hess, &[col(&device, &[Q0]), col(&device, &[P])]);
    assert_close(&h, &[second_derivative()], 1e-7, "d2q/dp2");
}

#[test]
fn test_integrator_object() {
    let (device, client) = setup();
    let mut integrator = Integrator::<CpuRuntime>::new("scalar");
    integrator
        .configure_with(
            &rhs(),
            &[
                ("tf", TF.into()),
                ("relative_tolerance", 1e-12.into()),
                ("absolute_tolerance", 1e-14.into()),
                ("checkpoint_stride", 5usize.into()),
            ],
        )
        .unwrap();
    integrator.initialize().unwrap();

    let q: Vec<f64> = integrator
        .solve(&client, &col(&device, &[Q0]), &col(&device, &[P]))
        .unwrap()
        .to_vec();
    assert_close(&q, &[Q0 * growth()], 1e-9, "q(tf)");

    let adj = integrator
        .adjoint_sensitivity(&client, &col(&device, &[1.0]))
        .unwrap();
    assert_close(&adj.adjoint_state_vec(), &[growth()], 1e-9, "adjoint q0");
    let expected = -Q0 * TF.powi(3) * growth() / (3.0 * P * P);
    assert_close(&adj.adjoint_parameters_vec(), &[expected], 1e-8, "adjoint p");

    let fwd = integrator
        .forward_sensitivity(&client, None, Some(&col(&device, &[1.0])))
        .unwrap();
    assert_close(&fwd.tangent_vec(), &[expected], 1e-8, "forward p");

    let stats = integrator.statistics();
    assert!(stats.checkpoints > 1);
    assert!(stats.adjoint_steps > 0);
}

#[test]
fn test_horizon_derivative() {
    // dq(tf)/dtf = q(tf) · tf² / p
    let (device, client) = setup();
    let mut integrator = Integrator::<CpuRuntime>::new("scalar");
    integrator.configure(&rhs(), tight(TF)).unwrap();
    integrator.initialize().unwrap();
    let dtf = integrator.horizon_derivative().unwrap();
    let v = eval(&client, &dtf, &[col(&device, &[Q0]), col(&device, &[P])]);
    assert_close(&v, &[Q0 * growth() * TF * TF / P], 1e-9, "dq/dtf");
}
