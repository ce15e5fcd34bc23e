//! y'' = a + y'² on [0, 0.4] with a closed-form solution.

mod common;

use std::sync::Arc;

use common::{assert_close, col, eval, flow, setup, tight};
use diffsim::{Function, Graph, JacobianMode, OdeSystem, jacobian_of};
use rstest::rstest;

const TE: f64 = 0.4;
const Y0: f64 = 1.0;
const YC0: f64 = 0.1;
const A: f64 = 1.13;

fn system() -> Arc<OdeSystem> {
    let g = Graph::new();
    let t = g.scalar_symbol("t");
    let x = g.column_symbol("x", 2);
    let p = g.column_symbol("a", 1);
    let yc = g.element(x, 1).unwrap();
    let a = g.element(p, 0).unwrap();
    let yc2 = g.powi(yc, 2).unwrap();
    let ycc = g.add(a, yc2).unwrap();
    let dx = g.vertcat(&[yc, ycc]).unwrap();
    let rhs = Function::new("nonlinear", &g, &[t, x, p], &[dx]).unwrap();
    OdeSystem::new("nonlinear", &rhs, tight(TE)).unwrap()
}

/// `(y(t), y'(t))` for the given initial conditions.
fn exact(y0: f64, yc0: f64, a: f64, t: f64) -> [f64; 2] {
    let sa = a.sqrt();
    let phase = (yc0 / sa).atan() + sa * t;
    let y = (2.0 * y0 - (yc0 * yc0 / a + 1.0).ln()) / 2.0 - phase.cos().ln();
    [y, sa * phase.tan()]
}

/// Central differences of the closed form, column-major per input entry.
fn exact_jacobian() -> Vec<[f64; 2]> {
    let h = 1e-6;
    let base = [Y0, YC0, A];
    (0..3)
        .map(|j| {
            let mut up = base;
            let mut down = base;
            up[j] += h;
            down[j] -= h;
            let hi = exact(up[0], up[1], up[2], TE);
            let lo = exact(down[0], down[1], down[2], TE);
            [(hi[0] - lo[0]) / (2.0 * h), (hi[1] - lo[1]) / (2.0 * h)]
        })
        .collect()
}

#[test]
fn test_terminal_state() {
    let (device, client) = setup();
    let xf = eval(&client, &flow(&system()), &[col(&device, &[Y0, YC0]), col(&device, &[A])]);
    assert_close(&xf, &exact(Y0, YC0, A, TE), 1e-9, "x(tf)");
}

#[rstest]
#[case(JacobianMode::Forward)]
#[case(JacobianMode::Adjoint)]
fn test_jacobians_match_closed_form(#[case] mode: JacobianMode) {
    let (device, client) = setup();
    let f = flow(&system());
    let inputs = [col(&device, &[Y0, YC0]), col(&device, &[A])];
    let columns = exact_jacobian();

    // Row-major 2x2 with respect to (y0, y'0).
    let jx = eval(&client, &jacobian_of(&f, 0, 0, mode).unwrap(), &inputs);
    let expected = [columns[0][0], columns[1][0], columns[0][1], columns[1][1]];
    assert_close(&jx, &expected, 1e-6, "dx(tf)/dx0");

    let ja = eval(&client, &jacobian_of(&f, 1, 0, mode).unwrap(), &inputs);
    assert_close(&ja, &columns[2], 1e-6, "dx(tf)/da");
}
