//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::sync::Arc;

use diffsim::{Function, Graph, IntegratorOptions, OdeSystem};
use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
use numr::tensor::Tensor;

pub fn setup() -> (CpuDevice, CpuClient) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = CpuDevice::new();
    let client = CpuClient::new(device.clone());
    (device, client)
}

pub fn col(device: &CpuDevice, values: &[f64]) -> Tensor<CpuRuntime> {
    Tensor::<CpuRuntime>::from_slice(values, &[values.len(), 1], device)
}

pub fn tight(tf: f64) -> IntegratorOptions {
    IntegratorOptions::default()
        .with_horizon(0.0, tf)
        .with_tolerances(1e-12, 1e-14)
}

/// `(x0, p) -> x(tf)` as a Function.
pub fn flow(system: &Arc<OdeSystem>) -> Function {
    let g = Graph::new();
    let x0 = g.column_symbol("x0", system.state_dim());
    let p = g.column_symbol("p", system.parameter_dim());
    let xf = system.call(&g, x0, p).unwrap();
    Function::new("flow", &g, &[x0, p], &[xf]).unwrap()
}

pub fn eval(client: &CpuClient, f: &Function, inputs: &[Tensor<CpuRuntime>]) -> Vec<f64> {
    f.eval(client, inputs).unwrap()[0].to_vec()
}

pub fn assert_close(got: &[f64], expected: &[f64], rtol: f64, context: &str) {
    assert_eq!(got.len(), expected.len(), "{}: length", context);
    for (i, (a, b)) in got.iter().zip(expected).enumerate() {
        let scale = b.abs().max(1.0);
        assert!(
            (a - b).abs() <= rtol * scale,
            "{}: entry {}: {} vs {} ({:?})",
            context,
            i,
            a,
            b,
            got
        );
    }
}

/// Matrix exponential of a row-major `n x n` matrix by scaling and squaring.
pub fn expm(a: &[f64], n: usize) -> Vec<f64> {
    let norm = a.iter().fold(0.0f64, |m, v| m.max(v.abs())) * n as f64;
    let squarings = if norm > 0.5 { (norm / 0.5).log2().ceil() as u32 } else { 0 };
    let scale = 2f64.powi(squarings as i32);
    let scaled: Vec<f64> = a.iter().map(|v| v / scale).collect();

    let mut result = identity(n);
    let mut term = identity(n);
    for k in 1..30 {
        term = matmul(&term, &scaled, n)
            .into_iter()
            .map(|v| v / k as f64)
            .collect();
        for (r, t) in result.iter_mut().zip(&term) {
            *r += t;
        }
    }
    for _ in 0..squarings {
        result = matmul(&result, &result, n);
    }
    result
}

pub fn identity(n: usize) -> Vec<f64> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}

pub fn matmul(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut c = vec![0.0; n * n];
    for i in 0..n {
        for k in 0..n {
            for j in 0..n {
                c[i * n + j] += a[i * n + k] * b[k * n + j];
            }
        }
    }
    c
}

pub fn matvec(a: &[f64], x: &[f64]) -> Vec<f64> {
    let n = x.len();
    (0..a.len() / n)
        .map(|i| (0..n).map(|j| a[i * n + j] * x[j]).sum())
        .collect()
}
