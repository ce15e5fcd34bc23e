//! Dormand-Prince RK45 single step using tensor operations.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::stepping::RkAttempt;
use crate::client::DiffClient;
use crate::error::DiffResult;

// Dormand-Prince coefficients
const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// 5th order weights
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// Error weights (5th - 4th order)
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

/// Compute `y + h * sum(coeffs[i] * stages[i])`.
pub(crate) fn weighted_sum<R, C>(
    client: &C,
    y: &Tensor<R>,
    stages: &[&Tensor<R>],
    coeffs: &[f64],
    h: f64,
) -> DiffResult<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    debug_assert_eq!(stages.len(), coeffs.len());

    let mut result = y.clone();
    for (stage, &c) in stages.iter().zip(coeffs) {
        if c != 0.0 {
            let term = client.mul_scalar(stage, h * c)?;
            result = client.add(&result, &term)?;
        }
    }
    Ok(result)
}

/// One Dormand-Prince step of size `h` from `(t, y)` with `k1 = f(t, y)`.
///
/// With `estimate`, also evaluates the FSAL stage and the embedded error.
pub(crate) fn rk45_step<R, C, F>(
    client: &C,
    f: &mut F,
    t: f64,
    y: &Tensor<R>,
    k1: &Tensor<R>,
    h: f64,
    estimate: bool,
) -> DiffResult<RkAttempt<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
    F: FnMut(f64, &Tensor<R>) -> DiffResult<Tensor<R>>,
{
    let y_stage = weighted_sum(client, y, &[k1], &[A21], h)?;
    let k2 = f(t + C2 * h, &y_stage)?;

    let y_stage = weighted_sum(client, y, &[k1, &k2], &[A31, A32], h)?;
    let k3 = f(t + C3 * h, &y_stage)?;

    let y_stage = weighted_sum(client, y, &[k1, &k2, &k3], &[A41, A42, A43], h)?;
    let k4 = f(t + C4 * h, &y_stage)?;

    let y_stage = weighted_sum(client, y, &[k1, &k2, &k3, &k4], &[A51, A52, A53, A54], h)?;
    let k5 = f(t + C5 * h, &y_stage)?;

    let y_stage = weighted_sum(
        client,
        y,
        &[k1, &k2, &k3, &k4, &k5],
        &[A61, A62, A63, A64, A65],
        h,
    )?;
    let k6 = f(t + h, &y_stage)?;

    // b2 = 0, so k2 is skipped
    let y5 = weighted_sum(client, y, &[k1, &k3, &k4, &k5, &k6], &[B1, B3, B4, B5, B6], h)?;

    if !estimate {
        return Ok(RkAttempt {
            y: y5,
            f: None,
            err: None,
        });
    }

    // k7 (FSAL) = f(t + h, y5)
    let k7 = f(t + h, &y5)?;
    let zero = client.mul_scalar(y, 0.0)?;
    let y_err = weighted_sum(
        client,
        &zero,
        &[k1, &k3, &k4, &k5, &k6, &k7],
        &[E1, E3, E4, E5, E6, E7],
        h,
    )?;

    Ok(RkAttempt {
        y: y5,
        f: Some(k7),
        err: Some(y_err),
    })
}
