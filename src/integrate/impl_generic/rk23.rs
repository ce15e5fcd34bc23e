//! Bogacki-Shampine RK23 single step using tensor operations.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::rk45::weighted_sum;
use super::stepping::RkAttempt;
use crate::client::DiffClient;
use crate::error::DiffResult;

// Bogacki-Shampine coefficients
const C2: f64 = 0.5;
const C3: f64 = 0.75;

const A21: f64 = 0.5;
const A32: f64 = 0.75;

// 3rd order weights
const B1: f64 = 2.0 / 9.0;
const B2: f64 = 1.0 / 3.0;
const B3: f64 = 4.0 / 9.0;

// Error weights (3rd - 2nd order)
const E1: f64 = -5.0 / 72.0;
const E2: f64 = 1.0 / 12.0;
const E3: f64 = 1.0 / 9.0;
const E4: f64 = -1.0 / 8.0;

/// One Bogacki-Shampine step of size `h` from `(t, y)` with `k1 = f(t, y)`.
pub(crate) fn rk23_step<R, C, F>(
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

    // a31 = 0
    let y_stage = weighted_sum(client, y, &[&k2], &[A32], h)?;
    let k3 = f(t + C3 * h, &y_stage)?;

    let y3 = weighted_sum(client, y, &[k1, &k2, &k3], &[B1, B2, B3], h)?;

    if !estimate {
        return Ok(RkAttempt {
            y: y3,
            f: None,
            err: None,
        });
    }

    let k4 = f(t + h, &y3)?;
    let zero = client.mul_scalar(y, 0.0)?;
    let y_err = weighted_sum(client, &zero, &[k1, &k2, &k3, &k4], &[E1, E2, E3, E4], h)?;

    Ok(RkAttempt {
        y: y3,
        f: Some(k4),
        err: Some(y_err),
    })
}
