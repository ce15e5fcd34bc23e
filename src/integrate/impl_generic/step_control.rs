//! Step-size control for the adaptive Runge-Kutta steppers.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use crate::client::DiffClient;
use crate::error::{DiffError, DiffResult};
use crate::integrate::types::ODEMethod;

/// Mixed absolute/relative RMS norm used to judge local errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorNorm {
    pub rtol: f64,
    pub atol: f64,
}

impl ErrorNorm {
    pub fn new(rtol: f64, atol: f64) -> Self {
        Self { rtol, atol }
    }

    /// `atol + rtol * |y|` entrywise.
    fn weights<R, C>(&self, client: &C, magnitude: &Tensor<R>) -> DiffResult<Tensor<R>>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
    {
        Ok(client.add_scalar(&client.mul_scalar(magnitude, self.rtol)?, self.atol)?)
    }

    /// RMS of `v` weighted by `atol + rtol * |y|`.
    pub fn measure<R, C>(&self, client: &C, v: &Tensor<R>, y: &Tensor<R>) -> DiffResult<f64>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
    {
        let w = self.weights(client, &client.abs(y)?)?;
        weighted_rms(client, v, &w)
    }

    /// Error of a step `y_old -> y_new` with embedded estimate `y_err`.
    ///
    /// The weights use the larger magnitude of the two endpoints.
    pub fn step_error<R, C>(
        &self,
        client: &C,
        y_old: &Tensor<R>,
        y_new: &Tensor<R>,
        y_err: &Tensor<R>,
    ) -> DiffResult<f64>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
    {
        let magnitude = client.maximum(&client.abs(y_old)?, &client.abs(y_new)?)?;
        let w = self.weights(client, &magnitude)?;
        weighted_rms(client, y_err, &w)
    }
}

fn weighted_rms<R, C>(client: &C, v: &Tensor<R>, w: &Tensor<R>) -> DiffResult<f64>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    let n = v.numel();
    if n == 0 {
        return Ok(0.0);
    }
    let scaled = client.div(v, w)?;
    let sq = client.mul(&scaled, &scaled)?;
    let total: Vec<f64> = client.sum(&sq, &[0, 1], false)?.to_vec();
    let total = total.first().copied().ok_or_else(|| DiffError::Numeric {
        context: "empty reduction in error norm".to_string(),
    })?;
    Ok((total / n as f64).sqrt())
}

/// Decision on one step attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepDecision {
    pub accepted: bool,
    /// Size of the next attempt; after a rejection, the retry of this step.
    pub h_next: f64,
}

/// Proposes step sizes from normalized local errors.
///
/// The growth factor is `safety * err^(-1/(q+1))` for an error estimator of
/// order `q`, clamped to `[min_factor, max_factor]` and capped at `max_step`.
/// After a rejection the step never grows. The controller does not apply the
/// step floor; the stepping loop turns a proposal below it into a failure.
#[derive(Debug, Clone, Copy)]
pub struct StepSizeController {
    pub safety: f64,
    pub min_factor: f64,
    pub max_factor: f64,
    pub max_step: f64,
    exponent: f64,
}

impl StepSizeController {
    /// Controller for `method` with safety 0.9 and factors in `[0.2, 10]`.
    pub fn for_method(method: ODEMethod, max_step: Option<f64>) -> Self {
        Self {
            safety: 0.9,
            min_factor: 0.2,
            max_factor: 10.0,
            max_step: max_step.unwrap_or(f64::INFINITY),
            exponent: 1.0 / (method.error_order() as f64 + 1.0),
        }
    }

    /// Judge an attempt of size `h` with normalized error `err`.
    pub fn decide(&self, h: f64, err: f64) -> StepDecision {
        if !err.is_finite() {
            return StepDecision {
                accepted: false,
                h_next: h * self.min_factor,
            };
        }
        let accepted = err <= 1.0;
        let factor = if err == 0.0 {
            self.max_factor
        } else {
            (self.safety * err.powf(-self.exponent)).clamp(self.min_factor, self.max_factor)
        };
        let factor = if accepted { factor } else { factor.min(1.0) };
        StepDecision {
            accepted,
            h_next: (h * factor).min(self.max_step),
        }
    }

    /// Starting step for `y' = f(t, y)` at `(t0, y0)` with `f0 = f(t0, y0)`.
    ///
    /// Compares `|y0|` with `|f0|` and probes the curvature with one explicit
    /// Euler step (Hairer, Nørsett & Wanner, Section II.4).
    pub fn initial_step<R, C, F>(
        &self,
        client: &C,
        norm: &ErrorNorm,
        f: &mut F,
        t0: f64,
        y0: &Tensor<R>,
        f0: &Tensor<R>,
    ) -> DiffResult<f64>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
        F: FnMut(f64, &Tensor<R>) -> DiffResult<Tensor<R>>,
    {
        let size_y = norm.measure(client, y0, y0)?;
        let size_f = norm.measure(client, f0, y0)?;
        let probe = if size_y < 1e-5 || size_f < 1e-5 {
            1e-6
        } else {
            0.01 * size_y / size_f
        };

        let y1 = client.add(y0, &client.mul_scalar(f0, probe)?)?;
        let f1 = f(t0 + probe, &y1)?;
        let curvature = norm.measure(client, &client.sub(&f1, f0)?, y0)? / probe;

        let largest = size_f.max(curvature);
        let h = if largest <= 1e-15 {
            (probe * 1e-3).max(1e-6)
        } else {
            (0.01 / largest).powf(self.exponent)
        };
        Ok(h.min(100.0 * probe).min(self.max_step))
    }
}
