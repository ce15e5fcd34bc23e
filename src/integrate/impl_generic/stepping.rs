//! The adaptive single-step driver shared by forward, replay and backward passes.
//!
//! All three passes run the same loop: the replay of a checkpointed segment is
//! only bit-identical to the recorded trajectory because it executes exactly
//! the code path that produced it, from the same stepper state.

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::checkpointing::CheckpointStore;
use super::rk23::rk23_step;
use super::rk45::rk45_step;
use super::step_control::{ErrorNorm, StepSizeController};
use crate::client::DiffClient;
use crate::error::{DiffError, DiffResult};
use crate::integrate::types::{IntegratorOptions, ODEMethod};

/// Raw result of one Runge-Kutta stage sequence.
pub(crate) struct RkAttempt<R: Runtime> {
    pub(crate) y: Tensor<R>,
    /// FSAL stage `f(t + h, y)`, when requested.
    pub(crate) f: Option<Tensor<R>>,
    /// Embedded error estimate, when requested.
    pub(crate) err: Option<Tensor<R>>,
}

/// Stepper state between accepted steps.
#[derive(Debug, Clone)]
pub struct StepperState<R: Runtime> {
    pub t: f64,
    pub y: Tensor<R>,
    /// `f(t, y)`, the first stage of the next step.
    pub f: Tensor<R>,
    /// Proposed size of the next step.
    pub h: f64,
}

/// Outcome of a single step attempt.
#[derive(Debug, Clone)]
pub struct StepOutcome<R: Runtime> {
    pub t_next: f64,
    pub y_next: Tensor<R>,
    pub f_next: Tensor<R>,
    pub accepted: bool,
    /// Normalized error estimate; the step is accepted when it is at most 1.
    pub error: f64,
    /// Proposed size of the following step.
    pub h_next: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StepCounters {
    pub(crate) accepted: usize,
    pub(crate) rejected: usize,
}

/// Single-step method with error control and a step-size floor.
#[derive(Debug, Clone)]
pub(crate) struct Stepper {
    method: ODEMethod,
    norm: ErrorNorm,
    h0: Option<f64>,
    min_step: f64,
    max_steps: usize,
    controller: StepSizeController,
}

impl Stepper {
    /// Stepper for the forward trajectory.
    pub(crate) fn forward(options: &IntegratorOptions) -> Self {
        Self::with_tolerances(options, options.rtol, options.atol)
    }

    /// Stepper for the backward adjoint integration.
    pub(crate) fn backward(options: &IntegratorOptions) -> Self {
        let (rtol, atol) = options.adjoint_tolerances();
        Self::with_tolerances(options, rtol, atol)
    }

    fn with_tolerances(options: &IntegratorOptions, rtol: f64, atol: f64) -> Self {
        Self {
            method: options.method,
            norm: ErrorNorm::new(rtol, atol),
            h0: options.h0,
            min_step: options.min_step,
            max_steps: options.max_steps,
            controller: StepSizeController::for_method(options.method, options.max_step),
        }
    }

    pub(crate) fn norm(&self) -> &ErrorNorm {
        &self.norm
    }

    fn attempt<R, C, F>(
        &self,
        client: &C,
        f: &mut F,
        state: &StepperState<R>,
        h: f64,
        estimate: bool,
    ) -> DiffResult<RkAttempt<R>>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
        F: FnMut(f64, &Tensor<R>) -> DiffResult<Tensor<R>>,
    {
        match self.method {
            ODEMethod::RK45 => rk45_step(client, f, state.t, &state.y, &state.f, h, estimate),
            ODEMethod::RK23 => rk23_step(client, f, state.t, &state.y, &state.f, h, estimate),
        }
    }

    /// Stepper state at `(t0, y0)` for an integration ending at `t_end`.
    pub(crate) fn initial_state<R, C, F>(
        &self,
        client: &C,
        f: &mut F,
        t0: f64,
        y0: &Tensor<R>,
        t_end: f64,
    ) -> DiffResult<StepperState<R>>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
        F: FnMut(f64, &Tensor<R>) -> DiffResult<Tensor<R>>,
    {
        let f0 = f(t0, y0)?;
        let span = t_end - t0;
        let h = if span <= 0.0 {
            0.0
        } else {
            let h = match self.h0 {
                Some(h0) => h0,
                None => self
                    .controller
                    .initial_step(client, &self.norm, f, t0, y0, &f0)?,
            };
            h.clamp(self.min_step, self.controller.max_step.min(span).max(self.min_step))
        };
        Ok(StepperState {
            t: t0,
            y: y0.clone(),
            f: f0,
            h,
        })
    }

    /// Attempt one step from `state`, truncated so as not to pass `t_end`.
    pub(crate) fn step<R, C, F>(
        &self,
        client: &C,
        f: &mut F,
        state: &StepperState<R>,
        t_end: f64,
    ) -> DiffResult<StepOutcome<R>>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
        F: FnMut(f64, &Tensor<R>) -> DiffResult<Tensor<R>>,
    {
        let remaining = t_end - state.t;
        let last = state.h >= remaining;
        let h = if last { remaining } else { state.h };

        let attempt = self.attempt(client, f, state, h, true)?;
        let (Some(f_next), Some(y_err)) = (attempt.f, attempt.err) else {
            return Err(DiffError::InvalidState {
                operation: "step".to_string(),
                state: "error estimate missing".to_string(),
            });
        };
        let error = self.norm.step_error(client, &state.y, &attempt.y, &y_err)?;
        let decision = self.controller.decide(h, error);

        Ok(StepOutcome {
            t_next: if last { t_end } else { state.t + h },
            y_next: attempt.y,
            f_next,
            accepted: decision.accepted,
            error,
            h_next: decision.h_next,
        })
    }

    /// Uncontrolled step of size `dt` (used to reach times between accepted steps).
    pub(crate) fn advance<R, C, F>(
        &self,
        client: &C,
        f: &mut F,
        state: &StepperState<R>,
        dt: f64,
    ) -> DiffResult<Tensor<R>>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
        F: FnMut(f64, &Tensor<R>) -> DiffResult<Tensor<R>>,
    {
        Ok(self.attempt(client, f, state, dt, false)?.y)
    }

    /// Step from `state` until `t_end`, or until `limit` steps have been accepted.
    ///
    /// `on_accept` sees the running count of accepted steps and the new state.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run<R, C, F, G>(
        &self,
        client: &C,
        f: &mut F,
        state: &mut StepperState<R>,
        t_end: f64,
        limit: Option<usize>,
        counters: &mut StepCounters,
        mut on_accept: G,
    ) -> DiffResult<()>
    where
        R: Runtime<DType = DType>,
        C: DiffClient<R>,
        F: FnMut(f64, &Tensor<R>) -> DiffResult<Tensor<R>>,
        G: FnMut(usize, &StepperState<R>) -> DiffResult<()>,
    {
        let mut taken = 0;
        let mut attempts = 0;
        while state.t < t_end && limit.is_none_or(|l| taken < l) {
            if attempts >= self.max_steps {
                return Err(DiffError::IntegrationDivergence {
                    t: state.t,
                    step: state.h,
                    context: format!("maximum number of steps ({}) exceeded", self.max_steps),
                });
            }
            attempts += 1;

            let outcome = self.step(client, f, state, t_end)?;
            if outcome.accepted {
                *state = StepperState {
                    t: outcome.t_next,
                    y: outcome.y_next,
                    f: outcome.f_next,
                    h: outcome.h_next,
                };
                taken += 1;
                counters.accepted += 1;
                on_accept(taken, state)?;
                if state.t < t_end && state.h < self.min_step {
                    return Err(DiffError::IntegrationDivergence {
                        t: state.t,
                        step: state.h,
                        context: format!(
                            "proposed step fell below the floor {:.3e} (error estimate {:.3e})",
                            self.min_step, outcome.error
                        ),
                    });
                }
            } else {
                counters.rejected += 1;
                log::trace!(
                    "rejected step at t = {:.6e}: h = {:.3e}, error = {:.3e}",
                    state.t,
                    state.h,
                    outcome.error
                );
                if outcome.h_next < self.min_step {
                    return Err(DiffError::IntegrationDivergence {
                        t: state.t,
                        step: outcome.h_next,
                        context: format!(
                            "step size fell below the floor {:.3e} (error estimate {:.3e})",
                            self.min_step, outcome.error
                        ),
                    });
                }
                state.h = outcome.h_next;
            }
        }
        Ok(())
    }
}

/// A finished integration: terminal stepper state, optional checkpoints, work counters.
pub(crate) struct Trajectory<R: Runtime> {
    pub(crate) terminal: StepperState<R>,
    pub(crate) checkpoints: Option<CheckpointStore<R>>,
    pub(crate) counters: StepCounters,
}

/// Integrate from `(t0, y0)` to `tf`, recording a checkpoint every `stride`
/// accepted steps when `stride` is given.
#[allow(clippy::too_many_arguments)]
pub(crate) fn integrate_trajectory<R, C, F>(
    client: &C,
    stepper: &Stepper,
    f: &mut F,
    t0: f64,
    tf: f64,
    y0: &Tensor<R>,
    stride: Option<usize>,
) -> DiffResult<Trajectory<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
    F: FnMut(f64, &Tensor<R>) -> DiffResult<Tensor<R>>,
{
    let mut state = stepper.initial_state(client, f, t0, y0, tf)?;
    let mut counters = StepCounters::default();
    let mut store = match stride {
        Some(stride) => {
            let mut store = CheckpointStore::new(stride);
            store.add_checkpoint(0, state.clone())?;
            Some(store)
        }
        None => None,
    };

    stepper.run(client, f, &mut state, tf, None, &mut counters, |step, s| {
        if let Some(store) = store.as_mut() {
            if step % store.stride() == 0 {
                store.add_checkpoint(step, s.clone())?;
            }
        }
        Ok(())
    })?;

    if let Some(store) = store.as_mut() {
        if store.last_step() != Some(counters.accepted) {
            store.add_checkpoint(counters.accepted, state.clone())?;
        }
        log::debug!(
            "recorded {} checkpoints over {} steps (stride {})",
            store.len(),
            counters.accepted,
            store.stride()
        );
    }

    Ok(Trajectory {
        terminal: state,
        checkpoints: store,
        counters,
    })
}
