//! Runtime-generic integration and sensitivity passes.
//!
//! These implementations work across all Runtime backends by using
//! numr's tensor operations.

pub(crate) mod adjoint_ode;
pub mod checkpointing;
pub(crate) mod replay;
pub(crate) mod rhs;
mod rk23;
mod rk45;
pub mod step_control;
pub mod stepping;

pub use checkpointing::{Checkpoint, CheckpointStore};
pub use step_control::{ErrorNorm, StepDecision, StepSizeController};
pub use stepping::{StepOutcome, StepperState};

use std::sync::Arc;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use adjoint_ode::backward_pass;
use rhs::RhsEvaluator;
use stepping::{Stepper, integrate_trajectory};

use crate::client::DiffClient;
use crate::error::{DiffError, DiffResult};
use crate::eval::algebra::Algebra;
use crate::eval::impl_generic::NumericAlgebra;
use crate::expr::Shape;
use crate::integrate::types::{
    AdjointSensitivityResult, ForwardSensitivityResult, IntegrationStatistics,
};
use crate::integrate::{AdjointSystem, OdeSystem};

/// A forward integration: terminal state, optional checkpoints and work counters.
#[derive(Debug, Clone)]
pub struct TrajectoryResult<R: Runtime> {
    /// Terminal state `x(tf)`.
    pub y_final: Tensor<R>,

    /// Checkpoints of the trajectory, when recorded.
    pub checkpoints: Option<CheckpointStore<R>>,

    pub statistics: IntegrationStatistics,
}

fn check_dimension<R: Runtime>(
    system: &OdeSystem,
    what: &str,
    value: &Tensor<R>,
    expected: usize,
) -> DiffResult<()> {
    let got = Shape::from_dims(value.shape());
    if got != Shape::column(expected) {
        return Err(DiffError::DimensionError {
            context: format!(
                "{}: {} has shape {}, expected {}",
                system.name(),
                what,
                got,
                Shape::column(expected)
            ),
        });
    }
    Ok(())
}

/// Integrate `system` from `x0` over its horizon, recording checkpoints when `record` is set.
pub fn integrate_impl<R, C>(
    client: &C,
    system: &OdeSystem,
    x0: &Tensor<R>,
    p: &Tensor<R>,
    record: bool,
) -> DiffResult<TrajectoryResult<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    check_dimension(system, "initial state", x0, system.state_dim())?;
    check_dimension(system, "parameters", p, system.parameter_dim())?;
    let options = system.options();

    let primal = RhsEvaluator::new(client, system.rhs());
    let mut f = |t: f64, y: &Tensor<R>| primal.eval(t, &[y, p]);
    let stride = record.then_some(options.checkpoint_stride);
    let trajectory = integrate_trajectory(
        client,
        &Stepper::forward(options),
        &mut f,
        options.t0,
        options.tf,
        x0,
        stride,
    )?;

    let statistics = IntegrationStatistics {
        accepted_steps: trajectory.counters.accepted,
        rejected_steps: trajectory.counters.rejected,
        rhs_evaluations: primal.evaluations(),
        checkpoints: trajectory.checkpoints.as_ref().map_or(0, |s| s.len()),
        ..Default::default()
    };
    log::trace!(
        "{}: integrated [{}, {}] in {} steps ({} rejected)",
        system.name(),
        options.t0,
        options.tf,
        statistics.accepted_steps,
        statistics.rejected_steps
    );
    Ok(TrajectoryResult {
        y_final: trajectory.terminal.y,
        checkpoints: trajectory.checkpoints,
        statistics,
    })
}

/// Adjoint sensitivities for `seeds` from checkpoints of a finished forward pass.
///
/// Returns `(λ_1(t0), μ_1, .., λ_k(t0), μ_k)`.
pub(crate) fn adjoint_from_checkpoints<R, C>(
    client: &C,
    system: &Arc<OdeSystem>,
    p: &Tensor<R>,
    store: &CheckpointStore<R>,
    seeds: &[Tensor<R>],
) -> DiffResult<(Vec<Tensor<R>>, IntegrationStatistics)>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    let adjoint = system.adjoint_system(seeds.len())?;
    let pass = backward_pass(client, system, adjoint.rhs(), p, store, seeds)?;
    Ok((pass.outputs, pass.statistics))
}

/// Terminal state of `system`, without checkpoints.
pub(crate) fn terminal_state_impl<R, C>(
    client: &C,
    system: &Arc<OdeSystem>,
    x0: &Tensor<R>,
    p: &Tensor<R>,
) -> DiffResult<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    Ok(integrate_impl(client, system, x0, p, false)?.y_final)
}

/// Outputs of an [`AdjointSystem`] call with arguments `(x0, p, λ_1, .., λ_k)`.
pub(crate) fn adjoint_outputs_impl<R, C>(
    client: &C,
    system: &Arc<AdjointSystem>,
    args: &[Tensor<R>],
) -> DiffResult<Vec<Tensor<R>>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    let k = system.directions();
    if args.len() != 2 + k {
        return Err(DiffError::DimensionError {
            context: format!(
                "{}: expected {} arguments, got {}",
                system.name(),
                2 + k,
                args.len()
            ),
        });
    }
    let base = system.base();
    let (x0, p) = (&args[0], &args[1]);
    let trajectory = integrate_impl(client, base, x0, p, true)?;
    let store = trajectory.checkpoints.ok_or_else(|| DiffError::InvalidState {
        operation: "adjoint integration".to_string(),
        state: "no checkpoints recorded".to_string(),
    })?;
    let pass = backward_pass(client, base, system.rhs(), p, &store, &args[2..])?;
    Ok(pass.outputs)
}

/// Terminal state and its directional derivative along `(dx0, dp)`.
///
/// Integrates the primal ODE together with its variational equation. Absent
/// tangents are zero.
pub fn forward_sensitivity_impl<R, C>(
    client: &C,
    system: &Arc<OdeSystem>,
    x0: &Tensor<R>,
    p: &Tensor<R>,
    dx0: Option<&Tensor<R>>,
    dp: Option<&Tensor<R>>,
) -> DiffResult<ForwardSensitivityResult<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    let (n, m) = (system.state_dim(), system.parameter_dim());
    check_dimension(system, "initial state", x0, n)?;
    check_dimension(system, "parameters", p, m)?;
    if let Some(dx0) = dx0 {
        check_dimension(system, "initial state tangent", dx0, n)?;
    }
    if let Some(dp) = dp {
        check_dimension(system, "parameter tangent", dp, m)?;
    }

    let alg = NumericAlgebra::new(client);
    let augmented = system.forward_system(1)?;
    let dx0 = match dx0 {
        Some(v) => v.clone(),
        None => alg.zeros(Shape::column(n))?,
    };
    let dp = match dp {
        Some(v) => v.clone(),
        None => alg.zeros(Shape::column(m))?,
    };
    let xa = alg.vertcat(&[x0.clone(), dx0])?;
    let pa = alg.vertcat(&[p.clone(), dp])?;

    let trajectory = integrate_impl(client, &augmented, &xa, &pa, false)?;
    let y = &trajectory.y_final;
    Ok(ForwardSensitivityResult {
        y_final: alg.slice(y, 0, 0, Shape::column(n))?,
        tangent: alg.slice(y, n, 0, Shape::column(n))?,
        statistics: trajectory.statistics,
    })
}

/// Terminal state and the adjoint sensitivities for the terminal seed `lambda`.
///
/// Runs a checkpointed forward pass followed by the backward adjoint pass.
pub fn adjoint_sensitivity_impl<R, C>(
    client: &C,
    system: &Arc<OdeSystem>,
    x0: &Tensor<R>,
    p: &Tensor<R>,
    lambda: &Tensor<R>,
) -> DiffResult<AdjointSensitivityResult<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    let trajectory = integrate_impl(client, system, x0, p, true)?;
    let store = trajectory.checkpoints.ok_or_else(|| DiffError::InvalidState {
        operation: "adjoint sensitivity".to_string(),
        state: "no checkpoints recorded".to_string(),
    })?;
    let (mut outputs, backward) =
        adjoint_from_checkpoints(client, system, p, &store, std::slice::from_ref(lambda))?;

    let mut statistics = trajectory.statistics;
    statistics.merge(&backward);
    let adjoint_parameters = outputs.pop().unwrap_or_else(|| {
        Tensor::<R>::zeros(&[system.parameter_dim(), 1], DType::F64, client.device())
    });
    let adjoint_state = outputs.pop().unwrap_or_else(|| {
        Tensor::<R>::zeros(&[system.state_dim(), 1], DType::F64, client.device())
    });
    Ok(AdjointSensitivityResult {
        y_final: trajectory.y_final,
        adjoint_state,
        adjoint_parameters,
        statistics,
    })
}
