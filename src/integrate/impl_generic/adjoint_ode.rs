//! Backward integration of the augmented adjoint ODE.
//!
//! For each seed `λ_j` the augmented state is `z_j = [λ_j; μ_j]`. In reversed
//! time `s = tf - t` it obeys
//!
//! ```text
//! dλ/ds = (∂f/∂x)ᵀ λ,    dμ/ds = (∂f/∂p)ᵀ λ,    λ(s = 0) = seed, μ(s = 0) = 0
//! ```
//!
//! so that at `s = tf - t0` the state holds `(∂x(tf)/∂x0)ᵀ seed` and
//! `(∂x(tf)/∂p)ᵀ seed`. The primal state needed by every right-hand side
//! evaluation is reconstructed from checkpoints by [`Replay`].

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::checkpointing::CheckpointStore;
use super::replay::Replay;
use super::rhs::RhsEvaluator;
use super::stepping::{Stepper, integrate_trajectory};
use crate::client::DiffClient;
use crate::error::{DiffError, DiffResult};
use crate::function::Function;
use crate::integrate::OdeSystem;
use crate::integrate::types::IntegrationStatistics;

/// Output of one backward pass: `(λ_1(t0), μ_1, .., λ_k(t0), μ_k)` and the work done.
pub(crate) struct BackwardPass<R: Runtime> {
    pub(crate) outputs: Vec<Tensor<R>>,
    pub(crate) statistics: IntegrationStatistics,
}

/// Integrate the adjoint ODE of `system` from `tf` back to `t0` for every seed.
///
/// `adjoint_rhs` is the adjoint right-hand side built for `seeds.len()` directions
/// and `store` holds checkpoints of the forward trajectory at parameters `p`.
pub(crate) fn backward_pass<R, C>(
    client: &C,
    system: &OdeSystem,
    adjoint_rhs: &Function,
    p: &Tensor<R>,
    store: &CheckpointStore<R>,
    seeds: &[Tensor<R>],
) -> DiffResult<BackwardPass<R>>
where
    R: Runtime<DType = DType>,
    C: DiffClient<R>,
{
    let (n, m) = (system.state_dim(), system.parameter_dim());
    let options = system.options();
    let (t0, tf) = (options.t0, options.tf);

    let mut parts = Vec::with_capacity(2 * seeds.len());
    for seed in seeds {
        if seed.numel() != n {
            return Err(DiffError::DimensionError {
                context: format!(
                    "{}: adjoint seed has {} entries, state has {}",
                    system.name(),
                    seed.numel(),
                    n
                ),
            });
        }
        parts.push(seed.contiguous().reshape(&[n, 1])?);
        if m > 0 {
            parts.push(Tensor::<R>::zeros(&[m, 1], DType::F64, client.device()));
        }
    }
    let refs: Vec<&Tensor<R>> = parts.iter().collect();
    let z0 = client.cat(&refs, 0)?;

    let forward_stepper = Stepper::forward(options);
    let backward_stepper = Stepper::backward(options);
    let primal = RhsEvaluator::new(client, system.rhs());
    let adjoint = RhsEvaluator::new(client, adjoint_rhs);
    let mut replay = Replay::new(client, &forward_stepper, &primal, p, store);

    let trajectory = {
        let mut f = |s: f64, z: &Tensor<R>| {
            let t = tf - s;
            let x = replay.state_at(t)?;
            adjoint.eval(t, &[&x, p, z])
        };
        integrate_trajectory(client, &backward_stepper, &mut f, 0.0, tf - t0, &z0, None)?
    };

    let z = trajectory.terminal.y;
    let mut outputs = Vec::with_capacity(2 * seeds.len());
    for j in 0..seeds.len() {
        let offset = j * (n + m);
        outputs.push(z.narrow(0, offset, n)?.contiguous());
        if m > 0 {
            outputs.push(z.narrow(0, offset + n, m)?.contiguous());
        } else {
            outputs.push(Tensor::<R>::zeros(&[0, 1], DType::F64, client.device()));
        }
    }

    let replayed = replay.counters();
    let statistics = IntegrationStatistics {
        accepted_steps: replayed.accepted,
        rejected_steps: replayed.rejected + trajectory.counters.rejected,
        adjoint_steps: trajectory.counters.accepted,
        rhs_evaluations: primal.evaluations() + adjoint.evaluations(),
        checkpoints: 0,
        replayed_segments: replay.replays(),
    };
    log::debug!(
        "{}: backward pass over {} seeds took {} steps, replayed {} segments",
        system.name(),
        seeds.len(),
        statistics.adjoint_steps,
        statistics.replayed_segments
    );
    Ok(BackwardPass {
        outputs,
        statistics,
    })
}
