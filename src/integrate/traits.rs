//! Integration and sensitivity trait.

use std::sync::Arc;

use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::impl_generic::TrajectoryResult;
use super::system::OdeSystem;
use super::types::{AdjointSensitivityResult, ForwardSensitivityResult};
use crate::error::DiffResult;

/// Integration of an [`OdeSystem`] and its first-order sensitivities.
///
/// For `x' = f(t, x, p)` on `[t0, tf]`:
///
/// - forward sensitivity integrates the variational equation
///   `δx' = ∂f/∂x · δx + ∂f/∂p · δp` alongside the primal state, one
///   direction per pass;
/// - adjoint sensitivity integrates `λ' = -(∂f/∂x)ᵀ λ` backward from `tf`,
///   accumulating `μ = ∫ (∂f/∂p)ᵀ λ dt`, and yields the sensitivities to all
///   inputs for one terminal seed.
///
/// The backward pass reconstructs the primal trajectory from checkpoints
/// recorded every `checkpoint_stride` accepted steps, so memory grows with
/// the number of checkpoints instead of the number of steps.
pub trait SensitivityAlgorithms<R: Runtime> {
    /// Integrate from `x0` with parameters `p` over the system's horizon.
    ///
    /// # Arguments
    ///
    /// * `system` - The ODE and its options
    /// * `x0` - Initial state, `n×1`
    /// * `p` - Parameters, `m×1`
    /// * `record_checkpoints` - Keep checkpoints for a later adjoint pass
    fn integrate(
        &self,
        system: &Arc<OdeSystem>,
        x0: &Tensor<R>,
        p: &Tensor<R>,
        record_checkpoints: bool,
    ) -> DiffResult<TrajectoryResult<R>>;

    /// Directional derivative of `x(tf)` along `(dx0, dp)`; `None` is zero.
    fn forward_sensitivity(
        &self,
        system: &Arc<OdeSystem>,
        x0: &Tensor<R>,
        p: &Tensor<R>,
        dx0: Option<&Tensor<R>>,
        dp: Option<&Tensor<R>>,
    ) -> DiffResult<ForwardSensitivityResult<R>>;

    /// `(∂x(tf)/∂x0)ᵀ λ` and `(∂x(tf)/∂p)ᵀ λ` for the terminal seed `lambda`.
    fn adjoint_sensitivity(
        &self,
        system: &Arc<OdeSystem>,
        x0: &Tensor<R>,
        p: &Tensor<R>,
        lambda: &Tensor<R>,
    ) -> DiffResult<AdjointSensitivityResult<R>>;
}
