//! Stateful integrator front object.

use std::fmt;
use std::sync::Arc;

use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

use super::impl_generic::{
    CheckpointStore, adjoint_from_checkpoints, forward_sensitivity_impl, integrate_impl,
};
use super::system::OdeSystem;
use super::types::{
    AdMode, AdjointSensitivityResult, ForwardSensitivityResult, IntegrationStatistics,
    IntegratorOptions, OptionValue,
};
use crate::client::DiffClient;
use crate::differentiate::{JacobianMode, jacobian_of};
use crate::error::{DiffError, DiffResult};
use crate::expr::{Expr, Graph};
use crate::function::Function;

/// Lifecycle of an [`Integrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegratorState {
    Uninitialized,
    Configured,
    Ready,
    Integrating,
    Completed,
    Failed,
}

impl fmt::Display for IntegratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Configured => "configured",
            Self::Ready => "ready",
            Self::Integrating => "integrating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Input of the integrator a Jacobian is taken with respect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegratorInput {
    InitialState,
    Parameters,
    /// The end time `tf`. Only available through [`Integrator::horizon_derivative`].
    Horizon,
}

/// Per-solve memory: the arguments and trajectory of the last successful solve.
struct Solution<R: Runtime> {
    x0: Tensor<R>,
    p: Tensor<R>,
    y_final: Tensor<R>,
    checkpoints: Option<CheckpointStore<R>>,
}

/// An ODE integrator with forward and adjoint sensitivities.
///
/// ```text
/// Uninitialized --configure--> Configured --initialize--> Ready
/// Ready --solve--> Integrating --> Completed | Failed
/// ```
///
/// Options are fixed once the integrator is `Ready`. A failed integrator is
/// reconfigured or re-initialized before it is used again. Sensitivities act
/// on the trajectory of the most recent successful solve.
pub struct Integrator<R: Runtime> {
    name: String,
    state: IntegratorState,
    rhs: Option<Function>,
    options: IntegratorOptions,
    system: Option<Arc<OdeSystem>>,
    solution: Option<Solution<R>>,
    statistics: IntegrationStatistics,
}

impl<R> Integrator<R>
where
    R: Runtime<DType = DType>,
{
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: IntegratorState::Uninitialized,
            rhs: None,
            options: IntegratorOptions::default(),
            system: None,
            solution: None,
            statistics: IntegrationStatistics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> IntegratorState {
        self.state
    }

    pub fn options(&self) -> &IntegratorOptions {
        &self.options
    }

    /// Work counters accumulated since the last `initialize`.
    pub fn statistics(&self) -> IntegrationStatistics {
        self.statistics
    }

    /// The ODE system, once initialized.
    pub fn system(&self) -> Option<&Arc<OdeSystem>> {
        self.system.as_ref()
    }

    fn require(&self, operation: &str, allowed: &[IntegratorState]) -> DiffResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DiffError::InvalidState {
                operation: operation.to_string(),
                state: self.state.to_string(),
            })
        }
    }

    fn transition(&mut self, to: IntegratorState) {
        log::debug!("integrator '{}': {} -> {}", self.name, self.state, to);
        self.state = to;
    }

    fn initialized_system(&self, operation: &str) -> DiffResult<&Arc<OdeSystem>> {
        self.system.as_ref().ok_or_else(|| DiffError::InvalidState {
            operation: operation.to_string(),
            state: self.state.to_string(),
        })
    }

    /// Set the right-hand side `f(t, x, p) -> x'` and the options.
    ///
    /// Allowed before `initialize` and after a failure.
    pub fn configure(&mut self, rhs: &Function, options: IntegratorOptions) -> DiffResult<()> {
        self.require(
            "configure",
            &[
                IntegratorState::Uninitialized,
                IntegratorState::Configured,
                IntegratorState::Failed,
            ],
        )?;
        options.validate()?;
        if rhs.n_inputs() != 3 || rhs.n_outputs() != 1 {
            return Err(DiffError::DimensionError {
                context: format!(
                    "{}: right-hand side must map (t, x, p) to x', got {} inputs and {} outputs",
                    self.name,
                    rhs.n_inputs(),
                    rhs.n_outputs()
                ),
            });
        }
        self.rhs = Some(rhs.clone());
        self.options = options;
        self.system = None;
        self.solution = None;
        self.transition(IntegratorState::Configured);
        Ok(())
    }

    /// [`configure`](Self::configure) with string-keyed options.
    pub fn configure_with(&mut self, rhs: &Function, pairs: &[(&str, OptionValue)]) -> DiffResult<()> {
        let options = IntegratorOptions::from_pairs(pairs)?;
        self.configure(rhs, options)
    }

    /// Check state and parameter dimensions and build the ODE system.
    pub fn initialize(&mut self) -> DiffResult<()> {
        self.require(
            "initialize",
            &[
                IntegratorState::Configured,
                IntegratorState::Completed,
                IntegratorState::Failed,
            ],
        )?;
        let rhs = self.rhs.as_ref().ok_or_else(|| DiffError::InvalidState {
            operation: "initialize".to_string(),
            state: self.state.to_string(),
        })?;
        let system = OdeSystem::new(&self.name, rhs, self.options.clone())?;
        self.system = Some(system);
        self.solution = None;
        self.statistics = IntegrationStatistics::default();
        self.transition(IntegratorState::Ready);
        Ok(())
    }

    /// Integrate from `x0` with parameters `p` and return `x(tf)`.
    ///
    /// Checkpoints are recorded when the AD mode is adjoint.
    pub fn solve<C: DiffClient<R>>(
        &mut self,
        client: &C,
        x0: &Tensor<R>,
        p: &Tensor<R>,
    ) -> DiffResult<Tensor<R>> {
        self.require("solve", &[IntegratorState::Ready, IntegratorState::Completed])?;
        let system = Arc::clone(self.initialized_system("solve")?);
        let record = self.options.ad_mode == AdMode::Adjoint;

        let before = self.state;
        self.transition(IntegratorState::Integrating);
        let trajectory = self.guard(before, integrate_impl(client, &system, x0, p, record))?;
        self.statistics.merge(&trajectory.statistics);
        self.solution = Some(Solution {
            x0: x0.clone(),
            p: p.clone(),
            y_final: trajectory.y_final.clone(),
            checkpoints: trajectory.checkpoints,
        });
        self.transition(IntegratorState::Completed);
        Ok(trajectory.y_final)
    }

    /// Directional derivative of the last terminal state along `(dx0, dp)`.
    pub fn forward_sensitivity<C: DiffClient<R>>(
        &mut self,
        client: &C,
        dx0: Option<&Tensor<R>>,
        dp: Option<&Tensor<R>>,
    ) -> DiffResult<ForwardSensitivityResult<R>> {
        self.require("compute forward sensitivities", &[IntegratorState::Completed])?;
        let system = Arc::clone(self.initialized_system("compute forward sensitivities")?);
        let Some(solution) = self.solution.as_ref() else {
            return Err(DiffError::InvalidState {
                operation: "compute forward sensitivities".to_string(),
                state: "no solution".to_string(),
            });
        };
        let result = forward_sensitivity_impl(client, &system, &solution.x0, &solution.p, dx0, dp);
        let result = self.guard(IntegratorState::Completed, result)?;
        self.statistics.merge(&result.statistics);
        Ok(result)
    }

    /// Adjoint sensitivities of the last terminal state for the seed `lambda`.
    ///
    /// Replays the trajectory from the checkpoints of the last solve.
    pub fn adjoint_sensitivity<C: DiffClient<R>>(
        &mut self,
        client: &C,
        lambda: &Tensor<R>,
    ) -> DiffResult<AdjointSensitivityResult<R>> {
        let operation = "compute adjoint sensitivities";
        self.require(operation, &[IntegratorState::Completed])?;
        let system = Arc::clone(self.initialized_system(operation)?);
        let store = self.solution.as_ref().and_then(|s| s.checkpoints.as_ref());
        let (Some(solution), Some(store)) = (self.solution.as_ref(), store) else {
            return Err(DiffError::InvalidState {
                operation: operation.to_string(),
                state: format!("{} without checkpoints (ad_mode = forward)", self.state),
            });
        };
        let y_final = solution.y_final.clone();
        let result = adjoint_from_checkpoints(
            client,
            &system,
            &solution.p,
            store,
            std::slice::from_ref(lambda),
        );
        let (mut outputs, statistics) = self.guard(IntegratorState::Completed, result)?;
        self.statistics.merge(&statistics);

        let (Some(adjoint_parameters), Some(adjoint_state)) = (outputs.pop(), outputs.pop()) else {
            return Err(DiffError::DimensionError {
                context: format!("{}: adjoint pass returned no sensitivities", self.name),
            });
        };
        Ok(AdjointSensitivityResult {
            y_final,
            adjoint_state,
            adjoint_parameters,
            statistics,
        })
    }

    /// Move to `Failed` when an integration pass diverges.
    ///
    /// Any other error (a wrong-shape argument or seed) leaves the integrator
    /// in `before` with the last solution intact.
    fn guard<T>(&mut self, before: IntegratorState, result: DiffResult<T>) -> DiffResult<T> {
        match &result {
            Err(e @ DiffError::IntegrationDivergence { .. }) => {
                log::warn!("integrator '{}' failed: {}", self.name, e);
                self.transition(IntegratorState::Failed);
            }
            Err(e) => {
                log::debug!("integrator '{}' rejected a call: {}", self.name, e);
                if self.state != before {
                    self.transition(before);
                }
            }
            Ok(_) => {}
        }
        result
    }

    /// Insert a call node computing `x(tf)` from `(x0, p)` in `target`.
    pub fn call(&self, target: &Graph, x0: Expr, p: Expr) -> DiffResult<Expr> {
        self.initialized_system("call")?.call(target, x0, p)
    }

    /// The map `(x0, p) -> x(tf)` as a Function.
    pub fn function(&self) -> DiffResult<Function> {
        let system = self.initialized_system("build function")?;
        let g = Graph::new();
        let x0 = g.column_symbol("x0", system.state_dim());
        let p = g.column_symbol("p", system.parameter_dim());
        let xf = system.call(&g, x0, p)?;
        Function::new(&self.name, &g, &[x0, p], &[xf])
    }

    /// Jacobian of `x(tf)` with respect to `input`, as a Function of `(x0, p)`.
    pub fn jacobian(&self, input: IntegratorInput, mode: JacobianMode) -> DiffResult<Function> {
        let index = match input {
            IntegratorInput::InitialState => 0,
            IntegratorInput::Parameters => 1,
            IntegratorInput::Horizon => {
                return Err(DiffError::UnsupportedDerivative {
                    context: format!(
                        "{}: Jacobian with respect to the horizon (use horizon_derivative)",
                        self.name
                    ),
                });
            }
        };
        jacobian_of(&self.function()?, index, 0, mode)
    }

    /// `dx(tf)/dtf = f(tf, x(tf), p)` as a Function of `(x0, p)`.
    pub fn horizon_derivative(&self) -> DiffResult<Function> {
        let system = self.initialized_system("build horizon derivative")?;
        let g = Graph::new();
        let x0 = g.column_symbol("x0", system.state_dim());
        let p = g.column_symbol("p", system.parameter_dim());
        let xf = system.call(&g, x0, p)?;
        let tf = g.scalar(system.options().tf);
        let dxf = system.rhs().call(&g, &[tf, xf, p])?;
        Function::new(&format!("{}_dtf", self.name), &g, &[x0, p], &dxf)
    }
}

impl<R: Runtime> fmt::Debug for Integrator<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integrator")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("options", &self.options)
            .field("statistics", &self.statistics)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

    fn setup() -> (CpuDevice, CpuClient) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (device, client)
    }

    fn col(device: &CpuDevice, values: &[f64]) -> Tensor<CpuRuntime> {
        Tensor::<CpuRuntime>::from_slice(values, &[values.len(), 1], device)
    }

    /// y' = -k y.
    fn decay_rhs() -> Function {
        let g = Graph::new();
        let t = g.scalar_symbol("t");
        let y = g.column_symbol("y", 1);
        let k = g.column_symbol("k", 1);
        let ky = g.mul(k, y).unwrap();
        let dy = g.neg(ky).unwrap();
        Function::new("decay", &g, &[t, y, k], &[dy]).unwrap()
    }

    #[test]
    fn test_state_machine_transitions() {
        let (device, client) = setup();
        let mut integrator = Integrator::<CpuRuntime>::new("decay");
        assert_eq!(integrator.state(), IntegratorState::Uninitialized);

        let err = integrator.initialize().unwrap_err();
        assert!(matches!(err, DiffError::InvalidState { .. }));

        integrator
            .configure(&decay_rhs(), IntegratorOptions::default())
            .unwrap();
        assert_eq!(integrator.state(), IntegratorState::Configured);

        let err = integrator
            .solve(&client, &col(&device, &[1.0]), &col(&device, &[1.0]))
            .unwrap_err();
        assert!(matches!(err, DiffError::InvalidState { .. }));

        integrator.initialize().unwrap();
        assert_eq!(integrator.state(), IntegratorState::Ready);

        let y = integrator
            .solve(&client, &col(&device, &[1.0]), &col(&device, &[1.0]))
            .unwrap();
        assert_eq!(integrator.state(), IntegratorState::Completed);
        let y: Vec<f64> = y.to_vec();
        assert!((y[0] - (-1.0f64).exp()).abs() < 1e-7);

        let err = integrator
            .configure(&decay_rhs(), IntegratorOptions::default())
            .unwrap_err();
        assert!(matches!(err, DiffError::InvalidState { .. }));
    }

    #[test]
    fn test_configure_rejects_unknown_option() {
        let mut integrator = Integrator::<CpuRuntime>::new("decay");
        let err = integrator
            .configure_with(&decay_rhs(), &[("stepsize", 0.1.into())])
            .unwrap_err();
        assert!(matches!(err, DiffError::ConfigurationError { .. }));
        assert_eq!(integrator.state(), IntegratorState::Uninitialized);
    }

    #[test]
    fn test_divergence_moves_to_failed() {
        // y' = y², y(0) = 1 blows up at t = 1.
        let (device, client) = setup();
        let g = Graph::new();
        let t = g.scalar_symbol("t");
        let y = g.column_symbol("y", 1);
        let p = g.column_symbol("p", 0);
        let dy = g.mul(y, y).unwrap();
        let rhs = Function::new("blowup", &g, &[t, y, p], &[dy]).unwrap();

        let mut integrator = Integrator::<CpuRuntime>::new("blowup");
        integrator
            .configure(
                &rhs,
                IntegratorOptions::default()
                    .with_horizon(0.0, 2.0)
                    .with_min_step(1e-8),
            )
            .unwrap();
        integrator.initialize().unwrap();
        let p0 = Tensor::<CpuRuntime>::zeros(&[0, 1], DType::F64, &device);
        let err = integrator
            .solve(&client, &col(&device, &[1.0]), &p0)
            .unwrap_err();
        assert!(matches!(err, DiffError::IntegrationDivergence { .. }));
        assert_eq!(integrator.state(), IntegratorState::Failed);

        integrator.initialize().unwrap();
        assert_eq!(integrator.state(), IntegratorState::Ready);
    }

    #[test]
    fn test_sensitivities_of_last_solve() {
        let (device, client) = setup();
        let mut integrator = Integrator::<CpuRuntime>::new("decay");
        integrator
            .configure_with(
                &decay_rhs(),
                &[("tf", 2.0.into()), ("checkpoint_stride", 2usize.into())],
            )
            .unwrap();
        integrator.initialize().unwrap();
        integrator
            .solve(&client, &col(&device, &[3.0]), &col(&device, &[0.25]))
            .unwrap();

        let e = (-0.5f64).exp();
        let fwd = integrator
            .forward_sensitivity(&client, None, Some(&col(&device, &[1.0])))
            .unwrap();
        assert!((fwd.tangent_vec()[0] + 2.0 * 3.0 * e).abs() < 1e-6);

        let adj = integrator
            .adjoint_sensitivity(&client, &col(&device, &[1.0]))
            .unwrap();
        assert!((adj.adjoint_state_vec()[0] - e).abs() < 1e-7);
        assert!((adj.adjoint_parameters_vec()[0] + 6.0 * e).abs() < 1e-6);
        assert!(integrator.statistics().replayed_segments > 0);
    }

    #[test]
    fn test_adjoint_requires_checkpoints() {
        let (device, client) = setup();
        let mut integrator = Integrator::<CpuRuntime>::new("decay");
        integrator
            .configure(
                &decay_rhs(),
                IntegratorOptions::default().with_ad_mode(AdMode::Forward),
            )
            .unwrap();
        integrator.initialize().unwrap();
        integrator
            .solve(&client, &col(&device, &[1.0]), &col(&device, &[1.0]))
            .unwrap();
        let err = integrator
            .adjoint_sensitivity(&client, &col(&device, &[1.0]))
            .unwrap_err();
        assert!(matches!(err, DiffError::InvalidState { .. }));
        assert_eq!(integrator.state(), IntegratorState::Completed);
    }

    #[test]
    fn test_wrong_shape_seed_keeps_solution() {
        let (device, client) = setup();
        let mut integrator = Integrator::<CpuRuntime>::new("decay");
        integrator
            .configure(&decay_rhs(), IntegratorOptions::default())
            .unwrap();
        integrator.initialize().unwrap();
        integrator
            .solve(&client, &col(&device, &[1.0]), &col(&device, &[1.0]))
            .unwrap();

        let err = integrator
            .adjoint_sensitivity(&client, &col(&device, &[1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, DiffError::DimensionError { .. }));
        assert_eq!(integrator.state(), IntegratorState::Completed);

        let err = integrator
            .forward_sensitivity(&client, None, Some(&col(&device, &[1.0, 2.0])))
            .unwrap_err();
        assert!(matches!(err, DiffError::DimensionError { .. }));
        assert_eq!(integrator.state(), IntegratorState::Completed);

        let adj = integrator
            .adjoint_sensitivity(&client, &col(&device, &[1.0]))
            .unwrap();
        assert!((adj.adjoint_state_vec()[0] - (-1.0f64).exp()).abs() < 1e-7);
    }

    #[test]
    fn test_wrong_shape_initial_state_keeps_ready() {
        let (device, client) = setup();
        let mut integrator = Integrator::<CpuRuntime>::new("decay");
        integrator
            .configure(&decay_rhs(), IntegratorOptions::default())
            .unwrap();
        integrator.initialize().unwrap();

        let err = integrator
            .solve(&client, &col(&device, &[1.0, 2.0]), &col(&device, &[1.0]))
            .unwrap_err();
        assert!(matches!(err, DiffError::DimensionError { .. }));
        assert_eq!(integrator.state(), IntegratorState::Ready);

        integrator
            .solve(&client, &col(&device, &[1.0]), &col(&device, &[1.0]))
            .unwrap();
        assert_eq!(integrator.state(), IntegratorState::Completed);
    }

    #[test]
    fn test_horizon_derivative_and_unsupported_horizon_jacobian() {
        let (device, client) = setup();
        let mut integrator = Integrator::<CpuRuntime>::new("decay");
        integrator
            .configure(&decay_rhs(), IntegratorOptions::default())
            .unwrap();
        integrator.initialize().unwrap();

        let dtf = integrator.horizon_derivative().unwrap();
        let out = dtf
            .eval(&client, &[col(&device, &[1.0]), col(&device, &[2.0])])
            .unwrap();
        let v: Vec<f64> = out[0].to_vec();
        assert!((v[0] + 2.0 * (-2.0f64).exp()).abs() < 1e-7);

        let err = integrator
            .jacobian(IntegratorInput::Horizon, JacobianMode::Auto)
            .unwrap_err();
        assert!(matches!(err, DiffError::UnsupportedDerivative { .. }));
    }

    #[test]
    fn test_jacobian_with_respect_to_parameters() {
        let (device, client) = setup();
        let mut integrator = Integrator::<CpuRuntime>::new("decay");
        integrator
            .configure(&decay_rhs(), IntegratorOptions::default())
            .unwrap();
        integrator.initialize().unwrap();

        for mode in [JacobianMode::Forward, JacobianMode::Adjoint] {
            let jac = integrator.jacobian(IntegratorInput::Parameters, mode).unwrap();
            let out = jac
                .eval(&client, &[col(&device, &[2.0]), col(&device, &[0.5])])
                .unwrap();
            let j: Vec<f64> = out[0].to_vec();
            assert!((j[0] + 2.0 * (-0.5f64).exp()).abs() < 1e-7, "{:?}", mode);
        }
    }
}
