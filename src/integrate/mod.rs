//! ODE integration with forward and adjoint sensitivities.
//!
//! This module provides Runtime-first integration of initial value problems
//! `x' = f(t, x, p)` whose right-hand side is a [`Function`](crate::Function).
//!
//! # Architecture
//!
//! - [`OdeSystem`] - an immutable ODE on a fixed horizon, callable from graphs
//!   as `(x0, p) -> x(tf)`
//! - [`AdjointSystem`] - its adjoint sensitivities for `k` terminal seeds,
//!   itself differentiable
//! - [`Integrator`] - stateful front object:
//!   `Uninitialized -> Configured -> Ready -> Integrating -> Completed | Failed`
//! - [`SensitivityAlgorithms`] - numeric integration and sensitivity passes,
//!   implemented for `CpuClient`
//!
//! # Sensitivities
//!
//! Forward sensitivities integrate the variational equation together with the
//! primal state; their cost grows with the number of directions. Adjoint
//! sensitivities integrate backward from `tf` and give the sensitivities to
//! all inputs for one seed. The backward pass reconstructs the primal
//! trajectory from checkpoints recorded every `checkpoint_stride` accepted
//! steps, replaying one segment at a time.
//!
//! Derivatives of graphs that call an integrator are routed to these
//! sensitivity systems by the call node's derivative rules, so Jacobians and
//! Hessians of integrators come from the generic differentiation driver.
//!
//! # Available Methods
//!
//! - **RK45**: Dormand-Prince 4(5) - General purpose (default)
//! - **RK23**: Bogacki-Shampine 2(3) - Low accuracy, fast
//!
//! # Example
//!
//! ```ignore
//! use diffsim::integrate::{Integrator, IntegratorOptions};
//! use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
//!
//! let mut integrator = Integrator::<CpuRuntime>::new("decay");
//! integrator.configure(&rhs, IntegratorOptions::default().with_horizon(0.0, 2.0))?;
//! integrator.initialize()?;
//! let xf = integrator.solve(&client, &x0, &p)?;
//! let sens = integrator.adjoint_sensitivity(&client, &seed)?;
//! ```

mod adjoint;
mod cpu;
pub mod impl_generic;
mod integrator;
mod system;
pub mod traits;
pub mod types;

pub use adjoint::AdjointSystem;
pub use impl_generic::{
    Checkpoint, CheckpointStore, ErrorNorm, StepDecision, StepOutcome, StepSizeController,
    StepperState, TrajectoryResult, adjoint_sensitivity_impl, forward_sensitivity_impl,
    integrate_impl,
};
pub use integrator::{Integrator, IntegratorInput, IntegratorState};
pub use system::OdeSystem;
pub use traits::SensitivityAlgorithms;
pub use types::{
    AdMode, AdjointSensitivityResult, ForwardSensitivityResult, IntegrationStatistics,
    IntegratorOptions, ODEMethod, OptionValue,
};
