//! diffsim - Differentiable ODE simulation on numr
//!
//! diffsim builds symbolic expression graphs, compiles them into Functions,
//! and differentiates them in forward and adjoint mode. Functions may call
//! ODE integrators whose derivatives come from forward and checkpointed
//! adjoint sensitivity integration, so Jacobians and Hessians of simulations
//! are ordinary Functions that can be evaluated, composed and differentiated
//! again.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │   differentiate  (jacobian_of, gradient_of, hessians)   │
//! └──────────────────────────┬──────────────────────────────┘
//! ┌──────────────────────────▼──────────────────────────────┐
//! │   function (Function, Callee)    integrate (OdeSystem,  │
//! │                                  AdjointSystem,         │
//! │                                  Integrator)            │
//! └──────────────────────────┬──────────────────────────────┘
//! ┌──────────────────────────▼──────────────────────────────┐
//! │   eval (value/forward/adjoint rules)    expr (Graph)    │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ uses
//! ┌──────────────────────────▼──────────────────────────────┐
//! │                       numr                               │
//! │          (tensors, runtime clients, tensor ops)          │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`expr`] - Expression graphs: symbols, operations, hash-consing
//! - [`eval`] - Numeric evaluation and derivative sweeps
//! - [`function`] - Compiled Functions and call targets
//! - [`integrate`] - ODE integration with forward and adjoint sensitivities
//! - [`differentiate`] - Jacobians, gradients, Hessians and Hessian-vector products
//!
//! # Backend Support
//!
//! Numeric code is generic over numr's `Runtime` trait. The algorithm traits
//! are implemented for the CPU client. All values are `F64`.
//!
//! # Example
//!
//! ```ignore
//! use diffsim::{Function, Graph, IntegratorOptions, OdeSystem, JacobianMode, jacobian_of};
//! use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
//!
//! let device = CpuDevice::new();
//! let client = CpuClient::new(device.clone());
//!
//! // x' = -p x
//! let g = Graph::new();
//! let t = g.scalar_symbol("t");
//! let x = g.column_symbol("x", 1);
//! let p = g.column_symbol("p", 1);
//! let dx = g.neg(g.mul(p, x)?)?;
//! let rhs = Function::new("decay", &g, &[t, x, p], &[dx])?;
//! let system = OdeSystem::new("decay", &rhs, IntegratorOptions::default())?;
//!
//! // (x0, p) -> x(tf) and its Jacobian with respect to p
//! let h = Graph::new();
//! let x0 = h.column_symbol("x0", 1);
//! let p = h.column_symbol("p", 1);
//! let xf = system.call(&h, x0, p)?;
//! let flow = Function::new("flow", &h, &[x0, p], &[xf])?;
//! let dflow = jacobian_of(&flow, 1, 0, JacobianMode::Adjoint)?;
//! ```

pub mod client;
pub mod differentiate;
pub mod error;
pub mod eval;
pub mod expr;
pub mod function;
pub mod integrate;

// Re-export main types for convenience
pub use client::DiffClient;
pub use differentiate::{
    HvpMode, JacobianMode, gradient_of, hessian_of, hessian_vector_product, jacobian_of,
};
pub use error::{DiffError, DiffResult};
pub use eval::{EvaluationAlgorithms, SweepResult};
pub use expr::{Expr, Graph, Shape};
pub use function::{Callee, Function};
pub use integrate::{
    AdMode, AdjointSensitivityResult, AdjointSystem, ForwardSensitivityResult,
    IntegrationStatistics, Integrator, IntegratorInput, IntegratorOptions, IntegratorState,
    ODEMethod, OdeSystem, OptionValue, SensitivityAlgorithms,
};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;
