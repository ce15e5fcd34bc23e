//! Unified client trait for numeric evaluation and integration.
//!
//! Every numeric path in the crate (graph evaluation, derivative sweeps, the
//! Runge-Kutta steppers and the adjoint backward pass) needs the same set of
//! numr operations. `DiffClient` bundles them so signatures stay short.

use numr::ops::{CompareOps, MatmulOps, ScalarOps, ShapeOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};

/// Client trait for numeric evaluation of expression graphs.
pub trait DiffClient<R: Runtime>:
    TensorOps<R> + ScalarOps<R> + CompareOps<R> + MatmulOps<R> + ShapeOps<R> + RuntimeClient<R>
{
}

impl<R, T> DiffClient<R> for T
where
    R: Runtime,
    T: TensorOps<R> + ScalarOps<R> + CompareOps<R> + MatmulOps<R> + ShapeOps<R> + RuntimeClient<R>,
{
}
