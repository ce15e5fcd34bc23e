//! ODE definitions that can be called from expression graphs.

use std::fmt;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use super::adjoint::{AdjointSystem, build_adjoint_rhs};
use super::types::IntegratorOptions;
use crate::error::{DiffError, DiffResult};
use crate::eval::algebra::Algebra;
use crate::expr::{Expr, Graph, Shape};
use crate::function::{Callee, Function, next_callee_id};

/// An initial value problem `x' = f(t, x, p)` on a fixed horizon.
///
/// Called with `(x0, p)` it yields the terminal state `x(tf)`. The system is
/// immutable once built; its sensitivity systems are derived on demand and
/// cached by direction count.
pub struct OdeSystem {
    id: u64,
    name: String,
    rhs: Function,
    options: IntegratorOptions,
    n: usize,
    m: usize,
    forward_systems: Mutex<FxHashMap<usize, Arc<OdeSystem>>>,
    adjoint_rhs: Mutex<FxHashMap<usize, (u64, Function)>>,
}

impl OdeSystem {
    /// Wrap `rhs`, a Function of `(t: 1x1, x: n×1, p: m×1)` returning `x': n×1`.
    pub fn new(name: &str, rhs: &Function, options: IntegratorOptions) -> DiffResult<Arc<Self>> {
        options.validate()?;
        let (n, m) = Self::check_rhs(name, rhs)?;
        log::debug!(
            "ode system '{}': {} states, {} parameters, horizon [{}, {}]",
            name,
            n,
            m,
            options.t0,
            options.tf
        );
        Ok(Arc::new(Self {
            id: next_callee_id(),
            name: name.to_string(),
            rhs: rhs.clone(),
            options,
            n,
            m,
            forward_systems: Mutex::new(FxHashMap::default()),
            adjoint_rhs: Mutex::new(FxHashMap::default()),
        }))
    }

    fn check_rhs(name: &str, rhs: &Function) -> DiffResult<(usize, usize)> {
        let dimension_error = |context: String| DiffError::DimensionError {
            context: format!("{}: {}", name, context),
        };
        if rhs.n_inputs() != 3 || rhs.n_outputs() != 1 {
            return Err(dimension_error(format!(
                "right-hand side must map (t, x, p) to x', got {} inputs and {} outputs",
                rhs.n_inputs(),
                rhs.n_outputs()
            )));
        }
        let shapes = rhs.input_shapes();
        if !shapes[0].is_scalar() {
            return Err(dimension_error(format!("time input has shape {}", shapes[0])));
        }
        if shapes[1].cols != 1 || shapes[2].cols != 1 {
            return Err(dimension_error(format!(
                "state and parameters must be columns, got {} and {}",
                shapes[1], shapes[2]
            )));
        }
        let (n, m) = (shapes[1].rows, shapes[2].rows);
        if n == 0 {
            return Err(dimension_error("state dimension is zero".to_string()));
        }
        let out = rhs.output_shapes()[0];
        if out != Shape::column(n) {
            return Err(dimension_error(format!(
                "derivative has shape {}, state has shape {}",
                out,
                Shape::column(n)
            )));
        }
        Ok((n, m))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The right-hand side Function.
    pub fn rhs(&self) -> &Function {
        &self.rhs
    }

    pub fn options(&self) -> &IntegratorOptions {
        &self.options
    }

    /// Number of states `n`.
    pub fn state_dim(&self) -> usize {
        self.n
    }

    /// Number of parameters `m`.
    pub fn parameter_dim(&self) -> usize {
        self.m
    }

    pub fn input_shapes(&self) -> Vec<Shape> {
        vec![Shape::column(self.n), Shape::column(self.m)]
    }

    pub fn output_shapes(&self) -> Vec<Shape> {
        vec![Shape::column(self.n)]
    }

    /// Insert a call node computing `x(tf)` from `(x0, p)` in `target`.
    pub fn call(self: &Arc<Self>, target: &Graph, x0: Expr, p: Expr) -> DiffResult<Expr> {
        let outs = target.call(Callee::Integrator(Arc::clone(self)), &[x0, p])?;
        outs.into_iter().next().ok_or_else(|| DiffError::InvalidArgument {
            context: format!("{} produced no output", self.name),
        })
    }

    /// The system integrating `x` together with `nf` tangent directions.
    ///
    /// Its state is `[x; δx_1; ..; δx_nf]` and its parameters are
    /// `[p; δp_1; ..; δp_nf]`, with `δx_k' = ∂f/∂x δx_k + ∂f/∂p δp_k`.
    pub fn forward_system(self: &Arc<Self>, nf: usize) -> DiffResult<Arc<OdeSystem>> {
        if let Some(system) = self.lock_forward().get(&nf) {
            return Ok(Arc::clone(system));
        }
        let system = self.build_forward_system(nf)?;
        Ok(Arc::clone(self.lock_forward().entry(nf).or_insert(system)))
    }

    fn build_forward_system(&self, nf: usize) -> DiffResult<Arc<OdeSystem>> {
        let (n, m) = (self.n, self.m);
        let g = Graph::new();
        let t = g.scalar_symbol("t");
        let xa = g.column_symbol("xa", n * (1 + nf));
        let pa = g.column_symbol("pa", m * (1 + nf));
        let x = g.slice(xa, 0, 0, Shape::column(n))?;
        let p = g.slice(pa, 0, 0, Shape::column(m))?;

        let mut tangents = Vec::with_capacity(nf);
        for k in 1..=nf {
            let dx = g.slice(xa, k * n, 0, Shape::column(n))?;
            let dp = if m > 0 {
                Some(g.slice(pa, k * m, 0, Shape::column(m))?)
            } else {
                None
            };
            tangents.push(vec![None, Some(dx), dp]);
        }
        let (outs, dots) = self.rhs.call_forward(&g, &[t, x, p], &tangents)?;

        let mut parts = Vec::with_capacity(1 + nf);
        parts.push(outs[0]);
        for dot in dots {
            let dot = dot.into_iter().next().flatten();
            parts.push(dot.unwrap_or_else(|| g.zeros(Shape::column(n))));
        }
        let out = g.vertcat(&parts)?;

        let name = format!("{}_fwd{}", self.name, nf);
        let rhs = Function::new(&name, &g, &[t, xa, pa], &[out])?;
        log::debug!("{}: built forward sensitivity system '{}'", self.name, name);
        OdeSystem::new(&name, &rhs, self.options.clone())
    }

    /// The adjoint system for `k` terminal seeds.
    pub fn adjoint_system(self: &Arc<Self>, k: usize) -> DiffResult<Arc<AdjointSystem>> {
        let cached = self.lock_adjoint().get(&k).cloned();
        let (id, rhs) = match cached {
            Some(entry) => entry,
            None => {
                let rhs = build_adjoint_rhs(self, k)?;
                self.lock_adjoint()
                    .entry(k)
                    .or_insert((next_callee_id(), rhs))
                    .clone()
            }
        };
        Ok(Arc::new(AdjointSystem::from_parts(
            id,
            Arc::clone(self),
            k,
            rhs,
        )))
    }

    fn lock_forward(&self) -> std::sync::MutexGuard<'_, FxHashMap<usize, Arc<OdeSystem>>> {
        self.forward_systems.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_adjoint(&self) -> std::sync::MutexGuard<'_, FxHashMap<usize, (u64, Function)>> {
        self.adjoint_rhs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tangents of `x(tf)` for argument tangents `dots[d] = [δx0, δp]`.
    ///
    /// All directions are integrated together in one augmented system.
    pub(crate) fn forward_rule<A: Algebra>(
        self: &Arc<Self>,
        alg: &A,
        args: &[A::Value],
        dots: &[Vec<Option<A::Value>>],
    ) -> DiffResult<Vec<Vec<Option<A::Value>>>> {
        let (n, m) = (self.n, self.m);
        let augmented = self.forward_system(dots.len())?;
        let mut xs = vec![args[0].clone()];
        let mut ps = vec![args[1].clone()];
        for dot in dots {
            xs.push(match &dot[0] {
                Some(v) => v.clone(),
                None => alg.zeros(Shape::column(n))?,
            });
            ps.push(match &dot[1] {
                Some(v) => v.clone(),
                None => alg.zeros(Shape::column(m))?,
            });
        }
        let xa = alg.vertcat(&xs)?;
        let pa = alg.vertcat(&ps)?;
        let out = alg.integrate(&augmented, &xa, &pa)?;
        (1..=dots.len())
            .map(|k| Ok(vec![Some(alg.slice(&out, k * n, 0, Shape::column(n))?)]))
            .collect()
    }

    /// Argument adjoints `[λ(t0), μ]` for terminal seeds `seeds[d] = [λ]`.
    ///
    /// All directions share one checkpointed forward pass.
    pub(crate) fn adjoint_rule<A: Algebra>(
        self: &Arc<Self>,
        alg: &A,
        args: &[A::Value],
        seeds: &[Vec<Option<A::Value>>],
    ) -> DiffResult<Vec<Vec<Option<A::Value>>>> {
        let adjoint = self.adjoint_system(seeds.len())?;
        let mut call_args = vec![args[0].clone(), args[1].clone()];
        for seed in seeds {
            call_args.push(match &seed[0] {
                Some(v) => v.clone(),
                None => alg.zeros(Shape::column(self.n))?,
            });
        }
        let outs = alg.integrate_adjoint(&adjoint, &call_args)?;
        Ok((0..seeds.len())
            .map(|j| {
                let mu = (self.m > 0).then(|| outs[2 * j + 1].clone());
                vec![Some(outs[2 * j].clone()), mu]
            })
            .collect())
    }
}

impl fmt::Debug for OdeSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OdeSystem")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("states", &self.n)
            .field("parameters", &self.m)
            .field("horizon", &(self.options.t0, self.options.tf))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};
    use numr::tensor::Tensor;

    fn setup() -> (CpuDevice, CpuClient) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (device, client)
    }

    fn decay() -> Arc<OdeSystem> {
        // x' = -p x
        let g = Graph::new();
        let t = g.scalar_symbol("t");
        let x = g.column_symbol("x", 1);
        let p = g.column_symbol("p", 1);
        let px = g.mul(p, x).unwrap();
        let dx = g.neg(px).unwrap();
        let rhs = Function::new("decay", &g, &[t, x, p], &[dx]).unwrap();
        OdeSystem::new("decay", &rhs, IntegratorOptions::default()).unwrap()
    }

    #[test]
    fn test_rhs_arity_checked() {
        let g = Graph::new();
        let t = g.scalar_symbol("t");
        let x = g.column_symbol("x", 2);
        let p = g.column_symbol("p", 1);
        let bad = g.slice(x, 0, 0, Shape::column(1)).unwrap();
        let rhs = Function::new("bad", &g, &[t, x, p], &[bad]).unwrap();
        let err = OdeSystem::new("bad", &rhs, IntegratorOptions::default()).unwrap_err();
        assert!(matches!(err, DiffError::DimensionError { .. }));

        let two_inputs = Function::new("f", &g, &[t, x], &[x]).unwrap();
        let err = OdeSystem::new("f", &two_inputs, IntegratorOptions::default()).unwrap_err();
        assert!(matches!(err, DiffError::DimensionError { .. }));
    }

    #[test]
    fn test_sensitivity_systems_are_cached() {
        let system = decay();
        let f1 = system.forward_system(1).unwrap();
        let f1_again = system.forward_system(1).unwrap();
        assert!(Arc::ptr_eq(&f1, &f1_again));
        assert_eq!(f1.state_dim(), 2);
        assert_eq!(f1.parameter_dim(), 2);

        let a2 = system.adjoint_system(2).unwrap();
        let a2_again = system.adjoint_system(2).unwrap();
        assert_eq!(a2.id(), a2_again.id());
        assert_eq!(a2.output_shapes().len(), 4);
    }

    #[test]
    fn test_call_node_evaluates_terminal_state() {
        let (device, client) = setup();
        let system = decay();
        let g = Graph::new();
        let x0 = g.column_symbol("x0", 1);
        let p = g.column_symbol("p", 1);
        let xf = system.call(&g, x0, p).unwrap();
        let f = Function::new("flow", &g, &[x0, p], &[xf]).unwrap();

        let out = f
            .eval(
                &client,
                &[
                    Tensor::<CpuRuntime>::from_slice(&[2.0], &[1, 1], &device),
                    Tensor::<CpuRuntime>::from_slice(&[0.5], &[1, 1], &device),
                ],
            )
            .unwrap();
        let xf: Vec<f64> = out[0].to_vec();
        assert!((xf[0] - 2.0 * (-0.5f64).exp()).abs() < 1e-7);
    }

    #[test]
    fn test_call_shape_checked() {
        let system = decay();
        let g = Graph::new();
        let x0 = g.column_symbol("x0", 2);
        let p = g.column_symbol("p", 1);
        let err = system.call(&g, x0, p).unwrap_err();
        assert!(matches!(err, DiffError::ShapeMismatch { .. }));
    }
}
