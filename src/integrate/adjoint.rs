//! Adjoint sensitivity systems.
//!
//! An [`AdjointSystem`] for `k` seeds maps `(x0, p, λ_1, .., λ_k)` to
//! `(λ_1(t0), μ_1, .., λ_k(t0), μ_k)` where
//!
//! ```text
//! λ_j(t0) = (∂x(tf)/∂x0)ᵀ λ_j,    μ_j = (∂x(tf)/∂p)ᵀ λ_j
//! ```
//!
//! It is a callable like any other and has derivative rules of its own, both
//! expressed through forward sensitivity systems of the base ODE. Nesting
//! these rules gives forward-over-adjoint and adjoint-over-adjoint second
//! derivatives.

use std::fmt;
use std::sync::Arc;

use super::system::OdeSystem;
use crate::error::{DiffError, DiffResult};
use crate::eval::algebra::Algebra;
use crate::expr::{Expr, Graph, Shape};
use crate::function::{Callee, Function};

/// Right-hand side of the backward adjoint ODE for `k` seeds.
///
/// Inputs `(t, x, p, z)` with `z = [λ_1; μ_1; ..; λ_k; μ_k]`; the output is
/// `[(∂f/∂x)ᵀ λ_1; (∂f/∂p)ᵀ λ_1; ..]`, the derivative in reversed time.
pub(crate) fn build_adjoint_rhs(base: &OdeSystem, k: usize) -> DiffResult<Function> {
    let (n, m) = (base.state_dim(), base.parameter_dim());
    let g = Graph::new();
    let t = g.scalar_symbol("t");
    let x = g.column_symbol("x", n);
    let p = g.column_symbol("p", m);
    let z = g.column_symbol("z", k * (n + m));

    let seeds = (0..k)
        .map(|j| Ok(vec![Some(g.slice(z, j * (n + m), 0, Shape::column(n))?)]))
        .collect::<DiffResult<Vec<_>>>()?;
    let (_, bars) = base.rhs().call_reverse(&g, &[t, x, p], &seeds)?;

    let mut parts = Vec::with_capacity(2 * k);
    for bar in bars {
        let mut bar = bar.into_iter().skip(1);
        let xbar = bar.next().flatten();
        let pbar = bar.next().flatten();
        parts.push(xbar.unwrap_or_else(|| g.zeros(Shape::column(n))));
        parts.push(pbar.unwrap_or_else(|| g.zeros(Shape::column(m))));
    }
    let out = g.vertcat(&parts)?;

    let name = format!("{}_adj{}", base.name(), k);
    log::debug!("{}: built adjoint right-hand side '{}'", base.name(), name);
    Function::new(&name, &g, &[t, x, p, z], &[out])
}

/// Adjoint sensitivities of an [`OdeSystem`] for a fixed number of seeds.
pub struct AdjointSystem {
    id: u64,
    name: String,
    base: Arc<OdeSystem>,
    directions: usize,
    rhs: Function,
}

impl AdjointSystem {
    pub(crate) fn from_parts(id: u64, base: Arc<OdeSystem>, directions: usize, rhs: Function) -> Self {
        Self {
            id,
            name: format!("{}_adjoint{}", base.name(), directions),
            base,
            directions,
            rhs,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ODE whose sensitivities this system computes.
    pub fn base(&self) -> &Arc<OdeSystem> {
        &self.base
    }

    /// Number of seeds `k`.
    pub fn directions(&self) -> usize {
        self.directions
    }

    /// Right-hand side of the backward ODE.
    pub fn rhs(&self) -> &Function {
        &self.rhs
    }

    pub fn input_shapes(&self) -> Vec<Shape> {
        let (n, m) = (self.base.state_dim(), self.base.parameter_dim());
        let mut shapes = vec![Shape::column(n), Shape::column(m)];
        shapes.extend(std::iter::repeat_n(Shape::column(n), self.directions));
        shapes
    }

    pub fn output_shapes(&self) -> Vec<Shape> {
        let (n, m) = (self.base.state_dim(), self.base.parameter_dim());
        (0..self.directions)
            .flat_map(|_| [Shape::column(n), Shape::column(m)])
            .collect()
    }

    /// Insert a call node with arguments `(x0, p, λ_1, .., λ_k)` in `target`.
    pub fn call(self: &Arc<Self>, target: &Graph, args: &[Expr]) -> DiffResult<Vec<Expr>> {
        target.call(Callee::Adjoint(Arc::clone(self)), args)
    }

    /// Output tangents for argument tangents `dots[d] = [δx0, δp, δλ_1, ..]`.
    ///
    /// With `δx0 = δp = 0` the outputs are linear in the seeds and the tangent
    /// is another adjoint pass. Otherwise the adjoint of the forward
    /// sensitivity system, seeded with `[δλ_j; λ_j]`, carries the second-order
    /// terms in its leading blocks.
    pub(crate) fn forward_rule<A: Algebra>(
        &self,
        alg: &A,
        args: &[A::Value],
        dots: &[Vec<Option<A::Value>>],
    ) -> DiffResult<Vec<Vec<Option<A::Value>>>> {
        let (n, m) = (self.base.state_dim(), self.base.parameter_dim());
        let k = self.directions;
        self.check_arity(args.len())?;

        let mut result = Vec::with_capacity(dots.len());
        for dot in dots {
            let mut tangents: Vec<Option<A::Value>> = vec![None; 2 * k];
            let seed_dots = &dot[2..];

            if dot[0].is_none() && dot[1].is_none() {
                let active: Vec<usize> = (0..k).filter(|&j| seed_dots[j].is_some()).collect();
                if active.is_empty() {
                    result.push(tangents);
                    continue;
                }
                let adjoint = self.base.adjoint_system(active.len())?;
                let mut call_args = vec![args[0].clone(), args[1].clone()];
                call_args.extend(active.iter().filter_map(|&j| seed_dots[j].clone()));
                let outs = alg.integrate_adjoint(&adjoint, &call_args)?;
                for (i, &j) in active.iter().enumerate() {
                    tangents[2 * j] = Some(outs[2 * i].clone());
                    if m > 0 {
                        tangents[2 * j + 1] = Some(outs[2 * i + 1].clone());
                    }
                }
                result.push(tangents);
                continue;
            }

            let augmented = self.base.forward_system(1)?;
            let adjoint = augmented.adjoint_system(k)?;
            let dx0 = or_zeros(alg, &dot[0], Shape::column(n))?;
            let dp = or_zeros(alg, &dot[1], Shape::column(m))?;
            let mut call_args = vec![
                alg.vertcat(&[args[0].clone(), dx0])?,
                alg.vertcat(&[args[1].clone(), dp])?,
            ];
            for j in 0..k {
                let dlambda = or_zeros(alg, &seed_dots[j], Shape::column(n))?;
                call_args.push(alg.vertcat(&[dlambda, args[2 + j].clone()])?);
            }
            let outs = alg.integrate_adjoint(&adjoint, &call_args)?;
            for j in 0..k {
                tangents[2 * j] = Some(alg.slice(&outs[2 * j], 0, 0, Shape::column(n))?);
                if m > 0 {
                    tangents[2 * j + 1] =
                        Some(alg.slice(&outs[2 * j + 1], 0, 0, Shape::column(m))?);
                }
            }
            result.push(tangents);
        }
        Ok(result)
    }

    /// Argument adjoints for output seeds `seeds[d] = [w_x^1, w_p^1, .., w_x^k, w_p^k]`.
    ///
    /// The seeded outputs equal `Σ_j λ_jᵀ δx_j(tf)` with `δx_j` the forward
    /// sensitivity along `(w_x^j, w_p^j)`. Hence the seed adjoints are forward
    /// sensitivities and the `(x0, p)` adjoints come from one adjoint pass
    /// through the forward sensitivity system.
    pub(crate) fn adjoint_rule<A: Algebra>(
        &self,
        alg: &A,
        args: &[A::Value],
        seeds: &[Vec<Option<A::Value>>],
    ) -> DiffResult<Vec<Vec<Option<A::Value>>>> {
        let (n, m) = (self.base.state_dim(), self.base.parameter_dim());
        let k = self.directions;
        self.check_arity(args.len())?;

        let mut result = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let mut bars: Vec<Option<A::Value>> = vec![None; 2 + k];
            let active: Vec<usize> = (0..k)
                .filter(|&j| seed[2 * j].is_some() || seed[2 * j + 1].is_some())
                .collect();
            if active.is_empty() {
                result.push(bars);
                continue;
            }

            let augmented = self.base.forward_system(active.len())?;
            let mut xs = vec![args[0].clone()];
            let mut ps = vec![args[1].clone()];
            let mut lambdas = vec![alg.zeros(Shape::column(n))?];
            for &j in &active {
                xs.push(or_zeros(alg, &seed[2 * j], Shape::column(n))?);
                ps.push(or_zeros(alg, &seed[2 * j + 1], Shape::column(m))?);
                lambdas.push(args[2 + j].clone());
            }
            let xa = alg.vertcat(&xs)?;
            let pa = alg.vertcat(&ps)?;

            let tangents = alg.integrate(&augmented, &xa, &pa)?;
            for (i, &j) in active.iter().enumerate() {
                bars[2 + j] = Some(alg.slice(&tangents, (1 + i) * n, 0, Shape::column(n))?);
            }

            let adjoint = augmented.adjoint_system(1)?;
            let lambda = alg.vertcat(&lambdas)?;
            let outs = alg.integrate_adjoint(&adjoint, &[xa, pa, lambda])?;
            bars[0] = Some(alg.slice(&outs[0], 0, 0, Shape::column(n))?);
            if m > 0 {
                bars[1] = Some(alg.slice(&outs[1], 0, 0, Shape::column(m))?);
            }
            result.push(bars);
        }
        Ok(result)
    }

    fn check_arity(&self, got: usize) -> DiffResult<()> {
        if got != 2 + self.directions {
            return Err(DiffError::DimensionError {
                context: format!(
                    "{}: expected {} arguments, got {}",
                    self.name,
                    2 + self.directions,
                    got
                ),
            });
        }
        Ok(())
    }
}

fn or_zeros<A: Algebra>(alg: &A, v: &Option<A::Value>, shape: Shape) -> DiffResult<A::Value> {
    match v {
        Some(v) => Ok(v.clone()),
        None => alg.zeros(shape),
    }
}

impl fmt::Debug for AdjointSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdjointSystem")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("base", &self.base.name())
            .field("directions", &self.directions)
            .finish()
    }
}
