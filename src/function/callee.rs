//! Things a call node can invoke.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Function;
use crate::error::DiffResult;
use crate::eval::algebra::Algebra;
use crate::eval::impl_generic::sweep;
use crate::expr::Shape;
use crate::integrate::{AdjointSystem, OdeSystem};

static NEXT_CALLEE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id shared by Functions and integrator systems.
pub(crate) fn next_callee_id() -> u64 {
    NEXT_CALLEE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Target of a `Call` node.
///
/// Each variant knows how to evaluate itself and how to propagate tangents
/// and adjoints through itself, over any [`Algebra`]. Integrator variants do
/// not expand into graph nodes; their derivative rules route to the
/// integrator's own sensitivity systems.
#[derive(Clone)]
pub enum Callee {
    Function(Function),
    Integrator(Arc<OdeSystem>),
    Adjoint(Arc<AdjointSystem>),
}

impl Callee {
    pub fn id(&self) -> u64 {
        match self {
            Callee::Function(f) => f.id(),
            Callee::Integrator(s) => s.id(),
            Callee::Adjoint(s) => s.id(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Callee::Function(f) => f.name(),
            Callee::Integrator(s) => s.name(),
            Callee::Adjoint(s) => s.name(),
        }
    }

    pub fn input_shapes(&self) -> Vec<Shape> {
        match self {
            Callee::Function(f) => f.input_shapes().to_vec(),
            Callee::Integrator(s) => s.input_shapes(),
            Callee::Adjoint(s) => s.input_shapes(),
        }
    }

    pub fn output_shapes(&self) -> Vec<Shape> {
        match self {
            Callee::Function(f) => f.output_shapes().to_vec(),
            Callee::Integrator(s) => s.output_shapes(),
            Callee::Adjoint(s) => s.output_shapes(),
        }
    }

    pub(crate) fn evaluate<A: Algebra>(
        &self,
        alg: &A,
        args: &[A::Value],
    ) -> DiffResult<Vec<A::Value>> {
        match self {
            Callee::Function(f) => alg.call_function(f, args),
            Callee::Integrator(s) => Ok(vec![alg.integrate(s, &args[0], &args[1])?]),
            Callee::Adjoint(s) => alg.integrate_adjoint(s, args),
        }
    }

    /// Output tangents `[dir][output]` for argument tangents `[dir][arg]`.
    ///
    /// Directions whose argument tangents are all zero are not propagated.
    pub(crate) fn forward<A: Algebra>(
        &self,
        alg: &A,
        args: &[A::Value],
        outs: &[A::Value],
        arg_dots: &[Vec<Option<A::Value>>],
    ) -> DiffResult<Vec<Vec<Option<A::Value>>>> {
        let live: Vec<usize> = (0..arg_dots.len())
            .filter(|&d| arg_dots[d].iter().any(Option::is_some))
            .collect();
        let mut result: Vec<Vec<Option<A::Value>>> =
            (0..arg_dots.len()).map(|_| vec![None; outs.len()]).collect();
        if live.is_empty() {
            return Ok(result);
        }
        let dots: Vec<Vec<Option<A::Value>>> = live.iter().map(|&d| arg_dots[d].clone()).collect();

        let propagated = match self {
            Callee::Function(f) => sweep::forward(alg, f.program(), args, &dots)?.1,
            Callee::Integrator(s) => s.forward_rule(alg, args, &dots)?,
            Callee::Adjoint(s) => s.forward_rule(alg, args, &dots)?,
        };
        for (d, tangents) in live.into_iter().zip(propagated) {
            result[d] = tangents;
        }
        Ok(result)
    }

    /// Argument adjoints `[dir][arg]` for output seeds `[dir][output]`.
    ///
    /// Directions whose seeds are all zero are not propagated.
    pub(crate) fn reverse<A: Algebra>(
        &self,
        alg: &A,
        args: &[A::Value],
        _outs: &[A::Value],
        out_seeds: &[Vec<Option<A::Value>>],
    ) -> DiffResult<Vec<Vec<Option<A::Value>>>> {
        let live: Vec<usize> = (0..out_seeds.len())
            .filter(|&d| out_seeds[d].iter().any(Option::is_some))
            .collect();
        let mut result: Vec<Vec<Option<A::Value>>> =
            (0..out_seeds.len()).map(|_| vec![None; args.len()]).collect();
        if live.is_empty() {
            return Ok(result);
        }
        let seeds: Vec<Vec<Option<A::Value>>> = live.iter().map(|&d| out_seeds[d].clone()).collect();

        let propagated = match self {
            Callee::Function(f) => sweep::reverse(alg, f.program(), args, &seeds)?.1,
            Callee::Integrator(s) => s.adjoint_rule(alg, args, &seeds)?,
            Callee::Adjoint(s) => s.adjoint_rule(alg, args, &seeds)?,
        };
        for (d, bars) in live.into_iter().zip(propagated) {
            result[d] = bars;
        }
        Ok(result)
    }
}

impl fmt::Debug for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Callee::Function(_) => "Function",
            Callee::Integrator(_) => "Integrator",
            Callee::Adjoint(_) => "Adjoint",
        };
        f.debug_struct("Callee")
            .field("kind", &kind)
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}
