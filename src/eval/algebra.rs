//! The value domain of a sweep.
//!
//! Derivative rules are written once against [`Algebra`]. Running them with
//! [`NumericAlgebra`](super::impl_generic::NumericAlgebra) computes numbers;
//! running them with [`SymbolicAlgebra`] appends derivative nodes to a graph.

use std::sync::Arc;

use crate::error::DiffResult;
use crate::expr::{BinaryOp, CompareOp, Expr, Graph, Shape, UnaryOp};
use crate::function::Function;
use crate::integrate::{AdjointSystem, OdeSystem};

/// Operations every node kind needs, over some value type.
pub(crate) trait Algebra {
    type Value: Clone;

    fn shape_of(&self, v: &Self::Value) -> DiffResult<Shape>;

    fn constant(&self, shape: Shape, values: &[f64]) -> DiffResult<Self::Value>;

    fn full(&self, shape: Shape, value: f64) -> DiffResult<Self::Value>;

    fn unary(&self, op: UnaryOp, x: &Self::Value) -> DiffResult<Self::Value>;

    /// Elementwise arithmetic; a `1x1` operand pairs with any shape.
    fn binary(&self, op: BinaryOp, a: &Self::Value, b: &Self::Value) -> DiffResult<Self::Value>;

    fn powi(&self, x: &Self::Value, n: i32) -> DiffResult<Self::Value>;

    fn compare(&self, op: CompareOp, a: &Self::Value, b: &Self::Value)
    -> DiffResult<Self::Value>;

    fn if_else(
        &self,
        cond: &Self::Value,
        if_true: &Self::Value,
        if_false: &Self::Value,
    ) -> DiffResult<Self::Value>;

    fn matmul(&self, a: &Self::Value, b: &Self::Value) -> DiffResult<Self::Value>;

    fn transpose(&self, x: &Self::Value) -> DiffResult<Self::Value>;

    fn reshape(&self, x: &Self::Value, shape: Shape) -> DiffResult<Self::Value>;

    fn vertcat(&self, parts: &[Self::Value]) -> DiffResult<Self::Value>;

    fn horzcat(&self, parts: &[Self::Value]) -> DiffResult<Self::Value>;

    fn slice(&self, x: &Self::Value, row: usize, col: usize, shape: Shape)
    -> DiffResult<Self::Value>;

    fn embed(&self, x: &Self::Value, row: usize, col: usize, shape: Shape)
    -> DiffResult<Self::Value>;

    fn sum_all(&self, x: &Self::Value) -> DiffResult<Self::Value>;

    /// Expand a `1x1` value to `shape`.
    fn broadcast(&self, x: &Self::Value, shape: Shape) -> DiffResult<Self::Value>;

    fn assertion(
        &self,
        x: &Self::Value,
        cond: &Self::Value,
        message: &str,
    ) -> DiffResult<Self::Value>;

    /// Apply a Function to `args`.
    fn call_function(&self, f: &Function, args: &[Self::Value]) -> DiffResult<Vec<Self::Value>>;

    /// Terminal state of `system` started at `x0` with parameters `p`.
    fn integrate(
        &self,
        system: &Arc<OdeSystem>,
        x0: &Self::Value,
        p: &Self::Value,
    ) -> DiffResult<Self::Value>;

    /// Adjoint sensitivities `(λ_1(t0), μ_1, ..)` of `system` for arguments `(x0, p, λ_1, ..)`.
    fn integrate_adjoint(
        &self,
        system: &Arc<AdjointSystem>,
        args: &[Self::Value],
    ) -> DiffResult<Vec<Self::Value>>;

    // ------------------------------------------------------------------------
    // Provided helpers
    // ------------------------------------------------------------------------

    fn zeros(&self, shape: Shape) -> DiffResult<Self::Value> {
        self.full(shape, 0.0)
    }

    fn scalar(&self, value: f64) -> DiffResult<Self::Value> {
        self.full(Shape::scalar(), value)
    }

    fn add(&self, a: &Self::Value, b: &Self::Value) -> DiffResult<Self::Value> {
        self.binary(BinaryOp::Add, a, b)
    }

    fn sub(&self, a: &Self::Value, b: &Self::Value) -> DiffResult<Self::Value> {
        self.binary(BinaryOp::Sub, a, b)
    }

    fn mul(&self, a: &Self::Value, b: &Self::Value) -> DiffResult<Self::Value> {
        self.binary(BinaryOp::Mul, a, b)
    }

    fn div(&self, a: &Self::Value, b: &Self::Value) -> DiffResult<Self::Value> {
        self.binary(BinaryOp::Div, a, b)
    }

    fn neg(&self, x: &Self::Value) -> DiffResult<Self::Value> {
        self.unary(UnaryOp::Neg, x)
    }

    /// `c * x` for a host constant `c`.
    fn scale(&self, x: &Self::Value, c: f64) -> DiffResult<Self::Value> {
        let c = self.scalar(c)?;
        self.mul(&c, x)
    }

    /// Bring a derivative to `shape`, expanding a `1x1` value when needed.
    fn fit(&self, x: Self::Value, shape: Shape) -> DiffResult<Self::Value> {
        if self.shape_of(&x)? == shape {
            Ok(x)
        } else {
            self.broadcast(&x, shape)
        }
    }

    /// Reduce an adjoint contribution to a `1x1` operand shape when the
    /// operand took part in scalar pairing.
    fn reduce(&self, x: Self::Value, shape: Shape) -> DiffResult<Self::Value> {
        if shape.is_scalar() && !self.shape_of(&x)?.is_scalar() {
            self.sum_all(&x)
        } else {
            Ok(x)
        }
    }

    /// Sum two optional contributions.
    fn accumulate(
        &self,
        acc: Option<Self::Value>,
        x: Self::Value,
    ) -> DiffResult<Option<Self::Value>> {
        match acc {
            None => Ok(Some(x)),
            Some(a) => self.add(&a, &x).map(Some),
        }
    }
}

/// Builds expressions in a target graph.
pub(crate) struct SymbolicAlgebra<'g> {
    pub(crate) target: &'g Graph,
}

impl<'g> SymbolicAlgebra<'g> {
    pub(crate) fn new(target: &'g Graph) -> Self {
        Self { target }
    }
}

impl Algebra for SymbolicAlgebra<'_> {
    type Value = Expr;

    fn shape_of(&self, v: &Expr) -> DiffResult<Shape> {
        self.target.shape(*v)
    }

    fn constant(&self, shape: Shape, values: &[f64]) -> DiffResult<Expr> {
        self.target.constant(shape, values)
    }

    fn full(&self, shape: Shape, value: f64) -> DiffResult<Expr> {
        Ok(self.target.full(shape, value))
    }

    fn unary(&self, op: UnaryOp, x: &Expr) -> DiffResult<Expr> {
        self.target.unary(op, *x)
    }

    fn binary(&self, op: BinaryOp, a: &Expr, b: &Expr) -> DiffResult<Expr> {
        match op {
            BinaryOp::Add => self.target.add(*a, *b),
            BinaryOp::Sub => self.target.sub(*a, *b),
            BinaryOp::Mul => self.target.mul(*a, *b),
            BinaryOp::Div => self.target.div(*a, *b),
        }
    }

    fn powi(&self, x: &Expr, n: i32) -> DiffResult<Expr> {
        self.target.powi(*x, n)
    }

    fn compare(&self, op: CompareOp, a: &Expr, b: &Expr) -> DiffResult<Expr> {
        match op {
            CompareOp::Lt => self.target.lt(*a, *b),
            CompareOp::Le => self.target.le(*a, *b),
            CompareOp::Eq => self.target.eq(*a, *b),
        }
    }

    fn if_else(&self, cond: &Expr, if_true: &Expr, if_false: &Expr) -> DiffResult<Expr> {
        self.target.if_else(*cond, *if_true, *if_false)
    }

    fn matmul(&self, a: &Expr, b: &Expr) -> DiffResult<Expr> {
        self.target.matmul(*a, *b)
    }

    fn transpose(&self, x: &Expr) -> DiffResult<Expr> {
        self.target.transpose(*x)
    }

    fn reshape(&self, x: &Expr, shape: Shape) -> DiffResult<Expr> {
        self.target.reshape(*x, shape)
    }

    fn vertcat(&self, parts: &[Expr]) -> DiffResult<Expr> {
        self.target.vertcat(parts)
    }

    fn horzcat(&self, parts: &[Expr]) -> DiffResult<Expr> {
        self.target.horzcat(parts)
    }

    fn slice(&self, x: &Expr, row: usize, col: usize, shape: Shape) -> DiffResult<Expr> {
        self.target.slice(*x, row, col, shape)
    }

    fn embed(&self, x: &Expr, row: usize, col: usize, shape: Shape) -> DiffResult<Expr> {
        self.target.embed(*x, row, col, shape)
    }

    fn sum_all(&self, x: &Expr) -> DiffResult<Expr> {
        self.target.sum_all(*x)
    }

    fn broadcast(&self, x: &Expr, shape: Shape) -> DiffResult<Expr> {
        if shape.is_empty() {
            return Ok(self.target.zeros(shape));
        }
        let ones = self.target.ones(shape);
        self.target.mul(*x, ones)
    }

    fn assertion(&self, x: &Expr, cond: &Expr, message: &str) -> DiffResult<Expr> {
        self.target.assert_that(*x, *cond, message)
    }

    fn call_function(&self, f: &Function, args: &[Expr]) -> DiffResult<Vec<Expr>> {
        f.call_as_node(self.target, args)
    }

    fn integrate(&self, system: &Arc<OdeSystem>, x0: &Expr, p: &Expr) -> DiffResult<Expr> {
        system.call(self.target, *x0, *p)
    }

    fn integrate_adjoint(
        &self,
        system: &Arc<AdjointSystem>,
        args: &[Expr],
    ) -> DiffResult<Vec<Expr>> {
        system.call(self.target, args)
    }
}
