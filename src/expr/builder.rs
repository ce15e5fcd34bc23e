//! Node construction with shape validation.
//!
//! Every constructor validates its operands before touching the arena, so a
//! `ShapeMismatch` never leaves partial nodes behind.

use std::sync::Arc;

use super::graph::{Expr, Graph};
use super::node::{BinaryOp, CompareOp, NodeId, OpKind, UnaryOp};
use super::shape::Shape;
use crate::error::{DiffError, DiffResult};
use crate::function::Callee;

impl Graph {
    // ========================================================================
    // Leaves
    // ========================================================================

    /// Create a named symbol of the given shape.
    pub fn symbol(&self, name: &str, shape: Shape) -> Expr {
        self.push(OpKind::Symbol(Arc::from(name)), Vec::new(), shape)
    }

    /// Create a `1x1` symbol.
    pub fn scalar_symbol(&self, name: &str) -> Expr {
        self.symbol(name, Shape::scalar())
    }

    /// Create an `n x 1` symbol.
    pub fn column_symbol(&self, name: &str, n: usize) -> Expr {
        self.symbol(name, Shape::column(n))
    }

    /// Dense constant with row-major `values`.
    pub fn constant(&self, shape: Shape, values: &[f64]) -> DiffResult<Expr> {
        if values.len() != shape.numel() {
            return Err(DiffError::shape_mismatch(
                "constant",
                format!("{} values for {}", shape.numel(), shape),
                values.len(),
            ));
        }
        Ok(self.push(OpKind::Constant(Arc::from(values)), Vec::new(), shape))
    }

    /// `1x1` constant.
    pub fn scalar(&self, value: f64) -> Expr {
        self.push(OpKind::Constant(Arc::from([value])), Vec::new(), Shape::scalar())
    }

    /// Column constant.
    pub fn column(&self, values: &[f64]) -> Expr {
        self.push(
            OpKind::Constant(Arc::from(values)),
            Vec::new(),
            Shape::column(values.len()),
        )
    }

    /// Constant filled with `value`.
    pub fn full(&self, shape: Shape, value: f64) -> Expr {
        let values = vec![value; shape.numel()];
        self.push(OpKind::Constant(Arc::from(values)), Vec::new(), shape)
    }

    pub fn zeros(&self, shape: Shape) -> Expr {
        self.full(shape, 0.0)
    }

    pub fn ones(&self, shape: Shape) -> Expr {
        self.full(shape, 1.0)
    }

    /// Constant with a single 1 at row-major position `index`.
    pub fn unit(&self, shape: Shape, index: usize) -> DiffResult<Expr> {
        if index >= shape.numel() {
            return Err(DiffError::InvalidArgument {
                context: format!("unit index {} out of range for {}", index, shape),
            });
        }
        let mut values = vec![0.0; shape.numel()];
        values[index] = 1.0;
        self.constant(shape, &values)
    }

    // ========================================================================
    // Elementwise arithmetic
    // ========================================================================

    fn binary(&self, op: BinaryOp, a: Expr, b: Expr) -> DiffResult<Expr> {
        let kind = OpKind::Binary(op);
        let (ia, sa) = self.resolve(a, kind.name())?;
        let (ib, sb) = self.resolve(b, kind.name())?;
        let shape = sa
            .broadcast(&sb)
            .ok_or_else(|| DiffError::shape_mismatch(kind.name(), sa, sb))?;
        Ok(self.push(kind, vec![ia, ib], shape))
    }

    pub fn add(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        self.binary(BinaryOp::Sub, a, b)
    }

    /// Elementwise product.
    pub fn mul(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        self.binary(BinaryOp::Mul, a, b)
    }

    /// Elementwise quotient.
    pub fn div(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        self.binary(BinaryOp::Div, a, b)
    }

    // ========================================================================
    // Elementary functions
    // ========================================================================

    pub(crate) fn unary(&self, op: UnaryOp, x: Expr) -> DiffResult<Expr> {
        let kind = OpKind::Unary(op);
        let (ix, sx) = self.resolve(x, kind.name())?;
        Ok(self.push(kind, vec![ix], sx))
    }

    pub fn neg(&self, x: Expr) -> DiffResult<Expr> {
        self.unary(UnaryOp::Neg, x)
    }

    pub fn exp(&self, x: Expr) -> DiffResult<Expr> {
        self.unary(UnaryOp::Exp, x)
    }

    pub fn log(&self, x: Expr) -> DiffResult<Expr> {
        self.unary(UnaryOp::Log, x)
    }

    pub fn sin(&self, x: Expr) -> DiffResult<Expr> {
        self.unary(UnaryOp::Sin, x)
    }

    pub fn cos(&self, x: Expr) -> DiffResult<Expr> {
        self.unary(UnaryOp::Cos, x)
    }

    pub fn tan(&self, x: Expr) -> DiffResult<Expr> {
        self.unary(UnaryOp::Tan, x)
    }

    pub fn sqrt(&self, x: Expr) -> DiffResult<Expr> {
        self.unary(UnaryOp::Sqrt, x)
    }

    /// Absolute value; its derivative at 0 is taken as +1.
    pub fn abs(&self, x: Expr) -> DiffResult<Expr> {
        self.unary(UnaryOp::Abs, x)
    }

    pub fn sign(&self, x: Expr) -> DiffResult<Expr> {
        self.unary(UnaryOp::Sign, x)
    }

    /// Integer power.
    pub fn powi(&self, x: Expr, n: i32) -> DiffResult<Expr> {
        let (ix, sx) = self.resolve(x, "powi")?;
        Ok(self.push(OpKind::Powi(n), vec![ix], sx))
    }

    // ========================================================================
    // Comparisons and conditionals
    // ========================================================================

    fn compare(&self, op: CompareOp, a: Expr, b: Expr) -> DiffResult<Expr> {
        let kind = OpKind::Compare(op);
        let (ia, sa) = self.resolve(a, kind.name())?;
        let (ib, sb) = self.resolve(b, kind.name())?;
        let shape = sa
            .broadcast(&sb)
            .ok_or_else(|| DiffError::shape_mismatch(kind.name(), sa, sb))?;
        Ok(self.push(kind, vec![ia, ib], shape))
    }

    /// `a < b` as 0/1 values.
    pub fn lt(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        self.compare(CompareOp::Lt, a, b)
    }

    pub fn le(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        self.compare(CompareOp::Le, a, b)
    }

    pub fn gt(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        self.compare(CompareOp::Lt, b, a)
    }

    pub fn ge(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        self.compare(CompareOp::Le, b, a)
    }

    pub fn eq(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        self.compare(CompareOp::Eq, a, b)
    }

    /// Entrywise selection: `if_true` where `cond` is nonzero, else `if_false`.
    ///
    /// Derivatives follow the selected branch only.
    pub fn if_else(&self, cond: Expr, if_true: Expr, if_false: Expr) -> DiffResult<Expr> {
        let (ic, sc) = self.resolve(cond, "if_else")?;
        let (it, st) = self.resolve(if_true, "if_else")?;
        let (iff, sf) = self.resolve(if_false, "if_else")?;
        let branches = st
            .broadcast(&sf)
            .ok_or_else(|| DiffError::shape_mismatch("if_else", st, sf))?;
        let shape = branches
            .broadcast(&sc)
            .ok_or_else(|| DiffError::shape_mismatch("if_else condition", branches, sc))?;
        Ok(self.push(OpKind::IfElse, vec![ic, it, iff], shape))
    }

    // ========================================================================
    // Matrix operations
    // ========================================================================

    /// Matrix product.
    pub fn matmul(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        let (ia, sa) = self.resolve(a, "matmul")?;
        let (ib, sb) = self.resolve(b, "matmul")?;
        if sa.cols != sb.rows {
            return Err(DiffError::shape_mismatch(
                "matmul",
                format!("{} rows on the right operand", sa.cols),
                sb,
            ));
        }
        Ok(self.push(OpKind::MatMul, vec![ia, ib], Shape::new(sa.rows, sb.cols)))
    }

    pub fn transpose(&self, x: Expr) -> DiffResult<Expr> {
        let (ix, sx) = self.resolve(x, "transpose")?;
        if sx.rows == 1 && sx.cols == 1 {
            return Ok(x);
        }
        Ok(self.push(OpKind::Transpose, vec![ix], sx.transposed()))
    }

    /// Row-major reshape; the number of entries must not change.
    pub fn reshape(&self, x: Expr, shape: Shape) -> DiffResult<Expr> {
        let (ix, sx) = self.resolve(x, "reshape")?;
        if sx.numel() != shape.numel() {
            return Err(DiffError::shape_mismatch("reshape", sx, shape));
        }
        if sx == shape {
            return Ok(x);
        }
        Ok(self.push(OpKind::Reshape, vec![ix], shape))
    }

    /// Stack parts vertically. Parts without rows are dropped.
    pub fn vertcat(&self, parts: &[Expr]) -> DiffResult<Expr> {
        let resolved = self.resolve_all(parts, "vertcat")?;
        let Some(&(_, first)) = resolved.first() else {
            return Err(DiffError::InvalidArgument {
                context: "vertcat of an empty list".to_string(),
            });
        };
        let cols = first.cols;
        if let Some(&(_, bad)) = resolved.iter().find(|(_, s)| s.cols != cols) {
            return Err(DiffError::shape_mismatch(
                "vertcat",
                format!("{} columns", cols),
                bad,
            ));
        }
        let rows = resolved.iter().map(|(_, s)| s.rows).sum();
        let kept: Vec<(NodeId, Shape)> = resolved.into_iter().filter(|(_, s)| s.rows > 0).collect();
        match kept.len() {
            0 => Ok(self.zeros(Shape::new(0, cols))),
            1 => Ok(self.expr(kept[0].0)),
            _ => Ok(self.push(
                OpKind::Vertcat,
                kept.iter().map(|(id, _)| *id).collect(),
                Shape::new(rows, cols),
            )),
        }
    }

    /// Stack parts horizontally. Parts without columns are dropped.
    pub fn horzcat(&self, parts: &[Expr]) -> DiffResult<Expr> {
        let resolved = self.resolve_all(parts, "horzcat")?;
        let Some(&(_, first)) = resolved.first() else {
            return Err(DiffError::InvalidArgument {
                context: "horzcat of an empty list".to_string(),
            });
        };
        let rows = first.rows;
        if let Some(&(_, bad)) = resolved.iter().find(|(_, s)| s.rows != rows) {
            return Err(DiffError::shape_mismatch(
                "horzcat",
                format!("{} rows", rows),
                bad,
            ));
        }
        let cols = resolved.iter().map(|(_, s)| s.cols).sum();
        let kept: Vec<(NodeId, Shape)> = resolved.into_iter().filter(|(_, s)| s.cols > 0).collect();
        match kept.len() {
            0 => Ok(self.zeros(Shape::new(rows, 0))),
            1 => Ok(self.expr(kept[0].0)),
            _ => Ok(self.push(
                OpKind::Horzcat,
                kept.iter().map(|(id, _)| *id).collect(),
                Shape::new(rows, cols),
            )),
        }
    }

    /// Block of `x` starting at `(row, col)` with the given shape.
    pub fn slice(&self, x: Expr, row: usize, col: usize, shape: Shape) -> DiffResult<Expr> {
        let (ix, sx) = self.resolve(x, "slice")?;
        if row + shape.rows > sx.rows || col + shape.cols > sx.cols {
            return Err(DiffError::shape_mismatch(
                "slice",
                format!("block {} at ({}, {}) inside {}", shape, row, col, sx),
                sx,
            ));
        }
        if shape == sx {
            return Ok(x);
        }
        if shape.is_empty() {
            return Ok(self.zeros(shape));
        }
        Ok(self.push(OpKind::Slice { row, col }, vec![ix], shape))
    }

    /// Row-major entry `index` of `x` as a `1x1` expression.
    pub fn element(&self, x: Expr, index: usize) -> DiffResult<Expr> {
        let sx = self.shape(x)?;
        if sx.cols == 0 || index >= sx.numel() {
            return Err(DiffError::InvalidArgument {
                context: format!("element {} out of range for {}", index, sx),
            });
        }
        self.slice(x, index / sx.cols, index % sx.cols, Shape::scalar())
    }

    /// Place `x` at `(row, col)` inside a zero matrix of the given shape.
    pub fn embed(&self, x: Expr, row: usize, col: usize, shape: Shape) -> DiffResult<Expr> {
        let (ix, sx) = self.resolve(x, "embed")?;
        if row + sx.rows > shape.rows || col + sx.cols > shape.cols {
            return Err(DiffError::shape_mismatch(
                "embed",
                format!("room for {} at ({}, {}) inside {}", sx, row, col, shape),
                shape,
            ));
        }
        if sx == shape {
            return Ok(x);
        }
        Ok(self.push(OpKind::Embed { row, col }, vec![ix], shape))
    }

    /// Sum of all entries.
    pub fn sum_all(&self, x: Expr) -> DiffResult<Expr> {
        let (ix, sx) = self.resolve(x, "sum_all")?;
        if sx.is_scalar() {
            return Ok(x);
        }
        if sx.is_empty() {
            return Ok(self.scalar(0.0));
        }
        Ok(self.push(OpKind::SumAll, vec![ix], Shape::scalar()))
    }

    /// Inner product `sum(a .* b)`.
    pub fn dot(&self, a: Expr, b: Expr) -> DiffResult<Expr> {
        let sa = self.shape(a)?;
        let sb = self.shape(b)?;
        if sa != sb {
            return Err(DiffError::shape_mismatch("dot", sa, sb));
        }
        let prod = self.mul(a, b)?;
        self.sum_all(prod)
    }

    /// Pass `x` through, failing at evaluation time when any entry of `cond` is zero.
    pub fn assert_that(&self, x: Expr, cond: Expr, message: &str) -> DiffResult<Expr> {
        let (ix, sx) = self.resolve(x, "assertion")?;
        let (ic, _) = self.resolve(cond, "assertion")?;
        Ok(self.push(OpKind::Assertion(Arc::from(message)), vec![ix, ic], sx))
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Insert a call node and return one expression per callee output.
    pub fn call(&self, callee: Callee, args: &[Expr]) -> DiffResult<Vec<Expr>> {
        let input_shapes = callee.input_shapes();
        if args.len() != input_shapes.len() {
            return Err(DiffError::InvalidArgument {
                context: format!(
                    "{} expects {} arguments, got {}",
                    callee.name(),
                    input_shapes.len(),
                    args.len()
                ),
            });
        }
        let resolved = self.resolve_all(args, "call")?;
        for (i, ((_, got), expected)) in resolved.iter().zip(&input_shapes).enumerate() {
            if got != expected {
                return Err(DiffError::shape_mismatch(
                    &format!("{} argument {}", callee.name(), i),
                    expected,
                    got,
                ));
            }
        }
        let output_shapes = callee.output_shapes();
        let operands = resolved.iter().map(|(id, _)| *id).collect();
        let call = self.push(OpKind::Call(callee), operands, Shape::new(0, 0));
        Ok(output_shapes
            .into_iter()
            .enumerate()
            .map(|(i, shape)| self.push(OpKind::CallOutput(i), vec![call.node], shape))
            .collect())
    }

    fn resolve_all(&self, parts: &[Expr], context: &str) -> DiffResult<Vec<(NodeId, Shape)>> {
        parts.iter().map(|&e| self.resolve(e, context)).collect()
    }
}
