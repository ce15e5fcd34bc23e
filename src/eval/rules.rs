//! Value, forward and adjoint rules per operation kind.
//!
//! Each rule matches [`OpKind`] exhaustively. Symbols, calls and call
//! projections are handled by the sweep driver and never reach these rules.
//!
//! Conventions at non-differentiable points:
//! - `abs'(0) = +1`
//! - `sign' = 0`, comparisons have zero derivative
//! - `if_else` differentiates the selected branch only

use super::algebra::Algebra;
use crate::error::{DiffError, DiffResult};
use crate::expr::{BinaryOp, CompareOp, OpKind, Shape, UnaryOp};

fn driver_only(op: &OpKind) -> DiffError {
    DiffError::InvalidArgument {
        context: format!("'{}' nodes are evaluated by the sweep driver", op.name()),
    }
}

/// Value of a node from its operand values.
pub(crate) fn value_rule<A: Algebra>(
    alg: &A,
    op: &OpKind,
    shape: Shape,
    args: &[&A::Value],
) -> DiffResult<A::Value> {
    match op {
        OpKind::Constant(values) => alg.constant(shape, values),
        OpKind::Unary(u) => alg.unary(*u, args[0]),
        OpKind::Binary(b) => alg.binary(*b, args[0], args[1]),
        OpKind::Powi(n) => alg.powi(args[0], *n),
        OpKind::Compare(c) => alg.compare(*c, args[0], args[1]),
        OpKind::IfElse => alg.if_else(args[0], args[1], args[2]),
        OpKind::MatMul => alg.matmul(args[0], args[1]),
        OpKind::Transpose => alg.transpose(args[0]),
        OpKind::Reshape => alg.reshape(args[0], shape),
        OpKind::Vertcat => {
            let parts: Vec<A::Value> = args.iter().map(|&a| a.clone()).collect();
            alg.vertcat(&parts)
        }
        OpKind::Horzcat => {
            let parts: Vec<A::Value> = args.iter().map(|&a| a.clone()).collect();
            alg.horzcat(&parts)
        }
        OpKind::Slice { row, col } => alg.slice(args[0], *row, *col, shape),
        OpKind::Embed { row, col } => alg.embed(args[0], *row, *col, shape),
        OpKind::SumAll => alg.sum_all(args[0]),
        OpKind::Assertion(message) => alg.assertion(args[0], args[1], message),
        OpKind::Symbol(_) | OpKind::Call(_) | OpKind::CallOutput(_) => Err(driver_only(op)),
    }
}

/// Directional derivative of a node; `None` means zero.
pub(crate) fn forward_rule<A: Algebra>(
    alg: &A,
    op: &OpKind,
    shape: Shape,
    args: &[&A::Value],
    out: &A::Value,
    dargs: &[Option<&A::Value>],
) -> DiffResult<Option<A::Value>> {
    if dargs.iter().all(Option::is_none) {
        return Ok(None);
    }
    let tangent = match op {
        OpKind::Constant(_) | OpKind::Compare(_) => None,
        OpKind::Unary(u) => match dargs[0] {
            Some(d) => unary_derivative(alg, *u, args[0], out)?
                .map(|factor| alg.mul(&factor, d))
                .transpose()?,
            None => None,
        },
        OpKind::Binary(b) => binary_forward(alg, *b, args, out, dargs)?,
        OpKind::Powi(n) => match dargs[0] {
            Some(d) => powi_derivative(alg, args[0], *n)?
                .map(|factor| alg.mul(&factor, d))
                .transpose()?,
            None => None,
        },
        OpKind::IfElse => {
            let (dt, df) = match (dargs[1], dargs[2]) {
                (Some(t), Some(f)) => (t.clone(), f.clone()),
                (Some(t), None) => (t.clone(), alg.scalar(0.0)?),
                (None, Some(f)) => (alg.scalar(0.0)?, f.clone()),
                (None, None) => return Ok(None),
            };
            Some(alg.if_else(args[0], &dt, &df)?)
        }
        OpKind::MatMul => {
            let left = dargs[0].map(|da| alg.matmul(da, args[1])).transpose()?;
            let right = dargs[1].map(|db| alg.matmul(args[0], db)).transpose()?;
            sum_options(alg, left, right)?
        }
        OpKind::Transpose => dargs[0].map(|d| alg.transpose(d)).transpose()?,
        OpKind::Reshape => dargs[0].map(|d| alg.reshape(d, shape)).transpose()?,
        OpKind::Vertcat | OpKind::Horzcat => {
            let mut parts = Vec::with_capacity(args.len());
            for (arg, d) in args.iter().zip(dargs) {
                parts.push(match d {
                    Some(d) => (*d).clone(),
                    None => alg.zeros(alg.shape_of(arg)?)?,
                });
            }
            Some(if matches!(op, OpKind::Vertcat) {
                alg.vertcat(&parts)?
            } else {
                alg.horzcat(&parts)?
            })
        }
        OpKind::Slice { row, col } => dargs[0]
            .map(|d| alg.slice(d, *row, *col, shape))
            .transpose()?,
        OpKind::Embed { row, col } => dargs[0]
            .map(|d| alg.embed(d, *row, *col, shape))
            .transpose()?,
        OpKind::SumAll => dargs[0].map(|d| alg.sum_all(d)).transpose()?,
        OpKind::Assertion(_) => dargs[0].cloned(),
        OpKind::Symbol(_) | OpKind::Call(_) | OpKind::CallOutput(_) => {
            return Err(driver_only(op));
        }
    };
    tangent.map(|t| alg.fit(t, shape)).transpose()
}

/// Adjoint contributions of a node to each of its operands.
pub(crate) fn adjoint_rule<A: Algebra>(
    alg: &A,
    op: &OpKind,
    args: &[&A::Value],
    out: &A::Value,
    adj: &A::Value,
) -> DiffResult<Vec<Option<A::Value>>> {
    let contributions = match op {
        OpKind::Constant(_) => Vec::new(),
        OpKind::Compare(_) => vec![None, None],
        OpKind::Unary(u) => vec![
            unary_derivative(alg, *u, args[0], out)?
                .map(|factor| alg.mul(adj, &factor))
                .transpose()?,
        ],
        OpKind::Binary(b) => binary_adjoint(alg, *b, args, out, adj)?,
        OpKind::Powi(n) => vec![
            powi_derivative(alg, args[0], *n)?
                .map(|factor| alg.mul(adj, &factor))
                .transpose()?,
        ],
        OpKind::IfElse => {
            let zero = alg.scalar(0.0)?;
            let to_true = alg.if_else(args[0], adj, &zero)?;
            let to_false = alg.if_else(args[0], &zero, adj)?;
            vec![
                None,
                Some(alg.reduce(to_true, alg.shape_of(args[1])?)?),
                Some(alg.reduce(to_false, alg.shape_of(args[2])?)?),
            ]
        }
        OpKind::MatMul => {
            let bt = alg.transpose(args[1])?;
            let at = alg.transpose(args[0])?;
            vec![Some(alg.matmul(adj, &bt)?), Some(alg.matmul(&at, adj)?)]
        }
        OpKind::Transpose => vec![Some(alg.transpose(adj)?)],
        OpKind::Reshape => vec![Some(alg.reshape(adj, alg.shape_of(args[0])?)?)],
        OpKind::Vertcat => {
            let mut offset = 0;
            let mut parts = Vec::with_capacity(args.len());
            for arg in args {
                let s = alg.shape_of(arg)?;
                parts.push(Some(alg.slice(adj, offset, 0, s)?));
                offset += s.rows;
            }
            parts
        }
        OpKind::Horzcat => {
            let mut offset = 0;
            let mut parts = Vec::with_capacity(args.len());
            for arg in args {
                let s = alg.shape_of(arg)?;
                parts.push(Some(alg.slice(adj, 0, offset, s)?));
                offset += s.cols;
            }
            parts
        }
        OpKind::Slice { row, col } => {
            vec![Some(alg.embed(adj, *row, *col, alg.shape_of(args[0])?)?)]
        }
        OpKind::Embed { row, col } => {
            vec![Some(alg.slice(adj, *row, *col, alg.shape_of(args[0])?)?)]
        }
        OpKind::SumAll => vec![Some(alg.broadcast(adj, alg.shape_of(args[0])?)?)],
        OpKind::Assertion(_) => vec![Some(adj.clone()), None],
        OpKind::Symbol(_) | OpKind::Call(_) | OpKind::CallOutput(_) => {
            return Err(driver_only(op));
        }
    };
    Ok(contributions)
}

/// `f'(x)` for an elementwise function, `None` when identically zero.
fn unary_derivative<A: Algebra>(
    alg: &A,
    op: UnaryOp,
    x: &A::Value,
    out: &A::Value,
) -> DiffResult<Option<A::Value>> {
    let factor = match op {
        UnaryOp::Neg => alg.scalar(-1.0)?,
        UnaryOp::Exp => out.clone(),
        UnaryOp::Log => {
            let one = alg.scalar(1.0)?;
            alg.div(&one, x)?
        }
        UnaryOp::Sin => alg.unary(UnaryOp::Cos, x)?,
        UnaryOp::Cos => alg.neg(&alg.unary(UnaryOp::Sin, x)?)?,
        UnaryOp::Tan => {
            let one = alg.scalar(1.0)?;
            alg.add(&one, &alg.mul(out, out)?)?
        }
        UnaryOp::Sqrt => {
            let half = alg.scalar(0.5)?;
            alg.div(&half, out)?
        }
        UnaryOp::Abs => {
            // 1 - 2 * (x < 0)
            let zero = alg.scalar(0.0)?;
            let negative = alg.compare(CompareOp::Lt, x, &zero)?;
            let one = alg.scalar(1.0)?;
            alg.sub(&one, &alg.scale(&negative, 2.0)?)?
        }
        UnaryOp::Sign => return Ok(None),
    };
    Ok(Some(factor))
}

fn powi_derivative<A: Algebra>(alg: &A, x: &A::Value, n: i32) -> DiffResult<Option<A::Value>> {
    match n {
        0 => Ok(None),
        1 => Ok(Some(alg.scalar(1.0)?)),
        _ => {
            let lowered = alg.powi(x, n - 1)?;
            Ok(Some(alg.scale(&lowered, f64::from(n))?))
        }
    }
}

fn binary_forward<A: Algebra>(
    alg: &A,
    op: BinaryOp,
    args: &[&A::Value],
    out: &A::Value,
    dargs: &[Option<&A::Value>],
) -> DiffResult<Option<A::Value>> {
    let (a, b) = (args[0], args[1]);
    let (da, db) = (dargs[0], dargs[1]);
    match op {
        BinaryOp::Add => match (da, db) {
            (Some(da), Some(db)) => Ok(Some(alg.add(da, db)?)),
            (Some(da), None) => Ok(Some(da.clone())),
            (None, Some(db)) => Ok(Some(db.clone())),
            (None, None) => Ok(None),
        },
        BinaryOp::Sub => match (da, db) {
            (Some(da), Some(db)) => Ok(Some(alg.sub(da, db)?)),
            (Some(da), None) => Ok(Some(da.clone())),
            (None, Some(db)) => Ok(Some(alg.neg(db)?)),
            (None, None) => Ok(None),
        },
        BinaryOp::Mul => {
            let left = da.map(|da| alg.mul(da, b)).transpose()?;
            let right = db.map(|db| alg.mul(a, db)).transpose()?;
            sum_options(alg, left, right)
        }
        BinaryOp::Div => {
            // d(a/b) = da/b - out*db/b
            let left = da.map(|da| alg.div(da, b)).transpose()?;
            let right = match db {
                Some(db) => Some(alg.neg(&alg.div(&alg.mul(out, db)?, b)?)?),
                None => None,
            };
            sum_options(alg, left, right)
        }
    }
}

fn binary_adjoint<A: Algebra>(
    alg: &A,
    op: BinaryOp,
    args: &[&A::Value],
    out: &A::Value,
    adj: &A::Value,
) -> DiffResult<Vec<Option<A::Value>>> {
    let (a, b) = (args[0], args[1]);
    let (sa, sb) = (alg.shape_of(a)?, alg.shape_of(b)?);
    let (to_a, to_b) = match op {
        BinaryOp::Add => (adj.clone(), adj.clone()),
        BinaryOp::Sub => (adj.clone(), alg.neg(adj)?),
        BinaryOp::Mul => (alg.mul(adj, b)?, alg.mul(adj, a)?),
        BinaryOp::Div => {
            let to_a = alg.div(adj, b)?;
            let to_b = alg.neg(&alg.div(&alg.mul(adj, out)?, b)?)?;
            (to_a, to_b)
        }
    };
    Ok(vec![
        Some(alg.fit(alg.reduce(to_a, sa)?, sa)?),
        Some(alg.fit(alg.reduce(to_b, sb)?, sb)?),
    ])
}

fn sum_options<A: Algebra>(
    alg: &A,
    left: Option<A::Value>,
    right: Option<A::Value>,
) -> DiffResult<Option<A::Value>> {
    match (left, right) {
        (Some(l), Some(r)) => Ok(Some(alg.add(&l, &r)?)),
        (l, r) => Ok(l.or(r)),
    }
}
