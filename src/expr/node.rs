//! Node and operation definitions for expression graphs.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::shape::Shape;
use crate::function::Callee;

/// Index of a node inside its graph's arena.
///
/// Operands always have smaller ids than the nodes that use them, so the
/// arena order is a valid topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// Elementwise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Sqrt,
    /// Derivative convention at 0: +1 (right derivative).
    Abs,
    /// sign(0) = 0; derivative is zero everywhere.
    Sign,
}

/// Elementwise binary arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Elementwise comparisons producing 0/1 values with zero derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
}

/// Operation kinds.
///
/// This enum is closed: the value, forward and adjoint rules in
/// [`crate::eval`] match on it exhaustively.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Named leaf; bound to a Function input.
    Symbol(Arc<str>),
    /// Dense constant, row-major.
    Constant(Arc<[f64]>),
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// Integer power `x^n`.
    Powi(i32),
    Compare(CompareOp),
    /// Operands `[cond, if_true, if_false]`; nonzero entries of `cond` select `if_true`.
    IfElse,
    MatMul,
    Transpose,
    /// Row-major reshape to the node shape.
    Reshape,
    Vertcat,
    Horzcat,
    /// Block of the operand starting at `(row, col)` with the node shape.
    Slice { row: usize, col: usize },
    /// Operand placed at `(row, col)` inside a zero matrix of the node shape.
    Embed { row: usize, col: usize },
    /// Sum of all entries, `1x1`.
    SumAll,
    /// Operands `[x, cond]`; evaluates to `x`, fails when any entry of `cond` is zero.
    Assertion(Arc<str>),
    /// Invocation of a Function or integrator; operands are the arguments.
    Call(Callee),
    /// Projection of output `i` of the Call node operand.
    CallOutput(usize),
}

impl OpKind {
    pub fn is_symbol(&self) -> bool {
        matches!(self, OpKind::Symbol(_))
    }

    /// Short operation name used in errors and debug output.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Symbol(_) => "symbol",
            OpKind::Constant(_) => "constant",
            OpKind::Unary(op) => match op {
                UnaryOp::Neg => "neg",
                UnaryOp::Exp => "exp",
                UnaryOp::Log => "log",
                UnaryOp::Sin => "sin",
                UnaryOp::Cos => "cos",
                UnaryOp::Tan => "tan",
                UnaryOp::Sqrt => "sqrt",
                UnaryOp::Abs => "abs",
                UnaryOp::Sign => "sign",
            },
            OpKind::Binary(op) => match op {
                BinaryOp::Add => "add",
                BinaryOp::Sub => "sub",
                BinaryOp::Mul => "mul",
                BinaryOp::Div => "div",
            },
            OpKind::Powi(_) => "powi",
            OpKind::Compare(op) => match op {
                CompareOp::Lt => "lt",
                CompareOp::Le => "le",
                CompareOp::Eq => "eq",
            },
            OpKind::IfElse => "if_else",
            OpKind::MatMul => "matmul",
            OpKind::Transpose => "transpose",
            OpKind::Reshape => "reshape",
            OpKind::Vertcat => "vertcat",
            OpKind::Horzcat => "horzcat",
            OpKind::Slice { .. } => "slice",
            OpKind::Embed { .. } => "embed",
            OpKind::SumAll => "sum_all",
            OpKind::Assertion(_) => "assertion",
            OpKind::Call(_) => "call",
            OpKind::CallOutput(_) => "call_output",
        }
    }
}

// Manual Eq/Hash: constants compare by bit pattern, calls by callee identity.
impl PartialEq for OpKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OpKind::Symbol(a), OpKind::Symbol(b)) => a == b,
            (OpKind::Constant(a), OpKind::Constant(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (OpKind::Unary(a), OpKind::Unary(b)) => a == b,
            (OpKind::Binary(a), OpKind::Binary(b)) => a == b,
            (OpKind::Powi(a), OpKind::Powi(b)) => a == b,
            (OpKind::Compare(a), OpKind::Compare(b)) => a == b,
            (OpKind::IfElse, OpKind::IfElse) => true,
            (OpKind::MatMul, OpKind::MatMul) => true,
            (OpKind::Transpose, OpKind::Transpose) => true,
            (OpKind::Reshape, OpKind::Reshape) => true,
            (OpKind::Vertcat, OpKind::Vertcat) => true,
            (OpKind::Horzcat, OpKind::Horzcat) => true,
            (OpKind::Slice { row: r1, col: c1 }, OpKind::Slice { row: r2, col: c2 }) => {
                r1 == r2 && c1 == c2
            }
            (OpKind::Embed { row: r1, col: c1 }, OpKind::Embed { row: r2, col: c2 }) => {
                r1 == r2 && c1 == c2
            }
            (OpKind::SumAll, OpKind::SumAll) => true,
            (OpKind::Assertion(a), OpKind::Assertion(b)) => a == b,
            (OpKind::Call(a), OpKind::Call(b)) => a.id() == b.id(),
            (OpKind::CallOutput(a), OpKind::CallOutput(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for OpKind {}

impl Hash for OpKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            OpKind::Symbol(name) => name.hash(state),
            OpKind::Constant(values) => {
                values.len().hash(state);
                for v in values.iter() {
                    v.to_bits().hash(state);
                }
            }
            OpKind::Unary(op) => op.hash(state),
            OpKind::Binary(op) => op.hash(state),
            OpKind::Powi(n) => n.hash(state),
            OpKind::Compare(op) => op.hash(state),
            OpKind::Slice { row, col } | OpKind::Embed { row, col } => {
                row.hash(state);
                col.hash(state);
            }
            OpKind::Assertion(message) => message.hash(state),
            OpKind::Call(callee) => callee.id().hash(state),
            OpKind::CallOutput(index) => index.hash(state),
            OpKind::IfElse
            | OpKind::MatMul
            | OpKind::Transpose
            | OpKind::Reshape
            | OpKind::Vertcat
            | OpKind::Horzcat
            | OpKind::SumAll => {}
        }
    }
}

/// A node of the expression DAG.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub op: OpKind,
    pub operands: Vec<NodeId>,
    pub shape: Shape,
}

impl Node {
    pub fn new(op: OpKind, operands: Vec<NodeId>, shape: Shape) -> Self {
        Self {
            op,
            operands,
            shape,
        }
    }
}
