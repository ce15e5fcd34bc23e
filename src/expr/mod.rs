//! Symbolic expression graphs.
//!
//! A [`Graph`] is an append-only arena of [`Node`]s. Nodes reference their
//! operands by [`NodeId`]; a hash-consing cache returns the existing node when
//! an equal operation on the same operands is requested again, so shared
//! sub-expressions are stored once and every sweep visits them once.
//!
//! # Example
//!
//! ```
//! use diffsim::expr::{Graph, Shape};
//!
//! let g = Graph::new();
//! let x = g.symbol("x", Shape::column(3));
//! let s = g.sin(x).unwrap();
//! let y = g.mul(s, s).unwrap();
//! assert_eq!(g.shape(y).unwrap(), Shape::column(3));
//! ```

mod builder;
mod display;
mod graph;
mod node;
mod shape;
pub(crate) mod traversal;

pub(crate) use graph::Arena;
pub use graph::{Expr, Graph};
pub use node::{BinaryOp, CompareOp, Node, NodeId, OpKind, UnaryOp};
pub use shape::Shape;
