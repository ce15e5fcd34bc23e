//! Text rendering of expressions for debugging.

use std::fmt::Write;

use super::graph::{Arena, Expr, Graph};
use super::node::{NodeId, OpKind};
use crate::error::DiffResult;

impl Graph {
    /// Render `e` as a nested expression.
    ///
    /// A node that was already printed is shown as `@id` on later uses, so
    /// shared sub-expressions stay visible and the output stays linear in the
    /// number of nodes.
    pub fn describe(&self, e: Expr) -> DiffResult<String> {
        let (id, _) = self.resolve(e, "describe")?;
        let arena = self.read();
        let mut printed = vec![false; arena.len()];
        let mut out = String::new();
        render(&arena, id, &mut printed, &mut out);
        Ok(out)
    }
}

fn render(arena: &Arena, id: NodeId, printed: &mut [bool], out: &mut String) {
    let Some(node) = arena.get(id) else {
        let _ = write!(out, "<missing {}>", id.0);
        return;
    };
    match &node.op {
        OpKind::Symbol(name) => {
            out.push_str(name);
            return;
        }
        OpKind::Constant(values) => {
            if values.len() == 1 {
                let _ = write!(out, "{}", values[0]);
            } else {
                let _ = write!(out, "const<{}>", node.shape);
            }
            return;
        }
        _ => {}
    }
    if printed[id.0] {
        let _ = write!(out, "@{}", id.0);
        return;
    }
    printed[id.0] = true;

    let _ = write!(out, "@{}=", id.0);
    match &node.op {
        OpKind::Powi(n) => {
            let _ = write!(out, "powi[{}]", n);
        }
        OpKind::Slice { row, col } | OpKind::Embed { row, col } => {
            let _ = write!(out, "{}[{},{};{}]", node.op.name(), row, col, node.shape);
        }
        OpKind::Call(callee) => {
            let _ = write!(out, "{}", callee.name());
        }
        OpKind::CallOutput(i) => {
            let _ = write!(out, "out{}", i);
        }
        op => out.push_str(op.name()),
    }
    out.push('(');
    for (k, &operand) in node.operands.iter().enumerate() {
        if k > 0 {
            out.push_str(", ");
        }
        render(arena, operand, printed, out);
    }
    out.push(')');
}
