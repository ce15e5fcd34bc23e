//! Reachability and topological ordering over the arena.

use super::graph::Arena;
use super::node::{NodeId, OpKind};
use crate::error::{DiffError, DiffResult};

/// Nodes reachable from `outputs`, in ascending id order.
///
/// Operands always have smaller ids than their users, so ascending order is a
/// topological order. `inputs` are always included, reachable or not, and
/// their operands are not followed. Any other reachable Symbol is a free
/// symbol and fails with `InvalidArgument`.
pub(crate) fn topological_order(
    arena: &Arena,
    inputs: &[NodeId],
    outputs: &[NodeId],
) -> DiffResult<Vec<NodeId>> {
    let mut visited = vec![false; arena.len()];
    let mut is_input = vec![false; arena.len()];
    for id in inputs {
        let slot = is_input.get_mut(id.0).ok_or_else(|| DiffError::InvalidArgument {
            context: format!("input node {} out of range", id.0),
        })?;
        *slot = true;
        visited[id.0] = true;
    }

    let mut stack: Vec<NodeId> = outputs.to_vec();
    while let Some(id) = stack.pop() {
        let node = arena.get(id).ok_or_else(|| DiffError::InvalidArgument {
            context: format!("output node {} out of range", id.0),
        })?;
        if visited[id.0] {
            continue;
        }
        visited[id.0] = true;
        if let OpKind::Symbol(name) = &node.op {
            return Err(DiffError::InvalidArgument {
                context: format!("free symbol '{}' is not a declared input", name),
            });
        }
        for &operand in &node.operands {
            if !visited[operand.0] {
                stack.push(operand);
            }
        }
    }

    Ok(visited
        .iter()
        .enumerate()
        .filter(|&(_, &seen)| seen)
        .map(|(i, _)| NodeId(i))
        .collect())
}

/// Number of users of each node within `order`.
pub(crate) fn use_counts(arena: &Arena, order: &[NodeId]) -> Vec<usize> {
    let mut counts = vec![0; arena.len()];
    for &id in order {
        if let Some(node) = arena.get(id) {
            for operand in &node.operands {
                counts[operand.0] += 1;
            }
        }
    }
    counts
}
