//! Compiled, topologically ordered form of a Function.

use crate::error::{DiffError, DiffResult};
use crate::expr::traversal::topological_order;
use crate::expr::{Arena, NodeId, OpKind, Shape};

/// One node of a compiled program; `args` are slot indices.
#[derive(Debug, Clone)]
pub(crate) struct Instruction {
    pub(crate) op: OpKind,
    pub(crate) args: Vec<usize>,
    pub(crate) shape: Shape,
}

/// The reachable sub-graph of a Function, flattened to slots in topological order.
///
/// Built once at Function construction and shared read-only by every evaluation.
#[derive(Debug, Clone)]
pub(crate) struct Program {
    pub(crate) instructions: Vec<Instruction>,
    /// Slot of each declared input, in port order.
    pub(crate) input_slots: Vec<usize>,
    /// Slot of each declared output, in port order.
    pub(crate) output_slots: Vec<usize>,
    /// Slot depends on at least one input.
    pub(crate) active: Vec<bool>,
    pub(crate) is_input: Vec<bool>,
}

impl Program {
    pub(crate) fn compile(
        arena: &Arena,
        inputs: &[NodeId],
        outputs: &[NodeId],
    ) -> DiffResult<Self> {
        let order = topological_order(arena, inputs, outputs)?;

        let mut slot_of = vec![usize::MAX; arena.len()];
        for (slot, id) in order.iter().enumerate() {
            slot_of[id.0] = slot;
        }

        let mut instructions = Vec::with_capacity(order.len());
        let mut is_input = vec![false; order.len()];
        let mut active = vec![false; order.len()];
        for &id in inputs {
            is_input[slot_of[id.0]] = true;
        }

        for (slot, id) in order.iter().enumerate() {
            let node = arena.get(*id).ok_or_else(|| DiffError::InvalidArgument {
                context: format!("node {} out of range", id.0),
            })?;
            let args: Vec<usize> = if is_input[slot] {
                Vec::new()
            } else {
                node.operands.iter().map(|o| slot_of[o.0]).collect()
            };
            active[slot] = is_input[slot] || args.iter().any(|&a| active[a]);
            instructions.push(Instruction {
                op: node.op.clone(),
                args,
                shape: node.shape,
            });
        }

        Ok(Self {
            instructions,
            input_slots: inputs.iter().map(|id| slot_of[id.0]).collect(),
            output_slots: outputs.iter().map(|id| slot_of[id.0]).collect(),
            active,
            is_input,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.instructions.len()
    }
}
