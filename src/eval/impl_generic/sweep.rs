//! Topological value, forward and adjoint passes over a compiled program.
//!
//! The passes are generic over [`Algebra`], so the same driver computes
//! numbers (numeric algebra) and derivative graphs (symbolic algebra).
//! Each pass visits every instruction once; a shared node's value and
//! derivative are computed once and reused by all of its users, and adjoint
//! contributions from several users are summed into the node's slot.

use crate::error::{DiffError, DiffResult};
use crate::eval::algebra::Algebra;
use crate::eval::rules::{adjoint_rule, forward_rule, value_rule};
use crate::expr::OpKind;
use crate::function::Program;

/// Per-instruction storage: plain nodes hold one entry, call nodes one per output.
enum Slot<T> {
    Empty,
    One(T),
    Many(Vec<T>),
}

impl<T> Slot<T> {
    fn one(&self) -> DiffResult<&T> {
        match self {
            Slot::One(v) => Ok(v),
            _ => Err(DiffError::InvalidArgument {
                context: "operand slot has not been computed".to_string(),
            }),
        }
    }

    fn output(&self, index: usize) -> DiffResult<&T> {
        match self {
            Slot::Many(v) => v.get(index).ok_or_else(|| DiffError::InvalidArgument {
                context: format!("call output {} out of range", index),
            }),
            _ => Err(DiffError::InvalidArgument {
                context: "call slot has not been computed".to_string(),
            }),
        }
    }

    fn take(&mut self) -> Slot<T> {
        std::mem::replace(self, Slot::Empty)
    }
}

fn empty_slots<T>(n: usize) -> Vec<Slot<T>> {
    (0..n).map(|_| Slot::Empty).collect()
}

fn check_arity(expected: usize, got: usize, what: &str) -> DiffResult<()> {
    if expected != got {
        return Err(DiffError::InvalidArgument {
            context: format!("expected {} {}, got {}", expected, what, got),
        });
    }
    Ok(())
}

fn operand_values<'s, V>(slots: &'s [Slot<V>], args: &[usize]) -> DiffResult<Vec<&'s V>> {
    args.iter().map(|&a| slots[a].one()).collect()
}

fn node_value<A: Algebra>(
    alg: &A,
    program: &Program,
    slot: usize,
    values: &[Slot<A::Value>],
) -> DiffResult<Slot<A::Value>> {
    let instr = &program.instructions[slot];
    match &instr.op {
        OpKind::Call(callee) => {
            let args: Vec<A::Value> = operand_values(values, &instr.args)?
                .into_iter()
                .cloned()
                .collect();
            Ok(Slot::Many(callee.evaluate(alg, &args)?))
        }
        OpKind::CallOutput(index) => Ok(Slot::One(values[instr.args[0]].output(*index)?.clone())),
        op => {
            let args = operand_values(values, &instr.args)?;
            Ok(Slot::One(value_rule(alg, op, instr.shape, &args)?))
        }
    }
}

fn value_pass<A: Algebra>(
    alg: &A,
    program: &Program,
    inputs: &[A::Value],
) -> DiffResult<Vec<Slot<A::Value>>> {
    check_arity(program.input_slots.len(), inputs.len(), "inputs")?;
    let mut values = empty_slots(program.instructions.len());
    for (&slot, value) in program.input_slots.iter().zip(inputs) {
        values[slot] = Slot::One(value.clone());
    }
    for slot in 0..program.instructions.len() {
        if program.is_input[slot] {
            continue;
        }
        values[slot] = node_value(alg, program, slot, &values)?;
    }
    Ok(values)
}

fn collect_outputs<V: Clone>(program: &Program, values: &[Slot<V>]) -> DiffResult<Vec<V>> {
    program
        .output_slots
        .iter()
        .map(|&slot| values[slot].one().cloned())
        .collect()
}

/// Evaluate the outputs of `program`.
pub(crate) fn evaluate<A: Algebra>(
    alg: &A,
    program: &Program,
    inputs: &[A::Value],
) -> DiffResult<Vec<A::Value>> {
    let values = value_pass(alg, program, inputs)?;
    collect_outputs(program, &values)
}

/// Forward-mode pass for several directions at once.
///
/// `tangents[d][i]` is the tangent of input `i` in direction `d`. Returns the
/// outputs and `[d][j]`, the tangent of output `j` in direction `d`.
pub(crate) fn forward<A: Algebra>(
    alg: &A,
    program: &Program,
    inputs: &[A::Value],
    tangents: &[Vec<Option<A::Value>>],
) -> DiffResult<(Vec<A::Value>, Vec<Vec<Option<A::Value>>>)> {
    check_arity(program.input_slots.len(), inputs.len(), "inputs")?;
    let ndir = tangents.len();
    for direction in tangents {
        check_arity(program.input_slots.len(), direction.len(), "input tangents")?;
    }

    let n = program.instructions.len();
    let mut values = empty_slots(n);
    let mut dots: Vec<Slot<Vec<Option<A::Value>>>> = empty_slots(n);
    for (k, (&slot, value)) in program.input_slots.iter().zip(inputs).enumerate() {
        values[slot] = Slot::One(value.clone());
        dots[slot] = Slot::One(tangents.iter().map(|d| d[k].clone()).collect());
    }

    for slot in 0..n {
        if program.is_input[slot] {
            continue;
        }
        let instr = &program.instructions[slot];
        if !program.active[slot] {
            values[slot] = node_value(alg, program, slot, &values)?;
            dots[slot] = match instr.op {
                OpKind::Call(_) => Slot::Many(Vec::new()),
                _ => Slot::One(vec![None; ndir]),
            };
            continue;
        }
        match &instr.op {
            OpKind::Call(callee) => {
                let args: Vec<A::Value> = operand_values(&values, &instr.args)?
                    .into_iter()
                    .cloned()
                    .collect();
                let outs = callee.evaluate(alg, &args)?;
                let mut arg_dots = Vec::with_capacity(ndir);
                for d in 0..ndir {
                    let mut per_arg = Vec::with_capacity(instr.args.len());
                    for &a in &instr.args {
                        per_arg.push(dots[a].one()?[d].clone());
                    }
                    arg_dots.push(per_arg);
                }
                let out_dots = callee.forward(alg, &args, &outs, &arg_dots)?;
                // [dir][output] -> [output][dir]
                let mut by_output: Vec<Vec<Option<A::Value>>> =
                    (0..outs.len()).map(|_| Vec::with_capacity(ndir)).collect();
                for direction in out_dots {
                    for (j, t) in direction.into_iter().enumerate() {
                        by_output[j].push(t);
                    }
                }
                values[slot] = Slot::Many(outs);
                dots[slot] = Slot::Many(by_output);
            }
            OpKind::CallOutput(index) => {
                let call = instr.args[0];
                values[slot] = Slot::One(values[call].output(*index)?.clone());
                dots[slot] = Slot::One(match &dots[call] {
                    Slot::Many(outs) if !outs.is_empty() => outs[*index].clone(),
                    _ => vec![None; ndir],
                });
            }
            op => {
                let args = operand_values(&values, &instr.args)?;
                let out = value_rule(alg, op, instr.shape, &args)?;
                let mut node_dots = Vec::with_capacity(ndir);
                for d in 0..ndir {
                    let mut dargs = Vec::with_capacity(instr.args.len());
                    for &a in &instr.args {
                        dargs.push(dots[a].one()?[d].as_ref());
                    }
                    node_dots.push(forward_rule(alg, op, instr.shape, &args, &out, &dargs)?);
                }
                values[slot] = Slot::One(out);
                dots[slot] = Slot::One(node_dots);
            }
        }
    }

    let outputs = collect_outputs(program, &values)?;
    let mut output_dots = Vec::with_capacity(ndir);
    for d in 0..ndir {
        let mut per_output = Vec::with_capacity(program.output_slots.len());
        for &slot in &program.output_slots {
            per_output.push(dots[slot].one()?[d].clone());
        }
        output_dots.push(per_output);
    }
    Ok((outputs, output_dots))
}

/// Adjoint-mode pass for several seeds at once.
///
/// `seeds[d][j]` seeds output `j` in direction `d`. Returns the outputs and
/// `[d][i]`, the adjoint of input `i` in direction `d`.
pub(crate) fn reverse<A: Algebra>(
    alg: &A,
    program: &Program,
    inputs: &[A::Value],
    seeds: &[Vec<Option<A::Value>>],
) -> DiffResult<(Vec<A::Value>, Vec<Vec<Option<A::Value>>>)> {
    let ndir = seeds.len();
    for direction in seeds {
        check_arity(program.output_slots.len(), direction.len(), "output seeds")?;
    }
    let values = value_pass(alg, program, inputs)?;
    let outputs = collect_outputs(program, &values)?;

    let n = program.instructions.len();
    let mut bars: Vec<Slot<Vec<Option<A::Value>>>> = empty_slots(n);

    for (d, direction) in seeds.iter().enumerate() {
        for (&slot, seed) in program.output_slots.iter().zip(direction) {
            if let Some(seed) = seed {
                if program.active[slot] {
                    add_bar(alg, &mut bars[slot], ndir, d, seed.clone())?;
                }
            }
        }
    }

    for slot in (0..n).rev() {
        if !program.active[slot] || program.is_input[slot] {
            continue;
        }
        let instr = &program.instructions[slot];
        match &instr.op {
            OpKind::Symbol(_) | OpKind::Constant(_) => {}
            OpKind::CallOutput(index) => {
                let Slot::One(node_bars) = bars[slot].take() else {
                    continue;
                };
                let call = instr.args[0];
                let n_out = match &values[call] {
                    Slot::Many(outs) => outs.len(),
                    _ => 0,
                };
                for (d, bar) in node_bars.into_iter().enumerate() {
                    if let Some(bar) = bar {
                        add_call_bar(alg, &mut bars[call], n_out, ndir, *index, d, bar)?;
                    }
                }
            }
            OpKind::Call(callee) => {
                let Slot::Many(by_output) = bars[slot].take() else {
                    continue;
                };
                // [output][dir] -> [dir][output]
                let mut out_seeds: Vec<Vec<Option<A::Value>>> =
                    (0..ndir).map(|_| Vec::with_capacity(by_output.len())).collect();
                for output in by_output {
                    for (d, bar) in output.into_iter().enumerate() {
                        out_seeds[d].push(bar);
                    }
                }
                let args: Vec<A::Value> = operand_values(&values, &instr.args)?
                    .into_iter()
                    .cloned()
                    .collect();
                let outs = match &values[slot] {
                    Slot::Many(outs) => outs.clone(),
                    _ => Vec::new(),
                };
                let contributions = callee.reverse(alg, &args, &outs, &out_seeds)?;
                for (d, per_arg) in contributions.into_iter().enumerate() {
                    for (&a, c) in instr.args.iter().zip(per_arg) {
                        if let Some(c) = c {
                            if program.active[a] {
                                add_bar(alg, &mut bars[a], ndir, d, c)?;
                            }
                        }
                    }
                }
            }
            op => {
                let Slot::One(node_bars) = bars[slot].take() else {
                    continue;
                };
                let args = operand_values(&values, &instr.args)?;
                let out = values[slot].one()?;
                for (d, bar) in node_bars.into_iter().enumerate() {
                    let Some(bar) = bar else { continue };
                    let contributions = adjoint_rule(alg, op, &args, out, &bar)?;
                    for (&a, c) in instr.args.iter().zip(contributions) {
                        if let Some(c) = c {
                            if program.active[a] {
                                add_bar(alg, &mut bars[a], ndir, d, c)?;
                            }
                        }
                    }
                }
            }
        }
    }

    let mut input_bars = Vec::with_capacity(ndir);
    for d in 0..ndir {
        let mut per_input = Vec::with_capacity(program.input_slots.len());
        for &slot in &program.input_slots {
            per_input.push(match &bars[slot] {
                Slot::One(node_bars) => node_bars[d].clone(),
                _ => None,
            });
        }
        input_bars.push(per_input);
    }
    Ok((outputs, input_bars))
}

fn add_bar<A: Algebra>(
    alg: &A,
    slot: &mut Slot<Vec<Option<A::Value>>>,
    ndir: usize,
    d: usize,
    contribution: A::Value,
) -> DiffResult<()> {
    if !matches!(slot, Slot::One(_)) {
        *slot = Slot::One(vec![None; ndir]);
    }
    if let Slot::One(bars) = slot {
        bars[d] = alg.accumulate(bars[d].take(), contribution)?;
    }
    Ok(())
}

fn add_call_bar<A: Algebra>(
    alg: &A,
    slot: &mut Slot<Vec<Option<A::Value>>>,
    n_out: usize,
    ndir: usize,
    index: usize,
    d: usize,
    contribution: A::Value,
) -> DiffResult<()> {
    if !matches!(slot, Slot::Many(_)) {
        *slot = Slot::Many((0..n_out).map(|_| vec![None; ndir]).collect());
    }
    if let Slot::Many(outputs) = slot {
        let bars = outputs.get_mut(index).ok_or_else(|| DiffError::InvalidArgument {
            context: format!("call output {} out of range", index),
        })?;
        bars[d] = alg.accumulate(bars[d].take(), contribution)?;
    }
    Ok(())
}
