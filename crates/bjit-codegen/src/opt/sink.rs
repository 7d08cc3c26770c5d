//! Code sinking (spec §4.4.4).
//!
//! Reverse iteration over each block's ops: an op with no uses left in its
//! own block, declared movable and side-effect-free, is moved into the
//! unique successor block whose live-in set contains it. This pushes
//! loop-invariant-looking computations back down into the branch that
//! actually consumes them, undoing over-eager hoisting and shrinking the
//! live range on paths that never need the value.

use crate::dominator;
use crate::flowgraph;
use crate::ir::{BlockRef, Op, Procedure};

/// Run one sink pass over every live block. Returns whether anything moved.
pub fn run(proc: &mut Procedure) -> bool {
    let mut changed = false;
    for b in flowgraph::live_blocks(proc) {
        changed |= sink_block(proc, b);
    }
    if changed {
        dominator::compute(proc);
    }
    changed
}

fn sink_block(proc: &mut Procedure, b: BlockRef) -> bool {
    let mut changed = false;
    let ops: Vec<Op> = proc.block(b).ops.clone();

    for &op in ops.iter().rev() {
        if proc.op(op).is_nop() {
            continue;
        }
        let info = proc.op(op).opcode.info();
        if !info.movable || info.has_side_effects {
            continue;
        }
        // Ops still used by something else in this block cannot sink past
        // it — they'd be used before they're defined.
        if used_locally(proc, b, op) {
            continue;
        }

        let Some(target) = unique_consuming_successor(proc, b, op) else {
            continue;
        };
        if is_critical_edge(proc, b, target) {
            let split = split_edge(proc, b, target);
            move_into(proc, op, b, split);
        } else {
            move_into(proc, op, b, target);
        }
        changed = true;
    }

    changed
}

fn used_locally(proc: &Procedure, b: BlockRef, op: Op) -> bool {
    proc.block(b).ops.iter().any(|&other| {
        if other == op || proc.op(other).is_nop() {
            return false;
        }
        let mut found = false;
        proc.op(other).for_each_input(|i| {
            if i == op {
                found = true;
            }
        });
        found
    })
}

/// The single successor of `b` whose live-in set contains `op`, or `None`
/// if zero or more than one successor needs it (sinking into only one of
/// several consumers would be unsound — the others would lose the value).
fn unique_consuming_successor(proc: &Procedure, b: BlockRef, op: Op) -> Option<BlockRef> {
    let term = proc.block(b).terminator()?;
    let targets = proc.op(term).targets();
    let mut found = None;
    for &t in targets {
        if proc.block(t).live_in.contains(&op) {
            if found.is_some() {
                return None;
            }
            found = Some(t);
        }
    }
    found
}

fn is_critical_edge(proc: &Procedure, from: BlockRef, to: BlockRef) -> bool {
    let multi_successor = proc
        .block(from)
        .terminator()
        .map(|t| proc.op(t).targets().len() > 1)
        .unwrap_or(false);
    multi_successor && proc.block(to).come_from.len() > 1
}

fn split_edge(proc: &mut Procedure, from: BlockRef, to: BlockRef) -> BlockRef {
    let fresh = proc.make_block();
    proc.push_op(
        fresh,
        crate::ir::Opcode::Jmp,
        crate::ir::OpData::Jump { target: to },
        crate::ir::Type::None,
    )
    .expect("sink's on-demand edge split cannot overflow right after a DCE pass");

    let term = proc.block(from).terminator().expect("checked by caller");
    for target in proc.op_mut(term).targets_mut() {
        if *target == to {
            *target = fresh;
        }
    }
    for phi in proc.block_mut(to).phis.iter_mut() {
        for alt in phi.alternatives.iter_mut() {
            if alt.source_block == from {
                alt.source_block = fresh;
            }
        }
    }
    fresh
}

fn move_into(proc: &mut Procedure, op: Op, from: BlockRef, to: BlockRef) {
    proc.block_mut(from).ops.retain(|&o| o != op);
    let insert_at = proc
        .block(to)
        .terminator()
        .map(|_| 0)
        .unwrap_or_else(|| proc.block(to).ops.len());
    proc.block_mut(to).ops.insert(insert_at, op);
    proc.op_mut(op).block = to;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpData, Opcode, Type};

    #[test]
    fn pure_op_sinks_into_its_sole_consuming_successor() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let succ = proc.make_block();

        let a = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 1 }, Type::Int)
            .unwrap();
        let b = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 2 }, Type::Int)
            .unwrap();
        let sum = proc
            .push_op(entry, Opcode::Iadd, OpData::Binary { args: [a, b] }, Type::Int)
            .unwrap();
        proc.push_op(entry, Opcode::Jmp, OpData::Jump { target: succ }, Type::None)
            .unwrap();
        proc.push_op(
            succ,
            Opcode::Iret,
            OpData::Return { arg: Some(sum) },
            Type::None,
        )
        .unwrap();

        dominator::compute(&mut proc);
        crate::liveness::livescan(&mut proc);
        run(&mut proc);

        assert!(proc.block(succ).ops.contains(&sum));
        assert!(!proc.block(entry).ops.contains(&sum));
    }
}
