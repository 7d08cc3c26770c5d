//! Dead code elimination (spec §4.4.1).

use crate::dominator;
use crate::flowgraph;
use crate::ir::{BlockRef, Op, OpData, Opcode, Procedure};
use std::collections::HashSet;

/// Run one DCE pass: jump-thread trivial blocks, collapse degenerate
/// conditional jumps, propagate degenerate phis, sweep dead ops, then
/// recompute come-from and dominator chains. Returns whether anything
/// changed.
pub fn run(proc: &mut Procedure) -> bool {
    let mut changed = false;
    changed |= jump_thread(proc);
    changed |= collapse_degenerate_conditionals(proc);
    changed |= propagate_degenerate_phis(proc);
    changed |= sweep_dead_ops(proc);
    dominator::compute(proc);
    changed
}

/// A successor whose first (only) op is an unconditional `jmp` is replaced
/// by its target, with phi sources of the intermediate block rerouted
/// (spec §4.4.1 "Jump-threading").
fn jump_thread(proc: &mut Procedure) -> bool {
    let mut changed = false;
    let blocks: Vec<BlockRef> = proc.block_keys().collect();

    for b in blocks {
        let Some(term) = proc.block(b).terminator() else {
            continue;
        };
        let targets = proc.op(term).targets().to_vec();
        let mut new_targets = targets.clone();
        let mut any = false;

        for (i, &t) in targets.iter().enumerate() {
            if proc.block(t).phis.is_empty() {
                if let Some(&only_op) = proc.block(t).ops.first() {
                    if proc.block(t).ops.len() == 1 && proc.op(only_op).opcode == Opcode::Jmp {
                        if let OpData::Jump { target } = proc.op(only_op).data {
                            if target != t {
                                new_targets[i] = target;
                                any = true;
                            }
                        }
                    }
                }
            }
        }

        if any {
            proc.op_mut(term).targets_mut().copy_from_slice(&new_targets);
            changed = true;
        }
    }

    changed
}

/// Collapse `jz/jnz cond L L` to `jmp L` (spec §4.4.1).
fn collapse_degenerate_conditionals(proc: &mut Procedure) -> bool {
    let mut changed = false;
    let blocks: Vec<BlockRef> = proc.block_keys().collect();
    for b in blocks {
        let Some(term) = proc.block(b).terminator() else {
            continue;
        };
        let rec = proc.op(term);
        if matches!(rec.opcode, Opcode::Jz | Opcode::Jnz) {
            if let OpData::Branch1 { targets, .. } = rec.data {
                if targets[0] == targets[1] {
                    let target = targets[0];
                    let block = rec.block;
                    let ty = rec.ty;
                    *proc.op_mut(term) = crate::ir::OpRecord::new(
                        Opcode::Jmp,
                        block,
                        OpData::Jump { target },
                        ty,
                        proc.op(term).mem_tag,
                    );
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Propagate degenerate phis (a single unique alternative) to their uses,
/// iterating with use-count decrements so newly-dead ops are found too
/// (spec §4.4.1).
fn propagate_degenerate_phis(proc: &mut Procedure) -> bool {
    let mut changed = false;
    let mut progress = true;
    while progress {
        progress = false;
        let blocks: Vec<BlockRef> = proc.block_keys().collect();
        for b in blocks {
            let degenerate: Vec<(Op, Op)> = proc
                .block(b)
                .phis
                .iter()
                .filter_map(|phi| {
                    let mut uniq: Vec<Op> =
                        phi.alternatives.iter().map(|a| a.source_value).collect();
                    uniq.sort_by_key(|o| bjit_entity::EntityRef::index(*o));
                    uniq.dedup();
                    if uniq.len() == 1 && uniq[0] != phi.dest {
                        Some((phi.dest, uniq[0]))
                    } else {
                        None
                    }
                })
                .collect();

            if degenerate.is_empty() {
                continue;
            }

            for (dest, replacement) in &degenerate {
                rename_all_uses(proc, *dest, *replacement);
                proc.delete_op(*dest);
                progress = true;
                changed = true;
            }
            proc.block_mut(b)
                .phis
                .retain(|phi| !degenerate.iter().any(|(d, _)| *d == phi.dest));
        }
    }
    changed
}

/// Replace every reference to `from` (op inputs and phi alternatives) with
/// `to`, across the whole procedure. Shared with `opt::fold`'s identity
/// eliminations, which rename to an existing value rather than introduce a
/// `rename` op pre-RA.
pub(crate) fn rename_all_uses(proc: &mut Procedure, from: Op, to: Op) {
    let op_ids: Vec<Op> = proc.op_keys().collect();
    for o in op_ids {
        proc.op_mut(o).for_each_input_mut(|i| {
            if *i == from {
                *i = to;
            }
        });
    }
    let blocks: Vec<BlockRef> = proc.block_keys().collect();
    for b in blocks {
        for phi in proc.block_mut(b).phis.iter_mut() {
            for alt in phi.alternatives.iter_mut() {
                if alt.source_value == from {
                    alt.source_value = to;
                }
            }
        }
    }
}

/// Sweep ops with zero uses and no side effects, turning them into `nop`.
/// `nop` is the universal tombstone (spec §4.4.1).
fn sweep_dead_ops(proc: &mut Procedure) -> bool {
    crate::liveness::livescan(proc);

    let mut changed = false;
    let live_blocks: HashSet<BlockRef> = flowgraph::live_blocks(proc).into_iter().collect();

    let op_ids: Vec<Op> = proc.op_keys().collect();
    for o in op_ids {
        let rec = proc.op(o);
        if rec.is_nop() {
            continue;
        }
        if !live_blocks.contains(&rec.block) {
            proc.delete_op(o);
            changed = true;
            continue;
        }
        if rec.opcode.info().has_side_effects || rec.opcode.is_terminator() {
            continue;
        }
        if rec.nuse == 0 {
            let block = rec.block;
            proc.delete_op(o);
            proc.block_mut(block).ops.retain(|&x| x != o);
            changed = true;
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpData, Type};

    #[test]
    fn unused_pure_op_is_removed() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let _dead = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 1 }, Type::Int)
            .unwrap();
        proc.push_op(entry, Opcode::IretI, OpData::ReturnImm { imm: 0 }, Type::None)
            .unwrap();
        dominator::compute(&mut proc);
        run(&mut proc);
        assert!(proc.block(entry).ops.iter().all(|&o| !proc.op(o).is_nop()));
    }

    #[test]
    fn degenerate_jz_collapses_to_jmp() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let target = proc.make_block();
        let cond = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 0 }, Type::Int)
            .unwrap();
        proc.push_op(
            entry,
            Opcode::Jz,
            OpData::Branch1 {
                arg: cond,
                targets: [target, target],
            },
            Type::None,
        )
        .unwrap();
        proc.push_op(target, Opcode::IretI, OpData::ReturnImm { imm: 0 }, Type::None)
            .unwrap();
        dominator::compute(&mut proc);
        run(&mut proc);
        let term = proc.block(entry).terminator().unwrap();
        assert_eq!(proc.op(term).opcode, Opcode::Jmp);
    }
}
