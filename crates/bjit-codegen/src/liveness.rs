//! Liveness & use-count pass (spec §4.3).

use crate::flowgraph;
use crate::ir::{Op, Procedure};
use std::collections::HashSet;

/// Increment `nUse` on every operand referenced by any op in `b`, and on
/// every value that appears as a phi source on an out-edge of `b`. When
/// `in_only`, each block-defined output's `nUse` is reset to zero first so
/// that only truly live-in values remain counted on exit (spec §4.3).
pub fn find_uses_block(proc: &mut Procedure, b: crate::ir::BlockRef, in_only: bool) {
    let defined_here: HashSet<Op> = proc.block(b).ops.iter().copied().collect();

    if in_only {
        for &o in &proc.block(b).ops {
            proc.op_mut(o).nuse = 0;
        }
        for phi in &proc.block(b).phis {
            proc.op_mut(phi.dest).nuse = 0;
        }
    }

    let ops = proc.block(b).ops.clone();
    for o in ops {
        let mut inputs = Vec::new();
        proc.op(o).for_each_input(|i| inputs.push(i));
        for i in inputs {
            proc.op_mut(i).nuse += 1;
        }
    }

    let successors: Vec<_> = proc
        .block(b)
        .terminator()
        .map(|t| proc.op(t).targets().to_vec())
        .unwrap_or_default();
    for succ in successors {
        let sources: Vec<Op> = proc
            .block(succ)
            .phis
            .iter()
            .filter_map(|phi| phi.alternative_from(b))
            .collect();
        for src in sources {
            if !in_only || !defined_here.contains(&src) {
                proc.op_mut(src).nuse += 1;
            }
        }
    }
}

/// Run `find_uses_block` over every live block with `in_only = true` and
/// accumulate each block's live-in set until it stabilizes (spec §4.3
/// "`livescan`"). Live-in is approximated here as: any value used in the
/// block or on an out-edge phi, that is not itself defined in the block,
/// unioned with every live-in value of every successor that is itself used
/// downstream — computed by iterating to a fixed point over `nuse`.
pub fn livescan(proc: &mut Procedure) {
    let order = flowgraph::live_blocks(proc);

    // Reset use counts, then accumulate bottom-up until stable: a value is
    // live-in to `b` if it's used directly in `b`, passed as a phi source
    // on an out-edge, or is live-in to a successor and not redefined here.
    let mut changed = true;
    while changed {
        changed = false;
        for &b in order.iter().rev() {
            find_uses_block(proc, b, true);
            let defined_here: HashSet<Op> = proc.block(b).ops.iter().copied().collect();
            let mut live_in: Vec<Op> = proc
                .block(b)
                .ops
                .iter()
                .flat_map(|&o| {
                    let mut ins = Vec::new();
                    proc.op(o).for_each_input(|i| ins.push(i));
                    ins
                })
                .filter(|i| !defined_here.contains(i))
                .collect();

            let successors: Vec<_> = proc
                .block(b)
                .terminator()
                .map(|t| proc.op(t).targets().to_vec())
                .unwrap_or_default();
            for succ in &successors {
                for v in proc.block(*succ).live_in.clone() {
                    if !defined_here.contains(&v) && !live_in.contains(&v) {
                        live_in.push(v);
                    }
                }
                for phi in &proc.block(*succ).phis {
                    if let Some(src) = phi.alternative_from(b) {
                        if !defined_here.contains(&src) && !live_in.contains(&src) {
                            live_in.push(src);
                        }
                    }
                }
            }

            live_in.sort_by_key(|op| bjit_entity::EntityRef::index(*op));
            live_in.dedup();

            if proc.block(b).live_in != live_in {
                proc.block_mut(b).live_in = live_in;
                changed = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator;
    use crate::ir::{OpData, Opcode, Type};

    #[test]
    fn value_defined_before_a_loop_back_edge_stays_live_in() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let c = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 7 }, Type::Int)
            .unwrap();
        let body = proc.make_block();
        proc.push_op(entry, Opcode::Jmp, OpData::Jump { target: body }, Type::None)
            .unwrap();
        proc.push_op(
            body,
            Opcode::Iret,
            OpData::Return { arg: Some(c) },
            Type::None,
        )
        .unwrap();

        dominator::compute(&mut proc);
        livescan(&mut proc);

        assert!(proc.block(body).live_in.contains(&c));
    }
}
