//! Come-from (control-flow-graph) reconstruction (spec §4.2).
//!
//! Grounded on cranelift-codegen's `flowgraph.rs` shape (a CFG rebuilt by
//! scanning terminators), but without `cranelift-bforest`: bjit's come-from
//! sets are small and fixed-arity (every terminator has at most two
//! targets) and are rebuilt wholesale by every pass that changes control
//! flow, so a persistent forest's sharing never pays for itself here (see
//! DESIGN.md).

use crate::ir::{BlockRef, Procedure};

/// Recompute every live block's come-from list and BFS-reachability from
/// the entry block, clearing `live` on anything unreached (spec §4.2,
/// §4.4.1 "Clears `live` on all blocks; starts BFS from block 0").
///
/// Returns the blocks visited, in BFS order, for callers (DCE, liveness)
/// that want a traversal order without recomputing it themselves.
pub fn recompute(proc: &mut Procedure) -> Vec<BlockRef> {
    for b in proc.block_keys() {
        proc.block_mut(b).come_from.clear();
        proc.block_mut(b).flags.live = false;
    }

    let entry = proc.entry_block();
    let mut order = Vec::new();
    let mut worklist = vec![entry];
    proc.block_mut(entry).flags.live = true;

    while let Some(b) = worklist.pop() {
        order.push(b);
        let targets: Vec<BlockRef> = proc
            .block(b)
            .terminator()
            .map(|t| proc.op(t).targets().to_vec())
            .unwrap_or_default();
        for t in targets {
            if !proc.block(t).come_from.contains(&b) {
                proc.block_mut(t).come_from.push(b);
            }
            if !proc.block(t).flags.live {
                proc.block_mut(t).flags.live = true;
                worklist.push(t);
            }
        }
    }

    order
}

/// All live blocks in arena order (not necessarily reachability order).
pub fn live_blocks(proc: &Procedure) -> Vec<BlockRef> {
    proc.block_keys()
        .filter(|&b| proc.block(b).flags.live)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpData, Opcode, Type};

    #[test]
    fn recompute_marks_only_reachable_blocks_live() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let reachable = proc.make_block();
        let unreachable = proc.make_block();
        let _ = unreachable;

        proc.push_op(
            entry,
            Opcode::Jmp,
            OpData::Jump { target: reachable },
            Type::None,
        )
        .unwrap();
        proc.push_op(reachable, Opcode::IretI, OpData::ReturnImm { imm: 0 }, Type::None)
            .unwrap();

        recompute(&mut proc);

        assert!(proc.block(entry).flags.live);
        assert!(proc.block(reachable).flags.live);
        assert!(!proc.block(unreachable).flags.live);
        assert_eq!(proc.block(reachable).come_from, vec![entry]);
    }
}
