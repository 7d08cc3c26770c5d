//! Dominator / post-dominator tree computation and critical-edge splitting
//! (spec §4.2).

use crate::flowgraph;
use crate::ir::{BlockRef, OpData, Opcode, Procedure, Type};
use bjit_entity::EntityRef;
use std::collections::HashSet;

/// Recompute come-from, dominator chains, immediate dominators and
/// immediate post-dominators for every live block, then split critical
/// edges. Call after any pass that changes control flow.
pub fn compute(proc: &mut Procedure) {
    flowgraph::recompute(proc);
    compute_dominators(proc);
    compute_post_dominators(proc);
    split_critical_edges(proc);
    // Splitting changes the CFG, so dominance must be recomputed once more
    // against the final block set.
    flowgraph::recompute(proc);
    compute_dominators(proc);
    compute_post_dominators(proc);
}

/// Forward dominator sets are the least fixed point of:
/// `dom(entry) = {entry}`, `dom(b) = {b} ∪ ⋂_{p∈comeFrom(b)} dom(p)`.
fn compute_dominators(proc: &mut Procedure) {
    let entry = proc.entry_block();
    let live = flowgraph::live_blocks(proc);

    let mut dom_sets: std::collections::HashMap<BlockRef, HashSet<BlockRef>> =
        std::collections::HashMap::new();
    for &b in &live {
        if b == entry {
            let mut s = HashSet::new();
            s.insert(entry);
            dom_sets.insert(b, s);
        } else {
            dom_sets.insert(b, live.iter().copied().collect());
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &live {
            if b == entry {
                continue;
            }
            let preds = proc.block(b).come_from.clone();
            let mut new_set: Option<HashSet<BlockRef>> = None;
            for p in &preds {
                let pdom = dom_sets.get(p).cloned().unwrap_or_default();
                new_set = Some(match new_set {
                    None => pdom,
                    Some(acc) => acc.intersection(&pdom).copied().collect(),
                });
            }
            let mut new_set = new_set.unwrap_or_default();
            new_set.insert(b);
            if dom_sets.get(&b) != Some(&new_set) {
                dom_sets.insert(b, new_set);
                changed = true;
            }
        }
    }

    for &b in &live {
        let idom = immediate_dominator(&dom_sets, b);
        let chain = dominator_chain(&dom_sets, b);
        proc.block_mut(b).idom = idom;
        proc.block_mut(b).dom_chain = chain;
    }
}

/// The immediate dominator of `b` is the unique dominator whose own
/// dominator set has one fewer element than `b`'s (spec §4.2).
fn immediate_dominator(
    dom_sets: &std::collections::HashMap<BlockRef, HashSet<BlockRef>>,
    b: BlockRef,
) -> Option<BlockRef> {
    let set = &dom_sets[&b];
    if set.len() <= 1 {
        return None;
    }
    set.iter()
        .copied()
        .find(|&d| d != b && dom_sets[&d].len() + 1 == set.len())
}

/// Root-to-`b` dominator chain, ascending by dominator-set size so the
/// entry block comes first and `b` itself comes last (spec §4.2: used for
/// lexicographic closest-common-dominator lookup in CSE).
fn dominator_chain(
    dom_sets: &std::collections::HashMap<BlockRef, HashSet<BlockRef>>,
    b: BlockRef,
) -> Vec<BlockRef> {
    let set = &dom_sets[&b];
    let mut chain: Vec<BlockRef> = set.iter().copied().collect();
    chain.sort_by_key(|d| dom_sets[d].len());
    chain
}

/// Post-dominator sets: the symmetric computation over the reversed CFG,
/// with an implicit virtual exit node unifying all terminator blocks (spec
/// §4.2). Since bjit has no explicit exit block, "post-dominates" is
/// computed directly over the set of terminator-owning (return/tail-call)
/// blocks as multiple roots.
fn compute_post_dominators(proc: &mut Procedure) {
    let live = flowgraph::live_blocks(proc);
    let exits: Vec<BlockRef> = live
        .iter()
        .copied()
        .filter(|&b| {
            proc.block(b)
                .terminator()
                .map(|t| is_exit_terminator(proc.op(t).opcode))
                .unwrap_or(false)
        })
        .collect();

    let successors: std::collections::HashMap<BlockRef, Vec<BlockRef>> = live
        .iter()
        .map(|&b| {
            let succs = proc
                .block(b)
                .terminator()
                .map(|t| proc.op(t).targets().to_vec())
                .unwrap_or_default();
            (b, succs)
        })
        .collect();

    let mut pdom_sets: std::collections::HashMap<BlockRef, HashSet<BlockRef>> =
        std::collections::HashMap::new();
    for &b in &live {
        if exits.contains(&b) {
            let mut s = HashSet::new();
            s.insert(b);
            pdom_sets.insert(b, s);
        } else {
            pdom_sets.insert(b, live.iter().copied().collect());
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &live {
            if exits.contains(&b) {
                continue;
            }
            let succs = &successors[&b];
            let mut new_set: Option<HashSet<BlockRef>> = None;
            for s in succs {
                let sdom = pdom_sets.get(s).cloned().unwrap_or_default();
                new_set = Some(match new_set {
                    None => sdom,
                    Some(acc) => acc.intersection(&sdom).copied().collect(),
                });
            }
            let mut new_set = new_set.unwrap_or_else(|| live.iter().copied().collect());
            new_set.insert(b);
            if pdom_sets.get(&b) != Some(&new_set) {
                pdom_sets.insert(b, new_set);
                changed = true;
            }
        }
    }

    for &b in &live {
        let set = &pdom_sets[&b];
        let mut candidates: Vec<BlockRef> =
            set.iter().copied().filter(|&d| d != b).collect();
        candidates.sort_by_key(|d| core::cmp::Reverse(pdom_sets[d].len()));
        proc.block_mut(b).ipdom = candidates.into_iter().next();
    }
}

fn is_exit_terminator(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Iret
            | Opcode::Fret
            | Opcode::Dret
            | Opcode::IretI
            | Opcode::Tcallp
            | Opcode::TcallnI
    )
}

/// Split every critical edge (from a block with multiple successors into a
/// block with multiple predecessors) by introducing a fresh block whose
/// only op is a `jmp` to the original target (spec §4.2).
fn split_critical_edges(proc: &mut Procedure) {
    let live = flowgraph::live_blocks(proc);
    let mut edits: Vec<(BlockRef, usize, BlockRef)> = Vec::new();

    for &b in &live {
        let Some(term) = proc.block(b).terminator() else {
            continue;
        };
        let targets = proc.op(term).targets().to_vec();
        if targets.len() < 2 {
            continue;
        }
        for (i, &t) in targets.iter().enumerate() {
            let multi_pred = proc.block(t).come_from.len() > 1;
            if multi_pred {
                edits.push((b, i, t));
            }
        }
    }

    for (from, target_index, original_target) in edits {
        let fresh = proc.make_block();
        proc.push_op(
            fresh,
            Opcode::Jmp,
            OpData::Jump {
                target: original_target,
            },
            Type::None,
        )
        .expect("critical-edge split jmp cannot overflow the op arena right after a DCE pass");

        let term = proc.block(from).terminator().expect("checked above");
        proc.op_mut(term).targets_mut()[target_index] = fresh;

        for phi in proc.block_mut(original_target).phis.iter_mut() {
            for alt in phi.alternatives.iter_mut() {
                if alt.source_block == from {
                    alt.source_block = fresh;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    #[test]
    fn entry_block_has_no_immediate_dominator() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        proc.push_op(entry, Opcode::IretI, OpData::ReturnImm { imm: 0 }, Type::None)
            .unwrap();
        compute(&mut proc);
        assert_eq!(proc.block(entry).idom, None);
    }

    #[test]
    fn linear_chain_each_block_dominated_by_predecessor() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let mid = proc.make_block();
        let exit = proc.make_block();
        proc.push_op(entry, Opcode::Jmp, OpData::Jump { target: mid }, Type::None)
            .unwrap();
        proc.push_op(mid, Opcode::Jmp, OpData::Jump { target: exit }, Type::None)
            .unwrap();
        proc.push_op(exit, Opcode::IretI, OpData::ReturnImm { imm: 0 }, Type::None)
            .unwrap();
        compute(&mut proc);
        assert_eq!(proc.block(mid).idom, Some(entry));
        assert_eq!(proc.block(exit).idom, Some(mid));
    }
}
