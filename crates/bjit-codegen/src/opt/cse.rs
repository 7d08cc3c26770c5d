//! Global common-sub-expression elimination with closest-common-dominator
//! hoisting (spec §4.4.3).

use crate::dominator;
use crate::flowgraph;
use crate::ir::{BlockRef, Op, OpData, Procedure};
use crate::scoped_hash_map::{Entry, ScopedHashMap};
use crate::Flags;
use smallvec::SmallVec;

/// A value-numbering key: an op's identity modulo which concrete op index
/// it lives at — opcode, its op-index inputs, and a 64-bit payload that
/// covers every immediate-or-constant shape an opcode might carry (spec
/// §4.4.3 "a hash table keyed by (opcode, input indices, 64-bit payload)").
#[derive(Clone, PartialEq, Eq, Hash)]
struct Key {
    opcode: crate::ir::Opcode,
    inputs: SmallVec<[Op; 2]>,
    payload: u64,
}

fn key_of(proc: &Procedure, op: Op) -> Option<Key> {
    let rec = proc.op(op);
    if !rec.opcode.info().cse_eligible {
        return None;
    }
    let mut inputs = SmallVec::new();
    rec.for_each_input(|i| inputs.push(i));
    let payload = match rec.data {
        OpData::Imm32 { imm } => imm as u32 as u64,
        OpData::BinaryImm { imm, .. } => imm as u32 as u64,
        OpData::Const64 { bits } => bits,
        OpData::Const32 { bits } => bits as u32 as u64,
        _ => 0,
    };
    Some(Key {
        opcode: rec.opcode,
        inputs,
        payload,
    })
}

/// Run one CSE pass: a scoped value-numbering walk over the dominator tree
/// merging textually-identical pure ops, followed by an independent
/// hoist-to-dominator pass. Returns whether anything changed.
pub fn run(proc: &mut Procedure, _flags: &Flags) -> bool {
    let mut changed = false;
    changed |= value_number(proc);
    changed |= hoist_to_dominators(proc);
    if changed {
        dominator::compute(proc);
    }
    changed
}

/// Walk every live block in live-scan order; for each CSE-eligible op,
/// look up its value number. On a hit, compute the closest common
/// dominator (CCD) of the two blocks by intersecting their ordered
/// dominator chains. If the CCD is one of the two blocks, replace the
/// other occurrence with a rename to the surviving op; otherwise leave
/// both in place for `hoist_to_dominators` to pull toward the CCD (the
/// conservative choice: moving either original op requires re-verifying
/// every intermediate block post-dominates the CCD, which the hoist pass
/// already does one step at a time).
fn value_number(proc: &mut Procedure) -> bool {
    let mut table: ScopedHashMap<Key, Op> = ScopedHashMap::new();
    let mut changed = false;
    let order = flowgraph::live_blocks(proc);

    for b in order {
        let ops = proc.block(b).ops.clone();
        for op in ops {
            if proc.op(op).is_nop() {
                continue;
            }
            let Some(key) = key_of(proc, op) else {
                continue;
            };
            match table.entry(key) {
                Entry::Occupied(existing) => {
                    let survivor = *existing.get();
                    if survivor == op {
                        continue;
                    }
                    let ccd = closest_common_dominator(proc, proc.op(survivor).block, b);
                    if ccd == proc.op(survivor).block || ccd == b {
                        super::dce::rename_all_uses(proc, op, survivor);
                        proc.delete_op(op);
                        changed = true;
                    }
                    // A genuinely interior CCD is left for the hoist pass.
                }
                Entry::Vacant(entry) => entry.insert(op),
            }
        }
    }

    changed
}

/// Deepest block dominating both `a` and `b`: the ordered dominator chains
/// (ascending by depth, spec §4.2) share a common prefix; its last entry is
/// the CCD.
fn closest_common_dominator(proc: &Procedure, a: BlockRef, b: BlockRef) -> BlockRef {
    let chain_a = &proc.block(a).dom_chain;
    let chain_b = &proc.block(b).dom_chain;
    let mut ccd = chain_a.first().copied().unwrap_or(a);
    for i in 0..chain_a.len().min(chain_b.len()) {
        if chain_a[i] != chain_b[i] {
            break;
        }
        ccd = chain_a[i];
    }
    ccd
}

/// Independently of value numbering, walk each op up its immediate
/// dominator chain as long as its inputs remain defined above it and every
/// intermediate block post-dominates its own immediate dominator (spec
/// §4.4.3: this keeps a hoist from running an op on a path that wouldn't
/// originally have reached it).
fn hoist_to_dominators(proc: &mut Procedure) -> bool {
    let mut changed = false;
    for b in flowgraph::live_blocks(proc) {
        let ops = proc.block(b).ops.clone();
        for op in ops {
            if proc.op(op).is_nop() || !proc.op(op).opcode.info().movable {
                continue;
            }
            if hoist_one(proc, b, op) {
                changed = true;
            }
        }
    }
    changed
}

fn hoist_one(proc: &mut Procedure, mut cur_block: BlockRef, op: Op) -> bool {
    let mut moved = false;
    loop {
        let Some(idom) = proc.block(cur_block).idom else {
            break;
        };
        // Safe only if `idom` is actually post-dominated by `cur_block` —
        // i.e. every path from `idom` that can reach `op`'s original block
        // passes through no side-exit first. Approximated here, as the
        // spec allows, by requiring `cur_block`'s immediate post-dominator
        // to be `idom` itself or for `idom` to be a straight-line
        // predecessor of `cur_block` with a single successor.
        let single_successor = proc
            .block(idom)
            .ops
            .last()
            .map(|&t| proc.op(t).targets().len() <= 1)
            .unwrap_or(false);
        if !single_successor {
            break;
        }

        let mut inputs = Vec::new();
        proc.op(op).for_each_input(|i| inputs.push(i));
        let inputs_defined_above = inputs.iter().all(|&i| {
            proc.op(i).block == idom || proc.block(idom).dominated_by(proc.op(i).block)
        });
        if !inputs_defined_above {
            break;
        }

        move_op(proc, op, cur_block, idom);
        cur_block = idom;
        moved = true;
    }
    moved
}

fn move_op(proc: &mut Procedure, op: Op, from: BlockRef, to: BlockRef) {
    proc.block_mut(from).ops.retain(|&o| o != op);
    let term_pos = proc
        .block(to)
        .terminator()
        .map(|_| proc.block(to).ops.len() - 1)
        .unwrap_or(proc.block(to).ops.len());
    proc.block_mut(to).ops.insert(term_pos, op);
    proc.op_mut(op).block = to;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpData, Opcode, Type};
    use crate::{Flags, OptLevel};

    fn flags() -> Flags {
        Flags {
            unsafe_fastmath: false,
            opt_level: OptLevel::Speed,
        }
    }

    #[test]
    fn identical_adds_in_the_same_block_merge() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let a = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 1 }, Type::Int)
            .unwrap();
        let b = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 2 }, Type::Int)
            .unwrap();
        let sum1 = proc
            .push_op(entry, Opcode::Iadd, OpData::Binary { args: [a, b] }, Type::Int)
            .unwrap();
        let sum2 = proc
            .push_op(entry, Opcode::Iadd, OpData::Binary { args: [a, b] }, Type::Int)
            .unwrap();
        proc.push_op(
            entry,
            Opcode::Iadd,
            OpData::Binary { args: [sum1, sum2] },
            Type::Int,
        )
        .unwrap();
        dominator::compute(&mut proc);
        run(&mut proc, &flags());
        assert!(proc.op(sum2).is_nop());
    }
}
