//! Register allocation (spec §4.5).
//!
//! A single forward pass over `binemit::schedule_blocks`'s order, rather
//! than an iterative-with-backtracking scan: every block starts with
//! an empty register file (no cross-block register continuity is assumed),
//! any value still needed once its defining block ends is given a stack
//! congruence class and written through to it at the point it is produced,
//! and a later block that needs it materializes a fresh `reload` the first
//! time it is referenced. A block's phis are assigned their registers ahead
//! of time, independently of visitation order (`assign_phi_registers`), so
//! that whichever predecessor is processed first or last emits the same
//! contract: land its phi's source value in that fixed register (or its
//! slot) before jumping. `jmp`'s single successor is the only terminator
//! that ever needs this reconciliation — the two-target branch opcodes'
//! immediate targets never merge, because `dominator::split_critical_edges`
//! has already interposed a single-predecessor edge block wherever one
//! would.
//!
//! This assumes a block's live phi count never exceeds its class's
//! register file; a production-scale input with wider merges would need
//! an overflow path this allocator does not provide.

pub mod diversion;
pub mod register_set;

use crate::ir::{BlockRef, Op, OpData, Opcode, Procedure, RegUnit, Type};
use crate::isa::{RegConstraint, TargetIsa};
use crate::result::BjitResult;
use diversion::{EdgeShuffle, ShuffleStep};
use register_set::{RegClass, RegisterMask};
use std::collections::{HashMap, HashSet};

/// Run register allocation over every live block of `proc` for `isa`,
/// leaving every op with a register (and, where it outlives its own block,
/// a stack congruence class) per spec §4.5. Sets `Procedure::used_regs`,
/// `Procedure::spill_slots`, and `Procedure::ra_complete`.
pub fn allocate(proc: &mut Procedure, isa: &dyn TargetIsa) -> BjitResult<()> {
    crate::liveness::livescan(proc);

    let cross_block: HashSet<Op> = proc
        .block_keys()
        .filter(|&b| proc.block(b).flags.live)
        .flat_map(|b| proc.block(b).live_in.clone())
        .collect();

    assign_phi_registers(isa, proc);

    let mut ctx = Ctx {
        loc: HashMap::new(),
        owner: HashMap::new(),
        remaining: proc.op_keys().map(|o| (o, proc.op(o).nuse)).collect(),
        scc_of: HashMap::new(),
        free_sccs: Vec::new(),
        next_scc: 0,
        used_regs: 0,
        free: RegisterMask::EMPTY,
    };

    let order = crate::binemit::schedule_blocks(proc);
    for b in order {
        allocate_block(&mut ctx, isa, proc, &cross_block, b)?;
    }

    proc.used_regs = ctx.used_regs;
    proc.spill_slots = ctx.next_scc;
    proc.ra_complete = true;

    crate::sanity::check_post_ra(proc)
}

/// Per-procedure allocator state threaded through the block walk. `loc` and
/// `owner` are reset at every block boundary (spec simplification above);
/// `remaining`, `scc_of`, and the slot counters persist across the whole
/// procedure, since a value's congruence class must stay stable everywhere
/// it is read back.
struct Ctx {
    /// Value -> register currently holding it, valid only within the block
    /// presently being processed.
    loc: HashMap<Op, RegUnit>,
    /// Register -> value currently occupying it (the reverse of `loc`).
    owner: HashMap<RegUnit, Op>,
    /// Uses of each value not yet consumed by the walk (seeded from the
    /// liveness pass's `nuse`, decremented as each use is resolved).
    remaining: HashMap<Op, u32>,
    /// Value -> stack congruence class, once one has been assigned.
    scc_of: HashMap<Op, u32>,
    /// Congruence classes whose last value has gone dead, free for reuse.
    free_sccs: Vec<u32>,
    /// One past the highest congruence class ever handed out.
    next_scc: u32,
    /// Registers ever assigned, for the prologue/epilogue's callee-save set.
    used_regs: u64,
    /// Registers free for the block currently being processed.
    free: RegisterMask,
}

/// Assign every block's phis a register up front, independently of which
/// predecessor reaches them first or last (spec §4.5.2 "phi reintroduction"
/// reduced to per-block round robin; see module doc).
fn assign_phi_registers(isa: &dyn TargetIsa, proc: &mut Procedure) {
    let gp: Vec<RegUnit> = isa.gp_registers().iter().collect();
    let fp: Vec<RegUnit> = isa.fp_registers().iter().collect();

    for b in proc.block_keys() {
        if !proc.block(b).flags.live {
            continue;
        }
        let mut gp_i = 0usize;
        let mut fp_i = 0usize;
        let dests: Vec<Op> = proc.block(b).phis.iter().map(|p| p.dest).collect();
        for dest in dests {
            let is_float = matches!(proc.op(dest).ty, Type::F32 | Type::F64);
            let r = if is_float {
                if fp.is_empty() {
                    continue;
                }
                let r = fp[fp_i % fp.len()];
                fp_i += 1;
                r
            } else {
                if gp.is_empty() {
                    continue;
                }
                let r = gp[gp_i % gp.len()];
                gp_i += 1;
                r
            };
            proc.op_mut(dest).reg = Some(r);
        }
    }
}

fn class_mask(isa: &dyn TargetIsa, class: RegClass) -> RegisterMask {
    match class {
        RegClass::Gp => isa.gp_registers(),
        RegClass::Fp => isa.fp_registers(),
    }
}

/// Create a fresh op appended to `proc`'s arena without disturbing `block`'s
/// own op order (`Procedure::push_op` always appends to the block; the
/// caller is mid-way through rebuilding that order itself, see
/// `allocate_block`).
fn new_synth_op(proc: &mut Procedure, block: BlockRef, opcode: Opcode, data: OpData, ty: Type) -> BjitResult<Op> {
    let id = proc.push_op(block, opcode, data, ty)?;
    proc.block_mut(block).ops.pop();
    Ok(id)
}

/// Guarantee `value` has a congruence class, assigning a fresh (or reused)
/// one if it does not, and mark it to be stored at the point it is defined.
fn ensure_spilled(ctx: &mut Ctx, proc: &mut Procedure, value: Op) -> u32 {
    if let Some(&slot) = ctx.scc_of.get(&value) {
        proc.op_mut(value).scc = Some(slot);
        proc.op_mut(value).spill = true;
        return slot;
    }
    let slot = ctx.free_sccs.pop().unwrap_or_else(|| {
        let s = ctx.next_scc;
        ctx.next_scc += 1;
        s
    });
    ctx.scc_of.insert(value, slot);
    proc.op_mut(value).scc = Some(slot);
    proc.op_mut(value).spill = true;
    slot
}

/// Record that one use of `value` has just been resolved; free its slot for
/// reuse once nothing references it again.
fn consume_use(ctx: &mut Ctx, value: Op) {
    if let Some(n) = ctx.remaining.get_mut(&value) {
        if *n > 0 {
            *n -= 1;
        }
        if *n == 0 {
            if let Some(slot) = ctx.scc_of.remove(&value) {
                ctx.free_sccs.push(slot);
            }
        }
    }
}

/// Evict the owner of `r`, spilling it first if it is still needed.
fn evict(ctx: &mut Ctx, proc: &mut Procedure, r: RegUnit) {
    if let Some(victim) = ctx.owner.remove(&r) {
        ctx.loc.remove(&victim);
        if ctx.remaining.get(&victim).copied().unwrap_or(0) > 0 {
            ensure_spilled(ctx, proc, victim);
        }
    }
}

/// Find a register in `mask` (narrowed to `class`'s bank), evicting its
/// current occupant — preferring one already dead — if none is free.
fn pick_or_evict(ctx: &mut Ctx, isa: &dyn TargetIsa, proc: &mut Procedure, class: RegClass, mask: RegisterMask) -> RegUnit {
    let candidates = mask.intersect(class_mask(isa, class));
    if let Some(r) = candidates.intersect(ctx.free).first() {
        return r;
    }
    let dead = candidates
        .iter()
        .find(|r| ctx.owner.get(r).map_or(false, |v| ctx.remaining.get(v).copied().unwrap_or(0) == 0));
    let r = dead
        .or_else(|| candidates.iter().next())
        .expect("a register constraint always intersects its class's register file");
    evict(ctx, proc, r);
    r
}

/// Ensure `value` is in a register satisfying `constraint`, inserting a
/// `rename` (if it is already in some other register) or a `reload` (if it
/// is only in memory) as needed. Returns the op whose register now holds
/// it — the original op if it was already correctly placed, or the
/// synthetic rename/reload otherwise — so the caller can rewrite whichever
/// op referenced `value` to read from it instead.
fn ensure_in_register(
    ctx: &mut Ctx,
    isa: &dyn TargetIsa,
    proc: &mut Procedure,
    block: BlockRef,
    new_ops: &mut Vec<Op>,
    value: Op,
    constraint: RegConstraint,
) -> BjitResult<Op> {
    if let Some(&r) = ctx.loc.get(&value) {
        if constraint.mask.contains(r) {
            consume_use(ctx, value);
            return Ok(value);
        }
    }

    let r = pick_or_evict(ctx, isa, proc, constraint.class, constraint.mask);
    let ty = proc.op(value).ty;

    let new_op = if let Some(&cur) = ctx.loc.get(&value) {
        let id = new_synth_op(proc, block, Opcode::Rename, OpData::Unary { arg: value }, ty)?;
        ctx.owner.remove(&cur);
        ctx.free.insert(cur);
        id
    } else {
        let slot = ensure_spilled(ctx, proc, value);
        let id = new_synth_op(proc, block, Opcode::Reload, OpData::Reload, ty)?;
        proc.op_mut(id).scc = Some(slot);
        id
    };

    proc.op_mut(new_op).reg = Some(r);
    new_ops.push(new_op);
    ctx.owner.insert(r, value);
    ctx.loc.insert(value, r);
    ctx.free.remove(r);
    ctx.used_regs |= 1u64 << r;
    consume_use(ctx, value);
    Ok(new_op)
}

/// Allocate every op of `b`, in place, then (for a plain `jmp`) reconcile
/// its outgoing edge's phi registers.
fn allocate_block(ctx: &mut Ctx, isa: &dyn TargetIsa, proc: &mut Procedure, cross_block: &HashSet<Op>, b: BlockRef) -> BjitResult<()> {
    ctx.loc.clear();
    ctx.owner.clear();
    ctx.free = isa.gp_registers().union(isa.fp_registers());

    let snapshot = proc.block(b).ops.clone();
    let mut new_ops: Vec<Op> = Vec::with_capacity(snapshot.len());

    for op in snapshot {
        if proc.op(op).is_nop() {
            continue;
        }

        if proc.op(op).opcode == Opcode::Phi {
            let r = proc
                .op(op)
                .reg
                .expect("assign_phi_registers runs before the block walk");
            evict(ctx, proc, r);
            ctx.free.remove(r);
            ctx.owner.insert(r, op);
            ctx.loc.insert(op, r);
            ctx.used_regs |= 1u64 << r;
            ctx.remaining.entry(op).or_insert_with(|| proc.op(op).nuse);
            if cross_block.contains(&op) {
                ensure_spilled(ctx, proc, op);
            }
            new_ops.push(op);
            continue;
        }

        let constraints = isa.constraints(proc, op);

        let mut inputs = Vec::new();
        proc.op(op).for_each_input(|i| inputs.push(i));
        let mut replacements = Vec::with_capacity(inputs.len());
        for (i, inp) in inputs.into_iter().enumerate() {
            let constraint = constraints
                .inputs
                .get(i)
                .copied()
                .unwrap_or_else(|| RegConstraint::any(RegClass::Gp));
            replacements.push(ensure_in_register(ctx, isa, proc, b, &mut new_ops, inp, constraint)?);
        }
        let mut it = replacements.into_iter();
        proc.op_mut(op).for_each_input_mut(|slot| {
            if let Some(r) = it.next() {
                *slot = r;
            }
        });

        if !constraints.clobbers.is_empty() {
            let clobbered: Vec<RegUnit> = constraints.clobbers.intersect(ctx.free.complement()).iter().collect();
            for r in clobbered {
                evict(ctx, proc, r);
                ctx.free.insert(r);
            }
        }

        if let Some(out) = constraints.output {
            let r = if out.mask.len() == 1 {
                let want = out.mask.first().expect("a single-bit mask has a member");
                evict(ctx, proc, want);
                want
            } else {
                pick_or_evict(ctx, isa, proc, out.class, out.mask)
            };
            ctx.free.remove(r);
            proc.op_mut(op).reg = Some(r);
            ctx.owner.insert(r, op);
            ctx.loc.insert(op, r);
            ctx.used_regs |= 1u64 << r;
            ctx.remaining.entry(op).or_insert_with(|| proc.op(op).nuse);
            if cross_block.contains(&op) {
                ensure_spilled(ctx, proc, op);
            }
        }

        new_ops.push(op);
    }

    if let Some(&term) = new_ops.last() {
        if proc.op(term).opcode == Opcode::Jmp {
            if let OpData::Jump { target } = proc.op(term).data {
                reconcile_edge(ctx, proc, b, target, &mut new_ops)?;
            }
        }
    }

    proc.block_mut(b).ops = new_ops;
    proc.block_mut(b).flags.regs_done = true;
    Ok(())
}

/// Reconcile `from`'s register state with `to`'s phis (spec §4.5.5): build
/// the permutation implied by each phi's alternative from `from`, resolve it
/// with `diversion::EdgeShuffle`, and splice the resulting renames/reloads
/// in just before `from`'s terminator.
fn reconcile_edge(
    ctx: &mut Ctx,
    proc: &mut Procedure,
    from: BlockRef,
    to: BlockRef,
    new_ops: &mut Vec<Op>,
) -> BjitResult<()> {
    let mut shuffle = EdgeShuffle::new();
    let mut reload_only: Vec<(u32, RegUnit)> = Vec::new();

    for phi in proc.block(to).phis.clone() {
        let src = match phi.alternative_from(from) {
            Some(s) => s,
            None => continue,
        };
        let dest_reg = proc
            .op(phi.dest)
            .reg
            .expect("assign_phi_registers runs before any edge is reconciled");
        if let Some(&cur) = ctx.loc.get(&src) {
            shuffle.add(cur, dest_reg);
        } else {
            let slot = ensure_spilled(ctx, proc, src);
            reload_only.push((slot, dest_reg));
        }
    }

    let term = new_ops.pop().expect("allocate_block only reconciles a terminated block");

    let steps = shuffle.resolve(|| {
        ctx.free_sccs.pop().unwrap_or_else(|| {
            let s = ctx.next_scc;
            ctx.next_scc += 1;
            s
        })
    });

    for step in steps {
        match step {
            ShuffleStep::Move { from: fr, to: dst } => {
                let value = *ctx.owner.get(&fr).expect("a move's source register is tracked");
                let ty = proc.op(value).ty;
                let id = new_synth_op(proc, from, Opcode::Rename, OpData::Unary { arg: value }, ty)?;
                proc.op_mut(id).reg = Some(dst);
                new_ops.push(id);
                ctx.owner.remove(&fr);
                ctx.owner.insert(dst, value);
                ctx.loc.insert(value, dst);
                ctx.used_regs |= 1u64 << dst;
            }
            ShuffleStep::SpillToScratch { from: fr, slot } => {
                let value = *ctx.owner.get(&fr).expect("a spill's source register is tracked");
                let real_slot = ctx.scc_of.get(&value).copied().unwrap_or(slot);
                proc.op_mut(value).scc = Some(real_slot);
                proc.op_mut(value).spill = true;
                ctx.scc_of.insert(value, real_slot);
                if real_slot != slot {
                    ctx.free_sccs.push(slot);
                }
            }
            ShuffleStep::ReloadFromScratch { slot, to: dst } => {
                let value = ctx.scc_of.iter().find(|&(_, &s)| s == slot).map(|(&v, _)| v);
                let ty = value.map(|v| proc.op(v).ty).unwrap_or(Type::Int);
                let id = new_synth_op(proc, from, Opcode::Reload, OpData::Reload, ty)?;
                proc.op_mut(id).scc = Some(slot);
                proc.op_mut(id).reg = Some(dst);
                new_ops.push(id);
                if let Some(v) = value {
                    ctx.owner.insert(dst, v);
                    ctx.loc.insert(v, dst);
                }
                ctx.used_regs |= 1u64 << dst;
            }
        }
    }

    for (slot, dest_reg) in reload_only {
        let id = new_synth_op(proc, from, Opcode::Reload, OpData::Reload, Type::Int)?;
        proc.op_mut(id).scc = Some(slot);
        proc.op_mut(id).reg = Some(dest_reg);
        new_ops.push(id);
    }

    new_ops.push(term);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpData, Opcode, Procedure, Type as IrType};
    use crate::isa::x86::X86Isa;
    use crate::Flags;

    fn isa() -> X86Isa {
        X86Isa::new(&target_lexicon::Triple::host())
    }

    #[test]
    fn straight_line_arithmetic_gets_registers() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let a = proc.push_op(entry, Opcode::Lci, OpData::Const64 { bits: 2 }, IrType::Int).unwrap();
        let b = proc.push_op(entry, Opcode::Lci, OpData::Const64 { bits: 3 }, IrType::Int).unwrap();
        let sum = proc
            .push_op(entry, Opcode::Iadd, OpData::Binary { args: [a, b] }, IrType::Int)
            .unwrap();
        proc.push_op(entry, Opcode::Iret, OpData::Return { arg: Some(sum) }, IrType::None)
            .unwrap();

        crate::dominator::compute(&mut proc);
        crate::opt::optimize(&mut proc, &Flags::default());
        allocate(&mut proc, &isa()).unwrap();

        assert!(proc.ra_complete);
        assert!(proc.op(sum).is_nop() || proc.op(sum).reg.is_some());
    }

    #[test]
    fn value_live_across_a_jump_is_spilled_and_reloaded() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let c = proc.push_op(entry, Opcode::Lci, OpData::Const64 { bits: 9 }, IrType::Int).unwrap();
        let next = proc.make_block();
        proc.push_op(entry, Opcode::Jmp, OpData::Jump { target: next }, IrType::None)
            .unwrap();
        proc.push_op(next, Opcode::Iret, OpData::Return { arg: Some(c) }, IrType::None)
            .unwrap();

        crate::dominator::compute(&mut proc);
        allocate(&mut proc, &isa()).unwrap();

        assert!(proc.ra_complete);
    }
}
