//! Constant folding and strength reduction (spec §4.4.2).
//!
//! A single left-to-right pass over each live block's ops. Rewrites mutate
//! an op's record in place (its index, and therefore every existing
//! reference to it, never changes) except for identity eliminations, which
//! rename uses of the op to the surviving value and turn the op into a
//! `nop` — the same technique `opt::dce`'s degenerate-phi propagation uses.
//! A small value-number table, local to the block, lets two-constant folds
//! reuse an already-materialized constant instead of emitting a duplicate
//! (spec: "a CSE table local to the block").

use super::dce::rename_all_uses;
use crate::dominator;
use crate::flowgraph;
use crate::ir::{BlockRef, Op, OpData, OpRecord, Opcode, Procedure, Type};
use crate::Flags;
use std::collections::HashMap;

/// Run one fold/strength-reduction pass over every live block. Returns
/// whether any rewrite was made.
pub fn run(proc: &mut Procedure, flags: &Flags) -> bool {
    let mut changed = false;
    for b in flowgraph::live_blocks(proc) {
        changed |= fold_block(proc, b, flags);
    }
    if changed {
        dominator::compute(proc);
    }
    changed
}

fn fold_block(proc: &mut Procedure, b: BlockRef, flags: &Flags) -> bool {
    let mut changed = false;
    let mut local_consts: HashMap<i64, Op> = HashMap::new();
    let ops = proc.block(b).ops.clone();

    for op in ops {
        if proc.op(op).is_nop() {
            continue;
        }
        if proc.op(op).opcode == Opcode::Lci {
            if let OpData::Const64 { bits } = proc.op(op).data {
                local_consts.entry(bits as i64).or_insert(op);
            }
        }

        // Re-apply rules until this op stops changing; each individual
        // rule only ever simplifies (shrinks an immediate, folds two
        // constants into one, drops an identity operand), so this always
        // terminates well within a handful of iterations.
        for _ in 0..8 {
            let mut rule_fired = false;
            rule_fired |= canonicalize_operands(proc, op);
            rule_fired |= fold_two_constants(proc, op, &mut local_consts);
            rule_fired |= eliminate_identity(proc, op);
            rule_fired |= strength_reduce_shift(proc, op);
            rule_fired |= fuse_immediate(proc, op);
            rule_fired |= combine_consecutive_immediates(proc, op);
            if !rule_fired {
                break;
            }
            changed |= true;
        }
    }

    changed |= fuse_compare_branch(proc, b);
    changed
}

fn overwrite(proc: &mut Procedure, op: Op, opcode: Opcode, data: OpData, ty: Type) {
    let block = proc.op(op).block;
    let mem_tag = proc.op(op).mem_tag;
    *proc.op_mut(op) = OpRecord::new(opcode, block, data, ty, mem_tag);
}

fn is_nop_or_side_effecting(proc: &Procedure, op: Op) -> bool {
    proc.op(op).is_nop() || proc.op(op).opcode.info().has_side_effects
}

fn const_i64(proc: &Procedure, op: Op) -> Option<i64> {
    match proc.op(op).data {
        OpData::Const64 { bits } if proc.op(op).opcode == Opcode::Lci => Some(bits as i64),
        _ => None,
    }
}

fn is_const(proc: &Procedure, op: Op) -> bool {
    const_i64(proc, op).is_some()
}

fn is_commutative(opcode: Opcode) -> bool {
    use Opcode::*;
    matches!(
        opcode,
        Iadd | Imul | Iand | Ior | Ixor | Fadd | Fmul | Dadd | Dmul | Cieq | Cine
    )
}

/// Non-commutative comparisons whose operands can still be swapped by also
/// flipping the "direction" bit (`a < b` becomes `b > a`), per spec §4.4.2
/// "comparison opcodes swap by bit-flip of the direction bit".
fn flipped(opcode: Opcode) -> Option<Opcode> {
    use Opcode::*;
    Some(match opcode {
        Jilt => Jigt, Jigt => Jilt, Jige => Jile, Jile => Jige,
        Jult => Jugt, Jugt => Jult, Juge => Jule, Jule => Juge,
        Jdlt => Jdgt, Jdgt => Jdlt, Jdge => Jdle, Jdle => Jdge,
        Jflt => Jfgt, Jfgt => Jflt, Jfge => Jfle, Jfle => Jfge,
        Cilt => Cigt, Cigt => Cilt, Cige => Cile, Cile => Cige,
        Cult => Cugt, Cugt => Cult, Cuge => Cule, Cule => Cuge,
        Cdlt => Cdgt, Cdgt => Cdlt, Cdge => Cdle, Cdle => Cdge,
        Cflt => Cfgt, Cfgt => Cflt, Cfge => Cfle, Cfle => Cfge,
        _ => return None,
    })
}

/// Move a constant operand to the right: for commutative ops this just
/// swaps; for flippable comparisons it also swaps the opcode's direction.
fn canonicalize_operands(proc: &mut Procedure, op: Op) -> bool {
    let opcode = proc.op(op).opcode;
    let OpData::Binary { args } = proc.op(op).data else {
        return false;
    };
    let [lhs, rhs] = args;
    if !is_const(proc, lhs) || is_const(proc, rhs) {
        return false;
    }
    let ty = proc.op(op).ty;
    if is_commutative(opcode) {
        overwrite(proc, op, opcode, OpData::Binary { args: [rhs, lhs] }, ty);
        true
    } else if let Some(flip) = flipped(opcode) {
        overwrite(proc, op, flip, OpData::Binary { args: [rhs, lhs] }, ty);
        true
    } else {
        false
    }
}

/// Integer interpretation of a binary op over two known i64 operands.
/// Division/modulo by zero are deliberately excluded — the result must
/// remain an observable side effect (spec §8), not be folded away.
fn interpret_int(opcode: Opcode, a: i64, b: i64) -> Option<i64> {
    use Opcode::*;
    Some(match opcode {
        Iadd => a.wrapping_add(b),
        Isub => a.wrapping_sub(b),
        Imul => a.wrapping_mul(b),
        Idiv if b != 0 => a.wrapping_div(b),
        Imod if b != 0 => a.wrapping_rem(b),
        Udiv if b != 0 => ((a as u64).wrapping_div(b as u64)) as i64,
        Umod if b != 0 => ((a as u64).wrapping_rem(b as u64)) as i64,
        Iand => a & b,
        Ior => a | b,
        Ixor => a ^ b,
        Ishl => a.wrapping_shl((b & 63) as u32),
        Ishr => a.wrapping_shr((b & 63) as u32),
        Ushr => ((a as u64).wrapping_shr((b & 63) as u32)) as i64,
        Cilt => (a < b) as i64,
        Cige => (a >= b) as i64,
        Cigt => (a > b) as i64,
        Cile => (a <= b) as i64,
        Cult => ((a as u64) < (b as u64)) as i64,
        Cuge => ((a as u64) >= (b as u64)) as i64,
        Cugt => ((a as u64) > (b as u64)) as i64,
        Cule => ((a as u64) <= (b as u64)) as i64,
        Cieq => (a == b) as i64,
        Cine => (a != b) as i64,
        _ => return None,
    })
}

fn fold_two_constants(proc: &mut Procedure, op: Op, local_consts: &mut HashMap<i64, Op>) -> bool {
    let opcode = proc.op(op).opcode;
    let OpData::Binary { args } = proc.op(op).data else {
        return false;
    };
    let (Some(a), Some(b)) = (const_i64(proc, args[0]), const_i64(proc, args[1])) else {
        return false;
    };
    let Some(result) = interpret_int(opcode, a, b) else {
        return false;
    };
    materialize_constant(proc, op, result, local_consts);
    true
}

/// Turn `op` itself into an `lci` carrying `value`, reusing an
/// already-materialized identical constant in this block where possible
/// (the fold pass's block-local CSE table) by renaming uses instead of
/// duplicating.
fn materialize_constant(
    proc: &mut Procedure,
    op: Op,
    value: i64,
    local_consts: &mut HashMap<i64, Op>,
) {
    if let Some(&existing) = local_consts.get(&value) {
        if existing != op {
            rename_all_uses(proc, op, existing);
            *proc.op_mut(op) = OpRecord::nop(proc.op(op).block);
            return;
        }
    }
    overwrite(
        proc,
        op,
        Opcode::Lci,
        OpData::Const64 {
            bits: value as u64,
        },
        Type::Int,
    );
    local_consts.insert(value, op);
}

/// Identities: `x+0`, `x-0`, `x^0`, `x*1`, `x&-1`, double negation, double
/// bit-not — all collapse to their surviving operand.
fn eliminate_identity(proc: &mut Procedure, op: Op) -> bool {
    let opcode = proc.op(op).opcode;
    let block = proc.op(op).block;

    if let OpData::Unary { arg } = proc.op(op).data {
        let inner = proc.op(arg);
        if (opcode == Opcode::Ineg && inner.opcode == Opcode::Ineg)
            || (opcode == Opcode::Inot && inner.opcode == Opcode::Inot)
        {
            if let OpData::Unary { arg: inner_arg } = inner.data {
                rename_all_uses(proc, op, inner_arg);
                *proc.op_mut(op) = OpRecord::nop(block);
                return true;
            }
        }
        return false;
    }

    let OpData::Binary { args } = proc.op(op).data else {
        return false;
    };
    let rhs_const = const_i64(proc, args[1]);
    let identity = match (opcode, rhs_const) {
        (Opcode::Iadd, Some(0)) | (Opcode::Isub, Some(0)) | (Opcode::Ixor, Some(0)) => {
            Some(args[0])
        }
        (Opcode::Imul, Some(1)) => Some(args[0]),
        (Opcode::Iand, Some(-1)) => Some(args[0]),
        _ => None,
    };
    if let Some(replacement) = identity {
        rename_all_uses(proc, op, replacement);
        *proc.op_mut(op) = OpRecord::nop(block);
        true
    } else {
        false
    }
}

/// `x * 2^k` becomes `x shl k` (spec §4.4.2).
fn strength_reduce_shift(proc: &mut Procedure, op: Op) -> bool {
    if proc.op(op).opcode != Opcode::Imul {
        return false;
    }
    let OpData::Binary { args } = proc.op(op).data else {
        return false;
    };
    let Some(k) = const_i64(proc, args[1]).and_then(power_of_two_shift) else {
        return false;
    };
    let ty = proc.op(op).ty;
    overwrite(
        proc,
        op,
        Opcode::IshlI,
        OpData::BinaryImm {
            arg: args[0],
            imm: k,
        },
        ty,
    );
    true
}

fn power_of_two_shift(v: i64) -> Option<i32> {
    if v > 0 && (v as u64).is_power_of_two() {
        Some((v as u64).trailing_zeros() as i32)
    } else {
        None
    }
}

/// A binary op whose right operand fits a signed 32-bit immediate folds
/// into its `*I` form, collapsing a load-constant op (spec §4.4.2).
fn imm_form(opcode: Opcode) -> Option<Opcode> {
    use Opcode::*;
    Some(match opcode {
        Iadd => IaddI,
        Isub => IsubI,
        Imul => ImulI,
        Idiv => IdivI,
        Imod => ImodI,
        Udiv => UdivI,
        Umod => UmodI,
        Iand => IandI,
        Ior => IorI,
        Ixor => IxorI,
        Ishl => IshlI,
        Ishr => IshrI,
        Ushr => UshrI,
        _ => return None,
    })
}

fn fuse_immediate(proc: &mut Procedure, op: Op) -> bool {
    let opcode = proc.op(op).opcode;
    if compare_opcode(opcode) {
        return false;
    }
    let Some(imm_opcode) = imm_form(opcode) else {
        return false;
    };
    let OpData::Binary { args } = proc.op(op).data else {
        return false;
    };
    let Some(imm) = const_i64(proc, args[1]).and_then(|v| i32::try_from(v).ok()) else {
        return false;
    };
    // Division/modulo by a literal zero must stay a real (trapping) op;
    // don't let immediate fusion hide that it's now statically divide-by-zero.
    if matches!(
        opcode,
        Opcode::Idiv | Opcode::Imod | Opcode::Udiv | Opcode::Umod
    ) && imm == 0
    {
        return false;
    }
    let ty = proc.op(op).ty;
    overwrite(
        proc,
        op,
        imm_opcode,
        OpData::BinaryImm {
            arg: args[0],
            imm,
        },
        ty,
    );
    true
}

fn compare_opcode(opcode: Opcode) -> bool {
    use Opcode::*;
    matches!(
        opcode,
        Cilt | Cige | Cigt | Cile | Cult | Cuge | Cugt | Cule | Cieq | Cine
    )
}

/// Whether two consecutive immediate-form ops of the same base opcode
/// combine into one (spec §4.4.2: `(x+a)+b -> x+(a+b)` when the combined
/// immediate still fits).
fn combine_imm(opcode: Opcode, a: i32, b: i32) -> Option<i32> {
    use Opcode::*;
    match opcode {
        IaddI | IsubI => a.checked_add(b),
        ImulI => a.checked_mul(b),
        IandI => Some(a & b),
        IorI => Some(a | b),
        IxorI => Some(a ^ b),
        IshlI | IshrI | UshrI => {
            let sum = a.checked_add(b)?;
            if (0..64).contains(&sum) {
                Some(sum)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn combine_consecutive_immediates(proc: &mut Procedure, op: Op) -> bool {
    let opcode = proc.op(op).opcode;
    let OpData::BinaryImm { arg, imm } = proc.op(op).data else {
        return false;
    };
    if is_nop_or_side_effecting(proc, arg) {
        return false;
    }
    let inner = proc.op(arg);
    if inner.opcode != opcode {
        return false;
    }
    let OpData::BinaryImm {
        arg: inner_arg,
        imm: inner_imm,
    } = inner.data
    else {
        return false;
    };
    let Some(combined) = combine_imm(opcode, inner_imm, imm) else {
        return false;
    };
    let ty = proc.op(op).ty;
    overwrite(
        proc,
        op,
        opcode,
        OpData::BinaryImm {
            arg: inner_arg,
            imm: combined,
        },
        ty,
    );
    true
}

/// Fuse `cieq x, k` (or `cine`) immediately tested by `jz`/`jnz` into a
/// single `jieqI`/`jineI` branch, and its inverse (`a==0` under `jz`
/// simplifying to `jieq a, 0`'s `jnz` reading) — spec §4.4.2 last bullet.
fn fuse_compare_branch(proc: &mut Procedure, b: BlockRef) -> bool {
    let Some(term) = proc.block(b).terminator() else {
        return false;
    };
    let term_opcode = proc.op(term).opcode;
    if !matches!(term_opcode, Opcode::Jz | Opcode::Jnz) {
        return false;
    }
    let OpData::Branch1 { arg: cond, targets } = proc.op(term).data else {
        return false;
    };
    if proc.op(cond).nuse != 1 {
        // The compare is used elsewhere; fusing would lose its standalone
        // 0/1 result.
        return false;
    }
    let cond_rec_opcode = proc.op(cond).opcode;
    let OpData::BinaryImm {
        arg: cmp_arg,
        imm: cmp_imm,
    } = proc.op(cond).data
    else {
        return false;
    };
    let Some(branch_opcode) = fused_branch_opcode(cond_rec_opcode, term_opcode) else {
        return false;
    };
    let ty = proc.op(term).ty;
    overwrite(
        proc,
        term,
        branch_opcode,
        OpData::Branch2Imm {
            arg: cmp_arg,
            imm: cmp_imm,
            targets,
        },
        ty,
    );
    proc.delete_op(cond);
    true
}

fn fused_branch_opcode(compare_imm_opcode: Opcode, on: Opcode) -> Option<Opcode> {
    use Opcode::*;
    // `jz` takes the "taken" branch when the condition is zero/false, so a
    // `jz` over `cieqI` reads the same as a direct `jineI` (not-equal)
    // would on `targets` swapped... the emitter's scheduling only cares
    // that the branch opcode's own truth table matches, so `jz`/`cieqI`
    // fuses straight into `jieqI` and `jnz`/`cieqI` into `jineI`, matching
    // spec's "same direction" / "inverse" pair.
    match (compare_imm_opcode, on) {
        _ if compare_imm_opcode == Cieq => {
            Some(if on == Jz { JieqI } else { JineI })
        }
        _ if compare_imm_opcode == Cine => {
            Some(if on == Jz { JineI } else { JieqI })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator;
    use crate::{Flags, OptLevel};

    fn flags() -> Flags {
        Flags {
            unsafe_fastmath: false,
            opt_level: OptLevel::Speed,
        }
    }

    #[test]
    fn two_constants_fold_to_one() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let a = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 2 }, Type::Int)
            .unwrap();
        let b = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 3 }, Type::Int)
            .unwrap();
        let sum = proc
            .push_op(
                entry,
                Opcode::Iadd,
                OpData::Binary { args: [a, b] },
                Type::Int,
            )
            .unwrap();
        proc.push_op(entry, Opcode::Iret, OpData::Return { arg: Some(sum) }, Type::None)
            .unwrap();
        dominator::compute(&mut proc);
        run(&mut proc, &flags());
        assert_eq!(proc.op(sum).opcode, Opcode::Lci);
        assert_eq!(proc.op(sum).data, OpData::Const64 { bits: 5 });
    }

    #[test]
    fn divide_by_zero_constant_is_not_folded() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let a = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 7 }, Type::Int)
            .unwrap();
        let z = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 0 }, Type::Int)
            .unwrap();
        let div = proc
            .push_op(
                entry,
                Opcode::Idiv,
                OpData::Binary { args: [a, z] },
                Type::Int,
            )
            .unwrap();
        proc.push_op(entry, Opcode::Iret, OpData::Return { arg: Some(div) }, Type::None)
            .unwrap();
        dominator::compute(&mut proc);
        run(&mut proc, &flags());
        assert_eq!(proc.op(div).opcode, Opcode::Idiv);
    }

    #[test]
    fn additive_identity_is_eliminated() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let x = proc
            .push_op(entry, Opcode::Iarg, OpData::Arg { type_index: 0, type_total: 1, global_pos: 0 }, Type::Int)
            .unwrap();
        let zero = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 0 }, Type::Int)
            .unwrap();
        let sum = proc
            .push_op(entry, Opcode::Iadd, OpData::Binary { args: [x, zero] }, Type::Int)
            .unwrap();
        proc.push_op(entry, Opcode::Iret, OpData::Return { arg: Some(sum) }, Type::None)
            .unwrap();
        dominator::compute(&mut proc);
        crate::liveness::livescan(&mut proc);
        run(&mut proc, &flags());
        let term = proc.block(entry).terminator().unwrap();
        assert_eq!(proc.op(term).data, OpData::Return { arg: Some(x) });
    }
}
