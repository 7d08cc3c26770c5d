//! Structural-invariant checker (spec §8 "Structural invariants"), grounded
//! on the original `sanity.cpp` collaborator (spec SPEC_FULL.md "Supplemental
//! features"). Run from tests after every pass, and optionally from
//! `compile()` under `debug_assertions`.

use crate::ir::Procedure;
use crate::result::{BjitError, BjitResult};
use bjit_entity::EntityRef;

/// Walk `proc` and check every invariant from spec §3/§8 that doesn't
/// require a register allocation to have run yet.
pub fn check(proc: &Procedure) -> BjitResult<()> {
    check_op_membership(proc)?;
    check_dominance_of_inputs(proc)?;
    check_phi_alternatives(proc)?;
    check_terminators(proc)?;
    Ok(())
}

/// Additionally check the post-register-allocation invariants (spec §8
/// "After RA").
pub fn check_post_ra(proc: &Procedure) -> BjitResult<()> {
    check(proc)?;
    for b in proc.block_keys() {
        if !proc.block(b).flags.live {
            continue;
        }
        for &o in &proc.block(b).ops {
            let rec = proc.op(o);
            if rec.is_nop() {
                continue;
            }
            let has_output = !matches!(rec.ty, crate::ir::Type::None);
            if has_output && rec.reg.is_none() && rec.scc.is_none() {
                return Err(BjitError::InvalidInput(
                    "op with an output has neither a register nor a spill slot after RA",
                ));
            }
        }
    }
    Ok(())
}

/// (I2) Every non-nop op belongs to exactly one block, and appears exactly
/// once in that block's op list.
fn check_op_membership(proc: &Procedure) -> BjitResult<()> {
    for o in proc.op_keys() {
        let rec = proc.op(o);
        if rec.is_nop() {
            continue;
        }
        let owner = rec.block;
        let count = proc.block(owner).ops.iter().filter(|&&x| x == o).count();
        if count != 1 {
            return Err(BjitError::InvalidInput(
                "op does not appear exactly once in the block list of its recorded owner",
            ));
        }
    }
    Ok(())
}

/// (I3) Every input id refers to an op that dominates the using op.
///
/// Approximated at the block level (an input's owning block must either be
/// the user's own block and precede it in op order, or a proper dominator
/// of the user's block) since that's the granularity spec §4.2's dominator
/// chains are computed at.
fn check_dominance_of_inputs(proc: &Procedure) -> BjitResult<()> {
    for b in proc.block_keys() {
        if !proc.block(b).flags.live {
            continue;
        }
        let ops = &proc.block(b).ops;
        for (pos, &o) in ops.iter().enumerate() {
            let rec = proc.op(o);
            if rec.is_nop() {
                continue;
            }
            let mut inputs = Vec::new();
            rec.for_each_input(|i| inputs.push(i));
            for input in inputs {
                let input_block = proc.op(input).block;
                if input_block == b {
                    let input_pos = ops.iter().position(|&x| x == input);
                    if input_pos.is_none() || input_pos.unwrap() >= pos {
                        return Err(BjitError::InvalidInput(
                            "op input does not dominate its user within the same block",
                        ));
                    }
                } else if !proc.block(b).dom_chain.contains(&input_block) {
                    return Err(BjitError::InvalidInput(
                        "op input's block does not dominate the user's block",
                    ));
                }
            }
        }
    }
    Ok(())
}

/// (I6) Every phi has one alternative per predecessor in its block's
/// come-from set, and alternative types match the phi's.
fn check_phi_alternatives(proc: &Procedure) -> BjitResult<()> {
    for b in proc.block_keys() {
        if !proc.block(b).flags.live {
            continue;
        }
        let preds = &proc.block(b).come_from;
        for phi in &proc.block(b).phis {
            if phi.alternatives.len() != preds.len() {
                return Err(BjitError::InvalidInput(
                    "phi does not have exactly one alternative per predecessor",
                ));
            }
            for pred in preds {
                if phi.alternative_from(*pred).is_none() {
                    return Err(BjitError::InvalidInput(
                        "phi is missing an alternative for a live predecessor",
                    ));
                }
            }
            let phi_ty = proc.op(phi.dest).ty;
            for alt in &phi.alternatives {
                if proc.op(alt.source_value).ty != phi_ty {
                    return Err(BjitError::InvalidInput(
                        "phi alternative's type does not match the phi's type",
                    ));
                }
            }
        }
    }
    Ok(())
}

/// (I4) Every jump op is the last op in its block; conditional jumps have
/// exactly two target labels, `jmp` has one.
fn check_terminators(proc: &Procedure) -> BjitResult<()> {
    for b in proc.block_keys() {
        if !proc.block(b).flags.live {
            continue;
        }
        let ops = &proc.block(b).ops;
        for (pos, &o) in ops.iter().enumerate() {
            let rec = proc.op(o);
            let is_last = pos + 1 == ops.len();
            if rec.opcode.is_terminator() && !is_last {
                return Err(BjitError::InvalidInput(
                    "a terminator op is not the last op in its block",
                ));
            }
        }
        if let Some(term) = proc.block(b).terminator() {
            let rec = proc.op(term);
            if rec.opcode.is_two_target_branch() && rec.opcode != crate::ir::Opcode::Jmp {
                if rec.targets().len() != 2 {
                    return Err(BjitError::InvalidInput(
                        "a conditional jump does not carry exactly two targets",
                    ));
                }
            } else if rec.opcode == crate::ir::Opcode::Jmp && rec.targets().len() != 1 {
                return Err(BjitError::InvalidInput(
                    "an unconditional jmp does not carry exactly one target",
                ));
            }
        }
    }
    Ok(())
}

/// (I1) Every op's arena index equals its position in the arena — always
/// true by construction for `PrimaryMap`-backed arenas, kept as an explicit
/// check for documentation/regression purposes.
pub fn check_arena_indices_are_positional(proc: &Procedure) -> bool {
    proc.op_keys().enumerate().all(|(i, o)| o.index() == i)
}
