//! Domination-aware reassociation (spec §4.4.5).
//!
//! Operands of commutative ops are ordered by `(dominator-chain length, op
//! id)` ascending, so operands defined closer to the entry block move
//! left and deeper, more locally-defined operands move right. This exposes
//! CSE opportunities between redundantly computed sub-expressions that
//! happened to be written with their operands in the opposite order.
//! Subtract/divide rewrites are symmetric rotations; floating-point
//! rotations are gated by `Flags::unsafe_fastmath` since they are not
//! bit-exact under IEEE 754.

use crate::dominator;
use crate::flowgraph;
use crate::ir::{BlockRef, Op, OpData, OpRecord, Opcode, Procedure, Type};
use crate::Flags;
use bjit_entity::EntityRef;

/// Run one reassociation pass over every live block. Returns whether
/// anything changed.
pub fn run(proc: &mut Procedure, flags: &Flags) -> bool {
    let mut changed = false;
    for b in flowgraph::live_blocks(proc) {
        let ops = proc.block(b).ops.clone();
        for op in ops {
            changed |= reorder_commutative(proc, op);
            changed |= rotate_subtract(proc, op, flags);
        }
    }
    if changed {
        dominator::compute(proc);
    }
    changed
}

fn depth_key(proc: &Procedure, op: Op) -> (usize, u32) {
    let block = proc.op(op).block;
    (proc.block(block).dom_depth(), op.index() as u32)
}

fn is_commutative(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Iadd | Opcode::Imul | Opcode::Iand | Opcode::Ior | Opcode::Ixor
    )
}

fn is_commutative_float(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Fadd | Opcode::Fmul | Opcode::Dadd | Opcode::Dmul
    )
}

/// Move the operand with the smaller `(dom depth, op id)` key to the left.
fn reorder_commutative(proc: &mut Procedure, op: Op) -> bool {
    let opcode = proc.op(op).opcode;
    let eligible = is_commutative(opcode) || is_commutative_float(opcode);
    if !eligible {
        return false;
    }
    let OpData::Binary { args } = proc.op(op).data else {
        return false;
    };
    if depth_key(proc, args[0]) <= depth_key(proc, args[1]) {
        return false;
    }
    let ty = proc.op(op).ty;
    overwrite(
        proc,
        op,
        opcode,
        OpData::Binary {
            args: [args[1], args[0]],
        },
        ty,
    );
    true
}

fn overwrite(proc: &mut Procedure, op: Op, opcode: Opcode, data: OpData, ty: Type) {
    let block = proc.op(op).block;
    let mem_tag = proc.op(op).mem_tag;
    *proc.op_mut(op) = OpRecord::new(opcode, block, data, ty, mem_tag);
}

/// `(a-b)+c -> (a+c)-b` (and the float/double equivalents, gated behind
/// `unsafe_fastmath`): when the left operand of a commutative add is itself
/// a subtraction that is deeper (more locally defined) than the right
/// operand, rotate so the subtraction's minuend stays adjacent to the
/// shallower operand, again exposing shared sub-expressions to CSE.
fn rotate_subtract(proc: &mut Procedure, op: Op, flags: &Flags) -> bool {
    let opcode = proc.op(op).opcode;
    let (add_opcode, sub_opcode, is_float) = match opcode {
        Opcode::Iadd => (Opcode::Iadd, Opcode::Isub, false),
        Opcode::Fadd if flags.unsafe_fastmath => (Opcode::Fadd, Opcode::Fsub, true),
        Opcode::Dadd if flags.unsafe_fastmath => (Opcode::Dadd, Opcode::Dsub, true),
        _ => return false,
    };
    let _ = is_float;

    let OpData::Binary { args: [lhs, c] } = proc.op(op).data else {
        return false;
    };
    if proc.op(lhs).opcode != sub_opcode {
        return false;
    }
    let OpData::Binary { args: [a, b] } = proc.op(lhs).data else {
        return false;
    };
    if depth_key(proc, lhs) <= depth_key(proc, c) {
        return false;
    }
    if proc.op(lhs).nuse != 1 {
        // The inner subtraction is shared; rewriting it in place would
        // change the value seen by its other users.
        return false;
    }

    let ty = proc.op(op).ty;
    let lhs_ty = proc.op(lhs).ty;
    overwrite(proc, lhs, add_opcode, OpData::Binary { args: [a, c] }, lhs_ty);
    overwrite(proc, op, sub_opcode, OpData::Binary { args: [lhs, b] }, ty);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dominator;
    use crate::ir::{OpData, Type};
    use crate::{Flags, OptLevel};

    fn flags() -> Flags {
        Flags {
            unsafe_fastmath: false,
            opt_level: OptLevel::Speed,
        }
    }

    #[test]
    fn deeper_operand_moves_right() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let shallow = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 1 }, Type::Int)
            .unwrap();
        let body = proc.make_block();
        proc.push_op(entry, Opcode::Jmp, OpData::Jump { target: body }, Type::None)
            .unwrap();
        let deep = proc
            .push_op(body, Opcode::Lci, OpData::Const64 { bits: 2 }, Type::Int)
            .unwrap();
        let sum = proc
            .push_op(
                body,
                Opcode::Iadd,
                OpData::Binary {
                    args: [deep, shallow],
                },
                Type::Int,
            )
            .unwrap();
        proc.push_op(body, Opcode::Iret, OpData::Return { arg: Some(sum) }, Type::None)
            .unwrap();

        dominator::compute(&mut proc);
        run(&mut proc, &flags());

        let OpData::Binary { args } = proc.op(sum).data else {
            panic!("expected binary op")
        };
        assert_eq!(args[0], shallow);
        assert_eq!(args[1], deep);
    }
}
