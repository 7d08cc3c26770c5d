//! The x86-64 back-end (spec §4.6 "x86-64 emission", §6 "x86-64").
//!
//! Lowers a register-allocated `Procedure` directly to bytes: no separate
//! intermediate instruction list, no peephole pass. Each op's encoding is
//! chosen from `Op::reg` (assigned by the allocator) and `Op::data`; the
//! only bookkeeping this module owns beyond that is fallthrough-aware block
//! scheduling (`binemit::schedule_blocks`) and a local table of intra-
//! procedure branch fixups, resolved once every block's offset is known.

pub mod encode;
pub mod registers;

use crate::binemit::{CodeSink, RodataRefKind};
use crate::ir::{ConstantPool, MemWidth, Op, OpData, Opcode, Procedure, RegUnit, Type};
use crate::isa::call_conv::CallConv;
use crate::isa::{RegConstraint, RegConstraints, TargetIsa};
use crate::regalloc::register_set::{RegClass, RegisterMask};
use crate::result::{BjitError, BjitResult};
use encode::{ArithOp, FloatOp, MemOp};
use registers::{hw_encoding, is_fp, xmm, RAX, RBP, RCX, RDX, RSP};
use smallvec::smallvec;
use target_lexicon::Triple;

/// x86-64, System-V or Windows x64 (spec §6).
pub struct X86Isa {
    call_conv: CallConv,
}

impl X86Isa {
    /// Build an `X86Isa` for `triple`'s implied calling convention.
    pub fn new(triple: &Triple) -> Self {
        Self {
            call_conv: CallConv::triple_default(triple),
        }
    }
}

fn class_of(ty: Type) -> RegClass {
    if ty.is_float() {
        RegClass::Fp
    } else {
        RegClass::Gp
    }
}

fn any(class: RegClass) -> RegConstraint {
    RegConstraint::any(class)
}

fn fixed(class: RegClass, reg: RegUnit) -> RegConstraint {
    RegConstraint::fixed(class, reg)
}

/// Which ABI register (if any) argument/outgoing-pass slot `(type_index,
/// global_pos)` resolves to, under `call_conv` (spec §6 "Calling
/// conventions honored"). Indices beyond the register file wrap rather than
/// panicking; stack-passed arguments beyond the register count are out of
/// scope for this back-end's ABI surface.
fn abi_reg(call_conv: CallConv, ty: Type, type_index: u8, global_pos: u8) -> RegUnit {
    let idx = if call_conv == CallConv::WindowsFastcall {
        global_pos as usize
    } else {
        type_index as usize
    };
    if ty.is_float() {
        let regs = registers::fp_arg_registers(call_conv);
        regs[idx % regs.len()]
    } else {
        let regs = registers::gp_arg_registers(call_conv);
        regs[idx % regs.len()]
    }
}

fn caller_saved(call_conv: CallConv) -> RegisterMask {
    registers::gp_caller_saved(call_conv).union(registers::fp_registers())
}

impl TargetIsa for X86Isa {
    fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    fn return_register(&self, ty: Type) -> RegUnit {
        if ty.is_float() {
            xmm(0)
        } else {
            RAX
        }
    }

    fn gp_registers(&self) -> RegisterMask {
        registers::gp_registers()
    }

    fn fp_registers(&self) -> RegisterMask {
        registers::fp_registers()
    }

    fn callee_saved(&self) -> RegisterMask {
        registers::callee_saved(self.call_conv)
    }

    fn constraints(&self, proc: &Procedure, op: Op) -> RegConstraints {
        use Opcode::*;
        let rec = proc.op(op);
        let cc = self.call_conv;
        let mut c = RegConstraints::default();

        match rec.opcode {
            // Plain GP binops / unops: any register, destructive form OK.
            Iadd | Isub | Imul | Iand | Ior | Ixor | Ineg | Inot | IaddI | IsubI | ImulI
            | IandI | IorI | IxorI => {
                c.output = Some(any(RegClass::Gp));
                c.output_may_alias_input = true;
                match rec.data {
                    OpData::Binary { .. } => c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)],
                    OpData::BinaryImm { .. } | OpData::Unary { .. } => {
                        c.inputs = smallvec![any(RegClass::Gp)]
                    }
                    _ => {}
                }
            }

            Idiv | Imod | Udiv | Umod => {
                c.inputs = smallvec![fixed(RegClass::Gp, RAX), any(RegClass::Gp)];
                c.output = Some(fixed(
                    RegClass::Gp,
                    if matches!(rec.opcode, Idiv | Udiv) { RAX } else { RDX },
                ));
                c.clobbers = RegisterMask::single(RAX).union(RegisterMask::single(RDX));
            }
            IdivI | ImodI | UdivI | UmodI => {
                c.inputs = smallvec![fixed(RegClass::Gp, RAX)];
                c.output = Some(fixed(
                    RegClass::Gp,
                    if matches!(rec.opcode, IdivI | UdivI) { RAX } else { RDX },
                ));
                // R11 is reserved as scratch to materialize the immediate
                // divisor (idiv has no immediate form).
                c.clobbers = RegisterMask::single(RAX)
                    .union(RegisterMask::single(RDX))
                    .union(RegisterMask::single(registers::R11));
            }

            Ishl | Ishr | Ushr => {
                c.inputs = smallvec![any(RegClass::Gp), fixed(RegClass::Gp, RCX)];
                c.output = Some(any(RegClass::Gp));
                c.output_may_alias_input = true;
            }
            IshlI | IshrI | UshrI => {
                c.inputs = smallvec![any(RegClass::Gp)];
                c.output = Some(any(RegClass::Gp));
                c.output_may_alias_input = true;
            }

            Fadd | Fsub | Fmul | Fdiv | Dadd | Dsub | Dmul | Ddiv => {
                c.inputs = smallvec![any(RegClass::Fp), any(RegClass::Fp)];
                c.output = Some(any(RegClass::Fp));
                c.output_may_alias_input = true;
            }
            Fneg | Fabs | Dneg | Dabs => {
                c.inputs = smallvec![any(RegClass::Fp)];
                c.output = Some(any(RegClass::Fp));
                c.output_may_alias_input = true;
            }

            Cilt | Cige | Cigt | Cile | Cult | Cuge | Cugt | Cule | Cieq | Cine => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)];
                c.output = Some(any(RegClass::Gp));
            }
            Cdlt | Cdge | Cdgt | Cdle | Cdeq | Cdne | Cflt | Cfge | Cfgt | Cfle | Cfeq | Cfne => {
                c.inputs = smallvec![any(RegClass::Fp), any(RegClass::Fp)];
                c.output = Some(any(RegClass::Gp));
            }

            Jilt | Jige | Jigt | Jile | Jult | Juge | Jugt | Jule | Jieq | Jine => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)]
            }
            Jdlt | Jdge | Jdgt | Jdle | Jdeq | Jdne | Jflt | Jfge | Jfgt | Jfle | Jfeq | Jfne => {
                c.inputs = smallvec![any(RegClass::Fp), any(RegClass::Fp)]
            }
            JiltI | JigeI | JigtI | JileI | JultI | JugeI | JugtI | JuleI | JieqI | JineI => {
                c.inputs = smallvec![any(RegClass::Gp)]
            }
            Jz | Jnz => c.inputs = smallvec![any(RegClass::Gp)],
            Jmp => {}

            Iret => c.inputs = smallvec![any(RegClass::Gp)],
            Fret | Dret => c.inputs = smallvec![any(RegClass::Fp)],
            IretI | Tcallp | TcallnI => {
                if let OpData::TailCall { .. } = rec.data {
                    c.inputs = smallvec![any(RegClass::Gp)];
                }
            }

            Ci2d | Ci2f | Bci2d | Bci2f => {
                c.inputs = smallvec![any(RegClass::Gp)];
                c.output = Some(any(RegClass::Fp));
            }
            Cd2i | Cf2i | Bcd2i | Bcf2i => {
                c.inputs = smallvec![any(RegClass::Fp)];
                c.output = Some(any(RegClass::Gp));
            }
            Cf2d | Cd2f => {
                c.inputs = smallvec![any(RegClass::Fp)];
                c.output = Some(any(RegClass::Fp));
            }
            I8 | I16 | I32 | U8 | U16 | U32 => {
                c.inputs = smallvec![any(RegClass::Gp)];
                c.output = Some(any(RegClass::Gp));
                c.output_may_alias_input = true;
            }

            Lci => c.output = Some(any(RegClass::Gp)),
            Lcd => c.output = Some(any(RegClass::Fp)),
            Lcf => c.output = Some(any(RegClass::Fp)),
            Lnp => c.output = Some(any(RegClass::Gp)),

            Li8 | Li16 | Li32 | Li64 | Lu8 | Lu16 | Lu32 => {
                c.inputs = smallvec![any(RegClass::Gp)];
                c.output = Some(any(RegClass::Gp));
            }
            Lf32 | Lf64 => {
                c.inputs = smallvec![any(RegClass::Gp)];
                c.output = Some(any(RegClass::Fp));
            }
            L2i8 | L2i16 | L2i32 | L2i64 | L2u8 | L2u16 | L2u32 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)];
                c.output = Some(any(RegClass::Gp));
            }
            L2f32 | L2f64 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)];
                c.output = Some(any(RegClass::Fp));
            }
            Si8 | Si16 | Si32 | Si64 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)]
            }
            Sf32 | Sf64 => c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Fp)],
            S2i8 | S2i16 | S2i32 | S2i64 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp), any(RegClass::Gp)]
            }
            S2f32 | S2f64 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp), any(RegClass::Fp)]
            }

            Iarg | Farg | Darg => {
                if let OpData::Arg {
                    type_index,
                    global_pos,
                    ..
                } = rec.data
                {
                    let reg = abi_reg(cc, rec.ty, type_index, global_pos);
                    c.output = Some(fixed(class_of(rec.ty), reg));
                }
            }
            Ipass | Fpass | Dpass => {
                if let OpData::Pass {
                    type_index,
                    global_pos,
                    ..
                } = rec.data
                {
                    let ty = match rec.opcode {
                        Fpass => Type::F32,
                        Dpass => Type::F64,
                        _ => Type::Int,
                    };
                    let reg = abi_reg(cc, ty, type_index, global_pos);
                    c.inputs = smallvec![fixed(class_of(ty), reg)];
                }
            }
            Icallp | Fcallp | Dcallp => {
                c.inputs = smallvec![any(RegClass::Gp)];
                c.output = Some(fixed(class_of(rec.ty), self.return_register(rec.ty)));
                c.clobbers = caller_saved(cc);
            }
            Icalln | Fcalln | Dcalln => {
                c.output = Some(fixed(class_of(rec.ty), self.return_register(rec.ty)));
                c.clobbers = caller_saved(cc);
            }

            Alloc | Fence | Nop => {}
            Phi => c.output = Some(any(class_of(rec.ty))),
            Rename => {
                c.inputs = smallvec![any(class_of(rec.ty))];
                c.output = Some(any(class_of(rec.ty)));
                c.output_may_alias_input = true;
            }
            Reload => c.output = Some(any(class_of(rec.ty))),
        }
        c
    }

    fn emit(&self, proc: &Procedure, pool: &mut ConstantPool, sink: &mut CodeSink) -> BjitResult<()> {
        emit_proc(self, proc, pool, sink)
    }

    fn emit_stub(&self, sink: &mut CodeSink) -> u32 {
        // movabs rax, 0 ; jmp rax -- 12 bytes total, with the 8-byte
        // immediate left as a patchable field for later retargeting.
        sink.push_bytes(&[0x48, 0xb8]);
        let at = sink.offset();
        sink.push_u64_le(0);
        sink.push_bytes(&[0xff, 0xe0]);
        at
    }

    fn patch_near_call(&self, bytes: &mut [u8], at: u32, target_offset: u32) {
        let insn_end = at as i64 + 4;
        let disp = target_offset as i64 - insn_end;
        let at = at as usize;
        bytes[at..at + 4].copy_from_slice(&(disp as i32 as u32).to_le_bytes());
    }
}

/// Condition-code nibble for the signed/unsigned integer and float/double
/// compare opcodes (spec §6 "Compares producing 0/1", "Branches").
fn cc_of(opcode: Opcode) -> u8 {
    use Opcode::*;
    match opcode {
        Jilt | Cilt | JiltI => 0xc,
        Jige | Cige | JigeI => 0xd,
        Jigt | Cigt | JigtI => 0xf,
        Jile | Cile | JileI => 0xe,
        Jieq | Cieq | JieqI => 0x4,
        Jine | Cine | JineI => 0x5,
        Jult | Cult | JultI => 0x2,
        Juge | Cuge | JugeI => 0x3,
        Jugt | Cugt | JugtI => 0x7,
        Jule | Cule | JuleI => 0x6,
        Jdlt | Cdlt | Jflt | Cflt => 0x2,
        Jdge | Cdge | Jfge | Cfge => 0x3,
        Jdgt | Cdgt | Jfgt | Cfgt => 0x7,
        Jdle | Cdle | Jfle | Cfle => 0x6,
        Jdeq | Cdeq | Jfeq | Cfeq => 0x4,
        Jdne | Cdne | Jfne | Cfne => 0x5,
        _ => unreachable!("cc_of called on a non-compare opcode"),
    }
}

fn invert_cc(cc: u8) -> u8 {
    cc ^ 1
}

fn mem_width_of(opcode: Opcode) -> MemWidth {
    use Opcode::*;
    match opcode {
        Li8 | L2i8 => MemWidth::I8,
        Lu8 | L2u8 | Si8 | S2i8 => MemWidth::U8,
        Li16 | L2i16 => MemWidth::I16,
        Lu16 | L2u16 | Si16 | S2i16 => MemWidth::U16,
        Li32 | L2i32 => MemWidth::I32,
        Lu32 | L2u32 | Si32 | S2i32 => MemWidth::U32,
        Li64 | L2i64 | Si64 | S2i64 => MemWidth::I64,
        Lf32 | L2f32 | Sf32 | S2f32 => MemWidth::F32,
        Lf64 | L2f64 | Sf64 | S2f64 => MemWidth::F64,
        _ => unreachable!("mem_width_of called on a non-memory opcode"),
    }
}

fn load_mem_op(w: MemWidth) -> MemOp {
    match w {
        MemWidth::I8 => MemOp::LoadSx8,
        MemWidth::U8 => MemOp::LoadZx8,
        MemWidth::I16 => MemOp::LoadSx16,
        MemWidth::U16 => MemOp::LoadZx16,
        MemWidth::I32 => MemOp::LoadSx32,
        MemWidth::U32 => MemOp::LoadZx32,
        MemWidth::I64 => MemOp::Load64,
        MemWidth::F32 => MemOp::LoadF32,
        MemWidth::F64 => MemOp::LoadF64,
    }
}

fn store_mem_op(w: MemWidth) -> MemOp {
    match w {
        MemWidth::I8 | MemWidth::U8 => MemOp::Store8,
        MemWidth::I16 | MemWidth::U16 => MemOp::Store16,
        MemWidth::I32 | MemWidth::U32 => MemOp::Store32,
        MemWidth::I64 => MemOp::Store64,
        MemWidth::F32 => MemOp::StoreF32,
        MemWidth::F64 => MemOp::StoreF64,
    }
}

fn emit_proc(
    isa: &X86Isa,
    proc: &Procedure,
    pool: &mut ConstantPool,
    sink: &mut CodeSink,
) -> BjitResult<()> {
    let order = crate::binemit::schedule_blocks(proc);
    let cc = isa.call_conv;

    let saved: Vec<RegUnit> = isa
        .callee_saved()
        .intersect(RegisterMask(proc.used_regs))
        .iter()
        .collect();
    let spill_bytes = proc.spill_slots as i32 * 8;
    let frame_bytes = spill_bytes + proc.frame_alloc_bytes as i32;
    let frame_bytes = (frame_bytes + 15) & !15;

    encode::push_reg(sink, RBP);
    encode::mov_rr(sink, RBP, RSP);
    for &r in &saved {
        encode::push_reg(sink, r);
    }
    if frame_bytes > 0 {
        encode::arith_ri(sink, ArithOp::Sub, RSP, frame_bytes);
    }

    let mut local_fixups: Vec<(u32, crate::ir::BlockRef)> = Vec::new();

    for (i, &b) in order.iter().enumerate() {
        sink.mark_block(b);
        let next = order.get(i + 1).copied();
        let ops = proc.block(b).ops.clone();
        for op in ops {
            lower_op(isa, proc, pool, sink, op, next, &mut local_fixups, saved.len(), frame_bytes)?;
        }
    }

    for (at, target) in local_fixups {
        let target_off = sink.block_offset(target).expect("every live block is scheduled");
        let insn_end = at + 4;
        let disp = target_off as i64 - insn_end as i64;
        sink.patch_u32_le(at, disp as i32 as u32);
    }

    let _ = cc;
    Ok(())
}

fn spill_slot_offset(scc: u32) -> i32 {
    -8 * (scc as i32 + 1)
}

fn reg_of(proc: &Procedure, op: Op) -> RegUnit {
    proc.op(op).reg.expect("register allocation must run before emission")
}

fn store_spill_if_needed(sink: &mut CodeSink, proc: &Procedure, op: Op) {
    let rec = proc.op(op);
    if rec.spill {
        let scc = rec.scc.expect("a spilled op must have an SCC slot");
        let reg = reg_of(proc, op);
        let mem_op = if is_fp(reg) { MemOp::StoreF64 } else { MemOp::Store64 };
        encode::mem_base_disp32(sink, mem_op, reg, RBP, spill_slot_offset(scc));
    }
}

fn epilogue(sink: &mut CodeSink, saved: &[RegUnit], frame_bytes: i32) {
    if frame_bytes > 0 {
        encode::arith_ri(sink, ArithOp::Add, RSP, frame_bytes);
    }
    for &r in saved.iter().rev() {
        encode::pop_reg(sink, r);
    }
    encode::pop_reg(sink, RBP);
    encode::ret(sink);
}

#[allow(clippy::too_many_arguments)]
fn lower_op(
    isa: &X86Isa,
    proc: &Procedure,
    pool: &mut ConstantPool,
    sink: &mut CodeSink,
    op: Op,
    next_block: Option<crate::ir::BlockRef>,
    local_fixups: &mut Vec<(u32, crate::ir::BlockRef)>,
    saved_count: usize,
    frame_bytes: i32,
) -> BjitResult<()> {
    use Opcode::*;
    let rec = proc.op(op).clone();
    if rec.is_nop() || rec.opcode == Phi {
        return Ok(());
    }
    let saved: Vec<RegUnit> = isa
        .callee_saved()
        .intersect(RegisterMask(proc.used_regs))
        .iter()
        .collect();
    debug_assert_eq!(saved.len(), saved_count);

    match rec.opcode {
        Iadd | Isub | Iand | Ior | Ixor => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            let (dst, lhs, rhs) = (reg_of(proc, op), reg_of(proc, a), reg_of(proc, b));
            let src = if dst == lhs { rhs } else { lhs };
            if dst != lhs {
                encode::mov_rr(sink, dst, lhs);
            }
            let arith = match rec.opcode {
                Iadd => ArithOp::Add,
                Isub => ArithOp::Sub,
                Iand => ArithOp::And,
                Ior => ArithOp::Or,
                Ixor => ArithOp::Xor,
                _ => unreachable!(),
            };
            encode::arith_rr(sink, arith, dst, src);
        }
        IaddI | IsubI | IandI | IorI | IxorI => {
            let OpData::BinaryImm { arg, imm } = rec.data else { unreachable!() };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, arg));
            if dst != src {
                encode::mov_rr(sink, dst, src);
            }
            let arith = match rec.opcode {
                IaddI => ArithOp::Add,
                IsubI => ArithOp::Sub,
                IandI => ArithOp::And,
                IorI => ArithOp::Or,
                IxorI => ArithOp::Xor,
                _ => unreachable!(),
            };
            encode::arith_ri(sink, arith, dst, imm);
        }
        Imul => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            let (dst, lhs, rhs) = (reg_of(proc, op), reg_of(proc, a), reg_of(proc, b));
            let src = if dst == lhs { rhs } else { lhs };
            if dst != lhs {
                encode::mov_rr(sink, dst, lhs);
            }
            encode::imul_rr(sink, dst, src);
        }
        ImulI => {
            let OpData::BinaryImm { arg, imm } = rec.data else { unreachable!() };
            encode::imul_rri(sink, reg_of(proc, op), reg_of(proc, arg), imm);
        }
        Ineg => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, arg));
            if dst != src {
                encode::mov_rr(sink, dst, src);
            }
            encode::unary_group3(sink, 3, dst);
        }
        Inot => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, arg));
            if dst != src {
                encode::mov_rr(sink, dst, src);
            }
            encode::unary_group3(sink, 2, dst);
        }

        Idiv | Imod | Udiv | Umod => {
            let OpData::Binary { args: [_, divisor] } = rec.data else { unreachable!() };
            let divisor_reg = reg_of(proc, divisor);
            if matches!(rec.opcode, Idiv | Imod) {
                encode::cqo(sink);
                encode::div_group3(sink, 7, divisor_reg);
            } else {
                encode::zero_edx(sink);
                encode::div_group3(sink, 6, divisor_reg);
            }
        }
        IdivI | ImodI | UdivI | UmodI => {
            let OpData::BinaryImm { imm, .. } = rec.data else { unreachable!() };
            encode::mov_imm32(sink, registers::R11, imm);
            if matches!(rec.opcode, IdivI | ImodI) {
                encode::cqo(sink);
                encode::div_group3(sink, 7, registers::R11);
            } else {
                encode::zero_edx(sink);
                encode::div_group3(sink, 6, registers::R11);
            }
        }

        Ishl | Ishr | Ushr => {
            let OpData::Binary { args: [a, _count] } = rec.data else { unreachable!() };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, a));
            if dst != src {
                encode::mov_rr(sink, dst, src);
            }
            let ext = match rec.opcode {
                Ishl => 4,
                Ishr => 7,
                Ushr => 5,
                _ => unreachable!(),
            };
            encode::shift_cl(sink, ext, dst);
        }
        IshlI | IshrI | UshrI => {
            let OpData::BinaryImm { arg, imm } = rec.data else { unreachable!() };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, arg));
            if dst != src {
                encode::mov_rr(sink, dst, src);
            }
            let ext = match rec.opcode {
                IshlI => 4,
                IshrI => 7,
                UshrI => 5,
                _ => unreachable!(),
            };
            encode::shift_imm(sink, ext, dst, imm as u8);
        }

        Fadd | Fsub | Fmul | Fdiv | Dadd | Dsub | Dmul | Ddiv => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            let (dst, lhs, rhs) = (reg_of(proc, op), reg_of(proc, a), reg_of(proc, b));
            let src = if dst == lhs { rhs } else { lhs };
            if dst != lhs {
                encode::mov_rr(sink, dst, lhs);
            }
            let double = matches!(rec.opcode, Dadd | Dsub | Dmul | Ddiv);
            let fop = match rec.opcode {
                Fadd | Dadd => FloatOp::Add,
                Fsub | Dsub => FloatOp::Sub,
                Fmul | Dmul => FloatOp::Mul,
                Fdiv | Ddiv => FloatOp::Div,
                _ => unreachable!(),
            };
            encode::float_rr(sink, fop, double, dst, src);
        }
        Fneg | Dneg | Fabs | Dabs => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, arg));
            let is_neg = matches!(rec.opcode, Fneg | Dneg);
            let double = matches!(rec.opcode, Dneg | Dabs);
            let handle = if double {
                pool.insert_64(if is_neg { 0x8000_0000_0000_0000 } else { 0x7fff_ffff_ffff_ffff })
            } else {
                pool.insert_32(if is_neg { 0x8000_0000 } else { 0x7fff_ffff })
            };
            if dst != src {
                encode::mov_rr(sink, dst, src);
            }
            // `neg` flips the sign bit (xor); `abs` clears it (and against
            // the inverted mask).
            let at = encode::float_bitop_rip(sink, !is_neg, dst);
            let insn_end = sink.offset();
            sink.record_rodata_ref(at, handle, RodataRefKind::Rip32 { insn_end });
        }

        Cilt | Cige | Cigt | Cile | Cult | Cuge | Cugt | Cule | Cieq | Cine => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            encode::arith_rr(sink, ArithOp::Cmp, reg_of(proc, a), reg_of(proc, b));
            encode::setcc(sink, cc_of(rec.opcode), reg_of(proc, op));
        }
        Cdlt | Cdge | Cdgt | Cdle | Cdeq | Cdne | Cflt | Cfge | Cfgt | Cfle | Cfeq | Cfne => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            emit_ucomis(sink, matches!(rec.opcode, Cdlt | Cdge | Cdgt | Cdle | Cdeq | Cdne), reg_of(proc, a), reg_of(proc, b));
            encode::setcc(sink, cc_of(rec.opcode), reg_of(proc, op));
        }

        Jilt | Jige | Jigt | Jile | Jult | Juge | Jugt | Jule | Jieq | Jine => {
            let OpData::Branch2 { args: [a, b], targets } = rec.data else { unreachable!() };
            encode::arith_rr(sink, ArithOp::Cmp, reg_of(proc, a), reg_of(proc, b));
            emit_two_way_branch(sink, cc_of(rec.opcode), targets, next_block, local_fixups);
        }
        Jdlt | Jdge | Jdgt | Jdle | Jdeq | Jdne | Jflt | Jfge | Jfgt | Jfle | Jfeq | Jfne => {
            let OpData::Branch2 { args: [a, b], targets } = rec.data else { unreachable!() };
            emit_ucomis(sink, matches!(rec.opcode, Jdlt | Jdge | Jdgt | Jdle | Jdeq | Jdne), reg_of(proc, a), reg_of(proc, b));
            emit_two_way_branch(sink, cc_of(rec.opcode), targets, next_block, local_fixups);
        }
        JiltI | JigeI | JigtI | JileI | JultI | JugeI | JugtI | JuleI | JieqI | JineI => {
            let OpData::Branch2Imm { arg, imm, targets } = rec.data else { unreachable!() };
            encode::arith_ri(sink, ArithOp::Cmp, reg_of(proc, arg), imm);
            emit_two_way_branch(sink, cc_of(rec.opcode), targets, next_block, local_fixups);
        }
        Jz | Jnz => {
            let OpData::Branch1 { arg, targets } = rec.data else { unreachable!() };
            let r = reg_of(proc, arg);
            encode::arith_rr(sink, ArithOp::And, r, r);
            let cc = if rec.opcode == Jz { 0x4 } else { 0x5 };
            emit_two_way_branch(sink, cc, targets, next_block, local_fixups);
        }
        Jmp => {
            let OpData::Jump { target } = rec.data else { unreachable!() };
            if Some(target) != next_block {
                let at = encode::jmp_rel32(sink);
                local_fixups.push((at, target));
            }
        }

        Iret | Fret | Dret => {
            let OpData::Return { arg } = rec.data else { unreachable!() };
            if let Some(arg) = arg {
                let src = reg_of(proc, arg);
                let dst = if rec.opcode == Iret { RAX } else { xmm(0) };
                if src != dst {
                    encode::mov_rr(sink, dst, src);
                }
            }
            epilogue(sink, &saved, frame_bytes);
        }
        IretI => {
            let OpData::ReturnImm { imm } = rec.data else { unreachable!() };
            encode::mov_imm32(sink, RAX, imm);
            epilogue(sink, &saved, frame_bytes);
        }
        Tcallp => {
            let OpData::TailCall { arg } = rec.data else { unreachable!() };
            let target = reg_of(proc, arg);
            epilogue_no_ret(sink, &saved, frame_bytes);
            encode::jmp_indirect(sink, target);
        }
        TcallnI => {
            let OpData::TailCallNear { module_index } = rec.data else { unreachable!() };
            epilogue_no_ret(sink, &saved, frame_bytes);
            let at = encode::jmp_rel32(sink);
            record_near(sink, at, module_index, 4);
        }

        Ci2d | Ci2f => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::cvt_int_to_float(sink, rec.opcode == Ci2d, reg_of(proc, op), reg_of(proc, arg));
        }
        Cd2i | Cf2i => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::cvt_float_to_int(sink, rec.opcode == Cd2i, reg_of(proc, op), reg_of(proc, arg));
        }
        Cf2d => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::cvt_float_width(sink, false, reg_of(proc, op), reg_of(proc, arg));
        }
        Cd2f => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::cvt_float_width(sink, true, reg_of(proc, op), reg_of(proc, arg));
        }
        Bci2d | Bci2f => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::bitcast(sink, rec.opcode == Bci2d, true, reg_of(proc, op), reg_of(proc, arg));
        }
        Bcd2i | Bcf2i => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::bitcast(sink, rec.opcode == Bcd2i, false, reg_of(proc, op), reg_of(proc, arg));
        }
        I8 | I16 => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            let bits = if rec.opcode == I8 { 56 } else { 48 };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, arg));
            if dst != src {
                encode::mov_rr(sink, dst, src);
            }
            encode::shift_imm(sink, 4, dst, bits);
            encode::shift_imm(sink, 7, dst, bits);
        }
        I32 => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, arg));
            if dst != src {
                encode::mov_rr(sink, dst, src);
            }
        }
        U8 | U16 | U32 => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            let mask: i32 = match rec.opcode {
                U8 => 0xff,
                U16 => 0xffff,
                _ => -1,
            };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, arg));
            if dst != src {
                encode::mov_rr(sink, dst, src);
            }
            if rec.opcode != U32 {
                encode::arith_ri(sink, ArithOp::And, dst, mask);
            }
        }

        Lci => {
            let OpData::Const64 { bits } = rec.data else { unreachable!() };
            encode::mov_imm64(sink, reg_of(proc, op), bits);
        }
        Lcd => {
            let OpData::Const64 { bits } = rec.data else { unreachable!() };
            let handle = pool.insert_64(bits);
            let dst = reg_of(proc, op);
            let at = encode::mem_rip(sink, MemOp::LoadF64, dst);
            let insn_end = sink.offset();
            sink.record_rodata_ref(at, handle, RodataRefKind::Rip32 { insn_end });
        }
        Lcf => {
            let OpData::Const32 { bits } = rec.data else { unreachable!() };
            let handle = pool.insert_32(bits as u32);
            let dst = reg_of(proc, op);
            let at = encode::mem_rip(sink, MemOp::LoadF32, dst);
            let insn_end = sink.offset();
            sink.record_rodata_ref(at, handle, RodataRefKind::Rip32 { insn_end });
        }
        Lnp => {
            let OpData::Const32 { bits } = rec.data else { unreachable!() };
            let dst = reg_of(proc, op);
            let at = encode::lea_rip(sink, dst);
            record_near(sink, at, bits, 4);
        }

        Li8 | Li16 | Li32 | Li64 | Lu8 | Lu16 | Lu32 | Lf32 | Lf64 => {
            let OpData::Load { ptr, offset } = rec.data else { unreachable!() };
            let w = mem_width_of(rec.opcode);
            encode::mem_base_disp32(sink, load_mem_op(w), reg_of(proc, op), reg_of(proc, ptr), offset);
        }
        L2i8 | L2i16 | L2i32 | L2i64 | L2u8 | L2u16 | L2u32 | L2f32 | L2f64 => {
            let OpData::Load2 { ptr, index, offset } = rec.data else { unreachable!() };
            let w = mem_width_of(rec.opcode);
            encode::mem_base_index_disp32(
                sink,
                load_mem_op(w),
                reg_of(proc, op),
                reg_of(proc, ptr),
                reg_of(proc, index),
                offset,
            );
        }
        Si8 | Si16 | Si32 | Si64 | Sf32 | Sf64 => {
            let OpData::Store { ptr, value, offset } = rec.data else { unreachable!() };
            let w = mem_width_of(rec.opcode);
            encode::mem_base_disp32(sink, store_mem_op(w), reg_of(proc, value), reg_of(proc, ptr), offset);
        }
        S2i8 | S2i16 | S2i32 | S2i64 | S2f32 | S2f64 => {
            let OpData::Store2 { ptr, index, value, offset } = rec.data else { unreachable!() };
            let w = mem_width_of(rec.opcode);
            encode::mem_base_index_disp32(
                sink,
                store_mem_op(w),
                reg_of(proc, value),
                reg_of(proc, ptr),
                reg_of(proc, index),
                offset,
            );
        }

        Iarg | Farg | Darg => {
            // The allocator already pins the output to the ABI slot
            // (`constraints`); nothing to encode here -- the value simply
            // starts life in that register.
        }
        Ipass | Fpass | Dpass => {
            // Likewise: the input is already constrained into the outgoing
            // ABI register by the allocator.
        }
        Icallp | Fcallp | Dcallp => {
            let OpData::CallIndirect { arg } = rec.data else { unreachable!() };
            encode::call_indirect(sink, reg_of(proc, arg));
        }
        Icalln | Fcalln | Dcalln => {
            let OpData::CallNear { module_index } = rec.data else { unreachable!() };
            let at = encode::call_rel32(sink);
            record_near(sink, at, module_index, 4);
        }

        Alloc => {
            // Frame space already reserved by `emit_proc`'s prologue; this
            // op carries no output of its own (consumers address the area
            // via a `reload`/const offset computed by the front end).
        }
        Fence => {}
        Phi | Nop => {}
        Rename => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, arg));
            if dst != src {
                encode::mov_rr(sink, dst, src);
            }
        }
        Reload => {
            let scc = rec.scc.ok_or(BjitError::InvalidInput("reload op missing its SCC slot"))?;
            let dst = reg_of(proc, op);
            let mem_op = if is_fp(dst) { MemOp::LoadF64 } else { MemOp::Load64 };
            encode::mem_base_disp32(sink, mem_op, dst, RBP, spill_slot_offset(scc));
        }
    }

    store_spill_if_needed(sink, proc, op);
    Ok(())
}

fn emit_ucomis(sink: &mut CodeSink, double: bool, a: RegUnit, b: RegUnit) {
    // ucomisd carries a mandatory 66 prefix; ucomiss carries none.
    if double {
        sink.push_u8(0x66);
    }
    sink.push_bytes(&[0x0f, 0x2e]);
    let modrm = 0xC0 | (hw_encoding(a) << 3) | hw_encoding(b);
    sink.push_u8(modrm);
}

fn emit_two_way_branch(
    sink: &mut CodeSink,
    cc: u8,
    targets: [crate::ir::BlockRef; 2],
    next_block: Option<crate::ir::BlockRef>,
    local_fixups: &mut Vec<(u32, crate::ir::BlockRef)>,
) {
    let [t, f] = targets;
    if Some(f) == next_block {
        let at = encode::jcc_rel32(sink, cc);
        local_fixups.push((at, t));
    } else if Some(t) == next_block {
        let at = encode::jcc_rel32(sink, invert_cc(cc));
        local_fixups.push((at, f));
    } else {
        let at = encode::jcc_rel32(sink, cc);
        local_fixups.push((at, t));
        let at = encode::jmp_rel32(sink);
        local_fixups.push((at, f));
    }
}

fn epilogue_no_ret(sink: &mut CodeSink, saved: &[RegUnit], frame_bytes: i32) {
    if frame_bytes > 0 {
        encode::arith_ri(sink, ArithOp::Add, RSP, frame_bytes);
    }
    for &r in saved.iter().rev() {
        encode::pop_reg(sink, r);
    }
    encode::pop_reg(sink, RBP);
}

fn record_near(sink: &mut CodeSink, at: u32, target_module_index: i32, width: u8) {
    sink.record_near_call(at, target_module_index, width);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConstantPool, OpData, Procedure, Type};

    fn isa() -> X86Isa {
        let t: Triple = "x86_64-unknown-linux-gnu".parse().unwrap();
        X86Isa::new(&t)
    }

    #[test]
    fn prologue_and_return_immediate_round_trips_through_sink() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        proc.push_op(entry, Opcode::IretI, OpData::ReturnImm { imm: 42 }, Type::None)
            .unwrap();
        crate::dominator::compute(&mut proc);
        crate::liveness::livescan(&mut proc);

        let mut pool = ConstantPool::default();
        let mut sink = CodeSink::new();
        isa().emit(&proc, &mut pool, &mut sink).unwrap();
        assert!(sink.bytes.len() > 4);
        assert_eq!(*sink.bytes.last().unwrap(), 0xc3); // ret
    }

    #[test]
    fn abi_reg_uses_type_index_on_system_v() {
        let reg = abi_reg(CallConv::SystemV, Type::Int, 1, 1);
        assert_eq!(reg, registers::RSI);
    }
}
