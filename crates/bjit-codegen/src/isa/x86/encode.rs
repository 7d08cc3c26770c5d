//! x86-64 instruction bytes (spec §4.6 "x86-64 emission").
//!
//! A thin helper layer over `CodeSink`: REX/ModRM byte construction and the
//! small set of instruction shapes `isa::x86::lower` needs. Not a general
//! assembler — only the forms this back-end's opcode table actually emits.

use crate::binemit::CodeSink;
use crate::ir::RegUnit;
use crate::isa::x86::registers::{hw_encoding, is_fp, needs_rex_extension};

/// `REX` prefix byte: `0100WRXB`.
fn rex(w: bool, r: RegUnit, x: RegUnit, b: RegUnit) -> u8 {
    0x40 | (w as u8) << 3
        | (needs_rex_extension(r) as u8) << 2
        | (needs_rex_extension(x) as u8) << 1
        | (needs_rex_extension(b) as u8)
}

/// Emit a REX prefix iff one of the operands needs an extension bit or `w`
/// (64-bit operand size) is set; x86-64 allows omitting REX entirely for a
/// plain 32-bit op over the low eight registers.
fn push_rex(sink: &mut CodeSink, w: bool, r: RegUnit, x: RegUnit, b: RegUnit) {
    if w || needs_rex_extension(r) || needs_rex_extension(x) || needs_rex_extension(b) {
        sink.push_u8(rex(w, r, x, b));
    }
}

/// `ModRM` byte for the register-direct addressing mode (`mod == 11`).
fn modrm_reg(reg: RegUnit, rm: RegUnit) -> u8 {
    0xC0 | (hw_encoding(reg) << 3) | hw_encoding(rm)
}

/// `ModRM`+optional `SIB`+displacement for `[base + disp32]` addressing,
/// always emitting a 32-bit displacement so later patching never needs to
/// widen the encoding.
fn push_mem_base_disp32(sink: &mut CodeSink, reg: RegUnit, base: RegUnit, disp: i32) {
    let modrm = 0x80 | (hw_encoding(reg) << 3) | hw_encoding(base);
    sink.push_u8(modrm);
    if hw_encoding(base) == 4 {
        // rsp/r12 as a base requires an explicit SIB byte (no index, scale 0).
        sink.push_u8(0x24);
    }
    sink.push_i32_le(disp);
}

/// `ModRM`+`SIB`+disp32 for `[base + index*1 + disp32]` addressing.
fn push_mem_base_index_disp32(sink: &mut CodeSink, reg: RegUnit, base: RegUnit, index: RegUnit, disp: i32) {
    let modrm = 0x80 | (hw_encoding(reg) << 3) | 0x04;
    sink.push_u8(modrm);
    let sib = (0u8 << 6) | (hw_encoding(index) << 3) | hw_encoding(base);
    sink.push_u8(sib);
    sink.push_i32_le(disp);
}

/// `ModRM` + disp32 for RIP-relative addressing (`mod == 00, rm == 101`).
/// Returns the offset of the disp32 field, counted from the end of which
/// the caller computes a rodata/near-call fixup.
fn push_mem_rip_disp32(sink: &mut CodeSink, reg: RegUnit) -> u32 {
    sink.push_u8((hw_encoding(reg) << 3) | 0x05);
    let at = sink.offset();
    sink.push_i32_le(0);
    at
}

/// `op dst, [rip + disp32]`. Returns the disp32 field's offset; the caller
/// registers a `RodataRefKind::Rip32` fixup once it knows the instruction's
/// total length.
pub fn mem_rip(sink: &mut CodeSink, op: MemOp, reg: RegUnit) -> u32 {
    emit_mem_prefix(sink, op, reg, 0);
    push_mem_rip_disp32(sink, reg)
}

/// `mov dst, src` (GP, 64-bit).
pub fn mov_rr(sink: &mut CodeSink, dst: RegUnit, src: RegUnit) {
    if is_fp(dst) || is_fp(src) {
        // movaps/movapd equivalent register move for xmm<->xmm.
        sink.push_u8(0x66);
        push_rex(sink, false, src, 0, dst);
        sink.push_bytes(&[0x0f, 0x28]);
        sink.push_u8(modrm_reg(src, dst));
        return;
    }
    push_rex(sink, true, src, 0, dst);
    sink.push_u8(0x89);
    sink.push_u8(modrm_reg(src, dst));
}

/// `movabs dst, imm64`.
pub fn mov_imm64(sink: &mut CodeSink, dst: RegUnit, imm: u64) {
    push_rex(sink, true, 0, 0, dst);
    sink.push_u8(0xB8 | hw_encoding(dst));
    sink.push_u64_le(imm);
}

/// `mov dst, imm32` (sign-extended in a 64-bit destination).
pub fn mov_imm32(sink: &mut CodeSink, dst: RegUnit, imm: i32) {
    push_rex(sink, true, 0, 0, dst);
    sink.push_u8(0xC7);
    sink.push_u8(0xC0 | hw_encoding(dst));
    sink.push_i32_le(imm);
}

/// One of the eight `/r` two-operand arithmetic opcodes sharing the
/// "`op r, r/m`" ModRM shape (`add`, `or`, `adc`, `sbb`, `and`, `sub`,
/// `xor`, `cmp`).
#[derive(Clone, Copy)]
pub enum ArithOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl ArithOp {
    fn opcode_rm_r(self) -> u8 {
        match self {
            ArithOp::Add => 0x01,
            ArithOp::Or => 0x09,
            ArithOp::And => 0x21,
            ArithOp::Sub => 0x29,
            ArithOp::Xor => 0x31,
            ArithOp::Cmp => 0x39,
        }
    }

    fn imm_group_ext(self) -> u8 {
        match self {
            ArithOp::Add => 0,
            ArithOp::Or => 1,
            ArithOp::And => 4,
            ArithOp::Sub => 5,
            ArithOp::Xor => 6,
            ArithOp::Cmp => 7,
        }
    }
}

/// `op dst, src` with `dst := dst OP src` (destructive two-operand form).
pub fn arith_rr(sink: &mut CodeSink, op: ArithOp, dst: RegUnit, src: RegUnit) {
    push_rex(sink, true, src, 0, dst);
    sink.push_u8(op.opcode_rm_r());
    sink.push_u8(modrm_reg(src, dst));
}

/// `op dst, imm32` (group-1 `/n ib`/`id` encoding, sign-extended imm32).
pub fn arith_ri(sink: &mut CodeSink, op: ArithOp, dst: RegUnit, imm: i32) {
    push_rex(sink, true, 0, 0, dst);
    sink.push_u8(0x81);
    sink.push_u8(0xC0 | (op.imm_group_ext() << 3) | hw_encoding(dst));
    sink.push_i32_le(imm);
}

/// `imul dst, src` (two-operand signed multiply, 64-bit).
pub fn imul_rr(sink: &mut CodeSink, dst: RegUnit, src: RegUnit) {
    push_rex(sink, true, dst, 0, src);
    sink.push_bytes(&[0x0f, 0xaf]);
    sink.push_u8(modrm_reg(dst, src));
}

/// `imul dst, src, imm32`.
pub fn imul_rri(sink: &mut CodeSink, dst: RegUnit, src: RegUnit, imm: i32) {
    push_rex(sink, true, dst, 0, src);
    sink.push_u8(0x69);
    sink.push_u8(modrm_reg(dst, src));
    sink.push_i32_le(imm);
}

/// `neg dst` / `not dst` (group-3 unary, `/3` and `/2`).
pub fn unary_group3(sink: &mut CodeSink, ext: u8, dst: RegUnit) {
    push_rex(sink, true, 0, 0, dst);
    sink.push_u8(0xF7);
    sink.push_u8(0xC0 | (ext << 3) | hw_encoding(dst));
}

/// `cqo` (sign-extend `rax` into `rdx:rax`, precedes a signed divide).
pub fn cqo(sink: &mut CodeSink) {
    sink.push_bytes(&[0x48, 0x99]);
}

/// `xor edx, edx` (clears `rdx` before an unsigned divide).
pub fn zero_edx(sink: &mut CodeSink) {
    sink.push_bytes(&[0x31, 0xd2]);
}

/// `idiv src` / `div src` (group-3 `/7` and `/6`): `rdx:rax / src`, quotient
/// in `rax`, remainder in `rdx`.
pub fn div_group3(sink: &mut CodeSink, ext: u8, src: RegUnit) {
    push_rex(sink, true, 0, 0, src);
    sink.push_u8(0xF7);
    sink.push_u8(0xC0 | (ext << 3) | hw_encoding(src));
}

/// `sal`/`sar`/`shr dst, cl` (group-2, shift count pinned in `cl` by the
/// allocator's constraints for shift ops).
pub fn shift_cl(sink: &mut CodeSink, ext: u8, dst: RegUnit) {
    push_rex(sink, true, 0, 0, dst);
    sink.push_u8(0xD3);
    sink.push_u8(0xC0 | (ext << 3) | hw_encoding(dst));
}

/// `sal`/`sar`/`shr dst, imm8`.
pub fn shift_imm(sink: &mut CodeSink, ext: u8, dst: RegUnit, amount: u8) {
    push_rex(sink, true, 0, 0, dst);
    sink.push_u8(0xC1);
    sink.push_u8(0xC0 | (ext << 3) | hw_encoding(dst));
    sink.push_u8(amount);
}

/// `setCC dst8` followed by `movzx dst, dst8` (compares producing 0/1,
/// spec §6 "Compares producing 0/1").
pub fn setcc(sink: &mut CodeSink, cc: u8, dst: RegUnit) {
    push_rex(sink, false, 0, 0, dst);
    sink.push_bytes(&[0x0f, 0x90 | cc]);
    sink.push_u8(0xC0 | hw_encoding(dst));
    push_rex(sink, true, dst, 0, dst);
    sink.push_bytes(&[0x0f, 0xb6]);
    sink.push_u8(modrm_reg(dst, dst));
}

/// `jCC rel32` (near conditional jump). Returns the offset of the trailing
/// `rel32` field for the caller to register as a local branch fixup.
pub fn jcc_rel32(sink: &mut CodeSink, cc: u8) -> u32 {
    sink.push_bytes(&[0x0f, 0x80 | cc]);
    let at = sink.offset();
    sink.push_i32_le(0);
    at
}

/// `jmp rel32`. Returns the `rel32` field's offset.
pub fn jmp_rel32(sink: &mut CodeSink) -> u32 {
    sink.push_u8(0xe9);
    let at = sink.offset();
    sink.push_i32_le(0);
    at
}

/// `call rel32` (near relative call; patched later against the callee's
/// module offset, spec §4.6 "Calls"). Returns the `rel32` field's offset.
pub fn call_rel32(sink: &mut CodeSink) -> u32 {
    sink.push_u8(0xe8);
    let at = sink.offset();
    sink.push_i32_le(0);
    at
}

/// `call r64` (indirect call through a register holding a computed address).
pub fn call_indirect(sink: &mut CodeSink, target: RegUnit) {
    push_rex(sink, false, 0, 0, target);
    sink.push_u8(0xff);
    sink.push_u8(0xC0 | (2 << 3) | hw_encoding(target));
}

/// `jmp r64` (indirect jump through a register; used for `tcallp`'s tail
/// call once the epilogue has already torn down the frame).
pub fn jmp_indirect(sink: &mut CodeSink, target: RegUnit) {
    push_rex(sink, false, 0, 0, target);
    sink.push_u8(0xff);
    sink.push_u8(0xC0 | (4 << 3) | hw_encoding(target));
}

/// `push r64` / `pop r64`.
pub fn push_reg(sink: &mut CodeSink, r: RegUnit) {
    if needs_rex_extension(r) {
        sink.push_u8(0x41);
    }
    sink.push_u8(0x50 | hw_encoding(r));
}

#[allow(missing_docs)]
pub fn pop_reg(sink: &mut CodeSink, r: RegUnit) {
    if needs_rex_extension(r) {
        sink.push_u8(0x41);
    }
    sink.push_u8(0x58 | hw_encoding(r));
}

/// `ret`.
pub fn ret(sink: &mut CodeSink) {
    sink.push_u8(0xc3);
}

/// `lea dst, [rip + disp32]`. Returns the offset of the trailing disp32
/// (the caller registers this as a rodata fixup; the disp is counted from
/// the *end* of this instruction).
pub fn lea_rip(sink: &mut CodeSink, dst: RegUnit) -> u32 {
    push_rex(sink, true, dst, 0, 0);
    sink.push_bytes(&[0x8d, 0x05 | (hw_encoding(dst) << 3)]);
    let at = sink.offset();
    sink.push_i32_le(0);
    at
}

/// Memory-width-tagged load/store opcode selection (spec §6 "Memory").
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    LoadZx8,
    LoadZx16,
    LoadZx32,
    LoadSx8,
    LoadSx16,
    LoadSx32,
    Load64,
    LoadF32,
    LoadF64,
    Store8,
    Store16,
    Store32,
    Store64,
    StoreF32,
    StoreF64,
}

/// `op dst, [base + disp32]`.
pub fn mem_base_disp32(sink: &mut CodeSink, op: MemOp, reg: RegUnit, base: RegUnit, disp: i32) {
    emit_mem_prefix(sink, op, reg, base);
    push_mem_base_disp32(sink, reg, base, disp);
}

/// `op dst, [base + index + disp32]`.
pub fn mem_base_index_disp32(
    sink: &mut CodeSink,
    op: MemOp,
    reg: RegUnit,
    base: RegUnit,
    index: RegUnit,
    disp: i32,
) {
    emit_mem_prefix(sink, op, reg, base);
    push_mem_base_index_disp32(sink, reg, base, index, disp);
}

fn emit_mem_prefix(sink: &mut CodeSink, op: MemOp, reg: RegUnit, base_or_index: RegUnit) {
    match op {
        MemOp::LoadZx8 => {
            push_rex(sink, true, reg, 0, base_or_index);
            sink.push_bytes(&[0x0f, 0xb6]);
        }
        MemOp::LoadZx16 => {
            push_rex(sink, true, reg, 0, base_or_index);
            sink.push_bytes(&[0x0f, 0xb7]);
        }
        MemOp::LoadZx32 => {
            push_rex(sink, false, reg, 0, base_or_index);
            sink.push_u8(0x8b);
        }
        MemOp::LoadSx8 => {
            push_rex(sink, true, reg, 0, base_or_index);
            sink.push_bytes(&[0x0f, 0xbe]);
        }
        MemOp::LoadSx16 => {
            push_rex(sink, true, reg, 0, base_or_index);
            sink.push_bytes(&[0x0f, 0xbf]);
        }
        MemOp::LoadSx32 => {
            push_rex(sink, true, reg, 0, base_or_index);
            sink.push_u8(0x63);
        }
        MemOp::Load64 => {
            push_rex(sink, true, reg, 0, base_or_index);
            sink.push_u8(0x8b);
        }
        MemOp::LoadF32 => {
            sink.push_u8(0xf3);
            push_rex(sink, false, reg, 0, base_or_index);
            sink.push_bytes(&[0x0f, 0x10]);
        }
        MemOp::LoadF64 => {
            sink.push_u8(0xf2);
            push_rex(sink, false, reg, 0, base_or_index);
            sink.push_bytes(&[0x0f, 0x10]);
        }
        MemOp::Store8 => {
            push_rex(sink, false, reg, 0, base_or_index);
            sink.push_u8(0x88);
        }
        MemOp::Store16 => {
            sink.push_u8(0x66);
            push_rex(sink, false, reg, 0, base_or_index);
            sink.push_u8(0x89);
        }
        MemOp::Store32 => {
            push_rex(sink, false, reg, 0, base_or_index);
            sink.push_u8(0x89);
        }
        MemOp::Store64 => {
            push_rex(sink, true, reg, 0, base_or_index);
            sink.push_u8(0x89);
        }
        MemOp::StoreF32 => {
            sink.push_u8(0xf3);
            push_rex(sink, false, reg, 0, base_or_index);
            sink.push_bytes(&[0x0f, 0x11]);
        }
        MemOp::StoreF64 => {
            sink.push_u8(0xf2);
            push_rex(sink, false, reg, 0, base_or_index);
            sink.push_bytes(&[0x0f, 0x11]);
        }
    }
}

/// `cvtsi2sd`/`cvtsi2ss dst(xmm), src(gp)` -- int-to-float conversions.
pub fn cvt_int_to_float(sink: &mut CodeSink, double: bool, dst: RegUnit, src: RegUnit) {
    sink.push_u8(if double { 0xf2 } else { 0xf3 });
    push_rex(sink, true, dst, 0, src);
    sink.push_bytes(&[0x0f, 0x2a]);
    sink.push_u8(modrm_reg(dst, src));
}

/// `cvttsd2si`/`cvttss2si dst(gp), src(xmm)` -- float-to-int (truncating).
pub fn cvt_float_to_int(sink: &mut CodeSink, double: bool, dst: RegUnit, src: RegUnit) {
    sink.push_u8(if double { 0xf2 } else { 0xf3 });
    push_rex(sink, true, dst, 0, src);
    sink.push_bytes(&[0x0f, 0x2c]);
    sink.push_u8(modrm_reg(dst, src));
}

/// `cvtss2sd`/`cvtsd2ss dst, src` -- float<->double.
pub fn cvt_float_width(sink: &mut CodeSink, widen: bool, dst: RegUnit, src: RegUnit) {
    sink.push_u8(if widen { 0xf3 } else { 0xf2 });
    push_rex(sink, false, dst, 0, src);
    sink.push_bytes(&[0x0f, 0x5a]);
    sink.push_u8(modrm_reg(dst, src));
}

/// `movq`/`movd` bitcast between a GP register and an xmm register.
pub fn bitcast(sink: &mut CodeSink, double: bool, gp_to_fp: bool, dst: RegUnit, src: RegUnit) {
    sink.push_u8(0x66);
    if gp_to_fp {
        push_rex(sink, double, dst, 0, src);
        sink.push_bytes(&[0x0f, 0x6e]);
        sink.push_u8(modrm_reg(dst, src));
    } else {
        push_rex(sink, double, src, 0, dst);
        sink.push_bytes(&[0x0f, 0x7e]);
        sink.push_u8(modrm_reg(src, dst));
    }
}

/// `addsd`/`subsd`/`mulsd`/`divsd` and their single-precision forms.
#[derive(Clone, Copy)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl FloatOp {
    fn opcode(self) -> u8 {
        match self {
            FloatOp::Add => 0x58,
            FloatOp::Sub => 0x5c,
            FloatOp::Mul => 0x59,
            FloatOp::Div => 0x5e,
        }
    }
}

/// `op dst, src` (SSE2 scalar, destructive two-operand).
pub fn float_rr(sink: &mut CodeSink, op: FloatOp, double: bool, dst: RegUnit, src: RegUnit) {
    sink.push_u8(if double { 0xf2 } else { 0xf3 });
    push_rex(sink, false, dst, 0, src);
    sink.push_bytes(&[0x0f, op.opcode()]);
    sink.push_u8(modrm_reg(dst, src));
}

/// `xorpd`/`xorps dst, dst` then a scalar subtract from zero (negate), or a
/// `andps`/`andpd` against an all-but-sign-bit mask (abs) -- both
/// implemented by the caller against a constant-pool mask, this helper only
/// covers the `xorps`/`andps` register-register shape.
pub fn float_bitop_rr(sink: &mut CodeSink, and_not_xor: bool, dst: RegUnit, src: RegUnit) {
    sink.push_u8(0x66);
    push_rex(sink, false, dst, 0, src);
    sink.push_u8(0x0f);
    sink.push_u8(if and_not_xor { 0x54 } else { 0x57 });
    sink.push_u8(modrm_reg(dst, src));
}

/// `andps`/`xorps dst, [rip + disp32]` against a constant-pool sign mask
/// (spec §6 "Float arithmetic" `fneg`/`fabs`/`dneg`/`dabs`). Returns the
/// disp32 field's offset for a rodata fixup.
pub fn float_bitop_rip(sink: &mut CodeSink, and_not_xor: bool, dst: RegUnit) -> u32 {
    sink.push_u8(0x66);
    push_rex(sink, false, dst, 0, 0);
    sink.push_u8(0x0f);
    sink.push_u8(if and_not_xor { 0x54 } else { 0x57 });
    push_mem_rip_disp32(sink, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_rr_needs_rex_w_for_gp() {
        let mut sink = CodeSink::new();
        mov_rr(&mut sink, 1, 0);
        assert_eq!(sink.bytes[0] & 0xf8, 0x48);
    }

    #[test]
    fn jmp_rel32_reserves_four_bytes() {
        let mut sink = CodeSink::new();
        let at = jmp_rel32(&mut sink);
        assert_eq!(at, 1);
        assert_eq!(sink.bytes.len(), 5);
    }

    #[test]
    fn push_pop_use_rex_b_for_extended_registers() {
        let mut sink = CodeSink::new();
        push_reg(&mut sink, crate::isa::x86::registers::R12);
        assert_eq!(sink.bytes[0], 0x41);
        assert_eq!(sink.bytes[1], 0x50 | 4);
    }
}
