//! AArch64 instruction words (spec §4.6 "AArch64 emission", §6 "AArch64").
//!
//! Every A64 instruction is a fixed 4-byte little-endian word, so this layer
//! is simpler than x86's variable-length REX/ModRM scheme: each helper
//! builds one `u32` and pushes it whole. Addressing modes are intentionally
//! narrowed to what this back-end actually needs: register-register data
//! processing, PC-relative literal loads for the constant pool, and a single
//! "materialize the effective address into the scratch register, then use
//! a zero-displacement load/store" path for memory ops, rather than chasing
//! AArch64's several scaled/unscaled/pre/post-index immediate forms. This
//! trades code density for one code path; see `isa::aarch64::X9` for the
//! reserved scratch register this relies on.

use crate::binemit::CodeSink;
use crate::ir::RegUnit;
use crate::isa::aarch64::registers::{hw_encoding, is_fp};

fn push(sink: &mut CodeSink, word: u32) {
    sink.push_u32_le(word);
}

/// `MOVZ`/`MOVK Xd, #imm16, LSL #(16*hw)`.
fn movz(sink: &mut CodeSink, dst: RegUnit, imm16: u16, hw: u32) {
    push(sink, 0xD2800000 | (hw << 21) | ((imm16 as u32) << 5) | hw_encoding(dst));
}
fn movk(sink: &mut CodeSink, dst: RegUnit, imm16: u16, hw: u32) {
    push(sink, 0xF2800000 | (hw << 21) | ((imm16 as u32) << 5) | hw_encoding(dst));
}

/// Load a full 64-bit constant into `dst` via four `movz`/`movk` (spec §6
/// "Constants" `lci`). Always emits all four words; this back-end does not
/// special-case constants whose upper halves happen to be zero.
pub fn mov_imm64(sink: &mut CodeSink, dst: RegUnit, imm: u64) {
    movz(sink, dst, (imm & 0xffff) as u16, 0);
    movk(sink, dst, ((imm >> 16) & 0xffff) as u16, 1);
    movk(sink, dst, ((imm >> 32) & 0xffff) as u16, 2);
    movk(sink, dst, ((imm >> 48) & 0xffff) as u16, 3);
}

/// Sign-extend a 32-bit immediate the same way `mov_imm64` would for a
/// 64-bit value with that sign.
pub fn mov_imm32(sink: &mut CodeSink, dst: RegUnit, imm: i32) {
    mov_imm64(sink, dst, imm as i64 as u64);
}

/// `MOV Xd, Xn` / `FMOV Dd, Dn` (register-register move, selecting the GP
/// or FP encoding from whether either operand is in the FP bank).
pub fn mov_rr(sink: &mut CodeSink, dst: RegUnit, src: RegUnit) {
    if is_fp(dst) || is_fp(src) {
        push(sink, 0x1E604000 | (hw_encoding(src) << 5) | hw_encoding(dst));
    } else {
        // ORR Xd, XZR, Xn.
        push(sink, 0xAA0003E0 | (hw_encoding(src) << 16) | hw_encoding(dst));
    }
}

/// The data-processing (register) binary opcodes this back-end lowers to
/// directly (spec §6 "Integer arithmetic", "Bitwise").
#[derive(Clone, Copy)]
pub enum DpOp {
    Add,
    Sub,
    And,
    Orr,
    Eor,
}

impl DpOp {
    fn base(self) -> u32 {
        match self {
            DpOp::Add => 0x8B000000,
            DpOp::Sub => 0xCB000000,
            DpOp::And => 0x8A000000,
            DpOp::Orr => 0xAA000000,
            DpOp::Eor => 0xCA000000,
        }
    }
}

/// `op Xd, Xn, Xm` (shifted register, no shift).
pub fn dp_rr(sink: &mut CodeSink, op: DpOp, dst: RegUnit, lhs: RegUnit, rhs: RegUnit) {
    push(
        sink,
        op.base() | (hw_encoding(rhs) << 16) | (hw_encoding(lhs) << 5) | hw_encoding(dst),
    );
}

/// `CMP Xn, Xm` (`SUBS XZR, Xn, Xm`).
pub fn cmp_rr(sink: &mut CodeSink, lhs: RegUnit, rhs: RegUnit) {
    push(sink, 0xEB00001F | (hw_encoding(rhs) << 16) | (hw_encoding(lhs) << 5));
}

/// `MUL Xd, Xn, Xm` (`MADD Xd, Xn, Xm, XZR`).
pub fn mul_rr(sink: &mut CodeSink, dst: RegUnit, lhs: RegUnit, rhs: RegUnit) {
    push(
        sink,
        0x9B007C00 | (hw_encoding(rhs) << 16) | (hw_encoding(lhs) << 5) | hw_encoding(dst),
    );
}

/// `SDIV`/`UDIV Xd, Xn, Xm`.
pub fn div_rr(sink: &mut CodeSink, signed: bool, dst: RegUnit, lhs: RegUnit, rhs: RegUnit) {
    let base = if signed { 0x9AC00C00 } else { 0x9AC00800 };
    push(sink, base | (hw_encoding(rhs) << 16) | (hw_encoding(lhs) << 5) | hw_encoding(dst));
}

/// `MSUB Xd, Xn, Xm, Xa` (`Xd := Xa - Xn*Xm`; used to compute a remainder
/// from an already-divided quotient, spec §6 `imod`/`umod`).
pub fn msub_rr(sink: &mut CodeSink, dst: RegUnit, lhs: RegUnit, rhs: RegUnit, minuend: RegUnit) {
    push(
        sink,
        0x9B008000
            | (hw_encoding(rhs) << 16)
            | (hw_encoding(minuend) << 10)
            | (hw_encoding(lhs) << 5)
            | hw_encoding(dst),
    );
}

/// `NEG Xd, Xm` (`SUB Xd, XZR, Xm`).
pub fn neg(sink: &mut CodeSink, dst: RegUnit, src: RegUnit) {
    push(sink, 0xCB0003E0 | (hw_encoding(src) << 16) | hw_encoding(dst));
}

/// `MVN Xd, Xm` (`ORN Xd, XZR, Xm`).
pub fn mvn(sink: &mut CodeSink, dst: RegUnit, src: RegUnit) {
    push(sink, 0xAA2003E0 | (hw_encoding(src) << 16) | hw_encoding(dst));
}

/// The three register-controlled shift opcodes.
#[derive(Clone, Copy)]
pub enum ShiftOp {
    Lsl,
    Lsr,
    Asr,
}

/// `op Xd, Xn, Xm` (variable shift amount in `Xm`, spec `ishl`/`ishr`/`ushr`).
pub fn shift_rr(sink: &mut CodeSink, op: ShiftOp, dst: RegUnit, src: RegUnit, amount: RegUnit) {
    let base = match op {
        ShiftOp::Lsl => 0x9AC02000,
        ShiftOp::Lsr => 0x9AC02400,
        ShiftOp::Asr => 0x9AC02800,
    };
    push(sink, base | (hw_encoding(amount) << 16) | (hw_encoding(src) << 5) | hw_encoding(dst));
}

/// Sign-extend the low `bits` (8/16/32) of `src` into `dst` (`SXTB`/`SXTH`/
/// `SXTW`, aliases of `SBFM`).
pub fn sign_extend(sink: &mut CodeSink, bits: u32, dst: RegUnit, src: RegUnit) {
    let imms = bits - 1;
    push(sink, 0x93400000 | (imms << 10) | (hw_encoding(src) << 5) | hw_encoding(dst));
}

/// `ADD`/`SUB Xd, Xn, #imm` (12-bit unsigned immediate, optionally shifted
/// left by 12). `Xn`/`Xd` of value 31 addresses `sp`, not `xzr`, for this
/// specific instruction form -- used by the prologue/epilogue for frame
/// (de)allocation.
pub fn add_sub_imm(sink: &mut CodeSink, is_sub: bool, dst: RegUnit, src: RegUnit, imm: i64) {
    let (imm12, shift) = if imm & 0xfff == imm {
        (imm as u32, 0u32)
    } else {
        debug_assert_eq!(imm & 0xfff, 0, "frame size must be imm12 or imm12<<12");
        ((imm >> 12) as u32, 1u32)
    };
    let base = if is_sub { 0xD1000000 } else { 0x91000000 };
    push(
        sink,
        base | (shift << 22) | ((imm12 & 0xfff) << 10) | (hw_encoding(src) << 5) | hw_encoding(dst),
    );
}

/// `RET` (branch to `x30`).
pub fn ret(sink: &mut CodeSink) {
    push(sink, 0xD65F03C0);
}

/// `BR`/`BLR Xn` (indirect branch, with or without link).
pub fn br_indirect(sink: &mut CodeSink, link: bool, target: RegUnit) {
    let base = if link { 0xD63F0000 } else { 0xD61F0000 };
    push(sink, base | (hw_encoding(target) << 5));
}

/// `B label` (26-bit word-granularity immediate). Returns the offset of the
/// instruction word itself -- for intra-procedure fixups the caller
/// recomputes and overwrites the whole word once the target is known.
pub fn b(sink: &mut CodeSink) -> u32 {
    let at = sink.offset();
    push(sink, 0x14000000);
    at
}

/// `ADR Xd, label` (21-bit byte-granularity immediate, split across
/// `immlo`/`immhi`). Used for `lnp` (spec §6 "Constants" `lnp`): the
/// relocation is resolved later by `Aarch64Isa::patch_near_call`, which
/// recovers `Xd` from the already-emitted word rather than threading it
/// through separately.
pub fn encode_adr(rd: RegUnit, disp: i32) -> u32 {
    let immlo = (disp as u32) & 0x3;
    let immhi = ((disp >> 2) as u32) & 0x7ffff;
    0x10000000 | (immlo << 29) | (immhi << 5) | hw_encoding(rd)
}

/// Emit a placeholder `ADR Xd, .+0`, to be patched once the target's
/// position is known. Returns the instruction word's own offset.
pub fn adr(sink: &mut CodeSink, dst: RegUnit) -> u32 {
    let at = sink.offset();
    push(sink, encode_adr(dst, 0));
    at
}

/// `BL label`, used for near calls (spec §6 "ABI" `icalln`/`fcalln`/`dcalln`).
pub fn bl(sink: &mut CodeSink) -> u32 {
    let at = sink.offset();
    push(sink, 0x94000000);
    at
}

/// Recompute a `B`/`BL` word with a fresh word-granularity displacement
/// (`at` and `target` both absolute byte offsets).
pub fn encode_b_or_bl(link: bool, at: i64, target: i64) -> u32 {
    let disp_words = ((target - at) / 4) as i32;
    let base = if link { 0x94000000 } else { 0x14000000 };
    base | ((disp_words as u32) & 0x03ff_ffff)
}

/// `B.cond label` (19-bit word-granularity immediate). Returns the
/// instruction word's offset for a local fixup.
pub fn b_cond(sink: &mut CodeSink, cc: u8) -> u32 {
    let at = sink.offset();
    push(sink, 0x54000000 | (cc as u32));
    at
}

/// Recompute a `B.cond` word with a fresh displacement, preserving `cc`.
pub fn encode_b_cond(cc: u8, at: i64, target: i64) -> u32 {
    let disp_words = ((target - at) / 4) as i32;
    0x54000000 | (((disp_words as u32) & 0x7ffff) << 5) | (cc as u32)
}

/// `CBZ`/`CBNZ Xt, label`. Returns the instruction word's offset.
pub fn cbz(sink: &mut CodeSink, nonzero: bool, t: RegUnit) -> u32 {
    let at = sink.offset();
    let base = if nonzero { 0xB5000000 } else { 0xB4000000 };
    push(sink, base | hw_encoding(t));
    at
}

/// Recompute a `CBZ`/`CBNZ` word with a fresh displacement, preserving the
/// register and zero/nonzero sense.
pub fn encode_cbz(nonzero: bool, t: RegUnit, at: i64, target: i64) -> u32 {
    let disp_words = ((target - at) / 4) as i32;
    let base = if nonzero { 0xB5000000 } else { 0xB4000000 };
    base | (((disp_words as u32) & 0x7ffff) << 5) | hw_encoding(t)
}

/// `CSET Xd, cond` (`CSINC Xd, XZR, XZR, invert(cond)`).
pub fn cset(sink: &mut CodeSink, cc: u8, dst: RegUnit) {
    let inverted = cc ^ 1;
    push(sink, 0x9A9F07E0 | ((inverted as u32) << 12) | hw_encoding(dst));
}

/// `FCMP Sn, Sm` / `FCMP Dn, Dm`.
pub fn fcmp(sink: &mut CodeSink, double: bool, lhs: RegUnit, rhs: RegUnit) {
    let base = if double { 0x1E602000 } else { 0x1E202000 };
    push(sink, base | (hw_encoding(rhs) << 16) | (hw_encoding(lhs) << 5));
}

/// The four scalar FP arithmetic opcodes.
#[derive(Clone, Copy)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// `op Sd, Sn, Sm` / `op Dd, Dn, Dm`.
pub fn fp_rr(sink: &mut CodeSink, op: FpOp, double: bool, dst: RegUnit, lhs: RegUnit, rhs: RegUnit) {
    let opc = match op {
        FpOp::Add => 0x2800,
        FpOp::Sub => 0x3800,
        FpOp::Mul => 0x0800,
        FpOp::Div => 0x1800,
    };
    let base = 0x1E200000 | opc | if double { 1 << 22 } else { 0 };
    push(sink, base | (hw_encoding(rhs) << 16) | (hw_encoding(lhs) << 5) | hw_encoding(dst));
}

/// `FNEG`/`FABS Sd, Sn` / `Dd, Dn`.
pub fn fp_unary(sink: &mut CodeSink, negate: bool, double: bool, dst: RegUnit, src: RegUnit) {
    let opc = if negate { 0x4000 } else { 0xC000 };
    let base = 0x1E200000 | opc | if double { 1 << 22 } else { 0 };
    push(sink, base | (hw_encoding(src) << 5) | hw_encoding(dst));
}

/// `SCVTF Sd, Xn` / `Dd, Xn` (signed 64-bit integer to float/double).
pub fn scvtf(sink: &mut CodeSink, double: bool, dst: RegUnit, src: RegUnit) {
    let base = if double { 0x9E630000 } else { 0x9E230000 };
    push(sink, base | (hw_encoding(src) << 5) | hw_encoding(dst));
}

/// `FCVTZS Xd, Sn` / `Xd, Dn` (truncating float/double to signed 64-bit).
pub fn fcvtzs(sink: &mut CodeSink, double: bool, dst: RegUnit, src: RegUnit) {
    let base = if double { 0x9E780000 } else { 0x9E380000 };
    push(sink, base | (hw_encoding(src) << 5) | hw_encoding(dst));
}

/// `FCVT` between single and double precision.
pub fn fcvt(sink: &mut CodeSink, widen: bool, dst: RegUnit, src: RegUnit) {
    let base = if widen { 0x1E22C000 } else { 0x1E624000 };
    push(sink, base | (hw_encoding(src) << 5) | hw_encoding(dst));
}

/// `FMOV Xd, Dn` (`gp_to_fp = false`) or `FMOV Dd, Xn` (`gp_to_fp = true`):
/// raw 64-bit bit-pattern move between banks (spec `bci2d`/`bcd2i`, and this
/// back-end's f32 bitcasts, which are widened to the 64-bit path -- see the
/// module doc comment).
pub fn fmov_bitcast(sink: &mut CodeSink, gp_to_fp: bool, dst: RegUnit, src: RegUnit) {
    let base = if gp_to_fp { 0x9E670000 } else { 0x9E660000 };
    push(sink, base | (hw_encoding(src) << 5) | hw_encoding(dst));
}

/// Memory-op width/signedness/float selector (spec §6 "Memory"), mirroring
/// `isa::x86::encode::MemOp`'s role but over AArch64's load/store-register
/// (no-offset) encodings; all addressing is pre-resolved into `Xn` by the
/// caller (see the module doc comment).
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

/// `op Rt, [Xn]` (unsigned-offset form with a zero immediate).
pub fn mem_zero_offset(sink: &mut CodeSink, op: MemOp, rt: RegUnit, base: RegUnit) {
    let opcode = match op {
        MemOp::LoadZx8 => 0x39400000,
        MemOp::LoadSx8 => 0x39800000,
        MemOp::LoadZx16 => 0x79400000,
        MemOp::LoadSx16 => 0x79800000,
        MemOp::LoadZx32 => 0xB9400000,
        MemOp::LoadSx32 => 0xB9800000,
        MemOp::Load64 => 0xF9400000,
        MemOp::LoadF32 => 0xBD400000,
        MemOp::LoadF64 => 0xFD400000,
        MemOp::Store8 => 0x39000000,
        MemOp::Store16 => 0x79000000,
        MemOp::Store32 => 0xB9000000,
        MemOp::Store64 => 0xF9000000,
        MemOp::StoreF32 => 0xBD000000,
        MemOp::StoreF64 => 0xFD000000,
    };
    push(sink, opcode | (hw_encoding(base) << 5) | hw_encoding(rt));
}

/// `op Rt, [Xn, Xm]` (register-offset form, no extend/shift).
pub fn mem_reg_offset(sink: &mut CodeSink, op: MemOp, rt: RegUnit, base: RegUnit, index: RegUnit) {
    let opcode = match op {
        MemOp::LoadZx8 => 0x38606800,
        MemOp::LoadSx8 => 0x38A06800,
        MemOp::LoadZx16 => 0x78606800,
        MemOp::LoadSx16 => 0x78A06800,
        MemOp::LoadZx32 => 0xB8606800,
        MemOp::LoadSx32 => 0xB8A06800,
        MemOp::Load64 => 0xF8606800,
        MemOp::LoadF32 => 0xBC606800,
        MemOp::LoadF64 => 0xFC606800,
        MemOp::Store8 => 0x38206800,
        MemOp::Store16 => 0x78206800,
        MemOp::Store32 => 0xB8206800,
        MemOp::Store64 => 0xF8206800,
        MemOp::StoreF32 => 0xBC206800,
        MemOp::StoreF64 => 0xFC206800,
    };
    push(sink, opcode | (hw_encoding(index) << 16) | (hw_encoding(base) << 5) | hw_encoding(rt));
}

/// `LDR`/`STR Rt, [Xn, #disp]` (unsigned-offset form, `disp` scaled by 8).
/// Used only for frame-relative spill slots and the callee-saved save area,
/// where offsets are always non-negative 8-byte multiples small enough to
/// fit the 12-bit scaled immediate -- unlike general `load`/`store` ops,
/// which go through `mem_zero_offset` over a materialized address instead
/// (see the module doc comment).
pub fn mem_unsigned_offset8(sink: &mut CodeSink, is_store: bool, is_fp_reg: bool, rt: RegUnit, base: RegUnit, disp: i32) {
    debug_assert_eq!(disp % 8, 0, "frame slots are always 8-byte aligned");
    debug_assert!((0..=32760).contains(&disp), "frame offset out of imm12<<3 range");
    let imm12 = (disp / 8) as u32;
    let opcode = match (is_store, is_fp_reg) {
        (false, false) => 0xF9400000u32,
        (false, true) => 0xFD400000,
        (true, false) => 0xF9000000,
        (true, true) => 0xFD000000,
    };
    push(sink, opcode | ((imm12 & 0xfff) << 10) | (hw_encoding(base) << 5) | hw_encoding(rt));
}

/// `LDR Rt, label` (PC-relative literal load; spec §6 "Constants"
/// `lcf`/`lcd`, the `RodataRefKind::Literal19` fixup kind). Returns the
/// instruction word's own offset.
pub fn ldr_literal(sink: &mut CodeSink, double: bool, rt: RegUnit) -> u32 {
    let at = sink.offset();
    let base = if double { 0x5C000000 } else { 0x1C000000 };
    push(sink, base | hw_encoding(rt));
    at
}

/// `DMB ISH` (full-barrier stand-in for `fence`).
pub fn dmb_ish(sink: &mut CodeSink) {
    push(sink, 0xD5033BBF);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_imm64_emits_one_word_per_halfword() {
        let mut sink = CodeSink::new();
        mov_imm64(&mut sink, 0, 0x1122_3344_5566_7788);
        assert_eq!(sink.bytes.len(), 16);
    }

    #[test]
    fn add_sub_imm_selects_shift_for_page_sized_immediates() {
        let mut sink = CodeSink::new();
        add_sub_imm(&mut sink, true, 31, 31, 0x1000);
        let word = u32::from_le_bytes(sink.bytes[..4].try_into().unwrap());
        assert_eq!((word >> 22) & 1, 1);
    }

    #[test]
    fn bl_reserves_a_full_word() {
        let mut sink = CodeSink::new();
        let at = bl(&mut sink);
        assert_eq!(at, 0);
        assert_eq!(sink.bytes.len(), 4);
    }

    #[test]
    fn cset_inverts_the_condition_code() {
        let mut sink = CodeSink::new();
        cset(&mut sink, 0xc, 0); // cc = LT
        let word = u32::from_le_bytes(sink.bytes[..4].try_into().unwrap());
        assert_eq!((word >> 12) & 0xf, 0xc ^ 1);
    }
}
