//! x86-64 register numbering (spec §6 "x86-64").
//!
//! Register units here equal the hardware ModRM/REX.B/REX.R/REX.X encoding
//! directly — `RAX == 0` through `R15 == 15` for the general-purpose bank,
//! `xmm0 == 16` through `xmm15 == 31` for the floating-point bank (offset by
//! 16 so the two banks never collide in one `RegisterMask`), matching the
//! cranelift x86 register table's own unit numbering, rather than numbering
//! registers in the allocator's own preference order and bridging to
//! hardware encoding through a separate translation step: folding the two
//! spaces together removes that indirection, since nothing here needs the
//! allocator's registers to be contiguous in any particular preference
//! order.
//!
//! `rsp` and `rbp` are excluded from the allocatable general-purpose mask:
//! `rsp` is the hardware stack pointer and `rbp` is this back-end's frame
//! base register (spec §4.6 "Frame setup"), addressed directly by the
//! prologue/epilogue and spill-slot code rather than handed to the
//! allocator.

use crate::ir::RegUnit;
use crate::isa::call_conv::CallConv;
use crate::regalloc::register_set::RegisterMask;

#[allow(missing_docs)]
pub const RAX: RegUnit = 0;
#[allow(missing_docs)]
pub const RCX: RegUnit = 1;
#[allow(missing_docs)]
pub const RDX: RegUnit = 2;
#[allow(missing_docs)]
pub const RBX: RegUnit = 3;
#[allow(missing_docs)]
pub const RSP: RegUnit = 4;
#[allow(missing_docs)]
pub const RBP: RegUnit = 5;
#[allow(missing_docs)]
pub const RSI: RegUnit = 6;
#[allow(missing_docs)]
pub const RDI: RegUnit = 7;
#[allow(missing_docs)]
pub const R8: RegUnit = 8;
#[allow(missing_docs)]
pub const R9: RegUnit = 9;
#[allow(missing_docs)]
pub const R10: RegUnit = 10;
#[allow(missing_docs)]
pub const R11: RegUnit = 11;
#[allow(missing_docs)]
pub const R12: RegUnit = 12;
#[allow(missing_docs)]
pub const R13: RegUnit = 13;
#[allow(missing_docs)]
pub const R14: RegUnit = 14;
#[allow(missing_docs)]
pub const R15: RegUnit = 15;

/// Offset of the floating-point bank within a combined `RegisterMask`.
pub const XMM_BASE: RegUnit = 16;

/// `xmmN`'s register unit.
pub const fn xmm(n: u8) -> RegUnit {
    XMM_BASE + n
}

/// Hardware encoding (the low 4 bits used in ModRM/REX) for a register unit
/// of either bank.
pub fn hw_encoding(reg: RegUnit) -> u8 {
    reg & 0xf
}

/// Does this register unit need a REX prefix bit to address (`r8`-`r15` or
/// `xmm8`-`xmm15`)?
pub fn needs_rex_extension(reg: RegUnit) -> bool {
    hw_encoding(reg) >= 8
}

/// Is this register unit in the floating-point bank?
pub fn is_fp(reg: RegUnit) -> bool {
    reg >= XMM_BASE
}

/// All general-purpose registers the allocator may assign: every GP
/// register except `rsp` (hardware stack pointer) and `rbp` (frame base).
pub fn gp_registers() -> RegisterMask {
    let mut m = RegisterMask::contiguous(0, 16);
    m.remove(RSP);
    m.remove(RBP);
    m
}

/// All sixteen `xmm` registers. Windows technically reserves `xmm6`-`xmm15`
/// as callee-saved, but this back-end treats every `xmm` register as
/// caller-saved on both ABIs and never keeps one live across a call.
pub fn fp_registers() -> RegisterMask {
    RegisterMask::contiguous(XMM_BASE, 16)
}

/// Registers the prologue must save/restore if the procedure's body
/// overwrites them (spec §4.6 "Frame setup").
pub fn callee_saved(call_conv: CallConv) -> RegisterMask {
    let mut m = RegisterMask::EMPTY;
    for r in [RBX, R12, R13, R14, R15] {
        m.insert(r);
    }
    if call_conv == CallConv::WindowsFastcall {
        m.insert(RSI);
        m.insert(RDI);
    }
    m
}

/// General-purpose argument registers, in ABI order, for `call_conv`.
pub fn gp_arg_registers(call_conv: CallConv) -> &'static [RegUnit] {
    match call_conv {
        CallConv::WindowsFastcall => &[RCX, RDX, R8, R9],
        _ => &[RDI, RSI, RDX, RCX, R8, R9],
    }
}

/// Floating-point argument registers, in ABI order, for `call_conv`.
pub fn fp_arg_registers(call_conv: CallConv) -> &'static [RegUnit] {
    match call_conv {
        CallConv::WindowsFastcall => &[16, 17, 18, 19],
        _ => &[16, 17, 18, 19, 20, 21, 22, 23],
    }
}

/// General-purpose registers a callee may clobber across a call (spec §4.6
/// "Calls"): every allocatable GP register that isn't callee-saved.
pub fn gp_caller_saved(call_conv: CallConv) -> RegisterMask {
    gp_registers().intersect(callee_saved(call_conv).complement())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gp_mask_excludes_stack_and_frame_pointer() {
        let m = gp_registers();
        assert!(!m.contains(RSP));
        assert!(!m.contains(RBP));
        assert!(m.contains(RAX));
        assert!(m.contains(R15));
    }

    #[test]
    fn hardware_encoding_matches_unit_for_low_half() {
        assert_eq!(hw_encoding(RAX), 0);
        assert_eq!(hw_encoding(xmm(0)), 0);
        assert!(!needs_rex_extension(RAX));
        assert!(needs_rex_extension(R8));
        assert!(needs_rex_extension(xmm(9)));
    }

    #[test]
    fn windows_call_conv_adds_rsi_rdi_to_callee_saved() {
        let sysv = callee_saved(CallConv::SystemV);
        let win = callee_saved(CallConv::WindowsFastcall);
        assert!(!sysv.contains(RSI));
        assert!(win.contains(RSI));
        assert!(win.contains(RDI));
    }
}
