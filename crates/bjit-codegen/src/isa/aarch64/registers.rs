//! AArch64 register numbering (spec §6 "AArch64", AAPCS64).
//!
//! Mirrors `isa::x86::registers`'s approach: register units equal the
//! hardware encoding directly, `x0`-`x30` for the general-purpose bank and
//! `v0`-`v31` (offset by 32, so the two banks never collide in one
//! `RegisterMask`) for the floating-point/SIMD bank. `sp` has no unit here
//! at all, just like `rsp` on x86 — it is addressed directly by the
//! prologue/epilogue and spill-slot code, never handed to the allocator.
//! `x29` (the frame pointer this back-end's prologue sets up) and `x30`
//! (the link register, clobbered by every `bl`) are excluded from the
//! allocatable GP mask for the same reason `rbp` is excluded on x86.

use crate::ir::RegUnit;
use crate::isa::call_conv::CallConv;
use crate::regalloc::register_set::RegisterMask;

#[allow(missing_docs)]
pub const X0: RegUnit = 0;
#[allow(missing_docs)]
pub const X1: RegUnit = 1;
#[allow(missing_docs)]
pub const X2: RegUnit = 2;
#[allow(missing_docs)]
pub const X3: RegUnit = 3;
#[allow(missing_docs)]
pub const X4: RegUnit = 4;
#[allow(missing_docs)]
pub const X5: RegUnit = 5;
#[allow(missing_docs)]
pub const X6: RegUnit = 6;
#[allow(missing_docs)]
pub const X7: RegUnit = 7;
#[allow(missing_docs)]
pub const X9: RegUnit = 9;
/// Platform register reserved by AAPCS64; excluded from the allocatable set.
pub const X18: RegUnit = 18;
/// Frame pointer; this back-end's prologue always sets it up, so it is
/// never handed to the allocator (spec §4.6 "Frame setup").
pub const X29: RegUnit = 29;
/// Link register; clobbered by every `bl`, never allocatable.
pub const X30: RegUnit = 30;

/// Offset of the floating-point/SIMD bank within a combined `RegisterMask`.
pub const V_BASE: RegUnit = 32;

/// `vN`'s register unit.
pub const fn v(n: u8) -> RegUnit {
    V_BASE + n
}

/// Hardware encoding (the 5-bit field packed into the instruction word) for
/// a register unit of either bank.
pub fn hw_encoding(reg: RegUnit) -> u32 {
    (reg & 0x1f) as u32
}

/// Is this register unit in the floating-point/SIMD bank?
pub fn is_fp(reg: RegUnit) -> bool {
    reg >= V_BASE
}

/// All general-purpose registers the allocator may assign: `x0`-`x28`,
/// excluding the reserved platform register `x18`.
pub fn gp_registers() -> RegisterMask {
    let mut m = RegisterMask::contiguous(0, 29);
    m.remove(X18);
    m
}

/// All thirty-two `v` registers.
pub fn fp_registers() -> RegisterMask {
    RegisterMask::contiguous(V_BASE, 32)
}

/// Registers the prologue must save/restore if the procedure's body
/// overwrites them (AAPCS64 callee-saved set, spec §4.6 "Frame setup"):
/// `x19`-`x28` in the GP bank, `v8`-`v15` in the FP bank (the lower 64 bits
/// only; this back-end never produces values wider than `f64`).
pub fn callee_saved(_call_conv: CallConv) -> RegisterMask {
    let mut m = RegisterMask::contiguous(19, 10); // x19..=x28
    for n in 8..16 {
        m.insert(v(n));
    }
    m
}

/// General-purpose argument registers, in AAPCS64 order.
pub fn gp_arg_registers(_call_conv: CallConv) -> &'static [RegUnit] {
    &[X0, X1, X2, X3, X4, X5, X6, X7]
}

/// Floating-point argument registers, in AAPCS64 order.
pub fn fp_arg_registers(_call_conv: CallConv) -> &'static [RegUnit] {
    &[
        V_BASE,
        V_BASE + 1,
        V_BASE + 2,
        V_BASE + 3,
        V_BASE + 4,
        V_BASE + 5,
        V_BASE + 6,
        V_BASE + 7,
    ]
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
    fn gp_mask_excludes_platform_register() {
        let m = gp_registers();
        assert!(!m.contains(X18));
        assert!(m.contains(X0));
        assert!(m.contains(28));
    }

    #[test]
    fn callee_saved_covers_x19_through_x28_and_v8_through_v15() {
        let cs = callee_saved(CallConv::Aapcs64);
        assert!(cs.contains(19));
        assert!(cs.contains(28));
        assert!(!cs.contains(18));
        assert!(cs.contains(v(8)));
        assert!(cs.contains(v(15)));
        assert!(!cs.contains(v(7)));
    }

    #[test]
    fn hardware_encoding_masks_to_five_bits() {
        assert_eq!(hw_encoding(X0), 0);
        assert_eq!(hw_encoding(v(0)), 0);
        assert!(is_fp(v(3)));
        assert!(!is_fp(X3));
    }
}
