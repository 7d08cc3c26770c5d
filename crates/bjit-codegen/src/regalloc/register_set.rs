//! The register mask (spec §9 "Register mask": "A 64-bit word is adequate
//! for both back-ends at this scale. Treat it as an opaque 'set of
//! registers'; provide intersect/union/complement and a 'first set'
//! primitive.").
//!
//! A flat bitmask rather than a multi-bank register set that models units
//! straddling several banks and widths for targets with aliasing
//! sub-registers: bjit has exactly two register classes, general-purpose
//! and floating-point, each with at most 32 members, and no target this
//! crate supports has registers that alias across classes or span multiple
//! underlying "units".

use crate::ir::RegUnit;
use core::fmt;

/// Which class of physical register a value lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegClass {
    /// General-purpose / integer registers.
    Gp,
    /// Floating-point / SIMD registers (holds both `f32` and `f64` values;
    /// the emitter picks the instruction width, not the register).
    Fp,
}

/// A bitmask over up to 64 physical register units (spec §9). Register
/// numbering is architecture-specific (see `isa::x86::registers`,
/// `isa::aarch64::registers`) but always fits in one word: x86-64 has 16
/// GP + 16 XMM, AArch64 has 31 GP + 32 vector registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RegisterMask(pub u64);

impl RegisterMask {
    /// The empty mask.
    pub const EMPTY: Self = Self(0);

    /// Every register is a member (used before narrowing by class).
    pub const ALL: Self = Self(u64::MAX);

    /// A mask with every register in `0..count` set, used to build a
    /// class's full register mask from a per-architecture register count.
    pub const fn contiguous(first: u8, count: u8) -> Self {
        if count == 0 {
            return Self::EMPTY;
        }
        let bits = if count >= 64 {
            u64::MAX
        } else {
            ((1u64 << count) - 1) << first
        };
        Self(bits)
    }

    /// A mask containing only `reg`.
    pub fn single(reg: RegUnit) -> Self {
        Self(1u64 << reg)
    }

    /// All registers, unfiltered by class. Callers should intersect with a
    /// class's static mask (from the active `TargetIsa`) before use; this
    /// exists mainly as a placeholder for `RegConstraint::any` before an
    /// ISA narrows it down.
    pub fn all(_class: RegClass) -> Self {
        Self::ALL
    }

    /// Is this mask empty?
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Does `reg` belong to this mask?
    pub fn contains(self, reg: RegUnit) -> bool {
        self.0 & (1u64 << reg) != 0
    }

    /// Add `reg` to the mask.
    pub fn insert(&mut self, reg: RegUnit) {
        self.0 |= 1u64 << reg;
    }

    /// Remove `reg` from the mask.
    pub fn remove(&mut self, reg: RegUnit) {
        self.0 &= !(1u64 << reg);
    }

    /// Intersection.
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Union.
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Complement (within the full 64-bit word; callers intersect the
    /// result with a class mask to stay meaningful).
    pub fn complement(self) -> Self {
        Self(!self.0)
    }

    /// The lowest-numbered member, if any (spec §9 "a 'first set'
    /// primitive").
    pub fn first(self) -> Option<RegUnit> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as RegUnit)
        }
    }

    /// Number of registers in the mask.
    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate over the mask's members, ascending.
    pub fn iter(self) -> RegisterMaskIter {
        RegisterMaskIter(self.0)
    }
}

/// Iterator over the set bits of a `RegisterMask`, ascending.
pub struct RegisterMaskIter(u64);

impl Iterator for RegisterMaskIter {
    type Item = RegUnit;

    fn next(&mut self) -> Option<RegUnit> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros() as RegUnit;
        self.0 &= self.0 - 1;
        Some(bit)
    }
}

impl fmt::Display for RegisterMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, r) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", r)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_builds_the_expected_bits() {
        let m = RegisterMask::contiguous(0, 4);
        assert_eq!(m.0, 0b1111);
        assert_eq!(m.len(), 4);
    }

    #[test]
    fn first_returns_lowest_member() {
        let mut m = RegisterMask::EMPTY;
        m.insert(5);
        m.insert(2);
        assert_eq!(m.first(), Some(2));
    }

    #[test]
    fn intersect_and_complement_compose() {
        let a = RegisterMask::contiguous(0, 8);
        let b = RegisterMask::single(3);
        assert_eq!(a.intersect(b), b);
        assert!(!a.complement().contains(0));
        assert!(a.complement().contains(8));
    }
}
