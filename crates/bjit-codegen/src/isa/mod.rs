//! Architecture back-ends (spec §4.6, §6 "ABI surface").
//!
//! A `TargetIsa` picks a calling convention and exposes the register masks
//! and the lowering entry point the register allocator and emitter drive.
//! Only two concrete back-ends exist: `x86` (System-V and Windows x64) and
//! `aarch64` (AAPCS64). Per-architecture files contribute only register
//! masks and the lowering switch (spec §9 "Polymorphic opcodes") — nothing
//! architecture-specific leaks into `ir`, `opt`, or the allocator's
//! scheduling logic.

pub mod aarch64;
pub mod call_conv;
pub mod x86;

use crate::ir::{Op, Procedure, Type};
use crate::regalloc::register_set::{RegClass, RegisterMask};
use crate::result::BjitResult;
pub use call_conv::CallConv;

/// A register-constraint mask for one of an op's inputs or its output:
/// which physical registers are legal, and which register class (general
/// purpose vs. floating point) they are drawn from (spec §4.5.3 "per-input
/// mask").
#[derive(Clone, Copy, Debug)]
pub struct RegConstraint {
    /// The register class this value must live in.
    pub class: RegClass,
    /// The subset of `class`'s registers this particular operand accepts.
    /// Usually `RegisterMask::all(class)`; ABI-fixed slots (incoming
    /// `iarg`/`farg`/`darg`, call results) narrow it to a single register.
    pub mask: RegisterMask,
}

impl RegConstraint {
    /// Any register in `class` is acceptable.
    pub fn any(class: RegClass) -> Self {
        Self {
            class,
            mask: RegisterMask::all(class),
        }
    }

    /// Exactly one physical register is acceptable (ABI-fixed slots).
    pub fn fixed(class: RegClass, reg: u8) -> Self {
        Self {
            class,
            mask: RegisterMask::single(reg),
        }
    }
}

/// Per-op register constraints the allocator consults while processing an
/// op (spec §4.5.3): one constraint per input, one for the output (if any),
/// and the mask of registers the op clobbers outright (`regsLost`).
#[derive(Clone, Debug, Default)]
pub struct RegConstraints {
    /// One constraint per op-index input, in the same order
    /// `OpRecord::for_each_input` visits them.
    pub inputs: smallvec::SmallVec<[RegConstraint; 2]>,
    /// The output's constraint, or `None` for ops with no output.
    pub output: Option<RegConstraint>,
    /// Registers this op clobbers unconditionally (call-clobbered sets,
    /// flags-setting ops that also trash a scratch register on some
    /// targets) — spec §4.5.3 step 3 "Clobber".
    pub clobbers: RegisterMask,
    /// Whether the op's output register must differ from all of its
    /// inputs (true for most RISC-style aarch64 ops; false for x86's
    /// two-operand destructive forms where reusing an input register is
    /// the common case and is in fact preferred, spec §4.5.3 step 4).
    pub output_may_alias_input: bool,
}

/// The architecture-specific half of the back-end: register masks for the
/// allocator, and the lowering/encoding switch for the emitter.
///
/// `Procedure`/`Module` are generic over this trait rather than over an
/// enum so the optimizer and allocator — which are architecture-neutral —
/// never need a match on target. Only `bjit-jit`'s module loader and this
/// trait's two implementations (`x86::X86Isa`, `aarch64::Aarch64Isa`) know
/// which architecture is being targeted.
pub trait TargetIsa: Send + Sync {
    /// The calling convention this ISA instance lowers to.
    fn call_conv(&self) -> CallConv;

    /// Register-allocation constraints for `op` (spec §4.5.3).
    fn constraints(&self, proc: &Procedure, op: Op) -> RegConstraints;

    /// Does this architecture's ABI return `ty` in a register distinct from
    /// its argument registers (never true here; kept for documentation —
    /// bjit always returns in the first register of the value's class).
    fn return_register(&self, ty: Type) -> u8;

    /// Lower and encode the register-allocated, ordered op list of `proc`
    /// into `sink`. Returns `Err(BjitError::InvalidInput)` for an opcode
    /// this architecture's lowering table does not cover (spec §9 open
    /// question 2).
    fn emit(
        &self,
        proc: &Procedure,
        pool: &mut crate::ir::ConstantPool,
        sink: &mut crate::binemit::CodeSink,
    ) -> BjitResult<()>;

    /// Number of 8-byte callee-save slots this ABI reserves before the
    /// frame's spill area (e.g. Windows x64's shadow space convention is
    /// handled by the emitter directly, not here).
    fn frame_alignment(&self) -> u32 {
        16
    }

    /// The full set of general-purpose registers the allocator may assign
    /// (spec §4.5.3), excluding the stack/frame pointer.
    fn gp_registers(&self) -> RegisterMask;

    /// The full set of floating-point registers the allocator may assign.
    fn fp_registers(&self) -> RegisterMask;

    /// Registers this ABI requires the prologue to save/restore if the
    /// procedure's body writes them (spec §4.6 "Frame setup").
    fn callee_saved(&self) -> RegisterMask;

    /// Emit a stub procedure: a fixed-size indirection (spec §6 "Stub":
    /// "MOVABS + JMP on x86-64, equivalent on AArch64") that jumps to an
    /// address patched in later. Returns the byte offset, local to `sink`,
    /// of the 8-byte address field `Module::patch_stub` overwrites.
    fn emit_stub(&self, sink: &mut crate::binemit::CodeSink) -> u32;

    /// Width in bytes of a near-call/near-tail-call site's displacement
    /// field (spec §4.6 "Calls"): 4 for both x86-64 `rel32` and AArch64's
    /// 26-bit `bl` immediate (which this crate encodes into a full 32-bit
    /// word rather than a packed sub-field, see `isa::aarch64`).
    fn near_call_width(&self) -> u8 {
        4
    }

    /// Patch the displacement field starting at absolute byte offset `at`
    /// in `bytes` so the call/branch there reaches `target_offset` (spec
    /// §4.6 "Calls": "emit a relocation into the module's near-reloc
    /// table"). Both offsets are absolute within the module's byte buffer;
    /// each architecture derives its own instruction-end/word-start
    /// convention from `at` alone.
    fn patch_near_call(&self, bytes: &mut [u8], at: u32, target_offset: u32);
}

/// Construct the default `TargetIsa` for the host triple, mirroring
/// `cranelift-native`'s role but reduced to bjit's two supported
/// architectures (spec "Target selection" ambient-stack note).
pub fn default_isa(triple: &target_lexicon::Triple) -> Box<dyn TargetIsa> {
    use target_lexicon::Architecture;
    match triple.architecture {
        Architecture::Aarch64(_) => Box::new(aarch64::Aarch64Isa::new(triple)),
        _ => Box::new(x86::X86Isa::new(triple)),
    }
}
