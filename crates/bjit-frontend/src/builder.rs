//! `Builder`: the stateful wrapper described in the module doc comment.

use bjit_codegen::ir::{
    BlockRef, Op, OpData, Opcode, PhiAlternative, PhiArg, Procedure, Type,
};
use bjit_codegen::result::BjitResult;
use smallvec::smallvec;

/// A local-variable slot in the builder's environment (spec §4.1: "the
/// builder's 'environment' stack ... materialize phi alternatives at jump
/// time"). Opaque index into `Procedure::environment`; stable for the
/// lifetime of the procedure once declared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Var(pub usize);

/// A jump target. Created via `Builder::new_label`, which immediately
/// appends one phi op per current environment slot to the label's block
/// (spec §4.1), so every predecessor that later jumps here need only supply
/// its environment snapshot — invariant I6 holds without a separate "seal"
/// step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(BlockRef);

impl Label {
    /// The underlying block reference, for callers that need to interop
    /// with `bjit_codegen` directly (e.g. registering this as a call target).
    pub fn block(self) -> BlockRef {
        self.0
    }
}

/// The IR builder (spec §4.1).
///
/// Every value is strongly typed at construction: mixed-type binary
/// operations are a programming error in the front end, so this builder
/// asserts rather than silently inserting a conversion (spec "Every value
/// is strongly typed at construction; mixed-type binary operations fail the
/// type assertion rather than inserting implicit conversions").
pub struct Builder<'a> {
    proc: &'a mut Procedure,
}

macro_rules! binop {
    ($name:ident, $opcode:ident, $ty_check:expr) => {
        #[allow(missing_docs)]
        pub fn $name(&mut self, a: Op, b: Op) -> BjitResult<Op> {
            self.assert_ty(a, $ty_check);
            self.assert_ty(b, $ty_check);
            let ty = self.proc.op(a).ty;
            self.proc
                .push_current(Opcode::$opcode, OpData::Binary { args: [a, b] }, ty)
        }
    };
}

macro_rules! binop_imm {
    ($name:ident, $opcode:ident) => {
        #[allow(missing_docs)]
        pub fn $name(&mut self, a: Op, imm: i32) -> BjitResult<Op> {
            self.assert_ty(a, Type::Int);
            self.proc
                .push_current(Opcode::$opcode, OpData::BinaryImm { arg: a, imm }, Type::Int)
        }
    };
}

macro_rules! unop {
    ($name:ident, $opcode:ident) => {
        #[allow(missing_docs)]
        pub fn $name(&mut self, a: Op) -> BjitResult<Op> {
            let ty = self.proc.op(a).ty;
            self.proc
                .push_current(Opcode::$opcode, OpData::Unary { arg: a }, ty)
        }
    };
}

macro_rules! compare {
    ($name:ident, $opcode:ident, $ty_check:expr) => {
        #[allow(missing_docs)]
        pub fn $name(&mut self, a: Op, b: Op) -> BjitResult<Op> {
            self.assert_ty(a, $ty_check);
            self.assert_ty(b, $ty_check);
            self.proc
                .push_current(Opcode::$opcode, OpData::Binary { args: [a, b] }, Type::Int)
        }
    };
}

macro_rules! branch2 {
    ($name:ident, $opcode:ident, $ty_check:expr) => {
        #[allow(missing_docs)]
        pub fn $name(&mut self, a: Op, b: Op, t: Label, f: Label) -> BjitResult<()> {
            self.assert_ty(a, $ty_check);
            self.assert_ty(b, $ty_check);
            self.record_alternatives(t.0);
            self.record_alternatives(f.0);
            self.proc.push_current(
                Opcode::$opcode,
                OpData::Branch2 {
                    args: [a, b],
                    targets: [t.0, f.0],
                },
                Type::None,
            )?;
            Ok(())
        }
    };
}

impl<'a> Builder<'a> {
    /// Wrap `proc`, appending to whatever block is currently `proc`'s
    /// insertion point (block 0 for a freshly constructed `Procedure`).
    pub fn new(proc: &'a mut Procedure) -> Self {
        Self { proc }
    }

    fn assert_ty(&self, op: Op, expected: Type) {
        let actual = self.proc.op(op).ty;
        assert_eq!(
            actual, expected,
            "type mismatch: expected {}, found {} (spec §4.1 'mixed-type binary operations \
             fail the type assertion')",
            expected, actual
        );
    }

    // -- Environment / locals (spec §4.1, §3 "environment stack") --

    /// Declare a new local slot, initialized to `init`. Returns the `Var`
    /// used to read/write it. Declare every local the procedure will ever
    /// need before creating the first `Label` — a label's phi count is
    /// fixed to the environment's width at the moment it is created.
    pub fn declare_var(&mut self, init: Op) -> Var {
        let slot = self.proc.environment.len();
        self.proc.environment.push(init);
        Var(slot)
    }

    /// Current value of a local slot in the builder's insertion block.
    pub fn read_var(&self, var: Var) -> Op {
        self.proc.environment[var.0]
    }

    /// Overwrite a local slot's current value (e.g. a loop induction
    /// variable's update).
    pub fn write_var(&mut self, var: Var, value: Op) {
        self.proc.environment[var.0] = value;
    }

    /// Number of declared local slots.
    pub fn env_width(&self) -> usize {
        self.proc.environment.len()
    }

    // -- Labels / control flow (spec §4.1) --

    /// Create a new label: a fresh block with one phi op appended per
    /// current environment slot (spec §4.1). The label is not yet
    /// reachable from anywhere until some jump/branch targets it.
    pub fn new_label(&mut self) -> Label {
        let block = self.proc.make_block();
        let width = self.proc.environment.len();
        let mut phis = Vec::with_capacity(width);
        for _ in 0..width {
            // Phis start with no alternatives; jump/branch emitters append
            // one per predecessor as they are encountered (I6).
            let dest = self
                .proc
                .push_op(block, Opcode::Phi, OpData::Nullary, Type::None)
                .expect("phi materialization cannot overflow a fresh block's op count");
            phis.push(PhiArg {
                dest,
                alternatives: smallvec![],
            });
        }
        self.proc.block_mut(block).phis = phis;
        Label(block)
    }

    /// Switch the insertion point to `label`'s block and rebind the
    /// environment to that block's phi destinations, so code emitted from
    /// here on reads the merged values (spec §4.1).
    pub fn switch_to(&mut self, label: Label) {
        self.proc.set_current_block(label.0);
        let dests: Vec<Op> = self.proc.block(label.0).phis.iter().map(|p| p.dest).collect();
        self.proc.environment = dests;
    }

    /// Retype a label's phi destinations to match the first alternative's
    /// type once it is known (phis are created untyped since a label may
    /// precede any predecessor; this call is a no-op if already typed).
    /// Front ends should call this once, from the first predecessor to
    /// reach the label, before emitting any use of the corresponding `Var`.
    fn record_alternatives(&mut self, target: BlockRef) {
        let current = self.proc.current_block();
        let env = self.proc.environment.clone();
        let width = env.len();
        assert_eq!(
            self.proc.block(target).phis.len(),
            width,
            "label created with a different environment width than a later jump to it (spec \
             §4.1: every label's phi count is fixed at `new_label` time)"
        );
        for (i, &value) in env.iter().enumerate() {
            let needs_type = self.proc.block(target).phis[i].alternatives.is_empty();
            if needs_type {
                let ty = self.proc.op(value).ty;
                let dest = self.proc.block(target).phis[i].dest;
                self.proc.op_mut(dest).ty = ty;
            }
            self.proc.block_mut(target).phis[i].alternatives.push(PhiAlternative {
                source_block: current,
                source_value: value,
            });
        }
    }

    /// Unconditional jump to `label`, snapshotting the current environment
    /// into its phi alternatives (spec §4.1 "jmp/jz/conditional-jump
    /// emitters record the current-block environment as phi alternatives in
    /// every successor").
    pub fn jump(&mut self, label: Label) -> BjitResult<()> {
        self.record_alternatives(label.0);
        self.proc
            .push_current(Opcode::Jmp, OpData::Jump { target: label.0 }, Type::None)?;
        Ok(())
    }

    /// `jz`: branch to `if_zero` when `cond == 0`, else to `if_nonzero`.
    pub fn brz(&mut self, cond: Op, if_zero: Label, if_nonzero: Label) -> BjitResult<()> {
        self.assert_ty(cond, Type::Int);
        self.record_alternatives(if_zero.0);
        self.record_alternatives(if_nonzero.0);
        self.proc.push_current(
            Opcode::Jz,
            OpData::Branch1 {
                arg: cond,
                targets: [if_zero.0, if_nonzero.0],
            },
            Type::None,
        )?;
        Ok(())
    }

    /// `jnz`: branch to `if_nonzero` when `cond != 0`, else to `if_zero`.
    pub fn brnz(&mut self, cond: Op, if_nonzero: Label, if_zero: Label) -> BjitResult<()> {
        self.assert_ty(cond, Type::Int);
        self.record_alternatives(if_nonzero.0);
        self.record_alternatives(if_zero.0);
        self.proc.push_current(
            Opcode::Jnz,
            OpData::Branch1 {
                arg: cond,
                targets: [if_nonzero.0, if_zero.0],
            },
            Type::None,
        )?;
        Ok(())
    }

    branch2!(br_ilt, Jilt, Type::Int);
    branch2!(br_ige, Jige, Type::Int);
    branch2!(br_igt, Jigt, Type::Int);
    branch2!(br_ile, Jile, Type::Int);
    branch2!(br_ult, Jult, Type::Int);
    branch2!(br_uge, Juge, Type::Int);
    branch2!(br_ugt, Jugt, Type::Int);
    branch2!(br_ule, Jule, Type::Int);
    branch2!(br_ieq, Jieq, Type::Int);
    branch2!(br_ine, Jine, Type::Int);
    branch2!(br_dlt, Jdlt, Type::F64);
    branch2!(br_dge, Jdge, Type::F64);
    branch2!(br_dgt, Jdgt, Type::F64);
    branch2!(br_dle, Jdle, Type::F64);
    branch2!(br_deq, Jdeq, Type::F64);
    branch2!(br_dne, Jdne, Type::F64);
    branch2!(br_flt, Jflt, Type::F32);
    branch2!(br_fge, Jfge, Type::F32);
    branch2!(br_fgt, Jfgt, Type::F32);
    branch2!(br_fle, Jfle, Type::F32);
    branch2!(br_feq, Jfeq, Type::F32);
    branch2!(br_fne, Jfne, Type::F32);

    // -- Terminators (returns, tail calls) --

    /// `iret`/`dret`/`fret`, selected by `value`'s type. Pass `None` for a
    /// void return.
    pub fn ret(&mut self, value: Option<Op>) -> BjitResult<()> {
        let opcode = match value {
            None => Opcode::Iret,
            Some(v) => match self.proc.op(v).ty {
                Type::Int => Opcode::Iret,
                Type::F32 => Opcode::Fret,
                Type::F64 => Opcode::Dret,
                Type::None => unreachable!("cannot return a None-typed value"),
            },
        };
        self.proc
            .push_current(opcode, OpData::Return { arg: value }, Type::None)?;
        Ok(())
    }

    /// `iretI`: return an integer immediate directly, skipping a `lci`.
    pub fn ret_imm(&mut self, imm: i32) -> BjitResult<()> {
        self.proc
            .push_current(Opcode::IretI, OpData::ReturnImm { imm }, Type::None)?;
        Ok(())
    }

    /// `tcallp`: tail call through a computed address.
    pub fn tail_call_indirect(&mut self, target: Op) -> BjitResult<()> {
        self.assert_ty(target, Type::Int);
        self.proc
            .push_current(Opcode::Tcallp, OpData::TailCall { arg: target }, Type::None)?;
        Ok(())
    }

    /// `tcallnI`: near tail call to another procedure in the same module.
    pub fn tail_call_near(&mut self, module_index: i32) -> BjitResult<()> {
        self.proc.push_current(
            Opcode::TcallnI,
            OpData::TailCallNear { module_index },
            Type::None,
        )?;
        Ok(())
    }

    // -- Constants (spec §6 "Constants") --

    /// `lci`: a 64-bit integer constant.
    pub fn iconst(&mut self, v: i64) -> BjitResult<Op> {
        self.proc
            .push_current(Opcode::Lci, OpData::Const64 { bits: v as u64 }, Type::Int)
    }

    /// `lcf`: a 32-bit float constant.
    pub fn fconst(&mut self, v: f32) -> BjitResult<Op> {
        self.proc.push_current(
            Opcode::Lcf,
            OpData::Const32 {
                bits: v.to_bits() as i32,
            },
            Type::F32,
        )
    }

    /// `lcd`: a 64-bit float constant.
    pub fn dconst(&mut self, v: f64) -> BjitResult<Op> {
        self.proc
            .push_current(Opcode::Lcd, OpData::Const64 { bits: v.to_bits() }, Type::F64)
    }

    /// `lnp`: the address of procedure `module_index` within the eventual
    /// module (spec §6 "Constants": "near-proc address, imm32 = module
    /// index").
    pub fn proc_addr(&mut self, module_index: i32) -> BjitResult<Op> {
        self.proc.push_current(
            Opcode::Lnp,
            OpData::Const32 {
                bits: module_index,
            },
            Type::Int,
        )
    }

    // -- Integer arithmetic --

    binop!(iadd, Iadd, Type::Int);
    binop!(isub, Isub, Type::Int);
    binop!(imul, Imul, Type::Int);
    binop!(idiv, Idiv, Type::Int);
    binop!(imod, Imod, Type::Int);
    binop!(udiv, Udiv, Type::Int);
    binop!(umod, Umod, Type::Int);
    unop!(ineg, Ineg);
    binop_imm!(iadd_imm, IaddI);
    binop_imm!(isub_imm, IsubI);
    binop_imm!(imul_imm, ImulI);
    binop_imm!(idiv_imm, IdivI);
    binop_imm!(imod_imm, ImodI);
    binop_imm!(udiv_imm, UdivI);
    binop_imm!(umod_imm, UmodI);

    // -- Bitwise --

    unop!(inot, Inot);
    binop!(iand, Iand, Type::Int);
    binop!(ior, Ior, Type::Int);
    binop!(ixor, Ixor, Type::Int);
    binop!(ishl, Ishl, Type::Int);
    binop!(ishr, Ishr, Type::Int);
    binop!(ushr, Ushr, Type::Int);
    binop_imm!(iand_imm, IandI);
    binop_imm!(ior_imm, IorI);
    binop_imm!(ixor_imm, IxorI);
    binop_imm!(ishl_imm, IshlI);
    binop_imm!(ishr_imm, IshrI);
    binop_imm!(ushr_imm, UshrI);

    // -- Float arithmetic --

    binop!(fadd, Fadd, Type::F32);
    binop!(fsub, Fsub, Type::F32);
    binop!(fmul, Fmul, Type::F32);
    binop!(fdiv, Fdiv, Type::F32);
    unop!(fneg, Fneg);
    unop!(fabs, Fabs);
    binop!(dadd, Dadd, Type::F64);
    binop!(dsub, Dsub, Type::F64);
    binop!(dmul, Dmul, Type::F64);
    binop!(ddiv, Ddiv, Type::F64);
    unop!(dneg, Dneg);
    unop!(dabs, Dabs);

    // -- Compares producing 0/1 --

    compare!(icmp_lt, Cilt, Type::Int);
    compare!(icmp_ge, Cige, Type::Int);
    compare!(icmp_gt, Cigt, Type::Int);
    compare!(icmp_le, Cile, Type::Int);
    compare!(ucmp_lt, Cult, Type::Int);
    compare!(ucmp_ge, Cuge, Type::Int);
    compare!(ucmp_gt, Cugt, Type::Int);
    compare!(ucmp_le, Cule, Type::Int);
    compare!(icmp_eq, Cieq, Type::Int);
    compare!(icmp_ne, Cine, Type::Int);
    compare!(dcmp_lt, Cdlt, Type::F64);
    compare!(dcmp_ge, Cdge, Type::F64);
    compare!(dcmp_gt, Cdgt, Type::F64);
    compare!(dcmp_le, Cdle, Type::F64);
    compare!(dcmp_eq, Cdeq, Type::F64);
    compare!(dcmp_ne, Cdne, Type::F64);
    compare!(fcmp_lt, Cflt, Type::F32);
    compare!(fcmp_ge, Cfge, Type::F32);
    compare!(fcmp_gt, Cfgt, Type::F32);
    compare!(fcmp_le, Cfle, Type::F32);
    compare!(fcmp_eq, Cfeq, Type::F32);
    compare!(fcmp_ne, Cfne, Type::F32);

    // -- Conversions / bit-casts / extensions --

    /// `ci2d`/`ci2f`: signed int to double/float.
    pub fn int_to_double(&mut self, a: Op) -> BjitResult<Op> {
        self.assert_ty(a, Type::Int);
        self.proc
            .push_current(Opcode::Ci2d, OpData::Unary { arg: a }, Type::F64)
    }
    #[allow(missing_docs)]
    pub fn int_to_float(&mut self, a: Op) -> BjitResult<Op> {
        self.assert_ty(a, Type::Int);
        self.proc
            .push_current(Opcode::Ci2f, OpData::Unary { arg: a }, Type::F32)
    }
    /// `cd2i`/`cf2i`: double/float to signed int (truncating).
    pub fn double_to_int(&mut self, a: Op) -> BjitResult<Op> {
        self.assert_ty(a, Type::F64);
        self.proc
            .push_current(Opcode::Cd2i, OpData::Unary { arg: a }, Type::Int)
    }
    #[allow(missing_docs)]
    pub fn float_to_int(&mut self, a: Op) -> BjitResult<Op> {
        self.assert_ty(a, Type::F32);
        self.proc
            .push_current(Opcode::Cf2i, OpData::Unary { arg: a }, Type::Int)
    }
    /// `cf2d`/`cd2f`: widen/narrow between the two float widths.
    pub fn float_to_double(&mut self, a: Op) -> BjitResult<Op> {
        self.assert_ty(a, Type::F32);
        self.proc
            .push_current(Opcode::Cf2d, OpData::Unary { arg: a }, Type::F64)
    }
    #[allow(missing_docs)]
    pub fn double_to_float(&mut self, a: Op) -> BjitResult<Op> {
        self.assert_ty(a, Type::F64);
        self.proc
            .push_current(Opcode::Cd2f, OpData::Unary { arg: a }, Type::F32)
    }
    /// `bci2d`/`bci2f`: reinterpret an integer's bits as a double/float.
    pub fn bitcast_int_to_double(&mut self, a: Op) -> BjitResult<Op> {
        self.assert_ty(a, Type::Int);
        self.proc
            .push_current(Opcode::Bci2d, OpData::Unary { arg: a }, Type::F64)
    }
    #[allow(missing_docs)]
    pub fn bitcast_int_to_float(&mut self, a: Op) -> BjitResult<Op> {
        self.assert_ty(a, Type::Int);
        self.proc
            .push_current(Opcode::Bci2f, OpData::Unary { arg: a }, Type::F32)
    }
    /// `bcd2i`/`bcf2i`: reinterpret a double/float's bits as an integer.
    pub fn bitcast_double_to_int(&mut self, a: Op) -> BjitResult<Op> {
        self.assert_ty(a, Type::F64);
        self.proc
            .push_current(Opcode::Bcd2i, OpData::Unary { arg: a }, Type::Int)
    }
    #[allow(missing_docs)]
    pub fn bitcast_float_to_int(&mut self, a: Op) -> BjitResult<Op> {
        self.assert_ty(a, Type::F32);
        self.proc
            .push_current(Opcode::Bcf2i, OpData::Unary { arg: a }, Type::Int)
    }

    /// Sign-extend from an 8/16/32-bit truncation of `a` back to the full
    /// pointer-sized width (`i8`/`i16`/`i32`).
    pub fn sign_extend(&mut self, a: Op, from_bits: u32) -> BjitResult<Op> {
        self.assert_ty(a, Type::Int);
        let opcode = match from_bits {
            8 => Opcode::I8,
            16 => Opcode::I16,
            32 => Opcode::I32,
            n => panic!("sign_extend: unsupported width {}", n),
        };
        self.proc
            .push_current(opcode, OpData::Unary { arg: a }, Type::Int)
    }

    /// Zero-extend from an 8/16/32-bit truncation of `a` (`u8`/`u16`/`u32`).
    pub fn zero_extend(&mut self, a: Op, from_bits: u32) -> BjitResult<Op> {
        self.assert_ty(a, Type::Int);
        let opcode = match from_bits {
            8 => Opcode::U8,
            16 => Opcode::U16,
            32 => Opcode::U32,
            n => panic!("zero_extend: unsupported width {}", n),
        };
        self.proc
            .push_current(opcode, OpData::Unary { arg: a }, Type::Int)
    }

    // -- Memory (spec §6 "Memory") --

    /// `li8`/`li16`/`li32`/`li64`/`lu8`/`lu16`/`lu32`/`lf32`/`lf64`:
    /// single-register-indexed load. `signed` only matters for the 8/16/32
    /// integer widths (ignored for `i64`/`f32`/`f64`).
    pub fn load(&mut self, width_bits: u32, signed: bool, float: bool, ptr: Op, offset: i32) -> BjitResult<Op> {
        self.assert_ty(ptr, Type::Int);
        let (opcode, ty) = load_opcode(width_bits, signed, float);
        self.proc
            .push_current(opcode, OpData::Load { ptr, offset }, ty)
    }

    /// Two-register-indexed load (`l2*`: `ptr + index + offset16`).
    pub fn load2(
        &mut self,
        width_bits: u32,
        signed: bool,
        float: bool,
        ptr: Op,
        index: Op,
        offset: i32,
    ) -> BjitResult<Op> {
        self.assert_ty(ptr, Type::Int);
        self.assert_ty(index, Type::Int);
        let (opcode, ty) = load2_opcode(width_bits, signed, float);
        self.proc
            .push_current(opcode, OpData::Load2 { ptr, index, offset }, ty)
    }

    /// `si8`/`si16`/`si32`/`si64`/`sf32`/`sf64`: single-register-indexed
    /// store.
    pub fn store(&mut self, width_bits: u32, float: bool, ptr: Op, value: Op, offset: i32) -> BjitResult<()> {
        self.assert_ty(ptr, Type::Int);
        let opcode = store_opcode(width_bits, float);
        self.proc
            .push_current(opcode, OpData::Store { ptr, value, offset }, Type::None)?;
        Ok(())
    }

    /// Two-register-indexed store (`s2*`).
    pub fn store2(
        &mut self,
        width_bits: u32,
        float: bool,
        ptr: Op,
        index: Op,
        value: Op,
        offset: i32,
    ) -> BjitResult<()> {
        self.assert_ty(ptr, Type::Int);
        self.assert_ty(index, Type::Int);
        let opcode = store2_opcode(width_bits, float);
        self.proc.push_current(
            opcode,
            OpData::Store2 {
                ptr,
                index,
                value,
                offset,
            },
            Type::None,
        )?;
        Ok(())
    }

    // -- ABI (spec §6 "ABI") --

    /// `alloc(n)`: reserve `n` bytes of per-frame scratch. Must be the
    /// first op emitted to block 0 (spec §4.1).
    pub fn alloc(&mut self, bytes: i32) -> BjitResult<Op> {
        assert_eq!(
            self.proc.current_block(),
            self.proc.entry_block(),
            "alloc must be the first op of block 0 (spec I5)"
        );
        assert!(
            self.proc.block(self.proc.entry_block()).ops.is_empty(),
            "alloc must be the first op of block 0 (spec I5)"
        );
        self.proc
            .push_current(Opcode::Alloc, OpData::Imm32 { imm: bytes }, Type::Int)
    }

    /// `iarg`/`farg`/`darg`: declare an incoming argument. Must be emitted
    /// to block 0, at its head, before any other op (spec I5). `type_index`
    /// is this argument's position within its own type class;
    /// `global_pos` its position among all arguments.
    pub fn arg(&mut self, ty: Type, type_index: u8, type_total: u8, global_pos: u8) -> BjitResult<Op> {
        let opcode = match ty {
            Type::Int => Opcode::Iarg,
            Type::F32 => Opcode::Farg,
            Type::F64 => Opcode::Darg,
            Type::None => panic!("an argument cannot have type None"),
        };
        self.proc.push_current(
            opcode,
            OpData::Arg {
                type_index,
                type_total,
                global_pos,
            },
            ty,
        )
    }

    /// `ipass`/`fpass`/`dpass`: stage an outgoing call argument, selected by
    /// `value`'s type.
    pub fn pass(&mut self, value: Op, type_index: u8, type_total: u8, global_pos: u8) -> BjitResult<Op> {
        let ty = self.proc.op(value).ty;
        let opcode = match ty {
            Type::Int => Opcode::Ipass,
            Type::F32 => Opcode::Fpass,
            Type::F64 => Opcode::Dpass,
            Type::None => panic!("cannot pass a None-typed value"),
        };
        self.proc.push_current(
            opcode,
            OpData::Pass {
                arg: value,
                type_index,
                type_total,
                global_pos,
            },
            ty,
        )
    }

    /// Stage every argument of `args` as consecutive `pass` ops, computing
    /// each one's per-type and global index automatically. A convenience
    /// wrapper over repeated `pass` calls for the common case where a call's
    /// arguments are passed in order.
    pub fn pass_all(&mut self, args: &[Op]) -> BjitResult<()> {
        let mut counts = [0u8; 3]; // Int, F32, F64
        let totals = {
            let mut t = [0u8; 3];
            for &a in args {
                t[type_class(self.proc.op(a).ty)] += 1;
            }
            t
        };
        for (i, &a) in args.iter().enumerate() {
            let class = type_class(self.proc.op(a).ty);
            let type_index = counts[class];
            counts[class] += 1;
            self.pass(a, type_index, totals[class], i as u8)?;
        }
        Ok(())
    }

    /// `icallp`/`fcallp`/`dcallp`: indirect call through a computed
    /// address, selected by `ret_ty`.
    pub fn call_indirect(&mut self, target: Op, ret_ty: Type) -> BjitResult<Op> {
        self.assert_ty(target, Type::Int);
        let opcode = match ret_ty {
            Type::Int => Opcode::Icallp,
            Type::F32 => Opcode::Fcallp,
            Type::F64 => Opcode::Dcallp,
            Type::None => panic!("a call must name a return type class"),
        };
        self.proc
            .push_current(opcode, OpData::CallIndirect { arg: target }, ret_ty)
    }

    /// `icalln`/`fcalln`/`dcalln`: near call to another procedure in the
    /// same module, identified by its module index.
    pub fn call_near(&mut self, module_index: i32, ret_ty: Type) -> BjitResult<Op> {
        let opcode = match ret_ty {
            Type::Int => Opcode::Icalln,
            Type::F32 => Opcode::Fcalln,
            Type::F64 => Opcode::Dcalln,
            Type::None => panic!("a call must name a return type class"),
        };
        let op = self
            .proc
            .push_current(opcode, OpData::CallNear { module_index }, ret_ty)?;
        self.proc.near_calls.push(bjit_codegen::ir::NearCallReloc {
            site: op,
            target_module_index: module_index,
        });
        Ok(op)
    }

    /// `fence`: a compiler barrier (spec §6 "Meta").
    pub fn fence(&mut self) -> BjitResult<()> {
        self.proc
            .push_current(Opcode::Fence, OpData::Nullary, Type::None)?;
        Ok(())
    }
}

fn type_class(ty: Type) -> usize {
    match ty {
        Type::Int => 0,
        Type::F32 => 1,
        Type::F64 => 2,
        Type::None => panic!("None has no type class"),
    }
}

fn load_opcode(width_bits: u32, signed: bool, float: bool) -> (Opcode, Type) {
    if float {
        return match width_bits {
            32 => (Opcode::Lf32, Type::F32),
            64 => (Opcode::Lf64, Type::F64),
            n => panic!("load: unsupported float width {}", n),
        };
    }
    let opcode = match (width_bits, signed) {
        (8, true) => Opcode::Li8,
        (8, false) => Opcode::Lu8,
        (16, true) => Opcode::Li16,
        (16, false) => Opcode::Lu16,
        (32, true) => Opcode::Li32,
        (32, false) => Opcode::Lu32,
        (64, _) => Opcode::Li64,
        (n, _) => panic!("load: unsupported integer width {}", n),
    };
    (opcode, Type::Int)
}

fn load2_opcode(width_bits: u32, signed: bool, float: bool) -> (Opcode, Type) {
    if float {
        return match width_bits {
            32 => (Opcode::L2f32, Type::F32),
            64 => (Opcode::L2f64, Type::F64),
            n => panic!("load2: unsupported float width {}", n),
        };
    }
    let opcode = match (width_bits, signed) {
        (8, true) => Opcode::L2i8,
        (8, false) => Opcode::L2u8,
        (16, true) => Opcode::L2i16,
        (16, false) => Opcode::L2u16,
        (32, true) => Opcode::L2i32,
        (32, false) => Opcode::L2u32,
        (64, _) => Opcode::L2i64,
        (n, _) => panic!("load2: unsupported integer width {}", n),
    };
    (opcode, Type::Int)
}

fn store_opcode(width_bits: u32, float: bool) -> Opcode {
    if float {
        return match width_bits {
            32 => Opcode::Sf32,
            64 => Opcode::Sf64,
            n => panic!("store: unsupported float width {}", n),
        };
    }
    match width_bits {
        8 => Opcode::Si8,
        16 => Opcode::Si16,
        32 => Opcode::Si32,
        64 => Opcode::Si64,
        n => panic!("store: unsupported integer width {}", n),
    }
}

fn store2_opcode(width_bits: u32, float: bool) -> Opcode {
    if float {
        return match width_bits {
            32 => Opcode::S2f32,
            64 => Opcode::S2f64,
            n => panic!("store2: unsupported float width {}", n),
        };
    }
    match width_bits {
        8 => Opcode::S2i8,
        16 => Opcode::S2i16,
        32 => Opcode::S2i32,
        64 => Opcode::S2i64,
        n => panic!("store2: unsupported integer width {}", n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bjit_codegen::ir::Procedure;

    #[test]
    fn straight_line_iadd_builds_a_single_block() {
        let mut proc = Procedure::new(vec![Type::Int, Type::Int]);
        let mut b = Builder::new(&mut proc);
        let a = b.arg(Type::Int, 0, 2, 0).unwrap();
        let c = b.arg(Type::Int, 1, 2, 1).unwrap();
        let sum = b.iadd(a, c).unwrap();
        b.ret(Some(sum)).unwrap();
        assert_eq!(proc.block(proc.entry_block()).ops.len(), 4);
    }

    #[test]
    fn branch_merges_through_a_phi() {
        let mut proc = Procedure::new(vec![Type::Int]);
        let mut b = Builder::new(&mut proc);
        let a = b.arg(Type::Int, 0, 1, 0).unwrap();
        let zero = b.iconst(0).unwrap();
        let local = b.declare_var(a);
        let merge = b.new_label();
        let is_neg = b.icmp_lt(a, zero).unwrap();
        let neg_label = b.new_label();
        let pos_label = b.new_label();
        b.brnz(is_neg, neg_label, pos_label).unwrap();

        b.switch_to(neg_label);
        let negated = b.ineg(b.read_var(local)).unwrap();
        b.write_var(local, negated);
        b.jump(merge).unwrap();

        b.switch_to(pos_label);
        b.jump(merge).unwrap();

        b.switch_to(merge);
        let result = b.read_var(local);
        b.ret(Some(result)).unwrap();

        assert_eq!(proc.block(merge.block()).phis.len(), 1);
        assert_eq!(proc.block(merge.block()).phis[0].alternatives.len(), 2);
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn mixed_type_binop_panics() {
        let mut proc = Procedure::new(vec![Type::Int]);
        let mut b = Builder::new(&mut proc);
        let i = b.iconst(1).unwrap();
        let f = b.fconst(1.0).unwrap();
        let _ = b.iadd(i, f);
    }
}
