//! The `Procedure` record (spec §3) and the IR-mutation entry points the
//! builder (`bjit-frontend`) and optimizer drive.

use crate::ir::block::Block;
use crate::ir::entities::{Block as BlockRef, Op};
use crate::ir::op::{OpData, OpRecord};
use crate::ir::opcode::Opcode;
use crate::ir::types::Type;
use crate::result::{BjitError, BjitResult};
use bjit_entity::{EntityRef, PrimaryMap};

/// One argument-pass slot recorded at a call site (spec §4.1: "the last *n*
/// entries of the environment as argument-pass pseudo-ops").
#[derive(Clone, Copy, Debug)]
pub struct CallArg {
    /// The `ipass`/`fpass`/`dpass` op carrying this argument.
    pub pass_op: Op,
}

/// A pending near-call relocation: `site` (the `icalln`/`tcalln`-family op)
/// targets procedure `target` within the eventual module (spec §3 "a list
/// of near-call relocations").
#[derive(Clone, Copy, Debug)]
pub struct NearCallReloc {
    /// The op whose immediate encodes the relocation.
    pub site: Op,
    /// The index, within the owning module, of the callee procedure.
    pub target_module_index: i32,
}

/// A single compiled procedure: its op arena, block list, and builder/RA
/// scratch state (spec §3).
#[derive(Clone, Debug)]
pub struct Procedure {
    /// The op arena. Ops are created monotonically and never removed; a
    /// deleted op becomes `nop` in place (spec "Lifecycle").
    ops: PrimaryMap<Op, OpRecord>,
    /// The block list, in creation order. Block 0 is always the entry
    /// block (spec I5).
    blocks: PrimaryMap<BlockRef, Block>,
    /// A compact description of the incoming argument types, one character
    /// per argument in `{i, f, d}` (int / f32 / f64), consumed by the
    /// emitter's ABI lowering.
    pub arg_types: Vec<Type>,
    /// The block the builder is currently appending ops to.
    current_block: BlockRef,
    /// The builder's environment stack: one `Op` per live local slot,
    /// snapshotted into phi alternatives whenever a jump is emitted.
    pub environment: Vec<Op>,
    /// Registers used by this procedure's body, populated by the allocator
    /// and consulted by the emitter's prologue/epilogue (callee-save set).
    pub used_regs: u64,
    /// Number of distinct stack congruence classes assigned by RA; each
    /// one occupies one 8-byte frame slot.
    pub spill_slots: u32,
    /// Bytes reserved by this procedure's `alloc` op, if any.
    pub frame_alloc_bytes: u32,
    /// Near-call relocations recorded while building/lowering this
    /// procedure.
    pub near_calls: Vec<NearCallReloc>,
    /// Set once the register allocator has produced a valid assignment for
    /// every op (spec §3 "RA-complete flag").
    pub ra_complete: bool,
    /// Monotonic counter bumped on every memory-mutating op (`s*`/`s2*`
    /// stores, calls); snapshotted into each op's `mem_tag` at creation
    /// time to guard load rematerialization (§4.5.4).
    mem_tag_counter: u32,
}

impl Procedure {
    /// A fresh procedure with a single empty entry block (block 0).
    pub fn new(arg_types: Vec<Type>) -> Self {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(Block::new());
        Self {
            ops: PrimaryMap::new(),
            blocks,
            arg_types,
            current_block: entry,
            environment: Vec::new(),
            used_regs: 0,
            spill_slots: 0,
            frame_alloc_bytes: 0,
            near_calls: Vec::new(),
            ra_complete: false,
            mem_tag_counter: 0,
        }
    }

    /// The always-present entry block.
    pub fn entry_block(&self) -> BlockRef {
        BlockRef::new(0)
    }

    /// The block the builder is currently appending to.
    pub fn current_block(&self) -> BlockRef {
        self.current_block
    }

    /// Switch the builder's insertion point. Used by `new-label`'s callers
    /// once a label's block has been created and its phis materialized.
    pub fn set_current_block(&mut self, block: BlockRef) {
        self.current_block = block;
    }

    /// Read a block's record.
    pub fn block(&self, b: BlockRef) -> &Block {
        &self.blocks[b]
    }

    /// Mutably access a block's record.
    pub fn block_mut(&mut self, b: BlockRef) -> &mut Block {
        &mut self.blocks[b]
    }

    /// Iterate over every block reference in creation order.
    pub fn block_keys(&self) -> bjit_entity::Keys<BlockRef> {
        self.blocks.keys()
    }

    /// Number of blocks created so far.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Create a fresh, empty block (not yet reachable from anywhere).
    pub fn make_block(&mut self) -> BlockRef {
        self.blocks.push(Block::new())
    }

    /// Read an op's record.
    pub fn op(&self, o: Op) -> &OpRecord {
        &self.ops[o]
    }

    /// Mutably access an op's record.
    pub fn op_mut(&mut self, o: Op) -> &mut OpRecord {
        &mut self.ops[o]
    }

    /// Number of ops created so far (including tombstoned `nop`s).
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Iterate over every op reference in creation order.
    pub fn op_keys(&self) -> bjit_entity::Keys<Op> {
        self.ops.keys()
    }

    /// Bump and return the current memory-mutation tag, for a newly created
    /// op to snapshot.
    pub fn memory_tag(&self) -> u32 {
        self.mem_tag_counter
    }

    /// Record that a memory-mutating op was just appended, invalidating the
    /// remat eligibility of loads tagged at or before the previous value.
    pub fn bump_memory_tag(&mut self) {
        self.mem_tag_counter += 1;
    }

    /// Append a new op to the end of `block`, returning its reference.
    ///
    /// Fails with `BjitError::TooManyOps` at the 65535-op cap (spec §4.1),
    /// a recoverable condition rather than a programming-error abort.
    pub fn push_op(
        &mut self,
        block: BlockRef,
        opcode: Opcode,
        data: OpData,
        ty: Type,
    ) -> BjitResult<Op> {
        if self.ops.len() >= Op::MAX_INDEX {
            return Err(BjitError::TooManyOps);
        }
        let mem_tag = self.mem_tag_counter;
        let rec = OpRecord::new(opcode, block, data, ty, mem_tag);
        let id = self.ops.push(rec);
        self.blocks[block].ops.push(id);
        if is_memory_mutation(opcode) {
            self.bump_memory_tag();
        }
        Ok(id)
    }

    /// Append an op to the procedure's current block (the common builder
    /// entry point).
    pub fn push_current(&mut self, opcode: Opcode, data: OpData, ty: Type) -> BjitResult<Op> {
        let block = self.current_block;
        self.push_op(block, opcode, data, ty)
    }

    /// Overwrite an op in place with a `nop` tombstone (spec "Lifecycle":
    /// ops are never freed).
    pub fn delete_op(&mut self, o: Op) {
        self.ops[o].make_nop();
    }
}

fn is_memory_mutation(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Si8
            | Opcode::Si16
            | Opcode::Si32
            | Opcode::Si64
            | Opcode::Sf32
            | Opcode::Sf64
            | Opcode::S2i8
            | Opcode::S2i16
            | Opcode::S2i32
            | Opcode::S2i64
            | Opcode::S2f32
            | Opcode::S2f64
            | Opcode::Icallp
            | Opcode::Icalln
            | Opcode::Fcallp
            | Opcode::Fcalln
            | Opcode::Dcallp
            | Opcode::Dcalln
            | Opcode::Fence
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_procedure_has_one_empty_entry_block() {
        let proc = Procedure::new(vec![Type::Int, Type::Int]);
        assert_eq!(proc.block_count(), 1);
        assert_eq!(proc.entry_block(), proc.current_block());
        assert!(proc.block(proc.entry_block()).ops.is_empty());
    }

    #[test]
    fn push_op_appends_to_the_target_block() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let op = proc
            .push_op(entry, Opcode::Nop, OpData::Nullary, Type::None)
            .unwrap();
        assert_eq!(proc.block(entry).ops, vec![op]);
    }

    #[test]
    fn store_bumps_the_memory_tag() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let ptr = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 0 }, Type::Int)
            .unwrap();
        let val = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 1 }, Type::Int)
            .unwrap();
        let before = proc.memory_tag();
        proc.push_op(
            entry,
            Opcode::Si64,
            OpData::Store {
                ptr,
                value: val,
                offset: 0,
            },
            Type::None,
        )
        .unwrap();
        assert!(proc.memory_tag() > before);
    }
}
