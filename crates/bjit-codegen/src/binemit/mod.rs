//! The architecture-neutral half of code emission (spec §4.6): a growable
//! byte sink plus the two kinds of deferred fixup an ISA backend records
//! while it lowers a procedure — a rodata reference (PC/RIP-relative load
//! of a constant-pool entry) and a near-call site (a `icalln`/`tcalln`
//! branch whose target is another procedure in the same module, resolved
//! only once every procedure has been placed).
//!
//! Each `TargetIsa::emit` call gets a fresh `CodeSink` scoped to one
//! procedure; offsets recorded here are local to that procedure's own
//! bytes. `crate::module::Module::compile` is the one place that knows the
//! procedure's eventual position in the shared module buffer, so it is the
//! one place that turns these local fixups into absolute patches.

use crate::ir::{BlockRef, ConstantHandle};
use std::collections::HashMap;

/// How a rodata reference's displacement field should be patched once the
/// constant pool's final placement is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RodataRefKind {
    /// x86-64 RIP-relative: the 4-byte field at `at` holds
    /// `pool_addr - (instruction_end)`, i.e. a disp32 counted from the end
    /// of the encoded instruction (`at + 4` for a trailing disp32).
    Rip32 { insn_end: u32 },
    /// AArch64 literal load (`LDR` literal form): the 19-bit immediate
    /// embedded in the 32-bit word at `at` encodes `(pool_addr - at) / 4`.
    Literal19,
}

/// A pending reference to a constant-pool entry, recorded while lowering
/// one op (spec §4.6 "a RIP/PC-relative load refers to it and is recorded
/// as a relocation against the pool's logical 'block'").
#[derive(Clone, Copy, Debug)]
pub struct RodataRef {
    /// Byte offset, local to this procedure's code, of the field to patch.
    pub at: u32,
    /// Which pool entry this reference resolves to.
    pub handle: ConstantHandle,
    /// How to compute and encode the final displacement.
    pub kind: RodataRefKind,
}

/// A pending near-call/near-tail-call site (spec §4.6 "Calls"): the target
/// procedure's module index (already resolved by the ISA from
/// `Procedure::near_calls` while lowering the op) and the byte offset of
/// the field the final rel32/imm26 must be written into once that target's
/// position in the module is known.
#[derive(Clone, Copy, Debug)]
pub struct NearCallSite {
    /// Byte offset, local to this procedure's code, of the field to patch.
    pub at: u32,
    /// Module index of the callee (or, for `lnp`, of the referenced
    /// procedure/stub whose address is being materialized).
    pub target_module_index: i32,
    /// Width of the field in bytes (4 for x86-64 rel32/`lea` disp32, 4 for
    /// AArch64's 32-bit `bl`/`b` immediate word).
    pub width: u8,
}

/// The growing byte buffer and fixup lists for one procedure's emission
/// (spec §4.6). An ISA's `emit` method is handed a fresh, empty sink and
/// fills it in; `crate::module::Module::compile` drains it afterward.
#[derive(Clone, Debug, Default)]
pub struct CodeSink {
    /// Encoded machine code, growing monotonically.
    pub bytes: Vec<u8>,
    /// Byte offset of each block's first instruction, once scheduled.
    pub block_offsets: HashMap<BlockRef, u32>,
    /// Rodata references awaiting the pool's final layout.
    pub rodata_refs: Vec<RodataRef>,
    /// Near-call sites awaiting the module's final procedure layout.
    pub near_calls: Vec<NearCallSite>,
}

impl CodeSink {
    /// A fresh, empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length of the emitted byte buffer (the offset the next byte
    /// will land at).
    pub fn offset(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Append a single byte.
    pub fn push_u8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    /// Append bytes verbatim.
    pub fn push_bytes(&mut self, bs: &[u8]) {
        self.bytes.extend_from_slice(bs);
    }

    /// Append a little-endian `u32`.
    pub fn push_u32_le(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian `i32`.
    pub fn push_i32_le(&mut self, v: i32) {
        self.push_u32_le(v as u32);
    }

    /// Append a little-endian `u64`.
    pub fn push_u64_le(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Record that `block`'s first scheduled instruction starts here.
    pub fn mark_block(&mut self, block: BlockRef) {
        let off = self.offset();
        self.block_offsets.insert(block, off);
    }

    /// Resolved offset of a block already scheduled, if any.
    pub fn block_offset(&self, block: BlockRef) -> Option<u32> {
        self.block_offsets.get(&block).copied()
    }

    /// Overwrite 4 bytes already emitted (used to backpatch an intra-
    /// procedure branch once its target's offset is known).
    pub fn patch_u32_le(&mut self, at: u32, v: u32) {
        let at = at as usize;
        self.bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Record a pending rodata reference at the field starting at `at`.
    pub fn record_rodata_ref(&mut self, at: u32, handle: ConstantHandle, kind: RodataRefKind) {
        self.rodata_refs.push(RodataRef { at, handle, kind });
    }

    /// Record a pending near-call site at the field starting at `at`.
    pub fn record_near_call(&mut self, at: u32, target_module_index: i32, width: u8) {
        self.near_calls.push(NearCallSite {
            at,
            target_module_index,
            width,
        });
    }
}

/// Depth-first fallthrough-aware block scheduling (spec §4.6
/// "Scheduling"): visit block 0 first, then follow each terminator's first
/// unscheduled target immediately so the common case (the fallthrough
/// successor of a two-way branch) lands right after its branch, minimizing
/// cross-block jumps. Remaining unreached blocks are appended in creation
/// order (dead blocks were already dropped by the final DCE pass, so this
/// only catches blocks reachable solely via a second branch target).
pub fn schedule_blocks(proc: &crate::ir::Procedure) -> Vec<BlockRef> {
    use std::collections::HashSet;

    let mut order = Vec::new();
    let mut seen: HashSet<BlockRef> = HashSet::new();
    let mut stack = vec![proc.entry_block()];

    while let Some(b) = stack.pop() {
        if !seen.insert(b) {
            continue;
        }
        if !proc.block(b).flags.live {
            continue;
        }
        order.push(b);
        if let Some(term) = proc.block(b).terminator() {
            let targets = proc.op(term).targets();
            // Push in reverse so the first target is popped (and thus
            // scheduled) first -- the canonical fallthrough choice.
            for &t in targets.iter().rev() {
                if !seen.contains(&t) {
                    stack.push(t);
                }
            }
        }
    }

    for b in proc.block_keys() {
        if proc.block(b).flags.live && !seen.contains(&b) {
            order.push(b);
            seen.insert(b);
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpData, Opcode, Procedure, Type};

    #[test]
    fn schedule_places_fallthrough_target_immediately_after() {
        let mut proc = Procedure::new(vec![]);
        let entry = proc.entry_block();
        let left = proc.make_block();
        let right = proc.make_block();
        let c = proc
            .push_op(entry, Opcode::Lci, OpData::Const64 { bits: 1 }, Type::Int)
            .unwrap();
        proc.push_op(
            entry,
            Opcode::Jz,
            OpData::Branch1 {
                arg: c,
                targets: [left, right],
            },
            Type::None,
        )
        .unwrap();
        proc.push_op(left, Opcode::IretI, OpData::ReturnImm { imm: 1 }, Type::None)
            .unwrap();
        proc.push_op(right, Opcode::IretI, OpData::ReturnImm { imm: 2 }, Type::None)
            .unwrap();
        crate::dominator::compute(&mut proc);

        let order = schedule_blocks(&proc);
        assert_eq!(order, vec![entry, left, right]);
    }
}
