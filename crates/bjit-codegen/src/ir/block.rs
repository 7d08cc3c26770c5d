//! The `Block` record (spec §3).

use crate::ir::entities::{Block as BlockRef, Op};
use crate::ir::types::RegUnit;
use smallvec::SmallVec;

/// One alternative of a phi: the value flowing in along a specific
/// predecessor (spec §3 I6: one alternative per predecessor in the block's
/// come-from set).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhiAlternative {
    /// The predecessor block this alternative is taken from.
    pub source_block: BlockRef,
    /// The value flowing in from that predecessor.
    pub source_value: Op,
}

/// A phi defined in a block: the op id standing for the merged value, and
/// its per-predecessor alternatives.
#[derive(Clone, Debug)]
pub struct PhiArg {
    /// The `phi` op in this block that this merge produces.
    pub dest: Op,
    /// One alternative per live predecessor.
    pub alternatives: SmallVec<[PhiAlternative; 4]>,
}

impl PhiArg {
    /// The alternative contributed by `pred`, if any.
    pub fn alternative_from(&self, pred: BlockRef) -> Option<Op> {
        self.alternatives
            .iter()
            .find(|a| a.source_block == pred)
            .map(|a| a.source_value)
    }
}

/// Per-block progress flags (spec §3 "a flag word").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockFlags {
    /// Reachable from block 0 as of the last DCE pass.
    pub live: bool,
    /// Register allocation has assigned `regs_in`/`regs_out` for this block.
    pub regs_done: bool,
    /// The emitter has scheduled/encoded this block.
    pub code_done: bool,
}

/// A basic block (spec §3).
#[derive(Clone, Debug)]
pub struct Block {
    /// Ops owned by this block, in order; the last one, if any, is the
    /// terminator (spec I4).
    pub ops: Vec<Op>,
    /// Phis defined at the head of this block.
    pub phis: Vec<PhiArg>,
    /// Blocks whose terminator may transfer control here (spec §4.2).
    pub come_from: Vec<BlockRef>,
    /// Values live at block entry, populated by the liveness pass (§4.3).
    pub live_in: Vec<Op>,
    /// Root-to-this-block dominator chain, ascending from the entry block
    /// (spec §4.2: used for lexicographic CCD lookup in CSE).
    pub dom_chain: Vec<BlockRef>,
    /// The immediate dominator, or `None` for the entry block.
    pub idom: Option<BlockRef>,
    /// The immediate post-dominator, or `None` for blocks that cannot
    /// reach the virtual exit node (dead code, post-DCE this cannot occur
    /// for live blocks).
    pub ipdom: Option<BlockRef>,
    /// Register contents at block entry, populated by the allocator.
    pub regs_in: [Option<Op>; 16],
    /// Register contents at block exit, populated by the allocator.
    pub regs_out: [Option<Op>; 16],
    /// Progress flags.
    pub flags: BlockFlags,
}

impl Block {
    /// An empty block with no ops, phis, or analysis results yet.
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            phis: Vec::new(),
            come_from: Vec::new(),
            live_in: Vec::new(),
            dom_chain: Vec::new(),
            idom: None,
            ipdom: None,
            regs_in: [None; 16],
            regs_out: [None; 16],
            flags: BlockFlags::default(),
        }
    }

    /// The block's terminator op, if one has been emitted yet.
    pub fn terminator(&self) -> Option<Op> {
        self.ops.last().copied()
    }

    /// Does `dom_chain` show this block dominated by `other`?
    pub fn dominated_by(&self, other: BlockRef) -> bool {
        self.dom_chain.contains(&other)
    }

    /// Depth of this block in the dominator tree (length of `dom_chain`),
    /// used by reassoc's domination-aware operand ordering (§4.4.5).
    pub fn dom_depth(&self) -> usize {
        self.dom_chain.len()
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bjit_entity::EntityRef;

    #[test]
    fn phi_alternative_lookup_by_predecessor() {
        let pred0 = BlockRef::new(0);
        let pred1 = BlockRef::new(1);
        let phi = PhiArg {
            dest: Op::new(5),
            alternatives: SmallVec::from_vec(vec![
                PhiAlternative {
                    source_block: pred0,
                    source_value: Op::new(1),
                },
                PhiAlternative {
                    source_block: pred1,
                    source_value: Op::new(2),
                },
            ]),
        };
        assert_eq!(phi.alternative_from(pred0), Some(Op::new(1)));
        assert_eq!(phi.alternative_from(pred1), Some(Op::new(2)));
        assert_eq!(phi.alternative_from(BlockRef::new(2)), None);
    }
}
