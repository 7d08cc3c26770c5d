//! Edge-shuffle resolution (spec §4.5.5, §9 "Shuffle resolution").
//!
//! Modeled exactly as spec §9 prescribes: an explicit in-memory bipartite
//! map from source register to destination register, resolved by iterating
//! free moves, then cycle breaks, then reloads to a fixed point — "simpler
//! and more auditable than a graph algorithm".

use crate::ir::RegUnit;
use std::collections::HashMap;

/// One step of the sequence of ops a shuffle block must emit to realize a
/// register permutation (spec §4.5.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShuffleStep {
    /// A plain register-to-register `rename`.
    Move { from: RegUnit, to: RegUnit },
    /// The source register has no free destination yet (a cycle); spill it
    /// to a scratch slot so the cycle can be broken.
    SpillToScratch { from: RegUnit, slot: u32 },
    /// Finish a cycle break, or satisfy a destination whose source value
    /// has no register, by reloading from a slot.
    ReloadFromScratch { slot: u32, to: RegUnit },
}

/// A pending register permutation between a predecessor's `regs_out` and a
/// successor's `regs_in` (spec §4.5.5).
#[derive(Clone, Debug, Default)]
pub struct EdgeShuffle {
    /// `from -> to` register moves still to realize.
    pending: HashMap<RegUnit, RegUnit>,
}

impl EdgeShuffle {
    /// An empty, freshly-built shuffle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the value currently in `from` must end up in `to`
    /// (spec §4.5.5: built from a predecessor/successor `regsOut`/`regsIn`
    /// mismatch).
    pub fn add(&mut self, from: RegUnit, to: RegUnit) {
        if from != to {
            self.pending.insert(from, to);
        }
    }

    /// Is there anything left to resolve?
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Resolve the permutation into a concrete step sequence: drain moves
    /// whose destination is currently free, break any remaining cycles by
    /// spilling one member to a scratch slot, then finish with reloads
    /// (spec §4.5.5). `next_slot` hands out fresh scratch-slot ids for
    /// cycle breaks.
    pub fn resolve(mut self, mut next_slot: impl FnMut() -> u32) -> Vec<ShuffleStep> {
        let mut steps = Vec::new();

        loop {
            // Destinations currently occupied by a pending source (a move
            // into them would clobber a value this shuffle still needs).
            let occupied: std::collections::HashSet<RegUnit> =
                self.pending.keys().copied().collect();

            let ready: Vec<RegUnit> = self
                .pending
                .iter()
                .filter(|(_, to)| !occupied.contains(to))
                .map(|(&from, _)| from)
                .collect();

            if ready.is_empty() {
                break;
            }
            for from in ready {
                let to = self.pending.remove(&from).expect("just observed as a key");
                steps.push(ShuffleStep::Move { from, to });
            }
        }

        // Whatever remains is one or more cycles: break each by spilling
        // one member to a scratch slot, running the freed chain, then
        // reloading the scratch value into its final destination.
        while let Some((&start, _)) = self.pending.iter().next() {
            let slot = next_slot();
            steps.push(ShuffleStep::SpillToScratch { from: start, slot });

            let mut cur = start;
            loop {
                let to = self.pending.remove(&cur).expect("cycle member");
                if to == start {
                    steps.push(ShuffleStep::ReloadFromScratch { slot, to });
                    break;
                }
                steps.push(ShuffleStep::Move { from: cur, to });
                cur = to;
            }
        }

        steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acyclic_permutation_resolves_to_plain_moves() {
        let mut s = EdgeShuffle::new();
        s.add(0, 1);
        s.add(1, 2);
        let steps = s.resolve(|| 0);
        assert_eq!(
            steps,
            vec![
                ShuffleStep::Move { from: 1, to: 2 },
                ShuffleStep::Move { from: 0, to: 1 },
            ]
        );
    }

    #[test]
    fn two_cycle_breaks_via_scratch() {
        let mut s = EdgeShuffle::new();
        s.add(0, 1);
        s.add(1, 0);
        let steps = s.resolve(|| 7);
        assert_eq!(
            steps,
            vec![
                ShuffleStep::SpillToScratch { from: 0, slot: 7 },
                ShuffleStep::Move { from: 1, to: 0 },
                ShuffleStep::ReloadFromScratch { slot: 7, to: 1 },
            ]
        );
    }

    #[test]
    fn identity_moves_are_dropped() {
        let mut s = EdgeShuffle::new();
        s.add(3, 3);
        assert!(s.is_empty());
    }
}
