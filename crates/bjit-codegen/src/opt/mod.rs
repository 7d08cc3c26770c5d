//! The optimizer pipeline (spec §4.4).
//!
//! The driver runs DCE to a fixed point with fold/CSE/sink/reassoc, then
//! jump-opt, repeating until nothing makes progress or a 256-iteration cap
//! is hit (a sanity check against oscillation bugs, not a real limit).

pub mod cse;
pub mod dce;
pub mod fold;
pub mod jump;
pub mod reassoc;
pub mod sink;

use crate::dominator;
use crate::ir::Procedure;
use crate::{Flags, OptLevel};

/// Maximum number of fixed-point iterations before the driver gives up and
/// returns, rather than looping forever on a pass-ordering bug (spec §4.4).
const MAX_ITERATIONS: u32 = 256;

/// Run the optimizer driver loop described in spec §4.4. A no-op when
/// `flags.opt_level == OptLevel::None` (only DCE runs, to establish a clean
/// baseline for register allocation).
pub fn optimize(proc: &mut Procedure, flags: &Flags) {
    dominator::compute(proc);
    dce::run(proc);

    if flags.opt_level == OptLevel::None {
        return;
    }

    let mut iterations = 0;
    loop {
        iterations += 1;
        let mut progress = false;

        progress |= fold::run(proc, flags);
        progress |= cse::run(proc, flags);
        progress |= sink::run(proc);
        progress |= reassoc::run(proc, flags);

        if progress {
            dce::run(proc);
        }

        let jumped = jump::run(proc);
        if jumped {
            dominator::compute(proc);
            dce::run(proc);
        }

        if (!progress && !jumped) || iterations >= MAX_ITERATIONS {
            break;
        }
    }

    dominator::compute(proc);
    dce::run(proc);
}
