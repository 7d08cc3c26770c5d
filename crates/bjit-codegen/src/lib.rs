//! IR, optimizer, register allocator and machine-code emitter for the bjit
//! baseline JIT back-end.
//!
//! This crate owns everything between "a finished SSA procedure" and "a
//! byte buffer of relocatable machine code plus its constant pool": the op
//! arena and block graph (`ir`), dominator/control-flow analysis
//! (`flowgraph`, `dominator`), the liveness pass (`liveness`), the
//! optimizer pipeline (`opt`), the linear-scan register allocator
//! (`regalloc`), and the x86-64/AArch64 encoders (`isa`, `binemit`).
//! Loading the emitted bytes into executable memory is `bjit-jit`'s job,
//! not this crate's.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
compile_error!("bjit-codegen currently requires the \"std\" feature");

#[macro_use]
extern crate std;

pub mod binemit;
pub mod debug;
pub mod dominator;
pub mod flowgraph;
pub mod ir;
pub mod isa;
pub mod liveness;
pub mod opt;
pub mod regalloc;
pub mod result;
pub mod sanity;

mod scoped_hash_map;

pub use crate::result::{BjitError, BjitResult};

/// Compiler configuration threaded through the optimizer and emitter (spec
/// Ambient stack "Configuration"), grounded on cranelift's settings pattern
/// but flattened since bjit has two knobs, not a generated DSL.
#[derive(Clone, Copy, Debug)]
pub struct Flags {
    /// Whether floating-point reassociation and other "unsafe" rewrites
    /// that can change rounding behavior are permitted (spec §4.4.5, §4.4.2).
    pub unsafe_fastmath: bool,
    /// Whether the optimizer driver loop (§4.4) runs at all.
    pub opt_level: OptLevel,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            unsafe_fastmath: false,
            opt_level: OptLevel::Speed,
        }
    }
}

/// How much optimization effort `Procedure`/`Module` compilation spends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptLevel {
    /// Skip the optimizer driver entirely; only DCE and register allocation
    /// run. Used by the fold-determinism property test (spec §8) as the
    /// "opt=0" baseline.
    None,
    /// Run the full DCE/fold/CSE/sink/reassoc/jump-opt fixed point (§4.4).
    Speed,
}

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
