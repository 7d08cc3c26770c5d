//! bjit: a small, self-contained baseline JIT compiler back-end.
//!
//! This crate is a thin umbrella over the four crates that do the actual
//! work (spec §1 "Purpose & scope", mirroring `cranelift-umbrella`'s role
//! in the teacher workspace):
//!
//! - [`bjit_entity`] — the entity-reference arenas (`PrimaryMap`,
//!   `SecondaryMap`, `PackedOption`) everything else is built on.
//! - [`bjit_codegen`] — the IR, optimizer, register allocator and x86-64 /
//!   AArch64 emitters (spec §2 "Data flow", §4).
//! - [`bjit_frontend`] — the `Builder` façade used to construct a
//!   `Procedure`'s IR (spec §4.1).
//! - [`bjit_jit`] — the `Module` loader that turns compiled procedures into
//!   callable function pointers (spec §4.7).
//!
//! Nothing here re-implements those crates' logic; it re-exports their
//! public surface plus [`Error`], a single enum a caller can propagate
//! across the compile/load boundary without matching on which crate failed.

#![deny(missing_docs)]

pub use bjit_codegen::ir;
pub use bjit_codegen::{binemit, isa, opt, regalloc, sanity, Flags, OptLevel};
pub use bjit_frontend::{Builder, Label, Var};
pub use bjit_jit::{LoaderError, Module, ProcIndex};

pub use target_lexicon::Triple;

/// Every way building, compiling, loading or patching a module can fail,
/// unified so callers of this crate don't need to match on which of the
/// four underlying crates produced the error (spec §7 "Error handling").
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure from IR construction, optimization, register allocation or
    /// encoding (spec §7's codegen error class).
    #[error(transparent)]
    Codegen(#[from] bjit_codegen::result::BjitError),
    /// Failure from the executable-memory loader (spec §7's system-error
    /// class).
    #[error(transparent)]
    Loader(#[from] bjit_jit::LoaderError),
}

/// Convenience alias for fallible operations across the umbrella surface.
pub type Result<T> = std::result::Result<T, Error>;
