//! The module loader and patcher for the bjit baseline JIT back-end (spec
//! §4.7, §1 "loads the emitted code into an executable region of the
//! process address space so it can be invoked directly as a function
//! pointer").
//!
//! This is the only crate in the workspace with OS-specific code: an
//! `mmap`/`mprotect` path on Unix and a `VirtualAlloc`/`VirtualProtect`
//! path on Windows, isolated in `loader`. Everything else --
//! `Module::compile`'s pipeline orchestration, relocation bookkeeping,
//! stub support -- is platform-neutral and lives in `module`.

#![deny(missing_docs)]

mod loader;
mod module;

pub use crate::loader::LoaderError;
pub use crate::module::{Module, ProcIndex};
