//! IR builder facade for the bjit baseline JIT back-end (spec §4.1).
//!
//! A thin, stateful wrapper over `bjit_codegen::ir::Procedure` that gives a
//! front end (lexer/parser/AST-to-IR lowering — explicitly out of this
//! system's scope, spec §1) a small, closed surface for constructing
//! well-formed SSA: one method per opcode family, a `Label` abstraction that
//! eagerly materializes phi ops per spec §4.1 ("Labels are created eagerly
//! via `new-label`... This guarantees (I6) without a separate 'seal'
//! step"), and an "environment" of local-variable slots that the builder
//! snapshots into phi alternatives whenever a jump is emitted.
//!
//! This crate never touches `Op`/`Block` ids directly beyond what
//! `bjit_codegen::ir` already exposes; it exists purely to keep a caller
//! from having to hand-construct `OpData` variants and phi bookkeeping
//! itself.

#![deny(missing_docs)]

mod builder;

pub use builder::{Builder, Label, Var};
pub use bjit_codegen::ir::Type;
pub use bjit_codegen::result::{BjitError, BjitResult};
