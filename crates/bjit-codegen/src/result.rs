//! The error taxonomy (spec §7).

use thiserror::Error;

/// Errors the codegen pipeline can report.
///
/// Programming-error invariant violations (bad type on an op, wrong block
/// for `alloc`/`arg`) are deliberately *not* variants here: spec §7 treats
/// them as aborts, surfaced as `panic!`/`debug_assert!` from the `sanity`
/// checker rather than as a `Result` a caller is expected to recover from.
#[derive(Debug, Error)]
pub enum BjitError {
    /// The op arena reached its 65535-entry cap (spec §3, §4.1). Recoverable:
    /// the caller may discard the in-progress procedure and retry with a
    /// smaller one, or simply propagate the error.
    #[error("procedure exceeded the 65535-op arena limit")]
    TooManyOps,

    /// A `sanity`-checker invariant failed. Used only by callers that run
    /// the checker explicitly (tests, debug builds) rather than treating the
    /// violation as an immediate abort.
    #[error("IR invariant violated: {0}")]
    InvalidInput(&'static str),
}

/// The result type threaded through builder and optimizer entry points.
pub type BjitResult<T> = Result<T, BjitError>;
