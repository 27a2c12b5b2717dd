//! Error handling for the scheduler and allocators.
//!
//! Allocator errors bubble up through `Result`; compute entry points report
//! through [`crate::types::Status`]. No panics cross the library boundary for
//! recoverable conditions.

use crate::types::Op;
use std::borrow::Cow;
use std::fmt;

/// The underlying kind of error that can occur while allocating or
/// scheduling a graph.
#[derive(Debug)]
pub enum ErrorKind {
    // ===== Allocation =====
    /// A tensor allocator has no free block large enough.
    OutOfSpace { needed: usize, largest: usize },

    /// The tensor allocator free-list cap was exceeded.
    ///
    /// Indicates a degenerate graph; the cap is a compile-time constant.
    TooManyFreeBlocks { cap: usize },

    /// The current reservation is too small (or stale) for the graph being
    /// allocated. Recoverable by reserving again with the current graph.
    NeedsReserve,

    /// Allocation failed even after re-reserving.
    AllocFailed,

    // ===== Scheduling =====
    /// No backend in the scheduler can run this operation.
    NoBackendForOp { op: Op, tensor: String },

    /// A user-placed tensor lives in a buffer that no backend supporting the
    /// op can address.
    IncompatiblePreAllocation { tensor: String, buffer: &'static str },

    /// Both the async and the blocking copy path failed for a split input.
    CopyFailed { tensor: String },

    // ===== Runtime =====
    /// Generic error message.
    Msg(Cow<'static, str>),
}

/// Error type with a context chain and optional backtrace.
///
/// The builder methods return `Self`, allowing fluent chaining:
///
/// `Error::needs_reserve().context("while allocating split 3")`
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: Vec<Cow<'static, str>>,
    backtrace: Option<std::backtrace::Backtrace>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, context: Vec::new(), backtrace: capture_backtrace() }
    }

    pub fn msg(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Msg(msg.into()))
    }

    pub fn needs_reserve() -> Self {
        Self::new(ErrorKind::NeedsReserve)
    }

    /// Adds context describing where the error occurred. Can be called
    /// multiple times; contexts display oldest first.
    pub fn context(mut self, ctx: impl Into<Cow<'static, str>>) -> Self {
        self.context.push(ctx.into());
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn is_needs_reserve(&self) -> bool {
        matches!(self.kind, ErrorKind::NeedsReserve | ErrorKind::OutOfSpace { .. })
    }
}

fn capture_backtrace() -> Option<std::backtrace::Backtrace> {
    #[cfg(feature = "backtrace")]
    {
        let bt = std::backtrace::Backtrace::capture();
        if matches!(bt.status(), std::backtrace::BacktraceStatus::Captured) {
            return Some(bt);
        }
    }
    None
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;

        for ctx in &self.context {
            write!(f, "\ncontext: {ctx}")?;
        }

        if let Some(bt) = &self.backtrace {
            write!(f, "\n{bt}")?;
        }

        Ok(())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::OutOfSpace { needed, largest } => {
                write!(
                    f,
                    "not enough space in the buffer (needed {needed}, largest block available {largest})"
                )
            }

            ErrorKind::TooManyFreeBlocks { cap } => {
                write!(f, "out of free blocks (cap {cap})")
            }

            ErrorKind::NeedsReserve => {
                write!(f, "reservation too small for the current graph, reserve required")
            }

            ErrorKind::AllocFailed => write!(f, "failed to allocate graph"),

            ErrorKind::NoBackendForOp { op, tensor } => {
                write!(f, "no backend supports op {op:?} for tensor {tensor}")
            }

            ErrorKind::IncompatiblePreAllocation { tensor, buffer } => {
                write!(
                    f,
                    "pre-allocated tensor {tensor} is in a buffer ({buffer}) that cannot run the operation"
                )
            }

            ErrorKind::CopyFailed { tensor } => {
                write!(f, "failed to copy split input {tensor}")
            }

            ErrorKind::Msg(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_chain() {
        let err = Error::needs_reserve()
            .context("while allocating the composed graph")
            .context("in alloc_graph");

        assert_eq!(err.context.len(), 2);
        assert!(err.is_needs_reserve());

        let s = format!("{err}");
        assert!(s.contains("reserve required"));
        assert!(s.contains("context: while allocating the composed graph"));
        assert!(s.contains("context: in alloc_graph"));
    }

    #[test]
    fn test_out_of_space_is_recoverable() {
        let err = Error::new(ErrorKind::OutOfSpace { needed: 4096, largest: 1024 });
        assert!(err.is_needs_reserve());
        let s = format!("{err}");
        assert!(s.contains("needed 4096"));
        assert!(s.contains("1024"));
    }

    #[test]
    fn test_too_many_free_blocks_is_fatal() {
        let err = Error::new(ErrorKind::TooManyFreeBlocks { cap: 256 });
        assert!(!err.is_needs_reserve());
    }

    #[test]
    fn test_display_msg() {
        let err = Error::msg("custom error message");
        assert_eq!(format!("{err}"), "custom error message");
    }
}
