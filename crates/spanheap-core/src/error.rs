//! Error taxonomy.
//!
//! Resource exhaustion is reported to the immediate caller as a [`HeapError`].
//! A broken internal invariant is never returned as a value: it goes through
//! [`fatal`], because a heap that has lost track of its own memory cannot be
//! trusted to keep running. Losing a sweep claim or waiting on a lock is not
//! an error at all.

use thiserror::Error;

use crate::config::ConfigError;
use crate::span::SpanState;

/// Recoverable allocation failure, surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("arena address space exhausted growing by {requested} bytes")]
    AddressSpaceExhausted { requested: usize },
    #[error("cannot reserve arena virtual address space ({size} bytes)")]
    ReservationFailed { size: usize },
    #[error("os refused to commit {size} bytes at {addr:#x}")]
    CommitFailed { addr: usize, size: usize },
    #[error("allocation size out of range: {count} elements of {elem_size} bytes")]
    SizeOverflow { elem_size: usize, count: usize },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Internal consistency failure. Always terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("bad tiny size class: class {class} has object size {actual}, want {expected}")]
    BadTinyClass {
        class: usize,
        expected: usize,
        actual: usize,
    },
    #[error("malformed size class table at class {class}: {reason}")]
    MalformedSizeClasses { class: usize, reason: &'static str },
    #[error("bad system page size {size}: {reason}")]
    BadPageSize { size: usize, reason: &'static str },
    #[error("misrounded address {addr:#x} (want {align:#x} alignment) in {context}")]
    Misaligned {
        addr: usize,
        align: usize,
        context: &'static str,
    },
    #[error("span {span}: alloc count {alloc_count} exceeds {nelems} objects")]
    AllocCountOverflow {
        span: u32,
        alloc_count: usize,
        nelems: usize,
    },
    #[error("span {span}: alloc count {alloc_count} disagrees with {allocated} allocated slots")]
    AllocCountMismatch {
        span: u32,
        alloc_count: usize,
        allocated: usize,
    },
    #[error("span {span} has no free objects")]
    NoFreeObjects { span: u32 },
    #[error("uncaching span {span} but its alloc count is 0")]
    UncacheUnused { span: u32 },
    #[error("span {span} owned twice: {detail}")]
    DoubleOwner { span: u32, detail: String },
    #[error("span {span} is {state:?}, expected {expected}")]
    UnexpectedState {
        span: u32,
        state: SpanState,
        expected: &'static str,
    },
    #[error("span {span} missing from the span table")]
    UnknownSpan { span: u32 },
    #[error("span {span}: {detail}")]
    BadGeometry { span: u32, detail: String },
    #[error("arena state inconsistent: {detail}")]
    ArenaState { detail: String },
}

/// Terminates on a broken invariant.
///
/// The release profile aborts on panic, so this never unwinds into a heap
/// in an inconsistent state outside of tests.
#[cold]
#[track_caller]
pub fn fatal(violation: InvariantViolation) -> ! {
    panic!("fatal error: {violation}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_error_messages() {
        let err = HeapError::OutOfMemory { requested: 4096 };
        assert_eq!(err.to_string(), "out of memory allocating 4096 bytes");
        let err = HeapError::SizeOverflow {
            elem_size: 16,
            count: usize::MAX,
        };
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    #[should_panic(expected = "fatal error: span 7 has no free objects")]
    fn fatal_panics_with_diagnostic() {
        fatal(InvariantViolation::NoFreeObjects { span: 7 });
    }
}
