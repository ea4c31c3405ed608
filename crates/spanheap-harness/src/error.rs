//! Harness failures.

use spanheap_core::{HeapError, InvariantViolation};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
    #[error("invariant check failed in round {round}: {violation}")]
    Invariant {
        round: usize,
        violation: InvariantViolation,
    },
    #[error("round {round}: object at {first:#x} (+{first_size}) overlaps {second:#x}")]
    Overlap {
        round: usize,
        first: usize,
        first_size: usize,
        second: usize,
    },
    #[error("worker thread panicked in round {round}")]
    WorkerPanicked { round: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{failed} of {total} scenarios failed")]
    ScenariosFailed { failed: usize, total: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
