//! Stress and scenario harness for spanheap.
//!
//! This crate provides:
//! - Stress runs: deterministic multi-threaded allocation rounds with a
//!   root-set collector, overlap detection and per-round invariant checks
//! - Scenarios: the end-to-end behaviors the allocator promises, run as
//!   named pass/fail cases
//! - Reports: JSON and markdown renderings of runs, heap layout and the
//!   size-class table

#![forbid(unsafe_code)]

pub mod error;
pub mod report;
pub mod runner;
pub mod scenarios;

pub use error::HarnessError;
pub use report::{LayoutReport, ScenarioReport, StressReport};
pub use runner::{OsKind, StressConfig, StressRunner};
pub use scenarios::{ScenarioResult, run_all};
