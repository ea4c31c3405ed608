//! # spanheap-core
//!
//! A size-classed heap for large numbers of small, short-lived objects whose
//! lifetime is decided by an external collector.
//!
//! # Architecture
//!
//! Allocation proceeds up a hierarchy of caches:
//! - **Size classes** (`size_class`): ~70 object sizes, each with a span size
//!   chosen to bound tail waste.
//! - **Thread cache** (`thread_cache`): one active span per size class plus a
//!   tiny-object packing cursor, used without locks by its owning thread.
//! - **Central free lists** (`central`): one per size class, brokering spans
//!   between the page heap and thread caches.
//! - **Page heap** (`page_heap`): the reserved arena, free page runs with
//!   coalescing, and the only path to the OS layer (`os`).
//! - **Sweeper** (`sweep`): generation-stamped lazy reclamation driven by the
//!   collector interface (`collector`).
//!
//! Everything hangs off an explicitly constructed [`Heap`]; there is no
//! ambient global allocator state.

#![deny(unsafe_code)]

pub mod central;
pub mod collector;
pub mod config;
pub mod error;
pub mod heap;
pub mod log;
pub mod metrics;
pub mod os;
pub mod page_heap;
pub mod size_class;
pub mod span;
pub mod sweep;
pub mod thread_cache;

/// log2 of the allocator's logical page size.
pub const PAGE_SHIFT: usize = 13;

/// Logical page size (bytes). Spans are whole multiples of this.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask of the in-page offset bits.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Rounds `n` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

pub use central::CentralStats;
pub use collector::{Collector, LiveMap, LiveSetCollector, NewObject, RetainAll, SweepView};
pub use config::HeapConfig;
pub use error::{HeapError, InvariantViolation};
pub use heap::{ClassStats, Heap, HeapCensus};
pub use log::{HeapLogLevel, HeapLogRecord};
pub use metrics::{HeapMetrics, MetricsSnapshot};
pub use os::{MmapPageSource, PageSource, SimOsStats, SimulatedOs};
pub use page_heap::{ArenaBounds, ArenaLayout, FreeRun};
pub use size_class::{ClassId, SizeClass, SizeClassTable};
pub use span::{Span, SpanId, SpanKind, SpanState};
pub use sweep::SweepOutcome;
pub use thread_cache::{AllocFlags, Allocation, ThreadCache};
