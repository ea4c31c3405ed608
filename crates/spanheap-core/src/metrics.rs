//! Atomic counters for heap observability.
//!
//! All counters use relaxed ordering. They are diagnostic, not
//! synchronization primitives. `heap_live` is an estimate: checkout counts a
//! whole span as live and uncache/sweep correct it later, so it is only exact
//! once every cache has been flushed.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-heap operation counters.
pub struct HeapMetrics {
    /// Objects served by the tiny packer without a new slot.
    pub tiny_allocs: AtomicU64,
    /// Fresh 16-byte blocks taken by the tiny packer.
    pub tiny_blocks: AtomicU64,
    /// Size-classed allocations (tiny blocks included).
    pub small_allocs: AtomicU64,
    /// Large, span-per-object allocations.
    pub large_allocs: AtomicU64,
    /// Zero-byte requests answered with the shared sentinel.
    pub zero_size_allocs: AtomicU64,
    /// Thread-cache refills (heavy allocations).
    pub refills: AtomicU64,
    /// Spans handed from central lists to caches.
    pub checkouts: AtomicU64,
    /// Spans returned from caches to central lists.
    pub uncaches: AtomicU64,
    /// Spans swept (claimed through the generation CAS).
    pub spans_swept: AtomicU64,
    /// Object slots reclaimed by sweeping.
    pub objects_freed: AtomicU64,
    /// Spans returned to the page heap.
    pub spans_released: AtomicU64,
    /// Page-heap growth steps that succeeded.
    pub arena_growths: AtomicU64,
    /// Page-heap growth steps that failed.
    pub arena_growth_failures: AtomicU64,
    /// Address-space bytes abandoned by non-contiguous mappings.
    pub stranded_bytes: AtomicU64,
    /// Pages decommitted by scavenging.
    pub scavenged_pages: AtomicU64,
    /// Estimated live heap bytes.
    pub heap_live: AtomicU64,
    /// Bytes committed through the OS layer.
    pub mapped_bytes: AtomicU64,
}

impl HeapMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tiny_allocs: AtomicU64::new(0),
            tiny_blocks: AtomicU64::new(0),
            small_allocs: AtomicU64::new(0),
            large_allocs: AtomicU64::new(0),
            zero_size_allocs: AtomicU64::new(0),
            refills: AtomicU64::new(0),
            checkouts: AtomicU64::new(0),
            uncaches: AtomicU64::new(0),
            spans_swept: AtomicU64::new(0),
            objects_freed: AtomicU64::new(0),
            spans_released: AtomicU64::new(0),
            arena_growths: AtomicU64::new(0),
            arena_growth_failures: AtomicU64::new(0),
            stranded_bytes: AtomicU64::new(0),
            scavenged_pages: AtomicU64::new(0),
            heap_live: AtomicU64::new(0),
            mapped_bytes: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Subtract `n` from a gauge, saturating at zero.
    pub fn sub(counter: &AtomicU64, n: u64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(n))
        });
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tiny_allocs: Self::get(&self.tiny_allocs),
            tiny_blocks: Self::get(&self.tiny_blocks),
            small_allocs: Self::get(&self.small_allocs),
            large_allocs: Self::get(&self.large_allocs),
            zero_size_allocs: Self::get(&self.zero_size_allocs),
            refills: Self::get(&self.refills),
            checkouts: Self::get(&self.checkouts),
            uncaches: Self::get(&self.uncaches),
            spans_swept: Self::get(&self.spans_swept),
            objects_freed: Self::get(&self.objects_freed),
            spans_released: Self::get(&self.spans_released),
            arena_growths: Self::get(&self.arena_growths),
            arena_growth_failures: Self::get(&self.arena_growth_failures),
            stranded_bytes: Self::get(&self.stranded_bytes),
            scavenged_pages: Self::get(&self.scavenged_pages),
            heap_live: Self::get(&self.heap_live),
            mapped_bytes: Self::get(&self.mapped_bytes),
        }
    }
}

impl Default for HeapMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all heap counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tiny_allocs: u64,
    pub tiny_blocks: u64,
    pub small_allocs: u64,
    pub large_allocs: u64,
    pub zero_size_allocs: u64,
    pub refills: u64,
    pub checkouts: u64,
    pub uncaches: u64,
    pub spans_swept: u64,
    pub objects_freed: u64,
    pub spans_released: u64,
    pub arena_growths: u64,
    pub arena_growth_failures: u64,
    pub stranded_bytes: u64,
    pub scavenged_pages: u64,
    pub heap_live: u64,
    pub mapped_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = HeapMetrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn increment_and_gauge() {
        let m = HeapMetrics::new();
        HeapMetrics::inc(&m.refills);
        HeapMetrics::inc(&m.refills);
        HeapMetrics::add(&m.heap_live, 100);
        HeapMetrics::sub(&m.heap_live, 30);
        HeapMetrics::sub(&m.heap_live, 500);
        let snap = m.snapshot();
        assert_eq!(snap.refills, 2);
        assert_eq!(snap.heap_live, 0);
    }
}
