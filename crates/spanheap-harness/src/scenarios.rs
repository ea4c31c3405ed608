//! End-to-end allocator scenarios run as named pass/fail cases.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use spanheap_core::size_class::TINY_SIZE;
use spanheap_core::{
    AllocFlags, Heap, HeapConfig, LiveSetCollector, PAGE_SIZE, SimulatedOs, SweepOutcome,
};

/// Outcome of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    /// What was observed, or why the scenario failed.
    pub detail: String,
}

type Check = Result<String, String>;

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), String> {
    if cond { Ok(()) } else { Err(msg()) }
}

struct Fixture {
    os: Arc<SimulatedOs>,
    collector: Arc<LiveSetCollector>,
    heap: Heap,
}

fn fixture() -> Result<Fixture, String> {
    let os = Arc::new(SimulatedOs::new());
    let collector = Arc::new(LiveSetCollector::new());
    let heap = Heap::new(
        HeapConfig::default().with_arena_bytes(64 << 20),
        os.clone(),
        collector.clone(),
    )
    .map_err(|e| e.to_string())?;
    Ok(Fixture { os, collector, heap })
}

fn class_live(heap: &Heap, size: usize) -> Result<u64, String> {
    let class = heap
        .size_classes()
        .class_for(size)
        .ok_or_else(|| format!("no class for {size}"))?;
    heap.class_stats()
        .iter()
        .find(|s| s.class == class)
        .map(|s| s.nmalloc.saturating_sub(s.nfree))
        .ok_or_else(|| format!("no stats for class {}", class.0))
}

/// 10,000 24-byte objects, all but one dead; a second thread must get the
/// survivor's span with exactly the swept slots free.
fn survivor_span_reuse() -> Check {
    let f = fixture()?;
    let addrs: Vec<usize> = {
        let mut cache = f.heap.thread_cache();
        let mut out = Vec::with_capacity(10_000);
        for _ in 0..10_000 {
            out.push(cache.alloc(24, AllocFlags::default()).map_err(|e| e.to_string())?.addr);
        }
        out
    };
    let survivor = addrs[addrs.len() / 2];
    f.collector.retain(survivor);
    f.heap.advance_generation();
    let freed: usize = f
        .heap
        .spans()
        .iter()
        .map(|s| f.heap.sweep_span(s.id).freed())
        .sum();
    ensure(freed == 9_999, || format!("swept {freed} objects, want 9999"))?;
    let span = f
        .heap
        .span_of(survivor)
        .ok_or("survivor span was released")?;

    let expected: BTreeSet<usize> = (0..span.nelems)
        .map(|i| span.base + i * span.elem_size)
        .filter(|&a| a != survivor)
        .collect();
    let received = std::thread::scope(|s| {
        s.spawn(|| -> Result<BTreeSet<usize>, String> {
            let mut cache = f.heap.thread_cache();
            let mut got = BTreeSet::new();
            for _ in 0..expected.len() {
                got.insert(cache.alloc(24, AllocFlags::default()).map_err(|e| e.to_string())?.addr);
            }
            Ok(got)
        })
        .join()
        .map_err(|_| String::from("second thread panicked"))?
    })?;
    ensure(received == expected, || {
        format!("second thread got {} slots, {} expected", received.len(), expected.len())
    })?;
    let live = class_live(&f.heap, 24)?;
    ensure(live == span.nelems as u64, || {
        format!("class counters say {live} live, span holds {}", span.nelems)
    })?;
    Ok(format!("span {} refilled with {} slots", span.id.0, expected.len()))
}

/// A `100 pages + 1 byte` object takes exactly 101 pages and gives them back
/// coalesced.
fn large_object_round_trip() -> Check {
    let f = fixture()?;
    let a = f
        .heap
        .thread_cache()
        .alloc(PAGE_SIZE * 100 + 1, AllocFlags::default())
        .map_err(|e| e.to_string())?;
    let span = f.heap.span_of(a.addr).ok_or("no span for large object")?;
    ensure(span.is_large() && span.npages == 101, || {
        format!("large span has {} pages", span.npages)
    })?;
    let free_before = f.heap.free_pages();
    f.heap.advance_generation();
    f.heap.finish_sweep();
    let gained = f.heap.free_pages() - free_before;
    ensure(gained == 101, || format!("arena regained {gained} pages"))?;
    let run = f
        .heap
        .free_runs()
        .into_iter()
        .find(|(start, _)| *start == a.addr)
        .ok_or("returned pages not at the object's base")?;
    Ok(format!("returned run of {} pages at {:#x}", run.1.pages, a.addr))
}

/// Two adjacent freed spans satisfy a request for their union without any
/// OS call.
fn coalesce_without_os() -> Check {
    let f = fixture()?;
    let mut cache = f.heap.thread_cache();
    let mut alloc = |size| cache.alloc(size, AllocFlags::default()).map_err(|e| e.to_string());
    let a = alloc(5 * PAGE_SIZE)?;
    let _b = alloc(5 * PAGE_SIZE)?;
    let guard = alloc(6 * PAGE_SIZE)?;
    f.collector.retain(guard.addr);
    f.heap.advance_generation();
    f.heap.finish_sweep();
    let before = f.os.stats();
    let c = alloc(10 * PAGE_SIZE)?;
    let after = f.os.stats();
    ensure(c.addr == a.addr, || format!("union landed at {:#x}, not {:#x}", c.addr, a.addr))?;
    ensure(
        after.commits == before.commits && after.reserves == before.reserves,
        || String::from("coalesced reuse touched the OS"),
    )?;
    Ok(String::from("10-page request served from coalesced runs"))
}

/// Pointer-free objects under 16 bytes never take more than twice their size.
fn tiny_packing_bound() -> Check {
    let f = fixture()?;
    let mut requested = 0usize;
    {
        let mut cache = f.heap.thread_cache();
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        for _ in 0..10_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let size = 1 + (state % (TINY_SIZE as u64 - 1)) as usize;
            cache
                .alloc(size, AllocFlags::pointer_free())
                .map_err(|e| e.to_string())?;
            requested += size;
        }
    }
    let used = f.heap.metrics().tiny_blocks as usize * TINY_SIZE;
    ensure(used <= 2 * requested, || {
        format!("{used} block bytes for {requested} requested")
    })?;
    Ok(format!("{used} block bytes for {requested} requested"))
}

/// Sweeping a span already swept this generation changes nothing.
fn sweep_idempotence() -> Check {
    let f = fixture()?;
    let keep = {
        let mut cache = f.heap.thread_cache();
        let mut keep = 0;
        for i in 0..1_000 {
            let a = cache.alloc(64, AllocFlags::default()).map_err(|e| e.to_string())?;
            if i % 3 == 0 {
                f.collector.retain(a.addr);
                keep += 1;
            }
        }
        keep
    };
    f.heap.advance_generation();
    f.heap.finish_sweep();
    let before = f.heap.metrics();
    for span in f.heap.spans() {
        let outcome = f.heap.sweep_span(span.id);
        ensure(outcome == SweepOutcome::AlreadySwept, || {
            format!("span {} re-swept: {outcome:?}", span.id.0)
        })?;
    }
    let after = f.heap.metrics();
    ensure(before == after, || String::from("counters moved on a repeated sweep"))?;
    let live = class_live(&f.heap, 64)?;
    ensure(live == keep, || format!("{live} live, {keep} retained"))?;
    Ok(format!("{keep} survivors stable across repeated sweeps"))
}

fn zero_size_sentinel() -> Check {
    let f = fixture()?;
    let mut cache = f.heap.thread_cache();
    let a = cache.alloc(0, AllocFlags::default()).map_err(|e| e.to_string())?;
    let b = cache.alloc(0, AllocFlags::default()).map_err(|e| e.to_string())?;
    ensure(a.addr == b.addr && a.addr == f.heap.zero_base(), || {
        String::from("zero-size allocations disagree")
    })?;
    ensure(f.heap.span_of(a.addr).is_none(), || {
        String::from("zero-size sentinel lies inside a span")
    })?;
    Ok(format!("sentinel at {:#x}", a.addr))
}

/// Runs every scenario.
#[must_use]
pub fn run_all() -> Vec<ScenarioResult> {
    let scenarios: [(&str, fn() -> Check); 6] = [
        ("survivor_span_reuse", survivor_span_reuse),
        ("large_object_round_trip", large_object_round_trip),
        ("coalesce_without_os", coalesce_without_os),
        ("tiny_packing_bound", tiny_packing_bound),
        ("sweep_idempotence", sweep_idempotence),
        ("zero_size_sentinel", zero_size_sentinel),
    ];
    scenarios
        .iter()
        .map(|(name, run)| {
            let (passed, detail) = match run() {
                Ok(detail) => (true, detail),
                Err(detail) => (false, detail),
            };
            ScenarioResult {
                name: (*name).to_string(),
                passed,
                detail,
            }
        })
        .collect()
}
