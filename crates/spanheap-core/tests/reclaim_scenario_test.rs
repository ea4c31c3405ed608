use serde_json::json;
use spanheap_core::{
    AllocFlags, ClassStats, Heap, HeapConfig, LiveSetCollector, SimulatedOs, SpanState,
    SweepOutcome,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

const OBJECTS: usize = 10_000;
const OBJECT_SIZE: usize = 24;

fn heap_with(collector: Arc<LiveSetCollector>) -> Heap {
    Heap::new(
        HeapConfig::default().with_arena_bytes(64 << 20),
        Arc::new(SimulatedOs::new()),
        collector,
    )
    .expect("heap")
}

fn stats_for(heap: &Heap, object_size: usize) -> ClassStats {
    let class = heap.size_classes().class_for(object_size).expect("small size");
    heap.class_stats()
        .into_iter()
        .find(|s| s.class == class)
        .expect("class stats")
}

#[test]
fn survivor_span_is_handed_to_second_thread() {
    let collector = Arc::new(LiveSetCollector::new());
    let heap = heap_with(collector.clone());

    let addrs: Vec<usize> = {
        let mut cache = heap.thread_cache();
        (0..OBJECTS)
            .map(|_| cache.alloc(OBJECT_SIZE, AllocFlags::default()).unwrap().addr)
            .collect()
    };
    let survivor = addrs[OBJECTS / 2];
    collector.retain(survivor);
    let after_first = stats_for(&heap, OBJECT_SIZE);
    assert_eq!(after_first.nmalloc, OBJECTS as u64, "uncache reconciled nmalloc");

    heap.advance_generation();
    let mut freed = 0;
    for span in heap.spans() {
        match heap.sweep_span(span.id) {
            SweepOutcome::Swept { freed: n, .. } => freed += n,
            other => panic!("span {} not swept: {other:?}", span.id.0),
        }
    }
    assert_eq!(freed, OBJECTS - 1);

    let survivor_span = heap.span_of(survivor).expect("survivor span kept");
    assert_eq!(heap.spans().len(), 1, "dead spans returned to the arena");
    assert_eq!(survivor_span.state(), SpanState::InCentralNonempty);
    assert_eq!(survivor_span.alloc_count(), Some(1));

    // A second sweep in the same generation changes nothing.
    let before = stats_for(&heap, OBJECT_SIZE);
    let live_before = heap.metrics().heap_live;
    assert_eq!(heap.sweep_span(survivor_span.id), SweepOutcome::AlreadySwept);
    assert_eq!(heap.sweep_one(), None);
    assert_eq!(stats_for(&heap, OBJECT_SIZE), before);
    assert_eq!(heap.metrics().heap_live, live_before);
    assert_eq!(survivor_span.alloc_count(), Some(1));

    let expected: BTreeSet<usize> = (0..survivor_span.nelems)
        .map(|i| survivor_span.base + i * survivor_span.elem_size)
        .filter(|&a| a != survivor)
        .collect();
    let received: BTreeSet<usize> = thread::scope(|s| {
        s.spawn(|| {
            let mut cache = heap.thread_cache();
            let mut got = BTreeSet::new();
            for i in 0..expected.len() {
                let a = cache.alloc(OBJECT_SIZE, AllocFlags::default()).unwrap();
                assert_eq!(a.heavy, i == 0, "only the first allocation refills");
                got.insert(a.addr);
            }
            assert_eq!(cache.cached_spans(), vec![survivor_span.id]);
            got
        })
        .join()
        .expect("second thread")
    });
    if received != expected {
        let unexpected: Vec<String> = received
            .difference(&expected)
            .take(8)
            .map(|a| format!("{a:#x}"))
            .collect();
        panic!(
            "{}",
            json!({
                "span": survivor_span.id.0,
                "expected": expected.len(),
                "received": received.len(),
                "unexpected": unexpected,
            })
        );
    }

    let stats = stats_for(&heap, OBJECT_SIZE);
    let census = heap.check_invariants().expect("consistent heap");
    assert_eq!(census.cached_spans, 0);
    assert_eq!(census.live_objects, survivor_span.nelems);
    assert_eq!(stats.nmalloc - stats.nfree, census.live_objects as u64);
    assert_eq!(survivor_span.state(), SpanState::InCentralEmpty);
    assert_eq!(
        heap.metrics().heap_live,
        (survivor_span.nelems * survivor_span.elem_size) as u64
    );
}

#[test]
fn partially_used_cache_span_reconciles_on_uncache() {
    let collector = Arc::new(LiveSetCollector::new());
    let heap = heap_with(collector.clone());
    let mut cache = heap.thread_cache();
    for _ in 0..10 {
        cache.alloc(OBJECT_SIZE, AllocFlags::default()).unwrap();
    }
    let optimistic = stats_for(&heap, OBJECT_SIZE);
    assert!(optimistic.nmalloc > 10, "checkout counts the whole span");
    drop(cache);
    let settled = stats_for(&heap, OBJECT_SIZE);
    assert_eq!(settled.nmalloc, 10);
    assert_eq!(settled.nonempty_spans, 1);
    assert_eq!(heap.metrics().heap_live, (10 * OBJECT_SIZE) as u64);
}

#[test]
fn generations_keep_retained_objects_only() {
    let collector = Arc::new(LiveSetCollector::new());
    let heap = heap_with(collector.clone());
    let mut keep = Vec::new();
    for round in 0..4 {
        let mut cache = heap.thread_cache();
        for i in 0..2_000 {
            let a = cache.alloc(48 + (i % 5) * 16, AllocFlags::default()).unwrap();
            if i % 10 == round {
                collector.retain(a.addr);
                keep.push(a.addr);
            }
        }
        drop(cache);
        heap.advance_generation();
        heap.finish_sweep();
        let census = heap.check_invariants().expect("consistent heap");
        assert_eq!(census.live_objects, keep.len(), "round {round}");
    }
    for &a in &keep {
        let span = heap.span_of(a).expect("retained object still backed");
        assert_ne!(span.state(), SpanState::Free);
    }
    let total_live: u64 = heap
        .class_stats()
        .iter()
        .map(|s| s.nmalloc - s.nfree)
        .sum();
    assert_eq!(total_live, keep.len() as u64);
}
