use serde_json::json;
use spanheap_core::size_class::TINY_SIZE;
use spanheap_core::{
    AllocFlags, Heap, HeapConfig, LiveSetCollector, PAGE_SIZE, SimulatedOs, SpanState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

const THREADS: usize = 4;
const ROUNDS: usize = 6;
const ALLOCS_PER_ROUND: usize = 1_500;

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Object {
    addr: usize,
    size: usize,
}

fn random_request(rng: &mut XorShift64) -> (usize, AllocFlags) {
    match rng.gen_range(0, 99) {
        0..=69 => (rng.gen_range(1, 256), AllocFlags::default()),
        70..=89 => (rng.gen_range(257, 2048), AllocFlags::default()),
        90..=98 => (rng.gen_range(1, TINY_SIZE - 1), AllocFlags::pointer_free()),
        _ => (rng.gen_range(33_000, 60_000), AllocFlags::default()),
    }
}

fn run_worker(heap: &Heap, seed: u64) -> Vec<Object> {
    let mut rng = XorShift64::new(seed);
    let mut cache = heap.thread_cache();
    let mut out = Vec::with_capacity(ALLOCS_PER_ROUND);
    for _ in 0..ALLOCS_PER_ROUND {
        let (size, flags) = random_request(&mut rng);
        let a = cache.alloc(size, flags).expect("alloc");
        assert!(a.size >= size);
        out.push(Object { addr: a.addr, size });
    }
    out
}

fn first_overlap(objects: &mut [Object]) -> Option<(Object, Object)> {
    objects.sort_unstable();
    objects
        .windows(2)
        .find(|w| w[0].addr + w[0].size > w[1].addr)
        .map(|w| (w[0], w[1]))
}

#[test]
fn concurrent_caches_never_share_slots() {
    let collector = Arc::new(LiveSetCollector::new());
    let heap = Heap::new(
        HeapConfig::default().with_arena_bytes(256 << 20),
        Arc::new(SimulatedOs::new()),
        collector.clone(),
    )
    .expect("heap");

    let mut rng = XorShift64::new(0x5EED_0000_0000_0001);
    let mut retained: Vec<Object> = Vec::new();
    let mut oob_swept = 0usize;

    for round in 0..ROUNDS {
        let seeds: Vec<u64> = (0..THREADS).map(|_| rng.next_u64() | 1).collect();
        let done = AtomicBool::new(false);
        let sweeps = AtomicUsize::new(0);
        let fresh: Vec<Object> = thread::scope(|s| {
            let sweeper = s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    if heap.sweep_one().is_some() {
                        sweeps.fetch_add(1, Ordering::Relaxed);
                    } else {
                        thread::yield_now();
                    }
                }
            });
            let workers: Vec<_> = seeds
                .iter()
                .map(|&seed| {
                    let heap = &heap;
                    s.spawn(move || run_worker(heap, seed))
                })
                .collect();
            let fresh: Vec<Object> = workers
                .into_iter()
                .flat_map(|w| w.join().expect("worker"))
                .collect();
            done.store(true, Ordering::Release);
            sweeper.join().expect("sweeper");
            fresh
        });
        oob_swept += sweeps.load(Ordering::Relaxed);

        let mut live: Vec<Object> = retained.iter().chain(fresh.iter()).copied().collect();
        if let Some((a, b)) = first_overlap(&mut live) {
            panic!(
                "{}",
                json!({
                    "round": round,
                    "first": { "addr": format!("{:#x}", a.addr), "size": a.size },
                    "second": { "addr": format!("{:#x}", b.addr), "size": b.size },
                    "live": live.len(),
                })
            );
        }

        let census = heap.check_invariants().expect("consistent heap after round");
        assert_eq!(census.cached_spans, 0);
        for span in heap.spans() {
            assert_ne!(span.state(), SpanState::CheckedOutToCache);
            if let Some(count) = span.alloc_count() {
                assert!(count <= span.nelems);
            }
        }

        // Keep about a third of everything alive into the next generation.
        retained = live
            .into_iter()
            .filter(|_| rng.gen_range(0, 2) == 0)
            .collect();
        collector.clear();
        for o in &retained {
            collector.retain(o.addr);
        }
        heap.advance_generation();
    }

    heap.finish_sweep();
    let census = heap.check_invariants().expect("consistent heap at end");
    let m = heap.metrics();
    eprintln!(
        "{}",
        json!({
            "spans": census.spans,
            "live_objects": census.live_objects,
            "large_spans": census.large_spans,
            "free_pages": census.free_pages,
            "objects_freed": m.objects_freed,
            "spans_released": m.spans_released,
            "oob_swept": oob_swept,
        })
    );
    assert!(m.objects_freed > 0);
    assert_eq!(
        m.tiny_allocs + m.small_allocs + m.large_allocs,
        (THREADS * ROUNDS * ALLOCS_PER_ROUND) as u64
    );
}

#[test]
fn generation_advances_while_caches_are_held() {
    const WORKERS: usize = 6;
    const ALLOCS: usize = 3_000;

    let heap = Heap::new(
        HeapConfig::default().with_arena_bytes(512 << 20),
        Arc::new(SimulatedOs::new()),
        Arc::new(LiveSetCollector::new()),
    )
    .expect("heap");

    let done = AtomicBool::new(false);
    let advances = AtomicUsize::new(0);
    thread::scope(|s| {
        let advancer = s.spawn(|| {
            loop {
                heap.advance_generation();
                advances.fetch_add(1, Ordering::Relaxed);
                if done.load(Ordering::Acquire) {
                    break;
                }
                thread::yield_now();
            }
        });
        let workers: Vec<_> = (0..WORKERS as u64)
            .map(|i| {
                let heap = &heap;
                s.spawn(move || {
                    let mut rng = XorShift64::new(0xA11C_0000_0000_0001 ^ (i << 32));
                    let mut cache = heap.thread_cache();
                    for _ in 0..ALLOCS {
                        // One-object spans are uncached on every generation change.
                        let (size, flags) = if rng.gen_range(0, 3) == 0 {
                            (32 * 1024, AllocFlags::default())
                        } else {
                            random_request(&mut rng)
                        };
                        cache.alloc(size, flags).expect("alloc");
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().expect("worker");
        }
        done.store(true, Ordering::Release);
        advancer.join().expect("advancer");
    });
    assert!(advances.load(Ordering::Relaxed) > 0);

    // Everything due is swept; what is left was allocated this generation.
    heap.finish_sweep();
    let sg = heap.sweep_generation();
    let stale: Vec<_> = heap
        .spans()
        .iter()
        .filter(|span| span.sweepgen() != sg)
        .map(|span| {
            json!({
                "span": span.id.0,
                "stamp": span.sweepgen(),
                "state": format!("{:?}", span.state()),
            })
        })
        .collect();
    assert!(stale.is_empty(), "{}", json!({ "generation": sg, "stale": stale }));

    // Nothing is retained, so one more cycle returns every span.
    heap.advance_generation();
    heap.finish_sweep();
    let census = heap.check_invariants().expect("consistent heap");
    assert_eq!(census.spans, 0, "{}", json!({ "leftover": heap.spans().len() }));
    let bounds = heap.arena_bounds();
    assert_eq!(census.free_pages * PAGE_SIZE, bounds.arena_alloc - bounds.arena_start);
}
