#![no_main]
//! Fuzz target for the allocator's generation protocol.
//!
//! Interprets input bytes as a sequence of allocate/retain/release/sweep
//! operations and checks that live objects never overlap and that the heap
//! stays internally consistent.

use std::collections::BTreeMap;
use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use spanheap_core::{AllocFlags, Heap, HeapConfig, LiveSetCollector, PAGE_SIZE, SimulatedOs};

const MAX_LIVE: usize = 512;

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let collector = Arc::new(LiveSetCollector::new());
    let Ok(heap) = Heap::new(
        HeapConfig::default().with_arena_bytes(32 << 20),
        Arc::new(SimulatedOs::new()),
        collector.clone(),
    ) else {
        return;
    };
    let mut cache = heap.thread_cache();
    // addr -> size, for objects the collector is told to keep.
    let mut live: BTreeMap<usize, usize> = BTreeMap::new();

    for chunk in data.chunks(4) {
        if chunk.len() < 4 {
            break;
        }
        let op = chunk[0] % 8;
        let arg = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let keep = chunk[3] & 1 == 1;

        match op {
            0 | 1 => {
                let size = arg % 4096;
                if let Ok(a) = cache.alloc(size, AllocFlags::default())
                    && keep
                    && size > 0
                    && live.len() < MAX_LIVE
                {
                    collector.retain(a.addr);
                    live.insert(a.addr, size);
                }
            }
            2 => {
                let size = 1 + arg % 15;
                if let Ok(a) = cache.alloc(size, AllocFlags::pointer_free())
                    && keep
                    && live.len() < MAX_LIVE
                {
                    // Tiny objects share a block; keeping one keeps the block.
                    collector.retain(a.addr);
                    live.insert(a.addr, size);
                }
            }
            3 => {
                let size = 32 * 1024 + (arg % 8) * PAGE_SIZE;
                if let Ok(a) = cache.alloc(size, AllocFlags::default().uninit())
                    && keep
                    && live.len() < MAX_LIVE
                {
                    collector.retain(a.addr);
                    live.insert(a.addr, size);
                }
            }
            4 => {
                if let Some((&addr, _)) = live.iter().nth(arg % live.len().max(1)) {
                    collector.release(addr);
                    live.remove(&addr);
                }
            }
            5 => {
                heap.advance_generation();
            }
            6 => {
                let _ = heap.sweep_one();
            }
            _ => {
                cache.release_all();
                let _ = heap.scavenge();
            }
        }
    }

    let mut prev_end = 0usize;
    for (&addr, &size) in &live {
        assert!(addr >= prev_end, "live objects overlap at {addr:#x}");
        assert!(heap.span_of(addr).is_some(), "live object {addr:#x} has no span");
        prev_end = addr + size;
    }
    drop(cache);
    heap.advance_generation();
    heap.finish_sweep();
    for &addr in live.keys() {
        assert!(heap.span_of(addr).is_some(), "retained object {addr:#x} was reclaimed");
    }
    assert!(heap.check_invariants().is_ok());
});
