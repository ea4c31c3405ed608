//! Per-thread allocation front end.
//!
//! A [`ThreadCache`] holds at most one active span per size class together
//! with that span's body, so the fast path touches no lock and no shared
//! cache line. Pointer-free requests below [`TINY_SIZE`] are packed into a
//! shared 16-byte block; everything above the small-object ceiling bypasses
//! the caches and goes to the page heap.

use std::sync::Arc;

use crate::collector::NewObject;
use crate::error::{HeapError, InvariantViolation};
use crate::heap::Heap;
use crate::metrics::HeapMetrics;
use crate::size_class::{ClassId, MAX_SMALL_SIZE, TINY_CLASS, TINY_SIZE};
use crate::span::{Span, SpanBody, SpanId};
use crate::align_up;

/// Allocation request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocFlags {
    /// The object will never hold pointers the collector must trace.
    pub pointer_free: bool,
    /// Reused memory must be zeroed before it is returned.
    pub zeroed: bool,
}

impl Default for AllocFlags {
    fn default() -> Self {
        Self {
            pointer_free: false,
            zeroed: true,
        }
    }
}

impl AllocFlags {
    #[must_use]
    pub const fn pointer_free() -> Self {
        Self {
            pointer_free: true,
            zeroed: true,
        }
    }

    /// Skips zeroing of reused slots; the caller overwrites the object.
    #[must_use]
    pub const fn uninit(mut self) -> Self {
        self.zeroed = false;
        self
    }
}

/// A successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub addr: usize,
    /// Usable bytes: the slot size for small objects, whole pages for large
    /// ones, the request itself for tiny ones.
    pub size: usize,
    /// The allocation left the fast path (span refill or page heap). A
    /// collector pacer may use this to start or assist a cycle.
    pub heavy: bool,
}

struct CachedSpan {
    span: Arc<Span>,
    body: SpanBody,
}

#[derive(Debug, Default)]
struct LocalStats {
    tiny_allocs: u64,
    tiny_blocks: u64,
    small_allocs: u64,
    large_allocs: u64,
    zero_size_allocs: u64,
    refills: u64,
}

/// Single-owner allocation cache. Create one per thread with
/// [`Heap::thread_cache`]; dropping it hands every span back.
pub struct ThreadCache<'h> {
    heap: &'h Heap,
    active: Vec<Option<CachedSpan>>,
    tiny: usize,
    tiny_offset: usize,
    generation: u32,
    stats: LocalStats,
}

impl<'h> ThreadCache<'h> {
    pub(crate) fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            active: (0..heap.classes.len()).map(|_| None).collect(),
            tiny: 0,
            tiny_offset: 0,
            generation: heap.sweep_generation(),
            stats: LocalStats::default(),
        }
    }

    /// Sweep generation this cache last synchronized with.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Spans currently held, by class.
    #[must_use]
    pub fn cached_spans(&self) -> Vec<SpanId> {
        self.active.iter().flatten().map(|c| c.span.id).collect()
    }

    /// Current tiny block as `(address, offset)`.
    #[must_use]
    pub fn tiny_block(&self) -> Option<(usize, usize)> {
        (self.tiny != 0).then_some((self.tiny, self.tiny_offset))
    }

    /// Allocates `size` bytes.
    pub fn alloc(&mut self, size: usize, flags: AllocFlags) -> Result<Allocation, HeapError> {
        self.sync_generation();
        if size == 0 {
            self.stats.zero_size_allocs += 1;
            return Ok(Allocation {
                addr: self.heap.zero_base(),
                size: 0,
                heavy: false,
            });
        }
        if size > MAX_SMALL_SIZE {
            let alloc = self.heap.alloc_large(size, flags)?;
            self.stats.large_allocs += 1;
            self.notify(alloc.addr, alloc.size, flags);
            return Ok(alloc);
        }
        if flags.pointer_free && size < TINY_SIZE {
            return self.alloc_tiny(size);
        }

        let class = self
            .heap
            .classes
            .class_for(size)
            .ok_or(HeapError::OutOfMemory { requested: size })?;
        let elem = self.heap.classes.object_size(class);
        let (addr, heavy, needs_zero) = self.next_free(class)?;
        if needs_zero && flags.zeroed {
            self.heap.pages.os().zero(addr, elem);
        }
        self.stats.small_allocs += 1;
        self.notify(addr, elem, flags);
        Ok(Allocation {
            addr,
            size: elem,
            heavy,
        })
    }

    /// Allocates `count` elements of `elem_size` bytes each.
    pub fn alloc_array(
        &mut self,
        elem_size: usize,
        count: usize,
        flags: AllocFlags,
    ) -> Result<Allocation, HeapError> {
        let total = elem_size
            .checked_mul(count)
            .filter(|&total| total <= self.heap.config.arena_bytes)
            .ok_or(HeapError::SizeOverflow { elem_size, count })?;
        self.alloc(total, flags)
    }

    fn alloc_tiny(&mut self, size: usize) -> Result<Allocation, HeapError> {
        let mut off = self.tiny_offset;
        if size & 7 == 0 {
            off = align_up(off, 8);
        } else if size & 3 == 0 {
            off = align_up(off, 4);
        } else if size & 1 == 0 {
            off = align_up(off, 2);
        }
        if self.tiny != 0 && off + size <= TINY_SIZE {
            self.tiny_offset = off + size;
            self.stats.tiny_allocs += 1;
            return Ok(Allocation {
                addr: self.tiny + off,
                size,
                heavy: false,
            });
        }

        let (block, heavy, _) = self.next_free(TINY_CLASS)?;
        self.heap.pages.os().zero(block, TINY_SIZE);
        // Keep whichever block has more room left.
        if size < self.tiny_offset || self.tiny == 0 {
            self.tiny = block;
            self.tiny_offset = size;
        }
        self.stats.tiny_allocs += 1;
        self.stats.tiny_blocks += 1;
        self.notify(block, TINY_SIZE, AllocFlags::pointer_free());
        Ok(Allocation {
            addr: block,
            size,
            heavy,
        })
    }

    /// Next free slot of `class` as `(address, heavy, needs_zero)`.
    fn next_free(&mut self, class: ClassId) -> Result<(usize, bool, bool), HeapError> {
        let heap = self.heap;
        if let Some(cached) = self.active[class.index()].as_mut() {
            let nelems = cached.span.nelems;
            let slot = match cached.body.next_free_fast(nelems) {
                Some(slot) => Some(slot),
                None => {
                    let idx = cached.body.next_free_index(nelems);
                    if idx < nelems {
                        cached.body.alloc_count += 1;
                        Some(idx)
                    } else {
                        None
                    }
                }
            };
            if let Some(slot) = slot {
                check_count(heap, cached);
                let addr = cached.span.base + slot * cached.span.elem_size;
                return Ok((addr, false, cached.body.needs_zero));
            }
        }

        self.refill(class)?;
        let Some(cached) = self.active[class.index()].as_mut() else {
            heap.fatal(InvariantViolation::ArenaState {
                detail: format!("class {} has no active span after refill", class.0),
            });
        };
        let nelems = cached.span.nelems;
        let slot = cached.body.next_free_index(nelems);
        if slot == nelems {
            heap.fatal(InvariantViolation::NoFreeObjects {
                span: cached.span.id.0,
            });
        }
        cached.body.alloc_count += 1;
        check_count(heap, cached);
        let addr = cached.span.base + slot * cached.span.elem_size;
        Ok((addr, true, cached.body.needs_zero))
    }

    /// Swaps the exhausted active span of `class` for one with free slots.
    fn refill(&mut self, class: ClassId) -> Result<(), HeapError> {
        let heap = self.heap;
        let central = heap.central(class);
        if let Some(old) = self.active[class.index()].take() {
            if old.body.alloc_count() != old.span.nelems {
                heap.fatal(InvariantViolation::BadGeometry {
                    span: old.span.id.0,
                    detail: "refill of span with free space remaining".into(),
                });
            }
            central.uncache_span(heap, &old.span, old.body);
        }
        let (span, body) = central.checkout_span(heap)?;
        self.active[class.index()] = Some(CachedSpan { span, body });
        self.stats.refills += 1;
        Ok(())
    }

    fn notify(&self, addr: usize, size: usize, flags: AllocFlags) {
        let collector = &self.heap.collector;
        if collector.is_marking() {
            collector.object_allocated(NewObject {
                addr,
                size,
                scan_size: if flags.pointer_free { 0 } else { size },
            });
        }
    }

    fn sync_generation(&mut self) {
        let sg = self.heap.sweep_generation();
        if sg != self.generation {
            self.release_all();
            self.generation = sg;
        }
    }

    /// Hands every cached span back to its central list and forgets the
    /// tiny block.
    pub fn release_all(&mut self) {
        self.tiny = 0;
        self.tiny_offset = 0;
        for (idx, slot) in self.active.iter_mut().enumerate() {
            if let Some(cached) = slot.take() {
                self.heap
                    .central(ClassId(idx as u8))
                    .uncache_span(self.heap, &cached.span, cached.body);
            }
        }
        self.flush_stats();
    }

    fn flush_stats(&mut self) {
        let m = &self.heap.metrics;
        let s = std::mem::take(&mut self.stats);
        HeapMetrics::add(&m.tiny_allocs, s.tiny_allocs);
        HeapMetrics::add(&m.tiny_blocks, s.tiny_blocks);
        HeapMetrics::add(&m.small_allocs, s.small_allocs);
        HeapMetrics::add(&m.large_allocs, s.large_allocs);
        HeapMetrics::add(&m.zero_size_allocs, s.zero_size_allocs);
        HeapMetrics::add(&m.refills, s.refills);
    }
}

fn check_count(heap: &Heap, cached: &CachedSpan) {
    if cached.body.alloc_count > cached.span.nelems {
        heap.fatal(InvariantViolation::AllocCountOverflow {
            span: cached.span.id.0,
            alloc_count: cached.body.alloc_count,
            nelems: cached.span.nelems,
        });
    }
}

impl Drop for ThreadCache<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}
