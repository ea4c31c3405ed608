//! Per-size-class central free lists.
//!
//! Each list brokers spans of one class between the page heap and thread
//! caches. Spans with at least one free slot sit in `nonempty`, full spans in
//! `empty`. A span checked out to a cache is in neither queue.
//!
//! Within `empty`, spans needing a sweep come before spans already swept in
//! the current generation, so a scan can stop at the first swept span.
//!
//! The queue lock covers link manipulation and generation claims only. Sweeps
//! and page-heap calls happen after it is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{HeapError, InvariantViolation};
use crate::heap::Heap;
use crate::metrics::HeapMetrics;
use crate::size_class::ClassId;
use crate::span::{NIL, Span, SpanBody, SpanId, SpanKind, SpanState, SpanTable, SweepStamp};
use crate::sweep::SweepOutcome;

/// Intrusive doubly linked list of spans. Links live in the spans.
#[derive(Debug)]
pub(crate) struct SpanList {
    head: u32,
    tail: u32,
    len: usize,
}

fn resolve(table: &SpanTable, link: u32) -> Option<Arc<Span>> {
    if link == NIL {
        return None;
    }
    table.get(SpanId(link))
}

impl SpanList {
    pub(crate) const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push_front(&mut self, table: &SpanTable, span: &Span) {
        span.prev.store(NIL, Ordering::Relaxed);
        span.next.store(self.head, Ordering::Relaxed);
        match resolve(table, self.head) {
            Some(old) => old.prev.store(span.id.0, Ordering::Relaxed),
            None => self.tail = span.id.0,
        }
        self.head = span.id.0;
        self.len += 1;
    }

    pub(crate) fn push_back(&mut self, table: &SpanTable, span: &Span) {
        span.next.store(NIL, Ordering::Relaxed);
        span.prev.store(self.tail, Ordering::Relaxed);
        match resolve(table, self.tail) {
            Some(old) => old.next.store(span.id.0, Ordering::Relaxed),
            None => self.head = span.id.0,
        }
        self.tail = span.id.0;
        self.len += 1;
    }

    /// Unlinks `span`, which must be on this list.
    pub(crate) fn remove(&mut self, table: &SpanTable, span: &Span) {
        let prev = span.prev.swap(NIL, Ordering::Relaxed);
        let next = span.next.swap(NIL, Ordering::Relaxed);
        match resolve(table, prev) {
            Some(p) => p.next.store(next, Ordering::Relaxed),
            None => self.head = next,
        }
        match resolve(table, next) {
            Some(n) => n.prev.store(prev, Ordering::Relaxed),
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Span ids from head to tail.
    pub(crate) fn ids(&self, table: &SpanTable) -> Vec<SpanId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(span) = resolve(table, cur) {
            out.push(span.id);
            cur = span.next.load(Ordering::Relaxed);
            if out.len() > self.len {
                break;
            }
        }
        out
    }
}

#[derive(Debug)]
struct Queues {
    nonempty: SpanList,
    empty: SpanList,
}

/// Snapshot of one central list's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CentralStats {
    /// Cumulative objects counted as allocated.
    pub nmalloc: u64,
    /// Cumulative objects freed by sweeps.
    pub nfree: u64,
    pub nonempty_spans: usize,
    pub empty_spans: usize,
}

/// Central free list of one size class.
#[derive(Debug)]
pub struct CentralFreeList {
    class: ClassId,
    queues: Mutex<Queues>,
    nmalloc: AtomicU64,
    nfree: AtomicU64,
}

impl CentralFreeList {
    #[must_use]
    pub fn new(class: ClassId) -> Self {
        Self {
            class,
            queues: Mutex::new(Queues {
                nonempty: SpanList::new(),
                empty: SpanList::new(),
            }),
            nmalloc: AtomicU64::new(0),
            nfree: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn class(&self) -> ClassId {
        self.class
    }

    #[must_use]
    pub fn stats(&self) -> CentralStats {
        let q = self.queues.lock();
        CentralStats {
            nmalloc: self.nmalloc.load(Ordering::Relaxed),
            nfree: self.nfree.load(Ordering::Relaxed),
            nonempty_spans: q.nonempty.len(),
            empty_spans: q.empty.len(),
        }
    }

    /// Queue contents as `(nonempty, empty)`, head first.
    pub(crate) fn queue_ids(&self, table: &SpanTable) -> (Vec<SpanId>, Vec<SpanId>) {
        let q = self.queues.lock();
        (q.nonempty.ids(table), q.empty.ids(table))
    }

    pub(crate) fn count_freed(&self, n: usize) {
        self.nfree.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Hands a span with at least one free slot to a thread cache. The
    /// span's body moves out with it; every free slot is counted as
    /// allocated until [`Self::uncache_span`] returns the unused ones.
    pub(crate) fn checkout_span(&self, heap: &Heap) -> Result<(Arc<Span>, SpanBody), HeapError> {
        let span = match self.find_span(heap) {
            Some(span) => span,
            None => self.fresh_span(heap)?,
        };

        let Some(mut body) = span.take_body() else {
            heap.fatal(InvariantViolation::DoubleOwner {
                span: span.id.0,
                detail: "checked out while its body is already in a cache".into(),
            });
        };
        let allocated = body.alloc_count();
        if allocated > span.nelems {
            heap.fatal(InvariantViolation::AllocCountOverflow {
                span: span.id.0,
                alloc_count: allocated,
                nelems: span.nelems,
            });
        }
        let n = span.nelems - allocated;
        if n == 0 {
            heap.fatal(InvariantViolation::NoFreeObjects { span: span.id.0 });
        }
        self.nmalloc.fetch_add(n as u64, Ordering::Relaxed);
        HeapMetrics::add(&heap.metrics.heap_live, (n * span.elem_size) as u64);
        HeapMetrics::inc(&heap.metrics.checkouts);
        body.prime_cache();
        Ok((span, body))
    }

    /// Finds a queued span with free slots, sweeping stale ones on the way.
    fn find_span(&self, heap: &Heap) -> Option<Arc<Span>> {
        let table = heap.pages.table();
        let mut q = self.queues.lock();
        'retry: loop {
            let sg = heap.sweep_generation();

            let mut cur = q.nonempty.head;
            while let Some(span) = resolve(table, cur) {
                cur = span.next.load(Ordering::Relaxed);
                match span.sweep_stamp(sg) {
                    SweepStamp::Sweeping => continue,
                    SweepStamp::Due => {
                        if !span.try_claim(sg) {
                            continue;
                        }
                        q.nonempty.remove(table, &span);
                        span.set_state(SpanState::CheckedOutToCache);
                        drop(q);
                        heap.sweep_owned(&span, sg);
                        return Some(span);
                    }
                    SweepStamp::Swept => {
                        q.nonempty.remove(table, &span);
                        span.set_state(SpanState::CheckedOutToCache);
                        return Some(span);
                    }
                }
            }

            let mut cur = q.empty.head;
            while let Some(span) = resolve(table, cur) {
                cur = span.next.load(Ordering::Relaxed);
                match span.sweep_stamp(sg) {
                    SweepStamp::Sweeping => continue,
                    // Everything from here on was swept this generation.
                    SweepStamp::Swept => break,
                    SweepStamp::Due => {}
                }
                if !span.try_claim(sg) {
                    continue;
                }
                q.empty.remove(table, &span);
                span.set_state(SpanState::CheckedOutToCache);
                drop(q);
                heap.sweep_owned(&span, sg);
                if span.free_slots().unwrap_or(0) > 0 {
                    return Some(span);
                }
                q = self.queues.lock();
                span.set_state(SpanState::InCentralEmpty);
                q.empty.push_back(table, &span);
                continue 'retry;
            }
            return None;
        }
    }

    fn fresh_span(&self, heap: &Heap) -> Result<Arc<Span>, HeapError> {
        let class = heap.classes.class(self.class);
        let span = heap.pages.alloc_span(
            class.span_pages,
            SpanKind::Small(self.class),
            class.object_size,
            SpanState::CheckedOutToCache,
            heap.sweep_generation(),
        )?;
        Ok(span)
    }

    /// Takes a span back from a thread cache.
    pub(crate) fn uncache_span(&self, heap: &Heap, span: &Arc<Span>, body: SpanBody) {
        let allocated = body.alloc_count();
        if allocated == 0 {
            heap.fatal(InvariantViolation::UncacheUnused { span: span.id.0 });
        }
        if span.restore_body(body).is_err() {
            heap.fatal(InvariantViolation::DoubleOwner {
                span: span.id.0,
                detail: "uncached while its body is already home".into(),
            });
        }
        let n = span.nelems - allocated;
        let table = heap.pages.table();

        let mut q = self.queues.lock();
        let sg = heap.sweep_generation();
        // Cached across a generation change: it has not been swept for
        // the current generation yet.
        let stale = span.sweepgen() != sg;
        if stale {
            span.stamp(sg.wrapping_sub(2));
        }
        if n > 0 {
            q.nonempty.push_front(table, span);
            span.set_state(SpanState::InCentralNonempty);
        } else {
            if stale {
                q.empty.push_front(table, span);
            } else {
                q.empty.push_back(table, span);
            }
            span.set_state(SpanState::InCentralEmpty);
        }
        drop(q);

        if n > 0 {
            self.nmalloc.fetch_sub(n as u64, Ordering::Relaxed);
            HeapMetrics::sub(&heap.metrics.heap_live, (n * span.elem_size) as u64);
        }
        HeapMetrics::inc(&heap.metrics.uncaches);
    }

    /// Claims a queued span for an out-of-band sweep. On success returns
    /// the generation it was claimed in and whether it sat in `empty`.
    pub(crate) fn claim_for_sweep(&self, heap: &Heap, span: &Span) -> Result<(u32, bool), SweepOutcome> {
        let _q = self.queues.lock();
        let sg = heap.sweep_generation();
        let state = span.state();
        match state {
            SpanState::Free => return Err(SweepOutcome::NotInUse),
            SpanState::CheckedOutToCache => return Err(SweepOutcome::Busy),
            _ => {}
        }
        if span.sweepgen() == sg {
            return Err(SweepOutcome::AlreadySwept);
        }
        if !span.try_claim(sg) {
            return Err(SweepOutcome::Busy);
        }
        Ok((sg, state == SpanState::InCentralEmpty))
    }

    /// Finishes an out-of-band sweep of a queued span that freed nothing. A
    /// full span moves behind the spans still waiting for a sweep.
    pub(crate) fn settle_unfreed(&self, heap: &Heap, span: &Arc<Span>, was_empty: bool, sg: u32) {
        let table = heap.pages.table();
        let mut q = self.queues.lock();
        span.stamp(sg);
        if was_empty {
            q.empty.remove(table, span);
            if heap.sweep_generation() == sg {
                q.empty.push_back(table, span);
            } else {
                q.empty.push_front(table, span);
            }
        }
    }

    /// Finishes an out-of-band sweep of a queued span that freed objects.
    ///
    /// With `preserve` the caller keeps the span and only the stamp moves.
    /// Otherwise a formerly full span moves to `nonempty`, and a span with
    /// no live objects left goes back to the page heap, in which case this
    /// returns true.
    pub(crate) fn free_span(
        &self,
        heap: &Heap,
        span: &Arc<Span>,
        preserve: bool,
        was_empty: bool,
        sg: u32,
    ) -> bool {
        if preserve {
            span.stamp(sg);
            return false;
        }
        if span.state() == SpanState::CheckedOutToCache {
            heap.fatal(InvariantViolation::UnexpectedState {
                span: span.id.0,
                state: SpanState::CheckedOutToCache,
                expected: "a central queue",
            });
        }
        let table = heap.pages.table();
        let mut q = self.queues.lock();
        if was_empty {
            q.empty.remove(table, span);
            q.nonempty.push_front(table, span);
            span.set_state(SpanState::InCentralNonempty);
        }
        span.stamp(sg);
        if span.alloc_count() != Some(0) {
            return false;
        }
        q.nonempty.remove(table, span);
        drop(q);
        heap.pages.free_span(span);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::os::SimulatedOs;
    use crate::size_class::SizeClassTable;
    use crate::{LiveSetCollector, RetainAll};

    fn heap_with(collector: Arc<dyn crate::Collector>) -> Heap {
        Heap::new(
            HeapConfig::default().with_arena_bytes(64 << 20),
            Arc::new(SimulatedOs::new()),
            collector,
        )
        .expect("heap")
    }

    fn class_of(size: usize) -> ClassId {
        SizeClassTable::standard().class_for(size).unwrap()
    }

    #[test]
    fn span_list_links() {
        let heap = heap_with(Arc::new(RetainAll));
        let c = heap.central(class_of(1024));
        let spans: Vec<_> = (0..3)
            .map(|_| c.checkout_span(&heap).unwrap())
            .collect();
        let table = heap.pages.table();
        let mut list = SpanList::new();
        list.push_back(table, &spans[1].0);
        list.push_front(table, &spans[0].0);
        list.push_back(table, &spans[2].0);
        let ids: Vec<_> = spans.iter().map(|(s, _)| s.id).collect();
        assert_eq!(list.ids(table), ids);
        list.remove(table, &spans[1].0);
        assert_eq!(list.ids(table), vec![ids[0], ids[2]]);
        list.remove(table, &spans[0].0);
        list.remove(table, &spans[2].0);
        assert_eq!(list.len(), 0);
        assert!(list.ids(table).is_empty());
    }

    #[test]
    fn fresh_checkout_counts_every_slot() {
        let heap = heap_with(Arc::new(RetainAll));
        let class = class_of(48);
        let c = heap.central(class);
        let (span, body) = c.checkout_span(&heap).unwrap();
        assert_eq!(span.state(), SpanState::CheckedOutToCache);
        assert_eq!(span.sweepgen(), heap.sweep_generation());
        assert!(span.alloc_count().is_none(), "body travels with the cache");
        assert_eq!(body.alloc_count(), 0);
        assert_eq!(c.stats().nmalloc, span.nelems as u64);
        assert_eq!(
            heap.metrics().heap_live,
            (span.nelems * span.elem_size) as u64
        );
    }

    #[test]
    fn uncache_reverses_unused_slots() {
        let heap = heap_with(Arc::new(RetainAll));
        let c = heap.central(class_of(48));
        let (span, mut body) = c.checkout_span(&heap).unwrap();
        for _ in 0..5 {
            body.next_free_fast(span.nelems).unwrap();
        }
        c.uncache_span(&heap, &span, body);
        assert_eq!(span.state(), SpanState::InCentralNonempty);
        assert_eq!(c.stats().nmalloc, 5);
        assert_eq!(c.stats().nonempty_spans, 1);
        assert_eq!(heap.metrics().heap_live, 5 * 48);

        // Takes the same partially used span again.
        let (again, body) = c.checkout_span(&heap).unwrap();
        assert_eq!(again.id, span.id);
        assert_eq!(body.alloc_count(), 5);
        assert_eq!(c.stats().nonempty_spans, 0);
    }

    #[test]
    fn full_span_goes_to_empty_queue() {
        let heap = heap_with(Arc::new(RetainAll));
        let c = heap.central(class_of(32768));
        let (span, mut body) = c.checkout_span(&heap).unwrap();
        assert_eq!(span.nelems, 1);
        body.next_free_fast(span.nelems).unwrap();
        c.uncache_span(&heap, &span, body);
        assert_eq!(span.state(), SpanState::InCentralEmpty);
        let (other, _) = c.checkout_span(&heap).unwrap();
        assert_ne!(other.id, span.id);
        assert_eq!(c.stats().empty_spans, 1);
    }

    #[test]
    #[should_panic(expected = "alloc count is 0")]
    fn uncaching_unused_span_is_fatal() {
        let heap = heap_with(Arc::new(RetainAll));
        let c = heap.central(class_of(64));
        let (span, body) = c.checkout_span(&heap).unwrap();
        c.uncache_span(&heap, &span, body);
    }

    #[test]
    fn checkout_sweeps_stale_full_span() {
        let collector = Arc::new(LiveSetCollector::new());
        let heap = heap_with(collector.clone());
        let c = heap.central(class_of(32768));
        let (span, mut body) = c.checkout_span(&heap).unwrap();
        body.next_free_fast(1).unwrap();
        c.uncache_span(&heap, &span, body);
        heap.advance_generation();

        // Nothing retains the object: the empty-queue scan sweeps it and
        // hands the same span out again.
        let (again, body) = c.checkout_span(&heap).unwrap();
        assert_eq!(again.id, span.id);
        assert_eq!(again.sweepgen(), heap.sweep_generation());
        assert_eq!(body.alloc_count(), 0);
        assert!(body.needs_zero());
        assert_eq!(c.stats().nfree, 1);
    }

    #[test]
    fn still_full_span_is_requeued_behind() {
        let collector = Arc::new(LiveSetCollector::new());
        let heap = heap_with(collector.clone());
        let c = heap.central(class_of(32768));
        let (span, mut body) = c.checkout_span(&heap).unwrap();
        body.next_free_fast(1).unwrap();
        collector.retain(span.base);
        c.uncache_span(&heap, &span, body);
        heap.advance_generation();

        let (fresh, _) = c.checkout_span(&heap).unwrap();
        assert_ne!(fresh.id, span.id);
        assert_eq!(span.state(), SpanState::InCentralEmpty);
        assert_eq!(span.sweepgen(), heap.sweep_generation());
        let (_, empty) = c.queue_ids(heap.pages.table());
        assert_eq!(empty, vec![span.id]);
    }

    #[test]
    fn span_generations_behind_is_swept_on_checkout() {
        let heap = heap_with(Arc::new(LiveSetCollector::new()));
        heap.advance_generation();
        heap.advance_generation();
        let c = heap.central(class_of(64));
        let (span, mut body) = c.checkout_span(&heap).unwrap();
        for _ in 0..5 {
            body.next_free_fast(span.nelems).unwrap();
        }
        c.uncache_span(&heap, &span, body);
        // Re-stamped for a sweep just before two generation advances.
        let sg = heap.sweep_generation();
        span.stamp(sg.wrapping_sub(4));

        let (again, body) = c.checkout_span(&heap).unwrap();
        assert_eq!(again.id, span.id);
        assert_eq!(body.alloc_count(), 0);
        assert_eq!(again.sweepgen(), sg);
        assert_eq!(c.stats().nfree, 5);
    }

    #[test]
    fn unfreed_out_of_band_sweep_moves_behind_due_spans() {
        let collector = Arc::new(LiveSetCollector::new());
        let heap = heap_with(collector.clone());
        let c = heap.central(class_of(32768));
        let (kept, mut kept_body) = c.checkout_span(&heap).unwrap();
        let (dead, mut dead_body) = c.checkout_span(&heap).unwrap();
        kept_body.next_free_fast(1).unwrap();
        dead_body.next_free_fast(1).unwrap();
        collector.retain(kept.base);
        c.uncache_span(&heap, &kept, kept_body);
        c.uncache_span(&heap, &dead, dead_body);
        heap.advance_generation();

        let outcome = heap.sweep_span(kept.id);
        assert_eq!(outcome.freed(), 0);
        let (_, empty) = c.queue_ids(heap.pages.table());
        assert_eq!(empty, vec![dead.id, kept.id]);

        // The scan still reaches the span that needs sweeping.
        let (taken, body) = c.checkout_span(&heap).unwrap();
        assert_eq!(taken.id, dead.id);
        assert_eq!(body.alloc_count(), 0);
        assert_eq!(heap.spans().len(), 2);
    }

    #[test]
    fn preserve_only_stamps() {
        let heap = heap_with(Arc::new(RetainAll));
        let c = heap.central(class_of(64));
        let (span, _body) = c.checkout_span(&heap).unwrap();
        assert!(!c.free_span(&heap, &span, true, false, 42));
        assert_eq!(span.sweepgen(), 42);
        assert_eq!(span.state(), SpanState::CheckedOutToCache);
    }

    #[test]
    #[should_panic(expected = "CheckedOutToCache")]
    fn freeing_cached_span_is_fatal() {
        let heap = heap_with(Arc::new(RetainAll));
        let c = heap.central(class_of(64));
        let (span, _body) = c.checkout_span(&heap).unwrap();
        c.free_span(&heap, &span, false, false, 0);
    }
}
