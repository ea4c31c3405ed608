//! Generation-stamped lazy sweeping.
//!
//! The heap's sweep generation `sg` advances by 2 per collection cycle. A
//! span stamped `sg - 2` needs sweeping, `sg - 1` is being swept, and `sg`
//! is swept. A span re-stamped just before the generation moved on may sit
//! further back; any even stamp behind `sg` still needs one sweep. Whoever
//! moves such a stamp to `sg - 1` with a CAS owns the sweep; everyone else
//! moves on to another span.
//!
//! Sweeps happen lazily when a central list checks a span out, or out of
//! band through [`Heap::sweep_span`], [`Heap::sweep_one`] and
//! [`Heap::finish_sweep`].

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::collector::{LiveMap, SweepView};
use crate::error::InvariantViolation;
use crate::heap::Heap;
use crate::log::{HeapLogLevel, LogEvent};
use crate::metrics::HeapMetrics;
use crate::span::{Span, SpanBody, SpanId, SpanKind, SpanState, SweepStamp};

/// Result of an attempt to sweep one span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Already swept in the current generation; nothing changed.
    AlreadySwept,
    /// Cached by a thread or claimed by another sweeper.
    Busy,
    /// No such span in use.
    NotInUse,
    Swept {
        freed: usize,
        live: usize,
        /// The span had no live objects left and went back to the page heap.
        released: bool,
    },
}

impl SweepOutcome {
    #[must_use]
    pub fn freed(self) -> usize {
        match self {
            Self::Swept { freed, .. } => freed,
            _ => 0,
        }
    }
}

impl Heap {
    /// Current sweep generation.
    #[must_use]
    pub fn sweep_generation(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    /// Asks the collector which allocated slots survive and installs the
    /// answer. Returns `(freed, live)`.
    pub(crate) fn sweep_body(&self, span: &Span, body: &mut SpanBody) -> (usize, usize) {
        let allocated = body.allocated_map(span.nelems);
        let alloc_count = body.alloc_count();
        if allocated.count() != alloc_count {
            self.fatal(InvariantViolation::AllocCountMismatch {
                span: span.id.0,
                alloc_count,
                allocated: allocated.count(),
            });
        }
        let view = SweepView {
            span: span.id,
            base: span.base,
            elem_size: span.elem_size,
            nelems: span.nelems,
            large: span.is_large(),
            allocated: &allocated,
        };
        let reported = self.collector.sweep_span(&view);
        let mut live = LiveMap::from_words(reported.into_words(), span.nelems);
        live.intersect(&allocated);

        let nlive = live.count();
        let freed = alloc_count - nlive;
        body.reset_from_live(live);
        if freed > 0 {
            body.needs_zero = true;
        }

        if let SpanKind::Small(class) = span.kind {
            self.central[class.index()].count_freed(freed);
        }
        HeapMetrics::inc(&self.metrics.spans_swept);
        HeapMetrics::add(&self.metrics.objects_freed, freed as u64);
        HeapMetrics::sub(&self.metrics.heap_live, (freed * span.elem_size) as u64);
        (freed, nlive)
    }

    /// Sweeps a span the caller claimed and keeps, then stamps it swept.
    pub(crate) fn sweep_owned(&self, span: &Span, sg: u32) -> SweepOutcome {
        let (freed, live) = {
            let mut slot = span.body();
            let Some(body) = slot.as_mut() else {
                self.fatal(InvariantViolation::DoubleOwner {
                    span: span.id.0,
                    detail: "claimed for sweeping while checked out".into(),
                });
            };
            self.sweep_body(span, body)
        };
        span.stamp(sg);
        SweepOutcome::Swept {
            freed,
            live,
            released: false,
        }
    }

    /// Sweeps the span `id` if it needs it and nobody else holds it.
    pub fn sweep_span(&self, id: SpanId) -> SweepOutcome {
        match self.pages.table().get(id) {
            Some(span) => self.sweep_in_use(&span),
            None => SweepOutcome::NotInUse,
        }
    }

    fn sweep_in_use(&self, span: &Arc<Span>) -> SweepOutcome {
        match span.kind {
            SpanKind::Small(class) => {
                let central = &self.central[class.index()];
                let (sg, was_empty) = match central.claim_for_sweep(self, span) {
                    Ok(claim) => claim,
                    Err(outcome) => return outcome,
                };
                let (freed, live) = {
                    let mut slot = span.body();
                    let Some(body) = slot.as_mut() else {
                        self.fatal(InvariantViolation::DoubleOwner {
                            span: span.id.0,
                            detail: "queued span has no body".into(),
                        });
                    };
                    self.sweep_body(span, body)
                };
                let released = if freed > 0 {
                    central.free_span(self, span, false, was_empty, sg)
                } else {
                    central.settle_unfreed(self, span, was_empty, sg);
                    false
                };
                SweepOutcome::Swept {
                    freed,
                    live,
                    released,
                }
            }
            SpanKind::Large => {
                if span.state() != SpanState::StandaloneLarge {
                    return SweepOutcome::NotInUse;
                }
                let sg = self.sweep_generation();
                if span.sweepgen() == sg {
                    return SweepOutcome::AlreadySwept;
                }
                if !span.try_claim(sg) {
                    return SweepOutcome::Busy;
                }
                let (freed, live) = {
                    let mut slot = span.body();
                    match slot.as_mut() {
                        Some(body) => self.sweep_body(span, body),
                        None => self.fatal(InvariantViolation::DoubleOwner {
                            span: span.id.0,
                            detail: "large span has no body".into(),
                        }),
                    }
                };
                let released = live == 0;
                if released {
                    self.pages.record(
                        LogEvent::new(HeapLogLevel::Debug, "sweep", "large_object_freed", "ok")
                            .span(span.id.0)
                            .pages(span.npages),
                    );
                    self.pages.free_span(span);
                } else {
                    span.stamp(sg);
                }
                SweepOutcome::Swept {
                    freed,
                    live,
                    released,
                }
            }
        }
    }

    /// Sweeps the lowest-addressed span that needs it. Returns `None` when
    /// no span outside a thread cache is left to sweep.
    pub fn sweep_one(&self) -> Option<(SpanId, SweepOutcome)> {
        let sg = self.sweep_generation();
        for span in self.pages.table().all() {
            if span.sweep_stamp(sg) != SweepStamp::Due || span.state() == SpanState::CheckedOutToCache {
                continue;
            }
            match self.sweep_in_use(&span) {
                outcome @ SweepOutcome::Swept { .. } => return Some((span.id, outcome)),
                _ => continue,
            }
        }
        None
    }

    /// Sweeps every span left over from the previous generation, then waits
    /// for sweeps claimed by other threads to finish. Spans cached by thread
    /// caches are left alone. Returns the number of objects freed here.
    pub fn finish_sweep(&self) -> usize {
        let sg = self.sweep_generation();
        let mut freed = 0;
        // Spans created from here on are stamped current, so one pass covers
        // everything that was due.
        for span in self.pages.table().all() {
            if span.sweep_stamp(sg) == SweepStamp::Due {
                freed += self.sweep_in_use(&span).freed();
            }
        }
        loop {
            let sg = self.sweep_generation();
            let in_flight = self
                .pages
                .table()
                .all()
                .iter()
                .any(|s| s.sweep_stamp(sg) == SweepStamp::Sweeping);
            if !in_flight {
                break;
            }
            std::thread::yield_now();
        }
        freed
    }

    /// Finishes the current generation's sweep and starts the next one.
    /// Every span not cached by a thread becomes due for sweeping.
    pub fn advance_generation(&self) -> u32 {
        let _serial = self.gen_lock.lock();
        let freed = self.finish_sweep();
        let next = self.sweepgen.fetch_add(2, Ordering::AcqRel).wrapping_add(2);
        self.pages.record(
            LogEvent::new(HeapLogLevel::Debug, "sweep", "generation_advanced", "ok")
                .details(format!("generation {next}, {freed} objects freed finishing the last")),
        );
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::os::SimulatedOs;
    use crate::size_class::SizeClassTable;
    use crate::thread_cache::AllocFlags;
    use crate::{LiveSetCollector, PAGE_SIZE, RetainAll};

    fn heap(collector: Arc<LiveSetCollector>) -> Heap {
        Heap::new(
            HeapConfig::default().with_arena_bytes(64 << 20),
            Arc::new(SimulatedOs::new()),
            collector,
        )
        .expect("heap")
    }

    #[test]
    fn stale_stamp_reads_as_needing_sweep() {
        let h = Heap::new(
            HeapConfig::default().with_arena_bytes(64 << 20),
            Arc::new(SimulatedOs::new()),
            Arc::new(RetainAll),
        )
        .unwrap();
        assert_eq!(h.sweep_generation(), 0);
        assert_eq!(h.advance_generation(), 2);
        assert_eq!(h.sweep_generation(), 2);
    }

    #[test]
    fn sweep_is_idempotent_within_a_generation() {
        let c = Arc::new(LiveSetCollector::new());
        let h = heap(c.clone());
        let mut cache = h.thread_cache();
        let keep = cache.alloc(64, AllocFlags::default()).unwrap();
        for _ in 0..9 {
            cache.alloc(64, AllocFlags::default()).unwrap();
        }
        c.retain(keep.addr);
        let id = h.span_of(keep.addr).unwrap().id;
        drop(cache);
        h.advance_generation();

        match h.sweep_span(id) {
            SweepOutcome::Swept { freed, live, released } => {
                assert_eq!((freed, live, released), (9, 1, false));
            }
            other => panic!("unexpected {other:?}"),
        }
        let before = h.class_stats();
        let live_before = h.metrics().heap_live;
        assert_eq!(h.sweep_span(id), SweepOutcome::AlreadySwept);
        assert_eq!(h.class_stats(), before);
        assert_eq!(h.metrics().heap_live, live_before);
        assert_eq!(h.span(id).unwrap().alloc_count(), Some(1));
    }

    #[test]
    fn cached_span_is_busy() {
        let c = Arc::new(LiveSetCollector::new());
        let h = heap(c);
        let mut cache = h.thread_cache();
        let a = cache.alloc(64, AllocFlags::default()).unwrap();
        let id = h.span_of(a.addr).unwrap().id;
        assert_eq!(h.sweep_span(id), SweepOutcome::Busy);
        assert_eq!(h.sweep_span(SpanId(9999)), SweepOutcome::NotInUse);
    }

    #[test]
    fn dead_span_returns_to_page_heap() {
        let c = Arc::new(LiveSetCollector::new());
        let h = heap(c);
        let mut cache = h.thread_cache();
        let a = cache.alloc(256, AllocFlags::default()).unwrap();
        let span = h.span_of(a.addr).unwrap();
        drop(cache);
        let free_before = h.free_pages();
        h.advance_generation();
        let (id, outcome) = h.sweep_one().expect("one span due");
        assert_eq!(id, span.id);
        assert_eq!(
            outcome,
            SweepOutcome::Swept {
                freed: 1,
                live: 0,
                released: true
            }
        );
        assert_eq!(span.state(), SpanState::Free);
        assert!(h.span(id).is_none());
        assert_eq!(h.free_pages(), free_before + span.npages);
        assert_eq!(h.sweep_one(), None);
        assert_eq!(h.metrics().heap_live, 0);
    }

    #[test]
    fn full_span_moves_to_nonempty_after_freeing() {
        let c = Arc::new(LiveSetCollector::new());
        let h = heap(c.clone());
        let class = SizeClassTable::standard().class_for(1024).unwrap();
        let mut cache = h.thread_cache();
        let first = cache.alloc(1024, AllocFlags::default()).unwrap();
        let span = h.span_of(first.addr).unwrap();
        c.retain(first.addr);
        for _ in 1..span.nelems {
            cache.alloc(1024, AllocFlags::default()).unwrap();
        }
        drop(cache);
        assert_eq!(span.state(), SpanState::InCentralEmpty);
        h.advance_generation();
        let outcome = h.sweep_span(span.id);
        assert_eq!(outcome.freed(), span.nelems - 1);
        assert_eq!(span.state(), SpanState::InCentralNonempty);
        let stats = h.class_stats();
        let s = stats.iter().find(|s| s.class == class).unwrap();
        assert_eq!((s.nonempty_spans, s.empty_spans), (1, 0));
        assert_eq!(s.nmalloc - s.nfree, 1);
    }

    #[test]
    fn dead_large_object_is_released() {
        let c = Arc::new(LiveSetCollector::new());
        let h = heap(c.clone());
        let mut cache = h.thread_cache();
        let big = cache.alloc(5 * PAGE_SIZE, AllocFlags::default()).unwrap();
        let kept = cache.alloc(5 * PAGE_SIZE, AllocFlags::default()).unwrap();
        c.retain(kept.addr + 100);
        drop(cache);
        h.advance_generation();
        let freed = h.finish_sweep();
        assert_eq!(freed, 1);
        assert!(h.span_of(big.addr).is_none());
        let kept_span = h.span_of(kept.addr).unwrap();
        assert_eq!(kept_span.sweepgen(), h.sweep_generation());
        assert_eq!(h.metrics().heap_live, (5 * PAGE_SIZE) as u64);
    }

    #[test]
    fn advancing_finishes_the_previous_sweep() {
        let c = Arc::new(LiveSetCollector::new());
        let h = heap(c);
        let mut cache = h.thread_cache();
        for _ in 0..100 {
            cache.alloc(128, AllocFlags::default()).unwrap();
        }
        drop(cache);
        h.advance_generation();
        h.advance_generation();
        assert!(h.pages.table().is_empty());
        assert_eq!(h.metrics().objects_freed, 100);
        h.check_invariants().unwrap();
    }

    #[test]
    fn spans_stamped_generations_ago_are_still_swept() {
        let h = heap(Arc::new(LiveSetCollector::new()));
        h.advance_generation();
        h.advance_generation();
        let (big, small) = {
            let mut cache = h.thread_cache();
            let big = cache.alloc(32768, AllocFlags::default()).unwrap();
            let small = cache.alloc(64, AllocFlags::default()).unwrap();
            (h.span_of(big.addr).unwrap(), h.span_of(small.addr).unwrap())
        };
        let sg = h.sweep_generation();
        big.stamp(sg.wrapping_sub(4));
        small.stamp(sg.wrapping_sub(6));

        let (id, outcome) = h.sweep_one().expect("a span is due");
        assert!(id == big.id || id == small.id);
        assert!(matches!(outcome, SweepOutcome::Swept { freed: 1, released: true, .. }));
        assert_eq!(h.finish_sweep(), 1);
        assert!(h.pages.table().is_empty());
        h.check_invariants().unwrap();
    }
}
