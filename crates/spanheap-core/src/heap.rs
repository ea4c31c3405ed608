//! The heap context.
//!
//! A [`Heap`] owns the page heap, one central free list per size class, the
//! sweep generation and the collector handle. Nothing is global: every
//! operation reaches the allocator through an explicit `&Heap`, so several
//! independent heaps can coexist in one process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use parking_lot::Mutex;

use crate::central::CentralFreeList;
use crate::collector::Collector;
use crate::config::HeapConfig;
use crate::error::{HeapError, InvariantViolation};
use crate::log::{HeapLog, HeapLogLevel, HeapLogRecord, LogEvent};
use crate::metrics::{HeapMetrics, MetricsSnapshot};
use crate::os::PageSource;
use crate::page_heap::{ArenaBounds, ArenaLayout, FreeRun, PageHeap};
use crate::size_class::{ClassId, SizeClassTable};
use crate::span::{Span, SpanId, SpanKind, SpanState};
use crate::thread_cache::{AllocFlags, Allocation, ThreadCache};
use crate::PAGE_SIZE;

/// Per-class counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub class: ClassId,
    pub object_size: usize,
    /// Objects counted as allocated (optimistic while spans are cached).
    pub nmalloc: u64,
    /// Objects freed by sweeps.
    pub nfree: u64,
    pub nonempty_spans: usize,
    pub empty_spans: usize,
}

/// What [`Heap::check_invariants`] counted on the way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapCensus {
    pub spans: usize,
    pub small_spans: usize,
    pub large_spans: usize,
    pub cached_spans: usize,
    pub nonempty_spans: usize,
    pub empty_spans: usize,
    /// Allocated objects in small spans not held by a thread cache.
    pub live_objects: usize,
    /// Allocated bytes in small spans not held by a thread cache.
    pub live_small_bytes: usize,
    pub large_bytes: usize,
    pub free_runs: usize,
    pub free_pages: usize,
}

/// A size-classed heap.
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) classes: &'static SizeClassTable,
    pub(crate) pages: PageHeap,
    /// Indexed by class id; entry 0 is never used.
    pub(crate) central: Vec<CentralFreeList>,
    pub(crate) collector: Arc<dyn Collector>,
    pub(crate) sweepgen: AtomicU32,
    pub(crate) gen_lock: Mutex<()>,
    pub(crate) metrics: Arc<HeapMetrics>,
    log: Arc<HeapLog>,
}

impl Heap {
    /// Validates `config`, reserves the arena through `os` and builds the
    /// central lists.
    pub fn new(
        config: HeapConfig,
        os: Arc<dyn PageSource>,
        collector: Arc<dyn Collector>,
    ) -> Result<Self, HeapError> {
        config.validate()?;
        let classes = SizeClassTable::standard();
        let metrics = Arc::new(HeapMetrics::new());
        let log = Arc::new(HeapLog::new(config.log_level, config.log_capacity));
        let pages = PageHeap::new(&config, os, Arc::clone(&metrics), Arc::clone(&log))?;
        let central = (0..classes.len())
            .map(|i| CentralFreeList::new(ClassId(i as u8)))
            .collect();
        Ok(Self {
            config,
            classes,
            pages,
            central,
            collector,
            sweepgen: AtomicU32::new(0),
            gen_lock: Mutex::new(()),
            metrics,
            log,
        })
    }

    /// A fresh cache for the calling thread.
    #[must_use]
    pub fn thread_cache(&self) -> ThreadCache<'_> {
        ThreadCache::new(self)
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub fn size_classes(&self) -> &'static SizeClassTable {
        self.classes
    }

    #[must_use]
    pub fn collector(&self) -> &Arc<dyn Collector> {
        &self.collector
    }

    pub(crate) fn central(&self, class: ClassId) -> &CentralFreeList {
        &self.central[class.index()]
    }

    /// Allocates a standalone span for an object above the small-object
    /// ceiling.
    pub(crate) fn alloc_large(&self, size: usize, flags: AllocFlags) -> Result<Allocation, HeapError> {
        if size.checked_add(PAGE_SIZE).is_none() {
            return Err(HeapError::OutOfMemory { requested: size });
        }
        let npages = size.div_ceil(PAGE_SIZE);
        let bytes = npages * PAGE_SIZE;
        if bytes > self.config.arena_bytes {
            return Err(HeapError::OutOfMemory { requested: size });
        }
        let span = self
            .pages
            .alloc_span(
                npages,
                SpanKind::Large,
                bytes,
                SpanState::StandaloneLarge,
                self.sweep_generation(),
            )
            .inspect_err(|e| {
                self.pages.record(
                    LogEvent::new(HeapLogLevel::Warn, "alloc_large", "large_alloc_failed", "oom")
                        .size(size)
                        .details(e.to_string()),
                );
            })?;
        let needs_zero = span.body().as_ref().is_some_and(|b| b.needs_zero());
        if needs_zero && flags.zeroed {
            self.pages.os().zero(span.base, bytes);
        }
        HeapMetrics::add(&self.metrics.heap_live, bytes as u64);
        self.pages.record(
            LogEvent::new(HeapLogLevel::Debug, "alloc_large", "large_alloc", "ok")
                .span(span.id.0)
                .addr(span.base)
                .pages(npages)
                .size(size),
        );
        Ok(Allocation {
            addr: span.base,
            size: bytes,
            heavy: true,
        })
    }

    /// Decommits free page runs. Returns the number of pages released.
    pub fn scavenge(&self) -> usize {
        self.pages.scavenge()
    }

    /// In-use span by id.
    #[must_use]
    pub fn span(&self, id: SpanId) -> Option<Arc<Span>> {
        self.pages.table().get(id)
    }

    /// In-use span containing `addr`.
    #[must_use]
    pub fn span_of(&self, addr: usize) -> Option<Arc<Span>> {
        let page = self.pages.layout().arena_page(addr)?;
        let id = self.pages.table().lookup_page(page)?;
        self.span(id)
    }

    /// Every in-use span, by id.
    #[must_use]
    pub fn spans(&self) -> Vec<Arc<Span>> {
        self.pages.table().all()
    }

    /// Address returned for every zero-byte allocation.
    #[must_use]
    pub fn zero_base(&self) -> usize {
        self.pages.layout().zero_base
    }

    #[must_use]
    pub fn layout(&self) -> ArenaLayout {
        *self.pages.layout()
    }

    /// OS page size the heap validated at startup.
    #[must_use]
    pub fn physical_page_size(&self) -> usize {
        self.pages.physical_page_size()
    }

    #[must_use]
    pub fn arena_bounds(&self) -> ArenaBounds {
        self.pages.bounds()
    }

    /// Free runs as `(start address, run)`, in address order.
    #[must_use]
    pub fn free_runs(&self) -> Vec<(usize, FreeRun)> {
        self.pages.free_runs()
    }

    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.pages.free_pages()
    }

    #[must_use]
    pub fn class_stats(&self) -> Vec<ClassStats> {
        self.central
            .iter()
            .skip(1)
            .map(|c| {
                let s = c.stats();
                ClassStats {
                    class: c.class(),
                    object_size: self.classes.object_size(c.class()),
                    nmalloc: s.nmalloc,
                    nfree: s.nfree,
                    nonempty_spans: s.nonempty_spans,
                    empty_spans: s.empty_spans,
                }
            })
            .collect()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn log_records(&self) -> Vec<HeapLogRecord> {
        self.log.records()
    }

    pub fn drain_log(&self) -> Vec<HeapLogRecord> {
        self.log.drain()
    }

    #[cold]
    pub(crate) fn fatal(&self, violation: InvariantViolation) -> ! {
        self.pages.fatal(violation)
    }

    /// Cross-checks spans, central queues, free runs and arena bounds.
    ///
    /// Meant for quiescent heaps: spans moving between owners while this
    /// runs can be reported as violations.
    pub fn check_invariants(&self) -> Result<HeapCensus, InvariantViolation> {
        let table = self.pages.table();
        let layout = self.pages.layout();
        let b = self.pages.bounds();
        if !(b.arena_start <= b.arena_alloc
            && b.arena_alloc <= b.arena_used
            && b.arena_alloc <= b.arena_end
            && b.arena_end <= b.arena_limit)
        {
            return Err(InvariantViolation::ArenaState {
                detail: format!("bounds out of order: {b:?}"),
            });
        }

        let mut census = HeapCensus::default();
        let mut queued: HashMap<SpanId, &'static str> = HashMap::new();
        for central in self.central.iter().skip(1) {
            let (nonempty, empty) = central.queue_ids(table);
            census.nonempty_spans += nonempty.len();
            census.empty_spans += empty.len();
            let queues = [
                (nonempty, "nonempty", SpanState::InCentralNonempty),
                (empty, "empty", SpanState::InCentralEmpty),
            ];
            for (ids, queue, want) in queues {
                for id in ids {
                    if let Some(prev) = queued.insert(id, queue) {
                        return Err(InvariantViolation::DoubleOwner {
                            span: id.0,
                            detail: format!("listed in the {prev} and {queue} queues"),
                        });
                    }
                    let span = table
                        .get(id)
                        .ok_or(InvariantViolation::UnknownSpan { span: id.0 })?;
                    if span.state() != want {
                        return Err(InvariantViolation::UnexpectedState {
                            span: id.0,
                            state: span.state(),
                            expected: queue,
                        });
                    }
                    if span.class() != Some(central.class()) {
                        return Err(InvariantViolation::BadGeometry {
                            span: id.0,
                            detail: format!("queued on class {} list", central.class().0),
                        });
                    }
                    let Some(count) = span.alloc_count() else {
                        return Err(InvariantViolation::DoubleOwner {
                            span: id.0,
                            detail: "queued while its body is in a cache".into(),
                        });
                    };
                    if count > span.nelems {
                        return Err(InvariantViolation::AllocCountOverflow {
                            span: id.0,
                            alloc_count: count,
                            nelems: span.nelems,
                        });
                    }
                    if want == SpanState::InCentralNonempty && count == span.nelems {
                        return Err(InvariantViolation::BadGeometry {
                            span: id.0,
                            detail: "full span in the nonempty queue".into(),
                        });
                    }
                    census.live_objects += count;
                    census.live_small_bytes += count * span.elem_size;
                }
            }
        }

        let large: HashSet<SpanId> = self.pages.large_spans().into_iter().collect();
        let mut extents: Vec<(usize, usize, Option<u32>)> = Vec::new();
        for span in table.all() {
            census.spans += 1;
            let id = span.id.0;
            let geometry = |detail: String| InvariantViolation::BadGeometry { span: id, detail };
            if span.base != layout.arena_start + span.id.page() * PAGE_SIZE {
                return Err(geometry(format!("base {:#x} does not match its page", span.base)));
            }
            if span.limit() > b.arena_used {
                return Err(geometry("extends past the used arena".into()));
            }
            extents.push((span.base, span.limit(), Some(id)));
            match span.kind {
                SpanKind::Small(class) => {
                    census.small_spans += 1;
                    let c = self.classes.class(class);
                    if span.npages != c.span_pages
                        || span.elem_size != c.object_size
                        || span.nelems != span.npages * PAGE_SIZE / span.elem_size
                    {
                        return Err(geometry(format!("does not match class {}", class.0)));
                    }
                    match span.state() {
                        SpanState::InCentralNonempty | SpanState::InCentralEmpty => {
                            if !queued.contains_key(&span.id) {
                                return Err(InvariantViolation::UnexpectedState {
                                    span: id,
                                    state: span.state(),
                                    expected: "to be listed in its central queue",
                                });
                            }
                        }
                        SpanState::CheckedOutToCache => {
                            if queued.contains_key(&span.id) {
                                return Err(InvariantViolation::DoubleOwner {
                                    span: id,
                                    detail: "cached and queued".into(),
                                });
                            }
                            if span.alloc_count().is_some() {
                                return Err(InvariantViolation::DoubleOwner {
                                    span: id,
                                    detail: "cached but its body is home".into(),
                                });
                            }
                            census.cached_spans += 1;
                        }
                        state => {
                            return Err(InvariantViolation::UnexpectedState {
                                span: id,
                                state,
                                expected: "a central queue or a thread cache",
                            });
                        }
                    }
                }
                SpanKind::Large => {
                    census.large_spans += 1;
                    census.large_bytes += span.npages * PAGE_SIZE;
                    if span.state() != SpanState::StandaloneLarge {
                        return Err(InvariantViolation::UnexpectedState {
                            span: id,
                            state: span.state(),
                            expected: "StandaloneLarge",
                        });
                    }
                    if !large.contains(&span.id) || span.alloc_count() != Some(1) {
                        return Err(geometry("large span not registered with one object".into()));
                    }
                }
            }
        }
        if large.len() != census.large_spans {
            return Err(InvariantViolation::ArenaState {
                detail: format!(
                    "{} large spans registered, {} in use",
                    large.len(),
                    census.large_spans
                ),
            });
        }

        let runs = self.pages.free_runs();
        census.free_runs = runs.len();
        for &(start, run) in &runs {
            census.free_pages += run.pages;
            extents.push((start, start + run.pages * PAGE_SIZE, None));
        }
        extents.sort_unstable();
        for pair in extents.windows(2) {
            let (_, end, a) = pair[0];
            let (start, _, c) = pair[1];
            if start < end {
                return Err(InvariantViolation::ArenaState {
                    detail: format!("extent at {start:#x} overlaps one ending at {end:#x}"),
                });
            }
            if start == end && a.is_none() && c.is_none() {
                return Err(InvariantViolation::ArenaState {
                    detail: format!("adjacent free runs at {start:#x} were not coalesced"),
                });
            }
        }
        Ok(census)
    }
}
