//! Page heap: the arena, its growth, and free page runs.
//!
//! At startup one reservation is split into four contiguous regions:
//!
//! ```text
//! | zero page | span index | collector bitmap | arena ... |
//! ```
//!
//! The span index holds one word per arena page and the bitmap 2 bits per
//! arena word, both sized for the whole logical arena so any arena address
//! maps to its metadata by subtraction and division. Only the prefix of each
//! metadata region covering the used arena is committed.
//!
//! Arena growth takes the `growth` lock (growers only); free-run bookkeeping
//! takes the short `inner` lock, which is never held across an OS call.

use std::collections::{BTreeMap, BTreeSet};
use std::mem::size_of;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::HeapConfig;
use crate::error::{HeapError, InvariantViolation, fatal};
use crate::log::{HeapLog, HeapLogLevel, LogEvent};
use crate::metrics::HeapMetrics;
use crate::os::{PageSource, Reservation};
use crate::span::{Span, SpanBody, SpanId, SpanKind, SpanState, SpanTable};
use crate::{PAGE_SIZE, align_up};

/// Static address arithmetic of the reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLayout {
    pub reservation_start: usize,
    pub reservation_size: usize,
    /// Never committed; returned for zero-byte allocations.
    pub zero_base: usize,
    pub spans_start: usize,
    pub spans_bytes: usize,
    pub bitmap_start: usize,
    pub bitmap_bytes: usize,
    pub arena_start: usize,
    /// Logical ceiling: `arena_start + arena_bytes`.
    pub arena_limit: usize,
}

impl ArenaLayout {
    /// Arena page index of `addr`.
    #[must_use]
    pub fn arena_page(&self, addr: usize) -> Option<usize> {
        (self.arena_start..self.arena_limit)
            .contains(&addr)
            .then(|| (addr - self.arena_start) / PAGE_SIZE)
    }

    /// Address of the span-index word describing the page holding `addr`.
    #[must_use]
    pub fn span_slot_addr(&self, addr: usize) -> Option<usize> {
        self.arena_page(addr)
            .map(|page| self.spans_start + page * size_of::<usize>())
    }

    /// Byte and bit shift of the collector bitmap entry for the word at `addr`.
    #[must_use]
    pub fn bitmap_addr(&self, addr: usize) -> Option<(usize, u32)> {
        if !(self.arena_start..self.arena_limit).contains(&addr) {
            return None;
        }
        let word = (addr - self.arena_start) / size_of::<usize>();
        Some((self.bitmap_start + word / 4, (word % 4) as u32 * 2))
    }
}

/// Moving arena boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaBounds {
    pub arena_start: usize,
    /// Next byte the page heap may take from the current reservation.
    pub arena_alloc: usize,
    /// Highest byte ever handed to the page heap.
    pub arena_used: usize,
    /// End of the current arena reservation.
    pub arena_end: usize,
    pub arena_limit: usize,
}

#[derive(Debug, Clone, Copy)]
struct Growth {
    bounds: ArenaBounds,
    reserved: bool,
    spans_mapped: usize,
    bitmap_mapped: usize,
}

/// A maximal run of free pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRun {
    pub pages: usize,
    /// Some pages may have been decommitted by the scavenger.
    pub released: bool,
    /// Some pages may hold stale data.
    pub needs_zero: bool,
}

/// Free runs indexed by start page and by (length, start) for best fit.
#[derive(Debug, Default)]
struct FreeRuns {
    by_addr: BTreeMap<usize, FreeRun>,
    by_size: BTreeSet<(usize, usize)>,
}

impl FreeRuns {
    fn remove(&mut self, start: usize) -> Option<FreeRun> {
        let run = self.by_addr.remove(&start)?;
        self.by_size.remove(&(run.pages, start));
        Some(run)
    }

    fn put(&mut self, start: usize, run: FreeRun) {
        self.by_size.insert((run.pages, start));
        self.by_addr.insert(start, run);
    }

    /// Inserts a run, merging it with free neighbors on both sides.
    fn insert(&mut self, mut start: usize, mut run: FreeRun) {
        let before = self
            .by_addr
            .range(..start)
            .next_back()
            .map(|(&s, &r)| (s, r))
            .filter(|&(s, prev)| s + prev.pages == start);
        if let Some((s, prev)) = before {
            self.remove(s);
            start = s;
            run = FreeRun {
                pages: prev.pages + run.pages,
                released: prev.released || run.released,
                needs_zero: prev.needs_zero || run.needs_zero,
            };
        }
        let after = start + run.pages;
        if let Some(next) = self.remove(after) {
            run = FreeRun {
                pages: run.pages + next.pages,
                released: run.released || next.released,
                needs_zero: run.needs_zero || next.needs_zero,
            };
        }
        self.put(start, run);
    }

    /// Best fit, lowest address among equals. The remainder stays free.
    fn take(&mut self, pages: usize) -> Option<(usize, FreeRun)> {
        let &(_, start) = self.by_size.range((pages, 0)..).next()?;
        let run = self.remove(start)?;
        if run.pages > pages {
            self.put(
                start + pages,
                FreeRun {
                    pages: run.pages - pages,
                    ..run
                },
            );
        }
        Some((start, FreeRun { pages, ..run }))
    }

    fn total_pages(&self) -> usize {
        self.by_addr.values().map(|r| r.pages).sum()
    }
}

#[derive(Debug, Default)]
struct Inner {
    runs: FreeRuns,
    large: BTreeSet<SpanId>,
}

#[cold]
fn bad_page_size(log: &HeapLog, size: usize, reason: &'static str) -> ! {
    log.record(
        LogEvent::new(HeapLogLevel::Error, "reserve", "bad_page_size", "abort")
            .size(size)
            .details(reason),
        0,
        0,
    );
    fatal(InvariantViolation::BadPageSize { size, reason })
}

/// The arena and its page allocator.
pub struct PageHeap {
    config: HeapConfig,
    os: Arc<dyn PageSource>,
    phys_page: usize,
    layout: ArenaLayout,
    growth: Mutex<Growth>,
    inner: Mutex<Inner>,
    table: SpanTable,
    metrics: Arc<HeapMetrics>,
    log: Arc<HeapLog>,
}

impl PageHeap {
    /// Validates the OS page size and reserves the arena.
    pub fn new(
        config: &HeapConfig,
        os: Arc<dyn PageSource>,
        metrics: Arc<HeapMetrics>,
        log: Arc<HeapLog>,
    ) -> Result<Self, HeapError> {
        let phys = os.physical_page_size();
        if !phys.is_power_of_two() {
            bad_page_size(&log, phys, "not a power of two");
        }
        if phys < config.min_phys_page_size {
            bad_page_size(&log, phys, "below the configured minimum");
        }
        if PAGE_SIZE % phys != 0 {
            bad_page_size(&log, phys, "heap page is not a multiple of it");
        }

        let spans_bytes = align_up(config.spans_bytes(), PAGE_SIZE);
        let bitmap_bytes = align_up(config.bitmap_bytes(), PAGE_SIZE);
        let meta = PAGE_SIZE + spans_bytes + bitmap_bytes;

        let mut reservation = None;
        let mut arena_size = config.initial_reservation;
        let mut first = true;
        while arena_size >= config.min_reservation {
            let total = PAGE_SIZE + meta + arena_size;
            if first && config.address_hints {
                reservation = (0..config.hint_attempts)
                    .map(|i| (i << 40) | config.hint_base)
                    .find_map(|hint| os.reserve(Some(hint), total));
            }
            if reservation.is_none() {
                reservation = os.reserve(None, total);
            }
            if reservation.is_some() {
                break;
            }
            first = false;
            arena_size = align_up(arena_size / 2, PAGE_SIZE);
        }
        let Some(r) = reservation else {
            let size = PAGE_SIZE + meta + config.min_reservation;
            log.record(
                LogEvent::new(HeapLogLevel::Error, "reserve", "arena_reserve_failed", "oom")
                    .size(size),
                0,
                0,
            );
            return Err(HeapError::ReservationFailed { size });
        };
        if r.addr % phys != 0 {
            fatal(InvariantViolation::Misaligned {
                addr: r.addr,
                align: phys,
                context: "arena reservation",
            });
        }

        let p = align_up(r.addr, PAGE_SIZE);
        let spans_start = p + PAGE_SIZE;
        let bitmap_start = spans_start + spans_bytes;
        let arena_start = bitmap_start + bitmap_bytes;
        let arena_limit = arena_start + config.arena_bytes;
        let layout = ArenaLayout {
            reservation_start: r.addr,
            reservation_size: r.size,
            zero_base: p,
            spans_start,
            spans_bytes,
            bitmap_start,
            bitmap_bytes,
            arena_start,
            arena_limit,
        };
        let growth = Growth {
            bounds: ArenaBounds {
                arena_start,
                arena_alloc: arena_start,
                arena_used: arena_start,
                arena_end: r.end().min(arena_limit),
                arena_limit,
            },
            reserved: r.reserved,
            spans_mapped: spans_start,
            bitmap_mapped: bitmap_start,
        };
        log.record(
            LogEvent::new(HeapLogLevel::Info, "reserve", "arena_reserved", "ok")
                .addr(r.addr)
                .size(r.size)
                .details(format!(
                    "arena {arena_start:#x}..{:#x} of limit {arena_limit:#x}",
                    growth.bounds.arena_end
                )),
            0,
            0,
        );

        Ok(Self {
            config: config.clone(),
            os,
            phys_page: phys,
            layout,
            growth: Mutex::new(growth),
            inner: Mutex::new(Inner::default()),
            table: SpanTable::new(config.arena_bytes / PAGE_SIZE),
            metrics,
            log,
        })
    }

    #[must_use]
    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    #[must_use]
    pub fn table(&self) -> &SpanTable {
        &self.table
    }

    #[must_use]
    pub fn physical_page_size(&self) -> usize {
        self.phys_page
    }

    #[must_use]
    pub fn bounds(&self) -> ArenaBounds {
        self.growth.lock().bounds
    }

    pub(crate) fn os(&self) -> &dyn PageSource {
        self.os.as_ref()
    }

    pub(crate) fn record(&self, event: LogEvent) {
        self.log.record(
            event,
            HeapMetrics::get(&self.metrics.heap_live),
            HeapMetrics::get(&self.metrics.mapped_bytes),
        );
    }

    /// Logs a broken invariant and terminates.
    #[cold]
    pub(crate) fn fatal(&self, violation: InvariantViolation) -> ! {
        self.record(
            LogEvent::new(HeapLogLevel::Error, "fatal", "invariant_violation", "abort")
                .details(violation.to_string()),
        );
        fatal(violation)
    }

    fn check_aligned(&self, addr: usize, context: &'static str) {
        if addr % self.phys_page != 0 {
            self.fatal(InvariantViolation::Misaligned {
                addr,
                align: self.phys_page,
                context,
            });
        }
    }

    /// Commits the metadata prefix covering the arena up to `used`.
    fn map_metadata(&self, g: &mut Growth, used: usize) -> Result<u64, HeapError> {
        let pages = (used - self.layout.arena_start) / PAGE_SIZE;
        let spans_end = align_up(
            self.layout.spans_start + pages * size_of::<usize>(),
            self.phys_page,
        );
        let bitmap_end = align_up(
            self.layout.bitmap_start + (used - self.layout.arena_start) / (size_of::<usize>() * 4),
            self.phys_page,
        );
        let mut mapped = 0u64;
        if spans_end > g.spans_mapped {
            let size = spans_end - g.spans_mapped;
            self.os
                .commit(g.spans_mapped, size, true)
                .map_err(|_| HeapError::CommitFailed {
                    addr: g.spans_mapped,
                    size,
                })?;
            mapped += size as u64;
        }
        if bitmap_end > g.bitmap_mapped {
            let size = bitmap_end - g.bitmap_mapped;
            if self.os.commit(g.bitmap_mapped, size, true).is_err() {
                if spans_end > g.spans_mapped {
                    self.os.decommit(g.spans_mapped, spans_end - g.spans_mapped);
                }
                return Err(HeapError::CommitFailed {
                    addr: g.bitmap_mapped,
                    size,
                });
            }
            mapped += size as u64;
        }
        g.spans_mapped = g.spans_mapped.max(spans_end);
        g.bitmap_mapped = g.bitmap_mapped.max(bitmap_end);
        Ok(mapped)
    }

    /// Takes `n` committed bytes from the arena, reserving more address
    /// space if the current reservation is exhausted. `g` is only updated
    /// on success.
    fn sys_alloc(&self, g: &mut Growth, n: usize) -> Result<usize, HeapError> {
        let mut next = *g;
        let mut fresh = None;
        let mut stranded = 0;
        let b = &mut next.bounds;

        if n > b.arena_end - b.arena_alloc {
            let rounded = (n + PAGE_SIZE).next_multiple_of(self.config.growth_reservation);
            let mut sizes = vec![rounded, align_up(n, PAGE_SIZE)];
            sizes.dedup();
            for p_size in sizes {
                if b.arena_end.saturating_add(p_size) > b.arena_limit {
                    continue;
                }
                let Some(r) = self.os.reserve(Some(b.arena_end), p_size) else {
                    continue;
                };
                self.check_aligned(r.addr, "arena growth reservation");
                if r.addr == b.arena_end {
                    b.arena_end = r.end();
                    next.reserved = r.reserved;
                    fresh = Some(r);
                    break;
                }
                let in_arena = r.addr >= b.arena_start && r.end() <= b.arena_limit;
                let tail = b.arena_end - b.arena_alloc;
                let start = align_up(r.addr, PAGE_SIZE);
                let usable = r.end().saturating_sub(start);
                if in_arena && tail < self.config.strand_limit && usable >= n {
                    stranded = tail;
                    b.arena_end = r.end();
                    b.arena_alloc = start;
                    next.reserved = r.reserved;
                    fresh = Some(r);
                    break;
                }
                self.record(
                    LogEvent::new(
                        HeapLogLevel::Warn,
                        "sys_alloc",
                        "reservation_released",
                        "non_contiguous",
                    )
                    .addr(r.addr)
                    .size(r.size)
                    .details(format!(
                        "wanted {:#x}, in_arena={in_arena}, would strand {tail} bytes, {usable} usable",
                        b.arena_end
                    )),
                );
                self.os.release(r.addr, r.size);
            }
        }
        let rollback = |fresh: Option<Reservation>| {
            if let Some(r) = fresh {
                self.os.release(r.addr, r.size);
            }
        };
        if n > b.arena_end - b.arena_alloc {
            rollback(fresh);
            return Err(HeapError::AddressSpaceExhausted { requested: n });
        }

        let p = b.arena_alloc;
        if p % PAGE_SIZE != 0 {
            self.fatal(InvariantViolation::Misaligned {
                addr: p,
                align: PAGE_SIZE,
                context: "arena allocation",
            });
        }
        if self.os.commit(p, n, next.reserved).is_err() {
            rollback(fresh);
            self.record(
                LogEvent::new(HeapLogLevel::Warn, "sys_alloc", "commit_failed", "rolled_back")
                    .addr(p)
                    .size(n),
            );
            return Err(HeapError::CommitFailed { addr: p, size: n });
        }
        next.bounds.arena_alloc += n;
        let used = next.bounds.arena_used.max(next.bounds.arena_alloc);
        let meta = match self.map_metadata(&mut next, used) {
            Ok(meta) => meta,
            Err(e) => {
                self.os.decommit(p, n);
                rollback(fresh);
                self.record(
                    LogEvent::new(HeapLogLevel::Warn, "sys_alloc", "metadata_commit_failed", "rolled_back")
                        .addr(p)
                        .size(n),
                );
                return Err(e);
            }
        };
        next.bounds.arena_used = used;
        *g = next;

        HeapMetrics::add(&self.metrics.mapped_bytes, n as u64 + meta);
        if stranded > 0 {
            HeapMetrics::add(&self.metrics.stranded_bytes, stranded as u64);
            self.record(
                LogEvent::new(HeapLogLevel::Warn, "sys_alloc", "stranded", "accepted")
                    .addr(g.bounds.arena_alloc - n)
                    .size(stranded),
            );
        }
        Ok(p)
    }

    /// Adds at least `npages` to the free runs: one heap chunk if possible,
    /// otherwise exactly what was asked.
    fn grow(&self, g: &mut Growth, npages: usize) -> Result<(), HeapError> {
        let exact = npages * PAGE_SIZE;
        let mut ask = exact.next_multiple_of(self.config.heap_chunk);
        let mut result = self.sys_alloc(g, ask);
        if result.is_err() && ask > exact {
            ask = exact;
            result = self.sys_alloc(g, ask);
        }
        let addr = result.map_err(|e| self.growth_failed(npages, e))?;
        let start = (addr - self.layout.arena_start) / PAGE_SIZE;
        self.inner.lock().runs.insert(
            start,
            FreeRun {
                pages: ask / PAGE_SIZE,
                released: false,
                needs_zero: false,
            },
        );
        HeapMetrics::inc(&self.metrics.arena_growths);
        self.record(
            LogEvent::new(HeapLogLevel::Debug, "grow", "arena_growth", "ok")
                .addr(addr)
                .pages(ask / PAGE_SIZE),
        );
        Ok(())
    }

    fn growth_failed(&self, npages: usize, err: HeapError) -> HeapError {
        HeapMetrics::inc(&self.metrics.arena_growth_failures);
        self.record(
            LogEvent::new(HeapLogLevel::Warn, "grow", "arena_growth_failed", "oom")
                .pages(npages)
                .details(err.to_string()),
        );
        err
    }

    /// Allocates a span of `npages`, growing the arena if no free run fits.
    pub(crate) fn alloc_span(
        &self,
        npages: usize,
        kind: SpanKind,
        elem_size: usize,
        state: SpanState,
        sweepgen: u32,
    ) -> Result<Arc<Span>, HeapError> {
        let (start, run) = loop {
            if let Some(hit) = self.inner.lock().runs.take(npages) {
                break hit;
            }
            let mut g = self.growth.lock();
            if let Some(hit) = self.inner.lock().runs.take(npages) {
                break hit;
            }
            self.grow(&mut g, npages)?;
        };
        let base = self.layout.arena_start + start * PAGE_SIZE;
        let bytes = npages * PAGE_SIZE;
        if run.released {
            if self.os.commit(base, bytes, true).is_err() {
                self.inner.lock().runs.insert(start, run);
                self.record(
                    LogEvent::new(HeapLogLevel::Warn, "alloc_span", "recommit_failed", "oom")
                        .addr(base)
                        .pages(npages),
                );
                return Err(HeapError::CommitFailed { addr: base, size: bytes });
            }
            HeapMetrics::add(&self.metrics.mapped_bytes, bytes as u64);
        }

        let body = match kind {
            SpanKind::Small(_) => SpanBody::fresh(bytes / elem_size, run.needs_zero),
            SpanKind::Large => SpanBody::large(run.needs_zero),
        };
        let id = SpanId(start as u32);
        let span = Arc::new(Span::new(
            id, base, npages, kind, elem_size, body, state, sweepgen,
        ));
        self.table.insert(Arc::clone(&span));
        if kind == SpanKind::Large {
            self.inner.lock().large.insert(id);
        }
        Ok(span)
    }

    /// Returns a span's pages to the free runs, coalescing with neighbors.
    pub(crate) fn free_span(&self, span: &Span) {
        if self.table.remove(span.id).is_none() {
            self.fatal(InvariantViolation::UnknownSpan { span: span.id.0 });
        }
        span.set_state(SpanState::Free);
        {
            let mut inner = self.inner.lock();
            inner.large.remove(&span.id);
            inner.runs.insert(
                span.id.page(),
                FreeRun {
                    pages: span.npages,
                    released: false,
                    needs_zero: true,
                },
            );
        }
        HeapMetrics::inc(&self.metrics.spans_released);
        self.record(
            LogEvent::new(HeapLogLevel::Trace, "free_span", "span_returned", "ok")
                .span(span.id.0)
                .pages(span.npages),
        );
    }

    /// Decommits every free run that is still backed by memory. Returns the
    /// number of pages released.
    pub fn scavenge(&self) -> usize {
        let victims: Vec<(usize, FreeRun)> = {
            let mut inner = self.inner.lock();
            let starts: Vec<usize> = inner
                .runs
                .by_addr
                .iter()
                .filter(|(_, r)| !r.released)
                .map(|(&s, _)| s)
                .collect();
            starts
                .into_iter()
                .filter_map(|s| inner.runs.remove(s).map(|r| (s, r)))
                .collect()
        };
        let mut pages = 0;
        for &(start, run) in &victims {
            self.os.decommit(
                self.layout.arena_start + start * PAGE_SIZE,
                run.pages * PAGE_SIZE,
            );
            pages += run.pages;
        }
        {
            let mut inner = self.inner.lock();
            for (start, run) in victims {
                inner.runs.insert(
                    start,
                    FreeRun {
                        released: true,
                        ..run
                    },
                );
            }
        }
        if pages > 0 {
            HeapMetrics::add(&self.metrics.scavenged_pages, pages as u64);
            HeapMetrics::sub(&self.metrics.mapped_bytes, (pages * PAGE_SIZE) as u64);
            self.record(
                LogEvent::new(HeapLogLevel::Info, "scavenge", "pages_released", "ok").pages(pages),
            );
        }
        pages
    }

    /// Free runs as `(start address, pages)`, in address order.
    #[must_use]
    pub fn free_runs(&self) -> Vec<(usize, FreeRun)> {
        self.inner
            .lock()
            .runs
            .by_addr
            .iter()
            .map(|(&s, &r)| (self.layout.arena_start + s * PAGE_SIZE, r))
            .collect()
    }

    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.inner.lock().runs.total_pages()
    }

    /// Large spans currently handed out.
    #[must_use]
    pub fn large_spans(&self) -> Vec<SpanId> {
        self.inner.lock().large.iter().copied().collect()
    }
}
