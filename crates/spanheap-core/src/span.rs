//! Spans and the span table.
//!
//! A span is a run of heap pages carved into equal slots of one size class,
//! or holding a single large object. Its geometry is immutable. Its mutable
//! allocation state (bitmap, cursor, count) lives in a [`SpanBody`] that is
//! physically moved into a thread cache on checkout and back on uncache, so
//! a cached span's slots cannot be touched by anyone else.
//!
//! Spans live in a [`SpanTable`] keyed by start page. Central-list queue
//! links are span ids stored in the span itself and are only written under
//! the owning central list's lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::PAGE_SIZE;
use crate::collector::LiveMap;
use crate::size_class::ClassId;

/// Sentinel for an absent queue link.
pub(crate) const NIL: u32 = u32::MAX;

/// Start page of a span, counted from the arena base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpanId(pub u32);

impl SpanId {
    #[must_use]
    pub const fn page(self) -> usize {
        self.0 as usize
    }
}

/// What a span holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Small(ClassId),
    Large,
}

/// Current owner of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpanState {
    /// Owned by the page heap; not in the span table.
    Free = 0,
    InCentralNonempty = 1,
    InCentralEmpty = 2,
    CheckedOutToCache = 3,
    StandaloneLarge = 4,
}

impl SpanState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::InCentralNonempty,
            2 => Self::InCentralEmpty,
            3 => Self::CheckedOutToCache,
            4 => Self::StandaloneLarge,
            _ => Self::Free,
        }
    }
}

/// Mutable allocation state of a span.
///
/// Slot `i` is allocated iff `i < free_index` or bit `i` of `alloc_bits` is
/// set. `alloc_cache` holds the complement of the 64-bit `alloc_bits` word
/// containing `free_index`, shifted so bit 0 is slot `free_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanBody {
    pub(crate) alloc_bits: Vec<u64>,
    pub(crate) free_index: usize,
    pub(crate) alloc_cache: u64,
    pub(crate) alloc_count: usize,
    pub(crate) needs_zero: bool,
}

impl SpanBody {
    /// Every slot free.
    #[must_use]
    pub fn fresh(nelems: usize, needs_zero: bool) -> Self {
        Self {
            alloc_bits: vec![0; nelems.div_ceil(64)],
            free_index: 0,
            alloc_cache: !0,
            alloc_count: 0,
            needs_zero,
        }
    }

    /// A large span's single slot, already handed out.
    #[must_use]
    pub fn large(needs_zero: bool) -> Self {
        Self {
            alloc_bits: vec![0],
            free_index: 1,
            alloc_cache: 0,
            alloc_count: 1,
            needs_zero,
        }
    }

    #[must_use]
    pub fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    #[must_use]
    pub fn free_index(&self) -> usize {
        self.free_index
    }

    #[must_use]
    pub fn needs_zero(&self) -> bool {
        self.needs_zero
    }

    /// Loads the complement of `alloc_bits[word]` into the cache.
    pub(crate) fn refill_alloc_cache(&mut self, word: usize) {
        self.alloc_cache = !self.alloc_bits.get(word).copied().unwrap_or(0);
    }

    /// Re-aligns the cache with `free_index` after the body changes hands.
    pub(crate) fn prime_cache(&mut self) {
        self.refill_alloc_cache(self.free_index / 64);
        self.alloc_cache = self
            .alloc_cache
            .checked_shr((self.free_index % 64) as u32)
            .unwrap_or(0);
    }

    /// Fast path: the lowest set bit of the cache, if it is a slot inside
    /// the span and taking it does not cross a 64-slot window boundary.
    /// Counts the slot as allocated.
    #[inline]
    pub(crate) fn next_free_fast(&mut self, nelems: usize) -> Option<usize> {
        let bit = self.alloc_cache.trailing_zeros() as usize;
        if bit >= 64 {
            return None;
        }
        let result = self.free_index + bit;
        if result >= nelems {
            return None;
        }
        let next = result + 1;
        if next % 64 == 0 && next != nelems {
            return None;
        }
        self.alloc_cache = self.alloc_cache.checked_shr(bit as u32 + 1).unwrap_or(0);
        self.free_index = next;
        self.alloc_count += 1;
        Some(result)
    }

    /// Returns the next free slot at or after `free_index`, or `nelems` if
    /// none, advancing the cursor past it. Does not count the slot.
    pub(crate) fn next_free_index(&mut self, nelems: usize) -> usize {
        let mut idx = self.free_index;
        if idx >= nelems {
            return nelems;
        }
        let mut bit = self.alloc_cache.trailing_zeros() as usize;
        while bit == 64 {
            idx = (idx + 64) & !63;
            if idx >= nelems {
                self.free_index = nelems;
                return nelems;
            }
            self.refill_alloc_cache(idx / 64);
            bit = self.alloc_cache.trailing_zeros() as usize;
        }
        let result = idx + bit;
        if result >= nelems {
            self.free_index = nelems;
            return nelems;
        }
        self.alloc_cache = self.alloc_cache.checked_shr(bit as u32 + 1).unwrap_or(0);
        idx = result + 1;
        if idx % 64 == 0 && idx != nelems {
            self.refill_alloc_cache(idx / 64);
        }
        self.free_index = idx;
        result
    }

    #[must_use]
    pub fn is_allocated(&self, slot: usize) -> bool {
        slot < self.free_index
            || self
                .alloc_bits
                .get(slot / 64)
                .is_some_and(|w| w & (1 << (slot % 64)) != 0)
    }

    /// The allocated slots as a bit vector.
    #[must_use]
    pub fn allocated_map(&self, nelems: usize) -> LiveMap {
        let mut map = LiveMap::from_words(self.alloc_bits.clone(), nelems);
        for slot in 0..self.free_index.min(nelems) {
            map.set(slot);
        }
        map
    }

    /// Installs a post-sweep live map: live slots become the allocation
    /// bitmap and the cursor restarts at slot 0.
    pub(crate) fn reset_from_live(&mut self, live: LiveMap) {
        self.alloc_count = live.count();
        self.alloc_bits = live.into_words();
        self.free_index = 0;
        self.refill_alloc_cache(0);
    }
}

/// A span's sweep stamp read against the heap's generation `sg`.
///
/// Stamps are even once settled and odd while a sweep is in flight. A span
/// re-stamped just before the generation moved on can be more than one
/// cycle behind; it still only needs one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepStamp {
    /// Stamped `sg`.
    Swept,
    /// Claimed by a sweeper.
    Sweeping,
    /// Stamped `sg - 2` or earlier.
    Due,
}

impl SweepStamp {
    pub(crate) fn of(stamp: u32, sg: u32) -> Self {
        match sg.wrapping_sub(stamp) {
            0 => Self::Swept,
            age if age % 2 == 1 => Self::Sweeping,
            _ => Self::Due,
        }
    }
}

/// One span.
#[derive(Debug)]
pub struct Span {
    pub id: SpanId,
    pub base: usize,
    pub npages: usize,
    pub kind: SpanKind,
    pub elem_size: usize,
    pub nelems: usize,
    sweepgen: AtomicU32,
    state: AtomicU8,
    pub(crate) prev: AtomicU32,
    pub(crate) next: AtomicU32,
    body: Mutex<Option<SpanBody>>,
}

impl Span {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SpanId,
        base: usize,
        npages: usize,
        kind: SpanKind,
        elem_size: usize,
        body: SpanBody,
        state: SpanState,
        sweepgen: u32,
    ) -> Self {
        let nelems = match kind {
            SpanKind::Small(_) => npages * PAGE_SIZE / elem_size,
            SpanKind::Large => 1,
        };
        Self {
            id,
            base,
            npages,
            kind,
            elem_size,
            nelems,
            sweepgen: AtomicU32::new(sweepgen),
            state: AtomicU8::new(state as u8),
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
            body: Mutex::new(Some(body)),
        }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.base + self.npages * PAGE_SIZE
    }

    #[must_use]
    pub fn class(&self) -> Option<ClassId> {
        match self.kind {
            SpanKind::Small(c) => Some(c),
            SpanKind::Large => None,
        }
    }

    #[must_use]
    pub fn is_large(&self) -> bool {
        self.kind == SpanKind::Large
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        (self.base..self.limit()).contains(&addr)
    }

    #[must_use]
    pub fn state(&self) -> SpanState {
        SpanState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SpanState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    /// Marks the span swept in generation `sg`.
    pub(crate) fn stamp(&self, sg: u32) {
        self.sweepgen.store(sg, Ordering::Release);
    }

    /// Reads the stamp against generation `sg`.
    pub(crate) fn sweep_stamp(&self, sg: u32) -> SweepStamp {
        SweepStamp::of(self.sweepgen(), sg)
    }

    /// Claims the span for sweeping in generation `sg`: moves the stamp from
    /// "needs sweep" to "being swept". Exactly one caller wins.
    pub(crate) fn try_claim(&self, sg: u32) -> bool {
        let stamp = self.sweepgen();
        SweepStamp::of(stamp, sg) == SweepStamp::Due
            && self
                .sweepgen
                .compare_exchange(stamp, sg.wrapping_sub(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    /// Locks the body slot. `None` while the span is checked out.
    pub(crate) fn body(&self) -> MutexGuard<'_, Option<SpanBody>> {
        self.body.lock()
    }

    pub(crate) fn take_body(&self) -> Option<SpanBody> {
        self.body.lock().take()
    }

    /// Puts a body back; returns it if the slot was already occupied.
    pub(crate) fn restore_body(&self, body: SpanBody) -> Result<(), SpanBody> {
        let mut slot = self.body.lock();
        if slot.is_some() {
            return Err(body);
        }
        *slot = Some(body);
        Ok(())
    }

    /// Allocated-object count, when the body is not checked out.
    #[must_use]
    pub fn alloc_count(&self) -> Option<usize> {
        self.body.lock().as_ref().map(SpanBody::alloc_count)
    }

    /// Slots currently free, when the body is not checked out.
    #[must_use]
    pub fn free_slots(&self) -> Option<usize> {
        self.alloc_count().map(|n| self.nelems - n)
    }
}

const LEAF_BITS: usize = 16;
const LEAF_LEN: usize = 1 << LEAF_BITS;

/// In-use spans by id, plus a page → span map for address lookups.
pub struct SpanTable {
    records: RwLock<HashMap<u32, Arc<Span>>>,
    /// Start page + 1 of the span covering each page; 0 when none.
    page_map: Box<[OnceLock<Box<[AtomicU32]>>]>,
}

impl SpanTable {
    #[must_use]
    pub fn new(arena_pages: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            page_map: (0..arena_pages.div_ceil(LEAF_LEN))
                .map(|_| OnceLock::new())
                .collect(),
        }
    }

    fn leaf(&self, page: usize) -> Option<&[AtomicU32]> {
        let leaf = self
            .page_map
            .get(page >> LEAF_BITS)?
            .get_or_init(|| (0..LEAF_LEN).map(|_| AtomicU32::new(0)).collect());
        Some(leaf)
    }

    fn map_pages(&self, span: &Span, value: u32) {
        for page in span.id.page()..span.id.page() + span.npages {
            if let Some(leaf) = self.leaf(page) {
                leaf[page & (LEAF_LEN - 1)].store(value, Ordering::Release);
            }
        }
    }

    pub(crate) fn insert(&self, span: Arc<Span>) {
        self.map_pages(&span, span.id.0 + 1);
        self.records.write().insert(span.id.0, span);
    }

    pub(crate) fn remove(&self, id: SpanId) -> Option<Arc<Span>> {
        let span = self.records.write().remove(&id.0)?;
        self.map_pages(&span, 0);
        Some(span)
    }

    #[must_use]
    pub fn get(&self, id: SpanId) -> Option<Arc<Span>> {
        self.records.read().get(&id.0).cloned()
    }

    /// Span covering arena page `page`.
    #[must_use]
    pub fn lookup_page(&self, page: usize) -> Option<SpanId> {
        let leaf = self.page_map.get(page >> LEAF_BITS)?.get()?;
        match leaf[page & (LEAF_LEN - 1)].load(Ordering::Acquire) {
            0 => None,
            v => Some(SpanId(v - 1)),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Every in-use span, by id.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Span>> {
        let mut spans: Vec<_> = self.records.read().values().cloned().collect();
        spans.sort_by_key(|s| s.id);
        spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_slots(body: &mut SpanBody, nelems: usize) -> Vec<usize> {
        let mut out = Vec::new();
        loop {
            if let Some(i) = body.next_free_fast(nelems) {
                out.push(i);
                continue;
            }
            let i = body.next_free_index(nelems);
            if i == nelems {
                break;
            }
            body.alloc_count += 1;
            out.push(i);
        }
        out
    }

    #[test]
    fn fresh_body_hands_out_every_slot_in_order() {
        let nelems = 341;
        let mut body = SpanBody::fresh(nelems, false);
        let slots = drain_slots(&mut body, nelems);
        assert_eq!(slots, (0..nelems).collect::<Vec<_>>());
        assert_eq!(body.alloc_count, nelems);
        assert_eq!(body.allocated_map(nelems).count(), nelems);
    }

    #[test]
    fn fast_path_stops_at_window_boundary() {
        let mut body = SpanBody::fresh(200, false);
        for expect in 0..63 {
            assert_eq!(body.next_free_fast(200), Some(expect));
        }
        assert_eq!(body.next_free_fast(200), None);
        assert_eq!(body.next_free_index(200), 63);
        assert_eq!(body.free_index, 64);
        assert_eq!(body.next_free_fast(200), Some(64));
    }

    #[test]
    fn reset_from_live_skips_live_slots() {
        let nelems = 130;
        let mut body = SpanBody::fresh(nelems, false);
        drain_slots(&mut body, nelems);
        let mut live = LiveMap::new(nelems);
        for slot in [0, 1, 63, 64, 100, 129] {
            live.set(slot);
        }
        body.reset_from_live(live);
        assert_eq!(body.alloc_count, 6);
        let slots = drain_slots(&mut body, nelems);
        assert_eq!(slots.len(), nelems - 6);
        assert!(!slots.contains(&0));
        assert!(!slots.contains(&64));
        assert!(!slots.contains(&129));
        assert_eq!(slots[0], 2);
        assert_eq!(body.alloc_count, nelems);
    }

    #[test]
    fn allocated_map_counts_cursor_and_bits() {
        let mut body = SpanBody::fresh(10, false);
        let mut live = LiveMap::new(10);
        live.set(7);
        body.reset_from_live(live);
        assert_eq!(body.next_free_fast(10), Some(0));
        assert_eq!(body.next_free_fast(10), Some(1));
        let map = body.allocated_map(10);
        assert_eq!(map.iter_ones().collect::<Vec<_>>(), vec![0, 1, 7]);
        assert_eq!(map.count(), body.alloc_count);
        assert!(body.is_allocated(7));
        assert!(!body.is_allocated(2));
    }

    #[test]
    fn prime_cache_realigns_window() {
        let mut body = SpanBody::fresh(100, false);
        drain_slots(&mut body, 100);
        let mut live = LiveMap::full(100);
        live.clear(70);
        live.clear(90);
        body.reset_from_live(live);
        assert_eq!(body.next_free_index(100), 70);
        body.alloc_count += 1;
        body.alloc_cache = 0xdead;
        body.prime_cache();
        assert_eq!(body.next_free_index(100), 90);
    }

    #[test]
    fn large_body_is_one_allocated_slot() {
        let body = SpanBody::large(true);
        assert_eq!(body.alloc_count, 1);
        assert_eq!(body.allocated_map(1).count(), 1);
        assert!(body.needs_zero());
    }

    #[test]
    fn claim_is_exclusive() {
        let span = Span::new(
            SpanId(3),
            0x1000_0000,
            1,
            SpanKind::Small(ClassId(3)),
            24,
            SpanBody::fresh(341, false),
            SpanState::InCentralNonempty,
            0,
        );
        assert_eq!(span.nelems, 341);
        assert!(!span.try_claim(0), "already swept");
        assert!(span.try_claim(2));
        assert_eq!(span.sweepgen(), 1);
        assert!(!span.try_claim(2));
        span.stamp(2);
        assert_eq!(span.sweepgen(), 2);
        assert!(span.try_claim(0u32.wrapping_add(4)));
    }

    #[test]
    fn stamps_several_generations_behind_are_due() {
        assert_eq!(SweepStamp::of(10, 10), SweepStamp::Swept);
        assert_eq!(SweepStamp::of(9, 10), SweepStamp::Sweeping);
        assert_eq!(SweepStamp::of(7, 10), SweepStamp::Sweeping);
        assert_eq!(SweepStamp::of(8, 10), SweepStamp::Due);
        assert_eq!(SweepStamp::of(4, 10), SweepStamp::Due);
        assert_eq!(SweepStamp::of(u32::MAX - 1, 2), SweepStamp::Due);

        let span = Span::new(
            SpanId(1),
            0x2000_0000,
            1,
            SpanKind::Small(ClassId(3)),
            24,
            SpanBody::fresh(341, false),
            SpanState::InCentralEmpty,
            4,
        );
        assert!(span.try_claim(10));
        assert_eq!(span.sweepgen(), 9);
        assert_eq!(span.sweep_stamp(10), SweepStamp::Sweeping);
        assert!(!span.try_claim(10));
    }

    #[test]
    fn sweepgen_wraps() {
        let span = Span::new(
            SpanId(0),
            0,
            1,
            SpanKind::Large,
            PAGE_SIZE,
            SpanBody::large(false),
            SpanState::StandaloneLarge,
            u32::MAX - 1,
        );
        assert!(span.try_claim(0));
        assert_eq!(span.sweepgen(), u32::MAX);
    }

    #[test]
    fn body_moves_out_and_back() {
        let span = Span::new(
            SpanId(0),
            0,
            1,
            SpanKind::Small(ClassId(1)),
            8,
            SpanBody::fresh(1024, false),
            SpanState::CheckedOutToCache,
            0,
        );
        let body = span.take_body().unwrap();
        assert!(span.take_body().is_none());
        assert_eq!(span.alloc_count(), None);
        span.restore_body(body.clone()).unwrap();
        assert!(span.restore_body(body).is_err());
        assert_eq!(span.free_slots(), Some(1024));
    }

    #[test]
    fn table_maps_every_page() {
        let table = SpanTable::new(1 << 18);
        let span = Arc::new(Span::new(
            SpanId(70_000),
            70_000 * PAGE_SIZE,
            101,
            SpanKind::Large,
            101 * PAGE_SIZE,
            SpanBody::large(false),
            SpanState::StandaloneLarge,
            0,
        ));
        table.insert(span);
        assert_eq!(table.lookup_page(70_000), Some(SpanId(70_000)));
        assert_eq!(table.lookup_page(70_100), Some(SpanId(70_000)));
        assert_eq!(table.lookup_page(70_101), None);
        assert_eq!(table.len(), 1);
        assert!(table.remove(SpanId(70_000)).is_some());
        assert_eq!(table.lookup_page(70_050), None);
        assert!(table.is_empty());
    }
}
