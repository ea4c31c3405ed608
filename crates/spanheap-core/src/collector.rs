//! Collector interface.
//!
//! The heap never decides whether an object is reachable. When a span is
//! swept it hands the collector a [`SweepView`] of the allocated slots and
//! gets back a [`LiveMap`]; every allocated slot missing from that map is
//! reclaimed. While the collector reports that it is marking, each new
//! object is announced through [`Collector::object_allocated`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::span::SpanId;

/// Fixed-length bit vector indexed by object slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiveMap {
    words: Vec<u64>,
    len: usize,
}

impl LiveMap {
    /// All bits clear.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// All `len` bits set.
    #[must_use]
    pub fn full(len: usize) -> Self {
        let mut map = Self::new(len);
        for i in 0..len {
            map.set(i);
        }
        map
    }

    pub(crate) fn from_words(words: Vec<u64>, len: usize) -> Self {
        let mut map = Self { words, len };
        map.words.resize(len.div_ceil(64), 0);
        map.clear_tail();
        map
    }

    fn clear_tail(&mut self) {
        let rem = self.len % 64;
        if rem == 0 {
            return;
        }
        if let Some(last) = self.words.last_mut() {
            *last &= (1u64 << rem) - 1;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn get(&self, i: usize) -> bool {
        i < self.len && self.words[i / 64] & (1 << (i % 64)) != 0
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        if i < self.len {
            self.words[i / 64] |= 1 << (i % 64);
        }
    }

    #[inline]
    pub fn clear(&mut self, i: usize) {
        if i < self.len {
            self.words[i / 64] &= !(1 << (i % 64));
        }
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Keeps only bits also set in `other`.
    pub fn intersect(&mut self, other: &LiveMap) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    /// Indices of set bits, ascending.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.get(i))
    }

    pub(crate) fn words(&self) -> &[u64] {
        &self.words
    }

    pub(crate) fn into_words(self) -> Vec<u64> {
        self.words
    }
}

/// A span as presented to the collector during a sweep.
#[derive(Debug, Clone, Copy)]
pub struct SweepView<'a> {
    pub span: SpanId,
    pub base: usize,
    pub elem_size: usize,
    pub nelems: usize,
    pub large: bool,
    /// Slots holding an object when the sweep started.
    pub allocated: &'a LiveMap,
}

impl SweepView<'_> {
    #[inline]
    #[must_use]
    pub fn slot_addr(&self, slot: usize) -> usize {
        self.base + slot * self.elem_size
    }

    /// Slot containing `addr`, if it lies inside the span.
    #[must_use]
    pub fn slot_of(&self, addr: usize) -> Option<usize> {
        let off = addr.checked_sub(self.base)?;
        let slot = off / self.elem_size;
        (slot < self.nelems).then_some(slot)
    }
}

/// A freshly allocated object, announced while the collector is marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewObject {
    pub addr: usize,
    pub size: usize,
    /// Bytes that may hold pointers (0 for pointer-free objects).
    pub scan_size: usize,
}

/// The reachability oracle behind sweeping.
pub trait Collector: Send + Sync {
    /// Reports which slots of the span are still reachable. Bits outside
    /// `view.allocated` are ignored.
    fn sweep_span(&self, view: &SweepView<'_>) -> LiveMap;

    /// True while a marking phase is running.
    fn is_marking(&self) -> bool {
        false
    }

    /// Called for every allocation while [`Self::is_marking`] is true.
    fn object_allocated(&self, _obj: NewObject) {}
}

/// Collector that never frees anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetainAll;

impl Collector for RetainAll {
    fn sweep_span(&self, view: &SweepView<'_>) -> LiveMap {
        view.allocated.clone()
    }
}

/// Collector driven by an explicit root set.
///
/// An object is live if any retained address falls inside its slot, so a
/// pointer into the middle of a tiny block keeps the whole block. Objects
/// announced during marking stay live until marking ends.
#[derive(Debug, Default)]
pub struct LiveSetCollector {
    roots: Mutex<BTreeSet<usize>>,
    allocated_while_marking: Mutex<BTreeSet<usize>>,
    marking: AtomicBool,
}

impl LiveSetCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&self, addr: usize) {
        self.roots.lock().insert(addr);
    }

    pub fn release(&self, addr: usize) -> bool {
        self.roots.lock().remove(&addr)
    }

    /// Drops every root; the next sweep of any span frees all of it.
    pub fn clear(&self) {
        self.roots.lock().clear();
    }

    #[must_use]
    pub fn retained(&self) -> usize {
        self.roots.lock().len()
    }

    /// Starts or ends a marking phase. Ending it forgets the objects that
    /// were only kept alive by being allocated during the phase.
    pub fn set_marking(&self, on: bool) {
        self.marking.store(on, Ordering::Release);
        if !on {
            self.allocated_while_marking.lock().clear();
        }
    }

    fn any_in(set: &BTreeSet<usize>, lo: usize, hi: usize) -> bool {
        set.range(lo..hi).next().is_some()
    }
}

impl Collector for LiveSetCollector {
    fn sweep_span(&self, view: &SweepView<'_>) -> LiveMap {
        let roots = self.roots.lock();
        let fresh = self.allocated_while_marking.lock();
        let mut live = LiveMap::new(view.nelems);
        for slot in view.allocated.iter_ones() {
            let lo = view.slot_addr(slot);
            let hi = lo + view.elem_size;
            if Self::any_in(&roots, lo, hi) || Self::any_in(&fresh, lo, hi) {
                live.set(slot);
            }
        }
        live
    }

    fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    fn object_allocated(&self, obj: NewObject) {
        self.allocated_while_marking.lock().insert(obj.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(allocated: &LiveMap) -> SweepView<'_> {
        SweepView {
            span: SpanId(0),
            base: 0x10000,
            elem_size: 16,
            nelems: allocated.len(),
            large: false,
            allocated,
        }
    }

    #[test]
    fn live_map_basics() {
        let mut m = LiveMap::new(70);
        m.set(0);
        m.set(69);
        m.set(70);
        assert_eq!(m.count(), 2);
        assert!(m.get(69));
        assert!(!m.get(70));
        m.clear(0);
        assert_eq!(m.iter_ones().collect::<Vec<_>>(), vec![69]);
        assert_eq!(LiveMap::full(70).count(), 70);

        let mut a = LiveMap::full(10);
        let mut b = LiveMap::new(10);
        b.set(3);
        a.intersect(&b);
        assert_eq!(a.iter_ones().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn from_words_masks_tail() {
        let m = LiveMap::from_words(vec![u64::MAX], 5);
        assert_eq!(m.count(), 5);
    }

    #[test]
    fn retain_all_keeps_allocated() {
        let allocated = LiveMap::full(8);
        assert_eq!(RetainAll.sweep_span(&view(&allocated)), allocated);
    }

    #[test]
    fn interior_pointer_keeps_slot() {
        let c = LiveSetCollector::new();
        let allocated = LiveMap::full(4);
        c.retain(0x10000 + 16 + 5);
        let live = c.sweep_span(&view(&allocated));
        assert_eq!(live.iter_ones().collect::<Vec<_>>(), vec![1]);
        assert!(c.release(0x10000 + 16 + 5));
        assert_eq!(c.sweep_span(&view(&allocated)).count(), 0);
    }

    #[test]
    fn unallocated_slots_never_reported() {
        let c = LiveSetCollector::new();
        let mut allocated = LiveMap::new(4);
        allocated.set(2);
        c.retain(0x10000);
        c.retain(0x10000 + 32);
        let live = c.sweep_span(&view(&allocated));
        assert_eq!(live.iter_ones().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn objects_allocated_while_marking_survive_the_phase() {
        let c = LiveSetCollector::new();
        assert!(!c.is_marking());
        c.set_marking(true);
        c.object_allocated(NewObject {
            addr: 0x10000 + 48,
            size: 16,
            scan_size: 0,
        });
        let allocated = LiveMap::full(4);
        assert_eq!(c.sweep_span(&view(&allocated)).count(), 1);
        c.set_marking(false);
        assert_eq!(c.sweep_span(&view(&allocated)).count(), 0);
    }

    #[test]
    fn slot_lookup() {
        let allocated = LiveMap::full(4);
        let v = view(&allocated);
        assert_eq!(v.slot_of(0x10000 + 17), Some(1));
        assert_eq!(v.slot_of(0x10000 + 64), None);
        assert_eq!(v.slot_of(0x100), None);
    }
}
