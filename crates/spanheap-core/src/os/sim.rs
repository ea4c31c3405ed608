//! Simulated address space for deterministic tests.
//!
//! Nothing is actually mapped: the simulator only tracks which ranges are
//! reserved and which physical pages are committed, counts every call, and
//! can be told to fail or misplace upcoming requests.

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;

use super::{OsError, PageSource, Reservation};

/// Where unhinted reservations are placed.
const DEFAULT_PLACEMENT: usize = 0x2000_0000_0000;

/// Call counters and current occupancy of a [`SimulatedOs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimOsStats {
    pub reserves: u64,
    pub reserve_failures: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub decommits: u64,
    pub releases: u64,
    pub zeroed_bytes: u64,
    pub reserved_bytes: usize,
    pub committed_bytes: usize,
    /// Zeroes or decommits touching memory that was never committed.
    pub faults: u64,
}

#[derive(Debug, Default)]
struct SimState {
    /// start -> size
    regions: BTreeMap<usize, usize>,
    committed: HashSet<usize>,
    next_placement: usize,
    honor_hints: bool,
    reserve_budget: Option<usize>,
    fail_next_reserves: usize,
    displace: Option<(usize, usize)>,
    misalign_next_reserve: bool,
    fail_next_commits: usize,
    stats: SimOsStats,
}

impl SimState {
    fn overlaps(&self, addr: usize, size: usize) -> bool {
        let end = addr.saturating_add(size);
        self.regions
            .range(..end)
            .next_back()
            .is_some_and(|(&start, &len)| start + len > addr)
    }

    fn inside_reservation(&self, addr: usize, size: usize) -> bool {
        self.regions
            .range(..=addr)
            .next_back()
            .is_some_and(|(&start, &len)| addr + size <= start + len)
    }

    fn first_free_from(&self, mut addr: usize, size: usize, page: usize) -> usize {
        while self.overlaps(addr, size) {
            let (&start, &len) = self
                .regions
                .range(..addr.saturating_add(size))
                .next_back()
                .unwrap_or((&addr, &page));
            addr = (start + len).next_multiple_of(page);
        }
        addr
    }

    fn remove_range(&mut self, addr: usize, size: usize) {
        let end = addr + size;
        let hits: Vec<(usize, usize)> = self
            .regions
            .range(..end)
            .filter(|&(&start, &len)| start + len > addr)
            .map(|(&s, &l)| (s, l))
            .collect();
        for (start, len) in hits {
            self.regions.remove(&start);
            if start < addr {
                self.regions.insert(start, addr - start);
            }
            if start + len > end {
                self.regions.insert(end, start + len - end);
            }
            self.stats.reserved_bytes -= (start + len).min(end) - start.max(addr);
        }
    }
}

/// Bookkeeping-only page source.
pub struct SimulatedOs {
    page_size: usize,
    state: Mutex<SimState>,
}

impl SimulatedOs {
    /// A simulator with 4 KiB pages that honors address hints.
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(4096)
    }

    /// A simulator reporting `page_size` as its physical page size. Non
    /// power-of-two sizes are accepted so startup validation can be tested.
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::new(SimState {
                next_placement: DEFAULT_PLACEMENT,
                honor_hints: true,
                ..SimState::default()
            }),
        }
    }

    pub fn set_honor_hints(&self, honor: bool) {
        self.state.lock().honor_hints = honor;
    }

    /// Caps the total reserved address space.
    pub fn set_reserve_budget(&self, budget: Option<usize>) {
        self.state.lock().reserve_budget = budget;
    }

    /// The next `n` reservations fail.
    pub fn fail_next_reserves(&self, n: usize) {
        self.state.lock().fail_next_reserves = n;
    }

    /// The next reservation lands `gap` bytes past where it would have gone.
    pub fn displace_next_reserve(&self, gap: usize) {
        self.displace_next_reserves(gap, 1);
    }

    /// The next `n` reservations each land `gap` bytes past where they
    /// would have gone.
    pub fn displace_next_reserves(&self, gap: usize, n: usize) {
        self.state.lock().displace = (n > 0).then_some((gap, n));
    }

    /// The next reservation is returned at an address off the page grid.
    pub fn misalign_next_reserve(&self) {
        self.state.lock().misalign_next_reserve = true;
    }

    /// The next `n` commits fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.state.lock().fail_next_commits = n;
    }

    #[must_use]
    pub fn stats(&self) -> SimOsStats {
        self.state.lock().stats
    }

    /// Current reservations as `(start, size)`, in address order.
    #[must_use]
    pub fn regions(&self) -> Vec<(usize, usize)> {
        self.state
            .lock()
            .regions
            .iter()
            .map(|(&s, &l)| (s, l))
            .collect()
    }

    #[must_use]
    pub fn is_committed(&self, addr: usize) -> bool {
        self.state.lock().committed.contains(&(addr / self.page_size))
    }
}

impl Default for SimulatedOs {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for SimulatedOs {
    fn physical_page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, hint: Option<usize>, size: usize) -> Option<Reservation> {
        let page = self.page_size.max(1);
        let mut st = self.state.lock();
        if st.fail_next_reserves > 0 {
            st.fail_next_reserves -= 1;
            st.stats.reserve_failures += 1;
            return None;
        }
        if st
            .reserve_budget
            .is_some_and(|budget| st.stats.reserved_bytes + size > budget)
        {
            st.stats.reserve_failures += 1;
            return None;
        }

        let displaced = st.displace.map(|(gap, _)| gap);
        st.displace = st.displace.and_then(|(gap, n)| (n > 1).then_some((gap, n - 1)));
        let mut addr = match hint {
            Some(h) if st.honor_hints && h % page == 0 && !st.overlaps(h, size) => h,
            _ => st.first_free_from(st.next_placement, size, page),
        };
        if let Some(gap) = displaced {
            addr = st.first_free_from(addr + gap.next_multiple_of(page), size, page);
        }
        if hint.is_none() {
            st.next_placement = (addr + size).next_multiple_of(page);
        }
        if std::mem::take(&mut st.misalign_next_reserve) {
            addr += page / 2;
        }

        st.regions.insert(addr, size);
        st.stats.reserves += 1;
        st.stats.reserved_bytes += size;
        Some(Reservation {
            addr,
            size,
            reserved: true,
        })
    }

    fn commit(&self, addr: usize, size: usize, _reserved: bool) -> Result<(), OsError> {
        let page = self.page_size.max(1);
        let mut st = self.state.lock();
        if st.fail_next_commits > 0 {
            st.fail_next_commits -= 1;
            st.stats.commit_failures += 1;
            return Err(OsError::Injected);
        }
        if !st.inside_reservation(addr, size) {
            st.stats.commit_failures += 1;
            return Err(OsError::NotReserved { addr, size });
        }
        for p in addr / page..(addr + size).div_ceil(page) {
            if st.committed.insert(p) {
                st.stats.committed_bytes += page;
            }
        }
        st.stats.commits += 1;
        Ok(())
    }

    fn decommit(&self, addr: usize, size: usize) {
        let page = self.page_size.max(1);
        let mut st = self.state.lock();
        for p in addr / page..(addr + size).div_ceil(page) {
            if st.committed.remove(&p) {
                st.stats.committed_bytes -= page;
            } else {
                st.stats.faults += 1;
            }
        }
        st.stats.decommits += 1;
    }

    fn release(&self, addr: usize, size: usize) {
        let page = self.page_size.max(1);
        let mut st = self.state.lock();
        for p in addr / page..(addr + size).div_ceil(page) {
            if st.committed.remove(&p) {
                st.stats.committed_bytes -= page;
            }
        }
        st.remove_range(addr, size);
        st.stats.releases += 1;
    }

    fn zero(&self, addr: usize, len: usize) {
        let page = self.page_size.max(1);
        let mut st = self.state.lock();
        let all_committed =
            (addr / page..(addr + len).div_ceil(page)).all(|p| st.committed.contains(&p));
        if !all_committed {
            st.stats.faults += 1;
        }
        st.stats.zeroed_bytes += len as u64;
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}
