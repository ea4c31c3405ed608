//! Deterministic multi-threaded stress runs.
//!
//! Each round spawns one thread cache per worker, allocates a seeded mix of
//! tiny, small and large objects, then checks that no two live objects
//! overlap and that the heap passes [`Heap::check_invariants`]. A random
//! share of live objects is kept as collector roots before the generation
//! advances; everything else is reclaimed by sweeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Instant, SystemTime};

use clap::ValueEnum;
use serde::Serialize;
use spanheap_core::size_class::{MAX_SMALL_SIZE, TINY_SIZE};
use spanheap_core::{
    AllocFlags, Heap, HeapConfig, HeapError, LiveSetCollector, MmapPageSource, PageSource,
    SimulatedOs,
};

use crate::error::HarnessError;
use crate::report::{CensusView, ClassRow, LogRecordView, MetricsView, RoundSummary, StressReport};

/// Which OS layer backs the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    /// Bookkeeping-only simulation; no memory is mapped.
    Sim,
    /// Real anonymous mappings.
    Mmap,
}

impl OsKind {
    fn page_source(self) -> Arc<dyn PageSource> {
        match self {
            Self::Sim => Arc::new(SimulatedOs::new()),
            Self::Mmap => Arc::new(MmapPageSource::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressConfig {
    pub threads: usize,
    pub rounds: usize,
    /// Allocations per worker per round.
    pub ops_per_round: usize,
    pub seed: u64,
    /// Percent of live objects kept alive into the next round.
    pub retain_percent: u8,
    /// Percent of requests that are pointer-free and below the tiny size.
    pub tiny_percent: u8,
    /// Percent of requests above the small-object ceiling.
    pub large_percent: u8,
    /// Run an out-of-band sweeper thread next to the workers.
    pub background_sweep: bool,
    pub arena_bytes: usize,
    pub os: OsKind,
    /// Trailing lifecycle log records kept in the report.
    pub log_tail: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            rounds: 8,
            ops_per_round: 2_000,
            seed: 0xDEAD_BEEF,
            retain_percent: 30,
            tiny_percent: 10,
            large_percent: 1,
            background_sweep: true,
            arena_bytes: 256 << 20,
            os: OsKind::Sim,
            log_tail: 64,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed | 1 }
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
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Object {
    addr: usize,
    size: usize,
}

/// Drives a [`StressConfig`] against a fresh heap.
pub struct StressRunner {
    config: StressConfig,
}

impl StressRunner {
    pub fn new(config: StressConfig) -> Result<Self, HarnessError> {
        if config.threads == 0 {
            return Err(HarnessError::InvalidArgument("threads must be at least 1".into()));
        }
        if config.retain_percent > 100 {
            return Err(HarnessError::InvalidArgument(format!(
                "retain_percent {} exceeds 100",
                config.retain_percent
            )));
        }
        if u16::from(config.tiny_percent) + u16::from(config.large_percent) > 100 {
            return Err(HarnessError::InvalidArgument(format!(
                "tiny_percent {} + large_percent {} exceeds 100",
                config.tiny_percent, config.large_percent
            )));
        }
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    /// Builds a heap from `SPANHEAP_*` settings with the run's arena size.
    pub fn build_heap(&self, collector: Arc<LiveSetCollector>) -> Result<Heap, HarnessError> {
        let heap_config = HeapConfig::from_env().with_arena_bytes(self.config.arena_bytes);
        Ok(Heap::new(heap_config, self.config.os.page_source(), collector)?)
    }

    pub fn run(&self) -> Result<StressReport, HarnessError> {
        let collector = Arc::new(LiveSetCollector::new());
        let heap = self.build_heap(Arc::clone(&collector))?;
        let mut rng = XorShift64::new(self.config.seed);
        let mut retained: Vec<Object> = Vec::new();
        let mut rounds = Vec::with_capacity(self.config.rounds);

        for round in 0..self.config.rounds {
            let started = Instant::now();
            let seeds: Vec<u64> = (0..self.config.threads).map(|_| rng.next_u64()).collect();
            let (fresh, oob_sweeps) = self.run_round(&heap, round, &seeds)?;
            let allocations = fresh.len();

            let mut live: Vec<Object> = retained.iter().chain(fresh.iter()).copied().collect();
            live.retain(|o| o.size > 0);
            check_overlap(round, &mut live)?;
            let census = heap
                .check_invariants()
                .map_err(|violation| HarnessError::Invariant { round, violation })?;

            let keep = u64::from(self.config.retain_percent);
            retained = live
                .iter()
                .copied()
                .filter(|_| rng.next_u64() % 100 < keep)
                .collect();
            collector.clear();
            for o in &retained {
                collector.retain(o.addr);
            }
            heap.advance_generation();

            let metrics = heap.metrics();
            rounds.push(RoundSummary {
                round,
                allocations,
                live_objects: census.live_objects,
                retained: retained.len(),
                objects_freed: metrics.objects_freed,
                spans: census.spans,
                free_pages: census.free_pages,
                heap_live: metrics.heap_live,
                oob_sweeps,
                elapsed_us: started.elapsed().as_micros(),
            });
        }

        heap.finish_sweep();
        let census = heap
            .check_invariants()
            .map_err(|violation| HarnessError::Invariant {
                round: self.config.rounds,
                violation,
            })?;
        let log = heap.drain_log();
        let skip = log.len().saturating_sub(self.config.log_tail);
        Ok(StressReport {
            title: String::from("spanheap stress report"),
            timestamp: format!("{:?}", SystemTime::now()),
            config: self.config.clone(),
            rounds,
            census: CensusView::from(census),
            metrics: MetricsView::from(heap.metrics()),
            classes: heap
                .class_stats()
                .iter()
                .filter(|s| s.nmalloc > 0)
                .map(ClassRow::from)
                .collect(),
            log: log.iter().skip(skip).map(LogRecordView::from).collect(),
        })
    }

    /// Runs one round; returns the objects allocated and the number of
    /// spans the background sweeper reclaimed.
    fn run_round(
        &self,
        heap: &Heap,
        round: usize,
        seeds: &[u64],
    ) -> Result<(Vec<Object>, u64), HarnessError> {
        let done = AtomicBool::new(false);
        let swept = AtomicU64::new(0);
        let (joined, sweeper_ok) = thread::scope(|s| {
            let sweeper = self.config.background_sweep.then(|| {
                s.spawn(|| {
                    while !done.load(Ordering::Acquire) {
                        match heap.sweep_one() {
                            Some(_) => {
                                swept.fetch_add(1, Ordering::Relaxed);
                            }
                            None => thread::yield_now(),
                        }
                    }
                })
            });
            let workers: Vec<_> = seeds
                .iter()
                .map(|&seed| s.spawn(move || self.worker(heap, seed)))
                .collect();
            let joined: Vec<thread::Result<Result<Vec<Object>, HeapError>>> =
                workers.into_iter().map(|w| w.join()).collect();
            done.store(true, Ordering::Release);
            let sweeper_ok = sweeper.is_none_or(|h| h.join().is_ok());
            (joined, sweeper_ok)
        });
        if !sweeper_ok {
            return Err(HarnessError::WorkerPanicked { round });
        }

        let mut fresh = Vec::new();
        for result in joined {
            match result {
                Ok(objects) => fresh.extend(objects?),
                Err(_) => return Err(HarnessError::WorkerPanicked { round }),
            }
        }
        Ok((fresh, swept.load(Ordering::Relaxed)))
    }

    fn worker(&self, heap: &Heap, seed: u64) -> Result<Vec<Object>, HeapError> {
        let mut rng = XorShift64::new(seed);
        let mut cache = heap.thread_cache();
        let tiny = usize::from(self.config.tiny_percent);
        let large = usize::from(self.config.large_percent);
        let mut out = Vec::with_capacity(self.config.ops_per_round);
        for _ in 0..self.config.ops_per_round {
            let roll = rng.gen_range(0, 99);
            let (size, flags) = if roll < tiny {
                (rng.gen_range(1, TINY_SIZE - 1), AllocFlags::pointer_free())
            } else if roll < tiny + large {
                (rng.gen_range(MAX_SMALL_SIZE + 1, 4 * MAX_SMALL_SIZE), AllocFlags::default())
            } else if rng.gen_range(0, 9) == 0 {
                (rng.gen_range(1025, MAX_SMALL_SIZE), AllocFlags::default())
            } else {
                (rng.gen_range(1, 1024), AllocFlags::default())
            };
            let a = cache.alloc(size, flags)?;
            out.push(Object { addr: a.addr, size });
        }
        Ok(out)
    }
}

fn check_overlap(round: usize, live: &mut [Object]) -> Result<(), HarnessError> {
    live.sort_unstable();
    match live.windows(2).find(|w| w[0].addr + w[0].size > w[1].addr) {
        Some(w) => Err(HarnessError::Overlap {
            round,
            first: w[0].addr,
            first_size: w[0].size,
            second: w[1].addr,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> StressConfig {
        StressConfig {
            threads: 2,
            rounds: 3,
            ops_per_round: 500,
            arena_bytes: 64 << 20,
            ..StressConfig::default()
        }
    }

    #[test]
    fn rejects_bad_percentages() {
        let cfg = StressConfig {
            tiny_percent: 80,
            large_percent: 30,
            ..StressConfig::default()
        };
        assert!(matches!(
            StressRunner::new(cfg),
            Err(HarnessError::InvalidArgument(_))
        ));
        let cfg = StressConfig {
            threads: 0,
            ..StressConfig::default()
        };
        assert!(StressRunner::new(cfg).is_err());
    }

    #[test]
    fn stress_run_reports_every_round() {
        let runner = StressRunner::new(small_config()).unwrap();
        let report = runner.run().unwrap();
        assert_eq!(report.rounds.len(), 3);
        assert!(report.rounds.iter().all(|r| r.allocations == 1_000));
        assert!(report.metrics.objects_freed > 0);
        assert!(report.classes.iter().all(|c| c.nmalloc >= c.nfree));
        assert!(report.log.len() <= 64);
    }

    #[test]
    fn same_seed_same_shape() {
        let cfg = StressConfig {
            background_sweep: false,
            threads: 1,
            ..small_config()
        };
        let a = StressRunner::new(cfg.clone()).unwrap().run().unwrap();
        let b = StressRunner::new(cfg).unwrap().run().unwrap();
        let live = |r: &StressReport| r.rounds.iter().map(|x| x.live_objects).collect::<Vec<_>>();
        assert_eq!(live(&a), live(&b));
        assert_eq!(a.metrics.objects_freed, b.metrics.objects_freed);
    }

    #[test]
    fn overlap_is_detected() {
        let mut objs = vec![
            Object { addr: 0x1000, size: 32 },
            Object { addr: 0x1010, size: 8 },
        ];
        assert!(matches!(
            check_overlap(2, &mut objs),
            Err(HarnessError::Overlap { round: 2, first: 0x1000, .. })
        ));
    }
}
