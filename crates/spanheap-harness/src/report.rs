//! Report generation for harness runs.
//!
//! Core types carry no serde derives; the views here flatten them into
//! serializable rows.

use serde::Serialize;
use spanheap_core::{
    ArenaLayout, ClassStats, HeapCensus, HeapConfig, HeapLogRecord, MetricsSnapshot,
    SizeClassTable,
};

use crate::runner::StressConfig;
use crate::scenarios::ScenarioResult;

/// Heap-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsView {
    pub tiny_allocs: u64,
    pub tiny_blocks: u64,
    pub small_allocs: u64,
    pub large_allocs: u64,
    pub zero_size_allocs: u64,
    pub refills: u64,
    pub checkouts: u64,
    pub uncaches: u64,
    pub spans_swept: u64,
    pub objects_freed: u64,
    pub spans_released: u64,
    pub arena_growths: u64,
    pub arena_growth_failures: u64,
    pub stranded_bytes: u64,
    pub scavenged_pages: u64,
    pub heap_live: u64,
    pub mapped_bytes: u64,
}

impl From<MetricsSnapshot> for MetricsView {
    fn from(m: MetricsSnapshot) -> Self {
        Self {
            tiny_allocs: m.tiny_allocs,
            tiny_blocks: m.tiny_blocks,
            small_allocs: m.small_allocs,
            large_allocs: m.large_allocs,
            zero_size_allocs: m.zero_size_allocs,
            refills: m.refills,
            checkouts: m.checkouts,
            uncaches: m.uncaches,
            spans_swept: m.spans_swept,
            objects_freed: m.objects_freed,
            spans_released: m.spans_released,
            arena_growths: m.arena_growths,
            arena_growth_failures: m.arena_growth_failures,
            stranded_bytes: m.stranded_bytes,
            scavenged_pages: m.scavenged_pages,
            heap_live: m.heap_live,
            mapped_bytes: m.mapped_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CensusView {
    pub spans: usize,
    pub small_spans: usize,
    pub large_spans: usize,
    pub nonempty_spans: usize,
    pub empty_spans: usize,
    pub live_objects: usize,
    pub live_small_bytes: usize,
    pub large_bytes: usize,
    pub free_runs: usize,
    pub free_pages: usize,
}

impl From<HeapCensus> for CensusView {
    fn from(c: HeapCensus) -> Self {
        Self {
            spans: c.spans,
            small_spans: c.small_spans,
            large_spans: c.large_spans,
            nonempty_spans: c.nonempty_spans,
            empty_spans: c.empty_spans,
            live_objects: c.live_objects,
            live_small_bytes: c.live_small_bytes,
            large_bytes: c.large_bytes,
            free_runs: c.free_runs,
            free_pages: c.free_pages,
        }
    }
}

/// Per-class counters. Classes that never allocated are omitted by callers.
#[derive(Debug, Clone, Serialize)]
pub struct ClassRow {
    pub class: u8,
    pub object_size: usize,
    pub nmalloc: u64,
    pub nfree: u64,
    pub live: u64,
    pub nonempty_spans: usize,
    pub empty_spans: usize,
}

impl From<&ClassStats> for ClassRow {
    fn from(s: &ClassStats) -> Self {
        Self {
            class: s.class.0,
            object_size: s.object_size,
            nmalloc: s.nmalloc,
            nfree: s.nfree,
            live: s.nmalloc.saturating_sub(s.nfree),
            nonempty_spans: s.nonempty_spans,
            empty_spans: s.empty_spans,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecordView {
    pub decision_id: u64,
    pub trace_id: String,
    pub level: String,
    pub symbol: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    pub outcome: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
    pub heap_live: u64,
    pub mapped: u64,
}

impl From<&HeapLogRecord> for LogRecordView {
    fn from(r: &HeapLogRecord) -> Self {
        Self {
            decision_id: r.decision_id,
            trace_id: r.trace_id.clone(),
            level: r.level.as_str().to_string(),
            symbol: r.symbol.to_string(),
            event: r.event.to_string(),
            span: r.span,
            class: r.class,
            pages: r.pages,
            size: r.size,
            addr: r.addr.map(|a| format!("{a:#x}")),
            outcome: r.outcome.to_string(),
            details: r.details.clone(),
            heap_live: r.heap_live,
            mapped: r.mapped,
        }
    }
}

/// One stress round.
#[derive(Debug, Clone, Serialize)]
pub struct RoundSummary {
    pub round: usize,
    pub allocations: usize,
    pub live_objects: usize,
    pub retained: usize,
    pub objects_freed: u64,
    pub spans: usize,
    pub free_pages: usize,
    pub heap_live: u64,
    /// Spans swept by the background sweeper during the round.
    pub oob_sweeps: u64,
    pub elapsed_us: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub title: String,
    pub timestamp: String,
    pub config: StressConfig,
    pub rounds: Vec<RoundSummary>,
    pub census: CensusView,
    pub metrics: MetricsView,
    pub classes: Vec<ClassRow>,
    pub log: Vec<LogRecordView>,
}

impl StressReport {
    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!(
            "- Threads: {}, rounds: {}, ops/round/thread: {}, seed: {:#x}\n",
            self.config.threads, self.config.rounds, self.config.ops_per_round, self.config.seed
        ));
        out.push_str(&format!("- Objects freed: {}\n", self.metrics.objects_freed));
        out.push_str(&format!("- Spans returned: {}\n", self.metrics.spans_released));
        out.push_str(&format!("- Heap live: {} bytes\n", self.metrics.heap_live));
        out.push_str(&format!("- Mapped: {} bytes\n\n", self.metrics.mapped_bytes));

        out.push_str("| Round | Allocs | Live | Retained | Spans | Free pages | us |\n");
        out.push_str("|-------|--------|------|----------|-------|------------|----|\n");
        for r in &self.rounds {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} |\n",
                r.round, r.allocations, r.live_objects, r.retained, r.spans, r.free_pages, r.elapsed_us
            ));
        }

        out.push_str("\n| Class | Size | nmalloc | nfree | live | nonempty | empty |\n");
        out.push_str("|-------|------|---------|-------|------|----------|-------|\n");
        for c in &self.classes {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} |\n",
                c.class, c.object_size, c.nmalloc, c.nfree, c.live, c.nonempty_spans, c.empty_spans
            ));
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub title: String,
    pub timestamp: String,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ScenarioResult>,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(title: impl Into<String>, timestamp: impl Into<String>, results: Vec<ScenarioResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            title: title.into(),
            timestamp: timestamp.into(),
            passed,
            failed: results.len() - passed,
            results,
        }
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!("- Passed: {}\n", self.passed));
        out.push_str(&format!("- Failed: {}\n\n", self.failed));
        out.push_str("| Scenario | Status | Detail |\n");
        out.push_str("|----------|--------|--------|\n");
        for r in &self.results {
            let status = if r.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!("| {} | {} | {} |\n", r.name, status, r.detail));
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SizeClassRow {
    pub class: u8,
    pub object_size: usize,
    pub span_pages: usize,
    pub max_objects: usize,
    pub tail_waste: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayoutView {
    pub reservation_start: String,
    pub reservation_size: usize,
    pub zero_base: String,
    pub spans_start: String,
    pub spans_bytes: usize,
    pub bitmap_start: String,
    pub bitmap_bytes: usize,
    pub arena_start: String,
    pub arena_limit: String,
}

impl From<&ArenaLayout> for LayoutView {
    fn from(l: &ArenaLayout) -> Self {
        Self {
            reservation_start: format!("{:#x}", l.reservation_start),
            reservation_size: l.reservation_size,
            zero_base: format!("{:#x}", l.zero_base),
            spans_start: format!("{:#x}", l.spans_start),
            spans_bytes: l.spans_bytes,
            bitmap_start: format!("{:#x}", l.bitmap_start),
            bitmap_bytes: l.bitmap_bytes,
            arena_start: format!("{:#x}", l.arena_start),
            arena_limit: format!("{:#x}", l.arena_limit),
        }
    }
}

/// Effective configuration, reservation layout and size classes.
#[derive(Debug, Clone, Serialize)]
pub struct LayoutReport {
    pub arena_bytes: usize,
    pub initial_reservation: usize,
    pub heap_chunk: usize,
    pub strand_limit: usize,
    pub physical_page_size: usize,
    pub layout: LayoutView,
    pub classes: Vec<SizeClassRow>,
}

impl LayoutReport {
    #[must_use]
    pub fn new(
        config: &HeapConfig,
        physical_page_size: usize,
        layout: &ArenaLayout,
        table: &SizeClassTable,
    ) -> Self {
        Self {
            arena_bytes: config.arena_bytes,
            initial_reservation: config.initial_reservation,
            heap_chunk: config.heap_chunk,
            strand_limit: config.strand_limit,
            physical_page_size,
            layout: LayoutView::from(layout),
            classes: table
                .iter()
                .map(|c| SizeClassRow {
                    class: c.id.0,
                    object_size: c.object_size,
                    span_pages: c.span_pages,
                    max_objects: c.max_objects,
                    tail_waste: c.tail_waste(),
                })
                .collect(),
        }
    }

    /// Render the size-class table as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# spanheap layout\n\n");
        out.push_str(&format!("- Arena: {} bytes at {}\n", self.arena_bytes, self.layout.arena_start));
        out.push_str(&format!("- Initial reservation: {} bytes\n", self.initial_reservation));
        out.push_str(&format!("- Heap chunk: {} bytes\n", self.heap_chunk));
        out.push_str(&format!("- Physical page: {} bytes\n\n", self.physical_page_size));
        out.push_str("| Class | Size | Pages | Objects | Tail waste |\n");
        out.push_str("|-------|------|-------|---------|------------|\n");
        for c in &self.classes {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                c.class, c.object_size, c.span_pages, c.max_objects, c.tail_waste
            ));
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}
