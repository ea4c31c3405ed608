//! Structured heap lifecycle records.
//!
//! Only slow paths log: reservation, growth, stranding, OS failures, large
//! allocations, spans returned to the arena, scavenging and fatal errors.
//! The allocation fast path never touches the ring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum HeapLogLevel {
    Trace,
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

impl HeapLogLevel {
    /// Parse from string (case-insensitive); unknown spellings map to `Debug`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "all" => Self::Trace,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" | "fatal" | "off" => Self::Error,
            _ => Self::Debug,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// One structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id: `spanheap::<symbol>::<decision_id:016x>`.
    pub trace_id: String,
    pub level: HeapLogLevel,
    /// Operation that produced the record (`reserve`, `grow`, `alloc_large`, ...).
    pub symbol: &'static str,
    /// Event kind within the operation.
    pub event: &'static str,
    pub span: Option<u32>,
    pub class: Option<usize>,
    pub pages: Option<usize>,
    pub size: Option<usize>,
    pub addr: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: estimated live heap bytes.
    pub heap_live: u64,
    /// Snapshot: bytes committed through the OS layer.
    pub mapped: u64,
}

/// Event under construction; turned into a [`HeapLogRecord`] by [`HeapLog::record`].
#[derive(Debug, Clone)]
pub struct LogEvent {
    level: HeapLogLevel,
    symbol: &'static str,
    event: &'static str,
    outcome: &'static str,
    span: Option<u32>,
    class: Option<usize>,
    pages: Option<usize>,
    size: Option<usize>,
    addr: Option<usize>,
    details: String,
}

impl LogEvent {
    #[must_use]
    pub fn new(
        level: HeapLogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            level,
            symbol,
            event,
            outcome,
            span: None,
            class: None,
            pages: None,
            size: None,
            addr: None,
            details: String::new(),
        }
    }

    #[must_use]
    pub fn span(mut self, span: u32) -> Self {
        self.span = Some(span);
        self
    }

    #[must_use]
    pub fn class(mut self, class: usize) -> Self {
        self.class = Some(class);
        self
    }

    #[must_use]
    pub fn pages(mut self, pages: usize) -> Self {
        self.pages = Some(pages);
        self
    }

    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn addr(mut self, addr: usize) -> Self {
        self.addr = Some(addr);
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Bounded ring of lifecycle records owned by one heap.
pub struct HeapLog {
    threshold: HeapLogLevel,
    capacity: usize,
    next_id: AtomicU64,
    ring: Mutex<VecDeque<HeapLogRecord>>,
}

impl HeapLog {
    #[must_use]
    pub fn new(threshold: HeapLogLevel, capacity: usize) -> Self {
        Self {
            threshold,
            capacity,
            next_id: AtomicU64::new(1),
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    #[must_use]
    pub fn enabled(&self, level: HeapLogLevel) -> bool {
        self.capacity > 0 && level >= self.threshold
    }

    /// Appends a record, evicting the oldest once the ring is full.
    pub fn record(&self, event: LogEvent, heap_live: u64, mapped: u64) {
        if !self.enabled(event.level) {
            return;
        }
        let decision_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let trace_id = format!("spanheap::{}::{:016x}", event.symbol, decision_id);
        let rec = HeapLogRecord {
            decision_id,
            trace_id,
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            span: event.span,
            class: event.class,
            pages: event.pages,
            size: event.size,
            addr: event.addr,
            outcome: event.outcome,
            details: event.details,
            heap_live,
            mapped,
        };
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(rec);
    }

    /// Copies the retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<HeapLogRecord> {
        self.ring.lock().iter().cloned().collect()
    }

    /// Removes and returns the retained records.
    pub fn drain(&self) -> Vec<HeapLogRecord> {
        self.ring.lock().drain(..).collect()
    }
}
