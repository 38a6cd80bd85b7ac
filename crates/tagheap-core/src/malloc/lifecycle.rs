//! Structured allocator lifecycle records.

use std::collections::VecDeque;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl AllocatorLogLevel {
    /// Parses a level name, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn from_str_loose(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" | "err" => Some(Self::Error),
            _ => None,
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

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id, `core::malloc::<symbol>::<decision id>`.
    pub trace_id: String,
    pub level: AllocatorLogLevel,
    /// API symbol (`malloc`, `free`, `calloc`, `realloc`).
    pub symbol: &'static str,
    /// Event kind (`bin_hit`, `heap_extend`, `coalesce`, ...).
    pub event: &'static str,
    /// Payload address involved in the event.
    pub addr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Flat bin index, or the mapped label for oversized blocks.
    pub bin: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: managed heap bytes.
    pub heap_bytes: usize,
    /// Snapshot: bytes held in live mappings.
    pub mapped_bytes: usize,
    /// Snapshot: live allocations.
    pub active_count: usize,
}

/// Allocator counters copied into every record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub heap_bytes: usize,
    pub mapped_bytes: usize,
    pub active_count: usize,
}

/// One event about to be recorded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub level: AllocatorLogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub addr: Option<usize>,
    pub size: Option<usize>,
    pub bin: Option<usize>,
    pub outcome: &'static str,
}

impl Event {
    pub fn new(
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            level,
            symbol,
            event,
            addr: None,
            size: None,
            bin: None,
            outcome,
        }
    }

    #[must_use]
    pub fn addr(mut self, addr: usize) -> Self {
        self.addr = Some(addr);
        self
    }

    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn bin(mut self, bin: usize) -> Self {
        self.bin = Some(bin);
        self
    }
}

/// Bounded ring of lifecycle records; the oldest are dropped first.
#[derive(Debug, Clone)]
pub(crate) struct LifecycleLog {
    records: VecDeque<AllocatorLogRecord>,
    capacity: usize,
    min_level: AllocatorLogLevel,
    next_decision_id: u64,
    dropped: u64,
}

impl LifecycleLog {
    pub fn new(capacity: usize, min_level: AllocatorLogLevel) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            min_level,
            next_decision_id: 1,
            dropped: 0,
        }
    }

    /// Whether a record at `level` would be kept.
    pub fn enabled(&self, level: AllocatorLogLevel) -> bool {
        self.capacity > 0 && level >= self.min_level
    }

    pub fn push(&mut self, event: Event, details: impl Into<String>, snapshot: Snapshot) {
        if !self.enabled(event.level) {
            return;
        }
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back(AllocatorLogRecord {
            decision_id,
            trace_id: format!("core::malloc::{}::{:016x}", event.symbol, decision_id),
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            addr: event.addr,
            size: event.size,
            bin: event.bin,
            outcome: event.outcome,
            details: details.into(),
            heap_bytes: snapshot.heap_bytes,
            mapped_bytes: snapshot.mapped_bytes,
            active_count: snapshot.active_count,
        });
    }

    pub fn records(&self) -> impl ExactSizeIterator<Item = &AllocatorLogRecord> {
        self.records.iter()
    }

    pub fn drain(&mut self) -> Vec<AllocatorLogRecord> {
        self.records.drain(..).collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
