//! JSONL export of allocator lifecycle records.

use std::io::Write;

use serde::Serialize;
use tagheap_core::malloc::AllocatorLogRecord;

use crate::HarnessError;

/// One JSONL line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine<'a> {
    pub decision_id: u64,
    pub trace_id: &'a str,
    pub level: &'static str,
    pub symbol: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin: Option<usize>,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub details: &'a str,
    pub heap_bytes: usize,
    pub mapped_bytes: usize,
    pub active_count: usize,
}

impl<'a> From<&'a AllocatorLogRecord> for LogLine<'a> {
    fn from(record: &'a AllocatorLogRecord) -> Self {
        Self {
            decision_id: record.decision_id,
            trace_id: &record.trace_id,
            level: record.level.as_str(),
            symbol: record.symbol,
            event: record.event,
            addr: record.addr.map(|addr| format!("{addr:#x}")),
            size: record.size,
            bin: record.bin,
            outcome: record.outcome,
            details: &record.details,
            heap_bytes: record.heap_bytes,
            mapped_bytes: record.mapped_bytes,
            active_count: record.active_count,
        }
    }
}

/// Writes one JSON object per record, newline-terminated.
pub fn write_jsonl<'a, W: Write>(
    out: &mut W,
    records: impl IntoIterator<Item = &'a AllocatorLogRecord>,
) -> Result<usize, HarnessError> {
    let mut written = 0;
    for record in records {
        serde_json::to_writer(&mut *out, &LogLine::from(record))?;
        out.write_all(b"\n")?;
        written += 1;
    }
    Ok(written)
}
