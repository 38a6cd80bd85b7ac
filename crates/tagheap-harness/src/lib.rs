//! Replay and stress harness for the tagheap allocator.
//!
//! This crate provides:
//! - Traces: JSON sequences of allocation operations on numbered slots
//! - Workloads: seeded trace generation
//! - Replay: run a trace against the core allocator with payload verification
//! - Structured logs: lifecycle records exported as JSONL

#![forbid(unsafe_code)]

pub mod replay;
pub mod structured_log;
pub mod trace;
pub mod workload;

pub use replay::{ReplayOptions, ReplayReport, replay};
pub use trace::{Trace, TraceOp};

use thiserror::Error;

/// Failures of the harness itself or of the allocator under test.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported trace version {0}")]
    Version(u32),
    #[error("op {index}: slot {slot} out of range (trace has {slots} slots)")]
    SlotOutOfRange {
        index: usize,
        slot: usize,
        slots: usize,
    },
    #[error("op {index}: {source}")]
    Alloc {
        index: usize,
        #[source]
        source: tagheap_core::AllocError,
    },
    #[error("op {index}: payload at {addr:#x} does not match what was written")]
    PayloadMismatch { index: usize, addr: usize },
    #[error("op {index}: calloc block at {addr:#x} is not zeroed")]
    NotZeroed { index: usize, addr: usize },
    #[error("op {index}: block at {addr:#x} overlaps a live block")]
    Overlap { index: usize, addr: usize },
}
