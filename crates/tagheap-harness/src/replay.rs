//! Trace replay against the core allocator.

use std::collections::BTreeMap;

use serde::Serialize;
use tagheap_core::malloc::{HeapStats, SystemMemory};
use tagheap_core::{AllocError, MallocState};

use crate::HarnessError;
use crate::trace::{Trace, TraceOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Run the full heap check every this many ops; 0 only checks at the end.
    pub check_every: usize,
    /// Write and verify payload patterns.
    pub verify_payloads: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            check_every: 256,
            verify_payloads: true,
        }
    }
}

/// Serializable copy of the allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    pub heap_bytes: usize,
    pub used_chunks: usize,
    pub free_chunks: usize,
    pub free_bytes: usize,
    pub mapped_blocks: usize,
    pub mapped_bytes: usize,
    pub bin_hits: u64,
    pub bin_misses: u64,
    pub heap_extensions: usize,
    pub merges: u64,
    pub splits: u64,
    pub in_place_resizes: u64,
    pub remaps: u64,
}

impl From<HeapStats> for StatsReport {
    fn from(stats: HeapStats) -> Self {
        Self {
            heap_bytes: stats.heap_bytes,
            used_chunks: stats.used_chunks,
            free_chunks: stats.free_chunks,
            free_bytes: stats.free_bytes,
            mapped_blocks: stats.mapped_blocks,
            mapped_bytes: stats.mapped_bytes,
            bin_hits: stats.bin_hits,
            bin_misses: stats.bin_misses,
            heap_extensions: stats.heap_extensions,
            merges: stats.merges,
            splits: stats.splits,
            in_place_resizes: stats.in_place_resizes,
            remaps: stats.remaps,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub ops: usize,
    pub mallocs: usize,
    pub callocs: usize,
    pub reallocs: usize,
    pub frees: usize,
    pub heap_checks: usize,
    pub peak_live_blocks: usize,
    pub peak_live_bytes: usize,
    pub stats: StatsReport,
}

impl ReplayReport {
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

fn pattern(addr: usize, len: usize) -> Vec<u8> {
    let seed = (addr >> 4) as u8;
    (0..len).map(|i| seed.wrapping_add(i as u8) | 1).collect()
}

struct Replayer<'a, M: SystemMemory> {
    heap: &'a mut MallocState<M>,
    options: ReplayOptions,
    slots: Vec<Option<(usize, usize)>>,
    live: BTreeMap<usize, usize>,
    live_bytes: usize,
    report: ReplayReport,
}

impl<M: SystemMemory> Replayer<'_, M> {
    fn alloc_err(index: usize) -> impl FnOnce(AllocError) -> HarnessError {
        move |source| HarnessError::Alloc { index, source }
    }

    fn verify(
        &self,
        index: usize,
        addr: usize,
        len: usize,
        expected: &[u8],
    ) -> Result<(), HarnessError> {
        let mut out = vec![0; len];
        self.heap
            .read_payload(addr, &mut out)
            .map_err(Self::alloc_err(index))?;
        if out != expected[..len] {
            return Err(HarnessError::PayloadMismatch { index, addr });
        }
        Ok(())
    }

    fn fill(&mut self, index: usize, addr: usize, len: usize) -> Result<(), HarnessError> {
        if self.options.verify_payloads {
            self.heap
                .write_payload(addr, &pattern(addr, len))
                .map_err(Self::alloc_err(index))?;
        }
        Ok(())
    }

    fn track(
        &mut self,
        index: usize,
        slot: usize,
        addr: usize,
        len: usize,
    ) -> Result<(), HarnessError> {
        let end = addr + len.max(1);
        let below = self.live.range(..=addr).next_back();
        let above = self.live.range(addr..).next();
        let overlaps =
            below.is_some_and(|(_, &e)| e > addr) || above.is_some_and(|(&a, _)| a < end);
        if overlaps {
            return Err(HarnessError::Overlap { index, addr });
        }
        self.live.insert(addr, end);
        self.live_bytes += len;
        self.slots[slot] = Some((addr, len));
        self.report.peak_live_blocks = self.report.peak_live_blocks.max(self.live.len());
        self.report.peak_live_bytes = self.report.peak_live_bytes.max(self.live_bytes);
        Ok(())
    }

    fn untrack(&mut self, slot: usize) -> Option<(usize, usize)> {
        let (addr, len) = self.slots[slot].take()?;
        self.live.remove(&addr);
        self.live_bytes -= len;
        Some((addr, len))
    }

    fn release(&mut self, index: usize, slot: usize) -> Result<(), HarnessError> {
        if let Some((addr, len)) = self.untrack(slot) {
            if self.options.verify_payloads {
                self.verify(index, addr, len, &pattern(addr, len))?;
            }
            self.heap.free(addr).map_err(Self::alloc_err(index))?;
            self.report.frees += 1;
        }
        Ok(())
    }

    fn step(&mut self, index: usize, op: TraceOp) -> Result<(), HarnessError> {
        match op {
            TraceOp::Malloc { slot, size } => {
                self.release(index, slot)?;
                let addr = self.heap.malloc(size).map_err(Self::alloc_err(index))?;
                self.track(index, slot, addr, size)?;
                self.fill(index, addr, size)?;
                self.report.mallocs += 1;
            }
            TraceOp::Calloc { slot, count, size } => {
                self.release(index, slot)?;
                let addr = self
                    .heap
                    .calloc(count, size)
                    .map_err(Self::alloc_err(index))?;
                let len = count * size;
                let mut out = vec![0xFF; len];
                self.heap
                    .read_payload(addr, &mut out)
                    .map_err(Self::alloc_err(index))?;
                if out.iter().any(|&b| b != 0) {
                    return Err(HarnessError::NotZeroed { index, addr });
                }
                self.track(index, slot, addr, len)?;
                self.fill(index, addr, len)?;
                self.report.callocs += 1;
            }
            TraceOp::Realloc { slot, size } => {
                let old = self.untrack(slot);
                let old_addr = old.map_or(0, |(addr, _)| addr);
                let resized = self
                    .heap
                    .realloc(old_addr, size)
                    .map_err(Self::alloc_err(index))?;
                self.report.reallocs += 1;
                if let Some(addr) = resized {
                    if let Some((old_addr, old_len)) = old {
                        if self.options.verify_payloads {
                            let kept = old_len.min(size);
                            self.verify(index, addr, kept, &pattern(old_addr, old_len))?;
                        }
                    }
                    self.track(index, slot, addr, size)?;
                    self.fill(index, addr, size)?;
                }
            }
            TraceOp::Free { slot } => self.release(index, slot)?,
        }
        Ok(())
    }

    fn check(&mut self, index: usize) -> Result<(), HarnessError> {
        self.heap.check_heap().map_err(Self::alloc_err(index))?;
        self.report.heap_checks += 1;
        Ok(())
    }
}

/// Replays `trace` on `heap`, verifying data integrity and heap consistency.
///
/// Blocks still live at the end of the trace are left allocated.
pub fn replay<M: SystemMemory>(
    heap: &mut MallocState<M>,
    trace: &Trace,
    options: ReplayOptions,
) -> Result<ReplayReport, HarnessError> {
    trace.validate()?;
    let mut replayer = Replayer {
        heap: &mut *heap,
        options,
        slots: vec![None; trace.slots],
        live: BTreeMap::new(),
        live_bytes: 0,
        report: ReplayReport::default(),
    };
    for (index, &op) in trace.ops.iter().enumerate() {
        replayer.step(index, op)?;
        replayer.report.ops += 1;
        if options.check_every != 0 && (index + 1) % options.check_every == 0 {
            replayer.check(index)?;
        }
    }
    replayer.check(trace.ops.len())?;
    let mut report = replayer.report;
    report.stats = heap.stats().into();
    Ok(report)
}
