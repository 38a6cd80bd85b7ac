//! Core allocator state and the malloc family.
//!
//! [`MallocState`] owns the heap arena, the bin table and the registry of
//! mapped blocks. Addresses returned to callers are real addresses inside
//! the memory supplied by the [`SystemMemory`] implementation; internally
//! heap chunks are tracked by arena offset.

use std::collections::HashMap;

use super::bins::{BinIndex, BinTable, MAPPED_BIN};
use super::chunk::{self, Chunk, SizeField, UsedChunk, corrupted, read_chunk, round_to_stride};
use super::coalesce::{absorb_successor, coalesce, split};
use super::error::AllocError;
use super::heap::Arena;
use super::lifecycle::{AllocatorLogLevel, AllocatorLogRecord, Event, LifecycleLog, Snapshot};
use super::mapped::{MappedBlock, MappedRegistry};
use super::system::SystemMemory;
use crate::config::AllocatorConfig;

/// Point-in-time allocator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes managed by the heap arena.
    pub heap_bytes: usize,
    pub used_chunks: usize,
    pub used_bytes: usize,
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

/// Summary of a successful [`MallocState::check_heap`] walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapCheck {
    pub chunks: usize,
    pub used_chunks: usize,
    pub free_chunks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub mapped_blocks: usize,
}

/// Allocator state.
///
/// Single-threaded: callers that share one instance serialize access.
/// After any fatal [`AllocError`] the state must not be used again.
pub struct MallocState<M: SystemMemory> {
    arena: Arena<M>,
    bins: BinTable,
    mapped: MappedRegistry,
    config: AllocatorConfig,
    log: LifecycleLog,
    /// Live allocations, heap and mapped.
    active_count: usize,
    bin_hits: u64,
    bin_misses: u64,
    merges: u64,
    splits: u64,
    in_place_resizes: u64,
    remaps: u64,
}

impl<M: SystemMemory> MallocState<M> {
    /// Creates an empty allocator with the default configuration.
    pub fn new(memory: M) -> Self {
        Self::with_config(memory, AllocatorConfig::default())
    }

    pub fn with_config(memory: M, config: AllocatorConfig) -> Self {
        Self {
            arena: Arena::new(memory),
            bins: BinTable::new(),
            mapped: MappedRegistry::new(),
            log: LifecycleLog::new(config.log_capacity, config.log_level),
            config,
            active_count: 0,
            bin_hits: 0,
            bin_misses: 0,
            merges: 0,
            splits: 0,
            in_place_resizes: 0,
            remaps: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn memory(&self) -> &M {
        self.arena.memory()
    }

    /// Address of the first heap chunk header, once the heap exists.
    #[must_use]
    pub fn heap_base(&self) -> Option<usize> {
        self.arena.base()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_count
    }

    /// Allocates `size` bytes and returns the payload address.
    pub fn malloc(&mut self, size: usize) -> Result<usize, AllocError> {
        let result = self.allocate("malloc", size);
        self.observe("malloc", None, Some(size), result)
    }

    /// Releases the block at `addr`. A null address is a no-op.
    pub fn free(&mut self, addr: usize) -> Result<(), AllocError> {
        if addr == 0 {
            return Ok(());
        }
        let result = self.release("free", addr);
        self.observe("free", Some(addr), None, result)
    }

    /// Allocates `count * elem_size` zeroed bytes.
    pub fn calloc(&mut self, count: usize, elem_size: usize) -> Result<usize, AllocError> {
        let result = self.zero_allocate(count, elem_size);
        self.observe("calloc", None, count.checked_mul(elem_size), result)
    }

    /// Resizes the block at `addr` to `new_size` bytes.
    ///
    /// A null `addr` allocates; a zero `new_size` frees and returns `None`.
    /// Otherwise returns the (possibly moved) payload address. The first
    /// `min(old capacity, new_size)` bytes are preserved.
    pub fn realloc(&mut self, addr: usize, new_size: usize) -> Result<Option<usize>, AllocError> {
        let result = self.resize(addr, new_size);
        self.observe("realloc", Some(addr), Some(new_size), result)
    }

    /// Payload bytes available at `addr`; zero for null.
    pub fn usable_size(&self, addr: usize) -> Result<usize, AllocError> {
        if addr == 0 {
            return Ok(0);
        }
        if let Some(block) = self.mapped.lookup(addr) {
            return Ok(block.capacity());
        }
        Ok(self.used_chunk(addr)?.capacity())
    }

    /// Copies the first `out.len()` payload bytes of a live block into `out`.
    pub fn read_payload(&self, addr: usize, out: &mut [u8]) -> Result<(), AllocError> {
        self.check_capacity(addr, out.len())?;
        self.arena.memory().read_bytes(addr, out);
        Ok(())
    }

    /// Writes `data` at the start of a live block's payload.
    pub fn write_payload(&mut self, addr: usize, data: &[u8]) -> Result<(), AllocError> {
        self.check_capacity(addr, data.len())?;
        self.arena.memory_mut().write_bytes(addr, data);
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let heap_bytes = self.arena.len();
        let free_bytes = self.bins.free_bytes();
        HeapStats {
            heap_bytes,
            used_chunks: self.active_count - self.mapped.len(),
            used_bytes: heap_bytes - free_bytes,
            free_chunks: self.bins.free_chunks(),
            free_bytes,
            mapped_blocks: self.mapped.len(),
            mapped_bytes: self.mapped.total_mapped(),
            bin_hits: self.bin_hits,
            bin_misses: self.bin_misses,
            heap_extensions: self.arena.extensions(),
            merges: self.merges,
            splits: self.splits,
            in_place_resizes: self.in_place_resizes,
            remaps: self.remaps,
        }
    }

    /// Walks every chunk and every bin and verifies the heap invariants.
    ///
    /// Checks tag agreement, that no two free chunks are adjacent, that each
    /// free chunk sits in exactly one bin of its class, that no used chunk is
    /// binned, and that list back-links agree.
    pub fn check_heap(&self) -> Result<HeapCheck, AllocError> {
        let arena = &self.arena;
        let mut report = HeapCheck::default();
        let mut unbinned: HashMap<usize, usize> = HashMap::new();
        let mut offset = 0;
        let mut previous_free = false;
        while offset < arena.len() {
            let chunk = read_chunk(arena, offset)?;
            report.chunks += 1;
            match chunk {
                Chunk::Free(free) => {
                    if previous_free {
                        return Err(corrupted(arena, offset, "adjacent free chunks"));
                    }
                    unbinned.insert(free.offset(), free.size());
                    report.free_chunks += 1;
                    report.free_bytes += free.size();
                    previous_free = true;
                }
                Chunk::Used(used) => {
                    report.used_chunks += 1;
                    report.used_bytes += used.size();
                    previous_free = false;
                }
            }
            offset = chunk.end();
        }

        self.bins.walk(arena, |bin, free| {
            if BinIndex::for_size(free.size()) != bin {
                return Err(corrupted(arena, free.offset(), "chunk filed in the wrong bin"));
            }
            if unbinned.remove(&free.offset()) != Some(free.size()) {
                return Err(corrupted(
                    arena,
                    free.offset(),
                    "binned chunk is not a free heap chunk",
                ));
            }
            Ok(())
        })?;
        if let Some(&orphan) = unbinned.keys().next() {
            return Err(corrupted(arena, orphan, "free chunk missing from bins"));
        }
        if report.free_chunks != self.bins.free_chunks() {
            return Err(corrupted(arena, 0, "bin counters disagree with heap walk"));
        }

        for block in self.mapped.blocks() {
            if arena.memory().read_word(block.base) != block.mapped_len {
                return Err(AllocError::Corrupted {
                    addr: block.payload(),
                    reason: "mapped block header overwritten",
                });
            }
        }
        report.mapped_blocks = self.mapped.len();
        Ok(report)
    }

    pub fn lifecycle_logs(&self) -> impl ExactSizeIterator<Item = &AllocatorLogRecord> {
        self.log.records()
    }

    pub fn drain_lifecycle_logs(&mut self) -> Vec<AllocatorLogRecord> {
        self.log.drain()
    }

    /// Records evicted from the lifecycle ring so far.
    #[must_use]
    pub fn lifecycle_dropped(&self) -> u64 {
        self.log.dropped()
    }

    fn allocate(&mut self, symbol: &'static str, size: usize) -> Result<usize, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let chunk_size = round_to_stride(size).ok_or(AllocError::Exhausted { requested: size })?;
        if chunk_size > self.config.mmap_threshold {
            let block = self.mapped.map(self.arena.memory_mut(), size)?;
            self.active_count += 1;
            self.record(
                Event::new(AllocatorLogLevel::Trace, symbol, "mapped", "success")
                    .addr(block.payload())
                    .size(size)
                    .bin(MAPPED_BIN),
                || format!("mapped_len={}", block.mapped_len),
            );
            return Ok(block.payload());
        }

        let bin = BinIndex::for_size(chunk_size);
        let used = match self.bins.find_fit(&self.arena, chunk_size)? {
            Some(free) => {
                self.bins.remove(&mut self.arena, free)?;
                let used = chunk::mark_used(&mut self.arena, free.offset(), free.size());
                self.bin_hits += 1;
                let used = self.trim(symbol, used, chunk_size)?;
                self.record(
                    Event::new(AllocatorLogLevel::Trace, symbol, "bin_hit", "success")
                        .addr(self.arena.address_of(used.payload_offset()))
                        .size(size)
                        .bin(bin.flat()),
                    || {
                        let from = BinIndex::for_size(free.size());
                        format!("from={from};chunk_size={}", used.size())
                    },
                );
                used
            }
            None => {
                self.bin_misses += 1;
                let used = self.arena.grow_chunk(chunk_size)?;
                self.record(
                    Event::new(AllocatorLogLevel::Trace, symbol, "heap_extend", "success")
                        .addr(self.arena.address_of(used.payload_offset()))
                        .size(size)
                        .bin(bin.flat()),
                    || format!("bin_miss={bin};chunk_size={chunk_size}"),
                );
                used
            }
        };
        self.active_count += 1;
        Ok(self.arena.address_of(used.payload_offset()))
    }

    fn zero_allocate(&mut self, count: usize, elem_size: usize) -> Result<usize, AllocError> {
        let total = count
            .checked_mul(elem_size)
            .ok_or(AllocError::SizeOverflow { count, elem_size })?;
        let addr = self.allocate("calloc", total)?;
        // Fresh mappings are already zero.
        if self.mapped.lookup(addr).is_none() {
            self.arena.memory_mut().fill(addr, 0, total);
        }
        Ok(addr)
    }

    fn release(&mut self, symbol: &'static str, addr: usize) -> Result<(), AllocError> {
        if self.mapped.lookup(addr).is_some() {
            let block = self.mapped.unmap(self.arena.memory_mut(), addr)?;
            self.active_count -= 1;
            self.record(
                Event::new(AllocatorLogLevel::Trace, symbol, "unmap", "success")
                    .addr(addr)
                    .size(block.user_size)
                    .bin(MAPPED_BIN),
                || format!("mapped_len={}", block.mapped_len),
            );
            return Ok(());
        }
        let used = self.used_chunk(addr)?;
        let freed = chunk::mark_free(&mut self.arena, used.offset(), used.size());
        let merged = coalesce(&mut self.arena, &mut self.bins, freed)?;
        let bin = self.bins.insert(&mut self.arena, merged.chunk)?;
        self.merges += merged.merges as u64;
        self.active_count -= 1;
        self.record(
            Event::new(AllocatorLogLevel::Trace, symbol, "free", "success")
                .addr(addr)
                .size(used.capacity())
                .bin(bin.flat()),
            || {
                format!(
                    "merges={};coalesced_size={}",
                    merged.merges,
                    merged.chunk.size()
                )
            },
        );
        Ok(())
    }

    fn resize(&mut self, addr: usize, new_size: usize) -> Result<Option<usize>, AllocError> {
        if addr == 0 {
            return self.allocate("realloc", new_size).map(Some);
        }
        if new_size == 0 {
            self.release("realloc", addr)?;
            return Ok(None);
        }
        if let Some(block) = self.mapped.lookup(addr) {
            return self.resize_mapped(block, new_size).map(Some);
        }

        let used = self.used_chunk(addr)?;
        if used.capacity() >= new_size {
            self.record(
                Event::new(AllocatorLogLevel::Trace, "realloc", "unchanged", "success")
                    .addr(addr)
                    .size(new_size),
                || format!("capacity={}", used.capacity()),
            );
            return Ok(Some(addr));
        }

        let needed = round_to_stride(new_size).ok_or(AllocError::Exhausted {
            requested: new_size,
        })?;
        if needed <= self.config.mmap_threshold {
            if let Some(grown) = absorb_successor(&mut self.arena, &mut self.bins, used, needed)? {
                self.merges += 1;
                self.in_place_resizes += 1;
                let kept = self.trim("realloc", grown, needed)?;
                self.record(
                    Event::new(AllocatorLogLevel::Debug, "realloc", "absorb_successor", "success")
                        .addr(addr)
                        .size(new_size),
                    || format!("chunk_size={}", kept.size()),
                );
                return Ok(Some(addr));
            }
            if self.arena.is_last(used.end()) {
                match self.arena.grow_in_place(used, needed) {
                    Ok(grown) => {
                        self.in_place_resizes += 1;
                        let event = Event::new(
                            AllocatorLogLevel::Debug,
                            "realloc",
                            "grow_in_place",
                            "success",
                        );
                        self.record(
                            event.addr(addr).size(new_size),
                            || format!("chunk_size={}", grown.size()),
                        );
                        return Ok(Some(addr));
                    }
                    // The heap cannot grow, but a bin may still fit.
                    Err(err) if !err.is_fatal() => {}
                    Err(err) => return Err(err),
                }
            }
        }

        let moved = self.allocate("realloc", new_size)?;
        self.arena.memory_mut().copy(moved, addr, used.capacity());
        self.release("realloc", addr)?;
        self.record(
            Event::new(AllocatorLogLevel::Debug, "realloc", "moved", "success")
                .addr(moved)
                .size(new_size),
            || format!("from={addr:#x};copied={}", used.capacity()),
        );
        Ok(Some(moved))
    }

    fn resize_mapped(&mut self, block: MappedBlock, new_size: usize) -> Result<usize, AllocError> {
        let addr = block.payload();
        if new_size == block.user_size {
            return Ok(addr);
        }
        if let Some(moved) = self.mapped.remap(self.arena.memory_mut(), addr, new_size)? {
            self.remaps += 1;
            self.record(
                Event::new(AllocatorLogLevel::Debug, "realloc", "remap", "success")
                    .addr(moved.payload())
                    .size(new_size)
                    .bin(MAPPED_BIN),
                || format!("from={addr:#x};mapped_len={}", moved.mapped_len),
            );
            return Ok(moved.payload());
        }
        if block.capacity() >= new_size {
            return Ok(addr);
        }
        let fresh = self.allocate("realloc", new_size)?;
        let copied = block.capacity().min(new_size);
        self.arena.memory_mut().copy(fresh, addr, copied);
        self.release("realloc", addr)?;
        self.record(
            Event::new(AllocatorLogLevel::Debug, "realloc", "remap_fallback", "success")
                .addr(fresh)
                .size(new_size),
            || format!("from={addr:#x};copied={copied}"),
        );
        Ok(fresh)
    }

    /// Splits off slack beyond `keep` bytes and bins it.
    fn trim(
        &mut self,
        symbol: &'static str,
        used: UsedChunk,
        keep: usize,
    ) -> Result<UsedChunk, AllocError> {
        let (kept, rest) = split(&mut self.arena, &mut self.bins, used, keep)?;
        if let Some(rest) = rest {
            self.splits += 1;
            self.record(
                Event::new(AllocatorLogLevel::Trace, symbol, "split", "success")
                    .size(keep)
                    .bin(BinIndex::for_size(rest.size()).flat()),
                || format!("from={};remainder={}", used.size(), rest.size()),
            );
        }
        Ok(kept)
    }

    /// The live heap chunk whose payload starts at `addr`.
    fn used_chunk(&self, addr: usize) -> Result<UsedChunk, AllocError> {
        let Some(offset) = self.arena.chunk_of_payload(addr) else {
            return Err(if self.mapped.was_unmapped(addr) {
                AllocError::DoubleFree { addr }
            } else {
                AllocError::InvalidPointer { addr }
            });
        };
        // Status bit first: a stale pointer into a merged chunk still has a free header.
        if SizeField::from_raw(self.arena.word(offset)).is_free() {
            return Err(AllocError::DoubleFree { addr });
        }
        match read_chunk(&self.arena, offset)? {
            Chunk::Used(used) => Ok(used),
            Chunk::Free(_) => Err(AllocError::DoubleFree { addr }),
        }
    }

    fn check_capacity(&self, addr: usize, len: usize) -> Result<(), AllocError> {
        let capacity = self.usable_size(addr)?;
        if addr == 0 || len > capacity {
            return Err(AllocError::PayloadOverrun {
                addr,
                len,
                capacity,
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            heap_bytes: self.arena.len(),
            mapped_bytes: self.mapped.total_mapped(),
            active_count: self.active_count,
        }
    }

    fn record(&mut self, event: Event, details: impl FnOnce() -> String) {
        if !self.log.enabled(event.level) {
            return;
        }
        let snapshot = self.snapshot();
        self.log.push(event, details(), snapshot);
    }

    fn observe<T>(
        &mut self,
        symbol: &'static str,
        addr: Option<usize>,
        size: Option<usize>,
        result: Result<T, AllocError>,
    ) -> Result<T, AllocError> {
        if let Err(err) = &result {
            let (level, outcome) = if err.is_fatal() {
                (AllocatorLogLevel::Error, "fatal")
            } else {
                (AllocatorLogLevel::Warn, "failed")
            };
            let mut event = Event::new(level, symbol, err.event(), outcome);
            event.addr = addr;
            event.size = size;
            self.record(event, || err.to_string());
        }
        result
    }
}

impl<M: SystemMemory> Drop for MallocState<M> {
    fn drop(&mut self) {
        let live: Vec<usize> = self.mapped.blocks().map(MappedBlock::payload).collect();
        for payload in live {
            // Drop has no caller to report to; a failing unmap leaks the mapping.
            let result = self.mapped.unmap(self.arena.memory_mut(), payload);
            debug_assert!(result.is_ok(), "unmap on drop failed: {result:?}");
        }
    }
}
