//! Operating-system memory primitives.
//!
//! The allocator never touches memory directly. It asks a [`SystemMemory`]
//! implementation to extend the contiguous heap, to create, drop and resize
//! anonymous mappings, and to read or write bytes inside memory it owns.
//! The ABI crate backs this with `sbrk`/`mmap`; [`SimulatedMemory`] backs it
//! with plain vectors so the whole allocator can run in safe tests.

use std::collections::BTreeMap;

use thiserror::Error;

use super::chunk::WORD;

/// `ENOMEM` as reported by the simulated primitives.
pub const ENOMEM: i32 = 12;
/// `EINVAL` as reported by the simulated primitives.
pub const EINVAL: i32 = 22;

/// Failure of an unmap/remap primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op} failed with errno {errno}")]
pub struct OsError {
    pub op: &'static str,
    pub errno: i32,
}

/// Outcome of a remap request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remapped {
    /// The mapping now lives at this base address (possibly unchanged).
    At(usize),
    /// The platform cannot resize mappings; the caller must copy.
    Unsupported,
}

/// Memory-acquisition primitives plus raw access to owned memory.
///
/// Addresses passed to the access methods always lie inside the heap range
/// `[first extension, heap_break())` or inside a live mapping returned by
/// [`SystemMemory::map`]. Implementations may assume this.
pub trait SystemMemory {
    /// Current end of the contiguous heap.
    fn heap_break(&self) -> usize;

    /// Grows the heap by `bytes` and returns the start of the new bytes.
    ///
    /// The returned address must equal the previous [`SystemMemory::heap_break`];
    /// an implementation that cannot grow contiguously returns `None`.
    fn heap_extend(&mut self, bytes: usize) -> Option<usize>;

    /// Creates an independent page-aligned mapping of at least `len` bytes.
    fn map(&mut self, len: usize) -> Option<usize>;

    fn unmap(&mut self, addr: usize, len: usize) -> Result<(), OsError>;

    /// Resizes a mapping, moving it if necessary.
    fn remap(&mut self, addr: usize, old_len: usize, new_len: usize)
    -> Result<Remapped, OsError>;

    fn read_word(&self, addr: usize) -> usize;

    fn write_word(&mut self, addr: usize, value: usize);

    /// `memmove` semantics.
    fn copy(&mut self, dst: usize, src: usize, len: usize);

    fn fill(&mut self, addr: usize, byte: u8, len: usize);

    fn read_bytes(&self, addr: usize, out: &mut [u8]);

    fn write_bytes(&mut self, addr: usize, data: &[u8]);
}

/// Base address of the simulated heap (kept above the zero page).
pub const SIM_HEAP_BASE: usize = 0x1000;
/// First address handed out by simulated mappings.
pub const SIM_MAP_BASE: usize = 0x1_0000_0000;
/// Page size of the simulated mapping primitive.
pub const SIM_PAGE_SIZE: usize = 4096;

const DEFAULT_HEAP_LIMIT: usize = 64 * 1024 * 1024;
const DEFAULT_MAP_LIMIT: usize = 1024 * 1024 * 1024;

fn page_align(size: usize) -> Option<usize> {
    Some(size.checked_add(SIM_PAGE_SIZE - 1)? & !(SIM_PAGE_SIZE - 1))
}

/// Vector-backed [`SystemMemory`] for tests, fuzzing and trace replay.
///
/// The heap is one growable buffer starting at a fixed base address;
/// each mapping is its own buffer keyed by its base. Limits on both let
/// callers provoke exhaustion deterministically.
///
/// # Panics
///
/// Accessing an address outside the heap and every live mapping panics,
/// the simulated equivalent of a segmentation fault.
#[derive(Debug, Clone)]
pub struct SimulatedMemory {
    heap_base: usize,
    heap: Vec<u8>,
    heap_limit: usize,
    mappings: BTreeMap<usize, Vec<u8>>,
    next_map: usize,
    mapped_bytes: usize,
    map_limit: usize,
    remap_supported: bool,
    unmap_failure: Option<i32>,
    remap_failure: Option<i32>,
    extend_calls: usize,
    map_calls: usize,
    unmap_calls: usize,
    remap_calls: usize,
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self {
            heap_base: SIM_HEAP_BASE,
            heap: Vec::new(),
            heap_limit: DEFAULT_HEAP_LIMIT,
            mappings: BTreeMap::new(),
            next_map: SIM_MAP_BASE,
            mapped_bytes: 0,
            map_limit: DEFAULT_MAP_LIMIT,
            remap_supported: true,
            unmap_failure: None,
            remap_failure: None,
            extend_calls: 0,
            map_calls: 0,
            unmap_calls: 0,
            remap_calls: 0,
        }
    }

    /// Starts the heap at `base` instead of [`SIM_HEAP_BASE`].
    #[must_use]
    pub fn with_heap_base(mut self, base: usize) -> Self {
        self.heap_base = base;
        self
    }

    /// Caps the heap at `limit` bytes; further extensions fail.
    #[must_use]
    pub fn with_heap_limit(mut self, limit: usize) -> Self {
        self.heap_limit = limit;
        self
    }

    /// Caps the total bytes of live mappings.
    #[must_use]
    pub fn with_map_limit(mut self, limit: usize) -> Self {
        self.map_limit = limit;
        self
    }

    /// Makes [`SystemMemory::remap`] report [`Remapped::Unsupported`].
    #[must_use]
    pub fn without_remap(mut self) -> Self {
        self.remap_supported = false;
        self
    }

    /// Makes the next [`SystemMemory::unmap`] fail with `errno` and leave
    /// the mapping in place.
    #[must_use]
    pub fn with_unmap_failure(mut self, errno: i32) -> Self {
        self.unmap_failure = Some(errno);
        self
    }

    /// Makes the next supported [`SystemMemory::remap`] fail with `errno`
    /// and leave the mapping unchanged.
    #[must_use]
    pub fn with_remap_failure(mut self, errno: i32) -> Self {
        self.remap_failure = Some(errno);
        self
    }

    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Total page-rounded bytes of live mappings.
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    pub fn extend_calls(&self) -> usize {
        self.extend_calls
    }

    pub fn map_calls(&self) -> usize {
        self.map_calls
    }

    pub fn unmap_calls(&self) -> usize {
        self.unmap_calls
    }

    pub fn remap_calls(&self) -> usize {
        self.remap_calls
    }

    fn region(&self, addr: usize, len: usize) -> &[u8] {
        let heap_end = self.heap_base + self.heap.len();
        if addr >= self.heap_base && addr.saturating_add(len) <= heap_end {
            let start = addr - self.heap_base;
            return &self.heap[start..start + len];
        }
        if let Some((&base, buf)) = self.mappings.range(..=addr).next_back()
            && addr.saturating_add(len) <= base + buf.len()
        {
            let start = addr - base;
            return &buf[start..start + len];
        }
        panic!("simulated segfault: read of {len} bytes at {addr:#x}");
    }

    fn region_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        let heap_end = self.heap_base + self.heap.len();
        if addr >= self.heap_base && addr.saturating_add(len) <= heap_end {
            let start = addr - self.heap_base;
            return &mut self.heap[start..start + len];
        }
        if let Some((&base, buf)) = self.mappings.range_mut(..=addr).next_back()
            && addr.saturating_add(len) <= base + buf.len()
        {
            let start = addr - base;
            return &mut buf[start..start + len];
        }
        panic!("simulated segfault: write of {len} bytes at {addr:#x}");
    }
}

impl Default for SimulatedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemory for SimulatedMemory {
    fn heap_break(&self) -> usize {
        self.heap_base + self.heap.len()
    }

    fn heap_extend(&mut self, bytes: usize) -> Option<usize> {
        self.extend_calls += 1;
        let new_len = self.heap.len().checked_add(bytes)?;
        if new_len > self.heap_limit {
            return None;
        }
        let start = self.heap_break();
        self.heap.resize(new_len, 0);
        Some(start)
    }

    fn map(&mut self, len: usize) -> Option<usize> {
        self.map_calls += 1;
        let rounded = page_align(len.max(1))?;
        if self.mapped_bytes.checked_add(rounded)? > self.map_limit {
            return None;
        }
        let base = self.next_map;
        // One unmapped guard page keeps mappings from touching.
        self.next_map = base.checked_add(rounded)?.checked_add(SIM_PAGE_SIZE)?;
        self.mappings.insert(base, vec![0; rounded]);
        self.mapped_bytes += rounded;
        Some(base)
    }

    fn unmap(&mut self, addr: usize, len: usize) -> Result<(), OsError> {
        self.unmap_calls += 1;
        if let Some(errno) = self.unmap_failure.take() {
            return Err(OsError { op: "munmap", errno });
        }
        let err = OsError {
            op: "munmap",
            errno: EINVAL,
        };
        match self.mappings.get(&addr) {
            Some(buf) if page_align(len) == Some(buf.len()) => {}
            _ => return Err(err),
        }
        if let Some(buf) = self.mappings.remove(&addr) {
            self.mapped_bytes -= buf.len();
        }
        Ok(())
    }

    fn remap(
        &mut self,
        addr: usize,
        old_len: usize,
        new_len: usize,
    ) -> Result<Remapped, OsError> {
        self.remap_calls += 1;
        if !self.remap_supported {
            return Ok(Remapped::Unsupported);
        }
        if let Some(errno) = self.remap_failure.take() {
            return Err(OsError { op: "mremap", errno });
        }
        let invalid = OsError {
            op: "mremap",
            errno: EINVAL,
        };
        let enomem = OsError {
            op: "mremap",
            errno: ENOMEM,
        };
        let current = match self.mappings.get(&addr) {
            Some(buf) if page_align(old_len) == Some(buf.len()) => buf.len(),
            _ => return Err(invalid),
        };
        let rounded = page_align(new_len.max(1)).ok_or(enomem)?;
        if rounded <= current {
            if let Some(buf) = self.mappings.get_mut(&addr) {
                buf.truncate(rounded);
            }
            self.mapped_bytes -= current - rounded;
            return Ok(Remapped::At(addr));
        }
        if self.mapped_bytes - current + rounded > self.map_limit {
            return Err(enomem);
        }
        // Growth always moves, the way MREMAP_MAYMOVE does when the
        // neighboring range is taken.
        let mut buf = self.mappings.remove(&addr).ok_or(invalid)?;
        buf.resize(rounded, 0);
        let base = self.next_map;
        self.next_map = base + rounded + SIM_PAGE_SIZE;
        self.mappings.insert(base, buf);
        self.mapped_bytes = self.mapped_bytes - current + rounded;
        Ok(Remapped::At(base))
    }

    fn read_word(&self, addr: usize) -> usize {
        let mut raw = [0u8; WORD];
        raw.copy_from_slice(self.region(addr, WORD));
        usize::from_ne_bytes(raw)
    }

    fn write_word(&mut self, addr: usize, value: usize) {
        self.region_mut(addr, WORD)
            .copy_from_slice(&value.to_ne_bytes());
    }

    fn copy(&mut self, dst: usize, src: usize, len: usize) {
        if len == 0 {
            return;
        }
        let staged = self.region(src, len).to_vec();
        self.region_mut(dst, len).copy_from_slice(&staged);
    }

    fn fill(&mut self, addr: usize, byte: u8, len: usize) {
        if len == 0 {
            return;
        }
        self.region_mut(addr, len).fill(byte);
    }

    fn read_bytes(&self, addr: usize, out: &mut [u8]) {
        if out.is_empty() {
            return;
        }
        out.copy_from_slice(self.region(addr, out.len()));
    }

    fn write_bytes(&mut self, addr: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.region_mut(addr, data.len()).copy_from_slice(data);
    }
}
