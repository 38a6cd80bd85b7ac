//! Segregated free lists.
//!
//! Small bins hold exactly one chunk size each (stride [`GRANULE`], up to
//! [`MAX_SMALL_CHUNK`]). Large bins are geometric: class `k` covers
//! `(512 * 2^(k-1), 512 * 2^k]` and the last class takes everything larger.
//! Class 0 overlaps the small range and so never holds a chunk.
//!
//! Lists are doubly linked through the free chunks themselves. Every link
//! followed is validated, and unlinking checks that both neighbors point
//! back at the chunk being removed.

use std::fmt;

use super::chunk::{FreeChunk, GRANULE, MIN_CHUNK, corrupted, read_free};
use super::error::AllocError;
use super::heap::Arena;
use super::system::SystemMemory;

/// Largest chunk size served by an exact-size small bin.
pub const MAX_SMALL_CHUNK: usize = 512;
pub const NUM_SMALL_BINS: usize = MAX_SMALL_CHUNK / GRANULE;
pub const NUM_LARGE_BINS: usize = 8;
/// Flat label used in logs for blocks that live outside the bins.
pub const MAPPED_BIN: usize = NUM_SMALL_BINS + NUM_LARGE_BINS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinIndex {
    Small(usize),
    Large(usize),
}

impl BinIndex {
    /// Class of a chunk size (header and footer included).
    #[must_use]
    pub fn for_size(size: usize) -> Self {
        if size <= MAX_SMALL_CHUNK {
            return Self::Small((size / GRANULE).saturating_sub(1));
        }
        let mut bound = MAX_SMALL_CHUNK;
        let mut index = 0;
        while bound < size && index < NUM_LARGE_BINS - 1 {
            bound *= 2;
            index += 1;
        }
        Self::Large(index)
    }

    /// Small bins hold a single size, so their head always fits exactly.
    #[must_use]
    pub const fn is_exact(self) -> bool {
        matches!(self, Self::Small(_))
    }

    #[must_use]
    pub const fn is_catch_all(self) -> bool {
        matches!(self, Self::Large(k) if k == NUM_LARGE_BINS - 1)
    }

    /// Position in a single table of all heads: small first, then large.
    #[must_use]
    pub const fn flat(self) -> usize {
        match self {
            Self::Small(i) => i,
            Self::Large(k) => NUM_SMALL_BINS + k,
        }
    }

    pub fn all() -> impl Iterator<Item = Self> {
        (0..NUM_SMALL_BINS)
            .map(Self::Small)
            .chain((0..NUM_LARGE_BINS).map(Self::Large))
    }
}

impl fmt::Display for BinIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small(i) => write!(f, "small[{i}]"),
            Self::Large(k) => write!(f, "large[{k}]"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BinTable {
    small: [Option<usize>; NUM_SMALL_BINS],
    large: [Option<usize>; NUM_LARGE_BINS],
    free_chunks: usize,
    free_bytes: usize,
}

impl BinTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            small: [None; NUM_SMALL_BINS],
            large: [None; NUM_LARGE_BINS],
            free_chunks: 0,
            free_bytes: 0,
        }
    }

    #[must_use]
    pub fn head(&self, bin: BinIndex) -> Option<usize> {
        match bin {
            BinIndex::Small(i) => self.small[i],
            BinIndex::Large(k) => self.large[k],
        }
    }

    fn set_head(&mut self, bin: BinIndex, head: Option<usize>) {
        match bin {
            BinIndex::Small(i) => self.small[i] = head,
            BinIndex::Large(k) => self.large[k] = head,
        }
    }

    #[must_use]
    pub fn free_chunks(&self) -> usize {
        self.free_chunks
    }

    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Pushes `chunk` at the head of the bin for its size.
    pub fn insert<M: SystemMemory>(
        &mut self,
        arena: &mut Arena<M>,
        chunk: FreeChunk,
    ) -> Result<BinIndex, AllocError> {
        let bin = BinIndex::for_size(chunk.size());
        let old_head = match self.head(bin) {
            Some(offset) => Some(read_free(arena, offset)?),
            None => None,
        };
        chunk.set_prev(arena, None);
        chunk.set_next(arena, old_head.map(FreeChunk::offset));
        if let Some(old) = old_head {
            old.set_prev(arena, Some(chunk.offset()));
        }
        self.set_head(bin, Some(chunk.offset()));
        self.free_chunks += 1;
        self.free_bytes += chunk.size();
        Ok(bin)
    }

    /// Unlinks `chunk` from the bin for its size.
    pub fn remove<M: SystemMemory>(
        &mut self,
        arena: &mut Arena<M>,
        chunk: FreeChunk,
    ) -> Result<(), AllocError> {
        let bin = BinIndex::for_size(chunk.size());
        let prev = match chunk.prev(arena)? {
            Some(offset) => Some(read_free(arena, offset)?),
            None => None,
        };
        let next = match chunk.next(arena)? {
            Some(offset) => Some(read_free(arena, offset)?),
            None => None,
        };
        let linked_from_prev = match prev {
            Some(p) => p.next(arena)? == Some(chunk.offset()),
            None => self.head(bin) == Some(chunk.offset()),
        };
        if !linked_from_prev {
            return Err(corrupted(arena, chunk.offset(), "free-list links disagree"));
        }
        if let Some(n) = next
            && n.prev(arena)? != Some(chunk.offset())
        {
            return Err(corrupted(arena, chunk.offset(), "free-list links disagree"));
        }

        let next_offset = next.map(FreeChunk::offset);
        match prev {
            Some(p) => p.set_next(arena, next_offset),
            None => self.set_head(bin, next_offset),
        }
        if let Some(n) = next {
            n.set_prev(arena, prev.map(FreeChunk::offset));
        }
        chunk.set_prev(arena, None);
        chunk.set_next(arena, None);
        self.free_chunks -= 1;
        self.free_bytes -= chunk.size();
        Ok(())
    }

    /// Finds a free chunk of at least `size` bytes without unlinking it.
    ///
    /// Starts at the class of `size` and moves to larger classes on a miss:
    /// the small bins above it in order, then the large bins, ending at the
    /// catch-all. A small bin answers with its head, which must hold exactly
    /// that bin's size. Large bins are scanned first-fit. `Ok(None)` means
    /// no free chunk anywhere is big enough.
    pub fn find_fit<M: SystemMemory>(
        &self,
        arena: &Arena<M>,
        size: usize,
    ) -> Result<Option<FreeChunk>, AllocError> {
        let start = BinIndex::for_size(size).flat();
        for bin in BinIndex::all().skip(start) {
            let found = match bin {
                BinIndex::Small(i) => self.small_head(arena, i)?,
                BinIndex::Large(_) => self.first_fit(arena, bin, size)?,
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    fn small_head<M: SystemMemory>(
        &self,
        arena: &Arena<M>,
        index: usize,
    ) -> Result<Option<FreeChunk>, AllocError> {
        let Some(head) = self.small[index] else {
            return Ok(None);
        };
        let chunk = read_free(arena, head)?;
        if chunk.size() != (index + 1) * GRANULE {
            return Err(corrupted(arena, head, "small bin holds a chunk of the wrong size"));
        }
        Ok(Some(chunk))
    }

    fn first_fit<M: SystemMemory>(
        &self,
        arena: &Arena<M>,
        bin: BinIndex,
        size: usize,
    ) -> Result<Option<FreeChunk>, AllocError> {
        let mut cursor = self.head(bin);
        let mut steps = 0;
        while let Some(offset) = cursor {
            steps += 1;
            if steps > walk_limit(arena) {
                return Err(corrupted(arena, offset, "free list cycle"));
            }
            let chunk = read_free(arena, offset)?;
            if chunk.size() >= size {
                return Ok(Some(chunk));
            }
            cursor = chunk.next(arena)?;
        }
        Ok(None)
    }

    /// Visits every binned chunk, checking back-links along the way.
    pub fn walk<M: SystemMemory>(
        &self,
        arena: &Arena<M>,
        mut visit: impl FnMut(BinIndex, FreeChunk) -> Result<(), AllocError>,
    ) -> Result<(), AllocError> {
        for bin in BinIndex::all() {
            let mut cursor = self.head(bin);
            let mut expected_prev = None;
            let mut steps = 0;
            while let Some(offset) = cursor {
                steps += 1;
                if steps > walk_limit(arena) {
                    return Err(corrupted(arena, offset, "free list cycle"));
                }
                let chunk = read_free(arena, offset)?;
                if chunk.prev(arena)? != expected_prev {
                    return Err(corrupted(arena, offset, "free-list links disagree"));
                }
                visit(bin, chunk)?;
                expected_prev = Some(offset);
                cursor = chunk.next(arena)?;
            }
        }
        Ok(())
    }
}

/// More list nodes than this cannot fit in the arena.
fn walk_limit<M: SystemMemory>(arena: &Arena<M>) -> usize {
    arena.len() / MIN_CHUNK + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::chunk::mark_free;
    use crate::malloc::system::SimulatedMemory;

    fn arena(bytes: usize) -> Arena<SimulatedMemory> {
        let mut arena = Arena::new(SimulatedMemory::new());
        arena.grow(bytes).unwrap();
        arena
    }

    #[test]
    fn small_index_matches_stride() {
        assert_eq!(BinIndex::for_size(32), BinIndex::Small(1));
        assert_eq!(BinIndex::for_size(48), BinIndex::Small(2));
        assert_eq!(BinIndex::for_size(512), BinIndex::Small(31));
        assert!(BinIndex::for_size(512).is_exact());
    }

    #[test]
    fn large_index_is_geometric_with_catch_all() {
        assert_eq!(BinIndex::for_size(528), BinIndex::Large(1));
        assert_eq!(BinIndex::for_size(1024), BinIndex::Large(1));
        assert_eq!(BinIndex::for_size(1040), BinIndex::Large(2));
        assert_eq!(BinIndex::for_size(512 << 6), BinIndex::Large(6));
        assert_eq!(BinIndex::for_size((512 << 6) + 16), BinIndex::Large(7));
        assert!(BinIndex::for_size(1 << 30).is_catch_all());
        assert_eq!(BinIndex::Large(7).flat(), MAPPED_BIN - 1);
    }

    #[test]
    fn insert_pushes_at_head() {
        let mut arena = arena(256);
        let mut bins = BinTable::new();
        let a = mark_free(&mut arena, 0, 48);
        let b = mark_free(&mut arena, 96, 48);
        bins.insert(&mut arena, a).unwrap();
        bins.insert(&mut arena, b).unwrap();
        assert_eq!(bins.head(BinIndex::Small(2)), Some(96));
        assert_eq!(b.next(&arena).unwrap(), Some(0));
        assert_eq!(a.prev(&arena).unwrap(), Some(96));
        assert_eq!(bins.free_chunks(), 2);
        assert_eq!(bins.free_bytes(), 96);
    }

    #[test]
    fn remove_unlinks_middle_head_and_tail() {
        let mut arena = arena(512);
        let mut bins = BinTable::new();
        let chunks: Vec<_> = (0..3).map(|i| mark_free(&mut arena, i * 96, 48)).collect();
        for &c in &chunks {
            bins.insert(&mut arena, c).unwrap();
        }
        // list: 192 -> 96 -> 0
        bins.remove(&mut arena, chunks[1]).unwrap();
        assert_eq!(chunks[2].next(&arena).unwrap(), Some(0));
        assert_eq!(chunks[0].prev(&arena).unwrap(), Some(192));
        bins.remove(&mut arena, chunks[2]).unwrap();
        assert_eq!(bins.head(BinIndex::Small(2)), Some(0));
        bins.remove(&mut arena, chunks[0]).unwrap();
        assert_eq!(bins.head(BinIndex::Small(2)), None);
        assert_eq!(bins.free_chunks(), 0);
    }

    #[test]
    fn small_fit_is_exact_and_large_fit_is_first_fit() {
        let mut arena = arena(8192);
        let mut bins = BinTable::new();
        assert_eq!(bins.find_fit(&arena, 48).unwrap(), None);

        let small = mark_free(&mut arena, 0, 48);
        bins.insert(&mut arena, small).unwrap();
        assert_eq!(bins.find_fit(&arena, 48).unwrap(), Some(small));
        assert_eq!(bins.find_fit(&arena, 64).unwrap(), None);

        let big = mark_free(&mut arena, 1024, 1024);
        let mid = mark_free(&mut arena, 4096, 640);
        bins.insert(&mut arena, big).unwrap();
        bins.insert(&mut arena, mid).unwrap();
        // head is `mid` (640), too small for 800; next is `big`.
        assert_eq!(bins.find_fit(&arena, 800).unwrap(), Some(big));
        assert_eq!(bins.find_fit(&arena, 600).unwrap(), Some(mid));
    }

    #[test]
    fn miss_falls_through_to_larger_classes() {
        let mut arena = arena(8192);
        let mut bins = BinTable::new();
        let big = mark_free(&mut arena, 1024, 2048);
        bins.insert(&mut arena, big).unwrap();
        assert_eq!(bins.find_fit(&arena, 32).unwrap(), Some(big));
        assert_eq!(bins.find_fit(&arena, 700).unwrap(), Some(big));
        assert_eq!(bins.find_fit(&arena, 4096).unwrap(), None);

        // The nearest larger small bin wins over the large bins.
        let small = mark_free(&mut arena, 0, 96);
        bins.insert(&mut arena, small).unwrap();
        assert_eq!(bins.find_fit(&arena, 32).unwrap(), Some(small));
        assert_eq!(bins.find_fit(&arena, 96).unwrap(), Some(small));
        assert_eq!(bins.find_fit(&arena, 112).unwrap(), Some(big));
    }

    #[test]
    fn cycle_in_large_bin_is_detected() {
        let mut arena = arena(4096);
        let mut bins = BinTable::new();
        let a = mark_free(&mut arena, 0, 640);
        let b = mark_free(&mut arena, 1024, 640);
        bins.insert(&mut arena, a).unwrap();
        bins.insert(&mut arena, b).unwrap();
        a.set_next(&mut arena, Some(1024));
        let err = bins.find_fit(&arena, 1000).unwrap_err();
        assert!(matches!(
            err,
            AllocError::Corrupted {
                reason: "free list cycle",
                ..
            }
        ));
    }

    #[test]
    fn walk_reports_broken_back_link() {
        let mut arena = arena(512);
        let mut bins = BinTable::new();
        let a = mark_free(&mut arena, 0, 48);
        let b = mark_free(&mut arena, 96, 48);
        bins.insert(&mut arena, a).unwrap();
        bins.insert(&mut arena, b).unwrap();
        let mut seen = 0;
        bins.walk(&arena, |_, _| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 2);

        a.set_prev(&mut arena, None);
        assert!(bins.walk(&arena, |_, _| Ok(())).is_err());
    }
}
