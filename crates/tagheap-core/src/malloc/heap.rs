//! Contiguous heap arena.
//!
//! The arena owns every byte from its start to the current heap break and
//! addresses them by offset. Its first header is placed so that payloads
//! (header + one word) land on the allocation granularity.

use super::chunk::{self, GRANULE, MIN_CHUNK, UsedChunk, WORD};
use super::error::AllocError;
use super::system::SystemMemory;

#[derive(Debug)]
pub struct Arena<M> {
    memory: M,
    start: Option<usize>,
    len: usize,
    extensions: usize,
}

impl<M: SystemMemory> Arena<M> {
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            start: None,
            len: 0,
            extensions: 0,
        }
    }

    /// Managed bytes, from the first header to the heap break.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first chunk header, once the heap has grown.
    #[must_use]
    pub fn base(&self) -> Option<usize> {
        self.start
    }

    #[must_use]
    pub fn extensions(&self) -> usize {
        self.extensions
    }

    #[must_use]
    pub fn address_of(&self, offset: usize) -> usize {
        self.start.unwrap_or(0) + offset
    }

    #[must_use]
    pub fn word(&self, offset: usize) -> usize {
        self.memory.read_word(self.address_of(offset))
    }

    pub fn set_word(&mut self, offset: usize, value: usize) {
        let addr = self.address_of(offset);
        self.memory.write_word(addr, value);
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// Header offset of the chunk whose payload starts at `addr`.
    ///
    /// Returns `None` for any address that cannot be a heap payload.
    #[must_use]
    pub fn chunk_of_payload(&self, addr: usize) -> Option<usize> {
        let start = self.start?;
        let offset = addr.checked_sub(start)?.checked_sub(WORD)?;
        let fits = offset
            .checked_add(MIN_CHUNK)
            .is_some_and(|end| end <= self.len);
        (offset % GRANULE == 0 && fits).then_some(offset)
    }

    /// Whether the chunk ending at `end` is the last one in the heap.
    #[must_use]
    pub fn is_last(&self, end: usize) -> bool {
        end == self.len
    }

    /// Extends the heap by `bytes` and returns the offset of the new region.
    ///
    /// The first extension adds padding in front so the first payload is
    /// granule-aligned; later extensions must continue exactly at the
    /// current end, anything else is reported as corruption.
    pub fn grow(&mut self, bytes: usize) -> Result<usize, AllocError> {
        let exhausted = AllocError::Exhausted { requested: bytes };
        let offset = self.len;
        let new_len = self.len.checked_add(bytes).ok_or(exhausted.clone())?;
        match self.start {
            Some(start) => {
                let addr = self.memory.heap_extend(bytes).ok_or(exhausted)?;
                if addr != start + self.len {
                    return Err(AllocError::Corrupted {
                        addr,
                        reason: "heap extension is not contiguous",
                    });
                }
            }
            None => {
                let brk = self.memory.heap_break();
                let pad = (2 * GRANULE - WORD - brk % GRANULE) % GRANULE;
                let total = bytes.checked_add(pad).ok_or(exhausted.clone())?;
                let addr = self.memory.heap_extend(total).ok_or(exhausted.clone())?;
                // Someone else moved the break between the two calls; the
                // padding no longer lines up, so give the bytes up.
                if addr != brk {
                    return Err(exhausted);
                }
                self.start = Some(addr + pad);
            }
        }
        self.len = new_len;
        self.extensions += 1;
        Ok(offset)
    }

    /// Extends the heap by exactly `size` bytes and formats them as one used chunk.
    pub fn grow_chunk(&mut self, size: usize) -> Result<UsedChunk, AllocError> {
        let offset = self.grow(size)?;
        Ok(chunk::mark_used(self, offset, size))
    }

    /// Enlarges the last chunk of the heap to `new_size` by extending the heap.
    pub fn grow_in_place(
        &mut self,
        used: UsedChunk,
        new_size: usize,
    ) -> Result<UsedChunk, AllocError> {
        debug_assert!(self.is_last(used.end()) && new_size > used.size());
        self.grow(new_size - used.size())?;
        Ok(chunk::mark_used(self, used.offset(), new_size))
    }
}
