//! Oversized allocations served by independent mappings.
//!
//! Each block is one anonymous mapping whose first word records the mapped
//! length; the payload starts one [`MAPPED_HEADER`] past the base so it keeps
//! the heap's alignment. The registry is the source of truth for which
//! addresses are live mappings. The header word is cross-checked on release.

use std::collections::{HashMap, VecDeque};

use super::chunk::GRANULE;
use super::error::AllocError;
use super::system::{ENOMEM, Remapped, SystemMemory};

/// Bytes in front of a mapped payload.
pub const MAPPED_HEADER: usize = GRANULE;

const RECENTLY_UNMAPPED_CAPACITY: usize = 1024;

/// A live oversized block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedBlock {
    pub base: usize,
    /// Length passed to the mapping primitive (header included).
    pub mapped_len: usize,
    /// Bytes the caller asked for.
    pub user_size: usize,
}

impl MappedBlock {
    #[must_use]
    pub const fn payload(&self) -> usize {
        self.base + MAPPED_HEADER
    }

    /// Usable payload bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.mapped_len - MAPPED_HEADER
    }
}

#[derive(Debug, Default)]
pub struct MappedRegistry {
    live: HashMap<usize, MappedBlock>,
    total_mapped: usize,
    recently_unmapped: VecDeque<usize>,
}

fn mapped_len(user_size: usize) -> Result<usize, AllocError> {
    user_size
        .checked_add(MAPPED_HEADER)
        .ok_or(AllocError::Exhausted {
            requested: user_size,
        })
}

impl MappedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn total_mapped(&self) -> usize {
        self.total_mapped
    }

    pub fn lookup(&self, payload: usize) -> Option<MappedBlock> {
        self.live.get(&payload).copied()
    }

    pub fn was_unmapped(&self, payload: usize) -> bool {
        self.recently_unmapped.contains(&payload)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &MappedBlock> {
        self.live.values()
    }

    /// Maps a block for `user_size` payload bytes and records it.
    pub fn map<M: SystemMemory>(
        &mut self,
        memory: &mut M,
        user_size: usize,
    ) -> Result<MappedBlock, AllocError> {
        let len = mapped_len(user_size)?;
        let base = memory.map(len).ok_or(AllocError::Exhausted {
            requested: user_size,
        })?;
        memory.write_word(base, len);
        let block = MappedBlock {
            base,
            mapped_len: len,
            user_size,
        };
        self.register(block);
        Ok(block)
    }

    /// Unmaps the block at `payload`, which must be live.
    pub fn unmap<M: SystemMemory>(
        &mut self,
        memory: &mut M,
        payload: usize,
    ) -> Result<MappedBlock, AllocError> {
        let block = self.checked(memory, payload)?;
        memory
            .unmap(block.base, block.mapped_len)
            .map_err(|err| AllocError::MappingFault {
                op: err.op,
                addr: payload,
                errno: err.errno,
            })?;
        self.forget(payload);
        self.recently_unmapped.push_back(payload);
        if self.recently_unmapped.len() > RECENTLY_UNMAPPED_CAPACITY {
            self.recently_unmapped.pop_front();
        }
        Ok(block)
    }

    /// Resizes the block at `payload` with the remap primitive.
    ///
    /// `Ok(None)` means the platform has no remap; the block is unchanged.
    /// A refused resize (`ENOMEM`) is exhaustion and also leaves the block.
    pub fn remap<M: SystemMemory>(
        &mut self,
        memory: &mut M,
        payload: usize,
        user_size: usize,
    ) -> Result<Option<MappedBlock>, AllocError> {
        let block = self.checked(memory, payload)?;
        let len = mapped_len(user_size)?;
        let base = match memory.remap(block.base, block.mapped_len, len) {
            Ok(Remapped::At(base)) => base,
            Ok(Remapped::Unsupported) => return Ok(None),
            // The old mapping survives a refused resize.
            Err(err) if err.errno == ENOMEM => {
                return Err(AllocError::Exhausted {
                    requested: user_size,
                });
            }
            Err(err) => {
                return Err(AllocError::MappingFault {
                    op: err.op,
                    addr: payload,
                    errno: err.errno,
                });
            }
        };
        memory.write_word(base, len);
        self.forget(payload);
        let moved = MappedBlock {
            base,
            mapped_len: len,
            user_size,
        };
        self.register(moved);
        Ok(Some(moved))
    }

    fn register(&mut self, block: MappedBlock) {
        self.total_mapped += block.mapped_len;
        self.recently_unmapped.retain(|&p| p != block.payload());
        self.live.insert(block.payload(), block);
    }

    fn forget(&mut self, payload: usize) {
        if let Some(block) = self.live.remove(&payload) {
            self.total_mapped -= block.mapped_len;
        }
    }

    fn checked<M: SystemMemory>(
        &self,
        memory: &M,
        payload: usize,
    ) -> Result<MappedBlock, AllocError> {
        let block = self
            .lookup(payload)
            .ok_or(AllocError::InvalidPointer { addr: payload })?;
        if memory.read_word(block.base) != block.mapped_len {
            return Err(AllocError::Corrupted {
                addr: payload,
                reason: "mapped block header overwritten",
            });
        }
        Ok(block)
    }
}
