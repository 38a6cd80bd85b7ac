//! Chunk layout and boundary tags.
//!
//! Every heap chunk is laid out as
//!
//! ```text
//! offset          offset+WORD                     offset+size-WORD
//! | header: size|used | payload ...               | footer: size|used |
//!                     | prev link | next link |   (free chunks only)
//! ```
//!
//! Header and footer hold the same encoded [`SizeField`]. Free chunks keep
//! their bin links in the first two payload words. Links are stored as arena
//! offsets plus one so that zero can mean "none" and every decoded link can
//! be bounds-checked against the arena.

use super::error::AllocError;
use super::heap::Arena;
use super::system::SystemMemory;

/// Machine word; the width of a boundary tag and of a link.
pub const WORD: usize = core::mem::size_of::<usize>();
/// Allocation granularity. Chunk sizes and payload addresses are multiples of it.
pub const GRANULE: usize = 16;
/// Header plus footer.
pub const TAG_OVERHEAD: usize = 2 * WORD;
/// Header, two links and footer, rounded to the granularity.
pub const MIN_CHUNK: usize = align_up(4 * WORD);

const USED_BIT: usize = 1;
const PREV_SLOT: usize = WORD;
const NEXT_SLOT: usize = 2 * WORD;

const fn align_up(n: usize) -> usize {
    (n + GRANULE - 1) & !(GRANULE - 1)
}

/// Encoded boundary tag: total chunk size with the low bit as the in-use flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeField(usize);

impl SizeField {
    #[must_use]
    pub const fn used(size: usize) -> Self {
        Self(size | USED_BIT)
    }

    #[must_use]
    pub const fn free(size: usize) -> Self {
        Self(size & !USED_BIT)
    }

    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn size(self) -> usize {
        self.0 & !USED_BIT
    }

    #[must_use]
    pub const fn is_free(self) -> bool {
        self.0 & USED_BIT == 0
    }

    /// Size is a granule multiple of at least [`MIN_CHUNK`].
    #[must_use]
    pub const fn is_well_formed(self) -> bool {
        let size = self.size();
        size >= MIN_CHUNK && size % GRANULE == 0
    }
}

/// Smallest chunk size holding `requested` payload bytes plus both tags.
///
/// Returns `None` if the rounding overflows.
#[must_use]
pub fn round_to_stride(requested: usize) -> Option<usize> {
    let total = requested
        .checked_add(TAG_OVERHEAD)?
        .checked_add(GRANULE - 1)?
        & !(GRANULE - 1);
    Some(total.max(MIN_CHUNK))
}

/// An in-use chunk. Exposes no link accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedChunk {
    offset: usize,
    size: usize,
}

impl UsedChunk {
    #[must_use]
    pub const fn offset(self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn size(self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn end(self) -> usize {
        self.offset + self.size
    }

    #[must_use]
    pub const fn payload_offset(self) -> usize {
        self.offset + WORD
    }

    /// Bytes the caller may use.
    #[must_use]
    pub const fn capacity(self) -> usize {
        self.size - TAG_OVERHEAD
    }
}

/// A free chunk; its payload holds the bin links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeChunk {
    offset: usize,
    size: usize,
}

impl FreeChunk {
    #[must_use]
    pub const fn offset(self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn size(self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn end(self) -> usize {
        self.offset + self.size
    }

    pub fn prev<M: SystemMemory>(self, arena: &Arena<M>) -> Result<Option<usize>, AllocError> {
        decode_link(arena, self.offset, arena.word(self.offset + PREV_SLOT))
    }

    pub fn next<M: SystemMemory>(self, arena: &Arena<M>) -> Result<Option<usize>, AllocError> {
        decode_link(arena, self.offset, arena.word(self.offset + NEXT_SLOT))
    }

    pub fn set_prev<M: SystemMemory>(self, arena: &mut Arena<M>, link: Option<usize>) {
        arena.set_word(self.offset + PREV_SLOT, encode_link(link));
    }

    pub fn set_next<M: SystemMemory>(self, arena: &mut Arena<M>, link: Option<usize>) {
        arena.set_word(self.offset + NEXT_SLOT, encode_link(link));
    }
}

/// A validated chunk of either state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    Used(UsedChunk),
    Free(FreeChunk),
}

impl Chunk {
    #[must_use]
    pub const fn offset(self) -> usize {
        match self {
            Self::Used(c) => c.offset,
            Self::Free(c) => c.offset,
        }
    }

    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Used(c) => c.size,
            Self::Free(c) => c.size,
        }
    }

    #[must_use]
    pub const fn end(self) -> usize {
        self.offset() + self.size()
    }
}

fn encode_link(link: Option<usize>) -> usize {
    link.map_or(0, |offset| offset + 1)
}

fn decode_link<M: SystemMemory>(
    arena: &Arena<M>,
    owner: usize,
    raw: usize,
) -> Result<Option<usize>, AllocError> {
    if raw == 0 {
        return Ok(None);
    }
    let offset = raw - 1;
    let in_bounds = offset
        .checked_add(MIN_CHUNK)
        .is_some_and(|end| end <= arena.len());
    if offset % GRANULE != 0 || !in_bounds {
        return Err(corrupted(arena, owner, "free-list link outside heap"));
    }
    Ok(Some(offset))
}

pub(crate) fn corrupted<M: SystemMemory>(
    arena: &Arena<M>,
    offset: usize,
    reason: &'static str,
) -> AllocError {
    AllocError::Corrupted {
        addr: arena.address_of(offset),
        reason,
    }
}

/// Reads and validates the chunk whose header sits at `offset`.
pub fn read_chunk<M: SystemMemory>(arena: &Arena<M>, offset: usize) -> Result<Chunk, AllocError> {
    let fits = offset
        .checked_add(MIN_CHUNK)
        .is_some_and(|end| end <= arena.len());
    if offset % GRANULE != 0 || !fits {
        return Err(corrupted(arena, offset, "chunk offset outside heap"));
    }
    let header = SizeField::from_raw(arena.word(offset));
    let size = header.size();
    if !header.is_well_formed() || size > arena.len() - offset {
        return Err(corrupted(arena, offset, "chunk size out of range"));
    }
    if arena.word(offset + size - WORD) != header.raw() {
        return Err(corrupted(arena, offset, "header and footer disagree"));
    }
    Ok(if header.is_free() {
        Chunk::Free(FreeChunk { offset, size })
    } else {
        Chunk::Used(UsedChunk { offset, size })
    })
}

/// Reads a chunk that a free list or boundary tag claims is free.
pub fn read_free<M: SystemMemory>(
    arena: &Arena<M>,
    offset: usize,
) -> Result<FreeChunk, AllocError> {
    match read_chunk(arena, offset)? {
        Chunk::Free(chunk) => Ok(chunk),
        Chunk::Used(_) => Err(corrupted(arena, offset, "free list holds a used chunk")),
    }
}

/// The physical predecessor of the chunk at `offset`, if it is free.
///
/// Reads the footer just before `offset`; the first chunk has no predecessor.
pub fn read_predecessor<M: SystemMemory>(
    arena: &Arena<M>,
    offset: usize,
) -> Result<Option<FreeChunk>, AllocError> {
    if offset == 0 {
        return Ok(None);
    }
    let footer = SizeField::from_raw(arena.word(offset - WORD));
    if !footer.is_free() {
        return Ok(None);
    }
    if !footer.is_well_formed() || footer.size() > offset {
        return Err(corrupted(arena, offset, "predecessor footer out of range"));
    }
    read_free(arena, offset - footer.size()).map(Some)
}

/// The physical successor of a chunk ending at `end`, if it is free.
///
/// The last chunk has no successor.
pub fn read_successor<M: SystemMemory>(
    arena: &Arena<M>,
    end: usize,
) -> Result<Option<FreeChunk>, AllocError> {
    if end >= arena.len() {
        return Ok(None);
    }
    match read_chunk(arena, end)? {
        Chunk::Free(chunk) => Ok(Some(chunk)),
        Chunk::Used(_) => Ok(None),
    }
}

/// Writes used tags for `[offset, offset + size)`.
pub fn mark_used<M: SystemMemory>(arena: &mut Arena<M>, offset: usize, size: usize) -> UsedChunk {
    let tag = SizeField::used(size).raw();
    arena.set_word(offset, tag);
    arena.set_word(offset + size - WORD, tag);
    UsedChunk { offset, size }
}

/// Writes free tags for `[offset, offset + size)`. Links are left untouched.
pub fn mark_free<M: SystemMemory>(arena: &mut Arena<M>, offset: usize, size: usize) -> FreeChunk {
    let tag = SizeField::free(size).raw();
    arena.set_word(offset, tag);
    arena.set_word(offset + size - WORD, tag);
    FreeChunk { offset, size }
}
