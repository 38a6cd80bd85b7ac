//! Neighbor merging, absorption and splitting.

use super::bins::BinTable;
use super::chunk::{self, FreeChunk, MIN_CHUNK, UsedChunk, read_predecessor, read_successor};
use super::error::AllocError;
use super::heap::Arena;
use super::system::SystemMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Merged {
    pub chunk: FreeChunk,
    pub merges: usize,
}

/// Merges a just-freed chunk with its free physical neighbors.
///
/// The predecessor is taken first, so the leftmost header survives. The
/// result is tagged free and belongs to no bin.
pub(crate) fn coalesce<M: SystemMemory>(
    arena: &mut Arena<M>,
    bins: &mut BinTable,
    chunk: FreeChunk,
) -> Result<Merged, AllocError> {
    let mut offset = chunk.offset();
    let mut size = chunk.size();
    let mut merges = 0;

    if let Some(prev) = read_predecessor(arena, offset)? {
        bins.remove(arena, prev)?;
        offset = prev.offset();
        size += prev.size();
        merges += 1;
    }
    if let Some(next) = read_successor(arena, chunk.end())? {
        bins.remove(arena, next)?;
        size += next.size();
        merges += 1;
    }

    let chunk = if merges == 0 {
        chunk
    } else {
        chunk::mark_free(arena, offset, size)
    };
    Ok(Merged { chunk, merges })
}

/// Grows `used` in place by taking over its free successor.
///
/// Succeeds only if the combined size reaches `needed`; otherwise nothing
/// changes. The result may be larger than `needed`; callers split it.
pub(crate) fn absorb_successor<M: SystemMemory>(
    arena: &mut Arena<M>,
    bins: &mut BinTable,
    used: UsedChunk,
    needed: usize,
) -> Result<Option<UsedChunk>, AllocError> {
    let Some(next) = read_successor(arena, used.end())? else {
        return Ok(None);
    };
    let combined = used.size() + next.size();
    if combined < needed {
        return Ok(None);
    }
    bins.remove(arena, next)?;
    Ok(Some(chunk::mark_used(arena, used.offset(), combined)))
}

/// Trims `used` to `keep` bytes when the slack can stand as a chunk.
///
/// The slack is merged with a free successor if there is one, then binned.
pub(crate) fn split<M: SystemMemory>(
    arena: &mut Arena<M>,
    bins: &mut BinTable,
    used: UsedChunk,
    keep: usize,
) -> Result<(UsedChunk, Option<FreeChunk>), AllocError> {
    let slack = used.size() - keep;
    if slack < MIN_CHUNK {
        return Ok((used, None));
    }
    let kept = chunk::mark_used(arena, used.offset(), keep);
    let mut rest = chunk::mark_free(arena, kept.end(), slack);
    if let Some(next) = read_successor(arena, rest.end())? {
        bins.remove(arena, next)?;
        rest = chunk::mark_free(arena, rest.offset(), slack + next.size());
    }
    bins.insert(arena, rest)?;
    Ok((kept, Some(rest)))
}
