//! Memory allocation.
//!
//! Implements the malloc family over a boundary-tagged heap:
//! - Chunk sizes up to the mapping threshold: carved from the contiguous heap,
//!   recycled through segregated size-class bins, coalesced on free
//! - Larger requests: served by independent anonymous mappings

pub mod allocator;
pub mod bins;
pub mod chunk;
mod coalesce;
pub mod error;
pub mod heap;
pub mod lifecycle;
pub mod mapped;
pub mod system;

pub use allocator::{HeapCheck, HeapStats, MallocState};
pub use bins::BinIndex;
pub use chunk::{GRANULE, MIN_CHUNK, SizeField, round_to_stride};
pub use error::{AllocError, Severity};
pub use lifecycle::{AllocatorLogLevel, AllocatorLogRecord};
pub use mapped::MappedBlock;
pub use system::{OsError, Remapped, SimulatedMemory, SystemMemory};
