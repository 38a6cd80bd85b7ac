//! The process-wide allocator instance.
//!
//! One [`MallocState`] lives behind one lock. It is created on first use
//! from the environment (`TAGHEAP_*` variables); if the heap source cannot be
//! set up, every call sees `None` and the exports report out-of-memory.

use parking_lot::{Mutex, const_mutex};
use tagheap_core::{AllocatorConfig, MallocState};

use crate::os::{HeapSource, ProcessMemory};

static HEAP: Mutex<Option<MallocState<ProcessMemory>>> = const_mutex(None);

/// Runs `f` on the global allocator, initializing it if needed.
pub(crate) fn with_heap<R>(f: impl FnOnce(&mut MallocState<ProcessMemory>) -> R) -> Option<R> {
    let mut guard = HEAP.lock();
    if guard.is_none() {
        // SAFETY: the memory is handed only to this MallocState, which
        // accesses nothing outside its own heap and mappings.
        let memory = unsafe { ProcessMemory::new(HeapSource::from_env()) }.ok()?;
        *guard = Some(MallocState::with_config(memory, AllocatorConfig::from_env()));
    }
    guard.as_mut().map(f)
}
