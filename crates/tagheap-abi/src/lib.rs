// extern "C" exports accept raw pointers from C callers; the contract is the
// usual malloc one and is stated once on each export.
#![allow(clippy::missing_safety_doc)]
//! # tagheap-abi
//!
//! C ABI for the tagheap allocator.
//!
//! This crate produces a `cdylib` exposing `tagheap_malloc`, `tagheap_free`,
//! `tagheap_calloc`, `tagheap_realloc` and `tagheap_malloc_usable_size`. Each
//! call takes one global lock around a single [`tagheap_core::MallocState`]
//! backed by [`os::ProcessMemory`].
//!
//! ```text
//! C caller -> ABI entry (this crate) -> global lock -> core allocator -> OS primitives
//! ```
//!
//! The symbols are prefixed so they never shadow the system allocator, which
//! also keeps them safe to link into test binaries.

pub mod malloc_abi;
pub mod os;
mod state;

pub use malloc_abi::{
    check_heap, drain_lifecycle_logs, heap_stats, tagheap_calloc, tagheap_free, tagheap_malloc,
    tagheap_malloc_usable_size, tagheap_realloc,
};
pub use os::{HeapSource, ProcessMemory};
