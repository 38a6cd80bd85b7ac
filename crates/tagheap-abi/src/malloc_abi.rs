//! ABI layer for the allocation functions.
//!
//! Recoverable failures return null and set `errno` to `ENOMEM` (a zero-size
//! request returns null without touching `errno`). Fatal failures (double
//! free, invalid pointer, heap corruption, a failed `munmap`/`mremap`) print
//! a diagnostic to stderr and abort the process: the heap can no longer be
//! trusted.

use std::ffi::{c_int, c_void};

use tagheap_core::malloc::{AllocError, AllocatorLogRecord, HeapCheck, HeapStats};

use crate::state::with_heap;

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_errno(value: c_int) {
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe { *libc::__errno_location() = value };
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn set_errno(value: c_int) {
    // SAFETY: __error returns this thread's errno slot.
    unsafe { *libc::__error() = value };
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn set_errno(_value: c_int) {}

fn abort_on(symbol: &str, err: &AllocError) -> ! {
    eprintln!("tagheap: {symbol}: {err}; aborting");
    std::process::abort()
}

/// Maps a failed call to its C result: abort if fatal, else null + errno.
fn failed(symbol: &str, err: &AllocError) -> *mut c_void {
    if err.is_fatal() {
        abort_on(symbol, err);
    }
    if !matches!(err, AllocError::ZeroSize) {
        set_errno(libc::ENOMEM);
    }
    std::ptr::null_mut()
}

fn unavailable() -> *mut c_void {
    set_errno(libc::ENOMEM);
    std::ptr::null_mut()
}

// ---------------------------------------------------------------------------
// malloc
// ---------------------------------------------------------------------------

/// Allocates `size` bytes of uninitialized, 16-byte aligned memory.
///
/// Returns null for `size == 0` or when memory is exhausted.
///
/// # Safety
///
/// The returned pointer must be released exactly once with `tagheap_free`
/// or `tagheap_realloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tagheap_malloc(size: usize) -> *mut c_void {
    match with_heap(|heap| heap.malloc(size)) {
        Some(Ok(addr)) => addr as *mut c_void,
        Some(Err(err)) => failed("tagheap_malloc", &err),
        None => unavailable(),
    }
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

/// Releases memory returned by this allocator. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator. Freeing twice
/// aborts when detected.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tagheap_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    if let Some(Err(err)) = with_heap(|heap| heap.free(ptr as usize)) {
        abort_on("tagheap_free", &err);
    }
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

/// Allocates `nmemb * size` zeroed bytes; null on overflow or exhaustion.
///
/// # Safety
///
/// As for [`tagheap_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tagheap_calloc(nmemb: usize, size: usize) -> *mut c_void {
    match with_heap(|heap| heap.calloc(nmemb, size)) {
        Some(Ok(addr)) => addr as *mut c_void,
        Some(Err(err)) => failed("tagheap_calloc", &err),
        None => unavailable(),
    }
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

/// Resizes `ptr` to `size` bytes, moving it if needed.
///
/// A null `ptr` behaves as `tagheap_malloc(size)`. A zero `size` frees
/// `ptr` and returns null. On exhaustion returns null and `ptr` stays valid.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator. After a
/// non-null return the old pointer must not be used.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tagheap_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    match with_heap(|heap| heap.realloc(ptr as usize, size)) {
        Some(Ok(Some(addr))) => addr as *mut c_void,
        Some(Ok(None)) => std::ptr::null_mut(),
        Some(Err(err)) => failed("tagheap_realloc", &err),
        None => unavailable(),
    }
}

// ---------------------------------------------------------------------------
// malloc_usable_size
// ---------------------------------------------------------------------------

/// Usable bytes behind `ptr`; zero for null.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tagheap_malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    match with_heap(|heap| heap.usable_size(ptr as usize)) {
        Some(Ok(size)) => size,
        Some(Err(err)) => abort_on("tagheap_malloc_usable_size", &err),
        None => 0,
    }
}

// ---------------------------------------------------------------------------
// Rust-side introspection
// ---------------------------------------------------------------------------

/// Counters of the global allocator; `None` if it could not be set up.
#[must_use]
pub fn heap_stats() -> Option<HeapStats> {
    with_heap(|heap| heap.stats())
}

/// Runs the full heap consistency walk on the global allocator.
pub fn check_heap() -> Option<Result<HeapCheck, AllocError>> {
    with_heap(|heap| heap.check_heap())
}

/// Takes the lifecycle records accumulated by the global allocator.
#[must_use]
pub fn drain_lifecycle_logs() -> Vec<AllocatorLogRecord> {
    with_heap(|heap| heap.drain_lifecycle_logs()).unwrap_or_default()
}
