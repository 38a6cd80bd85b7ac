//! Integration tests for the exported allocation functions.

use std::ffi::c_void;
use std::process::Command;
use std::ptr;

use tagheap_abi::{
    check_heap, heap_stats, tagheap_calloc, tagheap_free, tagheap_malloc,
    tagheap_malloc_usable_size, tagheap_realloc,
};

const ABORT_CHILD_ENV: &str = "TAGHEAP_ABI_TEST_ABORT_CHILD";

#[cfg(target_os = "linux")]
fn errno() -> i32 {
    // SAFETY: reads this thread's errno slot.
    unsafe { *libc::__errno_location() }
}

#[cfg(target_os = "linux")]
fn clear_errno() {
    // SAFETY: writes this thread's errno slot.
    unsafe { *libc::__errno_location() = 0 };
}

#[test]
fn malloc_round_trips_and_aligns() {
    // SAFETY: every pointer is used within its allocation and freed once.
    unsafe {
        let p = tagheap_malloc(100).cast::<u8>();
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);
        for i in 0..100 {
            p.add(i).write(i as u8);
        }
        for i in 0..100 {
            assert_eq!(p.add(i).read(), i as u8);
        }
        assert!(tagheap_malloc_usable_size(p.cast()) >= 100);
        tagheap_free(p.cast());
    }
    check_heap().unwrap().unwrap();
}

#[test]
fn malloc_zero_returns_null() {
    // SAFETY: a null result needs no cleanup.
    let p = unsafe { tagheap_malloc(0) };
    assert!(p.is_null());
}

#[test]
fn free_null_is_a_no_op() {
    // SAFETY: null is always accepted.
    unsafe { tagheap_free(ptr::null_mut()) };
    assert_eq!(unsafe { tagheap_malloc_usable_size(ptr::null_mut()) }, 0);
}

#[test]
fn calloc_returns_zeroed_memory() {
    // SAFETY: pointers stay within their allocations and are freed once.
    unsafe {
        let dirty = tagheap_malloc(400).cast::<u8>();
        ptr::write_bytes(dirty, 0xCD, 400);
        tagheap_free(dirty.cast());

        let p = tagheap_calloc(100, 4).cast::<u8>();
        assert!(!p.is_null());
        let bytes = std::slice::from_raw_parts(p, 400);
        assert!(bytes.iter().all(|&b| b == 0));
        tagheap_free(p.cast());
    }
}

#[cfg(target_os = "linux")]
#[test]
fn calloc_overflow_sets_enomem() {
    clear_errno();
    // SAFETY: a null result needs no cleanup.
    let p = unsafe { tagheap_calloc(usize::MAX, 16) };
    assert!(p.is_null());
    assert_eq!(errno(), libc::ENOMEM);
}

#[test]
fn realloc_preserves_prefix() {
    // SAFETY: pointers stay within their allocations; the old pointer is not
    // touched after a successful realloc.
    unsafe {
        let p = tagheap_malloc(8).cast::<u8>();
        let fence = tagheap_malloc(8);
        ptr::copy_nonoverlapping(b"ABCDEFGH".as_ptr(), p, 8);
        let q = tagheap_realloc(p.cast(), 4096).cast::<u8>();
        assert!(!q.is_null());
        assert_eq!(std::slice::from_raw_parts(q, 8), b"ABCDEFGH");
        q.add(4095).write(1);
        tagheap_free(q.cast());
        tagheap_free(fence);
    }
}

#[test]
fn realloc_null_and_zero() {
    // SAFETY: the block from realloc(NULL) is released by realloc(p, 0).
    unsafe {
        let p = tagheap_realloc(ptr::null_mut(), 64);
        assert!(!p.is_null());
        assert!(tagheap_realloc(p, 0).is_null());
    }
}

#[test]
fn large_block_is_mapped_outside_the_heap() {
    // SAFETY: the block is written within bounds and freed once.
    unsafe {
        let size = 10 * 1024 * 1024;
        let p = tagheap_malloc(size).cast::<u8>();
        assert!(!p.is_null());
        p.write(1);
        p.add(size - 1).write(2);
        assert!(tagheap_malloc_usable_size(p.cast()) >= size);
        let stats = heap_stats().unwrap();
        assert!(stats.mapped_blocks >= 1);
        tagheap_free(p.cast());
    }
}

#[test]
fn many_threads_share_one_heap() {
    let handles: Vec<_> = (0..4)
        .map(|t| {
            std::thread::spawn(move || {
                let mut live: Vec<*mut c_void> = Vec::new();
                for i in 0..500usize {
                    // SAFETY: each block is written within bounds and freed once.
                    unsafe {
                        let size = 1 + (i * 37 + t * 11) % 700;
                        let p = tagheap_malloc(size);
                        assert!(!p.is_null());
                        ptr::write_bytes(p.cast::<u8>(), t as u8, size);
                        live.push(p);
                        if i % 3 == 0 {
                            tagheap_free(live.swap_remove(0));
                        }
                    }
                }
                for p in live {
                    // SAFETY: freed once.
                    unsafe { tagheap_free(p) };
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    check_heap().unwrap().unwrap();
}

#[test]
fn double_free_aborts_the_process() {
    if std::env::var_os(ABORT_CHILD_ENV).is_some() {
        // SAFETY: deliberately frees twice; the allocator must abort.
        unsafe {
            let p = tagheap_malloc(32);
            tagheap_free(p);
            tagheap_free(p);
        }
        return;
    }

    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args(["--exact", "double_free_aborts_the_process", "--nocapture"])
        .env(ABORT_CHILD_ENV, "1")
        .output()
        .unwrap();
    assert!(!output.status.success());
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("double free"), "stderr: {stderr}");
}
