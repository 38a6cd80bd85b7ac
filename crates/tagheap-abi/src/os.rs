//! Process-backed system memory.
//!
//! The heap comes from one of two sources:
//! - `reserve` (default): a private `PROT_NONE` address range reserved up
//!   front and committed with `mprotect` as the heap grows. Nothing else in
//!   the process can move its end.
//! - `brk`: the process break via `sbrk`. If the break moved since our last
//!   extension (another allocator shares it), growth is refused.
//!
//! Oversized blocks use `mmap`/`munmap`, and `mremap` on Linux.

use std::io;
use std::ptr;

use libc::{c_void, intptr_t};
use tagheap_core::config::parse_byte_size;
use tagheap_core::malloc::{OsError, Remapped, SystemMemory};

pub const ENV_HEAP_SOURCE: &str = "TAGHEAP_HEAP_SOURCE";
pub const ENV_HEAP_RESERVE: &str = "TAGHEAP_HEAP_RESERVE";

/// Address space reserved for the heap when nothing else is configured.
pub const DEFAULT_RESERVE: usize = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapSource {
    Brk,
    Reserve { bytes: usize },
}

impl Default for HeapSource {
    fn default() -> Self {
        Self::Reserve {
            bytes: DEFAULT_RESERVE,
        }
    }
}

impl HeapSource {
    /// Parses a source name (case-insensitive). Unknown names yield `None`.
    #[must_use]
    pub fn from_str_loose(name: &str, reserve_bytes: usize) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "brk" | "sbrk" => Some(Self::Brk),
            "reserve" | "reserved" | "mmap" => Some(Self::Reserve {
                bytes: reserve_bytes,
            }),
            _ => None,
        }
    }

    /// Resolves `TAGHEAP_HEAP_SOURCE` and `TAGHEAP_HEAP_RESERVE`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let reserve = lookup(ENV_HEAP_RESERVE)
            .and_then(|raw| parse_byte_size(&raw))
            .filter(|&bytes| bytes > 0)
            .unwrap_or(DEFAULT_RESERVE);
        lookup(ENV_HEAP_SOURCE)
            .and_then(|raw| Self::from_str_loose(&raw, reserve))
            .unwrap_or(Self::Reserve { bytes: reserve })
    }
}

#[derive(Debug)]
enum Backing {
    Brk {
        /// Break after our last extension.
        end: Option<usize>,
    },
    Reserve {
        base: usize,
        len: usize,
        committed: usize,
        used: usize,
    },
}

/// [`SystemMemory`] over the real address space of this process.
#[derive(Debug)]
pub struct ProcessMemory {
    backing: Backing,
    page_size: usize,
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(4096)
}

impl ProcessMemory {
    /// Sets up the heap source. For `Reserve` this reserves the address range.
    ///
    /// # Safety
    ///
    /// The returned value reads and writes raw process memory at whatever
    /// addresses its [`SystemMemory`] methods are given. The caller must only
    /// pass addresses inside the heap or mappings this value handed out,
    /// which [`tagheap_core::MallocState`] guarantees.
    pub unsafe fn new(source: HeapSource) -> Result<Self, OsError> {
        let page_size = page_size();
        let backing = match source {
            HeapSource::Brk => Backing::Brk { end: None },
            HeapSource::Reserve { bytes } => {
                let len = bytes
                    .checked_add(page_size - 1)
                    .map(|n| n & !(page_size - 1))
                    .ok_or(OsError {
                        op: "mmap",
                        errno: libc::ENOMEM,
                    })?;
                // SAFETY: anonymous PROT_NONE mapping; no existing memory is touched.
                let base = unsafe {
                    libc::mmap(
                        ptr::null_mut(),
                        len,
                        libc::PROT_NONE,
                        libc::MAP_PRIVATE | libc::MAP_ANON | map_noreserve(),
                        -1,
                        0,
                    )
                };
                if base == libc::MAP_FAILED {
                    return Err(OsError {
                        op: "mmap",
                        errno: last_errno(),
                    });
                }
                Backing::Reserve {
                    base: base as usize,
                    len,
                    committed: 0,
                    used: 0,
                }
            }
        };
        Ok(Self { backing, page_size })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes still available to the heap, if the source has a fixed size.
    #[must_use]
    pub fn heap_headroom(&self) -> Option<usize> {
        match self.backing {
            Backing::Brk { .. } => None,
            Backing::Reserve { len, used, .. } => Some(len - used),
        }
    }
}

#[cfg(target_os = "linux")]
const fn map_noreserve() -> libc::c_int {
    libc::MAP_NORESERVE
}

#[cfg(not(target_os = "linux"))]
const fn map_noreserve() -> libc::c_int {
    0
}

impl SystemMemory for ProcessMemory {
    fn heap_break(&self) -> usize {
        match self.backing {
            Backing::Brk { end: Some(end) } => end,
            // SAFETY: sbrk(0) only queries the current break.
            Backing::Brk { end: None } => unsafe { libc::sbrk(0) as usize },
            Backing::Reserve { base, used, .. } => base + used,
        }
    }

    fn heap_extend(&mut self, bytes: usize) -> Option<usize> {
        let page_size = self.page_size;
        match &mut self.backing {
            Backing::Brk { end } => {
                let increment = intptr_t::try_from(bytes).ok()?;
                // SAFETY: sbrk(0) only queries the current break.
                let current = unsafe { libc::sbrk(0) } as usize;
                if end.is_some_and(|e| e != current) {
                    return None;
                }
                // SAFETY: growing the break hands us fresh memory; nothing
                // we own is released.
                let previous = unsafe { libc::sbrk(increment) };
                if previous as isize == -1 {
                    return None;
                }
                let start = previous as usize;
                *end = Some(start + bytes);
                Some(start)
            }
            Backing::Reserve {
                base,
                len,
                committed,
                used,
            } => {
                let new_used = used.checked_add(bytes).filter(|&n| n <= *len)?;
                if new_used > *committed {
                    let target = new_used
                        .checked_add(page_size - 1)
                        .map(|n| (n & !(page_size - 1)).min(*len))?;
                    // SAFETY: the range lies inside our own reservation.
                    let rc = unsafe {
                        libc::mprotect(
                            (*base + *committed) as *mut c_void,
                            target - *committed,
                            libc::PROT_READ | libc::PROT_WRITE,
                        )
                    };
                    if rc != 0 {
                        return None;
                    }
                    *committed = target;
                }
                let start = *base + *used;
                *used = new_used;
                Some(start)
            }
        }
    }

    fn map(&mut self, len: usize) -> Option<usize> {
        // SAFETY: fresh anonymous mapping; no existing memory is touched.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        (addr != libc::MAP_FAILED).then_some(addr as usize)
    }

    fn unmap(&mut self, addr: usize, len: usize) -> Result<(), OsError> {
        // SAFETY: the allocator only unmaps mappings created by `map`.
        if unsafe { libc::munmap(addr as *mut c_void, len) } != 0 {
            return Err(OsError {
                op: "munmap",
                errno: last_errno(),
            });
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn remap(&mut self, addr: usize, old_len: usize, new_len: usize) -> Result<Remapped, OsError> {
        // SAFETY: the allocator only remaps mappings created by `map`.
        let moved = unsafe {
            libc::mremap(
                addr as *mut c_void,
                old_len,
                new_len,
                libc::MREMAP_MAYMOVE,
            )
        };
        if moved == libc::MAP_FAILED {
            return Err(OsError {
                op: "mremap",
                errno: last_errno(),
            });
        }
        Ok(Remapped::At(moved as usize))
    }

    #[cfg(not(target_os = "linux"))]
    fn remap(
        &mut self,
        _addr: usize,
        _old_len: usize,
        _new_len: usize,
    ) -> Result<Remapped, OsError> {
        Ok(Remapped::Unsupported)
    }

    fn read_word(&self, addr: usize) -> usize {
        // SAFETY: `addr` lies in memory we own (see `ProcessMemory::new`).
        unsafe { ptr::read_unaligned(addr as *const usize) }
    }

    fn write_word(&mut self, addr: usize, value: usize) {
        // SAFETY: as for `read_word`.
        unsafe { ptr::write_unaligned(addr as *mut usize, value) }
    }

    fn copy(&mut self, dst: usize, src: usize, len: usize) {
        // SAFETY: both ranges lie in memory we own; `ptr::copy` allows overlap.
        unsafe { ptr::copy(src as *const u8, dst as *mut u8, len) }
    }

    fn fill(&mut self, addr: usize, byte: u8, len: usize) {
        // SAFETY: the range lies in memory we own.
        unsafe { ptr::write_bytes(addr as *mut u8, byte, len) }
    }

    fn read_bytes(&self, addr: usize, out: &mut [u8]) {
        // SAFETY: the source lies in memory we own and cannot overlap a Rust slice.
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), out.len()) }
    }

    fn write_bytes(&mut self, addr: usize, data: &[u8]) {
        // SAFETY: as for `read_bytes`.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) }
    }
}

impl Drop for ProcessMemory {
    fn drop(&mut self) {
        // The break is shared with the rest of the process and is never lowered.
        if let Backing::Reserve { base, len, .. } = self.backing {
            // SAFETY: releases the reservation made in `new`; the allocator
            // owning this value is gone.
            unsafe { libc::munmap(base as *mut c_void, len) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn source_defaults_to_reserve() {
        assert_eq!(HeapSource::from_lookup(|_| None), HeapSource::default());
        assert_eq!(
            HeapSource::from_lookup(lookup(&[(ENV_HEAP_SOURCE, "bogus")])),
            HeapSource::default()
        );
    }

    #[test]
    fn source_and_reserve_are_parsed() {
        assert_eq!(
            HeapSource::from_lookup(lookup(&[(ENV_HEAP_SOURCE, "BRK")])),
            HeapSource::Brk
        );
        assert_eq!(
            HeapSource::from_lookup(lookup(&[
                (ENV_HEAP_SOURCE, "reserve"),
                (ENV_HEAP_RESERVE, "64m"),
            ])),
            HeapSource::Reserve { bytes: 64 << 20 }
        );
    }

    #[test]
    fn reserved_heap_commits_on_demand() {
        // SAFETY: only the SystemMemory methods below touch the memory.
        let mut mem = unsafe { ProcessMemory::new(HeapSource::Reserve { bytes: 1 << 20 }) }
            .unwrap();
        let start = mem.heap_break();
        let a = mem.heap_extend(100).unwrap();
        assert_eq!(a, start);
        mem.write_word(a, 0xFEED);
        assert_eq!(mem.read_word(a), 0xFEED);
        let b = mem.heap_extend(mem.page_size() * 3).unwrap();
        assert_eq!(b, a + 100);
        mem.fill(b, 0xAA, mem.page_size() * 3);
        assert!(mem.heap_extend(1 << 20).is_none());
        assert_eq!(mem.heap_headroom(), Some((1 << 20) - 100 - mem.page_size() * 3));
    }

    #[test]
    fn mappings_round_trip_bytes() {
        // SAFETY: only the SystemMemory methods below touch the memory.
        let mut mem = unsafe { ProcessMemory::new(HeapSource::Reserve { bytes: 1 << 16 }) }
            .unwrap();
        let len = mem.page_size() * 2;
        let addr = mem.map(len).unwrap();
        assert_eq!(addr % mem.page_size(), 0);
        mem.write_bytes(addr + 10, b"hello");
        let mut out = [0u8; 5];
        mem.read_bytes(addr + 10, &mut out);
        assert_eq!(&out, b"hello");
        mem.unmap(addr, len).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn mremap_keeps_contents() {
        // SAFETY: only the SystemMemory methods below touch the memory.
        let mut mem = unsafe { ProcessMemory::new(HeapSource::Reserve { bytes: 1 << 16 }) }
            .unwrap();
        let page = mem.page_size();
        let addr = mem.map(page).unwrap();
        mem.write_word(addr, 42);
        let Remapped::At(moved) = mem.remap(addr, page, page * 64).unwrap() else {
            panic!("linux supports mremap");
        };
        assert_eq!(mem.read_word(moved), 42);
        mem.unmap(moved, page * 64).unwrap();
    }
}
