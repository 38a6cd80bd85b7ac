//! Allocator error taxonomy.
//!
//! Recoverable conditions (exhaustion, invalid arguments) leave the heap
//! untouched and map to a null return at the ABI. Fatal conditions mean the
//! heap metadata can no longer be trusted; the ABI aborts on them, and a
//! caller of the core that keeps going after one does so unsoundly.

use thiserror::Error;

/// Whether the allocator may keep serving requests after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// State is intact; the request simply failed.
    Recoverable,
    /// Heap metadata or the environment is compromised.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// `malloc(0)` and friends.
    #[error("zero-byte allocation request")]
    ZeroSize,

    /// `count * elem_size` does not fit in a `usize`.
    #[error("allocation size overflows: {count} x {elem_size} bytes")]
    SizeOverflow { count: usize, elem_size: usize },

    /// The operating system refused to extend the heap or create a mapping.
    #[error("out of memory: {requested} bytes could not be obtained")]
    Exhausted { requested: usize },

    /// The block was already released.
    #[error("double free of {addr:#x}")]
    DoubleFree { addr: usize },

    /// The address was never handed out by this allocator.
    #[error("{addr:#x} is not a live allocation of this heap")]
    InvalidPointer { addr: usize },

    /// Boundary tags or free-list links failed validation.
    #[error("heap corruption at {addr:#x}: {reason}")]
    Corrupted { addr: usize, reason: &'static str },

    /// A bounded payload access ran past the block's capacity.
    #[error("access of {len} bytes at {addr:#x} exceeds payload capacity {capacity}")]
    PayloadOverrun {
        addr: usize,
        len: usize,
        capacity: usize,
    },

    /// `munmap`/`mremap` failed on an oversized block.
    #[error("{op} failed for mapping at {addr:#x} (errno {errno})")]
    MappingFault {
        op: &'static str,
        addr: usize,
        errno: i32,
    },
}

impl AllocError {
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::ZeroSize
            | Self::SizeOverflow { .. }
            | Self::Exhausted { .. }
            | Self::PayloadOverrun { .. } => Severity::Recoverable,
            Self::DoubleFree { .. }
            | Self::InvalidPointer { .. }
            | Self::Corrupted { .. }
            | Self::MappingFault { .. } => Severity::Fatal,
        }
    }

    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.severity(), Severity::Fatal)
    }

    /// Short machine-readable label used as the lifecycle event name.
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::ZeroSize => "zero_size",
            Self::SizeOverflow { .. } => "size_overflow",
            Self::Exhausted { .. } => "exhausted",
            Self::DoubleFree { .. } => "double_free_detected",
            Self::InvalidPointer { .. } => "invalid_pointer",
            Self::Corrupted { .. } => "corruption_detected",
            Self::PayloadOverrun { .. } => "payload_overrun",
            Self::MappingFault { .. } => "mapping_fault",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_arguments_are_recoverable() {
        assert!(!AllocError::ZeroSize.is_fatal());
        assert!(!AllocError::Exhausted { requested: 64 }.is_fatal());
        assert!(
            !AllocError::SizeOverflow {
                count: usize::MAX,
                elem_size: 2
            }
            .is_fatal()
        );
    }

    #[test]
    fn corruption_class_is_fatal() {
        assert!(AllocError::DoubleFree { addr: 0x1010 }.is_fatal());
        assert!(AllocError::InvalidPointer { addr: 0xdead }.is_fatal());
        assert!(
            AllocError::MappingFault {
                op: "munmap",
                addr: 0x1000,
                errno: 22
            }
            .is_fatal()
        );
    }

    #[test]
    fn display_includes_address() {
        let err = AllocError::DoubleFree { addr: 0x1010 };
        assert_eq!(err.to_string(), "double free of 0x1010");
        assert_eq!(err.event(), "double_free_detected");
    }
}
