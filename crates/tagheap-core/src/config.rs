//! Allocator configuration.
//!
//! Values come from the environment:
//! - `TAGHEAP_MMAP_THRESHOLD`: rounded chunk sizes above this many bytes are
//!   served by independent mappings (default 128 KiB; `k`/`m` suffixes accepted).
//! - `TAGHEAP_LOG_LEVEL`: minimum lifecycle record level (`trace` .. `error`,
//!   default `info`).
//! - `TAGHEAP_LOG_CAPACITY`: records kept in the lifecycle ring (default 1024,
//!   `0` disables logging).
//!
//! Malformed values fall back to the defaults rather than failing startup.

use crate::malloc::chunk::MIN_CHUNK;
use crate::malloc::lifecycle::AllocatorLogLevel;

pub const ENV_MMAP_THRESHOLD: &str = "TAGHEAP_MMAP_THRESHOLD";
pub const ENV_LOG_LEVEL: &str = "TAGHEAP_LOG_LEVEL";
pub const ENV_LOG_CAPACITY: &str = "TAGHEAP_LOG_CAPACITY";

pub const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Largest chunk size served from the heap.
    pub mmap_threshold: usize,
    pub log_level: AllocatorLogLevel,
    pub log_capacity: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            log_level: AllocatorLogLevel::Info,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl AllocatorConfig {
    /// Reads the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves the configuration through `lookup`, one call per variable.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            mmap_threshold: lookup(ENV_MMAP_THRESHOLD)
                .and_then(|raw| parse_byte_size(&raw))
                .filter(|&bytes| bytes >= MIN_CHUNK)
                .unwrap_or(defaults.mmap_threshold),
            log_level: lookup(ENV_LOG_LEVEL)
                .and_then(|raw| AllocatorLogLevel::from_str_loose(&raw))
                .unwrap_or(defaults.log_level),
            log_capacity: lookup(ENV_LOG_CAPACITY)
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(defaults.log_capacity),
        }
    }

    #[must_use]
    pub fn with_mmap_threshold(mut self, bytes: usize) -> Self {
        self.mmap_threshold = bytes;
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: AllocatorLogLevel) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }
}

/// Parses `4096`, `64k`, `2M` and the like. Suffixes are binary multiples.
#[must_use]
pub fn parse_byte_size(raw: &str) -> Option<usize> {
    let lowered = raw.trim().to_ascii_lowercase();
    let raw = lowered.strip_suffix('b').unwrap_or(lowered.as_str());
    let (digits, shift) = match raw.as_bytes().last()? {
        b'k' => (&raw[..raw.len() - 1], 10),
        b'm' => (&raw[..raw.len() - 1], 20),
        b'g' => (&raw[..raw.len() - 1], 30),
        _ => (raw, 0),
    };
    let value: usize = digits.trim().parse().ok()?;
    value.checked_mul(1usize.checked_shl(shift)?)
}
