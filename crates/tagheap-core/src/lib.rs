//! # tagheap-core
//!
//! Safe Rust core of a boundary-tag heap allocator.
//!
//! The allocator carves chunks out of a contiguous heap obtained through a
//! heap-extend primitive, files free chunks into segregated size-class bins,
//! merges free neighbors on release, and serves oversized requests from
//! independent anonymous mappings. All raw memory access goes through the
//! [`malloc::SystemMemory`] seam, so this crate contains no `unsafe` code;
//! the ABI crate supplies the process-backed implementation.

#![deny(unsafe_code)]

pub mod config;
pub mod malloc;

pub use config::AllocatorConfig;
pub use malloc::{AllocError, MallocState, SimulatedMemory, SystemMemory};
