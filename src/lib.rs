//! User-space virtual memory manager for the AMD KFD compute stack.
//!
//! The crate mirrors the kernel's view of a process' GPU address space: a set
//! of apertures, each with its own free-range tracker and object registry,
//! plus the orchestration that reserves VA, binds device memory to it and
//! maps it to one or more GPUs.

pub mod error;
pub mod kfd;
pub mod thunk;
pub mod utils;

pub use error::{HsaError, HsaResult};
pub use thunk::memory::MemoryManager;
