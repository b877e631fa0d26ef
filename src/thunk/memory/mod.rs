pub mod aperture;
pub mod flags;
pub mod host;
pub mod interval_tree;
pub mod layout;
pub mod manager;
pub mod object;
pub mod registry;
pub mod vm_area;

#[cfg(test)]
pub(crate) mod testing;

/// A successful allocation or import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// CPU and GPU virtual address, or the opaque id of handle-only memory.
    pub addr: u64,
    /// Page-aligned size in bytes.
    pub size: u64,
    /// KFD handle; zero for VA-only and APU host memory.
    pub handle: u64,
    pub node_id: u32,
}

pub use flags::MemFlags;
pub use layout::Location;
pub use manager::{GraphicsResource, MemoryInfo, MemoryManager, SharedMemory};
