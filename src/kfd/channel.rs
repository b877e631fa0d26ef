//! The requests the memory manager issues to the kernel driver.
//!
//! [`DeviceChannel`] is the seam between the aperture bookkeeping and the
//! driver. [`KfdDevice`](crate::kfd::device::KfdDevice) implements it with
//! real ioctls; tests substitute a recording fake.

use crate::kfd::ioctl::SvmAttribute;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverVersion {
    pub major: u32,
    pub minor: u32,
}

/// Per-GPU VA windows as reported by the driver for this process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceApertures {
    pub gpu_id: u32,
    pub lds_base: u64,
    pub lds_limit: u64,
    pub scratch_base: u64,
    pub scratch_limit: u64,
    pub gpuvm_base: u64,
    pub gpuvm_limit: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub gpu_id: u32,
    pub va: u64,
    pub size: u64,
    /// Wire-level `KFD_IOC_ALLOC_MEM_FLAGS_*` bits.
    pub flags: u32,
    /// Input for userptr allocations: the host address being registered.
    pub mmap_offset: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Allocated {
    pub handle: u64,
    pub mmap_offset: u64,
}

/// Result of a map or unmap fan-out.
///
/// The driver processes the device list in order and stops at the first
/// failure, so the first `n_success` ids are the ones that took effect.
#[derive(Debug)]
pub struct FanOut {
    pub n_success: usize,
    pub error: Option<io::Error>,
}

impl FanOut {
    #[must_use]
    pub const fn complete(n: usize) -> Self {
        Self {
            n_success: n,
            error: None,
        }
    }

    /// The ids, out of `ids`, the request took effect on.
    #[must_use]
    pub fn succeeded<'a>(&self, ids: &'a [u32]) -> &'a [u32] {
        &ids[..self.n_success.min(ids.len())]
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPolicy {
    pub gpu_id: u32,
    pub default_policy: u32,
    pub alt_policy: u32,
    pub alt_base: u64,
    pub alt_size: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportedHandle {
    pub handle: u64,
    pub mmap_offset: u64,
    pub flags: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DmabufInfo {
    pub size: u64,
    pub gpu_id: u32,
    pub flags: u32,
    pub metadata: Vec<u8>,
}

pub trait DeviceChannel: Send + Sync {
    /// A channel owned by the calling process. The driver refuses requests
    /// on a channel inherited across `fork()`.
    fn reopen(self: Arc<Self>) -> io::Result<Arc<dyn DeviceChannel>>;

    fn version(&self) -> io::Result<DriverVersion>;

    fn process_apertures(&self, num_nodes: u32) -> io::Result<Vec<DeviceApertures>>;

    fn acquire_vm(&self, gpu_id: u32, drm_fd: RawFd) -> io::Result<()>;

    fn set_memory_policy(&self, policy: &MemoryPolicy) -> io::Result<()>;

    fn set_scratch_backing_va(&self, gpu_id: u32, va: u64) -> io::Result<()>;

    fn alloc_memory(&self, req: &AllocRequest) -> io::Result<Allocated>;

    fn free_memory(&self, handle: u64) -> io::Result<()>;

    fn map_to_devices(&self, handle: u64, gpu_ids: &[u32]) -> FanOut;

    fn unmap_from_devices(&self, handle: u64, gpu_ids: &[u32]) -> FanOut;

    fn ipc_export(&self, gpu_id: u32, handle: u64) -> io::Result<[u32; 4]>;

    fn ipc_import(&self, gpu_id: u32, va: u64, share: [u32; 4]) -> io::Result<ImportedHandle>;

    fn dmabuf_info(&self, dmabuf_fd: RawFd) -> io::Result<DmabufInfo>;

    fn import_dmabuf(&self, dmabuf_fd: RawFd, gpu_id: u32, va: u64) -> io::Result<u64>;

    fn export_dmabuf(&self, handle: u64) -> io::Result<OwnedFd>;

    /// Applies SVM attributes to `[start, start + size)`.
    fn svm_set_attributes(&self, start: u64, size: u64, attrs: &[SvmAttribute]) -> io::Result<()>;
}
