//! Wire structs and request numbers of the KFD memory ioctls.

use crate::utils::{ior, iow, iowr};

// ===============================================================================================
// Constants and Versioning
// ===============================================================================================

pub const KFD_IOCTL_BASE: u32 = 0x4B; // 'K'

/// First minor version carrying the SVM attribute ioctl.
pub const KFD_IOCTL_SVM_MINOR_VERSION: u32 = 5;
/// First minor version carrying the dma-buf export ioctl.
pub const KFD_IOCTL_EXPORT_DMABUF_MINOR_VERSION: u32 = 12;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetVersionArgs {
    pub major_version: u32,
    pub minor_version: u32,
}

// ===============================================================================================
// Memory Policy
// ===============================================================================================

pub const KFD_IOC_CACHE_POLICY_COHERENT: u32 = 0;
pub const KFD_IOC_CACHE_POLICY_NONCOHERENT: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SetMemoryPolicyArgs {
    pub alternate_aperture_base: u64,
    pub alternate_aperture_size: u64,
    pub gpu_id: u32,
    pub default_policy: u32,
    pub alternate_policy: u32,
    pub misc_process_flag: u32,
}

// ===============================================================================================
// Process Apertures
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ProcessDeviceApertures {
    pub lds_base: u64,
    pub lds_limit: u64,
    pub scratch_base: u64,
    pub scratch_limit: u64,
    pub gpuvm_base: u64,
    pub gpuvm_limit: u64,
    pub gpu_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetProcessAperturesNewArgs {
    pub kfd_process_device_apertures_ptr: u64,
    pub num_of_nodes: u32,
    pub pad: u32,
}

// ===============================================================================================
// Memory Management (VM, Scratch, Alloc)
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SetScratchBackingVaArgs {
    pub va_addr: u64,
    pub gpu_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AcquireVmArgs {
    pub drm_fd: u32,
    pub gpu_id: u32,
}

// Allocation Flags
pub const KFD_IOC_ALLOC_MEM_FLAGS_VRAM: u32 = 1 << 0;
pub const KFD_IOC_ALLOC_MEM_FLAGS_GTT: u32 = 1 << 1;
pub const KFD_IOC_ALLOC_MEM_FLAGS_USERPTR: u32 = 1 << 2;
pub const KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE: u32 = 1 << 31;
pub const KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE: u32 = 1 << 30;
pub const KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC: u32 = 1 << 29;
pub const KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE: u32 = 1 << 28;
pub const KFD_IOC_ALLOC_MEM_FLAGS_AQL_QUEUE_MEM: u32 = 1 << 27;
pub const KFD_IOC_ALLOC_MEM_FLAGS_COHERENT: u32 = 1 << 26;
pub const KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED: u32 = 1 << 25;
pub const KFD_IOC_ALLOC_MEM_FLAGS_EXT_COHERENT: u32 = 1 << 24;
pub const KFD_IOC_ALLOC_MEM_FLAGS_CONTIGUOUS_BEST_EFFORT: u32 = 1 << 23;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AllocMemoryOfGpuArgs {
    pub va_addr: u64,
    pub size: u64,
    pub handle: u64,
    pub mmap_offset: u64,
    pub gpu_id: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FreeMemoryOfGpuArgs {
    pub handle: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct MapMemoryToGpuArgs {
    pub handle: u64,
    pub device_ids_array_ptr: u64,
    pub n_devices: u32,
    pub n_success: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct UnmapMemoryFromGpuArgs {
    pub handle: u64,
    pub device_ids_array_ptr: u64,
    pub n_devices: u32,
    pub n_success: u32,
}

// ===============================================================================================
// DMA Buf
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetDmabufInfoArgs {
    pub size: u64,
    pub metadata_ptr: u64,
    pub metadata_size: u32,
    pub gpu_id: u32,
    pub flags: u32,
    pub dmabuf_fd: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ImportDmabufArgs {
    pub va_addr: u64,
    pub handle: u64,
    pub gpu_id: u32,
    pub dmabuf_fd: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ExportDmabufArgs {
    pub handle: u64,
    pub flags: u32,
    pub dmabuf_fd: u32,
}

// ===============================================================================================
// IPC (Inter Process Communication)
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct IpcExportHandleArgs {
    pub handle: u64,
    pub share_handle: [u32; 4],
    pub gpu_id: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct IpcImportHandleArgs {
    pub handle: u64,
    pub va_addr: u64,
    pub mmap_offset: u64,
    pub share_handle: [u32; 4],
    pub gpu_id: u32,
    pub flags: u32,
}

// ===============================================================================================
// SVM (Shared Virtual Memory)
// ===============================================================================================

pub const KFD_IOCTL_SVM_FLAG_HOST_ACCESS: u32 = 0x00000001;
pub const KFD_IOCTL_SVM_FLAG_COHERENT: u32 = 0x00000002;

pub const KFD_IOCTL_SVM_OP_SET_ATTR: u32 = 0;

pub const KFD_IOCTL_SVM_ATTR_ACCESS: u32 = 2;
pub const KFD_IOCTL_SVM_ATTR_NO_ACCESS: u32 = 4;
pub const KFD_IOCTL_SVM_ATTR_SET_FLAGS: u32 = 5;
pub const KFD_IOCTL_SVM_ATTR_CLR_FLAGS: u32 = 6;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SvmAttribute {
    pub type_: u32,
    pub value: u32,
}

/// Header of the SVM ioctl. The kernel expects `nattr` attributes laid out
/// right after it, see [`SvmArgsWithAttrs`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SvmArgs {
    pub start_addr: u64,
    pub size: u64,
    pub op: u32,
    pub nattr: u32,
    pub attrs: [SvmAttribute; 0],
}

/// [`SvmArgs`] with its trailing attribute array in one `repr(C)` block.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SvmArgsWithAttrs<const N: usize> {
    pub header: SvmArgs,
    pub attrs: [SvmAttribute; N],
}

// ===============================================================================================
// IOCTL Command Definitions
// ===============================================================================================

pub const AMDKFD_IOC_GET_VERSION: u32 = ior::<GetVersionArgs>(KFD_IOCTL_BASE, 0x01);
pub const AMDKFD_IOC_SET_MEMORY_POLICY: u32 = iow::<SetMemoryPolicyArgs>(KFD_IOCTL_BASE, 0x04);
pub const AMDKFD_IOC_SET_SCRATCH_BACKING_VA: u32 =
    iowr::<SetScratchBackingVaArgs>(KFD_IOCTL_BASE, 0x11);
pub const AMDKFD_IOC_GET_PROCESS_APERTURES_NEW: u32 =
    iowr::<GetProcessAperturesNewArgs>(KFD_IOCTL_BASE, 0x14);
pub const AMDKFD_IOC_ACQUIRE_VM: u32 = iow::<AcquireVmArgs>(KFD_IOCTL_BASE, 0x15);
pub const AMDKFD_IOC_ALLOC_MEMORY_OF_GPU: u32 = iowr::<AllocMemoryOfGpuArgs>(KFD_IOCTL_BASE, 0x16);
pub const AMDKFD_IOC_FREE_MEMORY_OF_GPU: u32 = iow::<FreeMemoryOfGpuArgs>(KFD_IOCTL_BASE, 0x17);
pub const AMDKFD_IOC_MAP_MEMORY_TO_GPU: u32 = iowr::<MapMemoryToGpuArgs>(KFD_IOCTL_BASE, 0x18);
pub const AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU: u32 =
    iowr::<UnmapMemoryFromGpuArgs>(KFD_IOCTL_BASE, 0x19);
pub const AMDKFD_IOC_GET_DMABUF_INFO: u32 = iowr::<GetDmabufInfoArgs>(KFD_IOCTL_BASE, 0x1C);
pub const AMDKFD_IOC_IMPORT_DMABUF: u32 = iowr::<ImportDmabufArgs>(KFD_IOCTL_BASE, 0x1D);
pub const AMDKFD_IOC_SVM: u32 = iowr::<SvmArgs>(KFD_IOCTL_BASE, 0x20);
pub const AMDKFD_IOC_EXPORT_DMABUF: u32 = iowr::<ExportDmabufArgs>(KFD_IOCTL_BASE, 0x24);

// Extended / Non-upstream IOCTLs
pub const AMDKFD_IOC_IPC_IMPORT_HANDLE: u32 = iowr::<IpcImportHandleArgs>(KFD_IOCTL_BASE, 0x80);
pub const AMDKFD_IOC_IPC_EXPORT_HANDLE: u32 = iowr::<IpcExportHandleArgs>(KFD_IOCTL_BASE, 0x81);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_numbers_match_the_kernel_header() {
        assert_eq!(AMDKFD_IOC_GET_VERSION, 0x8008_4b01);
        assert_eq!(AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, 0xc028_4b16);
        assert_eq!(AMDKFD_IOC_FREE_MEMORY_OF_GPU, 0x4008_4b17);
        assert_eq!(AMDKFD_IOC_MAP_MEMORY_TO_GPU, 0xc018_4b18);
        assert_eq!(AMDKFD_IOC_SVM, 0xc018_4b20);
    }

    #[test]
    fn svm_attributes_follow_the_header() {
        assert_eq!(std::mem::size_of::<SvmArgs>(), 24);
        assert_eq!(std::mem::size_of::<SvmArgsWithAttrs<2>>(), 24 + 2 * 8);
    }
}
