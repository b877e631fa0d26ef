#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::kfd::channel::{
    AllocRequest, Allocated, DeviceApertures, DeviceChannel, DmabufInfo, DriverVersion, FanOut,
    ImportedHandle, MemoryPolicy,
};
use crate::kfd::ioctl::{
    AMDKFD_IOC_ACQUIRE_VM, AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, AMDKFD_IOC_EXPORT_DMABUF,
    AMDKFD_IOC_FREE_MEMORY_OF_GPU, AMDKFD_IOC_GET_DMABUF_INFO,
    AMDKFD_IOC_GET_PROCESS_APERTURES_NEW, AMDKFD_IOC_GET_VERSION, AMDKFD_IOC_IMPORT_DMABUF,
    AMDKFD_IOC_IPC_EXPORT_HANDLE, AMDKFD_IOC_IPC_IMPORT_HANDLE, AMDKFD_IOC_MAP_MEMORY_TO_GPU,
    AMDKFD_IOC_SET_MEMORY_POLICY, AMDKFD_IOC_SET_SCRATCH_BACKING_VA, AMDKFD_IOC_SVM,
    AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU, AcquireVmArgs, AllocMemoryOfGpuArgs, ExportDmabufArgs,
    FreeMemoryOfGpuArgs, GetDmabufInfoArgs, GetProcessAperturesNewArgs, GetVersionArgs,
    ImportDmabufArgs, IpcExportHandleArgs, IpcImportHandleArgs, KFD_IOCTL_SVM_OP_SET_ATTR,
    MapMemoryToGpuArgs, ProcessDeviceApertures, SetMemoryPolicyArgs, SetScratchBackingVaArgs,
    SvmArgs, SvmArgsWithAttrs, SvmAttribute,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

/// Most attributes a single SVM request carries: one flag set/clear pair
/// plus one access attribute per GPU.
const MAX_SVM_ATTRS: usize = 66;

/// A handle to the KFD driver character device (`/dev/kfd`).
///
/// The file descriptor lives in an `Arc`, so the handle is cheap to clone and
/// share between the memory manager and whoever else talks to the driver.
#[derive(Clone, Debug)]
pub struct KfdDevice {
    pub file: Arc<File>,
}

impl KfdDevice {
    /// Opens the KFD driver device.
    ///
    /// # Errors
    /// Returns an error if `/dev/kfd` cannot be opened (e.g., driver not loaded, permissions).
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open("/dev/kfd")?;

        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn fan_out(&self, cmd: u32, handle: u64, gpu_ids: &[u32]) -> FanOut {
        // Map and unmap share one argument layout.
        let mut args = MapMemoryToGpuArgs {
            handle,
            device_ids_array_ptr: gpu_ids.as_ptr() as u64,
            n_devices: gpu_ids.len() as u32,
            n_success: 0,
        };
        let status = unsafe { self.ioctl(cmd, &mut args) };
        FanOut {
            n_success: (args.n_success as usize).min(gpu_ids.len()),
            error: status.err(),
        }
    }
}

impl DeviceChannel for KfdDevice {
    fn reopen(self: Arc<Self>) -> io::Result<Arc<dyn DeviceChannel>> {
        Ok(Arc::new(Self::open()?))
    }

    fn version(&self) -> io::Result<DriverVersion> {
        let mut args = GetVersionArgs::default();
        unsafe { self.ioctl(AMDKFD_IOC_GET_VERSION, &mut args)? };
        Ok(DriverVersion {
            major: args.major_version,
            minor: args.minor_version,
        })
    }

    fn process_apertures(&self, num_nodes: u32) -> io::Result<Vec<DeviceApertures>> {
        let mut raw = vec![ProcessDeviceApertures::default(); num_nodes as usize];
        let mut args = GetProcessAperturesNewArgs {
            kfd_process_device_apertures_ptr: raw.as_mut_ptr() as u64,
            num_of_nodes: num_nodes,
            pad: 0,
        };
        unsafe { self.ioctl(AMDKFD_IOC_GET_PROCESS_APERTURES_NEW, &mut args)? };

        raw.truncate(args.num_of_nodes as usize);
        Ok(raw
            .into_iter()
            .map(|a| DeviceApertures {
                gpu_id: a.gpu_id,
                lds_base: a.lds_base,
                lds_limit: a.lds_limit,
                scratch_base: a.scratch_base,
                scratch_limit: a.scratch_limit,
                gpuvm_base: a.gpuvm_base,
                gpuvm_limit: a.gpuvm_limit,
            })
            .collect())
    }

    /// Links the KFD process context with the amdgpu DRM context of a render node.
    fn acquire_vm(&self, gpu_id: u32, drm_fd: RawFd) -> io::Result<()> {
        let mut args = AcquireVmArgs {
            drm_fd: drm_fd as u32,
            gpu_id,
        };
        unsafe { self.ioctl(AMDKFD_IOC_ACQUIRE_VM, &mut args) }
    }

    fn set_memory_policy(&self, policy: &MemoryPolicy) -> io::Result<()> {
        let mut args = SetMemoryPolicyArgs {
            alternate_aperture_base: policy.alt_base,
            alternate_aperture_size: policy.alt_size,
            gpu_id: policy.gpu_id,
            default_policy: policy.default_policy,
            alternate_policy: policy.alt_policy,
            misc_process_flag: 0,
        };
        unsafe { self.ioctl(AMDKFD_IOC_SET_MEMORY_POLICY, &mut args) }
    }

    fn set_scratch_backing_va(&self, gpu_id: u32, va: u64) -> io::Result<()> {
        // The register takes the base in 64 KiB units.
        let mut args = SetScratchBackingVaArgs {
            va_addr: va >> 16,
            gpu_id,
            pad: 0,
        };
        unsafe { self.ioctl(AMDKFD_IOC_SET_SCRATCH_BACKING_VA, &mut args) }
    }

    fn alloc_memory(&self, req: &AllocRequest) -> io::Result<Allocated> {
        let mut args = AllocMemoryOfGpuArgs {
            va_addr: req.va,
            size: req.size,
            handle: 0,
            mmap_offset: req.mmap_offset,
            gpu_id: req.gpu_id,
            flags: req.flags,
        };
        unsafe { self.ioctl(AMDKFD_IOC_ALLOC_MEMORY_OF_GPU, &mut args)? };
        Ok(Allocated {
            handle: args.handle,
            mmap_offset: args.mmap_offset,
        })
    }

    fn free_memory(&self, handle: u64) -> io::Result<()> {
        let mut args = FreeMemoryOfGpuArgs { handle };
        unsafe { self.ioctl(AMDKFD_IOC_FREE_MEMORY_OF_GPU, &mut args) }
    }

    fn map_to_devices(&self, handle: u64, gpu_ids: &[u32]) -> FanOut {
        self.fan_out(AMDKFD_IOC_MAP_MEMORY_TO_GPU, handle, gpu_ids)
    }

    fn unmap_from_devices(&self, handle: u64, gpu_ids: &[u32]) -> FanOut {
        self.fan_out(AMDKFD_IOC_UNMAP_MEMORY_FROM_GPU, handle, gpu_ids)
    }

    fn ipc_export(&self, gpu_id: u32, handle: u64) -> io::Result<[u32; 4]> {
        let mut args = IpcExportHandleArgs {
            handle,
            gpu_id,
            ..Default::default()
        };
        unsafe { self.ioctl(AMDKFD_IOC_IPC_EXPORT_HANDLE, &mut args)? };
        Ok(args.share_handle)
    }

    fn ipc_import(&self, gpu_id: u32, va: u64, share: [u32; 4]) -> io::Result<ImportedHandle> {
        let mut args = IpcImportHandleArgs {
            va_addr: va,
            share_handle: share,
            gpu_id,
            ..Default::default()
        };
        unsafe { self.ioctl(AMDKFD_IOC_IPC_IMPORT_HANDLE, &mut args)? };
        Ok(ImportedHandle {
            handle: args.handle,
            mmap_offset: args.mmap_offset,
            flags: args.flags,
        })
    }

    fn dmabuf_info(&self, dmabuf_fd: RawFd) -> io::Result<DmabufInfo> {
        // First pass sizes the metadata, second pass fetches it.
        let mut args = GetDmabufInfoArgs {
            dmabuf_fd: dmabuf_fd as u32,
            ..Default::default()
        };
        unsafe { self.ioctl(AMDKFD_IOC_GET_DMABUF_INFO, &mut args)? };

        let mut metadata = vec![0u8; args.metadata_size as usize];
        if !metadata.is_empty() {
            args.metadata_ptr = metadata.as_mut_ptr() as u64;
            unsafe { self.ioctl(AMDKFD_IOC_GET_DMABUF_INFO, &mut args)? };
            metadata.truncate(args.metadata_size as usize);
        }

        Ok(DmabufInfo {
            size: args.size,
            gpu_id: args.gpu_id,
            flags: args.flags,
            metadata,
        })
    }

    fn import_dmabuf(&self, dmabuf_fd: RawFd, gpu_id: u32, va: u64) -> io::Result<u64> {
        let mut args = ImportDmabufArgs {
            va_addr: va,
            handle: 0,
            gpu_id,
            dmabuf_fd: dmabuf_fd as u32,
        };
        unsafe { self.ioctl(AMDKFD_IOC_IMPORT_DMABUF, &mut args)? };
        Ok(args.handle)
    }

    fn export_dmabuf(&self, handle: u64) -> io::Result<OwnedFd> {
        let mut args = ExportDmabufArgs {
            handle,
            flags: libc::O_CLOEXEC as u32,
            dmabuf_fd: 0,
        };
        unsafe { self.ioctl(AMDKFD_IOC_EXPORT_DMABUF, &mut args)? };
        // SAFETY: on success the driver hands us a freshly installed fd.
        Ok(unsafe { OwnedFd::from_raw_fd(args.dmabuf_fd as RawFd) })
    }

    fn svm_set_attributes(&self, start: u64, size: u64, attrs: &[SvmAttribute]) -> io::Result<()> {
        if attrs.len() > MAX_SVM_ATTRS {
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }

        let mut req = SvmArgsWithAttrs::<MAX_SVM_ATTRS> {
            header: SvmArgs {
                start_addr: start,
                size,
                op: KFD_IOCTL_SVM_OP_SET_ATTR,
                nattr: attrs.len() as u32,
                attrs: [],
            },
            attrs: [SvmAttribute::default(); MAX_SVM_ATTRS],
        };
        req.attrs[..attrs.len()].copy_from_slice(attrs);

        unsafe { self.ioctl(AMDKFD_IOC_SVM, &mut req) }
    }
}

impl AsRawFd for KfdDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
