//! Recording fakes of the driver and the OS for unit tests.

use super::host::{HostVm, Placement};
use crate::kfd::channel::{
    AllocRequest, Allocated, DeviceApertures, DeviceChannel, DmabufInfo, DriverVersion, FanOut,
    ImportedHandle, MemoryPolicy,
};
use crate::kfd::ioctl::SvmAttribute;
use crate::thunk::topology::{EngineVersion, NodeInfo};
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};

/// A CPU node followed by `gpus` discrete GPU nodes.
pub fn gpu_nodes(gpus: u32) -> Vec<NodeInfo> {
    let mut nodes = vec![NodeInfo {
        node_id: 0,
        cpu_cores: 8,
        ..NodeInfo::default()
    }];
    for i in 1..=gpus {
        nodes.push(NodeInfo {
            node_id: i,
            gpu_id: 0x1000 + i,
            device_id: 0x740f,
            local_mem_size: 16 << 30,
            engine: EngineVersion::new(9, 0, 10),
            drm_render_minor: 127 + i,
            simd_count: 416,
            ..NodeInfo::default()
        });
    }
    nodes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Reserve(Placement, u64),
    Unmap(u64, u64),
    MapAnonymous(u64, u64),
    MapDevice {
        addr: u64,
        size: u64,
        host_access: bool,
        offset: u64,
    },
    BindPreferred(u64, u64, u32),
    ResetNuma(u64, u64),
    DontFork(u64, u64),
    CheckMapped(u64, u64),
    Touch(u64, u64),
    OpenRenderNode(u32),
}

#[derive(Debug)]
struct HostState {
    calls: Vec<HostCall>,
    next: u64,
    fail_fixed: Option<i32>,
    max_reservation: Option<u64>,
    fail_map_device: bool,
    fail_bind: bool,
    unmapped: Option<(u64, u64)>,
}

/// [`HostVm`] that hands out addresses from a bump pointer and records
/// every call instead of touching the address space.
#[derive(Debug)]
pub struct FakeHost {
    page: u64,
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new(page: u64) -> Self {
        Self {
            page,
            state: Mutex::new(HostState {
                calls: Vec::new(),
                next: 0x1000_0000_0000,
                fail_fixed: None,
                max_reservation: None,
                fail_map_device: false,
                fail_bind: false,
                unmapped: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// The next fixed reservation fails with `errno`.
    pub fn fail_next_fixed_reserve(&self, errno: i32) {
        self.state().fail_fixed = Some(errno);
    }

    /// Reservations larger than `max` fail.
    pub fn limit_reservations(&self, max: u64) {
        self.state().max_reservation = Some(max);
    }

    pub fn fail_next_map_device(&self) {
        self.state().fail_map_device = true;
    }

    pub fn refuse_numa_binding(&self) {
        self.state().fail_bind = true;
    }

    /// [`HostVm::check_mapped`] fails for ranges touching `[addr, addr + size)`.
    pub fn punch_hole(&self, addr: u64, size: u64) {
        self.state().unmapped = Some((addr, size));
    }

    fn record(&self, call: HostCall) {
        self.state().calls.push(call);
    }
}

impl HostVm for FakeHost {
    fn page_size(&self) -> u64 {
        self.page
    }

    fn reserve(&self, placement: Placement, size: u64) -> io::Result<u64> {
        let mut state = self.state();
        state.calls.push(HostCall::Reserve(placement, size));
        if state.max_reservation.is_some_and(|max| size > max) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        match placement {
            Placement::Anywhere => {
                let addr = state.next;
                state.next += (size + self.page - 1) / self.page * self.page + self.page;
                Ok(addr)
            }
            Placement::Hint(addr) | Placement::NoReplace(addr) => Ok(addr),
            Placement::Fixed(addr) => match state.fail_fixed.take() {
                Some(errno) => Err(io::Error::from_raw_os_error(errno)),
                None => Ok(addr),
            },
        }
    }

    fn unmap(&self, addr: u64, size: u64) -> io::Result<()> {
        self.record(HostCall::Unmap(addr, size));
        Ok(())
    }

    fn map_anonymous_fixed(&self, addr: u64, size: u64) -> io::Result<()> {
        self.record(HostCall::MapAnonymous(addr, size));
        Ok(())
    }

    fn map_device(
        &self,
        addr: u64,
        size: u64,
        host_access: bool,
        _fd: RawFd,
        offset: u64,
    ) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(HostCall::MapDevice {
            addr,
            size,
            host_access,
            offset,
        });
        if std::mem::take(&mut state.fail_map_device) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    fn bind_preferred(&self, addr: u64, size: u64, node: u32) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(HostCall::BindPreferred(addr, size, node));
        if state.fail_bind {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }

    fn reset_numa(&self, addr: u64, size: u64) -> io::Result<()> {
        self.record(HostCall::ResetNuma(addr, size));
        Ok(())
    }

    fn madvise_dontfork(&self, addr: u64, size: u64) -> io::Result<()> {
        self.record(HostCall::DontFork(addr, size));
        Ok(())
    }

    fn check_mapped(&self, addr: u64, size: u64) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(HostCall::CheckMapped(addr, size));
        match state.unmapped {
            Some((hole, len)) if addr < hole + len && hole < addr + size => {
                Err(io::Error::from_raw_os_error(libc::ENOMEM))
            }
            _ => Ok(()),
        }
    }

    unsafe fn touch_pages(&self, addr: u64, size: u64) {
        self.record(HostCall::Touch(addr, size));
    }

    fn open_render_node(&self, minor: u32) -> io::Result<OwnedFd> {
        self.record(HostCall::OpenRenderNode(minor));
        Ok(File::open("/dev/null")?.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    Reopen,
    AcquireVm(u32),
    SetMemoryPolicy(MemoryPolicy),
    SetScratchBacking(u32, u64),
    Alloc(AllocRequest),
    Free(u64),
    Map(u64, Vec<u32>),
    Unmap(u64, Vec<u32>),
    IpcExport(u32, u64),
    IpcImport(u32, u64),
    DmabufInfo,
    ImportDmabuf(u32, u64),
    ExportDmabuf(u64),
    SvmSetAttributes(u64, u64, Vec<SvmAttribute>),
}

/// Request kinds that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Reopen,
    Alloc,
    Free,
    Map,
    Unmap,
    SetScratch,
    IpcImport,
    ImportDmabuf,
    Svm,
}

#[derive(Debug)]
struct ChannelState {
    calls: Vec<ChannelCall>,
    next_handle: u64,
    fail: HashSet<Op>,
    map_limit: Option<usize>,
}

/// [`DeviceChannel`] that hands out sequential handles and records every
/// request.
#[derive(Debug)]
pub struct FakeChannel {
    version: DriverVersion,
    apertures: Vec<DeviceApertures>,
    dmabuf: DmabufInfo,
    state: Mutex<ChannelState>,
}

impl FakeChannel {
    /// Canonical GPUVM windows below the 47-bit line for every GPU node.
    pub fn new(nodes: &[NodeInfo]) -> Self {
        let apertures = nodes
            .iter()
            .filter(|n| n.is_gpu())
            .map(|n| DeviceApertures {
                gpu_id: n.gpu_id,
                gpuvm_base: 0x100_0000,
                gpuvm_limit: (1 << 44) - 1,
                ..DeviceApertures::default()
            })
            .collect();
        Self {
            version: DriverVersion {
                major: 1,
                minor: 18,
            },
            apertures,
            dmabuf: DmabufInfo::default(),
            state: Mutex::new(ChannelState {
                calls: Vec::new(),
                next_handle: 1,
                fail: HashSet::new(),
                map_limit: None,
            }),
        }
    }

    pub fn with_minor_version(mut self, minor: u32) -> Self {
        self.version.minor = minor;
        self
    }

    pub fn with_gpuvm_limit(mut self, limit: u64) -> Self {
        for ap in &mut self.apertures {
            ap.gpuvm_limit = limit;
        }
        self
    }

    /// Places every GPU's GPUVM window at a non-canonical address.
    pub fn with_private_gpuvm(mut self, base: u64, limit: u64) -> Self {
        for ap in &mut self.apertures {
            ap.gpuvm_base = base;
            ap.gpuvm_limit = limit;
        }
        self
    }

    pub fn with_lds(mut self, base: u64, limit: u64) -> Self {
        for ap in &mut self.apertures {
            ap.lds_base = base;
            ap.lds_limit = limit;
        }
        self
    }

    pub fn with_dmabuf(mut self, info: DmabufInfo) -> Self {
        self.dmabuf = info;
        self
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap()
    }

    /// The next request of kind `op` fails.
    pub fn fail_next(&self, op: Op) {
        self.state().fail.insert(op);
    }

    /// Map requests stop after `n` devices.
    pub fn limit_maps(&self, n: Option<usize>) {
        self.state().map_limit = n;
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn count(&self, pred: impl Fn(&ChannelCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn frees(&self) -> Vec<u64> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                ChannelCall::Free(h) => Some(*h),
                _ => None,
            })
            .collect()
    }

    pub fn policies(&self) -> Vec<MemoryPolicy> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                ChannelCall::SetMemoryPolicy(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    pub fn acquired_vms(&self) -> Vec<u32> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                ChannelCall::AcquireVm(g) => Some(*g),
                _ => None,
            })
            .collect()
    }

    fn begin(&self, op: Op, call: ChannelCall) -> io::Result<MutexGuard<'_, ChannelState>> {
        let mut state = self.state();
        state.calls.push(call);
        if state.fail.remove(&op) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(state)
    }

    fn handle(state: &mut ChannelState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }
}

impl DeviceChannel for FakeChannel {
    fn reopen(self: Arc<Self>) -> io::Result<Arc<dyn DeviceChannel>> {
        drop(self.begin(Op::Reopen, ChannelCall::Reopen)?);
        Ok(self)
    }

    fn version(&self) -> io::Result<DriverVersion> {
        Ok(self.version)
    }

    fn process_apertures(&self, _num_nodes: u32) -> io::Result<Vec<DeviceApertures>> {
        Ok(self.apertures.clone())
    }

    fn acquire_vm(&self, gpu_id: u32, _drm_fd: RawFd) -> io::Result<()> {
        self.state().calls.push(ChannelCall::AcquireVm(gpu_id));
        Ok(())
    }

    fn set_memory_policy(&self, policy: &MemoryPolicy) -> io::Result<()> {
        self.state().calls.push(ChannelCall::SetMemoryPolicy(*policy));
        Ok(())
    }

    fn set_scratch_backing_va(&self, gpu_id: u32, va: u64) -> io::Result<()> {
        self.begin(Op::SetScratch, ChannelCall::SetScratchBacking(gpu_id, va))
            .map(drop)
    }

    fn alloc_memory(&self, req: &AllocRequest) -> io::Result<Allocated> {
        let mut state = self.begin(Op::Alloc, ChannelCall::Alloc(*req))?;
        let handle = Self::handle(&mut state);
        Ok(Allocated {
            handle,
            mmap_offset: handle << 32,
        })
    }

    fn free_memory(&self, handle: u64) -> io::Result<()> {
        self.begin(Op::Free, ChannelCall::Free(handle)).map(drop)
    }

    fn map_to_devices(&self, handle: u64, gpu_ids: &[u32]) -> FanOut {
        match self.begin(Op::Map, ChannelCall::Map(handle, gpu_ids.to_vec())) {
            Err(error) => FanOut {
                n_success: 0,
                error: Some(error),
            },
            Ok(state) => match state.map_limit {
                Some(n) if n < gpu_ids.len() => FanOut {
                    n_success: n,
                    error: Some(io::Error::from_raw_os_error(libc::ENOMEM)),
                },
                _ => FanOut::complete(gpu_ids.len()),
            },
        }
    }

    fn unmap_from_devices(&self, handle: u64, gpu_ids: &[u32]) -> FanOut {
        match self.begin(Op::Unmap, ChannelCall::Unmap(handle, gpu_ids.to_vec())) {
            Err(error) => FanOut {
                n_success: 0,
                error: Some(error),
            },
            Ok(_) => FanOut::complete(gpu_ids.len()),
        }
    }

    fn ipc_export(&self, gpu_id: u32, handle: u64) -> io::Result<[u32; 4]> {
        self.state().calls.push(ChannelCall::IpcExport(gpu_id, handle));
        #[allow(clippy::cast_possible_truncation)]
        Ok([handle as u32, gpu_id, 0xcafe, 0xf00d])
    }

    fn ipc_import(&self, gpu_id: u32, va: u64, _share: [u32; 4]) -> io::Result<ImportedHandle> {
        let mut state = self.begin(Op::IpcImport, ChannelCall::IpcImport(gpu_id, va))?;
        let handle = Self::handle(&mut state);
        Ok(ImportedHandle {
            handle,
            mmap_offset: handle << 32,
            flags: crate::kfd::ioctl::KFD_IOC_ALLOC_MEM_FLAGS_VRAM
                | crate::kfd::ioctl::KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE
                | crate::kfd::ioctl::KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC,
        })
    }

    fn dmabuf_info(&self, _dmabuf_fd: RawFd) -> io::Result<DmabufInfo> {
        self.state().calls.push(ChannelCall::DmabufInfo);
        Ok(self.dmabuf.clone())
    }

    fn import_dmabuf(&self, _dmabuf_fd: RawFd, gpu_id: u32, va: u64) -> io::Result<u64> {
        let mut state = self.begin(Op::ImportDmabuf, ChannelCall::ImportDmabuf(gpu_id, va))?;
        Ok(Self::handle(&mut state))
    }

    fn export_dmabuf(&self, handle: u64) -> io::Result<OwnedFd> {
        self.state().calls.push(ChannelCall::ExportDmabuf(handle));
        Ok(File::open("/dev/null")?.into())
    }

    fn svm_set_attributes(&self, start: u64, size: u64, attrs: &[SvmAttribute]) -> io::Result<()> {
        self.begin(
            Op::Svm,
            ChannelCall::SvmSetAttributes(start, size, attrs.to_vec()),
        )
        .map(drop)
    }
}
