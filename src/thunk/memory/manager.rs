//! The allocation orchestrator.
//!
//! [`MemoryManager`] owns the aperture layout of the process and drives the
//! device channel and the host seam through every multi-step operation:
//! reserve VA, allocate or import backing, CPU-map it, map it to GPUs, and
//! unwind in reverse on failure.
//!
//! Locks are per aperture. An operation holds at most one aperture lock at a
//! time; when it needs a second one it drops the first.

use super::Allocation;
use super::aperture::{Aperture, ApertureGuard, ObjectRef};
use super::flags::MemFlags;
use super::host::{HostVm, LibcHost};
use super::layout::{Layout, Location, bootstrap};
use super::object::{UserPtr, VmObject};
use super::registry::Index;
use crate::error::{HsaError, HsaResult};
use crate::kfd::channel::{AllocRequest, Allocated, DeviceChannel};
use crate::kfd::device::KfdDevice;
use crate::kfd::ioctl::{
    KFD_IOC_ALLOC_MEM_FLAGS_GTT, KFD_IOC_ALLOC_MEM_FLAGS_USERPTR, KFD_IOC_ALLOC_MEM_FLAGS_VRAM,
    KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE, KFD_IOCTL_EXPORT_DMABUF_MINOR_VERSION,
    KFD_IOCTL_SVM_ATTR_ACCESS, KFD_IOCTL_SVM_ATTR_CLR_FLAGS, KFD_IOCTL_SVM_ATTR_NO_ACCESS,
    KFD_IOCTL_SVM_ATTR_SET_FLAGS, KFD_IOCTL_SVM_FLAG_COHERENT, KFD_IOCTL_SVM_FLAG_HOST_ACCESS,
    KFD_IOCTL_SVM_MINOR_VERSION, SvmAttribute,
};
use crate::thunk::config::FmmConfig;
use crate::thunk::fork::ForkWatch;
use crate::thunk::topology::{NodeInfo, is_dgpu, is_svm_needed};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const SCRATCH_ALIGN: u64 = 0x10000;

fn align_up(val: u64, align: u64) -> HsaResult<u64> {
    val.checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or(HsaError::InvalidParameter("size overflows the address space"))
}

/// End of `[address, address + size)`, rejecting ranges that wrap.
fn range_end(address: u64, size: u64) -> HsaResult<u64> {
    address
        .checked_add(size)
        .ok_or(HsaError::InvalidParameter("range wraps the address space"))
}

/// Converts a failed channel request into the error taxonomy.
fn wire_error(what: &str, e: &io::Error) -> HsaError {
    log::error!("{what} failed: {e}");
    if e.raw_os_error() == Some(libc::ENOMEM) {
        HsaError::OutOfMemory
    } else {
        HsaError::Driver(format!("{what}: {e}"))
    }
}

/// GPU address of host byte `addr` inside `obj`.
fn gpu_address(obj: &VmObject, addr: u64, page: u64) -> u64 {
    match obj.userptr {
        Some(u) => obj.start + (addr - (u.addr & !(page - 1))),
        None => addr,
    }
}

/// Everything known about one tracked allocation or registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryInfo {
    pub start: u64,
    pub size: u64,
    pub userptr: Option<UserPtr>,
    pub handle: u64,
    pub flags: MemFlags,
    pub node_id: u32,
    pub registered_nodes: Vec<u32>,
    pub mapped_nodes: Vec<u32>,
    pub metadata: Option<Vec<u8>>,
    pub user_data: u64,
    pub is_imported: bool,
}

/// Token another process can import with
/// [`MemoryManager::register_shared_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedMemory {
    pub share: [u32; 4],
    pub size: u64,
}

/// A foreign graphics buffer imported into the SVM window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsResource {
    pub addr: u64,
    pub size: u64,
    pub metadata: Vec<u8>,
    pub node_id: u32,
}

/// A host range registered through the driver's SVM attribute interface.
#[derive(Debug, Clone)]
struct SvmRange {
    start: u64,
    size: u64,
    count: u32,
    devices: BTreeSet<u32>,
    flags: u32,
}

impl SvmRange {
    const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.size
    }
}

#[derive(Debug, Default)]
struct LayoutSlot {
    current: Option<Arc<Layout>>,
    /// SVM reservation carried over from the pre-fork layout.
    preserved: Option<(u64, u64)>,
    /// The channel still belongs to the parent process.
    stale_channel: bool,
}

pub struct MemoryManager {
    channel: RwLock<Arc<dyn DeviceChannel>>,
    host: Arc<dyn HostVm>,
    config: FmmConfig,
    nodes: Vec<NodeInfo>,
    page_size: u64,
    is_dgpu: bool,
    fork: ForkWatch,
    layout: RwLock<LayoutSlot>,
    svm_ranges: Mutex<BTreeMap<u64, SvmRange>>,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("nodes", &self.nodes.len())
            .field("is_dgpu", &self.is_dgpu)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Creates a manager for `nodes`. The aperture layout is built on the
    /// first operation that needs it.
    pub fn new(
        channel: Arc<dyn DeviceChannel>,
        host: Arc<dyn HostVm>,
        config: FmmConfig,
        nodes: Vec<NodeInfo>,
    ) -> Self {
        let page_size = host.page_size();
        let is_dgpu = is_dgpu(&nodes);
        Self {
            channel: RwLock::new(channel),
            host,
            config,
            nodes,
            page_size,
            is_dgpu,
            fork: ForkWatch::process(),
            layout: RwLock::new(LayoutSlot::default()),
            svm_ranges: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens `/dev/kfd` and configures the manager from the environment.
    ///
    /// Per-node `HSA_OVERRIDE_GFX_VERSION` overrides are applied here.
    ///
    /// # Errors
    /// Fails if the KFD device cannot be opened.
    pub fn open(mut nodes: Vec<NodeInfo>) -> HsaResult<Self> {
        for node in nodes.iter_mut().filter(|n| n.is_gpu()) {
            node.engine = node.engine.with_env_override(node.node_id);
        }
        let device = KfdDevice::open()?;
        Ok(Self::new(
            Arc::new(device),
            Arc::new(LibcHost),
            FmmConfig::from_env(),
            nodes,
        ))
    }

    #[cfg(test)]
    pub(crate) fn with_fork_watch(mut self, fork: ForkWatch) -> Self {
        self.fork = fork;
        self
    }

    fn channel(&self) -> Arc<dyn DeviceChannel> {
        Arc::clone(&self.channel.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swaps the parent's channel for one of this process.
    fn reopen_channel(&self) -> HsaResult<()> {
        let fresh = self.channel().reopen().map_err(|e| {
            log::error!("reopening the driver after fork failed: {e}");
            HsaError::from(e)
        })?;
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    #[must_use]
    pub const fn is_dgpu(&self) -> bool {
        self.is_dgpu
    }

    #[must_use]
    pub const fn config(&self) -> &FmmConfig {
        &self.config
    }

    /// The current layout, rebuilt first if the process forked.
    pub fn layout(&self) -> HsaResult<Arc<Layout>> {
        if self.fork.forked() {
            self.recover_after_fork();
        }
        if let Some(layout) = &self
            .layout
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
        {
            return Ok(Arc::clone(layout));
        }

        let mut slot = self.layout.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(layout) = &slot.current {
            return Ok(Arc::clone(layout));
        }
        if slot.stale_channel {
            self.reopen_channel()?;
            slot.stale_channel = false;
        }
        let layout = Arc::new(bootstrap(
            &*self.channel(),
            &*self.host,
            &self.config,
            &self.nodes,
            self.is_dgpu,
            slot.preserved,
        )?);
        slot.preserved = None;
        slot.current = Some(Arc::clone(&layout));
        Ok(layout)
    }

    /// Drops everything inherited from the parent process.
    ///
    /// Objects are forgotten without any driver call. The next operation
    /// reopens the driver and bootstraps again, reusing the SVM reservation
    /// if it survived.
    pub(crate) fn recover_after_fork(&self) {
        let mut slot = self.layout.write().unwrap_or_else(PoisonError::into_inner);
        slot.stale_channel = true;
        if let Some(layout) = slot.current.take() {
            let dropped = layout.abandon(&*self.host);
            slot.preserved = layout.svm_reservation();
            log::info!("fork detected: forgot {dropped} objects of the parent");
        }
        self.svm_ranges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Classifies `address` without taking any aperture lock.
    pub fn classify(&self, address: u64) -> HsaResult<Location> {
        Ok(self.layout()?.classify(address, self.is_dgpu))
    }

    fn ioc_flags(&self, flags: MemFlags, domain: u32) -> u32 {
        flags.to_ioc_flags(domain, self.config.disable_cache)
    }

    fn gpu_ids_of(layout: &Layout, nodes: &[u32]) -> HsaResult<Vec<u32>> {
        nodes
            .iter()
            .map(|&n| layout.gpu(n).map(|g| g.gpu_id))
            .collect()
    }

    /// Gives VA back and, if `handle` is set, frees the backing first.
    fn unwind(&self, aperture: &Aperture, addr: u64, size: u64, handle: Option<u64>) {
        if let Some(handle) = handle
            && let Err(e) = self.channel().free_memory(handle)
        {
            log::error!("freeing handle 0x{handle:x} while unwinding: {e}");
        }
        aperture.lock().release_area(&*self.host, addr, size);
    }

    /// Allocates backing for the VA reserved at `va`, giving the VA back if
    /// the driver refuses.
    fn alloc_backing(
        &self,
        aperture: &Aperture,
        va: u64,
        req: &AllocRequest,
    ) -> HsaResult<Allocated> {
        self.channel().alloc_memory(req).map_err(|e| {
            self.unwind(aperture, va, req.size, None);
            wire_error("allocating device memory", &e)
        })
    }

    /// Allocates device memory on `node_id`.
    ///
    /// The VA comes from the SVM window for GPUs that need it and from the
    /// GPU's private window otherwise. `only_address` reserves VA without
    /// backing; `no_address` allocates backing addressed by an opaque id.
    ///
    /// # Errors
    /// Fails on an unknown node, VA exhaustion or a failed driver request;
    /// nothing acquired before the failure stays allocated.
    pub fn allocate_device(
        &self,
        node_id: u32,
        address: Option<u64>,
        size: u64,
        align: u64,
        flags: MemFlags,
    ) -> HsaResult<Allocation> {
        if size == 0 {
            return Err(HsaError::InvalidParameter("size must be non-zero"));
        }
        let layout = self.layout()?;
        let gpu = layout.gpu(node_id)?;
        let size = align_up(size, self.page_size)?;

        let aperture = if flags.no_address {
            &layout.mem_handle
        } else if is_svm_needed(self.is_dgpu, gpu.engine) {
            &layout.svm_default
        } else {
            &gpu.gpuvm
        };
        if !aperture.is_valid() {
            return Err(HsaError::OutOfMemory);
        }

        let addr = aperture
            .lock()
            .allocate_area(&*self.host, address, size, align)
            .ok_or(HsaError::OutOfMemory)?;

        if flags.only_address {
            aperture
                .lock()
                .insert(VmObject::new(addr, size, 0, flags, node_id));
            return Ok(Allocation {
                addr,
                size,
                handle: 0,
                node_id,
            });
        }

        // Handle-only memory has no GPU address; its id is only a registry key.
        let allocated = self.alloc_backing(
            aperture,
            addr,
            &AllocRequest {
                gpu_id: gpu.gpu_id,
                va: if flags.no_address { 0 } else { addr },
                size,
                flags: self.ioc_flags(flags, KFD_IOC_ALLOC_MEM_FLAGS_VRAM),
                mmap_offset: 0,
            },
        )?;

        if aperture.is_cpu_accessible() && !flags.no_address {
            let mapped = gpu.render_fd().and_then(|fd| {
                self.host
                    .map_device(addr, size, flags.host_access, fd, allocated.mmap_offset)
                    .map_err(HsaError::from)
            });
            if let Err(e) = mapped {
                log::error!("CPU mapping of 0x{addr:x} failed: {e}");
                self.unwind(aperture, addr, size, Some(allocated.handle));
                return Err(e);
            }
        }

        aperture
            .lock()
            .insert(VmObject::new(addr, size, allocated.handle, flags, node_id));
        log::debug!(
            "device memory 0x{addr:x} ({size} bytes) on node {node_id}, handle 0x{:x}",
            allocated.handle
        );
        Ok(Allocation {
            addr,
            size,
            handle: allocated.handle,
            node_id,
        })
    }

    /// Allocates paged system memory reachable by the GPUs.
    ///
    /// On APUs this is plain anonymous memory from the CPU window. On
    /// discrete GPUs it is either anonymous memory registered as a userptr
    /// (the default) or GTT memory mapped through the render node.
    ///
    /// # Errors
    /// Fails on VA exhaustion or a failed driver or OS request.
    pub fn allocate_host(
        &self,
        node_id: u32,
        address: Option<u64>,
        size: u64,
        flags: MemFlags,
    ) -> HsaResult<Allocation> {
        if size == 0 {
            return Err(HsaError::InvalidParameter("size must be non-zero"));
        }
        let layout = self.layout()?;
        let size = align_up(size, self.page_size)?;

        if !self.is_dgpu {
            return self.allocate_host_cpu(&layout, node_id, address, size, flags);
        }

        let gpu = layout
            .first_gpu()
            .ok_or(HsaError::NotSupported("no GPU node"))?;
        let aperture = if flags.coarse_grain {
            &layout.svm_default
        } else {
            layout.svm_coherent()
        };
        let addr = aperture
            .lock()
            .allocate_area(&*self.host, address, size, 0)
            .ok_or(HsaError::OutOfMemory)?;

        let allocated = if self.config.userptr_for_paged_mem && !flags.gtt {
            if let Err(e) = self.host.map_anonymous_fixed(addr, size) {
                aperture.lock().release_area(&*self.host, addr, size);
                return Err(e.into());
            }
            if let Err(e) = self.host.bind_preferred(addr, size, node_id) {
                log::warn!("NUMA hint for 0x{addr:x} toward node {node_id} refused: {e}");
            }
            if let Err(e) = self.host.madvise_dontfork(addr, size) {
                log::warn!("MADV_DONTFORK on 0x{addr:x}: {e}");
            }
            self.alloc_backing(
                aperture,
                addr,
                &AllocRequest {
                    gpu_id: gpu.gpu_id,
                    va: addr,
                    size,
                    flags: self.ioc_flags(flags, KFD_IOC_ALLOC_MEM_FLAGS_USERPTR),
                    mmap_offset: addr,
                },
            )?
        } else {
            let allocated = self.alloc_backing(
                aperture,
                addr,
                &AllocRequest {
                    gpu_id: gpu.gpu_id,
                    va: addr,
                    size,
                    flags: self.ioc_flags(flags.host_access(), KFD_IOC_ALLOC_MEM_FLAGS_GTT),
                    mmap_offset: 0,
                },
            )?;
            let mapped = gpu.render_fd().and_then(|fd| {
                self.host
                    .map_device(addr, size, true, fd, allocated.mmap_offset)
                    .map_err(HsaError::from)
            });
            if let Err(e) = mapped {
                self.unwind(aperture, addr, size, Some(allocated.handle));
                return Err(e);
            }
            allocated
        };

        aperture
            .lock()
            .insert(VmObject::new(addr, size, allocated.handle, flags, node_id));
        Ok(Allocation {
            addr,
            size,
            handle: allocated.handle,
            node_id,
        })
    }

    fn allocate_host_cpu(
        &self,
        layout: &Layout,
        node_id: u32,
        address: Option<u64>,
        size: u64,
        flags: MemFlags,
    ) -> HsaResult<Allocation> {
        let aperture = &layout.cpuvm;
        let addr = aperture
            .lock()
            .allocate_area(&*self.host, address, size, 0)
            .ok_or(HsaError::OutOfMemory)?;
        if let Err(e) = self.host.map_anonymous_fixed(addr, size) {
            aperture.lock().release_area(&*self.host, addr, size);
            return Err(e.into());
        }
        if let Err(e) = self.host.bind_preferred(addr, size, node_id) {
            log::warn!("NUMA hint for 0x{addr:x} toward node {node_id} refused: {e}");
        }
        aperture
            .lock()
            .insert(VmObject::new(addr, size, 0, flags, node_id));
        Ok(Allocation {
            addr,
            size,
            handle: 0,
            node_id,
        })
    }

    /// Looks up the object owning `address`.
    ///
    /// With `containing` any address inside the object matches; otherwise
    /// `address` must be where the object starts. Host addresses of userptr
    /// registrations are matched through the user index.
    fn find_object<'a>(
        layout: &'a Layout,
        location: Location,
        address: u64,
        containing: bool,
    ) -> Option<ObjectRef<'a>> {
        let aperture = layout.aperture(location)?;
        let find = |index| {
            if containing {
                aperture.find_containing(index, address)
            } else {
                aperture.find(index, address, 0)
            }
        };
        match location {
            Location::External => find(Index::User),
            l if l.is_svm() => find(Index::Device).or_else(|| find(Index::User)),
            _ => find(Index::Device),
        }
    }

    /// The single place a reference to an object is dropped.
    ///
    /// Registrations still held by others only lose one count. The last one
    /// frees the handle before the VA goes away, so the GPU never sees its
    /// pages disappear under a live buffer.
    fn drop_reference(&self, mut found: ObjectRef<'_>) -> HsaResult<()> {
        let obj = found.object_mut();
        if obj.registration_count > 1 {
            obj.registration_count -= 1;
            return Ok(());
        }

        let handle = obj.handle;
        if handle != 0 {
            self.channel()
                .free_memory(handle)
                .map_err(|e| wire_error("freeing device memory", &e))?;
        }
        let (mut guard, obj) = found.take();
        guard.release_area(&*self.host, obj.start, obj.size);
        log::debug!("released 0x{:x} ({} bytes)", obj.start, obj.size);
        Ok(())
    }

    /// Frees the allocation or drops one registration of the object
    /// starting at `address`. The base of a scratch backing releases the
    /// whole scratch area.
    ///
    /// # Errors
    /// `MemoryNotRegistered` when nothing starts at `address`.
    pub fn release(&self, address: u64) -> HsaResult<()> {
        let layout = self.layout()?;
        let location = layout.classify(address, self.is_dgpu);

        if let Location::Scratch { node_id } = location
            && layout.gpu(node_id)?.scratch_backing.base() == address
        {
            return self.release_scratch(node_id);
        }

        let found = Self::find_object(&layout, location, address, false)
            .ok_or(HsaError::MemoryNotRegistered)?;
        self.drop_reference(found)
    }

    /// Makes host memory the process owns reachable by the GPUs in `nodes`
    /// (all GPUs when empty).
    ///
    /// Registering the same range again with the same nodes adds a
    /// reference; with different nodes it fails.
    ///
    /// # Errors
    /// `InvalidParameter` for empty or wrapping ranges,
    /// `MemoryAlreadyRegistered` on a node-set mismatch, `InvalidNodeId` for
    /// nodes that are not GPUs, driver and VA failures otherwise.
    pub fn register_memory(
        &self,
        address: u64,
        size: u64,
        nodes: &[u32],
        flags: MemFlags,
    ) -> HsaResult<()> {
        if address == 0 || size == 0 {
            return Err(HsaError::InvalidParameter("empty registration"));
        }
        let (start, aligned_size) = self.page_span(address, size)?;
        let layout = self.layout()?;
        // APUs reach all system memory directly.
        if !self.is_dgpu {
            return Ok(());
        }
        let gpu_ids = Self::gpu_ids_of(&layout, nodes)?;

        let location = layout.classify(address, true);
        if matches!(location, Location::SvmDefault | Location::SvmAlt)
            && let Some(aperture) = layout.aperture(location)
            && let Some(mut own) = aperture.find_containing(Index::Device, address)
        {
            own.object_mut().set_registered_devices(gpu_ids);
            return Ok(());
        }

        if self.config.check_userptr {
            self.host.check_mapped(address, size)?;
        }

        if self.config.use_svm_api && layout.version.minor >= KFD_IOCTL_SVM_MINOR_VERSION {
            match self.register_svm_range(address, start, aligned_size, &gpu_ids, flags) {
                Ok(()) => return Ok(()),
                Err(HsaError::MemoryAlreadyRegistered) => {
                    return Err(HsaError::MemoryAlreadyRegistered);
                }
                Err(e) => log::warn!("SVM registration of 0x{address:x} failed, using userptr: {e}"),
            }
        }
        self.register_userptr(&layout, address, size, gpu_ids, flags)
    }

    /// Page-aligned start and length of `[address, address + size)`.
    fn page_span(&self, address: u64, size: u64) -> HsaResult<(u64, u64)> {
        let start = address & !(self.page_size - 1);
        let end = align_up(range_end(address, size)?, self.page_size)?;
        Ok((start, end - start))
    }

    /// Registers the pages `[start, start + size)` holding `address`.
    ///
    /// A range is identified by `address`; registering it again with a
    /// different extent or device set fails.
    fn register_svm_range(
        &self,
        address: u64,
        start: u64,
        size: u64,
        gpu_ids: &[u32],
        flags: MemFlags,
    ) -> HsaResult<()> {
        let devices: BTreeSet<u32> = gpu_ids.iter().copied().collect();
        let mut ranges = self
            .svm_ranges
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(range) = ranges.get_mut(&address) {
            if range.devices != devices || range.start != start || range.size != size {
                return Err(HsaError::MemoryAlreadyRegistered);
            }
            range.count += 1;
            return Ok(());
        }

        let mut svm_flags = KFD_IOCTL_SVM_FLAG_HOST_ACCESS;
        if !flags.coarse_grain {
            svm_flags |= KFD_IOCTL_SVM_FLAG_COHERENT;
        }
        self.channel()
            .svm_set_attributes(
                start,
                size,
                &[SvmAttribute {
                    type_: KFD_IOCTL_SVM_ATTR_SET_FLAGS,
                    value: svm_flags,
                }],
            )
            .map_err(|e| wire_error("setting SVM attributes", &e))?;

        ranges.insert(
            address,
            SvmRange {
                start,
                size,
                count: 1,
                devices,
                flags: svm_flags,
            },
        );
        Ok(())
    }

    fn register_userptr(
        &self,
        layout: &Layout,
        address: u64,
        size: u64,
        gpu_ids: Vec<u32>,
        flags: MemFlags,
    ) -> HsaResult<()> {
        let aperture = &layout.svm_default;
        let devices: BTreeSet<u32> = gpu_ids.iter().copied().collect();

        if let Some(mut known) = aperture.find(Index::User, address, size) {
            let obj = known.object_mut();
            if *obj.registered_devices() != devices {
                return Err(HsaError::MemoryAlreadyRegistered);
            }
            obj.registration_count += 1;
            return Ok(());
        }

        let gpu = layout
            .first_gpu()
            .ok_or(HsaError::NotSupported("no GPU node"))?;
        let (start, aligned_size) = self.page_span(address, size)?;

        let va = aperture
            .lock()
            .allocate_area(&*self.host, None, aligned_size, 0)
            .ok_or(HsaError::OutOfMemory)?;
        let allocated = self.alloc_backing(
            aperture,
            va,
            &AllocRequest {
                gpu_id: gpu.gpu_id,
                va,
                size: aligned_size,
                flags: self.ioc_flags(flags.executable(), KFD_IOC_ALLOC_MEM_FLAGS_USERPTR),
                mmap_offset: start,
            },
        )?;

        let mut guard = aperture.lock();
        // Another thread registered the same range while the lock was free.
        if let Some(id) = guard.objects.find_exact(Index::User, address, size) {
            let winner = guard.into_object(id);
            if let Err(e) = self.channel().free_memory(allocated.handle) {
                log::error!("freeing the losing userptr handle: {e}");
            }
            let Some(mut winner) = winner else {
                return Err(HsaError::MemoryNotRegistered);
            };
            winner.guard().release_area(&*self.host, va, aligned_size);
            let obj = winner.object_mut();
            if *obj.registered_devices() != devices {
                return Err(HsaError::MemoryAlreadyRegistered);
            }
            obj.registration_count += 1;
            return Ok(());
        }

        let mut obj = VmObject::new(va, aligned_size, allocated.handle, flags, gpu.node_id);
        obj.userptr = Some(UserPtr {
            addr: address,
            size,
        });
        obj.registration_count = 1;
        obj.set_registered_devices(gpu_ids);
        guard.insert(obj);
        log::debug!("registered userptr 0x{address:x} ({size} bytes) at GPU VA 0x{va:x}");
        Ok(())
    }

    /// Drops one registration of `address`.
    ///
    /// Userptr, imported and graphics objects lose a reference (and are
    /// freed with the last one); allocations made here only forget their
    /// registered nodes.
    ///
    /// # Errors
    /// `MemoryNotRegistered` when `address` is unknown.
    pub fn deregister_memory(&self, address: u64) -> HsaResult<()> {
        let layout = self.layout()?;
        if !self.is_dgpu {
            return Ok(());
        }
        if self.deregister_svm_range(address)? {
            return Ok(());
        }

        let location = layout.classify(address, true);
        let mut found = Self::find_object(&layout, location, address, false)
            .ok_or(HsaError::MemoryNotRegistered)?;
        let obj = found.object_mut();
        if obj.is_userptr() || obj.is_imported || obj.metadata.is_some() {
            self.drop_reference(found)
        } else {
            obj.clear_registered_devices();
            Ok(())
        }
    }

    fn deregister_svm_range(&self, address: u64) -> HsaResult<bool> {
        let mut ranges = self
            .svm_ranges
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(range) = ranges.get_mut(&address) else {
            return Ok(false);
        };
        range.count -= 1;
        if range.count > 0 {
            return Ok(true);
        }

        let (start, size, flags) = (range.start, range.size, range.flags);
        ranges.remove(&address);
        self.channel()
            .svm_set_attributes(
                start,
                size,
                &[SvmAttribute {
                    type_: KFD_IOCTL_SVM_ATTR_CLR_FLAGS,
                    value: flags,
                }],
            )
            .map_err(|e| wire_error("clearing SVM attributes", &e))?;
        Ok(true)
    }

    fn svm_range_containing(&self, address: u64) -> Option<SvmRange> {
        let ranges = self
            .svm_ranges
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        ranges
            .range(..=address)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(address))
            .cloned()
    }

    fn svm_access(&self, range: &SvmRange, gpu_ids: &[u32], access: u32) -> HsaResult<()> {
        let attrs: Vec<SvmAttribute> = gpu_ids
            .iter()
            .map(|&g| SvmAttribute {
                type_: access,
                value: g,
            })
            .collect();
        self.channel()
            .svm_set_attributes(range.start, range.size, &attrs)
            .map_err(|e| wire_error("setting SVM access", &e))
    }

    /// Device set a map without explicit nodes fans out to.
    fn default_targets(layout: &Layout, obj: &VmObject) -> Vec<u32> {
        if !obj.registered_devices().is_empty() {
            return obj.registered_devices().iter().copied().collect();
        }
        if !obj.is_userptr()
            && let Ok(gpu) = layout.gpu(obj.node_id)
        {
            return gpu.usable_peers.clone();
        }
        layout.all_gpu_ids()
    }

    /// Maps the object containing `address` to its GPUs and returns the
    /// GPU address of `address`.
    ///
    /// Repeated maps of a userptr object only count.
    ///
    /// # Errors
    /// `InvalidHandle` for VA-only reservations, `MemoryNotRegistered` for
    /// unknown addresses, driver failures otherwise. GPUs that did map
    /// before a failure stay recorded as mapped.
    pub fn map_to_gpu(&self, address: u64, size: u64) -> HsaResult<u64> {
        let layout = self.layout()?;
        let location = layout.classify(address, self.is_dgpu);
        match location {
            Location::MemHandle => {
                return Err(HsaError::InvalidParameter("opaque handles cannot be mapped"));
            }
            Location::Scratch { node_id } => {
                return self.map_scratch(&layout, node_id, address, size);
            }
            Location::CpuVm => {
                self.prefetch(&layout, address);
                return Ok(address);
            }
            _ => {}
        }

        if let Some(range) = self.svm_range_containing(address) {
            let targets = if range.devices.is_empty() {
                layout.all_gpu_ids()
            } else {
                range.devices.iter().copied().collect()
            };
            self.svm_access(&range, &targets, KFD_IOCTL_SVM_ATTR_ACCESS)?;
            return Ok(address);
        }

        let mut found = Self::find_object(&layout, location, address, true)
            .ok_or(HsaError::MemoryNotRegistered)?;
        let obj = found.object_mut();
        if obj.handle == 0 {
            return Err(HsaError::InvalidHandle);
        }
        let gpu_va = gpu_address(obj, address, self.page_size);
        if obj.is_userptr() && obj.mapping_count > 0 {
            obj.mapping_count += 1;
            return Ok(gpu_va);
        }

        let targets = Self::default_targets(&layout, obj);
        let fan = self.channel().map_to_devices(obj.handle, &targets);
        obj.add_mapped_devices(fan.succeeded(&targets));
        if let Some(e) = fan.error {
            return Err(wire_error("mapping to GPUs", &e));
        }
        obj.mapping_count += 1;
        log::trace!("mapped 0x{address:x} to {targets:?}");
        Ok(gpu_va)
    }

    /// Faults in host pages of an APU allocation.
    fn prefetch(&self, layout: &Layout, address: u64) {
        let Some(found) = layout.cpuvm.find_containing(Index::Device, address) else {
            return;
        };
        let (start, size) = (found.object().start, found.object().size);
        drop(found);
        // SAFETY: the range is an anonymous read/write mapping this manager
        // created and still tracks.
        unsafe { self.host.touch_pages(start, size) };
    }

    /// Undoes [`MemoryManager::map_to_gpu`].
    ///
    /// A userptr object is unmapped only when its last map goes away.
    ///
    /// # Errors
    /// As for [`MemoryManager::map_to_gpu`].
    pub fn unmap_from_gpu(&self, address: u64) -> HsaResult<()> {
        let layout = self.layout()?;
        let location = layout.classify(address, self.is_dgpu);
        match location {
            Location::MemHandle => {
                return Err(HsaError::InvalidParameter("opaque handles cannot be mapped"));
            }
            Location::Scratch { node_id } => return self.unmap_scratch(&layout, node_id, address),
            Location::CpuVm => return Ok(()),
            _ => {}
        }

        if let Some(range) = self.svm_range_containing(address) {
            let targets = if range.devices.is_empty() {
                layout.all_gpu_ids()
            } else {
                range.devices.iter().copied().collect()
            };
            return self.svm_access(&range, &targets, KFD_IOCTL_SVM_ATTR_NO_ACCESS);
        }

        let mut found = Self::find_object(&layout, location, address, true)
            .ok_or(HsaError::MemoryNotRegistered)?;
        let obj = found.object_mut();
        if obj.handle == 0 {
            return Err(HsaError::InvalidHandle);
        }
        if obj.is_userptr() {
            // A failed first map leaves its mapped prefix behind uncounted.
            if obj.mapping_count == 0 && obj.mapped_devices().is_empty() {
                return Ok(());
            }
            obj.mapping_count = obj.mapping_count.saturating_sub(1);
            if obj.mapping_count > 0 {
                return Ok(());
            }
        } else {
            obj.mapping_count = obj.mapping_count.saturating_sub(1);
        }

        let targets: Vec<u32> = obj.mapped_devices().iter().copied().collect();
        if targets.is_empty() {
            return Ok(());
        }
        let fan = self.channel().unmap_from_devices(obj.handle, &targets);
        obj.remove_mapped_devices(fan.succeeded(&targets));
        if let Some(e) = fan.error {
            return Err(wire_error("unmapping from GPUs", &e));
        }
        log::trace!("unmapped 0x{address:x} from {targets:?}");
        Ok(())
    }

    /// Maps the object containing `address` to exactly the GPUs of `nodes`.
    ///
    /// GPUs mapped before but not requested are unmapped first; requested
    /// ones not yet mapped are mapped after.
    ///
    /// # Errors
    /// `InvalidParameter` when a requested GPU is outside the registered
    /// set, plus the failures of [`MemoryManager::map_to_gpu`].
    pub fn map_to_nodes(&self, address: u64, nodes: &[u32]) -> HsaResult<u64> {
        if nodes.is_empty() {
            return Err(HsaError::InvalidParameter("no nodes to map to"));
        }
        let layout = self.layout()?;
        let requested: BTreeSet<u32> = Self::gpu_ids_of(&layout, nodes)?.into_iter().collect();
        let location = layout.classify(address, self.is_dgpu);

        if let Some(range) = self.svm_range_containing(address) {
            if !range.devices.is_empty() && !requested.is_subset(&range.devices) {
                return Err(HsaError::InvalidParameter("node outside the registered set"));
            }
            let targets: Vec<u32> = requested.into_iter().collect();
            self.svm_access(&range, &targets, KFD_IOCTL_SVM_ATTR_ACCESS)?;
            return Ok(address);
        }

        let mut found = Self::find_object(&layout, location, address, true)
            .ok_or(HsaError::MemoryNotRegistered)?;
        let obj = found.object_mut();
        let allowed: BTreeSet<u32> = if obj.registered_devices().is_empty() {
            layout.all_gpu_ids().into_iter().collect()
        } else {
            obj.registered_devices().clone()
        };
        if !requested.is_subset(&allowed) {
            return Err(HsaError::InvalidParameter("node outside the registered set"));
        }
        if obj.handle == 0 {
            return Err(HsaError::InvalidHandle);
        }

        let stale: Vec<u32> = obj.mapped_devices().difference(&requested).copied().collect();
        if !stale.is_empty() {
            let fan = self.channel().unmap_from_devices(obj.handle, &stale);
            obj.remove_mapped_devices(fan.succeeded(&stale));
            if let Some(e) = fan.error {
                return Err(wire_error("unmapping from GPUs", &e));
            }
        }

        let fresh: Vec<u32> = requested.difference(obj.mapped_devices()).copied().collect();
        if !fresh.is_empty() {
            let fan = self.channel().map_to_devices(obj.handle, &fresh);
            obj.add_mapped_devices(fan.succeeded(&fresh));
            if let Some(e) = fan.error {
                return Err(wire_error("mapping to GPUs", &e));
            }
        }

        obj.mapping_count = obj.mapping_count.max(1);
        Ok(gpu_address(obj, address, self.page_size))
    }

    /// Reserves the scratch backing of `node_id` and returns its base.
    ///
    /// # Errors
    /// Fails if the node already has scratch backing, or on VA exhaustion.
    pub fn allocate_scratch(&self, node_id: u32, size: u64) -> HsaResult<u64> {
        if size == 0 {
            return Err(HsaError::InvalidParameter("size must be non-zero"));
        }
        let size = align_up(size, SCRATCH_ALIGN)?;
        let layout = self.layout()?;
        let gpu = layout.gpu(node_id)?;
        if gpu.scratch_claimed.swap(true, Ordering::AcqRel) {
            return Err(HsaError::InvalidParameter("scratch backing already allocated"));
        }

        let source = if self.is_dgpu {
            &layout.svm_default
        } else {
            &layout.cpuvm
        };
        let Some(base) = source
            .lock()
            .allocate_area(&*self.host, None, size, SCRATCH_ALIGN)
        else {
            gpu.scratch_claimed.store(false, Ordering::Release);
            return Err(HsaError::OutOfMemory);
        };

        if !self.is_dgpu
            && let Err(e) = self.channel().set_scratch_backing_va(gpu.gpu_id, base)
        {
            source.lock().release_area(&*self.host, base, size);
            gpu.scratch_claimed.store(false, Ordering::Release);
            return Err(wire_error("programming the scratch base", &e));
        }

        gpu.scratch_backing.set_bounds(base, base + size - 1);
        log::debug!("scratch for node {node_id}: 0x{base:x} ({size} bytes)");
        Ok(base)
    }

    /// Unmaps and frees one scratch sub-allocation, with its aperture
    /// locked.
    fn destroy_scratch_object(&self, guard: &mut ApertureGuard<'_>, obj: &VmObject) {
        let mapped: Vec<u32> = obj.mapped_devices().iter().copied().collect();
        if !mapped.is_empty()
            && let Some(e) = self.channel().unmap_from_devices(obj.handle, &mapped).error
        {
            log::error!("unmapping scratch 0x{:x}: {e}", obj.start);
        }
        if let Err(e) = self.channel().free_memory(obj.handle) {
            log::error!("freeing scratch 0x{:x}: {e}", obj.start);
        }
        guard.release_area(&*self.host, obj.start, obj.size);
    }

    /// Releases the scratch backing of `node_id` and everything mapped in it.
    ///
    /// # Errors
    /// `InvalidParameter` when the node has no scratch backing.
    pub fn release_scratch(&self, node_id: u32) -> HsaResult<()> {
        let layout = self.layout()?;
        let gpu = layout.gpu(node_id)?;
        if !gpu.scratch_claimed.load(Ordering::Acquire) {
            return Err(HsaError::InvalidParameter("no scratch backing allocated"));
        }
        let (base, limit) = gpu.scratch_backing.bounds();

        loop {
            let mut guard = gpu.scratch_backing.lock();
            let Some(id) = guard.objects.any() else {
                break;
            };
            let Some(obj) = guard.objects.remove(id) else {
                break;
            };
            self.destroy_scratch_object(&mut guard, &obj);
        }

        if base != 0 {
            let source = if self.is_dgpu {
                &layout.svm_default
            } else {
                &layout.cpuvm
            };
            source
                .lock()
                .release_area(&*self.host, base, limit - base + 1);
        }
        gpu.scratch_backing.set_bounds(0, 0);
        gpu.scratch_claimed.store(false, Ordering::Release);
        Ok(())
    }

    /// Backs `[address, address + size)` of the scratch window with VRAM
    /// of its GPU. APUs need no backing.
    fn map_scratch(&self, layout: &Layout, node_id: u32, address: u64, size: u64) -> HsaResult<u64> {
        if !self.is_dgpu {
            return Ok(address);
        }
        let gpu = layout.gpu(node_id)?;
        let size = align_up(size.max(1), self.page_size)?;
        let mut guard = gpu.scratch_backing.lock();
        if guard.objects.find_exact(Index::Device, address, size).is_some() {
            return Ok(address);
        }

        let va = guard
            .allocate_area(&*self.host, Some(address), size, 0)
            .ok_or(HsaError::OutOfMemory)?;
        let allocated = match self.channel().alloc_memory(&AllocRequest {
            gpu_id: gpu.gpu_id,
            va,
            size,
            flags: KFD_IOC_ALLOC_MEM_FLAGS_VRAM | KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE,
            mmap_offset: 0,
        }) {
            Ok(a) => a,
            Err(e) => {
                guard.release_area(&*self.host, va, size);
                return Err(wire_error("allocating scratch memory", &e));
            }
        };

        let mut obj = VmObject::new(va, size, allocated.handle, MemFlags::new().non_paged(), node_id);
        let mapped = gpu.render_fd().and_then(|fd| {
            self.host
                .map_device(va, size, false, fd, allocated.mmap_offset)
                .map_err(HsaError::from)
        });
        if let Err(e) = mapped {
            self.destroy_scratch_object(&mut guard, &obj);
            return Err(e);
        }

        let fan = self.channel().map_to_devices(allocated.handle, &[gpu.gpu_id]);
        obj.add_mapped_devices(fan.succeeded(&[gpu.gpu_id]));
        if let Some(e) = fan.error {
            self.destroy_scratch_object(&mut guard, &obj);
            return Err(wire_error("mapping scratch", &e));
        }
        obj.mapping_count = 1;
        guard.insert(obj);
        Ok(va)
    }

    fn unmap_scratch(&self, layout: &Layout, node_id: u32, address: u64) -> HsaResult<()> {
        if !self.is_dgpu {
            return Ok(());
        }
        let gpu = layout.gpu(node_id)?;
        let found = gpu
            .scratch_backing
            .find(Index::Device, address, 0)
            .ok_or(HsaError::MemoryNotRegistered)?;
        let (mut guard, obj) = found.take();
        self.destroy_scratch_object(&mut guard, &obj);
        Ok(())
    }

    /// Exports the allocation starting at `address` for another process.
    ///
    /// # Errors
    /// `MemoryNotRegistered` for unknown addresses, `InvalidHandle` for
    /// VA-only reservations.
    pub fn share_memory(&self, address: u64) -> HsaResult<SharedMemory> {
        let layout = self.layout()?;
        let location = layout.classify(address, self.is_dgpu);
        let found = Self::find_object(&layout, location, address, false)
            .ok_or(HsaError::MemoryNotRegistered)?;
        let obj = found.object();
        if obj.handle == 0 {
            return Err(HsaError::InvalidHandle);
        }
        let gpu = layout
            .gpu(obj.node_id)
            .ok()
            .or_else(|| layout.first_gpu())
            .ok_or(HsaError::NotSupported("no GPU node"))?;
        let share = self
            .channel()
            .ipc_export(gpu.gpu_id, obj.handle)
            .map_err(|e| wire_error("exporting a share handle", &e))?;
        Ok(SharedMemory {
            share,
            size: obj.size,
        })
    }

    /// Imports memory shared by another process into the SVM window.
    ///
    /// # Errors
    /// Fails on VA exhaustion or a failed import.
    pub fn register_shared_memory(&self, shared: &SharedMemory) -> HsaResult<Allocation> {
        let layout = self.layout()?;
        let gpu = layout
            .first_gpu()
            .ok_or(HsaError::NotSupported("no GPU node"))?;
        let aperture = &layout.svm_default;
        let size = align_up(shared.size, self.page_size)?;
        let va = aperture
            .lock()
            .allocate_area(&*self.host, None, size, 0)
            .ok_or(HsaError::OutOfMemory)?;

        let imported = match self.channel().ipc_import(gpu.gpu_id, va, shared.share) {
            Ok(h) => h,
            Err(e) => {
                self.unwind(aperture, va, size, None);
                return Err(wire_error("importing a share handle", &e));
            }
        };

        let flags = MemFlags::from_ioc_flags(imported.flags);
        if flags.host_access {
            let mapped = gpu.render_fd().and_then(|fd| {
                self.host
                    .map_device(va, size, true, fd, imported.mmap_offset)
                    .map_err(HsaError::from)
            });
            if let Err(e) = mapped {
                self.unwind(aperture, va, size, Some(imported.handle));
                return Err(e);
            }
        }

        let mut obj = VmObject::new(va, size, imported.handle, flags, gpu.node_id);
        obj.is_imported = true;
        obj.registration_count = 1;
        aperture.lock().insert(obj);
        Ok(Allocation {
            addr: va,
            size,
            handle: imported.handle,
            node_id: gpu.node_id,
        })
    }

    /// Imports a foreign graphics buffer for the GPUs of `nodes`.
    ///
    /// # Errors
    /// Fails when the buffer belongs to an unknown GPU, on VA exhaustion or
    /// a failed import.
    pub fn register_graphics_handle(
        &self,
        dmabuf_fd: RawFd,
        nodes: &[u32],
    ) -> HsaResult<GraphicsResource> {
        let layout = self.layout()?;
        let gpu_ids = Self::gpu_ids_of(&layout, nodes)?;
        let info = self
            .channel()
            .dmabuf_info(dmabuf_fd)
            .map_err(|e| wire_error("querying a dma-buf", &e))?;
        let node_id = layout
            .node_of(info.gpu_id)
            .ok_or(HsaError::InvalidParameter("dma-buf from an unknown GPU"))?;

        let aperture = &layout.svm_default;
        let size = align_up(info.size, self.page_size)?;
        let va = aperture
            .lock()
            .allocate_area(&*self.host, None, size, 0)
            .ok_or(HsaError::OutOfMemory)?;
        let handle = match self.channel().import_dmabuf(dmabuf_fd, info.gpu_id, va) {
            Ok(h) => h,
            Err(e) => {
                self.unwind(aperture, va, size, None);
                return Err(wire_error("importing a dma-buf", &e));
            }
        };

        let mut obj = VmObject::new(va, size, handle, MemFlags::from_ioc_flags(info.flags), node_id);
        obj.is_imported = true;
        obj.registration_count = 1;
        obj.metadata = Some(info.metadata.clone());
        obj.set_registered_devices(gpu_ids);
        aperture.lock().insert(obj);

        Ok(GraphicsResource {
            addr: va,
            size,
            metadata: info.metadata,
            node_id,
        })
    }

    /// Exports `[address, address + size)` as a dma-buf. Returns the fd and
    /// the offset of `address` inside the exported buffer.
    ///
    /// # Errors
    /// `NotSupported` on drivers before minor version 12, `InvalidParameter`
    /// when the range leaves its object.
    pub fn export_dmabuf(&self, address: u64, size: u64) -> HsaResult<(OwnedFd, u64)> {
        let layout = self.layout()?;
        if layout.version.minor < KFD_IOCTL_EXPORT_DMABUF_MINOR_VERSION {
            return Err(HsaError::NotSupported("dma-buf export"));
        }
        let location = layout.classify(address, self.is_dgpu);
        let found = Self::find_object(&layout, location, address, true)
            .ok_or(HsaError::MemoryNotRegistered)?;
        let obj = found.object();
        if obj.handle == 0 {
            return Err(HsaError::InvalidHandle);
        }
        let offset = address - obj.start;
        if offset.checked_add(size).is_none_or(|end| end > obj.size) {
            return Err(HsaError::InvalidParameter("range exceeds the allocation"));
        }
        let fd = self
            .channel()
            .export_dmabuf(obj.handle)
            .map_err(|e| wire_error("exporting a dma-buf", &e))?;
        Ok((fd, offset))
    }

    /// Describes the object containing `address`.
    ///
    /// # Errors
    /// `MemoryNotRegistered` when no object contains `address`.
    pub fn memory_info(&self, address: u64) -> HsaResult<MemoryInfo> {
        let layout = self.layout()?;
        let location = layout.classify(address, self.is_dgpu);
        let mut found = Self::find_object(&layout, location, address, true)
            .ok_or(HsaError::MemoryNotRegistered)?;
        let to_node = |gpu_id| layout.node_of(gpu_id);
        let obj = found.object_mut();
        let registered_nodes = obj.registered_node_ids(to_node).to_vec();
        let mapped_nodes = obj.mapped_node_ids(to_node).to_vec();
        Ok(MemoryInfo {
            start: obj.start,
            size: obj.size,
            userptr: obj.userptr,
            handle: obj.handle,
            flags: obj.flags,
            node_id: obj.node_id,
            registered_nodes,
            mapped_nodes,
            metadata: obj.metadata.clone(),
            user_data: obj.user_data,
            is_imported: obj.is_imported,
        })
    }

    /// Attaches an opaque value to the object containing `address`.
    ///
    /// # Errors
    /// `MemoryNotRegistered` when no object contains `address`.
    pub fn set_user_data(&self, address: u64, data: u64) -> HsaResult<()> {
        let layout = self.layout()?;
        let location = layout.classify(address, self.is_dgpu);
        let mut found = Self::find_object(&layout, location, address, true)
            .ok_or(HsaError::MemoryNotRegistered)?;
        found.object_mut().user_data = data;
        Ok(())
    }

    /// Driver handle of the object containing `address`.
    ///
    /// # Errors
    /// `MemoryNotRegistered` when no object contains `address`.
    pub fn handle_of(&self, address: u64) -> HsaResult<u64> {
        let layout = self.layout()?;
        let location = layout.classify(address, self.is_dgpu);
        let found = Self::find_object(&layout, location, address, true)
            .ok_or(HsaError::MemoryNotRegistered)?;
        Ok(found.object().handle)
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let slot = self.layout.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(layout) = slot.current.take() {
            layout.release_reservation(&*self.host);
        }
    }
}
