//! The process' aperture layout and how it is brought up.

use super::aperture::{Aperture, ApertureKind, Strategy};
use super::host::{HostVm, Placement};
use super::vm_area::GPU_HUGE_PAGE_SIZE;
use crate::error::{HsaError, HsaResult};
use crate::kfd::channel::{DeviceApertures, DeviceChannel, DriverVersion, MemoryPolicy};
use crate::kfd::ioctl::{KFD_IOC_CACHE_POLICY_COHERENT, KFD_IOC_CACHE_POLICY_NONCOHERENT};
use crate::thunk::config::FmmConfig;
use crate::thunk::topology::{EngineVersion, NodeInfo};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Only the low 40 bits (what GFX8 can address) are ever reserved.
const SVM_RESERVATION_LIMIT: u64 = (1 << 40) - 1;
const SVM_MIN_VM_SIZE: u64 = 4 << 30;
const START_NON_CANONICAL_ADDR: u64 = 1 << 47;
const END_NON_CANONICAL_ADDR: u64 = !0 - (1 << 47);
const SVM_ALT_ALIGN: u64 = 0x10000;

const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

const fn overlap(a_base: u64, a_limit: u64, b_base: u64, b_limit: u64) -> bool {
    (a_base >= b_base && a_base <= b_limit) || (b_base >= a_base && b_base <= a_limit)
}

/// Which aperture an address falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    MemHandle,
    Scratch { node_id: u32 },
    Gpuvm { node_id: u32 },
    SvmDefault,
    SvmAlt,
    /// Outside every window on a dGPU: host memory this process did not
    /// allocate through us. Tracked by the default SVM aperture.
    External,
    CpuVm,
}

impl Location {
    #[must_use]
    pub const fn kind(self) -> ApertureKind {
        match self {
            Self::MemHandle => ApertureKind::MemHandle,
            Self::Scratch { .. } => ApertureKind::ScratchBacking,
            Self::Gpuvm { .. } => ApertureKind::Gpuvm,
            Self::SvmDefault | Self::External => ApertureKind::SvmDefault,
            Self::SvmAlt => ApertureKind::SvmAlt,
            Self::CpuVm => ApertureKind::CpuVm,
        }
    }

    /// Whether objects found here may be userptr registrations.
    #[must_use]
    pub const fn is_svm(self) -> bool {
        matches!(self, Self::SvmDefault | Self::SvmAlt | Self::External)
    }
}

/// Per-GPU memory state.
#[derive(Debug)]
pub struct GpuMem {
    pub node_id: u32,
    pub gpu_id: u32,
    pub engine: EngineVersion,
    pub lds: (u64, u64),
    pub scratch_window: (u64, u64),
    /// VA backing the scratch window; invalid until scratch is allocated.
    pub scratch_backing: Aperture,
    pub scratch_claimed: AtomicBool,
    /// Private window of GPUs that do not address through SVM.
    pub gpuvm: Aperture,
    /// GPUs that can map memory local to this one, itself first.
    pub usable_peers: Vec<u32>,
    render_fd: Mutex<Option<OwnedFd>>,
}

impl GpuMem {
    pub fn render_fd(&self) -> HsaResult<RawFd> {
        self.render_fd
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| HsaError::General(format!("render node of GPU {} closed", self.gpu_id)))
    }

    pub fn close_render_fd(&self) {
        self.render_fd
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn windows(&self) -> [(u64, u64); 3] {
        [self.lds, self.scratch_window, self.gpuvm.bounds()]
    }
}

/// Everything bootstrap derives from topology and the driver.
#[derive(Debug)]
pub struct Layout {
    pub version: DriverVersion,
    pub gpus: Vec<GpuMem>,
    pub svm_default: Aperture,
    pub svm_alt: Aperture,
    pub cpuvm: Aperture,
    pub mem_handle: Aperture,
    /// Host reservation backing the SVM apertures, if this process made one.
    svm_reservation: Mutex<Option<(u64, u64)>>,
}

impl Layout {
    pub fn gpu(&self, node_id: u32) -> HsaResult<&GpuMem> {
        self.gpus
            .iter()
            .find(|g| g.node_id == node_id)
            .ok_or(HsaError::InvalidNodeId(node_id))
    }

    #[must_use]
    pub fn gpu_by_id(&self, gpu_id: u32) -> Option<&GpuMem> {
        self.gpus.iter().find(|g| g.gpu_id == gpu_id)
    }

    #[must_use]
    pub fn node_of(&self, gpu_id: u32) -> Option<u32> {
        self.gpu_by_id(gpu_id).map(|g| g.node_id)
    }

    #[must_use]
    pub fn all_gpu_ids(&self) -> Vec<u32> {
        self.gpus.iter().map(|g| g.gpu_id).collect()
    }

    #[must_use]
    pub fn first_gpu(&self) -> Option<&GpuMem> {
        self.gpus.first()
    }

    /// The coherent SVM aperture, or the default one when the window is
    /// not split.
    #[must_use]
    pub fn svm_coherent(&self) -> &Aperture {
        if self.svm_alt.is_valid() {
            &self.svm_alt
        } else {
            &self.svm_default
        }
    }

    #[must_use]
    pub fn svm_reservation(&self) -> Option<(u64, u64)> {
        *self
            .svm_reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock-free address classification.
    #[must_use]
    pub fn classify(&self, addr: u64, is_dgpu: bool) -> Location {
        if self.mem_handle.contains(addr) {
            return Location::MemHandle;
        }
        for gpu in &self.gpus {
            if gpu.scratch_backing.contains(addr) {
                return Location::Scratch {
                    node_id: gpu.node_id,
                };
            }
            if gpu.gpuvm.contains(addr) {
                return Location::Gpuvm {
                    node_id: gpu.node_id,
                };
            }
        }
        if self.svm_default.contains(addr) {
            Location::SvmDefault
        } else if self.svm_alt.contains(addr) {
            Location::SvmAlt
        } else if is_dgpu {
            Location::External
        } else {
            Location::CpuVm
        }
    }

    #[must_use]
    pub fn aperture(&self, location: Location) -> Option<&Aperture> {
        match location {
            Location::MemHandle => Some(&self.mem_handle),
            Location::Scratch { node_id } => self.gpu(node_id).ok().map(|g| &g.scratch_backing),
            Location::Gpuvm { node_id } => self.gpu(node_id).ok().map(|g| &g.gpuvm),
            Location::SvmDefault | Location::External => Some(&self.svm_default),
            Location::SvmAlt => Some(&self.svm_alt),
            Location::CpuVm => Some(&self.cpuvm),
        }
    }

    fn apertures(&self) -> impl Iterator<Item = &Aperture> {
        [&self.svm_default, &self.svm_alt, &self.cpuvm, &self.mem_handle]
            .into_iter()
            .chain(self.gpus.iter().flat_map(|g| [&g.scratch_backing, &g.gpuvm]))
    }

    /// Forgets everything the parent process owned.
    ///
    /// No driver call is made: the parent's handles mean nothing here. The
    /// SVM reservation is re-established in place so the window stays ours;
    /// if that fails the next bootstrap searches for a new one.
    pub fn abandon(&self, host: &dyn HostVm) -> usize {
        let dropped = self.apertures().map(Aperture::clear).sum();

        for gpu in &self.gpus {
            gpu.close_render_fd();
            gpu.scratch_backing.set_bounds(0, 0);
            gpu.scratch_claimed.store(false, Ordering::Release);
        }

        let mut reservation = self
            .svm_reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((base, limit)) = *reservation
            && let Err(e) = host.reserve(Placement::Fixed(base), limit - base + 1)
        {
            log::warn!("could not keep the SVM window 0x{base:x}-0x{limit:x} after fork: {e}");
            *reservation = None;
            self.svm_default.set_bounds(0, 0);
            self.svm_alt.set_bounds(0, 0);
        }
        dropped
    }

    /// Gives the SVM reservation back to the OS.
    pub fn release_reservation(&self, host: &dyn HostVm) {
        let taken = self
            .svm_reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((base, limit)) = taken
            && let Err(e) = host.unmap(base, limit - base + 1)
        {
            log::warn!("unmapping SVM window 0x{base:x}-0x{limit:x}: {e}");
        }
    }
}

struct SvmApertures {
    default: Aperture,
    alt: Aperture,
    reservation: Option<(u64, u64)>,
}

impl SvmApertures {
    fn none(page: u64) -> Self {
        Self {
            default: Aperture::builder(ApertureKind::SvmDefault, page).build(),
            alt: Aperture::builder(ApertureKind::SvmAlt, page).build(),
            reservation: None,
        }
    }

    /// Splits a reserved window: the first quarter, 64 KiB aligned, is the
    /// coherent alt aperture and the rest the default one.
    fn reserved(base: u64, limit: u64, align: u64, guard_pages: u64, page: u64) -> Self {
        let alt_base = align_up(base, SVM_ALT_ALIGN);
        let alt_size = align_up((limit - base + 1) >> 2, SVM_ALT_ALIGN);
        let alt_limit = alt_base + alt_size - 1;

        let build = |kind, base, limit| {
            Aperture::builder(kind, page)
                .bounds(base, limit)
                .align(align)
                .guard_pages(guard_pages)
                .cpu_accessible(true)
                .build()
        };

        log::info!("SVM alt (coherent): 0x{alt_base:x} - 0x{alt_limit:x}");
        log::info!("SVM (non-coherent): 0x{:x} - 0x{limit:x}", alt_limit + 1);

        Self {
            alt: build(ApertureKind::SvmAlt, alt_base, alt_limit),
            default: build(ApertureKind::SvmDefault, alt_limit + 1, limit),
            reservation: Some((base, limit)),
        }
    }
}

/// Searches for a no-access reservation of at least [`SVM_MIN_VM_SIZE`]
/// whose start is GPU addressable.
///
/// Start addresses are tried in huge-page steps; when nothing fits, the
/// requested length is halved.
fn reserve_svm_window(host: &dyn HostVm, base: u64, limit: u64, page: u64) -> Option<(u64, u64)> {
    let mut len = limit - base + 1;

    while len >= SVM_MIN_VM_SIZE {
        let half = (len + 1) >> 1;
        let mut found = None;
        let mut addr = base;

        while addr + half - 1 <= limit {
            let top = (addr + len).min(limit + 1);
            let map_size = (top - addr) & !(page - 1);
            if map_size < SVM_MIN_VM_SIZE {
                break;
            }
            let Ok(ret) = host.reserve(Placement::Hint(addr), map_size) else {
                break;
            };
            // At least half of it is GPU addressable: take it.
            if ret + half - 1 <= limit {
                found = Some((ret, map_size));
                break;
            }
            let _ = host.unmap(ret, map_size);
            addr += GPU_HUGE_PAGE_SIZE;
        }

        let Some((ret, map_size)) = found else {
            log::warn!("failed to reserve {} GiB for SVM", len >> 30);
            len >>= 1;
            continue;
        };

        if ret + SVM_MIN_VM_SIZE - 1 > limit {
            log::warn!(
                "got {} GiB for SVM at 0x{ret:x} with only {} GiB usable",
                map_size >> 30,
                limit.saturating_sub(ret) >> 30
            );
            let _ = host.unmap(ret, map_size);
            len >>= 1;
            continue;
        }
        return Some((ret, map_size));
    }
    None
}

fn init_svm(
    host: &dyn HostVm,
    config: &FmmConfig,
    base: u64,
    limit: u64,
    align: u64,
    preserved: Option<(u64, u64)>,
) -> HsaResult<SvmApertures> {
    let page = host.page_size();
    let guard_pages = u64::from(config.guard_pages);

    // Inherited from the parent process: keep using it.
    if let Some((base, limit)) = preserved {
        return Ok(SvmApertures::reserved(base, limit, align, guard_pages, page));
    }

    let base = align_up(base, GPU_HUGE_PAGE_SIZE);
    let mut limit = ((limit + 1) & !(GPU_HUGE_PAGE_SIZE - 1)).wrapping_sub(1);

    // GPUs covering the whole 47-bit space need no MTYPE split; mmap picks
    // addresses they can all reach.
    if limit >= START_NON_CANONICAL_ADDR - 1 && !config.reserve_svm && align <= page {
        let default = Aperture::builder(ApertureKind::SvmDefault, page)
            .bounds(base, limit)
            .align(align)
            .guard_pages(guard_pages)
            .max_align(page << config.max_va_align_order)
            .cpu_accessible(true)
            .strategy(Strategy::Mmap)
            .build();

        let probe = default.lock().allocate_area(host, None, page, 0);
        if let Some(addr) = probe {
            default.lock().release_area(host, addr, page);
            log::info!("unreserved SVM aperture: 0x{base:x} - 0x{limit:x}");
            return Ok(SvmApertures {
                default,
                alt: Aperture::builder(ApertureKind::SvmAlt, page).build(),
                reservation: None,
            });
        }
        log::warn!("unreserved SVM address space unavailable, falling back to a reservation");
    }

    limit = limit.min(SVM_RESERVATION_LIMIT);
    if base >= limit {
        return Err(HsaError::General(
            "no SVM range compatible with all GPUs".to_string(),
        ));
    }

    let (start, map_size) =
        reserve_svm_window(host, base, limit, page).ok_or(HsaError::OutOfMemory)?;

    if start + map_size - 1 > limit {
        // Trim the tail the GPUs cannot address.
        let _ = host.unmap(limit + 1, start + map_size - 1 - limit);
    } else {
        limit = start + map_size - 1;
    }

    Ok(SvmApertures::reserved(start, limit, align, guard_pages, page))
}

/// First 2^47-sized hole in the non-canonical range clear of every GPU window.
fn mem_handle_window(gpus: &[GpuMem]) -> Option<(u64, u64)> {
    let mut base = START_NON_CANONICAL_ADDR;
    while base < END_NON_CANONICAL_ADDR - 1 {
        let limit = base + (START_NON_CANONICAL_ADDR - 1);
        let clash = gpus
            .iter()
            .flat_map(GpuMem::windows)
            .any(|(b, l)| l != 0 && overlap(b, l, base, limit));
        if !clash {
            return Some((base, limit));
        }
        base += START_NON_CANONICAL_ADDR;
    }
    None
}

/// Usable peers per GPU: itself plus every GPU whose node links to it.
fn usable_peers(nodes: &[NodeInfo], gpu: &NodeInfo) -> Vec<u32> {
    let mut peers = vec![gpu.gpu_id];
    for other in nodes.iter().filter(|n| n.is_gpu() && n.gpu_id != gpu.gpu_id) {
        if other.io_links.contains(&gpu.node_id) && !peers.contains(&other.gpu_id) {
            peers.push(other.gpu_id);
        }
    }
    peers
}

/// Builds the layout from topology input and the driver's aperture report.
///
/// Render nodes are opened and every GPU's VM is acquired. `preserved` is
/// an SVM reservation inherited from before a fork.
pub fn bootstrap(
    channel: &dyn DeviceChannel,
    host: &dyn HostVm,
    config: &FmmConfig,
    nodes: &[NodeInfo],
    is_dgpu: bool,
    preserved: Option<(u64, u64)>,
) -> HsaResult<Layout> {
    let page = host.page_size();
    let guard_pages = u64::from(config.guard_pages);
    let version = channel.version()?;

    let num_nodes =
        u32::try_from(nodes.len()).map_err(|_| HsaError::InvalidParameter("too many nodes"))?;
    let reported = channel.process_apertures(num_nodes)?;

    let mut svm_base = 0;
    let mut svm_limit = 0;
    let mut canonical = Vec::new();
    let mut gpus = Vec::new();

    for node in nodes.iter().filter(|n| n.is_gpu()) {
        let fd = host.open_render_node(node.drm_render_minor)?;
        let ap = reported
            .iter()
            .find(|a| a.gpu_id == node.gpu_id)
            .copied()
            .unwrap_or_else(|| {
                log::warn!("driver reported no apertures for GPU {}", node.gpu_id);
                DeviceApertures::default()
            });

        let mut gpuvm = Aperture::builder(ApertureKind::Gpuvm, page).build();
        if ap.gpuvm_limit != 0 && ap.gpuvm_limit < START_NON_CANONICAL_ADDR {
            svm_base = svm_base.max(ap.gpuvm_base);
            if svm_limit == 0 || ap.gpuvm_limit < svm_limit {
                svm_limit = ap.gpuvm_limit;
            }
            canonical.push(node.gpu_id);
        } else if ap.gpuvm_limit != 0 {
            gpuvm = Aperture::builder(ApertureKind::Gpuvm, page)
                .bounds(ap.gpuvm_base, ap.gpuvm_limit)
                .guard_pages(guard_pages)
                .build();
            // Keep offset zero unused so no valid address maps to null.
            let align = gpuvm.align();
            let _ = gpuvm.lock().allocate_area(host, None, align, 0);
        }

        channel
            .acquire_vm(node.gpu_id, fd.as_raw_fd())
            .map_err(|e| HsaError::Driver(format!("acquire VM for GPU {}: {e}", node.gpu_id)))?;

        gpus.push(GpuMem {
            node_id: node.node_id,
            gpu_id: node.gpu_id,
            engine: node.engine,
            lds: (ap.lds_base, ap.lds_limit),
            scratch_window: (ap.scratch_base, ap.scratch_limit),
            scratch_backing: Aperture::builder(ApertureKind::ScratchBacking, page)
                .cpu_accessible(true)
                .build(),
            scratch_claimed: AtomicBool::new(false),
            gpuvm,
            usable_peers: usable_peers(nodes, node),
            render_fd: Mutex::new(Some(fd)),
        });
    }

    let svm = if svm_limit > 0 {
        init_svm(host, config, svm_base, svm_limit, page, preserved)?
    } else {
        SvmApertures::none(page)
    };

    if svm.default.is_valid() {
        let coherent = if svm.alt.is_valid() { &svm.alt } else { &svm.default };
        let (alt_base, alt_limit) = coherent.bounds();
        let default_policy = if config.disable_cache {
            KFD_IOC_CACHE_POLICY_COHERENT
        } else {
            KFD_IOC_CACHE_POLICY_NONCOHERENT
        };
        for &gpu_id in &canonical {
            channel
                .set_memory_policy(&MemoryPolicy {
                    gpu_id,
                    default_policy,
                    alt_policy: KFD_IOC_CACHE_POLICY_COHERENT,
                    alt_base,
                    alt_size: alt_limit - alt_base + 1,
                })
                .map_err(|e| HsaError::Driver(format!("memory policy for GPU {gpu_id}: {e}")))?;
        }
    }

    let cpuvm = if is_dgpu {
        Aperture::builder(ApertureKind::CpuVm, page).build()
    } else {
        Aperture::builder(ApertureKind::CpuVm, page)
            .bounds(page, START_NON_CANONICAL_ADDR - 1)
            .max_align(page << config.max_va_align_order)
            .cpu_accessible(true)
            .strategy(Strategy::Mmap)
            .build()
    };

    let mem_handle = match mem_handle_window(&gpus) {
        Some((base, limit)) => {
            log::info!("mem handle aperture: 0x{base:x} - 0x{limit:x}");
            Aperture::builder(ApertureKind::MemHandle, page)
                .bounds(base, limit)
                .guard_pages(guard_pages)
                .build()
        }
        None => {
            log::warn!("no hole for the mem handle aperture");
            Aperture::builder(ApertureKind::MemHandle, page).build()
        }
    };

    Ok(Layout {
        version,
        gpus,
        svm_default: svm.default,
        svm_alt: svm.alt,
        cpuvm,
        mem_handle,
        svm_reservation: Mutex::new(svm.reservation),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thunk::memory::testing::{FakeChannel, FakeHost, HostCall, gpu_nodes};

    const PAGE: u64 = 0x1000;

    #[test]
    fn reserved_svm_is_split_in_quarters() {
        let host = FakeHost::new(PAGE);
        let channel = FakeChannel::new(&gpu_nodes(1));
        let nodes = gpu_nodes(1);
        let layout = bootstrap(&channel, &host, &FmmConfig::default(), &nodes, true, None).unwrap();

        let (alt_base, alt_limit) = layout.svm_alt.bounds();
        let (def_base, def_limit) = layout.svm_default.bounds();
        assert_eq!(alt_base % SVM_ALT_ALIGN, 0);
        assert_eq!(alt_limit + 1, def_base);
        assert_eq!(def_limit, SVM_RESERVATION_LIMIT);
        assert_eq!(alt_limit - alt_base + 1, align_up((def_limit - alt_base + 1) >> 2, 0x10000));
        assert_eq!(layout.svm_reservation(), Some((alt_base, def_limit)));

        let policies = channel.policies();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].alt_base, alt_base);
        assert_eq!(policies[0].default_policy, KFD_IOC_CACHE_POLICY_NONCOHERENT);
        assert_eq!(channel.acquired_vms(), vec![nodes[1].gpu_id]);
    }

    #[test]
    fn shrinks_the_window_until_it_fits() {
        let host = FakeHost::new(PAGE);
        // Refuse anything larger than 64 GiB.
        host.limit_reservations(64 << 30);
        let window = reserve_svm_window(&host, 1 << 30, SVM_RESERVATION_LIMIT, PAGE).unwrap();
        assert!(window.1 <= 64 << 30);
        assert!(window.1 >= SVM_MIN_VM_SIZE);
    }

    #[test]
    fn full_address_space_gpus_use_mmap_svm() {
        let host = FakeHost::new(PAGE);
        let nodes = gpu_nodes(1);
        let channel = FakeChannel::new(&nodes).with_gpuvm_limit((1 << 47) - 1);
        let layout = bootstrap(&channel, &host, &FmmConfig::default(), &nodes, true, None).unwrap();

        assert_eq!(layout.svm_default.strategy(), Strategy::Mmap);
        assert!(!layout.svm_alt.is_valid());
        assert!(std::ptr::eq(layout.svm_coherent(), &layout.svm_default));
        assert_eq!(layout.svm_reservation(), None);
    }

    #[test]
    fn mem_handle_window_skips_gpu_windows() {
        let host = FakeHost::new(PAGE);
        let nodes = gpu_nodes(1);
        let channel =
            FakeChannel::new(&nodes).with_lds(START_NON_CANONICAL_ADDR, START_NON_CANONICAL_ADDR + 0xffff);
        let layout = bootstrap(&channel, &host, &FmmConfig::default(), &nodes, true, None).unwrap();

        assert_eq!(layout.mem_handle.base(), 2 * START_NON_CANONICAL_ADDR);
        assert_eq!(
            layout.classify(2 * START_NON_CANONICAL_ADDR + 5, true),
            Location::MemHandle
        );
    }

    #[test]
    fn classification_order() {
        let host = FakeHost::new(PAGE);
        let nodes = gpu_nodes(1);
        let channel = FakeChannel::new(&nodes);
        let layout = bootstrap(&channel, &host, &FmmConfig::default(), &nodes, true, None).unwrap();

        let gpu = &layout.gpus[0];
        let def_base = layout.svm_default.base();
        gpu.scratch_backing.set_bounds(def_base, def_base + 0xffff);

        assert_eq!(
            layout.classify(def_base + 0x1000, true),
            Location::Scratch {
                node_id: gpu.node_id
            }
        );
        assert_eq!(layout.classify(def_base + 0x10000, true), Location::SvmDefault);
        assert_eq!(layout.classify(layout.svm_alt.base(), true), Location::SvmAlt);
        assert_eq!(layout.classify(0x1000, true), Location::External);
        assert_eq!(layout.classify(0x1000, false), Location::CpuVm);
    }

    #[test]
    fn apu_gets_an_mmap_cpu_window() {
        let host = FakeHost::new(PAGE);
        let nodes = gpu_nodes(1);
        let channel = FakeChannel::new(&nodes);
        let layout = bootstrap(&channel, &host, &FmmConfig::default(), &nodes, false, None).unwrap();
        assert_eq!(layout.cpuvm.strategy(), Strategy::Mmap);
        assert_eq!(layout.cpuvm.bounds(), (PAGE, START_NON_CANONICAL_ADDR - 1));
    }

    #[test]
    fn abandon_keeps_the_reservation_in_place() {
        let host = FakeHost::new(PAGE);
        let nodes = gpu_nodes(1);
        let channel = FakeChannel::new(&nodes);
        let layout = bootstrap(&channel, &host, &FmmConfig::default(), &nodes, true, None).unwrap();
        let (base, limit) = layout.svm_reservation().unwrap();

        layout.abandon(&host);
        assert!(
            host.calls()
                .contains(&HostCall::Reserve(Placement::Fixed(base), limit - base + 1))
        );
        assert!(layout.gpus[0].render_fd().is_err());
        assert_eq!(layout.svm_reservation(), Some((base, limit)));
    }

    #[test]
    fn peers_follow_io_links() {
        let mut nodes = gpu_nodes(3);
        nodes[2].io_links = vec![1];
        nodes[3].io_links = vec![1, 2];
        assert_eq!(
            usable_peers(&nodes, &nodes[1]),
            vec![nodes[1].gpu_id, nodes[2].gpu_id, nodes[3].gpu_id]
        );
        assert_eq!(usable_peers(&nodes, &nodes[3]), vec![nodes[3].gpu_id]);
    }
}
