use super::host::{HostVm, Placement};
use super::object::{ObjectId, VmObject};
use super::registry::{Index, ObjectRegistry};
use super::vm_area::VmRanges;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What an aperture is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApertureKind {
    /// Opaque ids for allocations without a CPU-visible address.
    MemHandle,
    /// A GPU's private VA window.
    Gpuvm,
    /// Backing VA of a GPU's scratch memory.
    ScratchBacking,
    /// The shared window, coarse-grain part.
    SvmDefault,
    /// The shared window, fine-grain (coherent) part.
    SvmAlt,
    /// Host-only allocations on APUs.
    CpuVm,
}

/// How VA is carved out of the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The window is reserved up front and sub-allocated here.
    Reserved,
    /// The kernel's mmap picks addresses; the window only bounds them.
    Mmap,
}

/// Free ranges and objects of one aperture, guarded by its mutex.
#[derive(Debug)]
pub struct ApertureState {
    pub ranges: VmRanges,
    pub objects: ObjectRegistry,
}

/// A VA window with its own allocator and object registry.
///
/// Bounds are atomics so address classification never needs the lock. They
/// only change for the scratch-backing and SVM windows, under the lock.
pub struct Aperture {
    kind: ApertureKind,
    base: AtomicU64,
    limit: AtomicU64,
    align: u64,
    guard_pages: u64,
    page_size: u64,
    /// Alignment ceiling for big buffers in mmap-backed windows.
    max_align: u64,
    cpu_accessible: bool,
    strategy: Strategy,
    state: Mutex<ApertureState>,
}

impl fmt::Debug for Aperture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (base, limit) = self.bounds();
        f.debug_struct("Aperture")
            .field("kind", &self.kind)
            .field("base", &format_args!("0x{base:x}"))
            .field("limit", &format_args!("0x{limit:x}"))
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

pub struct ApertureBuilder {
    kind: ApertureKind,
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,
    page_size: u64,
    max_align: u64,
    cpu_accessible: bool,
    strategy: Strategy,
}

impl ApertureBuilder {
    #[must_use]
    pub const fn bounds(mut self, base: u64, limit: u64) -> Self {
        self.base = base;
        self.limit = limit;
        self
    }

    #[must_use]
    pub const fn align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub const fn guard_pages(mut self, guard_pages: u64) -> Self {
        self.guard_pages = guard_pages;
        self
    }

    #[must_use]
    pub const fn max_align(mut self, max_align: u64) -> Self {
        self.max_align = max_align;
        self
    }

    #[must_use]
    pub const fn cpu_accessible(mut self, cpu_accessible: bool) -> Self {
        self.cpu_accessible = cpu_accessible;
        self
    }

    #[must_use]
    pub const fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn build(self) -> Aperture {
        let align = self.align.max(self.page_size);
        Aperture {
            kind: self.kind,
            base: AtomicU64::new(self.base),
            limit: AtomicU64::new(self.limit),
            align,
            guard_pages: self.guard_pages,
            page_size: self.page_size,
            max_align: self.max_align.max(self.page_size),
            cpu_accessible: self.cpu_accessible,
            strategy: self.strategy,
            state: Mutex::new(ApertureState {
                ranges: VmRanges::new(
                    self.base,
                    self.limit,
                    align,
                    self.guard_pages,
                    self.page_size,
                ),
                objects: ObjectRegistry::new(),
            }),
        }
    }
}

impl Aperture {
    #[must_use]
    pub const fn builder(kind: ApertureKind, page_size: u64) -> ApertureBuilder {
        ApertureBuilder {
            kind,
            base: 0,
            limit: 0,
            align: page_size,
            guard_pages: 0,
            page_size,
            max_align: page_size,
            cpu_accessible: false,
            strategy: Strategy::Reserved,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ApertureKind {
        self.kind
    }

    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        self.strategy
    }

    #[must_use]
    pub const fn is_cpu_accessible(&self) -> bool {
        self.cpu_accessible
    }

    #[must_use]
    pub const fn align(&self) -> u64 {
        self.align
    }

    #[must_use]
    pub fn bounds(&self) -> (u64, u64) {
        (
            self.base.load(Ordering::Acquire),
            self.limit.load(Ordering::Acquire),
        )
    }

    #[must_use]
    pub fn base(&self) -> u64 {
        self.base.load(Ordering::Acquire)
    }

    /// A window is usable once it has a non-empty, non-null range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let (base, limit) = self.bounds();
        base != 0 && limit != 0 && base < limit
    }

    /// Whether `addr` lies in `[base, limit]`. Lock-free.
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        let (base, limit) = self.bounds();
        self.is_valid() && addr >= base && addr <= limit
    }

    /// Moves the window, forgetting all free-range bookkeeping.
    pub fn set_bounds(&self, base: u64, limit: u64) {
        self.lock().set_bounds(base, limit);
    }

    pub fn lock(&self) -> ApertureGuard<'_> {
        ApertureGuard {
            aperture: self,
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Locks the aperture and returns the object at `addr`, if any.
    pub fn find(&self, index: Index, addr: u64, size: u64) -> Option<ObjectRef<'_>> {
        let guard = self.lock();
        let id = guard.objects.find_exact(index, addr, size)?;
        Some(ObjectRef { guard, id })
    }

    /// Like [`Aperture::find`] but matches any object covering `addr`.
    pub fn find_containing(&self, index: Index, addr: u64) -> Option<ObjectRef<'_>> {
        let guard = self.lock();
        let id = guard.objects.find_containing(index, addr)?;
        Some(ObjectRef { guard, id })
    }

    /// Drops every object and returns the whole window to the free pool,
    /// without touching the driver or the OS.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.objects.len();
        state.objects.clear();
        state.ranges.reset();
        dropped
    }
}

/// Exclusive access to one aperture's state.
pub struct ApertureGuard<'a> {
    aperture: &'a Aperture,
    state: MutexGuard<'a, ApertureState>,
}

impl Deref for ApertureGuard<'_> {
    type Target = ApertureState;

    fn deref(&self) -> &ApertureState {
        &self.state
    }
}

impl DerefMut for ApertureGuard<'_> {
    fn deref_mut(&mut self) -> &mut ApertureState {
        &mut self.state
    }
}

impl<'a> ApertureGuard<'a> {
    #[must_use]
    pub const fn aperture(&self) -> &'a Aperture {
        self.aperture
    }

    /// Reserves VA according to the aperture's strategy.
    pub fn allocate_area(
        &mut self,
        host: &dyn HostVm,
        address: Option<u64>,
        size: u64,
        align: u64,
    ) -> Option<u64> {
        let app = self.aperture;
        match app.strategy {
            Strategy::Reserved => self.state.ranges.allocate(address, size, align),
            Strategy::Mmap => {
                if !app.cpu_accessible {
                    log::error!("mmap-backed {:?} aperture is not CPU accessible", app.kind);
                    return None;
                }
                if let Some(addr) = address {
                    return host.reserve(Placement::NoReplace(addr), size).ok();
                }

                let mut align = align.max(app.align);
                while align < app.max_align && size >= (align << 1) {
                    align <<= 1;
                }
                let (base, limit) = app.bounds();
                host.mmap_allocate_aligned(
                    size,
                    align,
                    app.guard_pages * app.page_size,
                    base,
                    limit,
                )
            }
        }
    }

    /// Returns VA to the aperture and drops any CPU mapping over it.
    pub fn release_area(&mut self, host: &dyn HostVm, addr: u64, size: u64) {
        let app = self.aperture;
        match app.strategy {
            Strategy::Reserved => {
                if !self.state.ranges.release(addr, size) {
                    log::warn!("{:?}: no reserved area at 0x{addr:x}", app.kind);
                }
                if app.cpu_accessible {
                    let _ = host.reset_numa(addr, size);
                    // Keep the range reserved, just without access.
                    if let Err(e) = host.reserve(Placement::Fixed(addr), size) {
                        if e.raw_os_error() == Some(libc::ENOMEM) {
                            // At the map-count ceiling: unmapping first frees a slot.
                            let _ = host.unmap(addr, size);
                            let _ = host.reserve(Placement::Fixed(addr), size);
                        } else {
                            log::error!("re-reserving 0x{addr:x} failed: {e}");
                        }
                    }
                }
            }
            Strategy::Mmap => {
                if !app.cpu_accessible {
                    return;
                }
                if !app.contains(addr) {
                    log::error!("{:?}: 0x{addr:x} outside the aperture", app.kind);
                    return;
                }
                let _ = host.reset_numa(addr, size);
                let _ = host.unmap(addr, size);
            }
        }
    }

    pub fn set_bounds(&mut self, base: u64, limit: u64) {
        self.state.ranges.set_bounds(base, limit);
        self.aperture.base.store(base, Ordering::Release);
        self.aperture.limit.store(limit, Ordering::Release);
    }

    pub fn insert(&mut self, object: VmObject) -> ObjectId {
        self.state.objects.insert(object)
    }

    /// Converts the guard into an [`ObjectRef`] for `id`.
    #[must_use]
    pub fn into_object(self, id: ObjectId) -> Option<ObjectRef<'a>> {
        self.state.objects.get(id)?;
        Some(ObjectRef { guard: self, id })
    }
}

/// A located object together with the lock of the aperture owning it.
///
/// The lock is held for as long as this value lives.
pub struct ObjectRef<'a> {
    guard: ApertureGuard<'a>,
    id: ObjectId,
}

impl<'a> ObjectRef<'a> {
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub const fn aperture(&self) -> &'a Aperture {
        self.guard.aperture
    }

    pub fn guard(&mut self) -> &mut ApertureGuard<'a> {
        &mut self.guard
    }

    #[must_use]
    pub fn into_guard(self) -> ApertureGuard<'a> {
        self.guard
    }

    #[must_use]
    pub fn object(&self) -> &VmObject {
        // The id came from this registry and the lock has been held since.
        match self.guard.objects.get(self.id) {
            Some(obj) => obj,
            None => unreachable!("object {} vanished under its aperture lock", self.id),
        }
    }

    pub fn object_mut(&mut self) -> &mut VmObject {
        match self.guard.objects.get_mut(self.id) {
            Some(obj) => obj,
            None => unreachable!("object {} vanished under its aperture lock", self.id),
        }
    }

    /// Removes the object from the registry, keeping the lock.
    pub fn take(mut self) -> (ApertureGuard<'a>, VmObject) {
        let obj = self.guard.objects.remove(self.id);
        match obj {
            Some(obj) => (self.guard, obj),
            None => unreachable!("object {} vanished under its aperture lock", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thunk::memory::flags::MemFlags;
    use crate::thunk::memory::testing::{FakeHost, HostCall};

    const PAGE: u64 = 0x1000;

    fn reserved(cpu: bool) -> Aperture {
        Aperture::builder(ApertureKind::SvmDefault, PAGE)
            .bounds(0x10000, 0x1000_0000)
            .guard_pages(1)
            .cpu_accessible(cpu)
            .build()
    }

    #[test]
    fn classification_needs_valid_bounds() {
        let app = Aperture::builder(ApertureKind::ScratchBacking, PAGE).build();
        assert!(!app.is_valid());
        assert!(!app.contains(0));

        app.set_bounds(0x20_0000, 0x2f_ffff);
        assert!(app.contains(0x20_0000));
        assert!(app.contains(0x2f_ffff));
        assert!(!app.contains(0x30_0000));
    }

    #[test]
    fn reserved_release_reprotects_cpu_pages() {
        let host = FakeHost::new(PAGE);
        let app = reserved(true);

        let addr = app.lock().allocate_area(&host, None, 0x2000, 0).unwrap();
        app.lock().release_area(&host, addr, 0x2000);

        let calls = host.calls();
        assert!(calls.contains(&HostCall::ResetNuma(addr, 0x2000)));
        assert!(calls.contains(&HostCall::Reserve(Placement::Fixed(addr), 0x2000)));
        assert_eq!(app.lock().ranges.free_intervals().len(), 1);
    }

    #[test]
    fn reprotect_retries_after_map_count_exhaustion() {
        let host = FakeHost::new(PAGE);
        let app = reserved(true);
        let addr = app.lock().allocate_area(&host, None, 0x1000, 0).unwrap();

        host.fail_next_fixed_reserve(libc::ENOMEM);
        app.lock().release_area(&host, addr, 0x1000);

        let calls = host.calls();
        let unmap_at = calls.iter().position(|c| *c == HostCall::Unmap(addr, 0x1000));
        assert!(unmap_at.is_some());
        assert_eq!(
            calls.last(),
            Some(&HostCall::Reserve(Placement::Fixed(addr), 0x1000))
        );
    }

    #[test]
    fn gpu_only_window_never_touches_the_host() {
        let host = FakeHost::new(PAGE);
        let app = reserved(false);
        let addr = app.lock().allocate_area(&host, None, 0x1000, 0).unwrap();
        app.lock().release_area(&host, addr, 0x1000);
        assert!(host.calls().is_empty());
    }

    #[test]
    fn mmap_strategy_respects_fixed_address_and_alignment() {
        let host = FakeHost::new(PAGE);
        let app = Aperture::builder(ApertureKind::CpuVm, PAGE)
            .bounds(PAGE, (1 << 47) - 1)
            .max_align(PAGE << 9)
            .cpu_accessible(true)
            .strategy(Strategy::Mmap)
            .build();

        let fixed = app
            .lock()
            .allocate_area(&host, Some(0x7000_0000), 0x1000, 0)
            .unwrap();
        assert_eq!(fixed, 0x7000_0000);
        assert!(
            host.calls()
                .contains(&HostCall::Reserve(Placement::NoReplace(0x7000_0000), 0x1000))
        );

        let big = app.lock().allocate_area(&host, None, 4 << 20, 0).unwrap();
        assert_eq!(big % (2 << 20), 0);

        app.lock().release_area(&host, big, 4 << 20);
        assert_eq!(host.calls().last(), Some(&HostCall::Unmap(big, 4 << 20)));
    }

    #[test]
    fn find_holds_the_lock_until_dropped() {
        let app = reserved(false);
        let id = app
            .lock()
            .insert(VmObject::new(0x20000, 0x1000, 5, MemFlags::new(), 0));

        let found = app.find(Index::Device, 0x20000, 0).unwrap();
        assert_eq!(found.id(), id);
        assert_eq!(found.object().handle, 5);
        assert!(app.state.try_lock().is_err());
        drop(found);
        assert!(app.state.try_lock().is_ok());
    }

    #[test]
    fn clear_forgets_objects_and_areas() {
        let host = FakeHost::new(PAGE);
        let app = reserved(false);
        for _ in 0..3 {
            let mut guard = app.lock();
            let addr = guard.allocate_area(&host, None, 0x1000, 0).unwrap();
            guard.insert(VmObject::new(addr, 0x1000, addr, MemFlags::new(), 0));
        }

        assert_eq!(app.clear(), 3);
        let state = app.lock();
        assert!(state.objects.is_empty());
        assert_eq!(state.ranges.free_intervals(), vec![(0x10000, 0x1000_0000)]);
    }
}
