use super::flags::MemFlags;
use super::interval_tree::RangeKey;
use std::collections::BTreeSet;

/// Stable arena index of a [`VmObject`] inside its aperture's registry.
pub type ObjectId = u64;

/// Host view of a registered userptr object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPtr {
    pub addr: u64,
    pub size: u64,
}

/// One allocation or registration tracked by an aperture.
///
/// `start`/`size` are the device-visible range and never change. Userptr
/// objects additionally carry the host range they were registered for,
/// which can be narrower than the page-aligned device range.
#[derive(Debug, Clone)]
pub struct VmObject {
    pub start: u64,
    pub size: u64,
    /// Driver handle; zero for VA-only reservations.
    pub handle: u64,
    pub userptr: Option<UserPtr>,
    pub node_id: u32,
    pub flags: MemFlags,
    pub registration_count: u32,
    pub mapping_count: u32,
    pub metadata: Option<Vec<u8>>,
    pub user_data: u64,
    pub is_imported: bool,

    registered: BTreeSet<u32>,
    mapped: BTreeSet<u32>,
    registered_nodes: Option<Vec<u32>>,
    mapped_nodes: Option<Vec<u32>>,
}

impl VmObject {
    #[must_use]
    pub const fn new(start: u64, size: u64, handle: u64, flags: MemFlags, node_id: u32) -> Self {
        Self {
            start,
            size,
            handle,
            userptr: None,
            node_id,
            flags,
            registration_count: 0,
            mapping_count: 0,
            metadata: None,
            user_data: 0,
            is_imported: false,
            registered: BTreeSet::new(),
            mapped: BTreeSet::new(),
            registered_nodes: None,
            mapped_nodes: None,
        }
    }

    #[must_use]
    pub const fn key(&self) -> RangeKey {
        RangeKey::new(self.start, self.size)
    }

    #[must_use]
    pub fn user_key(&self) -> Option<RangeKey> {
        self.userptr.map(|u| RangeKey::new(u.addr, u.size))
    }

    #[must_use]
    pub const fn is_userptr(&self) -> bool {
        self.userptr.is_some()
    }

    /// Address the caller sees: the host pointer for userptr objects.
    #[must_use]
    pub fn visible_addr(&self) -> u64 {
        self.userptr.map_or(self.start, |u| u.addr)
    }

    #[must_use]
    pub const fn registered_devices(&self) -> &BTreeSet<u32> {
        &self.registered
    }

    #[must_use]
    pub const fn mapped_devices(&self) -> &BTreeSet<u32> {
        &self.mapped
    }

    pub fn set_registered_devices(&mut self, gpu_ids: impl IntoIterator<Item = u32>) {
        self.registered = gpu_ids.into_iter().collect();
        self.registered_nodes = None;
    }

    pub fn clear_registered_devices(&mut self) {
        self.registered.clear();
        self.registered_nodes = None;
    }

    pub fn add_mapped_devices(&mut self, gpu_ids: &[u32]) {
        self.mapped.extend(gpu_ids.iter().copied());
        self.mapped_nodes = None;
    }

    pub fn remove_mapped_devices(&mut self, gpu_ids: &[u32]) {
        for id in gpu_ids {
            self.mapped.remove(id);
        }
        self.mapped_nodes = None;
    }

    /// Node ids of the registered devices, resolved once per set change.
    pub fn registered_node_ids(&mut self, to_node: impl Fn(u32) -> Option<u32>) -> &[u32] {
        let devices = &self.registered;
        self.registered_nodes
            .get_or_insert_with(|| devices.iter().filter_map(|&g| to_node(g)).collect())
    }

    pub fn mapped_node_ids(&mut self, to_node: impl Fn(u32) -> Option<u32>) -> &[u32] {
        let devices = &self.mapped;
        self.mapped_nodes
            .get_or_insert_with(|| devices.iter().filter_map(|&g| to_node(g)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn node_id_cache_follows_device_set() {
        let mut obj = VmObject::new(0x1000, 0x1000, 7, MemFlags::new(), 0);
        let lookups = Cell::new(0);
        let to_node = |gpu: u32| {
            lookups.set(lookups.get() + 1);
            Some(gpu / 100)
        };

        obj.set_registered_devices([100, 300]);
        assert_eq!(obj.registered_node_ids(to_node), &[1, 3]);
        assert_eq!(obj.registered_node_ids(to_node), &[1, 3]);
        assert_eq!(lookups.get(), 2, "second call served from the cache");

        obj.set_registered_devices([200]);
        assert_eq!(obj.registered_node_ids(to_node), &[2]);
    }

    #[test]
    fn mapped_set_dedups_and_removes() {
        let mut obj = VmObject::new(0x1000, 0x1000, 7, MemFlags::new(), 0);
        obj.add_mapped_devices(&[1, 2]);
        obj.add_mapped_devices(&[2, 3]);
        assert_eq!(obj.mapped_devices().len(), 3);

        obj.remove_mapped_devices(&[1, 3]);
        assert_eq!(obj.mapped_node_ids(Some), &[2]);
    }

    #[test]
    fn userptr_view() {
        let mut obj = VmObject::new(0x7000_0000, 0x2000, 9, MemFlags::new(), 0);
        assert_eq!(obj.visible_addr(), 0x7000_0000);
        assert!(obj.user_key().is_none());

        obj.userptr = Some(UserPtr {
            addr: 0x5555_0010,
            size: 0x1800,
        });
        assert_eq!(obj.visible_addr(), 0x5555_0010);
        assert_eq!(obj.user_key(), Some(RangeKey::new(0x5555_0010, 0x1800)));
    }
}
