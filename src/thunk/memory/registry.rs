use super::interval_tree::{IntervalTree, KeyMask, RangeKey, Side};
use super::object::{ObjectId, VmObject};
use std::collections::HashMap;

/// Which of the two indices a lookup runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    /// Device-visible `(start, size)`.
    Device,
    /// Host `(userptr, userptr_size)`, userptr objects only.
    User,
}

/// Objects of one aperture, stored in an arena and indexed twice.
///
/// The registry never talks to the driver: the caller releases the wire
/// handle and the VA before removing an object.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: HashMap<ObjectId, VmObject>,
    by_addr: IntervalTree<ObjectId>,
    by_user: IntervalTree<ObjectId>,
    next_id: ObjectId,
}

impl ObjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn insert(&mut self, object: VmObject) -> ObjectId {
        let id = self.next_id;
        self.next_id += 1;

        let displaced = self.by_addr.insert(object.key(), id);
        debug_assert!(displaced.is_none(), "device key already indexed");
        if let Some(key) = object.user_key() {
            let displaced = self.by_user.insert(key, id);
            debug_assert!(displaced.is_none(), "user key already indexed");
        }

        self.objects.insert(id, object);
        id
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<VmObject> {
        let object = self.objects.remove(&id)?;
        self.by_addr.remove(&object.key());
        if let Some(key) = object.user_key() {
            self.by_user.remove(&key);
        }
        Some(object)
    }

    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&VmObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut VmObject> {
        self.objects.get_mut(&id)
    }

    const fn tree(&self, index: Index) -> &IntervalTree<ObjectId> {
        match index {
            Index::Device => &self.by_addr,
            Index::User => &self.by_user,
        }
    }

    /// Exact lookup.
    ///
    /// With `size == 0` the address alone must identify a single object;
    /// two objects starting at `addr` make the lookup ambiguous.
    #[must_use]
    pub fn find_exact(&self, index: Index, addr: u64, size: u64) -> Option<ObjectId> {
        let tree = self.tree(index);
        if size != 0 {
            return tree.get(&RangeKey::new(addr, size)).copied();
        }

        let (key, &id) = tree.lookup_nearest(RangeKey::new(addr, 0), KeyMask::AddrOnly, Side::Right)?;
        if key.addr != addr {
            return None;
        }
        match tree.next(&key) {
            Some((next, _)) if next.addr == addr => None,
            _ => Some(id),
        }
    }

    /// The object whose range contains `addr`.
    ///
    /// Starts at the last key at or below `addr` and walks backwards, since
    /// user ranges may overlap and an earlier, longer view can still cover it.
    #[must_use]
    pub fn find_containing(&self, index: Index, addr: u64) -> Option<ObjectId> {
        let tree = self.tree(index);
        let (mut key, mut id) = tree
            .lookup_nearest(RangeKey::new(addr, 0), KeyMask::AddrOnly, Side::Left)
            .map(|(k, &v)| (k, v))?;

        loop {
            if key.contains(addr) {
                return Some(id);
            }
            (key, id) = tree.prev(&key).map(|(k, &v)| (k, v))?;
        }
    }

    /// Some object id, for draining the registry one object at a time.
    #[must_use]
    pub fn any(&self) -> Option<ObjectId> {
        self.by_addr.any().map(|(_, &id)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &VmObject)> {
        self.objects.iter().map(|(&id, obj)| (id, obj))
    }

    /// Forgets every object without handing any of them back.
    pub fn clear(&mut self) {
        self.objects.clear();
        self.by_addr.clear();
        self.by_user.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thunk::memory::flags::MemFlags;
    use crate::thunk::memory::object::UserPtr;

    fn object(start: u64, size: u64) -> VmObject {
        VmObject::new(start, size, start, MemFlags::new(), 0)
    }

    fn userptr(start: u64, size: u64, addr: u64, usize_: u64) -> VmObject {
        let mut obj = object(start, size);
        obj.userptr = Some(UserPtr {
            addr,
            size: usize_,
        });
        obj
    }

    #[test]
    fn both_keys_reach_the_same_object() {
        let mut reg = ObjectRegistry::new();
        let id = reg.insert(userptr(0x10_0000, 0x2000, 0x5000_0100, 0x1f00));
        reg.insert(object(0x20_0000, 0x1000));

        assert_eq!(reg.find_exact(Index::Device, 0x10_0000, 0x2000), Some(id));
        assert_eq!(reg.find_exact(Index::User, 0x5000_0100, 0x1f00), Some(id));
        assert_eq!(reg.find_containing(Index::User, 0x5000_1000), Some(id));

        assert!(reg.remove(id).is_some());
        assert_eq!(reg.find_exact(Index::Device, 0x10_0000, 0x2000), None);
        assert_eq!(reg.find_exact(Index::User, 0x5000_0100, 0x1f00), None);
        assert_eq!(reg.find_containing(Index::User, 0x5000_1000), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn address_only_lookup_needs_a_unique_start() {
        let mut reg = ObjectRegistry::new();
        let small = reg.insert(userptr(0x10_0000, 0x1000, 0x5000_0000, 0x1000));
        assert_eq!(reg.find_exact(Index::User, 0x5000_0000, 0), Some(small));

        reg.insert(userptr(0x20_0000, 0x4000, 0x5000_0000, 0x4000));
        assert_eq!(reg.find_exact(Index::User, 0x5000_0000, 0), None);
        assert_eq!(reg.find_exact(Index::User, 0x5000_0000, 0x1000), Some(small));
    }

    #[test]
    fn containing_lookup_walks_back_over_overlapping_views() {
        let mut reg = ObjectRegistry::new();
        let big = reg.insert(userptr(0x10_0000, 0x10000, 0x5000_0000, 0x10000));
        reg.insert(userptr(0x30_0000, 0x1000, 0x5000_2000, 0x1000));

        // 0x5000_8000 is past the small view but inside the big one.
        assert_eq!(reg.find_containing(Index::User, 0x5000_8000), Some(big));
        assert_eq!(reg.find_containing(Index::User, 0x5001_0000), None);
        assert_eq!(reg.find_containing(Index::Device, 0x10_ffff), Some(big));
        assert_eq!(reg.find_containing(Index::Device, 0xf_ffff), None);
    }

    #[test]
    fn drain_and_clear() {
        let mut reg = ObjectRegistry::new();
        for i in 0..3 {
            reg.insert(object(0x10_0000 * (i + 1), 0x1000));
        }
        let first = reg.any().unwrap();
        reg.remove(first);
        assert_eq!(reg.len(), 2);

        reg.clear();
        assert!(reg.is_empty());
        assert!(reg.any().is_none());
    }
}
