use std::collections::BTreeMap;
use std::ops::Bound;

/// Ordering key of an index entry: start address first, then length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RangeKey {
    pub addr: u64,
    pub size: u64,
}

impl RangeKey {
    #[must_use]
    pub const fn new(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    /// Whether `addr` falls inside `[addr, addr + size)`. A zero-sized key covers nothing.
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < self.size
    }
}

/// Which parts of the key take part in a nearest-neighbour comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMask {
    /// Compare address, then size.
    All,
    /// Compare the address only; every size at that address ties.
    AddrOnly,
}

/// Search direction of [`IntervalTree::lookup_nearest`].
///
/// `Right` returns the first entry comparing `>=` the probe and resolves ties
/// to the leftmost entry. `Left` returns the last entry comparing `<=` the
/// probe and resolves ties to the rightmost entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Balanced ordered index over `(address, size)` keys.
///
/// Backed by a B-tree. Lookups return `None` rather than failing; keeping the
/// keys unique is the caller's job.
#[derive(Debug, Clone)]
pub struct IntervalTree<V> {
    map: BTreeMap<RangeKey, V>,
}

impl<V> Default for IntervalTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IntervalTree<V> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts `value` under `key`, handing back whatever was stored there.
    pub fn insert(&mut self, key: RangeKey, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    pub fn remove(&mut self, key: &RangeKey) -> Option<V> {
        self.map.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &RangeKey) -> Option<&V> {
        self.map.get(key)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn lookup_nearest(
        &self,
        probe: RangeKey,
        mask: KeyMask,
        side: Side,
    ) -> Option<(RangeKey, &V)> {
        let entry = match (mask, side) {
            (KeyMask::All, Side::Right) => self.map.range(probe..).next(),
            (KeyMask::All, Side::Left) => self.map.range(..=probe).next_back(),
            (KeyMask::AddrOnly, Side::Right) => {
                self.map.range(RangeKey::new(probe.addr, 0)..).next()
            }
            (KeyMask::AddrOnly, Side::Left) => self
                .map
                .range(..=RangeKey::new(probe.addr, u64::MAX))
                .next_back(),
        };
        entry.map(|(k, v)| (*k, v))
    }

    /// In-order successor of `key` (which need not be present).
    #[must_use]
    pub fn next(&self, key: &RangeKey) -> Option<(RangeKey, &V)> {
        self.map
            .range((Bound::Excluded(*key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (*k, v))
    }

    /// In-order predecessor of `key` (which need not be present).
    #[must_use]
    pub fn prev(&self, key: &RangeKey) -> Option<(RangeKey, &V)> {
        self.map
            .range((Bound::Unbounded, Bound::Excluded(*key)))
            .next_back()
            .map(|(k, v)| (*k, v))
    }

    /// Some entry of the tree, for draining it one node at a time.
    #[must_use]
    pub fn any(&self) -> Option<(RangeKey, &V)> {
        self.map.iter().next().map(|(k, v)| (*k, v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (RangeKey, &V)> {
        self.map.iter().map(|(k, v)| (*k, v))
    }
}
