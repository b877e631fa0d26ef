use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

/// Largest alignment big buffers are promoted to for TLB fragment optimizations.
pub const GPU_HUGE_PAGE_SIZE: u64 = 2 << 20;

fn align_up(val: u64, align: u64) -> Option<u64> {
    Some(val.checked_add(align - 1)? & !(align - 1))
}

/// Address-ordered list of the occupied areas of one reserved aperture.
///
/// Areas are stored as `start -> end` (both inclusive) and never overlap.
/// Everything between them inside `[base, limit]` is free. Every area carries
/// the aperture's guard pages at its tail.
#[derive(Debug, Clone)]
pub struct VmRanges {
    base: u64,
    limit: u64,
    align: u64,
    guard_pages: u64,
    page_size: u64,
    areas: BTreeMap<u64, u64>,
}

impl VmRanges {
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64, guard_pages: u64, page_size: u64) -> Self {
        Self {
            base,
            limit,
            align: align.max(page_size),
            guard_pages,
            page_size,
            areas: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    /// Moves the window and forgets every area.
    pub fn set_bounds(&mut self, base: u64, limit: u64) {
        self.base = base;
        self.limit = limit;
        self.areas.clear();
    }

    /// Forgets every area, leaving the whole window free.
    pub fn reset(&mut self) {
        self.areas.clear();
    }

    /// Bytes taken by an object of `size` once its guard pages are added,
    /// or `None` if that does not fit in the address space.
    #[must_use]
    pub fn area_size(&self, size: u64) -> Option<u64> {
        size.checked_add(self.guard_pages.checked_mul(self.page_size)?)
    }

    /// Reserves `size` bytes (plus guard pages) and returns the start address.
    ///
    /// With `address` set the reservation succeeds only if that exact range is
    /// free. Otherwise the first hole that fits is used. When the effective
    /// alignment is at most a page, the *end* of the buffer is aligned instead
    /// of its start,
    /// and in both cases alignment is doubled while the buffer is at least
    /// twice as large, up to [`GPU_HUGE_PAGE_SIZE`].
    pub fn allocate(&mut self, address: Option<u64>, size: u64, align: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }

        // Zero means the aperture's own alignment.
        let orig_align = if align == 0 { self.align } else { align };
        let mut align = orig_align.max(self.align);
        while align < GPU_HUGE_PAGE_SIZE && size >= (align << 1) {
            align <<= 1;
        }

        let offset = if orig_align <= self.page_size {
            align - (size & (align - 1))
        } else {
            0
        };

        let size = self.area_size(size)?;

        match address {
            Some(addr) => self.claim_fixed(addr, size, align),
            None => self.claim_first_fit(size, align, offset),
        }
    }

    fn claim_first_fit(&mut self, size: u64, align: u64, offset: u64) -> Option<u64> {
        let mut start = align_up(self.base, align)?.checked_add(offset)?;
        let mut prev: Option<(u64, u64)> = None;
        let mut hole_found = false;

        for (&area_start, &area_end) in &self.areas {
            if area_start > start && area_start - start >= size {
                hole_found = true;
                break;
            }
            prev = Some((area_start, area_end));
            start = align_up(area_end.checked_add(1)?, align)?.checked_add(offset)?;
        }

        if !hole_found && (start > self.limit || self.limit - start < size - 1) {
            return None;
        }

        self.insert_area(prev, start, size);
        Some(start)
    }

    fn claim_fixed(&mut self, addr: u64, size: u64, align: u64) -> Option<u64> {
        if addr < self.base || addr > self.limit || self.limit - addr < size - 1 {
            return None;
        }

        let prev = self
            .areas
            .range(..=addr)
            .next_back()
            .map(|(&s, &e)| (s, e));

        if let Some((_, prev_end)) = prev
            && align_up(prev_end.saturating_add(1), align).is_none_or(|next| addr < next)
        {
            return None;
        }

        if let Some((&next_start, _)) = self.areas.range((Excluded(addr), Unbounded)).next()
            && next_start - addr < size
        {
            return None;
        }

        self.insert_area(prev, addr, size);
        Some(addr)
    }

    fn insert_area(&mut self, prev: Option<(u64, u64)>, start: u64, size: u64) {
        let end = start + size - 1;
        match prev {
            Some((prev_start, prev_end)) if prev_end + 1 == start => {
                self.areas.insert(prev_start, end);
            }
            _ => {
                self.areas.insert(start, end);
            }
        }
    }

    /// Returns `[address, address + size)` (plus guard pages) to the free pool.
    ///
    /// The released range must lie inside a single occupied area: it either
    /// removes the area, trims it at one end, or splits it in two. Returns
    /// `false` when no area covers `address`.
    pub fn release(&mut self, address: u64, size: u64) -> bool {
        let Some(size) = self.area_size(size) else {
            return false;
        };

        let Some((&area_start, &area_end)) = self.areas.range(..=address).next_back() else {
            return false;
        };
        if address > area_end {
            return false;
        }

        let region = area_end - area_start + 1;
        if region == size {
            self.areas.remove(&area_start);
        } else if region > size {
            if area_start == address {
                self.areas.remove(&area_start);
                self.areas.insert(address + size, area_end);
            } else if area_end - address + 1 == size {
                self.areas.insert(area_start, address - 1);
            } else {
                self.areas.insert(area_start, address - 1);
                self.areas.insert(address + size, area_end);
            }
        } else {
            log::warn!(
                "release of 0x{address:x} (+0x{size:x}) overruns area 0x{area_start:x}-0x{area_end:x}"
            );
            return false;
        }
        true
    }

    /// Occupied areas in address order, as inclusive `(start, end)` pairs.
    pub fn areas(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.areas.iter().map(|(&s, &e)| (s, e))
    }

    /// Free intervals in address order, as inclusive `(start, end)` pairs.
    #[must_use]
    pub fn free_intervals(&self) -> Vec<(u64, u64)> {
        let mut holes = Vec::with_capacity(self.areas.len() + 1);
        let mut cursor = self.base;
        for (&start, &end) in &self.areas {
            if start > cursor {
                holes.push((cursor, start - 1));
            }
            cursor = end.saturating_add(1);
        }
        if cursor <= self.limit && self.base < self.limit {
            holes.push((cursor, self.limit));
        }
        holes
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_intervals()
            .iter()
            .map(|&(start, end)| end - start + 1)
            .sum()
    }
}
