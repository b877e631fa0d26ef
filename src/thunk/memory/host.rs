#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

//! The CPU side of the address space: reservations, mappings and NUMA hints.

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

const MPOL_DEFAULT: libc::c_int = 0;
const MPOL_PREFERRED: libc::c_int = 1;

/// Where a new reservation may land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Wherever the kernel likes.
    Anywhere,
    /// Preferably at the address; the kernel may pick another one.
    Hint(u64),
    /// Exactly at the address, replacing whatever is mapped there.
    Fixed(u64),
    /// Exactly at the address, failing if anything is mapped there.
    NoReplace(u64),
}

/// OS virtual-memory primitives used by the apertures.
pub trait HostVm: Send + Sync {
    fn page_size(&self) -> u64;

    /// Reserves `size` bytes of inaccessible, unbacked address space.
    fn reserve(&self, placement: Placement, size: u64) -> io::Result<u64>;

    fn unmap(&self, addr: u64, size: u64) -> io::Result<()>;

    /// Replaces `[addr, addr + size)` with private read/write anonymous pages.
    fn map_anonymous_fixed(&self, addr: u64, size: u64) -> io::Result<()>;

    /// Maps device memory at `addr` through the render node `fd`.
    ///
    /// Host-accessible memory gets a shared read/write mapping; otherwise the
    /// range is mapped private and inaccessible, which still lets the kernel
    /// track the VA as belonging to the buffer.
    fn map_device(
        &self,
        addr: u64,
        size: u64,
        host_access: bool,
        fd: RawFd,
        offset: u64,
    ) -> io::Result<()>;

    /// Prefers NUMA node `node` for pages faulted in the range.
    fn bind_preferred(&self, addr: u64, size: u64, node: u32) -> io::Result<()>;

    /// Drops any NUMA policy on the range.
    fn reset_numa(&self, addr: u64, size: u64) -> io::Result<()>;

    fn madvise_dontfork(&self, addr: u64, size: u64) -> io::Result<()>;

    /// Fails unless every page of the range is mapped.
    fn check_mapped(&self, addr: u64, size: u64) -> io::Result<()>;

    /// Reads one byte of every page so the range is faulted in.
    ///
    /// # Safety
    /// The whole range must be mapped readable.
    unsafe fn touch_pages(&self, addr: u64, size: u64);

    fn open_render_node(&self, minor: u32) -> io::Result<OwnedFd>;

    /// Reserves `size` bytes aligned to `align` inside `[base, limit]`.
    ///
    /// The kernel cannot honor custom alignment, so this over-reserves by
    /// `align - page` plus a guard area on each side, picks the first aligned
    /// address past the leading guard, and gives the padding back.
    fn mmap_allocate_aligned(
        &self,
        size: u64,
        align: u64,
        guard_size: u64,
        base: u64,
        limit: u64,
    ) -> Option<u64> {
        let page = self.page_size();
        let align = align.max(page);
        let padded = size
            .checked_add(guard_size.checked_mul(2)?)?
            .checked_add(align - page)?;

        let addr = self.reserve(Placement::Anywhere, padded).ok()?;
        let end = addr + padded;
        let aligned = (addr + guard_size + align - 1) & !(align - 1);

        if aligned < base || aligned + size - 1 > limit {
            let _ = self.unmap(addr, padded);
            return None;
        }

        let aligned_end = aligned + size;
        if aligned > addr {
            let _ = self.unmap(addr, aligned - addr);
        }
        if aligned_end < end {
            let _ = self.unmap(aligned_end, end - aligned_end);
        }
        Some(aligned)
    }
}

/// [`HostVm`] on top of the real `mmap`/`mbind`/`madvise` calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibcHost;

fn mmap_result(ret: *mut libc::c_void) -> io::Result<u64> {
    if ret == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as u64)
    }
}

fn check(ret: libc::c_long) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl LibcHost {
    fn mbind(addr: u64, size: u64, mode: libc::c_int, node: Option<u32>) -> io::Result<()> {
        let mut mask: [libc::c_ulong; 16] = [0; 16];
        let bits = libc::c_ulong::BITS as usize;
        let (mask_ptr, max_node) = match node {
            Some(n) if (n as usize) < mask.len() * bits => {
                mask[n as usize / bits] |= 1 << (n as usize % bits);
                (mask.as_ptr(), (mask.len() * bits) as libc::c_ulong)
            }
            Some(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("NUMA node {n} out of range"),
                ));
            }
            None => (ptr::null(), 0),
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                addr as *mut libc::c_void,
                size as libc::c_ulong,
                mode,
                mask_ptr,
                max_node,
                0 as libc::c_uint,
            )
        };
        check(ret)
    }
}

impl HostVm for LibcHost {
    fn page_size(&self) -> u64 {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret > 0 { ret as u64 } else { 4096 }
    }

    fn reserve(&self, placement: Placement, size: u64) -> io::Result<u64> {
        let base_flags = libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_PRIVATE;
        let (addr, flags) = match placement {
            Placement::Anywhere => (0, base_flags),
            Placement::Hint(a) => (a, base_flags),
            Placement::Fixed(a) => (a, base_flags | libc::MAP_FIXED),
            Placement::NoReplace(a) => (a, base_flags | libc::MAP_FIXED_NOREPLACE),
        };
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size as usize,
                libc::PROT_NONE,
                flags,
                -1,
                0,
            )
        };
        mmap_result(ret)
    }

    fn unmap(&self, addr: u64, size: u64) -> io::Result<()> {
        let ret = unsafe { libc::munmap(addr as *mut libc::c_void, size as usize) };
        check(ret.into())
    }

    fn map_anonymous_fixed(&self, addr: u64, size: u64) -> io::Result<()> {
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        mmap_result(ret).map(drop)
    }

    fn map_device(
        &self,
        addr: u64,
        size: u64,
        host_access: bool,
        fd: RawFd,
        offset: u64,
    ) -> io::Result<()> {
        let (prot, flags) = if host_access {
            (libc::PROT_READ | libc::PROT_WRITE, libc::MAP_SHARED)
        } else {
            (libc::PROT_NONE, libc::MAP_PRIVATE)
        };
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size as usize,
                prot,
                flags | libc::MAP_FIXED,
                fd,
                offset as libc::off_t,
            )
        };
        mmap_result(ret).map(drop)
    }

    fn bind_preferred(&self, addr: u64, size: u64, node: u32) -> io::Result<()> {
        Self::mbind(addr, size, MPOL_PREFERRED, Some(node))
    }

    fn reset_numa(&self, addr: u64, size: u64) -> io::Result<()> {
        Self::mbind(addr, size, MPOL_DEFAULT, None)
    }

    fn madvise_dontfork(&self, addr: u64, size: u64) -> io::Result<()> {
        let ret =
            unsafe { libc::madvise(addr as *mut libc::c_void, size as usize, libc::MADV_DONTFORK) };
        check(ret.into())
    }

    fn check_mapped(&self, addr: u64, size: u64) -> io::Result<()> {
        let page = self.page_size();
        let start = addr & !(page - 1);
        let len = ((addr + size + page - 1) & !(page - 1)) - start;
        let mut residency = vec![0u8; (len / page) as usize];
        // mincore reports ENOMEM for any hole in the range.
        let ret = unsafe {
            libc::mincore(
                start as *mut libc::c_void,
                len as usize,
                residency.as_mut_ptr(),
            )
        };
        check(ret.into())
    }

    unsafe fn touch_pages(&self, addr: u64, size: u64) {
        let page = self.page_size();
        let mut p = addr & !(page - 1);
        while p < addr + size {
            // SAFETY: the caller guarantees the range is mapped readable.
            unsafe { ptr::read_volatile(p as *const u8) };
            p += page;
        }
    }

    fn open_render_node(&self, minor: u32) -> io::Result<OwnedFd> {
        let path = CString::new(format!("/dev/dri/renderD{minor}"))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `open` just returned this descriptor and nothing else owns it.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_reservation_inside_window() {
        let host = LibcHost;
        let page = host.page_size();
        let align = 64 * page;

        let addr = host
            .mmap_allocate_aligned(4 * page, align, page, page, u64::MAX)
            .unwrap();
        assert_eq!(addr % align, 0);
        host.unmap(addr, 4 * page).unwrap();
    }

    #[test]
    fn aligned_reservation_outside_window_fails() {
        let host = LibcHost;
        let page = host.page_size();
        assert!(host.mmap_allocate_aligned(page, page, 0, 0, page).is_none());
    }

    #[test]
    fn anonymous_pages_are_touchable() {
        let host = LibcHost;
        let page = host.page_size();
        let addr = host.reserve(Placement::Anywhere, 2 * page).unwrap();
        host.map_anonymous_fixed(addr, 2 * page).unwrap();
        unsafe { host.touch_pages(addr, 2 * page) };
        host.madvise_dontfork(addr, 2 * page).unwrap();
        host.check_mapped(addr + 1, page).unwrap();
        host.unmap(addr, 2 * page).unwrap();
        assert!(host.check_mapped(addr, page).is_err());
    }
}
