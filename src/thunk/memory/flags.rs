use crate::kfd::ioctl::{
    KFD_IOC_ALLOC_MEM_FLAGS_AQL_QUEUE_MEM, KFD_IOC_ALLOC_MEM_FLAGS_COHERENT,
    KFD_IOC_ALLOC_MEM_FLAGS_CONTIGUOUS_BEST_EFFORT, KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE,
    KFD_IOC_ALLOC_MEM_FLAGS_EXT_COHERENT, KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE,
    KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC, KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED,
    KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE,
};

/// Semantic allocation flags (the `HsaMemFlags` of the thunk API).
///
/// These describe what the caller wants. The bits sent to the driver are
/// derived from them with [`MemFlags::to_ioc_flags`].
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemFlags {
    /// Device-local memory rather than pageable system memory.
    pub non_paged: bool,
    pub host_access: bool,
    pub read_only: bool,
    pub execute_access: bool,
    /// Coarse-grain coherence; fine grain when unset.
    pub coarse_grain: bool,
    pub uncached: bool,
    pub extended_coherent: bool,
    pub aql_queue_mem: bool,
    pub no_substitute: bool,
    pub contiguous: bool,
    /// Reserve VA only, no physical backing.
    pub only_address: bool,
    /// Physical backing only, addressed through an opaque handle.
    pub no_address: bool,
    /// Pick GTT system memory instead of the userptr path for host memory.
    pub gtt: bool,
}

impl MemFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn non_paged(mut self) -> Self {
        self.non_paged = true;
        self
    }

    #[must_use]
    pub const fn host_access(mut self) -> Self {
        self.host_access = true;
        self
    }

    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub const fn executable(mut self) -> Self {
        self.execute_access = true;
        self
    }

    #[must_use]
    pub const fn coarse_grain(mut self) -> Self {
        self.coarse_grain = true;
        self
    }

    #[must_use]
    pub const fn uncached(mut self) -> Self {
        self.uncached = true;
        self
    }

    #[must_use]
    pub const fn extended_coherent(mut self) -> Self {
        self.extended_coherent = true;
        self
    }

    #[must_use]
    pub const fn aql_queue_mem(mut self) -> Self {
        self.aql_queue_mem = true;
        self
    }

    #[must_use]
    pub const fn no_substitute(mut self) -> Self {
        self.no_substitute = true;
        self
    }

    #[must_use]
    pub const fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }

    #[must_use]
    pub const fn only_address(mut self) -> Self {
        self.only_address = true;
        self
    }

    #[must_use]
    pub const fn no_address(mut self) -> Self {
        self.no_address = true;
        self
    }

    #[must_use]
    pub const fn gtt(mut self) -> Self {
        self.gtt = true;
        self
    }

    /// Converts the semantic flags into the driver bitmask, on top of the
    /// memory-domain bits in `domain` (VRAM, GTT, USERPTR).
    ///
    /// `disable_cache` forces every allocation coherent and uncached.
    #[must_use]
    pub const fn to_ioc_flags(self, domain: u32, disable_cache: bool) -> u32 {
        let mut ioc_flags = domain;

        // WRITABLE is needed unless read-only is explicit.
        if !self.read_only {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE;
        }
        if self.execute_access {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE;
        }
        if self.host_access {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC;
        }
        if self.no_substitute {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE;
        }
        if self.aql_queue_mem {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_AQL_QUEUE_MEM;
        }
        if self.contiguous {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_CONTIGUOUS_BEST_EFFORT;
        }
        if !self.coarse_grain || disable_cache {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_COHERENT;
        }
        if self.uncached || disable_cache {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED;
        }
        if self.extended_coherent {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_EXT_COHERENT;
        }

        ioc_flags
    }

    /// Recovers the flags a foreign allocation was made with, as far as the
    /// driver bitmask tells.
    #[must_use]
    pub const fn from_ioc_flags(ioc_flags: u32) -> Self {
        Self {
            non_paged: false,
            host_access: ioc_flags & KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC != 0,
            read_only: ioc_flags & KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE == 0,
            execute_access: false,
            coarse_grain: ioc_flags & KFD_IOC_ALLOC_MEM_FLAGS_COHERENT == 0,
            uncached: false,
            extended_coherent: ioc_flags & KFD_IOC_ALLOC_MEM_FLAGS_EXT_COHERENT != 0,
            aql_queue_mem: false,
            no_substitute: false,
            contiguous: false,
            only_address: false,
            no_address: false,
            gtt: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kfd::ioctl::{KFD_IOC_ALLOC_MEM_FLAGS_USERPTR, KFD_IOC_ALLOC_MEM_FLAGS_VRAM};

    #[test]
    fn fine_grain_device_memory() {
        let ioc = MemFlags::new()
            .non_paged()
            .host_access()
            .to_ioc_flags(KFD_IOC_ALLOC_MEM_FLAGS_VRAM, false);

        assert_ne!(ioc & KFD_IOC_ALLOC_MEM_FLAGS_VRAM, 0);
        assert_ne!(ioc & KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC, 0);
        assert_ne!(ioc & KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE, 0);
        assert_ne!(ioc & KFD_IOC_ALLOC_MEM_FLAGS_COHERENT, 0);
        assert_eq!(ioc & KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED, 0);
    }

    #[test]
    fn coarse_grain_read_only() {
        let ioc = MemFlags::new()
            .coarse_grain()
            .read_only()
            .to_ioc_flags(KFD_IOC_ALLOC_MEM_FLAGS_USERPTR, false);

        assert_eq!(ioc, KFD_IOC_ALLOC_MEM_FLAGS_USERPTR);
    }

    #[test]
    fn disabled_cache_forces_coherent_uncached() {
        let ioc = MemFlags::new()
            .coarse_grain()
            .to_ioc_flags(KFD_IOC_ALLOC_MEM_FLAGS_VRAM, true);

        assert_ne!(ioc & KFD_IOC_ALLOC_MEM_FLAGS_COHERENT, 0);
        assert_ne!(ioc & KFD_IOC_ALLOC_MEM_FLAGS_UNCACHED, 0);
    }

    #[test]
    fn wire_flags_translate_back() {
        let flags = MemFlags::from_ioc_flags(
            KFD_IOC_ALLOC_MEM_FLAGS_VRAM | KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC,
        );
        assert!(flags.read_only);
        assert!(flags.coarse_grain);
        assert!(flags.host_access);
        assert!(!flags.extended_coherent);
    }
}
