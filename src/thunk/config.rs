use std::env;

/// Environment tunables of the memory manager.
///
/// Read once when the process context is acquired.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmmConfig {
    /// `HSA_DISABLE_CACHE=1`: every allocation coherent and uncached.
    pub disable_cache: bool,
    /// `HSA_USERPTR_FOR_PAGED_MEM=0` backs host allocations with GTT instead of userptr.
    pub userptr_for_paged_mem: bool,
    /// `HSA_CHECK_USERPTR=1`: fault in user pages before registering them.
    pub check_userptr: bool,
    /// `HSA_RESERVE_SVM=1`: always reserve the SVM window, even above 40 bits.
    pub reserve_svm: bool,
    /// `HSA_SVM_GUARD_PAGES`: guard pages after every SVM allocation.
    pub guard_pages: u32,
    /// `HSA_MAX_VA_ALIGN`: log2 of the largest VA alignment, in pages.
    pub max_va_align_order: u32,
    /// `HSA_USE_SVM=0` disables the SVM attribute path for registrations.
    pub use_svm_api: bool,
}

impl Default for FmmConfig {
    fn default() -> Self {
        Self {
            disable_cache: false,
            userptr_for_paged_mem: true,
            check_userptr: false,
            reserve_svm: false,
            guard_pages: 1,
            max_va_align_order: 9,
            use_svm_api: true,
        }
    }
}

const MAX_GUARD_PAGES: u32 = 64;
const MAX_VA_ALIGN_ORDER: u32 = 18;

impl FmmConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_env_with(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |name: &str, default: bool| match lookup(name).as_deref().map(str::trim) {
            Some("1") => true,
            Some("0") => false,
            _ => default,
        };
        let bounded = |name: &str, max: u32, default: u32| {
            lookup(name)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|&v| v <= max)
                .unwrap_or(default)
        };

        Self {
            disable_cache: flag("HSA_DISABLE_CACHE", defaults.disable_cache),
            userptr_for_paged_mem: flag(
                "HSA_USERPTR_FOR_PAGED_MEM",
                defaults.userptr_for_paged_mem,
            ),
            check_userptr: flag("HSA_CHECK_USERPTR", defaults.check_userptr),
            reserve_svm: flag("HSA_RESERVE_SVM", defaults.reserve_svm),
            guard_pages: bounded("HSA_SVM_GUARD_PAGES", MAX_GUARD_PAGES, defaults.guard_pages),
            max_va_align_order: bounded(
                "HSA_MAX_VA_ALIGN",
                MAX_VA_ALIGN_ORDER,
                defaults.max_va_align_order,
            ),
            use_svm_api: flag("HSA_USE_SVM", defaults.use_svm_api),
        }
    }
}
