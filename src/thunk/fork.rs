//! Detection of the first call after `fork()` in the child.
//!
//! A `pthread_atfork` child hook bumps a process-wide generation counter;
//! every [`ForkWatch`] remembers the generation it last saw.

use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};

static FORK_GENERATION: AtomicU64 = AtomicU64::new(0);
static INSTALL_HOOK: Once = Once::new();

extern "C" fn on_fork_child() {
    FORK_GENERATION.fetch_add(1, Ordering::SeqCst);
}

fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        // SAFETY: the handler only touches an atomic, which is async-signal-safe.
        let ret = unsafe { libc::pthread_atfork(None, None, Some(on_fork_child)) };
        if ret != 0 {
            log::warn!("pthread_atfork failed ({ret}); fork recovery disabled");
        }
    });
}

#[derive(Debug)]
pub struct ForkWatch {
    source: &'static AtomicU64,
    seen: AtomicU64,
}

impl ForkWatch {
    /// Watches real `fork()` calls.
    #[must_use]
    pub fn process() -> Self {
        install_hook();
        Self::with_source(&FORK_GENERATION)
    }

    /// Watches an arbitrary generation counter.
    #[must_use]
    pub fn with_source(source: &'static AtomicU64) -> Self {
        Self {
            source,
            seen: AtomicU64::new(source.load(Ordering::SeqCst)),
        }
    }

    /// True exactly once per fork observed since the last call.
    pub fn forked(&self) -> bool {
        let now = self.source.load(Ordering::SeqCst);
        self.seen.swap(now, Ordering::SeqCst) != now
    }
}
