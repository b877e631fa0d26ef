//! The process-wide [`MemoryManager`].
//!
//! Runtimes acquire the manager once topology is known and share it across
//! threads; [`release`] tears it down at shutdown.

use crate::error::HsaResult;
use crate::thunk::memory::MemoryManager;
use crate::thunk::topology::NodeInfo;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static GLOBAL_MANAGER: Mutex<Option<Arc<MemoryManager>>> = Mutex::new(None);

fn slot() -> MutexGuard<'static, Option<Arc<MemoryManager>>> {
    GLOBAL_MANAGER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Opens `/dev/kfd` and brings up the apertures for `nodes`, or returns the
/// manager a previous call created (`nodes` is then ignored).
///
/// # Errors
/// Fails if the KFD device cannot be opened or the aperture layout cannot
/// be built; the global slot stays empty in that case.
pub fn acquire(nodes: Vec<NodeInfo>) -> HsaResult<Arc<MemoryManager>> {
    acquire_with(|| MemoryManager::open(nodes))
}

/// Like [`acquire`] with a caller-supplied constructor.
///
/// # Errors
/// Whatever `init` or the first layout bootstrap returns.
pub fn acquire_with(
    init: impl FnOnce() -> HsaResult<MemoryManager>,
) -> HsaResult<Arc<MemoryManager>> {
    let mut guard = slot();
    if let Some(manager) = guard.as_ref() {
        return Ok(Arc::clone(manager));
    }

    let manager = Arc::new(init()?);
    let layout = manager.layout()?;
    log::info!(
        "memory manager ready: {} GPU(s), {}",
        layout.gpus.len(),
        if manager.is_dgpu() { "discrete" } else { "APU" }
    );
    *guard = Some(Arc::clone(&manager));
    Ok(manager)
}

/// The manager, if one has been acquired.
#[must_use]
pub fn current() -> Option<Arc<MemoryManager>> {
    slot().as_ref().map(Arc::clone)
}

/// Drops the global manager. Its reservations are returned once the last
/// outstanding [`Arc`] goes away.
pub fn release() {
    let taken = slot().take();
    if taken.is_some() {
        log::info!("memory manager released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HsaError;
    use crate::thunk::config::FmmConfig;
    use crate::thunk::memory::testing::{FakeChannel, FakeHost, HostCall, gpu_nodes};
    use serial_test::serial;
    use std::cell::Cell;

    fn fake(host: &Arc<FakeHost>) -> HsaResult<MemoryManager> {
        let nodes = gpu_nodes(1);
        let channel = Arc::new(FakeChannel::new(&nodes));
        Ok(MemoryManager::new(
            channel,
            host.clone(),
            FmmConfig::default(),
            nodes,
        ))
    }

    #[test]
    #[serial]
    fn acquire_builds_once() {
        release();
        let host = Arc::new(FakeHost::new(0x1000));
        let built = Cell::new(0);

        let first = acquire_with(|| {
            built.set(built.get() + 1);
            fake(&host)
        })
        .unwrap();
        let second = acquire_with(|| {
            built.set(built.get() + 1);
            fake(&host)
        })
        .unwrap();

        assert_eq!(built.get(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(current().is_some_and(|m| Arc::ptr_eq(&m, &first)));
        release();
    }

    #[test]
    #[serial]
    fn failed_init_leaves_the_slot_empty() {
        release();
        let err = acquire_with(|| Err(HsaError::General("no kfd".into()))).unwrap_err();
        assert!(matches!(err, HsaError::General(_)));
        assert!(current().is_none());
    }

    #[test]
    #[serial]
    fn release_returns_the_reservation() {
        release();
        let host = Arc::new(FakeHost::new(0x1000));
        let manager = acquire_with(|| fake(&host)).unwrap();
        let (base, limit) = manager.layout().unwrap().svm_reservation().unwrap();
        drop(manager);

        release();
        assert!(current().is_none());
        assert!(host.calls().contains(&HostCall::Unmap(base, limit - base + 1)));
    }
}
