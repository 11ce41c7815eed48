//! Per-instance mutable state shared by every manager.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard};

use crate::identity::Identity;

/// One-way readiness latch: once ready, never reverts.
#[derive(Debug, Default)]
pub struct StartupLatch {
    ready: AtomicBool,
}

impl StartupLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Flip to ready.  Returns `true` on the call that performed the flip.
    pub fn mark_ready(&self) -> bool {
        !self.ready.swap(true, Ordering::AcqRel)
    }
}

/// Identity plus the flags the lock protocol and readiness probe mutate.
///
/// Flag reads are lock-free.  Writers must hold the guard from
/// [`ManagerState::write_guard`] so that concurrent lock/unlock calls
/// observe a consistent flag.
#[derive(Debug)]
pub struct ManagerState {
    identity: Identity,
    startup: StartupLatch,
    locked: AtomicBool,
    write_guard: Mutex<()>,
}

impl ManagerState {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            startup: StartupLatch::new(),
            locked: AtomicBool::new(false),
            write_guard: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn member_name(&self) -> &str {
        &self.identity.pod_name
    }

    pub fn startup(&self) -> &StartupLatch {
        &self.startup
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_guard.lock().await
    }

    /// Set the locked flag.  Callers must hold the write guard.
    pub(crate) fn set_locked(&self, _guard: &MutexGuard<'_, ()>, locked: bool) {
        self.locked.store(locked, Ordering::Release);
    }
}
