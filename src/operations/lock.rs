use crate::error::{Error, Result};
use crate::lock_order::{with_tracked, LockId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// What a service's operation lock is currently held for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    Idle,
    Starting,
    Stopping,
    Restarting,
}

impl LockState {
    pub fn as_str(self) -> &'static str {
        match self {
            LockState::Idle => "idle",
            LockState::Starting => "starting",
            LockState::Stopping => "stopping",
            LockState::Restarting => "restarting",
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializes lifecycle operations for one service.
///
/// The async mutex may be held across `.await`; the state marker is only
/// touched briefly and reports what the holder is doing.
pub struct OperationLock {
    service: String,
    mutex: Arc<tokio::sync::Mutex<()>>,
    state: Arc<Mutex<LockState>>,
}

/// Held for the duration of one operation. Dropping it returns the lock to idle.
pub struct OperationGuard {
    state: Arc<Mutex<LockState>>,
    _guard: OwnedMutexGuard<()>,
}

impl OperationGuard {
    pub fn state(&self) -> LockState {
        *self.state.lock()
    }

    /// Re-label the in-flight operation without releasing the lock.
    pub fn set_state(&self, state: LockState) {
        *self.state.lock() = state;
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        *self.state.lock() = LockState::Idle;
    }
}

impl OperationLock {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            mutex: Arc::new(tokio::sync::Mutex::new(())),
            state: Arc::new(Mutex::new(LockState::Idle)),
        }
    }

    pub fn state(&self) -> LockState {
        *self.state.lock()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == LockState::Idle
    }

    /// Wait up to `timeout` for the lock.
    ///
    /// On timeout the error names the operation currently holding it.
    pub async fn acquire(&self, state: LockState, timeout: Duration) -> Result<OperationGuard> {
        match tokio::time::timeout(timeout, self.mutex.clone().lock_owned()).await {
            Ok(guard) => Ok(self.install(guard, state)),
            Err(_) => {
                let holder = self.state();
                tracing::debug!(
                    service.name = %self.service,
                    requested = %state,
                    holder = %holder,
                    "Timed out waiting for operation lock"
                );
                Err(Error::OperationInProgress {
                    service: self.service.clone(),
                    operation: holder.to_string(),
                })
            }
        }
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, state: LockState) -> Option<OperationGuard> {
        let guard = self.mutex.clone().try_lock_owned().ok()?;
        Some(self.install(guard, state))
    }

    fn install(&self, guard: OwnedMutexGuard<()>, state: LockState) -> OperationGuard {
        *self.state.lock() = state;
        OperationGuard {
            state: self.state.clone(),
            _guard: guard,
        }
    }
}

/// One [`OperationLock`] per service name, created on first use.
#[derive(Default)]
pub struct OperationLocks {
    locks: Mutex<HashMap<String, Arc<OperationLock>>>,
}

impl OperationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, service: &str) -> Arc<OperationLock> {
        with_tracked(LockId::OperationLocks, || {
            self.locks
                .lock()
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(OperationLock::new(service)))
                .clone()
        })
    }

    /// Current state of every lock that has been created.
    pub fn states(&self) -> HashMap<String, LockState> {
        with_tracked(LockId::OperationLocks, || {
            self.locks
                .lock()
                .iter()
                .map(|(name, lock)| (name.clone(), lock.state()))
                .collect()
        })
    }
}
