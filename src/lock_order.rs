/// Lock ordering enforcement for the synchronous locks in devfleet.
///
/// Debug builds track every acquisition of a `parking_lot` lock on a
/// thread-local stack and panic when the documented order is violated.
/// Release builds compile the tracking away entirely.
///
/// # Lock Ordering Hierarchy
///
/// 1. `operation_locks` - map of per-service operation locks
/// 2. `registry` - service entry map
/// 3. `observers` - registry observer list
/// 4. `processes` - managed child process table
/// 5. `port_assignments` - port allocator state
/// 6. `log_buffers` - per-service log ring buffers
///
/// Only synchronous locks are tracked. The per-service async operation mutex
/// can be held across `.await` and migrate between threads, so it lives
/// outside this hierarchy; the rule for it is that no synchronous lock is held
/// while waiting on it.
///
/// # Usage
///
/// ```ignore
/// use crate::lock_order::{LockId, track_lock_acquisition, track_lock_release};
///
/// track_lock_acquisition(LockId::Registry);
/// let entries = self.entries.write();
/// // ... mutate ...
/// drop(entries);
/// track_lock_release(LockId::Registry);
/// ```
#[cfg(debug_assertions)]
use std::cell::RefCell;

/// Identifiers for tracked locks.
///
/// Locks with lower discriminant values MUST be acquired before
/// locks with higher discriminant values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockId {
    OperationLocks = 1,
    Registry = 2,
    Observers = 3,
    Processes = 4,
    PortAssignments = 5,
    LogBuffers = 6,
}

impl LockId {
    /// Get a human-readable name for this lock
    pub fn name(&self) -> &'static str {
        match self {
            LockId::OperationLocks => "operation_locks",
            LockId::Registry => "registry",
            LockId::Observers => "observers",
            LockId::Processes => "processes",
            LockId::PortAssignments => "port_assignments",
            LockId::LogBuffers => "log_buffers",
        }
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static LOCK_STACK: RefCell<Vec<LockId>> = const { RefCell::new(Vec::new()) };
}

/// Track acquisition of a lock in debug mode.
///
/// # Panics
///
/// Panics if a lock with a higher rank is already held by this thread.
#[cfg(debug_assertions)]
pub fn track_lock_acquisition(lock: LockId) {
    LOCK_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();

        for held_lock in stack.iter() {
            if *held_lock > lock {
                panic!(
                    "Lock ordering violation: attempted to acquire '{}' (priority {}) \
                     while holding '{}' (priority {}). \
                     Locks must be acquired in order: OperationLocks < Registry < Observers < Processes < PortAssignments < LogBuffers",
                    lock.name(),
                    lock as u8,
                    held_lock.name(),
                    *held_lock as u8
                );
            }
        }

        stack.push(lock);
    });
}

/// Track release of a lock in debug mode.
///
/// # Panics
///
/// Panics if the lock being released wasn't the most recently acquired lock,
/// or if no locks are currently held.
#[cfg(debug_assertions)]
pub fn track_lock_release(lock: LockId) {
    LOCK_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();

        match stack.pop() {
            Some(top_lock) if top_lock == lock => {}
            Some(top_lock) => {
                panic!(
                    "Lock release order violation: attempted to release '{}' \
                     but most recently acquired lock was '{}'. \
                     Locks must be released in LIFO order.",
                    lock.name(),
                    top_lock.name()
                );
            }
            None => {
                panic!(
                    "Lock release without acquisition: attempted to release '{}' \
                     but no locks are currently held.",
                    lock.name()
                );
            }
        }
    });
}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub fn track_lock_acquisition(_lock: LockId) {}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub fn track_lock_release(_lock: LockId) {}

/// Run `f` while `lock` is recorded as held.
///
/// Keeps the acquire/release pair balanced even when `f` returns early.
pub fn with_tracked<T>(lock: LockId, f: impl FnOnce() -> T) -> T {
    track_lock_acquisition(lock);
    let out = f();
    track_lock_release(lock);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(debug_assertions)]
    fn test_valid_lock_order() {
        track_lock_acquisition(LockId::OperationLocks);
        track_lock_acquisition(LockId::Registry);
        track_lock_acquisition(LockId::PortAssignments);
        track_lock_acquisition(LockId::LogBuffers);

        track_lock_release(LockId::LogBuffers);
        track_lock_release(LockId::PortAssignments);
        track_lock_release(LockId::Registry);
        track_lock_release(LockId::OperationLocks);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_invalid_lock_order() {
        track_lock_acquisition(LockId::Observers);
        track_lock_acquisition(LockId::Registry);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock release order violation")]
    fn test_invalid_release_order() {
        track_lock_acquisition(LockId::Registry);
        track_lock_acquisition(LockId::Observers);
        track_lock_release(LockId::Registry);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock release without acquisition")]
    fn test_release_without_acquisition() {
        track_lock_release(LockId::Processes);
    }

    #[test]
    fn test_with_tracked_is_balanced() {
        let value = with_tracked(LockId::Registry, || {
            with_tracked(LockId::LogBuffers, || 7)
        });
        assert_eq!(value, 7);
        // A fresh acquisition of a lower-ranked lock must still be allowed.
        with_tracked(LockId::OperationLocks, || ());
    }
}
