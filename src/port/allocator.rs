use super::prompt::{PortConfirmer, PortConflictAction};
use super::store::{NoopPortStore, PortStore};
use crate::config::{DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
use crate::error::{Error, Result};
use crate::lock_order::{track_lock_acquisition, track_lock_release, LockId};
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;

/// Random candidates tried before falling back to a linear scan.
pub const MAX_RANDOM_ATTEMPTS: usize = 100;

/// Allocator key for a service: `"<project_dir>::<service>"`.
pub fn port_key(project_dir: &Path, service: &str) -> String {
    format!("{}::{}", project_dir.display(), service)
}

/// Bound listeners that keep a port reserved until the service is about to bind.
///
/// `127.0.0.1` must bind; `0.0.0.0` is attempted as well to catch dual-stack
/// conflicts. On Linux the second bind usually fails because the first already
/// covers it, which is fine.
struct Reservation {
    _listeners: Vec<TcpListener>,
}

impl Reservation {
    fn try_bind(port: u16) -> Option<Self> {
        let v4 = TcpListener::bind(("127.0.0.1", port)).ok()?;
        let mut listeners = vec![v4];
        if let Ok(any) = TcpListener::bind(("0.0.0.0", port)) {
            listeners.push(any);
        }
        Some(Self {
            _listeners: listeners,
        })
    }
}

struct AllocatorState {
    assignments: HashMap<String, u16>,
    reservations: HashMap<String, Reservation>,
    store: Box<dyn PortStore>,
    rng: StdRng,
}

impl AllocatorState {
    fn assigned_elsewhere(&self, key: &str, port: u16) -> bool {
        self.assignments
            .iter()
            .any(|(k, p)| *p == port && k != key)
    }

    fn commit(&mut self, key: &str, port: u16, reservation: Reservation) -> u16 {
        self.assignments.insert(key.to_string(), port);
        self.reservations.insert(key.to_string(), reservation);
        if let Err(e) = self.store.save_port(key, port) {
            tracing::warn!(key = %key, port, error = %e, "Failed to persist port preference");
        }
        port
    }
}

/// Picks non-colliding ports for services.
///
/// Allocation order:
/// 1. the port remembered for the key (current assignment, then the store,
///    then the caller's declared preference)
/// 2. up to [`MAX_RANDOM_ATTEMPTS`] random candidates from a `StdRng` seeded
///    from the OS entropy source
/// 3. a linear scan over the whole range
///
/// Every returned port is held open by a [`Reservation`] until
/// [`release_reservation`](Self::release_reservation) is called right before the
/// service binds.
///
/// # Confirmation window
///
/// When the remembered port is taken and a [`PortConfirmer`] is installed, the
/// allocator reserves an alternative, drops its lock, and asks the confirmer.
/// Other allocations proceed meanwhile. After the answer the lock is re-taken
/// and the choice is re-validated; a choice that is no longer valid falls
/// through to a fresh search. Duplicate ports are impossible because a port
/// is only committed while it is both bound by us and unassigned to other keys.
pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    state: Mutex<AllocatorState>,
    confirmer: Option<Arc<dyn PortConfirmer>>,
}

impl PortAllocator {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        Self::with_store(range_start, range_end, Box::new(NoopPortStore))
    }

    pub fn with_store(range_start: u16, range_end: u16, store: Box<dyn PortStore>) -> Self {
        let rng = StdRng::from_rng(OsRng).unwrap_or_else(|_| StdRng::from_entropy());
        Self {
            range_start: range_start.max(1),
            range_end,
            state: Mutex::new(AllocatorState {
                assignments: HashMap::new(),
                reservations: HashMap::new(),
                store,
                rng,
            }),
            confirmer: None,
        }
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn PortConfirmer>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    pub fn range(&self) -> (u16, u16) {
        (self.range_start, self.range_end)
    }

    fn lock_state(&self) -> StateGuard<'_> {
        track_lock_acquisition(LockId::PortAssignments);
        StateGuard {
            guard: self.state.lock(),
        }
    }

    fn in_range(&self, port: u16) -> bool {
        port >= self.range_start && port <= self.range_end
    }

    /// Allocate a port for `key` with no declared preference.
    pub fn allocate(&self, key: &str) -> Result<u16> {
        self.allocate_with_preference(key, None)
    }

    /// Allocate a port for `key`, trying `declared` when nothing is remembered.
    ///
    /// A declared port may lie outside the search range; remembered ports may not.
    pub fn allocate_with_preference(&self, key: &str, declared: Option<u16>) -> Result<u16> {
        let mut state = self.lock_state();

        let remembered = state
            .assignments
            .get(key)
            .copied()
            .or_else(|| state.store.get_port(key))
            .filter(|p| self.in_range(*p));
        let preferred = remembered.or(declared.filter(|p| *p > 0));

        let Some(preferred) = preferred else {
            return self.search(&mut state, key);
        };

        // The key's own stale reservation would make its port look taken.
        state.reservations.remove(key);

        if !state.assigned_elsewhere(key, preferred) {
            if let Some(res) = Reservation::try_bind(preferred) {
                tracing::debug!(key = %key, port = preferred, "Reusing preferred port");
                return Ok(state.commit(key, preferred, res));
            }
        }

        let Some(confirmer) = self.confirmer.clone() else {
            tracing::debug!(key = %key, port = preferred, "Preferred port taken, searching");
            return self.search(&mut state, key);
        };

        let (alternative, alt_res) = self.find_candidate(&mut state, key, Some(preferred))?;
        drop(state);

        let action = confirmer.confirm(key, preferred, alternative);
        tracing::debug!(key = %key, preferred, alternative, ?action, "Port confirmation answered");

        let mut state = self.lock_state();
        match action {
            PortConflictAction::Abort => Err(Error::Aborted),
            PortConflictAction::UseAlternative => {
                if !state.assigned_elsewhere(key, alternative) {
                    return Ok(state.commit(key, alternative, alt_res));
                }
                drop(alt_res);
                self.search(&mut state, key)
            }
            PortConflictAction::Retry => {
                drop(alt_res);
                if !state.assigned_elsewhere(key, preferred) {
                    if let Some(res) = Reservation::try_bind(preferred) {
                        return Ok(state.commit(key, preferred, res));
                    }
                }
                self.search(&mut state, key)
            }
        }
    }

    fn search(&self, state: &mut AllocatorState, key: &str) -> Result<u16> {
        let (port, res) = self.find_candidate(state, key, None)?;
        Ok(state.commit(key, port, res))
    }

    /// Random candidates first, then a linear scan. `exclude` is skipped.
    fn find_candidate(
        &self,
        state: &mut AllocatorState,
        key: &str,
        exclude: Option<u16>,
    ) -> Result<(u16, Reservation)> {
        if self.range_start > self.range_end {
            return Err(Error::PortAllocation(format!(
                "invalid port range: {}-{}",
                self.range_start, self.range_end
            )));
        }

        let usable = |state: &AllocatorState, port: u16| {
            Some(port) != exclude && !state.assigned_elsewhere(key, port)
        };

        for _ in 0..MAX_RANDOM_ATTEMPTS {
            let port = state.rng.gen_range(self.range_start..=self.range_end);
            if !usable(&*state, port) {
                continue;
            }
            if let Some(res) = Reservation::try_bind(port) {
                return Ok((port, res));
            }
        }

        for port in self.range_start..=self.range_end {
            if !usable(&*state, port) {
                continue;
            }
            if let Some(res) = Reservation::try_bind(port) {
                return Ok((port, res));
            }
        }

        Err(Error::PortAllocation(format!(
            "no available port in range {}-{}",
            self.range_start, self.range_end
        )))
    }

    /// Drop the bind reservation for `key`, keeping the assignment.
    /// Call immediately before spawning the process that binds the port.
    pub fn release_reservation(&self, key: &str) {
        self.lock_state().reservations.remove(key);
    }

    /// Drop the assignment and reservation for `key`. The stored preference is kept.
    pub fn release(&self, key: &str) -> Option<u16> {
        let mut state = self.lock_state();
        state.reservations.remove(key);
        state.assignments.remove(key)
    }

    /// Release `key` only while it is still assigned `port`.
    pub fn release_if_assigned(&self, key: &str, port: u16) -> bool {
        let mut state = self.lock_state();
        if state.assignments.get(key) != Some(&port) {
            return false;
        }
        state.reservations.remove(key);
        state.assignments.remove(key);
        true
    }

    pub fn assigned(&self, key: &str) -> Option<u16> {
        self.lock_state().assignments.get(key).copied()
    }

    pub fn assignments(&self) -> BTreeMap<String, u16> {
        self.lock_state()
            .assignments
            .iter()
            .map(|(k, p)| (k.clone(), *p))
            .collect()
    }

    /// The store's view of remembered ports.
    pub fn remembered(&self) -> HashMap<String, u16> {
        self.lock_state().store.get_all_ports()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE_START, DEFAULT_PORT_RANGE_END)
    }
}

/// Mutex guard that keeps the lock-order tracker balanced.
struct StateGuard<'a> {
    guard: MutexGuard<'a, AllocatorState>,
}

impl std::ops::Deref for StateGuard<'_> {
    type Target = AllocatorState;

    fn deref(&self) -> &AllocatorState {
        &self.guard
    }
}

impl std::ops::DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut AllocatorState {
        &mut self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        track_lock_release(LockId::PortAssignments);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MemoryPortStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn free_port() -> u16 {
        TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_allocate_reserves_port() {
        let allocator = PortAllocator::default();
        let port = allocator.allocate("/p::api").unwrap();

        assert!(port >= 3000);
        assert_eq!(allocator.assigned("/p::api"), Some(port));
        // Held open until the reservation is released.
        assert!(TcpListener::bind(("127.0.0.1", port)).is_err());

        allocator.release_reservation("/p::api");
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
        assert_eq!(allocator.assigned("/p::api"), Some(port));
    }

    #[test]
    fn test_release_if_assigned_matches_port() {
        let allocator = PortAllocator::default();
        let port = allocator.allocate("/p::api").unwrap();

        assert!(!allocator.release_if_assigned("/p::api", port.wrapping_add(1)));
        assert_eq!(allocator.assigned("/p::api"), Some(port));
        assert!(allocator.release_if_assigned("/p::api", port));
        assert_eq!(allocator.assigned("/p::api"), None);
        assert!(!allocator.release_if_assigned("/p::api", port));
    }

    #[test]
    fn test_distinct_keys_get_distinct_ports() {
        let allocator = PortAllocator::default();
        let a = allocator.allocate("/p::a").unwrap();
        let b = allocator.allocate("/p::b").unwrap();
        assert_ne!(a, b);
        assert_eq!(allocator.assignments().len(), 2);
    }

    #[test]
    fn test_same_key_keeps_its_port() {
        let allocator = PortAllocator::default();
        let first = allocator.allocate("/p::api").unwrap();
        allocator.release_reservation("/p::api");
        let second = allocator.allocate("/p::api").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_store_preference_survives_release() {
        let allocator =
            PortAllocator::with_store(3000, 65535, Box::new(MemoryPortStore::default()));
        let first = allocator.allocate("/p::api").unwrap();
        assert_eq!(allocator.release("/p::api"), Some(first));
        assert_eq!(allocator.assigned("/p::api"), None);
        assert_eq!(allocator.remembered().get("/p::api"), Some(&first));

        let again = allocator.allocate("/p::api").unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_declared_port_used_when_free() {
        let port = free_port();
        let allocator = PortAllocator::default();
        assert_eq!(
            allocator.allocate_with_preference("/p::web", Some(port)).unwrap(),
            port
        );
    }

    #[test]
    fn test_taken_preference_without_confirmer_falls_back() {
        let blocker = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let allocator = PortAllocator::default();
        let port = allocator
            .allocate_with_preference("/p::web", Some(taken))
            .unwrap();
        assert_ne!(port, taken);
    }

    #[test]
    fn test_small_range_exhaustion() {
        let port = free_port();
        let allocator = PortAllocator::new(port, port);
        assert_eq!(allocator.allocate("/p::a").unwrap(), port);
        let err = allocator.allocate("/p::b").unwrap_err();
        assert!(matches!(err, Error::PortAllocation(_)));
    }

    struct Answer(PortConflictAction, AtomicUsize);

    impl PortConfirmer for Answer {
        fn confirm(&self, _key: &str, preferred: u16, alternative: u16) -> PortConflictAction {
            assert_ne!(preferred, alternative);
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0
        }
    }

    #[test]
    fn test_confirmer_abort() {
        let blocker = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let answer = Arc::new(Answer(PortConflictAction::Abort, AtomicUsize::new(0)));
        let allocator = PortAllocator::default().with_confirmer(answer.clone());

        let err = allocator
            .allocate_with_preference("/p::web", Some(taken))
            .unwrap_err();
        assert!(matches!(err, Error::Aborted));
        assert_eq!(answer.1.load(Ordering::SeqCst), 1);
        assert_eq!(allocator.assigned("/p::web"), None);
    }

    #[test]
    fn test_confirmer_use_alternative() {
        let blocker = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let answer = Arc::new(Answer(
            PortConflictAction::UseAlternative,
            AtomicUsize::new(0),
        ));
        let allocator = PortAllocator::default().with_confirmer(answer);

        let port = allocator
            .allocate_with_preference("/p::web", Some(taken))
            .unwrap();
        assert_ne!(port, taken);
        assert_eq!(allocator.assigned("/p::web"), Some(port));
    }

    #[test]
    fn test_confirmer_retry_after_owner_exits() {
        struct ReleaseThenRetry(Mutex<Option<TcpListener>>);
        impl PortConfirmer for ReleaseThenRetry {
            fn confirm(&self, _: &str, _: u16, _: u16) -> PortConflictAction {
                self.0.lock().take();
                PortConflictAction::Retry
            }
        }

        let blocker = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let allocator = PortAllocator::default()
            .with_confirmer(Arc::new(ReleaseThenRetry(Mutex::new(Some(blocker)))));

        let port = allocator
            .allocate_with_preference("/p::web", Some(taken))
            .unwrap();
        assert_eq!(port, taken);
    }

    #[test]
    fn test_port_key_format() {
        assert_eq!(port_key(Path::new("/work/app"), "api"), "/work/app::api");
    }
}
