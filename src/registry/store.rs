use super::dispatch::{ObserverQueue, RegistryObserver};
use super::{
    ChangeKind, CheckType, HealthStatus, LifecycleStatus, ServiceChange, ServiceEntry,
    ServiceUpdate,
};
use crate::error::{Error, Result};
use crate::lock_order::{with_tracked, LockId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default capacity of each observer's delivery queue.
pub const DEFAULT_OBSERVER_QUEUE: usize = 256;

/// Default bound on a single observer delivery.
pub const DEFAULT_OBSERVER_TIMEOUT: Duration = Duration::from_secs(5);

struct ObserverSlot {
    queue: ObserverQueue,
    observer: Arc<dyn RegistryObserver>,
}

/// Authoritative, concurrency-safe store of per-service state.
///
/// All reads return copies. Every mutation goes through this API, and an
/// observer is notified only when a lifecycle, health or error value actually
/// changed. Changes are queued to each observer while the map lock is held,
/// so every observer sees one service's changes in the order they were
/// applied. Delivery happens on the observer's own drain task, outside any
/// lock.
pub struct Registry {
    entries: RwLock<HashMap<String, ServiceEntry>>,
    observers: RwLock<Vec<ObserverSlot>>,
    next_observer_id: AtomicU64,
    queue_capacity: usize,
    observer_timeout: Duration,
}

impl Registry {
    /// Create a registry whose observers each get a queue of `queue_capacity`
    /// pending changes.
    pub fn new(queue_capacity: usize, observer_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            observer_timeout,
        }
    }

    /// Queue `change` for every observer. Caller holds the entries lock.
    fn notify(&self, change: ServiceChange) {
        with_tracked(LockId::Observers, || {
            let observers = self.observers.read();
            for slot in observers.iter() {
                slot.queue.enqueue(change.clone());
            }
        });
    }

    /// Insert or replace an entry. Emits one `Registered` change.
    pub fn register(&self, entry: ServiceEntry) {
        tracing::debug!(service.name = %entry.name, lifecycle = %entry.lifecycle, "Registering service");
        with_tracked(LockId::Registry, || {
            let mut entries = self.entries.write();
            let previous = entries.insert(entry.name.clone(), entry.clone());
            self.notify(ServiceChange {
                kind: ChangeKind::Registered,
                entry: Arc::new(entry),
                previous_lifecycle: previous.as_ref().map(|p| p.lifecycle),
                previous_health: previous.as_ref().map(|p| p.health),
            });
        });
    }

    /// Remove an entry. Returns false (and notifies nobody) if it was absent.
    pub fn unregister(&self, name: &str) -> bool {
        with_tracked(LockId::Registry, || {
            let mut entries = self.entries.write();
            match entries.remove(name) {
                Some(removed) => {
                    tracing::debug!(service.name = %name, "Unregistered service");
                    self.notify(ServiceChange {
                        kind: ChangeKind::Removed,
                        previous_lifecycle: Some(removed.lifecycle),
                        previous_health: Some(removed.health),
                        entry: Arc::new(removed),
                    });
                    true
                }
                None => false,
            }
        })
    }

    /// Run `f` against the entry for `name` under the write lock.
    fn with_entry<T>(&self, name: &str, f: impl FnOnce(&mut ServiceEntry) -> T) -> Result<T> {
        with_tracked(LockId::Registry, || {
            let mut entries = self.entries.write();
            entries
                .get_mut(name)
                .map(f)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
        })
    }

    /// Apply a partial update. Returns whether observers were notified.
    pub fn update(&self, name: &str, update: ServiceUpdate) -> Result<bool> {
        with_tracked(LockId::Registry, || {
            let mut entries = self.entries.write();
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;

            let previous_lifecycle = entry.lifecycle;
            let previous_health = entry.health;
            let mut changed = false;

            if let Some(lifecycle) = update.lifecycle {
                changed |= entry.lifecycle != lifecycle;
                entry.lifecycle = lifecycle;
            }
            if let Some(health) = update.health {
                changed |= entry.health != health;
                entry.health = health;
            }
            if let Some(error) = update.error {
                let error = error.filter(|e| !e.is_empty());
                changed |= entry.error != error;
                entry.error = error;
            }
            if let Some(pid) = update.pid {
                entry.pid = pid;
            }

            if changed {
                tracing::debug!(
                    service.name = %name,
                    from = %previous_lifecycle,
                    to = %entry.lifecycle,
                    health = %entry.health,
                    "Service state changed"
                );
                self.notify(ServiceChange {
                    kind: ChangeKind::Updated,
                    entry: Arc::new(entry.clone()),
                    previous_lifecycle: Some(previous_lifecycle),
                    previous_health: Some(previous_health),
                });
            }
            Ok(changed)
        })
    }

    pub fn update_status(&self, name: &str, lifecycle: LifecycleStatus) -> Result<bool> {
        self.update(name, ServiceUpdate::new().lifecycle(lifecycle))
    }

    pub fn update_health(&self, name: &str, health: HealthStatus) -> Result<bool> {
        self.update(name, ServiceUpdate::new().health(health))
    }

    /// Record a one-shot process's exit. Set once; a second call is a conflict.
    pub fn update_exit_info(&self, name: &str, exit_code: i32, at: DateTime<Utc>) -> Result<()> {
        self.with_entry(name, |entry| {
            if !entry.mode.is_one_shot() {
                return Err(Error::Validation(format!(
                    "exit info applies to build and task services; '{}' is {}",
                    name, entry.mode
                )));
            }
            if entry.exit_code.is_some() || entry.end_time.is_some() {
                return Err(Error::ExitInfoAlreadyRecorded(name.to_string()));
            }
            entry.exit_code = Some(exit_code);
            entry.end_time = Some(at);
            Ok(())
        })?
    }

    /// Advance `last_checked`. Earlier instants are ignored. Never notifies.
    pub fn record_check(&self, name: &str, at: Instant) -> Result<()> {
        self.with_entry(name, |entry| {
            if entry.last_checked.map_or(true, |prev| at >= prev) {
                entry.last_checked = Some(at);
                entry.last_checked_at = Some(Utc::now());
            }
        })
    }

    pub fn set_port(&self, name: &str, port: Option<u16>, url: Option<String>) -> Result<()> {
        self.with_entry(name, |entry| {
            entry.port = port;
            entry.url = url;
        })
    }

    pub fn set_check_type(&self, name: &str, check_type: CheckType) -> Result<()> {
        self.with_entry(name, |entry| entry.check_type = Some(check_type))
    }

    pub fn get_service(&self, name: &str) -> Option<ServiceEntry> {
        with_tracked(LockId::Registry, || self.entries.read().get(name).cloned())
    }

    /// Copies of every entry, sorted by name.
    pub fn list_all(&self) -> Vec<ServiceEntry> {
        let mut all: Vec<ServiceEntry> =
            with_tracked(LockId::Registry, || self.entries.read().values().cloned().collect());
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        with_tracked(LockId::Registry, || self.entries.read().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry without notifying.
    pub fn clear(&self) {
        with_tracked(LockId::Registry, || self.entries.write().clear());
    }

    /// Add an observer. Returns false if this exact observer is already subscribed.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn subscribe(&self, observer: Arc<dyn RegistryObserver>) -> bool {
        with_tracked(LockId::Observers, || {
            let mut observers = self.observers.write();
            if observers
                .iter()
                .any(|slot| Arc::ptr_eq(&slot.observer, &observer))
            {
                return false;
            }
            let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
            let queue = ObserverQueue::spawn(
                id,
                observer.clone(),
                self.queue_capacity,
                self.observer_timeout,
            );
            observers.push(ObserverSlot { queue, observer });
            true
        })
    }

    /// Remove an observer by identity.
    pub fn unsubscribe(&self, observer: &Arc<dyn RegistryObserver>) -> bool {
        with_tracked(LockId::Observers, || {
            let mut observers = self.observers.write();
            let before = observers.len();
            observers.retain(|slot| !Arc::ptr_eq(&slot.observer, observer));
            let removed = observers.len() != before;
            if removed {
                tracing::debug!(remaining = observers.len(), "Registry observer removed");
            }
            removed
        })
    }

    pub fn observer_count(&self) -> usize {
        with_tracked(LockId::Observers, || self.observers.read().len())
    }

    /// Ids of subscribed observers, oldest first.
    pub fn observer_ids(&self) -> Vec<u64> {
        with_tracked(LockId::Observers, || {
            self.observers.read().iter().map(|s| s.queue.id()).collect()
        })
    }

    /// Changes dropped for observer `id` because its queue was full.
    pub fn observer_dropped(&self, id: u64) -> Option<u64> {
        with_tracked(LockId::Observers, || {
            self.observers
                .read()
                .iter()
                .find(|s| s.queue.id() == id)
                .map(|s| s.queue.dropped())
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_QUEUE, DEFAULT_OBSERVER_TIMEOUT)
    }
}
