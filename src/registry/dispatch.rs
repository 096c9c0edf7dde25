//! Observer fan-out through one bounded queue per observer.
//!
//! Every subscribed observer gets its own queue and a single drain task, so it
//! sees its changes in the order they were enqueued and a slow observer only
//! delays itself. Enqueueing never blocks: when an observer's queue is full the
//! change is dropped for that observer alone and counted. Deliveries are
//! isolated, a panic is caught and logged, and a stuck delivery is abandoned
//! after the delivery timeout so the queue keeps draining.

use super::ServiceChange;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

/// Receives registry changes.
#[async_trait]
pub trait RegistryObserver: Send + Sync {
    async fn on_change(&self, change: ServiceChange);
}

/// Forwards changes into a bounded tokio channel.
pub struct ChannelObserver {
    tx: mpsc::Sender<ServiceChange>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<ServiceChange>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl RegistryObserver for ChannelObserver {
    async fn on_change(&self, change: ServiceChange) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.tx.send(change).await;
    }
}

/// Sending half of one observer's queue. Dropping it ends the drain task.
pub(crate) struct ObserverQueue {
    id: u64,
    tx: mpsc::Sender<ServiceChange>,
    dropped: Arc<AtomicU64>,
}

impl ObserverQueue {
    /// Start the drain task for `observer` on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub(crate) fn spawn(
        id: u64,
        observer: Arc<dyn RegistryObserver>,
        capacity: usize,
        delivery_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(
            drain(observer, rx, delivery_timeout)
                .instrument(tracing::debug_span!("registry_observer", observer = id)),
        );
        Self {
            id,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a delivery. Never blocks; a full or closed queue drops the change.
    pub(crate) fn enqueue(&self, change: ServiceChange) {
        match self.tx.try_send(change) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(change)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    observer = self.id,
                    service.name = %change.entry.name,
                    dropped = total,
                    "Registry observer queue full; change dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(observer = self.id, "Registry observer drain has stopped");
            }
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn drain(
    observer: Arc<dyn RegistryObserver>,
    mut rx: mpsc::Receiver<ServiceChange>,
    delivery_timeout: Duration,
) {
    while let Some(change) = rx.recv().await {
        let service = change.entry.name.clone();
        let kind = change.kind;
        let delivery = AssertUnwindSafe(observer.on_change(change)).catch_unwind();

        match tokio::time::timeout(delivery_timeout, delivery).await {
            Ok(Ok(())) => {}
            Ok(Err(panic_info)) => {
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                tracing::error!(
                    service.name = %service,
                    ?kind,
                    "Registry observer panicked: {}. Continuing delivery...",
                    panic_msg
                );
            }
            Err(_) => {
                tracing::warn!(
                    service.name = %service,
                    ?kind,
                    timeout_ms = delivery_timeout.as_millis() as u64,
                    "Registry observer timed out; delivery abandoned"
                );
            }
        }
    }
    tracing::debug!("Registry observer drain shutting down");
}
