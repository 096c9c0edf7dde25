use super::{patterns, LogFinding, LogLine, LogRing, LogStream};
use crate::config::{DEFAULT_LOG_BUFFER_LINES, DEFAULT_LOG_SUBSCRIBER_TIMEOUT};
use crate::lock_order::{with_tracked, LockId};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};

/// Per-subscriber channel depth.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

/// Receiving end of a log subscription.
#[derive(Debug)]
pub struct LogSubscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<LogLine>,
}

struct Subscriber {
    id: u64,
    service: Option<String>,
    tx: mpsc::Sender<LogLine>,
    /// Set when the last bounded wait timed out; cleared on the next success.
    lagging: AtomicBool,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Subscriber {
    fn wants(&self, service: &str) -> bool {
        self.service.as_deref().map_or(true, |s| s == service)
    }

    async fn deliver(&self, line: LogLine, wait: Duration) {
        if self.lagging.load(Ordering::Relaxed) {
            match self.tx.try_send(line) {
                Ok(()) => self.lagging.store(false, Ordering::Relaxed),
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => self.closed.store(true, Ordering::Relaxed),
            }
            return;
        }

        match self.tx.send_timeout(line, wait).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if !self.lagging.swap(true, Ordering::Relaxed) {
                    tracing::debug!(subscriber = self.id, "Log subscriber is lagging, dropping lines");
                }
            }
            Err(SendTimeoutError::Closed(_)) => self.closed.store(true, Ordering::Relaxed),
        }
    }
}

/// Per-service state: history plus an ordering gate for delivery.
struct ServiceLog {
    ring: Mutex<LogRing>,
    /// Serializes deliveries for one service so subscribers see publish order.
    delivery: tokio::sync::Mutex<()>,
}

/// Buffers and fans out log lines per service.
///
/// Publishing never blocks the producer for long: each matching subscriber is
/// attempted concurrently with a short bounded wait, and a subscriber that
/// misses a wait only gets non-blocking attempts until it catches up. Lines a
/// subscriber could not take are dropped for that subscriber alone and
/// counted; closed subscribers are pruned on the next publish.
pub struct LogBroadcaster {
    services: RwLock<HashMap<String, Arc<ServiceLog>>>,
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    buffer_lines: usize,
    subscriber_timeout: Duration,
}

impl LogBroadcaster {
    pub fn new(buffer_lines: usize, subscriber_timeout: Duration) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            buffer_lines: buffer_lines.max(1),
            subscriber_timeout,
        }
    }

    fn service_log(&self, service: &str) -> Arc<ServiceLog> {
        if let Some(log) = self.services.read().get(service) {
            return log.clone();
        }
        self.services
            .write()
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(ServiceLog {
                    ring: Mutex::new(LogRing::new(service, self.buffer_lines)),
                    delivery: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }

    fn existing(&self, service: &str) -> Option<Arc<ServiceLog>> {
        self.services.read().get(service).cloned()
    }

    /// Record a line and deliver it to every matching subscriber.
    pub async fn publish(&self, service: &str, stream: LogStream, text: impl Into<String>) {
        let line = LogLine::new(service, stream, text);
        let log = self.service_log(service);

        let _order = log.delivery.lock().await;

        with_tracked(LockId::LogBuffers, || log.ring.lock().push(line.clone()));

        let targets: Vec<Arc<Subscriber>> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.wants(service) && !s.closed.load(Ordering::Relaxed))
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }

        let wait = self.subscriber_timeout;
        join_all(targets.iter().map(|s| s.deliver(line.clone(), wait))).await;

        if targets.iter().any(|s| s.closed.load(Ordering::Relaxed)) {
            self.subscribers
                .write()
                .retain(|s| !s.closed.load(Ordering::Relaxed));
        }
    }

    /// Subscribe to one service's lines, or to every service with `None`.
    pub fn subscribe(&self, service: Option<&str>) -> LogSubscription {
        let (tx, receiver) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Arc::new(Subscriber {
            id,
            service: service.map(str::to_string),
            tx,
            lagging: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }));
        tracing::debug!(subscriber = id, service = ?service, "Log subscriber added");
        LogSubscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Lines dropped for subscriber `id` because it could not keep up.
    pub fn dropped_for(&self, id: u64) -> Option<u64> {
        self.subscribers
            .read()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Last `n` buffered lines for `service`, oldest first.
    pub fn recent(&self, service: &str, n: usize) -> Vec<LogLine> {
        self.existing(service)
            .map(|log| with_tracked(LockId::LogBuffers, || log.ring.lock().recent(n)))
            .unwrap_or_default()
    }

    pub fn since(&self, service: &str, since: DateTime<Utc>) -> Vec<LogLine> {
        self.existing(service)
            .map(|log| with_tracked(LockId::LogBuffers, || log.ring.lock().since(since)))
            .unwrap_or_default()
    }

    pub fn clear(&self, service: &str) {
        if let Some(log) = self.existing(service) {
            with_tracked(LockId::LogBuffers, || log.ring.lock().clear());
        }
    }

    /// Lines evicted from `service`'s buffer.
    pub fn buffer_dropped(&self, service: &str) -> u64 {
        self.existing(service)
            .map(|log| with_tracked(LockId::LogBuffers, || log.ring.lock().evicted()))
            .unwrap_or(0)
    }

    /// Scan the recent window of `service`'s logs for known failure signatures.
    pub fn scan_recent(&self, service: &str) -> Option<LogFinding> {
        let window = chrono::Duration::from_std(patterns::SCAN_WINDOW)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let lines = self.since(service, Utc::now() - window);
        patterns::scan(&lines)
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUFFER_LINES, DEFAULT_LOG_SUBSCRIBER_TIMEOUT)
    }
}
