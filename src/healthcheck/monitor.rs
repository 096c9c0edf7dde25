//! Health monitoring over the registry.
//!
//! A [`HealthMonitor`] probes registered services, smooths results through
//! per-service hysteresis and writes only transitions back to the registry.
//! It can be driven three ways:
//! - [`HealthMonitor::check_all`]: one static pass
//! - [`HealthMonitor::stream`]: a cancellable session of repeated passes
//! - [`HealthMonitor::spawn`]: the background loop used while services run

use super::cascade::MethodCache;
use super::hysteresis::{in_grace_period, HysteresisTracker};
use super::report::{HealthCheckResult, HealthReport};
use super::ProbeReport;
use crate::config::HealthCheckConfig;
use crate::error::{Error, Result};
use crate::logs::LogBroadcaster;
use crate::process::ProcessController;
use crate::registry::{HealthStatus, Registry, ServiceEntry, ServiceUpdate};
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Streams never poll faster than this.
pub const MIN_STREAM_INTERVAL: Duration = Duration::from_secs(1);

/// Default cap on concurrent probes in one pass.
pub const DEFAULT_MAX_CONCURRENT_CHECKS: usize = 10;

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Event emitted by a [`HealthStream`].
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// Full report for one cycle.
    Summary(HealthReport),
    /// A service's status differs from the previous cycle of the same stream.
    Change {
        service: String,
        from: HealthStatus,
        to: HealthStatus,
    },
}

/// Receiving end of a streaming session.
///
/// Dropping it ends the session on the next send.
pub struct HealthStream {
    receiver: mpsc::Receiver<HealthEvent>,
    task: JoinHandle<()>,
}

impl HealthStream {
    pub async fn next(&mut self) -> Option<HealthEvent> {
        self.receiver.recv().await
    }

    /// Wait for the session task to finish.
    pub async fn finished(self) {
        drop(self.receiver);
        let _ = self.task.await;
    }
}

pub struct HealthMonitor {
    registry: Arc<Registry>,
    controller: Arc<dyn ProcessController>,
    logs: Option<Arc<LogBroadcaster>>,
    configs: RwLock<HashMap<String, HealthCheckConfig>>,
    trackers: Mutex<HashMap<String, HysteresisTracker>>,
    methods: Mutex<MethodCache>,
    max_concurrent: usize,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, controller: Arc<dyn ProcessController>) -> Self {
        Self {
            registry,
            controller,
            logs: None,
            configs: RwLock::new(HashMap::new()),
            trackers: Mutex::new(HashMap::new()),
            methods: Mutex::new(MethodCache::new()),
            max_concurrent: DEFAULT_MAX_CONCURRENT_CHECKS,
        }
    }

    /// Attach a log broadcaster so unhealthy transitions carry log context.
    pub fn with_logs(mut self, logs: Arc<LogBroadcaster>) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn set_config(&self, service: &str, config: HealthCheckConfig) {
        self.configs.write().insert(service.to_string(), config);
    }

    /// Forget everything held for a service.
    pub fn remove_config(&self, service: &str) {
        self.configs.write().remove(service);
        self.trackers.lock().remove(service);
        self.methods.lock().invalidate(service);
    }

    pub fn config_for(&self, service: &str) -> HealthCheckConfig {
        self.configs.read().get(service).cloned().unwrap_or_default()
    }

    /// Probe one service and record the outcome.
    #[tracing::instrument(skip(self, cancel), fields(service.name = %name))]
    pub async fn check(&self, name: &str, cancel: &CancellationToken) -> Result<HealthCheckResult> {
        let entry = self
            .registry
            .get_service(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        let config = self.config_for(name);

        if config.disabled || entry.lifecycle.is_inactive() {
            return Ok(HealthCheckResult::unprobed(name, entry.pid, entry.port));
        }

        let checker = self.methods.lock().get_or_resolve(
            name,
            &config,
            entry.pid,
            entry.port,
            &self.controller,
        )?;
        let Some(checker) = checker else {
            return Ok(HealthCheckResult::unprobed(name, entry.pid, entry.port));
        };

        let method = checker.method();
        if entry.check_type != Some(method) {
            let _ = self.registry.set_check_type(name, method);
        }

        let started = Instant::now();
        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled(name.to_string())),
            r = tokio::time::timeout(checker.timeout(), checker.probe()) => match r {
                Ok(report) => report,
                Err(_) => ProbeReport::failed(format!(
                    "{} check timed out after {}ms",
                    method,
                    checker.timeout().as_millis()
                )),
            },
        };
        let latency = started.elapsed();

        if let Err(e) = self.registry.record_check(name, Instant::now()) {
            tracing::debug!(error = %e, "Service left the registry during check");
        }

        let status = self.observe(&entry, &config, report.success);
        if status != entry.health {
            self.write_transition(&entry, status, report.error.as_deref());
        }

        Ok(HealthCheckResult {
            service_name: name.to_string(),
            method,
            success: report.success,
            degraded: report.degraded,
            status,
            latency,
            timestamp: Utc::now(),
            error: report.error,
            endpoint: checker.endpoint(),
            status_code: report.status_code,
            pid: entry.pid,
            port: entry.port,
        })
    }

    fn observe(&self, entry: &ServiceEntry, config: &HealthCheckConfig, success: bool) -> HealthStatus {
        let in_grace = in_grace_period(entry.start_time, config.start_period, Utc::now());
        let mut trackers = self.trackers.lock();
        let tracker = trackers
            .entry(entry.name.clone())
            .or_insert_with(|| HysteresisTracker::new(entry.health, entry.start_time, entry.pid));
        if !tracker.tracks(entry.start_time, entry.pid) {
            *tracker = HysteresisTracker::new(entry.health, entry.start_time, entry.pid);
        }
        tracker.observe(
            success,
            in_grace,
            config.effective_retries(),
            config.effective_success_threshold(),
        )
    }

    fn write_transition(&self, entry: &ServiceEntry, status: HealthStatus, probe_error: Option<&str>) {
        let mut update = ServiceUpdate::new().health(status);
        match status {
            HealthStatus::Unhealthy => {
                let mut message = probe_error.unwrap_or("health check failed").to_string();
                if let Some(finding) = self.logs.as_ref().and_then(|l| l.scan_recent(&entry.name)) {
                    message = format!("{} {}", message, finding);
                }
                tracing::warn!(
                    service.name = %entry.name,
                    from = %entry.health,
                    error = %message,
                    "Service became unhealthy"
                );
                update = update.error(message);
            }
            HealthStatus::Healthy => {
                tracing::info!(service.name = %entry.name, from = %entry.health, "Service is healthy");
                update = update.clear_error();
            }
            _ => {}
        }
        if let Err(e) = self.registry.update(&entry.name, update) {
            tracing::debug!(service.name = %entry.name, error = %e, "Dropped health transition");
        }
    }

    /// Check every registered service, at most `max_concurrent` at once.
    pub async fn check_all(&self, cancel: &CancellationToken) -> HealthReport {
        let entries = self.registry.list_all();
        let results: Vec<Option<HealthCheckResult>> = futures::stream::iter(entries)
            .map(|entry| async move {
                match self.check(&entry.name, cancel).await {
                    Ok(result) => Some(result),
                    Err(Error::ServiceNotFound(_)) => None,
                    Err(e) => Some(HealthCheckResult {
                        status: entry.health,
                        error: Some(e.to_string()),
                        ..HealthCheckResult::unprobed(&entry.name, entry.pid, entry.port)
                    }),
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;
        HealthReport::new(results.into_iter().flatten().collect())
    }

    /// Start a streaming session.
    ///
    /// Each session keeps its own previous-cycle view, so concurrent streams
    /// report changes independently. The session ends when `cancel` fires or
    /// the returned stream is dropped.
    pub fn stream(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> HealthStream {
        let interval = interval.max(MIN_STREAM_INTERVAL);
        let (tx, receiver) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let monitor = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut previous: HashMap<String, HealthStatus> = HashMap::new();
            loop {
                let report = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    report = monitor.check_all(&cancel) => report,
                };
                if cancel.is_cancelled() {
                    break;
                }

                let mut events = Vec::new();
                for result in &report.services {
                    if let Some(from) = previous.get(&result.service_name) {
                        if *from != result.status {
                            events.push(HealthEvent::Change {
                                service: result.service_name.clone(),
                                from: *from,
                                to: result.status,
                            });
                        }
                    }
                }
                previous = report
                    .services
                    .iter()
                    .map(|r| (r.service_name.clone(), r.status))
                    .collect();
                events.push(HealthEvent::Summary(report));

                for event in events {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("Health stream receiver dropped");
                        return;
                    }
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::debug!("Health stream stopped");
        });

        HealthStream { receiver, task }
    }

    /// Run the background monitoring loop until `cancel` fires.
    ///
    /// A panicking cycle is logged and the loop carries on.
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Monitoring loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        apply_jitter(interval).await;

                        let cycle = AssertUnwindSafe(monitor.check_all(&cancel))
                            .catch_unwind()
                            .await;

                        match cycle {
                            Ok(report) => tracing::debug!(
                                total = report.summary.total,
                                unhealthy = report.summary.unhealthy,
                                overall = %report.summary.overall,
                                "Health check cycle complete"
                            ),
                            Err(panic_info) => {
                                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                                    s.to_string()
                                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                                    s.clone()
                                } else {
                                    "Unknown panic".to_string()
                                };
                                tracing::error!(
                                    "Health check cycle panicked: {}. Continuing monitoring...",
                                    panic_msg
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Up to a tenth of the interval, capped at 500ms.
async fn apply_jitter(interval: Duration) {
    use rand::Rng;
    let max_ms = (interval.as_millis() / 10).min(500) as u64;
    if max_ms == 0 {
        return;
    }
    let jitter_ms = {
        let mut rng = rand::thread_rng();
        rng.gen_range(0..=max_ms)
    };
    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceMode;
    use crate::process::default_controller;
    use crate::registry::{CheckType, LifecycleStatus};

    fn monitor() -> (Arc<Registry>, Arc<HealthMonitor>) {
        let registry = Arc::new(Registry::default());
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), default_controller()));
        (registry, monitor)
    }

    #[tokio::test]
    async fn test_unknown_without_pid_or_port() {
        let (registry, monitor) = monitor();
        registry.register(ServiceEntry::new("api", "/tmp", ServiceMode::Daemon));

        let result = monitor.check("api", &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, HealthStatus::Unknown);
        assert_eq!(result.method, CheckType::Process);
        assert!(registry.get_service("api").unwrap().last_checked.is_none());
    }

    #[tokio::test]
    async fn test_inactive_services_are_skipped() {
        let (registry, monitor) = monitor();
        let mut entry = ServiceEntry::new("job", "/tmp", ServiceMode::Task).with_pid(std::process::id());
        entry.lifecycle = LifecycleStatus::Completed;
        registry.register(entry);

        let result = monitor.check("job", &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_missing_service() {
        let (_registry, monitor) = monitor();
        let err = monitor.check("ghost", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_live_process_becomes_healthy() {
        let (registry, monitor) = monitor();
        registry.register(
            ServiceEntry::new("self", "/tmp", ServiceMode::Daemon)
                .with_pid(std::process::id())
                .started_now(),
        );

        let result = monitor.check("self", &CancellationToken::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.status, HealthStatus::Healthy);

        let entry = registry.get_service("self").unwrap();
        assert_eq!(entry.health, HealthStatus::Healthy);
        assert_eq!(entry.check_type, Some(CheckType::Process));
        assert!(entry.last_checked.is_some());
    }

    #[tokio::test]
    async fn test_check_all_sorted_and_isolated() {
        let (registry, monitor) = monitor();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(ServiceEntry::new(name, "/tmp", ServiceMode::Daemon));
        }
        let report = monitor.check_all(&CancellationToken::new()).await;
        let names: Vec<_> = report.services.iter().map(|r| r.service_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.unknown, 3);
    }
}
