//! Lifecycle operations over the service catalog.
//!
//! The [`OperationManager`] owns the moving parts of a running project: the
//! registry, the log broadcaster, the port allocator and the health monitor.
//! Every operation on a service runs under that service's [`OperationLock`],
//! so operations on one service are totally ordered while different services
//! proceed independently.
//!
//! # Cancellation
//!
//! The manager holds a root `CancellationToken`. Readiness waits and
//! graceful stop waits observe a child of it: a cancelled readiness wait
//! returns `Error::Cancelled`, a cancelled stop escalates to a force kill.

use super::lock::{LockState, OperationGuard, OperationLocks};
use super::result::{BulkOperationResult, OperationKind, OperationResult};
use super::validation::validate_service_name;
use crate::config::{ProjectConfig, ServiceMode, ServiceSpec, Settings};
use crate::error::{Error, Result};
use crate::healthcheck::{resolve_checker, wait_until_healthy, HealthMonitor};
use crate::lock_order::{with_tracked, LockId};
use crate::logs::{spawn_capture, CaptureHandle, LogBroadcaster};
use crate::port::{port_key, PortAllocator};
use crate::process::{default_controller, spawn_service, ProcessController};
use crate::registry::{
    CheckType, HealthStatus, LifecycleStatus, Registry, ServiceEntry, ServiceUpdate,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// First delay between readiness probes; doubles up to [`READINESS_MAX_INTERVAL`].
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READINESS_MAX_INTERVAL: Duration = Duration::from_secs(2);

/// How long to wait for a process to disappear after a force kill.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// How long a finished process's output readers get to drain.
const LOG_DRAIN_WAIT: Duration = Duration::from_secs(1);

/// `None` while the process runs; the exit code (if any) once it has exited.
type ExitState = Option<Option<i32>>;

struct ManagedProcess {
    pid: Option<u32>,
    exit: watch::Receiver<ExitState>,
    /// Set by `stop` so the waiter does not report the exit as a failure.
    stopping: Arc<AtomicBool>,
    generation: u64,
}

impl ManagedProcess {
    fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

type ProcessTable = Arc<Mutex<HashMap<String, ManagedProcess>>>;

pub struct OperationManager {
    project_dir: PathBuf,
    settings: Settings,
    registry: Arc<Registry>,
    logs: Arc<LogBroadcaster>,
    ports: Arc<PortAllocator>,
    monitor: Arc<HealthMonitor>,
    controller: Arc<dyn ProcessController>,
    catalog: RwLock<Vec<ServiceSpec>>,
    locks: OperationLocks,
    processes: ProcessTable,
    next_generation: AtomicU64,
    cancellation_token: CancellationToken,
}

impl OperationManager {
    /// Build a manager with fresh components sized from `settings`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(project_dir: impl Into<PathBuf>, settings: Settings) -> Self {
        let registry = Arc::new(Registry::new(
            settings.observer_queue,
            settings.observer_timeout,
        ));
        let logs = Arc::new(LogBroadcaster::new(
            settings.log_buffer_lines,
            settings.log_subscriber_timeout,
        ));
        let ports = Arc::new(PortAllocator::new(
            settings.port_range_start,
            settings.port_range_end,
        ));
        Self::with_components(project_dir, settings, registry, logs, ports, default_controller())
    }

    /// Build a manager around existing components.
    pub fn with_components(
        project_dir: impl Into<PathBuf>,
        settings: Settings,
        registry: Arc<Registry>,
        logs: Arc<LogBroadcaster>,
        ports: Arc<PortAllocator>,
        controller: Arc<dyn ProcessController>,
    ) -> Self {
        let monitor = Arc::new(
            HealthMonitor::new(registry.clone(), controller.clone())
                .with_logs(logs.clone())
                .with_max_concurrent(settings.max_concurrent_checks),
        );
        Self {
            project_dir: project_dir.into(),
            settings,
            registry,
            logs,
            ports,
            monitor,
            controller,
            catalog: RwLock::new(Vec::new()),
            locks: OperationLocks::new(),
            processes: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Build a manager for a loaded project and add its services in order.
    pub fn from_config(config: ProjectConfig, project_dir: impl Into<PathBuf>) -> Result<Self> {
        config.validate()?;
        let manager = Self::new(project_dir, config.settings);
        for spec in config.services {
            manager.add_service(spec)?;
        }
        Ok(manager)
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn logs(&self) -> &Arc<LogBroadcaster> {
        &self.logs
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Add a service to the catalog. Names must be valid and unique.
    pub fn add_service(&self, spec: ServiceSpec) -> Result<()> {
        validate_service_name(&spec.name)?;
        let mut catalog = self.catalog.write();
        if catalog.iter().any(|s| s.name == spec.name) {
            return Err(Error::Validation(format!(
                "service '{}' is already in the catalog",
                spec.name
            )));
        }
        tracing::debug!(service.name = %spec.name, mode = %spec.mode, "Added service to catalog");
        catalog.push(spec);
        Ok(())
    }

    /// Catalog in declaration order.
    pub fn services(&self) -> Vec<ServiceSpec> {
        self.catalog.read().clone()
    }

    fn spec(&self, name: &str) -> Result<ServiceSpec> {
        self.catalog
            .read()
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))
    }

    /// Cancel in-flight readiness waits and bulk operations.
    ///
    /// Graceful stops that are waiting on their grace period escalate to a
    /// force kill.
    pub fn cancel_operations(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Child tokens are cancelled with the manager's root token.
    pub fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    /// Whether `name` has a live managed process.
    pub fn is_running(&self, name: &str) -> bool {
        with_tracked(LockId::Processes, || {
            self.processes
                .lock()
                .get(name)
                .is_some_and(ManagedProcess::is_running)
        })
    }

    pub fn pid_of(&self, name: &str) -> Option<u32> {
        with_tracked(LockId::Processes, || {
            self.processes
                .lock()
                .get(name)
                .filter(|p| p.is_running())
                .and_then(|p| p.pid)
        })
    }

    /// Current state of every service lock that has been used.
    pub fn lock_states(&self) -> HashMap<String, LockState> {
        self.locks.states()
    }

    /// Run the background health monitor at the configured interval.
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        self.monitor
            .spawn(self.settings.effective_health_interval(), self.child_token())
    }

    #[tracing::instrument(skip(self), fields(service.name = %name))]
    pub async fn start(&self, name: &str) -> OperationResult {
        self.run_single(OperationKind::Start, name).await
    }

    #[tracing::instrument(skip(self), fields(service.name = %name))]
    pub async fn stop(&self, name: &str) -> OperationResult {
        self.run_single(OperationKind::Stop, name).await
    }

    #[tracing::instrument(skip(self), fields(service.name = %name))]
    pub async fn restart(&self, name: &str) -> OperationResult {
        self.run_single(OperationKind::Restart, name).await
    }

    /// Stop the service if it is running, then drop it from the registry.
    ///
    /// The catalog entry is kept so the service can be started again.
    #[tracing::instrument(skip(self), fields(service.name = %name))]
    pub async fn remove(&self, name: &str) -> OperationResult {
        self.run_single(OperationKind::Remove, name).await
    }

    /// Start every idle service concurrently.
    pub async fn start_all(&self) -> BulkOperationResult {
        self.run_concurrent(OperationKind::Start, LockState::Starting)
            .instrument(tracing::info_span!("start_all"))
            .await
    }

    /// Stop every idle service concurrently.
    pub async fn stop_all(&self) -> BulkOperationResult {
        self.run_concurrent(OperationKind::Stop, LockState::Stopping)
            .instrument(tracing::info_span!("stop_all"))
            .await
    }

    /// Restart services one at a time in declaration order.
    ///
    /// Each service is fully stopped and started before the next begins.
    /// After cancellation the remaining services are reported as cancelled.
    pub async fn restart_all(&self) -> BulkOperationResult {
        async {
            let started = Instant::now();
            let cancel = self.child_token();
            let mut results = Vec::new();

            for spec in self.services() {
                if cancel.is_cancelled() {
                    results.push(self.finish(
                        &spec.name,
                        OperationKind::Restart,
                        Err(Error::Cancelled(spec.name.clone())),
                        Instant::now(),
                    ));
                    continue;
                }
                let op_started = Instant::now();
                let outcome = match self
                    .locks
                    .lock_for(&spec.name)
                    .acquire(LockState::Restarting, self.settings.lock_timeout)
                    .await
                {
                    Ok(guard) => {
                        self.execute(OperationKind::Restart, &spec.name, Some(&spec), guard, &cancel)
                            .await
                    }
                    Err(e) => Err(e),
                };
                results.push(self.finish(&spec.name, OperationKind::Restart, outcome, op_started));
            }

            BulkOperationResult::new(results, started.elapsed())
        }
        .instrument(tracing::info_span!("restart_all"))
        .await
    }

    async fn run_single(&self, kind: OperationKind, name: &str) -> OperationResult {
        let started = Instant::now();
        let outcome = self.lock_and_execute(kind, name).await;
        self.finish(name, kind, outcome, started)
    }

    async fn lock_and_execute(&self, kind: OperationKind, name: &str) -> Result<()> {
        validate_service_name(name)?;
        let spec = match kind {
            OperationKind::Remove => self.spec(name).ok(),
            _ => Some(self.spec(name)?),
        };
        if spec.is_none() && self.registry.get_service(name).is_none() {
            return Err(Error::ServiceNotFound(name.to_string()));
        }
        let guard = self
            .locks
            .lock_for(name)
            .acquire(lock_state_for(kind), self.settings.lock_timeout)
            .await?;
        let cancel = self.child_token();
        self.execute(kind, name, spec.as_ref(), guard, &cancel).await
    }

    async fn run_concurrent(&self, kind: OperationKind, state: LockState) -> BulkOperationResult {
        let started = Instant::now();
        let specs = self.services();
        let cancel = self.child_token();

        let mut slots: Vec<Option<OperationResult>> = Vec::with_capacity(specs.len());
        let mut eligible = Vec::new();
        for (index, spec) in specs.into_iter().enumerate() {
            let lock = self.locks.lock_for(&spec.name);
            match lock.try_acquire(state) {
                Some(guard) => {
                    slots.push(None);
                    eligible.push((index, spec, guard));
                }
                None => {
                    let holder = lock.state();
                    tracing::debug!(service.name = %spec.name, holder = %holder, "Skipping busy service");
                    slots.push(Some(self.finish(
                        &spec.name,
                        kind,
                        Err(Error::OperationInProgress {
                            service: spec.name.clone(),
                            operation: holder.to_string(),
                        }),
                        Instant::now(),
                    )));
                }
            }
        }

        let tasks = eligible.into_iter().map(|(index, spec, guard)| {
            let cancel = cancel.clone();
            async move {
                let op_started = Instant::now();
                let outcome = self
                    .execute(kind, &spec.name, Some(&spec), guard, &cancel)
                    .instrument(tracing::info_span!("bulk_op", service.name = %spec.name, op = %kind))
                    .await;
                (index, self.finish(&spec.name, kind, outcome, op_started))
            }
        });
        for (index, result) in futures::future::join_all(tasks).await {
            slots[index] = Some(result);
        }

        let bulk = BulkOperationResult::new(slots.into_iter().flatten().collect(), started.elapsed());
        tracing::info!(
            op = %kind,
            succeeded = bulk.success_count,
            failed = bulk.failure_count,
            "Bulk operation finished"
        );
        bulk
    }

    async fn execute(
        &self,
        kind: OperationKind,
        name: &str,
        spec: Option<&ServiceSpec>,
        guard: OperationGuard,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = guard;
        let require = || spec.ok_or_else(|| Error::ServiceNotFound(name.to_string()));
        match kind {
            OperationKind::Start => self.start_locked(require()?, cancel).await,
            OperationKind::Stop => self.stop_locked(name, spec, cancel).await,
            OperationKind::Restart => self.restart_locked(require()?, cancel).await,
            OperationKind::Remove => self.remove_locked(name, spec, cancel).await,
        }
    }

    fn finish(
        &self,
        name: &str,
        kind: OperationKind,
        outcome: Result<()>,
        started: Instant,
    ) -> OperationResult {
        let error = outcome.err();
        if let Some(e) = &error {
            tracing::warn!(service.name = %name, op = %kind, error = %e, "Operation failed");
        }
        OperationResult {
            name: name.to_string(),
            operation: kind,
            resulting_status: self.registry.get_service(name).map(|e| e.lifecycle),
            error,
            duration: started.elapsed(),
        }
    }

    async fn start_locked(&self, spec: &ServiceSpec, cancel: &CancellationToken) -> Result<()> {
        let name = spec.name.as_str();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(name.to_string()));
        }
        let live = with_tracked(LockId::Processes, || {
            self.processes
                .lock()
                .get(name)
                .filter(|p| p.is_running())
                .map(|p| (p.pid, p.exit.clone()))
        });
        if let Some((pid, exit)) = live {
            let entry = self.registry.get_service(name);
            let unready = entry
                .as_ref()
                .is_some_and(|e| e.lifecycle == LifecycleStatus::Error);
            if !unready || spec.mode.is_one_shot() {
                tracing::debug!(service.name = %name, "Already running, nothing to start");
                return Ok(());
            }
            // A previous readiness wait gave up on a process that is still alive.
            tracing::info!(service.name = %name, pid = ?pid, "Waiting again for a running service to become ready");
            let _ = self
                .registry
                .update_status(name, LifecycleStatus::Starting);
            let port = entry.and_then(|e| e.port);
            return self.await_ready(spec, pid, port, exit, cancel).await;
        }

        let port = match self.prepare_port(spec).await {
            Ok(port) => port,
            Err(e) => {
                self.record_start_failure(spec, None, &e);
                return Err(e);
            }
        };
        if port.is_some() {
            self.ports.release_reservation(&port_key(&self.project_dir, name));
        }

        let mut child = match spawn_service(&*self.controller, spec, &self.project_dir, port) {
            Ok(child) => child,
            Err(e) => {
                self.record_start_failure(spec, port, &e);
                return Err(e);
            }
        };
        let pid = child.id();
        let capture = spawn_capture(
            self.logs.clone(),
            name,
            child.stdout.take(),
            child.stderr.take(),
        );

        let mut entry = ServiceEntry::new(name, &self.project_dir, spec.mode).started_now();
        if let Some(pid) = pid {
            entry = entry.with_pid(pid);
        }
        if let Some(port) = port {
            entry = entry.with_port(port);
        }
        self.registry.register(entry);
        self.monitor.set_config(name, spec.healthcheck.clone());
        let exit = self.supervise(spec, child, capture, pid);
        tracing::info!(service.name = %name, pid = ?pid, port = ?port, mode = %spec.mode, "Service spawned");

        if spec.mode.is_one_shot() {
            return Ok(());
        }
        self.await_ready(spec, pid, port, exit, cancel).await
    }

    async fn prepare_port(&self, spec: &ServiceSpec) -> Result<Option<u16>> {
        if !spec.needs_port() {
            return Ok(None);
        }
        let key = port_key(&self.project_dir, &spec.name);
        let ports = self.ports.clone();
        let declared = spec.port;
        let task_key = key.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            ports.allocate_with_preference(&task_key, declared)
        });

        let outcome = tokio::time::timeout(self.settings.operation_timeout, &mut task).await;
        match outcome {
            Ok(Ok(allocated)) => allocated.map(Some),
            Ok(Err(join_error)) => Err(Error::PortAllocation(format!(
                "allocation task for '{}' failed: {}",
                spec.name, join_error
            ))),
            Err(_) => {
                self.ports.release(&key);
                // The detached allocation may still commit after the release above.
                let ports = self.ports.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(late)) = task.await {
                        if ports.release_if_assigned(&key, late) {
                            tracing::debug!(port = late, "Released port committed after timeout");
                        }
                    }
                });
                Err(Error::Timeout(spec.name.clone()))
            }
        }
    }

    fn record_start_failure(&self, spec: &ServiceSpec, port: Option<u16>, error: &Error) {
        let update = ServiceUpdate::new()
            .lifecycle(LifecycleStatus::Error)
            .health(HealthStatus::Unknown)
            .error(error.to_string())
            .clear_pid();
        if self.registry.update(&spec.name, update).is_err() {
            let mut entry = ServiceEntry::new(&spec.name, &self.project_dir, spec.mode);
            if let Some(port) = port {
                entry = entry.with_port(port);
            }
            entry.lifecycle = LifecycleStatus::Error;
            entry.health = HealthStatus::Unknown;
            entry.error = Some(error.to_string());
            self.registry.register(entry);
        }
    }

    /// Hand the child to a waiter task and track it in the process table.
    fn supervise(
        &self,
        spec: &ServiceSpec,
        child: Child,
        capture: CaptureHandle,
        pid: Option<u32>,
    ) -> watch::Receiver<ExitState> {
        let (exit_tx, exit_rx) = watch::channel(None);
        let stopping = Arc::new(AtomicBool::new(false));
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        with_tracked(LockId::Processes, || {
            self.processes.lock().insert(
                spec.name.clone(),
                ManagedProcess {
                    pid,
                    exit: exit_rx.clone(),
                    stopping: stopping.clone(),
                    generation,
                },
            )
        });

        let waiter = Waiter {
            name: spec.name.clone(),
            mode: spec.mode,
            generation,
            stopping,
            exit_tx,
            registry: self.registry.clone(),
            processes: self.processes.clone(),
        };
        let span = tracing::debug_span!("waiter", service.name = %spec.name, pid = ?pid);
        tokio::spawn(waiter.run(child, capture).instrument(span));
        exit_rx
    }

    async fn await_ready(
        &self,
        spec: &ServiceSpec,
        pid: Option<u32>,
        port: Option<u16>,
        mut exit: watch::Receiver<ExitState>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let name = spec.name.as_str();
        let ready_lifecycle = match spec.mode {
            ServiceMode::Watch => LifecycleStatus::Watching,
            _ => LifecycleStatus::Ready,
        };

        let outcome = self.wait_ready(spec, pid, port, &mut exit, cancel).await;
        let outcome = outcome.and_then(|method| {
            if exit.borrow().is_some() {
                Err(exited_early(name))
            } else {
                Ok(method)
            }
        });

        match outcome {
            Ok(method) => {
                if let Some(method) = method {
                    let _ = self.registry.set_check_type(name, method);
                }
                self.registry.update(
                    name,
                    ServiceUpdate::new()
                        .lifecycle(ready_lifecycle)
                        .health(HealthStatus::Healthy)
                        .clear_error(),
                )?;
                tracing::info!(service.name = %name, lifecycle = %ready_lifecycle, "Service ready");
                Ok(())
            }
            Err(e) => {
                // An early exit has already been recorded by the waiter.
                if !matches!(e, Error::ServiceStartFailed(..)) {
                    let _ = self.registry.update(
                        name,
                        ServiceUpdate::new()
                            .lifecycle(LifecycleStatus::Error)
                            .error(e.to_string()),
                    );
                }
                Err(e)
            }
        }
    }

    /// Poll the cascaded probe until it passes, the process exits or the wait
    /// is cancelled. `None` when there is nothing to probe.
    async fn wait_ready(
        &self,
        spec: &ServiceSpec,
        pid: Option<u32>,
        port: Option<u16>,
        exit: &mut watch::Receiver<ExitState>,
        cancel: &CancellationToken,
    ) -> Result<Option<CheckType>> {
        if spec.healthcheck.disabled {
            return Ok(None);
        }
        let Some(checker) = resolve_checker(&spec.healthcheck, pid, port, &self.controller)? else {
            return Ok(None);
        };
        tokio::select! {
            ready = wait_until_healthy(
                &*checker,
                &spec.name,
                self.settings.readiness_timeout,
                READINESS_POLL_INTERVAL,
                READINESS_MAX_INTERVAL,
                cancel,
            ) => ready.map(|_| Some(checker.method())),
            _ = wait_exited(exit) => Err(exited_early(&spec.name)),
        }
    }

    async fn stop_locked(
        &self,
        name: &str,
        spec: Option<&ServiceSpec>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let process = with_tracked(LockId::Processes, || self.processes.lock().remove(name));
        let Some(mut process) = process.filter(ManagedProcess::is_running) else {
            return Err(Error::ServiceNotRunning(name.to_string()));
        };
        let Some(pid) = process.pid else {
            return Err(Error::ServiceNotRunning(name.to_string()));
        };

        process.stopping.store(true, Ordering::SeqCst);
        let _ = self
            .registry
            .update(name, ServiceUpdate::new().lifecycle(LifecycleStatus::Stopping));

        if let Err(e) = self.controller.terminate(pid) {
            tracing::warn!(service.name = %name, pid, error = %e, "Graceful termination failed");
        }

        let grace = self.settings.stop_grace;
        let exited = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(service.name = %name, "Stop cancelled, escalating to force kill");
                false
            }
            waited = tokio::time::timeout(grace, wait_exited(&mut process.exit)) => waited.is_ok(),
        };

        if !exited {
            tracing::warn!(
                service.name = %name,
                pid,
                grace_ms = grace.as_millis() as u64,
                "Process did not exit after graceful termination, force killing"
            );
            if let Err(e) = self.controller.force_kill(pid) {
                tracing::warn!(service.name = %name, pid, error = %e, "Force kill failed");
            }
            if tokio::time::timeout(FORCE_KILL_WAIT, wait_exited(&mut process.exit))
                .await
                .is_err()
            {
                tracing::error!(service.name = %name, pid, "Process still running after force kill");
            }
        }

        let exit_code = *process.exit.borrow();
        let one_shot = self
            .registry
            .get_service(name)
            .is_some_and(|entry| entry.mode.is_one_shot());
        if let (true, Some(code)) = (one_shot, exit_code) {
            if let Err(e) = self
                .registry
                .update_exit_info(name, code.unwrap_or(-1), Utc::now())
            {
                tracing::warn!(service.name = %name, error = %e, "Could not record exit information");
            }
        }

        if let Err(e) = self.registry.update(
            name,
            ServiceUpdate::new()
                .lifecycle(LifecycleStatus::Stopped)
                .health(HealthStatus::Unknown)
                .clear_pid(),
        ) {
            tracing::debug!(service.name = %name, error = %e, "Stopped service is no longer registered");
        }
        if spec.is_some_and(ServiceSpec::needs_port) {
            self.ports.release(&port_key(&self.project_dir, name));
        }
        tracing::info!(service.name = %name, pid, "Service stopped");
        Ok(())
    }

    async fn restart_locked(&self, spec: &ServiceSpec, cancel: &CancellationToken) -> Result<()> {
        match self.stop_locked(&spec.name, Some(spec), cancel).await {
            Ok(()) | Err(Error::ServiceNotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.start_locked(spec, cancel).await
    }

    async fn remove_locked(
        &self,
        name: &str,
        spec: Option<&ServiceSpec>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.stop_locked(name, spec, cancel).await {
            Ok(()) | Err(Error::ServiceNotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.monitor.remove_config(name);
        self.logs.clear(name);
        if !self.registry.unregister(name) {
            return Err(Error::ServiceNotFound(name.to_string()));
        }
        tracing::info!(service.name = %name, "Service removed");
        Ok(())
    }
}

fn lock_state_for(kind: OperationKind) -> LockState {
    match kind {
        OperationKind::Start => LockState::Starting,
        OperationKind::Stop | OperationKind::Remove => LockState::Stopping,
        OperationKind::Restart => LockState::Restarting,
    }
}

fn exited_early(name: &str) -> Error {
    Error::ServiceStartFailed(
        name.to_string(),
        "process exited before becoming ready".to_string(),
    )
}

/// Resolve once the process has exited (or its waiter is gone).
async fn wait_exited(exit: &mut watch::Receiver<ExitState>) {
    let _ = exit.wait_for(|state| state.is_some()).await.map(|_| ());
}

/// Owns one child process until it exits.
struct Waiter {
    name: String,
    mode: ServiceMode,
    generation: u64,
    stopping: Arc<AtomicBool>,
    exit_tx: watch::Sender<ExitState>,
    registry: Arc<Registry>,
    processes: ProcessTable,
}

impl Waiter {
    async fn run(self, mut child: Child, mut capture: CaptureHandle) {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait on child process");
                None
            }
        };
        self.exit_tx.send_replace(Some(code));
        with_tracked(LockId::Processes, || {
            let mut processes = self.processes.lock();
            if processes
                .get(&self.name)
                .is_some_and(|p| p.generation == self.generation)
            {
                processes.remove(&self.name);
            }
        });

        if tokio::time::timeout(LOG_DRAIN_WAIT, capture.finished()).await.is_err() {
            capture.shutdown();
        }

        if self.stopping.load(Ordering::SeqCst) {
            tracing::debug!(code = ?code, "Process exited after stop");
            return;
        }
        self.record_exit(code);
    }

    fn record_exit(&self, code: Option<i32>) {
        let name = self.name.as_str();
        let code_text = code.map_or_else(|| "signal".to_string(), |c| c.to_string());

        if self.mode.is_one_shot() {
            let exit_code = code.unwrap_or(-1);
            if let Err(e) = self.registry.update_exit_info(name, exit_code, Utc::now()) {
                tracing::warn!(error = %e, "Could not record exit information");
            }
            let update = if exit_code == 0 {
                let done = match self.mode {
                    ServiceMode::Build => LifecycleStatus::Built,
                    _ => LifecycleStatus::Completed,
                };
                ServiceUpdate::new().lifecycle(done).clear_error()
            } else {
                ServiceUpdate::new()
                    .lifecycle(LifecycleStatus::Failed)
                    .error(format!("{} exited with code {}", self.mode, code_text))
            };
            tracing::info!(code = %code_text, mode = %self.mode, "One-shot process finished");
            let _ = self.registry.update(name, update.clear_pid());
        } else {
            tracing::warn!(code = %code_text, "Process exited unexpectedly");
            let _ = self.registry.update(
                name,
                ServiceUpdate::new()
                    .lifecycle(LifecycleStatus::Error)
                    .error(format!("process exited unexpectedly (code {})", code_text))
                    .clear_pid(),
            );
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_settings() -> Settings {
        Settings {
            lock_timeout: Duration::from_millis(200),
            stop_grace: Duration::from_secs(2),
            readiness_timeout: Duration::from_secs(5),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_validation_runs_before_lookup() {
        let dir = TempDir::new().unwrap();
        let manager = OperationManager::new(dir.path(), fast_settings());

        let result = manager.start("../etc").await;
        assert!(matches!(result.error, Some(Error::InvalidServiceName { .. })));
        assert!(manager.registry().is_empty());

        let result = manager.start("missing").await;
        assert!(matches!(result.error, Some(Error::ServiceNotFound(_))));
    }

    #[tokio::test]
    async fn test_start_and_stop_daemon() {
        let dir = TempDir::new().unwrap();
        let manager = OperationManager::new(dir.path(), fast_settings());
        manager.add_service(ServiceSpec::new("sleeper", "sleep 30")).unwrap();

        let result = manager.start("sleeper").await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.resulting_status, Some(LifecycleStatus::Ready));
        assert!(manager.is_running("sleeper"));

        let entry = manager.registry().get_service("sleeper").unwrap();
        assert_eq!(entry.health, HealthStatus::Healthy);
        assert!(entry.pid.is_some());

        let result = manager.stop("sleeper").await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.resulting_status, Some(LifecycleStatus::Stopped));
        assert!(!manager.is_running("sleeper"));
        assert!(manager.registry().get_service("sleeper").unwrap().pid.is_none());

        let again = manager.stop("sleeper").await;
        assert!(matches!(again.error, Some(Error::ServiceNotRunning(_))));
    }

    #[tokio::test]
    async fn test_task_records_exit_info() {
        let dir = TempDir::new().unwrap();
        let manager = OperationManager::new(dir.path(), fast_settings());
        manager
            .add_service(ServiceSpec::new("ok", "exit 0").with_mode(ServiceMode::Task))
            .unwrap();
        manager
            .add_service(ServiceSpec::new("bad", "exit 3").with_mode(ServiceMode::Build))
            .unwrap();

        assert!(manager.start("ok").await.is_success());
        assert!(manager.start("bad").await.is_success());

        let registry = manager.registry().clone();
        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ok = registry.get_service("ok").unwrap();
                let bad = registry.get_service("bad").unwrap();
                if ok.exit_code.is_some() && bad.exit_code.is_some()
                    && ok.lifecycle.is_inactive() && bad.lifecycle.is_inactive()
                {
                    return (ok, bad);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(settled.0.lifecycle, LifecycleStatus::Completed);
        assert_eq!(settled.0.exit_code, Some(0));
        assert!(settled.0.end_time.is_some());
        assert_eq!(settled.1.lifecycle, LifecycleStatus::Failed);
        assert_eq!(settled.1.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_an_error() {
        let dir = TempDir::new().unwrap();
        let manager = OperationManager::new(dir.path(), fast_settings());
        manager.add_service(ServiceSpec::new("flaky", "sleep 0.3; exit 7")).unwrap();

        assert!(manager.start("flaky").await.is_success());

        let registry = manager.registry().clone();
        let entry = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entry = registry.get_service("flaky").unwrap();
                if entry.lifecycle == LifecycleStatus::Error {
                    return entry;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(entry.error.as_deref(), Some("process exited unexpectedly (code 7)"));
        assert!(entry.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_remove_stops_and_unregisters() {
        let dir = TempDir::new().unwrap();
        let manager = OperationManager::new(dir.path(), fast_settings());
        manager.add_service(ServiceSpec::new("api", "sleep 30")).unwrap();
        assert!(manager.start("api").await.is_success());

        let result = manager.remove("api").await;
        assert!(result.is_success(), "{:?}", result.error);
        assert!(result.resulting_status.is_none());
        assert!(!manager.is_running("api"));
        assert_eq!(manager.services().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_catalog_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = OperationManager::new(dir.path(), fast_settings());
        manager.add_service(ServiceSpec::new("api", "true")).unwrap();
        assert!(manager.add_service(ServiceSpec::new("api", "true")).is_err());
        assert!(manager.add_service(ServiceSpec::new("a/b", "true")).is_err());
    }
}
