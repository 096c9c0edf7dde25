use crate::config::ServiceMode;
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Where a service is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Starting,
    /// Up and serving. Also accepted as `running`.
    #[serde(alias = "running")]
    Ready,
    Stopping,
    Stopped,
    Error,
    Building,
    Built,
    Completed,
    Failed,
    Watching,
}

impl LifecycleStatus {
    /// The process is expected to be gone; health checks are skipped.
    pub fn is_inactive(self) -> bool {
        matches!(
            self,
            LifecycleStatus::Stopped
                | LifecycleStatus::Completed
                | LifecycleStatus::Built
                | LifecycleStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStatus::Starting => "starting",
            LifecycleStatus::Ready => "ready",
            LifecycleStatus::Stopping => "stopping",
            LifecycleStatus::Stopped => "stopped",
            LifecycleStatus::Error => "error",
            LifecycleStatus::Building => "building",
            LifecycleStatus::Built => "built",
            LifecycleStatus::Completed => "completed",
            LifecycleStatus::Failed => "failed",
            LifecycleStatus::Watching => "watching",
        }
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "starting" => LifecycleStatus::Starting,
            "ready" | "running" => LifecycleStatus::Ready,
            "stopping" => LifecycleStatus::Stopping,
            "stopped" => LifecycleStatus::Stopped,
            "error" => LifecycleStatus::Error,
            "building" => LifecycleStatus::Building,
            "built" => LifecycleStatus::Built,
            "completed" => LifecycleStatus::Completed,
            "failed" => LifecycleStatus::Failed,
            "watching" => LifecycleStatus::Watching,
            other => {
                return Err(Error::Validation(format!(
                    "unknown lifecycle status '{}'",
                    other
                )))
            }
        })
    }
}

/// Health classification, independent of lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    #[default]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// The probe used to classify a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Http,
    Tcp,
    Process,
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckType::Http => write!(f, "http"),
            CheckType::Tcp => write!(f, "tcp"),
            CheckType::Process => write!(f, "process"),
        }
    }
}

/// Authoritative state of one managed service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceEntry {
    pub name: String,
    pub project_dir: PathBuf,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub lifecycle: LifecycleStatus,
    pub health: HealthStatus,
    pub start_time: Option<DateTime<Utc>>,
    /// Monotonic time of the most recent health check. Never moves backwards.
    #[serde(skip)]
    pub last_checked: Option<Instant>,
    /// Wall-clock rendering of `last_checked`, for display.
    pub last_checked_at: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub mode: ServiceMode,
    pub check_type: Option<CheckType>,
}

impl ServiceEntry {
    pub fn new(name: impl Into<String>, project_dir: impl Into<PathBuf>, mode: ServiceMode) -> Self {
        let lifecycle = match mode {
            ServiceMode::Build => LifecycleStatus::Building,
            _ => LifecycleStatus::Starting,
        };
        Self {
            name: name.into(),
            project_dir: project_dir.into(),
            pid: None,
            port: None,
            url: None,
            lifecycle,
            health: HealthStatus::Starting,
            start_time: None,
            last_checked: None,
            last_checked_at: None,
            end_time: None,
            exit_code: None,
            error: None,
            mode,
            check_type: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self.url = Some(format!("http://localhost:{}", port));
        self
    }

    pub fn started_now(mut self) -> Self {
        self.start_time = Some(Utc::now());
        self
    }
}

/// Partial update applied by [`Registry::update`](super::Registry::update).
///
/// Unset fields are left alone. Only `lifecycle`, `health` and `error`
/// participate in change detection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceUpdate {
    pub lifecycle: Option<LifecycleStatus>,
    pub health: Option<HealthStatus>,
    /// `Some(None)` clears the error.
    pub error: Option<Option<String>>,
    /// `Some(None)` clears the pid.
    pub pid: Option<Option<u32>>,
}

impl ServiceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifecycle(mut self, lifecycle: LifecycleStatus) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn health(mut self, health: HealthStatus) -> Self {
        self.health = Some(health);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn clear_pid(mut self) -> Self {
        self.pid = Some(None);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Registered,
    Updated,
    Removed,
}

/// A real state change, as delivered to observers.
#[derive(Debug, Clone)]
pub struct ServiceChange {
    pub kind: ChangeKind,
    /// Snapshot after the change (before removal, for `Removed`).
    pub entry: Arc<ServiceEntry>,
    pub previous_lifecycle: Option<LifecycleStatus>,
    pub previous_health: Option<HealthStatus>,
}

impl ServiceChange {
    pub fn name(&self) -> &str {
        &self.entry.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_alias() {
        assert_eq!(
            "running".parse::<LifecycleStatus>().unwrap(),
            LifecycleStatus::Ready
        );
        let parsed: LifecycleStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, LifecycleStatus::Ready);
        assert_eq!(
            serde_json::to_string(&LifecycleStatus::Ready).unwrap(),
            "\"ready\""
        );
        assert!("sleeping".parse::<LifecycleStatus>().is_err());
    }

    #[test]
    fn test_initial_lifecycle_follows_mode() {
        let e = ServiceEntry::new("web", "/p", ServiceMode::Build);
        assert_eq!(e.lifecycle, LifecycleStatus::Building);
        let e = ServiceEntry::new("web", "/p", ServiceMode::Daemon);
        assert_eq!(e.lifecycle, LifecycleStatus::Starting);
        assert_eq!(e.health, HealthStatus::Starting);
    }

    #[test]
    fn test_inactive_states() {
        assert!(LifecycleStatus::Stopped.is_inactive());
        assert!(LifecycleStatus::Built.is_inactive());
        assert!(!LifecycleStatus::Ready.is_inactive());
        assert!(!LifecycleStatus::Error.is_inactive());
    }

    #[test]
    fn test_entry_serializes_without_instant() {
        let e = ServiceEntry::new("api", "/p", ServiceMode::Daemon).with_port(3100);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["url"], "http://localhost:3100");
        assert!(json.get("last_checked").is_none());
        assert_eq!(json["lifecycle"], "starting");
    }
}
