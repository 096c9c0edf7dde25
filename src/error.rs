// thiserror's Display expansion for struct variants trips unused_assignments.
#![allow(unused_assignments)]

use miette::Diagnostic;
use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(devfleet::config::error),
        help("Check the services file with `devfleet check-config <file>`")
    )]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid service name '{name}': {reason}")]
    #[diagnostic(
        code(devfleet::service::invalid_name),
        help("Service names may only contain letters, digits, '.', '-' and '_'")
    )]
    InvalidServiceName { name: String, reason: String },

    #[error("Invalid value: {0}")]
    Validation(String),

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(devfleet::service::not_found),
        help("List registered services with `devfleet up` output or the services file")
    )]
    ServiceNotFound(String),

    #[error("Service '{service}' is busy ({operation}): timeout waiting for service lock (another operation may be in progress)")]
    #[diagnostic(
        code(devfleet::service::conflict),
        help("Wait for the current operation on '{service}' to finish and retry")
    )]
    OperationInProgress { service: String, operation: String },

    #[error("Exit information for service '{0}' has already been recorded")]
    ExitInfoAlreadyRecorded(String),

    #[error("Service '{0}' is not running")]
    #[diagnostic(
        code(devfleet::service::not_running),
        help("Start the service first; its process may have already exited")
    )]
    ServiceNotRunning(String),

    #[error("Service '{0}' failed to start: {1}")]
    #[diagnostic(
        code(devfleet::service::start_failed),
        help("Verify the command exists and is executable")
    )]
    ServiceStartFailed(String, String),

    #[error("Service '{0}' health check failed: {1}")]
    #[diagnostic(code(devfleet::service::health_check_failed))]
    HealthCheckFailed(String, String),

    #[error("Service '{service}' did not become ready within {seconds}s")]
    #[diagnostic(
        code(devfleet::service::readiness_timeout),
        help("The process was left running so its logs can be inspected")
    )]
    ReadinessTimeout { service: String, seconds: u64 },

    #[error("Port allocation failed: {0}")]
    #[diagnostic(
        code(devfleet::port::allocation_failed),
        help("Widen the range with DEVFLEET_PORT_RANGE_START / DEVFLEET_PORT_RANGE_END")
    )]
    PortAllocation(String),

    #[error("Port {port} is in use{}",
        .process_name.as_ref()
            .zip(.pid.as_ref())
            .map(|(name, pid)| format!(" by process '{}' (PID {})", name, pid))
            .unwrap_or_default()
    )]
    #[diagnostic(
        code(devfleet::port::conflict),
        help("Find what's using the port with: lsof -i :{port} (macOS/Linux) or netstat -ano | findstr :{port} (Windows)")
    )]
    PortConflict {
        port: u16,
        pid: Option<u32>,
        process_name: Option<String>,
    },

    #[error("Operation aborted by user")]
    Aborted,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timeout waiting for service '{0}'")]
    Timeout(String),

    #[error("Operation cancelled for service '{0}'")]
    Cancelled(String),

    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<Error>),

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers that only care how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Malformed input, rejected before any state is touched.
    Validation,
    /// Unknown service.
    NotFound,
    /// Another operation holds the service, or the state was already final.
    Conflict,
    /// A single failed probe or a timeout; recorded, not escalated.
    Transient,
    /// The operation could not be carried out.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::Parse(_)
            | Error::Yaml(_)
            | Error::Json(_)
            | Error::InvalidServiceName { .. }
            | Error::Validation(_)
            | Error::InvalidPid { .. } => ErrorKind::Validation,
            Error::ServiceNotFound(_) => ErrorKind::NotFound,
            Error::OperationInProgress { .. }
            | Error::ExitInfoAlreadyRecorded(_)
            | Error::PortConflict { .. } => ErrorKind::Conflict,
            Error::HealthCheckFailed(..)
            | Error::ReadinessTimeout { .. }
            | Error::Timeout(_)
            | Error::Http(_) => ErrorKind::Transient,
            Error::ServiceNotRunning(_)
            | Error::ServiceStartFailed(..)
            | Error::PortAllocation(_)
            | Error::Io(_)
            | Error::Aborted
            | Error::Cancelled(_)
            | Error::Multiple(_) => ErrorKind::Fatal,
        }
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::ServiceNotFound(name) => Some(format!(
                "'{}' is not registered. Check the name against the services file.",
                name
            )),
            Error::ServiceNotRunning(name) => Some(format!(
                "'{}' has no live process. Start it again before stopping it.",
                name
            )),
            Error::OperationInProgress { service, operation } => Some(format!(
                "Another {} of '{}' is still running. Retry once it completes.",
                operation, service
            )),
            Error::PortConflict {
                port,
                pid,
                process_name,
            } => {
                let kill_hint = match (pid, process_name) {
                    (Some(p), Some(name)) => format!(
                        "To free the port, stop '{}' (PID {}) or let devfleet pick another port.",
                        name, p
                    ),
                    (Some(p), None) => format!(
                        "To free the port, kill PID {} or let devfleet pick another port.",
                        p
                    ),
                    _ => "Remove the fixed port from the services file to auto-allocate."
                        .to_string(),
                };
                Some(format!("Port {} is already in use. {}", port, kill_hint))
            }
            Error::PortAllocation(msg) => Some(format!(
                "Port allocation failed: {}. Try a wider range via DEVFLEET_PORT_RANGE_START/END.",
                msg
            )),
            Error::ReadinessTimeout { service, .. } => Some(format!(
                "'{}' is still running; inspect its logs or raise readiness_timeout.",
                service
            )),
            Error::ServiceStartFailed(..) => {
                Some("Check that the command exists and is executable".to_string())
            }
            Error::InvalidServiceName { .. } => Some(
                "Use only letters, digits, '.', '-' and '_' (max 63 characters)".to_string(),
            ),
            Error::Config(_) | Error::Validation(_) => {
                Some("Validate your services file with: devfleet check-config".to_string())
            }
            _ => None,
        }
    }

    /// The message followed by its hint, when there is one.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
#[cfg(unix)]
pub fn validate_pid(pid: u32, service_name: &str) -> Result<nix::unistd::Pid> {
    check_pid_bounds(pid, service_name)?;
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

/// Same as validate_pid but allows PID 1 for existence checks.
/// Use validate_pid for signal operations; use this for read-only checks.
#[cfg(unix)]
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}

/// Platform-neutral part of PID validation, shared by every controller.
pub fn check_pid_bounds(pid: u32, service_name: &str) -> Result<()> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for service '{}' (refers to process group, not a process)",
                service_name
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "refusing to operate on PID 1 (init) for service '{}'",
                service_name
            ),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID {} exceeds i32::MAX for service '{}', cannot convert safely",
                pid, service_name
            ),
        });
    }
    Ok(())
}
