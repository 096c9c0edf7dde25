use super::HealthCheckConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// How a service's process is expected to behave over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Long-running server (default).
    #[default]
    Daemon,
    /// Long-running file watcher / dev server that rebuilds on change.
    Watch,
    /// One-shot build; exits when done.
    Build,
    /// One-shot task; exits when done.
    Task,
}

impl ServiceMode {
    /// Build and task processes are expected to exit on their own.
    pub fn is_one_shot(self) -> bool {
        matches!(self, ServiceMode::Build | ServiceMode::Task)
    }
}

impl fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceMode::Daemon => write!(f, "daemon"),
            ServiceMode::Watch => write!(f, "watch"),
            ServiceMode::Build => write!(f, "build"),
            ServiceMode::Task => write!(f, "task"),
        }
    }
}

/// One service as declared in the services file.
///
/// ```yaml
/// - name: api
///   command: npm run dev
///   cwd: ./api
///   port: 3000            # preferred port; implies a port is needed
///   env:
///     NODE_ENV: development
///   healthcheck:
///     http: /health
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub name: String,

    /// Shell command line; run through `sh -c` (or `cmd /C` on Windows).
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub mode: ServiceMode,

    /// Preferred port. When the port is taken a different one is allocated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Allocate a port even though no preferred port is given.
    #[serde(default)]
    pub assign_port: bool,

    #[serde(default)]
    pub healthcheck: HealthCheckConfig,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cwd: None,
            env: HashMap::new(),
            mode: ServiceMode::Daemon,
            port: None,
            assign_port: false,
            healthcheck: HealthCheckConfig::default(),
        }
    }

    pub fn needs_port(&self) -> bool {
        self.port.is_some() || self.assign_port
    }

    pub fn with_mode(mut self, mode: ServiceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_assigned_port(mut self) -> Self {
        self.assign_port = true;
        self
    }

    pub fn with_healthcheck(mut self, healthcheck: HealthCheckConfig) -> Self {
        self.healthcheck = healthcheck;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}
