//! Health check configuration.
//!
//! ```yaml
//! healthcheck:
//!   http: /healthz          # path on the assigned port, or a full URL
//!   timeout: 2s
//!   start_period: 10s
//!   retries: 3
//!   success_threshold: 2
//! ```

use super::duration_serde;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default health check timeout (5 seconds).
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failures needed before a service is reported unhealthy.
pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    /// HTTP endpoint. A value starting with `/` is resolved against the
    /// service's assigned port on localhost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,

    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Grace window after start during which failures are reported as `starting`.
    #[serde(default, with = "duration_serde")]
    pub start_period: Duration,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default)]
    pub disabled: bool,
}

fn default_timeout() -> Duration {
    DEFAULT_HEALTH_CHECK_TIMEOUT
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_success_threshold() -> u32 {
    1
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            http: None,
            timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            start_period: Duration::ZERO,
            retries: DEFAULT_RETRIES,
            success_threshold: 1,
            disabled: false,
        }
    }
}

impl HealthCheckConfig {
    /// Resolve the configured endpoint into an absolute URL.
    ///
    /// Paths need a port; without one there is nothing to resolve against.
    pub fn http_url(&self, port: Option<u16>) -> Option<String> {
        let target = self.http.as_deref()?.trim();
        if target.starts_with("http://") || target.starts_with("https://") {
            return Some(target.to_string());
        }
        let port = port?;
        let path = if target.starts_with('/') {
            target.to_string()
        } else {
            format!("/{}", target)
        };
        Some(format!("http://localhost:{}{}", port, path))
    }

    /// Thresholds below one make no sense; treat them as one.
    pub fn effective_retries(&self) -> u32 {
        self.retries.max(1)
    }

    pub fn effective_success_threshold(&self) -> u32 {
        self.success_threshold.max(1)
    }
}
