use super::{duration_serde, parse_duration_string};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default inclusive port range for automatic allocation.
pub const DEFAULT_PORT_RANGE_START: u16 = 3000;
pub const DEFAULT_PORT_RANGE_END: u16 = 65535;

/// Lines kept per service in the log ring buffer.
pub const DEFAULT_LOG_BUFFER_LINES: usize = 1000;

/// Bounded wait for a healthy log subscriber before a line is dropped for it.
pub const DEFAULT_LOG_SUBSCRIBER_TIMEOUT: Duration = Duration::from_millis(10);

/// Streaming health checks never poll faster than this.
pub const MIN_HEALTH_INTERVAL: Duration = Duration::from_secs(1);

pub const ENV_PORT_RANGE_START: &str = "DEVFLEET_PORT_RANGE_START";
pub const ENV_PORT_RANGE_END: &str = "DEVFLEET_PORT_RANGE_END";
pub const ENV_LOCK_TIMEOUT: &str = "DEVFLEET_LOCK_TIMEOUT";
pub const ENV_STOP_GRACE: &str = "DEVFLEET_STOP_GRACE";

/// Engine-wide tunables. Every field has a default, so an empty
/// `settings:` block (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// How long an operation waits for a service's lock before reporting a conflict.
    #[serde(with = "duration_serde")]
    pub lock_timeout: Duration,

    /// Bound on the spawn phase of a start, port allocation included.
    #[serde(with = "duration_serde")]
    pub operation_timeout: Duration,

    /// Upper bound on the readiness wait after spawning a long-running service.
    #[serde(with = "duration_serde")]
    pub readiness_timeout: Duration,

    /// Time between SIGTERM and SIGKILL.
    #[serde(with = "duration_serde")]
    pub stop_grace: Duration,

    pub port_range_start: u16,
    pub port_range_end: u16,

    pub log_buffer_lines: usize,

    #[serde(with = "duration_serde")]
    pub log_subscriber_timeout: Duration,

    /// Pending changes each registry observer may queue before new ones are dropped.
    pub observer_queue: usize,

    #[serde(with = "duration_serde")]
    pub observer_timeout: Duration,

    #[serde(with = "duration_serde")]
    pub health_interval: Duration,

    pub max_concurrent_checks: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            log_buffer_lines: DEFAULT_LOG_BUFFER_LINES,
            log_subscriber_timeout: DEFAULT_LOG_SUBSCRIBER_TIMEOUT,
            observer_queue: 256,
            observer_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(5),
            max_concurrent_checks: 10,
        }
    }
}

impl Settings {
    /// Apply `DEVFLEET_*` environment overrides on top of the file values.
    ///
    /// Unparseable values are ignored with a warning rather than failing the load.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Same as [`apply_env`](Self::apply_env) with an injectable lookup, so tests
    /// don't have to mutate the process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(ENV_PORT_RANGE_START) {
            match raw.trim().parse::<u16>() {
                Ok(v) if v > 0 => self.port_range_start = v,
                _ => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_PORT_RANGE_START),
            }
        }
        if let Some(raw) = lookup(ENV_PORT_RANGE_END) {
            match raw.trim().parse::<u16>() {
                Ok(v) if v > 0 => self.port_range_end = v,
                _ => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_PORT_RANGE_END),
            }
        }
        if let Some(raw) = lookup(ENV_LOCK_TIMEOUT) {
            match parse_duration_string(&raw) {
                Some(d) => self.lock_timeout = d,
                None => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_LOCK_TIMEOUT),
            }
        }
        if let Some(raw) = lookup(ENV_STOP_GRACE) {
            match parse_duration_string(&raw) {
                Some(d) => self.stop_grace = d,
                None => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_STOP_GRACE),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_range_start > self.port_range_end {
            return Err(Error::Config(format!(
                "port range is inverted: {} > {}",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.log_buffer_lines == 0 {
            return Err(Error::Config("log_buffer_lines must be at least 1".into()));
        }
        if self.observer_queue == 0 {
            return Err(Error::Config("observer_queue must be at least 1".into()));
        }
        if self.max_concurrent_checks == 0 {
            return Err(Error::Config(
                "max_concurrent_checks must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Health interval clamped to the one-second floor.
    pub fn effective_health_interval(&self) -> Duration {
        self.health_interval.max(MIN_HEALTH_INTERVAL)
    }
}
