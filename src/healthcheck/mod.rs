//! Health probing and monitoring.
//!
//! Probes (`http`, `tcp`, `process`) implement [`HealthChecker`]. The
//! [`HealthMonitor`] picks one per service through the cascade, smooths the
//! results with hysteresis and records transitions in the registry.

mod cascade;
mod checker;
mod http;
mod hysteresis;
mod monitor;
mod process;
mod report;
mod tcp;

pub use cascade::{resolve_checker, MethodCache};
pub use checker::{wait_until_healthy, HealthChecker, ProbeReport};
pub use http::HttpChecker;
pub use hysteresis::{in_grace_period, HysteresisTracker};
pub use monitor::{
    HealthEvent, HealthMonitor, HealthStream, DEFAULT_MAX_CONCURRENT_CHECKS, MIN_STREAM_INTERVAL,
};
pub use process::ProcessChecker;
pub use report::{
    HealthCheckResult, HealthReport, HealthSummary, OverallHealth, EXIT_HEALTHY,
    EXIT_INTERRUPTED, EXIT_UNHEALTHY,
};
pub use tcp::TcpChecker;
