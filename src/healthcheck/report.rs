use crate::registry::{CheckType, HealthStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exit code when no service is unhealthy.
pub const EXIT_HEALTHY: i32 = 0;
/// Exit code when at least one service is unhealthy.
pub const EXIT_UNHEALTHY: i32 = 1;
/// Exit code when a streaming session was interrupted by the user.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Outcome of one health poll for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub service_name: String,
    pub method: CheckType,
    /// Raw result of this probe.
    pub success: bool,
    /// The probe passed but the service reported reduced function.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    /// Status after hysteresis.
    pub status: HealthStatus,
    #[serde(with = "crate::config::duration_serde")]
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl HealthCheckResult {
    /// A result for a service that was not probed.
    pub fn unprobed(service_name: impl Into<String>, pid: Option<u32>, port: Option<u16>) -> Self {
        Self {
            service_name: service_name.into(),
            method: CheckType::Process,
            success: false,
            degraded: false,
            status: HealthStatus::Unknown,
            latency: Duration::ZERO,
            timestamp: Utc::now(),
            error: None,
            endpoint: None,
            status_code: None,
            pid,
            port,
        }
    }
}

/// Overall classification of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverallHealth::Healthy => write!(f, "healthy"),
            OverallHealth::Degraded => write!(f, "degraded"),
            OverallHealth::Unhealthy => write!(f, "unhealthy"),
            OverallHealth::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    /// Healthy services whose latest probe came back degraded.
    pub degraded: usize,
    pub unhealthy: usize,
    pub starting: usize,
    pub unknown: usize,
    pub overall: OverallHealth,
}

impl HealthSummary {
    pub fn from_results(results: &[HealthCheckResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            starting: 0,
            unknown: 0,
            overall: OverallHealth::Unknown,
        };
        for result in results {
            match result.status {
                HealthStatus::Healthy if result.degraded => summary.degraded += 1,
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Starting => summary.starting += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }
        summary.overall = if summary.unhealthy > 0 {
            OverallHealth::Unhealthy
        } else if summary.degraded > 0 {
            OverallHealth::Degraded
        } else if summary.healthy > 0 {
            OverallHealth::Healthy
        } else {
            OverallHealth::Unknown
        };
        summary
    }
}

/// One pass over every registered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    /// Sorted by service name.
    pub services: Vec<HealthCheckResult>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new(mut services: Vec<HealthCheckResult>) -> Self {
        services.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        let summary = HealthSummary::from_results(&services);
        Self {
            timestamp: Utc::now(),
            services,
            summary,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.summary.unhealthy > 0 {
            EXIT_UNHEALTHY
        } else {
            EXIT_HEALTHY
        }
    }

    pub fn get(&self, service: &str) -> Option<&HealthCheckResult> {
        self.services.iter().find(|r| r.service_name == service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, status: HealthStatus) -> HealthCheckResult {
        HealthCheckResult {
            status,
            ..HealthCheckResult::unprobed(name, None, None)
        }
    }

    #[test]
    fn test_overall_precedence() {
        let report = HealthReport::new(vec![
            result("b", HealthStatus::Healthy),
            result("a", HealthStatus::Unhealthy),
            result("c", HealthStatus::Starting),
        ]);
        assert_eq!(report.summary.overall, OverallHealth::Unhealthy);
        assert_eq!(report.exit_code(), EXIT_UNHEALTHY);
        assert_eq!(report.services[0].service_name, "a");

        let report = HealthReport::new(vec![
            result("a", HealthStatus::Healthy),
            result("b", HealthStatus::Unknown),
        ]);
        assert_eq!(report.summary.overall, OverallHealth::Healthy);
        assert_eq!(report.exit_code(), EXIT_HEALTHY);

        let report = HealthReport::new(vec![result("a", HealthStatus::Starting)]);
        assert_eq!(report.summary.overall, OverallHealth::Unknown);
        assert_eq!(report.summary.starting, 1);
        assert_eq!(report.summary.degraded, 0);
    }

    #[test]
    fn test_degraded_probe_counts_as_degraded() {
        let degraded = HealthCheckResult {
            degraded: true,
            ..result("b", HealthStatus::Healthy)
        };
        let report = HealthReport::new(vec![result("a", HealthStatus::Healthy), degraded.clone()]);
        assert_eq!(report.summary.healthy, 1);
        assert_eq!(report.summary.degraded, 1);
        assert_eq!(report.summary.overall, OverallHealth::Degraded);
        assert_eq!(report.exit_code(), EXIT_HEALTHY);

        let report = HealthReport::new(vec![degraded, result("c", HealthStatus::Unhealthy)]);
        assert_eq!(report.summary.overall, OverallHealth::Unhealthy);

        // A degraded flag on a service that is not healthy does not move it.
        let starting = HealthCheckResult {
            degraded: true,
            ..result("d", HealthStatus::Starting)
        };
        let report = HealthReport::new(vec![starting]);
        assert_eq!(report.summary.degraded, 0);
        assert_eq!(report.summary.starting, 1);
    }

    #[test]
    fn test_empty_report() {
        let report = HealthReport::new(Vec::new());
        assert_eq!(report.summary.total, 0);
        assert_eq!(report.summary.overall, OverallHealth::Unknown);
        assert_eq!(report.exit_code(), EXIT_HEALTHY);
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let json = serde_json::to_value(result("api", HealthStatus::Healthy)).unwrap();
        assert_eq!(json["serviceName"], "api");
        assert_eq!(json["status"], "healthy");
        assert!(json.get("statusCode").is_none());
        assert!(json.get("degraded").is_none());
    }
}
