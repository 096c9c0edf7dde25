use crate::registry::HealthStatus;
use chrono::{DateTime, Utc};

/// Per-service streak counters that smooth individual probe results into a
/// health status.
///
/// During the grace window (`start_period` after `start_time`) failures never
/// count toward unhealthy, but they do break a success streak; the status
/// reads `starting` until enough consecutive successes arrive.
/// After it, `retries` consecutive failures make the service unhealthy and
/// `success_threshold` consecutive successes make it healthy; anything short
/// of a threshold leaves the status where it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HysteresisTracker {
    status: HealthStatus,
    successes: u32,
    failures: u32,
    start_time: Option<DateTime<Utc>>,
    pid: Option<u32>,
}

impl HysteresisTracker {
    pub fn new(initial: HealthStatus, start_time: Option<DateTime<Utc>>, pid: Option<u32>) -> Self {
        Self {
            status: initial,
            successes: 0,
            failures: 0,
            start_time,
            pid,
        }
    }

    /// Whether this tracker belongs to the given process incarnation.
    pub fn tracks(&self, start_time: Option<DateTime<Utc>>, pid: Option<u32>) -> bool {
        self.start_time == start_time && self.pid == pid
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn streaks(&self) -> (u32, u32) {
        (self.successes, self.failures)
    }

    /// Feed one probe result and return the resulting status.
    pub fn observe(
        &mut self,
        success: bool,
        in_grace: bool,
        retries: u32,
        success_threshold: u32,
    ) -> HealthStatus {
        let retries = retries.max(1);
        let success_threshold = success_threshold.max(1);

        if in_grace {
            if success {
                self.failures = 0;
                self.successes = self.successes.saturating_add(1);
                if self.successes >= success_threshold {
                    self.status = HealthStatus::Healthy;
                }
            } else {
                self.successes = 0;
            }
            if self.status != HealthStatus::Healthy {
                self.status = HealthStatus::Starting;
            }
            return self.status;
        }

        if success {
            self.failures = 0;
            self.successes = self.successes.saturating_add(1);
            if self.successes >= success_threshold {
                self.status = HealthStatus::Healthy;
            }
        } else {
            self.successes = 0;
            self.failures = self.failures.saturating_add(1);
            if self.failures >= retries {
                self.status = HealthStatus::Unhealthy;
            }
        }
        self.status
    }
}

/// Whether `now` falls inside the grace window.
pub fn in_grace_period(
    start_time: Option<DateTime<Utc>>,
    start_period: std::time::Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(start) = start_time else {
        return false;
    };
    if start_period.is_zero() {
        return false;
    }
    match chrono::Duration::from_std(start_period) {
        Ok(period) => now < start + period,
        Err(_) => true,
    }
}
