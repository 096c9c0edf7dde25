use crate::error::{Error, Result};
use crate::registry::CheckType;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Details of one probe, beyond pass/fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub success: bool,
    /// The service answered but reported reduced function.
    pub degraded: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn passed() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Health checker trait for services
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Check if the service is healthy
    async fn check(&self) -> Result<bool>;

    /// Get the timeout duration
    fn timeout(&self) -> Duration;

    fn method(&self) -> CheckType;

    /// What is being probed, for display.
    fn endpoint(&self) -> Option<String> {
        None
    }

    /// Run [`check`](Self::check) and describe the result.
    async fn probe(&self) -> ProbeReport {
        match self.check().await {
            Ok(true) => ProbeReport::passed(),
            Ok(false) => ProbeReport::failed(format!("{} check failed", self.method())),
            Err(e) => ProbeReport::failed(e.to_string()),
        }
    }
}

/// Poll `checker` until it passes, `deadline` elapses or `cancel` fires.
///
/// Starts polling at `interval` and doubles the delay after each failure,
/// capped at `max_interval`.
pub async fn wait_until_healthy<C: HealthChecker + ?Sized>(
    checker: &C,
    service: &str,
    deadline: Duration,
    interval: Duration,
    max_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let started = Instant::now();
    let mut current_delay = interval;
    let mut last_error: Option<String> = None;

    loop {
        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled(service.to_string())),
            report = checker.probe() => report,
        };
        if report.success {
            return Ok(());
        }
        last_error = report.error.or(last_error);

        let elapsed = started.elapsed();
        if elapsed >= deadline {
            tracing::debug!(
                service.name = %service,
                error = ?last_error,
                "Readiness deadline reached"
            );
            return Err(Error::ReadinessTimeout {
                service: service.to_string(),
                seconds: deadline.as_secs(),
            });
        }

        let pause = current_delay.min(deadline - elapsed);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled(service.to_string())),
            _ = sleep(pause) => {}
        }
        current_delay = std::cmp::min(current_delay * 2, max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        pass_after: usize,
    }

    #[async_trait]
    impl HealthChecker for Flaky {
        async fn check(&self) -> Result<bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n > self.pass_after)
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(10)
        }

        fn method(&self) -> CheckType {
            CheckType::Process
        }
    }

    #[tokio::test]
    async fn test_wait_until_healthy_retries() {
        let checker = Flaky {
            calls: AtomicUsize::new(0),
            pass_after: 2,
        };
        wait_until_healthy(
            &checker,
            "svc",
            Duration::from_secs(5),
            Duration::from_millis(5),
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(checker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_until_healthy_times_out() {
        let checker = Flaky {
            calls: AtomicUsize::new(0),
            pass_after: usize::MAX,
        };
        let err = wait_until_healthy(
            &checker,
            "svc",
            Duration::from_millis(50),
            Duration::from_millis(5),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_until_healthy_cancelled() {
        let checker = Flaky {
            calls: AtomicUsize::new(0),
            pass_after: usize::MAX,
        };
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let err = wait_until_healthy(
            &checker,
            "svc",
            Duration::from_secs(30),
            Duration::from_millis(5),
            Duration::from_millis(10),
            &token,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_default_probe_maps_errors() {
        struct Broken;
        #[async_trait]
        impl HealthChecker for Broken {
            async fn check(&self) -> Result<bool> {
                Err(Error::HealthCheckFailed("svc".into(), "refused".into()))
            }
            fn timeout(&self) -> Duration {
                Duration::from_secs(1)
            }
            fn method(&self) -> CheckType {
                CheckType::Tcp
            }
        }
        let report = Broken.probe().await;
        assert!(!report.success);
        assert!(report.error.unwrap().contains("refused"));
    }
}
