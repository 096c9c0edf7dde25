use super::HealthChecker;
use crate::error::{Error, Result};
use crate::registry::CheckType;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Healthy when a TCP connection to `127.0.0.1:<port>` succeeds in time.
pub struct TcpChecker {
    port: u16,
    timeout: Duration,
}

impl TcpChecker {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self) -> Result<bool> {
        let addr = ("127.0.0.1", self.port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(true),
            Ok(Err(e)) => Err(Error::HealthCheckFailed(
                format!("127.0.0.1:{}", self.port),
                e.to_string(),
            )),
            Err(_) => Err(Error::HealthCheckFailed(
                format!("127.0.0.1:{}", self.port),
                format!("connect timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn method(&self) -> CheckType {
        CheckType::Tcp
    }

    fn endpoint(&self) -> Option<String> {
        Some(format!("127.0.0.1:{}", self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_checker_open_and_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let checker = TcpChecker::new(port, Duration::from_secs(1));
        assert!(checker.check().await.unwrap());

        drop(listener);
        let report = checker.probe().await;
        assert!(!report.success);
        assert!(report.error.unwrap().contains(&port.to_string()));
    }
}
