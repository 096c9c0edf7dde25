use super::HealthChecker;
use crate::error::Result;
use crate::process::ProcessController;
use crate::registry::CheckType;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Liveness only: the process exists and is not a zombie.
pub struct ProcessChecker {
    pid: u32,
    controller: Arc<dyn ProcessController>,
}

impl ProcessChecker {
    pub fn new(pid: u32, controller: Arc<dyn ProcessController>) -> Self {
        Self { pid, controller }
    }
}

#[async_trait]
impl HealthChecker for ProcessChecker {
    async fn check(&self) -> Result<bool> {
        Ok(self.controller.is_alive(self.pid))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn method(&self) -> CheckType {
        CheckType::Process
    }

    fn endpoint(&self) -> Option<String> {
        Some(format!("pid {}", self.pid))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::default_controller;

    #[tokio::test]
    async fn test_process_checker_self_is_alive() {
        let checker = ProcessChecker::new(std::process::id(), default_controller());
        assert!(checker.check().await.unwrap());
        assert_eq!(checker.method(), CheckType::Process);
    }
}
