use super::{HealthChecker, HttpChecker, ProcessChecker, TcpChecker};
use crate::config::HealthCheckConfig;
use crate::error::Result;
use crate::process::ProcessController;
use std::collections::HashMap;
use std::sync::Arc;

/// Pick the probe for a service: declared HTTP endpoint, else TCP on the
/// assigned port, else process liveness. `None` when there is neither a pid
/// nor a port to look at.
pub fn resolve_checker(
    config: &HealthCheckConfig,
    pid: Option<u32>,
    port: Option<u16>,
    controller: &Arc<dyn ProcessController>,
) -> Result<Option<Arc<dyn HealthChecker>>> {
    if let Some(url) = config.http_url(port) {
        return Ok(Some(Arc::new(HttpChecker::new(url, config.timeout)?)));
    }
    if let Some(port) = port {
        return Ok(Some(Arc::new(TcpChecker::new(port, config.timeout))));
    }
    Ok(pid.map(|pid| Arc::new(ProcessChecker::new(pid, controller.clone())) as Arc<dyn HealthChecker>))
}

struct Cached {
    config: HealthCheckConfig,
    pid: Option<u32>,
    port: Option<u16>,
    checker: Option<Arc<dyn HealthChecker>>,
}

/// Resolved probes per service, rebuilt only when the inputs change.
#[derive(Default)]
pub struct MethodCache {
    entries: HashMap<String, Cached>,
}

impl MethodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_resolve(
        &mut self,
        service: &str,
        config: &HealthCheckConfig,
        pid: Option<u32>,
        port: Option<u16>,
        controller: &Arc<dyn ProcessController>,
    ) -> Result<Option<Arc<dyn HealthChecker>>> {
        if let Some(cached) = self.entries.get(service) {
            if cached.config == *config && cached.pid == pid && cached.port == port {
                return Ok(cached.checker.clone());
            }
        }
        let checker = resolve_checker(config, pid, port, controller)?;
        if let Some(c) = &checker {
            tracing::debug!(service.name = %service, method = %c.method(), "Resolved health check method");
        }
        self.entries.insert(
            service.to_string(),
            Cached {
                config: config.clone(),
                pid,
                port,
                checker: checker.clone(),
            },
        );
        Ok(checker)
    }

    pub fn invalidate(&mut self, service: &str) {
        self.entries.remove(service);
    }
}
