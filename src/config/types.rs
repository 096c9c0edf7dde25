use super::{ServiceSpec, Settings};
use crate::error::{Error, Result};
use crate::operations::validate_service_name;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Top-level services file.
///
/// `services` is a list rather than a map so that declaration order survives
/// parsing; bulk operations report results in this order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl ProjectConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(Error::Validation("Service name must not be empty".into()));
            }
            validate_service_name(&service.name)?;

            if !seen.insert(service.name.as_str()) {
                return Err(Error::Validation(format!(
                    "Service '{}' is declared more than once",
                    service.name
                )));
            }

            if service.command.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "Service '{}' has an empty command",
                    service.name
                )));
            }

            if let Some(port) = service.port {
                if port == 0 {
                    return Err(Error::Validation(format!(
                        "Service '{}' declares port 0; omit it and set assign_port instead",
                        service.name
                    )));
                }
            }

            if let Some(http) = service.healthcheck.http.as_deref() {
                let is_url = http.starts_with("http://") || http.starts_with("https://");
                if !is_url && !service.needs_port() {
                    return Err(Error::Validation(format!(
                        "Service '{}' has an HTTP health path '{}' but no port to resolve it against",
                        service.name, http
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }
}
