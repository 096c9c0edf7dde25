use super::ProjectConfig;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "devfleet.yaml";
const ALT_CONFIG_FILE_NAME: &str = "devfleet.yml";

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Find config file starting from current directory
    pub fn find_config_file(&self) -> Result<PathBuf> {
        let current_dir = std::env::current_dir()?;
        Self::find_config_in_dir(&current_dir)
    }

    pub fn find_config_in_dir(dir: &Path) -> Result<PathBuf> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Ok(config_path);
        }

        let alt_path = dir.join(ALT_CONFIG_FILE_NAME);
        if alt_path.exists() {
            return Ok(alt_path);
        }

        if let Some(parent) = dir.parent() {
            return Self::find_config_in_dir(parent);
        }

        Err(Error::Config(format!(
            "Could not find {} in current directory or any parent",
            CONFIG_FILE_NAME
        )))
    }

    /// Load, apply environment overrides and validate a services file.
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<ProjectConfig> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let mut config = self.parse_config(&content)?;
        config.settings.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse config from YAML string. Does not validate.
    pub fn parse_config(&self, content: &str) -> Result<ProjectConfig> {
        let config: ProjectConfig = serde_yaml::from_str(content)
            .map_err(|e| Error::Parse(format!("Failed to parse YAML config: {}", e)))?;

        Ok(config)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceMode;
    use std::time::Duration;

    #[test]
    fn test_parse_simple_config() {
        let yaml = r#"
settings:
  stop_grace: 2s

services:
  - name: db
    command: ./start-db.sh
    port: 5432
  - name: api
    command: cargo run
    assign_port: true
    env:
      RUST_LOG: debug
    healthcheck:
      http: /health
      retries: 2
  - name: migrate
    command: ./migrate.sh
    mode: task
"#;

        let parser = Parser::new();
        let config = parser.parse_config(yaml).unwrap();
        config.validate().unwrap();

        let names: Vec<_> = config.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["db", "api", "migrate"]);
        assert_eq!(config.settings.stop_grace, Duration::from_secs(2));
        assert_eq!(config.service("migrate").unwrap().mode, ServiceMode::Task);
        assert_eq!(config.service("api").unwrap().healthcheck.retries, 2);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
services:
  - name: api
    command: a
  - name: api
    command: b
"#;
        let config = Parser::new().parse_config(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_unsafe_name_rejected() {
        let yaml = "services:\n  - name: ../etc\n    command: x\n";
        let config = Parser::new().parse_config(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidServiceName { .. })
        ));
    }

    #[test]
    fn test_health_path_without_port_rejected() {
        let yaml = r#"
services:
  - name: api
    command: x
    healthcheck:
      http: /health
"#;
        let config = Parser::new().parse_config(yaml).unwrap();
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let result = Parser::new().parse_config("services: [name: ");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_load_and_find_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "services:\n  - name: web\n    command: serve\n").unwrap();

        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(Parser::find_config_in_dir(&nested).unwrap(), path);

        let config = Parser::new().load_config(&path).unwrap();
        assert_eq!(config.services.len(), 1);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Parser::new().load_config(dir.path().join("nope.yaml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
