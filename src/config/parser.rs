use super::Config;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAMES: [&str; 2] = ["devfleet.yaml", "devfleet.yml"];

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
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        // Try parent directory
        if let Some(parent) = dir.parent() {
            return Self::find_config_in_dir(parent);
        }

        Err(Error::Config(
            "Could not find devfleet.yaml in current directory or any parent".to_string(),
        ))
    }

    /// Load config from file path
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<Config> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        self.parse_config(&content)
    }

    /// Parse config from YAML string
    pub fn parse_config(&self, content: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?;

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
    use std::time::Duration;

    #[test]
    fn test_parse_simple_config() {
        let yaml = r#"
state_dir: .state
health:
  interval: 2s
  failure_threshold: 5
recovery:
  backoff: [1s, 2s]
services:
  db:
    command: ["postgres", "-D", "data"]
    class: infrastructure
    port: 5432
  backend:
    command: ["cargo", "run"]
    class: backend
    port_range: [8000, 8010]
    depends_on: [db]
"#;

        let parser = Parser::new();
        let config = parser.parse_config(yaml).unwrap();

        assert_eq!(config.services.len(), 2);
        assert_eq!(config.health.interval, Duration::from_secs(2));
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.timeout, Duration::from_secs(5));
        assert_eq!(
            config.recovery.backoff,
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(config.services["backend"].depends_on, vec!["db"]);
        assert_eq!(config.services["backend"].health_path, "/health");
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Parser::new().parse_config("services: {}").unwrap();
        assert_eq!(config.recovery.backoff.len(), 3);
        assert_eq!(config.shutdown.emergency_timeout, Duration::from_secs(30));
        assert_eq!(config.registry.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_bad_duration_is_config_error() {
        let err = Parser::new()
            .parse_config("health:\n  interval: soon\n")
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_find_config_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("devfleet.yml"), "services: {}").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = Parser::find_config_in_dir(&nested).unwrap();
        assert_eq!(found, dir.path().join("devfleet.yml"));
    }
}
