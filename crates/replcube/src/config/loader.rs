//! Configuration file loading for replcube
//!
//! Handles loading and parsing configuration files using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, File, FileFormat};

use crate::config::{Config, ConfigError};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    fn validate(&self) -> Result<(), ConfigError> {
        if self.policy.execution_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "policy.execution_timeout_secs must be positive; set enable_timeout = false to disable"
                    .into(),
            ));
        }
        if self.policy.max_source_bytes == Some(0) {
            return Err(ConfigError::Invalid(
                "policy.max_source_bytes must be positive".into(),
            ));
        }
        for (field, entries) in [
            ("forbidden_apis", &self.policy.forbidden_apis),
            ("blocked_paths", &self.policy.blocked_paths),
            ("allowed_paths", &self.policy.allowed_paths),
            ("blocked_libraries", &self.policy.blocked_libraries),
        ] {
            if entries.iter().any(|entry| entry.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "policy.{field} contains an empty entry"
                )));
            }
        }
        if self.sessions.ttl_secs == 0 {
            return Err(ConfigError::Invalid("sessions.ttl_secs must be positive".into()));
        }
        if self.sessions.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sessions.sweep_interval_secs must be positive".into(),
            ));
        }
        if self.isolation.max_concurrent_units == 0 {
            return Err(ConfigError::Invalid(
                "isolation.max_concurrent_units must be at least 1".into(),
            ));
        }
        if self.isolation.memory_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "isolation.memory_poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
