use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::SecurityPolicy;

mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../replcube.example.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Named starting point for the security policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPreset {
    #[default]
    #[serde(alias = "strict")]
    Production,
    #[serde(alias = "development")]
    Permissive,
}

impl PolicyPreset {
    pub fn policy(self) -> SecurityPolicy {
        match self {
            PolicyPreset::Production => SecurityPolicy::production(),
            PolicyPreset::Permissive => SecurityPolicy::permissive(),
        }
    }
}

/// `[policy]` section: a preset plus optional per-field overrides
///
/// List fields extend the preset's lists; the allow list replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub preset: PolicyPreset,

    #[serde(default)]
    pub execution_timeout_secs: Option<u64>,

    #[serde(default)]
    pub enable_timeout: Option<bool>,

    #[serde(default)]
    pub max_memory_bytes: Option<u64>,

    #[serde(default)]
    pub enable_memory_limit: Option<bool>,

    #[serde(default)]
    pub enable_api_restrictions: Option<bool>,

    #[serde(default)]
    pub max_source_bytes: Option<usize>,

    #[serde(default)]
    pub forbidden_apis: Vec<String>,

    #[serde(default)]
    pub blocked_paths: Vec<String>,

    #[serde(default)]
    pub allowed_paths: Vec<String>,

    #[serde(default)]
    pub blocked_libraries: Vec<String>,
}

impl PolicyConfig {
    /// Build the effective policy: preset values, then overrides
    pub fn to_policy(&self) -> SecurityPolicy {
        let base = self.preset.policy();

        let forbidden: Vec<String> = base
            .forbidden_apis()
            .iter()
            .cloned()
            .chain(self.forbidden_apis.iter().cloned())
            .collect();
        let blocked_paths: Vec<String> = base
            .blocked_filesystem_paths()
            .iter()
            .cloned()
            .chain(self.blocked_paths.iter().cloned())
            .collect();
        let blocked_libraries: Vec<String> = base
            .blocked_libraries()
            .iter()
            .cloned()
            .chain(self.blocked_libraries.iter().cloned())
            .collect();
        let allowed_paths = if self.allowed_paths.is_empty() {
            base.allowed_filesystem_paths().iter().cloned().collect()
        } else {
            self.allowed_paths.clone()
        };

        let timeout = self
            .execution_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(base.execution_timeout());
        let enable_timeout = self.enable_timeout.unwrap_or(base.timeout_enabled());
        let max_memory = self.max_memory_bytes.unwrap_or(base.max_memory_bytes());
        let enable_memory = self
            .enable_memory_limit
            .unwrap_or(base.memory_limit_enabled());
        let restrictions = self
            .enable_api_restrictions
            .unwrap_or(base.api_restrictions_enabled());
        let max_source = self.max_source_bytes.unwrap_or(base.max_source_bytes());

        base.with_execution_timeout(timeout)
            .with_timeout_enabled(enable_timeout)
            .with_max_memory_bytes(max_memory)
            .with_memory_limit_enabled(enable_memory)
            .with_api_restrictions(restrictions)
            .with_max_source_bytes(max_source)
            .with_forbidden_apis(forbidden)
            .with_blocked_paths(blocked_paths)
            .with_allowed_paths(allowed_paths)
            .with_blocked_libraries(blocked_libraries)
    }
}

/// `[sessions]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which a session is swept
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// `[isolation]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Units that may be loaded at the same time
    #[serde(default = "default_max_concurrent_units")]
    pub max_concurrent_units: usize,

    #[serde(default = "default_memory_poll_interval_ms")]
    pub memory_poll_interval_ms: u64,

    /// Output captured per execution before truncation
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl IsolationConfig {
    pub fn memory_poll_interval(&self) -> Duration {
        Duration::from_millis(self.memory_poll_interval_ms)
    }
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_units: default_max_concurrent_units(),
            memory_poll_interval_ms: default_memory_poll_interval_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// `[packages]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Local package cache (`<dir>/<name>/<version>/...`). Without one no
    /// package resolves.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

/// Config for replcube
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub isolation: IsolationConfig,

    #[serde(default)]
    pub packages: PackageConfig,
}

impl Config {
    /// Create a config from the embedded example
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in defaults without reading the example file
    pub fn empty() -> Self {
        Self {
            policy: PolicyConfig::default(),
            sessions: SessionConfig::default(),
            isolation: IsolationConfig::default(),
            packages: PackageConfig::default(),
        }
    }

    /// Replace the policy section with a bare preset
    pub fn with_preset(mut self, preset: PolicyPreset) -> Self {
        self.policy = PolicyConfig {
            preset,
            ..PolicyConfig::default()
        };
        self
    }

    pub fn security_policy(&self) -> SecurityPolicy {
        self.policy.to_policy()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_ttl_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_concurrent_units() -> usize {
    16
}

fn default_memory_poll_interval_ms() -> u64 {
    100
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}
