//! Security policy presets and accessors
//!
//! A [`SecurityPolicy`] is plain data. Once built it is shared read-only
//! (behind an `Arc`) by every request the pipeline serves.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;

/// Limits and restrictions applied to every execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityPolicy {
    execution_timeout: Duration,
    enable_timeout: bool,
    max_memory_bytes: u64,
    enable_memory_limit: bool,
    enable_api_restrictions: bool,
    forbidden_apis: BTreeSet<String>,
    blocked_filesystem_paths: BTreeSet<String>,
    allowed_filesystem_paths: BTreeSet<String>,
    blocked_libraries: BTreeSet<String>,
    max_source_bytes: usize,
}

impl SecurityPolicy {
    /// 1 mebibyte in bytes
    pub const MIB: u64 = 1024 * 1024;

    /// Strict settings for servers reachable by untrusted callers
    pub fn production() -> Self {
        Self {
            execution_timeout: Duration::from_secs(30),
            enable_timeout: true,
            max_memory_bytes: 512 * Self::MIB,
            enable_memory_limit: true,
            enable_api_restrictions: true,
            forbidden_apis: set(&[
                "System.Diagnostics.Process",
                "Process.Start",
                "ProcessStartInfo",
                "Environment.Exit",
                "Environment.FailFast",
                "Environment.SetEnvironmentVariable",
                "AppDomain",
                "Assembly.Load",
                "Assembly.LoadFrom",
                "Assembly.LoadFile",
                "Activator.CreateInstance",
                "Type.GetType",
                "System.Reflection.Emit",
                "System.Runtime.InteropServices",
                "DllImport",
                "Marshal",
                "File.Delete",
                "Directory.Delete",
            ]),
            blocked_filesystem_paths: set(&[
                "/etc",
                "/proc",
                "/sys",
                "/dev",
                "/root",
                "/boot",
                "/var/run",
                "C:\\Windows",
                "C:\\Program Files",
            ]),
            allowed_filesystem_paths: BTreeSet::new(),
            blocked_libraries: set(&[
                "System.Management",
                "System.Net.Sockets",
                "System.IO.Pipes",
                "Microsoft.Win32.Registry",
                "System.ServiceProcess",
            ]),
            max_source_bytes: 64 * 1024,
        }
    }

    /// Relaxed settings for local development
    pub fn permissive() -> Self {
        Self {
            execution_timeout: Duration::from_secs(300),
            enable_timeout: true,
            max_memory_bytes: 0,
            enable_memory_limit: false,
            enable_api_restrictions: false,
            forbidden_apis: BTreeSet::new(),
            blocked_filesystem_paths: BTreeSet::new(),
            allowed_filesystem_paths: BTreeSet::new(),
            blocked_libraries: BTreeSet::new(),
            max_source_bytes: 1024 * 1024,
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        self.execution_timeout
    }

    pub fn timeout_enabled(&self) -> bool {
        self.enable_timeout
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    pub fn memory_limit_enabled(&self) -> bool {
        self.enable_memory_limit
    }

    pub fn api_restrictions_enabled(&self) -> bool {
        self.enable_api_restrictions
    }

    pub fn forbidden_apis(&self) -> &BTreeSet<String> {
        &self.forbidden_apis
    }

    pub fn blocked_filesystem_paths(&self) -> &BTreeSet<String> {
        &self.blocked_filesystem_paths
    }

    pub fn allowed_filesystem_paths(&self) -> &BTreeSet<String> {
        &self.allowed_filesystem_paths
    }

    pub fn blocked_libraries(&self) -> &BTreeSet<String> {
        &self.blocked_libraries
    }

    pub fn max_source_bytes(&self) -> usize {
        self.max_source_bytes
    }

    /// Timeout to enforce, or `None` when timeouts are disabled
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.enable_timeout.then_some(self.execution_timeout)
    }

    /// Memory ceiling to enforce; 0 means unlimited
    pub fn effective_memory_limit(&self) -> u64 {
        if self.enable_memory_limit {
            self.max_memory_bytes
        } else {
            0
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_timeout_enabled(mut self, enabled: bool) -> Self {
        self.enable_timeout = enabled;
        self
    }

    pub fn with_max_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn with_memory_limit_enabled(mut self, enabled: bool) -> Self {
        self.enable_memory_limit = enabled;
        self
    }

    pub fn with_api_restrictions(mut self, enabled: bool) -> Self {
        self.enable_api_restrictions = enabled;
        self
    }

    pub fn with_forbidden_apis<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden_apis = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blocked_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_filesystem_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allowed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_filesystem_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_blocked_libraries<I, S>(mut self, libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_libraries = libraries.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_source_bytes(mut self, bytes: usize) -> Self {
        self.max_source_bytes = bytes;
        self
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::production()
    }
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_enables_everything() {
        let policy = SecurityPolicy::production();
        assert!(policy.timeout_enabled());
        assert!(policy.memory_limit_enabled());
        assert!(policy.api_restrictions_enabled());
        assert!(policy.forbidden_apis().contains("Process.Start"));
        assert!(policy.blocked_filesystem_paths().contains("/etc"));
        assert_eq!(policy.effective_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(policy.effective_memory_limit(), 512 * SecurityPolicy::MIB);
    }

    #[test]
    fn permissive_disables_restrictions() {
        let policy = SecurityPolicy::permissive();
        assert!(!policy.api_restrictions_enabled());
        assert_eq!(policy.effective_memory_limit(), 0);
        assert!(policy.blocked_libraries().is_empty());
    }

    #[test]
    fn default_is_production() {
        assert_eq!(SecurityPolicy::default(), SecurityPolicy::production());
    }

    #[test]
    fn disabled_limits_are_not_effective() {
        let policy = SecurityPolicy::production()
            .with_timeout_enabled(false)
            .with_memory_limit_enabled(false);
        assert_eq!(policy.effective_timeout(), None);
        assert_eq!(policy.effective_memory_limit(), 0);
        // the configured values are kept
        assert_eq!(policy.max_memory_bytes(), 512 * SecurityPolicy::MIB);
    }

    #[test]
    fn builder_methods_replace_lists() {
        let policy = SecurityPolicy::permissive()
            .with_blocked_libraries(["Evil.Lib"])
            .with_allowed_paths(vec!["/tmp/work".to_string()])
            .with_max_source_bytes(10);
        assert_eq!(policy.blocked_libraries().len(), 1);
        assert!(policy.allowed_filesystem_paths().contains("/tmp/work"));
        assert_eq!(policy.max_source_bytes(), 10);
    }
}
