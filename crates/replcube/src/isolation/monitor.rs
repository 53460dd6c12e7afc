//! Process-wide memory supervision
//!
//! Memory is sampled for the whole server process, not per unit. The check is
//! advisory: a sample that cannot be taken never counts as exceeded.

use std::time::Duration;

use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::security::SecurityPolicy;

/// Polls process memory against a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceMonitor {
    /// Ceiling in bytes, 0 disables the check
    max_bytes: u64,
    poll_interval: Duration,
}

impl ResourceMonitor {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Monitor configured from the policy's effective memory limit
    pub fn from_policy(policy: &SecurityPolicy) -> Self {
        Self::new(policy.effective_memory_limit())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn limit(&self) -> u64 {
        self.max_bytes
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Resident memory of this process in bytes, if it can be read
    pub fn current_usage() -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| process.memory())
    }

    /// Whether `usage` is above the ceiling
    pub fn exceeds(&self, usage: u64) -> bool {
        self.max_bytes > 0 && usage > self.max_bytes
    }

    /// Sample now and compare against the ceiling
    pub fn is_exceeded(&self) -> bool {
        if self.max_bytes == 0 {
            return false;
        }
        match Self::current_usage() {
            Some(usage) => self.exceeds(usage),
            None => {
                warn!("process memory usage unavailable; skipping memory check");
                false
            }
        }
    }

    /// Sample every poll interval until the ceiling is crossed or `cancel` fires
    ///
    /// Returns the offending usage, or `None` when cancelled. With no ceiling
    /// this only waits for cancellation.
    pub async fn supervise(&self, cancel: &CancellationToken) -> Option<u64> {
        if self.max_bytes == 0 {
            cancel.cancelled().await;
            return None;
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = ticker.tick() => {
                    let Some(usage) = Self::current_usage() else {
                        continue;
                    };
                    if self.exceeds(usage) {
                        debug!(usage, limit = self.max_bytes, "memory ceiling crossed");
                        return Some(usage);
                    }
                }
            }
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::unlimited()
    }
}
