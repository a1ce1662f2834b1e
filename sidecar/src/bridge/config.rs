//! Configuration for the task bridge.

use std::time::Duration;

/// Default number of requests allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default per-request deadline (2 minutes).
///
/// Cold model loads routinely take tens of seconds on CPU backends.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default handshake deadline (30 seconds).
pub const DEFAULT_INIT_TIMEOUT_SECS: u64 = 30;

/// Configuration for [`TaskBridge`](super::TaskBridge).
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Maximum requests transmitted and awaiting a terminal response.
    pub max_concurrent: usize,

    /// Deadline applied when a call does not set its own.
    pub default_timeout: Duration,

    /// Deadline for the `init` handshake.
    pub init_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            init_timeout: Duration::from_secs(DEFAULT_INIT_TIMEOUT_SECS),
        }
    }
}

impl BridgeConfig {
    /// Set the concurrency gate. Values below 1 are raised to 1.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Set the default per-request deadline.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the handshake deadline.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }
}
