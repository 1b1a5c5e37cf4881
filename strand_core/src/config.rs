use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CHANNELS: usize = 100;
pub const DEFAULT_MAX_IDLE_PARK_MS: u64 = 50;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StrandConfig {
    /// Upper bound on simultaneously open channels in one registry.
    pub max_channels: usize,
    /// Applied to `await_promise` calls that pass no explicit timeout.
    pub default_await_timeout_ms: Option<u64>,
    /// Longest single park while the executor waits on a timer.
    pub max_idle_park_ms: u64,
}

impl Default for StrandConfig {
    fn default() -> Self {
        Self {
            max_channels: DEFAULT_MAX_CHANNELS,
            default_await_timeout_ms: None,
            max_idle_park_ms: DEFAULT_MAX_IDLE_PARK_MS,
        }
    }
}

impl StrandConfig {
    pub fn default_await_timeout(&self) -> Option<Duration> {
        self.default_await_timeout_ms.map(Duration::from_millis)
    }

    pub fn max_idle_park(&self) -> Duration {
        Duration::from_millis(self.max_idle_park_ms.max(1))
    }
}
