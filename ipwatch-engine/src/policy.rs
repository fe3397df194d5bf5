use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing knobs of the capture loop.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PollConfig {
    /// Capture wait while a probe is in flight.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Capture wait once nothing is pending.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Pause between two passive iterations, outside the lock.
    #[serde(with = "humantime_serde")]
    pub loop_yield: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(10),
            idle_timeout: Duration::from_secs(1),
            loop_yield: Duration::from_millis(1),
        }
    }
}

/// Adaptive capture timeout.
///
/// Starts low so the first drain returns quickly, is raised to the idle value
/// after every passive iteration and lowered again when a probe begins.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PollPolicy {
    config: PollConfig,
    current: Duration,
}

impl PollPolicy {
    pub fn new(config: PollConfig) -> Self {
        Self {
            config,
            current: config.probe_timeout,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn loop_yield(&self) -> Duration {
        self.config.loop_yield
    }

    /// Returns true when the timeout changed.
    pub fn on_probe_begin(&mut self) -> bool {
        self.set(self.config.probe_timeout)
    }

    /// Returns true when the timeout changed.
    pub fn on_passive_iteration(&mut self) -> bool {
        self.set(self.config.idle_timeout)
    }

    fn set(&mut self, timeout: Duration) -> bool {
        if self.current == timeout {
            return false;
        }
        tracing::trace!("capture timeout {:?} -> {:?}", self.current, timeout);
        self.current = timeout;
        true
    }
}
