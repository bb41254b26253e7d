//! Supervisor configuration

use serde::Deserialize;
use std::time::Duration;

/// Default grace window between graceful and forced termination (milliseconds)
const DEFAULT_GRACE_MS: u64 = 2_000;

/// Default safety ceiling for any single capture (seconds)
const DEFAULT_SAFETY_CEILING_SECS: u64 = 3_600;

/// Default launch confirmation window (milliseconds)
const DEFAULT_LAUNCH_PROBE_MS: u64 = 250;

/// Default amount of engine stderr kept for diagnostics (bytes)
const DEFAULT_STDERR_LIMIT: usize = 8 * 1024;

/// Configuration for the capture supervisor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SupervisorConfig {
    /// How long a gracefully terminated engine may take to flush and exit
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Hard upper bound on any capture, whatever its own bounds say
    #[serde(default = "default_safety_ceiling_secs")]
    pub safety_ceiling_secs: u64,
    /// How long `start` watches the engine for an immediate failure
    #[serde(default = "default_launch_probe_ms")]
    pub launch_probe_ms: u64,
    /// Bytes of engine stderr kept for error reports
    #[serde(default = "default_stderr_limit")]
    pub stderr_limit: usize,
}

fn default_grace_ms() -> u64 {
    DEFAULT_GRACE_MS
}
fn default_safety_ceiling_secs() -> u64 {
    DEFAULT_SAFETY_CEILING_SECS
}
fn default_launch_probe_ms() -> u64 {
    DEFAULT_LAUNCH_PROBE_MS
}
fn default_stderr_limit() -> usize {
    DEFAULT_STDERR_LIMIT
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_ms: DEFAULT_GRACE_MS,
            safety_ceiling_secs: DEFAULT_SAFETY_CEILING_SECS,
            launch_probe_ms: DEFAULT_LAUNCH_PROBE_MS,
            stderr_limit: DEFAULT_STDERR_LIMIT,
        }
    }
}

impl SupervisorConfig {
    /// Set the grace window
    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace_ms = grace.as_millis() as u64;
        self
    }

    /// Set the safety ceiling
    pub fn with_safety_ceiling(mut self, ceiling: Duration) -> Self {
        self.safety_ceiling_secs = ceiling.as_secs().max(1);
        self
    }

    /// Set the window in which an engine exit counts as a launch failure
    pub fn with_launch_probe(mut self, probe: Duration) -> Self {
        self.launch_probe_ms = probe.as_millis() as u64;
        self
    }

    /// Grace window between SIGTERM and SIGKILL
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Launch confirmation window
    pub fn launch_probe(&self) -> Duration {
        Duration::from_millis(self.launch_probe_ms)
    }

    /// Ceiling applied to a capture with the given duration bound
    ///
    /// Never lower than the duration bound plus two grace windows, so the
    /// ceiling cannot pre-empt a correctly working duration timer.
    pub fn effective_ceiling(&self, duration: Option<Duration>) -> Duration {
        let configured = Duration::from_secs(self.safety_ceiling_secs);
        match duration {
            Some(d) => configured.max(d + self.grace_window() * 2),
            None => configured,
        }
    }
}
