use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Controls how the stage graph walk polls dependencies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Lower bound for the dependency polling interval.
    ///
    /// Default: 1000ms
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,

    /// Polling interval of stages that do not declare their own.
    ///
    /// Default: 5000ms
    #[serde(default = "default_update_interval_ms")]
    pub default_update_interval_ms: u64,

    /// Upper bound on the time a stage may spend running its worker.
    ///
    /// Unset by default: stages run until they finish, fail or are cancelled.
    #[serde(default)]
    pub stage_timeout_ms: Option<u64>,

    /// Upper bound for the dependency polling interval, overriding longer intervals declared by
    /// stages.
    #[serde(default)]
    pub max_poll_interval_ms: Option<u64>,
}

fn default_min_poll_interval_ms() -> u64 {
    1000
}

fn default_update_interval_ms() -> u64 {
    5000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: default_min_poll_interval_ms(),
            default_update_interval_ms: default_update_interval_ms(),
            stage_timeout_ms: None,
            max_poll_interval_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    pub fn default_update_interval(&self) -> Duration {
        Duration::from_millis(self.default_update_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Option<Duration> {
        self.max_poll_interval_ms.map(Duration::from_millis)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }
}
