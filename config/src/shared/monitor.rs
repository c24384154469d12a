use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Polling cadence of the replication channel supervisor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Delay between polls while the channel is healthy.
    ///
    /// Default: 10000ms
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    /// Delay between polls while the channel reports an error.
    ///
    /// Default: 60000ms
    #[serde(default = "default_error_update_interval_ms")]
    pub error_update_interval_ms: u64,
}

fn default_update_interval_ms() -> u64 {
    10000
}

fn default_error_update_interval_ms() -> u64 {
    60000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
            error_update_interval_ms: default_error_update_interval_ms(),
        }
    }
}

impl MonitorConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn error_update_interval(&self) -> Duration {
        Duration::from_millis(self.error_update_interval_ms)
    }
}
