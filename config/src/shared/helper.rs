use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry behavior when talking to the remote helper on the jump host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Delay before repeating a command the helper answered with "not ready".
    ///
    /// Default: 3000ms
    #[serde(default = "default_not_ready_retry_delay_ms")]
    pub not_ready_retry_delay_ms: u64,

    /// Default: 60
    #[serde(default = "default_not_ready_max_attempts")]
    pub not_ready_max_attempts: u32,

    /// Connection attempts made while the helper is still booting.
    ///
    /// Default: 30
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Default: 10000ms
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
}

fn default_not_ready_retry_delay_ms() -> u64 {
    3000
}

fn default_not_ready_max_attempts() -> u32 {
    60
}

fn default_connect_attempts() -> u32 {
    30
}

fn default_connect_retry_delay_ms() -> u64 {
    10000
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            not_ready_retry_delay_ms: default_not_ready_retry_delay_ms(),
            not_ready_max_attempts: default_not_ready_max_attempts(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
        }
    }
}

impl HelperConfig {
    pub fn not_ready_retry_delay(&self) -> Duration {
        Duration::from_millis(self.not_ready_retry_delay_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}
