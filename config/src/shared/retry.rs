use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry behavior of the data export.
///
/// Retries sleep with decorrelated jitter: each delay is drawn uniformly
/// between `base_delay_ms` and `growth_factor` times the previous delay,
/// capped at `max_delay_ms`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportRetryConfig {
    /// Total number of export launches, including the first one.
    ///
    /// Default: 10
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Default: 1000ms
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Must be >= 1.0.
    ///
    /// Default: 2.0
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Default: 60000ms
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Also retry object storage "not found" and "not authorized" responses.
    ///
    /// These show up while a freshly created bucket or policy propagates.
    /// Default: false
    #[serde(default)]
    pub retry_on_not_found: bool,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_growth_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60000
}

impl Default for ExportRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            growth_factor: default_growth_factor(),
            max_delay_ms: default_max_delay_ms(),
            retry_on_not_found: false,
        }
    }
}

impl ExportRetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Retry behavior of cloud API calls failing with a transient error (throttling, 5xx).
///
/// Delays follow the same decorrelated jitter as [`ExportRetryConfig`]. A call is given up
/// after `max_attempts` attempts or once `max_total_ms` elapsed since its first attempt,
/// whichever comes first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudRetryConfig {
    /// Default: 10
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Default: 1000ms
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Default: 2.0
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Default: 30000ms
    #[serde(default = "default_cloud_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Default: 600000ms
    #[serde(default = "default_cloud_max_total_ms")]
    pub max_total_ms: u64,
}

fn default_cloud_max_delay_ms() -> u64 {
    30000
}

fn default_cloud_max_total_ms() -> u64 {
    600000
}

impl Default for CloudRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            growth_factor: default_growth_factor(),
            max_delay_ms: default_cloud_max_delay_ms(),
            max_total_ms: default_cloud_max_total_ms(),
        }
    }
}

impl CloudRetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_total(&self) -> Duration {
        Duration::from_millis(self.max_total_ms)
    }
}
