use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often an asynchronous cloud work request is polled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkRequestPolling {
    /// Poll every `poll_interval_ms`.
    Fixed,
    /// Poll slowly while far from completion and faster towards the end.
    Adaptive,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkRequestConfig {
    #[serde(default = "default_polling")]
    pub polling: WorkRequestPolling,

    /// Default: 5000ms
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up waiting after this long. Unset by default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_polling() -> WorkRequestPolling {
    WorkRequestPolling::Fixed
}

fn default_poll_interval_ms() -> u64 {
    5000
}

impl Default for WorkRequestConfig {
    fn default() -> Self {
        Self {
            polling: default_polling(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: None,
        }
    }
}

impl WorkRequestConfig {
    /// Delay before the next poll given the last reported completion percentage.
    pub fn next_poll_delay(&self, percent_complete: f64) -> Duration {
        match self.polling {
            WorkRequestPolling::Fixed => Duration::from_millis(self.poll_interval_ms),
            WorkRequestPolling::Adaptive if percent_complete < 50.0 => Duration::from_secs(60),
            WorkRequestPolling::Adaptive if percent_complete < 80.0 => Duration::from_secs(30),
            WorkRequestPolling::Adaptive => Duration::from_secs(5),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_polling_speeds_up_towards_completion() {
        let config = WorkRequestConfig {
            polling: WorkRequestPolling::Adaptive,
            ..Default::default()
        };

        assert_eq!(config.next_poll_delay(10.0), Duration::from_secs(60));
        assert_eq!(config.next_poll_delay(65.0), Duration::from_secs(30));
        assert_eq!(config.next_poll_delay(95.0), Duration::from_secs(5));
    }

    #[test]
    fn fixed_polling_ignores_progress() {
        let config = WorkRequestConfig::default();

        assert_eq!(config.next_poll_delay(10.0), Duration::from_millis(5000));
        assert_eq!(config.next_poll_delay(99.0), Duration::from_millis(5000));
    }
}
