use std::time::Duration;

use config::shared::ExportRetryConfig;
use rand::Rng;

/// Exponential backoff with decorrelated jitter.
///
/// Each delay is drawn uniformly from `[base, previous * growth_factor]` and capped at `max`, so
/// consecutive retries of competing clients drift apart while the expected delay still grows
/// geometrically.
#[derive(Debug, Clone)]
pub struct DecorrelatedJitter {
    base: Duration,
    max: Duration,
    growth_factor: f64,
    previous: Duration,
}

impl DecorrelatedJitter {
    pub fn new(base: Duration, max: Duration, growth_factor: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            growth_factor: growth_factor.max(1.0),
            previous: base,
        }
    }

    pub fn from_config(config: &ExportRetryConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay(), config.growth_factor)
    }

    /// Returns the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let low = self.base.as_secs_f64();
        let high = (self.previous.as_secs_f64() * self.growth_factor).max(low);

        let drawn = if high > low {
            rand::thread_rng().gen_range(low..=high)
        } else {
            low
        };

        let delay = Duration::from_secs_f64(drawn).min(self.max);
        self.previous = delay;

        delay
    }

    /// Starts over from the base delay.
    pub fn reset(&mut self) {
        self.previous = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_base_and_max() {
        let mut backoff =
            DecorrelatedJitter::new(Duration::from_secs(1), Duration::from_secs(60), 2.0);

        let mut previous = Duration::from_secs(1);
        for _ in 0..200 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(60));
            assert!(delay.as_secs_f64() <= previous.as_secs_f64() * 2.0 + 1e-9);
            previous = delay;
        }
    }

    #[test]
    fn growth_factor_of_one_is_constant() {
        let mut backoff =
            DecorrelatedJitter::new(Duration::from_millis(250), Duration::from_secs(5), 1.0);

        for _ in 0..10 {
            assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        }
    }

    #[test]
    fn reset_returns_to_the_base_range() {
        let mut backoff =
            DecorrelatedJitter::new(Duration::from_secs(1), Duration::from_secs(600), 10.0);
        for _ in 0..20 {
            backoff.next_delay();
        }

        backoff.reset();

        assert!(backoff.next_delay() <= Duration::from_secs(10));
    }
}
