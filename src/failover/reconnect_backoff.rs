use std::cmp::min;
use std::time::Duration;

use crate::config::FailoverConfig;

/// The delay between two reconnect rounds. With exponential back-off the delay grows by the
///  configured multiplier after every failed round, capped at the maximum; a successful
///  connection resets it to the initial delay.
pub struct ReconnectBackoff {
    current: Duration,

    config_initial: Duration,
    config_max: Duration,
    config_multiplier: f64,
    config_exponential: bool,
}

impl ReconnectBackoff {
    pub fn new(config: &FailoverConfig) -> ReconnectBackoff {
        ReconnectBackoff {
            current: config.initial_reconnect_delay,
            config_initial: config.initial_reconnect_delay,
            config_max: config.max_reconnect_delay,
            config_multiplier: config.back_off_multiplier,
            config_exponential: config.use_exponential_back_off,
        }
    }

    /// Returns the delay to wait now, and advances to the delay for the next failed round
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.current;
        if self.config_exponential {
            self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.config_multiplier)
                .map_or(self.config_max, |next| min(next, self.config_max));
        }
        result
    }

    pub fn reset(&mut self) {
        self.current = self.config_initial;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[rstest]
    #[case::initial(10, 10, 30_000, 2.0, true, 10, 20)]
    #[case::later(80, 10, 30_000, 2.0, true, 80, 160)]
    #[case::capped(20_000, 10, 30_000, 2.0, true, 20_000, 30_000)]
    #[case::at_max(30_000, 10, 30_000, 2.0, true, 30_000, 30_000)]
    #[case::factor_1_5(100, 100, 1_000, 1.5, true, 100, 150)]
    #[case::factor_1(100, 100, 1_000, 1.0, true, 100, 100)]
    #[case::linear(100, 100, 1_000, 2.0, false, 100, 100)]
    #[case::huge_factor(20_000, 10, 30_000, 1e20, true, 20_000, 30_000)]
    #[case::infinite_factor(10, 10, 30_000, f64::INFINITY, true, 10, 30_000)]
    fn test_next_delay(
        #[case] current: u64,
        #[case] config_initial: u64,
        #[case] config_max: u64,
        #[case] config_multiplier: f64,
        #[case] config_exponential: bool,
        #[case] expected_delay: u64,
        #[case] expected_current: u64,
    ) {
        let mut backoff = ReconnectBackoff {
            current: ms(current),
            config_initial: ms(config_initial),
            config_max: ms(config_max),
            config_multiplier,
            config_exponential,
        };

        assert_eq!(backoff.next_delay(), ms(expected_delay));
        assert_eq!(backoff.current, ms(expected_current));
    }

    #[test]
    fn test_bounded_and_reset() {
        let mut config = FailoverConfig::new();
        config.initial_reconnect_delay = ms(10);
        config.max_reconnect_delay = ms(1_000);
        let mut backoff = ReconnectBackoff::new(&config);

        for _ in 0..50 {
            assert!(backoff.next_delay() <= ms(1_000));
        }
        assert_eq!(backoff.next_delay(), ms(1_000));

        backoff.reset();
        assert_eq!(backoff.next_delay(), ms(10));
    }
}
